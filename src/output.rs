use std::path::{Path, PathBuf};

/// Locates the generated output directory inside a site root folder.
#[derive(Debug, Clone)]
pub struct OutputLocator {
    dir_name: String,
}

impl OutputLocator {
    pub fn new(dir_name: impl Into<String>) -> Self {
        Self {
            dir_name: dir_name.into(),
        }
    }

    /// Resolve `{root}/{dir_name}`, failing if it is not an existing directory.
    pub fn resolve(&self, root: &Path) -> Result<PathBuf, OutputDirectoryMissing> {
        let path = root.join(&self.dir_name);
        if path.is_dir() {
            tracing::debug!(path = %path.display(), "resolved output directory");
            Ok(path)
        } else {
            Err(OutputDirectoryMissing { path })
        }
    }
}

impl Default for OutputLocator {
    fn default() -> Self {
        Self::new("Output")
    }
}

/// The site root has no generated output to serve.
#[derive(Debug)]
pub struct OutputDirectoryMissing {
    pub path: PathBuf,
}

impl std::fmt::Display for OutputDirectoryMissing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "output directory {} not found; generate the site before previewing it",
            self.path.display()
        )
    }
}

impl std::error::Error for OutputDirectoryMissing {}
