/// Content generation step that runs before the preview server starts.
use std::path::Path;
use tokio::process::Command;

/// How the site's static output gets produced before serving.
#[derive(Debug, Clone, Default)]
pub enum Generator {
    /// Assume the output directory is already up to date.
    #[default]
    Skip,
    /// Run a command (e.g. "publish generate") with the site root as working directory.
    Command(String),
}

impl Generator {
    pub fn from_config(command: Option<&str>) -> Self {
        match command {
            Some(cmd) => Generator::Command(cmd.to_string()),
            None => Generator::Skip,
        }
    }

    pub async fn generate(&self, root: &Path) -> Result<(), GenerateError> {
        let cmd_str = match self {
            Generator::Skip => return Ok(()),
            Generator::Command(cmd) => cmd,
        };

        let parts: Vec<&str> = cmd_str.split_whitespace().collect();
        let Some((program, args)) = parts.split_first() else {
            return Err(GenerateError::EmptyCommand);
        };

        tracing::info!(command = %cmd_str, root = %root.display(), "generating site");
        let status = Command::new(program)
            .args(args)
            .current_dir(root)
            .status()
            .await
            .map_err(|e| GenerateError::Launch {
                command: cmd_str.clone(),
                source: e,
            })?;

        if !status.success() {
            return Err(GenerateError::Failed {
                command: cmd_str.clone(),
                code: status.code(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum GenerateError {
    EmptyCommand,
    Launch {
        command: String,
        source: std::io::Error,
    },
    Failed {
        command: String,
        code: Option<i32>,
    },
}

impl std::fmt::Display for GenerateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerateError::EmptyCommand => write!(f, "generate command is empty"),
            GenerateError::Launch { command, source } => {
                write!(f, "failed to run generator ({command}): {source}")
            }
            GenerateError::Failed {
                command,
                code: Some(code),
            } => write!(f, "generator ({command}) failed with exit code {code}"),
            GenerateError::Failed { command, code: None } => {
                write!(f, "generator ({command}) was killed by a signal")
            }
        }
    }
}

impl std::error::Error for GenerateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GenerateError::Launch { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_skip_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        Generator::Skip.generate(dir.path()).await.unwrap();
    }

    #[tokio::test]
    async fn test_command_runs_in_root() {
        let dir = tempfile::tempdir().unwrap();
        Generator::Command("mkdir Output".to_string())
            .generate(dir.path())
            .await
            .unwrap();
        assert!(dir.path().join("Output").is_dir());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Generator::Command("false".to_string())
            .generate(dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerateError::Failed { code: Some(1), .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Generator::Command("nonexistent-generator-xyz build".to_string())
            .generate(dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerateError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_blank_command_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Generator::from_config(Some("   "))
            .generate(dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerateError::EmptyCommand));
    }
}
