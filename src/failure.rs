/// Server failure classification: turn a dead server's stderr into a user-facing error.
///
/// Port conflicts are recognised by signature:
/// - Python: a line starting with `Traceback` plus `Address already in use`
/// - Node-style servers: `EADDRINUSE`
use regex::Regex;
use std::process::ExitStatus;
use std::sync::LazyLock;

/// Compiled signatures that each identify a port-in-use failure when all match.
static PORT_IN_USE_SIGNATURES: LazyLock<Vec<Vec<Regex>>> = LazyLock::new(|| {
    vec![
        vec![
            Regex::new(r"(?m)^Traceback").unwrap(),
            Regex::new(r"Address already in use").unwrap(),
        ],
        vec![Regex::new(r"\bEADDRINUSE\b").unwrap()],
    ]
});

/// Errors reported by the server process handle.
#[derive(Debug)]
pub enum ServerError {
    /// Another process is already listening on the configured port.
    PortInUse { port: u16 },
    /// The server exited on its own; carries its raw error text.
    Failed { message: String },
    /// The server command could not be launched at all.
    Launch {
        program: String,
        source: std::io::Error,
    },
    /// Waiting on the server process failed.
    Wait { source: std::io::Error },
    /// `start` was called on a handle that already launched its process.
    AlreadyStarted,
}

impl ServerError {
    /// Classify the exit of a server that stopped without being asked to.
    pub fn classify(stderr: &str, status: ExitStatus, port: u16) -> Self {
        if is_port_conflict(stderr) {
            tracing::debug!(port, "port conflict signature matched");
            return ServerError::PortInUse { port };
        }

        let trimmed = stderr.trim_end();
        if trimmed.trim().is_empty() {
            ServerError::Failed {
                message: format!("server exited unexpectedly ({status})"),
            }
        } else {
            ServerError::Failed {
                message: trimmed.to_string(),
            }
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::PortInUse { port } => write!(
                f,
                "A localhost server is already running on port number {port}.\n\
                 - Perhaps another preview session is running?\n\
                 - The server runs as a separate process, so to find it you can use\n  \
                 'lsof -i :{port}' or the 'ps' command. You can then terminate the\n  \
                 previous process in order to start a new one."
            ),
            ServerError::Failed { message } => write!(f, "{message}"),
            ServerError::Launch { program, source } => {
                write!(f, "failed to launch server command '{program}': {source}")
            }
            ServerError::Wait { source } => {
                write!(f, "failed to wait for server process: {source}")
            }
            ServerError::AlreadyStarted => write!(f, "server process was already started"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Launch { source, .. } => Some(source),
            ServerError::Wait { source } => Some(source),
            _ => None,
        }
    }
}

/// Check server error text for a known "address already in use" signature.
fn is_port_conflict(stderr: &str) -> bool {
    PORT_IN_USE_SIGNATURES
        .iter()
        .any(|signature| signature.iter().all(|pattern| pattern.is_match(stderr)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    const PYTHON_TRACEBACK: &str = "Traceback (most recent call last):\n  \
        File \"/usr/lib/python3.11/http/server.py\", line 1307, in <module>\n    \
        test(\n\
        OSError: [Errno 98] Address already in use\n";

    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    #[test]
    fn test_python_traceback_is_port_conflict() {
        let err = ServerError::classify(PYTHON_TRACEBACK, exited(1), 8000);
        assert!(matches!(err, ServerError::PortInUse { port: 8000 }));
    }

    #[test]
    fn test_port_conflict_message_names_port_not_traceback() {
        let message = ServerError::classify(PYTHON_TRACEBACK, exited(1), 8000).to_string();
        assert!(message.contains("8000"));
        assert!(message.contains("another preview session"));
        assert!(!message.contains("Traceback"));
        assert!(!message.contains("Errno 98"));
    }

    #[test]
    fn test_traceback_on_later_line_still_matches() {
        let text = format!("Serving HTTP on :: port 8000\n{PYTHON_TRACEBACK}");
        assert!(is_port_conflict(&text));
    }

    #[test]
    fn test_address_in_use_without_traceback_is_generic() {
        let err = ServerError::classify("bind: Address already in use\n", exited(1), 8000);
        match err {
            ServerError::Failed { message } => {
                assert_eq!(message, "bind: Address already in use")
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn test_other_traceback_is_generic() {
        let text = "Traceback (most recent call last):\nPermissionError: [Errno 13]\n";
        let err = ServerError::classify(text, exited(1), 80);
        assert!(matches!(err, ServerError::Failed { .. }));
        assert!(err.to_string().contains("PermissionError"));
    }

    #[test]
    fn test_node_eaddrinuse_is_port_conflict() {
        let text = "Error: listen EADDRINUSE: address already in use :::3000\n";
        let err = ServerError::classify(text, exited(1), 3000);
        assert!(matches!(err, ServerError::PortInUse { port: 3000 }));
    }

    #[test]
    fn test_empty_stderr_reports_status() {
        let err = ServerError::classify("  \n", exited(3), 8000);
        let message = err.to_string();
        assert!(message.contains("server exited unexpectedly"));
        assert!(message.contains('3'));
    }

    #[test]
    fn test_launch_error_has_source() {
        let err = ServerError::Launch {
            program: "python3".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("python3"));
    }
}
