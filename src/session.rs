/// Preview session: generate the site, serve its output directory until the
/// user presses Enter (or closes stdin) or hits Ctrl-C, and never leave the
/// server process behind.
use crate::config::{ConfigError, PreviewConfig};
use crate::failure::ServerError;
use crate::generate::{GenerateError, Generator};
use crate::output::{OutputDirectoryMissing, OutputLocator};
use crate::server::{ServerCommand, ServerProcess};
use crate::signals::{Disarm, InterruptPlatform, SignalError, SignalSupervisor, UnixInterrupt};
use std::io::BufRead;
use std::time::Duration;
use tokio::sync::oneshot;

/// Session lifecycle, written to the log on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Generating,
    ServerStarting,
    Serving,
    ShuttingDown,
    Done,
}

/// Why a session that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// A line (or end of input) arrived on the foreground input.
    Input,
    /// The interrupt handler stopped the server and re-raised the signal,
    /// but the process survived the re-raise.
    Interrupted,
}

/// Errors that end a preview session.
#[derive(Debug)]
pub enum PreviewError {
    Config(ConfigError),
    Generate(GenerateError),
    Output(OutputDirectoryMissing),
    Signal(SignalError),
    Server(ServerError),
    /// Failed to start the foreground input reader.
    Input { source: std::io::Error },
}

impl std::fmt::Display for PreviewError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreviewError::Config(e) => write!(f, "{e}"),
            PreviewError::Generate(e) => write!(f, "{e}"),
            PreviewError::Output(e) => write!(f, "{e}"),
            PreviewError::Signal(e) => write!(f, "{e}"),
            PreviewError::Server(e) => write!(f, "{e}"),
            PreviewError::Input { source } => {
                write!(f, "failed to start input reader: {source}")
            }
        }
    }
}

impl std::error::Error for PreviewError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PreviewError::Config(e) => Some(e),
            PreviewError::Generate(e) => Some(e),
            PreviewError::Output(e) => Some(e),
            PreviewError::Signal(e) => Some(e),
            PreviewError::Server(e) => Some(e),
            PreviewError::Input { source } => Some(source),
        }
    }
}

impl From<ConfigError> for PreviewError {
    fn from(e: ConfigError) -> Self {
        PreviewError::Config(e)
    }
}

impl From<GenerateError> for PreviewError {
    fn from(e: GenerateError) -> Self {
        PreviewError::Generate(e)
    }
}

impl From<OutputDirectoryMissing> for PreviewError {
    fn from(e: OutputDirectoryMissing) -> Self {
        PreviewError::Output(e)
    }
}

impl From<SignalError> for PreviewError {
    fn from(e: SignalError) -> Self {
        PreviewError::Signal(e)
    }
}

impl From<ServerError> for PreviewError {
    fn from(e: ServerError) -> Self {
        PreviewError::Server(e)
    }
}

/// What woke the foreground up.
#[derive(Debug)]
enum Trigger {
    Input,
    ServerExit(Result<(), ServerError>),
    Interrupt,
}

/// One interactive preview run.
pub struct PreviewSession<P: InterruptPlatform = UnixInterrupt> {
    config: PreviewConfig,
    command: ServerCommand,
    generator: Generator,
    locator: OutputLocator,
    grace_period: Duration,
    supervisor: SignalSupervisor<P>,
    state: SessionState,
    server: Option<ServerProcess>,
}

impl PreviewSession<UnixInterrupt> {
    pub fn new(config: PreviewConfig) -> Self {
        Self::with_supervisor(config, SignalSupervisor::process())
    }
}

impl<P: InterruptPlatform> PreviewSession<P> {
    pub fn with_supervisor(config: PreviewConfig, supervisor: SignalSupervisor<P>) -> Self {
        Self {
            config,
            command: ServerCommand::default(),
            generator: Generator::default(),
            locator: OutputLocator::default(),
            grace_period: Duration::from_secs(5),
            supervisor,
            state: SessionState::Idle,
            server: None,
        }
    }

    pub fn command(mut self, command: ServerCommand) -> Self {
        self.command = command;
        self
    }

    pub fn generator(mut self, generator: Generator) -> Self {
        self.generator = generator;
        self
    }

    pub fn output_locator(mut self, locator: OutputLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    #[allow(dead_code)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The server handle, once the session got far enough to create one.
    #[allow(dead_code)]
    pub fn server(&self) -> Option<&ServerProcess> {
        self.server.as_ref()
    }

    #[cfg(test)]
    pub fn supervisor(&self) -> &SignalSupervisor<P> {
        &self.supervisor
    }

    fn enter(&mut self, next: SessionState) {
        tracing::debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Run the session to completion, reading the stop line from `input`.
    ///
    /// When this returns, the server has been stopped and reaped and the
    /// interrupt disposition is back to the platform default.
    pub async fn run<R>(&mut self, input: R) -> Result<SessionEnd, PreviewError>
    where
        R: BufRead + Send + 'static,
    {
        self.enter(SessionState::Generating);
        let result = self.serve(input).await;
        self.enter(SessionState::Done);
        result
    }

    async fn serve<R>(&mut self, input: R) -> Result<SessionEnd, PreviewError>
    where
        R: BufRead + Send + 'static,
    {
        self.generator.generate(self.config.root()).await?;
        let directory = self.locator.resolve(self.config.root())?;

        self.enter(SessionState::ServerStarting);
        let port = self.config.port();
        let mut input = spawn_input_reader(input)?;

        let server = ServerProcess::new(
            self.command.clone(),
            directory,
            port,
            self.grace_period,
        );
        self.server = Some(server.clone());

        let on_interrupt = {
            let server = server.clone();
            move || async move { server.terminate().await }
        };
        let mut registration = match self.supervisor.arm(on_interrupt) {
            Ok(registration) => registration,
            Err(e) => {
                server.terminate().await;
                return Err(e.into());
            }
        };

        println!(
            "🌍 Starting web server at http://localhost:{port}\n\n\
             Press CTRL+C (or ENTER) to stop the server and exit"
        );
        tracing::info!(
            port = server.port(),
            command = %self.command.command_line(port),
            dir = %server.directory().display(),
            "serving"
        );

        let mut server_task = tokio::spawn({
            let server = server.clone();
            async move { server.start().await }
        });
        self.enter(SessionState::Serving);

        let trigger = tokio::select! {
            line = &mut input => {
                match line {
                    Ok(Some(line)) => tracing::debug!(line = line.trim_end(), "input received"),
                    Ok(None) => tracing::debug!("end of input"),
                    Err(_) => tracing::debug!("input reader went away"),
                }
                Trigger::Input
            }
            joined = &mut server_task => Trigger::ServerExit(flatten(joined)),
            () = registration.interrupted() => Trigger::Interrupt,
        };
        tracing::debug!(?trigger, pid = ?server.pid(), "shutting down");

        self.enter(SessionState::ShuttingDown);
        server.terminate().await;
        let outcome = match trigger {
            Trigger::ServerExit(outcome) => outcome,
            Trigger::Input | Trigger::Interrupt => flatten(server_task.await),
        };

        let disarm = registration.disarm().await;
        tracing::debug!(
            server = ?server.state(),
            interrupt = ?self.supervisor.state(),
            ?disarm,
            "shutdown complete"
        );
        if disarm == Disarm::Interrupted {
            return Ok(SessionEnd::Interrupted);
        }
        outcome?;
        Ok(SessionEnd::Input)
    }
}

fn flatten(
    joined: Result<Result<(), ServerError>, tokio::task::JoinError>,
) -> Result<(), ServerError> {
    joined.unwrap_or_else(|e| {
        Err(ServerError::Failed {
            message: format!("server task failed: {e}"),
        })
    })
}

/// Read one line on a dedicated thread so a blocked stdin never holds up the runtime.
///
/// Resolves to `None` on end of input or a read error.
fn spawn_input_reader<R>(mut input: R) -> Result<oneshot::Receiver<Option<String>>, PreviewError>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("preview-input".to_string())
        .spawn(move || {
            let mut line = String::new();
            let read = match input.read_line(&mut line) {
                Ok(0) => None,
                Ok(_) => Some(line),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read input");
                    None
                }
            };
            let _ = tx.send(read);
        })
        .map_err(|e| PreviewError::Input { source: e })?;
    Ok(rx)
}
