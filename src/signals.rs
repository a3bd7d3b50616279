/// Interrupt (SIGINT) supervision for a preview session.
///
/// Arming ignores SIGINT, then listens for it. The first interrupt runs the
/// shutdown callback, restores the default disposition and re-raises SIGINT,
/// so the process still dies the way an interrupted foreground process does.
/// Dropping or disarming the registration restores the default disposition
/// when the interrupt never came.
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Resolves when the interrupt signal is delivered.
pub type InterruptFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Platform hooks for the process-wide interrupt disposition.
pub trait InterruptPlatform: Send + Sync + 'static {
    /// Stop the interrupt from killing the process.
    fn suppress(&self) -> Result<(), SignalError>;
    /// Start listening for the interrupt.
    fn listen(&self) -> Result<InterruptFuture, SignalError>;
    /// Put the platform's default interrupt behavior back.
    fn restore_default(&self) -> Result<(), SignalError>;
    /// Deliver the interrupt to the current process again.
    fn reraise(&self) -> Result<(), SignalError>;
    /// Whether interception can be installed again after it was torn down.
    fn rearmable(&self) -> bool {
        true
    }
}

/// SIGINT on Unix, via sigaction/raise and tokio's signal driver.
pub struct UnixInterrupt;

impl InterruptPlatform for UnixInterrupt {
    fn suppress(&self) -> Result<(), SignalError> {
        set_interrupt_handler(SigHandler::SigIgn)
    }

    fn listen(&self) -> Result<InterruptFuture, SignalError> {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};

        let mut stream =
            unix_signal(SignalKind::interrupt()).map_err(|e| SignalError::Listen { source: e })?;
        Ok(Box::pin(async move {
            if stream.recv().await.is_none() {
                // Signal driver went away with the runtime; nothing will ever arrive.
                std::future::pending::<()>().await;
            }
        }))
    }

    fn restore_default(&self) -> Result<(), SignalError> {
        set_interrupt_handler(SigHandler::SigDfl)
    }

    fn reraise(&self) -> Result<(), SignalError> {
        signal::raise(Signal::SIGINT).map_err(|e| SignalError::Raise { source: e })
    }

    // tokio installs its SIGINT hook once per process and never again, so
    // after SIG_DFL is restored a second listener would never hear anything.
    fn rearmable(&self) -> bool {
        false
    }
}

fn set_interrupt_handler(handler: SigHandler) -> Result<(), SignalError> {
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    // SAFETY: SIG_IGN and SIG_DFL install no Rust code as a signal handler.
    unsafe { signal::sigaction(Signal::SIGINT, &action) }
        .map(|_| ())
        .map_err(|e| SignalError::Disposition { source: e })
}

/// Disposition state of a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmState {
    Disarmed,
    Armed,
    /// Teardown claimed, by either the interrupt handler or the registration.
    Disarming,
}

/// How a registration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disarm {
    /// Torn down without an interrupt.
    Clean,
    /// The interrupt handler ran its shutdown sequence.
    Interrupted,
}

#[derive(Debug)]
pub enum SignalError {
    /// `arm` called while a registration is still active.
    AlreadyArmed,
    /// The platform cannot intercept the interrupt a second time.
    Spent,
    Disposition { source: Errno },
    Listen { source: std::io::Error },
    Raise { source: Errno },
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::AlreadyArmed => write!(f, "interrupt handler is already installed"),
            SignalError::Spent => {
                write!(f, "interrupt handling can only be installed once per process")
            }
            SignalError::Disposition { source } => {
                write!(f, "failed to change SIGINT disposition: {source}")
            }
            SignalError::Listen { source } => write!(f, "failed to listen for SIGINT: {source}"),
            SignalError::Raise { source } => write!(f, "failed to re-raise SIGINT: {source}"),
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::AlreadyArmed | SignalError::Spent => None,
            SignalError::Disposition { source } => Some(source),
            SignalError::Listen { source } => Some(source),
            SignalError::Raise { source } => Some(source),
        }
    }
}

struct Shared<P> {
    platform: P,
    state: Mutex<ArmState>,
    armed_before: AtomicBool,
}

impl<P: InterruptPlatform> Shared<P> {
    fn lock_state(&self) -> MutexGuard<'_, ArmState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the teardown. Exactly one caller wins per arming.
    fn begin_disarm(&self) -> bool {
        let mut state = self.lock_state();
        if *state == ArmState::Armed {
            *state = ArmState::Disarming;
            true
        } else {
            false
        }
    }

    fn finish_disarm(&self) {
        if let Err(e) = self.platform.restore_default() {
            tracing::warn!(error = %e, "failed to restore default SIGINT disposition");
        }
        *self.lock_state() = ArmState::Disarmed;
    }
}

/// Owns the interrupt disposition. Clones share the same state.
pub struct SignalSupervisor<P: InterruptPlatform = UnixInterrupt> {
    shared: Arc<Shared<P>>,
}

impl<P: InterruptPlatform> Clone for SignalSupervisor<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl SignalSupervisor<UnixInterrupt> {
    /// The supervisor for this process's real SIGINT disposition.
    pub fn process() -> Self {
        static PROCESS: OnceLock<SignalSupervisor<UnixInterrupt>> = OnceLock::new();
        PROCESS
            .get_or_init(|| SignalSupervisor::new(UnixInterrupt))
            .clone()
    }
}

impl<P: InterruptPlatform> SignalSupervisor<P> {
    pub fn new(platform: P) -> Self {
        Self {
            shared: Arc::new(Shared {
                platform,
                state: Mutex::new(ArmState::Disarmed),
                armed_before: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> ArmState {
        *self.shared.lock_state()
    }

    #[cfg(test)]
    pub fn platform(&self) -> &P {
        &self.shared.platform
    }

    /// Intercept the interrupt and run `on_shutdown` the first time it arrives.
    ///
    /// Must run inside a tokio runtime. Fails with `AlreadyArmed` if a previous
    /// registration has not been torn down yet, and with `Spent` on a second
    /// arming of a platform that is not rearmable (the real SIGINT is not).
    pub fn arm<F, Fut>(&self, on_shutdown: F) -> Result<SignalRegistration<P>, SignalError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        {
            let mut state = self.shared.lock_state();
            if *state != ArmState::Disarmed {
                return Err(SignalError::AlreadyArmed);
            }
            let armed_before = self.shared.armed_before.swap(true, Ordering::SeqCst);
            if armed_before && !self.shared.platform.rearmable() {
                return Err(SignalError::Spent);
            }
            *state = ArmState::Armed;
        }

        let platform = &self.shared.platform;
        let interrupt = match platform.suppress().and_then(|()| platform.listen()) {
            Ok(interrupt) => interrupt,
            Err(e) => {
                self.shared.finish_disarm();
                return Err(e);
            }
        };

        let (done_tx, done_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let handler = tokio::spawn(async move {
            // Consumes the listener, so a second interrupt finds nobody waiting.
            interrupt.await;
            if !shared.begin_disarm() {
                return;
            }

            tracing::warn!(
                "interrupt received, stopping server; further interrupts are ignored until it exits"
            );
            on_shutdown().await;
            shared.finish_disarm();
            tracing::debug!("re-raising SIGINT with default disposition");
            if let Err(e) = shared.platform.reraise() {
                tracing::error!(error = %e, "failed to re-raise interrupt");
            }
            done_tx.send_replace(true);
        });

        tracing::debug!("interrupt handler armed");
        Ok(SignalRegistration {
            shared: Arc::clone(&self.shared),
            handler: Some(handler),
            done: done_rx,
        })
    }
}

/// An active interception of the interrupt signal.
///
/// Teardown happens once: through the interrupt handler, `disarm`, or drop,
/// whichever claims it first.
pub struct SignalRegistration<P: InterruptPlatform = UnixInterrupt> {
    shared: Arc<Shared<P>>,
    handler: Option<JoinHandle<()>>,
    done: watch::Receiver<bool>,
}

impl<P: InterruptPlatform> SignalRegistration<P> {
    /// Resolves once the interrupt handler has finished its shutdown sequence.
    pub async fn interrupted(&mut self) {
        let _ = self.done.wait_for(|done| *done).await;
    }

    /// Tear down the registration, or wait for the interrupt handler if it
    /// already claimed the teardown.
    pub async fn disarm(mut self) -> Disarm {
        let handler = self.handler.take();
        if self.shared.begin_disarm() {
            if let Some(handler) = handler {
                handler.abort();
            }
            self.shared.finish_disarm();
            tracing::debug!("interrupt handler disarmed");
            return Disarm::Clean;
        }

        if let Some(handler) = handler {
            if handler.await.is_err() {
                self.shared.finish_disarm();
            }
        }
        Disarm::Interrupted
    }
}

impl<P: InterruptPlatform> Drop for SignalRegistration<P> {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            if self.shared.begin_disarm() {
                handler.abort();
                self.shared.finish_disarm();
                tracing::debug!("interrupt handler dropped");
            }
        }
    }
}
