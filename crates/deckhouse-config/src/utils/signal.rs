use snafu::{ResultExt, Snafu};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::watch,
};

#[derive(Debug, Snafu)]
#[snafu(display("failed to install the {kind} signal handler"))]
pub struct SignalError {
    source: std::io::Error,
    kind: &'static str,
}

/// Fans a single shutdown event out to every task holding a handle.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    watch_rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Fires once `trigger` completes.
    pub fn new<F>(trigger: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (watch_tx, watch_rx) = watch::channel(false);

        tokio::spawn(async move {
            trigger.await;
            watch_tx.send_replace(true);
        });

        Self { watch_rx }
    }

    /// Fires on the first `SIGTERM` or `SIGINT`.
    pub fn terminate_or_interrupt() -> Result<Self, SignalError> {
        let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu { kind: "SIGTERM" })?;
        let mut sigint = signal(SignalKind::interrupt()).context(SignalSnafu { kind: "SIGINT" })?;

        Ok(Self::new(async move {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
            }
        }))
    }

    pub fn is_triggered(&self) -> bool {
        *self.watch_rx.borrow()
    }

    /// Completes once the signal fired, immediately if it already did.
    pub fn handle(&self) -> impl Future<Output = ()> + Send + use<> {
        let mut watch_rx = self.watch_rx.clone();

        async move {
            // The sender going away means nobody can trigger anymore, treat as shutdown.
            watch_rx.wait_for(|triggered| *triggered).await.ok();
        }
    }
}
