//! TLS termination in front of an Axum [`Router`].
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{Router, extract::Request};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::{conn::auto::Builder, graceful::GracefulShutdown},
};
use snafu::{ResultExt, Snafu};
use tokio::net::TcpListener;
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        crypto::ring::default_provider,
        version::{TLS12, TLS13},
    },
};
use tower::ServiceExt;
use tracing::{Instrument, instrument};

use crate::options::WebhookOptions;

pub use cert_resolver::{CertificateResolver, CertificateResolverError};

mod cert_resolver;

pub type Result<T, E = TlsServerError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum TlsServerError {
    #[snafu(display("failed to load the webhook certificate"))]
    LoadCertificate { source: CertificateResolverError },

    #[snafu(display("failed to create TCP listener by binding to socket address {socket_addr:?}"))]
    BindTcpListener {
        source: std::io::Error,
        socket_addr: SocketAddr,
    },

    #[snafu(display("failed to set safe TLS protocol versions"))]
    SetSafeTlsProtocolVersions { source: tokio_rustls::rustls::Error },
}

/// Accepts TLS connections only and serves each of them with the router.
pub struct TlsServer {
    config: ServerConfig,
    cert_resolver: Arc<CertificateResolver>,
    reload_interval: Duration,

    socket_addr: SocketAddr,
    router: Router,
}

impl TlsServer {
    /// Loads the certificate named in `options` and prepares the TLS config.
    #[instrument(name = "create_tls_server", skip(router))]
    pub fn new(router: Router, options: &WebhookOptions) -> Result<Self> {
        let cert_resolver = Arc::new(
            CertificateResolver::new(&options.tls_cert_path, &options.tls_key_path)
                .context(LoadCertificateSnafu)?,
        );

        let mut config = ServerConfig::builder_with_provider(default_provider().into())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .context(SetSafeTlsProtocolVersionsSnafu)?
            .with_no_client_auth()
            .with_cert_resolver(cert_resolver.clone());
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Self {
            config,
            cert_resolver,
            reload_interval: options.certificate_reload_interval,
            socket_addr: options.socket_addr,
            router,
        })
    }

    /// Serves until `shutdown` completes. New connections are refused from
    /// then on, open connections are drained before returning.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let tls_acceptor = TlsAcceptor::from(Arc::new(self.config));
        let tcp_listener = TcpListener::bind(self.socket_addr)
            .await
            .context(BindTcpListenerSnafu {
                socket_addr: self.socket_addr,
            })?;
        tracing::info!(address = %self.socket_addr, "webhook server listening");

        let reload = tokio::spawn(reload_certificate_loop(
            self.cert_resolver,
            self.reload_interval,
        ));
        let graceful = GracefulShutdown::new();

        tokio::pin!(shutdown);
        loop {
            let (tcp_stream, remote_addr) = tokio::select! {
                () = &mut shutdown => break,
                accepted = tcp_listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::trace!(%err, "failed to accept incoming TCP connection");
                        continue;
                    }
                },
            };

            let tls_acceptor = tls_acceptor.clone();
            let router = self.router.clone();
            let watcher = graceful.watcher();

            let span = tracing::debug_span!("serve connection", %remote_addr);
            tokio::spawn(
                async move {
                    let tls_stream = match tls_acceptor.accept(tcp_stream).await {
                        Ok(tls_stream) => TokioIo::new(tls_stream),
                        Err(err) => {
                            tracing::debug!(%err, "error during TLS handshake");
                            return;
                        }
                    };

                    // Hyper has its own `Service` trait, bridge to the tower one of the router.
                    let hyper_service = service_fn(move |request: Request<Incoming>| {
                        router.clone().oneshot(request)
                    });

                    let builder = Builder::new(TokioExecutor::new());
                    let connection =
                        builder.serve_connection_with_upgrades(tls_stream, hyper_service);
                    if let Err(err) = watcher.watch(connection).await {
                        tracing::warn!(%err, "failed to serve connection");
                    }
                }
                .instrument(span),
            );
        }

        reload.abort();
        tracing::info!("webhook server stopped accepting connections, draining");
        graceful.shutdown().await;

        Ok(())
    }
}

async fn reload_certificate_loop(cert_resolver: Arc<CertificateResolver>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    // The first tick fires immediately, the certificate was just loaded.
    interval.tick().await;

    loop {
        interval.tick().await;

        match cert_resolver.reload() {
            Ok(true) => tracing::info!("reloaded rotated webhook certificate"),
            Ok(false) => {}
            Err(error) => tracing::warn!(
                error = &error as &dyn std::error::Error,
                "failed to reload webhook certificate, keeping the current one"
            ),
        }
    }
}
