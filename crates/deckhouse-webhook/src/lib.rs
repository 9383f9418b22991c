//! HTTPS server hosting the Deckhouse admission webhooks.
//!
//! Routes are registered through the [`Webhook`] trait, most of the time by
//! [`ValidatingWebhook`] instances. Every server additionally answers
//! `/health`, terminates TLS with a certificate read from disk and reloads it
//! when the files change.
//!
//! ```no_run
//! # async fn serve() -> deckhouse_webhook::Result<()> {
//! use axum::Router;
//! use deckhouse_webhook::{WebhookOptions, WebhookServer};
//!
//! let options = WebhookOptions::builder().bind_port(9651).build();
//! let server = WebhookServer::new(Router::new(), vec![], &options)?;
//! server.run(std::future::pending()).await
//! # }
//! ```
use axum::{Router, routing::get};
use snafu::{ResultExt, Snafu};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::tls::TlsServer;

pub mod constants;
pub mod options;
pub mod tls;
pub mod webhooks;

// Selected re-exports
pub use crate::{
    options::WebhookOptions,
    webhooks::{ValidatingWebhook, Webhook},
};

/// A result type alias with the [`WebhookError`] type as the default error type.
pub type Result<T, E = WebhookError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum WebhookError {
    #[snafu(display("failed to create TLS server"))]
    CreateTlsServer { source: tls::TlsServerError },

    #[snafu(display("failed to run TLS server"))]
    RunTlsServer { source: tls::TlsServerError },
}

/// A ready-to-use webhook server.
pub struct WebhookServer {
    tls_server: TlsServer,
}

impl WebhookServer {
    /// Creates the server from `router`, the routes of all `webhooks` and
    /// `/health`. The certificate is loaded here so that a missing secret
    /// fails startup instead of the first handshake.
    pub fn new(
        router: Router,
        webhooks: Vec<Box<dyn Webhook + Send>>,
        options: &WebhookOptions,
    ) -> Result<Self> {
        tracing::debug!(?options, "create webhook server");

        let router = Self::router(router, &webhooks);
        let tls_server = TlsServer::new(router, options).context(CreateTlsServerSnafu)?;

        Ok(Self { tls_server })
    }

    /// Merges the webhook routes into `router`, traces them and adds
    /// `/health` below the trace layer so probes stay out of the logs.
    pub fn router(router: Router, webhooks: &[Box<dyn Webhook + Send>]) -> Router {
        let router = webhooks
            .iter()
            .fold(router, |router, webhook| webhook.register_routes(router));

        let service_builder = ServiceBuilder::new().layer(TraceLayer::new_for_http());
        router
            .layer(service_builder)
            .route("/health", get(|| async { "ok" }))
    }

    /// Serves until `shutdown` completes, then drains open connections.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tracing::debug!("run webhook server");
        self.tls_server
            .run(shutdown)
            .await
            .context(RunTlsServerSnafu)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::core::admission::{AdmissionRequest, AdmissionResponse};
    use rstest::rstest;
    use tower::ServiceExt;

    use super::*;

    fn router() -> Router {
        let webhook = ValidatingWebhook::new(
            "/validate/core/v1/configmap",
            |_: Arc<()>, request: AdmissionRequest<ConfigMap>| async move {
                AdmissionResponse::from(&request)
            },
            Arc::new(()),
        );
        let metrics = Router::new().route("/metrics", get(|| async { "# metrics" }));

        let webhooks: Vec<Box<dyn Webhook + Send>> = vec![Box::new(webhook)];
        WebhookServer::router(metrics, &webhooks)
    }

    async fn get_path(path: &str) -> (StatusCode, String) {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri(path)
                    .body(Body::empty())
                    .expect("valid request"),
            )
            .await
            .expect("router is infallible");

        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body is readable");
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[rstest]
    #[case::health("/health", StatusCode::OK, "ok")]
    #[case::extra_routes_are_kept("/metrics", StatusCode::OK, "# metrics")]
    #[case::unknown("/unknown", StatusCode::NOT_FOUND, "")]
    #[tokio::test]
    async fn routes(#[case] path: &str, #[case] status: StatusCode, #[case] body: &str) {
        assert_eq!(get_path(path).await, (status, body.to_owned()));
    }

    #[tokio::test]
    async fn webhook_routes_only_accept_post() {
        let (status, _) = get_path("/validate/core/v1/configmap").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn missing_certificate_fails_startup() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let options = WebhookOptions::builder()
            .tls_paths(dir.path().join("tls.crt"), dir.path().join("tls.key"))
            .build();

        assert!(matches!(
            WebhookServer::new(Router::new(), vec![], &options),
            Err(WebhookError::CreateTlsServer { .. })
        ));
    }
}
