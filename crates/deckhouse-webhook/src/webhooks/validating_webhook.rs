use std::{fmt::Debug, marker::PhantomData, sync::Arc};

use axum::{Json, Router, routing::post};
use kube::{
    Resource,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
};
use serde::{Serialize, de::DeserializeOwned};

use super::Webhook;

/// Validating webhook, which intercepts creations, updates and deletions of
/// one resource kind and allows or denies them.
///
/// As the webhook is typed with the Resource type `R`, it can only handle a
/// single kind. Register one [`ValidatingWebhook`] per kind.
pub struct ValidatingWebhook<H, S, R> {
    http_path: String,
    handler: H,
    handler_state: Arc<S>,
    _resource: PhantomData<R>,
}

impl<H, S, R> ValidatingWebhook<H, S, R> {
    pub fn new(http_path: impl Into<String>, handler: H, handler_state: Arc<S>) -> Self {
        Self {
            http_path: http_path.into(),
            handler,
            handler_state,
            _resource: PhantomData,
        }
    }

    pub fn http_path(&self) -> &str {
        &self.http_path
    }
}

impl<H, S, R> Debug for ValidatingWebhook<H, S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatingWebhook")
            .field("http_path", &self.http_path)
            .finish_non_exhaustive()
    }
}

impl<H, S, R, Fut> Webhook for ValidatingWebhook<H, S, R>
where
    H: Fn(Arc<S>, AdmissionRequest<R>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = AdmissionResponse> + Send + 'static,
    R: Resource + Send + Sync + DeserializeOwned + Serialize + 'static,
    S: Send + Sync + 'static,
{
    fn register_routes(&self, router: Router) -> Router {
        let handler_state = self.handler_state.clone();
        let handler = self.handler.clone();
        let handler_fn = |Json(review): Json<AdmissionReview<R>>| async move {
            let request: AdmissionRequest<R> = match review.try_into() {
                Ok(request) => request,
                Err(err) => {
                    return Json(
                        AdmissionResponse::invalid(format!("failed to convert to request: {err}"))
                            .into_review(),
                    );
                }
            };

            tracing::debug!(
                operation = ?request.operation,
                name = %request.name,
                "handling admission request"
            );
            let response = handler(handler_state, request).await;
            if !response.allowed {
                tracing::info!(
                    message = %response.result.message,
                    "admission request denied"
                );
            }
            Json(response.into_review())
        };

        router.route(&self.http_path, post(handler_fn))
    }
}
