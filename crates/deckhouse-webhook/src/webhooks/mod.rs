use axum::Router;

pub use validating_webhook::ValidatingWebhook;

mod validating_webhook;

/// A webhook served by the [`WebhookServer`][crate::WebhookServer].
pub trait Webhook {
    /// Adds the routes of this webhook to `router` and returns the result.
    fn register_routes(&self, router: Router) -> Router;
}
