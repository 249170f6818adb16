//! Event system: local handlers, broker link fan-out and webhooks.
pub mod dispatcher;
pub mod message;
pub mod webhooks;

pub use dispatcher::EventDispatcher;
pub use message::{ActionHandler, ActionMessage, HandlerReport, HandlerTable, handler, run_handlers};
pub use webhooks::{WebhookRegistry, WebhookSubscription};
