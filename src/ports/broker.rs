use crate::{
    core::{actions::message::ActionMessage, errors::RuntimeResult},
    ports::component::Component,
};

/// Outbound half of a broker link.
///
/// `publish` hands the message to the link's bounded queue and returns
/// without waiting for the wire; a full queue fails with `PublishFailed`.
/// Inbound messages are dispatched by the link itself to the shared handler
/// table it was built with.
pub trait ActionBroker: Component {
    fn broker_type(&self) -> &'static str;

    fn publish(&self, message: ActionMessage) -> RuntimeResult<()>;

    /// Number of messages waiting in the outbound queue.
    fn queued(&self) -> usize;
}
