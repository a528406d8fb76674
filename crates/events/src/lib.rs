//! Bus-level contracts shared by every dispatch component.
//!
//! - `envelope`: the routed unit of communication (`Envelope`, `Delivery`)
//! - `bus`: the `MessageBus` abstraction (publish / consume / ack / nack)
//! - `handler`: the consumer-side seam (`EnvelopeHandler`)
//! - `contracts`: well-known routing keys, queues and their bindings
//! - `frames`: messages exchanged with live client connections
//! - `in_memory_bus`: single-process bus for tests and local development

pub mod bus;
pub mod contracts;
pub mod envelope;
pub mod frames;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{BusError, ConsumerHandle, MessageBus};
pub use contracts::{QueueBinding, TOPOLOGY};
pub use envelope::{Delivery, Envelope};
pub use frames::{DriverMessage, OutboundFrame};
pub use handler::{EnvelopeHandler, HandlerError, handler_fn};
pub use in_memory_bus::{DeadLetter, InMemoryMessageBus};
