//! Violation events and the bounded in-memory store.

pub mod event;
pub mod sink;
pub mod store;

pub use event::{encode_command, ViolationEvent, ViolationKind};
pub use sink::ViolationSink;
pub use store::{SandboxViolationStore, Subscription, MAX_VIOLATIONS};
