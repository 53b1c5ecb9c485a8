pub mod message;
pub mod rule;
pub mod session;

pub use message::{LockToken, Message, ReceivedMessage, SystemProperties, UserPropertyValue};
pub use rule::{wire as rule_wire, Action, Filter, RuleDescription, RuleSet};
pub use session::SessionState;

/// Receive mode (§3). In `ReceiveAndDelete` the broker removes the message
/// on delivery and settlement operations are rejected client-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    PeekLock,
    ReceiveAndDelete,
}
