//! Core concurrency engines and data model for a cloud message broker
//! client (queues, topics/subscriptions, session pumps).
//!
//! This crate stops at the link boundary (§1, §6): wire codec, AMQP
//! framing, and link establishment belong to a transport crate that
//! implements [`link::ReceiverLink`], [`link::SenderLink`],
//! [`link::ManagementLink`] and [`link::SessionAcceptorLink`]. Everything
//! above that boundary — the retry policy, the receiver/sender, the
//! session acceptor, the plugin pipeline, the message/session/rule model,
//! and above all the two pump engines in [`pump`] — is implemented here
//! and is fully testable against the in-memory mocks in `testutil`
//! without a broker.

pub mod auth;
pub mod cancel;
pub mod error;
pub mod link;
pub mod model;
pub mod plugin;
pub mod pump;
pub mod receiver;
pub mod retry;
pub mod rule_manager;
pub mod sender;
pub mod session_acceptor;

#[cfg(test)]
pub(crate) mod testutil;

pub use auth::{AccessToken, AuthMode, ConnectionConfig, TokenProvider, TransportType};
pub use cancel::CancellationToken;
pub use error::{Result, ServiceBusError, ServiceBusErrorKind};
pub use model::{
    Action, Filter, LockToken, Message, ReceiveMode, ReceivedMessage, RuleDescription, RuleSet,
    SessionState, SystemProperties, UserPropertyValue,
};
pub use plugin::{Plugin, PluginPipeline};
pub use pump::{
    ExceptionEvent, MessagePump, MessagePumpOptions, PumpAction, SessionPump, SessionPumpOptions,
};
pub use receiver::{Receiver, SessionReceiver};
pub use retry::{ExponentialRetryPolicy, RetryPolicy, ServerBusyLatch};
pub use rule_manager::RuleManager;
pub use sender::Sender;
pub use session_acceptor::SessionAcceptor;
