//! The two concurrency engines (§4.5, §4.6): a message pump over a plain
//! `Receiver` and a session pump that layers session accept/renew/FIFO on
//! top of it. Both share the exception-sink vocabulary and callback types
//! defined here.

pub mod message_pump;
pub mod session_pump;

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::cancel::CancellationToken;
use crate::error::{Result, ServiceBusError};
use crate::model::ReceivedMessage;

pub use message_pump::{MessagePump, MessagePumpOptions};
pub use session_pump::{SessionPump, SessionPumpOptions};

/// Which stage of the per-message lifecycle an `ExceptionEvent` came from
/// (§4.5, §4.6, §7). Callers use this to decide what, if anything, to log
/// or alert on — the pump itself has already taken the corresponding
/// corrective action (or deliberately not taken one, e.g. no abandon after
/// a lock-lost completion).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpAction {
    Receive,
    UserCallback,
    Complete,
    Abandon,
    RenewLock,
    AcceptMessageSession,
}

/// Reported to the exception sink for every failure the pump observes on
/// its own background tasks — nothing here is ever raised back to the
/// caller of `start`/`stop` (§4.5).
#[derive(Debug, Clone)]
pub struct ExceptionEvent {
    pub error: ServiceBusError,
    pub action: PumpAction,
}

/// The user's per-message (or per-session-message) handler. Takes the
/// delivered message and the pump's own cancellation token, so a long
/// callback can notice a `stop()` in progress and wind down early.
pub type UserCallback =
    Arc<dyn Fn(ReceivedMessage, CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Sink for out-of-band failures the pump cannot propagate synchronously.
pub type ExceptionSink = Arc<dyn Fn(ExceptionEvent) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) async fn report(sink: &ExceptionSink, error: ServiceBusError, action: PumpAction) {
    tracing::warn!(?action, kind = ?error.kind(), message = %error.message, "pump exception");
    (sink)(ExceptionEvent { error, action }).await;
}
