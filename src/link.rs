//! The boundary this crate stops at (§1, §6): wire codec, AMQP framing, and
//! link establishment are out of scope. These traits model "an opaque
//! bidirectional channel with credit-based flow control" — a transport
//! crate implements them against a real AMQP 1.0 stack; everything on this
//! side (receiver, sender, session acceptor, both pumps) is driven purely
//! through them, which is what makes the pumps testable without a broker.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{LockToken, UserPropertyValue};

/// One undecoded delivery off the wire: the link has not yet separated body
/// from system properties into this crate's `Message`/`SystemProperties` —
/// that decoding happens in `Receiver`.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub body: Bytes,
    pub properties: std::collections::HashMap<String, UserPropertyValue>,
    pub message_id: Option<String>,
    pub session_id: Option<String>,
    pub partition_key: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_session_id: Option<String>,
    pub to: Option<String>,
    pub label: Option<String>,
    pub content_type: Option<String>,
    pub time_to_live: Option<Duration>,
    pub scheduled_enqueue_time: Option<DateTime<Utc>>,
    pub sequence_number: i64,
    pub enqueued_sequence_number: i64,
    pub enqueued_time: Option<DateTime<Utc>>,
    pub delivery_count: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub lock_token: Option<LockToken>,
    pub dead_letter_source: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    Complete,
    Abandon,
    Defer,
    DeadLetter {
        reason: Option<String>,
        description: Option<String>,
    },
}

/// One receive link bound to an entity path or an accepted session (§4.2).
#[async_trait]
pub trait ReceiverLink: Send + Sync {
    /// Waits up to `wait_time` for at least one delivery, returning whatever
    /// the link's local buffer had (possibly empty) once credit is granted
    /// or the wait elapses (§4.2 prefetch, §8 boundary behaviors).
    async fn receive(&self, max_count: u32, wait_time: Duration) -> Result<Vec<RawDelivery>>;

    async fn settle(&self, lock_token: LockToken, outcome: SettlementOutcome) -> Result<()>;

    /// Grants additional link credit; called at open (prefetch) and after
    /// every settle to replenish it (§4.2).
    async fn credit(&self, count: u32) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// One send link (§4.3).
#[async_trait]
pub trait SenderLink: Send + Sync {
    async fn send(&self, encoded: Vec<u8>) -> Result<()>;

    /// Negotiated maximum message size for this link.
    fn max_message_size(&self) -> usize;

    async fn close(&self) -> Result<()>;
}

/// The request/response management link carrying peek, renew-lock,
/// receive-by-sequence, schedule, session state get/set, and rule add/
/// remove/enumerate operations (§4.2, §6).
#[derive(Debug, Clone)]
pub enum ManagementBody {
    Empty,
    Json(serde_json::Value),
}

#[derive(Debug, Clone)]
pub struct ManagementResponse {
    pub status: u16,
    pub body: ManagementBody,
}

#[async_trait]
pub trait ManagementLink: Send + Sync {
    /// `operation` is one of the `com.microsoft:*` operation names (§6).
    /// Every call carries a fresh correlation id internally; that's the
    /// transport's concern, not the caller's.
    async fn call(&self, operation: &'static str, body: ManagementBody) -> Result<ManagementResponse>;
}

pub mod operations {
    pub const PEEK_MESSAGE: &str = "com.microsoft:peek-message";
    pub const RENEW_LOCK: &str = "com.microsoft:renew-lock";
    pub const RECEIVE_BY_SEQUENCE_NUMBER: &str = "com.microsoft:receive-by-sequence-number";
    pub const SCHEDULE_MESSAGE: &str = "com.microsoft:schedule-message";
    pub const CANCEL_SCHEDULED_MESSAGE: &str = "com.microsoft:cancel-scheduled-message";
    pub const GET_SESSION_STATE: &str = "com.microsoft:get-session-state";
    pub const SET_SESSION_STATE: &str = "com.microsoft:set-session-state";
    pub const RENEW_SESSION_LOCK: &str = "com.microsoft:renew-session-lock";
    pub const ADD_RULE: &str = "com.microsoft:add-rule";
    pub const REMOVE_RULE: &str = "com.microsoft:remove-rule";
    pub const ENUMERATE_RULES: &str = "com.microsoft:enumerate-rules";
}

/// Requests the broker hand out the next available (or named) session
/// (§4.4). Implemented by the transport as a receiver-link open carrying a
/// broker-side session filter.
#[async_trait]
pub trait SessionAcceptorLink: Send + Sync {
    async fn accept_any(&self, wait_time: Duration) -> Result<Option<AcceptedSession>>;
    async fn accept_named(
        &self,
        session_id: &str,
        wait_time: Duration,
    ) -> Result<Option<AcceptedSession>>;
}

pub struct AcceptedSession {
    pub session_id: String,
    pub locked_until: DateTime<Utc>,
    pub receiver: std::sync::Arc<dyn ReceiverLink>,
    pub management: std::sync::Arc<dyn ManagementLink>,
}
