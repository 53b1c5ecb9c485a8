//! Message model (§3). Generalizes the teacher's `ServiceBusMessage` /
//! `ReceivedMessage` / `BrokerProperties` split — which was shaped around a
//! JSON REST payload — into the AMQP-flavored system-properties block the
//! spec describes, keyed on an opaque lock token rather than a REST lock URI.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{Result, ServiceBusError};

const MAX_ID_LEN: usize = 128;

/// A scalar value in the user-property bag (§3).
#[derive(Debug, Clone, PartialEq)]
pub enum UserPropertyValue {
    String(String),
    I64(i64),
    I32(i32),
    F64(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

/// Opaque 16-byte lock token, scoped to the receiver that produced it (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(pub [u8; 16]);

impl LockToken {
    pub fn new_random() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0))
    }
}

/// User-constructed, pre-send message. Broker-owned fields live in
/// `SystemProperties` and only appear on `ReceivedMessage`.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub body: Bytes,
    pub properties: HashMap<String, UserPropertyValue>,
    message_id: Option<String>,
    session_id: Option<String>,
    partition_key: Option<String>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    reply_to_session_id: Option<String>,
    to: Option<String>,
    label: Option<String>,
    content_type: Option<String>,
    time_to_live: Option<Duration>,
    scheduled_enqueue_time: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// §9 "Message-ID validation": `None` is allowed (the broker assigns a
    /// generated id); `Some("")` is rejected. Length is capped at 128 chars.
    pub fn set_message_id(&mut self, id: Option<String>) -> Result<()> {
        if let Some(ref id) = id {
            if id.is_empty() {
                return Err(ServiceBusError::argument("message_id must not be empty"));
            }
            if id.chars().count() > MAX_ID_LEN {
                return Err(ServiceBusError::argument("message_id exceeds 128 characters"));
            }
        }
        self.message_id = id;
        Ok(())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn set_session_id(&mut self, id: Option<String>) -> Result<()> {
        Self::validate_short_id(&id, "session_id")?;
        self.session_id = id;
        Ok(())
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn set_partition_key(&mut self, key: Option<String>) -> Result<()> {
        Self::validate_short_id(&key, "partition_key")?;
        self.partition_key = key;
        Ok(())
    }

    fn validate_short_id(value: &Option<String>, field: &str) -> Result<()> {
        if let Some(v) = value {
            if v.chars().count() > MAX_ID_LEN {
                return Err(ServiceBusError::argument(format!(
                    "{field} exceeds {MAX_ID_LEN} characters"
                )));
            }
        }
        Ok(())
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }
    pub fn set_correlation_id(&mut self, v: Option<String>) {
        self.correlation_id = v;
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }
    pub fn set_reply_to(&mut self, v: Option<String>) {
        self.reply_to = v;
    }

    pub fn reply_to_session_id(&self) -> Option<&str> {
        self.reply_to_session_id.as_deref()
    }
    pub fn set_reply_to_session_id(&mut self, v: Option<String>) {
        self.reply_to_session_id = v;
    }

    pub fn to(&self) -> Option<&str> {
        self.to.as_deref()
    }
    pub fn set_to(&mut self, v: Option<String>) {
        self.to = v;
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
    pub fn set_label(&mut self, v: Option<String>) {
        self.label = v;
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }
    pub fn set_content_type(&mut self, v: Option<String>) {
        self.content_type = v;
    }

    pub fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live
    }

    /// §3: `time_to_live` must be positive; absent means the entity default.
    pub fn set_time_to_live(&mut self, ttl: Option<Duration>) -> Result<()> {
        if let Some(d) = ttl {
            if d.is_zero() {
                return Err(ServiceBusError::argument("time_to_live must be positive"));
            }
        }
        self.time_to_live = ttl;
        Ok(())
    }

    pub fn scheduled_enqueue_time(&self) -> Option<DateTime<Utc>> {
        self.scheduled_enqueue_time
    }
    pub fn set_scheduled_enqueue_time(&mut self, v: Option<DateTime<Utc>>) {
        self.scheduled_enqueue_time = v;
    }
}

/// Broker-owned fields, present only once a message has actually been
/// delivered (§3 invariant: `is_received ⇔ sequence_number >= 0`).
#[derive(Debug, Clone)]
pub struct SystemProperties {
    pub sequence_number: i64,
    pub enqueued_sequence_number: i64,
    pub enqueued_time: Option<DateTime<Utc>>,
    pub delivery_count: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub dead_letter_source: Option<String>,
}

impl Default for SystemProperties {
    /// "Not received" state: `sequence_number == -1`.
    fn default() -> Self {
        Self {
            sequence_number: -1,
            enqueued_sequence_number: -1,
            enqueued_time: None,
            delivery_count: 0,
            locked_until: None,
            dead_letter_source: None,
        }
    }
}

impl SystemProperties {
    pub fn is_received(&self) -> bool {
        self.sequence_number >= 0
    }
}

/// A delivered message. `lock_token` is present iff delivered in peek-lock
/// mode. A lock token is only ever valid on the receiver that issued it
/// (§3) — enforced by `Receiver` tracking its own outstanding tokens rather
/// than by anything carried on the message itself.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: Message,
    pub system: SystemProperties,
    pub lock_token: Option<LockToken>,
}

impl ReceivedMessage {
    pub fn is_received(&self) -> bool {
        self.system.is_received()
    }

    /// §3: reading delivery-count/locked-until/lock-token on a message that
    /// was never actually received is a programming error — we surface it
    /// as a `Result` rather than panicking (Design Note §9).
    pub fn delivery_count(&self) -> Result<u32> {
        self.require_received()?;
        Ok(self.system.delivery_count)
    }

    pub fn locked_until(&self) -> Result<Option<DateTime<Utc>>> {
        self.require_received()?;
        Ok(self.system.locked_until)
    }

    pub fn lock_token(&self) -> Result<LockToken> {
        self.require_received()?;
        self.lock_token
            .ok_or_else(|| ServiceBusError::invalid_operation("not delivered in peek-lock mode"))
    }

    fn require_received(&self) -> Result<()> {
        if !self.is_received() {
            return Err(ServiceBusError::invalid_operation(
                "message was never received",
            ));
        }
        Ok(())
    }

    /// Strips broker-owned system properties back to "not received", ready
    /// to be handed to `Sender::send` (§4.3, §8 round-trip property). This
    /// is the only supported way to resend a message a receiver handed you.
    pub fn clone_for_resend(&self) -> Message {
        self.message.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_rejects_empty_but_allows_none() {
        let mut m = Message::new(Bytes::from_static(b"x"));
        assert!(m.set_message_id(None).is_ok());
        assert!(m.set_message_id(Some(String::new())).is_err());
        assert!(m.set_message_id(Some("abc".into())).is_ok());
        assert_eq!(m.message_id(), Some("abc"));
    }

    #[test]
    fn message_id_rejects_too_long() {
        let mut m = Message::new(Bytes::new());
        let long = "a".repeat(129);
        assert!(m.set_message_id(Some(long)).is_err());
    }

    #[test]
    fn time_to_live_must_be_positive() {
        let mut m = Message::new(Bytes::new());
        assert!(m.set_time_to_live(Some(Duration::from_secs(0))).is_err());
        assert!(m.set_time_to_live(Some(Duration::from_secs(1))).is_ok());
    }

    #[test]
    fn not_received_accessors_fail() {
        let msg = ReceivedMessage {
            message: Message::new(Bytes::new()),
            system: SystemProperties::default(),
            lock_token: None,
        };
        assert!(!msg.is_received());
        assert!(msg.delivery_count().is_err());
        assert!(msg.lock_token().is_err());
    }

    #[test]
    fn received_accessors_succeed() {
        let msg = ReceivedMessage {
            message: Message::new(Bytes::new()),
            system: SystemProperties {
                sequence_number: 5,
                delivery_count: 1,
                ..SystemProperties::default()
            },
            lock_token: Some(LockToken::new_random()),
        };
        assert!(msg.is_received());
        assert_eq!(msg.delivery_count().unwrap(), 1);
        assert!(msg.lock_token().is_ok());
    }

    #[test]
    fn clone_for_resend_drops_system_properties() {
        let mut message = Message::new(Bytes::from_static(b"hi"));
        message.set_message_id(Some("id-1".into())).unwrap();
        let received = ReceivedMessage {
            message: message.clone(),
            system: SystemProperties {
                sequence_number: 10,
                delivery_count: 3,
                ..SystemProperties::default()
            },
            lock_token: Some(LockToken::new_random()),
        };
        let resent = received.clone_for_resend();
        assert_eq!(resent.message_id(), Some("id-1"));
        assert_eq!(resent.body, message.body);
    }
}
