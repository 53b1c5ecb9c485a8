//! The receiver (§4.2): one receive link + one request/response link to one
//! entity (or one accepted session). Exposes settlement, peek, renewal,
//! and management operations; this is the collaborator both pumps (§4.5,
//! §4.6) drive.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{from_status_code, Result, ServiceBusError, ServiceBusErrorKind};
use crate::link::{
    operations, ManagementBody, ManagementLink, ManagementResponse, RawDelivery, ReceiverLink,
    SettlementOutcome,
};
use crate::model::message::{LockToken, Message, ReceivedMessage, SystemProperties};
use crate::model::ReceiveMode;
use crate::plugin::PluginPipeline;
use crate::retry::{self, RetryPolicy, ServerBusyLatch, DEFAULT_OPERATION_TIMEOUT};

/// Per-link state machine (§4.2): faults transition to `Faulted`; the next
/// operation attempts one re-open if the cause was transient, else surfaces
/// the fault as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Opening,
    Open,
    Closing,
    Faulted,
}

pub struct Receiver {
    link: Arc<dyn ReceiverLink>,
    management: Arc<dyn ManagementLink>,
    mode: ReceiveMode,
    prefetch_count: u32,
    buffer: Mutex<VecDeque<ReceivedMessage>>,
    outstanding: Mutex<HashSet<LockToken>>,
    peek_cursor: AtomicI64,
    state: Mutex<LinkState>,
    handler_attached: AtomicBool,
    retry_policy: Arc<dyn RetryPolicy>,
    busy_latch: ServerBusyLatch,
    plugins: Arc<PluginPipeline>,
}

impl Receiver {
    pub async fn new(
        link: Arc<dyn ReceiverLink>,
        management: Arc<dyn ManagementLink>,
        mode: ReceiveMode,
        prefetch_count: u32,
        retry_policy: Arc<dyn RetryPolicy>,
        busy_latch: ServerBusyLatch,
        plugins: Arc<PluginPipeline>,
    ) -> Result<Self> {
        let receiver = Self {
            link,
            management,
            mode,
            prefetch_count,
            buffer: Mutex::new(VecDeque::new()),
            outstanding: Mutex::new(HashSet::new()),
            peek_cursor: AtomicI64::new(0),
            state: Mutex::new(LinkState::Opening),
            handler_attached: AtomicBool::new(false),
            retry_policy,
            busy_latch,
            plugins,
        };
        receiver.link.credit(prefetch_count.max(1)).await?;
        *receiver.state.lock().await = LinkState::Open;
        Ok(receiver)
    }

    pub fn mode(&self) -> ReceiveMode {
        self.mode
    }

    /// §4.5 registration invariant: at most one registered handler per
    /// receiver lifetime.
    pub fn try_attach_handler(&self) -> Result<()> {
        if self
            .handler_attached
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ServiceBusError::invalid_operation(
                "a handler is already registered on this receiver",
            ));
        }
        Ok(())
    }

    async fn ensure_open(&self) -> Result<()> {
        let state = *self.state.lock().await;
        if state == LinkState::Faulted {
            return Err(ServiceBusError::new(
                ServiceBusErrorKind::Transport,
                "receiver link is faulted",
            ));
        }
        Ok(())
    }

    fn decode(&self, raw: RawDelivery) -> ReceivedMessage {
        let mut message = Message::new(raw.body);
        let _ = message.set_message_id(raw.message_id);
        let _ = message.set_session_id(raw.session_id);
        let _ = message.set_partition_key(raw.partition_key);
        message.set_correlation_id(raw.correlation_id);
        message.set_reply_to(raw.reply_to);
        message.set_reply_to_session_id(raw.reply_to_session_id);
        message.set_to(raw.to);
        message.set_label(raw.label);
        message.set_content_type(raw.content_type);
        let _ = message.set_time_to_live(raw.time_to_live);
        message.set_scheduled_enqueue_time(raw.scheduled_enqueue_time);
        message.properties = raw.properties;

        let lock_token = match self.mode {
            ReceiveMode::PeekLock => raw.lock_token,
            ReceiveMode::ReceiveAndDelete => None,
        };

        ReceivedMessage {
            message,
            system: SystemProperties {
                sequence_number: raw.sequence_number,
                enqueued_sequence_number: raw.enqueued_sequence_number,
                enqueued_time: raw.enqueued_time,
                delivery_count: raw.delivery_count,
                locked_until: raw.locked_until,
                dead_letter_source: raw.dead_letter_source,
            },
            lock_token,
        }
    }

    /// §4.2 "while the local buffer has >=1 message, `receive` returns
    /// immediately; otherwise it waits up to `wait_time` for credit."
    pub async fn receive(
        &self,
        max_count: u32,
        wait_time: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        self.ensure_open().await?;
        let mut out = Vec::new();

        {
            let mut buffer = self.buffer.lock().await;
            while out.len() < max_count as usize {
                match buffer.pop_front() {
                    Some(m) => out.push(m),
                    None => break,
                }
            }
        }

        if !out.is_empty() {
            return self.run_after_receive(out).await;
        }

        let remaining = max_count as usize - out.len();
        let raw = retry::run_operation(
            self.retry_policy.as_ref(),
            &self.busy_latch,
            DEFAULT_OPERATION_TIMEOUT,
            || self.link.receive(remaining as u32, wait_time),
        )
        .await?;

        // The link is free to hand back more than `remaining` (§4.2 prefetch);
        // every decoded message's token is registered here, whether or not it
        // ends up in `out` for this call, so a later settle on a
        // still-buffered message doesn't spuriously see it as unowned.
        {
            let mut buffer = self.buffer.lock().await;
            let mut outstanding = self.outstanding.lock().await;
            for r in raw {
                let message = self.decode(r);
                if let Some(token) = message.lock_token {
                    outstanding.insert(token);
                }
                buffer.push_back(message);
            }
        }

        let mut buffer = self.buffer.lock().await;
        while out.len() < max_count as usize {
            match buffer.pop_front() {
                Some(m) => out.push(m),
                None => break,
            }
        }
        drop(buffer);

        self.run_after_receive(out).await
    }

    async fn run_after_receive(&self, messages: Vec<ReceivedMessage>) -> Result<Vec<ReceivedMessage>> {
        let mut out = Vec::with_capacity(messages.len());
        for m in messages {
            out.push(self.plugins.run_after_receive(m).await?);
        }
        Ok(out)
    }

    pub async fn receive_by_sequence(&self, seq_numbers: &[i64]) -> Result<Vec<ReceivedMessage>> {
        self.ensure_open().await?;
        let body = ManagementBody::Json(serde_json::json!({ "sequence-numbers": seq_numbers }));
        let response = self
            .call_management(operations::RECEIVE_BY_SEQUENCE_NUMBER, body)
            .await?;
        self.messages_from_response(response)
    }

    /// Routes a management-link call through the retry policy and the
    /// shared server-busy latch (§4.1, §4.2).
    async fn call_management(
        &self,
        operation: &'static str,
        body: ManagementBody,
    ) -> Result<ManagementResponse> {
        retry::call_management(
            self.management.as_ref(),
            self.retry_policy.as_ref(),
            &self.busy_latch,
            operation,
            body,
        )
        .await
    }

    fn messages_from_response(&self, response: ManagementResponse) -> Result<Vec<ReceivedMessage>> {
        match response.status {
            200 => match response.body {
                ManagementBody::Json(value) => {
                    let raws: Vec<RawDelivery> = serde_json::from_value(value).map_err(|e| {
                        ServiceBusError::new(ServiceBusErrorKind::InternalError, e.to_string())
                    })?;
                    Ok(raws.into_iter().map(|r| self.decode(r)).collect())
                }
                ManagementBody::Empty => Ok(Vec::new()),
            },
            204 => Ok(Vec::new()),
            status => Err(from_status_code(status, "management call failed")),
        }
    }

    fn require_peek_lock(&self) -> Result<()> {
        if self.mode != ReceiveMode::PeekLock {
            return Err(ServiceBusError::invalid_operation(
                "settlement requires peek-lock receive mode",
            ));
        }
        Ok(())
    }

    async fn require_owned_token(&self, lock_token: LockToken) -> Result<()> {
        let mut outstanding = self.outstanding.lock().await;
        if !outstanding.remove(&lock_token) {
            return Err(ServiceBusError::message_lock_lost());
        }
        Ok(())
    }

    async fn settle(&self, lock_token: LockToken, outcome: SettlementOutcome) -> Result<()> {
        let result = retry::run_operation(
            self.retry_policy.as_ref(),
            &self.busy_latch,
            DEFAULT_OPERATION_TIMEOUT,
            || self.link.settle(lock_token, outcome.clone()),
        )
        .await;
        if result.is_ok() {
            let _ = self.link.credit(1).await;
        }
        result
    }

    pub async fn complete(&self, lock_token: LockToken) -> Result<()> {
        self.require_peek_lock()?;
        self.require_owned_token(lock_token).await?;
        self.settle(lock_token, SettlementOutcome::Complete).await
    }

    pub async fn abandon(&self, lock_token: LockToken) -> Result<()> {
        self.require_peek_lock()?;
        self.require_owned_token(lock_token).await?;
        self.settle(lock_token, SettlementOutcome::Abandon).await
    }

    pub async fn defer(&self, lock_token: LockToken) -> Result<()> {
        self.require_peek_lock()?;
        self.require_owned_token(lock_token).await?;
        self.settle(lock_token, SettlementOutcome::Defer).await
    }

    pub async fn dead_letter(
        &self,
        lock_token: LockToken,
        reason: Option<String>,
        description: Option<String>,
    ) -> Result<()> {
        self.require_peek_lock()?;
        self.require_owned_token(lock_token).await?;
        self.settle(lock_token, SettlementOutcome::DeadLetter { reason, description })
            .await
    }

    pub async fn renew_lock(&self, lock_token: LockToken) -> Result<DateTime<Utc>> {
        self.require_peek_lock()?;
        let body = ManagementBody::Json(serde_json::json!({ "lock-token": lock_token.to_string() }));
        let response = self.call_management(operations::RENEW_LOCK, body).await?;
        match response.status {
            200 => match response.body {
                ManagementBody::Json(value) => {
                    let locked_until: DateTime<Utc> = value
                        .get("locked-until")
                        .and_then(|v| v.as_str())
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .map(|dt| dt.with_timezone(&Utc))
                        .ok_or_else(|| {
                            ServiceBusError::new(
                                ServiceBusErrorKind::InternalError,
                                "renew-lock response missing locked-until",
                            )
                        })?;
                    Ok(locked_until)
                }
                ManagementBody::Empty => Err(ServiceBusError::new(
                    ServiceBusErrorKind::InternalError,
                    "renew-lock response had no body",
                )),
            },
            410 => Err(ServiceBusError::message_lock_lost()),
            status => Err(from_status_code(status, "renew-lock failed")),
        }
    }

    /// Does not change visibility; advances a client-local cursor (§4.2).
    pub async fn peek(&self, from_sequence: Option<i64>, count: u32) -> Result<Vec<ReceivedMessage>> {
        let start = from_sequence.unwrap_or_else(|| self.peek_cursor.load(Ordering::SeqCst));
        let body = ManagementBody::Json(serde_json::json!({
            "from-sequence-number": start,
            "message-count": count,
        }));
        let response = self.call_management(operations::PEEK_MESSAGE, body).await?;
        let messages = self.messages_from_response(response)?;
        if let Some(last) = messages.last() {
            self.peek_cursor
                .store(last.system.sequence_number + 1, Ordering::SeqCst);
        }
        Ok(messages)
    }

    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state == LinkState::Closed {
            return Ok(());
        }
        *state = LinkState::Closing;
        let result = self.link.close().await;
        *state = LinkState::Closed;
        result
    }

    pub async fn is_closed(&self) -> bool {
        *self.state.lock().await == LinkState::Closed
    }

    pub fn retry_policy(&self) -> &dyn RetryPolicy {
        self.retry_policy.as_ref()
    }

    pub fn busy_latch(&self) -> &ServerBusyLatch {
        &self.busy_latch
    }
}

/// Session-scoped management operations (§4.4, §6): get/set session state,
/// renew the session lock. Kept separate from `Receiver` because they only
/// apply once a receiver is bound to an accepted session.
pub struct SessionReceiver {
    pub receiver: Receiver,
    pub session_id: String,
    management: Arc<dyn ManagementLink>,
    locked_until: Mutex<DateTime<Utc>>,
}

impl SessionReceiver {
    pub fn new(
        receiver: Receiver,
        session_id: String,
        management: Arc<dyn ManagementLink>,
        locked_until: DateTime<Utc>,
    ) -> Self {
        Self {
            receiver,
            session_id,
            management,
            locked_until: Mutex::new(locked_until),
        }
    }

    pub async fn locked_until(&self) -> DateTime<Utc> {
        *self.locked_until.lock().await
    }

    async fn call_management(&self, operation: &'static str, body: ManagementBody) -> Result<ManagementResponse> {
        retry::call_management(
            self.management.as_ref(),
            self.receiver.retry_policy(),
            self.receiver.busy_latch(),
            operation,
            body,
        )
        .await
    }

    pub async fn get_state(&self) -> Result<Option<bytes::Bytes>> {
        let body = ManagementBody::Json(serde_json::json!({ "session-id": self.session_id }));
        let response = self.call_management(operations::GET_SESSION_STATE, body).await?;
        match response.status {
            200 => match response.body {
                ManagementBody::Json(value) => {
                    let state = value.get("session-state").and_then(|v| v.as_str());
                    Ok(state.map(|s| bytes::Bytes::from(s.as_bytes().to_vec())))
                }
                ManagementBody::Empty => Ok(None),
            },
            204 => Ok(None),
            status => Err(from_status_code(status, "get-session-state failed")),
        }
    }

    pub async fn set_state(&self, state: Option<bytes::Bytes>) -> Result<()> {
        if let Some(ref bytes) = state {
            if bytes.len() > crate::model::session::MAX_SESSION_STATE_BYTES {
                return Err(ServiceBusError::argument("session state exceeds 256 KiB"));
            }
        }
        let body = ManagementBody::Json(serde_json::json!({
            "session-id": self.session_id,
            "session-state": state.map(|b| String::from_utf8_lossy(&b).to_string()),
        }));
        let response = self.call_management(operations::SET_SESSION_STATE, body).await?;
        match response.status {
            200 | 204 => Ok(()),
            status => Err(from_status_code(status, "set-session-state failed")),
        }
    }

    pub async fn renew_session_lock(&self) -> Result<DateTime<Utc>> {
        let body = ManagementBody::Json(serde_json::json!({ "session-id": self.session_id }));
        let response = self.call_management(operations::RENEW_SESSION_LOCK, body).await?;
        let new_locked_until = match response.status {
            200 => match response.body {
                ManagementBody::Json(value) => value
                    .get("locked-until")
                    .and_then(|v| v.as_str())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok_or_else(|| {
                        ServiceBusError::new(
                            ServiceBusErrorKind::InternalError,
                            "renew-session-lock response missing locked-until",
                        )
                    }),
                ManagementBody::Empty => Err(ServiceBusError::new(
                    ServiceBusErrorKind::InternalError,
                    "renew-session-lock response had no body",
                )),
            },
            410 => Err(ServiceBusError::session_lock_lost()),
            status => Err(from_status_code(status, "renew-session-lock failed")),
        }?;
        *self.locked_until.lock().await = new_locked_until;
        Ok(new_locked_until)
    }
}
