//! In-memory `ReceiverLink`/`SenderLink`/`ManagementLink` implementations
//! used by every pump/receiver/sender test (§8). Nothing here talks to a
//! network or a real broker — this is the load-bearing test tooling
//! SPEC_FULL.md calls out as a supplement the distillation's non-goals
//! didn't rule out.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::link::{
    ManagementBody, ManagementLink, ManagementResponse, RawDelivery, ReceiverLink, SenderLink,
    SettlementOutcome,
};
use crate::model::message::{LockToken, Message, ReceivedMessage, SystemProperties};

pub fn raw_delivery(body: &[u8], sequence_number: i64) -> RawDelivery {
    RawDelivery {
        body: Bytes::copy_from_slice(body),
        properties: HashMap::new(),
        message_id: None,
        session_id: None,
        partition_key: None,
        correlation_id: None,
        reply_to: None,
        reply_to_session_id: None,
        to: None,
        label: None,
        content_type: None,
        time_to_live: None,
        scheduled_enqueue_time: None,
        sequence_number,
        enqueued_sequence_number: sequence_number,
        enqueued_time: Some(Utc::now()),
        delivery_count: 1,
        locked_until: Some(Utc::now() + chrono::Duration::seconds(30)),
        lock_token: Some(LockToken::new_random()),
        dead_letter_source: None,
    }
}

pub fn raw_delivery_for_session(body: &[u8], sequence_number: i64, session_id: &str) -> RawDelivery {
    let mut raw = raw_delivery(body, sequence_number);
    raw.session_id = Some(session_id.to_string());
    raw
}

pub fn received_message(body: &[u8], session_id: Option<&str>) -> ReceivedMessage {
    let mut message = Message::new(Bytes::copy_from_slice(body));
    if let Some(sid) = session_id {
        message.set_session_id(Some(sid.to_string())).unwrap();
    }
    received_message_from(message, 1)
}

pub fn received_message_from(message: Message, sequence_number: i64) -> ReceivedMessage {
    ReceivedMessage {
        message,
        system: SystemProperties {
            sequence_number,
            ..SystemProperties::default()
        },
        lock_token: Some(LockToken::new_random()),
    }
}

/// A `ReceiverLink` backed by a plain in-memory queue. Internals use a
/// synchronous `std::sync::Mutex` rather than the async `tokio::sync::Mutex`
/// the real receiver uses — a mock never holds the lock across an await
/// point, so tests can call `enqueue` without going through an executor.
pub struct MockReceiverLink {
    queue: StdMutex<VecDeque<RawDelivery>>,
    credit: AtomicU32,
    settled: StdMutex<Vec<(LockToken, SettlementOutcome)>>,
    closed: AtomicBool,
    /// Lock tokens that should report `message_lock_lost` on the next
    /// `settle` call — used to simulate the broker reclaiming a lock mid
    /// user-callback (§8 scenario 3).
    revoked: StdMutex<std::collections::HashSet<LockToken>>,
}

impl Default for MockReceiverLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockReceiverLink {
    pub fn new() -> Self {
        Self {
            queue: StdMutex::new(VecDeque::new()),
            credit: AtomicU32::new(0),
            settled: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            revoked: StdMutex::new(std::collections::HashSet::new()),
        }
    }

    pub fn enqueue(&self, delivery: RawDelivery) {
        self.queue.lock().unwrap().push_back(delivery);
    }

    pub fn revoke(&self, lock_token: LockToken) {
        self.revoked.lock().unwrap().insert(lock_token);
    }

    pub fn settled(&self) -> Vec<(LockToken, SettlementOutcome)> {
        self.settled.lock().unwrap().clone()
    }

    pub fn credit_count(&self) -> u32 {
        self.credit.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReceiverLink for MockReceiverLink {
    async fn receive(&self, max_count: u32, wait_time: Duration) -> Result<Vec<RawDelivery>> {
        let mut out = Vec::new();
        {
            let mut queue = self.queue.lock().unwrap();
            while out.len() < max_count as usize {
                match queue.pop_front() {
                    Some(d) => out.push(d),
                    None => break,
                }
            }
        }
        if out.is_empty() && !wait_time.is_zero() {
            tokio::time::sleep(wait_time.min(Duration::from_millis(20))).await;
        }
        Ok(out)
    }

    async fn settle(&self, lock_token: LockToken, outcome: SettlementOutcome) -> Result<()> {
        if self.revoked.lock().unwrap().contains(&lock_token) {
            return Err(crate::error::ServiceBusError::message_lock_lost());
        }
        self.settled.lock().unwrap().push((lock_token, outcome));
        Ok(())
    }

    async fn credit(&self, count: u32) -> Result<()> {
        self.credit.fetch_add(count, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A `SenderLink` that records every send.
pub struct MockSenderLink {
    pub sent: Mutex<Vec<Vec<u8>>>,
    pub max_size: usize,
    closed: AtomicBool,
}

impl MockSenderLink {
    pub fn new(max_size: usize) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            max_size,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SenderLink for MockSenderLink {
    async fn send(&self, encoded: Vec<u8>) -> Result<()> {
        self.sent.lock().await.push(encoded);
        Ok(())
    }

    fn max_message_size(&self) -> usize {
        self.max_size
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A `ManagementLink` with per-operation response queues and sane defaults
/// for every operation named in §6, so tests only need to override what
/// they care about.
pub struct MockManagementLink {
    queues: Mutex<HashMap<&'static str, VecDeque<ManagementResponse>>>,
    calls: Mutex<HashMap<&'static str, u32>>,
    renew_count: AtomicU32,
}

impl Default for MockManagementLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockManagementLink {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            renew_count: AtomicU32::new(0),
        }
    }

    pub async fn queue_response(&self, operation: &'static str, response: ManagementResponse) {
        self.queues
            .lock()
            .await
            .entry(operation)
            .or_default()
            .push_back(response);
    }

    pub async fn call_count(&self, operation: &'static str) -> u32 {
        *self.calls.lock().await.get(operation).unwrap_or(&0)
    }
}

#[async_trait]
impl ManagementLink for MockManagementLink {
    async fn call(&self, operation: &'static str, _body: ManagementBody) -> Result<ManagementResponse> {
        *self.calls.lock().await.entry(operation).or_insert(0) += 1;

        if let Some(queue) = self.queues.lock().await.get_mut(operation) {
            if let Some(response) = queue.pop_front() {
                return Ok(response);
            }
        }

        use crate::link::operations::*;
        Ok(match operation {
            RENEW_LOCK | RENEW_SESSION_LOCK => {
                let n = self.renew_count.fetch_add(1, Ordering::SeqCst);
                let locked_until: DateTime<Utc> =
                    Utc::now() + chrono::Duration::seconds(30 * (n as i64 + 1));
                ManagementResponse {
                    status: 200,
                    body: ManagementBody::Json(serde_json::json!({
                        "locked-until": locked_until.to_rfc3339(),
                    })),
                }
            }
            GET_SESSION_STATE => ManagementResponse {
                status: 204,
                body: ManagementBody::Empty,
            },
            SET_SESSION_STATE | ADD_RULE | REMOVE_RULE => ManagementResponse {
                status: 200,
                body: ManagementBody::Empty,
            },
            PEEK_MESSAGE | RECEIVE_BY_SEQUENCE_NUMBER | ENUMERATE_RULES => ManagementResponse {
                status: 204,
                body: ManagementBody::Empty,
            },
            SCHEDULE_MESSAGE => ManagementResponse {
                status: 200,
                body: ManagementBody::Json(serde_json::json!({ "sequence-number": 1 })),
            },
            CANCEL_SCHEDULED_MESSAGE => ManagementResponse {
                status: 200,
                body: ManagementBody::Empty,
            },
            _ => ManagementResponse {
                status: 204,
                body: ManagementBody::Empty,
            },
        })
    }
}

pub fn mock_management() -> Arc<dyn ManagementLink> {
    Arc::new(MockManagementLink::new())
}
