//! The sender (§4.3): one send link, exposing send/schedule/cancel-schedule.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{from_status_code, Result, ServiceBusError};
use crate::link::{operations, ManagementBody, ManagementLink, SenderLink};
use crate::model::Message;
use crate::plugin::PluginPipeline;
use crate::retry::{self, RetryPolicy, ServerBusyLatch, DEFAULT_OPERATION_TIMEOUT};

/// A minimal wire-agnostic encoding of a message for size accounting and for
/// handing to `SenderLink::send`. The real encoding (AMQP 1.0) lives in the
/// transport crate; this crate only needs an encoded length to enforce the
/// max-message-size check (§4.3) and a byte payload to forward.
fn encode(message: &Message) -> Vec<u8> {
    serde_json::to_vec(&EncodedMessage::from(message)).unwrap_or_default()
}

#[derive(serde::Serialize)]
struct EncodedMessage {
    body: Vec<u8>,
    message_id: Option<String>,
    session_id: Option<String>,
}

impl From<&Message> for EncodedMessage {
    fn from(m: &Message) -> Self {
        Self {
            body: m.body.to_vec(),
            message_id: m.message_id().map(str::to_string),
            session_id: m.session_id().map(str::to_string),
        }
    }
}

pub struct Sender {
    link: Arc<dyn SenderLink>,
    management: Arc<dyn ManagementLink>,
    plugins: Arc<PluginPipeline>,
    retry_policy: Arc<dyn RetryPolicy>,
    busy_latch: ServerBusyLatch,
}

impl Sender {
    pub fn new(
        link: Arc<dyn SenderLink>,
        management: Arc<dyn ManagementLink>,
        plugins: Arc<PluginPipeline>,
        retry_policy: Arc<dyn RetryPolicy>,
        busy_latch: ServerBusyLatch,
    ) -> Self {
        Self {
            link,
            management,
            plugins,
            retry_policy,
            busy_latch,
        }
    }

    async fn call_management(&self, operation: &'static str, body: ManagementBody) -> Result<crate::link::ManagementResponse> {
        retry::call_management(
            self.management.as_ref(),
            self.retry_policy.as_ref(),
            &self.busy_latch,
            operation,
            body,
        )
        .await
    }

    /// §4.3: fails with `argument_invalid` if any message carries a lock
    /// token (use `ReceivedMessage::clone_for_resend` instead) or if the
    /// batch exceeds the link's negotiated maximum message size.
    pub async fn send(&self, messages: Vec<Message>) -> Result<()> {
        if messages.is_empty() {
            return Err(ServiceBusError::argument("cannot send an empty batch"));
        }

        let mut encoded_batch = Vec::new();
        for message in messages {
            let message = self.plugins.run_before_send(message).await?;
            let encoded = encode(&message);
            encoded_batch.extend_from_slice(&encoded);
        }

        if encoded_batch.len() > self.link.max_message_size() {
            return Err(ServiceBusError::new(
                crate::error::ServiceBusErrorKind::MessageSizeExceeded,
                format!(
                    "encoded batch of {} bytes exceeds the negotiated maximum of {} bytes",
                    encoded_batch.len(),
                    self.link.max_message_size()
                ),
            ));
        }

        retry::run_operation(
            self.retry_policy.as_ref(),
            &self.busy_latch,
            DEFAULT_OPERATION_TIMEOUT,
            || self.link.send(encoded_batch.clone()),
        )
        .await
    }

    pub async fn schedule(&self, message: Message, when: DateTime<Utc>) -> Result<i64> {
        let message = self.plugins.run_before_send(message).await?;
        let body = ManagementBody::Json(serde_json::json!({
            "message": EncodedMessage::from(&message),
            "scheduled-enqueue-time": when.to_rfc3339(),
        }));
        let response = self.call_management(operations::SCHEDULE_MESSAGE, body).await?;
        match response.status {
            200 => match response.body {
                crate::link::ManagementBody::Json(value) => value
                    .get("sequence-number")
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| {
                        ServiceBusError::new(
                            crate::error::ServiceBusErrorKind::InternalError,
                            "schedule-message response missing sequence-number",
                        )
                    }),
                crate::link::ManagementBody::Empty => Err(ServiceBusError::new(
                    crate::error::ServiceBusErrorKind::InternalError,
                    "schedule-message response had no body",
                )),
            },
            status => Err(from_status_code(status, "schedule-message failed")),
        }
    }

    pub async fn cancel_schedule(&self, sequence_number: i64) -> Result<()> {
        let body = ManagementBody::Json(serde_json::json!({ "sequence-number": sequence_number }));
        let response = self
            .call_management(operations::CANCEL_SCHEDULED_MESSAGE, body)
            .await?;
        match response.status {
            200 | 204 => Ok(()),
            status => Err(from_status_code(status, "cancel-scheduled-message failed")),
        }
    }
}
