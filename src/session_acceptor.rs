//! Session acceptor (§4.4): asks the broker for the next available (or a
//! named) session and returns a `SessionReceiver` bound to it.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, ServiceBusError};
use crate::link::SessionAcceptorLink;
use crate::model::ReceiveMode;
use crate::plugin::PluginPipeline;
use crate::receiver::{Receiver, SessionReceiver};
use crate::retry::{self, RetryPolicy, ServerBusyLatch, DEFAULT_OPERATION_TIMEOUT};

pub struct SessionAcceptor {
    link: Arc<dyn SessionAcceptorLink>,
    mode: ReceiveMode,
    prefetch_count: u32,
    retry_policy: Arc<dyn RetryPolicy>,
    busy_latch: ServerBusyLatch,
    plugins: Arc<PluginPipeline>,
}

impl SessionAcceptor {
    pub fn new(
        link: Arc<dyn SessionAcceptorLink>,
        mode: ReceiveMode,
        prefetch_count: u32,
        retry_policy: Arc<dyn RetryPolicy>,
        busy_latch: ServerBusyLatch,
        plugins: Arc<PluginPipeline>,
    ) -> Self {
        Self {
            link,
            mode,
            prefetch_count,
            retry_policy,
            busy_latch,
            plugins,
        }
    }

    pub async fn accept_any(&self, wait_time: Duration) -> Result<SessionReceiver> {
        let accepted = retry::run_operation(
            self.retry_policy.as_ref(),
            &self.busy_latch,
            DEFAULT_OPERATION_TIMEOUT,
            || self.link.accept_any(wait_time),
        )
        .await?;
        self.bind(accepted).await
    }

    pub async fn accept_named(&self, session_id: &str, wait_time: Duration) -> Result<SessionReceiver> {
        let accepted = retry::run_operation(
            self.retry_policy.as_ref(),
            &self.busy_latch,
            DEFAULT_OPERATION_TIMEOUT,
            || self.link.accept_named(session_id, wait_time),
        )
        .await?;
        self.bind(accepted).await
    }

    pub fn retry_policy(&self) -> &dyn RetryPolicy {
        self.retry_policy.as_ref()
    }

    async fn bind(
        &self,
        accepted: Option<crate::link::AcceptedSession>,
    ) -> Result<SessionReceiver> {
        let accepted = accepted.ok_or_else(ServiceBusError::service_timeout)?;
        let locked_until = accepted.locked_until;
        let receiver = Receiver::new(
            accepted.receiver,
            accepted.management.clone(),
            self.mode,
            self.prefetch_count,
            self.retry_policy.clone(),
            self.busy_latch.clone(),
            self.plugins.clone(),
        )
        .await?;
        Ok(SessionReceiver::new(
            receiver,
            accepted.session_id,
            accepted.management,
            locked_until,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::ExponentialRetryPolicy;
    use async_trait::async_trait;

    struct NoSessionLink;

    #[async_trait]
    impl SessionAcceptorLink for NoSessionLink {
        async fn accept_any(&self, _wait_time: Duration) -> Result<Option<crate::link::AcceptedSession>> {
            Ok(None)
        }
        async fn accept_named(
            &self,
            _session_id: &str,
            _wait_time: Duration,
        ) -> Result<Option<crate::link::AcceptedSession>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn no_session_available_is_service_timeout() {
        let acceptor = SessionAcceptor::new(
            Arc::new(NoSessionLink),
            ReceiveMode::PeekLock,
            10,
            Arc::new(ExponentialRetryPolicy::default()),
            ServerBusyLatch::new(),
            Arc::new(PluginPipeline::new()),
        );
        let err = acceptor.accept_any(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ServiceBusErrorKind::ServiceTimeout);
    }
}
