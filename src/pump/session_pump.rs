//! The session pump (§4.6, HARD CORE): acceptor tasks bounded by
//! `accept_slots`, one session-processor task per accepted session bounded
//! by `session_slots`, and a session-lock renewer per accepted session.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::cancel::CancellationToken;
use crate::error::{Result, ServiceBusErrorKind};
use crate::receiver::SessionReceiver;
use crate::session_acceptor::SessionAcceptor;

use super::{report, ExceptionSink, PumpAction};

/// The session-scoped equivalent of `UserCallback`: the session itself is
/// handed to the callback so it can read/write session state or close the
/// session early.
pub type SessionUserCallback = Arc<
    dyn Fn(Arc<SessionReceiver>, crate::model::ReceivedMessage, CancellationToken) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

#[derive(Debug, Clone)]
pub struct SessionPumpOptions {
    pub max_concurrent_sessions: usize,
    /// `None` resolves to `min(max_concurrent_sessions, 2 * cpu_count)` (§4.6).
    pub max_concurrent_accept_session_calls: Option<usize>,
    pub auto_complete: bool,
    pub max_auto_renew_duration: Duration,
    pub accept_wait_time: Duration,
    pub message_wait_timeout: Duration,
    /// Sleep after a `service_timeout` from `accept_any` before retrying.
    pub no_message_backoff: Duration,
}

impl Default for SessionPumpOptions {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 1,
            max_concurrent_accept_session_calls: None,
            auto_complete: true,
            max_auto_renew_duration: Duration::from_secs(300),
            accept_wait_time: Duration::from_secs(60),
            message_wait_timeout: Duration::from_secs(60),
            no_message_backoff: Duration::from_millis(10),
        }
    }
}

fn accept_slot_count(options: &SessionPumpOptions) -> usize {
    options.max_concurrent_accept_session_calls.unwrap_or_else(|| {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        options.max_concurrent_sessions.min(2 * cpus).max(1)
    })
}

struct Inner {
    acceptor: Arc<SessionAcceptor>,
    callback: SessionUserCallback,
    sink: ExceptionSink,
    options: SessionPumpOptions,
    cancel: CancellationToken,
    session_slots: Arc<Semaphore>,
    accept_slots: Arc<Semaphore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct SessionPump {
    inner: Arc<Inner>,
    started: Mutex<bool>,
}

impl SessionPump {
    pub fn new(
        acceptor: Arc<SessionAcceptor>,
        callback: SessionUserCallback,
        sink: ExceptionSink,
        options: SessionPumpOptions,
    ) -> Self {
        let accept_slots = accept_slot_count(&options);
        let session_slots = options.max_concurrent_sessions.max(1);
        Self {
            inner: Arc::new(Inner {
                acceptor,
                callback,
                sink,
                options,
                cancel: CancellationToken::new(),
                session_slots: Arc::new(Semaphore::new(session_slots)),
                accept_slots: Arc::new(Semaphore::new(accept_slots)),
                tasks: Mutex::new(Vec::new()),
            }),
            started: Mutex::new(false),
        }
    }

    pub async fn start(&self) {
        let mut started = self.started.lock().await;
        if *started {
            return;
        }
        *started = true;

        let accept_slots = accept_slot_count(&self.inner.options);
        let mut tasks = self.inner.tasks.lock().await;
        for _ in 0..accept_slots {
            let inner = self.inner.clone();
            tasks.push(tokio::spawn(acceptor_task(inner)));
        }
    }

    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let handles: Vec<_> = self.inner.tasks.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}

async fn acceptor_task(inner: Arc<Inner>) {
    while !inner.cancel.is_cancelled() {
        let session_permit = match inner.session_slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let accept_result = {
            let accept_permit = match inner.accept_slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    drop(session_permit);
                    break;
                }
            };
            let result = tokio::select! {
                result = inner.acceptor.accept_any(inner.options.accept_wait_time) => result,
                _ = inner.cancel.cancelled() => {
                    drop(accept_permit);
                    drop(session_permit);
                    return;
                }
            };
            drop(accept_permit);
            result
        };

        match accept_result {
            Ok(session_receiver) => {
                let session = Arc::new(session_receiver);
                let handle = tokio::spawn(process(inner.clone(), session, session_permit));
                inner.tasks.lock().await.push(handle);
            }
            Err(err) if err.kind() == ServiceBusErrorKind::ServiceTimeout => {
                drop(session_permit);
                tokio::time::sleep(inner.options.no_message_backoff).await;
            }
            Err(err) => {
                drop(session_permit);
                let transient = inner.acceptor.retry_policy().is_transient(&err);
                report(&inner.sink, err, PumpAction::AcceptMessageSession).await;
                if !transient {
                    break;
                }
            }
        }
    }
}

async fn process(inner: Arc<Inner>, session: Arc<SessionReceiver>, session_permit: OwnedSemaphorePermit) {
    let auto_renew = !inner.options.max_auto_renew_duration.is_zero();
    let renew_ct = CancellationToken::new();
    let renew_handle = if auto_renew {
        Some(tokio::spawn(session_renew_loop(
            inner.clone(),
            session.clone(),
            renew_ct.clone(),
        )))
    } else {
        None
    };

    loop {
        if inner.cancel.is_cancelled() || session.receiver.is_closed().await {
            break;
        }

        let received = session
            .receiver
            .receive(1, inner.options.message_wait_timeout)
            .await;

        let message = match received {
            Ok(mut messages) if !messages.is_empty() => messages.remove(0),
            Ok(_) => break,
            Err(err) => {
                report(&inner.sink, err, PumpAction::Receive).await;
                break;
            }
        };

        let watchdog_ct = renew_ct.clone();
        let watchdog_duration = inner.options.max_auto_renew_duration;
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(watchdog_duration).await;
            watchdog_ct.cancel();
        });

        let result = (inner.callback)(session.clone(), message.clone(), inner.cancel.clone()).await;
        watchdog.abort();

        match result {
            Ok(()) => {
                if inner.options.auto_complete {
                    if let Ok(lock_token) = message.lock_token() {
                        if let Err(err) = session.receiver.complete(lock_token).await {
                            report(&inner.sink, err, PumpAction::Complete).await;
                        }
                    }
                }
            }
            Err(err) => {
                let lock_lost = matches!(
                    err.kind(),
                    ServiceBusErrorKind::MessageLockLost | ServiceBusErrorKind::SessionLockLost
                );
                report(&inner.sink, err, PumpAction::UserCallback).await;
                if !lock_lost {
                    if let Ok(lock_token) = message.lock_token() {
                        if let Err(abandon_err) = session.receiver.abandon(lock_token).await {
                            report(&inner.sink, abandon_err, PumpAction::Abandon).await;
                        }
                    }
                }
            }
        }
    }

    renew_ct.cancel();
    if let Some(handle) = renew_handle {
        let _ = handle.await;
    }
    let _ = session.receiver.close().await;
    drop(session_permit);
}

/// Renews the **session** lock (not per-message locks) on the same
/// `remaining - min(remaining/2, 10s)` schedule as the message pump's
/// per-message renew loop (§4.6).
async fn session_renew_loop(inner: Arc<Inner>, session: Arc<SessionReceiver>, renew_ct: CancellationToken) {
    const MAX_SUBTRACT: Duration = Duration::from_secs(10);

    loop {
        if inner.cancel.is_cancelled() || renew_ct.is_cancelled() {
            return;
        }

        let locked_until: DateTime<Utc> = session.locked_until().await;
        let remaining = locked_until
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let subtract = (remaining / 2).min(MAX_SUBTRACT);
        let delay = remaining.saturating_sub(subtract);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.cancel.cancelled() => return,
            _ = renew_ct.cancelled() => return,
        }

        if inner.cancel.is_cancelled() || renew_ct.is_cancelled() {
            return;
        }

        if let Err(err) = session.renew_session_lock().await {
            let transient = inner.acceptor.retry_policy().is_transient(&err);
            report(&inner.sink, err, PumpAction::RenewLock).await;
            if !transient {
                return;
            }
        }
    }
}

#[allow(dead_code)]
fn assert_send_sync() {
    fn is_send_sync<T: Send + Sync>() {}
    is_send_sync::<SessionPump>();
}
