//! The message pump (§4.5, HARD CORE): a single receive-loop task feeding a
//! semaphore-bounded pool of per-message dispatch tasks, each paired with
//! its own renew-loop task while auto lock renewal is enabled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::cancel::CancellationToken;
use crate::error::ServiceBusError;
use crate::model::{LockToken, ReceiveMode, ReceivedMessage};
use crate::receiver::Receiver;

use super::{report, ExceptionSink, PumpAction, UserCallback};

/// §4.5 tunables. `max_concurrent_calls` seeds the dispatch semaphore at
/// exactly `N` — the spec leaves the initial permit count as an open
/// question and then resolves it itself: "Specify N as the intended
/// default."
#[derive(Debug, Clone)]
pub struct MessagePumpOptions {
    pub max_concurrent_calls: usize,
    pub auto_complete: bool,
    /// Zero disables auto lock renewal regardless of receive mode.
    pub max_auto_renew_duration: Duration,
    pub receive_wait_time: Duration,
}

impl Default for MessagePumpOptions {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            auto_complete: true,
            max_auto_renew_duration: Duration::from_secs(300),
            receive_wait_time: Duration::from_secs(60),
        }
    }
}

struct Inner {
    receiver: Arc<Receiver>,
    callback: UserCallback,
    sink: ExceptionSink,
    options: MessagePumpOptions,
    cancel: CancellationToken,
    slots: Arc<Semaphore>,
    dispatches: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns exactly one registered handler on `receiver` for its whole lifetime
/// (§4.5 registration invariant, enforced by `Receiver::try_attach_handler`).
pub struct MessagePump {
    inner: Arc<Inner>,
    receive_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MessagePump {
    pub fn new(
        receiver: Arc<Receiver>,
        callback: UserCallback,
        sink: ExceptionSink,
        options: MessagePumpOptions,
    ) -> crate::error::Result<Self> {
        receiver.try_attach_handler()?;
        let slots = Arc::new(Semaphore::new(options.max_concurrent_calls.max(1)));
        Ok(Self {
            inner: Arc::new(Inner {
                receiver,
                callback,
                sink,
                options,
                cancel: CancellationToken::new(),
                slots,
                dispatches: Mutex::new(Vec::new()),
            }),
            receive_loop: Mutex::new(None),
        })
    }

    /// Idempotent: calling `start` twice on a running pump is a no-op.
    pub async fn start(&self) {
        let mut guard = self.receive_loop.lock().await;
        if guard.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *guard = Some(tokio::spawn(receive_loop(inner)));
    }

    /// Signals the receive loop and every outstanding dispatch/renew task to
    /// wind down, then waits for all of them to actually finish.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();

        if let Some(handle) = self.receive_loop.lock().await.take() {
            let _ = handle.await;
        }

        let handles: Vec<_> = self.inner.dispatches.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}

async fn receive_loop(inner: Arc<Inner>) {
    while !inner.cancel.is_cancelled() {
        let permit = match inner.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let message = tokio::select! {
            result = inner.receiver.receive(1, inner.options.receive_wait_time) => result,
            _ = inner.cancel.cancelled() => {
                drop(permit);
                break;
            }
        };

        let message = match message {
            Ok(mut messages) if !messages.is_empty() => messages.remove(0),
            Ok(_) => {
                drop(permit);
                continue;
            }
            Err(err) => {
                drop(permit);
                report(&inner.sink, err, PumpAction::Receive).await;
                continue;
            }
        };

        let dispatch_inner = inner.clone();
        let handle = tokio::spawn(async move {
            dispatch(dispatch_inner, permit, message).await;
        });
        inner.dispatches.lock().await.push(handle);
    }
}

async fn dispatch(inner: Arc<Inner>, permit: OwnedSemaphorePermit, message: ReceivedMessage) {
    let auto_renew = inner.receiver.mode() == ReceiveMode::PeekLock
        && !inner.options.max_auto_renew_duration.is_zero();

    let renew_ct = CancellationToken::new();
    let mut renew_handle = None;
    let mut timer_handle = None;

    if auto_renew {
        if let (Ok(Some(locked_until)), Ok(lock_token)) =
            (message.locked_until(), message.lock_token())
        {
            let renew_inner = inner.clone();
            let renew_ct_loop = renew_ct.clone();
            renew_handle = Some(tokio::spawn(renew_loop(
                renew_inner,
                lock_token,
                locked_until,
                renew_ct_loop,
            )));

            let timer_ct = renew_ct.clone();
            let duration = inner.options.max_auto_renew_duration;
            timer_handle = Some(tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                timer_ct.cancel();
            }));
        }
    }

    let result = (inner.callback)(message.clone(), inner.cancel.clone()).await;

    renew_ct.cancel();
    if let Some(handle) = timer_handle {
        handle.abort();
    }
    if let Some(handle) = renew_handle {
        let _ = handle.await;
    }

    match result {
        Ok(()) => {
            if inner.options.auto_complete && !inner.cancel.is_cancelled() {
                if let Ok(lock_token) = message.lock_token() {
                    if let Err(err) = inner.receiver.complete(lock_token).await {
                        report(&inner.sink, err, PumpAction::Complete).await;
                    }
                }
            }
        }
        Err(err) => {
            let lock_lost = err.kind() == crate::error::ServiceBusErrorKind::MessageLockLost;
            report(&inner.sink, err, PumpAction::UserCallback).await;
            if !lock_lost {
                if let Ok(lock_token) = message.lock_token() {
                    if let Err(abandon_err) = inner.receiver.abandon(lock_token).await {
                        report(&inner.sink, abandon_err, PumpAction::Abandon).await;
                    }
                }
            }
        }
    }

    drop(permit);
}

/// §4.5: `delay = remaining - min(remaining/2, 10s)`, repeated until the
/// pump stops, the dispatch's own callback finishes (`renew_ct`), or a
/// non-transient renewal failure (most commonly `message_lock_lost`).
async fn renew_loop(
    inner: Arc<Inner>,
    lock_token: LockToken,
    mut locked_until: chrono::DateTime<chrono::Utc>,
    renew_ct: CancellationToken,
) {
    const MAX_SUBTRACT: Duration = Duration::from_secs(10);

    loop {
        if inner.cancel.is_cancelled() || renew_ct.is_cancelled() {
            return;
        }

        let remaining = locked_until
            .signed_duration_since(chrono::Utc::now())
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

        match inner.receiver.renew_lock(lock_token).await {
            Ok(new_locked_until) => locked_until = new_locked_until,
            Err(err) => {
                let transient = inner.receiver.retry_policy().is_transient(&err);
                let fatal = !transient;
                report(&inner.sink, err, PumpAction::RenewLock).await;
                if fatal {
                    return;
                }
            }
        }
    }
}

#[allow(dead_code)]
fn assert_send_sync() {
    fn is_send_sync<T: Send + Sync>() {}
    is_send_sync::<MessagePump>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReceiveMode;
    use crate::plugin::PluginPipeline;
    use crate::retry::{ExponentialRetryPolicy, ServerBusyLatch};
    use crate::testutil::{mock_management, raw_delivery, MockReceiverLink};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    async fn make_receiver(mode: ReceiveMode) -> (Arc<MockReceiverLink>, Arc<Receiver>) {
        let link = Arc::new(MockReceiverLink::new());
        let management = mock_management();
        let receiver = Receiver::new(
            link.clone(),
            management,
            mode,
            10,
            Arc::new(ExponentialRetryPolicy::default()),
            ServerBusyLatch::new(),
            Arc::new(PluginPipeline::new()),
        )
        .await
        .unwrap();
        (link, Arc::new(receiver))
    }

    fn noop_sink() -> ExceptionSink {
        Arc::new(|_event| async move {}.boxed())
    }

    #[tokio::test]
    async fn second_start_does_not_attach_twice() {
        let (_link, receiver) = make_receiver(ReceiveMode::PeekLock).await;
        let callback: UserCallback = Arc::new(|_msg, _ct| async move { Ok(()) }.boxed());
        let pump = MessagePump::new(
            receiver,
            callback,
            noop_sink(),
            MessagePumpOptions::default(),
        )
        .unwrap();
        pump.start().await;
        pump.start().await;
        pump.stop().await;
    }

    #[tokio::test]
    async fn second_handler_on_same_receiver_is_rejected() {
        let (_link, receiver) = make_receiver(ReceiveMode::PeekLock).await;
        let callback: UserCallback = Arc::new(|_msg, _ct| async move { Ok(()) }.boxed());
        let _pump = MessagePump::new(
            receiver.clone(),
            callback.clone(),
            noop_sink(),
            MessagePumpOptions::default(),
        )
        .unwrap();
        let err = MessagePump::new(
            receiver,
            callback,
            noop_sink(),
            MessagePumpOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ServiceBusErrorKind::InvalidOperation);
    }

    #[tokio::test]
    async fn successful_callback_auto_completes() {
        let (link, receiver) = make_receiver(ReceiveMode::PeekLock).await;
        link.enqueue(raw_delivery(b"hello", 1));

        let completed = Arc::new(Notify::new());
        let completed_setter = completed.clone();
        let callback: UserCallback = Arc::new(move |_msg, _ct| {
            let completed_setter = completed_setter.clone();
            async move {
                completed_setter.notify_one();
                Ok(())
            }
            .boxed()
        });

        let mut options = MessagePumpOptions::default();
        options.max_auto_renew_duration = Duration::from_millis(0);
        options.receive_wait_time = Duration::from_millis(20);
        let pump = MessagePump::new(receiver, callback, noop_sink(), options).unwrap();
        pump.start().await;

        tokio::time::timeout(Duration::from_secs(1), completed.notified())
            .await
            .expect("callback did not run");
        tokio::time::sleep(Duration::from_millis(20)).await;
        pump.stop().await;

        assert_eq!(link.settled().len(), 1);
    }

    #[tokio::test]
    async fn failing_callback_abandons_the_message() {
        let (link, receiver) = make_receiver(ReceiveMode::PeekLock).await;
        link.enqueue(raw_delivery(b"hello", 1));

        let callback: UserCallback =
            Arc::new(|_msg, _ct| async move { Err(ServiceBusError::argument("nope")) }.boxed());

        let mut options = MessagePumpOptions::default();
        options.max_auto_renew_duration = Duration::from_millis(0);
        options.receive_wait_time = Duration::from_millis(20);
        let pump = MessagePump::new(receiver, callback, noop_sink(), options).unwrap();
        pump.start().await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        pump.stop().await;

        let settled = link.settled();
        assert_eq!(settled.len(), 1);
        assert!(matches!(
            settled[0].1,
            crate::link::SettlementOutcome::Abandon
        ));
    }

    #[tokio::test]
    async fn lock_lost_completion_is_not_abandoned() {
        let (link, receiver) = make_receiver(ReceiveMode::PeekLock).await;
        let raw = raw_delivery(b"hello", 1);
        let token = raw.lock_token.unwrap();
        link.enqueue(raw);
        link.revoke(token);

        let callback: UserCallback = Arc::new(|_msg, _ct| async move { Ok(()) }.boxed());
        let mut options = MessagePumpOptions::default();
        options.max_auto_renew_duration = Duration::from_millis(0);
        options.receive_wait_time = Duration::from_millis(20);
        let pump = MessagePump::new(receiver, callback, noop_sink(), options).unwrap();
        pump.start().await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        pump.stop().await;

        // settle() always failed (revoked), so nothing ever lands in `settled`
        // and — the property under test — no abandon call followed either.
        assert!(link.settled().is_empty());
    }

    #[tokio::test]
    async fn auto_renew_extends_the_lock_during_a_slow_callback() {
        let (link, receiver) = make_receiver(ReceiveMode::PeekLock).await;
        let mut raw = raw_delivery(b"hello", 1);
        raw.locked_until = Some(chrono::Utc::now() + chrono::Duration::milliseconds(150));
        link.enqueue(raw);

        let callback: UserCallback = Arc::new(|_msg, _ct| {
            async move {
                tokio::time::sleep(Duration::from_millis(400)).await;
                Ok(())
            }
            .boxed()
        });

        let mut options = MessagePumpOptions::default();
        options.max_auto_renew_duration = Duration::from_secs(600);
        options.receive_wait_time = Duration::from_millis(20);
        let pump = MessagePump::new(receiver, callback, noop_sink(), options).unwrap();
        pump.start().await;

        tokio::time::sleep(Duration::from_millis(600)).await;
        pump.stop().await;

        assert_eq!(link.settled().len(), 1);
    }

    #[tokio::test]
    async fn bounded_concurrency_limits_in_flight_callbacks() {
        let (link, receiver) = make_receiver(ReceiveMode::PeekLock).await;
        for i in 0..5 {
            link.enqueue(raw_delivery(format!("m{i}").as_bytes(), i));
        }

        let in_flight = Arc::new(AtomicU32::new(0));
        let max_observed = Arc::new(AtomicU32::new(0));
        let in_flight_cb = in_flight.clone();
        let max_observed_cb = max_observed.clone();
        let callback: UserCallback = Arc::new(move |_msg, _ct| {
            let in_flight = in_flight_cb.clone();
            let max_observed = max_observed_cb.clone();
            async move {
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_observed.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        });

        let mut options = MessagePumpOptions::default();
        options.max_concurrent_calls = 2;
        options.max_auto_renew_duration = Duration::from_millis(0);
        options.receive_wait_time = Duration::from_millis(10);
        let pump = MessagePump::new(receiver, callback, noop_sink(), options).unwrap();
        pump.start().await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        pump.stop().await;

        assert!(max_observed.load(Ordering::SeqCst) <= 2);
        assert_eq!(link.settled().len(), 5);
    }
}
