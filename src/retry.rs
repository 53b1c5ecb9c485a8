//! Retry policy and the server-busy gate shared across every sender/receiver
//! on a connection (§4.1).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{ServiceBusError, ServiceBusErrorKind};
use crate::link::{ManagementBody, ManagementLink, ManagementResponse};

/// Operation budget for a single retried call when the caller (receiver,
/// sender, session acceptor, rule manager) has no more specific timeout of
/// its own (§4.1).
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Classifies failures and computes backoff. Implementations must be cheap
/// to call — `on_should_retry` is on the hot path of every retried op.
pub trait RetryPolicy: Send + Sync {
    fn is_transient(&self, err: &ServiceBusError) -> bool {
        err.transient()
    }

    /// `None` means "do not retry" — either the attempt budget or the
    /// policy's own cap has been exhausted.
    fn on_should_retry(&self, remaining: Duration, attempt: u32) -> Option<Duration>;
}

/// Exponential backoff with jitter: `min(max_backoff, base*(2^attempt - 1)) + jitter`,
/// capped at a maximum attempt count (§4.1 "Default policy").
#[derive(Debug, Clone)]
pub struct ExponentialRetryPolicy {
    pub base: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for ExponentialRetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(0),
            max_backoff: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy for ExponentialRetryPolicy {
    fn on_should_retry(&self, _remaining: Duration, attempt: u32) -> Option<Duration> {
        if attempt > self.max_attempts {
            return None;
        }
        let exp = 2u64.saturating_pow(attempt) - 1;
        let backoff = self.base.saturating_mul(exp as u32).min(self.max_backoff);
        let jitter = Duration::from_millis(fastrand_jitter_ms());
        Some(backoff + jitter)
    }
}

/// Small deterministic-ish jitter without pulling in a dedicated RNG crate —
/// bounded to 0..100ms, enough to de-synchronize concurrent retriers.
fn fastrand_jitter_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    u64::from(nanos % 100)
}

const SERVER_BUSY_SLEEP: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct LatchState {
    busy: bool,
    message: String,
}

/// Per-connection server-busy latch (§4.1). A single-shot timer clears it
/// 10s after the most recent trip; additional trips inside that window do
/// not prolong it, matching "at most one server-busy timer is active per
/// connection at any time" (§8).
#[derive(Clone)]
pub struct ServerBusyLatch {
    state: Arc<Mutex<LatchState>>,
}

impl Default for ServerBusyLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBusyLatch {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LatchState::default())),
        }
    }

    pub async fn is_busy(&self) -> bool {
        self.state.lock().await.busy
    }

    pub async fn message(&self) -> String {
        self.state.lock().await.message.clone()
    }

    /// Arms the latch if it isn't already armed; spawns the clearing timer
    /// the first time only, so concurrent trips within the window are free.
    pub async fn trip(&self, message: impl Into<String>) {
        let mut guard = self.state.lock().await;
        if guard.busy {
            return;
        }
        guard.busy = true;
        guard.message = message.into();
        drop(guard);

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(SERVER_BUSY_SLEEP).await;
            let mut guard = state.lock().await;
            guard.busy = false;
            guard.message.clear();
        });
    }

    pub async fn clear(&self) {
        let mut guard = self.state.lock().await;
        guard.busy = false;
        guard.message.clear();
    }
}

/// Runs `op`, retrying per §4.1's algorithm. `op` is re-invoked via the
/// supplied closure on every attempt; the closure must be safe to call more
/// than once (idempotent from the caller's point of view — this crate never
/// retries a `send` after partial success, for instance).
pub async fn run_operation<T, F, Fut>(
    policy: &dyn RetryPolicy,
    latch: &ServerBusyLatch,
    total_timeout: Duration,
    mut op: F,
) -> Result<T, ServiceBusError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ServiceBusError>>,
{
    let deadline = Instant::now() + total_timeout;
    let mut remaining = total_timeout;

    if latch.is_busy().await && remaining < SERVER_BUSY_SLEEP {
        tokio::time::sleep(remaining).await;
        return Err(ServiceBusError::server_busy(latch.message().await));
    }

    let mut attempt = 0u32;
    loop {
        if latch.is_busy().await {
            tokio::time::sleep(SERVER_BUSY_SLEEP).await;
        }

        match op().await {
            Ok(value) => {
                latch.clear().await;
                return Ok(value);
            }
            Err(err) => {
                if err.kind() == ServiceBusErrorKind::ServerBusy {
                    latch.trip(err.message.clone()).await;
                }

                attempt += 1;
                remaining = deadline.saturating_duration_since(Instant::now());

                if !policy.is_transient(&err) {
                    return Err(err);
                }

                let Some(retry_interval) = policy.on_should_retry(remaining, attempt) else {
                    return Err(err);
                };

                if retry_interval >= remaining {
                    return Err(err);
                }

                tokio::time::sleep(retry_interval).await;
            }
        }
    }
}

/// Issues one management-link call through [`run_operation`], folding the
/// status-code interpretation into the retried closure so a `429` response
/// (§4.2 `TooManyRequests`) becomes a `ServerBusy` error *before*
/// `run_operation` sees it — otherwise the latch would never trip, since
/// `ManagementLink::call` returns `Ok` for every status it gets back.
pub async fn call_management(
    management: &dyn ManagementLink,
    policy: &dyn RetryPolicy,
    latch: &ServerBusyLatch,
    operation: &'static str,
    body: ManagementBody,
) -> Result<ManagementResponse, ServiceBusError> {
    run_operation(policy, latch, DEFAULT_OPERATION_TIMEOUT, || async {
        let response = management.call(operation, body.clone()).await?;
        if response.status == 429 {
            return Err(ServiceBusError::server_busy("server busy"));
        }
        Ok(response)
    })
    .await
}
