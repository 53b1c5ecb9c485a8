use thiserror::Error;

/// Discriminates the error families in §7 without resorting to exceptions
/// for control flow the way the source implementation does (Design Note, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceBusErrorKind {
    /// Null/empty/too-long/malformed argument. Non-retryable.
    ArgumentError,
    /// Settlement in receive-and-delete mode, double handler registration,
    /// operation on a closed client. Non-retryable.
    InvalidOperation,
    /// The broker has reclaimed a message lock; the token is dead.
    MessageLockLost,
    /// The broker has reclaimed a session lock.
    SessionLockLost,
    EntityNotFound,
    EntityDisabled,
    EntityAlreadyExists,
    Unauthorized,
    /// Broker throttling; trips the connection's server-busy latch.
    ServerBusy,
    /// No session/message became available within the requested wait.
    ServiceTimeout,
    MessageSizeExceeded,
    QuotaExceeded,
    /// Generic transient failure surfaced by a management reply.
    InternalError,
    /// A failure surfaced by the link/transport layer below this crate.
    Transport,
}

impl ServiceBusErrorKind {
    /// Whether the retry policy should consider an error of this kind for
    /// another attempt (§4.1, §7). `Transport` failures carry their own
    /// explicit `transient` bit set by the caller constructing the error,
    /// so this table is the default used when none is supplied.
    fn default_transient(self) -> bool {
        matches!(
            self,
            Self::ServerBusy | Self::ServiceTimeout | Self::InternalError
        )
    }
}

#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct ServiceBusError {
    pub kind: ServiceBusErrorKind,
    pub message: String,
    transient: bool,
}

impl ServiceBusError {
    pub fn new(kind: ServiceBusErrorKind, message: impl Into<String>) -> Self {
        let transient = kind.default_transient();
        Self {
            kind,
            message: message.into(),
            transient,
        }
    }

    /// Construct a transport-layer error with an explicit transience bit —
    /// the link implementation below this crate is the authority on whether
    /// its own failure is retryable.
    pub fn transport(message: impl Into<String>, transient: bool) -> Self {
        Self {
            kind: ServiceBusErrorKind::Transport,
            message: message.into(),
            transient,
        }
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::new(ServiceBusErrorKind::ArgumentError, message)
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(ServiceBusErrorKind::InvalidOperation, message)
    }

    pub fn message_lock_lost() -> Self {
        Self::new(ServiceBusErrorKind::MessageLockLost, "message lock lost")
    }

    pub fn session_lock_lost() -> Self {
        Self::new(ServiceBusErrorKind::SessionLockLost, "session lock lost")
    }

    pub fn server_busy(message: impl Into<String>) -> Self {
        Self::new(ServiceBusErrorKind::ServerBusy, message)
    }

    pub fn service_timeout() -> Self {
        Self::new(ServiceBusErrorKind::ServiceTimeout, "operation timed out")
    }

    /// §4.1/§7: only `server_busy` and a handful of others are worth another
    /// attempt; everything else (argument errors, lock-lost, entity errors,
    /// unauthorized, quota) is fatal at the call site.
    pub fn transient(&self) -> bool {
        self.transient
    }

    pub fn kind(&self) -> ServiceBusErrorKind {
        self.kind
    }
}

/// Maps a management-link status code per §4.2's table. Any unknown status
/// is treated as transient, per §6.
pub fn from_status_code(status: u16, body: impl Into<String>) -> ServiceBusError {
    use ServiceBusErrorKind::*;
    let body = body.into();
    match status {
        204 => ServiceBusError::new(InternalError, "no content"), // caller maps to empty list
        404 => ServiceBusError::new(EntityNotFound, body),
        401 => ServiceBusError::new(Unauthorized, body),
        410 => ServiceBusError::new(MessageLockLost, body),
        429 => ServiceBusError::server_busy(body),
        500 => ServiceBusError::new(InternalError, body),
        _ => ServiceBusError {
            kind: InternalError,
            message: format!("unrecognized status {status}: {body}"),
            transient: true,
        },
    }
}

pub type Result<T> = std::result::Result<T, ServiceBusError>;
