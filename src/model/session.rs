//! Session model (§3). A session is identified by `session_id`, carries an
//! opaque state blob bounded at 256 KiB (§6), and moves through
//! accepted → active → empty → closed as the session pump drives it (§4.6).

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{Result, ServiceBusError};

pub const MAX_SESSION_STATE_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub locked_until: DateTime<Utc>,
    state: Option<Bytes>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, locked_until: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            locked_until,
            state: None,
        }
    }

    pub fn state(&self) -> Option<&Bytes> {
        self.state.as_ref()
    }

    pub fn set_state(&mut self, state: Option<Bytes>) -> Result<()> {
        if let Some(ref bytes) = state {
            if bytes.len() > MAX_SESSION_STATE_BYTES {
                return Err(ServiceBusError::argument(format!(
                    "session state exceeds {MAX_SESSION_STATE_BYTES} bytes"
                )));
            }
        }
        self.state = state;
        Ok(())
    }
}
