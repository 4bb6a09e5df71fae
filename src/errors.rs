//! One error type shared by the core and both ends of the wire.

use std::io;

use thiserror::Error;

use crate::constants;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Failure kinds with stable negative wire codes.
///
/// Core operations return these directly; the server writes [`code`] onto the
/// socket and the client reconstructs the kind with [`from_code`].
///
/// [`code`]: TransportError::code
/// [`from_code`]: TransportError::from_code
#[derive(Debug, Error)]
pub enum TransportError {
    /// Catch-all for invalid arguments, unknown objects, bad configurations.
    #[error("{0}")]
    General(String),

    /// A fixed capacity (stations, attachments) is exhausted.
    #[error("too many: {0}")]
    TooMany(String),

    /// A station with the same name but a different configuration exists.
    #[error("already exists: {0}")]
    Exists(String),

    /// The waiting attachment was told to stop waiting.
    #[error("attachment {0} woken up")]
    WakeUp(i32),

    /// A timed wait expired with the list still empty.
    #[error("timed out")]
    Timeout,

    /// An async read found nothing to take.
    #[error("no events in list")]
    Empty,

    /// An async caller found a list's mutex already taken. Native systems
    /// report this from a failed try-lock; here every list operation takes
    /// the monitor unconditionally, so the kind is carried for wire
    /// compatibility only and is never produced locally.
    #[error("list is busy")]
    Busy,

    /// The system has been closed; the handle is no longer usable.
    #[error("system is dead")]
    Dead,

    /// Socket-level failure; never encoded on the wire.
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Stable wire code for this kind.
    pub fn code(&self) -> i32 {
        match self {
            TransportError::General(_) => constants::ERROR,
            TransportError::TooMany(_) => constants::ERROR_TOO_MANY,
            TransportError::Exists(_) => constants::ERROR_EXISTS,
            TransportError::WakeUp(_) => constants::ERROR_WAKE_UP,
            TransportError::Timeout => constants::ERROR_TIMEOUT,
            TransportError::Empty => constants::ERROR_EMPTY,
            TransportError::Busy => constants::ERROR_BUSY,
            TransportError::Dead => constants::ERROR_DEAD,
            TransportError::Io(_) => constants::ERROR,
        }
    }

    /// Rebuild the kind a server reported. `att` names the local attachment
    /// for wakeup errors since the wire carries only the code.
    pub fn from_code(code: i32, att: i32) -> TransportError {
        match code {
            constants::ERROR_TOO_MANY => {
                TransportError::TooMany("limit reached in remote system".into())
            }
            constants::ERROR_EXISTS => {
                TransportError::Exists("object exists in remote system".into())
            }
            constants::ERROR_WAKE_UP => TransportError::WakeUp(att),
            constants::ERROR_TIMEOUT => TransportError::Timeout,
            constants::ERROR_EMPTY => TransportError::Empty,
            constants::ERROR_BUSY => TransportError::Busy,
            constants::ERROR_DEAD => TransportError::Dead,
            _ => TransportError::General("error reported by remote system".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(TransportError::General("x".into()).code(), -1);
        assert_eq!(TransportError::TooMany("x".into()).code(), -2);
        assert_eq!(TransportError::Exists("x".into()).code(), -3);
        assert_eq!(TransportError::WakeUp(5).code(), -4);
        assert_eq!(TransportError::Timeout.code(), -5);
        assert_eq!(TransportError::Empty.code(), -6);
        assert_eq!(TransportError::Busy.code(), -7);
        assert_eq!(TransportError::Dead.code(), -8);
    }

    #[test]
    fn test_round_trip_through_code() {
        let err = TransportError::from_code(TransportError::Timeout.code(), 0);
        assert!(matches!(err, TransportError::Timeout));
        let err = TransportError::from_code(TransportError::WakeUp(9).code(), 9);
        assert!(matches!(err, TransportError::WakeUp(9)));
    }
}
