use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the link to the remote model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Active,
    Suspended,
    Error,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid connection transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

pub fn validate_transition(
    from: ConnectionState,
    to: ConnectionState,
) -> Result<(), TransitionError> {
    use ConnectionState::*;
    let valid = matches!(
        (from, to),
        (Idle, Connecting)
            | (Error, Connecting)
            | (Connecting, Active)
            | (Active, Suspended)
            | (Suspended, Active)
            | (Connecting | Active | Suspended, Error)
            | (Idle | Connecting | Active | Suspended | Error, Closed)
    );
    if valid {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_happy_path() {
        for (from, to) in [
            (Idle, Connecting),
            (Connecting, Active),
            (Active, Suspended),
            (Suspended, Active),
            (Active, Closed),
        ] {
            assert!(validate_transition(from, to).is_ok(), "{from} -> {to}");
        }
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(validate_transition(Connecting, Error).is_ok());
        assert!(validate_transition(Error, Connecting).is_ok());
        assert!(validate_transition(Error, Active).is_err());
    }

    #[test]
    fn test_closed_is_terminal() {
        for to in [Idle, Connecting, Active, Suspended, Error, Closed] {
            assert!(validate_transition(Closed, to).is_err());
        }
    }

    #[test]
    fn test_cannot_skip_handshake() {
        assert!(validate_transition(Idle, Active).is_err());
        assert!(validate_transition(Idle, Error).is_err());
        assert_eq!(
            validate_transition(Idle, Suspended).unwrap_err().to_string(),
            "invalid connection transition: idle -> suspended"
        );
    }
}
