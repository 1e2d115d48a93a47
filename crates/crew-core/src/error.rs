//! Errors raised by the pure domain layer.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Event name did not normalize onto any canonical kind.
    #[error("unknown hook event: {name}")]
    UnknownEvent { name: String },
}

pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_event_display() {
        let err = DomainError::UnknownEvent {
            name: "BeforeModel".to_string(),
        };
        assert_eq!(err.to_string(), "unknown hook event: BeforeModel");
    }
}
