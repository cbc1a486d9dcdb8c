use serde_json::Value;
use thiserror::Error;

use crate::config::{MAX_PUBLISH_INTERVAL_MS, MIN_PUBLISH_INTERVAL_MS};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("control payload is not valid json: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("control payload has no string `command` field")]
    MissingCommand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Restart,
    Status,
    /// Requested interval in milliseconds, `None` when the field is missing or
    /// not an unsigned integer.
    SetInterval(Option<u64>),
    Unknown(String),
}

/// Result of range-checking a `set_interval` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalDecision {
    /// Within range. The running interval is left unchanged.
    AcceptedNotApplied(u64),
    Rejected(Option<u64>),
}

impl ControlCommand {
    pub fn parse(payload: &str) -> Result<Self, CommandError> {
        let value: Value = serde_json::from_str(payload)?;
        let name = value
            .get("command")
            .and_then(Value::as_str)
            .ok_or(CommandError::MissingCommand)?;

        let command = match name.trim().to_ascii_lowercase().as_str() {
            "restart" | "reboot" => Self::Restart,
            "status" => Self::Status,
            "set_interval" | "setinterval" => {
                let requested = value
                    .get("value")
                    .or_else(|| value.get("interval"))
                    .and_then(Value::as_u64);
                Self::SetInterval(requested)
            }
            other => Self::Unknown(other.to_string()),
        };

        Ok(command)
    }
}

pub fn decide_interval(requested: Option<u64>) -> IntervalDecision {
    match requested {
        Some(ms) if (MIN_PUBLISH_INTERVAL_MS..=MAX_PUBLISH_INTERVAL_MS).contains(&ms) => {
            IntervalDecision::AcceptedNotApplied(ms)
        }
        other => IntervalDecision::Rejected(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands() {
        assert_eq!(
            ControlCommand::parse(r#"{"command":"restart"}"#).unwrap(),
            ControlCommand::Restart
        );
        assert_eq!(
            ControlCommand::parse(r#"{"command":"STATUS","from":"dashboard"}"#).unwrap(),
            ControlCommand::Status
        );
        assert_eq!(
            ControlCommand::parse(r#"{"command":"set_interval","value":15000}"#).unwrap(),
            ControlCommand::SetInterval(Some(15_000))
        );
        assert_eq!(
            ControlCommand::parse(r#"{"command":"set_interval","interval":2000}"#).unwrap(),
            ControlCommand::SetInterval(Some(2_000))
        );
    }

    #[test]
    fn unknown_command_keeps_its_name() {
        assert_eq!(
            ControlCommand::parse(r#"{"command":"self_destruct"}"#).unwrap(),
            ControlCommand::Unknown("self_destruct".to_string())
        );
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(matches!(
            ControlCommand::parse("restart"),
            Err(CommandError::Malformed(_))
        ));
        assert!(matches!(
            ControlCommand::parse(r#"{"cmd":"restart"}"#),
            Err(CommandError::MissingCommand)
        ));
        assert!(matches!(
            ControlCommand::parse(r#"{"command":7}"#),
            Err(CommandError::MissingCommand)
        ));
    }

    #[test]
    fn interval_bounds_are_inclusive() {
        assert_eq!(
            decide_interval(Some(1_000)),
            IntervalDecision::AcceptedNotApplied(1_000)
        );
        assert_eq!(
            decide_interval(Some(300_000)),
            IntervalDecision::AcceptedNotApplied(300_000)
        );
        assert_eq!(decide_interval(Some(999)), IntervalDecision::Rejected(Some(999)));
        assert_eq!(
            decide_interval(Some(300_001)),
            IntervalDecision::Rejected(Some(300_001))
        );
        assert_eq!(decide_interval(None), IntervalDecision::Rejected(None));
    }

    #[test]
    fn negative_interval_is_rejected() {
        let command = ControlCommand::parse(r#"{"command":"set_interval","value":-5}"#).unwrap();
        assert_eq!(command, ControlCommand::SetInterval(None));
        assert_eq!(decide_interval(None), IntervalDecision::Rejected(None));
    }
}
