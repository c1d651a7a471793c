//! Domain model: escalation levels, timeout events, and ingress messages.
//!
//! The escalation ladder is a pure function so the detector's decision
//! logic can be tested without a store or a running loop. The stream wire
//! format (field names and string encodings) is part of the service's
//! external contract and must not drift: consumers on other replicas parse
//! these exact fields.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stream field name for the conversation id.
pub const FIELD_CONVERSATION_ID: &str = "conversation_id";

/// Stream field name for the escalation level (decimal string).
pub const FIELD_LEVEL: &str = "level";

/// Stream field name for the deadline-basis timestamp (ms-epoch decimal).
pub const FIELD_AGENT_MESSAGE_TIME: &str = "agent_message_time";

/// Stream field name for the detection timestamp (ms-epoch decimal).
pub const FIELD_DETECTED_AT: &str = "detected_at";

/// Stream field name for the delivery attempt (decimal string, default 1).
pub const FIELD_ATTEMPT: &str = "attempt";

/// Stream field name for the optional JSON payload.
pub const FIELD_EVENT_DATA: &str = "event_data";

/// Escalation level of a waiting conversation.
///
/// `None` means no notification has been issued. Levels only increase
/// while a conversation stays in the waiting index; re-tracking resets the
/// ladder to `None`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum EscalationLevel {
    /// No notification sent yet.
    #[default]
    None,
    /// First notification, wait exceeded the base interval.
    Level1,
    /// Second notification, wait exceeded twice the base interval.
    Level2,
    /// Third and final notification, wait exceeded three times the base
    /// interval.
    Level3,
}

impl EscalationLevel {
    /// Highest level the ladder can reach.
    pub const MAX: Self = Self::Level3;

    /// Numeric value in {0,1,2,3}.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Level1 => 1,
            Self::Level2 => 2,
            Self::Level3 => 3,
        }
    }

    /// Metric label for this level (`level1`..`level3`).
    ///
    /// Only meaningful for published levels; `None` never reaches a metric.
    #[must_use]
    pub const fn metric_label(self) -> &'static str {
        match self {
            Self::None => "level0",
            Self::Level1 => "level1",
            Self::Level2 => "level2",
            Self::Level3 => "level3",
        }
    }

    /// Computes the newly-due level, if any.
    ///
    /// `wait_ms` is the elapsed time since the deadline basis, `current`
    /// the level already published, `interval_ms` the base interval N. The
    /// comparison is strict: a wait of exactly `k * N` is not yet due at
    /// level `k`. The ladder is level-max, not level-sequential: a
    /// conversation discovered at `wait > 3N` with nothing published jumps
    /// straight to level 3.
    #[must_use]
    pub fn next_due(wait_ms: i64, current: Self, interval_ms: i64) -> Option<Self> {
        let current = current.as_u8();
        if wait_ms > interval_ms * 3 && current < 3 {
            Some(Self::Level3)
        } else if wait_ms > interval_ms * 2 && current < 2 {
            Some(Self::Level2)
        } else if wait_ms > interval_ms && current < 1 {
            Some(Self::Level1)
        } else {
            None
        }
    }
}

impl TryFrom<u8> for EscalationLevel {
    type Error = EventParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Level1),
            2 => Ok(Self::Level2),
            3 => Ok(Self::Level3),
            _ => Err(EventParseError::InvalidField {
                field: FIELD_LEVEL,
                value: value.to_string(),
            }),
        }
    }
}

impl From<EscalationLevel> for u8 {
    fn from(level: EscalationLevel) -> Self {
        level.as_u8()
    }
}

impl std::fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Error produced when a stream entry cannot be decoded into a
/// [`TimeoutEvent`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventParseError {
    /// A required field is absent.
    #[error("missing or invalid {0}")]
    MissingField(&'static str),

    /// A field is present but not in the expected encoding.
    #[error("invalid {field} format: {value:?}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: String,
    },
}

/// A timeout event published by the detector and consumed fleet-wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutEvent {
    /// Conversation the timeout applies to.
    pub conversation_id: String,
    /// Newly-due escalation level, always in {1,2,3}.
    pub level: EscalationLevel,
    /// Deadline basis: when the agent message was sent (ms since epoch).
    pub agent_message_time: i64,
    /// When the detector observed the timeout (ms since epoch).
    pub detected_at: i64,
    /// Delivery attempt, starting at 1.
    pub attempt: u32,
}

impl TimeoutEvent {
    /// Encodes the event into stream fields.
    ///
    /// All values are strings; `event_data` carries the full event as JSON
    /// for debuggability and is ignored on decode.
    #[must_use]
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let event_data = serde_json::to_string(self).unwrap_or_default();
        vec![
            (FIELD_CONVERSATION_ID.to_string(), self.conversation_id.clone()),
            (FIELD_LEVEL.to_string(), self.level.to_string()),
            (
                FIELD_AGENT_MESSAGE_TIME.to_string(),
                self.agent_message_time.to_string(),
            ),
            (FIELD_DETECTED_AT.to_string(), self.detected_at.to_string()),
            (FIELD_ATTEMPT.to_string(), self.attempt.to_string()),
            (FIELD_EVENT_DATA.to_string(), event_data),
        ]
    }

    /// Decodes an event from stream fields.
    ///
    /// `conversation_id`, `level`, `agent_message_time`, and `detected_at`
    /// are required; `attempt` defaults to 1 when absent. Unknown fields
    /// are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EventParseError`] when a required field is missing or any
    /// present field fails to parse.
    pub fn from_fields(fields: &[(String, String)]) -> Result<Self, EventParseError> {
        let get = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };

        let conversation_id = get(FIELD_CONVERSATION_ID)
            .filter(|v| !v.is_empty())
            .ok_or(EventParseError::MissingField(FIELD_CONVERSATION_ID))?
            .to_string();

        let level_raw = get(FIELD_LEVEL).ok_or(EventParseError::MissingField(FIELD_LEVEL))?;
        let level = level_raw
            .parse::<u8>()
            .map_err(|_| EventParseError::InvalidField {
                field: FIELD_LEVEL,
                value: level_raw.to_string(),
            })
            .and_then(EscalationLevel::try_from)?;

        let agent_message_time = parse_ms(FIELD_AGENT_MESSAGE_TIME, get(FIELD_AGENT_MESSAGE_TIME))?;
        let detected_at = parse_ms(FIELD_DETECTED_AT, get(FIELD_DETECTED_AT))?;

        let attempt = match get(FIELD_ATTEMPT) {
            None => 1,
            Some(raw) => raw.parse::<u32>().map_err(|_| EventParseError::InvalidField {
                field: FIELD_ATTEMPT,
                value: raw.to_string(),
            })?,
        };

        Ok(Self {
            conversation_id,
            level,
            agent_message_time,
            detected_at,
            attempt,
        })
    }
}

fn parse_ms(field: &'static str, value: Option<&str>) -> Result<i64, EventParseError> {
    let raw = value.ok_or(EventParseError::MissingField(field))?;
    raw.parse::<i64>().map_err(|_| EventParseError::InvalidField {
        field,
        value: raw.to_string(),
    })
}

/// An agent message observed on ingress; starts (or restarts) tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Conversation the message belongs to.
    pub conversation_id: String,
    /// Sending agent.
    pub agent_id: String,
    /// Message identifier, opaque.
    pub message_id: String,
    /// Send time in ms since epoch; becomes the deadline basis.
    pub timestamp_ms: i64,
}

/// A customer response observed on ingress; cancels tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerResponse {
    /// Conversation the response belongs to.
    pub conversation_id: String,
    /// Responding customer.
    pub customer_id: String,
    /// Message identifier, opaque.
    pub message_id: String,
    /// Response time in ms since epoch.
    pub timestamp_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const N: i64 = 1_000;

    #[test]
    fn test_ladder_boundary_is_strict() {
        // wait == N produces nothing; one millisecond past it is level 1.
        assert_eq!(EscalationLevel::next_due(N, EscalationLevel::None, N), None);
        assert_eq!(
            EscalationLevel::next_due(N + 1, EscalationLevel::None, N),
            Some(EscalationLevel::Level1)
        );
    }

    #[test]
    fn test_ladder_steps() {
        assert_eq!(
            EscalationLevel::next_due(2 * N + 1, EscalationLevel::Level1, N),
            Some(EscalationLevel::Level2)
        );
        assert_eq!(
            EscalationLevel::next_due(3 * N + 1, EscalationLevel::Level2, N),
            Some(EscalationLevel::Level3)
        );
        // Already at the published level: nothing new.
        assert_eq!(
            EscalationLevel::next_due(2 * N + 1, EscalationLevel::Level2, N),
            None
        );
        // At the ceiling: nothing ever again.
        assert_eq!(
            EscalationLevel::next_due(100 * N, EscalationLevel::Level3, N),
            None
        );
    }

    #[test]
    fn test_ladder_is_level_max_not_sequential() {
        // A fresh conversation discovered long past 3N jumps straight to 3.
        assert_eq!(
            EscalationLevel::next_due(3 * N + 1, EscalationLevel::None, N),
            Some(EscalationLevel::Level3)
        );
        assert_eq!(
            EscalationLevel::next_due(2 * N + 500, EscalationLevel::None, N),
            Some(EscalationLevel::Level2)
        );
    }

    #[test]
    fn test_ladder_ignores_future_basis() {
        // Clock skew can put the basis in the future; never escalate.
        assert_eq!(EscalationLevel::next_due(-5, EscalationLevel::None, N), None);
    }

    #[test]
    fn test_event_field_round_trip() {
        let event = TimeoutEvent {
            conversation_id: "conv_123".to_string(),
            level: EscalationLevel::Level2,
            agent_message_time: 1_700_000_000_000,
            detected_at: 1_700_000_061_000,
            attempt: 1,
        };

        let fields = event.to_fields();
        assert!(fields.iter().any(|(k, v)| k == "level" && v == "2"));
        assert!(fields.iter().any(|(k, _)| k == "event_data"));

        let decoded = TimeoutEvent::from_fields(&fields).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_decode_defaults_attempt() {
        let fields = vec![
            ("conversation_id".to_string(), "c1".to_string()),
            ("level".to_string(), "1".to_string()),
            ("agent_message_time".to_string(), "1000".to_string()),
            ("detected_at".to_string(), "2001".to_string()),
        ];
        let event = TimeoutEvent::from_fields(&fields).unwrap();
        assert_eq!(event.attempt, 1);
    }

    #[test]
    fn test_decode_rejects_missing_conversation_id() {
        let fields = vec![
            ("level".to_string(), "1".to_string()),
            ("agent_message_time".to_string(), "1000".to_string()),
            ("detected_at".to_string(), "2001".to_string()),
        ];
        assert_eq!(
            TimeoutEvent::from_fields(&fields),
            Err(EventParseError::MissingField("conversation_id"))
        );
    }

    #[test]
    fn test_decode_rejects_mal_typed_level() {
        let fields = vec![
            ("conversation_id".to_string(), "c1".to_string()),
            ("level".to_string(), "high".to_string()),
            ("agent_message_time".to_string(), "1000".to_string()),
            ("detected_at".to_string(), "2001".to_string()),
        ];
        assert!(matches!(
            TimeoutEvent::from_fields(&fields),
            Err(EventParseError::InvalidField { field: "level", .. })
        ));
    }

    #[test]
    fn test_decode_rejects_out_of_range_level() {
        let fields = vec![
            ("conversation_id".to_string(), "c1".to_string()),
            ("level".to_string(), "4".to_string()),
            ("agent_message_time".to_string(), "1000".to_string()),
            ("detected_at".to_string(), "2001".to_string()),
        ];
        assert!(TimeoutEvent::from_fields(&fields).is_err());
    }
}
