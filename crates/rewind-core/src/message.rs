//! Inbound envelope parsing.
//!
//! Records on the snapshot topic carry a capture envelope whose `data` field
//! is a JSON-encoded pipeline event. Only `$snapshot_items` events with a
//! non-empty items array and a session id are accepted; everything else is
//! rejected with a [`DropCause`] so the consumer can count it and move on.
//! Parsing never errors: a malformed record is a labelled drop, not a fault.
//!
//! The envelope identifies the owning team either directly (`team_id`) or by
//! an ingestion `token` that the consumer resolves asynchronously, so parsing
//! happens in two stages: [`RawSnapshot::parse`] produces a [`TeamRef`], and
//! the consumer upgrades it into a [`SnapshotMessage`] once the team is known.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ConsumedRecord, RecordMetadata, SessionKey};

/// The pipeline event type carrying session-replay snapshot batches.
pub const SNAPSHOT_EVENT: &str = "$snapshot_items";

/// Why a record was dropped before reaching a session buffer.
///
/// Used as the label value on the dropped-events counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    /// Record had no payload or no timestamp, or the envelope was not JSON.
    InvalidEnvelope,
    /// The envelope's inner `data` string was not a valid pipeline event.
    InvalidPayload,
    /// The pipeline event was not a `$snapshot_items` event.
    NotSnapshot,
    /// The event had no `$session_id`.
    MissingSessionId,
    /// The `$snapshot_items` array was missing or empty.
    EmptySnapshotItems,
    /// The envelope's token did not resolve to a team.
    UnknownTeam,
    /// The offset is at or below a high-water mark.
    HighWaterMark,
}

impl DropCause {
    pub fn as_label(&self) -> &'static str {
        match self {
            DropCause::InvalidEnvelope => "invalid_envelope",
            DropCause::InvalidPayload => "invalid_payload",
            DropCause::NotSnapshot => "not_snapshot",
            DropCause::MissingSessionId => "missing_session_id",
            DropCause::EmptySnapshotItems => "empty_snapshot_items",
            DropCause::UnknownTeam => "unknown_team",
            DropCause::HighWaterMark => "high_water_mark",
        }
    }
}

impl std::fmt::Display for DropCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Team identity as it appears on the wire: resolved or token-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeamRef {
    Id(u64),
    Token(String),
}

#[derive(Debug, Deserialize)]
struct CaptureEnvelope {
    team_id: Option<u64>,
    token: Option<String>,
    distinct_id: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct PipelineEvent {
    event: String,
    #[serde(default)]
    properties: SnapshotProperties,
}

#[derive(Debug, Default, Deserialize)]
struct SnapshotProperties {
    #[serde(rename = "$snapshot_items", default)]
    snapshot_items: Vec<Value>,
    #[serde(rename = "$session_id")]
    session_id: Option<String>,
    #[serde(rename = "$window_id")]
    window_id: Option<String>,
}

/// A parsed snapshot batch whose team has not been resolved yet.
#[derive(Debug, Clone)]
pub struct RawSnapshot {
    pub team: TeamRef,
    pub distinct_id: String,
    pub session_id: String,
    pub window_id: Option<String>,
    pub events: Vec<Value>,
    pub metadata: RecordMetadata,
}

impl RawSnapshot {
    /// Parse a consumed record into a snapshot batch, or report why it must
    /// be dropped.
    pub fn parse(record: &ConsumedRecord) -> Result<RawSnapshot, DropCause> {
        let payload = record.payload.as_ref().ok_or(DropCause::InvalidEnvelope)?;
        let timestamp_ms = record.timestamp_ms.ok_or(DropCause::InvalidEnvelope)?;

        let envelope: CaptureEnvelope =
            serde_json::from_slice(payload).map_err(|_| DropCause::InvalidEnvelope)?;

        let team = match (envelope.team_id, envelope.token) {
            (Some(id), _) => TeamRef::Id(id),
            (None, Some(token)) => TeamRef::Token(token),
            (None, None) => return Err(DropCause::InvalidEnvelope),
        };

        let event: PipelineEvent =
            serde_json::from_str(&envelope.data).map_err(|_| DropCause::InvalidPayload)?;

        if event.event != SNAPSHOT_EVENT {
            return Err(DropCause::NotSnapshot);
        }

        let session_id = event
            .properties
            .session_id
            .filter(|s| !s.is_empty())
            .ok_or(DropCause::MissingSessionId)?;

        if event.properties.snapshot_items.is_empty() {
            return Err(DropCause::EmptySnapshotItems);
        }

        Ok(RawSnapshot {
            team,
            distinct_id: envelope.distinct_id,
            session_id,
            window_id: event.properties.window_id,
            events: event.properties.snapshot_items,
            metadata: RecordMetadata {
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
                timestamp_ms,
            },
        })
    }

    /// Attach the resolved team id, producing a routable message.
    pub fn into_message(self, team_id: u64) -> SnapshotMessage {
        SnapshotMessage {
            team_id,
            session_id: self.session_id,
            window_id: self.window_id,
            distinct_id: self.distinct_id,
            events: self.events,
            metadata: self.metadata,
        }
    }
}

/// One fully-parsed snapshot batch, ready for routing to a session manager.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotMessage {
    pub team_id: u64,
    pub session_id: String,
    pub window_id: Option<String>,
    pub distinct_id: String,
    pub events: Vec<Value>,
    #[serde(skip)]
    pub metadata: RecordMetadata,
}

impl SnapshotMessage {
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.team_id, self.session_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    fn record_with_payload(payload: &str) -> ConsumedRecord {
        ConsumedRecord {
            topic: "snapshots".to_string(),
            partition: 0,
            offset: 1,
            timestamp_ms: Some(1_700_000_000_000),
            key: None,
            payload: Some(Bytes::from(payload.to_string())),
        }
    }

    fn snapshot_envelope(team_id: Option<u64>, token: Option<&str>) -> String {
        let data = json!({
            "event": SNAPSHOT_EVENT,
            "properties": {
                "$snapshot_items": [{"type": 3, "timestamp": 1_700_000_000_123u64}],
                "$session_id": "session-1",
                "$window_id": "window-1",
            }
        })
        .to_string();

        let mut envelope = json!({
            "distinct_id": "user-1",
            "data": data,
        });
        if let Some(id) = team_id {
            envelope["team_id"] = json!(id);
        }
        if let Some(token) = token {
            envelope["token"] = json!(token);
        }
        envelope.to_string()
    }

    // ---------------------------------------------------------------
    // Happy path
    // ---------------------------------------------------------------

    #[test]
    fn test_parse_with_team_id() {
        let record = record_with_payload(&snapshot_envelope(Some(7), None));
        let raw = RawSnapshot::parse(&record).unwrap();
        assert_eq!(raw.team, TeamRef::Id(7));
        assert_eq!(raw.session_id, "session-1");
        assert_eq!(raw.window_id.as_deref(), Some("window-1"));
        assert_eq!(raw.distinct_id, "user-1");
        assert_eq!(raw.events.len(), 1);
        assert_eq!(raw.metadata.offset, 1);
        assert_eq!(raw.metadata.partition, 0);
    }

    #[test]
    fn test_parse_with_token() {
        let record = record_with_payload(&snapshot_envelope(None, Some("phc_abc")));
        let raw = RawSnapshot::parse(&record).unwrap();
        assert_eq!(raw.team, TeamRef::Token("phc_abc".to_string()));
    }

    #[test]
    fn test_team_id_wins_over_token() {
        let record = record_with_payload(&snapshot_envelope(Some(9), Some("phc_abc")));
        let raw = RawSnapshot::parse(&record).unwrap();
        assert_eq!(raw.team, TeamRef::Id(9));
    }

    #[test]
    fn test_into_message_builds_session_key() {
        let record = record_with_payload(&snapshot_envelope(Some(7), None));
        let msg = RawSnapshot::parse(&record).unwrap().into_message(7);
        assert_eq!(msg.session_key(), SessionKey::new(7, "session-1"));
    }

    // ---------------------------------------------------------------
    // Drops
    // ---------------------------------------------------------------

    #[test]
    fn test_missing_payload_is_invalid_envelope() {
        let mut record = record_with_payload("{}");
        record.payload = None;
        assert_eq!(
            RawSnapshot::parse(&record).unwrap_err(),
            DropCause::InvalidEnvelope
        );
    }

    #[test]
    fn test_missing_timestamp_is_invalid_envelope() {
        let mut record = record_with_payload(&snapshot_envelope(Some(7), None));
        record.timestamp_ms = None;
        assert_eq!(
            RawSnapshot::parse(&record).unwrap_err(),
            DropCause::InvalidEnvelope
        );
    }

    #[test]
    fn test_garbage_payload_is_invalid_envelope() {
        let record = record_with_payload("not json at all");
        assert_eq!(
            RawSnapshot::parse(&record).unwrap_err(),
            DropCause::InvalidEnvelope
        );
    }

    #[test]
    fn test_missing_team_and_token_is_invalid_envelope() {
        let record = record_with_payload(&snapshot_envelope(None, None));
        assert_eq!(
            RawSnapshot::parse(&record).unwrap_err(),
            DropCause::InvalidEnvelope
        );
    }

    #[test]
    fn test_bad_inner_data_is_invalid_payload() {
        let envelope = json!({
            "team_id": 7,
            "distinct_id": "user-1",
            "data": "{{{",
        })
        .to_string();
        let record = record_with_payload(&envelope);
        assert_eq!(
            RawSnapshot::parse(&record).unwrap_err(),
            DropCause::InvalidPayload
        );
    }

    #[test]
    fn test_wrong_event_type_is_not_snapshot() {
        let data = json!({"event": "$pageview", "properties": {}}).to_string();
        let envelope = json!({
            "team_id": 7,
            "distinct_id": "user-1",
            "data": data,
        })
        .to_string();
        let record = record_with_payload(&envelope);
        assert_eq!(
            RawSnapshot::parse(&record).unwrap_err(),
            DropCause::NotSnapshot
        );
    }

    #[test]
    fn test_missing_session_id_is_dropped() {
        let data = json!({
            "event": SNAPSHOT_EVENT,
            "properties": {"$snapshot_items": [{"type": 3}]}
        })
        .to_string();
        let envelope = json!({
            "team_id": 7,
            "distinct_id": "user-1",
            "data": data,
        })
        .to_string();
        let record = record_with_payload(&envelope);
        assert_eq!(
            RawSnapshot::parse(&record).unwrap_err(),
            DropCause::MissingSessionId
        );
    }

    #[test]
    fn test_empty_session_id_is_dropped() {
        let data = json!({
            "event": SNAPSHOT_EVENT,
            "properties": {"$snapshot_items": [{"type": 3}], "$session_id": ""}
        })
        .to_string();
        let envelope = json!({
            "team_id": 7,
            "distinct_id": "user-1",
            "data": data,
        })
        .to_string();
        let record = record_with_payload(&envelope);
        assert_eq!(
            RawSnapshot::parse(&record).unwrap_err(),
            DropCause::MissingSessionId
        );
    }

    #[test]
    fn test_empty_snapshot_items_is_dropped() {
        let data = json!({
            "event": SNAPSHOT_EVENT,
            "properties": {"$snapshot_items": [], "$session_id": "s"}
        })
        .to_string();
        let envelope = json!({
            "team_id": 7,
            "distinct_id": "user-1",
            "data": data,
        })
        .to_string();
        let record = record_with_payload(&envelope);
        assert_eq!(
            RawSnapshot::parse(&record).unwrap_err(),
            DropCause::EmptySnapshotItems
        );
    }

    #[test]
    fn test_drop_cause_labels_are_stable() {
        assert_eq!(DropCause::InvalidEnvelope.as_label(), "invalid_envelope");
        assert_eq!(DropCause::UnknownTeam.as_label(), "unknown_team");
        assert_eq!(DropCause::HighWaterMark.as_label(), "high_water_mark");
        assert_eq!(DropCause::HighWaterMark.to_string(), "high_water_mark");
    }
}
