//! Calendar trigger adapter.
//!
//! A tick carries the scheduled time and an optional user payload. The
//! payload is passed through byte-for-byte, so whatever JSON the user
//! configured reaches the consumer exactly as written.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::value::RawValue;
use sluice_core::{Envelope, Result, SourceKind};

use crate::Normalize;

/// One firing of a schedule.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarTick {
    /// Scheduled firing time.
    pub event_time: DateTime<Utc>,
    /// User payload, unparsed.
    #[serde(default)]
    pub user_payload: Option<Box<RawValue>>,
}

/// Normalizes calendar ticks.
#[derive(Debug, Default, Clone, Copy)]
pub struct CalendarAdapter;

impl Normalize for CalendarAdapter {
    type Input = CalendarTick;

    fn kind(&self) -> SourceKind {
        SourceKind::Calendar
    }

    fn normalize(&self, input: CalendarTick) -> Result<Envelope> {
        let body = input.user_payload.map(|raw| raw.get().to_owned()).unwrap_or_default();

        Envelope::builder(self.kind())
            .body(body)
            .metadata("eventTime", input.event_time.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_payload_is_kept_verbatim() {
        let tick: CalendarTick = serde_json::from_str(
            r#"{"eventTime":"2024-05-01T09:00:00Z","userPayload":{"b": 1,  "a": [2]}}"#,
        )
        .unwrap();

        let envelope = CalendarAdapter.normalize(tick).unwrap();

        assert_eq!(envelope.body().as_ref(), br#"{"b": 1,  "a": [2]}"#);
        assert_eq!(envelope.metadata().get_str("eventTime"), Some("2024-05-01T09:00:00Z"));
    }

    #[test]
    fn tick_without_payload_has_empty_body() {
        let tick: CalendarTick = serde_json::from_str(r#"{"eventTime":"2024-05-01T09:00:00Z"}"#).unwrap();

        let envelope = CalendarAdapter.normalize(tick).unwrap();

        assert!(envelope.body().is_empty());
        assert_eq!(envelope.kind(), SourceKind::Calendar);
    }
}
