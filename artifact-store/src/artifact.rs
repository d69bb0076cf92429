use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// An immutable stored artifact.
///
/// Artifacts are identified by `id`. `name` is shared by every artifact of
/// the same kind (e.g. all extraction outputs), so `created_at` and `run_id`
/// are what distinguish them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: u64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Originating run, or `0` when the store does not know it.
    #[serde(default)]
    pub run_id: u64,
}

impl Artifact {
    /// `created_at` rendered the way checkpoints persist it.
    pub fn created_at_string(&self) -> String {
        format_timestamp(&self.created_at)
    }
}

/// Render a timestamp as RFC 3339 in UTC without losing sub-second precision.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw.trim()).map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn whole_second_timestamps_render_like_github() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(format_timestamp(&ts), "2025-03-04T05:06:07Z");
    }

    #[test]
    fn parse_accepts_offsets_and_normalizes_to_utc() {
        let ts = parse_timestamp("2025-03-04T07:06:07+02:00").unwrap();
        assert_eq!(format_timestamp(&ts), "2025-03-04T05:06:07Z");
    }

    #[test]
    fn millisecond_precision_survives_a_round_trip() {
        let ts = parse_timestamp("2025-03-04T05:06:07.123Z").unwrap();
        assert_eq!(parse_timestamp(&format_timestamp(&ts)).unwrap(), ts);
    }
}
