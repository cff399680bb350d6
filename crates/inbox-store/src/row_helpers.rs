use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// Get a column value, mapping failure to `CorruptRow`.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse an optional RFC 3339 timestamp column.
pub fn parse_timestamp(
    raw: Option<String>,
    table: &'static str,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::CorruptRow {
                table,
                column,
                detail: format!("invalid timestamp {s:?}: {e}"),
            })
    })
    .transpose()
}

/// Parse an optional JSON string-array column.
pub fn parse_string_list(
    raw: Option<String>,
    table: &'static str,
    column: &'static str,
) -> Result<Option<Vec<String>>, StoreError> {
    raw.map(|s| {
        serde_json::from_str(&s).map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid JSON: {e}"),
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_roundtrip() {
        let parsed = parse_timestamp(Some("2026-10-01T12:00:00+00:00".into()), "emails", "classified_at")
            .unwrap()
            .unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-10-01T12:00:00+00:00");
        assert!(parse_timestamp(None, "emails", "classified_at").unwrap().is_none());
    }

    #[test]
    fn bad_timestamp_is_corrupt_row() {
        let err = parse_timestamp(Some("yesterday".into()), "emails", "classified_at").unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { column: "classified_at", .. }));
    }

    #[test]
    fn string_list_parsing() {
        let list = parse_string_list(Some(r#"["a","b"]"#.into()), "emails", "assistant_summary")
            .unwrap();
        assert_eq!(list, Some(vec!["a".to_string(), "b".to_string()]));
        assert!(parse_string_list(Some("{".into()), "emails", "assistant_summary").is_err());
    }
}
