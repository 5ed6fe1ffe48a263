use time::format_description::well_known::Rfc3339;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::error::SyncError;

// Upstream shape: 2026-01-07T11:29:42.000-0300
const UPSTREAM_WITH_FRACTION: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond][offset_hour sign:mandatory][offset_minute]"
);
const UPSTREAM_WITHOUT_FRACTION: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second][offset_hour sign:mandatory][offset_minute]"
);
const LOCAL_DATE_TIME: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
const DATE_ONLY: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Parses a timestamp as the registry sends it.
///
/// Accepts the compact-offset upstream form, RFC 3339, an offset-less local
/// date-time (read in `fallback_offset`), and a bare date (midnight in
/// `fallback_offset`). Returns `None` for anything else.
#[must_use]
pub fn parse_remote_timestamp(raw: &str, fallback_offset: UtcOffset) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = OffsetDateTime::parse(raw, UPSTREAM_WITH_FRACTION) {
        return Some(parsed);
    }
    if let Ok(parsed) = OffsetDateTime::parse(raw, UPSTREAM_WITHOUT_FRACTION) {
        return Some(parsed);
    }
    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(parsed);
    }
    if let Ok(parsed) = PrimitiveDateTime::parse(raw, LOCAL_DATE_TIME) {
        return Some(parsed.assume_offset(fallback_offset));
    }
    Date::parse(raw, DATE_ONLY).ok().map(|date| date.midnight().assume_offset(fallback_offset))
}

/// Formats an instant as RFC 3339 in UTC.
///
/// # Errors
/// Returns [`SyncError::Processing`] when the instant cannot be represented.
pub fn rfc3339(value: OffsetDateTime) -> Result<String, SyncError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| SyncError::Processing(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Parses an RFC 3339 timestamp written by [`rfc3339`].
///
/// # Errors
/// Returns [`SyncError::Processing`] for malformed input.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, SyncError> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| SyncError::Processing(format!("invalid RFC3339 timestamp {value}: {err}")))
}

#[cfg(test)]
mod tests {
    use time::macros::{datetime, offset};

    use super::*;

    const BRT: UtcOffset = offset!(-3);

    #[test]
    fn parses_upstream_compact_offset() {
        assert_eq!(
            parse_remote_timestamp("2026-01-07T11:29:42.000-0300", BRT),
            Some(datetime!(2026-01-07 14:29:42 UTC))
        );
        assert_eq!(
            parse_remote_timestamp("2026-01-07T11:29:42-0300", BRT),
            Some(datetime!(2026-01-07 14:29:42 UTC))
        );
    }

    #[test]
    fn parses_rfc3339_local_and_date_only_forms() {
        assert_eq!(
            parse_remote_timestamp("2026-01-07T14:29:42Z", BRT),
            Some(datetime!(2026-01-07 14:29:42 UTC))
        );
        assert_eq!(
            parse_remote_timestamp("2026-01-07T11:29:42", BRT),
            Some(datetime!(2026-01-07 14:29:42 UTC))
        );
        assert_eq!(
            parse_remote_timestamp("2026-01-07", BRT),
            Some(datetime!(2026-01-07 03:00 UTC))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_remote_timestamp("", BRT).is_none());
        assert!(parse_remote_timestamp("yesterday", BRT).is_none());
        assert!(parse_remote_timestamp("2026-13-40T99:00:00.000-0300", BRT).is_none());
    }

    #[test]
    fn rfc3339_round_trips_in_utc() -> Result<(), SyncError> {
        let value = datetime!(2026-01-07 11:29:42 -3);
        let formatted = rfc3339(value)?;
        assert_eq!(formatted, "2026-01-07T14:29:42Z");
        assert_eq!(parse_rfc3339(&formatted)?, value);
        Ok(())
    }
}
