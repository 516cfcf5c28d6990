//! Compact UTC timestamps used in session records, reports and run ids.

use time::OffsetDateTime;

/// Current UTC time as a compact, lexically sortable stamp (`20261018T120304Z`).
pub fn now_utc_compact() -> String {
    format_utc_compact(OffsetDateTime::now_utc())
}

pub fn format_utc_compact(at: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        at.year(),
        at.month() as u8,
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_stamp_shape() {
        let stamp = now_utc_compact();
        assert_eq!(stamp.len(), 16);
        assert_eq!(&stamp[8..9], "T");
        assert!(stamp.ends_with('Z'));
        assert!(stamp[..8].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_format_fixed_instant() {
        let at = OffsetDateTime::from_unix_timestamp(1_792_324_984).unwrap();
        assert_eq!(format_utc_compact(at), "20261018T120304Z");
    }
}
