use std::sync::LazyLock;

use regex::Regex;

use crate::{
    error::{ExtractError, ExtractResult},
    models::{ExtractionSpec, MediaKind},
};

static TIME_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"^\d{1,2}:\d{2}:\d{2}$").expect("valid HH:MM:SS pattern"),
        Regex::new(r"^\d{1,2}:\d{2}$").expect("valid MM:SS pattern"),
        Regex::new(r"^\d+$").expect("valid seconds pattern"),
    ]
});

const INVALID_TIME: &str = "Please enter a valid time format (e.g., 30, 0:30, 1:30, or 1:30:45)";

/// Parses `SS`, `M:SS`/`MM:SS` or `H:MM:SS`/`HH:MM:SS` into seconds.
pub fn parse_time(raw: &str) -> ExtractResult<u64> {
    let value = raw.trim();
    if !TIME_PATTERNS.iter().any(|pattern| pattern.is_match(value)) {
        return Err(ExtractError::validation(INVALID_TIME));
    }

    let mut total: u64 = 0;
    for part in value.split(':') {
        let part = part
            .parse::<u64>()
            .map_err(|_| ExtractError::validation(INVALID_TIME))?;
        total = total
            .checked_mul(60)
            .and_then(|t| t.checked_add(part))
            .ok_or_else(|| ExtractError::validation(INVALID_TIME))?;
    }
    Ok(total)
}

/// Trim window applied to the raw media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    /// `None` when a full extraction runs against an unknown source duration.
    pub end: Option<u64>,
    pub full: bool,
}

impl ResolvedRange {
    pub fn duration(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start))
    }
}

/// Limits the range resolution is checked against.
#[derive(Debug, Clone, Copy)]
pub struct DurationLimits {
    pub max_snippet: u64,
    pub max_video: u64,
}

/// Turns the requested window into seconds and enforces the duration caps.
///
/// `source_duration` is `None` when metadata could not be resolved; the
/// full-extraction cap is skipped in that case.
pub fn resolve_range(
    spec: &ExtractionSpec,
    source_duration: Option<u64>,
    limits: DurationLimits,
) -> ExtractResult<ResolvedRange> {
    let kind = spec.format.kind();

    if spec.extract_full {
        if let Some(duration) = source_duration {
            if duration > limits.max_video {
                return Err(ExtractError::validation(format!(
                    "Cannot extract full {} from videos longer than {}. Please specify a time range instead.",
                    kind.noun(),
                    describe_seconds(limits.max_video)
                )));
            }
        }
        return Ok(ResolvedRange {
            start: 0,
            end: source_duration.filter(|d| *d > 0),
            full: true,
        });
    }

    let end_raw = spec
        .end_time
        .as_deref()
        .ok_or_else(|| ExtractError::validation("end_time is required unless extract_full is true"))?;
    let start = parse_time(&spec.start_time)?;
    let end = parse_time(end_raw)?;

    if start >= end {
        return Err(ExtractError::validation(
            "End time must be greater than start time",
        ));
    }

    if end - start > limits.max_snippet {
        return Err(ExtractError::validation(format!(
            "{} snippet cannot be longer than {}.",
            capitalize(kind),
            describe_seconds(limits.max_snippet)
        )));
    }

    Ok(ResolvedRange {
        start,
        end: Some(end),
        full: false,
    })
}

fn capitalize(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "Audio",
        MediaKind::Video => "Video",
    }
}

fn describe_seconds(seconds: u64) -> String {
    match seconds {
        s if s >= 3600 && s % 3600 == 0 => plural(s / 3600, "hour"),
        s if s >= 60 && s % 60 == 0 => plural(s / 60, "minute"),
        s => plural(s, "second"),
    }
}

fn plural(n: u64, unit: &str) -> String {
    if n == 1 {
        format!("1 {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutputFormat;

    const LIMITS: DurationLimits = DurationLimits {
        max_snippet: 3600,
        max_video: 4 * 3600,
    };

    fn spec(start: &str, end: Option<&str>, full: bool) -> ExtractionSpec {
        ExtractionSpec {
            url: "https://youtu.be/abc".to_string(),
            start_time: start.to_string(),
            end_time: end.map(str::to_string),
            format: OutputFormat::Mp3,
            filename: None,
            title_tag: None,
            author_tag: None,
            extract_full: full,
        }
    }

    #[test]
    fn parses_supported_shapes() {
        assert_eq!(parse_time("90").unwrap(), 90);
        assert_eq!(parse_time("1:30").unwrap(), 90);
        assert_eq!(parse_time("01:30").unwrap(), 90);
        assert_eq!(parse_time("01:01:30").unwrap(), 3690);
        assert_eq!(parse_time(" 0:00 ").unwrap(), 0);
    }

    #[test]
    fn rejects_other_shapes() {
        for raw in ["1:30:", "abc", "-5", "", "1:2", "123:00", "1:00:00:00", "1.5"] {
            assert!(
                matches!(parse_time(raw), Err(ExtractError::Validation(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn end_must_follow_start() {
        assert!(resolve_range(&spec("0:30", Some("0:30"), false), None, LIMITS).is_err());
        assert!(resolve_range(&spec("1:00", Some("0:30"), false), None, LIMITS).is_err());

        let range = resolve_range(&spec("0:00", Some("0:30"), false), None, LIMITS).unwrap();
        assert_eq!(range.duration(), Some(30));
        assert!(!range.full);
    }

    #[test]
    fn snippet_cap_is_enforced() {
        let err = resolve_range(&spec("0", Some("3601"), false), None, LIMITS).unwrap_err();
        assert_eq!(
            err.user_message(MediaKind::Audio),
            "Audio snippet cannot be longer than 1 hour."
        );
        assert!(resolve_range(&spec("0", Some("3600"), false), None, LIMITS).is_ok());
    }

    #[test]
    fn full_extraction_uses_source_duration() {
        let range = resolve_range(&spec("0:00", None, true), Some(600), LIMITS).unwrap();
        assert_eq!(range, ResolvedRange { start: 0, end: Some(600), full: true });

        let unknown = resolve_range(&spec("0:00", None, true), Some(0), LIMITS).unwrap();
        assert_eq!(unknown.end, None);
    }

    #[test]
    fn full_extraction_cap_skipped_without_metadata() {
        assert!(resolve_range(&spec("0:00", None, true), Some(5 * 3600), LIMITS).is_err());
        assert!(resolve_range(&spec("0:00", None, true), None, LIMITS).is_ok());
    }
}
