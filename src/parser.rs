/// SSM agent log line parsing.
///
/// Only `ssm-session-worker` lines are of interest:
/// `2023-11-17 07:30:12 INFO [ssm-session-worker] [<session-id>] [<tag>] <message>`
/// where the bracketed tag is optional and discarded.
use chrono::{NaiveDateTime, Timelike};
use regex::Regex;
use std::sync::LazyLock;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static SESSION_WORKER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<timestamp>\S+ \S+) (?P<level>\S+) \[ssm-session-worker\] \[(?P<session_id>\S+)\] (?:\[.*\] )?(?P<message>.*)$",
    )
    .unwrap()
});

/// One matched session-worker line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: NaiveDateTime,
    pub level: String,
    pub session_id: String,
    pub message: String,
}

/// Fixed-width `YYYY-MM-DD HH:MM:SS`; only the hour may drop its leading zero.
static TIMESTAMP_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2} \d{1,2}:\d{2}:\d{2}$").unwrap());

/// A line matched the grammar but its timestamp is not a valid date/time.
#[derive(Debug)]
pub enum ParseError {
    Timestamp {
        raw: String,
        /// `None` when the token has the wrong shape or names a leap second.
        source: Option<chrono::ParseError>,
    },
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Timestamp {
                raw,
                source: Some(source),
            } => write!(f, "invalid log timestamp {:?}: {}", raw, source),
            ParseError::Timestamp { raw, source: None } => {
                write!(f, "invalid log timestamp {:?}: expected YYYY-MM-DD HH:MM:SS", raw)
            }
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ParseError::Timestamp { source, .. } => source
                .as_ref()
                .map(|e| e as &(dyn std::error::Error + 'static)),
        }
    }
}

fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, ParseError> {
    let invalid = |source| ParseError::Timestamp {
        raw: raw.to_string(),
        source,
    };
    if !TIMESTAMP_SHAPE.is_match(raw) {
        return Err(invalid(None));
    }
    let timestamp =
        NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).map_err(|e| invalid(Some(e)))?;
    // chrono encodes second 60 as a nanosecond overflow.
    if timestamp.nanosecond() >= 1_000_000_000 {
        return Err(invalid(None));
    }
    Ok(timestamp)
}

impl LogEntry {
    /// Parse one line. `Ok(None)` means the line is not a session-worker line
    /// and should be skipped.
    pub fn parse(line: &str) -> Result<Option<LogEntry>, ParseError> {
        let Some(caps) = SESSION_WORKER_LINE.captures(line) else {
            return Ok(None);
        };

        let timestamp = parse_timestamp(&caps["timestamp"])?;

        Ok(Some(LogEntry {
            timestamp,
            level: caps["level"].to_string(),
            session_id: caps["session_id"].to_string(),
            message: caps["message"].to_string(),
        }))
    }

    /// Whether this line reports the end of its session.
    pub fn is_session_closed(&self) -> bool {
        self.level.eq_ignore_ascii_case("INFO")
            && self
                .message
                .to_lowercase()
                .contains("session worker closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 11, 17)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_parse_plain_message() {
        let entry = LogEntry::parse(
            "2023-11-17 07:45:32 INFO [ssm-session-worker] [ecs-execute-command-02f7755870b50f125] Session worker closed",
        )
        .unwrap()
        .unwrap();
        assert_eq!(entry.timestamp, ts(7, 45, 32));
        assert_eq!(entry.level, "INFO");
        assert_eq!(entry.session_id, "ecs-execute-command-02f7755870b50f125");
        assert_eq!(entry.message, "Session worker closed");
        assert!(entry.is_session_closed());
    }

    #[test]
    fn test_parse_discards_tag() {
        let entry = LogEntry::parse(
            "2023-11-17 07:30:05 INFO [ssm-session-worker] [ecs-execute-command-0a1] [DataBackend] Initiating websocket connection",
        )
        .unwrap()
        .unwrap();
        assert_eq!(entry.session_id, "ecs-execute-command-0a1");
        assert_eq!(entry.message, "Initiating websocket connection");
        assert!(!entry.is_session_closed());
    }

    #[test]
    fn test_non_matching_lines_are_skipped() {
        for line in [
            "",
            "random text",
            "2023-11-17 07:30:00 INFO [ssm-agent-worker] Entering SSM Agent Worker loop",
            "2023-11-17 07:30:00 INFO [ssm-session-worker] missing id brackets",
            "2023-11-17 07:30:00 INFO [ssm-session-worker] [] empty id",
        ] {
            assert!(LogEntry::parse(line).unwrap().is_none(), "{line:?}");
        }
    }

    #[test]
    fn test_bad_timestamp_is_an_error() {
        let err = LogEntry::parse(
            "2023-13-45 99:00:00 INFO [ssm-session-worker] [abc] hello",
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::Timestamp { .. }));
        assert!(err.to_string().contains("2023-13-45 99:00:00"));

        for bad in ["2023-1-5 07:00:00", "2023-11-17 07:0:0", "2023-11-17 07:45:60"] {
            let line = format!("{bad} INFO [ssm-session-worker] [abc] hello");
            match LogEntry::parse(&line) {
                Err(ParseError::Timestamp { raw, source: None }) => assert_eq!(raw, bad),
                other => panic!("{line:?} parsed as {other:?}"),
            }
        }
    }

    #[test]
    fn test_single_digit_hour_is_accepted() {
        let entry = LogEntry::parse("2023-11-17 7:45:00 INFO [ssm-session-worker] [abc] hello")
            .unwrap()
            .unwrap();
        assert_eq!(entry.timestamp, ts(7, 45, 0));
    }

    #[test]
    fn test_closed_detection_is_case_insensitive() {
        let entry = LogEntry::parse(
            "2023-11-17 07:45:32 info [ssm-session-worker] [abc] [Shell] SESSION WORKER CLOSED for good",
        )
        .unwrap()
        .unwrap();
        assert!(entry.is_session_closed());
    }

    #[test]
    fn test_closed_requires_info_level() {
        let entry = LogEntry::parse(
            "2023-11-17 07:45:32 ERROR [ssm-session-worker] [abc] Session worker closed",
        )
        .unwrap()
        .unwrap();
        assert!(!entry.is_session_closed());
    }

    #[test]
    fn test_greedy_tag_swallows_later_brackets() {
        let entry = LogEntry::parse(
            "2023-11-17 07:45:32 DEBUG [ssm-session-worker] [abc] [DataBackend] got [ack] back",
        )
        .unwrap()
        .unwrap();
        assert_eq!(entry.message, "back");
    }
}
