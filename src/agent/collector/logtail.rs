//! Polling log tail with re-open on rotation, plus line parsers.
//!
//! Access lines are parsed as JSON when they begin with `{`, otherwise by
//! the combined-format regex. Error-log lines use the proxy error format.
//! Lines that match neither are still shipped, raw, so nothing is lost.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;

use crate::config::LogFormat;
use crate::proto::{LogRecord, LogType};

/// Combined log format:
/// `remote - user [time] "METHOD URI PROTO" status bytes "referer" "ua"`
/// with optional trailing `"xff" request_time request_id` extensions.
fn combined_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"^(?P<remote>\S+) \S+ \S+ \[(?P<time>[^\]]+)\] "(?P<method>\S+) (?P<uri>\S+)[^"]*" (?P<status>\d{3}) (?P<bytes>\d+|-)(?: "(?P<referer>[^"]*)" "(?P<ua>[^"]*)")?(?: "(?P<xff>[^"]*)")?(?: (?P<rt>\d+\.\d+))?(?: (?P<reqid>\S+))?"#,
        )
        .expect("combined regex compiles")
    })
}

/// Proxy error log: `2024/01/15 10:30:00 [error] 123#0: message`.
fn error_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<time>\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}) \[(?P<level>\w+)\] (?:\d+#\d+: )?(?P<message>.*)$",
        )
        .expect("error regex compiles")
    })
}

/// Parse one access-log line into a [`LogRecord`].
///
/// Lines beginning with `{` are always tried as JSON; other lines go
/// through the combined regex unless the configured format says the log
/// is pure JSON (then they ship raw). Never fails: an unrecognized line
/// becomes a raw record.
pub fn parse_access_line(line: &str, format: LogFormat) -> LogRecord {
    let trimmed = line.trim();
    if trimmed.starts_with('{') {
        if let Some(record) = parse_json_access(trimmed) {
            return record;
        }
    } else if format == LogFormat::Combined {
        if let Some(record) = parse_combined(trimmed) {
            return record;
        }
    }
    raw_record(trimmed, LogType::Access)
}

/// Parse one error-log line into a [`LogRecord`].
pub fn parse_error_line(line: &str) -> LogRecord {
    let trimmed = line.trim();
    if let Some(caps) = error_re().captures(trimmed) {
        let ts_unix = NaiveDateTime::parse_from_str(&caps["time"], "%Y/%m/%d %H:%M:%S")
            .map(|naive| naive.and_utc().timestamp())
            .unwrap_or_else(|_| Utc::now().timestamp());
        return LogRecord {
            ts_unix,
            log_type: Some(LogType::Error),
            level: Some(caps["level"].to_string()),
            message: Some(caps["message"].to_string()),
            ..LogRecord::default()
        };
    }
    raw_record(trimmed, LogType::Error)
}

fn raw_record(line: &str, log_type: LogType) -> LogRecord {
    LogRecord {
        ts_unix: Utc::now().timestamp(),
        log_type: Some(log_type),
        raw: Some(line.to_string()),
        ..LogRecord::default()
    }
}

fn parse_combined(line: &str) -> Option<LogRecord> {
    let caps = combined_re().captures(line)?;
    let ts_unix = DateTime::parse_from_str(&caps["time"], "%d/%b/%Y:%H:%M:%S %z")
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|_| Utc::now().timestamp());
    Some(LogRecord {
        ts_unix,
        log_type: Some(LogType::Access),
        remote_addr: Some(caps["remote"].to_string()),
        xff: caps.name("xff").map(|m| m.as_str().to_string()),
        method: Some(caps["method"].to_string()),
        uri: Some(caps["uri"].to_string()),
        status: caps["status"].parse().ok(),
        bytes: caps["bytes"].parse().ok(),
        request_time: caps.name("rt").and_then(|m| m.as_str().parse().ok()),
        referer: caps.name("referer").map(|m| m.as_str().to_string()),
        user_agent: caps.name("ua").map(|m| m.as_str().to_string()),
        request_id: caps.name("reqid").map(|m| m.as_str().to_string()),
        ..LogRecord::default()
    })
}

fn parse_json_access(line: &str) -> Option<LogRecord> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let obj = value.as_object()?;

    let get_str = |keys: &[&str]| -> Option<String> {
        keys.iter()
            .find_map(|k| obj.get(*k))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    let get_f64 = |keys: &[&str]| -> Option<f64> {
        keys.iter().find_map(|k| obj.get(*k)).and_then(|v| {
            v.as_f64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
    };
    let get_u64 = |keys: &[&str]| -> Option<u64> {
        keys.iter().find_map(|k| obj.get(*k)).and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
    };

    let ts_unix = get_f64(&["ts", "msec", "unix_time"])
        .map(|f| f as i64)
        .or_else(|| {
            get_str(&["time_iso8601", "time", "timestamp"])
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.timestamp())
        })
        .unwrap_or_else(|| Utc::now().timestamp());

    Some(LogRecord {
        ts_unix,
        log_type: Some(LogType::Access),
        remote_addr: get_str(&["remote_addr", "client"]),
        xff: get_str(&["http_x_forwarded_for", "xff"]),
        method: get_str(&["request_method", "method"]),
        uri: get_str(&["request_uri", "uri", "path"]),
        status: get_u64(&["status"]).map(|s| s as u16),
        bytes: get_u64(&["body_bytes_sent", "bytes_sent", "bytes"]),
        request_time: get_f64(&["request_time"]),
        upstream_connect_time: get_f64(&["upstream_connect_time"]),
        upstream_response_time: get_f64(&["upstream_response_time"]),
        referer: get_str(&["http_referer", "referer"]),
        user_agent: get_str(&["http_user_agent", "user_agent"]),
        request_id: get_str(&["request_id"]),
        ..LogRecord::default()
    })
}

/// Polling tail over one log file.
///
/// The first open seeks to EOF (history is not replayed). Rotation is
/// detected by inode change or file shrink; either re-opens from offset 0
/// so the start of the new file is not lost.
pub struct LogTailer {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    inode: u64,
    offset: u64,
}

impl LogTailer {
    /// Create a tailer for `path`. The file may not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reader: None,
            inode: 0,
            offset: 0,
        }
    }

    /// Read all complete new lines since the last poll.
    ///
    /// A missing file is not an error — it returns no lines and keeps
    /// trying on later polls.
    pub fn poll(&mut self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Vec::new());
        };

        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            self.offset += n as u64;
            if line.ends_with('\n') {
                let trimmed = line.trim_end().to_string();
                if !trimmed.is_empty() {
                    lines.push(trimmed);
                }
            } else {
                // Partial line without newline: rewind so the next poll
                // re-reads it once the writer finishes.
                self.offset -= n as u64;
                reader.seek(SeekFrom::Start(self.offset))?;
                break;
            }
        }
        Ok(lines)
    }

    fn ensure_open(&mut self) -> Result<()> {
        let meta = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(_) => {
                // File missing (rotation gap); drop the handle and retry later.
                self.reader = None;
                return Ok(());
            }
        };

        let rotated = self.reader.is_some() && (meta.ino() != self.inode || meta.len() < self.offset);
        if rotated {
            log::info!("[Tail] {} rotated, re-opening", self.path.display());
            self.reader = None;
        }

        if self.reader.is_none() {
            let mut file = File::open(&self.path)?;
            let start = if rotated || self.inode != 0 {
                0 // new file after rotation: read from the top
            } else {
                file.seek(SeekFrom::End(0))? // first open: skip history
            };
            file.seek(SeekFrom::Start(start))?;
            self.inode = meta.ino();
            self.offset = start;
            self.reader = Some(BufReader::new(file));
        }
        Ok(())
    }

    /// Tailed file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_combined_line_parses() {
        let line = r#"203.0.113.9 - - [15/Jan/2024:10:30:00 +0000] "GET /api/v1/items?page=2 HTTP/1.1" 200 1234 "https://example.com/" "Mozilla/5.0""#;
        let record = parse_access_line(line, LogFormat::Combined);
        assert_eq!(record.log_type, Some(LogType::Access));
        assert_eq!(record.remote_addr.as_deref(), Some("203.0.113.9"));
        assert_eq!(record.method.as_deref(), Some("GET"));
        assert_eq!(record.uri.as_deref(), Some("/api/v1/items?page=2"));
        assert_eq!(record.status, Some(200));
        assert_eq!(record.bytes, Some(1234));
        assert_eq!(record.user_agent.as_deref(), Some("Mozilla/5.0"));
        assert!(record.raw.is_none());
        assert_eq!(record.ts_unix, 1_705_314_600);
    }

    #[test]
    fn test_json_line_parses() {
        let line = r#"{"time_iso8601":"2024-01-15T10:30:00+00:00","remote_addr":"10.1.2.3","request_method":"POST","request_uri":"/submit","status":502,"body_bytes_sent":0,"request_time":"1.503","upstream_response_time":"1.500","http_user_agent":"curl/8.0","request_id":"abc123"}"#;
        let record = parse_access_line(line, LogFormat::Json);
        assert_eq!(record.status, Some(502));
        assert_eq!(record.request_time, Some(1.503));
        assert_eq!(record.upstream_response_time, Some(1.5));
        assert_eq!(record.request_id.as_deref(), Some("abc123"));
        assert_eq!(record.ts_unix, 1_705_314_600);
    }

    #[test]
    fn test_unparseable_line_ships_raw() {
        let record = parse_access_line("!! not a log line !!", LogFormat::Combined);
        assert_eq!(record.raw.as_deref(), Some("!! not a log line !!"));
        assert_eq!(record.log_type, Some(LogType::Access));
        assert!(record.status.is_none());
    }

    #[test]
    fn test_error_line_parses() {
        let line = r#"2024/01/15 10:30:00 [error] 4242#0: *17 connect() failed (111: Connection refused) while connecting to upstream"#;
        let record = parse_error_line(line);
        assert_eq!(record.log_type, Some(LogType::Error));
        assert_eq!(record.level.as_deref(), Some("error"));
        assert!(record
            .message
            .as_deref()
            .unwrap()
            .contains("Connection refused"));
        assert_eq!(record.ts_unix, 1_705_314_600);
    }

    #[test]
    fn test_tailer_skips_history_then_reads_new_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "old line\n").unwrap();

        let mut tailer = LogTailer::new(&path);
        assert!(tailer.poll().unwrap().is_empty());

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "new line").unwrap();
        assert_eq!(tailer.poll().unwrap(), vec!["new line".to_string()]);
    }

    #[test]
    fn test_tailer_holds_partial_line_until_complete() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "").unwrap();

        let mut tailer = LogTailer::new(&path);
        assert!(tailer.poll().unwrap().is_empty());

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "half").unwrap();
        assert!(tailer.poll().unwrap().is_empty());

        writeln!(file, " done").unwrap();
        assert_eq!(tailer.poll().unwrap(), vec!["half done".to_string()]);
    }

    #[test]
    fn test_tailer_reopens_on_rotation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "").unwrap();

        let mut tailer = LogTailer::new(&path);
        tailer.poll().unwrap();

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "before rotate").unwrap();
        assert_eq!(tailer.poll().unwrap().len(), 1);
        drop(file);

        // Rotate: move aside, create a fresh file with new content.
        std::fs::rename(&path, dir.path().join("access.log.1")).unwrap();
        std::fs::write(&path, "after rotate\n").unwrap();

        assert_eq!(tailer.poll().unwrap(), vec!["after rotate".to_string()]);
    }

    #[test]
    fn test_tailer_tolerates_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("not-yet.log");
        let mut tailer = LogTailer::new(&path);
        assert!(tailer.poll().unwrap().is_empty());

        std::fs::write(&path, "line\n").unwrap();
        // First successful open seeks to EOF; only later lines appear.
        assert!(tailer.poll().unwrap().is_empty());
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "tracked").unwrap();
        assert_eq!(tailer.poll().unwrap(), vec!["tracked".to_string()]);
    }
}
