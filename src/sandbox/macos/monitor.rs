//! Audit ingest: violation parsing from the macOS unified log stream.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::error::Result;
use crate::sandbox::macos::profile::decode_log_tag;
use crate::violation::{ViolationEvent, ViolationKind, ViolationSink};

/// Audit lines longer than this are truncated before parsing; the stream
/// may carry adversarial input.
const MAX_AUDIT_LINE: usize = 4096;

/// `cat(1234) deny(1) file-read-data /t/bad`
static DENY_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<proc>\S+)\((?P<pid>\d+)\)\s+deny(?:\(\d+\))?\s+(?P<op>\S+)\s*(?P<subject>.*)")
        .expect("static audit regex")
});

/// A parsed audit event, before sink attribution.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAuditLine {
    pub kind: ViolationKind,
    pub subject: String,
    pub pid: Option<u32>,
}

/// Parse one audit line. Unknown lines yield `None`; the caller counts
/// malformed input separately and never stops the stream.
pub fn parse_audit_line(line: &str) -> Option<ParsedAuditLine> {
    let line = if line.len() > MAX_AUDIT_LINE {
        // char_indices keeps the cut on a boundary
        match line.char_indices().nth(MAX_AUDIT_LINE) {
            Some((idx, _)) => &line[..idx],
            None => line,
        }
    } else {
        line
    };

    if !line.contains("deny") {
        return None;
    }

    let captures = DENY_LINE.captures(line)?;
    let op = captures.name("op")?.as_str();
    let subject = captures
        .name("subject")
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    let pid = captures
        .name("pid")
        .and_then(|m| m.as_str().parse::<u32>().ok());

    let kind = if op.starts_with("file-read") {
        ViolationKind::FsRead
    } else if op.starts_with("file-write") {
        ViolationKind::FsWrite
    } else if op.starts_with("network") {
        ViolationKind::Network
    } else if op.starts_with("system-socket") || op.starts_with("syscall") {
        ViolationKind::SyscallDenied
    } else {
        ViolationKind::Other
    };

    Some(ParsedAuditLine { kind, subject, pid })
}

/// Streaming monitor for one wrapped execution, following the unified log
/// filtered by the execution's trace tag.
pub struct LogMonitor {
    child: Option<Child>,
    pub malformed_lines: Arc<AtomicU64>,
}

impl LogMonitor {
    /// Start following the audit stream for a trace tag, feeding parsed
    /// violations into the sink.
    pub async fn start(log_tag: String, sink: ViolationSink) -> Result<Self> {
        let mut child = Command::new("log")
            .args([
                "stream",
                "--predicate",
                &format!(
                    "subsystem == 'com.apple.sandbox' AND eventMessage CONTAINS '{log_tag}'"
                ),
                "--style",
                "compact",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let malformed_lines = Arc::new(AtomicU64::new(0));
        let malformed = malformed_lines.clone();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let reader = BufReader::new(stdout);
                let mut lines = reader.lines();

                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            ingest_line(&line, &log_tag, &sink, &malformed);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            // A bad chunk must not terminate ingest.
                            tracing::warn!("audit stream read error: {}", e);
                            malformed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }

                tracing::debug!("audit stream for tag closed");
            });
        }

        Ok(Self {
            child: Some(child),
            malformed_lines,
        })
    }

    /// Stop following the stream.
    pub async fn stop(&mut self) {
        if let Some(ref mut child) = self.child {
            let _ = child.kill().await;
        }
    }
}

impl Drop for LogMonitor {
    fn drop(&mut self) {
        if let Some(ref mut child) = self.child {
            let _ = child.start_kill();
        }
    }
}

fn ingest_line(line: &str, log_tag: &str, sink: &ViolationSink, malformed: &AtomicU64) {
    if !line.contains(log_tag) {
        return;
    }

    let Some(parsed) = parse_audit_line(line) else {
        malformed.fetch_add(1, Ordering::Relaxed);
        return;
    };

    let mut event = ViolationEvent::new(parsed.kind, parsed.subject, line.to_string());
    if let Some(pid) = parsed.pid {
        event = event.with_pid(pid);
    }
    if let Some((execution_id, encoded)) = decode_log_tag(log_tag) {
        event = event.with_execution(execution_id).with_encoded_command(encoded);
    }

    sink.record(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::violation::SandboxViolationStore;

    #[test]
    fn test_parse_read_violation() {
        let parsed =
            parse_audit_line("Sandbox: cat(1234) deny(1) file-read-data /t/bad").unwrap();
        assert_eq!(parsed.kind, ViolationKind::FsRead);
        assert_eq!(parsed.subject, "/t/bad");
        assert_eq!(parsed.pid, Some(1234));
    }

    #[test]
    fn test_parse_write_violation() {
        let parsed =
            parse_audit_line("Sandbox: sh(99) deny file-write-create /etc/hosts").unwrap();
        assert_eq!(parsed.kind, ViolationKind::FsWrite);
        assert_eq!(parsed.subject, "/etc/hosts");
        assert_eq!(parsed.pid, Some(99));
    }

    #[test]
    fn test_parse_network_violation() {
        let parsed =
            parse_audit_line("Sandbox: curl(7) deny(1) network-outbound 1.2.3.4:443").unwrap();
        assert_eq!(parsed.kind, ViolationKind::Network);
        assert_eq!(parsed.subject, "1.2.3.4:443");
    }

    #[test]
    fn test_unknown_lines_skipped() {
        assert!(parse_audit_line("totally unrelated log chatter").is_none());
        assert!(parse_audit_line("").is_none());
        assert!(parse_audit_line("deny with no structure").is_none());
    }

    #[test]
    fn test_long_line_truncated_not_fatal() {
        let mut line = String::from("Sandbox: cat(1) deny(1) file-read-data /t/bad");
        line.push_str(&"x".repeat(10 * MAX_AUDIT_LINE));
        let parsed = parse_audit_line(&line).unwrap();
        assert_eq!(parsed.kind, ViolationKind::FsRead);
    }

    #[test]
    fn test_binary_bytes_tolerated() {
        let line = format!("Sandbox: cat(1) deny(1) file-read-data /t/\u{fffd}\u{0001}bad");
        let parsed = parse_audit_line(&line);
        assert!(parsed.is_some());
    }

    #[test]
    fn test_ingest_attributes_execution() {
        use crate::sandbox::macos::profile::generate_log_tag;
        use crate::violation::encode_command;
        use std::sync::Arc;

        let store = Arc::new(SandboxViolationStore::new());
        let sink = ViolationSink::new(store.clone(), None);
        let malformed = AtomicU64::new(0);

        let encoded = encode_command("cat /t/bad");
        let tag = generate_log_tag(3, &encoded);
        let line = format!("Sandbox: cat(1234) deny(1) file-read-data /t/bad [{tag}]");
        ingest_line(&line, &tag, &sink, &malformed);

        let violations = store.get_violations(None);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::FsRead);
        assert_eq!(violations[0].execution_id, Some(3));
        assert_eq!(violations[0].encoded_command, encoded);
        assert_eq!(malformed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_ingest_counts_malformed_tagged_lines() {
        use std::sync::Arc;

        let store = Arc::new(SandboxViolationStore::new());
        let sink = ViolationSink::new(store.clone(), None);
        let malformed = AtomicU64::new(0);

        ingest_line("TAG but nothing parseable", "TAG", &sink, &malformed);
        assert_eq!(malformed.load(Ordering::Relaxed), 1);
        assert!(store.get_violations(None).is_empty());
    }
}
