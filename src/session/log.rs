//! Session Output Log
//!
//! Append-only, per-session record of everything shown for a session. It backs
//! both live rendering and plain-text export.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::LogKind;

/// One rendered line of a session log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Position in the log, starting at 1, strictly increasing and gap-free
    pub seq: u64,
    pub kind: LogKind,
    pub text: String,
    /// Connect attempt this line belongs to, starting at 0
    pub segment: u32,
    pub logged_at: DateTime<Utc>,
}

/// Append-only log with redelivery protection for server frames
#[derive(Debug, Clone)]
pub struct OutputLog {
    lines: Vec<LogLine>,
    next_seq: u64,
    segment: u32,
    /// Highest server `seq` applied on the current channel connection
    remote_high_water: Option<u64>,
}

impl OutputLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self {
            lines: Vec::new(),
            next_seq: 1,
            segment: 0,
            remote_high_water: None,
        }
    }

    /// Append a line. This is the only way lines enter the log.
    pub fn append(&mut self, kind: LogKind, text: impl Into<String>) -> &LogLine {
        let line = LogLine {
            seq: self.next_seq,
            kind,
            text: text.into(),
            segment: self.segment,
            logged_at: Utc::now(),
        };
        self.next_seq += 1;
        self.lines.push(line);
        &self.lines[self.lines.len() - 1]
    }

    /// Begin a new segment for a fresh connect attempt. Earlier lines are kept.
    pub fn start_segment(&mut self) {
        if !self.lines.is_empty() {
            self.segment += 1;
        }
    }

    /// Record a server frame sequence number.
    ///
    /// Returns false when `seq` was already applied (or is older than the last
    /// applied frame), in which case the frame must be dropped.
    pub fn accept_remote(&mut self, seq: u64) -> bool {
        match self.remote_high_water {
            Some(high) if seq <= high => false,
            _ => {
                self.remote_high_water = Some(seq);
                true
            }
        }
    }

    /// Forget server sequence numbers; the next channel connection restarts them
    pub fn reset_remote(&mut self) {
        self.remote_high_water = None;
    }

    /// All lines in insertion order
    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Commands sent on this session, oldest first
    pub fn commands(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter(|l| l.kind == LogKind::Prompt)
            .map(|l| l.text.strip_prefix("$ ").unwrap_or(&l.text).to_string())
            .collect()
    }

    /// Render the whole log as plain text, one entry per line, in insertion order
    pub fn export(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&line.text);
            if !line.text.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new()
    }
}
