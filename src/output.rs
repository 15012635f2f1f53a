//! Output shaping for LLM-friendly debugger results.
//!
//! Pure functions that take raw cdb output and produce structured,
//! token-efficient summaries: head/tail windowing, error-line extraction,
//! debugger prompt stripping, and human-readable elapsed-time display.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// The number of lines reserved for the "head" portion of windowed output.
const HEAD_LINES: usize = 10;

/// Patterns matching the failure indicators cdb and its extensions emit.
static ERROR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    let patterns = [
        r"(?i)\berror\b",
        r"(?i)\bfailed\b",
        r"(?i)\bfailure\b",
        r"(?i)\bunable to\b",
        r"(?i)\binvalid\b",
        r"(?i)\bcorrupt\b",
        r"(?i)\baccess violation\b",
        r"(?i)\bunresolved\b",
        r"(?i)symbols? could not be loaded",
    ];
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("invalid error pattern regex"))
        .collect()
});

/// A windowed view of command output, optimized for LLM token efficiency.
#[derive(Debug, Clone, Serialize)]
pub struct OutputWindow {
    /// First N lines of output (usually invocation context).
    pub head: Vec<String>,
    /// Last M lines of output (usually the result summary).
    pub tail: Vec<String>,
    /// Lines that matched error patterns, extracted from the full output.
    pub error_lines: Vec<String>,
    /// Total number of lines in the original output.
    pub total_lines: usize,
    /// Whether the output was truncated (head+tail < total).
    pub truncated: bool,
}

/// Window command output into head + tail sections.
///
/// If the output fits within `max_lines`, returns it as-is in `head` with an
/// empty `tail`. Otherwise splits into the first [`HEAD_LINES`] lines and the
/// remaining budget as a tail from the end.
#[must_use]
pub fn window(lines: &[String], max_lines: usize) -> OutputWindow {
    let total_lines = lines.len();

    if total_lines <= max_lines {
        return OutputWindow {
            head: lines.to_vec(),
            tail: Vec::new(),
            error_lines: extract_errors(lines),
            total_lines,
            truncated: false,
        };
    }

    let head_count = HEAD_LINES.min(max_lines);
    let tail_count = max_lines.saturating_sub(head_count);

    let head = lines[..head_count].to_vec();
    let tail = if tail_count > 0 {
        let start = total_lines.saturating_sub(tail_count);
        lines[start..].to_vec()
    } else {
        Vec::new()
    };

    OutputWindow {
        head,
        tail,
        error_lines: extract_errors(lines),
        total_lines,
        truncated: true,
    }
}

/// Extract lines that match common failure indicators.
#[must_use]
pub fn extract_errors(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|line| ERROR_PATTERNS.iter().any(|re| re.is_match(line)))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Debugger prompt stripping
// ---------------------------------------------------------------------------

/// Regex matching the cdb input prompt that can prefix echoed lines.
///
/// User-mode prompts look like `0:000> `, kernel-mode like `kd> ` or
/// `1: kd> `. The prompt appears glued to sentinel echoes when cdb writes the
/// prompt and the echo on the same line.
static CDB_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[0-9]+:[0-9]{3}(?::x86)?>|(?:[0-9]+: )?kd>)\s?").expect("invalid prompt regex")
});

/// Strip a leading cdb prompt and trailing line endings from a raw line.
#[must_use]
pub fn clean_line(raw: &str) -> String {
    let trimmed = raw.trim_end_matches(['\n', '\r']);
    CDB_PROMPT.replace(trimmed, "").into_owned()
}

// ---------------------------------------------------------------------------
// Elapsed-time display
// ---------------------------------------------------------------------------

/// Format elapsed seconds for heartbeat display: `"1h 3m 20s"` when at least
/// an hour, `"3m 20s"` when at least a minute, else `"20s"`.
#[must_use]
pub fn format_elapsed(secs: u64) -> String {
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
