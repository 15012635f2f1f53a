//! Merge compatible queued commands into one debugger round-trip.
//!
//! Batching cuts the per-command prompt overhead: several queued commands are
//! joined with separator echoes, executed as one synthesized command, and the
//! aggregated output is split back so each source command receives exactly its
//! own slice. Batching must never change the observable per-command result
//! contract when it succeeds.

use crate::command::CommandResult;
use crate::config::EngineConfig;
use crate::process::COMMAND_SEPARATOR;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// What the queue worker should dispatch next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchPlan {
    /// One command, passed through unchanged.
    Single { command_id: String, text: String },
    /// A synthesized command standing in for several queued ones.
    Batch {
        batch_id: String,
        text: String,
        source_ids: Vec<String>,
    },
}

/// Split failure: the separator count in the aggregated output did not match
/// the source count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnbatchMismatch {
    pub expected: usize,
    pub found: usize,
}

impl std::fmt::Display for UnbatchMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "batch output split mismatch: expected {} segments, found {}",
            self.expected, self.found
        )
    }
}

/// Plans batches and keeps the `(session, source) -> batch` reverse map.
pub struct BatchProcessor {
    config: Arc<EngineConfig>,
    /// session_id -> (source command id -> batch command id)
    mappings: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl BatchProcessor {
    #[must_use]
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self {
            config,
            mappings: Mutex::new(HashMap::new()),
        }
    }

    /// True when the command must never be merged (long-running or
    /// state-changing meta-commands from the exclusion list).
    #[must_use]
    pub fn is_excluded(&self, text: &str) -> bool {
        let trimmed = text.trim_start();
        self.config
            .batch_exclusions
            .iter()
            .any(|prefix| trimmed.starts_with(prefix.as_str()))
    }

    /// Decide what to dispatch from the front of the queue.
    ///
    /// `pending` is the FIFO prefix of `(command_id, text)` pairs;
    /// `alloc_id` mints a command id from the session's counter when a batch
    /// is synthesized. Input order is preserved in the merged text.
    pub fn plan(
        &self,
        session_id: &str,
        pending: &[(String, String)],
        alloc_id: impl FnOnce() -> String,
    ) -> DispatchPlan {
        let (first_id, first_text) = &pending[0];

        let single = DispatchPlan::Single {
            command_id: first_id.clone(),
            text: first_text.clone(),
        };

        if self.is_excluded(first_text) {
            return single;
        }

        // Mergeable prefix: stop at the first excluded command or the batch
        // size ceiling.
        let take = pending
            .iter()
            .take(self.config.max_batch_size)
            .take_while(|(_, text)| !self.is_excluded(text))
            .count();

        if take < self.config.min_batch_size {
            return single;
        }

        let sources = &pending[..take];
        let batch_id = alloc_id();
        let separator = format!("\n.echo {COMMAND_SEPARATOR}\n");
        let text = sources
            .iter()
            .map(|(_, text)| text.as_str())
            .collect::<Vec<_>>()
            .join(&separator);
        let source_ids: Vec<String> = sources.iter().map(|(id, _)| id.clone()).collect();

        let mut mappings = self.mappings.lock().expect("batch mappings poisoned");
        let session_map = mappings.entry(session_id.to_string()).or_default();
        for id in &source_ids {
            session_map.insert(id.clone(), batch_id.clone());
        }

        tracing::debug!(
            session = session_id,
            batch = %batch_id,
            merged = take,
            "merged queued commands into a batch"
        );

        DispatchPlan::Batch {
            batch_id,
            text,
            source_ids,
        }
    }

    /// Split aggregated batch output back into per-source results, in input
    /// order. Fails when the separator occurrences disagree with the source
    /// count.
    pub fn unbatch_results(
        aggregated: &str,
        source_ids: &[String],
    ) -> Result<Vec<CommandResult>, UnbatchMismatch> {
        let mut segments: Vec<Vec<&str>> = vec![Vec::new()];
        for line in aggregated.lines() {
            if line.trim() == COMMAND_SEPARATOR {
                segments.push(Vec::new());
            } else {
                segments.last_mut().expect("segments never empty").push(line);
            }
        }

        if segments.len() != source_ids.len() {
            return Err(UnbatchMismatch {
                expected: source_ids.len(),
                found: segments.len(),
            });
        }

        Ok(source_ids
            .iter()
            .zip(segments)
            .map(|(id, lines)| CommandResult {
                command_id: id.clone(),
                output: trim_blank_edges(&lines).join("\n"),
            })
            .collect())
    }

    /// Reverse lookup: the batch a source command was absorbed into.
    #[must_use]
    pub fn batch_command_id(&self, session_id: &str, source_id: &str) -> Option<String> {
        self.mappings
            .lock()
            .expect("batch mappings poisoned")
            .get(session_id)?
            .get(source_id)
            .cloned()
    }

    /// Drop all mappings for a closed session.
    pub fn clear_session(&self, session_id: &str) {
        self.mappings
            .lock()
            .expect("batch mappings poisoned")
            .remove(session_id);
    }
}

/// Strip leading/trailing blank lines a segment picked up around separators.
fn trim_blank_edges<'a>(lines: &[&'a str]) -> Vec<&'a str> {
    let start = lines
        .iter()
        .position(|l| !l.trim().is_empty())
        .unwrap_or(lines.len());
    let end = lines
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .map_or(start, |p| p + 1);
    lines[start..end].to_vec()
}
