//! Log stream processing for captured session output.
//!
//! Output is captured by polling the multiplexer, so each poll returns a
//! snapshot of the pane rather than new bytes. The processor diffs
//! consecutive snapshots, buffers the trailing partial line, and turns every
//! complete line into a classified [`LogRecord`].

use fleet_core::{AgentId, LogLevel, LogRecord, SessionId};

/// Per-session pipeline from pane snapshots to log records.
#[derive(Debug)]
pub struct LogStreamProcessor {
    agent_id: AgentId,
    session_id: SessionId,
    source: String,
    tags: Vec<String>,
    /// Text after the last newline; never emitted until completed
    partial: String,
    /// Complete lines of the previous snapshot, up to its last newline
    last_capture: String,
}

/// Records produced by one ingest, with counts for session metrics.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestResult {
    pub records: Vec<LogRecord>,
    pub lines: u64,
    pub errors: u64,
}

impl LogStreamProcessor {
    pub fn new(agent_id: AgentId, session_id: SessionId, source: impl Into<String>) -> Self {
        let tags = vec!["agent".to_string(), format!("agent:{agent_id}")];
        Self {
            agent_id,
            session_id,
            source: source.into(),
            tags,
            partial: String::new(),
            last_capture: String::new(),
        }
    }

    /// Ingests a full pane snapshot, processing only what is new since the
    /// previous snapshot.
    ///
    /// The last line of a snapshot is held back. The next snapshot may redraw
    /// it (progress bars, prompts), so it is replaced rather than appended to.
    pub fn ingest_capture(&mut self, capture: &str) -> IngestResult {
        let current = capture.trim_end();
        let (complete, last_line) = match current.rfind('\n') {
            Some(idx) => current.split_at(idx + 1),
            None => ("", current),
        };

        let delta = capture_delta(&self.last_capture, complete).to_string();
        self.last_capture = complete.to_string();

        self.partial.clear();
        let result = self.ingest(&delta);
        self.partial = last_line.to_string();
        result
    }

    /// Ingests a raw chunk of output.
    pub fn ingest(&mut self, chunk: &str) -> IngestResult {
        self.partial.push_str(chunk);
        let Some(last_newline) = self.partial.rfind('\n') else {
            return IngestResult::default();
        };

        let tail = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, tail);

        let mut result = IngestResult::default();
        for line in complete.lines() {
            let line = line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            let record = LogRecord::from_line(
                &self.source,
                &self.agent_id,
                &self.session_id,
                line,
                &self.tags,
            );
            result.lines += 1;
            if record.level == LogLevel::Error {
                result.errors += 1;
            }
            result.records.push(record);
        }
        result
    }

    /// Text held back because its line is not yet complete.
    pub fn pending(&self) -> &str {
        &self.partial
    }
}

/// Returns the part of `current` not already present in `previous`.
///
/// Handles growth at the end (`current` extends `previous`) and scrolling
/// (a line-aligned suffix of `previous` is a prefix of `current`). When the
/// snapshots share nothing the whole of `current` is new.
pub fn capture_delta<'a>(previous: &str, current: &'a str) -> &'a str {
    if previous.is_empty() {
        return current;
    }

    let line_starts = std::iter::once(0).chain(
        previous
            .match_indices('\n')
            .map(|(idx, _)| idx + 1)
            .filter(|idx| *idx < previous.len()),
    );

    for start in line_starts {
        let Some(suffix) = previous.get(start..) else {
            continue;
        };
        if current.starts_with(suffix) {
            return current.get(suffix.len()..).unwrap_or_default();
        }
    }

    current
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> LogStreamProcessor {
        LogStreamProcessor::new(AgentId::new("a1"), SessionId::new("s1"), "tmux")
    }

    fn messages(result: &IngestResult) -> Vec<&str> {
        result.records.iter().map(|r| r.message.as_str()).collect()
    }

    #[test]
    fn test_partial_lines_are_buffered() {
        let mut p = processor();
        let first = p.ingest("compiling\nbuil");
        assert_eq!(messages(&first), vec!["compiling"]);
        assert_eq!(p.pending(), "buil");

        let second = p.ingest("d failed\n");
        assert_eq!(messages(&second), vec!["build failed"]);
        assert_eq!(second.errors, 1);
        assert_eq!(p.pending(), "");
    }

    #[test]
    fn test_no_record_without_newline() {
        let mut p = processor();
        assert!(p.ingest("waiting for input").records.is_empty());
    }

    #[test]
    fn test_levels_and_tags() {
        let mut p = processor();
        let result = p.ingest("Warning: slow\n[debug] tick\nok\n\n");
        let levels: Vec<LogLevel> = result.records.iter().map(|r| r.level).collect();
        assert_eq!(levels, vec![LogLevel::Warn, LogLevel::Debug, LogLevel::Info]);
        assert_eq!(result.lines, 3);
        assert!(result.records[0].tags.contains(&"agent:a1".to_string()));
    }

    #[test]
    fn test_capture_delta_growth() {
        assert_eq!(capture_delta("a\nb", "a\nb\nc"), "\nc");
        assert_eq!(capture_delta("", "a\nb"), "a\nb");
        assert_eq!(capture_delta("a\nb", "a\nb"), "");
    }

    #[test]
    fn test_capture_delta_scroll() {
        assert_eq!(capture_delta("a\nb\nc", "b\nc\nd"), "\nd");
        assert_eq!(capture_delta("a\nb", "x\ny"), "x\ny");
    }

    #[test]
    fn test_snapshots_do_not_duplicate() {
        let mut p = processor();
        let first = p.ingest_capture("$ run\nstep 1\n\n\n");
        // "step 1" is the last line, so it waits for the next snapshot
        assert_eq!(messages(&first), vec!["$ run"]);

        let second = p.ingest_capture("$ run\nstep 1\nstep 2\n\n");
        assert_eq!(messages(&second), vec!["step 1"]);

        let third = p.ingest_capture("$ run\nstep 1\nstep 2\n");
        assert!(third.records.is_empty());
    }

    #[test]
    fn test_redrawn_last_line_is_replaced() {
        let mut p = processor();
        let first = p.ingest_capture("line1\nprogress 10%\n");
        assert_eq!(messages(&first), vec!["line1"]);
        assert_eq!(p.pending(), "progress 10%");

        let second = p.ingest_capture("line1\nprogress 20%\ndone\n");
        assert_eq!(messages(&second), vec!["progress 20%"]);
        assert_eq!(p.pending(), "done");

        // Redrawn in place again without completing
        let third = p.ingest_capture("line1\nprogress 20%\nretrying");
        assert!(third.records.is_empty());
        assert_eq!(p.pending(), "retrying");
    }

    #[test]
    fn test_scrolled_snapshot_emits_only_new_lines() {
        let mut p = processor();
        p.ingest_capture("a\nb\nc\n$");
        let scrolled = p.ingest_capture("b\nc\nd\n$");
        assert_eq!(messages(&scrolled), vec!["d"]);
    }
}
