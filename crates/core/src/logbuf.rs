// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal line buffer.
//!
//! Raw PTY bytes are split into lines for durable log persistence. The
//! buffer is bounded: long lines are truncated and, when the pending queue
//! overflows, the oldest lines are evicted and counted.

use std::collections::VecDeque;

/// Maximum persisted length of a single line, in bytes.
pub const MAX_LINE_LEN: usize = 8_000;

/// Maximum number of lines buffered before drop-oldest kicks in.
pub const MAX_PENDING_LINES: usize = 5_000;

/// Lines inserted per storage batch.
pub const FLUSH_BATCH_SIZE: usize = 100;

/// Interval between flush ticks.
pub const FLUSH_INTERVAL_MS: u64 = 1_000;

/// Split a chunk into complete lines plus the retained partial.
///
/// `\r\n` and bare `\r` are normalized to `\n` before splitting; empty
/// segments are dropped from the complete lines. The returned partial is
/// the text after the last newline (possibly empty).
pub fn split_chunk(partial: &str, chunk: &str) -> (Vec<String>, String) {
    let mut combined = String::with_capacity(partial.len() + chunk.len());
    combined.push_str(partial);
    combined.push_str(chunk);
    let normalized = combined.replace("\r\n", "\n").replace('\r', "\n");

    let mut segments: Vec<&str> = normalized.split('\n').collect();
    // `split` always yields at least one segment.
    let new_partial = segments.pop().unwrap_or("").to_string();
    let lines = segments
        .into_iter()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    (lines, new_partial)
}

/// Truncate a line to at most `max` bytes, respecting char boundaries.
fn truncate_to_bytes(line: &str, max: usize) -> &str {
    if line.len() <= max {
        return line;
    }
    let mut end = max;
    while end > 0 && !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

/// Append a line to `pending`, truncating it and evicting from the head
/// when the queue exceeds `max_pending`. Returns the number of evictions.
pub fn append_line(
    pending: &mut VecDeque<String>,
    line: &str,
    max_len: usize,
    max_pending: usize,
) -> u64 {
    pending.push_back(truncate_to_bytes(line, max_len).to_string());
    let mut dropped = 0;
    while pending.len() > max_pending {
        pending.pop_front();
        dropped += 1;
    }
    dropped
}

/// Bounded line accumulator between flushes.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: VecDeque<String>,
    partial: String,
    dropped: u64,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw PTY bytes. Invalid UTF-8 is replaced, never dropped.
    pub fn push_chunk(&mut self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        let (lines, partial) = split_chunk(&self.partial, &text);
        self.partial = partial;
        for line in &lines {
            self.dropped += append_line(&mut self.pending, line, MAX_LINE_LEN, MAX_PENDING_LINES);
        }
    }

    /// Promote the trailing partial to a line of its own (forced drain).
    pub fn flush_partial(&mut self) {
        if self.partial.is_empty() {
            return;
        }
        let partial = std::mem::take(&mut self.partial);
        self.dropped += append_line(&mut self.pending, &partial, MAX_LINE_LEN, MAX_PENDING_LINES);
    }

    /// Remove and return up to `n` lines from the head.
    pub fn take_batch(&mut self, n: usize) -> Vec<String> {
        let take = n.min(self.pending.len());
        self.pending.drain(..take).collect()
    }

    /// Put a failed batch back at the head, preserving order, so the next
    /// flush retries it.
    pub fn unshift_batch(&mut self, lines: Vec<String>) {
        for line in lines.into_iter().rev() {
            self.pending.push_front(line);
        }
    }

    /// Drop everything, partial included. The dropped counter is reset too:
    /// a discarded buffer has nothing left worth warning about.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.partial.clear();
        self.dropped = 0;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Read and reset the dropped-lines counter.
    pub fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }
}

#[cfg(test)]
#[path = "logbuf_tests.rs"]
mod tests;
