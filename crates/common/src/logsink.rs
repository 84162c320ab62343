// Log-sink collaborator for tunnelkeep
//
// The supervisor appends `<timestamp>|<level>|<message>` lines here in
// addition to its tracing output. Storage mechanics are the collaborator's
// business; this crate only defines the contract and a bounded in-memory
// ring used by the daemon and tests.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Append-and-query log line store.
pub trait LogSink: Send + Sync {
    fn append(&self, line: &str);

    /// The most recent `max_lines` lines, oldest first.
    fn load_recent(&self, max_lines: usize) -> Vec<String>;

    /// A page of lines counted backwards from the end. `offset_from_end` 0
    /// returns the newest page.
    fn load_page(&self, offset_from_end: usize, page_size: usize) -> Vec<String>;
}

/// Bounded ring buffer of recent log lines.
pub struct MemoryLogSink {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl MemoryLogSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }
}

impl Default for MemoryLogSink {
    fn default() -> Self {
        Self::new(200)
    }
}

impl LogSink for MemoryLogSink {
    fn append(&self, line: &str) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    fn load_recent(&self, max_lines: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap();
        let skip = lines.len().saturating_sub(max_lines);
        lines.iter().skip(skip).cloned().collect()
    }

    fn load_page(&self, offset_from_end: usize, page_size: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap();
        let end = lines.len().saturating_sub(offset_from_end);
        let start = end.saturating_sub(page_size);
        lines.iter().skip(start).take(end - start).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: usize) -> MemoryLogSink {
        let sink = MemoryLogSink::new(100);
        for i in 0..n {
            sink.append(&format!("line-{i}"));
        }
        sink
    }

    #[test]
    fn test_ring_drops_oldest() {
        let sink = MemoryLogSink::new(3);
        for i in 0..5 {
            sink.append(&format!("line-{i}"));
        }
        assert_eq!(sink.load_recent(10), vec!["line-2", "line-3", "line-4"]);
    }

    #[test]
    fn test_load_recent_limits() {
        let sink = filled(10);
        assert_eq!(sink.load_recent(2), vec!["line-8", "line-9"]);
    }

    #[test]
    fn test_load_page_from_end() {
        let sink = filled(10);
        assert_eq!(sink.load_page(0, 3), vec!["line-7", "line-8", "line-9"]);
        assert_eq!(sink.load_page(3, 3), vec!["line-4", "line-5", "line-6"]);
        // past the beginning returns what is left
        assert_eq!(sink.load_page(9, 3), vec!["line-0"]);
        assert!(sink.load_page(10, 3).is_empty());
    }
}
