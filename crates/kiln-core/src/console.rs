//! Per-build console output.

use chrono::Utc;
use parking_lot::Mutex;
use std::fmt::Display;
use std::sync::Arc;

/// Append-only console log of one build. Cheap to clone; clones share the buffer.
#[derive(Debug, Clone, Default)]
pub struct Console {
    lines: Arc<Mutex<Vec<String>>>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn println(&self, line: impl Display) {
        self.lines.lock().push(line.to_string());
    }

    /// Record a caught error together with the step that raised it.
    pub fn error(&self, step: &str, err: impl Display) {
        self.println(format!("ERROR: step '{}' failed: {}", step, err));
    }

    /// Timestamped marker for lifecycle transitions.
    pub fn marker(&self, text: impl Display) {
        self.println(format!("[{}] {}", Utc::now().format("%H:%M:%S"), text));
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|l| l.contains(needle))
    }

    /// Whole log as text, one line per entry.
    pub fn text(&self) -> String {
        let lines = self.lines.lock();
        let mut out = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines.iter() {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}
