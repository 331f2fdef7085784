//! Logging collaborator
//!
//! Every job transition, error and retry is recorded through a [`Journal`]
//! handed to the downloader at construction. Recording is infallible from the
//! caller's side: implementations swallow their own failures.

use log::Level;
use std::sync::{Arc, Mutex};

pub trait Journal: Send + Sync {
    fn record(&self, level: Level, message: &str, context: &[(&str, String)]);
}

/// Forwards entries to the `log` facade
#[derive(Debug, Clone, Default)]
pub struct LogJournal;

impl Journal for LogJournal {
    fn record(&self, level: Level, message: &str, context: &[(&str, String)]) {
        if context.is_empty() {
            log::log!(target: "haul", level, "{}", message);
        } else {
            let fields = context
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(" ");
            log::log!(target: "haul", level, "{} {}", message, fields);
        }
    }
}

/// A recorded journal entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub level: Level,
    pub message: String,
    pub context: Vec<(String, String)>,
}

/// Keeps entries in memory, for tests and diagnostics
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Entries whose message contains `needle`
    pub fn matching(&self, needle: &str) -> Vec<JournalEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.message.contains(needle))
            .collect()
    }
}

impl Journal for MemoryJournal {
    fn record(&self, level: Level, message: &str, context: &[(&str, String)]) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(JournalEntry {
                level,
                message: message.to_string(),
                context: context.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            });
        }
    }
}
