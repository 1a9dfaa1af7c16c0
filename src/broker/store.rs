//! The result-store seam.
//!
//! Persistent storage is an external collaborator; the controller only
//! consumes this interface. `MemoryStore` is the reference implementation,
//! keeping the buffered-write/flush discipline of a real backend so that
//! reads only observe flushed writes.

use std::collections::HashMap;

use serde_json::{Map, Value};

/// Store interface keyed by run id. Writes are buffered; `flush` forces
/// visibility before a read.
pub trait Store: Send {
    fn save_metadata(&mut self, run_id: &str, metadata: Map<String, Value>);
    fn update_metadata(&mut self, run_id: &str, fields: Map<String, Value>);
    fn get_metadata(&mut self, run_id: &str) -> Map<String, Value>;
    fn add(&mut self, data: Map<String, Value>);
    fn flush(&mut self);
    fn get_counts(&mut self, run_id: &str) -> Map<String, Value>;
    fn get_data(&mut self, run_id: &str) -> Vec<Value>;
    fn get_urls(&mut self, run_id: &str) -> Map<String, Value>;
}

#[derive(Default)]
pub struct MemoryStore {
    pending: HashMap<String, Vec<Value>>,
    pending_metadata: HashMap<String, Map<String, Value>>,
    data: HashMap<String, Vec<Value>>,
    counts: HashMap<String, HashMap<String, u64>>,
    urls: HashMap<String, HashMap<String, u64>>,
    metadata: HashMap<String, Map<String, Value>>,
    dirty: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn save_metadata(&mut self, run_id: &str, metadata: Map<String, Value>) {
        self.pending_metadata.insert(run_id.to_owned(), metadata);
        self.dirty = true;
    }

    fn update_metadata(&mut self, run_id: &str, fields: Map<String, Value>) {
        let entry = self
            .pending_metadata
            .entry(run_id.to_owned())
            .or_insert_with(|| {
                self.metadata
                    .get(run_id)
                    .cloned()
                    .unwrap_or_default()
            });
        for (key, value) in fields {
            entry.insert(key, value);
        }
        self.dirty = true;
    }

    fn get_metadata(&mut self, run_id: &str) -> Map<String, Value> {
        self.metadata.get(run_id).cloned().unwrap_or_default()
    }

    fn add(&mut self, data: Map<String, Value>) {
        let run_id = data
            .get("run_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        self.pending
            .entry(run_id)
            .or_default()
            .push(Value::Object(data));
        self.dirty = true;
    }

    fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        for (run_id, entries) in self.pending.drain() {
            let counts = self.counts.entry(run_id.clone()).or_default();
            let urls = self.urls.entry(run_id.clone()).or_default();
            let stored = self.data.entry(run_id).or_default();
            for entry in entries {
                if let Some(data_type) = entry.get("data_type").and_then(Value::as_str) {
                    let count = counts.entry(data_type.to_owned()).or_insert(0);
                    *count = count.saturating_add(1);
                }
                if let Some(url) = entry.get("url").and_then(Value::as_str) {
                    let count = urls.entry(url.to_owned()).or_insert(0);
                    *count = count.saturating_add(1);
                }
                stored.push(entry);
            }
        }
        for (run_id, metadata) in self.pending_metadata.drain() {
            self.metadata.insert(run_id, metadata);
        }
        self.dirty = false;
    }

    fn get_counts(&mut self, run_id: &str) -> Map<String, Value> {
        self.counts
            .get(run_id)
            .map(|counts| {
                counts
                    .iter()
                    .map(|(data_type, count)| (data_type.clone(), Value::from(*count)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn get_data(&mut self, run_id: &str) -> Vec<Value> {
        self.data.get(run_id).cloned().unwrap_or_default()
    }

    fn get_urls(&mut self, run_id: &str) -> Map<String, Value> {
        self.urls
            .get(run_id)
            .map(|urls| {
                urls.iter()
                    .map(|(url, count)| (url.clone(), Value::from(*count)))
                    .collect()
            })
            .unwrap_or_default()
    }
}
