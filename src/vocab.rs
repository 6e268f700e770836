//! Vocabulary collaborator seam.
//!
//! The UI owns vocabulary persistence; the core keeps an in-memory mirror
//! used for spoken→written replacement and answers the opaque
//! `VOCABULARY_API` RPC against it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One spoken→written rewrite rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyEntry {
    pub spoken: String,
    pub written: String,
}

/// In-memory vocabulary mirror.
#[derive(Debug, Default, Clone)]
pub struct VocabularyStore {
    entries: Vec<VocabularyEntry>,
}

impl VocabularyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[VocabularyEntry] {
        &self.entries
    }

    pub fn replace_all(&mut self, entries: Vec<VocabularyEntry>) {
        self.entries = entries;
    }

    /// Insert or update by spoken form (case-insensitive key).
    pub fn upsert(&mut self, entry: VocabularyEntry) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.spoken.eq_ignore_ascii_case(&entry.spoken))
        {
            existing.written = entry.written;
        } else {
            self.entries.push(entry);
        }
    }

    pub fn remove(&mut self, spoken: &str) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|entry| !entry.spoken.eq_ignore_ascii_case(spoken));
        self.entries.len() != before
    }

    /// Answer one RPC payload. Unknown operations return an error object
    /// rather than failing the session.
    pub fn handle_request(&mut self, payload: &Value) -> Value {
        match payload.get("op").and_then(Value::as_str) {
            Some("list") => json!({ "ok": true, "entries": self.entries }),
            Some("add") => {
                let entry: Result<VocabularyEntry, _> =
                    serde_json::from_value(payload.get("entry").cloned().unwrap_or(Value::Null));
                match entry {
                    Ok(entry) if !entry.spoken.trim().is_empty() => {
                        self.upsert(entry);
                        json!({ "ok": true, "count": self.entries.len() })
                    }
                    _ => json!({ "ok": false, "error": "invalid entry" }),
                }
            }
            Some("remove") => {
                let spoken = payload.get("spoken").and_then(Value::as_str).unwrap_or("");
                let removed = self.remove(spoken);
                json!({ "ok": removed, "count": self.entries.len() })
            }
            Some(other) => json!({ "ok": false, "error": format!("unknown op '{other}'") }),
            None => json!({ "ok": false, "error": "missing op" }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_add_list_remove_round_trip() {
        let mut store = VocabularyStore::new();
        let added = store.handle_request(&json!({
            "op": "add",
            "entry": { "spoken": "q d", "written": "q.d." }
        }));
        assert_eq!(added["ok"], true);

        let listed = store.handle_request(&json!({ "op": "list" }));
        assert_eq!(listed["entries"][0]["written"], "q.d.");

        let removed = store.handle_request(&json!({ "op": "remove", "spoken": "Q D" }));
        assert_eq!(removed["ok"], true);
        assert_eq!(removed["count"], 0);
    }

    #[test]
    fn upsert_overwrites_by_spoken_key() {
        let mut store = VocabularyStore::new();
        store.upsert(VocabularyEntry {
            spoken: "hba1c".to_string(),
            written: "HbA1c".to_string(),
        });
        store.upsert(VocabularyEntry {
            spoken: "HBA1C".to_string(),
            written: "HbA1C".to_string(),
        });
        assert_eq!(store.entries().len(), 1);
        assert_eq!(store.entries()[0].written, "HbA1C");
    }

    #[test]
    fn unknown_ops_report_errors_without_failing() {
        let mut store = VocabularyStore::new();
        let response = store.handle_request(&json!({ "op": "rename" }));
        assert_eq!(response["ok"], false);
        let response = store.handle_request(&json!({}));
        assert_eq!(response["ok"], false);
    }

    #[test]
    fn add_rejects_blank_spoken_forms() {
        let mut store = VocabularyStore::new();
        let response = store.handle_request(&json!({
            "op": "add",
            "entry": { "spoken": "  ", "written": "x" }
        }));
        assert_eq!(response["ok"], false);
        assert!(store.entries().is_empty());
    }
}
