//! Process-wide secret masking registry (Section 4.1).
//!
//! A single process-wide table of sensitive strings and their derived
//! encodings, consulted by `SegmentLogger` and `ProcessRunner` so that no
//! secret ever reaches a log line or captured output unmasked.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use base64::Engine;

/// Minimum length a value must have to be registered. Shorter values are
/// too likely to collide with ordinary log text.
const MIN_SECRET_LEN: usize = 4;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    hint: Option<String>,
}

#[derive(Debug, Default)]
struct SecretTable {
    entries: Vec<Entry>,
    seen: HashMap<String, ()>,
}

fn table() -> &'static RwLock<SecretTable> {
    static TABLE: OnceLock<RwLock<SecretTable>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(SecretTable::default()))
}

/// Register `value` (and its percent-encoded and Base64 derived forms)
/// with an optional display hint. No-op for empty or short values, and
/// for values already registered.
pub fn register(value: &str, hint: Option<&str>) {
    if value.len() < MIN_SECRET_LEN {
        return;
    }

    let mut guard = table().write().expect("secret table poisoned");
    if guard.seen.contains_key(value) {
        return;
    }
    guard.seen.insert(value.to_string(), ());

    let percent_encoded =
        percent_encoding::utf8_percent_encode(value, percent_encoding::NON_ALPHANUMERIC)
            .to_string();
    let base64_encoded = base64::engine::general_purpose::STANDARD.encode(value);

    guard.entries.push(Entry {
        value: value.to_string(),
        hint: hint.map(str::to_string),
    });
    if percent_encoded != value {
        guard.entries.push(Entry {
            value: percent_encoded,
            hint: hint.map(str::to_string),
        });
    }
    guard.entries.push(Entry {
        value: base64_encoded,
        hint: hint.map(|h| format!("{h}_BASE64")),
    });
}

/// Replace every occurrence of every registered value/encoding in `text`.
/// Longest-value-first ordering avoids a short secret consuming a prefix
/// of a longer one. Total and idempotent: `mask(mask(x)) == mask(x)`.
pub fn mask(text: &str) -> String {
    let guard = table().read().expect("secret table poisoned");
    let mut entries: Vec<&Entry> = guard.entries.iter().collect();
    entries.sort_by(|a, b| b.value.len().cmp(&a.value.len()));

    let mut out = text.to_string();
    for entry in entries {
        if entry.value.is_empty() {
            continue;
        }
        let replacement = match &entry.hint {
            Some(hint) => format!("[{hint}:***]"),
            None => "***".to_string(),
        };
        out = out.replace(&entry.value, &replacement);
    }
    out
}

/// Snapshot of registered raw values, for tests only.
#[cfg(any(test, feature = "test-util"))]
pub fn registered() -> Vec<String> {
    table()
        .read()
        .expect("secret table poisoned")
        .entries
        .iter()
        .map(|e| e.value.clone())
        .collect()
}

/// Clear the registry. Gated to test builds per the design note that
/// process-wide state must be resettable between tests.
#[cfg(any(test, feature = "test-util"))]
pub fn reset() {
    let mut guard = table().write().expect("secret table poisoned");
    guard.entries.clear();
    guard.seen.clear();
}
