//! Site data with atomic replacement.
//!
//! Uses `arc-swap` for lock-free reads and atomic replacement. The html stage
//! takes one [`SiteData::snapshot`] per pass, so a reload published while
//! pages render is only seen by the next pass.
//!
//! ```text
//!   data stage ──► parse ──► SiteData::replace (atomic)
//!                                   │
//!   html stage ──► snapshot() ◄─────┘   one Arc for the whole pass
//! ```

use arc_swap::ArcSwap;
use serde_json::Value;
use std::sync::Arc;

/// The current parsed site data document.
///
/// Owned by the orchestrator. Starts as an empty object.
#[derive(Debug)]
pub struct SiteData {
    current: ArcSwap<Value>,
}

impl Default for SiteData {
    fn default() -> Self {
        Self {
            current: ArcSwap::from_pointee(Value::Object(Default::default())),
        }
    }
}

impl SiteData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value. Thread-safe and wait-free.
    #[inline]
    pub fn snapshot(&self) -> Arc<Value> {
        self.current.load_full()
    }

    /// Parse and publish a new value.
    ///
    /// On a parse error the current value is kept.
    pub fn replace_from_slice(&self, content: &[u8]) -> serde_json::Result<()> {
        let value: Value = serde_json::from_slice(content)?;
        self.current.store(Arc::new(value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_starts_empty() {
        let data = SiteData::new();
        assert_eq!(*data.snapshot(), json!({}));
    }

    #[test]
    fn test_replace_is_atomic_for_existing_snapshots() {
        let data = SiteData::new();
        data.replace_from_slice(br#"{"title":"one"}"#).unwrap();
        let before = data.snapshot();

        data.replace_from_slice(br#"{"title":"two"}"#).unwrap();

        assert_eq!(before["title"], "one");
        assert_eq!(data.snapshot()["title"], "two");
    }

    #[test]
    fn test_malformed_input_keeps_previous_value() {
        let data = SiteData::new();
        data.replace_from_slice(br#"{"title":"good"}"#).unwrap();

        assert!(data.replace_from_slice(b"{ not json").is_err());
        assert_eq!(data.snapshot()["title"], "good");
    }
}
