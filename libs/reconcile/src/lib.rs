//! Convergence primitives for instance group reconciliation.
//!
//! Provisioners compare the desired spec of a node group with the
//! resources discovered in the cloud and converge the two. Key concepts:
//!
//! - **Spec hash**: deterministic digest of a desired launch spec, used to
//!   name immutable launch configurations.
//! - **Stale instance**: an instance launched from a superseded launch
//!   configuration.
//! - **Rolling batch**: how many stale instances may be replaced per tick.
//!
//! # Invariants
//!
//! - Equal inputs always produce equal hashes and equal decisions
//! - Nothing here performs I/O

use sha2::{Digest, Sha256};

/// A spec hash for deterministic comparison.
///
/// Used to detect when a launch specification has changed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(hex::encode(&result[..16])) // First 16 bytes (128 bits)
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `len` hex characters, for embedding in resource names.
    pub fn short(&self, len: usize) -> &str {
        &self.0[..len.min(self.0.len())]
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Partition instances into those on `desired` and stale ones.
///
/// Instances whose key is `None` (launched from a template or detached)
/// count as stale.
pub fn classify_instances<I, F>(
    instances: I,
    desired: &str,
    get_key: F,
) -> (Vec<I::Item>, Vec<I::Item>)
where
    I: IntoIterator,
    F: Fn(&I::Item) -> Option<&str>,
{
    let mut matching = Vec::new();
    let mut stale = Vec::new();

    for instance in instances {
        if get_key(&instance) == Some(desired) {
            matching.push(instance);
        } else {
            stale.push(instance);
        }
    }

    (matching, stale)
}

/// Rolling replacement limits.
#[derive(Debug, Clone)]
pub struct RollingStrategy {
    /// Maximum number of instances that can be out of service at once.
    pub max_unavailable: u32,
}

impl Default for RollingStrategy {
    fn default() -> Self {
        Self { max_unavailable: 1 }
    }
}

impl RollingStrategy {
    /// How many stale instances can be terminated in this pass.
    ///
    /// Instances already out of service (launching, terminating or
    /// unhealthy) consume the unavailability budget.
    pub fn batch_size(&self, unavailable: u32, stale: u32) -> u32 {
        self.max_unavailable.saturating_sub(unavailable).min(stale)
    }
}

/// Drain selection priority for instances.
///
/// Lower priority values are drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DrainPriority {
    /// Instance is unhealthy (drain first).
    Unhealthy = 0,

    /// Instance is not in service yet or anymore.
    NotInService = 1,

    /// Instance is healthy and serving (drain last).
    Healthy = 2,
}

/// Select instances to drain based on priority.
///
/// Returns instances sorted by drain priority (first to drain first).
/// The sort is stable, so equal priorities keep their input order.
pub fn select_for_drain<T, F>(instances: Vec<T>, get_priority: F) -> Vec<T>
where
    F: Fn(&T) -> DrainPriority,
{
    let mut with_priority: Vec<_> = instances
        .into_iter()
        .map(|i| {
            let p = get_priority(&i);
            (p, i)
        })
        .collect();

    with_priority.sort_by_key(|(p, _)| *p);
    with_priority.into_iter().map(|(_, i)| i).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_spec_hash_deterministic() {
        let json1 = serde_json::json!({"imageId": "ami-1", "instanceType": "m5.large"});
        let json2 = serde_json::json!({"instanceType": "m5.large", "imageId": "ami-1"});

        let hash1 = SpecHash::from_json(&json1);
        let hash2 = SpecHash::from_json(&json2);

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.as_str().len(), 32);
        assert_eq!(hash1.short(8).len(), 8);
        assert_eq!(hash1.short(64), hash1.as_str());
    }

    #[test]
    fn test_spec_hash_detects_change() {
        let old = SpecHash::from_json(&serde_json::json!({"imageId": "ami-1"}));
        let new = SpecHash::from_json(&serde_json::json!({"imageId": "ami-2"}));
        assert_ne!(old, new);
    }

    #[test]
    fn test_batch_size() {
        let strategy = RollingStrategy { max_unavailable: 2 };

        // Nothing unavailable: replace up to max_unavailable
        assert_eq!(strategy.batch_size(0, 5), 2);

        // Fewer stale than the budget
        assert_eq!(strategy.batch_size(0, 1), 1);

        // One replacement still launching
        assert_eq!(strategy.batch_size(1, 5), 1);

        // Budget exhausted: wait
        assert_eq!(strategy.batch_size(3, 5), 0);
    }

    #[test]
    fn test_classify_instances() {
        let instances = vec![
            ("i-1", Some("ng-1-abc")),
            ("i-2", Some("ng-1-old")),
            ("i-3", Some("ng-1-abc")),
            ("i-4", None),
        ];

        let (matching, stale) = classify_instances(instances, "ng-1-abc", |(_, lc)| *lc);

        assert_eq!(matching.len(), 2);
        assert_eq!(
            stale.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec!["i-2", "i-4"]
        );
    }

    #[test]
    fn test_select_for_drain() {
        let instances = vec![
            ("i-1", DrainPriority::Healthy),
            ("i-2", DrainPriority::Unhealthy),
            ("i-3", DrainPriority::NotInService),
            ("i-4", DrainPriority::Healthy),
        ];

        let order: Vec<_> = select_for_drain(instances, |(_, p)| *p)
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        assert_eq!(order, vec!["i-2", "i-3", "i-1", "i-4"]);
    }

    proptest! {
        #[test]
        fn prop_batch_never_exceeds_budget(
            max in 0u32..10,
            unavailable in 0u32..10,
            stale in 0u32..10,
        ) {
            let batch = RollingStrategy { max_unavailable: max }.batch_size(unavailable, stale);
            prop_assert!(batch <= stale);
            prop_assert!(batch + unavailable <= max.max(unavailable));
        }
    }
}
