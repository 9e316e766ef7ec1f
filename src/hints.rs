use std::collections::HashMap;

use parking_lot::Mutex;

/// Per-topic running maximum of observed payload sizes.
///
/// The hint seeds the fetch budget of the next range read over the same
/// topic, so the first fetch usually already fits the topic's largest
/// message. Values never decrease and entries are never evicted; topic
/// cardinality is expected to stay small.
#[derive(Debug, Default)]
pub struct MessageSizeHints {
    sizes: Mutex<HashMap<String, i32>>,
}

impl MessageSizeHints {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored hint for `topic`, or `fallback` when none was recorded yet.
    pub fn get(&self, topic: &str, fallback: i32) -> i32 {
        self.sizes.lock().get(topic).copied().unwrap_or(fallback)
    }

    /// Raise the hint for `topic` to `observed` if it is larger.
    pub fn put(&self, topic: &str, observed: i32) {
        let mut sizes = self.sizes.lock();
        let current = sizes.entry(topic.to_owned()).or_insert(observed);
        if observed > *current {
            *current = observed;
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn get_falls_back_when_unknown() {
        let hints = MessageSizeHints::new();
        assert_eq!(hints.get("events", 4096), 4096);
    }

    #[test]
    fn put_never_decreases() {
        let hints = MessageSizeHints::new();
        hints.put("events", 100);
        hints.put("events", 40);
        assert_eq!(hints.get("events", 0), 100);
        hints.put("events", 250);
        assert_eq!(hints.get("events", 0), 250);
    }

    #[test]
    fn topics_are_independent() {
        let hints = MessageSizeHints::new();
        hints.put("a", 10);
        hints.put("b", 20);
        assert_eq!(hints.get("a", 0), 10);
        assert_eq!(hints.get("b", 0), 20);
    }

    proptest! {
        #[test]
        fn stored_value_is_running_maximum(observed in proptest::collection::vec(0i32..=i32::MAX, 1..50)) {
            let hints = MessageSizeHints::new();
            for value in &observed {
                hints.put("t", *value);
            }
            prop_assert_eq!(hints.get("t", 0), observed.iter().copied().max().unwrap());
        }
    }
}
