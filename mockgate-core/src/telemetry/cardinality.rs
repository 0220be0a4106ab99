//! Cardinality limiter for metric labels.

use std::collections::HashSet;

use parking_lot::Mutex;

/// Caps the number of distinct values a label may take.
///
/// Once `max_values` distinct values have been seen, unseen values are
/// reported as `"__other__"`.
pub struct CardinalityLimiter {
    known: Mutex<HashSet<String>>,
    max_values: usize,
}

impl CardinalityLimiter {
    pub fn new(max_values: usize) -> Self {
        Self {
            known: Mutex::new(HashSet::new()),
            max_values,
        }
    }

    /// Known values pass through; new values are admitted while under the
    /// limit.
    pub fn resolve<'a>(&self, value: &'a str) -> &'a str {
        let mut known = self.known.lock();
        if known.contains(value) {
            value
        } else if known.len() < self.max_values {
            known.insert(value.to_string());
            value
        } else {
            "__other__"
        }
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        self.known.lock().len()
    }
}
