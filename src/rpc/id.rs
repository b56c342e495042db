//! Call identifier generation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Correlation key between a request and its response.
pub type CallId = u64;

/// Process-wide counter. Initialized once, only ever incremented, never reset.
static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(0);

/// Generate the next call identifier.
///
/// Identifiers start at 1 and are unique for the life of the process; no two
/// concurrent callers observe the same value.
pub fn next_call_id() -> CallId {
    NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed) + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_increase() {
        let a = next_call_id();
        let b = next_call_id();
        assert!(a >= 1);
        assert!(b > a);
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..1000).map(|_| next_call_id()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate call id {id}");
            }
        }
        assert_eq!(seen.len(), 8000);
    }
}
