use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Acquire a memo/tracker mutex, recovering the guard if a previous holder panicked.
///
/// All state behind these locks is advisory (memo records, pending task handles),
/// so a poisoned guard is still safe to use.
pub(crate) fn lock<'a, T>(
    mutex: &'a Mutex<T>,
    component: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!(
            component,
            op,
            result = "poisoned_recovered",
            "Recovered from poisoned artifact cache lock"
        );
        poisoned.into_inner()
    })
}
