use std::sync::atomic::{AtomicU64, Ordering};

/// Mints ids of the form `prefix-1`, `prefix-2`, ... in monotonic order.
///
/// Ids only need to be unique within the lifetime of the minting
/// component (`spec.md` §4.4); a plain `AtomicU64` counter is enough
/// since an `IdGen` is shared across tasks (one per singleton) rather
/// than confined to a single-threaded loop the way the original is.
#[derive(Debug)]
pub struct IdGen {
    prefix: String,
    next: AtomicU64,
}

impl IdGen {
    pub fn new(prefix: impl Into<String>) -> Self {
        IdGen {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next id in the series, e.g. `"InitiatorConnection-3"`.
    pub fn next(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}
