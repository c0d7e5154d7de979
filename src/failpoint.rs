//! Named fault-injection points for crash tests
//!
//! A failpoint is enabled per thread with [`enable`], or process-wide by
//! listing it in `ATLASDB_FAILPOINTS` (comma separated). The variable is
//! read once, on the first check.
//!
//! Known points:
//! - `tx.after_wal_sync`: commit fails after the WAL is durable but before
//!   the store has been updated
//! - `store.compact.between_moves`: direct-store compaction stops once the
//!   index points at the relocated copy, before it is moved down

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use std::sync::OnceLock;

use crate::error::Result;

const ENV_VAR: &str = "ATLASDB_FAILPOINTS";

thread_local! {
    static FAILPOINTS: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

pub fn enable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().insert(name.to_string());
    });
}

pub fn disable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().remove(name);
    });
}

pub fn clear() {
    FAILPOINTS.with(|set| {
        set.borrow_mut().clear();
    });
}

pub fn is_enabled(name: &str) -> bool {
    if FAILPOINTS.with(|set| set.borrow().contains(name)) {
        return true;
    }

    from_env().contains(name)
}

fn from_env() -> &'static HashSet<String> {
    static ENABLED: OnceLock<HashSet<String>> = OnceLock::new();
    ENABLED.get_or_init(|| {
        std::env::var(ENV_VAR)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    })
}

/// Fail with an I/O error if `name` is enabled
pub fn maybe_fail(name: &str) -> Result<()> {
    if is_enabled(name) {
        Err(io::Error::other(format!("failpoint triggered: {name}")).into())
    } else {
        Ok(())
    }
}
