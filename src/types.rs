//! Shared identifier and clock helpers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static RUN_COUNTER: AtomicU64 = AtomicU64::new(1);
static SECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a process-unique run identifier.
pub fn new_run_id() -> String {
    let ts = now_millis();
    let pid = std::process::id();
    let seq = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("run-{ts}-{pid}-{seq}")
}

/// Generate a process-unique section identifier.
pub fn new_section_id() -> String {
    let seq = SECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("sec-{seq}")
}
