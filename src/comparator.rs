//! Process-wide registry of named key comparators for sort definitions.
//!
//! Comparators can be registered until the first sort definition resolves a
//! name; from then on the registry is frozen so every sort in the process sees
//! the same set.

use crate::error::{PumpError, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

/// Compares two key byte strings.
pub type CompareFn = fn(&[u8], &[u8]) -> Ordering;

static REGISTRY: Lazy<RwLock<HashMap<String, CompareFn>>> = Lazy::new(|| {
    let builtins: [(&str, CompareFn); 4] = [
        ("bytes", compare_bytes),
        ("reverse", compare_reverse),
        ("numeric", compare_numeric),
        ("nocase", compare_nocase),
    ];
    RwLock::new(
        builtins
            .into_iter()
            .map(|(name, f)| (name.to_string(), f))
            .collect(),
    )
});

static FROZEN: AtomicBool = AtomicBool::new(false);

/// Register a comparator under `name`.
///
/// Fails once the registry is frozen or when the name is taken.
pub fn register(name: &str, compare: CompareFn) -> Result<()> {
    let mut registry = REGISTRY.write();
    if FROZEN.load(AtomicOrdering::Acquire) {
        return Err(PumpError::Config(format!(
            "comparator \"{name}\" registered after the registry was frozen"
        )));
    }
    if registry.contains_key(name) {
        return Err(PumpError::Config(format!(
            "comparator \"{name}\" is already registered"
        )));
    }
    registry.insert(name.to_string(), compare);
    log::debug!("registered comparator {name}");
    Ok(())
}

/// Look up a comparator without freezing the registry.
pub fn lookup(name: &str) -> Option<CompareFn> {
    REGISTRY.read().get(name).copied()
}

/// Resolve a comparator for a sort definition, freezing the registry.
pub(crate) fn resolve(name: &str) -> Option<CompareFn> {
    let registry = REGISTRY.read();
    FROZEN.store(true, AtomicOrdering::Release);
    registry.get(name).copied()
}

/// Stop accepting registrations.
pub fn freeze() {
    let _registry = REGISTRY.write();
    FROZEN.store(true, AtomicOrdering::Release);
}

/// Whether registrations are still accepted
pub fn is_frozen() -> bool {
    FROZEN.load(AtomicOrdering::Acquire)
}

/// Registered comparator names, sorted
pub fn names() -> Vec<String> {
    let mut names: Vec<String> = REGISTRY.read().keys().cloned().collect();
    names.sort();
    names
}

fn compare_bytes(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

fn compare_reverse(a: &[u8], b: &[u8]) -> Ordering {
    b.cmp(a)
}

fn compare_nocase(a: &[u8], b: &[u8]) -> Ordering {
    a.iter()
        .map(u8::to_ascii_lowercase)
        .cmp(b.iter().map(u8::to_ascii_lowercase))
}

/// Decimal numbers with optional sign and fraction; anything unparsable is 0.
fn compare_numeric(a: &[u8], b: &[u8]) -> Ordering {
    let value = |key: &[u8]| -> f64 {
        std::str::from_utf8(key)
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(0.0)
    };
    value(a).partial_cmp(&value(b)).unwrap_or(Ordering::Equal)
}
