use crate::LocationError;
use crate::metrics_defs::{RULE_LOCATIONS, RULE_RELOADS, RULE_STALE};
use crate::rules::{Location, LocationTable};
use crate::source::{FileRuleSource, RuleSource};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use shared::{counter, gauge};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

struct ReloadState {
    last_check: Instant,
    fingerprint: Option<SystemTime>,
    generation: u64,
}

/// Serves lookups from an immutable snapshot and swaps in a new one when the
/// rule source changes.
pub struct LocationResolver {
    source: Box<dyn RuleSource>,
    separator: char,
    min_reload_interval: Duration,
    table: ArcSwap<LocationTable>,
    // Generation of the active snapshot, 0 while the latest reload failed.
    age: AtomicU64,
    state: Mutex<ReloadState>,
}

impl LocationResolver {
    /// Loads the initial snapshot. Unlike `reload`, an invalid rule source is an error here.
    pub fn new(
        source: Box<dyn RuleSource>,
        separator: char,
        min_reload_interval: Duration,
    ) -> Result<Self, LocationError> {
        let fingerprint = source.fingerprint();
        let table = LocationTable::build(source.load()?, separator)?;
        gauge!(RULE_LOCATIONS).set(table.len() as f64);
        gauge!(RULE_STALE).set(0.0);
        tracing::info!(
            source = %source.describe(),
            locations = table.len(),
            "Loaded relay rules"
        );

        Ok(LocationResolver {
            source,
            separator,
            min_reload_interval,
            table: ArcSwap::from_pointee(table),
            age: AtomicU64::new(1),
            state: Mutex::new(ReloadState {
                last_check: Instant::now(),
                fingerprint,
                generation: 1,
            }),
        })
    }

    pub fn from_file(
        path: impl AsRef<Path>,
        separator: char,
        min_reload_interval: Duration,
    ) -> Result<Self, LocationError> {
        Self::new(
            Box::new(FileRuleSource::new(path)),
            separator,
            min_reload_interval,
        )
    }

    /// Re-reads the rule source when it changed. Never fails: a broken source
    /// leaves the previous snapshot in place and marks the resolver stale.
    pub fn reload(&self) {
        // Someone else is already checking
        let Some(mut state) = self.state.try_lock() else {
            return;
        };
        if state.last_check.elapsed() < self.min_reload_interval {
            return;
        }
        state.last_check = Instant::now();

        let fingerprint = self.source.fingerprint();
        if fingerprint.is_some() && fingerprint == state.fingerprint && !self.is_stale() {
            return;
        }
        state.fingerprint = fingerprint;

        let result = self
            .source
            .load()
            .and_then(|rules| LocationTable::build(rules, self.separator));

        match result {
            Ok(table) => {
                state.generation += 1;
                gauge!(RULE_LOCATIONS).set(table.len() as f64);
                gauge!(RULE_STALE).set(0.0);
                counter!(RULE_RELOADS, "result" => "ok").increment(1);
                tracing::info!(
                    source = %self.source.describe(),
                    locations = table.len(),
                    generation = state.generation,
                    "Reloaded relay rules"
                );
                self.table.store(Arc::new(table));
                self.age.store(state.generation, Ordering::Release);
            }
            Err(e) => {
                gauge!(RULE_STALE).set(1.0);
                counter!(RULE_RELOADS, "result" => "error").increment(1);
                tracing::warn!(
                    source = %self.source.describe(),
                    error = %e,
                    "Relay rule is invalid, using old rules now"
                );
                self.age.store(0, Ordering::Release);
            }
        }
    }

    /// Whether `reload` would look at the rule source now.
    pub fn reload_due(&self) -> bool {
        self.state
            .try_lock()
            .is_some_and(|state| state.last_check.elapsed() >= self.min_reload_interval)
    }

    pub fn snapshot(&self) -> Arc<LocationTable> {
        self.table.load_full()
    }

    pub fn resolve(&self, prefix: &str) -> Option<Arc<Location>> {
        self.table.load().get(prefix).cloned()
    }

    pub fn has_location(&self, prefix: &str) -> bool {
        self.table.load().get(prefix).is_some()
    }

    pub fn is_merged(&self, prefix: &str) -> bool {
        self.table
            .load()
            .get(prefix)
            .is_some_and(|location| location.is_merged())
    }

    pub fn age(&self) -> u64 {
        self.age.load(Ordering::Acquire)
    }

    pub fn is_stale(&self) -> bool {
        self.age() == 0
    }

    pub fn separator(&self) -> char {
        self.separator
    }
}
