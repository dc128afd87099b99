//! Reconciliation primitives.
//!
//! The coordinator keeps the authoritative record of which place holds which
//! resource. Exporters report their own view. This crate computes, from a
//! snapshot of both, the commands that bring the exporters back in line.
//!
//! # Invariants
//!
//! - Planning is a pure function of its inputs
//! - A resource held by a place is never planned for release
//! - A resource reported as broken is never touched
//! - A resource held by more than one place is reported, never acquired

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// What an exporter says about one of its resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// Not acquired by anyone.
    Free,
    /// Acquired on behalf of the named place.
    Place(String),
    /// Acquisition state unknown on the exporter side.
    Broken,
}

/// One entry of a place's acquired resource list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holding<P> {
    pub place: String,
    pub path: P,
    /// The held handle no longer exists on its exporter.
    pub orphaned: bool,
}

/// Commands that converge the exporters to the coordinator's record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftPlan<P> {
    /// Published resources claiming a place that does not hold them.
    pub release: Vec<P>,
    /// Resources a place holds that the exporter reports as free.
    pub acquire: Vec<(P, String)>,
    /// Orphaned handles whose path is published again; the place should
    /// switch to the fresh handle once the exporter agrees.
    pub replace: Vec<(P, String)>,
    /// Paths that more than one place holds, with the holders.
    pub conflicts: Vec<(P, Vec<String>)>,
}

impl<P> Default for DriftPlan<P> {
    fn default() -> Self {
        Self {
            release: Vec::new(),
            acquire: Vec::new(),
            replace: Vec::new(),
            conflicts: Vec::new(),
        }
    }
}

impl<P> DriftPlan<P> {
    pub fn is_empty(&self) -> bool {
        self.release.is_empty()
            && self.acquire.is_empty()
            && self.replace.is_empty()
            && self.conflicts.is_empty()
    }
}

/// Plan the commands for one reconciliation pass.
///
/// `published` is every resource currently reported by a connected exporter,
/// `holdings` the acquired resource lists of all acquired places.
pub fn plan_drift<P>(published: &BTreeMap<P, Claim>, holdings: &[Holding<P>]) -> DriftPlan<P>
where
    P: Ord + Clone,
{
    let mut plan = DriftPlan::default();

    let held: BTreeSet<(&P, &str)> = holdings
        .iter()
        .map(|h| (&h.path, h.place.as_str()))
        .collect();

    for (path, claim) in published {
        if let Claim::Place(place) = claim {
            if !held.contains(&(path, place.as_str())) {
                plan.release.push(path.clone());
            }
        }
    }

    let mut holders: BTreeMap<&P, BTreeSet<&str>> = BTreeMap::new();
    for holding in holdings {
        holders
            .entry(&holding.path)
            .or_default()
            .insert(holding.place.as_str());
    }
    for (path, places) in &holders {
        if places.len() > 1 {
            plan.conflicts.push((
                (*path).clone(),
                places.iter().map(|p| p.to_string()).collect(),
            ));
        }
    }

    for holding in holdings {
        if holders.get(&holding.path).is_some_and(|p| p.len() > 1) {
            continue;
        }
        let Some(claim) = published.get(&holding.path) else {
            // Exporter is gone or has not re-published yet.
            continue;
        };
        match claim {
            Claim::Free => {
                plan.acquire.push((holding.path.clone(), holding.place.clone()));
                if holding.orphaned {
                    plan.replace.push((holding.path.clone(), holding.place.clone()));
                }
            }
            Claim::Place(place) if *place == holding.place => {
                if holding.orphaned {
                    plan.replace.push((holding.path.clone(), holding.place.clone()));
                }
            }
            Claim::Place(_) | Claim::Broken => {}
        }
    }

    plan
}

/// Bounds how often reconciliation retries a failing resource.
///
/// After `max_retries` failures inside `window` the key is skipped until the
/// window has passed.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    max_retries: u32,
    window: Duration,
    // key -> (count, first failure)
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure. Returns true if retries are now exhausted.
    pub fn record_failure(&mut self, key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self.failures.entry(key.to_string()).or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    pub fn is_exhausted(&self, key: &str) -> bool {
        let Some((count, first)) = self.failures.get(key) else {
            return false;
        };
        if Instant::now().duration_since(*first) > self.window {
            return false;
        }
        *count > self.max_retries
    }

    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Drop entries whose window has passed.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

impl Default for RetryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW)
    }
}

/// Default retry limit per resource.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(5 * 60);
