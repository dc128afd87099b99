//! Reservation scheduling.
//!
//! [`schedule`] is a pure function from free places and pending filters to
//! an assignment. The worker in [`worker`] drives the coordinator's
//! reservation state machine around it on a fixed interval.
//!
//! Places that fit the fewest pending filters are served first, so a filter
//! that only one place can satisfy is not starved by a broader filter that
//! happened to be considered earlier.

mod worker;

use std::collections::{BTreeMap, BTreeSet};

pub use worker::ScheduleWorker;

/// A named set of (key, value) pairs.
///
/// `rank` orders filters: lower ranks are preferred when a place fits more
/// than one. Places use rank 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSet {
    pub name: String,
    pub tags: BTreeSet<(String, String)>,
    pub rank: u64,
}

impl TagSet {
    pub fn new<I, K, V>(name: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            name: name.into(),
            tags: tags.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            rank: 0,
        }
    }

    pub fn with_rank(mut self, rank: u64) -> Self {
        self.rank = rank;
        self
    }

    /// A filter fits a place if all of its pairs are present on the place.
    pub fn fits(&self, place: &TagSet) -> bool {
        self.tags.is_subset(&place.tags)
    }
}

/// Assign filters to places, returning filter name -> place name.
///
/// The result does not depend on the order of either input slice.
pub fn schedule(places: &[TagSet], filters: &[TagSet]) -> BTreeMap<String, String> {
    let mut places: Vec<&TagSet> = places.iter().collect();
    places.sort_by(|a, b| a.name.cmp(&b.name));
    let mut filters: Vec<&TagSet> = filters.iter().collect();
    filters.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.name.cmp(&b.name)));

    let mut assignment = BTreeMap::new();

    loop {
        let fits: Vec<(&TagSet, Vec<&TagSet>)> = places
            .iter()
            .map(|place| {
                let fitting: Vec<&TagSet> =
                    filters.iter().copied().filter(|f| f.fits(place)).collect();
                (*place, fitting)
            })
            .filter(|(_, fitting)| !fitting.is_empty())
            .collect();

        let Some(min) = fits.iter().map(|(_, fitting)| fitting.len()).min() else {
            break;
        };

        let mut taken_places = BTreeSet::new();
        let mut taken_filters = BTreeSet::new();
        for (place, fitting) in fits.iter().filter(|(_, f)| f.len() == min) {
            let Some(filter) = fitting.iter().find(|f| !taken_filters.contains(&f.name)) else {
                continue;
            };
            taken_filters.insert(filter.name.clone());
            taken_places.insert(place.name.clone());
            assignment.insert(filter.name.clone(), place.name.clone());
        }

        if taken_places.is_empty() {
            break;
        }
        places.retain(|p| !taken_places.contains(&p.name));
        filters.retain(|f| !taken_filters.contains(&f.name));
    }

    assignment
}
