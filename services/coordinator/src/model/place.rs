use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use labhub_id::ReservationToken;
use labhub_proto::coordinator::v1 as pb;

use super::{epoch_seconds, ResourceHandle, ResourceMatch, ResourcePath};

/// A named board: a set of resource matches plus ownership.
#[derive(Debug, Clone)]
pub struct Place {
    pub name: String,
    pub aliases: BTreeSet<String>,
    pub comment: String,
    pub tags: BTreeMap<String, String>,
    pub matches: Vec<ResourceMatch>,
    /// Owning principal.
    pub acquired: Option<String>,
    /// Held handles in acquisition order. Empty unless acquired.
    pub acquired_resources: Vec<ResourceHandle>,
    pub allowed: BTreeSet<String>,
    pub reservation: Option<ReservationToken>,
    pub created: DateTime<Utc>,
    pub changed: DateTime<Utc>,
}

impl Place {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            aliases: BTreeSet::new(),
            comment: String::new(),
            tags: BTreeMap::new(),
            matches: Vec::new(),
            acquired: None,
            acquired_resources: Vec::new(),
            allowed: BTreeSet::new(),
            reservation: None,
            created: now,
            changed: now,
        }
    }

    pub fn touch(&mut self) {
        self.changed = Utc::now();
    }

    /// True if any match claims the resource.
    pub fn claims(&self, path: &ResourcePath) -> bool {
        self.matches.iter().any(|m| m.matches(path))
    }

    /// Tags used for scheduling: all tags plus the place name.
    pub fn scheduling_tags(&self) -> BTreeSet<(String, String)> {
        self.tags
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(std::iter::once(("name".to_string(), self.name.clone())))
            .collect()
    }

    pub fn to_proto(&self) -> pb::Place {
        pb::Place {
            name: self.name.clone(),
            aliases: self.aliases.iter().cloned().collect(),
            comment: self.comment.clone(),
            tags: self
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            matches: self.matches.iter().map(ResourceMatch::to_proto).collect(),
            acquired: self.acquired.clone(),
            acquired_resources: self
                .acquired_resources
                .iter()
                .map(|r| r.path.to_string())
                .collect(),
            allowed: self.allowed.iter().cloned().collect(),
            created: epoch_seconds(self.created),
            changed: epoch_seconds(self.changed),
            reservation: self.reservation.map(|t| t.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduling_tags_include_name() {
        let mut place = Place::new("rpi-3");
        place.tags.insert("board".into(), "rpi".into());
        let tags = place.scheduling_tags();
        assert!(tags.contains(&("name".to_string(), "rpi-3".to_string())));
        assert!(tags.contains(&("board".to_string(), "rpi".to_string())));
    }

    #[test]
    fn claims_any_match() {
        let mut place = Place::new("p");
        place.matches.push(ResourceMatch::parse("a/1/*", None).unwrap());
        place.matches.push(ResourceMatch::parse("b/*/PowerPort", None).unwrap());
        assert!(place.claims(&ResourcePath::new("b", "9", "PowerPort", "pdu")));
        assert!(!place.claims(&ResourcePath::new("c", "1", "PowerPort", "pdu")));
    }

    #[test]
    fn touch_moves_changed_forward() {
        let mut place = Place::new("p");
        let before = place.changed;
        std::thread::sleep(std::time::Duration::from_millis(2));
        place.touch();
        assert!(place.changed > before);
        assert_eq!(place.created, before);
    }
}
