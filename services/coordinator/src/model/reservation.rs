use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use labhub_id::ReservationToken;
use labhub_proto::coordinator::v1 as pb;

use super::{epoch_seconds, validate_tag_key, validate_tag_value, ModelError};

/// The only filter group the scheduler understands.
pub const MAIN_FILTER: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Waiting,
    Allocated,
    Acquired,
    Expired,
    Invalid,
}

impl ReservationState {
    /// Waiting and allocated reservations expire unless polled.
    pub fn expires(self) -> bool {
        matches!(self, Self::Waiting | Self::Allocated)
    }

    /// Expired and invalid reservations are kept only until their grace deadline.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Invalid)
    }

    pub fn to_proto(self) -> pb::ReservationState {
        match self {
            Self::Waiting => pb::ReservationState::Waiting,
            Self::Allocated => pb::ReservationState::Allocated,
            Self::Acquired => pb::ReservationState::Acquired,
            Self::Expired => pb::ReservationState::Expired,
            Self::Invalid => pb::ReservationState::Invalid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub token: ReservationToken,
    pub owner: String,
    pub prio: f64,
    pub filters: BTreeMap<String, BTreeMap<String, String>>,
    pub allocations: BTreeMap<String, Vec<String>>,
    pub state: ReservationState,
    pub created: DateTime<Utc>,
    pub timeout: DateTime<Utc>,
}

impl Reservation {
    pub fn new(
        owner: impl Into<String>,
        filters: BTreeMap<String, BTreeMap<String, String>>,
        prio: f64,
        timeout: Duration,
    ) -> Self {
        let mut reservation = Self {
            token: ReservationToken::new(),
            owner: owner.into(),
            prio,
            filters,
            allocations: BTreeMap::new(),
            state: ReservationState::Waiting,
            created: Utc::now(),
            timeout: Utc::now(),
        };
        reservation.refresh(timeout);
        reservation
    }

    /// Only a single `main` group of valid tag predicates is accepted.
    pub fn validate_filters(
        filters: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<(), ModelError> {
        if filters.is_empty() {
            return Err(ModelError::InvalidFilter("no filter groups".into()));
        }
        for (group, filter) in filters {
            if group != MAIN_FILTER {
                return Err(ModelError::InvalidFilter(format!(
                    "unsupported filter group '{group}'"
                )));
            }
            for (k, v) in filter {
                validate_tag_key(k)?;
                validate_tag_value(k, v)?;
            }
        }
        Ok(())
    }

    pub fn refresh(&mut self, delay: Duration) {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.timeout = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.timeout < now
    }

    /// Place names across all allocation groups.
    pub fn allocated_places(&self) -> impl Iterator<Item = &String> {
        self.allocations.values().flatten()
    }

    pub fn to_proto(&self) -> pb::Reservation {
        pb::Reservation {
            owner: self.owner.clone(),
            token: self.token.to_string(),
            state: self.state.to_proto() as i32,
            prio: self.prio,
            filters: self
                .filters
                .iter()
                .map(|(name, filter)| {
                    let filter = filter
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    (name.clone(), pb::reservation::Filter { filter })
                })
                .collect(),
            allocations: self
                .allocations
                .iter()
                .map(|(name, places)| {
                    let allocation = pb::reservation::Allocation {
                        allocations: places.clone(),
                    };
                    (name.clone(), allocation)
                })
                .collect(),
            created: epoch_seconds(self.created),
            timeout: epoch_seconds(self.timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn filters(group: &str, pairs: &[(&str, &str)]) -> BTreeMap<String, BTreeMap<String, String>> {
        BTreeMap::from([(
            group.to_string(),
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )])
    }

    #[rstest]
    #[case(filters("main", &[("board", "foo")]), true)]
    #[case(filters("main", &[("name", "rpi-3")]), true)]
    #[case(filters("main", &[]), true)]
    #[case(filters("extra", &[("board", "foo")]), false)]
    #[case(filters("main", &[("Board", "foo")]), false)]
    #[case(filters("main", &[("board", "f o")]), false)]
    #[case(BTreeMap::new(), false)]
    fn filter_validation(
        #[case] filters: BTreeMap<String, BTreeMap<String, String>>,
        #[case] ok: bool,
    ) {
        assert_eq!(Reservation::validate_filters(&filters).is_ok(), ok);
    }

    #[test]
    fn new_reservation_waits_with_deadline() {
        let res = Reservation::new("me", filters("main", &[]), 0.0, Duration::from_secs(60));
        assert_eq!(res.state, ReservationState::Waiting);
        assert!(!res.is_past_deadline(Utc::now()));
        assert!(res.is_past_deadline(Utc::now() + chrono::Duration::seconds(120)));
    }

    #[test]
    fn proto_carries_state_and_token() {
        let mut res = Reservation::new("me", filters("main", &[]), 1.5, Duration::from_secs(60));
        res.state = ReservationState::Allocated;
        res.allocations.insert(MAIN_FILTER.into(), vec!["test".into()]);
        let wire = res.to_proto();
        assert_eq!(wire.state, pb::ReservationState::Allocated as i32);
        assert_eq!(wire.token, res.token.to_string());
        assert_eq!(wire.allocations["main"].allocations, vec!["test".to_string()]);
    }
}
