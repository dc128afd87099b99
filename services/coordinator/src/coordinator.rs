//! The coordinator: owner of places, reservations and exporter resources.
//!
//! Every mutation of places and reservations happens under one async lock.
//! The lock is held across exporter round-trips only while a place's
//! resources are acquired or released, which the command timeout bounds.
//! Exporter streams never wait on the lock directly: work that needs it is
//! queued to a per-exporter follow-up task.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use labhub_id::ReservationToken;
use labhub_proto::coordinator::v1 as pb;
use labhub_reconcile::{plan_drift, Claim, Holding, RetryTracker};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;
use tracing::{debug, error, info, instrument, warn};

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::model::{
    validate_tag_key, validate_tag_value, Place, Reservation, ReservationState, ResourceHandle,
    ResourceImport, ResourceMatch, ResourcePath, BROKEN_MARKER, MAIN_FILTER,
};
use crate::persistence::{PersistenceError, Snapshot, StatePersistence};
use crate::scheduler::{schedule, TagSet};
use crate::session::{
    outbound_stream, ClientRegistry, ClientSession, CommandError, ExporterRegistry,
    ExporterSession, PendingCommands, SetResourceAction,
};

/// Version announced to exporters in `hello`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything guarded by the coordinator lock.
struct CoordinatorState {
    places: BTreeMap<String, Place>,
    reservations: BTreeMap<ReservationToken, Reservation>,
    retries: RetryTracker,
}

/// Lock-needing work produced by an exporter stream.
enum FollowUp {
    Added(ResourceHandle),
    Removed(ResourceHandle),
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub released: usize,
    pub acquired: usize,
    pub replaced: usize,
    pub failed: usize,
    /// Paths listed by more than one place.
    pub conflicts: usize,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    state: Mutex<CoordinatorState>,
    exporters: ExporterRegistry,
    clients: ClientRegistry,
    dirty: AtomicBool,
    persistence: Option<StatePersistence>,
}

impl Coordinator {
    /// Create a coordinator, loading places from the state directory if one
    /// is configured.
    pub fn new(config: CoordinatorConfig) -> std::result::Result<Arc<Self>, PersistenceError> {
        let persistence = config.state_dir.clone().map(StatePersistence::new);
        let places = match &persistence {
            Some(p) => p.load_places()?,
            None => BTreeMap::new(),
        };

        Ok(Arc::new(Self {
            config,
            state: Mutex::new(CoordinatorState {
                places,
                reservations: BTreeMap::new(),
                retries: RetryTracker::default(),
            }),
            exporters: ExporterRegistry::default(),
            clients: ClientRegistry::default(),
            dirty: AtomicBool::new(false),
            persistence,
        }))
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn exporters(&self) -> &ExporterRegistry {
        &self.exporters
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    fn publish_place(&self, place: &Place) {
        self.clients.broadcast_place(pb::UpdateResponse {
            kind: Some(pb::update_response::Kind::Place(place.to_proto())),
        });
    }

    fn publish_resource(&self, handle: &ResourceImport) {
        self.clients.broadcast_resource(pb::UpdateResponse {
            kind: Some(pb::update_response::Kind::Resource(handle.to_proto())),
        });
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Look up a place, apply `f`, then touch, publish and persist it.
    fn update_place<R>(
        &self,
        state: &mut CoordinatorState,
        name: &str,
        f: impl FnOnce(&mut Place) -> Result<R>,
    ) -> Result<R> {
        let place = state
            .places
            .get_mut(name)
            .ok_or_else(|| place_not_found(name))?;
        let result = f(place)?;
        place.touch();
        self.publish_place(place);
        self.mark_dirty();
        Ok(result)
    }

    // =========================================================================
    // Places
    // =========================================================================

    pub async fn add_place(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "place name must not be empty".into(),
            ));
        }
        let mut state = self.state.lock().await;
        if state.places.contains_key(name) {
            return Err(CoordinatorError::AlreadyExists(format!(
                "place {name} already exists"
            )));
        }
        if let Some(owner) = state.places.values().find(|p| p.aliases.contains(name)) {
            return Err(CoordinatorError::AlreadyExists(format!(
                "{name} is an alias of place {}",
                owner.name
            )));
        }
        let place = Place::new(name);
        self.publish_place(&place);
        state.places.insert(name.to_string(), place);
        self.mark_dirty();
        info!(place = %name, "Place added");
        self.schedule_locked(&mut state);
        Ok(())
    }

    pub async fn delete_place(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.places.remove(name).is_none() {
            return Err(place_not_found(name));
        }
        self.clients.broadcast_place(pb::UpdateResponse {
            kind: Some(pb::update_response::Kind::DelPlace(name.to_string())),
        });
        self.mark_dirty();
        info!(place = %name, "Place deleted");
        self.schedule_locked(&mut state);
        Ok(())
    }

    pub async fn get_places(&self) -> Vec<pb::Place> {
        let state = self.state.lock().await;
        state.places.values().map(Place::to_proto).collect()
    }

    pub async fn add_place_alias(&self, name: &str, alias: &str) -> Result<()> {
        if alias.is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "alias must not be empty".into(),
            ));
        }
        let mut state = self.state.lock().await;
        if state.places.contains_key(alias) {
            return Err(CoordinatorError::AlreadyExists(format!(
                "alias {alias} is the name of a place"
            )));
        }
        if let Some(owner) = state.places.values().find(|p| p.aliases.contains(alias)) {
            return Err(CoordinatorError::AlreadyExists(format!(
                "alias {alias} is already used by place {}",
                owner.name
            )));
        }
        self.update_place(&mut state, name, |place| {
            place.aliases.insert(alias.to_string());
            Ok(())
        })
    }

    pub async fn delete_place_alias(&self, name: &str, alias: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        self.update_place(&mut state, name, |place| {
            if !place.aliases.remove(alias) {
                return Err(CoordinatorError::NotFound(format!(
                    "place {} has no alias {alias}",
                    place.name
                )));
            }
            Ok(())
        })
    }

    /// Merge tags into a place. An empty value removes the tag.
    pub async fn set_place_tags(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        for (k, v) in tags {
            validate_tag_key(k)?;
            validate_tag_value(k, v)?;
        }
        let mut state = self.state.lock().await;
        self.update_place(&mut state, name, |place| {
            for (k, v) in tags {
                if v.is_empty() {
                    place.tags.remove(k);
                } else {
                    place.tags.insert(k.clone(), v.clone());
                }
            }
            Ok(())
        })?;
        self.schedule_locked(&mut state);
        Ok(())
    }

    pub async fn set_place_comment(&self, name: &str, comment: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        self.update_place(&mut state, name, |place| {
            place.comment = comment.to_string();
            Ok(())
        })
    }

    pub async fn add_place_match(
        &self,
        name: &str,
        pattern: &str,
        rename: Option<String>,
    ) -> Result<()> {
        let new_match = ResourceMatch::parse(pattern, rename)?;
        let mut state = self.state.lock().await;
        self.update_place(&mut state, name, |place| {
            if place.matches.contains(&new_match) {
                return Err(CoordinatorError::AlreadyExists(format!(
                    "place {} already has match {new_match}",
                    place.name
                )));
            }
            place.matches.push(new_match);
            Ok(())
        })
    }

    pub async fn delete_place_match(
        &self,
        name: &str,
        pattern: &str,
        rename: Option<String>,
    ) -> Result<()> {
        let target = ResourceMatch::parse(pattern, rename)?;
        let mut state = self.state.lock().await;
        self.update_place(&mut state, name, |place| {
            let Some(index) = place
                .matches
                .iter()
                .position(|m| *m == target && (target.rename.is_none() || m.rename == target.rename))
            else {
                return Err(CoordinatorError::NotFound(format!(
                    "place {} has no match {target}",
                    place.name
                )));
            };
            place.matches.remove(index);
            Ok(())
        })
    }

    // =========================================================================
    // Ownership
    // =========================================================================

    /// Every published resource the place claims, ordered by exporter,
    /// group and resource name.
    fn matching_resources(&self, place: &Place) -> Vec<ResourceHandle> {
        let mut found: Vec<ResourceHandle> = self
            .exporters
            .all()
            .iter()
            .flat_map(|e| e.get_resources().into_values())
            .flat_map(BTreeMap::into_values)
            .filter(|h| place.claims(&h.path))
            .collect();
        found.sort_by(|a, b| {
            (&a.path.exporter, &a.path.group, &a.path.name, &a.path.cls).cmp(&(
                &b.path.exporter,
                &b.path.group,
                &b.path.name,
                &b.path.cls,
            ))
        });
        found
    }

    async fn set_acquired(
        &self,
        handle: &ResourceImport,
        place: Option<&str>,
    ) -> std::result::Result<(), CommandError> {
        let exporter = self
            .exporters
            .by_name(&handle.path.exporter)
            .ok_or(CommandError::Unknown)?;
        exporter
            .set_acquired(handle, place, self.config.command_timeout)
            .await
    }

    /// Acquire `candidates` for `place_name`, all or nothing.
    async fn acquire_resources(
        &self,
        state: &CoordinatorState,
        place_name: &str,
        candidates: Vec<ResourceHandle>,
    ) -> Result<Vec<ResourceHandle>> {
        for candidate in &candidates {
            // Our own record wins over whatever the exporter reports.
            let holder = state.places.values().find(|p| {
                p.name != place_name
                    && p.acquired_resources
                        .iter()
                        .any(|h| h.path == candidate.path)
            });
            if let Some(holder) = holder {
                return Err(CoordinatorError::FailedPrecondition(format!(
                    "resource {} is held by place {}",
                    candidate.path, holder.name
                )));
            }
            if let Some(owner) = candidate.acquired() {
                return Err(CoordinatorError::FailedPrecondition(format!(
                    "resource {} is already acquired by {owner}",
                    candidate.path
                )));
            }
        }

        let mut acquired: Vec<ResourceHandle> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self.set_acquired(&candidate, Some(place_name)).await {
                Ok(()) => acquired.push(candidate),
                Err(source) => {
                    warn!(
                        place = %place_name,
                        resource = %candidate.path,
                        error = %source,
                        rollback = acquired.len(),
                        "Failed to acquire resource, rolling back"
                    );
                    for handle in acquired.iter().rev() {
                        if let Err(e) = self.set_acquired(handle, None).await {
                            warn!(resource = %handle.path, error = %e, "Rollback release failed");
                            self.publish_resource(handle);
                        }
                    }
                    return Err(CoordinatorError::Exporter {
                        resource: candidate.path.to_string(),
                        source,
                    });
                }
            }
        }
        Ok(acquired)
    }

    /// Release handles, continuing past failures.
    async fn release_resources(&self, handles: &[ResourceHandle]) {
        for handle in handles {
            if handle.is_orphaned() {
                debug!(resource = %handle.path, "Skipping release of orphaned resource");
                continue;
            }
            if let Err(e) = self.set_acquired(handle, None).await {
                warn!(resource = %handle.path, error = %e, "Failed to release resource");
                self.publish_resource(handle);
            }
        }
    }

    pub async fn acquire_place(&self, name: &str, principal: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let place = state.places.get(name).ok_or_else(|| place_not_found(name))?;

        if let Some(owner) = &place.acquired {
            return Err(CoordinatorError::FailedPrecondition(format!(
                "place {name} is already acquired by {owner}"
            )));
        }
        if let Some(reservation) = place.reservation.and_then(|t| state.reservations.get(&t)) {
            if reservation.owner != principal {
                return Err(CoordinatorError::PermissionDenied(format!(
                    "place {name} is reserved by {}",
                    reservation.owner
                )));
            }
        }

        let candidates = self.matching_resources(place);
        let acquired = self.acquire_resources(&state, name, candidates).await?;

        let place = state
            .places
            .get_mut(name)
            .ok_or_else(|| place_not_found(name))?;
        place.acquired = Some(principal.to_string());
        place.acquired_resources.extend(acquired);
        place.touch();
        self.publish_place(place);
        info!(
            place = %name,
            principal = %principal,
            resources = place.acquired_resources.len(),
            "Place acquired"
        );

        self.mark_dirty();
        self.schedule_locked(&mut state);
        Ok(())
    }

    /// Release a place.
    ///
    /// With `fromuser`, the release only happens if that principal holds
    /// the place and is otherwise a successful no-op.
    pub async fn release_place(&self, name: &str, fromuser: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().await;
        let place = state.places.get(name).ok_or_else(|| place_not_found(name))?;

        match (fromuser, place.acquired.as_deref()) {
            (Some(user), owner) if owner != Some(user) => {
                debug!(place = %name, fromuser = %user, "Release skipped, not held by user");
                return Ok(());
            }
            (None, None) => {
                return Err(CoordinatorError::FailedPrecondition(format!(
                    "place {name} is not acquired"
                )));
            }
            _ => {}
        }

        let handles = place.acquired_resources.clone();
        self.release_resources(&handles).await;

        let place = state
            .places
            .get_mut(name)
            .ok_or_else(|| place_not_found(name))?;
        place.acquired = None;
        place.acquired_resources.clear();
        place.allowed.clear();
        place.touch();
        self.publish_place(place);
        info!(place = %name, "Place released");

        self.mark_dirty();
        self.schedule_locked(&mut state);
        Ok(())
    }

    pub async fn allow_place(&self, name: &str, principal: &str, user: &str) -> Result<()> {
        if user.is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "user must not be empty".into(),
            ));
        }
        let mut state = self.state.lock().await;
        self.update_place(&mut state, name, |place| {
            match place.acquired.as_deref() {
                None => Err(CoordinatorError::FailedPrecondition(format!(
                    "place {name} is not acquired"
                ))),
                Some(owner) if owner != principal => {
                    Err(CoordinatorError::FailedPrecondition(format!(
                        "place {name} is acquired by {owner}"
                    )))
                }
                Some(_) => {
                    place.allowed.insert(user.to_string());
                    Ok(())
                }
            }
        })
    }

    // =========================================================================
    // Reservations
    // =========================================================================

    pub async fn create_reservation(
        &self,
        owner: &str,
        filters: BTreeMap<String, BTreeMap<String, String>>,
        prio: f64,
    ) -> Result<pb::Reservation> {
        if !prio.is_finite() {
            return Err(CoordinatorError::InvalidArgument(
                "priority must be a finite number".into(),
            ));
        }
        Reservation::validate_filters(&filters)?;

        let mut state = self.state.lock().await;
        let reservation = Reservation::new(owner, filters, prio, self.config.reservation_timeout);
        let token = reservation.token;
        info!(token = %token, owner = %owner, prio, "Reservation created");
        state.reservations.insert(token, reservation);
        self.schedule_locked(&mut state);

        state
            .reservations
            .get(&token)
            .map(Reservation::to_proto)
            .ok_or_else(|| reservation_not_found(&token.to_string()))
    }

    pub async fn cancel_reservation(&self, token: &str) -> Result<()> {
        let parsed = parse_token(token)?;
        let mut state = self.state.lock().await;
        if state.reservations.remove(&parsed).is_none() {
            return Err(reservation_not_found(token));
        }
        info!(token = %parsed, "Reservation cancelled");
        self.schedule_locked(&mut state);
        Ok(())
    }

    /// Refresh a live reservation's deadline and return it.
    pub async fn poll_reservation(&self, token: &str) -> Result<pb::Reservation> {
        let parsed = parse_token(token)?;
        let mut state = self.state.lock().await;
        let timeout = self.config.reservation_timeout;
        let reservation = state
            .reservations
            .get_mut(&parsed)
            .ok_or_else(|| reservation_not_found(token))?;
        if !reservation.state.is_terminal() {
            reservation.refresh(timeout);
        }
        Ok(reservation.to_proto())
    }

    pub async fn get_reservations(&self) -> Vec<pb::Reservation> {
        let state = self.state.lock().await;
        state
            .reservations
            .values()
            .map(Reservation::to_proto)
            .collect()
    }

    /// Advance every reservation and allocate free places.
    pub async fn schedule_reservations(&self) {
        let mut state = self.state.lock().await;
        self.schedule_locked(&mut state);
    }

    fn schedule_locked(&self, state: &mut CoordinatorState) {
        let now = Utc::now();
        let timeout = self.config.reservation_timeout;

        state.reservations.retain(|token, res| {
            let keep = !(res.state.is_terminal() && res.is_past_deadline(now));
            if !keep {
                info!(token = %token, "Reservation deleted after grace period");
            }
            keep
        });

        for res in state.reservations.values_mut() {
            if res.state.expires() && res.is_past_deadline(now) {
                info!(token = %res.token, owner = %res.owner, "Reservation expired");
                res.state = ReservationState::Expired;
                res.allocations.clear();
                res.refresh(timeout);
            }
        }

        for res in state.reservations.values_mut() {
            if !matches!(
                res.state,
                ReservationState::Allocated | ReservationState::Acquired
            ) {
                continue;
            }
            let mut invalid = false;
            let mut acquired = false;
            for name in res.allocated_places() {
                match state.places.get(name) {
                    None => invalid = true,
                    Some(place) => acquired |= place.acquired.is_some(),
                }
            }

            if invalid {
                warn!(token = %res.token, "Allocated place vanished, reservation invalid");
                res.state = ReservationState::Invalid;
                res.allocations.clear();
                res.refresh(self.config.invalid_grace);
                continue;
            }
            match (res.state, acquired) {
                (ReservationState::Allocated, true) => {
                    debug!(token = %res.token, "Reservation acquired");
                    res.state = ReservationState::Acquired;
                }
                (ReservationState::Acquired, false) => {
                    debug!(token = %res.token, "Reservation back to allocated");
                    res.state = ReservationState::Allocated;
                }
                _ => {}
            }
            if res.state == ReservationState::Acquired {
                res.refresh(timeout);
            }
        }

        let allocated: BTreeSet<&String> = state
            .reservations
            .values()
            .filter(|r| {
                matches!(
                    r.state,
                    ReservationState::Allocated | ReservationState::Acquired
                )
            })
            .flat_map(Reservation::allocated_places)
            .collect();

        let free: Vec<TagSet> = state
            .places
            .values()
            .filter(|p| p.acquired.is_none() && !allocated.contains(&p.name))
            .map(|p| TagSet {
                name: p.name.clone(),
                tags: p.scheduling_tags(),
                rank: 0,
            })
            .collect();

        let mut pending: Vec<&Reservation> = state
            .reservations
            .values()
            .filter(|r| r.state == ReservationState::Waiting)
            .collect();
        pending.sort_by(|a, b| {
            b.prio
                .total_cmp(&a.prio)
                .then_with(|| a.created.cmp(&b.created))
                .then_with(|| a.token.cmp(&b.token))
        });

        let by_name: HashMap<String, ReservationToken> = pending
            .iter()
            .map(|r| (r.token.to_string(), r.token))
            .collect();
        let filters: Vec<TagSet> = pending
            .iter()
            .enumerate()
            .map(|(rank, r)| TagSet {
                name: r.token.to_string(),
                tags: r
                    .filters
                    .get(MAIN_FILTER)
                    .into_iter()
                    .flatten()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                rank: rank as u64,
            })
            .collect();

        let assignment = if free.is_empty() || filters.is_empty() {
            BTreeMap::new()
        } else {
            schedule(&free, &filters)
        };

        for (filter, place) in assignment {
            let Some(res) = by_name
                .get(&filter)
                .and_then(|t| state.reservations.get_mut(t))
            else {
                continue;
            };
            info!(token = %res.token, place = %place, "Reservation allocated");
            res.state = ReservationState::Allocated;
            res.allocations = BTreeMap::from([(MAIN_FILTER.to_string(), vec![place])]);
            res.refresh(timeout);
        }

        let mut owners: BTreeMap<String, ReservationToken> = BTreeMap::new();
        for res in state.reservations.values() {
            if matches!(
                res.state,
                ReservationState::Allocated | ReservationState::Acquired
            ) {
                for name in res.allocated_places() {
                    owners.insert(name.clone(), res.token);
                }
            }
        }
        for place in state.places.values_mut() {
            let wanted = owners.get(&place.name).copied();
            if place.reservation != wanted {
                place.reservation = wanted;
                place.touch();
                self.publish_place(place);
            }
        }
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Bring exporters in line with the places' acquired resources.
    #[instrument(skip(self))]
    pub async fn synchronize_resources(&self) -> SyncStats {
        let mut state = self.state.lock().await;
        let mut stats = SyncStats::default();

        let mut published: BTreeMap<ResourcePath, ResourceHandle> = BTreeMap::new();
        let mut claims: BTreeMap<ResourcePath, Claim> = BTreeMap::new();
        for exporter in self.exporters.all() {
            for handle in exporter
                .get_resources()
                .into_values()
                .flat_map(BTreeMap::into_values)
            {
                let claim = match handle.acquired() {
                    None => Claim::Free,
                    Some(place) if place == BROKEN_MARKER => Claim::Broken,
                    Some(place) => Claim::Place(place),
                };
                claims.insert(handle.path.clone(), claim);
                published.insert(handle.path.clone(), handle);
            }
        }

        let holdings: Vec<Holding<ResourcePath>> = state
            .places
            .values()
            .filter(|p| p.acquired.is_some())
            .flat_map(|p| {
                p.acquired_resources.iter().map(|h| Holding {
                    place: p.name.clone(),
                    path: h.path.clone(),
                    orphaned: h.is_orphaned(),
                })
            })
            .collect();

        let plan = plan_drift(&claims, &holdings);
        state.retries.prune();
        if plan.is_empty() {
            return stats;
        }
        for (path, places) in &plan.conflicts {
            error!(resource = %path, places = ?places, "Resource held by more than one place");
        }
        stats.conflicts = plan.conflicts.len();

        for path in &plan.release {
            let key = path.to_string();
            let Some(handle) = published.get(path) else {
                continue;
            };
            if state.retries.is_exhausted(&key) {
                continue;
            }
            match self.set_acquired(handle, None).await {
                Ok(()) => {
                    info!(resource = %key, "Released resource not held by any place");
                    state.retries.clear(&key);
                    stats.released += 1;
                }
                Err(e) => {
                    warn!(resource = %key, error = %e, "Failed to release stray resource");
                    state.retries.record_failure(&key);
                    stats.failed += 1;
                }
            }
        }

        let mut unresolved: BTreeSet<&ResourcePath> = BTreeSet::new();
        for (path, place) in &plan.acquire {
            let key = path.to_string();
            let Some(handle) = published.get(path) else {
                continue;
            };
            if state.retries.is_exhausted(&key) {
                unresolved.insert(path);
                continue;
            }
            match self.set_acquired(handle, Some(place)).await {
                Ok(()) => {
                    info!(resource = %key, place = %place, "Re-acquired resource for place");
                    state.retries.clear(&key);
                    stats.acquired += 1;
                }
                Err(e) => {
                    warn!(resource = %key, place = %place, error = %e, "Failed to re-acquire resource");
                    state.retries.record_failure(&key);
                    unresolved.insert(path);
                    stats.failed += 1;
                }
            }
        }

        for (path, place_name) in &plan.replace {
            if unresolved.contains(path) {
                continue;
            }
            let (Some(fresh), Some(place)) = (published.get(path), state.places.get_mut(place_name))
            else {
                continue;
            };
            let Some(slot) = place.acquired_resources.iter_mut().find(|h| h.path == *path) else {
                continue;
            };
            if Arc::ptr_eq(slot, fresh) {
                continue;
            }
            *slot = Arc::clone(fresh);
            place.touch();
            self.publish_place(place);
            info!(resource = %path, place = %place_name, "Replaced orphaned resource");
            stats.replaced += 1;
        }

        stats
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Save if anything changed since the last save.
    pub async fn save_if_dirty(&self) -> std::result::Result<bool, PersistenceError> {
        let Some(persistence) = &self.persistence else {
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        let snapshot = {
            let state = self.state.lock().await;
            Snapshot::capture(state.places.values(), &self.exporters.all())
        };
        if let Err(e) = persistence.save_in_background(snapshot).await {
            self.mark_dirty();
            return Err(e);
        }
        Ok(true)
    }

    /// Save unconditionally, e.g. on shutdown.
    pub async fn save(&self) -> std::result::Result<(), PersistenceError> {
        self.mark_dirty();
        self.save_if_dirty().await.map(|_| ())
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Attach an exporter stream. Returns the outbound half.
    pub fn connect_exporter<S>(
        self: &Arc<Self>,
        peer: Option<SocketAddr>,
        inbound: S,
    ) -> impl Stream<Item = std::result::Result<pb::ExporterOutMessage, Status>> + Send + 'static
    where
        S: Stream<Item = std::result::Result<pb::ExporterInMessage, Status>>
            + Send
            + Unpin
            + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let pending = PendingCommands::default();
        let outbound = outbound_stream(VERSION.to_string(), rx, pending.clone(), close_tx);

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let slot = Arc::new(OnceLock::new());
            let mut reader = tokio::spawn(Arc::clone(&coordinator).read_exporter_stream(
                peer,
                inbound,
                tx,
                pending.clone(),
                Arc::clone(&slot),
            ));

            tokio::select! {
                result = &mut reader => {
                    if let Err(e) = result {
                        error!(error = %e, "Exporter reader task failed");
                    }
                }
                _ = close_rx => {
                    reader.abort();
                    let _ = reader.await;
                }
            }

            pending.fail_all();
            if let Some((session, follow_ups)) = slot.get() {
                coordinator.disconnect_exporter(session, follow_ups);
            }
        });

        outbound
    }

    async fn read_exporter_stream<S>(
        self: Arc<Self>,
        peer: Option<SocketAddr>,
        mut inbound: S,
        tx: mpsc::UnboundedSender<crate::session::Outbound>,
        pending: PendingCommands,
        slot: Arc<OnceLock<(Arc<ExporterSession>, mpsc::UnboundedSender<FollowUp>)>>,
    ) where
        S: Stream<Item = std::result::Result<pb::ExporterInMessage, Status>> + Unpin,
    {
        use pb::exporter_in_message::Kind;

        while let Some(message) = inbound.next().await {
            let message = match message {
                Ok(message) => message,
                Err(status) => {
                    debug!(peer = ?peer, status = %status, "Exporter stream failed");
                    break;
                }
            };

            match message.kind {
                Some(Kind::Startup(startup)) => {
                    if slot.get().is_some() {
                        warn!(peer = ?peer, "Ignoring repeated exporter startup");
                        continue;
                    }
                    let session = Arc::new(ExporterSession::new(
                        peer,
                        startup.name.clone(),
                        startup.version,
                        tx.clone(),
                    ));
                    if startup.name.is_empty() {
                        session.abort(Status::invalid_argument("exporter name must not be empty"));
                        break;
                    }
                    if !self.exporters.insert(Arc::clone(&session)) {
                        warn!(exporter = %startup.name, peer = ?peer, "Rejecting duplicate exporter");
                        session.abort(Status::already_exists(format!(
                            "exporter {} is already connected",
                            startup.name
                        )));
                        break;
                    }
                    let (follow_tx, follow_rx) = mpsc::unbounded_channel();
                    tokio::spawn(Arc::clone(&self).run_follow_ups(follow_rx));
                    info!(
                        exporter = %session.name,
                        version = %session.version,
                        peer = ?peer,
                        "Exporter connected"
                    );
                    let _ = slot.set((session, follow_tx));
                }
                Some(Kind::Resource(resource)) => {
                    let Some((session, follow_ups)) = slot.get() else {
                        warn!(peer = ?peer, "Resource update before exporter startup");
                        continue;
                    };
                    let Some(path) = resource.path.as_ref() else {
                        warn!(exporter = %session.name, "Resource update without a path");
                        continue;
                    };
                    let changed = session.set_resource(
                        &path.group_name,
                        &path.resource_name,
                        Some(&resource),
                        &self.clients,
                    );
                    match changed {
                        Some((SetResourceAction::Add, handle)) => {
                            self.mark_dirty();
                            let _ = follow_ups.send(FollowUp::Added(handle));
                        }
                        Some((SetResourceAction::Delete, handle)) => {
                            self.mark_dirty();
                            let _ = follow_ups.send(FollowUp::Removed(handle));
                        }
                        Some((SetResourceAction::Update, _)) | None => {}
                    }
                }
                Some(Kind::Response(response)) => pending.complete(response),
                None => warn!(peer = ?peer, "Empty exporter message"),
            }
        }
    }

    /// Remove a closed exporter and delete everything it published.
    fn disconnect_exporter(
        &self,
        session: &Arc<ExporterSession>,
        follow_ups: &mpsc::UnboundedSender<FollowUp>,
    ) {
        let mut orphaned = 0;
        for (group, resources) in session.get_resources() {
            for name in resources.keys() {
                if let Some((_, handle)) = session.set_resource(&group, name, None, &self.clients) {
                    if handle.is_orphaned() {
                        orphaned += 1;
                    }
                    let _ = follow_ups.send(FollowUp::Removed(handle));
                }
            }
        }
        self.exporters.remove(session.id);
        self.mark_dirty();
        info!(exporter = %session.name, orphaned, "Exporter disconnected");
    }

    async fn run_follow_ups(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<FollowUp>) {
        while let Some(follow_up) = rx.recv().await {
            match follow_up {
                FollowUp::Added(handle) => self.resource_added(handle).await,
                FollowUp::Removed(handle) => self.resource_removed(handle).await,
            }
        }
    }

    async fn resource_added(&self, handle: ResourceHandle) {
        let mut state = self.state.lock().await;
        let group = &handle.path.group;

        if !group.is_empty()
            && group.chars().all(|c| c.is_ascii_digit())
            && !state.places.contains_key(group)
        {
            match ResourceMatch::parse(&format!("*/{group}/*"), None) {
                Ok(m) => {
                    let mut place = Place::new(group.clone());
                    place.matches.push(m);
                    self.publish_place(&place);
                    state.places.insert(group.clone(), place);
                    self.mark_dirty();
                    info!(place = %group, "Created default place for numeric group");
                    self.schedule_locked(&mut state);
                }
                Err(e) => warn!(group = %group, error = %e, "Cannot build default place match"),
            }
        }

        let claiming: Vec<String> = state
            .places
            .values()
            .filter(|p| p.acquired.is_some() && p.claims(&handle.path))
            .map(|p| p.name.clone())
            .collect();
        let [place_name] = claiming.as_slice() else {
            if claiming.len() > 1 {
                warn!(
                    resource = %handle.path,
                    places = ?claiming,
                    "New resource claimed by several acquired places, not attaching"
                );
            }
            return;
        };

        if handle.acquired().is_some() {
            return;
        }
        let already_held = state.places.get(place_name).is_some_and(|p| {
            p.acquired_resources
                .iter()
                .any(|h| h.path == handle.path)
        });
        if already_held {
            // The stale handle is swapped by reconciliation.
            return;
        }

        match self
            .acquire_resources(&state, place_name, vec![Arc::clone(&handle)])
            .await
        {
            Ok(acquired) => {
                if let Some(place) = state.places.get_mut(place_name) {
                    place.acquired_resources.extend(acquired);
                    place.touch();
                    self.publish_place(place);
                    info!(resource = %handle.path, place = %place_name, "Attached new resource to acquired place");
                }
            }
            Err(e) => {
                warn!(resource = %handle.path, place = %place_name, error = %e, "Failed to attach new resource");
            }
        }
    }

    async fn resource_removed(&self, handle: ResourceHandle) {
        let state = self.state.lock().await;
        for place in state.places.values() {
            if place
                .acquired_resources
                .iter()
                .any(|h| Arc::ptr_eq(h, &handle))
            {
                warn!(resource = %handle.path, place = %place.name, "Acquired resource orphaned");
                self.publish_place(place);
            }
        }
    }

    /// Attach a client stream. Returns the outbound half.
    pub fn connect_client<S>(
        self: &Arc<Self>,
        peer: Option<SocketAddr>,
        inbound: S,
    ) -> impl Stream<Item = std::result::Result<pb::ClientOutMessage, Status>> + Send + 'static
    where
        S: Stream<Item = std::result::Result<pb::ClientInMessage, Status>>
            + Send
            + Unpin
            + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel::<()>();
        let session = Arc::new(ClientSession::new(peer, tx));
        self.clients.insert(Arc::clone(&session));
        debug!(
            session = %session.id,
            peer = ?peer,
            clients = self.clients.len(),
            "Client connected"
        );

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut reader = tokio::spawn(
                Arc::clone(&coordinator).read_client_stream(Arc::clone(&session), inbound),
            );

            tokio::select! {
                result = &mut reader => {
                    if let Err(e) = result {
                        error!(error = %e, "Client reader task failed");
                    }
                }
                _ = close_rx => {
                    reader.abort();
                    let _ = reader.await;
                }
            }

            coordinator.clients.remove(session.id);
            debug!(
                session = %session.id,
                principal = ?session.principal(),
                version = ?session.version(),
                "Client disconnected"
            );
        });

        UnboundedReceiverStream::new(rx).map(move |message| {
            let _close_guard = &close_tx;
            Ok(message)
        })
    }

    async fn read_client_stream<S>(self: Arc<Self>, session: Arc<ClientSession>, mut inbound: S)
    where
        S: Stream<Item = std::result::Result<pb::ClientInMessage, Status>> + Unpin,
    {
        use pb::client_in_message::Kind;

        while let Some(message) = inbound.next().await {
            let message = match message {
                Ok(message) => message,
                Err(status) => {
                    debug!(session = %session.id, status = %status, "Client stream failed");
                    break;
                }
            };

            match message.kind {
                Some(Kind::Sync(sync)) => session.sync(sync.id),
                Some(Kind::Startup(startup)) => {
                    info!(
                        session = %session.id,
                        name = %startup.name,
                        version = %startup.version,
                        "Client started"
                    );
                    session.startup(startup.name, startup.version);
                }
                Some(Kind::Subscribe(subscribe)) => {
                    if let Some(enable) = subscribe.all_places {
                        let state = self.state.lock().await;
                        session.subscribe_places(enable, state.places.values());
                    }
                    if let Some(enable) = subscribe.all_resources {
                        self.exporters
                            .with_all(|exporters| session.subscribe_resources(enable, exporters));
                    }
                }
                None => warn!(session = %session.id, "Empty client message"),
            }
        }
    }
}

fn place_not_found(name: &str) -> CoordinatorError {
    CoordinatorError::NotFound(format!("place {name} does not exist"))
}

fn reservation_not_found(token: &str) -> CoordinatorError {
    CoordinatorError::NotFound(format!("reservation {token} does not exist"))
}

fn parse_token(token: &str) -> Result<ReservationToken> {
    ReservationToken::parse(token).map_err(|e| {
        if e.is_prefix_error() {
            CoordinatorError::InvalidArgument(format!("{token} is not a reservation token"))
        } else {
            CoordinatorError::InvalidArgument(format!("invalid reservation token: {e}"))
        }
    })
}
