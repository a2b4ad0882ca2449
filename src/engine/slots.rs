use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime, Utc};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::generator::{date_range, day_slices, window_slices};
use super::overlap::{minutes_of, subtract_windows, time_from_minutes};
use super::{DayKey, Engine, EngineError, FieldError, day_key_of};

// ── Validators ───────────────────────────────────────────
//
// Explicit and composable; each pushes every failure it sees so the caller
// gets the full list in one Validation error.

fn validate_times(start: NaiveTime, end: NaiveTime, errors: &mut Vec<FieldError>) {
    if start >= end {
        errors.push(FieldError::new("start_time", "must be before end_time"));
    }
}

fn validate_duration(duration_minutes: u32, errors: &mut Vec<FieldError>) {
    if duration_minutes == 0 {
        errors.push(FieldError::new("duration_minutes", "must be positive"));
    }
}

fn validate_capacity(capacity: u32, errors: &mut Vec<FieldError>) {
    if capacity == 0 {
        errors.push(FieldError::new("capacity", "must be at least 1"));
    } else if capacity > MAX_CAPACITY {
        errors.push(FieldError::new(
            "capacity",
            format!("must not exceed {MAX_CAPACITY}"),
        ));
    }
}

fn validate_date_order(start: NaiveDate, end: NaiveDate, errors: &mut Vec<FieldError>) {
    if end < start {
        errors.push(FieldError::new("end_date", "must not precede start_date"));
    }
}

/// Lifecycle rules for explicit status changes. Booked is owned by the
/// capacity manager and cannot be entered or left by hand; Cancelled is
/// terminal; cancellation requires zero bookings.
fn check_transition(slot: &Slot, to: SlotStatus) -> Result<(), EngineError> {
    use SlotStatus::*;
    let from = slot.status;
    if from == to {
        return Ok(());
    }
    let allowed = match (from, to) {
        (Available, Blocked) | (Booked, Blocked) => true,
        (Blocked, Available) => true,
        (Available, Cancelled) | (Booked, Cancelled) => {
            if slot.booked_count > 0 {
                return Err(EngineError::SlotHasBookings {
                    slot_id: slot.id,
                    booked: slot.booked_count,
                });
            }
            true
        }
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition { from, to })
    }
}

/// One day's worth of candidate slices, produced by the planning phase and
/// consumed by the locked write phase.
struct DayPlan {
    date: NaiveDate,
    slices: Vec<(NaiveTime, NaiveTime)>,
}

impl Engine {
    /// Slot write lock with a liveness re-check: the handle may have been
    /// removed from the map while we waited for the lock.
    pub(super) async fn slot_write(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<Slot>, EngineError> {
        let handle = self.slot_handle(id).ok_or(EngineError::NotFound(*id))?;
        let guard = handle.write_owned().await;
        if !self.slots.contains_key(id) {
            return Err(EngineError::NotFound(*id));
        }
        Ok(guard)
    }

    /// Ids in the day scope whose `[start, end)` intersects the candidate.
    /// Caller holds the day lock; slot reads here are brief.
    async fn overlapping_in_day(
        &self,
        ids: &[Ulid],
        start: NaiveTime,
        end: NaiveTime,
        exclude: Option<Ulid>,
    ) -> Vec<Ulid> {
        let mut conflicting = Vec::new();
        for sid in ids {
            if Some(*sid) == exclude {
                continue;
            }
            if let Some(handle) = self.slot_handle(sid) {
                let guard = handle.read().await;
                if guard.overlaps_times(start, end) {
                    conflicting.push(*sid);
                }
            }
        }
        conflicting
    }

    // ── Single-slot creation (always overlap-guarded) ────

    pub async fn create_slot(&self, req: CreateSlotRequest) -> Result<Slot, EngineError> {
        let mut errors = Vec::new();
        validate_times(req.start_time, req.end_time, &mut errors);
        validate_duration(req.duration_minutes, &mut errors);
        validate_capacity(req.capacity, &mut errors);
        EngineError::check(errors)?;

        let key: DayKey = (req.provider_id, req.provider_service_id, req.slot_date);
        let day = self.day_entry(&key);
        let mut ids = day.write().await;

        let conflicting = self
            .overlapping_in_day(&ids, req.start_time, req.end_time, None)
            .await;
        if !conflicting.is_empty() {
            return Err(EngineError::SlotOverlap { conflicting });
        }

        let now = Utc::now();
        let slot = Slot {
            id: Ulid::new(),
            org_id: req.org_id,
            provider_id: req.provider_id,
            provider_service_id: req.provider_service_id,
            config_id: None,
            slot_date: req.slot_date,
            start_time: req.start_time,
            end_time: req.end_time,
            duration_minutes: req.duration_minutes,
            capacity: req.capacity,
            booked_count: 0,
            status: SlotStatus::Available,
            created_at: now,
            updated_at: now,
        };
        let event = Event::SlotCreated {
            id: slot.id,
            org_id: slot.org_id,
            provider_id: slot.provider_id,
            provider_service_id: slot.provider_service_id,
            config_id: None,
            slot_date: slot.slot_date,
            start_time: slot.start_time,
            end_time: slot.end_time,
            duration_minutes: slot.duration_minutes,
            capacity: slot.capacity,
            status: slot.status,
            created_at: slot.created_at,
        };
        self.wal_append(&event).await?;
        self.slots.insert(slot.id, Arc::new(RwLock::new(slot.clone())));
        ids.push(slot.id);

        metrics::counter!(crate::observability::SLOTS_CREATED_TOTAL).increment(1);
        metrics::gauge!(crate::observability::SLOTS_ACTIVE).set(self.slots.len() as f64);
        info!(
            slot = %slot.id,
            provider = %slot.provider_id,
            date = %slot.slot_date,
            "slot created"
        );
        Ok(slot)
    }

    // ── Bulk generation ──────────────────────────────────

    /// Expand a date range x daily window x duration into slots. Identical
    /// `(provider, service, date, start)` slots are skipped, so a re-run is
    /// idempotent and a crashed run resumes safely. Only newly created slots
    /// are returned.
    pub async fn create_bulk_slots(
        &self,
        req: BulkCreateSlotsRequest,
    ) -> Result<Vec<Slot>, EngineError> {
        let mut errors = Vec::new();
        validate_times(req.daily_start_time, req.daily_end_time, &mut errors);
        validate_duration(req.duration_minutes, &mut errors);
        validate_capacity(req.capacity, &mut errors);
        validate_date_order(req.start_date, req.end_date, &mut errors);
        EngineError::check(errors)?;
        if (req.end_date - req.start_date).num_days() >= MAX_RANGE_DAYS {
            return Err(EngineError::LimitExceeded("date range too wide"));
        }

        let slices = day_slices(req.daily_start_time, req.daily_end_time, req.duration_minutes);
        let plan: Vec<DayPlan> = date_range(req.start_date, req.end_date)
            .into_iter()
            .map(|date| DayPlan {
                date,
                slices: slices.clone(),
            })
            .collect();

        let created = self
            .materialize_slots(
                req.org_id,
                req.provider_id,
                req.provider_service_id,
                None,
                req.duration_minutes,
                req.capacity,
                plan,
            )
            .await?;
        info!(
            provider = %req.provider_id,
            from = %req.start_date,
            to = %req.end_date,
            created = created.len(),
            "bulk slots generated"
        );
        Ok(created)
    }

    /// Materialize a config into slots over `[from, to]`, honoring the
    /// recurrence rule and punching out windows covered by active Blocked
    /// configs in the same scope. Slots carry the config id and inherit
    /// `max_concurrent_bookings` as capacity.
    pub async fn generate_slots_from_config(
        &self,
        config_id: Ulid,
        org_id: Ulid,
        provider_service_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        duration_minutes: u32,
    ) -> Result<Vec<Slot>, EngineError> {
        let cfg = {
            let handle = self
                .config_handle(&config_id)
                .ok_or(EngineError::NotFound(config_id))?;
            handle.read().await.clone()
        };
        if !cfg.is_active {
            return Err(EngineError::ConfigInactive(config_id));
        }

        let mut errors = Vec::new();
        if cfg.config_type == ConfigType::Blocked {
            errors.push(FieldError::new(
                "config_type",
                "cannot generate slots from a blackout config",
            ));
        }
        if let Some(own) = cfg.service_id
            && own != provider_service_id
        {
            errors.push(FieldError::new(
                "provider_service_id",
                "config is bound to a different service",
            ));
        }
        validate_duration(duration_minutes, &mut errors);
        validate_date_order(from, to, &mut errors);
        EngineError::check(errors)?;
        if (to - from).num_days() >= MAX_RANGE_DAYS {
            return Err(EngineError::LimitExceeded("date range too wide"));
        }

        // Clamp to the config's own coverage.
        let from = from.max(cfg.start_date);
        let to = to.min(cfg.effective_end_date());
        if from > to {
            return Ok(Vec::new());
        }

        // Snapshot of blackout configs in scope.
        let blocked = self
            .active_blocked_configs(cfg.provider_id, provider_service_id)
            .await;

        let window = (minutes_of(cfg.start_time), minutes_of(cfg.end_time));
        let mut plan = Vec::new();
        for date in date_range(from, to) {
            if !cfg.in_effect_on(date) {
                continue;
            }
            let mut blackouts: Vec<(u32, u32)> = blocked
                .iter()
                .filter(|b| b.in_effect_on(date))
                .map(|b| (minutes_of(b.start_time), minutes_of(b.end_time)))
                .collect();
            blackouts.sort_unstable();

            let mut slices_for_day = Vec::new();
            for free in subtract_windows(window, &blackouts) {
                for (s, e) in window_slices(free, duration_minutes) {
                    slices_for_day.push((time_from_minutes(s), time_from_minutes(e)));
                }
            }
            if !slices_for_day.is_empty() {
                plan.push(DayPlan {
                    date,
                    slices: slices_for_day,
                });
            }
        }

        let created = self
            .materialize_slots(
                org_id,
                cfg.provider_id,
                provider_service_id,
                Some(config_id),
                duration_minutes,
                cfg.max_concurrent_bookings,
                plan,
            )
            .await?;
        info!(
            config = %config_id,
            from = %from,
            to = %to,
            created = created.len(),
            "slots generated from config"
        );
        Ok(created)
    }

    async fn active_blocked_configs(
        &self,
        provider_id: Ulid,
        provider_service_id: Ulid,
    ) -> Vec<AvailabilityConfig> {
        let entry = self.provider_entry(provider_id);
        let ids = entry.read().await.clone();
        let mut blocked = Vec::new();
        for cid in ids {
            if let Some(handle) = self.config_handle(&cid) {
                let cfg = handle.read().await;
                if cfg.is_active
                    && cfg.config_type == ConfigType::Blocked
                    && cfg.applies_to_service(provider_service_id)
                {
                    blocked.push(cfg.clone());
                }
            }
        }
        blocked
    }

    /// Two-phase write shared by bulk generation paths. Day locks are taken
    /// in date order and held across both phases, so the whole call is
    /// all-or-nothing against concurrent structural changes: phase 1
    /// validates every slice (skipping identical existing starts), phase 2
    /// appends and inserts.
    async fn materialize_slots(
        &self,
        org_id: Ulid,
        provider_id: Ulid,
        provider_service_id: Ulid,
        config_id: Option<Ulid>,
        duration_minutes: u32,
        capacity: u32,
        plan: Vec<DayPlan>,
    ) -> Result<Vec<Slot>, EngineError> {
        let mut guards: Vec<OwnedRwLockWriteGuard<Vec<Ulid>>> = Vec::with_capacity(plan.len());
        for day in &plan {
            let key: DayKey = (provider_id, provider_service_id, day.date);
            let entry = self.day_entry(&key);
            guards.push(entry.write_owned().await);
        }

        // Phase 1: decide which slices are new, reject real overlaps.
        let mut accepted: Vec<Vec<(NaiveTime, NaiveTime)>> = Vec::with_capacity(plan.len());
        for (day, ids) in plan.iter().zip(guards.iter()) {
            let mut day_accepted = Vec::new();
            for &(start, end) in &day.slices {
                let mut identical = false;
                for sid in ids.iter() {
                    if let Some(handle) = self.slot_handle(sid) {
                        let existing = handle.read().await;
                        if existing.start_time == start {
                            identical = true;
                            break;
                        }
                        if existing.overlaps_times(start, end) {
                            return Err(EngineError::SlotOverlap {
                                conflicting: vec![*sid],
                            });
                        }
                    }
                }
                if !identical {
                    day_accepted.push((start, end));
                }
            }
            accepted.push(day_accepted);
        }

        // Phase 2: everything validated — write through.
        let now = Utc::now();
        let mut created = Vec::new();
        for ((day, slices), ids) in plan.iter().zip(accepted).zip(guards.iter_mut()) {
            for (start, end) in slices {
                let slot = Slot {
                    id: Ulid::new(),
                    org_id,
                    provider_id,
                    provider_service_id,
                    config_id,
                    slot_date: day.date,
                    start_time: start,
                    end_time: end,
                    duration_minutes,
                    capacity,
                    booked_count: 0,
                    status: SlotStatus::Available,
                    created_at: now,
                    updated_at: now,
                };
                let event = Event::SlotCreated {
                    id: slot.id,
                    org_id,
                    provider_id,
                    provider_service_id,
                    config_id,
                    slot_date: slot.slot_date,
                    start_time: slot.start_time,
                    end_time: slot.end_time,
                    duration_minutes,
                    capacity,
                    status: slot.status,
                    created_at: slot.created_at,
                };
                self.wal_append(&event).await?;
                self.slots.insert(slot.id, Arc::new(RwLock::new(slot.clone())));
                ids.push(slot.id);
                created.push(slot);
            }
        }

        if !created.is_empty() {
            metrics::counter!(crate::observability::SLOTS_CREATED_TOTAL)
                .increment(created.len() as u64);
            metrics::gauge!(crate::observability::SLOTS_ACTIVE).set(self.slots.len() as f64);
        }
        Ok(created)
    }

    // ── Partial update ───────────────────────────────────

    /// Merge the provided fields over the slot. Identity fields (provider,
    /// service, date) are immutable; changing when a slot happens means
    /// deleting and regenerating it.
    pub async fn update_slot(
        &self,
        id: Ulid,
        req: UpdateSlotRequest,
    ) -> Result<Slot, EngineError> {
        let handle = self.slot_handle(&id).ok_or(EngineError::NotFound(id))?;
        let key = {
            let guard = handle.read().await;
            day_key_of(&guard)
        };
        let day = self.day_entry(&key);
        let ids = day.write().await;
        let mut guard = self.slot_write(&id).await?;

        let start_time = req.start_time.unwrap_or(guard.start_time);
        let end_time = req.end_time.unwrap_or(guard.end_time);
        let duration_minutes = req.duration_minutes.unwrap_or(guard.duration_minutes);
        let capacity = req.capacity.unwrap_or(guard.capacity);

        let mut errors = Vec::new();
        validate_times(start_time, end_time, &mut errors);
        validate_duration(duration_minutes, &mut errors);
        validate_capacity(capacity, &mut errors);
        if capacity < guard.booked_count {
            errors.push(FieldError::new(
                "capacity",
                format!("cannot drop below booked count {}", guard.booked_count),
            ));
        }
        EngineError::check(errors)?;

        if start_time != guard.start_time || end_time != guard.end_time {
            let conflicting = self
                .overlapping_in_day(&ids, start_time, end_time, Some(id))
                .await;
            if !conflicting.is_empty() {
                return Err(EngineError::SlotOverlap { conflicting });
            }
        }

        let event = Event::SlotUpdated {
            id,
            start_time,
            end_time,
            duration_minutes,
            capacity,
            updated_at: Utc::now(),
        };
        self.persist_and_apply_slot(&mut guard, &event).await?;
        info!(slot = %id, "slot updated");
        Ok(guard.clone())
    }

    // ── Capacity manager ─────────────────────────────────
    //
    // The write guard spans precondition check and mutation: two racing
    // claims serialize on the slot lock, and the loser sees the updated
    // count. A lost race is reported, never absorbed.

    pub async fn claim_slot_capacity(&self, id: Ulid) -> Result<Slot, EngineError> {
        let mut guard = self.slot_write(&id).await?;

        if matches!(guard.status, SlotStatus::Blocked | SlotStatus::Cancelled) {
            return Err(EngineError::SlotNotClaimable {
                slot_id: id,
                status: guard.status,
            });
        }
        if guard.booked_count >= guard.capacity {
            metrics::counter!(crate::observability::CLAIM_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::CapacityExhausted { slot_id: id });
        }

        let event = Event::CapacityClaimed {
            id,
            at: Utc::now(),
        };
        self.persist_and_apply_slot(&mut guard, &event).await?;
        metrics::counter!(crate::observability::CLAIMS_TOTAL).increment(1);
        debug!(slot = %id, booked = guard.booked_count, "capacity claimed");
        Ok(guard.clone())
    }

    /// Releasing an unbooked slot is a no-op, not an error.
    pub async fn release_slot_capacity(&self, id: Ulid) -> Result<Slot, EngineError> {
        let mut guard = self.slot_write(&id).await?;

        if guard.booked_count == 0 {
            debug!(slot = %id, "release on empty slot ignored");
            return Ok(guard.clone());
        }

        let event = Event::CapacityReleased {
            id,
            at: Utc::now(),
        };
        self.persist_and_apply_slot(&mut guard, &event).await?;
        metrics::counter!(crate::observability::RELEASES_TOTAL).increment(1);
        debug!(slot = %id, booked = guard.booked_count, "capacity released");
        Ok(guard.clone())
    }

    // ── Lifecycle ────────────────────────────────────────

    pub async fn set_slot_status(
        &self,
        id: Ulid,
        status: SlotStatus,
    ) -> Result<Slot, EngineError> {
        let mut guard = self.slot_write(&id).await?;
        check_transition(&guard, status)?;
        if guard.status == status {
            return Ok(guard.clone());
        }

        let event = Event::SlotStatusChanged {
            id,
            status,
            at: Utc::now(),
        };
        self.persist_and_apply_slot(&mut guard, &event).await?;
        info!(slot = %id, status = %status, "slot status changed");
        Ok(guard.clone())
    }

    /// Deletion is not a lifecycle transition: any status goes, as long as
    /// no capacity is held.
    pub async fn delete_slot(&self, id: Ulid) -> Result<(), EngineError> {
        let handle = self.slot_handle(&id).ok_or(EngineError::NotFound(id))?;
        let key = {
            let guard = handle.read().await;
            day_key_of(&guard)
        };
        let day = self.day_entry(&key);
        let mut ids = day.write().await;
        let guard = self.slot_write(&id).await?;

        if guard.booked_count > 0 {
            return Err(EngineError::SlotHasBookings {
                slot_id: id,
                booked: guard.booked_count,
            });
        }

        let event = Event::SlotDeleted { id };
        self.wal_append(&event).await?;
        self.slots.remove(&id);
        ids.retain(|sid| sid != &id);
        metrics::gauge!(crate::observability::SLOTS_ACTIVE).set(self.slots.len() as f64);
        info!(slot = %id, "slot deleted");
        Ok(())
    }

    // ── Expiry ───────────────────────────────────────────

    /// Candidates for the reaper: past-dated, still Available, unbooked.
    /// Contended slots are skipped; the next sweep picks them up.
    pub fn collect_expired_slots(&self, today: NaiveDate) -> Vec<Ulid> {
        let mut due = Vec::new();
        for entry in self.slots.iter() {
            if let Ok(guard) = entry.value().try_read()
                && guard.slot_date < today
                && guard.status == SlotStatus::Available
                && guard.booked_count == 0
            {
                due.push(guard.id);
            }
        }
        due
    }

    /// Retire one expired slot through the same locked transition as
    /// interactive cancellation. Returns false when a concurrent booking or
    /// status change invalidated the candidate between sweep and lock.
    pub async fn expire_slot(&self, id: Ulid, today: NaiveDate) -> Result<bool, EngineError> {
        let mut guard = match self.slot_write(&id).await {
            Ok(g) => g,
            Err(EngineError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if guard.slot_date >= today
            || guard.status != SlotStatus::Available
            || guard.booked_count > 0
        {
            return Ok(false);
        }
        check_transition(&guard, SlotStatus::Cancelled)?;

        let event = Event::SlotStatusChanged {
            id,
            status: SlotStatus::Cancelled,
            at: Utc::now(),
        };
        self.persist_and_apply_slot(&mut guard, &event).await?;
        metrics::counter!(crate::observability::SLOTS_REAPED_TOTAL).increment(1);
        Ok(true)
    }
}
