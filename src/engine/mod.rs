mod configs;
mod error;
mod generator;
mod overlap;
mod queries;
mod slots;

pub use error::{EngineError, FieldError};
pub use generator::{date_range, day_slices};
pub use overlap::{date_ranges_overlap, subtract_windows, times_overlap};
pub use queries::{Page, PageRequest, SlotFilter, SlotSort, SortDirection};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedSlot = Arc<RwLock<Slot>>;
pub type SharedConfig = Arc<RwLock<AvailabilityConfig>>;

/// Scope of the slot-overlap invariant and of structural serialization:
/// one provider service on one calendar date.
pub(super) type DayKey = (Ulid, Ulid, NaiveDate);

pub(super) fn day_key_of(slot: &Slot) -> DayKey {
    (slot.provider_id, slot.provider_service_id, slot.slot_date)
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) slots: DashMap<Ulid, SharedSlot>,
    pub(super) configs: DashMap<Ulid, SharedConfig>,
    /// (provider, service, date) → slot ids. The per-day write lock
    /// serializes structural changes (create/delete) in that scope; capacity
    /// claims never touch it.
    pub(super) day_index: DashMap<DayKey, Arc<RwLock<Vec<Ulid>>>>,
    /// provider → config ids, same serialization role for config mutations.
    pub(super) provider_configs: DashMap<Ulid, Arc<RwLock<Vec<Ulid>>>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

/// Apply an event to a slot in place (no locking — caller holds the guard).
/// Creation and deletion are handled at the map level, not here.
pub(super) fn apply_slot_event(slot: &mut Slot, event: &Event) {
    match event {
        Event::SlotUpdated {
            start_time,
            end_time,
            duration_minutes,
            capacity,
            updated_at,
            ..
        } => {
            slot.start_time = *start_time;
            slot.end_time = *end_time;
            slot.duration_minutes = *duration_minutes;
            slot.capacity = *capacity;
            slot.updated_at = *updated_at;
            // Capacity changes re-normalize the Booked <-> booked_count
            // equivalence.
            if slot.status == SlotStatus::Booked && slot.booked_count < slot.capacity {
                slot.status = SlotStatus::Available;
            } else if slot.status == SlotStatus::Available && slot.booked_count >= slot.capacity {
                slot.status = SlotStatus::Booked;
            }
        }
        Event::CapacityClaimed { at, .. } => {
            slot.booked_count += 1;
            if slot.booked_count >= slot.capacity {
                slot.status = SlotStatus::Booked;
            }
            slot.updated_at = *at;
        }
        Event::CapacityReleased { at, .. } => {
            if slot.booked_count > 0 {
                slot.booked_count -= 1;
                if slot.status == SlotStatus::Booked && slot.booked_count < slot.capacity {
                    slot.status = SlotStatus::Available;
                }
                slot.updated_at = *at;
            }
        }
        Event::SlotStatusChanged { status, at, .. } => {
            slot.status = *status;
            slot.updated_at = *at;
        }
        _ => {}
    }
}

/// Apply an event to a config in place. Same contract as `apply_slot_event`.
pub(super) fn apply_config_event(cfg: &mut AvailabilityConfig, event: &Event) {
    match event {
        Event::ConfigUpdated {
            start_date,
            end_date,
            start_time,
            end_time,
            timezone,
            recurrence,
            max_concurrent_bookings,
            metadata_json,
            updated_at,
            ..
        } => {
            cfg.start_date = *start_date;
            cfg.end_date = *end_date;
            cfg.start_time = *start_time;
            cfg.end_time = *end_time;
            cfg.timezone = timezone.clone();
            cfg.recurrence = recurrence.clone();
            cfg.max_concurrent_bookings = *max_concurrent_bookings;
            cfg.metadata = parse_metadata(metadata_json);
            cfg.updated_at = *updated_at;
        }
        Event::ConfigActivated { at, .. } => {
            cfg.is_active = true;
            cfg.updated_at = *at;
        }
        Event::ConfigDeactivated { at, .. } => {
            cfg.is_active = false;
            cfg.updated_at = *at;
        }
        _ => {}
    }
}

/// Metadata in WAL events is the engine's own canonical JSON; a parse
/// failure can only mean on-disk corruption past the CRC, so fall back to
/// empty rather than poisoning replay.
pub(super) fn parse_metadata(json: &str) -> Metadata {
    serde_json::from_str(json).unwrap_or_default()
}

pub(super) fn encode_metadata(metadata: &Metadata) -> String {
    serde_json::to_string(metadata).unwrap_or_else(|_| "{}".into())
}

fn slot_from_created(event: &Event) -> Option<Slot> {
    if let Event::SlotCreated {
        id,
        org_id,
        provider_id,
        provider_service_id,
        config_id,
        slot_date,
        start_time,
        end_time,
        duration_minutes,
        capacity,
        status,
        created_at,
    } = event
    {
        Some(Slot {
            id: *id,
            org_id: *org_id,
            provider_id: *provider_id,
            provider_service_id: *provider_service_id,
            config_id: *config_id,
            slot_date: *slot_date,
            start_time: *start_time,
            end_time: *end_time,
            duration_minutes: *duration_minutes,
            capacity: *capacity,
            booked_count: 0,
            status: *status,
            created_at: *created_at,
            updated_at: *created_at,
        })
    } else {
        None
    }
}

fn config_from_created(event: &Event) -> Option<AvailabilityConfig> {
    if let Event::ConfigCreated {
        id,
        provider_id,
        service_id,
        config_type,
        start_date,
        end_date,
        start_time,
        end_time,
        timezone,
        recurrence,
        max_concurrent_bookings,
        is_active,
        metadata_json,
        created_at,
    } = event
    {
        Some(AvailabilityConfig {
            id: *id,
            provider_id: *provider_id,
            service_id: *service_id,
            config_type: *config_type,
            start_date: *start_date,
            end_date: *end_date,
            start_time: *start_time,
            end_time: *end_time,
            timezone: timezone.clone(),
            recurrence: recurrence.clone(),
            max_concurrent_bookings: *max_concurrent_bookings,
            is_active: *is_active,
            metadata: parse_metadata(metadata_json),
            created_at: *created_at,
            updated_at: *created_at,
        })
    } else {
        None
    }
}

/// Slot id targeted by a slot-level event, if any.
fn event_slot_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::SlotUpdated { id, .. }
        | Event::CapacityClaimed { id, .. }
        | Event::CapacityReleased { id, .. }
        | Event::SlotStatusChanged { id, .. } => Some(*id),
        _ => None,
    }
}

fn event_config_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ConfigUpdated { id, .. }
        | Event::ConfigActivated { id, .. }
        | Event::ConfigDeactivated { id, .. } => Some(*id),
        _ => None,
    }
}

impl Engine {
    /// Open the store: replay the WAL into memory and start the group-commit
    /// writer task. Must run inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            slots: DashMap::new(),
            configs: DashMap::new(),
            day_index: DashMap::new(),
            provider_configs: DashMap::new(),
            wal_tx,
        };

        // Replay is single-owner: try_write always succeeds instantly. Never
        // use blocking_write here — open may run inside an async context.
        for event in &events {
            match event {
                Event::SlotCreated { .. } => {
                    let slot = slot_from_created(event).expect("matched SlotCreated");
                    engine.index_slot(&slot);
                    engine.slots.insert(slot.id, Arc::new(RwLock::new(slot)));
                }
                Event::SlotDeleted { id } => {
                    if let Some((_, handle)) = engine.slots.remove(id) {
                        let guard = handle.try_read().expect("replay: uncontended read");
                        engine.unindex_slot(&guard);
                    }
                }
                Event::ConfigCreated { .. } => {
                    let cfg = config_from_created(event).expect("matched ConfigCreated");
                    engine.index_config(cfg.provider_id, cfg.id);
                    engine.configs.insert(cfg.id, Arc::new(RwLock::new(cfg)));
                }
                Event::ConfigDeleted { id } => {
                    if let Some((_, handle)) = engine.configs.remove(id) {
                        let guard = handle.try_read().expect("replay: uncontended read");
                        engine.unindex_config(guard.provider_id, *id);
                    }
                }
                other => {
                    if let Some(id) = event_slot_id(other) {
                        if let Some(entry) = engine.slots.get(&id) {
                            let handle = entry.value().clone();
                            drop(entry);
                            let mut guard =
                                handle.try_write().expect("replay: uncontended write");
                            apply_slot_event(&mut guard, other);
                        }
                    } else if let Some(id) = event_config_id(other)
                        && let Some(entry) = engine.configs.get(&id)
                    {
                        let handle = entry.value().clone();
                        drop(entry);
                        let mut guard = handle.try_write().expect("replay: uncontended write");
                        apply_config_event(&mut guard, other);
                    }
                }
            }
        }

        metrics::gauge!(crate::observability::SLOTS_ACTIVE).set(engine.slots.len() as f64);
        metrics::gauge!(crate::observability::CONFIGS_ACTIVE).set(engine.configs.len() as f64);

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn slot_handle(&self, id: &Ulid) -> Option<SharedSlot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn config_handle(&self, id: &Ulid) -> Option<SharedConfig> {
        self.configs.get(id).map(|e| e.value().clone())
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn config_count(&self) -> usize {
        self.configs.len()
    }

    /// Day-scope lock + id list, created on first touch.
    pub(super) fn day_entry(&self, key: &DayKey) -> Arc<RwLock<Vec<Ulid>>> {
        self.day_index.entry(*key).or_default().value().clone()
    }

    pub(super) fn provider_entry(&self, provider_id: Ulid) -> Arc<RwLock<Vec<Ulid>>> {
        self.provider_configs
            .entry(provider_id)
            .or_default()
            .value()
            .clone()
    }

    /// Index maintenance during replay only — live paths mutate the id list
    /// they already hold the write lock for.
    fn index_slot(&self, slot: &Slot) {
        let entry = self.day_entry(&day_key_of(slot));
        entry
            .try_write()
            .expect("replay: uncontended write")
            .push(slot.id);
    }

    fn unindex_slot(&self, slot: &Slot) {
        let entry = self.day_entry(&day_key_of(slot));
        entry
            .try_write()
            .expect("replay: uncontended write")
            .retain(|sid| sid != &slot.id);
    }

    fn index_config(&self, provider_id: Ulid, config_id: Ulid) {
        let entry = self.provider_entry(provider_id);
        entry
            .try_write()
            .expect("replay: uncontended write")
            .push(config_id);
    }

    fn unindex_config(&self, provider_id: Ulid, config_id: Ulid) {
        let entry = self.provider_entry(provider_id);
        entry
            .try_write()
            .expect("replay: uncontended write")
            .retain(|cid| cid != &config_id);
    }

    /// WAL-append + apply under a held slot guard. The write lock spans the
    /// precondition check and the state change — this is the atomic
    /// read-check-write every capacity and status mutation goes through.
    pub(super) async fn persist_and_apply_slot(
        &self,
        slot: &mut Slot,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_slot_event(slot, event);
        Ok(())
    }

    pub(super) async fn persist_and_apply_config(
        &self,
        cfg: &mut AvailabilityConfig,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_config_event(cfg, event);
        Ok(())
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let config_handles: Vec<SharedConfig> =
            self.configs.iter().map(|e| e.value().clone()).collect();
        for handle in config_handles {
            let cfg = handle.read().await.clone();
            events.push(Event::ConfigCreated {
                id: cfg.id,
                provider_id: cfg.provider_id,
                service_id: cfg.service_id,
                config_type: cfg.config_type,
                start_date: cfg.start_date,
                end_date: cfg.end_date,
                start_time: cfg.start_time,
                end_time: cfg.end_time,
                timezone: cfg.timezone.clone(),
                recurrence: cfg.recurrence.clone(),
                max_concurrent_bookings: cfg.max_concurrent_bookings,
                is_active: cfg.is_active,
                metadata_json: encode_metadata(&cfg.metadata),
                created_at: cfg.created_at,
            });
        }

        let slot_handles: Vec<SharedSlot> = self.slots.iter().map(|e| e.value().clone()).collect();
        for handle in slot_handles {
            let slot = handle.read().await.clone();
            events.push(Event::SlotCreated {
                id: slot.id,
                org_id: slot.org_id,
                provider_id: slot.provider_id,
                provider_service_id: slot.provider_service_id,
                config_id: slot.config_id,
                slot_date: slot.slot_date,
                start_time: slot.start_time,
                end_time: slot.end_time,
                duration_minutes: slot.duration_minutes,
                capacity: slot.capacity,
                status: slot.status,
                created_at: slot.created_at,
            });
            // Claims are replayed as individual events so booked_count and
            // the Booked flip reconstruct through the same apply path.
            for _ in 0..slot.booked_count {
                events.push(Event::CapacityClaimed {
                    id: slot.id,
                    at: slot.updated_at,
                });
            }
            // SlotCreated in the compacted log carries the status the slot
            // had at creation; claims above restore Booked, but Blocked and
            // Cancelled need an explicit change record.
            if matches!(slot.status, SlotStatus::Blocked | SlotStatus::Cancelled) {
                events.push(Event::SlotStatusChanged {
                    id: slot.id,
                    status: slot.status,
                    at: slot.updated_at,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
