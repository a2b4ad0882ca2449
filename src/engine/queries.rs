use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::MAX_PAGE_SIZE;
use crate::model::{Slot, SlotStatus};

use super::{Engine, EngineError, SharedSlot};

/// Composable slot predicates. Every set field constrains the result; unset
/// fields leave that dimension unconstrained. All predicates AND together.
#[derive(Debug, Clone, Default)]
pub struct SlotFilter {
    pub org_id: Option<Ulid>,
    pub provider_id: Option<Ulid>,
    pub provider_service_id: Option<Ulid>,
    /// Matches slots generated from this config.
    pub config_id: Option<Ulid>,
    /// Inclusive.
    pub date_from: Option<NaiveDate>,
    /// Inclusive.
    pub date_to: Option<NaiveDate>,
    pub status: Option<SlotStatus>,
    /// Only slots holding at least one booking.
    pub booked_only: bool,
    /// Only claimable slots: spare capacity and not Blocked/Cancelled.
    pub available_only: bool,
}

impl SlotFilter {
    pub fn matches(&self, slot: &Slot) -> bool {
        if let Some(org) = self.org_id
            && slot.org_id != org
        {
            return false;
        }
        if let Some(provider) = self.provider_id
            && slot.provider_id != provider
        {
            return false;
        }
        if let Some(service) = self.provider_service_id
            && slot.provider_service_id != service
        {
            return false;
        }
        if let Some(config) = self.config_id
            && slot.config_id != Some(config)
        {
            return false;
        }
        if let Some(from) = self.date_from
            && slot.slot_date < from
        {
            return false;
        }
        if let Some(to) = self.date_to
            && slot.slot_date > to
        {
            return false;
        }
        if let Some(status) = self.status
            && slot.status != status
        {
            return false;
        }
        if self.booked_only && slot.booked_count == 0 {
            return false;
        }
        if self.available_only
            && (slot.booked_count >= slot.capacity
                || matches!(slot.status, SlotStatus::Blocked | SlotStatus::Cancelled))
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotSort {
    #[default]
    SlotDate,
    StartTime,
    CreatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    /// Zero-based.
    pub page: usize,
    pub size: usize,
    pub sort: SlotSort,
    pub direction: SortDirection,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 0,
            size: 20,
            sort: SlotSort::default(),
            direction: SortDirection::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub size: usize,
    pub total_items: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    /// Cut one page out of an already-sorted result set.
    pub fn slice(sorted: Vec<T>, page: usize, size: usize) -> Self {
        let size = size.clamp(1, MAX_PAGE_SIZE);
        let total_items = sorted.len();
        let total_pages = total_items.div_ceil(size);
        let items = sorted
            .into_iter()
            .skip(page.saturating_mul(size))
            .take(size)
            .collect();
        Self {
            items,
            page,
            size,
            total_items,
            total_pages,
        }
    }
}

/// Ordering with the slot id as tiebreaker, so pagination is stable across
/// calls even when many slots share a sort key.
fn compare(a: &Slot, b: &Slot, sort: SlotSort, direction: SortDirection) -> std::cmp::Ordering {
    let ord = match sort {
        SlotSort::SlotDate => a
            .slot_date
            .cmp(&b.slot_date)
            .then(a.start_time.cmp(&b.start_time)),
        SlotSort::StartTime => a
            .start_time
            .cmp(&b.start_time)
            .then(a.slot_date.cmp(&b.slot_date)),
        SlotSort::CreatedAt => a.created_at.cmp(&b.created_at),
    };
    let ord = ord.then(a.id.cmp(&b.id));
    match direction {
        SortDirection::Asc => ord,
        SortDirection::Desc => ord.reverse(),
    }
}

impl Engine {
    pub async fn get_slot(&self, id: Ulid) -> Result<Slot, EngineError> {
        let handle = self.slot_handle(&id).ok_or(EngineError::NotFound(id))?;
        let guard = handle.read().await;
        Ok(guard.clone())
    }

    /// Filtered, sorted, paged scan. Reads take brief per-slot read locks
    /// against a snapshot of handles; no structural lock is held.
    pub async fn find_slots(&self, filter: &SlotFilter, request: &PageRequest) -> Page<Slot> {
        let handles: Vec<SharedSlot> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut hits = Vec::new();
        for handle in handles {
            let guard = handle.read().await;
            if filter.matches(&guard) {
                hits.push(guard.clone());
            }
        }
        hits.sort_by(|a, b| compare(a, b, request.sort, request.direction));
        Page::slice(hits, request.page, request.size)
    }

    /// Slots in one day scope, unfiltered, ordered by start time.
    pub async fn get_slots_for_date(
        &self,
        provider_id: Ulid,
        provider_service_id: Ulid,
        date: NaiveDate,
    ) -> Vec<Slot> {
        let entry = self.day_entry(&(provider_id, provider_service_id, date));
        let ids = entry.read().await.clone();
        let mut slots = Vec::with_capacity(ids.len());
        for sid in ids {
            if let Some(handle) = self.slot_handle(&sid) {
                slots.push(handle.read().await.clone());
            }
        }
        slots.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        slots
    }

    /// Claimable slots in one day scope, ordered by start time.
    pub async fn get_available_slots(
        &self,
        provider_id: Ulid,
        provider_service_id: Ulid,
        date: NaiveDate,
    ) -> Vec<Slot> {
        let mut slots = self
            .get_slots_for_date(provider_id, provider_service_id, date)
            .await;
        slots.retain(|s| s.is_bookable());
        slots
    }

    pub async fn count_available_slots(
        &self,
        provider_id: Ulid,
        provider_service_id: Ulid,
        date: NaiveDate,
    ) -> usize {
        self.get_available_slots(provider_id, provider_service_id, date)
            .await
            .len()
    }
}
