use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Lifecycle of a bookable slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Booked,
    Blocked,
    Cancelled,
}

impl SlotStatus {
    /// Cancelled slots never come back.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SlotStatus::Cancelled)
    }
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SlotStatus::Available => "available",
            SlotStatus::Booked => "booked",
            SlotStatus::Blocked => "blocked",
            SlotStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What an availability config describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigType {
    /// Repeats per its recurrence rule.
    Recurring,
    /// Covers its date range exactly once; recurrence is ignored.
    OneTime,
    /// Blackout — suppresses generation instead of enabling it.
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Daily,
    Weekly,
}

/// Crate-local weekday so WAL events stay plain-derive decodable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub fn of(date: NaiveDate) -> Self {
        match date.weekday() {
            chrono::Weekday::Mon => DayOfWeek::Mon,
            chrono::Weekday::Tue => DayOfWeek::Tue,
            chrono::Weekday::Wed => DayOfWeek::Wed,
            chrono::Weekday::Thu => DayOfWeek::Thu,
            chrono::Weekday::Fri => DayOfWeek::Fri,
            chrono::Weekday::Sat => DayOfWeek::Sat,
            chrono::Weekday::Sun => DayOfWeek::Sun,
        }
    }
}

/// When a recurring config is open for business.
///
/// `days_of_week` empty means no weekday restriction. `exceptions` are
/// individual dates carved out of the pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    /// Every Nth day/week counted from the config's start date. Minimum 1.
    pub interval: u32,
    pub days_of_week: Vec<DayOfWeek>,
    pub exceptions: Vec<NaiveDate>,
}

impl RecurrenceRule {
    /// Every single day, no exceptions.
    pub fn daily() -> Self {
        Self {
            frequency: Frequency::Daily,
            interval: 1,
            days_of_week: Vec::new(),
            exceptions: Vec::new(),
        }
    }

    /// Does the rule fire on `date`, anchored at `anchor` (the config's
    /// start date)? Dates before the anchor never match.
    pub fn matches(&self, anchor: NaiveDate, date: NaiveDate) -> bool {
        if date < anchor {
            return false;
        }
        if self.exceptions.contains(&date) {
            return false;
        }
        if !self.days_of_week.is_empty() && !self.days_of_week.contains(&DayOfWeek::of(date)) {
            return false;
        }
        let interval = self.interval.max(1) as i64;
        let days_since = (date - anchor).num_days();
        match self.frequency {
            Frequency::Daily => days_since % interval == 0,
            Frequency::Weekly => (days_since / 7) % interval == 0,
        }
    }
}

pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A single bookable time interval for one provider service on one date.
///
/// Invariants: `booked_count <= capacity`, `status == Booked` exactly when
/// `booked_count == capacity`, and `start_time < end_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub org_id: Ulid,
    pub provider_id: Ulid,
    pub provider_service_id: Ulid,
    /// Set when the slot was materialized from a config; None for ad-hoc slots.
    pub config_id: Option<Ulid>,
    pub slot_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub duration_minutes: u32,
    pub capacity: u32,
    pub booked_count: u32,
    pub status: SlotStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Slot {
    pub fn is_bookable(&self) -> bool {
        self.status == SlotStatus::Available && self.booked_count < self.capacity
    }

    pub fn remaining_capacity(&self) -> u32 {
        self.capacity.saturating_sub(self.booked_count)
    }

    /// Half-open `[start, end)` intersection against another time window.
    pub fn overlaps_times(&self, start: NaiveTime, end: NaiveTime) -> bool {
        self.start_time < end && self.end_time > start
    }
}

/// A provider's rule for when slots may be generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityConfig {
    pub id: Ulid,
    pub provider_id: Ulid,
    /// None applies the config to every service of the provider.
    pub service_id: Option<Ulid>,
    pub config_type: ConfigType,
    pub start_date: NaiveDate,
    /// None is open-ended.
    pub end_date: Option<NaiveDate>,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub timezone: String,
    pub recurrence: RecurrenceRule,
    /// Becomes slot capacity at generation time.
    pub max_concurrent_bookings: u32,
    pub is_active: bool,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AvailabilityConfig {
    /// Open-ended configs extend to the maximum representable date.
    pub fn effective_end_date(&self) -> NaiveDate {
        self.end_date.unwrap_or(NaiveDate::MAX)
    }

    pub fn covers_date(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.effective_end_date()
    }

    pub fn applies_to_service(&self, service_id: Ulid) -> bool {
        match self.service_id {
            None => true,
            Some(own) => own == service_id,
        }
    }

    /// Whether the config is in effect on `date`: date range plus, for
    /// recurring and blackout configs, the recurrence rule. One-time configs
    /// cover their whole range unconditionally.
    pub fn in_effect_on(&self, date: NaiveDate) -> bool {
        if !self.covers_date(date) {
            return false;
        }
        match self.config_type {
            ConfigType::OneTime => true,
            ConfigType::Recurring | ConfigType::Blocked => {
                self.recurrence.matches(self.start_date, date)
            }
        }
    }
}

// ── Requests ──────────────────────────────────────────────────────
//
// Explicit request structs instead of long parameter lists; partial updates
// are Option fields merged by hand in the engine.

#[derive(Debug, Clone)]
pub struct CreateSlotRequest {
    pub org_id: Ulid,
    pub provider_id: Ulid,
    pub provider_service_id: Ulid,
    pub slot_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub duration_minutes: u32,
    pub capacity: u32,
}

#[derive(Debug, Clone)]
pub struct BulkCreateSlotsRequest {
    pub org_id: Ulid,
    pub provider_id: Ulid,
    pub provider_service_id: Ulid,
    pub start_date: NaiveDate,
    /// Inclusive.
    pub end_date: NaiveDate,
    pub daily_start_time: NaiveTime,
    pub daily_end_time: NaiveTime,
    pub duration_minutes: u32,
    pub capacity: u32,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateSlotRequest {
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub duration_minutes: Option<u32>,
    pub capacity: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CreateConfigRequest {
    pub provider_id: Ulid,
    pub service_id: Option<Ulid>,
    pub config_type: ConfigType,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub timezone: String,
    pub recurrence: RecurrenceRule,
    pub max_concurrent_bookings: u32,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateConfigRequest {
    pub start_date: Option<NaiveDate>,
    /// `Some(None)` clears the end date (makes the config open-ended).
    pub end_date: Option<Option<NaiveDate>>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub timezone: Option<String>,
    pub recurrence: Option<RecurrenceRule>,
    pub max_concurrent_bookings: Option<u32>,
    pub metadata: Option<Metadata>,
}

// ── WAL record format ─────────────────────────────────────────────

/// The event types — flat, no nesting. This is the WAL record format.
/// Config metadata travels as a canonical JSON string so replay never needs
/// self-describing decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotCreated {
        id: Ulid,
        org_id: Ulid,
        provider_id: Ulid,
        provider_service_id: Ulid,
        config_id: Option<Ulid>,
        slot_date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        duration_minutes: u32,
        capacity: u32,
        status: SlotStatus,
        created_at: DateTime<Utc>,
    },
    SlotUpdated {
        id: Ulid,
        start_time: NaiveTime,
        end_time: NaiveTime,
        duration_minutes: u32,
        capacity: u32,
        updated_at: DateTime<Utc>,
    },
    CapacityClaimed {
        id: Ulid,
        at: DateTime<Utc>,
    },
    CapacityReleased {
        id: Ulid,
        at: DateTime<Utc>,
    },
    SlotStatusChanged {
        id: Ulid,
        status: SlotStatus,
        at: DateTime<Utc>,
    },
    SlotDeleted {
        id: Ulid,
    },
    ConfigCreated {
        id: Ulid,
        provider_id: Ulid,
        service_id: Option<Ulid>,
        config_type: ConfigType,
        start_date: NaiveDate,
        end_date: Option<NaiveDate>,
        start_time: NaiveTime,
        end_time: NaiveTime,
        timezone: String,
        recurrence: RecurrenceRule,
        max_concurrent_bookings: u32,
        is_active: bool,
        metadata_json: String,
        created_at: DateTime<Utc>,
    },
    ConfigUpdated {
        id: Ulid,
        start_date: NaiveDate,
        end_date: Option<NaiveDate>,
        start_time: NaiveTime,
        end_time: NaiveTime,
        timezone: String,
        recurrence: RecurrenceRule,
        max_concurrent_bookings: u32,
        metadata_json: String,
        updated_at: DateTime<Utc>,
    },
    ConfigActivated {
        id: Ulid,
        at: DateTime<Utc>,
    },
    ConfigDeactivated {
        id: Ulid,
        at: DateTime<Utc>,
    },
    ConfigDeleted {
        id: Ulid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn sample_slot() -> Slot {
        Slot {
            id: Ulid::new(),
            org_id: Ulid::new(),
            provider_id: Ulid::new(),
            provider_service_id: Ulid::new(),
            config_id: None,
            slot_date: d(2024, 1, 15),
            start_time: t(9, 0),
            end_time: t(9, 30),
            duration_minutes: 30,
            capacity: 2,
            booked_count: 0,
            status: SlotStatus::Available,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn slot_overlap_is_half_open() {
        let slot = sample_slot();
        assert!(slot.overlaps_times(t(9, 15), t(9, 45)));
        assert!(slot.overlaps_times(t(8, 0), t(9, 1)));
        // Adjacent windows do not overlap
        assert!(!slot.overlaps_times(t(9, 30), t(10, 0)));
        assert!(!slot.overlaps_times(t(8, 0), t(9, 0)));
    }

    #[test]
    fn slot_bookable_tracks_status_and_count() {
        let mut slot = sample_slot();
        assert!(slot.is_bookable());
        assert_eq!(slot.remaining_capacity(), 2);

        slot.booked_count = 2;
        slot.status = SlotStatus::Booked;
        assert!(!slot.is_bookable());
        assert_eq!(slot.remaining_capacity(), 0);

        slot.booked_count = 0;
        slot.status = SlotStatus::Blocked;
        assert!(!slot.is_bookable());
    }

    #[test]
    fn recurrence_daily_interval() {
        let rule = RecurrenceRule {
            frequency: Frequency::Daily,
            interval: 2,
            days_of_week: Vec::new(),
            exceptions: Vec::new(),
        };
        let anchor = d(2024, 1, 1);
        assert!(rule.matches(anchor, d(2024, 1, 1)));
        assert!(!rule.matches(anchor, d(2024, 1, 2)));
        assert!(rule.matches(anchor, d(2024, 1, 3)));
        // Before the anchor never matches
        assert!(!rule.matches(anchor, d(2023, 12, 31)));
    }

    #[test]
    fn recurrence_weekday_mask() {
        let rule = RecurrenceRule {
            frequency: Frequency::Weekly,
            interval: 1,
            days_of_week: vec![DayOfWeek::Mon, DayOfWeek::Wed],
            exceptions: Vec::new(),
        };
        let anchor = d(2024, 1, 1); // a Monday
        assert!(rule.matches(anchor, d(2024, 1, 1))); // Mon
        assert!(!rule.matches(anchor, d(2024, 1, 2))); // Tue
        assert!(rule.matches(anchor, d(2024, 1, 3))); // Wed
        assert!(rule.matches(anchor, d(2024, 1, 8))); // next Mon
    }

    #[test]
    fn recurrence_biweekly() {
        let rule = RecurrenceRule {
            frequency: Frequency::Weekly,
            interval: 2,
            days_of_week: vec![DayOfWeek::Mon],
            exceptions: Vec::new(),
        };
        let anchor = d(2024, 1, 1); // Monday
        assert!(rule.matches(anchor, d(2024, 1, 1)));
        assert!(!rule.matches(anchor, d(2024, 1, 8))); // week 1 → skipped
        assert!(rule.matches(anchor, d(2024, 1, 15))); // week 2
    }

    #[test]
    fn recurrence_exceptions_win() {
        let mut rule = RecurrenceRule::daily();
        rule.exceptions.push(d(2024, 1, 2));
        let anchor = d(2024, 1, 1);
        assert!(rule.matches(anchor, d(2024, 1, 1)));
        assert!(!rule.matches(anchor, d(2024, 1, 2)));
        assert!(rule.matches(anchor, d(2024, 1, 3)));
    }

    #[test]
    fn config_date_coverage() {
        let cfg = AvailabilityConfig {
            id: Ulid::new(),
            provider_id: Ulid::new(),
            service_id: None,
            config_type: ConfigType::Recurring,
            start_date: d(2024, 1, 1),
            end_date: None,
            start_time: t(9, 0),
            end_time: t(17, 0),
            timezone: "UTC".into(),
            recurrence: RecurrenceRule::daily(),
            max_concurrent_bookings: 1,
            is_active: true,
            metadata: Metadata::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        // Open-ended: covers arbitrarily far future
        assert!(cfg.covers_date(d(2030, 6, 1)));
        assert!(!cfg.covers_date(d(2023, 12, 31)));
        // Provider-wide config applies to any service
        assert!(cfg.applies_to_service(Ulid::new()));
    }

    #[test]
    fn one_time_config_ignores_recurrence() {
        let mut rule = RecurrenceRule::daily();
        rule.days_of_week = vec![DayOfWeek::Sat]; // would exclude weekdays
        let cfg = AvailabilityConfig {
            id: Ulid::new(),
            provider_id: Ulid::new(),
            service_id: None,
            config_type: ConfigType::OneTime,
            start_date: d(2024, 1, 1),
            end_date: Some(d(2024, 1, 5)),
            start_time: t(9, 0),
            end_time: t(17, 0),
            timezone: "UTC".into(),
            recurrence: rule,
            max_concurrent_bookings: 1,
            is_active: true,
            metadata: Metadata::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(cfg.in_effect_on(d(2024, 1, 2))); // a Tuesday
        assert!(!cfg.in_effect_on(d(2024, 1, 6))); // past end date
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SlotCreated {
            id: Ulid::new(),
            org_id: Ulid::new(),
            provider_id: Ulid::new(),
            provider_service_id: Ulid::new(),
            config_id: Some(Ulid::new()),
            slot_date: d(2024, 1, 15),
            start_time: t(9, 0),
            end_time: t(9, 30),
            duration_minutes: 30,
            capacity: 1,
            status: SlotStatus::Available,
            created_at: Utc::now(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn config_event_roundtrip_with_metadata_json() {
        let event = Event::ConfigCreated {
            id: Ulid::new(),
            provider_id: Ulid::new(),
            service_id: None,
            config_type: ConfigType::Recurring,
            start_date: d(2024, 1, 1),
            end_date: None,
            start_time: t(8, 0),
            end_time: t(16, 0),
            timezone: "Europe/Berlin".into(),
            recurrence: RecurrenceRule::daily(),
            max_concurrent_bookings: 3,
            is_active: true,
            metadata_json: r#"{"room":"A"}"#.into(),
            created_at: Utc::now(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
