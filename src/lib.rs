//! slotd — slot generation, overlap-prevention, and capacity-booking engine.
//!
//! Providers publish availability configs; the engine expands them into
//! discrete bookable slots and arbitrates concurrent capacity claims without
//! overselling. State is durable through an append-only WAL and rebuilt into
//! memory on open. Callers link this library; the binary in `main.rs` is the
//! maintenance daemon running the expiry reaper and WAL compactor.

pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod wal;

pub use engine::{
    Engine, EngineError, FieldError, Page, PageRequest, SlotFilter, SlotSort, SortDirection,
};
pub use model::{
    AvailabilityConfig, BulkCreateSlotsRequest, ConfigType, CreateConfigRequest,
    CreateSlotRequest, DayOfWeek, Frequency, Metadata, RecurrenceRule, Slot, SlotStatus,
    UpdateConfigRequest, UpdateSlotRequest,
};
