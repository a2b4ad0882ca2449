use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::overlap::date_ranges_overlap;
use super::queries::Page;
use super::{Engine, EngineError, FieldError, encode_metadata};

fn validate_config_fields(
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    start_time: NaiveTime,
    end_time: NaiveTime,
    timezone: &str,
    recurrence: &RecurrenceRule,
    max_concurrent_bookings: u32,
    metadata: &Metadata,
) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if let Some(end) = end_date
        && end < start_date
    {
        errors.push(FieldError::new("end_date", "must not precede start_date"));
    }
    if start_time >= end_time {
        errors.push(FieldError::new("start_time", "must be before end_time"));
    }
    if timezone.is_empty() {
        errors.push(FieldError::new("timezone", "must not be empty"));
    } else if timezone.len() > MAX_TIMEZONE_LEN {
        errors.push(FieldError::new("timezone", "too long"));
    } else if !timezone
        .chars()
        .all(|c| c.is_ascii_alphabetic() || c == '_' || c == '/')
    {
        errors.push(FieldError::new(
            "timezone",
            "only letters, underscore and slash are allowed",
        ));
    }
    if recurrence.interval == 0 {
        errors.push(FieldError::new("recurrence.interval", "must be at least 1"));
    }
    if recurrence.exceptions.len() > MAX_RECURRENCE_EXCEPTIONS {
        errors.push(FieldError::new("recurrence.exceptions", "too many exception dates"));
    }
    if max_concurrent_bookings == 0 {
        errors.push(FieldError::new("max_concurrent_bookings", "must be at least 1"));
    } else if max_concurrent_bookings > MAX_CAPACITY {
        errors.push(FieldError::new(
            "max_concurrent_bookings",
            format!("must not exceed {MAX_CAPACITY}"),
        ));
    }
    if encode_metadata(metadata).len() > MAX_METADATA_BYTES {
        errors.push(FieldError::new("metadata", "serialized metadata too large"));
    }
    errors
}

impl Engine {
    /// Active configs in the `(provider, service-or-None, type)` scope whose
    /// date range intersects the candidate. Caller holds the provider lock.
    async fn overlapping_configs(
        &self,
        ids: &[Ulid],
        service_id: Option<Ulid>,
        config_type: ConfigType,
        start_date: NaiveDate,
        end_date: Option<NaiveDate>,
        exclude: Option<Ulid>,
    ) -> Vec<Ulid> {
        let mut conflicting = Vec::new();
        for cid in ids {
            if Some(*cid) == exclude {
                continue;
            }
            if let Some(handle) = self.config_handle(cid) {
                let cfg = handle.read().await;
                if cfg.is_active
                    && cfg.service_id == service_id
                    && cfg.config_type == config_type
                    && date_ranges_overlap(cfg.start_date, cfg.end_date, start_date, end_date)
                {
                    conflicting.push(*cid);
                }
            }
        }
        conflicting
    }

    pub async fn create_availability_config(
        &self,
        req: CreateConfigRequest,
    ) -> Result<AvailabilityConfig, EngineError> {
        EngineError::check(validate_config_fields(
            req.start_date,
            req.end_date,
            req.start_time,
            req.end_time,
            &req.timezone,
            &req.recurrence,
            req.max_concurrent_bookings,
            &req.metadata,
        ))?;

        let entry = self.provider_entry(req.provider_id);
        let mut ids = entry.write().await;
        if ids.len() >= MAX_CONFIGS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many configs for provider"));
        }

        let conflicting = self
            .overlapping_configs(
                &ids,
                req.service_id,
                req.config_type,
                req.start_date,
                req.end_date,
                None,
            )
            .await;
        if !conflicting.is_empty() {
            return Err(EngineError::ConfigOverlap { conflicting });
        }

        let now = Utc::now();
        let cfg = AvailabilityConfig {
            id: Ulid::new(),
            provider_id: req.provider_id,
            service_id: req.service_id,
            config_type: req.config_type,
            start_date: req.start_date,
            end_date: req.end_date,
            start_time: req.start_time,
            end_time: req.end_time,
            timezone: req.timezone,
            recurrence: req.recurrence,
            max_concurrent_bookings: req.max_concurrent_bookings,
            is_active: true,
            metadata: req.metadata,
            created_at: now,
            updated_at: now,
        };
        let event = Event::ConfigCreated {
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
        };
        self.wal_append(&event).await?;
        self.configs.insert(cfg.id, Arc::new(RwLock::new(cfg.clone())));
        ids.push(cfg.id);

        metrics::gauge!(crate::observability::CONFIGS_ACTIVE).set(self.configs.len() as f64);
        info!(config = %cfg.id, provider = %cfg.provider_id, "availability config created");
        Ok(cfg)
    }

    /// Partial update: provided fields merge over the stored config, then
    /// the merged result is re-validated and overlap-checked excluding the
    /// config itself, so an update-in-place never conflicts with its own
    /// previous range.
    pub async fn update_availability_config(
        &self,
        id: Ulid,
        provider_id: Ulid,
        req: UpdateConfigRequest,
    ) -> Result<AvailabilityConfig, EngineError> {
        let handle = self.config_handle(&id).ok_or(EngineError::NotFound(id))?;
        {
            let guard = handle.read().await;
            if guard.provider_id != provider_id {
                return Err(EngineError::NotFound(id));
            }
        }

        let entry = self.provider_entry(provider_id);
        let ids = entry.write().await;
        let mut guard = handle.write().await;

        let start_date = req.start_date.unwrap_or(guard.start_date);
        let end_date = req.end_date.unwrap_or(guard.end_date);
        let start_time = req.start_time.unwrap_or(guard.start_time);
        let end_time = req.end_time.unwrap_or(guard.end_time);
        let timezone = req.timezone.unwrap_or_else(|| guard.timezone.clone());
        let recurrence = req.recurrence.unwrap_or_else(|| guard.recurrence.clone());
        let max_concurrent_bookings = req
            .max_concurrent_bookings
            .unwrap_or(guard.max_concurrent_bookings);
        let metadata = req.metadata.unwrap_or_else(|| guard.metadata.clone());

        EngineError::check(validate_config_fields(
            start_date,
            end_date,
            start_time,
            end_time,
            &timezone,
            &recurrence,
            max_concurrent_bookings,
            &metadata,
        ))?;

        if guard.is_active {
            let conflicting = self
                .overlapping_configs(
                    &ids,
                    guard.service_id,
                    guard.config_type,
                    start_date,
                    end_date,
                    Some(id),
                )
                .await;
            if !conflicting.is_empty() {
                return Err(EngineError::ConfigOverlap { conflicting });
            }
        }

        let event = Event::ConfigUpdated {
            id,
            start_date,
            end_date,
            start_time,
            end_time,
            timezone,
            recurrence,
            max_concurrent_bookings,
            metadata_json: encode_metadata(&metadata),
            updated_at: Utc::now(),
        };
        self.persist_and_apply_config(&mut guard, &event).await?;
        info!(config = %id, "availability config updated");
        Ok(guard.clone())
    }

    /// Reactivation re-runs the overlap check: a config deactivated to make
    /// room for another must not silently reintroduce the conflict.
    pub async fn activate_config(
        &self,
        id: Ulid,
        provider_id: Ulid,
    ) -> Result<AvailabilityConfig, EngineError> {
        let handle = self.config_handle(&id).ok_or(EngineError::NotFound(id))?;
        {
            let guard = handle.read().await;
            if guard.provider_id != provider_id {
                return Err(EngineError::NotFound(id));
            }
        }

        let entry = self.provider_entry(provider_id);
        let ids = entry.write().await;
        let mut guard = handle.write().await;
        if guard.is_active {
            return Ok(guard.clone());
        }

        let conflicting = self
            .overlapping_configs(
                &ids,
                guard.service_id,
                guard.config_type,
                guard.start_date,
                guard.end_date,
                Some(id),
            )
            .await;
        if !conflicting.is_empty() {
            return Err(EngineError::ConfigOverlap { conflicting });
        }

        let event = Event::ConfigActivated {
            id,
            at: Utc::now(),
        };
        self.persist_and_apply_config(&mut guard, &event).await?;
        info!(config = %id, "availability config activated");
        Ok(guard.clone())
    }

    pub async fn deactivate_config(
        &self,
        id: Ulid,
        provider_id: Ulid,
    ) -> Result<AvailabilityConfig, EngineError> {
        let handle = self.config_handle(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = handle.write().await;
        if guard.provider_id != provider_id {
            return Err(EngineError::NotFound(id));
        }
        if !guard.is_active {
            return Ok(guard.clone());
        }

        let event = Event::ConfigDeactivated {
            id,
            at: Utc::now(),
        };
        self.persist_and_apply_config(&mut guard, &event).await?;
        info!(config = %id, "availability config deactivated");
        Ok(guard.clone())
    }

    /// Hard delete. Slots already generated from the config are untouched;
    /// they keep a dangling `config_id` by design (one-way generation).
    pub async fn delete_config(&self, id: Ulid, provider_id: Ulid) -> Result<(), EngineError> {
        let handle = self.config_handle(&id).ok_or(EngineError::NotFound(id))?;
        {
            let guard = handle.read().await;
            if guard.provider_id != provider_id {
                return Err(EngineError::NotFound(id));
            }
        }

        let entry = self.provider_entry(provider_id);
        let mut ids = entry.write().await;
        let _guard = handle.write().await;
        if !self.configs.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::ConfigDeleted { id };
        self.wal_append(&event).await?;
        self.configs.remove(&id);
        ids.retain(|cid| cid != &id);
        metrics::gauge!(crate::observability::CONFIGS_ACTIVE).set(self.configs.len() as f64);
        info!(config = %id, "availability config deleted");
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────

    pub async fn get_config(&self, id: Ulid) -> Result<AvailabilityConfig, EngineError> {
        let handle = self.config_handle(&id).ok_or(EngineError::NotFound(id))?;
        let guard = handle.read().await;
        Ok(guard.clone())
    }

    /// All of a provider's configs, newest first, paged.
    pub async fn get_configs_for_provider(
        &self,
        provider_id: Ulid,
        page: usize,
        size: usize,
    ) -> Page<AvailabilityConfig> {
        let entry = self.provider_entry(provider_id);
        let ids = entry.read().await.clone();
        let mut configs = Vec::with_capacity(ids.len());
        for cid in ids {
            if let Some(handle) = self.config_handle(&cid) {
                configs.push(handle.read().await.clone());
            }
        }
        configs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Page::slice(configs, page, size)
    }

    /// Configs in effect for a provider service on a given date: active,
    /// date inside the range, and either bound to the service or
    /// provider-wide. Recurrence is deliberately not consulted here — this
    /// answers "which rules govern this date", not "does generation fire".
    pub async fn get_active_configs_for_date(
        &self,
        provider_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Vec<AvailabilityConfig> {
        let entry = self.provider_entry(provider_id);
        let ids = entry.read().await.clone();
        let mut hits = Vec::new();
        for cid in ids {
            if let Some(handle) = self.config_handle(&cid) {
                let cfg = handle.read().await;
                if cfg.is_active && cfg.covers_date(date) && cfg.applies_to_service(service_id) {
                    hits.push(cfg.clone());
                }
            }
        }
        hits.sort_by(|a, b| a.start_date.cmp(&b.start_date).then(a.id.cmp(&b.id)));
        debug!(
            provider = %provider_id,
            date = %date,
            hits = hits.len(),
            "active configs for date"
        );
        hits
    }
}
