//! Tunable business rules, swappable at runtime without a restart.
//!
//! Each engine operation reads one `BusinessRules` snapshot at the start of
//! its unit of work; updates replace the whole value through a watch channel,
//! so a concurrent reader never observes a half-applied change.

use tokio::sync::watch;
use tracing::info;

use crate::engine::EngineError;

pub const RULE_CANCELLATION_WINDOW_HOURS: &str = "cancellation_window_hours";
pub const RULE_MAX_WAITLIST_SIZE: &str = "max_waitlist_size";
pub const RULE_MAX_BOOKINGS_PER_DAY: &str = "max_bookings_per_user_per_day";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BusinessRules {
    pub cancellation_window_hours: i64,
    pub max_waitlist_size: u32,
    pub max_bookings_per_day: u32,
}

impl Default for BusinessRules {
    fn default() -> Self {
        Self {
            cancellation_window_hours: 24,
            max_waitlist_size: 20,
            max_bookings_per_day: 3,
        }
    }
}

/// Owner side of the rules channel. The engine holds a `watch::Receiver` and
/// reads the latest snapshot per operation.
pub struct RulesHandle {
    tx: watch::Sender<BusinessRules>,
}

impl Default for RulesHandle {
    fn default() -> Self {
        Self::new(BusinessRules::default())
    }
}

impl RulesHandle {
    pub fn new(initial: BusinessRules) -> Self {
        Self {
            tx: watch::channel(initial).0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<BusinessRules> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> BusinessRules {
        *self.tx.borrow()
    }

    /// Apply a keyed update, as delivered by the admin surface. Unknown keys
    /// and out-of-range values are validation errors; nothing changes.
    pub fn apply_update(&self, key: &str, value: i64) -> Result<BusinessRules, EngineError> {
        let mut rules = self.current();
        match key {
            RULE_CANCELLATION_WINDOW_HOURS => {
                if value < 0 {
                    return Err(EngineError::Validation("cancellation window must be >= 0"));
                }
                rules.cancellation_window_hours = value;
            }
            RULE_MAX_WAITLIST_SIZE => {
                let size =
                    u32::try_from(value).map_err(|_| EngineError::Validation("max waitlist size out of range"))?;
                rules.max_waitlist_size = size;
            }
            RULE_MAX_BOOKINGS_PER_DAY => {
                let limit = u32::try_from(value)
                    .map_err(|_| EngineError::Validation("max bookings per day out of range"))?;
                if limit == 0 {
                    return Err(EngineError::Validation("max bookings per day must be >= 1"));
                }
                rules.max_bookings_per_day = limit;
            }
            _ => return Err(EngineError::Validation("unknown business rule key")),
        }
        self.tx.send_replace(rules);
        info!("business rule {key} updated to {value}");
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let rules = BusinessRules::default();
        assert_eq!(rules.cancellation_window_hours, 24);
        assert_eq!(rules.max_waitlist_size, 20);
        assert_eq!(rules.max_bookings_per_day, 3);
    }

    #[test]
    fn update_is_visible_to_subscribers() {
        let handle = RulesHandle::default();
        let rx = handle.subscribe();

        handle.apply_update(RULE_MAX_WAITLIST_SIZE, 5).unwrap();
        assert_eq!(rx.borrow().max_waitlist_size, 5);
        // Untouched fields keep their values.
        assert_eq!(rx.borrow().cancellation_window_hours, 24);
    }

    #[test]
    fn unknown_key_rejected() {
        let handle = RulesHandle::default();
        let err = handle.apply_update("discount_percent", 10).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(handle.current(), BusinessRules::default());
    }

    #[test]
    fn out_of_range_values_rejected() {
        let handle = RulesHandle::default();
        assert!(handle.apply_update(RULE_CANCELLATION_WINDOW_HOURS, -1).is_err());
        assert!(handle.apply_update(RULE_MAX_WAITLIST_SIZE, -3).is_err());
        assert!(handle.apply_update(RULE_MAX_BOOKINGS_PER_DAY, 0).is_err());
        assert_eq!(handle.current(), BusinessRules::default());
    }

    #[test]
    fn receiver_outlives_reads() {
        let handle = RulesHandle::default();
        let rx = handle.subscribe();
        handle.apply_update(RULE_MAX_BOOKINGS_PER_DAY, 7).unwrap();
        assert_eq!(rx.borrow().max_bookings_per_day, 7);
    }
}
