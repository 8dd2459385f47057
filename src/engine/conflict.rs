use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Validation("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::Validation("timestamp out of range"));
    }
    if span.duration_ms() > MAX_CLASS_DURATION_MS {
        return Err(EngineError::Validation("class runs too long"));
    }
    Ok(())
}

pub(crate) fn validate_query_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::Validation("query start must be before end"));
    }
    if end - start > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::Validation("query window too wide"));
    }
    Ok(Span::new(start, end))
}

impl Engine {
    /// All ACTIVE classes taught by `coach_id` whose time range intersects
    /// `span`, excluding `exclude_class` (a class checking against itself
    /// during update). Half-open semantics: touching endpoints don't conflict.
    pub async fn find_coach_conflicts(
        &self,
        coach_id: Ulid,
        span: Span,
        exclude_class: Option<Ulid>,
    ) -> Vec<ClassSummary> {
        let ids = self
            .by_coach
            .get(&coach_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut conflicts = Vec::new();
        for id in ids {
            if exclude_class == Some(id) {
                continue;
            }
            let Some(rs) = self.class(&id) else { continue };
            let guard = rs.read().await;
            if guard.status == ClassStatus::Active && guard.span.overlaps(&span) {
                conflicts.push(guard.summary());
            }
        }
        conflicts.sort_by_key(|c| c.span.start);
        conflicts
    }

    /// The user's CONFIRMED bookings whose class time range intersects `span`.
    pub async fn find_overlapping_bookings(
        &self,
        user_id: Ulid,
        span: Span,
    ) -> Vec<(Ulid, Booking)> {
        let mut overlapping = Vec::new();
        for (class_id, rs) in self.all_classes() {
            let guard = rs.read().await;
            if !guard.span.overlaps(&span) {
                continue;
            }
            if let Some(booking) = guard.confirmed_booking(user_id) {
                overlapping.push((class_id, booking.clone()));
            }
        }
        overlapping
    }

    /// Confirmed bookings held by the user for classes starting within `day`.
    pub async fn count_user_bookings_for_day(&self, user_id: Ulid, day: Span) -> u32 {
        let mut count = 0;
        for (_, rs) in self.all_classes() {
            let guard = rs.read().await;
            if day.contains_instant(guard.span.start) && guard.confirmed_booking(user_id).is_some()
            {
                count += 1;
            }
        }
        count
    }
}
