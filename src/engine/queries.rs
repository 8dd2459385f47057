use ulid::Ulid;

use crate::model::*;

use super::conflict::{now_ms, validate_query_window};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_class(&self, class_id: Ulid) -> Result<ClassDetail, EngineError> {
        let rs = self
            .class(&class_id)
            .ok_or(EngineError::ClassNotFound(class_id))?;
        let guard = rs.read().await;
        Ok(guard.detail())
    }

    /// Classes at a location that haven't started yet, soonest first.
    pub async fn upcoming_classes_by_location(&self, location_id: Ulid) -> Vec<ClassSummary> {
        let ids = self
            .by_location
            .get(&location_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let now = now_ms();
        let mut upcoming = Vec::new();
        for id in ids {
            let Some(rs) = self.class(&id) else { continue };
            let guard = rs.read().await;
            if guard.span.start > now {
                upcoming.push(guard.summary());
            }
        }
        upcoming.sort_by_key(|c| c.span.start);
        upcoming
    }

    /// All of a coach's classes intersecting the window, regardless of status.
    pub async fn classes_by_coach_in_range(
        &self,
        coach_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<ClassSummary>, EngineError> {
        let window = validate_query_window(start, end)?;
        let ids = self
            .by_coach
            .get(&coach_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut found = Vec::new();
        for id in ids {
            let Some(rs) = self.class(&id) else { continue };
            let guard = rs.read().await;
            if guard.span.overlaps(&window) {
                found.push(guard.summary());
            }
        }
        found.sort_by_key(|c| c.span.start);
        Ok(found)
    }

    /// Enrollment against capacity for every class starting in the window.
    pub async fn utilization_by_date_range(
        &self,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<UtilizationSummary>, EngineError> {
        let window = validate_query_window(start, end)?;
        let mut out = Vec::new();
        for (_, rs) in self.all_classes() {
            let guard = rs.read().await;
            if window.contains_instant(guard.span.start) {
                out.push(UtilizationSummary {
                    class_id: guard.id,
                    location_id: guard.location_id,
                    class_type: guard.class_type.clone(),
                    capacity: guard.capacity,
                    enrolled_count: guard.confirmed_count(),
                });
            }
        }
        out.sort_by_key(|u| u.class_id);
        Ok(out)
    }

    /// Booking cancellations whose timestamp falls in `[start, end]`
    /// (inclusive both ends), optionally scoped to one location.
    pub async fn count_cancellations_between(
        &self,
        start: Ms,
        end: Ms,
        location_id: Option<Ulid>,
    ) -> Result<u64, EngineError> {
        validate_query_window(start, end)?;
        let mut count = 0;
        for (_, rs) in self.all_classes() {
            let guard = rs.read().await;
            if let Some(location_id) = location_id
                && guard.location_id != location_id
            {
                continue;
            }
            count += guard
                .bookings
                .iter()
                .filter(|b| {
                    b.status == BookingStatus::Cancelled
                        && b.cancelled_at
                            .is_some_and(|t| start <= t && t <= end)
                })
                .count() as u64;
        }
        Ok(count)
    }

    /// Member-facing search: active, not-yet-started classes matched against
    /// the optional filters, ordered by start time, paged by offset/limit.
    pub async fn search_classes(&self, filter: ClassSearchFilter) -> Vec<ClassDetail> {
        let now = now_ms();
        let day = filter.date.map(utc_day_span);

        let mut matches = Vec::new();
        for (_, rs) in self.all_classes() {
            let guard = rs.read().await;
            if guard.status != ClassStatus::Active || guard.span.start <= now {
                continue;
            }
            if let Some(day) = day
                && !day.contains_instant(guard.span.start)
            {
                continue;
            }
            if let Some(ref class_type) = filter.class_type
                && !guard.class_type.eq_ignore_ascii_case(class_type)
            {
                continue;
            }
            if let Some(coach_id) = filter.coach_id
                && guard.coach_id != coach_id
            {
                continue;
            }
            if let Some(location_id) = filter.location_id
                && guard.location_id != location_id
            {
                continue;
            }
            if filter.available && guard.confirmed_count() >= guard.capacity {
                continue;
            }
            matches.push(guard.detail());
        }

        matches.sort_by_key(|c| c.span.start);
        matches
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// A user's waitlist entries across all classes, newest first.
    pub async fn user_waitlist_entries(&self, user_id: Ulid) -> Vec<WaitlistEntryInfo> {
        let mut entries = Vec::new();
        for (class_id, rs) in self.all_classes() {
            let guard = rs.read().await;
            if let Some(entry) = guard.waitlist_entry(user_id) {
                entries.push(WaitlistEntryInfo {
                    class_id,
                    class_name: guard.name.clone(),
                    user_id,
                    position: entry.position,
                    created_at: entry.created_at,
                });
            }
        }
        entries.sort_by_key(|e| std::cmp::Reverse(e.created_at));
        entries
    }
}
