use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::conflict::now_ms;
use super::{Engine, EngineError};

impl Engine {
    /// Book a seat, or join the waitlist when the class is full.
    ///
    /// Preconditions run in a fixed order against one snapshot, each a
    /// fail-fast error; the decision then commits against the snapshot's
    /// version, so two racing bookings for the last seat cannot both land.
    pub async fn book_class(
        &self,
        class_id: Ulid,
        user_id: Ulid,
    ) -> Result<BookOutcome, EngineError> {
        let rules = self.rules();
        let snapshot = self.snapshot(&class_id).await?;

        if snapshot.status != ClassStatus::Active {
            return Err(EngineError::ClassNotBookable {
                class_id,
                reason: "class is not active",
            });
        }
        let now = now_ms();
        if snapshot.span.start <= now {
            return Err(EngineError::ClassNotBookable {
                class_id,
                reason: "class has already started",
            });
        }
        if snapshot.confirmed_booking(user_id).is_some() {
            return Err(EngineError::AlreadyBooked { class_id, user_id });
        }

        let overlapping = self.find_overlapping_bookings(user_id, snapshot.span).await;
        if !overlapping.is_empty() {
            return Err(EngineError::ScheduleConflict { user_id });
        }

        let day = utc_day_span(snapshot.span.start);
        let daily_count = self.count_user_bookings_for_day(user_id, day).await;
        if daily_count >= rules.max_bookings_per_day {
            return Err(EngineError::DailyBookingLimitExceeded {
                user_id,
                limit: rules.max_bookings_per_day,
            });
        }

        if snapshot.confirmed_count() < snapshot.capacity {
            let booking_id = Ulid::new();
            let event = Event::ClassBooked {
                booking_id,
                class_id,
                user_id,
                class_name: snapshot.name.clone(),
                start_time: snapshot.span.start,
                booked_at: now,
            };
            self.commit(class_id, snapshot.version, vec![event]).await?;
            metrics::counter!(observability::BOOKINGS_TOTAL).increment(1);
            return Ok(BookOutcome::Booked { booking_id });
        }

        // Full — waitlist path.
        if snapshot.waitlist.len() as u32 >= rules.max_waitlist_size {
            return Err(EngineError::WaitlistFull(class_id));
        }
        if snapshot.waitlist_entry(user_id).is_some() {
            return Err(EngineError::AlreadyBooked { class_id, user_id });
        }

        let entry_id = Ulid::new();
        let position = snapshot.waitlist.len() as u32 + 1;
        let event = Event::ClassFull {
            entry_id,
            class_id,
            user_id,
            class_name: snapshot.name.clone(),
            waitlist_size: position,
            created_at: now,
        };
        self.commit(class_id, snapshot.version, vec![event]).await?;
        metrics::counter!(observability::WAITLIST_JOINS_TOTAL).increment(1);
        Ok(BookOutcome::Waitlisted { entry_id, position })
    }

    /// Cancel a confirmed booking and run the promotion cascade: the freed
    /// seat goes to the first waitlisted user without an overlapping booking
    /// elsewhere — at most one promotion per cancellation. Cancellation and
    /// promotion commit as one unit.
    pub async fn cancel_booking(
        &self,
        class_id: Ulid,
        user_id: Ulid,
    ) -> Result<CancelOutcome, EngineError> {
        let rules = self.rules();
        let snapshot = self.snapshot(&class_id).await?;

        let booking = snapshot
            .confirmed_booking(user_id)
            .cloned()
            .ok_or(EngineError::BookingNotFound { class_id, user_id })?;

        let now = now_ms();
        // Whole hours, truncated toward zero; a class already underway is
        // always inside the window.
        let hours_until_start = (snapshot.span.start - now) / HOUR_MS;
        if hours_until_start < rules.cancellation_window_hours {
            return Err(EngineError::CancellationWindowClosed {
                class_id,
                window_hours: rules.cancellation_window_hours,
            });
        }

        let mut events = vec![Event::BookingCancelled {
            booking_id: booking.id,
            class_id,
            user_id,
            cancelled_at: now,
        }];

        let mut promoted_user_id = None;
        for entry in &snapshot.waitlist {
            let overlapping = self
                .find_overlapping_bookings(entry.user_id, snapshot.span)
                .await;
            if !overlapping.is_empty() {
                // Conflicted entries stay queued, untouched.
                continue;
            }
            events.push(Event::WaitlistPromoted {
                booking_id: Ulid::new(),
                entry_id: entry.id,
                class_id,
                user_id: entry.user_id,
                class_name: snapshot.name.clone(),
                start_time: snapshot.span.start,
                promoted_at: now,
            });
            promoted_user_id = Some(entry.user_id);
            break;
        }

        self.commit(class_id, snapshot.version, events).await?;
        metrics::counter!(observability::BOOKING_CANCELLATIONS_TOTAL).increment(1);
        if promoted_user_id.is_some() {
            metrics::counter!(observability::PROMOTIONS_TOTAL).increment(1);
        }
        Ok(CancelOutcome {
            booking_id: booking.id,
            cancelled_at: now,
            promoted_user_id,
        })
    }

    /// Take a user off a waitlist. Pure queue maintenance: the remaining
    /// entries are renumbered and no event reaches collaborators.
    pub async fn remove_from_waitlist(
        &self,
        class_id: Ulid,
        user_id: Ulid,
    ) -> Result<(), EngineError> {
        let snapshot = self.snapshot(&class_id).await?;
        let entry = snapshot
            .waitlist_entry(user_id)
            .cloned()
            .ok_or(EngineError::WaitlistEntryNotFound { class_id, user_id })?;

        let event = Event::WaitlistRemoved {
            entry_id: entry.id,
            class_id,
            user_id,
        };
        self.commit(class_id, snapshot.version, vec![event]).await
    }
}
