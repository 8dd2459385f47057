use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// The UTC calendar day containing `t`, as a half-open span.
pub fn utc_day_span(t: Ms) -> Span {
    let day = t.div_euclid(DAY_MS);
    Span::new(day * DAY_MS, (day + 1) * DAY_MS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClassStatus {
    Active,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

/// A user's reservation for a class. Cancellation is a soft delete — the row
/// stays for cancellation-count reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub status: BookingStatus,
    pub booked_at: Ms,
    pub cancelled_at: Option<Ms>,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

/// A queued request for a seat on a full class. Positions for one class are
/// always exactly 1..=N in join order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub user_id: Ulid,
    pub position: u32,
    pub created_at: Ms,
}

/// Per-class aggregate: the class row plus the bookings and waitlist it owns.
/// `version` increments once per applied event and is the optimistic-commit
/// guard for every mutation.
#[derive(Debug, Clone)]
pub struct ClassState {
    pub id: Ulid,
    pub location_id: Ulid,
    pub coach_id: Ulid,
    pub name: String,
    pub description: String,
    pub class_type: String,
    pub room: Option<String>,
    pub span: Span,
    pub capacity: u32,
    pub status: ClassStatus,
    pub created_at: Ms,
    pub version: u64,
    pub bookings: Vec<Booking>,
    /// Sorted by position ascending.
    pub waitlist: Vec<WaitlistEntry>,
}

impl ClassState {
    pub fn confirmed_count(&self) -> u32 {
        self.bookings.iter().filter(|b| b.is_confirmed()).count() as u32
    }

    pub fn confirmed_booking(&self, user_id: Ulid) -> Option<&Booking> {
        self.bookings
            .iter()
            .find(|b| b.user_id == user_id && b.is_confirmed())
    }

    pub fn confirmed_user_ids(&self) -> Vec<Ulid> {
        self.bookings
            .iter()
            .filter(|b| b.is_confirmed())
            .map(|b| b.user_id)
            .collect()
    }

    pub fn waitlist_entry(&self, user_id: Ulid) -> Option<&WaitlistEntry> {
        self.waitlist.iter().find(|e| e.user_id == user_id)
    }

    /// Remove an entry by id and close the gap: remaining entries are
    /// renumbered to a contiguous 1..=N by ascending original position.
    pub fn remove_waitlist_entry(&mut self, entry_id: Ulid) -> Option<WaitlistEntry> {
        let pos = self.waitlist.iter().position(|e| e.id == entry_id)?;
        let removed = self.waitlist.remove(pos);
        for (i, e) in self.waitlist.iter_mut().enumerate() {
            e.position = i as u32 + 1;
        }
        Some(removed)
    }

    pub fn summary(&self) -> ClassSummary {
        ClassSummary {
            id: self.id,
            location_id: self.location_id,
            coach_id: self.coach_id,
            name: self.name.clone(),
            description: self.description.clone(),
            class_type: self.class_type.clone(),
            span: self.span,
        }
    }

    pub fn detail(&self) -> ClassDetail {
        ClassDetail {
            id: self.id,
            location_id: self.location_id,
            coach_id: self.coach_id,
            name: self.name.clone(),
            description: self.description.clone(),
            class_type: self.class_type.clone(),
            room: self.room.clone(),
            span: self.span,
            capacity: self.capacity,
            status: self.status,
            enrolled_count: self.confirmed_count(),
            waitlist_size: self.waitlist.len() as u32,
            created_at: self.created_at,
            version: self.version,
        }
    }
}

/// The event types — flat, no nesting. One enum serves as the WAL record
/// format and the payload published to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ClassCreated {
        id: Ulid,
        location_id: Ulid,
        coach_id: Ulid,
        name: String,
        description: String,
        class_type: String,
        room: Option<String>,
        span: Span,
        capacity: u32,
        created_at: Ms,
    },
    /// Carries the post-merge field values so replay needs no merge logic.
    ClassUpdated {
        id: Ulid,
        location_id: Ulid,
        name: String,
        description: String,
        class_type: String,
        coach_id: Ulid,
        room: Option<String>,
        span: Span,
        capacity: u32,
        updated_fields: Vec<String>,
        affected_user_ids: Vec<Ulid>,
    },
    ClassCancelled {
        id: Ulid,
        name: String,
        location_id: Ulid,
        original_start: Ms,
        affected_user_ids: Vec<Ulid>,
        waitlist_user_ids: Vec<Ulid>,
        cancelled_at: Ms,
    },
    ClassBooked {
        booking_id: Ulid,
        class_id: Ulid,
        user_id: Ulid,
        class_name: String,
        start_time: Ms,
        booked_at: Ms,
    },
    /// The class was full at booking time; the user joined the waitlist.
    ClassFull {
        entry_id: Ulid,
        class_id: Ulid,
        user_id: Ulid,
        class_name: String,
        waitlist_size: u32,
        created_at: Ms,
    },
    BookingCancelled {
        booking_id: Ulid,
        class_id: Ulid,
        user_id: Ulid,
        cancelled_at: Ms,
    },
    WaitlistPromoted {
        booking_id: Ulid,
        entry_id: Ulid,
        class_id: Ulid,
        user_id: Ulid,
        class_name: String,
        start_time: Ms,
        promoted_at: Ms,
    },
    /// Queue maintenance only — written to the WAL, never published.
    WaitlistRemoved {
        entry_id: Ulid,
        class_id: Ulid,
        user_id: Ulid,
    },
}

impl Event {
    pub fn class_id(&self) -> Ulid {
        match self {
            Event::ClassCreated { id, .. }
            | Event::ClassUpdated { id, .. }
            | Event::ClassCancelled { id, .. } => *id,
            Event::ClassBooked { class_id, .. }
            | Event::ClassFull { class_id, .. }
            | Event::BookingCancelled { class_id, .. }
            | Event::WaitlistPromoted { class_id, .. }
            | Event::WaitlistRemoved { class_id, .. } => *class_id,
        }
    }

    /// Whether collaborators hear about this event. Waitlist removal has no
    /// state transition for the user beyond leaving the queue; class updates
    /// only matter downstream when the schedule or capacity moved.
    pub fn is_published(&self) -> bool {
        match self {
            Event::WaitlistRemoved { .. } => false,
            Event::ClassUpdated { updated_fields, .. } => updated_fields
                .iter()
                .any(|f| matches!(f.as_str(), "start_time" | "end_time" | "capacity")),
            _ => true,
        }
    }
}

// ── Commands ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClassCommand {
    pub location_id: Ulid,
    pub coach_id: Ulid,
    pub name: String,
    pub description: String,
    pub class_type: String,
    pub room: Option<String>,
    pub span: Span,
    pub capacity: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateClassCommand {
    pub name: Option<String>,
    pub description: Option<String>,
    pub class_type: Option<String>,
    pub coach_id: Option<Ulid>,
    pub room: Option<String>,
    pub start_time: Option<Ms>,
    pub end_time: Option<Ms>,
    pub capacity: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassSearchFilter {
    /// Any instant within the desired UTC calendar day.
    pub date: Option<Ms>,
    pub class_type: Option<String>,
    pub coach_id: Option<Ulid>,
    pub location_id: Option<Ulid>,
    /// Only classes with a free seat.
    pub available: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

// ── Operation results ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookOutcome {
    Booked { booking_id: Ulid },
    Waitlisted { entry_id: Ulid, position: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub booking_id: Ulid,
    pub cancelled_at: Ms,
    pub promoted_user_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelClassOutcome {
    pub class_id: Ulid,
    pub class_name: String,
    pub affected_user_ids: Vec<Ulid>,
    pub waitlist_user_ids: Vec<Ulid>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSummary {
    pub id: Ulid,
    pub location_id: Ulid,
    pub coach_id: Ulid,
    pub name: String,
    pub description: String,
    pub class_type: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDetail {
    pub id: Ulid,
    pub location_id: Ulid,
    pub coach_id: Ulid,
    pub name: String,
    pub description: String,
    pub class_type: String,
    pub room: Option<String>,
    pub span: Span,
    pub capacity: u32,
    pub status: ClassStatus,
    pub enrolled_count: u32,
    pub waitlist_size: u32,
    pub created_at: Ms,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtilizationSummary {
    pub class_id: Ulid,
    pub location_id: Ulid,
    pub class_type: String,
    pub capacity: u32,
    pub enrolled_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntryInfo {
    pub class_id: Ulid,
    pub class_name: String,
    pub user_id: Ulid,
    pub position: u32,
    pub created_at: Ms,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(position: u32) -> WaitlistEntry {
        WaitlistEntry {
            id: Ulid::new(),
            user_id: Ulid::new(),
            position,
            created_at: position as Ms * 1000,
        }
    }

    fn make_class() -> ClassState {
        ClassState {
            id: Ulid::new(),
            location_id: Ulid::new(),
            coach_id: Ulid::new(),
            name: "HIIT".into(),
            description: "High intensity".into(),
            class_type: "hiit".into(),
            room: None,
            span: Span::new(1_700_000_000_000, 1_700_003_600_000),
            capacity: 10,
            status: ClassStatus::Active,
            created_at: 0,
            version: 0,
            bookings: Vec::new(),
            waitlist: Vec::new(),
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn utc_day_span_buckets() {
        let day = utc_day_span(DAY_MS + 5);
        assert_eq!(day, Span::new(DAY_MS, 2 * DAY_MS));
        assert!(day.contains_instant(DAY_MS));
        assert!(!day.contains_instant(2 * DAY_MS));
    }

    #[test]
    fn confirmed_count_ignores_cancelled() {
        let mut c = make_class();
        c.bookings.push(Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            status: BookingStatus::Confirmed,
            booked_at: 1,
            cancelled_at: None,
        });
        c.bookings.push(Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            status: BookingStatus::Cancelled,
            booked_at: 1,
            cancelled_at: Some(2),
        });
        assert_eq!(c.confirmed_count(), 1);
    }

    #[test]
    fn confirmed_booking_skips_cancelled_row() {
        let mut c = make_class();
        let user = Ulid::new();
        c.bookings.push(Booking {
            id: Ulid::new(),
            user_id: user,
            status: BookingStatus::Cancelled,
            booked_at: 1,
            cancelled_at: Some(2),
        });
        assert!(c.confirmed_booking(user).is_none());
        c.bookings.push(Booking {
            id: Ulid::new(),
            user_id: user,
            status: BookingStatus::Confirmed,
            booked_at: 3,
            cancelled_at: None,
        });
        assert!(c.confirmed_booking(user).is_some());
    }

    #[test]
    fn waitlist_removal_renumbers_contiguously() {
        let mut c = make_class();
        let entries = [entry(1), entry(2), entry(3)];
        c.waitlist.extend(entries.iter().cloned());

        let removed = c.remove_waitlist_entry(entries[1].id).unwrap();
        assert_eq!(removed.user_id, entries[1].user_id);

        let positions: Vec<u32> = c.waitlist.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![1, 2]);
        // Join order preserved.
        assert_eq!(c.waitlist[0].user_id, entries[0].user_id);
        assert_eq!(c.waitlist[1].user_id, entries[2].user_id);
    }

    #[test]
    fn waitlist_removal_missing_id_is_none() {
        let mut c = make_class();
        c.waitlist.push(entry(1));
        assert!(c.remove_waitlist_entry(Ulid::new()).is_none());
        assert_eq!(c.waitlist.len(), 1);
    }

    #[test]
    fn waitlist_removed_is_not_published() {
        let e = Event::WaitlistRemoved {
            entry_id: Ulid::new(),
            class_id: Ulid::new(),
            user_id: Ulid::new(),
        };
        assert!(!e.is_published());
    }

    #[test]
    fn class_updated_published_only_for_schedule_changes() {
        let updated = |fields: &[&str]| Event::ClassUpdated {
            id: Ulid::new(),
            location_id: Ulid::new(),
            name: "Yoga".into(),
            description: String::new(),
            class_type: "yoga".into(),
            coach_id: Ulid::new(),
            room: None,
            span: Span::new(0, 100),
            capacity: 5,
            updated_fields: fields.iter().map(|s| s.to_string()).collect(),
            affected_user_ids: vec![],
        };
        assert!(!updated(&["name", "room"]).is_published());
        assert!(updated(&["name", "capacity"]).is_published());
        assert!(updated(&["start_time"]).is_published());
        assert!(updated(&["end_time"]).is_published());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ClassBooked {
            booking_id: Ulid::new(),
            class_id: Ulid::new(),
            user_id: Ulid::new(),
            class_name: "Spin".into(),
            start_time: 1_700_000_000_000,
            booked_at: 1_699_999_000_000,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
