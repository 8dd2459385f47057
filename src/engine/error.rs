use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    ClassNotFound(Ulid),
    BookingNotFound { class_id: Ulid, user_id: Ulid },
    WaitlistEntryNotFound { class_id: Ulid, user_id: Ulid },
    ClassNotBookable { class_id: Ulid, reason: &'static str },
    ClassAlreadyCancelled(Ulid),
    AlreadyBooked { class_id: Ulid, user_id: Ulid },
    ScheduleConflict { user_id: Ulid },
    CoachScheduleConflict { coach_id: Ulid, conflicting_class_id: Ulid },
    DailyBookingLimitExceeded { user_id: Ulid, limit: u32 },
    WaitlistFull(Ulid),
    CancellationWindowClosed { class_id: Ulid, window_hours: i64 },
    CapacityBelowEnrollment { class_id: Ulid, capacity: u32, enrolled: u32 },
    /// Another writer committed first; a blind retry of the whole operation
    /// from a fresh read is safe.
    VersionConflict(Ulid),
    Validation(&'static str),
    WalError(String),
}

impl EngineError {
    /// Only concurrency conflicts are worth retrying; business failures are
    /// deterministic for the caller until state actually changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::VersionConflict(_))
    }

    /// Stable machine-readable code for the wire surface.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ClassNotFound(_) => "class_not_found",
            EngineError::BookingNotFound { .. } => "booking_not_found",
            EngineError::WaitlistEntryNotFound { .. } => "waitlist_entry_not_found",
            EngineError::ClassNotBookable { .. } => "class_not_bookable",
            EngineError::ClassAlreadyCancelled(_) => "class_already_cancelled",
            EngineError::AlreadyBooked { .. } => "already_booked",
            EngineError::ScheduleConflict { .. } => "schedule_conflict",
            EngineError::CoachScheduleConflict { .. } => "coach_schedule_conflict",
            EngineError::DailyBookingLimitExceeded { .. } => "daily_booking_limit_exceeded",
            EngineError::WaitlistFull(_) => "waitlist_full",
            EngineError::CancellationWindowClosed { .. } => "cancellation_window_closed",
            EngineError::CapacityBelowEnrollment { .. } => "capacity_below_enrollment",
            EngineError::VersionConflict(_) => "version_conflict",
            EngineError::Validation(_) => "validation",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ClassNotFound(id) => write!(f, "class not found: {id}"),
            EngineError::BookingNotFound { class_id, user_id } => {
                write!(f, "no confirmed booking for user {user_id} in class {class_id}")
            }
            EngineError::WaitlistEntryNotFound { class_id, user_id } => {
                write!(f, "no waitlist entry for user {user_id} in class {class_id}")
            }
            EngineError::ClassNotBookable { class_id, reason } => {
                write!(f, "class {class_id} is not bookable: {reason}")
            }
            EngineError::ClassAlreadyCancelled(id) => {
                write!(f, "class {id} is already cancelled")
            }
            EngineError::AlreadyBooked { class_id, user_id } => {
                write!(f, "user {user_id} is already booked for class {class_id}")
            }
            EngineError::ScheduleConflict { user_id } => {
                write!(f, "user {user_id} has an overlapping confirmed booking")
            }
            EngineError::CoachScheduleConflict { coach_id, conflicting_class_id } => {
                write!(f, "coach {coach_id} already teaches overlapping class {conflicting_class_id}")
            }
            EngineError::DailyBookingLimitExceeded { user_id, limit } => {
                write!(f, "user {user_id} has reached the daily booking limit of {limit}")
            }
            EngineError::WaitlistFull(id) => write!(f, "waitlist is full for class {id}"),
            EngineError::CancellationWindowClosed { class_id, window_hours } => {
                write!(f, "cancellation window of {window_hours}h has closed for class {class_id}")
            }
            EngineError::CapacityBelowEnrollment { class_id, capacity, enrolled } => {
                write!(
                    f,
                    "capacity {capacity} for class {class_id} is below the {enrolled} confirmed bookings"
                )
            }
            EngineError::VersionConflict(id) => {
                write!(f, "concurrent modification of class {id}, retry")
            }
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
