mod booking;
mod conflict;
mod error;
mod lifecycle;
mod queries;
pub mod retry;

pub use error::EngineError;
pub use retry::with_retries;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::EventHub;
use crate::observability;
use crate::rules::BusinessRules;
use crate::wal::Wal;

pub type SharedClassState = Arc<RwLock<ClassState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        /// One operation's events — buffered contiguously, flushed together.
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block on the first append, drain whatever else is immediately queued,
/// write it all, then a single fsync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            // Flush the open batch before the non-append command.
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    let event_count: usize = batch.iter().map(|(events, _)| events.len()).sum();
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(event_count as f64);

    let flush_start = std::time::Instant::now();
    let mut append_err: Option<io::Error> = None;
    for (events, _) in batch.iter() {
        if let Err(e) = wal.append_all_buffered(events) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even after an append error, so partially buffered bytes
    // don't leak into the next batch (these callers are told the batch failed).
    let flush_err = wal.flush_sync().err();
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    let result = match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    };
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    classes: DashMap<Ulid, SharedClassState>,
    /// Secondary indexes for the query/conflict paths.
    pub(super) by_coach: DashMap<Ulid, Vec<Ulid>>,
    pub(super) by_location: DashMap<Ulid, Vec<Ulid>>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<EventHub>,
    rules: watch::Receiver<BusinessRules>,
}

/// Apply an event directly to a ClassState (no locking — caller holds the
/// lock). Creation is handled at the map level, not here.
fn apply_to_class(rs: &mut ClassState, event: &Event) {
    match event {
        Event::ClassCreated { .. } => {}
        Event::ClassUpdated {
            name,
            description,
            class_type,
            coach_id,
            room,
            span,
            capacity,
            ..
        } => {
            rs.name = name.clone();
            rs.description = description.clone();
            rs.class_type = class_type.clone();
            rs.coach_id = *coach_id;
            rs.room = room.clone();
            rs.span = *span;
            rs.capacity = *capacity;
        }
        Event::ClassCancelled { cancelled_at, .. } => {
            rs.status = ClassStatus::Cancelled;
            for booking in rs.bookings.iter_mut().filter(|b| b.is_confirmed()) {
                booking.status = BookingStatus::Cancelled;
                booking.cancelled_at = Some(*cancelled_at);
            }
            rs.waitlist.clear();
        }
        Event::ClassBooked {
            booking_id,
            user_id,
            booked_at,
            ..
        } => {
            rs.bookings.push(Booking {
                id: *booking_id,
                user_id: *user_id,
                status: BookingStatus::Confirmed,
                booked_at: *booked_at,
                cancelled_at: None,
            });
        }
        Event::ClassFull {
            entry_id,
            user_id,
            waitlist_size,
            created_at,
            ..
        } => {
            rs.waitlist.push(WaitlistEntry {
                id: *entry_id,
                user_id: *user_id,
                position: *waitlist_size,
                created_at: *created_at,
            });
        }
        Event::BookingCancelled {
            booking_id,
            cancelled_at,
            ..
        } => {
            if let Some(booking) = rs.bookings.iter_mut().find(|b| b.id == *booking_id) {
                booking.status = BookingStatus::Cancelled;
                booking.cancelled_at = Some(*cancelled_at);
            }
        }
        Event::WaitlistPromoted {
            booking_id,
            entry_id,
            user_id,
            promoted_at,
            ..
        } => {
            rs.remove_waitlist_entry(*entry_id);
            rs.bookings.push(Booking {
                id: *booking_id,
                user_id: *user_id,
                status: BookingStatus::Confirmed,
                booked_at: *promoted_at,
                cancelled_at: None,
            });
        }
        Event::WaitlistRemoved { entry_id, .. } => {
            rs.remove_waitlist_entry(*entry_id);
        }
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<EventHub>,
        rules: watch::Receiver<BusinessRules>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            classes: DashMap::new(),
            by_coach: DashMap::new(),
            by_location: DashMap::new(),
            wal_tx,
            notify,
            rules,
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never blocking_write here: this may run inside
        // an async context.
        for event in &events {
            if let Event::ClassCreated {
                id,
                location_id,
                coach_id,
                name,
                description,
                class_type,
                room,
                span,
                capacity,
                created_at,
            } = event
            {
                let rs = ClassState {
                    id: *id,
                    location_id: *location_id,
                    coach_id: *coach_id,
                    name: name.clone(),
                    description: description.clone(),
                    class_type: class_type.clone(),
                    room: room.clone(),
                    span: *span,
                    capacity: *capacity,
                    status: ClassStatus::Active,
                    created_at: *created_at,
                    version: 0,
                    bookings: Vec::new(),
                    waitlist: Vec::new(),
                };
                engine.classes.insert(*id, Arc::new(RwLock::new(rs)));
                engine.by_coach.entry(*coach_id).or_default().push(*id);
                engine.by_location.entry(*location_id).or_default().push(*id);
            } else {
                let class_id = event.class_id();
                let Some(entry) = engine.classes.get(&class_id) else {
                    tracing::warn!("replay: dropping event for unknown class {class_id}");
                    continue;
                };
                let rs_arc = entry.value().clone();
                drop(entry);
                let mut guard = rs_arc.try_write().expect("replay: uncontended write");
                let old_coach = guard.coach_id;
                apply_to_class(&mut guard, event);
                guard.version += 1;
                if guard.coach_id != old_coach {
                    engine.reindex_coach(class_id, old_coach, guard.coach_id);
                }
            }
        }

        Ok(engine)
    }

    pub(super) fn rules(&self) -> BusinessRules {
        *self.rules.borrow()
    }

    pub(super) fn class(&self, id: &Ulid) -> Option<SharedClassState> {
        self.classes.get(id).map(|e| e.value().clone())
    }

    pub(super) fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Snapshot the class map for cross-class scans. The clones are cheap
    /// Arc bumps; read locks are taken one class at a time afterwards.
    pub(super) fn all_classes(&self) -> Vec<(Ulid, SharedClassState)> {
        self.classes
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    pub(super) fn reindex_coach(&self, class_id: Ulid, old_coach: Ulid, new_coach: Ulid) {
        if let Some(mut ids) = self.by_coach.get_mut(&old_coach) {
            ids.retain(|c| c != &class_id);
        }
        self.by_coach.entry(new_coach).or_default().push(class_id);
    }

    /// Write one operation's events to the WAL via the group-commit writer.
    pub(super) async fn wal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Clone the class aggregate under a short read lock. The returned value
    /// carries the `version` the optimistic commit will be checked against.
    pub(super) async fn snapshot(&self, class_id: &Ulid) -> Result<ClassState, EngineError> {
        let rs = self
            .class(class_id)
            .ok_or(EngineError::ClassNotFound(*class_id))?;
        let guard = rs.read().await;
        Ok(guard.clone())
    }

    /// The single write path for existing classes: re-acquire the lock, check
    /// that nobody committed since the snapshot was taken, then persist and
    /// apply the whole event batch as one unit. On a stale version nothing is
    /// written and the caller gets a retryable conflict.
    pub(super) async fn commit(
        &self,
        class_id: Ulid,
        expected_version: u64,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        let rs = self
            .class(&class_id)
            .ok_or(EngineError::ClassNotFound(class_id))?;
        let mut guard = rs.write_owned().await;
        if guard.version != expected_version {
            metrics::counter!(observability::VERSION_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::VersionConflict(class_id));
        }

        self.wal_append(events.clone()).await?;

        let old_coach = guard.coach_id;
        for event in &events {
            apply_to_class(&mut guard, event);
            guard.version += 1;
            if event.is_published() {
                self.notify.publish(class_id, event);
            }
        }
        if guard.coach_id != old_coach {
            self.reindex_coach(class_id, old_coach, guard.coach_id);
        }
        Ok(())
    }

    /// Rewrite the WAL with the minimal event list that recreates the current
    /// state: one creation per class, bookings replayed with their original
    /// timestamps (cancelled ones as a book/cancel pair, so cancellation
    /// reporting survives compaction), waitlist joins, and a closing
    /// cancellation marker for cancelled classes.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for (_, rs) in self.all_classes() {
            let guard = rs.read().await;
            events.push(Event::ClassCreated {
                id: guard.id,
                location_id: guard.location_id,
                coach_id: guard.coach_id,
                name: guard.name.clone(),
                description: guard.description.clone(),
                class_type: guard.class_type.clone(),
                room: guard.room.clone(),
                span: guard.span,
                capacity: guard.capacity,
                created_at: guard.created_at,
            });
            for booking in &guard.bookings {
                events.push(Event::ClassBooked {
                    booking_id: booking.id,
                    class_id: guard.id,
                    user_id: booking.user_id,
                    class_name: guard.name.clone(),
                    start_time: guard.span.start,
                    booked_at: booking.booked_at,
                });
                if let Some(cancelled_at) = booking.cancelled_at {
                    events.push(Event::BookingCancelled {
                        booking_id: booking.id,
                        class_id: guard.id,
                        user_id: booking.user_id,
                        cancelled_at,
                    });
                }
            }
            for entry in &guard.waitlist {
                events.push(Event::ClassFull {
                    entry_id: entry.id,
                    class_id: guard.id,
                    user_id: entry.user_id,
                    class_name: guard.name.clone(),
                    waitlist_size: entry.position,
                    created_at: entry.created_at,
                });
            }
            if guard.status == ClassStatus::Cancelled {
                // All bookings were already emitted as cancelled pairs, so the
                // marker only needs to flip the status on replay.
                let cancelled_at = guard
                    .bookings
                    .iter()
                    .filter_map(|b| b.cancelled_at)
                    .max()
                    .unwrap_or(guard.created_at);
                events.push(Event::ClassCancelled {
                    id: guard.id,
                    name: guard.name.clone(),
                    location_id: guard.location_id,
                    original_start: guard.span.start,
                    affected_user_ids: Vec::new(),
                    waitlist_user_ids: Vec::new(),
                    cancelled_at,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
