use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{now_ms, validate_span};
use super::{Engine, EngineError};

fn validate_text_fields(
    name: &str,
    description: &str,
    class_type: &str,
    room: Option<&str>,
) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::Validation("class name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::Validation("class name too long"));
    }
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::Validation("description too long"));
    }
    if class_type.is_empty() || class_type.len() > MAX_CLASS_TYPE_LEN {
        return Err(EngineError::Validation("class type missing or too long"));
    }
    if let Some(room) = room
        && room.len() > MAX_ROOM_LEN
    {
        return Err(EngineError::Validation("room name too long"));
    }
    Ok(())
}

fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::Validation("capacity must be at least 1"));
    }
    if capacity > MAX_CAPACITY {
        return Err(EngineError::Validation("capacity too large"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_class(
        &self,
        command: CreateClassCommand,
    ) -> Result<ClassDetail, EngineError> {
        validate_text_fields(
            &command.name,
            &command.description,
            &command.class_type,
            command.room.as_deref(),
        )?;
        validate_span(&command.span)?;
        validate_capacity(command.capacity)?;
        if self.class_count() >= MAX_CLASSES {
            return Err(EngineError::Validation("too many classes"));
        }

        let conflicts = self
            .find_coach_conflicts(command.coach_id, command.span, None)
            .await;
        if let Some(conflict) = conflicts.first() {
            return Err(EngineError::CoachScheduleConflict {
                coach_id: command.coach_id,
                conflicting_class_id: conflict.id,
            });
        }

        let id = Ulid::new();
        let created_at = now_ms();
        let event = Event::ClassCreated {
            id,
            location_id: command.location_id,
            coach_id: command.coach_id,
            name: command.name.clone(),
            description: command.description.clone(),
            class_type: command.class_type.clone(),
            room: command.room.clone(),
            span: command.span,
            capacity: command.capacity,
            created_at,
        };
        self.wal_append(vec![event.clone()]).await?;

        let rs = ClassState {
            id,
            location_id: command.location_id,
            coach_id: command.coach_id,
            name: command.name,
            description: command.description,
            class_type: command.class_type,
            room: command.room,
            span: command.span,
            capacity: command.capacity,
            status: ClassStatus::Active,
            created_at,
            version: 0,
            bookings: Vec::new(),
            waitlist: Vec::new(),
        };
        let detail = rs.detail();
        self.classes.insert(id, Arc::new(RwLock::new(rs)));
        self.by_coach.entry(command.coach_id).or_default().push(id);
        self.by_location
            .entry(command.location_id)
            .or_default()
            .push(id);
        self.notify.publish(id, &event);
        Ok(detail)
    }

    /// Partial field update. Schedule/capacity changes notify the confirmed
    /// users downstream; cosmetic changes are persisted quietly. Capacity can
    /// never drop below the current confirmed count.
    pub async fn update_class(
        &self,
        class_id: Ulid,
        command: UpdateClassCommand,
    ) -> Result<ClassDetail, EngineError> {
        let snapshot = self.snapshot(&class_id).await?;

        let mut next = snapshot.clone();
        let mut updated_fields: Vec<String> = Vec::new();

        if let Some(name) = command.name {
            next.name = name;
            updated_fields.push("name".into());
        }
        if let Some(description) = command.description {
            next.description = description;
            updated_fields.push("description".into());
        }
        if let Some(class_type) = command.class_type {
            next.class_type = class_type;
            updated_fields.push("class_type".into());
        }
        if let Some(coach_id) = command.coach_id {
            next.coach_id = coach_id;
            updated_fields.push("coach_id".into());
        }
        if let Some(room) = command.room {
            next.room = Some(room);
            updated_fields.push("room".into());
        }
        if let Some(start_time) = command.start_time {
            next.span.start = start_time;
            updated_fields.push("start_time".into());
        }
        if let Some(end_time) = command.end_time {
            next.span.end = end_time;
            updated_fields.push("end_time".into());
        }
        if let Some(capacity) = command.capacity {
            next.capacity = capacity;
            updated_fields.push("capacity".into());
        }

        if updated_fields.is_empty() {
            return Ok(snapshot.detail());
        }

        validate_text_fields(
            &next.name,
            &next.description,
            &next.class_type,
            next.room.as_deref(),
        )?;
        validate_span(&next.span)?;
        validate_capacity(next.capacity)?;

        let enrolled = snapshot.confirmed_count();
        if next.capacity < enrolled {
            return Err(EngineError::CapacityBelowEnrollment {
                class_id,
                capacity: next.capacity,
                enrolled,
            });
        }

        let schedule_moved = next.coach_id != snapshot.coach_id || next.span != snapshot.span;
        if schedule_moved {
            let conflicts = self
                .find_coach_conflicts(next.coach_id, next.span, Some(class_id))
                .await;
            if let Some(conflict) = conflicts.first() {
                return Err(EngineError::CoachScheduleConflict {
                    coach_id: next.coach_id,
                    conflicting_class_id: conflict.id,
                });
            }
        }

        let notifies_users = updated_fields
            .iter()
            .any(|f| matches!(f.as_str(), "start_time" | "end_time" | "capacity"));
        let affected_user_ids = if notifies_users {
            snapshot.confirmed_user_ids()
        } else {
            Vec::new()
        };

        let event = Event::ClassUpdated {
            id: class_id,
            location_id: snapshot.location_id,
            name: next.name.clone(),
            description: next.description.clone(),
            class_type: next.class_type.clone(),
            coach_id: next.coach_id,
            room: next.room.clone(),
            span: next.span,
            capacity: next.capacity,
            updated_fields,
            affected_user_ids,
        };
        self.commit(class_id, snapshot.version, vec![event]).await?;

        next.version = snapshot.version + 1;
        Ok(next.detail())
    }

    /// Cancel a class outright: every confirmed booking is marked cancelled,
    /// the waitlist is cleared, and one event carries all affected users for
    /// downstream notification/refund handling. Cancelling twice is rejected
    /// rather than re-emitting the event at consumers.
    pub async fn cancel_class(&self, class_id: Ulid) -> Result<CancelClassOutcome, EngineError> {
        let snapshot = self.snapshot(&class_id).await?;
        if snapshot.status == ClassStatus::Cancelled {
            return Err(EngineError::ClassAlreadyCancelled(class_id));
        }

        let affected_user_ids = snapshot.confirmed_user_ids();
        let waitlist_user_ids: Vec<Ulid> =
            snapshot.waitlist.iter().map(|e| e.user_id).collect();

        let event = Event::ClassCancelled {
            id: class_id,
            name: snapshot.name.clone(),
            location_id: snapshot.location_id,
            original_start: snapshot.span.start,
            affected_user_ids: affected_user_ids.clone(),
            waitlist_user_ids: waitlist_user_ids.clone(),
            cancelled_at: now_ms(),
        };
        self.commit(class_id, snapshot.version, vec![event]).await?;
        metrics::counter!(observability::CLASS_CANCELLATIONS_TOTAL).increment(1);

        Ok(CancelClassOutcome {
            class_id,
            class_name: snapshot.name,
            affected_user_ids,
            waitlist_user_ids,
        })
    }
}
