//! Line-delimited JSON command protocol. One request per line, one response
//! per line; LISTEN subscriptions interleave pushed `event` lines with
//! responses. The first line of every connection must authenticate.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;
use ulid::Ulid;

use crate::directory::{Directory, LocationInfo, StaticDirectory};
use crate::engine::{with_retries, Engine, EngineError};
use crate::limits::MAX_WIRE_LINE_LEN;
use crate::model::*;
use crate::observability;
use crate::rules::{BusinessRules, RulesHandle};

/// Bounded retries around optimistic commits, on behalf of clients.
const COMMIT_RETRY_ATTEMPTS: u32 = 3;

pub struct WireContext {
    pub engine: Arc<Engine>,
    pub rules: Arc<RulesHandle>,
    pub directory: Arc<StaticDirectory>,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Auth {
        token: String,
    },
    UpsertCoach {
        coach_id: Ulid,
        active: bool,
    },
    UpsertLocation {
        location_id: Ulid,
        name: String,
        time_zone: String,
    },
    CreateClass {
        location_id: Ulid,
        coach_id: Ulid,
        name: String,
        #[serde(default)]
        description: String,
        class_type: String,
        room: Option<String>,
        start: Ms,
        end: Ms,
        capacity: u32,
    },
    UpdateClass {
        class_id: Ulid,
        name: Option<String>,
        description: Option<String>,
        class_type: Option<String>,
        coach_id: Option<Ulid>,
        room: Option<String>,
        start: Option<Ms>,
        end: Option<Ms>,
        capacity: Option<u32>,
    },
    CancelClass {
        class_id: Ulid,
    },
    Book {
        class_id: Ulid,
        user_id: Ulid,
    },
    CancelBooking {
        class_id: Ulid,
        user_id: Ulid,
    },
    LeaveWaitlist {
        class_id: Ulid,
        user_id: Ulid,
    },
    GetClass {
        class_id: Ulid,
    },
    UpcomingClasses {
        location_id: Ulid,
    },
    CoachSchedule {
        coach_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SearchClasses {
        date: Option<Ms>,
        class_type: Option<String>,
        coach_id: Option<Ulid>,
        location_id: Option<Ulid>,
        #[serde(default)]
        available: bool,
        #[serde(default)]
        offset: usize,
        limit: Option<usize>,
    },
    Utilization {
        start: Ms,
        end: Ms,
    },
    CancellationCount {
        start: Ms,
        end: Ms,
        location_id: Option<Ulid>,
    },
    UserWaitlist {
        user_id: Ulid,
    },
    SetRule {
        key: String,
        value: i64,
    },
    GetRules,
    Listen {
        class_id: Ulid,
    },
    ListenAll,
    Unlisten {
        class_id: Ulid,
    },
    UnlistenAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Error {
        code: String,
        message: String,
    },
    Class {
        detail: ClassDetail,
    },
    Classes {
        classes: Vec<ClassSummary>,
    },
    ClassPage {
        classes: Vec<ClassDetail>,
    },
    Booked {
        booking_id: Ulid,
    },
    Waitlisted {
        entry_id: Ulid,
        position: u32,
    },
    BookingCancelled {
        booking_id: Ulid,
        promoted_user_id: Option<Ulid>,
    },
    ClassCancelled {
        affected_user_ids: Vec<Ulid>,
        waitlist_user_ids: Vec<Ulid>,
    },
    Utilization {
        classes: Vec<UtilizationSummary>,
    },
    Count {
        count: u64,
    },
    WaitlistEntries {
        entries: Vec<WaitlistEntryInfo>,
    },
    Rules {
        rules: BusinessRules,
    },
    /// Pushed asynchronously to LISTEN subscribers.
    Event {
        class_id: Ulid,
        event: Event,
    },
}

impl Response {
    fn error(err: &EngineError) -> Self {
        Response::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Response::Error { .. } => "error",
            _ => "ok",
        }
    }
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

/// Per-subscription forwarder handles, aborted on UNLISTEN or disconnect.
struct Subscriptions {
    per_class: HashMap<Ulid, JoinHandle<()>>,
    firehose: Option<JoinHandle<()>>,
}

impl Subscriptions {
    fn new() -> Self {
        Self {
            per_class: HashMap::new(),
            firehose: None,
        }
    }

    fn abort_all(&mut self) {
        for (_, handle) in self.per_class.drain() {
            handle.abort();
        }
        if let Some(handle) = self.firehose.take() {
            handle.abort();
        }
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.abort_all();
    }
}

pub async fn process_connection(socket: TcpStream, ctx: Arc<WireContext>) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_WIRE_LINE_LEN));

    // Auth handshake: first line, or the connection is refused.
    let Some(first) = framed.next().await else {
        return Ok(());
    };
    let authed = match serde_json::from_str::<Request>(&first.map_err(codec_err)?) {
        Ok(Request::Auth { token }) => token == ctx.token,
        _ => false,
    };
    if !authed {
        metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
        let resp = Response::Error {
            code: "unauthorized".into(),
            message: "authentication required".into(),
        };
        let _ = framed
            .send(serde_json::to_string(&resp).expect("response serializes"))
            .await;
        return Ok(());
    }
    framed
        .send(serde_json::to_string(&Response::Ok).expect("response serializes"))
        .await
        .map_err(codec_err)?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<(Ulid, Event)>();
    let mut subs = Subscriptions::new();

    loop {
        tokio::select! {
            line = framed.next() => {
                let Some(line) = line else { break };
                let line = line.map_err(codec_err)?;
                let response = match serde_json::from_str::<Request>(&line) {
                    Ok(request) => {
                        let label = observability::command_label(&request);
                        let started = std::time::Instant::now();
                        let response = dispatch(&ctx, request, &event_tx, &mut subs).await;
                        metrics::histogram!(observability::COMMAND_DURATION_SECONDS, "command" => label)
                            .record(started.elapsed().as_secs_f64());
                        metrics::counter!(
                            observability::COMMANDS_TOTAL,
                            "command" => label,
                            "status" => response.label()
                        )
                        .increment(1);
                        response
                    }
                    Err(e) => {
                        debug!("unparseable request: {e}");
                        Response::Error {
                            code: "bad_request".into(),
                            message: format!("malformed request: {e}"),
                        }
                    }
                };
                framed
                    .send(serde_json::to_string(&response).expect("response serializes"))
                    .await
                    .map_err(codec_err)?;
            }
            event = event_rx.recv() => {
                // Senders live in this task's subscriptions; recv only fails
                // after abort, at which point the loop is ending anyway.
                let Some((class_id, event)) = event else { break };
                let push = Response::Event { class_id, event };
                framed
                    .send(serde_json::to_string(&push).expect("response serializes"))
                    .await
                    .map_err(codec_err)?;
            }
        }
    }

    Ok(())
}

async fn dispatch(
    ctx: &WireContext,
    request: Request,
    event_tx: &mpsc::UnboundedSender<(Ulid, Event)>,
    subs: &mut Subscriptions,
) -> Response {
    let engine = &ctx.engine;
    match request {
        // Re-auth on an authed connection is harmless.
        Request::Auth { token } => {
            if token == ctx.token {
                Response::Ok
            } else {
                Response::Error {
                    code: "unauthorized".into(),
                    message: "bad token".into(),
                }
            }
        }

        Request::UpsertCoach { coach_id, active } => {
            ctx.directory.upsert_coach(coach_id, active);
            Response::Ok
        }
        Request::UpsertLocation { location_id, name, time_zone } => {
            ctx.directory.upsert_location(LocationInfo {
                id: location_id,
                name,
                time_zone,
            });
            Response::Ok
        }

        Request::CreateClass {
            location_id,
            coach_id,
            name,
            description,
            class_type,
            room,
            start,
            end,
            capacity,
        } => {
            // The engine trusts ids; the admin surface checks them first.
            match ctx.directory.coach_active(coach_id).await {
                Some(true) => {}
                Some(false) => {
                    return Response::Error {
                        code: "coach_inactive".into(),
                        message: format!("coach {coach_id} is not active"),
                    }
                }
                None => {
                    return Response::Error {
                        code: "coach_not_found".into(),
                        message: format!("unknown coach {coach_id}"),
                    }
                }
            }
            if ctx.directory.location(location_id).await.is_none() {
                return Response::Error {
                    code: "location_not_found".into(),
                    message: format!("unknown location {location_id}"),
                };
            }
            if start >= end {
                return Response::Error {
                    code: "validation".into(),
                    message: "start must be before end".into(),
                };
            }
            let command = CreateClassCommand {
                location_id,
                coach_id,
                name,
                description,
                class_type,
                room,
                span: Span::new(start, end),
                capacity,
            };
            match engine.create_class(command).await {
                Ok(detail) => Response::Class { detail },
                Err(e) => Response::error(&e),
            }
        }

        Request::UpdateClass {
            class_id,
            name,
            description,
            class_type,
            coach_id,
            room,
            start,
            end,
            capacity,
        } => {
            let command = UpdateClassCommand {
                name,
                description,
                class_type,
                coach_id,
                room,
                start_time: start,
                end_time: end,
                capacity,
            };
            let result = with_retries(COMMIT_RETRY_ATTEMPTS, || {
                engine.update_class(class_id, command.clone())
            })
            .await;
            match result {
                Ok(detail) => Response::Class { detail },
                Err(e) => Response::error(&e),
            }
        }

        Request::CancelClass { class_id } => {
            let result =
                with_retries(COMMIT_RETRY_ATTEMPTS, || engine.cancel_class(class_id)).await;
            match result {
                Ok(outcome) => Response::ClassCancelled {
                    affected_user_ids: outcome.affected_user_ids,
                    waitlist_user_ids: outcome.waitlist_user_ids,
                },
                Err(e) => Response::error(&e),
            }
        }

        Request::Book { class_id, user_id } => {
            let result =
                with_retries(COMMIT_RETRY_ATTEMPTS, || engine.book_class(class_id, user_id)).await;
            match result {
                Ok(BookOutcome::Booked { booking_id }) => Response::Booked { booking_id },
                Ok(BookOutcome::Waitlisted { entry_id, position }) => {
                    Response::Waitlisted { entry_id, position }
                }
                Err(e) => Response::error(&e),
            }
        }

        Request::CancelBooking { class_id, user_id } => {
            let result = with_retries(COMMIT_RETRY_ATTEMPTS, || {
                engine.cancel_booking(class_id, user_id)
            })
            .await;
            match result {
                Ok(outcome) => Response::BookingCancelled {
                    booking_id: outcome.booking_id,
                    promoted_user_id: outcome.promoted_user_id,
                },
                Err(e) => Response::error(&e),
            }
        }

        Request::LeaveWaitlist { class_id, user_id } => {
            let result = with_retries(COMMIT_RETRY_ATTEMPTS, || {
                engine.remove_from_waitlist(class_id, user_id)
            })
            .await;
            match result {
                Ok(()) => Response::Ok,
                Err(e) => Response::error(&e),
            }
        }

        Request::GetClass { class_id } => match engine.get_class(class_id).await {
            Ok(detail) => Response::Class { detail },
            Err(e) => Response::error(&e),
        },

        Request::UpcomingClasses { location_id } => Response::Classes {
            classes: engine.upcoming_classes_by_location(location_id).await,
        },

        Request::CoachSchedule { coach_id, start, end } => {
            match engine.classes_by_coach_in_range(coach_id, start, end).await {
                Ok(classes) => Response::Classes { classes },
                Err(e) => Response::error(&e),
            }
        }

        Request::SearchClasses {
            date,
            class_type,
            coach_id,
            location_id,
            available,
            offset,
            limit,
        } => Response::ClassPage {
            classes: engine
                .search_classes(ClassSearchFilter {
                    date,
                    class_type,
                    coach_id,
                    location_id,
                    available,
                    offset,
                    limit,
                })
                .await,
        },

        Request::Utilization { start, end } => {
            match engine.utilization_by_date_range(start, end).await {
                Ok(classes) => Response::Utilization { classes },
                Err(e) => Response::error(&e),
            }
        }

        Request::CancellationCount { start, end, location_id } => {
            match engine.count_cancellations_between(start, end, location_id).await {
                Ok(count) => Response::Count { count },
                Err(e) => Response::error(&e),
            }
        }

        Request::UserWaitlist { user_id } => Response::WaitlistEntries {
            entries: engine.user_waitlist_entries(user_id).await,
        },

        Request::SetRule { key, value } => match ctx.rules.apply_update(&key, value) {
            Ok(rules) => Response::Rules { rules },
            Err(e) => Response::error(&e),
        },
        Request::GetRules => Response::Rules {
            rules: ctx.rules.current(),
        },

        Request::Listen { class_id } => {
            // Duplicate LISTEN is idempotent.
            if !subs.per_class.contains_key(&class_id) {
                let mut rx = ctx.engine.notify.subscribe_class(class_id);
                let tx = event_tx.clone();
                let handle = tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(event) => {
                                if tx.send((class_id, event)).is_err() {
                                    break;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                debug!("listener lagged, dropped {n} events for {class_id}");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
                subs.per_class.insert(class_id, handle);
            }
            Response::Ok
        }

        Request::ListenAll => {
            if subs.firehose.is_none() {
                let mut rx = ctx.engine.notify.subscribe_all();
                let tx = event_tx.clone();
                subs.firehose = Some(tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(event) => {
                                let class_id = event.class_id();
                                if tx.send((class_id, event)).is_err() {
                                    break;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                debug!("firehose listener lagged, dropped {n} events");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }));
            }
            Response::Ok
        }

        Request::Unlisten { class_id } => {
            if let Some(handle) = subs.per_class.remove(&class_id) {
                handle.abort();
            }
            Response::Ok
        }

        Request::UnlistenAll => {
            subs.abort_all();
            Response::Ok
        }
    }
}
