#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! Event bus for the Stowage transfer subsystem.
//!
//! The bus carries a typed event enum with sequential identifiers and replays
//! recent events to subscribers that reconnect with the last id they saw.
//! Internally it uses `tokio::broadcast` with a bounded buffer; when the
//! channel overflows the oldest events are dropped.

use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::{Receiver, Sender};
use uuid::Uuid;

/// Identifier assigned to each event emitted by the platform.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Lifecycle states of a server-side download job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted locally, not yet confirmed by the daemon.
    Queued,
    /// The daemon accepted the fetch and is working on it.
    Active,
    /// The daemon holds the fetch but is not transferring.
    Paused,
    /// Payload imported into the file store.
    Complete,
    /// Fetch ended without a payload; see the job's error detail.
    Failed,
    /// Persisted as running, but the daemon no longer knows the job.
    Orphaned,
}

impl JobState {
    /// Every state, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Queued,
        Self::Active,
        Self::Paused,
        Self::Complete,
        Self::Failed,
        Self::Orphaned,
    ];

    /// Terminal states never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// States the poll pass queries the daemon for.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }

    /// Whether `self -> next` is an edge of the job state machine.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Active | Self::Failed)
                | (Self::Active, Self::Paused)
                | (Self::Paused, Self::Active)
                | (
                    Self::Active | Self::Paused,
                    Self::Complete | Self::Failed | Self::Orphaned
                )
                | (Self::Orphaned, Self::Complete | Self::Failed)
        )
    }

    /// Stable lowercase label used in storage and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Orphaned => "orphaned",
        }
    }

    /// Parse a label produced by [`JobState::as_str`].
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == label)
    }
}

impl Display for JobState {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Typed domain events surfaced across the system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A server fetch was accepted into the registry.
    JobQueued {
        /// Registry identifier of the job.
        job_id: Uuid,
        /// Owner that requested the fetch.
        owner_id: String,
        /// Destination inside the owner's store.
        destination_path: String,
    },
    /// A job moved between non-terminal states.
    JobStateChanged {
        /// Registry identifier of the job.
        job_id: Uuid,
        /// New state.
        state: JobState,
    },
    /// A job's payload landed in the file store.
    JobCompleted {
        /// Registry identifier of the job.
        job_id: Uuid,
        /// Owner of the imported file.
        owner_id: String,
        /// Destination inside the owner's store.
        destination_path: String,
    },
    /// A job reached the failed state.
    JobFailed {
        /// Registry identifier of the job.
        job_id: Uuid,
        /// Failure detail recorded on the job.
        reason: String,
    },
    /// A direct upload finished, successfully or not.
    UploadFinished {
        /// Owner of the upload.
        owner_id: String,
        /// Store path the upload targeted.
        path: String,
        /// Whether the file was committed.
        success: bool,
        /// Whether the source was cut short.
        limit_reached: bool,
    },
    /// Component health changed; an empty list means fully healthy.
    HealthChanged {
        /// Components currently degraded.
        degraded: Vec<String>,
    },
}

impl Event {
    /// Machine-friendly discriminator for stream consumers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::JobQueued { .. } => "job_queued",
            Self::JobStateChanged { .. } => "job_state_changed",
            Self::JobCompleted { .. } => "job_completed",
            Self::JobFailed { .. } => "job_failed",
            Self::UploadFinished { .. } => "upload_finished",
            Self::HealthChanged { .. } => "health_changed",
        }
    }

    /// Job identifier carried by the event, if any.
    #[must_use]
    pub const fn job_id(&self) -> Option<Uuid> {
        match self {
            Self::JobQueued { job_id, .. }
            | Self::JobStateChanged { job_id, .. }
            | Self::JobCompleted { job_id, .. }
            | Self::JobFailed { job_id, .. } => Some(*job_id),
            Self::UploadFinished { .. } | Self::HealthChanged { .. } => None,
        }
    }
}

/// Metadata wrapper around events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Sequential identifier.
    pub id: EventId,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
    /// Event payload.
    pub event: Event,
}

/// Shared event bus built on top of `tokio::broadcast`.
///
/// Identifiers are assigned, buffered and broadcast under one lock, so every
/// subscriber observes them in increasing order without gaps.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    replay: Arc<Mutex<Replay>>,
    replay_capacity: usize,
}

struct Replay {
    events: VecDeque<EventEnvelope>,
    next_id: EventId,
}

impl EventBus {
    /// Construct a new bus with the provided broadcast capacity.
    ///
    /// A zero capacity is bumped to one.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            replay: Arc::new(Mutex::new(Replay {
                events: VecDeque::with_capacity(capacity),
                next_id: 1,
            })),
            replay_capacity: capacity,
        }
    }

    /// Construct a bus with the default in-memory buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish a new event, assigning it a sequential identifier.
    pub fn publish(&self, event: Event) -> EventId {
        let mut replay = self.lock_replay();
        let id = replay.next_id;
        replay.next_id += 1;
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };
        if replay.events.len() == self.replay_capacity {
            replay.events.pop_front();
        }
        replay.events.push_back(envelope.clone());

        // No subscribers is not an error.
        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe to the bus, replaying any buffered events newer than `since_id`.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let replay = self.lock_replay();
        let receiver = self.sender.subscribe();
        let backlog = since_id.map_or_else(VecDeque::new, |since| {
            replay
                .events
                .iter()
                .filter(|item| item.id > since)
                .cloned()
                .collect()
        });
        drop(replay);
        EventStream {
            backlog,
            receiver,
            last_seen: since_id,
        }
    }

    /// Returns the last assigned identifier, if any events have been published.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        self.lock_replay().events.back().map(|event| event.id)
    }

    fn lock_replay(&self) -> MutexGuard<'_, Replay> {
        self.replay.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream wrapper that yields events from the replay backlog, then from the
/// live broadcast channel.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
    last_seen: Option<EventId>,
}

impl EventStream {
    /// Receive the next event, respecting the replay backlog first.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            self.last_seen = Some(event.id);
            return Some(event);
        }

        loop {
            match self.receiver.recv().await {
                // Events already replayed from the backlog can arrive again live.
                Ok(event) if self.last_seen.is_some_and(|seen| event.id <= seen) => {}
                Ok(event) => {
                    self.last_seen = Some(event.id);
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
