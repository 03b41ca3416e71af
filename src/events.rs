//! Completion signals for enqueued commands, and tagged wait-groups over them.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::Status;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EventState {
    Queued,
    Complete,
    Failed(Status),
}

#[derive(Debug)]
struct EventInner {
    state: Mutex<EventState>,
    cv: Condvar,
}

/// Signals completion of one enqueued command. Cheap to clone; all clones observe the same signal.
#[derive(Clone, Debug)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    fn with_state(state: EventState) -> Self {
        Self {
            inner: Arc::new(EventInner {
                state: Mutex::new(state),
                cv: Condvar::new(),
            }),
        }
    }

    /// A signal that a queue worker will set later.
    pub(crate) fn queued() -> Self {
        Self::with_state(EventState::Queued)
    }

    /// For commands that completed before the call returned.
    pub fn complete() -> Self {
        Self::with_state(EventState::Complete)
    }

    pub(crate) fn failed(status: Status) -> Self {
        Self::with_state(EventState::Failed(status))
    }

    /// Called by the executing queue, once.
    pub(crate) fn signal(&self, status: Status) {
        let mut state = self.inner.state.lock();
        *state = if status.is_success() {
            EventState::Complete
        } else {
            EventState::Failed(status)
        };
        self.inner.cv.notify_all();
    }

    /// Block until the command finished; returns its status.
    pub fn wait(&self) -> Status {
        let mut state = self.inner.state.lock();
        while *state == EventState::Queued {
            self.inner.cv.wait(&mut state);
        }
        match *state {
            EventState::Failed(status) => status,
            _ => Status::SUCCESS,
        }
    }

    /// `None` while the command is still pending.
    pub fn status(&self) -> Option<Status> {
        match *self.inner.state.lock() {
            EventState::Queued => None,
            EventState::Complete => Some(Status::SUCCESS),
            EventState::Failed(status) => Some(status),
        }
    }
}

/// The phases of a step that the host synchronizes on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Initial position and velocity uploads.
    Upload,
    /// Per-device force fragment reads.
    Fragments,
    /// Full force vector writes back to every device.
    Broadcast,
    /// Energy scratch and position reads consumed by the next printed frame.
    Output,
}

/// Enqueue-and-tag, then wait on a set of tags. One wait covers every device's signal for a tag.
#[derive(Debug, Default)]
pub struct WaitGroup {
    pending: Vec<(Tag, Event)>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(&mut self, tag: Tag, event: Event) {
        self.pending.push((tag, event));
    }

    /// Number of signals currently tagged `tag`.
    pub fn pending(&self, tag: Tag) -> usize {
        self.pending.iter().filter(|(t, _)| *t == tag).count()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Block until every signal tagged with one of `tags` completes, and drop them from the group.
    /// Statuses are accumulated; every signal is waited on even after a failure.
    pub fn wait(&mut self, tags: &[Tag]) -> Status {
        let mut status = Status::SUCCESS;

        let (waiting, rest): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|(t, _)| tags.contains(t));
        self.pending = rest;

        for (_, event) in &waiting {
            status |= event.wait();
        }
        status
    }
}
