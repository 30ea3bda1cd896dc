use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{Condvar, Mutex, MutexGuard, PoisonError, mpsc},
    time::Duration,
};

use crate::{configuration::Configuration, error::Error};

pub type SaveOutcome = Result<PathBuf, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestSource {
    Ui,
    Signal,
    Session,
}

pub enum Action {
    Start,
    Stop,
    Restart,
    SaveConfig {
        waiters: Vec<mpsc::Sender<SaveOutcome>>,
    },
    UpdateConfig(Box<Configuration>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Start,
    Stop,
    Restart,
    SaveConfig,
    UpdateConfig,
    Shutdown,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Start => ActionKind::Start,
            Self::Stop => ActionKind::Stop,
            Self::Restart => ActionKind::Restart,
            Self::SaveConfig { .. } => ActionKind::SaveConfig,
            Self::UpdateConfig(_) => ActionKind::UpdateConfig,
            Self::Shutdown => ActionKind::Shutdown,
        }
    }
}

pub struct ControlRequest {
    pub action: Action,
    pub source: RequestSource,
}

impl ControlRequest {
    pub fn new(action: Action, source: RequestSource) -> Self {
        Self { action, source }
    }

    fn kind(&self) -> ActionKind {
        self.action.kind()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued,
    /// Folded into an equivalent request that is already waiting.
    Coalesced,
    /// The manager is shutting down and accepts nothing new.
    Closed,
}

struct QueueState {
    pending: VecDeque<ControlRequest>,
    closed: bool,
}

/// Producer side is callable from any thread; only the control thread pops.
pub struct RequestQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, request: ControlRequest) -> Submission {
        let mut state = self.lock();
        if state.closed {
            log::debug!(
                "[queue] rejecting {:?} from {:?}: shutting down",
                request.kind(),
                request.source
            );
            return Submission::Closed;
        }

        let submission = match request.kind() {
            ActionKind::Shutdown => {
                if !state.pending.is_empty() {
                    log::info!(
                        "[queue] shutdown discards {} pending requests",
                        state.pending.len()
                    );
                }
                state.pending.clear();
                state.closed = true;
                state.pending.push_back(request);
                Submission::Queued
            }
            ActionKind::Stop => {
                let before = state.pending.len();
                state
                    .pending
                    .retain(|pending| !matches!(pending.kind(), ActionKind::Start | ActionKind::Restart));
                let discarded = before - state.pending.len();
                if discarded > 0 {
                    log::info!("[queue] stop supersedes {discarded} pending start/restart requests");
                }
                if state.pending.iter().any(|pending| pending.kind() == ActionKind::Stop) {
                    Submission::Coalesced
                } else {
                    state.pending.push_back(request);
                    Submission::Queued
                }
            }
            ActionKind::Restart => {
                if state.pending.iter().any(|pending| pending.kind() == ActionKind::Restart) {
                    Submission::Coalesced
                } else {
                    state.pending.push_back(request);
                    Submission::Queued
                }
            }
            ActionKind::Start => {
                if state
                    .pending
                    .iter()
                    .any(|pending| matches!(pending.kind(), ActionKind::Start | ActionKind::Restart))
                {
                    Submission::Coalesced
                } else {
                    state.pending.push_back(request);
                    Submission::Queued
                }
            }
            ActionKind::SaveConfig => {
                let existing = state
                    .pending
                    .iter_mut()
                    .find_map(|pending| match &mut pending.action {
                        Action::SaveConfig { waiters } => Some(waiters),
                        _ => None,
                    });
                match existing {
                    Some(existing) => {
                        if let Action::SaveConfig { waiters } = request.action {
                            existing.extend(waiters);
                        }
                        Submission::Coalesced
                    }
                    None => {
                        state.pending.push_back(request);
                        Submission::Queued
                    }
                }
            }
            ActionKind::UpdateConfig => {
                let existing = state
                    .pending
                    .iter_mut()
                    .find(|pending| pending.kind() == ActionKind::UpdateConfig);
                match existing {
                    Some(existing) => {
                        *existing = request;
                        Submission::Coalesced
                    }
                    None => {
                        state.pending.push_back(request);
                        Submission::Queued
                    }
                }
            }
        };

        drop(state);
        self.available.notify_one();
        submission
    }

    /// Waits for the next request; `None` timeout waits indefinitely.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<ControlRequest> {
        let state = self.lock();
        let mut state = match timeout {
            Some(timeout) => {
                self.available
                    .wait_timeout_while(state, timeout, |state| state.pending.is_empty())
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .available
                .wait_while(state, |state| state.pending.is_empty())
                .unwrap_or_else(PoisonError::into_inner),
        };
        state.pending.pop_front()
    }

    #[cfg(test)]
    fn pending_kinds(&self) -> Vec<ActionKind> {
        self.lock().pending.iter().map(ControlRequest::kind).collect()
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}
