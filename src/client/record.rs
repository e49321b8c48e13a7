//! Virtual client record

use std::fmt;

use crate::timer::TimerId;

/// Lifecycle state of a virtual client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClientState {
    #[default]
    Init,
    /// Fetching (or sleeping between) URLs
    Urls,
    /// Last fetch failed or timed out; terminal unless recovered
    Error,
    FinishedOk,
}

impl ClientState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ClientState::Error | ClientState::FinishedOk)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClientState::Init => "init",
            ClientState::Urls => "urls",
            ClientState::Error => "error",
            ClientState::FinishedOk => "finished",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One virtual client. Records are allocated with the batch and reused
/// across cycles; only their fields change.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Index inside the owning batch
    pub index: usize,
    pub batch_id: usize,
    pub state: ClientState,
    /// URL being fetched, or selected and waiting out a sleep
    pub url_index: Option<usize>,
    pub prev_state: ClientState,
    pub prev_url: Option<usize>,
    /// Completed passes through the cycling range
    pub cycle_num: u64,
    pub cycling_done: bool,
    pub sleep_timer: Option<TimerId>,
    pub completion_timer: Option<TimerId>,
    /// Cached once-mode fetch decisions, per URL
    pub fetch_decisions: Option<Vec<Option<bool>>>,
    /// Batch clock at `begin_fetch`; `Some` while a fetch is in flight
    pub fetch_started_at: Option<u64>,
}

impl ClientRecord {
    pub fn new(index: usize, batch_id: usize) -> Self {
        Self {
            index,
            batch_id,
            state: ClientState::Init,
            url_index: None,
            prev_state: ClientState::Init,
            prev_url: None,
            cycle_num: 0,
            cycling_done: false,
            sleep_timer: None,
            completion_timer: None,
            fetch_decisions: None,
            fetch_started_at: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.fetch_started_at.is_some()
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleep_timer.is_some()
    }

    /// Save the pre-transition state for statistics
    pub fn snapshot(&mut self) {
        self.prev_state = self.state;
        self.prev_url = self.url_index;
    }
}
