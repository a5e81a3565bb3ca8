// Anti-entropy session state — binary search toward the divergence point
//
// A replica that hears a head announcement differing from its own runs
// one outbound session at a time:
//
//   Idle -> Probing(min, max) -> Transferring -> Idle
//
// Each probe asks the remote for its hash-chain value at the midpoint;
// matching hashes move the search up, differing hashes move it down.
// When a single index remains, the replica ships its entries from that
// index and waits for the remote's tail in return. Inbound probes from
// other replicas are answered statelessly and never touch this state.

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Probing {
        target: Uuid,
        request_id: Uuid,
        min: usize,
        max: usize,
    },
    Transferring {
        target: Uuid,
    },
}

/// Next action the session asks its owner to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStep {
    /// Ask the remote for its hash at this index
    Probe { index: usize },
    /// The chains diverge at this index; transfer entries from it
    Diverged { index: usize },
}

pub struct SyncSession {
    phase: SyncPhase,
    last_activity: u64,
    timeout_ms: u64,
}

impl SyncSession {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            phase: SyncPhase::Idle,
            last_activity: 0,
            timeout_ms,
        }
    }

    pub fn phase(&self) -> &SyncPhase {
        &self.phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase == SyncPhase::Idle
    }

    pub fn target(&self) -> Option<Uuid> {
        match &self.phase {
            SyncPhase::Idle => None,
            SyncPhase::Probing { target, .. } | SyncPhase::Transferring { target } => Some(*target),
        }
    }

    /// Open a session against `target`. `upper` bounds the divergence
    /// search: the smaller of the two entry counts. Returns the request
    /// id and the first step; an empty search range means the logs
    /// diverge at `upper` and the session goes straight to transfer.
    pub fn begin(&mut self, target: Uuid, upper: usize, now: u64) -> (Uuid, ProbeStep) {
        let request_id = Uuid::new_v4();
        self.last_activity = now;
        if upper == 0 {
            self.phase = SyncPhase::Transferring { target };
            (request_id, ProbeStep::Diverged { index: 0 })
        } else {
            self.phase = SyncPhase::Probing {
                target,
                request_id,
                min: 0,
                max: upper,
            };
            (request_id, ProbeStep::Probe { index: upper / 2 })
        }
    }

    /// Whether an inbound hash reply belongs to this session's current probe.
    pub fn accepts_reply(&self, request_id: &Uuid, responder: &Uuid, index: usize) -> bool {
        match &self.phase {
            SyncPhase::Probing {
                target,
                request_id: own,
                min,
                max,
            } => own == request_id && target == responder && index == (min + max) / 2,
            _ => false,
        }
    }

    /// Narrow the search with the outcome of the last probe.
    pub fn advance(&mut self, matched: bool, now: u64) -> Option<ProbeStep> {
        let SyncPhase::Probing {
            target,
            request_id,
            min,
            max,
        } = self.phase
        else {
            return None;
        };
        self.last_activity = now;

        let index = (min + max) / 2;
        let (min, max) = if matched {
            (index + 1, max)
        } else {
            (min, index)
        };

        if min < max {
            self.phase = SyncPhase::Probing {
                target,
                request_id,
                min,
                max,
            };
            Some(ProbeStep::Probe {
                index: (min + max) / 2,
            })
        } else {
            self.phase = SyncPhase::Transferring { target };
            Some(ProbeStep::Diverged { index: min })
        }
    }

    /// The session finished (tail received) or is being abandoned.
    pub fn complete(&mut self) {
        self.phase = SyncPhase::Idle;
    }

    pub fn expired(&self, now: u64) -> bool {
        !self.is_idle() && now.saturating_sub(self.last_activity) >= self.timeout_ms
    }
}
