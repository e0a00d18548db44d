use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use merger_types::{SourceId, Timestamp};
use tracing::{debug, trace};

use crate::liveness::{LivenessTracker, SourceState, Transition};

/// What a depositing reader learns when it is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// This source held the round's minimum timestamp and must forward.
    Won,
    /// Another source won. Keep the record and deposit it again.
    Lost,
    /// The round closed without this source's deposit counting; re-evaluate.
    NoWinner,
    /// The merge was aborted; exit.
    Aborted,
}

/// Bookkeeping of one merge cycle.
///
/// A round opens on the first deposit after the previous one closed. Its
/// members are the sources ACTIVE at that moment; a source that leaves
/// ACTIVE stops being a member, and a source that becomes ACTIVE while the
/// round is open joins the next one. The round closes once every member
/// that is still ACTIVE has deposited.
#[derive(Clone, Debug)]
pub struct RendezvousRound {
    open: bool,
    members: Vec<bool>,
    deposits: Vec<Option<Timestamp>>,
    arrived: usize,
    leader: Option<(Timestamp, SourceId)>,
}

impl RendezvousRound {
    pub fn new(sources: usize) -> Self {
        Self {
            open: false,
            members: vec![false; sources],
            deposits: vec![None; sources],
            arrived: 0,
            leader: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_member(&self, source: SourceId) -> bool {
        self.members.get(source.index()).copied().unwrap_or(false)
    }

    /// Members that are still ACTIVE: the number of deposits needed to close.
    pub fn active_count(&self, liveness: &LivenessTracker) -> usize {
        SourceId::range(self.members.len())
            .filter(|id| self.is_member(*id) && liveness.is_active(*id))
            .count()
    }

    pub fn arrived_count(&self) -> usize {
        self.arrived
    }

    pub fn min_timestamp(&self) -> Option<Timestamp> {
        self.leader.map(|(ts, _)| ts)
    }

    /// The source currently holding the minimum; the winner if the round
    /// closed now.
    pub fn leader(&self) -> Option<SourceId> {
        self.leader.map(|(_, id)| id)
    }

    fn open(&mut self, liveness: &LivenessTracker) {
        for (slot, id) in self.members.iter_mut().zip(SourceId::range(liveness.len())) {
            *slot = liveness.is_active(id);
        }
        self.open = true;
    }

    fn deposit(&mut self, source: SourceId, timestamp: Timestamp) {
        self.deposits[source.index()] = Some(timestamp);
        self.arrived += 1;
        // Tuple ordering breaks timestamp ties by the lower source id.
        let candidate = (timestamp, source);
        if self.leader.map_or(true, |leader| candidate < leader) {
            self.leader = Some(candidate);
        }
    }

    /// Drop a source from the round. Returns `true` if it had deposited.
    fn withdraw(&mut self, source: SourceId) -> bool {
        let index = source.index();
        if index >= self.members.len() {
            return false;
        }
        self.members[index] = false;
        if self.deposits[index].take().is_none() {
            return false;
        }
        self.arrived -= 1;
        self.leader = SourceId::range(self.deposits.len())
            .filter_map(|id| self.deposits[id.index()].map(|ts| (ts, id)))
            .min();
        true
    }

    fn depositors(&self) -> impl Iterator<Item = SourceId> + '_ {
        SourceId::range(self.deposits.len()).filter(|id| self.deposits[id.index()].is_some())
    }

    fn is_complete(&self, liveness: &LivenessTracker) -> bool {
        self.open && self.arrived >= self.active_count(liveness)
    }

    fn reset(&mut self) {
        self.open = false;
        self.members.iter_mut().for_each(|m| *m = false);
        self.deposits.iter_mut().for_each(|d| *d = None);
        self.arrived = 0;
        self.leader = None;
    }
}

/// Point-in-time view of the round in progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundStatus {
    pub open: bool,
    pub active_count: usize,
    pub arrived_count: usize,
    pub min_timestamp: Option<Timestamp>,
    pub leader: Option<SourceId>,
}

/// Result of reporting a liveness change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LivenessUpdate {
    /// The applied transition, `None` if the state did not change.
    pub transition: Option<Transition>,
    /// Sources ACTIVE after the change.
    pub active: usize,
    /// Every source has ENDED.
    pub all_ended: bool,
}

struct Shared {
    liveness: LivenessTracker,
    round: RendezvousRound,
    /// Verdict per depositing source, set when its round closes.
    verdicts: Vec<Option<Verdict>>,
    rounds_closed: u64,
    aborted: bool,
}

impl Shared {
    /// Close the round if every ACTIVE member has deposited.
    fn try_close(&mut self) -> bool {
        if !self.round.is_complete(&self.liveness) {
            return false;
        }
        let winner = self.round.leader();
        for id in self.round.depositors() {
            self.verdicts[id.index()] = Some(if Some(id) == winner {
                Verdict::Won
            } else {
                Verdict::Lost
            });
        }
        self.rounds_closed += 1;
        debug!(
            round = self.rounds_closed,
            winner = ?winner,
            min_timestamp = ?self.round.min_timestamp(),
            arrived = self.round.arrived_count(),
            "round closed"
        );
        self.round.reset();
        true
    }
}

/// Shared synchronization point of all source readers.
///
/// Liveness state and round bookkeeping sit behind one mutex; every change
/// to either is broadcast on one condition variable. Readers hold the lock
/// only for the deposit/compare/release critical section, never while
/// fetching or sending.
pub struct RendezvousCoordinator {
    shared: Mutex<Shared>,
    changed: Condvar,
}

impl RendezvousCoordinator {
    /// Create a coordinator for `sources` sources, all ACTIVE.
    pub fn new(sources: usize) -> Self {
        Self {
            shared: Mutex::new(Shared {
                liveness: LivenessTracker::new(sources),
                round: RendezvousRound::new(sources),
                verdicts: vec![None; sources],
                rounds_closed: 0,
                aborted: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().expect("rendezvous lock poisoned")
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Shared>) -> MutexGuard<'a, Shared> {
        self.changed.wait(guard).expect("rendezvous lock poisoned")
    }

    /// Deposit the timestamp of the record `source` holds and block until
    /// the round it joined closes.
    ///
    /// If a round is already open without `source` as a member, the call
    /// first waits for that round to close and then joins the next one.
    pub fn deposit(&self, source: SourceId, timestamp: Timestamp) -> Verdict {
        let mut guard = self.lock();
        loop {
            if guard.aborted {
                return Verdict::Aborted;
            }
            if !guard.liveness.is_active(source) {
                return Verdict::NoWinner;
            }
            if !guard.round.is_open() || guard.round.is_member(source) {
                break;
            }
            trace!(source = %source, "waiting for the round in progress to close");
            guard = self.wait(guard);
        }

        let shared = &mut *guard;
        if !shared.round.is_open() {
            shared.round.open(&shared.liveness);
        }
        shared.verdicts[source.index()] = None;
        shared.round.deposit(source, timestamp);
        trace!(
            source = %source,
            timestamp = %timestamp,
            arrived = shared.round.arrived_count(),
            active = shared.round.active_count(&shared.liveness),
            "deposited"
        );
        if shared.try_close() {
            self.changed.notify_all();
        }

        loop {
            if let Some(verdict) = guard.verdicts[source.index()].take() {
                return verdict;
            }
            if guard.aborted {
                return Verdict::Aborted;
            }
            guard = self.wait(guard);
        }
    }

    /// Record a liveness change for `source` and re-evaluate the open round.
    pub fn report(&self, source: SourceId, to: SourceState) -> LivenessUpdate {
        let mut guard = self.lock();
        let shared = &mut *guard;
        let transition = shared.liveness.transition(source, to);
        if let Some(transition) = transition {
            debug!(
                source = %source,
                from = %transition.from,
                to = %transition.to,
                active = shared.liveness.active_count(),
                "liveness changed"
            );
            if to != SourceState::Active && shared.round.withdraw(source) {
                shared.verdicts[source.index()] = Some(Verdict::NoWinner);
            }
            shared.try_close();
            self.changed.notify_all();
        }
        LivenessUpdate {
            transition,
            active: shared.liveness.active_count(),
            all_ended: shared.liveness.all_ended(),
        }
    }

    /// Release every waiter with [`Verdict::Aborted`]. Irreversible.
    pub fn abort(&self) {
        let mut guard = self.lock();
        guard.aborted = true;
        self.changed.notify_all();
    }

    /// Wake every thread blocked in the coordinator so it re-checks its
    /// exit conditions.
    pub fn wake_all(&self) {
        let _guard = self.lock();
        self.changed.notify_all();
    }

    /// Sleep up to `timeout`, returning early on abort or once
    /// `interrupted` reports true after a wake-up.
    pub fn pause<F>(&self, timeout: Duration, interrupted: F)
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        loop {
            if guard.aborted || interrupted() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let (next, _) = self
                .changed
                .wait_timeout(guard, deadline - now)
                .expect("rendezvous lock poisoned");
            guard = next;
        }
    }

    pub fn state(&self, source: SourceId) -> SourceState {
        self.lock().liveness.state(source)
    }

    pub fn states(&self) -> Vec<SourceState> {
        self.lock().liveness.snapshot()
    }

    pub fn active_count(&self) -> usize {
        self.lock().liveness.active_count()
    }

    pub fn rounds_closed(&self) -> u64 {
        self.lock().rounds_closed
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    pub fn round_status(&self) -> RoundStatus {
        let guard = self.lock();
        RoundStatus {
            open: guard.round.is_open(),
            active_count: guard.round.active_count(&guard.liveness),
            arrived_count: guard.round.arrived_count(),
            min_timestamp: guard.round.min_timestamp(),
            leader: guard.round.leader(),
        }
    }
}
