//! Backend connector pool: the job scheduler.
//!
//! One task exclusively owns every group's state (helper slots, free
//! list, pending-job queue, delay estimate), so all scheduling
//! decisions (including one-level fallback delegation between groups)
//! are made synchronously with a consistent view. Jobs arrive over an
//! mpsc channel; each carries a oneshot sender for its outcome. Helper
//! connection tasks report up/down/done transitions back through the
//! same channel.
//!
//! Deadlines are enforced opportunistically: an expired queued job is
//! discovered when the queue is next inspected: on new job arrival, a
//! helper transition, or the periodic tick. This bounds cleanup latency
//! by the tick interval rather than paying a timer per job.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use cinder_protocol::Unit;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::RelayError;

/// Buffer of the pool's submission channel.
const POOL_BUFFER: usize = 1024;

/// Outcome delivered on a job's reply channel. Every job resolves to
/// exactly one of these; a failed job is never silently dropped.
#[derive(Debug)]
pub enum JobOutcome {
    /// The backend's reply unit, relayed verbatim to the client.
    Response(Unit),
    Failed(RelayError),
}

/// One unit of backend work, paired 1:1 with a forwarded request.
#[derive(Debug)]
pub struct Job {
    /// Message id, echoed in the backend's correlation header.
    pub id: u64,
    /// Correlation-framed request bytes, ready to write to the helper.
    pub payload: Bytes,
    /// End-to-end deadline.
    pub deadline: Instant,
    pub reply: oneshot::Sender<JobOutcome>,
}

impl Job {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }

    /// Resolves the job with an error. The receiver may already be
    /// gone (client disconnected); that is not an error here.
    pub fn fail(self, err: RelayError) {
        let _ = self.reply.send(JobOutcome::Failed(err));
    }
}

/// Work handed to one helper connection task.
#[derive(Debug)]
pub enum HelperTask {
    Execute(Job),
    /// Reload-configuration control unit, written to the backend and
    /// acknowledged out-of-band of the job queue.
    Reload(Bytes),
}

/// Transitions reported by helper connection tasks.
#[derive(Debug, Clone, Copy)]
pub enum HelperEvent {
    /// The helper's backend connection came up.
    Up { group: usize, helper: usize },
    /// The helper's backend connection was lost.
    Down { group: usize, helper: usize },
    /// The helper finished its current task.
    Done {
        group: usize,
        helper: usize,
        latency_us: u64,
    },
}

/// Static configuration of one connector group.
pub struct GroupConfig {
    pub name: String,
    pub queue_capacity: usize,
    /// Index of the group delegated to when this one has no free
    /// helper. Delegation is one level: the fallback's own fallback is
    /// never consulted.
    pub fallback: Option<usize>,
    /// Task channels of this group's helpers, one per connection.
    pub helpers: Vec<mpsc::Sender<HelperTask>>,
}

/// Point-in-time snapshot of a group, for gauges and state dumps.
#[derive(Debug, Clone)]
pub struct GroupStats {
    pub name: String,
    pub helpers: usize,
    pub busy: usize,
    pub ready: usize,
    pub queued: usize,
    pub expired: u64,
    pub shed: u64,
    pub average_delay_us: u64,
}

/// Messages handled by the pool task.
#[derive(Debug)]
pub enum PoolMsg {
    Submit { group: usize, job: Job },
    /// Reload-configuration control job, broadcast to every group.
    Reload { unit: Bytes },
    Event(HelperEvent),
    Stats { reply: oneshot::Sender<Vec<GroupStats>> },
}

/// Cheap-to-clone handle to the pool task.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::Sender<PoolMsg>,
}

impl PoolHandle {
    /// Submits a job to a group. If the pool task is gone, the job is
    /// failed upstream-unavailable instead of being dropped.
    pub async fn submit(&self, group: usize, job: Job) {
        if let Err(e) = self.tx.send(PoolMsg::Submit { group, job }).await {
            if let PoolMsg::Submit { job, .. } = e.0 {
                job.fail(RelayError::UpstreamUnavailable);
            }
        }
    }

    /// Broadcasts a reload-configuration control unit to all groups.
    pub async fn reload(&self, unit: Bytes) {
        let _ = self.tx.send(PoolMsg::Reload { unit }).await;
    }

    /// Reports a helper transition.
    pub async fn notify(&self, event: HelperEvent) {
        let _ = self.tx.send(PoolMsg::Event(event)).await;
    }

    /// Snapshots every group's counters. `None` if the pool is gone.
    pub async fn stats(&self) -> Option<Vec<GroupStats>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PoolMsg::Stats { reply }).await.ok()?;
        rx.await.ok()
    }
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle").finish_non_exhaustive()
    }
}

/// Spawns the pool task for a set of groups.
///
/// `tick` bounds how stale an expired queued job can get before the
/// periodic flush discovers it.
pub fn spawn_pool(groups: Vec<GroupConfig>, tick: Duration) -> PoolHandle {
    let (tx, rx) = mpsc::channel(POOL_BUFFER);
    let state = PoolState::new(groups);
    tokio::spawn(run_pool(state, rx, tick));
    PoolHandle { tx }
}

async fn run_pool(mut state: PoolState, mut rx: mpsc::Receiver<PoolMsg>, tick: Duration) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                state.handle(msg, Instant::now());
                // drain bursts before re-entering select
                while let Ok(msg) = rx.try_recv() {
                    state.handle(msg, Instant::now());
                }
            }
            _ = ticker.tick() => {
                state.flush_all(Instant::now());
            }
        }
    }

    // every handle dropped: fail whatever is still queued
    state.drain_all(RelayError::UpstreamUnavailable);
}

// ---------------------------------------------------------------------------
// scheduler state machine
// ---------------------------------------------------------------------------

/// Exponentially smoothed response-delay estimate, microseconds.
///
/// The window size self-tunes so the effective update rate stays
/// between roughly 5 and 200,000 samples/sec equivalent: a fast helper
/// pool weights recent latency heavily, a slow one damps swings.
#[derive(Debug, Default)]
struct DelayEstimator {
    average_us: f64,
}

impl DelayEstimator {
    fn record(&mut self, t_us: u64) {
        let t = (t_us.max(1)) as f64;
        if self.average_us == 0.0 {
            self.average_us = t;
        }
        let n = (20e6 / (self.average_us + t)).clamp(5.0, 200_000.0);
        self.average_us = ((n - 1.0) / n) * self.average_us + t / n;
    }

    fn average_us(&self) -> u64 {
        self.average_us as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HelperState {
    Free,
    Busy,
    Down,
}

struct HelperSlot {
    tx: mpsc::Sender<HelperTask>,
    state: HelperState,
    /// A reload broadcast arrived while this helper was busy; deliver
    /// it when the current task completes.
    needs_reload: bool,
}

struct GroupState {
    name: String,
    helpers: Vec<HelperSlot>,
    free: VecDeque<usize>,
    queue: VecDeque<Job>,
    queue_cap: usize,
    /// Healthy (connected) helpers, free or busy.
    ready: usize,
    busy: usize,
    delay: DelayEstimator,
    fallback: Option<usize>,
    /// Last reload unit, pending delivery to busy helpers.
    reload_unit: Option<Bytes>,
    expired: u64,
    shed: u64,
}

impl GroupState {
    fn has_free_helper(&self) -> bool {
        !self.free.is_empty()
    }

    /// Estimated queue wait would push the job past its deadline.
    ///
    /// Only sheds once the backlog exceeds the helper count; a queue
    /// shorter than the pool drains within one round regardless.
    fn would_expire_waiting(&self, job: &Job, now: Instant) -> bool {
        let depth = self.queue.len();
        if depth <= self.helpers.len() || self.helpers.is_empty() {
            return false;
        }
        let wait_us = depth as u64 * self.delay.average_us() / self.helpers.len() as u64;
        job.is_expired(now + Duration::from_micros(wait_us))
    }

    fn stats(&self) -> GroupStats {
        GroupStats {
            name: self.name.clone(),
            helpers: self.helpers.len(),
            busy: self.busy,
            ready: self.ready,
            queued: self.queue.len(),
            expired: self.expired,
            shed: self.shed,
            average_delay_us: self.delay.average_us(),
        }
    }

    #[cfg(debug_assertions)]
    fn check_accounting(&self) {
        let down = self
            .helpers
            .iter()
            .filter(|h| h.state == HelperState::Down)
            .count();
        debug_assert_eq!(self.free.len() + self.busy + down, self.helpers.len());
        debug_assert_eq!(self.ready, self.free.len() + self.busy);
    }

    #[cfg(not(debug_assertions))]
    fn check_accounting(&self) {}
}

struct PoolState {
    groups: Vec<GroupState>,
}

impl PoolState {
    fn new(configs: Vec<GroupConfig>) -> Self {
        let groups = configs
            .into_iter()
            .map(|cfg| GroupState {
                name: cfg.name,
                helpers: cfg
                    .helpers
                    .into_iter()
                    .map(|tx| HelperSlot {
                        tx,
                        // helpers report in once their connection is up
                        state: HelperState::Down,
                        needs_reload: false,
                    })
                    .collect(),
                free: VecDeque::new(),
                queue: VecDeque::new(),
                queue_cap: cfg.queue_capacity,
                ready: 0,
                busy: 0,
                delay: DelayEstimator::default(),
                fallback: cfg.fallback,
                reload_unit: None,
                expired: 0,
                shed: 0,
            })
            .collect();
        Self { groups }
    }

    fn handle(&mut self, msg: PoolMsg, now: Instant) {
        match msg {
            PoolMsg::Submit { group, job } => self.schedule(group, job, now),
            PoolMsg::Reload { unit } => {
                for gi in 0..self.groups.len() {
                    self.broadcast_reload(gi, unit.clone());
                }
            }
            PoolMsg::Event(HelperEvent::Up { group, helper }) => self.helper_up(group, helper, now),
            PoolMsg::Event(HelperEvent::Down { group, helper }) => {
                self.helper_down(group, helper, now)
            }
            PoolMsg::Event(HelperEvent::Done {
                group,
                helper,
                latency_us,
            }) => self.helper_done(group, helper, latency_us, now),
            PoolMsg::Stats { reply } => {
                let _ = reply.send(self.groups.iter().map(GroupState::stats).collect());
            }
        }
        for g in &self.groups {
            g.check_accounting();
        }
    }

    /// Schedules one job onto a group, in precedence order: flush
    /// housekeeping, offline fast-fail, own-deadline fast-fail, idle
    /// helper, fallback delegation, adaptive shedding, enqueue,
    /// saturation fast-fail.
    fn schedule(&mut self, gi: usize, mut job: Job, now: Instant) {
        self.flush(gi, now);

        if self.groups[gi].ready == 0 {
            debug!(group = %self.groups[gi].name, "no available helper, upstream may be offline");
            job.fail(RelayError::UpstreamUnavailable);
            return;
        }
        if job.is_expired(now) {
            self.groups[gi].expired += 1;
            job.fail(RelayError::Timeout);
            return;
        }

        if self.groups[gi].has_free_helper() {
            match self.try_assign(gi, job) {
                Ok(()) => return,
                Err(j) => job = j,
            }
            if self.groups[gi].ready == 0 {
                job.fail(RelayError::UpstreamUnavailable);
                return;
            }
        }

        if let Some(f) = self.groups[gi].fallback {
            if self.groups[f].has_free_helper() {
                match self.try_assign(f, job) {
                    Ok(()) => return,
                    Err(j) => job = j,
                }
            }
        }

        let g = &mut self.groups[gi];
        if g.would_expire_waiting(&job, now) {
            // helper pool is responding slowly; queueing this job would
            // waste a slot on work that cannot finish in time
            debug!(group = %g.name, "response is slow, giving up current job");
            g.shed += 1;
            job.fail(RelayError::ServerBusy);
        } else if g.queue.len() < g.queue_cap {
            g.queue.push_back(job);
        } else {
            warn!(
                group = %g.name,
                count = g.queue.len(),
                max = g.queue_cap,
                "no available helper queue slot"
            );
            g.shed += 1;
            job.fail(RelayError::ServerBusy);
        }
    }

    /// Drains the queue head while a precondition holds: offline or
    /// expired jobs are failed, otherwise jobs are assigned to a free
    /// helper here or on the fallback. Stops when none apply.
    fn flush(&mut self, gi: usize, now: Instant) {
        loop {
            let head_deadline = match self.groups[gi].queue.front() {
                Some(job) => job.deadline,
                None => break,
            };

            if self.groups[gi].ready == 0 {
                let job = self.groups[gi].queue.pop_front().expect("head exists");
                debug!(group = %self.groups[gi].name, "failing queued job: no available helper");
                job.fail(RelayError::UpstreamUnavailable);
                continue;
            }
            if head_deadline <= now {
                let job = self.groups[gi].queue.pop_front().expect("head exists");
                self.groups[gi].expired += 1;
                debug!(group = %self.groups[gi].name, "queued job expired");
                job.fail(RelayError::Timeout);
                continue;
            }
            if self.groups[gi].has_free_helper() {
                let job = self.groups[gi].queue.pop_front().expect("head exists");
                match self.try_assign(gi, job) {
                    Ok(()) => continue,
                    Err(job) => {
                        // helpers died under us; re-evaluate from the top
                        self.groups[gi].queue.push_front(job);
                        continue;
                    }
                }
            }
            let fallback = self.groups[gi].fallback;
            if let Some(f) = fallback {
                if self.groups[f].has_free_helper() {
                    let job = self.groups[gi].queue.pop_front().expect("head exists");
                    match self.try_assign(f, job) {
                        Ok(()) => continue,
                        Err(job) => {
                            self.groups[gi].queue.push_front(job);
                            break;
                        }
                    }
                }
            }
            break;
        }
    }

    fn flush_all(&mut self, now: Instant) {
        for gi in 0..self.groups.len() {
            self.flush(gi, now);
        }
    }

    fn drain_all(&mut self, err: RelayError) {
        for g in &mut self.groups {
            while let Some(job) = g.queue.pop_front() {
                job.fail(err);
            }
        }
    }

    /// Hands a job to a free helper of group `gi`. On a dead helper
    /// task the slot is marked down and the next free helper is tried;
    /// `Err` returns the job when none accepted it.
    fn try_assign(&mut self, gi: usize, mut job: Job) -> Result<(), Job> {
        loop {
            let Some(hi) = self.groups[gi].free.pop_front() else {
                return Err(job);
            };
            debug_assert_eq!(self.groups[gi].helpers[hi].state, HelperState::Free);
            let sent = self.groups[gi].helpers[hi]
                .tx
                .try_send(HelperTask::Execute(job));
            let g = &mut self.groups[gi];
            match sent {
                Ok(()) => {
                    g.helpers[hi].state = HelperState::Busy;
                    g.busy += 1;
                    return Ok(());
                }
                Err(e) => {
                    g.helpers[hi].state = HelperState::Down;
                    g.ready -= 1;
                    warn!(group = %g.name, helper = hi, "helper task unavailable, marking down");
                    match e.into_inner() {
                        HelperTask::Execute(j) => job = j,
                        HelperTask::Reload(_) => unreachable!("assign only sends Execute"),
                    }
                }
            }
        }
    }

    fn helper_up(&mut self, gi: usize, hi: usize, now: Instant) {
        {
            let g = &mut self.groups[gi];
            if g.helpers[hi].state != HelperState::Down {
                return;
            }
            g.helpers[hi].state = HelperState::Free;
            g.free.push_back(hi);
            let was_offline = g.ready == 0;
            g.ready += 1;
            if was_offline {
                info!(group = %g.name, "helper group switching to online mode");
            }
            if g.ready == g.helpers.len() {
                debug!(group = %g.name, "all helpers ready");
            }
        }
        // recovery path: queued jobs must not wait for the next tick
        self.flush(gi, now);
    }

    fn helper_down(&mut self, gi: usize, hi: usize, now: Instant) {
        {
            let g = &mut self.groups[gi];
            match g.helpers[hi].state {
                HelperState::Down => return,
                HelperState::Free => {
                    g.helpers[hi].state = HelperState::Down;
                    if let Some(pos) = g.free.iter().position(|&i| i == hi) {
                        g.free.remove(pos);
                    }
                }
                HelperState::Busy => {
                    g.helpers[hi].state = HelperState::Down;
                    g.busy -= 1;
                }
            }
            g.ready -= 1;
            if g.ready > 0 {
                return;
            }
            error!(group = %g.name, "all helpers invalid, switching to offline mode");
        }
        // fail queued jobs fast rather than letting them wait out
        // their deadlines
        self.flush(gi, now);
    }

    fn helper_done(&mut self, gi: usize, hi: usize, latency_us: u64, now: Instant) {
        {
            let g = &mut self.groups[gi];
            g.delay.record(latency_us);

            if g.helpers[hi].state != HelperState::Busy {
                // Done racing a Down report; the Down already accounted it
                return;
            }

            if g.helpers[hi].needs_reload {
                g.helpers[hi].needs_reload = false;
                if let Some(unit) = g.reload_unit.clone() {
                    if g.helpers[hi].tx.try_send(HelperTask::Reload(unit)).is_ok() {
                        // stays busy executing the deferred reload
                        return;
                    }
                }
            }

            g.helpers[hi].state = HelperState::Free;
            g.free.push_back(hi);
            g.busy -= 1;
        }
        self.flush(gi, now);
    }

    /// Dispatches a reload control unit to every idle helper now and
    /// marks busy helpers to receive it when they free up. Does not
    /// touch the job queue.
    fn broadcast_reload(&mut self, gi: usize, unit: Bytes) {
        self.groups[gi].reload_unit = Some(unit.clone());

        let busy_now: Vec<usize> = self.groups[gi]
            .helpers
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == HelperState::Busy)
            .map(|(i, _)| i)
            .collect();

        let idle: Vec<usize> = self.groups[gi].free.drain(..).collect();
        for hi in idle {
            let sent = self.groups[gi].helpers[hi]
                .tx
                .try_send(HelperTask::Reload(unit.clone()));
            let g = &mut self.groups[gi];
            match sent {
                Ok(()) => {
                    g.helpers[hi].state = HelperState::Busy;
                    g.busy += 1;
                }
                Err(_) => {
                    g.helpers[hi].state = HelperState::Down;
                    g.ready -= 1;
                    warn!(group = %g.name, helper = hi, "helper task unavailable, marking down");
                }
            }
        }

        let g = &mut self.groups[gi];
        for hi in busy_now {
            g.helpers[hi].needs_reload = true;
        }
        info!(group = %g.name, "notified helpers to reload config");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(deadline: Instant) -> (Job, oneshot::Receiver<JobOutcome>) {
        let (reply, rx) = oneshot::channel();
        (
            Job {
                id: 1,
                payload: Bytes::from_static(b"x"),
                deadline,
                reply,
            },
            rx,
        )
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    /// A group with `n` helpers and their task receivers.
    fn pool_with(
        n: usize,
        queue_cap: usize,
        fallback: Option<usize>,
    ) -> (PoolState, Vec<mpsc::Receiver<HelperTask>>) {
        let mut txs = Vec::new();
        let mut rxs = Vec::new();
        for _ in 0..n {
            let (tx, rx) = mpsc::channel(1);
            txs.push(tx);
            rxs.push(rx);
        }
        let state = PoolState::new(vec![GroupConfig {
            name: "primary".into(),
            queue_capacity: queue_cap,
            fallback,
            helpers: txs,
        }]);
        (state, rxs)
    }

    fn bring_up(state: &mut PoolState, gi: usize, n: usize) {
        let now = Instant::now();
        for hi in 0..n {
            state.helper_up(gi, hi, now);
        }
    }

    fn outcome(rx: &mut oneshot::Receiver<JobOutcome>) -> Option<JobOutcome> {
        rx.try_recv().ok()
    }

    fn assert_failed(rx: &mut oneshot::Receiver<JobOutcome>, want: RelayError) {
        match outcome(rx) {
            Some(JobOutcome::Failed(err)) => assert_eq!(err, want),
            other => panic!("expected {want:?}, got {other:?}"),
        }
    }

    #[test]
    fn offline_group_fails_fast() {
        let (mut state, _rxs) = pool_with(2, 4, None);
        let (j, mut rx) = job(far());
        state.schedule(0, j, Instant::now());
        assert_failed(&mut rx, RelayError::UpstreamUnavailable);
    }

    #[test]
    fn expired_job_fails_with_timeout() {
        let (mut state, _rxs) = pool_with(2, 4, None);
        bring_up(&mut state, 0, 2);
        let now = Instant::now();
        let (j, mut rx) = job(now - Duration::from_millis(1));
        state.schedule(0, j, now);
        assert_failed(&mut rx, RelayError::Timeout);
    }

    #[test]
    fn idle_helper_gets_the_job_immediately() {
        let (mut state, mut rxs) = pool_with(1, 4, None);
        bring_up(&mut state, 0, 1);
        let (j, _rx) = job(far());
        state.schedule(0, j, Instant::now());
        assert!(matches!(rxs[0].try_recv(), Ok(HelperTask::Execute(_))));
        assert_eq!(state.groups[0].busy, 1);
        assert!(state.groups[0].free.is_empty());
    }

    #[test]
    fn two_helper_queue_scenario() {
        // 2 helpers, queue capacity 4: six jobs. first two assigned,
        // 3..6 queue in order; freeing one helper assigns job 3 and
        // leaves {4,5,6} queued in original order.
        let (mut state, mut rxs) = pool_with(2, 4, None);
        bring_up(&mut state, 0, 2);
        let now = Instant::now();

        let mut replies = Vec::new();
        let mut ids = Vec::new();
        for i in 0..6u64 {
            let (mut j, rx) = job(far());
            j.id = i + 1;
            ids.push(j.id);
            replies.push(rx);
            state.schedule(0, j, now);
        }

        assert_eq!(state.groups[0].busy, 2);
        assert_eq!(state.groups[0].queue.len(), 4);

        // drain helper 0's channel (it "completed" job 1), then free it
        let first = rxs[0].try_recv().unwrap();
        match first {
            HelperTask::Execute(j) => assert_eq!(j.id, 1),
            other => panic!("unexpected task {other:?}"),
        }
        state.helper_done(0, 0, 500, now);

        // job 3 went to the freed helper
        match rxs[0].try_recv().unwrap() {
            HelperTask::Execute(j) => assert_eq!(j.id, 3),
            other => panic!("unexpected task {other:?}"),
        }
        let queued: Vec<u64> = state.groups[0].queue.iter().map(|j| j.id).collect();
        assert_eq!(queued, vec![4, 5, 6]);
    }

    #[test]
    fn saturated_queue_sheds_without_mutation() {
        let (mut state, _rxs) = pool_with(1, 2, None);
        bring_up(&mut state, 0, 1);
        let now = Instant::now();

        // occupy the helper, then fill the queue
        let (j, _r0) = job(far());
        state.schedule(0, j, now);
        let (j, _r1) = job(far());
        state.schedule(0, j, now);
        let (j, _r2) = job(far());
        state.schedule(0, j, now);
        assert_eq!(state.groups[0].queue.len(), 2);
        let before: Vec<u64> = state.groups[0].queue.iter().map(|j| j.id).collect();

        let (j, mut rx) = job(far());
        state.schedule(0, j, now);
        assert_failed(&mut rx, RelayError::ServerBusy);
        let after: Vec<u64> = state.groups[0].queue.iter().map(|j| j.id).collect();
        assert_eq!(before, after, "shed must not mutate the queue");
    }

    #[test]
    fn adaptive_shedding_rejects_doomed_jobs() {
        let (mut state, _rxs) = pool_with(1, 100, None);
        bring_up(&mut state, 0, 1);
        let now = Instant::now();

        // a slow helper pool: ~1s smoothed delay
        for _ in 0..50 {
            state.groups[0].delay.record(1_000_000);
        }

        // occupy the helper and build a backlog deeper than the pool
        let (j, _r) = job(far());
        state.schedule(0, j, now);
        for _ in 0..3 {
            let (j, _r) = job(far());
            state.schedule(0, j, now);
            std::mem::forget(_r);
        }

        // estimated wait: 3 × ~1s ÷ 1 helper = ~3s > 1s of headroom
        let (j, mut rx) = job(now + Duration::from_secs(1));
        state.schedule(0, j, now);
        assert_failed(&mut rx, RelayError::ServerBusy);
        assert_eq!(state.groups[0].queue.len(), 3);
    }

    #[test]
    fn short_queue_never_sheds_adaptively() {
        // backlog not deeper than the helper pool: always queue
        let (mut state, _rxs) = pool_with(2, 100, None);
        bring_up(&mut state, 0, 2);
        let now = Instant::now();
        for _ in 0..50 {
            state.groups[0].delay.record(1_000_000);
        }
        let (j, _r0) = job(far());
        state.schedule(0, j, now);
        let (j, _r1) = job(far());
        state.schedule(0, j, now);

        let (j, _rx) = job(now + Duration::from_millis(10));
        state.schedule(0, j, now);
        assert_eq!(state.groups[0].queue.len(), 1);
    }

    #[test]
    fn queued_jobs_expire_on_flush() {
        let (mut state, _rxs) = pool_with(1, 4, None);
        bring_up(&mut state, 0, 1);
        let now = Instant::now();

        let (j, _r) = job(far());
        state.schedule(0, j, now);
        let (j, mut rx) = job(now + Duration::from_millis(5));
        state.schedule(0, j, now);
        assert_eq!(state.groups[0].queue.len(), 1);

        // discovered on the next inspection, not by a per-job timer
        state.flush(0, now + Duration::from_millis(10));
        assert_failed(&mut rx, RelayError::Timeout);
        assert_eq!(state.groups[0].expired, 1);
    }

    #[test]
    fn healthy_to_zero_drains_the_queue() {
        let (mut state, _rxs) = pool_with(2, 8, None);
        bring_up(&mut state, 0, 2);
        let now = Instant::now();

        let (j, _r0) = job(far());
        state.schedule(0, j, now);
        let (j, _r1) = job(far());
        state.schedule(0, j, now);
        let mut queued = Vec::new();
        for _ in 0..3 {
            let (j, rx) = job(far());
            state.schedule(0, j, now);
            queued.push(rx);
        }
        assert_eq!(state.groups[0].queue.len(), 3);

        state.helper_down(0, 0, now);
        assert_eq!(state.groups[0].queue.len(), 3, "one helper still healthy");

        state.helper_down(0, 1, now);
        assert!(state.groups[0].queue.is_empty());
        for rx in &mut queued {
            assert_failed(rx, RelayError::UpstreamUnavailable);
        }
    }

    #[test]
    fn recovery_from_total_outage_flushes_immediately() {
        let (mut state, mut rxs) = pool_with(1, 4, None);
        let now = Instant::now();

        // job queued while offline fails; queue a job while online,
        // then bounce the helper
        bring_up(&mut state, 0, 1);
        let (j, _r0) = job(far());
        state.schedule(0, j, now);
        let (j, _r1) = job(far());
        state.schedule(0, j, now);
        assert_eq!(state.groups[0].queue.len(), 1);

        // helper dies mid-job: queue drains as upstream-unavailable
        state.helper_down(0, 0, now);
        assert!(state.groups[0].queue.is_empty());

        // back up: new jobs schedule again without waiting for a tick
        let _ = rxs[0].try_recv();
        state.helper_up(0, 0, now);
        let (j, _r2) = job(far());
        state.schedule(0, j, now);
        assert!(matches!(rxs[0].try_recv(), Ok(HelperTask::Execute(_))));
    }

    #[test]
    fn fallback_with_idle_helper_takes_overflow() {
        let (tx_p, mut rx_p) = mpsc::channel(1);
        let (tx_f, mut rx_f) = mpsc::channel(1);
        let mut state = PoolState::new(vec![
            GroupConfig {
                name: "primary".into(),
                queue_capacity: 4,
                fallback: Some(1),
                helpers: vec![tx_p],
            },
            GroupConfig {
                name: "secondary".into(),
                queue_capacity: 4,
                fallback: None,
                helpers: vec![tx_f],
            },
        ]);
        let now = Instant::now();
        state.helper_up(0, 0, now);
        state.helper_up(1, 0, now);

        let (j, _r0) = job(far());
        state.schedule(0, j, now);
        assert!(matches!(rx_p.try_recv(), Ok(HelperTask::Execute(_))));

        // primary busy: the next job delegates to the secondary
        let (j, _r1) = job(far());
        state.schedule(0, j, now);
        assert!(matches!(rx_f.try_recv(), Ok(HelperTask::Execute(_))));
        assert!(state.groups[0].queue.is_empty());
        assert_eq!(state.groups[1].busy, 1);

        // both busy: the job queues on the primary, not the fallback
        let (j, _r2) = job(far());
        state.schedule(0, j, now);
        assert_eq!(state.groups[0].queue.len(), 1);
        assert!(state.groups[1].queue.is_empty());
    }

    #[test]
    fn reload_broadcasts_to_idle_and_defers_to_busy() {
        let (mut state, mut rxs) = pool_with(2, 4, None);
        bring_up(&mut state, 0, 2);
        let now = Instant::now();

        // helper 0 busy with a job, helper 1 idle
        let (j, _r) = job(far());
        state.schedule(0, j, now);

        state.broadcast_reload(0, Bytes::from_static(b"reload"));

        // idle helper got it immediately and is now busy
        match rxs[1].try_recv() {
            Ok(HelperTask::Reload(unit)) => assert_eq!(&unit[..], b"reload"),
            other => panic!("expected reload, got {other:?}"),
        }
        assert_eq!(state.groups[0].busy, 2);
        assert!(state.groups[0].helpers[0].needs_reload);

        // busy helper receives it once it frees up
        let _ = rxs[0].try_recv(); // consume the job
        state.helper_done(0, 0, 100, now);
        match rxs[0].try_recv() {
            Ok(HelperTask::Reload(_)) => {}
            other => panic!("expected deferred reload, got {other:?}"),
        }
        // still busy: it is executing the reload now
        assert_eq!(state.groups[0].helpers[0].state, HelperState::Busy);

        // completing the reload finally frees it
        state.helper_done(0, 0, 100, now);
        assert_eq!(state.groups[0].helpers[0].state, HelperState::Free);
        assert!(!state.groups[0].helpers[0].needs_reload);
    }

    #[test]
    fn delay_estimator_clamps_its_window() {
        // fast samples: the window ceiling (200k) keeps the average
        // pinned to the steady-state latency
        let mut d = DelayEstimator::default();
        for _ in 0..100 {
            d.record(1);
        }
        assert!(d.average_us() <= 2);

        // a huge outlier against a fast average: the window floor of 5
        // caps the outlier's weight at 1/5; the unclamped window
        // (~2) would have let it count for half
        let mut d = DelayEstimator::default();
        for _ in 0..1000 {
            d.record(50);
        }
        assert_eq!(d.average_us(), 50);
        d.record(10_000_000);
        assert_eq!(d.average_us(), 2_000_040);
    }

    #[test]
    fn accounting_invariant_holds_across_transitions() {
        let (mut state, mut rxs) = pool_with(3, 4, None);
        let now = Instant::now();
        bring_up(&mut state, 0, 3);

        let check = |state: &PoolState| {
            let g = &state.groups[0];
            let down = g
                .helpers
                .iter()
                .filter(|h| h.state == HelperState::Down)
                .count();
            assert_eq!(g.free.len() + g.busy + down, 3);
        };

        check(&state);
        let (j, _r) = job(far());
        state.schedule(0, j, now);
        check(&state);
        state.helper_down(0, 1, now);
        check(&state);
        let _ = rxs[0].try_recv();
        state.helper_done(0, 0, 10, now);
        check(&state);
        state.helper_up(0, 1, now);
        check(&state);
    }

    #[tokio::test]
    async fn pool_task_routes_submissions() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = spawn_pool(
            vec![GroupConfig {
                name: "g".into(),
                queue_capacity: 4,
                fallback: None,
                helpers: vec![tx],
            }],
            Duration::from_millis(50),
        );

        handle
            .notify(HelperEvent::Up {
                group: 0,
                helper: 0,
            })
            .await;

        let (j, _reply_rx) = {
            let (reply, reply_rx) = oneshot::channel();
            (
                Job {
                    id: 9,
                    payload: Bytes::from_static(b"q"),
                    deadline: far(),
                    reply,
                },
                reply_rx,
            )
        };
        handle.submit(0, j).await;

        let task = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("task arrives")
            .expect("channel open");
        match task {
            HelperTask::Execute(j) => assert_eq!(j.id, 9),
            other => panic!("unexpected {other:?}"),
        }

        let stats = handle.stats().await.expect("pool alive");
        assert_eq!(stats[0].busy, 1);
        assert_eq!(stats[0].ready, 1);
    }
}
