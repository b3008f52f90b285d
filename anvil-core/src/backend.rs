use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::digest::DepDigest;
use crate::types::{
    CacheIdx, CoarseDelay, HeartbeatState, JobIdx, JobReason, ReqIdx, SeqId, Status, Timestamp,
    Tokens1,
};

// ─── Spawn ids ────────────────────────────────────────────────

pub type SpawnId = i64;
pub const NO_ID: SpawnId = -1;
/// Recorded under the lock before the driver launch runs outside it.
pub const STARTING_ID: SpawnId = -2;
/// Launch failed; the message is surfaced by the heartbeat.
pub const FAILED_ID: SpawnId = -3;

// ─── Resources ────────────────────────────────────────────────

/// A named resource vector with pointwise `+`, `-`, `≤`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rsrcs(pub BTreeMap<String, u64>);

/// Keep only the top 3 significant bits, rounding up: queues stay few even
/// when resource values vary a lot.
pub fn round_rsrc(v: u64) -> u64 {
    const N_MSB: u32 = 3;
    if v <= 1 << N_MSB {
        return v;
    }
    let sw = 64 - v.leading_zeros() - N_MSB;
    (((v - 1) >> sw) + 1) << sw
}

impl Rsrcs {
    pub fn round(&self) -> Rsrcs {
        Rsrcs(self.0.iter().map(|(k, v)| (k.clone(), round_rsrc(*v))).collect())
    }

    pub fn fits_in(&self, avail: &Rsrcs) -> bool {
        self.0.iter().all(|(k, v)| avail.0.get(k).copied().unwrap_or(0) >= *v)
    }

    pub fn add(&mut self, other: &Rsrcs) {
        for (k, v) in &other.0 {
            *self.0.entry(k.clone()).or_insert(0) += v;
        }
    }

    pub fn sub(&mut self, other: &Rsrcs) {
        for (k, v) in &other.0 {
            let e = self.0.entry(k.clone()).or_insert(0);
            *e = e.saturating_sub(*v);
        }
    }
}

// ─── Submit attributes ────────────────────────────────────────

/// Everything a submission carries besides the resources.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitAttrs {
    pub deps: Vec<(String, DepDigest)>,
    pub reason: JobReason,
    pub pressure: CoarseDelay,
    pub cache_idx1: CacheIdx,
    pub tokens1: Tokens1,
    pub live_out: bool,
    pub nice: u8,
}

impl SubmitAttrs {
    /// Merge law: deps/cache are req-independent and must agree, live_out
    /// unions, pressure and tokens take the max, nice the min, reasons
    /// merge by priority.
    pub fn merge(&mut self, other: &SubmitAttrs) {
        if self.deps.is_empty() {
            self.deps = other.deps.clone();
        }
        if self.cache_idx1 == 0 {
            self.cache_idx1 = other.cache_idx1;
        }
        self.live_out |= other.live_out;
        self.nice = self.nice.min(other.nice);
        self.pressure = self.pressure.max(other.pressure);
        self.reason |= other.reason;
        self.tokens1 = self.tokens1.max(other.tokens1);
    }
}

// ─── Driver contract ──────────────────────────────────────────

/// What the generic backend asks a concrete adapter for.
#[async_trait]
pub trait BackendDriver: Send + Sync + 'static {
    fn descr(&self) -> String;
    fn capacity(&self) -> Rsrcs;
    /// Transform asked resources into locally-executable ones: recognized
    /// resources are clamped to capacity, unrecognized ones collapse the
    /// job to a `<single>` token.
    fn import(&self, asked: &BTreeMap<String, u64>) -> Rsrcs;
    /// True if a job with these rounded resources can be spawned now.
    fn fit_now(&self, rs: &Rsrcs) -> bool;
    fn acquire_rsrcs(&self, rs: &Rsrcs);
    fn release_rsrcs(&self, rs: &Rsrcs);
    /// Spawn the job. Called outside the backend lock; may block on the OS.
    async fn launch_job(&self, job: JobIdx, nice: u8, prio: Timestamp) -> Result<SpawnId>;
    fn kill_queued_job(&self, id: SpawnId);
    /// Health of a spawned-but-not-started job.
    fn heartbeat_queued_job(&self, job: JobIdx, id: SpawnId) -> (String, HeartbeatState);
    /// Message + retry hint once a job ended.
    fn end_job(&self, job: JobIdx, id: SpawnId, status: Status) -> (String, bool);
}

// ─── Generic backend ──────────────────────────────────────────

#[derive(Clone, Debug, Default)]
struct WaitEntry {
    rsrcs: Rsrcs,
    submit_attrs: SubmitAttrs,
    n_reqs: u32,
    verbose: bool,
}

#[derive(Clone, Debug)]
struct SpawnedEntry {
    rounded_rsrcs: Rsrcs,
    id: SpawnId,
    started: bool,
    verbose: bool,
    zombie: bool,
    /// The launcher holds the entry without the lock; deletion is deferred.
    hold: bool,
}

#[derive(Clone, Debug, Default)]
struct ReqEntry {
    /// rounded rsrcs -> (higher pressure first, job).
    waiting_queues: HashMap<Rsrcs, BTreeSet<(Reverse<CoarseDelay>, JobIdx)>>,
    waiting_jobs: HashMap<JobIdx, CoarseDelay>,
    /// If > 0, no more than n_jobs spawned on behalf of this req.
    n_jobs: u32,
    verbose: bool,
}

impl ReqEntry {
    fn clear(&mut self) {
        self.waiting_queues.clear();
        self.waiting_jobs.clear();
    }
}

#[derive(Default)]
struct State {
    reqs: HashMap<ReqIdx, ReqEntry>,
    waiting_jobs: HashMap<JobIdx, WaitEntry>,
    spawned_jobs: HashMap<JobIdx, SpawnedEntry>,
    /// Launch-failure messages held until the heartbeat surfaces them.
    msgs: HashMap<JobIdx, String>,
    /// Number of reqs with a non-zero n_jobs.
    n_n_jobs: u32,
    /// Req start order with their ETAs; launch serves reqs in this order.
    etas: Vec<(ReqIdx, Timestamp)>,
}

impl State {
    fn live_spawned(&self) -> usize {
        self.spawned_jobs.values().filter(|se| !se.zombie).count()
    }
}

/// A job spawn decision taken under the lock, executed outside it.
struct LaunchDescr {
    job: JobIdx,
    nice: u8,
    prio: Timestamp,
}

/// The queueing, throttling and spawning logic shared by all backends.
pub struct GenericBackend<D: BackendDriver> {
    pub driver: D,
    state: Mutex<State>,
    launch_notify: Arc<Notify>,
    id_notify: Notify,
    oldest_submitted: AtomicI64,
}

impl<D: BackendDriver> GenericBackend<D> {
    pub fn new(driver: D) -> Arc<Self> {
        Arc::new(GenericBackend {
            driver,
            state: Mutex::new(State::default()),
            launch_notify: Arc::new(Notify::new()),
            id_notify: Notify::new(),
            oldest_submitted: AtomicI64::new(0),
        })
    }

    pub fn descr(&self) -> String {
        self.driver.descr()
    }

    // ── Req lifecycle ──

    pub fn open_req(&self, req: ReqIdx, n_jobs: u32, verbose: bool) {
        let mut st = self.state.lock().unwrap();
        let inserted = st.reqs.insert(req, ReqEntry { n_jobs, verbose, ..Default::default() }).is_none();
        debug_assert!(inserted, "req {req} opened twice");
        if n_jobs > 0 {
            st.n_n_jobs += 1;
        }
        st.etas.push((req, 0));
        tracing::debug!(req, n_jobs, "backend req opened");
    }

    pub fn close_req(&self, req: ReqIdx) {
        let mut st = self.state.lock().unwrap();
        let Some(re) = st.reqs.remove(&req) else { return };
        debug_assert!(re.waiting_jobs.is_empty(), "closing a req with waiting jobs");
        if re.n_jobs > 0 {
            st.n_n_jobs -= 1;
        }
        st.etas.retain(|(r, _)| *r != req);
    }

    pub fn new_req_etas(&self, etas: &[(ReqIdx, Timestamp)]) {
        let mut st = self.state.lock().unwrap();
        for (req, eta) in etas {
            if let Some(e) = st.etas.iter_mut().find(|(r, _)| r == req) {
                e.1 = *eta;
            }
        }
    }

    // ── Submission ──

    /// Queue a new job. The job must not already be waiting.
    pub fn submit(&self, job: JobIdx, req: ReqIdx, submit_attrs: SubmitAttrs, asked: &BTreeMap<String, u64>) -> Result<()> {
        let rsrcs = self.driver.import(asked);
        if !rsrcs.round().fits_in(&self.driver.capacity()) {
            bail!("not enough resources on {} to ever launch job", self.descr());
        }
        let mut st = self.state.lock().unwrap();
        if st.waiting_jobs.contains_key(&job) {
            bail!("job {job} is already waiting");
        }
        let pressure = submit_attrs.pressure;
        let verbose;
        {
            let re = st.reqs.get_mut(&req).expect("submit for an unknown req");
            debug_assert!(!re.waiting_jobs.contains_key(&job));
            verbose = re.verbose;
            re.waiting_jobs.insert(job, pressure);
            re.waiting_queues.entry(rsrcs.round()).or_default().insert((Reverse(pressure), job));
        }
        st.waiting_jobs.insert(job, WaitEntry { rsrcs, submit_attrs, n_reqs: 1, verbose });
        let backlog = st.reqs.get(&req).map(|re| re.waiting_jobs.len()).unwrap_or(0);
        drop(st);
        // keep the oldest pending date: the heartbeat uses it as a backstop
        let _ = self
            .oldest_submitted
            .compare_exchange(0, crate::digest::now_ms(), Ordering::Relaxed, Ordering::Relaxed);
        if backlog > 1000 {
            self.launch_notify.notify_one();
        }
        Ok(())
    }

    /// An additional req wants an already-waiting job.
    pub fn add_pressure(&self, job: JobIdx, req: ReqIdx, submit_attrs: SubmitAttrs) {
        let mut st = self.state.lock().unwrap();
        let verbose = st.reqs.get(&req).map(|re| re.verbose).unwrap_or(false);
        let Some(we) = st.waiting_jobs.get_mut(&job) else {
            // job is not waiting anymore: if spawned, just mark verbosity
            if let Some(se) = st.spawned_jobs.get_mut(&job) {
                se.verbose |= verbose;
            }
            return;
        };
        let pressure = submit_attrs.pressure;
        we.submit_attrs.merge(&submit_attrs);
        we.verbose |= verbose;
        we.n_reqs += 1;
        let rounded = we.rsrcs.round();
        let re = st.reqs.get_mut(&req).expect("add_pressure for an unknown req");
        debug_assert!(!re.waiting_jobs.contains_key(&job));
        re.waiting_jobs.insert(job, pressure);
        re.waiting_queues.entry(rounded).or_default().insert((Reverse(pressure), job));
    }

    /// Re-key the job in its waiting queue by the new pressure.
    pub fn set_pressure(&self, job: JobIdx, req: ReqIdx, submit_attrs: SubmitAttrs) {
        let mut st = self.state.lock().unwrap();
        let Some(we) = st.waiting_jobs.get_mut(&job) else { return };
        let pressure = submit_attrs.pressure;
        we.submit_attrs.merge(&submit_attrs);
        let rounded = we.rsrcs.round();
        let Some(re) = st.reqs.get_mut(&req) else { return };
        let Some(old_pressure) = re.waiting_jobs.get_mut(&job) else { return };
        if let Some(q) = re.waiting_queues.get_mut(&rounded) {
            q.remove(&(Reverse(*old_pressure), job));
            q.insert((Reverse(pressure), job));
        }
        *old_pressure = pressure;
    }

    // ── Launch ──

    pub fn launch_handle(&self) -> Arc<Notify> {
        self.launch_notify.clone()
    }

    pub fn wake_launch(&self) {
        self.launch_notify.notify_one();
    }

    /// One launch pass: serve reqs in ETA order, each time picking the
    /// highest-pressure queue head whose resources fit now. Bookkeeping is
    /// recorded under the lock; the driver launch runs outside it.
    pub async fn launch(&self) {
        self.oldest_submitted.store(0, Ordering::Relaxed);
        let etas: Vec<(ReqIdx, Timestamp)> = {
            let st = self.state.lock().unwrap();
            st.etas.clone()
        };
        for (req, eta) in etas {
            let mut descrs: Vec<LaunchDescr> = Vec::new();
            {
                let mut st = self.state.lock().unwrap();
                st.spawned_jobs.retain(|_, se| !(se.zombie && !se.hold)); // flush zombies while holding no entry
                let Some(re) = st.reqs.get(&req) else { continue };
                let n_jobs = re.n_jobs;
                loop {
                    if n_jobs > 0 && st.live_spawned() >= n_jobs as usize {
                        break; // this req's -j limit is reached
                    }
                    let re = st.reqs.get(&req).unwrap();
                    let mut candidate: Option<(&Rsrcs, &(Reverse<CoarseDelay>, JobIdx))> = None;
                    for (rs, q) in &re.waiting_queues {
                        let Some(head) = q.first() else { continue };
                        if let Some((_, best)) = candidate {
                            if head.0 .0 <= best.0 .0 {
                                continue;
                            }
                        }
                        if self.driver.fit_now(rs) {
                            candidate = Some((rs, head));
                        }
                    }
                    let Some((rs, &(Reverse(pressure), job))) = candidate else { break };
                    let rounded = rs.clone();
                    let we = st.waiting_jobs.remove(&job).expect("queued job without wait entry");
                    // release the job from every req that was waiting for it
                    let reqs_of_job: Vec<ReqIdx> = st
                        .reqs
                        .iter()
                        .filter(|(_, re)| re.waiting_jobs.contains_key(&job))
                        .map(|(r, _)| *r)
                        .collect();
                    for r in &reqs_of_job {
                        let re = st.reqs.get_mut(r).unwrap();
                        let p = re.waiting_jobs.remove(&job).unwrap();
                        let mut drop_queue = false;
                        if let Some(q) = re.waiting_queues.get_mut(&rounded) {
                            q.remove(&(Reverse(p), job));
                            drop_queue = q.is_empty();
                        }
                        if drop_queue {
                            re.waiting_queues.remove(&rounded); // last entry for these rsrcs
                        }
                    }
                    self.driver.acquire_rsrcs(&rounded);
                    st.spawned_jobs.insert(
                        job,
                        SpawnedEntry {
                            rounded_rsrcs: rounded,
                            id: STARTING_ID,
                            started: false,
                            verbose: we.verbose,
                            zombie: false,
                            hold: true,
                        },
                    );
                    let prio = eta - pressure.as_millis() as Timestamp;
                    descrs.push(LaunchDescr { job, nice: we.submit_attrs.nice, prio });
                }
            }
            for descr in descrs {
                let zombie = {
                    let st = self.state.lock().unwrap();
                    st.spawned_jobs.get(&descr.job).map(|se| se.zombie).unwrap_or(true)
                };
                let id = if zombie {
                    NO_ID // killed meanwhile: skip the launch entirely
                } else {
                    match self.driver.launch_job(descr.job, descr.nice, descr.prio).await {
                        Ok(id) => {
                            debug_assert!(id >= 0);
                            tracing::debug!(job = descr.job, id, "spawned");
                            id
                        }
                        Err(e) => {
                            tracing::warn!(job = descr.job, "launch failed: {e}");
                            let mut st = self.state.lock().unwrap();
                            st.msgs.insert(descr.job, e.to_string());
                            FAILED_ID
                        }
                    }
                };
                {
                    let mut st = self.state.lock().unwrap();
                    let mut was_zombie = false;
                    if let Some(se) = st.spawned_jobs.get_mut(&descr.job) {
                        se.id = id;
                        se.hold = false;
                        was_zombie = se.zombie;
                    }
                    if was_zombie {
                        st.spawned_jobs.remove(&descr.job); // killed while launching: rsrcs were released at kill time
                    }
                }
                self.id_notify.notify_waiters();
            }
        }
    }

    // ── Start / end callbacks ──

    /// Called when the job's start RPC arrives. Waits for the launcher to
    /// record the spawn id. None if the job was killed in the meantime.
    pub async fn start(&self, job: JobIdx) -> Option<SpawnId> {
        loop {
            let notified = self.id_notify.notified();
            {
                let mut st = self.state.lock().unwrap();
                match st.spawned_jobs.get_mut(&job) {
                    None => return None,
                    Some(se) if se.zombie => return None,
                    Some(se) if se.id != STARTING_ID => {
                        se.started = true;
                        return Some(se.id);
                    }
                    Some(_) => {}
                }
            }
            notified.await;
        }
    }

    /// Called when the job's end RPC arrives. Returns the driver message
    /// and its retry hint.
    pub fn end(&self, job: JobIdx, status: Status) -> (String, bool) {
        let (id, rounded, wake) = {
            let mut st = self.state.lock().unwrap();
            let Some(se) = st.spawned_jobs.get_mut(&job) else { return (String::new(), false) };
            if se.zombie {
                return (String::new(), false); // already accounted at kill time
            }
            let id = se.id;
            let rounded = se.rounded_rsrcs.clone();
            let held = se.hold;
            if held {
                se.zombie = true;
            }
            if !held {
                st.spawned_jobs.remove(&job);
            }
            (id, rounded, st.n_n_jobs > 0)
        };
        self.driver.release_rsrcs(&rounded);
        let digest = self.driver.end_job(job, id, status);
        if wake {
            self.launch_notify.notify_one();
        }
        digest
    }

    // ── Heartbeat ──

    /// Time-based backstop: if submissions have been pending for longer
    /// than the heartbeat tick, force a launch pass.
    pub fn heartbeat_tick(&self, heartbeat_ms: i64) {
        let oldest = self.oldest_submitted.load(Ordering::Relaxed);
        if oldest != 0 && oldest + heartbeat_ms < crate::digest::now_ms() {
            self.oldest_submitted.store(0, Ordering::Relaxed);
            self.launch_notify.notify_one();
        }
    }

    /// Sweep non-started spawned jobs; report the dead ones.
    pub fn heartbeat(&self) -> Vec<(JobIdx, String, HeartbeatState)> {
        let candidates: Vec<(JobIdx, SpawnId)> = {
            let st = self.state.lock().unwrap();
            st.spawned_jobs
                .iter()
                .filter(|(_, se)| !se.started && !se.zombie && !se.hold)
                .map(|(j, se)| (*j, se.id))
                .collect()
        };
        let mut dead = Vec::new();
        for (job, id) in candidates {
            match id {
                NO_ID | STARTING_ID => {} // bookkeeping not settled yet
                FAILED_ID => {
                    let msg = {
                        let mut st = self.state.lock().unwrap();
                        st.msgs.remove(&job).unwrap_or_default()
                    };
                    self.remove_spawned(job);
                    dead.push((job, msg, HeartbeatState::Err));
                }
                id => {
                    let (msg, hb) = self.driver.heartbeat_queued_job(job, id);
                    if hb != HeartbeatState::Alive {
                        self.remove_spawned(job);
                        dead.push((job, msg, hb));
                    }
                }
            }
        }
        if !dead.is_empty() {
            self.launch_notify.notify_one();
        }
        dead
    }

    fn remove_spawned(&self, job: JobIdx) {
        let rounded = {
            let mut st = self.state.lock().unwrap();
            let Some(se) = st.spawned_jobs.get_mut(&job) else { return };
            let r = se.rounded_rsrcs.clone();
            let held = se.hold;
            if held {
                se.zombie = true;
            }
            if !held {
                st.spawned_jobs.remove(&job);
            }
            r
        };
        self.driver.release_rsrcs(&rounded);
    }

    // ── Kill ──

    /// Drop waiting jobs (all reqs when `req` is None). Returns the jobs
    /// that were dropped entirely.
    pub fn kill_waiting_jobs(&self, req: Option<ReqIdx>) -> Vec<JobIdx> {
        let mut st = self.state.lock().unwrap();
        let mut res = Vec::new();
        match req {
            None => {
                res.extend(st.waiting_jobs.keys().copied());
                st.waiting_jobs.clear();
                for re in st.reqs.values_mut() {
                    re.clear();
                }
            }
            Some(req) => {
                let Some(re) = st.reqs.get_mut(&req) else { return res };
                let jobs: Vec<JobIdx> = re.waiting_jobs.keys().copied().collect();
                re.clear();
                for j in jobs {
                    let we = st.waiting_jobs.get_mut(&j).expect("waiting job without entry");
                    debug_assert!(we.n_reqs > 0);
                    if we.n_reqs == 1 {
                        st.waiting_jobs.remove(&j);
                        res.push(j);
                    } else {
                        we.n_reqs -= 1;
                    }
                }
            }
        }
        res
    }

    /// Kill a spawned job that has not started yet. Resources are released
    /// here, at the live→dead transition; a held entry is left for the
    /// launcher to discard.
    pub fn kill_job(&self, job: JobIdx) {
        let (id, rounded, held) = {
            let mut st = self.state.lock().unwrap();
            let Some(se) = st.spawned_jobs.get_mut(&job) else { return };
            if se.zombie {
                return;
            }
            debug_assert!(!se.started, "started jobs are not the backend's to kill");
            se.zombie = true;
            let r = (se.id, se.rounded_rsrcs.clone(), se.hold);
            if !r.2 {
                st.spawned_jobs.remove(&job);
            }
            r
        };
        self.driver.release_rsrcs(&rounded);
        if id >= 0 && !held {
            self.driver.kill_queued_job(id);
        }
    }

    /// Introspection for tests and status reports.
    pub fn n_waiting(&self) -> usize {
        self.state.lock().unwrap().waiting_jobs.len()
    }

    pub fn n_spawned(&self) -> usize {
        self.state.lock().unwrap().live_spawned()
    }
}

// ─── Object-safe capability set ───────────────────────────────

/// The closed capability set the engine drives every backend through.
#[async_trait]
pub trait Backend: Send + Sync {
    fn descr(&self) -> String;
    fn open_req(&self, req: ReqIdx, n_jobs: u32, verbose: bool);
    fn close_req(&self, req: ReqIdx);
    fn new_req_etas(&self, etas: &[(ReqIdx, Timestamp)]);
    fn submit(&self, job: JobIdx, req: ReqIdx, attrs: SubmitAttrs, asked: &BTreeMap<String, u64>) -> Result<()>;
    fn add_pressure(&self, job: JobIdx, req: ReqIdx, attrs: SubmitAttrs);
    fn set_pressure(&self, job: JobIdx, req: ReqIdx, attrs: SubmitAttrs);
    fn wake_launch(&self);
    async fn launch(&self);
    async fn start(&self, job: JobIdx) -> Option<SpawnId>;
    fn end(&self, job: JobIdx, status: Status) -> (String, bool);
    fn heartbeat_tick(&self, heartbeat_ms: i64);
    fn heartbeat(&self) -> Vec<(JobIdx, String, HeartbeatState)>;
    fn kill_waiting_jobs(&self, req: Option<ReqIdx>) -> Vec<JobIdx>;
    fn kill_job(&self, job: JobIdx);
    fn launch_handle(&self) -> Arc<Notify>;
}

#[async_trait]
impl<D: BackendDriver> Backend for GenericBackend<D> {
    fn descr(&self) -> String {
        GenericBackend::descr(self)
    }
    fn open_req(&self, req: ReqIdx, n_jobs: u32, verbose: bool) {
        GenericBackend::open_req(self, req, n_jobs, verbose)
    }
    fn close_req(&self, req: ReqIdx) {
        GenericBackend::close_req(self, req)
    }
    fn new_req_etas(&self, etas: &[(ReqIdx, Timestamp)]) {
        GenericBackend::new_req_etas(self, etas)
    }
    fn submit(&self, job: JobIdx, req: ReqIdx, attrs: SubmitAttrs, asked: &BTreeMap<String, u64>) -> Result<()> {
        GenericBackend::submit(self, job, req, attrs, asked)
    }
    fn add_pressure(&self, job: JobIdx, req: ReqIdx, attrs: SubmitAttrs) {
        GenericBackend::add_pressure(self, job, req, attrs)
    }
    fn set_pressure(&self, job: JobIdx, req: ReqIdx, attrs: SubmitAttrs) {
        GenericBackend::set_pressure(self, job, req, attrs)
    }
    fn wake_launch(&self) {
        GenericBackend::wake_launch(self)
    }
    async fn launch(&self) {
        GenericBackend::launch(self).await
    }
    async fn start(&self, job: JobIdx) -> Option<SpawnId> {
        GenericBackend::start(self, job).await
    }
    fn end(&self, job: JobIdx, status: Status) -> (String, bool) {
        GenericBackend::end(self, job, status)
    }
    fn heartbeat_tick(&self, heartbeat_ms: i64) {
        GenericBackend::heartbeat_tick(self, heartbeat_ms)
    }
    fn heartbeat(&self) -> Vec<(JobIdx, String, HeartbeatState)> {
        GenericBackend::heartbeat(self)
    }
    fn kill_waiting_jobs(&self, req: Option<ReqIdx>) -> Vec<JobIdx> {
        GenericBackend::kill_waiting_jobs(self, req)
    }
    fn kill_job(&self, job: JobIdx) {
        GenericBackend::kill_job(self, job)
    }
    fn launch_handle(&self) -> Arc<Notify> {
        GenericBackend::launch_handle(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct FakeDriver {
        capacity: Rsrcs,
        occupied: Mutex<Rsrcs>,
        launched: Mutex<Vec<JobIdx>>,
        next_id: AtomicU64,
        fail: bool,
    }

    impl FakeDriver {
        fn new(cpu: u64) -> FakeDriver {
            FakeDriver {
                capacity: Rsrcs(BTreeMap::from([("cpu".into(), cpu)])),
                occupied: Mutex::new(Rsrcs::default()),
                launched: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl BackendDriver for FakeDriver {
        fn descr(&self) -> String {
            "fake".into()
        }
        fn capacity(&self) -> Rsrcs {
            self.capacity.clone()
        }
        fn import(&self, asked: &BTreeMap<String, u64>) -> Rsrcs {
            Rsrcs(asked.clone())
        }
        fn fit_now(&self, rs: &Rsrcs) -> bool {
            let occ = self.occupied.lock().unwrap();
            let mut avail = self.capacity.clone();
            avail.sub(&occ);
            rs.fits_in(&avail)
        }
        fn acquire_rsrcs(&self, rs: &Rsrcs) {
            self.occupied.lock().unwrap().add(rs);
        }
        fn release_rsrcs(&self, rs: &Rsrcs) {
            self.occupied.lock().unwrap().sub(rs);
        }
        async fn launch_job(&self, job: JobIdx, _nice: u8, _prio: Timestamp) -> Result<SpawnId> {
            if self.fail {
                bail!("no executor available");
            }
            self.launched.lock().unwrap().push(job);
            Ok(self.next_id.fetch_add(1, Ordering::Relaxed) as SpawnId)
        }
        fn kill_queued_job(&self, _id: SpawnId) {}
        fn heartbeat_queued_job(&self, _job: JobIdx, _id: SpawnId) -> (String, HeartbeatState) {
            (String::new(), HeartbeatState::Alive)
        }
        fn end_job(&self, _job: JobIdx, _id: SpawnId, _status: Status) -> (String, bool) {
            (String::new(), false)
        }
    }

    fn attrs(pressure_ms: u64) -> SubmitAttrs {
        SubmitAttrs { pressure: CoarseDelay::from_millis(pressure_ms), ..Default::default() }
    }

    fn cpu(n: u64) -> BTreeMap<String, u64> {
        BTreeMap::from([("cpu".into(), n)])
    }

    #[test]
    fn rounding_keeps_top_bits() {
        assert_eq!(round_rsrc(5), 5, "small values stay exact");
        assert_eq!(round_rsrc(8), 8);
        assert_eq!(round_rsrc(9), 10);
        assert_eq!(round_rsrc(100), 112);
        assert!(round_rsrc(1000) >= 1000, "always rounds up");
        // bounded distinct buckets per power of two
        let buckets: std::collections::HashSet<u64> = (256..512).map(round_rsrc).collect();
        assert!(buckets.len() <= 8, "top 3 bits only: {buckets:?}");
    }

    #[tokio::test]
    async fn launch_respects_capacity_and_pressure() {
        let be = GenericBackend::new(FakeDriver::new(2));
        be.open_req(0, 0, false);
        be.submit(1, 0, attrs(100), &cpu(1)).unwrap();
        be.submit(2, 0, attrs(300), &cpu(1)).unwrap();
        be.submit(3, 0, attrs(200), &cpu(1)).unwrap();
        be.launch().await;
        // capacity 2: the two highest-pressure jobs went out first
        let launched = be.driver.launched.lock().unwrap().clone();
        assert_eq!(launched, vec![2, 3]);
        assert_eq!(be.n_waiting(), 1);
        assert_eq!(be.n_spawned(), 2);
        // ending one frees capacity for the last
        assert!(be.start(2).await.is_some());
        be.end(2, Status::Ok);
        be.launch().await;
        let launched = be.driver.launched.lock().unwrap().clone();
        assert_eq!(launched, vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn n_jobs_limits_per_req() {
        let be = GenericBackend::new(FakeDriver::new(100));
        be.open_req(0, 1, false);
        for j in 1..=3 {
            be.submit(j, 0, attrs(100), &cpu(1)).unwrap();
        }
        be.launch().await;
        assert_eq!(be.n_spawned(), 1, "-j 1 spawns one at a time");
    }

    #[tokio::test]
    async fn add_and_set_pressure_rekey() {
        let be = GenericBackend::new(FakeDriver::new(1));
        be.open_req(0, 0, false);
        be.open_req(1, 0, false);
        be.submit(1, 0, attrs(100), &cpu(1)).unwrap();
        be.submit(2, 0, attrs(200), &cpu(1)).unwrap();
        // a second req raises job 1 above job 2
        be.add_pressure(1, 1, attrs(500));
        be.set_pressure(1, 0, attrs(400));
        be.launch().await;
        let launched = be.driver.launched.lock().unwrap().clone();
        assert_eq!(launched, vec![1]);
    }

    #[tokio::test]
    async fn kill_waiting_per_req_decrements() {
        let be = GenericBackend::new(FakeDriver::new(0)); // nothing fits: stays waiting
        be.open_req(0, 0, false);
        be.open_req(1, 0, false);
        be.submit(7, 0, attrs(10), &cpu(0)).unwrap();
        be.add_pressure(7, 1, attrs(10));
        // killing req 0 leaves the job waiting for req 1
        assert!(be.kill_waiting_jobs(Some(0)).is_empty());
        assert_eq!(be.n_waiting(), 1);
        let dropped = be.kill_waiting_jobs(Some(1));
        assert_eq!(dropped, vec![7]);
        assert_eq!(be.n_waiting(), 0);
    }

    #[tokio::test]
    async fn failed_launch_surfaces_through_heartbeat() {
        let mut driver = FakeDriver::new(4);
        driver.fail = true;
        let be = GenericBackend::new(driver);
        be.open_req(0, 0, false);
        be.submit(9, 0, attrs(10), &cpu(1)).unwrap();
        be.launch().await;
        let dead = be.heartbeat();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0, 9);
        assert_eq!(dead[0].2, HeartbeatState::Err);
        assert!(dead[0].1.contains("no executor"));
        assert_eq!(be.n_spawned(), 0);
    }

    #[tokio::test]
    async fn no_double_spawn() {
        let be = GenericBackend::new(FakeDriver::new(4));
        be.open_req(0, 0, false);
        be.submit(1, 0, attrs(10), &cpu(1)).unwrap();
        assert!(be.submit(1, 0, attrs(10), &cpu(1)).is_err(), "already waiting");
        be.launch().await;
        assert_eq!(be.driver.launched.lock().unwrap().len(), 1);
        be.launch().await;
        assert_eq!(be.driver.launched.lock().unwrap().len(), 1, "launch is idempotent");
    }
}
