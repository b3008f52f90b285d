use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::{oneshot, Notify, RwLock};

use crate::backend::{Backend, GenericBackend};
use crate::cache::{self, Cache, DirCache};
use crate::digest::now_ms;
use crate::exec::{ExecHost, LocalDriver};
use crate::make::MakeAction;
use crate::node;
use crate::protocol::{
    FileAction, JobEndRpcReq, JobInfo, JobInfoStart, JobMngtProc, JobMngtRpcReq, JobMngtRpcReply,
    JobStartRpcReply, JobStartRpcReq, VerboseInfo,
};
use crate::req::{AuditEvent, JobAudit, Req, ReqOptions, ReqStats, ReqTracker};
use crate::rules::{EngineConfig, Manifest, RuleSet, Special};
use crate::store::{Dep, NodeGoal, Store};
use crate::store_disk::{self, RepoLayout};
use crate::types::{
    Bool3, Dflags, FileActionTag, HeartbeatState, JobIdx, JobReason, JobReasonTag, JobReport,
    JobStep, Manual, NodeIdx, Polluted, ReqIdx, SeqId, SmallId, Status, Zlvl,
};

// ─── Engine state ─────────────────────────────────────────────

/// A DepDirect query parked until its subtree resolves.
pub struct PendingDepDirect {
    pub node: NodeIdx,
    pub req: ReqIdx,
    pub fd: u64,
    pub seq_id: SeqId,
    pub reply_tx: oneshot::Sender<JobMngtRpcReply>,
}

/// The single-writer engine state: store, reqs, caches and backends. All
/// analysis (`make()`) runs through this struct under the engine lock.
pub struct EngineCore {
    pub store: Store,
    pub tracker: ReqTracker,
    pub layout: RepoLayout,
    pub config: EngineConfig,
    pub caches: HashMap<String, Arc<dyn Cache>>,
    pub backends: HashMap<String, Arc<dyn Backend>>,
    pub frozen_jobs: HashSet<JobIdx>,
    pub seq_id: SeqId,
    pub next_small_id: SmallId,
    /// seq_id -> job, for replay detection of start requests.
    pub seq_jobs: HashMap<SeqId, JobIdx>,
    /// Start blobs of currently running jobs, joined with the end blob.
    pub running_infos: HashMap<JobIdx, JobInfoStart>,
    pub pending_dep_direct: Vec<PendingDepDirect>,
    pub manifest_yaml: String,
}

impl EngineCore {
    /// Append-or-overwrite the per-job ancillary record.
    pub fn write_job_info(&self, job: JobIdx, info: &JobInfo) {
        if self.store.read_only {
            return;
        }
        let path = self.layout.ancillary_file(&self.store.job_data(job).full_name);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match bincode::serialize(info) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!(job = %self.store.job_data(job).full_name, "cannot write job info: {e}");
                }
            }
            Err(e) => tracing::warn!("cannot serialize job info: {e}"),
        }
    }

    pub fn read_job_info(&self, job: JobIdx) -> Option<JobInfo> {
        let path = self.layout.ancillary_file(&self.store.job_data(job).full_name);
        let bytes = std::fs::read(path).ok()?;
        bincode::deserialize(&bytes).ok()
    }

    /// Mark reqs whose pseudo-job settled.
    fn refresh_req_done(&mut self) {
        let mut done: Vec<(ReqIdx, bool)> = Vec::new();
        for r in self.tracker.iter() {
            if r.done {
                continue;
            }
            if let Some(job) = r.job {
                if let Some(ri) = self.store.c_job_req_info(job, r.idx) {
                    if ri.done() {
                        done.push((r.idx, self.store.job_data(job).status.ok() == Bool3::Yes));
                    }
                }
            }
        }
        for (idx, _ok) in done {
            if let Some(r) = self.tracker.get_mut(idx) {
                r.done = true;
            }
        }
    }

    /// Answer parked DepDirect queries whose node resolved.
    fn flush_dep_direct(&mut self) {
        let mut still = Vec::new();
        for p in std::mem::take(&mut self.pending_dep_direct) {
            let done = self
                .store
                .c_node_req_info(p.node, p.req)
                .map(|nri| nri.done(NodeGoal::Dsk) || nri.done(NodeGoal::Status) && !nri.waiting())
                .unwrap_or(false);
            let waiting = self
                .store
                .c_node_req_info(p.node, p.req)
                .map(|nri| nri.waiting())
                .unwrap_or(false);
            if done || !waiting {
                let ok = match node::node_ok(&self.store, p.node) {
                    Bool3::Yes => Bool3::Yes,
                    Bool3::No => Bool3::No,
                    Bool3::Maybe => Bool3::Maybe,
                };
                let _ = p.reply_tx.send(JobMngtRpcReply {
                    proc: JobMngtProc::DepDirect,
                    seq_id: p.seq_id,
                    fd: p.fd,
                    ok,
                    ..Default::default()
                });
            } else {
                still.push(p);
            }
        }
        self.pending_dep_direct = still;
    }
}

// ─── Facade ───────────────────────────────────────────────────

/// Result of a completed req.
#[derive(Clone, Debug)]
pub struct ReqSummary {
    pub ok: bool,
    pub stats: ReqStats,
    pub audit: Vec<AuditEvent>,
}

/// The engine facade: wires the store, rule set, caches and backends, and
/// serializes all analysis through the engine lock.
pub struct Engine {
    core: RwLock<EngineCore>,
    req_notify: Notify,
    services: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    /// Load (or initialize) a repo: parse `anvil.yaml`, compile rules,
    /// load the persistent image, open the declared caches.
    pub fn open(repo_root: impl Into<std::path::PathBuf>) -> Result<Arc<Engine>> {
        let layout = RepoLayout::new(repo_root);
        let manifest_path = layout.root.join("anvil.yaml");
        let manifest_yaml = std::fs::read_to_string(&manifest_path)
            .with_context(|| format!("cannot read {}", manifest_path.display()))?;
        let manifest = Manifest::parse(&manifest_yaml)?;
        Engine::open_with(layout, manifest, manifest_yaml)
    }

    pub fn open_with(layout: RepoLayout, manifest: Manifest, manifest_yaml: String) -> Result<Arc<Engine>> {
        let rules = RuleSet::compile(&manifest)?;
        let read_only = store_disk::probe_read_only(&layout);
        let mut store = Store::new(rules);
        store.read_only = read_only;
        store_disk::load(&mut store, &layout)?;
        let mut caches: HashMap<String, Arc<dyn Cache>> = HashMap::new();
        for (name, spec) in &manifest.caches {
            let dir = if std::path::Path::new(&spec.dir).is_absolute() {
                std::path::PathBuf::from(&spec.dir)
            } else {
                layout.root.join(&spec.dir)
            };
            caches.insert(name.clone(), Arc::new(DirCache::new(dir, spec.clone())?));
        }
        store_disk::write_summaries(&store, &layout, &manifest_yaml)?;
        let engine = Arc::new(Engine {
            core: RwLock::new(EngineCore {
                store,
                tracker: ReqTracker::default(),
                layout,
                config: manifest.config.clone(),
                caches,
                backends: HashMap::new(),
                frozen_jobs: HashSet::new(),
                seq_id: 0,
                next_small_id: 0,
                seq_jobs: HashMap::new(),
                running_infos: HashMap::new(),
                pending_dep_direct: Vec::new(),
                manifest_yaml,
            }),
            req_notify: Notify::new(),
            services: std::sync::Mutex::new(Vec::new()),
        });
        Ok(engine)
    }

    /// Install the local backend and start the launch/heartbeat services.
    pub async fn start_services(self: &Arc<Self>) {
        let (capacity, repo_root, heartbeat_s) = {
            let core = self.core.read().await;
            (core.config.local_capacity.clone(), core.layout.root.clone(), core.config.heartbeat_s)
        };
        let driver = LocalDriver::new(&capacity, self.clone() as Arc<dyn ExecHost>, repo_root);
        let backend: Arc<dyn Backend> = GenericBackend::new(driver);
        {
            let mut core = self.core.write().await;
            core.backends.insert("local".to_string(), backend.clone());
        }
        let mut services = self.services.lock().unwrap();
        // launch service: wake-only queue, state recomputed each pass
        {
            let be = backend.clone();
            let notify = be.launch_handle();
            services.push(tokio::spawn(async move {
                loop {
                    notify.notified().await;
                    be.launch().await;
                }
            }));
        }
        // heartbeat service
        {
            let this = self.clone();
            services.push(tokio::spawn(async move {
                let period = std::time::Duration::from_secs(heartbeat_s.max(1));
                loop {
                    tokio::time::sleep(period).await;
                    this.heartbeat_pass().await;
                }
            }));
        }
    }

    pub fn shutdown(&self) {
        for h in self.services.lock().unwrap().drain(..) {
            h.abort();
        }
    }

    /// Persist the store image and summaries.
    pub async fn save(&self) -> Result<()> {
        let core = self.core.read().await;
        store_disk::save(&core.store, &core.layout)?;
        store_disk::write_summaries(&core.store, &core.layout, &core.manifest_yaml)?;
        Ok(())
    }

    // ── Req lifecycle ──

    /// Open a build invocation on the given targets and start analysis.
    pub async fn open_req(&self, options: ReqOptions, targets: &[String]) -> Result<ReqIdx> {
        if targets.is_empty() {
            bail!("nothing to build");
        }
        let mut core = self.core.write().await;
        let eta = now_ms();
        let req = core.tracker.open(options.clone(), eta);
        let verbose = options.verbose;
        for be in core.backends.values() {
            be.open_req(req, options.n_jobs, verbose);
        }
        let etas = core.tracker.etas();
        for be in core.backends.values() {
            be.new_req_etas(&etas);
        }
        // the req pseudo-job: its deps are the asked targets
        let rule = core.store.rules.special_rule(Special::Req);
        let key = core.tracker.get(req).map(|r| r.key.clone()).unwrap_or_default();
        let job = core.store.job(&format!("<req>:{key}"), rule, Vec::new());
        let mut deps = Vec::new();
        let mut target_nodes = Vec::new();
        for t in targets {
            let n = core.store.node(t);
            target_nodes.push(n);
            deps.push(Dep {
                node: n,
                digest: crate::digest::DepDigest::new_static(Dflags::REQUIRED),
            });
        }
        core.store.job_data_mut(job).deps = deps;
        if let Some(r) = core.tracker.get_mut(req) {
            r.job = Some(job);
            r.targets = target_nodes;
        }
        if options.live_out {
            core.store.job_req_info(job, req).live_out = true;
        }
        core.job_make(job, req, MakeAction::Run, JobReason::default(), Bool3::Yes, true);
        core.refresh_req_done();
        let backends: Vec<Arc<dyn Backend>> = core.backends.values().cloned().collect();
        drop(core);
        for be in backends {
            be.wake_launch();
        }
        self.req_notify.notify_waiters();
        Ok(req)
    }

    /// Wait until the req settles, then close it and return its summary.
    pub async fn wait_req(&self, req: ReqIdx) -> ReqSummary {
        loop {
            let notified = self.req_notify.notified();
            {
                let core = self.core.read().await;
                if core.tracker.get(req).map(|r| r.done).unwrap_or(true) {
                    break;
                }
            }
            notified.await;
        }
        self.close_req(req).await
    }

    pub async fn close_req(&self, req: ReqIdx) -> ReqSummary {
        let mut core = self.core.write().await;
        for be in core.backends.values() {
            be.kill_waiting_jobs(Some(req));
            be.close_req(req);
        }
        let ok = core
            .tracker
            .get(req)
            .and_then(|r| r.job)
            .map(|j| core.store.job_data(j).status.ok() == Bool3::Yes)
            .unwrap_or(false);
        core.store.forget_req(req);
        let summary = match core.tracker.close(req) {
            Some(Req { stats, audit, .. }) => ReqSummary { ok, stats, audit },
            None => ReqSummary { ok: false, stats: ReqStats::default(), audit: Vec::new() },
        };
        summary
    }

    /// Kill a req: drop its waiting jobs, give up on its analyses. Jobs
    /// started for other reqs keep running.
    pub async fn kill_req(&self, req: ReqIdx) {
        let mut core = self.core.write().await;
        if let Some(r) = core.tracker.get_mut(req) {
            r.zombie = true;
        }
        let mut given_up: Vec<JobIdx> = Vec::new();
        for be in core.backends.values() {
            given_up.extend(be.kill_waiting_jobs(Some(req)));
        }
        for job in given_up {
            core.job_make(job, req, MakeAction::GiveUp, JobReason::default(), Bool3::Yes, true);
        }
        // still-queued spawns whose only req this was
        let queued: Vec<(JobIdx, String)> = core
            .store
            .jobs
            .iter()
            .enumerate()
            .filter_map(|(j, jd)| {
                let j = j as JobIdx;
                let only_this = jd
                    .req_info
                    .iter()
                    .all(|(r, ri)| *r == req || !ri.running());
                let queued_here = jd
                    .req_info
                    .iter()
                    .any(|(r, ri)| *r == req && ri.step == JobStep::Queued);
                (only_this && queued_here).then(|| (j, jd.backend.clone()))
            })
            .collect();
        for (job, backend) in queued {
            if let Some(be) = core.backends.get(&backend) {
                be.kill_job(job);
            }
            core.store.job_data_mut(job).status = Status::Killed;
            core.job_make(job, req, MakeAction::GiveUp, JobReason::default(), Bool3::Yes, true);
        }
        if let Some(r) = core.tracker.get_mut(req) {
            r.done = true;
        }
        drop(core);
        self.req_notify.notify_waiters();
    }

    // ── Heartbeat ──

    pub async fn heartbeat_pass(&self) {
        let backends: Vec<Arc<dyn Backend>> = {
            let core = self.core.read().await;
            core.backends.values().cloned().collect()
        };
        let heartbeat_ms = {
            let core = self.core.read().await;
            (core.config.heartbeat_s * 1000) as i64
        };
        for be in backends {
            be.heartbeat_tick(heartbeat_ms);
            let dead = be.heartbeat();
            if dead.is_empty() {
                continue;
            }
            let mut core = self.core.write().await;
            for (job, msg, hb) in dead {
                tracing::warn!(job, %msg, ?hb, "job lost before start");
                let status = if hb == HeartbeatState::Err { Status::EarlyLostErr } else { Status::EarlyLost };
                core.store.job_data_mut(job).status = status;
                let reqs: Vec<ReqIdx> = core.store.running_reqs(job);
                for req in reqs {
                    if !msg.is_empty() {
                        let name = core.store.job_data(job).full_name.clone();
                        if let Some(r) = core.tracker.get_mut(req) {
                            r.audit(AuditEvent::Note { txt: format!("{name}: {msg}") });
                        }
                    }
                    core.store.job_req_info(job, req).step = JobStep::End;
                    core.job_make(job, req, MakeAction::End, JobReason::default(), Bool3::Yes, true);
                }
                core.refresh_req_done();
            }
            self.req_notify.notify_waiters();
        }
    }

    // ── Marks ──

    /// Freeze a job: its targets are taken as-is from disk, it never runs.
    pub async fn set_frozen(&self, job_name: &str, frozen: bool) -> bool {
        let mut core = self.core.write().await;
        let Some(job) = core.store.job_of(job_name) else { return false };
        if frozen {
            core.frozen_jobs.insert(job);
        } else {
            core.frozen_jobs.remove(&job);
        }
        true
    }

    /// Mark a path so its modifications stop triggering reruns of
    /// successful jobs (recorded per req in no_triggers for the summary).
    pub async fn set_no_trigger(&self, path: &str, on: bool) {
        let mut core = self.core.write().await;
        let node = core.store.node(path);
        core.store.node_data_mut(node).no_trigger = on;
    }

    // ── Introspection ──

    pub async fn audit_of(&self, req: ReqIdx) -> Vec<AuditEvent> {
        let core = self.core.read().await;
        core.tracker.get(req).map(|r| r.audit.clone()).unwrap_or_default()
    }

    pub async fn with_core<T>(&self, f: impl FnOnce(&EngineCore) -> T) -> T {
        let core = self.core.read().await;
        f(&core)
    }

    pub async fn with_core_mut<T>(&self, f: impl FnOnce(&mut EngineCore) -> T) -> T {
        let mut core = self.core.write().await;
        f(&mut core)
    }

    // ── Job management RPC ──

    /// Serve a mid-execution management request. DepDirect may suspend
    /// until the dep subtree resolves; the engine always eventually
    /// replies.
    pub async fn job_mngt(&self, req: JobMngtRpcReq) -> JobMngtRpcReply {
        let mut reply = JobMngtRpcReply { proc: req.proc, seq_id: req.seq_id, fd: req.fd, ..Default::default() };
        match req.proc {
            JobMngtProc::None | JobMngtProc::Heartbeat | JobMngtProc::Kill | JobMngtProc::ChkTargets => reply,
            JobMngtProc::LiveOut | JobMngtProc::AddLiveOut => {
                let mut core = self.core.write().await;
                if req.job as usize >= core.store.jobs.len() {
                    return reply;
                }
                let name = core.store.job_data(req.job).full_name.clone();
                let reqs: Vec<ReqIdx> = core
                    .store
                    .jobs[req.job as usize]
                    .req_info
                    .iter()
                    .filter(|(_, ri)| ri.live_out)
                    .map(|(r, _)| *r)
                    .collect();
                for r in reqs {
                    if let Some(rq) = core.tracker.get_mut(r) {
                        rq.audit(AuditEvent::LiveOut { job: name.clone(), txt: req.txt.clone() });
                    }
                }
                reply
            }
            JobMngtProc::DepVerbose => {
                let core = self.core.read().await;
                for (dn, _) in &req.deps {
                    match core.store.node_of(dn) {
                        Some(n) => reply.verbose_infos.push(VerboseInfo {
                            ok: node::node_ok(&core.store, n),
                            crc: core.store.node_data(n).crc,
                        }),
                        None => reply.verbose_infos.push(VerboseInfo { ok: Bool3::Maybe, crc: crate::digest::Crc::UNKNOWN }),
                    }
                }
                reply
            }
            JobMngtProc::ChkDeps => {
                let mut core = self.core.write().await;
                if req.job as usize >= core.store.jobs.len() {
                    reply.ok = Bool3::Maybe;
                    return reply;
                }
                let Some(rq) = core.store.running_reqs(req.job).first().copied() else {
                    reply.ok = Bool3::Maybe;
                    return reply;
                };
                let mut all_ok = Bool3::Yes;
                for (dn, _) in &req.deps {
                    let n = core.store.node(dn);
                    core.node_make(n, rq, NodeGoal::Status, Bool3::Yes);
                    let waiting = core.store.c_node_req_info(n, rq).map(|i| i.waiting()).unwrap_or(false);
                    if waiting {
                        all_ok = all_ok & Bool3::Maybe; // not ready: caller should rerun
                        continue;
                    }
                    match node::node_ok(&core.store, n) {
                        Bool3::Yes => {}
                        Bool3::No => {
                            all_ok = Bool3::No;
                            reply.txt = format!("dep {dn} is in error");
                            break;
                        }
                        Bool3::Maybe => all_ok = all_ok & Bool3::Maybe,
                    }
                }
                reply.ok = all_ok;
                reply
            }
            JobMngtProc::DepDirect => {
                let (rx, immediate) = {
                    let mut core = self.core.write().await;
                    if req.job as usize >= core.store.jobs.len() {
                        reply.ok = Bool3::Maybe;
                        return reply;
                    }
                    let Some(rq) = core.store.running_reqs(req.job).first().copied() else {
                        reply.ok = Bool3::Maybe;
                        return reply;
                    };
                    let Some((dn, _)) = req.deps.first() else {
                        reply.ok = Bool3::Maybe;
                        return reply;
                    };
                    let n = core.store.node(dn);
                    core.node_make(n, rq, NodeGoal::Dsk, Bool3::Yes);
                    let waiting = core.store.c_node_req_info(n, rq).map(|i| i.waiting()).unwrap_or(false);
                    if !waiting {
                        reply.ok = node::node_ok(&core.store, n);
                        (None, Some(reply))
                    } else {
                        let (tx, rx) = oneshot::channel();
                        core.pending_dep_direct.push(PendingDepDirect {
                            node: n,
                            req: rq,
                            fd: req.fd,
                            seq_id: req.seq_id,
                            reply_tx: tx,
                        });
                        let backends: Vec<Arc<dyn Backend>> = core.backends.values().cloned().collect();
                        for be in backends {
                            be.wake_launch();
                        }
                        (Some(rx), None)
                    }
                };
                if let Some(r) = immediate {
                    return r;
                }
                match rx.unwrap().await {
                    Ok(r) => r,
                    Err(_) => JobMngtRpcReply { proc: JobMngtProc::DepDirect, ok: Bool3::Maybe, ..Default::default() },
                }
            }
        }
    }
}

// ─── Start / end handling ─────────────────────────────────────

impl EngineCore {
    /// Compose the start reply for a job about to execute.
    pub fn make_start_reply(&mut self, job: JobIdx) -> JobStartRpcReply {
        self.seq_id += 1;
        self.next_small_id += 1;
        let seq_id = self.seq_id;
        let small_id = self.next_small_id;
        self.seq_jobs.insert(seq_id, job);
        let jd = self.store.job_data(job);
        let rule = self.store.rules.get(jd.rule);
        let stems = jd.stems.clone();
        let cmd = rule.cmd_for(&stems);
        // pre-actions: wash or quarantine whatever would be clobbered
        let mut pre_actions: Vec<(String, FileAction)> = Vec::new();
        let mut static_matches = Vec::new();
        for t in &jd.targets {
            let nd = self.store.node_data(t.node);
            let name = nd.name.clone();
            let incremental = t.digest.tflags.contains(crate::types::Tflags::INCREMENTAL);
            let tag = if !nd.crc.exists() && nd.sig == Default::default() {
                FileActionTag::None
            } else if node::manual_state(&self.store, &self.layout, t.node) >= Manual::Empty {
                FileActionTag::Quarantine
            } else if nd.polluted != Polluted::Clean && !incremental {
                FileActionTag::UnlinkPolluted
            } else if !incremental {
                FileActionTag::Unlink
            } else {
                FileActionTag::None
            };
            if rule.auto_mkdir {
                if let Some(pos) = name.rfind('/') {
                    pre_actions.push((name[..pos].to_string(), FileAction { tag: FileActionTag::Mkdir, extra: String::new() }));
                }
            }
            if tag != FileActionTag::None {
                pre_actions.push((name.clone(), FileAction { tag, extra: String::new() }));
            }
            static_matches.push((name, t.digest.tflags));
        }
        let deps: Vec<(String, crate::digest::DepDigest)> = jd
            .deps
            .iter()
            .map(|d| (self.store.node_data(d.node).name.clone(), d.digest))
            .collect();
        let live_out = jd.req_info.iter().any(|(_, ri)| ri.live_out);
        let keep_tmp = jd
            .req_info
            .iter()
            .filter_map(|(r, _)| self.tracker.get(*r))
            .any(|r| r.options.keep_tmp);
        let reply = JobStartRpcReply {
            seq_id,
            rule: rule.name.clone(),
            cmd,
            interpreter: rule.interpreter.clone(),
            env: vec![("PATH".to_string(), std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string()))],
            kill_sigs: rule.kill_sigs.clone(),
            job_space: Default::default(),
            chroot_info: Default::default(),
            pre_actions,
            static_matches,
            star_matches: Vec::new(),
            deps,
            small_id,
            timeout_s: rule.timeout_s,
            ddate_prec_ns: self.config.ddate_prec_ns,
            network_delay_ms: self.config.network_delay_ms,
            nice: 0,
            live_out,
            keep_tmp,
            use_script: false,
            stdin: String::new(),
            stdout: String::new(),
            stderr_ok: rule.stderr_ok,
            zlvl: Zlvl { lvl: 0 },
            key: self.layout.root.to_string_lossy().into_owned(),
            phy_repo_root: self.layout.root.to_string_lossy().into_owned(),
            cache_idx1: 0,
        };
        self.running_infos.insert(
            job,
            JobInfoStart {
                seq_id,
                job,
                reason: jd
                    .req_info
                    .iter()
                    .map(|(_, ri)| ri.reason)
                    .fold(JobReason::default(), |a, b| a | b),
                rsrcs: rule.rsrcs.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                start: JobStartRpcReply { seq_id, ..reply.clone() },
            },
        );
        reply
    }

    /// Digest a finished run: backend bookkeeping was already done; apply
    /// the end report, audit per req, resume analyses, upload to cache.
    pub fn process_job_end(&mut self, end: JobEndRpcReq) {
        let job = end.job;
        // replayed end for a stale sequence: first effect already applied
        match self.seq_jobs.remove(&end.seq_id) {
            Some(j) if j == job => {}
            Some(_) | None if end.seq_id != 0 => {
                tracing::debug!(seq = end.seq_id, job, "stale or replayed end, ignored");
                return;
            }
            _ => {}
        }
        let name = self.store.job_data(job).full_name.clone();
        // did the run modify anything observable?
        let modified = end.digest.targets.iter().any(|(tn, td)| {
            self.store
                .node_of(tn)
                .map(|n| self.store.node_data(n).crc != td.crc)
                .unwrap_or(td.written)
        });
        self.job_end_apply(&end);
        let status = self.store.job_data(job).status;
        let exe_time = self.store.job_data(job).exe_time;
        // ancillary record + cache upload
        let start = self.running_infos.remove(&job);
        if let Some(start) = start {
            let info = JobInfo { start, end: end.clone() };
            self.write_job_info(job, &info);
            if status == Status::Ok {
                self.maybe_upload(job, &info);
            }
        }
        // collected outputs for later inspection
        if !self.store.read_only && (!end.stdout.is_empty() || !end.digest.stderr.is_empty()) {
            let dir = self.layout.outputs_dir();
            if std::fs::create_dir_all(&dir).is_ok() {
                let enc: String = name.chars().map(|c| if c == '/' { '\u{1}' } else { c }).collect();
                if !end.stdout.is_empty() {
                    let _ = std::fs::write(dir.join(format!("{enc}.out")), &end.stdout);
                }
                if !end.digest.stderr.is_empty() {
                    let _ = std::fs::write(dir.join(format!("{enc}.err")), &end.digest.stderr);
                }
            }
        }
        // per-req reporting and resumption
        let reqs: Vec<ReqIdx> = self.store.running_reqs(job);
        for req in reqs {
            let opts = self.tracker.get(req).map(|r| r.options.clone()).unwrap_or_default();
            let asked = if status.ok() == Bool3::No && !status.is_lost() && opts.n_retries > 0 {
                JobReason::new(JobReasonTag::Retry)
            } else {
                JobReason::default()
            };
            self.store.job_req_info(job, req).step = JobStep::End;
            let reason = self.job_make(job, req, MakeAction::End, asked, Bool3::Yes, true);
            let rerunning = self
                .store
                .c_job_req_info(job, req)
                .map(|ri| ri.running() || ri.waiting())
                .unwrap_or(false);
            let report = match status {
                Status::Ok => {
                    if modified {
                        JobReport::Done
                    } else {
                        JobReport::Steady
                    }
                }
                Status::Killed => JobReport::Killed,
                _ => JobReport::Failed,
            };
            if let Some(r) = self.tracker.get_mut(req) {
                if rerunning {
                    r.stats.add(JobReport::Rerun, exe_time);
                    r.missing_audits.insert(job, JobAudit { report, backend_msg: String::new() });
                    r.audit(AuditEvent::Rerun { job: name.clone(), reason: reason.user_str().to_string() });
                } else {
                    r.stats.add(report, exe_time);
                    r.stats.cpu_s += end.stats.cpu_s;
                    r.stats.elapsed_s += end.stats.elapsed_s;
                    r.stats.mem_b = r.stats.mem_b.max(end.stats.mem_b);
                    match report {
                        JobReport::Done => r.audit(AuditEvent::Done { job: name.clone() }),
                        JobReport::Steady => r.audit(AuditEvent::Steady { job: name.clone() }),
                        JobReport::Killed => r.audit(AuditEvent::Killed { job: name.clone() }),
                        _ => r.audit(AuditEvent::Failed {
                            job: name.clone(),
                            reason: reason.user_str().to_string(),
                            stderr: end.digest.stderr.clone(),
                        }),
                    }
                }
            }
        }
        self.refresh_req_done();
        self.flush_dep_direct();
    }

    /// Upload an Ok run to its cache, honoring the commit/dismiss law.
    fn maybe_upload(&mut self, job: JobIdx, info: &JobInfo) {
        let jd = self.store.job_data(job);
        let rule = self.store.rules.get(jd.rule);
        let Some(cache_name) = rule.cache.clone() else { return };
        let uploads = jd
            .req_info
            .iter()
            .filter_map(|(r, _)| self.tracker.get(*r))
            .any(|r| r.options.cache_method.uploads());
        if !uploads {
            return;
        }
        let Some(c) = self.caches.get(&cache_name).cloned() else { return };
        let unique = rule.unique_name(&jd.stems);
        let zlvl = 1;
        let mut info = info.clone();
        // hit criteria: deps are compared by crc, so store node crcs
        for (dn, dd) in &mut info.end.digest.deps {
            if let Some(n) = self.store.node_of(dn) {
                *dd = dd.with_crc(self.store.node_data(n).crc);
            }
        }
        let blob = match cache::build_upload_blob(&self.layout.root, &info, zlvl) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(job = %unique, "cannot build upload blob: {e}");
                return;
            }
        };
        let exe_time = crate::types::CoarseDelay::from_millis((info.end.digest.exe_time * 1000.0) as u64);
        let reserve = cache::compress_max_sz(blob.total_sz, zlvl);
        match c.sub_upload(reserve) {
            Ok(key) => {
                let res = bincode::serialize(&blob)
                    .map_err(anyhow::Error::from)
                    .and_then(|bytes| c.sub_stream(key, &bytes))
                    .and_then(|()| c.sub_commit(key, &unique, exe_time));
                match res {
                    Ok(true) => tracing::debug!(job = %unique, "uploaded to cache"),
                    Ok(false) => tracing::debug!(job = %unique, "cache rejected upload"),
                    Err(e) => {
                        tracing::warn!(job = %unique, "upload failed: {e}");
                        let _ = c.sub_dismiss(key);
                    }
                }
            }
            Err(e) => tracing::warn!(job = %unique, "cannot reserve cache space: {e}"),
        }
    }
}

// ─── ExecHost ─────────────────────────────────────────────────

#[async_trait]
impl ExecHost for Engine {
    async fn job_start(&self, req: JobStartRpcReq) -> Option<JobStartRpcReply> {
        let job = req.job;
        let backend = {
            let core = self.core.read().await;
            if job as usize >= core.store.jobs.len() {
                return None;
            }
            core.store.job_data(job).backend.clone()
        };
        let be = {
            let core = self.core.read().await;
            core.backends.get(&backend).cloned()
        }?;
        // wait for the launcher to record the spawn id
        be.start(job).await?;
        let mut core = self.core.write().await;
        if let Some(info) = core.running_infos.get(&job) {
            return Some(info.start.clone()); // replayed start: same answer, no new effect
        }
        let reply = core.make_start_reply(job);
        let name = core.store.job_data(job).full_name.clone();
        let reqs: Vec<ReqIdx> = core.store.running_reqs(job);
        for r in reqs {
            core.store.job_req_info(job, r).step = JobStep::Exec;
            if let Some(rq) = core.tracker.get_mut(r) {
                rq.audit(AuditEvent::Start { job: name.clone() });
            }
        }
        Some(reply)
    }

    async fn job_end(&self, end: JobEndRpcReq) {
        let job = end.job;
        let (backend, status) = {
            let core = self.core.read().await;
            if job as usize >= core.store.jobs.len() {
                return;
            }
            (core.store.job_data(job).backend.clone(), end.digest.status)
        };
        if let Some(be) = {
            let core = self.core.read().await;
            core.backends.get(&backend).cloned()
        } {
            let (msg, _retry) = be.end(job, status);
            if !msg.is_empty() {
                tracing::debug!(job, %msg, "backend end message");
            }
        }
        {
            let mut core = self.core.write().await;
            core.process_job_end(end);
            let backends: Vec<Arc<dyn Backend>> = core.backends.values().cloned().collect();
            drop(core);
            for be in backends {
                be.wake_launch();
            }
        }
        self.req_notify.notify_waiters();
    }
}
