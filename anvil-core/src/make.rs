use std::collections::BTreeMap;

use crate::backend::SubmitAttrs;
use crate::cache::{CacheMatch, DepState};
use crate::digest::{Crc, DepInfo, FileSig, now_ms};
use crate::engine::EngineCore;
use crate::node;
use crate::protocol::JobEndRpcReq;
use crate::req::{AuditEvent, JobAudit};
use crate::rules::Special;
use crate::store::{Dep, NodeGoal, Target};
use crate::types::{
    Accesses, Bool3, Buildable, CacheHitInfo, CoarseDelay, Dflags, JobIdx, JobReason,
    JobReasonTag, JobReport, JobStep, Manual, NoRunReason, NodeIdx, Polluted, ReqIdx, RunStatus,
    Status, Tflags,
};

/// How `make()` was entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MakeAction {
    /// Plain analysis request.
    Run,
    /// Pure observation: no submission, no watcher registration.
    Query,
    /// A watched dep resolved.
    Wakeup,
    /// The job's end report was processed; deps have changed.
    End,
    /// The req was killed while we were waiting.
    GiveUp,
}

/// Pre-analysis reason implied by the last run's status.
fn mk_reason(status: Status) -> JobReasonTag {
    match status {
        Status::New => JobReasonTag::New,
        Status::EarlyChkDeps | Status::ChkDeps => JobReasonTag::ChkDeps,
        Status::CacheMatch => JobReasonTag::CacheMatch,
        Status::Killed => JobReasonTag::Killed,
        Status::EarlyLost | Status::LateLost => JobReasonTag::Lost,
        Status::BadTarget => JobReasonTag::PollutedTargets,
        _ => JobReasonTag::None,
    }
}

/// Outcome of `submit_plain`.
enum Submitted {
    /// Job is queued (or replicated on another req's run); wait for it.
    Waiting,
    /// Cache served the full result; restart analysis as if ended.
    CacheHit,
    /// Cache reported new deps; restart analysis.
    CacheMatch,
    /// Submission failed or nothing to wait for; analysis is over.
    Done,
}

impl EngineCore {
    // ─── Node make ────────────────────────────────────────────

    /// Ensure `node` reaches `goal` for `req`: classify it, refresh
    /// sources, or drive its conform job. On return the node is either
    /// done or waiting with watchers registered.
    pub fn node_make(&mut self, node: NodeIdx, req: ReqIdx, goal: NodeGoal, speculate: Bool3) {
        if goal == NodeGoal::None {
            return;
        }
        node::set_buildable(&mut self.store, node);
        {
            let nri = self.store.node_req_info(node, req);
            nri.speculate = nri.speculate & speculate;
            if nri.waiting() || nri.done(goal) {
                nri.goal = nri.goal.max(goal);
                return;
            }
            nri.goal = nri.goal.max(goal);
        }
        let buildable = self.store.node_data(node).buildable;
        match buildable {
            Buildable::Src | Buildable::SrcDir | Buildable::SubSrcDir => {
                if let Err(e) = node::refresh_src(&mut self.store, &self.layout, node) {
                    tracing::warn!(node = %self.store.node_data(node).name, "cannot refresh source: {e}");
                }
                self.store.node_req_info(node, req).done_goal = NodeGoal::Dsk;
            }
            Buildable::No | Buildable::Anti | Buildable::Unknown => {
                // not buildable: record what is on disk, dependents decide
                let _ = node::refresh_src(&mut self.store, &self.layout, node);
                self.store.node_req_info(node, req).done_goal = NodeGoal::Dsk;
            }
            Buildable::Maybe | Buildable::Yes => {
                self.node_make_job(node, req, goal, speculate);
            }
        }
    }

    /// Drive the conform job of a makable node.
    fn node_make_job(&mut self, node: NodeIdx, req: ReqIdx, goal: NodeGoal, speculate: Bool3) {
        let cands = self.store.node_data(node).rule_tgts.clone();
        let name = self.store.node_data(node).name.clone();
        for rt in cands {
            let (full_name, stems) = {
                let rule = self.store.rules.get(rt.rule);
                let tgt = &rule.targets[rt.tgt as usize];
                let Some(stems) = tgt.pattern.bind(&name, rule.stems.len()) else { continue };
                (rule.job_name(&stems), stems)
            };
            let job = self.store.job(&full_name, rt.rule, stems);
            if self.store.job_data(job).targets.is_empty() {
                self.init_job_instance(job);
            }
            // a reason to run if the node is needed on disk but absent
            let mut asked = JobReason::default();
            if goal == NodeGoal::Dsk && self.store.job_data(job).status == Status::Ok {
                let sig = FileSig::from_path(&self.layout.root.join(&name));
                if !sig.exists() && self.store.node_data(node).crc.exists() {
                    asked = JobReason::with_node(JobReasonTag::NoTarget, node);
                }
            }
            self.store.node_data_mut(node).conform_job = Some(job);
            self.job_make(job, req, MakeAction::Run, asked, speculate, true);
            let jri = self.store.c_job_req_info(job, req).expect("job analyzed just above");
            if jri.waiting() {
                let pressure = jri.pressure;
                self.store.job_req_info(job, req).watchers.push(node);
                let nri = self.store.node_req_info(node, req);
                nri.n_wait += 1;
                nri.pressure = nri.pressure.max(pressure);
                return;
            }
            if self.store.job_data(job).run_status == RunStatus::MissingStatic {
                continue; // rule does not apply, try the next candidate
            }
            self.node_done(node, req);
            return;
        }
        // no candidate applies
        self.store.node_data_mut(node).buildable = Buildable::No;
        self.store.node_req_info(node, req).done_goal = NodeGoal::Dsk;
    }

    /// Mark the node resolved for `req` and wake its watchers.
    fn node_done(&mut self, node: NodeIdx, req: ReqIdx) {
        let sig = FileSig::from_path(&self.layout.root.join(&self.store.node_data(node).name));
        let done_goal = if sig.exists() { NodeGoal::Dsk } else { NodeGoal::Status };
        let watchers = {
            let nri = self.store.node_req_info(node, req);
            nri.done_goal = nri.done_goal.max(done_goal);
            std::mem::take(&mut nri.watchers)
        };
        for watcher in watchers {
            self.job_make(watcher, req, MakeAction::Wakeup, JobReason::default(), Bool3::Yes, true);
        }
    }

    /// Instantiate a job's target nodes and static deps from its rule.
    pub fn init_job_instance(&mut self, job: JobIdx) {
        let (rule_idx, stems) = {
            let jd = self.store.job_data(job);
            (jd.rule, jd.stems.clone())
        };
        let (tgt_specs, dep_specs): (Vec<(String, Tflags)>, Vec<String>) = {
            let rule = self.store.rules.get(rule_idx);
            (
                rule.targets
                    .iter()
                    .filter_map(|t| t.pattern.subst(&stems).ok().map(|n| (n, t.tflags)))
                    .collect(),
                rule.deps.iter().filter_map(|d| d.pattern.subst(&stems).ok()).collect(),
            )
        };
        let mut targets = Vec::new();
        for (tn, tflags) in tgt_specs {
            let tnode = self.store.node(&tn);
            targets.push(Target {
                node: tnode,
                digest: crate::digest::TargetDigest { tflags, ..Default::default() },
            });
        }
        self.store.job_data_mut(job).targets = targets;
        if self.store.job_data(job).status == Status::New && self.store.job_data(job).deps.is_empty() {
            let mut deps = Vec::new();
            for dn in dep_specs {
                let dnode = self.store.node(&dn);
                deps.push(Dep {
                    node: dnode,
                    digest: crate::digest::DepDigest {
                        accesses: Accesses::FULL, // static deps will be read
                        dflags: Dflags::STATIC | Dflags::REQUIRED | Dflags::FULL,
                        ..Default::default()
                    },
                });
            }
            self.store.job_data_mut(job).deps = deps;
        }
    }

    // ─── Job make ─────────────────────────────────────────────

    /// The job state machine: analyze deps, decide to run/hit/requeue,
    /// submit, and propagate wakeups. After it returns, the job is either
    /// waiting (watchers registered) or done for this call.
    pub fn job_make(
        &mut self,
        job: JobIdx,
        req: ReqIdx,
        mut action: MakeAction,
        asked_reason: JobReason,
        speculate: Bool3,
        wakeup_watchers: bool,
    ) -> JobReason {
        let query = action == MakeAction::Query;
        let rule_idx = self.store.job_data(job).rule;
        let special = self.store.rules.get(rule_idx).special;
        let opts = self.tracker.get(req).map(|r| r.options.clone()).unwrap_or_default();
        let req_zombie = self.tracker.is_zombie(req);
        tracing::trace!(job = %self.store.job_data(job).full_name, ?action, "make");

        // entry normalization
        {
            let ri = self.store.job_req_info(job, req);
            match action {
                MakeAction::End => {
                    ri.reset(true); // deps have changed
                    ri.dec_wait();
                }
                MakeAction::Wakeup | MakeAction::GiveUp => ri.dec_wait(),
                MakeAction::Run | MakeAction::Query => {}
            }
            if asked_reason.any() {
                if ri.state.missing_dsk {
                    ri.reset(false); // restart analysis from scratch
                }
                ri.reason |= asked_reason;
            }
            ri.speculate = ri.speculate & speculate;
        }
        if action == MakeAction::GiveUp {
            return self.finish_done(job, req, wakeup_watchers);
        }

        'full: loop {
            let status = self.store.job_data(job).status;
            let forget_err = opts.forget_old_errors && self.store.job_data(job).err();
            let mut pre_reason =
                JobReason::new(mk_reason(if forget_err { Status::Ok } else { status }));
            if pre_reason.tag == JobReasonTag::Lost && action != MakeAction::End {
                pre_reason = JobReason::new(JobReasonTag::WasLost);
            }
            {
                let ri = self.store.c_job_req_info(job, req).expect("req info created above");
                if ri.done() {
                    let reason = self.full_reason(job, req, pre_reason);
                    if !reason.need_run() || req_zombie {
                        return self.finish_wakeup(job, req, pre_reason, wakeup_watchers);
                    }
                    // fall through to Run
                } else {
                    if ri.waiting() {
                        return self.full_reason(job, req, pre_reason);
                    }
                    if req_zombie {
                        return self.finish_done(job, req, wakeup_watchers);
                    }
                }
            }
            let frozen = self.frozen_jobs.contains(&job);
            let ri_done = self.store.c_job_req_info(job, req).map(|ri| ri.done()).unwrap_or(false);
            let go_run = ri_done
                || frozen
                || matches!(special, Special::InfiniteDep | Special::InfinitePath);
            if !go_run {
                // entering analysis
                if self.store.c_job_req_info(job, req).map(|ri| ri.step) == Some(JobStep::None) {
                    self.estimate_stats(job, req);
                    let cmd_ok = self.store.job_data(job).cmd_ok(&self.store.rules);
                    let rsrcs_ok = self.store.job_data(job).rsrcs_ok(&self.store.rules);
                    let was_err = self.store.job_data(job).err();
                    let force_rule = self.store.rules.get(rule_idx).force;
                    let jrt = if force_rule {
                        JobReasonTag::Force
                    } else if !cmd_ok {
                        JobReasonTag::Cmd
                    } else if forget_err {
                        JobReasonTag::OldErr // probably a transient error
                    } else if !rsrcs_ok && was_err {
                        JobReasonTag::Rsrcs // probably a resource error
                    } else {
                        JobReasonTag::None
                    };
                    let ri = self.store.job_req_info(job, req);
                    ri.step = JobStep::Dep;
                    if jrt != JobReasonTag::None || opts.force {
                        ri.reason |= JobReason::new(if opts.force { JobReasonTag::Force } else { jrt });
                        ri.force = true;
                        ri.state.proto_modif = true;
                        ri.state.stamped_modif = true;
                    }
                }
                match self.analyse_deps(job, req, pre_reason, query, &opts) {
                    AnalysisOutcome::Waiting(report) => return report,
                    AnalysisOutcome::QueryAnswer(report) => return report,
                    AnalysisOutcome::Done => return self.finish_done(job, req, wakeup_watchers),
                    AnalysisOutcome::Run => {}
                }
            }

            // Run branch
            let reason = self.full_reason(job, req, pre_reason);
            {
                let ri = self.store.job_req_info(job, req);
                ri.reason = reason;
            }
            if query && !special.is_special() && !frozen {
                return reason;
            }
            if self.store.c_job_req_info(job, req).map(|ri| ri.state.missing_dsk).unwrap_or(false) {
                self.store.job_req_info(job, req).reset(false);
                continue 'full; // cannot run while deps are missing on disk
            }
            self.inc_submit_counters(job, req, reason.tag, pre_reason.tag);
            if special.is_special() || frozen {
                self.submit_special(job, req, special, frozen);
                return self.finish_done(job, req, wakeup_watchers);
            }
            let pressure = {
                let ri = self.store.c_job_req_info(job, req).unwrap();
                ri.pressure
                    .saturating_add(CoarseDelay::from_millis((self.store.job_data(job).exe_time * 1000.0) as u64))
            };
            match self.submit_plain(job, req, reason, pressure, &opts) {
                Submitted::Waiting => {
                    return reason;
                }
                Submitted::CacheHit | Submitted::CacheMatch => {
                    // flash execution: restart analysis as if ended
                    let ri = self.store.job_req_info(job, req);
                    ri.reset(true);
                    ri.reason = JobReason::default();
                    action = MakeAction::End;
                    continue 'full;
                }
                Submitted::Done => {
                    return self.finish_done(job, req, wakeup_watchers);
                }
            }
        }
    }

    /// The merged reason: forced analyses weigh ri.reason above the dep
    /// loop's, otherwise dep state comes first.
    fn full_reason(&self, job: JobIdx, req: ReqIdx, pre_reason: JobReason) -> JobReason {
        let Some(ri) = self.store.c_job_req_info(job, req) else { return pre_reason };
        if ri.force {
            pre_reason | ri.reason | ri.state.reason
        } else {
            pre_reason | ri.state.reason | ri.reason
        }
    }

    fn estimate_stats(&mut self, job: JobIdx, _req: ReqIdx) {
        let jd = self.store.job_data_mut(job);
        if jd.cost == 0.0 {
            jd.cost = jd.exe_time.max(0.1); // waiting-cost guestimate before resources are known
        }
    }

    /// Keep counter increments in sync with the rule used by
    /// `no_run_decision` to exit the analysis.
    fn inc_submit_counters(&mut self, job: JobIdx, req: ReqIdx, reason_tag: JobReasonTag, pre_tag: JobReasonTag) {
        let lost = self.store.job_data(job).status.is_lost();
        let ri = self.store.job_req_info(job, req);
        if reason_tag.is_retry() {
            ri.n_retries += 1;
            return;
        }
        match pre_tag {
            JobReasonTag::Lost | JobReasonTag::WasLost => ri.n_losts += 1,
            JobReasonTag::Retry | JobReasonTag::LostRetry if lost => ri.n_retries += 1,
            _ => ri.n_submits += 1,
        }
    }

    /// Decide whether a runnable job must actually not run: loop bounds.
    fn no_run_decision(&self, job: JobIdx, req: ReqIdx, reason_tag: JobReasonTag, pre_tag: JobReasonTag) -> NoRunReason {
        match reason_tag {
            JobReasonTag::None => return NoRunReason::Dep,
            t if t.is_err() => return NoRunReason::Dep,
            _ => {}
        }
        let jd = self.store.job_data(job);
        let rule = self.store.rules.get(jd.rule);
        let ri = self.store.c_job_req_info(job, req).expect("analysis owns a req info");
        let opts = self.tracker.get(req).map(|r| &r.options);
        let req_retries = opts.map(|o| o.n_retries).unwrap_or(0);
        if reason_tag.is_retry() {
            return if ri.n_retries >= req_retries { NoRunReason::RetryLoop } else { NoRunReason::None };
        }
        match pre_tag {
            JobReasonTag::Lost | JobReasonTag::WasLost => {
                if ri.n_losts >= rule.n_losts {
                    NoRunReason::LostLoop
                } else {
                    NoRunReason::None
                }
            }
            _ => {
                if rule.n_runs > 0 && ri.n_runs >= rule.n_runs {
                    NoRunReason::RunLoopRule
                } else if rule.n_submits > 0 && ri.n_submits >= rule.n_submits {
                    NoRunReason::SubmitLoopRule
                } else if self.config.n_submits > 0 && ri.n_submits >= self.config.n_submits {
                    NoRunReason::SubmitLoopReq
                } else {
                    NoRunReason::None
                }
            }
        }
    }

    // ─── Dep analysis loop ────────────────────────────────────

    fn analyse_deps(
        &mut self,
        job: JobIdx,
        req: ReqIdx,
        pre_reason: JobReason,
        query: bool,
        opts: &crate::req::ReqOptions,
    ) -> AnalysisOutcome {
        'restart: loop {
            let deps: Vec<Dep> = self.store.job_data(job).deps.clone();
            let (mut state, start, force, dep_pressure, base_speculate) = {
                let ri = self.store.c_job_req_info(job, req).unwrap();
                (
                    ri.state,
                    ri.iter,
                    ri.force,
                    ri.pressure.saturating_add(CoarseDelay::from_millis(
                        (self.store.job_data(job).exe_time * 1000.0) as u64,
                    )),
                    ri.speculate,
                )
            };
            self.store.job_req_info(job, req).speculative_wait = false;
            let mut proto_seen_waiting = false;
            let mut stamped_seen_waiting = false;
            let mut critical_modif = false;
            let mut critical_waiting = false;
            let mut sure = true;
            let mut i = start;
            loop {
                let mut seen_all = i >= deps.len();
                let dep = if seen_all {
                    Dep { node: 0, digest: Default::default() } // sentinel, parallel=false
                } else {
                    deps[i]
                };
                if !dep.digest.parallel {
                    state.stamped_err = state.proto_err;
                    state.stamped_modif = state.proto_modif;
                    if critical_modif && !seen_all {
                        // suppress deps past a modified critical one,
                        // keeping static deps as no-access monitors
                        let mut kept: Vec<Dep> = deps[..i].to_vec();
                        let mut tail: Vec<Dep> = deps[i..]
                            .iter()
                            .filter(|d| d.digest.dflags.contains(Dflags::STATIC))
                            .map(|d| {
                                let mut d = *d;
                                d.digest.accesses = Accesses::NONE;
                                d
                            })
                            .collect();
                        seen_all = tail.is_empty();
                        kept.append(&mut tail);
                        if kept != deps {
                            // the snapshot is stale: re-walk the new list
                            self.store.job_data_mut(job).deps = kept;
                            if !proto_seen_waiting {
                                let ri = self.store.job_req_info(job, req);
                                ri.iter = i;
                                ri.state = state;
                            }
                            continue 'restart;
                        }
                    }
                    stamped_seen_waiting = proto_seen_waiting;
                    if query && (stamped_seen_waiting || state.stamped_modif || state.stamped_err != RunStatus::Ok) {
                        return AnalysisOutcome::QueryAnswer(self.full_reason_with(job, req, pre_reason, &state));
                    }
                }
                if !proto_seen_waiting {
                    let ri = self.store.job_req_info(job, req);
                    ri.iter = i; // fast path: next analysis restarts here
                    ri.state = state;
                }
                if seen_all || (!dep.digest.parallel && critical_waiting) {
                    break;
                }
                let dnode = dep.node;
                let is_static = dep.digest.dflags.contains(Dflags::STATIC);
                let required = dep.digest.dflags.contains(Dflags::REQUIRED);
                let sense_err = !dep.digest.dflags.contains(Dflags::IGNORE_ERROR);
                let is_critical = dep.digest.accesses.any() && dep.digest.dflags.contains(Dflags::CRITICAL);
                let modif = state.stamped_modif || force;
                let may_care = dep.digest.accesses.any() || (modif && is_static);
                let no_run = self.no_run_decision(job, req, self.full_reason_with(job, req, pre_reason, &state).tag, pre_reason.tag);
                let mut dep_goal = if query {
                    NodeGoal::Dsk
                } else if (may_care && no_run == NoRunReason::None) || opts.archive {
                    NodeGoal::Dsk
                } else if may_care || sense_err || is_static || required {
                    NodeGoal::Status
                } else {
                    NodeGoal::None
                };
                if dep_goal == NodeGoal::None {
                    i += 1;
                    continue;
                }
                let mut dep_err = RunStatus::Ok;
                let mut dep_modif = false;
                'redo_dep: loop {
                    let dep_waiting = self
                        .store
                        .c_node_req_info(dnode, req)
                        .map(|nri| nri.waiting())
                        .unwrap_or(false);
                    if !dep_waiting {
                        let speculate_dep = if is_static {
                            base_speculate // static deps do not disappear
                        } else if stamped_seen_waiting || modif {
                            Bool3::Yes // this dep may disappear
                        } else if state.stamped_err != RunStatus::Ok {
                            base_speculate | Bool3::Maybe // not the origin of the error
                        } else {
                            base_speculate
                        };
                        if special_asking(self.store.rules.get(self.store.job_data(job).rule).special) {
                            self.store.node_data_mut(dnode).asking = Some(job);
                        }
                        // appear waiting while recursing so loops are caught
                        self.store.job_req_info(job, req).inc_wait();
                        self.node_make(dnode, req, dep_goal, speculate_dep);
                        self.store.job_req_info(job, req).dec_wait();
                    }
                    if is_static && !self.store.node_data(dnode).buildable.is_sure() {
                        sure = false; // buildable is pessimistic, refined by analysis
                    }
                    let nri_waiting = self
                        .store
                        .c_node_req_info(dnode, req)
                        .map(|nri| nri.waiting())
                        .unwrap_or(false);
                    if nri_waiting {
                        {
                            let ri = self.store.job_req_info(job, req);
                            if is_static {
                                ri.speculative_wait = false; // non-speculative wait wins
                            } else if !stamped_seen_waiting && (state.stamped_err != RunStatus::Ok || modif) {
                                ri.speculative_wait = true;
                            }
                            ri.inc_wait();
                        }
                        proto_seen_waiting = true;
                        let pressure = dep_pressure;
                        let nri = self.store.node_req_info(dnode, req);
                        nri.watchers.push(job);
                        nri.pressure = nri.pressure.max(pressure);
                        critical_waiting |= is_critical;
                        break 'redo_dep;
                    }
                    let dep_done = self
                        .store
                        .c_node_req_info(dnode, req)
                        .map(|nri| nri.done(dep_goal))
                        .unwrap_or(false);
                    if !dep_done {
                        debug_assert!(query, "after make, a dep is either waiting or done");
                        proto_seen_waiting = true;
                        state.reason |= JobReason::with_node(JobReasonTag::DepOutOfDate, dnode);
                        break 'redo_dep;
                    }
                    let dsk_done = self
                        .store
                        .c_node_req_info(dnode, req)
                        .map(|nri| nri.done(NodeGoal::Dsk))
                        .unwrap_or(false);
                    let mut dep_missing_dsk = !query && may_care && !dsk_done;
                    state.missing_dsk |= dep_missing_dsk;
                    dep_modif = !node::dep_up_to_date(&self.store, dnode, &dep.digest, is_static && modif);
                    if dep_modif && self.store.job_data(job).status == Status::Ok && self.store.node_data(dnode).no_trigger {
                        // no_trigger only applies to successful jobs
                        if let Some(r) = self.tracker.get_mut(req) {
                            if !r.no_triggers.contains(&dnode) {
                                r.no_triggers.push(dnode);
                            }
                        }
                        dep_modif = false;
                    }
                    if state.stamped_err != RunStatus::Ok {
                        break 'redo_dep; // already in error, stop analyzing errors
                    }
                    if !is_static && modif {
                        break 'redo_dep; // errors may be washed by previous modifs
                    }
                    if dep_modif {
                        let never_match = matches!(dep.digest.info, DepInfo::Crc(c) if !c.valid());
                        if dep.digest.info.is_crc() && never_match {
                            state.reason |= JobReason::with_node(JobReasonTag::DepUnstable, dnode);
                        } else {
                            state.reason |= JobReason::with_node(JobReasonTag::DepOutOfDate, dnode);
                        }
                    }
                    let overwritten = self
                        .store
                        .c_node_req_info(dnode, req)
                        .map(|nri| (nri.overwritten & dep.digest.accesses).any())
                        .unwrap_or(false);
                    if may_care && overwritten {
                        state.reason |= JobReason::with_node(JobReasonTag::DepOverwritten, dnode);
                        dep_err = RunStatus::DepErr;
                        break 'redo_dep;
                    }
                    let mut ok = node::node_ok(&self.store, dnode);
                    if ok == Bool3::No && !sense_err {
                        ok = Bool3::Yes;
                    }
                    match ok {
                        Bool3::No => {
                            state.reason |= JobReason::with_node(JobReasonTag::DepErr, dnode);
                            dep_err = RunStatus::DepErr;
                        }
                        Bool3::Maybe => {
                            // dep is not buildable, check whether required
                            if node::is_transient(&self.store, &self.layout, dnode) {
                                state.reason |= JobReason::with_node(JobReasonTag::DepTransient, dnode);
                            } else if is_static {
                                state.reason |= JobReason::with_node(JobReasonTag::DepMissingStatic, dnode);
                                dep_err = RunStatus::MissingStatic;
                            } else if required {
                                state.reason |= JobReason::with_node(JobReasonTag::DepMissingRequired, dnode);
                                dep_err = RunStatus::DepErr;
                            } else if dep_goal == NodeGoal::Dsk {
                                self.manual_check(job, req, dnode, &mut state, &mut dep_err);
                            }
                        }
                        Bool3::Yes => {
                            if dep_goal == NodeGoal::Dsk {
                                self.manual_check(job, req, dnode, &mut state, &mut dep_err);
                            } else if dep_modif && !query && dep_missing_dsk {
                                // out of date and absent: ensure disk
                                // integrity for the detailed analysis
                                dep_goal = NodeGoal::Dsk;
                                dep_missing_dsk = false;
                                continue 'redo_dep;
                            }
                        }
                    }
                    break 'redo_dep;
                }
                // a needed dep is off disk while we have a reason to run:
                // restart the whole analysis asking for disk content
                let no_run = self.no_run_decision(job, req, self.full_reason_with(job, req, pre_reason, &state).tag, pre_reason.tag);
                if state.missing_dsk && no_run == NoRunReason::None {
                    debug_assert!(!query);
                    let ri = self.store.job_req_info(job, req);
                    ri.reason = state.reason;
                    ri.reset(false);
                    continue 'restart;
                }
                state.proto_err = state.proto_err.max(dep_err);
                state.proto_modif |= dep_modif;
                critical_modif |= dep_modif && is_critical;
                i += 1;
            }
            // loop done
            {
                let ri = self.store.job_req_info(job, req);
                ri.state = state;
            }
            if sure {
                // all static deps proved buildable: the targets are certain
                let targets = self.store.job_data(job).targets.clone();
                for t in targets {
                    let nd = self.store.node_data_mut(t.node);
                    if nd.buildable == Buildable::Maybe {
                        nd.buildable = Buildable::Yes;
                    }
                }
            }
            let waiting = self.store.c_job_req_info(job, req).unwrap().waiting();
            if waiting {
                return AnalysisOutcome::Waiting(self.full_reason_with(job, req, pre_reason, &state));
            }
            if state.stamped_err != RunStatus::Ok {
                self.store.job_data_mut(job).run_status = state.stamped_err;
                return AnalysisOutcome::Done;
            }
            self.store.job_data_mut(job).run_status = RunStatus::Ok;
            let reason = self.full_reason_with(job, req, pre_reason, &state);
            return match self.no_run_decision(job, req, reason.tag, pre_reason.tag) {
                NoRunReason::None => AnalysisOutcome::Run,
                NoRunReason::RetryLoop | NoRunReason::RunLoopReq | NoRunReason::RunLoopRule => {
                    self.store.job_data_mut(job).status = Status::RunLoop;
                    AnalysisOutcome::Done
                }
                NoRunReason::LostLoop => {
                    let jd = self.store.job_data_mut(job);
                    jd.status = if jd.status.is_early() { Status::EarlyLostErr } else { Status::LateLostErr };
                    AnalysisOutcome::Done
                }
                NoRunReason::SubmitLoopReq | NoRunReason::SubmitLoopRule => {
                    self.store.job_data_mut(job).status = Status::SubmitLoop;
                    AnalysisOutcome::Done
                }
                NoRunReason::Dep => AnalysisOutcome::Done,
            };
        }
    }

    fn full_reason_with(&self, job: JobIdx, req: ReqIdx, pre_reason: JobReason, state: &crate::store::AnalysisState) -> JobReason {
        let Some(ri) = self.store.c_job_req_info(job, req) else { return pre_reason };
        if ri.force {
            pre_reason | ri.reason | state.reason
        } else {
            pre_reason | state.reason | ri.reason
        }
    }

    /// Manual-overwrite check once a dep's disk content is needed.
    fn manual_check(&mut self, _job: JobIdx, req: ReqIdx, dnode: NodeIdx, state: &mut crate::store::AnalysisState, dep_err: &mut RunStatus) {
        if self.store.node_data(dnode).status == crate::types::NodeStatus::Src {
            return; // sources are refreshed, not manual
        }
        let manual = node::manual_state(&self.store, &self.layout, dnode);
        self.store.node_req_info(dnode, req).manual = manual;
        match manual {
            Manual::Empty | Manual::Modif => {
                state.reason |= JobReason::with_node(JobReasonTag::DepUnstable, dnode);
                *dep_err = RunStatus::DepErr;
            }
            Manual::Unlnked => {
                state.reason |= JobReason::with_node(JobReasonTag::DepUnlnked, dnode);
            }
            Manual::Ok => {}
        }
    }

    // ─── Submission ───────────────────────────────────────────

    /// Special jobs run synchronously, produce no new deps.
    fn submit_special(&mut self, job: JobIdx, req: ReqIdx, special: Special, frozen: bool) {
        match special {
            Special::Req => {
                let err = self.store.c_job_req_info(job, req).map(|ri| ri.state.stamped_err).unwrap_or(RunStatus::Ok);
                let jd = self.store.job_data_mut(job);
                jd.status = if err == RunStatus::Ok { Status::Ok } else { Status::Err };
                jd.run_status = err;
            }
            Special::InfiniteDep | Special::InfinitePath => {
                let deps: Vec<String> = {
                    let jd = self.store.job_data(job);
                    jd.deps.iter().map(|d| self.store.node_data(d.node).name.clone()).collect()
                };
                self.store.job_data_mut(job).status = Status::Err;
                if let Some(r) = self.tracker.get_mut(req) {
                    r.audit(AuditEvent::Failed {
                        job: "infinite".to_string(),
                        reason: "dependency recursion exceeds bound".to_string(),
                        stderr: deps.join("\n"),
                    });
                }
            }
            Special::Codec => {
                let res = self.codec_refresh(job);
                let jd = self.store.job_data_mut(job);
                jd.status = if res.is_ok() { Status::Ok } else { Status::Err };
                if let Err(e) = res {
                    if let Some(r) = self.tracker.get_mut(req) {
                        let name = self.store.job_data(job).full_name.clone();
                        r.audit(AuditEvent::Failed { job: name, reason: e.to_string(), stderr: String::new() });
                    }
                }
            }
            _ if frozen => {
                // frozen plain job: refresh target crcs from disk, error on
                // a missing non-phony target
                let targets = self.store.job_data(job).targets.clone();
                let mut ok = true;
                for t in targets {
                    let name = self.store.node_data(t.node).name.clone();
                    let path = self.layout.root.join(&name);
                    let crc = Crc::from_path(&path).unwrap_or(Crc::NONE);
                    let sig = FileSig::from_path(&path);
                    if !crc.exists() && !t.digest.tflags.contains(Tflags::PHONY) {
                        ok = false;
                    }
                    let nd = self.store.node_data_mut(t.node);
                    nd.crc = crc;
                    nd.sig = sig;
                    nd.actual_job = Some(job);
                }
                self.store.job_data_mut(job).status = if ok { Status::Ok } else { Status::Err };
                if let Some(r) = self.tracker.get_mut(req) {
                    if !r.frozen_jobs.contains(&job) {
                        r.frozen_jobs.push(job);
                    }
                }
            }
            _ => {}
        }
        self.store.job_req_info(job, req).step = JobStep::Done;
    }

    /// Queue a plain job on its backend, consulting the cache first.
    fn submit_plain(
        &mut self,
        job: JobIdx,
        req: ReqIdx,
        reason: JobReason,
        pressure: CoarseDelay,
        opts: &crate::req::ReqOptions,
    ) -> Submitted {
        // if already running for another req, replicate the pressure
        let running_reqs = self.store.running_reqs(job);
        if let Some(&other) = running_reqs.iter().find(|r| **r != req) {
            let (step, backend, live_out) = {
                let ori = self.store.c_job_req_info(job, other).unwrap();
                (ori.step, ori.backend.clone(), ori.live_out)
            };
            {
                let ri = self.store.job_req_info(job, req);
                ri.step = step;
                ri.backend = backend.clone();
                ri.inc_wait();
            }
            if step == JobStep::Exec {
                let name = self.store.job_data(job).full_name.clone();
                if let Some(r) = self.tracker.get_mut(req) {
                    r.audit(AuditEvent::Start { job: name });
                }
            }
            let attrs = SubmitAttrs { live_out, pressure, reason, ..Default::default() };
            if let Some(be) = self.backends.get(&backend) {
                be.add_pressure(job, req, attrs);
            }
            return Submitted::Waiting;
        }
        // targets will be needed; classify them now
        let targets = self.store.job_data(job).targets.clone();
        for t in &targets {
            node::set_buildable(&mut self.store, t.node);
        }
        // cache lookup
        let rule = self.store.rules.get(self.store.job_data(job).rule);
        let cache_name = if !opts.cache.is_empty() { Some(opts.cache.clone()) } else { rule.cache.clone() };
        let unique_name = rule.unique_name(&self.store.job_data(job).stems);
        let rule_backend = rule.backend.clone();
        let rule_rsrcs: BTreeMap<String, u64> = rule.rsrcs.clone();
        let tokens1 = self.store.job_data(job).tokens1;
        if let Some(cache_name) = cache_name.filter(|_| opts.cache_method.downloads()) {
            if let Some(cache) = self.caches.get(&cache_name).cloned() {
                let verdict = {
                    let store = &self.store;
                    cache.sub_match(&unique_name, &|dn, dd| {
                        let Some(n) = store.node_of(dn) else { return DepState::NotDone };
                        let done = store
                            .c_node_req_info(n, req)
                            .map(|nri| nri.done(NodeGoal::Status))
                            .unwrap_or(false);
                        if !done {
                            return DepState::NotDone;
                        }
                        let crc = store.node_data(n).crc;
                        match dd.info.crc() {
                            Some(c) if c.matches(crc, Accesses::FULL) => DepState::Match,
                            Some(_) => DepState::Mismatch,
                            None => DepState::Mismatch,
                        }
                    })
                };
                match verdict {
                    Ok(CacheMatch::Hit { run }) => {
                        if let Some(out) = self.try_cache_hit(job, req, &cache_name, &unique_name, &run, reason) {
                            return out;
                        } // download failure falls through to a normal run
                    }
                    Ok(CacheMatch::Match { new_deps }) => {
                        let mut deps = Vec::new();
                        for dn in &new_deps {
                            let n = self.store.node(dn);
                            deps.push(Dep {
                                node: n,
                                digest: crate::digest::DepDigest {
                                    accesses: Accesses::FULL,
                                    dflags: Dflags::FULL,
                                    ..Default::default()
                                },
                            });
                        }
                        self.store.job_data_mut(job).deps = deps;
                        self.store.job_data_mut(job).status = Status::CacheMatch;
                        self.store.job_data_mut(job).cache_hit_info = CacheHitInfo::Match;
                        tracing::debug!(job = %unique_name, ?new_deps, "cache reported new deps");
                        return Submitted::CacheMatch;
                    }
                    Ok(CacheMatch::Miss) => {
                        self.store.job_data_mut(job).cache_hit_info = CacheHitInfo::Miss;
                    }
                    Err(e) => {
                        tracing::warn!(job = %unique_name, "cache match failed: {e}");
                    }
                }
            }
        }
        // submit to the backend
        {
            let ri = self.store.job_req_info(job, req);
            ri.inc_wait(); // set before submitting: flash execution must find us clean
            ri.step = JobStep::Queued;
            ri.backend = rule_backend.clone();
        }
        let attrs = SubmitAttrs {
            reason,
            pressure,
            tokens1,
            live_out: self.store.c_job_req_info(job, req).map(|ri| ri.live_out).unwrap_or(false),
            nice: opts.nice,
            ..Default::default()
        };
        let Some(be) = self.backends.get(&rule_backend).cloned() else {
            return self.submit_failed(job, req, format!("no backend {rule_backend}"));
        };
        if let Err(e) = be.submit(job, req, attrs, &rule_rsrcs) {
            return self.submit_failed(job, req, e.to_string());
        }
        for t in &targets {
            self.store.node_data_mut(t.node).busy = true; // owned once submitted
        }
        tracing::debug!(job = %self.store.job_data(job).full_name, "submitted");
        Submitted::Waiting
    }

    fn submit_failed(&mut self, job: JobIdx, req: ReqIdx, msg: String) -> Submitted {
        {
            let ri = self.store.job_req_info(job, req);
            ri.dec_wait();
            ri.step = JobStep::None;
        }
        self.store.job_data_mut(job).status = Status::EarlyErr;
        let name = self.store.job_data(job).full_name.clone();
        if let Some(r) = self.tracker.get_mut(req) {
            r.audit(AuditEvent::Failed { job: name, reason: msg, stderr: String::new() });
        }
        Submitted::Done
    }

    /// Serve the job from the cache: install targets, register the
    /// synthetic start/end, account the hit.
    fn try_cache_hit(
        &mut self,
        job: JobIdx,
        req: ReqIdx,
        cache_name: &str,
        unique_name: &str,
        run: &str,
        reason: JobReason,
    ) -> Option<Submitted> {
        let cache = self.caches.get(cache_name).cloned()?;
        let (mut job_info, target_data) = match cache.sub_download(unique_name, run) {
            Ok(x) => x,
            Err(e) => {
                tracing::warn!(job = unique_name, "cache download failed, treating as miss: {e}");
                return None;
            }
        };
        // wash targets that would be clobbered
        let targets = self.store.job_data(job).targets.clone();
        for t in &targets {
            let name = self.store.node_data(t.node).name.clone();
            let path = self.layout.root.join(&name);
            if FileSig::from_path(&path).exists() && self.store.node_data(t.node).polluted != Polluted::Clean {
                let job_name = self.store.job_data(job).full_name.clone();
                if let Some(r) = self.tracker.get_mut(req) {
                    r.audit(AuditEvent::Wash { job: job_name });
                }
            }
        }
        if let Err(e) = crate::cache::install_targets(&self.layout.root, &job_info, &target_data) {
            tracing::warn!(job = unique_name, "cache install failed, treating as miss: {e}");
            return None;
        }
        // synthetic start/end: local id and current reason are repo-local
        job_info.start.job = job;
        job_info.start.reason = reason;
        job_info.end.job = job;
        job_info.end.end_date = now_ms();
        for (tn, td) in &mut job_info.end.digest.targets {
            td.sig = FileSig::from_path(&self.layout.root.join(tn.as_str())); // target dates are local
        }
        self.write_job_info(job, &job_info);
        let end = job_info.end.clone();
        self.store.job_data_mut(job).cache_hit_info = CacheHitInfo::Hit;
        self.store.job_req_info(job, req).step = JobStep::Hit;
        self.job_end_apply(&end);
        let name = self.store.job_data(job).full_name.clone();
        let exe_time = self.store.job_data(job).exe_time;
        if let Some(r) = self.tracker.get_mut(req) {
            r.stats.add(JobReport::Hit, exe_time);
            r.missing_audits.insert(job, JobAudit { report: JobReport::Hit, backend_msg: String::new() });
            r.audit(AuditEvent::Hit { job: name, verb: "done".to_string() });
        }
        tracing::info!(job = unique_name, run, "cache hit");
        Some(Submitted::CacheHit)
    }

    // ─── End analysis ─────────────────────────────────────────

    /// Apply a finished run to the store: replace deps atomically, update
    /// target nodes, detect clashes, clear hot-dep crcs, set statuses.
    pub fn job_end_apply(&mut self, end: &JobEndRpcReq) {
        let job = end.job;
        let end_date = end.end_date;
        // targets
        let mut clashes: Vec<(NodeIdx, JobIdx)> = Vec::new();
        let mut new_targets = Vec::new();
        for (tn, td) in &end.digest.targets {
            let tnode = self.store.node(tn);
            {
                let nd = self.store.node_data_mut(tnode);
                if td.written {
                    if let Some(prev) = nd.actual_job {
                        if prev != job && nd.busy {
                            clashes.push((tnode, prev)); // two jobs wrote it in this build
                        }
                    }
                    nd.actual_job = Some(job);
                    nd.actual_tflags = td.tflags;
                    nd.polluted = if td.pre_exist { Polluted::PreExist } else { Polluted::Clean };
                }
                nd.crc = td.crc;
                nd.sig = td.sig;
                nd.busy = false;
            }
            new_targets.push(Target { node: tnode, digest: *td });
        }
        // deps, replaced atomically; hot deps lose their crc so the next
        // analysis re-evaluates them
        let ddate_prec = self.config.ddate_prec_ns;
        let mut new_deps = Vec::new();
        for (dn, dd) in &end.digest.deps {
            let dnode = self.store.node(dn);
            let mut digest = *dd;
            let sig = self.store.node_data(dnode).sig;
            if digest.hot || node::is_hot(sig, end_date, ddate_prec) {
                digest.hot = true;
                digest.info = DepInfo::Crc(Crc::UNKNOWN);
            }
            new_deps.push(Dep { node: dnode, digest });
        }
        {
            let jd = self.store.job_data_mut(job);
            jd.deps = new_deps;
            if !new_targets.is_empty() {
                jd.targets = new_targets;
            }
            jd.status = end.digest.status;
            jd.exe_time = end.digest.exe_time;
            jd.cost = end.digest.exe_time;
            jd.run_status = RunStatus::Ok;
        }
        for (tnode, prev) in clashes {
            let name = self.store.node_data(tnode).name.clone();
            let writers = vec![
                self.store.job_data(prev).full_name.clone(),
                self.store.job_data(job).full_name.clone(),
            ];
            tracing::warn!(target = %name, "clash: multiple simultaneous writes");
            for r in self.tracker.iter_mut() {
                if !r.clash_nodes.contains(&tnode) {
                    r.clash_nodes.push(tnode);
                    r.audit(AuditEvent::ClashTarget { path: name.clone(), jobs: writers.clone() });
                }
            }
            // force both writers to rerun
            let asked = JobReason::with_node(JobReasonTag::ClashTarget, tnode);
            for j in [prev, job] {
                for (rq, _) in self.store.jobs[j as usize].req_info.clone() {
                    self.store.job_req_info(j, rq).reason |= asked;
                }
            }
        }
    }

    /// Deferred-audit + watcher propagation once a job settles.
    fn finish_done(&mut self, job: JobIdx, req: ReqIdx, wakeup_watchers: bool) -> JobReason {
        {
            let ri = self.store.job_req_info(job, req);
            debug_assert!(!ri.waiting(), "done with pending work");
            ri.step = JobStep::Done;
            ri.reason = JobReason::default();
        }
        self.finish_wakeup(job, req, JobReason::default(), wakeup_watchers)
    }

    fn finish_wakeup(&mut self, job: JobIdx, req: ReqIdx, pre_reason: JobReason, wakeup_watchers: bool) -> JobReason {
        let zombie = self.tracker.is_zombie(req);
        let audit = self.tracker.get(req).map(|r| r.missing_audits.contains_key(&job)).unwrap_or(false);
        if audit && !zombie {
            let status = self.store.job_data(job).status;
            let name = self.store.job_data(job).full_name.clone();
            let exe_time = self.store.job_data(job).exe_time;
            let reason = self.full_reason(job, req, pre_reason);
            if let Some(r) = self.tracker.get_mut(req) {
                if let Some(ja) = r.missing_audits.remove(&job) {
                    if ja.report != JobReport::Hit {
                        // the job was rerun; re-classify the provisional account
                        r.stats.move_report(JobReport::Rerun, ja.report);
                        r.stats.useful_s += exe_time;
                    }
                    if status != Status::SubmitLoop {
                        let verb = match ja.report {
                            JobReport::Done => "done",
                            JobReport::Steady => "steady",
                            JobReport::Failed => "failed",
                            JobReport::Hit => "done",
                            JobReport::Rerun => "rerun",
                            JobReport::Killed => "killed",
                        };
                        if ja.report == JobReport::Hit {
                            r.audit(AuditEvent::Hit { job: name.clone(), verb: verb.to_string() });
                        } else {
                            r.audit(AuditEvent::Was { job: name.clone(), verb: verb.to_string() });
                        }
                    }
                    if reason.tag.is_err() {
                        r.audit(AuditEvent::Failed {
                            job: name,
                            reason: reason.user_str().to_string(),
                            stderr: String::new(),
                        });
                    }
                }
            }
        }
        let done = self.store.c_job_req_info(job, req).map(|ri| ri.done()).unwrap_or(false);
        if done && wakeup_watchers {
            let watchers = std::mem::take(&mut self.store.job_req_info(job, req).watchers);
            for node in watchers {
                let still_waiting = {
                    let nri = self.store.node_req_info(node, req);
                    debug_assert!(nri.n_wait > 0);
                    nri.n_wait -= 1;
                    nri.waiting()
                };
                if !still_waiting {
                    // the node may need another candidate or is now done
                    let run_status = self.store.job_data(job).run_status;
                    if run_status == RunStatus::MissingStatic {
                        let goal = self.store.c_node_req_info(node, req).map(|nri| nri.goal).unwrap_or(NodeGoal::Status);
                        self.node_make(node, req, goal, Bool3::Yes);
                        let waiting = self.store.c_node_req_info(node, req).map(|n| n.waiting()).unwrap_or(false);
                        if !waiting {
                            self.node_done(node, req);
                        }
                    } else {
                        self.node_done(node, req);
                    }
                }
            }
        }
        self.full_reason(job, req, pre_reason)
    }
}

fn special_asking(special: Special) -> bool {
    special != Special::Req // Req jobs are fugitive, dont record them
}

enum AnalysisOutcome {
    /// Suspended; watchers registered.
    Waiting(JobReason),
    /// Query mode got its answer without going further.
    QueryAnswer(JobReason),
    /// Analysis complete, nothing to run.
    Done,
    /// The job must run.
    Run,
}
