use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::digest::{Crc, DepDigest, FileSig, TargetDigest};
use crate::matching::{MatchTab, RuleTgt};
use crate::rules::{RuleCrc, RuleSet};
use crate::types::{
    Bool3, Buildable, CacheHitInfo, CoarseDelay, JobIdx, JobReason, JobStep, Manual, MatchGen,
    NodeIdx, NodeStatus, Polluted, ReqIdx, RunStatus, Status, Tflags, Tokens1,
};

// ─── Per-req analysis state ───────────────────────────────────

/// What a requester needs from a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeGoal {
    #[default]
    None,
    /// Build status is enough.
    Status,
    /// Content must be present on disk.
    Dsk,
}

/// Per-(node, req) analysis state.
#[derive(Clone, Debug, Default)]
pub struct NodeReqInfo {
    pub goal: NodeGoal,
    /// Highest goal proven reached for this req.
    pub done_goal: NodeGoal,
    pub n_wait: u32,
    /// Jobs to wake when this node resolves.
    pub watchers: Vec<JobIdx>,
    pub manual: Manual,
    /// Accesses through which the node was observed overwritten.
    pub overwritten: crate::types::Accesses,
    pub speculate: Bool3,
    pub live_out: bool,
    pub pressure: CoarseDelay,
}

impl NodeReqInfo {
    pub fn waiting(&self) -> bool {
        self.n_wait > 0
    }

    pub fn done(&self, goal: NodeGoal) -> bool {
        self.done_goal >= goal
    }
}

/// The dual error/modif accumulators of the dep-analysis loop. `proto`
/// accumulates inside a parallel group; it is stamped on each non-parallel
/// boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AnalysisState {
    pub proto_err: RunStatus,
    pub stamped_err: RunStatus,
    pub proto_modif: bool,
    pub stamped_modif: bool,
    pub reason: JobReason,
    /// A needed dep is absent from disk: analysis must restart with Dsk goal.
    pub missing_dsk: bool,
}

/// Per-(job, req) analysis state.
#[derive(Clone, Debug, Default)]
pub struct JobReqInfo {
    pub step: JobStep,
    /// Resume cursor in the dep list.
    pub iter: usize,
    pub state: AnalysisState,
    pub n_wait: u32,
    pub n_submits: u32,
    pub n_retries: u32,
    pub n_losts: u32,
    pub n_runs: u32,
    pub speculate: Bool3,
    /// Waiting only because of deps whose error was speculatively ignored.
    pub speculative_wait: bool,
    pub live_out: bool,
    pub reported: bool,
    pub reason: JobReason,
    pub force: bool,
    pub pressure: CoarseDelay,
    /// Nodes to wake when this job resolves.
    pub watchers: Vec<NodeIdx>,
    pub backend: String,
}

impl JobReqInfo {
    pub fn new() -> Self {
        JobReqInfo { speculate: Bool3::Yes, ..Default::default() }
    }

    pub fn waiting(&self) -> bool {
        self.n_wait > 0
    }

    pub fn running(&self) -> bool {
        matches!(self.step, JobStep::Queued | JobStep::Exec)
    }

    pub fn done(&self) -> bool {
        self.step == JobStep::Done
    }

    pub fn inc_wait(&mut self) {
        self.n_wait += 1;
    }

    pub fn dec_wait(&mut self) {
        debug_assert!(self.n_wait > 0);
        self.n_wait = self.n_wait.saturating_sub(1);
    }

    /// Restart analysis from scratch, optionally accounting a completed run.
    pub fn reset(&mut self, has_run: bool) {
        if has_run {
            self.n_runs += 1;
        }
        self.step = JobStep::None;
        self.iter = 0;
        self.state = AnalysisState::default();
        self.force = false;
        self.reason = JobReason::default();
    }
}

// ─── Entities ─────────────────────────────────────────────────

/// A dep as recorded on a job: node reference + digest.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dep {
    pub node: NodeIdx,
    pub digest: DepDigest,
}

/// A target slot of a job.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub node: NodeIdx,
    pub digest: TargetDigest,
}

/// A filesystem path. Created lazily on first mention, never deleted;
/// stale classification is detected through `match_gen`.
#[derive(Clone, Debug, Default)]
pub struct NodeData {
    pub name: String,
    pub dir: Option<NodeIdx>,
    pub crc: Crc,
    pub sig: FileSig,
    pub buildable: Buildable,
    pub status: NodeStatus,
    /// Generation at which `buildable`/candidates were last computed.
    pub match_gen: MatchGen,
    /// Ordered candidate rules, valid while `match_gen` is current.
    pub rule_tgts: Vec<RuleTgt>,
    /// The job that actually produced the current content.
    pub actual_job: Option<JobIdx>,
    pub actual_tflags: Tflags,
    /// The job selected by matching to (re)build this node.
    pub conform_job: Option<JobIdx>,
    pub polluted: Polluted,
    /// A submitted job owns this target until it ends.
    pub busy: bool,
    /// Modifications of this node do not trigger reruns of successful jobs.
    pub no_trigger: bool,
    /// Back-link to the last job that asked for this node.
    pub asking: Option<JobIdx>,
    pub req_info: Vec<(ReqIdx, NodeReqInfo)>,
}

/// An (effective-rule, matched-stems) instance producing targets.
#[derive(Clone, Debug)]
pub struct JobData {
    /// Rule-encoded full name; uniquifies the job.
    pub full_name: String,
    pub rule: crate::types::RuleIdx,
    pub rule_crc: RuleCrc,
    pub stems: Vec<Option<String>>,
    /// Ordered by discovery; replaced atomically on End.
    pub deps: Vec<Dep>,
    pub targets: Vec<Target>,
    pub status: Status,
    pub run_status: RunStatus,
    /// Cumulated cost estimate used for pressure.
    pub cost: f64,
    /// Seconds of the last execution.
    pub exe_time: f64,
    pub stats_weight: u32,
    pub tokens1: Tokens1,
    pub cache_hit_info: CacheHitInfo,
    pub backend: String,
    pub req_info: Vec<(ReqIdx, JobReqInfo)>,
}

impl JobData {
    pub fn err(&self) -> bool {
        self.status.ok() == Bool3::No || !self.run_status.is_ok()
    }

    /// Command fingerprint still matches the rule's current one.
    pub fn cmd_ok(&self, rules: &RuleSet) -> bool {
        self.rule_crc.cmd_crc == rules.get(self.rule).crc.cmd_crc
    }

    pub fn rsrcs_ok(&self, rules: &RuleSet) -> bool {
        self.rule_crc.rsrcs_crc == rules.get(self.rule).crc.rsrcs_crc
    }
}

// ─── Store ────────────────────────────────────────────────────

/// The engine's single-writer in-memory image: arenas, interning maps,
/// rules and match tables, and the match generation.
#[derive(Debug, Default)]
pub struct Store {
    pub nodes: Vec<NodeData>,
    pub jobs: Vec<JobData>,
    node_names: HashMap<String, NodeIdx>,
    job_names: HashMap<String, JobIdx>,
    pub match_gen: MatchGen,
    pub rules: RuleSet,
    pub match_tab: MatchTab,
    /// True when the repo is read-only: loads happen, saves are skipped.
    pub read_only: bool,
}

impl Store {
    pub fn new(rules: RuleSet) -> Store {
        let match_tab = MatchTab::compile(&rules);
        Store { rules, match_tab, match_gen: 1, ..Default::default() }
    }

    // ── Nodes ──

    /// Intern a node by name, creating it (and its dir chain) on first
    /// mention.
    pub fn node(&mut self, name: &str) -> NodeIdx {
        if let Some(&idx) = self.node_names.get(name) {
            return idx;
        }
        let dir = match name.rfind('/') {
            Some(pos) if pos > 0 => Some(self.node(&name[..pos])),
            _ => None,
        };
        let idx = self.nodes.len() as NodeIdx;
        self.nodes.push(NodeData { name: name.to_string(), dir, ..Default::default() });
        self.node_names.insert(name.to_string(), idx);
        idx
    }

    pub fn node_of(&self, name: &str) -> Option<NodeIdx> {
        self.node_names.get(name).copied()
    }

    pub fn node_data(&self, idx: NodeIdx) -> &NodeData {
        &self.nodes[idx as usize]
    }

    pub fn node_data_mut(&mut self, idx: NodeIdx) -> &mut NodeData {
        &mut self.nodes[idx as usize]
    }

    /// Node classification is current iff its gen equals the global one.
    pub fn node_fresh(&self, idx: NodeIdx) -> bool {
        self.nodes[idx as usize].match_gen == self.match_gen
    }

    pub fn node_req_info(&mut self, idx: NodeIdx, req: ReqIdx) -> &mut NodeReqInfo {
        let nd = &mut self.nodes[idx as usize];
        if let Some(pos) = nd.req_info.iter().position(|(r, _)| *r == req) {
            return &mut nd.req_info[pos].1;
        }
        nd.req_info.push((req, NodeReqInfo::default()));
        &mut nd.req_info.last_mut().unwrap().1
    }

    pub fn c_node_req_info(&self, idx: NodeIdx, req: ReqIdx) -> Option<&NodeReqInfo> {
        self.nodes[idx as usize].req_info.iter().find(|(r, _)| *r == req).map(|(_, i)| i)
    }

    // ── Jobs ──

    /// Intern a job by its rule-encoded full name.
    pub fn job(&mut self, full_name: &str, rule: crate::types::RuleIdx, stems: Vec<Option<String>>) -> JobIdx {
        if let Some(&idx) = self.job_names.get(full_name) {
            return idx;
        }
        let rule_crc = self.rules.get(rule).crc;
        let backend = self.rules.get(rule).backend.clone();
        let idx = self.jobs.len() as JobIdx;
        self.jobs.push(JobData {
            full_name: full_name.to_string(),
            rule,
            rule_crc,
            stems,
            deps: Vec::new(),
            targets: Vec::new(),
            status: Status::New,
            run_status: RunStatus::Ok,
            cost: 0.0,
            exe_time: 0.0,
            stats_weight: 0,
            tokens1: 0,
            cache_hit_info: CacheHitInfo::None,
            backend,
            req_info: Vec::new(),
        });
        self.job_names.insert(full_name.to_string(), idx);
        idx
    }

    pub fn job_of(&self, full_name: &str) -> Option<JobIdx> {
        self.job_names.get(full_name).copied()
    }

    pub fn job_data(&self, idx: JobIdx) -> &JobData {
        &self.jobs[idx as usize]
    }

    pub fn job_data_mut(&mut self, idx: JobIdx) -> &mut JobData {
        &mut self.jobs[idx as usize]
    }

    pub fn job_req_info(&mut self, idx: JobIdx, req: ReqIdx) -> &mut JobReqInfo {
        let jd = &mut self.jobs[idx as usize];
        if let Some(pos) = jd.req_info.iter().position(|(r, _)| *r == req) {
            return &mut jd.req_info[pos].1;
        }
        jd.req_info.push((req, JobReqInfo::new()));
        &mut jd.req_info.last_mut().unwrap().1
    }

    pub fn c_job_req_info(&self, idx: JobIdx, req: ReqIdx) -> Option<&JobReqInfo> {
        self.jobs[idx as usize].req_info.iter().find(|(r, _)| *r == req).map(|(_, i)| i)
    }

    /// Reqs for which the job is currently queued or executing.
    pub fn running_reqs(&self, idx: JobIdx) -> Vec<ReqIdx> {
        self.jobs[idx as usize]
            .req_info
            .iter()
            .filter(|(_, ri)| ri.running())
            .map(|(r, _)| *r)
            .collect()
    }

    // ── Match generation ──

    /// Invalidate every node classification at once. On overflow, walk all
    /// nodes and restart from 1.
    pub fn bump_match_gen(&mut self) {
        match self.match_gen.checked_add(1) {
            Some(g) => self.match_gen = g,
            None => {
                for n in &mut self.nodes {
                    n.match_gen = 0;
                }
                self.match_gen = 1;
            }
        }
        tracing::debug!(gen = self.match_gen, "bumped match generation");
    }

    /// Install a new rule set (static reload): recompile the match tables
    /// and invalidate all nodes.
    pub fn set_rules(&mut self, rules: RuleSet) {
        self.match_tab = MatchTab::compile(&rules);
        self.rules = rules;
        self.bump_match_gen();
    }

    /// Drop all per-req state for a closed req.
    pub fn forget_req(&mut self, req: ReqIdx) {
        for n in &mut self.nodes {
            n.req_info.retain(|(r, _)| *r != req);
        }
        for j in &mut self.jobs {
            j.req_info.retain(|(r, _)| *r != req);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Manifest;

    fn store() -> Store {
        let m = Manifest::parse(
            r#"
sources: ["in"]
rules:
  - name: copy
    targets: { out: "out" }
    deps: { src: "in" }
    cmd: "cp in out"
"#,
        )
        .unwrap();
        Store::new(RuleSet::compile(&m).unwrap())
    }

    #[test]
    fn node_interning_creates_dir_chain() {
        let mut s = store();
        let n = s.node("a/b/c");
        assert_eq!(s.node_data(n).name, "a/b/c");
        let b = s.node_data(n).dir.unwrap();
        assert_eq!(s.node_data(b).name, "a/b");
        let a = s.node_data(b).dir.unwrap();
        assert_eq!(s.node_data(a).name, "a");
        assert_eq!(s.node_data(a).dir, None);
        // second mention returns the same idx
        assert_eq!(s.node("a/b/c"), n);
        assert_eq!(s.nodes.len(), 3);
    }

    #[test]
    fn match_gen_bump_staleness() {
        let mut s = store();
        let n = s.node("out");
        s.node_data_mut(n).match_gen = s.match_gen;
        assert!(s.node_fresh(n));
        s.bump_match_gen();
        assert!(!s.node_fresh(n));
    }

    #[test]
    fn match_gen_overflow_resets_all() {
        let mut s = store();
        let n = s.node("out");
        s.match_gen = MatchGen::MAX;
        s.node_data_mut(n).match_gen = MatchGen::MAX;
        s.bump_match_gen();
        assert_eq!(s.match_gen, 1);
        assert_eq!(s.node_data(n).match_gen, 0);
        assert!(!s.node_fresh(n));
    }

    #[test]
    fn req_info_is_per_req() {
        let mut s = store();
        let j = s.job("copy:", 0, vec![]);
        s.job_req_info(j, 0).n_wait = 2;
        s.job_req_info(j, 1).n_wait = 5;
        assert_eq!(s.c_job_req_info(j, 0).unwrap().n_wait, 2);
        assert_eq!(s.c_job_req_info(j, 1).unwrap().n_wait, 5);
        s.forget_req(0);
        assert!(s.c_job_req_info(j, 0).is_none());
        assert!(s.c_job_req_info(j, 1).is_some());
    }
}
