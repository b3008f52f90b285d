use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{CacheMethod, JobIdx, JobReport, NodeIdx, ReqIdx, Timestamp};

// ─── Options ──────────────────────────────────────────────────

/// Per-invocation flags, as given on the command line.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqOptions {
    pub live_out: bool,
    pub verbose: bool,
    /// Machine-readable output.
    pub porcelaine: bool,
    /// Ensure every dep is on disk, not just up to date.
    pub archive: bool,
    pub force: bool,
    pub no_incremental: bool,
    pub forget_old_errors: bool,
    pub keep_tmp: bool,
    /// -j limit; 0 = unbounded.
    pub n_jobs: u32,
    /// Retries after an error for this invocation.
    pub n_retries: u32,
    pub nice: u8,
    pub cache_method: CacheMethod,
    /// Cache name to use; empty = rule's choice.
    pub cache: String,
}

// ─── Stats ────────────────────────────────────────────────────

/// Per-req accounting by report kind plus resource totals.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReqStats {
    counts: HashMap<JobReport, u32>,
    pub cpu_s: f64,
    pub elapsed_s: f64,
    pub mem_b: u64,
    pub useful_s: f64,
}

impl ReqStats {
    pub fn add(&mut self, report: JobReport, exe_time_s: f64) {
        *self.counts.entry(report).or_insert(0) += 1;
        self.useful_s += exe_time_s;
    }

    /// Re-classify a previously accounted run (e.g. Rerun -> Done once the
    /// deferred audit fires).
    pub fn move_report(&mut self, from: JobReport, to: JobReport) {
        if let Some(c) = self.counts.get_mut(&from) {
            *c = c.saturating_sub(1);
        }
        *self.counts.entry(to).or_insert(0) += 1;
    }

    pub fn count(&self, report: JobReport) -> u32 {
        self.counts.get(&report).copied().unwrap_or(0)
    }
}

// ─── Audit stream ─────────────────────────────────────────────

/// One line of the user-facing report stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AuditEvent {
    Start { job: String },
    Retry { job: String, reason: String },
    Continue { job: String },
    /// Result served from cache; prefix carries the original verb.
    Hit { job: String, verb: String },
    /// Deferred report for a job that was rerun.
    Was { job: String, verb: String },
    Wash { job: String },
    Quarantine { path: String },
    Rerun { job: String, reason: String },
    Done { job: String },
    Steady { job: String },
    Failed { job: String, reason: String, stderr: String },
    Killed { job: String },
    LiveOut { job: String, txt: String },
    Note { txt: String },
    ClashTarget { path: String, jobs: Vec<String> },
}

impl AuditEvent {
    /// Render the audit line the way the console shows it.
    pub fn render(&self) -> String {
        match self {
            AuditEvent::Start { job } => format!("start      {job}"),
            AuditEvent::Retry { job, reason } => format!("retry      {job} ({reason})"),
            AuditEvent::Continue { job } => format!("continue   {job}"),
            AuditEvent::Hit { job, verb } => format!("hit_{verb:<6} {job}"),
            AuditEvent::Was { job, verb } => format!("was_{verb:<6} {job}"),
            AuditEvent::Wash { job } => format!("wash       {job}"),
            AuditEvent::Quarantine { path } => format!("quarantine {path}"),
            AuditEvent::Rerun { job, reason } => format!("rerun      {job} ({reason})"),
            AuditEvent::Done { job } => format!("done       {job}"),
            AuditEvent::Steady { job } => format!("steady     {job}"),
            AuditEvent::Failed { job, reason, .. } => format!("failed     {job} ({reason})"),
            AuditEvent::Killed { job } => format!("killed     {job}"),
            AuditEvent::LiveOut { job: _, txt } => txt.clone(),
            AuditEvent::Note { txt } => format!("note       {txt}"),
            AuditEvent::ClashTarget { path, jobs } => {
                format!("clash      {path} written by {}", jobs.join(" & "))
            }
        }
    }
}

/// Deferred audit recorded while a job result is provisional.
#[derive(Clone, Debug, PartialEq)]
pub struct JobAudit {
    pub report: JobReport,
    pub backend_msg: String,
}

// ─── Req ──────────────────────────────────────────────────────

/// An open build invocation.
#[derive(Debug)]
pub struct Req {
    pub idx: ReqIdx,
    pub key: String,
    pub options: ReqOptions,
    pub targets: Vec<NodeIdx>,
    /// The pseudo-job whose deps are the req targets.
    pub job: Option<JobIdx>,
    pub stats: ReqStats,
    /// Jobs whose report is deferred until their wakeup.
    pub missing_audits: HashMap<JobIdx, JobAudit>,
    /// Deps whose modification was masked by a no-trigger flag, in
    /// discovery order for the summary.
    pub no_triggers: Vec<NodeIdx>,
    pub frozen_jobs: Vec<JobIdx>,
    /// Nodes written by two jobs in this invocation.
    pub clash_nodes: Vec<NodeIdx>,
    pub eta: Timestamp,
    /// Kill requested but teardown not complete.
    pub zombie: bool,
    pub done: bool,
    pub audit: Vec<AuditEvent>,
}

impl Req {
    pub fn audit(&mut self, ev: AuditEvent) {
        tracing::debug!(req = self.idx, line = %ev.render(), "audit");
        self.audit.push(ev);
    }
}

/// Open/close requests and keep their accumulators.
#[derive(Debug, Default)]
pub struct ReqTracker {
    reqs: Vec<Option<Req>>,
}

impl ReqTracker {
    pub fn open(&mut self, options: ReqOptions, eta: Timestamp) -> ReqIdx {
        let idx = match self.reqs.iter().position(|r| r.is_none()) {
            Some(i) => i,
            None => {
                self.reqs.push(None);
                self.reqs.len() - 1
            }
        } as ReqIdx;
        self.reqs[idx as usize] = Some(Req {
            idx,
            key: uuid::Uuid::now_v7().to_string(),
            options,
            targets: Vec::new(),
            job: None,
            stats: ReqStats::default(),
            missing_audits: HashMap::new(),
            no_triggers: Vec::new(),
            frozen_jobs: Vec::new(),
            clash_nodes: Vec::new(),
            eta,
            zombie: false,
            done: false,
            audit: Vec::new(),
        });
        tracing::info!(req = idx, "req opened");
        idx
    }

    pub fn close(&mut self, idx: ReqIdx) -> Option<Req> {
        let req = self.reqs.get_mut(idx as usize)?.take();
        tracing::info!(req = idx, "req closed");
        req
    }

    pub fn get(&self, idx: ReqIdx) -> Option<&Req> {
        self.reqs.get(idx as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, idx: ReqIdx) -> Option<&mut Req> {
        self.reqs.get_mut(idx as usize)?.as_mut()
    }

    pub fn is_zombie(&self, idx: ReqIdx) -> bool {
        self.get(idx).map(|r| r.zombie).unwrap_or(true)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Req> {
        self.reqs.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Req> {
        self.reqs.iter_mut().flatten()
    }

    /// Req start order with ETAs, as the backends consume it.
    pub fn etas(&self) -> Vec<(ReqIdx, Timestamp)> {
        self.iter().map(|r| (r.idx, r.eta)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_move_law() {
        let mut st = ReqStats::default();
        st.add(JobReport::Rerun, 1.0);
        st.add(JobReport::Done, 2.0);
        assert_eq!(st.count(JobReport::Rerun), 1);
        st.move_report(JobReport::Rerun, JobReport::Done);
        assert_eq!(st.count(JobReport::Rerun), 0);
        assert_eq!(st.count(JobReport::Done), 2);
    }

    #[test]
    fn tracker_reuses_slots() {
        let mut t = ReqTracker::default();
        let a = t.open(ReqOptions::default(), 0);
        let b = t.open(ReqOptions::default(), 0);
        assert_ne!(a, b);
        t.close(a);
        assert!(t.get(a).is_none());
        let c = t.open(ReqOptions::default(), 0);
        assert_eq!(c, a, "slot is reused");
        assert_eq!(t.iter().count(), 2);
    }

    #[test]
    fn audit_lines_render() {
        assert_eq!(AuditEvent::Start { job: "copy:".into() }.render(), "start      copy:");
        assert_eq!(
            AuditEvent::Hit { job: "j".into(), verb: "done".into() }.render(),
            "hit_done   j"
        );
        assert_eq!(
            AuditEvent::Failed { job: "j".into(), reason: "dep in error".into(), stderr: String::new() }.render(),
            "failed     j (dep in error)"
        );
    }
}
