use serde::{Deserialize, Serialize};
use std::time::Duration;

// ─── Scalar aliases ───────────────────────────────────────────

/// Arena index of a Node (a path in the workspace).
pub type NodeIdx = u32;

/// Arena index of a Job (a rule bound to concrete stems).
pub type JobIdx = u32;

/// Index of an open Req (user build invocation). Bounded and small.
pub type ReqIdx = u16;

/// Index of a compiled rule in the RuleSet.
pub type RuleIdx = u32;

/// Monotonic sequence id stamped on every job execution.
pub type SeqId = u64;

/// Small per-running-job id, recycled, used for tmp dirs and pid spreading.
pub type SmallId = u32;

/// Resource-occupancy scalar; stored value +1 encodes 1 (0 means "1 token").
pub type Tokens1 = u8;

/// Disk sizes in bytes.
pub type DiskSz = u64;

/// Monotonic generation used to invalidate node classifications in bulk.
pub type MatchGen = u32;

/// 1-based index into the configured caches; 0 means "no cache".
pub type CacheIdx = u16;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

// ─── Bool3 ────────────────────────────────────────────────────

/// Three-valued logic, ordered No < Maybe < Yes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Bool3 {
    #[default]
    No,
    Maybe,
    Yes,
}

impl Bool3 {
    pub fn from_bool(b: bool) -> Self {
        if b {
            Bool3::Yes
        } else {
            Bool3::No
        }
    }
}

impl std::ops::BitAnd for Bool3 {
    type Output = Bool3;
    fn bitand(self, other: Bool3) -> Bool3 {
        self.min(other)
    }
}

impl std::ops::BitOr for Bool3 {
    type Output = Bool3;
    fn bitor(self, other: Bool3) -> Bool3 {
        self.max(other)
    }
}

// ─── CoarseDelay ──────────────────────────────────────────────

/// A coarse duration used for pressure arithmetic. Quantized to 1/100 s so
/// comparisons are cheap and stable across save/load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoarseDelay(u32);

impl CoarseDelay {
    pub const ZERO: CoarseDelay = CoarseDelay(0);

    pub fn from_millis(ms: u64) -> Self {
        CoarseDelay((ms / 10).min(u32::MAX as u64) as u32)
    }

    pub fn as_millis(self) -> u64 {
        self.0 as u64 * 10
    }

    pub fn saturating_add(self, other: CoarseDelay) -> CoarseDelay {
        CoarseDelay(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: CoarseDelay) -> CoarseDelay {
        CoarseDelay(self.0.saturating_sub(other.0))
    }
}

impl From<Duration> for CoarseDelay {
    fn from(d: Duration) -> Self {
        CoarseDelay::from_millis(d.as_millis() as u64)
    }
}

// ─── Access / flag bitsets ────────────────────────────────────

/// How a job observed a dep: which syscall families touched it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Accesses(pub u8);

impl Accesses {
    pub const NONE: Accesses = Accesses(0);
    pub const READ: Accesses = Accesses(1 << 0);
    pub const STAT: Accesses = Accesses(1 << 1);
    pub const READDIR: Accesses = Accesses(1 << 2);
    pub const READLINK: Accesses = Accesses(1 << 3);
    /// An access that observed an error (e.g. ENOENT), still a dep.
    pub const ERR: Accesses = Accesses(1 << 4);
    pub const FULL: Accesses = Accesses(0x1f);

    pub fn any(self) -> bool {
        self.0 != 0
    }

    pub fn contains(self, other: Accesses) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if the access can distinguish file content (not just presence/kind).
    pub fn senses_content(self) -> bool {
        self.contains(Accesses::READ)
    }
}

impl std::ops::BitOr for Accesses {
    type Output = Accesses;
    fn bitor(self, other: Accesses) -> Accesses {
        Accesses(self.0 | other.0)
    }
}

impl std::ops::BitOrAssign for Accesses {
    fn bitor_assign(&mut self, other: Accesses) {
        self.0 |= other.0;
    }
}

impl std::ops::BitAnd for Accesses {
    type Output = Accesses;
    fn bitand(self, other: Accesses) -> Accesses {
        Accesses(self.0 & other.0)
    }
}

/// Dep flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dflags(pub u8);

impl Dflags {
    pub const NONE: Dflags = Dflags(0);
    /// Declared by the rule, present before the job runs.
    pub const STATIC: Dflags = Dflags(1 << 0);
    /// Dep must be buildable for the job to run.
    pub const REQUIRED: Dflags = Dflags(1 << 1);
    /// A modified critical dep stops analysis of subsequent deps.
    pub const CRITICAL: Dflags = Dflags(1 << 2);
    /// Dep errors do not poison the job.
    pub const IGNORE_ERROR: Dflags = Dflags(1 << 3);
    /// Dep content matters (not a resources-only early dep).
    pub const FULL: Dflags = Dflags(1 << 4);

    pub fn contains(self, other: Dflags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Dflags {
    type Output = Dflags;
    fn bitor(self, other: Dflags) -> Dflags {
        Dflags(self.0 | other.0)
    }
}

impl std::ops::BitOrAssign for Dflags {
    fn bitor_assign(&mut self, other: Dflags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitAndAssign for Dflags {
    fn bitand_assign(&mut self, other: Dflags) {
        self.0 &= other.0;
    }
}

impl std::ops::Not for Dflags {
    type Output = Dflags;
    fn not(self) -> Dflags {
        Dflags(!self.0)
    }
}

/// Target flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tflags(pub u8);

impl Tflags {
    pub const NONE: Tflags = Tflags(0);
    /// Node is an official target of its job.
    pub const TARGET: Tflags = Tflags(1 << 0);
    /// Target may be read before being written (kept across runs).
    pub const INCREMENTAL: Tflags = Tflags(1 << 1);
    /// Target may legitimately not be produced.
    pub const PHONY: Tflags = Tflags(1 << 2);
    /// Matched a star pattern rather than a static target.
    pub const STAR: Tflags = Tflags(1 << 3);
    /// Shown prominently in reports.
    pub const ESSENTIAL: Tflags = Tflags(1 << 4);

    pub fn contains(self, other: Tflags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Tflags {
    type Output = Tflags;
    fn bitor(self, other: Tflags) -> Tflags {
        Tflags(self.0 | other.0)
    }
}

impl std::ops::BitOrAssign for Tflags {
    fn bitor_assign(&mut self, other: Tflags) {
        self.0 |= other.0;
    }
}

// ─── Node classification ──────────────────────────────────────

/// Can this node be built? Ordered pessimistic → certain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Buildable {
    #[default]
    Unknown,
    /// No rule matches and not a source.
    No,
    /// An anti-rule forbids building it.
    Anti,
    /// The node is a declared source dir.
    SrcDir,
    /// The node lies under a source dir.
    SubSrcDir,
    /// The node is a source file.
    Src,
    /// Some rule matches but job analysis has not yet confirmed it.
    Maybe,
    /// A job is known to produce it.
    Yes,
}

impl Buildable {
    /// Certain to exist once made: a source or a confirmed job product.
    pub fn is_sure(self) -> bool {
        matches!(
            self,
            Buildable::Yes | Buildable::Src | Buildable::SrcDir | Buildable::SubSrcDir
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    #[default]
    Unknown,
    Plain,
    /// A dir on the node's path is a symlink; node will vanish on next run.
    Transient,
    Makable,
    Src,
    /// Node is strictly under another job's target.
    Uphill,
}

/// Who wrote the current on-disk content of a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polluted {
    #[default]
    Clean,
    /// Written by a job that does not own it.
    Job,
    /// Existed before its producing job first ran.
    PreExist,
}

/// On-disk state relative to what the engine recorded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Manual {
    #[default]
    Ok,
    Unlnked,
    Empty,
    Modif,
}

// ─── Job lifecycle ────────────────────────────────────────────

/// Where a job stands in its per-req analysis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobStep {
    #[default]
    None,
    /// Analyzing deps.
    Dep,
    /// Submitted to a backend, not yet started.
    Queued,
    /// Executing.
    Exec,
    /// Processing its end report.
    End,
    /// Served from cache, no execution.
    Hit,
    Done,
}

/// Result of a job execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Status {
    #[default]
    New,
    /// Dep check failed before the job actually started.
    EarlyChkDeps,
    /// Job was not started because of an error.
    EarlyErr,
    /// Lost before starting, retry.
    EarlyLost,
    /// Lost before starting, do not retry.
    EarlyLostErr,
    /// Lost after having started, retry.
    LateLost,
    /// Lost after having started, do not retry.
    LateLostErr,
    Killed,
    /// Dep check failed during execution.
    ChkDeps,
    /// Cache reported deps, not a result.
    CacheMatch,
    /// Target not correctly initialized or simultaneously written.
    BadTarget,
    Ok,
    /// Needs to rerun but already ran too many times.
    RunLoop,
    /// Needs to rerun but already submitted too many times.
    SubmitLoop,
    Err,
}

impl Status {
    /// Yes = success, No = failure, Maybe = no reliable verdict.
    pub fn ok(self) -> Bool3 {
        match self {
            Status::Ok => Bool3::Yes,
            Status::EarlyErr
            | Status::EarlyLostErr
            | Status::LateLostErr
            | Status::RunLoop
            | Status::SubmitLoop
            | Status::Err => Bool3::No,
            _ => Bool3::Maybe,
        }
    }

    pub fn is_lost(self) -> bool {
        matches!(
            self,
            Status::EarlyLost | Status::EarlyLostErr | Status::LateLost | Status::LateLostErr
        )
    }

    /// <= Early means outputs were not modified by the run.
    pub fn is_early(self) -> bool {
        self <= Status::EarlyLostErr
    }

    /// <= Garbage means the job has not run reliably.
    pub fn is_garbage(self) -> bool {
        self <= Status::BadTarget
    }
}

/// Pre-run decision about whether the job may run at all. Ordered by
/// severity so accumulating deps keeps the worst verdict.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    #[default]
    Ok,
    /// Rule-level error (e.g. dynamic attribute evaluation failed).
    Err,
    /// A dep is in error.
    DepErr,
    /// A static dep cannot be built.
    MissingStatic,
}

impl RunStatus {
    pub fn is_ok(self) -> bool {
        self == RunStatus::Ok
    }
}

// ─── Job reasons ──────────────────────────────────────────────

/// Why a job would run (or is blocked). Order groups: plain reasons,
/// node-bound reasons, dep-bound reasons, errors, missing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobReasonTag {
    #[default]
    None,
    Retry,
    LostRetry,
    // with reason
    OldErr,
    Rsrcs,
    PollutedTargets,
    ChkDeps,
    CacheMatch,
    Cmd,
    Force,
    Killed,
    Lost,
    New,
    WasLost,
    // with node
    BusyTarget,
    NoTarget,
    OldTarget,
    PrevTarget,
    PollutedTarget,
    ClashTarget,
    BusyDep,
    DepOutOfDate,
    DepTransient,
    DepUnlnked,
    DepUnstable,
    // errors
    DepOverwritten,
    DepErr,
    DepMissingRequired,
    // missing
    DepMissingStatic,
}

impl JobReasonTag {
    /// Fixed priority: when two reasons merge, the higher priority wins.
    pub fn prio(self) -> u8 {
        use JobReasonTag::*;
        match self {
            None => 0,
            Retry | LostRetry => 1,
            BusyTarget => 10,
            BusyDep => 11,
            OldErr => 20,
            Rsrcs => 21,
            PollutedTargets => 22,
            NoTarget => 30,
            OldTarget => 31,
            PrevTarget => 32,
            PollutedTarget => 33,
            ClashTarget => 35,
            CacheMatch => 40,
            ChkDeps => 41,
            DepOutOfDate => 50,
            DepTransient | DepUnlnked | DepUnstable => 51,
            WasLost => 60,
            Lost => 61,
            Force => 62,
            Killed => 63,
            Cmd => 64,
            DepOverwritten => 70,
            DepErr | DepMissingRequired => 71,
            DepMissingStatic => 80,
            New => 100,
        }
    }

    /// True if the tag carries an associated node.
    pub fn has_node(self) -> bool {
        self >= JobReasonTag::BusyTarget
    }

    /// Error band: the job must not run, its deps are broken.
    pub fn is_err(self) -> bool {
        self >= JobReasonTag::DepOverwritten
    }

    pub fn is_retry(self) -> bool {
        matches!(self, JobReasonTag::Retry | JobReasonTag::LostRetry)
    }

    pub fn user_str(self) -> &'static str {
        use JobReasonTag::*;
        match self {
            None => "no reason",
            Retry => "job is retried after error",
            LostRetry => "job is retried after lost error",
            OldErr => "job was in error",
            Rsrcs => "resources changed and job was in error",
            PollutedTargets => "polluted targets",
            ChkDeps => "dep check requires rerun",
            CacheMatch => "cache reported a match but job did not run",
            Cmd => "command changed",
            Force => "job forced",
            Killed => "job was killed",
            Lost => "job lost",
            New => "job was never run",
            WasLost => "job was lost",
            BusyTarget => "busy target",
            NoTarget => "missing target",
            OldTarget => "target produced by an old job",
            PrevTarget => "target previously existed",
            PollutedTarget => "polluted target",
            ClashTarget => "multiple simultaneous writes",
            BusyDep => "waiting dep",
            DepOutOfDate => "dep out of date",
            DepTransient => "dep dir is a symbolic link",
            DepUnlnked => "dep not on disk",
            DepUnstable => "dep changed during job execution",
            DepOverwritten => "dep has been overwritten",
            DepErr => "dep in error",
            DepMissingRequired => "required dep missing",
            DepMissingStatic => "static dep missing",
        }
    }
}

/// A reason with its optional associated node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobReason {
    pub tag: JobReasonTag,
    pub node: Option<NodeIdx>,
}

impl JobReason {
    pub fn new(tag: JobReasonTag) -> Self {
        JobReason { tag, node: None }
    }

    pub fn with_node(tag: JobReasonTag, node: NodeIdx) -> Self {
        debug_assert!(tag.has_node());
        JobReason { tag, node: Some(node) }
    }

    pub fn any(self) -> bool {
        self.tag != JobReasonTag::None
    }

    /// True if this reason calls for a run (as opposed to none or an error).
    pub fn need_run(self) -> bool {
        self.tag != JobReasonTag::None && !self.tag.is_err()
    }

    /// Merge law: higher priority wins, the older reason is kept on ties.
    pub fn merge(self, other: JobReason) -> JobReason {
        if other.tag.prio() > self.tag.prio() {
            other
        } else {
            self
        }
    }

    pub fn user_str(self) -> &'static str {
        self.tag.user_str()
    }
}

impl std::ops::BitOr for JobReason {
    type Output = JobReason;
    fn bitor(self, other: JobReason) -> JobReason {
        self.merge(other)
    }
}

impl std::ops::BitOrAssign for JobReason {
    fn bitor_assign(&mut self, other: JobReason) {
        *self = self.merge(other);
    }
}

impl From<JobReasonTag> for JobReason {
    fn from(tag: JobReasonTag) -> Self {
        JobReason::new(tag)
    }
}

/// Why analysis decided not to run a runnable job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum NoRunReason {
    /// Run it.
    #[default]
    None,
    RetryLoop,
    LostLoop,
    RunLoopReq,
    RunLoopRule,
    SubmitLoopReq,
    SubmitLoopRule,
    /// No reason to run at all.
    Dep,
}

// ─── Misc execution enums ─────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeartbeatState {
    #[default]
    Alive,
    Lost,
    Err,
}

/// Pre-action applied to a target before the job runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileActionTag {
    #[default]
    None,
    Mkdir,
    Unlink,
    /// Unlink a target polluted by a foreign writer.
    UnlinkPolluted,
    /// Move aside rather than destroy (manual edits).
    Quarantine,
}

/// How a run is classified in per-req stats and in the audit stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobReport {
    Done,
    Steady,
    Failed,
    Hit,
    Rerun,
    Killed,
}

/// Cache lookup outcome.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheHitInfo {
    #[default]
    None,
    Hit,
    /// Partial: listed new deps must be built, then retry.
    Match,
    Miss,
}

/// Per-req cache policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheMethod {
    None,
    Download,
    Upload,
    #[default]
    ReadWrite,
}

impl CacheMethod {
    pub fn downloads(self) -> bool {
        matches!(self, CacheMethod::Download | CacheMethod::ReadWrite)
    }
    pub fn uploads(self) -> bool {
        matches!(self, CacheMethod::Upload | CacheMethod::ReadWrite)
    }
}

/// Compression applied to cached artifacts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Zlvl {
    /// 0 = store raw, else a zstd level.
    pub lvl: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool3_lattice() {
        assert_eq!(Bool3::Yes & Bool3::Maybe, Bool3::Maybe);
        assert_eq!(Bool3::No | Bool3::Maybe, Bool3::Maybe);
        assert!(Bool3::No < Bool3::Maybe && Bool3::Maybe < Bool3::Yes);
    }

    #[test]
    fn reason_merge_keeps_older_on_tie() {
        let a = JobReason::with_node(JobReasonTag::DepErr, 1);
        let b = JobReason::with_node(JobReasonTag::DepMissingRequired, 2);
        // same priority: older (receiver) wins
        assert_eq!(a.merge(b), a);
        // higher priority wins
        let c = JobReason::new(JobReasonTag::New);
        assert_eq!(a.merge(c), c);
    }

    #[test]
    fn reason_bands() {
        assert!(JobReasonTag::DepErr.is_err());
        assert!(!JobReasonTag::DepOutOfDate.is_err());
        assert!(JobReasonTag::ClashTarget.has_node());
        assert!(!JobReasonTag::Cmd.has_node());
        assert!(JobReason::new(JobReasonTag::Cmd).need_run());
        assert!(!JobReason::new(JobReasonTag::DepMissingStatic).need_run());
    }

    #[test]
    fn status_attrs() {
        assert_eq!(Status::Ok.ok(), Bool3::Yes);
        assert_eq!(Status::Killed.ok(), Bool3::Maybe);
        assert_eq!(Status::SubmitLoop.ok(), Bool3::No);
        assert!(Status::LateLost.is_lost());
        assert!(Status::EarlyLostErr.is_early());
        assert!(!Status::Killed.is_early());
        assert!(Status::BadTarget.is_garbage());
        assert!(!Status::Ok.is_garbage());
    }

    #[test]
    fn coarse_delay_quantizes() {
        let d = CoarseDelay::from_millis(1234);
        assert_eq!(d.as_millis(), 1230);
        assert_eq!(d.saturating_sub(CoarseDelay::from_millis(2000)), CoarseDelay::ZERO);
    }
}
