use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::digest::{Crc, DepDigest, JobDigest, TargetDigest};
use crate::job_space::{ChrootInfo, JobSpace};
use crate::types::{
    Bool3, CacheIdx, CoarseDelay, FileActionTag, JobIdx, JobReason, SeqId, SmallId, Timestamp,
    Zlvl,
};

/// Sanity constant preceding every cache connection.
pub const CACHE_MAGIC: u64 = 0x604178e6d1838dce;

/// 4-byte connection key validating peer identity on the first frame.
pub type ConnKey = u32;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection key mismatch")]
    KeyMismatch,
    #[error("zero-length frame")]
    EmptyFrame,
    #[error("cannot decode frame: {0}")]
    Decode(#[from] bincode::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── MsgBuf ───────────────────────────────────────────────────

/// Receive buffer for framed messages: optional connection key on the
/// first frame, then repeated (u32 length, payload). Feed bytes with
/// `extend`, drain whole messages with `next`.
#[derive(Debug, Default)]
pub struct MsgBuf {
    buf: Vec<u8>,
    msg_start: usize,
    /// None while the length header of the next message is unread.
    msg_len: Option<u32>,
    /// Expected key; cleared once checked.
    key: Option<ConnKey>,
}

impl MsgBuf {
    pub fn new(key: Option<ConnKey>) -> MsgBuf {
        MsgBuf { key, ..Default::default() }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn avail(&self) -> usize {
        self.buf.len() - self.msg_start
    }

    /// Decode the next complete message, if any. Compaction happens on
    /// every processed message once the consumed prefix is at least as
    /// large as the remainder, bounding memory without overlapping copies.
    pub fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        if self.msg_len.is_none() {
            if let Some(expected) = self.key {
                if self.avail() < 4 {
                    return Ok(None);
                }
                let got = u32::from_le_bytes(self.buf[self.msg_start..self.msg_start + 4].try_into().unwrap());
                if got != expected {
                    return Err(ProtocolError::KeyMismatch); // not for us: treat as closed
                }
                self.msg_start += 4;
                self.key = None;
            }
            if self.avail() < 4 {
                return Ok(None);
            }
            let len = u32::from_le_bytes(self.buf[self.msg_start..self.msg_start + 4].try_into().unwrap());
            if len == 0 {
                return Err(ProtocolError::EmptyFrame);
            }
            self.msg_start += 4;
            self.msg_len = Some(len);
        }
        let len = self.msg_len.unwrap() as usize;
        if self.avail() < len {
            return Ok(None);
        }
        let msg = bincode::deserialize(&self.buf[self.msg_start..self.msg_start + len])?;
        self.msg_start += len;
        self.msg_len = None;
        if self.avail() <= self.msg_start {
            self.buf.drain(..self.msg_start);
            self.msg_start = 0;
        }
        Ok(Some(msg))
    }
}

/// Encode one framed message, prepending the connection key on request.
pub fn encode_msg<T: Serialize>(x: &T, key: Option<ConnKey>) -> Result<Vec<u8>, ProtocolError> {
    let payload = bincode::serialize(x)?;
    let mut out = Vec::with_capacity(payload.len() + 8);
    if let Some(k) = key {
        out.extend_from_slice(&k.to_le_bytes());
    }
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Send one framed message.
pub async fn send_msg<T: Serialize, W: AsyncWrite + Unpin>(
    w: &mut W,
    x: &T,
    key: Option<ConnKey>,
) -> Result<(), ProtocolError> {
    let bytes = encode_msg(x, key)?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

/// Receive one framed message. `Ok(None)` on clean EOF (including a reset
/// peer, which is equivalent to EOF) and on key mismatch (the connection
/// is not for us and is treated as closed immediately).
pub async fn recv_msg<T: DeserializeOwned, R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut MsgBuf,
) -> Result<Option<T>, ProtocolError> {
    loop {
        match buf.next::<T>() {
            Ok(Some(msg)) => return Ok(Some(msg)),
            Ok(None) => {}
            Err(ProtocolError::KeyMismatch) => return Ok(None),
            Err(e) => return Err(e),
        }
        let mut chunk = [0u8; 4096];
        let n = match r.read(&mut chunk).await {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => 0,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Ok(None);
        }
        buf.extend(&chunk[..n]);
    }
}

// ─── Job RPC ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobRpcProc {
    #[default]
    None,
    Start,
    ReportStart,
    /// Req was killed and the job was not (other reqs, or not yet started).
    GiveUp,
    End,
}

/// First message of a job execution connection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStartRpcReq {
    pub seq_id: SeqId,
    pub job: JobIdx,
    /// Where the executor can be contacted back.
    pub service: String,
    pub msg: String,
}

/// A pre-action applied to a target path before execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileAction {
    pub tag: FileActionTag,
    /// For Quarantine: destination inside the quarantine dir.
    pub extra: String,
}

/// Everything the executor needs to run the job.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStartRpcReply {
    /// Engine-assigned sequence id, echoed in every later message.
    pub seq_id: SeqId,
    pub rule: String,
    pub cmd: String,
    pub interpreter: Vec<String>,
    pub env: Vec<(String, String)>,
    pub kill_sigs: Vec<i32>,
    pub job_space: JobSpace,
    pub chroot_info: ChrootInfo,
    pub pre_actions: Vec<(String, FileAction)>,
    /// Exact target paths with their flags.
    pub static_matches: Vec<(String, crate::types::Tflags)>,
    /// Target regexes with their flags.
    pub star_matches: Vec<(String, crate::types::Tflags)>,
    /// Deps already accessed (always includes static deps).
    pub deps: Vec<(String, DepDigest)>,
    pub small_id: SmallId,
    pub timeout_s: u64,
    pub ddate_prec_ns: i128,
    pub network_delay_ms: u64,
    pub nice: u8,
    pub live_out: bool,
    pub keep_tmp: bool,
    pub use_script: bool,
    pub stdin: String,
    pub stdout: String,
    pub stderr_ok: bool,
    pub zlvl: Zlvl,
    /// Repo identity key, echoed on cache uploads.
    pub key: String,
    pub phy_repo_root: String,
    pub cache_idx1: CacheIdx,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobMngtProc {
    #[default]
    None,
    ChkDeps,
    /// Signals a pre-existing target in a reply.
    ChkTargets,
    DepDirect,
    DepVerbose,
    LiveOut,
    AddLiveOut,
    Heartbeat,
    Kill,
}

/// Mid-execution management request from the executor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMngtRpcReq {
    pub seq_id: SeqId,
    pub job: JobIdx,
    pub proc: JobMngtProc,
    /// Token echoed in the reply so the executor can route it.
    pub fd: u64,
    pub targets: Vec<(String, TargetDigest)>,
    pub deps: Vec<(String, DepDigest)>,
    pub txt: String,
}

/// Per-dep verbose answer: ok verdict + crc.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VerboseInfo {
    pub ok: Bool3,
    pub crc: Crc,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMngtRpcReply {
    pub proc: JobMngtProc,
    pub seq_id: SeqId,
    pub fd: u64,
    /// ChkDeps/DepDirect: No = deps in error, Maybe = not ready (rerun).
    pub ok: Bool3,
    pub verbose_infos: Vec<VerboseInfo>,
    pub txt: String,
}

/// Aggregate resource usage of a finished run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub cpu_s: f64,
    pub mem_b: u64,
    pub elapsed_s: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MsgStderr {
    pub msg: String,
    pub stderr: String,
}

/// Final message of a job execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobEndRpcReq {
    pub seq_id: SeqId,
    pub job: JobIdx,
    pub digest: JobDigest,
    /// Env variables computed during execution.
    pub dyn_env: Vec<(String, String)>,
    pub end_date: Timestamp,
    pub msg_stderr: MsgStderr,
    pub phy_tmp_dir: String,
    pub stats: JobStats,
    pub stdout: String,
    pub total_sz: u64,
    pub total_z_sz: u64,
    pub wstatus: i32,
}

/// Start blob recorded in the per-job ancillary file (and in the cache).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobInfoStart {
    pub seq_id: SeqId,
    pub job: JobIdx,
    pub reason: JobReason,
    pub rsrcs: Vec<(String, u64)>,
    pub start: JobStartRpcReply,
}

/// Full ancillary record: synthetic ones are installed on cache hits.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub start: JobInfoStart,
    pub end: JobEndRpcReq,
}

// ─── Cache RPC ────────────────────────────────────────────────

/// Cache efficiency rate; 0 means "use configured max_rate".
pub type Rate = u8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheRpcProc {
    #[default]
    None,
    Config,
    Download,
    Upload,
    Commit,
    Dismiss,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_sz: u64,
    /// B/s above which a run is not worth caching.
    pub max_rate: u64,
    pub max_runs_per_job: u16,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig { max_sz: 1 << 30, max_rate: 1 << 30, max_runs_per_job: 100 }
    }
}

/// Reservation key handed out by Upload, consumed by Commit/Dismiss.
pub type CacheUploadKey = u128;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheRpcReq {
    pub proc: CacheRpcProc,
    /// Config: identity of the requesting repo.
    pub repo_key: String,
    /// Download | Commit: repo-independent job name.
    pub job: String,
    /// Download | Commit: (dep name, digest with actual crc).
    pub repo_deps: Vec<(String, DepDigest)>,
    /// Upload | Dismiss: connection id from Config.
    pub conn_id: u32,
    /// Upload: bytes to reserve.
    pub reserved_sz: u64,
    /// Commit.
    pub total_z_sz: u64,
    pub job_info_sz: u64,
    pub exe_time: CoarseDelay,
    /// Commit | Dismiss.
    pub upload_key: CacheUploadKey,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheRpcReply {
    pub proc: CacheRpcProc,
    /// Config.
    pub config: CacheConfig,
    /// Config: to be echoed on subsequent uploads.
    pub conn_id: u32,
    /// Download.
    pub hit_info: crate::types::CacheHitInfo,
    /// Download on a hit: the serialized entry.
    pub job_info: Option<JobInfo>,
    /// Download on a partial match: deps to build first.
    pub new_deps: Vec<String>,
    /// Download on a hit: compressed per-target bytes, parallel to the
    /// entry's target list.
    pub target_data: Vec<Vec<u8>>,
    /// Upload.
    pub upload_key: CacheUploadKey,
    /// Upload failure reason when upload_key is 0.
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msgbuf_reassembles_partial_frames() {
        let req = JobStartRpcReq { seq_id: 42, job: 7, service: "host:123".into(), msg: String::new() };
        let bytes = encode_msg(&req, None).unwrap();
        let mut buf = MsgBuf::new(None);
        for b in &bytes[..bytes.len() - 1] {
            buf.extend(&[*b]);
            assert!(buf.next::<JobStartRpcReq>().unwrap().is_none());
        }
        buf.extend(&bytes[bytes.len() - 1..]);
        assert_eq!(buf.next::<JobStartRpcReq>().unwrap(), Some(req));
        assert!(buf.next::<JobStartRpcReq>().unwrap().is_none());
    }

    #[test]
    fn msgbuf_streams_multiple_messages() {
        let mut buf = MsgBuf::new(None);
        for i in 0..10u64 {
            let req = JobStartRpcReq { seq_id: i, ..Default::default() };
            buf.extend(&encode_msg(&req, None).unwrap());
        }
        for i in 0..10u64 {
            let got: JobStartRpcReq = buf.next().unwrap().unwrap();
            assert_eq!(got.seq_id, i);
        }
        assert!(buf.next::<JobStartRpcReq>().unwrap().is_none());
        // compaction happened: the buffer does not grow without bound
        assert_eq!(buf.msg_start, 0);
        assert!(buf.buf.is_empty());
    }

    #[test]
    fn msgbuf_checks_connection_key() {
        let req = JobStartRpcReq::default();
        let good = encode_msg(&req, Some(0xdead_beef)).unwrap();
        let mut buf = MsgBuf::new(Some(0xdead_beef));
        buf.extend(&good);
        assert!(buf.next::<JobStartRpcReq>().unwrap().is_some());

        let bad = encode_msg(&req, Some(0x1111_1111)).unwrap();
        let mut buf = MsgBuf::new(Some(0xdead_beef));
        buf.extend(&bad);
        assert!(matches!(buf.next::<JobStartRpcReq>(), Err(ProtocolError::KeyMismatch)));
    }

    #[test]
    fn rpc_serde_roundtrips() {
        let reply = JobStartRpcReply {
            rule: "compile".into(),
            cmd: "cc -c x.c".into(),
            interpreter: vec!["/bin/sh".into(), "-c".into()],
            env: vec![("PATH".into(), "/usr/bin".into())],
            kill_sigs: vec![15, 9],
            deps: vec![("x.c".into(), DepDigest::default())],
            small_id: 3,
            timeout_s: 60,
            live_out: true,
            key: "repo-1".into(),
            ..Default::default()
        };
        let bytes = bincode::serialize(&reply).unwrap();
        assert_eq!(bincode::deserialize::<JobStartRpcReply>(&bytes).unwrap(), reply);

        let mngt = JobMngtRpcReq {
            seq_id: 9,
            job: 4,
            proc: JobMngtProc::ChkDeps,
            fd: 11,
            deps: vec![("a".into(), DepDigest::default())],
            ..Default::default()
        };
        let bytes = bincode::serialize(&mngt).unwrap();
        assert_eq!(bincode::deserialize::<JobMngtRpcReq>(&bytes).unwrap(), mngt);

        let end = JobEndRpcReq {
            seq_id: 9,
            job: 4,
            wstatus: 0,
            stats: JobStats { cpu_s: 0.5, mem_b: 1 << 20, elapsed_s: 1.25 },
            ..Default::default()
        };
        let bytes = bincode::serialize(&end).unwrap();
        assert_eq!(bincode::deserialize::<JobEndRpcReq>(&bytes).unwrap(), end);

        let creq = CacheRpcReq {
            proc: CacheRpcProc::Commit,
            job: "compile-abc".into(),
            total_z_sz: 100,
            exe_time: CoarseDelay::from_millis(1500),
            upload_key: 77,
            ..Default::default()
        };
        let bytes = bincode::serialize(&creq).unwrap();
        assert_eq!(bincode::deserialize::<CacheRpcReq>(&bytes).unwrap(), creq);
    }

    #[tokio::test]
    async fn send_recv_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let req = JobMngtRpcReq { seq_id: 5, proc: JobMngtProc::LiveOut, txt: "hello".into(), ..Default::default() };
        send_msg(&mut a, &req, Some(7)).await.unwrap();
        drop(a);
        let mut buf = MsgBuf::new(Some(7));
        let got: Option<JobMngtRpcReq> = recv_msg(&mut b, &mut buf).await.unwrap();
        assert_eq!(got, Some(req));
        // clean EOF after the peer closed
        let got: Option<JobMngtRpcReq> = recv_msg(&mut b, &mut buf).await.unwrap();
        assert_eq!(got, None);
    }
}
