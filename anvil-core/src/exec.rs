use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::backend::{BackendDriver, Rsrcs, SpawnId};
use crate::digest::{now_ms, Crc, DepInfo, FileSig, JobDigest, TargetDigest};
use crate::job_space::{simplify_cmd, EnvCtx, SpaceGuard};
use crate::protocol::{JobEndRpcReq, JobStartRpcReply, JobStartRpcReq, JobStats, MsgStderr};
use crate::store_disk::RepoLayout;
use crate::types::{FileActionTag, HeartbeatState, JobIdx, SeqId, Status, Tflags, Timestamp};

// ─── Engine side seen from an executor ────────────────────────

/// The two RPCs an executor always performs, abstracted so the local
/// driver can stay in-process while remote executors go through TCP.
#[async_trait]
pub trait ExecHost: Send + Sync + 'static {
    /// None = the job was killed before starting; do not run it.
    async fn job_start(&self, req: JobStartRpcReq) -> Option<JobStartRpcReply>;
    async fn job_end(&self, end: JobEndRpcReq);
}

// ─── Job execution ────────────────────────────────────────────

fn apply_pre_actions(repo_root: &Path, reply: &JobStartRpcReply) -> Result<()> {
    let layout = RepoLayout::new(repo_root);
    for (path, action) in &reply.pre_actions {
        let abs = repo_root.join(path);
        match action.tag {
            FileActionTag::None => {}
            FileActionTag::Mkdir => {
                std::fs::create_dir_all(&abs).with_context(|| format!("cannot mkdir {path}"))?
            }
            FileActionTag::Unlink | FileActionTag::UnlinkPolluted => match std::fs::remove_file(&abs) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("cannot unlink {path}")),
            },
            FileActionTag::Quarantine => {
                if abs.exists() {
                    crate::store_disk::quarantine(&layout, path)?;
                }
            }
        }
    }
    Ok(())
}

fn build_argv(reply: &JobStartRpcReply, env: &[(String, String)]) -> Vec<String> {
    let is_shell_wrapper = reply.interpreter.len() == 2
        && reply.interpreter[1] == "-c"
        && (reply.interpreter[0].ends_with("/sh") || reply.interpreter[0].ends_with("/bash"));
    if is_shell_wrapper && !reply.use_script {
        let path = env
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| "/usr/bin:/bin".to_string());
        if let Some(argv) = simplify_cmd(&reply.cmd, &path) {
            return argv; // trivial shell body: exec the binary directly
        }
    }
    let mut argv = reply.interpreter.clone();
    argv.push(reply.cmd.clone());
    argv
}

async fn wait_with_kill_ladder(
    child: &mut tokio::process::Child,
    timeout_s: u64,
    kill_sigs: &[i32],
) -> (Option<i32>, bool) {
    if timeout_s == 0 {
        let status = child.wait().await.ok();
        return (status.and_then(|s| s.code()), false);
    }
    match tokio::time::timeout(std::time::Duration::from_secs(timeout_s), child.wait()).await {
        Ok(status) => (status.ok().and_then(|s| s.code()), false),
        Err(_) => {
            // ordered signal ladder, one second apart
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                for sig in kill_sigs {
                    unsafe { libc::kill(pid as i32, *sig) };
                    let done = tokio::time::timeout(std::time::Duration::from_secs(1), child.wait()).await;
                    if done.is_ok() {
                        break;
                    }
                }
            }
            let _ = child.kill().await;
            let _ = child.wait().await;
            (None, true)
        }
    }
}

/// Execute a job as described by its start reply: enter the job space,
/// run the command with substituted env, digest the declared targets, and
/// assemble the end report.
pub async fn run_job(
    seq_id: SeqId,
    job: JobIdx,
    reply: &JobStartRpcReply,
    repo_root: &Path,
) -> JobEndRpcReq {
    let started = std::time::Instant::now();
    match run_job_inner(seq_id, job, reply, repo_root).await {
        Ok(end) => end,
        Err(e) => JobEndRpcReq {
            seq_id,
            job,
            digest: JobDigest { status: Status::EarlyErr, ..Default::default() },
            msg_stderr: MsgStderr { msg: e.to_string(), stderr: String::new() },
            end_date: now_ms(),
            stats: JobStats { elapsed_s: started.elapsed().as_secs_f64(), ..Default::default() },
            wstatus: -1,
            ..Default::default()
        },
    }
}

async fn run_job_inner(
    seq_id: SeqId,
    job: JobIdx,
    reply: &JobStartRpcReply,
    repo_root: &Path,
) -> Result<JobEndRpcReq> {
    let started = std::time::Instant::now();
    apply_pre_actions(repo_root, reply)?;
    // pre-run signatures: detects pre-existing and written targets
    let pre_sigs: Vec<(String, FileSig)> = reply
        .static_matches
        .iter()
        .map(|(tn, _)| (tn.clone(), FileSig::from_path(&repo_root.join(tn))))
        .collect();
    // per-job tmp dir
    let phy_tmp = std::env::temp_dir().join(format!("anvil-{}-{}", reply.small_id, seq_id));
    std::fs::create_dir_all(&phy_tmp)?;
    let _guard = SpaceGuard { tmp_dir: Some(phy_tmp.clone()), keep_tmp: reply.keep_tmp };
    // env substitution after the space layout is known
    let ctx = EnvCtx {
        anvil_root: String::new(),
        repo_root: repo_root.to_string_lossy().into_owned(),
        top_repo_root: repo_root.to_string_lossy().into_owned(),
        tmp_dir: phy_tmp.to_string_lossy().into_owned(),
        phy_anvil_root: String::new(),
        phy_repo_root: repo_root.to_string_lossy().into_owned(),
        phy_tmp_dir: phy_tmp.to_string_lossy().into_owned(),
        small_id: reply.small_id,
        seq_id,
        std_path: "/usr/bin:/bin".to_string(),
        shell: "/bin/sh".to_string(),
    };
    let mut env = reply.env.clone();
    let mut interpreter = reply.interpreter.clone();
    ctx.update_env(&mut env, &mut interpreter);
    if !env.iter().any(|(k, _)| k == "PATH") {
        env.push(("PATH".to_string(), ctx.std_path.clone()));
    }
    env.push(("TMPDIR".to_string(), ctx.tmp_dir.clone()));
    let effective = JobStartRpcReply { interpreter, ..reply.clone() };
    let argv = build_argv(&effective, &env);
    //
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(repo_root)
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(target_os = "linux")]
    if effective.job_space.needs_ns() || !effective.chroot_info.dir.is_empty() {
        let space = effective.job_space.clone();
        let chroot = effective.chroot_info.clone();
        let repo = ctx.phy_repo_root.clone();
        let tmp = ctx.phy_tmp_dir.clone();
        let small_id = reply.small_id;
        unsafe {
            cmd.pre_exec(move || {
                crate::job_space::enter(&space, &chroot, &repo, &tmp, small_id)
                    .map(|_| ())
                    .map_err(|e| std::io::Error::other(e.to_string()))
            });
        }
    }
    let mut child = cmd.spawn().with_context(|| format!("cannot spawn {}", argv[0]))?;
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let out_task: JoinHandle<String> = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(p) = stdout_pipe.as_mut() {
            let _ = p.read_to_string(&mut buf).await;
        }
        buf
    });
    let err_task: JoinHandle<String> = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(p) = stderr_pipe.as_mut() {
            let _ = p.read_to_string(&mut buf).await;
        }
        buf
    });
    let (code, killed) = wait_with_kill_ladder(&mut child, effective.timeout_s, &effective.kill_sigs).await;
    let stdout = out_task.await.unwrap_or_default();
    let mut stderr = err_task.await.unwrap_or_default();
    //
    // digest targets and deps after the run
    let mut targets = Vec::new();
    let mut total_sz = 0u64;
    for ((tn, tflags), (_, pre_sig)) in effective.static_matches.iter().zip(&pre_sigs) {
        let path = repo_root.join(tn);
        let sig = FileSig::from_path(&path);
        let crc = Crc::from_path(&path).unwrap_or(Crc::UNKNOWN);
        total_sz += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        targets.push((
            tn.clone(),
            TargetDigest {
                tflags: *tflags,
                extra_tflags: Tflags::NONE,
                pre_exist: pre_sig.exists(),
                written: sig != *pre_sig,
                crc,
                sig,
            },
        ));
    }
    let mut deps = Vec::new();
    for (dn, dd) in &effective.deps {
        let mut digest = *dd;
        if digest.accesses.any() || digest.dflags.contains(crate::types::Dflags::STATIC) {
            let crc = Crc::from_path(&repo_root.join(dn)).unwrap_or(Crc::UNKNOWN);
            digest.info = DepInfo::Crc(crc);
        }
        deps.push((dn.clone(), digest));
    }
    //
    let status = if killed {
        Status::Killed
    } else if code == Some(0) {
        if !stderr.is_empty() && !effective.stderr_ok {
            Status::Err
        } else {
            Status::Ok
        }
    } else {
        Status::Err
    };
    let max_len = 64 * 1024;
    if stderr.len() > max_len {
        stderr.truncate(max_len);
    }
    Ok(JobEndRpcReq {
        seq_id,
        job,
        digest: JobDigest {
            deps,
            targets,
            status,
            exe_time: started.elapsed().as_secs_f64(),
            stderr: stderr.clone(),
            max_stderr_len: max_len,
        },
        dyn_env: Vec::new(),
        end_date: now_ms(),
        msg_stderr: MsgStderr { msg: String::new(), stderr },
        phy_tmp_dir: phy_tmp.to_string_lossy().into_owned(),
        stats: JobStats { cpu_s: 0.0, mem_b: 0, elapsed_s: started.elapsed().as_secs_f64() },
        stdout,
        total_sz,
        total_z_sz: 0,
        wstatus: code.unwrap_or(-1),
    })
}

// ─── Local driver ─────────────────────────────────────────────

/// Runs jobs on the engine host: each spawn is a task performing the
/// start RPC, the execution, and the end RPC in-process.
pub struct LocalDriver {
    capacity: Rsrcs,
    occupied: Mutex<Rsrcs>,
    host: Arc<dyn ExecHost>,
    repo_root: PathBuf,
    next_id: AtomicI64,
    running: Mutex<BTreeMap<SpawnId, JoinHandle<()>>>,
}

impl LocalDriver {
    pub fn new(capacity: &BTreeMap<String, u64>, host: Arc<dyn ExecHost>, repo_root: PathBuf) -> LocalDriver {
        let mut cap = capacity.clone();
        cap.insert("<single>".to_string(), 1);
        LocalDriver {
            capacity: Rsrcs(cap),
            occupied: Mutex::new(Rsrcs::default()),
            host,
            repo_root,
            next_id: AtomicI64::new(1),
            running: Mutex::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl BackendDriver for LocalDriver {
    fn descr(&self) -> String {
        format!("local:{}", self.repo_root.display())
    }

    fn capacity(&self) -> Rsrcs {
        self.capacity.clone()
    }

    fn import(&self, asked: &BTreeMap<String, u64>) -> Rsrcs {
        let mut res = BTreeMap::new();
        let mut single = false;
        for (k, v) in asked {
            match self.capacity.0.get(k) {
                None => single = true, // unrecognized: serialize the job
                Some(cap) => {
                    if v > cap {
                        single = true;
                        res.insert(k.clone(), *cap); // clamp to stay launchable
                    } else {
                        res.insert(k.clone(), *v);
                    }
                }
            }
        }
        if single {
            res.insert("<single>".to_string(), 1);
        }
        Rsrcs(res)
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

    async fn launch_job(&self, job: JobIdx, nice: u8, _prio: Timestamp) -> Result<SpawnId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let host = self.host.clone();
        let repo_root = self.repo_root.clone();
        let _ = nice; // local jobs inherit the engine's niceness
        let handle = tokio::spawn(async move {
            let start_req = JobStartRpcReq { seq_id: 0, job, service: "local".to_string(), msg: String::new() };
            let Some(reply) = host.job_start(start_req).await else { return };
            let end = run_job(reply.seq_id, job, &reply, &repo_root).await;
            host.job_end(end).await;
        });
        self.running.lock().unwrap().insert(id, handle);
        Ok(id)
    }

    fn kill_queued_job(&self, id: SpawnId) {
        if let Some(h) = self.running.lock().unwrap().remove(&id) {
            h.abort();
        }
    }

    fn heartbeat_queued_job(&self, _job: JobIdx, id: SpawnId) -> (String, HeartbeatState) {
        let running = self.running.lock().unwrap();
        match running.get(&id) {
            Some(h) if h.is_finished() => ("executor task died before start".to_string(), HeartbeatState::Lost),
            Some(_) => (String::new(), HeartbeatState::Alive),
            None => ("executor task vanished".to_string(), HeartbeatState::Lost),
        }
    }

    fn end_job(&self, _job: JobIdx, id: SpawnId, _status: Status) -> (String, bool) {
        self.running.lock().unwrap().remove(&id);
        (String::new(), false)
    }
}
