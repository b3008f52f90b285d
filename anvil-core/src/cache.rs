use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::digest::{Crc, DepDigest, FileSig, FileTag};
use crate::protocol::{CacheConfig, CacheUploadKey, JobInfo};
use crate::rules::CacheSpec;
use crate::types::CoarseDelay;

// ─── Match interface ──────────────────────────────────────────

/// Engine-side verdict about one recorded dep of a cache candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepState {
    /// Not yet built in the current invocation.
    NotDone,
    /// Built and its crc agrees with the recorded one.
    Match,
    /// Built and its crc disagrees.
    Mismatch,
}

/// Cache lookup outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheMatch {
    Hit {
        run: String,
    },
    /// Deps listed must be built, then the match retried.
    Match {
        new_deps: Vec<String>,
    },
    Miss,
}

// ─── Cache capability ─────────────────────────────────────────

/// The closed capability set every cache must honor.
pub trait Cache: Send + Sync {
    fn descr(&self) -> String;
    fn config(&self) -> CacheConfig;
    /// Walk candidate entries under `job_unique`, judging each recorded dep
    /// through `dep_state`.
    fn sub_match(&self, job_unique: &str, dep_state: &dyn Fn(&str, &DepDigest) -> DepState) -> Result<CacheMatch>;
    /// Fetch the entry blob: job info + decompressed per-target bytes.
    fn sub_download(&self, job_unique: &str, run: &str) -> Result<(JobInfo, Vec<Vec<u8>>)>;
    /// Reserve disk space; the returned key must be committed or dismissed.
    fn sub_upload(&self, reserved_sz: u64) -> Result<CacheUploadKey>;
    /// Stream blob bytes into the reservation.
    fn sub_stream(&self, key: CacheUploadKey, data: &[u8]) -> Result<()>;
    /// Install the reservation as a run of `job_unique`. Admission may
    /// still reject (too cheap to reproduce); the reservation is consumed
    /// either way.
    fn sub_commit(&self, key: CacheUploadKey, job_unique: &str, exe_time: CoarseDelay) -> Result<bool>;
    fn sub_dismiss(&self, key: CacheUploadKey) -> Result<()>;
}

/// The streamed upload payload, one blob per reservation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UploadBlob {
    pub job_info: JobInfo,
    /// Per-target compressed bytes, parallel to job_info targets.
    pub target_data: Vec<Vec<u8>>,
    pub zlvl: i32,
    /// Uncompressed total, for admission.
    pub total_sz: u64,
}

// ─── DirCache ─────────────────────────────────────────────────

/// LRU bookkeeping at the cache root, guarded by the dir lock.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct LruTab {
    /// entry dir (job_unique/run) -> (size, recency counter).
    entries: Vec<(String, u64, u64)>,
    clock: u64,
    total_sz: u64,
}

impl LruTab {
    fn remove(&mut self, name: &str) -> u64 {
        if let Some(pos) = self.entries.iter().position(|(n, _, _)| n == name) {
            let (_, sz, _) = self.entries.remove(pos);
            self.total_sz -= sz.min(self.total_sz);
            sz
        } else {
            0
        }
    }

    fn push_first(&mut self, name: String, sz: u64) {
        self.clock += 1;
        self.total_sz += sz;
        self.entries.push((name, sz, self.clock));
    }

    fn oldest(&self) -> Option<&str> {
        self.entries.iter().min_by_key(|(_, _, at)| *at).map(|(n, _, _)| n.as_str())
    }
}

/// A directory-backed cache shared between repos through file locks.
/// Upload is the only operation taking the global lock before a per-job
/// lock, so lock order is always global → job.
pub struct DirCache {
    dir: PathBuf,
    cfg: CacheSpec,
    reservations: Mutex<HashMap<CacheUploadKey, PathBuf>>,
}

/// Advisory lock over a directory, held for the lifetime of the value.
struct DirLock {
    _f: fs::File,
}

impl DirLock {
    fn exclusive(dir: &Path) -> Result<DirLock> {
        let f = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(".lock"))
            .with_context(|| format!("cannot open lock in {}", dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            if unsafe { libc::flock(f.as_raw_fd(), libc::LOCK_EX) } != 0 {
                bail!("cannot lock {}: {}", dir.display(), std::io::Error::last_os_error());
            }
        }
        Ok(DirLock { _f: f })
    }
}

impl DirCache {
    pub fn new(dir: impl Into<PathBuf>, cfg: CacheSpec) -> Result<DirCache> {
        let dir = dir.into();
        fs::create_dir_all(dir.join("reserved")).with_context(|| format!("cannot create cache at {}", dir.display()))?;
        Ok(DirCache { dir, cfg, reservations: Mutex::new(HashMap::new()) })
    }

    fn lru_file(&self) -> PathBuf {
        self.dir.join("lru")
    }

    fn load_lru(&self) -> LruTab {
        fs::read(self.lru_file())
            .ok()
            .and_then(|b| bincode::deserialize(&b).ok())
            .unwrap_or_default()
    }

    fn save_lru(&self, lru: &LruTab) -> Result<()> {
        let tmp = self.lru_file().with_extension("tmp");
        fs::write(&tmp, bincode::serialize(lru)?)?;
        fs::rename(&tmp, self.lru_file())?;
        Ok(())
    }

    /// Evict oldest entries until `new_sz` fits in place of `old_sz`.
    fn mk_room(&self, lru: &mut LruTab, old_sz: u64, new_sz: u64) -> Result<()> {
        if new_sz > self.cfg.max_sz {
            bail!("entry of {} bytes cannot fit cache of {} bytes", new_sz, self.cfg.max_sz);
        }
        let budget = self.cfg.max_sz - new_sz + old_sz;
        while lru.total_sz > budget {
            let Some(victim) = lru.oldest().map(str::to_string) else { break };
            lru.remove(&victim);
            let path = self.dir.join(&victim);
            if let Err(e) = fs::remove_dir_all(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(entry = %victim, "cannot evict cache entry: {e}");
                }
            }
            tracing::debug!(entry = %victim, "evicted from cache");
        }
        Ok(())
    }

    fn runs_of(&self, job_unique: &str) -> Vec<String> {
        let mut runs = Vec::new();
        if let Ok(rd) = fs::read_dir(self.dir.join(job_unique)) {
            for e in rd.flatten() {
                if e.path().is_dir() {
                    runs.push(e.file_name().to_string_lossy().into_owned());
                }
            }
        }
        runs.sort();
        runs
    }
}

impl Cache for DirCache {
    fn descr(&self) -> String {
        format!("dir:{}", self.dir.display())
    }

    fn config(&self) -> CacheConfig {
        CacheConfig {
            max_sz: self.cfg.max_sz,
            max_rate: self.cfg.max_rate,
            max_runs_per_job: self.cfg.max_runs_per_job,
        }
    }

    fn sub_match(&self, job_unique: &str, dep_state: &dyn Fn(&str, &DepDigest) -> DepState) -> Result<CacheMatch> {
        let job_dir = self.dir.join(job_unique);
        let _lock = DirLock::exclusive(&self.dir)?;
        let mut new_deps: Option<Vec<String>> = None;
        'candidate: for run in self.runs_of(job_unique) {
            let deps_file = job_dir.join(&run).join("deps");
            let Ok(bytes) = fs::read(&deps_file) else { continue };
            let deps: Vec<(String, DepDigest)> = match bincode::deserialize(&bytes) {
                Ok(d) => d,
                Err(_) => continue,
            };
            let mut nds: Vec<String> = Vec::new();
            let mut critical = false;
            for (dn, dd) in &deps {
                if critical && !dd.parallel {
                    break; // a critical dep needs rebuild: stop at the group end
                }
                match dep_state(dn, dd) {
                    DepState::NotDone => {
                        nds.push(dn.clone());
                        critical |= dd.dflags.contains(crate::types::Dflags::CRITICAL);
                    }
                    DepState::Mismatch => continue 'candidate,
                    DepState::Match => {}
                }
            }
            if nds.is_empty() {
                tracing::debug!(job = job_unique, run = %run, "cache hit");
                return Ok(CacheMatch::Hit { run });
            }
            match &mut new_deps {
                None => new_deps = Some(nds),
                Some(acc) => acc.retain(|d| nds.contains(d)),
            }
        }
        match new_deps {
            // a dep's name is determined by the content of the previous
            // ones, so surviving candidates always share their first
            // not-done dep and the intersection cannot be empty
            Some(nds) if !nds.is_empty() => Ok(CacheMatch::Match { new_deps: nds }),
            _ => Ok(CacheMatch::Miss),
        }
    }

    fn sub_download(&self, job_unique: &str, run: &str) -> Result<(JobInfo, Vec<Vec<u8>>)> {
        let run_dir = self.dir.join(job_unique).join(run);
        let blob: UploadBlob;
        {
            let _lock = DirLock::exclusive(&run_dir.parent().unwrap().to_path_buf())?;
            let bytes = fs::read(run_dir.join("data")).with_context(|| format!("cannot read cache entry {job_unique}/{run}"))?;
            blob = bincode::deserialize(&bytes).context("corrupt cache entry")?;
        }
        let mut targets = Vec::with_capacity(blob.target_data.len());
        for data in &blob.target_data {
            let raw = if blob.zlvl == 0 { data.clone() } else { zstd::decode_all(&data[..]).context("corrupt cache artifact")? };
            targets.push(raw);
        }
        // refresh recency, taking a single lock at a time
        {
            let _lock = DirLock::exclusive(&self.dir)?;
            let mut lru = self.load_lru();
            let name = format!("{job_unique}/{run}");
            let sz = lru.remove(&name);
            lru.push_first(name, sz);
            self.save_lru(&lru)?;
        }
        Ok((blob.job_info, targets))
    }

    fn sub_upload(&self, reserved_sz: u64) -> Result<CacheUploadKey> {
        if reserved_sz > self.cfg.max_sz {
            bail!("cannot reserve {} bytes in a cache of {} bytes", reserved_sz, self.cfg.max_sz);
        }
        let key = uuid::Uuid::now_v7().as_u128();
        let path = self.dir.join("reserved").join(format!("{key:032x}-data"));
        fs::File::create(&path)?;
        self.reservations.lock().unwrap().insert(key, path);
        Ok(key)
    }

    fn sub_stream(&self, key: CacheUploadKey, data: &[u8]) -> Result<()> {
        let resv = self.reservations.lock().unwrap();
        let path = resv.get(&key).ok_or_else(|| anyhow!("unknown upload key"))?;
        let mut f = fs::OpenOptions::new().append(true).open(path)?;
        f.write_all(data)?;
        Ok(())
    }

    fn sub_commit(&self, key: CacheUploadKey, job_unique: &str, exe_time: CoarseDelay) -> Result<bool> {
        let path = self
            .reservations
            .lock()
            .unwrap()
            .remove(&key)
            .ok_or_else(|| anyhow!("unknown upload key"))?;
        let bytes = fs::read(&path)?;
        let blob: UploadBlob = bincode::deserialize(&bytes).context("corrupt upload blob")?;
        // admission: a run regenerating its bytes faster than max_rate is
        // not worth the cache space
        let secs = (exe_time.as_millis() as f64 / 1000.0).max(1e-3);
        let rate = blob.total_sz as f64 / secs;
        if self.cfg.max_rate != 0 && rate > self.cfg.max_rate as f64 {
            fs::remove_file(&path).ok();
            tracing::debug!(job = job_unique, rate, "upload rejected: too cheap to reproduce");
            return Ok(false);
        }
        let new_sz = bytes.len() as u64;
        let job_dir = self.dir.join(job_unique);
        // global lock first, then the per-job lock: the only multi-lock path
        let _glock = DirLock::exclusive(&self.dir)?;
        fs::create_dir_all(&job_dir)?;
        let _jlock = DirLock::exclusive(&job_dir)?;
        let mut lru = self.load_lru();
        // bound runs per job
        let mut runs = self.runs_of(job_unique);
        while runs.len() + 1 > self.cfg.max_runs_per_job as usize {
            let victim = runs.remove(0);
            let name = format!("{job_unique}/{victim}");
            lru.remove(&name);
            fs::remove_dir_all(job_dir.join(&victim)).ok();
        }
        let run = format!("r{:016x}", uuid::Uuid::now_v7().as_u128() as u64);
        let name = format!("{job_unique}/{run}");
        let old_sz = lru.remove(&name);
        self.mk_room(&mut lru, old_sz, new_sz)?;
        let run_dir = job_dir.join(&run);
        fs::create_dir_all(&run_dir)?;
        // deps stored separately in a compact form so matching is fast
        fs::write(run_dir.join("deps"), bincode::serialize(&blob.job_info.end.digest.deps)?)?;
        fs::rename(&path, run_dir.join("data"))?;
        lru.push_first(name, new_sz);
        self.save_lru(&lru)?;
        tracing::info!(job = job_unique, run = %run, sz = new_sz, "cache entry committed");
        Ok(true)
    }

    fn sub_dismiss(&self, key: CacheUploadKey) -> Result<()> {
        if let Some(path) = self.reservations.lock().unwrap().remove(&key) {
            fs::remove_file(path).ok();
        }
        Ok(())
    }
}

// ─── Helpers shared by engine and executor ────────────────────

/// Upper bound of the compressed size, used to reserve cache space.
pub fn compress_max_sz(sz: u64, zlvl: i32) -> u64 {
    if zlvl == 0 {
        sz
    } else {
        sz + (sz >> 8) + 512
    }
}

pub fn compress(data: &[u8], zlvl: i32) -> Result<Vec<u8>> {
    if zlvl == 0 {
        Ok(data.to_vec())
    } else {
        zstd::encode_all(data, zlvl).context("cannot compress artifact")
    }
}

/// Write downloaded targets into the repo: atomically (tmp then rename),
/// restoring the exec bit and symlinks per the recorded digests.
pub fn install_targets(repo_root: &Path, job_info: &JobInfo, target_data: &[Vec<u8>]) -> Result<Vec<String>> {
    let mut installed = Vec::new();
    let targets = &job_info.end.digest.targets;
    if targets.len() != target_data.len() {
        bail!("cache entry inconsistent: {} targets, {} blobs", targets.len(), target_data.len());
    }
    let res = (|| -> Result<()> {
        for ((tn, td), data) in targets.iter().zip(target_data) {
            let dst = repo_root.join(tn);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            if !td.crc.exists() {
                continue; // phony or unproduced target
            }
            if td.crc.is_lnk() {
                let tgt = String::from_utf8_lossy(data).into_owned();
                fs::remove_file(&dst).ok();
                #[cfg(unix)]
                std::os::unix::fs::symlink(&tgt, &dst)?;
                #[cfg(not(unix))]
                fs::write(&dst, tgt.as_bytes())?;
            } else {
                let tmp = dst.with_extension("anvil.tmp");
                fs::write(&tmp, data)?;
                #[cfg(unix)]
                if td.sig.tag == FileTag::Exe {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o755))?;
                }
                fs::remove_file(&dst).ok();
                fs::rename(&tmp, &dst)?;
            }
            installed.push(tn.clone());
        }
        Ok(())
    })();
    match res {
        Ok(()) => Ok(installed),
        Err(e) => {
            // clean up the partial job
            for tn in &installed {
                fs::remove_file(repo_root.join(tn)).ok();
            }
            Err(e)
        }
    }
}

/// Build the upload blob for a finished run: read and compress targets,
/// verifying each target's signature after the copy so a concurrent
/// rewrite cannot sneak into the cache.
pub fn build_upload_blob(repo_root: &Path, job_info: &JobInfo, zlvl: i32) -> Result<UploadBlob> {
    let mut target_data = Vec::new();
    let mut total_sz = 0u64;
    for (tn, td) in &job_info.end.digest.targets {
        let path = repo_root.join(tn);
        let raw = if !td.crc.exists() {
            Vec::new()
        } else if td.crc.is_lnk() {
            fs::read_link(&path)?.to_string_lossy().into_owned().into_bytes()
        } else {
            fs::read(&path).with_context(|| format!("cannot read target {tn}"))?
        };
        let sig_now = FileSig::from_path(&path);
        if td.sig != FileSig::default() && sig_now != td.sig {
            bail!("target {tn} changed while uploading");
        }
        total_sz += raw.len() as u64;
        target_data.push(compress(&raw, zlvl)?);
    }
    let mut job_info = job_info.clone();
    // scrub repo-local details: ids, dates and resources do not transfer
    job_info.start.seq_id = 0;
    job_info.start.job = 0;
    job_info.start.reason = Default::default();
    job_info.start.rsrcs.clear();
    job_info.end.seq_id = 0;
    job_info.end.job = 0;
    for (_, td) in &mut job_info.end.digest.targets {
        td.sig = FileSig::default(); // dates are refreshed on download
    }
    Ok(UploadBlob { job_info, target_data, zlvl, total_sz })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{JobDigest, TargetDigest};
    use crate::types::{Dflags, Status};

    fn spec(max_sz: u64) -> CacheSpec {
        CacheSpec { max_sz, max_rate: 0, max_runs_per_job: 4, zlvl: 3, ..Default::default() }
    }

    fn mk_blob(targets: &[(&str, &[u8])], deps: &[(&str, Crc)]) -> UploadBlob {
        let mut ji = JobInfo::default();
        ji.end.digest = JobDigest {
            deps: deps
                .iter()
                .map(|(n, c)| {
                    (n.to_string(), DepDigest::new_static(Dflags::NONE).with_crc(*c))
                })
                .collect(),
            targets: targets
                .iter()
                .map(|(n, d)| {
                    (n.to_string(), TargetDigest { crc: Crc::from_bytes(d), written: true, ..Default::default() })
                })
                .collect(),
            status: Status::Ok,
            ..Default::default()
        };
        let mut total = 0u64;
        let target_data: Vec<Vec<u8>> = targets
            .iter()
            .map(|(_, d)| {
                total += d.len() as u64;
                compress(d, 3).unwrap()
            })
            .collect();
        UploadBlob { job_info: ji, target_data, zlvl: 3, total_sz: total }
    }

    fn upload(cache: &DirCache, job: &str, blob: &UploadBlob, exe_ms: u64) -> bool {
        let key = cache.sub_upload(1024).unwrap();
        cache.sub_stream(key, &bincode::serialize(blob).unwrap()).unwrap();
        cache.sub_commit(key, job, CoarseDelay::from_millis(exe_ms)).unwrap()
    }

    #[test]
    fn roundtrip_upload_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirCache::new(dir.path().join("cache"), spec(1 << 20)).unwrap();
        let blob = mk_blob(&[("out", b"hello\n")], &[("in", Crc::from_bytes(b"src"))]);
        assert!(upload(&cache, "job-a", &blob, 5000));

        let state = |_: &str, _: &DepDigest| DepState::Match;
        let m = cache.sub_match("job-a", &state).unwrap();
        let CacheMatch::Hit { run } = m else { panic!("expected hit, got {m:?}") };
        let (ji, data) = cache.sub_download("job-a", &run).unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0], b"hello\n");
        assert_eq!(ji.end.digest.targets[0].0, "out");
        // round-trip installs byte-identical targets
        let repo = tempfile::tempdir().unwrap();
        install_targets(repo.path(), &ji, &data).unwrap();
        assert_eq!(fs::read(repo.path().join("out")).unwrap(), b"hello\n");
        assert_eq!(Crc::from_path(&repo.path().join("out")).unwrap(), ji.end.digest.targets[0].1.crc);
    }

    #[test]
    fn match_rejects_on_mismatch_and_reports_new_deps() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirCache::new(dir.path().join("cache"), spec(1 << 20)).unwrap();
        let crc_a = Crc::from_bytes(b"A");
        let blob = mk_blob(&[("out", b"x")], &[("in1", crc_a), ("in2", Crc::from_bytes(b"B"))]);
        assert!(upload(&cache, "job-b", &blob, 5000));

        // crc disagreement on a done dep rejects the candidate
        let state = |dn: &str, _: &DepDigest| if dn == "in1" { DepState::Mismatch } else { DepState::Match };
        assert_eq!(cache.sub_match("job-b", &state).unwrap(), CacheMatch::Miss);

        // a not-yet-done dep surfaces as a partial match
        let state = |dn: &str, _: &DepDigest| if dn == "in2" { DepState::NotDone } else { DepState::Match };
        let m = cache.sub_match("job-b", &state).unwrap();
        assert_eq!(m, CacheMatch::Match { new_deps: vec!["in2".to_string()] });
    }

    #[test]
    fn dismiss_releases_reservation() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirCache::new(dir.path().join("cache"), spec(1 << 20)).unwrap();
        let key = cache.sub_upload(128).unwrap();
        cache.sub_stream(key, b"partial").unwrap();
        cache.sub_dismiss(key).unwrap();
        assert!(cache.sub_stream(key, b"more").is_err(), "reservation is gone");
        let n = fs::read_dir(dir.path().join("cache/reserved")).unwrap().count();
        assert_eq!(n, 0);
    }

    #[test]
    fn admission_rejects_cheap_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = spec(1 << 20);
        s.max_rate = 10; // absurdly low: everything is "too cheap"
        let cache = DirCache::new(dir.path().join("cache"), s).unwrap();
        let blob = mk_blob(&[("out", b"some data that is large enough")], &[]);
        assert!(!upload(&cache, "job-c", &blob, 10));
    }

    #[test]
    fn lru_evicts_oldest_to_make_room() {
        let dir = tempfile::tempdir().unwrap();
        let blob1 = mk_blob(&[("o1", &[1u8; 400])], &[]);
        let blob2 = mk_blob(&[("o2", &[2u8; 400])], &[]);
        let sz1 = bincode::serialize(&blob1).unwrap().len() as u64;
        let sz2 = bincode::serialize(&blob2).unwrap().len() as u64;
        let cache = DirCache::new(dir.path().join("cache"), spec(sz1 + sz2 / 2)).unwrap();
        assert!(upload(&cache, "job-1", &blob1, 60_000));
        assert!(upload(&cache, "job-2", &blob2, 60_000));
        // job-1 had to be evicted
        let state = |_: &str, _: &DepDigest| DepState::Match;
        assert_eq!(cache.sub_match("job-1", &state).unwrap(), CacheMatch::Miss);
        assert!(matches!(cache.sub_match("job-2", &state).unwrap(), CacheMatch::Hit { .. }));
    }

    #[test]
    fn runs_per_job_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirCache::new(dir.path().join("cache"), spec(1 << 20)).unwrap();
        for i in 0..6u8 {
            let blob = mk_blob(&[("out", &[i; 16])], &[("in", Crc::from_bytes(&[i]))]);
            assert!(upload(&cache, "job-r", &blob, 60_000));
        }
        assert!(cache.runs_of("job-r").len() <= 4);
    }
}
