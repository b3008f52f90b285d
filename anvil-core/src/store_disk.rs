use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::digest::{Crc, FileSig};
use crate::rules::RuleCrc;
use crate::store::{Dep, JobData, NodeData, Store, Target};
use crate::types::{
    Buildable, CacheHitInfo, JobIdx, MatchGen, NodeIdx, NodeStatus, Polluted, RunStatus, Status,
    Tflags, Tokens1,
};

/// Leading marker of the store image; bump on any layout change. A
/// mismatch discards the image and the engine starts from scratch.
const IMAGE_MARKER: &[u8] = b"anvil-store-v1\n";

// ─── Repo layout ──────────────────────────────────────────────

/// Where engine state lives inside a repo.
#[derive(Clone, Debug)]
pub struct RepoLayout {
    pub root: PathBuf,
}

impl RepoLayout {
    pub fn new(root: impl Into<PathBuf>) -> RepoLayout {
        RepoLayout { root: root.into() }
    }

    pub fn admin_dir(&self) -> PathBuf {
        self.root.join(".anvil")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.admin_dir().join("store")
    }

    pub fn image_file(&self) -> PathBuf {
        self.store_dir().join("image")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.admin_dir().join("outputs")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.admin_dir().join("quarantine")
    }

    pub fn debug_dir(&self) -> PathBuf {
        self.admin_dir().join("debug")
    }

    pub fn codec_dir(&self) -> PathBuf {
        self.admin_dir().join("codec")
    }

    /// Per-job ancillary file holding the start/end blobs of the last run.
    pub fn ancillary_file(&self, job_name: &str) -> PathBuf {
        let mut enc = String::with_capacity(job_name.len());
        for c in job_name.chars() {
            enc.push(if c == '/' { '\u{1}' } else { c });
        }
        self.admin_dir().join("job_info").join(enc)
    }

    pub fn summary_file(&self, which: &str) -> PathBuf {
        self.admin_dir().join(format!("{which}.json"))
    }
}

// ─── Persistent image ─────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct PersistNode {
    name: String,
    crc: Crc,
    sig: FileSig,
    buildable: Buildable,
    status: NodeStatus,
    match_gen: MatchGen,
    actual_job: Option<JobIdx>,
    actual_tflags: Tflags,
    polluted: Polluted,
    conform_job: Option<JobIdx>,
    no_trigger: bool,
}

#[derive(Serialize, Deserialize)]
struct PersistJob {
    full_name: String,
    rule_name: String,
    rule_crc: RuleCrc,
    stems: Vec<Option<String>>,
    deps: Vec<Dep>,
    targets: Vec<Target>,
    status: Status,
    run_status: RunStatus,
    cost: f64,
    exe_time: f64,
    tokens1: Tokens1,
    cache_hit_info: CacheHitInfo,
    backend: String,
}

#[derive(Serialize, Deserialize)]
struct Image {
    match_gen: MatchGen,
    nodes: Vec<PersistNode>,
    jobs: Vec<PersistJob>,
}

/// Save the store image. Skipped (with a debug trace) on read-only repos.
pub fn save(store: &Store, layout: &RepoLayout) -> Result<()> {
    if store.read_only {
        tracing::debug!("read-only repo, store not saved");
        return Ok(());
    }
    let image = Image {
        match_gen: store.match_gen,
        nodes: store
            .nodes
            .iter()
            .map(|n| PersistNode {
                name: n.name.clone(),
                crc: n.crc,
                sig: n.sig,
                buildable: n.buildable,
                status: n.status,
                match_gen: n.match_gen,
                actual_job: n.actual_job,
                actual_tflags: n.actual_tflags,
                polluted: n.polluted,
                conform_job: n.conform_job,
                no_trigger: n.no_trigger,
            })
            .collect(),
        jobs: store
            .jobs
            .iter()
            .map(|j| PersistJob {
                full_name: j.full_name.clone(),
                rule_name: store.rules.get(j.rule).name.clone(),
                rule_crc: j.rule_crc,
                stems: j.stems.clone(),
                deps: j.deps.clone(),
                targets: j.targets.clone(),
                status: j.status,
                run_status: j.run_status,
                cost: j.cost,
                exe_time: j.exe_time,
                tokens1: j.tokens1,
                cache_hit_info: j.cache_hit_info,
                backend: j.backend.clone(),
            })
            .collect(),
    };
    fs::create_dir_all(layout.store_dir()).context("cannot create store dir")?;
    let tmp = layout.image_file().with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp).with_context(|| format!("cannot create {}", tmp.display()))?;
        f.write_all(IMAGE_MARKER)?;
        let payload = bincode::serialize(&image).context("cannot serialize store image")?;
        f.write_all(&payload)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, layout.image_file()).context("cannot install store image")?;
    tracing::info!(nodes = image.nodes.len(), jobs = image.jobs.len(), "store image saved");
    Ok(())
}

/// Load a previously saved image into a fresh store. Jobs whose rule no
/// longer exists are dropped and every job reference is remapped.
pub fn load(store: &mut Store, layout: &RepoLayout) -> Result<()> {
    let path = layout.image_file();
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("cannot read {}", path.display())),
    };
    let Some(payload) = bytes.strip_prefix(IMAGE_MARKER) else {
        tracing::warn!(path = %path.display(), "store image version mismatch, starting fresh");
        return Ok(());
    };
    let image: Image = bincode::deserialize(payload).context("corrupt store image")?;
    //
    // jobs first: build the old->new index map (None = rule disappeared)
    let mut job_map: Vec<Option<JobIdx>> = Vec::with_capacity(image.jobs.len());
    for pj in &image.jobs {
        match store.rules.by_name(&pj.rule_name) {
            Some((rule, _)) => {
                let idx = store.job(&pj.full_name, rule, pj.stems.clone());
                let jd = store.job_data_mut(idx);
                jd.rule_crc = pj.rule_crc;
                jd.deps = pj.deps.clone();
                jd.targets = pj.targets.clone();
                jd.status = pj.status;
                jd.run_status = pj.run_status;
                jd.cost = pj.cost;
                jd.exe_time = pj.exe_time;
                jd.tokens1 = pj.tokens1;
                jd.cache_hit_info = pj.cache_hit_info;
                jd.backend = pj.backend.clone();
                job_map.push(Some(idx));
            }
            None => {
                tracing::warn!(job = %pj.full_name, rule = %pj.rule_name, "rule disappeared, dropping job");
                job_map.push(None);
            }
        }
    }
    let remap = |j: Option<JobIdx>| j.and_then(|j| job_map.get(j as usize).copied().flatten());
    for pn in &image.nodes {
        let idx = store.node(&pn.name);
        let nd = store.node_data_mut(idx);
        nd.crc = pn.crc;
        nd.sig = pn.sig;
        nd.buildable = pn.buildable;
        nd.status = pn.status;
        nd.match_gen = pn.match_gen;
        nd.actual_job = remap(pn.actual_job);
        nd.actual_tflags = pn.actual_tflags;
        nd.polluted = pn.polluted;
        nd.conform_job = remap(pn.conform_job);
        nd.no_trigger = pn.no_trigger;
    }
    // node indices are re-interned: remap dep/target references
    let mut node_map: Vec<NodeIdx> = Vec::with_capacity(image.nodes.len());
    for pn in &image.nodes {
        node_map.push(store.node(&pn.name));
    }
    for pj in image.jobs.iter() {
        if let Some(idx) = store.job_of(&pj.full_name) {
            let jd = store.job_data_mut(idx);
            for d in &mut jd.deps {
                let old = d.node as usize;
                if old < node_map.len() {
                    d.node = node_map[old];
                }
            }
            for t in &mut jd.targets {
                let old = t.node as usize;
                if old < node_map.len() {
                    t.node = node_map[old];
                }
            }
        }
    }
    store.match_gen = image.match_gen.max(1);
    tracing::info!(nodes = store.nodes.len(), jobs = store.jobs.len(), "store image loaded");
    Ok(())
}

/// Regenerate the human-readable summaries.
pub fn write_summaries(store: &Store, layout: &RepoLayout, manifest_yaml: &str) -> Result<()> {
    if store.read_only {
        return Ok(());
    }
    fs::create_dir_all(layout.admin_dir())?;
    let rules: Vec<serde_json::Value> = store
        .rules
        .rules
        .iter()
        .map(|r| {
            serde_json::json!({
                "name": r.name,
                "prio": r.prio,
                "targets": r.targets.iter().map(|t| &t.name).collect::<Vec<_>>(),
                "cmd": r.cmd,
                "backend": r.backend,
            })
        })
        .collect();
    fs::write(layout.summary_file("rules"), serde_json::to_string_pretty(&rules)?)?;
    fs::write(
        layout.summary_file("config"),
        serde_json::to_string_pretty(&serde_json::json!({
            "match_gen": store.match_gen,
            "sources": store.rules.sources,
            "source_dirs": store.rules.source_dirs,
            "sub_repos": store.rules.sub_repos,
        }))?,
    )?;
    fs::write(layout.summary_file("manifest"), manifest_yaml)?;
    Ok(())
}

/// Detect whether the repo is writable by probing the admin dir.
pub fn probe_read_only(layout: &RepoLayout) -> bool {
    let admin = layout.admin_dir();
    if fs::create_dir_all(&admin).is_err() {
        return true;
    }
    let probe = admin.join(".probe");
    match fs::File::create(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            false
        }
        Err(_) => true,
    }
}

/// Move a file aside into quarantine instead of destroying it.
pub fn quarantine(layout: &RepoLayout, rel_path: &str) -> Result<PathBuf> {
    let src = layout.root.join(rel_path);
    let dst = layout.quarantine_dir().join(rel_path);
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    if dst.exists() {
        fs::remove_file(&dst).ok();
    }
    match fs::rename(&src, &dst) {
        Ok(()) => Ok(dst),
        Err(e) => bail!("cannot quarantine {rel_path}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::DepDigest;
    use crate::rules::{Manifest, RuleSet};

    fn rules() -> RuleSet {
        RuleSet::compile(
            &Manifest::parse(
                r#"
sources: ["in"]
rules:
  - name: copy
    targets: { out: "out" }
    deps: { src: "in" }
    cmd: "cp in out"
"#,
            )
            .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        let mut s = Store::new(rules());
        let n_in = s.node("in");
        let n_out = s.node("out");
        s.node_data_mut(n_in).crc = Crc::from_bytes(b"hello\n");
        let j = s.job("copy:", 0, vec![]);
        s.job_data_mut(j).deps = vec![Dep { node: n_in, digest: DepDigest::new_static(Default::default()) }];
        s.job_data_mut(j).targets = vec![Target { node: n_out, digest: Default::default() }];
        s.job_data_mut(j).status = Status::Ok;
        s.node_data_mut(n_out).actual_job = Some(j);
        s.match_gen = 7;
        save(&s, &layout).unwrap();

        let mut s2 = Store::new(rules());
        load(&mut s2, &layout).unwrap();
        assert_eq!(s2.match_gen, 7);
        let j2 = s2.job_of("copy:").unwrap();
        assert_eq!(s2.job_data(j2).status, Status::Ok);
        assert_eq!(s2.job_data(j2).deps.len(), 1);
        let n_in2 = s2.node_of("in").unwrap();
        assert_eq!(s2.job_data(j2).deps[0].node, n_in2);
        assert_eq!(s2.node_data(n_in2).crc, Crc::from_bytes(b"hello\n"));
        let n_out2 = s2.node_of("out").unwrap();
        assert_eq!(s2.node_data(n_out2).actual_job, Some(j2));
    }

    #[test]
    fn version_mismatch_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        fs::create_dir_all(layout.store_dir()).unwrap();
        fs::write(layout.image_file(), b"something else entirely").unwrap();
        let mut s = Store::new(rules());
        load(&mut s, &layout).unwrap();
        assert!(s.nodes.is_empty());
        assert!(s.jobs.is_empty());
    }

    #[test]
    fn dropped_rule_drops_job_and_remaps() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        let mut s = Store::new(rules());
        let n_out = s.node("out");
        let j = s.job("copy:", 0, vec![]);
        s.node_data_mut(n_out).actual_job = Some(j);
        save(&s, &layout).unwrap();

        let empty = RuleSet::compile(&Manifest::parse("rules: []").unwrap()).unwrap();
        let mut s2 = Store::new(empty);
        load(&mut s2, &layout).unwrap();
        assert!(s2.job_of("copy:").is_none());
        let n2 = s2.node_of("out").unwrap();
        assert_eq!(s2.node_data(n2).actual_job, None);
    }

    #[test]
    fn quarantine_moves_aside() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        fs::write(dir.path().join("f"), b"data").unwrap();
        let dst = quarantine(&layout, "f").unwrap();
        assert!(!dir.path().join("f").exists());
        assert_eq!(fs::read(dst).unwrap(), b"data");
    }
}
