use std::path::Path;

use crate::digest::{Crc, DepDigest, DepInfo, FileSig, FileTag};
use crate::store::Store;
use crate::store_disk::RepoLayout;
use crate::types::{Accesses, Bool3, Buildable, Manual, NodeIdx, NodeStatus};

/// Classify a node against the current rule set: source, under a source
/// dir, anti, or backed by candidate rules. Cached until the match
/// generation moves.
pub fn set_buildable(store: &mut Store, node: NodeIdx) {
    if store.node_fresh(node) {
        return;
    }
    let name = store.node_data(node).name.clone();
    let (buildable, status, rule_tgts) = if store.rules.sources.iter().any(|s| *s == name) {
        (Buildable::Src, NodeStatus::Src, Vec::new())
    } else if store.rules.source_dirs.iter().any(|d| d.trim_end_matches('/') == name) {
        (Buildable::SrcDir, NodeStatus::Src, Vec::new())
    } else if store.rules.source_dir_of(&name).is_some() {
        (Buildable::SubSrcDir, NodeStatus::Src, Vec::new())
    } else {
        let mut cands = Vec::new();
        let mut buildable = Buildable::No;
        for rt in store.match_tab.rule_tgts(&name) {
            let rule = store.rules.get(rt.rule);
            let tgt = &rule.targets[rt.tgt as usize];
            if tgt.pattern.bind(&name, rule.stems.len()).is_none() {
                continue; // literal buckets are conservative, stems decide
            }
            match rule.special {
                crate::rules::Special::Anti => {
                    if cands.is_empty() {
                        buildable = Buildable::Anti;
                    }
                    break; // anti masks every lower-priority rule
                }
                crate::rules::Special::GenericSrc => {
                    if cands.is_empty() {
                        buildable = Buildable::Src;
                    }
                    break;
                }
                _ => {
                    cands.push(*rt);
                    buildable = Buildable::Maybe;
                }
            }
        }
        let status = if cands.is_empty() { NodeStatus::Plain } else { NodeStatus::Makable };
        (buildable, status, cands)
    };
    let gen = store.match_gen;
    let nd = store.node_data_mut(node);
    nd.buildable = buildable;
    nd.status = status;
    nd.rule_tgts = rule_tgts;
    nd.match_gen = gen;
    tracing::trace!(node = %nd.name, ?buildable, "classified");
}

/// Refresh a source node from disk. Returns true if its content changed
/// since last recorded.
pub fn refresh_src(store: &mut Store, layout: &RepoLayout, node: NodeIdx) -> std::io::Result<bool> {
    let name = store.node_data(node).name.clone();
    let path = layout.root.join(&name);
    let sig = FileSig::from_path(&path);
    let nd = store.node_data(node);
    if sig == nd.sig && nd.crc.valid() {
        return Ok(false); // signature unchanged: content is unchanged
    }
    let crc = match sig.crc_hint() {
        Some(c) => c,
        None => Crc::from_path(&path)?,
    };
    let nd = store.node_data_mut(node);
    let modified = nd.crc.valid() && nd.crc != crc;
    nd.sig = sig;
    nd.crc = crc;
    Ok(modified)
}

/// Compare a node's on-disk state with what the engine recorded: detects
/// manual overwrites of targets between runs.
pub fn manual_state(store: &Store, layout: &RepoLayout, node: NodeIdx) -> Manual {
    let nd = store.node_data(node);
    let path = layout.root.join(&nd.name);
    let sig = FileSig::from_path(&path);
    if !sig.exists() {
        return if nd.crc.exists() { Manual::Unlnked } else { Manual::Ok };
    }
    if sig == nd.sig {
        return Manual::Ok;
    }
    let crc = Crc::from_path(&path).unwrap_or(Crc::UNKNOWN);
    if crc.valid() && crc == nd.crc {
        return Manual::Ok; // touched, not modified
    }
    if sig.tag == FileTag::Empty {
        Manual::Empty
    } else {
        Manual::Modif
    }
}

/// Build verdict of a node as seen by a dependent job. Yes = usable,
/// No = produced in error, Maybe = not buildable.
pub fn node_ok(store: &Store, node: NodeIdx) -> Bool3 {
    let nd = store.node_data(node);
    match nd.buildable {
        Buildable::Src | Buildable::SrcDir | Buildable::SubSrcDir => {
            return if nd.crc.exists() { Bool3::Yes } else { Bool3::Maybe }
        }
        Buildable::No | Buildable::Anti | Buildable::Unknown => return Bool3::Maybe,
        _ => {}
    }
    match nd.actual_job.or(nd.conform_job) {
        Some(j) => {
            let jd = store.job_data(j);
            if !jd.run_status.is_ok() {
                Bool3::No
            } else {
                jd.status.ok()
            }
        }
        None => Bool3::Maybe,
    }
}

/// Is the recorded dep still observationally current w.r.t. the node?
/// `full` treats the dep as fully accessed (used for static deps once a
/// modif has been seen, to avoid reruns hiding behind earlier errors).
pub fn dep_up_to_date(store: &Store, node: NodeIdx, dep: &DepDigest, full: bool) -> bool {
    let nd = store.node_data(node);
    let accesses = if full { Accesses::FULL } else { dep.accesses };
    match dep.info {
        DepInfo::Crc(c) => c.matches(nd.crc, accesses),
        DepInfo::Sig(s) => {
            if s == nd.sig && s.exists() {
                true
            } else {
                // promote to crc comparison when the tag alone decides
                match s.crc_hint() {
                    Some(c) => c.matches(nd.crc, accesses),
                    None => false,
                }
            }
        }
    }
}

/// True when the file was written within fs clock granularity of its
/// mtime: its recorded crc cannot be trusted across the boundary.
pub fn is_hot(sig: FileSig, end_date_ms: i64, ddate_prec_ns: i128) -> bool {
    let end_ns = end_date_ms as i128 * 1_000_000;
    sig.exists() && (end_ns - sig.mtime_ns) < ddate_prec_ns
}

/// Detect a transient node: some dir on its path is a symlink, so the
/// node will disappear at the next run.
pub fn is_transient(store: &Store, layout: &RepoLayout, node: NodeIdx) -> bool {
    let nd = store.node_data(node);
    let mut dir = nd.dir;
    while let Some(d) = dir {
        let dd = store.node_data(d);
        let p: &Path = &layout.root.join(&dd.name);
        if std::fs::symlink_metadata(p).map(|m| m.file_type().is_symlink()).unwrap_or(false) {
            return true;
        }
        dir = dd.dir;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Manifest, RuleSet};
    use crate::types::Dflags;

    fn store() -> Store {
        let m = Manifest::parse(
            r#"
sources: ["in"]
source_dirs: ["vendor"]
rules:
  - name: compile
    stems: { f: "[^/]+" }
    targets: { obj: "build/{f}.o" }
    deps: { src: "src/{f}.c" }
    cmd: "cc"
  - name: no_tmp
    kind: anti
    stems: { p: ".+" }
    targets: { t: "{p}.tmp" }
    cmd: ""
"#,
        )
        .unwrap();
        Store::new(RuleSet::compile(&m).unwrap())
    }

    #[test]
    fn classification() {
        let mut s = store();
        let src = s.node("in");
        let sub = s.node("vendor/lib/a.h");
        let obj = s.node("build/x.o");
        let tmp = s.node("a/b.tmp");
        let other = s.node("README");
        for n in [src, sub, obj, tmp, other] {
            set_buildable(&mut s, n);
        }
        assert_eq!(s.node_data(src).buildable, Buildable::Src);
        assert_eq!(s.node_data(sub).buildable, Buildable::SubSrcDir);
        assert_eq!(s.node_data(obj).buildable, Buildable::Maybe);
        assert_eq!(s.node_data(obj).rule_tgts.len(), 1);
        assert_eq!(s.node_data(tmp).buildable, Buildable::Anti);
        assert_eq!(s.node_data(other).buildable, Buildable::No);
    }

    #[test]
    fn classification_is_cached_until_gen_bump() {
        let mut s = store();
        let obj = s.node("build/x.o");
        set_buildable(&mut s, obj);
        assert!(s.node_fresh(obj));
        s.node_data_mut(obj).buildable = Buildable::No; // sabotage the cache
        set_buildable(&mut s, obj);
        assert_eq!(s.node_data(obj).buildable, Buildable::No, "fresh nodes are not recomputed");
        s.bump_match_gen();
        set_buildable(&mut s, obj);
        assert_eq!(s.node_data(obj).buildable, Buildable::Maybe, "stale nodes are");
    }

    #[test]
    fn manual_detection() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        let mut s = store();
        let n = s.node("out");
        // recorded as existing, absent on disk
        s.node_data_mut(n).crc = Crc::from_bytes(b"content");
        assert_eq!(manual_state(&s, &layout, n), Manual::Unlnked);
        // matching content
        std::fs::write(dir.path().join("out"), b"content").unwrap();
        s.node_data_mut(n).sig = FileSig::from_path(&dir.path().join("out"));
        assert_eq!(manual_state(&s, &layout, n), Manual::Ok);
        // modified content
        std::fs::write(dir.path().join("out"), b"edited by hand").unwrap();
        assert_eq!(manual_state(&s, &layout, n), Manual::Modif);
        // emptied
        std::fs::write(dir.path().join("out"), b"").unwrap();
        assert_eq!(manual_state(&s, &layout, n), Manual::Empty);
    }

    #[test]
    fn up_to_date_respects_accesses() {
        let mut s = store();
        let n = s.node("in");
        s.node_data_mut(n).crc = Crc::from_bytes(b"v1");
        let read_dep = DepDigest {
            accesses: Accesses::READ,
            ..DepDigest::new_static(Dflags::NONE)
        }
        .with_crc(Crc::from_bytes(b"v1"));
        assert!(dep_up_to_date(&s, n, &read_dep, false));
        s.node_data_mut(n).crc = Crc::from_bytes(b"v2");
        assert!(!dep_up_to_date(&s, n, &read_dep, false));
        // a stat-only dep does not care about content
        let stat_dep = DepDigest { accesses: Accesses::STAT, ..Default::default() }.with_crc(Crc::from_bytes(b"v1"));
        assert!(dep_up_to_date(&s, n, &stat_dep, false));
        // unless treated as fully accessed
        assert!(!dep_up_to_date(&s, n, &stat_dep, true));
    }

    #[test]
    fn hot_window() {
        let sig = FileSig { tag: FileTag::Reg, mtime_ns: 1_000_000_000 };
        let prec = 10_000_000i128; // 10ms
        assert!(is_hot(sig, 1_000, prec), "written at end date");
        assert!(!is_hot(sig, 2_000, prec), "well past the window");
    }
}
