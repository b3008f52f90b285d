use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::types::{SeqId, SmallId};

// ─── Views ────────────────────────────────────────────────────

/// Physical layers backing a view: (upper, lower...). A single layer is a
/// plain bind mount, two or more become an overlay.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewDescr {
    pub phys: Vec<String>,
    /// Dirs & files to create in upper (mkdir, or copy from a lower).
    pub copy_up: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChrootAction {
    Passwd,
    Group,
    Nsswitch,
    Resolv,
}

/// Chroot-style execution description.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChrootInfo {
    /// User-supplied root dir; empty = no chroot.
    pub dir: String,
    /// /etc files to pre-populate inside the chroot.
    pub actions: Vec<ChrootAction>,
}

/// The filesystem view in which a job executes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpace {
    /// Absolute dir under which the job sees the anvil installation.
    pub anvil_view: String,
    /// Absolute dir under which the job sees the repo root.
    pub repo_view: String,
    /// Absolute dir under which the job sees its tmp dir.
    pub tmp_view: String,
    /// view dir -> layers.
    pub views: Vec<(String, ViewDescr)>,
}

impl JobSpace {
    /// True if executing the job requires a mount namespace.
    pub fn needs_ns(&self) -> bool {
        !self.anvil_view.is_empty()
            || !self.repo_view.is_empty()
            || !self.tmp_view.is_empty()
            || !self.views.is_empty()
    }

    /// Canonicalize every view path. Idempotent.
    pub fn mk_canon(&mut self) {
        for v in [&mut self.anvil_view, &mut self.repo_view, &mut self.tmp_view] {
            if !v.is_empty() {
                *v = mk_canon(v);
            }
        }
        for (dir, descr) in &mut self.views {
            *dir = mk_canon(dir);
            for p in &mut descr.phys {
                *p = mk_canon(p);
            }
        }
    }

    /// Validate the space. `src_dirs_relative` reflects whether any source
    /// dir is given relative to the repo; remapping the repo while source
    /// dirs are relative is rejected.
    pub fn check(&self, phy_repo_root: &str, src_dirs_relative: bool) -> Result<()> {
        if !self.repo_view.is_empty() && self.repo_view != phy_repo_root && src_dirs_relative {
            bail!("repo_view {} cannot remap repo root {} while source dirs are relative", self.repo_view, phy_repo_root);
        }
        for (dir, descr) in &self.views {
            if descr.phys.is_empty() {
                bail!("view {dir} has no layer");
            }
            for (i, layer) in descr.phys.iter().enumerate() {
                if layer.contains(',') {
                    bail!("',' is forbidden in view layer {layer}");
                }
                if i > 0 && layer.contains(':') {
                    bail!("':' is forbidden in lower layer {layer}");
                }
            }
        }
        Ok(())
    }
}

/// Lexical path canonicalization: collapse `//`, `.` and `..` components.
/// Leading `..` components of a relative path are kept. Idempotent.
pub fn mk_canon(path: &str) -> String {
    let abs = path.starts_with('/');
    let mut comps: Vec<&str> = Vec::new();
    for c in path.split('/') {
        match c {
            "" | "." => {}
            ".." => {
                if matches!(comps.last(), Some(&last) if last != "..") {
                    comps.pop();
                } else if !abs {
                    comps.push("..");
                }
            }
            c => comps.push(c),
        }
    }
    let body = comps.join("/");
    if abs {
        format!("/{body}")
    } else if body.is_empty() {
        ".".to_string()
    } else {
        body
    }
}

// ─── Env substitution ─────────────────────────────────────────

fn is_word(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

/// Substitute `$NAME` and `${NAME}` occurrences using `vars`. A NAME ends
/// at the first non-word char. Unknown names are left untouched.
pub fn subst_env(text: &str, vars: &HashMap<&str, String>) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            out.push(bytes[i] as char);
            i += 1;
            continue;
        }
        let (name, end) = if i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            match bytes[i + 2..].iter().position(|&c| c == b'}') {
                Some(close) => (&text[i + 2..i + 2 + close], i + 2 + close + 1),
                None => {
                    out.push('$');
                    i += 1;
                    continue;
                }
            }
        } else {
            let mut j = i + 1;
            while j < bytes.len() && is_word(bytes[j]) {
                j += 1;
            }
            (&text[i + 1..j], j)
        };
        match vars.get(name) {
            Some(v) => out.push_str(v),
            None => out.push_str(&text[i..end]),
        }
        i = end;
    }
    out
}

/// Values visible to the post-pass rewriting env values and interpreters.
pub struct EnvCtx {
    pub anvil_root: String,
    pub repo_root: String,
    pub top_repo_root: String,
    pub tmp_dir: String,
    pub phy_anvil_root: String,
    pub phy_repo_root: String,
    pub phy_tmp_dir: String,
    pub small_id: SmallId,
    pub seq_id: SeqId,
    pub std_path: String,
    pub shell: String,
}

impl EnvCtx {
    fn vars(&self) -> HashMap<&'static str, String> {
        HashMap::from([
            ("ANVIL_ROOT", self.anvil_root.clone()),
            ("REPO_ROOT", self.repo_root.clone()),
            ("TOP_REPO_ROOT", self.top_repo_root.clone()),
            ("TMPDIR", self.tmp_dir.clone()),
            ("PHYSICAL_ANVIL_ROOT", self.phy_anvil_root.clone()),
            ("PHYSICAL_REPO_ROOT", self.phy_repo_root.clone()),
            ("PHYSICAL_TMPDIR", self.phy_tmp_dir.clone()),
            ("SMALL_ID", self.small_id.to_string()),
            ("SEQUENCE_ID", self.seq_id.to_string()),
            ("STD_PATH", self.std_path.clone()),
            ("SHELL", self.shell.clone()),
        ])
    }

    /// Rewrite env values and `interpreter[0]` after the space is entered.
    pub fn update_env(&self, env: &mut [(String, String)], interpreter: &mut [String]) {
        let vars = self.vars();
        for (_, v) in env.iter_mut() {
            *v = subst_env(v, &vars);
        }
        if let Some(first) = interpreter.first_mut() {
            *first = subst_env(first, &vars);
        }
    }
}

// ─── Simple-cmd optimization ──────────────────────────────────

const SH_SPECIAL: &[u8] = b"$`\"'\\*?[];&|<>(){}~!\n#=";
const SH_RESERVED: &[&str] = &[
    "if", "then", "else", "elif", "fi", "case", "esac", "for", "while", "until", "do", "done",
    "function", "select", "time", "coproc", "in",
];

/// If `cmd` is a trivial shell body (no quoting, expansion or control
/// state; resolves to one executable, possibly through PATH), return the
/// argv for a direct exec, dropping the `sh -c` wrapper.
pub fn simplify_cmd(cmd: &str, path: &str) -> Option<Vec<String>> {
    let cmd = cmd.trim();
    if cmd.is_empty() || cmd.bytes().any(|b| SH_SPECIAL.contains(&b)) {
        return None;
    }
    let words: Vec<&str> = cmd.split_ascii_whitespace().collect();
    let first = *words.first()?;
    if SH_RESERVED.contains(&first) {
        return None;
    }
    let exe = if first.contains('/') {
        let p = Path::new(first);
        if !is_executable(p) {
            return None;
        }
        first.to_string()
    } else {
        resolve_in_path(first, path)?
    };
    let mut argv = vec![exe];
    argv.extend(words[1..].iter().map(|w| w.to_string()));
    Some(argv)
}

fn resolve_in_path(name: &str, path: &str) -> Option<String> {
    for dir in path.split(':') {
        if dir.is_empty() {
            continue;
        }
        let cand = Path::new(dir).join(name);
        if is_executable(&cand) {
            return Some(cand.to_string_lossy().into_owned());
        }
    }
    None
}

fn is_executable(p: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(p).map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        p.is_file()
    }
}

// ─── First-pid spreading ──────────────────────────────────────

const FIRST_PID: u64 = 300;
const N_PIDS: u64 = 4_194_304 - FIRST_PID;
/// Golden-ratio fraction of a 32-bit range: consecutive small ids land far
/// apart, minimizing pid collisions between concurrent jobs that embed
/// pids in tmp file names.
const DELTA_PID: u64 = 2_654_435_769;

pub fn first_pid(small_id: SmallId) -> u64 {
    FIRST_PID + ((small_id as u64 * DELTA_PID) >> 12) % N_PIDS
}

// ─── Namespace entry (linux) ──────────────────────────────────

/// Scratch state to clean up when the job ends.
#[derive(Debug, Default)]
pub struct SpaceGuard {
    pub tmp_dir: Option<PathBuf>,
    pub keep_tmp: bool,
}

impl Drop for SpaceGuard {
    fn drop(&mut self) {
        if self.keep_tmp {
            return;
        }
        if let Some(d) = &self.tmp_dir {
            if let Err(e) = std::fs::remove_dir_all(d) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dir = %d.display(), "cannot remove job tmp dir: {e}");
                }
            }
        }
    }
}

/// Enter the job space: unshare user+mount namespaces, map uid/gid, set up
/// bind/overlay mounts for the configured views, chroot when requested.
/// Returns whether a namespace was actually entered.
#[cfg(target_os = "linux")]
pub fn enter(
    space: &JobSpace,
    chroot_info: &ChrootInfo,
    phy_repo_root: &str,
    phy_tmp_dir: &str,
    small_id: SmallId,
) -> Result<bool> {
    use std::ffi::CString;
    use std::io::Write;

    if !space.needs_ns() && chroot_info.dir.is_empty() {
        return Ok(false);
    }
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    // user namespace first so mounts need no privilege
    if unsafe { libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNS) } != 0 {
        bail!("cannot unshare user+mount namespaces: {}", std::io::Error::last_os_error());
    }
    std::fs::write("/proc/self/setgroups", "deny")?;
    std::fs::write("/proc/self/uid_map", format!("{uid} {uid} 1"))?;
    std::fs::write("/proc/self/gid_map", format!("{gid} {gid} 1"))?;
    // make the whole tree private so our mounts do not leak out
    let root = CString::new("/")?;
    if unsafe { libc::mount(std::ptr::null(), root.as_ptr(), std::ptr::null(), libc::MS_REC | libc::MS_PRIVATE, std::ptr::null()) } != 0 {
        bail!("cannot make / private: {}", std::io::Error::last_os_error());
    }
    let bind = |src: &str, dst: &str| -> Result<()> {
        std::fs::create_dir_all(dst).ok();
        let csrc = CString::new(src)?;
        let cdst = CString::new(dst)?;
        if unsafe { libc::mount(csrc.as_ptr(), cdst.as_ptr(), std::ptr::null(), libc::MS_BIND | libc::MS_REC, std::ptr::null()) } != 0 {
            bail!("cannot bind {src} on {dst}: {}", std::io::Error::last_os_error());
        }
        Ok(())
    };
    if !space.repo_view.is_empty() && space.repo_view != phy_repo_root {
        bind(phy_repo_root, &space.repo_view)?;
    }
    if !space.tmp_view.is_empty() {
        bind(phy_tmp_dir, &space.tmp_view)?;
    }
    for (dir, descr) in &space.views {
        match descr.phys.len() {
            1 => bind(&descr.phys[0], dir)?,
            _ => {
                let upper = &descr.phys[0];
                let work = format!("{upper}.work");
                std::fs::create_dir_all(&work).ok();
                for cu in &descr.copy_up {
                    std::fs::create_dir_all(Path::new(upper).join(cu)).ok();
                }
                let lower = descr.phys[1..].join(":");
                let opts = format!("lowerdir={lower},upperdir={upper},workdir={work}");
                let cdst = CString::new(dir.as_str())?;
                let fstype = CString::new("overlay")?;
                let copts = CString::new(opts.clone())?;
                std::fs::create_dir_all(dir).ok();
                if unsafe { libc::mount(fstype.as_ptr(), cdst.as_ptr(), fstype.as_ptr(), 0, copts.as_ptr() as *const _) } != 0 {
                    bail!("cannot overlay {opts} on {dir}: {}", std::io::Error::last_os_error());
                }
            }
        }
    }
    if !chroot_info.dir.is_empty() {
        for action in &chroot_info.actions {
            let (file, content) = match action {
                ChrootAction::Passwd => ("etc/passwd", format!("user:x:{uid}:{gid}::/:/bin/sh\n")),
                ChrootAction::Group => ("etc/group", format!("user:x:{gid}:\n")),
                ChrootAction::Nsswitch => ("etc/nsswitch.conf", "passwd: files\ngroup: files\nhosts: files dns\n".to_string()),
                ChrootAction::Resolv => ("etc/resolv.conf", std::fs::read_to_string("/etc/resolv.conf").unwrap_or_default()),
            };
            let dst = Path::new(&chroot_info.dir).join(file);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            if let Ok(mut f) = std::fs::File::create(&dst) {
                let _ = f.write_all(content.as_bytes());
            }
        }
        let cdir = CString::new(chroot_info.dir.as_str())?;
        if unsafe { libc::chroot(cdir.as_ptr()) } != 0 {
            bail!("cannot chroot to {}: {}", chroot_info.dir, std::io::Error::last_os_error());
        }
        std::env::set_current_dir("/")?;
    }
    // spread first pids so concurrent jobs using $$ in tmp names collide less
    let _ = std::fs::write("/proc/sys/kernel/ns_last_pid", first_pid(small_id).to_string());
    Ok(true)
}

#[cfg(not(target_os = "linux"))]
pub fn enter(
    space: &JobSpace,
    chroot_info: &ChrootInfo,
    _phy_repo_root: &str,
    _phy_tmp_dir: &str,
    _small_id: SmallId,
) -> Result<bool> {
    if space.needs_ns() || !chroot_info.dir.is_empty() {
        bail!("job spaces require linux namespaces");
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canon_is_idempotent() {
        for p in ["/a//b/./c/../d", "a/../../b", "./x/", "/", "a/b/c", "../.."] {
            let once = mk_canon(p);
            assert_eq!(mk_canon(&once), once, "input {p:?}");
        }
        assert_eq!(mk_canon("/a//b/./c/../d"), "/a/b/d");
        assert_eq!(mk_canon("a/../../b"), "../b");
        assert_eq!(mk_canon("./x/"), "x");
        assert_eq!(mk_canon("a/.."), ".");
    }

    #[test]
    fn env_subst_boundaries() {
        let vars = HashMap::from([("REPO_ROOT", "/repo".to_string()), ("TMPDIR", "/tmp/j1".to_string())]);
        assert_eq!(subst_env("$REPO_ROOT/src", &vars), "/repo/src");
        assert_eq!(subst_env("${REPO_ROOT}x", &vars), "/repox");
        assert_eq!(subst_env("$REPO_ROOTX", &vars), "$REPO_ROOTX", "name boundary is a non-word char");
        assert_eq!(subst_env("a$TMPDIR-b", &vars), "a/tmp/j1-b");
        assert_eq!(subst_env("$UNKNOWN", &vars), "$UNKNOWN");
        assert_eq!(subst_env("cost $", &vars), "cost $");
    }

    #[test]
    fn view_checks() {
        let mut js = JobSpace::default();
        js.views.push(("/view".into(), ViewDescr { phys: vec!["/up,per".into()], copy_up: vec![] }));
        assert!(js.check("/repo", false).is_err(), "',' forbidden");
        js.views[0].1.phys = vec!["/upper".into(), "/low:er".into()];
        assert!(js.check("/repo", false).is_err(), "':' forbidden in lowers");
        js.views[0].1.phys = vec!["/upper".into(), "/lower".into()];
        assert!(js.check("/repo", false).is_ok());
    }

    #[test]
    fn repo_view_remap_rejected_with_relative_srcs() {
        let js = JobSpace { repo_view: "/elsewhere".into(), ..Default::default() };
        assert!(js.check("/repo", true).is_err());
        assert!(js.check("/repo", false).is_ok());
        let js = JobSpace { repo_view: "/repo".into(), ..Default::default() };
        assert!(js.check("/repo", true).is_ok());
    }

    #[test]
    fn simple_cmd_detection() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("mytool");
        std::fs::write(&exe, b"#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let path = dir.path().to_string_lossy().into_owned();
        let argv = simplify_cmd("mytool -a b", &path).unwrap();
        assert_eq!(argv[0], exe.to_string_lossy());
        assert_eq!(&argv[1..], ["-a", "b"]);
        // anything with shell state keeps the wrapper
        assert!(simplify_cmd("mytool -a > out", &path).is_none());
        assert!(simplify_cmd("x=1 mytool", &path).is_none());
        assert!(simplify_cmd("if true; then mytool; fi", &path).is_none());
        assert!(simplify_cmd("mytool $HOME", &path).is_none());
        assert!(simplify_cmd("missing -a", &path).is_none());
    }

    #[test]
    fn first_pid_spreads() {
        let a = first_pid(1);
        let b = first_pid(2);
        let c = first_pid(3);
        assert_ne!(a, b);
        assert_ne!(b, c);
        for id in 0..100 {
            let p = first_pid(id);
            assert!((FIRST_PID..FIRST_PID + N_PIDS).contains(&p));
        }
    }

    #[test]
    fn env_ctx_rewrites_interpreter() {
        let ctx = EnvCtx {
            anvil_root: "/opt/anvil".into(),
            repo_root: "/repo".into(),
            top_repo_root: "/repo".into(),
            tmp_dir: "/tmp/j".into(),
            phy_anvil_root: "/opt/anvil".into(),
            phy_repo_root: "/phy/repo".into(),
            phy_tmp_dir: "/phy/tmp".into(),
            small_id: 4,
            seq_id: 99,
            std_path: "/usr/bin:/bin".into(),
            shell: "/bin/sh".into(),
        };
        let mut env = vec![("OUT".to_string(), "$REPO_ROOT/out-$SMALL_ID".to_string())];
        let mut interp = vec!["$SHELL".to_string(), "-c".to_string()];
        ctx.update_env(&mut env, &mut interp);
        assert_eq!(env[0].1, "/repo/out-4");
        assert_eq!(interp[0], "/bin/sh");
    }
}
