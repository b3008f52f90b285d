use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{Accesses, Dflags, Tflags, Timestamp};

// ─── Crc ──────────────────────────────────────────────────────

/// Content hash with reserved codes. Computed values always carry the top
/// bit so they can never collide with the reserved codes; the low bit
/// distinguishes symlinks from regular content.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Crc(u64);

const CRC_COMPUTED: u64 = 1 << 63;
const CRC_LNK: u64 = 1;

impl Crc {
    /// No file.
    pub const NONE: Crc = Crc(0);
    /// Zero-length regular file.
    pub const EMPTY: Crc = Crc(1);
    /// Not yet computed.
    pub const UNKNOWN: Crc = Crc(2);

    pub fn from_bytes(content: &[u8]) -> Crc {
        if content.is_empty() {
            return Crc::EMPTY;
        }
        Crc::from_digest(content, false)
    }

    pub fn from_lnk(target: &str) -> Crc {
        Crc::from_digest(target.as_bytes(), true)
    }

    fn from_digest(content: &[u8], is_lnk: bool) -> Crc {
        let h = Sha256::digest(content);
        let mut v = u64::from_le_bytes(h[..8].try_into().unwrap_or_default());
        v = (v & !CRC_LNK) | CRC_COMPUTED;
        if is_lnk {
            v |= CRC_LNK;
        }
        Crc(v)
    }

    /// Hash the file currently on disk. Absent file yields `Crc::NONE`.
    pub fn from_path(path: &Path) -> std::io::Result<Crc> {
        let md = match fs::symlink_metadata(path) {
            Ok(md) => md,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Crc::NONE),
            Err(e) => return Err(e),
        };
        if md.file_type().is_symlink() {
            let tgt = fs::read_link(path)?;
            return Ok(Crc::from_lnk(&tgt.to_string_lossy()));
        }
        if md.is_dir() {
            return Ok(Crc::NONE); // dirs have no content crc
        }
        if md.len() == 0 {
            return Ok(Crc::EMPTY);
        }
        let mut f = fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let h = hasher.finalize();
        let mut v = u64::from_le_bytes(h[..8].try_into().unwrap_or_default());
        v = (v & !CRC_LNK) | CRC_COMPUTED;
        Ok(Crc(v))
    }

    pub fn is_special(self) -> bool {
        self.0 & CRC_COMPUTED == 0
    }

    pub fn is_lnk(self) -> bool {
        !self.is_special() && self.0 & CRC_LNK != 0
    }

    pub fn exists(self) -> bool {
        self != Crc::NONE && self != Crc::UNKNOWN
    }

    pub fn valid(self) -> bool {
        self != Crc::UNKNOWN
    }

    fn stat_class(self) -> Option<u8> {
        match self {
            Crc::UNKNOWN => None,
            Crc::NONE => Some(0),
            Crc::EMPTY => Some(1),
            c if c.is_lnk() => Some(2),
            _ => Some(1), // any regular
        }
    }

    /// Observational equality: can the two contents be told apart through
    /// the given accesses? A stat-only access cannot distinguish two
    /// regular files; no access at all distinguishes nothing.
    pub fn matches(self, other: Crc, accesses: Accesses) -> bool {
        if !accesses.any() {
            return true;
        }
        if !self.valid() || !other.valid() {
            return false;
        }
        if accesses.senses_content() || accesses.contains(Accesses::READLINK) {
            return self == other;
        }
        self.stat_class() == other.stat_class()
    }
}

impl std::fmt::Display for Crc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Crc::NONE => write!(f, "none"),
            Crc::EMPTY => write!(f, "empty"),
            Crc::UNKNOWN => write!(f, "unknown"),
            Crc(v) => write!(f, "{v:016x}"),
        }
    }
}

// ─── FileSig ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FileTag {
    #[default]
    None,
    Empty,
    Reg,
    Exe,
    Lnk,
    Dir,
}

impl FileTag {
    pub fn exists(self) -> bool {
        self != FileTag::None
    }
}

/// A (tag, mtime) fingerprint, cheaper than hashing content.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileSig {
    pub tag: FileTag,
    /// mtime in nanoseconds since epoch; 0 when absent.
    pub mtime_ns: i128,
}

impl FileSig {
    pub fn from_path(path: &Path) -> FileSig {
        let md = match fs::symlink_metadata(path) {
            Ok(md) => md,
            Err(_) => return FileSig::default(),
        };
        let tag = if md.file_type().is_symlink() {
            FileTag::Lnk
        } else if md.is_dir() {
            FileTag::Dir
        } else if md.len() == 0 {
            FileTag::Empty
        } else {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if md.permissions().mode() & 0o111 != 0 {
                    FileTag::Exe
                } else {
                    FileTag::Reg
                }
            }
            #[cfg(not(unix))]
            FileTag::Reg
        };
        let mtime_ns = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i128)
            .unwrap_or(0);
        FileSig { tag, mtime_ns }
    }

    pub fn exists(self) -> bool {
        self.tag.exists()
    }

    /// Promote the signature to the crc it implies when the tag is enough.
    pub fn crc_hint(self) -> Option<Crc> {
        match self.tag {
            FileTag::None => Some(Crc::NONE),
            FileTag::Empty => Some(Crc::EMPTY),
            _ => None,
        }
    }
}

// ─── DepDigest ────────────────────────────────────────────────

/// The crc-or-sig union carried by a dep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepInfo {
    Crc(Crc),
    Sig(FileSig),
}

impl Default for DepInfo {
    fn default() -> Self {
        DepInfo::Crc(Crc::UNKNOWN)
    }
}

impl DepInfo {
    pub fn is_crc(&self) -> bool {
        matches!(self, DepInfo::Crc(_))
    }

    pub fn crc(&self) -> Option<Crc> {
        match self {
            DepInfo::Crc(c) => Some(*c),
            DepInfo::Sig(_) => None,
        }
    }
}

/// One recorded dep access of a job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepDigest {
    pub accesses: Accesses,
    pub dflags: Dflags,
    /// Grouped with the previous dep; ordering inside a group is not significant.
    pub parallel: bool,
    /// Observed within fs clock granularity of its mtime; potentially stale.
    pub hot: bool,
    /// The access itself reported an error.
    pub err: bool,
    /// Accesses of the group this dep belongs to (for grouped accesses).
    pub chunk_accesses: Accesses,
    pub info: DepInfo,
}

impl DepDigest {
    pub fn new_static(dflags: Dflags) -> DepDigest {
        DepDigest {
            dflags: dflags | Dflags::STATIC | Dflags::FULL,
            ..Default::default()
        }
    }

    pub fn with_crc(mut self, crc: Crc) -> DepDigest {
        self.info = DepInfo::Crc(crc);
        self
    }

    /// Merge law: accesses and dflags union, the receiver's `parallel` is
    /// kept (the other follows it), and a crc/sig disagreement degrades the
    /// union to unknown.
    pub fn merge(&mut self, other: &DepDigest) {
        self.accesses |= other.accesses;
        self.chunk_accesses |= other.chunk_accesses;
        self.dflags |= other.dflags;
        self.hot |= other.hot;
        self.err |= other.err;
        if self.info != other.info {
            self.info = DepInfo::Crc(Crc::UNKNOWN);
        }
    }
}

// ─── TargetDigest ─────────────────────────────────────────────

/// One produced (or declared) target of a job run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDigest {
    pub tflags: Tflags,
    pub extra_tflags: Tflags,
    /// Existed on disk before the run.
    pub pre_exist: bool,
    /// Actually written by the run.
    pub written: bool,
    pub crc: Crc,
    pub sig: FileSig,
}

// ─── JobDigest ────────────────────────────────────────────────

/// Everything a finished run reports about its inputs and outputs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDigest {
    pub deps: Vec<(String, DepDigest)>,
    pub targets: Vec<(String, TargetDigest)>,
    pub status: crate::types::Status,
    /// Seconds of wall-clock execution.
    pub exe_time: f64,
    pub stderr: String,
    pub max_stderr_len: usize,
}

pub type Pdate = chrono::DateTime<chrono::Utc>;

pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_reserved_codes_never_collide() {
        let c = Crc::from_bytes(b"hello\n");
        assert!(!c.is_special());
        assert_ne!(c, Crc::NONE);
        assert_ne!(c, Crc::EMPTY);
        assert_ne!(c, Crc::UNKNOWN);
        assert_eq!(Crc::from_bytes(b""), Crc::EMPTY);
    }

    #[test]
    fn crc_lnk_and_reg_differ() {
        let r = Crc::from_bytes(b"target");
        let l = Crc::from_lnk("target");
        assert_ne!(r, l);
        assert!(l.is_lnk());
        assert!(!r.is_lnk());
    }

    #[test]
    fn crc_match_depends_on_accesses() {
        let a = Crc::from_bytes(b"aaa");
        let b = Crc::from_bytes(b"bbb");
        // no access at all distinguishes nothing
        assert!(a.matches(b, Accesses::NONE));
        // stat cannot tell two regulars apart
        assert!(a.matches(b, Accesses::STAT));
        // but it can tell a regular from an absent file
        assert!(!a.matches(Crc::NONE, Accesses::STAT));
        // reads see content
        assert!(!a.matches(b, Accesses::READ));
        assert!(a.matches(a, Accesses::READ));
        // unknown never attests a match
        assert!(!Crc::UNKNOWN.matches(Crc::UNKNOWN, Accesses::READ));
    }

    #[test]
    fn dep_merge_unions_and_invalidates() {
        let mut a = DepDigest {
            accesses: Accesses::STAT,
            dflags: Dflags::STATIC,
            parallel: true,
            info: DepInfo::Crc(Crc::from_bytes(b"x")),
            ..Default::default()
        };
        let b = DepDigest {
            accesses: Accesses::READ,
            dflags: Dflags::CRITICAL,
            parallel: false,
            info: DepInfo::Crc(Crc::from_bytes(b"y")),
            ..Default::default()
        };
        a.merge(&b);
        assert!(a.accesses.contains(Accesses::READ | Accesses::STAT));
        assert!(a.dflags.contains(Dflags::STATIC | Dflags::CRITICAL));
        assert!(a.parallel, "receiver parallel is kept");
        assert_eq!(a.info, DepInfo::Crc(Crc::UNKNOWN));
    }

    #[test]
    fn digest_serde_roundtrip() {
        let d = DepDigest {
            accesses: Accesses::READ,
            dflags: Dflags::STATIC | Dflags::FULL,
            parallel: false,
            hot: true,
            err: false,
            chunk_accesses: Accesses::NONE,
            info: DepInfo::Sig(FileSig { tag: FileTag::Exe, mtime_ns: 123_456_789 }),
        };
        let bytes = bincode::serialize(&d).unwrap();
        let back: DepDigest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(d, back);

        let t = TargetDigest {
            tflags: Tflags::TARGET,
            extra_tflags: Tflags::NONE,
            pre_exist: false,
            written: true,
            crc: Crc::from_bytes(b"out"),
            sig: FileSig { tag: FileTag::Reg, mtime_ns: 42 },
        };
        let bytes = bincode::serialize(&t).unwrap();
        let back: TargetDigest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(t, back);
    }

    #[test]
    fn file_sig_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f");
        assert_eq!(FileSig::from_path(&p).tag, FileTag::None);
        std::fs::write(&p, b"").unwrap();
        assert_eq!(FileSig::from_path(&p).tag, FileTag::Empty);
        std::fs::write(&p, b"data").unwrap();
        let sig = FileSig::from_path(&p);
        assert_eq!(sig.tag, FileTag::Reg);
        assert!(sig.mtime_ns > 0);
        assert_eq!(sig.crc_hint(), None);
        assert_eq!(FileSig::default().crc_hint(), Some(Crc::NONE));
    }
}
