use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::digest::Crc;
use crate::types::{Dflags, RuleIdx, Tflags};

// ─── Manifest (anvil.yaml) ────────────────────────────────────

/// Engine-wide knobs, read once at load.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds between heartbeat sweeps.
    pub heartbeat_s: u64,
    /// Date precision of the filesystem, used to classify hot deps (ns).
    pub ddate_prec_ns: i128,
    /// Grace period for remote fs propagation (ms).
    pub network_delay_ms: u64,
    /// Default cap on submissions per (req, job); 0 = unlimited.
    pub n_submits: u32,
    /// Bound on reported stderr bytes.
    pub max_stderr_len: usize,
    /// Local backend capacity: resource name -> amount.
    pub local_capacity: BTreeMap<String, u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            heartbeat_s: 10,
            ddate_prec_ns: 10_000_000,
            network_delay_ms: 0,
            n_submits: 10,
            max_stderr_len: 64 * 1024,
            local_capacity: BTreeMap::from([
                ("cpu".to_string(), num_cpus()),
                ("mem".to_string(), 4096),
            ]),
        }
    }
}

fn num_cpus() -> u64 {
    std::thread::available_parallelism().map(|n| n.get() as u64).unwrap_or(1)
}

/// Cache declaration in the manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSpec {
    pub dir: String,
    pub max_sz: u64,
    /// B/s above which a run is too cheap to be worth caching; 0 = unlimited.
    pub max_rate: u64,
    pub max_runs_per_job: u16,
    /// zstd level; 0 stores raw.
    pub zlvl: i32,
}

impl Default for CacheSpec {
    fn default() -> Self {
        CacheSpec {
            dir: String::new(),
            max_sz: 1 << 30,
            max_rate: 1 << 30,
            max_runs_per_job: 100,
            zlvl: 1,
        }
    }
}

/// One rule as written by the user.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSpec {
    pub name: String,
    pub prio: i32,
    /// Anti-rules forbid matching; source rules declare generated sources.
    pub kind: RuleKind,
    /// stem name -> regex it must match (default `.+`). A trailing `*`
    /// in the name marks a star stem (target classification only).
    pub stems: BTreeMap<String, String>,
    /// target name -> templated path.
    pub targets: BTreeMap<String, String>,
    /// dep name -> templated path.
    pub deps: BTreeMap<String, String>,
    pub cmd: String,
    pub interpreter: Vec<String>,
    /// resource name -> amount (integer, mem/tmp in MB).
    pub rsrcs: BTreeMap<String, u64>,
    pub backend: String,
    pub cache: Option<String>,
    /// 0 = engine default.
    pub n_submits: u32,
    /// Retries after a lost execution.
    pub n_losts: u32,
    /// Bound on reruns triggered by dep discovery; 0 = unlimited.
    pub n_runs: u32,
    pub timeout_s: u64,
    pub kill_sigs: Vec<i32>,
    pub stderr_ok: bool,
    pub auto_mkdir: bool,
    pub force: bool,
    pub allow_stderr: bool,
    pub phony: bool,
    pub incremental: bool,
    pub sub_repo: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    #[default]
    Plain,
    Anti,
    GenericSrc,
}

/// The whole `anvil.yaml`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub config: EngineConfig,
    pub sources: Vec<String>,
    pub source_dirs: Vec<String>,
    pub sub_repos: Vec<String>,
    pub caches: BTreeMap<String, CacheSpec>,
    pub rules: Vec<RuleSpec>,
}

impl Manifest {
    pub fn parse(yaml: &str) -> Result<Manifest> {
        serde_yaml::from_str(yaml).context("cannot parse manifest")
    }
}

// ─── Compiled rules ───────────────────────────────────────────

/// The engine-internal special rules, plus the user-facing kinds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Special {
    #[default]
    Plain,
    Anti,
    GenericSrc,
    /// Pseudo-job representing a Req's targets.
    Req,
    /// Sentinel produced when dep recursion exceeds the depth bound.
    InfiniteDep,
    /// Sentinel produced when a path exceeds the component bound.
    InfinitePath,
    /// Value-encoding jobs driven by a table file.
    Codec,
}

impl Special {
    pub fn is_special(self) -> bool {
        !matches!(self, Special::Plain | Special::Anti | Special::GenericSrc)
    }
}

/// One segment of a templated path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Seg {
    Lit(String),
    Stem(usize),
}

/// A compiled template: segments plus an anchored regex binding every stem.
#[derive(Clone, Debug)]
pub struct Pattern {
    pub segs: Vec<Seg>,
    pub re: Regex,
}

impl Pattern {
    /// Literal prefix up to the first stem.
    pub fn prefix(&self) -> &str {
        match self.segs.first() {
            Some(Seg::Lit(s)) if self.segs.len() > 1 => s,
            Some(Seg::Lit(s)) if !self.has_stem() => s,
            _ => "",
        }
    }

    /// Literal suffix after the last stem (whole text if no stem).
    pub fn suffix(&self) -> &str {
        if !self.has_stem() {
            return match self.segs.first() {
                Some(Seg::Lit(s)) => s,
                _ => "",
            };
        }
        match self.segs.last() {
            Some(Seg::Lit(s)) => s,
            _ => "",
        }
    }

    pub fn has_stem(&self) -> bool {
        self.segs.iter().any(|s| matches!(s, Seg::Stem(_)))
    }

    /// Bind stems against a concrete name. Returns stem values by index.
    pub fn bind(&self, name: &str, n_stems: usize) -> Option<Vec<Option<String>>> {
        let caps = self.re.captures(name)?;
        let mut stems = vec![None; n_stems];
        for seg in &self.segs {
            if let Seg::Stem(i) = seg {
                stems[*i] = caps.name(&format!("s{i}")).map(|m| m.as_str().to_string());
            }
        }
        Some(stems)
    }

    /// Instantiate the template with bound stems.
    pub fn subst(&self, stems: &[Option<String>]) -> Result<String> {
        let mut out = String::new();
        for seg in &self.segs {
            match seg {
                Seg::Lit(s) => out.push_str(s),
                Seg::Stem(i) => match &stems[*i] {
                    Some(v) => out.push_str(v),
                    None => bail!("unbound stem #{i}"),
                },
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Debug)]
pub struct StemSpec {
    pub name: String,
    pub re: String,
    /// Star stems make the containing target a star target.
    pub star: bool,
}

#[derive(Clone, Debug)]
pub struct TargetSpec {
    pub name: String,
    pub pattern: Pattern,
    pub tflags: Tflags,
    /// Contains at least one star stem.
    pub star: bool,
}

#[derive(Clone, Debug)]
pub struct DepSpec {
    pub name: String,
    pub pattern: Pattern,
    pub dflags: Dflags,
}

/// Fingerprints of the three independently-changeable rule facets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCrc {
    pub match_crc: Crc,
    pub cmd_crc: Crc,
    pub rsrcs_crc: Crc,
    pub state: RuleCrcState,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleCrcState {
    #[default]
    Ok,
    CmdOld,
    RsrcsOld,
    RsrcsForgotten,
}

/// A compiled rule.
#[derive(Clone, Debug)]
pub struct Rule {
    pub name: String,
    pub special: Special,
    /// Dense priority derived from user_prio; higher runs match first.
    pub prio: u32,
    pub user_prio: i32,
    pub stems: Vec<StemSpec>,
    pub targets: Vec<TargetSpec>,
    pub deps: Vec<DepSpec>,
    pub cmd: String,
    pub interpreter: Vec<String>,
    pub rsrcs: BTreeMap<String, u64>,
    pub backend: String,
    pub cache: Option<String>,
    pub crc: RuleCrc,
    pub n_submits: u32,
    pub n_losts: u32,
    pub n_runs: u32,
    pub timeout_s: u64,
    pub kill_sigs: Vec<i32>,
    pub stderr_ok: bool,
    pub auto_mkdir: bool,
    pub force: bool,
    pub phony: bool,
    pub incremental: bool,
    pub sub_repo: String,
}

impl Rule {
    pub fn is_special(&self) -> bool {
        self.special.is_special()
    }

    /// An engine-internal rule carrying no pattern at all.
    pub fn internal(special: Special) -> Rule {
        let name = match special {
            Special::Req => "<req>",
            Special::InfiniteDep => "<infinite_dep>",
            Special::InfinitePath => "<infinite_path>",
            Special::Codec => "<codec>",
            _ => "<internal>",
        };
        Rule {
            name: name.to_string(),
            special,
            prio: 0,
            user_prio: 0,
            stems: Vec::new(),
            targets: Vec::new(),
            deps: Vec::new(),
            cmd: String::new(),
            interpreter: Vec::new(),
            rsrcs: BTreeMap::new(),
            backend: "local".to_string(),
            cache: None,
            crc: RuleCrc::default(),
            n_submits: 1,
            n_losts: 1,
            n_runs: 0,
            timeout_s: 0,
            kill_sigs: Vec::new(),
            stderr_ok: true,
            auto_mkdir: false,
            force: false,
            phony: false,
            incremental: false,
            sub_repo: String::new(),
        }
    }

    /// The job's full, repo-local name: rule-encoded so distinct rules
    /// never collide even when producing the same target.
    pub fn job_name(&self, stems: &[Option<String>]) -> String {
        let mut s = format!("{}:", self.name);
        for (i, v) in stems.iter().enumerate() {
            if i > 0 {
                s.push(',');
            }
            if let Some(v) = v {
                s.push_str(v);
            }
        }
        s
    }

    /// Repo-independent name for cache sharing: cmd crc + stem size codes.
    pub fn unique_name(&self, stems: &[Option<String>]) -> String {
        let mut s = format!("{}-{}", self.name, self.crc.cmd_crc);
        for v in stems.iter().flatten() {
            s.push('.');
            s.push_str(&format!("{:x}", v.len()));
            s.push('-');
            s.push_str(&sanitize(v));
        }
        s
    }

    /// Substitute bound stems into the command text.
    pub fn cmd_for(&self, stems: &[Option<String>]) -> String {
        subst_stems(&self.cmd, &self.stems, stems)
    }
}

fn sanitize(v: &str) -> String {
    v.chars().map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '_' }).collect()
}

fn subst_stems(text: &str, specs: &[StemSpec], stems: &[Option<String>]) -> String {
    let mut out = text.to_string();
    for (i, spec) in specs.iter().enumerate() {
        if let Some(Some(v)) = stems.get(i) {
            out = out.replace(&format!("{{{}}}", spec.name), v);
        }
    }
    out
}

// ─── Compilation ──────────────────────────────────────────────

fn compile_pattern(template: &str, stems: &mut Vec<StemSpec>, declared: &BTreeMap<String, String>) -> Result<Pattern> {
    let mut segs = Vec::new();
    let mut re = String::from("^");
    let mut lit = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => {
                let mut name = String::new();
                for c2 in chars.by_ref() {
                    if c2 == '}' {
                        break;
                    }
                    name.push(c2);
                }
                if name.is_empty() {
                    bail!("empty stem in template {template:?}");
                }
                if !lit.is_empty() {
                    re.push_str(&regex::escape(&lit));
                    segs.push(Seg::Lit(std::mem::take(&mut lit)));
                }
                let star = name.ends_with('*');
                let idx = match stems.iter().position(|s| s.name == name) {
                    Some(i) => i,
                    None => {
                        let stem_re = declared.get(&name).cloned().unwrap_or_else(|| ".+".to_string());
                        stems.push(StemSpec { name: name.clone(), re: stem_re, star });
                        stems.len() - 1
                    }
                };
                re.push_str(&format!("(?P<s{idx}>{})", stems[idx].re));
                segs.push(Seg::Stem(idx));
            }
            _ => lit.push(c),
        }
    }
    if !lit.is_empty() {
        re.push_str(&regex::escape(&lit));
        segs.push(Seg::Lit(lit));
    }
    re.push('$');
    let re = Regex::new(&re).with_context(|| format!("bad stem regex in template {template:?}"))?;
    Ok(Pattern { segs, re })
}

fn compile_rule(spec: &RuleSpec, dflt: &EngineConfig) -> Result<Rule> {
    if spec.name.is_empty() {
        bail!("rule without a name");
    }
    let mut stems: Vec<StemSpec> = Vec::new();
    let mut targets = Vec::new();
    for (tname, tmpl) in &spec.targets {
        let pattern = compile_pattern(tmpl, &mut stems, &spec.stems)
            .with_context(|| format!("rule {}, target {}", spec.name, tname))?;
        let star = pattern.segs.iter().any(|s| matches!(s, Seg::Stem(i) if stems[*i].star));
        let mut tflags = Tflags::TARGET;
        if star {
            tflags |= Tflags::STAR;
        }
        if spec.phony {
            tflags |= Tflags::PHONY;
        }
        if spec.incremental {
            tflags |= Tflags::INCREMENTAL;
        }
        targets.push(TargetSpec { name: tname.clone(), pattern, tflags, star });
    }
    if targets.is_empty() && spec.kind == RuleKind::Plain {
        bail!("rule {} has no target", spec.name);
    }
    let mut deps = Vec::new();
    for (dname, tmpl) in &spec.deps {
        let pattern = compile_pattern(tmpl, &mut stems, &spec.stems)
            .with_context(|| format!("rule {}, dep {}", spec.name, dname))?;
        deps.push(DepSpec {
            name: dname.clone(),
            pattern,
            dflags: Dflags::STATIC | Dflags::REQUIRED | Dflags::FULL,
        });
    }
    let special = match spec.kind {
        RuleKind::Plain => Special::Plain,
        RuleKind::Anti => Special::Anti,
        RuleKind::GenericSrc => Special::GenericSrc,
    };
    let match_src: Vec<String> = spec
        .targets
        .values()
        .chain(spec.deps.values())
        .cloned()
        .chain(stems.iter().map(|s| format!("{}={}", s.name, s.re)))
        .collect();
    let crc = RuleCrc {
        match_crc: Crc::from_bytes(match_src.join("\n").as_bytes()),
        cmd_crc: Crc::from_bytes(format!("{}\n{}", spec.interpreter.join(" "), spec.cmd).as_bytes()),
        rsrcs_crc: Crc::from_bytes(format!("{:?}", spec.rsrcs).as_bytes()),
        state: RuleCrcState::Ok,
    };
    Ok(Rule {
        name: spec.name.clone(),
        special,
        prio: 0, // densified later
        user_prio: spec.prio,
        stems,
        targets,
        deps,
        cmd: spec.cmd.clone(),
        interpreter: if spec.interpreter.is_empty() {
            vec!["/bin/sh".to_string(), "-c".to_string()]
        } else {
            spec.interpreter.clone()
        },
        rsrcs: spec.rsrcs.clone(),
        backend: if spec.backend.is_empty() { "local".to_string() } else { spec.backend.clone() },
        cache: spec.cache.clone(),
        crc,
        n_submits: if spec.n_submits == 0 { dflt.n_submits } else { spec.n_submits },
        n_losts: if spec.n_losts == 0 { 1 } else { spec.n_losts },
        n_runs: spec.n_runs,
        timeout_s: spec.timeout_s,
        kill_sigs: if spec.kill_sigs.is_empty() { vec![15, 9] } else { spec.kill_sigs.clone() },
        stderr_ok: spec.stderr_ok || spec.allow_stderr,
        auto_mkdir: spec.auto_mkdir,
        force: spec.force,
        phony: spec.phony,
        incremental: spec.incremental,
        sub_repo: spec.sub_repo.clone(),
    })
}

/// The compiled rule set, in manifest order.
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    pub sources: Vec<String>,
    pub source_dirs: Vec<String>,
    pub sub_repos: Vec<String>,
}

impl RuleSet {
    pub fn compile(manifest: &Manifest) -> Result<RuleSet> {
        let mut rules = Vec::with_capacity(manifest.rules.len());
        for spec in &manifest.rules {
            rules.push(compile_rule(spec, &manifest.config)?);
        }
        // densify priorities: equal user_prio collapses to one level,
        // order is preserved, 0 is reserved for "after all user rules"
        let mut prio_map: BTreeMap<i32, u32> = BTreeMap::new();
        for r in &rules {
            prio_map.entry(r.user_prio).or_insert(0);
        }
        let mut p = 1u32;
        for v in prio_map.values_mut() {
            *v = p;
            p += 1;
        }
        for r in &mut rules {
            r.prio = prio_map[&r.user_prio];
        }
        // engine-internal rules: never pattern-matched, always present
        for special in [Special::Req, Special::InfiniteDep, Special::InfinitePath, Special::Codec] {
            rules.push(Rule::internal(special));
        }
        Ok(RuleSet {
            rules,
            sources: manifest.sources.clone(),
            source_dirs: manifest.source_dirs.clone(),
            sub_repos: manifest.sub_repos.clone(),
        })
    }

    pub fn get(&self, idx: RuleIdx) -> &Rule {
        &self.rules[idx as usize]
    }

    pub fn by_name(&self, name: &str) -> Option<(RuleIdx, &Rule)> {
        self.rules
            .iter()
            .position(|r| r.name == name)
            .map(|i| (i as RuleIdx, &self.rules[i]))
    }

    pub fn special_rule(&self, special: Special) -> RuleIdx {
        self.rules
            .iter()
            .position(|r| r.special == special)
            .expect("internal rules are always compiled in") as RuleIdx
    }

    /// Dynamic reload: only attribute-level changes are allowed. Names,
    /// ordering, cmd, resources and priority must be identical.
    pub fn check_dynamic_reload(&self, new: &RuleSet) -> Result<()> {
        if self.rules.len() != new.rules.len() {
            bail!("dynamic reload cannot add or remove rules");
        }
        for (old, new) in self.rules.iter().zip(&new.rules) {
            if old.name != new.name {
                bail!("dynamic reload cannot rename rule {} -> {}", old.name, new.name);
            }
            if old.crc.cmd_crc != new.crc.cmd_crc {
                bail!("dynamic reload cannot change cmd of rule {}", old.name);
            }
            if old.crc.rsrcs_crc != new.crc.rsrcs_crc {
                bail!("dynamic reload cannot change resources of rule {}", old.name);
            }
            if old.user_prio != new.user_prio {
                bail!("dynamic reload cannot change priority of rule {}", old.name);
            }
        }
        Ok(())
    }

    /// True if `name` designates a declared source (exact file or under a
    /// source dir).
    pub fn is_source(&self, name: &str) -> bool {
        self.sources.iter().any(|s| s == name)
    }

    pub fn source_dir_of(&self, name: &str) -> Option<&str> {
        self.source_dirs
            .iter()
            .map(|d| d.trim_end_matches('/'))
            .find(|d| name.starts_with(*d) && name.len() > d.len() && name.as_bytes()[d.len()] == b'/')
    }
}

impl RuleSet {
    /// Resolve an engine error message for a rule crc state.
    pub fn crc_state_msg(state: RuleCrcState) -> &'static str {
        match state {
            RuleCrcState::Ok => "ok",
            RuleCrcState::CmdOld => "command changed",
            RuleCrcState::RsrcsOld => "resources changed",
            RuleCrcState::RsrcsForgotten => "resources forgotten",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(yaml: &str) -> Manifest {
        Manifest::parse(yaml).unwrap()
    }

    const BASIC: &str = r#"
sources: ["in"]
rules:
  - name: copy
    targets:
      out: "out"
    deps:
      src: "in"
    cmd: "cp in out"
  - name: compile
    prio: 1
    stems:
      file: "[^/]+"
    targets:
      obj: "build/{file}.o"
    deps:
      src: "src/{file}.c"
    cmd: "cc -c src/{file}.c -o build/{file}.o"
"#;

    #[test]
    fn compile_and_bind() {
        let rs = RuleSet::compile(&manifest(BASIC)).unwrap();
        assert_eq!(rs.rules.iter().filter(|r| !r.is_special()).count(), 2);
        assert_eq!(rs.special_rule(Special::Req), 2);
        let (_, compile) = rs.by_name("compile").unwrap();
        let t = &compile.targets[0];
        assert_eq!(t.pattern.prefix(), "build/");
        assert_eq!(t.pattern.suffix(), ".o");
        assert!(t.pattern.has_stem());
        let stems = t.pattern.bind("build/foo.o", compile.stems.len()).unwrap();
        assert_eq!(stems[0].as_deref(), Some("foo"));
        assert_eq!(compile.deps[0].pattern.subst(&stems).unwrap(), "src/foo.c");
        assert_eq!(compile.cmd_for(&stems), "cc -c src/foo.c -o build/foo.o");
        assert!(t.pattern.bind("build/a/b.o", compile.stems.len()).is_none(), "stem regex bounds the match");
    }

    #[test]
    fn stemless_target_classification() {
        let rs = RuleSet::compile(&manifest(BASIC)).unwrap();
        let (_, copy) = rs.by_name("copy").unwrap();
        let t = &copy.targets[0];
        assert!(!t.pattern.has_stem());
        assert_eq!(t.pattern.suffix(), "out");
        assert_eq!(t.pattern.prefix(), "out");
    }

    #[test]
    fn prio_densified_in_order() {
        let y = r#"
rules:
  - name: a
    prio: 5
    targets: { out: "a" }
    cmd: "true"
  - name: b
    prio: -3
    targets: { out: "b" }
    cmd: "true"
  - name: c
    prio: 5
    targets: { out: "c" }
    cmd: "true"
"#;
        let rs = RuleSet::compile(&manifest(y)).unwrap();
        let p = |n: &str| rs.by_name(n).unwrap().1.prio;
        assert_eq!(p("a"), p("c"), "equal user prio collapses");
        assert!(p("a") > p("b"));
        assert!(p("b") >= 1, "0 is reserved");
    }

    #[test]
    fn dynamic_reload_guard() {
        let rs = RuleSet::compile(&manifest(BASIC)).unwrap();
        let mut changed = manifest(BASIC);
        changed.rules[0].cmd = "cp -v in out".to_string();
        let rs2 = RuleSet::compile(&changed).unwrap();
        assert!(rs.check_dynamic_reload(&rs2).is_err());
        let rs3 = RuleSet::compile(&manifest(BASIC)).unwrap();
        assert!(rs.check_dynamic_reload(&rs3).is_ok());
    }

    #[test]
    fn rule_crc_tracks_facets() {
        let rs = RuleSet::compile(&manifest(BASIC)).unwrap();
        let mut m2 = manifest(BASIC);
        m2.rules[1].cmd = "cc -O2 -c src/{file}.c -o build/{file}.o".to_string();
        let rs2 = RuleSet::compile(&m2).unwrap();
        let a = rs.by_name("compile").unwrap().1;
        let b = rs2.by_name("compile").unwrap().1;
        assert_eq!(a.crc.match_crc, b.crc.match_crc);
        assert_ne!(a.crc.cmd_crc, b.crc.cmd_crc);
        assert_eq!(a.crc.rsrcs_crc, b.crc.rsrcs_crc);
    }

    #[test]
    fn source_classification() {
        let y = r#"
sources: ["Makefile"]
source_dirs: ["src"]
rules: []
"#;
        let rs = RuleSet::compile(&manifest(y)).unwrap();
        assert!(rs.is_source("Makefile"));
        assert_eq!(rs.source_dir_of("src/a.c"), Some("src"));
        assert_eq!(rs.source_dir_of("srcx/a.c"), None);
        assert_eq!(rs.source_dir_of("src"), None);
    }
}
