use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::rules::{RuleSet, Special};
use crate::types::RuleIdx;

/// Marker prepended to the suffix key of stem-less targets, so they only
/// match the exact full name.
pub const START_MRKR: char = '\u{0}';

/// A (rule, target) pair as stored in the match tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleTgt {
    pub rule: RuleIdx,
    pub tgt: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Rt {
    rule_tgt: RuleTgt,
    pfx: String,
    sfx: String,
}

/// Two-level match table: longest-suffix lookup selects a prefix map,
/// longest-prefix lookup yields the ordered candidate rules.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MatchTab {
    /// suffix -> prefix -> ordered candidates.
    sfxs: BTreeMap<String, BTreeMap<String, Vec<RuleTgt>>>,
}

/// Merge shorter prefixes/suffixes into longer ones: a rule matching a
/// short literal also matches any longer literal ending (resp. starting)
/// with it. Processing keys by increasing length makes the merge
/// transitive. Sub-repo boundaries interrupt prefix propagation.
fn propag_to_longer(map: &mut BTreeMap<String, HashSet<Rt>>, is_sfx: bool, sub_repos: &HashSet<String>) {
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort_by_key(|k| k.len());
    for long in keys {
        if !is_sfx && sub_repos.contains(&long) {
            continue;
        }
        for shorten_by in 1..=long.len() {
            let short = if is_sfx {
                long[shorten_by..].to_string()
            } else {
                long[..long.len() - shorten_by].to_string()
            };
            if !is_sfx && sub_repos.contains(&short) {
                break;
            }
            if let Some(entry) = map.get(&short).cloned() {
                map.get_mut(&long).unwrap().extend(entry);
                break; // the shorter one is itself already merged
            }
        }
    }
}

fn special_rank(s: Special) -> u8 {
    match s {
        Special::Anti => 2,
        Special::GenericSrc => 1,
        _ => 0,
    }
}

impl MatchTab {
    /// Compile the match tables from the rule set.
    pub fn compile(rules: &RuleSet) -> MatchTab {
        let sub_repos: HashSet<String> = rules.sub_repos.iter().cloned().collect();
        //
        // first a suffix map over every rule target
        let mut sfx_map: BTreeMap<String, HashSet<Rt>> = BTreeMap::new();
        for (ri, rule) in rules.rules.iter().enumerate() {
            if rule.special.is_special() {
                continue; // engine-internal rules never pattern-match
            }
            for (ti, tgt) in rule.targets.iter().enumerate() {
                let rt = if tgt.pattern.has_stem() {
                    Rt {
                        rule_tgt: RuleTgt { rule: ri as RuleIdx, tgt: ti as u32 },
                        pfx: tgt.pattern.prefix().to_string(),
                        sfx: tgt.pattern.suffix().to_string(),
                    }
                } else {
                    Rt {
                        rule_tgt: RuleTgt { rule: ri as RuleIdx, tgt: ti as u32 },
                        pfx: String::new(),
                        sfx: format!("{START_MRKR}{}", tgt.pattern.suffix()),
                    }
                };
                sfx_map.entry(rt.sfx.clone()).or_default().insert(rt);
            }
        }
        propag_to_longer(&mut sfx_map, true, &sub_repos);
        //
        // then, per suffix, a prefix map
        let mut tab = MatchTab::default();
        for (sfx, sfx_rts) in sfx_map {
            let mut pfx_map: BTreeMap<String, HashSet<Rt>> = BTreeMap::new();
            if let Some(stripped) = sfx.strip_prefix(START_MRKR) {
                // stem-less bucket: the suffix is the entire name
                for rt in &sfx_rts {
                    if stripped.starts_with(&rt.pfx) || rt.pfx.is_empty() {
                        pfx_map.entry(String::new()).or_default().insert(rt.clone());
                    }
                }
            } else {
                for sr in &sub_repos {
                    pfx_map.entry(sr.clone()).or_default(); // boundary markers
                }
                for rt in &sfx_rts {
                    pfx_map.entry(rt.pfx.clone()).or_default().insert(rt.clone());
                }
                propag_to_longer(&mut pfx_map, false, &sub_repos);
            }
            let mut pfxs = BTreeMap::new();
            for (pfx, rts) in pfx_map {
                if rts.is_empty() {
                    continue; // sub-repo marker, not a real entry
                }
                let mut v: Vec<&Rt> = rts.iter().collect();
                // special before plain, then decreasing user priority, then
                // Anti before GenericSrc, then longer literals (better
                // sharing), then name/sub_repo for stability
                v.sort_by(|a, b| {
                    let ra = rules.get(a.rule_tgt.rule);
                    let rb = rules.get(b.rule_tgt.rule);
                    let ka = (
                        special_rank(ra.special) > 0,
                        ra.prio,
                        special_rank(ra.special),
                        a.pfx.len() + a.sfx.len(),
                    );
                    let kb = (
                        special_rank(rb.special) > 0,
                        rb.prio,
                        special_rank(rb.special),
                        b.pfx.len() + b.sfx.len(),
                    );
                    kb.cmp(&ka).then_with(|| (&ra.name, &ra.sub_repo).cmp(&(&rb.name, &rb.sub_repo)))
                });
                pfxs.insert(pfx, v.into_iter().map(|rt| rt.rule_tgt).collect());
            }
            tab.sfxs.insert(sfx, pfxs);
        }
        tab
    }

    /// Ordered candidate rules for a target name: longest matching suffix,
    /// then longest matching prefix within that bucket.
    pub fn rule_tgts(&self, name: &str) -> &[RuleTgt] {
        let marked = format!("{START_MRKR}{name}");
        let mut best_sfx: Option<&BTreeMap<String, Vec<RuleTgt>>> = None;
        let mut best_len = 0usize;
        for (sfx, pfxs) in &self.sfxs {
            let hit = if sfx.starts_with(START_MRKR) { marked == *sfx } else { name.ends_with(sfx.as_str()) };
            if hit && (best_sfx.is_none() || sfx.len() > best_len) {
                best_sfx = Some(pfxs);
                best_len = sfx.len();
            }
        }
        let Some(pfxs) = best_sfx else { return &[] };
        let mut best: Option<&Vec<RuleTgt>> = None;
        let mut best_plen = 0usize;
        for (pfx, rts) in pfxs {
            if name.starts_with(pfx.as_str()) && (best.is_none() || pfx.len() > best_plen) {
                best = Some(rts);
                best_plen = pfx.len();
            }
        }
        best.map(|v| v.as_slice()).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Manifest;

    fn tab(yaml: &str) -> (RuleSet, MatchTab) {
        let rules = RuleSet::compile(&Manifest::parse(yaml).unwrap()).unwrap();
        let tab = MatchTab::compile(&rules);
        (rules, tab)
    }

    const RULES: &str = r#"
rules:
  - name: compile
    stems: { file: ".+" }
    targets: { obj: "build/{file}.o" }
    cmd: "cc"
  - name: generic
    stems: { p: ".+" }
    targets: { out: "{p}.o" }
    cmd: "gen"
  - name: exact
    targets: { out: "build/main.o" }
    cmd: "special"
  - name: anti_tmp
    kind: anti
    stems: { p: ".+" }
    targets: { out: "build/{p}.tmp" }
    cmd: ""
"#;

    #[test]
    fn longest_suffix_then_prefix() {
        let (rules, tab) = tab(RULES);
        let cands = tab.rule_tgts("build/foo.o");
        assert!(!cands.is_empty());
        let names: Vec<&str> = cands.iter().map(|rt| rules.get(rt.rule).name.as_str()).collect();
        // both compile (prefix build/) and generic (no prefix) match; the
        // longer-literal rule sorts first at equal priority
        assert!(names.contains(&"compile"));
        assert!(names.contains(&"generic"));
        assert_eq!(names[0], "compile");
    }

    #[test]
    fn stemless_exact_match_only() {
        let (rules, tab) = tab(RULES);
        let names: Vec<&str> = tab
            .rule_tgts("build/main.o")
            .iter()
            .map(|rt| rules.get(rt.rule).name.as_str())
            .collect();
        assert_eq!(names[0], "exact", "stem-less bucket is the longest suffix");
        // other names never reach the exact bucket
        let names: Vec<&str> = tab
            .rule_tgts("build/other.o")
            .iter()
            .map(|rt| rules.get(rt.rule).name.as_str())
            .collect();
        assert!(!names.contains(&"exact"));
    }

    #[test]
    fn anti_sorts_before_plain() {
        let (rules, tab) = tab(RULES);
        let names: Vec<&str> = tab
            .rule_tgts("build/x.tmp")
            .iter()
            .map(|rt| rules.get(rt.rule).name.as_str())
            .collect();
        assert_eq!(names.first().copied(), Some("anti_tmp"));
    }

    #[test]
    fn shorter_suffix_propagates_to_longer() {
        let y = r#"
rules:
  - name: any_o
    stems: { p: ".+" }
    targets: { out: "{p}.o" }
    cmd: "a"
  - name: gen_o
    stems: { p: ".+" }
    targets: { out: "{p}_gen.o" }
    cmd: "b"
"#;
        let (rules, tab) = tab(y);
        // the longest-suffix lookup for "foo_gen.o" lands on the "_gen.o"
        // bucket; the ".o" rule matches that name too, so propagation must
        // have merged it into the longer bucket
        let names: Vec<&str> = tab
            .rule_tgts("foo_gen.o")
            .iter()
            .map(|rt| rules.get(rt.rule).name.as_str())
            .collect();
        assert!(names.contains(&"gen_o"));
        assert!(names.contains(&"any_o"));
    }

    #[test]
    fn deterministic_candidates() {
        let (_, tab1) = tab(RULES);
        let (_, tab2) = tab(RULES);
        for name in ["build/foo.o", "build/main.o", "x.o", "build/a.tmp"] {
            assert_eq!(tab1.rule_tgts(name), tab2.rule_tgts(name), "{name}");
        }
    }

    #[test]
    fn no_match_is_empty() {
        let (_, tab) = tab(RULES);
        assert!(tab.rule_tgts("README.md").is_empty());
    }
}
