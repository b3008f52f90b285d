use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::digest::Crc;
use crate::engine::EngineCore;
use crate::store_disk::RepoLayout;
use crate::types::JobIdx;

// ─── Table format ─────────────────────────────────────────────

/// One association of a codec table. Lines are ` <ctx> <code> <value>`,
/// space-led; a missing code asks the engine to assign one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub ctx: String,
    pub code: String,
    pub value: String,
}

pub fn parse_table(text: &str) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for (lno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let Some(rest) = line.strip_prefix(' ') else {
            bail!("line {}: association lines must start with a space", lno + 1);
        };
        let mut it = rest.splitn(3, ' ');
        let ctx = it.next().unwrap_or_default();
        let code = it.next().unwrap_or_default();
        let value = it.next().unwrap_or_default();
        if ctx.is_empty() {
            bail!("line {}: missing ctx", lno + 1);
        }
        entries.push(Entry { ctx: ctx.to_string(), code: code.to_string(), value: value.to_string() });
    }
    Ok(entries)
}

pub fn format_table(entries: &[Entry]) -> String {
    let mut out = String::new();
    for e in entries {
        out.push(' ');
        out.push_str(&e.ctx);
        out.push(' ');
        out.push_str(&e.code);
        out.push(' ');
        out.push_str(&e.value);
        out.push('\n');
    }
    out
}

fn crc_hex(value: &str) -> String {
    format!("{}", Crc::from_bytes(value.as_bytes()))
}

/// Assign codes and resolve clashes: a short code mapping to two values
/// is disambiguated by greedily appending further hex digits of the value
/// crc until unique.
pub fn resolve(entries: &[Entry]) -> Result<(Vec<Entry>, bool)> {
    let mut resolved: Vec<Entry> = Vec::with_capacity(entries.len());
    let mut by_key: BTreeMap<(String, String), String> = BTreeMap::new(); // (ctx,code) -> value
    let mut changed = false;
    for e in entries {
        let hex = crc_hex(&e.value);
        let mut code = if e.code.is_empty() {
            changed = true;
            hex[..2.min(hex.len())].to_string()
        } else {
            e.code.clone()
        };
        let mut n_digits = 0;
        loop {
            match by_key.get(&(e.ctx.clone(), code.clone())) {
                None => break,
                Some(v) if *v == e.value => break, // same association, idempotent
                Some(_) => {
                    // clash: extend with further crc digits until unique
                    n_digits += 1;
                    if n_digits > hex.len() {
                        bail!("cannot disambiguate code {} in ctx {}", e.code, e.ctx);
                    }
                    code = format!("{}{}", e.code, &hex[..n_digits]);
                    changed = true;
                }
            }
        }
        if by_key.insert((e.ctx.clone(), code.clone()), e.value.clone()).is_none() {
            resolved.push(Entry { ctx: e.ctx.clone(), code, value: e.value.clone() });
        }
    }
    Ok((resolved, changed))
}

// ─── Codec dir ────────────────────────────────────────────────

fn enc_component(s: &str) -> String {
    s.chars().map(|c| if c == '/' { '\u{1}' } else { c }).collect()
}

fn ctx_dir(layout: &RepoLayout, table: &str, ctx: &str) -> PathBuf {
    layout.codec_dir().join(enc_component(table)).join(enc_component(ctx))
}

/// Materialize the two directions of the table: one small file per
/// (ctx, code) holding the value and one per (ctx, value-crc) holding the
/// code. A fresh table is built in a tmp dir and moved in atomically.
pub fn write_dir(layout: &RepoLayout, table: &str, entries: &[Entry]) -> Result<()> {
    let table_dir = layout.codec_dir().join(enc_component(table));
    let fresh = !table_dir.exists();
    let build_dir = if fresh { table_dir.with_extension("tmp") } else { table_dir.clone() };
    if fresh {
        fs::remove_dir_all(&build_dir).ok();
    }
    for e in entries {
        let dir = if fresh {
            build_dir.join(enc_component(&e.ctx))
        } else {
            ctx_dir(layout, table, &e.ctx)
        };
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(format!("code-{}", enc_component(&e.code))), &e.value)?;
        fs::write(dir.join(format!("crc-{}", crc_hex(&e.value))), &e.code)?;
    }
    if fresh {
        fs::rename(&build_dir, &table_dir).context("cannot install codec dir")?;
    }
    Ok(())
}

/// code -> value.
pub fn decode(layout: &RepoLayout, table: &str, ctx: &str, code: &str) -> Option<String> {
    fs::read_to_string(ctx_dir(layout, table, ctx).join(format!("code-{}", enc_component(code)))).ok()
}

/// value -> code.
pub fn encode(layout: &RepoLayout, table: &str, ctx: &str, value: &str) -> Option<String> {
    fs::read_to_string(ctx_dir(layout, table, ctx).join(format!("crc-{}", crc_hex(value)))).ok()
}

// ─── Engine entry point ───────────────────────────────────────

impl EngineCore {
    /// Refresh a codec job: parse its table dep, resolve codes, write the
    /// per-association files, and rewrite the table if codes were
    /// assigned.
    pub fn codec_refresh(&mut self, job: JobIdx) -> Result<()> {
        let table_node = match self.store.job_data(job).deps.first() {
            Some(d) => d.node,
            None => bail!("codec job without its table dep"),
        };
        let table_name = self.store.node_data(table_node).name.clone();
        let path = self.layout.root.join(&table_name);
        let text = fs::read_to_string(&path).with_context(|| format!("cannot read codec table {table_name}"))?;
        let entries = parse_table(&text)?;
        let (resolved, changed) = resolve(&entries)?;
        write_dir(&self.layout, &table_name, &resolved)?;
        if changed {
            fs::write(&path, format_table(&resolved)).with_context(|| format!("cannot rewrite codec table {table_name}"))?;
            let _ = crate::node::refresh_src(&mut self.store, &self.layout, table_node);
            tracing::info!(table = %table_name, "codec table rewritten with new codes");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_roundtrip() {
        let text = " colors red #ff0000\n colors green #00ff00\n";
        let entries = parse_table(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], Entry { ctx: "colors".into(), code: "red".into(), value: "#ff0000".into() });
        assert_eq!(format_table(&entries), text);
        assert!(parse_table("bad line").is_err());
    }

    #[test]
    fn resolve_assigns_missing_codes() {
        let entries = vec![Entry { ctx: "c".into(), code: String::new(), value: "v1".into() }];
        let (resolved, changed) = resolve(&entries).unwrap();
        assert!(changed);
        assert_eq!(resolved.len(), 1);
        assert!(!resolved[0].code.is_empty());
    }

    #[test]
    fn resolve_disambiguates_clashes() {
        let entries = vec![
            Entry { ctx: "c".into(), code: "k".into(), value: "v1".into() },
            Entry { ctx: "c".into(), code: "k".into(), value: "v2".into() },
        ];
        let (resolved, changed) = resolve(&entries).unwrap();
        assert!(changed);
        assert_eq!(resolved.len(), 2);
        assert_ne!(resolved[0].code, resolved[1].code);
        assert_eq!(resolved[0].code, "k");
        assert!(resolved[1].code.starts_with('k'));
        // resolution is stable: re-resolving the resolved table changes nothing
        let (again, changed2) = resolve(&resolved).unwrap();
        assert!(!changed2);
        assert_eq!(again, resolved);
    }

    #[test]
    fn dir_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        let entries = vec![
            Entry { ctx: "colors".into(), code: "red".into(), value: "#ff0000".into() },
            Entry { ctx: "colors".into(), code: "green".into(), value: "#00ff00".into() },
        ];
        write_dir(&layout, "tab", &entries).unwrap();
        assert_eq!(decode(&layout, "tab", "colors", "red").as_deref(), Some("#ff0000"));
        assert_eq!(encode(&layout, "tab", "colors", "#00ff00").as_deref(), Some("green"));
        assert_eq!(decode(&layout, "tab", "colors", "blue"), None);
    }
}
