use std::{
    collections::BTreeMap,
    env,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::Context;
use derive_builder::Builder;
use lazy_static::lazy_static;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

const CONFIG_NAME: &str = ".pairwise.json";
const VERSION_VAR: &str = "ENSEMBLGENOMES_VERSION";

lazy_static! {
    static ref DEFAULTS: Value = serde_json::from_str(include_str!("default_config.json"))
        .expect("built-in config must be valid JSON");
}

#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned")]
/// Everything a run needs to know, decided once in `main` and shared read-only with every task
pub struct RunContext {
    /// Report would-be commands and outputs without touching the filesystem
    #[builder(default)]
    pub dry_run: bool,
    /// Faster, less sensitive lastz parameters
    #[builder(default)]
    pub quick: bool,
    #[builder(default = "num_cpus::get()")]
    pub jobs: usize,
    #[builder(default)]
    pub show_progress: bool,
    /// Root of `{target}/{query}/...` outputs
    #[builder(setter(into), default = "PathBuf::from(\"pairwise\")")]
    pub outdir: PathBuf,
    /// Genome database release directory holding `fasta/{species}/dna/`
    #[builder(setter(into))]
    pub db_prefix: PathBuf,
    #[builder(default)]
    pub tools: ToolConfig,
}

impl RunContext {
    pub fn pair_dir(&self, target: &str, query: &str) -> PathBuf {
        self.outdir.join(target).join(query)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub root: String,
    pub version: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolConfig {
    pub db: DbConfig,
    /// executable overrides, keyed by tool name
    #[serde(default)]
    pub programs: BTreeMap<String, String>,
    /// per-tool option tables
    #[serde(default)]
    pub options: BTreeMap<String, BTreeMap<String, Value>>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        serde_json::from_value(DEFAULTS.clone()).expect("built-in config must match ToolConfig")
    }
}

impl ToolConfig {
    /// Built-in defaults, then `~/.pairwise.json`, then `./.pairwise.json`, then `extra`.
    pub fn load(extra: Option<&Path>) -> anyhow::Result<Self> {
        let mut layers: Vec<PathBuf> = vec![];
        if let Some(home) = dirs::home_dir() {
            layers.push(home.join(CONFIG_NAME));
        }
        layers.push(PathBuf::from(CONFIG_NAME));
        let mut merged = DEFAULTS.clone();
        for path in layers.iter().filter(|p| p.exists()) {
            merge_file(&mut merged, path)?;
        }
        if let Some(path) = extra {
            merge_file(&mut merged, path)?;
        }
        Self::from_value(merged)
    }

    pub fn from_value(value: Value) -> anyhow::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn program<'a>(&'a self, tool: &'a str) -> &'a str {
        self.programs.get(tool).map(String::as_str).unwrap_or(tool)
    }

    /// Renders the option table of `tool`, e.g. `-minScore=5000`; `true` becomes a bare flag.
    pub fn options(&self, tool: &str, dashes: &str) -> Vec<String> {
        let table = match self.options.get(tool) {
            Some(t) => t,
            None => return vec![],
        };
        table
            .iter()
            .filter_map(|(key, value)| match value {
                Value::Null | Value::Bool(false) => None,
                Value::Bool(true) => Some(format!("{}{}", dashes, key)),
                Value::String(s) => Some(format!("{}{}={}", dashes, key, s)),
                other => Some(format!("{}{}={}", dashes, key, other)),
            })
            .collect()
    }

    /// `{db.root}/release-{version}`, with `ENSEMBLGENOMES_VERSION` taking precedence
    pub fn db_prefix(&self) -> anyhow::Result<PathBuf> {
        let version = match env::var(VERSION_VAR) {
            Ok(v) => v
                .trim()
                .parse::<u32>()
                .with_context(|| format!("{} is not a release number: {:?}", VERSION_VAR, v))?,
            Err(_) => self.db.version,
        };
        Ok(expand_home(&self.db.root).join(format!("release-{}", version)))
    }
}

fn merge_file(base: &mut Value, path: &Path) -> anyhow::Result<()> {
    debug!("reading config {}", path.display());
    let layer: Value = serde_json::from_reader(BufReader::new(
        File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
    ))
    .with_context(|| format!("invalid config {}", path.display()))?;
    update_nested(base, layer);
    Ok(())
}

/// Merges `other` into `base`: objects recursively, everything else replaced.
pub fn update_nested(base: &mut Value, other: Value) {
    match (base, other) {
        (Value::Object(base), Value::Object(other)) => {
            for (key, value) in other {
                let nested = value.is_object() && base.get(&key).map_or(false, Value::is_object);
                if !nested {
                    base.insert(key, value);
                } else if let Some(slot) = base.get_mut(&key) {
                    update_nested(slot, value);
                }
            }
        }
        (base, other) => *base = other,
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
