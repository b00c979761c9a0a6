use std::{
    fs,
    path::{Path, PathBuf},
};

use ahash::AHashMap;
use anyhow::Context;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use crate::error::PipelineError;

lazy_static! {
    static ref DIGITS: Regex = Regex::new(r"\d+").unwrap();
}

const SOFTMASK_MARK: &str = "dna_sm.";
const SIZES_NAME: &str = "fasize.chrom.sizes";

/// 4-letter species code, `Oryza_sativa -> osat`
pub fn shorten(name: &str) -> String {
    let lower = name.to_lowercase();
    if lower == "olea_europaea_sylvestris" {
        return "oesy".to_string();
    }
    let mut split = lower.split('_');
    let genus = split.next().unwrap_or_default();
    let epithet = split.next().unwrap_or_default();
    genus.chars().take(1).chain(epithet.chars().take(3)).collect()
}

/// Short codes for `species`; two species sharing a code is a configuration error.
pub fn short_codes<S>(species: &[S]) -> anyhow::Result<AHashMap<String, String>>
where
    S: AsRef<str>,
{
    let mut by_code: AHashMap<String, String> = AHashMap::new();
    for sp in species.iter().map(|s| s.as_ref()).unique() {
        let code = shorten(sp);
        if let Some(other) = by_code.insert(code.clone(), sp.to_string()) {
            return Err(PipelineError::config(format!(
                "short code {} is shared by {} and {}",
                code, other, sp
            ))
            .into());
        }
    }
    Ok(by_code.into_iter().map(|(code, sp)| (sp, code)).collect())
}

/// Label of a chromosome artifact: its stem after the soft-mask mark,
/// `Oryza_sativa.IRGSP-1.0.dna_sm.chromosome.1.2bit -> chromosome.1`
pub fn chromosome_label(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match stem.rsplit_once(SOFTMASK_MARK) {
        Some((_, label)) => label.to_string(),
        None => stem,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum NaturalChunk {
    Text(String),
    Number(u64),
}

fn natural_key(s: &str) -> Vec<NaturalChunk> {
    let mut key = vec![];
    let mut last = 0;
    for m in DIGITS.find_iter(s) {
        key.push(NaturalChunk::Text(s[last..m.start()].to_string()));
        key.push(NaturalChunk::Number(m.as_str().parse().unwrap_or(u64::MAX)));
        last = m.end();
    }
    key.push(NaturalChunk::Text(s[last..].to_string()));
    key
}

/// `chromosome.2` before `chromosome.10`
pub fn sorted_naturally(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.sort_by_cached_key(|p| natural_key(&p.to_string_lossy()));
    paths
}

/// Species present in the local genome database (`{prefix}/fasta/*/`)
#[derive(Debug, Clone)]
pub struct SpeciesCatalog {
    prefix: PathBuf,
    names: Vec<String>,
}

impl SpeciesCatalog {
    pub fn open(prefix: &Path) -> anyhow::Result<Self> {
        let root = prefix.join("fasta");
        let mut names = vec![];
        for entry in fs::read_dir(&root)
            .with_context(|| format!("genome database not found: {}", root.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        debug!("{} species in {}", names.len(), root.display());
        Ok(Self {
            prefix: prefix.to_owned(),
            names,
        })
    }

    pub fn contains(&self, species: &str) -> bool {
        self.names.binary_search_by(|n| n.as_str().cmp(species)).is_ok()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn dna_dir(&self, species: &str) -> PathBuf {
        self.prefix.join("fasta").join(species).join("dna")
    }
}

/// Per-species upstream artifacts consumed by the pipeline
#[derive(Debug, Clone)]
pub struct GenomeFiles {
    pub species: String,
    pub short_code: String,
    pub genome_2bit: PathBuf,
    pub sizes: PathBuf,
    pub chromosomes: Vec<PathBuf>,
}

impl GenomeFiles {
    /// `codes` is the checked map from [`short_codes`]; a species missing from
    /// it is a configuration error.
    pub fn locate(
        catalog: &SpeciesCatalog,
        codes: &AHashMap<String, String>,
        species: &str,
    ) -> anyhow::Result<Self> {
        let short_code = codes.get(species).cloned().ok_or_else(|| {
            PipelineError::config(format!("no short code assigned to {}", species))
        })?;
        let dir = catalog.dna_dir(species);
        let missing = |what: String| PipelineError::MissingPrerequisite {
            species: species.to_string(),
            what,
            dir: dir.clone(),
        };
        let names: Vec<PathBuf> = match fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect(),
            Err(_) => return Err(missing("dna directory".to_string()).into()),
        };
        let pick = |suffix: &str| -> Result<PathBuf, PipelineError> {
            let found = names
                .iter()
                .filter(|p| file_name(p).ends_with(suffix))
                .collect_vec();
            match found.as_slice() {
                [one] => Ok((*one).clone()),
                _ => Err(missing(format!(
                    "exactly one *{} (found {})",
                    suffix,
                    found.len()
                ))),
            }
        };
        let genome_2bit = pick(".genome.2bit")?;
        let sizes = pick(SIZES_NAME)?;
        let chromosomes = sorted_naturally(
            names
                .iter()
                .filter(|p| {
                    let name = file_name(p);
                    name.contains(".chromosome.") && name.ends_with(".2bit")
                })
                .cloned()
                .collect(),
        );
        if chromosomes.is_empty() {
            return Err(missing("*.chromosome.*.2bit".to_string()).into());
        }
        debug!(species, chromosomes = chromosomes.len(), "located genome files");
        Ok(Self {
            species: species.to_string(),
            short_code,
            genome_2bit,
            sizes,
            chromosomes,
        })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
