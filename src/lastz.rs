//! Pairwise genome alignment of one (target, query) species pair.
//!
//! src: `{prefix}/fasta/{species}/dna/*.chromosome.*.2bit`
//! dst: `{outdir}/{target}/{query}/{target_chr}/sing.maf`
use std::{path::PathBuf, sync::Arc};

use crate::{
    config::RunContext,
    external::{Stage, StageOutput, Step},
    kent,
    scheduler::PairRunner,
    species::GenomeFiles,
    structures::{ChromosomePair, TargetGroup},
};

pub struct PairwiseAlignment {
    ctx: Arc<RunContext>,
    target: GenomeFiles,
    query: GenomeFiles,
    outdir: PathBuf,
}

impl PairwiseAlignment {
    pub fn new(ctx: Arc<RunContext>, target: GenomeFiles, query: GenomeFiles) -> Self {
        let outdir = ctx.pair_dir(&target.species, &query.species);
        Self {
            ctx,
            target,
            query,
            outdir,
        }
    }

    /// `{outdir}/{target_chr}/{query_chr}.axt.gz`, compressed as lastz streams it out
    fn lastz_step(&self, pair: &ChromosomePair) -> Step {
        let axtgz = self
            .outdir
            .join(&pair.target_label)
            .join(format!("{}.axt.gz", pair.query_label));
        let tools = &self.ctx.tools;
        let mut lastz = Stage::new(tools.program("lastz"))
            .arg(&pair.target)
            .arg(&pair.query)
            .args(tools.options("lastz", "--"));
        if self.ctx.quick {
            lastz = lastz.args(tools.options("lastz_quick", "--"));
        }
        Step::new(&axtgz, &[&pair.target, &pair.query])
            .stage(lastz.stdout(StageOutput::GzipArtifact))
    }

    pub fn lastz(&self, pair: &ChromosomePair) -> anyhow::Result<PathBuf> {
        self.lastz_step(pair).run(&self.ctx)
    }
}

impl PairRunner for PairwiseAlignment {
    fn align(&self, pair: &ChromosomePair) -> anyhow::Result<PathBuf> {
        let axtgz = self.lastz(pair)?;
        kent::axt_chain(&self.ctx, &pair.target, &pair.query, &axtgz)
    }

    fn integrate(&self, _group: &TargetGroup, chains: &[PathBuf]) -> anyhow::Result<PathBuf> {
        kent::integrate(&self.ctx, chains, &self.target, &self.query)
    }
}
