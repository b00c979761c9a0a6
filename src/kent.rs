//! Chaining, netting and projection with the UCSC kent utilities.
//!
//! Each function is one step: it returns its artifact path whether it ran,
//! was skipped as fresh, or only reported what it would run.
use std::path::{Path, PathBuf};

use ahash::AHashSet;
use anyhow::bail;

use crate::{
    config::RunContext,
    external::{Stage, StageInput, StageOutput, Step},
    species::GenomeFiles,
};

/// `{q}.axt.gz -> {q}.chain`
pub fn axt_chain(
    ctx: &RunContext,
    target_2bit: &Path,
    query_2bit: &Path,
    axtgz: &Path,
) -> anyhow::Result<PathBuf> {
    let chain = axtgz.with_extension("").with_extension("chain");
    let step = Step::new(&chain, &[axtgz]);
    let staging = step.staging_path();
    step.stage(
        Stage::new(ctx.tools.program("axtChain"))
            .args(ctx.tools.options("axtChain", "-"))
            .arg("stdin")
            .arg(target_2bit)
            .arg(query_2bit)
            .arg(&staging)
            .stdin(StageInput::Gzip(axtgz.to_owned())),
    )
    .run(ctx)
}

/// Merges every chain of one target chromosome and drops chains that cannot
/// be part of a net.
pub fn merge_sort_pre(
    ctx: &RunContext,
    chains: &[PathBuf],
    target_sizes: &Path,
    query_sizes: &Path,
) -> anyhow::Result<PathBuf> {
    let parents: AHashSet<&Path> = chains.iter().filter_map(|c| c.parent()).collect();
    let subdir = match parents.into_iter().collect::<Vec<_>>().as_slice() {
        [one] => one.to_path_buf(),
        [] => bail!("no chain files to merge"),
        _ => bail!("chains are not in the same directory"),
    };
    let pre_chain = subdir.join("pre.chain.gz");
    Step::new(&pre_chain, chains)
        .stage(Stage::new(ctx.tools.program("chainMergeSort")).args(chains))
        .stage(
            Stage::new(ctx.tools.program("chainPreNet"))
                .arg("stdin")
                .arg(target_sizes)
                .arg(query_sizes)
                .arg("stdout")
                .stdout(StageOutput::GzipArtifact),
        )
        .run(ctx)
}

/// Nets the pre-chain (the reciprocal net goes to /dev/null) and adds synteny
/// annotation.
pub fn chain_net_syntenic(
    ctx: &RunContext,
    pre_chain: &Path,
    target_sizes: &Path,
    query_sizes: &Path,
) -> anyhow::Result<PathBuf> {
    let syntenic_net = pre_chain.with_file_name("syntenic.net");
    let step = Step::new(&syntenic_net, &[pre_chain]);
    let staging = step.staging_path();
    step.stage(
        Stage::new(ctx.tools.program("chainNet"))
            .args(ctx.tools.options("chainNet", "-"))
            .arg("stdin")
            .arg(target_sizes)
            .arg(query_sizes)
            .args(["stdout", "/dev/null"])
            .stdin(StageInput::Gzip(pre_chain.to_owned())),
    )
    .stage(
        Stage::new(ctx.tools.program("netSyntenic"))
            .arg("stdin")
            .arg(&staging),
    )
    .run(ctx)
}

/// Projects the net back to alignments and writes `sing.maf` with sequence
/// names prefixed by species short codes.
pub fn net_axt_maf(
    ctx: &RunContext,
    syntenic_net: &Path,
    pre_chain: &Path,
    target: &GenomeFiles,
    query: &GenomeFiles,
) -> anyhow::Result<PathBuf> {
    let sing_maf = syntenic_net.with_file_name("sing.maf");
    let step = Step::new(&sing_maf, &[syntenic_net, pre_chain]);
    let staging = step.staging_path();
    step.stage(
        Stage::new(ctx.tools.program("netToAxt"))
            .args(ctx.tools.options("netToAxt", "-"))
            .arg(syntenic_net)
            .arg("stdin")
            .arg(&target.genome_2bit)
            .arg(&query.genome_2bit)
            .arg("stdout")
            .stdin(StageInput::Gzip(pre_chain.to_owned())),
    )
    .stage(Stage::new(ctx.tools.program("axtSort")).args(["stdin", "stdout"]))
    .stage(
        Stage::new(ctx.tools.program("axtToMaf"))
            .arg(format!("-tPrefix={}.", target.short_code))
            .arg(format!("-qPrefix={}.", query.short_code))
            .arg("stdin")
            .arg(&target.sizes)
            .arg(&query.sizes)
            .arg(&staging),
    )
    .run(ctx)
}

/// The integration chain of one target chromosome.
pub fn integrate(
    ctx: &RunContext,
    chains: &[PathBuf],
    target: &GenomeFiles,
    query: &GenomeFiles,
) -> anyhow::Result<PathBuf> {
    let pre_chain = merge_sort_pre(ctx, chains, &target.sizes, &query.sizes)?;
    let syntenic_net = chain_net_syntenic(ctx, &pre_chain, &target.sizes, &query.sizes)?;
    net_axt_maf(ctx, &syntenic_net, &pre_chain, target, query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunContextBuilder;
    use std::fs::{self, File};
    use tempfile::TempDir;

    fn dry_ctx(dir: &TempDir) -> RunContext {
        RunContextBuilder::default()
            .dry_run(true)
            .outdir(dir.path())
            .db_prefix(dir.path())
            .build()
            .unwrap()
    }

    #[test]
    fn artifact_names_follow_layout() {
        let dir = TempDir::new().unwrap();
        let ctx = dry_ctx(&dir);
        let sub = dir.path().join("chromosome.1");
        let chain = axt_chain(
            &ctx,
            Path::new("t.2bit"),
            Path::new("q.2bit"),
            &sub.join("chromosome.3.axt.gz"),
        )
        .unwrap();
        assert_eq!(chain, sub.join("chromosome.3.chain"));
        let pre = merge_sort_pre(
            &ctx,
            &[chain.clone(), sub.join("chromosome.4.chain")],
            Path::new("t.sizes"),
            Path::new("q.sizes"),
        )
        .unwrap();
        assert_eq!(pre, sub.join("pre.chain.gz"));
        let net = chain_net_syntenic(&ctx, &pre, Path::new("t.sizes"), Path::new("q.sizes")).unwrap();
        assert_eq!(net, sub.join("syntenic.net"));
        assert!(!sub.exists());
    }

    #[test]
    fn merge_rejects_mixed_directories() {
        let dir = TempDir::new().unwrap();
        let ctx = dry_ctx(&dir);
        let chains = [
            dir.path().join("chromosome.1/chromosome.1.chain"),
            dir.path().join("chromosome.2/chromosome.1.chain"),
        ];
        assert!(merge_sort_pre(&ctx, &chains, Path::new("t"), Path::new("q")).is_err());
        assert!(merge_sort_pre(&ctx, &[], Path::new("t"), Path::new("q")).is_err());
    }

    #[test]
    fn fresh_pre_chain_is_kept() {
        let dir = TempDir::new().unwrap();
        let ctx = RunContextBuilder::default()
            .outdir(dir.path())
            .db_prefix(dir.path())
            .build()
            .unwrap();
        let sub = dir.path().join("chromosome.1");
        fs::create_dir_all(&sub).unwrap();
        let chain = sub.join("chromosome.1.chain");
        File::create(&chain).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let pre = sub.join("pre.chain.gz");
        fs::write(&pre, b"existing").unwrap();
        // the programs do not exist, so anything but a skip fails
        let mut ctx = ctx;
        ctx.tools
            .programs
            .insert("chainMergeSort".into(), "/nonexistent/chainMergeSort".into());
        let got = merge_sort_pre(&ctx, &[chain], Path::new("t"), Path::new("q")).unwrap();
        assert_eq!(got, pre);
        assert_eq!(fs::read(&pre).unwrap(), b"existing");
    }
}
