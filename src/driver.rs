//! Expands the requested species into pairwise jobs and runs them one after another.
use std::sync::Arc;

use ahash::AHashMap;
use anyhow::bail;
use itertools::Itertools;
use tracing::{error, info, warn};

use crate::{
    config::RunContext,
    error::PipelineError,
    lastz::PairwiseAlignment,
    scheduler::{run_graph, WorkerPools},
    species::{short_codes, GenomeFiles, SpeciesCatalog},
    structures::{PairReport, TaskFailure, TaskGraph, TaskId},
};

/// `"a, b,,a"` -> `[a, b]`
pub fn parse_species_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unique()
        .map(String::from)
        .collect()
}

/// Cross product of targets and queries without self-pairs, in request order.
pub fn plan_pairs(targets: &[String], queries: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    if targets.is_empty() {
        bail!(PipelineError::config("no target species given"));
    }
    if queries.is_empty() {
        bail!(PipelineError::config("no query species given"));
    }
    let pairs = targets
        .iter()
        .cartesian_product(queries.iter())
        .filter(|(t, q)| t != q)
        .map(|(t, q)| (t.clone(), q.clone()))
        .collect_vec();
    if pairs.is_empty() {
        bail!(PipelineError::config(
            "every requested pair aligns a species with itself"
        ));
    }
    Ok(pairs)
}

/// Runs every pairwise job. Configuration problems abort before any job
/// starts; failures inside a job are collected into its report.
pub fn run(
    ctx: Arc<RunContext>,
    pools: &WorkerPools,
    targets: &[String],
    queries: &[String],
) -> anyhow::Result<Vec<PairReport>> {
    let pairs = plan_pairs(targets, queries)?;
    let catalog = SpeciesCatalog::open(&ctx.db_prefix)?;
    let requested = targets.iter().chain(queries.iter()).unique().collect_vec();
    if let Some(unknown) = requested.iter().find(|sp| !catalog.contains(sp)) {
        bail!(PipelineError::config(format!(
            "unknown species {} (not among the {} under {})",
            unknown,
            catalog.names().len(),
            ctx.db_prefix.join("fasta").display()
        )));
    }
    let codes = short_codes(&requested)?;
    pools.resize(ctx.jobs)?;
    info!("{} pairwise jobs, {} workers", pairs.len(), pools.jobs());

    let mut reports = Vec::with_capacity(pairs.len());
    for (target, query) in pairs {
        info!("## {} {} start", target, query);
        let report = run_pair(&ctx, pools, &catalog, &codes, &target, &query);
        info!("## {} {} end", target, query);
        reports.push(report);
    }
    Ok(reports)
}

fn run_pair(
    ctx: &Arc<RunContext>,
    pools: &WorkerPools,
    catalog: &SpeciesCatalog,
    codes: &AHashMap<String, String>,
    target: &str,
    query: &str,
) -> PairReport {
    let mut report = PairReport {
        target: target.to_string(),
        query: query.to_string(),
        products: vec![],
        failures: vec![],
    };
    let planned = GenomeFiles::locate(catalog, codes, target).and_then(|t| {
        let q = GenomeFiles::locate(catalog, codes, query)?;
        let graph = TaskGraph::build(&t.chromosomes, &q.chromosomes)?;
        Ok((t, q, graph))
    });
    let (target_files, query_files, graph) = match planned {
        Ok(p) => p,
        Err(e) => {
            error!("{} x {}: {:#}", target, query, e);
            report.failures.push(TaskFailure {
                task: TaskId::Plan,
                error: format!("{:#}", e),
            });
            return report;
        }
    };
    info!(
        "{} x {}: {} target x {} query chromosomes",
        target,
        query,
        target_files.chromosomes.len(),
        query_files.chromosomes.len()
    );
    let runner = Arc::new(PairwiseAlignment::new(ctx.clone(), target_files, query_files));
    let outcome = run_graph(pools, graph, runner, ctx.show_progress);
    report.products = outcome
        .integrated
        .into_iter()
        .filter(|p| ctx.dry_run || p.exists())
        .collect();
    for product in &report.products {
        println!("{}", product.display());
    }
    report.failures = outcome.failures;
    report
}

/// Logs every failed unit; an error if there was any.
pub fn summarize(reports: &[PairReport]) -> anyhow::Result<()> {
    let mut failed = 0;
    for report in reports {
        for failure in &report.failures {
            warn!(
                "{} x {}: {} failed: {}",
                report.target,
                report.query,
                failure.task,
                failure.error
            );
            failed += 1;
        }
    }
    let produced: usize = reports.iter().map(|r| r.products.len()).sum();
    info!("{} alignments produced, {} units failed", produced, failed);
    if failed > 0 {
        bail!(
            "{} of {} pairwise jobs had failures",
            reports.iter().filter(|r| !r.failures.is_empty()).count(),
            reports.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RunContextBuilder, species::tests::fake_genome};
    use std::{
        collections::BTreeMap,
        fs,
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
    };
    use tempfile::TempDir;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    /// Shell stand-ins for the alignment tools; each logs its name to `log`
    /// and moves its input along to where the real tool would write.
    /// `overrides` replaces the body of the named tools.
    fn fake_tools(dir: &Path, log: &Path, overrides: &[(&str, &str)]) -> BTreeMap<String, String> {
        let bodies = [
            ("lastz", r#"echo "a $1 $2""#),
            ("axtChain", r#"for last; do :; done; cat > "$last""#),
            ("chainMergeSort", r#"cat "$@""#),
            ("chainPreNet", "cat"),
            ("chainNet", "cat"),
            ("netSyntenic", r#"cat > "$2""#),
            ("netToAxt", "cat"),
            ("axtSort", "cat"),
            ("axtToMaf", r#"for last; do :; done; cat > "$last""#),
        ];
        bodies
            .iter()
            .map(|(name, body)| {
                let body = overrides
                    .iter()
                    .find(|(n, _)| n == name)
                    .map_or(*body, |(_, b)| *b);
                let path = dir.join(name);
                fs::write(
                    &path,
                    format!("#!/bin/sh\necho {} >> {}\n{}\n", name, log.display(), body),
                )
                .unwrap();
                fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
                (name.to_string(), path.to_string_lossy().into_owned())
            })
            .collect()
    }

    struct Fixture {
        root: TempDir,
        log: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            let db = root.path().join("db");
            fake_genome(&db, "oryza_sativa", 2);
            fake_genome(&db, "leersia_perrieri", 2);
            fs::create_dir_all(root.path().join("bin")).unwrap();
            let log = root.path().join("calls.log");
            Self { root, log }
        }

        fn ctx(&self, dry_run: bool) -> Arc<RunContext> {
            self.ctx_with(dry_run, &[])
        }

        fn ctx_with(&self, dry_run: bool, overrides: &[(&str, &str)]) -> Arc<RunContext> {
            let mut ctx = RunContextBuilder::default()
                .dry_run(dry_run)
                .jobs(2)
                .outdir(self.root.path().join("pairwise"))
                .db_prefix(self.root.path().join("db"))
                .build()
                .unwrap();
            ctx.tools.programs = fake_tools(&self.root.path().join("bin"), &self.log, overrides);
            Arc::new(ctx)
        }

        fn calls(&self) -> usize {
            fs::read_to_string(&self.log)
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }
    }

    #[test]
    fn species_lists_are_sanitized() {
        assert_eq!(
            parse_species_list(" oryza_sativa,,leersia_perrieri , oryza_sativa"),
            names(&["oryza_sativa", "leersia_perrieri"])
        );
        assert!(parse_species_list(" , ").is_empty());
    }

    #[test]
    fn self_pairs_are_dropped() {
        let pairs = plan_pairs(
            &names(&["oryza_sativa"]),
            &names(&["leersia_perrieri", "oryza_sativa"]),
        )
        .unwrap();
        assert_eq!(
            pairs,
            vec![("oryza_sativa".to_string(), "leersia_perrieri".to_string())]
        );
        let abc = names(&["a", "b", "a"]);
        let pairs = plan_pairs(&abc, &abc).unwrap();
        assert!(pairs.iter().all(|(t, q)| t != q));
        assert!(pairs.contains(&("b".to_string(), "a".to_string())));
    }

    #[test]
    fn empty_or_self_only_requests_are_config_errors() {
        for (t, q) in [
            (names(&[]), names(&["a"])),
            (names(&["a"]), names(&[])),
            (names(&["a"]), names(&["a"])),
        ] {
            let err = plan_pairs(&t, &q).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<PipelineError>(),
                Some(PipelineError::Config(_))
            ));
        }
    }

    #[test]
    fn unknown_species_is_rejected_before_running() {
        let fx = Fixture::new();
        let pools = WorkerPools::new(2).unwrap();
        let err = run(
            fx.ctx(false),
            &pools,
            &names(&["oryza_sativa"]),
            &names(&["zea_mays"]),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Config(_))
        ));
        assert_eq!(fx.calls(), 0);
    }

    #[test]
    fn full_run_then_rerun_is_idempotent() {
        let fx = Fixture::new();
        let pools = WorkerPools::new(2).unwrap();
        let ctx = fx.ctx(false);
        let targets = names(&["oryza_sativa"]);
        let queries = names(&["leersia_perrieri", "oryza_sativa"]);

        let reports = run(ctx.clone(), &pools, &targets, &queries).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].failures.is_empty(), "{:?}", reports[0].failures);
        summarize(&reports).unwrap();
        // 4 alignments x 2 tools, 2 integrations x 7 tools
        assert_eq!(fx.calls(), 22);
        let pair_dir = fx.root.path().join("pairwise/oryza_sativa/leersia_perrieri");
        let mut products = reports[0].products.clone();
        products.sort();
        assert_eq!(
            products,
            vec![
                pair_dir.join("chromosome.1/sing.maf"),
                pair_dir.join("chromosome.2/sing.maf")
            ]
        );
        let maf = fs::read_to_string(&products[0]).unwrap();
        assert_eq!(maf.lines().count(), 2);
        assert!(maf.starts_with("a "));
        assert!(!pair_dir.join("chromosome.1/sing.maf.part").exists());

        let again = run(ctx, &pools, &targets, &queries).unwrap();
        assert!(again[0].failures.is_empty());
        assert_eq!(again[0].products.len(), 2);
        assert_eq!(fx.calls(), 22);
        assert_eq!(fs::read_to_string(&products[0]).unwrap(), maf);
    }

    #[test]
    fn dry_run_reports_paths_and_creates_nothing() {
        let fx = Fixture::new();
        let pools = WorkerPools::new(2).unwrap();
        let reports = run(
            fx.ctx(true),
            &pools,
            &names(&["oryza_sativa"]),
            &names(&["leersia_perrieri"]),
        )
        .unwrap();
        assert!(!fx.root.path().join("pairwise").exists());
        assert_eq!(fx.calls(), 0);

        let mut planned = reports[0].products.clone();
        let real = run(
            fx.ctx(false),
            &pools,
            &names(&["oryza_sativa"]),
            &names(&["leersia_perrieri"]),
        )
        .unwrap();
        let mut produced = real[0].products.clone();
        planned.sort();
        produced.sort();
        assert_eq!(planned.len(), 2);
        assert_eq!(planned, produced);
    }

    #[test]
    fn failing_tool_fails_only_its_alignment() {
        let fx = Fixture::new();
        let pools = WorkerPools::new(2).unwrap();
        let chain_fails_for_1x2 = r#"for last; do :; done
cat > "$last"
case "$*" in
*Oryza_sativa.ASM1.dna_sm.chromosome.1.2bit*Leersia_perrieri.ASM1.dna_sm.chromosome.2.2bit*) exit 1 ;;
esac"#;
        let reports = run(
            fx.ctx_with(false, &[("axtChain", chain_fails_for_1x2)]),
            &pools,
            &names(&["oryza_sativa"]),
            &names(&["leersia_perrieri"]),
        )
        .unwrap();
        let report = &reports[0];
        assert_eq!(report.failures.len(), 1, "{:?}", report.failures);
        assert_eq!(
            report.failures[0].task,
            TaskId::Align {
                target: "chromosome.1".into(),
                query: "chromosome.2".into()
            }
        );
        assert!(report.failures[0].error.contains("axtChain"));

        let sub = fx
            .root
            .path()
            .join("pairwise/oryza_sativa/leersia_perrieri/chromosome.1");
        assert!(!sub.join("chromosome.2.chain").exists());
        assert!(!sub.join("chromosome.2.chain.part").exists());
        assert!(sub.join("chromosome.1.chain").exists());
        let mut products = report.products.clone();
        products.sort();
        assert_eq!(
            products,
            vec![
                sub.join("sing.maf"),
                sub.with_file_name("chromosome.2").join("sing.maf")
            ]
        );
        assert_eq!(fs::read_to_string(sub.join("sing.maf")).unwrap().lines().count(), 1);
        assert!(summarize(&reports).is_err());
    }

    #[test]
    fn missing_prerequisite_fails_only_its_pair() {
        let fx = Fixture::new();
        let db = fx.root.path().join("db");
        fake_genome(&db, "zea_mays", 1);
        fs::remove_file(db.join("fasta/zea_mays/dna/fasize.chrom.sizes")).unwrap();
        let pools = WorkerPools::new(2).unwrap();
        let reports = run(
            fx.ctx(true),
            &pools,
            &names(&["oryza_sativa"]),
            &names(&["zea_mays", "leersia_perrieri"]),
        )
        .unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].query, "zea_mays");
        assert_eq!(reports[0].failures.len(), 1);
        assert_eq!(reports[0].failures[0].task, TaskId::Plan);
        assert!(reports[1].failures.is_empty());
        assert_eq!(reports[1].products.len(), 2);
        assert!(summarize(&reports).is_err());
    }
}
