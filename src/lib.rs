pub mod ace;
pub mod align;
pub mod cluster;
pub mod config;
pub mod distance;
pub mod error;
pub mod family;
pub mod formats;
pub mod overlap;
pub mod prune;
pub mod recruit;
pub mod reroot;
pub mod tools;
pub mod tree;

use crate::cluster::FilterRule;
use crate::config::{Config, DataSource, PathConfig};
use crate::error::Error;
use crate::family::ClusterSet;
use crate::prune::{prune_by_bootstrap, prune_by_overlaps, prune_by_strains};
use crate::recruit::{recruit_for_set, RecruitParams};
use crate::reroot::{reroot_families, RerootMode};
use crate::tools::{ToolRunner, TreeMethod};
use anyhow::{anyhow, bail, Result};
use clap::Parser;
use log::{info, warn};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Phylogenomic cluster pipeline
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Configuration file
    #[arg(short, long, value_name = "CONFIG")]
    pub config: Option<String>,

    /// Tabular blast report to cluster from
    #[arg(long, value_name = "BLAST")]
    pub blast: Option<String>,

    /// ACE assembly file to cluster from
    #[arg(long, value_name = "ACE")]
    pub ace: Option<String>,

    /// FASTA file of member sequences
    #[arg(long, value_name = "SEQS")]
    pub seqs: Option<String>,

    /// Strain table, one <member>TAB<strain> per line
    #[arg(long, value_name = "STRAINS")]
    pub strains: Option<String>,

    /// Blast defline file for annotating recruited hits
    #[arg(long, value_name = "DEFLINES")]
    pub deflines: Option<String>,

    /// GO annotation table for annotating members
    #[arg(long, value_name = "GO")]
    pub go_table: Option<String>,

    /// Cluster filter, e.g. "percentage_identity => 90; alignment_length => 60"
    #[arg(long, value_name = "VALUES")]
    pub cluster_values: Option<String>,

    /// Read the blast report with the fast tabular parser
    #[arg(long)]
    pub fast_blast_parser: bool,

    /// Stop admitting members once a cluster reaches this size
    #[arg(long, value_name = "MAX")]
    pub max_cluster_members: Option<usize>,

    /// Discard single-read contigs on assembly ingest
    #[arg(long)]
    pub nosinglets: bool,

    /// Root name for renumbered families
    #[arg(long, value_name = "NAME", default_value = "famtree")]
    pub rootname: String,

    /// Database FASTA to recruit homologous sequences from
    #[arg(long, value_name = "DB")]
    pub recruit_db: Option<String>,

    /// Strain label for recruited members
    #[arg(long, value_name = "STRAIN")]
    pub recruit_strain: Option<String>,

    /// Output directory
    #[arg(short, long, value_name = "OUTDIR", default_value = "famtree-out")]
    pub outdir: String,

    /// Worker threads for per-family phases
    #[arg(short, long, value_name = "THREADS", default_value = "4")]
    pub threads: usize,

    /// Seconds before an external tool invocation is abandoned
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, value_name = "LEVEL")]
    pub log: Option<String>,
}

// --------------------------------------------------
pub fn run(args: Args) -> Result<()> {
    if let Some(level) = &args.log {
        env_logger::Builder::new().parse_filters(level).init();
    } else {
        env_logger::init();
    }

    let mut config = match &args.config {
        Some(path) => Config::read(&mut formats::open(path)?)?,
        None => Config::default(),
    };
    merge_cli(&mut config, &args)?;
    validate(&config)?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads)
        .build()
        .map_err(|e| anyhow!("worker pool: {e}"))?;
    let runner = ToolRunner::new(args.timeout.map(Duration::from_secs));

    let outdir = PathBuf::from(&args.outdir);
    fs::create_dir_all(&outdir)?;

    let mut set = build_clusters(&config, &args)?;
    info!("built {} families", set.len());

    if let Some(path) = config
        .global
        .memberseq_filename
        .as_deref()
        .filter(|_| config.global.cluster_datasource == Some(DataSource::Blast))
    {
        let attached = formats::attach_member_seqs(&mut set, path)?;
        info!("attached {attached} member sequences from {path}");
    }
    if let Some(path) = &config.global.memberstrain_filename {
        set.strains = family::StrainTable::read(&mut formats::open(path)?)?;
        info!("loaded {} strain assignments", set.strains.len());
    }

    if let Some(path) = &args.go_table {
        let table = formats::read_go_table(&mut formats::open(path)?)?;
        annotate_members(&mut set, &table);
        info!("loaded GO annotations for {} members", table.len());
    }

    let mut membership =
        File::create(outdir.join(format!("{}-clusters.tsv", args.rootname)))?;
    formats::write_membership(&set, &mut membership)?;

    let deflines = match &args.deflines {
        Some(path) => formats::read_deflines(&mut formats::open(path)?)?,
        None => HashMap::new(),
    };

    for path_config in &config.paths {
        let label = path_config
            .name
            .clone()
            .unwrap_or_else(|| format!("path_{}", path_config.id));
        info!("processing path {label}");
        let path_dir = outdir.join(&label);
        fs::create_dir_all(&path_dir)?;
        run_path(
            &mut set,
            path_config,
            &args,
            &config.global.cluster_values,
            &deflines,
            &pool,
            &runner,
            &path_dir,
        )?;
        write_artifacts(&set, &path_dir)?;
    }

    info!("{} families survive", set.len());
    Ok(())
}

// --------------------------------------------------
/// Command-line options override whatever the configuration file said.
fn merge_cli(config: &mut Config, args: &Args) -> Result<()> {
    if let Some(blast) = &args.blast {
        config.global.cluster_datasource = Some(DataSource::Blast);
        config.global.cluster_filename = Some(blast.clone());
    }
    if let Some(ace) = &args.ace {
        config.global.cluster_datasource = Some(DataSource::Ace);
        config.global.cluster_filename = Some(ace.clone());
    }
    if args.fast_blast_parser {
        config.global.fast_blast_parser = true;
    }
    if let Some(values) = &args.cluster_values {
        config.global.cluster_values = config::parse_filter_values(values)?;
    }
    if let Some(seqs) = &args.seqs {
        config.global.memberseq_filename = Some(seqs.clone());
    }
    if let Some(strains) = &args.strains {
        config.global.memberstrain_filename = Some(strains.clone());
    }
    Ok(())
}

// --------------------------------------------------
fn validate(config: &Config) -> Result<()> {
    let global = &config.global;
    if global.fast_blast_parser && global.cluster_datasource != Some(DataSource::Blast) {
        bail!(Error::argument(
            "fast-blast-parser needs a blast datasource and file"
        ));
    }
    if global.cluster_datasource.is_none() {
        bail!(Error::argument(
            "no cluster datasource: give --blast or --ace"
        ));
    }
    if global.cluster_filename.is_none() {
        bail!(Error::argument("cluster datasource without a filename"));
    }
    for path in &config.paths {
        if path.alignment_program.is_some()
            && global.memberseq_filename.is_none()
            && global.cluster_datasource != Some(DataSource::Ace)
        {
            bail!(Error::argument(
                "run_alignments without member sequences: give --seqs"
            ));
        }
        let needs_strains = path.prune_strains.is_some()
            || path.prune_overlaps.is_some()
            || matches!(
                path.tree_arguments.reroot,
                Some(RerootMode::ReferenceStrain(_))
            );
        if needs_strains && global.memberstrain_filename.is_none() {
            bail!(Error::argument(
                "strain-aware operators without a strain table: give --strains"
            ));
        }
        if matches!(
            path.tree_arguments.reroot,
            Some(RerootMode::ReferenceStrain(_))
        ) && path.tree_method == Some(TreeMethod::Upgma)
        {
            bail!(Error::argument("outgroup_strain cannot reroot a upgma tree"));
        }
    }
    Ok(())
}

// --------------------------------------------------
fn build_clusters(config: &Config, args: &Args) -> Result<ClusterSet> {
    let filename = config.global.cluster_filename.as_deref().unwrap();
    let set = match config.global.cluster_datasource.unwrap() {
        DataSource::Blast => {
            let reader = formats::open(filename)?;
            let filter = config.global.cluster_values.clone();
            if config.global.fast_blast_parser {
                cluster::cluster_tabular(
                    reader,
                    &args.rootname,
                    filter,
                    args.max_cluster_members,
                )?
            } else {
                // The full parser hands the report to a collaborator;
                // a tabular report feeds the same hit stream
                cluster::cluster_from_hits(
                    cluster::read_tabular(reader),
                    &args.rootname,
                    filter,
                    args.max_cluster_members,
                )?
            }
        }
        DataSource::Ace => ace::read_ace(
            &mut formats::open(filename)?,
            ace::AceParams {
                nosinglets: args.nosinglets,
            },
        )?,
    };
    if set.is_empty() {
        bail!(Error::empty(format!("no clusters built from {filename}")));
    }
    Ok(set)
}

// --------------------------------------------------
/// One processing path over every family: align, recruit, prune by
/// overlaps, distance, prune by strains (recomputing distances the
/// selection invalidated), tree + reroot, bootstrap, prune by
/// bootstrap, topology table. Per-family tool failures are collected,
/// never fatal to siblings.
#[allow(clippy::too_many_arguments)]
fn run_path(
    set: &mut ClusterSet,
    path: &PathConfig,
    args: &Args,
    cluster_values: &[FilterRule],
    deflines: &HashMap<String, String>,
    pool: &rayon::ThreadPool,
    runner: &ToolRunner,
    path_dir: &Path,
) -> Result<()> {
    let work = path_dir.join("work");
    fs::create_dir_all(&work)?;

    if let Some(program) = path.alignment_program {
        let failed = parallel_phase(set, pool, "aligning", |fam| {
            tools::run_alignment(fam, program, &path.alignment_arguments, runner, &work)
        })?;
        report_failed("alignment", &failed);
    }

    if let Some(db) = &args.recruit_db {
        let mut params = RecruitParams::new(db);
        params.strain = args.recruit_strain.clone();
        params.filter = cluster_values.to_vec();
        params.deflines = deflines.clone();
        let report = recruit_for_set(set, &params, runner, &work)?;
        for (fam, members) in &report.added {
            info!("family {fam}: recruited {}", members.join(", "));
        }
        report_failed("recruit", &report.failed);
    }

    if let Some(overlap_args) = &path.prune_overlaps {
        let report = prune_by_overlaps(set, overlap_args)?;
        log_prune("prune_by_overlaps", &report);
    }

    if let Some(function) = &path.distance_function {
        let failed = parallel_phase(set, pool, "computing distances", |fam| {
            if fam.alignment.is_none() || fam.distance.is_some() {
                return Ok(());
            }
            tools::run_distance(fam, function, runner, &work)
        })?;
        report_failed("distance", &failed);
    }

    if let Some(strain_args) = &path.prune_strains {
        let report = prune_by_strains(set, strain_args)?;
        log_prune("prune_by_strains", &report);
        if let Some(function) = &path.distance_function {
            let failed = parallel_phase(set, pool, "recomputing distances", |fam| {
                if fam.alignment.is_none() || fam.distance.is_some() {
                    return Ok(());
                }
                tools::run_distance(fam, function, runner, &work)
            })?;
            report_failed("distance", &failed);
        }
    }

    if let Some(method) = &path.tree_method {
        let failed = parallel_phase(set, pool, "inferring trees", |fam| {
            if fam.alignment.is_none() {
                return Ok(());
            }
            tools::run_tree(fam, method, runner, &work)
        })?;
        report_failed("tree", &failed);
        if let Some(mode) = &path.tree_arguments.reroot {
            let failed = reroot_families(set, mode)?;
            report_failed("reroot", &failed);
        }
    }

    if let Some(replicates) = path.bootstrap_replicates {
        let failed = parallel_phase(set, pool, "bootstrapping", |fam| {
            if fam.alignment.is_none() {
                return Ok(());
            }
            tools::run_bootstrap(fam, replicates, runner, &work)
        })?;
        report_failed("bootstrap", &failed);
    }

    if let Some(cutoff) = path.bootstrap_cutoff {
        let report = prune_by_bootstrap(set, cutoff);
        log_prune("prune_by_bootstrap", &report);
    }

    if path.topoanalysis {
        write_topologies(set, &path_dir.join("topologies.tsv"))?;
    }
    Ok(())
}

// --------------------------------------------------
/// Fan one fallible per-family step over the worker pool. ToolFailure
/// and EmptyInput stay with their family and land on the failed list;
/// anything else aborts the phase.
fn parallel_phase<F>(
    set: &mut ClusterSet,
    pool: &rayon::ThreadPool,
    message: &str,
    step: F,
) -> Result<Vec<String>>
where
    F: Fn(&mut family::SequenceFamily) -> error::Result<()> + Sync,
{
    let total = set.len().max(1);
    let done = AtomicUsize::new(0);
    let outcomes: Vec<Option<String>> = pool.install(|| {
        set.families_mut()
            .par_iter_mut()
            .map(|fam| {
                let result = step(fam);
                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                progress(message, 100.0 * finished as f64 / total as f64, &fam.id);
                match result {
                    Ok(()) => Ok(None),
                    Err(err @ (Error::ToolFailure { .. } | Error::EmptyInput(_))) => {
                        warn!("family {}: {err}", fam.id);
                        Ok(Some(fam.id.clone()))
                    }
                    Err(err) => Err(err),
                }
            })
            .collect::<error::Result<_>>()
    })?;
    Ok(outcomes.into_iter().flatten().collect())
}

// --------------------------------------------------
/// The fixed diagnostic progress line.
pub fn progress(message: &str, percent: f64, id: &str) {
    eprintln!("\t{message} {percent:.2} %   (processing:{id})");
}

fn report_failed(phase: &str, failed: &[String]) {
    if !failed.is_empty() {
        warn!(
            "{phase}: {} families failed: {}",
            failed.len(),
            failed.join(", ")
        );
    }
}

fn log_prune(operator: &str, report: &prune::PruneReport) {
    for id in &report.removed_families {
        info!("{operator}: removed family {id}");
    }
    for (id, members) in &report.removed_members {
        info!("{operator}: family {id} lost {}", members.join(", "));
    }
}

// --------------------------------------------------
/// Fold GO terms into the member descriptions.
fn annotate_members(set: &mut ClusterSet, table: &HashMap<String, Vec<formats::GoTerm>>) {
    for fam in set.iter_mut() {
        for member in fam.members().iter().map(|m| m.id.clone()).collect::<Vec<_>>() {
            let terms = match table.get(&member) {
                Some(t) if !t.is_empty() => t,
                _ => continue,
            };
            let text = terms
                .iter()
                .map(|t| match &t.description {
                    Some(desc) => format!("{} ({desc})", t.id),
                    None => t.id.clone(),
                })
                .collect::<Vec<_>>()
                .join("; ");
            if let Some(m) = fam.member_mut(&member) {
                m.description = Some(match &m.description {
                    Some(existing) => format!("{existing}; {text}"),
                    None => text,
                });
            }
        }
    }
}

// --------------------------------------------------
/// Group surviving trees by rooted topology, largest groups first.
fn write_topologies(set: &ClusterSet, path: &Path) -> Result<()> {
    let mut groups: Vec<(String, Vec<String>)> = vec![];
    for fam in set.iter() {
        let tree = match &fam.tree {
            Some(t) => t,
            None => continue,
        };
        let key = tree.topology_key();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, ids)) => ids.push(fam.id.clone()),
            None => groups.push((key, vec![fam.id.clone()])),
        }
    }
    groups.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
    let mut out = File::create(path)?;
    for (i, (key, ids)) in groups.iter().enumerate() {
        for id in ids {
            writeln!(out, "T{:03}\t{id}\t{key}", i + 1)?;
        }
    }
    Ok(())
}

// --------------------------------------------------
fn write_artifacts(set: &ClusterSet, path_dir: &Path) -> Result<()> {
    for fam in set.iter() {
        if let Some(aln) = &fam.alignment {
            let mut out = File::create(path_dir.join(format!("{}.aln", fam.id)))?;
            formats::write_clustalw(aln, &mut out)?;
        }
        if let Some(dist) = &fam.distance {
            let mut out = File::create(path_dir.join(format!("{}.dist", fam.id)))?;
            dist.write_phylip(&mut out)?;
        }
        if let Some(tree) = &fam.tree {
            let mut out = File::create(path_dir.join(format!("{}.nwk", fam.id)))?;
            writeln!(out, "{}", tree.to_newick())?;
        }
        if let Some(tree) = &fam.bootstrap {
            let mut out = File::create(path_dir.join(format!("{}-consensus.nwk", fam.id)))?;
            writeln!(out, "{}", tree.to_newick())?;
        }
    }
    Ok(())
}
