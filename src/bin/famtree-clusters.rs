use anyhow::Result;
use clap::Parser;
use famtree::cluster;
use famtree::config::parse_filter_values;
use famtree::formats;
use std::fs::File;
use std::io::{self, Write};

/// Cluster a tabular blast report into a membership table
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Tabular blast report
    #[arg(value_name = "BLAST")]
    pub blast: String,

    /// Cluster filter, e.g. "percentage_identity => 90; alignment_length => 60"
    #[arg(long, value_name = "VALUES")]
    pub cluster_values: Option<String>,

    /// Stop admitting members once a cluster reaches this size
    #[arg(long, value_name = "MAX")]
    pub max_cluster_members: Option<usize>,

    /// Root name for renumbered families
    #[arg(long, value_name = "NAME", default_value = "famtree")]
    pub rootname: String,

    /// Output filename
    #[arg(short, long, value_name = "OUTPUT", default_value = "-")]
    pub output: String,
}

// --------------------------------------------------
fn main() {
    if let Err(e) = run(Args::parse()) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

// --------------------------------------------------
pub fn run(args: Args) -> Result<()> {
    let filter = match &args.cluster_values {
        Some(values) => parse_filter_values(values)?,
        None => vec![],
    };
    let set = cluster::cluster_tabular(
        formats::open(&args.blast)?,
        &args.rootname,
        filter,
        args.max_cluster_members,
    )?;

    let mut output: Box<dyn Write> = match args.output.as_str() {
        "-" => Box::new(io::stdout()),
        out_name => Box::new(File::create(out_name)?),
    };
    formats::write_membership(&set, &mut output)?;
    Ok(())
}
