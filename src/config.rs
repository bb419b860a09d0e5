use crate::cluster::FilterRule;
use crate::error::{Error, Result};
use crate::overlap::{ScoreMethod, SeedExtendParams};
use crate::prune::{OverlapPruneArgs, StrainPruneArgs};
use crate::reroot::RerootMode;
use crate::tools::{AlignmentProgram, DistanceFunction, TreeMethod};
use regex::Regex;
use std::io::BufRead;
use std::str::FromStr;

// --------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Blast,
    Ace,
}

impl FromStr for DataSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blast" => Ok(DataSource::Blast),
            "ace" | "assembly" => Ok(DataSource::Ace),
            other => Err(Error::input(format!("unknown cluster datasource: {other}"))),
        }
    }
}

// --------------------------------------------------
#[derive(Debug, Clone, Default)]
pub struct GlobalConfig {
    pub cluster_datasource: Option<DataSource>,
    pub cluster_filename: Option<String>,
    pub cluster_values: Vec<FilterRule>,
    pub fast_blast_parser: bool,
    pub memberseq_filename: Option<String>,
    pub memberstrain_filename: Option<String>,
}

/// What RUN_TREE_ARGUMENTS may carry.
#[derive(Debug, Clone, Default)]
pub struct TreeArgs {
    pub reroot: Option<RerootMode>,
}

/// One processing path: the chain of per-family steps to run, in the
/// order the pipeline applies them.
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    pub id: usize,
    pub name: Option<String>,
    pub alignment_program: Option<AlignmentProgram>,
    pub alignment_arguments: Vec<String>,
    pub distance_function: Option<DistanceFunction>,
    pub prune_strains: Option<StrainPruneArgs>,
    pub prune_overlaps: Option<OverlapPruneArgs>,
    pub tree_method: Option<TreeMethod>,
    pub tree_arguments: TreeArgs,
    pub bootstrap_replicates: Option<usize>,
    pub bootstrap_cutoff: Option<f64>,
    pub topoanalysis: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub global: GlobalConfig,
    pub paths: Vec<PathConfig>,
}

// --------------------------------------------------
impl Config {
    /// Parse the key-bracket-value grammar: `<N>KEY: [value]` lines,
    /// grouped by path id `N`; keys without a path prefix are global.
    /// Unknown keys are rejected.
    pub fn read(input: &mut impl BufRead) -> Result<Config> {
        let line_re = Regex::new(r"^(?:<(\d+)>)?([A-Z_]+):\s*\[(.*)\]\s*$").unwrap();
        let mut config = Config::default();

        for (lineno, line) in input.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let caps = line_re.captures(trimmed).ok_or_else(|| {
                Error::input(format!("config line {}: not <N>KEY: [value]", lineno + 1))
            })?;
            let path_id = caps.get(1).map(|m| m.as_str().parse::<usize>().unwrap());
            let key = caps.get(2).unwrap().as_str();
            let value = caps.get(3).unwrap().as_str().trim();

            match path_id {
                None => config.global_key(key, value).map_err(|e| at_line(lineno, e))?,
                Some(id) => {
                    let path = config.path_mut(id);
                    path_key(path, key, value).map_err(|e| at_line(lineno, e))?;
                }
            }
        }
        config.paths.sort_by_key(|p| p.id);
        Ok(config)
    }

    fn path_mut(&mut self, id: usize) -> &mut PathConfig {
        if let Some(pos) = self.paths.iter().position(|p| p.id == id) {
            return &mut self.paths[pos];
        }
        self.paths.push(PathConfig {
            id,
            ..Default::default()
        });
        self.paths.last_mut().unwrap()
    }

    fn global_key(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "CLUSTER_DATASOURCE" => self.global.cluster_datasource = Some(value.parse()?),
            "CLUSTER_FILENAME" => self.global.cluster_filename = Some(value.to_string()),
            "CLUSTER_VALUES" => self.global.cluster_values = parse_filter_values(value)?,
            "FASTBLASTPARSER" => self.global.fast_blast_parser = parse_flag(value)?,
            "MEMBERSEQ_FILENAME" => self.global.memberseq_filename = Some(value.to_string()),
            "MEMBERSTRAIN_FILENAME" => {
                self.global.memberstrain_filename = Some(value.to_string())
            }
            other => return Err(Error::input(format!("unknown global key: {other}"))),
        }
        Ok(())
    }
}

// --------------------------------------------------
fn path_key(path: &mut PathConfig, key: &str, value: &str) -> Result<()> {
    match key {
        "PATH_NAME" => path.name = Some(value.to_string()),
        "RUN_ALIGNMENT_PROGRAM" => path.alignment_program = Some(value.parse()?),
        "RUN_ALIGNMENT_ARGUMENTS" => {
            path.alignment_arguments = value.split_whitespace().map(String::from).collect()
        }
        "RUN_DISTANCE_FUNCTION" => path.distance_function = Some(value.parse()?),
        "PRUNE_STRAINS_ARGUMENTS" => path.prune_strains = Some(parse_strain_args(value)?),
        "PRUNE_OVERLAPS_ARGUMENTS" => path.prune_overlaps = Some(parse_overlap_args(value)?),
        "RUN_TREE_METHOD" => path.tree_method = Some(value.parse()?),
        "RUN_TREE_ARGUMENTS" => path.tree_arguments = parse_tree_args(value)?,
        "RUN_BOOTSTRAPPING" => {
            let n: usize = value.parse().map_err(|_| {
                Error::input(format!("RUN_BOOTSTRAPPING wants a replicate count: {value}"))
            })?;
            path.bootstrap_replicates = (n > 0).then_some(n);
        }
        "FILTER_BOOTSTRAPPING" => {
            let cutoff: f64 = value.parse().map_err(|_| {
                Error::input(format!("FILTER_BOOTSTRAPPING wants a support cutoff: {value}"))
            })?;
            path.bootstrap_cutoff = Some(cutoff);
        }
        "RUN_TOPOANALYSIS" => path.topoanalysis = parse_flag(value)?,
        other => return Err(Error::input(format!("unknown path key: {other}"))),
    }
    Ok(())
}

// --------------------------------------------------
/// Sub-key lists come in two shapes: `k1 => v1; k2 => v2` or
/// `k1 = v1, k2 = v2`.
pub fn parse_subkeys(value: &str) -> Result<Vec<(String, String)>> {
    let sep = if value.contains(';') { ';' } else { ',' };
    let mut out = vec![];
    for entry in value.split(sep) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (key, val) = entry
            .split_once("=>")
            .or_else(|| entry.split_once('='))
            .ok_or_else(|| Error::input(format!("sub-key entry without => or =: {entry}")))?;
        out.push((key.trim().to_string(), val.trim().to_string()));
    }
    Ok(out)
}

// --------------------------------------------------
/// CLUSTER_VALUES entries: `field => 90` (comparator defaults to >=)
/// or `field => > 90` with an explicit comparator prefix.
pub fn parse_filter_values(value: &str) -> Result<Vec<FilterRule>> {
    parse_subkeys(value)?
        .into_iter()
        .map(|(field, val)| {
            let (op, num) = split_comparator(&val);
            FilterRule::parse(&field, op, num)
        })
        .collect()
}

fn split_comparator(value: &str) -> (&str, &str) {
    let value = value.trim();
    for op in ["<=", ">=", "==", "<", ">"] {
        if let Some(rest) = value.strip_prefix(op) {
            return (op, rest.trim());
        }
    }
    (">=", value)
}

// --------------------------------------------------
/// `A => 1; B => 1; min_distance => A:B A:C` — plain keys are strain
/// counts; the distance keys hold space-separated strain pairs.
fn parse_strain_args(value: &str) -> Result<StrainPruneArgs> {
    let mut args = StrainPruneArgs::default();
    for (key, val) in parse_subkeys(value)? {
        match key.as_str() {
            "min_distance" => args.min_distance = parse_strain_pairs(&val)?,
            "max_distance" => args.max_distance = parse_strain_pairs(&val)?,
            strain => {
                let count: usize = val.parse().map_err(|_| {
                    Error::input(format!("strain count for {strain} is not an integer: {val}"))
                })?;
                args.composition.push((strain.to_string(), count));
            }
        }
    }
    if args.composition.is_empty() {
        return Err(Error::input("PRUNE_STRAINS_ARGUMENTS without a composition"));
    }
    Ok(args)
}

fn parse_strain_pairs(value: &str) -> Result<Vec<(String, String)>> {
    value
        .split_whitespace()
        .map(|token| {
            token
                .split_once(':')
                .map(|(a, b)| (a.trim().to_string(), b.trim().to_string()))
                .ok_or_else(|| {
                    Error::input(format!("strain pair must be <A>:<B>, got {token}"))
                })
        })
        .collect()
}

// --------------------------------------------------
fn parse_overlap_args(value: &str) -> Result<OverlapPruneArgs> {
    let mut args = OverlapPruneArgs::default();
    let mut seed = SeedExtendParams::default();
    for (key, val) in parse_subkeys(value)? {
        match key.as_str() {
            "evalseed" => {
                seed.evalseed = val.parse().map_err(|_| {
                    Error::input(format!("evalseed is not an integer: {val}"))
                })?
            }
            "min_length" => {
                seed.min_length = Some(val.parse().map_err(|_| {
                    Error::input(format!("min_length is not an integer: {val}"))
                })?)
            }
            "min_identity" => {
                seed.min_identity = Some(val.parse().map_err(|_| {
                    Error::input(format!("min_identity is not a number: {val}"))
                })?)
            }
            "method" => seed.method = val.parse::<ScoreMethod>()?,
            "trim" => args.trim = parse_flag(&val)?,
            "compact" => args.compact = parse_flag(&val)?,
            strain => {
                let count: usize = val.parse().map_err(|_| {
                    Error::input(format!("strain count for {strain} is not an integer: {val}"))
                })?;
                args.composition.push((strain.to_string(), count));
            }
        }
    }
    if args.composition.is_empty() {
        return Err(Error::input("PRUNE_OVERLAPS_ARGUMENTS without a composition"));
    }
    args.seed = seed;
    Ok(args)
}

// --------------------------------------------------
/// `root => midpoint|longest` or `outgroup_strain => <strain>`; the two
/// are mutually exclusive because an outgroup names its own root.
fn parse_tree_args(value: &str) -> Result<TreeArgs> {
    let mut args = TreeArgs::default();
    let mut outgroup: Option<String> = None;
    let mut root: Option<String> = None;
    for (key, val) in parse_subkeys(value)? {
        match key.as_str() {
            "root" => root = Some(val),
            "outgroup_strain" => outgroup = Some(val),
            other => {
                return Err(Error::input(format!("unknown tree argument: {other}")))
            }
        }
    }
    args.reroot = match (root.as_deref(), outgroup) {
        (Some(_), Some(_)) => {
            return Err(Error::argument(
                "outgroup_strain cannot be combined with an explicit root mode",
            ))
        }
        (Some("midpoint"), None) => Some(RerootMode::Midpoint),
        (Some("longest"), None) => Some(RerootMode::LongestMember),
        (Some(other), None) => {
            return Err(Error::input(format!("unknown root mode: {other}")))
        }
        (None, Some(strain)) => Some(RerootMode::ReferenceStrain(strain)),
        (None, None) => None,
    };
    Ok(args)
}

// --------------------------------------------------
fn parse_flag(value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        other => Err(Error::input(format!("expected a boolean flag, got {other}"))),
    }
}

fn at_line(lineno: usize, err: Error) -> Error {
    match err {
        Error::Argument(msg) => Error::argument(format!("config line {}: {msg}", lineno + 1)),
        other => Error::input(format!("config line {}: {other}", lineno + 1)),
    }
}

// --------------------------------------------------
#[cfg(test)]
mod config_tests {
    use super::*;
    use crate::cluster::{BlastField, Comparator};
    use crate::error::Result;
    use pretty_assertions::assert_eq;

    const CONF: &str = "\
# famtree run configuration
CLUSTER_DATASOURCE: [blast]
CLUSTER_FILENAME: [all-vs-all.tsv]
CLUSTER_VALUES: [percentage_identity => 90; alignment_length => > 60]
FASTBLASTPARSER: [1]
MEMBERSEQ_FILENAME: [members.fa]
MEMBERSTRAIN_FILENAME: [strains.tsv]

<1>PATH_NAME: [default]
<1>RUN_ALIGNMENT_PROGRAM: [muscle]
<1>RUN_ALIGNMENT_ARGUMENTS: [-maxiters 2]
<1>RUN_DISTANCE_FUNCTION: [observed]
<1>PRUNE_STRAINS_ARGUMENTS: [A => 1; B => 1; min_distance => A:B]
<1>RUN_TREE_METHOD: [nj]
<1>RUN_TREE_ARGUMENTS: [root => midpoint]
<1>RUN_BOOTSTRAPPING: [100]
<1>FILTER_BOOTSTRAPPING: [60]
<2>PATH_NAME: [overlap path]
<2>PRUNE_OVERLAPS_ARGUMENTS: [A = 1, B = 1, evalseed = 3, trim = 1]
<2>RUN_TOPOANALYSIS: [1]
";

    #[test]
    fn test_read_full_config() -> Result<()> {
        let config = Config::read(&mut CONF.as_bytes())?;
        assert_eq!(config.global.cluster_datasource, Some(DataSource::Blast));
        assert!(config.global.fast_blast_parser);
        assert_eq!(config.global.cluster_values.len(), 2);
        assert_eq!(config.global.cluster_values[0].field, BlastField::PctIdentity);
        assert_eq!(config.global.cluster_values[0].op, Comparator::Ge);
        assert_eq!(config.global.cluster_values[1].op, Comparator::Gt);

        assert_eq!(config.paths.len(), 2);
        let p1 = &config.paths[0];
        assert_eq!(p1.name.as_deref(), Some("default"));
        assert_eq!(p1.alignment_arguments, vec!["-maxiters", "2"]);
        assert_eq!(p1.bootstrap_replicates, Some(100));
        assert_eq!(p1.bootstrap_cutoff, Some(60.0));
        assert_eq!(p1.tree_arguments.reroot, Some(RerootMode::Midpoint));
        let strains = p1.prune_strains.as_ref().unwrap();
        assert_eq!(strains.min_distance, vec![("A".to_string(), "B".to_string())]);

        let p2 = &config.paths[1];
        let overlaps = p2.prune_overlaps.as_ref().unwrap();
        assert_eq!(overlaps.seed.evalseed, 3);
        assert!(overlaps.trim);
        assert!(p2.topoanalysis);
        Ok(())
    }

    #[test]
    fn test_unknown_key_rejected() {
        let conf = "NO_SUCH_KEY: [1]\n";
        assert!(Config::read(&mut conf.as_bytes()).is_err());
        let conf = "<1>NO_SUCH_KEY: [1]\n";
        assert!(Config::read(&mut conf.as_bytes()).is_err());
    }

    #[test]
    fn test_outgroup_conflicts_with_root_mode() {
        let conf = "<1>RUN_TREE_ARGUMENTS: [root => midpoint; outgroup_strain => S]\n";
        assert!(Config::read(&mut conf.as_bytes()).is_err());
    }

    #[test]
    fn test_malformed_line_rejected() {
        let conf = "CLUSTER_FILENAME no-brackets\n";
        assert!(Config::read(&mut conf.as_bytes()).is_err());
    }
}
