use crate::align::{AlignedSeq, Alignment, Strand};
use crate::distance::DistanceMatrix;
use crate::error::{Error, Result};
use crate::family::SequenceFamily;
use crate::formats;
use crate::tree::Tree;
use log::debug;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

// --------------------------------------------------
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

/// Runs external binaries with captured stdout/stderr/exit status and a
/// wall-clock timeout. A timeout or non-zero exit becomes a ToolFailure
/// carrying all three, scoped to the family that triggered it.
#[derive(Debug, Clone, Default)]
pub struct ToolRunner {
    pub timeout: Option<Duration>,
}

// --------------------------------------------------
impl ToolRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        ToolRunner { timeout }
    }

    pub fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
        workdir: Option<&Path>,
    ) -> Result<ToolOutput> {
        debug!("running {program} {}", args.join(" "));
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(|e| Error::ToolFailure {
            tool: program.to_string(),
            message: format!("failed to start: {e}"),
            stdout: String::new(),
            stderr: String::new(),
            status: None,
        })?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                let input = input.to_string();
                thread::spawn(move || {
                    let _ = pipe.write_all(input.as_bytes());
                });
            }
        }
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_thread = thread::spawn(move || read_pipe(stdout_pipe));
        let stderr_thread = thread::spawn(move || read_pipe(stderr_pipe));

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if deadline.map_or(false, |d| Instant::now() >= d) {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(Error::ToolFailure {
                            tool: program.to_string(),
                            message: format!(
                                "timed out after {:.1}s",
                                self.timeout.unwrap_or_default().as_secs_f64()
                            ),
                            stdout: stdout_thread.join().unwrap_or_default(),
                            stderr: stderr_thread.join().unwrap_or_default(),
                            status: None,
                        });
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    return Err(Error::ToolFailure {
                        tool: program.to_string(),
                        message: format!("wait failed: {e}"),
                        stdout: String::new(),
                        stderr: String::new(),
                        status: None,
                    })
                }
            }
        };

        let stdout = stdout_thread.join().unwrap_or_default();
        let stderr = stderr_thread.join().unwrap_or_default();
        if !status.success() {
            return Err(Error::ToolFailure {
                tool: program.to_string(),
                message: "non-zero exit".to_string(),
                stdout,
                stderr,
                status: status.code(),
            });
        }
        Ok(ToolOutput {
            stdout,
            stderr,
            status: status.code().unwrap_or(0),
        })
    }
}

// --------------------------------------------------
fn read_pipe(pipe: Option<impl Read>) -> String {
    let mut out = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut out);
    }
    out
}

// --------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentProgram {
    ClustalW,
    Muscle,
    Mafft,
    Kalign,
    TCoffee,
}

impl AlignmentProgram {
    pub fn binary(&self) -> &'static str {
        match self {
            AlignmentProgram::ClustalW => "clustalw",
            AlignmentProgram::Muscle => "muscle",
            AlignmentProgram::Mafft => "mafft",
            AlignmentProgram::Kalign => "kalign",
            AlignmentProgram::TCoffee => "t_coffee",
        }
    }
}

impl FromStr for AlignmentProgram {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clustalw" => Ok(AlignmentProgram::ClustalW),
            "muscle" => Ok(AlignmentProgram::Muscle),
            "mafft" => Ok(AlignmentProgram::Mafft),
            "kalign" => Ok(AlignmentProgram::Kalign),
            "t_coffee" | "tcoffee" => Ok(AlignmentProgram::TCoffee),
            other => Err(Error::input(format!("unknown alignment program: {other}"))),
        }
    }
}

// --------------------------------------------------
/// Align a family's member sequences with an external program and
/// install the result. The family keeps its members; everything
/// downstream of the alignment is invalidated.
pub fn run_alignment(
    fam: &mut SequenceFamily,
    program: AlignmentProgram,
    extra_args: &[String],
    runner: &ToolRunner,
    workdir: &Path,
) -> Result<()> {
    if fam.len() < 2 {
        return Err(Error::empty(format!(
            "family {}: alignment requires at least two members",
            fam.id
        )));
    }
    let dir = family_dir(workdir, &fam.id)?;
    let infile = dir.join("members.fa");
    let mut fh = File::create(&infile)?;
    formats::write_member_fasta(fam, &mut fh)?;

    let outfile = dir.join(match program {
        AlignmentProgram::ClustalW => "members.aln",
        _ => "members.afa",
    });
    let mut args: Vec<String> = match program {
        AlignmentProgram::ClustalW => vec![
            format!("-INFILE={}", infile.display()),
            format!("-OUTFILE={}", outfile.display()),
            "-OUTPUT=CLUSTAL".to_string(),
        ],
        AlignmentProgram::Muscle => vec![
            "-in".to_string(),
            infile.display().to_string(),
            "-out".to_string(),
            outfile.display().to_string(),
        ],
        AlignmentProgram::Mafft => vec![infile.display().to_string()],
        AlignmentProgram::Kalign => vec![
            "-i".to_string(),
            infile.display().to_string(),
            "-o".to_string(),
            outfile.display().to_string(),
        ],
        AlignmentProgram::TCoffee => vec![
            infile.display().to_string(),
            "-output=fasta_aln".to_string(),
            format!("-outfile={}", outfile.display()),
        ],
    };
    args.extend(extra_args.iter().cloned());
    let output = runner.run(program.binary(), &args, None, Some(&dir))?;

    let mut aln = match program {
        AlignmentProgram::ClustalW => {
            formats::read_clustalw(&mut BufReader::new(File::open(&outfile)?))?
        }
        AlignmentProgram::Mafft => fasta_alignment_from_str(&output.stdout)?,
        _ => fasta_alignment_from_file(&outfile)?,
    };
    aln.source = Some(program.binary().to_string());
    fam.set_alignment(aln)?;
    Ok(())
}

// --------------------------------------------------
fn fasta_alignment_from_file(path: &Path) -> Result<Alignment> {
    let mut text = String::new();
    File::open(path)?.read_to_string(&mut text)?;
    fasta_alignment_from_str(&text)
}

fn fasta_alignment_from_str(text: &str) -> Result<Alignment> {
    let mut aln = Alignment::new();
    let mut id: Option<String> = None;
    let mut seq = String::new();
    for line in text.lines() {
        if let Some(head) = line.strip_prefix('>') {
            if let Some(prev) = id.take() {
                aln.push_row(AlignedSeq::new(&prev, seq.clone(), Strand::Forward))?;
            }
            seq.clear();
            id = Some(
                head.split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_string(),
            );
        } else {
            seq.push_str(line.trim());
        }
    }
    if let Some(prev) = id {
        aln.push_row(AlignedSeq::new(&prev, seq, Strand::Forward))?;
    }
    if aln.is_empty() {
        return Err(Error::input("aligner produced no sequences"));
    }
    Ok(aln)
}

// --------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistanceFunction {
    /// Observed pairwise differences straight off the alignment.
    Observed,
    /// An external phylip-style program, e.g. dnadist.
    Program(String),
}

impl FromStr for DistanceFunction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "observed" => Ok(DistanceFunction::Observed),
            other if !other.is_empty() => Ok(DistanceFunction::Program(other.to_string())),
            _ => Err(Error::input("empty distance function")),
        }
    }
}

// --------------------------------------------------
pub fn run_distance(
    fam: &mut SequenceFamily,
    function: &DistanceFunction,
    runner: &ToolRunner,
    workdir: &Path,
) -> Result<()> {
    let aln = fam
        .alignment
        .as_ref()
        .ok_or_else(|| Error::empty(format!("family {}: no alignment", fam.id)))?;
    let mat = match function {
        DistanceFunction::Observed => DistanceMatrix::from_alignment(aln)?,
        DistanceFunction::Program(program) => {
            let dir = family_dir(workdir, &fam.id)?;
            let infile = dir.join("infile");
            let mut fh = File::create(&infile)?;
            formats::write_phylip_alignment(aln, &mut fh)?;
            let _ = fs::remove_file(dir.join("outfile"));
            runner.run(program, &[], Some("Y\n"), Some(&dir))?;
            let mut mat =
                DistanceMatrix::read_phylip(&mut BufReader::new(File::open(dir.join("outfile"))?))?;
            restore_matrix_ids(&mut mat, &aln.member_ids())?;
            mat
        }
    };
    fam.distance = Some(mat);
    fam.tree = None;
    fam.bootstrap = None;
    Ok(())
}

// --------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeMethod {
    /// Neighbor joining via phylip neighbor.
    Neighbor,
    /// UPGMA via phylip neighbor.
    Upgma,
    /// Maximum likelihood from the alignment, e.g. phyml or dnaml.
    MaximumLikelihood(String),
}

impl FromStr for TreeMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nj" | "neighbor" => Ok(TreeMethod::Neighbor),
            "upgma" => Ok(TreeMethod::Upgma),
            "phyml" => Ok(TreeMethod::MaximumLikelihood("phyml".to_string())),
            "dnaml" => Ok(TreeMethod::MaximumLikelihood("dnaml".to_string())),
            other => Err(Error::input(format!("unknown tree method: {other}"))),
        }
    }
}

// --------------------------------------------------
pub fn run_tree(
    fam: &mut SequenceFamily,
    method: &TreeMethod,
    runner: &ToolRunner,
    workdir: &Path,
) -> Result<()> {
    let dir = family_dir(workdir, &fam.id)?;
    let ids = fam
        .alignment
        .as_ref()
        .map(Alignment::member_ids)
        .ok_or_else(|| Error::empty(format!("family {}: no alignment", fam.id)))?;

    let mut tree = match method {
        TreeMethod::Neighbor | TreeMethod::Upgma => {
            let mat = fam
                .distance
                .as_ref()
                .ok_or_else(|| Error::empty(format!("family {}: no distances", fam.id)))?;
            let infile = dir.join("infile");
            let mut fh = File::create(&infile)?;
            mat.write_phylip(&mut fh)?;
            let _ = fs::remove_file(dir.join("outfile"));
            let _ = fs::remove_file(dir.join("outtree"));
            let script = match method {
                TreeMethod::Upgma => "N\nY\n",
                _ => "Y\n",
            };
            runner.run("neighbor", &[], Some(script), Some(&dir))?;
            read_newick_file(&dir.join("outtree"))?
        }
        TreeMethod::MaximumLikelihood(program) if program.as_str() == "phyml" => {
            let infile = dir.join("infile");
            let mut fh = File::create(&infile)?;
            formats::write_phylip_alignment(fam.alignment.as_ref().unwrap(), &mut fh)?;
            let args = vec![
                "--input".to_string(),
                infile.display().to_string(),
                "--datatype".to_string(),
                "nt".to_string(),
                "--no_memory_check".to_string(),
            ];
            runner.run(program, &args, None, Some(&dir))?;
            read_newick_file(&dir.join("infile_phyml_tree.txt"))?
        }
        TreeMethod::MaximumLikelihood(program) => {
            let infile = dir.join("infile");
            let mut fh = File::create(&infile)?;
            formats::write_phylip_alignment(fam.alignment.as_ref().unwrap(), &mut fh)?;
            let _ = fs::remove_file(dir.join("outfile"));
            let _ = fs::remove_file(dir.join("outtree"));
            runner.run(program, &[], Some("Y\n"), Some(&dir))?;
            read_newick_file(&dir.join("outtree"))?
        }
    };
    restore_tree_ids(&mut tree, &ids)?;
    fam.tree = Some(tree);
    fam.bootstrap = None;
    Ok(())
}

// --------------------------------------------------
/// Bootstrap consensus: resample with seqboot, distance and tree per
/// replicate, then consense. The consensus tree's internal supports are
/// clade frequencies.
pub fn run_bootstrap(
    fam: &mut SequenceFamily,
    replicates: usize,
    runner: &ToolRunner,
    workdir: &Path,
) -> Result<()> {
    let aln = fam
        .alignment
        .as_ref()
        .ok_or_else(|| Error::empty(format!("family {}: no alignment", fam.id)))?;
    let ids = aln.member_ids();
    let dir = family_dir(workdir, &fam.id)?;

    let infile = dir.join("infile");
    let mut fh = File::create(&infile)?;
    formats::write_phylip_alignment(aln, &mut fh)?;

    // Odd seed per phylip convention; fixed for reproducibility
    let seed = 4333;
    step(&dir, runner, "seqboot", &format!("R\n{replicates}\nY\n{seed}\n"))?;
    step(&dir, runner, "dnadist", &format!("M\nD\n{replicates}\nY\n"))?;
    step(&dir, runner, "neighbor", &format!("M\n{replicates}\n{seed}\nY\n"))?;
    let _ = fs::remove_file(dir.join("outfile"));
    fs::rename(dir.join("outtree"), dir.join("intree"))?;
    runner.run("consense", &[], Some("Y\n"), Some(&dir))?;

    let mut tree = read_newick_file(&dir.join("outtree"))?;
    restore_tree_ids(&mut tree, &ids)?;
    fam.bootstrap = Some(tree);
    Ok(())
}

// --------------------------------------------------
/// One phylip stage: run it on `infile`, promote `outfile` to the next
/// stage's `infile`.
fn step(dir: &Path, runner: &ToolRunner, program: &str, script: &str) -> Result<()> {
    let _ = fs::remove_file(dir.join("outfile"));
    let _ = fs::remove_file(dir.join("outtree"));
    runner.run(program, &[], Some(script), Some(dir))?;
    if dir.join("outfile").exists() {
        fs::rename(dir.join("outfile"), dir.join("infile"))?;
    }
    Ok(())
}

// --------------------------------------------------
fn read_newick_file(path: &Path) -> Result<Tree> {
    let mut text = String::new();
    File::open(path)
        .map_err(|e| Error::input(format!("{}: {e}", path.display())))?
        .read_to_string(&mut text)?;
    Tree::from_newick(&text)
}

// --------------------------------------------------
fn family_dir(workdir: &Path, family_id: &str) -> Result<PathBuf> {
    let dir = workdir.join(family_id);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

// --------------------------------------------------
/// Undo phylip's ten-character name truncation against the known full
/// ids. Ambiguous or unknown truncations are a consistency error.
fn match_truncated<'a>(full_ids: &'a [String], truncated: &str) -> Result<&'a str> {
    let want = truncated.trim();
    let mut hits = full_ids
        .iter()
        .filter(|id| id.chars().take(10).collect::<String>().trim() == want);
    match (hits.next(), hits.next()) {
        (Some(id), None) => Ok(id),
        (Some(_), Some(_)) => Err(Error::consistency(format!(
            "truncated name {want} matches several members"
        ))),
        _ => Err(Error::consistency(format!(
            "truncated name {want} matches no member"
        ))),
    }
}

fn restore_tree_ids(tree: &mut Tree, full_ids: &[String]) -> Result<()> {
    for label in tree.leaf_labels() {
        let full = match_truncated(full_ids, &label)?.to_string();
        if full != label {
            tree.rename_leaf(&label, &full);
        }
    }
    Ok(())
}

fn restore_matrix_ids(mat: &mut DistanceMatrix, full_ids: &[String]) -> Result<()> {
    for label in mat.labels().to_vec() {
        let full = match_truncated(full_ids, &label)?.to_string();
        if full != label {
            mat.rename(&label, &full)?;
        }
    }
    Ok(())
}

// --------------------------------------------------
#[cfg(test)]
mod tools_tests {
    use super::*;
    use crate::error::Result;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_run_captures_stdout() -> Result<()> {
        let runner = ToolRunner::default();
        let out = runner.run(
            "sh",
            &["-c".to_string(), "echo out; echo err >&2".to_string()],
            None,
            None,
        )?;
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.status, 0);
        Ok(())
    }

    #[test]
    fn test_run_surfaces_failure() {
        let runner = ToolRunner::default();
        let err = runner
            .run(
                "sh",
                &["-c".to_string(), "echo boom >&2; exit 3".to_string()],
                None,
                None,
            )
            .unwrap_err();
        match err {
            Error::ToolFailure { stderr, status, .. } => {
                assert_eq!(stderr, "boom\n");
                assert_eq!(status, Some(3));
            }
            other => panic!("expected ToolFailure, got {other:?}"),
        }
    }

    #[test]
    fn test_run_times_out() {
        let runner = ToolRunner::new(Some(Duration::from_millis(100)));
        let err = runner
            .run("sh", &["-c".to_string(), "sleep 5".to_string()], None, None)
            .unwrap_err();
        assert!(err.is_tool_failure());
    }

    #[test]
    fn test_run_feeds_stdin() -> Result<()> {
        let runner = ToolRunner::default();
        let out = runner.run("cat", &[], Some("hello\n"), None)?;
        assert_eq!(out.stdout, "hello\n");
        Ok(())
    }

    #[test]
    fn test_match_truncated() -> Result<()> {
        let ids = vec![
            "short".to_string(),
            "a_very_long_member_id".to_string(),
            "a_very_lonely_id".to_string(),
        ];
        assert_eq!(match_truncated(&ids, "short")?, "short");
        // Both long ids truncate to "a_very_lon"
        assert!(match_truncated(&ids, "a_very_lon").is_err());
        assert!(match_truncated(&ids, "missing").is_err());
        Ok(())
    }

    #[test]
    fn test_fasta_alignment_from_str() -> Result<()> {
        let aln = fasta_alignment_from_str(">a desc\nAC-GT\n>b\nACGGT\n")?;
        assert_eq!(aln.num_sequences(), 2);
        assert_eq!(aln.rows()[0].id, "a");
        assert_eq!(aln.rows()[0].gapped, "AC-GT");
        Ok(())
    }
}
