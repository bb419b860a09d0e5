use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;
use std::ffi::OsStr;
use std::fs;
use tempfile::tempdir;
use walkdir::WalkDir;

const PRG: &str = "famtree";
const BLAST: &str = "tests/inputs/blast.tsv";
const FILTER: &str = "percentage_identity => > 75; alignment_length => > 60";

// --------------------------------------------------
#[test]
fn usage() -> Result<()> {
    for flag in &["-h", "--help"] {
        Command::cargo_bin(PRG)?
            .arg(flag)
            .assert()
            .stdout(predicate::str::contains("Usage"));
    }
    Ok(())
}

// --------------------------------------------------
#[test]
fn fast_blast_clustering() -> Result<()> {
    let outdir = tempdir()?;
    let outpath = outdir.path().to_string_lossy().to_string();
    Command::cargo_bin(PRG)?
        .args([
            "--blast",
            BLAST,
            "--fast-blast-parser",
            "--cluster-values",
            FILTER,
            "--seqs",
            "tests/inputs/members.fa",
            "--strains",
            "tests/inputs/strains.tsv",
            "--outdir",
            &outpath,
        ])
        .assert()
        .success();

    // The membership table lands in the output directory
    let wanted = OsStr::new("famtree-clusters.tsv");
    let files: Vec<_> = WalkDir::new(outdir.path())
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == wanted)
        .collect();
    assert_eq!(files.len(), 1);

    // Families are renumbered by descending size
    let table = fs::read_to_string(files[0].path())?;
    let expected = "famtree_001\tq2\n\
                    famtree_001\ts3\n\
                    famtree_001\ts4\n\
                    famtree_002\tq1\n\
                    famtree_002\ts1\n\
                    famtree_003\tx1\n";
    assert_eq!(table, expected);
    Ok(())
}

// --------------------------------------------------
#[test]
fn clustering_from_config_file() -> Result<()> {
    let outdir = tempdir()?;
    let outpath = outdir.path().to_string_lossy().to_string();
    Command::cargo_bin(PRG)?
        .args(["--config", "tests/inputs/famtree.conf", "--outdir", &outpath])
        .assert()
        .success();

    let table = fs::read_to_string(outdir.path().join("famtree-clusters.tsv"))?;
    assert!(table.contains("famtree_002\ts1"));
    assert!(!table.contains("s2"), "filtered hit must stay out");
    Ok(())
}

// --------------------------------------------------
#[test]
fn ace_ingest() -> Result<()> {
    let outdir = tempdir()?;
    let outpath = outdir.path().to_string_lossy().to_string();
    Command::cargo_bin(PRG)?
        .args(["--ace", "tests/inputs/assembly.ace", "--outdir", &outpath])
        .assert()
        .success();

    let table = fs::read_to_string(outdir.path().join("famtree-clusters.tsv"))?;
    assert_eq!(table, "Contig1\tread1\nContig1\tread2\n");
    Ok(())
}

// --------------------------------------------------
#[test]
fn fast_parser_without_blast_fails() -> Result<()> {
    Command::cargo_bin(PRG)?
        .args(["--fast-blast-parser", "--ace", "tests/inputs/assembly.ace"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("argument error"));
    Ok(())
}

// --------------------------------------------------
#[test]
fn clusters_bin_writes_membership() -> Result<()> {
    Command::cargo_bin("famtree-clusters")?
        .args([BLAST, "--cluster-values", FILTER])
        .assert()
        .success()
        .stdout(predicate::str::contains("famtree_001\tq2"))
        .stdout(
            predicate::str::contains("famtree_002\ts1")
                .and(predicate::str::contains("s2").not()),
        );
    Ok(())
}
