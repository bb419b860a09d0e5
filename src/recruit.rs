use crate::align::{revcomp, AlignedSeq, Member, Strand, GAP};
use crate::cluster::{filter_passes, read_tabular, BlastHit, FilterRule};
use crate::error::{Error, Result};
use crate::family::{ClusterSet, SequenceFamily};
use crate::formats;
use crate::tools::ToolRunner;
use log::{debug, warn};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

// --------------------------------------------------
#[derive(Debug, Clone)]
pub struct RecruitParams {
    /// FASTA behind the blast database; subject sequences load from here.
    pub db_fasta: String,
    pub program: String,
    pub extra_args: Vec<String>,
    /// Empty filter means keep only the best-scoring hit.
    pub filter: Vec<FilterRule>,
    /// Strain label to assign to recruited members.
    pub strain: Option<String>,
    /// Subject-id to description map for annotating recruits.
    pub deflines: HashMap<String, String>,
}

impl RecruitParams {
    pub fn new(db_fasta: impl Into<String>) -> Self {
        RecruitParams {
            db_fasta: db_fasta.into(),
            program: "blastn".to_string(),
            extra_args: vec![],
            filter: vec![],
            strain: None,
            deflines: HashMap::new(),
        }
    }
}

// --------------------------------------------------
/// Lazily-indexed database fasta: read once on first lookup, then
/// served from memory.
#[derive(Debug, Default)]
pub struct HomologDb {
    path: String,
    index: Option<HashMap<String, String>>,
}

impl HomologDb {
    pub fn new(path: impl Into<String>) -> Self {
        HomologDb {
            path: path.into(),
            index: None,
        }
    }

    pub fn sequence(&mut self, id: &str) -> Result<Option<&str>> {
        if self.index.is_none() {
            let mut map = HashMap::new();
            for (rec_id, seq) in formats::read_fasta(&self.path)? {
                map.insert(rec_id, seq);
            }
            debug!("indexed {} sequences from {}", map.len(), self.path);
            self.index = Some(map);
        }
        Ok(self.index.as_ref().unwrap().get(id).map(String::as_str))
    }
}

// --------------------------------------------------
#[derive(Debug, Clone, Default)]
pub struct RecruitReport {
    /// Per family, the members recruited into it.
    pub added: Vec<(String, Vec<String>)>,
    /// Families whose blast invocation failed; left unchanged.
    pub failed: Vec<String>,
}

// --------------------------------------------------
/// Recruit homologous sequences for every family: blast the alignment
/// consensus against an external database, keep filtered hits, and graft
/// each as a new member plus a padded alignment row.
pub fn recruit_for_set(
    set: &mut ClusterSet,
    params: &RecruitParams,
    runner: &ToolRunner,
    workdir: &Path,
) -> Result<RecruitReport> {
    let mut db = HomologDb::new(&params.db_fasta);
    let mut report = RecruitReport::default();
    for id in set.family_ids() {
        let hits = {
            let fam = set.get(&id).unwrap();
            if fam.alignment.is_none() {
                continue;
            }
            match blast_consensus(fam, params, runner, workdir) {
                Ok(hits) => hits,
                Err(err) if err.is_tool_failure() => {
                    warn!("family {id}: {err}");
                    report.failed.push(id);
                    continue;
                }
                Err(err) => return Err(err),
            }
        };
        let fam = set.get_mut(&id).unwrap();
        let mut added = vec![];
        for hit in choose_hits(hits, &params.filter) {
            if fam.contains(&hit.subject) {
                continue;
            }
            let subject_seq = match db.sequence(&hit.subject)? {
                Some(seq) => seq.to_string(),
                None => {
                    warn!(
                        "family {id}: subject {} not in {}",
                        hit.subject, params.db_fasta
                    );
                    continue;
                }
            };
            add_hit(fam, &hit, &subject_seq, params)?;
            added.push(hit.subject.clone());
        }
        for member in &added {
            set.index_member(member.clone(), id.clone());
            if let Some(strain) = &params.strain {
                set.strains.insert(member.clone(), strain.clone());
            }
        }
        if !added.is_empty() {
            report.added.push((id, added));
        }
    }
    Ok(report)
}

// --------------------------------------------------
fn blast_consensus(
    fam: &SequenceFamily,
    params: &RecruitParams,
    runner: &ToolRunner,
    workdir: &Path,
) -> Result<Vec<BlastHit>> {
    let aln = fam.alignment.as_ref().unwrap();
    let consensus = match &aln.consensus {
        Some(c) => c.clone(),
        None => aln.majority_consensus(),
    };
    if consensus.is_empty() {
        return Err(Error::empty(format!("family {}: empty consensus", fam.id)));
    }
    // Gap columns become N so hit coordinates stay alignment columns
    let query: String = consensus
        .chars()
        .map(|c| if c == GAP { 'N' } else { c })
        .collect();

    let dir = workdir.join(&fam.id);
    fs::create_dir_all(&dir)?;
    let query_file = dir.join("consensus.fa");
    let mut fh = File::create(&query_file)?;
    writeln!(fh, ">{}\n{}", fam.id, query)?;

    let mut args = vec![
        "-query".to_string(),
        query_file.display().to_string(),
        "-db".to_string(),
        params.db_fasta.clone(),
        "-outfmt".to_string(),
        "6".to_string(),
    ];
    args.extend(params.extra_args.iter().cloned());
    let output = runner.run(&params.program, &args, None, Some(&dir))?;
    read_tabular(output.stdout.as_bytes()).collect()
}

// --------------------------------------------------
/// With a filter, every passing hit is kept; without one, only the
/// best-scoring hit survives.
fn choose_hits(hits: Vec<BlastHit>, filter: &[FilterRule]) -> Vec<BlastHit> {
    if filter.is_empty() {
        let mut best: Option<BlastHit> = None;
        for hit in hits {
            if best
                .as_ref()
                .map_or(true, |b| hit.bit_score > b.bit_score)
            {
                best = Some(hit);
            }
        }
        best.into_iter().collect()
    } else {
        hits.into_iter()
            .filter(|hit| filter_passes(filter, hit))
            .collect()
    }
}

// --------------------------------------------------
/// Graft one hit onto the family: new member with the raw hit sequence,
/// new gap-padded alignment row occupying the hit's query window.
fn add_hit(
    fam: &mut SequenceFamily,
    hit: &BlastHit,
    subject_seq: &str,
    params: &RecruitParams,
) -> Result<()> {
    let (hit_seq, strand) = hit_sequence(subject_seq, hit.s_start, hit.s_end)?;
    let width = fam.alignment.as_ref().unwrap().width();
    let row = pad_hit_row(width, hit.q_start as usize, &hit_seq)?;

    let mut member = Member::with_seq(&hit.subject, hit_seq);
    member.description = params.deflines.get(&hit.subject).cloned();
    fam.add_member(member)?;
    fam.alignment
        .as_mut()
        .unwrap()
        .push_row(AlignedSeq::new(&hit.subject, row, strand))?;
    fam.invalidate_derived();
    Ok(())
}

// --------------------------------------------------
/// Slice the subject sequence by hit coordinates; descending
/// coordinates mean the minus strand, so the slice is
/// reverse-complemented.
fn hit_sequence(subject_seq: &str, s_start: u64, s_end: u64) -> Result<(String, Strand)> {
    let (lo, hi, strand) = if s_start <= s_end {
        (s_start as usize, s_end as usize, Strand::Forward)
    } else {
        (s_end as usize, s_start as usize, Strand::Reverse)
    };
    let chars: Vec<char> = subject_seq.chars().collect();
    if lo == 0 || hi > chars.len() {
        return Err(Error::input(format!(
            "hit coordinates {s_start}..{s_end} outside subject of length {}",
            chars.len()
        )));
    }
    let slice: String = chars[lo - 1..hi].iter().collect();
    Ok(match strand {
        Strand::Forward => (slice, Strand::Forward),
        Strand::Reverse => (revcomp(&slice), Strand::Reverse),
    })
}

// --------------------------------------------------
/// Pad the hit string to occupy `[q_start, q_start + len - 1]` of an
/// alignment `width` columns wide; hits running past the alignment are
/// cut at its width.
fn pad_hit_row(width: usize, q_start: usize, hit_seq: &str) -> Result<String> {
    if q_start == 0 {
        return Err(Error::input("hit query start must be 1-based"));
    }
    let mut row = String::new();
    for _ in 0..q_start - 1 {
        row.push(GAP);
    }
    row.push_str(hit_seq);
    let mut row: String = row.chars().take(width).collect();
    while row.chars().count() < width {
        row.push(GAP);
    }
    Ok(row)
}

// --------------------------------------------------
#[cfg(test)]
mod recruit_tests {
    use super::*;
    use crate::align::Alignment;
    use crate::error::Result;
    use pretty_assertions::assert_eq;

    fn hit(subject: &str, bit_score: f64, q_start: u64, s_start: u64, s_end: u64) -> BlastHit {
        BlastHit {
            query: "fam_001".to_string(),
            subject: subject.to_string(),
            pct_identity: 98.0,
            aln_length: s_end.abs_diff(s_start) + 1,
            mismatches: 0,
            gap_openings: 0,
            q_start,
            q_end: q_start + s_end.abs_diff(s_start),
            s_start,
            s_end,
            e_value: 1e-30,
            bit_score,
        }
    }

    #[test]
    fn test_choose_hits_best_score_without_filter() {
        let hits = vec![hit("s1", 100.0, 1, 1, 4), hit("s2", 250.0, 1, 1, 4)];
        let kept = choose_hits(hits, &[]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].subject, "s2");
    }

    #[test]
    fn test_hit_sequence_reverse_complements_descending() -> Result<()> {
        let (seq, strand) = hit_sequence("AAACGTTT", 3, 6)?;
        assert_eq!(seq, "ACGT");
        assert_eq!(strand, Strand::Forward);
        let (seq, strand) = hit_sequence("AAACGTTT", 6, 3)?;
        assert_eq!(seq, "ACGT");
        assert_eq!(strand, Strand::Reverse);
        assert!(hit_sequence("AAA", 1, 9).is_err());
        Ok(())
    }

    #[test]
    fn test_pad_hit_row() -> Result<()> {
        assert_eq!(pad_hit_row(10, 3, "ACGT")?, "--ACGT----");
        assert_eq!(pad_hit_row(5, 1, "ACGTACGT")?, "ACGTA");
        assert!(pad_hit_row(10, 0, "ACGT").is_err());
        Ok(())
    }

    #[test]
    fn test_add_hit_extends_family_and_alignment() -> Result<()> {
        let mut fam = SequenceFamily::new("fam_001");
        fam.add_member(Member::with_seq("a", "ACGTACGT"))?;
        fam.add_member(Member::with_seq("b", "ACGTACGA"))?;
        let mut aln = Alignment::new();
        aln.push_row(AlignedSeq::new("a", "ACGTACGT", Strand::Forward))?;
        aln.push_row(AlignedSeq::new("b", "ACGTACGA", Strand::Forward))?;
        fam.set_alignment(aln)?;

        let mut params = RecruitParams::new("db.fa");
        params
            .deflines
            .insert("s1".to_string(), "putative homolog".to_string());
        add_hit(&mut fam, &hit("s1", 200.0, 3, 1, 4), "CGTA", &params)?;

        assert_eq!(fam.len(), 3);
        let aln = fam.alignment.as_ref().unwrap();
        assert_eq!(aln.row("s1").unwrap().gapped, "--CGTA--");
        assert_eq!(
            fam.member("s1").unwrap().description.as_deref(),
            Some("putative homolog")
        );
        assert!(fam.distance.is_none());
        fam.check_consistency()?;
        Ok(())
    }
}
