use crate::align::{pair_identity, Alignment};
use crate::error::{Error, Result};
use crate::family::{Composition, StrainTable};
use std::str::FromStr;

// --------------------------------------------------
/// Overlap geometry for one unordered row pair: the intersection of the
/// two `[start, end]` extents, its length, and the percent identity on
/// that slice. All zero when the pair does not overlap.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Overlap {
    pub start: usize,
    pub end: usize,
    pub length: usize,
    pub identity: f64,
}

// --------------------------------------------------
/// How to rank overlaps: plain length, or length weighted by squared
/// fractional identity, which penalises short high-identity pairs and
/// long low-identity pairs symmetrically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreMethod {
    #[default]
    Length,
    LengthIdentity,
}

impl ScoreMethod {
    pub fn score(&self, length: usize, identity: f64) -> f64 {
        match self {
            ScoreMethod::Length => length as f64,
            ScoreMethod::LengthIdentity => length as f64 * (identity / 100.0).powi(2),
        }
    }
}

impl FromStr for ScoreMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "length" | "overlap" => Ok(ScoreMethod::Length),
            "score" | "overlap_score" => Ok(ScoreMethod::LengthIdentity),
            other => Err(Error::input(format!("unknown overlap score method: {other}"))),
        }
    }
}

// --------------------------------------------------
/// Symmetric per-alignment overlap matrix; diagonal entries are zero.
#[derive(Debug, Clone)]
pub struct OverlapMatrix {
    ids: Vec<String>,
    entries: Vec<Overlap>,
}

// --------------------------------------------------
impl OverlapMatrix {
    pub fn compute(aln: &Alignment) -> Self {
        let rows = aln.rows();
        let n = rows.len();
        let mut entries = vec![Overlap::default(); n * n];
        for i in 0..n {
            for j in (i + 1)..n {
                let ov = match intersect(
                    (rows[i].start, rows[i].end),
                    (rows[j].start, rows[j].end),
                ) {
                    Some((start, end)) => {
                        let identity =
                            pair_identity(&rows[i].gapped, &rows[j].gapped, start, end);
                        Overlap {
                            start,
                            end,
                            length: end - start + 1,
                            identity,
                        }
                    }
                    None => Overlap::default(),
                };
                entries[i * n + j] = ov;
                entries[j * n + i] = ov;
            }
        }
        OverlapMatrix {
            ids: aln.member_ids(),
            entries,
        }
    }

    pub fn dim(&self) -> usize {
        self.ids.len()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn get(&self, i: usize, j: usize) -> Overlap {
        self.entries[i * self.dim() + j]
    }

    /// Best overlapping pair under the method; deterministic on ties
    /// (first in row-major order), so re-running returns the same pair.
    pub fn best_pair(&self, method: ScoreMethod) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..self.dim() {
            for j in (i + 1)..self.dim() {
                let ov = self.get(i, j);
                if ov.length == 0 {
                    continue;
                }
                let score = method.score(ov.length, ov.identity);
                if best.map_or(true, |(_, _, s)| score > s) {
                    best = Some((i, j, score));
                }
            }
        }
        best.map(|(i, j, _)| (i, j))
    }
}

// --------------------------------------------------
pub fn intersect(a: (usize, usize), b: (usize, usize)) -> Option<(usize, usize)> {
    if a.0 == 0 || b.0 == 0 {
        return None;
    }
    let start = a.0.max(b.0);
    let end = a.1.min(b.1);
    if start <= end {
        Some((start, end))
    } else {
        None
    }
}

// --------------------------------------------------
#[derive(Debug, Clone)]
pub struct SeedExtendParams {
    pub method: ScoreMethod,
    /// How many of the top-ranked seed pairs to evaluate.
    pub evalseed: usize,
    pub min_length: Option<usize>,
    pub min_identity: Option<f64>,
}

impl Default for SeedExtendParams {
    fn default() -> Self {
        SeedExtendParams {
            method: ScoreMethod::Length,
            evalseed: 5,
            min_length: None,
            min_identity: None,
        }
    }
}

/// A jointly-overlapping submember set produced by seed extension.
#[derive(Debug, Clone)]
pub struct Selection {
    pub ids: Vec<String>,
    pub window: (usize, usize),
    pub score: f64,
}

// --------------------------------------------------
/// Seed-and-extend: start from a high-scoring pair, grow the selected
/// set by the candidate whose inclusion scores best on the intersected
/// window, until the composition is met. Over all evaluated seeds the
/// best-scoring satisfied selection wins.
pub fn seed_and_extend(
    aln: &Alignment,
    strains: &StrainTable,
    composition: &[(String, usize)],
    params: &SeedExtendParams,
) -> Option<Selection> {
    let rows = aln.rows();
    if rows.len() < 2 {
        return None;
    }
    let matrix = OverlapMatrix::compute(aln);

    let mut seeds: Vec<(usize, usize, f64)> = vec![];
    for i in 0..rows.len() {
        for j in (i + 1)..rows.len() {
            let ov = matrix.get(i, j);
            if ov.length == 0 {
                continue;
            }
            if params.min_length.map_or(false, |min| ov.length < min) {
                continue;
            }
            if params.min_identity.map_or(false, |min| ov.identity < min) {
                continue;
            }
            seeds.push((i, j, params.method.score(ov.length, ov.identity)));
        }
    }
    seeds.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
    seeds.truncate(params.evalseed);

    let mut best: Option<Selection> = None;
    for &(si, sj, _) in &seeds {
        let mut comp = Composition::new(composition);
        comp.push(&rows[si].id, strains.strain_of(&rows[si].id));
        comp.push(&rows[sj].id, strains.strain_of(&rows[sj].id));

        let mut selected = vec![si, sj];
        let seed_ov = matrix.get(si, sj);
        let mut window = (seed_ov.start, seed_ov.end);
        let mut candidates: Vec<usize> =
            (0..rows.len()).filter(|k| *k != si && *k != sj).collect();

        while !comp.is_satisfied() && !candidates.is_empty() {
            // Overseed score: what each candidate would score on the
            // intersected window
            let mut ranked: Option<(usize, (usize, usize), f64)> = None;
            for &c in &candidates {
                let win = match intersect(window, (rows[c].start, rows[c].end)) {
                    Some(w) => w,
                    None => continue,
                };
                let identity = selected
                    .iter()
                    .map(|&s| pair_identity(&rows[c].gapped, &rows[s].gapped, win.0, win.1))
                    .sum::<f64>()
                    / selected.len() as f64;
                let score = params.method.score(win.1 - win.0 + 1, identity);
                if ranked.map_or(true, |(_, _, s)| score > s) {
                    ranked = Some((c, win, score));
                }
            }
            let (c, win, _) = match ranked {
                Some(r) => r,
                None => break,
            };
            candidates.retain(|&k| k != c);
            if comp.push(&rows[c].id, strains.strain_of(&rows[c].id)) {
                selected.push(c);
                window = win;
            }
        }

        if !comp.is_satisfied() {
            continue;
        }
        // Global overlap across all selected rows
        let global = selected
            .iter()
            .map(|&k| (rows[k].start, rows[k].end))
            .try_fold((1usize, usize::MAX), |acc, ext| intersect(acc, ext));
        let (start, end) = match global {
            Some(w) => w,
            None => continue,
        };
        let score = sub_alignment_score(aln, &selected, (start, end), params.method);
        let candidate = Selection {
            ids: selected.iter().map(|&k| rows[k].id.clone()).collect(),
            window: (start, end),
            score,
        };
        if best.as_ref().map_or(true, |b| candidate.score > b.score) {
            best = Some(candidate);
        }
    }
    best
}

// --------------------------------------------------
/// Score of the pruned sub-alignment: window length with the mean
/// pairwise identity of the selected rows over that window.
fn sub_alignment_score(
    aln: &Alignment,
    selected: &[usize],
    window: (usize, usize),
    method: ScoreMethod,
) -> f64 {
    let rows = aln.rows();
    let mut total = 0.0;
    let mut pairs = 0usize;
    for (a, &i) in selected.iter().enumerate() {
        for &j in &selected[a + 1..] {
            total += pair_identity(&rows[i].gapped, &rows[j].gapped, window.0, window.1);
            pairs += 1;
        }
    }
    let identity = if pairs == 0 { 0.0 } else { total / pairs as f64 };
    method.score(window.1 - window.0 + 1, identity)
}

// --------------------------------------------------
#[cfg(test)]
mod overlap_tests {
    use super::*;
    use crate::align::{AlignedSeq, Strand};
    use crate::error::Result;
    use pretty_assertions::assert_eq;

    fn two_row_alignment() -> Result<Alignment> {
        let mut aln = Alignment::new();
        aln.push_row(AlignedSeq::new("r1", "AAAAACCCCC--", Strand::Forward))?;
        aln.push_row(AlignedSeq::new("r2", "---AACCCCCGG", Strand::Forward))?;
        Ok(aln)
    }

    #[test]
    fn test_pair_overlap_geometry() -> Result<()> {
        let aln = two_row_alignment()?;
        let matrix = OverlapMatrix::compute(&aln);
        let ov = matrix.get(0, 1);
        assert_eq!(ov.start, 4);
        assert_eq!(ov.end, 10);
        assert_eq!(ov.length, 7);
        assert_eq!(ov.identity, 100.0);
        Ok(())
    }

    #[test]
    fn test_diagonal_is_zero() -> Result<()> {
        let aln = two_row_alignment()?;
        let matrix = OverlapMatrix::compute(&aln);
        assert_eq!(matrix.get(0, 0).length, 0);
        assert_eq!(matrix.get(1, 1).length, 0);
        Ok(())
    }

    #[test]
    fn test_best_pair_idempotent() -> Result<()> {
        let mut aln = two_row_alignment()?;
        aln.push_row(AlignedSeq::new("r3", "AAAA--------", Strand::Forward))?;
        let matrix = OverlapMatrix::compute(&aln);
        let first = matrix.best_pair(ScoreMethod::Length);
        assert_eq!(first, Some((0, 1)));
        assert_eq!(OverlapMatrix::compute(&aln).best_pair(ScoreMethod::Length), first);
        Ok(())
    }

    #[test]
    fn test_score_method_weighs_identity() {
        // 100 columns at 50% lose to 30 columns at 100%
        assert!(
            ScoreMethod::LengthIdentity.score(30, 100.0)
                > ScoreMethod::LengthIdentity.score(100, 50.0)
        );
        assert!(ScoreMethod::Length.score(100, 50.0) > ScoreMethod::Length.score(30, 100.0));
    }

    #[test]
    fn test_disjoint_rows_have_zero_overlap() -> Result<()> {
        let mut aln = Alignment::new();
        aln.push_row(AlignedSeq::new("a", "AAAA----", Strand::Forward))?;
        aln.push_row(AlignedSeq::new("b", "----CCCC", Strand::Forward))?;
        let matrix = OverlapMatrix::compute(&aln);
        assert_eq!(matrix.get(0, 1), Overlap::default());
        Ok(())
    }

    #[test]
    fn test_seed_and_extend_meets_composition() -> Result<()> {
        let mut aln = Alignment::new();
        aln.push_row(AlignedSeq::new("a1", "AAACCCCCTT", Strand::Forward))?;
        aln.push_row(AlignedSeq::new("b1", "-AACCCCCT-", Strand::Forward))?;
        aln.push_row(AlignedSeq::new("c1", "--ACCCCC--", Strand::Forward))?;
        aln.push_row(AlignedSeq::new("c2", "--------TT", Strand::Forward))?;
        let mut strains = StrainTable::new();
        strains.insert("a1", "A");
        strains.insert("b1", "B");
        strains.insert("c1", "C");
        strains.insert("c2", "C");
        let composition = vec![
            ("A".to_string(), 1),
            ("B".to_string(), 1),
            ("C".to_string(), 1),
        ];
        let sel = seed_and_extend(
            &aln,
            &strains,
            &composition,
            &SeedExtendParams::default(),
        )
        .expect("selection");
        let mut ids = sel.ids.clone();
        ids.sort();
        assert_eq!(ids, vec!["a1", "b1", "c1"]);
        assert_eq!(sel.window, (3, 8));
        Ok(())
    }

    #[test]
    fn test_seed_and_extend_unmet_composition() -> Result<()> {
        let aln = two_row_alignment()?;
        let mut strains = StrainTable::new();
        strains.insert("r1", "A");
        strains.insert("r2", "A");
        let composition = vec![("A".to_string(), 1), ("B".to_string(), 1)];
        assert!(seed_and_extend(
            &aln,
            &strains,
            &composition,
            &SeedExtendParams::default()
        )
        .is_none());
        Ok(())
    }
}
