use crate::error::{Error, Result};
use itertools::Itertools;

/// Canonical gap character for alignment rows.
pub const GAP: char = '-';

// --------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strand {
    #[default]
    Forward,
    Reverse,
}

// --------------------------------------------------
/// One sequence belonging to one family. The family owns the raw
/// (unpadded) sequence; any placement inside an alignment lives on the
/// alignment's rows and references the member by id.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: String,
    pub seq: Option<String>,
    pub description: Option<String>,
}

impl Member {
    pub fn new(id: impl Into<String>) -> Self {
        Member {
            id: id.into(),
            seq: None,
            description: None,
        }
    }

    pub fn with_seq(id: impl Into<String>, seq: impl Into<String>) -> Self {
        Member {
            id: id.into(),
            seq: Some(seq.into()),
            description: None,
        }
    }

    pub fn seq_len(&self) -> usize {
        self.seq.as_ref().map_or(0, String::len)
    }
}

// --------------------------------------------------
/// A gapped alignment row: member id plus placement. `start`/`end` are
/// 1-based columns of the first and last non-gap character; an all-gap
/// row has `start == end == 0`.
#[derive(Debug, Clone)]
pub struct AlignedSeq {
    pub id: String,
    pub start: usize,
    pub end: usize,
    pub strand: Strand,
    pub gapped: String,
}

// --------------------------------------------------
impl AlignedSeq {
    pub fn new(id: impl Into<String>, gapped: impl Into<String>, strand: Strand) -> Self {
        let gapped = gapped.into();
        let (start, end) = gapped_extent(&gapped);
        AlignedSeq {
            id: id.into(),
            start,
            end,
            strand,
            gapped,
        }
    }

    pub fn width(&self) -> usize {
        self.gapped.chars().count()
    }

    /// Row with all gap characters stripped.
    pub fn ungapped(&self) -> String {
        self.gapped.chars().filter(|&c| c != GAP).collect()
    }

    /// Slice of the gapped row over 1-based inclusive columns.
    pub fn columns(&self, start: usize, end: usize) -> String {
        self.gapped
            .chars()
            .skip(start.saturating_sub(1))
            .take(end.saturating_sub(start) + 1)
            .collect()
    }

    /// Recompute `start`/`end` after the gapped string was edited.
    pub fn refresh_extent(&mut self) {
        let (start, end) = gapped_extent(&self.gapped);
        self.start = start;
        self.end = end;
    }
}

// --------------------------------------------------
/// First and last non-gap columns (1-based) of a gapped string.
pub fn gapped_extent(gapped: &str) -> (usize, usize) {
    let mut start = 0;
    let mut end = 0;
    for (i, c) in gapped.chars().enumerate() {
        if c != GAP {
            if start == 0 {
                start = i + 1;
            }
            end = i + 1;
        }
    }
    (start, end)
}

// --------------------------------------------------
/// Ordered collection of equal-width gapped rows with optional consensus
/// and metadata carried over from whatever produced it.
#[derive(Debug, Clone, Default)]
pub struct Alignment {
    rows: Vec<AlignedSeq>,
    pub consensus: Option<String>,
    pub description: Option<String>,
    pub score: Option<f64>,
    pub source: Option<String>,
}

// --------------------------------------------------
impl Alignment {
    pub fn new() -> Self {
        Alignment::default()
    }

    /// Number of columns. Zero for an empty alignment.
    pub fn width(&self) -> usize {
        self.rows.first().map_or(0, AlignedSeq::width)
    }

    pub fn num_sequences(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Total non-gap characters over all rows.
    pub fn num_residues(&self) -> usize {
        self.rows
            .iter()
            .map(|r| r.gapped.chars().filter(|&c| c != GAP).count())
            .sum()
    }

    pub fn rows(&self) -> &[AlignedSeq] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut Vec<AlignedSeq> {
        &mut self.rows
    }

    pub fn row(&self, id: &str) -> Option<&AlignedSeq> {
        self.rows.iter().find(|r| r.id == id)
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.rows.iter().map(|r| r.id.clone()).collect()
    }

    /// Append a row, enforcing unique ids and equal column counts.
    pub fn push_row(&mut self, row: AlignedSeq) -> Result<()> {
        if self.rows.iter().any(|r| r.id == row.id) {
            return Err(Error::input(format!(
                "duplicate alignment row id: {}",
                row.id
            )));
        }
        if !self.rows.is_empty() && row.width() != self.width() {
            return Err(Error::input(format!(
                "alignment row {} has {} columns, expected {}",
                row.id,
                row.width(),
                self.width()
            )));
        }
        if row.start > row.end {
            return Err(Error::input(format!(
                "alignment row {} has start {} after end {}",
                row.id, row.start, row.end
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Drop the rows for the given member ids, returning the ids actually
    /// removed, in row order.
    pub fn remove_rows(&mut self, ids: &[String]) -> Vec<String> {
        let mut removed = vec![];
        self.rows.retain(|r| {
            if ids.iter().any(|id| *id == r.id) {
                removed.push(r.id.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Mean pairwise identity over full rows, in percent. Columns where
    /// both rows agree (gap-gap included) count as matches. Fewer than
    /// two rows yields 0.
    pub fn percentage_identity(&self) -> f64 {
        let n = self.rows.len();
        if n < 2 {
            return 0.0;
        }
        let width = self.width();
        if width == 0 {
            return 0.0;
        }
        let pairs: Vec<_> = (0..n).tuple_combinations::<(_, _)>().collect();
        let total: f64 = pairs
            .iter()
            .map(|&(i, j)| {
                pair_identity(&self.rows[i].gapped, &self.rows[j].gapped, 1, width)
            })
            .sum();
        total / pairs.len() as f64
    }

    /// Majority-rule consensus: per column, the most frequent non-gap
    /// character (ties broken lexically); all-gap columns stay gaps.
    pub fn majority_consensus(&self) -> String {
        let width = self.width();
        let chars: Vec<Vec<char>> = self.rows.iter().map(|r| r.gapped.chars().collect()).collect();
        (0..width)
            .map(|col| {
                let mut counts: Vec<(char, usize)> = vec![];
                for row in &chars {
                    let c = row[col].to_ascii_uppercase();
                    if c == GAP {
                        continue;
                    }
                    match counts.iter_mut().find(|(k, _)| *k == c) {
                        Some((_, n)) => *n += 1,
                        None => counts.push((c, 1)),
                    }
                }
                counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
                counts.first().map_or(GAP, |(c, _)| *c)
            })
            .collect()
    }

    /// Delete columns that are gaps in every row.
    pub fn compact_columns(&mut self) {
        let width = self.width();
        let chars: Vec<Vec<char>> = self.rows.iter().map(|r| r.gapped.chars().collect()).collect();
        let keep: Vec<usize> = (0..width)
            .filter(|&col| chars.iter().any(|row| row[col] != GAP))
            .collect();
        for (row, cs) in self.rows.iter_mut().zip(&chars) {
            row.gapped = keep.iter().map(|&col| cs[col]).collect();
            row.refresh_extent();
        }
        if let Some(cons) = &self.consensus {
            let cs: Vec<char> = cons.chars().collect();
            self.consensus = Some(
                keep.iter()
                    .filter_map(|&col| cs.get(col).copied())
                    .collect(),
            );
        }
    }
}

// --------------------------------------------------
/// Percent identity of two gapped rows over 1-based inclusive columns.
/// A column matches when both characters compare equal, which makes a
/// gap-vs-gap column a match.
pub fn pair_identity(a: &str, b: &str, start: usize, end: usize) -> f64 {
    if start == 0 || end < start {
        return 0.0;
    }
    let xs: Vec<char> = a.chars().collect();
    let ys: Vec<char> = b.chars().collect();
    let mut matches = 0usize;
    let mut total = 0usize;
    for col in (start - 1)..end.min(xs.len()).min(ys.len()) {
        total += 1;
        if xs[col].eq_ignore_ascii_case(&ys[col]) {
            matches += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        matches as f64 / total as f64 * 100.0
    }
}

// --------------------------------------------------
/// Reverse complement honouring IUPAC ambiguity codes; case is preserved
/// and unknown characters pass through unchanged.
pub fn revcomp(seq: &str) -> String {
    seq.chars()
        .rev()
        .map(|c| {
            let comp = match c.to_ascii_uppercase() {
                'A' => 'T',
                'T' | 'U' => 'A',
                'C' => 'G',
                'G' => 'C',
                'R' => 'Y',
                'Y' => 'R',
                'K' => 'M',
                'M' => 'K',
                'B' => 'V',
                'V' => 'B',
                'D' => 'H',
                'H' => 'D',
                other => other,
            };
            if c.is_ascii_lowercase() {
                comp.to_ascii_lowercase()
            } else {
                comp
            }
        })
        .collect()
}

// --------------------------------------------------
#[cfg(test)]
mod align_tests {
    use super::*;
    use crate::error::Result;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_gapped_extent() {
        assert_eq!(gapped_extent("--ACGT--"), (3, 6));
        assert_eq!(gapped_extent("ACGT"), (1, 4));
        assert_eq!(gapped_extent("----"), (0, 0));
    }

    #[test]
    fn test_push_row_enforces_width() -> Result<()> {
        let mut aln = Alignment::new();
        aln.push_row(AlignedSeq::new("a", "AC-GT", Strand::Forward))?;
        let res = aln.push_row(AlignedSeq::new("b", "ACGT", Strand::Forward));
        assert!(res.is_err());
        let res = aln.push_row(AlignedSeq::new("a", "AC-GT", Strand::Forward));
        assert!(res.is_err());
        Ok(())
    }

    #[test]
    fn test_pair_identity_counts_double_gaps() {
        // Columns 1-4: match, match, gap-gap match, mismatch
        assert_eq!(pair_identity("AC-G", "AC-T", 1, 4), 75.0);
        assert_eq!(pair_identity("AAAA", "AAAA", 2, 3), 100.0);
    }

    #[test]
    fn test_majority_consensus() -> Result<()> {
        let mut aln = Alignment::new();
        aln.push_row(AlignedSeq::new("a", "AC-T", Strand::Forward))?;
        aln.push_row(AlignedSeq::new("b", "AG-T", Strand::Forward))?;
        aln.push_row(AlignedSeq::new("c", "AG--", Strand::Forward))?;
        assert_eq!(aln.majority_consensus(), "AG-T");
        Ok(())
    }

    #[test]
    fn test_compact_columns() -> Result<()> {
        let mut aln = Alignment::new();
        aln.push_row(AlignedSeq::new("a", "A--CT", Strand::Forward))?;
        aln.push_row(AlignedSeq::new("b", "A--GT", Strand::Forward))?;
        aln.compact_columns();
        assert_eq!(aln.rows()[0].gapped, "ACT");
        assert_eq!(aln.rows()[1].gapped, "AGT");
        assert_eq!(aln.rows()[0].end, 3);
        Ok(())
    }

    #[test]
    fn test_revcomp() {
        assert_eq!(revcomp("ACGT"), "ACGT");
        assert_eq!(revcomp("AACCG"), "CGGTT");
        assert_eq!(revcomp("acRt"), "aYgt");
    }
}
