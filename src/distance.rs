use crate::align::{Alignment, GAP};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::io::{BufRead, Write};

/// Labelled symmetric distance matrix with a zero diagonal. Only the
/// lower triangle is stored.
#[derive(Debug, Clone)]
pub struct DistanceMatrix {
    labels: Vec<String>,
    index: HashMap<String, usize>,
    data: Vec<f64>,
}

// --------------------------------------------------
impl DistanceMatrix {
    pub fn with_labels(labels: Vec<String>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, label) in labels.iter().enumerate() {
            if index.insert(label.clone(), i).is_some() {
                return Err(Error::input(format!("duplicate matrix label: {label}")));
            }
        }
        let n = labels.len();
        Ok(DistanceMatrix {
            labels,
            index,
            data: vec![0.0; n * (n.saturating_sub(1)) / 2],
        })
    }

    pub fn dim(&self) -> usize {
        self.labels.len()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    fn idx(&self, i: usize, j: usize) -> usize {
        let (i, j) = if i > j { (i, j) } else { (j, i) };
        i * (i - 1) / 2 + j
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        if i == j {
            0.0
        } else {
            self.data[self.idx(i, j)]
        }
    }

    pub fn set(&mut self, i: usize, j: usize, val: f64) {
        if i != j {
            let index = self.idx(i, j);
            self.data[index] = val;
        }
    }

    /// Entry lookup by labels; `None` when either label is unknown.
    pub fn get_by_label(&self, a: &str, b: &str) -> Option<f64> {
        let i = *self.index.get(a)?;
        let j = *self.index.get(b)?;
        Some(self.get(i, j))
    }

    pub fn contains(&self, label: &str) -> bool {
        self.index.contains_key(label)
    }

    /// Rename a row/column label in place.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        if self.index.contains_key(new) {
            return Err(Error::input(format!("matrix label already used: {new}")));
        }
        let i = self
            .index
            .remove(old)
            .ok_or_else(|| Error::input(format!("unknown matrix label: {old}")))?;
        self.labels[i] = new.to_string();
        self.index.insert(new.to_string(), i);
        Ok(())
    }

    /// Observed pairwise distances from an alignment: differing positions
    /// over compared positions, skipping columns where either row is a
    /// gap. Rows sharing no compared column get distance 0.
    pub fn from_alignment(aln: &Alignment) -> Result<Self> {
        if aln.num_sequences() < 2 {
            return Err(Error::empty(
                "distance needs an alignment with at least two rows",
            ));
        }
        let mut mat = DistanceMatrix::with_labels(aln.member_ids())?;
        let rows: Vec<Vec<char>> = aln.rows().iter().map(|r| r.gapped.chars().collect()).collect();
        for i in 0..rows.len() {
            for j in (i + 1)..rows.len() {
                let mut diffs = 0usize;
                let mut compared = 0usize;
                for (a, b) in rows[i].iter().zip(rows[j].iter()) {
                    if *a == GAP || *b == GAP {
                        continue;
                    }
                    compared += 1;
                    if !a.eq_ignore_ascii_case(b) {
                        diffs += 1;
                    }
                }
                let d = if compared == 0 {
                    0.0
                } else {
                    diffs as f64 / compared as f64
                };
                mat.set(i, j, d);
            }
        }
        Ok(mat)
    }

    /// Write in phylip square format, names padded to ten characters.
    pub fn write_phylip(&self, out: &mut impl Write) -> Result<()> {
        writeln!(out, "{:5}", self.dim())?;
        for i in 0..self.dim() {
            let name = phylip_name(&self.labels[i]);
            let row = (0..self.dim())
                .map(|j| format!("{:.6}", self.get(i, j)))
                .collect::<Vec<_>>()
                .join("  ");
            writeln!(out, "{name}  {row}")?;
        }
        Ok(())
    }

    /// Read a phylip square-format matrix.
    pub fn read_phylip(input: &mut impl BufRead) -> Result<Self> {
        let mut lines = input.lines();
        let header = lines
            .next()
            .ok_or_else(|| Error::input("empty phylip matrix"))??;
        let n: usize = header
            .trim()
            .parse()
            .map_err(|_| Error::input(format!("bad phylip matrix header: {header}")))?;

        let mut labels = vec![];
        let mut rows: Vec<Vec<f64>> = vec![];
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let name = fields
                .next()
                .ok_or_else(|| Error::input("phylip matrix row without a name"))?;
            let mut vals = vec![];
            for field in fields {
                vals.push(field.parse::<f64>().map_err(|_| {
                    Error::input(format!("bad phylip matrix value: {field}"))
                })?);
            }
            // Interleaved continuation lines extend the previous row
            if vals.len() < n && !rows.is_empty() && rows.last().unwrap().len() < n {
                let prev = rows.last_mut().unwrap();
                prev.push(
                    name.parse::<f64>()
                        .map_err(|_| Error::input(format!("bad phylip matrix value: {name}")))?,
                );
                prev.extend(vals);
            } else {
                labels.push(name.to_string());
                rows.push(vals);
            }
        }
        if labels.len() != n {
            return Err(Error::input(format!(
                "phylip matrix promised {} rows, found {}",
                n,
                labels.len()
            )));
        }
        let mut mat = DistanceMatrix::with_labels(labels)?;
        for (i, row) in rows.iter().enumerate() {
            if row.len() != n {
                return Err(Error::input(format!(
                    "phylip matrix row {} has {} entries, expected {}",
                    mat.labels[i],
                    row.len(),
                    n
                )));
            }
            for (j, val) in row.iter().enumerate() {
                if i != j {
                    mat.set(i, j, *val);
                }
            }
        }
        Ok(mat)
    }
}

// --------------------------------------------------
/// Phylip taxon names are a fixed ten characters.
pub fn phylip_name(name: &str) -> String {
    let mut out: String = name.chars().take(10).collect();
    while out.chars().count() < 10 {
        out.push(' ');
    }
    out
}

// --------------------------------------------------
#[cfg(test)]
mod distance_tests {
    use super::*;
    use crate::align::{AlignedSeq, Strand};
    use crate::error::Result;
    use pretty_assertions::assert_eq;
    use std::io::BufReader;

    fn matrix() -> Result<DistanceMatrix> {
        let mut mat = DistanceMatrix::with_labels(vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
        ])?;
        mat.set(0, 1, 0.25);
        mat.set(1, 2, 0.5);
        Ok(mat)
    }

    #[test]
    fn test_symmetry_and_diagonal() -> Result<()> {
        let mat = matrix()?;
        assert_eq!(mat.get(0, 1), 0.25);
        assert_eq!(mat.get(1, 0), 0.25);
        assert_eq!(mat.get(2, 2), 0.0);
        assert_eq!(mat.get_by_label("b", "c"), Some(0.5));
        assert_eq!(mat.get_by_label("b", "x"), None);
        Ok(())
    }

    #[test]
    fn test_rename() -> Result<()> {
        let mut mat = matrix()?;
        mat.rename("b", "b2")?;
        assert_eq!(mat.get_by_label("a", "b2"), Some(0.25));
        assert!(mat.rename("nope", "y").is_err());
        assert!(mat.rename("a", "b2").is_err());
        Ok(())
    }

    #[test]
    fn test_from_alignment_skips_gap_columns() -> Result<()> {
        let mut aln = Alignment::new();
        aln.push_row(AlignedSeq::new("a", "ACGT", Strand::Forward))?;
        aln.push_row(AlignedSeq::new("b", "AC-A", Strand::Forward))?;
        let mat = DistanceMatrix::from_alignment(&aln)?;
        // Three compared columns, one difference
        let d = mat.get_by_label("a", "b").unwrap();
        assert!((d - 1.0 / 3.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_phylip_round_trip() -> Result<()> {
        let mat = matrix()?;
        let mut buf = vec![];
        mat.write_phylip(&mut buf)?;
        let back = DistanceMatrix::read_phylip(&mut BufReader::new(buf.as_slice()))?;
        assert_eq!(back.dim(), 3);
        assert_eq!(back.labels()[0].trim(), "a");
        assert!((back.get(0, 1) - 0.25).abs() < 1e-9);
        assert!((back.get(2, 1) - 0.5).abs() < 1e-9);
        Ok(())
    }
}
