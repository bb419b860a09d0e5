use crate::align::{AlignedSeq, Alignment, Strand};
use crate::distance::phylip_name;
use crate::error::{Error, Result};
use crate::family::{ClusterSet, SequenceFamily};
use kseq::parse_reader;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};

// --------------------------------------------------
pub fn open(filename: &str) -> Result<Box<dyn BufRead>> {
    match filename {
        "-" => Ok(Box::new(BufReader::new(io::stdin()))),
        _ => Ok(Box::new(BufReader::new(File::open(filename).map_err(
            |e| Error::input(format!("{filename}: {e}")),
        )?))),
    }
}

// --------------------------------------------------
/// Read a FASTA file into `(id, sequence)` pairs; multi-line sequences
/// are concatenated by the reader.
pub fn read_fasta(filename: &str) -> Result<Vec<(String, String)>> {
    let mut reader = parse_reader(open(filename)?)
        .map_err(|e| Error::input(format!("{filename}: {e}")))?;
    let mut out = vec![];
    while let Some(rec) = reader
        .iter_record()
        .map_err(|e| Error::input(format!("{filename}: {e}")))?
    {
        out.push((rec.head().to_string(), rec.seq().to_string()));
    }
    Ok(out)
}

// --------------------------------------------------
/// Attach raw member sequences from a FASTA file to whichever families
/// hold them. Returns how many members were matched.
pub fn attach_member_seqs(set: &mut ClusterSet, filename: &str) -> Result<usize> {
    let mut attached = 0;
    for (id, seq) in read_fasta(filename)? {
        let family = match set.family_of(&id) {
            Some(f) => f.to_string(),
            None => continue,
        };
        if let Some(member) = set.get_mut(&family).and_then(|f| f.member_mut(&id)) {
            member.seq = Some(seq);
            attached += 1;
        }
    }
    Ok(attached)
}

// --------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoTerm {
    pub id: String,
    pub description: Option<String>,
}

/// GO annotation table: two tab-separated columns, the second a
/// semicolon-separated term list, each term optionally
/// `GO:NNNNNNN=<description>`.
pub fn read_go_table(input: &mut impl BufRead) -> Result<HashMap<String, Vec<GoTerm>>> {
    let mut table: HashMap<String, Vec<GoTerm>> = HashMap::new();
    for (lineno, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.splitn(2, '\t');
        let member = fields.next().unwrap_or_default().trim();
        let terms = fields.next().map(str::trim).unwrap_or_default();
        if member.is_empty() || terms.is_empty() {
            return Err(Error::input(format!(
                "GO table line {}: expected <member>\\t<terms>",
                lineno + 1
            )));
        }
        let parsed = terms
            .split(';')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|term| match term.split_once('=') {
                Some((id, desc)) => GoTerm {
                    id: id.trim().to_string(),
                    description: Some(desc.trim().to_string()),
                },
                None => GoTerm {
                    id: term.to_string(),
                    description: None,
                },
            })
            .collect();
        table.insert(member.to_string(), parsed);
    }
    Ok(table)
}

// --------------------------------------------------
/// Blast defline file `<subject-id>\t<description>`, indexed into a map
/// once so hit annotation never re-scans the file.
pub fn read_deflines(input: &mut impl BufRead) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for (lineno, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match line.split_once('\t') {
            Some((id, desc)) => {
                map.insert(id.trim().to_string(), desc.trim().to_string());
            }
            None => {
                return Err(Error::input(format!(
                    "defline file line {}: expected <subject>\\t<description>",
                    lineno + 1
                )))
            }
        }
    }
    Ok(map)
}

// --------------------------------------------------
/// Cluster membership table: `<cluster>\t<member>`, one line per member.
pub fn write_membership(set: &ClusterSet, out: &mut impl Write) -> Result<()> {
    for family in set.iter() {
        for member in family.members() {
            writeln!(out, "{}\t{}", family.id, member.id)?;
        }
    }
    Ok(())
}

// --------------------------------------------------
/// Raw member sequences of one family as FASTA, the input handed to
/// external alignment programs.
pub fn write_member_fasta(fam: &SequenceFamily, out: &mut impl Write) -> Result<()> {
    for member in fam.members() {
        let seq = member.seq.as_ref().ok_or_else(|| {
            Error::empty(format!(
                "family {}: member {} has no sequence",
                fam.id, member.id
            ))
        })?;
        writeln!(out, ">{}\n{}", member.id, seq)?;
    }
    Ok(())
}

// --------------------------------------------------
pub fn write_fasta_alignment(aln: &Alignment, out: &mut impl Write) -> Result<()> {
    for row in aln.rows() {
        writeln!(out, ">{}\n{}", row.id, row.gapped)?;
    }
    Ok(())
}

// --------------------------------------------------
const CLUSTAL_BLOCK: usize = 60;

pub fn write_clustalw(aln: &Alignment, out: &mut impl Write) -> Result<()> {
    writeln!(out, "CLUSTAL W (famtree) multiple sequence alignment")?;
    writeln!(out)?;
    let name_width = aln
        .rows()
        .iter()
        .map(|r| r.id.chars().count())
        .max()
        .unwrap_or(0)
        .max(10);
    let width = aln.width();
    let mut offset = 0;
    while offset < width {
        let take = CLUSTAL_BLOCK.min(width - offset);
        for row in aln.rows() {
            let chunk: String = row.gapped.chars().skip(offset).take(take).collect();
            writeln!(out, "{:<name_width$}  {}", row.id, chunk)?;
        }
        writeln!(out)?;
        offset += take;
    }
    Ok(())
}

// --------------------------------------------------
/// Read a clustalw alignment back: a `CLUSTAL` header, then interleaved
/// blocks of `name chunk` lines; conservation lines are ignored.
pub fn read_clustalw(input: &mut impl BufRead) -> Result<Alignment> {
    let mut lines = input.lines();
    let header = loop {
        match lines.next() {
            Some(line) => {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                break line;
            }
            None => return Err(Error::input("empty clustalw input")),
        }
    };
    if !header.trim_start().starts_with("CLUSTAL") {
        return Err(Error::input("missing CLUSTAL header line"));
    }

    let mut order: Vec<String> = vec![];
    let mut data: HashMap<String, String> = HashMap::new();
    for line in lines {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        // Conservation lines hold only *, :, . and spaces
        if trimmed.chars().all(|c| matches!(c, '*' | ':' | '.' | ' ')) {
            continue;
        }
        let mut fields = line.split_whitespace();
        let name = match fields.next() {
            Some(n) => n,
            None => continue,
        };
        let chunk = match fields.next() {
            Some(c) => c,
            None => {
                return Err(Error::input(format!(
                    "clustalw line without sequence data: {line}"
                )))
            }
        };
        if !data.contains_key(name) {
            order.push(name.to_string());
        }
        data.entry(name.to_string()).or_default().push_str(chunk);
    }

    let mut aln = Alignment::new();
    aln.source = Some("clustalw".to_string());
    for name in order {
        let gapped = data.remove(&name).unwrap_or_default();
        aln.push_row(AlignedSeq::new(&name, gapped, Strand::Forward))?;
    }
    Ok(aln)
}

// --------------------------------------------------
/// Sequential phylip alignment, ten-character names.
pub fn write_phylip_alignment(aln: &Alignment, out: &mut impl Write) -> Result<()> {
    writeln!(out, " {} {}", aln.num_sequences(), aln.width())?;
    for row in aln.rows() {
        writeln!(out, "{}{}", phylip_name(&row.id), row.gapped)?;
    }
    Ok(())
}

// --------------------------------------------------
#[cfg(test)]
mod formats_tests {
    use super::*;
    use crate::align::Member;
    use crate::error::Result;
    use pretty_assertions::assert_eq;

    fn alignment() -> Result<Alignment> {
        let mut aln = Alignment::new();
        let long = "ACGT".repeat(20);
        aln.push_row(AlignedSeq::new("seq_one", &long, Strand::Forward))?;
        aln.push_row(AlignedSeq::new("seq_two", long.replace('G', "-"), Strand::Forward))?;
        Ok(aln)
    }

    #[test]
    fn test_clustalw_round_trip() -> Result<()> {
        let aln = alignment()?;
        let mut buf = vec![];
        write_clustalw(&aln, &mut buf)?;
        let back = read_clustalw(&mut buf.as_slice())?;
        assert_eq!(back.num_sequences(), aln.num_sequences());
        for (mine, theirs) in aln.rows().iter().zip(back.rows()) {
            assert_eq!(mine.id, theirs.id);
            assert_eq!(mine.gapped, theirs.gapped);
        }
        Ok(())
    }

    #[test]
    fn test_read_clustalw_requires_header() {
        let text = "seq1  ACGT\n";
        assert!(read_clustalw(&mut text.as_bytes()).is_err());
    }

    #[test]
    fn test_go_table() -> Result<()> {
        let text = "m1\tGO:0005524=ATP binding; GO:0046872\nm2\tGO:0003677\n";
        let table = read_go_table(&mut text.as_bytes())?;
        assert_eq!(
            table.get("m1").unwrap(),
            &[
                GoTerm {
                    id: "GO:0005524".to_string(),
                    description: Some("ATP binding".to_string())
                },
                GoTerm {
                    id: "GO:0046872".to_string(),
                    description: None
                },
            ]
        );
        assert_eq!(table.get("m2").unwrap().len(), 1);
        Ok(())
    }

    #[test]
    fn test_deflines() -> Result<()> {
        let text = "s1\thypothetical protein\ns2\ttransposase, partial\n";
        let map = read_deflines(&mut text.as_bytes())?;
        assert_eq!(map.get("s1").map(String::as_str), Some("hypothetical protein"));
        assert!(read_deflines(&mut "no-tab-here\n".as_bytes()).is_err());
        Ok(())
    }

    #[test]
    fn test_membership_table() -> Result<()> {
        let mut set = ClusterSet::new();
        let mut fam = SequenceFamily::new("fam_001");
        fam.add_member(Member::new("a"))?;
        fam.add_member(Member::new("b"))?;
        set.insert(fam)?;
        let mut buf = vec![];
        write_membership(&set, &mut buf)?;
        assert_eq!(
            String::from_utf8_lossy(&buf),
            "fam_001\ta\nfam_001\tb\n"
        );
        Ok(())
    }

    #[test]
    fn test_phylip_alignment_header() -> Result<()> {
        let aln = alignment()?;
        let mut buf = vec![];
        write_phylip_alignment(&aln, &mut buf)?;
        let text = String::from_utf8_lossy(&buf);
        assert!(text.starts_with(" 2 80\n"));
        assert!(text.contains("seq_one   "));
        Ok(())
    }
}
