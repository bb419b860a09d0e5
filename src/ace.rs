use crate::align::{AlignedSeq, Alignment, Member, Strand, GAP};
use crate::error::{Error, Result};
use crate::family::{ClusterSet, SequenceFamily};
use std::io::BufRead;

// --------------------------------------------------
#[derive(Debug, Clone, Copy, Default)]
pub struct AceParams {
    /// Discard contigs holding a single read.
    pub nosinglets: bool,
}

#[derive(Debug, Default)]
struct ReadRecord {
    id: String,
    padded: String,
    pad_start: i64,
    complemented: bool,
    clip_start: usize,
    clip_end: usize,
    has_af: bool,
    has_qa: bool,
}

#[derive(Debug, Default)]
struct ContigRecord {
    id: String,
    consensus: String,
    reads: Vec<ReadRecord>,
}

// --------------------------------------------------
/// Parse an ACE-style assembly into one family per contig. Each read
/// becomes a member (unpadded sequence) plus a clipped, gap-padded
/// alignment row in contig coordinates; the contig consensus is stored
/// on the alignment.
pub fn read_ace(input: &mut impl BufRead, params: AceParams) -> Result<ClusterSet> {
    let mut lines = input.lines().enumerate().peekable();
    let mut contigs: Vec<ContigRecord> = vec![];
    // AF lines pre-create read records, so QA must attach to the read
    // the preceding RD named, not to the newest record
    let mut last_rd: Option<usize> = None;

    while let Some((lineno, line)) = lines.next() {
        let line = line?;
        let mut fields = line.split_whitespace();
        let tag = match fields.next() {
            Some(t) => t,
            None => continue,
        };
        match tag {
            "AS" => {
                let rest: Vec<&str> = fields.collect();
                if rest.len() != 2 || rest.iter().any(|f| f.parse::<usize>().is_err()) {
                    return Err(bad_line(lineno, "AS expects <n_contigs> <n_reads>"));
                }
            }
            "CO" => {
                let rest: Vec<&str> = fields.collect();
                if rest.len() != 5 {
                    return Err(bad_line(
                        lineno,
                        "CO expects <id> <bases> <reads> <segments> <comp>",
                    ));
                }
                let mut contig = ContigRecord {
                    id: rest[0].to_string(),
                    ..Default::default()
                };
                contig.consensus = read_sequence_block(&mut lines)?;
                contigs.push(contig);
                last_rd = None;
            }
            "BQ" => {
                // Quality block: skip until the blank line that ends it
                while let Some((_, l)) = lines.peek() {
                    match l {
                        Ok(text) if text.trim().is_empty() => break,
                        Ok(_) => {
                            lines.next();
                        }
                        Err(_) => break,
                    }
                }
            }
            "AF" => {
                let rest: Vec<&str> = fields.collect();
                if rest.len() != 3 {
                    return Err(bad_line(lineno, "AF expects <id> <comp> <pad_start>"));
                }
                let contig = contigs
                    .last_mut()
                    .ok_or_else(|| bad_line(lineno, "AF before any CO"))?;
                let pad_start: i64 = rest[2]
                    .parse()
                    .map_err(|_| bad_line(lineno, "AF pad_start must be an integer"))?;
                let complemented = match rest[1] {
                    "C" => true,
                    "U" => false,
                    _ => return Err(bad_line(lineno, "AF comp flag must be C or U")),
                };
                match contig.reads.iter_mut().find(|r| r.id == rest[0]) {
                    Some(read) => {
                        read.pad_start = pad_start;
                        read.complemented = complemented;
                        read.has_af = true;
                    }
                    None => contig.reads.push(ReadRecord {
                        id: rest[0].to_string(),
                        pad_start,
                        complemented,
                        has_af: true,
                        ..Default::default()
                    }),
                }
            }
            "RD" => {
                let rest: Vec<&str> = fields.collect();
                if rest.len() != 4 {
                    return Err(bad_line(lineno, "RD expects <id> <pad_bases> <info> <tags>"));
                }
                let padded = read_sequence_block(&mut lines)?;
                let contig = contigs
                    .last_mut()
                    .ok_or_else(|| bad_line(lineno, "RD before any CO"))?;
                last_rd = match contig.reads.iter().position(|r| r.id == rest[0]) {
                    Some(pos) => {
                        contig.reads[pos].padded = padded;
                        Some(pos)
                    }
                    None => {
                        contig.reads.push(ReadRecord {
                            id: rest[0].to_string(),
                            padded,
                            ..Default::default()
                        });
                        Some(contig.reads.len() - 1)
                    }
                };
            }
            "QA" => {
                let rest: Vec<&str> = fields.collect();
                if rest.len() != 4 {
                    return Err(bad_line(lineno, "QA expects <qs> <qe> <as> <ae>"));
                }
                let clip_start: usize = rest[2]
                    .parse()
                    .map_err(|_| bad_line(lineno, "QA align clip start must be an integer"))?;
                let clip_end: usize = rest[3]
                    .parse()
                    .map_err(|_| bad_line(lineno, "QA align clip end must be an integer"))?;
                let read = contigs
                    .last_mut()
                    .zip(last_rd)
                    .and_then(|(c, pos)| c.reads.get_mut(pos))
                    .ok_or_else(|| bad_line(lineno, "QA before any RD"))?;
                read.clip_start = clip_start;
                read.clip_end = clip_end;
                read.has_qa = true;
            }
            _ => {}
        }
    }

    let mut set = ClusterSet::new();
    for contig in contigs {
        if params.nosinglets && contig.reads.len() < 2 {
            continue;
        }
        set.insert(build_family(contig)?)?;
    }
    Ok(set)
}

// --------------------------------------------------
fn build_family(contig: ContigRecord) -> Result<SequenceFamily> {
    let consensus: String = contig
        .consensus
        .chars()
        .map(|c| if c == '*' { GAP } else { c })
        .collect();
    let width = consensus.chars().count();
    if width == 0 {
        return Err(Error::input(format!(
            "contig {} has an empty consensus",
            contig.id
        )));
    }

    let mut family = SequenceFamily::new(&contig.id);
    let mut aln = Alignment::new();
    aln.consensus = Some(consensus);
    aln.description = Some(format!("assembly contig {}", contig.id));
    aln.source = Some("ace".to_string());

    for read in &contig.reads {
        if !read.has_af || !read.has_qa || read.padded.is_empty() {
            return Err(Error::input(format!(
                "contig {}: read {} is missing AF, RD, or QA data",
                contig.id, read.id
            )));
        }
        if read.clip_start == 0
            || read.clip_end < read.clip_start
            || read.clip_start > read.padded.chars().count()
        {
            return Err(Error::input(format!(
                "contig {}: read {} has bad clip range {}..{}",
                contig.id, read.id, read.clip_start, read.clip_end
            )));
        }
        let chars: Vec<char> = read.padded.chars().collect();
        let clipped: String = chars
            [read.clip_start - 1..read.clip_end.min(chars.len())]
            .iter()
            .map(|&c| if c == '*' { GAP } else { c })
            .collect();

        let pad_start = read.pad_start.max(1) as usize;
        let mut row = String::new();
        for _ in 0..pad_start - 1 {
            row.push(GAP);
        }
        row.push_str(&clipped);
        // Reads running past the consensus are cut at contig width
        let mut row: String = row.chars().take(width).collect();
        while row.chars().count() < width {
            row.push(GAP);
        }

        let strand = if read.complemented {
            Strand::Reverse
        } else {
            Strand::Forward
        };
        let unpadded: String = clipped.chars().filter(|&c| c != GAP).collect();
        family.add_member(Member::with_seq(&read.id, unpadded))?;
        aln.push_row(AlignedSeq::new(&read.id, row, strand))?;
    }

    family.set_alignment(aln)?;
    Ok(family)
}

// --------------------------------------------------
fn read_sequence_block<B: BufRead>(
    lines: &mut std::iter::Peekable<std::iter::Enumerate<std::io::Lines<B>>>,
) -> Result<String> {
    let mut seq = String::new();
    while let Some((_, line)) = lines.peek() {
        match line {
            Ok(text) => {
                let text = text.trim();
                if text.is_empty() {
                    break;
                }
                seq.push_str(text);
                lines.next();
            }
            Err(_) => {
                let (_, line) = lines.next().unwrap();
                line?;
            }
        }
    }
    Ok(seq)
}

// --------------------------------------------------
fn bad_line(lineno: usize, msg: &str) -> Error {
    Error::input(format!("ACE line {}: {msg}", lineno + 1))
}
