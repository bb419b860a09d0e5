use crate::error::{Error, Result};
use crate::family::{ClusterSet, SequenceFamily};
use crate::align::Member;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::str::FromStr;

// --------------------------------------------------
/// One record of the fixed 12-column tabular blast schema.
#[derive(Debug, Clone, Deserialize)]
pub struct BlastHit {
    pub query: String,
    pub subject: String,
    pub pct_identity: f64,
    pub aln_length: u64,
    pub mismatches: u64,
    pub gap_openings: u64,
    pub q_start: u64,
    pub q_end: u64,
    pub s_start: u64,
    pub s_end: u64,
    pub e_value: f64,
    pub bit_score: f64,
}

impl BlastHit {
    pub fn is_self_hit(&self) -> bool {
        self.query == self.subject
    }
}

// --------------------------------------------------
/// Numeric blast fields a filter expression may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlastField {
    PctIdentity,
    AlnLength,
    Mismatches,
    GapOpenings,
    QStart,
    QEnd,
    SStart,
    SEnd,
    EValue,
    BitScore,
}

impl BlastField {
    pub fn value_of(&self, hit: &BlastHit) -> f64 {
        match self {
            BlastField::PctIdentity => hit.pct_identity,
            BlastField::AlnLength => hit.aln_length as f64,
            BlastField::Mismatches => hit.mismatches as f64,
            BlastField::GapOpenings => hit.gap_openings as f64,
            BlastField::QStart => hit.q_start as f64,
            BlastField::QEnd => hit.q_end as f64,
            BlastField::SStart => hit.s_start as f64,
            BlastField::SEnd => hit.s_end as f64,
            BlastField::EValue => hit.e_value,
            BlastField::BitScore => hit.bit_score,
        }
    }
}

impl FromStr for BlastField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pct_identity" | "percentage_identity" | "identity" => Ok(BlastField::PctIdentity),
            "aln_length" | "alignment_length" | "length" => Ok(BlastField::AlnLength),
            "mismatches" => Ok(BlastField::Mismatches),
            "gap_openings" | "gaps" => Ok(BlastField::GapOpenings),
            "q_start" | "query_start" => Ok(BlastField::QStart),
            "q_end" | "query_end" => Ok(BlastField::QEnd),
            "s_start" | "subject_start" => Ok(BlastField::SStart),
            "s_end" | "subject_end" => Ok(BlastField::SEnd),
            "e_value" | "evalue" => Ok(BlastField::EValue),
            "bit_score" | "score" => Ok(BlastField::BitScore),
            other => Err(Error::input(format!("unknown filter field: {other}"))),
        }
    }
}

// --------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl Comparator {
    pub fn compare(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparator::Lt => lhs < rhs,
            Comparator::Le => lhs <= rhs,
            Comparator::Eq => lhs == rhs,
            Comparator::Ge => lhs >= rhs,
            Comparator::Gt => lhs > rhs,
        }
    }
}

impl FromStr for Comparator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "<" => Ok(Comparator::Lt),
            "<=" => Ok(Comparator::Le),
            "==" => Ok(Comparator::Eq),
            ">=" => Ok(Comparator::Ge),
            ">" => Ok(Comparator::Gt),
            other => Err(Error::input(format!("unknown comparator: {other}"))),
        }
    }
}

// --------------------------------------------------
/// One `(field, comparator, integer threshold)` triple. A hit is
/// admitted only when every rule of the expression passes.
#[derive(Debug, Clone)]
pub struct FilterRule {
    pub field: BlastField,
    pub op: Comparator,
    pub value: i64,
}

impl FilterRule {
    pub fn new(field: BlastField, op: Comparator, value: i64) -> Self {
        FilterRule { field, op, value }
    }

    /// Build from string parts, e.g. `("pct_identity", ">", "75")`.
    pub fn parse(field: &str, op: &str, value: &str) -> Result<Self> {
        let value = value.trim().parse::<i64>().map_err(|_| {
            Error::input(format!("filter threshold is not an integer: {value}"))
        })?;
        Ok(FilterRule {
            field: field.parse()?,
            op: op.parse()?,
            value,
        })
    }

    pub fn passes(&self, hit: &BlastHit) -> bool {
        self.op.compare(self.field.value_of(hit), self.value as f64)
    }
}

pub fn filter_passes(filter: &[FilterRule], hit: &BlastHit) -> bool {
    filter.iter().all(|rule| rule.passes(hit))
}

// --------------------------------------------------
/// Incremental union of blast hits into clusters, in order of
/// appearance. A member belongs to at most one cluster; the first
/// assignment wins. An optional cap rejects admission into a full
/// cluster, so the member seeds its own when next seen as a query.
#[derive(Debug)]
pub struct ClusterBuilder {
    filter: Vec<FilterRule>,
    max_members: Option<usize>,
    clusters: Vec<Vec<String>>,
    assigned: HashMap<String, usize>,
}

// --------------------------------------------------
impl ClusterBuilder {
    pub fn new(filter: Vec<FilterRule>, max_members: Option<usize>) -> Self {
        ClusterBuilder {
            filter,
            max_members,
            clusters: vec![],
            assigned: HashMap::new(),
        }
    }

    fn seed(&mut self, member: &str) -> usize {
        let idx = self.clusters.len();
        self.clusters.push(vec![member.to_string()]);
        self.assigned.insert(member.to_string(), idx);
        idx
    }

    pub fn observe(&mut self, hit: &BlastHit) {
        if hit.is_self_hit() {
            if !self.assigned.contains_key(&hit.query) {
                self.seed(&hit.query);
            }
            return;
        }
        if !filter_passes(&self.filter, hit) {
            return;
        }
        let cluster = match self.assigned.get(&hit.query) {
            Some(&idx) => idx,
            None => self.seed(&hit.query),
        };
        if self.assigned.contains_key(&hit.subject) {
            return;
        }
        if let Some(cap) = self.max_members {
            if self.clusters[cluster].len() >= cap {
                return;
            }
        }
        self.clusters[cluster].push(hit.subject.clone());
        self.assigned.insert(hit.subject.clone(), cluster);
    }

    /// Turn the accumulated clusters into a renumbered ClusterSet.
    pub fn finish(self, rootname: &str) -> Result<ClusterSet> {
        let mut set = ClusterSet::new();
        for (i, members) in self.clusters.into_iter().enumerate() {
            let mut family = SequenceFamily::new(format!("{rootname}_tmp{i}"));
            for id in members {
                family.add_member(Member::new(id))?;
            }
            set.insert(family)?;
        }
        set.renumber(rootname);
        Ok(set)
    }
}

// --------------------------------------------------
/// Read hits from a 12-column tab-separated blast report.
pub fn read_tabular<R: Read>(reader: R) -> impl Iterator<Item = Result<BlastHit>> {
    csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(false)
        .from_reader(reader)
        .into_deserialize::<BlastHit>()
        .map(|rec| rec.map_err(|e| Error::input(format!("bad blast record: {e}"))))
}

// --------------------------------------------------
/// Fast variant: tabular form only, parsed directly.
pub fn cluster_tabular<R: Read>(
    reader: R,
    rootname: &str,
    filter: Vec<FilterRule>,
    max_members: Option<usize>,
) -> Result<ClusterSet> {
    cluster_from_hits(read_tabular(reader), rootname, filter, max_members)
}

// --------------------------------------------------
/// Full variant: any hit source will do; the collaborator that parsed
/// the report feeds hits in report order.
pub fn cluster_from_hits<I>(
    hits: I,
    rootname: &str,
    filter: Vec<FilterRule>,
    max_members: Option<usize>,
) -> Result<ClusterSet>
where
    I: IntoIterator<Item = Result<BlastHit>>,
{
    let mut builder = ClusterBuilder::new(filter, max_members);
    for hit in hits {
        builder.observe(&hit?);
    }
    builder.finish(rootname)
}

// --------------------------------------------------
#[cfg(test)]
mod cluster_tests {
    use super::*;
    use crate::error::Result;
    use pretty_assertions::assert_eq;

    fn hit(query: &str, subject: &str, pct: f64, len: u64) -> BlastHit {
        BlastHit {
            query: query.to_string(),
            subject: subject.to_string(),
            pct_identity: pct,
            aln_length: len,
            mismatches: 0,
            gap_openings: 0,
            q_start: 1,
            q_end: len,
            s_start: 1,
            s_end: len,
            e_value: 1e-50,
            bit_score: 200.0,
        }
    }

    fn pct_and_len_filter() -> Vec<FilterRule> {
        vec![
            FilterRule::new(BlastField::PctIdentity, Comparator::Gt, 75),
            FilterRule::new(BlastField::AlnLength, Comparator::Gt, 60),
        ]
    }

    #[test]
    fn test_filter_admits_and_rejects() -> Result<()> {
        let hits = vec![
            Ok(hit("q1", "q1", 100.0, 120)),
            Ok(hit("q1", "s1", 95.0, 120)),
            Ok(hit("q1", "s2", 70.0, 40)),
        ];
        let set = cluster_from_hits(hits, "fam", pct_and_len_filter(), None)?;
        assert_eq!(set.len(), 1);
        let fam = set.get("fam_001").unwrap();
        assert_eq!(fam.member_ids(), vec!["q1", "s1"]);
        Ok(())
    }

    #[test]
    fn test_first_assignment_wins() -> Result<()> {
        let hits = vec![
            Ok(hit("q1", "s1", 95.0, 120)),
            Ok(hit("q2", "s1", 99.0, 200)),
            Ok(hit("q2", "s2", 99.0, 200)),
        ];
        let set = cluster_from_hits(hits, "fam", pct_and_len_filter(), None)?;
        assert_eq!(set.len(), 2);
        // s1 stays with q1; q2 only gets s2
        assert_eq!(set.family_of("s1"), set.family_of("q1"));
        assert_eq!(set.family_of("s2"), set.family_of("q2"));
        Ok(())
    }

    #[test]
    fn test_max_cluster_members_cap() -> Result<()> {
        let hits = vec![
            Ok(hit("q1", "s1", 95.0, 120)),
            Ok(hit("q1", "s2", 95.0, 120)),
            Ok(hit("s2", "s3", 95.0, 120)),
        ];
        let set = cluster_from_hits(hits, "fam", pct_and_len_filter(), Some(2))?;
        // s2 was rejected from q1's full cluster, then seeded its own
        assert_eq!(set.len(), 2);
        assert_eq!(set.family_of("s2"), set.family_of("s3"));
        assert_ne!(set.family_of("s2"), set.family_of("q1"));
        Ok(())
    }

    #[test]
    fn test_renumbering_descending_size() -> Result<()> {
        let hits = vec![
            Ok(hit("a", "a", 100.0, 100)),
            Ok(hit("b", "b1", 95.0, 120)),
            Ok(hit("b", "b2", 95.0, 120)),
        ];
        let set = cluster_from_hits(hits, "fam", pct_and_len_filter(), None)?;
        assert_eq!(set.family_ids(), vec!["fam_001", "fam_002"]);
        assert_eq!(set.get("fam_001").unwrap().len(), 3);
        assert_eq!(set.get("fam_002").unwrap().len(), 1);
        Ok(())
    }

    #[test]
    fn test_tabular_parse() -> Result<()> {
        let data = "q1\tq1\t100.00\t120\t0\t0\t1\t120\t1\t120\t1e-60\t222.0\n\
                    q1\ts1\t95.00\t120\t6\t0\t1\t120\t1\t120\t1e-50\t200.0\n";
        let hits: Vec<_> = read_tabular(data.as_bytes()).collect::<Result<_>>()?;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].subject, "s1");
        assert_eq!(hits[1].e_value, 1e-50);
        Ok(())
    }

    #[test]
    fn test_tabular_rejects_malformed() {
        let data = "q1\ts1\tnot-a-number\t120\t0\t0\t1\t120\t1\t120\t1e-50\t200.0\n";
        let hits: Vec<_> = read_tabular(data.as_bytes()).collect();
        assert!(hits[0].is_err());
    }

    #[test]
    fn test_filter_parsing_errors() {
        assert!(FilterRule::parse("no_such_field", ">", "10").is_err());
        assert!(FilterRule::parse("pct_identity", "!=", "10").is_err());
        assert!(FilterRule::parse("pct_identity", ">", "10.5").is_err());
        assert!(FilterRule::parse("pct_identity", ">", "10").is_ok());
    }
}
