use crate::align::{Alignment, Member};
use crate::distance::DistanceMatrix;
use crate::error::{Error, Result};
use crate::tree::Tree;
use std::collections::HashMap;
use std::io::BufRead;

// --------------------------------------------------
/// Aggregate for one putative gene family: the member set plus whatever
/// downstream artifacts have been computed so far. Mutating the member
/// set invalidates the artifacts unless an operator says otherwise.
#[derive(Debug, Clone, Default)]
pub struct SequenceFamily {
    pub id: String,
    members: Vec<Member>,
    pub alignment: Option<Alignment>,
    pub distance: Option<DistanceMatrix>,
    pub tree: Option<Tree>,
    pub bootstrap: Option<Tree>,
}

// --------------------------------------------------
impl SequenceFamily {
    pub fn new(id: impl Into<String>) -> Self {
        SequenceFamily {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn member_mut(&mut self, id: &str) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.id == id)
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.iter().any(|m| m.id == id)
    }

    pub fn add_member(&mut self, member: Member) -> Result<()> {
        if self.contains(&member.id) {
            return Err(Error::input(format!(
                "family {} already holds member {}",
                self.id, member.id
            )));
        }
        self.members.push(member);
        Ok(())
    }

    /// Remove the named members from the family and from the alignment
    /// rows, dropping distance, tree, and bootstrap. The alignment object
    /// itself survives minus the removed rows. Returns removed ids.
    pub fn remove_members(&mut self, ids: &[String]) -> Vec<String> {
        let mut removed = vec![];
        self.members.retain(|m| {
            if ids.iter().any(|id| *id == m.id) {
                removed.push(m.id.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            if let Some(aln) = &mut self.alignment {
                aln.remove_rows(&removed);
            }
            self.invalidate_derived();
        }
        removed
    }

    /// Keep only the named members; everything else is removed as in
    /// `remove_members`.
    pub fn retain_members(&mut self, ids: &[String]) -> Vec<String> {
        let drop: Vec<String> = self
            .members
            .iter()
            .filter(|m| !ids.iter().any(|id| *id == m.id))
            .map(|m| m.id.clone())
            .collect();
        self.remove_members(&drop)
    }

    /// Install an alignment, enforcing that its rows reference known
    /// members. A fresh alignment invalidates everything downstream.
    pub fn set_alignment(&mut self, aln: Alignment) -> Result<()> {
        for row in aln.rows() {
            if !self.contains(&row.id) {
                return Err(Error::consistency(format!(
                    "alignment row {} is not a member of family {}",
                    row.id, self.id
                )));
            }
        }
        self.alignment = Some(aln);
        self.distance = None;
        self.tree = None;
        self.bootstrap = None;
        Ok(())
    }

    /// Drop distance, tree, and bootstrap.
    pub fn invalidate_derived(&mut self) {
        self.distance = None;
        self.tree = None;
        self.bootstrap = None;
    }

    /// Cross-entity invariants: alignment rows are a subset of members,
    /// distance labels equal alignment rows, tree leaves equal alignment
    /// rows.
    pub fn check_consistency(&self) -> Result<()> {
        if let Some(aln) = &self.alignment {
            for row in aln.rows() {
                if !self.contains(&row.id) {
                    return Err(Error::consistency(format!(
                        "family {}: alignment row {} has no member",
                        self.id, row.id
                    )));
                }
            }
            let row_ids = aln.member_ids();
            if let Some(dist) = &self.distance {
                let mut labels: Vec<&str> = dist.labels().iter().map(String::as_str).collect();
                let mut rows: Vec<&str> = row_ids.iter().map(String::as_str).collect();
                labels.sort_unstable();
                rows.sort_unstable();
                if labels != rows {
                    return Err(Error::consistency(format!(
                        "family {}: distance labels diverge from alignment rows",
                        self.id
                    )));
                }
            }
            if let Some(tree) = &self.tree {
                let mut leaves = tree.leaf_labels();
                let mut rows: Vec<String> = row_ids.clone();
                leaves.sort_unstable();
                rows.sort_unstable();
                if leaves != rows {
                    return Err(Error::consistency(format!(
                        "family {}: tree leaves diverge from alignment rows",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }
}

// --------------------------------------------------
/// Member-id to strain label mapping.
#[derive(Debug, Clone, Default)]
pub struct StrainTable {
    map: HashMap<String, String>,
}

impl StrainTable {
    pub fn new() -> Self {
        StrainTable::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn insert(&mut self, member: impl Into<String>, strain: impl Into<String>) {
        self.map.insert(member.into(), strain.into());
    }

    pub fn strain_of(&self, member: &str) -> Option<&str> {
        self.map.get(member).map(String::as_str)
    }

    /// Two tab-separated columns: `<member-id>\t<strain-label>`.
    pub fn read(input: &mut impl BufRead) -> Result<Self> {
        let mut table = StrainTable::new();
        for (lineno, line) in input.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.splitn(2, '\t');
            let member = fields.next().unwrap_or_default().trim();
            let strain = fields.next().map(str::trim).unwrap_or_default();
            if member.is_empty() || strain.is_empty() {
                return Err(Error::input(format!(
                    "strain table line {}: expected <member>\\t<strain>",
                    lineno + 1
                )));
            }
            table.insert(member, strain);
        }
        Ok(table)
    }
}

// --------------------------------------------------
/// Multiset over strain labels: how many members of each strain a
/// selection must contain. A value object, reset between families.
#[derive(Debug, Clone, Default)]
pub struct Composition {
    required: Vec<(String, usize)>,
    counts: HashMap<String, usize>,
    selected: Vec<String>,
}

impl Composition {
    pub fn new(required: &[(String, usize)]) -> Self {
        Composition {
            required: required.to_vec(),
            counts: HashMap::new(),
            selected: vec![],
        }
    }

    /// Offer a member. Accepted only while its strain is still below the
    /// required count; a member already selected is not re-offered.
    pub fn push(&mut self, member: &str, strain: Option<&str>) -> bool {
        if self.selected.iter().any(|m| m == member) {
            return false;
        }
        let strain = match strain {
            Some(s) => s,
            None => return false,
        };
        let need = match self.required.iter().find(|(s, _)| s == strain) {
            Some((_, n)) => *n,
            None => return false,
        };
        let have = self.counts.entry(strain.to_string()).or_insert(0);
        if *have >= need {
            return false;
        }
        *have += 1;
        self.selected.push(member.to_string());
        true
    }

    pub fn is_satisfied(&self) -> bool {
        self.required
            .iter()
            .all(|(strain, need)| self.counts.get(strain).copied().unwrap_or(0) >= *need)
    }

    pub fn selected(&self) -> &[String] {
        &self.selected
    }

    pub fn reset(&mut self) {
        self.counts.clear();
        self.selected.clear();
    }
}

// --------------------------------------------------
/// The set of families under processing, with the strain table and a
/// member-id index. Families are owned exclusively here.
#[derive(Debug, Clone, Default)]
pub struct ClusterSet {
    families: Vec<SequenceFamily>,
    index: HashMap<String, usize>,
    member_index: HashMap<String, String>,
    pub strains: StrainTable,
}

// --------------------------------------------------
impl ClusterSet {
    pub fn new() -> Self {
        ClusterSet::default()
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    pub fn family_ids(&self) -> Vec<String> {
        self.families.iter().map(|f| f.id.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&SequenceFamily> {
        self.index.get(id).map(|&i| &self.families[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SequenceFamily> {
        self.index.get(id).copied().map(move |i| &mut self.families[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &SequenceFamily> {
        self.families.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SequenceFamily> {
        self.families.iter_mut()
    }

    /// Mutable access for per-family fan-out. Callers must leave family
    /// ids alone; the id index is not rebuilt.
    pub fn families_mut(&mut self) -> &mut [SequenceFamily] {
        &mut self.families
    }

    /// Family holding a member, if any.
    pub fn family_of(&self, member: &str) -> Option<&str> {
        self.member_index.get(member).map(String::as_str)
    }

    pub fn insert(&mut self, family: SequenceFamily) -> Result<()> {
        if self.index.contains_key(&family.id) {
            return Err(Error::input(format!("duplicate family id: {}", family.id)));
        }
        for m in family.members() {
            if let Some(owner) = self.member_index.get(&m.id) {
                return Err(Error::input(format!(
                    "member {} already belongs to family {owner}",
                    m.id
                )));
            }
        }
        for m in family.members() {
            self.member_index.insert(m.id.clone(), family.id.clone());
        }
        self.index.insert(family.id.clone(), self.families.len());
        self.families.push(family);
        Ok(())
    }

    /// Remove a family outright, dropping its downstream artifacts with it.
    pub fn remove(&mut self, id: &str) -> Option<SequenceFamily> {
        let pos = self.index.remove(id)?;
        let family = self.families.remove(pos);
        for m in family.members() {
            self.member_index.remove(&m.id);
        }
        for (i, f) in self.families.iter().enumerate().skip(pos) {
            self.index.insert(f.id.clone(), i);
        }
        Some(family)
    }

    /// Forget a member in the member index (after operators drop it from
    /// its family).
    pub fn unindex_member(&mut self, member: &str) {
        self.member_index.remove(member);
    }

    /// Record a member in the member index (after operators graft it
    /// onto a family).
    pub fn index_member(&mut self, member: impl Into<String>, family: impl Into<String>) {
        self.member_index.insert(member.into(), family.into());
    }

    /// Renumber families by descending member count, stable on the
    /// current order, as `<rootname>_<NNN>` with zero padding.
    pub fn renumber(&mut self, rootname: &str) {
        self.families.sort_by(|a, b| b.len().cmp(&a.len()));
        let width = std::cmp::max(3, self.families.len().to_string().len());
        self.index.clear();
        self.member_index.clear();
        for (i, family) in self.families.iter_mut().enumerate() {
            family.id = format!("{rootname}_{:0width$}", i + 1, width = width);
            self.index.insert(family.id.clone(), i);
            for m in family.members() {
                self.member_index.insert(m.id.clone(), family.id.clone());
            }
        }
    }
}

// --------------------------------------------------
#[cfg(test)]
mod family_tests {
    use super::*;
    use crate::align::{AlignedSeq, Strand};
    use crate::error::Result;
    use pretty_assertions::assert_eq;

    fn family() -> Result<SequenceFamily> {
        let mut fam = SequenceFamily::new("fam_001");
        fam.add_member(Member::with_seq("a", "ACGT"))?;
        fam.add_member(Member::with_seq("b", "ACGA"))?;
        fam.add_member(Member::with_seq("c", "ACGC"))?;
        let mut aln = Alignment::new();
        aln.push_row(AlignedSeq::new("a", "ACGT", Strand::Forward))?;
        aln.push_row(AlignedSeq::new("b", "ACGA", Strand::Forward))?;
        aln.push_row(AlignedSeq::new("c", "ACGC", Strand::Forward))?;
        fam.set_alignment(aln)?;
        Ok(fam)
    }

    #[test]
    fn test_remove_members_invalidates_downstream() -> Result<()> {
        let mut fam = family()?;
        fam.distance = Some(DistanceMatrix::from_alignment(
            fam.alignment.as_ref().unwrap(),
        )?);
        let removed = fam.remove_members(&["b".to_string(), "nope".to_string()]);
        assert_eq!(removed, vec!["b"]);
        assert_eq!(fam.len(), 2);
        assert!(fam.distance.is_none());
        assert_eq!(fam.alignment.as_ref().unwrap().num_sequences(), 2);
        fam.check_consistency()?;
        Ok(())
    }

    #[test]
    fn test_set_alignment_rejects_strangers() -> Result<()> {
        let mut fam = SequenceFamily::new("f");
        fam.add_member(Member::new("a"))?;
        let mut aln = Alignment::new();
        aln.push_row(AlignedSeq::new("z", "ACGT", Strand::Forward))?;
        assert!(fam.set_alignment(aln).is_err());
        Ok(())
    }

    #[test]
    fn test_composition_push_rules() {
        let required = vec![("A".to_string(), 1), ("B".to_string(), 1)];
        let mut comp = Composition::new(&required);
        assert!(comp.push("a1", Some("A")));
        assert!(!comp.push("a1", Some("A")), "no double selection");
        assert!(!comp.push("a2", Some("A")), "strain A already satisfied");
        assert!(!comp.push("x1", Some("X")), "strain not in composition");
        assert!(!comp.is_satisfied());
        assert!(comp.push("b1", Some("B")));
        assert!(comp.is_satisfied());
        assert_eq!(comp.selected(), &["a1".to_string(), "b1".to_string()]);
    }

    #[test]
    fn test_renumber_orders_by_size() -> Result<()> {
        let mut set = ClusterSet::new();
        let mut small = SequenceFamily::new("tmp_1");
        small.add_member(Member::new("s1"))?;
        let mut big = SequenceFamily::new("tmp_2");
        big.add_member(Member::new("b1"))?;
        big.add_member(Member::new("b2"))?;
        set.insert(small)?;
        set.insert(big)?;
        set.renumber("fam");
        assert_eq!(set.family_ids(), vec!["fam_001", "fam_002"]);
        assert_eq!(set.get("fam_001").unwrap().len(), 2);
        assert_eq!(set.family_of("s1"), Some("fam_002"));
        Ok(())
    }

    #[test]
    fn test_strain_table_read() -> Result<()> {
        let text = "m1\tA\nm2\tB\n";
        let table = StrainTable::read(&mut text.as_bytes())?;
        assert_eq!(table.strain_of("m1"), Some("A"));
        assert_eq!(table.strain_of("m3"), None);
        let bad = "m1 only-one-column\n";
        assert!(StrainTable::read(&mut bad.as_bytes()).is_err());
        Ok(())
    }
}
