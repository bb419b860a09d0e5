use crate::align::{AlignedSeq, Alignment};
use crate::cluster::Comparator;
use crate::error::{Error, Result};
use crate::family::{ClusterSet, Composition};
use crate::overlap::{seed_and_extend, SeedExtendParams};
use std::str::FromStr;

// --------------------------------------------------
/// What every pruning operator reports back: families deleted outright,
/// and, per surviving family, the members it lost.
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub removed_families: Vec<String>,
    pub removed_members: Vec<(String, Vec<String>)>,
}

impl PruneReport {
    pub fn is_noop(&self) -> bool {
        self.removed_families.is_empty() && self.removed_members.is_empty()
    }
}

// --------------------------------------------------
/// Scalar alignment properties prune_by_align can threshold on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignProperty {
    Score,
    Length,
    NumResidues,
    NumSequences,
    PercentageIdentity,
}

impl FromStr for AlignProperty {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "score" => Ok(AlignProperty::Score),
            "length" => Ok(AlignProperty::Length),
            "num_residues" => Ok(AlignProperty::NumResidues),
            "num_sequences" => Ok(AlignProperty::NumSequences),
            "percentage_identity" => Ok(AlignProperty::PercentageIdentity),
            other => Err(Error::input(format!("unknown alignment property: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlignPredicate {
    pub prop: AlignProperty,
    pub op: Comparator,
    pub value: i64,
}

impl AlignPredicate {
    pub fn parse(prop: &str, op: &str, value: &str) -> Result<Self> {
        let value = value.trim().parse::<i64>().map_err(|_| {
            Error::input(format!("alignment threshold is not an integer: {value}"))
        })?;
        Ok(AlignPredicate {
            prop: prop.parse()?,
            op: op.parse()?,
            value,
        })
    }

    /// None when the property cannot be evaluated (no score metadata).
    fn matches(&self, aln: &Alignment) -> Option<bool> {
        let value = match self.prop {
            AlignProperty::Score => aln.score?,
            AlignProperty::Length => aln.width() as f64,
            AlignProperty::NumResidues => aln.num_residues() as f64,
            AlignProperty::NumSequences => aln.num_sequences() as f64,
            AlignProperty::PercentageIdentity => aln.percentage_identity(),
        };
        Some(self.op.compare(value, self.value as f64))
    }
}

// --------------------------------------------------
/// Remove whole families whose alignment matches any of the predicates.
/// Families without an alignment are never touched.
pub fn prune_by_align(set: &mut ClusterSet, predicates: &[AlignPredicate]) -> PruneReport {
    let mut report = PruneReport::default();
    for id in set.family_ids() {
        let doomed = set
            .get(&id)
            .and_then(|fam| fam.alignment.as_ref())
            .map_or(false, |aln| {
                predicates
                    .iter()
                    .any(|p| p.matches(aln).unwrap_or(false))
            });
        if doomed {
            set.remove(&id);
            report.removed_families.push(id);
        }
    }
    report
}

// --------------------------------------------------
/// Strain-pair constraint lists for prune_by_strains: pairs matching a
/// min_distance constraint are preferred closest-first, max_distance
/// farthest-first.
#[derive(Debug, Clone, Default)]
pub struct StrainPruneArgs {
    pub composition: Vec<(String, usize)>,
    pub min_distance: Vec<(String, String)>,
    pub max_distance: Vec<(String, String)>,
}

// --------------------------------------------------
/// Select members meeting the composition, preferring pairs by the
/// distance constraints. Satisfied families keep only the selection;
/// unsatisfiable families are deleted.
pub fn prune_by_strains(set: &mut ClusterSet, args: &StrainPruneArgs) -> Result<PruneReport> {
    if set.strains.is_empty() {
        return Err(Error::empty("no strains loaded"));
    }
    if args.composition.is_empty() {
        return Err(Error::empty("prune_by_strains needs a composition"));
    }
    let constraints: Vec<((String, String), bool)> = args
        .min_distance
        .iter()
        .map(|p| (p.clone(), true))
        .chain(args.max_distance.iter().map(|p| (p.clone(), false)))
        .collect();

    let mut report = PruneReport::default();
    for id in set.family_ids() {
        let selected = {
            let fam = set.get(&id).unwrap();
            let dist = fam.distance.as_ref().ok_or_else(|| {
                Error::empty(format!("family {id}: no distances available"))
            })?;
            let labels = dist.labels().to_vec();

            // Unordered member pairs with distance and strain-pair rank
            let mut pairs: Vec<(String, String, f64, usize, bool)> = vec![];
            for i in 0..labels.len() {
                for j in (i + 1)..labels.len() {
                    let a = &labels[i];
                    let b = &labels[j];
                    let d = dist.get_by_label(a, b).unwrap_or(0.0);
                    let sa = set.strains.strain_of(a);
                    let sb = set.strains.strain_of(b);
                    let (rank, ascending) = constraints
                        .iter()
                        .enumerate()
                        .find(|(_, ((x, y), _))| {
                            matches!((sa, sb), (Some(p), Some(q))
                                if (p == x.as_str() && q == y.as_str())
                                    || (p == y.as_str() && q == x.as_str()))
                        })
                        .map(|(r, (_, asc))| (r, *asc))
                        .unwrap_or((constraints.len(), true));
                    pairs.push((a.clone(), b.clone(), d, rank, ascending));
                }
            }
            pairs.sort_by(|x, y| {
                x.3.cmp(&y.3).then_with(|| {
                    if x.3 == constraints.len() {
                        // Unconstrained pairs keep their original order
                        std::cmp::Ordering::Equal
                    } else if x.4 {
                        x.2.partial_cmp(&y.2).unwrap_or(std::cmp::Ordering::Equal)
                    } else {
                        y.2.partial_cmp(&x.2).unwrap_or(std::cmp::Ordering::Equal)
                    }
                })
            });

            let mut comp = Composition::new(&args.composition);
            for (a, b, ..) in &pairs {
                comp.push(a, set.strains.strain_of(a));
                comp.push(b, set.strains.strain_of(b));
                if comp.is_satisfied() {
                    break;
                }
            }
            if comp.is_satisfied() {
                Some(comp.selected().to_vec())
            } else {
                None
            }
        };

        match selected {
            Some(keep) => {
                let fam = set.get_mut(&id).unwrap();
                let removed = fam.retain_members(&keep);
                for m in &removed {
                    set.unindex_member(m);
                }
                if !removed.is_empty() {
                    report.removed_members.push((id, removed));
                }
            }
            None => {
                set.remove(&id);
                report.removed_families.push(id);
            }
        }
    }
    Ok(report)
}

// --------------------------------------------------
#[derive(Debug, Clone, Default)]
pub struct OverlapPruneArgs {
    pub composition: Vec<(String, usize)>,
    pub seed: SeedExtendParams,
    /// Cut the replacement alignment down to the overlap window.
    pub trim: bool,
    /// Drop all-gap columns from the replacement alignment.
    pub compact: bool,
}

// --------------------------------------------------
/// Replace each family's alignment with its best jointly-overlapping
/// sub-alignment meeting the composition; families with no valid
/// selection are deleted. Members stay on the family either way.
pub fn prune_by_overlaps(set: &mut ClusterSet, args: &OverlapPruneArgs) -> Result<PruneReport> {
    if set.strains.is_empty() {
        return Err(Error::empty("no strains loaded"));
    }
    if args.composition.is_empty() {
        return Err(Error::empty("prune_by_overlaps needs a composition"));
    }
    let mut report = PruneReport::default();
    for id in set.family_ids() {
        let outcome = {
            let fam = set.get(&id).unwrap();
            match &fam.alignment {
                Some(aln) => Some(build_sub_alignment(
                    aln,
                    seed_and_extend(aln, &set.strains, &args.composition, &args.seed),
                    args,
                )),
                None => None,
            }
        };
        match outcome {
            None => {}
            Some(None) => {
                set.remove(&id);
                report.removed_families.push(id);
            }
            Some(Some((sub, dropped))) => {
                let fam = set.get_mut(&id).unwrap();
                fam.set_alignment(sub)?;
                if !dropped.is_empty() {
                    report.removed_members.push((id, dropped));
                }
            }
        }
    }
    Ok(report)
}

// --------------------------------------------------
fn build_sub_alignment(
    aln: &Alignment,
    selection: Option<crate::overlap::Selection>,
    args: &OverlapPruneArgs,
) -> Option<(Alignment, Vec<String>)> {
    let selection = selection?;
    let (start, end) = selection.window;
    let mut sub = Alignment::new();
    sub.description = aln.description.clone();
    sub.source = aln.source.clone();
    let mut dropped = vec![];
    for row in aln.rows() {
        if !selection.ids.iter().any(|id| *id == row.id) {
            dropped.push(row.id.clone());
            continue;
        }
        let gapped = if args.trim {
            row.columns(start, end)
        } else {
            row.gapped.clone()
        };
        sub.push_row(AlignedSeq::new(&row.id, gapped, row.strand)).ok()?;
    }
    if args.trim {
        sub.consensus = aln
            .consensus
            .as_ref()
            .map(|c| c.chars().skip(start - 1).take(end - start + 1).collect());
    } else {
        sub.consensus = aln.consensus.clone();
    }
    if args.compact {
        sub.compact_columns();
    }
    Some((sub, dropped))
}

// --------------------------------------------------
/// Remove families whose bootstrap consensus carries any non-root node
/// with support strictly below the cutoff.
pub fn prune_by_bootstrap(set: &mut ClusterSet, cutoff: f64) -> PruneReport {
    let mut report = PruneReport::default();
    for id in set.family_ids() {
        let doomed = set
            .get(&id)
            .and_then(|fam| fam.bootstrap.as_ref())
            .map_or(false, |tree| {
                tree.internal_supports().iter().any(|&s| s < cutoff)
            });
        if doomed {
            set.remove(&id);
            report.removed_families.push(id);
        }
    }
    report
}

// --------------------------------------------------
#[cfg(test)]
mod prune_tests {
    use super::*;
    use crate::align::{AlignedSeq, Member, Strand};
    use crate::distance::DistanceMatrix;
    use crate::error::Result;
    use crate::family::SequenceFamily;
    use crate::tree::Tree;
    use pretty_assertions::assert_eq;

    fn set_with_alignment(score: Option<f64>) -> Result<ClusterSet> {
        let mut set = ClusterSet::new();
        let mut fam = SequenceFamily::new("fam_001");
        fam.add_member(Member::with_seq("a", "ACGT"))?;
        fam.add_member(Member::with_seq("b", "ACGA"))?;
        let mut aln = Alignment::new();
        aln.push_row(AlignedSeq::new("a", "ACGT", Strand::Forward))?;
        aln.push_row(AlignedSeq::new("b", "ACGA", Strand::Forward))?;
        aln.score = score;
        fam.set_alignment(aln)?;
        set.insert(fam)?;
        Ok(set)
    }

    #[test]
    fn test_prune_by_align_disjunction() -> Result<()> {
        let mut set = set_with_alignment(Some(40.0))?;
        let preds = vec![
            AlignPredicate::parse("length", ">", "100")?,
            AlignPredicate::parse("score", "<", "50")?,
        ];
        let report = prune_by_align(&mut set, &preds);
        assert_eq!(report.removed_families, vec!["fam_001"]);
        assert!(set.is_empty());
        Ok(())
    }

    #[test]
    fn test_prune_by_align_skips_unaligned() -> Result<()> {
        let mut set = ClusterSet::new();
        let mut fam = SequenceFamily::new("f");
        fam.add_member(Member::new("a"))?;
        set.insert(fam)?;
        let preds = vec![AlignPredicate::parse("num_sequences", "<", "5")?];
        let report = prune_by_align(&mut set, &preds);
        assert!(report.is_noop());
        assert_eq!(set.len(), 1);
        Ok(())
    }

    #[test]
    fn test_prune_by_strains_selects_constrained_pairs() -> Result<()> {
        // Five members, strains A,A,B,B,C; min_distance [A,B] then [A,C]
        let mut set = ClusterSet::new();
        let mut fam = SequenceFamily::new("fam_001");
        let ids = ["A1", "A2", "B1", "B2", "C1"];
        let mut aln = Alignment::new();
        for id in ids {
            fam.add_member(Member::with_seq(id, "ACGT"))?;
            aln.push_row(AlignedSeq::new(id, "ACGT", Strand::Forward))?;
        }
        fam.set_alignment(aln)?;
        let mut dist =
            DistanceMatrix::with_labels(ids.iter().map(|s| s.to_string()).collect())?;
        for i in 0..5 {
            for j in (i + 1)..5 {
                dist.set(i, j, 0.9);
            }
        }
        dist.set(0, 2, 0.1); // (A1,B1)
        dist.set(0, 4, 0.2); // (A1,C1)
        dist.set(1, 3, 0.3); // (A2,B2)
        fam.distance = Some(dist);
        set.insert(fam)?;
        set.strains.insert("A1", "A");
        set.strains.insert("A2", "A");
        set.strains.insert("B1", "B");
        set.strains.insert("B2", "B");
        set.strains.insert("C1", "C");

        let args = StrainPruneArgs {
            composition: vec![
                ("A".to_string(), 1),
                ("B".to_string(), 1),
                ("C".to_string(), 1),
            ],
            min_distance: vec![
                ("A".to_string(), "B".to_string()),
                ("A".to_string(), "C".to_string()),
            ],
            max_distance: vec![],
        };
        let report = prune_by_strains(&mut set, &args)?;
        assert!(report.removed_families.is_empty());
        assert_eq!(
            report.removed_members,
            vec![("fam_001".to_string(), vec!["A2".to_string(), "B2".to_string()])]
        );
        let fam = set.get("fam_001").unwrap();
        assert_eq!(fam.member_ids(), vec!["A1", "B1", "C1"]);
        assert!(fam.distance.is_none());
        Ok(())
    }

    #[test]
    fn test_prune_by_strains_deletes_unsatisfiable() -> Result<()> {
        let mut set = set_with_alignment(None)?;
        set.strains.insert("a", "A");
        set.strains.insert("b", "A");
        let fam = set.get_mut("fam_001").unwrap();
        fam.distance = Some(DistanceMatrix::from_alignment(
            fam.alignment.as_ref().unwrap(),
        )?);
        let args = StrainPruneArgs {
            composition: vec![("A".to_string(), 1), ("B".to_string(), 1)],
            ..Default::default()
        };
        let report = prune_by_strains(&mut set, &args)?;
        assert_eq!(report.removed_families, vec!["fam_001"]);
        assert!(set.is_empty());
        Ok(())
    }

    #[test]
    fn test_prune_by_overlaps_replaces_alignment() -> Result<()> {
        let mut set = ClusterSet::new();
        let mut fam = SequenceFamily::new("fam_001");
        fam.add_member(Member::with_seq("r1", "AAAAACCCCC"))?;
        fam.add_member(Member::with_seq("r2", "AACCCCCGG"))?;
        let mut aln = Alignment::new();
        aln.push_row(AlignedSeq::new("r1", "AAAAACCCCC--", Strand::Forward))?;
        aln.push_row(AlignedSeq::new("r2", "---AACCCCCGG", Strand::Forward))?;
        fam.set_alignment(aln)?;
        set.insert(fam)?;
        set.strains.insert("r1", "A");
        set.strains.insert("r2", "B");

        let args = OverlapPruneArgs {
            composition: vec![("A".to_string(), 1), ("B".to_string(), 1)],
            trim: true,
            ..Default::default()
        };
        let report = prune_by_overlaps(&mut set, &args)?;
        assert!(report.is_noop());
        let aln = set.get("fam_001").unwrap().alignment.as_ref().unwrap();
        assert_eq!(aln.width(), 7);
        assert_eq!(aln.row("r1").unwrap().gapped, "AACCCCC");
        assert_eq!(aln.row("r2").unwrap().gapped, "AACCCCC");
        Ok(())
    }

    #[test]
    fn test_prune_by_bootstrap_cutoff() -> Result<()> {
        let mut set = set_with_alignment(None)?;
        let fam = set.get_mut("fam_001").unwrap();
        fam.bootstrap = Some(Tree::from_newick(
            "(((x:1,y:1)80:1,(z:1,w:1)55:1)90:1,v:1);",
        )?);
        let report = prune_by_bootstrap(&mut set, 60.0);
        assert_eq!(report.removed_families, vec!["fam_001"]);

        let mut set = set_with_alignment(None)?;
        let fam = set.get_mut("fam_001").unwrap();
        fam.bootstrap = Some(Tree::from_newick(
            "(((x:1,y:1)80:1,(z:1,w:1)65:1)90:1,v:1);",
        )?);
        let report = prune_by_bootstrap(&mut set, 60.0);
        assert!(report.is_noop());
        assert_eq!(set.len(), 1);
        Ok(())
    }
}
