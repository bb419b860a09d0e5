use crate::error::Result;
use crate::family::{ClusterSet, SequenceFamily, StrainTable};
use crate::tree::Tree;

// --------------------------------------------------
/// Exactly one way to pick the new root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RerootMode {
    /// Halfway along the longest leaf-to-leaf path.
    Midpoint,
    /// The leaf of the named strain farthest from the common ancestor.
    ReferenceStrain(String),
    /// The leaf whose member sequence is longest.
    LongestMember,
}

enum Target {
    Midpoint,
    Leaf(String),
}

// --------------------------------------------------
fn pick_target(
    fam: &SequenceFamily,
    strains: &StrainTable,
    mode: &RerootMode,
) -> Option<Target> {
    let tree = fam.tree.as_ref()?;
    match mode {
        RerootMode::Midpoint => Some(Target::Midpoint),
        RerootMode::ReferenceStrain(strain) => {
            let root = tree.root();
            let mut best: Option<(String, f64)> = None;
            for leaf in tree.leaves() {
                let label = match tree.label(leaf) {
                    Some(l) => l.to_string(),
                    None => continue,
                };
                if strains.strain_of(&label) != Some(strain.as_str()) {
                    continue;
                }
                let d = tree.distance(root, leaf);
                if best.as_ref().map_or(true, |(_, cur)| d > *cur) {
                    best = Some((label, d));
                }
            }
            best.map(|(label, _)| Target::Leaf(label))
        }
        RerootMode::LongestMember => {
            let mut best: Option<(String, usize)> = None;
            for leaf in tree.leaves() {
                let label = match tree.label(leaf) {
                    Some(l) => l.to_string(),
                    None => continue,
                };
                let len = fam.member(&label).map_or(0, |m| m.seq_len());
                if best.as_ref().map_or(true, |(_, cur)| len > *cur) {
                    best = Some((label, len));
                }
            }
            best.map(|(label, _)| Target::Leaf(label))
        }
    }
}

// --------------------------------------------------
fn apply_target(tree: &mut Tree, target: &Target) -> Result<bool> {
    match target {
        Target::Midpoint => Ok(tree.midpoint_reroot()),
        Target::Leaf(label) => {
            tree.reroot_at_leaf(label)?;
            Ok(true)
        }
    }
}

// --------------------------------------------------
/// Reroot one family's tree. `Ok(true)` when the tree was rerooted,
/// `Ok(false)` when the mode could not apply (no tree, degenerate tree,
/// or no leaf matching the reference strain) and the family is left
/// unchanged.
pub fn reroot_family(
    fam: &mut SequenceFamily,
    strains: &StrainTable,
    mode: &RerootMode,
) -> Result<bool> {
    let target = match pick_target(fam, strains, mode) {
        Some(t) => t,
        None => return Ok(false),
    };
    apply_target(fam.tree.as_mut().unwrap(), &target)
}

// --------------------------------------------------
/// Apply one mode across the set. Returns the ids of families whose
/// trees could not be rerooted; those are left unchanged.
pub fn reroot_families(set: &mut ClusterSet, mode: &RerootMode) -> Result<Vec<String>> {
    let mut failed = vec![];
    for id in set.family_ids() {
        // Decide on the immutable view, then apply to the family
        let target = pick_target(set.get(&id).unwrap(), &set.strains, mode);
        let rerooted = match target {
            Some(target) => {
                let fam = set.get_mut(&id).unwrap();
                apply_target(fam.tree.as_mut().unwrap(), &target)?
            }
            None => false,
        };
        if !rerooted {
            failed.push(id);
        }
    }
    Ok(failed)
}
