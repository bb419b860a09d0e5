use crate::error::{Error, Result};
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;

const EPS: f64 = 1e-9;

// --------------------------------------------------
#[derive(Debug, Clone, Default)]
pub struct NodeData {
    pub label: Option<String>,
    pub support: Option<f64>,
}

/// Rooted labelled tree with branch lengths. The topology lives in an
/// undirected graph; the root index orients it. Re-rooting is therefore
/// graph surgery plus moving the root, never a rebuild.
#[derive(Debug, Clone)]
pub struct Tree {
    graph: UnGraph<NodeData, f64>,
    root: NodeIndex,
    has_lengths: bool,
}

// --------------------------------------------------
impl Tree {
    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn has_branch_lengths(&self) -> bool {
        self.has_lengths
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_leaf(&self, node: NodeIndex) -> bool {
        self.graph.neighbors(node).count() <= 1
    }

    pub fn label(&self, node: NodeIndex) -> Option<&str> {
        self.graph[node].label.as_deref()
    }

    pub fn support(&self, node: NodeIndex) -> Option<f64> {
        self.graph[node].support
    }

    /// Leaf nodes in graph insertion order, which for a parsed tree is
    /// newick reading order.
    pub fn leaves(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&n| self.is_leaf(n))
            .collect()
    }

    pub fn leaf_labels(&self) -> Vec<String> {
        self.leaves()
            .iter()
            .filter_map(|&n| self.label(n).map(str::to_string))
            .collect()
    }

    pub fn find_leaf(&self, label: &str) -> Option<NodeIndex> {
        self.leaves()
            .into_iter()
            .find(|&n| self.label(n) == Some(label))
    }

    /// Node path between two nodes, endpoints included.
    pub fn path(&self, from: NodeIndex, to: NodeIndex) -> Vec<NodeIndex> {
        // Nodes are never removed, so indices stay compact
        let mut parent: Vec<Option<NodeIndex>> = vec![None; self.graph.node_count()];
        let mut seen = vec![false; self.graph.node_count()];
        let mut stack = vec![from];
        seen[from.index()] = true;
        while let Some(n) = stack.pop() {
            if n == to {
                break;
            }
            for m in self.graph.neighbors(n) {
                if !seen[m.index()] {
                    seen[m.index()] = true;
                    parent[m.index()] = Some(n);
                    stack.push(m);
                }
            }
        }
        let mut path = vec![to];
        let mut cur = to;
        while cur != from {
            match parent[cur.index()] {
                Some(p) => {
                    path.push(p);
                    cur = p;
                }
                None => return vec![],
            }
        }
        path.reverse();
        path
    }

    /// Branch-length distance between two nodes.
    pub fn distance(&self, from: NodeIndex, to: NodeIndex) -> f64 {
        self.path(from, to)
            .windows(2)
            .map(|w| {
                self.graph
                    .find_edge(w[0], w[1])
                    .map_or(0.0, |e| self.graph[e])
            })
            .sum()
    }

    /// Bootstrap support values on internal nodes, the root excluded.
    pub fn internal_supports(&self) -> Vec<f64> {
        self.graph
            .node_indices()
            .filter(|&n| n != self.root && !self.is_leaf(n))
            .filter_map(|n| self.graph[n].support)
            .collect()
    }

    /// Reroot at an existing node.
    pub fn reroot_at(&mut self, node: NodeIndex) {
        self.root = node;
    }

    /// Rename a leaf label, e.g. to undo phylip's ten-character
    /// truncation. Returns false when no leaf carries the old label.
    pub fn rename_leaf(&mut self, old: &str, new: &str) -> bool {
        match self.find_leaf(old) {
            Some(node) => {
                self.graph[node].label = Some(new.to_string());
                true
            }
            None => false,
        }
    }

    /// Insert a fresh root adjacent to the named leaf, at branch length
    /// zero from it; the leaf's old branch length moves to the other side
    /// of the insertion point.
    pub fn reroot_at_leaf(&mut self, leaf_label: &str) -> Result<()> {
        let leaf = self
            .find_leaf(leaf_label)
            .ok_or_else(|| Error::input(format!("no leaf named {leaf_label}")))?;
        let (edge, neighbor) = {
            let mut edges = self.graph.edges(leaf);
            let e = edges
                .next()
                .ok_or_else(|| Error::consistency(format!("leaf {leaf_label} is detached")))?;
            (e.id(), if e.source() == leaf { e.target() } else { e.source() })
        };
        let weight = self.graph[edge];
        self.graph.remove_edge(edge);
        let new_root = self.graph.add_node(NodeData::default());
        self.graph.add_edge(new_root, leaf, 0.0);
        self.graph.add_edge(new_root, neighbor, weight);
        self.root = new_root;
        Ok(())
    }

    /// Midpoint re-rooting: place the root halfway along the longest
    /// leaf-to-leaf path. Returns false (and leaves the tree alone) on
    /// degenerate trees or when branch lengths are missing.
    pub fn midpoint_reroot(&mut self) -> bool {
        if !self.has_lengths {
            return false;
        }
        let leaves = self.leaves();
        if leaves.len() < 2 {
            return false;
        }

        let mut best: Option<(NodeIndex, NodeIndex, f64)> = None;
        for (i, &a) in leaves.iter().enumerate() {
            for &b in &leaves[i + 1..] {
                let d = self.distance(a, b);
                if best.map_or(true, |(_, _, cur)| d > cur + EPS) {
                    best = Some((a, b, d));
                }
            }
        }
        let (a, b, total) = match best {
            Some(t) if t.2 > EPS => t,
            _ => return false,
        };

        let half = total / 2.0;
        let path = self.path(a, b);
        let mut cum = 0.0;
        for w in path.windows(2) {
            let edge = match self.graph.find_edge(w[0], w[1]) {
                Some(e) => e,
                None => return false,
            };
            let len = self.graph[edge];
            if cum + len >= half - EPS {
                let offset = half - cum;
                if offset <= EPS {
                    self.root = w[0];
                } else if len - offset <= EPS {
                    self.root = w[1];
                } else {
                    self.graph.remove_edge(edge);
                    let mid = self.graph.add_node(NodeData::default());
                    self.graph.add_edge(w[0], mid, offset);
                    self.graph.add_edge(mid, w[1], len - offset);
                    self.root = mid;
                }
                return true;
            }
            cum += len;
        }
        false
    }

    /// Canonical topology signature: leaf labels, nested parens, no
    /// branch lengths, children sorted. Two trees get the same key
    /// exactly when their rooted topologies match.
    pub fn topology_key(&self) -> String {
        self.topology_of(self.root, None)
    }

    fn topology_of(&self, node: NodeIndex, parent: Option<NodeIndex>) -> String {
        let mut children: Vec<String> = self
            .graph
            .neighbors(node)
            .filter(|&n| Some(n) != parent)
            .map(|n| self.topology_of(n, Some(node)))
            .collect();
        if children.is_empty() {
            self.graph[node].label.clone().unwrap_or_default()
        } else {
            children.sort();
            format!("({})", children.join(","))
        }
    }

    // --------------------------------------------------
    pub fn from_newick(text: &str) -> Result<Self> {
        let mut parser = NewickParser {
            chars: text.chars().collect(),
            pos: 0,
            graph: UnGraph::new_undirected(),
            missing: 0,
        };
        let (root, _) = parser.subtree()?;
        parser.skip_ws();
        if parser.next_char() != Some(';') {
            return Err(Error::input("newick tree must end with ';'"));
        }
        Ok(Tree {
            has_lengths: parser.missing == 0,
            graph: parser.graph,
            root,
        })
    }

    pub fn to_newick(&self) -> String {
        let mut out = String::new();
        self.write_node(self.root, None, &mut out);
        out.push(';');
        out
    }

    fn write_node(&self, node: NodeIndex, parent: Option<NodeIndex>, out: &mut String) {
        let children: Vec<NodeIndex> = self
            .graph
            .neighbors(node)
            .filter(|&n| Some(n) != parent)
            .collect();
        if children.is_empty() {
            if let Some(label) = &self.graph[node].label {
                out.push_str(label);
            }
        } else {
            out.push('(');
            // neighbors() iterates newest-first; reverse to keep input order
            for (i, &child) in children.iter().rev().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                self.write_node(child, Some(node), out);
            }
            out.push(')');
            let data = &self.graph[node];
            if let Some(support) = data.support {
                out.push_str(&format!("{support}"));
            } else if let Some(label) = &data.label {
                out.push_str(label);
            }
        }
        if let Some(p) = parent {
            if self.has_lengths {
                if let Some(e) = self.graph.find_edge(p, node) {
                    out.push_str(&format!(":{}", self.graph[e]));
                }
            }
        }
    }
}

// --------------------------------------------------
struct NewickParser {
    chars: Vec<char>,
    pos: usize,
    graph: UnGraph<NodeData, f64>,
    missing: usize,
}

impl NewickParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn next_char(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn subtree(&mut self) -> Result<(NodeIndex, Option<f64>)> {
        self.skip_ws();
        if self.peek() == Some('(') {
            self.pos += 1;
            let mut children = vec![self.subtree()?];
            loop {
                self.skip_ws();
                match self.peek() {
                    Some(',') => {
                        self.pos += 1;
                        children.push(self.subtree()?);
                    }
                    Some(')') => {
                        self.pos += 1;
                        break;
                    }
                    other => {
                        return Err(Error::input(format!(
                            "newick: expected ',' or ')', found {other:?}"
                        )))
                    }
                }
            }
            let label = self.label();
            let length = self.length()?;
            // A bare number on an internal node is a bootstrap support
            let data = match label {
                Some(l) => match l.parse::<f64>() {
                    Ok(support) => NodeData {
                        label: None,
                        support: Some(support),
                    },
                    Err(_) => NodeData {
                        label: Some(l),
                        support: None,
                    },
                },
                None => NodeData::default(),
            };
            let node = self.graph.add_node(data);
            for (child, len) in children {
                if len.is_none() {
                    self.missing += 1;
                }
                self.graph.add_edge(node, child, len.unwrap_or(0.0));
            }
            Ok((node, length))
        } else {
            let label = self
                .label()
                .ok_or_else(|| Error::input("newick: expected a leaf label"))?;
            let length = self.length()?;
            let node = self.graph.add_node(NodeData {
                label: Some(label),
                support: None,
            });
            Ok((node, length))
        }
    }

    fn label(&mut self) -> Option<String> {
        self.skip_ws();
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if matches!(c, '(' | ')' | ',' | ':' | ';') || c.is_whitespace() {
                break;
            }
            out.push(c);
            self.pos += 1;
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    fn length(&mut self) -> Result<Option<f64>> {
        self.skip_ws();
        if self.peek() != Some(':') {
            return Ok(None);
        }
        self.pos += 1;
        self.skip_ws();
        let mut num = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E') {
                num.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        num.parse::<f64>()
            .map(Some)
            .map_err(|_| Error::input(format!("newick: bad branch length: {num}")))
    }
}

// --------------------------------------------------
#[cfg(test)]
mod tree_tests {
    use super::*;
    use crate::error::Result;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_and_emit() -> Result<()> {
        let tree = Tree::from_newick("((L1:0.1,L2:0.2):0.05,(L3:0.3,L4:0.4):0.05);")?;
        assert_eq!(tree.leaf_labels(), vec!["L1", "L2", "L3", "L4"]);
        assert!(tree.has_branch_lengths());
        assert_eq!(
            tree.to_newick(),
            "((L1:0.1,L2:0.2):0.05,(L3:0.3,L4:0.4):0.05);"
        );
        Ok(())
    }

    #[test]
    fn test_supports_parsed_from_internal_labels() -> Result<()> {
        let tree = Tree::from_newick("((a:1,b:1)80:1,(c:1,d:1)55:1);")?;
        let mut supports = tree.internal_supports();
        supports.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert_eq!(supports, vec![55.0, 80.0]);
        Ok(())
    }

    #[test]
    fn test_leaf_distance() -> Result<()> {
        let tree = Tree::from_newick("((L1:0.1,L2:0.2):0.05,(L3:0.3,L4:0.4):0.05);")?;
        let l2 = tree.find_leaf("L2").unwrap();
        let l4 = tree.find_leaf("L4").unwrap();
        assert!((tree.distance(l2, l4) - 0.7).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_midpoint_reroot_balances_farthest_leaves() -> Result<()> {
        let mut tree = Tree::from_newick("((L1:0.1,L2:0.2):0.05,(L3:0.3,L4:0.4):0.05);")?;
        assert!(tree.midpoint_reroot());
        // Farthest pair is L2..L4 at 0.7; the new root splits it evenly
        let root = tree.root();
        let l2 = tree.find_leaf("L2").unwrap();
        let l4 = tree.find_leaf("L4").unwrap();
        assert!((tree.distance(root, l2) - 0.35).abs() < 1e-9);
        assert!((tree.distance(root, l4) - 0.35).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_midpoint_noop_without_lengths() -> Result<()> {
        let mut tree = Tree::from_newick("((L1,L2),L3);")?;
        assert!(!tree.midpoint_reroot());
        Ok(())
    }

    #[test]
    fn test_reroot_at_leaf() -> Result<()> {
        let mut tree = Tree::from_newick("((L1:0.1,L2:0.2):0.05,L3:0.3);")?;
        tree.reroot_at_leaf("L3")?;
        let root = tree.root();
        let l3 = tree.find_leaf("L3").unwrap();
        // The leaf hangs off the new root at branch length zero
        assert!(tree
            .graph
            .find_edge(root, l3)
            .map(|e| tree.graph[e] == 0.0)
            .unwrap_or(false));
        assert!((tree.distance(root, l3)).abs() < 1e-9);
        // Total path lengths are preserved
        let l1 = tree.find_leaf("L1").unwrap();
        assert!((tree.distance(l3, l1) - 0.45).abs() < 1e-9);
        Ok(())
    }
}
