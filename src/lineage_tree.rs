use anyhow::{Context, Result, bail};
use haplocall_protocol::LineageType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

/// How label `a` sits relative to label `b` in a lineage tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelRelation {
    Same,
    /// `a` is an ancestor of `b`.
    Ancestor,
    /// `a` descends from `b`.
    Descendant,
    /// Neither lies on the other's path; `branch_distance` counts the edges
    /// from `a` up to the common ancestor and back down to `b`.
    Diverged { branch_distance: u32 },
    Incompatible,
}

impl LabelRelation {
    pub fn on_one_path(self) -> bool {
        matches!(self, Self::Same | Self::Ancestor | Self::Descendant)
    }
}

pub trait LineageTreeComparator: Send + Sync {
    fn relate(&self, lineage_type: LineageType, a: &str, b: &str) -> LabelRelation;
}

/// Explicit parent map per lineage type.
///
/// JSON form: `{ "paternal": { "R1b": "R1", "R1": "R", "R": null }, "maternal": { ... } }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LineageTree {
    #[serde(default)]
    paternal: HashMap<String, Option<String>>,
    #[serde(default)]
    maternal: HashMap<String, Option<String>>,
}

impl LineageTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Could not read lineage tree '{}'", path.display()))?;
        let tree: Self = serde_json::from_str(&text)
            .with_context(|| format!("Could not parse lineage tree '{}'", path.display()))?;
        tree.validate()?;
        Ok(tree)
    }

    pub fn with_edge(mut self, lineage_type: LineageType, child: &str, parent: Option<&str>) -> Self {
        self.parents_mut(lineage_type)
            .insert(child.to_string(), parent.map(str::to_string));
        self
    }

    /// Rejects parent cycles, which would make ancestry walks unbounded.
    pub fn validate(&self) -> Result<()> {
        for lineage_type in LineageType::ALL {
            let parents = self.parents(lineage_type);
            for start in parents.keys() {
                let mut seen = HashSet::new();
                let mut cursor = Some(start.as_str());
                while let Some(label) = cursor {
                    if !seen.insert(label) {
                        bail!("{lineage_type} lineage tree has a cycle through '{label}'");
                    }
                    cursor = parents.get(label).and_then(|p| p.as_deref());
                }
            }
        }
        Ok(())
    }

    fn parents(&self, lineage_type: LineageType) -> &HashMap<String, Option<String>> {
        match lineage_type {
            LineageType::Paternal => &self.paternal,
            LineageType::Maternal => &self.maternal,
        }
    }

    fn parents_mut(&mut self, lineage_type: LineageType) -> &mut HashMap<String, Option<String>> {
        match lineage_type {
            LineageType::Paternal => &mut self.paternal,
            LineageType::Maternal => &mut self.maternal,
        }
    }

    /// `label` followed by its ancestors up to the root; `None` for unknown labels.
    fn path_to_root<'a>(&'a self, lineage_type: LineageType, label: &'a str) -> Option<Vec<&'a str>> {
        let parents = self.parents(lineage_type);
        if !parents.contains_key(label) {
            return None;
        }
        let mut path = vec![label];
        let mut cursor = parents.get(label).and_then(|p| p.as_deref());
        while let Some(parent) = cursor {
            if path.contains(&parent) {
                break;
            }
            path.push(parent);
            cursor = parents.get(parent).and_then(|p| p.as_deref());
        }
        Some(path)
    }
}

impl LineageTreeComparator for LineageTree {
    fn relate(&self, lineage_type: LineageType, a: &str, b: &str) -> LabelRelation {
        if a == b {
            return LabelRelation::Same;
        }
        let (Some(path_a), Some(path_b)) = (
            self.path_to_root(lineage_type, a),
            self.path_to_root(lineage_type, b),
        ) else {
            return LabelRelation::Incompatible;
        };
        if path_b.contains(&a) {
            return LabelRelation::Ancestor;
        }
        if path_a.contains(&b) {
            return LabelRelation::Descendant;
        }
        let depth_in_b: BTreeMap<&str, usize> =
            path_b.iter().enumerate().map(|(i, l)| (*l, i)).collect();
        path_a
            .iter()
            .enumerate()
            .find_map(|(i, label)| depth_in_b.get(label).map(|j| i + j))
            .map(|distance| LabelRelation::Diverged {
                branch_distance: distance as u32,
            })
            .unwrap_or(LabelRelation::Incompatible)
    }
}

/// Relates labels by their hierarchical names when no explicit tree is
/// loaded: `R1b1a` descends from `R1b`, and `R1b` and `R1a` diverge one
/// character below `R1`. Different leading letters are incompatible.
#[derive(Debug, Clone, Copy, Default)]
pub struct NomenclatureComparator;

impl LineageTreeComparator for NomenclatureComparator {
    fn relate(&self, _lineage_type: LineageType, a: &str, b: &str) -> LabelRelation {
        let a = a.trim();
        let b = b.trim();
        if a.eq_ignore_ascii_case(b) {
            return LabelRelation::Same;
        }
        let common = a
            .chars()
            .zip(b.chars())
            .take_while(|(x, y)| x.eq_ignore_ascii_case(y))
            .count();
        let len_a = a.chars().count();
        let len_b = b.chars().count();
        if common == 0 {
            LabelRelation::Incompatible
        } else if common == len_a {
            LabelRelation::Ancestor
        } else if common == len_b {
            LabelRelation::Descendant
        } else {
            LabelRelation::Diverged {
                branch_distance: (len_a - common + len_b - common) as u32,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tree() -> LineageTree {
        LineageTree::new()
            .with_edge(LineageType::Paternal, "R", None)
            .with_edge(LineageType::Paternal, "R1", Some("R"))
            .with_edge(LineageType::Paternal, "R1a", Some("R1"))
            .with_edge(LineageType::Paternal, "R1b", Some("R1"))
            .with_edge(LineageType::Paternal, "R1b-L21", Some("R1b"))
            .with_edge(LineageType::Paternal, "R1b-U106", Some("R1b"))
            .with_edge(LineageType::Paternal, "I", None)
    }

    #[test]
    fn test_tree_relations() {
        let t = tree();
        let p = LineageType::Paternal;
        assert_eq!(t.relate(p, "R1b", "R1b"), LabelRelation::Same);
        assert_eq!(t.relate(p, "R1", "R1b-L21"), LabelRelation::Ancestor);
        assert_eq!(t.relate(p, "R1b-L21", "R1"), LabelRelation::Descendant);
        assert_eq!(
            t.relate(p, "R1b-L21", "R1b-U106"),
            LabelRelation::Diverged { branch_distance: 2 }
        );
        assert_eq!(
            t.relate(p, "R1b-L21", "R1a"),
            LabelRelation::Diverged { branch_distance: 3 }
        );
        assert_eq!(t.relate(p, "R1b", "I"), LabelRelation::Incompatible);
        assert_eq!(t.relate(p, "R1b", "Q"), LabelRelation::Incompatible);
        assert_eq!(
            t.relate(LineageType::Maternal, "R1b", "R1"),
            LabelRelation::Incompatible
        );
    }

    #[test]
    fn test_tree_loads_from_json_and_rejects_cycles() {
        let td = tempdir().unwrap();
        let path = td.path().join("tree.json");
        fs::write(
            &path,
            r#"{ "maternal": { "H": null, "H1": "H", "H2": "H" } }"#,
        )
        .unwrap();
        let tree = LineageTree::from_json_file(&path).unwrap();
        assert_eq!(
            tree.relate(LineageType::Maternal, "H1", "H2"),
            LabelRelation::Diverged { branch_distance: 2 }
        );

        fs::write(&path, r#"{ "paternal": { "A": "B", "B": "A" } }"#).unwrap();
        let err = LineageTree::from_json_file(&path).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_nomenclature_relations() {
        let c = NomenclatureComparator;
        let m = LineageType::Maternal;
        assert_eq!(c.relate(m, "H1a", "h1a"), LabelRelation::Same);
        assert_eq!(c.relate(m, "H1", "H1a2"), LabelRelation::Ancestor);
        assert_eq!(c.relate(m, "H1a2", "H1"), LabelRelation::Descendant);
        assert_eq!(
            c.relate(m, "H1a", "H1b"),
            LabelRelation::Diverged { branch_distance: 2 }
        );
        assert_eq!(c.relate(m, "H1", "U5"), LabelRelation::Incompatible);
        assert!(c.relate(m, "H", "H5").on_one_path());
    }
}
