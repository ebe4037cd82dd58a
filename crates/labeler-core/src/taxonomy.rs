//! Taxonomy tree building and indexing.
//!
//! The host UI exposes its label hierarchy as a flat, pre-ordered list of
//! `(label, depth)` rows. [`build_tree`] turns that into a forest and
//! [`TaxonomyIndex`] flattens the four rule categories out of it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One row of the visual hierarchy, in source order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
pub struct LeveledEntry {
    /// Label text as displayed. Missing or blank labels are skipped.
    #[serde(default)]
    pub label: Option<String>,
    /// Nesting depth, 1 for top-level categories.
    pub depth: u32,
}

impl LeveledEntry {
    pub fn new(label: impl Into<String>, depth: u32) -> Self {
        Self {
            label: Some(label.into()),
            depth,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaxonomyNode {
    pub label: String,
    #[serde(default)]
    pub children: Vec<TaxonomyNode>,
}

impl TaxonomyNode {
    /// Pre-order labels of all descendants, excluding this node's own label.
    pub fn descendant_labels(&self) -> Vec<String> {
        let mut out = Vec::new();
        for child in &self.children {
            child.collect_labels(&mut out);
        }
        out
    }

    fn collect_labels(&self, out: &mut Vec<String>) {
        out.push(self.label.clone());
        for child in &self.children {
            child.collect_labels(out);
        }
    }

    fn find(&self, label: &str) -> Option<&TaxonomyNode> {
        if self.label == label {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(label))
    }
}

/// Names of the top-level branches the rules count against, plus which
/// branches to drop and where place names live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct TaxonomyConfig {
    pub categories: CategoryNames,
    /// Root labels that are operational, not part of the taxonomy proper.
    pub denylist: Vec<String>,
    /// Label of the node whose descendants are geographic labels.
    pub geography_branch: Option<String>,
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        Self {
            categories: CategoryNames::default(),
            denylist: vec![
                "InnoTech".to_string(),
                "KriMiSi".to_string(),
                "Auftragstags".to_string(),
            ],
            geography_branch: Some("geographische Lokation".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct CategoryNames {
    pub cyber: String,
    pub general: String,
    pub news_info: String,
    pub structure: String,
}

impl Default for CategoryNames {
    fn default() -> Self {
        Self {
            cyber: "Cyber".to_string(),
            general: "Allgemeine Tags".to_string(),
            news_info: "Newsinfo".to_string(),
            structure: "Struktur".to_string(),
        }
    }
}

/// Slot in the build arena: label plus indices of children.
struct Slot {
    label: String,
    children: Vec<usize>,
}

/// Build a forest from leveled rows, then drop denylisted roots.
///
/// Rows whose parent depth has no live node are dropped rather than
/// reattached elsewhere. Fails with [`Error::EmptySource`] when nothing
/// survives.
pub fn build_tree(entries: &[LeveledEntry], denylist: &[String]) -> Result<Vec<TaxonomyNode>> {
    let mut arena: Vec<Slot> = Vec::with_capacity(entries.len());
    let mut roots: Vec<usize> = Vec::new();
    // stack[d] = arena index of the most recent node at depth d
    let mut stack: Vec<Option<usize>> = vec![None];
    let mut orphans = 0usize;

    for entry in entries {
        let Some(label) = entry.label.as_deref().map(str::trim).filter(|l| !l.is_empty()) else {
            continue;
        };
        let depth = entry.depth as usize;
        if depth == 0 {
            orphans += 1;
            continue;
        }

        if depth == 1 {
            let idx = push_slot(&mut arena, label);
            roots.push(idx);
            set_slot(&mut stack, 1, idx);
        } else {
            let Some(parent) = stack.get(depth - 1).copied().flatten() else {
                orphans += 1;
                stack.truncate(depth);
                continue;
            };
            let idx = push_slot(&mut arena, label);
            arena[parent].children.push(idx);
            set_slot(&mut stack, depth, idx);
        }
        stack.truncate(depth + 1);
    }

    if orphans > 0 {
        tracing::debug!(target: "labeler::taxonomy", orphans, "dropped rows without a live parent");
    }

    let forest: Vec<TaxonomyNode> = roots
        .into_iter()
        .map(|idx| materialize(&arena, idx))
        .filter(|root| !denylist.iter().any(|d| d == &root.label))
        .collect();

    if forest.is_empty() {
        return Err(Error::EmptySource);
    }
    Ok(forest)
}

fn push_slot(arena: &mut Vec<Slot>, label: &str) -> usize {
    arena.push(Slot {
        label: label.to_string(),
        children: Vec::new(),
    });
    arena.len() - 1
}

fn set_slot(stack: &mut Vec<Option<usize>>, depth: usize, idx: usize) {
    if stack.len() <= depth {
        stack.resize(depth + 1, None);
    }
    stack[depth] = Some(idx);
}

fn materialize(arena: &[Slot], idx: usize) -> TaxonomyNode {
    let slot = &arena[idx];
    TaxonomyNode {
        label: slot.label.clone(),
        children: slot.children.iter().map(|&c| materialize(arena, c)).collect(),
    }
}

/// A named set of labels. Keeps source order for rendering; membership is
/// what the rules look at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelSet {
    labels: Vec<String>,
    members: HashSet<String>,
}

impl LabelSet {
    pub fn from_labels(labels: Vec<String>) -> Self {
        let members = labels.iter().cloned().collect();
        Self { labels, members }
    }

    pub fn contains(&self, label: &str) -> bool {
        self.members.contains(label)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Per-category label sets derived from one built tree.
#[derive(Debug, Clone, Default)]
pub struct TaxonomyIndex {
    pub cyber: LabelSet,
    pub general: LabelSet,
    pub news_info: LabelSet,
    pub structure: LabelSet,
    /// Every label in the forest, roots included, in pre-order.
    pub all_labels: Vec<String>,
    /// Descendants of the configured geography branch.
    pub geography: LabelSet,
}

impl TaxonomyIndex {
    pub fn new(forest: &[TaxonomyNode], config: &TaxonomyConfig) -> Self {
        let names = &config.categories;
        let mut index = TaxonomyIndex::default();

        for root in forest {
            root.collect_labels(&mut index.all_labels);

            let slot = if root.label == names.cyber {
                &mut index.cyber
            } else if root.label == names.general {
                &mut index.general
            } else if root.label == names.news_info {
                &mut index.news_info
            } else if root.label == names.structure {
                &mut index.structure
            } else {
                tracing::debug!(target: "labeler::taxonomy", root = %root.label, "root is not a rule category");
                continue;
            };
            *slot = LabelSet::from_labels(root.descendant_labels());
        }

        if let Some(branch) = config.geography_branch.as_deref() {
            if let Some(node) = forest.iter().find_map(|r| r.find(branch)) {
                index.geography = LabelSet::from_labels(node.descendant_labels());
            }
        }

        index
    }

    /// Whether the label belongs to any of the four rule categories.
    pub fn is_known(&self, label: &str) -> bool {
        self.cyber.contains(label)
            || self.general.contains(label)
            || self.news_info.contains(label)
            || self.structure.contains(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(rows: &[(&str, u32)]) -> Vec<LeveledEntry> {
        rows.iter().map(|(l, d)| LeveledEntry::new(*l, *d)).collect()
    }

    fn node(label: &str, children: Vec<TaxonomyNode>) -> TaxonomyNode {
        TaxonomyNode {
            label: label.to_string(),
            children,
        }
    }

    #[test]
    fn test_builds_siblings_and_roots() {
        let forest = build_tree(&rows(&[("A", 1), ("B", 2), ("C", 2), ("D", 1)]), &[]).unwrap();
        assert_eq!(
            forest,
            vec![
                node("A", vec![node("B", vec![]), node("C", vec![])]),
                node("D", vec![]),
            ]
        );
    }

    #[test]
    fn test_shallower_sibling_not_attached_to_closed_subtree() {
        let forest = build_tree(
            &rows(&[("A", 1), ("B", 2), ("C", 3), ("D", 4), ("E", 2), ("F", 3)]),
            &[],
        )
        .unwrap();
        let a = &forest[0];
        assert_eq!(a.children.len(), 2);
        assert_eq!(a.children[0].label, "B");
        assert_eq!(a.children[0].children[0].children[0].label, "D");
        assert_eq!(a.children[1].label, "E");
        assert_eq!(a.children[1].children, vec![node("F", vec![])]);
    }

    #[test]
    fn test_orphan_rows_are_dropped() {
        // "X" at depth 3 has no depth-2 ancestor; "Y" below it is orphaned too
        let forest = build_tree(&rows(&[("A", 1), ("X", 3), ("Y", 4), ("B", 2)]), &[]).unwrap();
        assert_eq!(forest, vec![node("A", vec![node("B", vec![])])]);
    }

    #[test]
    fn test_leading_orphan_is_dropped() {
        let forest = build_tree(&rows(&[("Z", 2), ("A", 1)]), &[]).unwrap();
        assert_eq!(forest, vec![node("A", vec![])]);
    }

    #[test]
    fn test_blank_labels_and_zero_depth_skipped() {
        let mut entries = rows(&[("A", 1), ("  ", 2), ("B", 2), ("Q", 0)]);
        entries.push(LeveledEntry {
            label: None,
            depth: 2,
        });
        let forest = build_tree(&entries, &[]).unwrap();
        assert_eq!(forest, vec![node("A", vec![node("B", vec![])])]);
    }

    #[test]
    fn test_denylist_removes_roots_and_is_idempotent() {
        let entries = rows(&[
            ("InnoTech", 1),
            ("Inner", 2),
            ("Cyber", 1),
            ("Malware", 2),
            ("KriMiSi", 1),
        ]);
        let deny = TaxonomyConfig::default().denylist;
        let first = build_tree(&entries, &deny).unwrap();
        let second = build_tree(&entries, &deny).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].label, "Cyber");
    }

    #[test]
    fn test_denylist_only_applies_at_root() {
        let entries = rows(&[("Cyber", 1), ("InnoTech", 2)]);
        let forest = build_tree(&entries, &["InnoTech".to_string()]).unwrap();
        assert_eq!(forest[0].children[0].label, "InnoTech");
    }

    #[test]
    fn test_empty_source() {
        assert!(matches!(build_tree(&[], &[]), Err(Error::EmptySource)));
        let only_denied = rows(&[("Auftragstags", 1), ("Child", 2)]);
        assert!(matches!(
            build_tree(&only_denied, &TaxonomyConfig::default().denylist),
            Err(Error::EmptySource)
        ));
    }

    #[test]
    fn test_index_categories() {
        let entries = rows(&[
            ("Cyber", 1),
            ("Malware", 2),
            ("Ransomware", 3),
            ("Phishing", 2),
            ("Allgemeine Tags", 1),
            ("Politik", 2),
            ("geographische Lokation", 2),
            ("Deutschland", 3),
            ("USA", 3),
            ("Sonstiges", 1),
            ("Misc", 2),
        ]);
        let config = TaxonomyConfig::default();
        let forest = build_tree(&entries, &config.denylist).unwrap();
        let index = TaxonomyIndex::new(&forest, &config);

        assert_eq!(index.cyber.labels(), &["Malware", "Ransomware", "Phishing"]);
        assert_eq!(
            index.general.labels(),
            &["Politik", "geographische Lokation", "Deutschland", "USA"]
        );
        assert!(index.news_info.is_empty());
        assert!(index.structure.is_empty());
        assert_eq!(index.geography.labels(), &["Deutschland", "USA"]);

        assert!(index.all_labels.contains(&"Misc".to_string()));
        assert!(index.all_labels.contains(&"Cyber".to_string()));
        assert!(!index.is_known("Misc"));
        assert!(!index.is_known("Cyber"));
        assert!(index.is_known("Ransomware"));
    }

    #[test]
    fn test_category_match_is_case_sensitive() {
        let forest = build_tree(&rows(&[("cyber", 1), ("Malware", 2)]), &[]).unwrap();
        let index = TaxonomyIndex::new(&forest, &TaxonomyConfig::default());
        assert!(index.cyber.is_empty());
        assert_eq!(index.all_labels, vec!["cyber", "Malware"]);
    }
}
