//! Labeling rules: shared by the prompt's rule document and
//! the thresholds the validator enforces.

use serde::{Deserialize, Serialize};

use crate::taxonomy::CategoryNames;

/// Configurable rule set. Defaults match the latest tagging guidelines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleSet {
    /// Labels every answer must contain.
    pub mandatory: Vec<String>,
    /// Source-type labels; exactly one must be present.
    pub exclusive_source: Vec<String>,
    pub min_cyber: usize,
    pub min_general: usize,
    pub max_labels: usize,
    pub geography: GeographyRules,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            mandatory: vec!["News".to_string(), "[S]1 Cyber".to_string()],
            exclusive_source: vec!["Nachrichtenseite".to_string(), "Blog".to_string()],
            min_cyber: 4,
            min_general: 5,
            max_labels: 20,
            geography: GeographyRules::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct GeographyRules {
    /// Place-name labels in addition to the taxonomy's geography branch.
    pub labels: Vec<String>,
    /// Most explicit place labels allowed before `Global` must be used.
    pub max_explicit: usize,
    pub global_sentinel: String,
    pub no_location_sentinel: String,
}

impl Default for GeographyRules {
    fn default() -> Self {
        Self {
            labels: Vec::new(),
            max_explicit: 5,
            global_sentinel: "Global".to_string(),
            no_location_sentinel: "kein Standort".to_string(),
        }
    }
}

impl GeographyRules {
    pub fn is_sentinel(&self, label: &str) -> bool {
        label == self.global_sentinel || label == self.no_location_sentinel
    }
}

fn quoted(labels: &[String]) -> String {
    labels
        .iter()
        .map(|l| format!("\"{l}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render the rule document the model is instructed with.
pub fn rule_document(rules: &RuleSet, names: &CategoryNames) -> String {
    let geo = &rules.geography;
    let global = &geo.global_sentinel;
    let none = &geo.no_location_sentinel;
    let max = rules.max_labels;
    let max_geo = geo.max_explicit;

    let mut free = rules.mandatory.clone();
    free.extend(rules.exclusive_source.iter().cloned());
    free.push(global.clone());
    free.push(none.clone());

    let mut out = String::with_capacity(4096);

    out.push_str(
        "You are a deterministic label classification engine.\n\
Your task is to select labels from the provided Label-List that are explicitly \
supported by the Title and the Article.\n\
You must strictly follow all rules. If any rule is violated, return: []\n\n",
    );

    out.push_str(&format!(
        "## 1. Output Rules\n\
* Output a JSON array of objects, each with exactly two fields:\n\
  * \"label\": the label string, exactly as written in the Label-List\n\
  * \"justification\": exactly four consecutive words taken verbatim from the Title or Article \
that clearly indicate the label's relevance. Omit the label if no such snippet exists.\n\
* These labels need no justification: {free}.\n\
* Minimum 1 label, maximum {max} labels.\n\
* No duplicates.\n\
* Every label must appear exactly as written in the Label-List.\n\n",
        free = quoted(&free),
    ));

    out.push_str(&format!(
        "## 2. Mandatory Labels\n\
* The output must include: {mandatory}.\n\
* Exactly ONE of: {sources}. Selecting several or none → return [].\n\
* Exactly one geographic case from section 4.\n\n",
        mandatory = quoted(&rules.mandatory),
        sources = quoted(&rules.exclusive_source),
    ));

    out.push_str(&format!(
        "## 3. Category Minimums\n\
Categories are defined by their section in the Label-List.\n\
* Labels under {cyber}-Labels count as {cyber}.\n\
* Labels under {general}-Labels count as {general}.\n\
* Labels under {news}-Labels and {structure}-Labels count toward neither.\n\
The output must contain at least {min_cyber} {cyber} labels and at least {min_general} \
{general} labels. Otherwise → return [].\n\n",
        cyber = names.cyber,
        general = names.general,
        news = names.news_info,
        structure = names.structure,
        min_cyber = rules.min_cyber,
        min_general = rules.min_general,
    ));

    out.push_str(&format!(
        "## 4. Geographic Location Rules\n\
A geographic label is valid ONLY if the exact label string appears verbatim in the Article \
text between BEGIN and END. Case may differ, wording may not. Semantic interpretation, \
abbreviation expansion or inference is forbidden (\"U.S.\" does NOT justify \"USA\", \
\"European\" does NOT justify \"Europa\", the article's language justifies nothing).\n\
Exactly ONE of the following cases applies:\n\
### Case A: 1-{max_geo} exact matches\n\
* Include each matching geographic label.\n\
### Case B: more than {max_geo} exact matches\n\
* Include only \"{global}\". No other geographic labels.\n\
### Case C: no exact match\n\
* Include only \"{none}\". No other geographic labels.\n\
\"{global}\" and \"{none}\" must never appear together or with any other geographic label.\n\n",
    ));

    out.push_str(
        "## 5. Relevance Rules\n\
* Only select labels directly and explicitly supported by the Article.\n\
* Do NOT infer, assume, or speculate. If unsure, omit the label.\n\
* A label may be assigned if it appears literally in the Article, or if the Article contains \
explicit terms or phrases that clearly and directly justify it.\n\
* Ignore navigation, ads, metadata and markup.\n\
* Give more weight to the Title than to the body. The body adds context but cannot justify \
labels that contradict the Title.\n\n",
    );

    out.push_str(&format!(
        "## 6. Global Validation\n\
The final output must satisfy ALL of:\n\
* 1-{max} total labels\n\
* includes {mandatory}\n\
* exactly one source label\n\
* at least {min_cyber} {cyber} labels and at least {min_general} {general} labels\n\
* exactly one geographic case (A, B or C)\n\
* no duplicates\n\
* labels from the Label-List only\n\
If ANY condition fails → return: []\n",
        mandatory = quoted(&rules.mandatory),
        min_cyber = rules.min_cyber,
        min_general = rules.min_general,
        cyber = names.cyber,
        general = names.general,
    ));

    out
}
