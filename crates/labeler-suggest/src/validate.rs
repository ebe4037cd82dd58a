//! Structural validation of a parsed label list against the rule set.
//!
//! Violations are data, not errors: every rule is checked independently and
//! the caller decides through [`Policy`] which of them block acceptance.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use labeler_core::{RuleSet, TaxonomyIndex};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Mandatory,
    ExclusiveSource,
    CyberMinimum,
    GeneralMinimum,
    UpperBound,
    LowerBound,
    Duplicates,
    UnknownLabel,
    Geography,
}

impl RuleKind {
    /// Rules the lenient policy reports as warnings instead of blocking on.
    pub fn is_soft(self) -> bool {
        matches!(
            self,
            RuleKind::CyberMinimum | RuleKind::GeneralMinimum | RuleKind::Geography
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Violation {
    pub rule: RuleKind,
    pub message: String,
}

impl Violation {
    fn new(rule: RuleKind, message: impl Into<String>) -> Self {
        Self {
            rule,
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Any violation rejects the answer.
    #[default]
    Strict,
    /// Category minimums and geography only warn.
    Lenient,
}

impl Policy {
    pub fn blocks(self, rule: RuleKind) -> bool {
        match self {
            Policy::Strict => true,
            Policy::Lenient => !rule.is_soft(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationVerdict {
    pub accepted: bool,
    pub policy: Policy,
    pub labels: Vec<String>,
    pub violations: Vec<Violation>,
}

impl ValidationVerdict {
    /// Violations that caused rejection under the verdict's policy.
    pub fn blocking(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| self.policy.blocks(v.rule))
    }

    /// Violations reported without blocking.
    pub fn warnings(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| !self.policy.blocks(v.rule))
    }

    pub fn summary(&self) -> String {
        self.blocking()
            .map(|v| v.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Check `labels` against every rule and assemble a verdict under `policy`.
pub fn validate(
    labels: &[String],
    index: &TaxonomyIndex,
    rules: &RuleSet,
    policy: Policy,
) -> ValidationVerdict {
    let mut violations = Vec::new();
    let distinct: BTreeSet<&str> = labels.iter().map(String::as_str).collect();

    let missing: Vec<&str> = rules
        .mandatory
        .iter()
        .map(String::as_str)
        .filter(|m| !distinct.contains(m))
        .collect();
    if !missing.is_empty() {
        violations.push(Violation::new(
            RuleKind::Mandatory,
            format!("missing mandatory labels: {}", missing.join(", ")),
        ));
    }

    if !rules.exclusive_source.is_empty() {
        let present: Vec<&str> = rules
            .exclusive_source
            .iter()
            .map(String::as_str)
            .filter(|s| distinct.contains(s))
            .collect();
        match present.len() {
            1 => {}
            0 => violations.push(Violation::new(
                RuleKind::ExclusiveSource,
                format!("exactly one of {} required, found none", rules.exclusive_source.join(" / ")),
            )),
            _ => violations.push(Violation::new(
                RuleKind::ExclusiveSource,
                format!("exactly one of {} required, found {}", rules.exclusive_source.join(" / "), present.join(", ")),
            )),
        }
    }

    let cyber = distinct.iter().filter(|l| index.cyber.contains(l)).count();
    if cyber < rules.min_cyber {
        violations.push(Violation::new(
            RuleKind::CyberMinimum,
            format!("only {cyber} Cyber labels, at least {} required", rules.min_cyber),
        ));
    }

    let general = distinct.iter().filter(|l| index.general.contains(l)).count();
    if general < rules.min_general {
        violations.push(Violation::new(
            RuleKind::GeneralMinimum,
            format!("only {general} General labels, at least {} required", rules.min_general),
        ));
    }

    if labels.len() > rules.max_labels {
        violations.push(Violation::new(
            RuleKind::UpperBound,
            format!("{} labels exceed the maximum of {}", labels.len(), rules.max_labels),
        ));
    }
    if labels.is_empty() {
        violations.push(Violation::new(RuleKind::LowerBound, "at least one label required"));
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for label in labels {
        *counts.entry(label.as_str()).or_default() += 1;
    }
    let dupes: BTreeSet<&str> = counts
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(l, _)| l)
        .collect();
    if !dupes.is_empty() {
        violations.push(Violation::new(
            RuleKind::Duplicates,
            format!("duplicate labels: {}", dupes.into_iter().collect::<Vec<_>>().join(", ")),
        ));
    }

    let unknown: Vec<&str> = distinct
        .iter()
        .copied()
        .filter(|l| !index.is_known(l))
        .collect();
    if !unknown.is_empty() {
        violations.push(Violation::new(
            RuleKind::UnknownLabel,
            format!("labels not in the label list: {}", unknown.join(", ")),
        ));
    }

    if let Some(v) = check_geography(&distinct, index, rules) {
        violations.push(v);
    }

    let accepted = !violations.iter().any(|v| policy.blocks(v.rule));
    ValidationVerdict {
        accepted,
        policy,
        labels: labels.to_vec(),
        violations,
    }
}

/// Compound geographic cardinality check; yields at most one violation.
fn check_geography(
    distinct: &BTreeSet<&str>,
    index: &TaxonomyIndex,
    rules: &RuleSet,
) -> Option<Violation> {
    let geo = &rules.geography;
    let is_place = |l: &str| {
        !geo.is_sentinel(l) && (index.geography.contains(l) || geo.labels.iter().any(|g| g == l))
    };

    let places = distinct.iter().copied().filter(|&l| is_place(l)).count();
    let global = distinct.contains(geo.global_sentinel.as_str());
    let no_location = distinct.contains(geo.no_location_sentinel.as_str());

    let message = if global && no_location {
        format!(
            "\"{}\" and \"{}\" must not be combined",
            geo.global_sentinel, geo.no_location_sentinel
        )
    } else if (global || no_location) && places > 0 {
        "sentinel combined with explicit geography".to_string()
    } else if places > geo.max_explicit {
        format!(
            "too many distinct geographic labels without {} sentinel ({places} > {})",
            geo.global_sentinel, geo.max_explicit
        )
    } else if places == 0 && !global && !no_location {
        "missing geographic marker".to_string()
    } else {
        return None;
    };
    Some(Violation::new(RuleKind::Geography, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use labeler_core::{build_tree, LeveledEntry, TaxonomyConfig};

    const PLACES: [&str; 8] = [
        "Deutschland", "USA", "China", "Russland", "Europa", "Israel", "Iran", "Ukraine",
    ];

    fn index() -> TaxonomyIndex {
        let mut rows = vec![LeveledEntry::new("Cyber", 1)];
        for l in ["[S]1 Cyber", "Malware", "Phishing", "Ransomware", "APT"] {
            rows.push(LeveledEntry::new(l, 2));
        }
        rows.push(LeveledEntry::new("Allgemeine Tags", 1));
        for l in ["Politik", "Wirtschaft", "Recht", "Militär", "Forschung"] {
            rows.push(LeveledEntry::new(l, 2));
        }
        rows.push(LeveledEntry::new("geographische Lokation", 2));
        for p in PLACES {
            rows.push(LeveledEntry::new(p, 3));
        }
        rows.push(LeveledEntry::new("Global", 3));
        rows.push(LeveledEntry::new("kein Standort", 3));
        rows.push(LeveledEntry::new("Newsinfo", 1));
        for l in ["News", "Nachrichtenseite", "Blog"] {
            rows.push(LeveledEntry::new(l, 2));
        }
        rows.push(LeveledEntry::new("Struktur", 1));
        rows.push(LeveledEntry::new("Analyse", 2));

        let config = TaxonomyConfig::default();
        let forest = build_tree(&rows, &config.denylist).unwrap();
        TaxonomyIndex::new(&forest, &config)
    }

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// A fully legal answer with one explicit place.
    fn legal() -> Vec<String> {
        labels(&[
            "News", "[S]1 Cyber", "Nachrichtenseite", "Malware", "Phishing", "Ransomware",
            "Politik", "Wirtschaft", "Recht", "Militär", "Forschung", "Deutschland",
        ])
    }

    fn rules_hit(verdict: &ValidationVerdict) -> Vec<RuleKind> {
        verdict.violations.iter().map(|v| v.rule).collect()
    }

    fn with_geo(places: &[&str], extra: &[&str]) -> Vec<String> {
        let mut out: Vec<String> = legal().into_iter().filter(|l| l != "Deutschland").collect();
        out.extend(places.iter().map(|s| s.to_string()));
        out.extend(extra.iter().map(|s| s.to_string()));
        out
    }

    #[test]
    fn test_legal_answer_accepted() {
        let verdict = validate(&legal(), &index(), &RuleSet::default(), Policy::Strict);
        assert!(verdict.accepted, "{:?}", verdict.violations);
        assert!(verdict.violations.is_empty());
    }

    #[test]
    fn test_missing_mandatory_with_empty_sets() {
        let empty = TaxonomyIndex::default();
        let verdict = validate(&labels(&["Foo"]), &empty, &RuleSet::default(), Policy::Strict);
        assert!(!verdict.accepted);
        assert!(verdict.violations.len() >= 2);
        assert!(rules_hit(&verdict).contains(&RuleKind::Mandatory));
        assert!(rules_hit(&verdict).contains(&RuleKind::UnknownLabel));
    }

    #[test]
    fn test_exclusive_source() {
        let idx = index();
        let rules = RuleSet::default();

        let mut both = legal();
        both.push("Blog".into());
        let verdict = validate(&both, &idx, &rules, Policy::Strict);
        assert_eq!(rules_hit(&verdict), vec![RuleKind::ExclusiveSource]);

        let neither: Vec<String> = legal().into_iter().filter(|l| l != "Nachrichtenseite").collect();
        let verdict = validate(&neither, &idx, &rules, Policy::Strict);
        assert_eq!(rules_hit(&verdict), vec![RuleKind::ExclusiveSource]);

        let blog_only: Vec<String> = legal()
            .into_iter()
            .map(|l| if l == "Nachrichtenseite" { "Blog".to_string() } else { l })
            .collect();
        let verdict = validate(&blog_only, &idx, &rules, Policy::Strict);
        assert!(!rules_hit(&verdict).contains(&RuleKind::ExclusiveSource));
    }

    #[test]
    fn test_category_minimums_count_distinct() {
        let mut answer: Vec<String> = legal()
            .into_iter()
            .filter(|l| !["Ransomware", "Forschung", "Militär"].contains(&l.as_str()))
            .collect();
        // a repeated Cyber label does not make up for a missing one
        answer.push("Malware".into());
        let verdict = validate(&answer, &index(), &RuleSet::default(), Policy::Strict);
        let hit = rules_hit(&verdict);
        assert!(hit.contains(&RuleKind::CyberMinimum));
        assert!(hit.contains(&RuleKind::GeneralMinimum));
        assert!(hit.contains(&RuleKind::Duplicates));
    }

    #[test]
    fn test_bounds() {
        let idx = index();
        let mut rules = RuleSet::default();
        rules.max_labels = 5;
        let verdict = validate(&legal(), &idx, &rules, Policy::Strict);
        assert!(rules_hit(&verdict).contains(&RuleKind::UpperBound));

        let verdict = validate(&[], &idx, &RuleSet::default(), Policy::Strict);
        assert!(rules_hit(&verdict).contains(&RuleKind::LowerBound));
        assert!(!verdict.accepted);
    }

    #[test]
    fn test_unknown_label_always_rejected() {
        let mut answer = legal();
        answer.push("Quantenkryptographie".into());
        for policy in [Policy::Strict, Policy::Lenient] {
            let verdict = validate(&answer, &index(), &RuleSet::default(), policy);
            assert!(!verdict.accepted);
            assert_eq!(rules_hit(&verdict), vec![RuleKind::UnknownLabel]);
        }
    }

    #[test]
    fn test_root_labels_are_unknown() {
        let mut answer = legal();
        answer.push("Cyber".into());
        let verdict = validate(&answer, &index(), &RuleSet::default(), Policy::Strict);
        assert_eq!(rules_hit(&verdict), vec![RuleKind::UnknownLabel]);
    }

    #[test]
    fn test_geography_no_location_sentinel_passes() {
        let verdict = validate(&with_geo(&[], &["kein Standort"]), &index(), &RuleSet::default(), Policy::Strict);
        assert!(verdict.accepted, "{:?}", verdict.violations);
    }

    #[test]
    fn test_geography_missing_marker() {
        let verdict = validate(&with_geo(&[], &[]), &index(), &RuleSet::default(), Policy::Strict);
        assert_eq!(rules_hit(&verdict), vec![RuleKind::Geography]);
        assert_eq!(verdict.violations[0].message, "missing geographic marker");
    }

    #[test]
    fn test_geography_global_only_passes() {
        let verdict = validate(&with_geo(&[], &["Global"]), &index(), &RuleSet::default(), Policy::Strict);
        assert!(verdict.accepted, "{:?}", verdict.violations);
    }

    #[test]
    fn test_geography_too_many_places() {
        let mut rules = RuleSet::default();
        rules.max_labels = 30;
        let verdict = validate(&with_geo(&PLACES[..7], &[]), &index(), &rules, Policy::Strict);
        assert_eq!(rules_hit(&verdict), vec![RuleKind::Geography]);
        assert!(verdict.violations[0].message.starts_with("too many distinct geographic labels"));
    }

    #[test]
    fn test_geography_sentinel_with_places() {
        let verdict = validate(&with_geo(&PLACES[..3], &["Global"]), &index(), &RuleSet::default(), Policy::Strict);
        assert_eq!(rules_hit(&verdict), vec![RuleKind::Geography]);
        assert_eq!(verdict.violations[0].message, "sentinel combined with explicit geography");
    }

    #[test]
    fn test_geography_both_sentinels() {
        let verdict = validate(
            &with_geo(&[], &["Global", "kein Standort"]),
            &index(),
            &RuleSet::default(),
            Policy::Strict,
        );
        assert_eq!(rules_hit(&verdict), vec![RuleKind::Geography]);
    }

    #[test]
    fn test_geography_five_places_allowed() {
        let verdict = validate(&with_geo(&PLACES[..5], &[]), &index(), &RuleSet::default(), Policy::Strict);
        assert!(verdict.accepted, "{:?}", verdict.violations);
    }

    #[test]
    fn test_configured_place_names_count() {
        let mut rules = RuleSet::default();
        rules.geography.labels = vec!["Analyse".into()];
        let verdict = validate(&with_geo(&[], &["Analyse", "kein Standort"]), &index(), &rules, Policy::Strict);
        assert_eq!(rules_hit(&verdict), vec![RuleKind::Geography]);
    }

    #[test]
    fn test_lenient_policy_warns_on_soft_rules() {
        let answer = labels(&["News", "[S]1 Cyber", "Blog", "Malware"]);
        let strict = validate(&answer, &index(), &RuleSet::default(), Policy::Strict);
        assert!(!strict.accepted);

        let lenient = validate(&answer, &index(), &RuleSet::default(), Policy::Lenient);
        assert!(lenient.accepted);
        assert_eq!(lenient.blocking().count(), 0);
        let warned: Vec<RuleKind> = lenient.warnings().map(|v| v.rule).collect();
        assert_eq!(
            warned,
            vec![RuleKind::CyberMinimum, RuleKind::GeneralMinimum, RuleKind::Geography]
        );
    }

    #[test]
    fn test_lenient_policy_still_blocks_hard_rules() {
        let answer = labels(&["[S]1 Cyber", "Blog", "Nachrichtenseite"]);
        let verdict = validate(&answer, &index(), &RuleSet::default(), Policy::Lenient);
        assert!(!verdict.accepted);
        let blocking: Vec<RuleKind> = verdict.blocking().map(|v| v.rule).collect();
        assert_eq!(blocking, vec![RuleKind::Mandatory, RuleKind::ExclusiveSource]);
        assert!(verdict.summary().contains("missing mandatory labels: News"));
    }

    #[test]
    fn test_verdict_keeps_answer_order() {
        let verdict = validate(&legal(), &index(), &RuleSet::default(), Policy::Strict);
        assert_eq!(verdict.labels, legal());
    }
}
