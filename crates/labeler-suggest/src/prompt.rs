use labeler_core::rules::rule_document;
use labeler_core::{CategoryNames, RuleSet, TaxonomyIndex};

/// The four category label lists the prompt presents, in render order.
pub struct LabelLists<'a> {
    pub cyber: &'a [String],
    pub general: &'a [String],
    pub news_info: &'a [String],
    pub structure: &'a [String],
}

impl<'a> LabelLists<'a> {
    pub fn from_index(index: &'a TaxonomyIndex) -> Self {
        Self {
            cyber: index.cyber.labels(),
            general: index.general.labels(),
            news_info: index.news_info.labels(),
            structure: index.structure.labels(),
        }
    }
}

fn push_list(out: &mut String, heading: &str, labels: &[String]) {
    out.push_str(heading);
    out.push_str("-Labels:\n");
    for label in labels {
        out.push_str(label);
        out.push('\n');
    }
    out.push('\n');
}

/// Render the complete instruction: rules, output example, label lists, article.
pub fn compose(
    lists: &LabelLists<'_>,
    title: &str,
    body: &str,
    rules: &RuleSet,
    names: &CategoryNames,
) -> String {
    let mut out = String::with_capacity(8192 + body.len());

    out.push_str(&rule_document(rules, names));
    out.push_str("\n---\n\n");

    out.push_str("Output format example:\n");
    out.push_str(
        "[{\"justification\":\"U.S. National Institute of\",\"label\":\"USA\"},\
{\"justification\":\"increasing cyber reliability in\",\"label\":\"Cyber\"}]\n\n",
    );

    out.push_str("Label-List:\n");
    push_list(&mut out, &names.cyber, lists.cyber);
    push_list(&mut out, &names.general, lists.general);
    push_list(&mut out, &names.news_info, lists.news_info);
    push_list(&mut out, &names.structure, lists.structure);

    out.push_str("Article:\nBEGIN\nTitle: ");
    out.push_str(title.trim());
    out.push('\n');
    out.push_str(body.trim());
    out.push_str("\nEND\n");

    out
}
