use serde::{Deserialize, Serialize};

use labeler_core::{Error, Result};

/// One element of the model's JSON answer. Both shapes have been seen from
/// different model revisions, so both are accepted.
#[derive(Deserialize)]
#[serde(untagged)]
enum AnswerItem {
    Label(String),
    Justified {
        label: String,
        #[serde(default)]
        #[allow(dead_code)]
        justification: Option<String>,
    },
}

impl AnswerItem {
    fn into_label(self) -> String {
        match self {
            AnswerItem::Label(l) | AnswerItem::Justified { label: l, .. } => l,
        }
    }
}

/// How the label list was recovered from the raw answer.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AnswerShape {
    Json,
    /// JSON array found inside surrounding prose.
    EmbeddedJson,
    /// Best-effort newline split.
    Lines,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAnswer {
    /// Labels in the order the model returned them, duplicates kept.
    pub labels: Vec<String>,
    pub shape: AnswerShape,
}

/// Parse raw model output into a label list.
///
/// Tries the whole (fence-stripped) text as JSON, then the outermost `[...]`
/// substring, then falls back to one label per non-empty line.
pub fn parse_answer(raw: &str) -> Result<ParsedAnswer> {
    let cleaned = strip_fences(raw);

    if let Some(labels) = parse_items(&cleaned) {
        return Ok(ParsedAnswer {
            labels,
            shape: AnswerShape::Json,
        });
    }

    if let Some(labels) = extract_json_array(&cleaned).and_then(parse_items) {
        return Ok(ParsedAnswer {
            labels,
            shape: AnswerShape::EmbeddedJson,
        });
    }

    let labels: Vec<String> = cleaned
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    if labels.is_empty() {
        return Err(Error::Parse("answer contained no labels".to_string()));
    }
    tracing::debug!(target: "labeler::parse", count = labels.len(), "answer was not JSON, split on lines");
    Ok(ParsedAnswer {
        labels,
        shape: AnswerShape::Lines,
    })
}

fn strip_fences(raw: &str) -> String {
    raw.replace("```json", "").replace("```", "").trim().to_string()
}

fn parse_items(text: &str) -> Option<Vec<String>> {
    let items: Vec<AnswerItem> = serde_json::from_str(text).ok()?;
    Some(
        items
            .into_iter()
            .map(|i| i.into_label().trim().to_string())
            .collect(),
    )
}

/// Extract the JSON array substring from raw LLM output.
fn extract_json_array(raw: &str) -> Option<&str> {
    let start = raw.find('[')?;
    let end = raw.rfind(']')?;
    if end <= start {
        return None;
    }
    Some(&raw[start..=end])
}
