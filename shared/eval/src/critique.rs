//! Reading the JSON critiques the model generates.
//!
//! Two shapes are understood. The per-aspect shape maps an aspect name to its
//! `penalty_points`, and is what [`sum_penalties`] reads. The error-list shape
//! has an `errors` collection whose entries carry `error_aspect` and
//! `score_reduction`, and is what [`aspect_scores`] reads.

use serde_json::Value;
use thiserror::Error;

pub const SUMMARIZATION_ASPECTS: [&str; 4] = ["Relevance", "Consistency", "Coherence", "Fluency"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CritiqueError {
    #[error("no critique could be parsed from the generated text")]
    Missing,

    #[error("critique is not a JSON object")]
    NotAnObject,

    #[error("aspect {0} is not a JSON object")]
    AspectNotAnObject(String),

    #[error("aspect {0} has no penalty_points")]
    MissingPenaltyPoints(String),

    #[error("penalty_points of aspect {0} is not a list")]
    PenaltyPointsNotAList(String),

    #[error("penalty point {1} of aspect {0} is not a JSON object")]
    PointNotAnObject(String, usize),

    #[error("penalty point {1} of aspect {0} has no score_reduction")]
    MissingScoreReduction(String, usize),

    #[error("penalty point {1} of aspect {0} has a non-numeric score_reduction")]
    NonNumericScoreReduction(String, usize),

    #[error("score reductions add up to a non-finite score")]
    NonFiniteScore,
}

/// Negated total of every `score_reduction` in a per-aspect critique.
/// A critique without penalty points scores `0`.
pub fn sum_penalties(critique: &Value) -> Result<f64, CritiqueError> {
    let aspects = match critique {
        Value::Null => return Err(CritiqueError::Missing),
        Value::Object(aspects) => aspects,
        _ => return Err(CritiqueError::NotAnObject),
    };
    let mut total = 0.0;
    for (aspect, body) in aspects {
        let body = body
            .as_object()
            .ok_or_else(|| CritiqueError::AspectNotAnObject(aspect.clone()))?;
        let points = body
            .get("penalty_points")
            .ok_or_else(|| CritiqueError::MissingPenaltyPoints(aspect.clone()))?
            .as_array()
            .ok_or_else(|| CritiqueError::PenaltyPointsNotAList(aspect.clone()))?;
        for (index, point) in points.iter().enumerate() {
            let point = point
                .as_object()
                .ok_or_else(|| CritiqueError::PointNotAnObject(aspect.clone(), index))?;
            total += point
                .get("score_reduction")
                .ok_or_else(|| CritiqueError::MissingScoreReduction(aspect.clone(), index))?
                .as_f64()
                .ok_or_else(|| CritiqueError::NonNumericScoreReduction(aspect.clone(), index))?;
        }
    }
    if !total.is_finite() {
        return Err(CritiqueError::NonFiniteScore);
    }
    Ok(-total)
}

/// Per-aspect scores in first-seen order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AspectScores(Vec<(String, f64)>);

impl AspectScores {
    fn add(&mut self, aspect: String, score: f64) {
        match self.0.iter_mut().find(|(name, _)| *name == aspect) {
            Some((_, total)) => *total += score,
            None => self.0.push((aspect, score)),
        }
    }

    pub fn get(&self, aspect: &str) -> Option<f64> {
        self.0
            .iter()
            .find(|(name, _)| name == aspect)
            .map(|(_, score)| *score)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, score)| (name.as_str(), *score))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn canonical_aspect(aspect: &str) -> String {
    let aspect = aspect.trim();
    SUMMARIZATION_ASPECTS
        .iter()
        .find(|x| x.eq_ignore_ascii_case(aspect))
        .map(|x| x.to_string())
        .unwrap_or_else(|| aspect.to_owned())
}

fn number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|x| x.is_finite())
}

/// Scores an error-list critique: each error subtracts its `score_reduction`
/// from its aspect. `None` when the critique has no `errors` collection.
pub fn aspect_scores(critique: &Value) -> Option<AspectScores> {
    let errors: Vec<&Value> = match critique.get("errors")? {
        Value::Object(errors) => errors.values().collect(),
        Value::Array(errors) => errors.iter().collect(),
        _ => return None,
    };
    let mut scores = AspectScores::default();
    for error in errors {
        let aspect = error.get("error_aspect").and_then(Value::as_str);
        let reduction = error.get("score_reduction").and_then(number);
        if let (Some(aspect), Some(reduction)) = (aspect, reduction) {
            scores.add(canonical_aspect(aspect), -reduction);
        }
    }
    Some(scores)
}

/// Pulls a JSON object out of generated text. Markdown fences and any prose
/// around the object are dropped; output cut off mid-object is closed up.
pub fn json_postprocess(text: &str) -> Option<Value> {
    let text = match text.find("```json") {
        Some(start) => {
            let body = &text[start + "```json".len()..];
            body.find("```").map(|end| &body[..end]).unwrap_or(body)
        }
        None => text,
    };
    let start = text.find('{')?;
    let span = match text.rfind('}') {
        Some(end) if end > start => &text[start..=end],
        _ => &text[start..],
    };
    serde_json::from_str(span)
        .or_else(|_| serde_json::from_str(&repair_json(span)))
        .ok()
}

fn trim_trailing_comma(out: &mut String) {
    let trimmed = out.trim_end().len();
    out.truncate(trimmed);
    if out.ends_with(',') {
        out.pop();
    }
}

fn closer(opener: char) -> char {
    match opener {
        '{' => '}',
        _ => ']',
    }
}

/// Drops trailing commas and closes unterminated strings, objects and arrays.
fn repair_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' | '[' => {
                stack.push(c);
                out.push(c);
            }
            '}' | ']' => {
                let opener = if c == '}' { '{' } else { '[' };
                if !stack.contains(&opener) {
                    break;
                }
                trim_trailing_comma(&mut out);
                while let Some(open) = stack.pop() {
                    out.push(closer(open));
                    if open == opener {
                        break;
                    }
                    trim_trailing_comma(&mut out);
                }
                if stack.is_empty() {
                    break;
                }
            }
            c => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    trim_trailing_comma(&mut out);
    if out.ends_with(':') {
        out.push_str(" null");
    }
    while let Some(open) = stack.pop() {
        out.push(closer(open));
    }
    out
}
