use crate::{
    critique::{aspect_scores, json_postprocess, sum_penalties, CritiqueError, SUMMARIZATION_ASPECTS},
    dataset::{Candidate, Example},
};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

pub const ASPECT_FIELD_PREFIX: &str = "xgptscore_";

#[derive(Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("No human score found in {0}")]
    MissingHumanScore(String),

    #[error("human score {0} is not a number: {1}")]
    NonNumericHumanScore(String, Value),

    #[error("expected {expected} generations, one per candidate, got {actual}")]
    GenerationCountMismatch { expected: usize, actual: usize },
}

/// How a candidate's `xgptscore` was arrived at.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreOutcome {
    /// The critique listed aspect-tagged errors.
    AspectWeighted,
    /// The critique was a per-aspect penalty map.
    PenaltySum,
    /// A critique was parsed but could not be scored.
    Malformed(CritiqueError),
    /// No JSON could be recovered from the generated text.
    Missing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoreSummary {
    pub aspect_weighted: usize,
    pub penalty_sum: usize,
    pub malformed: usize,
    pub missing: usize,
}

impl ScoreSummary {
    fn record(&mut self, outcome: &ScoreOutcome) {
        match outcome {
            ScoreOutcome::AspectWeighted => self.aspect_weighted += 1,
            ScoreOutcome::PenaltySum => self.penalty_sum += 1,
            ScoreOutcome::Malformed(_) => self.malformed += 1,
            ScoreOutcome::Missing => self.missing += 1,
        }
    }

    pub fn scored(&self) -> usize {
        self.aspect_weighted + self.penalty_sum
    }
}

/// Parses `generated` and stores the critique and the resulting scores on
/// `candidate`, replacing whatever a previous run left there.
pub fn score_candidate(candidate: &mut Candidate, generated: &str) -> ScoreOutcome {
    candidate
        .extra
        .retain(|key, _| !key.starts_with(ASPECT_FIELD_PREFIX));

    let Some(critique) = json_postprocess(generated) else {
        candidate.eval_output = Some(Value::Null);
        candidate.xgptscore = None;
        return ScoreOutcome::Missing;
    };

    let outcome = match aspect_scores(&critique) {
        Some(found) => {
            let mut per_aspect = SUMMARIZATION_ASPECTS
                .iter()
                .map(|x| (x.to_string(), 0.0))
                .collect::<Vec<_>>();
            for (aspect, score) in found.iter() {
                match per_aspect.iter_mut().find(|(name, _)| name == aspect) {
                    Some(entry) => entry.1 = score,
                    None => per_aspect.push((aspect.to_owned(), score)),
                }
            }
            let total: f64 = per_aspect.iter().map(|(_, score)| score).sum();
            if total.is_finite() {
                for (aspect, score) in &per_aspect {
                    candidate
                        .extra
                        .insert(format!("{ASPECT_FIELD_PREFIX}{aspect}"), Value::from(*score));
                }
                candidate.xgptscore = Some(total);
                ScoreOutcome::AspectWeighted
            } else {
                debug!("Aspect scores add up to {total}");
                candidate.xgptscore = None;
                ScoreOutcome::Malformed(CritiqueError::NonFiniteScore)
            }
        }
        None => match sum_penalties(&critique) {
            Ok(score) => {
                candidate.xgptscore = Some(score);
                ScoreOutcome::PenaltySum
            }
            Err(err) => {
                debug!("Unscorable critique: {err}");
                candidate.xgptscore = None;
                ScoreOutcome::Malformed(err)
            }
        },
    };
    candidate.eval_output = Some(critique);
    outcome
}

/// Scores every candidate against its generation. `generations` is in
/// example-major, candidate-minor order.
pub fn annotate_examples(
    examples: &mut [Example],
    generations: &[String],
) -> Result<ScoreSummary, EvalError> {
    let expected = examples.iter().map(|x| x.candidates.len()).sum();
    if generations.len() != expected {
        return Err(EvalError::GenerationCountMismatch {
            expected,
            actual: generations.len(),
        });
    }

    let mut summary = ScoreSummary::default();
    let candidates = examples.iter_mut().flat_map(|x| x.candidates.iter_mut());
    for (candidate, generated) in candidates.zip(generations) {
        summary.record(&score_candidate(candidate, generated));
    }
    info!(
        "Scored {} of {expected} candidates ({} aspect weighted, {} penalty sums), {} malformed, {} missing",
        summary.scored(),
        summary.aspect_weighted,
        summary.penalty_sum,
        summary.malformed,
        summary.missing
    );
    Ok(summary)
}

/// The first of the candidate's `scores`, in their own order, whose name is one
/// of `names`.
pub fn human_score(candidate: &Candidate, names: &[&str]) -> Result<f64, EvalError> {
    let (name, value) = candidate
        .scores
        .iter()
        .find(|(name, _)| names.contains(&name.as_str()))
        .ok_or_else(|| {
            EvalError::MissingHumanScore(Value::Object(candidate.scores.clone()).to_string())
        })?;
    value
        .as_f64()
        .ok_or_else(|| EvalError::NonNumericHumanScore(name.clone(), value.clone()))
}

/// Human scores per example, per candidate. Fails on the first candidate
/// without one.
pub fn join_human_scores(
    examples: &[Example],
    names: &[&str],
) -> Result<Vec<Vec<f64>>, EvalError> {
    examples
        .iter()
        .map(|example| {
            example
                .candidates
                .iter()
                .map(|candidate| human_score(candidate, names))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map};

    fn candidate(scores: Value) -> Candidate {
        let mut candidate = Candidate::new("hypothesis");
        if let Value::Object(scores) = scores {
            candidate.scores = scores;
        }
        candidate
    }

    #[test]
    fn test_aspect_weighted() {
        let mut candidate = Candidate::new("x");
        let outcome = score_candidate(
            &mut candidate,
            r#"{"errors": {"e1": {"error_aspect": "Fluency", "score_reduction": 1.5}, "e2": {"error_aspect": "relevance", "score_reduction": 2}}}"#,
        );
        assert_eq!(outcome, ScoreOutcome::AspectWeighted);
        assert_eq!(candidate.xgptscore, Some(-3.5));
        assert_eq!(candidate.metric("xgptscore_Fluency"), Some(-1.5));
        assert_eq!(candidate.metric("xgptscore_Relevance"), Some(-2.0));
        assert_eq!(candidate.metric("xgptscore_Coherence"), Some(0.0));
        assert_eq!(candidate.metric("xgptscore_Consistency"), Some(0.0));
    }

    #[test]
    fn test_penalty_sum_fallback() {
        let mut candidate = Candidate::new("x");
        let outcome = score_candidate(
            &mut candidate,
            r#"```json
{"Fluency": {"penalty_points": [{"score_reduction": 2.0}, {"score_reduction": 0.5}]}}
```"#,
        );
        assert_eq!(outcome, ScoreOutcome::PenaltySum);
        assert_eq!(candidate.xgptscore, Some(-2.5));
        assert!(candidate.extra.is_empty());
    }

    #[test]
    fn test_malformed_and_missing() {
        let mut candidate = Candidate::new("x");
        let outcome = score_candidate(&mut candidate, r#"{"Fluency": "fine"}"#);
        assert_eq!(
            outcome,
            ScoreOutcome::Malformed(CritiqueError::AspectNotAnObject("Fluency".to_owned()))
        );
        assert_eq!(candidate.xgptscore, None);
        assert_eq!(candidate.eval_output, Some(json!({"Fluency": "fine"})));

        let outcome = score_candidate(&mut candidate, "I cannot evaluate this.");
        assert_eq!(outcome, ScoreOutcome::Missing);
        assert_eq!(candidate.eval_output, Some(Value::Null));
    }

    #[test]
    fn test_non_finite_reductions_never_reach_the_score() {
        let mut candidate = Candidate::new("x");
        let outcome = score_candidate(
            &mut candidate,
            r#"{"errors": [{"error_aspect": "Fluency", "score_reduction": "NaN"}, {"error_aspect": "Coherence", "score_reduction": 1}]}"#,
        );
        assert_eq!(outcome, ScoreOutcome::AspectWeighted);
        assert_eq!(candidate.xgptscore, Some(-1.0));
        assert_eq!(candidate.metric("xgptscore_Fluency"), Some(0.0));

        let outcome = score_candidate(
            &mut candidate,
            r#"{"errors": [{"error_aspect": "Fluency", "score_reduction": 1e308}, {"error_aspect": "Coherence", "score_reduction": 1e308}]}"#,
        );
        assert_eq!(
            outcome,
            ScoreOutcome::Malformed(CritiqueError::NonFiniteScore)
        );
        assert_eq!(candidate.xgptscore, None);
        assert_eq!(candidate.metric("xgptscore_Fluency"), None);
    }

    #[test]
    fn test_rescoring_clears_old_aspects() {
        let mut candidate = Candidate::new("x");
        score_candidate(
            &mut candidate,
            r#"{"errors": [{"error_aspect": "Style", "score_reduction": 1}]}"#,
        );
        assert_eq!(candidate.metric("xgptscore_Style"), Some(-1.0));
        score_candidate(&mut candidate, r#"{"Fluency": {"penalty_points": []}}"#);
        assert_eq!(candidate.metric("xgptscore_Style"), None);
        assert_eq!(candidate.xgptscore, Some(0.0));
    }

    #[test]
    fn test_generation_count_must_match() {
        let mut examples = vec![Example {
            task: "summarization".to_owned(),
            instruction: String::new(),
            input: String::new(),
            candidates: vec![Candidate::new("a"), Candidate::new("b")],
            extra: Map::new(),
        }];
        assert_eq!(
            annotate_examples(&mut examples, &["{}".to_owned()]),
            Err(EvalError::GenerationCountMismatch {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_human_score_first_match_in_candidate_order() {
        let candidate = candidate(json!({"rouge1_r": 0.3, "da": 71.0, "mqm": -2.0}));
        assert_eq!(human_score(&candidate, &["mqm", "da"]), Ok(71.0));
    }

    #[test]
    fn test_missing_human_score_fails() {
        let candidate = candidate(json!({"rouge1_r": 0.3}));
        let err = human_score(&candidate, &["mqm", "da"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"No human score found in {"rouge1_r":0.3}"#
        );
    }

    #[test]
    fn test_non_numeric_human_score() {
        let candidate = candidate(json!({"mqm": "bad"}));
        assert_eq!(
            human_score(&candidate, &["mqm"]),
            Err(EvalError::NonNumericHumanScore("mqm".to_owned(), json!("bad")))
        );
    }
}
