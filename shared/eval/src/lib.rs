mod critique;
mod dataset;
mod harness;
mod prompt;
mod report;
mod scoring;

pub use critique::{
    aspect_scores, json_postprocess, sum_penalties, AspectScores, CritiqueError,
    SUMMARIZATION_ASPECTS,
};
pub use dataset::{default_output_path, load_examples, write_examples, Candidate, Example};
pub use harness::{
    truncate_to_tokens, PreparedEval, PromptOptions, RunOptions, SAMPLING_TEMPERATURE,
    SAMPLING_TOP_P,
};
pub use prompt::{format_prompt, FormattedPrompt, FINETUNE_INPUT, FINETUNE_INST};
pub use report::{CorrelationReport, MetricCorrelation, XGPTSCORE_METRICS};
pub use scoring::{
    annotate_examples, human_score, join_human_scores, score_candidate, EvalError,
    ScoreOutcome, ScoreSummary, ASPECT_FIELD_PREFIX,
};
