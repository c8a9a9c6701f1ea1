use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashMap;
use tokenizers::{models::wordlevel::WordLevel, pre_tokenizers::whitespace::WhitespaceSplit, Tokenizer};
use xgpt_eval::{
    annotate_examples, join_human_scores, load_examples, write_examples, CorrelationReport,
    EvalError, PreparedEval, PromptOptions, RunOptions, ScoreSummary, XGPTSCORE_METRICS,
};
use xgpt_modeling::{ensure_special_tokens, DummyModel, SpecialTokens};

const VOCAB: [&str; 19] = [
    "<unk>",
    "<s>",
    "</s>",
    "[PAD]",
    "{",
    "}",
    "},",
    "[",
    "]",
    "\"Fluency\":",
    "\"penalty_points\":",
    "\"score_reduction\":",
    "2.0",
    "0.5",
    "\"errors\":",
    "\"error_aspect\":",
    "\"Relevance\",",
    "1.5",
    "sorry",
];

fn tokenizer() -> Tokenizer {
    let vocab = VOCAB
        .iter()
        .enumerate()
        .map(|(i, x)| (x.to_string(), i as u32))
        .collect::<HashMap<_, _>>();
    let model = WordLevel::builder()
        .vocab(vocab)
        .unk_token("<unk>".to_owned())
        .build()
        .unwrap();
    let mut tokenizer = Tokenizer::new(model);
    tokenizer.with_pre_tokenizer(Some(WhitespaceSplit));
    tokenizer
}

fn ids(tokenizer: &Tokenizer, text: &str) -> Vec<i64> {
    text.split_whitespace()
        .map(|x| tokenizer.token_to_id(x).unwrap() as i64)
        .collect()
}

fn write_dataset(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("sum.json");
    let data = json!([
        {
            "id": "doc-1",
            "task": "summarization",
            "instruction": "Summarize the article.",
            "input": "the article text",
            "candidates": [
                {"text": "first summary", "scores": {"rouge1_r": 0.2, "mqm": -4.0, "da": 10.0}},
                {"text": "second summary", "scores": {"da": 90.0, "rouge1_r": 0.6}}
            ]
        },
        {
            "id": "doc-2",
            "instruction": "Summarize the article.",
            "input": "another article",
            "candidates": [
                {"text": "third summary", "scores": {"mqm": -1.0}}
            ]
        }
    ]);
    std::fs::write(&path, serde_json::to_string(&data).unwrap()).unwrap();
    path
}

#[test]
fn scores_annotates_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let data_path = write_dataset(&dir);
    let mut tokenizer = tokenizer();
    let (special, added) = ensure_special_tokens(&mut tokenizer, &SpecialTokens::default()).unwrap();
    assert_eq!(added, 0);

    let mut examples = load_examples(&data_path, None).unwrap();
    let prepared = PreparedEval::prepare(
        &examples,
        &tokenizer,
        &PromptOptions {
            default_task: "translation".to_owned(),
            max_input_tokens: 256,
            max_hypothesis_tokens: 128,
            model_max_length: 512,
        },
    )
    .unwrap();
    assert_eq!(prepared.len(), 3);

    let scripts = vec![
        ids(
            &tokenizer,
            "{ \"Fluency\": { \"penalty_points\": [ { \"score_reduction\": 2.0 }, { \"score_reduction\": 0.5 } ] } }",
        ),
        ids(
            &tokenizer,
            "{ \"errors\": [ { \"error_aspect\": \"Relevance\", \"score_reduction\": 1.5 } ] }",
        ),
        ids(&tokenizer, "sorry"),
    ];
    let mut model = DummyModel::scripted(VOCAB.len(), scripts, special.eos);
    let generations = prepared
        .run(
            &mut model,
            &tokenizer,
            &RunOptions {
                // one batch, the scripted model counts steps across calls
                batch_size: 4,
                max_new_tokens: 64,
                pad_token_id: special.pad,
                eos_token_ids: vec![special.eos],
                seed: 0,
                progress_bar: false,
            },
        )
        .unwrap();
    assert_eq!(generations.len(), 3);
    assert_eq!(generations[2], "sorry");

    let summary = annotate_examples(&mut examples, &generations).unwrap();
    assert_eq!(
        summary,
        ScoreSummary {
            aspect_weighted: 1,
            penalty_sum: 1,
            malformed: 0,
            missing: 1,
        }
    );
    let first = &examples[0].candidates[0];
    assert_eq!(first.xgptscore, Some(-2.5));
    let second = &examples[0].candidates[1];
    assert_eq!(second.xgptscore, Some(-1.5));
    assert_eq!(second.metric("xgptscore_Relevance"), Some(-1.5));
    assert_eq!(second.metric("xgptscore_Fluency"), Some(0.0));
    assert_eq!(examples[1].candidates[0].xgptscore, None);

    let output_path = dir.path().join("sum.xgptscore.output.json");
    write_examples(&output_path, &examples).unwrap();
    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&output_path).unwrap()).unwrap();
    assert_eq!(written[0]["id"], json!("doc-1"));
    assert_eq!(written[0]["candidates"][1]["xgptscore_Relevance"], json!(-1.5));
    assert_eq!(written[1]["candidates"][0]["eval_output"], serde_json::Value::Null);

    let names = ["mqm", "da"];
    let human = join_human_scores(&examples, &names).unwrap();
    // first matching field in each candidate's own order
    assert_eq!(human, vec![vec![-4.0, 90.0], vec![-1.0]]);

    let report =
        CorrelationReport::compute(&examples, &human, &names, &XGPTSCORE_METRICS).unwrap();
    let xgptscore = report.get("xgptscore").unwrap();
    assert_eq!(xgptscore.num_pairs, 2);
    assert_eq!(xgptscore.dataset_level.kendall, Some(1.0));
    let rouge = report.get("rouge1_r").unwrap();
    assert_eq!(rouge.num_pairs, 2);

    let results_dir = dir.path().join("eval_results");
    let report_path = report.write(&results_dir, &output_path).unwrap();
    assert!(report_path.ends_with("sum.xgptscore.output.bs_corr.json"));
}

#[test]
fn missing_human_score_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let examples = load_examples(&write_dataset(&dir), None).unwrap();
    let err = join_human_scores(&examples, &["bleu"]).unwrap_err();
    assert!(matches!(err, EvalError::MissingHumanScore(_)), "{err}");
}

#[test]
fn limit_keeps_leading_examples() {
    let dir = tempfile::tempdir().unwrap();
    let examples = load_examples(&write_dataset(&dir), Some(1)).unwrap();
    assert_eq!(examples.len(), 1);
    assert_eq!(examples[0].extra["id"], json!("doc-1"));
}
