use crate::dataset::Example;
use anyhow::{anyhow, Context, Result};
use serde::{Serialize, Serializer};
use std::path::{Path, PathBuf};
use tracing::info;
use xgpt_core::Correlation;

pub const XGPTSCORE_METRICS: [&str; 15] = [
    "rouge1_r",
    "rouge2_r",
    "rougel_r",
    "bert_score_r",
    "mover_score",
    "prism_hypo_ref",
    "prism_src_hypo",
    "bart_score_cnn_hypo_ref",
    "bart_score_src_hypo",
    "bart_score_para_src_hypo",
    "xgptscore",
    "xgptscore_Fluency",
    "xgptscore_Relevance",
    "xgptscore_Coherence",
    "xgptscore_Consistency",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricCorrelation {
    /// Mean over examples of the correlation across each example's candidates.
    pub sample_level: Correlation,
    /// Correlation over all candidates pooled together.
    pub dataset_level: Correlation,
    pub num_pairs: usize,
    pub num_examples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationReport {
    pub human_score_names: Vec<String>,
    pub num_candidates: usize,
    #[serde(serialize_with = "in_order")]
    pub metrics: Vec<(String, MetricCorrelation)>,
}

fn in_order<S: Serializer>(
    metrics: &[(String, MetricCorrelation)],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(metrics.iter().map(|(name, value)| (name, value)))
}

fn correlate(human: &[f64], metric: &[f64]) -> Result<Correlation> {
    Correlation::compute(human, metric).map_err(|e| anyhow!(e))
}

impl CorrelationReport {
    /// `human_scores[i][j]` is the human score of candidate `j` of example `i`.
    /// Candidates lacking a finite metric value are left out of that metric's
    /// pairs.
    pub fn compute(
        examples: &[Example],
        human_scores: &[Vec<f64>],
        human_score_names: &[&str],
        metrics: &[&str],
    ) -> Result<Self> {
        let mut report = Vec::with_capacity(metrics.len());
        for metric in metrics {
            let mut pooled_human = Vec::new();
            let mut pooled_metric = Vec::new();
            let mut per_example = Vec::new();
            for (example, human) in examples.iter().zip(human_scores) {
                let (human, values): (Vec<f64>, Vec<f64>) = example
                    .candidates
                    .iter()
                    .zip(human)
                    .filter_map(|(candidate, human)| {
                        candidate.metric(metric).map(|value| (*human, value))
                    })
                    .filter(|(human, value)| human.is_finite() && value.is_finite())
                    .unzip();
                if human.is_empty() {
                    continue;
                }
                per_example.push(correlate(&human, &values)?);
                pooled_human.extend(human);
                pooled_metric.extend(values);
            }
            let correlation = MetricCorrelation {
                sample_level: Correlation::mean(&per_example),
                dataset_level: correlate(&pooled_human, &pooled_metric)?,
                num_pairs: pooled_human.len(),
                num_examples: per_example.len(),
            };
            report.push((metric.to_string(), correlation));
        }
        Ok(Self {
            human_score_names: human_score_names.iter().map(|x| x.to_string()).collect(),
            num_candidates: examples.iter().map(|x| x.candidates.len()).sum(),
            metrics: report,
        })
    }

    pub fn get(&self, metric: &str) -> Option<&MetricCorrelation> {
        self.metrics
            .iter()
            .find(|(name, _)| name == metric)
            .map(|(_, value)| value)
    }

    /// Writes the report to `<results_dir>/<output stem>.bs_corr.json` and
    /// returns that path.
    pub fn write(&self, results_dir: &Path, output_path: &Path) -> Result<PathBuf> {
        let stem = output_path
            .file_stem()
            .ok_or_else(|| anyhow!("{} has no file name", output_path.display()))?;
        let mut file_name = stem.to_os_string();
        file_name.push(".bs_corr.json");
        let path = results_dir.join(file_name);

        std::fs::create_dir_all(results_dir)
            .with_context(|| format!("failed to create {}", results_dir.display()))?;
        std::fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("Saved correlation results to {}", path.display());
        Ok(path)
    }

    pub fn log_summary(&self) {
        for (metric, correlation) in &self.metrics {
            if correlation.num_pairs == 0 {
                continue;
            }
            info!(
                "{metric}: sample kendall {}, dataset kendall {}, pearson {}, spearman {} ({} pairs)",
                fmt_stat(correlation.sample_level.kendall),
                fmt_stat(correlation.dataset_level.kendall),
                fmt_stat(correlation.dataset_level.pearson),
                fmt_stat(correlation.dataset_level.spearman),
                correlation.num_pairs
            );
        }
    }
}

fn fmt_stat(value: Option<f64>) -> String {
    value
        .map(|x| format!("{x:.4}"))
        .unwrap_or_else(|| "n/a".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Candidate;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map};

    fn example(scores: &[(f64, Option<f64>)]) -> Example {
        Example {
            task: "summarization".to_owned(),
            instruction: String::new(),
            input: String::new(),
            candidates: scores
                .iter()
                .map(|(rouge, xgptscore)| {
                    let mut candidate = Candidate::new("c");
                    candidate.scores.insert("rouge1_r".to_owned(), json!(rouge));
                    candidate.xgptscore = *xgptscore;
                    candidate
                })
                .collect(),
            extra: Map::new(),
        }
    }

    #[test]
    fn test_monotone_metric_is_perfectly_correlated() {
        let examples = vec![
            example(&[(0.1, Some(-3.0)), (0.2, Some(-2.0)), (0.3, Some(-1.0))]),
            example(&[(0.4, Some(0.0)), (0.5, Some(1.0))]),
        ];
        let human = vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0]];
        let report =
            CorrelationReport::compute(&examples, &human, &["mqm"], &XGPTSCORE_METRICS).unwrap();

        let xgptscore = report.get("xgptscore").unwrap();
        assert_eq!(xgptscore.num_pairs, 5);
        assert_eq!(xgptscore.num_examples, 2);
        for correlation in [xgptscore.sample_level, xgptscore.dataset_level] {
            assert_eq!(correlation.pearson.map(|x| x.round()), Some(1.0));
            assert_eq!(correlation.spearman, Some(1.0));
            assert_eq!(correlation.kendall, Some(1.0));
        }

        let mover = report.get("mover_score").unwrap();
        assert_eq!(mover.num_pairs, 0);
        assert_eq!(mover.dataset_level, Correlation::default());
    }

    #[test]
    fn test_non_finite_values_are_skipped() {
        let examples = vec![example(&[
            (0.1, Some(-3.0)),
            (0.2, Some(f64::NAN)),
            (0.3, Some(-1.0)),
            (0.4, Some(f64::NEG_INFINITY)),
            (0.5, Some(0.0)),
        ])];
        let human = vec![vec![1.0, 2.0, 3.0, 4.0, 5.0]];
        let report =
            CorrelationReport::compute(&examples, &human, &["mqm"], &["xgptscore"]).unwrap();
        let xgptscore = report.get("xgptscore").unwrap();
        assert_eq!(xgptscore.num_pairs, 3);
        assert_eq!(xgptscore.dataset_level.spearman, Some(1.0));
        assert_eq!(xgptscore.dataset_level.kendall, Some(1.0));
        assert!(xgptscore.dataset_level.pearson.is_some());
    }

    #[test]
    fn test_missing_values_are_skipped() {
        let examples = vec![example(&[(0.1, Some(2.0)), (0.2, None), (0.3, Some(2.0))])];
        let human = vec![vec![1.0, 2.0, 3.0]];
        let report =
            CorrelationReport::compute(&examples, &human, &["mqm"], &["xgptscore", "rouge1_r"])
                .unwrap();
        let xgptscore = report.get("xgptscore").unwrap();
        assert_eq!(xgptscore.num_pairs, 2);
        // constant metric values
        assert_eq!(xgptscore.dataset_level, Correlation::default());
        assert_eq!(report.get("rouge1_r").unwrap().num_pairs, 3);
    }

    #[test]
    fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let results_dir = dir.path().join("eval_results");
        let examples = vec![example(&[(0.1, Some(1.0)), (0.2, Some(2.0))])];
        let report =
            CorrelationReport::compute(&examples, &[vec![1.0, 2.0]], &["mqm", "da"], &["xgptscore"])
                .unwrap();
        let path = report
            .write(&results_dir, Path::new("data/sum.xgptscore.output.json"))
            .unwrap();
        assert_eq!(path, results_dir.join("sum.xgptscore.output.bs_corr.json"));

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["human_score_names"], json!(["mqm", "da"]));
        assert_eq!(written["metrics"]["xgptscore"]["num_pairs"], json!(2));
        assert_eq!(
            written["metrics"]["xgptscore"]["dataset_level"]["kendall"],
            json!(1.0)
        );
    }
}
