use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub text: String,
    /// Metric name to value, in the order the input file lists them.
    #[serde(default)]
    pub scores: Map<String, Value>,
    #[serde(default)]
    pub eval_output: Option<Value>,
    #[serde(default)]
    pub xgptscore: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Candidate {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            scores: Map::new(),
            eval_output: None,
            xgptscore: None,
            extra: Map::new(),
        }
    }

    /// Value of a metric, looking at the fields this tool derives first and
    /// then at the candidate's `scores`.
    pub fn metric(&self, name: &str) -> Option<f64> {
        if name == "xgptscore" {
            return self.xgptscore;
        }
        self.extra
            .get(name)
            .or_else(|| self.scores.get(name))
            .and_then(Value::as_f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    #[serde(default)]
    pub task: String,
    pub instruction: String,
    pub input: String,
    pub candidates: Vec<Candidate>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub fn load_examples(path: &Path, limit: Option<usize>) -> Result<Vec<Example>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut examples: Vec<Example> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse examples from {}", path.display()))?;
    if let Some(limit) = limit {
        examples.truncate(limit);
    }
    info!(
        "Loaded {} examples with {} candidates from {}",
        examples.len(),
        examples.iter().map(|x| x.candidates.len()).sum::<usize>(),
        path.display()
    );
    Ok(examples)
}

/// Writes `examples` as a JSON array indented by four spaces.
pub fn write_examples(path: &Path, examples: &[Example]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|x| !x.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut writer, formatter);
    examples.serialize(&mut serializer)?;
    writer.flush()?;
    info!("Saved eval results to {}", path.display());
    Ok(())
}

/// `data/sum.json` -> `data/sum.xgptscore.output.json`
pub fn default_output_path(data_path: &Path) -> PathBuf {
    data_path.with_extension("xgptscore.output.json")
}
