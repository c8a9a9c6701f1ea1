use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tch::Device;
use tracing::info;
use tracing_subscriber::EnvFilter;
use xgpt_data_provider::resolve_repo_files;
use xgpt_eval::{
    annotate_examples, default_output_path, join_human_scores, load_examples, write_examples,
    CorrelationReport, PreparedEval, PromptOptions, RunOptions, XGPTSCORE_METRICS,
};
use xgpt_modeling::{
    auto_tokenizer, ensure_special_tokens, AttentionImplementation, CausalLM, LlamaForCausalLM,
    Precision, SpecialTokens,
};

fn parse_device(value: &str) -> Result<Device, String> {
    match value {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::Cuda(0)),
        "mps" => Ok(Device::Mps),
        other => other
            .strip_prefix("cuda:")
            .and_then(|x| x.parse().ok())
            .map(Device::Cuda)
            .ok_or_else(|| format!("unknown device {other}, expected cpu, cuda, cuda:N or mps")),
    }
}

#[derive(Parser, Debug, Clone)]
struct Args {
    /// Local checkpoint directory or hub repo id of a Llama model
    #[arg(long, default_value = "NousResearch/Llama-2-7b-hf")]
    model: String,

    /// LoRA adapter (directory or hub repo id) to merge into the model
    #[arg(long)]
    load_lora: Option<String>,

    /// Task name for examples that don't carry one
    #[arg(long, default_value = "translation")]
    task: String,

    /// Source context length, in tokens
    #[arg(long, default_value_t = 256)]
    max_eval_input_length: usize,

    /// Candidate text length, in tokens
    #[arg(long, default_value_t = 128)]
    max_eval_hyp_length: usize,

    /// Maximum number of generated critique tokens
    #[arg(long, default_value_t = 256)]
    max_eval_output_length: usize,

    #[arg(long)]
    data_path: PathBuf,

    /// Defaults to the data path with a .xgptscore.output.json suffix
    #[arg(long)]
    output_path: Option<PathBuf>,

    #[arg(long, default_value = "mqm,da")]
    human_score_names: String,

    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 512)]
    model_max_length: usize,

    /// float32, float16, bfloat16 or int8
    #[arg(long, default_value_t = Precision::Float32)]
    torch_dtype: Precision,

    /// eager or sdpa. Defaults to sdpa
    #[arg(long)]
    attn_implementation: Option<AttentionImplementation>,

    /// Overrides max_position_embeddings from config.json
    #[arg(long)]
    max_position_embeddings: Option<usize>,

    #[arg(long, default_value = "eval_results")]
    results_dir: PathBuf,

    /// Only evaluate the first N examples
    #[arg(long)]
    limit: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// cpu, cuda, cuda:N or mps. Uses CUDA when available if unset
    #[arg(long, value_parser = parse_device)]
    device: Option<Device>,

    #[arg(long, default_value_t = false)]
    quiet: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let seed = args.seed.unwrap_or_else(rand::random);
    let output_path = args
        .output_path
        .clone()
        .unwrap_or_else(|| default_output_path(&args.data_path));
    let human_score_names = args
        .human_score_names
        .split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .collect::<Vec<_>>();

    info!("Loading model...");
    let repo = resolve_repo_files(&args.model, args.cache_dir.clone(), !args.quiet)?;
    let mut model = LlamaForCausalLM::from_pretrained(
        &repo,
        Some(args.torch_dtype.kind()),
        args.attn_implementation,
        args.device,
        args.max_position_embeddings,
    )?;
    info!("Model loaded from {}", args.model);

    if let Some(load_lora) = &args.load_lora {
        info!("Loading lora model...");
        let adapter = resolve_repo_files(load_lora, args.cache_dir.clone(), !args.quiet)?;
        let merged = model.merge_lora(&adapter)?;
        info!("Merged {merged} lora layers from {load_lora}");
    }

    let mut tokenizer = auto_tokenizer(&repo)?;
    let declared = SpecialTokens::from_repo_files(&repo)?;
    let (special, _) = ensure_special_tokens(&mut tokenizer, &declared)?;
    model
        .resize_token_embeddings(tokenizer.get_vocab_size(true))
        .context("failed to resize token embeddings")?;

    let mut examples = load_examples(&args.data_path, args.limit)?;
    let prepared = PreparedEval::prepare(
        &examples,
        &tokenizer,
        &PromptOptions {
            default_task: args.task.clone(),
            max_input_tokens: args.max_eval_input_length,
            max_hypothesis_tokens: args.max_eval_hyp_length,
            model_max_length: args.model_max_length,
        },
    )?;

    let mut eos_token_ids = model.eos_token_ids();
    if !eos_token_ids.contains(&special.eos) {
        eos_token_ids.push(special.eos);
    }
    info!("Generating critiques with seed {seed}");
    let generations = prepared.run(
        &mut model,
        &tokenizer,
        &RunOptions {
            batch_size: args.batch_size,
            max_new_tokens: args.max_eval_output_length,
            pad_token_id: special.pad,
            eos_token_ids,
            seed,
            progress_bar: !args.quiet,
        },
    )?;

    annotate_examples(&mut examples, &generations)?;
    write_examples(&output_path, &examples)?;

    let human_scores = join_human_scores(&examples, &human_score_names)?;
    let report = CorrelationReport::compute(
        &examples,
        &human_scores,
        &human_score_names,
        &XGPTSCORE_METRICS,
    )?;
    report.log_summary();
    report.write(&args.results_dir, &output_path)?;
    Ok(())
}
