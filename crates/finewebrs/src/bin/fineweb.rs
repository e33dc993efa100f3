use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use fineweb_rs::corpus::{
    JsonlCorpus, LocalCorpus, DEFAULT_INPUT_GLOB, DEFAULT_LINES_PER_DOCUMENT, DEFAULT_SEED, DEFAULT_VAL_FRACTION,
};
use fineweb_rs::observability::init_logging;
use fineweb_rs::shard::Split;
use fineweb_rs::tokenizer::HfTokenizer;
use fineweb_rs::writer::{
    default_workers, ShardWriter, SplitPolicy, WriteSummary, WriterConfig, DEFAULT_PREFIX, DEFAULT_SHARD_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Source {
    /// JSON-lines documents from --url, first shard becomes validation
    #[value(alias = "1")]
    Remote,
    /// Text files matching --input-glob, with a seeded validation sample
    #[value(alias = "2")]
    Local,
}

/// Tokenize a text corpus into GPT-2 token shards.
#[derive(Parser, Debug)]
#[command(name = "fineweb", arg_required_else_help = true)]
struct Args {
    #[arg(long, value_enum)]
    source: Source,

    /// Output directory, created if absent
    #[arg(long, default_value = "edu_fineweb10B")]
    data_dir: PathBuf,

    /// Tokens per shard
    #[arg(long, default_value_t = DEFAULT_SHARD_SIZE)]
    shard_size: usize,

    #[arg(long, default_value = DEFAULT_PREFIX)]
    prefix: String,

    #[arg(long, default_value = DEFAULT_INPUT_GLOB)]
    input_glob: String,

    #[arg(long, default_value_t = DEFAULT_LINES_PER_DOCUMENT)]
    lines_per_document: usize,

    /// Fraction of local lines sampled into the validation split
    #[arg(long, default_value_t = DEFAULT_VAL_FRACTION)]
    val_fraction: f64,

    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u32,

    /// JSON-lines source, http(s) URL or local path; repeat for more.
    /// Required with the remote source
    #[arg(long = "url", required_if_eq_any([("source", "remote"), ("source", "1")]))]
    urls: Vec<String>,

    /// Tokenizer file or pretrained name
    #[arg(long, default_value = "gpt2")]
    tokenizer: String,

    /// Tokenizer threads
    #[arg(long, default_value_t = default_workers())]
    workers: usize,

    /// Hide the per-shard progress bar
    #[arg(long)]
    no_progress: bool,
}

fn report(label: &str, summary: &WriteSummary) {
    println!("{label}: {} documents, {} tokens, {} shards", summary.documents, summary.tokens, summary.shards.len());
    for path in &summary.shards {
        println!("  {}", path.display());
    }
}

fn main() -> anyhow::Result<()> {
    init_logging("info")?;
    let args = Args::parse();

    let tokenizer = HfTokenizer::load(&args.tokenizer).with_context(|| format!("loading tokenizer {}", args.tokenizer))?;
    let config = WriterConfig {
        out_dir: args.data_dir.clone(),
        prefix: args.prefix.clone(),
        shard_size: args.shard_size,
        workers: args.workers,
        progress: !args.no_progress,
    };

    println!("[fineweb]");
    println!("source: {:?}", args.source);
    println!("data_dir: {}", args.data_dir.display());
    println!("shard_size: {}", args.shard_size);
    println!("workers: {}", args.workers);

    let mut writer = ShardWriter::new(config, &tokenizer)?;
    match args.source {
        Source::Local => {
            let corpus = LocalCorpus {
                pattern: args.input_glob,
                lines_per_document: args.lines_per_document,
                val_fraction: args.val_fraction,
                seed: args.seed,
            };
            let docs = corpus.split_documents()?;
            println!("documents: {} train, {} val", docs.train.len(), docs.val.len());
            let train = writer.write_stream(docs.train, SplitPolicy::Fixed(Split::Train))?;
            report("train", &train);
            let val = writer.write_stream(docs.val, SplitPolicy::Fixed(Split::Val))?;
            report("val", &val);
        }
        Source::Remote => {
            let corpus = JsonlCorpus::new(args.urls)?;
            let summary = writer.write_stream(corpus, SplitPolicy::FirstShardVal)?;
            report("remote", &summary);
        }
    }
    Ok(())
}
