use anyhow::{bail, Context};
use clap::Parser;
use fineweb_rs::batch_planner::plan_batch;
use fineweb_rs::bigram::BigramModel;
use fineweb_rs::config::{DistributedConfig, TrainConfig};
use fineweb_rs::dataloader::Dataloader;
use fineweb_rs::device::{free_gpu_memory, probe_gpus, Precision};
use fineweb_rs::model::{LanguageModel, SingleProcess};
use fineweb_rs::observability::init_logging;
use fineweb_rs::shard::Split;
use fineweb_rs::tokenizer::HfTokenizer;
use fineweb_rs::trainer::Trainer;
use tracing::info;

/// Replace B, T and the total batch size with the largest plan that fits the
/// free memory of this rank's GPU.
fn auto_batch(config: &mut TrainConfig, dist: &DistributedConfig, num_parameters: usize) -> anyhow::Result<()> {
    let report = probe_gpus().context("--auto-batch needs NVML")?;
    let precision = Precision::recommended(&report.devices);
    let free = free_gpu_memory(dist.local_rank as u32)?;
    let model_bytes = (num_parameters * precision.size_bytes()) as u64;
    let plan = plan_batch(free, model_bytes, config.channels, 1)?;
    info!(?plan, precision = precision.as_str(), free, "batch plan");

    config.batch_size = plan.micro_batch_size;
    config.seq_len = plan.seq_len;
    config.total_batch_size = Some(plan.total_batch_size() * dist.world_size);
    Ok(())
}

/// Fresh weights, or the weights of `--init-from` when given. A checkpoint
/// must match the tokenizer's vocabulary and the configured width.
fn build_model(config: &TrainConfig, vocab_size: usize) -> anyhow::Result<BigramModel> {
    let Some(path) = &config.init_from else {
        return Ok(BigramModel::new(vocab_size, config.channels, config.seed));
    };
    let (model, meta) = BigramModel::from_checkpoint(path).with_context(|| format!("loading checkpoint {}", path.display()))?;
    if model.vocab_size() != vocab_size || model.channels() != config.channels {
        bail!(
            "checkpoint {} has vocab {} and width {}, expected {} and {}",
            path.display(),
            model.vocab_size(),
            model.channels(),
            vocab_size,
            config.channels
        );
    }
    info!(path = %path.display(), step = meta.step, val_loss = meta.val_loss, "initialized from checkpoint");
    Ok(model)
}

// main training loop
fn main() -> anyhow::Result<()> {
    init_logging("info")?;
    let mut config = TrainConfig::parse();
    let dist = DistributedConfig::from_env()?;
    if dist.world_size > 1 {
        bail!("WORLD_SIZE={} but only single-process training has a collective backend", dist.world_size);
    }

    let tokenizer = HfTokenizer::load(&config.tokenizer).with_context(|| format!("loading tokenizer {}", config.tokenizer))?;
    let mut model = build_model(&config, tokenizer.vocab_size())?;
    if config.auto_batch {
        auto_batch(&mut config, &dist, model.num_parameters())?;
    }
    let grad_accum_steps = config.grad_accum_steps(&dist)?;

    println!("[BigramModel]");
    println!("vocab_size: {}", tokenizer.vocab_size());
    println!("channels: {}", model.channels());
    println!("num_parameters: {}", model.num_parameters());
    println!("[Training]");
    println!("rank: {} / {}", dist.rank, dist.world_size);
    println!("batch_size B: {}", config.batch_size);
    println!("seq_len T: {}", config.seq_len);
    println!("total_batch_size: {}", config.total_batch_size(&dist));
    println!("grad_accum_steps: {}", grad_accum_steps);
    println!("max_steps: {}", config.max_steps);
    println!("scheduler: {:?} max_lr {} warmup {}", config.scheduler, config.max_lr, config.warmup_steps);

    let (data_dir, prefix) = (&config.data_dir, config.prefix.as_str());
    let train_loader = Dataloader::new(data_dir, prefix, Split::Train, config.batch_size, config.seq_len, dist.rank, dist.world_size)?;
    let val_loader = Dataloader::new(data_dir, prefix, Split::Val, config.batch_size, config.seq_len, dist.rank, dist.world_size)?;
    let tokens_per_step = config.total_batch_size(&dist);
    println!("train shards: {} ({} tokens)", train_loader.num_shards(), train_loader.num_tokens());
    println!("val shards: {} ({} tokens)", val_loader.num_shards(), val_loader.num_tokens());
    println!("train dataset num_batches: {}", train_loader.num_tokens() / tokens_per_step);
    println!("val dataset num_batches: {}", val_loader.num_tokens() / tokens_per_step);

    let summary = Trainer::new(&config, &dist, &mut model, &SingleProcess, &tokenizer, train_loader, val_loader)?.run()?;
    println!("trained {} steps, final train loss {:.6}", summary.steps, summary.last_train_loss);
    if let Some(val_loss) = summary.last_val_loss {
        println!("final val loss {:.4}", val_loss);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fineweb_rs::model::CheckpointMeta;
    use tempfile::TempDir;

    #[test]
    fn test_build_model_from_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model_00100.bin");
        let saved = BigramModel::new(50, 8, 3);
        saved.save_checkpoint(&path, &CheckpointMeta { step: 100, val_loss: 3.5 }).unwrap();

        let path_arg = path.display().to_string();
        let config = TrainConfig::try_parse_from(["train_gpt2", "--channels", "8", "--init-from", path_arg.as_str()]).unwrap();
        let mut loaded = build_model(&config, 50).unwrap();
        let mut expected = saved;
        let inputs = [1, 7, 49];
        assert_eq!(loaded.forward(&inputs, None, 1, 3).unwrap().logits, expected.forward(&inputs, None, 1, 3).unwrap().logits);

        // the tokenizer and the checkpoint must agree on the vocabulary
        assert!(build_model(&config, 51).is_err());
    }

    #[test]
    fn test_build_model_fresh() {
        let config = TrainConfig::try_parse_from(["train_gpt2", "--channels", "4"]).unwrap();
        let model = build_model(&config, 10).unwrap();
        assert_eq!(model.num_parameters(), 10 * 4 * 2 + 10);
    }
}
