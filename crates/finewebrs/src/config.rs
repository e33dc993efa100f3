use std::path::PathBuf;

use clap::Parser;

use crate::error::{Error, Result};
use crate::scheduler::{LearningRateScheduler, SchedulerKind};
use crate::writer::DEFAULT_PREFIX;

/// Process placement within a multi-process run, read once from the launcher's
/// environment and passed by reference from there on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedConfig {
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
    /// rank 0 does the logging and checkpointing
    pub is_master: bool,
}

impl DistributedConfig {
    pub fn single() -> Self {
        Self { rank: 0, local_rank: 0, world_size: 1, is_master: true }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `RANK` absent means a single-process run. When it is present,
    /// `LOCAL_RANK` and `WORLD_SIZE` must be present too.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(rank) = lookup("RANK") else {
            return Ok(Self::single());
        };
        let parse = |key: &str, value: Option<String>| -> Result<usize> {
            let value = value.ok_or_else(|| Error::Config(format!("RANK is set but {key} is not")))?;
            value.trim().parse().map_err(|_| Error::Config(format!("{key}={value:?} is not a non-negative integer")))
        };
        let rank = parse("RANK", Some(rank))?;
        let local_rank = parse("LOCAL_RANK", lookup("LOCAL_RANK"))?;
        let world_size = parse("WORLD_SIZE", lookup("WORLD_SIZE"))?;
        if world_size == 0 || rank >= world_size {
            return Err(Error::Config(format!("rank {rank} outside world of size {world_size}")));
        }
        Ok(Self { rank, local_rank, world_size, is_master: rank == 0 })
    }
}

/// Training hyperparameters.
#[derive(Parser, Debug, Clone)]
#[command(name = "train_gpt2", about = "Pretrain a language model on token shards")]
pub struct TrainConfig {
    /// Directory holding the `{prefix}_train_*.bin` and `{prefix}_val_*.bin` shards
    #[arg(long, default_value = "edu_fineweb10B")]
    pub data_dir: PathBuf,

    /// Dataset prefix of the shard file names
    #[arg(long, default_value = DEFAULT_PREFIX)]
    pub prefix: String,

    /// Micro batch size (sequences per forward pass)
    #[arg(short = 'b', long, default_value_t = 64)]
    pub batch_size: usize,

    /// Sequence length
    #[arg(short = 't', long, default_value_t = 1024)]
    pub seq_len: usize,

    /// Tokens per optimizer step across all ranks, defaults to B*T*world_size
    #[arg(long)]
    pub total_batch_size: Option<usize>,

    /// Pick B, T and gradient accumulation from free GPU memory
    #[arg(long)]
    pub auto_batch: bool,

    #[arg(long, default_value_t = 19073)]
    pub max_steps: usize,

    #[arg(long, default_value_t = 715)]
    pub warmup_steps: usize,

    #[arg(long, default_value_t = 6e-4)]
    pub max_lr: f32,

    /// Final learning rate as a fraction of the maximum
    #[arg(long, default_value_t = 0.1)]
    pub min_lr_frac: f32,

    /// cosine, linear, constant or wsd
    #[arg(long, default_value = "cosine")]
    pub scheduler: SchedulerKind,

    #[arg(long, default_value_t = 0.1)]
    pub weight_decay: f32,

    #[arg(long, default_value_t = 1.0)]
    pub grad_clip: f32,

    #[arg(long, default_value_t = 250)]
    pub val_every: usize,

    #[arg(long, default_value_t = 20)]
    pub val_steps: usize,

    #[arg(long, default_value_t = 5000)]
    pub checkpoint_every: usize,

    #[arg(long, default_value_t = 250)]
    pub sample_every: usize,

    #[arg(long, default_value_t = 4)]
    pub num_return_sequences: usize,

    /// Length of generated samples, prompt included
    #[arg(long, default_value_t = 32)]
    pub max_length: usize,

    /// 0 samples from the full distribution
    #[arg(long, default_value_t = 50)]
    pub top_k: usize,

    #[arg(long, default_value = "Hello, I'm a language model,")]
    pub prompt: String,

    /// HellaSwag validation JSONL; evaluation is skipped when absent
    #[arg(long)]
    pub hellaswag: Option<PathBuf>,

    #[arg(long, default_value = "log")]
    pub log_dir: PathBuf,

    /// Tokenizer file or pretrained name
    #[arg(long, default_value = "gpt2")]
    pub tokenizer: String,

    /// Embedding width of the reference model
    #[arg(long, default_value_t = 768)]
    pub channels: usize,

    /// Seed for parameter initialization
    #[arg(long, default_value_t = 1337)]
    pub seed: u32,

    /// Start from the weights of a saved checkpoint instead of a fresh init
    #[arg(long)]
    pub init_from: Option<PathBuf>,
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.seq_len == 0 {
            return Err(Error::Config("batch size and sequence length must be positive".to_string()));
        }
        if self.max_steps == 0 {
            return Err(Error::Config("max steps must be positive".to_string()));
        }
        if self.val_every == 0 || self.sample_every == 0 || self.checkpoint_every == 0 {
            return Err(Error::Config("evaluation intervals must be positive".to_string()));
        }
        if self.max_length == 0 {
            return Err(Error::Config("generation length must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.min_lr_frac) {
            return Err(Error::Config(format!("min lr fraction {} outside [0, 1]", self.min_lr_frac)));
        }
        Ok(())
    }

    /// Tokens processed per micro step on one rank.
    pub fn tokens_per_micro_step(&self) -> usize {
        self.batch_size * self.seq_len
    }

    pub fn total_batch_size(&self, dist: &DistributedConfig) -> usize {
        self.total_batch_size.unwrap_or(self.tokens_per_micro_step() * dist.world_size)
    }

    /// Micro steps per optimizer step. The total batch must split evenly
    /// over `B * T * world_size`.
    pub fn grad_accum_steps(&self, dist: &DistributedConfig) -> Result<usize> {
        let per_step = self.tokens_per_micro_step() * dist.world_size;
        let total = self.total_batch_size(dist);
        if per_step == 0 || total == 0 || total % per_step != 0 {
            return Err(Error::Config(format!(
                "total batch size {total} is not a multiple of B*T*world_size = {per_step}"
            )));
        }
        Ok(total / per_step)
    }

    pub fn lr_scheduler(&self) -> LearningRateScheduler {
        LearningRateScheduler::new(self.scheduler, self.max_lr, self.warmup_steps, self.max_steps, self.min_lr_frac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_single_process_without_rank() {
        let dist = DistributedConfig::from_lookup(env(&[("WORLD_SIZE", "8")])).unwrap();
        assert_eq!(dist, DistributedConfig::single());
    }

    #[test]
    fn test_distributed_from_env() {
        let dist = DistributedConfig::from_lookup(env(&[("RANK", "3"), ("LOCAL_RANK", "1"), ("WORLD_SIZE", "4")])).unwrap();
        assert_eq!(dist.rank, 3);
        assert_eq!(dist.local_rank, 1);
        assert_eq!(dist.world_size, 4);
        assert!(!dist.is_master);
    }

    #[test]
    fn test_distributed_env_errors() {
        assert!(DistributedConfig::from_lookup(env(&[("RANK", "0")])).is_err());
        assert!(DistributedConfig::from_lookup(env(&[("RANK", "x"), ("LOCAL_RANK", "0"), ("WORLD_SIZE", "2")])).is_err());
        assert!(DistributedConfig::from_lookup(env(&[("RANK", "2"), ("LOCAL_RANK", "0"), ("WORLD_SIZE", "2")])).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = TrainConfig::try_parse_from(["train_gpt2"]).unwrap();
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.seq_len, 1024);
        assert_eq!(config.max_steps, 19073);
        assert_eq!(config.warmup_steps, 715);
        assert_eq!(config.scheduler, SchedulerKind::Cosine);
        assert_eq!(config.prompt, "Hello, I'm a language model,");
        assert_eq!(config.prefix, "edufineweb");
        assert!(config.init_from.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_grad_accum_steps() {
        let config = TrainConfig::try_parse_from(["train_gpt2", "-b", "16", "-t", "1024", "--total-batch-size", "524288"]).unwrap();
        let dist = DistributedConfig { rank: 0, local_rank: 0, world_size: 8, is_master: true };
        assert_eq!(config.grad_accum_steps(&dist).unwrap(), 4);
        assert_eq!(config.grad_accum_steps(&DistributedConfig::single()).unwrap(), 32);

        let uneven = TrainConfig::try_parse_from(["train_gpt2", "-b", "3", "-t", "1000", "--total-batch-size", "524288"]).unwrap();
        assert!(matches!(uneven.grad_accum_steps(&DistributedConfig::single()), Err(Error::Config(_))));
    }

    #[test]
    fn test_total_batch_defaults_to_one_micro_step() {
        let config = TrainConfig::try_parse_from(["train_gpt2", "-b", "4", "-t", "64"]).unwrap();
        let dist = DistributedConfig { rank: 1, local_rank: 1, world_size: 2, is_master: false };
        assert_eq!(config.total_batch_size(&dist), 512);
        assert_eq!(config.grad_accum_steps(&dist).unwrap(), 1);
    }

    #[test]
    fn test_unknown_scheduler_rejected() {
        assert!(TrainConfig::try_parse_from(["train_gpt2", "--scheduler", "step"]).is_err());
    }
}
