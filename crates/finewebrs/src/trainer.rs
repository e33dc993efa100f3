use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{DistributedConfig, TrainConfig};
use crate::dataloader::Dataloader;
use crate::error::{Error, Result};
use crate::hellaswag;
use crate::logger::Logger;
use crate::model::{CheckpointMeta, Collective, LanguageModel};
use crate::random::Mt19937;
use crate::sampler::sample_top_k;
use crate::scheduler::LearningRateScheduler;
use crate::tokenizer::TokenEncoder;

/// Seed of the sampling generator on rank 0; rank r uses `SAMPLE_SEED + r`.
const SAMPLE_SEED: u32 = 42;

#[derive(Debug, Clone, Copy)]
pub struct StepStats {
    pub loss: f32,
    pub lr: f32,
    pub norm: f32,
    pub dt: Duration,
    pub tokens_per_sec: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrainSummary {
    pub steps: usize,
    pub last_train_loss: f32,
    pub last_val_loss: Option<f32>,
}

/// Runs the optimization loop with periodic validation, HellaSwag,
/// checkpoints and samples.
pub struct Trainer<'a, M: ?Sized, C: ?Sized, E: ?Sized> {
    config: &'a TrainConfig,
    dist: &'a DistributedConfig,
    model: &'a mut M,
    collective: &'a C,
    encoder: &'a E,
    train_loader: Dataloader,
    val_loader: Dataloader,
    scheduler: LearningRateScheduler,
    logger: Logger,
    grad_accum_steps: usize,
}

impl<'a, M, C, E> Trainer<'a, M, C, E>
where
    M: LanguageModel + ?Sized,
    C: Collective + ?Sized,
    E: TokenEncoder + ?Sized,
{
    pub fn new(
        config: &'a TrainConfig,
        dist: &'a DistributedConfig,
        model: &'a mut M,
        collective: &'a C,
        encoder: &'a E,
        train_loader: Dataloader,
        val_loader: Dataloader,
    ) -> Result<Self> {
        config.validate()?;
        let grad_accum_steps = config.grad_accum_steps(dist)?;
        let logger = Logger::init(&config.log_dir, dist.is_master)?;
        Ok(Self {
            config,
            dist,
            model,
            collective,
            encoder,
            train_loader,
            val_loader,
            scheduler: config.lr_scheduler(),
            logger,
            grad_accum_steps,
        })
    }

    pub fn grad_accum_steps(&self) -> usize {
        self.grad_accum_steps
    }

    fn on_cadence(step: usize, every: usize, last_step: bool) -> bool {
        step % every == 0 || last_step
    }

    pub fn run(&mut self) -> Result<TrainSummary> {
        let max_steps = self.config.max_steps;
        let mut summary = TrainSummary::default();

        for step in 0..max_steps {
            let last_step = step == max_steps - 1;

            // once in a while evaluate our validation loss
            if Self::on_cadence(step, self.config.val_every, last_step) {
                let val_loss = self.validate()?;
                summary.last_val_loss = Some(val_loss);
                if self.dist.is_master {
                    println!("validation loss: {:.4}", val_loss);
                    self.logger.log_val(step, val_loss)?;
                    if step > 0 && (step % self.config.checkpoint_every == 0 || last_step) {
                        self.save_checkpoint(step, val_loss)?;
                    }
                }
            }

            // once in a while evaluate hellaswag
            if let Some(path) = self.config.hellaswag.clone()
                && Self::on_cadence(step, self.config.val_every, last_step)
            {
                self.evaluate_hellaswag(step, &path)?;
            }

            // once in a while generate from the model (except step 0, which is noise)
            if (step > 0 && step % self.config.sample_every == 0) || last_step {
                for (i, sample) in self.generate()?.iter().enumerate() {
                    println!("rank {} sample {}: {}", self.dist.rank, i, sample);
                }
            }

            let stats = self.train_step(step)?;
            summary.steps = step + 1;
            summary.last_train_loss = stats.loss;
            if self.dist.is_master {
                println!(
                    "step {:5} | loss: {:.6} | lr {:.4e} | norm: {:.4} | dt: {:.2}ms | tok/sec: {:.2}",
                    step,
                    stats.loss,
                    stats.lr,
                    stats.norm,
                    stats.dt.as_secs_f64() * 1000.0,
                    stats.tokens_per_sec
                );
                self.logger.log_train(step, stats.loss)?;
            }
        }
        Ok(summary)
    }

    /// Mean loss over `val_steps` batches from the start of the validation
    /// split, averaged across ranks.
    #[allow(non_snake_case)]
    pub fn validate(&mut self) -> Result<f32> {
        let B = self.config.batch_size;
        let T = self.config.seq_len;
        self.val_loader.reset()?;
        let mut val_loss_accum = 0.0f32;
        for _ in 0..self.config.val_steps {
            let batch = self.val_loader.next_batch()?;
            let out = self.model.forward(&batch.inputs, Some(&batch.targets), B, T)?;
            let loss = out.loss.ok_or_else(|| Error::Model("forward with targets returned no loss".to_string()))?;
            val_loss_accum += loss / self.config.val_steps as f32;
        }
        Ok(self.collective.all_reduce_mean(val_loss_accum))
    }

    fn save_checkpoint(&mut self, step: usize, val_loss: f32) -> Result<PathBuf> {
        let path = self.config.log_dir.join(format!("model_{:05}.bin", step));
        self.model.save_checkpoint(&path, &CheckpointMeta { step, val_loss })?;
        info!(path = %path.display(), step, "checkpoint written");
        Ok(path)
    }

    /// Accuracy over the whole file, each rank scoring its share. Returns
    /// `None` when no example was scored.
    pub fn evaluate_hellaswag(&mut self, step: usize, path: &Path) -> Result<Option<f32>> {
        let (correct, total) = hellaswag::evaluate(&mut *self.model, self.encoder, path, self.dist.rank, self.dist.world_size)?;
        let num_correct_norm = self.collective.all_reduce_sum(correct);
        let num_total = self.collective.all_reduce_sum(total);
        if num_total == 0 {
            warn!(path = %path.display(), "no hellaswag examples scored");
            return Ok(None);
        }
        let acc_norm = num_correct_norm as f32 / num_total as f32;
        if self.dist.is_master {
            println!("HellaSwag accuracy: {}/{}={:.4}", num_correct_norm, num_total, acc_norm);
            self.logger.log_eval(step, acc_norm)?;
        }
        Ok(Some(acc_norm))
    }

    /// Continue the prompt `num_return_sequences` times with top-k sampling.
    pub fn generate(&mut self) -> Result<Vec<String>> {
        let rows = self.config.num_return_sequences;
        let max_length = self.config.max_length;
        let mut prompt = self.encoder.encode(&self.config.prompt)?;
        if prompt.is_empty() {
            prompt.push(self.encoder.eot_token());
        }
        let mut xgen: Vec<Vec<i32>> = Vec::with_capacity(rows);
        for _ in 0..rows {
            let row = prompt
                .iter()
                .map(|&t| i32::try_from(t).map_err(|_| Error::TokenOutOfRange { token: t }))
                .collect::<Result<Vec<i32>>>()?;
            xgen.push(row);
        }

        let vocab_size = self.model.vocab_size();
        let mut rng = Mt19937::new(SAMPLE_SEED + self.dist.rank as u32);
        let mut len = prompt.len();
        while len < max_length && rows > 0 {
            let flat: Vec<i32> = xgen.iter().flatten().copied().collect();
            let out = self.model.forward(&flat, None, rows, len)?;
            for (r, row) in xgen.iter_mut().enumerate() {
                // logits of the last position of this row
                let offset = (r * len + len - 1) * vocab_size;
                let logits = &out.logits[offset..offset + vocab_size];
                let next = sample_top_k(logits, self.config.top_k, rng.randf32());
                row.push(next as i32);
            }
            len += 1;
        }

        xgen.iter()
            .map(|row| {
                let ids: Vec<u32> = row.iter().take(max_length).map(|&t| t as u32).collect();
                self.encoder.decode(&ids)
            })
            .collect()
    }

    /// One optimizer step over `grad_accum_steps` micro batches.
    #[allow(non_snake_case)]
    pub fn train_step(&mut self, step: usize) -> Result<StepStats> {
        let B = self.config.batch_size;
        let T = self.config.seq_len;
        let t0 = Instant::now();

        self.model.zero_grad();
        let mut loss_accum = 0.0f32;
        for micro_step in 0..self.grad_accum_steps {
            let batch = self.train_loader.next_batch()?;
            // only sync gradients on the last micro step
            self.model.set_grad_sync(micro_step == self.grad_accum_steps - 1);
            let out = self.model.forward(&batch.inputs, Some(&batch.targets), B, T)?;
            let loss = out.loss.ok_or_else(|| Error::Model("forward with targets returned no loss".to_string()))?;
            // the gradients add up over micro steps, so scale each one down
            loss_accum += loss / self.grad_accum_steps as f32;
            self.model.backward(1.0 / self.grad_accum_steps as f32)?;
            debug!(step, micro_step, loss, "micro step");
        }
        let loss = self.collective.all_reduce_mean(loss_accum);
        let norm = self.model.clip_grad_norm(self.config.grad_clip);
        let lr = self.scheduler.get_learning_rate(step);
        self.model.step(lr, self.config.weight_decay)?;

        let dt = t0.elapsed();
        let tokens_processed = B * T * self.grad_accum_steps * self.dist.world_size;
        let tokens_per_sec = tokens_processed as f64 / dt.as_secs_f64().max(1e-9);
        Ok(StepStats { loss, lr, norm, dt, tokens_per_sec })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ForwardOutput, SingleProcess};
    use crate::shard::{shard_path, write_shard, Split};
    use crate::tokenizer::testing::ByteTokenizer;
    use clap::Parser;
    use std::fs;
    use tempfile::TempDir;

    const VOCAB: usize = 300;

    /// Constant loss, flat logits, records what the loop asks of it.
    #[derive(Default)]
    struct MockModel {
        forwards: usize,
        backwards: usize,
        loss_scales: Vec<f32>,
        grad_syncs: Vec<bool>,
        zero_grads: usize,
        steps: Vec<f32>,
    }

    #[allow(non_snake_case)]
    impl LanguageModel for MockModel {
        fn vocab_size(&self) -> usize {
            VOCAB
        }

        fn forward(&mut self, inputs: &[i32], targets: Option<&[i32]>, B: usize, T: usize) -> Result<ForwardOutput> {
            assert_eq!(inputs.len(), B * T);
            self.forwards += 1;
            Ok(ForwardOutput { logits: vec![0.0; B * T * VOCAB], loss: targets.map(|_| 2.0) })
        }

        fn backward(&mut self, loss_scale: f32) -> Result<()> {
            self.backwards += 1;
            self.loss_scales.push(loss_scale);
            Ok(())
        }

        fn zero_grad(&mut self) {
            self.zero_grads += 1;
        }

        fn clip_grad_norm(&mut self, _max_norm: f32) -> f32 {
            0.5
        }

        fn step(&mut self, learning_rate: f32, _weight_decay: f32) -> Result<()> {
            self.steps.push(learning_rate);
            Ok(())
        }

        fn set_grad_sync(&mut self, sync: bool) {
            self.grad_syncs.push(sync);
        }

        fn save_checkpoint(&self, path: &Path, meta: &CheckpointMeta) -> Result<()> {
            fs::write(path, format!("{} {}", meta.step, meta.val_loss))?;
            Ok(())
        }
    }

    fn shards(dir: &Path) {
        write_shard(&shard_path(dir, "test", Split::Train, 0), &(0..100).collect::<Vec<u16>>()).unwrap();
        write_shard(&shard_path(dir, "test", Split::Val, 0), &(100..150).collect::<Vec<u16>>()).unwrap();
    }

    fn config(dir: &Path, extra: &[&str]) -> TrainConfig {
        let data_dir = dir.display().to_string();
        let log_dir = dir.join("log").display().to_string();
        let mut args = vec![
            "train_gpt2", "--data-dir", data_dir.as_str(), "--prefix", "test", "--log-dir", log_dir.as_str(),
            "-b", "2", "-t", "4", "--total-batch-size", "16",
            "--max-steps", "3", "--warmup-steps", "1", "--max-lr", "0.01",
            "--val-every", "2", "--val-steps", "2", "--checkpoint-every", "2", "--sample-every", "2",
            "--num-return-sequences", "2", "--max-length", "8", "--prompt", "Hi",
        ];
        args.extend_from_slice(extra);
        TrainConfig::try_parse_from(args).unwrap()
    }

    fn loaders(config: &TrainConfig) -> (Dataloader, Dataloader) {
        let train = Dataloader::new(&config.data_dir, &config.prefix, Split::Train, config.batch_size, config.seq_len, 0, 1).unwrap();
        let val = Dataloader::new(&config.data_dir, &config.prefix, Split::Val, config.batch_size, config.seq_len, 0, 1).unwrap();
        (train, val)
    }

    #[test]
    fn test_loop_accumulates_and_logs() {
        let dir = TempDir::new().unwrap();
        shards(dir.path());
        let hella = dir.path().join("hellaswag_val.jsonl");
        fs::write(&hella, "{\"ctx\": \"a\", \"label\": 0, \"endings\": [\"b\", \"c\"]}\n{\"ctx\": \"d\", \"label\": 0, \"endings\": [\"e\", \"f\"]}\n").unwrap();
        let config = config(dir.path(), &["--hellaswag", hella.to_str().unwrap()]);
        let dist = DistributedConfig::single();
        let (train, val) = loaders(&config);
        let mut model = MockModel::default();

        let summary = {
            let mut trainer = Trainer::new(&config, &dist, &mut model, &SingleProcess, &ByteTokenizer, train, val).unwrap();
            assert_eq!(trainer.grad_accum_steps(), 2);
            trainer.run().unwrap()
        };

        assert_eq!(summary.steps, 3);
        assert_eq!(summary.last_train_loss, 2.0);
        assert_eq!(summary.last_val_loss, Some(2.0));
        // two micro steps per optimizer step, gradients synced on the last one
        assert_eq!(model.backwards, 6);
        assert_eq!(model.zero_grads, 3);
        assert!(model.loss_scales.iter().all(|&s| s == 0.5));
        assert_eq!(model.grad_syncs, [false, true, false, true, false, true]);
        assert_eq!(model.steps.len(), 3);

        let log = fs::read_to_string(dir.path().join("log").join("log.txt")).unwrap();
        assert_eq!(
            log,
            "0 val 2.0000\n0 hella 1.0000\n0 train 2.000000\n\
             1 train 2.000000\n\
             2 val 2.0000\n2 hella 1.0000\n2 train 2.000000\n"
        );
        // last step writes a checkpoint, step 0 never does
        assert!(dir.path().join("log").join("model_00002.bin").exists());
        assert!(!dir.path().join("log").join("model_00000.bin").exists());
    }

    #[test]
    fn test_learning_rate_follows_schedule() {
        let dir = TempDir::new().unwrap();
        shards(dir.path());
        let config = config(dir.path(), &["--scheduler", "constant"]);
        let dist = DistributedConfig::single();
        let (train, val) = loaders(&config);
        let mut model = MockModel::default();
        Trainer::new(&config, &dist, &mut model, &SingleProcess, &ByteTokenizer, train, val)
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(model.steps, [0.01, 0.01, 0.01]);
    }

    #[test]
    fn test_generate_extends_prompt() {
        let dir = TempDir::new().unwrap();
        shards(dir.path());
        let config = config(dir.path(), &["--top-k", "1"]);
        let dist = DistributedConfig::single();
        let (train, val) = loaders(&config);
        let mut model = MockModel::default();
        let mut trainer = Trainer::new(&config, &dist, &mut model, &SingleProcess, &ByteTokenizer, train, val).unwrap();

        let samples = trainer.generate().unwrap();
        assert_eq!(samples.len(), 2);
        // flat logits with top-1 always pick token 0, which decodes to NUL
        for sample in &samples {
            assert!(sample.starts_with("Hi"));
            assert_eq!(sample.len(), 8);
        }
    }

    #[test]
    fn test_uneven_total_batch_rejected() {
        let dir = TempDir::new().unwrap();
        shards(dir.path());
        let config = config(dir.path(), &["--total-batch-size", "12"]);
        let dist = DistributedConfig::single();
        let (train, val) = loaders(&config);
        let mut model = MockModel::default();
        let result = Trainer::new(&config, &dist, &mut model, &SingleProcess, &ByteTokenizer, train, val);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_non_master_writes_nothing() {
        let dir = TempDir::new().unwrap();
        shards(dir.path());
        let config = config(dir.path(), &[]);
        let dist = DistributedConfig { rank: 1, local_rank: 1, world_size: 2, is_master: false };
        let train = Dataloader::new(&config.data_dir, &config.prefix, Split::Train, 2, 4, 1, 2).unwrap();
        let val = Dataloader::new(&config.data_dir, &config.prefix, Split::Val, 2, 4, 1, 2).unwrap();
        let mut model = MockModel::default();
        let config = TrainConfig { total_batch_size: Some(32), ..config };
        Trainer::new(&config, &dist, &mut model, &SingleProcess, &ByteTokenizer, train, val)
            .unwrap()
            .run()
            .unwrap();
        // no log and no checkpoints off the master
        assert!(!dir.path().join("log").exists());
    }
}
