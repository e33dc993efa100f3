use crate::error::{Error, Result};

pub const MIN_SEQ_LEN: usize = 64;
pub const MAX_SEQ_LEN: usize = 2048;
const SEQ_LEN_STEP: usize = 64;
/// Reserved for kernels, allocator slack and the CUDA context.
pub const OVERHEAD_BYTES: u64 = 1_000_000_000;
/// Micro batch size the search aims for before accumulating gradients.
const TARGET_MICRO_BATCH: usize = 1024;
const MAX_GRAD_ACCUM_STEPS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub micro_batch_size: usize,
    pub seq_len: usize,
    pub grad_accum_steps: usize,
}

impl BatchPlan {
    /// Tokens per optimizer step on one rank.
    pub fn total_batch_size(&self) -> usize {
        self.micro_batch_size * self.seq_len * self.grad_accum_steps
    }
}

/// Rough activation footprint of one sequence, forward and backward.
fn sample_memory(seq_len: usize, channels: usize) -> u64 {
    (seq_len * channels * 4 * 2) as u64
}

/// Search sequence lengths for the largest micro batch that fits in
/// `free_memory` next to the model weights. Ties go to the longer sequence.
pub fn plan_batch(free_memory: u64, model_bytes: u64, channels: usize, min_micro_batch_size: usize) -> Result<BatchPlan> {
    let available = free_memory
        .checked_sub(model_bytes.saturating_add(OVERHEAD_BYTES))
        .filter(|&bytes| bytes > 0)
        .ok_or_else(|| Error::Config(format!("not enough GPU memory: {free_memory} bytes free, model needs {model_bytes}")))?;
    if channels == 0 {
        return Err(Error::Config("model width must be positive".to_string()));
    }

    let mut best = BatchPlan { micro_batch_size: min_micro_batch_size, seq_len: MIN_SEQ_LEN, grad_accum_steps: 1 };
    for seq_len in (MIN_SEQ_LEN..=MAX_SEQ_LEN).step_by(SEQ_LEN_STEP) {
        let max_batch_size = (available / sample_memory(seq_len, channels)) as usize;
        if max_batch_size < min_micro_batch_size.max(1) {
            break;
        }
        let grad_accum_steps = TARGET_MICRO_BATCH.div_ceil(max_batch_size).clamp(1, MAX_GRAD_ACCUM_STEPS);
        let micro_batch_size = max_batch_size.min(TARGET_MICRO_BATCH / grad_accum_steps);

        if micro_batch_size > best.micro_batch_size
            || (micro_batch_size == best.micro_batch_size && seq_len > best.seq_len)
        {
            best = BatchPlan { micro_batch_size, seq_len, grad_accum_steps };
        }
    }

    if best.micro_batch_size == min_micro_batch_size && best.seq_len == MIN_SEQ_LEN {
        return Err(Error::Config(
            "could not find a batch configuration, reduce the minimum micro batch size or sequence length".to_string(),
        ));
    }
    Ok(best)
}
