//! Collaborators the training loop drives: the model with its optimizer, and
//! the cross-rank reductions.

use std::path::Path;

use crate::error::Result;

/// Result of one forward pass.
#[derive(Debug, Clone, Default)]
pub struct ForwardOutput {
    /// (B, T, V) unnormalized log probabilities
    pub logits: Vec<f32>,
    /// mean cross-entropy over all (B, T) positions, when targets were given
    pub loss: Option<f32>,
}

/// Metadata stored next to the weights in a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckpointMeta {
    pub step: usize,
    pub val_loss: f32,
}

/// A trainable next-token model together with its optimizer state.
///
/// Gradients accumulate across `backward` calls until `zero_grad`.
#[allow(non_snake_case)]
pub trait LanguageModel {
    fn vocab_size(&self) -> usize;

    fn forward(&mut self, inputs: &[i32], targets: Option<&[i32]>, B: usize, T: usize) -> Result<ForwardOutput>;

    /// Backpropagate the loss of the last forward pass with targets,
    /// multiplied by `loss_scale`.
    fn backward(&mut self, loss_scale: f32) -> Result<()>;

    fn zero_grad(&mut self);

    /// Rescale gradients so their global L2 norm is at most `max_norm`.
    /// Returns the norm before clipping.
    fn clip_grad_norm(&mut self, max_norm: f32) -> f32;

    fn step(&mut self, learning_rate: f32, weight_decay: f32) -> Result<()>;

    /// Whether the next `backward` should synchronize gradients across ranks.
    fn set_grad_sync(&mut self, sync: bool);

    fn save_checkpoint(&self, path: &Path, meta: &CheckpointMeta) -> Result<()>;
}

/// Reductions across all ranks of a run.
pub trait Collective {
    fn all_reduce_mean(&self, value: f32) -> f32;
    fn all_reduce_sum(&self, value: u64) -> u64;
}

/// The trivial collective of a one-process run.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn all_reduce_mean(&self, value: f32) -> f32 {
        value
    }

    fn all_reduce_sum(&self, value: u64) -> u64 {
        value
    }
}
