/*
Reference CPU language model: a token embedding followed by an output
projection, trained with AdamW. Every position predicts the next token from
the current token only, so it is a bigram model with a C-dimensional
bottleneck. It exists so the training driver can run end to end without a GPU
runtime; anything implementing LanguageModel can take its place.
*/

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::model::{CheckpointMeta, ForwardOutput, LanguageModel};
use crate::random::{normal_, Mt19937};
use crate::shard::{read_le_u32_array, HEADER_SIZE};

pub const CHECKPOINT_MAGIC: u32 = 20240326;
pub const CHECKPOINT_VERSION: u32 = 1;

pub const NUM_PARAMETER_TENSORS: usize = 3;

const BETA1: f32 = 0.9;
const BETA2: f32 = 0.95;
const EPS: f32 = 1e-8;

struct ParameterTensors<'a> {
    wte: &'a mut [f32],   // (V, C)
    wproj: &'a mut [f32], // (V, C)
    bproj: &'a mut [f32], // (V)
}

// what backward needs from the last forward pass with targets
#[allow(non_snake_case)]
struct ForwardCache {
    inputs: Vec<i32>,
    targets: Vec<i32>,
    hidden: Vec<f32>, // (B, T, C)
    probs: Vec<f32>,  // (B, T, V)
    B: usize,
    T: usize,
}

pub struct BigramModel {
    vocab_size: usize,
    channels: usize,
    param_sizes: [usize; NUM_PARAMETER_TENSORS],
    params_memory: Vec<f32>,
    grads_memory: Vec<f32>,
    // buffers for the AdamW optimizer
    m_memory: Option<Vec<f32>>,
    v_memory: Option<Vec<f32>>,
    optimizer_steps: u32,
    cache: Option<ForwardCache>,
}

impl BigramModel {
    pub fn new(vocab_size: usize, channels: usize, seed: u32) -> Self {
        let mut model = Self::zeros(vocab_size, channels);
        let mut rng = Mt19937::new(seed);
        let params = get_parameters(&mut model.params_memory, model.param_sizes);
        normal_(params.wte, 0.0, 0.02, &mut rng);
        normal_(params.wproj, 0.0, 0.02, &mut rng);
        model
    }

    #[allow(non_snake_case)]
    fn zeros(V: usize, C: usize) -> Self {
        let param_sizes = [V * C, V * C, V];
        let num_parameters: usize = param_sizes.iter().sum();
        Self {
            vocab_size: V,
            channels: C,
            param_sizes,
            params_memory: vec![0.0; num_parameters],
            grads_memory: vec![0.0; num_parameters],
            m_memory: None,
            v_memory: None,
            optimizer_steps: 0,
            cache: None,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn num_parameters(&self) -> usize {
        self.params_memory.len()
    }

    /// Load the weights written by `save_checkpoint`. Optimizer state starts
    /// fresh.
    pub fn from_checkpoint(path: &Path) -> Result<(Self, CheckpointMeta)> {
        let mut reader = BufReader::new(File::open(path)?);
        let header: [u32; HEADER_SIZE] = read_le_u32_array(&mut reader)?;
        if header[0] != CHECKPOINT_MAGIC {
            return Err(Error::Model(format!("bad magic in checkpoint {path:?}")));
        }
        if header[1] != CHECKPOINT_VERSION {
            return Err(Error::Model(format!("unsupported checkpoint version {} in {path:?}", header[1])));
        }
        let mut model = Self::zeros(header[2] as usize, header[3] as usize);
        let meta = CheckpointMeta { step: header[4] as usize, val_loss: f32::from_bits(header[5]) };

        reader.read_exact(bytemuck::cast_slice_mut(&mut model.params_memory))?;
        for p in model.params_memory.iter_mut() {
            *p = f32::from_bits(u32::from_le(p.to_bits()));
        }
        Ok((model, meta))
    }

    #[cfg(test)]
    fn grads(&self) -> &[f32] {
        &self.grads_memory
    }
}

fn get_parameters(memory: &mut [f32], sizes: [usize; NUM_PARAMETER_TENSORS]) -> ParameterTensors<'_> {
    let (wte, rest) = memory.split_at_mut(sizes[0]);
    let (wproj, bproj) = rest.split_at_mut(sizes[1]);
    ParameterTensors { wte, wproj, bproj }
}

impl LanguageModel for BigramModel {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    #[allow(non_snake_case)]
    fn forward(&mut self, inputs: &[i32], targets: Option<&[i32]>, B: usize, T: usize) -> Result<ForwardOutput> {
        let V = self.vocab_size;
        let C = self.channels;
        let BT = B * T;
        if inputs.len() != BT || targets.is_some_and(|t| t.len() != BT) {
            return Err(Error::Model(format!("expected {BT} tokens for B={B}, T={T}")));
        }
        for &tok in inputs.iter().chain(targets.unwrap_or_default()) {
            if tok < 0 || tok as usize >= V {
                return Err(Error::Model(format!("token {tok} outside vocabulary of {V}")));
            }
        }

        let params = get_parameters(&mut self.params_memory, self.param_sizes);
        let mut hidden = vec![0.0f32; BT * C];
        encoder_forward(&mut hidden, inputs, params.wte, C);
        let mut logits = vec![0.0f32; BT * V];
        matmul_forward(&mut logits, &hidden, params.wproj, params.bproj, C, V);

        let Some(targets) = targets else {
            self.cache = None;
            return Ok(ForwardOutput { logits, loss: None });
        };

        let mut probs = vec![0.0f32; BT * V];
        softmax_forward(&mut probs, &logits, V);
        let mut losses = vec![0.0f32; BT];
        crossentropy_forward(&mut losses, &probs, targets, V);
        let mean_loss = losses.iter().sum::<f32>() / BT as f32;

        self.cache = Some(ForwardCache { inputs: inputs.to_vec(), targets: targets.to_vec(), hidden, probs, B, T });
        Ok(ForwardOutput { logits, loss: Some(mean_loss) })
    }

    #[allow(non_snake_case)]
    fn backward(&mut self, loss_scale: f32) -> Result<()> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| Error::Model("must forward with targets before backward".to_string()))?;
        let V = self.vocab_size;
        let C = self.channels;
        let BT = cache.B * cache.T;

        // the loss is the mean over all (B,T) positions
        let dloss = loss_scale / BT as f32;
        let mut dlogits = vec![0.0f32; BT * V];
        crossentropy_softmax_backward(&mut dlogits, &cache.probs, &cache.targets, dloss, V);

        let mut dhidden = vec![0.0f32; BT * C];
        let params = get_parameters(&mut self.params_memory, self.param_sizes);
        let grads = get_parameters(&mut self.grads_memory, self.param_sizes);
        matmul_backward(&mut dhidden, grads.wproj, grads.bproj, &dlogits, &cache.hidden, params.wproj, C, V);
        encoder_backward(grads.wte, &dhidden, &cache.inputs, C);
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.grads_memory.fill(0.0);
    }

    fn clip_grad_norm(&mut self, max_norm: f32) -> f32 {
        let norm = self.grads_memory.iter().map(|&g| g * g).sum::<f32>().sqrt();
        if max_norm > 0.0 && norm > max_norm {
            let scale = max_norm / (norm + 1e-6);
            self.grads_memory.iter_mut().for_each(|g| *g *= scale);
        }
        norm
    }

    fn step(&mut self, learning_rate: f32, weight_decay: f32) -> Result<()> {
        // reference: https://pytorch.org/docs/stable/generated/torch.optim.AdamW.html
        let n = self.params_memory.len();
        let m_memory = self.m_memory.get_or_insert_with(|| vec![0f32; n]);
        let v_memory = self.v_memory.get_or_insert_with(|| vec![0f32; n]);
        self.optimizer_steps += 1;
        let t = self.optimizer_steps as i32;

        // only the 2D tensors are decayed, biases are not
        let decayed = self.param_sizes[0] + self.param_sizes[1];
        for i in 0..n {
            let param = self.params_memory[i];
            let grad = self.grads_memory[i];
            let wd = if i < decayed { weight_decay } else { 0.0 };

            // update the first moment (momentum)
            let m = BETA1 * m_memory[i] + (1.0 - BETA1) * grad;
            // update the second moment (RMSprop)
            let v = BETA2 * v_memory[i] + (1.0 - BETA2) * grad * grad;
            // bias-correct both moments
            let m_hat = m / (1.0 - BETA1.powi(t));
            let v_hat = v / (1.0 - BETA2.powi(t));

            m_memory[i] = m;
            v_memory[i] = v;
            self.params_memory[i] -= learning_rate * (m_hat / (v_hat.sqrt() + EPS) + wd * param);
        }
        Ok(())
    }

    fn set_grad_sync(&mut self, _sync: bool) {
        // gradients live in this process only, there is nothing to synchronize
    }

    fn save_checkpoint(&self, path: &Path, meta: &CheckpointMeta) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        let mut header = [0u32; HEADER_SIZE];
        header[0] = CHECKPOINT_MAGIC;
        header[1] = CHECKPOINT_VERSION;
        header[2] = u32::try_from(self.vocab_size).map_err(|_| Error::Model("vocabulary too large".to_string()))?;
        header[3] = u32::try_from(self.channels).map_err(|_| Error::Model("too many channels".to_string()))?;
        header[4] = u32::try_from(meta.step).map_err(|_| Error::Model("step overflows checkpoint".to_string()))?;
        header[5] = meta.val_loss.to_bits();
        for word in header {
            writer.write_all(&word.to_le_bytes())?;
        }
        for p in &self.params_memory {
            writer.write_all(&p.to_le_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[allow(non_snake_case)]
fn encoder_forward(out: &mut [f32], inp: &[i32], wte: &[f32], C: usize) {
    // out is (B,T,C), the embedding row of each input token
    for (out_bt, &ix) in out.chunks_exact_mut(C).zip(inp) {
        let ix = ix as usize;
        out_bt.copy_from_slice(&wte[ix * C..(ix + 1) * C]);
    }
}

#[allow(non_snake_case)]
fn encoder_backward(dwte: &mut [f32], dout: &[f32], inp: &[i32], C: usize) {
    for (dout_bt, &ix) in dout.chunks_exact(C).zip(inp) {
        let ix = ix as usize;
        let dwte_ix = &mut dwte[ix * C..(ix + 1) * C];
        for i in 0..C {
            dwte_ix[i] += dout_bt[i];
        }
    }
}

#[allow(non_snake_case)]
fn matmul_forward(out: &mut [f32], inp: &[f32], weight: &[f32], bias: &[f32], C: usize, OC: usize) {
    // inp is (BT, C), weight is (OC, C), bias is (OC), out is (BT, OC)
    out.par_chunks_mut(OC).zip(inp.par_chunks(C)).for_each(|(out_bt, inp_bt)| {
        for o in 0..OC {
            let wrow = &weight[o * C..(o + 1) * C];
            let mut val = bias[o];
            for i in 0..C {
                val += inp_bt[i] * wrow[i];
            }
            out_bt[o] = val;
        }
    });
}

#[allow(non_snake_case)]
fn matmul_backward(dinp: &mut [f32], dweight: &mut [f32], dbias: &mut [f32],
                   dout: &[f32], inp: &[f32], weight: &[f32], C: usize, OC: usize) {
    // backward into inp first, parallelize over BT
    dinp.par_chunks_mut(C).zip(dout.par_chunks(OC)).for_each(|(dinp_bt, dout_bt)| {
        for o in 0..OC {
            let wrow = &weight[o * C..(o + 1) * C];
            let d = dout_bt[o];
            for i in 0..C {
                dinp_bt[i] += wrow[i] * d;
            }
        }
    });

    // backward into weight/bias, parallelize over output channels OC
    dweight.par_chunks_mut(C).zip(dbias.par_iter_mut()).enumerate().for_each(|(o, (dwrow, db))| {
        for (dout_bt, inp_bt) in dout.chunks_exact(OC).zip(inp.chunks_exact(C)) {
            let d = dout_bt[o];
            *db += d;
            for i in 0..C {
                dwrow[i] += inp_bt[i] * d;
            }
        }
    });
}

#[allow(non_snake_case)]
pub(crate) fn softmax_forward(probs: &mut [f32], logits: &[f32], V: usize) {
    for (probs_bt, logits_bt) in probs.chunks_exact_mut(V).zip(logits.chunks_exact(V)) {
        // maxval is only calculated and subtracted for numerical stability
        let maxval = logits_bt.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for i in 0..V {
            probs_bt[i] = (logits_bt[i] - maxval).exp();
            sum += probs_bt[i];
        }
        for p in probs_bt.iter_mut() {
            *p /= sum;
        }
    }
}

#[allow(non_snake_case)]
fn crossentropy_forward(losses: &mut [f32], probs: &[f32], targets: &[i32], V: usize) {
    // loss = -log(probs[target])
    for ((loss, probs_bt), &ix) in losses.iter_mut().zip(probs.chunks_exact(V)).zip(targets) {
        *loss = -probs_bt[ix as usize].ln();
    }
}

#[allow(non_snake_case)]
fn crossentropy_softmax_backward(dlogits: &mut [f32], probs: &[f32], targets: &[i32], dloss: f32, V: usize) {
    // backwards through both softmax and crossentropy
    for ((dlogits_bt, probs_bt), &ix) in dlogits.chunks_exact_mut(V).zip(probs.chunks_exact(V)).zip(targets) {
        for i in 0..V {
            let indicator = if i == ix as usize { 1.0 } else { 0.0 };
            dlogits_bt[i] += (probs_bt[i] - indicator) * dloss;
        }
    }
}
