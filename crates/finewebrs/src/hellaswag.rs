//! HellaSwag multiple choice evaluation.
//!
//! Each example is a context and four candidate endings. The model scores a
//! candidate by its mean cross-entropy over the ending tokens; the lowest loss
//! is the prediction.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::LanguageModel;
use crate::tokenizer::TokenEncoder;

#[derive(Debug, Clone, Deserialize)]
pub struct Example {
    pub ctx: String,
    pub label: usize,
    pub endings: Vec<String>,
}

/// One example as a (rows, cols) token grid, one row per candidate ending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedExample {
    pub tokens: Vec<i32>,
    /// 1 on ending tokens, 0 on context and padding
    pub mask: Vec<u8>,
    pub label: usize,
    pub rows: usize,
    pub cols: usize,
}

/// Examples of a JSON-lines file, in file order. Blank lines are skipped.
pub fn iterate_examples(path: &Path) -> Result<impl Iterator<Item = Result<Example>>> {
    let reader = BufReader::new(File::open(path)?);
    Ok(reader.lines().filter_map(|line| match line {
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(serde_json::from_str(&line).map_err(Error::from)),
        Err(e) => Some(Err(Error::from(e))),
    }))
}

/// Tokenize the context followed by `" " + ending` for every ending. Shorter
/// rows are padded with zeros.
pub fn render_example<E: TokenEncoder + ?Sized>(encoder: &E, example: &Example) -> Result<RenderedExample> {
    if example.endings.is_empty() || example.label >= example.endings.len() {
        return Err(Error::Config(format!(
            "example label {} does not index its {} endings",
            example.label,
            example.endings.len()
        )));
    }
    let ctx_tokens = encoder.encode(&example.ctx)?;
    let mut tok_rows = Vec::with_capacity(example.endings.len());
    let mut mask_rows = Vec::with_capacity(example.endings.len());
    for ending in &example.endings {
        let end_tokens = encoder.encode(&format!(" {ending}"))?;
        let mut row = ctx_tokens.clone();
        row.extend_from_slice(&end_tokens);
        tok_rows.push(row);
        let mut mask = vec![0u8; ctx_tokens.len()];
        mask.resize(ctx_tokens.len() + end_tokens.len(), 1);
        mask_rows.push(mask);
    }

    let rows = tok_rows.len();
    let cols = tok_rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut tokens = vec![0i32; rows * cols];
    let mut mask = vec![0u8; rows * cols];
    for (r, (tok_row, mask_row)) in tok_rows.iter().zip(&mask_rows).enumerate() {
        for (c, &tok) in tok_row.iter().enumerate() {
            tokens[r * cols + c] = i32::try_from(tok).map_err(|_| Error::TokenOutOfRange { token: tok })?;
        }
        mask[r * cols..r * cols + mask_row.len()].copy_from_slice(mask_row);
    }
    Ok(RenderedExample { tokens, mask, label: example.label, rows, cols })
}

/// Index of the row whose masked positions have the lowest mean loss.
///
/// `logits` is (rows, cols, V). Logits at position t predict the token at
/// t + 1, so losses and mask are shifted by one.
#[allow(non_snake_case)]
pub fn most_likely_row(tokens: &[i32], mask: &[u8], logits: &[f32], rows: usize, cols: usize, V: usize) -> usize {
    let mut best = (0, f32::INFINITY);
    for r in 0..rows {
        let mut sum_loss = 0.0f32;
        let mut count = 0usize;
        for t in 0..cols.saturating_sub(1) {
            if mask[r * cols + t + 1] == 0 {
                continue;
            }
            let logits_rt = &logits[(r * cols + t) * V..(r * cols + t + 1) * V];
            let target = tokens[r * cols + t + 1] as usize;
            let maxval = logits_rt.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let lse = maxval + logits_rt.iter().map(|&x| (x - maxval).exp()).sum::<f32>().ln();
            sum_loss += lse - logits_rt[target];
            count += 1;
        }
        let avg_loss = if count == 0 { f32::INFINITY } else { sum_loss / count as f32 };
        if avg_loss < best.1 {
            best = (r, avg_loss);
        }
    }
    best.0
}

/// Evaluate the examples this rank owns (`i % world_size == rank`).
/// Returns `(num_correct, num_total)` for this rank.
pub fn evaluate<M, E>(model: &mut M, encoder: &E, path: &Path, rank: usize, world_size: usize) -> Result<(u64, u64)>
where
    M: LanguageModel + ?Sized,
    E: TokenEncoder + ?Sized,
{
    let vocab_size = model.vocab_size();
    let mut num_correct = 0u64;
    let mut num_total = 0u64;
    for (i, example) in iterate_examples(path)?.enumerate() {
        if i % world_size != rank {
            continue;
        }
        let rendered = render_example(encoder, &example?)?;
        let out = model.forward(&rendered.tokens, None, rendered.rows, rendered.cols)?;
        let pred = most_likely_row(&rendered.tokens, &rendered.mask, &out.logits, rendered.rows, rendered.cols, vocab_size);
        num_total += 1;
        num_correct += u64::from(pred == rendered.label);
    }
    debug!(rank, num_correct, num_total, "hellaswag shard evaluated");
    Ok((num_correct, num_total))
}
