use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::shard::{list_shards, read_shard, shard_token_count, Split};

/// One `(B, T)` input/target pair, row-major. `targets` is `inputs` shifted
/// left by one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub inputs: Vec<i32>,
    pub targets: Vec<i32>,
    pub rows: usize,
    pub cols: usize,
}

impl Batch {
    pub fn input_row(&self, b: usize) -> &[i32] {
        &self.inputs[b * self.cols..(b + 1) * self.cols]
    }

    pub fn target_row(&self, b: usize) -> &[i32] {
        &self.targets[b * self.cols..(b + 1) * self.cols]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoaderState {
    /// No shard resident, e.g. after a failed load.
    Empty,
    /// A shard is resident and the cursor points into it.
    Loaded,
    /// The resident shard cannot serve the next window, move to the next one.
    Reloading,
}

/// Streams `(B, T)` batches over the shards of one split, forever.
///
/// Rank `r` of `W` starts at token `B*T*r` of every shard and moves by
/// `B*T*W` per batch, so ranks read disjoint interleaved windows without
/// talking to each other. Only one shard is in memory at a time.
pub struct Dataloader {
    split: Split,
    files: Vec<PathBuf>,
    batch_size: usize,
    seq_len: usize,
    process_rank: usize,
    num_processes: usize,
    num_tokens: usize,
    // cursor
    current_shard_idx: usize,
    current_position: usize,
    tokens: Vec<u16>,
    state: LoaderState,
}

impl Dataloader {
    /// Stream the `split` shards of dataset `prefix` found in `data_dir`.
    #[allow(non_snake_case)]
    pub fn new(
        data_dir: &Path,
        prefix: &str,
        split: Split,
        B: usize,
        T: usize,
        process_rank: usize,
        num_processes: usize,
    ) -> Result<Self> {
        if B == 0 || T == 0 {
            return Err(Error::Config(format!("batch shape must be positive, got B={B} T={T}")));
        }
        if process_rank >= num_processes {
            return Err(Error::Config(format!("rank {process_rank} outside world size {num_processes}")));
        }

        let files = list_shards(data_dir, prefix, split)?;
        if files.is_empty() {
            return Err(Error::NoShards { split: split.to_string(), dir: data_dir.to_path_buf() });
        }

        // inspect and validate every header up front so a bad shard fails here
        let mut num_tokens = 0usize;
        for file in &files {
            num_tokens += shard_token_count(file)?;
        }
        if process_rank == 0 {
            info!(split = %split, shards = files.len(), tokens = num_tokens, dir = %data_dir.display(), "found shards");
        }

        let mut loader = Self {
            split,
            files,
            batch_size: B,
            seq_len: T,
            process_rank,
            num_processes,
            num_tokens,
            current_shard_idx: 0,
            current_position: 0,
            tokens: Vec::new(),
            state: LoaderState::Empty,
        };
        loader.reset()?;
        Ok(loader)
    }

    pub fn split(&self) -> Split {
        self.split
    }

    /// Total number of tokens in the split.
    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn num_shards(&self) -> usize {
        self.files.len()
    }

    pub fn current_shard(&self) -> usize {
        self.current_shard_idx
    }

    pub fn position(&self) -> usize {
        self.current_position
    }

    fn rank_offset(&self) -> usize {
        self.batch_size * self.seq_len * self.process_rank
    }

    fn load_shard(&mut self, shard_idx: usize) -> Result<()> {
        self.state = LoaderState::Empty;
        let path = &self.files[shard_idx];
        self.tokens = read_shard(path)?;
        self.current_shard_idx = shard_idx;
        self.state = LoaderState::Loaded;
        debug!(split = %self.split, shard = shard_idx, path = %path.display(), tokens = self.tokens.len(), "loaded shard");
        Ok(())
    }

    /// Go back to the start of shard 0.
    pub fn reset(&mut self) -> Result<()> {
        self.load_shard(0)?;
        self.current_position = self.rank_offset();
        Ok(())
    }

    /// Put the cursor at `position` inside shard `shard_idx`.
    pub fn resume(&mut self, shard_idx: usize, position: usize) -> Result<()> {
        if shard_idx >= self.files.len() {
            return Err(Error::Config(format!("cannot resume at shard {shard_idx}, only {} shards", self.files.len())));
        }
        self.load_shard(shard_idx)?;
        self.current_position = position;
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        let next = (self.current_shard_idx + 1) % self.files.len();
        self.load_shard(next)?;
        self.current_position = self.rank_offset();
        Ok(())
    }

    /// Next batch for this rank.
    ///
    /// When the resident shard cannot hold the next `B*T+1` tokens the loader
    /// moves on to the next shard (wrapping after the last one) and retries.
    /// After visiting every shard once without finding room it gives up with
    /// `Error::ShardTooSmall`.
    pub fn next_batch(&mut self) -> Result<Batch> {
        let bt = self.batch_size * self.seq_len;
        let window = bt + 1;
        let mut reloads = 0usize;
        loop {
            match self.state {
                LoaderState::Empty => self.load_shard(self.current_shard_idx)?,
                LoaderState::Loaded => {
                    let start = self.current_position;
                    if start.checked_add(window).is_none_or(|end| end > self.tokens.len()) {
                        self.state = LoaderState::Reloading;
                        continue;
                    }
                    let buf = &self.tokens[start..start + window];
                    let inputs = buf[..bt].iter().map(|&t| t as i32).collect();
                    let targets = buf[1..].iter().map(|&t| t as i32).collect();
                    self.current_position += bt * self.num_processes;
                    return Ok(Batch { inputs, targets, rows: self.batch_size, cols: self.seq_len });
                }
                LoaderState::Reloading => {
                    if reloads >= self.files.len() {
                        return Err(Error::ShardTooSmall { needed: self.rank_offset() + window, attempts: reloads });
                    }
                    reloads += 1;
                    self.advance()?;
                }
            }
        }
    }
}
