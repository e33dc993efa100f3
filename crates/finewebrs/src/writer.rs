//! Tokenize documents and pack them into fixed-size shards.
//!
//! Tokenization is a map stage on a rayon pool. Its results are consumed in
//! input order by a single loop that owns the one shard buffer, so the shard
//! contents depend only on the input order and never on thread scheduling.

use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::shard::{shard_path, write_shard, Split};
use crate::tokenizer::{tokenize_document, TokenEncoder};

pub const DEFAULT_SHARD_SIZE: usize = 100_000_000;
pub const DEFAULT_PREFIX: &str = "edufineweb";

/// Documents handed to each worker per round, like `imap(chunksize=16)`.
const DOCS_PER_WORKER: usize = 16;

/// Half the available cores, at least one.
pub fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (cpus / 2).max(1)
}

/// How shards of one input stream are assigned to splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPolicy {
    /// Every shard of the stream goes to this split.
    Fixed(Split),
    /// The first shard of the stream is validation, all later ones are train.
    FirstShardVal,
}

/// The in-memory shard under construction. Exactly one exists per writer and
/// it is moved through `flush` rather than shared.
#[derive(Debug)]
pub struct ShardBuffer {
    tokens: Vec<u16>,
    capacity: usize,
}

impl ShardBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { tokens: Vec::with_capacity(capacity), capacity }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.tokens.len()
    }

    pub fn tokens(&self) -> &[u16] {
        &self.tokens
    }

    fn extend(&mut self, tokens: &[u16]) {
        debug_assert!(tokens.len() <= self.remaining());
        self.tokens.extend_from_slice(tokens);
    }

    fn clear(&mut self) {
        self.tokens.clear();
    }
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub out_dir: PathBuf,
    pub prefix: String,
    pub shard_size: usize,
    pub workers: usize,
    pub progress: bool,
}

impl WriterConfig {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            prefix: DEFAULT_PREFIX.to_string(),
            shard_size: DEFAULT_SHARD_SIZE,
            workers: default_workers(),
            progress: true,
        }
    }
}

/// What one `write_stream` call produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    pub documents: usize,
    pub tokens: usize,
    pub shards: Vec<PathBuf>,
}

/// Per-stream bookkeeping: which split the next flush goes to, and the
/// progress bar of the shard being filled.
struct StreamState {
    policy: SplitPolicy,
    flushed: usize,
    bar: ProgressBar,
    summary: WriteSummary,
}

impl StreamState {
    fn split(&self) -> Split {
        match self.policy {
            SplitPolicy::Fixed(split) => split,
            SplitPolicy::FirstShardVal if self.flushed == 0 => Split::Val,
            SplitPolicy::FirstShardVal => Split::Train,
        }
    }
}

pub struct ShardWriter<'a, E: TokenEncoder + ?Sized> {
    config: WriterConfig,
    encoder: &'a E,
    pool: ThreadPool,
    // next index per split: [train, val]
    next_index: [usize; 2],
}

impl<'a, E: TokenEncoder + ?Sized> ShardWriter<'a, E> {
    pub fn new(config: WriterConfig, encoder: &'a E) -> Result<Self> {
        if config.shard_size == 0 {
            return Err(Error::Config("shard size must be positive".to_string()));
        }
        std::fs::create_dir_all(&config.out_dir)?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("tokenize-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("cannot build tokenizer pool: {e}")))?;
        info!(
            out_dir = %config.out_dir.display(),
            shard_size = config.shard_size,
            workers = config.workers,
            "shard writer ready"
        );
        Ok(Self { config, encoder, pool, next_index: [0, 0] })
    }

    /// Tokenize `documents` and write them out as shards.
    ///
    /// Any leftover partial buffer is written as a final, shorter shard. A
    /// token id that does not fit in `u16` aborts the stream with
    /// `Error::TokenOutOfRange`; shards already written stay on disk.
    pub fn write_stream<I>(&mut self, documents: I, policy: SplitPolicy) -> Result<WriteSummary>
    where
        I: IntoIterator<Item = String>,
    {
        let mut stream = StreamState {
            policy,
            flushed: 0,
            bar: ProgressBar::hidden(),
            summary: WriteSummary::default(),
        };
        stream.bar = self.new_bar(&stream);
        let mut buffer = ShardBuffer::new(self.config.shard_size);

        let round = self.pool.current_num_threads() * DOCS_PER_WORKER;
        let mut documents = documents.into_iter();
        loop {
            let chunk: Vec<String> = documents.by_ref().take(round).collect();
            if chunk.is_empty() {
                break;
            }
            let encoder = self.encoder;
            let tokenized: Vec<Vec<u16>> = self.pool.install(|| {
                chunk
                    .par_iter()
                    .map(|doc| tokenize_document(encoder, doc))
                    .collect::<Result<Vec<_>>>()
            })?;
            for tokens in tokenized {
                stream.summary.documents += 1;
                stream.summary.tokens += tokens.len();
                buffer = self.append(buffer, &tokens, &mut stream)?;
            }
        }

        if !buffer.is_empty() {
            let _ = self.flush(buffer, &mut stream)?;
        }
        stream.bar.finish_and_clear();
        info!(
            documents = stream.summary.documents,
            tokens = stream.summary.tokens,
            shards = stream.summary.shards.len(),
            "stream written"
        );
        Ok(stream.summary)
    }

    /// Append one document. Whenever it does not fit the remaining capacity
    /// the buffer is topped up to exactly `shard_size`, flushed, and the rest
    /// of the document continues in the fresh buffer.
    fn append(&mut self, mut buffer: ShardBuffer, tokens: &[u16], stream: &mut StreamState) -> Result<ShardBuffer> {
        let mut rest = tokens;
        while buffer.len() + rest.len() >= self.config.shard_size {
            let (head, tail) = rest.split_at(buffer.remaining());
            buffer.extend(head);
            stream.bar.inc(head.len() as u64);
            buffer = self.flush(buffer, stream)?;
            rest = tail;
        }
        buffer.extend(rest);
        stream.bar.inc(rest.len() as u64);
        Ok(buffer)
    }

    /// Write the buffer as the next shard of the stream's current split and
    /// hand it back empty.
    fn flush(&mut self, mut buffer: ShardBuffer, stream: &mut StreamState) -> Result<ShardBuffer> {
        let split = stream.split();
        let slot = match split {
            Split::Train => 0,
            Split::Val => 1,
        };
        let index = self.next_index[slot];
        let path = shard_path(&self.config.out_dir, &self.config.prefix, split, index);
        write_shard(&path, buffer.tokens())?;
        self.next_index[slot] += 1;
        debug!(path = %path.display(), tokens = buffer.len(), "shard written");

        stream.flushed += 1;
        stream.summary.shards.push(path);
        stream.bar.finish_and_clear();
        stream.bar = self.new_bar(stream);
        buffer.clear();
        Ok(buffer)
    }

    fn new_bar(&self, stream: &StreamState) -> ProgressBar {
        if !self.config.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(self.config.shard_size as u64);
        if let Ok(style) = ProgressStyle::with_template("{msg} {wide_bar} {pos}/{len} tokens [{elapsed}]") {
            bar.set_style(style);
        }
        bar.set_message(format!("Shard {} ({})", stream.flushed, stream.split()));
        bar
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{list_shards, read_shard};
    use crate::tokenizer::testing::{ByteTokenizer, FixedTokenizer};
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    fn config(dir: &TempDir, shard_size: usize) -> WriterConfig {
        WriterConfig {
            out_dir: dir.path().to_path_buf(),
            prefix: "test".to_string(),
            shard_size,
            workers: 2,
            progress: false,
        }
    }

    fn names(paths: &[PathBuf]) -> Vec<String> {
        paths.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn test_document_spills_into_next_shard() {
        let dir = TempDir::new().unwrap();
        let mut writer = ShardWriter::new(config(&dir, 1000), &ByteTokenizer).unwrap();
        // 599 bytes + <|endoftext|> = 600 tokens each
        let docs = vec!["a".repeat(599), "b".repeat(599)];
        let summary = writer.write_stream(docs, SplitPolicy::Fixed(Split::Train)).unwrap();

        assert_eq!(summary.documents, 2);
        assert_eq!(summary.tokens, 1200);
        assert_eq!(names(&summary.shards), ["test_train_000000.bin", "test_train_000001.bin"]);

        let first = read_shard(&summary.shards[0]).unwrap();
        assert_eq!(first.len(), 1000);
        assert!(first[..599].iter().all(|&t| t == b'a' as u16));
        assert_eq!(first[599], 256);
        assert!(first[600..].iter().all(|&t| t == b'b' as u16));

        let second = read_shard(&summary.shards[1]).unwrap();
        assert_eq!(second.len(), 200);
        assert!(second[..199].iter().all(|&t| t == b'b' as u16));
        assert_eq!(second[199], 256);
    }

    #[test]
    fn test_exact_fill_leaves_no_empty_shard() {
        let dir = TempDir::new().unwrap();
        let mut writer = ShardWriter::new(config(&dir, 10), &ByteTokenizer).unwrap();
        let summary = writer.write_stream(vec!["abcd".to_string(), "efgh".to_string()], SplitPolicy::Fixed(Split::Train)).unwrap();
        assert_eq!(summary.shards.len(), 1);
        assert_eq!(read_shard(&summary.shards[0]).unwrap().len(), 10);
    }

    #[test]
    fn test_shards_reproduce_the_token_stream() {
        let dir = TempDir::new().unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let docs: Vec<String> = (0..300)
            .map(|_| {
                let len = rng.gen_range(0..120);
                (0..len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
            })
            .collect();
        let expected: Vec<u16> = docs.iter().flat_map(|d| tokenize_document(&ByteTokenizer, d).unwrap()).collect();

        let mut writer = ShardWriter::new(config(&dir, 257), &ByteTokenizer).unwrap();
        let summary = writer.write_stream(docs, SplitPolicy::Fixed(Split::Train)).unwrap();

        let shards = list_shards(dir.path(), "test", Split::Train).unwrap();
        assert_eq!(shards, summary.shards);
        let mut concatenated = Vec::new();
        for (i, path) in shards.iter().enumerate() {
            let tokens = read_shard(path).unwrap();
            if i + 1 < shards.len() {
                assert_eq!(tokens.len(), 257);
            } else {
                assert!(tokens.len() <= 257);
            }
            concatenated.extend(tokens);
        }
        assert_eq!(concatenated, expected);
    }

    #[test]
    fn test_large_document_spans_several_shards() {
        let dir = TempDir::new().unwrap();
        let mut writer = ShardWriter::new(config(&dir, 100), &ByteTokenizer).unwrap();
        let summary = writer.write_stream(vec!["x".repeat(349)], SplitPolicy::Fixed(Split::Val)).unwrap();
        let sizes: Vec<usize> = summary.shards.iter().map(|p| read_shard(p).unwrap().len()).collect();
        assert_eq!(sizes, [100, 100, 100, 50]);
    }

    #[test]
    fn test_first_shard_of_stream_is_validation() {
        let dir = TempDir::new().unwrap();
        let mut writer = ShardWriter::new(config(&dir, 50), &ByteTokenizer).unwrap();
        let docs: Vec<String> = (0..6).map(|_| "y".repeat(24)).collect();
        let summary = writer.write_stream(docs, SplitPolicy::FirstShardVal).unwrap();
        assert_eq!(
            names(&summary.shards),
            ["test_val_000000.bin", "test_train_000000.bin", "test_train_000001.bin"]
        );
    }

    #[test]
    fn test_indices_continue_across_streams() {
        let dir = TempDir::new().unwrap();
        let mut writer = ShardWriter::new(config(&dir, 1000), &ByteTokenizer).unwrap();
        writer.write_stream(vec!["one".to_string()], SplitPolicy::Fixed(Split::Train)).unwrap();
        let second = writer.write_stream(vec!["two".to_string()], SplitPolicy::Fixed(Split::Train)).unwrap();
        assert_eq!(names(&second.shards), ["test_train_000001.bin"]);
    }

    #[test]
    fn test_out_of_range_token_aborts() {
        let dir = TempDir::new().unwrap();
        let tokenizer = FixedTokenizer(65536);
        let mut writer = ShardWriter::new(config(&dir, 1000), &tokenizer).unwrap();
        let result = writer.write_stream(vec!["boom".to_string()], SplitPolicy::Fixed(Split::Train));
        assert!(matches!(result, Err(Error::TokenOutOfRange { token: 65536 })));
        assert!(list_shards(dir.path(), "test", Split::Train).unwrap().is_empty());
    }
}
