//! Document sources for the shard writer.
//!
//! `LocalCorpus` reads plain text files and carves a seeded validation sample
//! out of their lines. `JsonlCorpus` streams `{"text": ...}` records from
//! HTTP URLs or local files.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;

use glob::glob;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::random::{sample_indices, Mt19937};

pub const DEFAULT_INPUT_GLOB: &str = "train_data/*";
pub const DEFAULT_LINES_PER_DOCUMENT: usize = 1000;
pub const DEFAULT_VAL_FRACTION: f64 = 0.1;
pub const DEFAULT_SEED: u32 = 42;

#[derive(Debug, Clone)]
pub struct LocalCorpus {
    pub pattern: String,
    pub lines_per_document: usize,
    pub val_fraction: f64,
    pub seed: u32,
}

/// Documents of each split, in corpus order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SplitDocuments {
    pub train: Vec<String>,
    pub val: Vec<String>,
}

impl LocalCorpus {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            lines_per_document: DEFAULT_LINES_PER_DOCUMENT,
            val_fraction: DEFAULT_VAL_FRACTION,
            seed: DEFAULT_SEED,
        }
    }

    /// All lines of all matching files. Unreadable files are logged and
    /// skipped; invalid UTF-8 bytes are dropped.
    pub fn read_lines(&self) -> Result<Vec<String>> {
        let entries = glob(&self.pattern)
            .map_err(|e| Error::Config(format!("bad input pattern {}: {e}", self.pattern)))?;
        let mut lines = Vec::new();
        let mut files = 0usize;
        for entry in entries {
            let path: PathBuf = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!(path = %e.path().display(), error = %e, "skipping unreadable input");
                    continue;
                }
            };
            match fs::read(&path) {
                Ok(bytes) => {
                    files += 1;
                    lines.extend(decode_dropping_invalid(&bytes).lines().map(str::to_owned));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable input");
                }
            }
        }
        info!(files, lines = lines.len(), pattern = %self.pattern, "local corpus read");
        Ok(lines)
    }

    /// Read the corpus, sample validation lines and group both sets into
    /// documents.
    pub fn split_documents(&self) -> Result<SplitDocuments> {
        if self.lines_per_document == 0 {
            return Err(Error::Config("lines per document must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.val_fraction) {
            return Err(Error::Config(format!("validation fraction {} outside [0, 1]", self.val_fraction)));
        }
        let lines = self.read_lines()?;
        let (train, val) = split_lines(lines, self.val_fraction, self.seed);
        Ok(SplitDocuments {
            train: group_lines(&train, self.lines_per_document),
            val: group_lines(&val, self.lines_per_document),
        })
    }
}

/// Decode UTF-8, silently dropping byte sequences that are not valid.
fn decode_dropping_invalid(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        text.push_str(chunk.valid());
    }
    text
}

/// Move `floor(len * val_fraction)` seeded random lines to the validation set.
/// Both sets keep the original relative order.
pub fn split_lines(lines: Vec<String>, val_fraction: f64, seed: u32) -> (Vec<String>, Vec<String>) {
    let val_size = (lines.len() as f64 * val_fraction) as usize;
    let mut rng = Mt19937::new(seed);
    let val_indices = sample_indices(lines.len(), val_size, &mut rng);

    let mut train = Vec::with_capacity(lines.len() - val_size);
    let mut val = Vec::with_capacity(val_size);
    let mut next_val = val_indices.iter().peekable();
    for (i, line) in lines.into_iter().enumerate() {
        if next_val.peek() == Some(&&i) {
            next_val.next();
            val.push(line);
        } else {
            train.push(line);
        }
    }
    (train, val)
}

/// Join every `lines_per_document` consecutive lines into one document.
pub fn group_lines(lines: &[String], lines_per_document: usize) -> Vec<String> {
    lines.chunks(lines_per_document).map(|chunk| chunk.join("\n")).collect()
}

#[derive(Deserialize)]
struct Record {
    text: String,
}

/// Streams documents from JSON-lines sources, one `{"text": ...}` per line.
///
/// A source is an `http(s)://` URL or a local path. Sources that cannot be
/// opened and lines that do not parse are logged and skipped.
pub struct JsonlCorpus {
    sources: VecDeque<String>,
    current: Option<(String, Lines<Box<dyn BufRead + Send>>)>,
    client: reqwest::blocking::Client,
}

impl JsonlCorpus {
    pub fn new<I, S>(sources: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sources: VecDeque<String> = sources.into_iter().map(Into::into).collect();
        if sources.is_empty() {
            return Err(Error::Config("remote corpus needs at least one source URL".to_string()));
        }
        // corpus files are large, never time out mid-stream
        let client = reqwest::blocking::Client::builder().timeout(None::<std::time::Duration>).build()?;
        Ok(Self { sources, current: None, client })
    }

    fn open(&self, source: &str) -> Result<Box<dyn BufRead + Send>> {
        if source.starts_with("http://") || source.starts_with("https://") {
            let response = self.client.get(source).send()?.error_for_status()?;
            Ok(Box::new(BufReader::new(response)))
        } else {
            Ok(Box::new(BufReader::new(File::open(source)?)))
        }
    }

    fn next_source(&mut self) -> bool {
        while let Some(source) = self.sources.pop_front() {
            match self.open(&source) {
                Ok(reader) => {
                    info!(source = %source, "streaming corpus source");
                    self.current = Some((source, reader.lines()));
                    return true;
                }
                Err(e) => warn!(source = %source, error = %e, "skipping unreadable source"),
            }
        }
        false
    }
}

impl Iterator for JsonlCorpus {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if self.current.is_none() && !self.next_source() {
                return None;
            }
            let (source, lines) = self.current.as_mut()?;
            match lines.next() {
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => match serde_json::from_str::<Record>(&line) {
                    Ok(record) => return Some(record.text),
                    Err(e) => warn!(source = %source, error = %e, "skipping malformed record"),
                },
                Some(Err(e)) => {
                    warn!(source = %source, error = %e, "read failed, moving to next source");
                    self.current = None;
                }
                None => self.current = None,
            }
        }
    }
}
