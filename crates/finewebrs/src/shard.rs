//! On-disk token shards.
//!
//! A shard is a flat little-endian file:
//! - a header of 256 `u32` words: magic, version, token count, zeros
//! - the tokens as `u16`
//!
//! This is the llm.c token file layout, so shards written here can be fed to
//! llm.c style trainers and vice versa.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use glob::{glob, Pattern};

use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = 256;
pub const SHARD_MAGIC: u32 = 20240520;
pub const SHARD_VERSION: u32 = 1;
pub const HEADER_BYTES: usize = HEADER_SIZE * std::mem::size_of::<u32>();

/// Tokens are converted to little endian this many at a time when writing.
const WRITE_CHUNK: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Split::Train),
            "val" => Ok(Split::Val),
            other => Err(Error::Config(format!("unknown split {other:?}, expected train or val"))),
        }
    }
}

/// `{prefix}_{split}_{index:06}.bin`
pub fn shard_file_name(prefix: &str, split: Split, index: usize) -> String {
    format!("{}_{}_{:06}.bin", prefix, split, index)
}

pub fn shard_path(dir: &Path, prefix: &str, split: Split, index: usize) -> PathBuf {
    dir.join(shard_file_name(prefix, split, index))
}

/// Write `tokens` as a complete shard.
///
/// The data goes to a sibling `.tmp` file first and is renamed into place once
/// synced, so a shard name never points at a partially written file. On
/// failure the temp file is removed.
pub fn write_shard(path: &Path, tokens: &[u16]) -> Result<()> {
    let ntok = u32::try_from(tokens.len())
        .map_err(|_| Error::Config(format!("shard of {} tokens overflows the header", tokens.len())))?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let written = write_shard_file(&tmp_path, ntok, tokens).and_then(|()| fs::rename(&tmp_path, path).map_err(Error::from));
    if written.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    written
}

fn write_shard_file(tmp_path: &Path, ntok: u32, tokens: &[u16]) -> Result<()> {
    let file = File::create(tmp_path)?;
    let mut writer = BufWriter::new(file);

    let mut header = [0u32; HEADER_SIZE];
    header[0] = SHARD_MAGIC;
    header[1] = SHARD_VERSION;
    header[2] = ntok;
    for word in header {
        writer.write_all(&word.to_le_bytes())?;
    }

    let mut scratch = vec![0u16; WRITE_CHUNK.min(tokens.len())];
    for chunk in tokens.chunks(WRITE_CHUNK) {
        let le = &mut scratch[..chunk.len()];
        for (dst, &src) in le.iter_mut().zip(chunk) {
            *dst = src.to_le();
        }
        writer.write_all(bytemuck::cast_slice(le))?;
    }

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

pub(crate) fn read_le_u32_array<R: Read, const N: usize>(reader: &mut R) -> std::io::Result<[u32; N]> {
    let mut resp = [0u32; N];
    let mut buf = [0u8; 4];
    for word in resp.iter_mut() {
        reader.read_exact(&mut buf)?;
        *word = u32::from_le_bytes(buf);
    }
    Ok(resp)
}

fn corrupt(path: &Path, reason: impl Into<String>) -> Error {
    Error::CorruptShard { path: path.to_path_buf(), reason: reason.into() }
}

/// Validate the header and file size of a shard, returning its token count.
fn validate_header<R: Read>(path: &Path, reader: &mut R) -> Result<usize> {
    let header: [u32; HEADER_SIZE] =
        read_le_u32_array(reader).map_err(|e| corrupt(path, format!("unreadable header: {e}")))?;
    if header[0] != SHARD_MAGIC {
        return Err(corrupt(path, format!("bad magic {}", header[0])));
    }
    if header[1] != SHARD_VERSION {
        return Err(corrupt(path, format!("bad version {}", header[1])));
    }
    let ntok = header[2] as usize;
    if ntok == 0 {
        return Err(corrupt(path, "empty shard"));
    }
    let file_size = fs::metadata(path)?.len();
    let expected = (HEADER_BYTES + ntok * std::mem::size_of::<u16>()) as u64;
    if file_size != expected {
        return Err(corrupt(path, format!("file size {file_size}, expected {expected}")));
    }
    Ok(ntok)
}

/// Number of tokens in a shard, read from its header only.
pub fn shard_token_count(path: &Path) -> Result<usize> {
    let mut reader = BufReader::new(File::open(path)?);
    validate_header(path, &mut reader)
}

/// Load a whole shard into memory.
pub fn read_shard(path: &Path) -> Result<Vec<u16>> {
    let mut reader = BufReader::new(File::open(path)?);
    let ntok = validate_header(path, &mut reader)?;
    let mut tokens = vec![0u16; ntok];
    reader
        .read_exact(bytemuck::cast_slice_mut(&mut tokens))
        .map_err(|e| corrupt(path, format!("truncated body: {e}")))?;
    for t in tokens.iter_mut() {
        *t = u16::from_le(*t);
    }
    Ok(tokens)
}

/// Whether `path` is named exactly `{prefix}_{split}_{digits}.bin`.
fn is_shard_of(path: &Path, prefix: &str, split: Split) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.strip_prefix(split.as_str()))
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.strip_suffix(".bin"))
        .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
}

/// All shard files of dataset `prefix` and `split` in `dir`, sorted. The order
/// is the canonical stream order of the split.
pub fn list_shards(dir: &Path, prefix: &str, split: Split) -> Result<Vec<PathBuf>> {
    let dir_str = dir
        .to_str()
        .ok_or_else(|| Error::Config(format!("non UTF-8 data directory {dir:?}")))?;
    let pattern = Path::new(&Pattern::escape(dir_str)).join(format!("{}_{}_*.bin", Pattern::escape(prefix), split));
    let pattern = pattern
        .to_str()
        .ok_or_else(|| Error::Config(format!("non UTF-8 shard prefix {prefix:?}")))?;
    let mut files: Vec<PathBuf> = glob(pattern)
        .map_err(|e| Error::Config(format!("bad shard pattern {pattern}: {e}")))?
        .filter_map(std::result::Result::ok)
        .filter(|path| is_shard_of(path, prefix, split))
        .collect();
    files.sort();
    Ok(files)
}
