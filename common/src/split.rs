//! Byte ranges of a line-delimited dataset, one per map split.
//!
//! A dataset of `size` bytes cut into `n` splits has a nominal split size of
//! `ceil(size / n)`. Split `k` owns every line whose first byte falls inside
//! `[k * nominal, (k + 1) * nominal)`, so each boundary snaps forward to the
//! next line start. Only `\n` bytes are treated as boundaries, which means a
//! multi-byte UTF-8 character is never cut in half.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Context, Error};
use bytes::Bytes;
use tracing::debug;

/// Serves the slices of a dataset that make up each split.
pub trait SplitSource {
    /// Byte range of `input_ref` belonging to `split` out of `split_count`.
    fn split_range(&self, input_ref: &str, split_count: u32, split: u32)
        -> Result<Range<u64>, Error>;

    /// The bytes of that range.
    fn read_split(&self, input_ref: &str, split_count: u32, split: u32) -> Result<Bytes, Error>;
}

/// Compute the byte range of `split` within a line-delimited resource of
/// `total_size` bytes.
///
/// The range may be empty when a single line is longer than a whole split.
pub fn line_split_range<R: BufRead + Seek>(
    reader: &mut R,
    total_size: u64,
    split_count: u32,
    split: u32,
) -> Result<Range<u64>, Error> {
    if split_count == 0 {
        return Err(anyhow!("split count must be positive"));
    }
    if split >= split_count {
        return Err(anyhow!(
            "split {} out of range for {} splits",
            split,
            split_count
        ));
    }

    let split_size = total_size.div_ceil(split_count as u64);
    let nominal_start = (split as u64 * split_size).min(total_size);
    let nominal_end = ((split as u64 + 1) * split_size).min(total_size);

    let start = next_line_start(reader, nominal_start, total_size)?;
    let end = next_line_start(reader, nominal_end, total_size)?;

    Ok(start..end)
}

/// First line start at or after `pos`.
fn next_line_start<R: BufRead + Seek>(
    reader: &mut R,
    pos: u64,
    total_size: u64,
) -> Result<u64, Error> {
    if pos == 0 {
        return Ok(0);
    }
    if pos >= total_size {
        return Ok(total_size);
    }

    // Looking one byte back tells us whether `pos` already starts a line.
    reader.seek(SeekFrom::Start(pos - 1))?;
    let mut skipped = Vec::new();
    let read = reader.read_until(b'\n', &mut skipped)?;

    Ok((pos - 1 + read as u64).min(total_size))
}

/// Memoised dataset sizes.
///
/// Owned by whoever owns the split source, never global.
#[derive(Debug, Default)]
pub struct SizeCache {
    sizes: Mutex<HashMap<PathBuf, u64>>,
}

impl SizeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of `path` in bytes, computed once.
    pub fn size_of(&self, path: &Path) -> Result<u64, Error> {
        let mut sizes = self.sizes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(size) = sizes.get(path) {
            return Ok(*size);
        }

        let size = std::fs::metadata(path)
            .with_context(|| format!("could not stat {}", path.display()))?
            .len();
        debug!("Caching size {} for {}", size, path.display());
        sizes.insert(path.to_path_buf(), size);

        Ok(size)
    }
}

/// Splits plain text files found under a root directory.
#[derive(Debug)]
pub struct LineSplitSource {
    root: PathBuf,
    sizes: SizeCache,
}

impl LineSplitSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sizes: SizeCache::new(),
        }
    }

    fn resolve(&self, input_ref: &str) -> Result<PathBuf, Error> {
        let relative = Path::new(input_ref);
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));

        if input_ref.is_empty() || !plain {
            return Err(anyhow!(
                "dataset reference `{}` is not a plain relative path",
                input_ref
            ));
        }

        Ok(self.root.join(relative))
    }
}

impl SplitSource for LineSplitSource {
    fn split_range(
        &self,
        input_ref: &str,
        split_count: u32,
        split: u32,
    ) -> Result<Range<u64>, Error> {
        let path = self.resolve(input_ref)?;
        let size = self.sizes.size_of(&path)?;
        let file =
            File::open(&path).with_context(|| format!("could not open {}", path.display()))?;

        line_split_range(&mut BufReader::new(file), size, split_count, split)
    }

    fn read_split(&self, input_ref: &str, split_count: u32, split: u32) -> Result<Bytes, Error> {
        let range = self.split_range(input_ref, split_count, split)?;
        let path = self.resolve(input_ref)?;

        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(range.start))?;

        let mut data = vec![0; (range.end - range.start) as usize];
        file.read_exact(&mut data)?;

        Ok(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    const TEXT: &str = "alpha\nbeta\nγάμμα δέλτα\n\nepsilon zeta eta theta iota kappa\nλ\nmu";

    fn ranges(text: &str, count: u32) -> Vec<Range<u64>> {
        let mut reader = Cursor::new(text.as_bytes());
        (0..count)
            .map(|split| line_split_range(&mut reader, text.len() as u64, count, split).unwrap())
            .collect()
    }

    #[test]
    fn splits_partition_the_input() {
        for count in 1..=12 {
            let ranges = ranges(TEXT, count);

            assert_eq!(ranges[0].start, 0);
            assert_eq!(ranges.last().unwrap().end, TEXT.len() as u64);
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start, "gap or overlap with {} splits", count);
            }
        }
    }

    #[test]
    fn every_split_is_whole_utf8_lines() {
        let bytes = TEXT.as_bytes();
        for count in 1..=12 {
            for range in ranges(TEXT, count) {
                let slice = &bytes[range.start as usize..range.end as usize];
                assert!(std::str::from_utf8(slice).is_ok());
                if range.start > 0 && !range.is_empty() {
                    assert_eq!(bytes[range.start as usize - 1], b'\n');
                }
            }
        }
    }

    #[test]
    fn long_line_leaves_following_split_empty() {
        let text = "a very long first line that spans splits\nb\n";
        let ranges = ranges(text, 4);

        assert_eq!(ranges[0], 0..41);
        assert!(ranges[1].is_empty());
        assert!(ranges[2].is_empty());
    }

    #[test]
    fn rejects_bad_split_index() {
        let mut reader = Cursor::new(TEXT.as_bytes());
        assert!(line_split_range(&mut reader, TEXT.len() as u64, 3, 3).is_err());
        assert!(line_split_range(&mut reader, TEXT.len() as u64, 0, 0).is_err());
    }

    #[test]
    fn file_source_reads_slices() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("words.txt")).unwrap();
        file.write_all(TEXT.as_bytes()).unwrap();

        let source = LineSplitSource::new(dir.path());
        let joined: Vec<u8> = (0..5)
            .flat_map(|split| source.read_split("words.txt", 5, split).unwrap().to_vec())
            .collect();

        assert_eq!(joined, TEXT.as_bytes());
        assert!(source.split_range("../words.txt", 5, 0).is_err());
        assert!(source.split_range("missing.txt", 5, 0).is_err());
    }
}
