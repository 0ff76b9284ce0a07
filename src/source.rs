//! Loading code sets from compressed, newline-delimited source files.

use std::{
    collections::HashSet,
    fs::File,
    io::{self, BufRead, BufReader, Read},
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use flate2::read::MultiGzDecoder;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::code::{Code, Normalizer};

/// The unique normalized codes found in one source.
pub type CodeSet = HashSet<Code>;

/// Guess at the compressed bytes per line, used to pre-size a [`CodeSet`].
pub const AVERAGE_BYTES_PER_LINE: u64 = 12;
/// Capacity hints at or above this are ignored.
const MAX_CAPACITY_HINT: u64 = 20_000_000;
/// Buffer size for reading decompressed lines.
const READ_BUFFER_SIZE: usize = 1 << 20;

/// Position of a source in the configured source list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("#{_0}")]
pub struct SourceId(pub usize);

/// One independent corpus of codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    /// Index of the source in the configured list.
    pub id: SourceId,
    /// Logical name, also used as the persistent partition name.
    pub name: String,
    /// Location of the gzip compressed code list.
    pub path: PathBuf,
}

impl Source {
    /// Create a source description.
    pub fn new(id: usize, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: SourceId(id),
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Failure to load a source. Any of these aborts the whole load cycle.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The source file could not be opened.
    #[error("failed to open source {name} at {}", path.display())]
    Open {
        /// Source name.
        name: String,
        /// Source location.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Reading or decompressing the source failed part way through.
    #[error("failed to read source {name} at {}", path.display())]
    Read {
        /// Source name.
        name: String,
        /// Source location.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// A loader task panicked or was cancelled.
    #[error("source loader task failed")]
    Task(#[from] JoinError),
}

/// Estimate how many codes a source of `compressed_len` bytes holds.
///
/// Only a pre-allocation hint; absurd estimates yield `0`.
pub fn capacity_hint(compressed_len: u64) -> usize {
    let estimate = compressed_len / AVERAGE_BYTES_PER_LINE;
    if estimate > 0 && estimate < MAX_CAPACITY_HINT {
        estimate as usize
    } else {
        0
    }
}

/// Read newline-delimited codes from `reader` into `set`.
///
/// Lines that do not normalize, including blank and non UTF-8 lines, are skipped.
pub fn read_codes<R: Read>(reader: R, normalizer: &Normalizer, set: &mut CodeSet) -> io::Result<()> {
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, reader);
    let mut line = Vec::with_capacity(64);
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(());
        }
        let Ok(raw) = std::str::from_utf8(&line) else {
            continue;
        };
        if let Some(code) = normalizer.normalize(raw) {
            set.insert(code);
        }
    }
}

/// Load the set of unique codes in a single gzip compressed source.
///
/// Decompresses incrementally; the decompressed payload is never held in memory as a whole.
#[tracing::instrument(skip_all, fields(source = %source.name))]
pub fn load_source(source: &Source, normalizer: &Normalizer) -> Result<CodeSet, LoadError> {
    let start = Instant::now();
    let open_err = |source_err| LoadError::Open {
        name: source.name.clone(),
        path: source.path.clone(),
        source: source_err,
    };
    let file = File::open(&source.path).map_err(open_err)?;
    let hint = file.metadata().map(|m| capacity_hint(m.len())).unwrap_or(0);
    debug!(hint, "pre-sizing code set");

    let mut set = CodeSet::with_capacity(hint);
    read_codes(MultiGzDecoder::new(file), normalizer, &mut set).map_err(|err| LoadError::Read {
        name: source.name.clone(),
        path: source.path.clone(),
        source: err,
    })?;
    info!(
        "read {} unique codes from {} in {:?}",
        set.len(),
        source.path.display(),
        start.elapsed()
    );
    Ok(set)
}

/// Load all sources in parallel, one blocking worker per source.
///
/// Waits for every worker before returning. The result holds one set per source, in the
/// order of `sources`; if any source failed the first failure is returned instead.
pub async fn load_all(
    sources: Arc<[Source]>,
    normalizer: Normalizer,
) -> Result<Vec<CodeSet>, LoadError> {
    let mut tasks = JoinSet::new();
    for idx in 0..sources.len() {
        let sources = sources.clone();
        tasks.spawn_blocking(move || (idx, load_source(&sources[idx], &normalizer)));
    }

    let mut sets: Vec<Option<CodeSet>> = (0..sources.len()).map(|_| None).collect();
    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, Ok(set))) => sets[idx] = Some(set),
            Ok((idx, Err(err))) => {
                warn!("error loading source {}: {err:#}", sources[idx].name);
                first_err.get_or_insert(err);
            }
            Err(err) => {
                warn!("source loader task failed: {err}");
                first_err.get_or_insert(LoadError::Task(err));
            }
        }
    }
    if let Some(err) = first_err {
        return Err(err);
    }
    Ok(sets.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{Compression, write::GzEncoder};

    use super::*;
    use crate::test_utils::write_gz;

    fn codes(set: &CodeSet) -> Vec<&str> {
        let mut codes: Vec<_> = set.iter().map(Code::as_str).collect();
        codes.sort();
        codes
    }

    #[test]
    fn read_codes_skips_malformed_lines() {
        let input = "abcd1234\n\n  short \nABCD1234\nzzzz9999\r\nwaytoolongcode\nLAST12345";
        let mut set = CodeSet::new();
        read_codes(input.as_bytes(), &Normalizer::default(), &mut set).unwrap();
        assert_eq!(codes(&set), vec!["ABCD1234", "LAST12345", "ZZZZ9999"]);
    }

    #[test]
    fn read_codes_drops_invalid_utf8() {
        let mut input = b"abcd1234\n".to_vec();
        input.extend_from_slice(&[0xff, 0xfe, b'a', b'b', b'c', b'd', b'1', b'2', b'3', b'\n']);
        let mut set = CodeSet::new();
        read_codes(&input[..], &Normalizer::default(), &mut set).unwrap();
        assert_eq!(codes(&set), vec!["ABCD1234"]);
    }

    #[test]
    fn capacity_hint_bounds() {
        assert_eq!(capacity_hint(0), 0);
        assert_eq!(capacity_hint(11), 0);
        assert_eq!(capacity_hint(120), 10);
        assert_eq!(capacity_hint(AVERAGE_BYTES_PER_LINE * MAX_CAPACITY_HINT), 0);
    }

    #[test]
    fn load_gzip_source() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("s1.gz");
        write_gz(&path, &["abcd1234", "ABCD1234", " zzzz9999 ", "nope"])?;
        let set = load_source(&Source::new(0, "file1", &path), &Normalizer::default())?;
        assert_eq!(codes(&set), vec!["ABCD1234", "ZZZZ9999"]);
        Ok(())
    }

    #[test]
    fn load_multi_member_gzip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("multi.gz");
        let mut bytes = Vec::new();
        for line in ["abcd1234\n", "zzzz9999\n"] {
            let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
            enc.write_all(line.as_bytes())?;
            bytes.extend(enc.finish()?);
        }
        std::fs::write(&path, bytes)?;
        let set = load_source(&Source::new(0, "file1", &path), &Normalizer::default())?;
        assert_eq!(codes(&set), vec!["ABCD1234", "ZZZZ9999"]);
        Ok(())
    }

    #[test]
    fn missing_source_is_an_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = Source::new(0, "file1", dir.path().join("missing.gz"));
        let err = load_source(&source, &Normalizer::default()).unwrap_err();
        assert!(matches!(err, LoadError::Open { ref name, .. } if name == "file1"), "{err:?}");
    }

    #[test]
    fn corrupt_source_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.gz");
        std::fs::write(&path, b"this is not gzip at all\n").unwrap();
        let err = load_source(&Source::new(0, "file1", &path), &Normalizer::default()).unwrap_err();
        assert!(matches!(err, LoadError::Read { .. }), "{err:?}");
    }

    #[test]
    fn truncated_source_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.gz");
        let lines: Vec<String> = (0..1000).map(|i| format!("CODE{i:05}")).collect();
        write_gz(&path, &lines).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        let err = load_source(&Source::new(0, "file1", &path), &Normalizer::default()).unwrap_err();
        assert!(matches!(err, LoadError::Read { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn load_all_keeps_source_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sources = Vec::new();
        for (i, code) in ["AAAA1111", "BBBB2222", "CCCC3333"].iter().enumerate() {
            let path = dir.path().join(format!("{i}.gz"));
            write_gz(&path, &[code])?;
            sources.push(Source::new(i, format!("file{}", i + 1), path));
        }
        let sets = load_all(sources.into(), Normalizer::default()).await?;
        assert_eq!(sets.len(), 3);
        assert_eq!(codes(&sets[0]), vec!["AAAA1111"]);
        assert_eq!(codes(&sets[1]), vec!["BBBB2222"]);
        assert_eq!(codes(&sets[2]), vec!["CCCC3333"]);
        Ok(())
    }

    #[tokio::test]
    async fn load_all_fails_if_any_source_fails() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let good = dir.path().join("good.gz");
        write_gz(&good, &["AAAA1111"])?;
        let sources: Arc<[Source]> = vec![
            Source::new(0, "file1", &good),
            Source::new(1, "file2", dir.path().join("missing.gz")),
            Source::new(2, "file3", &good),
        ]
        .into();
        let err = load_all(sources, Normalizer::default()).await.unwrap_err();
        assert!(matches!(err, LoadError::Open { ref name, .. } if name == "file2"), "{err:?}");
        Ok(())
    }
}
