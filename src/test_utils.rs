//! Fixtures shared by the unit tests.

use std::{fs::File, io::Write, path::Path};

use flate2::{Compression, write::GzEncoder};

use crate::source::Source;

/// Write `lines` as a gzip compressed, newline-delimited file.
pub(crate) fn write_gz<S: AsRef<str>>(path: &Path, lines: &[S]) -> std::io::Result<()> {
    let mut enc = GzEncoder::new(File::create(path)?, Compression::default());
    for line in lines {
        writeln!(enc, "{}", line.as_ref())?;
    }
    enc.finish()?;
    Ok(())
}

/// Write one gzip file per entry of `sets` into `dir` and describe them as sources
/// named `file1`, `file2`, ...
pub(crate) fn write_sources(dir: &Path, sets: &[&[&str]]) -> std::io::Result<Vec<Source>> {
    sets.iter()
        .enumerate()
        .map(|(i, lines)| {
            let path = dir.join(format!("couponbase{}.gz", i + 1));
            write_gz(&path, *lines)?;
            Ok(Source::new(i, format!("file{}", i + 1), path))
        })
        .collect()
}

/// The sources from the worked example: `ABCD1234` in all three, `ZZZZ9999` in two and
/// `ONLYIN2X` in the second source only.
pub(crate) const EXAMPLE_SETS: [&[&str]; 3] = [
    &["ABCD1234", "ZZZZ9999"],
    &["ABCD1234", "ONLYIN2X"],
    &["ABCD1234", "ZZZZ9999"],
];
