//! Per-pass result files.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;
use crate::prefix_set::PrefixSet;

/// `<prefix>.<ngram_len>.txt`
pub fn output_path(prefix: &Path, ngram_len: usize) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!(".{ngram_len}.txt"));
    PathBuf::from(name)
}

/// Write the `limit` most frequent n-grams of `selected` to the pass file.
pub fn write_pass(prefix: &Path, selected: &PrefixSet, limit: usize) -> Result<PathBuf> {
    let path = output_path(prefix, selected.ngram_len());
    let file = File::create(&path)?;
    selected.write_csv(BufWriter::new(file), limit)?;
    info!(
        path = %path.display(),
        ngrams = selected.len().min(limit),
        "wrote pass output"
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path() {
        assert_eq!(
            output_path(Path::new("out/ngrams"), 4),
            PathBuf::from("out/ngrams.4.txt")
        );
    }

    #[test]
    fn test_write_pass() {
        let dir = tempfile::tempdir().unwrap();
        let set = PrefixSet::from_parts(3, b"abcxyz".to_vec(), vec![2, 9]).unwrap();

        let path = write_pass(&dir.path().join("run"), &set, 1).unwrap();
        assert!(path.ends_with("run.3.txt"));
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "ngram,count\n0x78797a,9\n"
        );
    }
}
