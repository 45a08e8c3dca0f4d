//! Where the bytes come from.
//!
//! A [`FileSource`] hands out files one at a time to any number of reader
//! threads; [`Chunks`] splits one file into overlapping chunks so that every
//! n-gram lies entirely inside at least one chunk and is seen exactly once.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Directories nested deeper than this below a root are not visited.
pub const MAX_DEPTH: usize = 10;

/// One file handed out by a [`FileSource`].
pub struct SourceFile {
    /// Sequential id in claim order, unique within a pass.
    pub id: usize,
    /// Display name for logs.
    pub name: String,
    pub reader: Box<dyn Read + Send>,
}

impl std::fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceFile")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// A shared cursor over a set of files.
pub trait FileSource: Sync {
    /// Claim the next file, or `None` when the set is exhausted.
    fn next_file(&self) -> Option<SourceFile>;

    /// Rewind to the first file for another pass.
    fn reset(&self);
}

/// Depth-first walk over a list of roots. Symlinks are followed.
struct Walker {
    pending: Vec<(PathBuf, usize)>,
    max_depth: usize,
}

impl Walker {
    fn new(roots: &[PathBuf], max_depth: usize) -> Self {
        Self {
            pending: roots.iter().rev().map(|p| (p.clone(), 0)).collect(),
            max_depth,
        }
    }

    fn next_path(&mut self) -> Option<PathBuf> {
        while let Some((path, depth)) = self.pending.pop() {
            // fs::metadata resolves symlinks.
            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(path = %path.display(), os_error = e.raw_os_error(), error = %e, "cannot stat path, skipping");
                    continue;
                }
            };

            if meta.is_file() {
                return Some(path);
            }
            if !meta.is_dir() {
                continue;
            }
            if depth >= self.max_depth {
                warn!(path = %path.display(), max_depth = self.max_depth, "maximum directory depth reached, not descending");
                continue;
            }

            match fs::read_dir(&path) {
                Ok(entries) => {
                    let mut children: Vec<PathBuf> = entries
                        .filter_map(|entry| match entry {
                            Ok(entry) => Some(entry.path()),
                            Err(e) => {
                                warn!(path = %path.display(), error = %e, "cannot read directory entry");
                                None
                            }
                        })
                        .collect();
                    children.sort();
                    self.pending
                        .extend(children.into_iter().rev().map(|c| (c, depth + 1)));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot read directory, skipping");
                }
            }
        }
        None
    }
}

struct WalkState {
    walker: Walker,
    next_id: usize,
}

/// Files found by recursively walking one or more roots.
///
/// A root may be a file, a directory, or a symlink to either. Files that
/// cannot be opened are logged and skipped.
pub struct DirectorySource {
    roots: Vec<PathBuf>,
    max_depth: usize,
    state: Mutex<WalkState>,
}

impl DirectorySource {
    pub fn new<P: AsRef<Path>>(roots: &[P]) -> Self {
        Self::with_max_depth(roots, MAX_DEPTH)
    }

    pub fn with_max_depth<P: AsRef<Path>>(roots: &[P], max_depth: usize) -> Self {
        let roots: Vec<PathBuf> = roots.iter().map(|p| p.as_ref().to_path_buf()).collect();
        let walker = Walker::new(&roots, max_depth);
        Self {
            roots,
            max_depth,
            state: Mutex::new(WalkState { walker, next_id: 0 }),
        }
    }

    /// Number of files a full walk would visit.
    pub fn count_files(&self) -> usize {
        let mut walker = Walker::new(&self.roots, self.max_depth);
        std::iter::from_fn(|| walker.next_path()).count()
    }
}

impl FileSource for DirectorySource {
    fn next_file(&self) -> Option<SourceFile> {
        loop {
            let (path, id) = {
                let mut state = self.state.lock();
                let path = state.walker.next_path()?;
                let id = state.next_id;
                state.next_id += 1;
                (path, id)
            };

            match File::open(&path) {
                Ok(file) => {
                    return Some(SourceFile {
                        id,
                        name: path.display().to_string(),
                        reader: Box::new(file),
                    })
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        os_error = e.raw_os_error(),
                        error = %e,
                        "cannot open file, skipping"
                    );
                }
            }
        }
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.walker = Walker::new(&self.roots, self.max_depth);
        state.next_id = 0;
        debug!(roots = self.roots.len(), "rewound directory source");
    }
}

/// Files held in memory; mostly for tests and benchmarks.
pub struct MemorySource {
    files: Vec<Arc<[u8]>>,
    next: AtomicUsize,
}

impl MemorySource {
    pub fn new<I, B>(files: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Arc<[u8]>>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FileSource for MemorySource {
    fn next_file(&self) -> Option<SourceFile> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let data = self.files.get(id)?;
        Some(SourceFile {
            id,
            name: format!("<memory #{id}>"),
            reader: Box::new(Cursor::new(Arc::clone(data))),
        })
    }

    fn reset(&self) {
        self.next.store(0, Ordering::Relaxed);
    }
}

/// Splits a reader into chunks of `chunk_size` new bytes, each prefixed with
/// the last `overlap` bytes of the previous chunk.
pub struct Chunks<R> {
    reader: R,
    chunk_size: usize,
    overlap: usize,
    carry: VecDeque<u8>,
    done: bool,
}

impl<R: Read> Chunks<R> {
    pub fn new(reader: R, chunk_size: usize, overlap: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
            overlap,
            carry: VecDeque::with_capacity(overlap),
            done: false,
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl<R: Read> Iterator for Chunks<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut buf = Vec::with_capacity(self.carry.len() + self.chunk_size);
        buf.extend(self.carry.iter().copied());
        let start = buf.len();
        buf.resize(start + self.chunk_size, 0);

        let read = match self.fill(&mut buf[start..]) {
            Ok(n) => n,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if read == 0 {
            self.done = true;
            return None;
        }
        if read < self.chunk_size {
            self.done = true;
        }
        buf.truncate(start + read);

        let keep = self.overlap.min(buf.len());
        self.carry.clear();
        self.carry.extend(buf[buf.len() - keep..].iter().copied());
        Some(Ok(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(data: &[u8], chunk_size: usize, overlap: usize) -> Vec<Vec<u8>> {
        Chunks::new(data, chunk_size, overlap)
            .map(|c| c.unwrap())
            .collect()
    }

    #[test]
    fn test_chunks_overlap() {
        let chunks = collect(b"abcdefgh", 3, 2);
        assert_eq!(
            chunks,
            vec![b"abc".to_vec(), b"bcdef".to_vec(), b"efgh".to_vec()]
        );

        // Every 3-gram shows up in exactly one chunk.
        let mut grams: Vec<Vec<u8>> = chunks
            .iter()
            .flat_map(|c| c.windows(3).map(|w| w.to_vec()))
            .collect();
        grams.sort();
        let mut expected: Vec<Vec<u8>> = b"abcdefgh".windows(3).map(|w| w.to_vec()).collect();
        expected.sort();
        assert_eq!(grams, expected);
    }

    #[test]
    fn test_chunks_edge_sizes() {
        assert!(collect(b"", 4, 2).is_empty());
        assert_eq!(collect(b"ab", 4, 2), vec![b"ab".to_vec()]);
        assert_eq!(collect(b"abcd", 4, 2), vec![b"abcd".to_vec()]);
    }

    #[test]
    fn test_memory_source() {
        let source = MemorySource::new(vec![b"one".to_vec(), b"two".to_vec()]);
        let mut ids = Vec::new();
        while let Some(mut file) = source.next_file() {
            let mut s = String::new();
            file.reader.read_to_string(&mut s).unwrap();
            ids.push((file.id, s));
        }
        assert_eq!(ids, vec![(0, "one".into()), (1, "two".into())]);

        source.reset();
        assert_eq!(source.next_file().map(|f| f.id), Some(0));
    }

    #[test]
    fn test_directory_walk() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("top.bin"), b"x").unwrap();
        fs::write(dir.path().join("a/one.bin"), b"y").unwrap();
        fs::write(dir.path().join("a/b/two.bin"), b"z").unwrap();
        let single = dir.path().join("top.bin");

        let source = DirectorySource::new(&[dir.path().to_path_buf(), single]);
        assert_eq!(source.count_files(), 4);

        let mut names = Vec::new();
        while let Some(file) = source.next_file() {
            names.push((file.id, file.name));
        }
        assert_eq!(names.len(), 4);
        assert_eq!(names.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(names[0].1.ends_with("two.bin"));

        source.reset();
        assert_eq!(source.next_file().map(|f| f.id), Some(0));
    }

    #[test]
    fn test_directory_depth_cap() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("1/2")).unwrap();
        fs::write(dir.path().join("1/shallow"), b"s").unwrap();
        fs::write(dir.path().join("1/2/deep"), b"d").unwrap();

        let source = DirectorySource::with_max_depth(&[dir.path()], 2);
        assert_eq!(source.count_files(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_follows_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        fs::write(data.path().join("real.bin"), b"r").unwrap();
        std::os::unix::fs::symlink(data.path(), dir.path().join("linked")).unwrap();
        std::os::unix::fs::symlink(data.path().join("real.bin"), dir.path().join("file_link")).unwrap();

        let source = DirectorySource::new(&[dir.path()]);
        assert_eq!(source.count_files(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_skips_dangling_symlink() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), b"a").unwrap();
        fs::write(dir.path().join("c.bin"), b"c").unwrap();
        std::os::unix::fs::symlink("/nonexistent", dir.path().join("broken")).unwrap();

        let source = DirectorySource::new(&[dir.path()]);
        assert_eq!(source.count_files(), 2);

        let mut files = Vec::new();
        while let Some(file) = source.next_file() {
            files.push((file.id, file.name));
        }
        assert_eq!(files.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![0, 1]);
        assert!(files[0].1.ends_with("a.bin"));
        assert!(files[1].1.ends_with("c.bin"));
    }
}
