//! Multi-pass top-k n-gram extraction.
//!
//! Pass 3 counts every 3-gram. Each later pass `L` compiles the n-grams kept
//! by pass `L - 1` into a [`PackedTrie`] and only counts `L`-grams that extend
//! one of them. Intermediate passes keep `k * overage` n-grams so that a
//! prefix that is only moderately frequent still gets a chance to grow into a
//! frequent longer n-gram; the final pass keeps exactly `k`. This pruning is
//! a heuristic: an n-gram whose prefix fell out at an earlier pass is never
//! considered again.
//!
//! Within a pass, each of `threads` workers is a reader thread feeding a
//! counting thread over a bounded channel. Passes are separated by joining
//! every thread of the previous pass.

mod output;

pub use output::{output_path, write_pass};

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::counter::{mark_chunk, BitsetLease, BitsetPool, MAX_GROUP_SIZE};
use crate::counts::CountsArray;
use crate::error::{Error, Result};
use crate::packed_trie::PackedTrie;
use crate::prefix_set::PrefixSet;
use crate::source::{Chunks, FileSource};
use crate::space::NgramSpace;
use crate::topk::find_top_k;

/// Settings for a [`Pipeline`] run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Length of the n-grams to find (at least 3).
    pub n: usize,
    /// Number of n-grams to report.
    pub k: usize,
    /// Over-retention factor for intermediate passes (at least 1.0).
    ///
    /// Values above 1.0 can keep a prefix that only ever occurs at the very
    /// end of files. The next pass then finds no extension for it and fails
    /// with [`Error::ZeroCountPrefix`].
    pub overage: f64,
    /// Reader/counter worker pairs per pass.
    pub threads: usize,
    /// Also write the result of every intermediate pass.
    pub save_intermediate: bool,
    /// Output files are `<output_prefix>.<L>.txt`; nothing is written if unset.
    pub output_prefix: Option<PathBuf>,
    /// Bitsets merged into the counts per flush.
    pub group_size: usize,
    /// Bytes read from a file per chunk.
    pub chunk_size: usize,
    /// Chunks buffered between a reader and its counting thread.
    pub queue_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            n: 3,
            k: 1000,
            overage: 1.0,
            threads: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            save_intermediate: false,
            output_prefix: None,
            group_size: 8,
            chunk_size: 64 * 1024,
            queue_depth: 32,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::InvalidConfig(msg));
        if self.n < 3 {
            return fail(format!("n must be at least 3, got {}", self.n));
        }
        if self.k == 0 {
            return fail("k must be at least 1".into());
        }
        if !self.overage.is_finite() || self.overage < 1.0 {
            return fail(format!("overage must be a number >= 1.0, got {}", self.overage));
        }
        if self.threads == 0 {
            return fail("at least one thread is required".into());
        }
        if !(1..=MAX_GROUP_SIZE).contains(&self.group_size) {
            return fail(format!(
                "group size must be between 1 and {MAX_GROUP_SIZE}, got {}",
                self.group_size
            ));
        }
        if self.chunk_size == 0 {
            return fail("chunk size must be positive".into());
        }
        if self.queue_depth == 0 {
            return fail("queue depth must be positive".into());
        }
        Ok(())
    }

    /// Number of n-grams kept by the pass over `ngram_len`-grams.
    pub fn keep_size(&self, ngram_len: usize) -> usize {
        if ngram_len >= self.n {
            self.k
        } else {
            (self.k as f64 * self.overage).ceil() as usize
        }
    }
}

/// Diagnostics gathered from the workers of one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub files: usize,
    /// File bytes read; the overlap repeated between chunks counts once.
    pub bytes: u64,
    pub chunks: usize,
    /// N-gram windows that fell inside the counted space.
    pub marked: u64,
    /// Times a counting thread found its queue empty.
    pub chunk_waits: usize,
    /// Times a reader found its queue full.
    pub send_waits: usize,
    pub bitset_waits: usize,
    pub flushes: usize,
    pub flushed_bitsets: usize,
}

/// Result of one pass.
#[derive(Debug)]
pub struct PassOutput {
    pub ngram_len: usize,
    /// Kept n-grams, in selection order.
    pub selected: PrefixSet,
    pub stats: PassStats,
    pub trie_time: Duration,
    pub count_time: Duration,
    pub top_k_time: Duration,
    /// Set if the pass result was written.
    pub output: Option<PathBuf>,
}

struct Chunk {
    file_id: usize,
    data: Vec<u8>,
}

#[derive(Default)]
struct ReaderStats {
    files: usize,
    bytes: u64,
    chunks: usize,
    send_waits: usize,
}

#[derive(Default)]
struct CounterStats {
    marked: u64,
    chunk_waits: usize,
}

/// Drives counting passes over the files of a [`FileSource`].
pub struct Pipeline<S> {
    config: PipelineConfig,
    source: S,
}

impl<S: FileSource> Pipeline<S> {
    pub fn new(config: PipelineConfig, source: S) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, source })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every pass from 3 up to `n` and return the per-pass results.
    pub fn run(&self) -> Result<Vec<PassOutput>> {
        let mut outputs = Vec::with_capacity(self.config.n - 2);

        let started = Instant::now();
        let (counts, stats) = self.count_pass(NgramSpace::Fixed)?;
        let count_time = started.elapsed();

        let started = Instant::now();
        let mut kept = find_top_k(&counts, self.config.keep_size(3))?;
        let top_k_time = started.elapsed();
        drop(counts);

        outputs.push(self.finish_pass(3, kept.clone(), stats, Duration::ZERO, count_time, top_k_time)?);

        for len in 4..=self.config.n {
            let started = Instant::now();
            let trie = PackedTrie::build(&mut kept)?;
            let trie_time = started.elapsed();
            debug!(ngram_len = len, prefixes = trie.len(), bytes = trie.memory_usage(), "prefix trie ready");

            let started = Instant::now();
            let (counts, stats) = self.count_pass(NgramSpace::Prefixed(&trie))?;
            let count_time = started.elapsed();

            let started = Instant::now();
            let selected = find_top_k(&counts, self.config.keep_size(len))?;
            let top_k_time = started.elapsed();
            drop(counts);

            kept = selected.clone();
            outputs.push(self.finish_pass(len, selected, stats, trie_time, count_time, top_k_time)?);
        }

        Ok(outputs)
    }

    fn finish_pass(
        &self,
        len: usize,
        selected: PrefixSet,
        stats: PassStats,
        trie_time: Duration,
        count_time: Duration,
        top_k_time: Duration,
    ) -> Result<PassOutput> {
        info!(
            ngram_len = len,
            kept = selected.len(),
            requested = self.config.keep_size(len),
            files = stats.files,
            bytes = stats.bytes,
            trie_secs = trie_time.as_secs_f64(),
            count_secs = count_time.as_secs_f64(),
            top_k_secs = top_k_time.as_secs_f64(),
            "pass complete"
        );
        if selected.len() < self.config.keep_size(len) {
            warn!(
                ngram_len = len,
                kept = selected.len(),
                "fewer n-grams occurred in more than one file than requested"
            );
        }

        let output = match &self.config.output_prefix {
            Some(prefix) if self.config.save_intermediate || len == self.config.n => {
                Some(write_pass(prefix, &selected, self.config.k)?)
            }
            _ => None,
        };

        Ok(PassOutput {
            ngram_len: len,
            selected,
            stats,
            trie_time,
            count_time,
            top_k_time,
            output,
        })
    }

    /// Count, for every n-gram of `space`, the number of files it occurs in.
    pub fn count_pass<'t>(&self, space: NgramSpace<'t>) -> Result<(CountsArray<'t>, PassStats)> {
        self.source.reset();

        let cfg = &self.config;
        let counts = CountsArray::new(space)?;
        let pool = BitsetPool::new(cfg.threads + cfg.group_size, counts.words(), cfg.group_size)?;
        let overlap = space.ngram_len() - 1;

        let results = thread::scope(|s| {
            let workers: Vec<_> = (0..cfg.threads)
                .map(|_| {
                    let (tx, rx) = mpsc::sync_channel(cfg.queue_depth);
                    let source = &self.source;
                    let reader = s.spawn(move || read_files(source, tx, cfg.chunk_size, overlap));
                    let (counts, pool) = (&counts, &pool);
                    let counter = s.spawn(move || count_chunks(&space, counts, pool, rx));
                    (reader, counter)
                })
                .collect();

            workers
                .into_iter()
                .map(|(reader, counter)| -> Result<(ReaderStats, CounterStats)> {
                    let counted = counter.join().map_err(|_| Error::WorkerPanic("counting"));
                    let read = reader.join().map_err(|_| Error::WorkerPanic("reader"));
                    Ok((read?, counted??))
                })
                .collect::<Vec<_>>()
        });

        let mut stats = PassStats::default();
        for result in results {
            let (read, counted) = result?;
            stats.files += read.files;
            stats.bytes += read.bytes;
            stats.chunks += read.chunks;
            stats.send_waits += read.send_waits;
            stats.marked += counted.marked;
            stats.chunk_waits += counted.chunk_waits;
        }

        pool.drain(&counts)?;
        let pool_stats = pool.stats();
        stats.bitset_waits = pool_stats.waits;
        stats.flushes = pool_stats.flushes;
        stats.flushed_bitsets = pool_stats.flushed_bitsets;

        debug!(
            ngram_len = space.ngram_len(),
            files = stats.files,
            chunks = stats.chunks,
            marked = stats.marked,
            chunk_waits = stats.chunk_waits,
            send_waits = stats.send_waits,
            bitset_waits = stats.bitset_waits,
            flushes = stats.flushes,
            "workers finished"
        );
        Ok((counts, stats))
    }
}

/// Reader half of a worker: claim files and stream their chunks.
fn read_files(source: &dyn FileSource, tx: SyncSender<Chunk>, chunk_size: usize, overlap: usize) -> ReaderStats {
    let mut stats = ReaderStats::default();
    while let Some(file) = source.next_file() {
        stats.files += 1;
        let (file_id, name) = (file.id, file.name);

        // Bytes at the front of the next chunk that were already counted.
        let mut carried = 0;
        for chunk in Chunks::new(file.reader, chunk_size, overlap) {
            let data = match chunk {
                Ok(data) => data,
                Err(e) => {
                    warn!(file = %name, os_error = e.raw_os_error(), error = %e, "read failed, skipping rest of file");
                    break;
                }
            };
            stats.bytes += (data.len() - carried) as u64;
            stats.chunks += 1;
            carried = overlap.min(data.len());

            let sent = match tx.try_send(Chunk { file_id, data }) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(chunk)) => {
                    stats.send_waits += 1;
                    tx.send(chunk).map_err(|_| ())
                }
                Err(TrySendError::Disconnected(_)) => Err(()),
            };
            if sent.is_err() {
                // The counting thread is gone; it reports its own error.
                return stats;
            }
        }
    }
    stats
}

/// Counting half of a worker: mark each file's n-grams in its own bitset.
fn count_chunks(
    space: &NgramSpace<'_>,
    counts: &CountsArray<'_>,
    pool: &BitsetPool,
    rx: Receiver<Chunk>,
) -> Result<CounterStats> {
    let mut stats = CounterStats::default();
    let mut lease: Option<BitsetLease<'_>> = None;
    let mut current_file = None;

    loop {
        let chunk = match rx.try_recv() {
            Ok(chunk) => chunk,
            Err(TryRecvError::Empty) => {
                stats.chunk_waits += 1;
                match rx.recv() {
                    Ok(chunk) => chunk,
                    Err(_) => break,
                }
            }
            Err(TryRecvError::Disconnected) => break,
        };

        // Occurrence is per file: a new file gets a fresh bitset.
        if current_file != Some(chunk.file_id) {
            if let Some(done) = lease.take() {
                done.release();
                pool.try_flush(counts, pool.group_size())?;
            }
            lease = Some(pool.claim_blocking(counts)?);
            current_file = Some(chunk.file_id);
        }

        if let Some(lease) = lease.as_mut() {
            stats.marked += mark_chunk(space, lease.bitset(), &chunk.data) as u64;
        }
    }

    drop(lease);
    pool.try_flush(counts, pool.group_size())?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    fn config(n: usize, k: usize) -> PipelineConfig {
        PipelineConfig {
            n,
            k,
            threads: 2,
            group_size: 2,
            chunk_size: 4,
            queue_depth: 2,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_validate() {
        assert!(config(3, 1).validate().is_ok());
        assert!(config(2, 1).validate().is_err());
        assert!(config(3, 0).validate().is_err());
        assert!(PipelineConfig { overage: 0.5, ..config(4, 1) }.validate().is_err());
        assert!(PipelineConfig { overage: f64::NAN, ..config(4, 1) }.validate().is_err());
        assert!(PipelineConfig { group_size: 17, ..config(4, 1) }.validate().is_err());
        assert!(PipelineConfig { threads: 0, ..config(4, 1) }.validate().is_err());
    }

    #[test]
    fn test_keep_size() {
        let cfg = PipelineConfig { overage: 1.5, ..config(5, 10) };
        assert_eq!(cfg.keep_size(3), 15);
        assert_eq!(cfg.keep_size(4), 15);
        assert_eq!(cfg.keep_size(5), 10);
    }

    #[test]
    fn test_count_pass_counts_files_not_occurrences() {
        let source = MemorySource::new(vec![b"abcabcabc".to_vec(), b"xxabc".to_vec(), b"ab".to_vec()]);
        let pipeline = Pipeline::new(config(3, 1), source).unwrap();

        let (counts, stats) = pipeline.count_pass(NgramSpace::Fixed).unwrap();
        assert_eq!(counts.get(0x616263), 2);
        assert_eq!(counts.get(0x626361), 1);
        assert_eq!(counts.get(0x787861), 1);
        assert_eq!(counts.get(0x616262), 0);
        assert_eq!(stats.files, 3);
        assert_eq!(stats.marked, 7 + 3);
    }

    #[test]
    fn test_bytes_exclude_chunk_overlap() {
        let files = vec![b"abcdefghij".to_vec(), b"xy".to_vec(), b"0123".to_vec()];
        let pipeline = Pipeline::new(config(3, 1), MemorySource::new(files)).unwrap();

        let (_, stats) = pipeline.count_pass(NgramSpace::Fixed).unwrap();
        // 10 bytes in chunks of 4 new bytes carry 2 overlap bytes twice.
        assert_eq!(stats.chunks, 3 + 1 + 1);
        assert_eq!(stats.bytes, 10 + 2 + 4);
    }

    #[test]
    fn test_run_extends_prefixes() {
        let files: Vec<Vec<u8>> = (0..5).map(|i| format!("{i}-hello world-{i}").into_bytes()).collect();
        let pipeline = Pipeline::new(config(5, 1), MemorySource::new(files)).unwrap();

        let passes = pipeline.run().unwrap();
        assert_eq!(passes.len(), 3);
        let last = &passes[2];
        assert_eq!(last.ngram_len, 5);
        assert_eq!(last.selected.len(), 1);
        assert_eq!(last.selected.counts(), &[5]);
        assert!(last.output.is_none());
    }
}
