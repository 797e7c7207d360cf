//! The write side: sinks, the shared write head, chunk budgets and the four
//! backends.
//!
//! Every backend drives the same [`WriteHead`]: clamp the chunk to the byte
//! ceiling, hash it, write it (or skip it for a sparse hole), keep the
//! counters, fire the fsync interval. What differs between backends is only
//! who generates and who holds the head when.

pub(crate) mod buffer;
pub(crate) mod multi;
pub(crate) mod pipeline;
pub(crate) mod stream;

use std::io::Write as _;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use metrics::{register_counter, Counter};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use bytepump_payload::{Chunk, TokenSource};

use crate::config::{Disposition, JobConfig};
use crate::integrity::Hasher;
use crate::target::Target;

const BACKOFF_BASE_MS: u64 = 25;
const BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Errors on the write path.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper around [`std::io::Error`].
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    /// The job-wide error budget ran dry.
    #[error("error budget exhausted; last failure: {source}")]
    BudgetExhausted {
        /// The failure that spent the final unit.
        source: std::io::Error,
    },
    /// One chunk failed through all its retries.
    #[error("chunk write failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Attempts made, first try included.
        attempts: u32,
        /// The last failure.
        source: std::io::Error,
    },
}

/// Where bytes land.
#[derive(Debug)]
pub(crate) enum Sink {
    File(fs::File),
    Stdout(tokio::io::Stdout),
}

impl Sink {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Self::File(file) => file.write_all(bytes).await,
            Self::Stdout(stdout) => stdout.write_all(bytes).await,
        }
    }

    async fn seek_to(&mut self, position: u64) -> std::io::Result<()> {
        match self {
            Self::File(file) => {
                file.seek(SeekFrom::Start(position)).await?;
                Ok(())
            }
            Self::Stdout(_) => Ok(()),
        }
    }

    async fn sync(&mut self) -> std::io::Result<()> {
        match self {
            Self::File(file) => {
                file.flush().await?;
                file.sync_all().await
            }
            Self::Stdout(stdout) => stdout.flush().await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::File(file) => file.flush().await,
            Self::Stdout(stdout) => stdout.flush().await,
        }
    }

    fn is_file(&self) -> bool {
        matches!(self, Self::File(_))
    }
}

/// Shared retry policy: per-chunk attempts plus the job-wide budget.
#[derive(Debug, Clone)]
pub(crate) struct RetryState {
    io_retries: u32,
    budget: Arc<AtomicI64>,
}

impl RetryState {
    pub(crate) fn new(io_retries: u32, error_budget: u64) -> Self {
        Self {
            io_retries,
            budget: Arc::new(AtomicI64::new(
                i64::try_from(error_budget).unwrap_or(i64::MAX),
            )),
        }
    }
}

/// Stop-bound bookkeeping shared by every generator of a job. Token
/// reservations happen before generation so count-bound jobs land exactly on
/// their configured total no matter how many workers draw from the pool.
#[derive(Debug)]
pub(crate) struct Budget {
    times: Option<u64>,
    reserved: AtomicU64,
    done: AtomicBool,
}

impl Budget {
    pub(crate) fn new(times: Option<u64>) -> Self {
        Self {
            times,
            reserved: AtomicU64::new(0),
            done: AtomicBool::new(false),
        }
    }

    /// Reserve up to `want` tokens. Returns 0 when a count bound is spent.
    fn reserve(&self, want: u64) -> u64 {
        let Some(times) = self.times else {
            return want;
        };
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            let remaining = times.saturating_sub(current);
            if remaining == 0 {
                return 0;
            }
            let take = want.min(remaining);
            match self.reserved.compare_exchange(
                current,
                current + take,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return take,
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self, unused: u64) {
        if self.times.is_some() && unused > 0 {
            self.reserved.fetch_sub(unused, Ordering::AcqRel);
        }
    }

    pub(crate) fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// One generator's view of a job: its token source plus the shared budget.
#[derive(Debug)]
pub(crate) struct GenState {
    source: TokenSource,
    budget: Arc<Budget>,
    chunk: NonZeroUsize,
    tokens_per_chunk: u64,
}

impl GenState {
    pub(crate) fn new(
        source: TokenSource,
        budget: Arc<Budget>,
        chunk: NonZeroUsize,
        tokens_per_chunk: u64,
    ) -> Self {
        Self {
            source,
            budget,
            chunk,
            tokens_per_chunk: tokens_per_chunk.max(1),
        }
    }

    /// Generate the next chunk, or `None` once the job's bounds are spent.
    pub(crate) fn next(&mut self) -> Option<Chunk> {
        if self.budget.is_done() {
            return None;
        }
        let reserved = self.budget.reserve(self.tokens_per_chunk);
        if reserved == 0 {
            return None;
        }
        let cap = self.budget.times.map(|_| reserved);
        let chunk = self.source.next_chunk(self.chunk, cap);
        self.budget.release(reserved.saturating_sub(chunk.tokens));
        Some(chunk)
    }
}

/// Outcome of a push against the byte ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pushed {
    Continue,
    CeilingReached,
}

/// Result of closing a write head.
#[derive(Debug)]
pub(crate) struct Closed {
    pub(crate) bytes: u64,
    pub(crate) tokens: u64,
    pub(crate) digest: Option<String>,
}

/// Aggregate result of one backend run.
#[derive(Debug)]
pub(crate) struct Outcome {
    pub(crate) bytes: u64,
    pub(crate) tokens: u64,
    pub(crate) digest: Option<String>,
    pub(crate) interrupted: bool,
}

impl Outcome {
    fn from_closed(closed: Closed, interrupted: bool) -> Self {
        Self {
            bytes: closed.bytes,
            tokens: closed.tokens,
            digest: closed.digest,
            interrupted,
        }
    }
}

/// The per-target mutable write state. Under the multi-writer backend the
/// whole struct sits behind one mutex; seek, write, hash update and counter
/// updates form a single critical section.
pub(crate) struct WriteHead {
    sink: Sink,
    /// File offset of the next write. Meaningless under gzip, where the
    /// compressed stream simply appends.
    position: u64,
    sparse: bool,
    /// The last operation was a sparse skip; close() must materialize the
    /// trailing hole.
    pending_hole: bool,
    bytes_written: u64,
    tokens: u64,
    since_fsync: u64,
    fsync_interval: Option<u64>,
    /// Ceiling on `bytes_written`: the size bound capped by max-bytes.
    byte_ceiling: Option<u64>,
    hasher: Option<Hasher>,
    gzip: Option<GzEncoder<Vec<u8>>>,
    progress_bytes: Arc<AtomicU64>,
    bytes_counter: Counter,
}

impl std::fmt::Debug for WriteHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteHead")
            .field("position", &self.position)
            .field("bytes_written", &self.bytes_written)
            .field("tokens", &self.tokens)
            .field("sparse", &self.sparse)
            .field("byte_ceiling", &self.byte_ceiling)
            .finish()
    }
}

/// A freshly opened target.
#[derive(Debug)]
pub(crate) struct OpenTarget {
    pub(crate) head: WriteHead,
    /// Logical start offset, where verification re-reads from.
    pub(crate) start: u64,
}

/// Open `target` per the job's disposition and seek options and assemble the
/// write head.
///
/// # Errors
///
/// Any I/O failure while opening or preparing the file.
pub(crate) async fn open_target(
    target: &Target,
    config: &JobConfig,
    byte_ceiling: Option<u64>,
    progress_bytes: Arc<AtomicU64>,
) -> Result<OpenTarget, Error> {
    let labels = vec![
        ("component".to_string(), "writer".to_string()),
        ("target".to_string(), target.to_string()),
    ];
    let bytes_counter = register_counter!("bytes_written", &labels);

    let (sink, start, preexisting) = match target {
        Target::Stdout => (Sink::Stdout(tokio::io::stdout()), 0, 0),
        Target::File(path) => open_file(path, config).await?,
    };

    // Resume spends part of a size bound on bytes already present.
    let byte_ceiling = byte_ceiling.map(|ceiling| ceiling.saturating_sub(preexisting));

    let sparse = effective_sparse(config.sparse, &sink);
    let mut head = WriteHead {
        sink,
        position: start,
        sparse,
        pending_hole: false,
        bytes_written: 0,
        tokens: 0,
        since_fsync: 0,
        fsync_interval: config.fsync_interval,
        byte_ceiling,
        hasher: config.hash.map(Hasher::new),
        gzip: config
            .gzip
            .then(|| GzEncoder::new(Vec::new(), Compression::default())),
        progress_bytes,
        bytes_counter,
    };
    head.sink.seek_to(start).await?;
    Ok(OpenTarget { head, start })
}

async fn open_file(path: &Path, config: &JobConfig) -> Result<(Sink, u64, u64), Error> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true);
    if config.disposition == Disposition::Truncate && config.truncate_to.is_none() {
        options.truncate(true);
    }
    let file = options.open(path)?;
    if let Some(len) = config.truncate_to {
        file.set_len(len)?;
    }
    if let Some(len) = config.fallocate_to {
        preallocate(&file, len)?;
    }

    let end = file.metadata()?.len();
    let start = if let Some(offset) = config.offset {
        offset
    } else if config.disposition == Disposition::Append || config.resume {
        end
    } else {
        0
    };
    let preexisting = if config.resume { start } else { 0 };
    Ok((Sink::File(fs::File::from_std(file)), start, preexisting))
}

#[cfg(unix)]
fn preallocate(file: &std::fs::File, len: u64) -> std::io::Result<()> {
    let len = i64::try_from(len)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "length too large"))?;
    nix::fcntl::fallocate(
        std::os::unix::io::AsRawFd::as_raw_fd(file),
        nix::fcntl::FallocateFlags::empty(),
        0,
        len,
    )
        .map_err(std::io::Error::from)?;
    Ok(())
}

#[cfg(not(unix))]
fn preallocate(file: &std::fs::File, len: u64) -> std::io::Result<()> {
    // No fallocate here; extending the file is the closest effect.
    warn!("fallocate unavailable on this platform; extending instead");
    file.set_len(len)
}

/// Whether sparse skipping is actually usable for this sink. Platforms that
/// need an explicit sparse attribute degrade to plain writes.
fn effective_sparse(requested: bool, sink: &Sink) -> bool {
    if !requested {
        return false;
    }
    if !sink.is_file() {
        debug!("sparse skipping disabled for non-file target");
        return false;
    }
    if cfg!(unix) {
        true
    } else {
        warn!("sparse attribute unsupported on this platform; writing zeroes instead");
        false
    }
}

impl WriteHead {
    /// Append one generated chunk: clamp to the ceiling, hash, write or
    /// sparse-skip, account, honor the fsync interval.
    pub(crate) async fn push(
        &mut self,
        chunk: &Chunk,
        retry: &RetryState,
    ) -> Result<Pushed, Error> {
        self.push_inner(&chunk.bytes, chunk.tokens, retry, true).await
    }

    /// As [`WriteHead::push`] for bytes hashed already during a buffer fill.
    async fn push_prehashed(
        &mut self,
        bytes: &[u8],
        tokens: u64,
        retry: &RetryState,
    ) -> Result<Pushed, Error> {
        self.push_inner(bytes, tokens, retry, false).await
    }

    async fn push_inner(
        &mut self,
        bytes: &[u8],
        tokens: u64,
        retry: &RetryState,
        hash: bool,
    ) -> Result<Pushed, Error> {
        let mut bytes = bytes;
        let mut reached = false;
        if let Some(ceiling) = self.byte_ceiling {
            let remaining = ceiling.saturating_sub(self.bytes_written);
            let remaining = usize::try_from(remaining).unwrap_or(usize::MAX);
            if bytes.len() >= remaining {
                bytes = &bytes[..remaining];
                reached = true;
            }
        }
        if bytes.is_empty() {
            return Ok(Pushed::CeilingReached);
        }

        if hash {
            if let Some(hasher) = &mut self.hasher {
                hasher.update(bytes);
            }
        }

        if let Some(encoder) = &mut self.gzip {
            encoder.write_all(bytes)?;
            let compressed = std::mem::take(encoder.get_mut());
            if !compressed.is_empty() {
                write_with_retry(&mut self.sink, &compressed, None, retry).await?;
            }
        } else if self.sparse && bytes.iter().all(|byte| *byte == 0) {
            self.position += bytes.len() as u64;
            self.pending_hole = true;
        } else {
            write_with_retry(&mut self.sink, bytes, Some(self.position), retry).await?;
            self.position += bytes.len() as u64;
            self.pending_hole = false;
        }

        self.bytes_written += bytes.len() as u64;
        self.tokens += tokens;
        self.bytes_counter.increment(bytes.len() as u64);
        self.progress_bytes
            .store(self.bytes_written, Ordering::Relaxed);

        if let Some(interval) = self.fsync_interval {
            self.since_fsync += bytes.len() as u64;
            if self.since_fsync >= interval {
                self.sink.sync().await?;
                self.since_fsync = 0;
            }
        }

        Ok(if reached {
            Pushed::CeilingReached
        } else {
            Pushed::Continue
        })
    }

    /// Keep durability's final sync but stop interval-driven syncs; the RAM
    /// buffer performs one write and one sync.
    pub(crate) fn suspend_fsync_interval(&mut self) {
        if let Some(interval) = &mut self.fsync_interval {
            *interval = u64::MAX;
        }
    }

    /// Hash bytes without writing them; the RAM buffer hashes during fill.
    pub(crate) fn hash_only(&mut self, bytes: &[u8]) {
        if let Some(hasher) = &mut self.hasher {
            hasher.update(bytes);
        }
    }

    /// Remaining room under the byte ceiling.
    pub(crate) fn remaining(&self) -> Option<u64> {
        self.byte_ceiling
            .map(|ceiling| ceiling.saturating_sub(self.bytes_written))
    }

    /// Finish the stream: flush compression, materialize a trailing hole,
    /// fsync once when durability is on, and yield the digest.
    pub(crate) async fn close(mut self, retry: &RetryState) -> Result<Closed, Error> {
        if let Some(encoder) = self.gzip.take() {
            let tail = encoder.finish()?;
            if !tail.is_empty() {
                write_with_retry(&mut self.sink, &tail, None, retry).await?;
            }
        }
        if self.pending_hole {
            if let Sink::File(file) = &mut self.sink {
                let on_disk = file.metadata().await?.len();
                if self.position > on_disk {
                    file.set_len(self.position).await?;
                }
            }
        }
        if self.fsync_interval.is_some() {
            self.sink.sync().await?;
        } else {
            self.sink.flush().await?;
        }
        Ok(Closed {
            bytes: self.bytes_written,
            tokens: self.tokens,
            digest: self.hasher.map(Hasher::finish),
        })
    }
}

/// Write one buffer, re-seeking and retrying with bounded backoff. Every
/// failed attempt spends one unit of the job's error budget.
async fn write_with_retry(
    sink: &mut Sink,
    bytes: &[u8],
    position: Option<u64>,
    retry: &RetryState,
) -> Result<(), Error> {
    let mut attempt: u32 = 0;
    loop {
        if let Some(position) = position {
            sink.seek_to(position).await?;
        }
        match sink.write_all(bytes).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                metrics::counter!("write_failure", 1);
                warn!(attempt, error = %err, "chunk write failed");
                let left = retry.budget.fetch_sub(1, Ordering::AcqRel) - 1;
                if left < 0 {
                    return Err(Error::BudgetExhausted { source: err });
                }
                if attempt >= retry.io_retries {
                    return Err(Error::RetriesExhausted {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
                let backoff =
                    Duration::from_millis(BACKOFF_BASE_MS << attempt.min(6)).min(BACKOFF_CAP);
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Clamp a chunk length into the non-zero u32 domain of the rate throttle.
pub(crate) fn throttle_portion(len: usize) -> std::num::NonZeroU32 {
    let clamped = u32::try_from(len).unwrap_or(u32::MAX).max(1);
    std::num::NonZeroU32::new(clamped).expect("clamped to at least 1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_reservations_land_exactly_on_the_total() {
        let budget = Budget::new(Some(10));
        assert_eq!(budget.reserve(4), 4);
        assert_eq!(budget.reserve(4), 4);
        assert_eq!(budget.reserve(4), 2);
        assert_eq!(budget.reserve(4), 0);
        budget.release(2);
        assert_eq!(budget.reserve(4), 2);
    }

    #[test]
    fn unbounded_budget_always_grants() {
        let budget = Budget::new(None);
        assert_eq!(budget.reserve(u64::MAX), u64::MAX);
        assert_eq!(budget.reserve(7), 7);
    }

    #[test]
    fn throttle_portion_clamps() {
        assert_eq!(throttle_portion(0).get(), 1);
        assert_eq!(throttle_portion(17).get(), 17);
        assert_eq!(throttle_portion(usize::MAX).get(), u32::MAX);
    }
}
