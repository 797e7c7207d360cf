//! Job configuration: the layered partial config, the resolved [`JobConfig`]
//! and the invariants validated before any side effect.
//!
//! Configuration arrives in two layers. A config file (JSON, YAML or TOML,
//! picked by extension) deserializes into a [`Partial`]; the command line
//! produces another [`Partial`]; CLI values override file values key by key.
//! [`Partial::resolve`] then folds defaults in and checks every cross-field
//! invariant, yielding the immutable [`JobConfig`] a run is driven by.

use std::fmt;
use std::num::{NonZeroU16, NonZeroU32, NonZeroUsize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use byte_unit::Byte;
use serde::Deserialize;

use bytepump_payload::{
    dict, encoding::Encoding, Config as PayloadConfig, Newline, NewlineScope, NewlineStyle,
    TextOptions,
};

use crate::integrity::HashAlgo;

const DEFAULT_CHUNK: usize = 256 * 1024;
const DEFAULT_FSYNC_INTERVAL: u64 = 8 * 1024 * 1024;
const DEFAULT_RAM_MAX: u64 = 256 * 1024 * 1024;
const DEFAULT_IO_RETRIES: u32 = 2;
const DEFAULT_ERROR_BUDGET: u64 = 16;
const DEFAULT_PROGRESS_SECS: u64 = 2;
const DEFAULT_FANOUT: u16 = 4;

/// Configuration errors. All are raised before any file is opened.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The config file could not be read.
    #[error("could not read config file {}: {source}", .path.display())]
    Read {
        /// The offending path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The config file could not be parsed.
    #[error("could not parse config file {}: {message}", .path.display())]
    Parse {
        /// The offending path.
        path: PathBuf,
        /// Parser diagnostic.
        message: String,
    },
    /// Unrecognized config file extension.
    #[error("config file {} must end in .json, .yaml, .yml or .toml", .0.display())]
    Extension(PathBuf),
    /// Word mode without a word.
    #[error("word mode needs --word")]
    MissingWord,
    /// Dictionary-driven mode without dictionary files.
    #[error("{0} mode needs --dict or --dict-list")]
    MissingDict(PumpMode),
    /// No times, size or max-bytes bound at all.
    #[error("no stop bound configured: set --times, --size or --max-bytes")]
    NoStopBound,
    /// Contradictory count bounds.
    #[error("--times and --times-min/--times-max are mutually exclusive")]
    ConflictingTimes,
    /// Count and size bounds together.
    #[error("--times and --size are mutually exclusive")]
    ConflictingBounds,
    /// An inverted times range.
    #[error("--times-min {min} exceeds --times-max {max}")]
    InvertedRange {
        /// Range minimum.
        min: u64,
        /// Range maximum.
        max: u64,
    },
    /// max-bytes must dominate every other ceiling.
    #[error("--max-bytes {max_bytes} is below --size {size}")]
    CeilingBelowSize {
        /// Configured max-bytes.
        max_bytes: u64,
        /// Configured size.
        size: u64,
    },
    /// The RAM buffer cannot be combined with worker fan-out.
    #[error("--ram-buffer forces single concurrency; drop --concurrency/--workers/--generators")]
    BufferNotSingle,
    /// Gzip cannot be combined with worker fan-out.
    #[error("--gzip forces single concurrency; drop --concurrency/--workers/--generators")]
    GzipNotSingle,
    /// Sparse holes cannot appear inside a gzip container.
    #[error("--sparse cannot be combined with --gzip")]
    SparseGzip,
    /// Verification is undefined for compressed output.
    #[error("--verify cannot check compressed output")]
    VerifyCompressed,
    /// Verification needs a digest to compare.
    #[error("--verify needs --hash")]
    VerifyNeedsHash,
    /// Seeking options contradict each other.
    #[error("--offset and --resume are mutually exclusive")]
    OffsetAndResume,
    /// A value was out of its domain.
    #[error("{0}")]
    Invalid(String),
}

/// Write disposition for the target file.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Keep existing content, write at EOF.
    Append,
    /// Discard existing content.
    Truncate,
}

/// Preset pairing of disposition and default pump mode.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    /// Truncate; defaults to text tokens.
    NormalWrite,
    /// Append; defaults to text tokens.
    NormalAppend,
    /// Truncate; defaults to random binary.
    BinaryWrite,
    /// Append; defaults to random binary.
    BinaryAppend,
}

impl WriteMode {
    fn disposition(self) -> Disposition {
        match self {
            Self::NormalWrite | Self::BinaryWrite => Disposition::Truncate,
            Self::NormalAppend | Self::BinaryAppend => Disposition::Append,
        }
    }

    fn default_pump(self, has_dict: bool) -> PumpMode {
        match self {
            Self::NormalWrite | Self::NormalAppend => {
                if has_dict {
                    PumpMode::Dict
                } else {
                    PumpMode::Word
                }
            }
            Self::BinaryWrite | Self::BinaryAppend => PumpMode::Randbin,
        }
    }
}

impl FromStr for WriteMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "normal-write" => Ok(Self::NormalWrite),
            "normal-append" => Ok(Self::NormalAppend),
            "binary-write" => Ok(Self::BinaryWrite),
            "binary-append" => Ok(Self::BinaryAppend),
            other => Err(format!("unknown write mode: {other}")),
        }
    }
}

/// Which generator produces bytes.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PumpMode {
    /// One fixed token.
    Word,
    /// Dictionary draws.
    Dict,
    /// N-gram chain over a dictionary.
    Markov,
    /// 0x00 fill.
    Bin0,
    /// 0xFF fill.
    Bin1,
    /// Random bytes.
    Randbin,
    /// Random printable text.
    Randutf8,
    /// Random lowercase hex.
    Randhex,
    /// One of the random trio per chunk.
    Random,
}

impl FromStr for PumpMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "word" => Ok(Self::Word),
            "dict" => Ok(Self::Dict),
            "markov" => Ok(Self::Markov),
            "bin0" => Ok(Self::Bin0),
            "bin1" => Ok(Self::Bin1),
            "randbin" => Ok(Self::Randbin),
            "randutf8" => Ok(Self::Randutf8),
            "randhex" => Ok(Self::Randhex),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown pump mode: {other}")),
        }
    }
}

impl fmt::Display for PumpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Word => "word",
            Self::Dict => "dict",
            Self::Markov => "markov",
            Self::Bin0 => "bin0",
            Self::Bin1 => "bin1",
            Self::Randbin => "randbin",
            Self::Randutf8 => "randutf8",
            Self::Randhex => "randhex",
            Self::Random => "random",
        };
        f.write_str(name)
    }
}

/// Concurrency flavor as named on the command line.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    /// One task generates and writes.
    Single,
    /// Several writers share the file.
    Write,
    /// Several generators feed one writer.
    Generate,
}

impl FromStr for ConcurrencyMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "single" => Ok(Self::Single),
            "write" => Ok(Self::Write),
            "generate" => Ok(Self::Generate),
            other => Err(format!("unknown concurrency mode: {other}")),
        }
    }
}

/// How the job stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counting {
    /// A fixed token count.
    Times(u64),
    /// A seeded draw from an inclusive range, once per target.
    TimesRange {
        /// Inclusive minimum.
        min: u64,
        /// Inclusive maximum.
        max: u64,
    },
    /// An exact byte size.
    Size(u64),
}

/// The resolved concurrency model, after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyModel {
    /// One streaming writer.
    Single,
    /// Buffer in RAM, dump once.
    RamBuffer,
    /// W writers on one shared handle.
    MultiWriter(u16),
    /// G generators feeding one writer.
    Pipeline(u16),
}

/// One layer of configuration: every knob optional. Config-file keys are the
/// CLI long names with dashes turned into underscores.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Partial {
    pub write_mode: Option<WriteMode>,
    pub pump_mode: Option<PumpMode>,
    pub word: Option<String>,
    pub dict: Option<Vec<PathBuf>>,
    pub dict_list: Option<Vec<PathBuf>>,
    pub dict_order: Option<dict::Order>,
    pub ngram: Option<NonZeroUsize>,
    pub encoding: Option<Encoding>,
    pub newline_mode: Option<NewlineScope>,
    pub newline_style: Option<NewlineStyle>,
    pub times: Option<u64>,
    pub times_min: Option<u64>,
    pub times_max: Option<u64>,
    pub size: Option<Byte>,
    pub max_bytes: Option<Byte>,
    pub chunk: Option<Byte>,
    pub concurrency: Option<ConcurrencyMode>,
    pub workers: Option<NonZeroU16>,
    pub generators: Option<NonZeroU16>,
    pub ram_buffer: Option<bool>,
    pub ram_max: Option<Byte>,
    pub ram_limit: Option<Byte>,
    pub rate: Option<Byte>,
    pub cpu: Option<u8>,
    pub fsync: Option<bool>,
    pub fsync_interval: Option<Byte>,
    pub hash: Option<HashAlgo>,
    pub verify: Option<bool>,
    pub gzip: Option<bool>,
    pub sparse: Option<bool>,
    pub resume: Option<bool>,
    pub offset: Option<Byte>,
    pub truncate_to: Option<Byte>,
    pub fallocate_to: Option<Byte>,
    pub io_retries: Option<u32>,
    pub error_budget: Option<u64>,
    pub seed: Option<u64>,
    pub progress_interval: Option<u64>,
    pub max_times: Option<u64>,
    pub no_disk_guard: Option<bool>,
}

/// The immutable configuration of one run.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Write disposition.
    pub disposition: Disposition,
    /// Token source configuration.
    pub payload: PayloadConfig,
    /// Encoding and newline policy.
    pub text: TextOptions,
    /// Stop bound.
    pub counting: Counting,
    /// The authoritative byte ceiling, when set.
    pub max_bytes: Option<u64>,
    /// Generation and write unit.
    pub chunk: NonZeroUsize,
    /// Backend selector input.
    pub model: ConcurrencyModel,
    /// Rate limit in bytes per second.
    pub rate: Option<NonZeroU32>,
    /// CPU ceiling in percent, 1..=99.
    pub cpu_percent: Option<u8>,
    /// Largest estimate the RAM buffer will take on.
    pub ram_max: u64,
    /// Hard RSS ceiling.
    pub ram_limit: Option<u64>,
    /// Fsync after this many written bytes; `None` disables durability.
    pub fsync_interval: Option<u64>,
    /// Hash accumulation.
    pub hash: Option<HashAlgo>,
    /// Re-read and compare after close.
    pub verify: bool,
    /// Wrap output in a gzip container.
    pub gzip: bool,
    /// Skip writes of all-zero chunks.
    pub sparse: bool,
    /// Continue a previous size-bound run.
    pub resume: bool,
    /// Absolute start offset.
    pub offset: Option<u64>,
    /// Truncate the target to this length before writing.
    pub truncate_to: Option<u64>,
    /// Preallocate the target to this length before writing.
    pub fallocate_to: Option<u64>,
    /// Retries per chunk before giving up.
    pub io_retries: u32,
    /// Failed attempts tolerated across the whole job.
    pub error_budget: u64,
    /// Master seed; `None` draws a fresh one per run.
    pub seed: Option<u64>,
    /// Progress reporting cadence.
    pub progress_interval: Duration,
    /// Abort when the effective times exceed this.
    pub max_times: Option<u64>,
    /// Whether the free-space pre-check runs.
    pub disk_guard: bool,
}

impl Partial {
    /// Overlay `over` onto `self`: set fields of `over` win.
    #[must_use]
    pub fn overlay(self, over: Partial) -> Partial {
        Partial {
            write_mode: over.write_mode.or(self.write_mode),
            pump_mode: over.pump_mode.or(self.pump_mode),
            word: over.word.or(self.word),
            dict: over.dict.or(self.dict),
            dict_list: over.dict_list.or(self.dict_list),
            dict_order: over.dict_order.or(self.dict_order),
            ngram: over.ngram.or(self.ngram),
            encoding: over.encoding.or(self.encoding),
            newline_mode: over.newline_mode.or(self.newline_mode),
            newline_style: over.newline_style.or(self.newline_style),
            times: over.times.or(self.times),
            times_min: over.times_min.or(self.times_min),
            times_max: over.times_max.or(self.times_max),
            size: over.size.or(self.size),
            max_bytes: over.max_bytes.or(self.max_bytes),
            chunk: over.chunk.or(self.chunk),
            concurrency: over.concurrency.or(self.concurrency),
            workers: over.workers.or(self.workers),
            generators: over.generators.or(self.generators),
            ram_buffer: over.ram_buffer.or(self.ram_buffer),
            ram_max: over.ram_max.or(self.ram_max),
            ram_limit: over.ram_limit.or(self.ram_limit),
            rate: over.rate.or(self.rate),
            cpu: over.cpu.or(self.cpu),
            fsync: over.fsync.or(self.fsync),
            fsync_interval: over.fsync_interval.or(self.fsync_interval),
            hash: over.hash.or(self.hash),
            verify: over.verify.or(self.verify),
            gzip: over.gzip.or(self.gzip),
            sparse: over.sparse.or(self.sparse),
            resume: over.resume.or(self.resume),
            offset: over.offset.or(self.offset),
            truncate_to: over.truncate_to.or(self.truncate_to),
            fallocate_to: over.fallocate_to.or(self.fallocate_to),
            io_retries: over.io_retries.or(self.io_retries),
            error_budget: over.error_budget.or(self.error_budget),
            seed: over.seed.or(self.seed),
            progress_interval: over.progress_interval.or(self.progress_interval),
            max_times: over.max_times.or(self.max_times),
            no_disk_guard: over.no_disk_guard.or(self.no_disk_guard),
        }
    }

    /// Fold in defaults and validate every invariant.
    ///
    /// # Errors
    ///
    /// Any violated invariant from the [`Error`] taxonomy.
    pub fn resolve(self) -> Result<JobConfig, Error> {
        let write_mode = self.write_mode.unwrap_or(WriteMode::NormalWrite);
        let has_dict = self.dict.as_ref().is_some_and(|paths| !paths.is_empty())
            || self.dict_list.as_ref().is_some_and(|lists| !lists.is_empty());
        let pump = self
            .pump_mode
            .unwrap_or_else(|| write_mode.default_pump(has_dict));

        let dict_paths = self.dict.unwrap_or_default();
        let dict_lists = self.dict_list.unwrap_or_default();
        let payload = match pump {
            PumpMode::Word => PayloadConfig::Word {
                word: self.word.clone().ok_or(Error::MissingWord)?,
            },
            PumpMode::Dict => {
                if !has_dict {
                    return Err(Error::MissingDict(pump));
                }
                PayloadConfig::Dict {
                    paths: dict_paths,
                    lists: dict_lists,
                    order: self.dict_order.unwrap_or_default(),
                }
            }
            PumpMode::Markov => {
                if !has_dict {
                    return Err(Error::MissingDict(pump));
                }
                PayloadConfig::Markov {
                    paths: dict_paths,
                    lists: dict_lists,
                    ngram: self
                        .ngram
                        .unwrap_or_else(|| NonZeroUsize::new(2).expect("2 is non-zero")),
                }
            }
            PumpMode::Bin0 => PayloadConfig::Bin0,
            PumpMode::Bin1 => PayloadConfig::Bin1,
            PumpMode::Randbin => PayloadConfig::Randbin,
            PumpMode::Randutf8 => PayloadConfig::Randutf8,
            PumpMode::Randhex => PayloadConfig::Randhex,
            PumpMode::Random => PayloadConfig::Random,
        };

        let text = TextOptions {
            encoding: self.encoding,
            newline: Newline {
                scope: self.newline_mode.unwrap_or_default(),
                style: self.newline_style.unwrap_or_default(),
            },
        };

        let size = self.size.map(|byte| to_u64(byte));
        let max_bytes = self.max_bytes.map(|byte| to_u64(byte));
        if self.times.is_some() && (self.times_min.is_some() || self.times_max.is_some()) {
            return Err(Error::ConflictingTimes);
        }
        if size.is_some() && (self.times.is_some() || self.times_min.is_some()) {
            return Err(Error::ConflictingBounds);
        }
        let counting = if let Some(size) = size {
            Counting::Size(size)
        } else if let (Some(min), Some(max)) = (self.times_min, self.times_max) {
            if min > max {
                return Err(Error::InvertedRange { min, max });
            }
            Counting::TimesRange { min, max }
        } else if self.times_min.is_some() || self.times_max.is_some() {
            return Err(Error::Invalid(
                "--times-min and --times-max must be given together".to_string(),
            ));
        } else if let Some(times) = self.times {
            Counting::Times(times)
        } else if let Some(max) = max_bytes {
            // The authoritative ceiling doubles as the stop bound.
            Counting::Size(max)
        } else {
            return Err(Error::NoStopBound);
        };
        if let (Some(max), Counting::Size(size)) = (max_bytes, counting) {
            if max < size {
                return Err(Error::CeilingBelowSize {
                    max_bytes: max,
                    size,
                });
            }
        }

        let ram_buffer = self.ram_buffer.unwrap_or(false);
        let gzip = self.gzip.unwrap_or(false);
        let concurrency = self.concurrency.unwrap_or(ConcurrencyMode::Single);
        let fanned_out = !matches!(concurrency, ConcurrencyMode::Single)
            || self.workers.is_some()
            || self.generators.is_some();
        if ram_buffer && fanned_out {
            return Err(Error::BufferNotSingle);
        }
        if gzip && fanned_out {
            return Err(Error::GzipNotSingle);
        }

        let model = if ram_buffer {
            ConcurrencyModel::RamBuffer
        } else {
            match concurrency {
                ConcurrencyMode::Single => ConcurrencyModel::Single,
                ConcurrencyMode::Write => {
                    match self.workers.map_or(DEFAULT_FANOUT, NonZeroU16::get) {
                        1 => ConcurrencyModel::Single,
                        workers => ConcurrencyModel::MultiWriter(workers),
                    }
                }
                ConcurrencyMode::Generate => {
                    match self.generators.map_or(DEFAULT_FANOUT, NonZeroU16::get) {
                        1 => ConcurrencyModel::Single,
                        generators => ConcurrencyModel::Pipeline(generators),
                    }
                }
            }
        };

        let sparse = self.sparse.unwrap_or(false);
        if sparse && gzip {
            return Err(Error::SparseGzip);
        }
        let verify = self.verify.unwrap_or(false);
        if verify && gzip {
            return Err(Error::VerifyCompressed);
        }
        if verify && self.hash.is_none() {
            return Err(Error::VerifyNeedsHash);
        }
        let resume = self.resume.unwrap_or(false);
        if resume && self.offset.is_some() {
            return Err(Error::OffsetAndResume);
        }
        if resume && write_mode.disposition() == Disposition::Truncate {
            return Err(Error::Invalid(
                "--resume needs an append write mode".to_string(),
            ));
        }

        let rate = match self.rate {
            Some(byte) => Some(
                u32::try_from(to_u64(byte))
                    .ok()
                    .and_then(NonZeroU32::new)
                    .ok_or_else(|| {
                        Error::Invalid(format!(
                            "--rate must be between 1 B/s and {} B/s",
                            u32::MAX
                        ))
                    })?,
            ),
            None => None,
        };
        let cpu_percent = match self.cpu {
            Some(0) | None => None,
            Some(percent) if percent >= 100 => None,
            Some(percent) => Some(percent),
        };

        let fsync = self.fsync.unwrap_or(false);
        let fsync_interval = fsync.then(|| {
            self.fsync_interval
                .map_or(DEFAULT_FSYNC_INTERVAL, |byte| to_u64(byte).max(1))
        });

        let chunk = self
            .chunk
            .map_or(DEFAULT_CHUNK, |byte| usize::try_from(to_u64(byte)).unwrap_or(usize::MAX));
        let chunk = NonZeroUsize::new(chunk)
            .ok_or_else(|| Error::Invalid("--chunk must be at least one byte".to_string()))?;

        Ok(JobConfig {
            disposition: write_mode.disposition(),
            payload,
            text,
            counting,
            max_bytes,
            chunk,
            model,
            rate,
            cpu_percent,
            ram_max: self.ram_max.map_or(DEFAULT_RAM_MAX, to_u64),
            ram_limit: self.ram_limit.map(to_u64),
            fsync_interval,
            hash: self.hash,
            verify,
            gzip,
            sparse,
            resume,
            offset: self.offset.map(to_u64),
            truncate_to: self.truncate_to.map(to_u64),
            fallocate_to: self.fallocate_to.map(to_u64),
            io_retries: self.io_retries.unwrap_or(DEFAULT_IO_RETRIES),
            error_budget: self.error_budget.unwrap_or(DEFAULT_ERROR_BUDGET),
            seed: self.seed,
            progress_interval: Duration::from_secs(
                self.progress_interval.unwrap_or(DEFAULT_PROGRESS_SECS).max(1),
            ),
            max_times: self.max_times,
            disk_guard: !self.no_disk_guard.unwrap_or(false),
        })
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_u64(byte: Byte) -> u64 {
    byte.get_bytes() as u64
}

/// Load one config file, picking the parser by extension.
///
/// # Errors
///
/// Fails when the file cannot be read, the extension is unknown or parsing
/// fails.
pub fn load_file(path: &Path) -> Result<Partial, Error> {
    let contents = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_err = |message: String| Error::Parse {
        path: path.to_path_buf(),
        message,
    };
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&contents).map_err(|err| parse_err(err.to_string())),
        Some("yaml" | "yml") => {
            serde_yaml::from_str(&contents).map_err(|err| parse_err(err.to_string()))
        }
        Some("toml") => toml::from_str(&contents).map_err(|err| parse_err(err.to_string())),
        _ => Err(Error::Extension(path.to_path_buf())),
    }
}

impl JobConfig {
    /// The times value in force for one target, drawing from the configured
    /// range when one is set.
    pub fn effective_times<R: rand::Rng>(&self, rng: &mut R) -> Option<u64> {
        match self.counting {
            Counting::Times(times) => Some(times),
            Counting::TimesRange { min, max } => {
                if min == max {
                    Some(min)
                } else {
                    Some(rng.gen_range(min..=max))
                }
            }
            Counting::Size(_) => None,
        }
    }

    /// The byte ceiling in force: the size bound capped by max-bytes.
    #[must_use]
    pub fn byte_ceiling(&self) -> Option<u64> {
        let size = match self.counting {
            Counting::Size(size) => Some(size),
            _ => None,
        };
        match (size, self.max_bytes) {
            (Some(size), Some(max)) => Some(size.min(max)),
            (Some(size), None) => Some(size),
            (None, max) => max,
        }
    }

    /// Expected bytes for one target, for the disk guard and the RAM-buffer
    /// estimate. `mean_token_len` comes from the payload builder; `None`
    /// means chunk-sized tokens.
    #[must_use]
    pub fn expected_bytes(&self, times: Option<u64>, mean_token_len: Option<NonZeroUsize>) -> u64 {
        let estimate = match (self.counting, times) {
            (Counting::Size(size), _) => size,
            (_, Some(times)) => {
                let unit = mean_token_len.map_or(self.chunk.get() as u64, |len| len.get() as u64);
                times.saturating_mul(unit)
            }
            // A times bound always resolves before estimation.
            (Counting::Times(times), None) | (Counting::TimesRange { max: times, .. }, None) => {
                let unit = mean_token_len.map_or(self.chunk.get() as u64, |len| len.get() as u64);
                times.saturating_mul(unit)
            }
        };
        match self.max_bytes {
            Some(max) => estimate.min(max),
            None => estimate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Partial {
        Partial {
            word: Some("x".to_string()),
            times: Some(1),
            ..Partial::default()
        }
    }

    #[test]
    fn defaults_resolve() {
        let config = minimal().resolve().unwrap();
        assert_eq!(config.disposition, Disposition::Truncate);
        assert_eq!(config.counting, Counting::Times(1));
        assert_eq!(config.model, ConcurrencyModel::Single);
        assert_eq!(config.chunk.get(), DEFAULT_CHUNK);
        assert!(config.disk_guard);
        assert!(config.fsync_interval.is_none());
    }

    #[test]
    fn cli_overrides_file_values() {
        let file = Partial {
            times: Some(10),
            seed: Some(1),
            ..Partial::default()
        };
        let cli = Partial {
            word: Some("x".to_string()),
            times: Some(20),
            ..Partial::default()
        };
        let merged = file.overlay(cli);
        assert_eq!(merged.times, Some(20));
        assert_eq!(merged.seed, Some(1));
    }

    #[test]
    fn missing_stop_bound_is_rejected() {
        let partial = Partial {
            word: Some("x".to_string()),
            ..Partial::default()
        };
        assert!(matches!(partial.resolve(), Err(Error::NoStopBound)));
    }

    #[test]
    fn max_bytes_alone_is_a_stop_bound() {
        let partial = Partial {
            pump_mode: Some(PumpMode::Bin0),
            max_bytes: Some(Byte::from_bytes(4096)),
            ..Partial::default()
        };
        let config = partial.resolve().unwrap();
        assert_eq!(config.counting, Counting::Size(4096));
        assert_eq!(config.byte_ceiling(), Some(4096));
    }

    #[test]
    fn max_bytes_below_size_is_rejected() {
        let partial = Partial {
            pump_mode: Some(PumpMode::Bin0),
            size: Some(Byte::from_bytes(4096)),
            max_bytes: Some(Byte::from_bytes(1024)),
            ..Partial::default()
        };
        assert!(matches!(
            partial.resolve(),
            Err(Error::CeilingBelowSize { .. })
        ));
    }

    #[test]
    fn buffer_with_workers_is_rejected() {
        let partial = Partial {
            ram_buffer: Some(true),
            workers: NonZeroU16::new(4),
            ..minimal()
        };
        assert!(matches!(partial.resolve(), Err(Error::BufferNotSingle)));
    }

    #[test]
    fn gzip_with_write_concurrency_is_rejected() {
        let partial = Partial {
            gzip: Some(true),
            concurrency: Some(ConcurrencyMode::Write),
            ..minimal()
        };
        assert!(matches!(partial.resolve(), Err(Error::GzipNotSingle)));
    }

    #[test]
    fn verify_needs_a_hash() {
        let partial = Partial {
            verify: Some(true),
            ..minimal()
        };
        assert!(matches!(partial.resolve(), Err(Error::VerifyNeedsHash)));
    }

    #[test]
    fn write_concurrency_defaults_its_worker_count() {
        let partial = Partial {
            concurrency: Some(ConcurrencyMode::Write),
            ..minimal()
        };
        let config = partial.resolve().unwrap();
        assert_eq!(config.model, ConcurrencyModel::MultiWriter(DEFAULT_FANOUT));
    }

    #[test]
    fn single_worker_collapses_to_single() {
        let partial = Partial {
            concurrency: Some(ConcurrencyMode::Write),
            workers: NonZeroU16::new(1),
            ..minimal()
        };
        let config = partial.resolve().unwrap();
        assert_eq!(config.model, ConcurrencyModel::Single);
    }

    #[test]
    fn degenerate_times_range_is_the_minimum() {
        let partial = Partial {
            times: None,
            times_min: Some(7),
            times_max: Some(7),
            ..minimal()
        };
        let config = partial.resolve().unwrap();
        let mut rng = rand::rngs::mock::StepRng::new(0, 1);
        assert_eq!(config.effective_times(&mut rng), Some(7));
    }

    #[test]
    fn binary_presets_default_to_randbin() {
        let partial = Partial {
            write_mode: Some(WriteMode::BinaryAppend),
            word: None,
            size: Some(Byte::from_bytes(64)),
            times: None,
            ..Partial::default()
        };
        let config = partial.resolve().unwrap();
        assert!(matches!(config.payload, PayloadConfig::Randbin));
        assert_eq!(config.disposition, Disposition::Append);
    }

    #[test]
    fn config_file_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(
            &path,
            r#"{"word": "ab", "times": 3, "newline_mode": "word", "hash": "sha256"}"#,
        )
        .unwrap();
        let partial = load_file(&path).unwrap();
        assert_eq!(partial.word.as_deref(), Some("ab"));
        assert_eq!(partial.times, Some(3));
        assert_eq!(partial.newline_mode, Some(NewlineScope::Word));
        assert_eq!(partial.hash, Some(HashAlgo::Sha256));
    }

    #[test]
    fn config_file_toml_parses_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.toml");
        std::fs::write(&path, "pump_mode = \"bin0\"\nsize = \"1 KiB\"\n").unwrap();
        let partial = load_file(&path).unwrap();
        let config = partial.resolve().unwrap();
        assert_eq!(config.counting, Counting::Size(1024));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = load_file(Path::new("job.ini")).unwrap_err();
        assert!(matches!(err, Error::Read { .. } | Error::Extension(_)));
    }
}
