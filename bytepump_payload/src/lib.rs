//! Token sources for bytepump.
//!
//! A token source is a restartable, conceptually infinite byte stream. The
//! writer pulls from it in chunks and stops it by ceasing to call. Restarting
//! a source with the same seed reproduces the same stream byte for byte.
//!
//! Construction is split in two: a [`Builder`] does the expensive one-time
//! work (loading dictionaries, fitting the markov model, pre-rendering token
//! emission bytes) and hands out cheap per-writer [`TokenSource`] instances
//! that share the read-only material.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::fmt;

use serde::Deserialize;

pub mod dict;
pub mod encoding;
pub mod markov;
mod random;

use dict::Dictionary;
use encoding::Encoding;

/// Errors produced when building or driving a token source.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper around [`std::io::Error`].
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    /// A dictionary file did not decode in the declared encoding.
    #[error("could not decode {} as {encoding}", .path.display())]
    Decode {
        /// The offending file.
        path: PathBuf,
        /// The encoding that was attempted.
        encoding: &'static str,
    },
    /// Every configured dictionary file decoded to zero tokens.
    #[error("dictionary is empty")]
    EmptyDictionary,
    /// The dictionary is shorter than one n-gram window.
    #[error("corpus of {tokens} tokens is too small for an {ngram}-gram model")]
    CorpusTooSmall {
        /// Number of tokens in the corpus.
        tokens: usize,
        /// Configured n-gram size.
        ngram: usize,
    },
}

/// Configuration of a token source: which generator produces bytes.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Config {
    /// One fixed token, forever.
    Word {
        /// The token to repeat.
        word: String,
    },
    /// Tokens drawn from a preloaded dictionary.
    Dict {
        /// Dictionary files, one token per line.
        paths: Vec<PathBuf>,
        /// List files naming further dictionary files, one path per line,
        /// relative paths resolved against the list file's directory.
        #[serde(default)]
        lists: Vec<PathBuf>,
        /// The draw order.
        #[serde(default)]
        order: dict::Order,
    },
    /// Tokens sampled from an n-gram chain fitted over a dictionary.
    Markov {
        /// Corpus files, one token per line.
        paths: Vec<PathBuf>,
        /// List files naming further corpus files.
        #[serde(default)]
        lists: Vec<PathBuf>,
        /// Window size of the chain; the prefix is one token shorter.
        #[serde(default = "default_ngram")]
        ngram: NonZeroUsize,
    },
    /// 0x00 fill.
    Bin0,
    /// 0xFF fill.
    Bin1,
    /// Cryptographically strong random bytes.
    Randbin,
    /// Uniform draws from a bounded printable set, UTF-8 encoded.
    Randutf8,
    /// Lowercase hex expansion of random bytes.
    Randhex,
    /// Per chunk, one of randbin / randutf8 / randhex.
    Random,
}

fn default_ngram() -> NonZeroUsize {
    NonZeroUsize::new(2).expect("2 is non-zero")
}

/// Where the configured newline is applied.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NewlineScope {
    /// Tokens are emitted back to back.
    #[default]
    None,
    /// One newline after every token.
    Word,
    /// One newline after every character of every token.
    Char,
}

/// Which newline sequence is emitted.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NewlineStyle {
    /// `\n`
    #[default]
    Lf,
    /// `\r`
    Cr,
    /// `\r\n`
    Crlf,
}

impl NewlineStyle {
    /// The newline as text, before output encoding.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lf => "\n",
            Self::Cr => "\r",
            Self::Crlf => "\r\n",
        }
    }
}

impl FromStr for NewlineScope {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "none" => Ok(Self::None),
            "word" => Ok(Self::Word),
            "char" => Ok(Self::Char),
            other => Err(format!("unknown newline scope: {other}")),
        }
    }
}

impl FromStr for NewlineStyle {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "lf" => Ok(Self::Lf),
            "cr" => Ok(Self::Cr),
            "crlf" => Ok(Self::Crlf),
            other => Err(format!("unknown newline style: {other}")),
        }
    }
}

impl fmt::Display for NewlineScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Word => "word",
            Self::Char => "char",
        };
        f.write_str(name)
    }
}

impl fmt::Display for NewlineStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lf => "lf",
            Self::Cr => "cr",
            Self::Crlf => "crlf",
        };
        f.write_str(name)
    }
}

/// Newline policy applied to text tokens.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct Newline {
    /// Where the newline is applied.
    #[serde(default)]
    pub scope: NewlineScope,
    /// Which newline sequence is used.
    #[serde(default)]
    pub style: NewlineStyle,
}

/// Text handling shared by the word, dict and markov sources.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextOptions {
    /// Output and dictionary encoding. `None` means UTF-8 on output and
    /// auto-detection (UTF-8, falling back to Latin-1) for dictionaries.
    #[serde(default)]
    pub encoding: Option<Encoding>,
    /// Newline policy.
    #[serde(default)]
    pub newline: Newline,
}

impl TextOptions {
    fn output_encoding(&self) -> Encoding {
        self.encoding.unwrap_or_default()
    }
}

/// Render one token into its emission bytes under the newline policy and
/// output encoding.
fn render_token(token: &str, text: &TextOptions) -> Vec<u8> {
    let encoding = text.output_encoding();
    match text.newline.scope {
        NewlineScope::None => encoding.encode(token),
        NewlineScope::Word => {
            let mut composed = String::with_capacity(token.len() + 2);
            composed.push_str(token);
            composed.push_str(text.newline.style.as_str());
            encoding.encode(&composed)
        }
        NewlineScope::Char => {
            let newline = text.newline.style.as_str();
            let mut composed = String::with_capacity(token.len() * 2);
            for ch in token.chars() {
                composed.push(ch);
                composed.push_str(newline);
            }
            encoding.encode(&composed)
        }
    }
}

/// One pull from a [`TokenSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// The generated bytes.
    pub bytes: Vec<u8>,
    /// How many tokens the bytes carry. Byte-family sources count the whole
    /// chunk as one token.
    pub tokens: u64,
}

/// One-time construction of the shared, read-only token material.
#[derive(Debug)]
pub struct Builder {
    inner: BuilderInner,
}

#[derive(Debug)]
enum BuilderInner {
    Word {
        unit: Arc<Vec<u8>>,
    },
    Dict {
        rendered: Arc<Vec<Vec<u8>>>,
        order: dict::Order,
        /// Traversal for the non-random orders, indices into `rendered`.
        cycle: Option<Arc<Vec<u32>>>,
    },
    Markov {
        model: Arc<markov::Model>,
    },
    Fill(u8),
    Randbin,
    Randutf8,
    Randhex,
    Random,
}

impl Builder {
    /// Load dictionaries, fit models and pre-render token bytes for `config`.
    ///
    /// # Errors
    ///
    /// Fails when a dictionary file cannot be read or decoded, decodes to
    /// zero tokens, or is too small for the configured n-gram window.
    pub fn new(config: &Config, text: &TextOptions) -> Result<Self, Error> {
        let inner = match config {
            Config::Word { word } => BuilderInner::Word {
                unit: Arc::new(render_token(word, text)),
            },
            Config::Dict {
                paths,
                lists,
                order,
            } => {
                let dictionary = Dictionary::load(paths, lists, text.encoding)?;
                let rendered: Vec<Vec<u8>> = dictionary
                    .tokens()
                    .iter()
                    .map(|token| render_token(token, text))
                    .collect();
                let cycle = order.cycle(dictionary.tokens()).map(Arc::new);
                BuilderInner::Dict {
                    rendered: Arc::new(rendered),
                    order: *order,
                    cycle,
                }
            }
            Config::Markov {
                paths,
                lists,
                ngram,
            } => {
                let dictionary = Dictionary::load(paths, lists, text.encoding)?;
                let model = markov::Model::build(&dictionary, *ngram, text)?;
                BuilderInner::Markov {
                    model: Arc::new(model),
                }
            }
            Config::Bin0 => BuilderInner::Fill(0x00),
            Config::Bin1 => BuilderInner::Fill(0xFF),
            Config::Randbin => BuilderInner::Randbin,
            Config::Randutf8 => BuilderInner::Randutf8,
            Config::Randhex => BuilderInner::Randhex,
            Config::Random => BuilderInner::Random,
        };
        Ok(Self { inner })
    }

    /// A fresh [`TokenSource`] over the shared material, seeded with `seed`.
    #[must_use]
    pub fn source(&self, seed: u64) -> TokenSource {
        let inner = match &self.inner {
            BuilderInner::Word { unit } => SourceInner::Word(WordSource {
                unit: Arc::clone(unit),
            }),
            BuilderInner::Dict {
                rendered,
                order,
                cycle,
            } => SourceInner::Dict(dict::DictSource::new(
                Arc::clone(rendered),
                *order,
                cycle.clone(),
                seed,
            )),
            BuilderInner::Markov { model } => {
                SourceInner::Markov(markov::Sampler::new(Arc::clone(model), seed))
            }
            BuilderInner::Fill(byte) => SourceInner::Fill(random::FillSource::new(*byte)),
            BuilderInner::Randbin => SourceInner::Randbin(random::RandBin::new(seed)),
            BuilderInner::Randutf8 => SourceInner::Randutf8(random::RandUtf8::new(seed)),
            BuilderInner::Randhex => SourceInner::Randhex(random::RandHex::new(seed)),
            BuilderInner::Random => SourceInner::Random(random::Mixed::new(seed)),
        };
        TokenSource { inner }
    }

    /// Mean emission length of one token in bytes. `None` for the
    /// byte-family sources, whose tokens are chunk-sized.
    #[must_use]
    pub fn mean_token_len(&self) -> Option<NonZeroUsize> {
        let len = match &self.inner {
            BuilderInner::Word { unit } => unit.len(),
            BuilderInner::Dict { rendered, .. } => {
                let total: usize = rendered.iter().map(Vec::len).sum();
                total.div_ceil(rendered.len().max(1))
            }
            BuilderInner::Markov { model } => model.mean_emission_len(),
            _ => return None,
        };
        NonZeroUsize::new(len.max(1))
    }
}

/// A restartable infinite byte stream.
#[derive(Debug)]
pub struct TokenSource {
    inner: SourceInner,
}

#[derive(Debug)]
enum SourceInner {
    Word(WordSource),
    Dict(dict::DictSource),
    Markov(markov::Sampler),
    Fill(random::FillSource),
    Randbin(random::RandBin),
    Randutf8(random::RandUtf8),
    Randhex(random::RandHex),
    Random(random::Mixed),
}

impl TokenSource {
    /// Produce the next chunk: at most `max_bytes` bytes and, when given, at
    /// most `max_tokens` tokens.
    ///
    /// A single token is never split; a token longer than `max_bytes` is
    /// emitted alone and the chunk exceeds the byte bound. The randhex source
    /// rounds an odd byte bound up to the next hex pair. Chunks are never
    /// empty.
    ///
    /// # Panics
    ///
    /// Panics if `max_tokens` is `Some(0)`; stop conditions belong to the
    /// caller.
    #[must_use]
    pub fn next_chunk(&mut self, max_bytes: NonZeroUsize, max_tokens: Option<u64>) -> Chunk {
        if let Some(cap) = max_tokens {
            assert!(cap > 0, "token budget must be positive");
        }
        match &mut self.inner {
            SourceInner::Word(source) => source.next_chunk(max_bytes, max_tokens),
            SourceInner::Dict(source) => source.next_chunk(max_bytes, max_tokens),
            SourceInner::Markov(source) => source.next_chunk(max_bytes, max_tokens),
            SourceInner::Fill(source) => source.next_chunk(max_bytes),
            SourceInner::Randbin(source) => source.next_chunk(max_bytes),
            SourceInner::Randutf8(source) => source.next_chunk(max_bytes),
            SourceInner::Randhex(source) => source.next_chunk(max_bytes),
            SourceInner::Random(source) => source.next_chunk(max_bytes),
        }
    }
}

#[derive(Debug)]
struct WordSource {
    unit: Arc<Vec<u8>>,
}

impl WordSource {
    fn next_chunk(&mut self, max_bytes: NonZeroUsize, max_tokens: Option<u64>) -> Chunk {
        let unit = self.unit.as_slice();
        let fit = (max_bytes.get() / unit.len().max(1)).max(1);
        let count = match max_tokens {
            Some(cap) => fit.min(usize::try_from(cap).unwrap_or(usize::MAX)),
            None => fit,
        };
        let mut bytes = Vec::with_capacity(unit.len() * count);
        for _ in 0..count {
            bytes.extend_from_slice(unit);
        }
        Chunk {
            bytes,
            tokens: count as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nz(val: usize) -> NonZeroUsize {
        NonZeroUsize::new(val).unwrap()
    }

    fn word_config(word: &str) -> Config {
        Config::Word {
            word: word.to_string(),
        }
    }

    #[test]
    fn fixed_word_repeats_exactly() {
        let text = TextOptions::default();
        let builder = Builder::new(&word_config("AB"), &text).unwrap();
        let mut source = builder.source(1);
        let chunk = source.next_chunk(nz(7), None);
        // Three whole tokens fit into seven bytes.
        assert_eq!(chunk.bytes, b"ABABAB");
        assert_eq!(chunk.tokens, 3);
    }

    #[test]
    fn fixed_word_honors_token_budget() {
        let text = TextOptions {
            newline: Newline {
                scope: NewlineScope::Word,
                style: NewlineStyle::Lf,
            },
            ..TextOptions::default()
        };
        let builder = Builder::new(&word_config("AB"), &text).unwrap();
        let mut source = builder.source(1);
        let chunk = source.next_chunk(nz(1024), Some(5));
        assert_eq!(chunk.bytes, b"AB\nAB\nAB\nAB\nAB\n");
        assert_eq!(chunk.tokens, 5);
    }

    #[test]
    fn char_scope_breaks_every_character() {
        let text = TextOptions {
            newline: Newline {
                scope: NewlineScope::Char,
                style: NewlineStyle::Crlf,
            },
            ..TextOptions::default()
        };
        let builder = Builder::new(&word_config("ab"), &text).unwrap();
        let mut source = builder.source(1);
        let chunk = source.next_chunk(nz(8), Some(1));
        assert_eq!(chunk.bytes, b"a\r\nb\r\n");
    }

    #[test]
    fn oversized_token_is_emitted_alone() {
        let text = TextOptions::default();
        let builder = Builder::new(&word_config("0123456789"), &text).unwrap();
        let mut source = builder.source(1);
        let chunk = source.next_chunk(nz(4), None);
        assert_eq!(chunk.bytes.len(), 10);
        assert_eq!(chunk.tokens, 1);
    }

    #[test]
    fn mean_token_len_tracks_newline_overhead() {
        let text = TextOptions {
            newline: Newline {
                scope: NewlineScope::Word,
                style: NewlineStyle::Lf,
            },
            ..TextOptions::default()
        };
        let builder = Builder::new(&word_config("AB"), &text).unwrap();
        assert_eq!(builder.mean_token_len(), NonZeroUsize::new(3));
    }
}
