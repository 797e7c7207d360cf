//! Dictionary loading and draw orders.
//!
//! A dictionary is an ordered sequence of tokens, one per line, loaded once
//! and shared read-only between however many writers a job runs. List files
//! name further dictionary files; relative paths inside a list resolve
//! against the list file's own directory.

use std::fmt;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rand::{distributions::Uniform, prelude::Distribution, rngs::StdRng, SeedableRng};
use serde::Deserialize;
use tracing::debug;

use crate::{encoding, Chunk, Encoding, Error};

/// The order tokens are drawn in.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    /// File order, wrapping at the end.
    #[default]
    Sequential,
    /// Loaded-reverse order, wrapping.
    Reverse,
    /// Lexicographic ascending, wrapping.
    Presorted,
    /// Uniform random with replacement, seeded.
    Random,
}

impl Order {
    /// The fixed traversal for this order, `None` for [`Order::Random`].
    pub(crate) fn cycle(self, tokens: &[String]) -> Option<Vec<u32>> {
        let count = u32::try_from(tokens.len()).expect("dictionary fits in u32 indices");
        match self {
            Self::Sequential => Some((0..count).collect()),
            Self::Reverse => Some((0..count).rev().collect()),
            Self::Presorted => {
                let mut indices: Vec<u32> = (0..count).collect();
                indices.sort_by(|a, b| tokens[*a as usize].cmp(&tokens[*b as usize]));
                Some(indices)
            }
            Self::Random => None,
        }
    }
}

impl FromStr for Order {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "sequential" => Ok(Self::Sequential),
            "reverse" => Ok(Self::Reverse),
            "presorted" => Ok(Self::Presorted),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown dictionary order: {other}")),
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sequential => "sequential",
            Self::Reverse => "reverse",
            Self::Presorted => "presorted",
            Self::Random => "random",
        };
        f.write_str(name)
    }
}

/// A fully materialized dictionary.
#[derive(Debug, Clone)]
pub struct Dictionary {
    tokens: Vec<String>,
}

impl Dictionary {
    /// Load and decode `paths` plus every file named by `lists`, in order.
    ///
    /// # Errors
    ///
    /// Fails when a file cannot be read, does not decode in the declared
    /// encoding, or the combined result holds no tokens.
    pub fn load(
        paths: &[PathBuf],
        lists: &[PathBuf],
        declared: Option<Encoding>,
    ) -> Result<Self, Error> {
        let mut all_paths: Vec<PathBuf> = paths.to_vec();
        for list in lists {
            all_paths.extend(expand_list(list)?);
        }

        let mut tokens = Vec::new();
        for path in &all_paths {
            let raw = fs::read(path)?;
            let text = match declared {
                Some(encoding) => encoding.decode(&raw).ok_or_else(|| Error::Decode {
                    path: path.clone(),
                    encoding: encoding.name(),
                })?,
                None => encoding::decode_auto(&raw),
            };
            // `lines` strips the trailing newline, `\r\n` included.
            let before = tokens.len();
            tokens.extend(
                text.lines()
                    .filter(|line| !line.is_empty())
                    .map(str::to_string),
            );
            debug!(
                path = %path.display(),
                tokens = tokens.len() - before,
                "dictionary file loaded"
            );
        }

        if tokens.is_empty() {
            return Err(Error::EmptyDictionary);
        }
        Ok(Self { tokens })
    }

    /// The tokens in load order.
    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Number of tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the dictionary holds no tokens.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Read a list file: one dictionary path per line, `#` lines ignored,
/// relative paths resolved against the list file's directory.
fn expand_list(list: &Path) -> Result<Vec<PathBuf>, Error> {
    let base = list.parent().unwrap_or_else(|| Path::new("."));
    let text = fs::read_to_string(list)?;
    let mut paths = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let member = PathBuf::from(line);
        if member.is_absolute() {
            paths.push(member);
        } else {
            paths.push(base.join(member));
        }
    }
    Ok(paths)
}

/// A per-writer draw stream over a shared rendered dictionary.
#[derive(Debug)]
pub(crate) struct DictSource {
    rendered: Arc<Vec<Vec<u8>>>,
    walk: Walk,
    /// A drawn index that did not fit the previous chunk.
    pending: Option<u32>,
}

#[derive(Debug)]
enum Walk {
    Cycle { order: Arc<Vec<u32>>, next: usize },
    Random { distr: Uniform<u32>, rng: StdRng },
}

impl DictSource {
    pub(crate) fn new(
        rendered: Arc<Vec<Vec<u8>>>,
        order: Order,
        cycle: Option<Arc<Vec<u32>>>,
        seed: u64,
    ) -> Self {
        let walk = match order {
            Order::Random => Walk::Random {
                distr: Uniform::new(0, u32::try_from(rendered.len()).expect("u32 indices")),
                rng: StdRng::seed_from_u64(seed),
            },
            _ => Walk::Cycle {
                order: cycle.expect("non-random orders carry a cycle"),
                next: 0,
            },
        };
        Self {
            rendered,
            walk,
            pending: None,
        }
    }

    fn draw(&mut self) -> u32 {
        match &mut self.walk {
            Walk::Cycle { order, next } => {
                let index = order[*next];
                *next = (*next + 1) % order.len();
                index
            }
            Walk::Random { distr, rng } => distr.sample(rng),
        }
    }

    pub(crate) fn next_chunk(&mut self, max_bytes: NonZeroUsize, max_tokens: Option<u64>) -> Chunk {
        let mut bytes = Vec::new();
        let mut tokens = 0u64;
        loop {
            if max_tokens.is_some_and(|cap| tokens >= cap) {
                break;
            }
            let index = match self.pending.take() {
                Some(index) => index,
                None => self.draw(),
            };
            let emission = &self.rendered[index as usize];
            if !bytes.is_empty() && bytes.len() + emission.len() > max_bytes.get() {
                self.pending = Some(index);
                break;
            }
            bytes.extend_from_slice(emission);
            tokens += 1;
            if bytes.len() >= max_bytes.get() {
                break;
            }
        }
        Chunk { bytes, tokens }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Builder, Config, Newline, NewlineScope, NewlineStyle, TextOptions};
    use std::io::Write;

    fn write_dict(words: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(words.as_bytes()).unwrap();
        file
    }

    fn dict_config(file: &tempfile::NamedTempFile, order: Order) -> Config {
        Config::Dict {
            paths: vec![file.path().to_path_buf()],
            lists: Vec::new(),
            order,
        }
    }

    fn word_newlines() -> TextOptions {
        TextOptions {
            newline: Newline {
                scope: NewlineScope::Word,
                style: NewlineStyle::Lf,
            },
            ..TextOptions::default()
        }
    }

    #[test]
    fn sequential_draw_follows_file_order_and_wraps() {
        let file = write_dict("alpha\nbeta\ngamma\ndelta\n");
        let builder = Builder::new(&dict_config(&file, Order::Sequential), &word_newlines()).unwrap();
        let mut source = builder.source(7);
        let chunk = source.next_chunk(NonZeroUsize::new(4096).unwrap(), Some(6));
        assert_eq!(chunk.bytes, b"alpha\nbeta\ngamma\ndelta\nalpha\nbeta\n");
        assert_eq!(chunk.tokens, 6);
    }

    #[test]
    fn reverse_draw_starts_from_the_last_token() {
        let file = write_dict("alpha\nbeta\ngamma\n");
        let builder = Builder::new(&dict_config(&file, Order::Reverse), &word_newlines()).unwrap();
        let mut source = builder.source(7);
        let chunk = source.next_chunk(NonZeroUsize::new(4096).unwrap(), Some(3));
        assert_eq!(chunk.bytes, b"gamma\nbeta\nalpha\n");
    }

    #[test]
    fn presorted_draw_is_lexicographic() {
        let file = write_dict("pear\napple\nplum\n");
        let builder = Builder::new(&dict_config(&file, Order::Presorted), &word_newlines()).unwrap();
        let mut source = builder.source(7);
        let chunk = source.next_chunk(NonZeroUsize::new(4096).unwrap(), Some(3));
        assert_eq!(chunk.bytes, b"apple\npear\nplum\n");
    }

    #[test]
    fn random_draw_is_reproducible_for_a_seed() {
        let file = write_dict("alpha\nbeta\ngamma\ndelta\n");
        let builder = Builder::new(&dict_config(&file, Order::Random), &word_newlines()).unwrap();
        let first: Vec<Chunk> = {
            let mut source = builder.source(99);
            (0..4)
                .map(|_| source.next_chunk(NonZeroUsize::new(64).unwrap(), None))
                .collect()
        };
        let second: Vec<Chunk> = {
            let mut source = builder.source(99);
            (0..4)
                .map(|_| source.next_chunk(NonZeroUsize::new(64).unwrap(), None))
                .collect()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn token_that_misses_the_bound_carries_into_the_next_chunk() {
        let file = write_dict("aaaa\nbb\n");
        let builder = Builder::new(&dict_config(&file, Order::Sequential), &TextOptions::default())
            .unwrap();
        let mut source = builder.source(0);
        let chunk = source.next_chunk(NonZeroUsize::new(5).unwrap(), None);
        assert_eq!(chunk.bytes, b"aaaa");
        // The drawn-but-unemitted token is not lost.
        let chunk = source.next_chunk(NonZeroUsize::new(5).unwrap(), None);
        assert_eq!(chunk.bytes, b"bb");
    }

    #[test]
    fn list_files_resolve_members_relative_to_the_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.txt"), "uno\n").unwrap();
        std::fs::write(dir.path().join("two.txt"), "dos\n").unwrap();
        let list = dir.path().join("dicts.list");
        std::fs::write(&list, "# comment\none.txt\ntwo.txt\n").unwrap();

        let dictionary = Dictionary::load(&[], &[list], None).unwrap();
        assert_eq!(dictionary.tokens(), ["uno", "dos"]);
    }

    #[test]
    fn empty_dictionary_is_a_construction_error() {
        let file = write_dict("\n\n");
        let err = Dictionary::load(&[file.path().to_path_buf()], &[], None).unwrap_err();
        assert!(matches!(err, Error::EmptyDictionary));
    }

    #[test]
    fn latin1_fallback_applies_per_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[b'n', 0xE9, b'\n']).unwrap();
        let dictionary = Dictionary::load(&[file.path().to_path_buf()], &[], None).unwrap();
        assert_eq!(dictionary.tokens(), ["né"]);
    }
}
