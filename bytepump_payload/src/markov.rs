//! N-gram chain fitted over a dictionary corpus.
//!
//! The model maps an (n-1)-token prefix to a weighted successor set and is
//! built once, then shared read-only between writers. Sampling picks a
//! successor by cumulative-weight binary search; successor vectors are kept
//! sorted by weight descending with insertion order breaking ties, so a
//! fixed seed reproduces the same text on every run.

use std::num::NonZeroUsize;
use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;

use crate::{dict::Dictionary, render_token, Chunk, Error, NewlineScope, TextOptions};

#[derive(Debug)]
struct Successors {
    token: Vec<u32>,
    /// Cumulative weights, parallel to `token`.
    cumulative: Vec<u64>,
}

impl Successors {
    fn total(&self) -> u64 {
        *self.cumulative.last().expect("successor sets are non-empty")
    }

    fn pick(&self, roll: u64) -> u32 {
        let slot = self.cumulative.partition_point(|bound| *bound <= roll);
        self.token[slot]
    }
}

/// A fitted chain plus the pre-rendered emission bytes of its vocabulary.
#[derive(Debug)]
pub struct Model {
    /// Prefix length, `ngram - 1`.
    order: usize,
    /// Emission bytes per vocabulary id.
    rendered: Vec<Vec<u8>>,
    /// Separator between emitted tokens; empty when the newline policy
    /// already terminates each token.
    separator: Vec<u8>,
    table: FxHashMap<Box<[u32]>, Successors>,
    /// Observed prefixes in insertion order, for re-anchoring.
    prefixes: Vec<Box<[u32]>>,
    /// The corpus-opening prefix every sampler starts from.
    start: Box<[u32]>,
}

impl Model {
    /// Fit an `ngram` chain over the dictionary.
    ///
    /// # Errors
    ///
    /// Fails when the corpus holds fewer tokens than one n-gram window.
    pub fn build(
        dictionary: &Dictionary,
        ngram: NonZeroUsize,
        text: &TextOptions,
    ) -> Result<Self, Error> {
        let order = ngram.get() - 1;
        let tokens = dictionary.tokens();
        if tokens.len() < ngram.get() {
            return Err(Error::CorpusTooSmall {
                tokens: tokens.len(),
                ngram: ngram.get(),
            });
        }

        // Intern the corpus.
        let mut ids: FxHashMap<&str, u32> = FxHashMap::default();
        let mut vocab: Vec<&str> = Vec::new();
        let sequence: Vec<u32> = tokens
            .iter()
            .map(|token| {
                *ids.entry(token.as_str()).or_insert_with(|| {
                    vocab.push(token.as_str());
                    u32::try_from(vocab.len() - 1).expect("vocabulary fits in u32")
                })
            })
            .collect();

        let mut counts: FxHashMap<Box<[u32]>, Vec<(u32, u64)>> = FxHashMap::default();
        let mut prefixes: Vec<Box<[u32]>> = Vec::new();
        for window in sequence.windows(ngram.get()) {
            let prefix: Box<[u32]> = window[..order].into();
            let successor = window[order];
            let entry = counts.entry(prefix.clone()).or_insert_with(|| {
                prefixes.push(prefix);
                Vec::new()
            });
            match entry.iter_mut().find(|(token, _)| *token == successor) {
                Some((_, weight)) => *weight += 1,
                None => entry.push((successor, 1)),
            }
        }

        let table = counts
            .into_iter()
            .map(|(prefix, mut weighted)| {
                // Weight descending; the sort is stable so equal weights keep
                // insertion order.
                weighted.sort_by(|a, b| b.1.cmp(&a.1));
                let mut cumulative = Vec::with_capacity(weighted.len());
                let mut running = 0u64;
                let mut token = Vec::with_capacity(weighted.len());
                for (successor, weight) in weighted {
                    running += weight;
                    token.push(successor);
                    cumulative.push(running);
                }
                (prefix, Successors { token, cumulative })
            })
            .collect();

        let separator = match text.newline.scope {
            NewlineScope::None => text.encoding.unwrap_or_default().encode(" "),
            NewlineScope::Word | NewlineScope::Char => Vec::new(),
        };
        let rendered = vocab
            .iter()
            .map(|token| render_token(token, text))
            .collect();

        Ok(Self {
            order,
            rendered,
            separator,
            table,
            prefixes,
            start: sequence[..order].into(),
        })
    }

    /// Mean emission length per sampled token, separator included.
    #[must_use]
    pub fn mean_emission_len(&self) -> usize {
        let total: usize = self.rendered.iter().map(Vec::len).sum();
        total.div_ceil(self.rendered.len().max(1)) + self.separator.len()
    }
}

/// A seeded sampling stream over a shared [`Model`].
#[derive(Debug)]
pub(crate) struct Sampler {
    model: Arc<Model>,
    rng: StdRng,
    prefix: Vec<u32>,
    /// Whether anything has been emitted yet; governs the leading separator.
    started: bool,
    /// A sampled token that did not fit the previous chunk.
    pending: Option<u32>,
}

impl Sampler {
    pub(crate) fn new(model: Arc<Model>, seed: u64) -> Self {
        let prefix = model.start.to_vec();
        Self {
            model,
            rng: StdRng::seed_from_u64(seed),
            prefix,
            started: false,
            pending: None,
        }
    }

    fn sample(&mut self) -> u32 {
        let successors = match self.model.table.get(self.prefix.as_slice()) {
            Some(successors) => successors,
            None => {
                // Dead end: re-anchor on a uniformly chosen observed prefix.
                let slot = self.rng.gen_range(0..self.model.prefixes.len());
                self.prefix = self.model.prefixes[slot].to_vec();
                &self.model.table[self.prefix.as_slice()]
            }
        };
        let token = successors.pick(self.rng.gen_range(0..successors.total()));
        if self.model.order > 0 {
            self.prefix.remove(0);
            self.prefix.push(token);
        }
        token
    }

    pub(crate) fn next_chunk(&mut self, max_bytes: NonZeroUsize, max_tokens: Option<u64>) -> Chunk {
        let mut bytes = Vec::new();
        let mut tokens = 0u64;
        loop {
            if max_tokens.is_some_and(|cap| tokens >= cap) {
                break;
            }
            let token = match self.pending.take() {
                Some(token) => token,
                None => self.sample(),
            };
            let emission = &self.model.rendered[token as usize];
            let separator = if self.started {
                self.model.separator.len()
            } else {
                0
            };
            if !bytes.is_empty() && bytes.len() + separator + emission.len() > max_bytes.get() {
                self.pending = Some(token);
                break;
            }
            if self.started {
                bytes.extend_from_slice(&self.model.separator);
            }
            bytes.extend_from_slice(emission);
            self.started = true;
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
    use crate::{Newline, NewlineStyle};

    fn corpus(words: &[&str]) -> Dictionary {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        for word in words {
            writeln!(file, "{word}").unwrap();
        }
        Dictionary::load(&[file.path().to_path_buf()], &[], None).unwrap()
    }

    fn ngram(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn sampling_is_reproducible_for_a_seed() {
        let dictionary = corpus(&["the", "quick", "brown", "fox", "the", "lazy", "dog"]);
        let text = TextOptions::default();
        let model = Arc::new(Model::build(&dictionary, ngram(2), &text).unwrap());

        let mut first = Sampler::new(Arc::clone(&model), 11);
        let mut second = Sampler::new(model, 11);
        for _ in 0..8 {
            let max = NonZeroUsize::new(32).unwrap();
            assert_eq!(first.next_chunk(max, None), second.next_chunk(max, None));
        }
    }

    #[test]
    fn deterministic_corpus_replays_its_only_path() {
        // Every prefix has exactly one successor, so the chain is forced.
        let dictionary = corpus(&["a", "b", "c", "d"]);
        let text = TextOptions {
            newline: Newline {
                scope: NewlineScope::Word,
                style: NewlineStyle::Lf,
            },
            ..TextOptions::default()
        };
        let model = Arc::new(Model::build(&dictionary, ngram(2), &text).unwrap());
        let mut sampler = Sampler::new(model, 0);
        let chunk = sampler.next_chunk(NonZeroUsize::new(6).unwrap(), Some(3));
        // The start prefix is "a"; its forced continuation is b, c, d.
        assert_eq!(chunk.bytes, b"b\nc\nd\n");
        assert_eq!(chunk.tokens, 3);
    }

    #[test]
    fn scope_none_separates_tokens_with_spaces() {
        let dictionary = corpus(&["x", "y", "x", "y"]);
        let model =
            Arc::new(Model::build(&dictionary, ngram(2), &TextOptions::default()).unwrap());
        let mut sampler = Sampler::new(model, 3);
        let chunk = sampler.next_chunk(NonZeroUsize::new(16).unwrap(), Some(4));
        let rendered = String::from_utf8(chunk.bytes).unwrap();
        assert!(!rendered.starts_with(' '));
        assert!(!rendered.contains("  "));
        assert_eq!(rendered.split(' ').count(), 4);
    }

    #[test]
    fn sampled_tokens_come_from_the_corpus() {
        let dictionary = corpus(&["uno", "dos", "tres", "uno", "dos"]);
        let model =
            Arc::new(Model::build(&dictionary, ngram(3), &TextOptions::default()).unwrap());
        let mut sampler = Sampler::new(model, 5);
        for _ in 0..16 {
            let chunk = sampler.next_chunk(NonZeroUsize::new(24).unwrap(), None);
            let rendered = String::from_utf8(chunk.bytes).unwrap();
            for word in rendered.split(' ').filter(|word| !word.is_empty()) {
                assert!(["uno", "dos", "tres"].contains(&word), "alien token {word}");
            }
        }
    }

    #[test]
    fn corpus_shorter_than_the_window_is_rejected() {
        let dictionary = corpus(&["lonely"]);
        let err = Model::build(&dictionary, ngram(2), &TextOptions::default()).unwrap_err();
        assert!(matches!(err, Error::CorpusTooSmall { tokens: 1, ngram: 2 }));
    }

    #[test]
    fn unigram_model_has_an_empty_prefix() {
        let dictionary = corpus(&["p", "q", "p"]);
        let model =
            Arc::new(Model::build(&dictionary, ngram(1), &TextOptions::default()).unwrap());
        let mut sampler = Sampler::new(model, 9);
        let chunk = sampler.next_chunk(NonZeroUsize::new(8).unwrap(), None);
        assert!(!chunk.bytes.is_empty());
    }
}
