//! Byte-family sources: constant fills and the random trio.
//!
//! One emitted chunk counts as one token for all of these, so a count bound
//! on a byte-family job is a chunk count.

use std::num::NonZeroUsize;

use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};

use crate::Chunk;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Printable characters beyond ASCII; keeps the randutf8 output exercising
/// multi-byte UTF-8 sequences.
const EXTENDED: &[char] = &[
    '£', '§', 'µ', 'ß', 'é', 'ñ', 'ø', 'π', 'λ', 'Ω', '→', '✓', '中', '日', '語', '…',
];
const ASCII_PRINTABLE: u32 = 95; // 0x20..=0x7E

#[derive(Debug)]
pub(crate) struct FillSource {
    byte: u8,
}

impl FillSource {
    pub(crate) fn new(byte: u8) -> Self {
        Self { byte }
    }

    pub(crate) fn next_chunk(&mut self, max_bytes: NonZeroUsize) -> Chunk {
        Chunk {
            bytes: vec![self.byte; max_bytes.get()],
            tokens: 1,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RandBin {
    rng: StdRng,
}

impl RandBin {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub(crate) fn next_chunk(&mut self, max_bytes: NonZeroUsize) -> Chunk {
        let mut bytes = vec![0u8; max_bytes.get()];
        self.rng.fill_bytes(&mut bytes);
        Chunk { bytes, tokens: 1 }
    }
}

#[derive(Debug)]
pub(crate) struct RandUtf8 {
    rng: StdRng,
}

impl RandUtf8 {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub(crate) fn next_chunk(&mut self, max_bytes: NonZeroUsize) -> Chunk {
        let max = max_bytes.get();
        let mut bytes = Vec::with_capacity(max);
        let span = ASCII_PRINTABLE + u32::try_from(EXTENDED.len()).expect("small set");
        loop {
            let roll = self.rng.gen_range(0..span);
            let ch = if roll < ASCII_PRINTABLE {
                char::from(0x20 + roll as u8)
            } else {
                EXTENDED[(roll - ASCII_PRINTABLE) as usize]
            };
            if bytes.len() + ch.len_utf8() > max {
                if bytes.is_empty() {
                    // max_bytes below one code point: ASCII always fits.
                    bytes.push(b' ');
                }
                break;
            }
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            if bytes.len() == max {
                break;
            }
        }
        Chunk { bytes, tokens: 1 }
    }
}

#[derive(Debug)]
pub(crate) struct RandHex {
    rng: StdRng,
}

impl RandHex {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub(crate) fn next_chunk(&mut self, max_bytes: NonZeroUsize) -> Chunk {
        // Two hex characters per random byte; an odd request rounds up.
        let raw = max_bytes.get().div_ceil(2);
        let mut source = vec![0u8; raw];
        self.rng.fill_bytes(&mut source);
        let mut bytes = Vec::with_capacity(raw * 2);
        for byte in source {
            bytes.push(HEX[usize::from(byte >> 4)]);
            bytes.push(HEX[usize::from(byte & 0x0F)]);
        }
        Chunk { bytes, tokens: 1 }
    }
}

/// Uniformly one of the random trio, chosen per chunk.
#[derive(Debug)]
pub(crate) struct Mixed {
    rng: StdRng,
    bin: RandBin,
    utf8: RandUtf8,
    hex: RandHex,
}

impl Mixed {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            bin: RandBin::new(seed.wrapping_add(1)),
            utf8: RandUtf8::new(seed.wrapping_add(2)),
            hex: RandHex::new(seed.wrapping_add(3)),
        }
    }

    pub(crate) fn next_chunk(&mut self, max_bytes: NonZeroUsize) -> Chunk {
        match self.rng.gen_range(0..3u8) {
            0 => self.bin.next_chunk(max_bytes),
            1 => self.utf8.next_chunk(max_bytes),
            _ => self.hex.next_chunk(max_bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn nz(val: usize) -> NonZeroUsize {
        NonZeroUsize::new(val).unwrap()
    }

    #[test]
    fn fills_are_constant() {
        let mut zeroes = FillSource::new(0x00);
        let chunk = zeroes.next_chunk(nz(1024));
        assert_eq!(chunk.bytes.len(), 1024);
        assert!(chunk.bytes.iter().all(|byte| *byte == 0x00));

        let mut ones = FillSource::new(0xFF);
        assert!(ones
            .next_chunk(nz(16))
            .bytes
            .iter()
            .all(|byte| *byte == 0xFF));
    }

    #[test]
    fn hex_rounds_odd_requests_up() {
        let mut source = RandHex::new(7);
        let chunk = source.next_chunk(nz(5));
        assert_eq!(chunk.bytes.len(), 6);
        assert!(chunk.bytes.iter().all(u8::is_ascii_hexdigit));
        assert!(chunk
            .bytes
            .iter()
            .all(|byte| !byte.is_ascii_uppercase()));
    }

    #[test]
    fn randbin_is_reproducible_for_a_seed() {
        let mut first = RandBin::new(42);
        let mut second = RandBin::new(42);
        assert_eq!(first.next_chunk(nz(256)), second.next_chunk(nz(256)));
    }

    proptest! {
        #[test]
        fn randutf8_is_valid_printable_utf8(seed: u64, max in 1usize..512) {
            let mut source = RandUtf8::new(seed);
            let chunk = source.next_chunk(nz(max));
            prop_assert!(chunk.bytes.len() <= max);
            prop_assert!(!chunk.bytes.is_empty());
            let text = std::str::from_utf8(&chunk.bytes).unwrap();
            prop_assert!(text.chars().all(|ch| !ch.is_control()));
        }

        #[test]
        fn mixed_chunks_stay_within_rounding(seed: u64, max in 2usize..512) {
            let mut source = Mixed::new(seed);
            let chunk = source.next_chunk(nz(max));
            // Only the hex source may round up, by at most one byte.
            prop_assert!(chunk.bytes.len() <= max + 1);
            prop_assert_eq!(chunk.tokens, 1);
        }
    }
}
