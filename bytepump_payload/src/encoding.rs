//! Text encodings for token emission and dictionary decoding.
//!
//! The supported set is deliberately small: UTF-8, Latin-1 and the two
//! UTF-16 byte orders cover what dictionary files in the wild actually use.
//! Latin-1 here is ISO-8859-1 proper, a one-to-one byte/codepoint map, which
//! is what makes it a safe decode fallback.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// A text encoding identifier.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// UTF-8.
    #[default]
    Utf8,
    /// ISO-8859-1.
    Latin1,
    /// UTF-16, little endian.
    Utf16le,
    /// UTF-16, big endian.
    Utf16be,
}

impl Encoding {
    /// Canonical name, used in error messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "utf8",
            Self::Latin1 => "latin1",
            Self::Utf16le => "utf16le",
            Self::Utf16be => "utf16be",
        }
    }

    /// Encode `text` into this encoding. Characters outside Latin-1 are
    /// replaced with `?` when encoding to Latin-1.
    #[must_use]
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::Latin1 => text
                .chars()
                .map(|ch| u8::try_from(u32::from(ch)).unwrap_or(b'?'))
                .collect(),
            Self::Utf16le => text
                .encode_utf16()
                .flat_map(|unit| unit.to_le_bytes())
                .collect(),
            Self::Utf16be => text
                .encode_utf16()
                .flat_map(|unit| unit.to_be_bytes())
                .collect(),
        }
    }

    /// Decode `bytes` from this encoding, `None` when the bytes are not
    /// valid in it.
    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            Self::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_string),
            Self::Latin1 => Some(latin1(bytes)),
            Self::Utf16le => decode_utf16(bytes, u16::from_le_bytes),
            Self::Utf16be => decode_utf16(bytes, u16::from_be_bytes),
        }
    }
}

/// Auto-detecting decode: try UTF-8 first, fall back to Latin-1. The
/// fallback is total, so this never fails.
#[must_use]
pub fn decode_auto(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => latin1(bytes),
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| char::from(*byte)).collect()
}

fn decode_utf16(bytes: &[u8], assemble: fn([u8; 2]) -> u16) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| assemble([pair[0], pair[1]]))
        .collect();
    char::decode_utf16(units.into_iter())
        .collect::<Result<String, _>>()
        .ok()
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Self::Utf8),
            "latin1" | "iso-8859-1" => Ok(Self::Latin1),
            "utf16le" | "utf-16le" => Ok(Self::Utf16le),
            "utf16be" | "utf-16be" => Ok(Self::Utf16be),
            other => Err(format!("unknown encoding: {other}")),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_round_trips_every_byte() {
        let bytes: Vec<u8> = (0..=255).collect();
        let text = Encoding::Latin1.decode(&bytes).unwrap();
        assert_eq!(Encoding::Latin1.encode(&text), bytes);
    }

    #[test]
    fn utf16le_encodes_ascii_with_zero_high_bytes() {
        assert_eq!(Encoding::Utf16le.encode("AB"), vec![0x41, 0, 0x42, 0]);
        assert_eq!(Encoding::Utf16be.encode("A"), vec![0, 0x41]);
    }

    #[test]
    fn utf16_rejects_odd_lengths() {
        assert_eq!(Encoding::Utf16le.decode(&[0x41]), None);
    }

    #[test]
    fn auto_detect_prefers_utf8() {
        assert_eq!(decode_auto("héllo".as_bytes()), "héllo");
        // 0xE9 alone is invalid UTF-8 and decodes as Latin-1 é.
        assert_eq!(decode_auto(&[b'h', 0xE9]), "hé");
    }

    #[test]
    fn latin1_replaces_unmappable_characters() {
        assert_eq!(Encoding::Latin1.encode("aπb"), b"a?b");
    }
}
