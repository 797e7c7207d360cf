//! Hash accumulation over written bytes and the verify-on-close re-read.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use digest::DynDigest;
use serde::Deserialize;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::debug;

/// The supported digest algorithms.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgo {
    /// MD5.
    Md5,
    /// SHA-1.
    Sha1,
    /// SHA-256.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl FromStr for HashAlgo {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(format!("unknown hash algorithm: {other}")),
        }
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        };
        f.write_str(name)
    }
}

/// A streaming hasher over the logical bytes of one target.
pub struct Hasher {
    algo: HashAlgo,
    state: Box<dyn DynDigest + Send>,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher").field("algo", &self.algo).finish()
    }
}

impl Hasher {
    /// A fresh hasher for `algo`.
    #[must_use]
    pub fn new(algo: HashAlgo) -> Self {
        let state: Box<dyn DynDigest + Send> = match algo {
            HashAlgo::Md5 => Box::new(md5::Md5::default()),
            HashAlgo::Sha1 => Box::new(sha1::Sha1::default()),
            HashAlgo::Sha256 => Box::new(sha2::Sha256::default()),
            HashAlgo::Sha512 => Box::new(sha2::Sha512::default()),
        };
        Self { algo, state }
    }

    /// Feed written bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        self.state.update(bytes);
    }

    /// Finalize into a lowercase hex digest.
    #[must_use]
    pub fn finish(mut self) -> String {
        hex_string(&self.state.finalize_reset())
    }

    /// The algorithm in use.
    #[must_use]
    pub fn algo(&self) -> HashAlgo {
        self.algo
    }
}

fn hex_string(bytes: &[u8]) -> String {
    use fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

/// Re-read `path` from `start` and return the hex digest of its content.
///
/// # Errors
///
/// Any I/O failure while reading the file back.
pub async fn digest_file(path: &Path, start: u64, algo: HashAlgo) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }
    let mut hasher = Hasher::new(algo);
    let mut buf = vec![0u8; 1024 * 1024];
    let mut total = 0u64;
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        total += read as u64;
    }
    debug!(path = %path.display(), start, total, %algo, "file re-read for verification");
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_abc_matches_the_known_vector() {
        let mut hasher = Hasher::new(HashAlgo::Sha256);
        hasher.update(b"abc");
        assert_eq!(
            hasher.finish(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn md5_of_empty_matches_the_known_vector() {
        let hasher = Hasher::new(HashAlgo::Md5);
        assert_eq!(hasher.finish(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn incremental_updates_match_one_shot() {
        let mut split = Hasher::new(HashAlgo::Sha512);
        split.update(b"hello ");
        split.update(b"world");
        let mut whole = Hasher::new(HashAlgo::Sha512);
        whole.update(b"hello world");
        assert_eq!(split.finish(), whole.finish());
    }

    #[tokio::test]
    async fn digest_file_honors_the_start_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"skipabc").unwrap();

        let from_offset = digest_file(&path, 4, HashAlgo::Sha256).await.unwrap();
        let mut direct = Hasher::new(HashAlgo::Sha256);
        direct.update(b"abc");
        assert_eq!(from_offset, direct.finish());
    }
}
