//! Target enumeration: one positional path, `-` for standard output, a
//! filelist, or a numbered fan-out under a directory.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// The standard output sentinel.
pub const STDOUT: &str = "-";

/// Errors produced while enumerating targets.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper around [`std::io::Error`].
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    /// The filelist could not be decoded.
    #[error("filelist {} is not UTF-8", .0.display())]
    FilelistEncoding(PathBuf),
}

/// One destination of bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A regular file.
    File(PathBuf),
    /// The process standard output.
    Stdout,
}

impl Target {
    /// The path when the target is a file.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Stdout => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Stdout => f.write_str("stdout"),
        }
    }
}

/// Resolve the configured target set, in order: the positional target, then
/// filelist entries, then the directory fan-out.
///
/// # Errors
///
/// Fails when a filelist cannot be read or decoded.
pub fn resolve(
    positional: Option<&str>,
    filelist: Option<&Path>,
    dir: Option<(&Path, u32)>,
    dir_template: &str,
) -> Result<Vec<Target>, Error> {
    let mut targets = Vec::new();
    match positional {
        Some(STDOUT) => targets.push(Target::Stdout),
        Some(path) => targets.push(Target::File(PathBuf::from(path))),
        None => {}
    }
    if let Some(list) = filelist {
        targets.extend(read_filelist(list)?);
    }
    if let Some((root, count)) = dir {
        for index in 0..count {
            targets.push(Target::File(root.join(path_from_template(
                dir_template,
                index,
            ))));
        }
    }
    Ok(targets)
}

/// Read a filelist: one path per line, `#` lines and blanks ignored,
/// relative paths resolved against the list file's directory.
fn read_filelist(list: &Path) -> Result<Vec<Target>, Error> {
    let raw = fs::read(list)?;
    let text = String::from_utf8(raw)
        .map_err(|_| Error::FilelistEncoding(list.to_path_buf()))?;
    let base = list.parent().unwrap_or_else(|| Path::new("."));
    let mut targets = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let path = PathBuf::from(line);
        if path.is_absolute() {
            targets.push(Target::File(path));
        } else {
            targets.push(Target::File(base.join(path)));
        }
    }
    Ok(targets)
}

#[inline]
fn path_from_template(template: &str, index: u32) -> PathBuf {
    let formatted = format!("{index:04}");
    PathBuf::from(template.replace("%NNN%", &formatted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dash_is_stdout() {
        let targets = resolve(Some("-"), None, None, "pump-%NNN%.dat").unwrap();
        assert_eq!(targets, [Target::Stdout]);
    }

    #[test]
    fn filelist_resolves_relative_paths_against_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("targets.txt");
        std::fs::write(&list, "# header\nout/a.bin\n\n/abs/b.bin\n").unwrap();

        let targets = resolve(None, Some(&list), None, "pump-%NNN%.dat").unwrap();
        assert_eq!(
            targets,
            [
                Target::File(dir.path().join("out/a.bin")),
                Target::File(PathBuf::from("/abs/b.bin")),
            ]
        );
    }

    #[test]
    fn directory_fanout_numbers_its_files() {
        let targets =
            resolve(None, None, Some((Path::new("/tmp/load"), 3)), "pump-%NNN%.dat").unwrap();
        assert_eq!(
            targets,
            [
                Target::File(PathBuf::from("/tmp/load/pump-0000.dat")),
                Target::File(PathBuf::from("/tmp/load/pump-0001.dat")),
                Target::File(PathBuf::from("/tmp/load/pump-0002.dat")),
            ]
        );
    }

    #[test]
    fn nothing_configured_resolves_to_nothing() {
        let targets = resolve(None, None, None, "pump-%NNN%.dat").unwrap();
        assert!(targets.is_empty());
    }
}
