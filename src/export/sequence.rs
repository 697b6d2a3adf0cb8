//! Image sequence input resolution
//!
//! A batch export input is either an explicit `%0Nd` pattern, a single file
//! (video container or image), or a directory of zero-padded numbered
//! frames. Directories are resolved into a pattern path, refusing to guess
//! when more than one sequence could be meant.

use crate::export::types::ExportError;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Image extensions recognized when scanning a directory
pub const SEQUENCE_EXTENSIONS: &[&str] = &["png", "gif", "jpg", "jpeg", "bmp", "tga", "tiff"];

/// Whether a path already contains a frame number pattern (`%03d`, `%3d`).
///
/// A width is required, so a bare `%d` is taken literally.
pub fn has_sequence_pattern(path: &str) -> bool {
    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > i + 1 && j < bytes.len() && bytes[j] == b'd' {
                return true;
            }
        }
        i += 1;
    }
    false
}

/// Build the `%0Nd.ext` pattern for frames stored in `dir`
pub fn sequence_pattern(dir: &Path, digits: usize, extension: &str) -> PathBuf {
    if extension.is_empty() {
        dir.join(format!("%0{digits}d"))
    } else {
        dir.join(format!("%0{digits}d.{extension}"))
    }
}

/// Resolve a batch input path into something the encoder can read
pub fn resolve_input(input: &Path) -> Result<PathBuf, ExportError> {
    if has_sequence_pattern(&input.to_string_lossy()) {
        return Ok(input.to_path_buf());
    }

    if !input.exists() {
        return Err(ExportError::InputNotFound(input.to_path_buf()));
    }

    if input.is_dir() {
        return resolve_directory(input);
    }

    Ok(input.to_path_buf())
}

/// Find the single numbered image sequence inside a directory
pub fn resolve_directory(dir: &Path) -> Result<PathBuf, ExportError> {
    let mut digit_widths = BTreeSet::new();
    let mut extensions = BTreeSet::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some((stem, ext)) = numbered_frame(name) {
            digit_widths.insert(stem.len());
            extensions.insert(ext.to_string());
        }
    }

    if digit_widths.is_empty() {
        return Err(ExportError::NoSequenceFound(dir.to_path_buf()));
    }
    if extensions.len() > 1 {
        return Err(ExportError::AmbiguousSequence {
            dir: dir.to_path_buf(),
            reason: format!(
                "file extensions ({})",
                extensions.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
            ),
        });
    }
    if digit_widths.len() > 1 {
        return Err(ExportError::AmbiguousSequence {
            dir: dir.to_path_buf(),
            reason: format!(
                "digit lengths ({})",
                digit_widths.iter().map(|w| w.to_string()).collect::<Vec<_>>().join(", ")
            ),
        });
    }

    let digits = digit_widths.into_iter().next().unwrap_or_default();
    let extension = extensions.into_iter().next().unwrap_or_default();
    let pattern = sequence_pattern(dir, digits, &extension);

    tracing::debug!("Resolved frame directory {:?} to {:?}", dir, pattern);
    Ok(pattern)
}

/// Split `0001.png` into (`0001`, `png`) if it looks like a sequence frame.
/// The extension keeps its original casing so the pattern matches on disk.
fn numbered_frame(name: &str) -> Option<(&str, &str)> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let known = SEQUENCE_EXTENSIONS
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(ext));
    known.then_some((stem, ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"frame").unwrap();
    }

    #[test]
    fn test_pattern_detection() {
        assert!(has_sequence_pattern("frames/%03d.png"));
        assert!(has_sequence_pattern("%4d.jpg"));
        assert!(!has_sequence_pattern("%d.jpg"));
        assert!(!has_sequence_pattern("frames/%d/%.png"));
        assert!(!has_sequence_pattern("frames/100%.png"));
        assert!(!has_sequence_pattern("frames/%03x.png"));
        assert!(!has_sequence_pattern("clip.mp4"));
    }

    #[test]
    fn test_directory_resolves_to_padded_pattern() {
        let dir = tempdir().unwrap();
        for i in 0..10 {
            touch(dir.path(), &format!("{i:03}.png"));
        }
        touch(dir.path(), "notes.txt");

        let pattern = resolve_input(dir.path()).unwrap();
        assert_eq!(pattern, dir.path().join("%03d.png"));
    }

    #[test]
    fn test_mixed_extensions_are_ambiguous() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "000.png");
        touch(dir.path(), "001.jpg");

        match resolve_input(dir.path()).unwrap_err() {
            ExportError::AmbiguousSequence { reason, .. } => assert!(reason.contains("extensions")),
            other => panic!("expected AmbiguousSequence, got {other:?}"),
        }
    }

    #[test]
    fn test_mixed_digit_widths_are_ambiguous() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "00.png");
        touch(dir.path(), "0001.png");

        match resolve_input(dir.path()).unwrap_err() {
            ExportError::AmbiguousSequence { reason, .. } => assert!(reason.contains("digit")),
            other => panic!("expected AmbiguousSequence, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_directory_has_no_sequence() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "frame-a.png");
        assert!(matches!(
            resolve_input(dir.path()).unwrap_err(),
            ExportError::NoSequenceFound(_)
        ));
    }

    #[test]
    fn test_missing_input_and_explicit_pattern() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            resolve_input(&missing).unwrap_err(),
            ExportError::InputNotFound(_)
        ));

        // Patterns are passed through without touching the disk
        let pattern = missing.join("%04d.png");
        assert_eq!(resolve_input(&pattern).unwrap(), pattern);
    }

    #[test]
    fn test_uppercase_extension_is_kept() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "01.PNG");
        touch(dir.path(), "02.PNG");
        assert_eq!(resolve_input(dir.path()).unwrap(), dir.path().join("%02d.PNG"));
    }
}
