//! Scanner for discovering media files in the library roots.
//!
//! Recursively walks each configured root, filters by extension, and feeds
//! `(path, size, mtime)` observations into the store. The scanner is the only
//! component that creates file records; it never mutates an in-flight one.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::safe_replace::backup_path;
use crate::store::{now_ms, ScanOutcome, Store, StoreError};

/// Video file extensions considered by the scanner (case-insensitive).
pub const VIDEO_EXTENSIONS: &[&str] = &[".mkv", ".mp4", ".avi", ".mov", ".m4v", ".ts", ".m2ts"];

/// A candidate media file discovered during a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanCandidate {
    /// Absolute path to the media file.
    pub path: PathBuf,
    /// File size in bytes at discovery time.
    pub size_bytes: u64,
    /// Modification time, unix milliseconds.
    pub mtime: i64,
}

/// Tally of what one scan pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ScanSummary {
    pub added: usize,
    pub updated: usize,
    pub requeued: usize,
    pub unchanged: usize,
}

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// A `<file>.bak` sibling marks `<file>` as an already-processed source
/// backup pair; neither half is enqueued while the pair exists.
pub fn has_backup_sibling(path: &Path) -> bool {
    backup_path(path).exists()
}

/// Scans the given library roots for media candidates.
///
/// - Recursively walks each root
/// - Skips hidden directories (names starting with `.`)
/// - Filters files by video extension (case-insensitive)
/// - Excludes `.bak` files and files with a live `.bak` sibling
pub fn scan_libraries(roots: &[PathBuf]) -> Vec<ScanCandidate> {
    use walkdir::WalkDir;

    let mut candidates = Vec::new();

    for root in roots {
        if !root.exists() {
            warn!(root = %root.display(), "library root does not exist, skipping");
            continue;
        }

        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            // Skip hidden directories (but allow the root itself).
            if entry.file_type().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if name.starts_with('.') && entry.depth() > 0 {
                        return false;
                    }
                }
            }
            true
        });

        for entry in walker.filter_map(|e| e.ok()) {
            let path = entry.path();

            if !entry.file_type().is_file() {
                continue;
            }

            if !is_video_file(path) {
                continue;
            }

            // `film.mkv.bak` itself never qualifies (its "extension" is bak,
            // so the filter above drops it), but a file whose backup pair is
            // still on disk is a finished swap we must not touch again.
            if has_backup_sibling(path) {
                continue;
            }

            if let Ok(metadata) = entry.metadata() {
                let size_bytes = metadata.len();
                let mtime = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);

                candidates.push(ScanCandidate {
                    path: path.to_path_buf(),
                    size_bytes,
                    mtime,
                });
            }
        }
    }

    candidates
}

/// Run one full scan: discover candidates and upsert them into the store.
pub fn run_scan(store: &Store, roots: &[PathBuf]) -> Result<ScanSummary, StoreError> {
    let candidates = scan_libraries(roots);
    let now = now_ms();
    let mut summary = ScanSummary::default();

    for candidate in candidates {
        match store.upsert_scan(&candidate.path, candidate.size_bytes, candidate.mtime, now)? {
            ScanOutcome::Added => summary.added += 1,
            ScanOutcome::Updated => summary.updated += 1,
            ScanOutcome::Requeued => summary.requeued += 1,
            ScanOutcome::Unchanged => summary.unchanged += 1,
        }
    }

    info!(
        added = summary.added,
        updated = summary.updated,
        requeued = summary.requeued,
        unchanged = summary.unchanged,
        "library scan finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    #[test]
    fn test_video_extensions_defined() {
        assert!(VIDEO_EXTENSIONS.contains(&".mkv"));
        assert!(VIDEO_EXTENSIONS.contains(&".mp4"));
        assert!(VIDEO_EXTENSIONS.contains(&".avi"));
        assert!(VIDEO_EXTENSIONS.contains(&".mov"));
        assert!(VIDEO_EXTENSIONS.contains(&".m4v"));
        assert!(VIDEO_EXTENSIONS.contains(&".ts"));
        assert!(VIDEO_EXTENSIONS.contains(&".m2ts"));
        assert_eq!(VIDEO_EXTENSIONS.len(), 7);
    }

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file(Path::new("/media/movie.mkv")));
        assert!(is_video_file(Path::new("/media/movie.MKV"))); // case-insensitive
        assert!(is_video_file(Path::new("/media/movie.Mp4")));
        assert!(is_video_file(Path::new("/media/movie.m2ts")));
        assert!(!is_video_file(Path::new("/media/movie.txt")));
        assert!(!is_video_file(Path::new("/media/movie.mkv.bak")));
        assert!(!is_video_file(Path::new("/media/movie"))); // no extension
    }

    #[test]
    fn test_scan_excludes_backup_pairs() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let swapped = root.join("swapped.mkv");
        File::create(&swapped).unwrap();
        File::create(root.join("swapped.mkv.bak")).unwrap();

        let fresh = root.join("fresh.mkv");
        File::create(&fresh).unwrap();

        let candidates = scan_libraries(&[root.to_path_buf()]);
        let paths: Vec<_> = candidates.iter().map(|c| c.path.clone()).collect();

        assert!(paths.contains(&fresh), "fresh file should be found");
        assert!(
            !paths.contains(&swapped),
            "file with a .bak sibling must not be re-enqueued"
        );
        assert!(
            !paths.iter().any(|p| p.to_string_lossy().ends_with(".bak")),
            ".bak files themselves are never candidates"
        );
    }

    #[test]
    fn test_rescan_unchanged_tree_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();
        fs::write(root.join("a.mkv"), [0u8; 100]).unwrap();
        fs::write(root.join("b.mkv"), [0u8; 200]).unwrap();

        let store = Store::open_in_memory().unwrap();
        let first = run_scan(&store, &[root.clone()]).unwrap();
        assert_eq!(first.added, 2);
        assert_eq!(first.unchanged, 0);

        let second = run_scan(&store, &[root]).unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.requeued, 0);
        assert_eq!(second.unchanged, 2);
    }

    #[test]
    fn test_scan_missing_root_is_tolerated() {
        let candidates = scan_libraries(&[PathBuf::from("/does/not/exist/anywhere")]);
        assert!(candidates.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        // For any directory tree, files under hidden directories are never
        // returned while their visible twins are.
        #[test]
        fn prop_hidden_directory_exclusion(
            visible_dir in "[a-zA-Z0-9]{1,10}",
            hidden_dir in "\\.[a-zA-Z0-9]{1,10}",
            filename in "[a-zA-Z0-9]{1,10}",
        ) {
            let temp_dir = TempDir::new().unwrap();
            let root = temp_dir.path();

            let visible_path = root.join(&visible_dir);
            fs::create_dir_all(&visible_path).unwrap();
            let visible_video = visible_path.join(format!("{}.mkv", filename));
            File::create(&visible_video).unwrap();

            let hidden_path = root.join(&hidden_dir);
            fs::create_dir_all(&hidden_path).unwrap();
            let hidden_video = hidden_path.join(format!("{}.mkv", filename));
            File::create(&hidden_video).unwrap();

            let candidates = scan_libraries(&[root.to_path_buf()]);

            prop_assert!(
                candidates.iter().any(|c| c.path == visible_video),
                "video in visible directory should be found: {:?}",
                visible_video
            );
            prop_assert!(
                !candidates.iter().any(|c| c.path == hidden_video),
                "video in hidden directory should NOT be found: {:?}",
                hidden_video
            );
        }

        // For any file path, the scanner includes it iff its extension is a
        // known video extension, case-insensitively.
        #[test]
        fn prop_video_extension_filtering(
            basename in "[a-zA-Z0-9_-]{1,20}",
            ext in prop_oneof![
                Just("mkv"), Just("MKV"), Just("Mkv"),
                Just("mp4"), Just("MP4"),
                Just("avi"), Just("mov"), Just("m4v"),
                Just("ts"), Just("m2ts"), Just("M2TS"),
                Just("txt"), Just("jpg"), Just("srt"),
                Just("bak"), Just("nfo"), Just("zip"),
            ],
        ) {
            let path = PathBuf::from(format!("/media/{}.{}", basename, ext));
            let expected = matches!(
                ext.to_lowercase().as_str(),
                "mkv" | "mp4" | "avi" | "mov" | "m4v" | "ts" | "m2ts"
            );
            prop_assert_eq!(is_video_file(&path), expected);
        }
    }
}
