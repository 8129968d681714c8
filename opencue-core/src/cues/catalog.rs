//! Cue-file catalogue: directory scan, metadata index, memoised loads.
//!
//! The catalogue owns the only persisted state in the system. Parsed files
//! are cached as `Arc<CueFile>` and shared immutably across sessions; the
//! cache is append-only during normal operation. A corrupt file is excluded
//! from the index with a warning and never fails the scan.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{CueFile, CUE_FILE_EXT};
use crate::error::{OpenCueError, Result};

/// Index record for one cue file, cheap enough to list and search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CueFileInfo {
    pub path: String,
    pub title: String,
    pub duration_ms: i64,
    pub cue_count: usize,
    pub has_fingerprints: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imdb_id: Option<String>,
}

/// Manages `.opencue` loading and lookup under one catalogue directory.
pub struct CatalogManager {
    dir: PathBuf,
    index: Mutex<HashMap<String, CueFileInfo>>,
    cache: Mutex<HashMap<String, Arc<CueFile>>>,
}

impl CatalogManager {
    /// Open (and create if needed) the catalogue at `dir`, then scan it.
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let manager = Self {
            dir,
            index: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        };
        manager.refresh_index();
        Ok(manager)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rescan the directory and rebuild the metadata index.
    pub fn refresh_index(&self) {
        let mut index = HashMap::new();

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("catalogue scan failed: {e}");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CUE_FILE_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // Dot-prefixed files are in-progress recording temp saves.
            if stem.starts_with('.') {
                continue;
            }
            match Self::read_info(&path) {
                Ok(info) => {
                    index.insert(stem.to_string(), info);
                }
                Err(e) => {
                    warn!(path = %path.display(), "excluding corrupt cue file: {e}");
                }
            }
        }

        info!(count = index.len(), dir = %self.dir.display(), "cue catalogue indexed");
        *self.index.lock() = index;
    }

    fn read_info(path: &Path) -> Result<CueFileInfo> {
        let file = Self::read_file(path)?;
        Ok(CueFileInfo {
            path: path.display().to_string(),
            title: if file.content.title.is_empty() {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("unknown")
                    .to_string()
            } else {
                file.content.title.clone()
            },
            duration_ms: file.content.duration_ms,
            cue_count: file.cues.len(),
            has_fingerprints: file.has_fingerprints(),
            content_hash: file.content.content_hash.clone(),
            imdb_id: file.content.imdb_id.clone(),
        })
    }

    fn read_file(path: &Path) -> Result<CueFile> {
        let raw = std::fs::read_to_string(path)?;
        let file: CueFile = serde_json::from_str(&raw)
            .map_err(|e| OpenCueError::CueFileCorrupt(format!("{}: {e}", path.display())))?;
        file.validate()?;
        Ok(file)
    }

    /// Load a cue file by identifier.
    ///
    /// The identifier can be a filename stem, an external id (IMDB), or a
    /// full path; the `.opencue` extension is implied.
    pub fn load(&self, identifier: &str) -> Result<Arc<CueFile>> {
        if let Some(cached) = self.cache.lock().get(identifier) {
            return Ok(Arc::clone(cached));
        }

        let path = self.resolve(identifier)?;
        let file = Arc::new(Self::read_file(&path)?);
        info!(identifier, path = %path.display(), "cue file loaded");
        self.cache
            .lock()
            .insert(identifier.to_string(), Arc::clone(&file));
        Ok(file)
    }

    fn resolve(&self, identifier: &str) -> Result<PathBuf> {
        // Direct stem match.
        if let Some(info) = self.index.lock().get(identifier) {
            return Ok(PathBuf::from(&info.path));
        }

        // External id match.
        {
            let index = self.index.lock();
            for info in index.values() {
                if info
                    .imdb_id
                    .as_deref()
                    .map(|id| id.eq_ignore_ascii_case(identifier))
                    .unwrap_or(false)
                {
                    return Ok(PathBuf::from(&info.path));
                }
            }
        }

        // Full path.
        let as_path = Path::new(identifier);
        if as_path.is_file()
            && as_path.extension().and_then(|e| e.to_str()) == Some(CUE_FILE_EXT)
        {
            return Ok(as_path.to_path_buf());
        }

        // Stem with implied extension.
        let with_ext = self.dir.join(format!("{identifier}.{CUE_FILE_EXT}"));
        if with_ext.is_file() {
            return Ok(with_ext);
        }

        Err(OpenCueError::CueFileNotFound(identifier.to_string()))
    }

    /// All indexed files.
    pub fn available(&self) -> Vec<CueFileInfo> {
        let mut list: Vec<CueFileInfo> = self.index.lock().values().cloned().collect();
        list.sort_by(|a, b| a.title.cmp(&b.title));
        list
    }

    /// Case-insensitive substring search over titles and stems.
    pub fn search(&self, query: &str) -> Vec<CueFileInfo> {
        let needle = query.to_lowercase();
        let mut list: Vec<CueFileInfo> = self
            .index
            .lock()
            .iter()
            .filter(|(stem, info)| {
                info.title.to_lowercase().contains(&needle)
                    || stem.to_lowercase().contains(&needle)
            })
            .map(|(_, info)| info.clone())
            .collect();
        list.sort_by(|a, b| a.title.cmp(&b.title));
        list
    }

    /// Persist `file` under `filename` (extension implied) and index it.
    pub fn add(&self, file: &CueFile, filename: &str) -> Result<PathBuf> {
        file.validate()?;

        let filename = if filename.ends_with(&format!(".{CUE_FILE_EXT}")) {
            filename.to_string()
        } else {
            format!("{filename}.{CUE_FILE_EXT}")
        };
        let path = self.dir.join(&filename);

        let json = serde_json::to_string_pretty(file)
            .map_err(|e| OpenCueError::CueFileCorrupt(e.to_string()))?;
        std::fs::write(&path, json)?;

        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if let Ok(info) = Self::read_info(&path) {
                self.index.lock().insert(stem.to_string(), info);
            }
        }

        info!(path = %path.display(), "cue file added to catalogue");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cues::{Cue, CueAction};
    use tempfile::TempDir;

    fn sample_file(title: &str, imdb: Option<&str>) -> CueFile {
        let mut file = CueFile::new(title);
        file.content.duration_ms = 10_000;
        file.content.imdb_id = imdb.map(String::from);
        file.cues = vec![Cue {
            id: "cue_0001".into(),
            start_ms: 3000,
            end_ms: 4000,
            action: CueAction::Mute,
            category: "language.profanity.strong".into(),
            word: Some("shit".into()),
            region: None,
            confidence: 0.9,
            source: None,
        }];
        file
    }

    #[test]
    fn add_then_load_by_stem_and_imdb_and_path() {
        let dir = TempDir::new().unwrap();
        let catalog = CatalogManager::new(dir.path().to_path_buf()).unwrap();

        let path = catalog
            .add(&sample_file("Some Movie", Some("tt1234567")), "some-movie")
            .unwrap();

        let by_stem = catalog.load("some-movie").unwrap();
        assert_eq!(by_stem.content.title, "Some Movie");

        let by_imdb = catalog.load("TT1234567").unwrap();
        assert_eq!(by_imdb.content.title, "Some Movie");

        let by_path = catalog.load(path.to_str().unwrap()).unwrap();
        assert_eq!(by_path.content.title, "Some Movie");
    }

    #[test]
    fn load_memoises_parsed_instances() {
        let dir = TempDir::new().unwrap();
        let catalog = CatalogManager::new(dir.path().to_path_buf()).unwrap();
        catalog
            .add(&sample_file("Cached", None), "cached")
            .unwrap();

        let a = catalog.load("cached").unwrap();
        let b = catalog.load("cached").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn missing_identifier_is_not_found() {
        let dir = TempDir::new().unwrap();
        let catalog = CatalogManager::new(dir.path().to_path_buf()).unwrap();
        assert!(matches!(
            catalog.load("nope"),
            Err(OpenCueError::CueFileNotFound(_))
        ));
    }

    #[test]
    fn corrupt_file_is_excluded_but_scan_continues() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.opencue"), "{ not json").unwrap();

        let catalog = CatalogManager::new(dir.path().to_path_buf()).unwrap();
        catalog.add(&sample_file("Good", None), "good").unwrap();
        catalog.refresh_index();

        let titles: Vec<String> = catalog.available().into_iter().map(|i| i.title).collect();
        assert_eq!(titles, vec!["Good"]);
    }

    #[test]
    fn search_matches_title_and_stem_substrings() {
        let dir = TempDir::new().unwrap();
        let catalog = CatalogManager::new(dir.path().to_path_buf()).unwrap();
        catalog
            .add(&sample_file("The Big Adventure", None), "big-adventure")
            .unwrap();
        catalog
            .add(&sample_file("Quiet Drama", None), "quiet-drama")
            .unwrap();

        assert_eq!(catalog.search("ADVENTURE").len(), 1);
        assert_eq!(catalog.search("quiet-dr").len(), 1);
        assert_eq!(catalog.search("nothing").len(), 0);
    }

    #[test]
    fn temp_recording_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(".partial_recording.tmp.opencue"),
            "{\"version\":\"2.0\",\"content\":{\"title\":\"t\",\"duration_ms\":0}}",
        )
        .unwrap();
        let catalog = CatalogManager::new(dir.path().to_path_buf()).unwrap();
        assert!(catalog.available().is_empty());
    }
}
