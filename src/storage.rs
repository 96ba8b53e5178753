//! Durable run-identifier to directory mapping and path-segment hygiene.
//!
//! Every run gets a directory tree under the configured runs root:
//! `<experiment>/[subdir/]<timestamp>`. The [`RunDirectoryIndex`] records
//! where each run lives in a JSON index file (`_run_paths.json`) written via
//! a temp-file-then-atomic-rename pattern, with an in-memory cache in front.
//! The on-disk index is the durable source of truth and survives process
//! restarts; the cache is reloaded from it at construction.
//!
//! All caller-supplied path segments (experiment name, subdirectory, slot
//! name, mode name, client timestamp) pass through the sanitizers below
//! before they are ever joined into a path, so a derived segment can never
//! escape the intended directory.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::error::{AppResult, BoxError};

#[allow(clippy::expect_used)]
static PATH_SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^0-9A-Za-z_-]+").expect("static regex"));
#[allow(clippy::expect_used)]
static CLIENT_DATETIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^0-9A-Za-zT_-]+").expect("static regex"));
#[allow(clippy::expect_used)]
static UNDERSCORE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"_{2,}").expect("static regex"));
#[allow(clippy::expect_used)]
static HYPHEN_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"-{2,}").expect("static regex"));

/// Sanitized storage naming for one run, computed once at submission from
/// untrusted caller input and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStorageInfo {
    /// Sanitized experiment name (first path segment)
    pub experiment: String,
    /// Optional sanitized grouping subdirectory
    pub subdir: Option<String>,
    /// Sanitized client timestamp used as the run's directory name
    pub timestamp_dir: String,
    /// Timestamp variant used inside filenames (`T` replaced by `_`)
    pub timestamp_name: String,
    /// Prefix composed for every output file the run produces
    pub filename_prefix: String,
}

impl RunStorageInfo {
    /// Build the storage naming from raw request fields.
    ///
    /// `subdir` wins over the legacy `folder_name` alias when both are given.
    pub fn from_request(
        experiment_name: &str,
        subdir: Option<&str>,
        folder_name: Option<&str>,
        client_datetime: &str,
    ) -> AppResult<Self> {
        let subdir_source = match value_or_none(subdir) {
            Some(v) => Some(v),
            None => value_or_none(folder_name),
        };

        let experiment = sanitize_path_segment(experiment_name, "experiment_name")?;
        let subdir = sanitize_optional_segment(subdir_source)?;
        let timestamp_dir = sanitize_client_datetime(client_datetime)?;
        let timestamp_name = timestamp_dir.replace('T', "_");

        let mut filename_parts = vec![experiment.clone()];
        if let Some(sub) = &subdir {
            filename_parts.push(sub.clone());
        }
        filename_parts.push(timestamp_name.clone());

        Ok(Self {
            experiment,
            subdir,
            timestamp_dir,
            timestamp_name: timestamp_name.clone(),
            filename_prefix: filename_parts.join("_"),
        })
    }

    /// Path of the run directory relative to the runs root.
    pub fn relative_dir(&self) -> PathBuf {
        let mut path = PathBuf::from(&self.experiment);
        if let Some(sub) = &self.subdir {
            path.push(sub);
        }
        path.push(&self.timestamp_dir);
        path
    }
}

/// Trimmed value, or `None` when absent or whitespace-only.
pub fn value_or_none(value: Option<&str>) -> Option<&str> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Reduce a raw string to a single safe path component.
///
/// Characters outside `[0-9A-Za-z_-]` become underscores, separator runs are
/// collapsed, and leading/trailing separators are trimmed. Empty input and
/// input that becomes empty after cleaning are rejected.
pub fn sanitize_path_segment(raw: &str, field: &'static str) -> AppResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(BoxError::EmptySegment { field });
    }
    let sanitized = PATH_SEGMENT_RE.replace_all(trimmed, "_");
    let sanitized = UNDERSCORE_RUNS.replace_all(&sanitized, "_");
    let sanitized = HYPHEN_RUNS.replace_all(&sanitized, "-");
    let sanitized = sanitized.trim_matches(|c| c == '_' || c == '-');
    if sanitized.is_empty() {
        return Err(BoxError::InvalidSegment { field });
    }
    Ok(sanitized.to_string())
}

/// Sanitize an optional segment, mapping absent/blank input to `None`.
pub fn sanitize_optional_segment(value: Option<&str>) -> AppResult<Option<String>> {
    match value_or_none(value) {
        None => Ok(None),
        Some(candidate) => sanitize_path_segment(candidate, "subdir").map(Some),
    }
}

/// Sanitize the caller-supplied timestamp used for directory and file names.
///
/// Unlike [`sanitize_path_segment`] this keeps the `T` date/time separator
/// and uses `-` as the replacement character; common timestamp punctuation
/// (`:`, `/`, `\`, `.`, space) is normalized first.
pub fn sanitize_client_datetime(raw: &str) -> AppResult<String> {
    let field = "client_datetime";
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(BoxError::EmptySegment { field });
    }
    let normalized = trimmed
        .replace(':', "-")
        .replace(' ', "_")
        .replace(['/', '\\', '.'], "-");
    let sanitized = CLIENT_DATETIME_RE.replace_all(&normalized, "-");
    let sanitized = HYPHEN_RUNS.replace_all(&sanitized, "-");
    let sanitized = UNDERSCORE_RUNS.replace_all(&sanitized, "_");
    let sanitized = sanitized.trim_matches(|c| c == '_' || c == '-');
    if sanitized.is_empty() {
        return Err(BoxError::InvalidSegment { field });
    }
    Ok(sanitized.to_string())
}

/// Durable run-id to directory mapping.
///
/// The in-memory map is a cache over the JSON index file; mutating
/// operations hold the single mapping-wide lock and write through to disk.
pub struct RunDirectoryIndex {
    root: PathBuf,
    entries: Mutex<HashMap<String, PathBuf>>,
}

impl RunDirectoryIndex {
    /// Open the index over the given runs root, reloading persisted entries
    /// whose directories still exist.
    pub fn new(root: impl Into<PathBuf>) -> AppResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let index = Self {
            root,
            entries: Mutex::new(HashMap::new()),
        };
        let stored = index.load_index();
        {
            let mut entries = index.lock_entries();
            for (run_id, rel) in stored {
                let candidate = index.root.join(rel);
                if candidate.is_dir() {
                    entries.insert(run_id, candidate);
                }
            }
        }
        Ok(index)
    }

    /// Root directory all runs live under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the on-disk index file.
    pub fn index_path(&self) -> PathBuf {
        self.root.join("_run_paths.json")
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, PathBuf>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Persist the mapping between a run id and its output directory.
    pub fn record(&self, run_id: &str, run_dir: &Path) -> AppResult<()> {
        let rel = run_dir
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| run_dir.to_path_buf());
        let rel_str = rel.to_string_lossy().replace('\\', "/");

        let mut entries = self.lock_entries();
        entries.insert(run_id.to_string(), run_dir.to_path_buf());
        let mut data = self.load_index();
        data.insert(run_id.to_string(), rel_str);
        self.write_index(&data)?;
        Ok(())
    }

    /// Remove a run mapping from memory and disk.
    ///
    /// The index file itself is deleted once it holds no entries.
    pub fn forget(&self, run_id: &str) -> AppResult<()> {
        let mut entries = self.lock_entries();
        entries.remove(run_id);
        let mut data = self.load_index();
        if data.remove(run_id).is_some() {
            if data.is_empty() {
                match std::fs::remove_file(self.index_path()) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            } else {
                self.write_index(&data)?;
            }
        }
        Ok(())
    }

    /// Resolve the directory for a run.
    ///
    /// Checks memory first, then the on-disk index, then a same-named
    /// directory directly under the root. Fails with a not-found condition
    /// when no candidate is an existing directory.
    pub fn resolve(&self, run_id: &str) -> AppResult<PathBuf> {
        {
            let entries = self.lock_entries();
            if let Some(candidate) = entries.get(run_id) {
                if candidate.is_dir() {
                    return Ok(candidate.clone());
                }
            }
        }

        let data = self.load_index();
        if let Some(rel) = data.get(run_id) {
            let run_dir = self.root.join(rel);
            if run_dir.is_dir() {
                self.lock_entries()
                    .insert(run_id.to_string(), run_dir.clone());
                return Ok(run_dir);
            }
        }

        let fallback = self.root.join(run_id);
        if fallback.is_dir() {
            self.lock_entries()
                .insert(run_id.to_string(), fallback.clone());
            return Ok(fallback);
        }

        Err(BoxError::RunNotFound(run_id.to_string()))
    }

    fn load_index(&self) -> HashMap<String, String> {
        let raw = match std::fs::read_to_string(self.index_path()) {
            Ok(raw) => raw,
            Err(_) => return HashMap::new(),
        };
        let parsed: Value = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "run index file is not valid JSON, ignoring");
                return HashMap::new();
            }
        };
        match parsed {
            Value::Object(map) => map
                .into_iter()
                .filter_map(|(k, v)| match v {
                    Value::String(rel) => Some((k, rel)),
                    _ => None,
                })
                .collect(),
            _ => HashMap::new(),
        }
    }

    fn write_index(&self, data: &HashMap<String, String>) -> AppResult<()> {
        let path = self.index_path();
        let tmp = path.with_extension("tmp");
        let ordered: std::collections::BTreeMap<_, _> = data.iter().collect();
        let payload = serde_json::to_string_pretty(&ordered)?;
        std::fs::write(&tmp, payload)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_path_segment_basic() {
        assert_eq!(
            sanitize_path_segment("My Experiment #3", "experiment_name").unwrap(),
            "My_Experiment_3"
        );
        assert_eq!(sanitize_path_segment("a--b__c", "x").unwrap(), "a-b_c");
    }

    #[test]
    fn test_sanitize_path_segment_blocks_traversal() {
        assert_eq!(
            sanitize_path_segment("../../etc/passwd", "subdir").unwrap(),
            "etc_passwd"
        );
        assert!(sanitize_path_segment("   ", "subdir").is_err());
        assert!(sanitize_path_segment("///", "subdir").is_err());
    }

    #[test]
    fn test_sanitize_client_datetime_keeps_t() {
        assert_eq!(
            sanitize_client_datetime("2026-08-06T12:30:00").unwrap(),
            "2026-08-06T12-30-00"
        );
        assert_eq!(
            sanitize_client_datetime("2026/08/06 12:30").unwrap(),
            "2026-08-06_12-30"
        );
        assert!(sanitize_client_datetime("  ").is_err());
    }

    #[test]
    fn test_storage_info_prefix_composition() {
        let info =
            RunStorageInfo::from_request("Exp 1", Some("plate A"), None, "2026-08-06T10:00:00")
                .unwrap();
        assert_eq!(info.experiment, "Exp_1");
        assert_eq!(info.subdir.as_deref(), Some("plate_A"));
        assert_eq!(info.timestamp_dir, "2026-08-06T10-00-00");
        assert_eq!(info.filename_prefix, "Exp_1_plate_A_2026-08-06_10-00-00");
        assert_eq!(
            info.relative_dir(),
            PathBuf::from("Exp_1/plate_A/2026-08-06T10-00-00")
        );
    }

    #[test]
    fn test_folder_name_is_subdir_fallback() {
        let info = RunStorageInfo::from_request("e", None, Some("grp"), "20260806T100000").unwrap();
        assert_eq!(info.subdir.as_deref(), Some("grp"));
        let info =
            RunStorageInfo::from_request("e", Some("sub"), Some("grp"), "20260806T100000").unwrap();
        assert_eq!(info.subdir.as_deref(), Some("sub"));
    }

    #[test]
    fn test_record_resolve_forget_round_trip() {
        let tmp = TempDir::new().unwrap();
        let index = RunDirectoryIndex::new(tmp.path()).unwrap();
        let run_dir = tmp.path().join("exp/2026-08-06T10-00-00");
        std::fs::create_dir_all(&run_dir).unwrap();

        index.record("run_a", &run_dir).unwrap();
        assert_eq!(index.resolve("run_a").unwrap(), run_dir);

        index.forget("run_a").unwrap();
        assert!(index.resolve("run_a").is_err());
        assert!(!index.index_path().exists());
    }

    #[test]
    fn test_resolve_survives_process_restart() {
        let tmp = TempDir::new().unwrap();
        let run_dir = tmp.path().join("exp/run1");
        std::fs::create_dir_all(&run_dir).unwrap();
        {
            let index = RunDirectoryIndex::new(tmp.path()).unwrap();
            index.record("run_1", &run_dir).unwrap();
        }
        // a fresh index over the same root reloads the persisted mapping
        let index = RunDirectoryIndex::new(tmp.path()).unwrap();
        assert_eq!(index.resolve("run_1").unwrap(), run_dir);
    }

    #[test]
    fn test_resolve_falls_back_to_named_directory() {
        let tmp = TempDir::new().unwrap();
        let index = RunDirectoryIndex::new(tmp.path()).unwrap();
        std::fs::create_dir_all(tmp.path().join("bare_run")).unwrap();
        assert_eq!(
            index.resolve("bare_run").unwrap(),
            tmp.path().join("bare_run")
        );
        assert!(index.resolve("missing").is_err());
    }
}
