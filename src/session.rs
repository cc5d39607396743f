//! Download sessions: how a resource is split into parts, and how those parts
//! survive between runs.
//!
//! A session is stored as pretty JSON next to the output file
//! (`<output>.partfetch.json`). Parts are written to `<output>.partNN` and
//! concatenated into the output once every non-skipped part is complete.

use std::fs;
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::download::Segment;

/// Suffix appended to the output path to name the session file.
pub const SESSION_SUFFIX: &str = ".partfetch.json";

/// Errors produced by session bookkeeping.
#[derive(Debug, Error)]
pub enum SessionError {
    /// File system failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The session file could not be read or written as JSON.
    #[error("invalid session file {path}: {source}")]
    Json {
        /// The session file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A resource of unknown size cannot be split.
    #[error("cannot split a resource of unknown length into {parts} parts")]
    UnknownLength {
        /// Parts that were requested.
        parts: usize,
    },

    /// Assembly was attempted with a part still missing bytes.
    #[error("part {name} is incomplete ({written} bytes written)")]
    Incomplete {
        /// Part display name.
        name: String,
        /// Bytes the part has.
        written: u64,
    },
}

impl SessionError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// The persisted state of one download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Resource URL.
    pub url: String,
    /// Final output file.
    pub output: PathBuf,
    /// Resource size reported by the server, if any.
    pub content_length: Option<u64>,
    /// Segments in byte order.
    pub parts: Vec<Segment>,
}

impl Session {
    /// Splits a resource into `parts` contiguous segments covering
    /// `[0, content_length - 1]`.
    ///
    /// The last part absorbs the remainder. A resource of unknown size (or
    /// size 0) can only be fetched as a single open-ended part.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownLength`] when `parts > 1` and the size is
    /// unknown.
    pub fn new(
        url: impl Into<String>,
        output: impl Into<PathBuf>,
        content_length: Option<u64>,
        parts: usize,
    ) -> Result<Self, SessionError> {
        let output = output.into();
        let parts = parts.max(1);

        let segments = match content_length.filter(|len| *len > 0) {
            None if parts > 1 => return Err(SessionError::UnknownLength { parts }),
            None => vec![Segment::new(part_name(0), 1, part_path(&output, 0), 0, None)],
            Some(len) => {
                let count = u64::try_from(parts).unwrap_or(u64::MAX).min(len);
                let chunk = len / count;
                (0..count)
                    .map(|i| {
                        let index = usize::try_from(i).unwrap_or(usize::MAX);
                        let start = i * chunk;
                        let stop = if i + 1 == count {
                            len - 1
                        } else {
                            (i + 1) * chunk - 1
                        };
                        Segment::new(
                            part_name(index),
                            index + 1,
                            part_path(&output, index),
                            start,
                            Some(stop),
                        )
                    })
                    .collect()
            }
        };

        Ok(Self {
            url: url.into(),
            output,
            content_length,
            parts: segments,
        })
    }

    /// Applies an attempt budget to every part.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.parts = self
            .parts
            .into_iter()
            .map(|part| part.with_max_attempts(max_attempts))
            .collect();
        self
    }

    /// Path of the session file for `output`.
    #[must_use]
    pub fn path_for(output: &Path) -> PathBuf {
        with_suffix(output, SESSION_SUFFIX)
    }

    /// Path of this session's file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        Self::path_for(&self.output)
    }

    /// Reads a session file and restores the runtime fields of its parts.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Io`] or [`SessionError::Json`].
    #[instrument(fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let file = fs::File::open(path).map_err(|e| SessionError::io(path, e))?;
        let mut session: Self =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| SessionError::Json {
                path: path.to_path_buf(),
                source,
            })?;

        for (index, part) in session.parts.iter_mut().enumerate() {
            part.name = part_name(index);
            part.order = index + 1;
        }
        debug!(parts = session.parts.len(), written = session.written(), "session loaded");
        Ok(session)
    }

    /// Writes the session file, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Io`] or [`SessionError::Json`].
    #[instrument(skip(self), fields(output = %self.output.display()))]
    pub fn save(&self) -> Result<PathBuf, SessionError> {
        let path = self.path();
        let staging = with_suffix(&path, ".tmp");

        let file = fs::File::create(&staging).map_err(|e| SessionError::io(&staging, e))?;
        let mut writer = BufWriter::new(file);
        if let Err(source) = serde_json::to_writer_pretty(&mut writer, self) {
            // leave no half-written session behind
            let _ = fs::remove_file(&staging);
            return Err(SessionError::Json { path, source });
        }
        writer.flush().map_err(|e| SessionError::io(&staging, e))?;
        drop(writer);
        fs::rename(&staging, &path).map_err(|e| SessionError::io(&path, e))?;

        debug!(path = %path.display(), written = self.written(), "session saved");
        Ok(path)
    }

    /// Brings persisted counters in line with the part files on disk.
    ///
    /// A part file shorter than its counter lowers the counter; a longer one
    /// is cut back to the counter so appends continue at the right offset.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Io`] when a part file cannot be inspected or
    /// truncated.
    pub fn reconcile(&mut self) -> Result<(), SessionError> {
        for part in self.parts.iter_mut().filter(|part| !part.skip) {
            let on_disk = match fs::metadata(&part.file_name) {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == ErrorKind::NotFound => 0,
                Err(e) => return Err(SessionError::io(&part.file_name, e)),
            };

            if on_disk < part.written {
                warn!(part = %part.name, recorded = part.written, on_disk, "part file shorter than recorded");
                part.written = on_disk;
            } else if on_disk > part.written {
                debug!(part = %part.name, recorded = part.written, on_disk, "trimming unrecorded bytes");
                fs::OpenOptions::new()
                    .write(true)
                    .open(&part.file_name)
                    .and_then(|file| file.set_len(part.written))
                    .map_err(|e| SessionError::io(&part.file_name, e))?;
            }
        }
        Ok(())
    }

    /// Bytes written across all non-skipped parts.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.parts
            .iter()
            .filter(|part| !part.skip)
            .map(|part| part.written)
            .sum()
    }

    /// True when every non-skipped part is complete.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.parts.iter().any(|part| !part.skip)
            && self.parts.iter().all(|part| part.skip || part.is_done())
    }

    /// Concatenates the non-skipped parts into the output file, then removes
    /// the part files and the session file. Returns the output size.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Incomplete`] without touching anything when a
    /// part is missing bytes, or [`SessionError::Io`] on file system failure.
    #[instrument(skip(self), fields(output = %self.output.display()))]
    pub async fn assemble(&self) -> Result<u64, SessionError> {
        if let Some(part) = self.parts.iter().find(|part| !part.skip && !part.is_done()) {
            return Err(SessionError::Incomplete {
                name: part.name.clone(),
                written: part.written,
            });
        }

        let mut output = tokio::fs::File::create(&self.output)
            .await
            .map_err(|e| SessionError::io(&self.output, e))?;
        let mut total = 0;
        for part in self.parts.iter().filter(|part| !part.skip) {
            let mut input = tokio::fs::File::open(&part.file_name)
                .await
                .map_err(|e| SessionError::io(&part.file_name, e))?;
            total += tokio::io::copy(&mut input, &mut output)
                .await
                .map_err(|e| SessionError::io(&self.output, e))?;
        }
        output
            .flush()
            .await
            .map_err(|e| SessionError::io(&self.output, e))?;

        for path in self
            .parts
            .iter()
            .map(|part| part.file_name.clone())
            .chain(std::iter::once(self.path()))
        {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(SessionError::io(&path, e)),
            }
        }

        info!(bytes = total, "output assembled");
        Ok(total)
    }
}

/// Display name of the part at `index` (0-based): `P01`, `P02`, ...
fn part_name(index: usize) -> String {
    format!("P{:02}", index + 1)
}

/// Part file of the part at `index` (0-based): `<output>.part01`, ...
fn part_path(output: &Path, index: usize) -> PathBuf {
    with_suffix(output, &format!(".part{:02}", index + 1))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== Splitting ====================

    #[test]
    fn test_split_covers_whole_range_without_gaps() {
        let session = Session::new("http://x/f", "/tmp/f.bin", Some(1000), 3).unwrap();
        let parts = &session.parts;
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].start, 0);
        assert_eq!(parts.last().unwrap().stop, Some(999));
        for pair in parts.windows(2) {
            assert_eq!(pair[0].stop.unwrap() + 1, pair[1].start);
        }
        let total: u64 = parts.iter().map(|p| p.total().unwrap()).sum();
        assert_eq!(total, 1000);
    }

    #[test]
    fn test_split_names_orders_and_paths() {
        let session = Session::new("http://x/f", "/tmp/f.bin", Some(100), 2).unwrap();
        assert_eq!(session.parts[0].name, "P01");
        assert_eq!(session.parts[1].name, "P02");
        assert!(session.parts[0].is_primary());
        assert!(!session.parts[1].is_primary());
        assert_eq!(session.parts[1].file_name, PathBuf::from("/tmp/f.bin.part02"));
        assert_eq!(session.path(), PathBuf::from("/tmp/f.bin.partfetch.json"));
    }

    #[test]
    fn test_split_never_creates_empty_parts() {
        let session = Session::new("http://x/f", "/tmp/f.bin", Some(3), 8).unwrap();
        assert_eq!(session.parts.len(), 3);
        assert!(session.parts.iter().all(|p| p.total() == Some(1)));
    }

    #[test]
    fn test_split_unknown_length() {
        let single = Session::new("http://x/f", "/tmp/f.bin", None, 1).unwrap();
        assert_eq!(single.parts.len(), 1);
        assert_eq!(single.parts[0].stop, None);

        let err = Session::new("http://x/f", "/tmp/f.bin", None, 4).unwrap_err();
        assert!(matches!(err, SessionError::UnknownLength { parts: 4 }));
    }

    #[test]
    fn test_with_max_attempts_applies_to_all_parts() {
        let session = Session::new("http://x/f", "/tmp/f.bin", Some(10), 2)
            .unwrap()
            .with_max_attempts(3);
        assert!(session.parts.iter().all(|p| p.max_attempts == 3));
    }

    // ==================== Persistence ====================

    #[test]
    fn test_save_and_load_restores_runtime_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new("http://x/f", dir.path().join("f.bin"), Some(100), 2).unwrap();
        session.parts[1].written = 7;
        session.parts[1].skip = true;

        let path = session.save().unwrap();
        assert_eq!(path, session.path());
        assert!(!with_suffix(&path, ".tmp").exists());

        let loaded = Session::load(&path).unwrap();
        assert_eq!(loaded, session);
        assert_eq!(loaded.parts[1].name, "P02");
        assert_eq!(loaded.parts[1].order, 2);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(Session::load(&path), Err(SessionError::Json { .. })));
    }

    // ==================== Reconcile ====================

    #[test]
    fn test_reconcile_clamps_written_to_file_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new("http://x/f", dir.path().join("f.bin"), Some(100), 2).unwrap();
        fs::write(&session.parts[0].file_name, vec![1_u8; 10]).unwrap();
        session.parts[0].written = 30;
        session.parts[1].written = 5; // file missing

        session.reconcile().unwrap();
        assert_eq!(session.parts[0].written, 10);
        assert_eq!(session.parts[1].written, 0);
    }

    #[test]
    fn test_reconcile_trims_unrecorded_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new("http://x/f", dir.path().join("f.bin"), Some(100), 1).unwrap();
        fs::write(&session.parts[0].file_name, vec![1_u8; 40]).unwrap();
        session.parts[0].written = 25;

        session.reconcile().unwrap();
        assert_eq!(session.parts[0].written, 25);
        assert_eq!(fs::metadata(&session.parts[0].file_name).unwrap().len(), 25);
    }

    // ==================== Assembly ====================

    #[tokio::test]
    async fn test_assemble_concatenates_in_order_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new("http://x/f", dir.path().join("f.bin"), Some(6), 2).unwrap();
        fs::write(&session.parts[0].file_name, b"abc").unwrap();
        fs::write(&session.parts[1].file_name, b"def").unwrap();
        session.parts[0].written = 3;
        session.parts[1].written = 3;
        session.save().unwrap();
        assert!(session.is_complete());

        assert_eq!(session.assemble().await.unwrap(), 6);
        assert_eq!(fs::read(&session.output).unwrap(), b"abcdef");
        assert!(!session.parts[0].file_name.exists());
        assert!(!session.path().exists());
    }

    #[tokio::test]
    async fn test_assemble_skips_skipped_parts() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new("http://x/f", dir.path().join("f.bin"), Some(6), 2).unwrap();
        // primary took over the whole resource
        fs::write(&session.parts[0].file_name, b"abcdef").unwrap();
        session.parts[0].stop = Some(5);
        session.parts[0].written = 6;
        session.parts[1].skip = true;

        assert_eq!(session.assemble().await.unwrap(), 6);
        assert_eq!(fs::read(&session.output).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_assemble_refuses_incomplete_parts() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new("http://x/f", dir.path().join("f.bin"), Some(6), 2).unwrap();
        session.parts[0].written = 3;
        session.parts[1].written = 1;
        assert!(!session.is_complete());

        let err = session.assemble().await.unwrap_err();
        assert!(matches!(err, SessionError::Incomplete { ref name, written: 1 } if name == "P02"));
        assert!(!session.output.exists());
    }
}
