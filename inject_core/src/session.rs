use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

pub const SESSION_FILE: &str = "data.txt";
pub const STRUCTURE_EXTENSION: &str = "nbt";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {path:?} is already held by another connection")]
    Locked { path: PathBuf },
    #[error("session file {path:?} holds '{content}', expected a structure id")]
    Corrupt { path: PathBuf, content: String },
    #[error("session io failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Packet `id` is on disk but the next id could not be recorded.
    #[error("packet {id} was written but {path:?} could not record the next id: {source}")]
    Persist {
        id: u64,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SessionError {
    /// Id of the packet that reached disk despite the error, if any.
    pub fn written_id(&self) -> Option<u64> {
        match self {
            SessionError::Persist { id, .. } => Some(*id),
            _ => None,
        }
    }

    fn io(path: &Path) -> impl FnOnce(io::Error) -> SessionError + '_ {
        move |source| SessionError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Directory holding every packet of one session.
pub fn session_dir(world: &Path, identifier: &str) -> PathBuf {
    world.join("structures").join("inject").join(identifier)
}

/// Next structure id recorded in `dir`, read without taking the lock.
/// Missing or unreadable metadata reads as 0.
pub fn peek_next_id(dir: &Path) -> u64 {
    fs::read_to_string(dir.join(SESSION_FILE))
        .ok()
        .and_then(|content| content.trim().parse().ok())
        .unwrap_or(0)
}

/// Exclusive hold on a session directory.
///
/// `data.txt` carries the next structure id and stays OS-locked for as long
/// as this value lives, so a second process (or a second connection in this
/// process) cannot write packets into the same chain.
#[derive(Debug)]
pub struct Session {
    dir: PathBuf,
    file: File,
    next_id: u64,
}

impl Session {
    pub fn acquire(dir: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(SessionError::io(&dir))?;
        let path = dir.join(SESSION_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(SessionError::io(&path))?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Err(SessionError::Locked { path }),
            Err(TryLockError::Error(source)) => return Err(SessionError::Io { path, source }),
        }

        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(SessionError::io(&path))?;
        let trimmed = content.trim();
        let next_id = if trimmed.is_empty() {
            0
        } else {
            trimmed.parse::<u64>().map_err(|_| SessionError::Corrupt {
                path: path.clone(),
                content: trimmed.to_string(),
            })?
        };
        debug!(
            target: "inject::connection",
            path = %path.display(),
            next_id,
            "session.acquired"
        );
        Ok(Self { dir, file, next_id })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Id the next written packet will carry.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn structure_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id}.{STRUCTURE_EXTENSION}"))
    }

    /// Write packet bytes under the next id, then advance and persist it.
    /// Returns the id written.
    ///
    /// Once the packet file is in place the id advances even if recording it
    /// fails; that case is reported as [`SessionError::Persist`].
    pub fn write_structure(&mut self, bytes: &[u8]) -> Result<u64, SessionError> {
        let id = self.next_id;
        let path = self.structure_path(id);
        let staging = path.with_extension("tmp");
        let staged = fs::write(&staging, bytes)
            .map_err(SessionError::io(&staging))
            .and_then(|()| fs::rename(&staging, &path).map_err(SessionError::io(&path)));
        if let Err(err) = staged {
            discard_staging(&staging);
            return Err(err);
        }

        self.next_id = id + 1;
        let session_file = self.dir.join(SESSION_FILE);
        self.persist(id + 1).map_err(|source| SessionError::Persist {
            id,
            path: session_file,
            source,
        })?;
        Ok(id)
    }

    fn persist(&mut self, next_id: u64) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(next_id.to_string().as_bytes())?;
        self.file.sync_data()
    }

    /// Delete every packet file with an id up to and including `id`.
    /// Returns how many were removed.
    pub fn remove_structures_through(&self, id: u64) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    target: "inject::connection",
                    dir = %self.dir.display(),
                    error = %err,
                    "structure.cleanup_failed"
                );
                return 0;
            }
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(STRUCTURE_EXTENSION) {
                continue;
            }
            let Some(file_id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            else {
                continue;
            };
            if file_id > id {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(
                    target: "inject::connection",
                    path = %path.display(),
                    error = %err,
                    "structure.remove_failed"
                ),
            }
        }
        removed
    }
}

fn discard_staging(staging: &Path) {
    match fs::remove_file(staging) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(
            target: "inject::connection",
            path = %staging.display(),
            error = %err,
            "structure.staging_left"
        ),
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_starts_at_zero() {
        let world = tempfile::tempdir().unwrap();
        let dir = session_dir(world.path(), "alpha");
        let session = Session::acquire(&dir).unwrap();
        assert_eq!(session.next_id(), 0);
        assert!(dir.join(SESSION_FILE).exists());
    }

    #[test]
    fn second_holder_is_refused_until_release() {
        let world = tempfile::tempdir().unwrap();
        let dir = session_dir(world.path(), "alpha");
        let first = Session::acquire(&dir).unwrap();
        assert!(matches!(
            Session::acquire(&dir),
            Err(SessionError::Locked { .. })
        ));
        drop(first);
        Session::acquire(&dir).unwrap();
    }

    #[test]
    fn ids_survive_reacquire() {
        let world = tempfile::tempdir().unwrap();
        let dir = session_dir(world.path(), "alpha");
        {
            let mut session = Session::acquire(&dir).unwrap();
            assert_eq!(session.write_structure(b"zero").unwrap(), 0);
            assert_eq!(session.write_structure(b"one").unwrap(), 1);
        }
        assert_eq!(fs::read_to_string(dir.join(SESSION_FILE)).unwrap(), "2");
        let session = Session::acquire(&dir).unwrap();
        assert_eq!(session.next_id(), 2);
        assert_eq!(fs::read(session.structure_path(1)).unwrap(), b"one");
    }

    #[test]
    fn peek_reads_without_locking() {
        let world = tempfile::tempdir().unwrap();
        let dir = session_dir(world.path(), "alpha");
        assert_eq!(peek_next_id(&dir), 0);
        let mut session = Session::acquire(&dir).unwrap();
        session.write_structure(b"zero").unwrap();
        assert_eq!(peek_next_id(&dir), 1);
    }

    #[test]
    fn corrupt_content_is_reported() {
        let world = tempfile::tempdir().unwrap();
        let dir = session_dir(world.path(), "alpha");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(SESSION_FILE), "twelve").unwrap();
        assert!(matches!(
            Session::acquire(&dir),
            Err(SessionError::Corrupt { content, .. }) if content == "twelve"
        ));
    }

    #[test]
    fn unrecorded_id_still_advances_past_the_written_packet() {
        let world = tempfile::tempdir().unwrap();
        let dir = session_dir(world.path(), "alpha");
        let mut session = Session::acquire(&dir).unwrap();
        session.file = File::open(dir.join(SESSION_FILE)).unwrap();

        let err = session.write_structure(b"zero").unwrap_err();
        assert!(matches!(err, SessionError::Persist { id: 0, .. }));
        assert_eq!(err.written_id(), Some(0));
        assert_eq!(session.next_id(), 1);
        assert_eq!(fs::read(session.structure_path(0)).unwrap(), b"zero");
    }

    #[test]
    fn failed_rename_discards_staging_and_keeps_the_id() {
        let world = tempfile::tempdir().unwrap();
        let dir = session_dir(world.path(), "alpha");
        let mut session = Session::acquire(&dir).unwrap();
        let blocked = session.structure_path(0);
        fs::create_dir(&blocked).unwrap();
        fs::write(blocked.join("occupant"), b"x").unwrap();

        let err = session.write_structure(b"zero").unwrap_err();
        assert!(matches!(err, SessionError::Io { .. }));
        assert_eq!(err.written_id(), None);
        assert_eq!(session.next_id(), 0);
        assert!(!dir.join("0.tmp").exists());

        fs::remove_dir_all(&blocked).unwrap();
        assert_eq!(session.write_structure(b"zero").unwrap(), 0);
        assert_eq!(fs::read_to_string(dir.join(SESSION_FILE)).unwrap(), "1");
    }

    #[test]
    fn cleanup_removes_confirmed_packets_only() {
        let world = tempfile::tempdir().unwrap();
        let dir = session_dir(world.path(), "alpha");
        let mut session = Session::acquire(&dir).unwrap();
        for _ in 0..4 {
            session.write_structure(b"packet").unwrap();
        }
        fs::write(dir.join("notes.nbt.bak"), b"keep").unwrap();

        assert_eq!(session.remove_structures_through(2), 3);
        assert!(!session.structure_path(2).exists());
        assert!(session.structure_path(3).exists());
        assert!(dir.join(SESSION_FILE).exists());
        assert!(dir.join("notes.nbt.bak").exists());
    }
}
