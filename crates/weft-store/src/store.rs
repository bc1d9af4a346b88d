use crate::types::{LockRecord, Receipt, RunState};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const LOCK_FILE_NAME: &str = "lock.json";
pub const STATE_FILE_NAME: &str = "state.json";
pub const RECEIPT_FILE_NAME: &str = "receipt.json";
pub const STORE_DIR_NAME: &str = ".weft";
pub const WORK_DIR_NAME: &str = "work";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("workspace io failure: {0}")]
    Io(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Owns the durable state of one workspace. All mutating writes go through
/// `write_atomic` (temp file + rename) so readers never observe a
/// half-written lock, state, or receipt file.
#[derive(Clone, Debug)]
pub struct WorkspaceStore {
    root: PathBuf,
    store_dir: PathBuf,
}

impl WorkspaceStore {
    pub fn open<P: AsRef<Path>>(root: P) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        let store_dir = root.join(STORE_DIR_NAME);
        fs::create_dir_all(store_dir.join(WORK_DIR_NAME)).map_err(|error| {
            StoreError::Io(format!(
                "failed to create store directory '{}': {}",
                store_dir.display(),
                error
            ))
        })?;
        Ok(Self { root, store_dir })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_path(&self) -> PathBuf {
        self.store_dir.join(LOCK_FILE_NAME)
    }

    pub fn state_path(&self) -> PathBuf {
        self.store_dir.join(STATE_FILE_NAME)
    }

    pub fn receipt_path(&self) -> PathBuf {
        self.store_dir.join(RECEIPT_FILE_NAME)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.store_dir.join(WORK_DIR_NAME)
    }

    // ---- lock file ----

    /// Atomic create-if-absent. Returns false when a lock file already
    /// exists; the caller decides whether the holder is stale.
    pub fn try_create_lock(&self, record: &LockRecord) -> StoreResult<bool> {
        let raw = to_pretty_json(record)?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path())
        {
            Ok(mut file) => {
                file.write_all(&raw).map_err(|error| {
                    StoreError::Io(format!("failed writing lock file: {error}"))
                })?;
                Ok(true)
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(error) => Err(StoreError::Io(format!(
                "failed creating lock file '{}': {}",
                self.lock_path().display(),
                error
            ))),
        }
    }

    pub fn read_lock(&self) -> StoreResult<Option<LockRecord>> {
        read_json_opt(&self.lock_path())
    }

    /// Overwrites the lock record in place (stale takeover, renewal).
    pub fn replace_lock(&self, record: &LockRecord) -> StoreResult<()> {
        self.write_atomic(&self.lock_path(), &to_pretty_json(record)?)
    }

    pub fn remove_lock(&self) -> StoreResult<()> {
        remove_if_present(&self.lock_path())
    }

    // ---- recovery state ----

    pub fn save_state(&self, state: &RunState) -> StoreResult<()> {
        self.write_atomic(&self.state_path(), &to_pretty_json(state)?)
    }

    pub fn load_state(&self) -> StoreResult<Option<RunState>> {
        read_json_opt(&self.state_path())
    }

    pub fn clear_state(&self) -> StoreResult<()> {
        remove_if_present(&self.state_path())
    }

    // ---- receipt ----

    pub fn save_receipt(&self, receipt: &Receipt) -> StoreResult<()> {
        self.write_atomic(&self.receipt_path(), &to_pretty_json(receipt)?)
    }

    pub fn load_receipt(&self) -> StoreResult<Option<Receipt>> {
        read_json_opt(&self.receipt_path())
    }

    pub fn remove_receipt(&self) -> StoreResult<()> {
        remove_if_present(&self.receipt_path())
    }

    // ---- stage work files ----

    pub fn write_work_file(&self, relative: &str, bytes: &[u8]) -> StoreResult<()> {
        let path = self.work_dir().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                StoreError::Io(format!(
                    "failed to create work directory '{}': {}",
                    parent.display(),
                    error
                ))
            })?;
        }
        self.write_atomic(&path, bytes)
    }

    pub fn read_work_file(&self, relative: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.work_dir().join(relative);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(StoreError::Io(format!(
                "failed reading work file '{}': {}",
                path.display(),
                error
            ))),
        }
    }

    pub fn remove_work_file(&self, relative: &str) -> StoreResult<()> {
        remove_if_present(&self.work_dir().join(relative))
    }

    /// Discards one stage's partial work (e.g. after a stage timeout).
    pub fn clear_work_subdir(&self, relative: &str) -> StoreResult<()> {
        let path = self.work_dir().join(relative);
        if path.exists() {
            fs::remove_dir_all(&path).map_err(|error| {
                StoreError::Io(format!(
                    "failed clearing work directory '{}': {}",
                    path.display(),
                    error
                ))
            })?;
        }
        Ok(())
    }

    pub fn clear_work_dir(&self) -> StoreResult<()> {
        let dir = self.work_dir();
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|error| {
                StoreError::Io(format!(
                    "failed clearing work directory '{}': {}",
                    dir.display(),
                    error
                ))
            })?;
        }
        fs::create_dir_all(&dir).map_err(|error| {
            StoreError::Io(format!(
                "failed recreating work directory '{}': {}",
                dir.display(),
                error
            ))
        })
    }

    // ---- generated outputs ----

    pub fn output_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn write_output(&self, relative: &str, bytes: &[u8]) -> StoreResult<()> {
        let path = self.output_path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                StoreError::Io(format!(
                    "failed to create output directory '{}': {}",
                    parent.display(),
                    error
                ))
            })?;
        }
        self.write_atomic(&path, bytes)
    }

    pub fn read_output(&self, relative: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.output_path(relative);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(StoreError::Io(format!(
                "failed reading output '{}': {}",
                path.display(),
                error
            ))),
        }
    }

    pub fn remove_output(&self, relative: &str) -> StoreResult<()> {
        remove_if_present(&self.output_path(relative))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> StoreResult<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|error| {
            StoreError::Io(format!(
                "failed writing temp file '{}': {}",
                tmp.display(),
                error
            ))
        })?;
        fs::rename(&tmp, path).map_err(|error| {
            StoreError::Io(format!(
                "failed renaming '{}' over '{}': {}",
                tmp.display(),
                path.display(),
                error
            ))
        })
    }
}

fn to_pretty_json<T: serde::Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|error| StoreError::Serialization(error.to_string()))
}

fn read_json_opt<T: serde::de::DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(StoreError::Io(format!(
                "failed reading '{}': {}",
                path.display(),
                error
            )));
        }
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|error| StoreError::Serialization(error.to_string()))
}

fn remove_if_present(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(StoreError::Io(format!(
            "failed removing '{}': {}",
            path.display(),
            error
        ))),
    }
}
