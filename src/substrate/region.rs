//! # Named shared-state region guarded by a process-shared lock.
//!
//! The region is a state file under the runtime directory holding the JSON
//! encoding of [`SharedState`]. Mutual exclusion is an exclusive advisory
//! `flock(2)` on a sibling lock file:
//!
//! ```text
//! <runtime_dir>/<namespace>.state   SharedState (replaced atomically: write .tmp, rename)
//! <runtime_dir>/<namespace>.lock    flock target
//! ```
//!
//! ## Rules
//! - Every read and write happens while holding the lock.
//! - The lock guard releases on drop, so it is released on every exit path,
//!   including unwinding out of the closure.
//! - The kernel drops the lock when its holder dies; a crashed worker cannot
//!   wedge the table.
//! - Only the creator calls [`StateRegion::destroy`].
//! - Access is synchronous: `flock`, the read and the write+rename block the
//!   calling thread. The closure is not async, so the lock can never be held
//!   across an `.await`; critical sections are one small table read or update.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use super::state::SharedState;
use crate::error::SubstrateError;

/// Handle to the shared-state region. Cheap to clone; holds only paths.
#[derive(Debug, Clone)]
pub struct StateRegion {
    state_path: PathBuf,
    lock_path: PathBuf,
    tmp_path: PathBuf,
}

impl StateRegion {
    fn paths(dir: &Path, namespace: &str) -> Self {
        Self {
            state_path: dir.join(format!("{namespace}.state")),
            lock_path: dir.join(format!("{namespace}.lock")),
            tmp_path: dir.join(format!("{namespace}.state.tmp")),
        }
    }

    /// Creates the region with an empty table.
    ///
    /// A leftover region with the same name (from a supervisor that died without
    /// cleanup) is removed and recreated.
    pub fn create(dir: &Path, namespace: &str, initial: &SharedState) -> Result<Self, SubstrateError> {
        fs::create_dir_all(dir).map_err(|source| SubstrateError::Resource {
            resource: dir.display().to_string(),
            source,
        })?;

        let region = Self::paths(dir, namespace);
        if region.state_path.exists() {
            tracing::warn!(
                path = %region.state_path.display(),
                "stale shared state found; recreating"
            );
            region.destroy()?;
        }

        let _guard = region.lock()?;
        region.store(initial)?;
        Ok(region)
    }

    /// Connects to an existing region.
    pub fn attach(dir: &Path, namespace: &str) -> Result<Self, SubstrateError> {
        let region = Self::paths(dir, namespace);
        if !region.state_path.exists() {
            return Err(SubstrateError::NotFound {
                resource: region.state_path.display().to_string(),
            });
        }
        // Validate the contents once so a corrupt region fails at attach time.
        region.read(|_| ())?;
        Ok(region)
    }

    /// Runs `f` on the state while holding the lock and persists any change.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut SharedState) -> R) -> Result<R, SubstrateError> {
        let _guard = self.lock()?;
        let mut state = self.load()?;
        let before = state.clone();
        let out = f(&mut state);
        if state != before {
            self.store(&state)?;
        }
        Ok(out)
    }

    /// Runs `f` on a consistent view of the state while holding the lock.
    pub fn read<R>(&self, f: impl FnOnce(&SharedState) -> R) -> Result<R, SubstrateError> {
        let _guard = self.lock()?;
        let state = self.load()?;
        Ok(f(&state))
    }

    /// Removes the region files. Missing files are not an error.
    pub fn destroy(&self) -> Result<(), SubstrateError> {
        for path in [&self.state_path, &self.tmp_path, &self.lock_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(SubstrateError::Resource {
                        resource: path.display().to_string(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    fn lock(&self) -> Result<Flock<File>, SubstrateError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|source| SubstrateError::Lock {
                path: self.lock_path.clone(),
                source,
            })?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| SubstrateError::Lock {
            path: self.lock_path.clone(),
            source: io::Error::from(errno),
        })
    }

    fn load(&self) -> Result<SharedState, SubstrateError> {
        let bytes = fs::read(&self.state_path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                SubstrateError::NotFound {
                    resource: self.state_path.display().to_string(),
                }
            } else {
                SubstrateError::Resource {
                    resource: self.state_path.display().to_string(),
                    source,
                }
            }
        })?;
        serde_json::from_slice(&bytes).map_err(|source| SubstrateError::Corrupt {
            path: self.state_path.clone(),
            source,
        })
    }

    fn store(&self, state: &SharedState) -> Result<(), SubstrateError> {
        let resource_err = |source: io::Error| SubstrateError::Resource {
            resource: self.state_path.display().to_string(),
            source,
        };
        let bytes = serde_json::to_vec(state).map_err(|e| resource_err(io::Error::other(e)))?;

        let mut tmp = File::create(&self.tmp_path).map_err(resource_err)?;
        tmp.write_all(&bytes).map_err(resource_err)?;
        tmp.sync_data().map_err(resource_err)?;
        drop(tmp);

        fs::rename(&self.tmp_path, &self.state_path).map_err(resource_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::state::{ProcessRecord, ProcessStatus};

    #[test]
    fn create_attach_and_mutate() {
        let dir = tempfile::tempdir().unwrap();
        let region = StateRegion::create(dir.path(), "pv", &SharedState::new(2, 1)).unwrap();

        region
            .with_lock(|st| st.upsert(ProcessRecord::starting(1, 4242, 0)))
            .unwrap()
            .unwrap();

        let other = StateRegion::attach(dir.path(), "pv").unwrap();
        let rec = other.read(|st| st.slot(1).cloned()).unwrap().unwrap();
        assert_eq!(rec.pid, 4242);
        assert_eq!(rec.status, ProcessStatus::Starting);
    }

    #[test]
    fn attach_without_create_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = StateRegion::attach(dir.path(), "missing").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn create_replaces_stale_region() {
        let dir = tempfile::tempdir().unwrap();
        let first = StateRegion::create(dir.path(), "pv", &SharedState::new(1, 1)).unwrap();
        first
            .with_lock(|st| st.shutdown_requested = true)
            .unwrap();

        let second = StateRegion::create(dir.path(), "pv", &SharedState::new(4, 2)).unwrap();
        let (cap, flag) = second
            .read(|st| (st.capacity, st.shutdown_requested))
            .unwrap();
        assert_eq!(cap, 4);
        assert!(!flag);
    }

    #[test]
    fn corrupt_state_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let region = StateRegion::create(dir.path(), "pv", &SharedState::new(1, 1)).unwrap();
        fs::write(region.state_path(), b"{not json").unwrap();

        let err = region.read(|_| ()).unwrap_err();
        assert_eq!(err.as_label(), "substrate_corrupt");
    }

    #[test]
    fn lock_is_released_after_panic() {
        let dir = tempfile::tempdir().unwrap();
        let region = StateRegion::create(dir.path(), "pv", &SharedState::new(1, 1)).unwrap();

        let r = region.clone();
        let res = std::panic::catch_unwind(move || {
            let _ = r.with_lock(|_| panic!("boom"));
        });
        assert!(res.is_err());

        // Would block forever if the guard leaked.
        region.with_lock(|st| st.reload_requested = true).unwrap();
        assert!(region.read(|st| st.reload_requested).unwrap());
    }

    #[test]
    fn concurrent_updates_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let region = StateRegion::create(dir.path(), "pv", &SharedState::new(1, 1)).unwrap();

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let r = region.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        r.with_lock(|st| st.config_version += 1).unwrap();
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        assert_eq!(region.read(|st| st.config_version).unwrap(), 100);
    }

    #[test]
    fn destroy_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let region = StateRegion::create(dir.path(), "pv", &SharedState::new(1, 1)).unwrap();
        region.destroy().unwrap();
        assert!(!region.state_path().exists());
        region.destroy().unwrap();
    }
}
