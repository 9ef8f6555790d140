//! Coordination substrate: shared process table, its lock, and the control channel.
//!
//! This module owns every IPC resource the supervisor and workers share.
//! A [`Substrate`] is an explicit handle obtained from [`Substrate::create`]
//! (supervisor) or [`Substrate::attach`] (worker, observer); there is no global.
//!
//! ## Contents
//! - [`SharedState`], [`ProcessRecord`], [`GlobalStatistics`]: data model of the region
//! - [`ControlMessage`], [`Envelope`], [`MessageFilter`]: typed control messages
//! - [`ControlFlags`]: in-process shutdown/reload flags set by signal listeners
//!
//! ## Lifecycle
//! ```text
//! supervisor: create ──► with_lock / send / receive ... ──► destroy
//! worker:     attach ──► with_lock / send / receive ... ──► detach (drop)
//! observer:   attach ──► read / send ──► detach
//! ```

mod channel;
mod flags;
mod message;
mod region;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use channel::{ChannelOptions, Endpoint, Target};
pub use flags::ControlFlags;
pub use message::{ControlMessage, Envelope, MessageFilter, MessageKind, MAX_ERROR_TEXT};
pub use region::StateRegion;
pub use state::{
    now_millis, GlobalStatistics, ProcessRecord, ProcessStatus, SharedState, StatsSnapshot,
};

use channel::Channel;

use crate::error::SubstrateError;

/// Where the substrate lives and how its queues are sized.
#[derive(Debug, Clone)]
pub struct SubstrateOptions {
    /// Directory holding the state and lock files.
    pub runtime_dir: PathBuf,
    /// Prefix of every resource name.
    pub namespace: String,
    pub channel: ChannelOptions,
}

/// Who is attaching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A worker owning the inbox of its slot.
    Worker(u32),
    /// Read access and send-only channel (control clients, tests).
    Observer,
}

/// Handle to the shared region, its lock and the control channel.
pub struct Substrate {
    options: SubstrateOptions,
    region: StateRegion,
    channel: Channel,
    flags: Arc<ControlFlags>,
    owner: bool,
}

impl Substrate {
    /// Creates all resources for `max_workers` slots. Supervisor only.
    pub fn create(options: SubstrateOptions, max_workers: u32) -> Result<Self, SubstrateError> {
        let initial = SharedState::new(max_workers as usize, std::process::id());
        let region = StateRegion::create(&options.runtime_dir, &options.namespace, &initial)?;

        let channel = match Channel::create(&options.namespace, max_workers, options.channel) {
            Ok(ch) => ch,
            Err(e) => {
                let _ = region.destroy();
                return Err(e);
            }
        };

        tracing::debug!(
            namespace = %options.namespace,
            dir = %options.runtime_dir.display(),
            max_workers,
            "substrate created"
        );

        Ok(Self {
            options,
            region,
            channel,
            flags: Arc::new(ControlFlags::new()),
            owner: true,
        })
    }

    /// Connects to resources created by a running supervisor.
    ///
    /// Fails with [`SubstrateError::NotFound`] when the supervisor is gone or the
    /// worker slot does not exist.
    pub fn attach(options: SubstrateOptions, role: Role) -> Result<Self, SubstrateError> {
        let region = StateRegion::attach(&options.runtime_dir, &options.namespace)?;
        let capacity = region.read(|st| st.capacity)? as u32;

        let inbox = match role {
            Role::Worker(id) if id == 0 || id > capacity => {
                return Err(SubstrateError::NotFound {
                    resource: Endpoint::Worker(id).queue_name(&options.namespace),
                })
            }
            Role::Worker(id) => Some(Endpoint::Worker(id)),
            Role::Observer => None,
        };
        let channel = Channel::attach(
            &options.namespace,
            capacity,
            inbox,
            options.channel.max_message_bytes,
        )?;

        Ok(Self {
            options,
            region,
            channel,
            flags: Arc::new(ControlFlags::new()),
            owner: false,
        })
    }

    /// Runs `f` on the shared state under the lock; changes are persisted.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut SharedState) -> R) -> Result<R, SubstrateError> {
        self.region.with_lock(f)
    }

    /// Runs `f` on a consistent view of the shared state under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&SharedState) -> R) -> Result<R, SubstrateError> {
        self.region.read(f)
    }

    /// Copy of the whole shared state.
    pub fn snapshot(&self) -> Result<SharedState, SubstrateError> {
        self.region.read(Clone::clone)
    }

    /// Non-blocking send; `Ok(false)` when the target queue is full.
    pub fn send(&self, message: &ControlMessage, target: Target) -> Result<bool, SubstrateError> {
        self.channel.send(message, target)
    }

    /// Next message accepted by `filter`; see [`MessageFilter`].
    ///
    /// `wait = None` never blocks; `Some(d)` blocks the thread for at most `d`.
    pub fn receive(
        &self,
        filter: MessageFilter,
        wait: Option<Duration>,
    ) -> Result<Option<Envelope>, SubstrateError> {
        self.channel.receive(filter, wait)
    }

    pub fn flags(&self) -> &Arc<ControlFlags> {
        &self.flags
    }

    pub fn options(&self) -> &SubstrateOptions {
        &self.options
    }

    pub fn region(&self) -> &StateRegion {
        &self.region
    }

    #[inline]
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Releases this process's descriptors. The resources stay in place.
    pub fn detach(self) {
        tracing::debug!(namespace = %self.options.namespace, "substrate detached");
    }

    /// Removes every OS resource. Only the creating handle may do this; on any
    /// other handle it is a no-op.
    pub fn destroy(self) -> Result<(), SubstrateError> {
        if !self.owner {
            tracing::debug!("destroy on a non-owning handle ignored");
            return Ok(());
        }
        self.channel.destroy()?;
        self.region.destroy()?;
        tracing::debug!(namespace = %self.options.namespace, "substrate destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT: AtomicU32 = AtomicU32::new(0);

    fn options(dir: &std::path::Path) -> SubstrateOptions {
        SubstrateOptions {
            runtime_dir: dir.to_path_buf(),
            namespace: format!("pvsub{}-{}", std::process::id(), NEXT.fetch_add(1, Ordering::Relaxed)),
            channel: ChannelOptions {
                capacity: 8,
                max_message_bytes: 1024,
            },
        }
    }

    #[test]
    fn worker_attach_checks_slot_range() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        let sup = Substrate::create(opts.clone(), 2).unwrap();

        assert!(Substrate::attach(opts.clone(), Role::Worker(2)).is_ok());
        let err = Substrate::attach(opts.clone(), Role::Worker(3)).err().unwrap();
        assert!(err.is_not_found());

        sup.destroy().unwrap();
        let err = Substrate::attach(opts, Role::Observer).err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn worker_updates_are_visible_to_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        let sup = Substrate::create(opts.clone(), 1).unwrap();
        sup.with_lock(|st| st.upsert(ProcessRecord::starting(1, 77, 0)))
            .unwrap()
            .unwrap();

        let worker = Substrate::attach(opts, Role::Worker(1)).unwrap();
        worker
            .with_lock(|st| {
                if let Some(rec) = st.slot_mut(1) {
                    rec.status = ProcessStatus::Running;
                    rec.last_heartbeat_at = 123;
                }
            })
            .unwrap();
        worker
            .send(&ControlMessage::Heartbeat { worker_id: 1 }, Target::Supervisor)
            .unwrap();
        worker.detach();

        let rec = sup.read(|st| st.slot(1).cloned()).unwrap().unwrap();
        assert_eq!(rec.status, ProcessStatus::Running);
        assert_eq!(rec.last_heartbeat_at, 123);
        let env = sup.receive(MessageFilter::Any, None).unwrap().unwrap();
        assert_eq!(env.message, ControlMessage::Heartbeat { worker_id: 1 });

        sup.destroy().unwrap();
    }

    #[test]
    fn non_owner_cannot_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        let sup = Substrate::create(opts.clone(), 1).unwrap();

        let observer = Substrate::attach(opts.clone(), Role::Observer).unwrap();
        assert!(!observer.is_owner());
        observer.destroy().unwrap();
        assert!(Substrate::attach(opts, Role::Observer).is_ok());

        sup.destroy().unwrap();
    }
}
