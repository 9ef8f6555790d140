//! # Bounded control-message channel over POSIX message queues.
//!
//! Every participant owns at most one inbox; senders open the target's inbox
//! write-only and enqueue non-blockingly.
//!
//! ```text
//!   worker 1 ──┐                         ┌──► /<ns>.w1 ──► worker 1
//!   worker 2 ──┼──► /<ns>.sup ──► sup    sup ─┼──► /<ns>.w2 ──► worker 2
//!   worker N ──┘                         └──► /<ns>.wN ──► worker N
//! ```
//!
//! ## Rules
//! - `send` never blocks: a full queue yields `Ok(false)` and the message is dropped.
//! - Delivery is at-most-once; order is FIFO per (sender, inbox).
//! - `receive` with a filter keeps non-matching messages aside in arrival order;
//!   later calls see them first.
//! - A bounded wait polls the queue; there is no unbounded blocking receive.
//! - Only the creator unlinks the queues.

use std::collections::{HashMap, VecDeque};
use std::ffi::CString;
use std::io;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::mqueue::{mq_close, mq_getattr, mq_open, mq_receive, mq_send, mq_unlink, MqAttr, MqdT, MQ_OFlag};
use nix::sys::stat::Mode;

use super::message::{ControlMessage, Envelope, MessageFilter};
use crate::error::SubstrateError;

/// Step between polls during a bounded wait.
const POLL_STEP: Duration = Duration::from_millis(5);

/// Upper bound of messages kept aside by filtered receives.
const MAX_DEFERRED: usize = 1024;

/// An inbox owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Supervisor,
    Worker(u32),
}

impl Endpoint {
    /// POSIX queue name for this endpoint inside `namespace`.
    pub fn queue_name(self, namespace: &str) -> String {
        match self {
            Endpoint::Supervisor => format!("/{namespace}.sup"),
            Endpoint::Worker(id) => format!("/{namespace}.w{id}"),
        }
    }
}

/// Destination of a `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Supervisor,
    Worker(u32),
    /// Every worker inbox.
    Broadcast,
}

/// Queue sizing.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    /// Messages per queue.
    pub capacity: usize,
    /// Largest encoded envelope.
    pub max_message_bytes: usize,
}

struct Inbox {
    endpoint: Endpoint,
    mqd: MqdT,
    buf_len: usize,
}

/// One process's view of the channel.
pub struct Channel {
    namespace: String,
    workers: u32,
    max_message_bytes: usize,
    inbox: Option<Inbox>,
    outboxes: Mutex<HashMap<Endpoint, MqdT>>,
    deferred: Mutex<VecDeque<Envelope>>,
}

impl Channel {
    /// Creates the supervisor inbox and one inbox per worker slot.
    ///
    /// Leftover queues with the same names are unlinked and recreated.
    pub fn create(namespace: &str, workers: u32, opts: ChannelOptions) -> Result<Self, SubstrateError> {
        for id in 1..=workers {
            let mqd = create_queue(&Endpoint::Worker(id).queue_name(namespace), opts)?;
            let _ = mq_close(mqd);
        }
        let mqd = create_queue(&Endpoint::Supervisor.queue_name(namespace), opts)?;

        Ok(Self {
            namespace: namespace.to_owned(),
            workers,
            max_message_bytes: opts.max_message_bytes,
            inbox: Some(Inbox {
                endpoint: Endpoint::Supervisor,
                mqd,
                buf_len: opts.max_message_bytes,
            }),
            outboxes: Mutex::new(HashMap::new()),
            deferred: Mutex::new(VecDeque::new()),
        })
    }

    /// Connects to existing queues, owning `inbox` if given.
    pub fn attach(
        namespace: &str,
        workers: u32,
        inbox: Option<Endpoint>,
        max_message_bytes: usize,
    ) -> Result<Self, SubstrateError> {
        let inbox = match inbox {
            Some(endpoint) => {
                let name = endpoint.queue_name(namespace);
                let mqd = open_queue(&name, MQ_OFlag::O_RDONLY | MQ_OFlag::O_NONBLOCK)?;
                let buf_len = mq_getattr(&mqd)
                    .map(|a| a.msgsize().max(1) as usize)
                    .unwrap_or(max_message_bytes);
                Some(Inbox { endpoint, mqd, buf_len })
            }
            None => None,
        };

        Ok(Self {
            namespace: namespace.to_owned(),
            workers,
            max_message_bytes,
            inbox,
            outboxes: Mutex::new(HashMap::new()),
            deferred: Mutex::new(VecDeque::new()),
        })
    }

    /// The endpoint this handle receives on, if any.
    pub fn inbox(&self) -> Option<Endpoint> {
        self.inbox.as_ref().map(|i| i.endpoint)
    }

    /// Enqueues `message` without blocking.
    ///
    /// Returns `Ok(false)` if any target queue was full (the message is dropped
    /// for that target). For [`Target::Broadcast`] the remaining targets are
    /// still attempted.
    pub fn send(&self, message: &ControlMessage, target: Target) -> Result<bool, SubstrateError> {
        let envelope = Envelope::from_self(message.clone());
        let bytes = serde_json::to_vec(&envelope).map_err(|e| SubstrateError::Channel {
            queue: format!("{target:?}"),
            source: io::Error::other(e),
        })?;

        if bytes.len() > self.max_message_bytes {
            tracing::warn!(
                kind = ?message.kind(),
                size = bytes.len(),
                limit = self.max_message_bytes,
                "control message too large; dropped"
            );
            return Ok(false);
        }

        match target {
            Target::Supervisor => self.send_to(Endpoint::Supervisor, &bytes),
            Target::Worker(id) => self.send_to(Endpoint::Worker(id), &bytes),
            Target::Broadcast => {
                let mut all = true;
                for id in 1..=self.workers {
                    all &= self.send_to(Endpoint::Worker(id), &bytes)?;
                }
                Ok(all)
            }
        }
    }

    /// Dequeues the next message accepted by `filter`.
    ///
    /// `wait = None` returns immediately. `Some(d)` polls for at most `d`; this
    /// blocks the calling thread, so async loops pass `None`.
    pub fn receive(
        &self,
        filter: MessageFilter,
        wait: Option<Duration>,
    ) -> Result<Option<Envelope>, SubstrateError> {
        let inbox = self.inbox.as_ref().ok_or(SubstrateError::NoInbox)?;

        if let Some(env) = self.take_deferred(filter) {
            return Ok(Some(env));
        }

        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            while let Some(env) = self.try_recv(inbox)? {
                if filter.matches(&env.message) {
                    return Ok(Some(env));
                }
                self.defer(env);
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(POLL_STEP.min(deadline - now));
                }
                None => return Ok(None),
            }
        }
    }

    /// Unlinks every queue of the namespace. Missing queues are skipped.
    pub fn destroy(&self) -> Result<(), SubstrateError> {
        let mut names = vec![Endpoint::Supervisor.queue_name(&self.namespace)];
        names.extend((1..=self.workers).map(|id| Endpoint::Worker(id).queue_name(&self.namespace)));

        for name in names {
            let c_name = queue_cname(&name)?;
            match mq_unlink(c_name.as_c_str()) {
                Ok(()) | Err(Errno::ENOENT) => {}
                Err(errno) => {
                    return Err(SubstrateError::Resource {
                        resource: name,
                        source: io::Error::from(errno),
                    })
                }
            }
        }
        Ok(())
    }

    fn send_to(&self, endpoint: Endpoint, bytes: &[u8]) -> Result<bool, SubstrateError> {
        let mut outboxes = self.outboxes.lock().unwrap_or_else(PoisonError::into_inner);
        let mqd = match outboxes.entry(endpoint) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let name = endpoint.queue_name(&self.namespace);
                e.insert(open_queue(&name, MQ_OFlag::O_WRONLY | MQ_OFlag::O_NONBLOCK)?)
            }
        };

        match mq_send(mqd, bytes, 0) {
            Ok(()) => Ok(true),
            Err(Errno::EAGAIN) => {
                tracing::warn!(target_queue = ?endpoint, "control channel full; message dropped");
                Ok(false)
            }
            Err(Errno::EMSGSIZE) => {
                tracing::warn!(target_queue = ?endpoint, size = bytes.len(), "message exceeds queue size; dropped");
                Ok(false)
            }
            Err(errno) => Err(SubstrateError::Channel {
                queue: endpoint.queue_name(&self.namespace),
                source: io::Error::from(errno),
            }),
        }
    }

    fn try_recv(&self, inbox: &Inbox) -> Result<Option<Envelope>, SubstrateError> {
        let mut buf = vec![0u8; inbox.buf_len];
        loop {
            let mut prio = 0u32;
            match mq_receive(&inbox.mqd, &mut buf, &mut prio) {
                Ok(n) => match serde_json::from_slice::<Envelope>(&buf[..n]) {
                    Ok(env) => return Ok(Some(env)),
                    Err(e) => {
                        tracing::warn!(error = %e, size = n, "undecodable control message dropped");
                    }
                },
                Err(Errno::EAGAIN) => return Ok(None),
                Err(Errno::EINTR) => {}
                Err(errno) => {
                    return Err(SubstrateError::Channel {
                        queue: inbox.endpoint.queue_name(&self.namespace),
                        source: io::Error::from(errno),
                    })
                }
            }
        }
    }

    fn take_deferred(&self, filter: MessageFilter) -> Option<Envelope> {
        let mut deferred = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
        let pos = deferred.iter().position(|e| filter.matches(&e.message))?;
        deferred.remove(pos)
    }

    fn defer(&self, env: Envelope) {
        let mut deferred = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
        if deferred.len() >= MAX_DEFERRED {
            if let Some(old) = deferred.pop_front() {
                tracing::warn!(kind = ?old.message.kind(), "deferred control message evicted");
            }
        }
        deferred.push_back(env);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(inbox) = self.inbox.take() {
            let _ = mq_close(inbox.mqd);
        }
        let outboxes = std::mem::take(
            self.outboxes
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (_, mqd) in outboxes {
            let _ = mq_close(mqd);
        }
    }
}

fn queue_cname(name: &str) -> Result<CString, SubstrateError> {
    CString::new(name).map_err(|e| SubstrateError::Resource {
        resource: name.to_owned(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })
}

fn create_queue(name: &str, opts: ChannelOptions) -> Result<MqdT, SubstrateError> {
    let c_name = queue_cname(name)?;
    let attr = MqAttr::new(0, opts.capacity as _, opts.max_message_bytes as _, 0);
    let flags = MQ_OFlag::O_CREAT | MQ_OFlag::O_EXCL | MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK;
    let mode = Mode::S_IRUSR | Mode::S_IWUSR;

    match mq_open(c_name.as_c_str(), flags, mode, Some(&attr)) {
        Ok(mqd) => Ok(mqd),
        Err(Errno::EEXIST) => {
            tracing::warn!(queue = name, "stale control queue found; recreating");
            let _ = mq_unlink(c_name.as_c_str());
            mq_open(c_name.as_c_str(), flags, mode, Some(&attr)).map_err(|errno| {
                SubstrateError::Resource {
                    resource: name.to_owned(),
                    source: io::Error::from(errno),
                }
            })
        }
        Err(errno) => Err(SubstrateError::Resource {
            resource: name.to_owned(),
            source: io::Error::from(errno),
        }),
    }
}

fn open_queue(name: &str, flags: MQ_OFlag) -> Result<MqdT, SubstrateError> {
    let c_name = queue_cname(name)?;
    mq_open(c_name.as_c_str(), flags, Mode::empty(), None).map_err(|errno| match errno {
        Errno::ENOENT => SubstrateError::NotFound {
            resource: name.to_owned(),
        },
        other => SubstrateError::Resource {
            resource: name.to_owned(),
            source: io::Error::from(other),
        },
    })
}
