//! Forwarding of requests into a mounted remote tree.
//!
//! A mount owns an attached [`Client`]. Requests against descriptors that
//! resolve below the mount point are rewritten onto remote descriptors and
//! re-issued on that client under a fresh outbound tag. A table keyed by the
//! outbound tag remembers who asked; every response packet is relayed back
//! under the requester's original tag, and the entry is dropped with the
//! last packet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, info, warn};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::fcall::{Fcall, expected_packets, transfer_complete};
use crate::mux::Relay;
use crate::protocol::Qid;
use crate::session::{Binding, Session};

/// Re-chunks a remote read stream to the requester's IO unit.
struct ReadRelay {
    count: u32,
    local_iounit: usize,
    remote_iounit: u32,
    expected: u32,
    received: u32,
    total: usize,
    emitted: usize,
    buffered: Vec<u8>,
}

impl ReadRelay {
    fn new(count: u32, local_iounit: u32, remote_iounit: u32) -> Self {
        Self {
            count,
            local_iounit: local_iounit.max(1) as usize,
            remote_iounit,
            expected: expected_packets(count, remote_iounit),
            received: 0,
            total: 0,
            emitted: 0,
            buffered: Vec::new(),
        }
    }

    /// Take one remote packet; returns the local packets ready to send and
    /// whether the transfer is over.
    fn absorb(&mut self, data: &[u8]) -> (Vec<Fcall>, bool) {
        self.received += 1;
        self.total += data.len();
        self.buffered.extend_from_slice(data);
        let mut out = Vec::new();
        while self.buffered.len() >= self.local_iounit {
            let rest = self.buffered.split_off(self.local_iounit);
            let chunk = std::mem::replace(&mut self.buffered, rest);
            out.push(Fcall::RRead { data: chunk });
        }
        let done = transfer_complete(self.received, self.expected, data.len(), self.remote_iounit);
        if done {
            let short = self.total < self.count as usize && self.total % self.local_iounit == 0;
            if !self.buffered.is_empty() {
                out.push(Fcall::RRead {
                    data: std::mem::take(&mut self.buffered),
                });
            } else if short || self.emitted + out.len() == 0 {
                out.push(Fcall::RRead { data: Vec::new() });
            }
        }
        self.emitted += out.len();
        (out, done)
    }
}

enum Op {
    Walk {
        newfid: u32,
        remote_newfid: u32,
        prefix: Vec<Qid>,
        wanted: usize,
    },
    Open {
        remote_fid: u32,
    },
    Release {
        remote_fid: u32,
    },
    Plain,
}

struct Relayed {
    session: Arc<Session>,
    tag: u16,
    fid: u32,
    op: Op,
    read: Option<ReadRelay>,
}

/// Traffic counters of one mount.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Response packets received from the remote server.
    pub inbound_packets: u64,
    /// Response packets relayed to local requesters.
    pub outbound_packets: u64,
}

/// A remote tree grafted into a local namespace.
pub struct Mount {
    me: Weak<Mount>,
    client: Arc<Client>,
    root_fid: u32,
    root_qid: Qid,
    table: Mutex<HashMap<u16, Relayed>>,
    inbound: AtomicU64,
    outbound: AtomicU64,
}

impl Mount {
    /// Wrap an attached client.
    pub fn new(client: Arc<Client>) -> Result<Arc<Self>> {
        let (root_fid, root_qid) = client.root()?;
        info!("mount over remote root fid {}", root_fid);
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            client,
            root_fid,
            root_qid,
            table: Mutex::new(HashMap::new()),
            inbound: AtomicU64::new(0),
            outbound: AtomicU64::new(0),
        }))
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            inbound_packets: self.inbound.load(Ordering::Relaxed),
            outbound_packets: self.outbound.load(Ordering::Relaxed),
        }
    }

    /// Outbound transactions still waiting for their last packet.
    pub fn pending(&self) -> usize {
        self.lock_table().len()
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<u16, Relayed>> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Continue a walk that reached the mount point: `prefix` holds the
    /// local QIDs walked so far and `wnames` the names left to resolve
    /// remotely.
    pub(crate) fn forward_walk(
        &self,
        session: &Arc<Session>,
        tag: u16,
        fid: u32,
        newfid: u32,
        prefix: Vec<Qid>,
        wnames: Vec<String>,
    ) -> Result<()> {
        self.walk_from(session, tag, fid, self.root_fid, newfid, prefix, wnames)
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_from(
        &self,
        session: &Arc<Session>,
        tag: u16,
        fid: u32,
        remote_fid: u32,
        newfid: u32,
        prefix: Vec<Qid>,
        wnames: Vec<String>,
    ) -> Result<()> {
        let remote_newfid = self.client.fids().generate_descriptor()?;
        let wanted = wnames.len();
        let body = Fcall::TWalk {
            fid: remote_fid,
            newfid: remote_newfid,
            wnames,
        };
        let op = Op::Walk {
            newfid,
            remote_newfid,
            prefix,
            wanted,
        };
        let submitted = self.submit(session, tag, fid, body, op, None);
        if submitted.is_err() {
            self.client.fids().remove(remote_newfid);
        }
        submitted
    }

    /// Re-issue a request made against a descriptor bound to `remote_fid`.
    pub(crate) fn forward(
        &self,
        session: &Arc<Session>,
        tag: u16,
        fid: u32,
        remote_fid: u32,
        request: Fcall,
    ) -> Result<()> {
        let remote_iounit = self.client.iounit();
        let (body, op, read) = match request {
            Fcall::TWalk { newfid, wnames, .. } => {
                if newfid != fid && session.descriptors.valid_descriptor(newfid) {
                    return Err(Error::DescriptorInUse(newfid));
                }
                return self.walk_from(session, tag, fid, remote_fid, newfid, Vec::new(), wnames);
            }
            Fcall::TOpen { mode, .. } => (
                Fcall::TOpen {
                    fid: remote_fid,
                    mode,
                },
                Op::Open { remote_fid },
                None,
            ),
            Fcall::TCreate {
                name, perm, mode, ..
            } => (
                Fcall::TCreate {
                    fid: remote_fid,
                    name,
                    perm,
                    mode,
                },
                Op::Open { remote_fid },
                None,
            ),
            Fcall::TRead { offset, count, .. } => (
                Fcall::TRead {
                    fid: remote_fid,
                    offset,
                    count,
                },
                Op::Plain,
                Some(ReadRelay::new(count, session.iounit(), remote_iounit)),
            ),
            Fcall::TWrite {
                offset, mut data, ..
            } => {
                // The requester sees a short count and resends the rest.
                data.truncate(remote_iounit as usize);
                (
                    Fcall::TWrite {
                        fid: remote_fid,
                        offset,
                        data,
                    },
                    Op::Plain,
                    None,
                )
            }
            Fcall::TClunk { .. } => (
                Fcall::TClunk { fid: remote_fid },
                Op::Release { remote_fid },
                None,
            ),
            Fcall::TRemove { .. } => (
                Fcall::TRemove { fid: remote_fid },
                Op::Release { remote_fid },
                None,
            ),
            Fcall::TStat { .. } => (Fcall::TStat { fid: remote_fid }, Op::Plain, None),
            Fcall::TWstat { stat, .. } => (
                Fcall::TWstat {
                    fid: remote_fid,
                    stat,
                },
                Op::Plain,
                None,
            ),
            other => return Err(Error::NotSupported(other.verb())),
        };
        self.submit(session, tag, fid, body, op, read)
    }

    fn submit(
        &self,
        session: &Arc<Session>,
        tag: u16,
        fid: u32,
        body: Fcall,
        op: Op,
        read: Option<ReadRelay>,
    ) -> Result<()> {
        let Some(me) = self.me.upgrade() else {
            return Err(Error::ConnectionReset(String::from("mount released")));
        };
        let mux = self.client.mux();
        let out_tag = mux.allocate_tag()?;
        debug!(
            "mount: session {} tag {} → outbound tag {} {}",
            session.id(),
            tag,
            out_tag,
            body.verb()
        );
        self.lock_table().insert(
            out_tag,
            Relayed {
                session: session.clone(),
                tag,
                fid,
                op,
                read,
            },
        );
        match mux.submit_relay(out_tag, body, me) {
            Ok(()) => Ok(()),
            // A failed write has already aborted the entry and answered the
            // requester; only report errors nobody answered yet.
            Err(e) => match self.lock_table().remove(&out_tag) {
                Some(_) => Err(e),
                None => Ok(()),
            },
        }
    }

    fn relay_out(&self, session: &Session, tag: u16, packets: &[Fcall]) {
        for packet in packets {
            session.reply(tag, packet);
        }
        self.outbound
            .fetch_add(packets.len() as u64, Ordering::Relaxed);
    }

    /// Turn the final remote response into the local reply.
    fn complete(&self, entry: &Relayed, response: Fcall) -> Vec<Fcall> {
        let session = &entry.session;
        match (&entry.op, response) {
            (
                Op::Walk {
                    newfid,
                    remote_newfid,
                    prefix,
                    wanted,
                },
                Fcall::RWalk { wqids },
            ) => {
                if wqids.len() < *wanted {
                    self.client.fids().remove(*remote_newfid);
                    return vec![Fcall::error(&Error::NotFound(format!(
                        "remote walk stopped after {} of {} names",
                        wqids.len(),
                        wanted
                    )))];
                }
                let qid = wqids.last().copied().unwrap_or(self.root_qid);
                if session.is_closed() {
                    // Teardown already released this session's bindings.
                    debug!(
                        "mount: session {} closed during walk, releasing remote fid {}",
                        session.id(),
                        remote_newfid
                    );
                    self.release_remote(*remote_newfid);
                    return Vec::new();
                }
                if let Err(e) = self.client.fids().map_qid(*remote_newfid, qid) {
                    warn!("mount: remote fid {} already bound: {}", remote_newfid, e);
                }
                let Some(me) = self.me.upgrade() else {
                    return vec![Fcall::error(&Error::ConnectionReset(String::from(
                        "mount released",
                    )))];
                };
                let previous = if *newfid == entry.fid {
                    session.descriptors.get_resource(*newfid).ok()
                } else {
                    None
                };
                let binding = Binding::Remote {
                    mount: me,
                    remote_fid: *remote_newfid,
                };
                match session.bind_walk(entry.fid, *newfid, binding) {
                    Ok(()) => {
                        if let Some(Binding::Remote { mount, remote_fid }) = previous {
                            mount.release_remote(remote_fid);
                        }
                        let mut all = prefix.clone();
                        all.extend(wqids);
                        vec![Fcall::RWalk { wqids: all }]
                    }
                    Err(e) => {
                        self.release_remote(*remote_newfid);
                        vec![Fcall::error(&e)]
                    }
                }
            }
            (Op::Walk { remote_newfid, .. }, response) => {
                self.client.fids().remove(*remote_newfid);
                vec![response]
            }
            (Op::Release { remote_fid }, response) => {
                session.forget(entry.fid);
                self.client.fids().remove(*remote_fid);
                vec![response]
            }
            (Op::Open { .. }, Fcall::ROpen { qid, .. }) => vec![Fcall::ROpen {
                qid,
                iounit: session.iounit(),
            }],
            (Op::Open { remote_fid }, Fcall::RCreate { qid, .. }) => {
                if let Err(e) = self.client.fids().rebind(*remote_fid, qid) {
                    debug!("mount: create rebind skipped: {}", e);
                }
                vec![Fcall::RCreate {
                    qid,
                    iounit: session.iounit(),
                }]
            }
            (_, response) => vec![response],
        }
    }

    /// Close a remote descriptor nobody refers to any more. The response is
    /// not awaited.
    pub(crate) fn release_remote(&self, remote_fid: u32) {
        self.client.fids().remove(remote_fid);
        if let Err(e) = self.client.mux().submit(Fcall::TClunk { fid: remote_fid }) {
            debug!("mount: cannot release remote fid {}: {}", remote_fid, e);
        }
    }
}

impl Relay for Mount {
    fn deliver(&self, out_tag: u16, response: Fcall) -> bool {
        self.inbound.fetch_add(1, Ordering::Relaxed);
        let mut table = self.lock_table();
        let Some(entry) = table.get_mut(&out_tag) else {
            warn!("mount: response for unknown outbound tag {}", out_tag);
            return true;
        };
        let mut packets = Vec::new();
        let mut consumed = false;
        if let Some(read) = entry.read.as_mut() {
            if let Fcall::RRead { data } = &response {
                let (chunks, done) = read.absorb(data);
                if !done {
                    let session = entry.session.clone();
                    let tag = entry.tag;
                    drop(table);
                    self.relay_out(&session, tag, &chunks);
                    return false;
                }
                packets = chunks;
                consumed = true;
            }
        }
        let Some(entry) = table.remove(&out_tag) else {
            return true;
        };
        drop(table);
        if !consumed {
            packets = self.complete(&entry, response);
        }
        entry.session.tags.release(entry.tag);
        self.relay_out(&entry.session, entry.tag, &packets);
        true
    }

    fn abort(&self, out_tag: u16, err: &Error) {
        let Some(entry) = self.lock_table().remove(&out_tag) else {
            return;
        };
        match entry.op {
            Op::Walk { remote_newfid, .. } => {
                self.client.fids().remove(remote_newfid);
            }
            Op::Release { remote_fid } => {
                entry.session.forget(entry.fid);
                self.client.fids().remove(remote_fid);
            }
            Op::Open { .. } | Op::Plain => {}
        }
        warn!(
            "mount: session {} tag {} aborted: {}",
            entry.session.id(),
            entry.tag,
            err
        );
        entry.session.fail(entry.tag, err.duplicate());
    }
}
