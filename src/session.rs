//! Server-side per-connection state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crossbeam_channel::Sender;
use log::{debug, info, warn};

use crate::auth::AuthState;
use crate::descriptor::DescriptorManager;
use crate::error::{Error, Result};
use crate::fcall::Fcall;
use crate::mount::Mount;
use crate::namespace::Namespace;
use crate::protocol::{IOHDRSZ, NO_FID, OREAD, ORDWR, OTRUNC, OWRITE};
use crate::resource::Resource;
use crate::tag::TagManager;

/// Connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Versioned,
    Attached,
}

/// What a session descriptor is bound to.
#[derive(Clone)]
pub(crate) enum Binding {
    Local(Arc<Resource>),
    Remote { mount: Arc<Mount>, remote_fid: u32 },
    Auth(Arc<AuthState>),
}

/// Direction a descriptor was opened for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

impl OpenMode {
    /// Decode the wire mode byte, returning the direction and the truncate
    /// flag. Read-write opens are refused.
    pub fn from_wire(mode: u8) -> Result<(Self, bool)> {
        let truncate = mode & OTRUNC != 0;
        match mode & 0x3 {
            OREAD => Ok((OpenMode::Read, truncate)),
            OWRITE => Ok((OpenMode::Write, truncate)),
            ORDWR => Err(Error::NotSupported("read-write open")),
            _ => Ok((OpenMode::Read, truncate)),
        }
    }
}

/// Transient state kept per open descriptor.
pub(crate) struct OpenState {
    pub(crate) mode: OpenMode,
    pub(crate) pending: Vec<u8>,
}

struct Identity {
    user: String,
    namespace: Option<Arc<Namespace>>,
    auth_fid: u32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One client connection as seen by the server.
pub struct Session {
    id: u64,
    state: Mutex<SessionState>,
    msize: AtomicU32,
    identity: RwLock<Identity>,
    pub(crate) descriptors: DescriptorManager<Binding>,
    pub(crate) tags: TagManager,
    vars: Mutex<HashMap<u32, OpenState>>,
    staged: Mutex<HashMap<u64, Vec<u8>>>,
    out: Mutex<Option<Sender<Vec<u8>>>>,
}

impl Session {
    pub(crate) fn new(id: u64, msize: u32, out: Sender<Vec<u8>>) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState::Uninitialized),
            msize: AtomicU32::new(msize),
            identity: RwLock::new(Identity {
                user: String::new(),
                namespace: None,
                auth_fid: NO_FID,
            }),
            descriptors: DescriptorManager::new(),
            tags: TagManager::new(),
            vars: Mutex::new(HashMap::new()),
            staged: Mutex::new(HashMap::new()),
            out: Mutex::new(Some(out)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::Acquire)
    }

    /// Largest payload a single read or write frame carries.
    pub fn iounit(&self) -> u32 {
        self.msize().saturating_sub(IOHDRSZ).max(1)
    }

    pub fn user(&self) -> String {
        match self.identity.read() {
            Ok(id) => id.user.clone(),
            Err(poisoned) => poisoned.into_inner().user.clone(),
        }
    }

    pub fn namespace(&self) -> Option<Arc<Namespace>> {
        match self.identity.read() {
            Ok(id) => id.namespace.clone(),
            Err(poisoned) => poisoned.into_inner().namespace.clone(),
        }
    }

    pub fn auth_fid(&self) -> u32 {
        match self.identity.read() {
            Ok(id) => id.auth_fid,
            Err(poisoned) => poisoned.into_inner().auth_fid,
        }
    }

    /// Start over after a version exchange: every descriptor, tag and
    /// per-open state of the previous incarnation is dropped.
    pub(crate) fn reset(&self, msize: Option<u32>) {
        self.release_bindings();
        self.tags.reset();
        lock(&self.vars).clear();
        lock(&self.staged).clear();
        match self.identity.write() {
            Ok(mut id) => {
                id.user.clear();
                id.namespace = None;
                id.auth_fid = NO_FID;
            }
            Err(poisoned) => {
                let mut id = poisoned.into_inner();
                id.user.clear();
                id.namespace = None;
                id.auth_fid = NO_FID;
            }
        }
        *lock(&self.state) = match msize {
            Some(msize) => {
                self.msize.store(msize, Ordering::Release);
                SessionState::Versioned
            }
            None => SessionState::Uninitialized,
        };
    }

    pub(crate) fn attach(&self, user: &str, namespace: Arc<Namespace>, auth_fid: u32) {
        match self.identity.write() {
            Ok(mut id) => {
                id.user = user.to_string();
                id.namespace = Some(namespace);
                id.auth_fid = auth_fid;
            }
            Err(poisoned) => {
                let mut id = poisoned.into_inner();
                id.user = user.to_string();
                id.namespace = Some(namespace);
                id.auth_fid = auth_fid;
            }
        }
        *lock(&self.state) = SessionState::Attached;
    }

    /// Queue one response frame for the connection writer.
    pub(crate) fn reply(&self, tag: u16, body: &Fcall) -> bool {
        let frame = match body.encode(tag) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("session {}: cannot encode {} reply: {}", self.id, body.verb(), e);
                match Fcall::error(&e).encode(tag) {
                    Ok(frame) => frame,
                    Err(_) => return false,
                }
            }
        };
        debug!("session {} ← tag {} {}", self.id, tag, body.verb());
        match lock(&self.out).as_ref() {
            Some(out) => out.send(frame).is_ok(),
            None => false,
        }
    }

    /// Retire the tag of a completed request and send every packet. The tag
    /// is free before the requester can see the last packet.
    pub(crate) fn finish(&self, tag: u16, packets: Vec<Fcall>) {
        self.tags.release(tag);
        for packet in &packets {
            self.reply(tag, packet);
        }
    }

    /// Retire the tag and answer with an error.
    pub(crate) fn fail(&self, tag: u16, err: Error) {
        debug!("session {} tag {} failed: {}", self.id, tag, err);
        self.tags.release(tag);
        self.reply(tag, &Fcall::error(&err));
    }

    pub(crate) fn open_mode(&self, fid: u32) -> Option<OpenMode> {
        lock(&self.vars).get(&fid).map(|state| state.mode)
    }

    pub(crate) fn set_open(&self, fid: u32, mode: OpenMode) -> Result<()> {
        let mut vars = lock(&self.vars);
        if vars.contains_key(&fid) {
            return Err(Error::AlreadyOpen);
        }
        vars.insert(
            fid,
            OpenState {
                mode,
                pending: Vec::new(),
            },
        );
        Ok(())
    }

    /// Append to the write buffer of a descriptor open for writing.
    pub(crate) fn buffer_write(&self, fid: u32, data: &[u8]) -> Result<usize> {
        let mut vars = lock(&self.vars);
        match vars.get_mut(&fid) {
            Some(state) if state.mode == OpenMode::Write => {
                state.pending.extend_from_slice(data);
                Ok(data.len())
            }
            _ => Err(Error::WrongMode("writing")),
        }
    }

    pub(crate) fn take_open(&self, fid: u32) -> Option<OpenState> {
        lock(&self.vars).remove(&fid)
    }

    /// Keep the result of a call until the next read of the same resource.
    pub(crate) fn stage(&self, path: u64, reply: Vec<u8>) {
        lock(&self.staged).insert(path, reply);
    }

    pub(crate) fn staged(&self, path: u64) -> Option<Vec<u8>> {
        lock(&self.staged).get(&path).cloned()
    }

    /// Bind the target of a walk: `newfid` is fresh unless it names the
    /// walked descriptor itself.
    pub(crate) fn bind_walk(&self, fid: u32, newfid: u32, binding: Binding) -> Result<()> {
        if newfid == fid {
            self.descriptors.rebind(fid, binding)
        } else {
            self.descriptors.map_qid(newfid, binding)
        }
    }

    /// Release a descriptor and whatever it pinned.
    pub(crate) fn forget(&self, fid: u32) -> Option<Binding> {
        self.take_open(fid);
        self.descriptors.remove(fid)
    }

    fn release_bindings(&self) {
        for (fid, binding) in self.descriptors.clear() {
            if let Binding::Remote { mount, remote_fid } = binding {
                debug!("session {}: releasing remote fid {} for {}", self.id, remote_fid, fid);
                mount.release_remote(remote_fid);
            }
        }
    }

    /// Drop all state after the connection went away. Later replies from
    /// work still queued for this session are discarded.
    pub(crate) fn teardown(&self) {
        lock(&self.out).take();
        self.reset(None);
        info!("session {} closed", self.id);
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.out).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::Fcall;
    use crossbeam_channel::unbounded;

    #[test]
    fn open_state_is_exclusive() {
        let (tx, _rx) = unbounded();
        let session = Session::new(1, 8216, tx);
        session.set_open(5, OpenMode::Write).unwrap();
        assert!(matches!(session.set_open(5, OpenMode::Read), Err(Error::AlreadyOpen)));
        assert_eq!(session.buffer_write(5, b"abc").unwrap(), 3);
        assert_eq!(session.take_open(5).unwrap().pending, b"abc");
        session.set_open(5, OpenMode::Read).unwrap();
        assert!(matches!(session.buffer_write(5, b"x"), Err(Error::WrongMode(_))));
    }

    #[test]
    fn wire_modes() {
        assert_eq!(OpenMode::from_wire(OREAD).unwrap(), (OpenMode::Read, false));
        assert_eq!(OpenMode::from_wire(OWRITE | OTRUNC).unwrap(), (OpenMode::Write, true));
        assert!(OpenMode::from_wire(ORDWR).is_err());
    }

    #[test]
    fn replies_stop_after_teardown() {
        let (tx, rx) = unbounded();
        let session = Session::new(2, 8216, tx);
        session.tags.claim(4).unwrap();
        session.finish(4, vec![Fcall::RClunk]);
        assert!(!session.tags.is_outstanding(4));
        assert_eq!(rx.try_recv().unwrap(), Fcall::RClunk.encode(4).unwrap());

        session.reset(Some(1024));
        assert_eq!(session.state(), SessionState::Versioned);
        assert_eq!(session.iounit(), 1000);

        session.teardown();
        assert!(session.is_closed());
        assert!(!session.reply(4, &Fcall::RFlush));
        assert_eq!(session.state(), SessionState::Uninitialized);
    }
}
