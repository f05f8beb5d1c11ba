//! In-memory resource tree and the verb handlers behind it.
//!
//! Every node is a [`Resource`]: a plain data file, a method file, a
//! directory, or a mount point grafting a remote tree. All verbs go through
//! [`Resource::handle`], which refuses anything a kind does not implement.
//!
//! Locks are only ever taken in the order children → meta → content, and no
//! resource lock is held while calling into another resource except a
//! directory's children lock around reads of its children's metadata.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::fcall::{Fcall, read_chunks};
use crate::mount::Mount;
use crate::parse::valid_name;
use crate::protocol::{DMAPPEND, DMDIR, DMEXCL, DMMOUNT, DMTMP, Qid, QidType};
use crate::rpc::Method;
use crate::session::{Binding, OpenMode, Session};
use crate::stat::{STAT_FIXED_SIZE, Stat};

/// Largest data file the tree holds. Writes and length changes past it are
/// refused before any memory is reserved.
pub const MAX_FILE_LENGTH: u64 = 64 << 20;

fn checked_length(length: u64) -> Result<usize> {
    if length > MAX_FILE_LENGTH {
        return Err(Error::FileTooLarge(length));
    }
    usize::try_from(length).map_err(|_| Error::FileTooLarge(length))
}

/// Source of process-unique QID paths, shared by every namespace of a
/// server.
#[derive(Debug)]
pub struct QidPool {
    next: AtomicU64,
}

impl QidPool {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for QidPool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
struct Meta {
    name: String,
    uid: String,
    gid: String,
    muid: String,
    mode: u32,
    atime: u32,
    mtime: u32,
}

impl Meta {
    fn entry_size(&self, name: &str) -> usize {
        STAT_FIXED_SIZE + name.len() + self.uid.len() + self.gid.len() + self.muid.len()
    }
}

pub(crate) enum Content {
    Data(Vec<u8>),
    Rpc(Arc<Method>),
}

enum Kind {
    File(Mutex<Content>),
    Directory(RwLock<BTreeMap<String, Arc<Resource>>>),
    Mount(Arc<Mount>),
}

/// Outcome of a locally handled request.
pub(crate) enum Reply {
    /// Response packets to send under the request's tag.
    Now(Vec<Fcall>),
    /// The request went to a remote server; the forwarder answers it.
    Forwarded,
}

/// One node of a namespace.
pub struct Resource {
    path: u64,
    version: AtomicU32,
    meta: RwLock<Meta>,
    parent: RwLock<Weak<Resource>>,
    kind: Kind,
    valid: AtomicBool,
    ids: Arc<QidPool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Byte range `[offset, offset + count)` clipped to `data`.
fn window(data: &[u8], offset: u64, count: u32) -> &[u8] {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
    let end = start + (count as usize).min(data.len() - start);
    &data[start..end]
}

impl Resource {
    fn build(ids: &Arc<QidPool>, name: &str, owner: &str, mode: u32, kind: Kind) -> Arc<Self> {
        let ts = now();
        Arc::new(Self {
            path: ids.next(),
            version: AtomicU32::new(0),
            meta: RwLock::new(Meta {
                name: name.to_string(),
                uid: owner.to_string(),
                gid: owner.to_string(),
                muid: owner.to_string(),
                mode,
                atime: ts,
                mtime: ts,
            }),
            parent: RwLock::new(Weak::new()),
            kind,
            valid: AtomicBool::new(true),
            ids: ids.clone(),
        })
    }

    pub(crate) fn directory(ids: &Arc<QidPool>, name: &str, owner: &str, perm: u32) -> Arc<Self> {
        let kind = Kind::Directory(RwLock::new(BTreeMap::new()));
        Self::build(ids, name, owner, DMDIR | (perm & 0o777), kind)
    }

    pub(crate) fn file(
        ids: &Arc<QidPool>,
        name: &str,
        owner: &str,
        perm: u32,
        data: Vec<u8>,
    ) -> Arc<Self> {
        let mode = perm & (0o777 | DMAPPEND | DMEXCL | DMTMP);
        Self::build(ids, name, owner, mode, Kind::File(Mutex::new(Content::Data(data))))
    }

    pub(crate) fn method(ids: &Arc<QidPool>, owner: &str, method: Arc<Method>) -> Arc<Self> {
        let name = method.name().to_string();
        Self::build(ids, &name, owner, 0o666, Kind::File(Mutex::new(Content::Rpc(method))))
    }

    pub(crate) fn mount_point(
        ids: &Arc<QidPool>,
        name: &str,
        owner: &str,
        mount: Arc<Mount>,
    ) -> Arc<Self> {
        Self::build(ids, name, owner, DMDIR | DMMOUNT | 0o755, Kind::Mount(mount))
    }

    pub fn qid(&self) -> Qid {
        Qid::new(
            QidType::from_mode(self.mode()),
            self.version.load(Ordering::Acquire),
            self.path,
        )
    }

    pub fn name(&self) -> String {
        read(&self.meta).name.clone()
    }

    pub fn mode(&self) -> u32 {
        read(&self.meta).mode
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, Kind::Directory(_))
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn mount(&self) -> Option<&Arc<Mount>> {
        match &self.kind {
            Kind::Mount(mount) => Some(mount),
            _ => None,
        }
    }

    pub fn parent(&self) -> Option<Arc<Resource>> {
        read(&self.parent).upgrade()
    }

    /// Wire size of this resource's stat record.
    pub fn encoded_size(&self) -> usize {
        let meta = read(&self.meta);
        meta.entry_size(&meta.name)
    }

    fn invalidate(&self, why: &str) -> Error {
        warn!("resource {} marked invalid: {}", self.path, why);
        self.valid.store(false, Ordering::Release);
        Error::InvalidResource
    }

    fn length(&self) -> Result<u64> {
        match &self.kind {
            Kind::File(content) => match &*lock(content) {
                Content::Data(data) => Ok(data.len() as u64),
                Content::Rpc(_) => Ok(0),
            },
            Kind::Directory(children) => {
                let parent_entry = match self.parent() {
                    Some(parent) => read(&parent.meta).entry_size(".."),
                    None => read(&self.meta).entry_size(".."),
                };
                let children = read(children);
                let mut total = parent_entry as u64;
                for child in children.values() {
                    total = total
                        .checked_add(child.encoded_size() as u64)
                        .ok_or_else(|| self.invalidate("directory length overflow"))?;
                }
                Ok(total)
            }
            Kind::Mount(_) => Ok(0),
        }
    }

    /// Current metadata snapshot.
    pub fn stat(&self) -> Result<Stat> {
        if !self.is_valid() {
            return Err(Error::InvalidResource);
        }
        let length = self.length()?;
        let meta = read(&self.meta).clone();
        Ok(Stat {
            type_: 0,
            dev: 0,
            qid: self.qid(),
            mode: meta.mode,
            atime: meta.atime,
            mtime: meta.mtime,
            length,
            name: meta.name,
            uid: meta.uid,
            gid: meta.gid,
            muid: meta.muid,
        })
    }

    /// Children in name order.
    pub fn children(&self) -> Vec<Arc<Resource>> {
        match &self.kind {
            Kind::Directory(children) => read(children).values().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Resolve one walk step.
    pub fn child(self: &Arc<Self>, name: &str) -> Result<Arc<Resource>> {
        let Kind::Directory(children) = &self.kind else {
            return Err(Error::NotADirectory);
        };
        match name {
            "." => Ok(self.clone()),
            ".." => Ok(self.parent().unwrap_or_else(|| self.clone())),
            _ => read(children)
                .get(name)
                .cloned()
                .ok_or_else(|| Error::NotFound(name.to_string())),
        }
    }

    /// Serialized directory listing: the parent entry followed by every
    /// child in name order.
    pub fn listing(&self) -> Result<Vec<u8>> {
        let Kind::Directory(children) = &self.kind else {
            return Err(Error::NotADirectory);
        };
        let parent = match self.parent() {
            Some(parent) => parent.stat()?,
            None => self.stat()?,
        };
        let snapshot: Vec<Arc<Resource>> = read(children).values().cloned().collect();
        let mut buf = Vec::new();
        parent.renamed("..").encode_into(&mut buf)?;
        for child in snapshot {
            child.stat()?.encode_into(&mut buf)?;
        }
        Ok(buf)
    }

    pub(crate) fn attach_child(self: &Arc<Self>, child: Arc<Resource>) -> Result<()> {
        let Kind::Directory(children) = &self.kind else {
            return Err(Error::NotADirectory);
        };
        let name = child.name();
        {
            let mut children = write(children);
            if children.contains_key(&name) {
                return Err(Error::Exists(name));
            }
            *write(&child.parent) = Arc::downgrade(self);
            children.insert(name, child);
        }
        self.touch(None);
        Ok(())
    }

    pub(crate) fn detach_child(&self, name: &str) -> Result<Arc<Resource>> {
        let Kind::Directory(children) = &self.kind else {
            return Err(Error::NotADirectory);
        };
        let child = write(children)
            .remove(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        *write(&child.parent) = Weak::new();
        self.touch(None);
        Ok(child)
    }

    fn rename_child(&self, old: &str, new: &str) -> Result<()> {
        let Kind::Directory(children) = &self.kind else {
            return Err(Error::NotADirectory);
        };
        {
            let mut children = write(children);
            if children.contains_key(new) {
                return Err(Error::Exists(new.to_string()));
            }
            let child = children
                .remove(old)
                .ok_or_else(|| Error::NotFound(old.to_string()))?;
            write(&child.meta).name = new.to_string();
            children.insert(new.to_string(), child);
        }
        self.touch(None);
        Ok(())
    }

    /// Record a content change: new QID version and modification time.
    fn touch(&self, user: Option<&str>) {
        self.version.fetch_add(1, Ordering::AcqRel);
        let mut meta = write(&self.meta);
        meta.mtime = now();
        if let Some(user) = user {
            meta.muid = user.to_string();
        }
    }

    /// Serve one request against this resource. `Err` becomes an error
    /// response carrying the request's tag.
    pub(crate) fn handle(
        self: &Arc<Self>,
        session: &Arc<Session>,
        tag: u16,
        request: Fcall,
    ) -> Result<Reply> {
        let packets = match (&self.kind, request) {
            (_, Fcall::TWalk { fid, newfid, wnames }) => {
                return self.walk(session, tag, fid, newfid, wnames);
            }
            (_, Fcall::TStat { .. }) => vec![Fcall::RStat { stat: self.stat()? }],
            (_, Fcall::TClunk { fid }) => self.clunk(session, fid),
            (_, Fcall::TRemove { fid }) => self.remove(session, fid)?,
            (_, Fcall::TWstat { stat, .. }) => self.wstat(session, stat)?,
            (Kind::Mount(_), request) => return Err(Error::NotSupported(request.verb())),
            (_, Fcall::TOpen { fid, mode }) => self.open(session, fid, mode)?,
            (Kind::Directory(_), Fcall::TCreate { fid, name, perm, mode }) => {
                self.create(session, fid, &name, perm, mode)?
            }
            (_, Fcall::TRead { fid, offset, count }) => self.read(session, fid, offset, count)?,
            (Kind::Directory(_), Fcall::TWrite { .. }) => return Err(Error::WriteToDirectory),
            (Kind::File(_), Fcall::TWrite { fid, offset, data }) => {
                self.write(session, fid, offset, &data)?
            }
            (_, request) => return Err(Error::NotSupported(request.verb())),
        };
        Ok(Reply::Now(packets))
    }

    fn walk(
        self: &Arc<Self>,
        session: &Arc<Session>,
        tag: u16,
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    ) -> Result<Reply> {
        if session.open_mode(fid).is_some() {
            return Err(Error::AlreadyOpen);
        }
        if newfid != fid && session.descriptors.valid_descriptor(newfid) {
            return Err(Error::DescriptorInUse(newfid));
        }
        let mut current = self.clone();
        let mut wqids = Vec::with_capacity(wnames.len());
        for (idx, name) in wnames.iter().enumerate() {
            if let Some(mount) = current.mount() {
                let rest = wnames[idx..].to_vec();
                mount.forward_walk(session, tag, fid, newfid, wqids, rest)?;
                return Ok(Reply::Forwarded);
            }
            let next = current.child(name)?;
            wqids.push(next.qid());
            current = next;
        }
        if let Some(mount) = current.mount() {
            mount.forward_walk(session, tag, fid, newfid, wqids, Vec::new())?;
            return Ok(Reply::Forwarded);
        }
        session.bind_walk(fid, newfid, Binding::Local(current))?;
        Ok(Reply::Now(vec![Fcall::RWalk { wqids }]))
    }

    fn open(&self, session: &Session, fid: u32, mode: u8) -> Result<Vec<Fcall>> {
        let (mode, truncate) = OpenMode::from_wire(mode)?;
        if self.is_dir() && mode == OpenMode::Write {
            return Err(Error::WriteToDirectory);
        }
        session.set_open(fid, mode)?;
        if truncate && mode == OpenMode::Write {
            let truncated = match &self.kind {
                Kind::File(content) => match &mut *lock(content) {
                    Content::Data(data) => {
                        data.clear();
                        true
                    }
                    Content::Rpc(_) => false,
                },
                _ => false,
            };
            if truncated {
                self.touch(Some(&session.user()));
            }
        }
        Ok(vec![Fcall::ROpen {
            qid: self.qid(),
            iounit: session.iounit(),
        }])
    }

    fn read(&self, session: &Session, fid: u32, offset: u64, count: u32) -> Result<Vec<Fcall>> {
        if session.open_mode(fid) != Some(OpenMode::Read) {
            return Err(Error::WrongMode("reading"));
        }
        let data = match &self.kind {
            Kind::Directory(_) => window(&self.listing()?, offset, count).to_vec(),
            Kind::File(content) => match &*lock(content) {
                Content::Data(data) => window(data, offset, count).to_vec(),
                Content::Rpc(_) => {
                    let staged = session.staged(self.path).unwrap_or_default();
                    window(&staged, offset, count).to_vec()
                }
            },
            Kind::Mount(_) => return Err(Error::NotSupported("read")),
        };
        if !self.is_dir() {
            write(&self.meta).atime = now();
        }
        Ok(read_chunks(&data, count, session.iounit())
            .into_iter()
            .map(|chunk| Fcall::RRead {
                data: chunk.to_vec(),
            })
            .collect())
    }

    fn write(&self, session: &Session, fid: u32, offset: u64, data: &[u8]) -> Result<Vec<Fcall>> {
        if session.open_mode(fid) != Some(OpenMode::Write) {
            return Err(Error::WrongMode("writing"));
        }
        let Kind::File(content) = &self.kind else {
            return Err(Error::WriteToDirectory);
        };
        let append = self.mode() & DMAPPEND != 0;
        let stored = {
            let mut content = lock(content);
            match &mut *content {
                Content::Rpc(_) => None,
                Content::Data(bytes) => {
                    let at = if append { bytes.len() as u64 } else { offset };
                    let end = at
                        .checked_add(data.len() as u64)
                        .ok_or(Error::FileTooLarge(u64::MAX))?;
                    let end = checked_length(end)?;
                    let at = end - data.len();
                    if bytes.len() < end {
                        bytes.resize(end, 0);
                    }
                    bytes[at..end].copy_from_slice(data);
                    Some(data.len())
                }
            }
        };
        let count = match stored {
            Some(count) => {
                self.touch(Some(&session.user()));
                count
            }
            None => session.buffer_write(fid, data)?,
        };
        Ok(vec![Fcall::RWrite {
            count: count as u32,
        }])
    }

    fn clunk(&self, session: &Session, fid: u32) -> Vec<Fcall> {
        let state = session.take_open(fid);
        session.forget(fid);
        let buffered = match state {
            Some(state) if state.mode == OpenMode::Write && !state.pending.is_empty() => {
                state.pending
            }
            _ => return vec![Fcall::RClunk],
        };
        let method = match &self.kind {
            Kind::File(content) => match &*lock(content) {
                Content::Rpc(method) => Some(method.clone()),
                Content::Data(_) => None,
            },
            _ => None,
        };
        if let Some(method) = method {
            debug!("session {}: invoking {} on close", session.id(), method.name());
            session.stage(self.path, method.dispatch(&buffered));
        }
        vec![Fcall::RClunk]
    }

    fn remove(&self, session: &Session, fid: u32) -> Result<Vec<Fcall>> {
        session.forget(fid);
        let Some(parent) = self.parent() else {
            return Err(Error::NotSupported("removing the root"));
        };
        if let Kind::Directory(children) = &self.kind {
            if !read(children).is_empty() {
                return Err(Error::NotEmpty);
            }
        }
        parent.detach_child(&self.name())?;
        Ok(vec![Fcall::RRemove])
    }

    fn wstat(&self, session: &Session, stat: Stat) -> Result<Vec<Fcall>> {
        let current = read(&self.meta).clone();
        if stat.mode != u32::MAX && (stat.mode & DMDIR) != (current.mode & DMDIR) {
            return Err(Error::NotSupported("changing the directory bit"));
        }
        let resize = if stat.length == u64::MAX {
            None
        } else {
            match &self.kind {
                Kind::File(content) if matches!(&*lock(content), Content::Data(_)) => {
                    Some(checked_length(stat.length)?)
                }
                _ => return Err(Error::NotSupported("setting the length")),
            }
        };
        if !stat.name.is_empty() && stat.name != current.name {
            if !valid_name(&stat.name) {
                return Err(Error::InvalidName(stat.name));
            }
            match self.parent() {
                Some(parent) => parent.rename_child(&current.name, &stat.name)?,
                None => return Err(Error::NotSupported("renaming the root")),
            }
        }
        if let (Some(len), Kind::File(content)) = (resize, &self.kind) {
            if let Content::Data(data) = &mut *lock(content) {
                data.resize(len, 0);
            }
            self.touch(Some(&session.user()));
        }
        let mut meta = write(&self.meta);
        if stat.mode != u32::MAX {
            let keep = DMDIR | DMMOUNT;
            meta.mode = (meta.mode & keep) | (stat.mode & !keep);
        }
        if stat.mtime != u32::MAX {
            meta.mtime = stat.mtime;
        }
        if !stat.gid.is_empty() {
            meta.gid = stat.gid;
        }
        Ok(vec![Fcall::RWstat])
    }

    fn create(
        self: &Arc<Self>,
        session: &Session,
        fid: u32,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> Result<Vec<Fcall>> {
        if session.open_mode(fid).is_some() {
            return Err(Error::AlreadyOpen);
        }
        if !valid_name(name) {
            return Err(Error::InvalidName(name.to_string()));
        }
        let (open_mode, _) = OpenMode::from_wire(mode)?;
        let user = session.user();
        let child = if perm & DMDIR != 0 {
            if open_mode == OpenMode::Write {
                return Err(Error::WriteToDirectory);
            }
            Resource::directory(&self.ids, name, &user, perm)
        } else {
            Resource::file(&self.ids, name, &user, perm, Vec::new())
        };
        self.attach_child(child.clone())?;
        session.descriptors.rebind(fid, Binding::Local(child.clone()))?;
        session.set_open(fid, open_mode)?;
        debug!("session {}: created {} under {}", session.id(), name, self.path);
        Ok(vec![Fcall::RCreate {
            qid: child.qid(),
            iounit: session.iounit(),
        }])
    }
}
