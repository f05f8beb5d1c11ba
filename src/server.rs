//! Server connection loop and request dispatch.
//!
//! Each connection gets a reader (the thread calling [`Server::serve`]) and a
//! writer thread draining an unbounded queue of encoded responses. Version,
//! auth, attach and flush are answered inline. Everything else is checked
//! against the session's tag and descriptor tables and then handed to the
//! worker owning the target resource, or to the mount forwarder when the
//! descriptor lives on a remote server.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::unbounded;
use log::{debug, error, info, warn};

use crate::auth::{AuthState, Authenticator, NoAuth};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fcall::{Fcall, peek_header};
use crate::message::dump_hex;
use crate::namespace::Namespace;
use crate::protocol::{MIN_MSIZE, NO_FID, Qid, VERSION_UNKNOWN};
use crate::resource::{QidPool, Reply, Resource};
use crate::session::{Binding, Session, SessionState};
use crate::transport::{Inbound, Transport, read_frame, write_frame};
use crate::worker::WorkerPool;

struct Inner {
    config: Config,
    ids: Arc<QidPool>,
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
    auth: Arc<dyn Authenticator>,
    pool: WorkerPool,
    sessions: AtomicU64,
}

/// A protocol server. Clones share namespaces and workers.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// Server without authorization and with an empty default namespace.
    pub fn new(config: Config) -> Self {
        Self::with_authenticator(config, Arc::new(NoAuth))
    }

    pub fn with_authenticator(config: Config, auth: Arc<dyn Authenticator>) -> Self {
        let ids = Arc::new(QidPool::new());
        let pool = WorkerPool::new(config.worker_count());
        let default = Arc::new(Namespace::new("", ids.clone()));
        let mut namespaces = HashMap::new();
        namespaces.insert(String::new(), default);
        info!(
            "server ready: version {}, msize {}, {} workers",
            config.version,
            config.msize,
            pool.size()
        );
        Self {
            inner: Arc::new(Inner {
                config,
                ids,
                namespaces: RwLock::new(namespaces),
                auth,
                pool,
                sessions: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The namespace attached to with an empty name.
    pub fn namespace(&self) -> Arc<Namespace> {
        self.add_namespace("")
    }

    /// Namespace attached to as `name`, created on first use.
    pub fn add_namespace(&self, name: &str) -> Arc<Namespace> {
        if let Some(ns) = self.lookup_namespace(name) {
            return ns;
        }
        let mut namespaces = match self.inner.namespaces.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        namespaces
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Namespace::new(name, self.inner.ids.clone())))
            .clone()
    }

    fn lookup_namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        let namespaces = match self.inner.namespaces.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        namespaces.get(name).cloned()
    }

    /// Serve one connection until the peer goes away.
    pub fn serve<T: Transport>(&self, stream: T) -> Result<()> {
        let mut reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        let id = self.inner.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = unbounded::<Vec<u8>>();
        let writer = thread::Builder::new()
            .name(format!("rpcfs-writer-{id}"))
            .spawn(move || {
                let mut stream = stream;
                for frame in rx.iter() {
                    if let Err(e) = write_frame(&mut stream, &frame) {
                        warn!("session {}: write failed: {}", id, e);
                        let _ = stream.shutdown();
                        break;
                    }
                }
            })?;
        let session = Arc::new(Session::new(id, self.inner.config.msize, tx));
        info!("session {} opened", id);

        let result = loop {
            match read_frame(&mut reader, session.msize()) {
                Ok(Some(Inbound::Frame(frame))) => self.dispatch(&session, &frame),
                Ok(Some(Inbound::Oversized { size, tag, .. })) => {
                    let err = Error::FrameTooLarge {
                        size,
                        limit: session.msize(),
                    };
                    warn!("session {}: {}", id, err);
                    session.reply(tag, &Fcall::error(&err));
                }
                Ok(None) => break Ok(()),
                Err(e) => {
                    warn!("session {}: connection failed: {}", id, e);
                    break Err(e);
                }
            }
        };

        session.teardown();
        if writer.join().is_err() {
            error!("session {}: writer panicked", id);
        }
        let _ = control.shutdown();
        result
    }

    /// Serve `stream` on its own thread.
    pub fn spawn<T: Transport>(&self, stream: T) -> Result<JoinHandle<Result<()>>> {
        let server = self.clone();
        let handle = thread::Builder::new()
            .name(String::from("rpcfs-session"))
            .spawn(move || server.serve(stream))?;
        Ok(handle)
    }

    fn dispatch(&self, session: &Arc<Session>, frame: &[u8]) {
        let decoded = match Fcall::decode(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    "session {}: undecodable frame ({}): {}",
                    session.id(),
                    e,
                    dump_hex(&frame[..frame.len().min(32)])
                );
                if let Ok((_, tag)) = peek_header(frame) {
                    session.reply(tag, &Fcall::error(&e));
                }
                return;
            }
        };
        let (tag, body) = (decoded.tag, decoded.body);
        debug!("session {} → tag {} {}", session.id(), tag, body.verb());
        if !body.is_request() {
            session.reply(tag, &Fcall::error(&Error::Malformed("response sent as request")));
            return;
        }
        match body {
            Fcall::TVersion { msize, version } => self.version(session, tag, msize, &version),
            Fcall::TFlush { oldtag } => {
                debug!("session {}: flush of tag {} acknowledged", session.id(), oldtag);
                session.reply(tag, &Fcall::RFlush);
            }
            Fcall::TAuth { afid, uname, aname } => {
                let result = self.auth(session, afid, &uname, &aname);
                self.answer(session, tag, result.map(|aqid| Fcall::RAuth { aqid }));
            }
            Fcall::TAttach {
                fid,
                afid,
                uname,
                aname,
            } => {
                let result = self.attach(session, fid, afid, &uname, &aname);
                self.answer(session, tag, result.map(|qid| Fcall::RAttach { qid }));
            }
            body => self.dispatch_bound(session, tag, body),
        }
    }

    fn answer(&self, session: &Session, tag: u16, result: Result<Fcall>) {
        match result {
            Ok(body) => session.reply(tag, &body),
            Err(e) => session.reply(tag, &Fcall::error(&e)),
        };
    }

    fn version(&self, session: &Session, tag: u16, msize: u32, version: &str) {
        if msize < MIN_MSIZE {
            warn!("session {}: msize {} below {}", session.id(), msize, MIN_MSIZE);
            let err = Error::Malformed("msize below the protocol minimum");
            session.reply(tag, &Fcall::error(&err));
            return;
        }
        let msize = msize.min(self.inner.config.msize);
        let ours = self.inner.config.version.as_str();
        let accepted = version == ours
            || version
                .strip_prefix(ours)
                .is_some_and(|rest| rest.starts_with('.'));
        if accepted {
            session.reset(Some(msize));
            info!("session {}: version {} msize {}", session.id(), ours, msize);
            session.reply(
                tag,
                &Fcall::RVersion {
                    msize,
                    version: ours.to_string(),
                },
            );
        } else {
            session.reset(None);
            warn!("session {}: unsupported version {:?}", session.id(), version);
            session.reply(
                tag,
                &Fcall::RVersion {
                    msize,
                    version: VERSION_UNKNOWN.to_string(),
                },
            );
        }
    }

    fn auth(&self, session: &Session, afid: u32, user: &str, aname: &str) -> Result<Qid> {
        if session.state() == SessionState::Uninitialized {
            return Err(Error::NotVersioned);
        }
        if !self.inner.auth.required() {
            return Err(Error::Auth(String::from("authentication not required")));
        }
        if self.lookup_namespace(aname).is_none() {
            return Err(Error::UnknownNamespace(aname.to_string()));
        }
        let state = Arc::new(AuthState::new(user, aname, self.inner.ids.next()));
        let aqid = state.qid();
        session.descriptors.map_qid(afid, Binding::Auth(state))?;
        debug!("session {}: auth descriptor {} for {}", session.id(), afid, user);
        Ok(aqid)
    }

    fn attach(
        &self,
        session: &Session,
        fid: u32,
        afid: u32,
        user: &str,
        aname: &str,
    ) -> Result<Qid> {
        if session.state() == SessionState::Uninitialized {
            return Err(Error::NotVersioned);
        }
        let namespace = self
            .lookup_namespace(aname)
            .ok_or_else(|| Error::UnknownNamespace(aname.to_string()))?;
        if self.inner.auth.required() {
            if afid == NO_FID {
                return Err(Error::Auth(String::from("authorization descriptor required")));
            }
            match session.descriptors.get_resource(afid)? {
                Binding::Auth(state) => self.inner.auth.verify(&state, user, aname)?,
                _ => return Err(Error::Auth(format!("descriptor {afid} is not for authorization"))),
            }
        }
        let root = namespace.root();
        session
            .descriptors
            .map_qid(fid, Binding::Local(root.clone()))?;
        session.attach(user, namespace, afid);
        info!("session {}: attached as {} to {:?}", session.id(), user, aname);
        Ok(root.qid())
    }

    fn dispatch_bound(&self, session: &Arc<Session>, tag: u16, body: Fcall) {
        let fid = body.fid().unwrap_or(NO_FID);
        let binding = session.descriptors.get_resource(fid);
        // Before attach only the auth exchange may use a descriptor.
        match (session.state(), &binding) {
            (SessionState::Attached, _) | (SessionState::Versioned, Ok(Binding::Auth(_))) => {}
            (SessionState::Uninitialized, _) => {
                session.reply(tag, &Fcall::error(&Error::NotVersioned));
                return;
            }
            (SessionState::Versioned, _) => {
                session.reply(tag, &Fcall::error(&Error::NotAttached));
                return;
            }
        }
        if let Err(e) = session.tags.claim(tag) {
            warn!("session {}: {}", session.id(), e);
            session.reply(tag, &Fcall::error(&e));
            return;
        }
        let binding = match binding {
            Ok(binding) => binding,
            Err(e) => return session.fail(tag, e),
        };
        match binding {
            Binding::Local(resource) => {
                let key = resource.qid().path;
                let job_session = session.clone();
                let queued = self.inner.pool.submit(key, move || {
                    run_local(&job_session, tag, fid, &resource, body)
                });
                if !queued {
                    session.fail(tag, Error::ConnectionReset(String::from("worker pool stopped")));
                }
            }
            Binding::Remote { mount, remote_fid } => {
                if let Err(e) = mount.forward(session, tag, fid, remote_fid, body) {
                    session.fail(tag, e);
                }
            }
            Binding::Auth(state) => self.auth_io(session, tag, &state, body),
        }
    }

    fn auth_io(&self, session: &Session, tag: u16, state: &AuthState, body: Fcall) {
        let result = match body {
            Fcall::TWrite { data, .. } => self
                .inner
                .auth
                .write(state, &data)
                .map(|count| vec![Fcall::RWrite { count: count as u32 }]),
            Fcall::TRead { .. } => Ok(vec![Fcall::RRead { data: Vec::new() }]),
            Fcall::TOpen { .. } => Ok(vec![Fcall::ROpen {
                qid: state.qid(),
                iounit: session.iounit(),
            }]),
            Fcall::TClunk { fid } => {
                session.forget(fid);
                Ok(vec![Fcall::RClunk])
            }
            other => Err(Error::NotSupported(other.verb())),
        };
        match result {
            Ok(packets) => session.finish(tag, packets),
            Err(e) => session.fail(tag, e),
        }
    }
}

/// Worker side of a local request. A close or walk queued ahead of this
/// request may have released or rebound `fid` since the reader resolved it.
fn run_local(session: &Arc<Session>, tag: u16, fid: u32, resource: &Arc<Resource>, body: Fcall) {
    if session.is_closed() {
        debug!("session {}: dropping tag {} after close", session.id(), tag);
        return;
    }
    match session.descriptors.get_resource(fid) {
        Ok(Binding::Local(current)) if Arc::ptr_eq(&current, resource) => {}
        _ => return session.fail(tag, Error::InvalidDescriptor(fid)),
    }
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| resource.handle(session, tag, body)));
    match outcome {
        Ok(Ok(Reply::Now(packets))) => session.finish(tag, packets),
        Ok(Ok(Reply::Forwarded)) => {}
        Ok(Err(e)) => session.fail(tag, e),
        Err(_) => {
            error!("session {}: handler for tag {} panicked", session.id(), tag);
            session.fail(tag, Error::InvalidResource);
        }
    }
}
