//! Client session and high-level operations.

use std::sync::{Mutex, MutexGuard};

use log::{info, warn};
use serde_json::Value;

use crate::config::Config;
use crate::descriptor::DescriptorManager;
use crate::error::{Error, Result};
use crate::fcall::{Fcall, write_chunks};
use crate::mux::{Multiplexer, ResponseFuture};
use crate::parse::{parse_dir_entries, path_parts, split_parent_name};
use crate::protocol::*;
use crate::rpc::{Call, Return};
use crate::stat::Stat;
use crate::transport::Transport;

/// IO units requested per read when draining a whole file.
const READ_AHEAD_UNITS: u32 = 16;

fn unexpected(response: &Fcall, expected: u8) -> Error {
    Error::UnexpectedType {
        got: response.msg_type(),
        expected,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A single client connection.
///
/// Every method may be called from several threads at once; requests share
/// the connection through the multiplexer.
pub struct Client {
    mux: Multiplexer,
    fids: DescriptorManager<Qid>,
    root: Mutex<Option<(u32, Qid)>>,
    version: Mutex<String>,
    config: Config,
}

impl Client {
    /// Start the multiplexer over `stream` without any handshake.
    pub fn new<T: Transport>(stream: T, config: Config) -> Result<Self> {
        let mux = Multiplexer::start(stream, config.msize, config.watchdog())?;
        Ok(Self {
            mux,
            fids: DescriptorManager::new(),
            root: Mutex::new(None),
            version: Mutex::new(String::from(VERSION_UNKNOWN)),
            config,
        })
    }

    /// Connect, negotiate the version and attach as configured.
    pub fn connect<T: Transport>(stream: T, config: Config) -> Result<Self> {
        let client = Self::new(stream, config)?;
        client.negotiate()?;
        Ok(client)
    }

    /// Negotiate protocol version and attach to the server root.
    pub fn negotiate(&self) -> Result<Qid> {
        let (msize, version) = self.version(self.config.msize, &self.config.version)?;
        if version == VERSION_UNKNOWN {
            warn!("RVERSION not accepted (req={}, resp={})", self.config.version, version);
            return Err(Error::NotVersioned);
        }
        info!("negotiated {} with msize {}", version, msize);
        let user = self.config.user.clone();
        let namespace = self.config.namespace.clone();
        self.attach(None, &user, &namespace)
    }

    pub fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn fids(&self) -> &DescriptorManager<Qid> {
        &self.fids
    }

    pub fn iounit(&self) -> u32 {
        self.mux.iounit()
    }

    pub fn negotiated_version(&self) -> String {
        lock(&self.version).clone()
    }

    /// Root descriptor and QID from the last attach.
    pub fn root(&self) -> Result<(u32, Qid)> {
        lock(&self.root).ok_or(Error::NotAttached)
    }

    pub fn root_fid(&self) -> Result<u32> {
        self.root().map(|(fid, _)| fid)
    }

    /// Exchange versions. All descriptors of an earlier exchange are gone
    /// afterwards.
    pub fn version(&self, msize: u32, version: &str) -> Result<(u32, String)> {
        let request = Fcall::TVersion {
            msize,
            version: version.to_string(),
        };
        match self.mux.rpc(request)? {
            Fcall::RVersion {
                msize: granted,
                version,
            } => {
                let msize = granted.min(msize).max(MIN_MSIZE);
                self.mux.set_msize(msize);
                self.fids.clear();
                *lock(&self.root) = None;
                *lock(&self.version) = version.clone();
                Ok((msize, version))
            }
            other => Err(unexpected(&other, RVERSION)),
        }
    }

    /// Open an authorization descriptor for `user`.
    pub fn auth(&self, user: &str, namespace: &str) -> Result<(u32, Qid)> {
        let afid = self.fids.generate_descriptor()?;
        let request = Fcall::TAuth {
            afid,
            uname: user.to_string(),
            aname: namespace.to_string(),
        };
        match self.mux.rpc(request) {
            Ok(Fcall::RAuth { aqid }) => {
                self.fids.map_qid(afid, aqid)?;
                Ok((afid, aqid))
            }
            Ok(other) => {
                self.fids.remove(afid);
                Err(unexpected(&other, RAUTH))
            }
            Err(e) => {
                self.fids.remove(afid);
                Err(e)
            }
        }
    }

    /// Attach to `namespace` as `user`, optionally proving identity with an
    /// authorization descriptor.
    pub fn attach(&self, afid: Option<u32>, user: &str, namespace: &str) -> Result<Qid> {
        let fid = self.fids.generate_descriptor()?;
        let request = Fcall::TAttach {
            fid,
            afid: afid.unwrap_or(NO_FID),
            uname: user.to_string(),
            aname: namespace.to_string(),
        };
        match self.mux.rpc(request) {
            Ok(Fcall::RAttach { qid }) => {
                self.fids.map_qid(fid, qid)?;
                *lock(&self.root) = Some((fid, qid));
                Ok(qid)
            }
            Ok(other) => {
                self.fids.remove(fid);
                Err(unexpected(&other, RATTACH))
            }
            Err(e) => {
                self.fids.remove(fid);
                Err(e)
            }
        }
    }

    /// Walk `names` from `fid` onto a fresh descriptor. The walk succeeds
    /// only if every name resolves.
    pub fn walk(&self, fid: u32, names: &[&str]) -> Result<(u32, Vec<Qid>)> {
        let newfid = self.fids.generate_descriptor()?;
        let request = Fcall::TWalk {
            fid,
            newfid,
            wnames: names.iter().map(|name| name.to_string()).collect(),
        };
        let wqids = match self.mux.rpc(request) {
            Ok(Fcall::RWalk { wqids }) if wqids.len() == names.len() => wqids,
            Ok(Fcall::RWalk { .. }) => {
                self.fids.remove(newfid);
                return Err(Error::NotFound(names.join("/")));
            }
            Ok(other) => {
                self.fids.remove(newfid);
                return Err(unexpected(&other, RWALK));
            }
            Err(e) => {
                self.fids.remove(newfid);
                return Err(e);
            }
        };
        let qid = match wqids.last() {
            Some(qid) => *qid,
            None => self.fids.get_resource(fid)?,
        };
        self.fids.map_qid(newfid, qid)?;
        Ok((newfid, wqids))
    }

    /// Walk an absolute path from the root.
    pub fn walk_path(&self, path: &str) -> Result<(u32, Qid)> {
        let (root_fid, root_qid) = self.root()?;
        let names = path_parts(path);
        let (fid, qids) = self.walk(root_fid, &names)?;
        Ok((fid, qids.last().copied().unwrap_or(root_qid)))
    }

    /// Open `fid`; returns the QID and the server's IO unit.
    pub fn open(&self, fid: u32, mode: u8) -> Result<(Qid, u32)> {
        match self.mux.rpc(Fcall::TOpen { fid, mode })? {
            Fcall::ROpen { qid, iounit } => Ok((qid, iounit)),
            other => Err(unexpected(&other, ROPEN)),
        }
    }

    /// Create `name` in the directory `fid`, which then refers to the new
    /// entry, opened with `mode`.
    pub fn create(&self, fid: u32, name: &str, perm: u32, mode: u8) -> Result<(Qid, u32)> {
        let request = Fcall::TCreate {
            fid,
            name: name.to_string(),
            perm,
            mode,
        };
        match self.mux.rpc(request)? {
            Fcall::RCreate { qid, iounit } => {
                self.fids.rebind(fid, qid)?;
                Ok((qid, iounit))
            }
            other => Err(unexpected(&other, RCREATE)),
        }
    }

    /// Read up to `count` bytes, returning every response packet.
    pub fn read_packets(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<Vec<u8>>> {
        let packets = self
            .mux
            .submit(Fcall::TRead { fid, offset, count })?
            .wait()?;
        packets
            .into_iter()
            .map(|packet| match packet {
                Fcall::RRead { data } => Ok(data),
                other => Err(unexpected(&other, RREAD)),
            })
            .collect()
    }

    /// Read up to `count` bytes; large counts arrive as several packets.
    pub fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        Ok(self.read_packets(fid, offset, count)?.concat())
    }

    /// Write `data` at `offset`, split into IO-unit frames that are all in
    /// flight at once. Returns the number of bytes written.
    pub fn write(&self, fid: u32, offset: u64, data: &[u8]) -> Result<usize> {
        let mut in_flight: Vec<(usize, usize, ResponseFuture)> = Vec::new();
        let mut start = 0usize;
        for request in write_chunks(fid, offset, data, self.iounit()) {
            let len = match &request {
                Fcall::TWrite { data, .. } => data.len(),
                _ => 0,
            };
            in_flight.push((start, len, self.mux.submit(request)?));
            start += len;
        }
        let mut written = 0usize;
        for (start, len, future) in in_flight {
            let count = match future.wait_one()? {
                Fcall::RWrite { count } => (count as usize).min(len),
                other => return Err(unexpected(&other, RWRITE)),
            };
            written += count;
            if count < len {
                let at = offset + (start + count) as u64;
                written += self.write_rest(fid, at, &data[start + count..start + len])?;
            }
        }
        Ok(written)
    }

    fn write_rest(&self, fid: u32, mut offset: u64, mut data: &[u8]) -> Result<usize> {
        let mut written = 0;
        while !data.is_empty() {
            let request = Fcall::TWrite {
                fid,
                offset,
                data: data.to_vec(),
            };
            let count = match self.mux.rpc(request)? {
                Fcall::RWrite { count } => (count as usize).min(data.len()),
                other => return Err(unexpected(&other, RWRITE)),
            };
            if count == 0 {
                return Err(Error::Io(std::io::ErrorKind::WriteZero.into()));
            }
            written += count;
            offset += count as u64;
            data = &data[count..];
        }
        Ok(written)
    }

    /// Release `fid`. It is forgotten locally even if the server objects.
    pub fn clunk(&self, fid: u32) -> Result<()> {
        let response = self.mux.rpc(Fcall::TClunk { fid });
        self.fids.remove(fid);
        match response? {
            Fcall::RClunk => Ok(()),
            other => Err(unexpected(&other, RCLUNK)),
        }
    }

    /// Remove the entry behind `fid` and release the descriptor.
    pub fn remove(&self, fid: u32) -> Result<()> {
        let response = self.mux.rpc(Fcall::TRemove { fid });
        self.fids.remove(fid);
        match response? {
            Fcall::RRemove => Ok(()),
            other => Err(unexpected(&other, RREMOVE)),
        }
    }

    pub fn stat(&self, fid: u32) -> Result<Stat> {
        match self.mux.rpc(Fcall::TStat { fid })? {
            Fcall::RStat { stat } => Ok(stat),
            other => Err(unexpected(&other, RSTAT)),
        }
    }

    pub fn wstat(&self, fid: u32, stat: &Stat) -> Result<()> {
        let request = Fcall::TWstat {
            fid,
            stat: stat.clone(),
        };
        match self.mux.rpc(request)? {
            Fcall::RWstat => Ok(()),
            other => Err(unexpected(&other, RWSTAT)),
        }
    }

    /// Ask the server to forget `oldtag`.
    pub fn flush(&self, oldtag: u16) -> Result<()> {
        match self.mux.rpc(Fcall::TFlush { oldtag })? {
            Fcall::RFlush => Ok(()),
            other => Err(unexpected(&other, RFLUSH)),
        }
    }

    /// Run `op` on `fid`, then release it. An error from `op` wins over an
    /// error from the release.
    fn scoped<R>(&self, fid: u32, op: impl FnOnce(u32) -> Result<R>) -> Result<R> {
        let out = op(fid);
        let released = self.clunk(fid);
        let out = out?;
        released?;
        Ok(out)
    }

    fn read_all(&self, fid: u32) -> Result<Vec<u8>> {
        let step = self.iounit().saturating_mul(READ_AHEAD_UNITS);
        let mut offset = 0u64;
        let mut data = Vec::new();
        loop {
            let chunk = self.read(fid, offset, step)?;
            offset += chunk.len() as u64;
            let short = chunk.len() < step as usize;
            data.extend(chunk);
            if short {
                return Ok(data);
            }
        }
    }

    /// List directory entries at the provided path.
    pub fn list_dir(&self, path: &str) -> Result<Vec<Stat>> {
        let (fid, qid) = self.walk_path(path)?;
        if !qid.is_dir() {
            self.clunk(fid)?;
            return Err(Error::NotADirectory);
        }
        let data = self.scoped(fid, |fid| {
            self.open(fid, OREAD)?;
            self.read_all(fid)
        })?;
        let mut entries = Vec::new();
        parse_dir_entries(&data, &mut entries)?;
        Ok(entries)
    }

    /// Ensure the path points to a directory.
    pub fn ensure_dir(&self, path: &str) -> Result<()> {
        let (fid, qid) = self.walk_path(path)?;
        self.clunk(fid)?;
        if qid.is_dir() {
            Ok(())
        } else {
            Err(Error::NotADirectory)
        }
    }

    /// Create a directory at `path`.
    pub fn create_dir(&self, path: &str) -> Result<Qid> {
        let (parent, name) = split_parent_name(path)?;
        let (fid, qid) = self.walk_path(parent)?;
        if !qid.is_dir() {
            self.clunk(fid)?;
            return Err(Error::NotADirectory);
        }
        self.scoped(fid, |fid| {
            self.create(fid, name, DMDIR | 0o755, OREAD)
                .map(|(qid, _)| qid)
        })
    }

    /// Read a whole file.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let (fid, _) = self.walk_path(path)?;
        self.scoped(fid, |fid| {
            self.open(fid, OREAD)?;
            self.read_all(fid)
        })
    }

    /// Replace the contents of `path`, creating the file if needed.
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<usize> {
        let fid = match self.walk_path(path) {
            Ok((fid, _)) => {
                if let Err(e) = self.open(fid, OWRITE | OTRUNC) {
                    let _ = self.clunk(fid);
                    return Err(e);
                }
                fid
            }
            Err(e) if e.is_not_found() => {
                let (parent, name) = split_parent_name(path)?;
                let (fid, _) = self.walk_path(parent)?;
                if let Err(e) = self.create(fid, name, 0o644, OWRITE) {
                    let _ = self.clunk(fid);
                    return Err(e);
                }
                fid
            }
            Err(e) => return Err(e),
        };
        self.scoped(fid, |fid| self.write(fid, 0, data))
    }

    /// Call a method file: write the call, close to run it, read the reply.
    pub fn call(&self, path: &str, method: &str, params: Vec<Value>) -> Result<Value> {
        let payload = serde_json::to_vec(&Call::new(method, params))?;
        let (fid, _) = self.walk_path(path)?;
        self.scoped(fid, |fid| {
            self.open(fid, OWRITE)?;
            self.write(fid, 0, &payload)
        })?;
        let reply = self.read_file(path)?;
        let reply: Return = serde_json::from_slice(&reply)?;
        reply.into_result()
    }
}
