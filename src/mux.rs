//! Client-side request multiplexer.
//!
//! Requests are registered under their tag before the frame is written. A
//! single reader thread pulls inbound frames, finds the waiter by tag and
//! either completes its future or, for bulk reads, accumulates packets until
//! the transfer is complete. Callers block on a channel-backed future.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fcall::{Fcall, expect_response, expected_packets, transfer_complete};
use crate::message::dump_hex;
use crate::protocol::{IOHDRSZ, NO_TAG, TREAD, TVERSION};
use crate::tag::TagManager;
use crate::transport::{Inbound, Transport, read_frame};

/// Receiver of responses that are relayed rather than awaited.
pub trait Relay: Send + Sync {
    /// Hand over one response packet. Returns true once the transaction
    /// identified by `tag` needs no further packets.
    fn deliver(&self, tag: u16, response: Fcall) -> bool;

    /// The connection failed before the transaction finished.
    fn abort(&self, tag: u16, err: &Error);
}

enum Waiter {
    Future {
        tx: Sender<Result<Vec<Fcall>>>,
        request_type: u8,
        expected: u32,
        iounit: u32,
        packets: Vec<Fcall>,
    },
    Relay(Arc<dyn Relay>),
}

struct Pending {
    waiter: Waiter,
    submitted: Instant,
}

struct Shared {
    writer: Mutex<Box<dyn Write + Send>>,
    pending: Mutex<HashMap<u16, Pending>>,
    tags: TagManager,
    msize: AtomicU32,
    closed: Mutex<Option<String>>,
    shutdown: Box<dyn Fn() + Send + Sync>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Future for one tagged request.
pub struct ResponseFuture {
    tag: u16,
    rx: Receiver<Result<Vec<Fcall>>>,
}

impl ResponseFuture {
    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// Block until every response packet has arrived.
    pub fn wait(self) -> Result<Vec<Fcall>> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(Error::ConnectionReset(String::from("multiplexer dropped"))))
    }

    /// Block for a single-packet response.
    pub fn wait_one(self) -> Result<Fcall> {
        let mut packets = self.wait()?;
        if packets.is_empty() {
            return Err(Error::Malformed("empty response"));
        }
        Ok(packets.swap_remove(0))
    }

    /// Non-blocking poll.
    pub fn try_wait(&self) -> Option<Result<Vec<Fcall>>> {
        self.rx.try_recv().ok()
    }
}

/// One multiplexed connection.
pub struct Multiplexer {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Take ownership of `stream` and start its reader (and, if requested,
    /// its watchdog).
    pub fn start<T: Transport>(stream: T, msize: u32, watchdog: Option<Duration>) -> Result<Self> {
        let reader_stream = stream.try_clone()?;
        let control = Mutex::new(stream.try_clone()?);
        let shared = Arc::new(Shared {
            writer: Mutex::new(Box::new(stream)),
            pending: Mutex::new(HashMap::new()),
            tags: TagManager::new(),
            msize: AtomicU32::new(msize),
            closed: Mutex::new(None),
            shutdown: Box::new(move || {
                let _ = lock(&control).shutdown();
            }),
        });

        let reader_shared = shared.clone();
        let reader = thread::Builder::new()
            .name(String::from("rpcfs-mux-reader"))
            .spawn(move || read_loop(reader_shared, reader_stream))?;

        if let Some(timeout) = watchdog {
            let weak = Arc::downgrade(&shared);
            thread::Builder::new()
                .name(String::from("rpcfs-mux-watchdog"))
                .spawn(move || watchdog_loop(weak, timeout))?;
        }

        Ok(Self {
            shared,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn msize(&self) -> u32 {
        self.shared.msize.load(Ordering::Acquire)
    }

    /// Record the frame size agreed in the version exchange.
    pub fn set_msize(&self, msize: u32) {
        self.shared.msize.store(msize, Ordering::Release);
    }

    /// Largest read/write payload per frame.
    pub fn iounit(&self) -> u32 {
        self.msize().saturating_sub(IOHDRSZ).max(1)
    }

    pub fn tags(&self) -> &TagManager {
        &self.shared.tags
    }

    /// Requests still waiting for (part of) their response.
    pub fn outstanding(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.closed).is_some()
    }

    /// Submit a request under a freshly allocated tag (`NO_TAG` for version).
    pub fn submit(&self, body: Fcall) -> Result<ResponseFuture> {
        let tag = if body.msg_type() == TVERSION {
            self.shared.tags.claim(NO_TAG)?;
            NO_TAG
        } else {
            self.shared.tags.allocate()?
        };
        self.submit_claimed(tag, body)
    }

    /// Submit a request under a caller-chosen tag. A tag that is still
    /// outstanding is refused before anything is written.
    pub fn submit_tagged(&self, tag: u16, body: Fcall) -> Result<ResponseFuture> {
        self.shared.tags.claim(tag)?;
        self.submit_claimed(tag, body)
    }

    fn submit_claimed(&self, tag: u16, body: Fcall) -> Result<ResponseFuture> {
        let (tx, rx) = bounded(1);
        let expected = match body {
            Fcall::TRead { count, .. } => expected_packets(count, self.iounit()),
            _ => 1,
        };
        let waiter = Waiter::Future {
            tx,
            request_type: body.msg_type(),
            expected,
            iounit: self.iounit(),
            packets: Vec::new(),
        };
        self.send(tag, &body, waiter)?;
        Ok(ResponseFuture { tag, rx })
    }

    /// Reserve a tag ahead of [`Multiplexer::submit_relay`], so the relay can
    /// record it before any response can arrive.
    pub fn allocate_tag(&self) -> Result<u16> {
        self.shared.tags.allocate()
    }

    /// Submit a request under a tag from [`Multiplexer::allocate_tag`] whose
    /// responses go to `relay` instead of a future.
    pub fn submit_relay(&self, tag: u16, body: Fcall, relay: Arc<dyn Relay>) -> Result<()> {
        self.send(tag, &body, Waiter::Relay(relay))
    }

    /// Submit and wait for a single response, turning error responses into
    /// [`Error::Remote`].
    pub fn rpc(&self, body: Fcall) -> Result<Fcall> {
        self.submit(body)?.wait_one()
    }

    fn send(&self, tag: u16, body: &Fcall, waiter: Waiter) -> Result<()> {
        let frame = match body.encode(tag) {
            Ok(frame) => frame,
            Err(e) => {
                self.shared.tags.release(tag);
                return Err(e);
            }
        };
        if let Some(reason) = lock(&self.shared.closed).clone() {
            self.shared.tags.release(tag);
            return Err(Error::ConnectionReset(reason));
        }
        lock(&self.shared.pending).insert(
            tag,
            Pending {
                waiter,
                submitted: Instant::now(),
            },
        );
        debug!("→ tag {} {} ({} bytes)", tag, body.verb(), frame.len());
        let written = {
            let mut writer = lock(&self.shared.writer);
            writer.write_all(&frame).and_then(|_| writer.flush())
        };
        if let Err(e) = written {
            let reason = format!("write failed: {e}");
            self.shared.fail_all(&reason);
            return Err(Error::ConnectionReset(reason));
        }
        Ok(())
    }

    /// Tear the connection down and fail every outstanding request.
    pub fn reset(&self, reason: &str) {
        self.shared.fail_all(reason);
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shared.fail_all("multiplexer dropped");
        if let Some(handle) = lock(&self.reader).take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Shared {
    fn fail_all(&self, reason: &str) {
        {
            let mut closed = lock(&self.closed);
            if closed.is_none() {
                info!("connection closed: {}", reason);
                *closed = Some(reason.to_string());
            }
        }
        let drained: Vec<(u16, Pending)> = lock(&self.pending).drain().collect();
        for (tag, entry) in drained {
            self.tags.release(tag);
            let err = Error::ConnectionReset(reason.to_string());
            match entry.waiter {
                Waiter::Future { tx, .. } => {
                    let _ = tx.send(Err(err));
                }
                Waiter::Relay(relay) => relay.abort(tag, &err),
            }
        }
        (self.shutdown)();
    }

    fn retire(&self, tag: u16) -> Option<Pending> {
        let entry = lock(&self.pending).remove(&tag);
        if entry.is_some() {
            self.tags.release(tag);
        }
        entry
    }

    fn fail_tag(&self, tag: u16, err: Error) {
        match self.retire(tag).map(|p| p.waiter) {
            Some(Waiter::Future { tx, .. }) => {
                let _ = tx.send(Err(err));
            }
            Some(Waiter::Relay(relay)) => relay.abort(tag, &err),
            None => warn!("dropping error for unknown tag {}: {}", tag, err),
        }
    }

    fn dispatch(&self, tag: u16, body: Fcall) {
        let relay = {
            let mut pending = lock(&self.pending);
            let Some(entry) = pending.get_mut(&tag) else {
                warn!("response for unknown tag {} ({})", tag, body.verb());
                return;
            };
            match &mut entry.waiter {
                Waiter::Relay(relay) => relay.clone(),
                Waiter::Future {
                    request_type,
                    expected,
                    iounit,
                    packets,
                    ..
                } => {
                    let outcome = match expect_response(*request_type, &body) {
                        Err(e) => Some(Err(e)),
                        Ok(()) => match body {
                            Fcall::RError { ename } => Some(Err(Error::Remote(ename))),
                            Fcall::RRead { data } if *request_type == TREAD => {
                                let last_len = data.len();
                                packets.push(Fcall::RRead { data });
                                let received = packets.len() as u32;
                                if transfer_complete(received, *expected, last_len, *iounit) {
                                    Some(Ok(std::mem::take(packets)))
                                } else {
                                    None
                                }
                            }
                            other => Some(Ok(vec![other])),
                        },
                    };
                    let Some(outcome) = outcome else {
                        return;
                    };
                    drop(pending);
                    if let Some(Pending {
                        waiter: Waiter::Future { tx, .. },
                        ..
                    }) = self.retire(tag)
                    {
                        let _ = tx.send(outcome);
                    }
                    return;
                }
            }
        };
        if relay.deliver(tag, body) {
            self.retire(tag);
        }
    }
}

fn read_loop<T: Transport>(shared: Arc<Shared>, mut stream: T) {
    let reason = loop {
        let limit = shared.msize.load(Ordering::Acquire);
        match read_frame(&mut stream, limit) {
            Ok(Some(Inbound::Frame(frame))) => match Fcall::decode(&frame) {
                Ok(decoded) => {
                    debug!("← tag {} {}", decoded.tag, decoded.body.verb());
                    shared.dispatch(decoded.tag, decoded.body);
                }
                Err(e) => {
                    warn!(
                        "undecodable response ({}): {}",
                        e,
                        dump_hex(&frame[..frame.len().min(32)])
                    );
                    if let Ok((_, tag)) = crate::fcall::peek_header(&frame) {
                        shared.fail_tag(tag, e);
                    }
                }
            },
            Ok(Some(Inbound::Oversized { size, tag, .. })) => {
                shared.fail_tag(tag, Error::FrameTooLarge { size, limit });
            }
            Ok(None) => break String::from("connection closed by peer"),
            Err(e) => break e.to_string(),
        }
    };
    shared.fail_all(&reason);
}

fn watchdog_loop(shared: Weak<Shared>, timeout: Duration) {
    let interval = (timeout / 4).max(Duration::from_millis(5));
    loop {
        thread::sleep(interval);
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if lock(&shared.closed).is_some() {
            return;
        }
        let oldest = lock(&shared.pending)
            .values()
            .map(|p| p.submitted)
            .min();
        if let Some(oldest) = oldest {
            if oldest.elapsed() > timeout {
                warn!("watchdog: request outstanding for over {:?}", timeout);
                shared.fail_all("watchdog timeout");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inprocess::InProcessStream;
    use crate::protocol::{DEFAULT_MSIZE, Qid, QidType, RCLUNK};
    use crate::transport::write_frame;

    fn read_request(stream: &mut InProcessStream) -> crate::fcall::Frame {
        match read_frame(stream, DEFAULT_MSIZE).unwrap() {
            Some(Inbound::Frame(frame)) => Fcall::decode(&frame).unwrap(),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn reply(stream: &mut InProcessStream, tag: u16, body: Fcall) {
        write_frame(stream, &body.encode(tag).unwrap()).unwrap();
    }

    fn packet(data: Vec<u8>) -> Fcall {
        Fcall::RRead { data }
    }

    fn bulk_read(count: u32) -> Fcall {
        Fcall::TRead {
            fid: 1,
            offset: 0,
            count,
        }
    }

    #[test]
    fn responses_are_matched_by_tag_out_of_order() {
        let (client, mut server) = InProcessStream::pair();
        let mux = Multiplexer::start(client, DEFAULT_MSIZE, None).unwrap();
        let first = mux.submit(Fcall::TClunk { fid: 1 }).unwrap();
        let second = mux.submit(Fcall::TStat { fid: 2 }).unwrap();
        let a = read_request(&mut server);
        let b = read_request(&mut server);
        assert_ne!(a.tag, b.tag);

        let missing = Fcall::RError {
            ename: "file not found: x".into(),
        };
        reply(&mut server, b.tag, missing);
        reply(&mut server, a.tag, Fcall::RClunk);
        assert_eq!(first.wait_one().unwrap(), Fcall::RClunk);
        match second.wait_one() {
            Err(Error::Remote(msg)) => assert_eq!(msg, "file not found: x"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mux.outstanding(), 0);
        assert_eq!(mux.tags().outstanding(), 0);
    }

    #[test]
    fn bulk_reads_accumulate_until_complete() {
        let (client, mut server) = InProcessStream::pair();
        let mux = Multiplexer::start(client, 100 + IOHDRSZ, None).unwrap();
        let fut = mux.submit(bulk_read(250)).unwrap();
        let req = read_request(&mut server);
        reply(&mut server, req.tag, packet(vec![1; 100]));
        reply(&mut server, req.tag, packet(vec![2; 100]));
        assert!(fut.try_wait().is_none());
        reply(&mut server, req.tag, packet(vec![3; 50]));
        let packets = fut.wait().unwrap();
        assert_eq!(packets.len(), 3);
    }

    #[test]
    fn short_packet_ends_a_bulk_read_early() {
        let (client, mut server) = InProcessStream::pair();
        let mux = Multiplexer::start(client, 100 + IOHDRSZ, None).unwrap();
        let fut = mux.submit(bulk_read(1000)).unwrap();
        let req = read_request(&mut server);
        reply(&mut server, req.tag, packet(vec![1; 100]));
        reply(&mut server, req.tag, packet(Vec::new()));
        assert_eq!(fut.wait().unwrap().len(), 2);
    }

    #[test]
    fn mismatched_response_type_is_a_decode_error() {
        let (client, mut server) = InProcessStream::pair();
        let mux = Multiplexer::start(client, DEFAULT_MSIZE, None).unwrap();
        let fut = mux.submit(Fcall::TClunk { fid: 1 }).unwrap();
        let req = read_request(&mut server);
        let attached = Fcall::RAttach {
            qid: Qid::new(QidType::DIR, 0, 1),
        };
        reply(&mut server, req.tag, attached);
        assert!(matches!(
            fut.wait(),
            Err(Error::UnexpectedType { expected: RCLUNK, .. })
        ));
    }

    #[test]
    fn duplicate_caller_tags_are_refused() {
        let (client, _server) = InProcessStream::pair();
        let mux = Multiplexer::start(client, DEFAULT_MSIZE, None).unwrap();
        let _fut = mux.submit_tagged(9, Fcall::TClunk { fid: 1 }).unwrap();
        assert!(matches!(
            mux.submit_tagged(9, Fcall::TClunk { fid: 2 }),
            Err(Error::DuplicateTag(9))
        ));
    }

    #[test]
    fn peer_disconnect_fails_outstanding_futures() {
        let (client, server) = InProcessStream::pair();
        let mux = Multiplexer::start(client, DEFAULT_MSIZE, None).unwrap();
        let fut = mux.submit(Fcall::TStat { fid: 1 }).unwrap();
        server.shutdown().unwrap();
        assert!(matches!(fut.wait(), Err(Error::ConnectionReset(_))));
        assert!(mux.is_closed());
        assert!(matches!(
            mux.submit(Fcall::TStat { fid: 1 }),
            Err(Error::ConnectionReset(_))
        ));
    }

    #[test]
    fn watchdog_resets_a_stalled_connection() {
        let (client, _server) = InProcessStream::pair();
        let watchdog = Some(Duration::from_millis(40));
        let mux = Multiplexer::start(client, DEFAULT_MSIZE, watchdog).unwrap();
        let fut = mux.submit(Fcall::TStat { fid: 1 }).unwrap();
        match fut.wait() {
            Err(Error::ConnectionReset(reason)) => assert_eq!(reason, "watchdog timeout"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
