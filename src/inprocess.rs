//! In-process byte stream implemented with crossbeam channels.

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::transport::Transport;

/// One end of an in-memory duplex stream.
///
/// Clones share the receive buffer, so one clone can read while another
/// writes, the way a socket handle is split between a reader and a writer.
#[derive(Clone)]
pub struct InProcessStream {
    rx: Receiver<Vec<u8>>,
    tx: Sender<Vec<u8>>,
    wake: Sender<Vec<u8>>,
    buffer: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl InProcessStream {
    /// Create paired streams for bidirectional communication.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                rx: a_rx,
                tx: b_tx.clone(),
                wake: a_tx.clone(),
                buffer: Arc::new(Mutex::new(Vec::new())),
                closed: closed.clone(),
            },
            Self {
                rx: b_rx,
                tx: a_tx,
                wake: b_tx,
                buffer: Arc::new(Mutex::new(Vec::new())),
                closed,
            },
        )
    }
}

impl Read for InProcessStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut local = self
            .buffer
            .lock()
            .map_err(|_| io::Error::other("stream buffer poisoned"))?;
        while local.is_empty() {
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(data) => *local = data,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(local.len());
        buf[..n].copy_from_slice(&local[..n]);
        local.drain(..n);
        Ok(n)
    }
}

impl Write for InProcessStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for InProcessStream {
    fn try_clone(&self) -> io::Result<Self> {
        Ok(self.clone())
    }

    fn shutdown(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        // empty chunks wake readers blocked on either end
        let _ = self.wake.send(Vec::new());
        let _ = self.tx.send(Vec::new());
        Ok(())
    }
}
