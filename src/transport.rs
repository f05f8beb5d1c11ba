//! Transport abstraction for framed protocol traffic.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

use crate::error::{Error, Result};
use crate::protocol::HEADER_SIZE;

/// A bidirectional byte stream that can be split into a reader and a writer.
pub trait Transport: Read + Write + Send + 'static {
    /// Another handle to the same underlying stream.
    fn try_clone(&self) -> io::Result<Self>
    where
        Self: Sized;

    /// Tear the stream down in both directions, waking any blocked reader.
    fn shutdown(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

#[cfg(unix)]
impl Transport for std::os::unix::net::UnixStream {
    fn try_clone(&self) -> io::Result<Self> {
        std::os::unix::net::UnixStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, Shutdown::Both)
    }
}

/// One frame pulled off a stream.
#[derive(Debug)]
pub enum Inbound {
    /// A complete frame, size prefix included.
    Frame(Vec<u8>),
    /// A frame over the size limit whose body was drained; carries its
    /// declared size, type and tag so the peer can be told.
    Oversized { size: usize, msg_type: u8, tag: u16 },
}

/// Read the next frame. Returns `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R, limit: u32) -> Result<Option<Inbound>> {
    let mut size_buf = [0u8; 4];
    let mut filled = 0;
    while filled < size_buf.len() {
        match reader.read(&mut size_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    let size = u32::from_le_bytes(size_buf) as usize;
    if size < HEADER_SIZE {
        return Err(Error::Malformed("frame shorter than its header"));
    }
    if size > limit as usize {
        let mut head = [0u8; HEADER_SIZE - 4];
        reader.read_exact(&mut head)?;
        let rest = (size - HEADER_SIZE) as u64;
        let drained = io::copy(&mut reader.by_ref().take(rest), &mut io::sink())?;
        if drained != rest {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        return Ok(Some(Inbound::Oversized {
            size,
            msg_type: head[0],
            tag: u16::from_le_bytes([head[1], head[2]]),
        }));
    }
    let mut frame = vec![0u8; size];
    frame[..4].copy_from_slice(&size_buf);
    reader.read_exact(&mut frame[4..])?;
    Ok(Some(Inbound::Frame(frame)))
}

/// Write one encoded frame and flush it.
pub fn write_frame<W: Write>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame)?;
    writer.flush()
}
