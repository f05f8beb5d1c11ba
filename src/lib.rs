//! File-oriented resource protocol engine.
//!
//! Everything a server exposes is a named resource in a hierarchical
//! namespace, reached through numeric descriptors over a framed,
//! tag-multiplexed request/response protocol. Directories list their
//! children, data files hold bytes, and method files turn a write followed
//! by a close into a JSON remote procedure call whose result is read back
//! from the same file. A namespace can also graft the tree of another
//! server, forwarding requests to it.
//!
//! ```no_run
//! use std::net::TcpStream;
//! use rpcfs::{Client, Config};
//!
//! let stream = TcpStream::connect("127.0.0.1:5640")?;
//! let client = Client::connect(stream, Config::default())?;
//! let reply = client.call("/svc/hello/greet", "greet", vec!["world".into()])?;
//! println!("{reply}");
//! # Ok::<(), rpcfs::Error>(())
//! ```

mod auth;
mod client;
mod config;
mod descriptor;
mod error;
mod fcall;
mod inprocess;
mod message;
mod mount;
mod mux;
mod namespace;
mod parse;
mod protocol;
mod resource;
mod rpc;
mod server;
mod session;
mod stat;
mod tag;
mod transport;
mod worker;

pub use auth::{AuthState, Authenticator, NoAuth, TrustingAuth};
pub use client::Client;
pub use config::Config;
pub use descriptor::DescriptorManager;
pub use error::{Error, Result};
pub use fcall::{
    Fcall, Frame, expected_packets, peek_header, read_chunks, transfer_complete, write_chunks,
};
pub use inprocess::InProcessStream;
pub use mount::{Mount, RelayStats};
pub use mux::{Multiplexer, Relay, ResponseFuture};
pub use namespace::Namespace;
pub use protocol::*;
pub use resource::{MAX_FILE_LENGTH, QidPool, Resource};
pub use rpc::{Call, Method, MethodTable, Return, ValueType};
pub use server::Server;
pub use session::{OpenMode, Session, SessionState};
pub use stat::{STAT_FIXED_SIZE, Stat, decode_stats};
pub use tag::TagManager;
pub use transport::{Inbound, Transport, read_frame, write_frame};
pub use worker::WorkerPool;
