#![allow(dead_code)]

use rpcfs::{
    Client, Config, DEFAULT_MSIZE, Fcall, InProcessStream, Inbound, Server, read_frame,
    write_frame,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Start serving one in-process connection and return the client end.
pub fn serve(server: &Server) -> InProcessStream {
    let (local, remote) = InProcessStream::pair();
    server.spawn(remote).expect("spawn session");
    local
}

pub fn connect(server: &Server) -> Client {
    connect_with(server, Config::default())
}

pub fn connect_with(server: &Server, config: Config) -> Client {
    Client::connect(serve(server), config).expect("connect")
}

pub fn send(stream: &mut InProcessStream, tag: u16, body: Fcall) {
    write_frame(stream, &body.encode(tag).expect("encode")).expect("write frame");
}

/// Next response frame as (tag, message).
pub fn recv(stream: &mut InProcessStream) -> (u16, Fcall) {
    match read_frame(stream, DEFAULT_MSIZE).expect("read frame") {
        Some(Inbound::Frame(frame)) => {
            let decoded = Fcall::decode(&frame).expect("decode");
            (decoded.tag, decoded.body)
        }
        other => panic!("expected a frame, got {other:?}"),
    }
}

pub fn exchange(stream: &mut InProcessStream, tag: u16, body: Fcall) -> Fcall {
    send(stream, tag, body);
    let (got, reply) = recv(stream);
    assert_eq!(got, tag, "response tag");
    reply
}

/// Version and attach over a raw stream as `user`.
pub fn handshake(stream: &mut InProcessStream, fid: u32, user: &str) -> Fcall {
    exchange(
        stream,
        rpcfs::NO_TAG,
        Fcall::TVersion {
            msize: DEFAULT_MSIZE,
            version: String::from("P1"),
        },
    );
    exchange(
        stream,
        1,
        Fcall::TAttach {
            fid,
            afid: rpcfs::NO_FID,
            uname: user.to_string(),
            aname: String::new(),
        },
    )
}

pub fn is_error(reply: &Fcall, text: &str) -> bool {
    matches!(reply, Fcall::RError { ename } if ename.contains(text))
}
