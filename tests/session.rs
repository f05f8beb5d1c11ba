mod common;

use std::thread;
use std::time::Duration;

use common::{exchange, handshake, init_logging, is_error, recv, send, serve};
use rpcfs::{
    Config, DEFAULT_MSIZE, Fcall, MAX_FILE_LENGTH, Method, MethodTable, NO_FID, NO_TAG, OREAD,
    OWRITE, QidType, Server, Stat, ValueType,
};
use serde_json::Value;

#[test]
fn version_and_attach_over_raw_frames() {
    init_logging();
    let server = Server::new(Config::default());
    let mut stream = serve(&server);

    let reply = exchange(
        &mut stream,
        NO_TAG,
        Fcall::TVersion {
            msize: 65535,
            version: "P1".into(),
        },
    );
    assert_eq!(
        reply,
        Fcall::RVersion {
            msize: DEFAULT_MSIZE,
            version: "P1".into()
        }
    );

    let reply = exchange(
        &mut stream,
        1,
        Fcall::TAttach {
            fid: 1,
            afid: NO_FID,
            uname: "alice".into(),
            aname: String::new(),
        },
    );
    let Fcall::RAttach { qid } = reply else {
        panic!("unexpected attach reply {reply:?}");
    };
    assert!(qid.type_.contains(QidType::DIR));
    assert_eq!(qid, server.namespace().root().qid());
}

#[test]
fn requests_before_attach_are_refused() {
    init_logging();
    let server = Server::new(Config::default());
    let mut stream = serve(&server);

    let reply = exchange(&mut stream, 2, Fcall::TStat { fid: 1 });
    assert!(is_error(&reply, "version not negotiated"));

    exchange(
        &mut stream,
        NO_TAG,
        Fcall::TVersion {
            msize: DEFAULT_MSIZE,
            version: "P1".into(),
        },
    );
    let reply = exchange(&mut stream, 2, Fcall::TStat { fid: 1 });
    assert!(is_error(&reply, "not attached"));

    let reply = exchange(
        &mut stream,
        3,
        Fcall::TAttach {
            fid: 1,
            afid: NO_FID,
            uname: "alice".into(),
            aname: "nowhere".into(),
        },
    );
    assert!(is_error(&reply, "unknown namespace"));
}

#[test]
fn descriptors_live_until_closed() {
    init_logging();
    let server = Server::new(Config::default());
    server.namespace().mkdir("/etc").unwrap();
    let mut stream = serve(&server);
    handshake(&mut stream, 1, "alice");

    let reply = exchange(
        &mut stream,
        4,
        Fcall::TWalk {
            fid: 1,
            newfid: 2,
            wnames: vec!["etc".into()],
        },
    );
    assert!(matches!(reply, Fcall::RWalk { ref wqids } if wqids.len() == 1));
    let reply = exchange(&mut stream, 5, Fcall::TStat { fid: 2 });
    assert!(matches!(reply, Fcall::RStat { stat } if stat.name == "etc"));

    let reply = exchange(
        &mut stream,
        6,
        Fcall::TWalk {
            fid: 1,
            newfid: 2,
            wnames: Vec::new(),
        },
    );
    assert!(is_error(&reply, "already in use"));

    assert_eq!(exchange(&mut stream, 7, Fcall::TClunk { fid: 2 }), Fcall::RClunk);
    let reply = exchange(&mut stream, 8, Fcall::TStat { fid: 2 });
    assert!(is_error(&reply, "unknown descriptor 2"));

    // A walk fails as a whole and binds nothing.
    let reply = exchange(
        &mut stream,
        9,
        Fcall::TWalk {
            fid: 1,
            newfid: 3,
            wnames: vec!["etc".into(), "missing".into()],
        },
    );
    assert!(is_error(&reply, "not found"));
    let reply = exchange(&mut stream, 10, Fcall::TStat { fid: 3 });
    assert!(is_error(&reply, "unknown descriptor"));

    // A new version forgets every descriptor.
    exchange(
        &mut stream,
        NO_TAG,
        Fcall::TVersion {
            msize: DEFAULT_MSIZE,
            version: "P1".into(),
        },
    );
    let reply = exchange(&mut stream, 11, Fcall::TStat { fid: 1 });
    assert!(is_error(&reply, "not attached"));
}

#[test]
fn opens_are_exclusive_per_descriptor() {
    init_logging();
    let server = Server::new(Config::default());
    server.namespace().add_file("/motd", "hello").unwrap();
    let mut stream = serve(&server);
    handshake(&mut stream, 1, "alice");

    for newfid in [2, 3] {
        exchange(
            &mut stream,
            2,
            Fcall::TWalk {
                fid: 1,
                newfid,
                wnames: vec!["motd".into()],
            },
        );
    }
    let reply = exchange(&mut stream, 3, Fcall::TOpen { fid: 2, mode: OREAD });
    assert!(matches!(reply, Fcall::ROpen { iounit: 8192, .. }));
    let reply = exchange(&mut stream, 4, Fcall::TOpen { fid: 2, mode: OREAD });
    assert!(is_error(&reply, "already open"));
    let walk_open = Fcall::TWalk {
        fid: 2,
        newfid: 4,
        wnames: Vec::new(),
    };
    assert!(is_error(&exchange(&mut stream, 5, walk_open), "already open"));

    let read = |fid| Fcall::TRead {
        fid,
        offset: 0,
        count: 100,
    };
    assert_eq!(
        exchange(&mut stream, 6, read(2)),
        Fcall::RRead {
            data: b"hello".to_vec()
        }
    );
    assert!(is_error(&exchange(&mut stream, 7, read(3)), "not open for reading"));
    let write = Fcall::TWrite {
        fid: 2,
        offset: 0,
        data: b"x".to_vec(),
    };
    assert!(is_error(&exchange(&mut stream, 8, write), "not open for writing"));
    let rdwr = Fcall::TOpen { fid: 3, mode: 2 };
    assert!(is_error(&exchange(&mut stream, 9, rdwr), "read-write open not supported"));
}

#[test]
fn duplicate_tags_are_rejected_while_in_flight() {
    init_logging();
    let server = Server::new(Config::default());
    let table = MethodTable::new().with(Method::new("slow", vec![], ValueType::Null, |_| {
        thread::sleep(Duration::from_millis(300));
        Ok(Value::Null)
    }));
    server.namespace().register_service("/svc", &table).unwrap();
    let mut stream = serve(&server);
    handshake(&mut stream, 1, "alice");

    exchange(
        &mut stream,
        2,
        Fcall::TWalk {
            fid: 1,
            newfid: 2,
            wnames: vec!["svc".into(), "slow".into()],
        },
    );
    exchange(&mut stream, 3, Fcall::TOpen { fid: 2, mode: OWRITE });
    let payload = br#"{"method":"slow","params":[]}"#.to_vec();
    let reply = exchange(
        &mut stream,
        4,
        Fcall::TWrite {
            fid: 2,
            offset: 0,
            data: payload.clone(),
        },
    );
    assert_eq!(
        reply,
        Fcall::RWrite {
            count: payload.len() as u32
        }
    );

    send(&mut stream, 7, Fcall::TClunk { fid: 2 });
    send(&mut stream, 7, Fcall::TStat { fid: 1 });
    let (tag, first) = recv(&mut stream);
    assert_eq!(tag, 7);
    assert!(is_error(&first, "tag 7 already in flight"));
    let (tag, second) = recv(&mut stream);
    assert_eq!((tag, second), (7, Fcall::RClunk));

    // The tag is free again once answered.
    let reply = exchange(&mut stream, 7, Fcall::TStat { fid: 1 });
    assert!(matches!(reply, Fcall::RStat { .. }));
}

/// Open `/svc/<name>` for writing on `fid` and buffer a call to it.
fn stage_call(stream: &mut rpcfs::InProcessStream, fid: u32, name: &str) {
    exchange(
        stream,
        2,
        Fcall::TWalk {
            fid: 1,
            newfid: fid,
            wnames: vec!["svc".into(), name.into()],
        },
    );
    exchange(stream, 3, Fcall::TOpen { fid, mode: OWRITE });
    let payload = format!(r#"{{"method":"{name}","params":[]}}"#).into_bytes();
    let reply = exchange(
        stream,
        4,
        Fcall::TWrite {
            fid,
            offset: 0,
            data: payload,
        },
    );
    assert!(matches!(reply, Fcall::RWrite { .. }), "{reply:?}");
}

#[test]
fn requests_queued_behind_a_close_see_it() {
    init_logging();
    let server = Server::new(Config::default());
    let table = MethodTable::new().with(Method::new("slow", vec![], ValueType::Null, |_| {
        thread::sleep(Duration::from_millis(200));
        Ok(Value::Null)
    }));
    server.namespace().register_service("/svc", &table).unwrap();
    let mut stream = serve(&server);
    handshake(&mut stream, 1, "alice");
    stage_call(&mut stream, 2, "slow");

    send(&mut stream, 5, Fcall::TClunk { fid: 2 });
    send(&mut stream, 6, Fcall::TStat { fid: 2 });
    send(
        &mut stream,
        7,
        Fcall::TWalk {
            fid: 2,
            newfid: 9,
            wnames: Vec::new(),
        },
    );
    assert_eq!(recv(&mut stream), (5, Fcall::RClunk));
    let (tag, stat) = recv(&mut stream);
    assert_eq!(tag, 6);
    assert!(is_error(&stat, "unknown descriptor 2"), "{stat:?}");
    let (tag, walk) = recv(&mut stream);
    assert_eq!(tag, 7);
    assert!(is_error(&walk, "unknown descriptor 2"), "{walk:?}");

    let reply = exchange(&mut stream, 8, Fcall::TStat { fid: 9 });
    assert!(is_error(&reply, "unknown descriptor 9"));
}

#[test]
fn writes_past_the_largest_file_are_refused() {
    init_logging();
    let server = Server::new(Config::default());
    server.namespace().add_file("/blob", "abc").unwrap();
    let mut stream = serve(&server);
    handshake(&mut stream, 1, "alice");
    exchange(
        &mut stream,
        2,
        Fcall::TWalk {
            fid: 1,
            newfid: 2,
            wnames: vec!["blob".into()],
        },
    );
    exchange(&mut stream, 3, Fcall::TOpen { fid: 2, mode: OWRITE });

    for offset in [isize::MAX as u64 - 2, u64::MAX - 2, MAX_FILE_LENGTH] {
        let write = Fcall::TWrite {
            fid: 2,
            offset,
            data: b"ab".to_vec(),
        };
        let reply = exchange(&mut stream, 4, write);
        assert!(is_error(&reply, "exceeds the largest file"), "{reply:?}");
    }

    let mut grow = Stat::dont_touch();
    grow.length = 1 << 40;
    let reply = exchange(&mut stream, 5, Fcall::TWstat { fid: 2, stat: grow });
    assert!(is_error(&reply, "exceeds the largest file"), "{reply:?}");

    let Fcall::RStat { stat } = exchange(&mut stream, 6, Fcall::TStat { fid: 2 }) else {
        panic!("expected stat");
    };
    assert_eq!(stat.length, 3);
}

#[test]
fn a_panicking_handler_still_answers() {
    init_logging();
    let server = Server::new(Config::default());
    let table = MethodTable::new().with(Method::new("boom", vec![], ValueType::Null, |_| {
        panic!("handler exploded")
    }));
    server.namespace().register_service("/svc", &table).unwrap();
    let mut stream = serve(&server);
    handshake(&mut stream, 1, "alice");
    stage_call(&mut stream, 2, "boom");

    let reply = exchange(&mut stream, 5, Fcall::TClunk { fid: 2 });
    assert!(is_error(&reply, "invalid resource"), "{reply:?}");
    // The tag was retired and the worker is still serving.
    let reply = exchange(&mut stream, 5, Fcall::TStat { fid: 1 });
    assert!(matches!(reply, Fcall::RStat { .. }));
}

#[test]
fn flush_is_answered_under_its_own_tag() {
    init_logging();
    let server = Server::new(Config::default());
    let mut stream = serve(&server);
    handshake(&mut stream, 1, "alice");
    assert_eq!(exchange(&mut stream, 12, Fcall::TFlush { oldtag: 3 }), Fcall::RFlush);
}

#[test]
fn bad_frames_get_errors_and_keep_the_connection() {
    init_logging();
    let server = Server::new(Config::default());
    let mut stream = serve(&server);
    handshake(&mut stream, 1, "alice");

    let oversized = Fcall::TWrite {
        fid: 1,
        offset: 0,
        data: vec![0u8; DEFAULT_MSIZE as usize],
    };
    let reply = exchange(&mut stream, 9, oversized);
    assert!(is_error(&reply, "exceeds negotiated maximum"));

    rpcfs::write_frame(&mut stream, &[7, 0, 0, 0, 200, 5, 0]).unwrap();
    let (tag, reply) = recv(&mut stream);
    assert_eq!(tag, 5);
    assert!(is_error(&reply, "unknown message type 200"));

    let reply = exchange(&mut stream, 6, Fcall::TStat { fid: 1 });
    assert!(matches!(reply, Fcall::RStat { .. }));
}

#[test]
fn session_ends_when_the_peer_disconnects() {
    init_logging();
    let server = Server::new(Config::default());
    let (local, remote) = rpcfs::InProcessStream::pair();
    let handle = server.spawn(remote).unwrap();
    let mut local = local;
    handshake(&mut local, 1, "alice");
    rpcfs::Transport::shutdown(&local).unwrap();
    handle.join().unwrap().unwrap();
}
