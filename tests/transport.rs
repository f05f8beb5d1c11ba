mod common;

use common::{connect, init_logging};
use rpcfs::{Client, Config, DEFAULT_MSIZE, Error, InProcessStream, Server, Transport};

#[test]
fn watchdog_fails_requests_nobody_answers() {
    init_logging();
    let (local, _silent) = InProcessStream::pair();
    let config = Config {
        watchdog_ms: Some(100),
        ..Config::default()
    };
    let client = Client::new(local, config).unwrap();
    let err = client.version(DEFAULT_MSIZE, "P1").unwrap_err();
    assert!(err.is_transport(), "{err}");
    assert!(client.mux().is_closed());
}

#[test]
fn peer_shutdown_fails_outstanding_and_later_requests() {
    init_logging();
    let (local, peer) = InProcessStream::pair();
    let client = Client::new(local, Config::default()).unwrap();
    peer.shutdown().unwrap();
    let err = client.version(DEFAULT_MSIZE, "P1").unwrap_err();
    assert!(matches!(err, Error::ConnectionReset(_)), "{err}");
    assert!(client.list_dir("/").is_err());
}

#[test]
fn unknown_versions_are_not_negotiated() {
    init_logging();
    let server = Server::new(Config::default());
    let (local, remote) = InProcessStream::pair();
    server.spawn(remote).unwrap();
    let config = Config {
        version: String::from("P2"),
        ..Config::default()
    };
    assert!(matches!(Client::connect(local, config), Err(Error::NotVersioned)));

    let client = connect(&server);
    assert_eq!(client.negotiated_version(), "P1");
}

#[test]
fn config_files_drive_the_handshake() {
    init_logging();
    let config = Config::from_json(r#"{"msize": 1024, "user": "carol"}"#).unwrap();
    let server = Server::new(Config::default());
    server.namespace().add_file("/who", "").unwrap();
    let client = common::connect_with(&server, config);
    assert_eq!(client.iounit(), 1000);
    let (fid, _) = client.walk_path("/who").unwrap();
    client.open(fid, rpcfs::OWRITE | rpcfs::OTRUNC).unwrap();
    client.clunk(fid).unwrap();
    let owner = server.namespace().lookup("/who").unwrap().stat().unwrap().muid;
    assert_eq!(owner, "carol");
}
