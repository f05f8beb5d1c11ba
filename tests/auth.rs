mod common;

use std::sync::Arc;

use common::{init_logging, serve};
use rpcfs::{Client, Config, DEFAULT_MSIZE, Error, QidType, Server, TrustingAuth};

fn versioned(server: &Server) -> Client {
    let client = Client::new(serve(server), Config::default()).unwrap();
    client.version(DEFAULT_MSIZE, "P1").unwrap();
    client
}

#[test]
fn attach_requires_a_verified_auth_descriptor() {
    init_logging();
    let server = Server::with_authenticator(Config::default(), Arc::new(TrustingAuth));
    server.namespace().add_file("/secret", "42").unwrap();
    let client = versioned(&server);

    let err = client.attach(None, "alice", "").unwrap_err();
    assert!(
        matches!(err, Error::Remote(ref msg) if msg.contains("authentication failed")),
        "{err}"
    );

    let (afid, aqid) = client.auth("alice", "").unwrap();
    assert!(aqid.type_.contains(QidType::AUTH));

    // Nothing presented yet.
    assert!(client.attach(Some(afid), "alice", "").is_err());

    assert_eq!(client.write(afid, 0, b"token").unwrap(), 5);
    let err = client.attach(Some(afid), "bob", "").unwrap_err();
    assert!(matches!(err, Error::Remote(ref msg) if msg.contains("issued to alice")), "{err}");

    let root = client.attach(Some(afid), "alice", "").unwrap();
    assert!(root.is_dir());
    assert_eq!(client.read_file("/secret").unwrap(), b"42");
}

#[test]
fn auth_is_refused_when_not_required() {
    init_logging();
    let server = Server::new(Config::default());
    let client = versioned(&server);
    let err = client.auth("alice", "").unwrap_err();
    assert!(matches!(err, Error::Remote(ref msg) if msg.contains("not required")), "{err}");
    client.attach(None, "alice", "").unwrap();
}

#[test]
fn auth_for_unknown_namespace_is_refused() {
    init_logging();
    let server = Server::with_authenticator(Config::default(), Arc::new(TrustingAuth));
    let client = versioned(&server);
    assert!(client.auth("alice", "elsewhere").is_err());
    server.add_namespace("elsewhere");
    let (afid, _) = client.auth("alice", "elsewhere").unwrap();
    client.write(afid, 0, b"t").unwrap();
    client.attach(Some(afid), "alice", "elsewhere").unwrap();
}
