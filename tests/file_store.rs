//! End-to-end file store scenarios over a live two-peer ring: user
//! registration and authentication, post/get/delete with ownership
//! enforcement, Lamport clock monotonicity, tamper rejection, and the
//! transaction-log merge during directory synchronization.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use ringfs::crypto::{self, WirePublicKey};
use ringfs::envelope::{self, Sender};
use ringfs::identity::Identifier;
use ringfs::messages::{
    self, CallerType, Envelope, Header, Method, Request, Response,
};
use ringfs::transport::Transport;
use ringfs::txlog::Operation;
use ringfs::{Peer, PeerConfig, StoreClient};

const STABILIZE: Duration = Duration::from_millis(200);
const CONVERGE_TIMEOUT: Duration = Duration::from_secs(90);

async fn start_peer(port: u16, bootstrap: Option<ringfs::Node>) -> (Peer, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = PeerConfig::new(format!("127.0.0.1:{port}"), dir.path());
    config.bootstrap = bootstrap;
    config.stabilize_interval = STABILIZE;
    let peer = Peer::start(config).await.expect("peer must start");
    (peer, dir)
}

async fn eventually<F: Fn() -> bool>(check: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return check();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn file_store_end_to_end() {
    let (a, _dir_a) = start_peer(43000, None).await;
    let (b, _dir_b) = start_peer(43001, Some(a.node())).await;
    assert!(
        eventually(
            || {
                a.local().successor_hint() == b.node()
                    && b.local().successor_hint() == a.node()
            },
            CONVERGE_TIMEOUT,
        )
        .await,
        "ring did not converge"
    );

    let anchor_addr = a.addr();
    let anchor_key = a
        .node()
        .public_key
        .to_rsa()
        .expect("peer key must be usable");

    // --- user registration ------------------------------------------------
    let user_key = Arc::new(crypto::generate_keypair().expect("user keygen"));
    let user = StoreClient::new(user_key.clone(), &anchor_addr, &anchor_key);
    user.register().await.expect("user registration");

    let other_key = Arc::new(crypto::generate_keypair().expect("other keygen"));
    let other = StoreClient::new(other_key.clone(), &anchor_addr, &anchor_key);
    other.register().await.expect("second user registration");

    // --- post / get round trip, authenticated by the stored key -----------
    user.post_file("/x", b"hello".to_vec())
        .await
        .expect("post /x");
    assert_eq!(user.get_file("/x").await.expect("get /x"), b"hello");

    // --- ownership: another user is rejected ------------------------------
    assert!(
        other.get_file("/x").await.is_err(),
        "foreign get must be rejected"
    );

    // --- delete then get --------------------------------------------------
    user.delete_file("/x").await.expect("delete /x");
    assert!(user.get_file("/x").await.is_err(), "deleted file must be gone");

    // --- Lamport clocks strictly increase across interactions -------------
    let user_wire = WirePublicKey::from(&user_key.to_public_key());
    let user_id = user_wire.identifier();
    let key_y = Identifier::hash(b"/y");
    let owner = user.locate(key_y).await.expect("locate /y");
    let owner_key = owner.public_key.to_rsa().expect("owner key");

    let make_post = |data: Vec<u8>| Request {
        header: Header {
            key: key_y,
            from: user_id,
            caller: CallerType::User,
            public_key: user_wire.clone(),
            data_length: data.len() as u64,
            resource_name: "/y".to_string(),
            clock: ringfs::clock::get(),
            ..Header::default()
        },
        method: Method::PostFile,
        data,
    };

    let transport = Transport::dial(
        &owner.addr,
        CallerType::User,
        user_id,
        String::new(),
        owner_key.clone(),
        user_key.clone(),
    )
    .await
    .expect("dial owner");
    let first = transport
        .round_trip(&make_post(b"one".to_vec()))
        .await
        .expect("first post");
    assert!(first.is_success());

    let transport = Transport::dial(
        &owner.addr,
        CallerType::User,
        user_id,
        String::new(),
        owner_key.clone(),
        user_key.clone(),
    )
    .await
    .expect("dial owner again");
    let second = transport
        .round_trip(&make_post(b"two".to_vec()))
        .await
        .expect("second post");
    assert!(second.is_success());
    assert!(
        second.header.clock > first.header.clock,
        "response clocks must strictly increase"
    );

    // --- tampered envelope: no success, no state change -------------------
    let evil = make_post(b"EVIL".to_vec());
    let payload = messages::encode(&evil).expect("encode request");
    let sender = Sender {
        caller: CallerType::User,
        from: user_id,
        from_addr: String::new(),
    };
    let mut sealed =
        envelope::seal(&payload, &sender, &owner_key, &user_key).expect("seal request");
    sealed.ciphertext[0] ^= 0x01;
    let frame = messages::encode(&sealed).expect("encode envelope");

    let mut stream = TcpStream::connect(&owner.addr).await.expect("connect");
    messages::write_frame(&mut stream, &frame)
        .await
        .expect("send tampered frame");
    match messages::read_frame(&mut stream).await {
        // the server either answers with an error response...
        Ok(reply) => {
            let received: Envelope = messages::decode(&reply).expect("decode reply envelope");
            let opened = envelope::open(&received, &user_key).expect("open reply");
            let response: Response = messages::decode(&opened).expect("decode reply");
            assert!(!response.is_success(), "tampered request must not succeed");
        }
        // ...or closes the connection without one
        Err(_) => {}
    }
    assert_eq!(
        user.get_file("/y").await.expect("get /y"),
        b"two",
        "tampered post must not change stored content"
    );

    // --- transaction-log merge: remote-newer delete wins -------------------
    let sync_dir = tempfile::tempdir().expect("sync dir");
    user.post_file("/a", b"alpha".to_vec())
        .await
        .expect("post /a");
    let last = user.fetch_log().await.expect("fetch log");
    let history = last.get("/a").expect("log has /a");
    assert_eq!(
        history.current().expect("entry").operation,
        Operation::Update
    );

    tokio::fs::write(sync_dir.path().join("a"), b"alpha")
        .await
        .expect("write local copy");
    user.delete_file("/a").await.expect("delete /a");

    let fetched = user
        .synchronize(sync_dir.path(), &last)
        .await
        .expect("synchronize");
    assert!(
        !sync_dir.path().join("a").exists(),
        "remote-newer delete must remove the local file"
    );
    assert_eq!(
        fetched.get("/a").expect("history").current().expect("entry").operation,
        Operation::Delete
    );

    b.shutdown().await;
    a.shutdown().await;
}
