//! Full-handshake tests: a real client driver against a real responder
//! over an in-memory transport pair.

use std::sync::Arc;
use std::time::Duration;

use glyphchat_client::crypto::handshake::{
    ClientHandshake, HandshakeError, HandshakeOutcome, HandshakeState, ServerHandshake,
};
use glyphchat_client::crypto::identity::{ClientWhitelist, IdentityKeypair, KnownHosts, hex_encode};
use glyphchat_client::transport::{MemoryTransport, PacketTransport};
use glyphchat_protocol::error::CryptoError;
use glyphchat_protocol::packet::Packet;

fn server_identity() -> Arc<IdentityKeypair> {
    Arc::new(IdentityKeypair::generate())
}

async fn run_pair(
    mut client: ClientHandshake,
    mut server: ServerHandshake,
) -> (
    Result<HandshakeOutcome, HandshakeError>,
    Result<HandshakeOutcome, HandshakeError>,
    Vec<HandshakeState>,
) {
    let (client_side, server_side) = MemoryTransport::pair();
    let (client_result, server_result) = tokio::join!(
        client.run(&client_side),
        server.run(&server_side),
    );
    (client_result, server_result, client.trace().to_vec())
}

#[tokio::test]
async fn encrypted_handshake_reaches_ready_on_both_sides() {
    let identity = server_identity();
    let client = ClientHandshake::new("127.0.0.1", 27224);
    let server = ServerHandshake::new(identity);

    let (client_result, server_result, trace) = run_pair(client, server).await;
    let client_outcome = client_result.expect("client handshake");
    let server_outcome = server_result.expect("server handshake");

    assert_eq!(client_outcome.state, HandshakeState::Ready);
    assert_eq!(server_outcome.state, HandshakeState::Ready);
    assert_eq!(
        trace,
        vec![
            HandshakeState::Init,
            HandshakeState::KeyExchange,
            HandshakeState::Authenticating,
            HandshakeState::Ready,
        ]
    );

    // Both sides hold byte-identical session keys: a packet sealed by one
    // opens on the other.
    let client_crypto = client_outcome.crypto.expect("client crypto");
    let server_crypto = server_outcome.crypto.expect("server crypto");
    let Packet::Encrypted { nonce, ciphertext } =
        client_crypto.seal(&Packet::Ping.to_frame()).unwrap()
    else {
        unreachable!()
    };
    server_crypto.open(&nonce, &ciphertext).expect("shared key");
}

#[tokio::test]
async fn no_encrypt_finishes_disabled_with_cleartext_packets() {
    let identity = server_identity();
    let mut client = ClientHandshake::new("127.0.0.1", 27224);
    client.encrypt = false;
    let server = ServerHandshake::new(identity);

    let (client_result, server_result, trace) = run_pair(client, server).await;
    let client_outcome = client_result.expect("client handshake");
    let server_outcome = server_result.expect("server handshake");

    assert_eq!(client_outcome.state, HandshakeState::Disabled);
    assert_eq!(server_outcome.state, HandshakeState::Disabled);
    assert!(client_outcome.crypto.is_none());
    assert!(server_outcome.crypto.is_none());
    assert_eq!(*trace.last().unwrap(), HandshakeState::Disabled);
}

#[tokio::test]
async fn plaintext_client_rejected_when_server_requires_encryption() {
    let identity = server_identity();
    let mut client = ClientHandshake::new("127.0.0.1", 27224);
    client.encrypt = false;
    let mut server = ServerHandshake::new(identity);
    server.allow_plaintext = false;

    let (client_result, server_result, _) = run_pair(client, server).await;
    // The server refuses; the client sees its NoEncryption answered with
    // AuthFailed... or a closed transport, depending on timing.
    assert!(server_result.is_err());
    let _ = client_result;
}

#[tokio::test]
async fn first_contact_records_fingerprint_then_matches() {
    let dir = tempfile::tempdir().unwrap();
    let hosts_path = dir.path().join("known_hosts");
    let identity = server_identity();
    let expected_fp = identity.fingerprint();

    for round in 0..2 {
        let mut client = ClientHandshake::new("127.0.0.1", 27224);
        client.known_hosts = Some(KnownHosts::open(&hosts_path));
        let server = ServerHandshake::new(Arc::clone(&identity));
        let (client_result, server_result, _) = run_pair(client, server).await;
        client_result.unwrap_or_else(|e| panic!("round {round}: {e}"));
        server_result.unwrap();
    }

    // Exactly one record written across both rounds.
    let contents = std::fs::read_to_string(&hosts_path).unwrap();
    let lines: Vec<&str> = contents.lines().filter(|l| !l.is_empty()).collect();
    assert_eq!(lines.len(), 1, "second contact must not append: {contents}");
    assert!(lines[0].starts_with("127.0.0.1:27224 ed25519"));
    assert!(lines[0].contains(&expected_fp));
}

#[tokio::test]
async fn known_hosts_mismatch_fails_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let hosts_path = dir.path().join("known_hosts");
    let hosts = KnownHosts::open(&hosts_path);
    hosts
        .record("127.0.0.1", 27224, &"a".repeat(64), "stale-entry")
        .unwrap();

    let mut client = ClientHandshake::new("127.0.0.1", 27224);
    client.known_hosts = Some(KnownHosts::open(&hosts_path));
    let server = ServerHandshake::new(server_identity());

    let (client_result, _server_result, trace) = run_pair(client, server).await;
    let err = client_result.expect_err("mismatch must fail");
    assert!(err.is_auth_failure(), "got {err:?}");
    assert_eq!(*trace.last().unwrap(), HandshakeState::Failed);
}

#[tokio::test]
async fn pinned_fingerprint_mismatch_fails() {
    let mut client = ClientHandshake::new("127.0.0.1", 27224);
    client.expected_fingerprint = Some("f".repeat(64));
    let server = ServerHandshake::new(server_identity());

    let (client_result, _, _) = run_pair(client, server).await;
    assert!(client_result.expect_err("pin mismatch").is_auth_failure());
}

#[tokio::test]
async fn whitelisted_client_key_is_accepted() {
    let client_identity = Arc::new(IdentityKeypair::generate());
    let whitelist = ClientWhitelist::parse(&format!(
        "ed25519 {} alice\n",
        hex_encode(&client_identity.public_key_bytes())
    ));

    let mut client = ClientHandshake::new("127.0.0.1", 27224);
    client.identity = Some(Arc::clone(&client_identity));
    let mut server = ServerHandshake::new(server_identity());
    server.whitelist = Some(whitelist);

    let (client_result, server_result, _) = run_pair(client, server).await;
    assert_eq!(client_result.unwrap().state, HandshakeState::Ready);
    let server_outcome = server_result.unwrap();
    assert_eq!(
        server_outcome.peer_identity,
        Some(client_identity.public_key_bytes())
    );
}

#[tokio::test]
async fn unlisted_client_key_is_refused_with_reason() {
    let client_identity = Arc::new(IdentityKeypair::generate());
    let someone_else = IdentityKeypair::generate();
    let whitelist = ClientWhitelist::parse(&format!(
        "ed25519 {} not-you\n",
        hex_encode(&someone_else.public_key_bytes())
    ));

    let mut client = ClientHandshake::new("127.0.0.1", 27224);
    client.identity = Some(client_identity);
    let mut server = ServerHandshake::new(server_identity());
    server.whitelist = Some(whitelist);

    let (client_result, server_result, _) = run_pair(client, server).await;
    match client_result {
        Err(HandshakeError::Crypto(CryptoError::Auth(reason))) => {
            assert_eq!(reason, "client key not in whitelist");
        }
        other => panic!("expected auth failure with server reason, got {other:?}"),
    }
    assert!(server_result.is_err());
}

#[tokio::test]
async fn password_auth_accepts_correct_and_rejects_wrong() {
    // Correct password.
    let mut client = ClientHandshake::new("127.0.0.1", 27224);
    client.password = Some("correct horse battery staple".into());
    let mut server = ServerHandshake::new(server_identity());
    server.password = Some("correct horse battery staple".into());
    let (client_result, server_result, _) = run_pair(client, server).await;
    assert_eq!(client_result.unwrap().state, HandshakeState::Ready);
    assert_eq!(server_result.unwrap().state, HandshakeState::Ready);

    // Wrong password.
    let mut client = ClientHandshake::new("127.0.0.1", 27224);
    client.password = Some("wrong".into());
    let mut server = ServerHandshake::new(server_identity());
    server.password = Some("correct horse battery staple".into());
    let (client_result, _, _) = run_pair(client, server).await;
    match client_result {
        Err(HandshakeError::Crypto(CryptoError::Auth(reason))) => {
            assert_eq!(reason, "invalid password");
        }
        other => panic!("expected invalid-password failure, got {other:?}"),
    }
}

#[tokio::test]
async fn client_without_required_password_fails_locally() {
    let mut server = ServerHandshake::new(server_identity());
    server.password = Some("secret".into());
    let client = ClientHandshake::new("127.0.0.1", 27224);

    let (client_result, _, _) = run_pair(client, server).await;
    assert!(client_result.expect_err("missing password").is_auth_failure());
}

#[tokio::test]
async fn misbehaving_peer_drives_state_to_failed_quickly() {
    let (client_side, rogue_side) = MemoryTransport::pair();

    let rogue = tokio::spawn(async move {
        // Answer the version exchange with nonsense.
        let _ = rogue_side.recv().await;
        rogue_side.send(&Packet::Ping).await.unwrap();
        // Keep the transport alive until the client gives up.
        let _ = rogue_side.recv().await;
    });

    let mut client = ClientHandshake::new("127.0.0.1", 27224);
    let result = tokio::time::timeout(Duration::from_secs(5), client.run(&client_side))
        .await
        .expect("must fail fast, not hang");
    let err = result.expect_err("rogue peer must fail the handshake");
    assert!(matches!(
        err,
        HandshakeError::Crypto(CryptoError::UnexpectedPacket { .. })
    ));
    // Init → Failed with no intermediate regressions.
    assert_eq!(
        client.trace(),
        &[HandshakeState::Init, HandshakeState::Failed]
    );
    // The failed handshake closes its transport.
    assert!(client_side.send(&Packet::Ping).await.is_err());
    rogue.abort();
    let _ = rogue.await;
}

#[tokio::test]
async fn mutual_auth_verifies_server_knows_session_key() {
    // A normal run proves the positive path (AuthSuccess carries the HMAC
    // over the client nonce and the client checks it).
    let client = ClientHandshake::new("127.0.0.1", 27224);
    let server = ServerHandshake::new(server_identity());
    let (client_result, _, _) = run_pair(client, server).await;
    assert_eq!(client_result.unwrap().state, HandshakeState::Ready);
}
