//! End-to-end dispatch tests for the stage progression, the policy
//! gates, and the event bridge.

mod common;

use sws_core::protocol::{
    BootRequest, BootResponse, DropPacket, FreezePacket, HandshakeRequest, IdentifyResponse,
    KeyUpdatePacket, LoadRequest, LoadResponse, Opcode, decode_payload, encode_payload,
};
use sws_core::record::{FieldMap, RecordStore, Value};
use sws_daemon::SessionError;
use sws_daemon::subscription::state;

use common::{Harness, identify_request};

#[tokio::test]
async fn happy_path_reaches_loaded() {
    let harness = Harness::new();
    harness.seed_default("player");
    let mut client = harness.connect();

    // Bootstrap.
    client
        .drive(
            Opcode::Bootstrap,
            encode_payload(&BootRequest {
                key_id: "K1".to_owned(),
                exploit_name: "TestTool".to_owned(),
            })
            .unwrap(),
        )
        .await
        .unwrap();

    let reply = client.next_packet();
    assert_eq!(reply.id, Opcode::Bootstrap as u8);
    let boot: BootResponse = decode_payload(&reply.msg).unwrap();
    assert_eq!(boot.base_timestamp, client.sub.base_timestamp);
    assert_eq!(boot.sub_id, *client.sub.sub_id.as_bytes());
    assert!(client.sub.has_state(state::BOOTSTRAPPED));

    // Handshake.
    let client_public = x25519_dalek::x25519(
        [0x33; 32],
        common::PROJECT_POINT,
    );
    client
        .drive(
            Opcode::Handshake,
            encode_payload(&HandshakeRequest {
                client_public_key: client_public,
            })
            .unwrap(),
        )
        .await
        .unwrap();

    let reply = client.next_packet();
    assert_eq!(reply.id, Opcode::Handshake as u8);
    let response: sws_core::protocol::HandshakeResponse = decode_payload(&reply.msg).unwrap();
    let shared = x25519_dalek::x25519([0x33; 32], response.server_public_key);
    client.envelope =
        Some(sws_core::envelope::Envelope::from_shared(&shared, common::PROJECT_SALT).unwrap());
    assert!(client.sub.has_state(state::HANDSHAKED));

    // Identify, sealed both ways.
    let sealed = client.seal(&identify_request());
    client.drive(Opcode::Identify, sealed).await.unwrap();

    let reply = client.next_packet();
    assert_eq!(reply.id, Opcode::Identify as u8);
    let identify: IdentifyResponse = client.open(&reply);
    assert_eq!(identify.current_role, "player");
    assert!(client.sub.has_state(state::IDENTIFIED));

    // Load.
    let sealed = client.seal(&LoadRequest { game_id: 42 });
    client.drive(Opcode::Load, sealed).await.unwrap();

    let reply = client.next_packet();
    assert_eq!(reply.id, Opcode::Load as u8);
    let load: LoadResponse = client.open(&reply);
    assert_eq!(load.script_id, "S1");

    assert!(client.sub.has_state(
        state::BOOTSTRAPPED | state::HANDSHAKED | state::IDENTIFIED | state::LOADED
    ));
    assert!(!client.sub.is_closing());

    // The per-connection rows exist exactly once.
    assert_eq!(harness.memory.count("subscriptions"), 1);
    assert_eq!(harness.memory.count("sessions"), 1);
    assert_eq!(harness.memory.count("joins"), 1);
    assert_eq!(harness.memory.count("analytics"), 1);
    assert_eq!(harness.memory.count("fingerprints"), 1);
}

#[tokio::test]
async fn wrong_lua_version_blacklists_the_key() {
    let harness = Harness::new();
    harness.seed_default("player");
    let mut client = harness.connect();
    client.boot_and_handshake("K1").await;

    let mut report = identify_request();
    report.sub_info.version_info.lua_version = "Lua 5.1".to_owned();
    let sealed = client.seal(&report);

    let err = client.drive(Opcode::Identify, sealed).await.unwrap_err();
    assert!(matches!(err, SessionError::Blacklisted));

    // The record update went through.
    let key = harness.memory.find_record_by_id("keys", "K1").unwrap();
    assert_eq!(key.get_str("blacklist"), "invalid lua version");

    // One blacklist alert was posted to the project webhook.
    let posts = harness.sink.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].0, "http://hooks.test/alert");
    assert_eq!(
        posts[0].1["embeds"][0]["title"],
        "Automated 'Blacklist Key' Alert"
    );

    // The client sees the enforcement reason, not the bridge's.
    let drop: DropPacket = decode_payload(&client.next_packet().msg).unwrap();
    assert_eq!(drop.reason, "you have been blacklisted");
    assert_eq!(client.sub.close_reason(), Some("you have been blacklisted"));
    assert!(!client.sub.has_state(state::IDENTIFIED));
}

#[tokio::test]
async fn out_of_stage_packet_drops_without_records() {
    let harness = Harness::new();
    harness.seed_default("player");
    let mut client = harness.connect();

    // Handshake before Bootstrap.
    let err = client
        .drive(
            Opcode::Handshake,
            encode_payload(&HandshakeRequest {
                client_public_key: [1; 32],
            })
            .unwrap(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::OutOfStage { .. }));
    let drop: DropPacket = decode_payload(&client.next_packet().msg).unwrap();
    assert_eq!(drop.reason, "handler is not in the correct state");

    assert_eq!(harness.memory.count("subscriptions"), 0);
    assert_eq!(harness.memory.count("sessions"), 0);
}

#[tokio::test]
async fn tampered_ciphertext_drops_without_records() {
    let harness = Harness::new();
    harness.seed_default("player");
    let mut client = harness.connect();
    client.boot_and_handshake("K1").await;

    let mut sealed = client.seal(&identify_request());
    let last = sealed.len() - 1;
    sealed[last] ^= 0x01;

    let err = client.drive(Opcode::Identify, sealed).await.unwrap_err();
    assert!(matches!(err, SessionError::Envelope(_)));

    let drop: DropPacket = decode_payload(&client.next_packet().msg).unwrap();
    assert_eq!(drop.reason, "mac signature verification failed");

    assert_eq!(harness.memory.count("subscriptions"), 0);
    assert!(!client.sub.has_state(state::IDENTIFIED));
}

#[tokio::test]
async fn pentester_keys_only_load_the_baseplate() {
    let harness = Harness::new();
    harness.seed_default("pentest");
    let mut client = harness.connect();
    client.boot_and_handshake("K1").await;

    let sealed = client.seal(&identify_request());
    client.drive(Opcode::Identify, sealed).await.unwrap();
    let _identify_reply = client.next_packet();

    // Seed a script for the non-baseplate game so the script lookup
    // itself succeeds.
    harness
        .memory
        .create(
            "scripts",
            FieldMap::from([
                ("id".to_owned(), Value::from("S999")),
                ("project".to_owned(), Value::from("P1")),
                ("game".to_owned(), Value::from(999u64)),
                ("file".to_owned(), Value::from("protected.lua")),
            ]),
        )
        .unwrap();

    let sealed = client.seal(&LoadRequest { game_id: 999 });
    let err = client.drive(Opcode::Load, sealed).await.unwrap_err();

    assert!(matches!(err, SessionError::Policy(_)));
    let drop: DropPacket = decode_payload(&client.next_packet().msg).unwrap();
    assert_eq!(drop.reason, "pentester roles can only load in a baseplate game");
    assert!(!client.sub.has_state(state::LOADED));
}

#[tokio::test]
async fn key_update_is_pushed_to_loaded_subscriptions() {
    let harness = Harness::new();
    harness.seed_default("player");
    let mut client = harness.connect();
    client.boot_and_handshake("K1").await;

    let sealed = client.seal(&identify_request());
    client.drive(Opcode::Identify, sealed).await.unwrap();
    let _identify_reply = client.next_packet();

    let sealed = client.seal(&LoadRequest { game_id: 42 });
    client.drive(Opcode::Load, sealed).await.unwrap();
    let _load_reply = client.next_packet();

    // An external role change lands on the key record.
    let mut key = harness.memory.find_record_by_id("keys", "K1").unwrap();
    key.set("role", "moderator");
    harness.memory.save(&key).unwrap();

    // The bridge pushed a sealed KeyUpdate through the existing
    // envelope.
    let packet = client.next_packet();
    assert_eq!(packet.id, Opcode::KeyUpdate as u8);
    let update: KeyUpdatePacket = client.open(&packet);
    assert_eq!(update.role, "moderator");
    assert!(!client.sub.is_closing());
}

#[tokio::test]
async fn external_blacklist_drops_the_subscription() {
    let harness = Harness::new();
    harness.seed_default("player");
    let mut client = harness.connect();
    client.boot_and_handshake("K1").await;

    let mut key = harness.memory.find_record_by_id("keys", "K1").unwrap();
    key.set("blacklist", "manual review");
    harness.memory.save(&key).unwrap();

    let drop: DropPacket = decode_payload(&client.next_packet().msg).unwrap();
    assert_eq!(drop.reason, "key got blacklisted");
    assert!(client.sub.is_closing());
}

#[tokio::test]
async fn expired_keys_are_refused_strictly_before() {
    let harness = Harness::new();
    harness.seed_default("player");
    let mut client = harness.connect();

    // Expiry exactly at the base timestamp is still valid.
    let mut key = harness.memory.find_record_by_id("keys", "K1").unwrap();
    key.set("expiry", client.sub.base_timestamp as i64);
    harness.memory.save(&key).unwrap();

    client
        .drive(
            Opcode::Bootstrap,
            encode_payload(&BootRequest {
                key_id: "K1".to_owned(),
                exploit_name: "TestTool".to_owned(),
            })
            .unwrap(),
        )
        .await
        .unwrap();
    let _boot_reply = client.next_packet();

    // One second earlier is expired.
    let harness = Harness::new();
    harness.seed_default("player");
    let mut client = harness.connect();
    let mut key = harness.memory.find_record_by_id("keys", "K1").unwrap();
    key.set("expiry", client.sub.base_timestamp as i64 - 1);
    harness.memory.save(&key).unwrap();

    let err = client
        .drive(
            Opcode::Bootstrap,
            encode_payload(&BootRequest {
                key_id: "K1".to_owned(),
                exploit_name: "TestTool".to_owned(),
            })
            .unwrap(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.close_reason(), "key expired");
}

#[tokio::test]
async fn unknown_key_is_refused() {
    let harness = Harness::new();
    harness.seed_default("player");
    let mut client = harness.connect();

    let err = client
        .drive(
            Opcode::Bootstrap,
            encode_payload(&BootRequest {
                key_id: "NOPE".to_owned(),
                exploit_name: "TestTool".to_owned(),
            })
            .unwrap(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.close_reason(), "key not found");
}

#[tokio::test]
async fn freeze_reports_are_accepted_in_any_post_handshake_stage() {
    let harness = Harness::new();
    harness.seed_default("player");
    let mut client = harness.connect();
    client.boot_and_handshake("K1").await;

    // A freeze between Handshake and Identify neither advances nor
    // closes.
    let sealed = client.seal(&FreezePacket { seconds: 2.5 });
    client.drive(Opcode::Freeze, sealed).await.unwrap();
    assert!(!client.sub.is_closing());

    // The subscription can still identify afterwards.
    let sealed = client.seal(&identify_request());
    client.drive(Opcode::Identify, sealed).await.unwrap();
    assert!(client.sub.has_state(state::IDENTIFIED));
}

#[tokio::test]
async fn freeze_before_handshake_is_out_of_stage() {
    let harness = Harness::new();
    harness.seed_default("player");
    let mut client = harness.connect();

    let err = client
        .drive(
            Opcode::Freeze,
            encode_payload(&FreezePacket { seconds: 1.0 }).unwrap(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::OutOfStage { .. }));
}

#[tokio::test]
async fn steady_state_accepts_no_client_packets() {
    let harness = Harness::new();
    harness.seed_default("player");
    let mut client = harness.connect();
    client.boot_and_handshake("K1").await;

    let sealed = client.seal(&identify_request());
    client.drive(Opcode::Identify, sealed).await.unwrap();
    let _identify_reply = client.next_packet();
    let sealed = client.seal(&LoadRequest { game_id: 42 });
    client.drive(Opcode::Load, sealed).await.unwrap();
    let _load_reply = client.next_packet();

    // A second Load in the steady state is a protocol error.
    let sealed = client.seal(&LoadRequest { game_id: 42 });
    let err = client.drive(Opcode::Load, sealed).await.unwrap_err();
    assert!(matches!(err, SessionError::OutOfStage { .. }));
}

#[tokio::test]
async fn testing_mode_logs_but_does_not_persist_blacklists() {
    let mut config = sws_daemon::ServerConfig::default();
    config.testing_mode = true;
    let harness = Harness::with_config(config);
    harness.seed_default("player");
    let mut client = harness.connect();
    client.boot_and_handshake("K1").await;

    let mut report = identify_request();
    report.sub_info.version_info.lua_version = "Lua 5.1".to_owned();
    let sealed = client.seal(&report);
    let err = client.drive(Opcode::Identify, sealed).await.unwrap_err();
    assert!(matches!(err, SessionError::Blacklisted));

    // The connection still closed and alerted, but the record is
    // untouched.
    let key = harness.memory.find_record_by_id("keys", "K1").unwrap();
    assert_eq!(key.get_str("blacklist"), "");
    assert_eq!(harness.sink.posts().len(), 1);
    assert_eq!(client.sub.close_reason(), Some("you have been blacklisted"));
}

#[tokio::test]
async fn hwid_mismatch_closes_without_blacklisting() {
    let harness = Harness::new();
    harness.seed_default("player");

    // First identify pins the fingerprint.
    let mut client = harness.connect();
    client.boot_and_handshake("K1").await;
    let sealed = client.seal(&identify_request());
    client.drive(Opcode::Identify, sealed).await.unwrap();
    let _identify_reply = client.next_packet();

    // A second connection with a different HWID mismatches.
    let mut second = harness.connect();
    second.boot_and_handshake("K1").await;
    let mut report = identify_request();
    report.key_info.fingerprint_info.exploit_hwid = "HW-CHANGED".to_owned();
    let sealed = second.seal(&report);

    let err = second.drive(Opcode::Identify, sealed).await.unwrap_err();
    let reason = err.close_reason();
    assert!(
        reason.starts_with("reset your HWID on the panel"),
        "unexpected reason: {reason}"
    );

    // Closed, not blacklisted.
    let key = harness.memory.find_record_by_id("keys", "K1").unwrap();
    assert_eq!(key.get_str("blacklist"), "");
}
