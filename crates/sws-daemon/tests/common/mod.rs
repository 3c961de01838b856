//! Test harness: a seeded server plus an in-process client that talks
//! the protocol without a socket, driving the same dispatch entry point
//! the reader task uses.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::mpsc;
use x25519_dalek::x25519;

use sws_core::alert::MemorySink;
use sws_core::envelope::Envelope;
use sws_core::protocol::{
    AnalyticsInfo, FingerprintInfo, HandshakeRequest, HandshakeResponse, IdentifyRequest,
    JoinInfo, KeyInfo, Opcode, Packet, SessionInfo, SubInfo, VersionInfo, decode_payload,
    encode_payload,
};
use sws_core::record::{MemoryStore, RecordStore};
use sws_daemon::bridge::PassthroughProtector;
use sws_daemon::stages::{self, Stage};
use sws_daemon::subscription::Subscription;
use sws_daemon::{Server, ServerConfig, SessionError};

/// X25519 base point every test project uses.
pub const PROJECT_POINT: [u8; 32] = [
    9, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0,
];

/// HKDF salt every test project uses.
pub const PROJECT_SALT: &[u8] = b"test-salt-0123456789";

const CLIENT_SCALAR: [u8; 32] = [0x33; 32];

pub struct Harness {
    pub server: Arc<Server>,
    pub memory: Arc<MemoryStore>,
    pub sink: Arc<MemorySink>,
}

impl Harness {
    /// Server over an empty store with the default config.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let memory = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        let store: Arc<dyn RecordStore> = memory.clone();
        let server = Server::new(config, store, sink.clone());
        server.install_bridges(Arc::new(PassthroughProtector));
        Self {
            server,
            memory,
            sink,
        }
    }

    /// Seed one project, one key bound to it, and one script for game
    /// 42.
    pub fn seed_default(&self, role: &str) {
        self.memory
            .load_seed(&format!(
                r#"{{
                    "projects": [
                        {{
                            "id": "P1",
                            "point": "{point}",
                            "salt": "{salt}",
                            "alertWebhook": "http://hooks.test/alert"
                        }}
                    ],
                    "keys": [
                        {{
                            "id": "K1",
                            "discordId": "700100200300",
                            "role": "{role}",
                            "project": "P1"
                        }}
                    ],
                    "scripts": [
                        {{
                            "id": "S1",
                            "project": "P1",
                            "game": 42,
                            "file": "protected.lua",
                            "source": "return nil"
                        }}
                    ]
                }}"#,
                point = BASE64.encode(PROJECT_POINT),
                salt = BASE64.encode(PROJECT_SALT),
            ))
            .expect("seed fixture");
    }

    /// Connect an in-process client. The subscription is registered so
    /// the event bridges can find it, like the runtime would.
    pub fn connect(&self) -> Client {
        let (sub, rx) = Subscription::new(&self.server.config, "203.0.113.77".to_owned());
        self.server.registry.add(sub.clone());
        Client {
            server: self.server.clone(),
            sub,
            rx,
            stage: Stage::Bootstrap,
            envelope: None,
        }
    }
}

pub struct Client {
    pub server: Arc<Server>,
    pub sub: Arc<Subscription>,
    pub rx: mpsc::Receiver<Packet>,
    pub stage: Stage,
    pub envelope: Option<Envelope>,
}

impl Client {
    /// Dispatch one packet the way the reader task would.
    pub async fn drive(&mut self, op: Opcode, msg: Vec<u8>) -> Result<(), SessionError> {
        let packet = Packet { id: op as u8, msg };
        stages::handle_packet(&self.server, &self.sub, &mut self.stage, packet).await
    }

    /// Next queued outbound packet.
    pub fn next_packet(&mut self) -> Packet {
        self.rx.try_recv().expect("expected an outbound packet")
    }

    /// Seal a payload with the client-side envelope.
    pub fn seal<T: serde::Serialize>(&self, payload: &T) -> Vec<u8> {
        self.envelope
            .as_ref()
            .expect("client envelope not derived yet")
            .seal(&encode_payload(payload).unwrap(), &self.sub.envelope_ctx())
    }

    /// Open a sealed server packet with the client-side envelope.
    pub fn open<T: serde::de::DeserializeOwned>(&self, packet: &Packet) -> T {
        let plaintext = self
            .envelope
            .as_ref()
            .expect("client envelope not derived yet")
            .open(&packet.msg, &self.sub.envelope_ctx())
            .expect("sealed packet did not verify");
        decode_payload(&plaintext).expect("sealed payload did not decode")
    }

    /// Run Bootstrap and Handshake, deriving the client envelope from
    /// the server's public point.
    pub async fn boot_and_handshake(&mut self, key_id: &str) {
        self.drive(
            Opcode::Bootstrap,
            encode_payload(&sws_core::protocol::BootRequest {
                key_id: key_id.to_owned(),
                exploit_name: "TestTool".to_owned(),
            })
            .unwrap(),
        )
        .await
        .expect("bootstrap failed");
        let boot_reply = self.next_packet();
        assert_eq!(boot_reply.id, Opcode::Bootstrap as u8);

        let client_public = x25519(CLIENT_SCALAR, PROJECT_POINT);
        self.drive(
            Opcode::Handshake,
            encode_payload(&HandshakeRequest {
                client_public_key: client_public,
            })
            .unwrap(),
        )
        .await
        .expect("handshake failed");

        let reply = self.next_packet();
        assert_eq!(reply.id, Opcode::Handshake as u8);
        let response: HandshakeResponse = decode_payload(&reply.msg).unwrap();

        let shared = x25519(CLIENT_SCALAR, response.server_public_key);
        self.envelope = Some(Envelope::from_shared(&shared, PROJECT_SALT).unwrap());
    }
}

/// A well-formed identity report that passes every policy gate.
pub fn identify_request() -> IdentifyRequest {
    IdentifyRequest {
        key_info: KeyInfo {
            analytics_info: AnalyticsInfo {
                system_locale_id: "en-US".to_owned(),
                output_devices: vec!["Speakers".to_owned()],
                input_devices: vec!["Microphone".to_owned()],
                has_hyperion: true,
                has_touchscreen: false,
                has_gyroscope: false,
                gpu_memory: 8_589_934_592,
                timezone: "America/Chicago".to_owned(),
                region: "US".to_owned(),
                daylight_savings_time: true,
            },
            fingerprint_info: FingerprintInfo {
                device_type: 2,
                exploit_hwid: "HW-TEST-0001".to_owned(),
            },
        },
        sub_info: SubInfo {
            join_info: JoinInfo {
                user_name: "regular_player".to_owned(),
                user_id: 123_456,
                account_age: 900,
                place_id: 42,
                user_groups: vec![1, 2, 3],
                user_following: vec![],
                user_friends: vec![10, 20],
            },
            session_info: SessionInfo {
                os_clock: 512.75,
                play_session_id: "play-abc".to_owned(),
                roblox_session_id: "rbx-abc".to_owned(),
                roblox_client_id: "0B90BB7B-5161-4599-AD5F-B3BBBE0B8A7A".to_owned(),
                workspace_scan: vec!["common.dll".to_owned()],
                log_history: vec![],
            },
            version_info: VersionInfo {
                roblox_client_channel: "LIVE".to_owned(),
                roblox_client_git_hash: "abcdef0".to_owned(),
                roblox_version: "0.600.1".to_owned(),
                core_script_version: "0.600.0".to_owned(),
                lua_version: "Luau".to_owned(),
            },
        },
    }
}
