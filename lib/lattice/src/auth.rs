//! HMAC challenge/response handshake, run over frames with request id 0
//! before any request traffic is accepted.
//!
//! The client opens with its principal name and a random nonce; the node
//! answers with its own nonce; both sides derive
//! `HMAC-SHA256(key, name || client_nonce || node_nonce)` and the client
//! sends the proof. A node that cannot verify the proof closes the socket
//! without a reply. On success the node sends its advertised maximum payload
//! size and protocol minor version.

use crate::parse::{MessageBuilder, MessageParser};
use crate::shared::{NetError, NetResult, Violation};
use ion::credentials::{Credentials, Key};
use ion::crypto;

pub const NONCE_SIZE: usize = 16;
pub const PROOF_SIZE: usize = crypto::HMAC_SIZE;

pub type Nonce = [u8; NONCE_SIZE];

fn proof(key: &Key, name: &str, client_nonce: &Nonce, node_nonce: &Nonce) -> [u8; PROOF_SIZE] {
    crypto::hmac_sha256(key, &[name.as_bytes(), client_nonce, node_nonce])
}

#[derive(Debug, Eq, PartialEq)]
pub enum ClientStep {
    /// The proof payload to send next.
    SendProof(Vec<u8>),
    /// Handshake complete; the node's advertised limits.
    Established { max_payload: u32, minor_version: u16 },
}

enum ClientStage {
    AwaitNonce,
    AwaitWelcome,
    Done,
}

/// Client half of the handshake.
pub struct ClientHandshake {
    name: String,
    key: Key,
    client_nonce: Nonce,
    stage: ClientStage,
}

impl ClientHandshake {
    pub fn new(name: &str, key: &Key) -> ClientHandshake {
        let mut client_nonce = [0u8; NONCE_SIZE];
        crypto::random_bytes(&mut client_nonce);

        ClientHandshake {
            name: name.to_string(),
            key: *key,
            client_nonce,
            stage: ClientStage::AwaitNonce,
        }
    }

    /// The opening payload: principal name and client nonce.
    pub fn hello(&self) -> Vec<u8> {
        let mut builder = MessageBuilder::new();
        builder.add_string(&self.name).add_value(self.client_nonce);
        builder.into_payload()
    }

    pub fn on_frame(&mut self, payload: &[u8]) -> NetResult<ClientStep> {
        match self.stage {
            ClientStage::AwaitNonce => {
                let mut parser = MessageParser::new(payload);
                let node_nonce: Nonce = parser.get_value()?;
                parser.finish()?;

                let proof = proof(&self.key, &self.name, &self.client_nonce, &node_nonce);

                let mut builder = MessageBuilder::new();
                builder.add_value(proof);

                self.stage = ClientStage::AwaitWelcome;
                Ok(ClientStep::SendProof(builder.into_payload()))
            }
            ClientStage::AwaitWelcome => {
                let mut parser = MessageParser::new(payload);
                let max_payload: u32 = parser.get_value()?;
                let minor_version: u16 = parser.get_value()?;
                parser.finish()?;

                self.stage = ClientStage::Done;
                Ok(ClientStep::Established {
                    max_payload,
                    minor_version,
                })
            }
            ClientStage::Done => Err(NetError::Fatal(Violation::HandshakeDesync)),
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum NodeStep {
    /// The node nonce payload to send next.
    SendNonce(Vec<u8>),
    /// Proof verified. `welcome` carries the advertised limits and must be
    /// sent before any request frame is answered.
    Established { principal: String, welcome: Vec<u8> },
}

enum NodeStage {
    AwaitHello,
    AwaitProof { name: String, expected: [u8; PROOF_SIZE] },
    Done,
}

/// Node half of the handshake.
pub struct NodeHandshake {
    node_nonce: Nonce,
    max_payload: u32,
    minor_version: u16,
    stage: NodeStage,
}

impl NodeHandshake {
    pub fn new(max_payload: u32, minor_version: u16) -> NodeHandshake {
        let mut node_nonce = [0u8; NONCE_SIZE];
        crypto::random_bytes(&mut node_nonce);

        NodeHandshake {
            node_nonce,
            max_payload,
            minor_version,
            stage: NodeStage::AwaitHello,
        }
    }

    pub fn on_frame(&mut self, payload: &[u8], credentials: &Credentials) -> NetResult<NodeStep> {
        match &self.stage {
            NodeStage::AwaitHello => {
                let mut parser = MessageParser::new(payload);
                let name = parser.get_string()?;
                let client_nonce: Nonce = parser.get_value()?;
                parser.finish()?;

                let key = match credentials.key(&name) {
                    Some(key) => key,
                    None => return Err(NetError::Fatal(Violation::UnknownPrincipal)),
                };

                let expected = proof(key, &name, &client_nonce, &self.node_nonce);

                let mut builder = MessageBuilder::new();
                builder.add_value(self.node_nonce);

                self.stage = NodeStage::AwaitProof { name, expected };
                Ok(NodeStep::SendNonce(builder.into_payload()))
            }
            NodeStage::AwaitProof { name, expected } => {
                let mut parser = MessageParser::new(payload);
                let supplied: [u8; PROOF_SIZE] = parser.get_value()?;
                parser.finish()?;

                if !crypto::constant_time_eq(&supplied, expected) {
                    return Err(NetError::Fatal(Violation::AuthenticationFailed));
                }

                let principal = name.clone();

                let mut builder = MessageBuilder::new();
                builder.add_value(self.max_payload).add_value(self.minor_version);

                self.stage = NodeStage::Done;
                Ok(NodeStep::Established {
                    principal,
                    welcome: builder.into_payload(),
                })
            }
            NodeStage::Done => Err(NetError::Fatal(Violation::HandshakeDesync)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_PAYLOAD: u32 = 65536;
    const MINOR_VERSION: u16 = 1;

    fn credentials() -> Credentials {
        Credentials::parse(&format!("test:{}\n", "0".repeat(64))).unwrap()
    }

    fn run_handshake(
        client: &mut ClientHandshake,
        node: &mut NodeHandshake,
        creds: &Credentials,
    ) -> NetResult<(String, u32, u16)> {
        let nonce_payload = match node.on_frame(&client.hello(), creds)? {
            NodeStep::SendNonce(payload) => payload,
            step => panic!("Unexpected node step {:?}", step),
        };

        let proof_payload = match client.on_frame(&nonce_payload)? {
            ClientStep::SendProof(payload) => payload,
            step => panic!("Unexpected client step {:?}", step),
        };

        let (principal, welcome) = match node.on_frame(&proof_payload, creds)? {
            NodeStep::Established { principal, welcome } => (principal, welcome),
            step => panic!("Unexpected node step {:?}", step),
        };

        match client.on_frame(&welcome)? {
            ClientStep::Established {
                max_payload,
                minor_version,
            } => Ok((principal, max_payload, minor_version)),
            step => panic!("Unexpected client step {:?}", step),
        }
    }

    #[test]
    fn test_successful_handshake() {
        let creds = credentials();
        let mut client = ClientHandshake::new("test", &[0u8; 32]);
        let mut node = NodeHandshake::new(MAX_PAYLOAD, MINOR_VERSION);

        let (principal, max_payload, minor) = run_handshake(&mut client, &mut node, &creds).unwrap();

        assert_eq!(principal, "test");
        assert_eq!(max_payload, MAX_PAYLOAD);
        assert_eq!(minor, MINOR_VERSION);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let creds = credentials();
        let mut client = ClientHandshake::new("test", &[1u8; 32]);
        let mut node = NodeHandshake::new(MAX_PAYLOAD, MINOR_VERSION);

        let result = run_handshake(&mut client, &mut node, &creds);

        assert_eq!(result.unwrap_err(), NetError::Fatal(Violation::AuthenticationFailed));
    }

    #[test]
    fn test_unknown_name_rejected() {
        let creds = credentials();
        let mut client = ClientHandshake::new("stranger", &[0u8; 32]);
        let mut node = NodeHandshake::new(MAX_PAYLOAD, MINOR_VERSION);

        let result = node.on_frame(&client.hello(), &creds);

        assert_eq!(result.unwrap_err(), NetError::Fatal(Violation::UnknownPrincipal));
    }

    #[test]
    fn test_nonce_affects_proof() {
        let mut first = ClientHandshake::new("test", &[0u8; 32]);
        let mut second = ClientHandshake::new("test", &[0u8; 32]);
        let node_nonce_payload = {
            let mut builder = MessageBuilder::new();
            builder.add_value([7u8; NONCE_SIZE]);
            builder.into_payload()
        };

        let lhs = match first.on_frame(&node_nonce_payload).unwrap() {
            ClientStep::SendProof(payload) => payload,
            step => panic!("Unexpected step {:?}", step),
        };
        let rhs = match second.on_frame(&node_nonce_payload).unwrap() {
            ClientStep::SendProof(payload) => payload,
            step => panic!("Unexpected step {:?}", step),
        };

        // Distinct client nonces produce distinct proofs under the same key.
        assert_ne!(lhs, rhs);
    }

    #[test]
    fn test_frame_after_completion_desyncs() {
        let creds = credentials();
        let mut client = ClientHandshake::new("test", &[0u8; 32]);
        let mut node = NodeHandshake::new(MAX_PAYLOAD, MINOR_VERSION);

        run_handshake(&mut client, &mut node, &creds).unwrap();

        assert_eq!(
            node.on_frame(&[], &creds).unwrap_err(),
            NetError::Fatal(Violation::HandshakeDesync)
        );
        assert_eq!(
            client.on_frame(&[]).unwrap_err(),
            NetError::Fatal(Violation::HandshakeDesync)
        );
    }

    #[test]
    fn test_truncated_hello_rejected() {
        let creds = credentials();
        let mut node = NodeHandshake::new(MAX_PAYLOAD, MINOR_VERSION);

        let mut builder = MessageBuilder::new();
        builder.add_string("test");

        let result = node.on_frame(&builder.into_payload(), &creds);

        match result {
            Err(NetError::Fatal(Violation::MessageTooShort { .. })) => (),
            other => panic!("Unexpected result {:?}", other),
        }
    }
}
