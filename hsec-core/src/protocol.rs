//! Wire protocol: message tags, outbound builders and typed inbound parsing.

use crate::wire::{self, join_fields, FieldDecodeError};

pub const PAIR_REQUEST: &[u8] = b"pair-request";
pub const PAIR_ACK: &[u8] = b"pair-ack";
pub const BAD_CODE: &[u8] = b"bad-code";
pub const LINK_REQUEST: &[u8] = b"link-request";
pub const RELINK_REQUEST: &[u8] = b"relink-request";
pub const REPAIR: &[u8] = b"repair";
pub const REPAIR_ACK: &[u8] = b"repair-ack";
pub const FRAME_DATA: &[u8] = b"frame-data";
pub const UNPAIR: &[u8] = b"unpair";

/// Key-exchange hello prefix, identical in both directions.
pub const HELLO_TAGS: [&[u8]; 3] = [b"exch", b"ecdh", b"aes"];

pub const CONFIRM: &[u8] = b"confirm";
pub const CONFIRM_PAIR: &[u8] = b"confirm-pair";
pub const CONFIRM_PAIR_ACK: &[u8] = b"confirm-pair-ack";

/// Inbound messages the device acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Discovery ack: server stream port and the pairing code it was given.
    PairAck { stream_port: u16, code: Vec<u8> },
    /// Server asks a device to forget the session. Older servers omit the device id.
    Unpair { device_id: Option<Vec<u8>> },
    /// Server half of the key exchange.
    ServerHello { public_key: Vec<u8> },
    /// Repair challenge: ciphertext of `confirm-pair`.
    Repair { challenge: Vec<u8> },
}

/// Parse a discovery-channel datagram. Exactly three fields for an ack.
pub fn parse_discovery(buf: &[u8]) -> Result<Inbound, ProtocolError> {
    let fields = split(buf, 1)?;
    match fields[0].as_slice() {
        PAIR_ACK => {
            if fields.len() != 3 {
                return Err(ProtocolError::FieldCount {
                    expected: 3,
                    got: fields.len(),
                });
            }
            let stream_port = std::str::from_utf8(&fields[1])
                .ok()
                .and_then(|s| s.parse::<u16>().ok())
                .filter(|p| *p != 0)
                .ok_or(ProtocolError::BadPort)?;
            Ok(Inbound::PairAck {
                stream_port,
                code: fields[2].clone(),
            })
        }
        UNPAIR => Ok(Inbound::Unpair {
            device_id: fields.get(1).cloned(),
        }),
        other => Err(ProtocolError::UnexpectedTag(lossy(other))),
    }
}

/// Parse the server hello. The key is re-joined since raw key bytes may contain the separator.
pub fn parse_server_hello(buf: &[u8]) -> Result<Inbound, ProtocolError> {
    let fields = split(buf, 4)?;
    for (field, tag) in fields.iter().zip(HELLO_TAGS.iter()) {
        if field.as_slice() != *tag {
            return Err(ProtocolError::UnexpectedTag(lossy(field)));
        }
    }
    Ok(Inbound::ServerHello {
        public_key: join_fields(&fields, 3),
    })
}

/// Parse the repair challenge `{repair, ciphertext}`.
pub fn parse_repair(buf: &[u8]) -> Result<Inbound, ProtocolError> {
    let fields = split(buf, 2)?;
    if fields[0].as_slice() != REPAIR {
        return Err(ProtocolError::UnexpectedTag(lossy(&fields[0])));
    }
    Ok(Inbound::Repair {
        challenge: join_fields(&fields, 1),
    })
}

fn split(buf: &[u8], min: usize) -> Result<Vec<Vec<u8>>, ProtocolError> {
    wire::decode_at_least(buf, min).map_err(|e| match e {
        FieldDecodeError::Empty => ProtocolError::Empty,
        FieldDecodeError::TooFewFields { expected, got } => {
            ProtocolError::FieldCount { expected, got }
        }
    })
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

pub fn pair_request(device_id: &str) -> Vec<u8> {
    wire::encode_fields(&[PAIR_REQUEST, device_id.as_bytes()])
}

pub fn pair_ack(stream_port: u16, code: &str) -> Vec<u8> {
    wire::encode_fields(&[PAIR_ACK, stream_port.to_string().as_bytes(), code.as_bytes()])
}

pub fn bad_code(device_id: &str) -> Vec<u8> {
    wire::encode_fields(&[BAD_CODE, device_id.as_bytes()])
}

pub fn link_request(device_id: &str) -> Vec<u8> {
    wire::encode_fields(&[LINK_REQUEST, device_id.as_bytes()])
}

pub fn relink_request(device_id: &str) -> Vec<u8> {
    wire::encode_fields(&[RELINK_REQUEST, device_id.as_bytes()])
}

pub fn hello(public_key: &[u8]) -> Vec<u8> {
    wire::encode_fields(&[HELLO_TAGS[0], HELLO_TAGS[1], HELLO_TAGS[2], public_key])
}

pub fn repair(challenge: &[u8]) -> Vec<u8> {
    wire::encode_fields(&[REPAIR, challenge])
}

pub fn repair_ack(encrypted_ack: &[u8]) -> Vec<u8> {
    wire::encode_fields(&[REPAIR_ACK, encrypted_ack])
}

pub fn frame_data(frame: &[u8]) -> Vec<u8> {
    wire::encode_fields(&[FRAME_DATA, frame])
}

pub fn unpair(device_id: &str) -> Vec<u8> {
    wire::encode_fields(&[UNPAIR, device_id.as_bytes()])
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("expected {expected} fields, got {got}")]
    FieldCount { expected: usize, got: usize },
    #[error("unexpected tag {0:?}")]
    UnexpectedTag(String),
    #[error("invalid stream port")]
    BadPort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pair_ack() {
        let msg = pair_ack(9000, "1234");
        assert_eq!(
            parse_discovery(&msg).unwrap(),
            Inbound::PairAck {
                stream_port: 9000,
                code: b"1234".to_vec()
            }
        );
    }

    #[test]
    fn pair_ack_field_count_is_exact() {
        let msg = wire::encode_fields(&[PAIR_ACK, b"9000"]);
        assert_eq!(
            parse_discovery(&msg),
            Err(ProtocolError::FieldCount {
                expected: 3,
                got: 2
            })
        );
        let msg = wire::encode_fields(&[PAIR_ACK, b"9000", b"1234", b"x"]);
        assert!(matches!(
            parse_discovery(&msg),
            Err(ProtocolError::FieldCount { got: 4, .. })
        ));
    }

    #[test]
    fn pair_ack_bad_port() {
        for port in [&b"abc"[..], b"70000", b"0", b""] {
            let msg = wire::encode_fields(&[PAIR_ACK, port, b"1234"]);
            assert_eq!(parse_discovery(&msg), Err(ProtocolError::BadPort));
        }
    }

    #[test]
    fn own_heartbeat_is_not_an_ack() {
        let msg = pair_request("12:34:56:F2:1C:84");
        assert!(matches!(
            parse_discovery(&msg),
            Err(ProtocolError::UnexpectedTag(_))
        ));
        assert_eq!(parse_discovery(&[]), Err(ProtocolError::Empty));
    }

    #[test]
    fn unpair_with_and_without_target() {
        assert_eq!(
            parse_discovery(b"unpair").unwrap(),
            Inbound::Unpair { device_id: None }
        );
        assert_eq!(
            parse_discovery(&unpair("12:34:56:F2:1C:84")).unwrap(),
            Inbound::Unpair {
                device_id: Some(b"12:34:56:F2:1C:84".to_vec())
            }
        );
    }

    #[test]
    fn server_hello_keeps_separator_bytes_in_key() {
        let key: Vec<u8> = (0..64).map(|i| if i % 5 == 0 { 0 } else { i }).collect();
        let msg = hello(&key);
        assert_eq!(
            parse_server_hello(&msg).unwrap(),
            Inbound::ServerHello { public_key: key }
        );
    }

    #[test]
    fn server_hello_rejects_wrong_tags() {
        let msg = wire::encode_fields(&[&b"exch"[..], b"rsa", b"aes", b"key"]);
        assert_eq!(
            parse_server_hello(&msg),
            Err(ProtocolError::UnexpectedTag("rsa".into()))
        );
        let msg = wire::encode_fields(&[&b"exch"[..], b"ecdh", b"aes"]);
        assert!(matches!(
            parse_server_hello(&msg),
            Err(ProtocolError::FieldCount { expected: 4, got: 3 })
        ));
    }

    #[test]
    fn repair_challenge() {
        let challenge = [0u8, 1, 0, 2, 0, 0, 3, 4, 5, 6, 7, 8, 9, 10, 11, 0];
        assert_eq!(
            parse_repair(&repair(&challenge)).unwrap(),
            Inbound::Repair {
                challenge: challenge.to_vec()
            }
        );
        assert!(matches!(
            parse_repair(&repair_ack(&challenge)),
            Err(ProtocolError::UnexpectedTag(_))
        ));
        assert!(matches!(
            parse_repair(b"repair"),
            Err(ProtocolError::FieldCount { expected: 2, got: 1 })
        ));
        assert_eq!(parse_repair(&[]), Err(ProtocolError::Empty));
    }
}
