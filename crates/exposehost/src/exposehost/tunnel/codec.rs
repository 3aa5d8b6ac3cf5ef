//! Control-plane packets and their byte layout.
//!
//! Every packet travels as `[u8 kind][u32 big-endian length][payload]`, where the
//! payload is a JSON document holding exactly the fields of the variant. The codec
//! is pure: framing over an actual stream lives in [`super::handler`].

use std::fmt;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

pub const HEADER_LEN: usize = 5;
pub const MAX_PAYLOAD_BYTES: u32 = 1 << 20; // 1 MiB

/// Written by the server on a callback connection once it has been paired.
pub const PAIRING_ACK: u8 = 0x01;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload { kind: PacketKind, reason: String },
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    TunnelRequest = 1,
    TunnelResponse = 2,
    NewClientConnection = 3,
    NewConnectionHostResponse = 4,
    KillServerConnection = 5,
    HeartBeat = 6,
    LoadbalanceResponse = 7,
}

impl TryFrom<u8> for PacketKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketKind::TunnelRequest),
            2 => Ok(PacketKind::TunnelResponse),
            3 => Ok(PacketKind::NewClientConnection),
            4 => Ok(PacketKind::NewConnectionHostResponse),
            5 => Ok(PacketKind::KillServerConnection),
            6 => Ok(PacketKind::HeartBeat),
            7 => Ok(PacketKind::LoadbalanceResponse),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PacketKind::TunnelRequest => "TunnelRequest",
            PacketKind::TunnelResponse => "TunnelResponse",
            PacketKind::NewClientConnection => "NewClientConnection",
            PacketKind::NewConnectionHostResponse => "NewConnectionHostResponse",
            PacketKind::KillServerConnection => "KillServerConnection",
            PacketKind::HeartBeat => "HeartBeat",
            PacketKind::LoadbalanceResponse => "LoadbalanceResponse",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    Http,
    Tcp,
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelProtocol::Http => f.write_str("http"),
            TunnelProtocol::Tcp => f.write_str("tcp"),
        }
    }
}

impl std::str::FromStr for TunnelProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(TunnelProtocol::Http),
            "tcp" => Ok(TunnelProtocol::Tcp),
            other => Err(format!("unsupported tunnel protocol {other:?} (expected http|tcp)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    #[serde(rename = "jwt_token")]
    pub token: String,
    pub subdomain: String,
    pub protocol: TunnelProtocol,
    #[serde(rename = "c_session_key")]
    pub session_key: String,
    /// Local port the client exposes.
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelResponse {
    pub status: TunnelStatus,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub error: String,
}

impl TunnelResponse {
    pub fn success(port: u16, url: impl Into<String>) -> Self {
        Self {
            status: TunnelStatus::Success,
            port,
            url: url.into(),
            error: String::new(),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: TunnelStatus::Error,
            port: 0,
            url: String::new(),
            error: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewClientConnection {
    pub connection_id: String,
    #[serde(rename = "c_session_key", default)]
    pub session_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConnectionHostResponse {
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillServerConnection {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadbalanceResponse {
    pub new_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    TunnelRequest(TunnelRequest),
    TunnelResponse(TunnelResponse),
    NewClientConnection(NewClientConnection),
    NewConnectionHostResponse(NewConnectionHostResponse),
    KillServerConnection(KillServerConnection),
    HeartBeat,
    LoadbalanceResponse(LoadbalanceResponse),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::TunnelRequest(_) => PacketKind::TunnelRequest,
            Packet::TunnelResponse(_) => PacketKind::TunnelResponse,
            Packet::NewClientConnection(_) => PacketKind::NewClientConnection,
            Packet::NewConnectionHostResponse(_) => PacketKind::NewConnectionHostResponse,
            Packet::KillServerConnection(_) => PacketKind::KillServerConnection,
            Packet::HeartBeat => PacketKind::HeartBeat,
            Packet::LoadbalanceResponse(_) => PacketKind::LoadbalanceResponse,
        }
    }
}

/// Serializes a packet into its 5-byte header and payload.
pub fn encode(packet: &Packet) -> Result<([u8; HEADER_LEN], Vec<u8>), ProtocolError> {
    let kind = packet.kind();
    let payload = match packet {
        Packet::TunnelRequest(p) => to_payload(kind, p)?,
        Packet::TunnelResponse(p) => to_payload(kind, p)?,
        Packet::NewClientConnection(p) => to_payload(kind, p)?,
        Packet::NewConnectionHostResponse(p) => to_payload(kind, p)?,
        Packet::KillServerConnection(p) => to_payload(kind, p)?,
        Packet::HeartBeat => Vec::new(),
        Packet::LoadbalanceResponse(p) => to_payload(kind, p)?,
    };

    let len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| ProtocolError::PayloadTooLarge(u32::MAX))?;
    if len > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    Ok((encode_header(kind as u8, len), payload))
}

/// Header and payload as one contiguous buffer.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    let (header, payload) = encode(packet)?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&header);
    buf.put_slice(&payload);
    Ok(buf.to_vec())
}

pub fn encode_header(kind: u8, len: u32) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0] = kind;
    out[1..].copy_from_slice(&len.to_be_bytes());
    out
}

/// Splits a header into its raw kind byte and payload length.
///
/// The kind is validated later by [`decode`] so that the caller always consumes the
/// full payload first.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(u8, u32), ProtocolError> {
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    Ok((header[0], len))
}

pub fn decode(kind: u8, payload: &[u8]) -> Result<Packet, ProtocolError> {
    let kind = PacketKind::try_from(kind)?;
    let packet = match kind {
        PacketKind::TunnelRequest => Packet::TunnelRequest(from_payload(kind, payload)?),
        PacketKind::TunnelResponse => Packet::TunnelResponse(from_payload(kind, payload)?),
        PacketKind::NewClientConnection => {
            Packet::NewClientConnection(from_payload(kind, payload)?)
        }
        PacketKind::NewConnectionHostResponse => {
            Packet::NewConnectionHostResponse(from_payload(kind, payload)?)
        }
        PacketKind::KillServerConnection => {
            Packet::KillServerConnection(from_payload(kind, payload)?)
        }
        PacketKind::HeartBeat => {
            if !payload.is_empty() {
                return Err(ProtocolError::MalformedPayload {
                    kind,
                    reason: format!("expected empty payload, got {} bytes", payload.len()),
                });
            }
            Packet::HeartBeat
        }
        PacketKind::LoadbalanceResponse => {
            Packet::LoadbalanceResponse(from_payload(kind, payload)?)
        }
    };
    Ok(packet)
}

fn to_payload<T: Serialize>(kind: PacketKind, v: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(v).map_err(|err| ProtocolError::MalformedPayload {
        kind,
        reason: err.to_string(),
    })
}

fn from_payload<T: DeserializeOwned>(kind: PacketKind, payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|err| ProtocolError::MalformedPayload {
        kind,
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_packets() -> Vec<Packet> {
        vec![
            Packet::TunnelRequest(TunnelRequest {
                token: "tok".into(),
                subdomain: "demo".into(),
                protocol: TunnelProtocol::Tcp,
                session_key: "abcd".into(),
                port: 8000,
            }),
            Packet::TunnelResponse(TunnelResponse::success(40123, "https://demo.example.test")),
            Packet::TunnelResponse(TunnelResponse::error("subdomain already in use")),
            Packet::NewClientConnection(NewClientConnection {
                connection_id: "0123456789abcdef0123456789abcdef".into(),
                session_key: "abcd".into(),
            }),
            Packet::NewConnectionHostResponse(NewConnectionHostResponse {
                connection_id: "0123456789abcdef0123456789abcdef".into(),
            }),
            Packet::KillServerConnection(KillServerConnection { reason: String::new() }),
            Packet::HeartBeat,
            Packet::LoadbalanceResponse(LoadbalanceResponse { new_port: 1437 }),
        ]
    }

    #[test]
    fn every_kind_survives_encode_then_decode() {
        for p in all_packets() {
            let (header, payload) = encode(&p).unwrap();
            let (kind, len) = parse_header(&header).unwrap();
            assert_eq!(kind, p.kind() as u8);
            assert_eq!(len as usize, payload.len());
            assert_eq!(decode(kind, &payload).unwrap(), p);
        }
    }

    #[test]
    fn heartbeat_is_header_only() {
        let frame = encode_frame(&Packet::HeartBeat).unwrap();
        assert_eq!(frame, vec![6, 0, 0, 0, 0]);
    }

    #[test]
    fn request_uses_wire_field_names() {
        let p = Packet::TunnelRequest(TunnelRequest {
            token: "t".into(),
            subdomain: "demo".into(),
            protocol: TunnelProtocol::Http,
            session_key: "k".into(),
            port: 3000,
        });
        let (header, payload) = encode(&p).unwrap();
        assert_eq!(header[0], 1);
        let v: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(v["jwt_token"], "t");
        assert_eq!(v["c_session_key"], "k");
        assert_eq!(v["protocol"], "http");
        assert_eq!(v["port"], 3000);
    }

    #[test]
    fn header_length_is_big_endian() {
        let h = encode_header(2, 0x0002_0304);
        assert_eq!(h, [2, 0x00, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        match decode(42, b"{}") {
            Err(ProtocolError::UnknownKind(42)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_is_rejected() {
        match decode(PacketKind::TunnelRequest as u8, b"{not json") {
            Err(ProtocolError::MalformedPayload { kind, .. }) => {
                assert_eq!(kind, PacketKind::TunnelRequest)
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Valid JSON, wrong shape.
        match decode(PacketKind::LoadbalanceResponse as u8, br#"{"new_port":"x"}"#) {
            Err(ProtocolError::MalformedPayload { .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }

        match decode(PacketKind::HeartBeat as u8, b"{}") {
            Err(ProtocolError::MalformedPayload { .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn request_without_all_fields_is_malformed() {
        let full = br#"{"jwt_token":"","subdomain":"demo","protocol":"tcp","c_session_key":"k","port":80}"#;
        assert!(decode(PacketKind::TunnelRequest as u8, full).is_ok());

        for missing in [
            &br#"{"subdomain":"demo","protocol":"tcp","c_session_key":"k","port":80}"#[..],
            br#"{"jwt_token":"","protocol":"tcp","c_session_key":"k","port":80}"#,
            br#"{"jwt_token":"","subdomain":"demo","protocol":"tcp","port":80}"#,
        ] {
            match decode(PacketKind::TunnelRequest as u8, missing) {
                Err(ProtocolError::MalformedPayload { kind, .. }) => {
                    assert_eq!(kind, PacketKind::TunnelRequest)
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[test]
    fn oversized_length_is_rejected_from_header() {
        let h = encode_header(1, MAX_PAYLOAD_BYTES + 1);
        match parse_header(&h) {
            Err(ProtocolError::PayloadTooLarge(n)) => assert!(n > MAX_PAYLOAD_BYTES),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn protocol_parses_case_insensitively() {
        assert_eq!(" HTTP ".parse::<TunnelProtocol>().unwrap(), TunnelProtocol::Http);
        assert_eq!("tcp".parse::<TunnelProtocol>().unwrap(), TunnelProtocol::Tcp);
        assert!("udp".parse::<TunnelProtocol>().is_err());
    }
}
