//! MQTT 3.1.1 packet codec.
//!
//! Covers the packet set the embedded broker speaks: CONNECT/CONNACK,
//! PUBLISH at QoS 0 and 1 with PUBACK, SUBSCRIBE/SUBACK,
//! UNSUBSCRIBE/UNSUBACK, PINGREQ/PINGRESP and DISCONNECT. QoS 2 is refused
//! at CONNECT time rather than half-implemented.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_PACKET_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("packet too large: {0} bytes")]
    TooLarge(usize),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

impl Qos {
    pub fn from_bits(bits: u8) -> Result<Self, CodecError> {
        match bits {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Err(CodecError::Unsupported("qos 2")),
            _ => Err(CodecError::Malformed("qos bits")),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Connect {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub keep_alive: u16,
    pub clean_session: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectCode {
    Accepted,
    BadCredentials,
    NotAuthorized,
}

impl ConnectCode {
    fn byte(self) -> u8 {
        match self {
            Self::Accepted => 0x00,
            Self::BadCredentials => 0x04,
            Self::NotAuthorized => 0x05,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0x00 => Ok(Self::Accepted),
            0x04 => Ok(Self::BadCredentials),
            0x05 => Ok(Self::NotAuthorized),
            _ => Err(CodecError::Malformed("connack code")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Publish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub packet_id: Option<u16>,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, Qos)>,
}

#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Packet {
    Connect(Connect),
    ConnAck { session_present: bool, code: ConnectCode },
    Publish(Publish),
    PubAck(u16),
    Subscribe(Subscribe),
    SubAck { packet_id: u16, codes: Vec<u8> },
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

/// Read one packet from the stream.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet, CodecError> {
    let first = reader.read_u8().await?;
    let packet_type = first >> 4;
    let flags = first & 0x0f;
    let remaining = read_remaining_length(reader).await?;
    if remaining > MAX_PACKET_SIZE {
        return Err(CodecError::TooLarge(remaining));
    }
    let mut body = vec![0u8; remaining];
    reader.read_exact(&mut body).await?;
    let mut cursor = Cursor::new(&body);

    match packet_type {
        1 => parse_connect(&mut cursor),
        2 => {
            let session_present = cursor.take_u8()? & 0x01 != 0;
            let code = ConnectCode::from_byte(cursor.take_u8()?)?;
            Ok(Packet::ConnAck {
                session_present,
                code,
            })
        }
        3 => parse_publish(flags, &mut cursor),
        4 => Ok(Packet::PubAck(cursor.take_u16()?)),
        8 => parse_subscribe(&mut cursor),
        9 => {
            let packet_id = cursor.take_u16()?;
            Ok(Packet::SubAck {
                packet_id,
                codes: cursor.rest().to_vec(),
            })
        }
        10 => parse_unsubscribe(&mut cursor),
        11 => Ok(Packet::UnsubAck(cursor.take_u16()?)),
        12 => Ok(Packet::PingReq),
        13 => Ok(Packet::PingResp),
        14 => Ok(Packet::Disconnect),
        5..=7 => Err(CodecError::Unsupported("qos 2 packet")),
        _ => Err(CodecError::Malformed("packet type")),
    }
}

/// Write one packet to the stream and flush it.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &Packet,
) -> Result<(), CodecError> {
    let (first, body) = encode(packet)?;
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(first);
    encode_remaining_length(body.len(), &mut out);
    out.extend_from_slice(&body);
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

fn encode(packet: &Packet) -> Result<(u8, Vec<u8>), CodecError> {
    let mut body = Vec::new();
    let first = match packet {
        Packet::Connect(connect) => {
            put_string(&mut body, "MQTT");
            body.push(4); // protocol level 3.1.1
            let mut flags = 0u8;
            if connect.clean_session {
                flags |= 0x02;
            }
            if connect.username.is_some() {
                flags |= 0x80;
            }
            if connect.password.is_some() {
                flags |= 0x40;
            }
            body.push(flags);
            body.extend_from_slice(&connect.keep_alive.to_be_bytes());
            put_string(&mut body, &connect.client_id);
            if let Some(username) = &connect.username {
                put_string(&mut body, username);
            }
            if let Some(password) = &connect.password {
                put_bytes(&mut body, password);
            }
            0x10
        }
        Packet::ConnAck {
            session_present,
            code,
        } => {
            body.push(u8::from(*session_present));
            body.push(code.byte());
            0x20
        }
        Packet::Publish(publish) => {
            put_string(&mut body, &publish.topic);
            if publish.qos == Qos::AtLeastOnce {
                let id = publish
                    .packet_id
                    .ok_or(CodecError::Malformed("qos1 publish without packet id"))?;
                body.extend_from_slice(&id.to_be_bytes());
            }
            body.extend_from_slice(&publish.payload);
            0x30 | (publish.qos.bits() << 1) | u8::from(publish.retain)
        }
        Packet::PubAck(packet_id) => {
            body.extend_from_slice(&packet_id.to_be_bytes());
            0x40
        }
        Packet::Subscribe(subscribe) => {
            body.extend_from_slice(&subscribe.packet_id.to_be_bytes());
            for (filter, qos) in &subscribe.filters {
                put_string(&mut body, filter);
                body.push(qos.bits());
            }
            0x82
        }
        Packet::SubAck { packet_id, codes } => {
            body.extend_from_slice(&packet_id.to_be_bytes());
            body.extend_from_slice(codes);
            0x90
        }
        Packet::Unsubscribe(unsubscribe) => {
            body.extend_from_slice(&unsubscribe.packet_id.to_be_bytes());
            for filter in &unsubscribe.filters {
                put_string(&mut body, filter);
            }
            0xa2
        }
        Packet::UnsubAck(packet_id) => {
            body.extend_from_slice(&packet_id.to_be_bytes());
            0xb0
        }
        Packet::PingReq => 0xc0,
        Packet::PingResp => 0xd0,
        Packet::Disconnect => 0xe0,
    };
    Ok((first, body))
}

fn parse_connect(cursor: &mut Cursor<'_>) -> Result<Packet, CodecError> {
    let protocol = cursor.take_string()?;
    if protocol != "MQTT" && protocol != "MQIsdp" {
        return Err(CodecError::Malformed("protocol name"));
    }
    let level = cursor.take_u8()?;
    if level != 4 && level != 3 {
        return Err(CodecError::Unsupported("protocol level"));
    }
    let flags = cursor.take_u8()?;
    if flags & 0x04 != 0 {
        // Will messages never made sense for the device fleet; refuse early.
        return Err(CodecError::Unsupported("will flag"));
    }
    let keep_alive = cursor.take_u16()?;
    let client_id = cursor.take_string()?;
    let username = if flags & 0x80 != 0 {
        Some(cursor.take_string()?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(cursor.take_lp_bytes()?)
    } else {
        None
    };
    Ok(Packet::Connect(Connect {
        client_id,
        username,
        password,
        keep_alive,
        clean_session: flags & 0x02 != 0,
    }))
}

fn parse_publish(flags: u8, cursor: &mut Cursor<'_>) -> Result<Packet, CodecError> {
    let qos = Qos::from_bits((flags >> 1) & 0x03)?;
    let retain = flags & 0x01 != 0;
    let topic = cursor.take_string()?;
    let packet_id = if qos == Qos::AtLeastOnce {
        Some(cursor.take_u16()?)
    } else {
        None
    };
    Ok(Packet::Publish(Publish {
        topic,
        payload: cursor.rest().to_vec(),
        qos,
        packet_id,
        retain,
    }))
}

fn parse_subscribe(cursor: &mut Cursor<'_>) -> Result<Packet, CodecError> {
    let packet_id = cursor.take_u16()?;
    let mut filters = Vec::new();
    while !cursor.is_empty() {
        let filter = cursor.take_string()?;
        let qos = Qos::from_bits(cursor.take_u8()? & 0x03)?;
        filters.push((filter, qos));
    }
    if filters.is_empty() {
        return Err(CodecError::Malformed("subscribe without filters"));
    }
    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn parse_unsubscribe(cursor: &mut Cursor<'_>) -> Result<Packet, CodecError> {
    let packet_id = cursor.take_u16()?;
    let mut filters = Vec::new();
    while !cursor.is_empty() {
        filters.push(cursor.take_string()?);
    }
    if filters.is_empty() {
        return Err(CodecError::Malformed("unsubscribe without filters"));
    }
    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}

async fn read_remaining_length<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<usize, CodecError> {
    let mut multiplier: usize = 1;
    let mut value: usize = 0;
    for _ in 0..4 {
        let byte = reader.read_u8().await?;
        value += usize::from(byte & 0x7f) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        multiplier *= 128;
    }
    Err(CodecError::Malformed("remaining length"))
}

fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    put_bytes(out, value.as_bytes());
}

fn put_bytes(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take_u8(&mut self) -> Result<u8, CodecError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(CodecError::Malformed("short packet"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take_u16(&mut self) -> Result<u16, CodecError> {
        let hi = self.take_u8()?;
        let lo = self.take_u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn take_lp_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = usize::from(self.take_u16()?);
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(CodecError::Malformed("length prefix"))?;
        let bytes = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn take_string(&mut self) -> Result<String, CodecError> {
        String::from_utf8(self.take_lp_bytes()?).map_err(|_| CodecError::Malformed("utf8 string"))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(packet: Packet) -> Packet {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_packet(&mut a, &packet).await.unwrap();
        read_packet(&mut b).await.unwrap()
    }

    #[tokio::test]
    async fn connect_round_trip() {
        let packet = Packet::Connect(Connect {
            client_id: "GID_test@@@ba_8f_17_de_94_94@@@uuid".into(),
            username: Some("device".into()),
            password: Some(b"secret".to_vec()),
            keep_alive: 60,
            clean_session: true,
        });
        match round_trip(packet).await {
            Packet::Connect(connect) => {
                assert_eq!(connect.client_id, "GID_test@@@ba_8f_17_de_94_94@@@uuid");
                assert_eq!(connect.username.as_deref(), Some("device"));
                assert_eq!(connect.password.as_deref(), Some(b"secret".as_slice()));
                assert!(connect.clean_session);
            }
            other => panic!("wrong packet: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_qos0_round_trip() {
        let packet = Packet::Publish(Publish {
            topic: "/p2p/device_public/ba_8f".into(),
            payload: br#"{"type":"hello"}"#.to_vec(),
            qos: Qos::AtMostOnce,
            packet_id: None,
            retain: false,
        });
        match round_trip(packet).await {
            Packet::Publish(publish) => {
                assert_eq!(publish.topic, "/p2p/device_public/ba_8f");
                assert_eq!(publish.payload, br#"{"type":"hello"}"#);
                assert!(publish.packet_id.is_none());
            }
            other => panic!("wrong packet: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_qos1_carries_packet_id() {
        let packet = Packet::Publish(Publish {
            topic: "t".into(),
            payload: vec![1, 2, 3],
            qos: Qos::AtLeastOnce,
            packet_id: Some(42),
            retain: true,
        });
        match round_trip(packet).await {
            Packet::Publish(publish) => {
                assert_eq!(publish.packet_id, Some(42));
                assert!(publish.retain);
            }
            other => panic!("wrong packet: {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_suback_round_trip() {
        let packet = Packet::Subscribe(Subscribe {
            packet_id: 7,
            filters: vec![("/p2p/device_public/#".into(), Qos::AtMostOnce)],
        });
        match round_trip(packet).await {
            Packet::Subscribe(subscribe) => {
                assert_eq!(subscribe.packet_id, 7);
                assert_eq!(subscribe.filters[0].0, "/p2p/device_public/#");
            }
            other => panic!("wrong packet: {other:?}"),
        }

        match round_trip(Packet::SubAck {
            packet_id: 7,
            codes: vec![0],
        })
        .await
        {
            Packet::SubAck { packet_id, codes } => {
                assert_eq!(packet_id, 7);
                assert_eq!(codes, vec![0]);
            }
            other => panic!("wrong packet: {other:?}"),
        }
    }

    #[tokio::test]
    async fn control_packets_round_trip() {
        assert!(matches!(round_trip(Packet::PingReq).await, Packet::PingReq));
        assert!(matches!(
            round_trip(Packet::PingResp).await,
            Packet::PingResp
        ));
        assert!(matches!(
            round_trip(Packet::Disconnect).await,
            Packet::Disconnect
        ));
        assert!(matches!(
            round_trip(Packet::UnsubAck(3)).await,
            Packet::UnsubAck(3)
        ));
    }

    #[tokio::test]
    async fn qos2_publish_rejected() {
        let (mut a, mut b) = tokio::io::duplex(256);
        // PUBLISH with qos 2 bits set, hand-encoded.
        a.write_all(&[0x34, 0x05, 0x00, 0x01, b't', 0x00, 0x01])
            .await
            .unwrap();
        let err = read_packet(&mut b).await.unwrap_err();
        assert!(matches!(err, CodecError::Unsupported(_)));
    }
}
