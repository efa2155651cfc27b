//! 오프라인 메시지 (연결 전 핸드셰이크)
//!
//! VALID 비트가 없는 데이터그램. 모두 16바이트 오프라인 매직을 포함함
//!
//! ```text
//! client                              server
//!   │ UnconnectedPing ───────────────▶ │
//!   │ ◀─────────────── UnconnectedPong │  (광고 문자열)
//!   │ OpenConnectionRequest1 ────────▶ │  (패딩 길이 = MTU 탐색)
//!   │ ◀───────── OpenConnectionReply1  │
//!   │ OpenConnectionRequest2 ────────▶ │
//!   │ ◀───────── OpenConnectionReply2  │  → 세션 생성
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::binary::{address_size, PacketReader, PacketWrite};
use crate::message::{expect_id, MessageId};
use crate::{Config, Error, Result, UDP_HEADER_SIZE};

/// 오프라인 핑 (0x01 / 0x02)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconnectedPing {
    pub timestamp: u64,
    /// 구형 클라이언트는 생략할 수 있음 (0)
    pub client_guid: u64,
}

impl UnconnectedPing {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 8 + 16 + 8);
        buf.put_u8(MessageId::UnconnectedPing as u8);
        buf.put_u64(self.timestamp);
        buf.put_magic();
        buf.put_u64(self.client_guid);
        buf.freeze()
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let mut reader = PacketReader::new(bytes);
        let id = reader.read_u8()?;
        if !matches!(
            MessageId::from_u8(id),
            Some(MessageId::UnconnectedPing | MessageId::UnconnectedPingOpenConnections)
        ) {
            return Err(Error::MessageIdMismatch {
                expected: MessageId::UnconnectedPing as u8,
                got: id,
            });
        }

        let timestamp = reader.read_u64_be()?;
        reader.read_magic()?;
        let client_guid = if reader.remaining() >= 8 {
            reader.read_u64_be()?
        } else {
            0
        };
        Ok(Self {
            timestamp,
            client_guid,
        })
    }
}

/// 오프라인 퐁 (0x1c)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconnectedPong {
    pub timestamp: u64,
    pub server_guid: u64,
    pub advertisement: String,
}

impl UnconnectedPong {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 8 + 8 + 16 + 2 + self.advertisement.len());
        buf.put_u8(MessageId::UnconnectedPong as u8);
        buf.put_u64(self.timestamp);
        buf.put_u64(self.server_guid);
        buf.put_magic();
        buf.put_string(&self.advertisement);
        buf.freeze()
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let mut reader = expect_id(bytes, MessageId::UnconnectedPong)?;
        let timestamp = reader.read_u64_be()?;
        let server_guid = reader.read_u64_be()?;
        reader.read_magic()?;
        Ok(Self {
            timestamp,
            server_guid,
            advertisement: reader.read_string()?,
        })
    }
}

/// MTU 탐색 요청 (0x05)
///
/// 0으로 채운 패딩까지 포함한 데이터그램 크기가 곧 제안 MTU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionRequest1 {
    pub protocol: u8,
    /// IP/UDP 헤더 포함 MTU
    pub mtu: u16,
}

impl OpenConnectionRequest1 {
    pub fn to_bytes(&self) -> Bytes {
        let len = (self.mtu as usize).saturating_sub(UDP_HEADER_SIZE).max(18);
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(MessageId::OpenConnectionRequest1 as u8);
        buf.put_magic();
        buf.put_u8(self.protocol);
        buf.put_bytes(0, len - 18);
        buf.freeze()
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        let mtu = (bytes.len() + UDP_HEADER_SIZE).min(u16::MAX as usize) as u16;
        let mut reader = expect_id(bytes, MessageId::OpenConnectionRequest1)?;
        reader.read_magic()?;
        Ok(Self {
            protocol: reader.read_u8()?,
            mtu,
        })
    }
}

/// MTU 탐색 응답 (0x06)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionReply1 {
    pub server_guid: u64,
    pub mtu: u16,
}

impl OpenConnectionReply1 {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 16 + 8 + 1 + 2);
        buf.put_u8(MessageId::OpenConnectionReply1 as u8);
        buf.put_magic();
        buf.put_u64(self.server_guid);
        buf.put_bool(false); // secure
        buf.put_u16(self.mtu);
        buf.freeze()
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let mut reader = expect_id(bytes, MessageId::OpenConnectionReply1)?;
        reader.read_magic()?;
        let server_guid = reader.read_u64_be()?;
        reader.read_bool()?;
        Ok(Self {
            server_guid,
            mtu: reader.read_u16_be()?,
        })
    }
}

/// 세션 요청 (0x07)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionRequest2 {
    pub server_address: SocketAddr,
    pub mtu: u16,
    pub client_guid: u64,
}

impl OpenConnectionRequest2 {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(1 + 16 + address_size(&self.server_address) + 2 + 8);
        buf.put_u8(MessageId::OpenConnectionRequest2 as u8);
        buf.put_magic();
        buf.put_address(&self.server_address);
        buf.put_u16(self.mtu);
        buf.put_u64(self.client_guid);
        buf.freeze()
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let mut reader = expect_id(bytes, MessageId::OpenConnectionRequest2)?;
        reader.read_magic()?;
        Ok(Self {
            server_address: reader.read_address()?,
            mtu: reader.read_u16_be()?,
            client_guid: reader.read_u64_be()?,
        })
    }
}

/// 세션 수락 (0x08)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionReply2 {
    pub server_guid: u64,
    pub client_address: SocketAddr,
    pub mtu: u16,
}

impl OpenConnectionReply2 {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(1 + 16 + 8 + address_size(&self.client_address) + 2 + 1);
        buf.put_u8(MessageId::OpenConnectionReply2 as u8);
        buf.put_magic();
        buf.put_u64(self.server_guid);
        buf.put_address(&self.client_address);
        buf.put_u16(self.mtu);
        buf.put_bool(false); // secure
        buf.freeze()
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let mut reader = expect_id(bytes, MessageId::OpenConnectionReply2)?;
        reader.read_magic()?;
        let server_guid = reader.read_u64_be()?;
        let client_address = reader.read_address()?;
        let mtu = reader.read_u16_be()?;
        reader.read_bool()?;
        Ok(Self {
            server_guid,
            client_address,
            mtu,
        })
    }
}

/// 프로토콜 버전 불일치 (0x19)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompatibleProtocolVersion {
    pub protocol: u8,
    pub server_guid: u64,
}

impl IncompatibleProtocolVersion {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 1 + 16 + 8);
        buf.put_u8(MessageId::IncompatibleProtocolVersion as u8);
        buf.put_u8(self.protocol);
        buf.put_magic();
        buf.put_u64(self.server_guid);
        buf.freeze()
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let mut reader = expect_id(bytes, MessageId::IncompatibleProtocolVersion)?;
        let protocol = reader.read_u8()?;
        reader.read_magic()?;
        Ok(Self {
            protocol,
            server_guid: reader.read_u64_be()?,
        })
    }
}

/// 세션 수 한도 초과 (0x14)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoFreeIncomingConnections {
    pub server_guid: u64,
}

impl NoFreeIncomingConnections {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 16 + 8);
        buf.put_u8(MessageId::NoFreeIncomingConnections as u8);
        buf.put_magic();
        buf.put_u64(self.server_guid);
        buf.freeze()
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let mut reader = expect_id(bytes, MessageId::NoFreeIncomingConnections)?;
        reader.read_magic()?;
        Ok(Self {
            server_guid: reader.read_u64_be()?,
        })
    }
}

/// 오프라인 메시지 처리 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfflineAction {
    /// 응답만 전송
    Reply(Bytes),
    /// 응답 전송 후 세션 등록
    Open { reply: Bytes, mtu: u16 },
    /// 응답 없음
    Ignore,
}

/// 오프라인 메시지 처리기
///
/// 상태 없음. 세션 수와 기존 세션 여부는 호출자가 넘겨줌
pub struct UnconnectedHandler {
    config: Arc<Config>,
    guid: u64,
}

impl UnconnectedHandler {
    pub fn new(config: Arc<Config>, guid: u64) -> Self {
        Self { config, guid }
    }

    /// 오프라인 데이터그램 처리
    ///
    /// `session_count`: 현재 세션 수 (한도 검사용)
    pub fn handle(&self, datagram: Bytes, from: SocketAddr, session_count: usize) -> Result<OfflineAction> {
        let id = datagram.first().copied().ok_or(Error::UnexpectedEof {
            needed: 1,
            remaining: 0,
        })?;

        match MessageId::from_u8(id) {
            Some(MessageId::UnconnectedPing | MessageId::UnconnectedPingOpenConnections) => {
                let ping = UnconnectedPing::from_bytes(datagram)?;
                trace!("UnconnectedPing: {} (guid={})", from, ping.client_guid);
                let pong = UnconnectedPong {
                    timestamp: ping.timestamp,
                    server_guid: self.guid,
                    advertisement: self.config.advertisement.clone(),
                };
                Ok(OfflineAction::Reply(pong.to_bytes()))
            }

            Some(MessageId::OpenConnectionRequest1) => {
                let request = OpenConnectionRequest1::from_bytes(datagram)?;
                if request.protocol != self.config.protocol_version {
                    debug!(
                        "프로토콜 버전 불일치: {} (client={}, server={})",
                        from, request.protocol, self.config.protocol_version
                    );
                    let reply = IncompatibleProtocolVersion {
                        protocol: self.config.protocol_version,
                        server_guid: self.guid,
                    };
                    return Ok(OfflineAction::Reply(reply.to_bytes()));
                }

                let reply = OpenConnectionReply1 {
                    server_guid: self.guid,
                    mtu: request.mtu.min(self.config.max_mtu),
                };
                Ok(OfflineAction::Reply(reply.to_bytes()))
            }

            Some(MessageId::OpenConnectionRequest2) => {
                let request = OpenConnectionRequest2::from_bytes(datagram)?;
                if session_count >= self.config.max_sessions {
                    debug!("세션 한도 초과, 거절: {}", from);
                    let reply = NoFreeIncomingConnections {
                        server_guid: self.guid,
                    };
                    return Ok(OfflineAction::Reply(reply.to_bytes()));
                }

                let mtu = self.config.clamp_mtu(request.mtu);
                let reply = OpenConnectionReply2 {
                    server_guid: self.guid,
                    client_address: from,
                    mtu,
                };
                Ok(OfflineAction::Open {
                    reply: reply.to_bytes(),
                    mtu,
                })
            }

            Some(_) => {
                trace!("처리하지 않는 오프라인 메시지 {:#04x} ({})", id, from);
                Ok(OfflineAction::Ignore)
            }
            None => Err(Error::UnknownMessage(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::OFFLINE_MAGIC;

    const GUID: u64 = 0x1122_3344_5566_7788;

    fn handler() -> UnconnectedHandler {
        UnconnectedHandler::new(Arc::new(Config::default()), GUID)
    }

    fn client() -> SocketAddr {
        "192.168.1.20:50000".parse().unwrap()
    }

    #[test]
    fn test_ping_answered_with_advertisement() {
        let ping = UnconnectedPing {
            timestamp: 99,
            client_guid: 7,
        };
        let action = handler().handle(ping.to_bytes(), client(), 0).unwrap();

        let OfflineAction::Reply(bytes) = action else {
            panic!("expected reply");
        };
        let pong = UnconnectedPong::from_bytes(bytes).unwrap();
        assert_eq!(pong.timestamp, 99);
        assert_eq!(pong.server_guid, GUID);
        assert_eq!(pong.advertisement, "rakline");
    }

    #[test]
    fn test_ping_without_client_guid() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x02);
        buf.put_u64(5);
        buf.put_slice(&OFFLINE_MAGIC);
        let ping = UnconnectedPing::from_bytes(buf.freeze()).unwrap();
        assert_eq!(ping.timestamp, 5);
        assert_eq!(ping.client_guid, 0);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = UnconnectedPing {
            timestamp: 1,
            client_guid: 2,
        }
        .to_bytes()
        .to_vec();
        bytes[10] ^= 0xff;
        assert!(matches!(
            handler().handle(Bytes::from(bytes), client(), 0),
            Err(Error::InvalidMagic)
        ));
    }

    #[test]
    fn test_request1_mtu_from_padding() {
        let request = OpenConnectionRequest1 {
            protocol: crate::PROTOCOL_VERSION,
            mtu: 1200,
        };
        let bytes = request.to_bytes();
        assert_eq!(bytes.len() + UDP_HEADER_SIZE, 1200);
        assert_eq!(OpenConnectionRequest1::from_bytes(bytes.clone()).unwrap(), request);

        let OfflineAction::Reply(reply) = handler().handle(bytes, client(), 0).unwrap() else {
            panic!("expected reply");
        };
        let reply = OpenConnectionReply1::from_bytes(reply).unwrap();
        assert_eq!(reply.mtu, 1200);
        assert_eq!(reply.server_guid, GUID);
    }

    #[test]
    fn test_request1_incompatible_protocol() {
        let request = OpenConnectionRequest1 {
            protocol: 3,
            mtu: 600,
        };
        let OfflineAction::Reply(reply) = handler().handle(request.to_bytes(), client(), 0).unwrap()
        else {
            panic!("expected reply");
        };
        let reply = IncompatibleProtocolVersion::from_bytes(reply).unwrap();
        assert_eq!(reply.protocol, crate::PROTOCOL_VERSION);
        assert_eq!(reply.server_guid, GUID);
    }

    #[test]
    fn test_request2_opens_session_with_clamped_mtu() {
        let request = OpenConnectionRequest2 {
            server_address: "10.0.0.1:19132".parse().unwrap(),
            mtu: 9000,
            client_guid: 42,
        };
        let action = handler().handle(request.to_bytes(), client(), 0).unwrap();

        let OfflineAction::Open { reply, mtu } = action else {
            panic!("expected open");
        };
        assert_eq!(mtu, crate::DEFAULT_MAX_MTU);
        let reply = OpenConnectionReply2::from_bytes(reply).unwrap();
        assert_eq!(reply.client_address, client());
        assert_eq!(reply.mtu, mtu);
    }

    #[test]
    fn test_request2_refused_when_full() {
        let config = Config {
            max_sessions: 1,
            ..Config::default()
        };
        let handler = UnconnectedHandler::new(Arc::new(config), GUID);
        let request = OpenConnectionRequest2 {
            server_address: "10.0.0.1:19132".parse().unwrap(),
            mtu: 1400,
            client_guid: 42,
        };

        let OfflineAction::Reply(reply) = handler.handle(request.to_bytes(), client(), 1).unwrap()
        else {
            panic!("expected refusal");
        };
        assert_eq!(reply[0], MessageId::NoFreeIncomingConnections as u8);
        assert_eq!(
            NoFreeIncomingConnections::from_bytes(reply).unwrap().server_guid,
            GUID
        );
    }

    #[test]
    fn test_unknown_offline_id() {
        assert!(matches!(
            handler().handle(Bytes::from_static(&[0x7f, 0, 0]), client(), 0),
            Err(Error::UnknownMessage(0x7f))
        ));
        assert!(handler().handle(Bytes::new(), client(), 0).is_err());
    }
}
