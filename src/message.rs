//! 프로토콜 메시지 정의
//!
//! 세션 코어는 전달된 페이로드의 첫 바이트만 보고 연결 수명주기 메시지를 라우팅함.
//! 나머지 페이로드는 불투명한 바이트로 상위에 전달

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

use crate::binary::{PacketReader, PacketWrite};
use crate::{Error, Result};

/// 시스템 주소 목록 길이
pub const SYSTEM_ADDRESS_COUNT: usize = 20;

/// 메시지 ID (페이로드 첫 바이트)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    /// 연결 상태 핑
    ConnectedPing = 0x00,
    /// 오프라인 핑
    UnconnectedPing = 0x01,
    /// 오프라인 핑 (열린 연결만)
    UnconnectedPingOpenConnections = 0x02,
    /// 연결 상태 퐁
    ConnectedPong = 0x03,
    OpenConnectionRequest1 = 0x05,
    OpenConnectionReply1 = 0x06,
    OpenConnectionRequest2 = 0x07,
    OpenConnectionReply2 = 0x08,
    /// 로그인 요청
    ConnectionRequest = 0x09,
    /// 로그인 수락
    ConnectionRequestAccepted = 0x10,
    /// 핸드셰이크 완료
    NewIncomingConnection = 0x13,
    /// 세션 수 한도 초과
    NoFreeIncomingConnections = 0x14,
    /// 연결 종료 알림
    DisconnectNotification = 0x15,
    IncompatibleProtocolVersion = 0x19,
    /// 오프라인 퐁 (서버 광고)
    UnconnectedPong = 0x1c,
}

impl MessageId {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::ConnectedPing,
            0x01 => Self::UnconnectedPing,
            0x02 => Self::UnconnectedPingOpenConnections,
            0x03 => Self::ConnectedPong,
            0x05 => Self::OpenConnectionRequest1,
            0x06 => Self::OpenConnectionReply1,
            0x07 => Self::OpenConnectionRequest2,
            0x08 => Self::OpenConnectionReply2,
            0x09 => Self::ConnectionRequest,
            0x10 => Self::ConnectionRequestAccepted,
            0x13 => Self::NewIncomingConnection,
            0x14 => Self::NoFreeIncomingConnections,
            0x15 => Self::DisconnectNotification,
            0x19 => Self::IncompatibleProtocolVersion,
            0x1c => Self::UnconnectedPong,
            _ => return None,
        })
    }
}

/// 현재 시각 (epoch 밀리초)
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// ID 바이트 확인 후 리더 반환
pub(crate) fn expect_id(bytes: impl Into<Bytes>, expected: MessageId) -> Result<PacketReader> {
    let mut reader = PacketReader::new(bytes);
    let got = reader.read_u8()?;
    if got != expected as u8 {
        return Err(Error::MessageIdMismatch {
            expected: expected as u8,
            got,
        });
    }
    Ok(reader)
}

fn loopback() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
}

fn unspecified() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

/// 타임스탬프 두 개(16바이트) 앞까지 주소 목록 읽기
fn read_system_addresses(reader: &mut PacketReader) -> Result<Vec<SocketAddr>> {
    let mut addresses = Vec::with_capacity(SYSTEM_ADDRESS_COUNT);
    while reader.remaining() > 16 && addresses.len() < SYSTEM_ADDRESS_COUNT {
        addresses.push(reader.read_address()?);
    }
    Ok(addresses)
}

/// 연결 상태 핑 (클라이언트 → 서버)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPing {
    pub client_timestamp: u64,
}

impl ConnectedPing {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(MessageId::ConnectedPing as u8);
        buf.put_u64(self.client_timestamp);
        buf.freeze()
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let mut reader = expect_id(bytes, MessageId::ConnectedPing)?;
        Ok(Self {
            client_timestamp: reader.read_u64_be()?,
        })
    }
}

/// 연결 상태 퐁 (서버 → 클라이언트)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPong {
    /// 클라이언트 타임스탬프 에코
    pub client_timestamp: u64,
    pub server_timestamp: u64,
}

impl ConnectedPong {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_u8(MessageId::ConnectedPong as u8);
        buf.put_u64(self.client_timestamp);
        buf.put_u64(self.server_timestamp);
        buf.freeze()
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let mut reader = expect_id(bytes, MessageId::ConnectedPong)?;
        Ok(Self {
            client_timestamp: reader.read_u64_be()?,
            server_timestamp: reader.read_u64_be()?,
        })
    }
}

/// 로그인 요청
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub client_guid: u64,
    pub request_timestamp: u64,
    pub secure: bool,
}

impl ConnectionRequest {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(18);
        buf.put_u8(MessageId::ConnectionRequest as u8);
        buf.put_u64(self.client_guid);
        buf.put_u64(self.request_timestamp);
        buf.put_bool(self.secure);
        buf.freeze()
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let mut reader = expect_id(bytes, MessageId::ConnectionRequest)?;
        Ok(Self {
            client_guid: reader.read_u64_be()?,
            request_timestamp: reader.read_u64_be()?,
            secure: reader.read_bool()?,
        })
    }
}

/// 로그인 수락 (서버 → 클라이언트)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequestAccepted {
    pub client_address: SocketAddr,
    pub system_index: u16,
    pub system_addresses: Vec<SocketAddr>,
    pub request_timestamp: u64,
    pub accepted_timestamp: u64,
}

impl ConnectionRequestAccepted {
    /// 서버측 응답 생성 (시스템 주소: 루프백 하나 + 나머지 미지정)
    pub fn new(client_address: SocketAddr, request_timestamp: u64) -> Self {
        let mut system_addresses = vec![unspecified(); SYSTEM_ADDRESS_COUNT];
        system_addresses[0] = loopback();

        Self {
            client_address,
            system_index: 0,
            system_addresses,
            request_timestamp,
            accepted_timestamp: now_millis(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(200);
        buf.put_u8(MessageId::ConnectionRequestAccepted as u8);
        buf.put_address(&self.client_address);
        buf.put_u16(self.system_index);
        for addr in &self.system_addresses {
            buf.put_address(addr);
        }
        buf.put_u64(self.request_timestamp);
        buf.put_u64(self.accepted_timestamp);
        buf.freeze()
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let mut reader = expect_id(bytes, MessageId::ConnectionRequestAccepted)?;
        let client_address = reader.read_address()?;
        let system_index = reader.read_u16_be()?;
        let system_addresses = read_system_addresses(&mut reader)?;
        Ok(Self {
            client_address,
            system_index,
            system_addresses,
            request_timestamp: reader.read_u64_be()?,
            accepted_timestamp: reader.read_u64_be()?,
        })
    }
}

/// 핸드셰이크 완료 (클라이언트 → 서버)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIncomingConnection {
    pub server_address: SocketAddr,
    pub system_addresses: Vec<SocketAddr>,
    pub request_timestamp: u64,
    pub accepted_timestamp: u64,
}

impl NewIncomingConnection {
    pub fn new(server_address: SocketAddr, request_timestamp: u64, accepted_timestamp: u64) -> Self {
        Self {
            server_address,
            system_addresses: vec![server_address; SYSTEM_ADDRESS_COUNT],
            request_timestamp,
            accepted_timestamp,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(200);
        buf.put_u8(MessageId::NewIncomingConnection as u8);
        buf.put_address(&self.server_address);
        for addr in &self.system_addresses {
            buf.put_address(addr);
        }
        buf.put_u64(self.request_timestamp);
        buf.put_u64(self.accepted_timestamp);
        buf.freeze()
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let mut reader = expect_id(bytes, MessageId::NewIncomingConnection)?;
        let server_address = reader.read_address()?;
        let system_addresses = read_system_addresses(&mut reader)?;
        Ok(Self {
            server_address,
            system_addresses,
            request_timestamp: reader.read_u64_be()?,
            accepted_timestamp: reader.read_u64_be()?,
        })
    }
}

/// 연결 종료 알림 (ID만)
pub fn disconnect_notification() -> Bytes {
    Bytes::from_static(&[MessageId::DisconnectNotification as u8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_request_accepted_round_trip() {
        let client: SocketAddr = "10.0.0.7:51234".parse().unwrap();
        let msg = ConnectionRequestAccepted::new(client, 1234);
        assert!(msg.accepted_timestamp >= 1234);
        assert_eq!(msg.system_addresses[0], loopback());

        let decoded = ConnectionRequestAccepted::from_bytes(msg.to_bytes()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_new_incoming_connection_round_trip() {
        let server: SocketAddr = "192.168.1.2:19132".parse().unwrap();
        let msg = NewIncomingConnection::new(server, 10, 20);
        let decoded = NewIncomingConnection::from_bytes(msg.to_bytes()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_ping_pong() {
        let ping = ConnectedPing {
            client_timestamp: 99,
        };
        assert_eq!(ConnectedPing::from_bytes(ping.to_bytes()).unwrap(), ping);

        let pong = ConnectedPong {
            client_timestamp: 99,
            server_timestamp: 100,
        };
        let bytes = pong.to_bytes();
        assert_eq!(bytes[0], 0x03);
        assert_eq!(ConnectedPong::from_bytes(bytes).unwrap(), pong);
    }

    #[test]
    fn test_connection_request() {
        let req = ConnectionRequest {
            client_guid: 42,
            request_timestamp: 7,
            secure: false,
        };
        assert_eq!(ConnectionRequest::from_bytes(req.to_bytes()).unwrap(), req);
    }

    #[test]
    fn test_id_mismatch() {
        let pong = ConnectedPong {
            client_timestamp: 1,
            server_timestamp: 2,
        };
        assert!(matches!(
            ConnectedPing::from_bytes(pong.to_bytes()),
            Err(Error::MessageIdMismatch {
                expected: 0x00,
                got: 0x03
            })
        ));
    }
}
