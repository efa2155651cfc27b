//! 바이너리 코덱 기본 연산
//!
//! 모든 와이어 구조체가 이 위에서 만들어짐
//! - 읽기: `Bytes` 커서 위의 `PacketReader` (잘린 입력은 에러)
//! - 쓰기: `BytesMut`에 대한 `PacketWrite` 확장 트레이트
//!
//! 엔디언은 필드마다 고정: 트라이어드(u24)는 LE, 나머지 정수는 BE

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result, OFFLINE_MAGIC};

/// IPv6 주소 레코드의 address family 값 (Windows AF_INET6)
const AF_INET6: u16 = 23;

/// 바이트 버퍼 리더
#[derive(Debug, Clone)]
pub struct PacketReader {
    buf: Bytes,
}

impl PacketReader {
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self { buf: buf.into() }
    }

    /// 남은 바이트 수
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// 버퍼 끝 도달 여부
    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(Error::UnexpectedEof {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    /// 3바이트 LE 정수 (트라이어드)
    pub fn read_u24_le(&mut self) -> Result<u32> {
        self.ensure(3)?;
        Ok(self.buf.get_uint_le(3) as u32)
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_u64_be(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    /// 고정 길이 바이트 (복사 없이 슬라이스)
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    /// 남은 전체 바이트
    pub fn read_remaining(&mut self) -> Bytes {
        let len = self.buf.remaining();
        self.buf.split_to(len)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.ensure(len)?;
        self.buf.advance(len);
        Ok(())
    }

    /// u16 BE 길이 접두 UTF-8 문자열
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16_be()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    /// 오프라인 매직 검증
    pub fn read_magic(&mut self) -> Result<()> {
        let magic = self.read_bytes(OFFLINE_MAGIC.len())?;
        if magic.as_ref() != OFFLINE_MAGIC {
            return Err(Error::InvalidMagic);
        }
        Ok(())
    }

    /// 주소 레코드
    ///
    /// v4: 반전된 옥텟 4개 + 포트, v6: family + 포트 + flowinfo + 주소 + scope id
    pub fn read_address(&mut self) -> Result<SocketAddr> {
        match self.read_u8()? {
            4 => {
                let raw = self.read_bytes(4)?;
                let ip = Ipv4Addr::new(!raw[0], !raw[1], !raw[2], !raw[3]);
                let port = self.read_u16_be()?;
                Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
            }
            6 => {
                self.read_u16_le()?; // family
                let port = self.read_u16_be()?;
                let flowinfo = self.read_u32_be()?;
                let raw = self.read_bytes(16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&raw);
                let scope_id = self.read_u32_be()?;
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    flowinfo,
                    scope_id,
                )))
            }
            other => Err(Error::InvalidAddressVersion(other)),
        }
    }
}

/// `BytesMut` 쓰기 확장
pub trait PacketWrite {
    fn put_u24_le(&mut self, value: u32);
    fn put_bool(&mut self, value: bool);
    fn put_string(&mut self, value: &str);
    fn put_magic(&mut self);
    fn put_address(&mut self, addr: &SocketAddr);
}

impl PacketWrite for BytesMut {
    fn put_u24_le(&mut self, value: u32) {
        self.put_uint_le(u64::from(value & 0x00FF_FFFF), 3);
    }

    fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    fn put_string(&mut self, value: &str) {
        let bytes = value.as_bytes();
        let len = bytes.len().min(u16::MAX as usize);
        self.put_u16(len as u16);
        self.put_slice(&bytes[..len]);
    }

    fn put_magic(&mut self) {
        self.put_slice(&OFFLINE_MAGIC);
    }

    fn put_address(&mut self, addr: &SocketAddr) {
        match addr {
            SocketAddr::V4(v4) => {
                self.put_u8(4);
                for octet in v4.ip().octets() {
                    self.put_u8(!octet);
                }
                self.put_u16(v4.port());
            }
            SocketAddr::V6(v6) => {
                self.put_u8(6);
                self.put_u16_le(AF_INET6);
                self.put_u16(v6.port());
                self.put_u32(v6.flowinfo());
                self.put_slice(&v6.ip().octets());
                self.put_u32(v6.scope_id());
            }
        }
    }
}

/// 주소 레코드의 인코딩 크기
pub fn address_size(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => 7,
        SocketAddr::V6(_) => 29,
    }
}
