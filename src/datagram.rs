//! 연결된 피어 간 데이터그램
//!
//! 첫 바이트의 비트 플래그로 종류를 구분
//! - VALID(0x80) 없음: 오프라인 핸드셰이크 메시지
//! - VALID | ACK(0x40): Ack
//! - VALID | NACK(0x20): Nack
//! - 그 외: FrameSet

use bytes::{BufMut, Bytes, BytesMut};

use crate::ack::{AckKind, Acknowledgement};
use crate::binary::{PacketReader, PacketWrite};
use crate::frame::Frame;
use crate::Result;

/// 데이터그램 헤더 비트 플래그
pub mod flags {
    /// 연결된 세션의 데이터그램
    pub const VALID: u8 = 0x80;
    /// ACK 데이터그램
    pub const ACK: u8 = 0x40;
    /// NACK 데이터그램
    pub const NACK: u8 = 0x20;
    /// 송신측 B/AS 값 요청 (FrameSet 관례)
    pub const NEEDS_B_AND_AS: u8 = 0x04;
}

/// FrameSet 헤더 크기: header(1) + sequence(3)
pub const FRAME_SET_HEADER_SIZE: usize = 4;

/// 데이터그램 하나 (FrameSet)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameSet {
    /// 송신측 출력 스트림 내 위치 (u24 순환)
    pub sequence_number: u32,
    pub frames: Vec<Frame>,
}

impl FrameSet {
    pub fn new(sequence_number: u32) -> Self {
        Self {
            sequence_number,
            frames: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// 인코딩 크기 (인코딩 없이 계산)
    pub fn byte_length(&self) -> usize {
        FRAME_SET_HEADER_SIZE + self.frames.iter().map(Frame::byte_length).sum::<usize>()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.byte_length());
        buf.put_u8(flags::VALID | flags::NEEDS_B_AND_AS);
        buf.put_u24_le(self.sequence_number);
        for frame in &self.frames {
            frame.encode(&mut buf);
        }
        buf.freeze()
    }

    /// 데이터그램 디코딩 (버퍼 끝까지 프레임을 읽음)
    pub fn decode(bytes: impl Into<Bytes>) -> Result<Self> {
        let mut reader = PacketReader::new(bytes);
        reader.read_u8()?;
        let sequence_number = reader.read_u24_le()?;

        let mut frames = Vec::new();
        while !reader.is_empty() {
            frames.push(Frame::decode(&mut reader)?);
        }

        Ok(Self {
            sequence_number,
            frames,
        })
    }
}

/// 연결된 데이터그램 종류
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Ack(Acknowledgement),
    Nack(Acknowledgement),
    FrameSet(FrameSet),
}

impl Datagram {
    /// 헤더 비트로 종류를 판별하여 디코딩
    pub fn decode(bytes: Bytes) -> Result<Self> {
        let header = PacketReader::new(bytes.clone()).read_u8()?;
        if header & flags::ACK != 0 {
            Ok(Datagram::Ack(Acknowledgement::decode(AckKind::Ack, bytes)?))
        } else if header & flags::NACK != 0 {
            Ok(Datagram::Nack(Acknowledgement::decode(AckKind::Nack, bytes)?))
        } else {
            Ok(Datagram::FrameSet(FrameSet::decode(bytes)?))
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Datagram::Ack(ack) | Datagram::Nack(ack) => ack.encode(),
            Datagram::FrameSet(frame_set) => frame_set.encode(),
        }
    }
}

/// 연결된 세션 데이터그램인지 (VALID 비트)
pub fn is_connected(header: u8) -> bool {
    header & flags::VALID != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::Reliability;

    fn sample() -> FrameSet {
        let mut set = FrameSet::new(0x0102_03);
        set.frames.push(Frame::new(Reliability::Unreliable, vec![0x86, 1]));
        set.frames.push(Frame {
            reliability: Reliability::ReliableOrdered,
            reliable_index: 5,
            order_index: 6,
            order_channel: 1,
            content: Bytes::from_static(b"hello"),
            ..Default::default()
        });
        set
    }

    #[test]
    fn test_frame_set_round_trip() {
        let set = sample();
        let bytes = set.encode();
        assert_eq!(bytes.len(), set.byte_length());
        assert_eq!(&bytes[..4], &[0x84, 0x03, 0x02, 0x01]);
        assert_eq!(FrameSet::decode(bytes).unwrap(), set);
    }

    #[test]
    fn test_empty_frame_set() {
        let set = FrameSet::new(7);
        assert_eq!(set.byte_length(), FRAME_SET_HEADER_SIZE);
        assert_eq!(FrameSet::decode(set.encode()).unwrap(), set);
    }

    #[test]
    fn test_datagram_dispatch_by_header() {
        let set = sample();
        assert!(matches!(
            Datagram::decode(set.encode()).unwrap(),
            Datagram::FrameSet(_)
        ));

        let ack = Acknowledgement::new(AckKind::Ack, [1, 2, 3]);
        assert_eq!(
            Datagram::decode(ack.encode()).unwrap(),
            Datagram::Ack(ack.clone())
        );

        let nack = Acknowledgement::new(AckKind::Nack, [9]);
        assert_eq!(
            Datagram::decode(nack.encode()).unwrap(),
            Datagram::Nack(nack)
        );
    }

    #[test]
    fn test_truncated_frame_set_is_error() {
        let bytes = sample().encode();
        assert!(FrameSet::decode(bytes.slice(..bytes.len() - 2)).is_err());
        assert!(Datagram::decode(Bytes::new()).is_err());
    }

    #[test]
    fn test_is_connected() {
        assert!(is_connected(0x84));
        assert!(is_connected(0xc0));
        assert!(!is_connected(0x01));
    }
}
