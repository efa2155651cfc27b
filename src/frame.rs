//! 프레임 정의
//!
//! - Frame: 하나의 논리 메시지 + 신뢰성/순서/분할 메타데이터
//! - 신뢰성 처리의 최소 단위, 여러 프레임이 하나의 FrameSet(데이터그램)에 담김
//!
//! ```text
//! flags        u8      reliability << 5 | 0x10 (분할 시)
//! bit length   u16 BE  content 길이 (비트)
//! [reliable    u24 LE] reliable 등급
//! [sequence    u24 LE] sequenced 등급
//! [order       u24 LE + channel u8] ordered/sequenced 등급
//! [fragment    count u32 BE, id u16 BE, index u32 BE] 분할 프레임
//! content
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::binary::{PacketReader, PacketWrite};
use crate::reliability::Reliability;
use crate::{Error, Result, MAX_CHANNELS};

/// 분할 플래그 비트
pub const SPLIT_FLAG: u8 = 0x10;

/// 프레임 하나의 최대 내용 크기 (길이 필드가 비트 단위 u16)
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize / 8;

/// 분할 프레임 헤더 최대 크기
/// flags(1) + length(2) + reliable(3) + sequence(3) + order(4) + fragment(10)
pub const MAX_FRAME_HEADER_SIZE: usize = 23;

/// 분할 정보
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// 전체 조각 수
    pub count: u32,
    /// 조각 묶음 ID
    pub id: u16,
    /// 이 조각의 인덱스 (0..count)
    pub index: u32,
}

/// 프레임
///
/// 등급에 해당하지 않는 인덱스 필드는 와이어에 실리지 않으며 디코드 시 0
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub reliability: Reliability,
    pub reliable_index: u32,
    pub sequence_index: u32,
    pub order_index: u32,
    pub order_channel: u8,
    pub fragment: Option<Fragment>,
    pub content: Bytes,
}

impl Frame {
    /// 새 프레임 생성 (채널 0)
    pub fn new(reliability: Reliability, content: impl Into<Bytes>) -> Self {
        Self {
            reliability,
            content: content.into(),
            ..Default::default()
        }
    }

    /// 순서 채널 지정
    pub fn with_channel(mut self, order_channel: u8) -> Self {
        self.order_channel = order_channel;
        self
    }

    pub fn is_fragmented(&self) -> bool {
        self.fragment.is_some()
    }

    /// 인코딩 크기 (인코딩 없이 계산)
    pub fn byte_length(&self) -> usize {
        let mut len = 3 + self.content.len();
        if self.reliability.is_reliable() {
            len += 3;
        }
        if self.reliability.is_sequenced() {
            len += 3;
        }
        if self.reliability.has_order_fields() {
            len += 4;
        }
        if self.fragment.is_some() {
            len += 10;
        }
        len
    }

    /// 버퍼에 인코딩
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut flags = (self.reliability as u8) << 5;
        if self.fragment.is_some() {
            flags |= SPLIT_FLAG;
        }
        buf.put_u8(flags);
        debug_assert!(self.content.len() <= MAX_CONTENT_LEN);
        buf.put_u16((self.content.len() * 8) as u16);

        if self.reliability.is_reliable() {
            buf.put_u24_le(self.reliable_index);
        }
        if self.reliability.is_sequenced() {
            buf.put_u24_le(self.sequence_index);
        }
        if self.reliability.has_order_fields() {
            buf.put_u24_le(self.order_index);
            buf.put_u8(self.order_channel);
        }
        if let Some(fragment) = &self.fragment {
            buf.put_u32(fragment.count);
            buf.put_u16(fragment.id);
            buf.put_u32(fragment.index);
        }

        buf.put_slice(&self.content);
    }

    /// 리더에서 프레임 하나 디코딩
    pub fn decode(reader: &mut PacketReader) -> Result<Self> {
        let flags = reader.read_u8()?;
        let reliability = Reliability::from_u8(flags >> 5)?;
        let length = (reader.read_u16_be()? as usize + 7) / 8;

        let mut frame = Frame {
            reliability,
            ..Default::default()
        };

        if reliability.is_reliable() {
            frame.reliable_index = reader.read_u24_le()?;
        }
        if reliability.is_sequenced() {
            frame.sequence_index = reader.read_u24_le()?;
        }
        if reliability.has_order_fields() {
            frame.order_index = reader.read_u24_le()?;
            frame.order_channel = reader.read_u8()?;
            if frame.order_channel as usize >= MAX_CHANNELS {
                return Err(Error::ChannelOutOfRange(frame.order_channel));
            }
        }
        if flags & SPLIT_FLAG != 0 {
            let count = reader.read_u32_be()?;
            let id = reader.read_u16_be()?;
            let index = reader.read_u32_be()?;
            if count == 0 || index >= count {
                return Err(Error::InvalidFragment { index, count });
            }
            frame.fragment = Some(Fragment { count, id, index });
        }

        frame.content = reader.read_bytes(length)?;
        Ok(frame)
    }

    /// 단독 인코딩
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.byte_length());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// 단독 디코딩 (남는 바이트 무시)
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        Self::decode(&mut PacketReader::new(bytes))
    }
}
