//! ACK / NACK 레코드
//!
//! 수신 확인(ACK) 또는 누락 보고(NACK)할 FrameSet 시퀀스 번호 목록.
//! 연속 구간은 범위 레코드로 압축됨
//!
//! ```text
//! header       u8      0xC0 (ACK) / 0xA0 (NACK)
//! record count u16 BE
//! record       u8 single(1)/range(0), u24 LE start, [u24 LE end]
//! ```

use std::collections::BTreeSet;

use bytes::{BufMut, Bytes, BytesMut};

use crate::binary::{PacketReader, PacketWrite};
use crate::datagram::flags;
use crate::sequence::U24_MAX;
use crate::{Error, Result};

/// ACK/NACK 하나가 펼칠 수 있는 최대 시퀀스 수 (레코드 합계)
pub const MAX_RANGE_LEN: u32 = 4096;

/// ACK 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    Nack,
}

impl AckKind {
    pub fn header(self) -> u8 {
        match self {
            AckKind::Ack => flags::VALID | flags::ACK,
            AckKind::Nack => flags::VALID | flags::NACK,
        }
    }
}

/// ACK/NACK 데이터그램
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub kind: AckKind,
    pub sequence_numbers: BTreeSet<u32>,
}

impl Acknowledgement {
    pub fn new(kind: AckKind, sequence_numbers: impl IntoIterator<Item = u32>) -> Self {
        Self {
            kind,
            sequence_numbers: sequence_numbers
                .into_iter()
                .map(|seq| seq & U24_MAX)
                .collect(),
        }
    }

    pub fn ack(sequence_numbers: impl IntoIterator<Item = u32>) -> Self {
        Self::new(AckKind::Ack, sequence_numbers)
    }

    pub fn nack(sequence_numbers: impl IntoIterator<Item = u32>) -> Self {
        Self::new(AckKind::Nack, sequence_numbers)
    }

    /// 연속 구간 (start, end) 목록
    fn ranges(&self) -> Vec<(u32, u32)> {
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        for &seq in &self.sequence_numbers {
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == seq => *end = seq,
                _ => ranges.push((seq, seq)),
            }
        }
        ranges
    }

    pub fn encode(&self) -> Bytes {
        let ranges = self.ranges();
        let mut buf = BytesMut::with_capacity(3 + ranges.len() * 7);
        buf.put_u8(self.kind.header());
        buf.put_u16(ranges.len() as u16);
        for (start, end) in ranges {
            if start == end {
                buf.put_u8(1);
                buf.put_u24_le(start);
            } else {
                buf.put_u8(0);
                buf.put_u24_le(start);
                buf.put_u24_le(end);
            }
        }
        buf.freeze()
    }

    pub fn decode(kind: AckKind, bytes: impl Into<Bytes>) -> Result<Self> {
        let mut reader = PacketReader::new(bytes);
        reader.read_u8()?;
        let record_count = reader.read_u16_be()?;

        let mut sequence_numbers = BTreeSet::new();
        let mut expanded: u32 = 0;
        for _ in 0..record_count {
            let single = reader.read_bool()?;
            let start = reader.read_u24_le()?;
            let end = if single { start } else { reader.read_u24_le()? };

            if end < start || expanded + (end - start) >= MAX_RANGE_LEN {
                return Err(Error::AckRangeTooLarge { start, end });
            }
            expanded += end - start + 1;
            sequence_numbers.extend(start..=end);
        }

        Ok(Self {
            kind,
            sequence_numbers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_round_trip() {
        let ack = Acknowledgement::ack([0, 1, 2, 3, 7, 9, 10, U24_MAX]);
        let decoded = Acknowledgement::decode(AckKind::Ack, ack.encode()).unwrap();
        assert_eq!(decoded, ack);
    }

    #[test]
    fn test_ranges_are_compacted() {
        let nack = Acknowledgement::nack([5, 6, 7, 8, 20]);
        let bytes = nack.encode();

        // header + count + range(7) + single(4)
        assert_eq!(bytes.len(), 1 + 2 + 7 + 4);
        assert_eq!(bytes[0], 0xA0);
        assert_eq!(&bytes[1..3], &[0, 2]);
        assert_eq!(&bytes[3..10], &[0, 5, 0, 0, 8, 0, 0]);
        assert_eq!(&bytes[10..], &[1, 20, 0, 0]);
    }

    #[test]
    fn test_empty_ack() {
        let ack = Acknowledgement::ack(Vec::new());
        let bytes = ack.encode();
        assert_eq!(bytes.as_ref(), &[0xC0, 0, 0]);
        assert_eq!(Acknowledgement::decode(AckKind::Ack, bytes).unwrap(), ack);
    }

    #[test]
    fn test_hostile_range_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xC0);
        buf.put_u16(1);
        buf.put_u8(0);
        buf.put_u24_le(0);
        buf.put_u24_le(U24_MAX);
        assert!(matches!(
            Acknowledgement::decode(AckKind::Ack, buf.freeze()),
            Err(Error::AckRangeTooLarge { .. })
        ));
    }

    #[test]
    fn test_total_expansion_capped_across_records() {
        // 레코드 하나하나는 한도 안이지만 합계가 한도를 넘음
        let records = 3u32;
        let width = MAX_RANGE_LEN / 2;
        let mut buf = BytesMut::new();
        buf.put_u8(0xC0);
        buf.put_u16(records as u16);
        for i in 0..records {
            let start = i * width;
            buf.put_u8(0);
            buf.put_u24_le(start);
            buf.put_u24_le(start + width - 1);
        }

        assert!(matches!(
            Acknowledgement::decode(AckKind::Ack, buf.freeze()),
            Err(Error::AckRangeTooLarge { start, .. }) if start == 2 * width
        ));
    }

    #[test]
    fn test_singles_count_toward_cap() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xA0);
        buf.put_u16(MAX_RANGE_LEN as u16 + 1);
        for seq in 0..=MAX_RANGE_LEN {
            buf.put_u8(1);
            buf.put_u24_le(seq);
        }
        assert!(Acknowledgement::decode(AckKind::Nack, buf.freeze()).is_err());

        let full = Acknowledgement::nack(0..MAX_RANGE_LEN);
        let decoded = Acknowledgement::decode(AckKind::Nack, full.encode()).unwrap();
        assert_eq!(decoded.sequence_numbers.len(), MAX_RANGE_LEN as usize);
    }

    #[test]
    fn test_truncated_record() {
        let bytes = Bytes::from_static(&[0xC0, 0, 2, 1, 3, 0, 0]);
        assert!(Acknowledgement::decode(AckKind::Ack, bytes).is_err());
    }
}
