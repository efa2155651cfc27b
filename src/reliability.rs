//! 프레임 신뢰성 등급

use crate::{Error, Result};

/// 프레임 전달 계약
///
/// 와이어에서는 플래그 바이트의 상위 3비트
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Reliability {
    #[default]
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
    ReliableSequenced = 4,
    UnreliableWithAckReceipt = 5,
    ReliableWithAckReceipt = 6,
    ReliableOrderedWithAckReceipt = 7,
}

impl Reliability {
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Unreliable,
            1 => Self::UnreliableSequenced,
            2 => Self::Reliable,
            3 => Self::ReliableOrdered,
            4 => Self::ReliableSequenced,
            5 => Self::UnreliableWithAckReceipt,
            6 => Self::ReliableWithAckReceipt,
            7 => Self::ReliableOrderedWithAckReceipt,
            other => return Err(Error::InvalidReliability(other)),
        })
    }

    /// reliable 인덱스를 가지는지
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            Self::Reliable
                | Self::ReliableOrdered
                | Self::ReliableSequenced
                | Self::ReliableWithAckReceipt
                | Self::ReliableOrderedWithAckReceipt
        )
    }

    /// sequence 인덱스를 가지는지
    pub fn is_sequenced(self) -> bool {
        matches!(self, Self::UnreliableSequenced | Self::ReliableSequenced)
    }

    /// 순서 보장 채널에 버퍼링되는지 (sequenced 제외)
    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            Self::ReliableOrdered | Self::ReliableOrderedWithAckReceipt
        )
    }

    /// order 인덱스와 채널 필드를 가지는지
    pub fn has_order_fields(self) -> bool {
        self.is_ordered() || self.is_sequenced()
    }
}
