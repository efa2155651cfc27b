//! 에러 타입 정의

use std::net::SocketAddr;

use thiserror::Error;

/// rakline 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("데이터 부족: {needed} bytes 필요, {remaining} bytes 남음")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("유효하지 않은 신뢰성 등급: {0}")]
    InvalidReliability(u8),

    #[error("유효하지 않은 주소 버전: {0}")]
    InvalidAddressVersion(u8),

    #[error("오프라인 매직 불일치")]
    InvalidMagic,

    #[error("메시지 ID 불일치: expected {expected:#04x}, got {got:#04x}")]
    MessageIdMismatch { expected: u8, got: u8 },

    #[error("알 수 없는 메시지 ID: {0:#04x}")]
    UnknownMessage(u8),

    #[error("유효하지 않은 UTF-8 문자열")]
    InvalidString(#[from] std::string::FromUtf8Error),

    #[error("유효하지 않은 프래그먼트: index={index}, count={count}")]
    InvalidFragment { index: u32, count: u32 },

    #[error("채널 범위 초과: {0}")]
    ChannelOutOfRange(u8),

    #[error("ACK 범위가 너무 큼: {start}..={end}")]
    AckRangeTooLarge { start: u32, end: u32 },

    #[error("잘못된 설정: {0}")]
    InvalidConfig(String),

    #[error("채널 에러")]
    ChannelError,

    #[error("세션 없음: {0}")]
    SessionNotFound(SocketAddr),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
