//! # rakline
//!
//! UDP 위의 RakNet 호환 신뢰성 데이터그램 전송 계층
//!
//! ## 핵심 특징
//! - **FrameSet**: 24비트 시퀀스 번호가 붙은 데이터그램 하나에 여러 프레임 배치
//! - **ACK/NACK**: 받은 시퀀스는 범위 압축 ACK, 구멍은 NACK으로 보고 후 재전송
//! - **신뢰성 클래스**: unreliable / reliable / ordered / sequenced (채널 32개)
//! - **분할/재조립**: MTU를 넘는 메시지는 조각으로 나눠 보내고 수신측에서 복원
//! - **수명주기**: 오프라인 핸드셰이크 → 로그인 → 연결 → 종료 (비활성 타임아웃)
//!
//! ## 구조
//! - [`session::Session`]: 피어별 신뢰성 상태 머신 (I/O 없음)
//! - [`listener::Listener`]: UDP 소켓과 세션 레지스트리를 소유하는 tokio 태스크
//! - [`listener::ListenerHandle`]: 다른 태스크에서 전송/종료를 요청하는 핸들

use std::sync::OnceLock;

pub mod ack;
pub mod binary;
pub mod config;
pub mod datagram;
pub mod error;
pub mod frame;
pub mod listener;
pub mod message;
pub mod offline;
pub mod reliability;
pub mod sequence;
pub mod session;
pub mod stats;

pub use ack::{AckKind, Acknowledgement};
pub use config::Config;
pub use datagram::{Datagram, FrameSet};
pub use error::{Error, Result};
pub use frame::{Fragment, Frame};
pub use listener::{EventReceiver, Listener, ListenerEvent, ListenerHandle};
pub use reliability::Reliability;
pub use session::{Priority, Session, SessionState};
pub use stats::{ListenerStats, SessionStats};

/// 프로토콜 버전 (OpenConnectionRequest1)
pub const PROTOCOL_VERSION: u8 = 10;

/// 순서 채널 수
pub const MAX_CHANNELS: usize = 32;

/// 기본 최대 MTU
pub const DEFAULT_MAX_MTU: u16 = 1492;

/// 최소 MTU
pub const MIN_MTU: u16 = 576;

/// 허용 MTU 상한
///
/// 프레임 길이 필드는 비트 단위 u16이라 분할되지 않은 프레임 내용이
/// `frame::MAX_CONTENT_LEN`을 넘지 않아야 함
pub const MAX_MTU: u16 = 8192;

/// IP + UDP 헤더 크기 (MTU에서 제외)
pub const UDP_HEADER_SIZE: usize = 28;

/// 오프라인 메시지 매직
pub const OFFLINE_MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];

static SERVER_GUID: OnceLock<u64> = OnceLock::new();

/// 프로세스 단위 서버 GUID (최초 호출 시 랜덤 생성, 이후 고정)
pub fn server_guid() -> u64 {
    *SERVER_GUID.get_or_init(rand::random::<u64>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_guid_is_stable() {
        assert_eq!(server_guid(), server_guid());
    }
}
