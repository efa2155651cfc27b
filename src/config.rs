//! 프로토콜 설정

use std::net::SocketAddr;
use std::time::Duration;

use crate::{Error, Result, DEFAULT_MAX_MTU, MAX_MTU, MIN_MTU, PROTOCOL_VERSION};

/// 리스너/세션 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 바인드 주소
    pub bind_addr: SocketAddr,

    /// 허용 프로토콜 버전
    pub protocol_version: u8,

    /// 협상 가능한 최대 MTU (IP/UDP 헤더 포함)
    pub max_mtu: u16,

    /// 협상 가능한 최소 MTU
    pub min_mtu: u16,

    /// 최대 동시 세션 수
    pub max_sessions: usize,

    /// 틱 간격 (ACK/NACK 전송, 큐 플러시)
    pub tick_interval: Duration,

    /// 비활성 세션 타임아웃
    pub session_timeout: Duration,

    /// ACK 없는 데이터그램 재전송 대기 시간
    pub resend_timeout: Duration,

    /// 미완성 프래그먼트 묶음 만료 시간
    pub fragment_timeout: Duration,

    /// 프래그먼트 묶음 하나의 최대 조각 수
    pub max_fragment_count: u32,

    /// 세션당 동시 재조립 묶음 수
    pub max_fragment_buckets: usize,

    /// 채널당 순서 대기 버퍼 크기
    pub max_ordering_queue: usize,

    /// 누락 추적 창 (시퀀스 번호 수)
    pub max_nack_window: u32,

    /// 오프라인 퐁에 실리는 서버 광고 문자열
    pub advertisement: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 19132)),
            protocol_version: PROTOCOL_VERSION,
            max_mtu: DEFAULT_MAX_MTU,
            min_mtu: MIN_MTU,
            max_sessions: 1024,
            tick_interval: Duration::from_millis(10),   // 100 TPS
            session_timeout: Duration::from_secs(10),
            resend_timeout: Duration::from_millis(1000),
            fragment_timeout: Duration::from_secs(30),
            max_fragment_count: 1024,
            max_fragment_buckets: 64,
            max_ordering_queue: 4096,
            max_nack_window: 2048,
            advertisement: String::from("rakline"),
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 설정 검증 (리스너 바인드 전)
    pub fn validate(&self) -> Result<()> {
        if self.min_mtu < MIN_MTU || self.max_mtu > MAX_MTU || self.min_mtu > self.max_mtu {
            return Err(Error::InvalidConfig(format!(
                "MTU 범위 {}..={} (허용 {}..={})",
                self.min_mtu, self.max_mtu, MIN_MTU, MAX_MTU
            )));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::InvalidConfig("tick_interval은 0일 수 없음".into()));
        }
        Ok(())
    }

    /// 요청 MTU를 허용 범위로 제한
    ///
    /// 검증되지 않은 설정에서도 패닉 없이 `max_mtu`(최대 `MAX_MTU`) 쪽을 우선함
    pub fn clamp_mtu(&self, requested: u16) -> u16 {
        requested.max(self.min_mtu).min(self.max_mtu).min(MAX_MTU)
    }

    /// LAN 환경용 설정
    pub fn lan() -> Self {
        Self {
            tick_interval: Duration::from_millis(5),
            resend_timeout: Duration::from_millis(200),
            fragment_timeout: Duration::from_secs(10),
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            max_mtu: 1200,
            session_timeout: Duration::from_secs(20),
            resend_timeout: Duration::from_millis(1500),
            fragment_timeout: Duration::from_secs(60),
            max_nack_window: 4096,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_mtu() {
        let config = Config::default();
        assert_eq!(config.clamp_mtu(100), MIN_MTU);
        assert_eq!(config.clamp_mtu(u16::MAX), DEFAULT_MAX_MTU);
        assert_eq!(config.clamp_mtu(1200), 1200);
    }

    #[test]
    fn test_inverted_mtu_range() {
        let config = Config {
            max_mtu: 500,
            ..Config::default()
        };
        assert_eq!(config.clamp_mtu(1400), 500);
        assert_eq!(config.clamp_mtu(100), 500);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_mtu_bounds() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::lan().validate().is_ok());
        assert!(Config::unstable_network().validate().is_ok());

        let jumbo = Config {
            max_mtu: 9000,
            ..Config::default()
        };
        assert!(jumbo.validate().is_err());
        assert_eq!(jumbo.clamp_mtu(9000), MAX_MTU);

        let no_tick = Config {
            tick_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(no_tick.validate().is_err());
    }

    #[test]
    fn test_presets_keep_timeout() {
        assert_eq!(Config::lan().session_timeout, Duration::from_secs(10));
        assert!(Config::unstable_network().max_mtu < DEFAULT_MAX_MTU);
    }
}
