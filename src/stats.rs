//! 전송 통계

use std::time::{Duration, Instant};

/// 세션별 통계
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// 세션 생성 시간
    pub start_time: Instant,

    /// 수신 데이터그램 수 (ACK/NACK 포함)
    pub datagrams_received: u64,

    /// 송신 데이터그램 수 (재전송 포함)
    pub datagrams_sent: u64,

    pub bytes_received: u64,
    pub bytes_sent: u64,

    /// 중복/지연 FrameSet 수
    pub duplicate_datagrams: u64,

    /// 누락으로 판정된 시퀀스 번호 수
    pub lost_datagrams: u64,

    /// 누락 판정 후 늦게 도착한 수
    pub late_datagrams: u64,

    /// 디코드 실패로 버린 데이터그램 수
    pub malformed_datagrams: u64,

    pub acks_sent: u64,
    pub nacks_sent: u64,
    pub acks_received: u64,
    pub nacks_received: u64,

    /// 재전송 데이터그램 수 (NACK + 타임아웃)
    pub retransmitted_datagrams: u64,

    /// 상위로 전달된 프레임 수
    pub frames_delivered: u64,

    /// 오래된 인덱스로 버린 프레임 수
    pub stale_frames: u64,

    /// 재조립 완료된 분할 메시지 수
    pub fragments_reassembled: u64,

    /// 만료된 프래그먼트 묶음 수
    pub fragments_expired: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            datagrams_received: 0,
            datagrams_sent: 0,
            bytes_received: 0,
            bytes_sent: 0,
            duplicate_datagrams: 0,
            lost_datagrams: 0,
            late_datagrams: 0,
            malformed_datagrams: 0,
            acks_sent: 0,
            nacks_sent: 0,
            acks_received: 0,
            nacks_received: 0,
            retransmitted_datagrams: 0,
            frames_delivered: 0,
            stale_frames: 0,
            fragments_reassembled: 0,
            fragments_expired: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 수신측 손실률 (늦게 도착한 것은 손실에서 제외)
    pub fn loss_rate(&self) -> f64 {
        let lost = self.lost_datagrams.saturating_sub(self.late_datagrams);
        let total = self.datagrams_received + lost;
        if total == 0 {
            return 0.0;
        }
        lost as f64 / total as f64
    }

    /// 송신 데이터그램 중 재전송 비율
    pub fn retransmit_ratio(&self) -> f64 {
        if self.datagrams_sent == 0 {
            return 0.0;
        }
        self.retransmitted_datagrams as f64 / self.datagrams_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | In: {} dgram / {} B | Out: {} dgram / {} B | Delivered: {} | Loss: {:.2}% | Resent: {} | NACKs: {}/{}",
            self.elapsed().as_secs_f64(),
            self.datagrams_received,
            self.bytes_received,
            self.datagrams_sent,
            self.bytes_sent,
            self.frames_delivered,
            self.loss_rate() * 100.0,
            self.retransmitted_datagrams,
            self.nacks_sent,
            self.nacks_received,
        )
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 리스너 전체 통계
#[derive(Debug, Clone)]
pub struct ListenerStats {
    pub start_time: Instant,
    pub active_sessions: usize,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub datagrams_received: u64,
    pub datagrams_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,

    /// 오프라인(핸드셰이크) 메시지 수
    pub offline_messages: u64,

    /// 세션 없는 피어의 연결 데이터그램 등 버려진 수
    pub dropped_datagrams: u64,

    /// 송신 실패 수
    pub send_errors: u64,
}

impl ListenerStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            active_sessions: 0,
            sessions_opened: 0,
            sessions_closed: 0,
            datagrams_received: 0,
            datagrams_sent: 0,
            bytes_received: 0,
            bytes_sent: 0,
            offline_messages: 0,
            dropped_datagrams: 0,
            send_errors: 0,
        }
    }

    pub fn record_received(&mut self, len: usize) {
        self.datagrams_received += 1;
        self.bytes_received += len as u64;
    }

    pub fn record_sent(&mut self, len: usize) {
        self.datagrams_sent += 1;
        self.bytes_sent += len as u64;
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Uptime: {:.1}s | Sessions: {} active, {} opened, {} closed | In: {} / {} B | Out: {} / {} B | Offline: {} | Dropped: {}",
            self.start_time.elapsed().as_secs_f64(),
            self.active_sessions,
            self.sessions_opened,
            self.sessions_closed,
            self.datagrams_received,
            self.bytes_received,
            self.datagrams_sent,
            self.bytes_sent,
            self.offline_messages,
            self.dropped_datagrams,
        )
    }
}

impl Default for ListenerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_rate_excludes_late_arrivals() {
        let mut stats = SessionStats::new();
        stats.datagrams_received = 8;
        stats.lost_datagrams = 4;
        stats.late_datagrams = 2;
        assert!((stats.loss_rate() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_empty_rates() {
        let stats = SessionStats::default();
        assert_eq!(stats.loss_rate(), 0.0);
        assert_eq!(stats.retransmit_ratio(), 0.0);
    }

    #[test]
    fn test_listener_counters() {
        let mut stats = ListenerStats::default();
        stats.record_received(100);
        stats.record_sent(40);
        stats.record_sent(60);
        assert_eq!(stats.datagrams_received, 1);
        assert_eq!(stats.bytes_sent, 100);
        assert!(stats.summary().contains("Out: 2 / 100 B"));
    }
}
