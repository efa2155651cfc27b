//! 세션 (피어별 신뢰성 상태 머신)
//!
//! - 수신: 손실 감지, 분할 재조립, 순서/시퀀스 채널 재생
//! - 송신: 프레임 배치, MTU 초과 분할, 재전송 백업
//! - 수명주기: Connecting → Connected → Disconnecting → Disconnected
//!
//! 세션은 I/O를 직접 하지 않음. 인코딩된 데이터그램을 송신 큐에 쌓고
//! 리스너가 매 처리 후 소켓으로 비움

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, trace, warn};

use crate::ack::{AckKind, Acknowledgement, MAX_RANGE_LEN};
use crate::datagram::{Datagram, FrameSet, FRAME_SET_HEADER_SIZE};
use crate::frame::{Fragment, Frame, MAX_FRAME_HEADER_SIZE};
use crate::listener::{EventSender, ListenerEvent};
use crate::message::{
    self, ConnectedPing, ConnectedPong, ConnectionRequest, ConnectionRequestAccepted, MessageId,
    NewIncomingConnection,
};
use crate::reliability::Reliability;
use crate::sequence::{self, U24_MAX};
use crate::stats::SessionStats;
use crate::{Config, MAX_CHANNELS, MAX_MTU, UDP_HEADER_SIZE};

/// 송신 우선순위
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// 다음 틱에 배치 전송
    #[default]
    Normal,
    /// 큐에 넣은 즉시 플러시
    Immediate,
}

/// 세션 수명주기 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// 재전송 백업
#[derive(Debug)]
struct SentDatagram {
    frame_set: FrameSet,
    payload: Bytes,
    sent_at: Instant,
    resends: u32,
}

/// 분할 메시지 재조립 묶음
#[derive(Debug)]
struct FragmentBucket {
    count: u32,
    pieces: BTreeMap<u32, Frame>,
    created_at: Instant,
}

/// 피어 하나의 신뢰성 상태
pub struct Session {
    addr: SocketAddr,
    mtu: u16,
    config: Arc<Config>,
    state: SessionState,
    events: EventSender,
    stats: SessionStats,
    close_reason: Option<String>,

    // 송신측
    output_queue: FrameSet,
    output_sequence_number: u32,
    output_reliable_index: u32,
    output_sequence_index: u32,
    output_fragment_id: u16,
    output_order_index: [u32; MAX_CHANNELS],
    output_backup: BTreeMap<u32, SentDatagram>,
    outgoing: VecDeque<Bytes>,

    // 수신측
    last_input_sequence: u32,
    /// 이번 틱에 수신 (ACK 대상)
    received_sequences: BTreeSet<u32>,
    /// 이번 틱에 누락 판정 (NACK 대상)
    lost_sequences: BTreeSet<u32>,
    /// 아직 도착하지 않은 누락 시퀀스
    missing_sequences: BTreeSet<u32>,
    input_highest_sequence_index: [u32; MAX_CHANNELS],
    input_order_index: [u32; MAX_CHANNELS],
    input_ordering_queue: Vec<BTreeMap<u32, Frame>>,
    fragments: HashMap<u16, FragmentBucket>,

    last_update: Instant,
    active: bool,
}

impl Session {
    /// 핸드셰이크 완료 후 새 세션 생성 (Connecting)
    ///
    /// MTU는 `MAX_MTU`로 제한됨
    pub fn new(addr: SocketAddr, mtu: u16, config: Arc<Config>, events: EventSender) -> Self {
        Self {
            addr,
            mtu: mtu.min(MAX_MTU),
            config,
            state: SessionState::Connecting,
            events,
            stats: SessionStats::new(),
            close_reason: None,
            output_queue: FrameSet::default(),
            output_sequence_number: 0,
            output_reliable_index: 0,
            output_sequence_index: 0,
            output_fragment_id: 0,
            output_order_index: [0; MAX_CHANNELS],
            output_backup: BTreeMap::new(),
            outgoing: VecDeque::new(),
            // 첫 데이터그램 0번이 바로 다음 번호가 되도록 -1(순환)에서 시작
            last_input_sequence: U24_MAX,
            received_sequences: BTreeSet::new(),
            lost_sequences: BTreeSet::new(),
            missing_sequences: BTreeSet::new(),
            input_highest_sequence_index: [0; MAX_CHANNELS],
            input_order_index: [0; MAX_CHANNELS],
            input_ordering_queue: (0..MAX_CHANNELS).map(|_| BTreeMap::new()).collect(),
            fragments: HashMap::new(),
            last_update: Instant::now(),
            active: true,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == SessionState::Disconnected
    }

    /// 종료 사유 (종료된 경우)
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// ACK 대기 중인 송신 데이터그램 수
    pub fn unacknowledged(&self) -> usize {
        self.output_backup.len()
    }

    /// 송신 대기 데이터그램 꺼내기
    pub fn drain_outgoing(&mut self) -> impl Iterator<Item = Bytes> + '_ {
        self.outgoing.drain(..)
    }

    /// UDP 페이로드 한도 (MTU - IP/UDP 헤더)
    fn datagram_budget(&self) -> usize {
        (self.mtu as usize).saturating_sub(UDP_HEADER_SIZE)
    }

    // ─────────────────────────────────────────────────────────────────
    // 수신
    // ─────────────────────────────────────────────────────────────────

    /// 연결 데이터그램 처리 (ACK / NACK / FrameSet)
    pub fn handle(&mut self, datagram: Bytes, now: Instant) {
        self.active = true;
        self.last_update = now;
        self.stats.datagrams_received += 1;
        self.stats.bytes_received += datagram.len() as u64;

        if self.is_disconnected() {
            return;
        }

        match Datagram::decode(datagram) {
            Ok(Datagram::Ack(ack)) => self.handle_ack(ack),
            Ok(Datagram::Nack(nack)) => self.handle_nack(nack, now),
            Ok(Datagram::FrameSet(frame_set)) => self.handle_frame_set(frame_set),
            Err(e) => {
                self.stats.malformed_datagrams += 1;
                debug!("잘못된 데이터그램 ({}): {}", self.addr, e);
            }
        }
    }

    fn handle_frame_set(&mut self, frame_set: FrameSet) {
        let seq = frame_set.sequence_number;

        if self.received_sequences.contains(&seq) {
            self.stats.duplicate_datagrams += 1;
            return;
        }

        if self.missing_sequences.remove(&seq) {
            // 누락으로 판정했던 것이 늦게 도착
            self.lost_sequences.remove(&seq);
            self.stats.late_datagrams += 1;
        } else if !sequence::is_newer(seq, self.last_input_sequence) {
            // 이미 처리한 데이터그램의 사본. ACK 유실 대비로 다시 확인만 보냄
            self.stats.duplicate_datagrams += 1;
            self.received_sequences.insert(seq);
            trace!("오래된 FrameSet {} 무시 ({})", seq, self.addr);
            return;
        }

        self.received_sequences.insert(seq);

        if sequence::is_newer(seq, self.last_input_sequence) {
            let gap = sequence::distance(self.last_input_sequence, seq);
            if gap > 1 {
                self.mark_missing(gap);
            }
            self.last_input_sequence = seq;
            self.prune_missing();
        }

        for frame in frame_set.frames {
            self.receive_frame(frame);
        }
    }

    /// `last_input_sequence` 이후 `gap - 1`개의 구멍을 누락으로 기록
    fn mark_missing(&mut self, gap: u32) {
        let window = self.config.max_nack_window;
        let first = if gap - 1 > window { gap - window } else { 1 };

        for offset in first..gap {
            let missing = (self.last_input_sequence + offset) & U24_MAX;
            if self.received_sequences.contains(&missing) {
                continue;
            }
            if self.missing_sequences.insert(missing) {
                self.lost_sequences.insert(missing);
                self.stats.lost_datagrams += 1;
            }
        }
    }

    /// 추적 창 밖으로 밀려난 누락 시퀀스 정리
    fn prune_missing(&mut self) {
        let last = self.last_input_sequence;
        let window = self.config.max_nack_window;
        self.missing_sequences
            .retain(|&seq| sequence::distance(seq, last) <= window);
    }

    /// 프레임 재조립 / 전달
    fn receive_frame(&mut self, frame: Frame) {
        if frame.is_fragmented() {
            self.handle_fragment(frame);
            return;
        }

        let channel = frame.order_channel as usize;

        if frame.reliability.is_sequenced() {
            if !sequence::is_at_least(frame.sequence_index, self.input_highest_sequence_index[channel])
                || !sequence::is_at_least(frame.order_index, self.input_order_index[channel])
            {
                self.stats.stale_frames += 1;
                return;
            }

            self.input_highest_sequence_index[channel] = sequence::next(frame.sequence_index);
            self.handle_packet(frame.content);
        } else if frame.reliability.is_ordered() {
            let expected = self.input_order_index[channel];

            if frame.order_index == expected {
                self.input_order_index[channel] = sequence::next(expected);
                self.handle_packet(frame.content);

                // 이어지는 순서의 대기 프레임 방출
                loop {
                    let next = self.input_order_index[channel];
                    let Some(buffered) = self.input_ordering_queue[channel].remove(&next) else {
                        break;
                    };
                    self.input_order_index[channel] = sequence::next(next);
                    self.handle_packet(buffered.content);
                }
            } else if sequence::is_newer(frame.order_index, expected) {
                let queue = &mut self.input_ordering_queue[channel];
                if queue.len() >= self.config.max_ordering_queue {
                    warn!(
                        "순서 대기 버퍼 초과: channel={}, {} ({})",
                        channel,
                        queue.len(),
                        self.addr
                    );
                    return;
                }
                queue.entry(frame.order_index).or_insert(frame);
            } else {
                self.stats.stale_frames += 1;
            }
        } else {
            self.handle_packet(frame.content);
        }
    }

    /// 분할 조각 수집, 완성 시 재조립 후 다시 전달
    fn handle_fragment(&mut self, frame: Frame) {
        let Some(fragment) = frame.fragment else {
            return;
        };

        if fragment.count > self.config.max_fragment_count {
            warn!(
                "프래그먼트 수 초과: id={}, count={} ({})",
                fragment.id, fragment.count, self.addr
            );
            return;
        }

        if !self.fragments.contains_key(&fragment.id)
            && self.fragments.len() >= self.config.max_fragment_buckets
        {
            warn!(
                "동시 재조립 묶음 한도 초과: {} ({})",
                self.fragments.len(),
                self.addr
            );
            return;
        }

        let template = Frame {
            fragment: None,
            content: Bytes::new(),
            ..frame.clone()
        };

        let created_at = self.last_update;
        let bucket = self
            .fragments
            .entry(fragment.id)
            .or_insert_with(|| FragmentBucket {
                count: fragment.count,
                pieces: BTreeMap::new(),
                created_at,
            });

        if bucket.count != fragment.count {
            debug!(
                "프래그먼트 수 불일치: id={}, expected={}, got={}",
                fragment.id, bucket.count, fragment.count
            );
            return;
        }

        bucket.pieces.insert(fragment.index, frame);
        if (bucket.pieces.len() as u32) < bucket.count {
            return;
        }

        let Some(bucket) = self.fragments.remove(&fragment.id) else {
            return;
        };

        // 인덱스는 모두 count 미만이고 개수가 count이므로 0..count가 빠짐없이 존재
        let total: usize = bucket.pieces.values().map(|piece| piece.content.len()).sum();
        let mut content = BytesMut::with_capacity(total);
        for piece in bucket.pieces.values() {
            content.extend_from_slice(&piece.content);
        }

        trace!(
            "프래그먼트 재조립: id={}, {} 조각, {} bytes",
            fragment.id,
            bucket.count,
            total
        );
        self.stats.fragments_reassembled += 1;

        self.receive_frame(Frame {
            content: content.freeze(),
            ..template
        });
    }

    /// 전달된 페이로드 라우팅 (첫 바이트 기준)
    fn handle_packet(&mut self, payload: Bytes) {
        let Some(&id) = payload.first() else {
            return;
        };
        self.stats.frames_delivered += 1;

        match self.state {
            SessionState::Disconnecting | SessionState::Disconnected => {}

            SessionState::Connecting => match MessageId::from_u8(id) {
                Some(MessageId::ConnectionRequest) => self.handle_connection_request(payload),
                Some(MessageId::NewIncomingConnection) => {
                    self.handle_new_incoming_connection(payload)
                }
                _ => trace!("연결 중 무시된 메시지 {:#04x} ({})", id, self.addr),
            },

            SessionState::Connected => match MessageId::from_u8(id) {
                Some(MessageId::DisconnectNotification) => self.disconnect("client disconnect"),
                Some(MessageId::ConnectedPing) => self.handle_connected_ping(payload),
                _ => {
                    let _ = self.events.send(ListenerEvent::Encapsulated {
                        addr: self.addr,
                        payload,
                    });
                }
            },
        }
    }

    fn handle_connection_request(&mut self, payload: Bytes) {
        let request = match ConnectionRequest::from_bytes(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("잘못된 ConnectionRequest ({}): {}", self.addr, e);
                return;
            }
        };

        debug!(
            "ConnectionRequest: guid={}, timestamp={} ({})",
            request.client_guid, request.request_timestamp, self.addr
        );

        let accepted = ConnectionRequestAccepted::new(self.addr, request.request_timestamp);
        self.send_frame(
            Frame::new(Reliability::ReliableOrdered, accepted.to_bytes()),
            Priority::Immediate,
        );
    }

    fn handle_new_incoming_connection(&mut self, payload: Bytes) {
        if let Err(e) = NewIncomingConnection::from_bytes(payload) {
            debug!("잘못된 NewIncomingConnection ({}): {}", self.addr, e);
            return;
        }

        self.state = SessionState::Connected;
        info!("세션 연결됨: {} (mtu={})", self.addr, self.mtu);
        let _ = self
            .events
            .send(ListenerEvent::SessionOpened { addr: self.addr });
    }

    fn handle_connected_ping(&mut self, payload: Bytes) {
        let ping = match ConnectedPing::from_bytes(payload) {
            Ok(ping) => ping,
            Err(e) => {
                debug!("잘못된 ConnectedPing ({}): {}", self.addr, e);
                return;
            }
        };

        let pong = ConnectedPong {
            client_timestamp: ping.client_timestamp,
            server_timestamp: message::now_millis(),
        };
        self.send_frame(
            Frame::new(Reliability::Unreliable, pong.to_bytes()),
            Priority::Immediate,
        );
    }

    fn handle_ack(&mut self, ack: Acknowledgement) {
        self.stats.acks_received += 1;
        for seq in &ack.sequence_numbers {
            self.output_backup.remove(seq);
        }
    }

    /// NACK: 백업된 데이터그램을 같은 시퀀스 번호로 그대로 재전송
    fn handle_nack(&mut self, nack: Acknowledgement, now: Instant) {
        self.stats.nacks_received += 1;
        for &seq in &nack.sequence_numbers {
            if !self.resend(seq, now) {
                trace!("NACK 대상 {} 백업 없음 ({})", seq, self.addr);
            }
        }
    }

    fn resend(&mut self, seq: u32, now: Instant) -> bool {
        let payload = match self.output_backup.get_mut(&seq) {
            Some(sent) => {
                sent.sent_at = now;
                sent.resends += 1;
                sent.payload.clone()
            }
            None => return false,
        };

        self.stats.retransmitted_datagrams += 1;
        self.push_outgoing(payload);
        true
    }

    // ─────────────────────────────────────────────────────────────────
    // 송신
    // ─────────────────────────────────────────────────────────────────

    /// 프레임 송신 (인덱스 할당, 필요 시 분할)
    ///
    /// # Panics
    /// 순서 채널이 `MAX_CHANNELS` 이상이면 패닉 (API 오용)
    pub fn send_frame(&mut self, mut frame: Frame, priority: Priority) {
        assert!(
            (frame.order_channel as usize) < MAX_CHANNELS,
            "order channel {} out of range (max {})",
            frame.order_channel,
            MAX_CHANNELS
        );
        let channel = frame.order_channel as usize;

        if frame.reliability.has_order_fields() {
            // sequenced 프레임은 순서 슬롯을 소비하지 않음
            frame.order_index = if frame.reliability.is_sequenced() {
                self.output_order_index[channel]
            } else {
                sequence::take(&mut self.output_order_index[channel])
            };
        }
        if frame.reliability.is_sequenced() {
            frame.sequence_index = sequence::take(&mut self.output_sequence_index);
        }

        let max_frame_size = self.datagram_budget().saturating_sub(FRAME_SET_HEADER_SIZE);
        if frame.byte_length() <= max_frame_size {
            if frame.reliability.is_reliable() {
                frame.reliable_index = sequence::take(&mut self.output_reliable_index);
            }
            self.add_frame_to_queue(frame, priority);
            return;
        }

        let chunk_size = max_frame_size.saturating_sub(MAX_FRAME_HEADER_SIZE).max(1);
        let content = frame.content.clone();
        let count = content.len().div_ceil(chunk_size) as u32;
        let id = self.output_fragment_id;
        self.output_fragment_id = id.wrapping_add(1);

        debug!(
            "프레임 분할: {} bytes → {} 조각 (id={}, {})",
            content.len(),
            count,
            id,
            self.addr
        );

        for (index, start) in (0..content.len()).step_by(chunk_size).enumerate() {
            let end = (start + chunk_size).min(content.len());
            let mut piece = Frame {
                fragment: Some(Fragment {
                    count,
                    id,
                    index: index as u32,
                }),
                content: content.slice(start..end),
                ..frame.clone()
            };
            if piece.reliability.is_reliable() {
                piece.reliable_index = sequence::take(&mut self.output_reliable_index);
            }
            self.add_frame_to_queue(piece, priority);
        }
    }

    fn add_frame_to_queue(&mut self, frame: Frame, priority: Priority) {
        if self.output_queue.byte_length() + frame.byte_length() > self.datagram_budget() {
            self.send_frame_queue();
        }

        self.output_queue.frames.push(frame);

        if priority == Priority::Immediate {
            self.send_frame_queue();
        }
    }

    /// 대기 중인 FrameSet 플러시 (백업 보관)
    pub fn send_frame_queue(&mut self) {
        if self.output_queue.is_empty() {
            return;
        }

        let mut frame_set = std::mem::take(&mut self.output_queue);
        frame_set.sequence_number = sequence::take(&mut self.output_sequence_number);
        let payload = frame_set.encode();

        self.output_backup.insert(
            frame_set.sequence_number,
            SentDatagram {
                frame_set,
                payload: payload.clone(),
                sent_at: Instant::now(),
                resends: 0,
            },
        );
        self.push_outgoing(payload);
    }

    fn push_outgoing(&mut self, payload: Bytes) {
        self.stats.datagrams_sent += 1;
        self.stats.bytes_sent += payload.len() as u64;
        self.outgoing.push_back(payload);
    }

    // ─────────────────────────────────────────────────────────────────
    // 주기 작업
    // ─────────────────────────────────────────────────────────────────

    /// 틱: 타임아웃 확인, ACK/NACK 전송, 재전송, 큐 플러시
    pub fn update(&mut self, now: Instant) {
        if self.is_disconnected() {
            return;
        }

        if !self.active
            && now.saturating_duration_since(self.last_update) >= self.config.session_timeout
        {
            self.disconnect("timeout");
            return;
        }

        self.active = false;

        let received = std::mem::take(&mut self.received_sequences);
        self.push_acknowledgements(AckKind::Ack, received);
        let lost = std::mem::take(&mut self.lost_sequences);
        self.push_acknowledgements(AckKind::Nack, lost);

        self.resend_expired(now);
        self.expire_fragments(now);
        self.send_frame_queue();
    }

    /// 수신측 디코드 한도를 넘지 않도록 나눠서 전송
    fn push_acknowledgements(&mut self, kind: AckKind, sequences: BTreeSet<u32>) {
        let sequences: Vec<u32> = sequences.into_iter().collect();
        for chunk in sequences.chunks(MAX_RANGE_LEN as usize) {
            match kind {
                AckKind::Ack => self.stats.acks_sent += 1,
                AckKind::Nack => self.stats.nacks_sent += 1,
            }
            let record = Acknowledgement::new(kind, chunk.iter().copied());
            self.push_outgoing(record.encode());
        }
    }

    /// ACK 없이 오래된 데이터그램 재전송
    ///
    /// 신뢰성 프레임이 없는 데이터그램은 재전송 없이 백업에서 제거
    fn resend_expired(&mut self, now: Instant) {
        let timeout = self.config.resend_timeout;
        let mut expired = Vec::new();
        let mut retired = Vec::new();

        for (&seq, sent) in &self.output_backup {
            if now.saturating_duration_since(sent.sent_at) < timeout {
                continue;
            }
            if sent
                .frame_set
                .frames
                .iter()
                .any(|frame| frame.reliability.is_reliable())
            {
                expired.push(seq);
            } else {
                retired.push(seq);
            }
        }

        for seq in retired {
            self.output_backup.remove(&seq);
        }
        for seq in expired {
            self.resend(seq, now);
        }
    }

    fn expire_fragments(&mut self, now: Instant) {
        let timeout = self.config.fragment_timeout;
        let before = self.fragments.len();
        self.fragments
            .retain(|_, bucket| now.saturating_duration_since(bucket.created_at) < timeout);

        let expired = before - self.fragments.len();
        if expired > 0 {
            self.stats.fragments_expired += expired as u64;
            debug!("미완성 프래그먼트 {}개 만료 ({})", expired, self.addr);
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // 종료
    // ─────────────────────────────────────────────────────────────────

    /// 세션 종료 (종료 알림 즉시 전송 후 Disconnected)
    ///
    /// 레지스트리 제거와 SessionClosed 이벤트는 리스너가 담당
    pub fn disconnect(&mut self, reason: &str) {
        if matches!(
            self.state,
            SessionState::Disconnecting | SessionState::Disconnected
        ) {
            return;
        }

        info!("세션 종료: {} ({})", self.addr, reason);
        self.state = SessionState::Disconnecting;
        self.add_frame_to_queue(
            Frame::new(Reliability::Unreliable, message::disconnect_notification()),
            Priority::Immediate,
        );
        self.state = SessionState::Disconnected;
        self.close_reason = Some(reason.to_string());
    }
}
