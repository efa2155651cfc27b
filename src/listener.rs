//! 리스너 (UDP 소켓 + 세션 레지스트리)
//!
//! 단일 태스크가 소켓 수신, 틱, 외부 명령을 `select!`로 처리함.
//! 세션 상태는 이 태스크만 소유하고, 외부에서는 `ListenerHandle`로 명령을 보냄
//!
//! ```text
//!            ┌──────────── Listener task ────────────┐
//! socket ──▶ │ offline? ─▶ UnconnectedHandler        │
//!            │ else     ─▶ sessions[addr].handle()   │ ──▶ socket
//! tick   ──▶ │ sessions.update() / 끊긴 세션 제거      │
//! handle ──▶ │ Send / Kick / Sessions / Shutdown     │
//!            └──────────────────┬────────────────────┘
//!                               ▼
//!                         ListenerEvent
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::datagram;
use crate::frame::Frame;
use crate::offline::{OfflineAction, UnconnectedHandler};
use crate::reliability::Reliability;
use crate::session::{Priority, Session};
use crate::stats::ListenerStats;
use crate::{server_guid, Config, Error, Result, MAX_CHANNELS};

/// 수신 버퍼 크기 (UDP 최대 페이로드)
const RECV_BUFFER_SIZE: usize = 65535;

/// 명령 채널 크기
const COMMAND_QUEUE_SIZE: usize = 1024;

/// 리스너 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// 핸드셰이크 완료
    SessionOpened { addr: SocketAddr },
    /// 세션 제거
    SessionClosed { addr: SocketAddr, reason: String },
    /// 애플리케이션 페이로드
    Encapsulated { addr: SocketAddr, payload: Bytes },
}

pub type EventSender = mpsc::UnboundedSender<ListenerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ListenerEvent>;

/// 리스너 명령
enum ListenerCmd {
    Send {
        addr: SocketAddr,
        frame: Frame,
        priority: Priority,
        reply: oneshot::Sender<Result<()>>,
    },
    Kick {
        addr: SocketAddr,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Sessions(oneshot::Sender<Vec<SocketAddr>>),
    Shutdown(oneshot::Sender<()>),
}

/// 리스너 (세션 소유 태스크)
pub struct Listener {
    socket: UdpSocket,
    local_addr: SocketAddr,
    config: Arc<Config>,
    guid: u64,
    sessions: HashMap<SocketAddr, Session>,
    offline: UnconnectedHandler,
    events: EventSender,
    cmd_rx: mpsc::Receiver<ListenerCmd>,
    stats: Arc<RwLock<ListenerStats>>,
}

impl Listener {
    /// 소켓 바인드
    ///
    /// 반환된 `Listener`는 `run()`으로 구동해야 함
    pub async fn bind(config: Config) -> Result<(Self, ListenerHandle, EventReceiver)> {
        config.validate()?;
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let config = Arc::new(config);
        let guid = server_guid();

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (events, events_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(RwLock::new(ListenerStats::new()));

        info!("rakline listener bound on {} (guid={})", local_addr, guid);

        let listener = Self {
            socket,
            local_addr,
            offline: UnconnectedHandler::new(config.clone(), guid),
            config,
            guid,
            sessions: HashMap::new(),
            events,
            cmd_rx,
            stats: stats.clone(),
        };

        let handle = ListenerHandle {
            cmd_tx,
            stats,
            local_addr,
            guid,
        };

        Ok((listener, handle, events_rx))
    }

    /// 메인 루프 (Shutdown 명령 또는 모든 핸들이 드롭될 때까지)
    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => {
                            self.handle_datagram(Bytes::copy_from_slice(&buf[..len]), addr).await;
                        }
                        Err(e) => {
                            // ICMP port unreachable 등. 소켓은 계속 사용 가능
                            warn!("수신 에러: {}", e);
                        }
                    }
                }
                _ = tick.tick() => {
                    self.tick().await;
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => {
                            self.shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!("rakline listener stopped: {}", self.stats.read().summary());
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }

    /// 세션 등록 (Connecting 상태)
    pub fn add_session(&mut self, addr: SocketAddr, mtu: u16) {
        let session = Session::new(addr, mtu, self.config.clone(), self.events.clone());
        self.sessions.insert(addr, session);

        let mut stats = self.stats.write();
        stats.sessions_opened += 1;
        stats.active_sessions = self.sessions.len();
        debug!("세션 등록: {} (mtu={})", addr, mtu);
    }

    /// 세션 제거 (SessionClosed 발생)
    ///
    /// 아직 연결 중이면 종료 알림을 먼저 보냄
    pub async fn remove_session(&mut self, addr: SocketAddr, reason: &str) -> bool {
        let Some(mut session) = self.sessions.remove(&addr) else {
            return false;
        };

        session.disconnect(reason);
        let pending: Vec<Bytes> = session.drain_outgoing().collect();
        for datagram in pending {
            self.send_raw(addr, &datagram).await;
        }

        let reason = session.close_reason().unwrap_or(reason).to_string();
        debug!("세션 제거: {} ({}) | {}", addr, reason, session.stats().summary());

        {
            let mut stats = self.stats.write();
            stats.sessions_closed += 1;
            stats.active_sessions = self.sessions.len();
        }

        let _ = self
            .events
            .send(ListenerEvent::SessionClosed { addr, reason });
        true
    }

    /// 등록된 세션 주소 목록
    pub fn sessions(&self) -> Vec<SocketAddr> {
        self.sessions.keys().copied().collect()
    }

    pub fn session(&self, addr: &SocketAddr) -> Option<&Session> {
        self.sessions.get(addr)
    }

    /// 소켓으로 바로 전송 (실패 시 로그만)
    pub async fn send_raw(&self, addr: SocketAddr, bytes: &[u8]) {
        match self.socket.send_to(bytes, addr).await {
            Ok(len) => self.stats.write().record_sent(len),
            Err(e) => {
                warn!("송신 에러 ({}): {}", addr, e);
                self.stats.write().send_errors += 1;
            }
        }
    }

    async fn handle_datagram(&mut self, bytes: Bytes, addr: SocketAddr) {
        self.stats.write().record_received(bytes.len());

        let Some(&header) = bytes.first() else {
            return;
        };

        if !datagram::is_connected(header) {
            self.handle_offline(bytes, addr).await;
            return;
        }

        match self.sessions.get_mut(&addr) {
            Some(session) => session.handle(bytes, Instant::now()),
            None => {
                trace!("세션 없는 연결 데이터그램: {}", addr);
                self.stats.write().dropped_datagrams += 1;
                return;
            }
        }

        self.flush_session(addr).await;
    }

    async fn handle_offline(&mut self, bytes: Bytes, addr: SocketAddr) {
        self.stats.write().offline_messages += 1;

        // 같은 주소의 재요청은 한도 계산에서 제외
        let existing = self.sessions.contains_key(&addr);
        let session_count = self.sessions.len() - usize::from(existing);

        match self.offline.handle(bytes, addr, session_count) {
            Ok(OfflineAction::Reply(reply)) => self.send_raw(addr, &reply).await,
            Ok(OfflineAction::Open { reply, mtu }) => {
                if !existing {
                    self.add_session(addr, mtu);
                }
                self.send_raw(addr, &reply).await;
            }
            Ok(OfflineAction::Ignore) => {}
            Err(e) => {
                debug!("잘못된 오프라인 메시지 ({}): {}", addr, e);
                self.stats.write().dropped_datagrams += 1;
            }
        }
    }

    /// 세션 송신 큐를 소켓으로 비우고, 끊긴 세션은 제거
    async fn flush_session(&mut self, addr: SocketAddr) {
        let (pending, disconnected): (Vec<Bytes>, bool) = match self.sessions.get_mut(&addr) {
            Some(session) => (session.drain_outgoing().collect(), session.is_disconnected()),
            None => return,
        };

        for datagram in pending {
            self.send_raw(addr, &datagram).await;
        }

        if disconnected {
            self.remove_session(addr, "disconnected").await;
        }
    }

    async fn tick(&mut self) {
        let now = Instant::now();
        let addrs: Vec<SocketAddr> = self.sessions.keys().copied().collect();

        for addr in addrs {
            if let Some(session) = self.sessions.get_mut(&addr) {
                session.update(now);
            }
            self.flush_session(addr).await;
        }
    }

    /// 명령 처리. Shutdown이면 false (루프 종료)
    async fn handle_command(&mut self, cmd: ListenerCmd) -> bool {
        match cmd {
            ListenerCmd::Send {
                addr,
                frame,
                priority,
                reply,
            } => {
                let result = match self.sessions.get_mut(&addr) {
                    Some(session) => {
                        session.send_frame(frame, priority);
                        Ok(())
                    }
                    None => Err(Error::SessionNotFound(addr)),
                };
                if result.is_ok() {
                    self.flush_session(addr).await;
                }
                let _ = reply.send(result);
            }
            ListenerCmd::Kick {
                addr,
                reason,
                reply,
            } => {
                let result = if self.remove_session(addr, &reason).await {
                    Ok(())
                } else {
                    Err(Error::SessionNotFound(addr))
                };
                let _ = reply.send(result);
            }
            ListenerCmd::Sessions(reply) => {
                let _ = reply.send(self.sessions());
            }
            ListenerCmd::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    /// 모든 세션의 대기 프레임 플러시
    async fn shutdown(&mut self) {
        info!("리스너 종료: 세션 {}개 플러시", self.sessions.len());

        let mut pending = Vec::new();
        for (addr, session) in self.sessions.iter_mut() {
            session.send_frame_queue();
            pending.extend(session.drain_outgoing().map(|datagram| (*addr, datagram)));
        }
        for (addr, datagram) in pending {
            self.send_raw(addr, &datagram).await;
        }
    }
}

/// 리스너 제어 핸들 (복제 가능)
#[derive(Clone)]
pub struct ListenerHandle {
    cmd_tx: mpsc::Sender<ListenerCmd>,
    stats: Arc<RwLock<ListenerStats>>,
    local_addr: SocketAddr,
    guid: u64,
}

impl ListenerHandle {
    /// 세션으로 페이로드 전송
    ///
    /// 채널은 순서/시퀀스 신뢰성에서만 의미가 있음
    pub async fn send(
        &self,
        addr: SocketAddr,
        payload: impl Into<Bytes>,
        reliability: Reliability,
        channel: u8,
        priority: Priority,
    ) -> Result<()> {
        if channel as usize >= MAX_CHANNELS {
            return Err(Error::ChannelOutOfRange(channel));
        }

        let frame = Frame::new(reliability, payload).with_channel(channel);
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ListenerCmd::Send {
                addr,
                frame,
                priority,
                reply,
            })
            .await
            .map_err(|_| Error::ChannelError)?;
        rx.await.map_err(|_| Error::ChannelError)?
    }

    /// 세션 강제 종료
    pub async fn kick(&self, addr: SocketAddr, reason: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ListenerCmd::Kick {
                addr,
                reason: reason.to_string(),
                reply,
            })
            .await
            .map_err(|_| Error::ChannelError)?;
        rx.await.map_err(|_| Error::ChannelError)?
    }

    pub async fn sessions(&self) -> Result<Vec<SocketAddr>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ListenerCmd::Sessions(reply))
            .await
            .map_err(|_| Error::ChannelError)?;
        rx.await.map_err(|_| Error::ChannelError)
    }

    /// 통계 스냅샷
    pub fn stats(&self) -> ListenerStats {
        self.stats.read().clone()
    }

    /// 리스너 종료 (대기 프레임 플러시 후 반환)
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ListenerCmd::Shutdown(reply))
            .await
            .map_err(|_| Error::ChannelError)?;
        rx.await.map_err(|_| Error::ChannelError)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::datagram::{Datagram, FrameSet};
    use crate::message::{
        ConnectionRequest, ConnectionRequestAccepted, MessageId, NewIncomingConnection,
    };
    use crate::offline::{
        OpenConnectionReply1, OpenConnectionReply2, OpenConnectionRequest1,
        OpenConnectionRequest2, UnconnectedPing, UnconnectedPong,
    };
    use crate::{DEFAULT_MAX_MTU, PROTOCOL_VERSION};

    const WAIT: Duration = Duration::from_secs(3);

    async fn start(
        config: Config,
    ) -> (ListenerHandle, EventReceiver, tokio::task::JoinHandle<Result<()>>) {
        let config = Config {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..config
        };
        let (listener, handle, events) = Listener::bind(config).await.unwrap();
        let task = tokio::spawn(listener.run());
        (handle, events, task)
    }

    async fn client() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn recv(socket: &UdpSocket) -> Bytes {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let (len, _) = tokio::time::timeout(WAIT, socket.recv_from(&mut buf))
            .await
            .expect("recv timed out")
            .unwrap();
        Bytes::copy_from_slice(&buf[..len])
    }

    /// 첫 바이트가 `id`인 프레임이 올 때까지 수신 (ACK/NACK, 재전송은 건너뜀)
    async fn recv_message(socket: &UdpSocket, id: u8) -> Frame {
        loop {
            if let Ok(Datagram::FrameSet(set)) = Datagram::decode(recv(socket).await) {
                if let Some(frame) = set.frames.into_iter().find(|f| f.content.first() == Some(&id)) {
                    return frame;
                }
            }
        }
    }

    async fn next_event(events: &mut EventReceiver) -> ListenerEvent {
        tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("event timed out")
            .expect("event channel closed")
    }

    async fn send_frame(socket: &UdpSocket, server: SocketAddr, seq: u32, frame: Frame) {
        let set = FrameSet {
            sequence_number: seq,
            frames: vec![frame],
        };
        socket.send_to(&set.encode(), server).await.unwrap();
    }

    /// 오프라인 핸드셰이크로 세션 생성
    async fn open_session(socket: &UdpSocket, server: SocketAddr) -> u16 {
        let request1 = OpenConnectionRequest1 {
            protocol: PROTOCOL_VERSION,
            mtu: 1400,
        };
        socket.send_to(&request1.to_bytes(), server).await.unwrap();
        let reply1 = OpenConnectionReply1::from_bytes(recv(socket).await).unwrap();
        assert_eq!(reply1.mtu, 1400);

        let request2 = OpenConnectionRequest2 {
            server_address: server,
            mtu: reply1.mtu,
            client_guid: 42,
        };
        socket.send_to(&request2.to_bytes(), server).await.unwrap();
        let reply2 = OpenConnectionReply2::from_bytes(recv(socket).await).unwrap();
        assert_eq!(reply2.client_address, socket.local_addr().unwrap());
        reply2.mtu
    }

    #[tokio::test]
    async fn test_unconnected_ping_pong() {
        let (handle, _events, task) = start(Config::default()).await;
        let socket = client().await;

        let ping = UnconnectedPing {
            timestamp: 1234,
            client_guid: 42,
        };
        socket.send_to(&ping.to_bytes(), handle.local_addr()).await.unwrap();

        let pong = UnconnectedPong::from_bytes(recv(&socket).await).unwrap();
        assert_eq!(pong.timestamp, 1234);
        assert_eq!(pong.server_guid, handle.guid());
        assert_eq!(pong.advertisement, "rakline");
        assert_eq!(handle.stats().offline_messages, 1);

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_full_handshake_and_payload_exchange() {
        let (handle, mut events, task) = start(Config::default()).await;
        let server = handle.local_addr();
        let socket = client().await;
        let client_addr = socket.local_addr().unwrap();

        let mtu = open_session(&socket, server).await;
        assert!(mtu <= DEFAULT_MAX_MTU);
        assert_eq!(handle.sessions().await.unwrap(), vec![client_addr]);

        // ConnectionRequest → 즉시 ConnectionRequestAccepted
        let request = ConnectionRequest {
            client_guid: 42,
            request_timestamp: 777,
            secure: false,
        };
        let mut frame = Frame::new(Reliability::ReliableOrdered, request.to_bytes());
        send_frame(&socket, server, 0, frame.clone()).await;

        let reply = recv_message(&socket, MessageId::ConnectionRequestAccepted as u8).await;
        let accepted = ConnectionRequestAccepted::from_bytes(reply.content).unwrap();
        assert_eq!(accepted.client_address, client_addr);
        assert_eq!(accepted.request_timestamp, 777);

        let incoming = NewIncomingConnection::new(server, 777, accepted.accepted_timestamp);
        frame.reliable_index = 1;
        frame.order_index = 1;
        frame.content = incoming.to_bytes();
        send_frame(&socket, server, 1, frame.clone()).await;
        assert_eq!(
            next_event(&mut events).await,
            ListenerEvent::SessionOpened { addr: client_addr }
        );

        // 애플리케이션 페이로드 → Encapsulated
        frame.reliable_index = 2;
        frame.order_index = 2;
        frame.content = Bytes::from_static(b"\xfehello");
        send_frame(&socket, server, 2, frame).await;
        assert_eq!(
            next_event(&mut events).await,
            ListenerEvent::Encapsulated {
                addr: client_addr,
                payload: Bytes::from_static(b"\xfehello"),
            }
        );

        // 서버 → 클라이언트
        handle
            .send(
                client_addr,
                &b"\xfeworld"[..],
                Reliability::ReliableOrdered,
                0,
                Priority::Immediate,
            )
            .await
            .unwrap();
        let reply = recv_message(&socket, 0xfe).await;
        assert_eq!(reply.content.as_ref(), b"\xfeworld");

        // Kick → 종료 알림 + SessionClosed
        handle.kick(client_addr, "kicked").await.unwrap();
        let notice = recv_message(&socket, MessageId::DisconnectNotification as u8).await;
        assert_eq!(notice.content.len(), 1);
        assert_eq!(
            next_event(&mut events).await,
            ListenerEvent::SessionClosed {
                addr: client_addr,
                reason: "kicked".to_string(),
            }
        );
        assert!(handle.sessions().await.unwrap().is_empty());

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_idle_session_times_out() {
        let config = Config {
            session_timeout: Duration::from_millis(100),
            ..Config::default()
        };
        let (handle, mut events, task) = start(config).await;
        let socket = client().await;
        let client_addr = socket.local_addr().unwrap();

        open_session(&socket, handle.local_addr()).await;
        assert_eq!(
            next_event(&mut events).await,
            ListenerEvent::SessionClosed {
                addr: client_addr,
                reason: "timeout".to_string(),
            }
        );
        assert!(handle.sessions().await.unwrap().is_empty());
        assert_eq!(handle.stats().sessions_closed, 1);

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_session_datagram_dropped() {
        let (handle, _events, task) = start(Config::default()).await;
        let socket = client().await;

        send_frame(
            &socket,
            handle.local_addr(),
            0,
            Frame::new(Reliability::Reliable, &b"\xfeorphan"[..]),
        )
        .await;

        tokio::time::timeout(WAIT, async {
            while handle.stats().dropped_datagrams == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(handle.sessions().await.unwrap().is_empty());

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handle_errors() {
        let (handle, _events, task) = start(Config::default()).await;
        let nobody: SocketAddr = "127.0.0.1:9".parse().unwrap();

        assert!(matches!(
            handle
                .send(nobody, &b"x"[..], Reliability::Reliable, 0, Priority::Normal)
                .await,
            Err(Error::SessionNotFound(_))
        ));
        assert!(matches!(
            handle
                .send(nobody, &b"x"[..], Reliability::ReliableOrdered, 32, Priority::Normal)
                .await,
            Err(Error::ChannelOutOfRange(32))
        ));
        assert!(matches!(
            handle.kick(nobody, "nope").await,
            Err(Error::SessionNotFound(_))
        ));

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
        assert!(matches!(handle.sessions().await, Err(Error::ChannelError)));
    }

    #[tokio::test]
    async fn test_bind_rejects_inverted_mtu_range() {
        let config = Config {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_mtu: 500,
            ..Config::default()
        };
        assert!(matches!(
            Listener::bind(config).await,
            Err(Error::InvalidConfig(_))
        ));
    }
}
