//! rakline 에코 서버
//!
//! 세션을 받아 애플리케이션 페이로드를 그대로 돌려보내는 예제 서버
//!
//! 사용법:
//!   cargo run --release --bin rakline-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 포트 (19132)
//!   cargo run --release --bin rakline-server
//!
//!   # 불안정 네트워크 프리셋 + 세션 200개 제한
//!   cargo run --release --bin rakline-server -- --preset unstable --max-sessions 200

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rakline::{Config, Listener, ListenerEvent, Priority, Reliability};

/// 통계 출력 간격
const STATS_INTERVAL: Duration = Duration::from_secs(30);

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, what: &str) -> T {
    match args.get(i + 1).and_then(|v| v.parse().ok()) {
        Some(value) => value,
        None => {
            eprintln!("{} 값이 필요합니다", what);
            std::process::exit(2);
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    // 프리셋을 먼저 적용하고 나머지 옵션으로 덮어씀
    if let Some(pos) = args.iter().position(|a| a == "--preset") {
        match args.get(pos + 1).map(String::as_str) {
            Some("lan") => config = Config::lan(),
            Some("unstable") => config = Config::unstable_network(),
            Some("default") => {}
            other => {
                eprintln!("알 수 없는 프리셋: {:?} (lan | unstable | default)", other);
                std::process::exit(2);
            }
        }
    }

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                config.bind_addr = parse_value::<SocketAddr>(&args, i, "--bind");
                i += 1;
            }
            "--max-sessions" => {
                config.max_sessions = parse_value(&args, i, "--max-sessions");
                i += 1;
            }
            "--max-mtu" => {
                config.max_mtu = parse_value(&args, i, "--max-mtu");
                i += 1;
            }
            "--timeout" => {
                config.session_timeout =
                    Duration::from_secs(parse_value(&args, i, "--timeout"));
                i += 1;
            }
            "--motd" => {
                config.advertisement = parse_value(&args, i, "--motd");
                i += 1;
            }
            "--preset" => i += 1,
            "--help" | "-h" => {
                println!(
                    r#"rakline server - 신뢰성 UDP 에코 서버

사용법:
  cargo run --release --bin rakline-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>        바인드 주소 (기본: 0.0.0.0:19132)
  --preset <NAME>          설정 프리셋: lan | unstable | default
  --max-sessions <N>       최대 세션 수 (기본: 1024)
  --max-mtu <BYTES>        협상 최대 MTU (기본: 1492, 576..=8192)
  --timeout <SECS>         비활성 세션 타임아웃 (기본: 10)
  --motd <TEXT>            오프라인 퐁 광고 문자열
  -h, --help               이 도움말 출력

로그 레벨은 RUST_LOG 로 지정 (예: RUST_LOG=rakline=debug)
"#
                );
                std::process::exit(0);
            }
            other => warn!("알 수 없는 옵션 무시: {}", other),
        }
        i += 1;
    }

    if let Err(e) = config.validate() {
        eprintln!("{}", e);
        std::process::exit(2);
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = parse_args();

    info!("rakline server starting...");
    info!("Bind address: {}", config.bind_addr);
    info!("MTU range: {}..={}", config.min_mtu, config.max_mtu);
    info!("Max sessions: {}", config.max_sessions);
    info!("Tick interval: {:?}", config.tick_interval);

    let (listener, handle, mut events) = Listener::bind(config).await?;
    let listener_task = tokio::spawn(listener.run());

    info!("Server listening on {} (guid={})", handle.local_addr(), handle.guid());

    let mut stats_timer = tokio::time::interval(STATS_INTERVAL);
    stats_timer.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ListenerEvent::SessionOpened { addr } => {
                        info!("Client connected: {}", addr);
                    }
                    ListenerEvent::SessionClosed { addr, reason } => {
                        info!("Client disconnected: {} ({})", addr, reason);
                    }
                    ListenerEvent::Encapsulated { addr, payload } => {
                        // 에코
                        if let Err(e) = handle
                            .send(addr, payload, Reliability::ReliableOrdered, 0, Priority::Normal)
                            .await
                        {
                            warn!("Echo failed ({}): {}", addr, e);
                        }
                    }
                }
            }
            _ = stats_timer.tick() => {
                info!("{}", handle.stats().summary());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                handle.shutdown().await?;
                break;
            }
        }
    }

    listener_task.await??;
    info!("Final: {}", handle.stats().summary());
    Ok(())
}
