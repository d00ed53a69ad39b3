//! MFP 서버 (수신자) - Multiplexed Flow Protocol
//!
//! 클라이언트가 멀티 플로우로 보낸 파일을 받아 저장
//! - 연결마다 태스크 하나, 플로우별 통계 출력
//! - 인위적 수신 손실 (--loss) 로 재전송 동작 확인 가능
//!
//! 사용법:
//!   cargo run --release --bin mfp-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 수신
//!   cargo run --release --bin mfp-server -- --bind 0.0.0.0:9000 --output received.bin
//!
//!   # 10% 손실 + 암호화
//!   cargo run --release --bin mfp-server -- -o received.bin --loss 0.1 --encrypt

use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mfp::transfer::receive_file;
use mfp::{Config, ConnectionHandle};

/// 서버 설정
struct ServerConfig {
    bind_addr: SocketAddr,
    output_path: PathBuf,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            output_path: PathBuf::from("received.bin"),
            config: Config::default(),
        }
    }
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--loss" | "-l" => {
                if i + 1 < args.len() {
                    config.config.simulated_loss_rate =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--encrypt" | "-e" => {
                config.config.encryption_enabled = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"MFP Server - Multiplexed Flow Protocol 서버

멀티 플로우 파일 전송 수신자
- 연결마다 파일 하나 수신 후 저장
- X25519 키 교환 + ChaCha20-Poly1305 암호화 지원

사용법:
  cargo run --release --bin mfp-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:9000)
  -o, --output <PATH>     저장 경로 (기본: received.bin, 연결이 여러 개면 뒤에 번호)
  -l, --loss <RATIO>      인위적 수신 손실 비율 0.0~1.0 (기본: 0)
  -e, --encrypt           암호화 허용 (클라이언트도 요청해야 활성화)
  -h, --help              이 도움말 출력

예시:
  # 10% 손실 환경에서 수신
  cargo run --release --bin mfp-server -- -o data.bin --loss 0.1
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

async fn handle_connection(
    conn: ConnectionHandle,
    output_path: PathBuf,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (data, report) = receive_file(&conn).await?;
    tokio::fs::write(&output_path, &data).await?;
    info!("Saved {} bytes to {:?}", data.len(), output_path);

    for line in report.summary().lines() {
        info!("  {}", line);
    }

    // 클라이언트가 close 를 시작하므로 여기서는 통계만 남김
    let stats = conn.stats().await?;
    info!("Connection {:016x}: {}", conn.connection_id(), stats.summary());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server_config = parse_args();
    server_config.config.validate()?;

    info!("MFP Server starting...");
    info!("Bind address: {}", server_config.bind_addr);
    info!("MTU payload: {} bytes", server_config.config.mtu_payload_size);
    info!(
        "Simulated loss: {:.1}%",
        server_config.config.simulated_loss_rate * 100.0
    );
    info!("Encryption: {}", server_config.config.encryption_enabled);

    let mut listener = mfp::listen(server_config.bind_addr, server_config.config.clone()).await?;
    info!("Server listening on {}", listener.local_addr()?);

    let mut accepted = 0usize;
    loop {
        let conn = listener.accept().await?;
        info!("Client connected: {} (id={:016x})", conn.peer(), conn.connection_id());

        let output_path = if accepted == 0 {
            server_config.output_path.clone()
        } else {
            let mut name = server_config.output_path.clone().into_os_string();
            name.push(format!(".{}", accepted));
            PathBuf::from(name)
        };
        accepted += 1;

        tokio::spawn(async move {
            let peer = conn.peer();
            if let Err(e) = handle_connection(conn, output_path).await {
                error!("Transfer from {} failed: {}", peer, e);
            }
        });
    }
}
