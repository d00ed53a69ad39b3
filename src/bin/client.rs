//! MFP 클라이언트 (송신자) - Multiplexed Flow Protocol
//!
//! 파일을 블록 단위로 나눠 여러 플로우(스트림)로 동시에 전송
//! - 플로우 i 는 블록 i, i+k, i+2k, ... 를 담당
//! - X25519 + ChaCha20-Poly1305 암호화 지원 (선택)
//!
//! 사용법:
//!   cargo run --release --bin mfp-client -- [OPTIONS]
//!
//! 예시:
//!   # 기본 전송 (3 플로우)
//!   cargo run --release --bin mfp-client -- --server 127.0.0.1:9000 --file data.bin
//!
//!   # 8 플로우, 256KB 블록, 암호화
//!   cargo run --release --bin mfp-client -- -s 127.0.0.1:9000 -f data.bin --flows 8 --block-size 262144 -e

use std::net::SocketAddr;
use std::path::PathBuf;

use bytes::Bytes;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mfp::transfer::{send_file, DEFAULT_BLOCK_SIZE, DEFAULT_FLOWS};
use mfp::Config;

/// 클라이언트 설정
struct ClientConfig {
    server_addr: SocketAddr,
    file_path: Option<PathBuf>,
    flows: usize,
    block_size: usize,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            file_path: None,
            flows: DEFAULT_FLOWS,
            block_size: DEFAULT_BLOCK_SIZE,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    config.server_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    config.file_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--flows" | "-n" => {
                if i + 1 < args.len() {
                    config.flows = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--block-size" => {
                if i + 1 < args.len() {
                    config.block_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--encrypt" | "-e" => {
                config.config.encryption_enabled = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"MFP Client - Multiplexed Flow Protocol 클라이언트

멀티 플로우 파일 전송 송신자
- 파일을 블록으로 나눠 여러 스트림으로 인터리브 전송
- X25519 키 교환 + ChaCha20-Poly1305 암호화 지원

사용법:
  cargo run --release --bin mfp-client -- [OPTIONS]

옵션:
  -s, --server <ADDR>     서버 주소 (기본: 127.0.0.1:9000)
  -f, --file <PATH>       전송할 파일 경로 (없으면 1MB 테스트 데이터)
  -n, --flows <N>         플로우 수 (기본: 3)
  --block-size <SIZE>     블록 크기 바이트 (기본: 65536)
  -e, --encrypt           암호화 요청
  -h, --help              이 도움말 출력

예시:
  # 파일 전송
  cargo run --release --bin mfp-client -- --file large_file.bin

  # 암호화 + 플로우 8개
  cargo run --release --bin mfp-client -- -f data.bin --flows 8 -e
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client_config = parse_args();

    info!("MFP Client starting...");
    info!("Server address: {}", client_config.server_addr);
    info!("Flows: {}", client_config.flows);
    info!("Block size: {} bytes", client_config.block_size);

    // 전송할 데이터 준비
    let data = if let Some(path) = &client_config.file_path {
        info!("Loading file: {:?}", path);
        tokio::fs::read(path).await?
    } else {
        // 테스트용 더미 데이터 (1MB)
        info!("Using test data (1MB)");
        (0..1024 * 1024).map(|i| (i % 251) as u8).collect()
    };
    info!("Data size: {} bytes", data.len());

    let conn = mfp::connect(client_config.server_addr, client_config.config.clone()).await?;
    info!("Connected (id={:016x})", conn.connection_id());

    let report = send_file(
        &conn,
        Bytes::from(data),
        client_config.flows,
        client_config.block_size,
    )
    .await?;

    // 모든 데이터가 확인될 때까지 대기
    conn.close().await?;
    info!("Transfer complete!");

    for line in report.summary().lines() {
        info!("  {}", line);
    }
    let stats = conn.stats().await?;
    info!("Connection: {}", stats.summary());
    info!("Retransmit ratio: {:.2}%", stats.retransmit_ratio() * 100.0);
    Ok(())
}
