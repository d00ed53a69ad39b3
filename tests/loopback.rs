//! 실제 UDP 소켓(127.0.0.1)을 사용하는 통합 테스트

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use mfp::transfer::{receive_file, send_file};
use mfp::{Config, Error};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[tokio::test]
async fn test_bidirectional_echo() {
    let mut listener = mfp::listen(any_port(), Config::default()).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        let mut stream = conn.accept_stream().await.unwrap();
        let request = stream.read_to_end().await.unwrap();
        let mut reply = b"echo: ".to_vec();
        reply.extend_from_slice(&request);
        stream.write_all(&reply).await.unwrap();
        stream.finish().await.unwrap();
        // 클라이언트가 close 할 때까지 연결 유지
        let _ = conn.accept_stream().await;
    });

    let conn = mfp::connect(addr, Config::default()).await.unwrap();
    let mut stream = conn.open_stream().await.unwrap();
    stream.write_all(b"hello mfp").await.unwrap();
    stream.finish().await.unwrap();

    let reply = timeout(TEST_TIMEOUT, stream.read_to_end()).await.unwrap().unwrap();
    assert_eq!(reply, b"echo: hello mfp");

    conn.close().await.unwrap();
    timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_file_transfer_with_loss_and_encryption() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("source.bin");
    let output_path = dir.path().join("received.bin");
    let data = test_data(512 * 1024);
    tokio::fs::write(&source_path, &data).await.unwrap();

    let server_config = Config {
        simulated_loss_rate: 0.1,
        encryption_enabled: true,
        ..Config::default()
    };
    let mut listener = mfp::listen(any_port(), server_config).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_output = output_path.clone();
    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        let (received, report) = receive_file(&conn).await.unwrap();
        tokio::fs::write(&server_output, &received).await.unwrap();
        let stats = conn.stats().await.unwrap();
        (report, stats, listener.dispatch_stats())
    });

    let client_config = Config {
        encryption_enabled: true,
        ..Config::default()
    };
    let conn = mfp::connect(addr, client_config).await.unwrap();
    let file = tokio::fs::read(&source_path).await.unwrap();
    let sent = timeout(TEST_TIMEOUT, send_file(&conn, Bytes::from(file), 3, 32 * 1024))
        .await
        .unwrap()
        .unwrap();
    timeout(TEST_TIMEOUT, conn.close()).await.unwrap().unwrap();

    let (report, server_stats, dispatch) = timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
    let received = tokio::fs::read(&output_path).await.unwrap();
    assert_eq!(received, data);
    assert_eq!(report.flows.len(), 3);
    assert_eq!(sent.total_bytes(), data.len() as u64);
    assert!(dispatch.simulated_drops > 0);
    assert!(server_stats.dropped_datagrams > 0);

    let client_stats = conn.stats().await.unwrap();
    assert!(client_stats.retransmits + client_stats.fast_retransmits > 0);
}

#[tokio::test]
async fn test_handshake_timeout_without_server() {
    // 아무도 듣지 않는 포트
    let silent = tokio::net::UdpSocket::bind(any_port()).await.unwrap();
    let addr = silent.local_addr().unwrap();

    let config = Config {
        handshake_retry_limit: 2,
        handshake_retry_interval: Duration::from_millis(50),
        ..Config::default()
    };
    let result = timeout(TEST_TIMEOUT, mfp::connect(addr, config)).await.unwrap();
    assert!(matches!(result, Err(Error::HandshakeTimeout)));
}

#[tokio::test]
async fn test_concurrent_connections_on_one_listener() {
    let mut listener = mfp::listen(any_port(), Config::default()).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut results = Vec::new();
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let conn = listener.accept().await.unwrap();
            tasks.push(tokio::spawn(async move {
                let mut stream = conn.accept_stream().await.unwrap();
                stream.read_to_end().await.unwrap()
            }));
        }
        for task in tasks {
            results.push(task.await.unwrap());
        }
        results.sort();
        results
    });

    let mut clients = Vec::new();
    for i in 0..4u8 {
        clients.push(tokio::spawn(async move {
            let conn = mfp::connect(addr, Config::default()).await.unwrap();
            let mut stream = conn.open_uni_stream().await.unwrap();
            stream.write_all(&vec![i; 10_000]).await.unwrap();
            stream.finish().await.unwrap();
            conn.close().await.unwrap();
            conn.connection_id()
        }));
    }

    let mut ids = Vec::new();
    for client in clients {
        ids.push(timeout(TEST_TIMEOUT, client).await.unwrap().unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);

    let results = timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
    for (i, data) in results.iter().enumerate() {
        assert_eq!(data, &vec![i as u8; 10_000]);
    }
}

#[tokio::test]
async fn test_writes_fail_after_close() {
    let mut listener = mfp::listen(any_port(), Config::default()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        // close 시 FIN 만 담긴 스트림이 먼저 도착할 수 있음
        loop {
            if let Err(e) = conn.accept_stream().await {
                return e;
            }
        }
    });

    let conn = mfp::connect(addr, Config::default()).await.unwrap();
    let mut stream = conn.open_uni_stream().await.unwrap();
    conn.close().await.unwrap();

    assert!(matches!(
        stream.write(b"late").await,
        Err(Error::ConnectionClosed)
    ));
    let error = timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
    assert!(matches!(error, Error::ConnectionClosed));
}
