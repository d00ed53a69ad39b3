//! 멀티 플로우 파일 전송
//!
//! 파일을 `block_size` 블록으로 나누고 k 개의 단방향 스트림(플로우)에 인터리브 배치.
//! 플로우 i 는 블록 i, i+k, i+2k, ... 를 순서대로 보냄.
//!
//! 스트림 형식: `[header_len:4 BE][TransferHeader (bincode)][blocks...]`

use std::ops::Range;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::endpoint::{ConnectionHandle, StreamHandle};
use crate::stats::{FlowStats, TransferReport};
use crate::{Error, Result};

/// 기본 플로우 수
pub const DEFAULT_FLOWS: usize = 3;

/// 기본 블록 크기
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// 헤더 길이 상한
const MAX_HEADER_LEN: usize = 1024;

/// 수신 측 한도. 상대 헤더 값으로 자원을 잡기 전에 확인
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    /// 받을 수 있는 전체 바이트
    pub max_total_len: u64,
    /// 받을 수 있는 플로우 수
    pub max_flows: u32,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            max_total_len: 4 * 1024 * 1024 * 1024,
            max_flows: 256,
        }
    }
}

impl TransferLimits {
    fn check(&self, header: &TransferHeader) -> Result<()> {
        if header.total_len > self.max_total_len || usize::try_from(header.total_len).is_err() {
            return Err(Error::InvalidTransfer(format!(
                "전체 길이 {} 가 한도 {} 를 넘음",
                header.total_len, self.max_total_len
            )));
        }
        if header.flow_count > self.max_flows {
            return Err(Error::InvalidTransfer(format!(
                "플로우 수 {} 가 한도 {} 를 넘음",
                header.flow_count, self.max_flows
            )));
        }
        Ok(())
    }
}

/// 플로우 스트림 맨 앞의 전송 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
    pub flow_index: u32,
    pub flow_count: u32,
    pub block_size: u32,
    pub total_len: u64,
}

impl TransferHeader {
    /// 길이 접두어 포함 직렬화
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let mut buf = Vec::with_capacity(4 + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn total_blocks(&self) -> u64 {
        if self.block_size == 0 {
            return 0;
        }
        let block_size = u64::from(self.block_size);
        self.total_len / block_size + u64::from(self.total_len % block_size != 0)
    }

    /// 이 플로우가 맡는 블록 수
    pub fn block_count(&self) -> u64 {
        let total = self.total_blocks();
        let (index, count) = (u64::from(self.flow_index), u64::from(self.flow_count));
        if count == 0 || index >= total {
            return 0;
        }
        (total - 1 - index) / count + 1
    }

    /// 이 플로우가 실어야 하는 바이트 수
    pub fn expected_len(&self) -> u64 {
        let blocks = self.block_count();
        if blocks == 0 {
            return 0;
        }
        let block_size = u128::from(self.block_size);
        let mut len = u128::from(blocks) * block_size;
        // 마지막 블록이 이 플로우 몫이면 모자란 만큼 뺌
        let total = self.total_blocks();
        if (total - 1) % u64::from(self.flow_count) == u64::from(self.flow_index) {
            len -= u128::from(total) * block_size - u128::from(self.total_len);
        }
        len as u64
    }

    fn validate(&self) -> Result<()> {
        if self.flow_count == 0 || self.block_size == 0 {
            return Err(Error::InvalidTransfer(format!(
                "flow_count={}, block_size={}",
                self.flow_count, self.block_size
            )));
        }
        if self.flow_index >= self.flow_count {
            return Err(Error::InvalidTransfer(format!(
                "flow_index {} >= flow_count {}",
                self.flow_index, self.flow_count
            )));
        }
        Ok(())
    }
}

/// 플로우 `index` 가 맡는 블록들의 바이트 범위
pub fn flow_blocks(
    total_len: usize,
    block_size: usize,
    index: usize,
    count: usize,
) -> impl Iterator<Item = Range<usize>> {
    let step = block_size.saturating_mul(count);
    let start = index.saturating_mul(block_size);
    let ranges = if block_size == 0 || count == 0 {
        None
    } else {
        Some(
            (start..total_len)
                .step_by(step.max(1))
                .map(move |offset| offset..(offset + block_size).min(total_len)),
        )
    };
    ranges.into_iter().flatten()
}

/// 파일 전송. 플로우마다 단방향 스트림 하나
pub async fn send_file(
    conn: &ConnectionHandle,
    data: Bytes,
    flows: usize,
    block_size: usize,
) -> Result<TransferReport> {
    if flows == 0 || block_size == 0 || block_size > u32::MAX as usize {
        return Err(Error::InvalidTransfer(format!(
            "flows={}, block_size={}",
            flows, block_size
        )));
    }
    let flow_count = u32::try_from(flows)
        .map_err(|_| Error::InvalidTransfer(format!("flows={}", flows)))?;

    let started = Instant::now();
    let mut tasks = Vec::with_capacity(flows);
    for index in 0..flows {
        let stream = conn.open_uni_stream().await?;
        let header = TransferHeader {
            flow_index: index as u32,
            flow_count,
            block_size: block_size as u32,
            total_len: data.len() as u64,
        };
        tasks.push(tokio::spawn(send_flow(stream, header, data.clone())));
    }

    let mut report = TransferReport::default();
    for task in tasks {
        let flow = task.await.map_err(|_| Error::ChannelError)??;
        report.flows.push(flow);
    }
    report.duration = started.elapsed();

    info!(
        "전송 완료: {} bytes, {} 플로우, {:.3}s",
        report.total_bytes(),
        flows,
        report.duration.as_secs_f64()
    );
    Ok(report)
}

async fn send_flow(
    mut stream: StreamHandle,
    header: TransferHeader,
    data: Bytes,
) -> Result<FlowStats> {
    let started = Instant::now();
    let mut stats = FlowStats::new(header.flow_index as usize);

    stream.write_all(&header.to_bytes()?).await?;
    for range in flow_blocks(
        data.len(),
        header.block_size as usize,
        header.flow_index as usize,
        header.flow_count as usize,
    ) {
        stats.bytes += range.len() as u64;
        stats.blocks += 1;
        stream.write_all(&data[range]).await?;
    }
    stream.finish().await?;

    stats.duration = started.elapsed();
    debug!("플로우 {} 송신 완료: {} blocks", stats.flow_id, stats.blocks);
    Ok(stats)
}

/// 파일 수신. 첫 플로우 헤더의 flow_count 만큼 스트림을 받아 재조립
pub async fn receive_file(conn: &ConnectionHandle) -> Result<(Vec<u8>, TransferReport)> {
    receive_file_with_limits(conn, TransferLimits::default()).await
}

/// 한도를 지정한 파일 수신
///
/// 헤더가 한도를 넘으면 `InvalidTransfer`. 출력 버퍼는 모든 플로우 본문이
/// 실제로 도착한 뒤에 할당함
pub async fn receive_file_with_limits(
    conn: &ConnectionHandle,
    limits: TransferLimits,
) -> Result<(Vec<u8>, TransferReport)> {
    let started = Instant::now();

    let mut first = FlowReader::new(conn.accept_stream().await?);
    let header = first.read_header().await?;
    limits.check(&header)?;
    let flow_count = header.flow_count as usize;

    let mut readers = Vec::with_capacity(flow_count);
    readers.push((header, first));
    for _ in 1..flow_count {
        let mut reader = FlowReader::new(conn.accept_stream().await?);
        let other = reader.read_header().await?;
        if other.flow_count != header.flow_count
            || other.block_size != header.block_size
            || other.total_len != header.total_len
        {
            return Err(Error::InvalidTransfer(format!(
                "플로우 헤더 불일치: {:?} vs {:?}",
                other, header
            )));
        }
        if readers.iter().any(|(h, _)| h.flow_index == other.flow_index) {
            return Err(Error::InvalidTransfer(format!(
                "중복 플로우: {}",
                other.flow_index
            )));
        }
        readers.push((other, reader));
    }

    // 모든 플로우 길이의 합이 전체 길이와 일치해야 버퍼를 할당
    let expected: u64 = readers.iter().map(|(h, _)| h.expected_len()).sum();
    if expected != header.total_len {
        return Err(Error::InvalidTransfer(format!(
            "플로우 길이 합 {} != 전체 {}",
            expected, header.total_len
        )));
    }
    let total_len = usize::try_from(header.total_len)
        .map_err(|_| Error::InvalidTransfer(format!("total_len={}", header.total_len)))?;

    let mut tasks = Vec::with_capacity(flow_count);
    for (header, reader) in readers {
        tasks.push(tokio::spawn(receive_flow(reader, header)));
    }

    let mut bodies = Vec::with_capacity(flow_count);
    for task in tasks {
        bodies.push(task.await.map_err(|_| Error::ChannelError)??);
    }

    let mut output = vec![0u8; total_len];
    let mut report = TransferReport::default();
    for (header, body, stats) in bodies {
        let mut body = &body[..];
        for range in flow_blocks(
            total_len,
            header.block_size as usize,
            header.flow_index as usize,
            flow_count,
        ) {
            let len = range.len();
            output[range].copy_from_slice(&body[..len]);
            body = &body[len..];
        }
        report.flows.push(stats);
    }
    report.flows.sort_by_key(|f| f.flow_id);
    report.duration = started.elapsed();

    info!(
        "수신 완료: {} bytes, {} 플로우, {:.3}s",
        total_len,
        flow_count,
        report.duration.as_secs_f64()
    );
    Ok((output, report))
}

async fn receive_flow(
    mut reader: FlowReader,
    header: TransferHeader,
) -> Result<(TransferHeader, Vec<u8>, FlowStats)> {
    let started = Instant::now();
    let body = reader.read_body(header.expected_len()).await.map_err(|e| match e {
        Error::InvalidTransfer(reason) => {
            Error::InvalidTransfer(format!("플로우 {}: {}", header.flow_index, reason))
        }
        other => other,
    })?;

    let mut stats = FlowStats::new(header.flow_index as usize);
    stats.bytes = body.len() as u64;
    stats.blocks = header.block_count();
    stats.duration = started.elapsed();
    Ok((header, body, stats))
}

/// 스트림 읽기 버퍼
struct FlowReader {
    stream: StreamHandle,
    buf: BytesMut,
    finished: bool,
}

impl FlowReader {
    fn new(stream: StreamHandle) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
            finished: false,
        }
    }

    /// 정확히 `n` 바이트. 그 전에 스트림이 끝나면 에러
    async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        while self.buf.len() < n {
            if self.finished {
                return Err(Error::InvalidTransfer(format!(
                    "스트림 {} 조기 종료",
                    self.stream.id()
                )));
            }
            match self.stream.read().await? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => self.finished = true,
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    async fn read_header(&mut self) -> Result<TransferHeader> {
        let len = self.read_exact(4).await?.get_u32() as usize;
        if len == 0 || len > MAX_HEADER_LEN {
            return Err(Error::InvalidTransfer(format!("헤더 길이 {}", len)));
        }
        let header = TransferHeader::from_bytes(&self.read_exact(len).await?)?;
        header.validate()?;
        Ok(header)
    }

    /// 스트림 끝까지 읽음. 길이가 정확히 `expected` 가 아니면 에러
    ///
    /// 도착한 만큼만 버퍼가 자라고, 넘치는 순간 중단
    async fn read_body(&mut self, expected: u64) -> Result<Vec<u8>> {
        let mut body = std::mem::take(&mut self.buf).to_vec();
        loop {
            if body.len() as u64 > expected {
                return Err(Error::InvalidTransfer(format!(
                    "본문이 예상 길이 {} 를 넘음",
                    expected
                )));
            }
            if self.finished {
                break;
            }
            match self.stream.read().await? {
                Some(chunk) => body.extend_from_slice(&chunk),
                None => self.finished = true,
            }
        }
        if body.len() as u64 != expected {
            return Err(Error::InvalidTransfer(format!(
                "본문 길이 {} != 예상 {}",
                body.len(),
                expected
            )));
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_blocks_interleave() {
        let blocks: Vec<_> = flow_blocks(25, 4, 1, 3).collect();
        assert_eq!(blocks, vec![4..8, 16..20]);

        let last: Vec<_> = flow_blocks(25, 4, 0, 3).collect();
        assert_eq!(last, vec![0..4, 12..16, 24..25]);
    }

    #[test]
    fn test_flow_blocks_cover_file_exactly_once() {
        let total = 10_007;
        let mut covered = vec![0u8; total];
        for index in 0..3 {
            for range in flow_blocks(total, 1000, index, 3) {
                for b in &mut covered[range] {
                    *b += 1;
                }
            }
        }
        assert!(covered.iter().all(|&c| c == 1));
    }

    #[test]
    fn test_flow_blocks_more_flows_than_blocks() {
        assert_eq!(flow_blocks(10, 8, 2, 4).count(), 0);
        assert_eq!(flow_blocks(0, 8, 0, 1).count(), 0);
    }

    #[test]
    fn test_header_roundtrip_with_prefix() {
        let header = TransferHeader {
            flow_index: 2,
            flow_count: 3,
            block_size: 4096,
            total_len: 1 << 20,
        };
        let bytes = header.to_bytes().unwrap();
        let len = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
        assert_eq!(len, bytes.len() - 4);
        assert_eq!(TransferHeader::from_bytes(&bytes[4..]).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_bad_index() {
        let header = TransferHeader {
            flow_index: 3,
            flow_count: 3,
            block_size: 1,
            total_len: 10,
        };
        assert!(matches!(header.validate(), Err(Error::InvalidTransfer(_))));
    }

    #[test]
    fn test_expected_len_matches_flow_blocks() {
        let cases = [
            (25u64, 4u32, 3u32),
            (10_007, 1000, 3),
            (10, 8, 4),
            (0, 8, 1),
            (64, 16, 4),
        ];
        for (total, block, count) in cases {
            for index in 0..count {
                let header = TransferHeader {
                    flow_index: index,
                    flow_count: count,
                    block_size: block,
                    total_len: total,
                };
                let blocks: Vec<_> =
                    flow_blocks(total as usize, block as usize, index as usize, count as usize)
                        .collect();
                let bytes: usize = blocks.iter().map(|r| r.len()).sum();
                assert_eq!(header.expected_len(), bytes as u64, "{:?}", header);
                assert_eq!(header.block_count(), blocks.len() as u64, "{:?}", header);
            }
        }
    }

    #[test]
    fn test_limits_reject_oversized_header() {
        let limits = TransferLimits {
            max_total_len: 1 << 20,
            max_flows: 8,
        };
        let mut header = TransferHeader {
            flow_index: 0,
            flow_count: 8,
            block_size: 4096,
            total_len: 1 << 20,
        };
        assert!(limits.check(&header).is_ok());

        header.total_len = (1 << 20) + 1;
        assert!(matches!(limits.check(&header), Err(Error::InvalidTransfer(_))));
        header.total_len = 1 << 20;
        header.flow_count = u32::MAX;
        assert!(matches!(limits.check(&header), Err(Error::InvalidTransfer(_))));

        // 한도 없이도 거대한 헤더의 길이 계산은 즉시 끝남
        let huge = TransferHeader {
            flow_index: 0,
            flow_count: 1,
            block_size: 1,
            total_len: u64::MAX,
        };
        assert_eq!(huge.expected_len(), u64::MAX);
        assert!(TransferLimits::default().check(&huge).is_err());
    }

    #[tokio::test]
    async fn test_oversized_header_rejected_before_allocation() {
        let config = crate::Config::default();
        let mut listener = crate::listen("127.0.0.1:0".parse().unwrap(), config.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            let limits = TransferLimits {
                max_total_len: 1 << 20,
                max_flows: 8,
            };
            let result = receive_file_with_limits(&conn, limits).await;
            (conn, result)
        });

        let conn = crate::connect(addr, config).await.unwrap();
        let mut stream = conn.open_uni_stream().await.unwrap();
        let header = TransferHeader {
            flow_index: 0,
            flow_count: 1_000_000,
            block_size: 1,
            total_len: 1 << 40,
        };
        stream.write_all(&header.to_bytes().unwrap()).await.unwrap();
        stream.finish().await.unwrap();

        let (server_conn, result) = server.await.unwrap();
        assert!(matches!(result, Err(Error::InvalidTransfer(_))));
        conn.close().await.unwrap();
        drop(server_conn);
    }

    #[tokio::test]
    async fn test_send_and_receive_over_loopback() {
        let config = crate::Config::default();
        let mut listener = crate::listen("127.0.0.1:0".parse().unwrap(), config.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();

        let server = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            receive_file(&conn).await.unwrap()
        });

        let conn = crate::connect(addr, config).await.unwrap();
        let sent = send_file(&conn, Bytes::from(data), 3, 16 * 1024).await.unwrap();
        let (received, report) = server.await.unwrap();
        conn.close().await.unwrap();

        assert_eq!(received, expected);
        assert_eq!(sent.total_bytes(), expected.len() as u64);
        assert_eq!(report.flows.len(), 3);
        assert_eq!(report.total_blocks(), sent.total_blocks());
    }
}
