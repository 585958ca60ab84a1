//! 데이터 평면 전송 통계

use std::time::{Duration, Instant};

/// 전송 세션 누적 통계
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    /// 시작된 전송 수 (WRQ 수락)
    pub transfers_started: u64,

    /// 트레일러 체크섬 일치로 끝난 전송 수
    pub transfers_completed: u64,

    /// 체크섬 불일치 / 싱크 에러로 끝난 전송 수
    pub transfers_failed: u64,

    /// ABORT로 끊긴 전송 수
    pub transfers_aborted: u64,

    /// 수락된 데이터 블록 수
    pub blocks_accepted: u64,

    /// 순서가 맞지 않아 버려진 블록 수 (중복 포함)
    pub blocks_dropped: u64,

    /// 잘못된 형식이거나 상태에 맞지 않아 무시된 데이터그램 수
    pub datagrams_ignored: u64,

    /// 수신된 페이로드 바이트
    pub bytes_received: u64,

    /// 현재 전송 시작 시각
    pub current_started_at: Option<Instant>,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&mut self) {
        self.transfers_started += 1;
        self.current_started_at = Some(Instant::now());
    }

    pub fn record_block(&mut self, len: usize) {
        self.blocks_accepted += 1;
        self.bytes_received += len as u64;
    }

    pub fn record_drop(&mut self) {
        self.blocks_dropped += 1;
    }

    pub fn record_ignored(&mut self) {
        self.datagrams_ignored += 1;
    }

    /// 전송 종료 기록, 경과 시간 반환
    pub fn record_end(&mut self, ok: bool) -> Duration {
        if ok {
            self.transfers_completed += 1;
        } else {
            self.transfers_failed += 1;
        }
        self.take_elapsed()
    }

    pub fn record_abort(&mut self) {
        self.transfers_aborted += 1;
        self.take_elapsed();
    }

    fn take_elapsed(&mut self) -> Duration {
        self.current_started_at
            .take()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// 처리율 (bytes/sec)
    pub fn throughput(bytes: u64, elapsed: Duration) -> f64 {
        if elapsed.is_zero() {
            return 0.0;
        }
        bytes as f64 / elapsed.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let mut stats = TransferStats::new();
        stats.record_start();
        stats.record_block(512);
        stats.record_block(10);
        stats.record_drop();
        stats.record_end(true);

        assert_eq!(stats.transfers_started, 1);
        assert_eq!(stats.transfers_completed, 1);
        assert_eq!(stats.blocks_accepted, 2);
        assert_eq!(stats.bytes_received, 522);
        assert_eq!(stats.blocks_dropped, 1);
        assert!(stats.current_started_at.is_none());
    }

    #[test]
    fn test_throughput_zero_elapsed() {
        assert_eq!(TransferStats::throughput(100, Duration::ZERO), 0.0);
        assert_eq!(TransferStats::throughput(100, Duration::from_secs(2)), 50.0);
    }
}
