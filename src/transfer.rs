//! 데이터 평면 전송 세션
//!
//! - WRQ 수신 시 싱크를 열고 ACK(0) 응답
//! - 기대 블록 번호와 일치하는 DATA만 기록 + CRC 누적 + ACK
//! - 중복/순서 어긋난 블록은 조용히 버림 (재ACK 없음, 재전송은 클라이언트 책임)
//! - CRC 트레일러로 종료, 레지스트리에 완료 보고
//!
//! 서버측 타임아웃 없음: RECEIVING 상태는 트레일러나 ABORT가 올 때까지 유지됨

use std::fmt;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::crc::crc32;
use crate::packet::{ack, Packet};
use crate::registry::{CompletedTransfer, Reconciliation, SharedRegistry};
use crate::sink::{sanitize_file_name, ImageSink, SinkSummary};
use crate::stats::TransferStats;
use crate::{Error, Result, BLOCK_SIZE};

/// 전송 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    #[default]
    Idle,
    Receiving,
    /// 마지막(짧은) 블록 수신 후 트레일러 대기
    AwaitingTrailer,
    Complete,
    Failed,
}

impl TransferState {
    /// 새 WRQ를 받을 수 있는 상태인지
    pub fn accepts_request(&self) -> bool {
        matches!(
            self,
            TransferState::Idle | TransferState::Complete | TransferState::Failed
        )
    }

    /// 싱크가 열려 있는 상태인지
    pub fn is_active(&self) -> bool {
        matches!(self, TransferState::Receiving | TransferState::AwaitingTrailer)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::Idle => write!(f, "IDLE"),
            TransferState::Receiving => write!(f, "RECEIVING"),
            TransferState::AwaitingTrailer => write!(f, "AWAITING_TRAILER"),
            TransferState::Complete => write!(f, "COMPLETE"),
            TransferState::Failed => write!(f, "FAILED"),
        }
    }
}

/// 제어 평면 → 데이터 평면 명령
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferCmd {
    /// 진행 중인 전송 폐기
    Abort,
}

/// 전송 세션 (한 번에 하나의 전송만 처리)
pub struct TransferSession<S: ImageSink> {
    state: TransferState,
    expected_block: u16,
    running_crc32: u32,
    bytes_received: u64,
    file_name: Option<String>,
    sink: S,
    registry: SharedRegistry,
    stats: TransferStats,
    last_reconciliation: Option<Reconciliation>,
}

impl<S: ImageSink> TransferSession<S> {
    pub fn new(sink: S, registry: SharedRegistry) -> Self {
        Self {
            state: TransferState::Idle,
            expected_block: 1,
            running_crc32: 0,
            bytes_received: 0,
            file_name: None,
            sink,
            registry,
            stats: TransferStats::new(),
            last_reconciliation: None,
        }
    }

    /// 데이터그램 하나 처리, 보낼 ACK가 있으면 반환
    ///
    /// 에러는 세션 안에서만 처리되고 호출자에게는 응답 없음(None)으로 보임
    pub fn on_datagram(&mut self, bytes: &[u8]) -> Option<Bytes> {
        let Some(packet) = Packet::parse(bytes) else {
            debug!("Malformed datagram dropped ({} bytes)", bytes.len());
            self.stats.record_ignored();
            return None;
        };

        let result = match packet {
            Packet::WriteRequest { file_name } if self.state.accepts_request() => {
                self.handle_write_request(&file_name).map(Some)
            }
            Packet::Data { block, payload } if self.state.is_active() => {
                self.handle_data(block, &payload).map(Some)
            }
            Packet::Trailer { crc32 } if self.state.is_active() => {
                self.handle_trailer(crc32).map(|_| None)
            }
            other => {
                debug!("Datagram ignored in state {}: {:?}", self.state, other);
                self.stats.record_ignored();
                Ok(None)
            }
        };

        match result {
            Ok(reply) => reply,
            Err(Error::Sequence { expected, got }) => {
                debug!("Out-of-order block {} dropped (expected {})", got, expected);
                self.stats.record_drop();
                None
            }
            Err(e) => {
                warn!("Transfer error: {}", e);
                None
            }
        }
    }

    /// 제어 평면 명령 처리
    pub fn handle_cmd(&mut self, cmd: TransferCmd) {
        match cmd {
            TransferCmd::Abort => self.abort(),
        }
    }

    /// 진행 중인 전송 폐기 후 IDLE 복귀 (기록된 바이트는 되돌리지 않음)
    pub fn abort(&mut self) {
        if !self.state.is_active() {
            return;
        }

        self.close_sink();
        info!(
            "Transfer aborted: {} ({} bytes received)",
            self.file_name.as_deref().unwrap_or("-"),
            self.bytes_received
        );
        self.stats.record_abort();
        self.state = TransferState::Idle;
    }

    fn close_sink(&mut self) -> Option<SinkSummary> {
        match self.sink.close() {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("싱크 닫기 실패: {}", e);
                None
            }
        }
    }

    /// 싱크를 열 수 없으면 ACK 없이 거절 (클라이언트에서는 타임아웃으로 보임)
    fn handle_write_request(&mut self, requested: &str) -> Result<Bytes> {
        let file_name = sanitize_file_name(requested);
        info!("WRQ for file: {}", file_name);

        self.sink.open(&file_name)?;

        self.registry.forget_transfer(&file_name);
        self.state = TransferState::Receiving;
        self.expected_block = 1;
        self.running_crc32 = 0;
        self.bytes_received = 0;
        self.file_name = Some(file_name);
        self.last_reconciliation = None;
        self.stats.record_start();

        Ok(ack(0))
    }

    fn handle_data(&mut self, block: u16, payload: &[u8]) -> Result<Bytes> {
        if self.state != TransferState::Receiving || block != self.expected_block {
            return Err(Error::Sequence {
                expected: self.expected_block,
                got: block,
            });
        }

        if let Err(e) = self.sink.write(payload) {
            self.close_sink();
            self.stats.record_end(false);
            self.state = TransferState::Failed;
            return Err(e);
        }

        self.running_crc32 = crc32(self.running_crc32, payload);
        self.bytes_received += payload.len() as u64;
        self.stats.record_block(payload.len());
        debug!("Received DATA block {} ({} bytes)", block, payload.len());

        // 블록 번호는 65535 다음 0으로 순환
        self.expected_block = self.expected_block.wrapping_add(1);
        if payload.len() < BLOCK_SIZE {
            self.state = TransferState::AwaitingTrailer;
        }

        Ok(ack(block))
    }

    /// 트레일러 체크섬 확인 후 전송 종료, 결과와 무관하게 레지스트리에 보고
    fn handle_trailer(&mut self, declared: Option<u32>) -> Result<()> {
        let computed = self.running_crc32;

        let sink_ok = match self.close_sink() {
            Some(summary) if summary.crc32 == computed && summary.total_bytes == self.bytes_received => true,
            Some(summary) => {
                warn!(
                    "Sink summary differs: 0x{:08X}/{} bytes vs 0x{:08X}/{} bytes",
                    summary.crc32, summary.total_bytes, computed, self.bytes_received
                );
                false
            }
            None => false,
        };

        let verdict = match declared {
            Some(declared) if declared == computed && sink_ok => {
                info!("CRC check passed: 0x{:08X}", computed);
                Ok(())
            }
            Some(declared) if declared == computed => {
                Err(Error::Resource("싱크 기록 내용이 수신 스트림과 다름".into()))
            }
            Some(declared) => Err(Error::CrcMismatch {
                expected: computed,
                got: declared,
            }),
            None => Err(Error::Protocol("CRC 트레일러가 잘림".into())),
        };

        let ok = verdict.is_ok();
        self.state = if ok {
            TransferState::Complete
        } else {
            TransferState::Failed
        };

        let elapsed = self.stats.record_end(ok);
        info!(
            "End of transfer: {} bytes, {:.1} KB/s, state {}",
            self.bytes_received,
            TransferStats::throughput(self.bytes_received, elapsed) / 1024.0,
            self.state
        );

        let file_name = self.file_name.clone().unwrap_or_default();
        let result = self.registry.on_transfer_complete(CompletedTransfer {
            file_name,
            crc32: computed,
            total_bytes: self.bytes_received,
            trailer_ok: ok,
        });
        self.last_reconciliation = Some(result);

        verdict
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn expected_block(&self) -> u16 {
        self.expected_block
    }

    pub fn running_crc32(&self) -> u32 {
        self.running_crc32
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// 마지막 전송의 대조 결과
    pub fn last_reconciliation(&self) -> Option<&Reconciliation> {
        self.last_reconciliation.as_ref()
    }
}
