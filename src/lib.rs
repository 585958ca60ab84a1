//! # A615 Loader
//!
//! ARINC 615A 스타일 LRU 소프트웨어 로더 시뮬레이터
//!
//! ## 구성
//! - **데이터 평면**: TFTP 형식 블록 전송 + 비표준 CRC 트레일러 (UDP)
//! - **제어 평면**: JSON 명령/응답 세션 (TCP, 연결당 1회 교환)
//! - **LSE 레지스트리**: 선언된 CRC와 수신 이미지 CRC를 파일명으로 대조
//! - **CRC 엔진**: 테이블 기반 CRC-32 (ISO-HDLC), 양 평면 공용
//!
//! 클라이언트 1개가 세션 1개를 쓰는 협조적 환경을 가정함.
//! 서버는 재전송/타임아웃을 하지 않음 (재시도는 클라이언트 책임).

pub mod client;
pub mod config;
pub mod control;
pub mod crc;
pub mod envelope;
pub mod error;
pub mod packet;
pub mod plan;
pub mod registry;
pub mod server;
pub mod sink;
pub mod stats;
pub mod transfer;

pub use client::{BlockUploader, ControlClient, Loader, LseSpec};
pub use config::Config;
pub use control::{Command, ControlSession, SessionState};
pub use envelope::{Response, Status};
pub use error::{Error, Result};
pub use packet::Packet;
pub use plan::{LoadPlan, PlanComponent};
pub use registry::{LseDescriptor, Reconciliation, Registry, SharedRegistry};
pub use server::{Target, TargetHandle};
pub use sink::{FileSink, ImageSink, MemorySink};
pub use stats::TransferStats;
pub use transfer::{TransferCmd, TransferSession, TransferState};

/// 데이터 블록 최대 페이로드 (바이트)
pub const BLOCK_SIZE: usize = 512;

/// opcode(2) + block(2)
pub const HEADER_SIZE: usize = 4;

/// 최대 데이터그램 크기
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + BLOCK_SIZE;

/// 기본 TFTP 포트
pub const DEFAULT_DATA_PORT: u16 = 69;

/// 기본 제어 포트
pub const DEFAULT_CONTROL_PORT: u16 = 61500;
