//! 에러 타입 정의

use thiserror::Error;

/// 로더 프로토콜 에러 타입
///
/// 어떤 에러도 리스너 프로세스를 종료시키지 않음 (세션 단위로만 처리)
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("명령 봉투 파싱 에러: {0}")]
    Envelope(#[from] serde_json::Error),

    /// 잘못된 패킷 / 봉투
    #[error("프로토콜 에러: {0}")]
    Protocol(String),

    /// 순서가 맞지 않는 블록
    #[error("블록 순서 에러: expected {expected}, got {got}")]
    Sequence { expected: u16, got: u16 },

    /// 트레일러 체크섬 불일치
    #[error("CRC 불일치: expected {expected:08X}, got {got:08X}")]
    CrcMismatch { expected: u32, got: u32 },

    /// 저장 싱크를 열거나 쓸 수 없음
    #[error("리소스 에러: {0}")]
    Resource(String),

    /// 로드 플랜 파싱 실패
    #[error("로드 플랜 에러: {0}")]
    Plan(String),

    #[error("응답 대기 타임아웃: {0}")]
    Timeout(String),

    #[error("서버 응답 에러: {0}")]
    Rejected(String),

    #[error("태스크 에러: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
