//! 타깃(LRU) 설정

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::{DEFAULT_CONTROL_PORT, DEFAULT_DATA_PORT};

/// 타깃 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 데이터 평면(TFTP) 바인드 주소
    pub data_bind: SocketAddr,

    /// 제어 평면(TCP) 바인드 주소
    pub control_bind: SocketAddr,

    /// 수신 이미지를 저장할 디렉터리
    pub output_dir: PathBuf,

    /// 장치 ID (GET_DEVICE_INFO 응답)
    pub device_id: String,

    /// 장치 소프트웨어 버전 (GET_DEVICE_INFO 응답)
    pub device_version: String,

    /// 제어 명령 최대 길이 (바이트)
    pub command_buffer_size: usize,

    /// 명령 일부를 받은 뒤 나머지를 기다리는 시간
    pub command_read_timeout: Duration,

    /// 중단 명령 채널 크기
    pub command_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_DATA_PORT)),
            control_bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_CONTROL_PORT)),
            output_dir: PathBuf::from("."),
            device_id: "FCC1".to_string(),
            device_version: "v1.0".to_string(),
            command_buffer_size: 1024,
            command_read_timeout: Duration::from_millis(200),
            command_queue_size: 16,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 루프백 전용 설정 (포트 자동 할당, 테스트용)
    pub fn loopback() -> Self {
        Self {
            data_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            control_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Self::default()
        }
    }

    /// 출력 디렉터리 지정
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }
}
