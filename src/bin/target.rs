//! A615 타깃 (LRU 시뮬레이터)
//!
//! 데이터 평면(TFTP + CRC 트레일러)과 제어 평면(JSON 명령) 리스너를 함께 실행
//!
//! 사용법:
//!   cargo run --release --bin a615-target -- [OPTIONS]
//!
//! 예시:
//!   # 기본 포트 (69 / 61500), 현재 디렉터리에 저장
//!   cargo run --release --bin a615-target
//!
//!   # 비특권 포트 + 출력 디렉터리 지정
//!   cargo run --release --bin a615-target -- --data-bind 0.0.0.0:6969 -o ./received

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use a615::{Config, Target};

/// 실행 설정
struct TargetConfig {
    verbose: bool,
    config: Config,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            config: Config::new(),
        }
    }
}

fn parse_args() -> Result<TargetConfig, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = TargetConfig::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--data-bind" | "-d" => {
                let v = value.ok_or("--data-bind 값 필요")?;
                config.config.data_bind = v.parse().map_err(|_| format!("유효한 주소 필요: {}", v))?;
                i += 1;
            }
            "--control-bind" | "-c" => {
                let v = value.ok_or("--control-bind 값 필요")?;
                config.config.control_bind =
                    v.parse().map_err(|_| format!("유효한 주소 필요: {}", v))?;
                i += 1;
            }
            "--output" | "-o" => {
                let v = value.ok_or("--output 값 필요")?;
                config.config = config.config.with_output_dir(v);
                i += 1;
            }
            "--device" => {
                let v = value.ok_or("--device 값 필요")?;
                config.config.device_id = v.clone();
                i += 1;
            }
            "--device-version" => {
                let v = value.ok_or("--device-version 값 필요")?;
                config.config.device_version = v.clone();
                i += 1;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"A615 Target - ARINC 615A 스타일 LRU 로더 시뮬레이터

TFTP 블록 전송(+CRC 트레일러)과 JSON 제어 세션을 함께 제공
- 데이터 평면: WRQ / DATA / ACK, opcode 0x10 CRC 트레일러
- 제어 평면: INIT_LOAD, SEND_LSE, VERIFY_LSE, COMMIT_LOAD, ABORT, REPORT_STATUS, GET_DEVICE_INFO

사용법:
  cargo run --release --bin a615-target -- [OPTIONS]

옵션:
  -d, --data-bind <ADDR>     TFTP 바인드 주소 (기본: 0.0.0.0:69)
  -c, --control-bind <ADDR>  제어 바인드 주소 (기본: 0.0.0.0:61500)
  -o, --output <DIR>         수신 이미지 저장 디렉터리 (기본: .)
  --device <ID>              장치 ID (기본: FCC1)
  --device-version <VER>     장치 버전 (기본: v1.0)
  -v, --verbose              디버그 로그 출력
  -h, --help                 이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            other => {
                return Err(format!("알 수 없는 옵션: {}", other));
            }
        }
        i += 1;
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let target_config = parse_args()?;

    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if target_config.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = target_config.config;
    info!("A615 Target starting...");
    info!("Device: {} {}", config.device_id, config.device_version);
    info!("Output directory: {}", config.output_dir.display());

    let handle = Target::bind(config).await?.spawn()?;
    info!(
        "Ready (data {}, control {})",
        handle.data_addr, handle.control_addr
    );

    handle.join().await?;
    Ok(())
}
