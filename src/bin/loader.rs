//! A615 로더 (데이터 로더 클라이언트)
//!
//! 소프트웨어 요소 하나를 타깃에 로드:
//! INIT_LOAD → SEND_LSE → TFTP 전송 + CRC 트레일러 → VERIFY_LSE → COMMIT_LOAD
//!
//! 사용법:
//!   cargo run --release --bin a615-loader -- [OPTIONS]
//!
//! 예시:
//!   # 이미지 로드
//!   cargo run --release --bin a615-loader -- --target 192.168.1.50 --file fcc1_boot.sre --memory 0x08000000
//!
//!   # 로드 플랜 (XML) 의 모든 요소를 순서대로 로드
//!   cargo run --release --bin a615-loader -- -t 192.168.1.50 --plan loadplan.xml
//!
//!   # 상태 조회만
//!   cargo run --release --bin a615-loader -- -t 127.0.0.1 --status

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use a615::client::{BlockUploader, ControlClient, Loader, LseSpec};
use a615::envelope::parse_u32;
use a615::plan::LoadPlan;
use a615::{DEFAULT_CONTROL_PORT, DEFAULT_DATA_PORT};

/// 수행할 동작
enum Action {
    Upload,
    Plan(PathBuf),
    Status,
    DeviceInfo,
    Abort,
}

/// 로더 설정
struct LoaderConfig {
    target: IpAddr,
    data_port: u16,
    control_port: u16,
    file_path: Option<PathBuf>,
    file_name: Option<String>,
    version: Option<String>,
    memory_address: u32,
    timeout: Duration,
    retries: usize,
    action: Action,
    verbose: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            target: IpAddr::from([127, 0, 0, 1]),
            data_port: DEFAULT_DATA_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            file_path: None,
            file_name: None,
            version: None,
            memory_address: 0,
            timeout: Duration::from_secs(2),
            retries: 5,
            action: Action::Upload,
            verbose: false,
        }
    }
}

fn parse_args() -> Result<LoaderConfig, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = LoaderConfig::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--target" | "-t" => {
                let v = value.ok_or("--target 값 필요")?;
                config.target = v.parse().map_err(|_| format!("유효한 IP 필요: {}", v))?;
                i += 1;
            }
            "--data-port" => {
                let v = value.ok_or("--data-port 값 필요")?;
                config.data_port = v.parse().map_err(|_| format!("유효한 포트 필요: {}", v))?;
                i += 1;
            }
            "--control-port" => {
                let v = value.ok_or("--control-port 값 필요")?;
                config.control_port = v.parse().map_err(|_| format!("유효한 포트 필요: {}", v))?;
                i += 1;
            }
            "--file" | "-f" => {
                let v = value.ok_or("--file 값 필요")?;
                config.file_path = Some(PathBuf::from(v));
                i += 1;
            }
            "--name" | "-n" => {
                let v = value.ok_or("--name 값 필요")?;
                config.file_name = Some(v.clone());
                i += 1;
            }
            "--version" => {
                let v = value.ok_or("--version 값 필요")?;
                config.version = Some(v.clone());
                i += 1;
            }
            "--memory" | "-m" => {
                let v = value.ok_or("--memory 값 필요")?;
                config.memory_address = parse_u32(v).ok_or(format!("유효한 주소 필요: {}", v))?;
                i += 1;
            }
            "--timeout-ms" => {
                let v = value.ok_or("--timeout-ms 값 필요")?;
                let ms: u64 = v.parse().map_err(|_| format!("유효한 숫자 필요: {}", v))?;
                config.timeout = Duration::from_millis(ms);
                i += 1;
            }
            "--retries" => {
                let v = value.ok_or("--retries 값 필요")?;
                config.retries = v.parse().map_err(|_| format!("유효한 숫자 필요: {}", v))?;
                i += 1;
            }
            "--plan" | "-p" => {
                let v = value.ok_or("--plan 값 필요")?;
                config.action = Action::Plan(PathBuf::from(v));
                i += 1;
            }
            "--status" => config.action = Action::Status,
            "--info" => config.action = Action::DeviceInfo,
            "--abort" => config.action = Action::Abort,
            "--verbose" | "-v" => config.verbose = true,
            "--help" | "-h" => {
                println!(
                    r#"A615 Loader - 소프트웨어 요소(LSE) 로드 클라이언트

INIT_LOAD → SEND_LSE → TFTP 전송 + CRC 트레일러 → VERIFY_LSE → COMMIT_LOAD

사용법:
  cargo run --release --bin a615-loader -- [OPTIONS]

옵션:
  -t, --target <IP>        타깃 주소 (기본: 127.0.0.1)
  --data-port <PORT>       TFTP 포트 (기본: 69)
  --control-port <PORT>    제어 포트 (기본: 61500)
  -f, --file <PATH>        로드할 이미지 파일
  -n, --name <NAME>        타깃에 선언할 파일명 (기본: 파일 이름)
  --version <VER>          LSE 버전
  -m, --memory <ADDR>      메모리 주소 (10진수 또는 0x 16진수)
  --timeout-ms <MS>        ACK / 응답 대기 시간 (기본: 2000)
  --retries <N>            블록당 재시도 횟수 (기본: 5)
  -p, --plan <PATH>        로드 플랜 XML의 모든 요소 로드
  --status                 REPORT_STATUS만 수행
  --info                   GET_DEVICE_INFO만 수행
  --abort                  ABORT만 수행
  -v, --verbose            디버그 로그 출력
  -h, --help               이 도움말 출력
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
    let loader_config = parse_args()?;

    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if loader_config.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let control_addr = SocketAddr::new(loader_config.target, loader_config.control_port);
    let data_addr = SocketAddr::new(loader_config.target, loader_config.data_port);

    let control = ControlClient::new(control_addr).with_timeout(loader_config.timeout);

    let uploader = BlockUploader::new(data_addr)
        .with_timeout(loader_config.timeout)
        .with_retries(loader_config.retries);

    let response = match loader_config.action {
        Action::Status => control.report_status().await?,
        Action::DeviceInfo => control.get_device_info().await?,
        Action::Abort => control.abort("User request").await?,
        Action::Plan(path) => {
            let plan = LoadPlan::load(&path)?;
            info!("Load plan {}: {} components", path.display(), plan.components.len());

            let loader = Loader::with_clients(control, uploader);
            match loader.upload_plan(&plan).await {
                Ok(results) => {
                    for (component, result) in plan.components.iter().zip(&results) {
                        info!("{}: {}", component.file_name(), result.to_text());
                    }
                    return Ok(());
                }
                Err(e) => {
                    error!("Load plan failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        Action::Upload => {
            let path = loader_config
                .file_path
                .ok_or("--file 필요 (--help 참고)")?;
            let image = std::fs::read(&path)?;
            let file_name = match loader_config.file_name {
                Some(name) => name,
                None => path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or("파일명을 알 수 없음")?
                    .to_string(),
            };

            info!("Loading {} ({} bytes) to {}", file_name, image.len(), loader_config.target);

            let loader = Loader::with_clients(control, uploader);
            let spec = LseSpec {
                file_name,
                version: loader_config.version,
                memory_address: loader_config.memory_address,
                declared_crc32: None,
            };

            match loader.upload_component(&spec, &image).await {
                Ok(response) => response,
                Err(e) => {
                    error!("Load failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    };

    info!("Result: {}", response.to_text());
    Ok(())
}
