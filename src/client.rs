//! 로더(클라이언트)측
//!
//! - 제어 평면: 명령 하나당 TCP 연결 하나
//! - 데이터 평면: WRQ → DATA/ACK 정지-대기 전송 → CRC 트레일러
//!
//! 서버는 재전송하지 않으므로 ACK 대기 타임아웃과 재시도는 여기서 담당함

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::control::Command;
use crate::crc::crc32;
use crate::envelope::Response;
use crate::packet::Packet;
use crate::plan::LoadPlan;
use crate::{Error, Result, BLOCK_SIZE, MAX_PACKET_SIZE};

/// 기본 응답 대기 시간
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// 블록당 기본 재시도 횟수
pub const DEFAULT_RETRIES: usize = 5;

fn expect_ok(response: Response) -> Result<Response> {
    if response.is_ok() {
        Ok(response)
    } else {
        Err(Error::Rejected(
            response.message().unwrap_or("ERROR").to_string(),
        ))
    }
}

/// 제어 평면 클라이언트
#[derive(Debug, Clone)]
pub struct ControlClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 명령 전송 (ERROR 응답도 그대로 반환)
    pub async fn send(&self, command: Command, fields: &[(&str, Value)]) -> Result<Response> {
        let mut map = Map::new();
        map.insert("command".into(), Value::from(command.as_str()));
        for (key, value) in fields {
            map.insert((*key).to_string(), value.clone());
        }
        self.send_raw(&Value::Object(map).to_string()).await
    }

    /// 임의의 텍스트 봉투 전송
    pub async fn send_raw(&self, text: &str) -> Result<Response> {
        let response = timeout(self.timeout, self.exchange(text))
            .await
            .map_err(|_| Error::Timeout(format!("제어 응답 ({})", self.addr)))??;

        debug!("{} -> {}", text, response.to_text());
        Ok(response)
    }

    /// 연결 하나에서 요청 하나, 응답 하나 (서버가 연결을 닫을 때까지 읽음)
    async fn exchange(&self, text: &str) -> Result<Response> {
        let mut stream = TcpStream::connect(self.addr).await?;
        stream.write_all(text.as_bytes()).await?;
        // 쓰기 방향만 닫아 봉투 끝을 알림
        stream.shutdown().await?;

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await?;
        Response::from_text(&String::from_utf8_lossy(&reply))
    }

    pub async fn init_load(&self) -> Result<Response> {
        expect_ok(self.send(Command::InitLoad, &[]).await?)
    }

    pub async fn send_lse(
        &self,
        file_name: &str,
        crc32: u32,
        memory_address: u32,
        version: Option<&str>,
    ) -> Result<Response> {
        let mut fields = vec![
            ("file_name", Value::from(file_name)),
            ("crc32", Value::from(crc32)),
            ("memory_address", Value::from(format!("0x{:08X}", memory_address))),
        ];
        if let Some(version) = version {
            fields.push(("version", Value::from(version)));
        }
        expect_ok(self.send(Command::SendLse, &fields).await?)
    }

    pub async fn verify_lse(&self) -> Result<Response> {
        expect_ok(self.send(Command::VerifyLse, &[]).await?)
    }

    pub async fn commit_load(&self) -> Result<Response> {
        expect_ok(self.send(Command::CommitLoad, &[]).await?)
    }

    pub async fn abort(&self, reason: &str) -> Result<Response> {
        expect_ok(self.send(Command::Abort, &[("reason", Value::from(reason))]).await?)
    }

    pub async fn report_status(&self) -> Result<Response> {
        expect_ok(self.send(Command::ReportStatus, &[]).await?)
    }

    pub async fn get_device_info(&self) -> Result<Response> {
        expect_ok(self.send(Command::GetDeviceInfo, &[]).await?)
    }
}

/// 데이터 평면 업로더
#[derive(Debug, Clone)]
pub struct BlockUploader {
    server: SocketAddr,
    timeout: Duration,
    retries: usize,
}

impl BlockUploader {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries.max(1);
        self
    }

    /// 이미지 전송 후 트레일러로 보낸 CRC 반환
    pub async fn upload(&self, file_name: &str, image: &[u8]) -> Result<u32> {
        let bind = if self.server.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind).await?;

        let wrq = Packet::WriteRequest {
            file_name: file_name.to_string(),
        }
        .to_bytes();
        self.exchange(&socket, &wrq, 0).await?;
        info!("WRQ for '{}' acknowledged", file_name);

        // 빈 이미지도 빈 블록 하나로 전송
        let blocks: Vec<&[u8]> = if image.is_empty() {
            vec![&[][..]]
        } else {
            image.chunks(BLOCK_SIZE).collect()
        };

        let mut crc = 0u32;
        for (i, block) in blocks.iter().enumerate() {
            let number = (i + 1) as u16;
            let packet = Packet::Data {
                block: number,
                payload: Bytes::copy_from_slice(block),
            }
            .to_bytes();

            self.exchange(&socket, &packet, number).await?;
            crc = crc32(crc, block);
            debug!("Block {}/{} acknowledged", i + 1, blocks.len());
        }

        let trailer = Packet::Trailer { crc32: Some(crc) }.to_bytes();
        socket.send_to(&trailer, self.server).await?;
        info!("Sent CRC32 trailer: 0x{:08X} ({} bytes)", crc, image.len());

        Ok(crc)
    }

    /// 패킷 전송 후 해당 블록 ACK 대기, 재시도 소진 시 타임아웃
    async fn exchange(&self, socket: &UdpSocket, packet: &[u8], block: u16) -> Result<()> {
        for attempt in 1..=self.retries {
            socket.send_to(packet, self.server).await?;
            if self.await_ack(socket, block).await? {
                return Ok(());
            }
            warn!("Retry block {} (attempt {})", block, attempt);
        }
        Err(Error::Timeout(format!(
            "block {} not acknowledged after {} attempts",
            block, self.retries
        )))
    }

    async fn await_ack(&self, socket: &UdpSocket, block: u16) -> Result<bool> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; MAX_PACKET_SIZE];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _))) => {
                    if let Some(Packet::Ack { block: acked }) = Packet::parse(&buf[..len]) {
                        if acked == block {
                            return Ok(true);
                        }
                        debug!("Stale ACK {} while waiting for {}", acked, block);
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(false),
            }
        }
    }
}

/// 로드할 소프트웨어 요소 정보
#[derive(Debug, Clone)]
pub struct LseSpec {
    pub file_name: String,
    pub version: Option<String>,
    pub memory_address: u32,
    /// 선언할 CRC (None이면 이미지 CRC)
    pub declared_crc32: Option<u32>,
}

/// 제어 + 데이터 평면을 묶은 로더
pub struct Loader {
    control: ControlClient,
    uploader: BlockUploader,
    /// 트레일러 처리 확인 폴링 횟수
    status_polls: usize,
}

impl Loader {
    pub fn new(control_addr: SocketAddr, data_addr: SocketAddr) -> Self {
        Self {
            control: ControlClient::new(control_addr),
            uploader: BlockUploader::new(data_addr),
            status_polls: 50,
        }
    }

    pub fn with_clients(control: ControlClient, uploader: BlockUploader) -> Self {
        Self {
            control,
            uploader,
            status_polls: 50,
        }
    }

    pub fn control(&self) -> &ControlClient {
        &self.control
    }

    /// INIT_LOAD → SEND_LSE → 블록 전송 → VERIFY_LSE → COMMIT_LOAD
    ///
    /// 첫 ERROR 응답에서 중단하고 `Error::Rejected` 반환
    pub async fn upload_component(&self, spec: &LseSpec, image: &[u8]) -> Result<Response> {
        let crc = spec.declared_crc32.unwrap_or_else(|| crc32(0, image));

        info!("[1/4] INIT_LOAD");
        let init = self.control.init_load().await?;
        info!("Session {}", init.get_u64("session_id").unwrap_or(0));

        info!("[2/4] SEND_LSE {} (CRC32 0x{:08X})", spec.file_name, crc);
        self.control
            .send_lse(&spec.file_name, crc, spec.memory_address, spec.version.as_deref())
            .await?;

        info!("[3/4] Block transfer ({} bytes)", image.len());
        self.uploader.upload(&spec.file_name, image).await?;
        self.wait_for_reconciliation().await?;

        info!("[4/4] VERIFY_LSE and COMMIT_LOAD");
        self.control.verify_lse().await?;
        self.control.commit_load().await
    }

    /// 플랜의 요소를 순서대로 로드, 첫 실패에서 중단
    ///
    /// 성공한 요소들의 COMMIT_LOAD 응답을 순서대로 반환
    pub async fn upload_plan(&self, plan: &LoadPlan) -> Result<Vec<Response>> {
        let target_device = if plan.components.iter().any(|c| c.device.is_some()) {
            let info = self.control.get_device_info().await?;
            info.get_str("device").map(str::to_string)
        } else {
            None
        };

        let mut results = Vec::with_capacity(plan.components.len());
        for (i, component) in plan.components.iter().enumerate() {
            let label = component.lse.as_deref().unwrap_or("-");
            info!(
                "Component {}/{} '{}' ({})",
                i + 1,
                plan.components.len(),
                label,
                component.file.display()
            );

            if let Some(device) = &component.device {
                if target_device.as_deref() != Some(device.as_str()) {
                    return Err(Error::Rejected(format!(
                        "component '{}' targets {}, target is {}",
                        label,
                        device,
                        target_device.as_deref().unwrap_or("unknown")
                    )));
                }
            }

            let image = tokio::fs::read(&component.file).await?;
            let spec = LseSpec {
                file_name: component.file_name(),
                version: component.version.clone(),
                memory_address: component.memory_address,
                declared_crc32: component.crc32,
            };
            results.push(self.upload_component(&spec, &image).await?);
        }

        Ok(results)
    }

    /// 트레일러는 ACK가 없으므로 타깃이 처리했는지 상태 조회로 확인
    async fn wait_for_reconciliation(&self) -> Result<()> {
        for _ in 0..self.status_polls {
            let status = self.control.report_status().await?;
            match status.get_str("transfer") {
                Some("none") | None => tokio::time::sleep(Duration::from_millis(20)).await,
                Some(_) => return Ok(()),
            }
        }
        Err(Error::Timeout("transfer not reported by target".into()))
    }
}
