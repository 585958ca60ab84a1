//! 타깃 서버: 데이터 평면 + 제어 평면 리스너
//!
//! 두 리스너는 각자의 태스크에서 독립적으로 돌며 레지스트리만 공유함.
//! ABORT는 mpsc 채널로 데이터 평면 태스크에 전달됨.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::control::ControlSession;
use crate::envelope;
use crate::registry::{Registry, SharedRegistry};
use crate::sink::{FileSink, ImageSink};
use crate::transfer::{TransferCmd, TransferSession};
use crate::{crc, Config, Result, MAX_PACKET_SIZE};

/// 바인드된 타깃 (아직 실행 전)
pub struct Target {
    config: Config,
    socket: UdpSocket,
    listener: TcpListener,
    registry: SharedRegistry,
}

impl Target {
    /// 두 평면 소켓 바인딩
    pub async fn bind(config: Config) -> Result<Self> {
        let socket = UdpSocket::bind(config.data_bind).await?;
        let listener = TcpListener::bind(config.control_bind).await?;

        info!("Data plane (TFTP) listening on {}", socket.local_addr()?);
        info!("Control plane listening on {}", listener.local_addr()?);

        Ok(Self {
            config,
            socket,
            listener,
            registry: Registry::shared(),
        })
    }

    pub fn data_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// 설정된 출력 디렉터리에 파일로 저장하며 실행
    pub fn spawn(self) -> Result<TargetHandle> {
        let sink = FileSink::new(self.config.output_dir.clone());
        self.spawn_with_sink(sink)
    }

    /// 지정한 싱크로 두 리스너 태스크 시작
    pub fn spawn_with_sink<S: ImageSink + 'static>(self, sink: S) -> Result<TargetHandle> {
        crc::warm_up();

        let data_addr = self.data_addr()?;
        let control_addr = self.control_addr()?;
        let (cmd_tx, cmd_rx) = mpsc::channel(self.config.command_queue_size);

        let transfer = TransferSession::new(sink, self.registry.clone());
        let control =
            ControlSession::new(&self.config, self.registry.clone()).with_transfer_control(cmd_tx);

        let data_task = tokio::spawn(run_data_plane(self.socket, transfer, cmd_rx));
        let control_task = tokio::spawn(run_control_plane(
            self.listener,
            control,
            self.config.command_buffer_size,
            self.config.command_read_timeout,
        ));

        Ok(TargetHandle {
            data_addr,
            control_addr,
            registry: self.registry,
            data_task,
            control_task,
        })
    }
}

/// 실행 중인 타깃 핸들
pub struct TargetHandle {
    pub data_addr: SocketAddr,
    pub control_addr: SocketAddr,
    registry: SharedRegistry,
    data_task: JoinHandle<()>,
    control_task: JoinHandle<()>,
}

impl TargetHandle {
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// 두 리스너 종료
    pub fn shutdown(self) {
        self.data_task.abort();
        self.control_task.abort();
    }

    /// 리스너가 끝날 때까지 대기
    pub async fn join(self) -> Result<()> {
        let (data, control) = tokio::join!(self.data_task, self.control_task);
        data?;
        control?;
        Ok(())
    }
}

/// 데이터그램 수신 루프
///
/// 데이터그램 하나는 다음 수신 전에 끝까지 처리됨.
/// 최대 크기보다 1바이트 큰 버퍼로 받아 초과 데이터그램을 구분함.
async fn run_data_plane<S: ImageSink>(
    socket: UdpSocket,
    mut session: TransferSession<S>,
    mut cmd_rx: mpsc::Receiver<TransferCmd>,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, addr)) => {
                        if let Some(reply) = session.on_datagram(&buf[..len]) {
                            if let Err(e) = socket.send_to(&reply, addr).await {
                                warn!("ACK 전송 실패 ({}): {}", addr, e);
                            }
                        }
                    }
                    Err(e) => {
                        warn!("수신 에러: {}", e);
                    }
                }
            }
            Some(cmd) = cmd_rx.recv() => {
                session.handle_cmd(cmd);
            }
        }
    }
}

/// 제어 연결 수락 루프 (연결 하나씩 순서대로 처리)
async fn run_control_plane(
    listener: TcpListener,
    mut session: ControlSession,
    buffer_size: usize,
    read_timeout: Duration,
) {
    let mut buf = vec![0u8; buffer_size];

    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("연결 수락 실패: {}", e);
                continue;
            }
        };

        debug!("Control connection from {}", addr);
        if let Err(e) = handle_connection(&mut stream, &mut session, &mut buf, read_timeout).await {
            warn!("제어 연결 처리 에러 ({}): {}", addr, e);
        }
    }
}

/// 명령 하나 읽고 응답 하나 보낸 뒤 연결 종료
async fn handle_connection(
    stream: &mut TcpStream,
    session: &mut ControlSession,
    buf: &mut [u8],
    read_timeout: Duration,
) -> Result<()> {
    let len = read_envelope(stream, buf, read_timeout).await?;
    if len == 0 {
        return Ok(());
    }

    let text = String::from_utf8_lossy(&buf[..len]);
    let response = session.handle(&text);

    stream.write_all(response.to_text().as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// 봉투가 여러 세그먼트로 나뉘어 와도 하나로 모음
///
/// 완결된 JSON, EOF, 버퍼 가득 참, 또는 첫 수신 이후 `read_timeout` 동안
/// 추가 데이터가 없으면 수신 종료
async fn read_envelope(stream: &mut TcpStream, buf: &mut [u8], read_timeout: Duration) -> Result<usize> {
    let mut len = stream.read(buf).await?;

    while len > 0 && len < buf.len() && !envelope::is_complete(&buf[..len]) {
        match timeout(read_timeout, stream.read(&mut buf[len..])).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => len += n,
            Ok(Err(e)) => return Err(e.into()),
        }
    }

    Ok(len)
}
