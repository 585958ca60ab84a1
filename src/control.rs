//! 제어 평면 세션
//!
//! 연결당 명령 하나, 응답 하나. 명령 처리는 항상 완료된 뒤 다음 명령을 읽음.
//!
//! | 명령 | 효과 |
//! |---|---|
//! | INIT_LOAD | 새 session_id, INITIALIZED |
//! | SEND_LSE | LSE 선언 (덮어쓰기 허용), LSE_DECLARED |
//! | VERIFY_LSE | 레지스트리 대조 결과 확인, 일치 시 VERIFIED |
//! | COMMIT_LOAD | VERIFIED 에서만 COMMITTED |
//! | ABORT | 세션/선언 초기화 + 데이터 평면 전송 폐기 |
//! | REPORT_STATUS | 상태 스냅샷 |
//! | GET_DEVICE_INFO | 장치 ID / 버전 |

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::envelope::{self, parse_u32, Fields, Response};
use crate::registry::{LseDescriptor, SharedRegistry, TransferStatus};
use crate::transfer::TransferCmd;
use crate::Config;

/// 제어 명령
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    InitLoad,
    SendLse,
    VerifyLse,
    CommitLoad,
    Abort,
    ReportStatus,
    GetDeviceInfo,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::InitLoad => "INIT_LOAD",
            Command::SendLse => "SEND_LSE",
            Command::VerifyLse => "VERIFY_LSE",
            Command::CommitLoad => "COMMIT_LOAD",
            Command::Abort => "ABORT",
            Command::ReportStatus => "REPORT_STATUS",
            Command::GetDeviceInfo => "GET_DEVICE_INFO",
        }
    }
}

impl FromStr for Command {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "INIT_LOAD" => Ok(Command::InitLoad),
            "SEND_LSE" => Ok(Command::SendLse),
            "VERIFY_LSE" => Ok(Command::VerifyLse),
            "COMMIT_LOAD" => Ok(Command::CommitLoad),
            "ABORT" => Ok(Command::Abort),
            "REPORT_STATUS" => Ok(Command::ReportStatus),
            "GET_DEVICE_INFO" => Ok(Command::GetDeviceInfo),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 제어 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Uninitialized,
    Initialized,
    LseDeclared,
    Verified,
    Committed,
    /// ABORT 이후. 선행 조건상 UNINITIALIZED와 동일하게 취급
    Aborted,
}

impl SessionState {
    /// current_lse 를 가질 수 있는 상태인지
    pub fn holds_lse(&self) -> bool {
        matches!(
            self,
            SessionState::LseDeclared | SessionState::Verified | SessionState::Committed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Uninitialized => write!(f, "UNINITIALIZED"),
            SessionState::Initialized => write!(f, "INITIALIZED"),
            SessionState::LseDeclared => write!(f, "LSE_DECLARED"),
            SessionState::Verified => write!(f, "VERIFIED"),
            SessionState::Committed => write!(f, "COMMITTED"),
            SessionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// 세션 필드 스냅샷 (상태 비교용)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: u32,
    pub state: SessionState,
    pub current_lse: Option<LseDescriptor>,
}

/// 제어 세션
pub struct ControlSession {
    session_id: u32,
    state: SessionState,
    device_id: String,
    device_version: String,
    current_lse: Option<LseDescriptor>,
    lse_seq: u32,
    registry: SharedRegistry,
    transfer_tx: Option<mpsc::Sender<TransferCmd>>,
}

impl ControlSession {
    pub fn new(config: &Config, registry: SharedRegistry) -> Self {
        Self {
            session_id: 0,
            state: SessionState::Uninitialized,
            device_id: config.device_id.clone(),
            device_version: config.device_version.clone(),
            current_lse: None,
            lse_seq: 0,
            registry,
            transfer_tx: None,
        }
    }

    /// ABORT 시 데이터 평면으로 전송 폐기 명령을 보낼 채널 연결
    pub fn with_transfer_control(mut self, tx: mpsc::Sender<TransferCmd>) -> Self {
        self.transfer_tx = Some(tx);
        self
    }

    /// 명령 텍스트 하나 처리
    pub fn handle(&mut self, text: &str) -> Response {
        let fields = match envelope::parse(text) {
            Ok(fields) => fields,
            Err(e) => {
                warn!("Malformed command envelope: {}", e);
                return Response::error("Malformed command envelope");
            }
        };

        let Some(command) = fields
            .get("command")
            .and_then(|c| c.parse::<Command>().ok())
        else {
            warn!("Unknown command: {:?}", fields.get("command"));
            return Response::error("Unknown command");
        };

        self.dispatch(command, &fields)
    }

    /// 파싱된 명령 실행
    pub fn dispatch(&mut self, command: Command, fields: &Fields) -> Response {
        info!("Received command: {} (state {})", command, self.state);

        let response = match command {
            Command::InitLoad => self.init_load(),
            Command::SendLse => self.send_lse(fields),
            Command::VerifyLse => self.verify_lse(),
            Command::CommitLoad => self.commit_load(),
            Command::Abort => self.abort(),
            Command::ReportStatus => self.report_status(),
            Command::GetDeviceInfo => self.device_info(),
        };

        debug!("{} -> {}", command, response.to_text());
        response
    }

    fn init_load(&mut self) -> Response {
        self.clear_lse();
        self.session_id = rand::thread_rng().gen_range(1..=u32::MAX);
        self.state = SessionState::Initialized;

        info!("Session {} initialized", self.session_id);
        Response::ok()
            .with("message", format!("Session {} initialized", self.session_id))
            .with("session_id", self.session_id)
    }

    fn send_lse(&mut self, fields: &Fields) -> Response {
        let file_name = fields.get("file_name").map(|s| s.trim()).filter(|s| !s.is_empty());
        let crc32 = fields.get("crc32").and_then(|s| parse_u32(s));

        let (Some(file_name), Some(declared_crc32)) = (file_name, crc32) else {
            return Response::error("Missing file_name or crc32");
        };

        let memory_address = match fields.get("memory_address").or_else(|| fields.get("memory")) {
            Some(text) => match parse_u32(text) {
                Some(addr) => addr,
                None => return Response::error("Invalid memory_address"),
            },
            None => 0,
        };

        self.clear_lse();
        self.lse_seq += 1;

        let lse = LseDescriptor {
            lse_id: format!("LSE{}", self.lse_seq),
            file_name: file_name.to_string(),
            version: fields.get("version").cloned(),
            memory_address,
            declared_crc32,
        };

        info!(
            "{} declared: {} @ 0x{:08X}, CRC32 0x{:08X}",
            lse.lse_id, lse.file_name, lse.memory_address, lse.declared_crc32
        );

        self.registry.declare(&lse);
        let response = Response::ok()
            .with("message", format!("LSE {} accepted", lse.file_name))
            .with("lse_id", lse.lse_id.clone());

        self.current_lse = Some(lse);
        self.state = SessionState::LseDeclared;
        response
    }

    fn verify_lse(&mut self) -> Response {
        let Some(lse) = self.current_lse.as_ref() else {
            return Response::error("No LSE declared");
        };

        match self.registry.reconciliation_for(lse) {
            Some((result, _)) if result.ok => {
                info!("{} verified ({})", lse.lse_id, lse.file_name);
                let response = Response::ok()
                    .with("message", format!("LSE {} verified", lse.file_name))
                    .with("lse_id", lse.lse_id.clone());
                if self.state == SessionState::LseDeclared {
                    self.state = SessionState::Verified;
                }
                response
            }
            Some((_, transfer)) => {
                warn!(
                    "{} verification failed: declared 0x{:08X}, computed 0x{:08X}",
                    lse.lse_id, lse.declared_crc32, transfer.crc32
                );
                Response::error(format!(
                    "LSE {} CRC mismatch: declared 0x{:08X}, computed 0x{:08X}",
                    lse.file_name, lse.declared_crc32, transfer.crc32
                ))
            }
            None => Response::ok()
                .with(
                    "message",
                    format!("LSE {} declared, awaiting transfer", lse.file_name),
                )
                .with("lse_id", lse.lse_id.clone()),
        }
    }

    fn commit_load(&mut self) -> Response {
        // VERIFY_LSE 이후 같은 파일이 다시 전송됐을 수 있으므로 커밋 직전에 재대조
        let reconciled = self
            .current_lse
            .as_ref()
            .and_then(|lse| self.registry.reconciliation_for(lse))
            .is_some_and(|(result, _)| result.ok);

        match self.state {
            SessionState::Verified | SessionState::Committed if reconciled => {
                self.state = SessionState::Committed;
                info!("Session {} committed", self.session_id);
                Response::ok().with("message", format!("Session {} committed", self.session_id))
            }
            state => {
                warn!("COMMIT_LOAD rejected in state {} (reconciled: {})", state, reconciled);
                Response::error("No verified LSE to commit")
            }
        }
    }

    fn abort(&mut self) -> Response {
        self.clear_lse();
        self.session_id = 0;
        self.state = SessionState::Aborted;

        if let Some(tx) = &self.transfer_tx {
            if let Err(e) = tx.try_send(TransferCmd::Abort) {
                warn!("전송 폐기 명령 전달 실패: {}", e);
            }
        }

        info!("Session aborted");
        Response::ok().with("message", "Aborted")
    }

    fn report_status(&self) -> Response {
        let last = self.registry.last_transfer();
        let (file, transfer) = match (&self.current_lse, &last) {
            (Some(lse), _) => (
                lse.file_name.as_str(),
                self.registry.transfer_status(&lse.file_name),
            ),
            // 선언 없이 들어온 전송도 상태로 노출
            (None, Some((_, status))) => ("", *status),
            (None, None) => ("", TransferStatus::None),
        };

        let mut response = Response::ok()
            .with("session", self.session_id)
            .with("file", file)
            .with("committed", self.is_committed())
            .with("state", self.state.to_string())
            .with("transfer", transfer.to_string());
        if let Some((name, _)) = last {
            response = response.with("last_transfer", name);
        }
        response
    }

    fn device_info(&self) -> Response {
        Response::ok()
            .with("device", self.device_id.clone())
            .with("version", self.device_version.clone())
    }

    fn clear_lse(&mut self) {
        if let Some(lse) = self.current_lse.take() {
            self.registry.withdraw(&lse.file_name);
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_committed(&self) -> bool {
        self.state == SessionState::Committed
    }

    pub fn current_lse(&self) -> Option<&LseDescriptor> {
        self.current_lse.as_ref()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id,
            state: self.state,
            current_lse: self.current_lse.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Status;
    use crate::registry::{CompletedTransfer, Registry};

    const BOOT_CRC: u32 = 305_419_896;

    fn session() -> (ControlSession, SharedRegistry) {
        let registry = Registry::shared();
        (ControlSession::new(&Config::default(), registry.clone()), registry)
    }

    fn send(session: &mut ControlSession, text: &str) -> Response {
        let response = session.handle(text);
        assert!(session.state().holds_lse() == session.current_lse().is_some());
        response
    }

    fn declare_boot(session: &mut ControlSession) -> Response {
        send(
            session,
            r#"{"command":"SEND_LSE","file_name":"fcc1_boot.sre","memory_address":"0x08000000","crc32":305419896}"#,
        )
    }

    fn complete(registry: &SharedRegistry, crc: u32) {
        registry.on_transfer_complete(CompletedTransfer {
            file_name: "fcc1_boot.sre".into(),
            crc32: crc,
            total_bytes: 1024,
            trailer_ok: true,
        });
    }

    #[test]
    fn test_init_load_assigns_session() {
        let (mut session, _) = session();
        let response = send(&mut session, r#"{"command":"INIT_LOAD"}"#);

        assert!(response.is_ok());
        let id = response.get_u64("session_id").unwrap();
        assert_ne!(id, 0);
        assert_eq!(id as u32, session.session_id());
        assert_eq!(session.state(), SessionState::Initialized);
    }

    #[test]
    fn test_send_lse_then_report_status() {
        let (mut session, _) = session();
        send(&mut session, r#"{"command":"INIT_LOAD"}"#);
        let accepted = declare_boot(&mut session);

        assert!(accepted.is_ok());
        assert_eq!(accepted.message(), Some("LSE fcc1_boot.sre accepted"));
        assert_eq!(accepted.get_str("lse_id"), Some("LSE1"));

        let lse = session.current_lse().unwrap();
        assert_eq!(lse.declared_crc32, BOOT_CRC);
        assert_eq!(lse.memory_address, 0x0800_0000);

        let status = send(&mut session, r#"{"command":"REPORT_STATUS"}"#);
        assert!(status.is_ok());
        assert_eq!(status.get_str("file"), Some("fcc1_boot.sre"));
        assert_eq!(status.get_bool("committed"), Some(false));
        assert_eq!(status.get_str("state"), Some("LSE_DECLARED"));
        assert_eq!(status.get_str("transfer"), Some("none"));
    }

    #[test]
    fn test_send_lse_accepts_string_crc() {
        let (mut session, _) = session();
        let response = send(
            &mut session,
            r#"{"command":"SEND_LSE","file_name":"app.bin","crc32":"0xDEADBEEF","memory":"134217728","version":"2.1"}"#,
        );

        assert!(response.is_ok());
        let lse = session.current_lse().unwrap();
        assert_eq!(lse.declared_crc32, 0xDEAD_BEEF);
        assert_eq!(lse.memory_address, 0x0800_0000);
        assert_eq!(lse.version.as_deref(), Some("2.1"));
    }

    #[test]
    fn test_send_lse_missing_fields() {
        let (mut session, _) = session();
        for text in [
            r#"{"command":"SEND_LSE","crc32":1}"#,
            r#"{"command":"SEND_LSE","file_name":"a.bin"}"#,
            r#"{"command":"SEND_LSE","file_name":"a.bin","crc32":"abc"}"#,
            r#"{"command":"SEND_LSE","file_name":"","crc32":1}"#,
        ] {
            let response = send(&mut session, text);
            assert_eq!(response.status, Status::Error, "{}", text);
            assert_eq!(response.message(), Some("Missing file_name or crc32"));
        }
        assert!(session.current_lse().is_none());
    }

    #[test]
    fn test_send_lse_invalid_memory_address() {
        let (mut session, _) = session();
        let response = send(
            &mut session,
            r#"{"command":"SEND_LSE","file_name":"a.bin","crc32":1,"memory_address":"nowhere"}"#,
        );
        assert_eq!(response.status, Status::Error);
        assert!(session.current_lse().is_none());
    }

    #[test]
    fn test_send_lse_overwrite() {
        let (mut session, registry) = session();
        declare_boot(&mut session);
        send(&mut session, r#"{"command":"SEND_LSE","file_name":"other.bin","crc32":7}"#);

        assert_eq!(session.current_lse().unwrap().lse_id, "LSE2");
        // 이전 선언은 철회됨
        complete(&registry, BOOT_CRC);
        assert_eq!(
            registry.transfer_status("fcc1_boot.sre"),
            TransferStatus::Unverified
        );
    }

    #[test]
    fn test_verify_without_lse() {
        let (mut session, _) = session();
        let response = send(&mut session, r#"{"command":"VERIFY_LSE"}"#);
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.message(), Some("No LSE declared"));
    }

    #[test]
    fn test_verify_before_transfer() {
        let (mut session, _) = session();
        declare_boot(&mut session);

        let response = send(&mut session, r#"{"command":"VERIFY_LSE"}"#);
        assert!(response.is_ok());
        assert_eq!(session.state(), SessionState::LseDeclared);
    }

    #[test]
    fn test_verify_after_matching_transfer() {
        let (mut session, registry) = session();
        send(&mut session, r#"{"command":"INIT_LOAD"}"#);
        declare_boot(&mut session);
        complete(&registry, BOOT_CRC);

        let response = send(&mut session, r#"{"command":"VERIFY_LSE"}"#);
        assert!(response.is_ok());
        assert_eq!(response.message(), Some("LSE fcc1_boot.sre verified"));
        assert_eq!(session.state(), SessionState::Verified);

        let status = send(&mut session, r#"{"command":"REPORT_STATUS"}"#);
        assert_eq!(status.get_str("transfer"), Some("verified"));
    }

    #[test]
    fn test_verify_after_mismatched_transfer() {
        let (mut session, registry) = session();
        declare_boot(&mut session);
        complete(&registry, BOOT_CRC ^ 1);

        let response = send(&mut session, r#"{"command":"VERIFY_LSE"}"#);
        assert_eq!(response.status, Status::Error);
        assert!(response.message().unwrap().contains("CRC mismatch"));
        assert_eq!(session.state(), SessionState::LseDeclared);

        let commit = send(&mut session, r#"{"command":"COMMIT_LOAD"}"#);
        assert_eq!(commit.status, Status::Error);
        assert!(!session.is_committed());
    }

    #[test]
    fn test_commit_requires_verified() {
        let (mut session, _) = session();
        send(&mut session, r#"{"command":"INIT_LOAD"}"#);
        let before = session.snapshot();

        let response = send(&mut session, r#"{"command":"COMMIT_LOAD"}"#);
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.message(), Some("No verified LSE to commit"));
        assert_eq!(session.snapshot(), before);
    }

    #[test]
    fn test_abort_after_commit() {
        let (mut session, registry) = session();
        send(&mut session, r#"{"command":"INIT_LOAD"}"#);
        declare_boot(&mut session);
        complete(&registry, BOOT_CRC);
        send(&mut session, r#"{"command":"VERIFY_LSE"}"#);

        let commit = send(&mut session, r#"{"command":"COMMIT_LOAD"}"#);
        assert!(commit.is_ok());
        let expected = format!("Session {} committed", session.session_id());
        assert_eq!(commit.message(), Some(expected.as_str()));
        assert!(session.is_committed());

        let abort = send(&mut session, r#"{"command":"ABORT","reason":"User request"}"#);
        assert!(abort.is_ok());

        let status = send(&mut session, r#"{"command":"REPORT_STATUS"}"#);
        assert_eq!(status.get_u64("session"), Some(0));
        assert_eq!(status.get_str("file"), Some(""));
        assert_eq!(status.get_bool("committed"), Some(false));
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn test_abort_signals_data_plane() {
        let registry = Registry::shared();
        let (tx, mut rx) = mpsc::channel(4);
        let mut session =
            ControlSession::new(&Config::default(), registry).with_transfer_control(tx);

        send(&mut session, r#"{"command":"ABORT"}"#);
        assert_eq!(rx.try_recv().ok(), Some(TransferCmd::Abort));
    }

    #[test]
    fn test_unknown_command_no_mutation() {
        let (mut session, _) = session();
        send(&mut session, r#"{"command":"INIT_LOAD"}"#);
        declare_boot(&mut session);
        let before = session.snapshot();

        for text in [r#"{"command":"REBOOT"}"#, r#"{"file_name":"x"}"#] {
            let response = send(&mut session, text);
            assert_eq!(response.status, Status::Error);
            assert_eq!(response.message(), Some("Unknown command"));
        }
        assert_eq!(session.snapshot(), before);
    }

    #[test]
    fn test_malformed_envelope() {
        let (mut session, _) = session();
        let response = send(&mut session, "INIT_LOAD please");
        assert_eq!(response.status, Status::Error);
        assert_eq!(session.session_id(), 0);
    }

    #[test]
    fn test_report_status_shows_undeclared_transfer() {
        let (mut session, registry) = session();
        send(&mut session, r#"{"command":"INIT_LOAD"}"#);
        registry.on_transfer_complete(CompletedTransfer {
            file_name: "orphan.bin".into(),
            crc32: 0x1234,
            total_bytes: 10,
            trailer_ok: true,
        });

        let status = send(&mut session, r#"{"command":"REPORT_STATUS"}"#);
        assert_eq!(status.get_str("file"), Some(""));
        assert_eq!(status.get_str("transfer"), Some("file transferred, not verified"));
        assert_eq!(status.get_str("last_transfer"), Some("orphan.bin"));
    }

    #[test]
    fn test_commit_rejected_after_failed_retransfer() {
        let (mut session, registry) = session();
        send(&mut session, r#"{"command":"INIT_LOAD"}"#);
        declare_boot(&mut session);
        complete(&registry, BOOT_CRC);
        send(&mut session, r#"{"command":"VERIFY_LSE"}"#);
        assert_eq!(session.state(), SessionState::Verified);

        // 같은 파일이 다시 전송되어 트레일러 검사에 실패
        registry.forget_transfer("fcc1_boot.sre");
        registry.on_transfer_complete(CompletedTransfer {
            file_name: "fcc1_boot.sre".into(),
            crc32: 0xBAD,
            total_bytes: 1024,
            trailer_ok: false,
        });
        let before = session.snapshot();

        let commit = send(&mut session, r#"{"command":"COMMIT_LOAD"}"#);
        assert_eq!(commit.status, Status::Error);
        assert_eq!(commit.message(), Some("No verified LSE to commit"));
        assert!(!session.is_committed());
        assert_eq!(session.snapshot(), before);
    }

    #[test]
    fn test_status_echoes_declared_path() {
        let (mut session, registry) = session();
        send(&mut session, r#"{"command":"INIT_LOAD"}"#);
        send(
            &mut session,
            r#"{"command":"SEND_LSE","file_name":"images/fcc1_boot.sre","crc32":305419896}"#,
        );
        complete(&registry, BOOT_CRC);

        let status = send(&mut session, r#"{"command":"REPORT_STATUS"}"#);
        assert_eq!(status.get_str("file"), Some("images/fcc1_boot.sre"));
        assert_eq!(status.get_str("transfer"), Some("verified"));

        let verify = send(&mut session, r#"{"command":"VERIFY_LSE"}"#);
        assert!(verify.is_ok());
        assert_eq!(session.state(), SessionState::Verified);
    }

    #[test]
    fn test_device_info() {
        let (mut session, _) = session();
        let response = send(&mut session, r#"{"command":"GET_DEVICE_INFO"}"#);
        assert_eq!(response.get_str("device"), Some("FCC1"));
        assert_eq!(response.get_str("version"), Some("v1.0"));
    }
}
