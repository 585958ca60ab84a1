//! 소프트웨어 요소(LSE) 레지스트리
//!
//! 제어 평면이 선언한 LSE와 데이터 평면이 수신한 이미지를 파일명으로 묶고
//! 선언 CRC와 계산 CRC를 대조(reconciliation)함.
//! 어느 세션도 소유하지 않으며, 모든 변경은 단일 락 안에서 수행됨.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::sink::sanitize_file_name;

/// 레지스트리 공유 핸들
pub type SharedRegistry = Arc<Registry>;

/// 로드 대상 소프트웨어 요소 기술자 (생성 후 불변)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LseDescriptor {
    /// 서버가 부여한 ID (SEND_LSE 수락 시)
    pub lse_id: String,
    pub file_name: String,
    pub version: Option<String>,
    pub memory_address: u32,
    pub declared_crc32: u32,
}

/// 데이터 평면이 보고하는 완료된 전송
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub file_name: String,

    /// 수신 스트림으로 계산한 CRC
    pub crc32: u32,

    pub total_bytes: u64,

    /// 클라이언트 트레일러 체크섬과 일치했는지
    pub trailer_ok: bool,
}

/// 대조 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// 일치하는 선언이 있었다면 그 LSE ID
    pub matched_lse_id: Option<String>,
    pub ok: bool,
}

/// 파일별 전송 상태 (REPORT_STATUS 노출용)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// 해당 파일 전송 기록 없음
    None,
    /// 선언과 일치
    Verified,
    /// 전송됐지만 대조할 선언이 없음
    Unverified,
    /// 선언 또는 트레일러와 불일치
    Mismatch,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::None => write!(f, "none"),
            TransferStatus::Verified => write!(f, "verified"),
            TransferStatus::Unverified => write!(f, "file transferred, not verified"),
            TransferStatus::Mismatch => write!(f, "checksum mismatch"),
        }
    }
}

#[derive(Debug, Clone)]
struct Declaration {
    lse_id: String,
    declared_crc32: u32,
}

#[derive(Default)]
struct RegistryInner {
    declarations: HashMap<String, Declaration>,
    transfers: HashMap<String, CompletedTransfer>,
    /// 가장 최근에 완료된 전송의 파일명
    last_completed: Option<String>,
}

impl RegistryInner {
    fn status_of(&self, key: &str) -> TransferStatus {
        let Some(transfer) = self.transfers.get(key) else {
            return TransferStatus::None;
        };

        match self.declarations.get(key) {
            Some(decl) if reconcile(Some(decl), transfer).ok => TransferStatus::Verified,
            Some(_) => TransferStatus::Mismatch,
            None if !transfer.trailer_ok => TransferStatus::Mismatch,
            None => TransferStatus::Unverified,
        }
    }
}

/// LSE 레지스트리
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

fn reconcile(declaration: Option<&Declaration>, transfer: &CompletedTransfer) -> Reconciliation {
    match declaration {
        Some(decl) => Reconciliation {
            matched_lse_id: Some(decl.lse_id.clone()),
            ok: transfer.trailer_ok && decl.declared_crc32 == transfer.crc32,
        },
        None => Reconciliation {
            matched_lse_id: None,
            ok: false,
        },
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(Self::new())
    }

    /// 선언 등록 (같은 파일명이면 덮어씀)
    ///
    /// 선언 파일명은 데이터 평면과 같은 규칙(마지막 경로 요소)으로 대조됨
    pub fn declare(&self, lse: &LseDescriptor) {
        let mut inner = self.inner.lock();
        inner.declarations.insert(
            sanitize_file_name(&lse.file_name),
            Declaration {
                lse_id: lse.lse_id.clone(),
                declared_crc32: lse.declared_crc32,
            },
        );
    }

    /// 선언 철회 (ABORT / SEND_LSE 덮어쓰기)
    pub fn withdraw(&self, file_name: &str) {
        self.inner
            .lock()
            .declarations
            .remove(&sanitize_file_name(file_name));
    }

    /// 데이터 평면 완료 보고
    ///
    /// 선언이 없어도 기록은 남김 (이후 SEND_LSE → VERIFY_LSE 에서 대조 가능)
    pub fn on_transfer_complete(&self, transfer: CompletedTransfer) -> Reconciliation {
        let mut inner = self.inner.lock();
        let result = reconcile(inner.declarations.get(&transfer.file_name), &transfer);

        match (&result.matched_lse_id, result.ok) {
            (Some(lse_id), true) => info!(
                "Reconciled {} with {}: CRC32 0x{:08X}",
                transfer.file_name, lse_id, transfer.crc32
            ),
            (Some(lse_id), false) => warn!(
                "Reconciliation failed for {} ({}): computed 0x{:08X}",
                transfer.file_name, lse_id, transfer.crc32
            ),
            (None, _) => info!(
                "{} transferred without declaration, not verified",
                transfer.file_name
            ),
        }

        inner.last_completed = Some(transfer.file_name.clone());
        inner.transfers.insert(transfer.file_name.clone(), transfer);
        result
    }

    /// 선언된 LSE에 대한 대조 결과 (전송 기록이 없으면 None)
    pub fn reconciliation_for(&self, lse: &LseDescriptor) -> Option<(Reconciliation, CompletedTransfer)> {
        let inner = self.inner.lock();
        let transfer = inner.transfers.get(&sanitize_file_name(&lse.file_name))?;
        let decl = Declaration {
            lse_id: lse.lse_id.clone(),
            declared_crc32: lse.declared_crc32,
        };
        Some((reconcile(Some(&decl), transfer), transfer.clone()))
    }

    /// 파일별 전송 상태
    pub fn transfer_status(&self, file_name: &str) -> TransferStatus {
        self.inner.lock().status_of(&sanitize_file_name(file_name))
    }

    /// 가장 최근에 완료된 전송의 파일명과 상태 (선언 여부와 무관)
    pub fn last_transfer(&self) -> Option<(String, TransferStatus)> {
        let inner = self.inner.lock();
        let key = inner.last_completed.as_ref()?;
        Some((key.clone(), inner.status_of(key)))
    }

    /// 해당 파일의 전송 기록
    pub fn transfer(&self, file_name: &str) -> Option<CompletedTransfer> {
        self.inner
            .lock()
            .transfers
            .get(&sanitize_file_name(file_name))
            .cloned()
    }

    /// 이미 저장된 전송 기록 삭제 (새 WRQ 시작 시)
    pub fn forget_transfer(&self, file_name: &str) {
        let key = sanitize_file_name(file_name);
        let mut inner = self.inner.lock();
        inner.transfers.remove(&key);
        if inner.last_completed.as_deref() == Some(key.as_str()) {
            inner.last_completed = None;
        }
    }
}
