//! 수신 이미지 저장 싱크
//!
//! 전송 세션 하나당 open → write* → close 순서로 정확히 한 번 사용됨.
//! 싱크는 기록한 바이트로 자체 CRC를 계산하여 close 시 반환함.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{Error, Result};

/// 파일명이 비었을 때 사용하는 기본 이름
pub const FALLBACK_FILE_NAME: &str = "received.sre";

/// close 시 반환되는 요약
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkSummary {
    /// 기록된 바이트 전체의 CRC-32
    pub crc32: u32,

    /// 기록된 총 바이트 수
    pub total_bytes: u64,
}

/// 이미지 저장소 인터페이스
pub trait ImageSink: Send {
    /// 새 이미지 열기 (이미 열려 있으면 에러)
    fn open(&mut self, name: &str) -> Result<()>;

    /// 열린 이미지에 추가 기록
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// 이미지 닫기
    fn close(&mut self) -> Result<SinkSummary>;

    /// 열린 이미지가 있는지
    fn is_open(&self) -> bool;
}

/// 요청 파일명에서 마지막 경로 요소만 추출
pub fn sanitize_file_name(name: &str) -> String {
    Path::new(name.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or(FALLBACK_FILE_NAME)
        .to_string()
}

struct OpenFile {
    path: PathBuf,
    writer: BufWriter<File>,
    hasher: crc32fast::Hasher,
    total_bytes: u64,
}

/// 디렉터리 아래에 이미지를 파일로 저장하는 싱크
pub struct FileSink {
    dir: PathBuf,
    current: Option<OpenFile>,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            current: None,
        }
    }

    /// 현재 열린 파일 경로
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|f| f.path.as_path())
    }
}

impl ImageSink for FileSink {
    fn open(&mut self, name: &str) -> Result<()> {
        if self.current.is_some() {
            return Err(Error::Resource("이미 열린 이미지가 있음".into()));
        }

        let path = self.dir.join(sanitize_file_name(name));
        let file = File::create(&path)
            .map_err(|e| Error::Resource(format!("{}: {}", path.display(), e)))?;

        debug!("Sink opened: {}", path.display());
        self.current = Some(OpenFile {
            path,
            writer: BufWriter::new(file),
            hasher: crc32fast::Hasher::new(),
            total_bytes: 0,
        });
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let open = self
            .current
            .as_mut()
            .ok_or_else(|| Error::Resource("열린 이미지 없음".into()))?;

        open.writer.write_all(data)?;
        open.hasher.update(data);
        open.total_bytes += data.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> Result<SinkSummary> {
        let mut open = self
            .current
            .take()
            .ok_or_else(|| Error::Resource("열린 이미지 없음".into()))?;

        open.writer.flush()?;
        let summary = SinkSummary {
            crc32: open.hasher.finalize(),
            total_bytes: open.total_bytes,
        };

        info!(
            "Image stored: {} ({} bytes, CRC32 0x{:08X})",
            open.path.display(),
            summary.total_bytes,
            summary.crc32
        );
        Ok(summary)
    }

    fn is_open(&self) -> bool {
        self.current.is_some()
    }
}

/// 메모리 이미지 저장소 (싱크와 공유)
pub type MemoryStore = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// 메모리 싱크 (테스트 / 시뮬레이션용)
///
/// 기록 즉시 공유 저장소에 반영되므로 close 전에도 내용을 확인할 수 있음
pub struct MemorySink {
    store: MemoryStore,
    current: Option<(String, crc32fast::Hasher, BytesMut)>,
    fail_open: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(HashMap::new())),
            current: None,
            fail_open: false,
        }
    }

    /// open이 항상 실패하는 싱크
    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::new()
        }
    }

    /// 공유 저장소 핸들
    pub fn store(&self) -> MemoryStore {
        self.store.clone()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageSink for MemorySink {
    fn open(&mut self, name: &str) -> Result<()> {
        if self.fail_open {
            return Err(Error::Resource(format!("{}: 저장소 사용 불가", name)));
        }
        if self.current.is_some() {
            return Err(Error::Resource("이미 열린 이미지가 있음".into()));
        }

        let name = sanitize_file_name(name);
        self.store.lock().insert(name.clone(), Vec::new());
        self.current = Some((name, crc32fast::Hasher::new(), BytesMut::new()));
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let (name, hasher, buf) = self
            .current
            .as_mut()
            .ok_or_else(|| Error::Resource("열린 이미지 없음".into()))?;

        hasher.update(data);
        buf.extend_from_slice(data);
        if let Some(image) = self.store.lock().get_mut(name.as_str()) {
            image.extend_from_slice(data);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<SinkSummary> {
        let (_, hasher, buf) = self
            .current
            .take()
            .ok_or_else(|| Error::Resource("열린 이미지 없음".into()))?;

        Ok(SinkSummary {
            crc32: hasher.finalize(),
            total_bytes: buf.len() as u64,
        })
    }

    fn is_open(&self) -> bool {
        self.current.is_some()
    }
}
