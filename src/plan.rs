//! 로드 플랜 (여러 소프트웨어 요소를 순서대로 로드)
//!
//! ```xml
//! <loadplan>
//!   <component lse="LSE_BOOT" device="FCC1" version="1.0.0"
//!              file="fcc1_boot.sre" memory="0x08000000" crc32="0x12345678"/>
//! </loadplan>
//! ```
//!
//! `file`은 플랜 파일 기준 상대 경로. `crc32`가 없으면 이미지에서 계산한 값을 선언함.

use std::path::{Path, PathBuf};
use std::str;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::envelope::parse_u32;
use crate::{Error, Result};

/// 플랜의 요소 하나
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanComponent {
    /// 플랜상의 LSE 이름 (로그용, 서버 lse_id 와는 별개)
    pub lse: Option<String>,

    /// 대상 장치 ID. 지정되면 타깃의 GET_DEVICE_INFO 와 일치해야 함
    pub device: Option<String>,

    pub version: Option<String>,
    pub file: PathBuf,
    pub memory_address: u32,

    /// 선언할 CRC (없으면 이미지 CRC)
    pub crc32: Option<u32>,
}

impl PlanComponent {
    /// 타깃에 선언할 파일명 (경로의 마지막 요소)
    pub fn file_name(&self) -> String {
        self.file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// 로드 플랜
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadPlan {
    pub components: Vec<PlanComponent>,
}

impl LoadPlan {
    /// 플랜 파일 읽기
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base_dir)
    }

    /// XML 텍스트 파싱, 상대 경로는 `base_dir` 기준으로 변환
    pub fn parse(xml: &str, base_dir: &Path) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut plan = LoadPlan::default();

        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                    if e.name().as_ref() == b"component" {
                        plan.components.push(parse_component(e, base_dir)?);
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(Error::Plan(format!(
                        "XML 에러 (위치 {}): {}",
                        reader.buffer_position(),
                        e
                    )))
                }
                _ => {}
            }
        }

        if plan.components.is_empty() {
            return Err(Error::Plan("component 요소가 없음".into()));
        }
        Ok(plan)
    }
}

fn parse_component(e: &BytesStart, base_dir: &Path) -> Result<PlanComponent> {
    let mut lse = None;
    let mut device = None;
    let mut version = None;
    let mut file = None;
    let mut memory = None;
    let mut crc32 = None;

    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::Plan(e.to_string()))?;
        let key = str::from_utf8(attr.key.as_ref()).unwrap_or("");
        let val = attr
            .unescape_value()
            .map_err(|e| Error::Plan(e.to_string()))?
            .trim()
            .to_string();

        match key {
            "lse" => lse = Some(val),
            "device" => device = Some(val),
            "version" => version = Some(val),
            "file" => file = Some(val),
            "memory" => memory = Some(val),
            "crc32" => crc32 = Some(val),
            _ => {}
        }
    }

    let file = file
        .filter(|f| !f.is_empty())
        .ok_or_else(|| Error::Plan("component에 file 속성이 없음".into()))?;

    let memory_address = match memory {
        Some(text) => {
            parse_u32(&text).ok_or_else(|| Error::Plan(format!("잘못된 memory 값: {}", text)))?
        }
        None => 0,
    };

    let crc32 = match crc32 {
        Some(text) => Some(
            parse_u32(&text).ok_or_else(|| Error::Plan(format!("잘못된 crc32 값: {}", text)))?,
        ),
        None => None,
    };

    Ok(PlanComponent {
        lse,
        device,
        version,
        file: base_dir.join(file),
        memory_address,
        crc32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"<?xml version="1.0"?>
<loadplan>
  <component lse="LSE_BOOT" device="FCC1" version="1.0.0"
             file="fcc1_boot.sre" memory="0x08000000" crc32="305419896"/>
  <component lse="LSE_APP" file="/opt/images/app.bin"></component>
</loadplan>"#;

    #[test]
    fn test_parse_components() {
        let plan = LoadPlan::parse(PLAN, Path::new("/plans")).unwrap();
        assert_eq!(plan.components.len(), 2);

        let boot = &plan.components[0];
        assert_eq!(boot.lse.as_deref(), Some("LSE_BOOT"));
        assert_eq!(boot.device.as_deref(), Some("FCC1"));
        assert_eq!(boot.version.as_deref(), Some("1.0.0"));
        assert_eq!(boot.file, PathBuf::from("/plans/fcc1_boot.sre"));
        assert_eq!(boot.file_name(), "fcc1_boot.sre");
        assert_eq!(boot.memory_address, 0x0800_0000);
        assert_eq!(boot.crc32, Some(0x1234_5678));

        let app = &plan.components[1];
        assert_eq!(app.file, PathBuf::from("/opt/images/app.bin"));
        assert_eq!(app.memory_address, 0);
        assert_eq!(app.crc32, None);
        assert_eq!(app.device, None);
    }

    #[test]
    fn test_missing_file_attribute() {
        let err = LoadPlan::parse(r#"<loadplan><component lse="X"/></loadplan>"#, Path::new("."));
        assert!(matches!(err, Err(Error::Plan(_))));
    }

    #[test]
    fn test_invalid_numbers() {
        for xml in [
            r#"<loadplan><component file="a.bin" memory="flash"/></loadplan>"#,
            r#"<loadplan><component file="a.bin" crc32="0xZZ"/></loadplan>"#,
        ] {
            assert!(matches!(LoadPlan::parse(xml, Path::new(".")), Err(Error::Plan(_))));
        }
    }

    #[test]
    fn test_empty_plan_rejected() {
        assert!(LoadPlan::parse("<loadplan/>", Path::new(".")).is_err());
    }

    #[test]
    fn test_load_resolves_relative_to_plan_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.xml");
        std::fs::write(&path, PLAN).unwrap();

        let plan = LoadPlan::load(&path).unwrap();
        assert_eq!(plan.components[0].file, dir.path().join("fcc1_boot.sre"));
    }
}
