//! 제어 평면 명령/응답 봉투
//!
//! 요청: 평평한 JSON 객체 `{"command": "...", "file_name": "...", "crc32": ...}`
//! 응답: `{"status": "OK" | "ERROR", ...필드}`
//!
//! 요청 값은 모두 문자열로 정규화됨 (숫자로 오든 문자열로 오든 같은 처리)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// 키/값 필드
pub type Fields = BTreeMap<String, String>;

/// 요청 봉투 파싱
pub fn parse(text: &str) -> Result<Fields> {
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    let value: Value = serde_json::from_str(text)?;

    let Value::Object(map) = value else {
        return Err(Error::Protocol("명령 봉투는 JSON 객체여야 함".into()));
    };

    Ok(map
        .into_iter()
        .filter_map(|(key, value)| {
            let text = match value {
                Value::Null => return None,
                Value::String(s) => s,
                other => other.to_string(),
            };
            Some((key, text))
        })
        .collect())
}

/// 누적된 바이트가 완결된 JSON 값인지 (제어 연결 수신 종료 판단용)
pub fn is_complete(bytes: &[u8]) -> bool {
    let end = bytes
        .iter()
        .rposition(|&b| b != 0 && !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    end > 0 && serde_json::from_slice::<serde::de::IgnoredAny>(&bytes[..end]).is_ok()
}

/// 10진수 또는 `0x` 16진수 u32 파싱
pub fn parse_u32(text: &str) -> Option<u32> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// 응답 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Error,
}

/// 응답 봉투
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            fields: Map::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            fields: Map::new(),
        }
        .with("message", message.into())
    }

    /// 필드 추가
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn message(&self) -> Option<&str> {
        self.get_str("message")
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    /// 한 줄 JSON 텍스트로 직렬화
    pub fn to_text(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"status":"ERROR","message":"Internal error"}"#.to_string())
    }

    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text.trim_matches(|c: char| c == '\0' || c.is_whitespace()))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_values() {
        let fields = parse(
            r#"{"command": "SEND_LSE", "file_name": "fcc1_boot.sre", "crc32": 305419896, "memory": "0x08000000", "x": null}"#,
        )
        .unwrap();

        assert_eq!(fields.get("command").map(String::as_str), Some("SEND_LSE"));
        assert_eq!(fields.get("file_name").map(String::as_str), Some("fcc1_boot.sre"));
        assert_eq!(fields.get("crc32").map(String::as_str), Some("305419896"));
        assert_eq!(fields.get("memory").map(String::as_str), Some("0x08000000"));
        assert!(!fields.contains_key("x"));
    }

    #[test]
    fn test_parse_tolerates_trailing_nul() {
        let fields = parse("{\"command\":\"ABORT\"}\0\n").unwrap();
        assert_eq!(fields.get("command").map(String::as_str), Some("ABORT"));
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(matches!(parse("[1, 2]"), Err(Error::Protocol(_))));
        assert!(matches!(parse("INIT_LOAD"), Err(Error::Envelope(_))));
    }

    #[test]
    fn test_is_complete() {
        assert!(is_complete(b"{\"command\":\"ABORT\"}\0\n"));
        assert!(!is_complete(b"{\"command\":\"ABO"));
        assert!(!is_complete(b""));
        assert!(!is_complete(b"\0\0"));
    }

    #[test]
    fn test_parse_u32() {
        assert_eq!(parse_u32("305419896"), Some(0x1234_5678));
        assert_eq!(parse_u32("0x08000000"), Some(0x0800_0000));
        assert_eq!(parse_u32("0XFF"), Some(255));
        assert_eq!(parse_u32("-1"), None);
        assert_eq!(parse_u32("4294967296"), None);
        assert_eq!(parse_u32("1.5"), None);
    }

    #[test]
    fn test_response_layout() {
        let text = Response::ok().with("session_id", 12345u32).to_text();
        assert_eq!(text, r#"{"status":"OK","session_id":12345}"#);

        let err = Response::error("Unknown command");
        assert_eq!(
            err.to_text(),
            r#"{"status":"ERROR","message":"Unknown command"}"#
        );

        let back = Response::from_text(&err.to_text()).unwrap();
        assert_eq!(back.status, Status::Error);
        assert_eq!(back.message(), Some("Unknown command"));
    }
}
