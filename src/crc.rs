//! 테이블 기반 CRC-32 (ISO-HDLC, 반사 다항식 0xEDB88320)
//!
//! 데이터 평면과 제어 평면이 같은 엔진을 사용함.
//! 누산기를 명시적으로 넘겨 주므로 블록 단위 증분 계산이 가능함.

use std::sync::OnceLock;

/// 반사된 CRC-32 다항식
pub const POLYNOMIAL: u32 = 0xEDB8_8320;

static TABLE: OnceLock<[u32; 256]> = OnceLock::new();

fn make_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let mut c = i as u32;
        for _ in 0..8 {
            c = if c & 1 != 0 { POLYNOMIAL ^ (c >> 1) } else { c >> 1 };
        }
        *slot = c;
    }
    table
}

/// 룩업 테이블 (최초 호출 시 한 번만 생성, 이후 읽기 전용)
fn table() -> &'static [u32; 256] {
    TABLE.get_or_init(make_table)
}

/// 테이블을 미리 생성 (리스너 시작 전에 호출)
pub fn warm_up() {
    let _ = table();
}

/// `crc`에 `buf`를 누적한 새 CRC 값 반환
///
/// 첫 호출은 `crc = 0`으로 시작. 반환값을 다음 호출의 누산기로 넘기면
/// 전체 버퍼를 한 번에 계산한 것과 같은 결과가 나옴.
pub fn crc32(crc: u32, buf: &[u8]) -> u32 {
    let table = table();
    let mut c = crc ^ 0xFFFF_FFFF;
    for &b in buf {
        c = table[((c ^ b as u32) & 0xFF) as usize] ^ (c >> 8);
    }
    c ^ 0xFFFF_FFFF
}
