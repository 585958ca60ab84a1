//! 데이터 평면 패킷 정의
//!
//! 고정 헤더: opcode(2) + block(2), 빅엔디언
//! - WRQ(2): 나머지는 NUL 종료 파일명
//! - DATA(3): 나머지는 페이로드 (최대 512 바이트)
//! - ACK(4): 서버 → 클라이언트
//! - CRC 트레일러(0x10): opcode 뒤 4바이트 빅엔디언 체크섬

use bytes::{BufMut, Bytes, BytesMut};

use crate::{BLOCK_SIZE, HEADER_SIZE};

/// 패킷 opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    /// 읽기 요청 (지원하지 않음)
    ReadRequest = 1,

    /// 쓰기 요청
    WriteRequest = 2,

    /// 데이터 블록
    Data = 3,

    /// 수신 확인
    Ack = 4,

    /// 에러
    Error = 5,

    /// 체크섬 트레일러 (비표준 확장)
    Trailer = 0x10,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Opcode::ReadRequest),
            2 => Some(Opcode::WriteRequest),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            0x10 => Some(Opcode::Trailer),
            _ => None,
        }
    }
}

/// 디코딩된 데이터 평면 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    WriteRequest { file_name: String },
    Data { block: u16, payload: Bytes },
    Ack { block: u16 },
    /// `crc32`가 None이면 트레일러가 잘림 (6바이트 미만)
    Trailer { crc32: Option<u32> },
    /// 인식은 되지만 처리하지 않는 opcode
    Unsupported(u16),
}

impl Packet {
    /// 데이터그램 디코딩
    ///
    /// 4바이트 미만이거나 알 수 없는 opcode, 512바이트 초과 페이로드는 None
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }

        let opcode = u16::from_be_bytes([bytes[0], bytes[1]]);
        let block = u16::from_be_bytes([bytes[2], bytes[3]]);

        match Opcode::from_u16(opcode)? {
            Opcode::WriteRequest => {
                let rest = &bytes[2..];
                let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                let file_name = String::from_utf8_lossy(&rest[..end]).into_owned();
                Some(Packet::WriteRequest { file_name })
            }
            Opcode::Data => {
                let payload = &bytes[HEADER_SIZE..];
                if payload.len() > BLOCK_SIZE {
                    return None;
                }
                Some(Packet::Data {
                    block,
                    payload: Bytes::copy_from_slice(payload),
                })
            }
            Opcode::Ack => Some(Packet::Ack { block }),
            Opcode::Trailer => {
                let crc32 = bytes
                    .get(2..6)
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]));
                Some(Packet::Trailer { crc32 })
            }
            Opcode::ReadRequest | Opcode::Error => Some(Packet::Unsupported(opcode)),
        }
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + BLOCK_SIZE);
        match self {
            Packet::WriteRequest { file_name } => {
                buf.put_u16(Opcode::WriteRequest as u16);
                buf.put_slice(file_name.as_bytes());
                buf.put_u8(0);
                buf.put_slice(b"octet");
                buf.put_u8(0);
            }
            Packet::Data { block, payload } => {
                buf.put_u16(Opcode::Data as u16);
                buf.put_u16(*block);
                buf.put_slice(payload);
            }
            Packet::Ack { block } => return ack(*block),
            Packet::Trailer { crc32 } => {
                buf.put_u16(Opcode::Trailer as u16);
                if let Some(crc) = crc32 {
                    buf.put_u32(*crc);
                }
            }
            Packet::Unsupported(opcode) => {
                buf.put_u16(*opcode);
                buf.put_u16(0);
            }
        }
        buf.freeze()
    }
}

/// ACK 패킷 `{0, 4, blockHi, blockLo}`
pub fn ack(block: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE);
    buf.put_u16(Opcode::Ack as u16);
    buf.put_u16(block);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_layout() {
        assert_eq!(ack(0).as_ref(), &[0, 4, 0, 0]);
        assert_eq!(ack(0x0102).as_ref(), &[0, 4, 1, 2]);
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert_eq!(Packet::parse(&[0, 3, 0]), None);
        assert_eq!(Packet::parse(&[]), None);
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        assert_eq!(Packet::parse(&[0, 9, 0, 1]), None);
    }

    #[test]
    fn test_write_request_file_name() {
        let pkt = Packet::parse(b"\x00\x02fcc1_boot.sre\x00octet\x00").unwrap();
        assert_eq!(
            pkt,
            Packet::WriteRequest {
                file_name: "fcc1_boot.sre".into()
            }
        );
    }

    #[test]
    fn test_data_block() {
        let mut raw = vec![0, 3, 0, 7];
        raw.extend_from_slice(&[0xAA; 100]);
        match Packet::parse(&raw).unwrap() {
            Packet::Data { block, payload } => {
                assert_eq!(block, 7);
                assert_eq!(payload.len(), 100);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_oversized_data_rejected() {
        let mut raw = vec![0, 3, 0, 1];
        raw.extend_from_slice(&[0u8; BLOCK_SIZE + 1]);
        assert_eq!(Packet::parse(&raw), None);
    }

    #[test]
    fn test_trailer_checksum_position() {
        let pkt = Packet::parse(&[0x00, 0x10, 0x12, 0x34, 0x56, 0x78]).unwrap();
        assert_eq!(pkt, Packet::Trailer { crc32: Some(0x1234_5678) });

        let truncated = Packet::parse(&[0x00, 0x10, 0x12, 0x34, 0x56]).unwrap();
        assert_eq!(truncated, Packet::Trailer { crc32: None });

        let encoded = Packet::Trailer { crc32: Some(0xCBF4_3926) }.to_bytes();
        assert_eq!(encoded.as_ref(), &[0x00, 0x10, 0xCB, 0xF4, 0x39, 0x26]);
    }
}
