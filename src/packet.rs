use std::fmt;
use std::str;

use thiserror::Error;

use crate::DEF_BLOCK_SIZE;

pub const OPCODE_RRQ: u16 = 1;
pub const OPCODE_WRQ: u16 = 2;
pub const OPCODE_DATA: u16 = 3;
pub const OPCODE_ACK: u16 = 4;
pub const OPCODE_ERROR: u16 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Packet length too short for opcode {opcode}: {len} bytes")]
    TooShort { opcode: u16, len: usize },
    #[error("Invalid opcode: {0}")]
    UnknownOpcode(u16),
    #[error("Missing cstr terminator")]
    MissingTerminator,
    #[error("Invalid cstr encoding")]
    InvalidEncoding,
    #[error("Data payload of {0} bytes exceeds block size")]
    Oversized(usize),
}

/// Transfer mode named in a request packet.
///
/// Only `Octet` is operational; the other two are recognised so they can be
/// refused before anything goes out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    NetAscii,
    #[default]
    Octet,
    Mail,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::NetAscii => "NetAscii",
            Mode::Octet => "Octet",
            Mode::Mail => "Mail",
        }
    }

    /// Case-insensitive lookup, as RFC 1350 allows any mix of case.
    pub fn parse(s: &str) -> Option<Self> {
        [Mode::NetAscii, Mode::Octet, Mode::Mail]
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, Mode::Octet)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes defined by RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerErrorCode {
    NotDefined,
    FileNotFound,
    AccessViolation,
    AllocExceeded,
    IllegalOp,
    UnknownTransferId,
    FileExists,
    NoSuchUser,
    Other(u16),
}

impl From<u16> for PeerErrorCode {
    fn from(code: u16) -> Self {
        match code {
            0 => PeerErrorCode::NotDefined,
            1 => PeerErrorCode::FileNotFound,
            2 => PeerErrorCode::AccessViolation,
            3 => PeerErrorCode::AllocExceeded,
            4 => PeerErrorCode::IllegalOp,
            5 => PeerErrorCode::UnknownTransferId,
            6 => PeerErrorCode::FileExists,
            7 => PeerErrorCode::NoSuchUser,
            other => PeerErrorCode::Other(other),
        }
    }
}

impl From<PeerErrorCode> for u16 {
    fn from(code: PeerErrorCode) -> Self {
        match code {
            PeerErrorCode::NotDefined => 0,
            PeerErrorCode::FileNotFound => 1,
            PeerErrorCode::AccessViolation => 2,
            PeerErrorCode::AllocExceeded => 3,
            PeerErrorCode::IllegalOp => 4,
            PeerErrorCode::UnknownTransferId => 5,
            PeerErrorCode::FileExists => 6,
            PeerErrorCode::NoSuchUser => 7,
            PeerErrorCode::Other(code) => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TftpPacket {
    RRQ { filename: String, mode: String },
    WRQ { filename: String, mode: String },
    DATA { block: u16, data: Vec<u8> },
    ACK(u16),
    ERROR { code: u16, msg: String },
}

impl TftpPacket {
    pub fn opcode(&self) -> u16 {
        match self {
            TftpPacket::RRQ { .. } => OPCODE_RRQ,
            TftpPacket::WRQ { .. } => OPCODE_WRQ,
            TftpPacket::DATA { .. } => OPCODE_DATA,
            TftpPacket::ACK(_) => OPCODE_ACK,
            TftpPacket::ERROR { .. } => OPCODE_ERROR,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = Vec::with_capacity(4 + usize::from(DEF_BLOCK_SIZE));
        bytes.extend_from_slice(&self.opcode().to_be_bytes());

        match self {
            TftpPacket::RRQ { filename, mode } | TftpPacket::WRQ { filename, mode } => {
                bytes.extend_from_slice(filename.as_bytes());
                bytes.push(0);
                bytes.extend_from_slice(mode.as_bytes());
                bytes.push(0);
            }
            TftpPacket::DATA { block, data } => {
                bytes.extend_from_slice(&block.to_be_bytes());
                bytes.extend_from_slice(data);
            }
            TftpPacket::ACK(block) => {
                bytes.extend_from_slice(&block.to_be_bytes());
            }
            TftpPacket::ERROR { code, msg } => {
                bytes.extend_from_slice(&code.to_be_bytes());
                bytes.extend_from_slice(msg.as_bytes());
                bytes.push(0);
            }
        }
        bytes
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::TooShort {
                opcode: 0,
                len: buf.len(),
            });
        }

        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let min_len = match opcode {
            // opcode + two empty strings
            OPCODE_RRQ | OPCODE_WRQ => 4,
            OPCODE_DATA | OPCODE_ACK => 4,
            // opcode + code + empty message
            OPCODE_ERROR => 5,
            _ => return Err(DecodeError::UnknownOpcode(opcode)),
        };
        if buf.len() < min_len {
            return Err(DecodeError::TooShort {
                opcode,
                len: buf.len(),
            });
        }

        let pkt = match opcode {
            OPCODE_RRQ | OPCODE_WRQ => {
                let (filename, rest) = read_cstr(&buf[2..])?;
                let (mode, _) = read_cstr(rest)?;
                if opcode == OPCODE_RRQ {
                    TftpPacket::RRQ { filename, mode }
                } else {
                    TftpPacket::WRQ { filename, mode }
                }
            }
            OPCODE_DATA => {
                let block = u16::from_be_bytes([buf[2], buf[3]]);
                let data = &buf[4..];
                if data.len() > usize::from(DEF_BLOCK_SIZE) {
                    return Err(DecodeError::Oversized(data.len()));
                }
                TftpPacket::DATA {
                    block,
                    data: data.to_vec(),
                }
            }
            OPCODE_ACK => TftpPacket::ACK(u16::from_be_bytes([buf[2], buf[3]])),
            _ => {
                let code = u16::from_be_bytes([buf[2], buf[3]]);
                let (msg, _) = read_cstr(&buf[4..])?;
                TftpPacket::ERROR { code, msg }
            }
        };

        Ok(pkt)
    }
}

// Reads a NUL-terminated string and returns it with the bytes following the NUL.
fn read_cstr(buf: &[u8]) -> Result<(String, &[u8]), DecodeError> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::MissingTerminator)?;
    let s = str::from_utf8(&buf[..pos])
        .map_err(|_| DecodeError::InvalidEncoding)?
        .to_string();
    Ok((s, &buf[pos + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_format() {
        let pkt = TftpPacket::RRQ {
            filename: "firmware.bin".into(),
            mode: Mode::Octet.as_str().into(),
        };
        let bytes = pkt.serialize();
        assert_eq!(&bytes[..2], &[0, 1]);
        assert_eq!(&bytes[2..], b"firmware.bin\0Octet\0");
        assert_eq!(TftpPacket::deserialize(&bytes), Ok(pkt));
    }

    #[test]
    fn every_kind_survives_the_wire() {
        let packets = vec![
            TftpPacket::WRQ {
                filename: "app.bin".into(),
                mode: "Octet".into(),
            },
            TftpPacket::DATA {
                block: 7,
                data: Vec::new(),
            },
            TftpPacket::DATA {
                block: 65535,
                data: vec![0xab; 512],
            },
            TftpPacket::ACK(0),
            TftpPacket::ERROR {
                code: 1,
                msg: "File not found".into(),
            },
            TftpPacket::ERROR {
                code: 0,
                msg: String::new(),
            },
        ];
        for pkt in packets {
            assert_eq!(TftpPacket::deserialize(&pkt.serialize()), Ok(pkt));
        }
    }

    #[test]
    fn data_and_ack_are_big_endian() {
        let data = TftpPacket::DATA {
            block: 0x0102,
            data: vec![9, 8],
        };
        assert_eq!(data.serialize(), vec![0, 3, 1, 2, 9, 8]);
        assert_eq!(TftpPacket::ACK(0x0a0b).serialize(), vec![0, 4, 0x0a, 0x0b]);
        let err = TftpPacket::ERROR {
            code: 2,
            msg: "no".into(),
        };
        assert_eq!(err.serialize(), vec![0, 5, 0, 2, b'n', b'o', 0]);
    }

    #[test]
    fn rejects_unknown_opcodes() {
        assert_eq!(
            TftpPacket::deserialize(&[0, 6, 0, 0]),
            Err(DecodeError::UnknownOpcode(6))
        );
        assert_eq!(
            TftpPacket::deserialize(&[0, 0, 0, 1]),
            Err(DecodeError::UnknownOpcode(0))
        );
    }

    #[test]
    fn rejects_short_buffers() {
        assert!(matches!(
            TftpPacket::deserialize(&[0]),
            Err(DecodeError::TooShort { .. })
        ));
        assert_eq!(
            TftpPacket::deserialize(&[0, 4, 1]),
            Err(DecodeError::TooShort { opcode: 4, len: 3 })
        );
        assert_eq!(
            TftpPacket::deserialize(&[0, 5, 0, 1]),
            Err(DecodeError::TooShort { opcode: 5, len: 4 })
        );
    }

    #[test]
    fn rejects_unterminated_strings() {
        assert_eq!(
            TftpPacket::deserialize(b"\x00\x01file\x00Octet"),
            Err(DecodeError::MissingTerminator)
        );
        assert_eq!(
            TftpPacket::deserialize(b"\x00\x05\x00\x01oops"),
            Err(DecodeError::MissingTerminator)
        );
    }

    #[test]
    fn rejects_oversized_data() {
        let mut buf = vec![0, 3, 0, 1];
        buf.extend(std::iter::repeat(0).take(513));
        assert_eq!(
            TftpPacket::deserialize(&buf),
            Err(DecodeError::Oversized(513))
        );
    }

    #[test]
    fn mode_lookup_ignores_case() {
        assert_eq!(Mode::parse("octet"), Some(Mode::Octet));
        assert_eq!(Mode::parse("NETASCII"), Some(Mode::NetAscii));
        assert_eq!(Mode::parse("mail"), Some(Mode::Mail));
        assert_eq!(Mode::parse("binary"), None);
        assert!(Mode::Octet.is_supported());
        assert!(!Mode::Mail.is_supported());
    }

    #[test]
    fn peer_error_codes_map_both_ways() {
        assert_eq!(PeerErrorCode::from(1), PeerErrorCode::FileNotFound);
        assert_eq!(PeerErrorCode::from(42), PeerErrorCode::Other(42));
        assert_eq!(u16::from(PeerErrorCode::UnknownTransferId), 5);
    }
}
