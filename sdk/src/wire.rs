//! Blocking wire codec used on the tool side of the IPC channel.
//!
//! Every integer is 8 bytes little-endian; every frame is an integer length
//! followed by that many raw bytes. A zero-length frame is valid.

use std::io::{self, Read, Write};

/// Largest frame either side accepts (256 MiB).
pub const MAX_FRAME_LEN: u64 = 256 * 1024 * 1024;

/// Reply integer meaning "operation denied".
pub const DENIED: u64 = 1;

/// Operation tags exchanged after the parameters frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum Opcode {
    /// Final result payload; ends the exchange.
    Result = 1,
    /// Run a nested agent to completion.
    RunSubAgent = 2,
    /// Persist and compile new tool source.
    SetToolCode = 3,
    /// Report a denied filesystem or process operation.
    SandboxViolation = 4,
    /// Resolve a credential id.
    GetPassword = 5,
}

impl Opcode {
    pub const fn code(self) -> u64 {
        self as u64
    }
}

impl TryFrom<u64> for Opcode {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Opcode::Result),
            2 => Ok(Opcode::RunSubAgent),
            3 => Ok(Opcode::SetToolCode),
            4 => Ok(Opcode::SandboxViolation),
            5 => Ok(Opcode::GetPassword),
            other => Err(other),
        }
    }
}

pub fn write_u64<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

/// Read one integer. A connection closed early surfaces as `UnexpectedEof`.
pub fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_frame<W: Write>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    write_u64(writer, data.len() as u64)?;
    writer.write_all(data)
}

pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = read_u64(reader)?;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes (max {MAX_FRAME_LEN})"),
        ));
    }
    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_frames_round_trip() {
        for len in [0usize, 1, 7, 8, 9, 255, 4096] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut buf = Vec::new();
            write_frame(&mut buf, &data).unwrap();
            assert_eq!(buf.len(), 8 + len);

            let decoded = read_frame(&mut Cursor::new(buf)).unwrap();
            assert_eq!(decoded, data);
        }
    }

    #[test]
    fn test_integers_are_little_endian() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 0x0102).unwrap();
        assert_eq!(buf, vec![0x02, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_short_frame_is_an_error() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 10).unwrap();
        buf.extend_from_slice(b"abc");

        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_opcode_codes() {
        assert_eq!(Opcode::try_from(1), Ok(Opcode::Result));
        assert_eq!(Opcode::try_from(5), Ok(Opcode::GetPassword));
        assert_eq!(Opcode::try_from(9), Err(9));
        assert_eq!(Opcode::SandboxViolation.code(), 4);
    }
}
