//! Wire framing (§6): every request on the shared RPC connection starts
//! with a 1-byte kind discriminator; the migration sub-protocol uses its
//! own discriminator space on a dedicated connection.
//!
//! Frames on the wire are `[u32 len][u8 kind][payload]`, mirroring the
//! `write_msg` helper the source uses for its node-to-node stream: a
//! length prefix so the reader never has to guess where a frame ends,
//! followed by the tagged payload itself.

use std::io::{self, Read, Write};

/// Discriminator for the shared request/reply connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestKind {
    // Controller ops
    RegisterNode = 0,
    AllocateProclet = 1,
    DestroyProclet = 2,
    ResolveProclet = 3,
    AcquireMigrationDest = 4,
    AcquireNode = 5,
    ReleaseNode = 6,
    UpdateLocation = 7,
    ReportFreeResource = 8,
    DestroyLp = 9,

    // Migration ops (on the shared connection; the bulk heap transfer runs
    // over the dedicated connection framed by `MigrationOpcode`)
    ReserveConns = 20,
    Forward = 21,
    MigrateThreadAndRetVal = 22,

    // Proclet-server ops
    ProcletCall = 40,
    GcStack = 41,
    Shutdown = 42,
}

impl RequestKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        use RequestKind::*;
        Some(match b {
            0 => RegisterNode,
            1 => AllocateProclet,
            2 => DestroyProclet,
            3 => ResolveProclet,
            4 => AcquireMigrationDest,
            5 => AcquireNode,
            6 => ReleaseNode,
            7 => UpdateLocation,
            8 => ReportFreeResource,
            9 => DestroyLp,
            20 => ReserveConns,
            21 => Forward,
            22 => MigrateThreadAndRetVal,
            40 => ProcletCall,
            41 => GcStack,
            42 => Shutdown,
            _ => return None,
        })
    }
}

/// One-byte opcodes on the dedicated migration connection (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrationOpcode {
    CopyProclet = 0,
    SkipProclet = 1,
    Migrate = 2,
    EnablePoll = 3,
    DisablePoll = 4,
    RegisterCallback = 5,
    DeregisterCallback = 6,
}

impl MigrationOpcode {
    pub fn from_byte(b: u8) -> Option<Self> {
        use MigrationOpcode::*;
        Some(match b {
            0 => CopyProclet,
            1 => SkipProclet,
            2 => Migrate,
            3 => EnablePoll,
            4 => DisablePoll,
            5 => RegisterCallback,
            6 => DeregisterCallback,
            _ => return None,
        })
    }
}

/// Maximum frame size accepted by `read_frame`; guards against a
/// corrupt/hostile length prefix turning into an unbounded allocation.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(u32),
    #[error("unknown request kind byte {0:#x}")]
    UnknownKind(u8),
}

/// Write one `[len][kind][payload]` frame. `len` counts the kind byte plus
/// payload so the reader can size its buffer in one read.
pub fn write_frame<W: Write>(w: &mut W, kind: u8, payload: &[u8]) -> Result<(), FrameError> {
    let len = (payload.len() + 1) as u32;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&[kind])?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

/// Read one frame, returning the kind byte and the payload (kind byte
/// stripped).
pub fn read_frame<R: Read>(r: &mut R) -> Result<(u8, Vec<u8>), FrameError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len == 0 {
        return Err(FrameError::TooLarge(0));
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)?;
    let kind = body[0];
    Ok((kind, body[1..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, RequestKind::ProcletCall as u8, b"hello").unwrap();

        let mut cur = Cursor::new(buf);
        let (kind, payload) = read_frame(&mut cur).unwrap();
        assert_eq!(kind, RequestKind::ProcletCall as u8);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn empty_payload_roundtrips() {
        let mut buf = Vec::new();
        write_frame(&mut buf, RequestKind::Shutdown as u8, &[]).unwrap();
        let mut cur = Cursor::new(buf);
        let (kind, payload) = read_frame(&mut cur).unwrap();
        assert_eq!(kind, RequestKind::Shutdown as u8);
        assert!(payload.is_empty());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        buf.extend_from_slice(&[0u8; 8]);
        let mut cur = Cursor::new(buf);
        let err = read_frame(&mut cur).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[test]
    fn request_kind_roundtrips_through_byte() {
        for kind in [
            RequestKind::RegisterNode,
            RequestKind::AllocateProclet,
            RequestKind::AcquireMigrationDest,
            RequestKind::ProcletCall,
            RequestKind::Shutdown,
        ] {
            assert_eq!(RequestKind::from_byte(kind as u8), Some(kind));
        }
        assert_eq!(RequestKind::from_byte(255), None);
    }
}
