//! Framing and codecs for the engine's internal Zygote wire protocol,
//! spoken on the fixed inherited socket (`ZYGOTE_HOST_FD` in the binary
//! crate). Every frame is at most [`MAX_FRAME_LEN`] bytes, tagged by a
//! single leading command byte.

use crate::rw::{ByteReader, ByteWriter};
use crate::{SandboxStatusFlags, WireError};

/// The protocol never allows a frame larger than this.
pub const MAX_FRAME_LEN: usize = 12 * 1024;

/// The leading byte of every Zygote-protocol frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandTag {
    /// Fork a new sandboxed child.
    Fork = 0,
    /// The host's confirmation of the real PID of a just-forked child.
    ForkRealPID = 1,
    /// Arrange for a delayed, non-blocking reap of a child.
    Reap = 2,
    /// Collect a child's exit status.
    GetTerminationStatus = 3,
    /// Report this sandbox's capability bitmask.
    SandboxStatus = 4,
}

impl CommandTag {
    fn from_u8(tag: u8) -> Result<Self, WireError> {
        match tag {
            0 => Ok(Self::Fork),
            1 => Ok(Self::ForkRealPID),
            2 => Ok(Self::Reap),
            3 => Ok(Self::GetTerminationStatus),
            4 => Ok(Self::SandboxStatus),
            other => Err(WireError::UnknownCommandTag(other)),
        }
    }
}

fn check_frame_len(len: usize) -> Result<(), WireError> {
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge {
            actual: len,
            limit: MAX_FRAME_LEN,
        });
    }
    Ok(())
}

/// A parsed `Fork` request body (the command tag has already been
/// consumed by the caller).
#[derive(Debug)]
pub struct ForkRequest {
    /// The `--type=` value of the process being forked (e.g. `renderer`).
    pub process_type: String,
    /// The full argv for the child.
    pub argv: Vec<String>,
    /// UTF-16 timezone hint, forwarded verbatim to the child.
    pub timezone_hint: Vec<u16>,
    /// `key + 3` for each ancillary FD after the first (the pid-oracle is
    /// not assigned a key: it is always `fds[0]`).
    pub fd_keys: Vec<i32>,
}

/// Reads a `Fork` request body. `ancillary_fd_count` is the number of FDs
/// the transport actually delivered alongside this frame (the pid-oracle
/// plus one per key); it must match the wire-declared count exactly.
pub fn read_fork_request(
    reader: &mut ByteReader<'_>,
    ancillary_fd_count: usize,
) -> Result<ForkRequest, WireError> {
    let process_type = reader.read_string()?;
    let argc = reader.read_i32()?;

    let mut argv = Vec::with_capacity(argc.max(0) as usize);
    for _ in 0..argc {
        argv.push(reader.read_string()?);
    }

    let timezone_hint = reader.read_string16()?;

    let declared_fd_count = reader.read_i32()? as usize;
    if declared_fd_count != ancillary_fd_count {
        return Err(WireError::FdCountMismatch {
            declared: declared_fd_count,
            delivered: ancillary_fd_count,
        });
    }

    // fds[0] is the pid-oracle and carries no key; one key follows per
    // remaining fd.
    let mut fd_keys = Vec::with_capacity(declared_fd_count.saturating_sub(1));
    for _ in 1..declared_fd_count {
        fd_keys.push(reader.read_i32()?);
    }

    Ok(ForkRequest {
        process_type,
        argv,
        timezone_hint,
        fd_keys,
    })
}

/// Encodes the broker's reply to a `Fork` request: `(child_pid, uma_string)`.
pub fn write_fork_reply(pid: i32, uma: &str) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.write_i32(pid);
    w.write_string(uma);
    w.into_bytes()
}

/// Reads the `ForkRealPID` confirmation the Zygote host sends after a
/// successful fork reply.
pub fn read_fork_real_pid(reader: &mut ByteReader<'_>) -> Result<i32, WireError> {
    reader.read_i32()
}

/// Encodes a `ForkRealPID` frame (used by tests and by any client exercising
/// the protocol end-to-end).
pub fn write_fork_real_pid(pid: i32) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.write_u8(CommandTag::ForkRealPID as u8);
    w.write_i32(pid);
    w.into_bytes()
}

/// Reads a `Reap(pid)` request body.
pub fn read_reap_request(reader: &mut ByteReader<'_>) -> Result<i32, WireError> {
    reader.read_i32()
}

/// How a child's raw `wstatus` is classified for `GetTerminationStatus`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum TerminationStatusTag {
    /// Exited with status 0.
    Normal = 0,
    /// Exited with a non-zero status in `1..=128`.
    Abnormal = 1,
    /// Terminated by `SIGINT`, `SIGKILL`, or `SIGTERM`.
    Killed = 2,
    /// Terminated by any other signal.
    Crashed = 3,
    /// Still running (`known_dead` was false and no status is available).
    Running = 4,
}

impl TerminationStatusTag {
    /// Smallest valid wire value.
    pub const MIN: i32 = Self::Normal as i32;
    /// Largest valid wire value.
    pub const MAX: i32 = Self::Running as i32;

    fn from_i32(value: i32) -> Result<Self, WireError> {
        match value {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Abnormal),
            2 => Ok(Self::Killed),
            3 => Ok(Self::Crashed),
            4 => Ok(Self::Running),
            other => Err(WireError::UnknownCommandTag(other.clamp(0, 255) as u8)),
        }
    }
}

/// A `TerminationStatus(known_dead, pid)` request body.
#[derive(Debug)]
pub struct TerminationStatusRequest {
    /// Whether the caller already knows the child has exited (blocking
    /// wait) or is merely polling (non-blocking `WNOHANG`).
    pub known_dead: bool,
    /// The child PID.
    pub pid: i32,
}

/// Reads a `TerminationStatus` request body.
pub fn read_termination_status_request(
    reader: &mut ByteReader<'_>,
) -> Result<TerminationStatusRequest, WireError> {
    let known_dead = reader.read_u8()? != 0;
    let pid = reader.read_i32()?;
    Ok(TerminationStatusRequest { known_dead, pid })
}

/// Encodes the `(status_tag, raw_wstatus)` reply to `TerminationStatus`.
pub fn write_termination_status_reply(tag: TerminationStatusTag, raw_wstatus: i32) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.write_i32(tag as i32);
    w.write_i32(raw_wstatus);
    w.into_bytes()
}

/// Reads back a `(status_tag, raw_wstatus)` reply, validating the tag is in
/// range (spec.md: "enumerations are 32-bit signed with declared minimum
/// and maximum valid values").
pub fn read_termination_status_reply(
    reader: &mut ByteReader<'_>,
) -> Result<(TerminationStatusTag, i32), WireError> {
    let tag = TerminationStatusTag::from_i32(reader.read_i32()?)?;
    let raw_wstatus = reader.read_i32()?;
    Ok((tag, raw_wstatus))
}

/// Encodes the `SandboxStatus` reply bitmask.
pub fn write_sandbox_status_reply(flags: SandboxStatusFlags) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.write_u32(flags.bits());
    w.into_bytes()
}

/// Parses a leading command tag off a frame, validating the frame length
/// against [`MAX_FRAME_LEN`] first.
pub fn read_command_tag(frame: &[u8]) -> Result<(CommandTag, ByteReader<'_>), WireError> {
    check_frame_len(frame.len())?;
    let mut reader = ByteReader::new(frame);
    let tag = CommandTag::from_u8(reader.read_u8()?)?;
    Ok((tag, reader))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_request_round_trips() {
        let mut w = ByteWriter::new();
        w.write_u8(CommandTag::Fork as u8);
        w.write_string("renderer");
        w.write_i32(2);
        w.write_string("/proc/self/exe");
        w.write_string("--type=renderer");
        w.write_string16(&[b'U' as u16, b'T' as u16, b'C' as u16]);
        w.write_i32(2); // fd count: pid-oracle + one key'd fd
        w.write_i32(1); // key for fds[1]
        let bytes = w.into_bytes();

        let (tag, mut reader) = read_command_tag(&bytes).unwrap();
        assert_eq!(tag, CommandTag::Fork);
        let request = read_fork_request(&mut reader, 2).unwrap();
        assert_eq!(request.process_type, "renderer");
        assert_eq!(request.argv, vec!["/proc/self/exe", "--type=renderer"]);
        assert_eq!(request.fd_keys, vec![1]);
    }

    #[test]
    fn fork_request_rejects_fd_count_mismatch() {
        let mut w = ByteWriter::new();
        w.write_string("renderer");
        w.write_i32(0);
        w.write_string16(&[]);
        w.write_i32(3);
        let bytes = w.into_bytes();
        let mut reader = ByteReader::new(&bytes);
        let err = read_fork_request(&mut reader, 1).unwrap_err();
        assert!(matches!(err, WireError::FdCountMismatch { .. }));
    }

    #[test]
    fn fork_reply_round_trips() {
        let bytes = write_fork_reply(4242, "");
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_i32().unwrap(), 4242);
        assert_eq!(reader.read_string().unwrap(), "");
    }

    #[test]
    fn termination_status_round_trips() {
        let bytes = write_termination_status_reply(TerminationStatusTag::Killed, 137);
        let mut reader = ByteReader::new(&bytes);
        let (tag, raw) = read_termination_status_reply(&mut reader).unwrap();
        assert_eq!(tag, TerminationStatusTag::Killed);
        assert_eq!(raw, 137);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let frame = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(matches!(
            read_command_tag(&frame),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn unknown_command_tag_is_rejected() {
        let frame = [0xffu8];
        assert!(matches!(
            read_command_tag(&frame),
            Err(WireError::UnknownCommandTag(0xff))
        ));
    }
}
