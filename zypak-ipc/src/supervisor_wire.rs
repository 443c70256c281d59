//! Framing for the supervisor's own request protocol: the ASCII sentinel
//! each message starts with, and the body of a spawn request.
//!
//! Unlike the Zygote protocol this is not Chromium's own wire format; it
//! is the broker's private channel between the stub binary and the
//! supervisor thread (`REQUEST_FD`), so its framing only has to satisfy
//! this crate's two ends.

use crate::rw::{ByteReader, ByteWriter};
use crate::{SandboxFlags, SpawnFlags, WireError};

/// Sentinel that opens a spawn request.
pub const SPAWN_SENTINEL: &[u8] = b"SPAWN\0";
/// Sentinel that opens an exit notification.
pub const EXIT_SENTINEL: &[u8] = b"EXIT\0";

fn expect_sentinel<'a>(
    reader: &mut ByteReader<'a>,
    expected: &'static [u8],
) -> Result<(), WireError> {
    let actual = reader.read_byte_string()?;
    if actual == expected {
        Ok(())
    } else {
        Err(WireError::BadSentinel { expected, actual })
    }
}

/// One `target_fd=source` ancillary descriptor the spawned child should
/// inherit, alongside its position in the ancillary-FD array actually
/// delivered with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnFdEntry {
    /// Index into the `SCM_RIGHTS` array delivered with this message.
    pub ancillary_index: usize,
    /// The descriptor number the child should see it as.
    pub target_fd: i32,
}

/// A fully decoded spawn request body.
#[derive(Debug)]
pub struct SpawnRequest {
    /// `argv[0..]`, in order.
    pub argv: Vec<String>,
    /// `NAME=value` environment entries to set in the child (on top of,
    /// or instead of, the inherited environment — see [`SpawnFlags::CLEAR_ENV`]).
    pub env: Vec<(String, String)>,
    /// Host paths to make visible to the child beyond the default bind set.
    pub exposed_paths: Vec<String>,
    /// Ancillary descriptors to install in the child.
    pub fds: Vec<SpawnFdEntry>,
    /// Spawn-level behavior flags.
    pub spawn_flags: SpawnFlags,
    /// Sandbox-portal flags, meaningful only when
    /// [`SpawnFlags::SANDBOX`] is set.
    pub sandbox_flags: SandboxFlags,
}

/// Reads a `SPAWN\0`-prefixed request body.
pub fn read_spawn_request(reader: &mut ByteReader<'_>) -> Result<SpawnRequest, WireError> {
    expect_sentinel(reader, SPAWN_SENTINEL)?;

    let argc = reader.read_u32()?;
    let mut argv = Vec::with_capacity(argc as usize);
    for _ in 0..argc {
        argv.push(reader.read_string()?);
    }

    let env_count = reader.read_u32()?;
    let mut env = Vec::with_capacity(env_count as usize);
    for _ in 0..env_count {
        let name = reader.read_string()?;
        let value = reader.read_string()?;
        env.push((name, value));
    }

    let path_count = reader.read_u32()?;
    let mut exposed_paths = Vec::with_capacity(path_count as usize);
    for _ in 0..path_count {
        exposed_paths.push(reader.read_string()?);
    }

    let fd_count = reader.read_u32()?;
    let mut fds = Vec::with_capacity(fd_count as usize);
    for ancillary_index in 0..fd_count as usize {
        let target_fd = reader.read_i32()?;
        fds.push(SpawnFdEntry {
            ancillary_index,
            target_fd,
        });
    }

    let spawn_flags = SpawnFlags::from_bits_truncate(reader.read_u32()?);
    let sandbox_flags = SandboxFlags::from_bits_truncate(reader.read_u32()?);

    Ok(SpawnRequest {
        argv,
        env,
        exposed_paths,
        fds,
        spawn_flags,
        sandbox_flags,
    })
}

/// Encodes a `SPAWN\0`-prefixed request body (the supervisor's client side,
/// and test tooling, build requests with this).
pub fn write_spawn_request(request: &SpawnRequest) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.write_byte_string(SPAWN_SENTINEL);

    w.write_u32(request.argv.len() as u32);
    for arg in &request.argv {
        w.write_string(arg);
    }

    w.write_u32(request.env.len() as u32);
    for (name, value) in &request.env {
        w.write_string(name);
        w.write_string(value);
    }

    w.write_u32(request.exposed_paths.len() as u32);
    for path in &request.exposed_paths {
        w.write_string(path);
    }

    w.write_u32(request.fds.len() as u32);
    for entry in &request.fds {
        w.write_i32(entry.target_fd);
    }

    w.write_u32(request.spawn_flags.bits());
    w.write_u32(request.sandbox_flags.bits());
    w.into_bytes()
}

/// The supervisor's reply to a spawn request: either the external PID the
/// caller should track, or the reason the spawn could not proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnReply {
    /// Spawned successfully; this is the caller-visible PID.
    Ok(i32),
    /// The portal (or mimic fallback) isn't ready yet; retry later.
    TryLater,
    /// The spawn request named a path or flag combination that cannot be
    /// satisfied.
    Failed,
}

/// Encodes a [`SpawnReply`].
pub fn write_spawn_reply(reply: SpawnReply) -> Vec<u8> {
    let mut w = ByteWriter::new();
    match reply {
        SpawnReply::Ok(pid) => {
            w.write_u8(0);
            w.write_i32(pid);
        }
        SpawnReply::TryLater => w.write_u8(1),
        SpawnReply::Failed => w.write_u8(2),
    }
    w.into_bytes()
}

/// Decodes a [`SpawnReply`].
pub fn read_spawn_reply(reader: &mut ByteReader<'_>) -> Result<SpawnReply, WireError> {
    match reader.read_u8()? {
        0 => Ok(SpawnReply::Ok(reader.read_i32()?)),
        1 => Ok(SpawnReply::TryLater),
        2 => Ok(SpawnReply::Failed),
        other => Err(WireError::UnknownCommandTag(other)),
    }
}

/// An `EXIT\0`-prefixed notification: a previously spawned external PID has
/// terminated, carrying its raw `wstatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitNotification {
    /// The external PID that exited.
    pub external_pid: i32,
    /// The raw `wstatus` as reaped by the supervisor.
    pub raw_wstatus: i32,
}

/// Reads an `EXIT\0`-prefixed notification body.
pub fn read_exit_notification(reader: &mut ByteReader<'_>) -> Result<ExitNotification, WireError> {
    expect_sentinel(reader, EXIT_SENTINEL)?;
    let external_pid = reader.read_i32()?;
    let raw_wstatus = reader.read_i32()?;
    Ok(ExitNotification {
        external_pid,
        raw_wstatus,
    })
}

/// Encodes an `EXIT\0`-prefixed notification body.
pub fn write_exit_notification(notification: ExitNotification) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.write_byte_string(EXIT_SENTINEL);
    w.write_i32(notification.external_pid);
    w.write_i32(notification.raw_wstatus);
    w.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> SpawnRequest {
        SpawnRequest {
            argv: vec!["/usr/bin/env".to_owned(), "true".to_owned()],
            env: vec![("ZYPAK_DEBUG".to_owned(), "1".to_owned())],
            exposed_paths: vec!["/home/user/project".to_owned()],
            fds: vec![SpawnFdEntry {
                ancillary_index: 0,
                target_fd: 3,
            }],
            spawn_flags: SpawnFlags::SANDBOX | SpawnFlags::WATCH_BUS,
            sandbox_flags: SandboxFlags::SHARE_DISPLAY,
        }
    }

    #[test]
    fn spawn_request_round_trips() {
        let bytes = write_spawn_request(&sample_request());
        let mut reader = ByteReader::new(&bytes);
        let decoded = read_spawn_request(&mut reader).unwrap();
        assert_eq!(decoded.argv, sample_request().argv);
        assert_eq!(decoded.env, sample_request().env);
        assert_eq!(decoded.exposed_paths, sample_request().exposed_paths);
        assert_eq!(decoded.fds, sample_request().fds);
        assert_eq!(decoded.spawn_flags, sample_request().spawn_flags);
        assert_eq!(decoded.sandbox_flags, sample_request().sandbox_flags);
    }

    #[test]
    fn spawn_request_rejects_wrong_sentinel() {
        let mut w = ByteWriter::new();
        w.write_byte_string(EXIT_SENTINEL);
        let bytes = w.into_bytes();
        let mut reader = ByteReader::new(&bytes);
        assert!(matches!(
            read_spawn_request(&mut reader),
            Err(WireError::BadSentinel { .. })
        ));
    }

    #[test]
    fn spawn_reply_round_trips() {
        for reply in [SpawnReply::Ok(999), SpawnReply::TryLater, SpawnReply::Failed] {
            let bytes = write_spawn_reply(reply);
            let mut reader = ByteReader::new(&bytes);
            assert_eq!(read_spawn_reply(&mut reader).unwrap(), reply);
        }
    }

    #[test]
    fn exit_notification_round_trips() {
        let notification = ExitNotification {
            external_pid: 1234,
            raw_wstatus: 0,
        };
        let bytes = write_exit_notification(notification);
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(read_exit_notification(&mut reader).unwrap(), notification);
    }
}
