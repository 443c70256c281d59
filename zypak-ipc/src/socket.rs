use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    self, recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixCredentials,
};

use crate::fd::OwnedFd;

/// Ancillary-data budget: up to this many file descriptors plus one
/// `ucred` per message. Receiving more is a protocol violation, not a
/// buffer-sizing nicety, so the control buffer is sized exactly for it.
const MAX_ANCILLARY_FDS: usize = 16;

/// Upper bound on EINTR retries for a single syscall, per spec's
/// "recoverable I/O" error class.
pub const EINTR_RETRY_LIMIT: usize = 100;

fn errno_to_io(errno: Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// Retries `f` while it returns `EINTR`, up to [`EINTR_RETRY_LIMIT`] times.
pub fn retry_eintr<T>(mut f: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    for _ in 0..EINTR_RETRY_LIMIT {
        match f() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
    Err(Errno::EINTR)
}

/// What a [`CredSocket::recv`] call picked up alongside the payload bytes.
pub struct RecvResult {
    /// Number of payload bytes read.
    pub len: usize,
    /// File descriptors received via `SCM_RIGHTS`, in order.
    pub fds: Vec<OwnedFd>,
    /// The sender's PID, if `SO_PASSCRED` was enabled and the kernel
    /// attached `SCM_CREDENTIALS`.
    pub pid: Option<i32>,
}

/// A Unix-domain socket wrapper that knows how to carry ancillary file
/// descriptors and peer credentials — the transport both the Zygote
/// broker's host socket and the supervisor's request socket are built on.
pub struct CredSocket {
    fd: OwnedFd,
}

impl CredSocket {
    /// Wraps an already-open, connected or bound Unix-domain socket.
    pub fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// The underlying raw descriptor.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Hands back the underlying owned descriptor.
    pub fn into_owned(self) -> OwnedFd {
        self.fd
    }

    /// Enables `SO_PASSCRED` so that subsequent [`recv`](Self::recv) calls
    /// may receive the peer's credentials. Call this once, right after the
    /// socket is created — not per message.
    pub fn enable_receive_credentials(&self) -> nix::Result<()> {
        socket::setsockopt(&self.fd, socket::sockopt::PassCred, &true)
    }

    /// Writes `buf` to the socket, optionally passing `fds` as `SCM_RIGHTS`
    /// ancillary data.
    pub fn send(&self, buf: &[u8], fds: &[RawFd]) -> io::Result<usize> {
        let iov = [IoSlice::new(buf)];
        let cmsgs: Vec<ControlMessage> = if fds.is_empty() {
            Vec::new()
        } else {
            vec![ControlMessage::ScmRights(fds)]
        };

        retry_eintr(|| sendmsg::<()>(self.fd.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None))
            .map_err(errno_to_io)
    }

    /// Reads into `buf`, returning the payload length plus any ancillary
    /// FDs and peer credentials the kernel attached. `MSG_TRUNC` and
    /// `MSG_CTRUNC` are always treated as errors: a truncated read or
    /// control buffer means the message does not mean what its length
    /// claims.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<RecvResult> {
        let mut iov = [IoSliceMut::new(buf)];
        let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_ANCILLARY_FDS], UnixCredentials);

        let msg = retry_eintr(|| {
            recvmsg::<()>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_space),
                MsgFlags::empty(),
            )
        })
        .map_err(errno_to_io)?;

        if msg.flags.contains(MsgFlags::MSG_TRUNC) || msg.flags.contains(MsgFlags::MSG_CTRUNC) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated ancillary read (MSG_TRUNC/MSG_CTRUNC)",
            ));
        }

        let mut fds = Vec::new();
        let mut pid = None;
        for cmsg in msg.cmsgs() {
            match cmsg {
                ControlMessageOwned::ScmRights(raw_fds) => {
                    for raw in raw_fds {
                        fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                    }
                }
                ControlMessageOwned::ScmCredentials(cred) => {
                    pid = Some(cred.pid());
                }
                _ => {}
            }
        }

        Ok(RecvResult {
            len: msg.bytes,
            fds,
            pid,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixDatagram;

    use super::*;

    fn to_cred_socket(sock: UnixDatagram) -> CredSocket {
        let fd: std::os::fd::OwnedFd = sock.into();
        CredSocket::from_owned(OwnedFd::from(fd))
    }

    #[test]
    fn plain_payload_round_trips() {
        let (a, b) = UnixDatagram::pair().unwrap();
        let a = to_cred_socket(a);
        let b = to_cred_socket(b);

        a.send(b"hello", &[]).unwrap();
        let mut buf = [0u8; 16];
        let result = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..result.len], b"hello");
        assert!(result.fds.is_empty());
    }

    #[test]
    fn ancillary_fd_is_received() {
        let (a, b) = UnixDatagram::pair().unwrap();
        let a = to_cred_socket(a);
        let b = to_cred_socket(b);

        let (extra_a, _extra_b) = UnixDatagram::pair().unwrap();
        a.send(b"fd-follows", &[extra_a.as_raw_fd()]).unwrap();

        let mut buf = [0u8; 16];
        let result = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..result.len], b"fd-follows");
        assert_eq!(result.fds.len(), 1);
    }
}
