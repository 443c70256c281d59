use thiserror::Error;

/// Errors raised while framing or parsing one of the broker's wire
/// protocols (the Zygote host protocol or the supervisor request
/// protocol).
#[derive(Debug, Error)]
pub enum WireError {
    /// The reader ran out of bytes before finishing a field.
    #[error("unexpected end of buffer while reading a wire frame")]
    UnexpectedEof,

    /// A frame declared (or would require) more bytes than the protocol
    /// allows.
    #[error("frame of {actual} bytes exceeds the {limit}-byte limit")]
    FrameTooLarge {
        /// The size the frame would have needed.
        actual: usize,
        /// The protocol's maximum frame size.
        limit: usize,
    },

    /// The first byte of a zygote-protocol frame did not match any known
    /// command.
    #[error("unknown zygote command tag {0}")]
    UnknownCommandTag(u8),

    /// A length-prefixed string was not valid UTF-8.
    #[error("wire string was not valid utf-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// The supervisor protocol declared a different FD count than the
    /// transport actually delivered with the message.
    #[error("fd count mismatch: message declared {declared}, transport delivered {delivered}")]
    FdCountMismatch {
        /// FD count the message body claims.
        declared: usize,
        /// FD count actually received via ancillary data.
        delivered: usize,
    },

    /// A request's sentinel bytes (`SPAWN\0` / `EXIT\0`) did not match.
    #[error("expected sentinel {expected:?}, got {actual:?}")]
    BadSentinel {
        /// Expected sentinel bytes.
        expected: &'static [u8],
        /// Bytes actually read.
        actual: Vec<u8>,
    },

    /// A textual FD assignment (`target=source`) had no `=` separator.
    #[error("fd assignment {0:?} has no '=' separator")]
    MalformedFdAssignment(String),

    /// An [`FdMap`](crate::FdMap) would have gained a duplicate source or
    /// target FD.
    #[error("duplicate {kind} {value} in fd map")]
    DuplicateFdMapEntry {
        /// Which side of the assignment collided.
        kind: &'static str,
        /// The colliding FD number.
        value: i32,
    },

    /// The underlying transport failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A `nix` syscall wrapper failed.
    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),
}
