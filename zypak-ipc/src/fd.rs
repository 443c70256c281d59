use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, RawFd};

use crate::WireError;

/// A kernel file descriptor with single-owner, close-on-drop semantics.
///
/// This is a thin, explicit wrapper over [`std::os::fd::OwnedFd`] — the
/// wrapping exists so that every place in the broker that takes ownership
/// of a descriptor (via `recvmsg` ancillary data, `open`, `dup`, or
/// `socketpair`) says so in its signature, and so [`release`](Self::release)
/// reads as the deliberate "hand ownership to another subsystem" operation
/// the broker's FD bookkeeping depends on.
#[derive(Debug)]
pub struct OwnedFd(std::os::fd::OwnedFd);

impl OwnedFd {
    /// Takes ownership of a raw, currently-open file descriptor.
    ///
    /// # Safety
    /// `fd` must be a valid, open, uniquely-owned file descriptor.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self(unsafe { std::os::fd::OwnedFd::from_raw_fd(fd) })
    }

    /// Releases ownership, returning the raw descriptor without closing it.
    ///
    /// Use this when handing the descriptor to another subsystem (e.g.
    /// `dup2`-ing it onto a fixed well-known number, or embedding it in a
    /// `std::process::Command`).
    pub fn release(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

impl AsRawFd for OwnedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for OwnedFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl From<std::os::fd::OwnedFd> for OwnedFd {
    fn from(fd: std::os::fd::OwnedFd) -> Self {
        Self(fd)
    }
}

impl From<OwnedFd> for std::os::fd::OwnedFd {
    fn from(fd: OwnedFd) -> Self {
        fd.0
    }
}

/// One entry of an [`FdMap`]: "at child-side, `source` shall appear as
/// `target`".
#[derive(Debug)]
pub struct FdAssignment {
    source: OwnedFd,
    target: RawFd,
}

impl FdAssignment {
    /// Builds an assignment from an owned source descriptor and the target
    /// number it should be duped onto in the child.
    pub fn new(source: OwnedFd, target: RawFd) -> Self {
        Self { source, target }
    }

    /// The descriptor as currently open in this process.
    pub fn source(&self) -> RawFd {
        self.source.as_raw_fd()
    }

    /// The descriptor number it must appear as in the child.
    pub fn target(&self) -> RawFd {
        self.target
    }

    /// Hands back the owned source descriptor, consuming the assignment.
    pub fn into_source(self) -> OwnedFd {
        self.source
    }

    /// Renders the textual form `<target>=<source>` used by the
    /// `--forward-fd=` launcher argv and by the supervisor wire protocol's
    /// companion CLI tooling.
    pub fn serialize(&self) -> String {
        format!("{}={}", self.target, self.source())
    }

    /// Parses the textual form produced by [`serialize`](Self::serialize).
    ///
    /// `source` must already be an owned, open descriptor at the given
    /// number; this only parses the pair of integers, it does not open
    /// anything.
    pub fn parse(text: &str, source: OwnedFd) -> Result<Self, WireError> {
        let (target, _source_text) = text
            .split_once('=')
            .ok_or_else(|| WireError::MalformedFdAssignment(text.to_owned()))?;
        let target: RawFd = target
            .parse()
            .map_err(|_| WireError::MalformedFdAssignment(text.to_owned()))?;
        Ok(Self { source, target })
    }
}

/// A set of [`FdAssignment`]s with no duplicate source and no duplicate
/// target.
#[derive(Debug, Default)]
pub struct FdMap {
    assignments: Vec<FdAssignment>,
}

impl FdMap {
    /// An empty FD map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an assignment, rejecting it if its source or target collides
    /// with an existing entry.
    pub fn push(&mut self, assignment: FdAssignment) -> Result<(), WireError> {
        if self
            .assignments
            .iter()
            .any(|a| a.source() == assignment.source())
        {
            return Err(WireError::DuplicateFdMapEntry {
                kind: "source",
                value: assignment.source(),
            });
        }
        if self
            .assignments
            .iter()
            .any(|a| a.target() == assignment.target())
        {
            return Err(WireError::DuplicateFdMapEntry {
                kind: "target",
                value: assignment.target(),
            });
        }
        self.assignments.push(assignment);
        Ok(())
    }

    /// Iterates the assignments in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &FdAssignment> {
        self.assignments.iter()
    }

    /// Number of assignments held.
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    /// Whether the map holds no assignments.
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

impl IntoIterator for FdMap {
    type Item = FdAssignment;
    type IntoIter = std::vec::IntoIter<FdAssignment>;

    fn into_iter(self) -> Self::IntoIter {
        self.assignments.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_fd(n: RawFd) -> OwnedFd {
        // Safe in tests only because we never touch the descriptor; stdin
        // (0) is always valid, so duplicate it to get a harmless owned fd.
        unsafe {
            let dup = libc::dup(0);
            assert!(dup >= 0);
            let _ = n;
            OwnedFd::from_raw_fd(dup)
        }
    }

    #[test]
    fn assignment_round_trips_through_text() {
        let assignment = FdAssignment::new(fake_fd(0), 7);
        let text = assignment.serialize();
        let source = assignment.source();
        assert_eq!(text, format!("7={source}"));

        let reparsed = FdAssignment::parse(&text, fake_fd(0)).unwrap();
        assert_eq!(reparsed.target(), 7);
    }

    #[test]
    fn assignment_without_equals_is_rejected() {
        assert!(matches!(
            FdAssignment::parse("not-an-assignment", fake_fd(0)),
            Err(WireError::MalformedFdAssignment(_))
        ));
    }

    #[test]
    fn fd_map_rejects_duplicate_targets() {
        let mut map = FdMap::new();
        map.push(FdAssignment::new(fake_fd(0), 5)).unwrap();
        let err = map.push(FdAssignment::new(fake_fd(0), 5)).unwrap_err();
        assert!(matches!(
            err,
            WireError::DuplicateFdMapEntry { kind: "target", .. }
        ));
    }

    #[test]
    fn fd_map_accepts_distinct_assignments() {
        let mut map = FdMap::new();
        map.push(FdAssignment::new(fake_fd(0), 5)).unwrap();
        map.push(FdAssignment::new(fake_fd(0), 6)).unwrap();
        assert_eq!(map.len(), 2);
    }
}
