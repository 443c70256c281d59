use std::fmt;

/// The PID the engine believes is its direct child.
///
/// In spawn strategy this is a short-lived local stub process; in mimic
/// strategy it is the real forked child. Never compare a [`StubPid`]
/// against an [`ExternalPid`] or [`InternalPid`] directly — they are
/// disjoint namespaces, which is why each gets its own newtype rather than
/// a shared `pid_t` alias.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StubPid(pub i32);

/// The PID the container portal assigned to a spawned process, in the
/// portal's own view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExternalPid(pub i32);

/// The PID a spawned process sees for itself inside its own sandbox PID
/// namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InternalPid(pub i32);

macro_rules! impl_pid_display {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

impl_pid_display!(StubPid);
impl_pid_display!(ExternalPid);
impl_pid_display!(InternalPid);
