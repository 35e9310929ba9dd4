use core::fmt;

macro_rules! kernel_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

kernel_id!(
    /// Unique guest thread id. Ids grow monotonically and are never reused.
    ThreadId,
    "T"
);
kernel_id!(
    /// Unique guest process id.
    ProcessId,
    "P"
);
kernel_id!(
    /// Key of a synchronization object in the kernel's object table.
    ObjectId,
    "O"
);

/// Hands out ids in increasing order, starting at 1.
#[derive(Debug)]
pub(crate) struct IdCounter(u64);

impl IdCounter {
    pub const fn new() -> Self {
        Self(0)
    }

    pub const fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}
