use core::fmt;

/// Identifies a logical CPU core.
///
/// CPU IDs are dense indices starting at zero, so they may be used to index
/// per-CPU tables directly.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    /// The boot CPU.
    pub const BOOT: Self = Self(0);

    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns this CPU's ID as a `u32`.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns this CPU's ID as an index into a per-CPU table.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Returns an iterator over the first `ncpus` CPU IDs.
    pub fn all(ncpus: usize) -> impl Iterator<Item = CpuId> + Clone {
        (0..ncpus as u32).map(CpuId)
    }
}

impl From<u32> for CpuId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuId({})", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}
