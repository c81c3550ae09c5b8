use serde::Deserialize;
use std::fmt;
use uuid::Uuid;

/// Number identifying a molecule across every group of a system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
pub struct MolNum(pub u32);

/// Number identifying a molecule group within a system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
pub struct MGNum(pub u32);

/// Position of a forcefield in the order it was added to a system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FFIdx(pub usize);

impl fmt::Display for MolNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MolNum({})", self.0)
    }
}

impl fmt::Display for MGNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MGNum({})", self.0)
    }
}

impl fmt::Display for FFIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FFIdx({})", self.0)
    }
}

/// Identifies zero or more forcefields of a system, either by position or by name.
///
/// A name may match several forcefields, and an index that is out of range
/// matches none. Resolution is always performed against a concrete system.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FFId {
    Index(FFIdx),
    Name(String),
}

impl fmt::Display for FFId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FFId::Index(idx) => write!(f, "{}", idx),
            FFId::Name(name) => write!(f, "FFName('{}')", name),
        }
    }
}

/// Unique identity of a system. Snapshots (clones) share the identity of their source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemUid(Uuid);

impl SystemUid {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SystemUid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SystemUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `(major, minor)` version pair.
///
/// The major number changes when the structure of the versioned object changes
/// (members added or removed); the minor number counts content edits since the
/// last structural change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
}

impl Version {
    pub fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    pub fn next_major(self) -> Self {
        Self {
            major: self.major + 1,
            minor: 0,
        }
    }

    pub fn next_minor(self) -> Self {
        Self {
            major: self.major,
            minor: self.minor + 1,
        }
    }

    /// Returns `true` if `other` is exactly one content edit after `self`.
    pub fn immediately_precedes(self, other: Version) -> bool {
        self.next_minor() == other
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_major_resets_minor() {
        let v = Version::new(2, 7).next_major();
        assert_eq!(v, Version::new(3, 0));
    }

    #[test]
    fn immediately_precedes_only_accepts_single_minor_step() {
        let v = Version::new(1, 4);
        assert!(v.immediately_precedes(Version::new(1, 5)));
        assert!(!v.immediately_precedes(Version::new(1, 6)));
        assert!(!v.immediately_precedes(Version::new(2, 0)));
        assert!(!v.immediately_precedes(v));
    }

    #[test]
    fn system_uids_are_unique() {
        assert_ne!(SystemUid::new(), SystemUid::new());
    }
}
