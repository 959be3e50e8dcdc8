//! Capabilities
//!
//! A capability is a named permission recorded in a build manifest. Every
//! intrinsic or host-facing operation that touches the outside world
//! declares the capabilities it needs; the check at call time is a single
//! bitmap test.

/// Known capabilities. The discriminant is the bit position in a
/// [`CapabilitySet`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    FsRead = 0,
    FsWrite = 1,
    EnvRead = 2,
    EnvWrite = 3,
    NetOut = 4,
    NetListen = 5,
    NetPoll = 6,
    ProcSpawn = 7,
    TimeWall = 8,
    RandomSecure = 9,
    FfiNative = 10,
}

/// All capabilities, in manifest order.
pub const ALL_CAPABILITIES: [Capability; 11] = [
    Capability::FsRead,
    Capability::FsWrite,
    Capability::EnvRead,
    Capability::EnvWrite,
    Capability::NetOut,
    Capability::NetListen,
    Capability::NetPoll,
    Capability::ProcSpawn,
    Capability::TimeWall,
    Capability::RandomSecure,
    Capability::FfiNative,
];

impl Capability {
    /// The manifest name, e.g. `fs.read`.
    pub fn name(self) -> &'static str {
        match self {
            Capability::FsRead => "fs.read",
            Capability::FsWrite => "fs.write",
            Capability::EnvRead => "env.read",
            Capability::EnvWrite => "env.write",
            Capability::NetOut => "net.out",
            Capability::NetListen => "net.listen",
            Capability::NetPoll => "net.poll",
            Capability::ProcSpawn => "proc.spawn",
            Capability::TimeWall => "time.wall",
            Capability::RandomSecure => "random.secure",
            Capability::FfiNative => "ffi.native",
        }
    }

    /// Parse a manifest name.
    pub fn parse(name: &str) -> Option<Self> {
        ALL_CAPABILITIES.iter().copied().find(|c| c.name() == name)
    }

    /// The bit for this capability in a set.
    pub const fn mask(self) -> u16 {
        1 << (self as u16)
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A capability bitmap. O(1) test, O(1) grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet(u16);

impl CapabilitySet {
    /// Empty set: no host access at all.
    pub const fn empty() -> Self {
        CapabilitySet(0)
    }

    /// Every known capability.
    pub const fn all() -> Self {
        // Bits 0..=10
        CapabilitySet((1 << 11) - 1)
    }

    /// Build from a raw mask (for const tables).
    pub const fn from_mask(mask: u16) -> Self {
        CapabilitySet(mask)
    }

    pub const fn mask(self) -> u16 {
        self.0
    }

    #[inline(always)]
    pub const fn contains(self, cap: Capability) -> bool {
        self.0 & cap.mask() != 0
    }

    /// True when every capability in `required` is granted here.
    #[inline(always)]
    pub const fn covers(self, required: CapabilitySet) -> bool {
        self.0 & required.0 == required.0
    }

    pub fn grant(&mut self, cap: Capability) {
        self.0 |= cap.mask();
    }

    pub const fn with(self, cap: Capability) -> Self {
        CapabilitySet(self.0 | cap.mask())
    }

    /// Parse a manifest list of names. Unknown names are errors; manifests
    /// must not silently widen or narrow.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, String> {
        let mut set = CapabilitySet::empty();
        for name in names {
            match Capability::parse(name) {
                Some(cap) => set.grant(cap),
                None => return Err(format!("unknown capability '{}'", name)),
            }
        }
        Ok(set)
    }

    /// Granted capabilities in manifest order.
    pub fn iter(self) -> impl Iterator<Item = Capability> {
        ALL_CAPABILITIES
            .into_iter()
            .filter(move |c| self.contains(*c))
    }

    /// The first capability in `required` missing from this set, if any.
    pub fn first_missing(self, required: CapabilitySet) -> Option<Capability> {
        ALL_CAPABILITIES
            .into_iter()
            .find(|c| required.contains(*c) && !self.contains(*c))
    }
}

impl std::fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.iter().map(|c| c.name()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        for cap in ALL_CAPABILITIES {
            assert_eq!(Capability::parse(cap.name()), Some(cap));
        }
        assert_eq!(Capability::parse("fs.execute"), None);
    }

    #[test]
    fn test_set_operations() {
        let mut set = CapabilitySet::empty();
        assert!(!set.contains(Capability::FsRead));
        set.grant(Capability::FsRead);
        set.grant(Capability::TimeWall);
        assert!(set.contains(Capability::FsRead));
        assert!(set.contains(Capability::TimeWall));
        assert!(!set.contains(Capability::NetOut));
    }

    #[test]
    fn test_covers() {
        let granted = CapabilitySet::empty()
            .with(Capability::FsRead)
            .with(Capability::FsWrite);
        let need_read = CapabilitySet::empty().with(Capability::FsRead);
        let need_net = CapabilitySet::empty().with(Capability::NetOut);
        assert!(granted.covers(need_read));
        assert!(!granted.covers(need_net));
        assert_eq!(granted.first_missing(need_net), Some(Capability::NetOut));
        assert_eq!(granted.first_missing(need_read), None);
    }

    #[test]
    fn test_from_names() {
        let set = CapabilitySet::from_names(["fs.read", "net.out"]).unwrap();
        assert!(set.contains(Capability::FsRead));
        assert!(set.contains(Capability::NetOut));
        assert!(CapabilitySet::from_names(["bogus"]).is_err());
    }

    #[test]
    fn test_all_covers_everything() {
        let all = CapabilitySet::all();
        for cap in ALL_CAPABILITIES {
            assert!(all.contains(cap));
        }
    }
}
