//! Resource type tags and the `(resource_type, semver)` versioning scheme
//! every persisted blob carries (spec §3 "Resource type", "Versioning").

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResourceType {
    Config = 0,
    State = 1,
    Packfile = 2,
    Snapshot = 3,
    Object = 4,
    Chunk = 5,
    VfsBtree = 6,
    VfsNode = 7,
    VfsEntry = 8,
    XattrBtree = 9,
    XattrNode = 10,
    XattrEntry = 11,
    ErrorBtree = 12,
    ErrorNode = 13,
    ErrorEntry = 14,
    BtreeRoot = 15,
    BtreeNode = 16,
    Signature = 17,
    Lock = 18,
    PackfileFooter = 19,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl ResourceType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        use ResourceType::*;
        Some(match tag {
            0 => Config,
            1 => State,
            2 => Packfile,
            3 => Snapshot,
            4 => Object,
            5 => Chunk,
            6 => VfsBtree,
            7 => VfsNode,
            8 => VfsEntry,
            9 => XattrBtree,
            10 => XattrNode,
            11 => XattrEntry,
            12 => ErrorBtree,
            13 => ErrorNode,
            14 => ErrorEntry,
            15 => BtreeRoot,
            16 => BtreeNode,
            17 => Signature,
            18 => Lock,
            19 => PackfileFooter,
            _ => return None,
        })
    }
}

/// Semantic version tag attached to every persisted resource. The reader
/// refuses to open a blob whose major component it does not understand
/// (spec §3 "Versioning").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVersion {
    pub major: u16,
    pub minor: u16,
}

impl ResourceVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible_with(&self, reader_supports: ResourceVersion) -> bool {
        self.major == reader_supports.major
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Current on-disk version for every resource type this crate writes.
/// Bump the major component on incompatible format changes only.
pub const CURRENT_VERSION: ResourceVersion = ResourceVersion::new(1, 0);
