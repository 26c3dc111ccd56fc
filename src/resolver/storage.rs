//! Storage references: the single unit of cross-reference
//! between a name and where the VM actually reads/writes it.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    GlobalVarSlot,
    GlobalFuncSlot,
    GlobalClassSlot,
    LocalSlot,
    /// A parameter of the enclosing function, addressed like a local slot
    /// but distinguished for diagnostics.
    ParamSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageRef {
    pub kind: StorageKind,
    pub id: i64,
    pub set: bool,
}

impl StorageRef {
    pub fn new(kind: StorageKind, id: i64) -> Self {
        Self { kind, id, set: true }
    }

    pub fn unset() -> Self {
        Self { kind: StorageKind::LocalSlot, id: -1, set: false }
    }
}
