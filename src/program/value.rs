//! Value content: the tagged value used by the interpreter
//! stack, globals, and `setconst` instruction payloads.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcHandle(pub usize);

#[derive(Debug, Clone, PartialEq)]
pub enum ValueContent {
    None,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    /// Owning reference into the per-thread heap pool. Bumping/releasing
    /// the external refcount is the caller's job (setconst, valuecopy,
    /// frame teardown) -- never an implicit `Drop`, matching the pool's
    /// arena-like ownership model (see DESIGN.md).
    GcVal(GcHandle),
    /// Inline payload carried by a `setconst` instruction. Owns its
    /// buffer; materialized into a heap string the first time the
    /// instruction executes, and never stored back into a stack slot.
    ConstPreallocStr(String),
}

impl ValueContent {
    pub fn is_gc(&self) -> bool {
        matches!(self, ValueContent::GcVal(_))
    }

    pub fn truthy(&self) -> bool {
        match self {
            ValueContent::None => false,
            ValueContent::Bool(b) => *b,
            ValueContent::Int64(i) => *i != 0,
            ValueContent::Float64(f) => *f != 0.0,
            ValueContent::GcVal(_) | ValueContent::ConstPreallocStr(_) => true,
        }
    }
}

impl Default for ValueContent {
    fn default() -> Self {
        ValueContent::None
    }
}
