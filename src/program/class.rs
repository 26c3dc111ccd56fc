//! Class entries and the class member hashmap.
//!
//! `MAX_METHODS` sets the boundary between method slots and variable
//! slots in the encoded bucket record: a slot `< MAX_METHODS` is a method
//! index, `>= MAX_METHODS` is `MAX_METHODS` subtracted to recover the
//! variable index. The boundary test in the original source used
//! `func_idx > 0`, misclassifying method id `0` as a variable; this is
//! fixed here to `func_idx >= 0` (see DESIGN.md, Open Question decisions).

pub const HASH_SIZE: usize = 64;
pub const MAX_METHODS: i64 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BucketRecord {
    name_id: i64,
    slot: i64,
}

#[derive(Debug, Clone)]
pub struct ClassEntry {
    pub name: String,
    pub base_class_id: Option<i64>,
    pub method_ids: Vec<i64>,
    pub method_name_ids: Vec<i64>,
    pub var_name_ids: Vec<i64>,
    pub has_var_init_func: bool,
    /// The `$$varinit` function id registered the first time one of this
    /// class's variable members has a non-trivial initializer. `-1` until
    /// `has_var_init_func` is set.
    pub var_init_func_id: i64,
    buckets: Vec<Vec<BucketRecord>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRegisterError {
    DuplicateMember,
    TooManyMethods,
}

impl ClassEntry {
    pub fn new(name: String, base_class_id: Option<i64>) -> Self {
        Self {
            name,
            base_class_id,
            method_ids: Vec::new(),
            method_name_ids: Vec::new(),
            var_name_ids: Vec::new(),
            has_var_init_func: false,
            var_init_func_id: -1,
            buckets: vec![Vec::new(); HASH_SIZE],
        }
    }

    fn bucket_index(name_id: i64) -> usize {
        (name_id.rem_euclid(HASH_SIZE as i64)) as usize
    }

    /// Register a member (method if `func_id.is_some()`, otherwise a
    /// variable) under `name_id`. The final bucket record is only
    /// appended after every fallible step succeeds, so a duplicate-name
    /// failure leaves the class entirely unmutated.
    pub fn register_member(&mut self, name_id: i64, func_id: Option<i64>) -> Result<i64, MemberRegisterError> {
        let bucket = Self::bucket_index(name_id);
        if self.buckets[bucket].iter().any(|r| r.name_id == name_id) {
            return Err(MemberRegisterError::DuplicateMember);
        }
        if func_id.is_some() && self.method_ids.len() as i64 >= MAX_METHODS {
            return Err(MemberRegisterError::TooManyMethods);
        }

        let (entry_idx, slot) = match func_id {
            // The bucket stores the function's *global* id directly (what
            // the interpreter's GETMEMBER needs to call it), not its
            // position within `method_ids`; `entry_idx` is still that
            // position, returned for the caller's own bookkeeping.
            Some(fid) => {
                let entry_idx = self.method_ids.len() as i64;
                (entry_idx, fid)
            }
            None => {
                let entry_idx = self.var_name_ids.len() as i64;
                (entry_idx, MAX_METHODS + entry_idx)
            }
        };

        match func_id {
            Some(fid) => {
                self.method_ids.push(fid);
                self.method_name_ids.push(name_id);
            }
            None => {
                self.var_name_ids.push(name_id);
            }
        }
        self.buckets[bucket].push(BucketRecord { name_id, slot });
        Ok(entry_idx)
    }

    /// `(var_id, func_id)`, exactly one non-negative, or `(-1, -1)`. The
    /// returned id is the member's *entry index* within the class's
    /// method/variable table (the same value `register_member` returned
    /// when the member was added), not the function's global id.
    pub fn lookup_member(&self, name_id: i64) -> (i64, i64) {
        let bucket = Self::bucket_index(name_id);
        for record in &self.buckets[bucket] {
            if record.name_id == name_id {
                return if record.slot < MAX_METHODS {
                    (-1, record.slot)
                } else {
                    (record.slot - MAX_METHODS, -1)
                };
            }
        }
        (-1, -1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_and_variable_members_round_trip() {
        let mut class = ClassEntry::new("Point".into(), None);
        let x_slot = class.register_member(10, None).unwrap();
        let move_slot = class.register_member(20, Some(7)).unwrap();
        assert_eq!(x_slot, 0);
        assert_eq!(move_slot, 0);
        assert_eq!(class.lookup_member(10), (10, -1));
        assert_eq!(class.lookup_member(20), (-1, 7));
        assert_eq!(class.lookup_member(999), (-1, -1));
    }

    #[test]
    fn duplicate_member_name_fails() {
        let mut class = ClassEntry::new("Point".into(), None);
        class.register_member(10, None).unwrap();
        assert_eq!(class.register_member(10, Some(1)), Err(MemberRegisterError::DuplicateMember));
    }

    #[test]
    fn method_id_zero_is_classified_as_a_method_not_a_variable() {
        let mut class = ClassEntry::new("C".into(), None);
        class.register_member(5, Some(0)).unwrap();
        assert_eq!(class.lookup_member(5), (-1, 0));
    }

    #[test]
    fn lookup_returns_the_global_func_id_not_the_method_table_position() {
        // Two methods whose global ids (assigned by the program-wide
        // function table) differ from their position within this class's
        // own method_ids -- lookup must hand back the former.
        let mut class = ClassEntry::new("C".into(), None);
        class.register_member(10, Some(42)).unwrap();
        class.register_member(20, Some(43)).unwrap();
        assert_eq!(class.lookup_member(10), (-1, 42));
        assert_eq!(class.lookup_member(20), (-1, 43));
    }
}
