//! Function table entries.

use crate::bytecode::Instruction;

/// One entry in `Program::functions`. A C-bound function (`iscfunc`) never
/// gets bytecode; a source function starts with an empty instruction
/// buffer that a later lowering stage fills in.
#[derive(Debug, Clone)]
pub struct FunctionEntry {
    pub iscfunc: bool,
    pub native_ptr: Option<String>,
    pub instructions: Vec<Instruction>,
    pub input_stack_size: i64,
    pub associated_class_id: i64,
    pub is_threadable: bool,
    pub cfunc_lookup_name: Option<String>,
    pub name: Option<String>,
    pub arg_count: i64,
    pub last_arg_is_multiarg: bool,
    pub has_self_arg: bool,
}

impl FunctionEntry {
    pub fn new_source(name: Option<String>, arg_count: i64, associated_class_id: i64, has_self_arg: bool) -> Self {
        Self {
            iscfunc: false,
            native_ptr: None,
            instructions: Vec::new(),
            input_stack_size: arg_count,
            associated_class_id,
            is_threadable: false,
            cfunc_lookup_name: None,
            name,
            arg_count,
            last_arg_is_multiarg: false,
            has_self_arg,
        }
    }

    pub fn new_c(
        name: Option<String>,
        native_ptr: Option<String>,
        arg_count: i64,
        last_arg_is_multiarg: bool,
        is_threadable: bool,
        associated_class_id: i64,
        lookup_name: String,
    ) -> Self {
        Self {
            iscfunc: true,
            native_ptr,
            instructions: Vec::new(),
            input_stack_size: arg_count,
            associated_class_id,
            is_threadable,
            cfunc_lookup_name: Some(lookup_name),
            name,
            arg_count,
            last_arg_is_multiarg,
            has_self_arg: false,
        }
    }
}
