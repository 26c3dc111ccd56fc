//! Bytecode lowering: the direct, single-pass AST walk that sits between
//! the resolver and the interpreter, walking each resolved AST and
//! emitting bytecode into each function's instruction buffer. This is not
//! an optimizing stage -- it is a tree-walking emitter (one visitor per
//! AST node kind, building a flat instruction vector) rather than a true
//! IR with basic blocks, since the target instruction set is already flat.
//!
//! Every function body is lowered independently into its own
//! `Vec<Instruction>`, after the resolver has already assigned every
//! declaration and reference a [`crate::resolver::storage::StorageRef`].
//! Physical stack slots: when a function has a bound `self`
//! (`has_self_arg`), slot `0` is reserved for it and every `LocalSlot`/
//! `ParamSlot` id assigned by the resolver is shifted up by one to make
//! room (the resolver's slot counter starts fresh at `0` per function
//! regardless of whether a bound receiver will occupy physical slot `0`
//! at call time; lowering is where that's reconciled -- see DESIGN.md).

use thiserror::Error;

use crate::ast::{Ast, AstId, BinOp, Literal, NodeId, NodeKind, UnOp};
use crate::bytecode::{ArithOp, GlobalRef, Instruction, JumpTarget, Slot, UnaryArithOp};
use crate::program::value::ValueContent;
use crate::program::Program;
use crate::resolver::storage::{StorageKind, StorageRef};

#[derive(Debug, Error)]
pub enum LowerError {
    #[error("{fileuri}: lowering: {message}")]
    Internal { fileuri: String, message: String },
}

fn internal(ast: &Ast, msg: impl Into<String>) -> LowerError {
    LowerError::Internal { fileuri: ast.fileuri.clone(), message: msg.into() }
}

/// Lower every resolved source function reachable from `asts` into its
/// `Program::functions` entry. Must run after the resolver has finished
/// and before [`crate::vm::execute_program`].
pub fn lower_program(asts: &[Ast], program: &mut Program) -> Result<(), LowerError> {
    for ast in asts {
        for node in 0..ast.nodes_count() {
            let id = NodeId(node);
            if let NodeKind::FuncDef { body, params, .. } = &ast.node(id).kind {
                if let Some(StorageRef { kind: StorageKind::GlobalFuncSlot, id: func_id, set: true }) = ast.node(id).storage {
                    lower_function(ast, id, *body, params.len() as i64, func_id, program)?;
                }
            }
        }
        synthesize_varinit_stubs(ast, program);
    }
    Ok(())
}

/// `$$varinit` has no dedicated AST node (it is auto-generated by the
/// resolver against a class, not parsed from source), so lowering cannot
/// walk a body for it. The instruction set's closed tag
/// enumeration has no member-assignment opcode, so there is
/// no bytecode this stage could emit that would actually write a member
/// variable; it is registered as a callable no-op entry point instead
/// (see DESIGN.md).
fn synthesize_varinit_stubs(ast: &Ast, program: &mut Program) {
    let _ = ast;
    for class in &mut program.classes {
        if class.has_var_init_func {
            let func_id = class.var_init_func_id;
            if func_id >= 0 {
                let entry = &mut program.functions[func_id as usize];
                if entry.instructions.is_empty() {
                    entry.instructions.push(Instruction::ReturnValue { src: None });
                }
            }
        }
    }
}

struct FuncLower {
    instructions: Vec<Instruction>,
    next_slot: u32,
    next_label: usize,
    self_shift: u16,
}

impl FuncLower {
    fn alloc_slot(&mut self) -> Slot {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot as Slot
    }

    fn alloc_label(&mut self) -> JumpTarget {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    fn emit(&mut self, inst: Instruction) {
        self.instructions.push(inst);
    }

    /// Physical slot for a resolver-assigned local/param storage id. A
    /// negative id marks the bound receiver (`self`/`base`), which always
    /// lives in the reserved physical slot `0` rather than one of the
    /// resolver's own per-function slot numbers.
    fn local_slot(&self, storage_id: i64) -> Slot {
        if storage_id < 0 {
            return 0;
        }
        storage_id as Slot + self.self_shift
    }

    /// Copy `src` into a guaranteed-fresh slot, so a caller building a
    /// contiguous argument list never accidentally reuses an existing
    /// local's slot as part of the run.
    fn materialize(&mut self, src: Slot) -> Slot {
        let want = self.alloc_slot();
        if want != src {
            self.emit(Instruction::ValueCopy { dst: want, src });
        }
        want
    }
}

fn lower_function(ast: &Ast, func_node: NodeId, body: NodeId, _param_count: i64, func_id: i64, program: &mut Program) -> Result<(), LowerError> {
    let has_self_arg = program.functions[func_id as usize].has_self_arg;
    let self_shift: u16 = if has_self_arg { 1 } else { 0 };

    let mut max_local = -1i64;
    scan_local_slots(ast, func_node, &mut max_local);
    let next_slot = (max_local + 1) as u32 + self_shift as u32;

    let mut lower = FuncLower { instructions: Vec::new(), next_slot, next_label: 0, self_shift };
    lower_stmt(ast, &mut lower, program, body)?;
    // Every path through a function body must end in a return; a body that
    // falls off the end returns `none`, matching a bare `return`.
    lower.emit(Instruction::ReturnValue { src: None });

    let entry = &mut program.functions[func_id as usize];
    entry.instructions = lower.instructions;
    entry.input_stack_size = lower.next_slot as i64;
    Ok(())
}

/// Find the highest `LocalSlot`/`ParamSlot` id the resolver assigned
/// anywhere in this function's own frame (its parameter list and body),
/// without descending into a nested function or class's separate frame.
fn scan_local_slots(ast: &Ast, func_node: NodeId, max: &mut i64) {
    if let NodeKind::FuncDef { params, body, .. } = &ast.node(func_node).kind {
        for p in params {
            note_storage(ast, p.node, max);
            if let Some(default) = p.default {
                scan_subtree(ast, default, max);
            }
        }
        scan_subtree(ast, *body, max);
    }
}

fn note_storage(ast: &Ast, node: NodeId, max: &mut i64) {
    if let Some(StorageRef { kind: StorageKind::LocalSlot | StorageKind::ParamSlot, id, set: true }) = ast.node(node).storage {
        *max = (*max).max(id);
    }
}

fn scan_subtree(ast: &Ast, node: NodeId, max: &mut i64) {
    note_storage(ast, node, max);
    match &ast.node(node).kind {
        // Nested functions and classes open their own frame / member
        // namespace; their declarations never share this function's slots.
        NodeKind::FuncDef { .. } | NodeKind::ClassDef { .. } => {}
        NodeKind::Block(stmts) => {
            for s in stmts.clone() {
                scan_subtree(ast, s, max);
            }
        }
        NodeKind::VarDef { initializer, .. } => {
            if let Some(init) = initializer {
                scan_subtree(ast, *init, max);
            }
        }
        NodeKind::For { iterable, body, .. } => {
            scan_subtree(ast, *iterable, max);
            scan_subtree(ast, *body, max);
        }
        NodeKind::If { condition, then_branch, else_branch } => {
            scan_subtree(ast, *condition, max);
            scan_subtree(ast, *then_branch, max);
            if let Some(e) = else_branch {
                scan_subtree(ast, *e, max);
            }
        }
        NodeKind::While { condition, body } => {
            scan_subtree(ast, *condition, max);
            scan_subtree(ast, *body, max);
        }
        NodeKind::Return(Some(v)) => scan_subtree(ast, *v, max),
        NodeKind::Assign { target, value } => {
            scan_subtree(ast, *target, max);
            scan_subtree(ast, *value, max);
        }
        NodeKind::ExprStmt(e) => scan_subtree(ast, *e, max),
        NodeKind::Binary { left, right, .. } => {
            scan_subtree(ast, *left, max);
            scan_subtree(ast, *right, max);
        }
        NodeKind::Unary { operand, .. } => scan_subtree(ast, *operand, max),
        NodeKind::Call { callee, args, .. } => {
            scan_subtree(ast, *callee, max);
            for a in args.clone() {
                scan_subtree(ast, a, max);
            }
        }
        NodeKind::Literal(_) | NodeKind::IdentifierRef(_) | NodeKind::SelfRef | NodeKind::BaseRef | NodeKind::ParamDecl(_) | NodeKind::Import { .. } | NodeKind::Return(None) => {}
    }
}

/// Lower a statement node for effect; any value it produces is discarded.
fn lower_stmt(ast: &Ast, lower: &mut FuncLower, program: &mut Program, node: NodeId) -> Result<(), LowerError> {
    match ast.node(node).kind.clone() {
        NodeKind::Block(stmts) => {
            for s in stmts {
                lower_stmt(ast, lower, program, s)?;
            }
            Ok(())
        }
        NodeKind::VarDef { initializer, .. } => {
            let Some(init) = initializer else { return Ok(()) };
            let value = lower_expr(ast, lower, program, init)?;
            let storage = ast.node(node).storage.ok_or_else(|| internal(ast, "vardef has no storage after resolution"))?;
            store_into(ast, lower, storage, value)
        }
        NodeKind::FuncDef { .. } | NodeKind::ClassDef { .. } => {
            // Lowered independently as its own top-level function/members;
            // encountering the definition inline is a no-op here.
            Ok(())
        }
        NodeKind::Import { .. } => Ok(()),
        NodeKind::For { iterable, body, .. } => {
            let iter_value = lower_expr(ast, lower, program, iterable)?;
            let iter_slot = lower.alloc_slot();
            lower.emit(Instruction::NewIterator { dst: iter_slot, src: iter_value });

            let iter_var_slot = match ast.node(node).storage {
                Some(StorageRef { kind: StorageKind::LocalSlot, id, set: true }) => lower.local_slot(id),
                _ => return Err(internal(ast, "for-loop iterator variable has no local storage")),
            };
            let has_next_slot = lower.alloc_slot();

            let loop_start = lower.alloc_label();
            let loop_end = lower.alloc_label();
            lower.emit(Instruction::JumpTarget { label: loop_start });
            lower.emit(Instruction::Iterate { dst: iter_var_slot, has_next: has_next_slot, iter_slot });
            lower.emit(Instruction::CondJump { cond: has_next_slot, target: loop_end, jump_if_false: true });
            lower_stmt(ast, lower, program, body)?;
            lower.emit(Instruction::Jump { target: loop_start });
            lower.emit(Instruction::JumpTarget { label: loop_end });
            Ok(())
        }
        NodeKind::If { condition, then_branch, else_branch } => {
            let cond_slot = lower_expr(ast, lower, program, condition)?;
            let else_label = lower.alloc_label();
            let end_label = lower.alloc_label();
            lower.emit(Instruction::CondJump { cond: cond_slot, target: else_label, jump_if_false: true });
            lower_stmt(ast, lower, program, then_branch)?;
            lower.emit(Instruction::Jump { target: end_label });
            lower.emit(Instruction::JumpTarget { label: else_label });
            if let Some(e) = else_branch {
                lower_stmt(ast, lower, program, e)?;
            }
            lower.emit(Instruction::JumpTarget { label: end_label });
            Ok(())
        }
        NodeKind::While { condition, body } => {
            let loop_start = lower.alloc_label();
            let loop_end = lower.alloc_label();
            lower.emit(Instruction::JumpTarget { label: loop_start });
            let cond_slot = lower_expr(ast, lower, program, condition)?;
            lower.emit(Instruction::CondJump { cond: cond_slot, target: loop_end, jump_if_false: true });
            lower_stmt(ast, lower, program, body)?;
            lower.emit(Instruction::Jump { target: loop_start });
            lower.emit(Instruction::JumpTarget { label: loop_end });
            Ok(())
        }
        NodeKind::Return(value) => {
            let src = match value {
                Some(v) => Some(lower_expr(ast, lower, program, v)?),
                None => None,
            };
            lower.emit(Instruction::ReturnValue { src });
            Ok(())
        }
        NodeKind::Assign { target, value } => {
            let value_slot = lower_expr(ast, lower, program, value)?;
            lower_assign(ast, lower, program, target, value_slot)?;
            Ok(())
        }
        NodeKind::ExprStmt(e) => {
            lower_expr(ast, lower, program, e)?;
            Ok(())
        }
        other => Err(internal(ast, format!("{other:?} is not a statement"))),
    }
}

fn store_into(ast: &Ast, lower: &mut FuncLower, storage: StorageRef, value: Slot) -> Result<(), LowerError> {
    match storage.kind {
        StorageKind::LocalSlot | StorageKind::ParamSlot => {
            let dst = lower.local_slot(storage.id);
            if dst != value {
                lower.emit(Instruction::ValueCopy { dst, src: value });
            }
            Ok(())
        }
        StorageKind::GlobalVarSlot => {
            lower.emit(Instruction::SetGlobal { global_id: storage.id, src: value });
            Ok(())
        }
        StorageKind::GlobalFuncSlot | StorageKind::GlobalClassSlot => Err(internal(ast, "cannot assign to a function or class name")),
    }
}

fn lower_assign(ast: &Ast, lower: &mut FuncLower, program: &mut Program, target: NodeId, value: Slot) -> Result<(), LowerError> {
    match &ast.node(target).kind {
        NodeKind::IdentifierRef(_) | NodeKind::SelfRef | NodeKind::BaseRef => {
            let storage = ast.node(target).storage.ok_or_else(|| internal(ast, "assignment target has no storage after resolution"))?;
            store_into(ast, lower, storage, value)
        }
        NodeKind::Binary { op: BinOp::MemberByIdentifier, .. } => {
            // No SETMEMBER opcode exists in the closed instruction
            // enumeration; member assignment cannot be
            // lowered to bytecode this interpreter can execute.
            let _ = program;
            Err(internal(ast, "member assignment has no corresponding bytecode instruction"))
        }
        other => Err(internal(ast, format!("{other:?} is not assignable"))),
    }
}

/// Lower an expression, returning the slot its value ends up in. Where the
/// value already lives in a stable slot (a local or parameter), that slot
/// is returned directly rather than copied.
fn lower_expr(ast: &Ast, lower: &mut FuncLower, program: &mut Program, node: NodeId) -> Result<Slot, LowerError> {
    match ast.node(node).kind.clone() {
        NodeKind::Literal(lit) => {
            let dst = lower.alloc_slot();
            let content = match lit {
                Literal::None => ValueContent::None,
                Literal::Bool(b) => ValueContent::Bool(b),
                Literal::Int(i) => ValueContent::Int64(i),
                Literal::Float(f) => ValueContent::Float64(f),
                Literal::Str(s) => ValueContent::ConstPreallocStr(s),
            };
            lower.emit(Instruction::SetConst { dst, content });
            Ok(dst)
        }
        NodeKind::IdentifierRef(_) | NodeKind::SelfRef | NodeKind::BaseRef => {
            let storage = ast.node(node).storage.ok_or_else(|| internal(ast, "identifier has no storage after resolution"))?;
            load_storage(ast, lower, storage)
        }
        NodeKind::Binary { op: BinOp::MemberByIdentifier, left, right } => {
            let obj = lower_expr(ast, lower, program, left)?;
            let member_name = match &ast.node(right).kind {
                NodeKind::IdentifierRef(n) => n.clone(),
                _ => return Err(internal(ast, "member access right-hand side is not an identifier")),
            };
            let member_name_id = program
                .symbols
                .lookup_member_id(&member_name)
                .ok_or_else(|| internal(ast, format!("member '{member_name}' was never interned during resolution")))?;
            let dst = lower.alloc_slot();
            lower.emit(Instruction::GetMember { dst, obj, member_name_id });
            Ok(dst)
        }
        NodeKind::Binary { op, left, right } => {
            let l = lower_expr(ast, lower, program, left)?;
            let r = lower_expr(ast, lower, program, right)?;
            let dst = lower.alloc_slot();
            lower.emit(Instruction::BinOp { dst, op: arith_op(op)?, left: l, right: r });
            Ok(dst)
        }
        NodeKind::Unary { op, operand } => {
            let v = lower_expr(ast, lower, program, operand)?;
            let dst = lower.alloc_slot();
            let op = match op {
                UnOp::Neg => UnaryArithOp::Neg,
                UnOp::Not => UnaryArithOp::Not,
            };
            lower.emit(Instruction::UnOp { dst, op, operand: v });
            Ok(dst)
        }
        NodeKind::Call { callee, args, .. } => {
            let callee_slot = lower_expr(ast, lower, program, callee)?;
            let callee_slot = lower.materialize(callee_slot);
            let mut args_base: Option<Slot> = None;
            let mut count: u16 = 0;
            for a in args {
                let v = lower_expr(ast, lower, program, a)?;
                let fixed = lower.materialize(v);
                if args_base.is_none() {
                    args_base = Some(fixed);
                }
                count += 1;
            }
            let dst = lower.alloc_slot();
            lower.emit(Instruction::Call { dst, callee_slot, args_base: args_base.unwrap_or(dst), arg_count: count });
            Ok(dst)
        }
        other => Err(internal(ast, format!("{other:?} is not an expression"))),
    }
}

fn load_storage(_ast: &Ast, lower: &mut FuncLower, storage: StorageRef) -> Result<Slot, LowerError> {
    match storage.kind {
        StorageKind::LocalSlot | StorageKind::ParamSlot => Ok(lower.local_slot(storage.id)),
        StorageKind::GlobalVarSlot => {
            let dst = lower.alloc_slot();
            lower.emit(global_load(GlobalRef::Var(storage.id), dst));
            Ok(dst)
        }
        StorageKind::GlobalFuncSlot => {
            let dst = lower.alloc_slot();
            lower.emit(global_load(GlobalRef::Func(storage.id), dst));
            Ok(dst)
        }
        StorageKind::GlobalClassSlot => {
            let dst = lower.alloc_slot();
            lower.emit(global_load(GlobalRef::Class(storage.id), dst));
            Ok(dst)
        }
    }
}

fn global_load(r: GlobalRef, dst: Slot) -> Instruction {
    match r {
        GlobalRef::Var(id) => Instruction::GetGlobal { dst, global_id: id },
        GlobalRef::Func(id) => Instruction::GetFunc { dst, func_id: id },
        GlobalRef::Class(id) => Instruction::GetClass { dst, class_id: id },
    }
}

fn arith_op(op: BinOp) -> Result<ArithOp, LowerError> {
    Ok(match op {
        BinOp::Add => ArithOp::Add,
        BinOp::Sub => ArithOp::Sub,
        BinOp::Mul => ArithOp::Mul,
        BinOp::Div => ArithOp::Div,
        BinOp::Mod => ArithOp::Mod,
        BinOp::Eq => ArithOp::Eq,
        BinOp::NotEq => ArithOp::NotEq,
        BinOp::Lt => ArithOp::Lt,
        BinOp::LtEq => ArithOp::LtEq,
        BinOp::Gt => ArithOp::Gt,
        BinOp::GtEq => ArithOp::GtEq,
        BinOp::And => ArithOp::And,
        BinOp::Or => ArithOp::Or,
        BinOp::MemberByIdentifier => unreachable!("handled by its own match arm"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{ProjectLoader, Resolver};
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct MemoryLoader {
        files: RefCell<HashMap<String, String>>,
    }

    impl MemoryLoader {
        fn new(files: &[(&str, &str)]) -> Self {
            let mut map = HashMap::new();
            for (uri, src) in files {
                map.insert((*uri).to_string(), (*src).to_string());
            }
            Self { files: RefCell::new(map) }
        }
    }

    impl ProjectLoader for MemoryLoader {
        fn get_file_sub_project_path(&self, _file_uri: &str) -> Result<(String, Option<String>), crate::resolver::LoaderError> {
            Ok(("file:///proj".to_string(), None))
        }
        fn resolve_import(&self, _source_file_uri: &str, import_elements: &[String], _library: Option<&str>) -> Result<String, crate::resolver::LoaderError> {
            Ok(format!("file:///proj/{}.ember", import_elements.join("/")))
        }
        fn read_source(&self, file_uri: &str) -> Result<String, crate::resolver::LoaderError> {
            self.files.borrow().get(file_uri).cloned().ok_or_else(|| crate::resolver::LoaderError::NotFound(file_uri.to_string()))
        }
    }

    fn build(source: &str) -> (Program, Vec<Ast>, AstId) {
        let loader = MemoryLoader::new(&[("file:///proj/a.ember", source)]);
        let mut resolver = Resolver::new(loader);
        let mut program = Program::new();
        crate::builtins::register_error_classes(&mut program).unwrap();
        crate::builtins::register_funcs(&mut program).unwrap();
        let entry = resolver.resolve_entry(&mut program, "file:///proj/a.ember", true).unwrap();
        assert!(resolver.ast(entry).result_messages.success, "{:?}", resolver.ast(entry).result_messages.messages);
        (program, resolver.into_asts(), entry)
    }

    #[test]
    fn lowers_a_constant_returning_function() {
        let (mut program, asts, _entry) = build("func main { return 7 }");
        lower_program(&asts, &mut program).unwrap();
        let main_id = program.main_func_id;
        assert!(!program.functions[main_id as usize].instructions.is_empty());
        let mut interp = crate::vm::Interpreter::new();
        crate::builtins::register_natives(&mut interp);
        let result = interp.execute_function(&mut program, main_id, &[]).unwrap();
        assert_eq!(result, ValueContent::Int64(7));
        assert_eq!(interp.stack.len(), 0);
    }

    #[test]
    fn lowers_arithmetic_and_a_call_between_functions() {
        let (mut program, asts, _entry) = build("func add(a, b) { return a + b }\nfunc main { return add(3, 4) }");
        lower_program(&asts, &mut program).unwrap();
        let mut interp = crate::vm::Interpreter::new();
        crate::builtins::register_natives(&mut interp);
        let result = interp.execute_function(&mut program, program.main_func_id, &[]).unwrap();
        assert_eq!(result, ValueContent::Int64(7));
    }

    #[test]
    fn lowers_a_while_loop_accumulating_into_a_local() {
        let source = "func main { var i = 0 var total = 0 while i < 5 { total = total + i i = i + 1 } return total }";
        let (mut program, asts, _entry) = build(source);
        lower_program(&asts, &mut program).unwrap();
        let mut interp = crate::vm::Interpreter::new();
        crate::builtins::register_natives(&mut interp);
        let result = interp.execute_function(&mut program, program.main_func_id, &[]).unwrap();
        assert_eq!(result, ValueContent::Int64(10));
    }

    #[test]
    fn division_by_zero_is_a_catchable_exception_not_a_panic() {
        let (mut program, asts, _entry) = build("func main { return 1 / 0 }");
        lower_program(&asts, &mut program).unwrap();
        let mut interp = crate::vm::Interpreter::new();
        crate::builtins::register_natives(&mut interp);
        let err = interp.execute_function(&mut program, program.main_func_id, &[]).unwrap_err();
        match err {
            crate::vm::VmError::Exception(exc) => assert_eq!(exc.class_id, program.builtin_classes.division_by_zero_error),
            other => panic!("expected a DivisionByZeroError exception, got {other:?}"),
        }
    }
}
