//! Bytecode interpreter.
//!
//! A single per-thread loop dispatches on [`Instruction`] variants (the
//! variant tag stands in for the source's jump table -- see
//! [`crate::bytecode`]'s module doc). `CALL` is implemented with ordinary
//! Rust recursion: the host call stack mirrors the VM call stack one frame
//! per `execute_function` invocation, which gives every instruction inside
//! a function direct, panic-free access to "the currently active frame"
//! without a hand-maintained frame-pointer stack.

pub mod heap;
pub mod stack;

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::bytecode::{resolve_jump_targets, ArithOp, Instruction, UnaryArithOp};
use crate::program::value::ValueContent;
use crate::program::Program;
use heap::{GcPayload, Heap, IteratorState};
use stack::Stack;

#[derive(Debug, Clone)]
pub struct RuntimeException {
    pub class_id: i64,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub enum VmError {
    Exception(RuntimeException),
    /// Unknown instruction tag, internal assertion failure, heap OOM: all
    /// unrecoverable, unlike an ordinary script-level exception.
    Fatal(String),
}

pub type NativeFn = fn(&mut Interpreter, &mut Program, &[ValueContent]) -> Result<ValueContent, VmError>;

struct CatchFrame {
    handler_target: usize,
    caught_classes: Vec<i64>,
}

/// Per-VM-thread runtime state. Each VM thread owns a distinct
/// [`Stack`] and [`Heap`] -- no value-content is ever shared across
/// threads.
pub struct Interpreter {
    pub heap: Heap,
    pub stack: Stack,
    floor: usize,
    natives: HashMap<i64, NativeFn>,
    /// The exception currently being unwound through a matched catch
    /// frame, readable by the instructions a lowering stage emits inside
    /// the handler block. There is no dedicated "load current exception"
    /// opcode in the closed instruction set; this field plays that role
    /// (see DESIGN.md).
    pub current_exception: Option<RuntimeException>,
}

impl Interpreter {
    pub fn new() -> Self {
        Self { heap: Heap::new(), stack: Stack::new(), floor: 0, natives: HashMap::new(), current_exception: None }
    }

    pub fn register_native(&mut self, func_id: i64, f: NativeFn) {
        self.natives.insert(func_id, f);
    }

    fn slot_index(&self, slot: u16) -> usize {
        self.floor + slot as usize
    }

    /// Increment whatever refcount a copied value-content implies: bumping
    /// the GC value's external refcount when the copy is a `GCVAL`
    /// (`setconst`/`valuecopy`).
    fn retain_copy(&mut self, value: &ValueContent) {
        if let ValueContent::GcVal(h) = value {
            self.heap.retain_external(*h);
        }
    }

    fn release_slot(&mut self, value: ValueContent) {
        if let ValueContent::GcVal(h) = value {
            self.heap.release_external(h);
        }
    }

    fn class_matches(&self, program: &Program, class_id: i64, caught: i64) -> bool {
        let mut current = class_id;
        loop {
            if current == caught {
                return true;
            }
            match program.classes.get(current as usize).and_then(|c| c.base_class_id) {
                Some(base) => current = base,
                None => return false,
            }
        }
    }

    /// Execute `func_id` with `args` already evaluated in the caller's
    /// frame. Allocates `input_stack_size` slots above the current stack
    /// top, establishes a new floor there, runs the function body, then
    /// restores the caller's floor and stack height.
    pub fn execute_function(&mut self, program: &mut Program, func_id: i64, args: &[ValueContent]) -> Result<ValueContent, VmError> {
        let entry = program.functions[func_id as usize].clone();
        if entry.iscfunc {
            let native = *self
                .natives
                .get(&func_id)
                .ok_or_else(|| VmError::Fatal(format!("no native binding for c function {func_id}")))?;
            return native(self, program, args);
        }

        let new_floor = self.stack.len();
        let frame_size = (entry.input_stack_size as usize).max(args.len());
        self.stack.to_size(new_floor + frame_size, true).map_err(|_| VmError::Fatal("stack overflow".into()))?;
        for (i, arg) in args.iter().enumerate() {
            self.retain_copy(arg);
            *self.stack.get_mut(new_floor + i) = arg.clone();
        }

        let saved_floor = self.floor;
        self.floor = new_floor;
        log::trace!("entering function {func_id}\n{}", self.stack.debug_dump());
        let result = self.run(program, &entry.instructions);
        log::trace!("leaving function {func_id}\n{}", self.stack.debug_dump());
        self.floor = saved_floor;

        for i in 0..frame_size {
            let v = std::mem::replace(self.stack.get_mut(new_floor + i), ValueContent::None);
            self.release_slot(v);
        }
        self.stack.to_size(new_floor, false).map_err(|_| VmError::Fatal("stack shrink failed".into()))?;

        result
    }

    /// The instruction loop for one function invocation's body.
    fn run(&mut self, program: &mut Program, instructions: &[Instruction]) -> Result<ValueContent, VmError> {
        let labels = resolve_jump_targets(instructions);
        let mut catch_frames: Vec<CatchFrame> = Vec::new();
        let mut pc: usize = 0;

        while pc < instructions.len() {
            match self.step(program, instructions, &labels, &mut catch_frames, &mut pc) {
                Ok(Some(return_value)) => return Ok(return_value),
                Ok(None) => continue,
                Err(VmError::Exception(exc)) => match self.find_catch(program, &catch_frames, exc.class_id) {
                    Some((idx, target)) => {
                        catch_frames.truncate(idx);
                        self.current_exception = Some(exc);
                        pc = target;
                    }
                    Option::None => return Err(VmError::Exception(exc)),
                },
                Err(fatal) => return Err(fatal),
            }
        }
        Ok(ValueContent::None)
    }

    fn find_catch(&self, program: &Program, frames: &[CatchFrame], class_id: i64) -> Option<(usize, usize)> {
        for (idx, frame) in frames.iter().enumerate().rev() {
            if frame.caught_classes.iter().any(|&c| self.class_matches(program, class_id, c)) {
                return Some((idx, frame.handler_target));
            }
        }
        None
    }

    /// Execute a single instruction. Returns `Ok(Some(value))` on
    /// `RETURNVALUE`, `Ok(None)` to keep looping (the instruction already
    /// advanced `pc`), or an error to unwind.
    fn step(
        &mut self,
        program: &mut Program,
        instructions: &[Instruction],
        labels: &HashMap<usize, usize>,
        catch_frames: &mut Vec<CatchFrame>,
        pc: &mut usize,
    ) -> Result<Option<ValueContent>, VmError> {
        let inst = &instructions[*pc];
        match inst {
            Instruction::SetConst { dst, content } => {
                let idx = self.slot_index(*dst);
                let old = std::mem::replace(self.stack.get_mut(idx), ValueContent::None);
                self.release_slot(old);
                let materialized = match content {
                    ValueContent::ConstPreallocStr(s) => {
                        let handle = self.heap.alloc_string(s.clone());
                        ValueContent::GcVal(handle)
                    }
                    other => {
                        self.retain_copy(other);
                        other.clone()
                    }
                };
                *self.stack.get_mut(idx) = materialized;
            }
            Instruction::ValueCopy { dst, src } => {
                let v = self.stack.get(self.slot_index(*src)).clone();
                self.retain_copy(&v);
                let idx = self.slot_index(*dst);
                let old = std::mem::replace(self.stack.get_mut(idx), v);
                self.release_slot(old);
            }
            Instruction::SetGlobal { global_id, src } => {
                let v = self.stack.get(self.slot_index(*src)).clone();
                self.retain_copy(&v);
                let global = &mut program.globals[*global_id as usize];
                let old = std::mem::replace(&mut global.value, v);
                self.release_slot(old);
            }
            Instruction::GetGlobal { dst, global_id } => {
                let v = program.globals[*global_id as usize].value.clone();
                self.retain_copy(&v);
                let idx = self.slot_index(*dst);
                let old = std::mem::replace(self.stack.get_mut(idx), v);
                self.release_slot(old);
            }
            Instruction::GetFunc { dst, func_id } => {
                let handle = self.heap.alloc(GcPayload::Function { func_id: *func_id, bound_self: None });
                let idx = self.slot_index(*dst);
                let old = std::mem::replace(self.stack.get_mut(idx), ValueContent::GcVal(handle));
                self.release_slot(old);
            }
            Instruction::GetClass { dst, class_id } => {
                let handle = self.heap.alloc(GcPayload::ClassRef(*class_id));
                let idx = self.slot_index(*dst);
                let old = std::mem::replace(self.stack.get_mut(idx), ValueContent::GcVal(handle));
                self.release_slot(old);
            }
            Instruction::GetMember { dst, obj, member_name_id } => {
                let result = self.get_member(program, self.slot_index(*obj), *member_name_id)?;
                let idx = self.slot_index(*dst);
                let old = std::mem::replace(self.stack.get_mut(idx), result);
                self.release_slot(old);
            }
            Instruction::BinOp { dst, op, left, right } => {
                let l = self.stack.get(self.slot_index(*left)).clone();
                let r = self.stack.get(self.slot_index(*right)).clone();
                let result = self.eval_binop(program, *op, &l, &r)?;
                self.retain_copy(&result);
                let idx = self.slot_index(*dst);
                let old = std::mem::replace(self.stack.get_mut(idx), result);
                self.release_slot(old);
            }
            Instruction::UnOp { dst, op, operand } => {
                let v = self.stack.get(self.slot_index(*operand)).clone();
                let result = self.eval_unop(*op, &v)?;
                self.retain_copy(&result);
                let idx = self.slot_index(*dst);
                let old = std::mem::replace(self.stack.get_mut(idx), result);
                self.release_slot(old);
            }
            Instruction::Call { dst, callee_slot, args_base, arg_count } => {
                let callee = self.stack.get(self.slot_index(*callee_slot)).clone();
                let (func_id, bound_self) = match callee {
                    ValueContent::GcVal(h) => match &self.heap.get(h).payload {
                        GcPayload::Function { func_id, bound_self } => (*func_id, bound_self.clone()),
                        _ => return Err(VmError::Fatal("call target is not a function".into())),
                    },
                    _ => return Err(VmError::Fatal("call target is not a function".into())),
                };
                let mut args: SmallVec<[ValueContent; 8]> = SmallVec::with_capacity(*arg_count as usize + 1);
                if let Some(boxed) = bound_self {
                    args.push(*boxed);
                }
                for i in 0..*arg_count {
                    args.push(self.stack.get(self.slot_index(args_base + i)).clone());
                }
                let result = self.execute_function(program, func_id, &args)?;
                let idx = self.slot_index(*dst);
                let old = std::mem::replace(self.stack.get_mut(idx), result);
                self.release_slot(old);
            }
            Instruction::SetTop { .. } => {}
            Instruction::ReturnValue { src } => {
                let value = match src {
                    Some(slot) => {
                        let v = self.stack.get(self.slot_index(*slot)).clone();
                        self.retain_copy(&v);
                        v
                    }
                    None => ValueContent::None,
                };
                return Ok(Some(value));
            }
            Instruction::JumpTarget { .. } => {}
            Instruction::Jump { target } => {
                *pc = *labels.get(target).ok_or_else(|| VmError::Fatal("unresolved jump target".into()))?;
                return Ok(None);
            }
            Instruction::CondJump { cond, target, jump_if_false } => {
                let truthy = self.stack.get(self.slot_index(*cond)).truthy();
                if truthy != *jump_if_false {
                    *pc = *labels.get(target).ok_or_else(|| VmError::Fatal("unresolved jump target".into()))?;
                    return Ok(None);
                }
            }
            Instruction::JumpToFinally { target } => {
                *pc = *labels.get(target).ok_or_else(|| VmError::Fatal("unresolved jump target".into()))?;
                return Ok(None);
            }
            Instruction::NewIterator { dst, src } => {
                let source = match self.stack.get(self.slot_index(*src)) {
                    ValueContent::GcVal(h) => *h,
                    _ => return Err(VmError::Fatal("cannot iterate a non-container value".into())),
                };
                self.heap.retain_heap(source);
                let handle = self.heap.alloc(GcPayload::Iterator(IteratorState::Sequence { source, index: 0 }));
                let idx = self.slot_index(*dst);
                let old = std::mem::replace(self.stack.get_mut(idx), ValueContent::GcVal(handle));
                self.release_slot(old);
            }
            Instruction::Iterate { dst, has_next, iter_slot } => {
                self.step_iterate(*dst, *has_next, *iter_slot)?;
            }
            Instruction::PushCatchFrame { handler_target } => {
                let target = *labels.get(handler_target).ok_or_else(|| VmError::Fatal("unresolved catch target".into()))?;
                catch_frames.push(CatchFrame { handler_target: target, caught_classes: Vec::new() });
            }
            Instruction::AddCatchType { class_id } => {
                catch_frames.last_mut().ok_or_else(|| VmError::Fatal("ADDCATCHTYPE with no active catch frame".into()))?.caught_classes.push(*class_id);
            }
            Instruction::AddCatchTypeByRef { class_slot } => {
                let class_id = match self.stack.get(self.slot_index(*class_slot)) {
                    ValueContent::GcVal(h) => match self.heap.get(*h).payload {
                        GcPayload::ClassRef(id) => id,
                        _ => return Err(VmError::Fatal("ADDCATCHTYPEBYREF operand is not a class reference".into())),
                    },
                    _ => return Err(VmError::Fatal("ADDCATCHTYPEBYREF operand is not a class reference".into())),
                };
                catch_frames.last_mut().ok_or_else(|| VmError::Fatal("ADDCATCHTYPEBYREF with no active catch frame".into()))?.caught_classes.push(class_id);
            }
            Instruction::PopCatchFrame => {
                catch_frames.pop();
            }
            Instruction::NewList { dst } => self.alloc_into(*dst, GcPayload::List(Vec::new())),
            Instruction::AddToList { list, value } => {
                let v = self.stack.get(self.slot_index(*value)).clone();
                self.retain_copy(&v);
                self.mutate_container(*list, |c| if let GcPayload::List(items) = c { items.push(v) })?;
            }
            Instruction::NewSet { dst } => self.alloc_into(*dst, GcPayload::Set(Vec::new())),
            Instruction::AddToSet { set, value } => {
                let v = self.stack.get(self.slot_index(*value)).clone();
                let handle = match self.stack.get(self.slot_index(*set)) {
                    ValueContent::GcVal(h) => *h,
                    _ => return Err(VmError::Fatal("ADDTOSET target is not a set".into())),
                };
                let items = match &self.heap.get(handle).payload {
                    GcPayload::Set(items) => items.clone(),
                    _ => return Err(VmError::Fatal("ADDTOSET target is not a set".into())),
                };
                if !items.iter().any(|existing| self.heap.equal(existing, &v)) {
                    self.retain_copy(&v);
                    if let GcPayload::Set(items) = &mut self.heap.get_mut(handle).payload {
                        items.push(v);
                    }
                }
            }
            Instruction::NewVector { dst, capacity } => self.alloc_into(*dst, GcPayload::Vector(vec![ValueContent::None; *capacity as usize])),
            Instruction::PutVector { vector, index, value } => {
                let v = self.stack.get(self.slot_index(*value)).clone();
                self.retain_copy(&v);
                let idx = *index as usize;
                self.mutate_container(*vector, |c| {
                    if let GcPayload::Vector(items) = c {
                        if idx < items.len() {
                            items[idx] = v;
                        }
                    }
                })?;
            }
            Instruction::NewMap { dst } => self.alloc_into(*dst, GcPayload::Map(Vec::new())),
            Instruction::PutMap { map, key, value } => {
                let k = self.stack.get(self.slot_index(*key)).clone();
                let v = self.stack.get(self.slot_index(*value)).clone();
                self.retain_copy(&k);
                self.retain_copy(&v);
                let handle = match self.stack.get(self.slot_index(*map)) {
                    ValueContent::GcVal(h) => *h,
                    _ => return Err(VmError::Fatal("PUTMAP target is not a map".into())),
                };
                // Take the entries out so `map_put`'s equality check can borrow
                // the heap immutably while this same handle's payload is
                // logically "checked out" for mutation.
                let mut entries = match &mut self.heap.get_mut(handle).payload {
                    GcPayload::Map(e) => std::mem::take(e),
                    _ => return Err(VmError::Fatal("PUTMAP target is not a map".into())),
                };
                heap::map_put(&mut entries, &mut self.heap, k, v);
                if let GcPayload::Map(e) = &mut self.heap.get_mut(handle).payload {
                    *e = entries;
                }
            }
        }
        *pc += 1;
        Ok(None)
    }

    fn alloc_into(&mut self, dst: u16, payload: GcPayload) {
        let handle = self.heap.alloc(payload);
        let idx = self.slot_index(dst);
        let old = std::mem::replace(self.stack.get_mut(idx), ValueContent::GcVal(handle));
        self.release_slot(old);
    }

    fn mutate_container(&mut self, slot: u16, f: impl FnOnce(&mut GcPayload)) -> Result<(), VmError> {
        match self.stack.get(self.slot_index(slot)) {
            ValueContent::GcVal(h) => {
                let h = *h;
                f(&mut self.heap.get_mut(h).payload);
                Ok(())
            }
            _ => Err(VmError::Fatal("container operation on a non-GC value".into())),
        }
    }

    fn step_iterate(&mut self, dst: u16, has_next: u16, iter_slot: u16) -> Result<(), VmError> {
        let iter_handle = match self.stack.get(self.slot_index(iter_slot)) {
            ValueContent::GcVal(h) => *h,
            _ => return Err(VmError::Fatal("ITERATE on a non-iterator value".into())),
        };
        let IteratorState::Sequence { source, index } = self.heap.get(iter_handle).payload.clone_iter_state();
        let item = match &self.heap.get(source).payload {
            GcPayload::List(items) | GcPayload::Set(items) | GcPayload::Vector(items) => items.get(index).cloned(),
            _ => return Err(VmError::Fatal("ITERATE source is not a sequence".into())),
        };
        match item {
            Some(value) => {
                self.retain_copy(&value);
                if let GcPayload::Iterator(IteratorState::Sequence { index: idx, .. }) = &mut self.heap.get_mut(iter_handle).payload {
                    *idx += 1;
                }
                let dst_idx = self.slot_index(dst);
                let old = std::mem::replace(self.stack.get_mut(dst_idx), value);
                self.release_slot(old);
                let has_next_idx = self.slot_index(has_next);
                let old_hn = std::mem::replace(self.stack.get_mut(has_next_idx), ValueContent::Bool(true));
                self.release_slot(old_hn);
            }
            Option::None => {
                let has_next_idx = self.slot_index(has_next);
                let old_hn = std::mem::replace(self.stack.get_mut(has_next_idx), ValueContent::Bool(false));
                self.release_slot(old_hn);
            }
        }
        Ok(())
    }

    fn get_member(&mut self, program: &Program, obj_idx: usize, member_name_id: i64) -> Result<ValueContent, VmError> {
        let handle = match self.stack.get(obj_idx) {
            ValueContent::GcVal(h) => *h,
            _ => return Err(VmError::Fatal("GETMEMBER on a non-object value".into())),
        };
        let class_id = match &self.heap.get(handle).payload {
            GcPayload::Object { class_id, .. } => *class_id,
            _ => return Err(VmError::Fatal("GETMEMBER on a non-object value".into())),
        };
        let (var_id, func_id) = program.lookup_class_member(class_id, member_name_id);
        if var_id >= 0 {
            let v = match &self.heap.get(handle).payload {
                GcPayload::Object { vars, .. } => vars[var_id as usize].clone(),
                _ => unreachable!(),
            };
            self.retain_copy(&v);
            Ok(v)
        } else if func_id >= 0 {
            let bound_self = Some(Box::new(ValueContent::GcVal(handle)));
            self.heap.retain_external(handle);
            Ok(ValueContent::GcVal(self.heap.alloc(GcPayload::Function { func_id, bound_self })))
        } else {
            Err(VmError::Fatal(format!("class {class_id} has no member with that name")))
        }
    }

    fn eval_binop(&mut self, program: &Program, op: ArithOp, l: &ValueContent, r: &ValueContent) -> Result<ValueContent, VmError> {
        use ArithOp::*;
        if matches!(op, Eq | NotEq) {
            let eq = self.heap.equal(l, r);
            return Ok(ValueContent::Bool(if op == Eq { eq } else { !eq }));
        }
        if matches!(op, And | Or) {
            let lt = l.truthy();
            return Ok(match op {
                And => ValueContent::Bool(lt && r.truthy()),
                Or => ValueContent::Bool(lt || r.truthy()),
                _ => unreachable!(),
            });
        }
        match (l, r) {
            (ValueContent::Int64(a), ValueContent::Int64(b)) => Self::int_binop(program, op, *a, *b),
            (ValueContent::Float64(_), _) | (_, ValueContent::Float64(_)) => {
                let a = Self::as_f64(l)?;
                let b = Self::as_f64(r)?;
                Self::float_binop(op, a, b)
            }
            _ => Err(VmError::Fatal("BINOP operand types do not support this operator".into())),
        }
    }

    fn as_f64(v: &ValueContent) -> Result<f64, VmError> {
        match v {
            ValueContent::Int64(i) => Ok(*i as f64),
            ValueContent::Float64(f) => Ok(*f),
            _ => Err(VmError::Fatal("expected a numeric value".into())),
        }
    }

    /// Division and modulo by zero are ordinary, catchable runtime
    /// exceptions, not fatal VM errors: they are reachable
    /// from well-typed source code, unlike a malformed opcode stream.
    fn int_binop(program: &Program, op: ArithOp, a: i64, b: i64) -> Result<ValueContent, VmError> {
        use ArithOp::*;
        let div_by_zero = || {
            VmError::Exception(RuntimeException {
                class_id: program.builtin_classes.division_by_zero_error,
                message: Some("division by zero".to_string()),
            })
        };
        Ok(match op {
            Add => ValueContent::Int64(a.wrapping_add(b)),
            Sub => ValueContent::Int64(a.wrapping_sub(b)),
            Mul => ValueContent::Int64(a.wrapping_mul(b)),
            Div => {
                if b == 0 {
                    return Err(div_by_zero());
                }
                ValueContent::Int64(a.wrapping_div(b))
            }
            Mod => {
                if b == 0 {
                    return Err(div_by_zero());
                }
                ValueContent::Int64(a.wrapping_rem(b))
            }
            Lt => ValueContent::Bool(a < b),
            LtEq => ValueContent::Bool(a <= b),
            Gt => ValueContent::Bool(a > b),
            GtEq => ValueContent::Bool(a >= b),
            Eq | NotEq | And | Or => unreachable!("handled above"),
        })
    }

    fn float_binop(op: ArithOp, a: f64, b: f64) -> Result<ValueContent, VmError> {
        use ArithOp::*;
        Ok(match op {
            Add => ValueContent::Float64(a + b),
            Sub => ValueContent::Float64(a - b),
            Mul => ValueContent::Float64(a * b),
            Div => ValueContent::Float64(a / b),
            Mod => ValueContent::Float64(a % b),
            Lt => ValueContent::Bool(a < b),
            LtEq => ValueContent::Bool(a <= b),
            Gt => ValueContent::Bool(a > b),
            GtEq => ValueContent::Bool(a >= b),
            Eq | NotEq | And | Or => unreachable!("handled above"),
        })
    }

    fn eval_unop(&mut self, op: UnaryArithOp, v: &ValueContent) -> Result<ValueContent, VmError> {
        match (op, v) {
            (UnaryArithOp::Neg, ValueContent::Int64(i)) => Ok(ValueContent::Int64(-i)),
            (UnaryArithOp::Neg, ValueContent::Float64(f)) => Ok(ValueContent::Float64(-f)),
            (UnaryArithOp::Not, other) => Ok(ValueContent::Bool(!other.truthy())),
            _ => Err(VmError::Fatal("UNOP operand type does not support this operator".into())),
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl GcPayload {
    fn clone_iter_state(&self) -> IteratorState {
        match self {
            GcPayload::Iterator(state) => state.clone(),
            _ => panic!("not an iterator GC value"),
        }
    }
}

/// `execute_program`: run `global_init_func` if present, then
/// `main_func`, on one thread. Returns the process exit code: `0` on a
/// clean return, `1` on an uncaught exception (after printing a
/// diagnostic describing it).
pub fn execute_program(program: &mut Program) -> i32 {
    let mut interp = Interpreter::new();
    crate::builtins::register_natives(&mut interp);

    if program.global_init_func_id >= 0 {
        if let Err(e) = interp.execute_function(program, program.global_init_func_id, &[]) {
            return report_uncaught(program, e);
        }
    }
    if program.main_func_id >= 0 {
        if let Err(e) = interp.execute_function(program, program.main_func_id, &[]) {
            return report_uncaught(program, e);
        }
    }
    0
}

fn report_uncaught(program: &Program, err: VmError) -> i32 {
    match err {
        VmError::Exception(exc) => {
            let name = class_name(program, exc.class_id);
            eprintln!("Uncaught {name}");
            1
        }
        VmError::Fatal(msg) => {
            eprintln!("fatal VM error: {msg}");
            1
        }
    }
}

fn class_name(program: &Program, class_id: i64) -> String {
    program
        .classes
        .get(class_id as usize)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| format!("<class {class_id}>"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Instruction;

    fn build(instructions: Vec<Instruction>, input_stack_size: i64) -> (Program, i64) {
        let mut program = Program::new();
        let func_id = program.register_source_function(Some("f"), None, 0, None, false, false, None, None, -1).unwrap();
        program.functions[func_id as usize].instructions = instructions;
        program.functions[func_id as usize].input_stack_size = input_stack_size;
        (program, func_id)
    }

    #[test]
    fn setconst_materializes_a_prealloc_string_into_a_fresh_heap_string() {
        let (mut program, func_id) = build(
            vec![
                Instruction::SetConst { dst: 0, content: ValueContent::ConstPreallocStr("hi".to_string()) },
                Instruction::ReturnValue { src: Some(0) },
            ],
            1,
        );
        let mut interp = Interpreter::new();
        let result = interp.execute_function(&mut program, func_id, &[]).unwrap();
        match result {
            ValueContent::GcVal(h) => assert_eq!(interp.heap.string_text(h), "hi"),
            other => panic!("expected a materialized GcVal string, got {other:?}"),
        }
    }

    #[test]
    fn setconst_copies_a_scalar_by_value() {
        let (mut program, func_id) =
            build(vec![Instruction::SetConst { dst: 0, content: ValueContent::Int64(42) }, Instruction::ReturnValue { src: Some(0) }], 1);
        let mut interp = Interpreter::new();
        let result = interp.execute_function(&mut program, func_id, &[]).unwrap();
        assert_eq!(result, ValueContent::Int64(42));
    }

    #[test]
    fn setconst_executed_twice_allocates_a_fresh_string_each_time() {
        // setconst never stores a GC value back into the instruction's own
        // payload -- each execution reads the original `ConstPreallocStr`
        // and allocates anew.
        let (mut program, func_id) = build(
            vec![
                Instruction::SetConst { dst: 0, content: ValueContent::ConstPreallocStr("x".to_string()) },
                Instruction::SetConst { dst: 1, content: ValueContent::ConstPreallocStr("x".to_string()) },
                Instruction::ReturnValue { src: Some(0) },
            ],
            2,
        );
        let mut interp = Interpreter::new();
        interp.execute_function(&mut program, func_id, &[]).unwrap();
        assert_eq!(interp.heap.live_count(), 0, "frame teardown should release both temporaries");
    }

    #[test]
    fn execute_function_restores_stack_height_and_floor_after_return() {
        let (mut program, func_id) =
            build(vec![Instruction::SetConst { dst: 0, content: ValueContent::Int64(1) }, Instruction::ReturnValue { src: None }], 3);
        let mut interp = Interpreter::new();
        let before = interp.stack.len();
        interp.execute_function(&mut program, func_id, &[]).unwrap();
        assert_eq!(interp.stack.len(), before);
    }

    #[test]
    fn uncaught_exception_is_reported_and_yields_exit_code_one() {
        let mut program = Program::new();
        crate::builtins::register_error_classes(&mut program).unwrap();
        let func_id = program.register_source_function(Some("main"), None, 0, None, false, false, None, None, -1).unwrap();
        program.functions[func_id as usize].instructions = vec![Instruction::BinOp {
            dst: 0,
            op: ArithOp::Div,
            left: 1,
            right: 2,
        }];
        program.functions[func_id as usize].input_stack_size = 3;
        program.main_func_id = func_id;
        // left/right default to Int64(0)/Int64(0) via zero-fill, so this divides by zero.
        let code = execute_program(&mut program);
        assert_eq!(code, 1);
    }
}
