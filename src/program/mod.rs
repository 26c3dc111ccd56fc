//! Program object model: the central mutable registry of
//! functions, classes, globals, and debug symbols, built up incrementally
//! during resolution and consumed by lowering and the interpreter.
//!
//! Per DESIGN NOTES: rather than hand-rolled realloc-and-unwind rollback,
//! every registration builds a fresh owned value on the side and commits
//! it with a single push at the end. A fallible step returning early drops
//! that side-built value and leaves the program table untouched -- no
//! explicit unwinding code is needed.

pub mod class;
pub mod function;
pub mod symbols;
pub mod value;

use class::{ClassEntry, MemberRegisterError};
use function::FunctionEntry;
use symbols::{ClassSymbol, DebugSymbols, FunctionSymbol, GlobalVarSymbol};
use value::ValueContent;

#[derive(Debug, Clone)]
pub struct GlobalEntry {
    pub value: ValueContent,
    pub is_const: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    DuplicateName,
    OutOfMemory,
}

impl From<MemberRegisterError> for RegisterError {
    fn from(e: MemberRegisterError) -> Self {
        match e {
            MemberRegisterError::DuplicateMember => RegisterError::DuplicateName,
            MemberRegisterError::TooManyMethods => RegisterError::OutOfMemory,
        }
    }
}

/// Well-known method name ids, resolved once against the builtin module's
/// member-name table so the interpreter never has to re-intern them on the
/// hot path.
#[derive(Debug, Clone, Copy, Default)]
pub struct WellKnownMethods {
    pub to_str: i64,
    pub length: i64,
    pub init: i64,
    pub destroy: i64,
    pub clone: i64,
    pub equals: i64,
    pub hash: i64,
}

/// Class ids for the builtin exception hierarchy, populated once by
/// `register_error_classes`
/// before any user code is resolved. `-1` until set.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinClassIds {
    pub exception: i64,
    pub type_error: i64,
    pub value_error: i64,
    pub index_error: i64,
    pub division_by_zero_error: i64,
}

impl Default for BuiltinClassIds {
    fn default() -> Self {
        Self { exception: -1, type_error: -1, value_error: -1, index_error: -1, division_by_zero_error: -1 }
    }
}

#[derive(Debug, Clone)]
pub struct Program {
    pub functions: Vec<FunctionEntry>,
    pub classes: Vec<ClassEntry>,
    pub globals: Vec<GlobalEntry>,
    pub symbols: DebugSymbols,
    pub main_func_id: i64,
    pub global_init_func_id: i64,
    pub well_known: WellKnownMethods,
    pub builtin_classes: BuiltinClassIds,
}

impl Program {
    pub fn new() -> Self {
        Self {
            functions: Vec::new(),
            classes: Vec::new(),
            globals: Vec::new(),
            symbols: DebugSymbols::new(),
            main_func_id: -1,
            global_init_func_id: -1,
            well_known: WellKnownMethods::default(),
            builtin_classes: BuiltinClassIds::default(),
        }
    }

    fn fileuri_index(&mut self, fileuri: Option<&str>) -> Option<symbols::FileUriIndex> {
        fileuri.map(|u| self.symbols.fileuri_index(u))
    }

    /// `add_global_var`. Fails on a duplicate name within the
    /// resolved module's globalvar namespace.
    pub fn add_global_var(
        &mut self,
        name: &str,
        is_const: bool,
        fileuri: Option<&str>,
        module_path: Option<String>,
        library: Option<String>,
    ) -> Result<i64, RegisterError> {
        let fileuri_index = self.fileuri_index(fileuri);
        let module = self.symbols.resolve_module(module_path, library);
        if self.symbols.module(module).globalvar_name_to_entry.contains_key(name) {
            return Err(RegisterError::DuplicateName);
        }

        let global_id = self.globals.len() as i64;
        let symbol = GlobalVarSymbol { name: name.to_string(), fileuri_index, is_const };

        // Commit: the module's symbol table, the globals table, and the
        // fileuri already-interned string are the only mutations; there is
        // no partial state to roll back on any earlier `return Err` above.
        let entry_idx = {
            let module_rec = self.symbols.module_mut(module);
            module_rec.globalvar_symbols.push(symbol);
            let entry_idx = module_rec.globalvar_symbols.len() - 1;
            module_rec.globalvar_name_to_entry.insert(name.to_string(), entry_idx);
            entry_idx
        };
        let _ = entry_idx;
        self.globals.push(GlobalEntry { value: ValueContent::None, is_const });
        Ok(global_id)
    }

    fn lookup_key(module_path: &Option<String>, library: &Option<String>, name: &str) -> String {
        let module_part = module_path.as_deref().unwrap_or(symbols::BUILTIN_MODULE_NAME);
        match library {
            Some(lib) => format!("{module_part}.{name}[@lib:{lib}]"),
            None => format!("{module_part}.{name}"),
        }
    }

    /// `register_c_function`.
    #[allow(clippy::too_many_arguments)]
    pub fn register_c_function(
        &mut self,
        name: &str,
        native_ptr: Option<&str>,
        fileuri: Option<&str>,
        arg_count: i64,
        arg_kwarg_names: Option<Vec<Option<String>>>,
        last_is_multiarg: bool,
        module_path: Option<String>,
        library: Option<String>,
        is_threadable: bool,
        associated_class_id: i64,
    ) -> Result<i64, RegisterError> {
        let lookup_key = Self::lookup_key(&module_path, &library, name);
        self.register_function(
            FunctionEntry::new_c(
                Some(name.to_string()),
                native_ptr.map(str::to_string),
                arg_count,
                last_is_multiarg,
                is_threadable,
                associated_class_id,
                lookup_key,
            ),
            name,
            fileuri,
            arg_count,
            arg_kwarg_names,
            last_is_multiarg,
            false,
            module_path,
            library,
            associated_class_id,
        )
    }

    /// `register_source_function`: same registration path, but
    /// the entry starts with `iscfunc = false` and an empty instruction
    /// buffer that lowering fills in later.
    #[allow(clippy::too_many_arguments)]
    pub fn register_source_function(
        &mut self,
        name: Option<&str>,
        fileuri: Option<&str>,
        arg_count: i64,
        arg_kwarg_names: Option<Vec<Option<String>>>,
        last_is_multiarg: bool,
        has_self_arg: bool,
        module_path: Option<String>,
        library: Option<String>,
        associated_class_id: i64,
    ) -> Result<i64, RegisterError> {
        self.register_function(
            FunctionEntry::new_source(name.map(str::to_string), arg_count, associated_class_id, has_self_arg),
            name.unwrap_or(""),
            fileuri,
            arg_count,
            arg_kwarg_names,
            last_is_multiarg,
            has_self_arg,
            module_path,
            library,
            associated_class_id,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn register_function(
        &mut self,
        entry: FunctionEntry,
        name: &str,
        fileuri: Option<&str>,
        arg_count: i64,
        arg_kwarg_names: Option<Vec<Option<String>>>,
        last_is_multiarg: bool,
        has_self_arg: bool,
        module_path: Option<String>,
        library: Option<String>,
        associated_class_id: i64,
    ) -> Result<i64, RegisterError> {
        let fileuri_index = self.fileuri_index(fileuri);
        let module = self.symbols.resolve_module(module_path, library);
        if !name.is_empty() && self.symbols.module(module).func_name_to_entry.contains_key(name) {
            return Err(RegisterError::DuplicateName);
        }

        let func_id = self.functions.len() as i64;

        // Register the class member, if any, before committing anything
        // else: a duplicate-member failure here must leave no trace (no
        // pushed function entry, no module symbol, no name-map entry), so
        // it has to run while `func_id` is still just a number nothing
        // else has committed to yet.
        if associated_class_id >= 0 {
            self.register_class_member(associated_class_id, name, Some(func_id))?;
        }

        let symbol = FunctionSymbol {
            name: if name.is_empty() { None } else { Some(name.to_string()) },
            fileuri_index,
            arg_count,
            arg_kwarg_names,
            last_arg_is_multiarg: last_is_multiarg,
            has_self_arg,
            global_id: func_id,
        };

        let subindex = {
            let module_rec = self.symbols.module_mut(module);
            module_rec.func_symbols.push(symbol);
            let subindex = module_rec.func_symbols.len() - 1;
            if !name.is_empty() {
                module_rec.func_name_to_entry.insert(name.to_string(), subindex);
            }
            subindex
        };
        self.symbols.record_func_reverse(func_id, module, subindex);
        self.functions.push(entry);

        Ok(func_id)
    }

    /// `add_class`.
    pub fn add_class(
        &mut self,
        name: &str,
        fileuri: Option<&str>,
        module_path: Option<String>,
        library: Option<String>,
    ) -> Result<i64, RegisterError> {
        let fileuri_index = self.fileuri_index(fileuri);
        let module = self.symbols.resolve_module(module_path, library);
        if self.symbols.module(module).class_name_to_entry.contains_key(name) {
            return Err(RegisterError::DuplicateName);
        }

        let class_id = self.classes.len() as i64;
        let symbol = ClassSymbol { name: name.to_string(), fileuri_index, global_id: class_id };
        let subindex = {
            let module_rec = self.symbols.module_mut(module);
            module_rec.class_symbols.push(symbol);
            let subindex = module_rec.class_symbols.len() - 1;
            module_rec.class_name_to_entry.insert(name.to_string(), subindex);
            subindex
        };
        self.symbols.record_class_reverse(class_id, module, subindex);
        self.classes.push(ClassEntry::new(name.to_string(), None));
        Ok(class_id)
    }

    /// `register_class_variable`: thin wrapper with `func_idx =
    /// None`.
    pub fn register_class_variable(&mut self, class_id: i64, name: &str) -> Result<i64, RegisterError> {
        self.register_class_member(class_id, name, None)
    }

    /// `register_class_member`: intern the name, then delegate
    /// the bucket/slot bookkeeping to [`ClassEntry::register_member`],
    /// which is itself transactional (a duplicate-name failure leaves the
    /// class unmutated).
    pub fn register_class_member(&mut self, class_id: i64, name: &str, func_idx: Option<i64>) -> Result<i64, RegisterError> {
        let name_id = self.symbols.intern_member(name);
        let class = &mut self.classes[class_id as usize];
        Ok(class.register_member(name_id, func_idx)?)
    }

    /// `lookup_class_member`.
    pub fn lookup_class_member(&self, class_id: i64, name_id: i64) -> (i64, i64) {
        self.classes[class_id as usize].lookup_member(name_id)
    }

    pub fn set_class_base(&mut self, class_id: i64, base_class_id: i64) {
        self.classes[class_id as usize].base_class_id = if base_class_id >= 0 { Some(base_class_id) } else { None };
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_global_name_in_same_module_fails() {
        let mut p = Program::new();
        p.add_global_var("x", false, None, None, None).unwrap();
        assert_eq!(p.add_global_var("x", false, None, None, None), Err(RegisterError::DuplicateName));
        assert_eq!(p.globals.len(), 1);
    }

    #[test]
    fn register_class_member_round_trips_through_lookup() {
        let mut p = Program::new();
        let class_id = p.add_class("Point", None, None, None).unwrap();
        let func_id = p.register_source_function(Some("move"), None, 1, None, false, true, None, None, class_id).unwrap();
        let name_id = p.symbols.lookup_member_id("move").unwrap();
        assert_eq!(p.lookup_class_member(class_id, name_id), (-1, func_id));
    }

    #[test]
    fn duplicate_member_registration_fails_and_leaves_class_unmutated() {
        let mut p = Program::new();
        let class_id = p.add_class("C", None, None, None).unwrap();
        p.register_class_variable(class_id, "x").unwrap();
        let before = p.classes[class_id as usize].var_name_ids.len();
        assert_eq!(p.register_class_variable(class_id, "x"), Err(RegisterError::DuplicateName));
        assert_eq!(p.classes[class_id as usize].var_name_ids.len(), before);
    }

    #[test]
    fn duplicate_member_name_leaves_no_orphaned_function() {
        let mut p = Program::new();
        let class_id = p.add_class("C", None, None, None).unwrap();
        p.register_class_variable(class_id, "foo").unwrap();
        let functions_before = p.functions.len();

        let result = p.register_source_function(Some("foo"), None, 0, None, false, true, None, None, class_id);
        assert_eq!(result, Err(RegisterError::DuplicateName));

        // The clashing `func foo` must never have been pushed: no orphaned
        // function entry, no module symbol, no name-map entry.
        assert_eq!(p.functions.len(), functions_before);
        let module = p.symbols.resolve_module(None, None);
        assert!(!p.symbols.module(module).func_name_to_entry.contains_key("foo"));
    }

    #[test]
    fn module_scoped_functions_build_reverse_index() {
        let mut p = Program::new();
        let func_id = p
            .register_source_function(Some("f"), Some("file:///a.ember"), 0, None, false, false, Some("a".to_string()), None, -1)
            .unwrap();
        let (module, subindex) = p.symbols.func_reverse(func_id).unwrap();
        assert_eq!(p.symbols.module(module).func_symbols[subindex].name.as_deref(), Some("f"));
    }
}
