//! Debug symbols: the side-table that remembers, for every
//! function/class/global-var id, which source file and module declared it,
//! plus the member-name interning table the VM's `getmember` instruction
//! reads from.

use std::collections::HashMap;

pub const BUILTIN_MODULE_NAME: &str = "$$builtin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileUriIndex(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleIndex(pub usize);

#[derive(Debug, Clone)]
pub struct FunctionSymbol {
    pub name: Option<String>,
    pub fileuri_index: Option<FileUriIndex>,
    pub arg_count: i64,
    pub arg_kwarg_names: Option<Vec<Option<String>>>,
    pub last_arg_is_multiarg: bool,
    pub has_self_arg: bool,
    pub global_id: i64,
}

#[derive(Debug, Clone)]
pub struct ClassSymbol {
    pub name: String,
    pub fileuri_index: Option<FileUriIndex>,
    pub global_id: i64,
}

#[derive(Debug, Clone)]
pub struct GlobalVarSymbol {
    pub name: String,
    pub fileuri_index: Option<FileUriIndex>,
    pub is_const: bool,
}

/// Per-module record: one per distinct `(module_path, library_name)` pair,
/// plus one distinguished builtin-module record.
#[derive(Debug, Clone, Default)]
pub struct ModuleSymbols {
    pub module_path: Option<String>,
    pub library_name: Option<String>,
    pub func_symbols: Vec<FunctionSymbol>,
    pub class_symbols: Vec<ClassSymbol>,
    pub globalvar_symbols: Vec<GlobalVarSymbol>,
    pub func_name_to_entry: HashMap<String, usize>,
    pub class_name_to_entry: HashMap<String, usize>,
    pub globalvar_name_to_entry: HashMap<String, usize>,
}

impl ModuleSymbols {
    fn new(module_path: Option<String>, library_name: Option<String>) -> Self {
        Self { module_path, library_name, ..Default::default() }
    }
}

/// Program-wide debug-symbols aggregate.
#[derive(Debug, Clone, Default)]
pub struct DebugSymbols {
    fileuris: Vec<String>,
    fileuri_index: HashMap<String, FileUriIndex>,
    pub modules: Vec<ModuleSymbols>,
    module_key_to_index: HashMap<(Option<String>, Option<String>), ModuleIndex>,
    pub builtin_module: ModuleIndex,
    member_name_to_id: HashMap<String, i64>,
    member_id_to_name: Vec<String>,
    func_reverse: HashMap<i64, (ModuleIndex, usize)>,
    class_reverse: HashMap<i64, (ModuleIndex, usize)>,
}

impl DebugSymbols {
    pub fn new() -> Self {
        let mut s = Self {
            fileuris: Vec::new(),
            fileuri_index: HashMap::new(),
            modules: Vec::new(),
            module_key_to_index: HashMap::new(),
            builtin_module: ModuleIndex(0),
            member_name_to_id: HashMap::new(),
            member_id_to_name: Vec::new(),
            func_reverse: HashMap::new(),
            class_reverse: HashMap::new(),
        };
        let builtin = s.get_or_create_module(None, None);
        s.builtin_module = builtin;
        s
    }

    /// `bytecode_fileuriindex` equivalent: find an existing entry for
    /// `uri`, else append. The source's search-loop condition was
    /// inverted (`k > fileuri_count`, effectively always appending); this
    /// is the corrected "find, else append" behavior (see DESIGN.md, Open
    /// Question decisions).
    pub fn fileuri_index(&mut self, uri: &str) -> FileUriIndex {
        if let Some(&idx) = self.fileuri_index.get(uri) {
            return idx;
        }
        let idx = FileUriIndex(self.fileuris.len());
        self.fileuris.push(uri.to_string());
        self.fileuri_index.insert(uri.to_string(), idx);
        idx
    }

    pub fn fileuri(&self, idx: FileUriIndex) -> &str {
        &self.fileuris[idx.0]
    }

    pub fn get_or_create_module(&mut self, module_path: Option<String>, library_name: Option<String>) -> ModuleIndex {
        let key = (module_path.clone(), library_name.clone());
        if let Some(&idx) = self.module_key_to_index.get(&key) {
            return idx;
        }
        let idx = ModuleIndex(self.modules.len());
        self.modules.push(ModuleSymbols::new(module_path, library_name));
        self.module_key_to_index.insert(key, idx);
        idx
    }

    /// Resolve a `(module_path, library)` pair to its module record, using
    /// the distinguished builtin module when `module_path` is absent.
    pub fn resolve_module(&mut self, module_path: Option<String>, library_name: Option<String>) -> ModuleIndex {
        match module_path {
            None => self.builtin_module,
            Some(_) => self.get_or_create_module(module_path, library_name),
        }
    }

    pub fn module(&self, idx: ModuleIndex) -> &ModuleSymbols {
        &self.modules[idx.0]
    }

    pub fn module_mut(&mut self, idx: ModuleIndex) -> &mut ModuleSymbols {
        &mut self.modules[idx.0]
    }

    /// Intern a member name, creating a new id if unseen. Monotonic: ids
    /// are never reused or renumbered.
    pub fn intern_member(&mut self, name: &str) -> i64 {
        if let Some(&id) = self.member_name_to_id.get(name) {
            return id;
        }
        let id = self.member_id_to_name.len() as i64;
        self.member_id_to_name.push(name.to_string());
        self.member_name_to_id.insert(name.to_string(), id);
        id
    }

    /// No-create lookup: agrees with `intern_member` when the name exists.
    pub fn lookup_member_id(&self, name: &str) -> Option<i64> {
        self.member_name_to_id.get(name).copied()
    }

    pub fn member_name(&self, id: i64) -> Option<&str> {
        self.member_id_to_name.get(id as usize).map(|s| s.as_str())
    }

    pub fn record_func_reverse(&mut self, func_id: i64, module: ModuleIndex, subindex: usize) {
        self.func_reverse.insert(func_id, (module, subindex));
    }

    pub fn record_class_reverse(&mut self, class_id: i64, module: ModuleIndex, subindex: usize) {
        self.class_reverse.insert(class_id, (module, subindex));
    }

    pub fn func_reverse(&self, func_id: i64) -> Option<(ModuleIndex, usize)> {
        self.func_reverse.get(&func_id).copied()
    }

    pub fn class_reverse(&self, class_id: i64) -> Option<(ModuleIndex, usize)> {
        self.class_reverse.get(&class_id).copied()
    }
}
