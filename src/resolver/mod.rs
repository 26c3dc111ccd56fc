//! Scope & identifier resolver: links names across files,
//! imports, classes, closures and builtins, assigning every declaration
//! and reference a [`storage::StorageRef`].

pub mod scope;
pub mod storage;

use std::collections::HashMap;

use crate::ast::{Ast, AstId, BinOp, Literal, NodeId, NodeKind};
use crate::parser::{self, ParseError};
use crate::pathutil::{self, PathError};
use crate::program::{Program, RegisterError};
use scope::{ScopeDefId, ScopeId};
use storage::{StorageKind, StorageRef};

const IMPORTCHAINLEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    NotFound(String),
    Io(String),
}

impl std::fmt::Display for LoaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoaderError::NotFound(s) => write!(f, "not found: {s}"),
            LoaderError::Io(s) => write!(f, "{s}"),
        }
    }
}

impl From<ParseError> for LoaderError {
    fn from(e: ParseError) -> Self {
        LoaderError::Io(e.to_string())
    }
}

/// Project-loader interface. A black box to the resolver: it
/// only needs file discovery and source text, never the resolver's own
/// data structures.
pub trait ProjectLoader {
    fn get_file_sub_project_path(&self, file_uri: &str) -> Result<(String, Option<String>), LoaderError>;
    fn resolve_import(&self, source_file_uri: &str, import_elements: &[String], library: Option<&str>) -> Result<String, LoaderError>;
    fn read_source(&self, file_uri: &str) -> Result<String, LoaderError>;
}

/// Which file-local thing a scope-def's declaration turned out to be,
/// used by the identifier resolver to classify a found reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeclKind {
    Var,
    ForIterator,
    Function,
    Class,
    Param,
    Import,
}

fn decl_kind(ast: &Ast, node: NodeId) -> DeclKind {
    match &ast.node(node).kind {
        NodeKind::VarDef { .. } => DeclKind::Var,
        NodeKind::For { .. } => DeclKind::ForIterator,
        NodeKind::FuncDef { .. } => DeclKind::Function,
        NodeKind::ClassDef { .. } => DeclKind::Class,
        NodeKind::Import { .. } => DeclKind::Import,
        _ => DeclKind::Param,
    }
}

/// Owns the arena of every AST reached from an entry file, and drives
/// recursive import loading plus both resolver passes (global-storage
/// building and identifier resolution) over each of them.
pub struct Resolver<L: ProjectLoader> {
    loader: L,
    asts: Vec<Ast>,
    uri_to_ast: HashMap<String, AstId>,
    /// Per-function-node local-slot counters, used by the local-variable
    /// storage assignment pass. Register allocation proper is treated as
    /// an out-of-scope collaborator, so this is a minimal
    /// monotonic-counter implementation rather than a full allocator.
    next_local_slot: HashMap<NodeId, i64>,
}

impl<L: ProjectLoader> Resolver<L> {
    pub fn new(loader: L) -> Self {
        Self { loader, asts: Vec::new(), uri_to_ast: HashMap::new(), next_local_slot: HashMap::new() }
    }

    pub fn ast(&self, id: AstId) -> &Ast {
        &self.asts[id.0]
    }

    pub fn ast_mut(&mut self, id: AstId) -> &mut Ast {
        &mut self.asts[id.0]
    }

    pub fn into_asts(self) -> Vec<Ast> {
        self.asts
    }

    fn get_or_parse(&mut self, uri: &str) -> Result<AstId, LoaderError> {
        let normalized = pathutil::normalize_uri(uri);
        if let Some(&id) = self.uri_to_ast.get(&normalized) {
            return Ok(id);
        }
        let source = self.loader.read_source(&normalized)?;
        let id = AstId(self.asts.len());
        let ast = parser::Parser::new(&normalized, &source).parse(id)?;
        self.asts.push(ast);
        self.uri_to_ast.insert(normalized, id);
        Ok(id)
    }

    /// `resolve_ast`, the top-level entry point.
    pub fn resolve_entry(&mut self, program: &mut Program, entry_uri: &str, extract_main: bool) -> Result<AstId, LoaderError> {
        let entry = self.get_or_parse(entry_uri)?;
        self.build_global_storage(program, entry, extract_main);

        if extract_main && program.main_func_id < 0 {
            let fileuri = self.ast(entry).fileuri.clone();
            self.ast_mut(entry).result_messages.push_error(fileuri, 0, 0, "missing main func found");
        }

        self.resolve_identifiers_in_tree(program, entry);

        if self.ast(entry).result_messages.success {
            self.assign_local_storage(entry);
        }
        Ok(entry)
    }

    fn ensure_module_path(&mut self, id: AstId) {
        if self.ast(id).module_path.is_some() {
            return;
        }
        let fileuri = self.ast(id).fileuri.clone();
        match self.loader.get_file_sub_project_path(&fileuri) {
            Ok((project_dir, library)) => {
                let relative = pathutil::relative_to(&fileuri, &project_dir);
                match pathutil::derive_module_path(&relative) {
                    Ok(module_path) => {
                        self.ast_mut(id).module_path = Some(module_path);
                        self.ast_mut(id).library_name = library;
                    }
                    Err(PathError::DotInComponent(comp)) => {
                        self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("module path component contains a '.': {comp:?}"));
                    }
                }
            }
            Err(e) => {
                self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("could not determine sub-project path: {e}"));
            }
        }
    }

    /// `build_global_storage`, recursively.
    fn build_global_storage(&mut self, program: &mut Program, id: AstId, extract_main: bool) {
        if self.ast(id).global_storage_built {
            return;
        }
        self.ast_mut(id).global_storage_built = true;
        self.ensure_module_path(id);

        let top_level = self.ast(id).top_level().to_vec();

        // Resolve imports first so later identifier resolution always has
        // a loaded target AST to walk into.
        for &node in &top_level {
            if let NodeKind::Import { elements, library } = self.ast(id).node(node).kind.clone() {
                self.resolve_import_stmt(id, node, &elements, library.as_deref());
            }
        }

        let root_scope = self.ast(id).scope.root();
        for &node in &top_level {
            self.compute_storage_in_subtree(program, id, node, root_scope, None, false, extract_main);
        }

        let import_targets: Vec<AstId> = self.ast(id).import_targets.values().copied().collect();
        for target in import_targets {
            self.build_global_storage(program, target, false);
        }
    }

    fn resolve_import_stmt(&mut self, id: AstId, node: NodeId, elements: &[String], library: Option<&str>) {
        let fileuri = self.ast(id).fileuri.clone();
        match self.loader.resolve_import(&fileuri, elements, library) {
            Ok(target_uri) => match self.get_or_parse(&target_uri) {
                Ok(target_id) => {
                    self.ast_mut(id).import_targets.insert(node, target_id);
                }
                Err(e) => {
                    self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("failed to load import {}: {e}", elements.join(".")));
                }
            },
            Err(e) => {
                self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("import not found: {} ({e})", elements.join(".")));
            }
        }
    }

    /// Walk a subtree, declaring scopes/scope-defs as they're introduced
    /// and calling `compute_item_storage` on every var/class/func
    /// definition, plus interning call keyword-argument
    /// names. `in_function` is true for anything nested inside a function
    /// or method body (as opposed to file-top-level or bare class-body
    /// scope) -- it is what tells a `var` apart from a global or a
    /// class member (spec 4.B.3).
    #[allow(clippy::too_many_arguments)]
    fn compute_storage_in_subtree(
        &mut self,
        program: &mut Program,
        id: AstId,
        node: NodeId,
        scope: ScopeId,
        enclosing_class: Option<i64>,
        in_function: bool,
        extract_main: bool,
    ) {
        let kind = self.ast(id).node(node).kind.clone();
        match kind {
            NodeKind::Import { elements, .. } => {
                let bound_name = elements[0].clone();
                if self.ast_mut(id).scope.declare(scope, bound_name.clone(), node).is_none() {
                    let fileuri = self.ast(id).fileuri.clone();
                    self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("'{bound_name}' is already declared in this scope"));
                }
            }
            NodeKind::VarDef { name, initializer, is_const } => {
                if let Some(init) = initializer {
                    self.compute_storage_in_subtree(program, id, init, scope, enclosing_class, in_function, extract_main);
                }
                let def_id = self.ast_mut(id).scope.declare(scope, name.clone(), node);
                match def_id {
                    Some(def_id) => self.compute_item_storage_vardef(program, id, node, def_id, enclosing_class, in_function, is_const, initializer),
                    Option::None => {
                        let fileuri = self.ast(id).fileuri.clone();
                        self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("'{name}' is already declared in this scope"));
                    }
                }
            }
            NodeKind::ClassDef { name, members, .. } => {
                let class_scope = self.ast_mut(id).scope.push_scope(scope, Some(node), false);
                let def_id = self.ast_mut(id).scope.declare(scope, name.clone(), node);
                let class_id = match def_id {
                    Some(def_id) => self.compute_item_storage_classdef(program, id, node, def_id, &name),
                    Option::None => {
                        let fileuri = self.ast(id).fileuri.clone();
                        self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("'{name}' is already declared in this scope"));
                        None
                    }
                };
                for member in members {
                    self.compute_storage_in_subtree(program, id, member, class_scope, class_id, false, extract_main);
                }
            }
            NodeKind::FuncDef { name, params, body, .. } => {
                let func_scope = self.ast_mut(id).scope.push_scope(scope, Some(node), true);
                for p in &params {
                    if let Some(default) = p.default {
                        self.compute_storage_in_subtree(program, id, default, scope, enclosing_class, in_function, extract_main);
                    }
                    self.ast_mut(id).scope.declare(func_scope, p.name.clone(), p.node);
                }
                let def_id = name.as_ref().and_then(|n| self.ast_mut(id).scope.declare(scope, n.clone(), node));
                if name.is_some() && def_id.is_none() {
                    let fileuri = self.ast(id).fileuri.clone();
                    let n = name.clone().unwrap();
                    self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("'{n}' is already declared in this scope"));
                }
                self.compute_item_storage_funcdef(program, id, node, def_id, enclosing_class, extract_main, &name, &params);
                self.compute_storage_in_subtree(program, id, body, func_scope, enclosing_class, true, false);
            }
            NodeKind::Block(stmts) => {
                for s in stmts {
                    self.compute_storage_in_subtree(program, id, s, scope, enclosing_class, in_function, extract_main);
                }
            }
            NodeKind::For { iterator_name, iterable, body } => {
                self.compute_storage_in_subtree(program, id, iterable, scope, enclosing_class, in_function, extract_main);
                let for_scope = self.ast_mut(id).scope.push_scope(scope, Some(node), false);
                self.ast_mut(id).scope.declare(for_scope, iterator_name, node);
                self.compute_storage_in_subtree(program, id, body, for_scope, enclosing_class, in_function, extract_main);
            }
            NodeKind::If { condition, then_branch, else_branch } => {
                self.compute_storage_in_subtree(program, id, condition, scope, enclosing_class, in_function, extract_main);
                self.compute_storage_in_subtree(program, id, then_branch, scope, enclosing_class, in_function, extract_main);
                if let Some(e) = else_branch {
                    self.compute_storage_in_subtree(program, id, e, scope, enclosing_class, in_function, extract_main);
                }
            }
            NodeKind::While { condition, body } => {
                self.compute_storage_in_subtree(program, id, condition, scope, enclosing_class, in_function, extract_main);
                self.compute_storage_in_subtree(program, id, body, scope, enclosing_class, in_function, extract_main);
            }
            NodeKind::Return(Some(value)) => {
                self.compute_storage_in_subtree(program, id, value, scope, enclosing_class, in_function, extract_main);
            }
            NodeKind::Assign { target, value } => {
                self.compute_storage_in_subtree(program, id, target, scope, enclosing_class, in_function, extract_main);
                self.compute_storage_in_subtree(program, id, value, scope, enclosing_class, in_function, extract_main);
            }
            NodeKind::ExprStmt(e) => {
                self.compute_storage_in_subtree(program, id, e, scope, enclosing_class, in_function, extract_main);
            }
            NodeKind::Binary { op: BinOp::MemberByIdentifier, left, .. } => {
                // The right-hand identifier is resolved in the identifier
                // phase as a member-name id, never as a scope lookup
                //; only recurse into the left side here.
                self.compute_storage_in_subtree(program, id, left, scope, enclosing_class, in_function, extract_main);
            }
            NodeKind::Binary { left, right, .. } => {
                self.compute_storage_in_subtree(program, id, left, scope, enclosing_class, in_function, extract_main);
                self.compute_storage_in_subtree(program, id, right, scope, enclosing_class, in_function, extract_main);
            }
            NodeKind::Unary { operand, .. } => {
                self.compute_storage_in_subtree(program, id, operand, scope, enclosing_class, in_function, extract_main);
            }
            NodeKind::Call { callee, args, kwarg_names } => {
                self.compute_storage_in_subtree(program, id, callee, scope, enclosing_class, in_function, extract_main);
                for a in args {
                    self.compute_storage_in_subtree(program, id, a, scope, enclosing_class, in_function, extract_main);
                }
                for kw in kwarg_names.into_iter().flatten() {
                    program.symbols.intern_member(&kw);
                }
            }
            NodeKind::Literal(_) | NodeKind::IdentifierRef(_) | NodeKind::SelfRef | NodeKind::BaseRef | NodeKind::ParamDecl(_) | NodeKind::Return(None) => {}
        }
    }

    /// Class-member-variable branch of `compute_item_storage`: registers
    /// the member and, if the initializer is non-trivial, ensures the
    /// class's auto-generated `$$varinit`. A `var` nested inside any
    /// function or method body (`in_function`) is neither a global nor a
    /// class member no matter what encloses that function -- it is left
    /// with no storage here and picked up later by `assign_local_storage`,
    /// which gives it a fresh `LocalSlot` per declaration (spec 4.B.3,
    /// 4.B.5).
    fn compute_item_storage_vardef(
        &mut self,
        program: &mut Program,
        id: AstId,
        node: NodeId,
        def_id: ScopeDefId,
        enclosing_class: Option<i64>,
        in_function: bool,
        is_const: bool,
        initializer: Option<NodeId>,
    ) {
        let _ = def_id;
        if in_function {
            return;
        }
        let fileuri = self.ast(id).fileuri.clone();
        let name = match &self.ast(id).node(node).kind {
            NodeKind::VarDef { name, .. } => name.clone(),
            _ => unreachable!(),
        };
        match enclosing_class {
            Some(class_id) => {
                let result = program.register_class_variable(class_id, &name);
                match result {
                    Ok(_) => {
                        let non_trivial = match initializer.map(|n| self.ast(id).node(n).kind.clone()) {
                            None => false,
                            Some(NodeKind::Literal(Literal::None)) => false,
                            Some(_) => true,
                        };
                        if non_trivial && !program.classes[class_id as usize].has_var_init_func {
                            if let Ok(func_id) =
                                program.register_source_function(Some("$$varinit"), Some(&fileuri), 0, None, false, true, None, None, class_id)
                            {
                                program.classes[class_id as usize].has_var_init_func = true;
                                program.classes[class_id as usize].var_init_func_id = func_id;
                            }
                        }
                    }
                    Err(RegisterError::DuplicateName) => {
                        self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("duplicate class member '{name}'"));
                    }
                    Err(RegisterError::OutOfMemory) => {}
                }
            }
            Option::None => match program.add_global_var(&name, is_const, Some(&fileuri), self.ast(id).module_path.clone(), self.ast(id).library_name.clone()) {
                Ok(global_id) => {
                    self.ast_mut(id).node_mut(node).storage = Some(StorageRef::new(StorageKind::GlobalVarSlot, global_id));
                }
                Err(RegisterError::DuplicateName) => {
                    self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("duplicate global variable '{name}'"));
                }
                Err(RegisterError::OutOfMemory) => {}
            },
        }
    }

    fn compute_item_storage_classdef(&mut self, program: &mut Program, id: AstId, node: NodeId, _def_id: ScopeDefId, name: &str) -> Option<i64> {
        let fileuri = self.ast(id).fileuri.clone();
        match program.add_class(name, Some(&fileuri), self.ast(id).module_path.clone(), self.ast(id).library_name.clone()) {
            Ok(class_id) => {
                self.ast_mut(id).node_mut(node).storage = Some(StorageRef::new(StorageKind::GlobalClassSlot, class_id));
                Some(class_id)
            }
            Err(RegisterError::DuplicateName) => {
                self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("duplicate class '{name}'"));
                None
            }
            Err(RegisterError::OutOfMemory) => None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn compute_item_storage_funcdef(
        &mut self,
        program: &mut Program,
        id: AstId,
        node: NodeId,
        _def_id: Option<ScopeDefId>,
        enclosing_class: Option<i64>,
        extract_main: bool,
        name: &Option<String>,
        params: &[crate::ast::Param],
    ) {
        let fileuri = self.ast(id).fileuri.clone();
        let has_self_arg = enclosing_class.is_some();
        let arg_count = params.len() as i64;
        let kwarg_names: Vec<Option<String>> = params.iter().map(|p| if p.default.is_some() { Some(p.name.clone()) } else { None }).collect();
        let has_any_default = kwarg_names.iter().any(Option::is_some);

        let result = program.register_source_function(
            name.as_deref(),
            Some(&fileuri),
            arg_count,
            if has_any_default { Some(kwarg_names) } else { None },
            false,
            has_self_arg,
            self.ast(id).module_path.clone(),
            self.ast(id).library_name.clone(),
            enclosing_class.unwrap_or(-1),
        );

        match result {
            Ok(func_id) => {
                self.ast_mut(id).node_mut(node).storage = Some(StorageRef::new(StorageKind::GlobalFuncSlot, func_id));
                if enclosing_class.is_none() {
                    if let Some(n) = name {
                        if n == "main" && extract_main {
                            if program.main_func_id >= 0 {
                                self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, "duplicate main func found");
                            } else {
                                program.main_func_id = func_id;
                            }
                        }
                    }
                }
            }
            Err(RegisterError::DuplicateName) => {
                let n = name.clone().unwrap_or_default();
                self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("duplicate function '{n}'"));
            }
            Err(RegisterError::OutOfMemory) => {}
        }
    }

    /// Identifier resolution phase, over every AST reached
    /// from `entry` (each built exactly once, guarded by
    /// `identifiers_resolved`).
    fn resolve_identifiers_in_tree(&mut self, program: &mut Program, entry: AstId) {
        let mut queue = vec![entry];
        let mut seen = std::collections::HashSet::new();
        while let Some(id) = queue.pop() {
            if !seen.insert(id) {
                continue;
            }
            self.resolve_identifiers(program, id);
            let targets: Vec<AstId> = self.ast(id).import_targets.values().copied().collect();
            queue.extend(targets);
        }
    }

    fn resolve_identifiers(&mut self, program: &mut Program, id: AstId) {
        if self.ast(id).identifiers_resolved {
            return;
        }
        self.ast_mut(id).identifiers_resolved = true;
        let root_scope = self.ast(id).scope.root();
        let top_level = self.ast(id).top_level().to_vec();
        for node in top_level {
            self.resolve_node(program, id, node, root_scope, false);
        }
    }

    /// `in_method` tracks whether the current node lies inside a class
    /// method body, for `self`/`base` validation.
    fn resolve_node(&mut self, program: &mut Program, id: AstId, node: NodeId, scope: ScopeId, in_method: bool) {
        let kind = self.ast(id).node(node).kind.clone();
        match kind {
            NodeKind::IdentifierRef(name) => self.resolve_identifier_ref(program, id, node, &name, scope),
            NodeKind::SelfRef | NodeKind::BaseRef => {
                if !in_method {
                    let fileuri = self.ast(id).fileuri.clone();
                    let what = if matches!(kind, NodeKind::SelfRef) { "self" } else { "base" };
                    self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("'{what}' used outside a class method"));
                } else {
                    // Both name the bound receiver in physical slot 0 (lowering
                    // reserves it whenever `has_self_arg`); the negative id marks
                    // it as the receiver rather than an ordinary resolver-assigned
                    // local, since `base` only changes which class's member table
                    // a following `GETMEMBER` searches, not the value loaded here.
                    self.ast_mut(id).node_mut(node).storage = Some(StorageRef::new(StorageKind::ParamSlot, -1));
                }
            }
            NodeKind::Binary { op: BinOp::MemberByIdentifier, left, right } => {
                self.resolve_node(program, id, left, scope, in_method);
                // `right` is a bare IDENTIFIERREF child; its name is
                // interned as a member-name id, never scope-resolved,
                // unless `left` turns out to be an import chain prefix
                // (handled by `resolve_identifier_ref` marking the
                // left-most identifier and walking the whole chain there).
                if let NodeKind::IdentifierRef(member_name) = &self.ast(id).node(right).kind {
                    program.symbols.intern_member(member_name);
                }
            }
            NodeKind::Binary { left, right, .. } => {
                self.resolve_node(program, id, left, scope, in_method);
                self.resolve_node(program, id, right, scope, in_method);
            }
            NodeKind::Unary { operand, .. } => self.resolve_node(program, id, operand, scope, in_method),
            NodeKind::Call { callee, args, .. } => {
                self.resolve_node(program, id, callee, scope, in_method);
                for a in args {
                    self.resolve_node(program, id, a, scope, in_method);
                }
            }
            NodeKind::Block(stmts) => {
                for s in stmts {
                    self.resolve_node(program, id, s, scope, in_method);
                }
            }
            NodeKind::VarDef { initializer, .. } => {
                if let Some(init) = initializer {
                    self.resolve_node(program, id, init, scope, in_method);
                }
            }
            NodeKind::ClassDef { base, members, .. } => {
                if let Some(base_name) = &base {
                    self.resolve_class_base(program, id, node, scope, base_name);
                }
                let class_scope = self.child_scope_for(id, node, scope);
                for m in members {
                    self.resolve_node(program, id, m, class_scope, true);
                }
            }
            NodeKind::FuncDef { body, .. } => {
                let func_scope = self.child_scope_for(id, node, scope);
                self.resolve_node(program, id, body, func_scope, in_method);
            }
            NodeKind::For { iterable, body, .. } => {
                self.resolve_node(program, id, iterable, scope, in_method);
                let for_scope = self.child_scope_for(id, node, scope);
                self.resolve_node(program, id, body, for_scope, in_method);
            }
            NodeKind::If { condition, then_branch, else_branch } => {
                self.resolve_node(program, id, condition, scope, in_method);
                self.resolve_node(program, id, then_branch, scope, in_method);
                if let Some(e) = else_branch {
                    self.resolve_node(program, id, e, scope, in_method);
                }
            }
            NodeKind::While { condition, body } => {
                self.resolve_node(program, id, condition, scope, in_method);
                self.resolve_node(program, id, body, scope, in_method);
            }
            NodeKind::Return(Some(v)) => self.resolve_node(program, id, v, scope, in_method),
            NodeKind::Assign { target, value } => {
                self.resolve_node(program, id, target, scope, in_method);
                self.resolve_node(program, id, value, scope, in_method);
            }
            NodeKind::ExprStmt(e) => self.resolve_node(program, id, e, scope, in_method),
            NodeKind::Literal(_) | NodeKind::Import { .. } | NodeKind::ParamDecl(_) | NodeKind::Return(None) => {}
        }
    }

    /// The storage-building pass already pushed one child scope per
    /// class/function/for node, in the same traversal order this pass
    /// walks in; find it by owner.
    fn child_scope_for(&self, id: AstId, owner: NodeId, parent: ScopeId) -> ScopeId {
        let ast = self.ast(id);
        for candidate in ast.scope.children_of(parent) {
            if ast.scope.scope(candidate).owner == Some(owner) {
                return candidate;
            }
        }
        parent
    }

    fn resolve_identifier_ref(&mut self, program: &mut Program, id: AstId, node: NodeId, name: &str, scope: ScopeId) {
        let fileuri = self.ast(id).fileuri.clone();
        let found = self.ast(id).scope.lookup(scope, name);
        let Some(def_id) = found else {
            // Not in any enclosing scope: fall back to the builtin module.
            let builtin = program.symbols.builtin_module;
            if let Some(&func_idx) = program.symbols.module(builtin).func_name_to_entry.get(name) {
                let func_id = program.symbols.module(builtin).func_symbols[func_idx].global_id;
                self.ast_mut(id).node_mut(node).storage = Some(StorageRef::new(StorageKind::GlobalFuncSlot, func_id));
            } else if let Some(&idx) = program.symbols.module(builtin).class_name_to_entry.get(name) {
                let class_id = program.symbols.module(builtin).class_symbols[idx].global_id;
                self.ast_mut(id).node_mut(node).storage = Some(StorageRef::new(StorageKind::GlobalClassSlot, class_id));
            } else {
                self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("unknown identifier '{name}'"));
            }
            return;
        };

        let decl_node = self.ast(id).scope.def(def_id).declaration_node;
        let kind = decl_kind(self.ast(id), decl_node);

        if kind == DeclKind::Import {
            self.resolve_import_chain(program, id, node, def_id);
            return;
        }

        self.ast_mut(id).scope.def_mut(def_id).ever_used = true;

        let decl_scope = self.ast(id).scope.def(def_id).scope_ptr;
        let owning_fn = self.owning_function_scope(id, decl_scope);
        let chain = self.ast(id).scope.function_scopes_between(scope, owning_fn);
        if !chain.is_empty() && kind == DeclKind::Var {
            self.ast_mut(id).scope.def_mut(def_id).closure_bound = true;
            for fn_scope in chain {
                if let Some(owner) = self.ast(id).scope.scope(fn_scope).owner {
                    self.ast_mut(id).closure_bound_vars.entry(owner).or_default().push(def_id);
                }
            }
        }

        if let Some(storage) = self.ast(id).node(decl_node).storage {
            self.ast_mut(id).node_mut(node).storage = Some(storage);
        }
        // Locals/params get their storage only after `assign_local_storage`
        // runs; leave the reference node unset here and let that pass
        // copy it over once the declaration has one (see
        // `assign_local_storage`).
    }

    /// Resolve a `class Foo(Bar) { ... }` base-class name to a class id and
    /// link it onto `Foo`'s program entry. Looked up the same way a plain
    /// identifier would be (enclosing scope, then the builtin module) since
    /// the grammar only allows a bare name here, never a dotted import path.
    fn resolve_class_base(&mut self, program: &mut Program, id: AstId, node: NodeId, scope: ScopeId, base_name: &str) {
        let Some(StorageRef { kind: StorageKind::GlobalClassSlot, id: class_id, set: true }) = self.ast(id).node(node).storage else {
            return;
        };
        let fileuri = self.ast(id).fileuri.clone();

        if let Some(def_id) = self.ast(id).scope.lookup(scope, base_name) {
            let decl_node = self.ast(id).scope.def(def_id).declaration_node;
            if decl_kind(self.ast(id), decl_node) != DeclKind::Class {
                self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("'{base_name}' is not a class"));
                return;
            }
            match self.ast(id).node(decl_node).storage {
                Some(StorageRef { kind: StorageKind::GlobalClassSlot, id: base_class_id, set: true }) => {
                    program.set_class_base(class_id, base_class_id);
                }
                _ => self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("'{base_name}' has no storage assigned")),
            }
            return;
        }

        let builtin = program.symbols.builtin_module;
        if let Some(&idx) = program.symbols.module(builtin).class_name_to_entry.get(base_name) {
            let base_class_id = program.symbols.module(builtin).class_symbols[idx].global_id;
            program.set_class_base(class_id, base_class_id);
        } else {
            self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("unknown base class '{base_name}'"));
        }
    }

    fn owning_function_scope(&self, id: AstId, mut scope: ScopeId) -> ScopeId {
        let ast = self.ast(id);
        loop {
            if ast.scope.scope(scope).is_function_scope {
                return scope;
            }
            match ast.scope.scope(scope).parent {
                Some(p) => scope = p,
                None => return scope,
            }
        }
    }

    /// Import-chain resolution:
    /// walk the enclosing `a.b.c...` member-access chain, match it
    /// against the import statement's elements, and copy the next
    /// identifier's storage from the imported file's global scope.
    fn resolve_import_chain(&mut self, program: &mut Program, id: AstId, leading_ident: NodeId, import_def: ScopeDefId) {
        let fileuri = self.ast(id).fileuri.clone();
        let import_node = self.ast(id).scope.def(import_def).declaration_node;
        let elements = match &self.ast(id).node(import_node).kind {
            NodeKind::Import { elements, .. } => elements.clone(),
            _ => return,
        };

        // Walk up from `leading_ident` across successive
        // `MemberByIdentifier` parents to assemble the full dotted chain.
        let mut chain_nodes = vec![leading_ident];
        let mut current = leading_ident;
        let mut hops = 0;
        loop {
            hops += 1;
            if hops > IMPORTCHAINLEN {
                self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, "import access chain too long");
                return;
            }
            let parent = self.ast(id).node(current).parent;
            match parent {
                Some(p) => match &self.ast(id).node(p).kind {
                    NodeKind::Binary { op: BinOp::MemberByIdentifier, left, right } if *left == current => {
                        chain_nodes.push(*right);
                        current = p;
                    }
                    _ => break,
                },
                None => break,
            }
        }

        let chain_len = elements.len();
        if chain_nodes.len() <= chain_len {
            self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, "module used in a non-member context");
            return;
        }

        let item_node = chain_nodes[chain_len];
        let item_name = match &self.ast(id).node(item_node).kind {
            NodeKind::IdentifierRef(n) => n.clone(),
            _ => {
                self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, "module used in a non-member context");
                return;
            }
        };

        let Some(target) = self.ast(id).import_targets.get(&import_node).copied() else {
            self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("unresolved import '{}'", elements.join(".")));
            return;
        };

        // The imported file's global storage must already be built: imports
        // are resolved before the rest of the file is walked.
        let storage = self.lookup_global_item(program, target, &item_name);
        match storage {
            Some(s) => {
                self.ast_mut(id).node_mut(item_node).storage = Some(s);
            }
            Option::None => {
                self.ast_mut(id).result_messages.push_error(fileuri, 0, 0, format!("unknown item '{item_name}' in module '{}'", elements.join(".")));
            }
        }
    }

    /// Find `name` among `target`'s top-level global declarations and
    /// return its storage reference, if any.
    fn lookup_global_item(&self, program: &Program, target: AstId, name: &str) -> Option<StorageRef> {
        let ast = self.ast(target);
        let root = ast.scope.root();
        let def_id = ast.scope.lookup(root, name)?;
        let decl_node = ast.scope.def(def_id).declaration_node;
        let storage = ast.node(decl_node).storage?;
        let _ = program;
        Some(storage)
    }

    /// Local-variable storage assignment: assigns
    /// `LOCAL_SLOT`/`PARAM_SLOT` storage to every declaration that did not
    /// already get a global/class storage reference, in per-function
    /// declaration order.
    fn assign_local_storage(&mut self, entry: AstId) {
        let top_level = self.ast(entry).top_level().to_vec();
        for node in top_level {
            self.assign_local_storage_subtree(entry, node, None);
        }
    }

    fn assign_local_storage_subtree(&mut self, id: AstId, node: NodeId, current_func: Option<NodeId>) {
        let kind = self.ast(id).node(node).kind.clone();
        match kind {
            NodeKind::FuncDef { params, body, .. } => {
                for p in &params {
                    if let Some(d) = p.default {
                        self.assign_local_storage_subtree(id, d, current_func);
                    }
                }
                for p in &params {
                    let slot = self.alloc_local_slot(node);
                    self.ast_mut(id).node_mut(p.node).storage = Some(StorageRef::new(StorageKind::ParamSlot, slot));
                }
                self.assign_local_storage_subtree(id, body, Some(node));
            }
            NodeKind::VarDef { initializer, .. } => {
                if self.ast(id).node(node).storage.is_none() {
                    if let Some(func) = current_func {
                        let slot = self.alloc_local_slot(func);
                        self.ast_mut(id).node_mut(node).storage = Some(StorageRef::new(StorageKind::LocalSlot, slot));
                    }
                }
                if let Some(init) = initializer {
                    self.assign_local_storage_subtree(id, init, current_func);
                }
            }
            NodeKind::ClassDef { members, .. } => {
                for m in members {
                    self.assign_local_storage_subtree(id, m, None);
                }
            }
            NodeKind::Block(stmts) => {
                for s in stmts {
                    self.assign_local_storage_subtree(id, s, current_func);
                }
            }
            NodeKind::For { iterable, body, .. } => {
                self.assign_local_storage_subtree(id, iterable, current_func);
                if let Some(func) = current_func {
                    let slot = self.alloc_local_slot(func);
                    self.ast_mut(id).node_mut(node).storage = Some(StorageRef::new(StorageKind::LocalSlot, slot));
                }
                self.assign_local_storage_subtree(id, body, current_func);
            }
            NodeKind::If { condition, then_branch, else_branch } => {
                self.assign_local_storage_subtree(id, condition, current_func);
                self.assign_local_storage_subtree(id, then_branch, current_func);
                if let Some(e) = else_branch {
                    self.assign_local_storage_subtree(id, e, current_func);
                }
            }
            NodeKind::While { condition, body } => {
                self.assign_local_storage_subtree(id, condition, current_func);
                self.assign_local_storage_subtree(id, body, current_func);
            }
            NodeKind::Binary { left, right, .. } => {
                self.assign_local_storage_subtree(id, left, current_func);
                self.assign_local_storage_subtree(id, right, current_func);
            }
            NodeKind::Unary { operand, .. } => self.assign_local_storage_subtree(id, operand, current_func),
            NodeKind::Call { callee, args, .. } => {
                self.assign_local_storage_subtree(id, callee, current_func);
                for a in args {
                    self.assign_local_storage_subtree(id, a, current_func);
                }
            }
            NodeKind::Return(Some(v)) => self.assign_local_storage_subtree(id, v, current_func),
            NodeKind::Assign { target, value } => {
                self.assign_local_storage_subtree(id, target, current_func);
                self.assign_local_storage_subtree(id, value, current_func);
            }
            NodeKind::ExprStmt(e) => self.assign_local_storage_subtree(id, e, current_func),
            NodeKind::Literal(_) | NodeKind::IdentifierRef(_) | NodeKind::SelfRef | NodeKind::BaseRef | NodeKind::Import { .. } | NodeKind::ParamDecl(_) | NodeKind::Return(None) => {}
        }
    }

    fn alloc_local_slot(&mut self, func_node: NodeId) -> i64 {
        let counter = self.next_local_slot.entry(func_node).or_insert(0);
        let slot = *counter;
        *counter += 1;
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap as StdHashMap;

    /// An in-memory project: every file's source text keyed by a fake
    /// `file:///` uri, all living under one sub-project root.
    struct MemoryLoader {
        files: RefCell<StdHashMap<String, String>>,
    }

    impl MemoryLoader {
        fn new(files: &[(&str, &str)]) -> Self {
            let mut map = StdHashMap::new();
            for (uri, src) in files {
                map.insert((*uri).to_string(), (*src).to_string());
            }
            Self { files: RefCell::new(map) }
        }
    }

    impl ProjectLoader for MemoryLoader {
        fn get_file_sub_project_path(&self, _file_uri: &str) -> Result<(String, Option<String>), LoaderError> {
            Ok(("file:///proj".to_string(), None))
        }

        fn resolve_import(&self, _source_file_uri: &str, import_elements: &[String], _library: Option<&str>) -> Result<String, LoaderError> {
            Ok(format!("file:///proj/{}.ember", import_elements.join("/")))
        }

        fn read_source(&self, file_uri: &str) -> Result<String, LoaderError> {
            self.files.borrow().get(file_uri).cloned().ok_or_else(|| LoaderError::NotFound(file_uri.to_string()))
        }
    }

    #[test]
    fn resolves_cross_file_import_and_marks_usage() {
        let loader = MemoryLoader::new(&[
            ("file:///proj/a.ember", "import b\nfunc main { b.f() }"),
            ("file:///proj/b.ember", "func f { return }"),
        ]);
        let mut resolver = Resolver::new(loader);
        let mut program = Program::new();
        crate::builtins::register_error_classes(&mut program).unwrap();
        crate::builtins::register_funcs(&mut program).unwrap();

        let entry = resolver.resolve_entry(&mut program, "file:///proj/a.ember", true).unwrap();
        assert!(resolver.ast(entry).result_messages.success, "{:?}", resolver.ast(entry).result_messages.messages);
        assert_eq!(program.main_func_id, 0);

        let b_id = *resolver.uri_to_ast.get("file:///proj/b.ember").unwrap();
        assert!(resolver.ast(b_id).result_messages.success);
    }

    #[test]
    fn duplicate_main_is_diagnosed_but_first_is_kept() {
        let loader = MemoryLoader::new(&[("file:///proj/a.ember", "func main { return }\nfunc main { return }")]);
        let mut resolver = Resolver::new(loader);
        let mut program = Program::new();
        let entry = resolver.resolve_entry(&mut program, "file:///proj/a.ember", true).unwrap();
        assert!(!resolver.ast(entry).result_messages.success);
        assert!(resolver.ast(entry).result_messages.messages.iter().any(|m| m.message.contains("duplicate main")));
        assert_eq!(program.main_func_id, 0);
    }

    #[test]
    fn unknown_identifier_is_a_diagnostic_not_a_panic() {
        let loader = MemoryLoader::new(&[("file:///proj/a.ember", "func main { nonexistent_thing() }")]);
        let mut resolver = Resolver::new(loader);
        let mut program = Program::new();
        let entry = resolver.resolve_entry(&mut program, "file:///proj/a.ember", true).unwrap();
        assert!(!resolver.ast(entry).result_messages.success);
    }

    #[test]
    fn module_path_round_trip_from_sub_project() {
        let loader = MemoryLoader::new(&[("file:///proj/foo/bar.ember", "func main { return }")]);
        let mut resolver = Resolver::new(loader);
        let mut program = Program::new();
        let entry = resolver.resolve_entry(&mut program, "file:///proj/foo/bar.ember", true).unwrap();
        assert_eq!(resolver.ast(entry).module_path.as_deref(), Some("foo.bar"));
    }

    #[test]
    fn classdef_base_name_links_base_class_id() {
        let loader = MemoryLoader::new(&[("file:///proj/a.ember", "class Animal { }\nclass Dog(Animal) { }\nfunc main { return }")]);
        let mut resolver = Resolver::new(loader);
        let mut program = Program::new();
        let entry = resolver.resolve_entry(&mut program, "file:///proj/a.ember", true).unwrap();
        assert!(resolver.ast(entry).result_messages.success, "{:?}", resolver.ast(entry).result_messages.messages);

        let dog_class = program.classes.iter().find(|c| c.name == "Dog").unwrap();
        let animal_class_id = program.classes.iter().position(|c| c.name == "Animal").unwrap() as i64;
        assert_eq!(dog_class.base_class_id, Some(animal_class_id));
    }

    #[test]
    fn self_inside_a_method_gets_receiver_storage() {
        let loader = MemoryLoader::new(&[("file:///proj/a.ember", "class Dog { func greet { return self } }\nfunc main { return }")]);
        let mut resolver = Resolver::new(loader);
        let mut program = Program::new();
        let entry = resolver.resolve_entry(&mut program, "file:///proj/a.ember", true).unwrap();
        assert!(resolver.ast(entry).result_messages.success, "{:?}", resolver.ast(entry).result_messages.messages);

        let ast = resolver.ast(entry);
        let self_node = (0..ast.nodes_count()).map(NodeId).find(|n| matches!(ast.node(*n).kind, NodeKind::SelfRef)).unwrap();
        assert_eq!(ast.node(self_node).storage, Some(StorageRef::new(StorageKind::ParamSlot, -1)));
    }

    #[test]
    fn self_outside_a_method_is_a_diagnostic() {
        let loader = MemoryLoader::new(&[("file:///proj/a.ember", "func main { return self }")]);
        let mut resolver = Resolver::new(loader);
        let mut program = Program::new();
        let entry = resolver.resolve_entry(&mut program, "file:///proj/a.ember", true).unwrap();
        assert!(!resolver.ast(entry).result_messages.success);
        assert!(resolver.ast(entry).result_messages.messages.iter().any(|m| m.message.contains("'self' used outside")));
    }

    #[test]
    fn function_local_vars_are_locals_not_colliding_globals() {
        let loader = MemoryLoader::new(&[(
            "file:///proj/a.ember",
            "func f() { var y = 1\n return y }\nfunc g() { var y = 2\n return y }\nfunc main() { return }",
        )]);
        let mut resolver = Resolver::new(loader);
        let mut program = Program::new();
        let entry = resolver.resolve_entry(&mut program, "file:///proj/a.ember", true).unwrap();
        assert!(resolver.ast(entry).result_messages.success, "{:?}", resolver.ast(entry).result_messages.messages);

        // Neither `y` became a global -- a var nested in a function body is
        // never routed through `add_global_var`.
        assert!(program.globals.is_empty());

        let ast = resolver.ast(entry);
        let y_defs: Vec<NodeId> = (0..ast.nodes_count())
            .map(NodeId)
            .filter(|&n| matches!(&ast.node(n).kind, NodeKind::VarDef { name, .. } if name == "y"))
            .collect();
        assert_eq!(y_defs.len(), 2);
        for def_node in y_defs {
            let storage = ast.node(def_node).storage.expect("function-local var must get local storage");
            assert_eq!(storage.kind, StorageKind::LocalSlot);
        }
    }

    #[test]
    fn closure_bound_var_is_recorded_on_every_intermediate_function() {
        let loader = MemoryLoader::new(&[(
            "file:///proj/a.ember",
            "func outer() { var x = 1\n func inner() { return x }\n return inner }\nfunc main() { return }",
        )]);
        let mut resolver = Resolver::new(loader);
        let mut program = Program::new();
        let entry = resolver.resolve_entry(&mut program, "file:///proj/a.ember", true).unwrap();
        assert!(resolver.ast(entry).result_messages.success, "{:?}", resolver.ast(entry).result_messages.messages);

        let ast = resolver.ast(entry);
        let outer_node = (0..ast.nodes_count())
            .map(NodeId)
            .find(|&n| matches!(&ast.node(n).kind, NodeKind::FuncDef { name: Some(n), .. } if n == "outer"))
            .unwrap();
        let inner_node = (0..ast.nodes_count())
            .map(NodeId)
            .find(|&n| matches!(&ast.node(n).kind, NodeKind::FuncDef { name: Some(n), .. } if n == "inner"))
            .unwrap();

        let root_scope = ast.scope.root();
        let outer_func_scope = resolver.child_scope_for(entry, outer_node, root_scope);
        let inner_func_scope = resolver.child_scope_for(entry, inner_node, outer_func_scope);
        let def_id = resolver.ast(entry).scope.lookup(inner_func_scope, "x").expect("x must resolve from inner's scope");

        let ast = resolver.ast(entry);
        assert!(ast.scope.def(def_id).closure_bound, "x must be marked closure_bound");
        assert!(
            ast.closure_bound_vars.get(&inner_node).map(|v| v.contains(&def_id)).unwrap_or(false),
            "inner must list x in its closure_bound_vars"
        );
    }

    #[test]
    fn unknown_base_class_name_is_a_diagnostic() {
        let loader = MemoryLoader::new(&[("file:///proj/a.ember", "class Dog(NoSuchClass) { }\nfunc main { return }")]);
        let mut resolver = Resolver::new(loader);
        let mut program = Program::new();
        let entry = resolver.resolve_entry(&mut program, "file:///proj/a.ember", true).unwrap();
        assert!(!resolver.ast(entry).result_messages.success);
        assert!(resolver.ast(entry).result_messages.messages.iter().any(|m| m.message.contains("unknown base class")));
    }
}
