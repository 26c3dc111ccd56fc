//! Scope tree.
//!
//! Scopes and scope-defs are referenced by arena index (`ScopeId`/`ScopeDefId`), never
//! by pointer, and a declaration resolved across files is a
//! `(AstId, ScopeDefId)` pair rather than a raw reference into a foreign
//! tree.

use std::collections::HashMap;

use crate::ast::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeDefId(pub usize);

/// One declaration inside a scope.
#[derive(Debug, Clone)]
pub struct ScopeDef {
    pub declaration_node: NodeId,
    pub identifier: String,
    pub ever_used: bool,
    pub closure_bound: bool,
    pub additional_decl: Vec<NodeId>,
    pub scope_ptr: ScopeId,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub defs: Vec<ScopeDefId>,
    pub by_name: HashMap<String, ScopeDefId>,
    /// The node that owns this scope (a function, class, block, or the
    /// file root). Used by the identifier resolver to determine how many
    /// function boundaries lie between a declaration and a reference.
    pub owner: Option<NodeId>,
    pub is_function_scope: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ScopeTree {
    scopes: Vec<Scope>,
    defs: Vec<ScopeDef>,
}

impl ScopeTree {
    pub fn new() -> Self {
        let mut tree = Self { scopes: Vec::new(), defs: Vec::new() };
        tree.scopes.push(Scope { parent: None, defs: Vec::new(), by_name: HashMap::new(), owner: None, is_function_scope: false });
        tree
    }

    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    pub fn push_scope(&mut self, parent: ScopeId, owner: Option<NodeId>, is_function_scope: bool) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(Scope { parent: Some(parent), defs: Vec::new(), by_name: HashMap::new(), owner, is_function_scope });
        id
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }

    /// Scopes whose `parent` is exactly `parent`, in creation order. Used
    /// by the identifier resolver to find the scope a class/function/for
    /// node's own storage-building pass already pushed.
    pub fn children_of(&self, parent: ScopeId) -> Vec<ScopeId> {
        (0..self.scopes.len()).map(ScopeId).filter(|&id| self.scopes[id.0].parent == Some(parent)).collect()
    }

    /// Declare `identifier` in `scope`. Returns `None` if already declared
    /// directly in this scope (the resolver records that as a diagnostic,
    /// not a panic).
    pub fn declare(&mut self, scope: ScopeId, identifier: String, declaration_node: NodeId) -> Option<ScopeDefId> {
        if self.scopes[scope.0].by_name.contains_key(&identifier) {
            return None;
        }
        let def_id = ScopeDefId(self.defs.len());
        self.defs.push(ScopeDef {
            declaration_node,
            identifier: identifier.clone(),
            ever_used: false,
            closure_bound: false,
            additional_decl: Vec::new(),
            scope_ptr: scope,
        });
        self.scopes[scope.0].defs.push(def_id);
        self.scopes[scope.0].by_name.insert(identifier, def_id);
        Some(def_id)
    }

    pub fn def(&self, id: ScopeDefId) -> &ScopeDef {
        &self.defs[id.0]
    }

    pub fn def_mut(&mut self, id: ScopeDefId) -> &mut ScopeDef {
        &mut self.defs[id.0]
    }

    /// Walk the parent chain starting at `scope`, returning the nearest
    /// enclosing declaration of `identifier`, or `None`.
    pub fn lookup(&self, scope: ScopeId, identifier: &str) -> Option<ScopeDefId> {
        let mut current = Some(scope);
        while let Some(s) = current {
            if let Some(&def) = self.scopes[s.0].by_name.get(identifier) {
                return Some(def);
            }
            current = self.scopes[s.0].parent;
        }
        None
    }

    /// Number of function-scope boundaries strictly between `inner` and
    /// `outer` (inclusive of `inner`, exclusive of `outer`), used for
    /// closure bookkeeping. Returns the ordered list of intermediate
    /// function-owning scopes, innermost last.
    pub fn function_scopes_between(&self, inner: ScopeId, outer: ScopeId) -> Vec<ScopeId> {
        let mut chain = Vec::new();
        let mut current = Some(inner);
        while let Some(s) = current {
            if s == outer {
                break;
            }
            if self.scopes[s.0].is_function_scope {
                chain.push(s);
            }
            current = self.scopes[s.0].parent;
        }
        chain.reverse();
        chain
    }
}
