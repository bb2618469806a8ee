//! Variable and namespace scoping for the query compiler.
//!
//! Variables have a name and optionally a tag. In the language, variables are
//! referred to by just `name` or by `name#tag`, which makes it possible to
//! reach (tagged) definitions that are shadowed by a newer variable of the
//! same name: `( x#1 = 1, x = 2, [x#1, x] )` produces `[1, 2]`.
//!
//! Shadow chains are explicit per-name stacks inside each namespace. A
//! variable is identified everywhere by its [`VarId`]; runtime values never
//! live here (they belong to the evaluation context), so a compiled plan
//! carries no per-run state.

use std::collections::{HashMap, HashSet};

use crate::error::ScopeError;

pub const TAG_MARKER: char = '#';

/// Handle to a variable owned by [`Scopes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub(crate) usize);

/// Handle to a namespace owned by [`Scopes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamespaceId(pub(crate) usize);

/// How a variable may be rebound after its definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    /// Bound once, never reassigned.
    Final,
    /// Rebound only through functional update (a new value per evaluation).
    Functional,
    /// Freely reassignable; cannot be shadowed.
    Mutable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarScope {
    Local,
    Global(NamespaceId),
}

#[derive(Debug, Clone)]
pub struct Var {
    name: String,
    tag: Option<String>,
    scope: VarScope,
    mutability: Mutability,
    hidden: bool,
}

impl Var {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn tagged_name(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{}{}{}", self.name, TAG_MARKER, tag),
            None => self.name.clone(),
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self.scope, VarScope::Global(_))
    }

    pub fn namespace(&self) -> Option<NamespaceId> {
        match self.scope {
            VarScope::Global(ns) => Some(ns),
            VarScope::Local => None,
        }
    }

    pub fn mutability(&self) -> Mutability {
        self.mutability
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }
}

/// Splits a variable reference into `(name, tag)`, validating both halves.
pub fn split_tagged_name(reference: &str) -> Result<(&str, Option<&str>), ScopeError> {
    match reference.split_once(TAG_MARKER) {
        None => {
            if reference.is_empty() {
                return Err(ScopeError::InvalidName {
                    reference: reference.to_string(),
                });
            }
            Ok((reference, None))
        }
        Some((name, tag)) => {
            if name.is_empty() || tag.is_empty() || tag.contains(TAG_MARKER) {
                return Err(ScopeError::InvalidName {
                    reference: reference.to_string(),
                });
            }
            Ok((name, Some(tag)))
        }
    }
}

/// A collection of named variables with shadowing, plus imports and exports.
///
/// Once finalized, a namespace is immutable: further scoping or unscoping is
/// an internal-invariant error, signaling a bug in the code driving this
/// service rather than a user mistake.
#[derive(Debug)]
pub struct Namespace {
    name: Option<String>,
    /// Per-name shadow stack; the last element is the innermost definition.
    variables: HashMap<String, Vec<VarId>>,
    imported_namespaces: Vec<NamespaceId>,
    /// Imported variables, resolved eagerly at import time.
    imported_vars: HashMap<String, VarId>,
    exports: HashSet<String>,
    finalized: bool,
}

impl Namespace {
    fn new(name: Option<String>) -> Self {
        Namespace {
            name,
            variables: HashMap::new(),
            imported_namespaces: Vec::new(),
            imported_vars: HashMap::new(),
            exports: HashSet::new(),
            finalized: false,
        }
    }

    /// The namespace name; only the anonymous root has none.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_final(&self) -> bool {
        self.finalized
    }

    pub fn imports(&self) -> &[NamespaceId] {
        &self.imported_namespaces
    }

    pub fn exports(&self) -> &HashSet<String> {
        &self.exports
    }

    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<root>")
    }

    fn ensure_not_final(&self) -> Result<(), ScopeError> {
        if self.finalized {
            return Err(ScopeError::Internal(format!(
                "the final namespace {} cannot be changed",
                self.display_name()
            )));
        }
        Ok(())
    }
}

/// The scope service: owns every variable and namespace of one compilation.
///
/// Construction creates the `system` namespace and an anonymous root that
/// implicitly imports it, plus a local namespace for lexical (non-global)
/// variables. Nothing here persists beyond a single query compile.
#[derive(Debug)]
pub struct Scopes {
    vars: Vec<Var>,
    namespaces: Vec<Namespace>,
    system: NamespaceId,
    root: NamespaceId,
    local: NamespaceId,
}

pub const SYSTEM_NAMESPACE: &str = "system";
const LOCAL_NAMESPACE: &str = "*local*";

impl Default for Scopes {
    fn default() -> Self {
        Self::new()
    }
}

impl Scopes {
    pub fn new() -> Self {
        let mut scopes = Scopes {
            vars: Vec::new(),
            namespaces: Vec::new(),
            system: NamespaceId(0),
            root: NamespaceId(1),
            local: NamespaceId(2),
        };
        scopes
            .namespaces
            .push(Namespace::new(Some(SYSTEM_NAMESPACE.to_string())));
        scopes.namespaces.push(Namespace::new(None));
        scopes
            .namespaces
            .push(Namespace::new(Some(LOCAL_NAMESPACE.to_string())));
        // The root implicitly imports system, like every non-root namespace.
        scopes.namespaces[1].imported_namespaces.push(scopes.system);
        scopes
    }

    pub fn system_namespace(&self) -> NamespaceId {
        self.system
    }

    pub fn root_namespace(&self) -> NamespaceId {
        self.root
    }

    pub fn var(&self, id: VarId) -> &Var {
        &self.vars[id.0]
    }

    pub fn namespace(&self, id: NamespaceId) -> &Namespace {
        &self.namespaces[id.0]
    }

    /// Creates a namespace that implicitly imports the system namespace.
    pub fn create_namespace(&mut self, name: &str) -> NamespaceId {
        let id = NamespaceId(self.namespaces.len());
        let mut ns = Namespace::new(Some(name.to_string()));
        ns.imported_namespaces.push(self.system);
        self.namespaces.push(ns);
        // System exports are visible without explicit import.
        let system = self.system;
        self.copy_exports(id, system);
        id
    }

    fn alloc_var(
        &mut self,
        name: &str,
        tag: Option<&str>,
        scope: VarScope,
        mutability: Mutability,
    ) -> VarId {
        let id = VarId(self.vars.len());
        self.vars.push(Var {
            name: name.to_string(),
            tag: tag.map(str::to_string),
            scope,
            mutability,
            hidden: false,
        });
        id
    }

    /// Creates a fresh local variable and pushes it above any same-named
    /// prior definition. The prior definition is shadowed, not destroyed.
    pub fn scope(&mut self, reference: &str) -> Result<VarId, ScopeError> {
        self.scope_with(reference, Mutability::Final)
    }

    pub fn scope_with(
        &mut self,
        reference: &str,
        mutability: Mutability,
    ) -> Result<VarId, ScopeError> {
        let (name, tag) = split_tagged_name(reference)?;
        self.namespaces[self.local.0].ensure_not_final()?;
        if let Some(stack) = self.namespaces[self.local.0].variables.get(name)
            && let Some(&top) = stack.last()
            && self.vars[top.0].mutability == Mutability::Mutable
        {
            return Err(ScopeError::ShadowMutable {
                name: self.vars[top.0].tagged_name(),
            });
        }
        let id = self.alloc_var(name, tag, VarScope::Local, mutability);
        self.namespaces[self.local.0]
            .variables
            .entry(name.to_string())
            .or_default()
            .push(id);
        Ok(id)
    }

    /// Mints a fresh local variable without putting it into scope. Used by
    /// the planner for temporaries (join keys, pipeline records) that are
    /// only ever referenced through their handle.
    pub fn make_var(&mut self, name: &str) -> VarId {
        self.alloc_var(name, None, VarScope::Local, Mutability::Final)
    }

    /// Pops `var` from its name's shadow chain. Rewrite passes may unscope
    /// out of strict LIFO order, so the chain is spliced at the matching
    /// position. Unscoping an unrecognized variable is a no-op.
    pub fn unscope(&mut self, var: VarId) -> Result<(), ScopeError> {
        let ns = match self.vars[var.0].scope {
            VarScope::Local => self.local,
            VarScope::Global(ns) => ns,
        };
        self.namespaces[ns.0].ensure_not_final()?;
        let name = self.vars[var.0].name.clone();
        if let Some(stack) = self.namespaces[ns.0].variables.get_mut(&name) {
            if let Some(pos) = stack.iter().rposition(|&v| v == var) {
                stack.remove(pos);
            }
            if stack.is_empty() {
                self.namespaces[ns.0].variables.remove(&name);
            }
        }
        Ok(())
    }

    /// Resolves `name` or `name#tag`, searching local definitions first and
    /// imported variables second.
    pub fn inscope(&self, reference: &str) -> Result<VarId, ScopeError> {
        self.resolve(reference, false)
    }

    /// Like [`Scopes::inscope`] but never consults imported variables.
    pub fn inscope_local(&self, reference: &str) -> Result<VarId, ScopeError> {
        self.resolve(reference, true)
    }

    fn resolve(&self, reference: &str, local_only: bool) -> Result<VarId, ScopeError> {
        let (name, tag) = split_tagged_name(reference)?;
        let found = self
            .find_in_namespace(self.local, name, tag)
            .or_else(|| self.find_in_namespace(self.root, name, tag))
            .or_else(|| {
                // Imported variables are globals and never tagged.
                if local_only || tag.is_some() {
                    None
                } else {
                    self.namespaces[self.root.0].imported_vars.get(name).copied()
                }
            });
        match found {
            None => Err(ScopeError::NotDefined {
                name: reference.to_string(),
            }),
            Some(id) if self.vars[id.0].hidden => Err(ScopeError::Hidden {
                name: self.vars[id.0].tagged_name(),
            }),
            Some(id) => Ok(id),
        }
    }

    /// Innermost visible definition of `name` (optionally with a matching
    /// tag) in one namespace, walking the shadow chain top-down.
    fn find_in_namespace(&self, ns: NamespaceId, name: &str, tag: Option<&str>) -> Option<VarId> {
        let stack = self.namespaces[ns.0].variables.get(name)?;
        match tag {
            None => stack.last().copied(),
            Some(tag) => stack
                .iter()
                .rev()
                .copied()
                .find(|v| self.vars[v.0].tag.as_deref() == Some(tag)),
        }
    }

    /// Marks a variable as not referenceable in the current parse context.
    pub fn set_hidden(&mut self, var: VarId, hidden: bool) {
        self.vars[var.0].hidden = hidden;
    }

    /// Defines a global variable in the given namespace. Unlike local
    /// shadowing, redefinition is last-writer-wins: the previous global
    /// binding of the same name is removed outright first.
    ///
    /// Globals never carry a tag; a tagged reference is rejected.
    pub fn scope_global(
        &mut self,
        ns: NamespaceId,
        reference: &str,
        mutability: Mutability,
    ) -> Result<VarId, ScopeError> {
        let (name, tag) = split_tagged_name(reference)?;
        if tag.is_some() {
            return Err(ScopeError::InvalidName {
                reference: reference.to_string(),
            });
        }
        self.namespaces[ns.0].ensure_not_final()?;
        // The old binding is discarded, not shadowed.
        if let Some(stack) = self.namespaces[ns.0].variables.get_mut(name) {
            stack.pop();
            if stack.is_empty() {
                self.namespaces[ns.0].variables.remove(name);
            }
        }
        let id = self.alloc_var(name, None, VarScope::Global(ns), mutability);
        self.namespaces[ns.0]
            .variables
            .entry(name.to_string())
            .or_default()
            .push(id);
        Ok(id)
    }

    /// Defines a global in the anonymous root namespace.
    pub fn scope_root_global(
        &mut self,
        reference: &str,
        mutability: Mutability,
    ) -> Result<VarId, ScopeError> {
        let root = self.root;
        self.scope_global(root, reference, mutability)
    }

    /// Declares which names a namespace exports. Underscore-prefixed names
    /// never export; by default (no explicit export set) every other name
    /// does.
    pub fn set_exports<I: IntoIterator<Item = String>>(
        &mut self,
        ns: NamespaceId,
        names: I,
    ) -> Result<(), ScopeError> {
        for name in names {
            if !self.namespaces[ns.0].variables.contains_key(&name) {
                return Err(ScopeError::NotExported {
                    name,
                    namespace: self.namespaces[ns.0].display_name().to_string(),
                });
            }
            self.namespaces[ns.0].exports.insert(name);
        }
        Ok(())
    }

    fn exported_names(&self, ns: NamespaceId) -> Vec<String> {
        let namespace = &self.namespaces[ns.0];
        if namespace.exports.is_empty() {
            namespace
                .variables
                .keys()
                .filter(|n| !n.starts_with('_'))
                .cloned()
                .collect()
        } else {
            namespace.exports.iter().cloned().collect()
        }
    }

    /// Imports `from` into `into`: records the namespace and eagerly
    /// resolves every exported variable. Later redefinitions in `from` are
    /// not seen by `into`; imports are a snapshot.
    pub fn import(&mut self, into: NamespaceId, from: NamespaceId) -> Result<(), ScopeError> {
        self.namespaces[into.0].ensure_not_final()?;
        if !self.namespaces[into.0].imported_namespaces.contains(&from) {
            self.namespaces[into.0].imported_namespaces.push(from);
        }
        self.copy_exports(into, from);
        Ok(())
    }

    fn copy_exports(&mut self, into: NamespaceId, from: NamespaceId) {
        for name in self.exported_names(from) {
            if let Some(var) = self.find_in_namespace(from, &name, None) {
                self.namespaces[into.0].imported_vars.insert(name, var);
            }
        }
    }

    /// Imports selected variables from another namespace, resolved eagerly.
    pub fn import_vars(
        &mut self,
        into: NamespaceId,
        from: NamespaceId,
        names: &[&str],
    ) -> Result<(), ScopeError> {
        self.namespaces[into.0].ensure_not_final()?;
        for &name in names {
            let var = self.find_in_namespace(from, name, None).ok_or_else(|| {
                ScopeError::NotExported {
                    name: name.to_string(),
                    namespace: self.namespaces[from.0].display_name().to_string(),
                }
            })?;
            self.namespaces[into.0]
                .imported_vars
                .insert(name.to_string(), var);
        }
        Ok(())
    }

    /// Finalizes a namespace. Idempotent; once set, any further scoping or
    /// unscoping against it is an internal-invariant error.
    pub fn make_final(&mut self, ns: NamespaceId) {
        self.namespaces[ns.0].finalized = true;
    }
}

/// Registry of module names to their source directories.
///
/// Module file loading itself is out of scope here; the registry only
/// enforces the registration policy: the first-registered directory for a
/// name wins, and a second registration errors only when it names a
/// *different* directory.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    dirs: HashMap<String, String>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, directory: &str) -> Result<(), ScopeError> {
        match self.dirs.get(name) {
            None => {
                self.dirs.insert(name.to_string(), directory.to_string());
                Ok(())
            }
            Some(existing) if existing == directory => Ok(()),
            Some(existing) => Err(ScopeError::ModuleConflict {
                name: name.to_string(),
                existing: existing.clone(),
                offered: directory.to_string(),
            }),
        }
    }

    pub fn directory(&self, name: &str) -> Option<&str> {
        self.dirs.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_plain_and_tagged() {
        assert_eq!(split_tagged_name("x").unwrap(), ("x", None));
        assert_eq!(split_tagged_name("x#1").unwrap(), ("x", Some("1")));
        assert!(split_tagged_name("#1").is_err());
        assert!(split_tagged_name("x#").is_err());
        assert!(split_tagged_name("x#1#2").is_err());
        assert!(split_tagged_name("").is_err());
    }

    #[test]
    fn module_registry_first_wins_unless_different() {
        let mut reg = ModuleRegistry::new();
        reg.register("util", "/a/util").unwrap();
        // Same directory again is fine.
        reg.register("util", "/a/util").unwrap();
        let err = reg.register("util", "/b/util").unwrap_err();
        assert!(matches!(err, ScopeError::ModuleConflict { .. }));
        assert_eq!(reg.directory("util"), Some("/a/util"));
    }
}
