//! The expression tree.
//!
//! Nodes live in an [`ExprArena`] and are addressed by [`ExprId`]. Each node
//! owns an ordered child list; the parent index is pure bookkeeping for tree
//! surgery and is recomputed whenever a subtree is spliced, so there are no
//! reference cycles and no lifetime games.
//!
//! Substitution ([`ExprArena::replace_var_uses`]) is capture-safe without any
//! renaming because every `scope()` call mints a distinct [`VarId`]: a nested
//! binding of the "same" surface name is a different variable entirely.

use std::collections::HashSet;

use crate::scope::VarId;
use crate::value::Value;

/// Handle to a node owned by an [`ExprArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(pub(crate) usize);

/// What a binding node associates with its variable(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// `var = expr`: a let-style definition.
    Eq,
    /// `var in expr`: iteration over an array source.
    In,
    /// `name: value in record`: iteration over a record's fields.
    InRec,
    /// Aggregate-function binding inside a grouping expression.
    AggFn,
}

/// One field of a record constructor, parallel to the node's children.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordField {
    /// `name: expr`
    Named(String),
    /// `expr.*`: copy every field of the child record.
    Splat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// A constant JSON value.
    Literal(Value),

    /// Reference to a variable.
    VarRef(VarId),

    /// Associates a variable with its defining expression(s). Not a real
    /// expression: the nodes that use bindings know how to walk them, but it
    /// still supports the evaluation protocol (evaluating sets the variable
    /// as a side effect).
    Binding {
        kind: BindingKind,
        var: VarId,
        /// Optional secondary variable: an `at` index for `In`, the value
        /// variable for `InRec`.
        var2: Option<VarId>,
        /// For join inputs: rows of this input survive without a match.
        preserve: bool,
    },

    /// Record constructor; `fields` parallels the children.
    Record(Vec<RecordField>),

    /// Array constructor.
    Array,

    /// Comprehension: children `[binding, collect]`; flatMap semantics.
    For,

    /// Children `[binding, predicate]`; keeps elements where the predicate
    /// holds.
    Filter,

    /// Children `[eq-binding, body]`; evaluates the binding, then the body.
    Block,

    /// N-ary hash equi-join. Children alternate `binding, on-key` per input,
    /// with a trailing collect expression.
    Join,

    /// Declarative multi-way join, the planner's input. Children are the
    /// `In` bindings, then the predicate conjunction, then the projection.
    MultiJoin,

    /// Field lookup on a record-valued child; null propagates.
    FieldAccess(String),

    Compare(CompareOp),
    And,
    Or,
    Not,
    IsNull,
}

#[derive(Debug, Clone)]
struct ExprNode {
    kind: ExprKind,
    children: Vec<ExprId>,
    parent: Option<ExprId>,
}

/// Arena owning every expression node of one compilation.
#[derive(Debug, Default)]
pub struct ExprArena {
    nodes: Vec<ExprNode>,
}

impl ExprArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: ExprKind, children: Vec<ExprId>) -> ExprId {
        let id = ExprId(self.nodes.len());
        for &child in &children {
            self.nodes[child.0].parent = Some(id);
        }
        self.nodes.push(ExprNode {
            kind,
            children,
            parent: None,
        });
        id
    }

    pub fn kind(&self, id: ExprId) -> &ExprKind {
        &self.nodes[id.0].kind
    }

    pub fn children(&self, id: ExprId) -> &[ExprId] {
        &self.nodes[id.0].children
    }

    pub fn child(&self, id: ExprId, i: usize) -> ExprId {
        self.nodes[id.0].children[i]
    }

    pub fn parent(&self, id: ExprId) -> Option<ExprId> {
        self.nodes[id.0].parent
    }

    /// Replaces child `i` of `id`, fixing the new child's parent link.
    pub fn set_child(&mut self, id: ExprId, i: usize, new: ExprId) {
        self.nodes[id.0].children[i] = new;
        self.nodes[new.0].parent = Some(id);
    }

    // -- builders ----------------------------------------------------------

    pub fn literal(&mut self, v: Value) -> ExprId {
        self.add(ExprKind::Literal(v), vec![])
    }

    pub fn var_ref(&mut self, var: VarId) -> ExprId {
        self.add(ExprKind::VarRef(var), vec![])
    }

    pub fn binding(
        &mut self,
        kind: BindingKind,
        var: VarId,
        var2: Option<VarId>,
        preserve: bool,
        exprs: Vec<ExprId>,
    ) -> ExprId {
        self.add(
            ExprKind::Binding {
                kind,
                var,
                var2,
                preserve,
            },
            exprs,
        )
    }

    pub fn in_binding(&mut self, var: VarId, source: ExprId) -> ExprId {
        self.binding(BindingKind::In, var, None, false, vec![source])
    }

    pub fn record(&mut self, fields: Vec<(RecordField, ExprId)>) -> ExprId {
        let (names, children) = fields.into_iter().unzip();
        self.add(ExprKind::Record(names), children)
    }

    pub fn array(&mut self, items: Vec<ExprId>) -> ExprId {
        self.add(ExprKind::Array, items)
    }

    pub fn for_expr(&mut self, var: VarId, source: ExprId, collect: ExprId) -> ExprId {
        let binding = self.in_binding(var, source);
        self.add(ExprKind::For, vec![binding, collect])
    }

    pub fn filter(&mut self, var: VarId, source: ExprId, predicate: ExprId) -> ExprId {
        let binding = self.in_binding(var, source);
        self.add(ExprKind::Filter, vec![binding, predicate])
    }

    pub fn field_access(&mut self, record: ExprId, name: &str) -> ExprId {
        self.add(ExprKind::FieldAccess(name.to_string()), vec![record])
    }

    /// `var.field`, the path shape the planner rewrites loop variables to.
    pub fn field_path(&mut self, var: VarId, name: &str) -> ExprId {
        let base = self.var_ref(var);
        self.field_access(base, name)
    }

    pub fn compare(&mut self, op: CompareOp, left: ExprId, right: ExprId) -> ExprId {
        self.add(ExprKind::Compare(op), vec![left, right])
    }

    pub fn and(&mut self, left: ExprId, right: ExprId) -> ExprId {
        self.add(ExprKind::And, vec![left, right])
    }

    pub fn or(&mut self, left: ExprId, right: ExprId) -> ExprId {
        self.add(ExprKind::Or, vec![left, right])
    }

    pub fn not(&mut self, operand: ExprId) -> ExprId {
        self.add(ExprKind::Not, vec![operand])
    }

    pub fn is_null(&mut self, operand: ExprId) -> ExprId {
        self.add(ExprKind::IsNull, vec![operand])
    }

    /// N-ary join node: `parts` is one `(binding, on-key)` pair per input.
    pub fn join(&mut self, parts: Vec<(ExprId, ExprId)>, collect: ExprId) -> ExprId {
        let mut children = Vec::with_capacity(parts.len() * 2 + 1);
        for (binding, on) in parts {
            children.push(binding);
            children.push(on);
        }
        children.push(collect);
        self.add(ExprKind::Join, children)
    }

    pub fn multi_join(
        &mut self,
        bindings: Vec<ExprId>,
        predicate: ExprId,
        project: ExprId,
    ) -> ExprId {
        let mut children = bindings;
        children.push(predicate);
        children.push(project);
        self.add(ExprKind::MultiJoin, children)
    }

    // -- analysis and surgery ----------------------------------------------

    /// Deep-copies the subtree rooted at `id`, returning the new root.
    pub fn clone_subtree(&mut self, id: ExprId) -> ExprId {
        let kind = self.nodes[id.0].kind.clone();
        let children = self.nodes[id.0].children.clone();
        let new_children = children
            .into_iter()
            .map(|c| self.clone_subtree(c))
            .collect();
        self.add(kind, new_children)
    }

    /// The set of variables referenced in the subtree but not bound within
    /// it (free variables).
    pub fn free_vars(&self, id: ExprId) -> HashSet<VarId> {
        let mut used = HashSet::new();
        let mut bound = HashSet::new();
        self.collect_vars(id, &mut used, &mut bound);
        used.difference(&bound).copied().collect()
    }

    fn collect_vars(&self, id: ExprId, used: &mut HashSet<VarId>, bound: &mut HashSet<VarId>) {
        match &self.nodes[id.0].kind {
            ExprKind::VarRef(var) => {
                used.insert(*var);
            }
            ExprKind::Binding { var, var2, .. } => {
                bound.insert(*var);
                if let Some(v2) = var2 {
                    bound.insert(*v2);
                }
            }
            _ => {}
        }
        for i in 0..self.nodes[id.0].children.len() {
            self.collect_vars(self.nodes[id.0].children[i], used, bound);
        }
    }

    /// Replaces every reference to `var` in the subtree at `root` with a
    /// fresh clone of `replacement`, in place. Returns how many uses were
    /// rewritten. Capture-safe: variable identity is by `VarId`, so a nested
    /// same-named binding can never be confused with `var`.
    pub fn replace_var_uses(&mut self, root: ExprId, var: VarId, replacement: ExprId) -> usize {
        let mut uses = Vec::new();
        self.find_var_uses(root, var, &mut uses);
        for &site in &uses {
            let copy = self.clone_subtree(replacement);
            let parent = self.nodes[site.0].parent;
            self.nodes[site.0].kind = self.nodes[copy.0].kind.clone();
            self.nodes[site.0].children = self.nodes[copy.0].children.clone();
            self.nodes[site.0].parent = parent;
            for i in 0..self.nodes[site.0].children.len() {
                let child = self.nodes[site.0].children[i];
                self.nodes[child.0].parent = Some(site);
            }
        }
        uses.len()
    }

    fn find_var_uses(&self, id: ExprId, var: VarId, out: &mut Vec<ExprId>) {
        if let ExprKind::VarRef(v) = &self.nodes[id.0].kind
            && *v == var
        {
            out.push(id);
            return;
        }
        for i in 0..self.nodes[id.0].children.len() {
            self.find_var_uses(self.nodes[id.0].children[i], var, out);
        }
    }

    /// Structural equality of two subtrees: same kinds, same shape, with
    /// variables compared by identity.
    pub fn structural_eq(&self, a: ExprId, b: ExprId) -> bool {
        if self.nodes[a.0].kind != self.nodes[b.0].kind {
            return false;
        }
        let ca = &self.nodes[a.0].children;
        let cb = &self.nodes[b.0].children;
        ca.len() == cb.len() && ca.iter().zip(cb).all(|(&x, &y)| self.structural_eq(x, y))
    }

    /// Collects every `MultiJoin` node in the subtree, innermost first.
    pub fn multi_joins_bottom_up(&self, root: ExprId) -> Vec<ExprId> {
        let mut out = Vec::new();
        self.walk_multi_joins(root, &mut out);
        out
    }

    fn walk_multi_joins(&self, id: ExprId, out: &mut Vec<ExprId>) {
        for i in 0..self.nodes[id.0].children.len() {
            self.walk_multi_joins(self.nodes[id.0].children[i], out);
        }
        if matches!(self.nodes[id.0].kind, ExprKind::MultiJoin) {
            out.push(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scopes;

    #[test]
    fn free_vars_excludes_bound() {
        let mut scopes = Scopes::new();
        let x = scopes.scope("x").unwrap();
        let y = scopes.scope("y").unwrap();
        let mut arena = ExprArena::new();
        let src = arena.var_ref(y);
        let body = arena.var_ref(x);
        let comp = arena.for_expr(x, src, body);
        let free = arena.free_vars(comp);
        assert!(free.contains(&y));
        assert!(!free.contains(&x));
    }

    #[test]
    fn replace_var_uses_rewrites_in_place() {
        let mut scopes = Scopes::new();
        let x = scopes.scope("x").unwrap();
        let joined = scopes.make_var("$");
        let mut arena = ExprArena::new();
        let use1 = arena.var_ref(x);
        let use2 = arena.field_access(use1, "a");
        let lit = arena.literal(Value::Integer(1));
        let root = arena.compare(CompareOp::Eq, use2, lit);
        let path = arena.field_path(joined, "x");

        let n = arena.replace_var_uses(root, x, path);
        assert_eq!(n, 1);
        assert!(arena.free_vars(root).contains(&joined));
        assert!(!arena.free_vars(root).contains(&x));
        // The use site now reads $.x.a
        match arena.kind(arena.child(root, 0)) {
            ExprKind::FieldAccess(name) => assert_eq!(name, "a"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn structural_eq_compares_shape_and_vars() {
        let mut scopes = Scopes::new();
        let x = scopes.scope("x").unwrap();
        let y = scopes.scope("y").unwrap();
        let mut arena = ExprArena::new();
        let a = arena.field_path(x, "k");
        let b = arena.field_path(x, "k");
        let c = arena.field_path(y, "k");
        assert!(arena.structural_eq(a, b));
        assert!(!arena.structural_eq(a, c));
    }
}
