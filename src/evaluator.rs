//! Expression evaluation.
//!
//! Every expression supports two entry points: [`Evaluator::eval`] produces a
//! single value, and [`Evaluator::iter`] produces a pull-based [`ValueStream`]
//! over a sequence-valued expression. Either side can stand in for the other:
//! `eval` on a sequence node drains its stream into an array, and `iter` on a
//! non-sequence node evaluates it and iterates the resulting array.
//!
//! Runtime variable state lives in a [`Context`], keyed by `VarId`, so the
//! compiled tree itself stays immutable and reusable across runs. Binding
//! nodes set their variable as a side effect of being pulled; the enclosing
//! node (`For`, `Filter`, `Join`) relies on that ordering.

use std::collections::{HashMap, VecDeque};

use tracing::trace;

use crate::error::EvalError;
use crate::expr::{BindingKind, ExprArena, ExprId, ExprKind, RecordField};
use crate::scope::{Scopes, VarId};
use crate::value::{JoinKey, Value};

/// One variable's runtime state.
#[derive(Debug)]
pub enum Slot {
    /// Declared but not yet assigned; reading it is an error.
    Undefined,
    /// A fully materialized value.
    Value(Value),
    /// An unconsumed stream. Iterating the variable takes the stream out
    /// (single pass); evaluating it drains the stream and caches the array.
    Stream(ValueStream),
    /// Evaluate this expression on first read, then cache the result.
    Deferred(ExprId),
}

/// Per-run variable assignments. A fresh context per evaluation keeps the
/// compiled tree shareable.
#[derive(Debug, Default)]
pub struct Context {
    slots: HashMap<VarId, Slot>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&mut self, var: VarId, value: Value) {
        self.slots.insert(var, Slot::Value(value));
    }

    pub fn set_stream(&mut self, var: VarId, stream: ValueStream) {
        self.slots.insert(var, Slot::Stream(stream));
    }

    pub fn set_deferred(&mut self, var: VarId, expr: ExprId) {
        self.slots.insert(var, Slot::Deferred(expr));
    }

    pub fn clear(&mut self, var: VarId) {
        self.slots.insert(var, Slot::Undefined);
    }
}

/// A pull-based stream of values.
///
/// `Null` is a distinguished marker for a null (as opposed to empty)
/// sequence: it yields nothing when pulled, but materializes back to
/// `Value::Null` rather than `[]`.
///
/// Pulling requires the evaluator and context because most streams evaluate
/// subexpressions lazily, element by element.
#[derive(Debug)]
pub enum ValueStream {
    Null,
    Values(std::vec::IntoIter<Value>),
    Binding(Box<BindingStream>),
    For(Box<ForStream>),
    Filter(Box<FilterStream>),
    Join(Box<JoinStream>),
}

impl ValueStream {
    pub fn empty() -> Self {
        ValueStream::Values(Vec::new().into_iter())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ValueStream::Null)
    }

    pub fn next(
        &mut self,
        evaluator: &Evaluator<'_>,
        ctx: &mut Context,
    ) -> Result<Option<Value>, EvalError> {
        match self {
            ValueStream::Null => Ok(None),
            ValueStream::Values(it) => Ok(it.next()),
            ValueStream::Binding(s) => s.next(evaluator, ctx),
            ValueStream::For(s) => s.next(evaluator, ctx),
            ValueStream::Filter(s) => s.next(evaluator, ctx),
            ValueStream::Join(s) => s.next(evaluator, ctx),
        }
    }
}

/// Stream over a binding's source that assigns the bound variable(s) as a
/// side effect of each pull. On exhaustion the variable is reset to null so
/// stale values cannot leak into later evaluation.
#[derive(Debug)]
pub struct BindingStream {
    var: VarId,
    /// The `at` index for `in` bindings, the field value for `in record`.
    var2: Option<VarId>,
    source: Source,
    index: i64,
}

#[derive(Debug)]
enum Source {
    Seq(ValueStream),
    Fields(std::vec::IntoIter<(String, Value)>),
}

impl BindingStream {
    fn next(
        &mut self,
        evaluator: &Evaluator<'_>,
        ctx: &mut Context,
    ) -> Result<Option<Value>, EvalError> {
        match &mut self.source {
            Source::Seq(stream) => match stream.next(evaluator, ctx)? {
                Some(value) => {
                    ctx.set_value(self.var, value.clone());
                    if let Some(at) = self.var2 {
                        ctx.set_value(at, Value::Integer(self.index));
                        self.index += 1;
                    }
                    Ok(Some(value))
                }
                None => {
                    ctx.set_value(self.var, Value::Null);
                    Ok(None)
                }
            },
            Source::Fields(fields) => match fields.next() {
                Some((name, value)) => {
                    ctx.set_value(self.var, Value::String(name));
                    if let Some(v2) = self.var2 {
                        ctx.set_value(v2, value.clone());
                    }
                    Ok(Some(value))
                }
                None => {
                    ctx.set_value(self.var, Value::Null);
                    Ok(None)
                }
            },
        }
    }
}

/// flatMap: for each element of the binding, iterate the collect expression
/// and yield everything it produces.
#[derive(Debug)]
pub struct ForStream {
    binding: ValueStream,
    collect: ExprId,
    current: Option<ValueStream>,
}

impl ForStream {
    fn next(
        &mut self,
        evaluator: &Evaluator<'_>,
        ctx: &mut Context,
    ) -> Result<Option<Value>, EvalError> {
        loop {
            if let Some(inner) = &mut self.current {
                match inner.next(evaluator, ctx)? {
                    Some(v) => return Ok(Some(v)),
                    None => self.current = None,
                }
            }
            if self.binding.next(evaluator, ctx)?.is_none() {
                return Ok(None);
            }
            // A null collect contributes nothing, like an empty one.
            self.current = Some(evaluator.iter(self.collect, ctx)?);
        }
    }
}

#[derive(Debug)]
pub struct FilterStream {
    binding: ValueStream,
    predicate: ExprId,
}

impl FilterStream {
    fn next(
        &mut self,
        evaluator: &Evaluator<'_>,
        ctx: &mut Context,
    ) -> Result<Option<Value>, EvalError> {
        loop {
            match self.binding.next(evaluator, ctx)? {
                None => return Ok(None),
                Some(value) => {
                    if evaluator.eval(self.predicate, ctx)?.as_bool() {
                        return Ok(Some(value));
                    }
                }
            }
        }
    }
}

/// N-ary hash equi-join.
///
/// All inputs are consumed and bucketed by key up front; output combinations
/// are then produced lazily. Rows with a null key never match anything: if
/// their input is preserved they are emitted first, alone, with every other
/// input null, otherwise they are dropped.
///
/// For a given key, inputs with no rows are substituted with `[null]` when
/// at least one input that does have rows is preserved; with no preserved
/// participant the key produces nothing (inner behavior).
#[derive(Debug)]
pub struct JoinStream {
    vars: Vec<VarId>,
    collect: ExprId,
    /// One entry per pending key (or null-key row): the group of rows per
    /// input, with `[null]` already substituted for missing sides.
    group_sets: VecDeque<Vec<Vec<Value>>>,
    odometer: Vec<usize>,
    started: bool,
    current: Option<ValueStream>,
}

impl JoinStream {
    fn next(
        &mut self,
        evaluator: &Evaluator<'_>,
        ctx: &mut Context,
    ) -> Result<Option<Value>, EvalError> {
        loop {
            if let Some(inner) = &mut self.current {
                match inner.next(evaluator, ctx)? {
                    Some(v) => return Ok(Some(v)),
                    None => self.current = None,
                }
            }
            let Some(groups) = self.group_sets.front() else {
                return Ok(None);
            };
            if !self.started {
                self.odometer = vec![0; groups.len()];
                self.started = true;
            } else if !advance(&mut self.odometer, groups) {
                self.group_sets.pop_front();
                self.started = false;
                continue;
            }
            let groups = &self.group_sets[0];
            for (i, &var) in self.vars.iter().enumerate() {
                ctx.set_value(var, groups[i][self.odometer[i]].clone());
            }
            self.current = Some(evaluator.iter(self.collect, ctx)?);
        }
    }
}

/// A key that can never equal another key: null, or anything containing a
/// NaN. Rows carrying one match nothing, exactly like null-key rows; letting
/// them into the bucket table would strand them under a key that is not
/// equal to itself.
fn unmatchable_key(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Float(f) => f.is_nan(),
        Value::Array(items) => items.iter().any(unmatchable_key),
        Value::Object(fields) => fields.values().any(unmatchable_key),
        _ => false,
    }
}

/// Steps the cross-product odometer; false once every combination is spent.
fn advance(odometer: &mut [usize], groups: &[Vec<Value>]) -> bool {
    for i in (0..odometer.len()).rev() {
        odometer[i] += 1;
        if odometer[i] < groups[i].len() {
            return true;
        }
        odometer[i] = 0;
    }
    false
}

/// Evaluates compiled expression trees against a [`Context`].
pub struct Evaluator<'a> {
    arena: &'a ExprArena,
    scopes: &'a Scopes,
}

impl<'a> Evaluator<'a> {
    pub fn new(arena: &'a ExprArena, scopes: &'a Scopes) -> Self {
        Evaluator { arena, scopes }
    }

    /// Evaluates the expression to a single value. Sequence nodes drain
    /// their stream into an array; a null stream becomes `null`.
    pub fn eval(&self, id: ExprId, ctx: &mut Context) -> Result<Value, EvalError> {
        match self.arena.kind(id) {
            ExprKind::Literal(v) => Ok(v.clone()),

            ExprKind::VarRef(var) => self.read_var(*var, ctx),

            ExprKind::Binding { kind, var, .. } => {
                let value = self.eval(self.arena.child(id, 0), ctx)?;
                if *kind == BindingKind::Eq {
                    ctx.set_value(*var, value.clone());
                }
                Ok(value)
            }

            ExprKind::Record(fields) => {
                let mut record = HashMap::new();
                for (i, field) in fields.iter().enumerate() {
                    let value = self.eval(self.arena.child(id, i), ctx)?;
                    match field {
                        RecordField::Named(name) => {
                            if record.insert(name.clone(), value).is_some() {
                                return Err(EvalError::DuplicateField(name.clone()));
                            }
                        }
                        RecordField::Splat => match value {
                            Value::Null => {}
                            Value::Object(fields) => {
                                for (name, value) in fields {
                                    if record.insert(name.clone(), value).is_some() {
                                        return Err(EvalError::DuplicateField(name));
                                    }
                                }
                            }
                            other => {
                                return Err(EvalError::TypeError(format!(
                                    "cannot splat a {} into a record",
                                    other.type_name()
                                )));
                            }
                        },
                    }
                }
                Ok(Value::Object(record))
            }

            ExprKind::Array => {
                let mut items = Vec::with_capacity(self.arena.children(id).len());
                for i in 0..self.arena.children(id).len() {
                    items.push(self.eval(self.arena.child(id, i), ctx)?);
                }
                Ok(Value::Array(items))
            }

            ExprKind::For | ExprKind::Filter | ExprKind::Join => {
                let stream = self.iter(id, ctx)?;
                if stream.is_null() {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Array(self.drain(stream, ctx)?))
                }
            }

            ExprKind::Block => {
                self.eval(self.arena.child(id, 0), ctx)?;
                self.eval(self.arena.child(id, 1), ctx)
            }

            ExprKind::FieldAccess(name) => {
                match self.eval(self.arena.child(id, 0), ctx)? {
                    Value::Null => Ok(Value::Null),
                    Value::Object(mut fields) => Ok(fields.remove(name).unwrap_or(Value::Null)),
                    other => Err(EvalError::TypeError(format!(
                        "cannot access field {} of a {}",
                        name,
                        other.type_name()
                    ))),
                }
            }

            ExprKind::Compare(op) => {
                use crate::expr::CompareOp::*;
                let left = self.eval(self.arena.child(id, 0), ctx)?;
                let right = self.eval(self.arena.child(id, 1), ctx)?;
                match op {
                    Eq => Ok(Value::Boolean(left.loose_eq(&right))),
                    Ne => Ok(Value::Boolean(!left.loose_eq(&right))),
                    _ => {
                        if left.is_null() || right.is_null() {
                            return Ok(Value::Null);
                        }
                        let ord = left.partial_cmp_values(&right).ok_or_else(|| {
                            EvalError::TypeError(format!(
                                "cannot compare {} with {}",
                                left.type_name(),
                                right.type_name()
                            ))
                        })?;
                        Ok(Value::Boolean(match op {
                            Lt => ord.is_lt(),
                            Le => ord.is_le(),
                            Gt => ord.is_gt(),
                            Ge => ord.is_ge(),
                            Eq | Ne => unreachable!(),
                        }))
                    }
                }
            }

            ExprKind::And => {
                if !self.eval(self.arena.child(id, 0), ctx)?.as_bool() {
                    return Ok(Value::Boolean(false));
                }
                Ok(Value::Boolean(
                    self.eval(self.arena.child(id, 1), ctx)?.as_bool(),
                ))
            }

            ExprKind::Or => {
                if self.eval(self.arena.child(id, 0), ctx)?.as_bool() {
                    return Ok(Value::Boolean(true));
                }
                Ok(Value::Boolean(
                    self.eval(self.arena.child(id, 1), ctx)?.as_bool(),
                ))
            }

            ExprKind::Not => Ok(Value::Boolean(
                !self.eval(self.arena.child(id, 0), ctx)?.as_bool(),
            )),

            ExprKind::IsNull => Ok(Value::Boolean(
                self.eval(self.arena.child(id, 0), ctx)?.is_null(),
            )),

            ExprKind::MultiJoin => Err(EvalError::TypeError(
                "multi-way join must be planned before evaluation".to_string(),
            )),
        }
    }

    /// Iterates the expression as a sequence. Non-sequence nodes are
    /// evaluated and their array is iterated; a null value yields the null
    /// stream marker.
    pub fn iter(&self, id: ExprId, ctx: &mut Context) -> Result<ValueStream, EvalError> {
        match self.arena.kind(id) {
            ExprKind::VarRef(var) => self.iter_var(*var, ctx),

            ExprKind::Binding { kind, var, var2, .. } => match kind {
                BindingKind::In | BindingKind::AggFn => {
                    let source = self.iter(self.arena.child(id, 0), ctx)?;
                    Ok(ValueStream::Binding(Box::new(BindingStream {
                        var: *var,
                        var2: *var2,
                        source: Source::Seq(source),
                        index: 0,
                    })))
                }
                BindingKind::InRec => {
                    let record = self.eval(self.arena.child(id, 0), ctx)?;
                    let fields = match record {
                        Value::Null => Vec::new(),
                        Value::Object(fields) => {
                            let mut pairs: Vec<_> = fields.into_iter().collect();
                            pairs.sort_by(|a, b| a.0.cmp(&b.0));
                            pairs
                        }
                        other => {
                            return Err(EvalError::TypeError(format!(
                                "cannot iterate fields of a {}",
                                other.type_name()
                            )));
                        }
                    };
                    Ok(ValueStream::Binding(Box::new(BindingStream {
                        var: *var,
                        var2: *var2,
                        source: Source::Fields(fields.into_iter()),
                        index: 0,
                    })))
                }
                BindingKind::Eq => {
                    let value = self.eval(id, ctx)?;
                    self.iter_value(value)
                }
            },

            ExprKind::For => Ok(ValueStream::For(Box::new(ForStream {
                binding: self.iter(self.arena.child(id, 0), ctx)?,
                collect: self.arena.child(id, 1),
                current: None,
            }))),

            ExprKind::Filter => Ok(ValueStream::Filter(Box::new(FilterStream {
                binding: self.iter(self.arena.child(id, 0), ctx)?,
                predicate: self.arena.child(id, 1),
            }))),

            ExprKind::Join => self.build_join(id, ctx),

            _ => {
                let value = self.eval(id, ctx)?;
                self.iter_value(value)
            }
        }
    }

    /// Drains a stream to completion.
    pub fn drain(
        &self,
        mut stream: ValueStream,
        ctx: &mut Context,
    ) -> Result<Vec<Value>, EvalError> {
        let mut out = Vec::new();
        while let Some(v) = stream.next(self, ctx)? {
            out.push(v);
        }
        Ok(out)
    }

    fn iter_value(&self, value: Value) -> Result<ValueStream, EvalError> {
        match value {
            Value::Null => Ok(ValueStream::Null),
            Value::Array(items) => Ok(ValueStream::Values(items.into_iter())),
            other => Err(EvalError::TypeError(format!(
                "cannot iterate over a {}",
                other.type_name()
            ))),
        }
    }

    fn read_var(&self, var: VarId, ctx: &mut Context) -> Result<Value, EvalError> {
        match ctx.slots.get(&var) {
            Some(Slot::Value(v)) => Ok(v.clone()),
            Some(Slot::Stream(_)) => {
                // Drain the stream once and cache the materialized array.
                let Some(Slot::Stream(stream)) = ctx.slots.remove(&var) else {
                    unreachable!()
                };
                let value = if stream.is_null() {
                    Value::Null
                } else {
                    Value::Array(self.drain(stream, ctx)?)
                };
                ctx.set_value(var, value.clone());
                Ok(value)
            }
            Some(Slot::Deferred(expr)) => {
                let expr = *expr;
                let value = self.eval(expr, ctx)?;
                ctx.set_value(var, value.clone());
                Ok(value)
            }
            Some(Slot::Undefined) | None => Err(EvalError::UndefinedVariable(
                self.scopes.var(var).tagged_name(),
            )),
        }
    }

    fn iter_var(&self, var: VarId, ctx: &mut Context) -> Result<ValueStream, EvalError> {
        match ctx.slots.get(&var) {
            // A stored stream is single pass: take it out.
            Some(Slot::Stream(_)) => {
                let Some(Slot::Stream(stream)) = ctx.slots.remove(&var) else {
                    unreachable!()
                };
                ctx.clear(var);
                Ok(stream)
            }
            Some(Slot::Deferred(expr)) => {
                let expr = *expr;
                self.iter(expr, ctx)
            }
            _ => {
                let value = self.read_var(var, ctx)?;
                self.iter_value(value)
            }
        }
    }

    /// Iterates a join input source; a null input joins as empty.
    fn materialize_input(&self, id: ExprId, ctx: &mut Context) -> Result<Vec<Value>, EvalError> {
        let stream = self.iter(id, ctx)?;
        if stream.is_null() {
            Ok(Vec::new())
        } else {
            self.drain(stream, ctx)
        }
    }

    fn build_join(&self, id: ExprId, ctx: &mut Context) -> Result<ValueStream, EvalError> {
        let n = (self.arena.children(id).len() - 1) / 2;
        let collect = self.arena.child(id, n * 2);

        let mut vars = Vec::with_capacity(n);
        let mut preserved = Vec::with_capacity(n);
        // Buckets keep key insertion order so output order is deterministic.
        let mut key_order: Vec<JoinKey> = Vec::new();
        let mut buckets: HashMap<JoinKey, Vec<Vec<Value>>> = HashMap::new();
        let mut null_key_rows: Vec<(usize, Value)> = Vec::new();

        for i in 0..n {
            let binding = self.arena.child(id, i * 2);
            let on = self.arena.child(id, i * 2 + 1);
            let &ExprKind::Binding { var, preserve, .. } = self.arena.kind(binding) else {
                return Err(EvalError::TypeError(
                    "join input must be a binding".to_string(),
                ));
            };
            vars.push(var);
            preserved.push(preserve);

            let rows = self.materialize_input(self.arena.child(binding, 0), ctx)?;
            for row in rows {
                ctx.set_value(var, row.clone());
                let key = self.eval(on, ctx)?;
                if unmatchable_key(&key) {
                    if preserve {
                        null_key_rows.push((i, row));
                    }
                    continue;
                }
                let key = JoinKey::new(key);
                let groups = buckets.entry(key.clone()).or_insert_with(|| {
                    key_order.push(key.clone());
                    vec![Vec::new(); n]
                });
                groups[i].push(row);
            }
        }
        trace!(inputs = n, keys = key_order.len(), "join buckets built");

        let mut group_sets = VecDeque::new();
        // Null-key rows of preserved inputs come out first, unmatched.
        for (i, row) in null_key_rows {
            let mut groups = vec![vec![Value::Null]; n];
            groups[i] = vec![row];
            group_sets.push_back(groups);
        }
        for key in key_order {
            let Some(mut groups) = buckets.remove(&key) else {
                continue;
            };
            let has_empty = groups.iter().any(Vec::is_empty);
            if has_empty {
                let preserved_present = groups
                    .iter()
                    .zip(&preserved)
                    .any(|(g, &p)| p && !g.is_empty());
                if !preserved_present {
                    continue;
                }
                for group in &mut groups {
                    if group.is_empty() {
                        group.push(Value::Null);
                    }
                }
            }
            group_sets.push_back(groups);
        }

        Ok(ValueStream::Join(Box::new(JoinStream {
            vars,
            collect,
            group_sets,
            odometer: Vec::new(),
            started: false,
            current: None,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scopes;

    #[test]
    fn block_binding_is_visible_in_body() {
        let mut scopes = Scopes::new();
        let x = scopes.scope("x").unwrap();
        let mut arena = ExprArena::new();
        let one = arena.literal(Value::Integer(1));
        let binding = arena.binding(BindingKind::Eq, x, None, false, vec![one]);
        let body = arena.var_ref(x);
        let block = arena.add(ExprKind::Block, vec![binding, body]);

        let evaluator = Evaluator::new(&arena, &scopes);
        let mut ctx = Context::new();
        assert_eq!(evaluator.eval(block, &mut ctx), Ok(Value::Integer(1)));
    }

    #[test]
    fn duplicate_record_field_is_an_error() {
        let scopes = Scopes::new();
        let mut arena = ExprArena::new();
        let a = arena.literal(Value::Integer(1));
        let b = arena.literal(Value::Integer(2));
        let rec = arena.record(vec![
            (RecordField::Named("k".into()), a),
            (RecordField::Named("k".into()), b),
        ]);

        let evaluator = Evaluator::new(&arena, &scopes);
        let mut ctx = Context::new();
        assert_eq!(
            evaluator.eval(rec, &mut ctx),
            Err(EvalError::DuplicateField("k".into()))
        );
    }

    #[test]
    fn undefined_variable_names_the_variable() {
        let mut scopes = Scopes::new();
        let x = scopes.scope("x#1").unwrap();
        let mut arena = ExprArena::new();
        let use_x = arena.var_ref(x);

        let evaluator = Evaluator::new(&arena, &scopes);
        let mut ctx = Context::new();
        assert_eq!(
            evaluator.eval(use_x, &mut ctx),
            Err(EvalError::UndefinedVariable("x#1".into()))
        );
    }
}
