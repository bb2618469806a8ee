//! Compiles declarative multi-way joins into executable join chains.
//!
//! A `MultiJoin` node carries n input bindings, an equality-conjunction
//! predicate, and a projection. Planning decomposes the predicate into a join
//! graph (inputs as nodes, equalities as edges), propagates outer-join
//! obligations to a fixpoint, orders the inputs deterministically, and emits
//! a left-deep chain of binary hash joins over single-field record streams.
//! The chain threads merged records; the projection is rewritten to read the
//! original variables out of the final merged record.
//!
//! Cycles are allowed in purely inner join graphs: the cycle-closing
//! equalities fold into composite keys. With preserved inputs a cyclic graph
//! is rejected, with one exception: when every edge carries the same single
//! key per input, the cycle degenerates to a star and is emitted as one flat
//! n-ary join on the shared key.
//!
//! Planning is pure tree surgery. It never evaluates anything, so the same
//! input always produces the same plan and the same errors.

use std::collections::HashMap;

use tracing::debug;

use crate::error::PlanError;
use crate::expr::{BindingKind, CompareOp, ExprArena, ExprId, ExprKind, RecordField};
use crate::scope::{Scopes, VarId};

/// Expands every `MultiJoin` under `root`, innermost first, and returns the
/// (possibly new) root.
pub fn plan(arena: &mut ExprArena, scopes: &mut Scopes, root: ExprId) -> Result<ExprId, PlanError> {
    let mut root = root;
    for site in arena.multi_joins_bottom_up(root) {
        let replacement = expand_multi_join(arena, scopes, site)?;
        match arena.parent(site) {
            Some(parent) => {
                let slot = arena
                    .children(parent)
                    .iter()
                    .position(|&c| c == site)
                    .ok_or_else(|| {
                        PlanError::Internal("parent does not list its child".to_string())
                    })?;
                arena.set_child(parent, slot, replacement);
            }
            None => root = replacement,
        }
    }
    Ok(root)
}

/// One input of the join under construction.
struct JoinInput {
    binding: ExprId,
    var: VarId,
    preserved: bool,
}

/// An undirected join-graph edge between inputs `x` and `y` (`x < y`) with
/// its equality key pairs, oriented `(x side, y side)`.
///
/// `nullable_x` means rows may appear where input `x` contributed nothing,
/// so `x`'s side of any combination can be null. Both flags set makes the
/// edge a full outer join.
struct JoinEdge {
    x: usize,
    y: usize,
    keys: Vec<(ExprId, ExprId)>,
    nullable_x: bool,
    nullable_y: bool,
}

impl JoinEdge {
    fn is_full(&self) -> bool {
        self.nullable_x && self.nullable_y
    }

    fn touches(&self, input: usize) -> bool {
        self.x == input || self.y == input
    }

    fn other(&self, input: usize) -> usize {
        if self.x == input { self.y } else { self.x }
    }
}

fn expand_multi_join(
    arena: &mut ExprArena,
    scopes: &mut Scopes,
    site: ExprId,
) -> Result<ExprId, PlanError> {
    let child_count = arena.children(site).len();
    let n = child_count - 2;
    let predicate = arena.child(site, n);
    let project = arena.child(site, n + 1);

    let mut inputs = Vec::with_capacity(n);
    let mut var_to_input = HashMap::new();
    for i in 0..n {
        let binding = arena.child(site, i);
        let &ExprKind::Binding { var, preserve, .. } = arena.kind(binding) else {
            return Err(PlanError::Internal(
                "join input is not a binding".to_string(),
            ));
        };
        inputs.push(JoinInput {
            binding,
            var,
            preserved: preserve,
        });
        var_to_input.insert(var, i);
    }

    let mut edges = Vec::new();
    decompose_predicate(arena, scopes, predicate, &inputs, &var_to_input, &mut edges)?;
    propagate_nullability(&mut edges);
    check_connected(scopes, &inputs, &edges)?;

    let in_core: Vec<bool> = (0..n)
        .map(|i| inputs[i].preserved || edges.iter().any(|e| e.is_full() && e.touches(i)))
        .collect();
    debug!(
        inputs = n,
        edges = edges.len(),
        core = in_core.iter().filter(|&&c| c).count(),
        "join graph analyzed"
    );

    // A connected graph with more than n-1 edges has a cycle. Cycles only
    // endanger outer-join semantics; a purely inner cyclic equijoin is fine,
    // its cycle-closing equalities just fold into a step's composite key.
    if inputs.iter().any(|i| i.preserved) && edges.len() > n - 1 {
        if let Some(keys) = star_keys(arena, n, &edges) {
            debug!("cyclic graph degenerates to a star; emitting flat join");
            return Ok(emit_star(arena, &inputs, keys, project));
        }
        return Err(PlanError::PreservedCycle);
    }

    let order = order_inputs(&inputs, &edges, &in_core)?;
    debug!(?order, "join order fixed");
    emit_chain(arena, scopes, &inputs, &edges, &in_core, &order, project)
}

/// Splits the predicate conjunction into join-graph edges. Only conjunctions
/// of equalities are accepted, and each equality must relate exactly two
/// distinct inputs.
fn decompose_predicate(
    arena: &ExprArena,
    scopes: &Scopes,
    predicate: ExprId,
    inputs: &[JoinInput],
    var_to_input: &HashMap<VarId, usize>,
    edges: &mut Vec<JoinEdge>,
) -> Result<(), PlanError> {
    match arena.kind(predicate) {
        ExprKind::And => {
            decompose_predicate(
                arena,
                scopes,
                arena.child(predicate, 0),
                inputs,
                var_to_input,
                edges,
            )?;
            decompose_predicate(
                arena,
                scopes,
                arena.child(predicate, 1),
                inputs,
                var_to_input,
                edges,
            )
        }
        ExprKind::Compare(CompareOp::Eq) => {
            let left = arena.child(predicate, 0);
            let right = arena.child(predicate, 1);
            let li = side_input(arena, left, var_to_input)?;
            let ri = side_input(arena, right, var_to_input)?;
            if li == ri {
                return Err(PlanError::SelfReference {
                    var: scopes.var(inputs[li].var).tagged_name(),
                });
            }
            let (x, y, key) = if li < ri {
                (li, ri, (left, right))
            } else {
                (ri, li, (right, left))
            };
            match edges.iter_mut().find(|e| e.x == x && e.y == y) {
                Some(edge) => edge.keys.push(key),
                None => edges.push(JoinEdge {
                    x,
                    y,
                    keys: vec![key],
                    nullable_x: inputs[y].preserved,
                    nullable_y: inputs[x].preserved,
                }),
            }
            Ok(())
        }
        _ => Err(PlanError::NonEquality),
    }
}

/// The single input a key expression depends on.
fn side_input(
    arena: &ExprArena,
    expr: ExprId,
    var_to_input: &HashMap<VarId, usize>,
) -> Result<usize, PlanError> {
    let mut found = None;
    for var in arena.free_vars(expr) {
        let Some(&input) = var_to_input.get(&var) else {
            return Err(PlanError::OutsideInputs);
        };
        if found.replace(input).is_some_and(|prev| prev != input) {
            return Err(PlanError::PredicateShape);
        }
    }
    found.ok_or(PlanError::PredicateShape)
}

/// Spreads nullability to a fixpoint: if input `y` can be missing from a
/// combination (some edge marks it nullable from source `x`), then every
/// input joined to `y` other than `x` must tolerate that null too. An edge
/// made nullable in both directions is a full outer join.
fn propagate_nullability(edges: &mut [JoinEdge]) {
    let mut changed = true;
    while changed {
        changed = false;
        for i in 0..edges.len() {
            let (x, y) = (edges[i].x, edges[i].y);
            if edges[i].nullable_y {
                changed |= spread(edges, y, x);
            }
            if edges[i].nullable_x {
                changed |= spread(edges, x, y);
            }
        }
    }
}

/// Marks every neighbor of `from` (except `source`) nullable on its side.
fn spread(edges: &mut [JoinEdge], from: usize, source: usize) -> bool {
    let mut changed = false;
    for edge in edges.iter_mut() {
        if edge.x == from && edge.y != source && !edge.nullable_y {
            edge.nullable_y = true;
            changed = true;
        }
        if edge.y == from && edge.x != source && !edge.nullable_x {
            edge.nullable_x = true;
            changed = true;
        }
    }
    changed
}

/// Every input must be transitively joined to the first one.
fn check_connected(
    scopes: &Scopes,
    inputs: &[JoinInput],
    edges: &[JoinEdge],
) -> Result<(), PlanError> {
    let mut reached = vec![false; inputs.len()];
    reached[0] = true;
    let mut frontier = vec![0];
    while let Some(here) = frontier.pop() {
        for edge in edges.iter().filter(|e| e.touches(here)) {
            let next = edge.other(here);
            if !reached[next] {
                reached[next] = true;
                frontier.push(next);
            }
        }
    }
    match reached.iter().position(|&r| !r) {
        None => Ok(()),
        Some(i) => Err(PlanError::Disconnected {
            input: scopes.var(inputs[i].var).tagged_name(),
        }),
    }
}

/// For the cyclic case: returns one key expression per input when every edge
/// carries exactly one key pair and each input uses a single (structurally
/// equal) key expression across all its edges. Otherwise `None`.
fn star_keys(arena: &ExprArena, n: usize, edges: &[JoinEdge]) -> Option<Vec<ExprId>> {
    let mut keys: Vec<Option<ExprId>> = vec![None; n];
    for edge in edges {
        let &[(kx, ky)] = &edge.keys[..] else {
            return None;
        };
        for (input, key) in [(edge.x, kx), (edge.y, ky)] {
            match keys[input] {
                None => keys[input] = Some(key),
                Some(existing) if arena.structural_eq(existing, key) => {}
                Some(_) => return None,
            }
        }
    }
    keys.into_iter().collect()
}

/// Deterministic join order: start at the first preserved input (or the
/// first input outright), then repeatedly take the connected input, core
/// inputs first, lowest declaration index as the tiebreak.
fn order_inputs(
    inputs: &[JoinInput],
    edges: &[JoinEdge],
    in_core: &[bool],
) -> Result<Vec<usize>, PlanError> {
    let n = inputs.len();
    let start = inputs.iter().position(|i| i.preserved).unwrap_or(0);
    let mut order = vec![start];
    let mut placed = vec![false; n];
    placed[start] = true;
    while order.len() < n {
        let next = (0..n)
            .filter(|&i| !placed[i])
            .filter(|&i| {
                edges
                    .iter()
                    .any(|e| e.touches(i) && placed[e.other(i)])
            })
            .min_by_key(|&i| (!in_core[i], i))
            .ok_or_else(|| {
                PlanError::Internal("no connectable input despite connectivity check".to_string())
            })?;
        placed[next] = true;
        order.push(next);
    }
    let num_in_core = in_core.iter().filter(|&&c| c).count();
    if order[..num_in_core].iter().any(|&i| !in_core[i]) {
        return Err(PlanError::Internal(
            "core inputs are not a prefix of the join order".to_string(),
        ));
    }
    Ok(order)
}

/// Wraps one input as a stream of single-field records `{name: row}` so the
/// chain can merge inputs by splatting records together.
fn mapped_input(arena: &mut ExprArena, input: &JoinInput, name: &str) -> ExprId {
    let source = arena.child(input.binding, 0);
    let row = arena.var_ref(input.var);
    let record = arena.record(vec![(RecordField::Named(name.to_string()), row)]);
    let collect = arena.array(vec![record]);
    arena.for_expr(input.var, source, collect)
}

/// A key expression rewritten to read its input's row out of a merged
/// record: occurrences of the input variable become `holder.name`.
fn rebased_key(
    arena: &mut ExprArena,
    key: ExprId,
    var: VarId,
    holder: VarId,
    name: &str,
) -> ExprId {
    let copy = arena.clone_subtree(key);
    let path = arena.field_path(holder, name);
    arena.replace_var_uses(copy, var, path);
    copy
}

/// One composite key expression from parallel components.
fn composite_key(arena: &mut ExprArena, mut parts: Vec<ExprId>) -> Result<ExprId, PlanError> {
    match parts.len() {
        0 => Err(PlanError::Internal(
            "join step has no key components".to_string(),
        )),
        1 => Ok(parts.remove(0)),
        _ => Ok(arena.array(parts)),
    }
}

fn emit_chain(
    arena: &mut ExprArena,
    scopes: &mut Scopes,
    inputs: &[JoinInput],
    edges: &[JoinEdge],
    in_core: &[bool],
    order: &[usize],
    project: ExprId,
) -> Result<ExprId, PlanError> {
    let names: Vec<String> = inputs
        .iter()
        .map(|i| scopes.var(i.var).tagged_name())
        .collect();
    let num_in_core = in_core.iter().filter(|&&c| c).count();
    let num_preserved = inputs.iter().filter(|i| i.preserved).count();
    let any_preserved = num_preserved > 0;

    let mut pipe = mapped_input(arena, &inputs[order[0]], &names[order[0]]);
    let mut placed = vec![false; inputs.len()];
    placed[order[0]] = true;

    for step in 1..order.len() {
        let incoming = order[step];
        let left_var = scopes.make_var("$pipe");
        let right_var = scopes.make_var("$in");

        // Parallel key components, one per equality usable at this step.
        let mut left_keys = Vec::new();
        let mut right_keys = Vec::new();
        for edge in edges.iter().filter(|e| e.touches(incoming)) {
            let other = edge.other(incoming);
            if !placed[other] {
                continue;
            }
            for &(kx, ky) in &edge.keys {
                let (placed_key, new_key) = if edge.x == other { (kx, ky) } else { (ky, kx) };
                left_keys.push(rebased_key(
                    arena,
                    placed_key,
                    inputs[other].var,
                    left_var,
                    &names[other],
                ));
                right_keys.push(rebased_key(
                    arena,
                    new_key,
                    inputs[incoming].var,
                    right_var,
                    &names[incoming],
                ));
            }
        }
        let on_left = composite_key(arena, left_keys)?;
        let on_right = composite_key(arena, right_keys)?;

        let left_binding =
            arena.binding(BindingKind::In, left_var, None, any_preserved, vec![pipe]);
        let source = mapped_input(arena, &inputs[incoming], &names[incoming]);
        let right_binding = arena.binding(
            BindingKind::In,
            right_var,
            None,
            in_core[incoming],
            vec![source],
        );

        let left_ref = arena.var_ref(left_var);
        let right_ref = arena.var_ref(right_var);
        let merged = arena.record(vec![
            (RecordField::Splat, left_ref),
            (RecordField::Splat, right_ref),
        ]);
        let collect = arena.array(vec![merged]);
        pipe = arena.join(
            vec![(left_binding, on_left), (right_binding, on_right)],
            collect,
        );
        placed[incoming] = true;

        // Once the core is complete, rows where no preserved input
        // contributed are artifacts of full-outer plumbing; filter them out.
        if step + 1 == num_in_core && num_preserved < num_in_core {
            pipe = preserved_row_filter(arena, scopes, inputs, order, num_in_core, &names, pipe)?;
        }
    }

    // Hand the merged record to the projection.
    let joined = scopes.make_var("$joined");
    for (i, input) in inputs.iter().enumerate() {
        let path = arena.field_path(joined, &names[i]);
        arena.replace_var_uses(project, input.var, path);
    }
    let collect = arena.array(vec![project]);
    debug!(steps = order.len() - 1, "join chain emitted");
    Ok(arena.for_expr(joined, pipe, collect))
}

/// Keeps merged records where at least one preserved input is non-null.
fn preserved_row_filter(
    arena: &mut ExprArena,
    scopes: &mut Scopes,
    inputs: &[JoinInput],
    order: &[usize],
    num_in_core: usize,
    names: &[String],
    pipe: ExprId,
) -> Result<ExprId, PlanError> {
    let row = scopes.make_var("$row");
    let mut predicate = None;
    for &i in &order[..num_in_core] {
        if !inputs[i].preserved {
            continue;
        }
        let path = arena.field_path(row, &names[i]);
        let null_test = arena.is_null(path);
        let present = arena.not(null_test);
        predicate = Some(match predicate {
            None => present,
            Some(prev) => arena.or(prev, present),
        });
    }
    let predicate = predicate.ok_or_else(|| {
        PlanError::Internal("core filter requested with no preserved input".to_string())
    })?;
    Ok(arena.filter(row, pipe, predicate))
}

/// The degenerate cyclic case: all inputs share one join key, so the whole
/// graph collapses into a single n-ary join. The original input bindings are
/// reused directly, which keeps the projection's variables bound without any
/// rewriting.
fn emit_star(
    arena: &mut ExprArena,
    inputs: &[JoinInput],
    keys: Vec<ExprId>,
    project: ExprId,
) -> ExprId {
    let parts: Vec<(ExprId, ExprId)> = inputs
        .iter()
        .zip(keys)
        .map(|(input, key)| (input.binding, arena.clone_subtree(key)))
        .collect();
    let collect = arena.array(vec![project]);
    arena.join(parts, collect)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(x: usize, y: usize, nullable_x: bool, nullable_y: bool) -> JoinEdge {
        JoinEdge {
            x,
            y,
            keys: Vec::new(),
            nullable_x,
            nullable_y,
        }
    }

    #[test]
    fn propagation_through_a_middle_input_goes_full_outer() {
        // a[preserved] - b - c[preserved]: each endpoint makes the far side
        // of its edge nullable, and the obligations meet in the middle.
        let mut edges = vec![edge(0, 1, false, true), edge(1, 2, true, false)];
        propagate_nullability(&mut edges);
        assert!(edges.iter().all(JoinEdge::is_full));
    }

    #[test]
    fn propagation_is_idempotent_at_the_fixpoint() {
        let mut edges = vec![edge(0, 1, false, true), edge(1, 2, true, false)];
        propagate_nullability(&mut edges);
        let fixed: Vec<(bool, bool)> = edges
            .iter()
            .map(|e| (e.nullable_x, e.nullable_y))
            .collect();
        propagate_nullability(&mut edges);
        let again: Vec<(bool, bool)> = edges
            .iter()
            .map(|e| (e.nullable_x, e.nullable_y))
            .collect();
        assert_eq!(fixed, again);
    }

    #[test]
    fn single_preserved_input_only_nulls_its_neighbors() {
        // a - b[preserved] - c: the nullability flows outward from b and
        // must not reflect back to make anything full outer.
        let mut edges = vec![edge(0, 1, true, false), edge(1, 2, false, true)];
        propagate_nullability(&mut edges);
        assert!(!edges.iter().any(JoinEdge::is_full));
    }
}
