//! Carrying loaded values across iterations of serial loops.
//!
//! When iteration `x` loads `f[x]` and `f[x + 1]`, the value `f[x + 1]` is
//! what iteration `x + 1` loads as `f[x]`. Loads like these form chains
//! `f[x] <- f[x + 1] <- ... <- f[x + n - 1]`; a chain of `n` values keeps a
//! scratch buffer of `n` registers. Each iteration loads only the leading
//! edge into the last slot, runs the body against the scratch buffer and
//! shifts the slots down by one. The first `n - 1` values are loaded once,
//! before the loop:
//!
//! ```text
//!                                     allocate c[2] on the stack
//! for x in [0, n) {                   c[0] = f[0]
//!   out[x] = f[x] + f[x + 1]    =>    for x in [0, n) {
//! }                                     c[1] = f[x + 1]
//!                                       out[x] = c[0] + c[1]
//!                                       c[0] = c[1]
//!                                     }
//! ```
//!
//! Only buffers the loop never stores to are carried, and at most a fixed
//! number of values per loop so the scratch buffers stay in registers.

use std::collections::BTreeSet;
use std::sync::Arc;

use kiln_ir::analysis::stored_buffers;
use kiln_ir::stmt::For;
use kiln_ir::visit::{Mutator, for_each_expr_in_stmt, mutate_stmt_children, rewrite_expr};
use kiln_ir::{
    BinOp, CallType, Expr, ExprKind, ForType, MemoryType, NameGen, Scope, Stmt, StmtKind, Type,
    common_subexpression_elimination, graph_equal, simplify, stmt_uses_var, substitute_in_all_lets,
    substitute_in_stmt,
};
use tracing::debug;

use crate::config::LoopCarryOptions;

/// A step known to be zero.
fn is_zero(e: &Option<Arc<Expr>>) -> bool {
    e.as_ref().is_some_and(|e| e.is_zero())
}

/// Change of `e` per loop iteration when it is linear in the variables of
/// `linear`; `None` otherwise.
fn is_linear(e: &Arc<Expr>, linear: &Scope<Option<Arc<Expr>>>) -> Option<Arc<Expr>> {
    if e.ty() != Type::I32 {
        return None;
    }
    match e.kind() {
        ExprKind::Variable(v) => match linear.get(&v.name) {
            Some(step) => step.clone(),
            None => Some(Expr::make_zero(e.ty())),
        },
        ExprKind::Const(_) => Some(Expr::make_zero(e.ty())),
        ExprKind::Binary(BinOp::Add, a, b) => {
            let (la, lb) = (is_linear(a, linear), is_linear(b, linear));
            if is_zero(&lb) {
                la
            } else if is_zero(&la) {
                lb
            } else {
                Some(la?.add(lb?))
            }
        }
        ExprKind::Binary(BinOp::Sub, a, b) => {
            let (la, lb) = (is_linear(a, linear), is_linear(b, linear));
            if is_zero(&lb) { la } else { Some(la?.sub(lb?)) }
        }
        ExprKind::Binary(BinOp::Mul, a, b) => {
            let (la, lb) = (is_linear(a, linear), is_linear(b, linear));
            match (is_zero(&la), is_zero(&lb)) {
                (true, true) => la,
                (true, false) => Some(a.mul(lb?)),
                (false, true) => Some(la?.mul(b)),
                (false, false) => None,
            }
        }
        ExprKind::Ramp { base, stride, .. } => {
            if is_zero(&is_linear(stride, linear)) { is_linear(base, linear) } else { None }
        }
        ExprKind::Broadcast { value, .. } => is_linear(value, linear),
        _ => None,
    }
}

/// `e` as it will be on the next iteration, or `None` when something it
/// depends on changes non-linearly.
fn step_forwards(e: &Arc<Expr>, linear: &Scope<Option<Arc<Expr>>>) -> Option<Arc<Expr>> {
    let mut success = true;
    let stepped = rewrite_expr(e, |node| {
        let v = node.as_variable()?;
        match linear.get(&v.name) {
            Some(None) => {
                success = false;
                None
            }
            Some(Some(step)) if !step.is_zero() => Some(node.add(step)),
            _ => None,
        }
    });
    success.then(|| substitute_in_all_lets(&simplify(&common_subexpression_elimination(&stepped))))
}

/// Distinct loads in `s`, not counting loads inside load indices.
fn find_loads(s: &Arc<Stmt>) -> Vec<Arc<Expr>> {
    let mut out: Vec<Arc<Expr>> = Vec::new();
    for_each_expr_in_stmt(s, |e| {
        if e.as_load().is_none() {
            return true;
        }
        if !out.iter().any(|l| graph_equal(l, e)) {
            out.push(e.clone());
        }
        false
    });
    out
}

fn scratch_index(i: usize, ty: Type) -> Arc<Expr> {
    let i = i as i64;
    if ty.is_scalar() {
        Expr::int(i)
    } else {
        let lanes = ty.lanes();
        Expr::ramp(Expr::int(i * i64::from(lanes)), Expr::int(1), lanes)
    }
}

/// Applies `f` to every top-level expression of a straight-line statement.
struct MapExprs<F>(F);

impl<F: FnMut(&Arc<Expr>) -> Arc<Expr>> Mutator for MapExprs<F> {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        (self.0)(e)
    }
}

struct ScratchAllocation {
    name: String,
    ty: Type,
    size: i64,
    initial_stores: Arc<Stmt>,
}

/// Carries loads over one loop body.
struct LoopCarryOverLoop<'a> {
    names: &'a NameGen,
    /// Per-iteration step of every variable that depends on the loop
    /// variable; `None` for non-linear ones.
    linear: Scope<Option<Arc<Expr>>>,
    containing_lets: Vec<(String, Arc<Expr>)>,
    /// Buffers the loop writes; their loads cannot be carried.
    stored: BTreeSet<String>,
    max_carried_values: usize,
    allocs: Vec<ScratchAllocation>,
}

impl<'a> LoopCarryOverLoop<'a> {
    fn new(var: &str, names: &'a NameGen, stored: BTreeSet<String>, max_carried_values: usize) -> Self {
        let mut linear = Scope::new();
        linear.push(var, Some(Expr::int(1)));
        Self { names, linear, containing_lets: Vec::new(), stored, max_carried_values, allocs: Vec::new() }
    }

    /// Chains `[j, i, ...]` of load indices where load `i` this iteration is
    /// load `j` next iteration, longest first, trimmed to the budget.
    fn find_chains(&self, loads: &[Arc<Expr>]) -> Vec<Vec<usize>> {
        let parts: Vec<_> = loads.iter().filter_map(|l| l.as_load()).collect();
        let indices: Vec<_> = parts.iter().map(|l| simplify(&l.index)).collect();
        let next_indices: Vec<_> = parts.iter().map(|l| step_forwards(&l.index, &self.linear)).collect();
        let next_predicates: Vec<_> = parts.iter().map(|l| step_forwards(&l.predicate, &self.linear)).collect();

        let mut chains: Vec<Vec<usize>> = Vec::new();
        for i in 0..parts.len() {
            for j in 0..parts.len() {
                // Loop invariants are not carried.
                if i == j || parts[i].name != parts[j].name {
                    continue;
                }
                let same_index = next_indices[j].as_ref().is_some_and(|n| graph_equal(&indices[i], n));
                let same_predicate =
                    next_predicates[j].as_ref().is_some_and(|n| graph_equal(&simplify(&parts[i].predicate), n));
                if same_index && same_predicate {
                    debug!(from = %loads[j], to = %loads[i], "found carried value");
                    chains.push(vec![j, i]);
                }
            }
        }

        // Join chains end to end.
        let mut done = false;
        while !done {
            done = true;
            for i in 0..chains.len() {
                if chains[i].is_empty() {
                    continue;
                }
                for j in 0..chains.len() {
                    if i == j || chains[j].is_empty() {
                        continue;
                    }
                    if chains[i].last() == chains[j].first() {
                        let rest = std::mem::take(&mut chains[j]);
                        chains[i].extend(rest.into_iter().skip(1));
                        done = false;
                    }
                }
            }
            chains.retain(|c| !c.is_empty());
        }

        // The longest chains get the most reuse out of each register.
        chains.sort_by(|a, b| b.len().cmp(&a.len()));
        let mut trimmed = Vec::new();
        let mut size = 0;
        for c in chains {
            if size + c.len() > self.max_carried_values {
                // A partial chain still needs at least two values to carry one.
                let room = self.max_carried_values - size;
                if room >= 2 {
                    trimmed.push(c[..room].to_vec());
                }
                break;
            }
            size += c.len();
            trimmed.push(c);
        }
        trimmed
    }

    fn lift_carried_values(&mut self, orig: &Arc<Stmt>) -> Arc<Stmt> {
        // Lets substituted in, so equal loads are equal trees.
        let graph = MapExprs(substitute_in_all_lets).mutate_stmt(orig);

        let mut loads = find_loads(&graph);
        loads.retain(|l| l.as_load().is_some_and(|l| !self.stored.contains(&l.name)));

        let chains = self.find_chains(&loads);
        if chains.is_empty() {
            return orig.clone();
        }

        let mut leading_edges = Vec::new();
        let mut shuffles = Vec::new();
        let mut core = graph;

        for chain in &chains {
            let first = &loads[chain[0]];
            let ty = first.ty();
            let buffer = first.as_load().map_or("", |l| l.name.as_str());
            let scratch = self.names.unique(&format!("{buffer}.carried"));
            let mut initial_values = Vec::new();

            for (i, &load_index) in chain.iter().enumerate() {
                let orig_load = &loads[load_index];
                let slot = scratch_index(i, orig_load.ty());
                let from_scratch = Expr::load(orig_load.ty(), scratch.clone(), slot.clone());
                core = MapExprs(|e: &Arc<Expr>| {
                    rewrite_expr(e, |node| graph_equal(node, orig_load).then(|| from_scratch.clone()))
                })
                .mutate_stmt(&core);

                if i == chain.len() - 1 {
                    leading_edges.push(Stmt::store(scratch.clone(), orig_load.clone(), slot));
                } else {
                    initial_values.push(orig_load.clone());
                }
                if i > 0 {
                    shuffles.push(Stmt::store(scratch.clone(), from_scratch, scratch_index(i - 1, orig_load.ty())));
                }
            }

            // The initial values share subexpressions; eliminate them jointly.
            let group_name = self.names.unique("carried_group");
            let group = Expr::call(Type::I32, group_name, initial_values, CallType::PureIntrinsic, 0);
            let mut group = simplify(&common_subexpression_elimination(&group));
            let mut initial_lets = Vec::new();
            while let ExprKind::Let { name, value, body } = group.kind() {
                initial_lets.push((name.clone(), value.clone()));
                group = body.clone();
            }
            let initial_values: Vec<Arc<Expr>> = match group.as_call() {
                Some(call) => call.args.to_vec(),
                None => unreachable!("grouping call of initial carried values disappeared: {group}"),
            };

            let stores = initial_values
                .iter()
                .enumerate()
                .map(|(i, v)| Stmt::store(scratch.clone(), v.clone(), scratch_index(i, v.ty())));
            let mut initial_stores = Stmt::block_of(stores);
            for (name, value) in initial_lets.into_iter().rev() {
                initial_stores = Stmt::let_stmt(name, value, initial_stores);
            }
            // The initial stores may be lifted out of the lets they use.
            for (name, value) in self.containing_lets.iter().rev() {
                if stmt_uses_var(&initial_stores, name) {
                    initial_stores = Stmt::let_stmt(name.clone(), value.clone(), initial_stores);
                }
            }

            debug!(buffer = %scratch, values = chain.len(), "carrying loads across iterations");
            self.allocs.push(ScratchAllocation {
                name: scratch,
                ty: ty.element_of(),
                size: chain.len() as i64 * i64::from(ty.lanes()),
                initial_stores,
            });
        }

        let core = MapExprs(common_subexpression_elimination).mutate_stmt(&core);
        Stmt::block_of(leading_edges.into_iter().chain(std::iter::once(core)).chain(shuffles))
    }
}

impl Mutator for LoopCarryOverLoop<'_> {
    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            StmtKind::LetStmt { name, value, body } => {
                let step = is_linear(value, &self.linear);
                self.linear.push(name.clone(), step);
                self.containing_lets.push((name.clone(), value.clone()));
                let new_body = self.mutate_stmt(body);
                self.containing_lets.pop();
                self.linear.pop(name);
                if Arc::ptr_eq(&new_body, body) {
                    s.clone()
                } else {
                    Stmt::let_stmt(name.clone(), value.clone(), new_body)
                }
            }
            StmtKind::Store { .. } => self.lift_carried_values(s),
            StmtKind::Block(..) => {
                let mut result = Vec::new();
                let mut stores = Vec::new();
                for stmt in s.block_to_vec() {
                    if matches!(stmt.kind(), StmtKind::Store { .. }) {
                        stores.push(stmt);
                        continue;
                    }
                    if !stores.is_empty() {
                        result.push(self.lift_carried_values(&Stmt::block_of(stores.drain(..))));
                    }
                    result.push(self.mutate_stmt(&stmt));
                }
                if !stores.is_empty() {
                    result.push(self.lift_carried_values(&Stmt::block_of(stores)));
                }
                Stmt::block_of(result)
            }
            // Code that might not run is not worth registers, and inner
            // loops would hold them across their whole run.
            StmtKind::For(_) | StmtKind::IfThenElse { .. } => s.clone(),
            _ => mutate_stmt_children(self, s),
        }
    }
}

struct LoopCarry {
    names: NameGen,
    max_carried_values: usize,
}

impl Mutator for LoopCarry {
    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        let StmtKind::For(f) = s.kind() else {
            return mutate_stmt_children(self, s);
        };
        if f.for_type != ForType::Serial || f.extent.is_one() {
            return mutate_stmt_children(self, s);
        }

        let body = self.mutate_stmt(&f.body);
        let mut carry = LoopCarryOverLoop::new(&f.name, &self.names, stored_buffers(&body), self.max_carried_values);
        let body = carry.mutate_stmt(&body);
        let mut result = Stmt::new(StmtKind::For(For { body, ..f.clone() }));

        let carried = !carry.allocs.is_empty();
        for alloc in carry.allocs {
            let initial = substitute_in_stmt(&f.name, &f.min, &alloc.initial_stores);
            result = Stmt::allocate(
                alloc.name,
                alloc.ty,
                MemoryType::Stack,
                vec![Expr::int(alloc.size)],
                Expr::const_true(),
                Stmt::block(initial, result),
            );
        }
        if carried {
            result = Stmt::if_then(f.extent.cmp_gt(0), result);
        }
        result
    }
}

/// Keep values loaded by one iteration of a serial loop and loaded again
/// by the next in scratch registers instead of reloading them.
#[tracing::instrument(skip_all)]
pub fn promote_registers(s: &Arc<Stmt>, options: &LoopCarryOptions) -> Arc<Stmt> {
    if options.max_carried_values < 2 {
        return s.clone();
    }
    LoopCarry { names: NameGen::new(), max_carried_values: options.max_carried_values }.mutate_stmt(s)
}
