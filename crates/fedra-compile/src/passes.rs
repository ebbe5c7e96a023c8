//! Rewrite passes over fedra IR.
//!
//! Each pass applies its rule to saturation, so running a pass on its own
//! output is a no-op. Every pass preserves the type of the root.

use std::collections::BTreeSet;

use fedra_core::{Expr, ExprKind};

use crate::error::{CompileError, Result};
use crate::traverse::{all_names, binders, substitute, transform, Order, Rewrite, Transformed};

/// A single rewrite pass.
pub trait Pass: Send + Sync {
    /// Name of this pass (for logging).
    fn name(&self) -> &str;

    fn run(&self, expr: &Expr) -> Result<Expr>;
}

/// Nodes that cost nothing to evaluate twice.
pub(crate) fn is_duplicable(expr: &Expr) -> bool {
    matches!(
        expr.kind(),
        ExprKind::Reference { .. }
            | ExprKind::Data { .. }
            | ExprKind::Placement { .. }
            | ExprKind::Intrinsic { .. }
            | ExprKind::Compiled { .. }
            | ExprKind::Lambda { .. }
    )
}

/// Duplicable nodes, and structs or selections built only from them.
pub(crate) fn is_simple(expr: &Expr) -> bool {
    match expr.kind() {
        ExprKind::Struct { elements } => elements.iter().all(|(_, e)| is_simple(e)),
        ExprKind::Selection { source, .. } => is_simple(source),
        _ => is_duplicable(expr),
    }
}

/// Re-run `sweep` until it stops changing the tree.
fn saturate(expr: &Expr, mut sweep: impl FnMut(&Expr) -> Result<Expr>) -> Result<Expr> {
    let mut current = expr.clone();
    // Every productive sweep shrinks the tree or a per-node measure bounded
    // by its size.
    for _ in 0..=2 * expr.size() {
        let next = sweep(&current)?;
        if next.ptr_eq(&current) || next == current {
            return Ok(current);
        }
        current = next;
    }
    Ok(current)
}

fn split_block(expr: &Expr) -> Option<(&[(String, Expr)], &Expr)> {
    match expr.kind() {
        ExprKind::Block { locals, result } => Some((locals, result)),
        _ => None,
    }
}

fn rebuild_block(locals: Vec<(String, Expr)>, result: Expr) -> Result<Expr> {
    if locals.is_empty() {
        Ok(result)
    } else {
        Ok(Expr::block(locals, result)?)
    }
}

/// Deterministic fresh names that avoid a reserved set.
struct Namer {
    prefix: &'static str,
    next: usize,
    reserved: BTreeSet<String>,
}

impl Namer {
    fn new(prefix: &'static str, reserved: BTreeSet<String>) -> Self {
        Self {
            prefix,
            next: 0,
            reserved,
        }
    }

    fn fresh(&mut self) -> String {
        loop {
            self.next += 1;
            let name = format!("{}{}", self.prefix, self.next);
            if !self.reserved.contains(&name) {
                return name;
            }
        }
    }
}

// ---------------------------------------------------------------------------

/// Rename every bound variable to `_varN`, numbered in pre-order.
///
/// Free references keep their names, and generated names never collide with
/// them.
pub struct UniquifyNames;

impl Pass for UniquifyNames {
    fn name(&self) -> &str {
        "UniquifyNames"
    }

    fn run(&self, expr: &Expr) -> Result<Expr> {
        let mut namer = Namer::new("_var", expr.free_references().clone());
        let mut scope = Vec::new();
        uniquify(expr, &mut scope, &mut namer)
    }
}

fn uniquify(expr: &Expr, scope: &mut Vec<(String, String)>, namer: &mut Namer) -> Result<Expr> {
    match expr.kind() {
        ExprKind::Reference { name } => match scope.iter().rev().find(|(old, _)| old == name) {
            Some((_, new)) if new != name => {
                Ok(Expr::reference(new.clone(), expr.type_signature().clone())?)
            }
            _ => Ok(expr.clone()),
        },
        ExprKind::Lambda {
            parameter: Some((name, ty)),
            body,
        } => {
            let fresh = namer.fresh();
            scope.push((name.clone(), fresh.clone()));
            let new_body = uniquify(body, scope, namer)?;
            scope.pop();
            if fresh == *name && new_body.ptr_eq(body) {
                return Ok(expr.clone());
            }
            Ok(Expr::lambda(Some((fresh.as_str(), ty.clone())), new_body)?)
        }
        ExprKind::Block { locals, result } => {
            let depth = scope.len();
            let mut unchanged = true;
            let mut new_locals = Vec::with_capacity(locals.len());
            for (name, value) in locals {
                let v = uniquify(value, scope, namer)?;
                let fresh = namer.fresh();
                unchanged &= fresh == *name && v.ptr_eq(value);
                scope.push((name.clone(), fresh.clone()));
                new_locals.push((fresh, v));
            }
            let new_result = uniquify(result, scope, namer)?;
            scope.truncate(depth);
            if unchanged && new_result.ptr_eq(result) {
                return Ok(expr.clone());
            }
            Ok(Expr::block(new_locals, new_result)?)
        }
        _ => {
            let children = expr
                .children()
                .iter()
                .map(|c| uniquify(c, scope, namer))
                .collect::<Result<Vec<_>>>()?;
            Ok(expr.with_children(children)?)
        }
    }
}

// ---------------------------------------------------------------------------

/// Substitute block locals bound to duplicable values into their uses.
pub struct InlineBlockLocals;

impl Pass for InlineBlockLocals {
    fn name(&self) -> &str {
        "InlineBlockLocals"
    }

    fn run(&self, expr: &Expr) -> Result<Expr> {
        saturate(expr, |e| transform(e, &mut InlineLocalsRule))
    }
}

struct InlineLocalsRule;

impl Rewrite for InlineLocalsRule {
    fn rewrite(&mut self, expr: &Expr) -> Result<Transformed> {
        let Some((locals, result)) = split_block(expr) else {
            return Ok(Transformed::Unchanged);
        };
        let mut locals = locals.to_vec();
        let mut result = result.clone();
        let mut changed = false;
        let mut i = 0;
        while i < locals.len() {
            let (name, value) = locals[i].clone();
            if !is_duplicable(&value) || !capture_free(&value, &locals[i + 1..], &result) {
                i += 1;
                continue;
            }
            let rest = locals.split_off(i + 1);
            locals.truncate(i);
            let tail = substitute(&Expr::block(rest, result)?, &name, &value)?;
            let (rest, new_result) = split_block(&tail).ok_or_else(|| {
                CompileError::TypeMismatch("substitution replaced a block".into())
            })?;
            locals.extend(rest.iter().cloned());
            result = new_result.clone();
            changed = true;
        }
        if !changed {
            return Ok(Transformed::Unchanged);
        }
        Ok(Transformed::Replaced(rebuild_block(locals, result)?))
    }
}

/// Whether moving `value` past `rest` into `result` keeps its free names
/// referring to the same bindings.
fn capture_free(value: &Expr, rest: &[(String, Expr)], result: &Expr) -> bool {
    let free = value.free_references();
    if free.is_empty() {
        return true;
    }
    rest.iter()
        .all(|(n, v)| !free.contains(n) && binders(v).is_disjoint(free))
        && binders(result).is_disjoint(free)
}

// ---------------------------------------------------------------------------

/// `Call(Lambda(x, body), arg)` becomes `Block([(x, arg)], body)`.
pub struct InlineLambdaCalls;

impl Pass for InlineLambdaCalls {
    fn name(&self) -> &str {
        "InlineLambdaCalls"
    }

    fn run(&self, expr: &Expr) -> Result<Expr> {
        saturate(expr, |e| transform(e, &mut LambdaCallRule))
    }
}

struct LambdaCallRule;

impl Rewrite for LambdaCallRule {
    fn rewrite(&mut self, expr: &Expr) -> Result<Transformed> {
        let ExprKind::Call { function, argument } = expr.kind() else {
            return Ok(Transformed::Unchanged);
        };
        let ExprKind::Lambda { parameter, body } = function.kind() else {
            return Ok(Transformed::Unchanged);
        };
        match (parameter, argument) {
            (Some((name, _)), Some(arg)) => Ok(Transformed::Replaced(Expr::block(
                vec![(name.clone(), arg.clone())],
                body.clone(),
            )?)),
            (None, None) => Ok(Transformed::Replaced(body.clone())),
            _ => Ok(Transformed::Unchanged),
        }
    }
}

// ---------------------------------------------------------------------------

/// `Selection(Struct(elements), i)` becomes `elements[i]`.
pub struct InlineSelectionsFromStructs;

impl Pass for InlineSelectionsFromStructs {
    fn name(&self) -> &str {
        "InlineSelectionsFromStructs"
    }

    fn run(&self, expr: &Expr) -> Result<Expr> {
        saturate(expr, |e| transform(e, &mut SelectionRule))
    }
}

struct SelectionRule;

impl Rewrite for SelectionRule {
    fn rewrite(&mut self, expr: &Expr) -> Result<Transformed> {
        if let ExprKind::Selection { source, index } = expr.kind() {
            if let ExprKind::Struct { elements } = source.kind() {
                if let Some((_, e)) = elements.get(*index) {
                    return Ok(Transformed::Replaced(e.clone()));
                }
            }
        }
        Ok(Transformed::Unchanged)
    }
}

// ---------------------------------------------------------------------------

/// Merge nested blocks into their parent and drop empty blocks.
///
/// A block in result position is always merged. A block bound to a local is
/// hoisted only if its names are not referenced by anything after that local.
pub struct FlattenBlocks;

impl Pass for FlattenBlocks {
    fn name(&self) -> &str {
        "FlattenBlocks"
    }

    fn run(&self, expr: &Expr) -> Result<Expr> {
        saturate(expr, |e| transform(e, &mut FlattenRule))
    }
}

struct FlattenRule;

impl Rewrite for FlattenRule {
    fn rewrite(&mut self, expr: &Expr) -> Result<Transformed> {
        let Some((locals, result)) = split_block(expr) else {
            return Ok(Transformed::Unchanged);
        };
        let mut locals = locals.to_vec();
        let mut result = result.clone();
        let mut changed = false;
        while flatten_once(&mut locals, &mut result) {
            changed = true;
        }
        if locals.is_empty() {
            return Ok(Transformed::Replaced(result));
        }
        if !changed {
            return Ok(Transformed::Unchanged);
        }
        Ok(Transformed::Replaced(Expr::block(locals, result)?))
    }
}

fn flatten_once(locals: &mut Vec<(String, Expr)>, result: &mut Expr) -> bool {
    if let Some((inner, r)) = split_block(result) {
        locals.extend(inner.iter().cloned());
        *result = r.clone();
        return true;
    }
    for i in 0..locals.len() {
        let Some((inner, r)) = split_block(&locals[i].1) else {
            continue;
        };
        let mut later_free: BTreeSet<&String> = result.free_references().iter().collect();
        for (_, v) in &locals[i + 1..] {
            later_free.extend(v.free_references().iter());
        }
        if inner.iter().any(|(n, _)| later_free.contains(n)) {
            continue;
        }
        let inner = inner.to_vec();
        let r = r.clone();
        let name = locals[i].0.clone();
        locals.splice(i..=i, inner.into_iter().chain(std::iter::once((name, r))));
        return true;
    }
    false
}

// ---------------------------------------------------------------------------

/// Bind non-trivial intrinsic arguments to fresh block locals, so every
/// intrinsic is called on a reference or a struct of references.
pub struct ExtractIntrinsicArguments;

impl Pass for ExtractIntrinsicArguments {
    fn name(&self) -> &str {
        "ExtractIntrinsicArguments"
    }

    fn run(&self, expr: &Expr) -> Result<Expr> {
        let mut rule = ExtractRule {
            namer: Namer::new("_arg", all_names(expr)),
        };
        transform(expr, &mut rule)
    }
}

struct ExtractRule {
    namer: Namer,
}

impl Rewrite for ExtractRule {
    fn rewrite(&mut self, expr: &Expr) -> Result<Transformed> {
        let ExprKind::Call {
            function,
            argument: Some(arg),
        } = expr.kind()
        else {
            return Ok(Transformed::Unchanged);
        };
        if !matches!(function.kind(), ExprKind::Intrinsic { .. }) || is_simple(arg) {
            return Ok(Transformed::Unchanged);
        }
        let mut locals = Vec::new();
        let new_arg = match arg.kind() {
            // Extract struct members one by one so the intrinsic still sees
            // the struct shape.
            ExprKind::Struct { elements } => {
                let mut out = Vec::with_capacity(elements.len());
                for (field, e) in elements {
                    let e = if is_simple(e) { e.clone() } else { self.bind(e, &mut locals)? };
                    out.push((field.clone(), e));
                }
                Expr::struct_of(out)?
            }
            _ => self.bind(arg, &mut locals)?,
        };
        let call = Expr::call(function.clone(), Some(new_arg))?;
        Ok(Transformed::Replaced(Expr::block(locals, call)?))
    }
}

impl ExtractRule {
    fn bind(&mut self, value: &Expr, locals: &mut Vec<(String, Expr)>) -> Result<Expr> {
        let name = self.namer.fresh();
        let reference = Expr::reference(name.clone(), value.type_signature().clone())?;
        locals.push((name, value.clone()));
        Ok(reference)
    }
}

// ---------------------------------------------------------------------------

/// Common subexpression elimination over block locals.
///
/// A local whose value equals an earlier local's value, in an equivalent
/// scope, becomes a reference to that earlier local.
pub struct MergeDuplicateLocals;

impl Pass for MergeDuplicateLocals {
    fn name(&self) -> &str {
        "MergeDuplicateLocals"
    }

    fn run(&self, expr: &Expr) -> Result<Expr> {
        saturate(expr, |e| transform(e, &mut MergeRule))
    }
}

struct MergeRule;

impl Rewrite for MergeRule {
    fn order(&self) -> Order {
        Order::BottomUp
    }

    fn rewrite(&mut self, expr: &Expr) -> Result<Transformed> {
        let Some((locals, result)) = split_block(expr) else {
            return Ok(Transformed::Unchanged);
        };
        let mut merged = locals.to_vec();
        let mut changed = false;
        for j in 1..locals.len() {
            let value = &locals[j].1;
            if value.as_reference().is_some() {
                continue;
            }
            let found = (0..j).find(|&i| {
                locals[i].1 == *value && same_scope(&locals[i..j], &locals[i].0, value)
            });
            if let Some(i) = found {
                merged[j].1 = Expr::reference(locals[i].0.clone(), value.type_signature().clone())?;
                changed = true;
            }
        }
        if !changed {
            return Ok(Transformed::Unchanged);
        }
        Ok(Transformed::Replaced(Expr::block(merged, result.clone())?))
    }
}

/// `between` runs from the candidate local up to (excluding) the duplicate.
/// Neither the duplicate's free names nor the candidate's own name may be
/// rebound in that range.
fn same_scope(between: &[(String, Expr)], candidate: &str, value: &Expr) -> bool {
    let free = value.free_references();
    between.iter().all(|(n, _)| !free.contains(n))
        && between[1..].iter().all(|(n, _)| n != candidate)
}

// ---------------------------------------------------------------------------

/// Drop block locals nothing refers to. Empty blocks collapse to their result.
pub struct RemoveUnusedLocals;

impl Pass for RemoveUnusedLocals {
    fn name(&self) -> &str {
        "RemoveUnusedLocals"
    }

    fn run(&self, expr: &Expr) -> Result<Expr> {
        saturate(expr, |e| transform(e, &mut UnusedRule))
    }
}

struct UnusedRule;

impl Rewrite for UnusedRule {
    fn rewrite(&mut self, expr: &Expr) -> Result<Transformed> {
        let Some((locals, result)) = split_block(expr) else {
            return Ok(Transformed::Unchanged);
        };
        let mut live: BTreeSet<String> = result.free_references().clone();
        let mut kept = Vec::with_capacity(locals.len());
        for (name, value) in locals.iter().rev() {
            if live.remove(name) {
                live.extend(value.free_references().iter().cloned());
                kept.push((name.clone(), value.clone()));
            }
        }
        if kept.len() == locals.len() {
            return Ok(Transformed::Unchanged);
        }
        kept.reverse();
        Ok(Transformed::Replaced(rebuild_block(kept, result.clone())?))
    }
}

/// The standard pass order.
pub fn default_passes() -> Vec<Box<dyn Pass>> {
    vec![
        Box::new(UniquifyNames),
        Box::new(InlineLambdaCalls),
        Box::new(InlineBlockLocals),
        Box::new(InlineSelectionsFromStructs),
        Box::new(FlattenBlocks),
        Box::new(MergeDuplicateLocals),
        Box::new(RemoveUnusedLocals),
        Box::new(ExtractIntrinsicArguments),
    ]
}

/// Look up a pass by its name.
pub fn pass_by_name(name: &str) -> Option<Box<dyn Pass>> {
    default_passes().into_iter().find(|p| p.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::check_well_formed;
    use crate::manager::PassManager;
    use fedra_core::{intrinsics, Placement, Type, Value};
    use proptest::prelude::*;

    fn int(v: i32) -> Expr {
        Expr::literal(Value::int32(v)).unwrap()
    }

    fn r(name: &str) -> Expr {
        Expr::reference(name, Type::int32()).unwrap()
    }

    fn clients_ref(name: &str) -> Expr {
        Expr::reference(name, Type::at_clients(Type::int32())).unwrap()
    }

    #[test]
    fn uniquify_renames_shadowed_binders() {
        // let x = 1, x = x in (x -> x)(x)
        let lam = Expr::lambda(Some(("x", Type::int32())), r("x")).unwrap();
        let e = Expr::block(
            vec![("x", int(1)), ("x", r("x"))],
            Expr::call(lam, Some(r("x"))).unwrap(),
        )
        .unwrap();
        let out = UniquifyNames.run(&e).unwrap();
        assert_eq!(
            out.to_string(),
            "(let _var1=data<int32>,_var2=_var1 in (_var3 -> _var3)(_var2))"
        );
    }

    #[test]
    fn uniquify_avoids_free_names() {
        let e = Expr::block(vec![("a", r("_var1"))], r("a")).unwrap();
        let out = UniquifyNames.run(&e).unwrap();
        assert_eq!(out.to_string(), "(let _var2=_var1 in _var2)");
    }

    #[test]
    fn inline_block_locals_substitutes_data() {
        let e = Expr::block(vec![("y", int(3))], Expr::tuple(vec![r("y"), r("y")]).unwrap())
            .unwrap();
        let out = InlineBlockLocals.run(&e).unwrap();
        assert_eq!(out, Expr::tuple(vec![int(3), int(3)]).unwrap());
    }

    #[test]
    fn inline_block_locals_keeps_computations() {
        let f = Expr::reference("f", Type::function(None, Type::int32())).unwrap();
        let call = Expr::call(f, None).unwrap();
        let e = Expr::block(vec![("y", call)], Expr::tuple(vec![r("y"), r("y")]).unwrap())
            .unwrap();
        let out = InlineBlockLocals.run(&e).unwrap();
        assert!(out.ptr_eq(&e));
    }

    #[test]
    fn inline_block_locals_avoids_capture() {
        // let a = x, x = 1 in <a, x>: inlining `a` would capture `x`
        let e = Expr::block(
            vec![("a", r("x")), ("x", int(1))],
            Expr::tuple(vec![r("a"), r("x")]).unwrap(),
        )
        .unwrap();
        let out = InlineBlockLocals.run(&e).unwrap();
        // `x = 1` goes first, after which `a` can safely become the outer x
        assert_eq!(out.to_string(), "<x,data<int32>>");
    }

    #[test]
    fn lambda_call_becomes_block() {
        let lam = Expr::lambda(Some(("p", Type::int32())), r("p")).unwrap();
        let e = Expr::call(lam, Some(int(4))).unwrap();
        let out = InlineLambdaCalls.run(&e).unwrap();
        assert_eq!(out.to_string(), "(let p=data<int32> in p)");

        let thunk = Expr::lambda(None, int(9)).unwrap();
        let out = InlineLambdaCalls
            .run(&Expr::call(thunk, None).unwrap())
            .unwrap();
        assert_eq!(out, int(9));
    }

    #[test]
    fn selection_from_struct() {
        let s = Expr::tuple(vec![r("a"), Expr::tuple(vec![r("b"), r("c")]).unwrap()]).unwrap();
        let e = Expr::selection(Expr::selection(s, 1usize).unwrap(), 0usize).unwrap();
        let out = InlineSelectionsFromStructs.run(&e).unwrap();
        assert_eq!(out, r("b"));
    }

    #[test]
    fn flatten_nested_blocks() {
        let inner = Expr::block(vec![("b", int(2))], r("b")).unwrap();
        let e = Expr::block(
            vec![("a", inner)],
            Expr::block(vec![("c", r("a"))], r("c")).unwrap(),
        )
        .unwrap();
        let out = FlattenBlocks.run(&e).unwrap();
        assert_eq!(out.to_string(), "(let b=data<int32>,a=b,c=a in c)");
    }

    #[test]
    fn flatten_refuses_to_shadow() {
        // let a = (let x = 2 in x) in <a, x>: hoisting `x` would capture the free x
        let inner = Expr::block(vec![("x", int(2))], r("x")).unwrap();
        let e = Expr::block(
            vec![("a", inner)],
            Expr::tuple(vec![r("a"), r("x")]).unwrap(),
        )
        .unwrap();
        let out = FlattenBlocks.run(&e).unwrap();
        assert!(out.ptr_eq(&e));
    }

    #[test]
    fn extract_intrinsic_argument() {
        let zipped =
            intrinsics::federated_zip_at_clients(vec![clients_ref("x"), clients_ref("y")]).unwrap();
        let first = Expr::lambda(
            Some(("p", Type::struct_of(vec![Type::int32(), Type::int32()]))),
            Expr::selection(
                Expr::reference("p", Type::struct_of(vec![Type::int32(), Type::int32()])).unwrap(),
                0usize,
            )
            .unwrap(),
        )
        .unwrap();
        let mapped = intrinsics::federated_map(first, zipped).unwrap();
        let out = ExtractIntrinsicArguments.run(&mapped).unwrap();
        assert_eq!(
            out.to_string(),
            "(let _arg1=federated_zip_at_clients(<x,y>) in federated_map(<(p -> p[0]),_arg1>))"
        );
        assert_eq!(out.type_signature(), mapped.type_signature());
        assert_eq!(ExtractIntrinsicArguments.run(&out).unwrap(), out);

        let pipeline = PassManager::default_pipeline();
        let once = pipeline.run(&mapped).unwrap();
        assert_eq!(pipeline.run(&once).unwrap(), once);
        assert_eq!(
            once.to_string(),
            "(let _var1=federated_zip_at_clients(<x,y>) in federated_map(<(_var2 -> _var2[0]),_var1>))"
        );
        assert!(check_well_formed(&once).is_ok());
    }

    #[test]
    fn merge_duplicate_locals() {
        let f = Expr::reference("f", Type::function(Some(Type::int32()), Type::int32())).unwrap();
        let call = Expr::call(f, Some(r("z"))).unwrap();
        let e = Expr::block(
            vec![("a", call.clone()), ("b", call)],
            Expr::tuple(vec![r("a"), r("b")]).unwrap(),
        )
        .unwrap();
        let out = MergeDuplicateLocals.run(&e).unwrap();
        assert_eq!(out.to_string(), "(let a=f(z),b=a in <a,b>)");
    }

    #[test]
    fn merge_respects_rebinding() {
        let f = Expr::reference("f", Type::function(Some(Type::int32()), Type::int32())).unwrap();
        let call = Expr::call(f, Some(r("z"))).unwrap();
        // let a = f(z), z = 1, b = f(z) in b: the two calls see different z
        let e = Expr::block(vec![("a", call.clone()), ("z", int(1)), ("b", call)], r("b")).unwrap();
        let out = MergeDuplicateLocals.run(&e).unwrap();
        assert!(out.ptr_eq(&e));
    }

    #[test]
    fn remove_unused_locals() {
        let e = Expr::block(
            vec![("a", int(1)), ("b", r("a")), ("c", int(3))],
            r("b"),
        )
        .unwrap();
        let out = RemoveUnusedLocals.run(&e).unwrap();
        assert_eq!(out.to_string(), "(let a=data<int32>,b=a in b)");

        let dead = Expr::block(vec![("a", int(1))], int(2)).unwrap();
        assert_eq!(RemoveUnusedLocals.run(&dead).unwrap(), int(2));
    }

    #[test]
    fn pass_lookup_by_name() {
        assert!(pass_by_name("FlattenBlocks").is_some());
        assert!(pass_by_name("Nope").is_none());
        assert_eq!(default_passes().len(), 8);
    }

    // -- generated programs -------------------------------------------------

    /// Shape of a random program. Names come from a tiny pool so shadowing
    /// is common. The same recipe can be built at any [`Sort`].
    #[derive(Clone, Debug)]
    enum Recipe {
        Lit(i32),
        Var(u8),
        /// The first byte of each local picks both its name and its sort.
        Let(Vec<(u8, Recipe)>, Box<Recipe>),
        Pick(Box<Recipe>, Box<Recipe>, bool),
        Apply(u8, Box<Recipe>, Box<Recipe>),
        Opaque(Box<Recipe>),
        Sum(Box<Recipe>),
        Map(Box<Recipe>, Box<Recipe>),
        Broadcast(Box<Recipe>),
    }

    /// What a built expression evaluates to.
    #[derive(Clone, Copy, Debug, PartialEq)]
    enum Sort {
        Int,
        /// `{int32}@CLIENTS`, possibly all-equal
        Clients,
        /// `int32@SERVER`
        Server,
        /// `(int32 -> int32)`
        Fn,
    }

    const NAMES: [&str; 3] = ["a", "b", "c"];
    const SORTS: [Sort; 4] = [Sort::Int, Sort::Clients, Sort::Server, Sort::Fn];

    fn sort_of(ty: &Type) -> Sort {
        match ty.as_federated() {
            Some((_, Placement::Clients, _)) => Sort::Clients,
            Some((_, Placement::Server, _)) => Sort::Server,
            None if ty.is_function() => Sort::Fn,
            None => Sort::Int,
        }
    }

    fn int_fn() -> Type {
        Type::function(Some(Type::int32()), Type::int32())
    }

    fn arb_recipe() -> impl Strategy<Value = Recipe> {
        let leaf = prop_oneof![(-5i32..5).prop_map(Recipe::Lit), any::<u8>().prop_map(Recipe::Var)];
        leaf.prop_recursive(4, 32, 3, |inner| {
            prop_oneof![
                (prop::collection::vec((any::<u8>(), inner.clone()), 1..3), inner.clone())
                    .prop_map(|(l, r)| Recipe::Let(l, Box::new(r))),
                (inner.clone(), inner.clone(), any::<bool>())
                    .prop_map(|(a, b, s)| Recipe::Pick(Box::new(a), Box::new(b), s)),
                (any::<u8>(), inner.clone(), inner.clone())
                    .prop_map(|(n, b, a)| Recipe::Apply(n, Box::new(b), Box::new(a))),
                inner.clone().prop_map(|x| Recipe::Opaque(Box::new(x))),
                inner.clone().prop_map(|x| Recipe::Sum(Box::new(x))),
                (inner.clone(), inner.clone())
                    .prop_map(|(f, x)| Recipe::Map(Box::new(f), Box::new(x))),
                inner.prop_map(|x| Recipe::Broadcast(Box::new(x))),
            ]
        })
    }

    /// The `k`th visible binding of `sort`, if any. Shadowed bindings are
    /// skipped so the reference has the type its name is bound to.
    fn visible(scope: &[(String, Type)], sort: Sort, k: u8) -> Option<Expr> {
        let mut seen = BTreeSet::new();
        let candidates: Vec<&(String, Type)> = scope
            .iter()
            .rev()
            .filter(|(n, _)| seen.insert(n.clone()))
            .filter(|(_, t)| sort_of(t) == sort)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let (name, ty) = candidates[k as usize % candidates.len()];
        Some(Expr::reference(name.clone(), ty.clone()).unwrap())
    }

    /// The free input of each placed sort.
    fn input(sort: Sort) -> Expr {
        match sort {
            Sort::Clients => clients_ref("clients"),
            Sort::Server => Expr::reference("server", Type::at_server(Type::int32())).unwrap(),
            Sort::Int | Sort::Fn => unreachable!("no free input of sort {sort:?}"),
        }
    }

    fn ext(arg: Expr) -> Expr {
        // An external function call: never inlined, a CSE candidate.
        let f = Expr::reference("ext", int_fn()).unwrap();
        Expr::call(f, Some(arg)).unwrap()
    }

    fn lambda(name: &str, body: &Recipe, scope: &mut Vec<(String, Type)>) -> Expr {
        scope.push((name.to_string(), Type::int32()));
        let body = build(body, Sort::Int, scope);
        scope.pop();
        Expr::lambda(Some((name, Type::int32())), body).unwrap()
    }

    fn build(recipe: &Recipe, sort: Sort, scope: &mut Vec<(String, Type)>) -> Expr {
        match (recipe, sort) {
            (Recipe::Var(k), _) => match visible(scope, sort, *k) {
                Some(e) => e,
                None => build(&Recipe::Lit(*k as i32), sort, scope),
            },
            (Recipe::Lit(v), Sort::Int) => int(*v),
            (Recipe::Lit(_), Sort::Clients | Sort::Server) => input(sort),
            (Recipe::Lit(v), Sort::Fn) => lambda("a", &Recipe::Lit(*v), scope),
            (Recipe::Let(locals, result), _) => {
                let depth = scope.len();
                let mut out = Vec::new();
                for (k, value) in locals {
                    let local_sort = SORTS[*k as usize / NAMES.len() % SORTS.len()];
                    let v = build(value, local_sort, scope);
                    let name = NAMES[*k as usize % NAMES.len()].to_string();
                    scope.push((name.clone(), v.type_signature().clone()));
                    out.push((name, v));
                }
                let res = build(result, sort, scope);
                scope.truncate(depth);
                Expr::block(out, res).unwrap()
            }
            (Recipe::Pick(a, b, second), _) => {
                let s = Expr::tuple(vec![build(a, sort, scope), build(b, sort, scope)]).unwrap();
                Expr::selection(s, usize::from(*second)).unwrap()
            }
            (Recipe::Apply(k, body, _), Sort::Fn) => {
                lambda(NAMES[*k as usize % NAMES.len()], body, scope)
            }
            (Recipe::Apply(k, body, arg), _) => {
                let name = NAMES[*k as usize % NAMES.len()];
                let arg = build(arg, Sort::Int, scope);
                scope.push((name.to_string(), Type::int32()));
                let body = build(body, sort, scope);
                scope.pop();
                let lam = Expr::lambda(Some((name, Type::int32())), body).unwrap();
                Expr::call(lam, Some(arg)).unwrap()
            }
            (Recipe::Opaque(x), Sort::Int) => ext(build(x, Sort::Int, scope)),
            (Recipe::Opaque(x), Sort::Clients) => {
                let f = Expr::reference("ext", int_fn()).unwrap();
                intrinsics::federated_map(f, build(x, Sort::Clients, scope)).unwrap()
            }
            (Recipe::Opaque(x), Sort::Server) => {
                intrinsics::federated_value_at_server(build(x, Sort::Int, scope)).unwrap()
            }
            (Recipe::Opaque(x), Sort::Fn) => lambda("b", x, scope),
            (Recipe::Sum(x), Sort::Server) => {
                intrinsics::federated_sum(build(x, Sort::Clients, scope)).unwrap()
            }
            (Recipe::Sum(x), Sort::Clients) => {
                let sum = intrinsics::federated_sum(build(x, Sort::Clients, scope)).unwrap();
                intrinsics::federated_broadcast(sum).unwrap()
            }
            (Recipe::Sum(x), _) => build(x, sort, scope),
            (Recipe::Map(f, x), Sort::Clients) => {
                let f = build(f, Sort::Fn, scope);
                intrinsics::federated_map(f, build(x, Sort::Clients, scope)).unwrap()
            }
            (Recipe::Map(f, x), Sort::Server) => {
                let f = build(f, Sort::Fn, scope);
                let mapped = intrinsics::federated_map(f, build(x, Sort::Clients, scope)).unwrap();
                intrinsics::federated_sum(mapped).unwrap()
            }
            (Recipe::Map(f, x), Sort::Int) => {
                let f = build(f, Sort::Fn, scope);
                Expr::call(f, Some(build(x, Sort::Int, scope))).unwrap()
            }
            (Recipe::Map(f, _), Sort::Fn) => build(f, Sort::Fn, scope),
            (Recipe::Broadcast(x), Sort::Clients) => {
                intrinsics::federated_broadcast(build(x, Sort::Server, scope)).unwrap()
            }
            (Recipe::Broadcast(x), _) => build(x, sort, scope),
        }
    }

    /// `ext -> clients -> server -> body`, so every input is bound.
    fn program(recipe: &Recipe, sort: Sort) -> Expr {
        let body = build(recipe, sort, &mut Vec::new());
        let server = Expr::lambda(Some(("server", Type::at_server(Type::int32()))), body).unwrap();
        let clients =
            Expr::lambda(Some(("clients", Type::at_clients(Type::int32()))), server).unwrap();
        Expr::lambda(Some(("ext", int_fn())), clients).unwrap()
    }

    fn arb_sort() -> impl Strategy<Value = Sort> {
        prop::sample::select(SORTS.to_vec())
    }

    proptest! {
        #[test]
        fn prop_passes_idempotent_and_type_preserving(
            recipe in arb_recipe(),
            sort in arb_sort(),
        ) {
            let e = program(&recipe, sort);
            prop_assert!(check_well_formed(&e).is_ok());
            for pass in default_passes() {
                let once = pass.run(&e).unwrap();
                let twice = pass.run(&once).unwrap();
                prop_assert_eq!(&twice, &once, "{} not idempotent", pass.name());
                prop_assert_eq!(once.type_signature(), e.type_signature());
                prop_assert!(check_well_formed(&once).is_ok(), "{} broke scoping", pass.name());
            }
        }

        #[test]
        fn prop_pipeline_reaches_a_fixed_point(recipe in arb_recipe(), sort in arb_sort()) {
            let e = program(&recipe, sort);
            let pipeline = PassManager::default_pipeline();
            let once = pipeline.run(&e).unwrap();
            prop_assert_eq!(once.type_signature(), e.type_signature());
            prop_assert!(check_well_formed(&once).is_ok());
            prop_assert_eq!(pipeline.run(&once).unwrap(), once);
        }
    }
}
