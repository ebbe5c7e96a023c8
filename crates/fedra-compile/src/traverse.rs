//! Generic tree rewriting.

use std::collections::BTreeSet;

use fedra_core::{Expr, ExprKind};

use crate::error::Result;

/// Visit order of a rewrite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    /// Rewrite a node, then descend into the (possibly replaced) node's children.
    TopDown,
    /// Rewrite children first, then the rebuilt node.
    BottomUp,
}

/// Outcome of visiting one node.
#[derive(Clone, Debug)]
pub enum Transformed {
    Unchanged,
    Replaced(Expr),
}

/// A node-local rewrite rule.
pub trait Rewrite {
    fn order(&self) -> Order {
        Order::BottomUp
    }

    fn rewrite(&mut self, expr: &Expr) -> Result<Transformed>;
}

/// Apply `rw` to every node of `expr`.
///
/// Subtrees the rule leaves alone come back pointer-equal to the input, so an
/// untouched tree costs no allocation.
pub fn transform<R: Rewrite + ?Sized>(expr: &Expr, rw: &mut R) -> Result<Expr> {
    match rw.order() {
        Order::BottomUp => {
            let rebuilt = rebuild_children(expr, rw)?;
            match rw.rewrite(&rebuilt)? {
                Transformed::Unchanged => Ok(rebuilt),
                Transformed::Replaced(e) => Ok(e),
            }
        }
        Order::TopDown => {
            let node = match rw.rewrite(expr)? {
                Transformed::Unchanged => expr.clone(),
                Transformed::Replaced(e) => e,
            };
            rebuild_children(&node, rw)
        }
    }
}

fn rebuild_children<R: Rewrite + ?Sized>(expr: &Expr, rw: &mut R) -> Result<Expr> {
    let children = expr.children();
    if children.is_empty() {
        return Ok(expr.clone());
    }
    let mut out = Vec::with_capacity(children.len());
    for c in &children {
        out.push(transform(c, rw)?);
    }
    Ok(expr.with_children(out)?)
}

/// Every name bound by a lambda parameter or block local inside `expr`.
pub fn binders(expr: &Expr) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_binders(expr, &mut out);
    out
}

fn collect_binders(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr.kind() {
        ExprKind::Lambda {
            parameter: Some((name, _)),
            ..
        } => {
            out.insert(name.clone());
        }
        ExprKind::Block { locals, .. } => {
            out.extend(locals.iter().map(|(n, _)| n.clone()));
        }
        _ => {}
    }
    for c in expr.children() {
        collect_binders(&c, out);
    }
}

/// Every name bound or referenced anywhere in `expr`.
pub fn all_names(expr: &Expr) -> BTreeSet<String> {
    let mut out = binders(expr);
    collect_references(expr, &mut out);
    out
}

fn collect_references(expr: &Expr, out: &mut BTreeSet<String>) {
    if let Some(name) = expr.as_reference() {
        out.insert(name.to_string());
    }
    for c in expr.children() {
        collect_references(&c, out);
    }
}

/// Replace free occurrences of `name` in `expr` with `replacement`.
///
/// The caller guarantees no binder inside `expr` captures a free name of
/// `replacement`.
pub(crate) fn substitute(expr: &Expr, name: &str, replacement: &Expr) -> Result<Expr> {
    if !expr.free_references().contains(name) {
        return Ok(expr.clone());
    }
    match expr.kind() {
        ExprKind::Reference { .. } => Ok(replacement.clone()),
        ExprKind::Block { locals, result } => {
            let mut shadowed = false;
            let mut new_locals = Vec::with_capacity(locals.len());
            for (n, v) in locals {
                let v = if shadowed {
                    v.clone()
                } else {
                    substitute(v, name, replacement)?
                };
                shadowed |= n == name;
                new_locals.push((n.clone(), v));
            }
            let result = if shadowed {
                result.clone()
            } else {
                substitute(result, name, replacement)?
            };
            Ok(Expr::block(new_locals, result)?)
        }
        _ => {
            let children = expr
                .children()
                .iter()
                .map(|c| substitute(c, name, replacement))
                .collect::<Result<Vec<_>>>()?;
            Ok(expr.with_children(children)?)
        }
    }
}
