//! Whole-tree well-formedness.

use fedra_core::{Expr, ExprKind, Type};

use crate::error::{CompileError, Result};

/// Check that every reference in `expr` is bound and typed like its binding.
pub fn check_well_formed(expr: &Expr) -> Result<()> {
    check_in_scope(expr, &[])
}

/// Like [`check_well_formed`], with `env` bound around the whole tree.
pub fn check_in_scope(expr: &Expr, env: &[(String, Type)]) -> Result<()> {
    let mut scope = env.to_vec();
    walk(expr, &mut scope)
}

fn walk(expr: &Expr, scope: &mut Vec<(String, Type)>) -> Result<()> {
    match expr.kind() {
        ExprKind::Reference { name } => match scope.iter().rev().find(|(n, _)| n == name) {
            None => Err(CompileError::UnboundReference(name.clone())),
            Some((_, bound)) if bound != expr.type_signature() => {
                Err(CompileError::TypeMismatch(format!(
                    "`{name}` is bound as {bound} but referenced as {}",
                    expr.type_signature()
                )))
            }
            Some(_) => Ok(()),
        },
        ExprKind::Lambda { parameter, body } => {
            let depth = scope.len();
            if let Some((name, ty)) = parameter {
                scope.push((name.clone(), ty.clone()));
            }
            let res = walk(body, scope);
            scope.truncate(depth);
            res
        }
        ExprKind::Block { locals, result } => {
            let depth = scope.len();
            let res = (|| {
                for (name, value) in locals {
                    walk(value, scope)?;
                    scope.push((name.clone(), value.type_signature().clone()));
                }
                walk(result, scope)
            })();
            scope.truncate(depth);
            res
        }
        _ => expr.children().iter().try_for_each(|c| walk(c, scope)),
    }
}
