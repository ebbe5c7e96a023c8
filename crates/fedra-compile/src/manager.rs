//! Fixed-point pass driver.

use fedra_core::Expr;
use tracing::debug;

use crate::error::{CompileError, Result};
use crate::passes::{default_passes, Pass};

/// Default sweep budget.
pub const DEFAULT_MAX_SWEEPS: usize = 32;

/// Runs an ordered list of passes until a full sweep changes nothing.
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
    max_sweeps: usize,
}

impl PassManager {
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            max_sweeps: DEFAULT_MAX_SWEEPS,
        }
    }

    /// The standard pipeline, see [`default_passes`].
    pub fn default_pipeline() -> Self {
        let mut pm = Self::new();
        for pass in default_passes() {
            pm.passes.push(pass);
        }
        pm
    }

    pub fn with_max_sweeps(mut self, max_sweeps: usize) -> Self {
        self.max_sweeps = max_sweeps.max(1);
        self
    }

    /// Add a pass to the end of the pipeline.
    pub fn add(&mut self, pass: impl Pass + 'static) {
        self.passes.push(Box::new(pass));
    }

    pub fn add_boxed(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    /// Sweep until nothing changes.
    ///
    /// Fails with `TransformationDidNotConverge` once the sweep budget is
    /// spent, and with `TypeMismatch` if a pass changes the root type.
    pub fn run(&self, expr: &Expr) -> Result<Expr> {
        let mut current = expr.clone();
        for sweep in 1..=self.max_sweeps {
            let mut changed = false;
            for pass in &self.passes {
                let next = pass.run(&current)?;
                if next.type_signature() != current.type_signature() {
                    return Err(CompileError::TypeMismatch(format!(
                        "{} changed the type from {} to {}",
                        pass.name(),
                        current.type_signature(),
                        next.type_signature()
                    )));
                }
                if !next.ptr_eq(&current) && next != current {
                    debug!(pass = pass.name(), sweep, "pass rewrote computation");
                    changed = true;
                    current = next;
                }
            }
            if !changed {
                debug!(sweeps = sweep, size = current.size(), "pipeline converged");
                return Ok(current);
            }
        }
        Err(CompileError::TransformationDidNotConverge {
            iterations: self.max_sweeps,
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Number of registered passes.
    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::check_well_formed;
    use fedra_core::{intrinsics, ExprKind, Type, Value};

    /// Swaps the elements of a two-element struct at the root. Type-preserving
    /// for `<int32,int32>` and never reaches a fixed point.
    struct Swap;

    impl Pass for Swap {
        fn name(&self) -> &str {
            "Swap"
        }

        fn run(&self, expr: &Expr) -> Result<Expr> {
            match expr.kind() {
                ExprKind::Struct { elements } if elements.len() == 2 => Ok(Expr::struct_of(vec![
                    elements[1].clone(),
                    elements[0].clone(),
                ])?),
                _ => Ok(expr.clone()),
            }
        }
    }

    /// Replaces every root with an int32 literal.
    struct Retype;

    impl Pass for Retype {
        fn name(&self) -> &str {
            "Retype"
        }

        fn run(&self, _expr: &Expr) -> Result<Expr> {
            Ok(Expr::literal(Value::int32(0))?)
        }
    }

    fn int(v: i32) -> Expr {
        Expr::literal(Value::int32(v)).unwrap()
    }

    #[test]
    fn cyclic_pass_does_not_converge() {
        let mut pm = PassManager::new().with_max_sweeps(5);
        pm.add(Swap);
        let e = Expr::tuple(vec![int(1), int(2)]).unwrap();
        assert_eq!(
            pm.run(&e),
            Err(CompileError::TransformationDidNotConverge { iterations: 5 })
        );
    }

    #[test]
    fn type_change_is_rejected() {
        let mut pm = PassManager::new();
        pm.add(Retype);
        let e = Expr::literal(Value::bool(true)).unwrap();
        assert!(matches!(pm.run(&e), Err(CompileError::TypeMismatch(_))));
    }

    #[test]
    fn block_selection_reduces_to_data() {
        // let y = 3 in <y, y>[1]
        let y = Expr::reference("y", Type::int32()).unwrap();
        let e = Expr::block(
            vec![("y", int(3))],
            Expr::selection(Expr::tuple(vec![y.clone(), y]).unwrap(), 1usize).unwrap(),
        )
        .unwrap();
        let out = PassManager::default_pipeline().run(&e).unwrap();
        assert_eq!(out, int(3));
    }

    #[test]
    fn lambda_call_with_intrinsic_body() {
        // (x -> federated_sum(x))(data@CLIENTS)
        let clients = Type::at_clients(Type::int32());
        let x = Expr::reference("x", clients.clone()).unwrap();
        let f = Expr::lambda(Some(("x", clients.clone())), intrinsics::federated_sum(x).unwrap())
            .unwrap();
        let data = Expr::data(
            Value::Federated(vec![Value::int32(2), Value::int32(5), Value::int32(7)]),
            clients,
        )
        .unwrap();
        let e = Expr::call(f, Some(data.clone())).unwrap();
        let out = PassManager::default_pipeline().run(&e).unwrap();
        assert_eq!(out, intrinsics::federated_sum(data).unwrap());
        assert!(check_well_formed(&out).is_ok());
    }

    #[test]
    fn already_optimal_input_is_returned_as_is() {
        let x = Expr::reference("x", Type::at_clients(Type::int32())).unwrap();
        let e = intrinsics::federated_sum(x).unwrap();
        let out = PassManager::default_pipeline().run(&e).unwrap();
        assert!(out.ptr_eq(&e));
    }

    #[test]
    fn pipeline_names() {
        let pm = PassManager::default_pipeline();
        assert_eq!(pm.len(), 8);
        assert_eq!(pm.names()[0], "UniquifyNames");
    }
}
