//! Leaf executor: concrete values and compiled kernels, held in process.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use fedra_core::{ExprKind, Kernel, Selector, Tensor, Type, Value};

use crate::error::{ExecutorError, Result};
use crate::executor::{
    call_result_type, select_type, struct_type, Executor, ExecutorId, ExecutorValue, Payload,
    ValueRef,
};

/// Runs a compiled kernel on a concrete argument.
pub trait PayloadEvaluator: Send + Sync {
    fn evaluate(&self, kernel: &Kernel, argument: Option<&Value>, result_type: &Type)
        -> Result<Value>;
}

/// Evaluates kernels over `f64`, flattening tensor leaves depth first.
#[derive(Clone, Copy, Debug, Default)]
pub struct KernelEvaluator;

impl PayloadEvaluator for KernelEvaluator {
    fn evaluate(
        &self,
        kernel: &Kernel,
        argument: Option<&Value>,
        result_type: &Type,
    ) -> Result<Value> {
        let mut inputs = Vec::with_capacity(kernel.num_inputs());
        if let Some(arg) = argument {
            for leaf in arg.tensor_leaves() {
                let values = leaf.to_f64s().ok_or_else(|| {
                    ExecutorError::Evaluation("string tensors cannot feed a kernel".into())
                })?;
                inputs.extend(values);
            }
        }
        if inputs.len() != kernel.num_inputs() {
            return Err(ExecutorError::Evaluation(format!(
                "kernel takes {} inputs, argument has {}",
                kernel.num_inputs(),
                inputs.len()
            )));
        }
        let outputs = kernel
            .eval(&inputs)
            .map_err(|e| ExecutorError::Evaluation(e.to_string()))?;
        if let Some(bad) = outputs.iter().find(|x| !x.is_finite()) {
            return Err(ExecutorError::Evaluation(format!("kernel produced {bad}")));
        }
        let mut rest = outputs.as_slice();
        let value = assemble(result_type, &mut rest)?;
        if !rest.is_empty() {
            return Err(ExecutorError::Evaluation(format!(
                "{} kernel outputs left over for {result_type}",
                rest.len()
            )));
        }
        Ok(value)
    }
}

fn assemble(ty: &Type, rest: &mut &[f64]) -> Result<Value> {
    match ty {
        Type::Tensor { dtype, shape } => {
            let shape = shape
                .iter()
                .copied()
                .collect::<Option<Vec<u64>>>()
                .ok_or_else(|| ExecutorError::Evaluation(format!("{ty} has unknown dimensions")))?;
            let n = shape.iter().product::<u64>() as usize;
            if rest.len() < n {
                return Err(ExecutorError::Evaluation(format!(
                    "kernel produced too few outputs for {ty}"
                )));
            }
            let (head, tail) = rest.split_at(n);
            *rest = tail;
            Ok(Value::Tensor(Tensor::from_f64s(*dtype, shape, head)?))
        }
        Type::Struct(elements) => {
            let mut out = Vec::with_capacity(elements.len());
            for (name, t) in elements {
                out.push((name.clone(), assemble(t, rest)?));
            }
            Ok(Value::Struct(out))
        }
        _ => Err(ExecutorError::Evaluation(format!("kernels cannot produce {ty}"))),
    }
}

enum Held {
    Value(Value),
    Kernel(Arc<Kernel>),
}

struct EagerValue {
    ty: Type,
    held: Held,
}

impl ExecutorValue for EagerValue {
    fn type_signature(&self) -> &Type {
        &self.ty
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The leaf of every executor stack.
pub struct EagerExecutor {
    id: ExecutorId,
    evaluator: Arc<dyn PayloadEvaluator>,
}

impl EagerExecutor {
    pub fn new() -> Self {
        Self::with_evaluator(Arc::new(KernelEvaluator))
    }

    pub fn with_evaluator(evaluator: Arc<dyn PayloadEvaluator>) -> Self {
        Self {
            id: ExecutorId::next(),
            evaluator,
        }
    }

    fn wrap(&self, ty: Type, held: Held) -> ValueRef {
        ValueRef::new(self.id, EagerValue { ty, held })
    }

    fn concrete<'a>(&self, h: &'a ValueRef) -> Result<&'a Value> {
        match &h.downcast::<EagerValue>(self.id)?.held {
            Held::Value(v) => Ok(v),
            Held::Kernel(_) => Err(ExecutorError::mismatch(format!(
                "expected a value, got a function of type {}",
                h.type_signature()
            ))),
        }
    }
}

impl Default for EagerExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for EagerExecutor {
    async fn create_value(&self, payload: Payload, ty: Type) -> Result<ValueRef> {
        let value = match payload {
            Payload::Value(v) => v,
            Payload::Computation(expr) => {
                if *expr.type_signature() != ty {
                    return Err(ExecutorError::mismatch(format!(
                        "computation of type {} embedded as {ty}",
                        expr.type_signature()
                    )));
                }
                match expr.kind() {
                    ExprKind::Data { value } => value.clone(),
                    ExprKind::Compiled { kernel } => {
                        return Ok(self.wrap(ty, Held::Kernel(kernel.clone())))
                    }
                    _ => {
                        return Err(ExecutorError::mismatch(format!(
                            "the leaf executor cannot embed a {} computation",
                            expr.tag()
                        )))
                    }
                }
            }
        };
        if !value.conforms_to(&ty) {
            return Err(ExecutorError::mismatch(format!("value does not conform to {ty}")));
        }
        Ok(self.wrap(ty, Held::Value(value)))
    }

    async fn create_call(
        &self,
        function: &ValueRef,
        argument: Option<&ValueRef>,
    ) -> Result<ValueRef> {
        let result_ty = call_result_type(
            function.type_signature(),
            argument.map(ValueRef::type_signature),
        )?;
        let kernel = match &function.downcast::<EagerValue>(self.id)?.held {
            Held::Kernel(k) => k.clone(),
            Held::Value(_) => {
                return Err(ExecutorError::mismatch("the leaf executor only calls kernels"))
            }
        };
        let arg = argument.map(|a| self.concrete(a)).transpose()?;
        let value = self.evaluator.evaluate(&kernel, arg, &result_ty)?;
        Ok(self.wrap(result_ty, Held::Value(value)))
    }

    async fn create_struct(&self, elements: Vec<(Option<String>, ValueRef)>) -> Result<ValueRef> {
        let ty = struct_type(&elements)?;
        let mut values = Vec::with_capacity(elements.len());
        for (name, h) in &elements {
            values.push((name.clone(), self.concrete(h)?.clone()));
        }
        Ok(self.wrap(ty, Held::Value(Value::Struct(values))))
    }

    async fn create_selection(&self, source: &ValueRef, selector: Selector) -> Result<ValueRef> {
        let (index, ty) = select_type(source.type_signature(), &selector)?;
        let element = match self.concrete(source)? {
            Value::Struct(elements) => elements.get(index).map(|(_, v)| v.clone()),
            _ => None,
        }
        .ok_or_else(|| ExecutorError::mismatch("selection from a non-struct value"))?;
        Ok(self.wrap(ty, Held::Value(element)))
    }

    async fn compute(&self, value: &ValueRef) -> Result<Value> {
        self.concrete(value).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedra_core::{Expr, KernelBuilder};

    fn pair_f32() -> Type {
        Type::struct_of(vec![Type::float32(), Type::float32()])
    }

    fn hypot_kernel() -> Expr {
        let mut b = KernelBuilder::new();
        let x = b.input(0);
        let y = b.input(1);
        let xx = b.mul(x, x);
        let yy = b.mul(y, y);
        let s = b.add(xx, yy);
        let r = b.sqrt(s);
        Expr::compiled(b.finish(vec![r]), Type::function(Some(pair_f32()), Type::float32())).unwrap()
    }

    #[tokio::test]
    async fn evaluates_compiled_kernel() {
        let ex = EagerExecutor::new();
        let f = hypot_kernel();
        let fh = ex
            .create_value(Payload::Computation(f.clone()), f.type_signature().clone())
            .await
            .unwrap();
        let arg = ex
            .create_value(
                Payload::Value(Value::struct_of(vec![Value::float32(3.0), Value::float32(4.0)])),
                pair_f32(),
            )
            .await
            .unwrap();
        let out = ex.create_call(&fh, Some(&arg)).await.unwrap();
        assert_eq!(ex.compute(&out).await.unwrap(), Value::float32(5.0));
    }

    #[tokio::test]
    async fn non_finite_output_is_an_evaluation_error() {
        let mut b = KernelBuilder::new();
        let x = b.input(0);
        let r = b.sqrt(x);
        let f = Expr::compiled(
            b.finish(vec![r]),
            Type::function(Some(Type::float32()), Type::float32()),
        )
        .unwrap();
        let ex = EagerExecutor::new();
        let fh = ex
            .create_value(Payload::Computation(f.clone()), f.type_signature().clone())
            .await
            .unwrap();
        let arg = ex
            .create_value(Payload::Value(Value::float32(-1.0)), Type::float32())
            .await
            .unwrap();
        assert!(matches!(
            ex.create_call(&fh, Some(&arg)).await,
            Err(ExecutorError::Evaluation(_))
        ));
    }

    #[tokio::test]
    async fn structs_and_selections() {
        let ex = EagerExecutor::new();
        let a = ex.create_value(Payload::Value(Value::int32(1)), Type::int32()).await.unwrap();
        let b = ex.create_value(Payload::Value(Value::bool(true)), Type::bool()).await.unwrap();
        let s = ex
            .create_struct(vec![(Some("a".into()), a), (Some("b".into()), b)])
            .await
            .unwrap();
        let picked = ex.create_selection(&s, Selector::Name("b".into())).await.unwrap();
        assert_eq!(picked.type_signature(), &Type::bool());
        assert_eq!(ex.compute(&picked).await.unwrap(), Value::bool(true));
    }

    #[tokio::test]
    async fn rejects_nonconforming_values_and_foreign_handles() {
        let ex = EagerExecutor::new();
        assert!(ex.create_value(Payload::Value(Value::int32(1)), Type::bool()).await.is_err());

        let other = EagerExecutor::new();
        let h = other.create_value(Payload::Value(Value::int32(1)), Type::int32()).await.unwrap();
        assert!(ex.compute(&h).await.is_err());
    }
}
