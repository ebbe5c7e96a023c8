//! Invoking computations on an executor stack.

use fedra_core::{CardinalityMap, Expr, Value};
use tracing::debug;

use crate::error::{ExecutorError, Result};
use crate::executor::{Payload, SharedExecutor};
use crate::factory::ExecutorFactory;

/// Runs whole computations against one executor stack.
pub struct ExecutionContext {
    executor: SharedExecutor,
}

impl ExecutionContext {
    pub fn new(executor: SharedExecutor) -> Self {
        Self { executor }
    }

    pub async fn from_factory(
        factory: &ExecutorFactory,
        cardinalities: &CardinalityMap,
    ) -> Result<Self> {
        Ok(Self::new(factory.build(cardinalities).await?))
    }

    pub fn executor(&self) -> &SharedExecutor {
        &self.executor
    }

    /// Evaluate `computation`, calling it on `argument` if it is a function.
    ///
    /// Every handle created along the way is released before returning.
    pub async fn invoke(&self, computation: &Expr, argument: Option<Value>) -> Result<Value> {
        let ty = computation.type_signature().clone();
        debug!(computation = computation.tag(), %ty, "invoke");
        let comp = self
            .executor
            .create_value(Payload::Computation(computation.clone()), ty.clone())
            .await?;
        let Some((parameter, _)) = ty.as_function() else {
            if argument.is_some() {
                return Err(ExecutorError::mismatch(format!(
                    "{ty} is not a function but an argument was given"
                )));
            }
            let out = self.executor.compute(&comp).await;
            self.executor.dispose(comp);
            return out;
        };
        let arg = match (parameter, argument) {
            (Some(p), Some(v)) => Some(
                self.executor
                    .create_value(Payload::Value(v), p.clone())
                    .await?,
            ),
            (None, None) => None,
            (Some(p), None) => {
                return Err(ExecutorError::mismatch(format!("missing argument of type {p}")))
            }
            (None, Some(_)) => {
                return Err(ExecutorError::mismatch(format!("{ty} takes no argument")))
            }
        };
        let call = self.executor.create_call(&comp, arg.as_ref()).await?;
        let out = self.executor.compute(&call).await;
        self.executor.dispose(call);
        if let Some(a) = arg {
            self.executor.dispose(a);
        }
        self.executor.dispose(comp);
        out
    }

    pub async fn close(&self) {
        self.executor.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use fedra_core::{intrinsics, Type};

    async fn context(clients: usize) -> ExecutionContext {
        let factory = ExecutorFactory::from_config(RuntimeConfig::default());
        ExecutionContext::from_factory(&factory, &CardinalityMap::server_and_clients(clients))
            .await
            .unwrap()
    }

    fn sum_lambda() -> Expr {
        let ty = Type::at_clients(Type::int32());
        Expr::lambda(
            Some(("x", ty.clone())),
            intrinsics::federated_sum(Expr::reference("x", ty).unwrap()).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn invoke_a_function_on_an_argument() {
        let ctx = context(3).await;
        let arg = Value::Federated(vec![Value::int32(2), Value::int32(5), Value::int32(7)]);
        assert_eq!(
            ctx.invoke(&sum_lambda(), Some(arg)).await.unwrap(),
            Value::Federated(vec![Value::int32(14)])
        );
    }

    #[tokio::test]
    async fn invoke_a_plain_computation() {
        let ctx = context(0).await;
        let e = Expr::literal(Value::float32(2.5)).unwrap();
        assert_eq!(ctx.invoke(&e, None).await.unwrap(), Value::float32(2.5));
        assert!(ctx.invoke(&e, Some(Value::int32(1))).await.is_err());
    }

    #[tokio::test]
    async fn missing_argument_is_a_type_error() {
        let ctx = context(2).await;
        let err = ctx.invoke(&sum_lambda(), None).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::TypeMismatch);
    }
}
