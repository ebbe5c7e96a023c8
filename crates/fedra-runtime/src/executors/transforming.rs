//! Rewrites computations through a pass pipeline before they reach the child.

use async_trait::async_trait;
use fedra_compile::PassManager;
use fedra_core::{Selector, Type, Value};
use tracing::debug;

use crate::error::{ExecutorError, Result};
use crate::executor::{Executor, Payload, SharedExecutor, ValueRef};

/// Runs every computation payload through a [`PassManager`].
///
/// Handles are the child's own; only `create_value` is intercepted.
pub struct TransformingExecutor {
    child: SharedExecutor,
    passes: PassManager,
}

impl TransformingExecutor {
    pub fn new(child: SharedExecutor, passes: PassManager) -> Self {
        Self { child, passes }
    }
}

#[async_trait]
impl Executor for TransformingExecutor {
    async fn create_value(&self, payload: Payload, ty: Type) -> Result<ValueRef> {
        let payload = match payload {
            Payload::Computation(expr) => {
                let before = expr.size();
                let out = self.passes.run(&expr)?;
                if out.type_signature() != expr.type_signature() {
                    return Err(ExecutorError::mismatch(format!(
                        "pipeline changed {} into {}",
                        expr.type_signature(),
                        out.type_signature()
                    )));
                }
                debug!(before, after = out.size(), "transformed computation");
                Payload::Computation(out)
            }
            value => value,
        };
        self.child.create_value(payload, ty).await
    }

    async fn create_call(
        &self,
        function: &ValueRef,
        argument: Option<&ValueRef>,
    ) -> Result<ValueRef> {
        self.child.create_call(function, argument).await
    }

    async fn create_struct(&self, elements: Vec<(Option<String>, ValueRef)>) -> Result<ValueRef> {
        self.child.create_struct(elements).await
    }

    async fn create_selection(&self, source: &ValueRef, selector: Selector) -> Result<ValueRef> {
        self.child.create_selection(source, selector).await
    }

    async fn compute(&self, value: &ValueRef) -> Result<Value> {
        self.child.compute(value).await
    }

    fn dispose(&self, value: ValueRef) {
        self.child.dispose(value);
    }

    async fn close(&self) {
        self.child.close().await;
    }
}
