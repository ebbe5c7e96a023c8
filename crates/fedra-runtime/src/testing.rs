//! A leaf that counts what it is asked to do.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fedra_core::{Selector, Type, Value};

use crate::error::{ExecutorError, Result};
use crate::executor::{Executor, ExecutorId, ExecutorValue, Payload, ValueRef};
use crate::executors::EagerExecutor;

struct Counted {
    inner: ValueRef,
    live: Arc<AtomicUsize>,
}

impl Drop for Counted {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ExecutorValue for Counted {
    fn type_signature(&self) -> &Type {
        self.inner.type_signature()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Wraps an [`EagerExecutor`], counting `create_value` calls and live handles.
pub(crate) struct CountingExecutor {
    id: ExecutorId,
    inner: EagerExecutor,
    created: AtomicUsize,
    live: Arc<AtomicUsize>,
    failures: AtomicUsize,
    delay: Option<Duration>,
}

impl CountingExecutor {
    pub(crate) fn new() -> Self {
        Self {
            id: ExecutorId::next(),
            inner: EagerExecutor::new(),
            created: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            failures: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Every `create_value` sleeps for `delay` first.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The next `n` calls to `create_value` fail.
    pub(crate) fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn wrap(&self, inner: ValueRef) -> ValueRef {
        self.live.fetch_add(1, Ordering::SeqCst);
        ValueRef::new(
            self.id,
            Counted {
                inner,
                live: self.live.clone(),
            },
        )
    }

    fn unwrap<'a>(&self, h: &'a ValueRef) -> Result<&'a ValueRef> {
        Ok(&h.downcast::<Counted>(self.id)?.inner)
    }
}

#[async_trait]
impl Executor for CountingExecutor {
    async fn create_value(&self, payload: Payload, ty: Type) -> Result<ValueRef> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ExecutorError::Evaluation("injected failure".into()));
        }
        let h = self.inner.create_value(payload, ty).await?;
        Ok(self.wrap(h))
    }

    async fn create_call(
        &self,
        function: &ValueRef,
        argument: Option<&ValueRef>,
    ) -> Result<ValueRef> {
        let f = self.unwrap(function)?;
        let a = argument.map(|a| self.unwrap(a)).transpose()?;
        let h = self.inner.create_call(f, a).await?;
        Ok(self.wrap(h))
    }

    async fn create_struct(&self, elements: Vec<(Option<String>, ValueRef)>) -> Result<ValueRef> {
        let mut inner = Vec::with_capacity(elements.len());
        for (name, h) in &elements {
            inner.push((name.clone(), self.unwrap(h)?.clone()));
        }
        let h = self.inner.create_struct(inner).await?;
        Ok(self.wrap(h))
    }

    async fn create_selection(&self, source: &ValueRef, selector: Selector) -> Result<ValueRef> {
        let h = self.inner.create_selection(self.unwrap(source)?, selector).await?;
        Ok(self.wrap(h))
    }

    async fn compute(&self, value: &ValueRef) -> Result<Value> {
        self.inner.compute(self.unwrap(value)?).await
    }
}
