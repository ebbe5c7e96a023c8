//! Runs every child operation on a dedicated thread with its own runtime.

use std::any::Any;

use async_trait::async_trait;
use fedra_core::{Selector, Type, Value};
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{ExecutorError, Result};
use crate::executor::{Executor, ExecutorId, ExecutorValue, Payload, SharedExecutor, ValueRef};

type Task = Box<dyn FnOnce(SharedExecutor) -> BoxFuture<'static, ()> + Send>;

enum Job {
    Run(Task),
    Shutdown,
}

struct DelegatedValue {
    ty: Type,
    inner: Option<ValueRef>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl ExecutorValue for DelegatedValue {
    fn type_signature(&self) -> &Type {
        &self.ty
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for DelegatedValue {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            // If the worker is gone the job comes back in the error and the
            // handle is released here instead.
            let _ = self.jobs.send(Job::Run(Box::new(move |_| {
                async move { drop(inner) }.boxed()
            })));
        }
    }
}

/// Delegates to a child that lives on its own thread.
///
/// The child is only ever touched from that thread, including when its
/// handles are released. Closing the executor stops the thread; operations
/// after that fail with [`ExecutorError::Cancelled`].
pub struct ThreadDelegatingExecutor {
    id: ExecutorId,
    jobs: mpsc::UnboundedSender<Job>,
}

impl ThreadDelegatingExecutor {
    pub fn new(child: SharedExecutor) -> Result<Self> {
        let id = ExecutorId::next();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ExecutorError::Service(format!("cannot start delegate runtime: {e}")))?;
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        std::thread::Builder::new()
            .name(format!("fedra-{id}"))
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(job) = rx.recv().await {
                        match job {
                            Job::Run(task) => {
                                tokio::spawn(task(child.clone()));
                            }
                            Job::Shutdown => break,
                        }
                    }
                    debug!(executor = %id, "delegate thread stopping");
                });
            })
            .map_err(|e| ExecutorError::Service(format!("cannot spawn delegate thread: {e}")))?;
        Ok(Self { id, jobs })
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(SharedExecutor) -> BoxFuture<'static, Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task: Task = Box::new(move |child| {
            async move {
                let _ = tx.send(f(child).await);
            }
            .boxed()
        });
        self.jobs
            .send(Job::Run(task))
            .map_err(|_| ExecutorError::Cancelled)?;
        rx.await.map_err(|_| ExecutorError::Cancelled)?
    }

    fn wrap(&self, inner: ValueRef) -> ValueRef {
        ValueRef::new(
            self.id,
            DelegatedValue {
                ty: inner.type_signature().clone(),
                inner: Some(inner),
                jobs: self.jobs.clone(),
            },
        )
    }

    fn inner(&self, h: &ValueRef) -> Result<ValueRef> {
        h.downcast::<DelegatedValue>(self.id)?
            .inner
            .clone()
            .ok_or(ExecutorError::Cancelled)
    }
}

impl Drop for ThreadDelegatingExecutor {
    fn drop(&mut self) {
        let _ = self.jobs.send(Job::Shutdown);
    }
}

#[async_trait]
impl Executor for ThreadDelegatingExecutor {
    async fn create_value(&self, payload: Payload, ty: Type) -> Result<ValueRef> {
        let out = self
            .run(move |c| async move { c.create_value(payload, ty).await }.boxed())
            .await?;
        Ok(self.wrap(out))
    }

    async fn create_call(
        &self,
        function: &ValueRef,
        argument: Option<&ValueRef>,
    ) -> Result<ValueRef> {
        let f = self.inner(function)?;
        let a = argument.map(|a| self.inner(a)).transpose()?;
        let out = self
            .run(move |c| async move { c.create_call(&f, a.as_ref()).await }.boxed())
            .await?;
        Ok(self.wrap(out))
    }

    async fn create_struct(&self, elements: Vec<(Option<String>, ValueRef)>) -> Result<ValueRef> {
        let mut inner = Vec::with_capacity(elements.len());
        for (name, h) in &elements {
            inner.push((name.clone(), self.inner(h)?));
        }
        let out = self
            .run(move |c| async move { c.create_struct(inner).await }.boxed())
            .await?;
        Ok(self.wrap(out))
    }

    async fn create_selection(&self, source: &ValueRef, selector: Selector) -> Result<ValueRef> {
        let s = self.inner(source)?;
        let out = self
            .run(move |c| async move { c.create_selection(&s, selector).await }.boxed())
            .await?;
        Ok(self.wrap(out))
    }

    async fn compute(&self, value: &ValueRef) -> Result<Value> {
        let v = self.inner(value)?;
        self.run(move |c| async move { c.compute(&v).await }.boxed())
            .await
    }

    async fn close(&self) {
        let closed = self
            .run(|c| {
                async move {
                    c.close().await;
                    Ok(())
                }
                .boxed()
            })
            .await;
        if closed.is_err() {
            warn!(executor = %self.id, "delegate thread already stopped");
        }
        let _ = self.jobs.send(Job::Shutdown);
    }
}
