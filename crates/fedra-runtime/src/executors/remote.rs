//! Proxy to an executor service in another process.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fedra_core::wire::{deserialize_value, serialize_type};
use fedra_core::{CardinalityMap, Selector, Type, Value};
use tarpc::client::RpcError;
use tarpc::context;
use tracing::{info, warn};

use crate::config::{FederatingConfig, RemoteConfig};
use crate::error::{ExecutorError, Result, ServiceError};
use crate::executor::{
    call_result_type, select_type, struct_type, Executor, ExecutorId, ExecutorValue, Payload,
    ValueRef,
};
use crate::retry::{RetryPolicy, RetryState};
use crate::service::ExecutorServiceClient;

/// Run one RPC under a deadline, retrying transport failures.
///
/// Errors reported by the service itself are final. Transport errors and
/// missed deadlines are retried per `policy`, then surface as
/// [`ExecutorError::RemoteUnavailable`].
async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Duration,
    op: &'static str,
    mut call: F,
) -> Result<T>
where
    F: FnMut(context::Context) -> Fut,
    Fut: Future<Output = std::result::Result<std::result::Result<T, ServiceError>, RpcError>>,
{
    let mut state = RetryState::new();
    loop {
        let error = match tokio::time::timeout(deadline, call(context::current())).await {
            Ok(Ok(Ok(v))) => return Ok(v),
            Ok(Ok(Err(e))) => return Err(e.into()),
            Ok(Err(rpc)) => rpc.to_string(),
            Err(_) => format!("no reply within {deadline:?}"),
        };
        state.record_attempt(Some(error.clone()));
        if !policy.should_retry(state.attempts) {
            return Err(ExecutorError::RemoteUnavailable(format!(
                "{op} failed after {} attempts: {error}",
                state.attempts
            )));
        }
        let delay = policy.calculate_delay(state.attempts - 1);
        warn!(op, attempt = state.attempts, ?delay, %error, "retrying remote call");
        tokio::time::sleep(delay).await;
    }
}

struct Remote {
    client: ExecutorServiceClient,
    session: u64,
    retry: RetryPolicy,
    deadline: Duration,
}

impl Remote {
    async fn call<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T>
    where
        F: FnMut(context::Context) -> Fut,
        Fut: Future<Output = std::result::Result<std::result::Result<T, ServiceError>, RpcError>>,
    {
        with_retry(&self.retry, self.deadline, op, call).await
    }

    async fn dispose(&self, values: Vec<u64>) -> Result<()> {
        self.call("dispose", |ctx| {
            self.client.dispose(ctx, self.session, values.clone())
        })
        .await
    }
}

struct RemoteValue {
    ty: Type,
    id: u64,
    remote: Arc<Remote>,
}

impl ExecutorValue for RemoteValue {
    fn type_signature(&self) -> &Type {
        &self.ty
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for RemoteValue {
    fn drop(&mut self) {
        let remote = self.remote.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = remote.dispose(vec![id]).await {
                        warn!(value = id, session = remote.session, error = %e, "leaked remote value");
                    }
                });
            }
            Err(_) => warn!(value = id, "no runtime to release remote value"),
        }
    }
}

/// Forwards the executor protocol to one session of an executor service.
///
/// Values stay on the service; handles here carry the remote id and a type
/// computed locally.
pub struct RemoteExecutor {
    id: ExecutorId,
    remote: Arc<Remote>,
}

impl RemoteExecutor {
    /// Open a session on the service for `cardinalities`. Federations in the
    /// session's stack follow `policy`.
    pub async fn open(
        client: ExecutorServiceClient,
        cardinalities: CardinalityMap,
        policy: FederatingConfig,
        config: &RemoteConfig,
    ) -> Result<Self> {
        let retry = config.retry.clone();
        let deadline = config.rpc_deadline();
        let session = with_retry(&retry, deadline, "open_session", |ctx| {
            client.open_session(ctx, cardinalities.clone(), policy.clone())
        })
        .await?;
        info!(session, clients = cardinalities.clients(), "opened remote session");
        Ok(Self {
            id: ExecutorId::next(),
            remote: Arc::new(Remote {
                client,
                session,
                retry,
                deadline,
            }),
        })
    }

    pub fn session(&self) -> u64 {
        self.remote.session
    }

    fn wrap(&self, ty: Type, id: u64) -> ValueRef {
        ValueRef::new(
            self.id,
            RemoteValue {
                ty,
                id,
                remote: self.remote.clone(),
            },
        )
    }

    fn remote_id(&self, h: &ValueRef) -> Result<u64> {
        Ok(h.downcast::<RemoteValue>(self.id)?.id)
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    async fn create_value(&self, payload: Payload, ty: Type) -> Result<ValueRef> {
        let r = &self.remote;
        let type_bytes = serialize_type(&ty)?;
        let payload_bytes = payload.to_bytes()?;
        let id = r
            .call("create_value", |ctx| {
                r.client
                    .create_value(ctx, r.session, type_bytes.clone(), payload_bytes.clone())
            })
            .await?;
        Ok(self.wrap(ty, id))
    }

    async fn create_call(
        &self,
        function: &ValueRef,
        argument: Option<&ValueRef>,
    ) -> Result<ValueRef> {
        let ty = call_result_type(
            function.type_signature(),
            argument.map(ValueRef::type_signature),
        )?;
        let f = self.remote_id(function)?;
        let a = argument.map(|a| self.remote_id(a)).transpose()?;
        let r = &self.remote;
        let id = r
            .call("create_call", |ctx| r.client.create_call(ctx, r.session, f, a))
            .await?;
        Ok(self.wrap(ty, id))
    }

    async fn create_struct(&self, elements: Vec<(Option<String>, ValueRef)>) -> Result<ValueRef> {
        let ty = struct_type(&elements)?;
        let mut ids = Vec::with_capacity(elements.len());
        for (name, h) in &elements {
            ids.push((name.clone(), self.remote_id(h)?));
        }
        let r = &self.remote;
        let id = r
            .call("create_struct", |ctx| {
                r.client.create_struct(ctx, r.session, ids.clone())
            })
            .await?;
        Ok(self.wrap(ty, id))
    }

    async fn create_selection(&self, source: &ValueRef, selector: Selector) -> Result<ValueRef> {
        let (index, ty) = select_type(source.type_signature(), &selector)?;
        let index = u32::try_from(index)
            .map_err(|_| ExecutorError::mismatch(format!("selection index {index} is too large")))?;
        let s = self.remote_id(source)?;
        let r = &self.remote;
        let id = r
            .call("create_selection", |ctx| {
                r.client.create_selection(ctx, r.session, s, index)
            })
            .await?;
        Ok(self.wrap(ty, id))
    }

    async fn compute(&self, value: &ValueRef) -> Result<Value> {
        let v = self.remote_id(value)?;
        let r = &self.remote;
        let bytes = r
            .call("compute", |ctx| r.client.compute(ctx, r.session, v))
            .await?;
        Ok(deserialize_value(&bytes)?)
    }

    async fn close(&self) {
        let r = &self.remote;
        if let Err(e) = r
            .call("close_session", |ctx| r.client.close_session(ctx, r.session))
            .await
        {
            warn!(session = r.session, error = %e, "failed to close remote session");
        }
    }
}
