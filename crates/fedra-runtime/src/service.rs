//! Executor service: the executor protocol over tarpc.
//!
//! A client opens a session for a cardinality map; the server builds a
//! local executor stack for it with its [`ExecutorFactory`]. Values in a
//! session are named by integer ids that stay valid until disposed or until
//! the session closes. Types, payloads and results cross the wire in their
//! canonical byte encodings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fedra_core::wire::{deserialize_type, serialize_value};
use fedra_core::{CardinalityMap, Selector};
use tarpc::context;
use tarpc::server::{BaseChannel, Channel};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::FederatingConfig;
use crate::error::{ErrorKind, ServiceError};
use crate::executor::{Payload, SharedExecutor, ValueRef};
use crate::factory::ExecutorFactory;

type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// RPC interface of an executor service.
///
/// Every call except `ping` names the session it acts on.
#[tarpc::service]
pub trait ExecutorService {
    /// Build an executor stack for `cardinalities` whose federations follow
    /// `policy`, and return its session id.
    async fn open_session(
        cardinalities: CardinalityMap,
        policy: FederatingConfig,
    ) -> Result<u64, ServiceError>;

    async fn create_value(
        session: u64,
        type_bytes: Vec<u8>,
        payload_bytes: Vec<u8>,
    ) -> Result<u64, ServiceError>;

    async fn create_call(
        session: u64,
        function: u64,
        argument: Option<u64>,
    ) -> Result<u64, ServiceError>;

    async fn create_struct(
        session: u64,
        elements: Vec<(Option<String>, u64)>,
    ) -> Result<u64, ServiceError>;

    async fn create_selection(session: u64, source: u64, index: u32) -> Result<u64, ServiceError>;

    /// Materialize a value, returned in its canonical encoding.
    async fn compute(session: u64, value: u64) -> Result<Vec<u8>, ServiceError>;

    /// Release values. Unknown ids are ignored.
    async fn dispose(session: u64, values: Vec<u64>) -> Result<(), ServiceError>;

    async fn close_session(session: u64) -> Result<(), ServiceError>;

    /// Health check ping. Returns the same sequence number.
    async fn ping(seq: u64) -> u64;
}

struct Session {
    executor: SharedExecutor,
    handles: Mutex<HashMap<u64, ValueRef>>,
    next_id: AtomicU64,
}

impl Session {
    fn handles(&self) -> MutexGuard<'_, HashMap<u64, ValueRef>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, h: ValueRef) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles().insert(id, h);
        id
    }

    fn get(&self, id: u64) -> ServiceResult<ValueRef> {
        self.handles()
            .get(&id)
            .cloned()
            .ok_or_else(|| ServiceError::new(ErrorKind::Service, format!("unknown value {id}")))
    }
}

struct ServerState {
    factory: ExecutorFactory,
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
    next_session: AtomicU64,
}

/// Serves the executor protocol for any number of sessions.
#[derive(Clone)]
pub struct ExecutorServer {
    state: Arc<ServerState>,
}

impl ExecutorServer {
    pub fn new(factory: ExecutorFactory) -> Self {
        Self {
            state: Arc::new(ServerState {
                factory,
                sessions: RwLock::new(HashMap::new()),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Number of open sessions.
    pub async fn num_sessions(&self) -> usize {
        self.state.sessions.read().await.len()
    }

    /// Spawn a server on an in-process channel transport.
    ///
    /// Returns a client that can call this server's RPC methods.
    pub fn spawn_channel(&self) -> ExecutorServiceClient {
        let (client_transport, server_transport) = tarpc::transport::channel::unbounded();
        let server = BaseChannel::with_defaults(server_transport);
        let handler = self.clone();
        tokio::spawn(async move {
            use futures_util::StreamExt;
            server
                .execute(handler.serve())
                .for_each(|response| async move {
                    tokio::spawn(response);
                })
                .await;
        });
        ExecutorServiceClient::new(tarpc::client::Config::default(), client_transport).spawn()
    }

    async fn session(&self, id: u64) -> ServiceResult<Arc<Session>> {
        self.state
            .sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ServiceError::new(ErrorKind::Service, format!("unknown session {id}")))
    }
}

impl ExecutorService for ExecutorServer {
    async fn open_session(
        self,
        _ctx: context::Context,
        cardinalities: CardinalityMap,
        policy: FederatingConfig,
    ) -> ServiceResult<u64> {
        let executor = self.state.factory.build_with(&cardinalities, &policy).await?;
        let id = self.state.next_session.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            executor,
            handles: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        };
        self.state.sessions.write().await.insert(id, Arc::new(session));
        info!(
            session = id,
            clients = cardinalities.clients(),
            "opened executor session"
        );
        Ok(id)
    }

    async fn create_value(
        self,
        _ctx: context::Context,
        session: u64,
        type_bytes: Vec<u8>,
        payload_bytes: Vec<u8>,
    ) -> ServiceResult<u64> {
        let s = self.session(session).await?;
        let ty = deserialize_type(&type_bytes)?;
        let payload = Payload::from_bytes(&payload_bytes)?;
        let h = s.executor.create_value(payload, ty).await?;
        Ok(s.insert(h))
    }

    async fn create_call(
        self,
        _ctx: context::Context,
        session: u64,
        function: u64,
        argument: Option<u64>,
    ) -> ServiceResult<u64> {
        let s = self.session(session).await?;
        let f = s.get(function)?;
        let a = argument.map(|a| s.get(a)).transpose()?;
        let h = s.executor.create_call(&f, a.as_ref()).await?;
        Ok(s.insert(h))
    }

    async fn create_struct(
        self,
        _ctx: context::Context,
        session: u64,
        elements: Vec<(Option<String>, u64)>,
    ) -> ServiceResult<u64> {
        let s = self.session(session).await?;
        let mut handles = Vec::with_capacity(elements.len());
        for (name, id) in elements {
            handles.push((name, s.get(id)?));
        }
        let h = s.executor.create_struct(handles).await?;
        Ok(s.insert(h))
    }

    async fn create_selection(
        self,
        _ctx: context::Context,
        session: u64,
        source: u64,
        index: u32,
    ) -> ServiceResult<u64> {
        let s = self.session(session).await?;
        let src = s.get(source)?;
        let h = s
            .executor
            .create_selection(&src, Selector::Index(index as usize))
            .await?;
        Ok(s.insert(h))
    }

    async fn compute(
        self,
        _ctx: context::Context,
        session: u64,
        value: u64,
    ) -> ServiceResult<Vec<u8>> {
        let s = self.session(session).await?;
        let h = s.get(value)?;
        let v = s.executor.compute(&h).await?;
        Ok(serialize_value(&v)?)
    }

    async fn dispose(
        self,
        _ctx: context::Context,
        session: u64,
        values: Vec<u64>,
    ) -> ServiceResult<()> {
        let s = self.session(session).await?;
        let released: Vec<ValueRef> = {
            let mut handles = s.handles();
            values.iter().filter_map(|id| handles.remove(id)).collect()
        };
        debug!(session, released = released.len(), "disposed values");
        for h in released {
            s.executor.dispose(h);
        }
        Ok(())
    }

    async fn close_session(self, _ctx: context::Context, session: u64) -> ServiceResult<()> {
        let s = self
            .state
            .sessions
            .write()
            .await
            .remove(&session)
            .ok_or_else(|| {
                ServiceError::new(ErrorKind::Service, format!("unknown session {session}"))
            })?;
        let released = std::mem::take(&mut *s.handles());
        drop(released);
        s.executor.close().await;
        info!(session, "closed executor session");
        Ok(())
    }

    async fn ping(self, _ctx: context::Context, seq: u64) -> u64 {
        seq
    }
}
