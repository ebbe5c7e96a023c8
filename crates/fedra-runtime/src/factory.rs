//! Builds executor stacks for a cardinality map.
//!
//! Building happens in two steps. [`ExecutorFactory::plan`] turns the
//! topology and the cardinalities into a [`StackPlan`], a plain tree that
//! tests can inspect, and [`ExecutorFactory::build`] instantiates it.
//!
//! The root of every stack is
//!
//! ```text
//! Transforming? -> Caching? -> ReferenceResolving -> core
//! ```
//!
//! where the core is a federating executor when the clients fit within one
//! fan-out, a composing executor over shards otherwise, and a composing
//! executor over remote sessions for a remote topology.

use std::fmt;
use std::sync::Arc;

use fedra_core::CardinalityMap;
use futures::future::{try_join_all, BoxFuture, FutureExt};
use tracing::info;

use crate::config::{FederatingConfig, RuntimeConfig};
use crate::error::{ExecutorError, Result};
use crate::executor::SharedExecutor;
use crate::executors::{
    CachingExecutor, ComposingExecutor, EagerExecutor, FederatingExecutor,
    ReferenceResolvingExecutor, RemoteExecutor, ThreadDelegatingExecutor, TransformingExecutor,
};
use crate::service::ExecutorServiceClient;
use crate::transport;

/// Where an executor service can be reached.
#[derive(Clone)]
pub enum WorkerEndpoint {
    Tcp(String),
    /// An already connected client, e.g. from `ExecutorServer::spawn_channel`.
    Client(ExecutorServiceClient),
}

impl fmt::Debug for WorkerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerEndpoint::Tcp(addr) => write!(f, "Tcp({addr})"),
            WorkerEndpoint::Client(_) => f.write_str("Client"),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Topology {
    /// Everything in process, shaped by `[local]`.
    Local,
    /// Clients spread across executor services.
    Remote { workers: Vec<WorkerEndpoint> },
}

/// Shape of an executor stack.
#[derive(Clone, Debug, PartialEq)]
pub enum StackPlan {
    Transforming(Box<StackPlan>),
    Caching(Box<StackPlan>),
    ReferenceResolving(Box<StackPlan>),
    ThreadDelegating(Box<StackPlan>),
    Eager,
    Federating {
        server: Box<StackPlan>,
        clients: Vec<StackPlan>,
        policy: FederatingConfig,
    },
    /// `children` pairs each child with its client count.
    Composing {
        parent: Box<StackPlan>,
        children: Vec<(usize, StackPlan)>,
        policy: FederatingConfig,
    },
    /// A session on a worker, whose stack adopts `policy`.
    Remote {
        worker: usize,
        cardinalities: CardinalityMap,
        policy: FederatingConfig,
    },
}

impl StackPlan {
    /// Number of leaf executors the plan instantiates in this process.
    pub fn num_leaves(&self) -> usize {
        match self {
            StackPlan::Eager => 1,
            StackPlan::Remote { .. } => 0,
            StackPlan::Transforming(p)
            | StackPlan::Caching(p)
            | StackPlan::ReferenceResolving(p)
            | StackPlan::ThreadDelegating(p) => p.num_leaves(),
            StackPlan::Federating {
                server, clients, ..
            } => {
                server.num_leaves() + clients.iter().map(StackPlan::num_leaves).sum::<usize>()
            }
            StackPlan::Composing {
                parent, children, ..
            } => {
                parent.num_leaves() + children.iter().map(|(_, c)| c.num_leaves()).sum::<usize>()
            }
        }
    }

    /// Deepest chain of federating and composing levels.
    pub fn depth(&self) -> usize {
        match self {
            StackPlan::Eager | StackPlan::Remote { .. } => 0,
            StackPlan::Transforming(p)
            | StackPlan::Caching(p)
            | StackPlan::ReferenceResolving(p)
            | StackPlan::ThreadDelegating(p) => p.depth(),
            StackPlan::Federating { .. } => 1,
            StackPlan::Composing { children, .. } => {
                1 + children.iter().map(|(_, c)| c.depth()).max().unwrap_or(0)
            }
        }
    }
}

pub struct ExecutorFactory {
    config: RuntimeConfig,
    topology: Topology,
}

impl ExecutorFactory {
    pub fn new(config: RuntimeConfig, topology: Topology) -> Self {
        Self { config, topology }
    }

    /// Remote when `[remote].workers` lists any address, local otherwise.
    pub fn from_config(config: RuntimeConfig) -> Self {
        let topology = if config.remote.workers.is_empty() {
            Topology::Local
        } else {
            Topology::Remote {
                workers: config
                    .remote
                    .workers
                    .iter()
                    .cloned()
                    .map(WorkerEndpoint::Tcp)
                    .collect(),
            }
        };
        Self::new(config, topology)
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn plan(&self, cardinalities: &CardinalityMap) -> Result<StackPlan> {
        self.plan_with(cardinalities, &self.config.federating)
    }

    /// Plan a stack whose federations follow `policy` instead of the
    /// configured `[federating]` section.
    pub fn plan_with(
        &self,
        cardinalities: &CardinalityMap,
        policy: &FederatingConfig,
    ) -> Result<StackPlan> {
        if cardinalities.server() > 1 {
            return Err(ExecutorError::UnsatisfiableTopology(format!(
                "{} servers requested, at most one is supported",
                cardinalities.server()
            )));
        }
        let core = match &self.topology {
            Topology::Local => {
                let fanout = self.config.local.max_fanout;
                if fanout == 0 && cardinalities.clients() > 0 {
                    return Err(ExecutorError::UnsatisfiableTopology(
                        "clients requested with a fan-out of zero".into(),
                    ));
                }
                self.local_plan(cardinalities.clients(), fanout, policy)
            }
            Topology::Remote { workers } => {
                self.remote_plan(cardinalities, workers.len(), policy)?
            }
        };
        let mut plan = StackPlan::ReferenceResolving(Box::new(core));
        if self.config.caching.enabled {
            plan = StackPlan::Caching(Box::new(plan));
        }
        if self.config.pipeline.enabled {
            plan = StackPlan::Transforming(Box::new(plan));
        }
        Ok(plan)
    }

    fn leaf(&self) -> StackPlan {
        let leaf = if self.config.local.thread_delegating {
            StackPlan::ThreadDelegating(Box::new(StackPlan::Eager))
        } else {
            StackPlan::Eager
        };
        StackPlan::ReferenceResolving(Box::new(leaf))
    }

    fn local_plan(&self, clients: usize, fanout: usize, policy: &FederatingConfig) -> StackPlan {
        if clients <= fanout {
            return StackPlan::Federating {
                server: Box::new(self.leaf()),
                clients: (0..clients).map(|_| self.leaf()).collect(),
                policy: policy.clone(),
            };
        }
        let shards = clients.div_ceil(fanout).min(fanout).max(2);
        let shard_policy = policy.for_shards();
        let children = CardinalityMap::server_and_clients(clients)
            .split_even(shards)
            .into_iter()
            .map(|shard| {
                (
                    shard.clients(),
                    self.local_plan(shard.clients(), fanout, &shard_policy),
                )
            })
            .collect();
        StackPlan::Composing {
            parent: Box::new(self.leaf()),
            children,
            policy: policy.clone(),
        }
    }

    fn remote_plan(
        &self,
        cardinalities: &CardinalityMap,
        workers: usize,
        policy: &FederatingConfig,
    ) -> Result<StackPlan> {
        if workers == 0 {
            return Err(ExecutorError::UnsatisfiableTopology(
                "remote topology without workers".into(),
            ));
        }
        if cardinalities.clients() == 0 {
            return Ok(StackPlan::Remote {
                worker: 0,
                cardinalities: cardinalities.clone(),
                policy: policy.clone(),
            });
        }
        let shard_policy = policy.for_shards();
        let children = cardinalities
            .split_even(workers)
            .into_iter()
            .enumerate()
            .filter(|(_, shard)| shard.clients() > 0)
            .map(|(worker, shard)| {
                (
                    shard.clients(),
                    StackPlan::Remote {
                        worker,
                        cardinalities: shard,
                        policy: shard_policy.clone(),
                    },
                )
            })
            .collect();
        Ok(StackPlan::Composing {
            parent: Box::new(self.leaf()),
            children,
            policy: policy.clone(),
        })
    }

    /// Plan and instantiate a stack for `cardinalities`.
    pub async fn build(&self, cardinalities: &CardinalityMap) -> Result<SharedExecutor> {
        self.build_with(cardinalities, &self.config.federating).await
    }

    /// Like [`build`](Self::build), with federations following `policy`.
    pub async fn build_with(
        &self,
        cardinalities: &CardinalityMap,
        policy: &FederatingConfig,
    ) -> Result<SharedExecutor> {
        let plan = self.plan_with(cardinalities, policy)?;
        info!(
            clients = cardinalities.clients(),
            depth = plan.depth(),
            leaves = plan.num_leaves(),
            "building executor stack"
        );
        self.instantiate(&plan).await
    }

    fn instantiate<'a>(&'a self, plan: &'a StackPlan) -> BoxFuture<'a, Result<SharedExecutor>> {
        async move {
            let ex: SharedExecutor = match plan {
                StackPlan::Eager => Arc::new(EagerExecutor::new()),
                StackPlan::ReferenceResolving(p) => {
                    Arc::new(ReferenceResolvingExecutor::new(self.instantiate(p).await?))
                }
                StackPlan::Caching(p) => Arc::new(CachingExecutor::new(self.instantiate(p).await?)),
                StackPlan::ThreadDelegating(p) => {
                    Arc::new(ThreadDelegatingExecutor::new(self.instantiate(p).await?)?)
                }
                StackPlan::Transforming(p) => {
                    let passes = self.config.pipeline.pass_manager()?.ok_or_else(|| {
                        ExecutorError::Config("transforming stage without a pipeline".into())
                    })?;
                    Arc::new(TransformingExecutor::new(self.instantiate(p).await?, passes))
                }
                StackPlan::Federating {
                    server,
                    clients,
                    policy,
                } => {
                    let server = self.instantiate(server).await?;
                    let clients = try_join_all(clients.iter().map(|c| self.instantiate(c))).await?;
                    Arc::new(FederatingExecutor::new(server, clients, policy.clone()))
                }
                StackPlan::Composing {
                    parent,
                    children,
                    policy,
                } => {
                    let parent = self.instantiate(parent).await?;
                    let built = try_join_all(children.iter().map(|(n, c)| async move {
                        Ok::<_, ExecutorError>((self.instantiate(c).await?, *n))
                    }))
                    .await?;
                    Arc::new(ComposingExecutor::new(parent, built, policy.clone()))
                }
                StackPlan::Remote {
                    worker,
                    cardinalities,
                    policy,
                } => {
                    let client = match &self.topology {
                        Topology::Remote { workers } => match workers.get(*worker) {
                            Some(WorkerEndpoint::Tcp(addr)) => transport::connect(addr.as_str()).await?,
                            Some(WorkerEndpoint::Client(c)) => c.clone(),
                            None => {
                                return Err(ExecutorError::UnsatisfiableTopology(format!(
                                    "no worker {worker}"
                                )))
                            }
                        },
                        Topology::Local => {
                            return Err(ExecutorError::UnsatisfiableTopology(
                                "remote stage in a local topology".into(),
                            ))
                        }
                    };
                    Arc::new(
                        RemoteExecutor::open(
                            client,
                            cardinalities.clone(),
                            policy.clone(),
                            &self.config.remote,
                        )
                        .await?,
                    )
                }
            };
            Ok(ex)
        }
        .boxed()
    }
}
