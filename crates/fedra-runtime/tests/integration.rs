//! End-to-end tests for fedra-runtime.
//!
//! Tests whole stacks: factory-built local stacks, hand-assembled
//! federations, and remote workers over TCP.

use std::sync::Arc;

use async_trait::async_trait;
use fedra_core::{intrinsics, CardinalityMap, Expr, Intrinsic, KernelBuilder, Selector, Type, Value};
use fedra_runtime::config::FederatingConfig;
use fedra_runtime::executors::{
    ComposingExecutor, EagerExecutor, FederatingExecutor, ReferenceResolvingExecutor,
};
use fedra_runtime::{
    transport, ExecutionContext, Executor, ExecutorError, ExecutorFactory, ExecutorServer,
    Payload, Result, RuntimeConfig, SharedExecutor, ValueRef,
};

fn ints_at_clients(values: &[i32]) -> Expr {
    Expr::data(
        Value::Federated(values.iter().map(|&v| Value::int32(v)).collect()),
        Type::at_clients(Type::int32()),
    )
    .unwrap()
}

fn floats(values: &[f32]) -> Value {
    Value::Federated(values.iter().map(|&v| Value::float32(v)).collect())
}

async fn context(config: RuntimeConfig, clients: usize) -> ExecutionContext {
    let factory = ExecutorFactory::from_config(config);
    ExecutionContext::from_factory(&factory, &CardinalityMap::server_and_clients(clients))
        .await
        .unwrap()
}

/// `x -> federated_mean(federated_map(v -> v * v + 1, x))`
fn mean_of_squares_plus_one() -> Expr {
    let mut b = KernelBuilder::new();
    let v = b.input(0);
    let sq = b.mul(v, v);
    let one = b.lit(1.0);
    let out = b.add(sq, one);
    let f = Expr::compiled(
        b.finish(vec![out]),
        Type::function(Some(Type::float32()), Type::float32()),
    )
    .unwrap();
    let ty = Type::at_clients(Type::float32());
    let x = Expr::reference("x", ty.clone()).unwrap();
    Expr::lambda(
        Some(("x", ty)),
        intrinsics::federated_mean(intrinsics::federated_map(f, x).unwrap()).unwrap(),
    )
    .unwrap()
}

#[tokio::test]
async fn federated_sum_end_to_end() {
    let ctx = context(RuntimeConfig::default(), 3).await;
    let e = intrinsics::federated_sum(ints_at_clients(&[2, 5, 7])).unwrap();
    assert_eq!(
        ctx.invoke(&e, None).await.unwrap(),
        Value::Federated(vec![Value::int32(14)])
    );
}

#[tokio::test]
async fn blocks_and_selections_resolve() {
    // let y = 3 in <y, y>[1]
    let ctx = context(RuntimeConfig::default(), 0).await;
    let y = Expr::reference("y", Type::int32()).unwrap();
    let e = Expr::block(
        vec![("y", Expr::literal(Value::int32(3)).unwrap())],
        Expr::selection(Expr::tuple(vec![y.clone(), y]).unwrap(), 1usize).unwrap(),
    )
    .unwrap();
    assert_eq!(ctx.invoke(&e, None).await.unwrap(), Value::int32(3));
}

#[tokio::test]
async fn sharded_stack_matches_flat_stack() {
    // Two shards of three: means 3 and 5, overall 4.
    let arg = floats(&[1.0, 1.0, 2.0, 2.0, 2.0, 2.0]);
    let flat = context(RuntimeConfig::default(), 6).await;
    let sharded = context(RuntimeConfig::default().with_max_fanout(3), 6).await;
    let f = mean_of_squares_plus_one();
    let expected = flat.invoke(&f, Some(arg.clone())).await.unwrap();
    assert_eq!(sharded.invoke(&f, Some(arg)).await.unwrap(), expected);
    assert_eq!(expected, Value::Federated(vec![Value::float32(4.0)]));
}

#[tokio::test]
async fn sharded_mean_of_inexact_floats_is_bit_identical() {
    let arg = floats(&[0.71, 2.01, 3.31, 4.61, 5.91, 7.21]);
    let ty = Type::at_clients(Type::float32());
    let x = Expr::reference("x", ty.clone()).unwrap();
    let mean =
        Expr::lambda(Some(("x", ty)), intrinsics::federated_mean(x).unwrap()).unwrap();
    let flat = context(RuntimeConfig::default(), 6).await;
    let expected = flat.invoke(&mean, Some(arg.clone())).await.unwrap();
    for fanout in [2, 3, 4] {
        let sharded = context(RuntimeConfig::default().with_max_fanout(fanout), 6).await;
        assert_eq!(sharded.invoke(&mean, Some(arg.clone())).await.unwrap(), expected);
    }
    // Likewise after a map that squares every value.
    let f = mean_of_squares_plus_one();
    let expected = flat.invoke(&f, Some(arg.clone())).await.unwrap();
    let sharded = context(RuntimeConfig::default().with_max_fanout(3), 6).await;
    assert_eq!(sharded.invoke(&f, Some(arg)).await.unwrap(), expected);
}

#[tokio::test]
async fn every_optional_layer_gives_the_same_answer() {
    let arg = floats(&[0.5, 1.5, 2.5, 3.5]);
    let f = mean_of_squares_plus_one();
    let baseline = context(RuntimeConfig::default(), 4).await;
    let expected = baseline.invoke(&f, Some(arg.clone())).await.unwrap();
    for config in [
        RuntimeConfig::default().with_caching(false),
        RuntimeConfig::default().with_pipeline(false),
        RuntimeConfig::default().with_thread_delegating(true),
        RuntimeConfig::default().with_max_fanout(2),
    ] {
        let ctx = context(config, 4).await;
        assert_eq!(ctx.invoke(&f, Some(arg.clone())).await.unwrap(), expected);
    }
}

#[tokio::test]
async fn concurrent_invocations_share_a_stack() {
    let ctx = Arc::new(context(RuntimeConfig::default(), 4).await);
    let f = mean_of_squares_plus_one();
    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let ctx = ctx.clone();
            let f = f.clone();
            tokio::spawn(async move { ctx.invoke(&f, Some(floats(&[1.0, 1.0, 1.0, 1.0]))).await })
        })
        .collect();
    for t in tasks {
        assert_eq!(
            t.await.unwrap().unwrap(),
            Value::Federated(vec![Value::float32(2.0)])
        );
    }
}

#[tokio::test]
async fn remote_workers_over_tcp() {
    let mut workers = Vec::new();
    for _ in 0..2 {
        let listener = transport::bind("127.0.0.1:0").await.unwrap();
        workers.push(listener.local_addr().unwrap().to_string());
        let server = ExecutorServer::new(ExecutorFactory::from_config(RuntimeConfig::default()));
        tokio::spawn(transport::accept_loop(server, listener));
    }
    let remote = context(RuntimeConfig::default().with_workers(workers), 5).await;
    let local = context(RuntimeConfig::default(), 5).await;
    let f = mean_of_squares_plus_one();
    let arg = floats(&[1.0, 1.0, 2.0, 3.0, 3.0]);
    assert_eq!(
        remote.invoke(&f, Some(arg.clone())).await.unwrap(),
        local.invoke(&f, Some(arg)).await.unwrap()
    );
    remote.close().await;
}

#[tokio::test]
async fn unsatisfiable_requests_fail_to_build() {
    let factory = ExecutorFactory::from_config(RuntimeConfig::default());
    let two_servers =
        CardinalityMap::server_and_clients(2).with(fedra_core::Placement::Server, 2);
    assert!(matches!(
        ExecutionContext::from_factory(&factory, &two_servers).await,
        Err(ExecutorError::UnsatisfiableTopology(_))
    ));
}

/// A client whose values can be placed but never computed.
struct Unreachable {
    inner: EagerExecutor,
}

#[async_trait]
impl Executor for Unreachable {
    async fn create_value(&self, payload: Payload, ty: Type) -> Result<ValueRef> {
        self.inner.create_value(payload, ty).await
    }

    async fn create_call(
        &self,
        function: &ValueRef,
        argument: Option<&ValueRef>,
    ) -> Result<ValueRef> {
        self.inner.create_call(function, argument).await
    }

    async fn create_struct(&self, elements: Vec<(Option<String>, ValueRef)>) -> Result<ValueRef> {
        self.inner.create_struct(elements).await
    }

    async fn create_selection(&self, source: &ValueRef, selector: Selector) -> Result<ValueRef> {
        self.inner.create_selection(source, selector).await
    }

    async fn compute(&self, _value: &ValueRef) -> Result<Value> {
        Err(ExecutorError::RemoteUnavailable("client went away".into()))
    }
}

fn federation_with_one_unreachable_client(config: FederatingConfig) -> ReferenceResolvingExecutor {
    let leaf = || -> SharedExecutor { Arc::new(EagerExecutor::new()) };
    let clients: Vec<SharedExecutor> = vec![
        leaf(),
        leaf(),
        Arc::new(Unreachable {
            inner: EagerExecutor::new(),
        }),
    ];
    ReferenceResolvingExecutor::new(Arc::new(FederatingExecutor::new(leaf(), clients, config)))
}

/// Six clients in two shards of three; client 1 is unreachable.
fn shards_with_one_unreachable_client(
    parent: FederatingConfig,
    child: FederatingConfig,
) -> ReferenceResolvingExecutor {
    let leaf = || -> SharedExecutor { Arc::new(EagerExecutor::new()) };
    let shard = |clients: Vec<SharedExecutor>| -> (SharedExecutor, usize) {
        let n = clients.len();
        let fed = FederatingExecutor::new(leaf(), clients, child.clone());
        (Arc::new(fed), n)
    };
    let unreachable: SharedExecutor = Arc::new(Unreachable {
        inner: EagerExecutor::new(),
    });
    let children = vec![
        shard(vec![leaf(), unreachable, leaf()]),
        shard(vec![leaf(), leaf(), leaf()]),
    ];
    ReferenceResolvingExecutor::new(Arc::new(ComposingExecutor::new(leaf(), children, parent)))
}

fn six_floats(values: [f32; 6]) -> Expr {
    Expr::data(floats(&values), Type::at_clients(Type::float32())).unwrap()
}

async fn run(ex: &dyn Executor, e: &Expr) -> Result<Value> {
    let h = ex
        .create_value(Payload::Computation(e.clone()), e.type_signature().clone())
        .await?;
    ex.compute(&h).await
}

#[tokio::test]
async fn a_failed_client_fails_the_whole_sum_by_default() {
    let ex = federation_with_one_unreachable_client(FederatingConfig::default());
    let e = intrinsics::federated_sum(ints_at_clients(&[2, 5, 7])).unwrap();
    assert!(matches!(
        run(&ex, &e).await,
        Err(ExecutorError::RemoteUnavailable(_))
    ));
}

#[tokio::test]
async fn partial_tolerance_drops_failed_clients() {
    let ex = federation_with_one_unreachable_client(
        FederatingConfig::default().with_partial_tolerance(Intrinsic::FederatedSum),
    );
    let e = intrinsics::federated_sum(ints_at_clients(&[2, 5, 7])).unwrap();
    assert_eq!(
        run(&ex, &e).await.unwrap(),
        Value::Federated(vec![Value::int32(7)])
    );

    // Mean is not opted in, so it still fails as a whole.
    let mean = intrinsics::federated_mean(
        Expr::data(floats(&[1.0, 2.0, 3.0]), Type::at_clients(Type::float32())).unwrap(),
    )
    .unwrap();
    assert!(run(&ex, &mean).await.is_err());
}

#[tokio::test]
async fn sharded_tolerant_mean_counts_surviving_clients() {
    // Client 1 drops out: flat gives (8 + 0 * 4) / 5, not a shard-weighted 2.
    let policy = FederatingConfig::default().with_partial_tolerance(Intrinsic::FederatedMean);
    let ex = shards_with_one_unreachable_client(policy.clone(), policy.for_shards());
    let e = intrinsics::federated_mean(six_floats([8.0, 100.0, 0.0, 0.0, 0.0, 0.0])).unwrap();
    assert_eq!(
        run(&ex, &e).await.unwrap(),
        Value::Federated(vec![Value::float32(1.6)])
    );
}

#[tokio::test]
async fn sharded_tolerant_sum_drops_only_the_failed_client() {
    let policy = FederatingConfig::default().with_partial_tolerance(Intrinsic::FederatedSum);
    let ex = shards_with_one_unreachable_client(policy.clone(), policy.for_shards());
    let e = intrinsics::federated_sum(six_floats([1.0, 100.0, 2.0, 3.0, 4.0, 5.0])).unwrap();
    assert_eq!(
        run(&ex, &e).await.unwrap(),
        Value::Federated(vec![Value::float32(15.0)])
    );
}

#[tokio::test]
async fn sharded_sum_fails_as_a_whole_by_default() {
    let ex = shards_with_one_unreachable_client(
        FederatingConfig::default(),
        FederatingConfig::default(),
    );
    let e = intrinsics::federated_sum(six_floats([1.0, 2.0, 3.0, 4.0, 5.0, 6.0])).unwrap();
    assert!(matches!(
        run(&ex, &e).await,
        Err(ExecutorError::RemoteUnavailable(_))
    ));
}

#[tokio::test]
async fn sharded_sum_rejects_a_partial_shard_it_does_not_tolerate() {
    // Children tolerate a dropped client, the parent does not.
    let ex = shards_with_one_unreachable_client(
        FederatingConfig::default(),
        FederatingConfig::default().with_partial_tolerance(Intrinsic::FederatedSum),
    );
    let e = intrinsics::federated_sum(six_floats([1.0, 2.0, 3.0, 4.0, 5.0, 6.0])).unwrap();
    assert!(matches!(
        run(&ex, &e).await,
        Err(ExecutorError::Evaluation(_))
    ));
}
