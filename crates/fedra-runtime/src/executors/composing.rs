//! Hierarchical execution: a parent executor over child federations.
//!
//! Each child executor runs its own share of the clients. A `{T}@CLIENTS`
//! value held here is one `{T}@CLIENTS` handle per child, and clients-side
//! intrinsics are forwarded to every child unchanged. Aggregations run in
//! each child first and the per-shard results are combined in the parent.
//!
//! Sums and means come back from each shard as a widened sum paired with
//! the number of clients that contributed to it, so the parent divides
//! once by the true count and rounds exactly as a flat federation would.

use async_trait::async_trait;
use fedra_core::{Expr, Intrinsic, KernelBuilder, Placement, Selector, Type, Value};
use futures::future::{join_all, try_join_all, BoxFuture, FutureExt};
use tracing::debug;

use super::placed::{
    self, call_unplaced, classify, client_members, fields, gather, intrinsic_of, member_type,
    merge_and_report, reduce, server_intrinsic, single_member, wrap, Embedding, Placed,
};
use crate::config::FederatingConfig;
use crate::error::{ExecutorError, Result};
use crate::executor::{
    call_result_type, select_type, struct_type, Executor, ExecutorId, Payload, SharedExecutor,
    ValueRef,
};

pub struct ComposingExecutor {
    id: ExecutorId,
    parent: SharedExecutor,
    children: Vec<SharedExecutor>,
    shard_sizes: Vec<usize>,
    config: FederatingConfig,
}

impl ComposingExecutor {
    /// `children[i]` is responsible for `shard_sizes[i]` clients.
    ///
    /// Children should follow `config.for_shards()`. A child that fails a
    /// whole shard sum cannot report which clients it kept, so a tolerant
    /// mean over intolerant children drops whole shards instead of clients.
    pub fn new(
        parent: SharedExecutor,
        children: Vec<(SharedExecutor, usize)>,
        config: FederatingConfig,
    ) -> Self {
        let (children, shard_sizes) = children.into_iter().unzip();
        Self {
            id: ExecutorId::next(),
            parent,
            children,
            shard_sizes,
            config,
        }
    }

    pub fn num_clients(&self) -> usize {
        self.shard_sizes.iter().sum()
    }

    fn wrap(&self, ty: Type, placed: Placed) -> ValueRef {
        wrap(self.id, ty, placed)
    }

    fn place(&self, value: Value, ty: Type) -> BoxFuture<'_, Result<ValueRef>> {
        async move {
            match ty.as_federated() {
                Some((_, Placement::Clients, _)) => {
                    let members = value
                        .as_federated()
                        .ok_or_else(|| ExecutorError::mismatch(format!("value does not conform to {ty}")))?;
                    if members.len() != self.num_clients() {
                        return Err(ExecutorError::CardinalityMismatch(format!(
                            "{} members for {} clients",
                            members.len(),
                            self.num_clients()
                        )));
                    }
                    let mut shards = Vec::with_capacity(self.children.len());
                    let mut rest = members;
                    for &size in &self.shard_sizes {
                        let (head, tail) = rest.split_at(size);
                        shards.push(Value::Federated(head.to_vec()));
                        rest = tail;
                    }
                    let handles = try_join_all(
                        self.children
                            .iter()
                            .zip(shards)
                            .map(|(c, shard)| c.create_value(Payload::Value(shard), ty.clone())),
                    )
                    .await?;
                    Ok(self.wrap(ty.clone(), Placed::Clients(handles)))
                }
                Some((member, Placement::Server, _)) => {
                    let m = single_member(value)?;
                    let h = self.parent.create_value(Payload::Value(m), member.clone()).await?;
                    Ok(self.wrap(ty.clone(), Placed::Server(h)))
                }
                None if ty.contains_federated() => {
                    let (types, values) = match (ty.as_struct(), value.as_struct()) {
                        (Some(t), Some(v)) if t.len() == v.len() => (t, v),
                        _ => {
                            return Err(ExecutorError::mismatch(format!(
                                "value does not conform to {ty}"
                            )))
                        }
                    };
                    let mut out = Vec::with_capacity(types.len());
                    for ((name, t), (_, v)) in types.iter().zip(values) {
                        out.push((name.clone(), self.place(v.clone(), t.clone()).await?));
                    }
                    Ok(self.wrap(ty.clone(), Placed::Struct(out)))
                }
                None => {
                    let h = self.parent.create_value(Payload::Value(value), ty.clone()).await?;
                    Ok(self.wrap(ty, Placed::Unplaced(h)))
                }
            }
        }
        .boxed()
    }

    /// Rebuild `h` inside child `i`.
    fn lower_into_child<'a>(&'a self, i: usize, h: &'a ValueRef) -> BoxFuture<'a, Result<ValueRef>> {
        async move {
            let child = &self.children[i];
            let ty = h.type_signature().clone();
            match placed::placed(self.id, h)? {
                Placed::Clients(groups) => Ok(groups[i].clone()),
                Placed::Server(x) => {
                    let v = self.parent.compute(x).await?;
                    child
                        .create_value(Payload::Value(Value::Federated(vec![v])), ty)
                        .await
                }
                Placed::Unplaced(x) => {
                    let v = self.parent.compute(x).await?;
                    child.create_value(Payload::Value(v), ty).await
                }
                Placed::Function(e) => child.create_value(Payload::Computation(e.clone()), ty).await,
                Placed::Placement(p) => {
                    child
                        .create_value(Payload::Computation(Expr::placement(*p)), ty)
                        .await
                }
                Placed::Struct(elements) => {
                    let mut out = Vec::with_capacity(elements.len());
                    for (name, e) in elements {
                        out.push((name.clone(), self.lower_into_child(i, e).await?));
                    }
                    child.create_struct(out).await
                }
            }
        }
        .boxed()
    }

    /// Apply `intrinsic` inside child `i` to a handle the child owns.
    async fn child_intrinsic(
        &self,
        i: usize,
        intrinsic: Intrinsic,
        arg: &ValueRef,
    ) -> Result<ValueRef> {
        let child = &self.children[i];
        let fn_ty = intrinsic.function_type(arg.type_signature())?;
        let f = child
            .create_value(
                Payload::Computation(Expr::intrinsic(intrinsic, fn_ty.clone())?),
                fn_ty,
            )
            .await?;
        child.create_call(&f, Some(arg)).await
    }

    /// Run `intrinsic` on `arg` in every child.
    async fn forward(&self, intrinsic: Intrinsic, arg: &ValueRef) -> Result<Vec<ValueRef>> {
        try_join_all((0..self.children.len()).map(|i| async move {
            let lowered = self.lower_into_child(i, arg).await?;
            self.child_intrinsic(i, intrinsic, &lowered).await
        }))
        .await
    }

    /// Sum `arg` in child `i` as `<widened member, 1.0>` pairs, returning the
    /// widened shard sum and how many clients contributed to it.
    async fn shard_sum(&self, i: usize, member: &Type, arg: &ValueRef) -> Result<(Value, usize)> {
        let child = &self.children[i];
        let mut members = self.lower_into_child(i, arg).await?;
        if let Some(widen) = widening(member)? {
            let ty = widen.type_signature().clone();
            let f = child.create_value(Payload::Computation(widen), ty).await?;
            let pair = child.create_struct(vec![(None, f), (None, members)]).await?;
            members = self.child_intrinsic(i, Intrinsic::FederatedMap, &pair).await?;
        }
        let one = child
            .create_value(
                Payload::Value(Value::Federated(vec![Value::float64(1.0)])),
                Type::at_server(Type::float64()),
            )
            .await?;
        let ones = self
            .child_intrinsic(i, Intrinsic::FederatedBroadcast, &one)
            .await?;
        let columns = child.create_struct(vec![(None, members), (None, ones)]).await?;
        let counted = self
            .child_intrinsic(i, Intrinsic::FederatedZipAtClients, &columns)
            .await?;
        let out = self
            .child_intrinsic(i, Intrinsic::FederatedSum, &counted)
            .await?;
        let (sum, count) = match single_member(child.compute(&out).await?)? {
            Value::Struct(mut elements) if elements.len() == 2 => {
                let (_, count) = elements.remove(1);
                let (_, sum) = elements.remove(0);
                (sum, count)
            }
            other => {
                return Err(ExecutorError::mismatch(format!(
                    "shard {i} returned {other:?} for a counted sum"
                )))
            }
        };
        let count = count
            .as_tensor()
            .and_then(|t| t.to_f64s())
            .and_then(|c| c.first().copied())
            .ok_or_else(|| ExecutorError::mismatch(format!("shard {i} returned no count")))?;
        Ok((sum, count as usize))
    }

    /// Run `federated_aggregate` in child `i` with an identity report, so the
    /// parent sees the merged accumulator of that shard.
    async fn shard_aggregate(&self, i: usize, parts: &[ValueRef]) -> Result<Value> {
        let child = &self.children[i];
        let zero_ty = parts[1].type_signature().clone();
        let identity = Expr::lambda(
            Some(("acc", zero_ty.clone())),
            Expr::reference("acc", zero_ty.clone())?,
        )?;
        let report = child
            .create_value(
                Payload::Computation(identity),
                Type::function(Some(zero_ty.clone()), zero_ty),
            )
            .await?;
        let mut elements = Vec::with_capacity(5);
        for p in &parts[..4] {
            elements.push((None, self.lower_into_child(i, p).await?));
        }
        elements.push((None, report));
        let arg = child.create_struct(elements).await?;
        let out = self
            .child_intrinsic(i, Intrinsic::FederatedAggregate, &arg)
            .await?;
        single_member(child.compute(&out).await?)
    }

    async fn intrinsic(
        &self,
        intrinsic: Intrinsic,
        arg: &ValueRef,
        result_ty: Type,
    ) -> Result<ValueRef> {
        debug!(%intrinsic, shards = self.children.len(), "composed call");
        if let Some(out) = server_intrinsic(self.id, &self.parent, intrinsic, arg).await? {
            return Ok(self.wrap(result_ty, out));
        }
        let out = match intrinsic {
            Intrinsic::FederatedSum | Intrinsic::FederatedMean => {
                client_members(self.id, arg)?;
                let member = member_type(&result_ty)?.clone();
                let operand = &member;
                let shards = gather(
                    &self.config,
                    intrinsic,
                    (0..self.children.len())
                        .map(|i| async move {
                            let (sum, kept) = self.shard_sum(i, operand, arg).await?;
                            Ok::<_, ExecutorError>((i, sum, kept))
                        })
                        .collect(),
                )
                .await?;
                let tolerant = self.config.tolerates(intrinsic);
                let mut partials = Vec::with_capacity(shards.len());
                let mut count = 0;
                for (i, sum, kept) in shards {
                    if !tolerant && kept != self.shard_sizes[i] {
                        return Err(ExecutorError::Evaluation(format!(
                            "{intrinsic}: only {kept} of {} clients in shard {i} contributed",
                            self.shard_sizes[i]
                        )));
                    }
                    partials.push(sum);
                    count += kept;
                }
                let total = reduce(intrinsic, &member, &partials, count)?;
                Placed::Server(self.parent.create_value(Payload::Value(total), member).await?)
            }
            Intrinsic::FederatedAggregate => {
                let parts = fields(self.id, arg, 5)?;
                client_members(self.id, &parts[0])?;
                let partials = gather(
                    &self.config,
                    intrinsic,
                    (0..self.children.len())
                        .map(|i| self.shard_aggregate(i, &parts))
                        .collect(),
                )
                .await?;
                Placed::Server(
                    merge_and_report(
                        self.id,
                        &self.parent,
                        &parts[1],
                        &parts[3],
                        &parts[4],
                        partials,
                    )
                    .await?,
                )
            }
            _ => Placed::Clients(self.forward(intrinsic, arg).await?),
        };
        Ok(self.wrap(result_ty, out))
    }

    fn materialize<'a>(&'a self, h: &'a ValueRef) -> BoxFuture<'a, Result<Value>> {
        async move {
            match placed::placed(self.id, h)? {
                Placed::Unplaced(x) => self.parent.compute(x).await,
                Placed::Server(x) => Ok(Value::Federated(vec![self.parent.compute(x).await?])),
                Placed::Clients(groups) => {
                    let shards =
                        try_join_all(self.children.iter().zip(groups).map(|(c, g)| c.compute(g)))
                            .await?;
                    let mut members = Vec::with_capacity(self.num_clients());
                    for shard in shards {
                        match shard {
                            Value::Federated(m) => members.extend(m),
                            other => {
                                return Err(ExecutorError::mismatch(format!(
                                    "child returned a non-federated value {other:?}"
                                )))
                            }
                        }
                    }
                    Ok(Value::Federated(members))
                }
                Placed::Struct(elements) => {
                    let mut out = Vec::with_capacity(elements.len());
                    for (name, e) in elements {
                        out.push((name.clone(), self.materialize(e).await?));
                    }
                    Ok(Value::Struct(out))
                }
                Placed::Function(_) | Placed::Placement(_) => Err(ExecutorError::mismatch(
                    format!("cannot materialize a value of type {}", h.type_signature()),
                )),
            }
        }
        .boxed()
    }
}

/// The kernel carrying a float member to its accumulator type, if it has one.
fn widening(member: &Type) -> Result<Option<Expr>> {
    let (Some(acc), Some(leaves)) = (member.accumulator(), member.tensor_leaves()) else {
        return Ok(None);
    };
    let n: usize = leaves.iter().map(|l| l.num_elements()).sum();
    let mut b = KernelBuilder::new();
    let inputs: Vec<_> = (0..n).map(|k| b.input(k as u32)).collect();
    let kernel = b.finish(inputs);
    Ok(Some(Expr::compiled(
        kernel,
        Type::function(Some(member.clone()), acc),
    )?))
}

#[async_trait]
impl Executor for ComposingExecutor {
    async fn create_value(&self, payload: Payload, ty: Type) -> Result<ValueRef> {
        match payload {
            Payload::Value(v) => self.place(v, ty).await,
            Payload::Computation(expr) => match classify(&expr, &ty)? {
                Embedding::Data(v) => self.place(v, ty).await,
                Embedding::Placed(p) => Ok(self.wrap(ty, p)),
                Embedding::Unplaced => {
                    let h = self
                        .parent
                        .create_value(Payload::Computation(expr), ty.clone())
                        .await?;
                    Ok(self.wrap(ty, Placed::Unplaced(h)))
                }
            },
        }
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
        if let Placed::Function(expr) = placed::placed(self.id, function)? {
            if let Some(intrinsic) = intrinsic_of(expr) {
                let arg = argument.ok_or_else(|| {
                    ExecutorError::mismatch(format!("{intrinsic} requires an argument"))
                })?;
                return self.intrinsic(intrinsic, arg, result_ty).await;
            }
        }
        let out = call_unplaced(self.id, &self.parent, function, argument).await?;
        Ok(self.wrap(result_ty, Placed::Unplaced(out)))
    }

    async fn create_struct(&self, elements: Vec<(Option<String>, ValueRef)>) -> Result<ValueRef> {
        for (_, h) in &elements {
            placed::placed(self.id, h)?;
        }
        let ty = struct_type(&elements)?;
        Ok(self.wrap(ty, Placed::Struct(elements)))
    }

    async fn create_selection(&self, source: &ValueRef, selector: Selector) -> Result<ValueRef> {
        let (index, ty) = select_type(source.type_signature(), &selector)?;
        match placed::placed(self.id, source)? {
            Placed::Struct(elements) => Ok(elements[index].1.clone()),
            Placed::Unplaced(x) => {
                let out = self.parent.create_selection(x, Selector::Index(index)).await?;
                Ok(self.wrap(ty, Placed::Unplaced(out)))
            }
            _ => Err(ExecutorError::mismatch(format!(
                "cannot select from {}",
                source.type_signature()
            ))),
        }
    }

    async fn compute(&self, value: &ValueRef) -> Result<Value> {
        self.materialize(value).await
    }

    async fn close(&self) {
        self.parent.close().await;
        join_all(self.children.iter().map(|c| c.close())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::{EagerExecutor, FederatingExecutor, ReferenceResolvingExecutor};
    use fedra_core::{intrinsics, KernelBuilder};
    use std::sync::Arc;

    fn leaf() -> SharedExecutor {
        Arc::new(ReferenceResolvingExecutor::new(Arc::new(EagerExecutor::new())))
    }

    fn flat(n: usize) -> SharedExecutor {
        Arc::new(FederatingExecutor::new(
            leaf(),
            (0..n).map(|_| leaf()).collect(),
            FederatingConfig::default(),
        ))
    }

    /// Two shards over `sizes` clients, behind a reference resolver.
    fn composed(sizes: &[usize]) -> ReferenceResolvingExecutor {
        let children = sizes.iter().map(|&n| (flat(n), n)).collect();
        ReferenceResolvingExecutor::new(Arc::new(ComposingExecutor::new(
            leaf(),
            children,
            FederatingConfig::default(),
        )))
    }

    fn floats_at_clients(values: &[f32]) -> Expr {
        Expr::data(
            Value::Federated(values.iter().map(|&v| Value::float32(v)).collect()),
            Type::at_clients(Type::float32()),
        )
        .unwrap()
    }

    async fn run(ex: &dyn Executor, e: &Expr) -> Result<Value> {
        let h = ex
            .create_value(Payload::Computation(e.clone()), e.type_signature().clone())
            .await?;
        ex.compute(&h).await
    }

    #[tokio::test]
    async fn sum_and_mean_match_a_flat_federation() {
        let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let flat = ReferenceResolvingExecutor::new(flat(6));
        let ex = composed(&[3, 3]);
        for e in [
            intrinsics::federated_sum(floats_at_clients(&data)).unwrap(),
            intrinsics::federated_mean(floats_at_clients(&data)).unwrap(),
        ] {
            assert_eq!(run(&ex, &e).await.unwrap(), run(&flat, &e).await.unwrap());
        }
    }

    #[tokio::test]
    async fn float_mean_rounds_like_a_flat_federation() {
        let data = [0.71, 2.01, 3.31, 4.61, 5.91, 7.21];
        let flat = ReferenceResolvingExecutor::new(flat(6));
        let e = intrinsics::federated_mean(floats_at_clients(&data)).unwrap();
        let expected = run(&flat, &e).await.unwrap();
        for sizes in [[3, 3], [1, 5], [4, 2]] {
            assert_eq!(run(&composed(&sizes), &e).await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn vector_means_are_widened_per_element() {
        let ex = composed(&[1, 2]);
        let ty = Type::at_clients(Type::tensor(fedra_core::DType::Float32, &[2]));
        let e = intrinsics::federated_mean(
            Expr::data(
                Value::Federated(vec![
                    Value::float32_vec(vec![1.0, 0.5]),
                    Value::float32_vec(vec![2.0, 0.5]),
                    Value::float32_vec(vec![6.0, 2.0]),
                ]),
                ty,
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(
            run(&ex, &e).await.unwrap(),
            Value::Federated(vec![Value::float32_vec(vec![3.0, 1.0])])
        );
    }

    #[tokio::test]
    async fn empty_shards_add_nothing() {
        let ex = composed(&[0, 2]);
        let sum = intrinsics::federated_sum(floats_at_clients(&[1.5, 2.0])).unwrap();
        assert_eq!(
            run(&ex, &sum).await.unwrap(),
            Value::Federated(vec![Value::float32(3.5)])
        );
        let mean = intrinsics::federated_mean(floats_at_clients(&[1.5, 2.0])).unwrap();
        assert_eq!(
            run(&ex, &mean).await.unwrap(),
            Value::Federated(vec![Value::float32(1.75)])
        );
    }

    #[tokio::test]
    async fn mean_is_weighted_by_shard_size() {
        let ex = composed(&[1, 3]);
        let e = intrinsics::federated_mean(floats_at_clients(&[8.0, 0.0, 0.0, 0.0])).unwrap();
        assert_eq!(
            run(&ex, &e).await.unwrap(),
            Value::Federated(vec![Value::float32(2.0)])
        );
    }

    #[tokio::test]
    async fn clients_values_keep_their_order_across_shards() {
        let ex = composed(&[2, 3]);
        let mut b = KernelBuilder::new();
        let x = b.input(0);
        let one = b.lit(1.0);
        let y = b.add(x, one);
        let inc = Expr::compiled(
            b.finish(vec![y]),
            Type::function(Some(Type::float32()), Type::float32()),
        )
        .unwrap();
        let e = intrinsics::federated_map(inc, floats_at_clients(&[0.0, 1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        assert_eq!(
            run(&ex, &e).await.unwrap(),
            Value::Federated((1..=5).map(|v| Value::float32(v as f32)).collect())
        );
    }

    #[tokio::test]
    async fn broadcast_reaches_every_shard() {
        let ex = composed(&[2, 2]);
        let at_server = Expr::data(
            Value::Federated(vec![Value::float32(0.5)]),
            Type::at_server(Type::float32()),
        )
        .unwrap();
        let e = intrinsics::federated_broadcast(at_server).unwrap();
        assert_eq!(
            run(&ex, &e).await.unwrap(),
            Value::Federated(vec![Value::float32(0.5); 4])
        );
    }

    #[tokio::test]
    async fn aggregate_merges_shard_accumulators() {
        let ex = composed(&[2, 1]);
        let pair = Type::struct_of(vec![Type::float32(), Type::float32()]);
        let mut b = KernelBuilder::new();
        let x = b.input(0);
        let y = b.input(1);
        let s = b.add(x, y);
        let add = Expr::compiled(
            b.finish(vec![s]),
            Type::function(Some(pair), Type::float32()),
        )
        .unwrap();
        let mut b = KernelBuilder::new();
        let x = b.input(0);
        let two = b.lit(2.0);
        let y = b.mul(x, two);
        let double = Expr::compiled(
            b.finish(vec![y]),
            Type::function(Some(Type::float32()), Type::float32()),
        )
        .unwrap();
        let e = intrinsics::federated_aggregate(
            floats_at_clients(&[1.0, 2.0, 3.0]),
            Expr::literal(Value::float32(0.0)).unwrap(),
            add.clone(),
            add,
            double,
        )
        .unwrap();
        assert_eq!(
            run(&ex, &e).await.unwrap(),
            Value::Federated(vec![Value::float32(12.0)])
        );
    }

    #[tokio::test]
    async fn placement_rejects_wrong_client_count() {
        let ex = composed(&[2, 2]);
        let e = intrinsics::federated_sum(floats_at_clients(&[1.0, 2.0, 3.0])).unwrap();
        assert!(matches!(
            run(&ex, &e).await,
            Err(ExecutorError::CardinalityMismatch(_))
        ));
    }
}
