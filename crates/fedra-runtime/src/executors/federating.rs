//! Placement-aware execution over one server child and one child per client.

use async_trait::async_trait;
use fedra_core::{Intrinsic, Placement, Selector, Type, Value};
use futures::future::{join_all, try_join_all, BoxFuture, FutureExt};
use tracing::debug;

use super::placed::{
    self, call_unplaced, classify, client_members, fields, gather, intrinsic_of, lower,
    member_type, merge_and_report, reduce, server_intrinsic, server_member, widen, wrap, Embedding,
    Placed,
};
use crate::config::FederatingConfig;
use crate::error::{ExecutorError, Result};
use crate::executor::{
    call_result_type, select_type, struct_type, Executor, ExecutorId, Payload, SharedExecutor,
    ValueRef,
};

/// Runs federated intrinsics across a server child and `N` client children.
///
/// Unplaced values live in the server child. A `{T}@CLIENTS` value is one
/// handle per client child; values move between children by computing them
/// in one and embedding the result in another.
pub struct FederatingExecutor {
    id: ExecutorId,
    server: SharedExecutor,
    clients: Vec<SharedExecutor>,
    config: FederatingConfig,
}

impl FederatingExecutor {
    pub fn new(
        server: SharedExecutor,
        clients: Vec<SharedExecutor>,
        config: FederatingConfig,
    ) -> Self {
        Self {
            id: ExecutorId::next(),
            server,
            clients,
            config,
        }
    }

    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    fn wrap(&self, ty: Type, placed: Placed) -> ValueRef {
        wrap(self.id, ty, placed)
    }

    fn place(&self, value: Value, ty: Type) -> BoxFuture<'_, Result<ValueRef>> {
        async move {
            match ty.as_federated() {
                Some((member, Placement::Clients, _)) => {
                    let members = value
                        .as_federated()
                        .ok_or_else(|| ExecutorError::mismatch(format!("value does not conform to {ty}")))?;
                    if members.len() != self.clients.len() {
                        return Err(ExecutorError::CardinalityMismatch(format!(
                            "{} members for {} clients",
                            members.len(),
                            self.clients.len()
                        )));
                    }
                    let handles = try_join_all(self.clients.iter().zip(members).map(|(c, m)| {
                        c.create_value(Payload::Value(m.clone()), member.clone())
                    }))
                    .await?;
                    Ok(self.wrap(ty.clone(), Placed::Clients(handles)))
                }
                Some((member, Placement::Server, _)) => {
                    let m = match value.as_federated() {
                        Some([m]) => m.clone(),
                        Some(ms) => {
                            return Err(ExecutorError::CardinalityMismatch(format!(
                                "{} members for one server",
                                ms.len()
                            )))
                        }
                        None => {
                            return Err(ExecutorError::mismatch(format!(
                                "value does not conform to {ty}"
                            )))
                        }
                    };
                    let h = self.server.create_value(Payload::Value(m), member.clone()).await?;
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
                    let h = self.server.create_value(Payload::Value(value), ty.clone()).await?;
                    Ok(self.wrap(ty, Placed::Unplaced(h)))
                }
            }
        }
        .boxed()
    }

    /// Rebuild an unplaced value in every client child.
    async fn replicate(&self, h: &ValueRef) -> Result<Vec<ValueRef>> {
        if let Placed::Unplaced(x) = placed::placed(self.id, h)? {
            let v = self.server.compute(x).await?;
            let ty = h.type_signature();
            return try_join_all(
                self.clients
                    .iter()
                    .map(|c| c.create_value(Payload::Value(v.clone()), ty.clone())),
            )
            .await;
        }
        try_join_all(
            self.clients
                .iter()
                .map(|c| lower(self.id, &self.server, Some(c), h)),
        )
        .await
    }

    /// Call `function` in every client child, on that client's member of
    /// `members` if given.
    async fn map_clients(
        &self,
        function: &ValueRef,
        members: Option<&[ValueRef]>,
    ) -> Result<Vec<ValueRef>> {
        let fns = self.replicate(function).await?;
        try_join_all(self.clients.iter().zip(&fns).enumerate().map(|(i, (c, f))| {
            let arg = members.map(|m| &m[i]);
            c.create_call(f, arg)
        }))
        .await
    }

    async fn accumulate_on(
        &self,
        client: usize,
        member: &ValueRef,
        zero: &ValueRef,
        accumulate: &ValueRef,
    ) -> Result<Value> {
        let c = &self.clients[client];
        let z = lower(self.id, &self.server, Some(c), zero).await?;
        let f = lower(self.id, &self.server, Some(c), accumulate).await?;
        let pair = c.create_struct(vec![(None, z), (None, member.clone())]).await?;
        let out = c.create_call(&f, Some(&pair)).await?;
        c.compute(&out).await
    }

    async fn intrinsic(
        &self,
        intrinsic: Intrinsic,
        arg: &ValueRef,
        result_ty: Type,
    ) -> Result<ValueRef> {
        debug!(%intrinsic, clients = self.clients.len(), "federated call");
        if let Some(out) = server_intrinsic(self.id, &self.server, intrinsic, arg).await? {
            return Ok(self.wrap(result_ty, out));
        }
        let out = match intrinsic {
            Intrinsic::FederatedValueAtClients => Placed::Clients(self.replicate(arg).await?),
            Intrinsic::FederatedBroadcast => {
                let v = self.server.compute(server_member(self.id, arg)?).await?;
                let member = member_type(arg.type_signature())?;
                Placed::Clients(
                    try_join_all(
                        self.clients
                            .iter()
                            .map(|c| c.create_value(Payload::Value(v.clone()), member.clone())),
                    )
                    .await?,
                )
            }
            Intrinsic::FederatedMap | Intrinsic::FederatedMapAllEqual => {
                let f = fields(self.id, arg, 2)?;
                let members = client_members(self.id, &f[1])?;
                Placed::Clients(self.map_clients(&f[0], Some(members)).await?)
            }
            Intrinsic::FederatedEvalAtClients => Placed::Clients(self.map_clients(arg, None).await?),
            Intrinsic::FederatedZipAtClients => {
                let elements = match placed::placed(self.id, arg)? {
                    Placed::Struct(elements) => elements,
                    _ => return Err(ExecutorError::mismatch("federated_zip_at_clients takes a struct")),
                };
                let mut columns = Vec::with_capacity(elements.len());
                for (name, e) in elements {
                    columns.push((name.clone(), client_members(self.id, e)?));
                }
                Placed::Clients(
                    try_join_all(self.clients.iter().enumerate().map(|(i, c)| {
                        c.create_struct(
                            columns
                                .iter()
                                .map(|(name, members)| (name.clone(), members[i].clone()))
                                .collect(),
                        )
                    }))
                    .await?,
                )
            }
            Intrinsic::FederatedSum | Intrinsic::FederatedMean => {
                let members = client_members(self.id, arg)?;
                let member = member_type(&result_ty)?.clone();
                let operand = &member;
                let values = gather(
                    &self.config,
                    intrinsic,
                    self.clients
                        .iter()
                        .zip(members)
                        .map(|(c, m)| async move {
                            let v = c.compute(m).await?;
                            widen(operand, &v)
                        })
                        .collect(),
                )
                .await?;
                let total = reduce(intrinsic, &member, &values, values.len())?;
                Placed::Server(self.server.create_value(Payload::Value(total), member).await?)
            }
            Intrinsic::FederatedAggregate => {
                let f = fields(self.id, arg, 5)?;
                let members = client_members(self.id, &f[0])?;
                let partials = gather(
                    &self.config,
                    intrinsic,
                    members
                        .iter()
                        .enumerate()
                        .map(|(i, m)| self.accumulate_on(i, m, &f[1], &f[2]))
                        .collect(),
                )
                .await?;
                Placed::Server(
                    merge_and_report(self.id, &self.server, &f[1], &f[3], &f[4], partials).await?,
                )
            }
            Intrinsic::FederatedValueAtServer
            | Intrinsic::FederatedApply
            | Intrinsic::FederatedEvalAtServer
            | Intrinsic::FederatedZipAtServer => {
                return Err(ExecutorError::Evaluation(format!(
                    "{intrinsic} was not handled on the server side"
                )))
            }
        };
        Ok(self.wrap(result_ty, out))
    }

    fn materialize<'a>(&'a self, h: &'a ValueRef) -> BoxFuture<'a, Result<Value>> {
        async move {
            match placed::placed(self.id, h)? {
                Placed::Unplaced(x) => self.server.compute(x).await,
                Placed::Server(x) => Ok(Value::Federated(vec![self.server.compute(x).await?])),
                Placed::Clients(members) => Ok(Value::Federated(
                    try_join_all(self.clients.iter().zip(members).map(|(c, m)| c.compute(m)))
                        .await?,
                )),
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

#[async_trait]
impl Executor for FederatingExecutor {
    async fn create_value(&self, payload: Payload, ty: Type) -> Result<ValueRef> {
        match payload {
            Payload::Value(v) => self.place(v, ty).await,
            Payload::Computation(expr) => match classify(&expr, &ty)? {
                Embedding::Data(v) => self.place(v, ty).await,
                Embedding::Placed(p) => Ok(self.wrap(ty, p)),
                Embedding::Unplaced => {
                    let h = self
                        .server
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
        let out = call_unplaced(self.id, &self.server, function, argument).await?;
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
                let out = self.server.create_selection(x, Selector::Index(index)).await?;
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
        self.server.close().await;
        join_all(self.clients.iter().map(|c| c.close())).await;
    }
}
