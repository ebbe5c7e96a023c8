//! Placement-aware values shared by the federating and composing executors.
//!
//! Both executors pair a server-side executor (holding unplaced and
//! `@SERVER` values) with a set of client groups. Everything that only
//! touches the server side lives here.

use std::any::Any;
use std::future::Future;

use fedra_core::{CoreError, Expr, ExprKind, Intrinsic, Placement, Type, Value};
use futures::future::{join_all, try_join_all, BoxFuture, FutureExt};
use tracing::{info, warn};

use crate::config::FederatingConfig;
use crate::error::{ExecutorError, Result};
use crate::executor::{ExecutorId, ExecutorValue, Payload, SharedExecutor, ValueRef};

pub(crate) enum Placed {
    /// Lives in the server-side executor without a placement.
    Unplaced(ValueRef),
    /// Member of an `@SERVER` value, in the server-side executor.
    Server(ValueRef),
    /// One handle per client group.
    Clients(Vec<ValueRef>),
    Struct(Vec<(Option<String>, ValueRef)>),
    /// A function kept as IR until it is applied somewhere.
    Function(Expr),
    Placement(Placement),
}

pub(crate) struct PlacedValue {
    ty: Type,
    placed: Placed,
}

impl ExecutorValue for PlacedValue {
    fn type_signature(&self) -> &Type {
        &self.ty
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn wrap(owner: ExecutorId, ty: Type, placed: Placed) -> ValueRef {
    ValueRef::new(owner, PlacedValue { ty, placed })
}

pub(crate) fn placed(owner: ExecutorId, h: &ValueRef) -> Result<&Placed> {
    Ok(&h.downcast::<PlacedValue>(owner)?.placed)
}

/// Elements of a struct-valued intrinsic argument.
pub(crate) fn fields(owner: ExecutorId, h: &ValueRef, n: usize) -> Result<Vec<ValueRef>> {
    match placed(owner, h)? {
        Placed::Struct(elements) if elements.len() == n => {
            Ok(elements.iter().map(|(_, v)| v.clone()).collect())
        }
        _ => Err(ExecutorError::mismatch(format!(
            "expected a struct of {n} elements, got {}",
            h.type_signature()
        ))),
    }
}

pub(crate) fn intrinsic_of(expr: &Expr) -> Option<Intrinsic> {
    match expr.kind() {
        ExprKind::Intrinsic { intrinsic } => Some(*intrinsic),
        _ => None,
    }
}

pub(crate) fn member_type(ty: &Type) -> Result<&Type> {
    ty.as_federated()
        .map(|(member, _, _)| member)
        .ok_or_else(|| ExecutorError::mismatch(format!("{ty} is not federated")))
}

/// How a computation payload is held before it is placed anywhere.
pub(crate) enum Embedding {
    Data(Value),
    Placed(Placed),
    /// An unplaced, non-function computation for the server side.
    Unplaced,
}

pub(crate) fn classify(expr: &Expr, ty: &Type) -> Result<Embedding> {
    if expr.type_signature() != ty {
        return Err(ExecutorError::mismatch(format!(
            "computation of type {} embedded as {ty}",
            expr.type_signature()
        )));
    }
    Ok(match expr.kind() {
        ExprKind::Data { value } => Embedding::Data(value.clone()),
        ExprKind::Placement { placement } => Embedding::Placed(Placed::Placement(*placement)),
        _ if ty.is_function() => Embedding::Placed(Placed::Function(expr.clone())),
        _ if !ty.contains_federated() => Embedding::Unplaced,
        _ => {
            return Err(ExecutorError::mismatch(format!(
                "a {} computation of type {ty} must be resolved before placement",
                expr.tag()
            )))
        }
    })
}

/// Rebuild an unplaced value in `target`, or in `server` when `target` is
/// `None`.
pub(crate) fn lower<'a>(
    owner: ExecutorId,
    server: &'a SharedExecutor,
    target: Option<&'a SharedExecutor>,
    h: &'a ValueRef,
) -> BoxFuture<'a, Result<ValueRef>> {
    async move {
        let dest = target.unwrap_or(server);
        let ty = h.type_signature().clone();
        match placed(owner, h)? {
            Placed::Unplaced(x) => match target {
                None => Ok(x.clone()),
                Some(t) => {
                    let v = server.compute(x).await?;
                    t.create_value(Payload::Value(v), ty).await
                }
            },
            Placed::Function(e) => dest.create_value(Payload::Computation(e.clone()), ty).await,
            Placed::Placement(p) => {
                dest.create_value(Payload::Computation(Expr::placement(*p)), ty)
                    .await
            }
            Placed::Struct(elements) => {
                let mut out = Vec::with_capacity(elements.len());
                for (name, e) in elements {
                    out.push((name.clone(), lower(owner, server, target, e).await?));
                }
                dest.create_struct(out).await
            }
            Placed::Server(_) | Placed::Clients(_) => Err(CoreError::PlacementMismatch(format!(
                "expected an unplaced value, got {ty}"
            ))
            .into()),
        }
    }
    .boxed()
}

pub(crate) fn server_member(owner: ExecutorId, h: &ValueRef) -> Result<&ValueRef> {
    match placed(owner, h)? {
        Placed::Server(x) => Ok(x),
        _ => Err(CoreError::PlacementMismatch(format!(
            "expected a value at SERVER, got {}",
            h.type_signature()
        ))
        .into()),
    }
}

pub(crate) fn client_members(owner: ExecutorId, h: &ValueRef) -> Result<&[ValueRef]> {
    match placed(owner, h)? {
        Placed::Clients(members) => Ok(members),
        _ => Err(CoreError::PlacementMismatch(format!(
            "expected a value at CLIENTS, got {}",
            h.type_signature()
        ))
        .into()),
    }
}

/// Intrinsics that only touch the server side. `None` for the rest.
pub(crate) async fn server_intrinsic(
    owner: ExecutorId,
    server: &SharedExecutor,
    intrinsic: Intrinsic,
    arg: &ValueRef,
) -> Result<Option<Placed>> {
    let out = match intrinsic {
        Intrinsic::FederatedValueAtServer => Placed::Server(lower(owner, server, None, arg).await?),
        Intrinsic::FederatedApply => {
            let [f, v] = <[ValueRef; 2]>::try_from(fields(owner, arg, 2)?)
                .map_err(|_| ExecutorError::mismatch("federated_apply takes a pair"))?;
            let fh = lower(owner, server, None, &f).await?;
            let out = server.create_call(&fh, Some(server_member(owner, &v)?)).await?;
            Placed::Server(out)
        }
        Intrinsic::FederatedEvalAtServer => {
            let fh = lower(owner, server, None, arg).await?;
            Placed::Server(server.create_call(&fh, None).await?)
        }
        Intrinsic::FederatedZipAtServer => {
            let elements = match placed(owner, arg)? {
                Placed::Struct(elements) => elements,
                _ => return Err(ExecutorError::mismatch("federated_zip_at_server takes a struct")),
            };
            let mut members = Vec::with_capacity(elements.len());
            for (name, e) in elements {
                members.push((name.clone(), server_member(owner, e)?.clone()));
            }
            Placed::Server(server.create_struct(members).await?)
        }
        _ => return Ok(None),
    };
    Ok(Some(out))
}

/// Call an unplaced function on the server side.
pub(crate) async fn call_unplaced(
    owner: ExecutorId,
    server: &SharedExecutor,
    function: &ValueRef,
    argument: Option<&ValueRef>,
) -> Result<ValueRef> {
    let fh = lower(owner, server, None, function).await?;
    let ah = match argument {
        Some(a) => Some(lower(owner, server, None, a).await?),
        None => None,
    };
    server.create_call(&fh, ah.as_ref()).await
}

/// Collect one result per participant.
///
/// Fails as a whole on the first failure unless `config` makes `intrinsic`
/// partial-tolerant, in which case failed participants are dropped with a
/// warning and the call fails only if none succeed. No participants gives
/// no results.
pub(crate) async fn gather<T, F>(
    config: &FederatingConfig,
    intrinsic: Intrinsic,
    calls: Vec<F>,
) -> Result<Vec<T>>
where
    F: Future<Output = Result<T>>,
{
    if calls.is_empty() {
        return Ok(Vec::new());
    }
    if !config.tolerates(intrinsic) {
        return try_join_all(calls).await;
    }
    let total = calls.len();
    let mut values = Vec::with_capacity(total);
    let mut last_error = None;
    for (participant, result) in join_all(calls).await.into_iter().enumerate() {
        match result {
            Ok(v) => values.push(v),
            Err(e) => {
                warn!(participant, %intrinsic, error = %e, "dropping failed participant");
                last_error = Some(e);
            }
        }
    }
    match last_error {
        Some(e) if values.is_empty() => Err(e),
        Some(_) => {
            info!(%intrinsic, kept = values.len(), total, "aggregated a partial result");
            Ok(values)
        }
        None => Ok(values),
    }
}

/// Convert a sum operand of type `member` to the type it accumulates in.
pub(crate) fn widen(member: &Type, value: &Value) -> Result<Value> {
    match member.accumulator() {
        Some(acc) => Ok(value.cast_to(&acc)?),
        None => Ok(value.clone()),
    }
}

/// Finish a `federated_sum` or `federated_mean` over `count` clients.
///
/// `partials` are widened operands or sums of them. They are added in order,
/// the mean is scaled once, and float members are narrowed back last. A sum
/// over no clients is zero; a mean over no clients is an error.
pub(crate) fn reduce(
    intrinsic: Intrinsic,
    member: &Type,
    partials: &[Value],
    count: usize,
) -> Result<Value> {
    if intrinsic == Intrinsic::FederatedMean && count == 0 {
        return Err(ExecutorError::CardinalityMismatch(format!(
            "{intrinsic} needs at least one client"
        )));
    }
    if partials.is_empty() {
        return Ok(Value::zero(member)?);
    }
    let mut total = Value::sum(partials)?;
    if intrinsic == Intrinsic::FederatedMean {
        total = total.scale(1.0 / count as f64)?;
    }
    match member.accumulator() {
        Some(_) => Ok(total.cast_to(member)?),
        None => Ok(total),
    }
}

/// Fold `partials` into `zero` with `merge` and apply `report`, all on the
/// server side.
pub(crate) async fn merge_and_report(
    owner: ExecutorId,
    server: &SharedExecutor,
    zero: &ValueRef,
    merge: &ValueRef,
    report: &ValueRef,
    partials: Vec<Value>,
) -> Result<ValueRef> {
    let zero_ty = zero.type_signature().clone();
    let merge_fn = lower(owner, server, None, merge).await?;
    let mut acc = lower(owner, server, None, zero).await?;
    for partial in partials {
        let p = server.create_value(Payload::Value(partial), zero_ty.clone()).await?;
        let pair = server.create_struct(vec![(None, acc), (None, p)]).await?;
        acc = server.create_call(&merge_fn, Some(&pair)).await?;
    }
    let report_fn = lower(owner, server, None, report).await?;
    server.create_call(&report_fn, Some(&acc)).await
}

/// Unwrap the single member of a materialized `@SERVER` value.
pub(crate) fn single_member(value: Value) -> Result<Value> {
    match value {
        Value::Federated(mut members) if members.len() == 1 => Ok(members.remove(0)),
        Value::Federated(members) => Err(ExecutorError::CardinalityMismatch(format!(
            "expected one server value, got {}",
            members.len()
        ))),
        other => Ok(other),
    }
}
