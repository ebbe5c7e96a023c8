//! Resolves names, lambdas and blocks above a child that only sees closed
//! computations.
//!
//! References, lambdas, blocks, calls of lambdas, structs and selections are
//! evaluated here against a scoped environment. Data, intrinsics, compiled
//! kernels and placement literals are forwarded to the child. When a lambda
//! has to cross into the child (for instance as an intrinsic argument) it is
//! closed over the values it captures and sent as a computation.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use fedra_core::{CoreError, Expr, ExprKind, Selector, Type, Value};
use futures::future::{BoxFuture, FutureExt};

use crate::error::{ExecutorError, Result};
use crate::executor::{
    call_result_type, select_type, struct_type, Executor, ExecutorId, ExecutorValue, Payload,
    SharedExecutor, ValueRef,
};

struct Scope {
    name: String,
    value: ValueRef,
    parent: Env,
}

type Env = Option<Arc<Scope>>;

fn bind(parent: Env, name: &str, value: ValueRef) -> Env {
    Some(Arc::new(Scope {
        name: name.to_string(),
        value,
        parent,
    }))
}

fn lookup(env: &Env, name: &str) -> Option<ValueRef> {
    let mut cur = env.as_ref();
    while let Some(scope) = cur {
        if scope.name == name {
            return Some(scope.value.clone());
        }
        cur = scope.parent.as_ref();
    }
    None
}

enum Resolved {
    /// A child handle, with the closed computation it was built from if any.
    Child { handle: ValueRef, source: Option<Expr> },
    Struct(Vec<(Option<String>, ValueRef)>),
    Lambda {
        parameter: Option<(String, Type)>,
        body: Expr,
        env: Env,
    },
}

struct ResolvedValue {
    ty: Type,
    resolved: Resolved,
}

impl ExecutorValue for ResolvedValue {
    fn type_signature(&self) -> &Type {
        &self.ty
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct ReferenceResolvingExecutor {
    id: ExecutorId,
    child: SharedExecutor,
}

impl ReferenceResolvingExecutor {
    pub fn new(child: SharedExecutor) -> Self {
        Self {
            id: ExecutorId::next(),
            child,
        }
    }

    fn wrap(&self, ty: Type, resolved: Resolved) -> ValueRef {
        ValueRef::new(self.id, ResolvedValue { ty, resolved })
    }

    fn resolved<'a>(&self, h: &'a ValueRef) -> Result<&'a Resolved> {
        Ok(&h.downcast::<ResolvedValue>(self.id)?.resolved)
    }

    fn evaluate<'a>(&'a self, expr: &'a Expr, env: Env) -> BoxFuture<'a, Result<ValueRef>> {
        async move {
            let ty = expr.type_signature().clone();
            match expr.kind() {
                ExprKind::Reference { name } => {
                    let bound = lookup(&env, name)
                        .ok_or_else(|| CoreError::UnboundReference(name.clone()))?;
                    if *bound.type_signature() != ty {
                        return Err(ExecutorError::mismatch(format!(
                            "`{name}` is bound to {} but referenced as {ty}",
                            bound.type_signature()
                        )));
                    }
                    Ok(bound)
                }
                ExprKind::Lambda { parameter, body } => {
                    // Capture only what the body can see.
                    let mut captured = None;
                    for name in expr.free_references() {
                        let value = lookup(&env, name)
                            .ok_or_else(|| CoreError::UnboundReference(name.clone()))?;
                        captured = bind(captured, name, value);
                    }
                    Ok(self.wrap(
                        ty,
                        Resolved::Lambda {
                            parameter: parameter.clone(),
                            body: body.clone(),
                            env: captured,
                        },
                    ))
                }
                ExprKind::Call { function, argument } => {
                    let f = self.evaluate(function, env.clone()).await?;
                    let arg = match argument {
                        Some(a) => Some(self.evaluate(a, env).await?),
                        None => None,
                    };
                    self.create_call(&f, arg.as_ref()).await
                }
                ExprKind::Block { locals, result } => {
                    let mut scope = env;
                    for (name, value) in locals {
                        let h = self.evaluate(value, scope.clone()).await?;
                        scope = bind(scope, name, h);
                    }
                    // Locals the result does not hold on to go away with `scope`.
                    self.evaluate(result, scope).await
                }
                ExprKind::Struct { elements } => {
                    let mut out = Vec::with_capacity(elements.len());
                    for (name, e) in elements {
                        out.push((name.clone(), self.evaluate(e, env.clone()).await?));
                    }
                    Ok(self.wrap(ty, Resolved::Struct(out)))
                }
                ExprKind::Selection { source, index } => {
                    let s = self.evaluate(source, env).await?;
                    self.create_selection(&s, Selector::Index(*index)).await
                }
                ExprKind::Data { .. }
                | ExprKind::Intrinsic { .. }
                | ExprKind::Compiled { .. }
                | ExprKind::Placement { .. } => {
                    let handle = self
                        .child
                        .create_value(Payload::Computation(expr.clone()), ty.clone())
                        .await?;
                    Ok(self.wrap(
                        ty,
                        Resolved::Child {
                            handle,
                            source: Some(expr.clone()),
                        },
                    ))
                }
            }
        }
        .boxed()
    }

    /// The child handle standing for `h`.
    fn lower<'a>(&'a self, h: &'a ValueRef) -> BoxFuture<'a, Result<ValueRef>> {
        async move {
            match self.resolved(h)? {
                Resolved::Child { handle, .. } => Ok(handle.clone()),
                Resolved::Struct(elements) => {
                    let mut out = Vec::with_capacity(elements.len());
                    for (name, e) in elements {
                        out.push((name.clone(), self.lower(e).await?));
                    }
                    self.child.create_struct(out).await
                }
                Resolved::Lambda { .. } => {
                    let closed = self.closed_expr(h).await?;
                    self.child
                        .create_value(Payload::Computation(closed), h.type_signature().clone())
                        .await
                }
            }
        }
        .boxed()
    }

    /// A closed computation that rebuilds `h` from scratch.
    fn closed_expr<'a>(&'a self, h: &'a ValueRef) -> BoxFuture<'a, Result<Expr>> {
        async move {
            match self.resolved(h)? {
                Resolved::Child {
                    source: Some(e), ..
                } => Ok(e.clone()),
                Resolved::Child {
                    handle,
                    source: None,
                } => {
                    let value = self.child.compute(handle).await?;
                    Ok(Expr::data(value, h.type_signature().clone())?)
                }
                Resolved::Struct(elements) => {
                    let mut out = Vec::with_capacity(elements.len());
                    for (name, e) in elements {
                        out.push((name.clone(), self.closed_expr(e).await?));
                    }
                    Ok(Expr::struct_of(out)?)
                }
                Resolved::Lambda {
                    parameter,
                    body,
                    env,
                } => {
                    let lambda = Expr::lambda(
                        parameter.as_ref().map(|(n, t)| (n.as_str(), t.clone())),
                        body.clone(),
                    )?;
                    if lambda.free_references().is_empty() {
                        return Ok(lambda);
                    }
                    let mut locals = Vec::new();
                    for name in lambda.free_references() {
                        let captured = lookup(env, name)
                            .ok_or_else(|| CoreError::UnboundReference(name.clone()))?;
                        locals.push((name.clone(), self.closed_expr(&captured).await?));
                    }
                    Ok(Expr::block(locals, lambda)?)
                }
            }
        }
        .boxed()
    }

    fn materialize<'a>(&'a self, h: &'a ValueRef) -> BoxFuture<'a, Result<Value>> {
        async move {
            match self.resolved(h)? {
                Resolved::Child { handle, .. } => self.child.compute(handle).await,
                Resolved::Struct(elements) => {
                    let mut out = Vec::with_capacity(elements.len());
                    for (name, e) in elements {
                        out.push((name.clone(), self.materialize(e).await?));
                    }
                    Ok(Value::Struct(out))
                }
                Resolved::Lambda { .. } => Err(ExecutorError::mismatch(format!(
                    "cannot materialize a function of type {}",
                    h.type_signature()
                ))),
            }
        }
        .boxed()
    }
}

#[async_trait]
impl Executor for ReferenceResolvingExecutor {
    async fn create_value(&self, payload: Payload, ty: Type) -> Result<ValueRef> {
        match payload {
            Payload::Value(v) => {
                let handle = self.child.create_value(Payload::Value(v), ty.clone()).await?;
                Ok(self.wrap(ty, Resolved::Child { handle, source: None }))
            }
            Payload::Computation(expr) => {
                if *expr.type_signature() != ty {
                    return Err(ExecutorError::mismatch(format!(
                        "computation of type {} embedded as {ty}",
                        expr.type_signature()
                    )));
                }
                self.evaluate(&expr, None).await
            }
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
        if let Some(a) = argument {
            self.resolved(a)?;
        }
        match self.resolved(function)? {
            Resolved::Lambda {
                parameter,
                body,
                env,
            } => {
                let env = match (parameter, argument) {
                    (Some((name, _)), Some(a)) => bind(env.clone(), name, a.clone()),
                    _ => env.clone(),
                };
                self.evaluate(body, env).await
            }
            Resolved::Child { handle, .. } => {
                let arg = match argument {
                    Some(a) => Some(self.lower(a).await?),
                    None => None,
                };
                let out = self.child.create_call(handle, arg.as_ref()).await?;
                Ok(self.wrap(
                    result_ty,
                    Resolved::Child {
                        handle: out,
                        source: None,
                    },
                ))
            }
            Resolved::Struct(_) => Err(ExecutorError::mismatch("cannot call a struct")),
        }
    }

    async fn create_struct(&self, elements: Vec<(Option<String>, ValueRef)>) -> Result<ValueRef> {
        for (_, h) in &elements {
            self.resolved(h)?;
        }
        let ty = struct_type(&elements)?;
        Ok(self.wrap(ty, Resolved::Struct(elements)))
    }

    async fn create_selection(&self, source: &ValueRef, selector: Selector) -> Result<ValueRef> {
        let (index, ty) = select_type(source.type_signature(), &selector)?;
        match self.resolved(source)? {
            Resolved::Struct(elements) => Ok(elements[index].1.clone()),
            Resolved::Child { handle, .. } => {
                let out = self
                    .child
                    .create_selection(handle, Selector::Index(index))
                    .await?;
                Ok(self.wrap(
                    ty,
                    Resolved::Child {
                        handle: out,
                        source: None,
                    },
                ))
            }
            Resolved::Lambda { .. } => Err(ExecutorError::mismatch("cannot select from a function")),
        }
    }

    async fn compute(&self, value: &ValueRef) -> Result<Value> {
        self.materialize(value).await
    }

    async fn close(&self) {
        self.child.close().await;
    }
}
