//! The executor protocol and opaque value handles.
//!
//! Every layer of an executor tree implements [`Executor`]. Values live
//! inside executors and are named by [`ValueRef`] handles; a handle is
//! released when its last clone drops.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fedra_core::wire::{serialize_type, WirePayload};
use fedra_core::{Expr, Selector, Type, Value};

use crate::error::{ExecutorError, Result};

/// What `create_value` is asked to embed.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Value(Value),
    Computation(Expr),
}

impl Payload {
    pub fn to_wire(&self) -> WirePayload {
        match self {
            Payload::Value(v) => WirePayload::Value(v.clone()),
            Payload::Computation(e) => WirePayload::Computation(e.into()),
        }
    }

    pub fn from_wire(wire: WirePayload) -> Result<Self> {
        Ok(match wire {
            WirePayload::Value(v) => Payload::Value(v),
            WirePayload::Computation(e) => Payload::Computation(e.to_expr()?),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_wire().to_bytes()?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_wire(WirePayload::from_bytes(bytes)?)
    }
}

/// Content key of a `create_value` request: canonical type bytes followed by
/// canonical payload bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    pub fn of(payload: &Payload, ty: &Type) -> Result<Self> {
        let mut bytes = serialize_type(ty)?;
        bytes.extend(payload.to_bytes()?);
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({} bytes)", self.0.len())
    }
}

/// Identity of one executor instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExecutorId(u64);

impl ExecutorId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "executor#{}", self.0)
    }
}

/// Layer-specific state behind a [`ValueRef`].
///
/// Implementations own whatever child handles they wrap and release them in
/// `Drop`.
pub trait ExecutorValue: Send + Sync + 'static {
    fn type_signature(&self) -> &Type;
    fn as_any(&self) -> &dyn Any;
}

/// A cloneable handle to a value held by one executor instance.
#[derive(Clone)]
pub struct ValueRef {
    owner: ExecutorId,
    inner: Arc<dyn ExecutorValue>,
}

impl ValueRef {
    pub fn new(owner: ExecutorId, value: impl ExecutorValue) -> Self {
        Self {
            owner,
            inner: Arc::new(value),
        }
    }

    pub fn owner(&self) -> ExecutorId {
        self.owner
    }

    pub fn type_signature(&self) -> &Type {
        self.inner.type_signature()
    }

    pub fn ptr_eq(&self, other: &ValueRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Borrow the layer state, checking that `owner` created this handle.
    pub fn downcast<V: ExecutorValue>(&self, owner: ExecutorId) -> Result<&V> {
        if self.owner != owner {
            return Err(ExecutorError::mismatch(format!(
                "handle of {} passed to {owner}",
                self.owner
            )));
        }
        self.inner
            .as_any()
            .downcast_ref::<V>()
            .ok_or_else(|| ExecutorError::mismatch(format!("foreign handle passed to {owner}")))
    }
}

impl fmt::Debug for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueRef({}, {})", self.owner, self.type_signature())
    }
}

/// One layer of an executor tree.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Embed a value or computation of type `ty`.
    async fn create_value(&self, payload: Payload, ty: Type) -> Result<ValueRef>;

    async fn create_call(
        &self,
        function: &ValueRef,
        argument: Option<&ValueRef>,
    ) -> Result<ValueRef>;

    async fn create_struct(&self, elements: Vec<(Option<String>, ValueRef)>) -> Result<ValueRef>;

    async fn create_selection(&self, source: &ValueRef, selector: Selector) -> Result<ValueRef>;

    /// Materialize a handle into a concrete value.
    async fn compute(&self, value: &ValueRef) -> Result<Value>;

    /// Give up one handle. Never fails and never waits.
    fn dispose(&self, value: ValueRef) {
        drop(value);
    }

    /// Release executor-wide resources.
    async fn close(&self) {}
}

pub type SharedExecutor = Arc<dyn Executor>;

/// Result type of calling a value of type `function` on `argument`.
pub(crate) fn call_result_type(function: &Type, argument: Option<&Type>) -> Result<Type> {
    match function.as_function() {
        Some((parameter, result)) if parameter == argument => Ok(result.clone()),
        Some((parameter, _)) => Err(ExecutorError::mismatch(format!(
            "{function} called with {}, expected {}",
            argument.map_or_else(|| "no argument".to_string(), Type::to_string),
            parameter.map_or_else(|| "no argument".to_string(), Type::to_string),
        ))),
        None => Err(ExecutorError::mismatch(format!("cannot call a value of type {function}"))),
    }
}

/// Position and type of `selector` within struct type `ty`.
pub(crate) fn select_type(ty: &Type, selector: &Selector) -> Result<(usize, Type)> {
    let elements = ty
        .as_struct()
        .ok_or_else(|| ExecutorError::mismatch(format!("cannot select from {ty}")))?;
    let index = match selector {
        Selector::Index(i) => *i,
        Selector::Name(name) => ty
            .field_index(name)
            .ok_or_else(|| ExecutorError::mismatch(format!("{ty} has no element `{name}`")))?,
    };
    let (_, element) = elements
        .get(index)
        .ok_or_else(|| ExecutorError::mismatch(format!("index {index} out of range for {ty}")))?;
    Ok((index, element.clone()))
}

pub(crate) fn struct_type(elements: &[(Option<String>, ValueRef)]) -> Result<Type> {
    let mut seen = std::collections::BTreeSet::new();
    for name in elements.iter().filter_map(|(n, _)| n.as_deref()) {
        if !seen.insert(name) {
            return Err(ExecutorError::mismatch(format!("duplicate struct element `{name}`")));
        }
    }
    Ok(Type::Struct(
        elements
            .iter()
            .map(|(n, v)| (n.clone(), v.type_signature().clone()))
            .collect(),
    ))
}
