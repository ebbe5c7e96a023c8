//! The computation IR.
//!
//! An [`Expr`] is an immutable, reference-counted tree node carrying its kind,
//! its resolved [`Type`] and a structural hash computed once at construction.
//! Every constructor validates its children, so a live `Expr` is always
//! locally well-typed. Whether references are bound is a whole-tree property
//! checked by the compiler crate.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::intrinsics::Intrinsic;
use crate::kernel::Kernel;
use crate::types::{Placement, Type};
use crate::value::Value;

/// How a selection names its field.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Selector {
    Index(usize),
    Name(String),
}

impl From<usize> for Selector {
    fn from(i: usize) -> Self {
        Selector::Index(i)
    }
}

impl From<&str> for Selector {
    fn from(name: &str) -> Self {
        Selector::Name(name.to_string())
    }
}

/// Node payload.
#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Reference {
        name: String,
    },
    Lambda {
        parameter: Option<(String, Type)>,
        body: Expr,
    },
    Call {
        function: Expr,
        argument: Option<Expr>,
    },
    /// Sequential let-bindings: each local sees the ones before it.
    Block {
        locals: Vec<(String, Expr)>,
        result: Expr,
    },
    Struct {
        elements: Vec<(Option<String>, Expr)>,
    },
    /// Field access. Name selectors are resolved to an index at construction.
    Selection {
        source: Expr,
        index: usize,
    },
    Data {
        value: Value,
    },
    Intrinsic {
        intrinsic: Intrinsic,
    },
    Compiled {
        kernel: Arc<Kernel>,
    },
    Placement {
        placement: Placement,
    },
}

#[derive(Debug)]
struct Node {
    kind: ExprKind,
    ty: Type,
    hash: u64,
    free: BTreeSet<String>,
}

/// Shared handle to an IR node. Cloning is an `Arc` bump.
#[derive(Clone, Debug)]
pub struct Expr(Arc<Node>);

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.0.hash == other.0.hash && self.0.ty == other.0.ty && self.0.kind == other.0.kind)
    }
}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl Expr {
    fn new(kind: ExprKind, ty: Type) -> Self {
        let hash = structural_hash(&kind, &ty);
        let free = free_of(&kind);
        Expr(Arc::new(Node {
            kind,
            ty,
            hash,
            free,
        }))
    }

    // -- constructors --------------------------------------------------

    pub fn reference(name: impl Into<String>, ty: Type) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(CoreError::mismatch("reference name must be non-empty"));
        }
        Ok(Self::new(ExprKind::Reference { name }, ty))
    }

    pub fn lambda(parameter: Option<(&str, Type)>, body: Expr) -> Result<Self> {
        let parameter = match parameter {
            Some((name, _)) if name.is_empty() => {
                return Err(CoreError::mismatch("lambda parameter name must be non-empty"))
            }
            Some((name, ty)) => Some((name.to_string(), ty)),
            None => None,
        };
        let ty = Type::function(parameter.as_ref().map(|(_, t)| t.clone()), body.ty().clone());
        Ok(Self::new(ExprKind::Lambda { parameter, body }, ty))
    }

    pub fn call(function: Expr, argument: Option<Expr>) -> Result<Self> {
        let (parameter, result) = function.ty().as_function().ok_or_else(|| {
            CoreError::mismatch(format!("cannot call a value of type {}", function.ty()))
        })?;
        match (parameter, &argument) {
            (None, None) => {}
            (Some(p), Some(a)) if p == a.ty() => {}
            (Some(p), Some(a)) => {
                return Err(CoreError::mismatch(format!(
                    "function expects {p}, argument has type {}",
                    a.ty()
                )))
            }
            (Some(p), None) => {
                return Err(CoreError::mismatch(format!("function expects {p}, no argument given")))
            }
            (None, Some(a)) => {
                return Err(CoreError::mismatch(format!(
                    "function takes no argument, got {}",
                    a.ty()
                )))
            }
        }
        let ty = result.clone();
        Ok(Self::new(ExprKind::Call { function, argument }, ty))
    }

    pub fn block<S: Into<String>>(locals: Vec<(S, Expr)>, result: Expr) -> Result<Self> {
        let mut out = Vec::with_capacity(locals.len());
        for (name, value) in locals {
            let name = name.into();
            if name.is_empty() {
                return Err(CoreError::mismatch("block local name must be non-empty"));
            }
            out.push((name, value));
        }
        let ty = result.ty().clone();
        Ok(Self::new(ExprKind::Block { locals: out, result }, ty))
    }

    pub fn struct_of(elements: Vec<(Option<String>, Expr)>) -> Result<Self> {
        let mut seen = HashSet::new();
        for name in elements.iter().filter_map(|(n, _)| n.as_deref()) {
            if !seen.insert(name) {
                return Err(CoreError::mismatch(format!("duplicate struct field `{name}`")));
            }
        }
        let ty = Type::Struct(
            elements
                .iter()
                .map(|(n, e)| (n.clone(), e.ty().clone()))
                .collect(),
        );
        Ok(Self::new(ExprKind::Struct { elements }, ty))
    }

    /// An unnamed struct.
    pub fn tuple(elements: Vec<Expr>) -> Result<Self> {
        Self::struct_of(elements.into_iter().map(|e| (None, e)).collect())
    }

    pub fn selection(source: Expr, selector: impl Into<Selector>) -> Result<Self> {
        let fields = source.ty().as_struct().ok_or_else(|| {
            CoreError::mismatch(format!("cannot select from a value of type {}", source.ty()))
        })?;
        let index = match selector.into() {
            Selector::Index(i) if i < fields.len() => i,
            Selector::Index(i) => {
                return Err(CoreError::mismatch(format!(
                    "index {i} out of range for {}",
                    source.ty()
                )))
            }
            Selector::Name(name) => source.ty().field_index(&name).ok_or_else(|| {
                CoreError::mismatch(format!("no field `{name}` in {}", source.ty()))
            })?,
        };
        let ty = fields[index].1.clone();
        Ok(Self::new(ExprKind::Selection { source, index }, ty))
    }

    pub fn data(value: Value, ty: Type) -> Result<Self> {
        if !value.conforms_to(&ty) {
            return Err(CoreError::mismatch(format!("value does not conform to {ty}")));
        }
        Ok(Self::new(ExprKind::Data { value }, ty))
    }

    /// Data node typed by the value's own shape. Federated values need an
    /// explicit type and go through [`Expr::data`].
    pub fn literal(value: Value) -> Result<Self> {
        let ty = value
            .type_hint()
            .ok_or_else(|| CoreError::mismatch("federated data needs an explicit type"))?;
        Self::data(value, ty)
    }

    pub fn intrinsic(intrinsic: Intrinsic, ty: Type) -> Result<Self> {
        intrinsic.check_type(&ty)?;
        Ok(Self::new(ExprKind::Intrinsic { intrinsic }, ty))
    }

    pub fn compiled(kernel: Kernel, ty: Type) -> Result<Self> {
        let (parameter, result) = ty.as_function().ok_or_else(|| {
            CoreError::mismatch(format!("compiled payload needs a function type, got {ty}"))
        })?;
        let inputs = match parameter {
            Some(p) => scalar_count(p)?,
            None => 0,
        };
        let outputs = scalar_count(result)?;
        if inputs != kernel.num_inputs() || outputs != kernel.num_outputs() {
            return Err(CoreError::mismatch(format!(
                "kernel has {} inputs and {} outputs, {ty} needs {inputs} and {outputs}",
                kernel.num_inputs(),
                kernel.num_outputs()
            )));
        }
        Ok(Self::new(
            ExprKind::Compiled {
                kernel: Arc::new(kernel),
            },
            ty,
        ))
    }

    pub fn placement(placement: Placement) -> Self {
        Self::new(ExprKind::Placement { placement }, Type::Placement)
    }

    // -- accessors -----------------------------------------------------

    pub fn kind(&self) -> &ExprKind {
        &self.0.kind
    }

    pub fn type_signature(&self) -> &Type {
        &self.0.ty
    }

    #[inline]
    fn ty(&self) -> &Type {
        &self.0.ty
    }

    /// Cached structural hash. Equal nodes have equal hashes.
    pub fn structural_hash(&self) -> u64 {
        self.0.hash
    }

    /// Whether both handles point at the same allocation.
    pub fn ptr_eq(&self, other: &Expr) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Names referenced but not bound within this node.
    pub fn free_references(&self) -> &BTreeSet<String> {
        &self.0.free
    }

    pub fn tag(&self) -> &'static str {
        match self.kind() {
            ExprKind::Reference { .. } => "reference",
            ExprKind::Lambda { .. } => "lambda",
            ExprKind::Call { .. } => "call",
            ExprKind::Block { .. } => "block",
            ExprKind::Struct { .. } => "struct",
            ExprKind::Selection { .. } => "selection",
            ExprKind::Data { .. } => "data",
            ExprKind::Intrinsic { .. } => "intrinsic",
            ExprKind::Compiled { .. } => "compiled",
            ExprKind::Placement { .. } => "placement",
        }
    }

    /// Child nodes in evaluation order.
    pub fn children(&self) -> Vec<Expr> {
        match self.kind() {
            ExprKind::Lambda { body, .. } => vec![body.clone()],
            ExprKind::Call { function, argument } => {
                let mut out = vec![function.clone()];
                out.extend(argument.iter().cloned());
                out
            }
            ExprKind::Block { locals, result } => {
                let mut out: Vec<Expr> = locals.iter().map(|(_, e)| e.clone()).collect();
                out.push(result.clone());
                out
            }
            ExprKind::Struct { elements } => elements.iter().map(|(_, e)| e.clone()).collect(),
            ExprKind::Selection { source, .. } => vec![source.clone()],
            ExprKind::Reference { .. }
            | ExprKind::Data { .. }
            | ExprKind::Intrinsic { .. }
            | ExprKind::Compiled { .. }
            | ExprKind::Placement { .. } => Vec::new(),
        }
    }

    /// Rebuild this node over new children, re-running validation.
    ///
    /// Returns `self` unchanged when every child is pointer-equal.
    pub fn with_children(&self, children: Vec<Expr>) -> Result<Expr> {
        let old = self.children();
        if old.len() != children.len() {
            return Err(CoreError::MalformedIr(format!(
                "{} node has {} children, got {}",
                self.tag(),
                old.len(),
                children.len()
            )));
        }
        if old.iter().zip(&children).all(|(a, b)| a.ptr_eq(b)) {
            return Ok(self.clone());
        }
        let mut it = children.into_iter();
        let mut next = || {
            it.next()
                .ok_or_else(|| CoreError::MalformedIr("child count changed".into()))
        };
        match self.kind() {
            ExprKind::Lambda { parameter, .. } => {
                let body = next()?;
                Expr::lambda(parameter.as_ref().map(|(n, t)| (n.as_str(), t.clone())), body)
            }
            ExprKind::Call { argument, .. } => {
                let function = next()?;
                let argument = match argument {
                    Some(_) => Some(next()?),
                    None => None,
                };
                Expr::call(function, argument)
            }
            ExprKind::Block { locals, .. } => {
                let mut new_locals = Vec::with_capacity(locals.len());
                for (name, _) in locals {
                    new_locals.push((name.clone(), next()?));
                }
                let result = next()?;
                Expr::block(new_locals, result)
            }
            ExprKind::Struct { elements } => {
                let mut out = Vec::with_capacity(elements.len());
                for (name, _) in elements {
                    out.push((name.clone(), next()?));
                }
                Expr::struct_of(out)
            }
            ExprKind::Selection { index, .. } => Expr::selection(next()?, *index),
            ExprKind::Reference { .. }
            | ExprKind::Data { .. }
            | ExprKind::Intrinsic { .. }
            | ExprKind::Compiled { .. }
            | ExprKind::Placement { .. } => Ok(self.clone()),
        }
    }

    /// Number of nodes in this tree.
    pub fn size(&self) -> usize {
        1 + self.children().iter().map(Expr::size).sum::<usize>()
    }

    pub fn as_reference(&self) -> Option<&str> {
        match self.kind() {
            ExprKind::Reference { name } => Some(name),
            _ => None,
        }
    }
}

/// Number of scalars in a fully-defined tensor/struct type.
fn scalar_count(ty: &Type) -> Result<usize> {
    let leaves = ty.tensor_leaves().ok_or_else(|| {
        CoreError::mismatch(format!("compiled payloads need fully defined tensors, got {ty}"))
    })?;
    Ok(leaves.iter().map(|l| l.num_elements()).sum())
}

fn structural_hash(kind: &ExprKind, ty: &Type) -> u64 {
    let mut h = DefaultHasher::new();
    std::mem::discriminant(kind).hash(&mut h);
    ty.hash(&mut h);
    match kind {
        ExprKind::Reference { name } => name.hash(&mut h),
        ExprKind::Lambda { parameter, body } => {
            parameter.hash(&mut h);
            body.hash(&mut h);
        }
        ExprKind::Call { function, argument } => {
            function.hash(&mut h);
            argument.hash(&mut h);
        }
        ExprKind::Block { locals, result } => {
            locals.hash(&mut h);
            result.hash(&mut h);
        }
        ExprKind::Struct { elements } => elements.hash(&mut h),
        ExprKind::Selection { source, index } => {
            source.hash(&mut h);
            index.hash(&mut h);
        }
        ExprKind::Data { value } => value.hash(&mut h),
        ExprKind::Intrinsic { intrinsic } => intrinsic.hash(&mut h),
        ExprKind::Compiled { kernel } => kernel.hash(&mut h),
        ExprKind::Placement { placement } => placement.hash(&mut h),
    }
    h.finish()
}

fn free_of(kind: &ExprKind) -> BTreeSet<String> {
    match kind {
        ExprKind::Reference { name } => BTreeSet::from([name.clone()]),
        ExprKind::Lambda { parameter, body } => {
            let mut free = body.free_references().clone();
            if let Some((name, _)) = parameter {
                free.remove(name);
            }
            free
        }
        ExprKind::Call { function, argument } => {
            let mut free = function.free_references().clone();
            if let Some(a) = argument {
                free.extend(a.free_references().iter().cloned());
            }
            free
        }
        ExprKind::Block { locals, result } => {
            // Walk backwards: each binding hides its name from everything after it.
            let mut free = result.free_references().clone();
            for (name, value) in locals.iter().rev() {
                free.remove(name);
                free.extend(value.free_references().iter().cloned());
            }
            free
        }
        ExprKind::Struct { elements } => elements
            .iter()
            .flat_map(|(_, e)| e.free_references().iter().cloned())
            .collect(),
        ExprKind::Selection { source, .. } => source.free_references().clone(),
        ExprKind::Data { .. }
        | ExprKind::Intrinsic { .. }
        | ExprKind::Compiled { .. }
        | ExprKind::Placement { .. } => BTreeSet::new(),
    }
}
