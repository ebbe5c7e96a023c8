//! Wire encoding for types, values and IR.
//!
//! `WireExpr` mirrors [`Expr`] with serde derives. Converting an `Expr` to
//! the wire form is total; the way back re-runs every constructor, so a
//! decoded tree is as well-typed as one built locally.
//!
//! Byte encodings are a single format-version byte followed by postcard.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::expr::{Expr, ExprKind};
use crate::intrinsics::Intrinsic;
use crate::kernel::{Kernel, KernelNode, NodeId};
use crate::types::{Placement, Type};
use crate::value::Value;

/// Format version byte. Incremented on breaking wire changes.
pub const WIRE_VERSION: u8 = 1;

/// Serializable kernel parts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireKernel {
    pub nodes: Vec<KernelNode>,
    pub outputs: Vec<NodeId>,
    pub n_inputs: u32,
}

impl WireKernel {
    pub fn from_kernel(kernel: &Kernel) -> Self {
        Self {
            nodes: kernel.nodes().to_vec(),
            outputs: kernel.outputs().to_vec(),
            n_inputs: kernel.num_inputs() as u32,
        }
    }

    pub fn to_kernel(&self) -> Result<Kernel> {
        Kernel::from_parts(self.nodes.clone(), self.outputs.clone(), self.n_inputs)
    }
}

/// Serializable mirror of [`Expr`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WireExpr {
    Reference {
        name: String,
        ty: Type,
    },
    Lambda {
        parameter: Option<(String, Type)>,
        body: Box<WireExpr>,
    },
    Call {
        function: Box<WireExpr>,
        argument: Option<Box<WireExpr>>,
    },
    Block {
        locals: Vec<(String, WireExpr)>,
        result: Box<WireExpr>,
    },
    Struct {
        elements: Vec<(Option<String>, WireExpr)>,
    },
    Selection {
        source: Box<WireExpr>,
        index: u32,
    },
    Data {
        value: Value,
        ty: Type,
    },
    Intrinsic {
        intrinsic: Intrinsic,
        ty: Type,
    },
    Compiled {
        kernel: WireKernel,
        ty: Type,
    },
    Placement {
        placement: Placement,
    },
}

impl From<&Expr> for WireExpr {
    fn from(expr: &Expr) -> Self {
        let ty = expr.type_signature().clone();
        match expr.kind() {
            ExprKind::Reference { name } => WireExpr::Reference {
                name: name.clone(),
                ty,
            },
            ExprKind::Lambda { parameter, body } => WireExpr::Lambda {
                parameter: parameter.clone(),
                body: Box::new(body.into()),
            },
            ExprKind::Call { function, argument } => WireExpr::Call {
                function: Box::new(function.into()),
                argument: argument.as_ref().map(|a| Box::new(a.into())),
            },
            ExprKind::Block { locals, result } => WireExpr::Block {
                locals: locals.iter().map(|(n, e)| (n.clone(), e.into())).collect(),
                result: Box::new(result.into()),
            },
            ExprKind::Struct { elements } => WireExpr::Struct {
                elements: elements.iter().map(|(n, e)| (n.clone(), e.into())).collect(),
            },
            ExprKind::Selection { source, index } => WireExpr::Selection {
                source: Box::new(source.into()),
                index: *index as u32,
            },
            ExprKind::Data { value } => WireExpr::Data {
                value: value.clone(),
                ty,
            },
            ExprKind::Intrinsic { intrinsic } => WireExpr::Intrinsic {
                intrinsic: *intrinsic,
                ty,
            },
            ExprKind::Compiled { kernel } => WireExpr::Compiled {
                kernel: WireKernel::from_kernel(kernel),
                ty,
            },
            ExprKind::Placement { placement } => WireExpr::Placement {
                placement: *placement,
            },
        }
    }
}

impl WireExpr {
    /// Rebuild the IR, validating every node.
    pub fn to_expr(&self) -> Result<Expr> {
        self.rebuild().map_err(|e| match e {
            CoreError::MalformedIr(_) => e,
            other => CoreError::MalformedIr(other.to_string()),
        })
    }

    fn rebuild(&self) -> Result<Expr> {
        match self {
            WireExpr::Reference { name, ty } => Expr::reference(name.clone(), ty.clone()),
            WireExpr::Lambda { parameter, body } => Expr::lambda(
                parameter.as_ref().map(|(n, t)| (n.as_str(), t.clone())),
                body.rebuild()?,
            ),
            WireExpr::Call { function, argument } => {
                let argument = match argument {
                    Some(a) => Some(a.rebuild()?),
                    None => None,
                };
                Expr::call(function.rebuild()?, argument)
            }
            WireExpr::Block { locals, result } => {
                let locals = locals
                    .iter()
                    .map(|(n, e)| Ok((n.clone(), e.rebuild()?)))
                    .collect::<Result<Vec<_>>>()?;
                Expr::block(locals, result.rebuild()?)
            }
            WireExpr::Struct { elements } => {
                let elements = elements
                    .iter()
                    .map(|(n, e)| Ok((n.clone(), e.rebuild()?)))
                    .collect::<Result<Vec<_>>>()?;
                Expr::struct_of(elements)
            }
            WireExpr::Selection { source, index } => {
                Expr::selection(source.rebuild()?, *index as usize)
            }
            WireExpr::Data { value, ty } => Expr::data(value.clone(), ty.clone()),
            WireExpr::Intrinsic { intrinsic, ty } => Expr::intrinsic(*intrinsic, ty.clone()),
            WireExpr::Compiled { kernel, ty } => Expr::compiled(kernel.to_kernel()?, ty.clone()),
            WireExpr::Placement { placement } => Ok(Expr::placement(*placement)),
        }
    }
}

/// A value or computation as it travels between processes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WirePayload {
    Value(Value),
    Computation(WireExpr),
}

fn encode<T: Serialize>(item: &T) -> std::result::Result<Vec<u8>, postcard::Error> {
    postcard::to_extend(item, vec![WIRE_VERSION])
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> std::result::Result<T, String> {
    match bytes.split_first() {
        Some((&WIRE_VERSION, body)) => {
            let (item, rest) = postcard::take_from_bytes::<T>(body).map_err(|e| e.to_string())?;
            if !rest.is_empty() {
                return Err(format!("{} trailing bytes", rest.len()));
            }
            Ok(item)
        }
        Some((v, _)) => Err(format!("unsupported wire version {v}")),
        None => Err("empty input".to_string()),
    }
}

/// Canonical bytes of a type.
pub fn serialize_type(ty: &Type) -> Result<Vec<u8>> {
    encode(ty).map_err(|e| CoreError::MalformedType(e.to_string()))
}

/// Decode a type, rejecting anything that does not re-encode to `bytes`.
pub fn deserialize_type(bytes: &[u8]) -> Result<Type> {
    let ty: Type = decode(bytes).map_err(CoreError::MalformedType)?;
    if serialize_type(&ty)? != bytes {
        return Err(CoreError::MalformedType("non-canonical encoding".into()));
    }
    Ok(ty)
}

pub fn serialize_value(value: &Value) -> Result<Vec<u8>> {
    Ok(encode(value)?)
}

pub fn deserialize_value(bytes: &[u8]) -> Result<Value> {
    decode(bytes).map_err(CoreError::MalformedIr)
}

pub fn serialize_expr(expr: &Expr) -> Result<Vec<u8>> {
    Ok(encode(&WireExpr::from(expr))?)
}

pub fn deserialize_expr(bytes: &[u8]) -> Result<Expr> {
    let wire: WireExpr = decode(bytes).map_err(CoreError::MalformedIr)?;
    wire.to_expr()
}

impl WirePayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(encode(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode(bytes).map_err(CoreError::MalformedIr)
    }
}
