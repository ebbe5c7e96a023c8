//! The fedra type system.
//!
//! Types are closed tagged variants compared structurally. A `Federated` type
//! additionally records the placement its members live at and whether all
//! members are guaranteed identical.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    Str,
}

impl DType {
    /// Short lowercase name used in type renderings.
    pub fn name(&self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Str => "string",
        }
    }

    /// Whether values of this dtype support addition.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DType::Int32 | DType::Int64 | DType::Float32 | DType::Float64
        )
    }

    /// Whether this is a floating point dtype.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::Float32 | DType::Float64)
    }
}

/// A logical execution location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Placement {
    Server,
    Clients,
}

impl Placement {
    /// Lowercase identifier used in configuration files.
    pub fn uri(&self) -> &'static str {
        match self {
            Placement::Server => "server",
            Placement::Clients => "clients",
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Server => write!(f, "SERVER"),
            Placement::Clients => write!(f, "CLIENTS"),
        }
    }
}

/// A fedra type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// Dense tensor. `None` dims are unknown.
    Tensor {
        dtype: DType,
        shape: Vec<Option<u64>>,
    },
    /// Ordered fields, optionally named.
    Struct(Vec<(Option<String>, Type)>),
    /// Function from an optional parameter to a result.
    Function {
        parameter: Option<Box<Type>>,
        result: Box<Type>,
    },
    /// Value distributed across the participants of one placement.
    Federated {
        member: Box<Type>,
        placement: Placement,
        all_equal: bool,
    },
    /// The type of placement literals.
    Placement,
}

/// Fully-defined tensor leaf of a type, as consumed by kernels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Vec<u64>,
}

impl TensorSpec {
    /// Number of scalar elements.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product::<u64>() as usize
    }
}

impl Type {
    /// A tensor with fully known dimensions.
    pub fn tensor(dtype: DType, shape: &[u64]) -> Self {
        Type::Tensor {
            dtype,
            shape: shape.iter().map(|&d| Some(d)).collect(),
        }
    }

    /// A tensor whose dimensions may be unknown.
    pub fn tensor_with_dims(dtype: DType, shape: Vec<Option<u64>>) -> Self {
        Type::Tensor { dtype, shape }
    }

    /// A rank-0 tensor.
    pub fn scalar(dtype: DType) -> Self {
        Type::Tensor {
            dtype,
            shape: Vec::new(),
        }
    }

    pub fn int32() -> Self {
        Self::scalar(DType::Int32)
    }

    pub fn float32() -> Self {
        Self::scalar(DType::Float32)
    }

    pub fn float64() -> Self {
        Self::scalar(DType::Float64)
    }

    pub fn bool() -> Self {
        Self::scalar(DType::Bool)
    }

    /// A struct with unnamed fields.
    pub fn struct_of(elements: Vec<Type>) -> Self {
        Type::Struct(elements.into_iter().map(|t| (None, t)).collect())
    }

    /// A struct with named fields.
    pub fn named_struct(elements: Vec<(&str, Type)>) -> Self {
        Type::Struct(
            elements
                .into_iter()
                .map(|(n, t)| (Some(n.to_string()), t))
                .collect(),
        )
    }

    pub fn function(parameter: Option<Type>, result: Type) -> Self {
        Type::Function {
            parameter: parameter.map(Box::new),
            result: Box::new(result),
        }
    }

    pub fn federated(member: Type, placement: Placement, all_equal: bool) -> Self {
        Type::Federated {
            member: Box::new(member),
            placement,
            all_equal,
        }
    }

    /// `T@SERVER`. Server values always have a single member.
    pub fn at_server(member: Type) -> Self {
        Self::federated(member, Placement::Server, true)
    }

    /// `{T}@CLIENTS`.
    pub fn at_clients(member: Type) -> Self {
        Self::federated(member, Placement::Clients, false)
    }

    /// `T@CLIENTS`, all members identical.
    pub fn at_clients_all_equal(member: Type) -> Self {
        Self::federated(member, Placement::Clients, true)
    }

    pub fn placement() -> Self {
        Type::Placement
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Type::Function { .. })
    }

    pub fn is_federated(&self) -> bool {
        matches!(self, Type::Federated { .. })
    }

    pub fn as_struct(&self) -> Option<&[(Option<String>, Type)]> {
        match self {
            Type::Struct(elements) => Some(elements),
            _ => None,
        }
    }

    /// `(parameter, result)` of a function type.
    pub fn as_function(&self) -> Option<(Option<&Type>, &Type)> {
        match self {
            Type::Function { parameter, result } => Some((parameter.as_deref(), result)),
            _ => None,
        }
    }

    /// `(member, placement, all_equal)` of a federated type.
    pub fn as_federated(&self) -> Option<(&Type, Placement, bool)> {
        match self {
            Type::Federated {
                member,
                placement,
                all_equal,
            } => Some((member, *placement, *all_equal)),
            _ => None,
        }
    }

    /// Position of a named struct field.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.as_struct()?
            .iter()
            .position(|(n, _)| n.as_deref() == Some(name))
    }

    /// Whether any part of this type is federated.
    pub fn contains_federated(&self) -> bool {
        match self {
            Type::Federated { .. } => true,
            Type::Struct(elements) => elements.iter().any(|(_, t)| t.contains_federated()),
            Type::Function { parameter, result } => {
                parameter.as_ref().is_some_and(|p| p.contains_federated())
                    || result.contains_federated()
            }
            Type::Tensor { .. } | Type::Placement => false,
        }
    }

    /// The type sums of this float member type accumulate in.
    ///
    /// Defined for tensor/struct types with known dimensions whose leaves are
    /// all floats and include a float32. Every float32 leaf becomes float64.
    pub fn accumulator(&self) -> Option<Type> {
        let leaves = self.tensor_leaves()?;
        let all_float = leaves.iter().all(|l| l.dtype.is_float());
        let any_narrow = leaves.iter().any(|l| l.dtype == DType::Float32);
        (all_float && any_narrow).then(|| self.widened())
    }

    fn widened(&self) -> Type {
        match self {
            Type::Tensor {
                dtype: DType::Float32,
                shape,
            } => Type::Tensor {
                dtype: DType::Float64,
                shape: shape.clone(),
            },
            Type::Struct(elements) => Type::Struct(
                elements
                    .iter()
                    .map(|(n, t)| (n.clone(), t.widened()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Flatten a tensor/struct type into its tensor leaves, depth first.
    ///
    /// Returns `None` if the type contains anything other than tensors and
    /// structs, or a tensor dimension is unknown.
    pub fn tensor_leaves(&self) -> Option<Vec<TensorSpec>> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out)?;
        Some(out)
    }

    fn collect_leaves(&self, out: &mut Vec<TensorSpec>) -> Option<()> {
        match self {
            Type::Tensor { dtype, shape } => {
                let shape = shape.iter().copied().collect::<Option<Vec<u64>>>()?;
                out.push(TensorSpec {
                    dtype: *dtype,
                    shape,
                });
                Some(())
            }
            Type::Struct(elements) => {
                for (_, t) in elements {
                    t.collect_leaves(out)?;
                }
                Some(())
            }
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Tensor { dtype, shape } => {
                write!(f, "{}", dtype.name())?;
                if !shape.is_empty() {
                    write!(f, "[")?;
                    for (i, d) in shape.iter().enumerate() {
                        if i > 0 {
                            write!(f, ",")?;
                        }
                        match d {
                            Some(d) => write!(f, "{d}")?,
                            None => write!(f, "?")?,
                        }
                    }
                    write!(f, "]")?;
                }
                Ok(())
            }
            Type::Struct(elements) => {
                write!(f, "<")?;
                for (i, (name, t)) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    if let Some(name) = name {
                        write!(f, "{name}=")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, ">")
            }
            Type::Function { parameter, result } => match parameter {
                Some(p) => write!(f, "({p} -> {result})"),
                None => write!(f, "( -> {result})"),
            },
            Type::Federated {
                member,
                placement,
                all_equal,
            } => {
                if *all_equal {
                    write!(f, "{member}@{placement}")
                } else {
                    write!(f, "{{{member}}}@{placement}")
                }
            }
            Type::Placement => write!(f, "placement"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_forms() {
        assert_eq!(Type::int32().to_string(), "int32");
        assert_eq!(Type::tensor(DType::Float32, &[2, 3]).to_string(), "float32[2,3]");
        assert_eq!(
            Type::tensor_with_dims(DType::Int64, vec![None, Some(4)]).to_string(),
            "int64[?,4]"
        );
        assert_eq!(
            Type::named_struct(vec![("a", Type::int32()), ("b", Type::bool())]).to_string(),
            "<a=int32,b=bool>"
        );
        assert_eq!(
            Type::function(Some(Type::int32()), Type::bool()).to_string(),
            "(int32 -> bool)"
        );
        assert_eq!(Type::function(None, Type::bool()).to_string(), "( -> bool)");
        assert_eq!(Type::at_clients(Type::int32()).to_string(), "{int32}@CLIENTS");
        assert_eq!(Type::at_server(Type::int32()).to_string(), "int32@SERVER");
        assert_eq!(Type::placement().to_string(), "placement");
    }

    #[test]
    fn structural_equality() {
        let a = Type::at_clients(Type::struct_of(vec![Type::int32(), Type::float32()]));
        let b = Type::at_clients(Type::struct_of(vec![Type::int32(), Type::float32()]));
        assert_eq!(a, b);
        // all_equal participates in equality
        let c = Type::at_clients_all_equal(Type::struct_of(vec![Type::int32(), Type::float32()]));
        assert_ne!(a, c);
    }

    #[test]
    fn tensor_leaves_flatten_structs() {
        let t = Type::struct_of(vec![
            Type::int32(),
            Type::named_struct(vec![("w", Type::tensor(DType::Float32, &[2]))]),
        ]);
        let leaves = t.tensor_leaves().unwrap();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[1].num_elements(), 2);

        let unknown = Type::tensor_with_dims(DType::Float32, vec![None]);
        assert!(unknown.tensor_leaves().is_none());
        assert!(Type::at_server(Type::int32()).tensor_leaves().is_none());
    }

    #[test]
    fn float_members_accumulate_wide() {
        let member = Type::named_struct(vec![
            ("w", Type::tensor(DType::Float32, &[2])),
            ("b", Type::float64()),
        ]);
        assert_eq!(
            member.accumulator(),
            Some(Type::named_struct(vec![
                ("w", Type::tensor(DType::Float64, &[2])),
                ("b", Type::float64()),
            ]))
        );
        assert_eq!(Type::float64().accumulator(), None);
        assert_eq!(Type::int32().accumulator(), None);
        assert_eq!(
            Type::struct_of(vec![Type::float32(), Type::int32()]).accumulator(),
            None
        );
        assert_eq!(
            Type::tensor_with_dims(DType::Float32, vec![None]).accumulator(),
            None
        );
    }

    #[test]
    fn field_lookup() {
        let t = Type::named_struct(vec![("a", Type::int32()), ("b", Type::bool())]);
        assert_eq!(t.field_index("b"), Some(1));
        assert_eq!(t.field_index("z"), None);
        assert_eq!(Type::int32().field_index("a"), None);
    }
}
