//! Realized values: dense tensors, structs and federated member lists.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::types::{DType, Type};

/// Flat, row-major tensor storage, one vector per dtype.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    Bool(Vec<bool>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Str(Vec<String>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::Bool(_) => DType::Bool,
            TensorData::Int32(_) => DType::Int32,
            TensorData::Int64(_) => DType::Int64,
            TensorData::Float32(_) => DType::Float32,
            TensorData::Float64(_) => DType::Float64,
            TensorData::Str(_) => DType::Str,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::Bool(v) => v.len(),
            TensorData::Int32(v) => v.len(),
            TensorData::Int64(v) => v.len(),
            TensorData::Float32(v) => v.len(),
            TensorData::Float64(v) => v.len(),
            TensorData::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Floats hash by bit pattern so Data nodes get a stable structural hash.
impl Hash for TensorData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            TensorData::Bool(v) => v.hash(state),
            TensorData::Int32(v) => v.hash(state),
            TensorData::Int64(v) => v.hash(state),
            TensorData::Float32(v) => v.iter().for_each(|x| x.to_bits().hash(state)),
            TensorData::Float64(v) => v.iter().for_each(|x| x.to_bits().hash(state)),
            TensorData::Str(v) => v.hash(state),
        }
    }
}

/// A dense tensor with a fully known shape.
#[derive(Clone, Debug, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    shape: Vec<u64>,
    data: TensorData,
}

/// Decoded tensor fields, checked by [`Tensor::new`] before use.
#[derive(Deserialize)]
struct RawTensor {
    shape: Vec<u64>,
    data: TensorData,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = CoreError;

    fn try_from(raw: RawTensor) -> Result<Self> {
        Tensor::new(raw.shape, raw.data)
    }
}

impl Tensor {
    /// Build a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<u64>, data: TensorData) -> Result<Self> {
        let expected = shape
            .iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| CoreError::mismatch(format!("shape {shape:?} is too large")))?;
        if usize::try_from(expected).ok() != Some(data.len()) {
            return Err(CoreError::mismatch(format!(
                "shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    fn scalar(data: TensorData) -> Self {
        Self {
            shape: Vec::new(),
            data,
        }
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The exact type of this tensor.
    pub fn type_signature(&self) -> Type {
        Type::tensor(self.dtype(), &self.shape)
    }

    /// Numeric contents widened to `f64`, or `None` for bool/string tensors.
    pub fn to_f64s(&self) -> Option<Vec<f64>> {
        match &self.data {
            TensorData::Int32(v) => Some(v.iter().map(|&x| x as f64).collect()),
            TensorData::Int64(v) => Some(v.iter().map(|&x| x as f64).collect()),
            TensorData::Float32(v) => Some(v.iter().map(|&x| x as f64).collect()),
            TensorData::Float64(v) => Some(v.clone()),
            TensorData::Bool(v) => Some(v.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect()),
            TensorData::Str(_) => None,
        }
    }

    /// Narrow `f64` values back into a tensor of the given dtype and shape.
    pub fn from_f64s(dtype: DType, shape: Vec<u64>, values: &[f64]) -> Result<Self> {
        let data = match dtype {
            DType::Int32 => TensorData::Int32(values.iter().map(|&x| x as i32).collect()),
            DType::Int64 => TensorData::Int64(values.iter().map(|&x| x as i64).collect()),
            DType::Float32 => TensorData::Float32(values.iter().map(|&x| x as f32).collect()),
            DType::Float64 => TensorData::Float64(values.to_vec()),
            DType::Bool => TensorData::Bool(values.iter().map(|&x| x > 0.0).collect()),
            DType::Str => {
                return Err(CoreError::mismatch("cannot build a string tensor from numbers"))
            }
        };
        Self::new(shape, data)
    }

    fn add(&self, other: &Tensor) -> Result<Tensor> {
        if self.shape != other.shape {
            return Err(CoreError::mismatch(format!(
                "cannot add shapes {:?} and {:?}",
                self.shape, other.shape
            )));
        }
        let data = match (&self.data, &other.data) {
            (TensorData::Int32(a), TensorData::Int32(b)) => {
                TensorData::Int32(a.iter().zip(b).map(|(x, y)| x.wrapping_add(*y)).collect())
            }
            (TensorData::Int64(a), TensorData::Int64(b)) => {
                TensorData::Int64(a.iter().zip(b).map(|(x, y)| x.wrapping_add(*y)).collect())
            }
            (TensorData::Float32(a), TensorData::Float32(b)) => {
                TensorData::Float32(a.iter().zip(b).map(|(x, y)| x + y).collect())
            }
            (TensorData::Float64(a), TensorData::Float64(b)) => {
                TensorData::Float64(a.iter().zip(b).map(|(x, y)| x + y).collect())
            }
            (a, b) => {
                return Err(CoreError::mismatch(format!(
                    "cannot add {} and {} tensors",
                    a.dtype().name(),
                    b.dtype().name()
                )))
            }
        };
        Ok(Tensor {
            shape: self.shape.clone(),
            data,
        })
    }

    fn scale(&self, factor: f64) -> Result<Tensor> {
        let data = match &self.data {
            TensorData::Float32(v) => {
                TensorData::Float32(v.iter().map(|x| (*x as f64 * factor) as f32).collect())
            }
            TensorData::Float64(v) => TensorData::Float64(v.iter().map(|x| x * factor).collect()),
            other => {
                return Err(CoreError::mismatch(format!(
                    "cannot scale a {} tensor",
                    other.dtype().name()
                )))
            }
        };
        Ok(Tensor {
            shape: self.shape.clone(),
            data,
        })
    }
}

/// A realized value.
#[derive(Clone, Debug, PartialEq, Hash, Serialize, Deserialize)]
pub enum Value {
    Tensor(Tensor),
    Struct(Vec<(Option<String>, Value)>),
    /// One member per participant of a placement.
    Federated(Vec<Value>),
}

impl Value {
    pub fn int32(v: i32) -> Self {
        Value::Tensor(Tensor::scalar(TensorData::Int32(vec![v])))
    }

    pub fn int64(v: i64) -> Self {
        Value::Tensor(Tensor::scalar(TensorData::Int64(vec![v])))
    }

    pub fn float32(v: f32) -> Self {
        Value::Tensor(Tensor::scalar(TensorData::Float32(vec![v])))
    }

    pub fn float64(v: f64) -> Self {
        Value::Tensor(Tensor::scalar(TensorData::Float64(vec![v])))
    }

    pub fn bool(v: bool) -> Self {
        Value::Tensor(Tensor::scalar(TensorData::Bool(vec![v])))
    }

    pub fn string(v: impl Into<String>) -> Self {
        Value::Tensor(Tensor::scalar(TensorData::Str(vec![v.into()])))
    }

    /// A rank-1 float32 tensor.
    pub fn float32_vec(v: Vec<f32>) -> Self {
        Value::Tensor(Tensor {
            shape: vec![v.len() as u64],
            data: TensorData::Float32(v),
        })
    }

    /// An unnamed struct.
    pub fn struct_of(elements: Vec<Value>) -> Self {
        Value::Struct(elements.into_iter().map(|v| (None, v)).collect())
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&[(Option<String>, Value)]> {
        match self {
            Value::Struct(elements) => Some(elements),
            _ => None,
        }
    }

    pub fn as_federated(&self) -> Option<&[Value]> {
        match self {
            Value::Federated(members) => Some(members),
            _ => None,
        }
    }

    /// The most specific type of a non-federated value.
    ///
    /// Federated values carry no placement, so they have no inferable type.
    pub fn type_hint(&self) -> Option<Type> {
        match self {
            Value::Tensor(t) => Some(t.type_signature()),
            Value::Struct(elements) => {
                let mut out = Vec::with_capacity(elements.len());
                for (name, v) in elements {
                    out.push((name.clone(), v.type_hint()?));
                }
                Some(Type::Struct(out))
            }
            Value::Federated(_) => None,
        }
    }

    /// Whether this value is a valid inhabitant of `ty`.
    pub fn conforms_to(&self, ty: &Type) -> bool {
        match (self, ty) {
            (Value::Tensor(t), Type::Tensor { dtype, shape }) => {
                t.dtype() == *dtype
                    && t.shape().len() == shape.len()
                    && t
                        .shape()
                        .iter()
                        .zip(shape)
                        .all(|(actual, declared)| declared.map_or(true, |d| d == *actual))
            }
            (Value::Struct(values), Type::Struct(types)) => {
                values.len() == types.len()
                    && values.iter().zip(types).all(|((vn, v), (tn, t))| {
                        (tn.is_none() || vn == tn) && v.conforms_to(t)
                    })
            }
            (Value::Federated(members), Type::Federated { member, all_equal, .. }) => {
                let equal_ok = !*all_equal || members.windows(2).all(|w| w[0] == w[1]);
                equal_ok && members.iter().all(|m| m.conforms_to(member))
            }
            _ => false,
        }
    }

    /// Elementwise sum of two values of the same structure.
    pub fn add(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Tensor(a), Value::Tensor(b)) => Ok(Value::Tensor(a.add(b)?)),
            (Value::Struct(a), Value::Struct(b)) if a.len() == b.len() => {
                let mut out = Vec::with_capacity(a.len());
                for ((name, x), (_, y)) in a.iter().zip(b) {
                    out.push((name.clone(), x.add(y)?));
                }
                Ok(Value::Struct(out))
            }
            _ => Err(CoreError::mismatch("values have different structure")),
        }
    }

    /// Multiply every float leaf by `factor`.
    pub fn scale(&self, factor: f64) -> Result<Value> {
        match self {
            Value::Tensor(t) => Ok(Value::Tensor(t.scale(factor)?)),
            Value::Struct(elements) => {
                let mut out = Vec::with_capacity(elements.len());
                for (name, v) in elements {
                    out.push((name.clone(), v.scale(factor)?));
                }
                Ok(Value::Struct(out))
            }
            Value::Federated(_) => Err(CoreError::mismatch("cannot scale a federated value")),
        }
    }

    /// Convert tensor leaves to the dtypes `ty` gives them.
    ///
    /// Conversion goes through `f64`, so it is exact for float widening and
    /// rounds to nearest when narrowing float64 to float32.
    pub fn cast_to(&self, ty: &Type) -> Result<Value> {
        match (self, ty) {
            (Value::Tensor(t), Type::Tensor { dtype, .. }) if t.dtype() == *dtype => {
                Ok(self.clone())
            }
            (Value::Tensor(t), Type::Tensor { dtype, .. }) => {
                let values = t.to_f64s().ok_or_else(|| {
                    CoreError::mismatch(format!("cannot cast a {} tensor", t.dtype().name()))
                })?;
                Ok(Value::Tensor(Tensor::from_f64s(*dtype, t.shape.clone(), &values)?))
            }
            (Value::Struct(values), Type::Struct(types)) if values.len() == types.len() => {
                let mut out = Vec::with_capacity(values.len());
                for ((name, v), (_, t)) in values.iter().zip(types) {
                    out.push((name.clone(), v.cast_to(t)?));
                }
                Ok(Value::Struct(out))
            }
            _ => Err(CoreError::mismatch(format!("cannot cast value to {ty}"))),
        }
    }

    /// The additive identity of a numeric type with known dimensions.
    pub fn zero(ty: &Type) -> Result<Value> {
        match ty {
            Type::Tensor { dtype, shape } if dtype.is_numeric() => {
                let shape = shape
                    .iter()
                    .copied()
                    .collect::<Option<Vec<u64>>>()
                    .ok_or_else(|| CoreError::mismatch(format!("{ty} has unknown dimensions")))?;
                let n = shape
                    .iter()
                    .try_fold(1usize, |acc, &d| acc.checked_mul(usize::try_from(d).ok()?))
                    .ok_or_else(|| CoreError::mismatch(format!("{ty} is too large")))?;
                Ok(Value::Tensor(Tensor::from_f64s(*dtype, shape, &vec![0.0; n])?))
            }
            Type::Struct(elements) => {
                let mut out = Vec::with_capacity(elements.len());
                for (name, t) in elements {
                    out.push((name.clone(), Value::zero(t)?));
                }
                Ok(Value::Struct(out))
            }
            _ => Err(CoreError::mismatch(format!("{ty} has no zero value"))),
        }
    }

    /// Sum a non-empty list of values.
    pub fn sum<'a>(values: impl IntoIterator<Item = &'a Value>) -> Result<Value> {
        let mut iter = values.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| CoreError::mismatch("cannot sum zero values"))?;
        iter.try_fold(first.clone(), |acc, v| acc.add(v))
    }

    /// Tensor leaves, depth first.
    pub fn tensor_leaves(&self) -> Vec<&Tensor> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        match self {
            Value::Tensor(t) => out.push(t),
            Value::Struct(elements) => elements.iter().for_each(|(_, v)| v.collect_leaves(out)),
            Value::Federated(members) => members.iter().for_each(|v| v.collect_leaves(out)),
        }
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Value::Tensor(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_shape_checked() {
        assert!(Tensor::new(vec![2, 2], TensorData::Int32(vec![1, 2, 3, 4])).is_ok());
        let err = Tensor::new(vec![3], TensorData::Int32(vec![1])).unwrap_err();
        assert!(matches!(err, CoreError::TypeMismatch(_)));
    }

    #[test]
    fn conformance() {
        assert!(Value::int32(3).conforms_to(&Type::int32()));
        assert!(!Value::int32(3).conforms_to(&Type::float32()));

        let v = Value::float32_vec(vec![1.0, 2.0]);
        assert!(v.conforms_to(&Type::tensor_with_dims(DType::Float32, vec![None])));
        assert!(!v.conforms_to(&Type::tensor(DType::Float32, &[3])));

        let fed = Value::Federated(vec![Value::int32(1), Value::int32(2)]);
        assert!(fed.conforms_to(&Type::at_clients(Type::int32())));
        assert!(!fed.conforms_to(&Type::at_clients_all_equal(Type::int32())));

        let named = Value::Struct(vec![(Some("a".into()), Value::int32(1))]);
        assert!(named.conforms_to(&Type::named_struct(vec![("a", Type::int32())])));
        assert!(!named.conforms_to(&Type::named_struct(vec![("b", Type::int32())])));
    }

    #[test]
    fn add_and_sum() {
        let s = Value::sum(&[Value::int32(2), Value::int32(5), Value::int32(7)]).unwrap();
        assert_eq!(s, Value::int32(14));

        let a = Value::struct_of(vec![Value::float32(1.0), Value::int32(1)]);
        let b = Value::struct_of(vec![Value::float32(0.5), Value::int32(2)]);
        assert_eq!(
            a.add(&b).unwrap(),
            Value::struct_of(vec![Value::float32(1.5), Value::int32(3)])
        );

        assert!(Value::int32(1).add(&Value::float32(1.0)).is_err());
        assert!(Value::sum(std::iter::empty()).is_err());
    }

    #[test]
    fn oversized_shapes_are_rejected() {
        let err = Tensor::new(vec![u64::MAX, 2], TensorData::Int32(vec![])).unwrap_err();
        assert!(matches!(err, CoreError::TypeMismatch(_)));
    }

    /// Same wire layout as `Tensor` and `Value::Tensor`, without the checks.
    #[derive(Serialize)]
    struct UncheckedTensor {
        shape: Vec<u64>,
        data: TensorData,
    }

    #[derive(Serialize)]
    enum UncheckedValue {
        Tensor(UncheckedTensor),
    }

    #[test]
    fn decoding_checks_the_shape() {
        let good = Tensor::new(vec![2], TensorData::Int32(vec![1, 2])).unwrap();
        let bytes = postcard::to_allocvec(&good).unwrap();
        assert_eq!(postcard::from_bytes::<Tensor>(&bytes).unwrap(), good);

        let bad = || UncheckedTensor {
            shape: vec![3],
            data: TensorData::Int32(vec![1]),
        };
        let bytes = postcard::to_allocvec(&bad()).unwrap();
        assert!(postcard::from_bytes::<Tensor>(&bytes).is_err());
        let bytes = postcard::to_allocvec(&UncheckedValue::Tensor(bad())).unwrap();
        assert!(postcard::from_bytes::<Value>(&bytes).is_err());
    }

    #[test]
    fn cast_widens_and_narrows_float_leaves() {
        let v = Value::struct_of(vec![Value::float32(0.1), Value::int32(3)]);
        let wide = Type::struct_of(vec![Type::float64(), Type::int32()]);
        let widened = v.cast_to(&wide).unwrap();
        assert_eq!(
            widened,
            Value::struct_of(vec![Value::float64(0.1f32 as f64), Value::int32(3)])
        );
        let narrow = Type::struct_of(vec![Type::float32(), Type::int32()]);
        assert_eq!(widened.cast_to(&narrow).unwrap(), v);
        assert!(Value::string("x").cast_to(&Type::float32()).is_err());
    }

    #[test]
    fn zero_values() {
        assert_eq!(Value::zero(&Type::int32()).unwrap(), Value::int32(0));
        assert_eq!(
            Value::zero(&Type::tensor(DType::Float32, &[2])).unwrap(),
            Value::float32_vec(vec![0.0, 0.0])
        );
        assert!(Value::zero(&Type::tensor_with_dims(DType::Float32, vec![None])).is_err());
        assert!(Value::zero(&Type::scalar(DType::Str)).is_err());
    }

    #[test]
    fn scale_is_float_only() {
        assert_eq!(Value::float32(3.0).scale(0.5).unwrap(), Value::float32(1.5));
        assert!(Value::int32(3).scale(0.5).is_err());
    }

    #[test]
    fn type_hint_of_struct() {
        let v = Value::Struct(vec![
            (Some("x".into()), Value::int32(1)),
            (None, Value::float32_vec(vec![0.0; 3])),
        ]);
        assert_eq!(
            v.type_hint().unwrap().to_string(),
            "<x=int32,float32[3]>"
        );
        assert!(Value::Federated(vec![]).type_hint().is_none());
    }

    #[test]
    fn f64_roundtrip_through_dtype() {
        let t = Tensor::from_f64s(DType::Int32, vec![2], &[1.0, 4.0]).unwrap();
        assert_eq!(t.to_f64s().unwrap(), vec![1.0, 4.0]);
        assert!(Tensor::from_f64s(DType::Str, vec![], &[]).is_err());
    }
}
