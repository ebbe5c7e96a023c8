//! Federated intrinsics: the closed set of placement-aware primitives.
//!
//! Every intrinsic is polymorphic. [`Intrinsic::result_type`] instantiates
//! its signature for a concrete parameter type, and the `federated_*` helpers
//! build the corresponding `Call(Intrinsic, argument)` node.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::expr::Expr;
use crate::types::{DType, Placement, Type};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Intrinsic {
    FederatedValueAtServer,
    FederatedValueAtClients,
    FederatedBroadcast,
    FederatedMap,
    FederatedMapAllEqual,
    FederatedApply,
    FederatedEvalAtServer,
    FederatedEvalAtClients,
    FederatedZipAtServer,
    FederatedZipAtClients,
    FederatedSum,
    FederatedMean,
    FederatedAggregate,
}

impl Intrinsic {
    pub const ALL: [Intrinsic; 13] = [
        Intrinsic::FederatedValueAtServer,
        Intrinsic::FederatedValueAtClients,
        Intrinsic::FederatedBroadcast,
        Intrinsic::FederatedMap,
        Intrinsic::FederatedMapAllEqual,
        Intrinsic::FederatedApply,
        Intrinsic::FederatedEvalAtServer,
        Intrinsic::FederatedEvalAtClients,
        Intrinsic::FederatedZipAtServer,
        Intrinsic::FederatedZipAtClients,
        Intrinsic::FederatedSum,
        Intrinsic::FederatedMean,
        Intrinsic::FederatedAggregate,
    ];

    pub fn uri(&self) -> &'static str {
        match self {
            Intrinsic::FederatedValueAtServer => "federated_value_at_server",
            Intrinsic::FederatedValueAtClients => "federated_value_at_clients",
            Intrinsic::FederatedBroadcast => "federated_broadcast",
            Intrinsic::FederatedMap => "federated_map",
            Intrinsic::FederatedMapAllEqual => "federated_map_all_equal",
            Intrinsic::FederatedApply => "federated_apply",
            Intrinsic::FederatedEvalAtServer => "federated_eval_at_server",
            Intrinsic::FederatedEvalAtClients => "federated_eval_at_clients",
            Intrinsic::FederatedZipAtServer => "federated_zip_at_server",
            Intrinsic::FederatedZipAtClients => "federated_zip_at_clients",
            Intrinsic::FederatedSum => "federated_sum",
            Intrinsic::FederatedMean => "federated_mean",
            Intrinsic::FederatedAggregate => "federated_aggregate",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|i| i.uri() == uri)
    }

    /// Whether this intrinsic reduces client values into one server value.
    pub fn is_aggregation(&self) -> bool {
        matches!(
            self,
            Intrinsic::FederatedSum | Intrinsic::FederatedMean | Intrinsic::FederatedAggregate
        )
    }

    /// Instantiate the signature for `parameter`, returning the result type.
    pub fn result_type(&self, parameter: Option<&Type>) -> Result<Type> {
        let param = parameter.ok_or_else(|| {
            CoreError::mismatch(format!("{} requires an argument", self.uri()))
        })?;
        match self {
            Intrinsic::FederatedValueAtServer => {
                unplaced(self, param)?;
                Ok(Type::at_server(param.clone()))
            }
            Intrinsic::FederatedValueAtClients => {
                unplaced(self, param)?;
                Ok(Type::at_clients_all_equal(param.clone()))
            }
            Intrinsic::FederatedBroadcast => {
                let (member, _) = placed(self, param, Placement::Server)?;
                Ok(Type::at_clients_all_equal(member.clone()))
            }
            Intrinsic::FederatedMap => {
                let (function, value) = pair(self, param)?;
                let (member, _) = placed(self, value, Placement::Clients)?;
                Ok(Type::at_clients(apply_fn(self, function, member)?))
            }
            Intrinsic::FederatedMapAllEqual => {
                let (function, value) = pair(self, param)?;
                let (member, all_equal) = placed(self, value, Placement::Clients)?;
                if !all_equal {
                    return Err(CoreError::mismatch(format!(
                        "{} needs an all-equal argument, got {value}",
                        self.uri()
                    )));
                }
                Ok(Type::at_clients_all_equal(apply_fn(self, function, member)?))
            }
            Intrinsic::FederatedApply => {
                let (function, value) = pair(self, param)?;
                let (member, _) = placed(self, value, Placement::Server)?;
                Ok(Type::at_server(apply_fn(self, function, member)?))
            }
            Intrinsic::FederatedEvalAtServer | Intrinsic::FederatedEvalAtClients => {
                let result = match param.as_function() {
                    Some((None, result)) => result.clone(),
                    _ => {
                        return Err(CoreError::mismatch(format!(
                            "{} expects a no-argument function, got {param}",
                            self.uri()
                        )))
                    }
                };
                unplaced(self, &result)?;
                Ok(if *self == Intrinsic::FederatedEvalAtServer {
                    Type::at_server(result)
                } else {
                    Type::at_clients(result)
                })
            }
            Intrinsic::FederatedZipAtServer | Intrinsic::FederatedZipAtClients => {
                let target = if *self == Intrinsic::FederatedZipAtServer {
                    Placement::Server
                } else {
                    Placement::Clients
                };
                let elements = param.as_struct().filter(|e| !e.is_empty()).ok_or_else(|| {
                    CoreError::mismatch(format!("{} expects a non-empty struct, got {param}", self.uri()))
                })?;
                let mut members = Vec::with_capacity(elements.len());
                for (name, t) in elements {
                    let (member, _) = placed(self, t, target)?;
                    members.push((name.clone(), member.clone()));
                }
                Ok(match target {
                    Placement::Server => Type::at_server(Type::Struct(members)),
                    Placement::Clients => Type::at_clients(Type::Struct(members)),
                })
            }
            Intrinsic::FederatedSum => {
                let (member, _) = placed(self, param, Placement::Clients)?;
                if !leaves_all(member, &|d| d.is_numeric()) {
                    return Err(CoreError::mismatch(format!(
                        "federated_sum needs numeric members, got {member}"
                    )));
                }
                Ok(Type::at_server(member.clone()))
            }
            Intrinsic::FederatedMean => {
                let (member, _) = placed(self, param, Placement::Clients)?;
                if !leaves_all(member, &|d| d.is_float()) {
                    return Err(CoreError::mismatch(format!(
                        "federated_mean needs floating point members, got {member}"
                    )));
                }
                Ok(Type::at_server(member.clone()))
            }
            Intrinsic::FederatedAggregate => {
                let elements = param.as_struct().filter(|e| e.len() == 5).ok_or_else(|| {
                    CoreError::mismatch(format!(
                        "federated_aggregate expects <value,zero,accumulate,merge,report>, got {param}"
                    ))
                })?;
                let (member, _) = placed(self, &elements[0].1, Placement::Clients)?;
                let zero = &elements[1].1;
                unplaced(self, zero)?;
                let acc_in = Type::struct_of(vec![zero.clone(), member.clone()]);
                if apply_fn(self, &elements[2].1, &acc_in)? != *zero {
                    return Err(CoreError::mismatch("accumulate must return the zero type"));
                }
                let merge_in = Type::struct_of(vec![zero.clone(), zero.clone()]);
                if apply_fn(self, &elements[3].1, &merge_in)? != *zero {
                    return Err(CoreError::mismatch("merge must return the zero type"));
                }
                let report = apply_fn(self, &elements[4].1, zero)?;
                Ok(Type::at_server(report))
            }
        }
    }

    /// The full function type of this intrinsic applied to `parameter`.
    pub fn function_type(&self, parameter: &Type) -> Result<Type> {
        let result = self.result_type(Some(parameter))?;
        Ok(Type::function(Some(parameter.clone()), result))
    }

    /// Check that `ty` is a valid instantiation of this intrinsic.
    pub fn check_type(&self, ty: &Type) -> Result<()> {
        let (parameter, result) = ty.as_function().ok_or_else(|| {
            CoreError::mismatch(format!("{} must have a function type, got {ty}", self.uri()))
        })?;
        let expected = self.result_type(parameter)?;
        if expected != *result {
            return Err(CoreError::mismatch(format!(
                "{} instantiated as {ty}, but the argument implies result {expected}",
                self.uri()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Intrinsic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri())
    }
}

fn unplaced(intrinsic: &Intrinsic, ty: &Type) -> Result<()> {
    if ty.contains_federated() {
        return Err(CoreError::PlacementMismatch(format!(
            "{} expects an unplaced value, got {ty}",
            intrinsic.uri()
        )));
    }
    Ok(())
}

fn placed<'a>(intrinsic: &Intrinsic, ty: &'a Type, want: Placement) -> Result<(&'a Type, bool)> {
    match ty.as_federated() {
        Some((member, placement, all_equal)) if placement == want => Ok((member, all_equal)),
        Some(_) => Err(CoreError::PlacementMismatch(format!(
            "{} expects a value at {want}, got {ty}",
            intrinsic.uri()
        ))),
        None => Err(CoreError::mismatch(format!(
            "{} expects a federated value at {want}, got {ty}",
            intrinsic.uri()
        ))),
    }
}

fn pair<'a>(intrinsic: &Intrinsic, ty: &'a Type) -> Result<(&'a Type, &'a Type)> {
    match ty.as_struct() {
        Some([(_, a), (_, b)]) => Ok((a, b)),
        _ => Err(CoreError::mismatch(format!(
            "{} expects a <function,value> pair, got {ty}",
            intrinsic.uri()
        ))),
    }
}

/// Result type of calling `function` on `argument`.
fn apply_fn(intrinsic: &Intrinsic, function: &Type, argument: &Type) -> Result<Type> {
    match function.as_function() {
        Some((Some(p), r)) if p == argument => Ok(r.clone()),
        _ => Err(CoreError::mismatch(format!(
            "{}: {function} cannot be applied to {argument}",
            intrinsic.uri()
        ))),
    }
}

fn leaves_all(ty: &Type, pred: &dyn Fn(DType) -> bool) -> bool {
    match ty {
        Type::Tensor { dtype, .. } => pred(*dtype),
        Type::Struct(elements) => elements.iter().all(|(_, t)| leaves_all(t, pred)),
        _ => false,
    }
}

fn apply(intrinsic: Intrinsic, argument: Expr) -> Result<Expr> {
    let ty = intrinsic.function_type(argument.type_signature())?;
    Expr::call(Expr::intrinsic(intrinsic, ty)?, Some(argument))
}

pub fn federated_value_at_server(value: Expr) -> Result<Expr> {
    apply(Intrinsic::FederatedValueAtServer, value)
}

pub fn federated_value_at_clients(value: Expr) -> Result<Expr> {
    apply(Intrinsic::FederatedValueAtClients, value)
}

pub fn federated_broadcast(value: Expr) -> Result<Expr> {
    apply(Intrinsic::FederatedBroadcast, value)
}

pub fn federated_map(function: Expr, value: Expr) -> Result<Expr> {
    apply(Intrinsic::FederatedMap, Expr::tuple(vec![function, value])?)
}

pub fn federated_map_all_equal(function: Expr, value: Expr) -> Result<Expr> {
    apply(Intrinsic::FederatedMapAllEqual, Expr::tuple(vec![function, value])?)
}

pub fn federated_apply(function: Expr, value: Expr) -> Result<Expr> {
    apply(Intrinsic::FederatedApply, Expr::tuple(vec![function, value])?)
}

pub fn federated_eval_at_server(function: Expr) -> Result<Expr> {
    apply(Intrinsic::FederatedEvalAtServer, function)
}

pub fn federated_eval_at_clients(function: Expr) -> Result<Expr> {
    apply(Intrinsic::FederatedEvalAtClients, function)
}

pub fn federated_zip_at_server(values: Vec<Expr>) -> Result<Expr> {
    apply(Intrinsic::FederatedZipAtServer, Expr::tuple(values)?)
}

pub fn federated_zip_at_clients(values: Vec<Expr>) -> Result<Expr> {
    apply(Intrinsic::FederatedZipAtClients, Expr::tuple(values)?)
}

pub fn federated_sum(value: Expr) -> Result<Expr> {
    apply(Intrinsic::FederatedSum, value)
}

pub fn federated_mean(value: Expr) -> Result<Expr> {
    apply(Intrinsic::FederatedMean, value)
}

pub fn federated_aggregate(
    value: Expr,
    zero: Expr,
    accumulate: Expr,
    merge: Expr,
    report: Expr,
) -> Result<Expr> {
    apply(
        Intrinsic::FederatedAggregate,
        Expr::tuple(vec![value, zero, accumulate, merge, report])?,
    )
}
