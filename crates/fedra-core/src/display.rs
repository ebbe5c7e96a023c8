//! Compact rendering of IR for diagnostics.

use std::fmt;

use crate::expr::{Expr, ExprKind};

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind() {
            ExprKind::Reference { name } => write!(f, "{name}"),
            ExprKind::Lambda { parameter, body } => match parameter {
                Some((name, _)) => write!(f, "({name} -> {body})"),
                None => write!(f, "( -> {body})"),
            },
            ExprKind::Call { function, argument } => match argument {
                Some(a) => write!(f, "{function}({a})"),
                None => write!(f, "{function}()"),
            },
            ExprKind::Block { locals, result } => {
                write!(f, "(let ")?;
                for (i, (name, value)) in locals.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{name}={value}")?;
                }
                write!(f, " in {result})")
            }
            ExprKind::Struct { elements } => {
                write!(f, "<")?;
                for (i, (name, e)) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    if let Some(name) = name {
                        write!(f, "{name}=")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ">")
            }
            ExprKind::Selection { source, index } => write!(f, "{source}[{index}]"),
            ExprKind::Data { .. } => write!(f, "data<{}>", self.type_signature()),
            ExprKind::Intrinsic { intrinsic } => write!(f, "{intrinsic}"),
            ExprKind::Compiled { .. } => write!(f, "comp#{:08x}", self.structural_hash() as u32),
            ExprKind::Placement { placement } => write!(f, "{placement}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::expr::Expr;
    use crate::intrinsics::federated_sum;
    use crate::types::Type;
    use crate::value::Value;

    #[test]
    fn renders_block() {
        let y = Expr::reference("y", Type::int32()).unwrap();
        let s = Expr::tuple(vec![y.clone(), y]).unwrap();
        let blk = Expr::block(
            vec![("y", Expr::literal(Value::int32(3)).unwrap())],
            Expr::selection(s, 1usize).unwrap(),
        )
        .unwrap();
        assert_eq!(blk.to_string(), "(let y=data<int32> in <y,y>[1])");
    }

    #[test]
    fn renders_intrinsic_call() {
        let x = Expr::reference("x", Type::at_clients(Type::int32())).unwrap();
        assert_eq!(federated_sum(x).unwrap().to_string(), "federated_sum(x)");
    }
}
