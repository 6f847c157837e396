//! Built-in operators bound in the prelude environment.

use serde::{Deserialize, Serialize};

use crate::env::Env;
use crate::error::VmError;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Primitive {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Lt,
    Gt,
    Le,
    Ge,
    Not,
}

impl Primitive {
    pub const ALL: [Primitive; 10] = [
        Primitive::Add,
        Primitive::Sub,
        Primitive::Mul,
        Primitive::Div,
        Primitive::Eq,
        Primitive::Lt,
        Primitive::Gt,
        Primitive::Le,
        Primitive::Ge,
        Primitive::Not,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Primitive::Add => "+",
            Primitive::Sub => "-",
            Primitive::Mul => "*",
            Primitive::Div => "/",
            Primitive::Eq => "=",
            Primitive::Lt => "<",
            Primitive::Gt => ">",
            Primitive::Le => "<=",
            Primitive::Ge => ">=",
            Primitive::Not => "not",
        }
    }

    #[must_use]
    pub fn arity(self) -> usize {
        match self {
            Primitive::Not => 1,
            _ => 2,
        }
    }

    /// Apply to already evaluated arguments. Arity and operand types are
    /// checked here, at the call site; nothing is coerced.
    pub fn apply(self, args: &[Value]) -> Result<Value, VmError> {
        if args.len() != self.arity() {
            return Err(VmError::Arity {
                callee: self.name().to_string(),
                expected: self.arity(),
                actual: args.len(),
            });
        }
        match self {
            Primitive::Not => Ok(Value::Bool(!args[0].is_truthy())),
            Primitive::Eq => equal(&args[0], &args[1]).map(Value::Bool),
            _ => {
                let (a, b) = (self.int(&args[0])?, self.int(&args[1])?);
                self.arith(a, b)
            }
        }
    }

    fn int(self, value: &Value) -> Result<i64, VmError> {
        match value {
            Value::Int(n) => Ok(*n),
            other => Err(VmError::type_mismatch(self.name(), "int", other)),
        }
    }

    fn arith(self, a: i64, b: i64) -> Result<Value, VmError> {
        let overflow = || VmError::Arithmetic {
            op: self.name().to_string(),
            reason: "integer overflow",
        };
        Ok(match self {
            Primitive::Add => Value::Int(a.checked_add(b).ok_or_else(overflow)?),
            Primitive::Sub => Value::Int(a.checked_sub(b).ok_or_else(overflow)?),
            Primitive::Mul => Value::Int(a.checked_mul(b).ok_or_else(overflow)?),
            Primitive::Div => {
                if b == 0 {
                    return Err(VmError::Arithmetic {
                        op: self.name().to_string(),
                        reason: "division by zero",
                    });
                }
                Value::Int(a.checked_div(b).ok_or_else(overflow)?)
            }
            Primitive::Lt => Value::Bool(a < b),
            Primitive::Gt => Value::Bool(a > b),
            Primitive::Le => Value::Bool(a <= b),
            Primitive::Ge => Value::Bool(a >= b),
            Primitive::Eq | Primitive::Not => {
                return Err(VmError::internal(format!("{} is not arithmetic", self.name())))
            }
        })
    }
}

// Closures have no decidable equality.
fn equal(a: &Value, b: &Value) -> Result<bool, VmError> {
    for v in [a, b] {
        if matches!(v, Value::Closure(_)) {
            return Err(VmError::type_mismatch("=", "comparable value", v));
        }
    }
    Ok(a == b)
}

/// The default environment: every primitive bound under its name.
#[must_use]
pub fn prelude() -> Env {
    Primitive::ALL
        .into_iter()
        .fold(Env::new(), |env, p| env.bind(p.name(), Value::Primitive(p)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_arithmetic() {
        assert_eq!(Primitive::Add.apply(&[Value::Int(10), Value::Int(20)]).unwrap(), Value::Int(30));
        assert_eq!(Primitive::Div.apply(&[Value::Int(7), Value::Int(2)]).unwrap(), Value::Int(3));
        assert_eq!(Primitive::Le.apply(&[Value::Int(2), Value::Int(2)]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_arity_checked() {
        assert_matches!(
            Primitive::Add.apply(&[Value::Int(1)]),
            Err(VmError::Arity { expected: 2, actual: 1, .. })
        );
    }

    #[test]
    fn test_no_coercion() {
        assert_matches!(
            Primitive::Add.apply(&[Value::Int(1), Value::Str("2".into())]),
            Err(VmError::TypeMismatch { expected: "int", found: "string", .. })
        );
    }

    #[test]
    fn test_overflow_and_zero_division() {
        assert_matches!(
            Primitive::Mul.apply(&[Value::Int(i64::MAX), Value::Int(2)]),
            Err(VmError::Arithmetic { reason: "integer overflow", .. })
        );
        assert_matches!(
            Primitive::Div.apply(&[Value::Int(1), Value::Int(0)]),
            Err(VmError::Arithmetic { reason: "division by zero", .. })
        );
    }

    #[test]
    fn test_equality_and_not() {
        let kw = Value::keyword("a");
        assert_eq!(Primitive::Eq.apply(&[kw.clone(), kw]).unwrap(), Value::Bool(true));
        assert_eq!(Primitive::Not.apply(&[Value::Nil]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_prelude_binds_all() {
        let env = prelude();
        for p in Primitive::ALL {
            assert_eq!(env.lookup(p.name()), Some(&Value::Primitive(p)));
        }
    }
}
