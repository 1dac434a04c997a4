use std::fmt;

use thiserror::Error;

use crate::register::Flag;
use crate::value::Value;

#[derive(Debug, Error)]
pub enum AluError {
    #[error("division by zero ({lhs} / 0)")]
    DivisionByZero { lhs: Value },
}

/// Binary ALU operations supported by the machine.
///
/// Arithmetic wraps at 32 bits; the only fatal outcome is division by zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl fmt::Display for AluOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AluOp::Add => write!(f, "ADD"),
            AluOp::Sub => write!(f, "SUB"),
            AluOp::Mul => write!(f, "MUL"),
            AluOp::Div => write!(f, "DIV"),
            AluOp::And => write!(f, "AND"),
            AluOp::Or => write!(f, "OR"),
            AluOp::Xor => write!(f, "XOR"),
            AluOp::Shl => write!(f, "SHL"),
            AluOp::Shr => write!(f, "SHR"),
        }
    }
}

impl AluOp {
    pub fn eval(self, lhs: Value, rhs: Value) -> Result<Value, AluError> {
        let result = match self {
            AluOp::Add => lhs.0.wrapping_add(rhs.0),
            AluOp::Sub => lhs.0.wrapping_sub(rhs.0),
            AluOp::Mul => lhs.0.wrapping_mul(rhs.0),
            AluOp::Div => lhs
                .0
                .checked_div(rhs.0)
                .ok_or(AluError::DivisionByZero { lhs })?,
            AluOp::And => lhs.0 & rhs.0,
            AluOp::Or => lhs.0 | rhs.0,
            AluOp::Xor => lhs.0 ^ rhs.0,
            // Shift counts wrap modulo the word width.
            AluOp::Shl => lhs.0.wrapping_shl(rhs.0),
            AluOp::Shr => lhs.0.wrapping_shr(rhs.0),
        };

        Ok(Value(result))
    }

    /// The ZERO/NEGATIVE flag settings a result implies.
    pub fn flags_for(result: Value) -> [(Flag, bool); 2] {
        [
            (Flag::Zero, result == Value::ZERO),
            (Flag::Negative, result.is_negative()),
        ]
    }
}
