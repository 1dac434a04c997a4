use std::fmt;

/// A 32-bit machine word. Registers and memory cells each hold one of these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(pub u32);

impl Value {
    pub const ZERO: Value = Value(0);

    pub fn to_address(self) -> usize { self.0 as usize }

    /// Whether the word is negative under two's-complement interpretation.
    pub fn is_negative(self) -> bool { (self.0 as i32) < 0 }

    pub fn wrapping_add(self, rhs: Value) -> Value { Value(self.0.wrapping_add(rhs.0)) }
    pub fn wrapping_sub(self, rhs: Value) -> Value { Value(self.0.wrapping_sub(rhs.0)) }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self { Self(value) }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self { Self(value as u32) }
}
