//! Defines the [`Value`] type.

use std::fmt;

use num_traits::Zero;
use starknet_types_core::felt::{Felt, NonZeroFelt};

use crate::error::MathError;

use super::Pointer;

/// A value that may be stored in a [`Memory`](super::Memory) segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    /// A scalar with no provenance information.
    ///
    /// In that case, the value simply carries an element of the field
    /// without any more information.
    Scalar(Felt),
    /// A pointer with an associated segment.
    ///
    /// In that case, the value is actually a pointer within a specific
    /// segment.
    Pointer(Pointer),
}

impl Value {
    /// Attempts to add two [`Value`]s.
    ///
    /// Adding a scalar to a pointer advances the pointer's offset; adding
    /// two pointers is not a meaningful operation and fails with
    /// [`MathError::PointerAdd`].
    pub fn add(&self, other: &Self) -> Result<Self, MathError> {
        match (self, other) {
            (Self::Scalar(left), Self::Scalar(right)) => Ok(Self::Scalar(left + right)),
            (Self::Scalar(left), Self::Pointer(right)) => Ok(right.add_felt(left)?.into()),
            (Self::Pointer(left), Self::Scalar(right)) => Ok(left.add_felt(right)?.into()),
            (Self::Pointer(left), Self::Pointer(right)) => Err(MathError::PointerAdd(*left, *right)),
        }
    }

    /// Attempts to subtract two [`Value`]s.
    ///
    /// Subtracting two pointers of the same segment yields their scalar
    /// distance; subtracting a pointer from a scalar fails.
    pub fn subtract(&self, other: &Self) -> Result<Self, MathError> {
        match (self, other) {
            (Self::Scalar(left), Self::Scalar(right)) => Ok(Self::Scalar(left - right)),
            (Self::Scalar(_), Self::Pointer(right)) => {
                Err(MathError::PointerSubFromScalar(*right))
            }
            (Self::Pointer(left), Self::Scalar(right)) => {
                let negated = -*right;
                Ok(left.add_felt(&negated)?.into())
            }
            (Self::Pointer(left), Self::Pointer(right)) => {
                left.subtract(*right).map(|d| Self::Scalar(Felt::from(d)))
            }
        }
    }

    /// Attempts to multiply two [`Value`]s.
    ///
    /// Only scalars can be multiplied; any pointer operand fails with
    /// [`MathError::PointerMul`].
    pub fn multiply(&self, other: &Self) -> Result<Self, MathError> {
        match (self, other) {
            (Self::Scalar(left), Self::Scalar(right)) => Ok(Self::Scalar(left * right)),
            (Self::Pointer(p), _) | (_, Self::Pointer(p)) => Err(MathError::PointerMul(*p)),
        }
    }

    /// Attempts to divide two [`Value`]s in the field.
    ///
    /// Only scalars can be divided, and the divisor must be nonzero.
    pub fn divide(&self, other: &Self) -> Result<Self, MathError> {
        let divisor = match other {
            Self::Scalar(divisor) => {
                NonZeroFelt::try_from(*divisor).map_err(|_| MathError::DivideByZero)?
            }
            Self::Pointer(p) => return Err(MathError::PointerMul(*p)),
        };
        match self {
            Self::Scalar(dividend) => Ok(Self::Scalar(dividend.field_div(&divisor))),
            Self::Pointer(p) => Err(MathError::PointerMul(*p)),
        }
    }

    /// Returns whether this [`Value`] behaves as zero in a conditional
    /// jump.
    ///
    /// A pointer is nonzero whenever its segment or offset is nonzero.
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Scalar(value) => value.is_zero(),
            Self::Pointer(pointer) => pointer.segment == 0 && pointer.offset == 0,
        }
    }

    /// Attempts to read this [`Value`] as a scalar.
    #[inline(always)]
    pub const fn scalar(&self) -> Option<&Felt> {
        match self {
            Self::Scalar(value) => Some(value),
            Self::Pointer(_) => None,
        }
    }

    /// Attempts to read this [`Value`] as a pointer.
    #[inline(always)]
    pub const fn pointer(&self) -> Option<Pointer> {
        match self {
            Self::Scalar(_) => None,
            Self::Pointer(pointer) => Some(*pointer),
        }
    }
}

impl From<Felt> for Value {
    #[inline(always)]
    fn from(value: Felt) -> Self {
        Self::Scalar(value)
    }
}

impl From<u64> for Value {
    #[inline(always)]
    fn from(value: u64) -> Self {
        Self::Scalar(Felt::from(value))
    }
}

impl From<usize> for Value {
    #[inline(always)]
    fn from(value: usize) -> Self {
        Self::Scalar(Felt::from(value))
    }
}

impl From<Pointer> for Value {
    #[inline(always)]
    fn from(value: Pointer) -> Self {
        Self::Pointer(value)
    }
}

impl PartialEq<Pointer> for Value {
    fn eq(&self, other: &Pointer) -> bool {
        match self {
            Self::Scalar(_) => false,
            Self::Pointer(pointer) => pointer == other,
        }
    }
}

impl PartialEq<Felt> for Value {
    fn eq(&self, other: &Felt) -> bool {
        match self {
            Self::Scalar(value) => value == other,
            Self::Pointer(_) => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(value) => write!(f, "{value}"),
            Self::Pointer(pointer) => write!(f, "{pointer}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn add_scalar_to_pointer() {
        let p = Value::Pointer(Pointer::new(1, 4));
        let s = Value::Scalar(Felt::from(3));
        assert_eq!(p.add(&s).unwrap(), Value::Pointer(Pointer::new(1, 7)));
        assert_eq!(s.add(&p).unwrap(), Value::Pointer(Pointer::new(1, 7)));
    }

    #[test]
    fn add_two_pointers_fails() {
        let a = Value::Pointer(Pointer::new(1, 4));
        let b = Value::Pointer(Pointer::new(2, 1));
        assert_matches!(a.add(&b), Err(MathError::PointerAdd(_, _)));
    }

    #[test]
    fn subtract_pointers_yields_distance() {
        let a = Value::Pointer(Pointer::new(1, 9));
        let b = Value::Pointer(Pointer::new(1, 3));
        assert_eq!(a.subtract(&b).unwrap(), Value::Scalar(Felt::from(6)));
    }

    #[test]
    fn multiply_pointer_fails() {
        let a = Value::Pointer(Pointer::new(1, 9));
        let s = Value::Scalar(Felt::from(2));
        assert_matches!(a.multiply(&s), Err(MathError::PointerMul(_)));
        assert_matches!(s.multiply(&a), Err(MathError::PointerMul(_)));
    }

    #[test]
    fn divide_by_zero_fails() {
        let a = Value::Scalar(Felt::from(10));
        assert_matches!(
            a.divide(&Value::Scalar(Felt::ZERO)),
            Err(MathError::DivideByZero)
        );
    }

    #[test]
    fn field_division_inverts_multiplication() {
        let a = Value::Scalar(Felt::from(10));
        let b = Value::Scalar(Felt::from(4));
        let q = a.divide(&b).unwrap();
        assert_eq!(q.multiply(&b).unwrap(), a);
    }

    #[test]
    fn zero_test_treats_pointers_as_nonzero() {
        assert!(Value::Scalar(Felt::ZERO).is_zero());
        assert!(!Value::Scalar(Felt::ONE).is_zero());
        assert!(!Value::Pointer(Pointer::new(1, 0)).is_zero());
        assert!(!Value::Pointer(Pointer::new(0, 3)).is_zero());
        assert!(Value::Pointer(Pointer::new(0, 0)).is_zero());
    }
}
