//! Defines the [`EcOp`] builtin.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use starknet_types_core::curve::ProjectivePoint;
use starknet_types_core::felt::Felt;

use crate::error::BuiltinError;
use crate::memory::{Memory, Pointer, Value};

use super::{input_felt, Builtin, BuiltinName, BuiltinState};

/// The number of memory cells of one EC-op instance:
/// `(p_x, p_y, q_x, q_y, m, r_x, r_y)`.
const CELLS_PER_INSTANCE: usize = 7;

/// The number of scalar bits walked by one instance.
const SCALAR_HEIGHT: u32 = 256;

/// The STARK-curve operation builtin.
///
/// Each instance holds two affine points `P` and `Q` and a scalar `m`; the
/// two output cells are deduced as the affine coordinates of
/// `R = P + m * Q`. The double-and-add walk refuses to continue whenever
/// the doubling chain reaches the partial sum's x-coordinate, where the
/// addition formula degenerates.
#[derive(Debug)]
pub struct EcOp {
    state: BuiltinState,
    cache: RefCell<HashMap<usize, Felt>>,
}

impl EcOp {
    /// Creates a new [`EcOp`] builtin.
    pub fn new(included: bool, ratio: Option<u32>) -> Self {
        Self {
            state: BuiltinState::new(included, ratio),
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Computes `partial_sum + m * doubled_point` by walking the bits of
    /// `m`.
    fn ec_op_impl(
        mut partial_sum: ProjectivePoint,
        mut doubled_point: ProjectivePoint,
        m: &Felt,
    ) -> Result<ProjectivePoint, BuiltinError> {
        let mut slope = m.to_biguint();
        for _ in 0..SCALAR_HEIGHT {
            if slope.is_zero() {
                break;
            }
            if doubled_point.x() * partial_sum.z() == partial_sum.x() * doubled_point.z() {
                return Err(BuiltinError::EcOpSameXCoordinate(Box::new(*m)));
            }
            if !(&slope & BigUint::one()).is_zero() {
                partial_sum += &doubled_point;
            }
            doubled_point = doubled_point.double();
            slope >>= 1u32;
        }
        Ok(partial_sum)
    }
}

impl Builtin for EcOp {
    fn name(&self) -> BuiltinName {
        BuiltinName::EcOp
    }

    fn state(&self) -> &BuiltinState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut BuiltinState {
        &mut self.state
    }

    fn cells_per_instance(&self) -> usize {
        CELLS_PER_INSTANCE
    }

    fn input_cells(&self) -> usize {
        5
    }

    fn deduce(&self, addr: Pointer, memory: &Memory) -> Result<Option<Value>, BuiltinError> {
        let index = addr.offset % CELLS_PER_INSTANCE;
        if index != 5 && index != 6 {
            return Ok(None);
        }
        if let Some(output) = self.cache.borrow().get(&addr.offset) {
            return Ok(Some(Value::Scalar(*output)));
        }
        let first_input = addr.offset - index;
        let mut inputs = [Felt::ZERO; 5];
        for (i, slot) in inputs.iter_mut().enumerate() {
            match input_felt(memory, Pointer::new(addr.segment, first_input + i))? {
                Some(felt) => *slot = felt,
                None => return Ok(None),
            }
        }
        let [p_x, p_y, q_x, q_y, m] = inputs;
        let partial_sum = ProjectivePoint::from_affine(p_x, p_y)
            .map_err(|_| BuiltinError::PointNotOnCurve(Box::new((p_x, p_y))))?;
        let doubled_point = ProjectivePoint::from_affine(q_x, q_y)
            .map_err(|_| BuiltinError::PointNotOnCurve(Box::new((q_x, q_y))))?;
        let result = Self::ec_op_impl(partial_sum, doubled_point, &m)?;
        let result = result
            .to_affine()
            .map_err(|_| BuiltinError::EcOpSameXCoordinate(Box::new(m)))?;
        let mut cache = self.cache.borrow_mut();
        cache.insert(first_input + 5, result.x());
        cache.insert(first_input + 6, result.y());
        Ok(cache.get(&addr.offset).copied().map(Value::Scalar))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
