//! Defines the [`Signature`] builtin.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use starknet_crypto::verify;
use starknet_types_core::felt::Felt;

use crate::error::MemoryError;
use crate::memory::{Memory, Pointer, ValidationRule, Value};

use super::{Builtin, BuiltinName, BuiltinState};

/// The number of memory cells of one signature instance:
/// `(pub_key, msg)`.
const CELLS_PER_INSTANCE: usize = 2;

/// An ECDSA signature over the STARK curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcdsaSignature {
    /// The `r` component of the signature.
    pub r: Felt,
    /// The `s` component of the signature.
    pub s: Felt,
}

/// The ECDSA signature-verification builtin.
///
/// An instance holds a public key and a message hash. Nothing is deduced;
/// instead, hints feed the builtin a signature for each instance
/// ([`Signature::add_signature`]) and a validation rule verifies the pair
/// as soon as both cells are asserted. The signature table is shared with
/// the validation rule, which runs single-threaded on the write path.
#[derive(Debug)]
pub struct Signature {
    state: BuiltinState,
    signatures: Rc<RefCell<HashMap<Pointer, EcdsaSignature>>>,
}

impl Signature {
    /// Creates a new [`Signature`] builtin.
    pub fn new(included: bool, ratio: Option<u32>) -> Self {
        Self {
            state: BuiltinState::new(included, ratio),
            signatures: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Registers the signature to verify the instance whose public key
    /// lives at `pub_key_addr`.
    ///
    /// # Returns
    ///
    /// [`MemoryError::SignatureNotFound`] when the address is not the
    /// public-key cell of an instance of this builtin.
    pub fn add_signature(
        &mut self,
        pub_key_addr: Pointer,
        signature: EcdsaSignature,
    ) -> Result<(), MemoryError> {
        let on_segment = self
            .state
            .base
            .is_some_and(|base| base as isize == pub_key_addr.segment);
        if !on_segment || pub_key_addr.offset % CELLS_PER_INSTANCE != 0 {
            return Err(MemoryError::SignatureNotFound(pub_key_addr));
        }
        self.signatures.borrow_mut().insert(pub_key_addr, signature);
        Ok(())
    }
}

impl Builtin for Signature {
    fn name(&self) -> BuiltinName {
        BuiltinName::Ecdsa
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

    fn add_validation_rule(&self, memory: &mut Memory) {
        let Some(base) = self.state.base else { return };
        let signatures = Rc::clone(&self.signatures);
        memory.add_validation_rule(
            base,
            ValidationRule(Box::new(move |memory, addr| {
                let instance = Pointer::new(addr.segment, addr.offset - addr.offset % 2);
                let msg_addr = Pointer::new(addr.segment, instance.offset + 1);
                let cell_felt = |addr: Pointer| match memory.get(addr) {
                    Some(Value::Scalar(felt)) => Ok(Some(felt)),
                    Some(Value::Pointer(_)) => Err(MemoryError::SignatureFoundPointer(addr)),
                    None => Ok(None),
                };
                // Verification only fires once both halves of the
                // instance are known.
                let (Some(pub_key), Some(msg)) = (cell_felt(instance)?, cell_felt(msg_addr)?)
                else {
                    return Ok(Vec::new());
                };
                let signature = *signatures
                    .borrow()
                    .get(&instance)
                    .ok_or(MemoryError::SignatureNotFound(instance))?;
                let valid = verify(&pub_key, &msg, &signature.r, &signature.s).unwrap_or(false);
                if !valid {
                    return Err(MemoryError::InvalidSignature {
                        pub_key: Box::new(pub_key),
                        msg: Box::new(msg),
                    });
                }
                Ok(vec![instance, msg_addr])
            })),
        );
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
