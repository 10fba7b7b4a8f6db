//! Defines the interface between the virtual machine and an external hint
//! executor.
//!
//! Hints are snippets of non-Cairo code attached to program offsets. The
//! machine itself treats their code as opaque strings: before a run, every
//! hint is handed to a [`HintProcessor`] for compilation, and during the
//! run the compiled form is executed right before the instruction it is
//! attached to. Hints read and write memory through the same write-once
//! interface as the machine, and keep their own state in a stack of
//! [`ExecutionScopes`].

use std::any::Any;
use std::collections::HashMap;

use starknet_types_core::felt::Felt;

use crate::error::HintError;
use crate::CairoVM;

/// A record tracking how far the **Allocation Pointer** has moved inside
/// the current tracking group.
///
/// References whose address depends on `ap` can only be resolved while the
/// machine is inside the same group, by adjusting for the offset
/// difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApTracking {
    /// The tracking group; a new group starts wherever the tracker loses
    /// sight of `ap`.
    pub group: usize,
    /// The number of cells `ap` has advanced within the group.
    pub offset: usize,
}

/// The register a [`HintReference`] is based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseRegister {
    /// The **Allocation Pointer**.
    AP,
    /// The **Frame Pointer**.
    FP,
}

/// A second, inner offset of a [`HintReference`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffsetValue {
    /// An immediate scalar value.
    Immediate(Felt),
    /// A constant offset.
    Value(i32),
    /// A register-relative offset, optionally dereferenced.
    Reference(BaseRegister, i32, bool),
}

/// A compiled description of where a program-level identifier lives at a
/// given point of the program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintReference {
    /// The first offset: the base register and displacement.
    pub offset1: OffsetValue,
    /// The optional second offset added to the first.
    pub offset2: Option<OffsetValue>,
    /// Whether resolving the reference dereferences the computed address.
    pub dereference: bool,
    /// The `ap` tracking state the reference was compiled against, when the
    /// base register is `ap`.
    pub ap_tracking: Option<ApTracking>,
    /// The Cairo type of the referenced identifier, when known.
    pub cairo_type: Option<String>,
}

impl HintReference {
    /// Creates a simple `[fp + offset]` reference.
    pub fn new_simple(offset: i32) -> Self {
        Self {
            offset1: OffsetValue::Reference(BaseRegister::FP, offset, false),
            offset2: None,
            dereference: true,
            ap_tracking: None,
            cairo_type: None,
        }
    }
}

/// A hint attached to a program offset, as found in compiled programs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintParams {
    /// The hint code, opaque to the machine.
    pub code: String,
    /// The identifiers the hint may access, mapped to reference indices.
    pub reference_ids: HashMap<String, usize>,
    /// The `ap` tracking state at the hint's location.
    pub ap_tracking: ApTracking,
}

/// A stack of dictionaries hints use to keep state across executions.
///
/// The machine starts a run with one scope; hints may enter nested scopes
/// and must exit them before the run ends. Exiting the outermost scope is
/// an error.
pub struct ExecutionScopes {
    data: Vec<HashMap<String, Box<dyn Any>>>,
}

impl Default for ExecutionScopes {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionScopes {
    /// Creates the scope stack with the main scope on it.
    pub fn new() -> Self {
        Self {
            data: vec![HashMap::new()],
        }
    }

    /// Enters a new scope holding the provided variables.
    pub fn enter_scope(&mut self, variables: HashMap<String, Box<dyn Any>>) {
        self.data.push(variables);
    }

    /// Exits the current scope.
    ///
    /// # Returns
    ///
    /// [`HintError::CannotExitMainScope`] when only the main scope is
    /// left.
    pub fn exit_scope(&mut self) -> Result<(), HintError> {
        if self.data.len() <= 1 {
            return Err(HintError::CannotExitMainScope);
        }
        self.data.pop();
        Ok(())
    }

    /// Returns the current nesting depth, the main scope counting as one.
    pub fn depth(&self) -> usize {
        self.data.len()
    }

    /// Stores a variable in the current scope.
    pub fn insert_value(&mut self, name: &str, value: impl Any) {
        if let Some(scope) = self.data.last_mut() {
            scope.insert(name.to_string(), Box::new(value));
        }
    }

    /// Reads a variable of the current scope.
    ///
    /// # Returns
    ///
    /// [`HintError::VariableNotInScope`] when the variable is missing or
    /// has a different type.
    pub fn get<T: Any>(&self, name: &str) -> Result<&T, HintError> {
        self.data
            .last()
            .and_then(|scope| scope.get(name))
            .and_then(|value| value.downcast_ref())
            .ok_or_else(|| HintError::VariableNotInScope(name.into()))
    }

    /// Reads a variable of the current scope, mutably.
    pub fn get_mut<T: Any>(&mut self, name: &str) -> Result<&mut T, HintError> {
        self.data
            .last_mut()
            .and_then(|scope| scope.get_mut(name))
            .and_then(|value| value.downcast_mut())
            .ok_or_else(|| HintError::VariableNotInScope(name.into()))
    }

    /// Removes a variable from the current scope.
    pub fn delete_variable(&mut self, name: &str) {
        if let Some(scope) = self.data.last_mut() {
            scope.remove(name);
        }
    }
}

impl std::fmt::Debug for ExecutionScopes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionScopes")
            .field("depth", &self.data.len())
            .finish_non_exhaustive()
    }
}

/// An external executor for the hints of a program.
///
/// The machine calls [`HintProcessor::compile_hint`] once per hint before
/// the run, and [`HintProcessor::execute_hint`] with the compiled form
/// every time the program counter reaches the hint's location. The
/// compiled form is opaque to the machine.
pub trait HintProcessor {
    /// Compiles a hint into whatever representation the executor wants to
    /// run later.
    fn compile_hint(
        &self,
        code: &str,
        ap_tracking: &ApTracking,
        reference_ids: &HashMap<String, usize>,
        references: &[HintReference],
    ) -> Result<Box<dyn Any>, HintError>;

    /// Executes a previously compiled hint against the machine.
    fn execute_hint(
        &mut self,
        vm: &mut CairoVM,
        exec_scopes: &mut ExecutionScopes,
        hint_data: &dyn Any,
        constants: &HashMap<String, Felt>,
    ) -> Result<(), HintError>;
}

/// A [`HintProcessor`] for programs without hints.
///
/// Compiling succeeds with an empty payload so hint-free programs can be
/// driven without a real executor; executing anything is an error.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHintProcessor;

impl HintProcessor for NoopHintProcessor {
    fn compile_hint(
        &self,
        code: &str,
        _ap_tracking: &ApTracking,
        _reference_ids: &HashMap<String, usize>,
        _references: &[HintReference],
    ) -> Result<Box<dyn Any>, HintError> {
        Ok(Box::new(code.to_string()))
    }

    fn execute_hint(
        &mut self,
        _vm: &mut CairoVM,
        _exec_scopes: &mut ExecutionScopes,
        _hint_data: &dyn Any,
        _constants: &HashMap<String, Felt>,
    ) -> Result<(), HintError> {
        Err(HintError::Custom(
            "no hint executor is attached to this run".into(),
        ))
    }
}
