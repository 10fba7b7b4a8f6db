//! Defines the [`Program`] input structure.
//!
//! Loading compiled programs from their JSON form is the business of an
//! external loader; the machine only consumes this already-parsed shape.

use std::collections::HashMap;

use starknet_types_core::felt::Felt;

use crate::builtin::BuiltinName;
use crate::hint::{HintParams, HintReference};
use crate::memory::Value;

/// A program-level identifier, surfaced in error attribution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identifier {
    /// The identifier kind, e.g. `function` or `const`.
    pub type_: Option<String>,
    /// The constant value, for `const` identifiers.
    pub value: Option<Felt>,
    /// The program offset, for label-like identifiers.
    pub pc: Option<usize>,
}

/// An error-message attribute covering a range of program offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeScope {
    /// The attribute name.
    pub name: String,
    /// The first program offset covered.
    pub start_pc: usize,
    /// The first program offset not covered.
    pub end_pc: usize,
    /// The attribute's message.
    pub value: String,
}

/// The source location of one instruction, surfaced in error attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionLocation {
    /// The source file the instruction was compiled from.
    pub input_file: String,
    /// The one-based starting line.
    pub start_line: u32,
    /// The one-based starting column.
    pub start_col: u32,
    /// The one-based ending line.
    pub end_line: u32,
    /// The one-based ending column.
    pub end_col: u32,
}

/// A compiled Cairo program, ready to be loaded into the machine.
#[derive(Debug, Clone, Default)]
pub struct Program {
    /// The builtins the program uses, in the canonical order.
    pub builtins: Vec<BuiltinName>,
    /// The program bytecode: instruction words and immediates.
    pub data: Vec<Value>,
    /// The offset of the `main` entrypoint, when the program has one.
    pub main: Option<usize>,
    /// The offset execution starts from in proof mode.
    pub start: Option<usize>,
    /// The offset execution ends at in proof mode.
    pub end: Option<usize>,
    /// The program's named constants.
    pub constants: HashMap<String, Felt>,
    /// The hints of the program, keyed by the offset they are attached to.
    pub hints: HashMap<usize, Vec<HintParams>>,
    /// The reference table hints resolve identifiers through.
    pub reference_manager: Vec<HintReference>,
    /// The program's identifiers, for error attribution.
    pub identifiers: HashMap<String, Identifier>,
    /// Error-message attributes, for error attribution.
    pub error_message_attributes: Vec<AttributeScope>,
    /// Instruction source locations, for error attribution.
    pub instruction_locations: HashMap<usize, InstructionLocation>,
}

impl Program {
    /// Creates a program from its builtins and bytecode, with no
    /// entrypoint metadata.
    pub fn new(builtins: Vec<BuiltinName>, data: Vec<Value>) -> Self {
        Self {
            builtins,
            data,
            ..Self::default()
        }
    }

    /// Returns the error-message attributes covering `pc`.
    pub fn attributes_at(&self, pc: usize) -> impl Iterator<Item = &AttributeScope> {
        self.error_message_attributes
            .iter()
            .filter(move |attr| attr.start_pc <= pc && pc < attr.end_pc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_cover_half_open_ranges() {
        let mut program = Program::new(Vec::new(), Vec::new());
        program.error_message_attributes.push(AttributeScope {
            name: "error_message".to_string(),
            start_pc: 2,
            end_pc: 5,
            value: "balance underflow".to_string(),
        });
        assert_eq!(program.attributes_at(1).count(), 0);
        assert_eq!(program.attributes_at(2).count(), 1);
        assert_eq!(program.attributes_at(4).count(), 1);
        assert_eq!(program.attributes_at(5).count(), 0);
    }
}
