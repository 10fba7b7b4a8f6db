//! Defines the [`Output`] builtin.

use std::any::Any;

use super::{Builtin, BuiltinName, BuiltinState};

/// The output builtin.
///
/// Output cells are written through without any constraint; their purpose
/// is to end up in the public memory, one page-0 entry per used cell.
#[derive(Debug)]
pub struct Output {
    state: BuiltinState,
}

impl Output {
    /// Creates a new [`Output`] builtin.
    pub fn new(included: bool) -> Self {
        Self {
            state: BuiltinState::new(included, None),
        }
    }
}

impl Builtin for Output {
    fn name(&self) -> BuiltinName {
        BuiltinName::Output
    }

    fn state(&self) -> &BuiltinState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut BuiltinState {
        &mut self.state
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
