/// Resource limits applied to one top-level call of a bytecode image.
///
/// Both limits are uncatchable: exceeding one unwinds straight to the caller
/// of the image, skipping every exception handler on the way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceLimits {
    /// Maximum number of instructions dispatched, counted across nested
    /// invocations and across resumptions of the same continuation chain.
    pub max_instructions: Option<u64>,
    /// Maximum nesting depth of bytecode-to-bytecode invocations.
    pub max_recursion_depth: Option<usize>,
}

impl ResourceLimits {
    /// No limits.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_max_instructions(mut self, limit: u64) -> Self {
        self.max_instructions = Some(limit);
        self
    }

    pub fn with_max_recursion_depth(mut self, limit: usize) -> Self {
        self.max_recursion_depth = Some(limit);
        self
    }
}
