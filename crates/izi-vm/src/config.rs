//! Runtime-tunable VM behavior, set from the CLI's `--trace` flag or by
//! embedders constructing a `Vm` directly.

/// Configuration the VM consults while running. Lives apart from `Vm`
/// itself so a fresh VM can be built with it before any program has
/// loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmConfig {
    /// When set, every dispatched instruction is logged via
    /// `tracing::trace!` alongside a snapshot of the value stack.
    pub trace_execution: bool,
}
