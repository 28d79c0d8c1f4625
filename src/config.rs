//! Runtime configuration passed from the CLI into the engines.

/// Engine options.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Dump each compiled function's bytes to `function_<name>.dump`.
    pub debug: bool,
}
