/// Behavior toggles for one runtime instance.
#[derive(Clone, Copy, Debug)]
pub struct RuntimeConfig {
    /// Treat handle-registry misuse (double release, dereference of a freed
    /// registration) as fatal. When off, violations are logged and the
    /// offending operation resolves to nothing.
    pub strict_handles: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            strict_handles: true,
        }
    }
}
