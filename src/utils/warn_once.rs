use rustc_hash::FxHashSet;

/// Remembers which warnings an owner has already logged.
///
/// Owned per renderer so two renderers each report their own shortfalls.
#[derive(Debug, Default)]
pub struct WarnOnce {
    seen: FxHashSet<String>,
}

impl WarnOnce {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs `message` at warn level the first time `key` is seen.
    /// Returns `true` when the warning was emitted.
    pub fn warn(&mut self, key: &str, message: impl FnOnce() -> String) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        self.seen.insert(key.to_owned());
        log::warn!("{}", message());
        true
    }

    #[must_use]
    pub fn has_warned(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}
