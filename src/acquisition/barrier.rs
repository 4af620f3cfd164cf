//! Fan-in barrier for the two wait phases of a step.

/// Shrinking set of module names a wait phase still expects to hear from.
///
/// The wait is over when the set is empty. Names are kept in binding order so that a
/// timeout message lists the missing modules predictably.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSet {
    pending: Vec<String>,
}

impl PendingSet {
    /// Expect one completion from each of `names`.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pending: Vec<String> = Vec::new();
        for name in names {
            let name = name.into();
            if !pending.contains(&name) {
                pending.push(name);
            }
        }
        Self { pending }
    }

    /// Mark `name` as done. Returns false when it was not pending.
    pub fn complete(&mut self, name: &str) -> bool {
        match self.pending.iter().position(|p| p == name) {
            Some(at) => {
                self.pending.remove(at);
                true
            }
            None => false,
        }
    }

    /// True once every module reported.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Modules still outstanding.
    pub fn pending(&self) -> &[String] {
        &self.pending
    }
}
