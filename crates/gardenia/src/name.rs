//! Unique name minting for the generated forward and backward passes.

use std::collections::HashSet;

/// A set of taken names that can produce a fresh name similar to a requested
/// one.
#[derive(Default)]
pub struct NameSet {
    taken: HashSet<String>,
}

impl NameSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a name as taken.
    pub fn insert(&mut self, name: &str) {
        self.taken.insert(name.to_string());
    }

    /// Return `base` if it is free, otherwise the first free `base{n}` for
    /// `n` counting up from 2. The returned name is marked taken.
    pub fn fresh(&mut self, base: &str) -> String {
        if self.taken.insert(base.to_string()) {
            return base.to_string();
        }
        let mut n: u32 = 2;
        loop {
            let candidate = format!("{base}{n}");
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::NameSet;

    #[test]
    fn test_free() {
        let mut names = NameSet::new();
        assert_eq!(names.fresh("foo_fwd"), "foo_fwd");
    }

    #[test]
    fn test_duplicates() {
        let mut names = NameSet::new();
        assert_eq!(names.fresh("foo_fwd"), "foo_fwd");
        assert_eq!(names.fresh("foo_fwd"), "foo_fwd2");
        assert_eq!(names.fresh("foo_fwd"), "foo_fwd3");
    }

    #[test]
    fn test_taken() {
        let mut names = NameSet::new();
        names.insert("foo_bwd");
        assert_eq!(names.fresh("foo_bwd"), "foo_bwd2");
    }

    #[test]
    fn test_gap() {
        let mut names = NameSet::new();
        names.insert("foo");
        names.insert("foo2");
        names.insert("foo4");
        assert_eq!(names.fresh("foo"), "foo3");
        assert_eq!(names.fresh("foo"), "foo5");
    }
}
