//! Id filters applied to discovery candidates
use std::{
    collections::HashSet,
    iter::FromIterator
};

use crate::VbdId;

/// A set of domain or VBD ids.  An empty `Filter` accepts every id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter(HashSet<u32>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id` to the set.  Returns `false` if it was already present, which
    /// is not an error.
    pub fn add(&mut self, id: u32) -> bool {
        self.0.insert(id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.0.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Does `id` pass this filter?
    pub fn accepts(&self, id: u32) -> bool {
        self.is_empty() || self.contains(id)
    }
}

impl FromIterator<u32> for Filter {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Filter(iter.into_iter().collect())
    }
}

impl Extend<u32> for Filter {
    fn extend<I: IntoIterator<Item = u32>>(&mut self, iter: I) {
        self.0.extend(iter)
    }
}

/// The domain and VBD filters configured at startup.  Immutable afterwards.
#[derive(Clone, Debug, Default)]
pub struct Filters {
    pub domains: Filter,
    pub vbds: Filter,
}

impl Filters {
    pub fn new(domains: Filter, vbds: Filter) -> Self {
        Filters { domains, vbds }
    }

    pub fn accepts(&self, id: VbdId) -> bool {
        self.domains.accepts(id.domid) && self.vbds.accepts(id.vbdid)
    }
}
