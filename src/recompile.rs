//! Recompilation bookkeeping.
//!
//! Inlining bakes callee bodies and constant values into a caller's code,
//! so redefining either must invalidate every affected caller. The manager
//! keeps the reverse edges: callee name to caller methods, and constant
//! name to referrer methods. The engine walks them on a host redefinition
//! callback, restoring each caller's original definition.

use std::collections::{HashMap, HashSet};

use crate::host::ids::Id;
use crate::host::model::MethodId;

#[derive(Debug, Default)]
pub struct RecompilationManager {
    callee_caller: HashMap<Id, HashSet<MethodId>>,
    constant_referrers: HashMap<Id, HashSet<MethodId>>,
}

impl RecompilationManager {
    pub fn new() -> RecompilationManager {
        RecompilationManager::default()
    }

    pub fn add_callee_caller(&mut self, callee: Id, caller: MethodId) {
        self.callee_caller.entry(callee).or_default().insert(caller);
    }

    pub fn callers_of(&self, callee: Id) -> Option<&HashSet<MethodId>> {
        self.callee_caller.get(&callee)
    }

    /// Drain the caller set for a redefined method.
    pub fn take_callers(&mut self, callee: Id) -> Vec<MethodId> {
        self.callee_caller
            .remove(&callee)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn add_constant_referrer(&mut self, constant: Id, referrer: MethodId) {
        self.constant_referrers
            .entry(constant)
            .or_default()
            .insert(referrer);
    }

    pub fn referrers_of(&self, constant: Id) -> Option<&HashSet<MethodId>> {
        self.constant_referrers.get(&constant)
    }

    /// Drain the referrer set for a redefined constant.
    pub fn take_referrers(&mut self, constant: Id) -> Vec<MethodId> {
        self.constant_referrers
            .remove(&constant)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.callee_caller.clear();
        self.constant_referrers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges_accumulate_and_drain() {
        let mut mgr = RecompilationManager::new();
        let name = Id::intern("target");
        mgr.add_callee_caller(name, MethodId(1));
        mgr.add_callee_caller(name, MethodId(2));
        mgr.add_callee_caller(name, MethodId(1));

        assert_eq!(mgr.callers_of(name).unwrap().len(), 2);
        let mut drained = mgr.take_callers(name);
        drained.sort();
        assert_eq!(drained, vec![MethodId(1), MethodId(2)]);
        assert!(mgr.callers_of(name).is_none());
    }
}
