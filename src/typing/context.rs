//! Per-method type environment.

use crate::cfg::{ControlFlowGraph, VarId};
use crate::typing::constraint::TypeConstraint;

/// One constraint slot per variable, parallel to the CFG's variable arena.
///
/// Created together with a compilation's CFG and dropped with it; the code
/// duplicator appends to it in lockstep with the variables it creates.
#[derive(Debug, Clone)]
pub struct TypeContext {
    types: Vec<Option<TypeConstraint>>,
    any: TypeConstraint,
}

impl TypeContext {
    pub fn new(cfg: &ControlFlowGraph) -> TypeContext {
        TypeContext::with_capacity(cfg.variable_count())
    }

    pub fn with_capacity(len: usize) -> TypeContext {
        TypeContext {
            types: vec![None; len],
            any: TypeConstraint::Any,
        }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Grow to cover variables created since construction.
    pub fn fit_size(&mut self, cfg: &ControlFlowGraph) {
        if cfg.variable_count() > self.types.len() {
            self.types.resize(cfg.variable_count(), None);
        }
    }

    /// Set without change detection.
    pub fn set(&mut self, v: VarId, t: TypeConstraint) {
        self.types[v.index()] = Some(t);
    }

    /// Replace the constraint; true when it actually changed.
    pub fn update(&mut self, v: VarId, t: TypeConstraint) -> bool {
        let slot = &mut self.types[v.index()];
        if slot.as_ref() == Some(&t) {
            return false;
        }
        *slot = Some(t);
        true
    }

    pub fn type_of(&self, v: VarId) -> Option<&TypeConstraint> {
        self.types.get(v.index()).and_then(|t| t.as_ref())
    }

    /// The constraint of `v`, top when nothing is known yet.
    pub fn type_or_any(&self, v: VarId) -> &TypeConstraint {
        self.type_of(v).unwrap_or(&self.any)
    }

    /// Follow `SameAs` chains from `v` down to a non-alias variable.
    pub fn resolve_source(&self, v: VarId) -> VarId {
        let mut cur = v;
        // The hop bound guards against accidental alias cycles.
        for _ in 0..=self.types.len() {
            match self.type_of(cur) {
                Some(TypeConstraint::SameAs(next)) => cur = *next,
                _ => return cur,
            }
        }
        cur
    }

    /// Do `v1` and `v2` provably hold the same value?
    pub fn is_same_value(&self, v1: VarId, v2: VarId) -> bool {
        if v1 == v2 {
            return true;
        }
        self.type_of(v1)
            .map_or(false, |t| t.is_same_value_as(self, v2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_detects_change() {
        let mut ctx = TypeContext::with_capacity(2);
        assert!(ctx.update(VarId(0), TypeConstraint::Any));
        assert!(!ctx.update(VarId(0), TypeConstraint::Any));
        assert!(ctx.update(VarId(0), TypeConstraint::Env));
    }

    #[test]
    fn test_resolve_source_follows_chains() {
        let mut ctx = TypeContext::with_capacity(3);
        ctx.set(VarId(0), TypeConstraint::Env);
        ctx.set(VarId(1), TypeConstraint::SameAs(VarId(0)));
        ctx.set(VarId(2), TypeConstraint::SameAs(VarId(1)));
        assert_eq!(ctx.resolve_source(VarId(2)), VarId(0));
        assert_eq!(ctx.resolve_source(VarId(0)), VarId(0));
    }
}
