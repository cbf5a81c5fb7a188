//! Lexical naming of local variables.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::host::ids::{self, Id};

/// Index of a named variable within its scope.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamedVarId(pub u32);

impl fmt::Debug for NamedVarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// One name declared in a scope.
#[derive(Debug, Clone)]
pub struct NamedVariable {
    name: Id,
    /// Environment-slot index, assigned only to names used from inner
    /// scopes.
    index: Option<usize>,
    used_from_inner: bool,
}

impl NamedVariable {
    pub fn name(&self) -> Id {
        self.name
    }

    pub fn slot_index(&self) -> Option<usize> {
        self.index
    }

    pub fn is_used_from_inner_scope(&self) -> bool {
        self.used_from_inner
    }

    pub fn mark_used_from_inner_scope(&mut self) {
        self.used_from_inner = true;
    }
}

/// One lexical scope: the id table of a method (or block) body.
///
/// Always contains `<self>` in addition to the declared locals.
#[derive(Debug, Clone)]
pub struct Scope {
    vars: Vec<NamedVariable>,
    by_name: HashMap<Id, NamedVarId>,
    parent: Option<Rc<Scope>>,
}

impl Scope {
    pub fn new(locals: &[Id], parent: Option<Rc<Scope>>) -> Scope {
        let mut scope = Scope {
            vars: Vec::with_capacity(locals.len() + 1),
            by_name: HashMap::new(),
            parent,
        };
        scope.insert(ids::self_name());
        for &name in locals {
            scope.insert(name);
        }
        scope
    }

    fn insert(&mut self, name: Id) -> NamedVarId {
        if let Some(&id) = self.by_name.get(&name) {
            return id;
        }
        let id = NamedVarId(self.vars.len() as u32);
        self.vars.push(NamedVariable {
            name,
            index: None,
            used_from_inner: false,
        });
        self.by_name.insert(name, id);
        id
    }

    pub fn parent(&self) -> Option<&Rc<Scope>> {
        self.parent.as_ref()
    }

    pub fn find(&self, name: Id) -> Option<NamedVarId> {
        self.by_name.get(&name).copied()
    }

    pub fn named(&self, id: NamedVarId) -> &NamedVariable {
        &self.vars[id.0 as usize]
    }

    pub fn named_mut(&mut self, id: NamedVarId) -> &mut NamedVariable {
        &mut self.vars[id.0 as usize]
    }

    pub fn self_ref(&self) -> NamedVarId {
        self.find(ids::self_name()).expect("scope always has <self>")
    }

    /// Names that need an environment slot, in declaration order.
    pub fn active_variable_list(&self) -> Vec<Id> {
        self.vars
            .iter()
            .filter(|v| v.used_from_inner)
            .map(|v| v.name)
            .collect()
    }

    /// Assign environment-slot indexes; returns the slot count.
    pub fn set_indexes(&mut self) -> usize {
        let mut index = 0;
        for v in &mut self.vars {
            if v.used_from_inner {
                v.index = Some(index);
                index += 1;
            }
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_always_contains_self() {
        let scope = Scope::new(&[], None);
        assert!(scope.find(ids::self_name()).is_some());
    }

    #[test]
    fn test_slot_assignment_covers_only_escaping_names() {
        let x = Id::intern("x");
        let y = Id::intern("y");
        let mut scope = Scope::new(&[x, y], None);
        let y_ref = scope.find(y).unwrap();
        scope.named_mut(y_ref).mark_used_from_inner_scope();

        assert_eq!(scope.set_indexes(), 1);
        assert_eq!(scope.named(y_ref).slot_index(), Some(0));
        let x_ref = scope.find(x).unwrap();
        assert_eq!(scope.named(x_ref).slot_index(), None);
        assert_eq!(scope.active_variable_list(), vec![y]);
    }
}
