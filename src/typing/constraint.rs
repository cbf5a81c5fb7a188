//! The type-constraint lattice.
//!
//! A constraint describes what the analyzer knows about one SSA value.
//! `None` is bottom (no value seen), `Any` is top. `SameAs` carries a
//! variable index rather than a reference; resolving it goes through the
//! owning [`crate::typing::context::TypeContext`].
//!
//! `Selection` and `ClassOrSubclass::resolve` honor
//! [`MAX_CANDIDATE_COUNT`]: growing past the cap widens to `Any`, which is
//! what bounds the lattice height and guarantees the analyzer terminates.

use crate::cfg::VarId;
use crate::host::model::{ClassId, HostModel, MethodId};
use crate::host::value::Value;
use crate::typing::context::TypeContext;

/// Bound on `Selection` size and on the subclass expansion of
/// `ClassOrSubclass::resolve`. Exceeding it widens the result to `Any`.
pub const MAX_CANDIDATE_COUNT: usize = 16;

/// Truth-value knowledge of a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boolean {
    TrueOrFalse,
    AlwaysTrue,
    AlwaysFalse,
}

/// One possible target of a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Receiver class the candidate was derived from (the class a type
    /// test at the call site must check).
    pub klass: ClassId,
    /// The method resolved for that class.
    pub method: MethodId,
}

/// Result of a method lookup, as a type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LookupConstraint {
    pub candidates: Vec<Candidate>,
    /// True when the candidate list is closed: the receiver cannot be
    /// anything the list does not cover.
    pub determined: bool,
}

impl LookupConstraint {
    pub fn includes(&self, c: Candidate) -> bool {
        self.candidates.contains(&c)
    }
}

/// A type constraint.
#[derive(Debug, Clone)]
pub enum TypeConstraint {
    /// Bottom: no value can reach here.
    None,
    /// Top: any value.
    Any,
    /// A plain machine integer (the argc slot of variadic calls), not a
    /// host object.
    Integer(i64),
    /// Exactly this host value.
    Constant(Value),
    /// A method-resolution environment token.
    Env,
    /// A method-resolution result.
    Lookup(LookupConstraint),
    /// The same value as another variable in the same context.
    SameAs(VarId),
    ExactClass(ClassId),
    ClassOrSubclass(ClassId),
    /// Join of alternatives; order is insignificant.
    Selection(Vec<TypeConstraint>),
    /// Fixpoint guard for self-recursive return types.
    Recursion(MethodId),
}

impl PartialEq for TypeConstraint {
    fn eq(&self, other: &TypeConstraint) -> bool {
        use TypeConstraint as T;
        match (self, other) {
            (T::None, T::None) => true,
            (T::Any, T::Any) => true,
            (T::Integer(a), T::Integer(b)) => a == b,
            (T::Constant(a), T::Constant(b)) => a == b,
            (T::Env, T::Env) => true,
            (T::Lookup(a), T::Lookup(b)) => a == b,
            (T::SameAs(a), T::SameAs(b)) => a == b,
            (T::ExactClass(a), T::ExactClass(b)) => a == b,
            (T::ClassOrSubclass(a), T::ClassOrSubclass(b)) => a == b,
            (T::Recursion(a), T::Recursion(b)) => a == b,
            (T::Selection(a), T::Selection(b)) => selections_equal(a, b),
            // A one-element selection equals its element.
            (T::Selection(a), b) | (b, T::Selection(a)) => a.len() == 1 && &a[0] == b,
            _ => false,
        }
    }
}

fn selections_equal(a: &[TypeConstraint], b: &[TypeConstraint]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut matched = vec![false; b.len()];
    'outer: for x in a {
        for (i, y) in b.iter().enumerate() {
            if !matched[i] && x == y {
                matched[i] = true;
                continue 'outer;
            }
        }
        return false;
    }
    true
}

impl TypeConstraint {
    /// Build a `SameAs`, collapsing chains so the stored source is never
    /// itself a `SameAs`.
    pub fn same_as(ctx: &TypeContext, source: VarId) -> TypeConstraint {
        TypeConstraint::SameAs(ctx.resolve_source(source))
    }

    /// Follow a `SameAs` to the constraint it denotes.
    fn deref<'c>(&'c self, ctx: &'c TypeContext) -> &'c TypeConstraint {
        match self {
            TypeConstraint::SameAs(v) => ctx.type_or_any(*v),
            other => other,
        }
    }

    /// Live value equality: does this constraint prove its value equals
    /// variable `v`? A bare `Env` proves nothing: env identity is only
    /// established through `SameAs` chains.
    pub fn is_same_value_as(&self, ctx: &TypeContext, v: VarId) -> bool {
        match self {
            TypeConstraint::Constant(_) => ctx.type_of(v).map_or(false, |t| t == self),
            TypeConstraint::SameAs(src) => {
                *src == v
                    || ctx
                        .type_of(*src)
                        .map_or(false, |t| t.is_same_value_as(ctx, v))
            }
            TypeConstraint::Recursion(m) => {
                matches!(ctx.type_of(v), Some(TypeConstraint::Recursion(m2)) if m2 == m)
            }
            _ => false,
        }
    }

    pub fn evaluates_to_boolean(&self, ctx: &TypeContext, host: &HostModel) -> Boolean {
        match self {
            TypeConstraint::Constant(v) => {
                if v.is_truthy() {
                    Boolean::AlwaysTrue
                } else {
                    Boolean::AlwaysFalse
                }
            }
            TypeConstraint::ExactClass(c) | TypeConstraint::ClassOrSubclass(c) => {
                if *c == crate::host::builtin::FALSE_CLASS || *c == crate::host::builtin::NIL_CLASS
                {
                    Boolean::AlwaysFalse
                } else {
                    Boolean::AlwaysTrue
                }
            }
            TypeConstraint::SameAs(_) => self.deref(ctx).evaluates_to_boolean(ctx, host),
            TypeConstraint::Selection(types) => {
                let mut trues = 0;
                let mut falses = 0;
                for t in types {
                    match t.evaluates_to_boolean(ctx, host) {
                        Boolean::AlwaysTrue => {
                            if falses > 0 {
                                return Boolean::TrueOrFalse;
                            }
                            trues += 1;
                        }
                        Boolean::AlwaysFalse => {
                            if trues > 0 {
                                return Boolean::TrueOrFalse;
                            }
                            falses += 1;
                        }
                        Boolean::TrueOrFalse => return Boolean::TrueOrFalse,
                    }
                }
                if trues > 0 {
                    Boolean::AlwaysTrue
                } else {
                    Boolean::AlwaysFalse
                }
            }
            _ => Boolean::TrueOrFalse,
        }
    }

    /// The exact class of the value, when uniquely determined.
    pub fn evaluate_class(&self, ctx: &TypeContext, host: &HostModel) -> Option<ClassId> {
        match self {
            TypeConstraint::Constant(v) => Some(host.class_of_value(v)),
            TypeConstraint::ExactClass(c) => Some(*c),
            TypeConstraint::ClassOrSubclass(_) => {
                let list = self.resolve(ctx, host);
                if list.is_determined() && list.classes().len() == 1 {
                    Some(list.classes()[0])
                } else {
                    None
                }
            }
            TypeConstraint::SameAs(_) => self.deref(ctx).evaluate_class(ctx, host),
            TypeConstraint::Selection(_) => {
                let list = self.resolve(ctx, host);
                let mut classes = list.classes().iter();
                let first = *classes.next()?;
                classes.all(|&c| c == first).then_some(first)
            }
            _ => None,
        }
    }

    pub fn is_exact_class(&self, ctx: &TypeContext, host: &HostModel, cls: ClassId) -> bool {
        match self {
            TypeConstraint::Constant(v) => host.class_of_value(v) == cls,
            TypeConstraint::ExactClass(c) => *c == cls,
            TypeConstraint::ClassOrSubclass(c) => {
                // A class with subclasses cannot be pinned down.
                host.subclasses(*c).is_empty() && *c == cls
            }
            TypeConstraint::SameAs(_) => self.deref(ctx).is_exact_class(ctx, host, cls),
            TypeConstraint::Selection(_) => self.evaluate_class(ctx, host) == Some(cls),
            _ => false,
        }
    }

    pub fn is_impossible_to_be_class(
        &self,
        ctx: &TypeContext,
        host: &HostModel,
        cls: ClassId,
    ) -> bool {
        match self {
            TypeConstraint::None => true,
            TypeConstraint::Any => false,
            TypeConstraint::Integer(_) => true,
            TypeConstraint::Constant(v) => host.class_of_value(v) != cls,
            TypeConstraint::Env | TypeConstraint::Lookup(_) => true,
            TypeConstraint::SameAs(_) => self.deref(ctx).is_impossible_to_be_class(ctx, host, cls),
            TypeConstraint::ExactClass(c) => *c != cls,
            TypeConstraint::ClassOrSubclass(c) => !host.is_subclass_of(cls, *c),
            TypeConstraint::Selection(_) => {
                let list = self.resolve(ctx, host);
                list.is_determined() && !list.includes(cls)
            }
            TypeConstraint::Recursion(_) => false,
        }
    }

    /// The set of classes the value may have.
    pub fn resolve(&self, ctx: &TypeContext, host: &HostModel) -> TypeList {
        match self {
            TypeConstraint::None | TypeConstraint::Env | TypeConstraint::Lookup(_) => {
                TypeList::new(Lattice::None)
            }
            TypeConstraint::Any | TypeConstraint::Integer(_) => TypeList::new(Lattice::Any),
            TypeConstraint::Constant(v) => {
                let mut list = TypeList::new(Lattice::Determined);
                list.add(host.class_of_value(v));
                list
            }
            TypeConstraint::SameAs(_) => self.deref(ctx).resolve(ctx, host),
            TypeConstraint::ExactClass(c) => {
                let mut list = TypeList::new(Lattice::Determined);
                list.add(*c);
                list
            }
            TypeConstraint::ClassOrSubclass(c) => {
                let mut list = TypeList::new(Lattice::Determined);
                list.add(*c);
                resolve_subclasses(host, *c, &mut list);
                list
            }
            TypeConstraint::Selection(types) => {
                let mut iter = types.iter();
                let Some(first) = iter.next() else {
                    return TypeList::new(Lattice::None);
                };
                let mut list = first.resolve(ctx, host);
                for t in iter {
                    if list.lattice() == Lattice::Any {
                        return list;
                    }
                    let other = t.resolve(ctx, host);
                    list.join(other);
                }
                list
            }
            // A recursive result contributes nothing new to the set.
            TypeConstraint::Recursion(_) => TypeList::new(Lattice::Determined),
        }
    }

    /// The set of host values this constraint may denote, with a flag
    /// telling whether the set is closed. Used by constant resolution to
    /// enumerate possible bases.
    pub fn resolve_to_values(&self, ctx: &TypeContext) -> (Vec<Value>, bool) {
        match self {
            TypeConstraint::None => (Vec::new(), true),
            TypeConstraint::Constant(v) => (vec![v.clone()], true),
            TypeConstraint::SameAs(_) => self.deref(ctx).resolve_to_values(ctx),
            TypeConstraint::Selection(types) => {
                let mut values = Vec::new();
                let mut determined = true;
                for t in types {
                    let (vs, d) = t.resolve_to_values(ctx);
                    determined &= d;
                    for v in vs {
                        if !values.contains(&v) {
                            values.push(v);
                        }
                    }
                }
                (values, determined)
            }
            _ => (Vec::new(), false),
        }
    }

    /// Clone resolving `SameAs` through the context, for results that
    /// outlive the source context (return types, snapshots).
    pub fn independent_clone(&self, ctx: &TypeContext) -> TypeConstraint {
        match self {
            TypeConstraint::SameAs(_) => self.deref(ctx).independent_clone(ctx),
            TypeConstraint::Selection(types) => TypeConstraint::Selection(
                types.iter().map(|t| t.independent_clone(ctx)).collect(),
            ),
            other => other.clone(),
        }
    }
}

fn resolve_subclasses(host: &HostModel, cls: ClassId, list: &mut TypeList) -> bool {
    for &sub in host.subclasses(cls) {
        if !list.includes(sub) {
            list.add(sub);
        }
        if list.classes().len() >= MAX_CANDIDATE_COUNT {
            list.set_lattice(Lattice::Any);
            return false;
        }
        if !resolve_subclasses(host, sub, list) {
            return false;
        }
    }
    true
}

// ============================================================================
// TypeList
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lattice {
    None,
    Any,
    Determined,
}

/// A resolved class set. `Determined` means the set is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeList {
    lattice: Lattice,
    classes: Vec<ClassId>,
}

impl TypeList {
    pub fn new(lattice: Lattice) -> TypeList {
        TypeList {
            lattice,
            classes: Vec::new(),
        }
    }

    pub fn lattice(&self) -> Lattice {
        self.lattice
    }

    pub fn set_lattice(&mut self, lattice: Lattice) {
        self.lattice = lattice;
    }

    pub fn is_determined(&self) -> bool {
        self.lattice == Lattice::Determined
    }

    pub fn classes(&self) -> &[ClassId] {
        &self.classes
    }

    pub fn add(&mut self, cls: ClassId) {
        self.classes.push(cls);
    }

    pub fn includes(&self, cls: ClassId) -> bool {
        self.classes.contains(&cls)
    }

    /// Lattice join with another list.
    pub fn join(&mut self, other: TypeList) {
        match (self.lattice, other.lattice) {
            (Lattice::Any, _) => {}
            (_, Lattice::Any) => {
                self.lattice = Lattice::Any;
                self.classes.clear();
            }
            (Lattice::None, _) => {
                *self = other;
            }
            (Lattice::Determined, Lattice::None) => {}
            (Lattice::Determined, Lattice::Determined) => {
                for c in other.classes {
                    if !self.classes.contains(&c) {
                        self.classes.push(c);
                    }
                }
            }
        }
    }
}

// ============================================================================
// Selection builder
// ============================================================================

/// Set-like accumulator for `Selection` constraints: dedupes by equality,
/// flattens nested selections and widens to `Any` past the candidate cap.
#[derive(Debug, Default)]
pub struct TypeSelection {
    items: Vec<TypeConstraint>,
    widened: bool,
}

impl TypeSelection {
    pub fn new() -> TypeSelection {
        TypeSelection::default()
    }

    pub fn add(&mut self, t: TypeConstraint) {
        if self.widened {
            return;
        }
        if let TypeConstraint::Selection(items) = t {
            for item in items {
                self.add(item);
            }
            return;
        }
        if self.items.iter().any(|existing| existing == &t) {
            return;
        }
        if self.items.len() >= MAX_CANDIDATE_COUNT {
            self.widened = true;
            self.items.clear();
            return;
        }
        self.items.push(t);
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.widened = false;
    }

    pub fn is_empty(&self) -> bool {
        !self.widened && self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Collapse into a constraint: empty is bottom, a singleton is the
    /// element itself, an overflowed set is `Any`.
    pub fn into_constraint(mut self) -> TypeConstraint {
        if self.widened {
            return TypeConstraint::Any;
        }
        match self.items.len() {
            0 => TypeConstraint::None,
            1 => self.items.pop().expect("one element"),
            _ => TypeConstraint::Selection(self.items),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::builtin;

    fn empty_ctx() -> TypeContext {
        TypeContext::with_capacity(8)
    }

    #[test]
    fn test_constant_truthiness() {
        let ctx = empty_ctx();
        let host = HostModel::new();
        assert_eq!(
            TypeConstraint::Constant(Value::Nil).evaluates_to_boolean(&ctx, &host),
            Boolean::AlwaysFalse
        );
        assert_eq!(
            TypeConstraint::Constant(Value::Fixnum(0)).evaluates_to_boolean(&ctx, &host),
            Boolean::AlwaysTrue
        );
        assert_eq!(
            TypeConstraint::Any.evaluates_to_boolean(&ctx, &host),
            Boolean::TrueOrFalse
        );
    }

    #[test]
    fn test_selection_boolean_join() {
        let ctx = empty_ctx();
        let host = HostModel::new();
        let both = TypeConstraint::Selection(vec![
            TypeConstraint::Constant(Value::Bool(true)),
            TypeConstraint::Constant(Value::Bool(false)),
        ]);
        assert_eq!(both.evaluates_to_boolean(&ctx, &host), Boolean::TrueOrFalse);

        let truthy = TypeConstraint::Selection(vec![
            TypeConstraint::Constant(Value::Fixnum(1)),
            TypeConstraint::Constant(Value::Fixnum(2)),
        ]);
        assert_eq!(truthy.evaluates_to_boolean(&ctx, &host), Boolean::AlwaysTrue);
    }

    #[test]
    fn test_selection_equality_is_order_insensitive() {
        let a = TypeConstraint::Selection(vec![
            TypeConstraint::ExactClass(builtin::FIXNUM),
            TypeConstraint::ExactClass(builtin::BIGNUM),
        ]);
        let b = TypeConstraint::Selection(vec![
            TypeConstraint::ExactClass(builtin::BIGNUM),
            TypeConstraint::ExactClass(builtin::FIXNUM),
        ]);
        assert_eq!(a, b);

        let single = TypeConstraint::Selection(vec![TypeConstraint::ExactClass(builtin::FIXNUM)]);
        assert_eq!(single, TypeConstraint::ExactClass(builtin::FIXNUM));
    }

    #[test]
    fn test_class_or_subclass_resolve_walks_hierarchy() {
        let ctx = empty_ctx();
        let mut host = HostModel::new();
        let base = host.define_class("Base", Some(builtin::OBJECT));
        let mid = host.define_class("Mid", Some(base));
        let leaf = host.define_class("Leaf", Some(mid));

        let list = TypeConstraint::ClassOrSubclass(base).resolve(&ctx, &host);
        assert!(list.is_determined());
        assert!(list.includes(base));
        assert!(list.includes(mid));
        assert!(list.includes(leaf));
        assert_eq!(list.classes().len(), 3);
    }

    #[test]
    fn test_class_or_subclass_resolve_widens_past_cap() {
        let ctx = empty_ctx();
        let mut host = HostModel::new();
        let base = host.define_class("Fanout", Some(builtin::OBJECT));
        for i in 0..MAX_CANDIDATE_COUNT + 2 {
            host.define_class(&format!("Fanout{}", i), Some(base));
        }
        let list = TypeConstraint::ClassOrSubclass(base).resolve(&ctx, &host);
        assert_eq!(list.lattice(), Lattice::Any);
    }

    #[test]
    fn test_selection_builder_dedupes_flattens_and_caps() {
        let mut sel = TypeSelection::new();
        sel.add(TypeConstraint::ExactClass(builtin::FIXNUM));
        sel.add(TypeConstraint::Selection(vec![
            TypeConstraint::ExactClass(builtin::FIXNUM),
            TypeConstraint::ExactClass(builtin::BIGNUM),
        ]));
        assert_eq!(sel.len(), 2);

        let mut big = TypeSelection::new();
        for i in 0..MAX_CANDIDATE_COUNT as i64 + 1 {
            big.add(TypeConstraint::Constant(Value::Fixnum(i)));
        }
        assert_eq!(big.into_constraint(), TypeConstraint::Any);
    }

    #[test]
    fn test_same_as_collapses_chains() {
        let mut ctx = TypeContext::with_capacity(3);
        ctx.set(VarId(0), TypeConstraint::Env);
        ctx.set(VarId(1), TypeConstraint::SameAs(VarId(0)));
        let t = TypeConstraint::same_as(&ctx, VarId(1));
        assert_eq!(t, TypeConstraint::SameAs(VarId(0)));
    }

    #[test]
    fn test_env_identity_needs_a_chain() {
        let mut ctx = TypeContext::with_capacity(3);
        ctx.set(VarId(0), TypeConstraint::Env);
        ctx.set(VarId(1), TypeConstraint::SameAs(VarId(0)));
        ctx.set(VarId(2), TypeConstraint::Env);

        // Chained env proves identity with its root.
        assert!(ctx.is_same_value(VarId(1), VarId(0)));
        // Two distinct env tokens do not prove anything.
        assert!(!ctx.is_same_value(VarId(2), VarId(0)));
    }
}
