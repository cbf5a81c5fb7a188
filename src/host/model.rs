//! Host class and method reflection.
//!
//! [`HostModel`] is the compiler's window into the interpreter: classes with
//! superclass/subclass links, per-class method and constant tables, and
//! method definitions that either carry an AST (compilable) or are native
//! (opaque, optionally annotated with a return type and mutator hint).
//!
//! Classes and methods live in index-addressed arenas; every cross-reference
//! in the compiler is a [`ClassId`] or [`MethodId`].

use std::collections::{HashMap, HashSet};
use std::fmt;

use super::ast::NodeRef;
use super::ids::Id;
use super::value::Value;
use crate::typing::constraint::TypeConstraint;

/// Index of a class in the host model.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// Index of a method definition in the host model.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

impl fmt::Debug for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

impl fmt::Debug for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Well-known classes created by [`HostModel::new`], in bootstrap order.
pub mod builtin {
    use super::ClassId;

    pub const OBJECT: ClassId = ClassId(0);
    pub const TRUE_CLASS: ClassId = ClassId(1);
    pub const FALSE_CLASS: ClassId = ClassId(2);
    pub const NIL_CLASS: ClassId = ClassId(3);
    pub const FIXNUM: ClassId = ClassId(4);
    pub const BIGNUM: ClassId = ClassId(5);
    pub const SYMBOL: ClassId = ClassId(6);
    pub const STRING: ClassId = ClassId(7);
    pub const ARRAY: ClassId = ClassId(8);
    pub const HASH: ClassId = ClassId(9);
    pub const RANGE: ClassId = ClassId(10);

    pub const COUNT: usize = 11;
}

/// Classification of a native method, used by the mutator tester when no
/// annotation is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
    /// Ordinary native function.
    Func,
    /// Generated attribute writer.
    AttrSet,
    /// Generated instance-variable reader.
    IVar,
    /// Interpreter-optimized dispatch (`send`, `Proc#call`, ..).
    Optimized,
}

/// Annotation the host attaches to a native method it knows about.
#[derive(Debug, Clone)]
pub struct NativeInfo {
    pub return_type: TypeConstraint,
    pub mutator: bool,
}

/// The executable body of a method.
#[derive(Debug, Clone)]
pub enum MethodBody {
    /// Interpreter-defined method with an AST; eligible for compilation
    /// and inlining.
    Ast(NodeRef),
    /// Host-implemented method. With `info` the compiler knows its return
    /// type and purity; without, calls to it degrade to `Any`.
    Native {
        kind: NativeKind,
        info: Option<NativeInfo>,
    },
}

impl MethodBody {
    pub fn ast(&self) -> Option<&NodeRef> {
        match self {
            MethodBody::Ast(node) => Some(node),
            MethodBody::Native { .. } => None,
        }
    }

    pub fn has_ast(&self) -> bool {
        self.ast().is_some()
    }
}

/// A method definition.
#[derive(Debug, Clone)]
pub struct MethodDef {
    pub name: Id,
    pub owner: ClassId,
    pub required_argc: usize,
    pub body: MethodBody,
    /// True while a JIT-compiled definition is installed in place of the
    /// original one. Cleared when the recompilation manager invalidates
    /// the method.
    pub jit_installed: bool,
}

/// Result of a constant lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstantLookup {
    Found(Value),
    /// Registered for autoloading; touching it runs arbitrary host code.
    Autoload,
    Missing,
}

/// A class definition.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: Id,
    pub superclass: Option<ClassId>,
    subclasses: Vec<ClassId>,
    methods: HashMap<Id, MethodId>,
    constants: HashMap<Id, Value>,
    autoload: HashSet<Id>,
}

/// The host interpreter's reflection surface.
#[derive(Debug, Clone)]
pub struct HostModel {
    classes: Vec<ClassDef>,
    methods: Vec<MethodDef>,
}

impl Default for HostModel {
    fn default() -> Self {
        Self::new()
    }
}

impl HostModel {
    /// Create a model with the builtin classes bootstrapped in the fixed
    /// order of [`builtin`].
    pub fn new() -> HostModel {
        let mut model = HostModel {
            classes: Vec::new(),
            methods: Vec::new(),
        };

        let object = model.define_class("Object", None);
        debug_assert_eq!(object, builtin::OBJECT);
        for name in [
            "TrueClass", "FalseClass", "NilClass", "Fixnum", "Bignum", "Symbol", "String",
            "Array", "Hash", "Range",
        ] {
            model.define_class(name, Some(builtin::OBJECT));
        }
        debug_assert_eq!(model.classes.len(), builtin::COUNT);

        model
    }

    // ========================================================================
    // Classes
    // ========================================================================

    /// Define a class, register it under its superclass and publish it as a
    /// constant on `Object`.
    pub fn define_class(&mut self, name: &str, superclass: Option<ClassId>) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        let name = Id::intern(name);
        self.classes.push(ClassDef {
            name,
            superclass,
            subclasses: Vec::new(),
            methods: HashMap::new(),
            constants: HashMap::new(),
            autoload: HashSet::new(),
        });
        if let Some(sup) = superclass {
            self.classes[sup.0 as usize].subclasses.push(id);
        }
        self.classes[builtin::OBJECT.0 as usize]
            .constants
            .insert(name, Value::Class(id));
        id
    }

    pub fn class(&self, id: ClassId) -> &ClassDef {
        &self.classes[id.0 as usize]
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn class_name(&self, id: ClassId) -> Id {
        self.class(id).name
    }

    /// Direct subclasses in registration order.
    pub fn subclasses(&self, id: ClassId) -> &[ClassId] {
        &self.class(id).subclasses
    }

    pub fn superclass(&self, id: ClassId) -> Option<ClassId> {
        self.class(id).superclass
    }

    /// True iff `cls` equals `base` or sits below it in the hierarchy.
    pub fn is_subclass_of(&self, cls: ClassId, base: ClassId) -> bool {
        let mut cur = Some(cls);
        while let Some(c) = cur {
            if c == base {
                return true;
            }
            cur = self.superclass(c);
        }
        false
    }

    /// The class of a value.
    pub fn class_of_value(&self, value: &Value) -> ClassId {
        match value {
            Value::Nil => builtin::NIL_CLASS,
            Value::Bool(true) => builtin::TRUE_CLASS,
            Value::Bool(false) => builtin::FALSE_CLASS,
            Value::Fixnum(_) => builtin::FIXNUM,
            Value::Sym(_) => builtin::SYMBOL,
            Value::Str(_) => builtin::STRING,
            // Class objects are instances of Object as far as dispatch
            // is concerned here; the model has no metaclass tower.
            Value::Class(_) => builtin::OBJECT,
        }
    }

    // ========================================================================
    // Methods
    // ========================================================================

    /// Define or redefine a method on `owner`.
    pub fn define_method(
        &mut self,
        owner: ClassId,
        name: &str,
        required_argc: usize,
        body: MethodBody,
    ) -> MethodId {
        let name = Id::intern(name);
        let id = MethodId(self.methods.len() as u32);
        self.methods.push(MethodDef {
            name,
            owner,
            required_argc,
            body,
            jit_installed: false,
        });
        self.classes[owner.0 as usize].methods.insert(name, id);
        id
    }

    pub fn method(&self, id: MethodId) -> &MethodDef {
        &self.methods[id.0 as usize]
    }

    pub fn method_mut(&mut self, id: MethodId) -> &mut MethodDef {
        &mut self.methods[id.0 as usize]
    }

    /// Look a method up by walking the superclass chain.
    pub fn find_method(&self, cls: ClassId, name: Id) -> Option<MethodId> {
        let mut cur = Some(cls);
        while let Some(c) = cur {
            if let Some(&mid) = self.class(c).methods.get(&name) {
                return Some(mid);
            }
            cur = self.superclass(c);
        }
        None
    }

    // ========================================================================
    // Constants
    // ========================================================================

    /// Register a constant directly on a class.
    pub fn define_constant(&mut self, owner: ClassId, name: &str, value: Value) {
        self.classes[owner.0 as usize]
            .constants
            .insert(Id::intern(name), value);
    }

    /// Mark a constant as autoload-registered on a class.
    pub fn register_autoload(&mut self, owner: ClassId, name: &str) {
        self.classes[owner.0 as usize]
            .autoload
            .insert(Id::intern(name));
    }

    /// Look up a constant on `cls` only.
    pub fn find_constant_in_class(&self, cls: ClassId, name: Id) -> ConstantLookup {
        let def = self.class(cls);
        if let Some(v) = def.constants.get(&name) {
            ConstantLookup::Found(v.clone())
        } else if def.autoload.contains(&name) {
            ConstantLookup::Autoload
        } else {
            ConstantLookup::Missing
        }
    }

    /// Look up a constant on `cls` and its superclasses.
    pub fn find_constant(&self, cls: ClassId, name: Id) -> ConstantLookup {
        let mut cur = Some(cls);
        while let Some(c) = cur {
            match self.find_constant_in_class(c, name) {
                ConstantLookup::Missing => cur = self.superclass(c),
                found => return found,
            }
        }
        ConstantLookup::Missing
    }

    /// Look up a free constant through a cref chain (innermost lexical
    /// scope first), then up from `Object`.
    pub fn find_constant_cref(&self, cref: &[ClassId], name: Id) -> ConstantLookup {
        for &c in cref {
            match self.find_constant_in_class(c, name) {
                ConstantLookup::Missing => continue,
                found => return found,
            }
        }
        self.find_constant(builtin::OBJECT, name)
    }

    pub fn is_autoload_registered(&self, cls: ClassId, name: Id) -> bool {
        self.class(cls).autoload.contains(&name)
    }
}

// ============================================================================
// Mutator tester
// ============================================================================

/// Decides whether a call to a native method without annotation may redefine
/// methods or constants.
#[derive(Debug, Clone)]
pub struct MutatorTester {
    names: HashSet<Id>,
}

impl Default for MutatorTester {
    fn default() -> Self {
        Self::new()
    }
}

impl MutatorTester {
    pub fn new() -> MutatorTester {
        let mut names = HashSet::new();
        for name in [
            "eval",
            "instance_eval",
            "instance_exec",
            "__send__",
            "send",
            "public_send",
            "module_exec",
            "class_exec",
            "module_eval",
            "class_eval",
            "load",
            "require",
            "gem",
        ] {
            names.insert(Id::intern(name));
        }
        MutatorTester { names }
    }

    /// Register an alias of a known mutator.
    pub fn add_alias(&mut self, name: Id) {
        self.names.insert(name);
    }

    /// Judge a native method definition by kind and name.
    pub fn is_mutator(&self, def: &MethodDef) -> bool {
        match &def.body {
            MethodBody::Native { kind, .. } => match kind {
                NativeKind::AttrSet | NativeKind::IVar => false,
                NativeKind::Func | NativeKind::Optimized => self.names.contains(&def.name),
            },
            // AST methods are judged by analysis, not by name; reaching
            // here means the caller skipped that path, so stay safe.
            MethodBody::Ast(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_order() {
        let model = HostModel::new();
        assert_eq!(model.class_name(builtin::OBJECT).name(), "Object");
        assert_eq!(model.class_name(builtin::FIXNUM).name(), "Fixnum");
        assert_eq!(model.class_name(builtin::RANGE).name(), "Range");
        assert!(model.is_subclass_of(builtin::FIXNUM, builtin::OBJECT));
        assert!(!model.is_subclass_of(builtin::OBJECT, builtin::FIXNUM));
    }

    #[test]
    fn test_method_lookup_walks_superclass_chain() {
        let mut model = HostModel::new();
        let animal = model.define_class("Animal", Some(builtin::OBJECT));
        let cat = model.define_class("Cat", Some(animal));
        let speak = model.define_method(
            animal,
            "speak",
            0,
            MethodBody::Native {
                kind: NativeKind::Func,
                info: None,
            },
        );
        assert_eq!(model.find_method(cat, Id::intern("speak")), Some(speak));
        assert_eq!(model.find_method(cat, Id::intern("missing")), None);
    }

    #[test]
    fn test_constant_lookup_modes() {
        let mut model = HostModel::new();
        let c = model.define_class("Config", Some(builtin::OBJECT));
        model.define_constant(c, "LIMIT", Value::Fixnum(10));
        model.register_autoload(c, "Lazy");

        let limit = Id::intern("LIMIT");
        assert_eq!(
            model.find_constant_in_class(c, limit),
            ConstantLookup::Found(Value::Fixnum(10))
        );
        assert_eq!(
            model.find_constant_in_class(c, Id::intern("Lazy")),
            ConstantLookup::Autoload
        );
        // Class constants published on Object are reachable via the cref
        // fallback.
        assert!(matches!(
            model.find_constant_cref(&[], Id::intern("Config")),
            ConstantLookup::Found(Value::Class(_))
        ));
        assert_eq!(
            model.find_constant_cref(&[c], limit),
            ConstantLookup::Found(Value::Fixnum(10))
        );
    }

    #[test]
    fn test_mutator_tester() {
        let tester = MutatorTester::new();
        let send = MethodDef {
            name: Id::intern("send"),
            owner: builtin::OBJECT,
            required_argc: 1,
            body: MethodBody::Native {
                kind: NativeKind::Optimized,
                info: None,
            },
            jit_installed: false,
        };
        assert!(tester.is_mutator(&send));

        let reader = MethodDef {
            name: Id::intern("x"),
            owner: builtin::OBJECT,
            required_argc: 0,
            body: MethodBody::Native {
                kind: NativeKind::IVar,
                info: None,
            },
            jit_installed: false,
        };
        assert!(!tester.is_mutator(&reader));
    }
}
