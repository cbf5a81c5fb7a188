//! The primitive catalogue.
//!
//! Primitives are the low-level operations method bodies are allowed to name
//! directly (`jit__is_fixnum(x)` and friends). The builder lowers a funcall
//! whose name is in this catalogue to a `Primitive` opcode instead of a
//! lookup/call pair; the type analyzer consumes each entry's declared result
//! constraint. Lowerings to native code belong to the code generator and are
//! not represented here.
//!
//! The catalogue is a process-wide, read-mostly table seeded once with the
//! builtin set; hosts may register additional entries at runtime.

use std::sync::LazyLock;

use dashmap::DashMap;

use super::ids::Id;
use super::model::builtin;
use crate::typing::constraint::TypeConstraint;

/// One catalogue entry.
#[derive(Debug, Clone)]
pub struct Primitive {
    /// Expected argument count; `None` means variadic.
    pub argc: Option<usize>,
    /// Result type constraint the analyzer assigns to the lhs.
    pub result: TypeConstraint,
}

/// Global name → primitive table.
pub struct PrimitiveStore {
    table: DashMap<Id, Primitive>,
}

impl PrimitiveStore {
    pub fn is_primitive(&self, name: Id) -> bool {
        self.table.contains_key(&name)
    }

    pub fn get(&self, name: Id) -> Option<Primitive> {
        self.table.get(&name).map(|entry| entry.value().clone())
    }

    /// Register (or replace) a catalogue entry.
    pub fn register(&self, name: Id, primitive: Primitive) {
        self.table.insert(name, primitive);
    }
}

fn true_or_false() -> TypeConstraint {
    TypeConstraint::Selection(vec![
        TypeConstraint::Constant(crate::host::value::Value::Bool(true)),
        TypeConstraint::Constant(crate::host::value::Value::Bool(false)),
    ])
}

static PRIMITIVE_STORE: LazyLock<PrimitiveStore> = LazyLock::new(|| {
    let store = PrimitiveStore {
        table: DashMap::new(),
    };

    let entries: &[(&str, Option<usize>, TypeConstraint)] = &[
        ("jit__test", Some(1), true_or_false()),
        ("jit__test_not", Some(1), true_or_false()),
        ("jit__is_true", Some(1), true_or_false()),
        ("jit__is_false", Some(1), true_or_false()),
        ("jit__is_nil", Some(1), true_or_false()),
        ("jit__is_fixnum", Some(1), true_or_false()),
        ("jit__class_of", Some(1), TypeConstraint::Any),
        ("jit__bitwise_compare_eq", Some(2), true_or_false()),
        ("jit__bitwise_add", Some(2), TypeConstraint::Any),
        ("jit__bitwise_sub", Some(2), TypeConstraint::Any),
        ("jit__bitwise_add_overflow", Some(2), true_or_false()),
        ("jit__bitwise_sub_overflow", Some(2), true_or_false()),
        (
            "jit__typecast_fixnum",
            Some(1),
            TypeConstraint::ExactClass(builtin::FIXNUM),
        ),
        (
            "jit__typecast_fixnum_bignum",
            Some(1),
            TypeConstraint::Selection(vec![
                TypeConstraint::ExactClass(builtin::FIXNUM),
                TypeConstraint::ExactClass(builtin::BIGNUM),
            ]),
        ),
        (
            "jit__convert_to_array",
            Some(1),
            TypeConstraint::ExactClass(builtin::ARRAY),
        ),
        (
            "jit__concat_arrays",
            Some(2),
            TypeConstraint::ExactClass(builtin::ARRAY),
        ),
        (
            "jit__push_to_array",
            Some(2),
            TypeConstraint::ExactClass(builtin::ARRAY),
        ),
        (
            "jit__convert_to_string",
            Some(1),
            TypeConstraint::ExactClass(builtin::STRING),
        ),
        (
            "jit__concat_strings",
            None,
            TypeConstraint::ExactClass(builtin::STRING),
        ),
    ];
    for (name, argc, result) in entries {
        store.register(
            Id::intern(name),
            Primitive {
                argc: *argc,
                result: result.clone(),
            },
        );
    }

    store
});

/// Access the process-wide primitive catalogue.
pub fn global_primitive_store() -> &'static PrimitiveStore {
    &PRIMITIVE_STORE
}

/// Shorthand query used by the CFG builder.
pub fn is_primitive(name: Id) -> bool {
    global_primitive_store().is_primitive(name)
}

// Names referenced by the compiler itself.

pub fn is_true_name() -> Id {
    Id::intern("jit__is_true")
}

pub fn is_false_name() -> Id {
    Id::intern("jit__is_false")
}

pub fn is_nil_name() -> Id {
    Id::intern("jit__is_nil")
}

pub fn is_fixnum_name() -> Id {
    Id::intern("jit__is_fixnum")
}

pub fn class_of_name() -> Id {
    Id::intern("jit__class_of")
}

pub fn bitwise_compare_eq_name() -> Id {
    Id::intern("jit__bitwise_compare_eq")
}

pub fn typecast_fixnum_name() -> Id {
    Id::intern("jit__typecast_fixnum")
}

pub fn typecast_fixnum_bignum_name() -> Id {
    Id::intern("jit__typecast_fixnum_bignum")
}

pub fn convert_to_array_name() -> Id {
    Id::intern("jit__convert_to_array")
}

pub fn concat_arrays_name() -> Id {
    Id::intern("jit__concat_arrays")
}

pub fn push_to_array_name() -> Id {
    Id::intern("jit__push_to_array")
}

pub fn convert_to_string_name() -> Id {
    Id::intern("jit__convert_to_string")
}

pub fn concat_strings_name() -> Id {
    Id::intern("jit__concat_strings")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalogue_is_seeded() {
        assert!(is_primitive(is_fixnum_name()));
        assert!(is_primitive(concat_strings_name()));
        assert!(!is_primitive(Id::intern("definitely_not_a_primitive")));
    }

    #[test]
    fn test_catalogue_entries_carry_types() {
        let p = global_primitive_store()
            .get(typecast_fixnum_name())
            .unwrap();
        assert_eq!(p.argc, Some(1));
        assert_eq!(p.result, TypeConstraint::ExactClass(builtin::FIXNUM));
    }

    #[test]
    fn test_host_registration() {
        let name = Id::intern("jit__custom_test");
        global_primitive_store().register(
            name,
            Primitive {
                argc: Some(1),
                result: TypeConstraint::Any,
            },
        );
        assert!(is_primitive(name));
    }
}
