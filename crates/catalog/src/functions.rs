//! Builtin function registration.
//!
//! The catalog carries a registry of the engine's builtin scalar and
//! aggregate functions. Registration happens once per catalog, during
//! bring-up, after the registry itself is constructed or recovered.

use crate::catalog::Catalog;

/// Function category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Scalar,
    Aggregate,
}

/// A registered function signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSig {
    pub name: &'static str,
    pub kind: FunctionKind,
}

const SCALAR_FUNCTIONS: &[&str] = &[
    "abs", "ceil", "floor", "round", "sqrt", "pow", "ln", "exp", "char_length", "lower", "upper",
    "ltrim", "rtrim", "trim", "substring", "regex",
];

const AGGREGATE_FUNCTIONS: &[&str] = &["count", "min", "max", "sum", "avg"];

/// Register the builtin function set into the catalog's registry.
pub fn register_builtin_functions(catalog: &Catalog) {
    for name in SCALAR_FUNCTIONS {
        catalog.register_function(FunctionSig {
            name,
            kind: FunctionKind::Scalar,
        });
    }
    for name in AGGREGATE_FUNCTIONS {
        catalog.register_function(FunctionSig {
            name,
            kind: FunctionKind::Aggregate,
        });
    }
}
