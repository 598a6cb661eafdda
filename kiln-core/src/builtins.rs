//! Built-in functions.
//!
//! Builtins are visible in every unit without a declaration and lower to
//! single wasm instructions, so they never appear as imports.

use crate::types::{FunctionSig, Type};

/// Kind of builtin, used by lowering to pick the instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinKind {
    /// `sqrt(x: f64) -> f64`
    Sqrt,
    /// `floor(x: f64) -> f64`
    Floor,
    /// `ceil(x: f64) -> f64`
    Ceil,
    /// `trunc(x: f64) -> f64`
    Trunc,
    /// `trap()`: aborts execution with a wasm trap.
    Trap,
}

impl BuiltinKind {
    pub fn signature(self) -> FunctionSig {
        match self {
            BuiltinKind::Sqrt | BuiltinKind::Floor | BuiltinKind::Ceil | BuiltinKind::Trunc => {
                FunctionSig::new(vec![Type::F64], Type::F64)
            }
            BuiltinKind::Trap => FunctionSig::new(Vec::new(), Type::Void),
        }
    }

    /// Calls to this builtin never return.
    pub fn diverges(self) -> bool {
        self == BuiltinKind::Trap
    }
}

/// Metadata about a single builtin symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinDescriptor {
    /// Name of the builtin at the language level.
    pub name: &'static str,
    pub kind: BuiltinKind,
}

/// The complete list of builtins known to the compiler.
pub const BUILTINS: &[BuiltinDescriptor] = &[
    BuiltinDescriptor {
        name: "sqrt",
        kind: BuiltinKind::Sqrt,
    },
    BuiltinDescriptor {
        name: "floor",
        kind: BuiltinKind::Floor,
    },
    BuiltinDescriptor {
        name: "ceil",
        kind: BuiltinKind::Ceil,
    },
    BuiltinDescriptor {
        name: "trunc",
        kind: BuiltinKind::Trunc,
    },
    BuiltinDescriptor {
        name: "trap",
        kind: BuiltinKind::Trap,
    },
];

/// Look up a builtin by name. The table is small; a linear scan is enough.
pub fn find_builtin(name: &str) -> Option<&'static BuiltinDescriptor> {
    BUILTINS.iter().find(|b| b.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_builtins_by_name() {
        let sqrt = find_builtin("sqrt").expect("sqrt is a builtin");
        assert_eq!(sqrt.kind, BuiltinKind::Sqrt);
        assert_eq!(sqrt.kind.signature().params, vec![Type::F64]);
        assert!(find_builtin("print").is_none());
    }

    #[test]
    fn only_trap_diverges() {
        assert!(BuiltinKind::Trap.diverges());
        assert!(
            BUILTINS
                .iter()
                .filter(|b| b.kind.diverges())
                .all(|b| b.name == "trap")
        );
    }
}
