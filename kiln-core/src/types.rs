//! Core type system for Kiln.
//!
//! Kiln has only value types that map one-to-one onto wasm value types,
//! plus `void` for functions without a result. It does not depend on
//! parsing or code generation.

use std::fmt;

/// Represents the types of values and expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    I32,
    I64,
    F32,
    F64,
    /// Stored as `i32` (0 or 1).
    Bool,
    Void,
    /// Poison type for expressions that already produced a diagnostic.
    ///
    /// It is compatible with everything so that one mistake does not
    /// cascade into a series of follow-up errors.
    Error,
}

impl Type {
    /// Resolve a type written in source.
    pub fn from_name(name: &str) -> Option<Type> {
        let ty = match name {
            "i32" => Type::I32,
            "i64" => Type::I64,
            "f32" => Type::F32,
            "f64" => Type::F64,
            "bool" => Type::Bool,
            "void" => Type::Void,
            _ => return None,
        };
        Some(ty)
    }

    pub fn name(self) -> &'static str {
        match self {
            Type::I32 => "i32",
            Type::I64 => "i64",
            Type::F32 => "f32",
            Type::F64 => "f64",
            Type::Bool => "bool",
            Type::Void => "void",
            Type::Error => "{error}",
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Type::I32 | Type::I64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Type::F32 | Type::F64)
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn is_error(self) -> bool {
        self == Type::Error
    }

    /// Whether a value of this type can be stored in a local or global.
    pub fn is_value(self) -> bool {
        !matches!(self, Type::Void)
    }

    /// Type equality that lets the poison type through.
    pub fn compatible(self, other: Type) -> bool {
        self == other || self.is_error() || other.is_error()
    }

    /// Whether `cast(to) x` is allowed for `x: self`.
    ///
    /// Any numeric type converts to any other; `bool` converts to
    /// integers and back.
    pub fn can_cast_to(self, to: Type) -> bool {
        if self.is_error() || to.is_error() || self == to {
            return true;
        }
        match (self, to) {
            (from, to) if from.is_numeric() && to.is_numeric() => true,
            (Type::Bool, to) => to.is_integer(),
            (from, Type::Bool) => from.is_integer(),
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Function types: `(T1, ..., Tn) -> R`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionSig {
    pub params: Vec<Type>,
    pub result: Type,
}

impl FunctionSig {
    pub fn new(params: Vec<Type>, result: Type) -> Self {
        FunctionSig { params, result }
    }
}

impl fmt::Display for FunctionSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ") -> {}", self.result)
    }
}
