//! Compiler options.
//!
//! Options are keyed by a closed enumeration and take exactly one of three
//! value kinds. Each key has an expected kind that is checked when the
//! value is set. The set is frozen by `Context::start`.

use std::fmt;
use std::path::PathBuf;

use crate::error::KilnError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKey {
    NoOp,
    CurrentDirectory,

    PostMvpFeatures,
    MultiThreading,

    GenerateForeignInfo,
    GenerateTypeInfo,
    GenerateMethodInfo,
    DisableCore,
    DisableStaleCode,

    OptionalSemicolons,

    DisableFileContents,
    DisableExtensions,
}

/// The kind of an [`OptionValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Bytes,
    Int,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Str => f.write_str("string"),
            ValueKind::Bytes => f.write_str("byte buffer"),
            ValueKind::Int => f.write_str("integer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Str(String),
    Bytes(Vec<u8>),
    Int(i32),
}

impl OptionValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            OptionValue::Str(_) => ValueKind::Str,
            OptionValue::Bytes(_) => ValueKind::Bytes,
            OptionValue::Int(_) => ValueKind::Int,
        }
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Str(value)
    }
}

impl From<&[u8]> for OptionValue {
    fn from(value: &[u8]) -> Self {
        OptionValue::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for OptionValue {
    fn from(value: Vec<u8>) -> Self {
        OptionValue::Bytes(value)
    }
}

impl From<i32> for OptionValue {
    fn from(value: i32) -> Self {
        OptionValue::Int(value)
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Int(value as i32)
    }
}

/// What a key accepts.
enum Expected {
    Anything,
    /// A string, or a byte buffer holding UTF-8.
    Text,
    Int,
}

impl OptionKey {
    fn expected(self) -> Expected {
        match self {
            OptionKey::NoOp => Expected::Anything,
            OptionKey::CurrentDirectory => Expected::Text,
            _ => Expected::Int,
        }
    }
}

/// The resolved option set.
#[derive(Debug, Clone)]
pub struct Options {
    pub current_directory: PathBuf,
    pub post_mvp_features: bool,
    pub multi_threading: bool,
    pub generate_foreign_info: bool,
    pub generate_type_info: bool,
    pub generate_method_info: bool,
    pub disable_core: bool,
    pub disable_stale_code: bool,
    pub optional_semicolons: bool,
    pub disable_file_contents: bool,
    pub disable_extensions: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            current_directory: PathBuf::from("."),
            post_mvp_features: false,
            multi_threading: false,
            generate_foreign_info: false,
            generate_type_info: false,
            generate_method_info: false,
            disable_core: false,
            disable_stale_code: false,
            optional_semicolons: false,
            disable_file_contents: false,
            disable_extensions: false,
        }
    }
}

impl Options {
    /// Apply one option after checking the value against the key's expected kind.
    ///
    /// On error the set is left unchanged.
    pub fn set(&mut self, key: OptionKey, value: OptionValue) -> Result<(), KilnError> {
        match key.expected() {
            Expected::Anything => Ok(()),
            Expected::Text => {
                let text = match value {
                    OptionValue::Str(text) => text,
                    OptionValue::Bytes(bytes) => String::from_utf8(bytes)
                        .map_err(|_| KilnError::EncodingError("option value"))?,
                    OptionValue::Int(_) => {
                        return Err(KilnError::OptionType {
                            key,
                            expected: ValueKind::Str,
                            found: ValueKind::Int,
                        });
                    }
                };
                self.apply_text(key, text);
                Ok(())
            }
            Expected::Int => match value {
                OptionValue::Int(flag) => {
                    self.apply_flag(key, flag != 0);
                    Ok(())
                }
                other => Err(KilnError::OptionType {
                    key,
                    expected: ValueKind::Int,
                    found: other.kind(),
                }),
            },
        }
    }

    /// Checks performed once, when the set is frozen.
    pub fn validate(&self) -> Result<(), KilnError> {
        if !self.current_directory.is_dir() {
            return Err(KilnError::InvalidOption {
                key: OptionKey::CurrentDirectory,
                reason: format!("{} is not a directory", self.current_directory.display()),
            });
        }
        Ok(())
    }

    fn apply_text(&mut self, key: OptionKey, text: String) {
        if key == OptionKey::CurrentDirectory {
            self.current_directory = PathBuf::from(text);
        }
    }

    fn apply_flag(&mut self, key: OptionKey, on: bool) {
        let slot = match key {
            OptionKey::PostMvpFeatures => &mut self.post_mvp_features,
            OptionKey::MultiThreading => &mut self.multi_threading,
            OptionKey::GenerateForeignInfo => &mut self.generate_foreign_info,
            OptionKey::GenerateTypeInfo => &mut self.generate_type_info,
            OptionKey::GenerateMethodInfo => &mut self.generate_method_info,
            OptionKey::DisableCore => &mut self.disable_core,
            OptionKey::DisableStaleCode => &mut self.disable_stale_code,
            OptionKey::OptionalSemicolons => &mut self.optional_semicolons,
            OptionKey::DisableFileContents => &mut self.disable_file_contents,
            OptionKey::DisableExtensions => &mut self.disable_extensions,
            OptionKey::NoOp | OptionKey::CurrentDirectory => return,
        };
        *slot = on;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sets_flags_from_integers() {
        let mut options = Options::default();
        options
            .set(OptionKey::MultiThreading, OptionValue::Int(1))
            .expect("flag");
        options
            .set(OptionKey::DisableCore, true.into())
            .expect("flag");
        assert!(options.multi_threading);
        assert!(options.disable_core);

        options
            .set(OptionKey::MultiThreading, OptionValue::Int(0))
            .expect("flag");
        assert!(!options.multi_threading);
    }

    #[test]
    fn accepts_directory_as_string_or_bytes() {
        let mut options = Options::default();
        options
            .set(OptionKey::CurrentDirectory, "src".into())
            .expect("string");
        assert_eq!(options.current_directory, PathBuf::from("src"));

        options
            .set(OptionKey::CurrentDirectory, b"lib".as_slice().into())
            .expect("bytes");
        assert_eq!(options.current_directory, PathBuf::from("lib"));
    }

    #[test]
    fn rejects_wrong_value_kind() {
        let mut options = Options::default();
        let err = options
            .set(OptionKey::PostMvpFeatures, "yes".into())
            .unwrap_err();
        assert!(matches!(
            err,
            KilnError::OptionType {
                key: OptionKey::PostMvpFeatures,
                expected: ValueKind::Int,
                found: ValueKind::Str,
            }
        ));
        assert!(!options.post_mvp_features);

        let err = options
            .set(OptionKey::CurrentDirectory, OptionValue::Int(3))
            .unwrap_err();
        assert!(matches!(err, KilnError::OptionType { .. }));
    }

    #[test]
    fn rejects_non_utf8_directory_bytes() {
        let mut options = Options::default();
        let err = options
            .set(OptionKey::CurrentDirectory, OptionValue::Bytes(vec![0xff, 0xfe]))
            .unwrap_err();
        assert!(matches!(err, KilnError::EncodingError(_)));
        assert_eq!(options.current_directory, PathBuf::from("."));
    }

    #[test]
    fn no_op_accepts_anything() {
        let mut options = Options::default();
        options.set(OptionKey::NoOp, "x".into()).expect("no-op");
        options.set(OptionKey::NoOp, OptionValue::Int(5)).expect("no-op");
    }

    #[test]
    fn validate_rejects_missing_directory() {
        let mut options = Options::default();
        options
            .set(OptionKey::CurrentDirectory, "./does/not/exist".into())
            .expect("set");
        let err = options.validate().unwrap_err();
        assert!(matches!(err, KilnError::InvalidOption { .. }));
    }
}
