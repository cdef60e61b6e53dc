// External object-model lookup seam

use crate::value::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LookupError {
    #[error("unknown value '{0}'")]
    UnknownPath(String),

    #[error("array index out of bounds in '{path}': {index}")]
    IndexOutOfBounds { path: String, index: i32 },
}

/// The object model is an external capability: the evaluator hands over a
/// dotted path (with `^` marking where each index from `indices` applies)
/// and receives a typed value. `want_length` asks for an array length,
/// `want_exists` for a boolean existence check.
pub trait ObjectModel {
    fn lookup(
        &self,
        path: &str,
        indices: &[i32],
        want_length: bool,
        want_exists: bool,
    ) -> Result<Value, LookupError>;
}

/// An object model with nothing in it. `exists` queries answer false,
/// everything else is unknown.
pub struct NullObjectModel;

impl ObjectModel for NullObjectModel {
    fn lookup(
        &self,
        path: &str,
        _indices: &[i32],
        _want_length: bool,
        want_exists: bool,
    ) -> Result<Value, LookupError> {
        if want_exists {
            Ok(Value::Bool(false))
        } else {
            Err(LookupError::UnknownPath(path.to_string()))
        }
    }
}
