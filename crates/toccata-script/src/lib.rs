//! Typed expression evaluation and the meta-command script language that
//! drives it: `if`/`elif`/`else`, `while`/`break`, `echo`, `abort`, and
//! block-scoped variables, evaluated over a typed value lattice with an
//! external object-model lookup.

mod eval;
mod lookup;
mod script;
mod stack;
mod value;
mod vars;

pub use eval::{EvalContext, Evaluator};
pub use lookup::{LookupError, NullObjectModel, ObjectModel};
pub use script::{ScriptEvent, ScriptRunner};
pub use stack::StackGuard;
pub use value::{ScriptError, TypeCode, Value};
pub use vars::{Variable, VariableSet};
