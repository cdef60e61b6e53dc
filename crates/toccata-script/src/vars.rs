// Scoped variable storage for scripts

use crate::value::Value;

/// One named variable. `scope` is the block nesting depth it was declared
/// at; variables die with their block. Parameters use a negative scope and
/// stay visible everywhere.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub value: Value,
    pub scope: i32,
}

/// A flat set of variables searched by name. Used for `var.*` locals,
/// `param.*` call parameters, and the `global.*` set.
#[derive(Debug, Clone, Default)]
pub struct VariableSet {
    vars: Vec<Variable>,
}

impl VariableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<&Variable> {
        self.vars.iter().find(|var| var.name == name)
    }

    pub fn insert(&mut self, name: &str, value: Value, scope: i32) {
        self.vars.push(Variable {
            name: name.to_string(),
            value,
            scope,
        });
    }

    /// Assign an existing variable. Returns false when it does not exist.
    pub fn assign(&mut self, name: &str, value: Value) -> bool {
        match self.vars.iter_mut().find(|var| var.name == name) {
            Some(var) => {
                var.value = value;
                true
            }
            None => false,
        }
    }

    /// Create the variable if missing, else assign it. Used for globals.
    pub fn insert_or_assign(&mut self, name: &str, value: Value) {
        if !self.assign(name, value.clone()) {
            self.insert(name, value, 0);
        }
    }

    /// Drop every variable declared deeper than `scope`; called when a
    /// block ends.
    pub fn end_scope(&mut self, scope: i32) {
        self.vars.retain(|var| var.scope <= scope);
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_variables_die_with_their_block() {
        let mut vars = VariableSet::new();
        vars.insert("outer", Value::Int(1), 0);
        vars.insert("inner", Value::Int(2), 2);
        assert!(vars.lookup("inner").is_some());

        vars.end_scope(1);
        assert!(vars.lookup("inner").is_none());
        assert!(vars.lookup("outer").is_some());
    }

    #[test]
    fn assign_only_touches_existing_names() {
        let mut vars = VariableSet::new();
        assert!(!vars.assign("missing", Value::Int(1)));
        vars.insert("x", Value::Int(1), 0);
        assert!(vars.assign("x", Value::Int(5)));
        match vars.lookup("x").unwrap().value {
            Value::Int(v) => assert_eq!(v, 5),
            _ => unreachable!(),
        }
    }
}
