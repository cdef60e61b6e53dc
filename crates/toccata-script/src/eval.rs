// Recursive-descent expression evaluator over the typed value lattice
//
// The grammar and semantics follow the printer's command language: infix
// operators with the precedence table below, short-circuit forms that parse
// but do not evaluate their dead operands, numeric type balancing, and
// identifier paths resolved against scoped variables or the external object
// model. The parser recurses, so every deeper call is policed by the stack
// guard.

use std::cell::Cell;

use crate::lookup::ObjectModel;
use crate::stack::{self, StackGuard};
use crate::value::{days_from_civil, ScriptError, TypeCode, Value, MAX_FLOAT_DIGITS};
use crate::vars::VariableSet;

/// Binary operator characters; for the two-character operators `<=`, `>=`
/// and `!=` this is the first character.
const OPERATORS: &[u8] = b"?^&|!=<>+-*/";
const PRIORITIES: &[u8] = &[1, 2, 3, 3, 4, 4, 4, 4, 5, 5, 6, 6];
/// Must be higher than any binary operator priority.
const UNARY_PRIORITY: u8 = 10;

const NAMED_CONSTANTS: &[&str] = &["false", "iterations", "line", "null", "pi", "result", "true"];
const FUNCTIONS: &[&str] = &[
    "abs", "acos", "asin", "atan", "atan2", "cos", "datetime", "degrees", "exists", "floor",
    "isnan", "max", "min", "mod", "radians", "random", "sin", "sqrt", "tan",
];

const INVALID_EXISTS: &str = "invalid 'exists' expression";

/// Everything an expression can reach besides its own text: the scoped
/// variable sets, the object model, and the per-line state behind the
/// `iterations`, `result` and `line` constants.
pub struct EvalContext<'a> {
    pub vars: &'a VariableSet,
    pub params: &'a VariableSet,
    pub globals: &'a VariableSet,
    pub model: &'a dyn ObjectModel,
    pub iterations: Option<i32>,
    pub last_result: i32,
    pub line_number: u32,
    pub rng: &'a Cell<u32>,
}

pub struct Evaluator<'a, 'c> {
    text: &'a str,
    pos: usize,
    consumed: u32,
    column_offset: u32,
    ctx: &'a EvalContext<'c>,
    stack: StackGuard,
}

impl<'a, 'c> Evaluator<'a, 'c> {
    pub fn new(text: &'a str, column_offset: u32, ctx: &'a EvalContext<'c>) -> Self {
        Self {
            text,
            pos: 0,
            consumed: 0,
            column_offset,
            ctx,
            stack: StackGuard::new(),
        }
    }

    /// Evaluate one expression starting at the cursor. With `evaluate`
    /// false the expression is parsed but unresolved operands become
    /// defaults and type errors are suppressed.
    pub fn parse(&mut self, evaluate: bool) -> Result<Value, ScriptError> {
        self.parse_internal(evaluate, 0)
    }

    pub fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    pub fn advance(&mut self) {
        if let Some(c) = self.current_char() {
            self.pos += c.len_utf8();
            self.consumed += 1;
        }
    }

    pub fn skip_whitespace(&mut self) {
        while matches!(self.current_char(), Some(' ') | Some('\t')) {
            self.advance();
        }
    }

    pub fn at_end(&self) -> bool {
        self.current_char().is_none()
    }

    /// Error if anything but whitespace remains.
    pub fn check_for_extra_characters(&mut self) -> Result<(), ScriptError> {
        self.skip_whitespace();
        if self.current_char().is_some() {
            return Err(self.error("unexpected characters after expression"));
        }
        Ok(())
    }

    fn column(&self) -> u32 {
        self.column_offset + self.consumed
    }

    pub fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::new(self.ctx.line_number, self.column(), message)
    }

    fn check_stack(&self, called_budget: usize) -> Result<(), ScriptError> {
        self.stack
            .check(called_budget)
            .map_err(|_| self.error("expression nesting too deep"))
    }

    /// Evaluate a bracketed expression up to the given closing bracket.
    fn parse_expect_closing(
        &mut self,
        evaluate: bool,
        closing: char,
    ) -> Result<Value, ScriptError> {
        self.check_stack(stack::PARSE_INTERNAL)?;
        let value = self.parse_internal(evaluate, 0)?;
        if self.current_char() != Some(closing) {
            return Err(self.error(format!("expected '{closing}'")));
        }
        self.advance();
        Ok(value)
    }

    /// Evaluate an expression, stopping before any binary operator with
    /// priority `priority` or lower.
    fn parse_internal(&mut self, evaluate: bool, priority: u8) -> Result<Value, ScriptError> {
        self.skip_whitespace();

        // Unary operator, bracket, literal or identifier first.
        let mut val = match self.current_char() {
            Some('"') => self.parse_quoted_string()?,
            Some('-') => {
                self.advance();
                self.check_stack(stack::PARSE_INTERNAL)?;
                let operand = self.parse_internal(evaluate, UNARY_PRIORITY)?;
                match operand {
                    Value::Int(i) => Value::Int(-i),
                    Value::Float { value, digits } => Value::Float {
                        value: -value,
                        digits,
                    },
                    _ => return Err(self.error("expected numeric value after '-'")),
                }
            }
            Some('+') => {
                self.advance();
                self.check_stack(stack::PARSE_INTERNAL)?;
                let operand = self.parse_internal(evaluate, UNARY_PRIORITY)?;
                match operand {
                    // Unary plus converts an enumeration to an integer and
                    // a DateTime to its seconds count.
                    Value::Uint(u) => Value::Int(u as i32),
                    Value::DateTime(s) => Value::Int(s as i32),
                    v @ (Value::Int(_) | Value::Float { .. }) => v,
                    _ => {
                        return Err(self.error("expected numeric or enumeration value after '+'"))
                    }
                }
            }
            Some('#') => {
                self.advance();
                self.skip_whitespace();
                if self.current_char().is_some_and(|c| c.is_ascii_alphabetic()) {
                    // Applying # to an object model array: ask for just the
                    // length.
                    self.check_stack(stack::PARSE_IDENTIFIER)?;
                    self.parse_identifier_expression(evaluate, true, false)?
                } else {
                    self.check_stack(stack::PARSE_INTERNAL)?;
                    let operand = self.parse_internal(evaluate, UNARY_PRIORITY)?;
                    match operand {
                        Value::Str(s) => Value::Int(s.chars().count() as i32),
                        _ => {
                            return Err(
                                self.error("expected object model value or string after '#'")
                            )
                        }
                    }
                }
            }
            Some('{') => {
                self.advance();
                self.parse_expect_closing(evaluate, '}')?
            }
            Some('(') => {
                self.advance();
                self.parse_expect_closing(evaluate, ')')?
            }
            Some('!') => {
                self.advance();
                self.check_stack(stack::PARSE_INTERNAL)?;
                let mut operand = self.parse_internal(evaluate, UNARY_PRIORITY)?;
                self.convert_to_bool(&mut operand, evaluate)?;
                match operand {
                    Value::Bool(b) => Value::Bool(!b),
                    _ => unreachable!(),
                }
            }
            Some(c) if c.is_ascii_digit() => self.parse_number()?,
            Some(c) if c.is_ascii_alphabetic() => {
                self.check_stack(stack::PARSE_IDENTIFIER)?;
                self.parse_identifier_expression(evaluate, false, false)?
            }
            _ => return Err(self.error("expected an expression")),
        };

        // Binary operators while their priority is high enough.
        loop {
            self.skip_whitespace();
            let Some(op_char) = self.current_char() else {
                return Ok(val);
            };
            let Some(index) = OPERATORS.iter().position(|&b| b as char == op_char) else {
                return Ok(val);
            };
            let op_priority = PRIORITIES[index];
            if op_priority <= priority {
                return Ok(val);
            }
            self.advance();

            // Two-character forms: != turns into inverted =, >= and <= into
            // the inverted opposite comparison.
            let mut op_char = op_char;
            let mut invert = false;
            if op_char == '!' {
                if self.current_char() != Some('=') {
                    return Err(self.error("expected '='"));
                }
                invert = true;
                self.advance();
                op_char = '=';
            } else if (op_char == '>' || op_char == '<') && self.current_char() == Some('=') {
                invert = true;
                self.advance();
                op_char = if op_char == '>' { '<' } else { '>' };
            }

            // Allow == && || as alternatives to = & |.
            if matches!(op_char, '=' | '&' | '|') && self.current_char() == Some(op_char) {
                self.advance();
            }

            match op_char {
                '&' => {
                    self.convert_to_bool(&mut val, evaluate)?;
                    let lhs = matches!(val, Value::Bool(true));
                    self.check_stack(stack::PARSE_INTERNAL)?;
                    let mut rhs = self.parse_internal(evaluate && lhs, op_priority)?;
                    if lhs {
                        self.convert_to_bool(&mut rhs, evaluate)?;
                        val = rhs;
                    }
                }
                '|' => {
                    self.convert_to_bool(&mut val, evaluate)?;
                    let lhs = matches!(val, Value::Bool(true));
                    self.check_stack(stack::PARSE_INTERNAL)?;
                    let mut rhs = self.parse_internal(evaluate && !lhs, op_priority)?;
                    if !lhs {
                        self.convert_to_bool(&mut rhs, evaluate)?;
                        val = rhs;
                    }
                }
                '?' => {
                    self.convert_to_bool(&mut val, evaluate)?;
                    let condition = matches!(val, Value::Bool(true));
                    self.check_stack(stack::PARSE_INTERNAL)?;
                    let second = self.parse_internal(evaluate && condition, op_priority)?;
                    if self.current_char() != Some(':') {
                        return Err(self.error("expected ':'"));
                    }
                    self.advance();
                    // The third operand may itself be a conditional.
                    let third = self.parse_internal(evaluate && !condition, op_priority - 1)?;
                    return Ok(if condition { second } else { third });
                }
                _ => {
                    self.check_stack(stack::PARSE_INTERNAL)?;
                    let mut rhs = self.parse_internal(evaluate, op_priority)?;
                    val = self.apply_binary(op_char, invert, val, &mut rhs, evaluate)?;
                }
            }
        }
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.text[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn apply_binary(
        &mut self,
        op: char,
        invert: bool,
        mut val: Value,
        rhs: &mut Value,
        evaluate: bool,
    ) -> Result<Value, ScriptError> {
        match op {
            '+' => {
                if let Value::DateTime(seconds) = val {
                    match *rhs {
                        Value::Uint(u) => Ok(Value::datetime(seconds + u as u64)),
                        Value::Int(i) => Ok(Value::datetime((seconds as i64 + i as i64) as u64)),
                        _ if evaluate => Err(self.error("invalid operand types")),
                        _ => Ok(Value::DateTime(seconds)),
                    }
                } else {
                    self.balance_numeric(&mut val, rhs, evaluate)?;
                    Ok(match (&val, &*rhs) {
                        (
                            Value::Float { value: a, digits: da },
                            Value::Float { value: b, digits: db },
                        ) => Value::Float {
                            value: a + b,
                            digits: (*da).max(*db),
                        },
                        (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(*b)),
                        _ => unreachable!(),
                    })
                }
            }
            '-' => {
                if let Value::DateTime(seconds) = val {
                    match *rhs {
                        Value::DateTime(other) => Ok(Value::Int((seconds as i64 - other as i64) as i32)),
                        Value::Uint(u) => Ok(Value::datetime(seconds.wrapping_sub(u as u64))),
                        Value::Int(i) => {
                            Ok(Value::datetime((seconds as i64).wrapping_sub(i as i64) as u64))
                        }
                        _ if evaluate => Err(self.error("invalid operand types")),
                        _ => Ok(Value::DateTime(seconds)),
                    }
                } else {
                    self.balance_numeric(&mut val, rhs, evaluate)?;
                    Ok(match (&val, &*rhs) {
                        (
                            Value::Float { value: a, digits: da },
                            Value::Float { value: b, digits: db },
                        ) => Value::Float {
                            value: a - b,
                            digits: (*da).max(*db),
                        },
                        (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_sub(*b)),
                        _ => unreachable!(),
                    })
                }
            }
            '*' => {
                self.balance_numeric(&mut val, rhs, evaluate)?;
                Ok(match (&val, &*rhs) {
                    (
                        Value::Float { value: a, digits: da },
                        Value::Float { value: b, digits: db },
                    ) => Value::Float {
                        value: a * b,
                        digits: (*da).max(*db),
                    },
                    (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_mul(*b)),
                    _ => unreachable!(),
                })
            }
            '/' => {
                self.convert_to_float(&mut val, evaluate)?;
                self.convert_to_float(rhs, evaluate)?;
                match (&val, &*rhs) {
                    (Value::Float { value: a, .. }, Value::Float { value: b, .. }) => {
                        Ok(Value::float(a / b))
                    }
                    _ => unreachable!(),
                }
            }
            '>' | '<' => {
                self.balance(&mut val, rhs, evaluate)?;
                let greater = op == '>';
                let result = match (&val, &*rhs) {
                    (Value::Int(a), Value::Int(b)) => {
                        if greater { a > b } else { a < b }
                    }
                    (Value::Float { value: a, .. }, Value::Float { value: b, .. }) => {
                        if greater { a > b } else { a < b }
                    }
                    (Value::DateTime(a), Value::DateTime(b)) => {
                        if greater { a > b } else { a < b }
                    }
                    (Value::Bool(a), Value::Bool(b)) => {
                        if greater { *a && !*b } else { !*a && *b }
                    }
                    _ => {
                        if evaluate {
                            return Err(self.error(
                                "expected numeric or Boolean operands to comparison operator",
                            ));
                        }
                        false
                    }
                };
                Ok(Value::Bool(result != invert))
            }
            '=' => {
                // Comparisons with null come before balancing.
                let result = if matches!(val, Value::None) {
                    matches!(*rhs, Value::None)
                } else if matches!(*rhs, Value::None) {
                    false
                } else {
                    self.balance(&mut val, rhs, evaluate)?;
                    match (&val, &*rhs) {
                        (Value::Object(_), _) | (_, Value::Object(_)) => {
                            return Err(self.error("cannot compare objects"))
                        }
                        (Value::Int(a), Value::Int(b)) => a == b,
                        (Value::Uint(a), Value::Uint(b)) => a == b,
                        (Value::Uint64(a), Value::Uint64(b)) => a == b,
                        (Value::Float { value: a, .. }, Value::Float { value: b, .. }) => a == b,
                        (Value::DateTime(a), Value::DateTime(b)) => a == b,
                        (Value::Bool(a), Value::Bool(b)) => a == b,
                        (Value::Str(a), Value::Str(b)) => a == b,
                        _ => {
                            if evaluate {
                                return Err(
                                    self.error("unexpected operand type to equality operator")
                                );
                            }
                            false
                        }
                    }
                };
                Ok(Value::Bool(result != invert))
            }
            '^' => {
                let mut text = val.to_string();
                text.push_str(&rhs.to_string());
                Ok(Value::Str(text))
            }
            _ => unreachable!("operator table out of sync"),
        }
    }

    fn balance_numeric(
        &self,
        a: &mut Value,
        b: &mut Value,
        evaluate: bool,
    ) -> Result<(), ScriptError> {
        // Unsigned operands become float first.
        if matches!(a.type_code(), TypeCode::Uint32 | TypeCode::Uint64) {
            self.convert_to_float(a, evaluate)?;
        }
        if matches!(b.type_code(), TypeCode::Uint32 | TypeCode::Uint64) {
            self.convert_to_float(b, evaluate)?;
        }

        if a.type_code() == TypeCode::Float {
            self.convert_to_float(b, evaluate)?;
        } else if b.type_code() == TypeCode::Float {
            self.convert_to_float(a, evaluate)?;
        } else if a.type_code() != TypeCode::Int32 || b.type_code() != TypeCode::Int32 {
            if evaluate {
                return Err(self.error("expected numeric operands"));
            }
            *a = Value::Int(0);
            *b = Value::Int(0);
        }
        Ok(())
    }

    /// Balance types for a comparison operator; additionally coerces types
    /// with no literal form to string when compared against a string.
    fn balance(&self, a: &mut Value, b: &mut Value, evaluate: bool) -> Result<(), ScriptError> {
        if matches!(a.type_code(), TypeCode::Uint32 | TypeCode::Uint64) {
            self.convert_to_float(a, evaluate)?;
        }
        if matches!(b.type_code(), TypeCode::Uint32 | TypeCode::Uint64) {
            self.convert_to_float(b, evaluate)?;
        }

        if a.type_code() == b.type_code() || (a.is_string() && b.is_string()) {
            return Ok(());
        }
        if a.type_code() == TypeCode::Float {
            self.convert_to_float(b, evaluate)?;
        } else if b.type_code() == TypeCode::Float {
            self.convert_to_float(a, evaluate)?;
        } else if b.is_string() && Value::has_no_literal_form(a.type_code()) {
            self.convert_to_string(a, evaluate);
        } else if a.is_string() && Value::has_no_literal_form(b.type_code()) {
            self.convert_to_string(b, evaluate);
        } else {
            if evaluate {
                return Err(self.error("cannot convert operands to same type"));
            }
            *a = Value::Int(0);
            *b = Value::Int(0);
        }
        Ok(())
    }

    fn convert_to_float(&self, value: &mut Value, evaluate: bool) -> Result<(), ScriptError> {
        match *value {
            Value::Uint(u) => {
                *value = Value::Float {
                    value: u as f32,
                    digits: 1,
                }
            }
            Value::Uint64(u) => {
                *value = Value::Float {
                    value: u as f32,
                    digits: 1,
                }
            }
            Value::Int(i) => {
                *value = Value::Float {
                    value: i as f32,
                    digits: 1,
                }
            }
            Value::Float { .. } => {}
            _ => {
                if evaluate {
                    return Err(self.error("expected numeric operand"));
                }
                *value = Value::Float {
                    value: 0.0,
                    digits: 1,
                };
            }
        }
        Ok(())
    }

    fn convert_to_bool(&self, value: &mut Value, evaluate: bool) -> Result<(), ScriptError> {
        if !matches!(value, Value::Bool(_)) {
            if evaluate {
                return Err(self.error("expected Boolean operand"));
            }
            *value = Value::Bool(false);
        }
        Ok(())
    }

    fn convert_to_string(&self, value: &mut Value, evaluate: bool) {
        if !value.is_string() {
            *value = if evaluate {
                Value::Str(value.to_string())
            } else {
                Value::Str(String::new())
            };
        }
    }

    /// Parse a number literal: decimal integer, decimal float with optional
    /// exponent, or 0x hexadecimal.
    fn parse_number(&mut self) -> Result<Value, ScriptError> {
        let start = self.pos;
        if self.current_char() == Some('0') && matches!(self.peek_second(), Some('x') | Some('X'))
        {
            self.advance();
            self.advance();
            let digits_start = self.pos;
            while self.current_char().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.advance();
            }
            let digits = &self.text[digits_start..self.pos];
            let parsed = i64::from_str_radix(digits, 16)
                .map_err(|_| self.error("invalid hexadecimal constant"))?;
            return Ok(if let Ok(small) = i32::try_from(parsed) {
                Value::Int(small)
            } else {
                Value::Uint64(parsed as u64)
            });
        }

        let mut digits_after_point = 0u32;
        let mut is_float = false;
        while self.current_char().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        if self.current_char() == Some('.') {
            is_float = true;
            self.advance();
            while self.current_char().is_some_and(|c| c.is_ascii_digit()) {
                digits_after_point += 1;
                self.advance();
            }
        }
        if matches!(self.current_char(), Some('e') | Some('E')) {
            is_float = true;
            self.advance();
            if matches!(self.current_char(), Some('+') | Some('-')) {
                self.advance();
            }
            while self.current_char().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }

        let literal = &self.text[start..self.pos];
        if !is_float {
            if let Ok(value) = literal.parse::<i32>() {
                return Ok(Value::Int(value));
            }
        }
        let value: f32 = literal
            .parse()
            .map_err(|_| self.error(format!("invalid number '{literal}'")))?;
        Ok(Value::Float {
            value,
            digits: digits_after_point.clamp(1, MAX_FLOAT_DIGITS as u32) as u8,
        })
    }

    /// Parse a quoted string, given that the current character is the
    /// opening double quote. Doubled quotes collapse to one; a single quote
    /// lower-cases a following letter or, doubled, produces itself.
    fn parse_quoted_string(&mut self) -> Result<Value, ScriptError> {
        let mut result = String::new();
        self.advance();
        loop {
            let Some(mut c) = self.current_char() else {
                return Err(self.error("unterminated string"));
            };
            self.advance();
            if c.is_control() {
                return Err(self.error("control character in string"));
            }
            if c == '"' {
                if self.current_char() != Some('"') {
                    return Ok(Value::Str(result));
                }
                self.advance();
            } else if c == '\'' {
                match self.current_char() {
                    Some(next) if next.is_ascii_alphabetic() => {
                        c = next.to_ascii_lowercase();
                        self.advance();
                    }
                    Some('\'') => {
                        self.advance();
                    }
                    _ => {}
                }
            }
            result.push(c);
        }
    }

    /// Parse an identifier path with optional `[index]` expressions and
    /// resolve it: named constant, function call, scoped variable, or
    /// object-model value. Index expressions are evaluated, collected, and
    /// marked with `^` in the path handed to the object model.
    fn parse_identifier_expression(
        &mut self,
        evaluate: bool,
        want_length: bool,
        want_exists: bool,
    ) -> Result<Value, ScriptError> {
        if !self.current_char().is_some_and(|c| c.is_ascii_alphabetic()) {
            return Err(self.error("expected an identifier"));
        }

        let mut id = String::new();
        let mut indices: Vec<i32> = Vec::new();
        while let Some(c) = self.current_char() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                self.advance();
                id.push(c);
            } else if c == '[' {
                self.advance();
                self.check_stack(stack::PARSE_INTERNAL)?;
                let index = self.parse_internal(evaluate, 0)?;
                if self.current_char() != Some(']') {
                    return Err(self.error("expected ']'"));
                }
                let index = match index {
                    Value::Int(i) => i,
                    _ if evaluate => return Err(self.error("expected integer expression")),
                    _ => 0,
                };
                self.advance();
                indices.push(index);
                id.push('^');
            } else {
                break;
            }
        }

        if NAMED_CONSTANTS.contains(&id.as_str()) {
            if want_exists {
                return Err(self.error(INVALID_EXISTS));
            }
            return match id.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::None),
                "pi" => Ok(Value::float(std::f32::consts::PI)),
                "iterations" => match self.ctx.iterations {
                    Some(count) => Ok(Value::Int(count)),
                    None => Err(self.error("'iterations' used when not inside a loop")),
                },
                "result" => Ok(Value::Int(self.ctx.last_result)),
                "line" => Ok(Value::Int(self.ctx.line_number as i32)),
                _ => unreachable!(),
            };
        }

        self.skip_whitespace();
        if self.current_char() == Some('(') {
            if want_exists {
                return Err(self.error(INVALID_EXISTS));
            }
            if !FUNCTIONS.contains(&id.as_str()) {
                return Err(self.error("unknown function"));
            }
            self.advance();

            let result = if id == "exists" {
                self.check_stack(stack::PARSE_IDENTIFIER)?;
                self.parse_identifier_expression(evaluate, false, true)?
            } else {
                self.check_stack(stack::PARSE_INTERNAL)?;
                let first = self.parse_internal(evaluate, 0)?;
                self.apply_function(&id, first, evaluate)?
            };

            self.skip_whitespace();
            if self.current_char() != Some(')') {
                return Err(self.error("expected ')'"));
            }
            self.advance();
            return Ok(result);
        }

        // When not evaluating, the path does not have to exist; expressions
        // like `exists(var.x) && var.x = 1` depend on that.
        if !evaluate {
            return Ok(Value::None);
        }

        if let Some(name) = id.strip_prefix("param.") {
            return self.variable_value(self.ctx.params, name, "parameter", want_exists);
        }
        if let Some(name) = id.strip_prefix("global.") {
            return self.variable_value(self.ctx.globals, name, "variable", want_exists);
        }
        if let Some(name) = id.strip_prefix("var.") {
            return self.variable_value(self.ctx.vars, name, "variable", want_exists);
        }
        if want_exists && matches!(id.as_str(), "param" | "var" | "global") {
            return Ok(Value::Bool(true));
        }

        self.check_stack(stack::OBJECT_LOOKUP)?;
        self.ctx
            .model
            .lookup(&id, &indices, want_length, want_exists)
            .map_err(|err| self.error(err.to_string()))
    }

    fn variable_value(
        &self,
        set: &VariableSet,
        name: &str,
        kind: &str,
        want_exists: bool,
    ) -> Result<Value, ScriptError> {
        let var = set.lookup(name);
        if want_exists {
            return Ok(Value::Bool(var.is_some()));
        }
        match var {
            Some(var) => Ok(var.value.clone()),
            None => Err(self.error(format!("unknown {kind} '{name}'"))),
        }
    }

    fn apply_function(
        &mut self,
        name: &str,
        mut first: Value,
        evaluate: bool,
    ) -> Result<Value, ScriptError> {
        match name {
            "abs" => match first {
                Value::Int(i) => Ok(Value::Int(i.wrapping_abs())),
                Value::Float { value, digits } => Ok(Value::Float {
                    value: value.abs(),
                    digits,
                }),
                _ if evaluate => Err(self.error("expected numeric operand")),
                _ => Ok(Value::Int(0)),
            },
            "sin" | "cos" | "tan" | "asin" | "acos" | "atan" | "degrees" | "radians" | "sqrt" => {
                self.convert_to_float(&mut first, evaluate)?;
                let Value::Float { value, .. } = first else {
                    unreachable!()
                };
                let result = match name {
                    "sin" => value.sin(),
                    "cos" => value.cos(),
                    "tan" => value.tan(),
                    "asin" => value.asin(),
                    "acos" => value.acos(),
                    "atan" => value.atan(),
                    "degrees" => value.to_degrees(),
                    "radians" => value.to_radians(),
                    "sqrt" => value.sqrt(),
                    _ => unreachable!(),
                };
                Ok(Value::float(result))
            }
            "atan2" => {
                self.convert_to_float(&mut first, evaluate)?;
                let mut second = self.parse_comma_operand(evaluate)?;
                self.convert_to_float(&mut second, evaluate)?;
                match (first, second) {
                    (Value::Float { value: y, .. }, Value::Float { value: x, .. }) => {
                        Ok(Value::float(y.atan2(x)))
                    }
                    _ => unreachable!(),
                }
            }
            "isnan" => {
                self.convert_to_float(&mut first, evaluate)?;
                let Value::Float { value, .. } = first else {
                    unreachable!()
                };
                Ok(Value::Bool(value.is_nan()))
            }
            "floor" => {
                self.convert_to_float(&mut first, evaluate)?;
                let Value::Float { value, digits } = first else {
                    unreachable!()
                };
                let floored = value.floor();
                if floored <= i32::MAX as f32 && floored >= i32::MIN as f32 {
                    Ok(Value::Int(floored as i32))
                } else {
                    Ok(Value::Float {
                        value: floored,
                        digits,
                    })
                }
            }
            "mod" => {
                let mut second = self.parse_comma_operand(evaluate)?;
                self.balance_numeric(&mut first, &mut second, evaluate)?;
                Ok(match (first, second) {
                    (Value::Float { value: a, digits }, Value::Float { value: b, .. }) => {
                        Value::Float {
                            value: a % b,
                            digits,
                        }
                    }
                    (Value::Int(a), Value::Int(b)) => Value::Int(if b == 0 { 0 } else { a % b }),
                    _ => unreachable!(),
                })
            }
            "max" | "min" => {
                let want_max = name == "max";
                loop {
                    self.skip_whitespace();
                    if self.current_char() != Some(',') {
                        break;
                    }
                    self.advance();
                    self.skip_whitespace();
                    let mut next = self.parse_internal(evaluate, 0)?;
                    self.balance_numeric(&mut first, &mut next, evaluate)?;
                    first = match (first, next) {
                        (
                            Value::Float { value: a, digits: da },
                            Value::Float { value: b, digits: db },
                        ) => Value::Float {
                            value: if want_max { a.max(b) } else { a.min(b) },
                            digits: da.max(db),
                        },
                        (Value::Int(a), Value::Int(b)) => {
                            Value::Int(if want_max { a.max(b) } else { a.min(b) })
                        }
                        _ => unreachable!(),
                    };
                }
                Ok(first)
            }
            "random" => {
                let limit = match first {
                    Value::Uint(u) => u,
                    Value::Int(i) if i > 0 => i as u32,
                    _ => return Err(self.error("expected positive integer")),
                };
                let mut state = self.ctx.rng.get();
                if state == 0 {
                    state = 0x6f91_2a37;
                }
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                self.ctx.rng.set(state);
                Ok(Value::Int((state % limit) as i32))
            }
            "datetime" => {
                let seconds = match first {
                    Value::Int(i) => i.max(0) as u64,
                    Value::Uint(u) => u as u64,
                    Value::Uint64(u) => u,
                    Value::DateTime(s) => s,
                    Value::Str(ref s) => self.parse_datetime(s)?,
                    _ => return Err(self.error("can't convert value to DateTime")),
                };
                Ok(Value::datetime(seconds))
            }
            _ => unreachable!("function table out of sync"),
        }
    }

    fn parse_comma_operand(&mut self, evaluate: bool) -> Result<Value, ScriptError> {
        self.skip_whitespace();
        if self.current_char() != Some(',') {
            return Err(self.error("expected ','"));
        }
        self.advance();
        self.skip_whitespace();
        self.parse_internal(evaluate, 0)
    }

    /// Parse `YYYY-MM-DDTHH:MM:SS` into a seconds count.
    fn parse_datetime(&self, text: &str) -> Result<u64, ScriptError> {
        let invalid = || self.error("string is not a valid date and time");
        let bytes: Vec<&str> = text
            .split(|c| matches!(c, '-' | 'T' | ':'))
            .collect();
        if bytes.len() != 6 {
            return Err(invalid());
        }
        let year: i64 = bytes[0].parse().map_err(|_| invalid())?;
        let month: u32 = bytes[1].parse().map_err(|_| invalid())?;
        let day: u32 = bytes[2].parse().map_err(|_| invalid())?;
        let hour: u64 = bytes[3].parse().map_err(|_| invalid())?;
        let minute: u64 = bytes[4].parse().map_err(|_| invalid())?;
        let second: u64 = bytes[5].parse().map_err(|_| invalid())?;
        if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hour > 23 || minute > 59 || second > 59
        {
            return Err(invalid());
        }
        let days = days_from_civil(year, month, day);
        if days < 0 {
            return Err(invalid());
        }
        Ok(days as u64 * 86_400 + hour * 3600 + minute * 60 + second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{LookupError, NullObjectModel};

    struct TestModel;

    impl ObjectModel for TestModel {
        fn lookup(
            &self,
            path: &str,
            indices: &[i32],
            want_length: bool,
            want_exists: bool,
        ) -> Result<Value, LookupError> {
            match path {
                "move.axes^.max" => Ok(Value::float(200.0 + indices[0] as f32)),
                "move.axes" if want_length => Ok(Value::Int(3)),
                "state.status" => Ok(Value::Str("idle".to_string())),
                _ if want_exists => Ok(Value::Bool(false)),
                _ => Err(LookupError::UnknownPath(path.to_string())),
            }
        }
    }

    struct Harness {
        vars: VariableSet,
        globals: VariableSet,
        params: VariableSet,
        rng: Cell<u32>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                vars: VariableSet::new(),
                globals: VariableSet::new(),
                params: VariableSet::new(),
                rng: Cell::new(1),
            }
        }

        fn eval_with(&self, model: &dyn ObjectModel, text: &str) -> Result<Value, ScriptError> {
            let ctx = EvalContext {
                vars: &self.vars,
                params: &self.params,
                globals: &self.globals,
                model,
                iterations: None,
                last_result: 0,
                line_number: 1,
                rng: &self.rng,
            };
            let mut evaluator = Evaluator::new(text, 1, &ctx);
            let value = evaluator.parse(true)?;
            evaluator.check_for_extra_characters()?;
            Ok(value)
        }

        fn eval(&self, text: &str) -> Result<Value, ScriptError> {
            self.eval_with(&NullObjectModel, text)
        }
    }

    fn int(value: Result<Value, ScriptError>) -> i32 {
        match value.unwrap() {
            Value::Int(i) => i,
            other => panic!("expected Int, got {other:?}"),
        }
    }

    fn float(value: Result<Value, ScriptError>) -> f32 {
        match value.unwrap() {
            Value::Float { value, .. } => value,
            other => panic!("expected Float, got {other:?}"),
        }
    }

    fn boolean(value: Result<Value, ScriptError>) -> bool {
        match value.unwrap() {
            Value::Bool(b) => b,
            other => panic!("expected Bool, got {other:?}"),
        }
    }

    #[test]
    fn arithmetic_precedence() {
        let h = Harness::new();
        assert_eq!(int(h.eval("1 + 2 * 3")), 7);
        assert_eq!(int(h.eval("{1 + 2} * 3")), 9);
        assert_eq!(int(h.eval("(1 + 2) * 3")), 9);
        assert_eq!(int(h.eval("-4 + 6")), 2);
        assert!((float(h.eval("10 / 4")) - 2.5).abs() < 1e-6);
    }

    #[test]
    fn numeric_balancing_promotes_to_float() {
        let h = Harness::new();
        let v = h.eval("1 + 2.5").unwrap();
        match v {
            Value::Float { value, .. } => assert!((value - 3.5).abs() < 1e-6),
            other => panic!("expected Float, got {other:?}"),
        }
        // Two ints stay int.
        assert_eq!(int(h.eval("2 + 3")), 5);
    }

    #[test]
    fn comparisons_and_equality() {
        let h = Harness::new();
        assert!(boolean(h.eval("3 > 2")));
        assert!(boolean(h.eval("2 <= 2")));
        assert!(boolean(h.eval("2 != 3")));
        assert!(boolean(h.eval("1.5 = 1.5")));
        assert!(boolean(h.eval("\"abc\" = \"abc\"")));
        assert!(!boolean(h.eval("\"abc\" = \"abd\"")));
        assert!(boolean(h.eval("null = null")));
        assert!(!boolean(h.eval("null = 3")));
        assert!(boolean(h.eval("null != 3")));
    }

    #[test]
    fn boolean_operators_and_ternary() {
        let h = Harness::new();
        assert!(boolean(h.eval("true & true")));
        assert!(!boolean(h.eval("true && false")));
        assert!(boolean(h.eval("false || true")));
        assert_eq!(int(h.eval("true ? 1 : 2")), 1);
        assert_eq!(int(h.eval("false ? 1 : 2")), 2);
        assert_eq!(int(h.eval("false ? 1 : false ? 2 : 3")), 3);
    }

    #[test]
    fn short_circuit_suppresses_errors_in_dead_operands() {
        let h = Harness::new();
        // var.foo is undefined; the right side is parsed but not evaluated.
        assert!(!boolean(h.eval("exists(var.foo) && var.foo > 3")));
        assert!(boolean(h.eval("true || var.foo > 3")));
        // When evaluated, the same operand raises.
        assert!(h.eval("var.foo > 3").is_err());
    }

    #[test]
    fn string_concat_and_length() {
        let h = Harness::new();
        match h.eval("\"speed: \" ^ 42").unwrap() {
            Value::Str(s) => assert_eq!(s, "speed: 42"),
            other => panic!("{other:?}"),
        }
        assert_eq!(int(h.eval("#\"hello\"")), 5);
    }

    #[test]
    fn quoted_string_escapes() {
        let h = Harness::new();
        match h.eval("\"say \"\"hi\"\"\"").unwrap() {
            Value::Str(s) => assert_eq!(s, "say \"hi\""),
            other => panic!("{other:?}"),
        }
        match h.eval("\"'A'B\"").unwrap() {
            Value::Str(s) => assert_eq!(s, "ab"),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn named_constants() {
        let h = Harness::new();
        assert!(boolean(h.eval("true")));
        assert!(!boolean(h.eval("false")));
        assert!(matches!(h.eval("null").unwrap(), Value::None));
        assert!((float(h.eval("pi")) - std::f32::consts::PI).abs() < 1e-6);
        assert_eq!(int(h.eval("line")), 1);
        assert_eq!(int(h.eval("result")), 0);
        assert!(h.eval("iterations").is_err());
    }

    #[test]
    fn functions() {
        let h = Harness::new();
        assert_eq!(int(h.eval("abs(-4)")), 4);
        assert!((float(h.eval("sqrt(16)")) - 4.0).abs() < 1e-6);
        assert!((float(h.eval("sin(0)")) - 0.0).abs() < 1e-6);
        assert!((float(h.eval("degrees(pi)")) - 180.0).abs() < 1e-3);
        assert!((float(h.eval("atan2(1, 1)")) - std::f32::consts::FRAC_PI_4).abs() < 1e-6);
        assert_eq!(int(h.eval("floor(2.7)")), 2);
        assert_eq!(int(h.eval("mod(7, 3)")), 1);
        assert_eq!(int(h.eval("mod(7, 0)")), 0);
        assert_eq!(int(h.eval("max(1, 5, 3)")), 5);
        assert_eq!(int(h.eval("min(4, 2, 8)")), 2);
        assert!(boolean(h.eval("isnan(0 / 0)")));
        let r = int(h.eval("random(10)"));
        assert!((0..10).contains(&r));
    }

    #[test]
    fn datetime_conversions() {
        let h = Harness::new();
        match h.eval("datetime(\"2024-03-01T12:30:45\")").unwrap() {
            Value::DateTime(_) => {}
            other => panic!("{other:?}"),
        }
        // DateTime plus seconds, and difference of two datetimes.
        match h
            .eval("datetime(\"2024-03-01T00:00:00\") + 90 - datetime(\"2024-03-01T00:00:00\")")
            .unwrap()
        {
            Value::Int(seconds) => assert_eq!(seconds, 90),
            other => panic!("{other:?}"),
        }
        assert!(h.eval("datetime(\"not a date\")").is_err());
    }

    #[test]
    fn unary_plus_converts_datetime_to_seconds() {
        let h = Harness::new();
        match h.eval("+datetime(90)").unwrap() {
            Value::Int(seconds) => assert_eq!(seconds, 90),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn variables_and_scopes() {
        let mut h = Harness::new();
        h.vars.insert("speed", Value::Int(120), 0);
        h.globals.insert("offset", Value::float(0.5), 0);
        h.params.insert("t", Value::Int(2), -1);
        assert_eq!(int(h.eval("var.speed + 1")), 121);
        assert!((float(h.eval("global.offset * 2")) - 1.0).abs() < 1e-6);
        assert_eq!(int(h.eval("param.t")), 2);
        assert!(boolean(h.eval("exists(var.speed)")));
        assert!(boolean(h.eval("exists(var)")));
        assert!(h.eval("var.missing").is_err());
    }

    #[test]
    fn object_model_paths_with_indices() {
        let h = Harness::new();
        let model = TestModel;
        match h.eval_with(&model, "move.axes[1].max").unwrap() {
            Value::Float { value, .. } => assert!((value - 201.0).abs() < 1e-6),
            other => panic!("{other:?}"),
        }
        assert_eq!(int(h.eval_with(&model, "#move.axes")), 3);
        match h.eval_with(&model, "state.status").unwrap() {
            Value::Str(s) => assert_eq!(s, "idle"),
            other => panic!("{other:?}"),
        }
        assert!(h.eval_with(&model, "nothing.here").is_err());
    }

    #[test]
    fn comparison_coerces_no_literal_types_against_strings() {
        let h = Harness::new();
        assert!(boolean(
            h.eval("datetime(\"2024-03-01T12:30:45\") = \"2024-03-01T12:30:45\"")
        ));
    }

    #[test]
    fn deep_nesting_is_policed_not_crashed() {
        let h = Harness::new();
        let depth = 20_000;
        let mut text = String::new();
        for _ in 0..depth {
            text.push('(');
        }
        text.push('1');
        for _ in 0..depth {
            text.push(')');
        }
        let err = h.eval(&text).unwrap_err();
        assert!(
            err.message.contains("nesting too deep"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn error_positions_are_reported() {
        let h = Harness::new();
        let err = h.eval("1 + ").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.column >= 4, "column {}", err.column);
    }
}
