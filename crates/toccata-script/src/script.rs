// Meta-command script engine: indentation-delimited blocks driving the
// expression evaluator
//
// Scripts mix plain commands (passed through to the machine) with the
// control constructs `if`/`elif`/`else`, `while`/`break`, `echo`, `abort`,
// and the variable commands `var`/`set`. Blocks are delimited by
// indentation; a loop replays from its recorded line when its block ends.

use std::cell::Cell;

use crate::eval::{EvalContext, Evaluator};
use crate::lookup::ObjectModel;
use crate::value::{ScriptError, Value};
use crate::vars::VariableSet;

const MAX_BLOCK_DEPTH: usize = 10;

/// What a script line produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptEvent {
    /// A non-meta line to hand to the machine command parser.
    Command(String),
    Echo(String),
    Abort(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockType {
    Plain,
    /// An if-block whose condition was true.
    IfTrue,
    /// An if- or elif-block whose condition was false, with no true branch
    /// seen yet; `else`/`elif` may still run.
    IfFalseNoneTrue,
    /// A false branch after some branch already ran; the rest are skipped.
    IfFalseHadTrue,
    Loop,
}

#[derive(Debug, Clone, Copy)]
struct BlockState {
    kind: BlockType,
    indent: usize,
    /// Line index to replay from when a loop block ends.
    line: usize,
    iterations: i32,
}

/// Runs a script, maintaining the block stack and the scoped variable sets
/// across lines.
pub struct ScriptRunner {
    vars: VariableSet,
    globals: VariableSet,
    params: VariableSet,
    last_result: i32,
    rng: Cell<u32>,
}

impl Default for ScriptRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptRunner {
    pub fn new() -> Self {
        Self {
            vars: VariableSet::new(),
            globals: VariableSet::new(),
            params: VariableSet::new(),
            last_result: 0,
            rng: Cell::new(0x2545_f491),
        }
    }

    /// Parameters visible as `param.*` during the run.
    pub fn params_mut(&mut self) -> &mut VariableSet {
        &mut self.params
    }

    /// The persistent `global.*` set.
    pub fn globals_mut(&mut self) -> &mut VariableSet {
        &mut self.globals
    }

    pub fn set_last_result(&mut self, result: i32) {
        self.last_result = result;
    }

    /// Execute a whole script, emitting an event per effectful line. Stops
    /// early on `abort` (after emitting it) and on the first error.
    pub fn run(
        &mut self,
        source: &str,
        model: &dyn ObjectModel,
        emit: &mut dyn FnMut(ScriptEvent),
    ) -> Result<(), ScriptError> {
        let lines: Vec<&str> = source.lines().collect();
        let mut blocks = vec![BlockState {
            kind: BlockType::Plain,
            indent: 0,
            line: 0,
            iterations: 0,
        }];
        let mut indent_to_skip_to: Option<usize> = None;
        let mut cursor = 0usize;

        'lines: while cursor < lines.len() {
            let raw = lines[cursor];
            let line_number = cursor as u32 + 1;
            let indent = raw.len() - raw.trim_start_matches([' ', '\t']).len();
            let content = raw[indent..].trim_end();

            if content.is_empty() || content.starts_with(';') {
                cursor += 1;
                continue;
            }

            // Skipping a block whose condition failed.
            let mut previous_block_type = BlockType::Plain;
            if let Some(skip) = indent_to_skip_to {
                if skip < indent {
                    cursor += 1;
                    continue;
                }
                if skip == indent {
                    // The skipped if- or loop-block just ended.
                    let top = blocks.last_mut().expect("root block");
                    previous_block_type = top.kind;
                    top.kind = BlockType::Plain;
                }
                indent_to_skip_to = None;
            }

            // Indentation changes open and close blocks.
            let current_indent = blocks.last().expect("root block").indent;
            if indent > current_indent {
                if blocks.len() >= MAX_BLOCK_DEPTH {
                    return Err(ScriptError::new(line_number, 1, "blocks nested too deeply"));
                }
                blocks.push(BlockState {
                    kind: BlockType::Plain,
                    indent,
                    line: cursor,
                    iterations: 0,
                });
            } else if indent < current_indent {
                while blocks.last().expect("root block").indent > indent {
                    blocks.pop();
                    self.vars.end_scope(blocks.len() as i32);
                    let top = blocks.last().expect("root block");
                    if top.kind == BlockType::Loop {
                        // Replay the while line and re-evaluate its
                        // condition; the current line comes around again
                        // once the loop finishes.
                        cursor = top.line;
                        continue 'lines;
                    }
                }
            }

            match self.process_line(
                content,
                indent,
                line_number,
                cursor,
                &mut blocks,
                &mut indent_to_skip_to,
                previous_block_type,
                model,
                emit,
            )? {
                LineOutcome::Continue => cursor += 1,
                LineOutcome::Stop => return Ok(()),
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_line(
        &mut self,
        content: &str,
        indent: usize,
        line_number: u32,
        cursor: usize,
        blocks: &mut Vec<BlockState>,
        indent_to_skip_to: &mut Option<usize>,
        previous_block_type: BlockType,
        model: &dyn ObjectModel,
        emit: &mut dyn FnMut(ScriptEvent),
    ) -> Result<LineOutcome, ScriptError> {
        // A meta command is a short lowercase word terminated by
        // whitespace, '{', or end of line.
        let word_len = content
            .bytes()
            .take_while(|b| b.is_ascii_lowercase())
            .count();
        let terminated = matches!(
            content[word_len..].chars().next(),
            None | Some(' ') | Some('\t') | Some('{')
        );
        let word = &content[..word_len];
        let args = content[word_len..].trim_start();
        let args_column = (indent + content.len() - args.len() + 1) as u32;

        if (2..=5).contains(&word_len) && terminated {
            match word {
                "if" => {
                    let condition =
                        self.evaluate_condition(args, line_number, args_column, blocks, model)?;
                    let top = blocks.last_mut().expect("root block");
                    if condition {
                        top.kind = BlockType::IfTrue;
                    } else {
                        top.kind = BlockType::IfFalseNoneTrue;
                        *indent_to_skip_to = Some(indent);
                    }
                    return Ok(LineOutcome::Continue);
                }
                "elif" => {
                    let top_kind = blocks.last().expect("root block").kind;
                    if previous_block_type == BlockType::IfFalseNoneTrue {
                        let condition = self
                            .evaluate_condition(args, line_number, args_column, blocks, model)?;
                        let top = blocks.last_mut().expect("root block");
                        if condition {
                            top.kind = BlockType::IfTrue;
                        } else {
                            top.kind = BlockType::IfFalseNoneTrue;
                            *indent_to_skip_to = Some(indent);
                        }
                    } else if previous_block_type == BlockType::IfFalseHadTrue
                        || matches!(top_kind, BlockType::IfTrue | BlockType::IfFalseHadTrue)
                    {
                        // A branch already ran; skip this one and remember
                        // that for any further elif/else parts.
                        blocks.last_mut().expect("root block").kind = BlockType::IfFalseHadTrue;
                        *indent_to_skip_to = Some(indent);
                    } else {
                        return Err(ScriptError::new(
                            line_number,
                            1,
                            "'elif' did not follow 'if'",
                        ));
                    }
                    return Ok(LineOutcome::Continue);
                }
                "else" => {
                    let top = blocks.last_mut().expect("root block");
                    if previous_block_type == BlockType::IfFalseNoneTrue {
                        // Run the else-block like a plain block; a second
                        // 'else' is then an error.
                        top.kind = BlockType::Plain;
                    } else if previous_block_type == BlockType::IfFalseHadTrue
                        || matches!(top.kind, BlockType::IfTrue | BlockType::IfFalseHadTrue)
                    {
                        top.kind = BlockType::Plain;
                        *indent_to_skip_to = Some(indent);
                    } else {
                        return Err(ScriptError::new(
                            line_number,
                            1,
                            "'else' did not follow 'if'",
                        ));
                    }
                    return Ok(LineOutcome::Continue);
                }
                "while" => {
                    {
                        let top = blocks.last_mut().expect("root block");
                        if top.kind == BlockType::Loop {
                            top.iterations += 1;
                        } else {
                            top.kind = BlockType::Loop;
                            top.line = cursor;
                            top.iterations = 0;
                        }
                    }
                    let condition =
                        self.evaluate_condition(args, line_number, args_column, blocks, model)?;
                    if !condition {
                        blocks.last_mut().expect("root block").kind = BlockType::Plain;
                        *indent_to_skip_to = Some(indent);
                    }
                    return Ok(LineOutcome::Continue);
                }
                "break" => {
                    loop {
                        if blocks.len() <= 1 {
                            return Err(ScriptError::new(
                                line_number,
                                1,
                                "'break' was not inside a loop",
                            ));
                        }
                        blocks.pop();
                        self.vars.end_scope(blocks.len() as i32);
                        if blocks.last().expect("root block").kind == BlockType::Loop {
                            break;
                        }
                    }
                    blocks.last_mut().expect("root block").kind = BlockType::Plain;
                    return Ok(LineOutcome::Continue);
                }
                "echo" => {
                    let text = self.process_echo(args, line_number, args_column, blocks, model)?;
                    emit(ScriptEvent::Echo(text));
                    return Ok(LineOutcome::Continue);
                }
                "abort" => {
                    let message = if args.is_empty() {
                        "'abort' command executed".to_string()
                    } else {
                        // A bad expression is reported, but we abort anyway.
                        match self.evaluate_expression(
                            args,
                            line_number,
                            args_column,
                            blocks,
                            model,
                        ) {
                            Ok(value) => value.to_string(),
                            Err(err) => format!("invalid expression after 'abort': {err}"),
                        }
                    };
                    emit(ScriptEvent::Abort(message));
                    return Ok(LineOutcome::Stop);
                }
                "var" => {
                    self.process_var(args, line_number, args_column, blocks, model)?;
                    return Ok(LineOutcome::Continue);
                }
                "set" => {
                    self.process_set(args, line_number, args_column, blocks, model)?;
                    return Ok(LineOutcome::Continue);
                }
                _ => {}
            }
        }

        emit(ScriptEvent::Command(content.to_string()));
        Ok(LineOutcome::Continue)
    }

    /// Iteration count of the innermost enclosing loop, if any.
    fn iterations(blocks: &[BlockState]) -> Option<i32> {
        blocks
            .iter()
            .rev()
            .find(|block| block.kind == BlockType::Loop)
            .map(|block| block.iterations)
    }

    fn evaluate_expression(
        &self,
        text: &str,
        line_number: u32,
        column: u32,
        blocks: &[BlockState],
        model: &dyn ObjectModel,
    ) -> Result<Value, ScriptError> {
        let ctx = EvalContext {
            vars: &self.vars,
            params: &self.params,
            globals: &self.globals,
            model,
            iterations: Self::iterations(blocks),
            last_result: self.last_result,
            line_number,
            rng: &self.rng,
        };
        let mut evaluator = Evaluator::new(text, column, &ctx);
        let value = evaluator.parse(true)?;
        evaluator.check_for_extra_characters()?;
        Ok(value)
    }

    /// Evaluate the condition following `if`, `elif` or `while`.
    fn evaluate_condition(
        &self,
        text: &str,
        line_number: u32,
        column: u32,
        blocks: &[BlockState],
        model: &dyn ObjectModel,
    ) -> Result<bool, ScriptError> {
        let ctx = EvalContext {
            vars: &self.vars,
            params: &self.params,
            globals: &self.globals,
            model,
            iterations: Self::iterations(blocks),
            last_result: self.last_result,
            line_number,
            rng: &self.rng,
        };
        let mut evaluator = Evaluator::new(text, column, &ctx);
        let value = evaluator.parse(true)?;
        evaluator.skip_whitespace();
        if !evaluator.at_end() {
            return Err(evaluator.error("unexpected characters following condition"));
        }
        match value {
            Value::Bool(b) => Ok(b),
            _ => Err(evaluator.error("expected Boolean operand")),
        }
    }

    /// `echo expr[, expr...]`: evaluate each and join with spaces.
    fn process_echo(
        &self,
        text: &str,
        line_number: u32,
        column: u32,
        blocks: &[BlockState],
        model: &dyn ObjectModel,
    ) -> Result<String, ScriptError> {
        let ctx = EvalContext {
            vars: &self.vars,
            params: &self.params,
            globals: &self.globals,
            model,
            iterations: Self::iterations(blocks),
            last_result: self.last_result,
            line_number,
            rng: &self.rng,
        };
        let mut evaluator = Evaluator::new(text, column, &ctx);
        let mut output = String::new();
        loop {
            evaluator.skip_whitespace();
            if evaluator.at_end() {
                return Ok(output);
            }
            let value = evaluator.parse(true)?;
            if !output.is_empty() {
                output.push(' ');
            }
            output.push_str(&value.to_string());
            evaluator.skip_whitespace();
            match evaluator.current_char() {
                Some(',') => evaluator.advance(),
                None => {}
                Some(_) => return Err(evaluator.error("expected ','")),
            }
        }
    }

    /// `var name = expr`: declare a new variable in the current block.
    fn process_var(
        &mut self,
        text: &str,
        line_number: u32,
        column: u32,
        blocks: &[BlockState],
        model: &dyn ObjectModel,
    ) -> Result<(), ScriptError> {
        let (name, expr, expr_column) = split_assignment(text, line_number, column)?;
        if self.vars.lookup(name).is_some() {
            return Err(ScriptError::new(
                line_number,
                column,
                format!("variable '{name}' already exists"),
            ));
        }
        let value = self.evaluate_expression(expr, line_number, expr_column, blocks, model)?;
        self.vars.insert(name, value, blocks.len() as i32);
        Ok(())
    }

    /// `set var.name = expr` assigns an existing local; `set global.name =
    /// expr` creates or assigns a global.
    fn process_set(
        &mut self,
        text: &str,
        line_number: u32,
        column: u32,
        blocks: &[BlockState],
        model: &dyn ObjectModel,
    ) -> Result<(), ScriptError> {
        let (target, expr, expr_column) = split_assignment(text, line_number, column)?;
        let value = self.evaluate_expression(expr, line_number, expr_column, blocks, model)?;
        if let Some(name) = target.strip_prefix("var.") {
            if !self.vars.assign(name, value) {
                return Err(ScriptError::new(
                    line_number,
                    column,
                    format!("unknown variable '{name}'"),
                ));
            }
            Ok(())
        } else if let Some(name) = target.strip_prefix("global.") {
            self.globals.insert_or_assign(name, value);
            Ok(())
        } else {
            Err(ScriptError::new(
                line_number,
                column,
                "expected 'var.' or 'global.' after 'set'",
            ))
        }
    }
}

enum LineOutcome {
    Continue,
    Stop,
}

/// Split `name = expr` and return the name, the expression text, and the
/// expression's column.
fn split_assignment(
    text: &str,
    line_number: u32,
    column: u32,
) -> Result<(&str, &str, u32), ScriptError> {
    let equals = text
        .find('=')
        .ok_or_else(|| ScriptError::new(line_number, column, "expected '='"))?;
    let name = text[..equals].trim();
    let expr = text[equals + 1..].trim_start();
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(ScriptError::new(line_number, column, "expected a variable name"));
    }
    let expr_column = column + (text.len() - expr.len()) as u32;
    Ok((name, expr, expr_column))
}
