//! Stack-machine instruction set and the AST -> bytecode compiler.
//!
//! The compiler and interpreter are coupled through this one opcode enum;
//! the lowering rules here and the execution rules in `vm` must move
//! together.
//!
//! Operators, indexing, slicing, and containment all lower to method-call
//! form against the protocol methods in `binary_dunder`/`unary_dunder`, so
//! the interpreter has a single dispatch path for builtin and user types.

use std::rc::Rc;

use anyhow::{Result, bail};

use crate::ast::{
    AssignTarget, BinaryOperator, BoolOperator, CallArg, DictItem, ExprKind, Expression,
    FunctionDef, PackSlot, Program, Statement, StmtKind, UnaryOperator,
};
use crate::token::Span;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Direct-assignment target: a plain name or a (possibly nested) pack with
/// at most one starred slot per level.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignSpec {
    Direct(String),
    Pack(Vec<PackSpec>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PackSpec {
    Name(String),
    Starred(String),
    Nested(Vec<PackSpec>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Op,
    pub span: Span,
}

impl Instruction {
    fn new(op: Op, span: Span) -> Self {
        Self { op, span }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Push the embedded constant.
    Literal(Literal),
    /// Resolve a name: locals, then captures, then module globals.
    Variable(String),
    /// Pop an object, push the named attribute (binding methods).
    Dot(String),
    /// Attribute lookup that prefers the in-place operator method and falls
    /// back to the plain one; used for compound assignment.
    DotInPlace {
        in_place: &'static str,
        fallback: &'static str,
    },
    Pop,
    /// Mark the stack: everything above belongs to the next Call or
    /// container constructor.
    PushArgFrame,
    /// Consume the current arg frame; slot zero is the callable.
    Call,
    /// Pop a value then a key, store into the current arg frame's kwargs.
    PushKwarg,
    /// Pop an iterable, push each element into the current arg frame.
    Unpack,
    /// Pop a mapping, merge into the current arg frame's kwargs.
    UnpackMapForCall,
    /// Pop a mapping, push its key/value pairs for Map construction.
    UnpackMapForMapCreation,
    Tuple,
    List,
    Map,
    Set,
    /// Pop step, stop, start; push a slice object.
    Slice,
    Not,
    /// Pointer identity.
    Is,
    Jump {
        target: usize,
    },
    /// The non-Pop variants keep the decisive operand when they jump and pop
    /// it when they fall through (short-circuit evaluation).
    JumpIfFalse {
        target: usize,
    },
    JumpIfTrue {
        target: usize,
    },
    JumpIfFalsePop {
        target: usize,
    },
    /// Deferred jump that runs `finally_count` enclosing finally blocks
    /// before landing on `target`.
    QueueJump {
        target: usize,
        finally_count: usize,
    },
    /// Pop the return value and unwind through `finally_count` finally
    /// blocks before leaving the frame.
    Return {
        finally_count: usize,
    },
    /// Materialize a function object, capturing cells from the current
    /// frame; defaults were evaluated onto the stack beforehand.
    Def(Rc<FunctionCode>),
    /// Build a class from `method_names.len()` methods below the arg frame
    /// and the bases inside it.
    Class {
        method_names: Vec<String>,
        pretty_name: String,
    },
    DirectAssign {
        target: AssignSpec,
    },
    /// Pop value, pop object, set attribute; the value stays on the stack.
    MemberAssign {
        name: String,
    },
    PushTry {
        except_offset: usize,
        finally_offset: usize,
    },
    PopTry,
    EndFinally,
    Raise,
    CurrentException,
    ClearException,
    /// Push the builtin isinstance function (used by except matching).
    IsInstance,
    Import {
        module: String,
        alias: Option<String>,
    },
    ImportFrom {
        module: String,
        names: Vec<(String, Option<String>)>,
        star: bool,
    },
}

/// Compiled body of one function (or the module top level), together with
/// the scope metadata the interpreter needs to build a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCode {
    pub parameters: Vec<String>,
    pub default_count: usize,
    pub list_args: Option<String>,
    pub kwargs: Option<String>,
    pub variables: Vec<String>,
    pub local_captures: Vec<String>,
    pub global_captures: Vec<String>,
    pub instructions: Vec<Instruction>,
    pub pretty_name: String,
    pub is_method: bool,
    /// Module-level code reads and writes the module globals directly
    /// instead of frame locals.
    pub module_scope: bool,
}

pub(crate) fn binary_dunder(op: BinaryOperator) -> &'static str {
    match op {
        BinaryOperator::Add => "__add__",
        BinaryOperator::Sub => "__sub__",
        BinaryOperator::Mul => "__mul__",
        BinaryOperator::TrueDiv => "__truediv__",
        BinaryOperator::FloorDiv => "__floordiv__",
        BinaryOperator::Mod => "__mod__",
        BinaryOperator::Pow => "__pow__",
        BinaryOperator::Eq => "__eq__",
        BinaryOperator::NotEq => "__ne__",
        BinaryOperator::Lt => "__lt__",
        BinaryOperator::LtEq => "__le__",
        BinaryOperator::Gt => "__gt__",
        BinaryOperator::GtEq => "__ge__",
        BinaryOperator::BitAnd => "__and__",
        BinaryOperator::BitOr => "__or__",
        BinaryOperator::BitXor => "__xor__",
        BinaryOperator::ShiftLeft => "__lshift__",
        BinaryOperator::ShiftRight => "__rshift__",
    }
}

pub(crate) fn in_place_dunder(op: BinaryOperator) -> &'static str {
    match op {
        BinaryOperator::Add => "__iadd__",
        BinaryOperator::Sub => "__isub__",
        BinaryOperator::Mul => "__imul__",
        BinaryOperator::TrueDiv => "__itruediv__",
        BinaryOperator::FloorDiv => "__ifloordiv__",
        BinaryOperator::Mod => "__imod__",
        BinaryOperator::Pow => "__ipow__",
        BinaryOperator::BitAnd => "__iand__",
        BinaryOperator::BitOr => "__ior__",
        BinaryOperator::BitXor => "__ixor__",
        BinaryOperator::ShiftLeft => "__ilshift__",
        BinaryOperator::ShiftRight => "__irshift__",
        // Comparisons have no in-place form; the parser never produces them.
        _ => binary_dunder(op),
    }
}

pub(crate) fn unary_dunder(op: UnaryOperator) -> &'static str {
    match op {
        UnaryOperator::Pos => "__pos__",
        UnaryOperator::Neg => "__neg__",
        UnaryOperator::Invert => "__invert__",
    }
}

/// Compiles a parsed program into the module-level function body.
pub fn compile(program: &Program) -> Result<FunctionCode> {
    let mut compiler = Compiler::new(true);
    let mut instructions = Vec::new();
    compiler.compile_body(&program.statements, &mut instructions)?;

    let end = Span::default();
    instructions.push(Instruction::new(Op::Literal(Literal::Null), end));
    instructions.push(Instruction::new(Op::Return { finally_count: 0 }, end));

    Ok(module_code(instructions))
}

/// Compiles a single expression into a function body returning its value.
pub fn compile_expression_program(expr: &Expression) -> Result<FunctionCode> {
    let mut compiler = Compiler::new(true);
    let mut instructions = Vec::new();
    compiler.compile_expression(expr, &mut instructions)?;
    instructions.push(Instruction::new(Op::Return { finally_count: 0 }, expr.span));
    Ok(module_code(instructions))
}

fn module_code(instructions: Vec<Instruction>) -> FunctionCode {
    FunctionCode {
        parameters: Vec::new(),
        default_count: 0,
        list_args: None,
        kwargs: None,
        variables: Vec::new(),
        local_captures: Vec::new(),
        global_captures: Vec::new(),
        instructions,
        pretty_name: crate::runtime::exception::MODULE_FUNC_NAME.to_string(),
        is_method: false,
        module_scope: true,
    }
}

struct LoopFrame {
    break_sites: Vec<usize>,
    continue_sites: Vec<usize>,
    // Site of the hidden break that ends a desugared for loop normally;
    // patched to land before the else clause.
    for_normal_break: Option<usize>,
    try_depth_at_entry: usize,
}

struct Compiler {
    loops: Vec<LoopFrame>,
    try_depth: usize,
    module_scope: bool,
}

impl Compiler {
    fn new(module_scope: bool) -> Self {
        Self {
            loops: Vec::new(),
            try_depth: 0,
            module_scope,
        }
    }

    fn compile_body(
        &mut self,
        statements: &[Statement],
        instructions: &mut Vec<Instruction>,
    ) -> Result<()> {
        for statement in statements {
            self.compile_statement(statement, instructions)?;
        }
        Ok(())
    }

    fn compile_statement(
        &mut self,
        statement: &Statement,
        instructions: &mut Vec<Instruction>,
    ) -> Result<()> {
        let span = statement.span;
        match &statement.kind {
            StmtKind::Expr(expr) => {
                self.compile_expression(expr, instructions)?;
                instructions.push(Instruction::new(Op::Pop, span));
            }
            StmtKind::Assign { target, value } => {
                self.compile_assignment(target, value, span, instructions)?;
                instructions.push(Instruction::new(Op::Pop, span));
            }
            StmtKind::If {
                condition,
                then_body,
                else_body,
            } => {
                self.compile_expression(condition, instructions)?;
                let false_jump = instructions.len();
                instructions.push(Instruction::new(
                    Op::JumpIfFalsePop { target: usize::MAX },
                    span,
                ));

                self.compile_body(then_body, instructions)?;

                if else_body.is_empty() {
                    let __patch_len_1 = instructions.len();
                    patch_jump(instructions, false_jump, __patch_len_1);
                } else {
                    let end_jump = instructions.len();
                    instructions.push(Instruction::new(Op::Jump { target: usize::MAX }, span));
                    let __patch_len_2 = instructions.len();
                    patch_jump(instructions, false_jump, __patch_len_2);
                    self.compile_body(else_body, instructions)?;
                    let __patch_len_3 = instructions.len();
                    patch_jump(instructions, end_jump, __patch_len_3);
                }
            }
            StmtKind::While {
                condition,
                body,
                else_body,
            } => {
                let condition_location = instructions.len();
                self.compile_expression(condition, instructions)?;

                let terminate_jump = instructions.len();
                instructions.push(Instruction::new(
                    Op::JumpIfFalsePop { target: usize::MAX },
                    span,
                ));

                self.loops.push(LoopFrame {
                    break_sites: Vec::new(),
                    continue_sites: Vec::new(),
                    for_normal_break: None,
                    try_depth_at_entry: self.try_depth,
                });

                self.compile_body(body, instructions)?;

                instructions.push(Instruction::new(
                    Op::Jump {
                        target: condition_location,
                    },
                    span,
                ));
                let __patch_len_4 = instructions.len();
                patch_jump(instructions, terminate_jump, __patch_len_4);

                let frame = self.loops.pop().expect("loop frame pushed above");

                // The for-loop normal break lands before the else clause so
                // the clause still runs; ordinary breaks land after it.
                if let Some(site) = frame.for_normal_break {
                    let __patch_len_5 = instructions.len();
                    patch_jump(instructions, site, __patch_len_5);
                }

                self.compile_body(else_body, instructions)?;

                for site in frame.break_sites {
                    let __patch_len_6 = instructions.len();
                    patch_jump(instructions, site, __patch_len_6);
                }
                for site in frame.continue_sites {
                    patch_jump(instructions, site, condition_location);
                }
            }
            StmtKind::Break {
                exit_for_loop_normally,
            } => {
                let finally_count = self.loop_finally_count(span)?;
                let site = instructions.len();
                instructions.push(Instruction::new(
                    Op::QueueJump {
                        target: usize::MAX,
                        finally_count,
                    },
                    span,
                ));
                let frame = self.loops.last_mut().expect("checked by loop_finally_count");
                if *exit_for_loop_normally {
                    frame.for_normal_break = Some(site);
                } else {
                    frame.break_sites.push(site);
                }
            }
            StmtKind::Continue => {
                let finally_count = self.loop_finally_count(span)?;
                let site = instructions.len();
                instructions.push(Instruction::new(
                    Op::QueueJump {
                        target: usize::MAX,
                        finally_count,
                    },
                    span,
                ));
                self.loops
                    .last_mut()
                    .expect("checked by loop_finally_count")
                    .continue_sites
                    .push(site);
            }
            StmtKind::Return(value) => {
                if self.module_scope {
                    bail!("Return outside of function on line {}", span.line + 1);
                }
                match value {
                    Some(value) => self.compile_expression(value, instructions)?,
                    None => instructions.push(Instruction::new(Op::Literal(Literal::Null), span)),
                }
                instructions.push(Instruction::new(
                    Op::Return {
                        finally_count: self.try_depth,
                    },
                    span,
                ));
            }
            StmtKind::FunctionDef(def) => {
                self.compile_function_expression(def, false, instructions)?;
                instructions.push(Instruction::new(
                    Op::DirectAssign {
                        target: AssignSpec::Direct(def.name.clone()),
                    },
                    span,
                ));
                instructions.push(Instruction::new(Op::Pop, span));
            }
            StmtKind::ClassDef {
                name,
                bases,
                methods,
            } => {
                let mut method_names = Vec::with_capacity(methods.len());
                for method in methods {
                    self.compile_function_expression(method, true, instructions)?;
                    method_names.push(method.name.clone());
                }

                instructions.push(Instruction::new(Op::PushArgFrame, span));
                for base in bases {
                    self.compile_expression(base, instructions)?;
                }
                instructions.push(Instruction::new(
                    Op::Class {
                        method_names,
                        pretty_name: name.clone(),
                    },
                    span,
                ));
                instructions.push(Instruction::new(
                    Op::DirectAssign {
                        target: AssignSpec::Direct(name.clone()),
                    },
                    span,
                ));
                instructions.push(Instruction::new(Op::Pop, span));
            }
            StmtKind::Try {
                body,
                handlers,
                finally_body,
            } => {
                self.compile_try(body, handlers, finally_body, span, instructions)?;
            }
            StmtKind::Raise(value) => {
                match value {
                    Some(value) => self.compile_expression(value, instructions)?,
                    None => instructions.push(Instruction::new(Op::CurrentException, span)),
                }
                instructions.push(Instruction::new(Op::Raise, span));
            }
            StmtKind::Import { module, alias } => {
                instructions.push(Instruction::new(
                    Op::Import {
                        module: module.clone(),
                        alias: alias.clone(),
                    },
                    span,
                ));
            }
            StmtKind::ImportFrom {
                module,
                names,
                star,
            } => {
                instructions.push(Instruction::new(
                    Op::ImportFrom {
                        module: module.clone(),
                        names: names.clone(),
                        star: *star,
                    },
                    span,
                ));
            }
            // Scope declarations were consumed by the parser's analysis.
            StmtKind::Global(_) | StmtKind::Nonlocal(_) | StmtKind::Pass => {}
        }
        Ok(())
    }

    fn loop_finally_count(&self, span: Span) -> Result<usize> {
        match self.loops.last() {
            Some(frame) => Ok(self.try_depth - frame.try_depth_at_entry),
            None => bail!("Break or continue outside of loop on line {}", span.line + 1),
        }
    }

    fn compile_assignment(
        &mut self,
        target: &AssignTarget,
        value: &Expression,
        span: Span,
        instructions: &mut Vec<Instruction>,
    ) -> Result<()> {
        match target {
            AssignTarget::Name(name) => {
                self.compile_expression(value, instructions)?;
                instructions.push(Instruction::new(
                    Op::DirectAssign {
                        target: AssignSpec::Direct(name.clone()),
                    },
                    span,
                ));
            }
            AssignTarget::Pack(slots) => {
                self.compile_expression(value, instructions)?;
                instructions.push(Instruction::new(
                    Op::DirectAssign {
                        target: AssignSpec::Pack(pack_spec(slots, span)?),
                    },
                    span,
                ));
            }
            AssignTarget::Index { object, index } => {
                instructions.push(Instruction::new(Op::PushArgFrame, span));
                self.compile_expression(object, instructions)?;
                instructions.push(Instruction::new(Op::Dot("__setitem__".to_string()), span));
                self.compile_expression(index, instructions)?;
                self.compile_expression(value, instructions)?;
                instructions.push(Instruction::new(Op::Call, span));
            }
            AssignTarget::Member { object, name } => {
                self.compile_expression(object, instructions)?;
                self.compile_expression(value, instructions)?;
                instructions.push(Instruction::new(
                    Op::MemberAssign { name: name.clone() },
                    span,
                ));
            }
        }
        Ok(())
    }

    fn compile_try(
        &mut self,
        body: &[Statement],
        handlers: &[crate::ast::ExceptHandler],
        finally_body: &[Statement],
        span: Span,
        instructions: &mut Vec<Instruction>,
    ) -> Result<()> {
        let push_try = instructions.len();
        instructions.push(Instruction::new(
            Op::PushTry {
                except_offset: usize::MAX,
                finally_offset: usize::MAX,
            },
            span,
        ));

        let mut end_sites = Vec::new();

        self.try_depth += 1;
        self.compile_body(body, instructions)?;
        end_sites.push(instructions.len());
        instructions.push(Instruction::new(
            Op::QueueJump {
                target: usize::MAX,
                finally_count: 1,
            },
            span,
        ));

        let except_offset = instructions.len();
        for handler in handlers {
            let handler_span = handler.span;
            let mut next_handler_site = None;

            if let Some(exception_type) = &handler.exception_type {
                instructions.push(Instruction::new(Op::PushArgFrame, handler_span));
                instructions.push(Instruction::new(Op::IsInstance, handler_span));
                instructions.push(Instruction::new(Op::CurrentException, handler_span));
                self.compile_expression(exception_type, instructions)?;
                instructions.push(Instruction::new(Op::Call, handler_span));

                next_handler_site = Some(instructions.len());
                instructions.push(Instruction::new(
                    Op::JumpIfFalsePop { target: usize::MAX },
                    handler_span,
                ));

                if let Some(variable) = &handler.variable {
                    instructions.push(Instruction::new(Op::CurrentException, handler_span));
                    instructions.push(Instruction::new(
                        Op::DirectAssign {
                            target: AssignSpec::Direct(variable.clone()),
                        },
                        handler_span,
                    ));
                    instructions.push(Instruction::new(Op::Pop, handler_span));
                }
            }

            instructions.push(Instruction::new(Op::ClearException, handler_span));
            self.compile_body(&handler.body, instructions)?;
            end_sites.push(instructions.len());
            instructions.push(Instruction::new(
                Op::QueueJump {
                    target: usize::MAX,
                    finally_count: 1,
                },
                handler_span,
            ));

            if let Some(site) = next_handler_site {
                let __patch_len_7 = instructions.len();
                patch_jump(instructions, site, __patch_len_7);
            }
        }
        self.try_depth -= 1;

        let finally_offset = instructions.len();
        instructions.push(Instruction::new(Op::PopTry, span));
        self.compile_body(finally_body, instructions)?;
        instructions.push(Instruction::new(Op::EndFinally, span));

        if let Op::PushTry {
            except_offset: except_slot,
            finally_offset: finally_slot,
        } = &mut instructions[push_try].op
        {
            *except_slot = except_offset;
            *finally_slot = finally_offset;
        }

        for site in end_sites {
            let __patch_len_8 = instructions.len();
            patch_jump(instructions, site, __patch_len_8);
        }
        Ok(())
    }

    fn compile_function_expression(
        &mut self,
        def: &FunctionDef,
        is_method: bool,
        instructions: &mut Vec<Instruction>,
    ) -> Result<()> {
        // Defaults are evaluated at definition time, last parameter first,
        // so the first defaulted parameter's value ends up on top.
        let mut default_count = 0;
        for parameter in def.parameters.iter().rev() {
            let Some(default) = &parameter.default else {
                break;
            };
            self.compile_expression(default, instructions)?;
            default_count += 1;
        }

        let mut body = Vec::new();
        let mut inner = Compiler::new(false);
        inner.compile_body(&def.body, &mut body)?;
        body.push(Instruction::new(Op::Literal(Literal::Null), def.span));
        body.push(Instruction::new(Op::Return { finally_count: 0 }, def.span));

        let code = FunctionCode {
            parameters: def
                .parameters
                .iter()
                .map(|parameter| parameter.name.clone())
                .collect(),
            default_count,
            list_args: def.list_args.clone(),
            kwargs: def.kwargs.clone(),
            variables: def.variables.clone(),
            local_captures: def.local_captures.clone(),
            global_captures: def.global_captures.clone(),
            instructions: body,
            pretty_name: def.name.clone(),
            is_method,
            module_scope: false,
        };
        instructions.push(Instruction::new(Op::Def(Rc::new(code)), def.span));
        Ok(())
    }

    fn compile_expression(
        &mut self,
        expr: &Expression,
        instructions: &mut Vec<Instruction>,
    ) -> Result<()> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Integer(value) => {
                instructions.push(Instruction::new(Op::Literal(Literal::Int(*value)), span));
            }
            ExprKind::Float(value) => {
                instructions.push(Instruction::new(Op::Literal(Literal::Float(*value)), span));
            }
            ExprKind::Str(value) => {
                instructions.push(Instruction::new(
                    Op::Literal(Literal::Str(value.clone())),
                    span,
                ));
            }
            ExprKind::Boolean(value) => {
                instructions.push(Instruction::new(Op::Literal(Literal::Bool(*value)), span));
            }
            ExprKind::NoneLiteral => {
                instructions.push(Instruction::new(Op::Literal(Literal::Null), span));
            }
            ExprKind::Identifier(name) => {
                instructions.push(Instruction::new(Op::Variable(name.clone()), span));
            }
            ExprKind::Tuple(items) | ExprKind::List(items) | ExprKind::Set(items) => {
                instructions.push(Instruction::new(Op::PushArgFrame, span));
                for item in items {
                    self.compile_expression(item, instructions)?;
                }
                let op = match &expr.kind {
                    ExprKind::Tuple(_) => Op::Tuple,
                    ExprKind::List(_) => Op::List,
                    _ => Op::Set,
                };
                instructions.push(Instruction::new(op, span));
            }
            ExprKind::Dict(items) => {
                instructions.push(Instruction::new(Op::PushArgFrame, span));
                for item in items {
                    match item {
                        DictItem::Pair(key, value) => {
                            self.compile_expression(key, instructions)?;
                            self.compile_expression(value, instructions)?;
                        }
                        DictItem::Unpack(mapping) => {
                            self.compile_expression(mapping, instructions)?;
                            instructions
                                .push(Instruction::new(Op::UnpackMapForMapCreation, span));
                        }
                    }
                }
                instructions.push(Instruction::new(Op::Map, span));
            }
            ExprKind::Attribute { object, name } => {
                self.compile_expression(object, instructions)?;
                instructions.push(Instruction::new(Op::Dot(name.clone()), span));
            }
            ExprKind::Index { object, index } => {
                instructions.push(Instruction::new(Op::PushArgFrame, span));
                self.compile_expression(object, instructions)?;
                instructions.push(Instruction::new(Op::Dot("__getitem__".to_string()), span));
                self.compile_expression(index, instructions)?;
                instructions.push(Instruction::new(Op::Call, span));
            }
            ExprKind::Slice {
                object,
                start,
                stop,
                step,
            } => {
                instructions.push(Instruction::new(Op::PushArgFrame, span));
                self.compile_expression(object, instructions)?;
                instructions.push(Instruction::new(Op::Dot("__getitem__".to_string()), span));
                for bound in [start, stop, step] {
                    match bound {
                        Some(bound) => self.compile_expression(bound, instructions)?,
                        None => instructions
                            .push(Instruction::new(Op::Literal(Literal::Null), span)),
                    }
                }
                instructions.push(Instruction::new(Op::Slice, span));
                instructions.push(Instruction::new(Op::Call, span));
            }
            ExprKind::Call { callee, args } => {
                instructions.push(Instruction::new(Op::PushArgFrame, span));
                self.compile_expression(callee, instructions)?;
                for arg in args {
                    match arg {
                        CallArg::Positional(value) => {
                            self.compile_expression(value, instructions)?;
                        }
                        CallArg::Keyword(name, value) => {
                            instructions.push(Instruction::new(
                                Op::Literal(Literal::Str(name.clone())),
                                span,
                            ));
                            self.compile_expression(value, instructions)?;
                            instructions.push(Instruction::new(Op::PushKwarg, span));
                        }
                        CallArg::Star(value) => {
                            self.compile_expression(value, instructions)?;
                            instructions.push(Instruction::new(Op::Unpack, span));
                        }
                        CallArg::DoubleStar(value) => {
                            self.compile_expression(value, instructions)?;
                            instructions.push(Instruction::new(Op::UnpackMapForCall, span));
                        }
                    }
                }
                instructions.push(Instruction::new(Op::Call, span));
            }
            ExprKind::Unary { op, operand } => {
                instructions.push(Instruction::new(Op::PushArgFrame, span));
                self.compile_expression(operand, instructions)?;
                instructions.push(Instruction::new(
                    Op::Dot(unary_dunder(*op).to_string()),
                    span,
                ));
                instructions.push(Instruction::new(Op::Call, span));
            }
            ExprKind::Binary { left, op, right } => {
                instructions.push(Instruction::new(Op::PushArgFrame, span));
                self.compile_expression(left, instructions)?;
                instructions.push(Instruction::new(
                    Op::Dot(binary_dunder(*op).to_string()),
                    span,
                ));
                self.compile_expression(right, instructions)?;
                instructions.push(Instruction::new(Op::Call, span));
            }
            ExprKind::InPlaceBinary { left, op, right } => {
                instructions.push(Instruction::new(Op::PushArgFrame, span));
                self.compile_expression(left, instructions)?;
                instructions.push(Instruction::new(
                    Op::DotInPlace {
                        in_place: in_place_dunder(*op),
                        fallback: binary_dunder(*op),
                    },
                    span,
                ));
                self.compile_expression(right, instructions)?;
                instructions.push(Instruction::new(Op::Call, span));
            }
            ExprKind::BoolOp { op, left, right } => {
                self.compile_expression(left, instructions)?;
                let jump = instructions.len();
                let placeholder = match op {
                    BoolOperator::And => Op::JumpIfFalse { target: usize::MAX },
                    BoolOperator::Or => Op::JumpIfTrue { target: usize::MAX },
                };
                instructions.push(Instruction::new(placeholder, span));
                self.compile_expression(right, instructions)?;
                let __patch_len_9 = instructions.len();
                patch_jump(instructions, jump, __patch_len_9);
            }
            ExprKind::Not(operand) => {
                self.compile_expression(operand, instructions)?;
                instructions.push(Instruction::new(Op::Not, span));
            }
            ExprKind::Is {
                left,
                right,
                negated,
            } => {
                self.compile_expression(left, instructions)?;
                self.compile_expression(right, instructions)?;
                instructions.push(Instruction::new(Op::Is, span));
                if *negated {
                    instructions.push(Instruction::new(Op::Not, span));
                }
            }
            ExprKind::Contains {
                item,
                container,
                negated,
            } => {
                // The container is the receiver of __contains__.
                instructions.push(Instruction::new(Op::PushArgFrame, span));
                self.compile_expression(container, instructions)?;
                instructions.push(Instruction::new(Op::Dot("__contains__".to_string()), span));
                self.compile_expression(item, instructions)?;
                instructions.push(Instruction::new(Op::Call, span));
                if *negated {
                    instructions.push(Instruction::new(Op::Not, span));
                }
            }
            ExprKind::Conditional {
                condition,
                then,
                otherwise,
            } => {
                self.compile_expression(condition, instructions)?;
                let false_jump = instructions.len();
                instructions.push(Instruction::new(
                    Op::JumpIfFalsePop { target: usize::MAX },
                    span,
                ));
                self.compile_expression(then, instructions)?;
                let end_jump = instructions.len();
                instructions.push(Instruction::new(Op::Jump { target: usize::MAX }, span));
                let __patch_len_10 = instructions.len();
                patch_jump(instructions, false_jump, __patch_len_10);
                self.compile_expression(otherwise, instructions)?;
                let __patch_len_11 = instructions.len();
                patch_jump(instructions, end_jump, __patch_len_11);
            }
            ExprKind::Lambda(def) => {
                self.compile_function_expression(def, false, instructions)?;
            }
            ExprKind::ListComp { accumulator, body } => {
                // The accumulator list stays on the stack while the loop
                // fills it; it is the value of the whole expression.
                instructions.push(Instruction::new(Op::PushArgFrame, span));
                instructions.push(Instruction::new(Op::List, span));
                instructions.push(Instruction::new(
                    Op::DirectAssign {
                        target: AssignSpec::Direct(accumulator.clone()),
                    },
                    span,
                ));
                self.compile_body(body, instructions)?;
            }
            ExprKind::Unpack(value) => {
                self.compile_expression(value, instructions)?;
                instructions.push(Instruction::new(Op::Unpack, span));
            }
            ExprKind::UnpackMap(value) => {
                self.compile_expression(value, instructions)?;
                instructions.push(Instruction::new(Op::UnpackMapForCall, span));
            }
        }
        Ok(())
    }
}

fn pack_spec(slots: &[PackSlot], span: Span) -> Result<Vec<PackSpec>> {
    let mut specs = Vec::with_capacity(slots.len());
    for slot in slots {
        let spec = match slot {
            PackSlot::Starred(name) => PackSpec::Starred(name.clone()),
            PackSlot::Target(AssignTarget::Name(name)) => PackSpec::Name(name.clone()),
            PackSlot::Target(AssignTarget::Pack(inner)) => {
                PackSpec::Nested(pack_spec(inner, span)?)
            }
            PackSlot::Target(_) => bail!(
                "Unsupported assignment target inside tuple on line {}",
                span.line + 1
            ),
        };
        specs.push(spec);
    }
    Ok(specs)
}

fn patch_jump(instructions: &mut [Instruction], site: usize, target_location: usize) {
    match &mut instructions[site].op {
        Op::Jump { target }
        | Op::JumpIfFalse { target }
        | Op::JumpIfTrue { target }
        | Op::JumpIfFalsePop { target }
        | Op::QueueJump { target, .. } => *target = target_location,
        other => panic!("patch_jump on non-jump instruction {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse_tokens;
    use indoc::indoc;

    fn compile_source(input: &str) -> FunctionCode {
        let tokens = tokenize(input).expect("tokenize should succeed");
        let program = parse_tokens(tokens).expect("parse should succeed");
        compile(&program).expect("compile should succeed")
    }

    fn ops(code: &FunctionCode) -> Vec<&Op> {
        code.instructions.iter().map(|instr| &instr.op).collect()
    }

    #[test]
    fn compiles_binary_operator_to_method_call_form() {
        let code = compile_source("1 + 2\n");
        assert_eq!(
            ops(&code),
            vec![
                &Op::PushArgFrame,
                &Op::Literal(Literal::Int(1)),
                &Op::Dot("__add__".to_string()),
                &Op::Literal(Literal::Int(2)),
                &Op::Call,
                &Op::Pop,
                &Op::Literal(Literal::Null),
                &Op::Return { finally_count: 0 },
            ]
        );
    }

    #[test]
    fn compiles_short_circuit_and_with_non_popping_jump() {
        let code = compile_source("a and b\n");
        assert_eq!(
            ops(&code),
            vec![
                &Op::Variable("a".to_string()),
                &Op::JumpIfFalse { target: 3 },
                &Op::Variable("b".to_string()),
                &Op::Pop,
                &Op::Literal(Literal::Null),
                &Op::Return { finally_count: 0 },
            ]
        );
    }

    #[test]
    fn compiles_containment_with_container_as_receiver() {
        let code = compile_source("x in xs\n");
        assert_eq!(
            ops(&code),
            vec![
                &Op::PushArgFrame,
                &Op::Variable("xs".to_string()),
                &Op::Dot("__contains__".to_string()),
                &Op::Variable("x".to_string()),
                &Op::Call,
                &Op::Pop,
                &Op::Literal(Literal::Null),
                &Op::Return { finally_count: 0 },
            ]
        );
    }

    #[test]
    fn compiles_index_assignment_through_setitem() {
        let code = compile_source("xs[0] = 5\n");
        assert_eq!(
            ops(&code),
            vec![
                &Op::PushArgFrame,
                &Op::Variable("xs".to_string()),
                &Op::Dot("__setitem__".to_string()),
                &Op::Literal(Literal::Int(0)),
                &Op::Literal(Literal::Int(5)),
                &Op::Call,
                &Op::Pop,
                &Op::Literal(Literal::Null),
                &Op::Return { finally_count: 0 },
            ]
        );
    }

    #[test]
    fn compiles_while_with_break_and_continue_patches() {
        let code = compile_source(indoc! {"
            while x:
                break
                continue
        "});
        let instructions = ops(&code);
        // Layout: cond, terminate-jump, break, continue, loop-jump, end.
        assert_eq!(instructions[0], &Op::Variable("x".to_string()));
        assert_eq!(instructions[1], &Op::JumpIfFalsePop { target: 5 });
        assert_eq!(
            instructions[2],
            &Op::QueueJump {
                target: 5,
                finally_count: 0
            }
        );
        assert_eq!(
            instructions[3],
            &Op::QueueJump {
                target: 0,
                finally_count: 0
            }
        );
        assert_eq!(instructions[4], &Op::Jump { target: 0 });
    }

    #[test]
    fn threads_finally_count_through_break_inside_try() {
        let code = compile_source(indoc! {"
            while x:
                try:
                    break
                finally:
                    pass
        "});
        let break_count = code
            .instructions
            .iter()
            .filter_map(|instr| match &instr.op {
                Op::QueueJump { finally_count, .. } => Some(*finally_count),
                _ => None,
            })
            .max()
            .expect("expected queued jumps");
        assert_eq!(break_count, 1);
    }

    #[test]
    fn compiles_try_layout_with_patched_offsets() {
        let code = compile_source(indoc! {"
            try:
                risky()
            except ValueError:
                pass
            finally:
                done()
        "});
        let Op::PushTry {
            except_offset,
            finally_offset,
        } = &code.instructions[0].op
        else {
            panic!("expected PushTry first");
        };
        assert!(matches!(
            code.instructions[*except_offset].op,
            Op::PushArgFrame
        ));
        assert!(matches!(code.instructions[*finally_offset].op, Op::PopTry));
        assert!(matches!(
            code.instructions.last().map(|instr| &instr.op),
            Some(Op::Return { .. })
        ));
    }

    #[test]
    fn compiles_def_with_defaults_in_reverse_order() {
        let code = compile_source(indoc! {"
            def f(a, b=1, c=2):
                return a
        "});
        assert_eq!(
            &ops(&code)[0..2],
            &[
                // Last default first, so the first defaulted parameter's
                // value ends up on top of the stack.
                &Op::Literal(Literal::Int(2)),
                &Op::Literal(Literal::Int(1)),
            ]
        );
        let Op::Def(function) = &code.instructions[2].op else {
            panic!("expected Def");
        };
        assert_eq!(function.parameters, vec!["a", "b", "c"]);
        assert_eq!(function.default_count, 2);
    }

    #[test]
    fn compiles_class_with_methods_before_arg_frame() {
        let code = compile_source(indoc! {"
            class A(Base):
                def f(self):
                    return 1
        "});
        assert!(matches!(code.instructions[0].op, Op::Def(_)));
        assert!(matches!(code.instructions[1].op, Op::PushArgFrame));
        assert_eq!(code.instructions[2].op, Op::Variable("Base".to_string()));
        let Op::Class { method_names, .. } = &code.instructions[3].op else {
            panic!("expected Class");
        };
        assert_eq!(method_names, &vec!["f".to_string()]);
    }

    #[test]
    fn compiles_keyword_argument_with_push_kwarg() {
        let code = compile_source("f(key=1)\n");
        assert_eq!(
            ops(&code)[0..6],
            [
                &Op::PushArgFrame,
                &Op::Variable("f".to_string()),
                &Op::Literal(Literal::Str("key".to_string())),
                &Op::Literal(Literal::Int(1)),
                &Op::PushKwarg,
                &Op::Call,
            ]
        );
    }

    #[test]
    fn compiles_return_with_enclosing_finally_count() {
        let code = compile_source(indoc! {"
            def f():
                try:
                    return 1
                finally:
                    pass
        "});
        let Op::Def(function) = &code.instructions[0].op else {
            panic!("expected Def");
        };
        let counts: Vec<usize> = function
            .instructions
            .iter()
            .filter_map(|instr| match &instr.op {
                Op::Return { finally_count } => Some(*finally_count),
                _ => None,
            })
            .collect();
        // The explicit return unwinds one finally; the implicit return none.
        assert!(counts.contains(&1));
        assert!(counts.contains(&0));
    }

    #[test]
    fn errors_on_return_at_module_level() {
        let tokens = tokenize("return 1\n").expect("tokenize should succeed");
        let program = parse_tokens(tokens).expect("parse should succeed");
        let error = compile(&program).expect_err("compile should fail");
        assert!(error.to_string().contains("Return outside of function"));
    }

    #[test]
    fn errors_on_break_outside_loop() {
        let tokens = tokenize("break\n").expect("tokenize should succeed");
        let program = parse_tokens(tokens).expect("parse should succeed");
        let error = compile(&program).expect_err("compile should fail");
        assert!(error.to_string().contains("outside of loop"));
    }

    #[test]
    fn compiles_expression_program_returning_value() {
        let tokens = tokenize("1 + 2").expect("tokenize should succeed");
        let expr =
            crate::parser::parse_expression_tokens(tokens).expect("parse should succeed");
        let code = compile_expression_program(&expr).expect("compile should succeed");
        assert!(matches!(
            code.instructions.last().map(|instr| &instr.op),
            Some(Op::Return { finally_count: 0 })
        ));
        assert!(code.module_scope);
    }
}
