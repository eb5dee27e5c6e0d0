//! Shared syntax tree produced by the parser and lowered by the bytecode
//! compiler.
//!
//! The parser already performs the heavier rewrites: `for` loops arrive here
//! desugared into the iterator protocol, list comprehensions into a hidden
//! accumulator plus loop body, and compound assignment into a
//! single-evaluation form with hidden temporaries. Function nodes carry the
//! results of scope analysis (`variables`, `local_captures`,
//! `global_captures`).

use crate::token::Span;

#[derive(Debug, PartialEq, Clone)]
pub struct Program {
    pub statements: Vec<Statement>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Expression {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expression {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum ExprKind {
    Integer(i64),
    Float(f64),
    Str(String),
    Boolean(bool),
    NoneLiteral,
    Identifier(String),
    Tuple(Vec<Expression>),
    List(Vec<Expression>),
    Set(Vec<Expression>),
    Dict(Vec<DictItem>),
    Attribute {
        object: Box<Expression>,
        name: String,
    },
    Index {
        object: Box<Expression>,
        index: Box<Expression>,
    },
    Slice {
        object: Box<Expression>,
        start: Option<Box<Expression>>,
        stop: Option<Box<Expression>>,
        step: Option<Box<Expression>>,
    },
    Call {
        callee: Box<Expression>,
        args: Vec<CallArg>,
    },
    Unary {
        op: UnaryOperator,
        operand: Box<Expression>,
    },
    Binary {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    // Compound-assignment right hand side: tries the in-place dunder first
    // and falls back to the plain operator method when it is absent.
    InPlaceBinary {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    BoolOp {
        op: BoolOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Not(Box<Expression>),
    Is {
        left: Box<Expression>,
        right: Box<Expression>,
        negated: bool,
    },
    Contains {
        item: Box<Expression>,
        container: Box<Expression>,
        negated: bool,
    },
    Conditional {
        condition: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
    Lambda(Box<FunctionDef>),
    // `[expr for t in xs]` desugared: the accumulator list is created and
    // assigned to `accumulator`, the loop body appends into it, and the list
    // itself is the value of the expression.
    ListComp {
        accumulator: String,
        body: Vec<Statement>,
    },
    // `*xs` in a call or sequence literal.
    Unpack(Box<Expression>),
    // `**xs` in a call; the dict-literal form is `DictItem::Unpack`.
    UnpackMap(Box<Expression>),
}

#[derive(Debug, PartialEq, Clone)]
pub enum DictItem {
    Pair(Expression, Expression),
    Unpack(Expression),
}

#[derive(Debug, PartialEq, Clone)]
pub enum CallArg {
    Positional(Expression),
    Keyword(String, Expression),
    Star(Expression),
    DoubleStar(Expression),
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum UnaryOperator {
    Pos,
    Neg,
    Invert,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
    Pow,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeft,
    ShiftRight,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum BoolOperator {
    And,
    Or,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Statement {
    pub kind: StmtKind,
    pub span: Span,
}

impl Statement {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum StmtKind {
    Expr(Expression),
    Assign {
        target: AssignTarget,
        value: Expression,
    },
    If {
        condition: Expression,
        then_body: Vec<Statement>,
        else_body: Vec<Statement>,
    },
    While {
        condition: Expression,
        body: Vec<Statement>,
        else_body: Vec<Statement>,
    },
    Break {
        // Set on the hidden break that ends a desugared for loop when its
        // iterator is exhausted; it jumps into the else clause instead of
        // past it.
        exit_for_loop_normally: bool,
    },
    Continue,
    Return(Option<Expression>),
    FunctionDef(FunctionDef),
    ClassDef {
        name: String,
        bases: Vec<Expression>,
        methods: Vec<FunctionDef>,
    },
    Try {
        body: Vec<Statement>,
        handlers: Vec<ExceptHandler>,
        finally_body: Vec<Statement>,
    },
    Raise(Option<Expression>),
    Import {
        module: String,
        alias: Option<String>,
    },
    ImportFrom {
        module: String,
        names: Vec<(String, Option<String>)>,
        star: bool,
    },
    Global(Vec<String>),
    Nonlocal(Vec<String>),
    Pass,
}

#[derive(Debug, PartialEq, Clone)]
pub struct ExceptHandler {
    pub exception_type: Option<Expression>,
    pub variable: Option<String>,
    pub body: Vec<Statement>,
    pub span: Span,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Parameter {
    pub name: String,
    pub default: Option<Expression>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub parameters: Vec<Parameter>,
    pub list_args: Option<String>,
    pub kwargs: Option<String>,
    pub body: Vec<Statement>,
    pub span: Span,
    // Filled in by scope analysis after parsing.
    pub variables: Vec<String>,
    pub local_captures: Vec<String>,
    pub global_captures: Vec<String>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum AssignTarget {
    Name(String),
    // Tuple/list destructuring; at most one starred slot.
    Pack(Vec<PackSlot>),
    Index {
        object: Expression,
        index: Expression,
    },
    Member {
        object: Expression,
        name: String,
    },
}

#[derive(Debug, PartialEq, Clone)]
pub enum PackSlot {
    Target(AssignTarget),
    Starred(String),
}
