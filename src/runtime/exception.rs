//! Exception taxonomy, raising helpers, and traceback rendering.
//!
//! Runtime failures are Language-level exception objects stored on the
//! context. Rust code signals "an exception is set" with the zero-sized
//! [`Raised`] marker; the object itself travels through
//! `Context::current_exception`.

use std::fmt::Write as _;

use crate::runtime::context::Context;
use crate::runtime::object::{ObjId, Payload, display_type_name};
use crate::token::Span;

/// Marker error meaning the current exception is set on the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Raised;

impl std::fmt::Display for Raised {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "an exception is set on the context")
    }
}

impl std::error::Error for Raised {}

pub type Exec<T> = Result<T, Raised>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    BaseException,
    SystemExit,
    Exception,
    StopIteration,
    ArithmeticError,
    OverflowError,
    ZeroDivisionError,
    AttributeError,
    ImportError,
    LookupError,
    IndexError,
    KeyError,
    MemoryError,
    NameError,
    OsError,
    IsADirectoryError,
    RuntimeError,
    NotImplementedError,
    RecursionError,
    SyntaxError,
    TypeError,
    ValueError,
}

impl ExceptionKind {
    pub const ALL: [ExceptionKind; 22] = [
        Self::BaseException,
        Self::SystemExit,
        Self::Exception,
        Self::StopIteration,
        Self::ArithmeticError,
        Self::OverflowError,
        Self::ZeroDivisionError,
        Self::AttributeError,
        Self::ImportError,
        Self::LookupError,
        Self::IndexError,
        Self::KeyError,
        Self::MemoryError,
        Self::NameError,
        Self::OsError,
        Self::IsADirectoryError,
        Self::RuntimeError,
        Self::NotImplementedError,
        Self::RecursionError,
        Self::SyntaxError,
        Self::TypeError,
        Self::ValueError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::BaseException => "BaseException",
            Self::SystemExit => "SystemExit",
            Self::Exception => "Exception",
            Self::StopIteration => "StopIteration",
            Self::ArithmeticError => "ArithmeticError",
            Self::OverflowError => "OverflowError",
            Self::ZeroDivisionError => "ZeroDivisionError",
            Self::AttributeError => "AttributeError",
            Self::ImportError => "ImportError",
            Self::LookupError => "LookupError",
            Self::IndexError => "IndexError",
            Self::KeyError => "KeyError",
            Self::MemoryError => "MemoryError",
            Self::NameError => "NameError",
            Self::OsError => "OSError",
            Self::IsADirectoryError => "IsADirectoryError",
            Self::RuntimeError => "RuntimeError",
            Self::NotImplementedError => "NotImplementedError",
            Self::RecursionError => "RecursionError",
            Self::SyntaxError => "SyntaxError",
            Self::TypeError => "TypeError",
            Self::ValueError => "ValueError",
        }
    }

    /// Immediate parent in the hierarchy; `None` for `BaseException`.
    pub fn parent(self) -> Option<ExceptionKind> {
        let parent = match self {
            Self::BaseException => return None,
            Self::SystemExit | Self::Exception => Self::BaseException,
            Self::StopIteration
            | Self::ArithmeticError
            | Self::AttributeError
            | Self::ImportError
            | Self::LookupError
            | Self::MemoryError
            | Self::NameError
            | Self::OsError
            | Self::RuntimeError
            | Self::SyntaxError
            | Self::TypeError
            | Self::ValueError => Self::Exception,
            Self::OverflowError | Self::ZeroDivisionError => Self::ArithmeticError,
            Self::IndexError | Self::KeyError => Self::LookupError,
            Self::IsADirectoryError => Self::OsError,
            Self::NotImplementedError | Self::RecursionError => Self::RuntimeError,
        };
        Some(parent)
    }
}

/// One entry of the call trace; snapshotted into the exception when a raise
/// happens.
#[derive(Debug, Clone)]
pub(crate) struct TraceFrame {
    pub(crate) module: String,
    pub(crate) func_name: String,
    pub(crate) src_pos: Option<Span>,
}

pub(crate) const MODULE_FUNC_NAME: &str = "<module>";

impl Context {
    /// Raises a builtin exception kind with a message.
    pub fn raise_exception(&mut self, kind: ExceptionKind, message: &str) {
        let class = self.builtins.exception_class(kind);
        self.raise_exception_class(class, message);
    }

    /// Instantiates `class` with `message` and raises the result.
    pub fn raise_exception_class(&mut self, class: ObjId, message: &str) {
        // If the message string cannot be allocated, MemoryError is already
        // set; likewise a failing constructor leaves its own exception.
        let Ok(message) = self.new_string(message) else {
            return;
        };
        self.protect(message);
        let instance = crate::vm::call_object(self, class, &[message], None);
        self.unprotect(message);
        if let Ok(instance) = instance {
            self.raise_exception_object(instance);
        }
    }

    /// Raises an existing exception instance, snapshotting the current trace.
    pub fn raise_exception_object(&mut self, exception: ObjId) {
        let base = self.builtins.exception_class(ExceptionKind::BaseException);
        if self.is_instance(exception, &[base]).is_none() {
            self.raise_exception(
                ExceptionKind::TypeError,
                "exceptions must derive from BaseException",
            );
            return;
        }
        self.current_exception = Some(exception);
        self.exception_trace = self.current_trace.clone();
    }

    pub fn current_exception(&self) -> Option<ObjId> {
        self.current_exception
    }

    pub fn clear_current_exception(&mut self) {
        self.current_exception = None;
        self.exception_trace.clear();
    }

    // Convenience raisers used throughout the builtins.

    pub fn raise_argument_count_error(&mut self, given: usize, expected: Option<usize>) {
        let message = match expected {
            Some(expected) => {
                let were = if given == 1 { "was" } else { "were" };
                format!("Function takes {expected} argument(s) but {given} {were} given")
            }
            None => format!("Function does not take {given} argument(s)"),
        };
        self.raise_exception(ExceptionKind::TypeError, &message);
    }

    pub fn raise_argument_type_error(&mut self, arg_index: usize, expected: &str) {
        let message = format!("Argument {} expected type {expected}", arg_index + 1);
        self.raise_exception(ExceptionKind::TypeError, &message);
    }

    pub fn raise_attribute_error(&mut self, obj: ObjId, attribute: &str) {
        let type_name = display_type_name(&self.obj(obj).type_name).to_string();
        let message = format!("'{type_name}' object has no attribute '{attribute}'");
        self.raise_exception(ExceptionKind::AttributeError, &message);
    }

    pub fn raise_zero_division_error(&mut self) {
        self.raise_exception(ExceptionKind::ZeroDivisionError, "division by zero");
    }

    pub fn raise_index_error(&mut self) {
        self.raise_exception(ExceptionKind::IndexError, "index out of range");
    }

    pub fn raise_key_error(&mut self, key: Option<ObjId>) {
        let message = match key {
            Some(key) => self
                .repr_of(key)
                .unwrap_or_else(|_| "<exception str() failed>".to_string()),
            None => String::new(),
        };
        self.raise_exception(ExceptionKind::KeyError, &message);
    }

    pub fn raise_name_error(&mut self, name: &str) {
        let message = format!("The name '{name}' is not defined");
        self.raise_exception(ExceptionKind::NameError, &message);
    }

    /// Renders the current exception as a `Traceback (most recent call
    /// last)` block, or "Ok" when no exception is set.
    pub fn error_message(&mut self) -> String {
        let Some(exception) = self.current_exception else {
            return "Ok".to_string();
        };

        let mut out = String::from("Traceback (most recent call last):\n");
        for frame in &self.exception_trace {
            out.push_str("  ");
            let _ = write!(out, "Module {}", frame.module);
            if let Some(pos) = frame.src_pos {
                let _ = write!(out, ", Line {}", pos.line + 1);
            }
            if frame.func_name != MODULE_FUNC_NAME {
                let _ = write!(out, ", Function {}()", frame.func_name);
            }
            out.push('\n');
        }

        out.push_str(&self.exception_type_name(exception));
        if let Some(message) = self.exception_message(exception) {
            if !message.is_empty() {
                let _ = write!(out, ": {message}");
            }
        }
        out.push('\n');
        out
    }

    fn exception_type_name(&self, exception: ObjId) -> String {
        display_type_name(&self.obj(exception).type_name).to_string()
    }

    fn exception_message(&self, exception: ObjId) -> Option<String> {
        let message = self.obj(exception).attributes.get("message")?;
        match &self.obj(message).payload {
            Payload::Str(text) => Some(text.clone()),
            _ => None,
        }
    }
}
