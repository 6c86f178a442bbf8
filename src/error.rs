//! Error taxonomy for the compilation pipeline (spec §7).
//!
//! Every concern gets its own plain enum with a manual `Display`/`Error`
//! impl, the same shape the rest of this pipeline's tooling uses instead of
//! a derive-macro error crate. They all fold into the top-level [`Error`].

use std::fmt;

use crate::span::SourceSpan;

#[derive(Clone, Debug, PartialEq)]
pub enum TypeError {
    Mismatch {
        expected: String,
        found: String,
        context: &'static str,
    },
    NoLvalue {
        expr: String,
    },
    AssignToConst {
        expr: String,
    },
    UnsupportedCast {
        from: String,
        to: String,
    },
    WrongArgCount {
        expected: usize,
        found: usize,
        varargs: bool,
    },
    NotCallable {
        found: String,
    },
    NegateUnsigned,
    ArrayLengthTooLarge {
        declared: usize,
        found: usize,
    },
    TakeAddressOfRvalue {
        name: String,
    },
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeError::Mismatch {
                expected,
                found,
                context,
            } => write!(
                f,
                "type mismatch in {}: expected {}, found {}",
                context, expected, found
            ),
            TypeError::NoLvalue { expr } => write!(f, "{} has no lvalue", expr),
            TypeError::AssignToConst { expr } => write!(f, "cannot assign to const {}", expr),
            TypeError::UnsupportedCast { from, to } => {
                write!(f, "cannot cast {} to {}", from, to)
            }
            TypeError::WrongArgCount {
                expected,
                found,
                varargs,
            } => write!(
                f,
                "wrong argument count: expected {}{}, found {}",
                expected,
                if *varargs { " or more" } else { "" },
                found
            ),
            TypeError::NotCallable { found } => write!(f, "{} is not callable", found),
            TypeError::NegateUnsigned => write!(f, "cannot negate an unsigned value"),
            TypeError::ArrayLengthTooLarge { declared, found } => write!(
                f,
                "array literal has {} elements but the declared length is {}",
                found, declared
            ),
            TypeError::TakeAddressOfRvalue { name } => write!(
                f,
                "cannot take the address of {}, its identifier already denotes its address",
                name
            ),
        }
    }
}

impl std::error::Error for TypeError {}

#[derive(Clone, Debug, PartialEq)]
pub struct Redeclaration {
    pub name: String,
    pub previous_type: String,
    pub new_type: String,
}

impl fmt::Display for Redeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} was declared twice with incompatible types ({} and then {})",
            self.name, self.previous_type, self.new_type
        )
    }
}

impl std::error::Error for Redeclaration {}

#[derive(Clone, Debug, PartialEq)]
pub struct UnresolvedReference {
    pub waiting_object: String,
    pub name: String,
}

impl fmt::Display for UnresolvedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is waiting on name \"{}\" which never appeared",
            self.waiting_object, self.name
        )
    }
}

impl std::error::Error for UnresolvedReference {}

#[derive(Clone, Debug, PartialEq)]
pub struct InternalCompilerError {
    pub message: String,
}

impl InternalCompilerError {
    pub fn new<S: Into<String>>(message: S) -> InternalCompilerError {
        InternalCompilerError {
            message: message.into(),
        }
    }
}

impl fmt::Display for InternalCompilerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "internal compiler error: {}", self.message)
    }
}

impl std::error::Error for InternalCompilerError {}

/// A parse error from the (external, out-of-scope) parser. The core never
/// constructs one, but carries the variant so the CLI can render every
/// error kind through one `Display` impl.
#[derive(Clone, Debug, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub span: SourceSpan,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at {}: {}", self.span, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Wraps the message of an I/O or serialization failure encountered while
/// reading/writing the final image (spec §6). These never carry a
/// [`SourceSpan`] - they happen outside compilation proper.
#[derive(Clone, Debug, PartialEq)]
pub struct IoError {
    pub message: String,
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IoError {}

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    Parse(ParseError),
    Type { span: SourceSpan, error: TypeError },
    Redeclaration(Redeclaration),
    Unresolved(Vec<UnresolvedReference>),
    Internal(InternalCompilerError),
    Io(IoError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Parse(err) => write!(f, "{}", err),
            Error::Type { span, error } => write!(f, "{}: {}", span, error),
            Error::Redeclaration(err) => write!(f, "{}", err),
            Error::Unresolved(errs) => {
                writeln!(f, "compilation failed with {} unresolved reference(s):", errs.len())?;
                for err in errs {
                    writeln!(f, "  - {}", err)?;
                }
                Ok(())
            }
            Error::Internal(err) => write!(f, "{}", err),
            Error::Io(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Error {
        Error::Parse(err)
    }
}

impl From<Redeclaration> for Error {
    fn from(err: Redeclaration) -> Error {
        Error::Redeclaration(err)
    }
}

impl From<InternalCompilerError> for Error {
    fn from(err: InternalCompilerError) -> Error {
        Error::Internal(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(IoError { message: err.to_string() })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::Io(IoError { message: err.to_string() })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
