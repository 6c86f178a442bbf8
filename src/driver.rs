//! The compilation driver (spec §4.1): restart-on-block scheduling over
//! top-level statements.
//!
//! This replaces the donor's suspend/resume coroutine protocol (spec §9,
//! *Coroutine-based name resolution*). Lowering an object is attempted from
//! scratch each time; because the global table only grows, a retried
//! attempt always reaches at least as far as the one before it.

use std::collections::HashMap;

use log::{debug, trace};

use crate::ast::{Statement, StatementKind};
use crate::compiler::Compiler;
use crate::error::{Error, UnresolvedReference};
use crate::lower::stmt;

/// Why a lowering attempt could not finish: either it hit a name that isn't
/// resolvable yet (park and retry later), or it hit a real error.
#[derive(Debug)]
pub enum LowerSignal {
    Blocked(String),
    Error(Error),
}

impl From<Error> for LowerSignal {
    fn from(err: Error) -> LowerSignal {
        LowerSignal::Error(err)
    }
}

pub type LowerResult<T> = Result<T, LowerSignal>;

/// One statement still to be scheduled, together with the namespace prefix
/// its enclosing `ModDecl`s (if any) have contributed.
#[derive(Clone)]
pub struct WorkItem {
    pub statement: Statement,
    pub namespace: String,
}

/// The outcome of one lowering attempt.
enum AttemptOutcome {
    /// The object finished: push it onto `compiled_objects` and wake
    /// anything waiting on the names it declares.
    Done {
        object: crate::compiler::CompiledObject,
        declares: Vec<String>,
    },
    /// A `ModDecl`: not itself compiled, just distributes its prefix.
    Expand(Vec<WorkItem>),
}

pub fn qualify(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}::{}", namespace, name)
    }
}

pub struct Driver {
    compiler: Compiler,
    queue: Vec<WorkItem>,
    waiting: HashMap<String, Vec<WorkItem>>,
}

impl Driver {
    pub fn new() -> Driver {
        Driver {
            compiler: Compiler::new(),
            queue: Vec::new(),
            waiting: HashMap::new(),
        }
    }

    /// Run the scheduler to completion (spec §4.1, protocol steps 1-3).
    pub fn compile(mut self, top_level: Vec<Statement>) -> Result<Compiler, Error> {
        self.queue = top_level
            .into_iter()
            .map(|statement| WorkItem {
                statement,
                namespace: String::new(),
            })
            .collect();

        while let Some(item) = self.queue.pop() {
            match attempt(&mut self.compiler, &item) {
                Ok(AttemptOutcome::Done { object, declares }) => {
                    trace!("finished lowering {:?}", object.identifier());
                    self.compiler.compiled_objects.push(object);
                    for name in declares {
                        if let Some(woken) = self.waiting.remove(&name) {
                            debug!("waking {} object(s) waiting on {}", woken.len(), name);
                            self.queue.extend(woken);
                        }
                    }
                }
                Ok(AttemptOutcome::Expand(items)) => {
                    self.queue.extend(items);
                }
                Err(LowerSignal::Blocked(name)) => {
                    trace!("parking object on waiting[{}]", name);
                    self.waiting.entry(name).or_default().push(item);
                }
                Err(LowerSignal::Error(err)) => return Err(err),
            }
        }

        if !self.waiting.is_empty() {
            let mut errs: Vec<UnresolvedReference> = self
                .waiting
                .iter()
                .flat_map(|(name, items)| {
                    items.iter().map(move |item| UnresolvedReference {
                        waiting_object: describe(&item.statement),
                        name: name.clone(),
                    })
                })
                .collect();
            errs.sort_by(|a, b| (&a.name, &a.waiting_object).cmp(&(&b.name, &b.waiting_object)));
            return Err(Error::Unresolved(errs));
        }

        Ok(self.compiler)
    }
}

impl Default for Driver {
    fn default() -> Driver {
        Driver::new()
    }
}

fn describe(statement: &Statement) -> String {
    match &statement.kind {
        StatementKind::FunctionDecl { name, .. } => format!("function `{}` ({})", name, statement.span),
        StatementKind::VariableDecl { name, .. } => format!("variable `{}` ({})", name, statement.span),
        StatementKind::ModDecl { name, .. } => format!("module `{}` ({})", name, statement.span),
        _ => format!("statement at {}", statement.span),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ast::{Expr, ExprKind, Statement};
    use crate::span::SourceSpan;
    use crate::types::Type;

    fn span() -> SourceSpan {
        SourceSpan::synthetic()
    }

    #[test]
    fn a_forward_call_resolves_once_its_target_is_declared() {
        // `caller` appears before `callee` in the top-level list; whichever
        // order the scheduler attempts them in, a call to a name declared
        // later in the list must still resolve (parking on `Blocked` and
        // waking once `callee`'s own attempt declares it, if needed).
        let call_callee = Statement::new(
            StatementKind::Expr(Expr::new(
                ExprKind::Call {
                    target: Box::new(Expr::new(ExprKind::Identifier("callee".to_string()), span())),
                    args: vec![],
                },
                span(),
            )),
            span(),
        );
        let caller = Statement::new(
            StatementKind::FunctionDecl {
                name: "caller".to_string(),
                params: vec![],
                returns: Type::Void,
                varargs: false,
                body: vec![call_callee],
            },
            span(),
        );
        let callee = Statement::new(
            StatementKind::FunctionDecl {
                name: "callee".to_string(),
                params: vec![],
                returns: Type::Void,
                varargs: false,
                body: vec![],
            },
            span(),
        );

        let compiler = Driver::new()
            .compile(vec![caller, callee])
            .expect("caller should resolve once callee is declared later in the same list");

        let names: Vec<Option<&str>> = compiler.compiled_objects.iter().map(|o| o.identifier()).collect();
        assert!(names.contains(&Some("caller")));
        assert!(names.contains(&Some("callee")));
    }
}

fn attempt(compiler: &mut Compiler, item: &WorkItem) -> LowerResult<AttemptOutcome> {
    match &item.statement.kind {
        StatementKind::ModDecl { name, body } => {
            let prefix = qualify(&item.namespace, name);
            let items = body
                .iter()
                .cloned()
                .map(|statement| WorkItem {
                    statement,
                    namespace: prefix.clone(),
                })
                .collect();
            Ok(AttemptOutcome::Expand(items))
        }
        StatementKind::FunctionDecl {
            name,
            params,
            returns,
            varargs,
            body,
        } => {
            let (object, declared) = stmt::lower_function(
                compiler,
                &item.namespace,
                name,
                params,
                returns,
                *varargs,
                body,
                item.statement.span,
            )?;
            Ok(AttemptOutcome::Done {
                object,
                declares: vec![declared],
            })
        }
        StatementKind::VariableDecl { name, ty, init } => {
            let (object, declared) = stmt::lower_global_variable(
                compiler,
                &item.namespace,
                name,
                ty.as_ref(),
                init.as_ref(),
                item.statement.span,
            )?;
            Ok(AttemptOutcome::Done {
                object,
                declares: vec![declared],
            })
        }
        _ => {
            let object =
                stmt::lower_toplevel_statement(compiler, &item.namespace, &item.statement)?;
            Ok(AttemptOutcome::Done {
                object,
                declares: Vec::new(),
            })
        }
    }
}
