//! Back-end compilation pipeline (spec §1): lowers a typed AST to a packed
//! register-VM image.
//!
//! The pipeline is five stages, each its own module: [`driver`] schedules
//! lowering over top-level statements (via [`lower`]) into [`compiler`]
//! state; [`regalloc`] and [`desugar`] turn that IR into encoder-ready form;
//! [`encoder`] lowers it to [`hardware`] instructions; [`packager`] lays out
//! the final image and resolves every symbolic reference; [`image`] writes
//! the result to bytes.

pub mod ast;
pub mod compiler;
pub mod demos;
pub mod desugar;
pub mod driver;
pub mod encoder;
pub mod error;
pub mod hardware;
pub mod image;
pub mod ir;
pub mod lower;
pub mod packager;
pub mod regalloc;
pub mod register;
pub mod scope;
pub mod span;
pub mod types;
pub mod variable;

#[cfg(test)]
mod test;

use ast::Statement;
use error::Error;
use packager::PackagedProgram;

/// Run the whole pipeline: schedule and lower `top_level`, then pack the
/// result into a final image (spec §1, "a single exported entry point").
/// `reg_count` is the number of physical registers the allocator may use
/// (spec §6: "an option selecting the number of physical registers").
pub fn compile(top_level: Vec<Statement>, reg_count: u8) -> Result<PackagedProgram, Error> {
    let mut compiler = driver::Driver::new().compile(top_level)?;
    packager::package(&mut compiler, reg_count)
}
