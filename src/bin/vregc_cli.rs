//! The `vregc-cli` binary (spec §6, "CLI surface"): compiles one of the
//! embedded program fixtures (see [`vregc::demos`]) and writes the packed
//! image plus its symbol map.
//!
//! Grounded on the donor's `vasm`/`vex` CLI pair: `clap`'s `app_from_crate!`
//! builder, positional input/output arguments, and a flat `Error` enum
//! wrapping I/O context alongside the library's own error type.

#[macro_use]
extern crate clap;

use std::fmt;
use std::path::{Path, PathBuf};

use clap::Arg;
use log::info;

use vregc::error::Error as CoreError;
use vregc::hardware::HardwareInstruction;
use vregc::ir::Instr;

#[derive(Debug)]
enum IoContext {
    WriteImage,
    WriteSymbols,
}

#[derive(Debug)]
enum CliError {
    UnknownProgram(String),
    Core(CoreError),
    Io(CoreError, IoContext, PathBuf),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::UnknownProgram(name) => write!(
                f,
                "unknown program \"{}\"; available: {}",
                name,
                vregc::demos::NAMES.join(", ")
            ),
            CliError::Core(err) => write!(f, "compilation failed: {}", err),
            CliError::Io(err, context, path) => write!(
                f,
                "{} \"{}\" failed: {}",
                match context {
                    IoContext::WriteImage => "writing image",
                    IoContext::WriteSymbols => "writing symbol map",
                },
                path.display(),
                err
            ),
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> CliError {
        CliError::Core(err)
    }
}

fn main() {
    env_logger::init();

    let matches = app_from_crate!()
        .arg(
            Arg::with_name("PROGRAM")
                .help("Name of the embedded program fixture to compile")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("OUTPUT")
                .help("Path to write the packed image to")
                .required(true)
                .index(2),
        )
        .arg(
            Arg::with_name("reg-count")
                .short("r")
                .long("reg-count")
                .takes_value(true)
                .value_name("N")
                .default_value("10")
                .help("Number of physical registers to allocate"),
        )
        .arg(Arg::with_name("dump-ir").long("dump-ir").help("Print each compiled object's IR"))
        .arg(Arg::with_name("dump-hw").long("dump-hw").help("Print hardware instructions after packaging"))
        .arg(Arg::with_name("dump-symbols").long("dump-symbols").help("Print the symbol offset map"))
        .get_matches();

    let program = matches.value_of("PROGRAM").unwrap();
    let output = matches.value_of("OUTPUT").unwrap();
    let reg_count: u8 = value_t!(matches, "reg-count", u8).unwrap_or_else(|e| e.exit());

    if let Err(err) = run(
        program,
        output,
        reg_count,
        matches.is_present("dump-ir"),
        matches.is_present("dump-hw"),
        matches.is_present("dump-symbols"),
    ) {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

fn run(program: &str, output: &str, reg_count: u8, dump_ir: bool, dump_hw: bool, dump_symbols: bool) -> Result<(), CliError> {
    let top_level = vregc::demos::by_name(program).ok_or_else(|| CliError::UnknownProgram(program.to_string()))?;

    info!("compiling \"{}\" with {} physical registers", program, reg_count);
    let mut compiler = vregc::driver::Driver::new().compile(top_level)?;

    if dump_ir {
        dump_compiled_ir(&compiler);
    }

    let packaged = vregc::packager::package(&mut compiler, reg_count)?;

    if dump_hw {
        dump_hardware(&packaged);
    }
    if dump_symbols {
        dump_symbol_map(&packaged);
    }

    let output_path = Path::new(output);
    vregc::image::write_file(output_path, &packaged)
        .map_err(|err| CliError::Io(err, IoContext::WriteImage, output_path.to_owned()))?;

    let symbols_path = output_path.with_extension("json");
    vregc::image::write_symbols_file(&symbols_path, &packaged.symbols)
        .map_err(|err| CliError::Io(err, IoContext::WriteSymbols, symbols_path.clone()))?;

    info!("wrote image to \"{}\", symbol map to \"{}\"", output_path.display(), symbols_path.display());
    Ok(())
}

fn dump_compiled_ir(compiler: &vregc::compiler::Compiler) {
    for object in &compiler.compiled_objects {
        match object {
            vregc::compiler::CompiledObject::Function(f) => {
                println!("function {}:", f.name);
                print_ir(&f.scope.borrow().code);
            }
            vregc::compiler::CompiledObject::TopLevel(code) => {
                println!("toplevel:");
                print_ir(code);
            }
        }
    }
}

fn print_ir(code: &[Instr]) {
    for (i, instr) in code.iter().enumerate() {
        println!("  [{}] {:?}", i, instr.op);
    }
}

fn dump_hardware(packaged: &vregc::packager::PackagedProgram) {
    println!("startup: {:?}", packaged.startup);
    print_hw(&packaged.code);
}

fn print_hw(code: &[HardwareInstruction]) {
    for (i, instr) in code.iter().enumerate() {
        println!("  [{}] {:?}", i, instr);
    }
}

fn dump_symbol_map(packaged: &vregc::packager::PackagedProgram) {
    let mut names: Vec<&String> = packaged.symbols.keys().collect();
    names.sort();
    for name in names {
        println!("{} = {}", name, packaged.symbols[name]);
    }
}
