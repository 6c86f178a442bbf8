//! Final byte serialization (spec §6, "Output"): turns a [`PackagedProgram`]
//! into the raw image the target VM executes from offset 0, plus its symbol
//! map.
//!
//! Grounded on the donor's `vex`/`vexfile` read/write pair: a plain
//! `byteorder`-driven writer over a `Write`, exposed both as a free function
//! and as an extension trait, with `read_file`/`write_file` helpers over
//! `std::fs::File`. There's no length-prefixed header here the way `vex`'s
//! `Executable` carries one: the image is the instruction stream itself,
//! starting with the startup jump (spec §4.6), so only the write direction
//! is needed.

use std::collections::HashMap;
use std::fs::File;
use std::io::prelude::*;
use std::io::BufWriter;
use std::path::Path;

use byteorder::WriteBytesExt;
use util::Endian;

use crate::error::Error;
use crate::packager::PackagedProgram;

/// Serialize `packaged` to its final byte image: the startup jump, the
/// program-data region, then every code instruction in placement order
/// (spec §4.6, "Image layout"). Every operand must already be a
/// [`crate::hardware::HwArg::Register`], [`crate::hardware::HwArg::Immediate`],
/// or [`crate::hardware::HwArg::MemoryLocation`] - anything else is an
/// internal error surfaced by [`crate::hardware::HwArg::pack`].
pub fn write<W: Write>(writer: &mut W, packaged: &PackagedProgram) -> Result<(), Error> {
    for word in packaged.startup.encode()? {
        writer.write_u16::<Endian>(word)?;
    }
    writer.write_all(&packaged.data)?;
    for instr in &packaged.code {
        for word in instr.encode()? {
            writer.write_u16::<Endian>(word)?;
        }
    }
    Ok(())
}

/// Serialize `packaged.symbols` as a JSON object mapping identifier to
/// absolute byte offset (spec §6, "writing the symbol map as JSON next to
/// the image").
pub fn write_symbols<W: Write>(writer: &mut W, symbols: &HashMap<String, u32>) -> Result<(), Error> {
    serde_json::to_writer_pretty(writer, symbols)?;
    Ok(())
}

pub trait WriteImageExt: Write + Sized {
    fn write_image(&mut self, packaged: &PackagedProgram) -> Result<(), Error> {
        write(self, packaged)
    }
}

impl<W: Write + Sized> WriteImageExt for W {}

pub fn write_file<P: AsRef<Path>>(path: P, packaged: &PackagedProgram) -> Result<(), Error> {
    BufWriter::new(File::create(path)?).write_image(packaged)
}

pub fn write_symbols_file<P: AsRef<Path>>(path: P, symbols: &HashMap<String, u32>) -> Result<(), Error> {
    write_symbols(&mut BufWriter::new(File::create(path)?), symbols)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hardware::{HardwareGroup, HardwareInstruction, HwArg, ManipOpcode};

    #[test]
    fn startup_jump_is_written_before_the_data_region() {
        let packaged = PackagedProgram {
            startup: HardwareInstruction::new(HardwareGroup::Manip, ManipOpcode::Jmp as u8, 2, vec![HwArg::Immediate(1), HwArg::MemoryLocation(6)]),
            data: vec![0xAA, 0xBB],
            code: vec![],
            symbols: HashMap::new(),
        };

        let mut out = Vec::new();
        write(&mut out, &packaged).unwrap();

        // startup is 3 words (opcode + 2 args) = 6 bytes, then the 2 data bytes.
        assert_eq!(out.len(), 6 + 2);
        assert_eq!(&out[6..8], &[0xAA, 0xBB]);
    }

    #[test]
    fn symbol_map_serializes_as_a_flat_json_object() {
        let mut symbols = HashMap::new();
        symbols.insert("main".to_string(), 42u32);

        let mut out = Vec::new();
        write_symbols(&mut out, &symbols).unwrap();

        let parsed: HashMap<String, u32> = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed.get("main"), Some(&42));
    }
}
