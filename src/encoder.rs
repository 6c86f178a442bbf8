//! The encoder (spec §4.5): lowers fully-desugared, fully-allocated IR into
//! [`HardwareInstruction`]s, then spills out-of-range immediates to the data
//! table.
//!
//! Grounded on the donor's `backend/rustvm/encoder.py`: one `emit_*` method
//! per IR variant, each producing one or more `HardWareInstruction`s. The
//! `InstructionEncoder`'s metaclass-driven dispatch table becomes a `match`
//! on the (now closed) `Op` variant set.

use std::collections::HashMap;

use crate::compiler::Compiler;
use crate::error::{Error, InternalCompilerError};
use crate::hardware::{BinaryOpcode, HardwareGroup, HardwareInstruction, HwArg, ManipOpcode, MemOpcode, SpecialRegister, UnaryOpcode, FREE_REG_OFFSET};
use crate::ir::{Instr, Op, PreInstr};
use crate::register::{Dereference, Immediate, Param, Register};
use crate::scope::Scope;

/// Convert one already-allocated IR operand into its hardware-level form.
/// A register not yet carrying a `physical` assignment reaching here is an
/// internal error: allocation must run before encoding.
fn convert_operand(param: &Param) -> Result<HwArg, Error> {
    match param {
        Param::Register(r) => Ok(HwArg::register(wire_index(r)?)),
        Param::Dereference(d) => Ok(HwArg::deref(convert_operand(&d.to)?)),
        Param::Immediate(i) => Ok(HwArg::Immediate(i.value)),
        Param::DataReference(d) => Ok(HwArg::DataReference(d.name.clone())),
    }
}

/// A register's final wire index: a hardware-pinned register encodes its
/// `SpecialRegister` index directly; an allocated one encodes
/// `physical + FREE_REG_OFFSET` (spec §4.6, operand packing table).
fn wire_index(r: &Register) -> Result<u8, Error> {
    let phys = r
        .physical
        .ok_or_else(|| Error::from(InternalCompilerError::new(format!("register {} reached encoding unallocated", r))))?;
    if r.is_hardware_pinned() {
        Ok(phys)
    } else {
        Ok(phys + FREE_REG_OFFSET)
    }
}

fn special(reg: SpecialRegister, size: u8) -> Param {
    Register::hardware(reg.index(), size, false).into()
}

fn hw(group: HardwareGroup, opcode: u8, size: u8, args: Vec<Param>) -> Result<HardwareInstruction, Error> {
    let args = args.iter().map(convert_operand).collect::<Result<Vec<_>, _>>()?;
    Ok(HardwareInstruction::new(group, opcode, size, args))
}

/// Lower one desugared `Op` into the hardware instructions it expands to
/// (spec §4.5, lowering table). Pre-instructions (spill/load) are the
/// allocator's concern and are expected to have already been folded into
/// the surrounding instruction stream by the caller.
pub fn encode_op(op: &Op) -> Result<Vec<HardwareInstruction>, Error> {
    match op {
        Op::Mov { to, from } => Ok(vec![hw(HardwareGroup::Manip, ManipOpcode::Mov as u8, to.size(), vec![to.clone(), from.clone()])?]),

        Op::Unary { arg, op, to } => {
            let opcode = UnaryOpcode::from(*op);
            Ok(vec![hw(HardwareGroup::Unary, opcode as u8, arg.size(), vec![arg.clone(), to.clone()])?])
        }

        Op::Binary { left, right, op, to } => {
            let opcode = BinaryOpcode::from(*op);
            Ok(vec![hw(HardwareGroup::Binary, opcode as u8, left.size(), vec![left.clone(), right.clone(), to.clone()])?])
        }

        Op::Compare { left, right } => Ok(vec![hw(HardwareGroup::Manip, ManipOpcode::Tst as u8, left.size(), vec![left.clone(), right.clone()])?]),

        Op::SetCmp { dest, cmp } => {
            let code: Param = Immediate::new(*cmp as i64, 2).into();
            Ok(vec![hw(HardwareGroup::Manip, ManipOpcode::Set as u8, dest.size(), vec![code, dest.clone()])?])
        }

        Op::Push { arg } => Ok(vec![hw(HardwareGroup::Mem, MemOpcode::Push as u8, arg.size(), vec![arg.clone()])?]),
        Op::Pop { arg } => Ok(vec![hw(HardwareGroup::Mem, MemOpcode::Pop as u8, arg.size(), vec![arg.clone()])?]),

        Op::Return { arg, .. } => {
            let mut out = Vec::new();
            if let Some(arg) = arg {
                out.push(hw(
                    HardwareGroup::Manip,
                    ManipOpcode::Mov as u8,
                    arg.size(),
                    vec![special(SpecialRegister::Return, arg.size()), arg.clone()],
                )?);
            }
            out.push(hw(HardwareGroup::Mem, MemOpcode::Ret as u8, 0, vec![])?);
            Ok(out)
        }

        Op::Call { args, target, result } => {
            let mut out = Vec::new();
            out.push(hw(HardwareGroup::Mem, MemOpcode::Call as u8, target.size(), vec![target.clone()])?);

            let argsize = Op::call_argsize(args);
            out.push(hw(HardwareGroup::Manip, ManipOpcode::Mov as u8, 8, vec![Immediate::new(i64::from(argsize), 8).into()])?);

            if let Some(result) = result {
                out.push(hw(
                    HardwareGroup::Manip,
                    ManipOpcode::Mov as u8,
                    result.size(),
                    vec![result.clone(), special(SpecialRegister::Return, result.size())],
                )?);
            }
            Ok(out)
        }

        Op::Jump { target, condition } => {
            let condition = condition.clone().unwrap_or_else(|| Immediate::new(1, 2).into());
            let size = condition.size();
            let condition = convert_operand(&condition)?;
            Ok(vec![HardwareInstruction::new(
                HardwareGroup::Manip,
                ManipOpcode::Jmp as u8,
                size,
                vec![condition, HwArg::JumpTarget(*target)],
            )])
        }

        Op::Resize { from, to } => {
            let signed = from.filter_reg().map_or(false, |r| r.signed);
            let opcode = if signed { ManipOpcode::Sxi } else { ManipOpcode::Sxu };
            let from_hw = convert_operand(from)?;
            let size_operand = HwArg::Immediate(i64::from(to.size()));
            let to_hw = convert_operand(to)?;
            Ok(vec![HardwareInstruction::new(HardwareGroup::Manip, opcode as u8, from.size(), vec![from_hw, size_operand, to_hw])])
        }

        Op::JumpTarget => Ok(Vec::new()),

        Op::MachineInstr { name, size, params } => {
            let (group, opcode) = crate::hardware::resolve_mnemonic(name)?;
            Ok(vec![hw(group, opcode, *size, params.clone())?])
        }

        Op::LoadVar { .. } | Op::SaveVar { .. } | Op::Prelude { .. } | Op::Epilog { .. } => {
            Err(InternalCompilerError::new(format!(
                "`{}` reached encoding undesugared",
                op.name()
            ))
            .into())
        }
    }
}

/// A register naming physical slot `physical` directly, at `size`/`signed`.
/// Used to address the spill scratch register the allocator already
/// reserved for it, bypassing allocation entirely (it is itself the
/// register being spilled or reloaded).
fn spill_scratch(physical: u8, size: u8, signed: bool) -> Register {
    let mut r = Register::new(physical as u32, size, signed);
    r.physical = Some(physical);
    r
}

fn spill_slot_name(slot: usize, top_level: bool) -> String {
    if top_level {
        format!("global-spill-{}", slot)
    } else {
        format!("spill-var-{}", slot)
    }
}

fn spill_slot_offset(scope: &Scope, slot: usize, top_level: bool) -> Result<i32, Error> {
    let name = spill_slot_name(slot, top_level);
    let var = scope
        .lookup_local(&name)
        .ok_or_else(|| InternalCompilerError::new(format!("spill slot `{}` was never reserved", name)))?;
    var.stack_offset()
        .ok_or_else(|| InternalCompilerError::new(format!("spill slot `{}` has no stack offset", name)).into())
}

/// Expand one allocator-inserted spill/reload into the hardware
/// instructions that move its value to or from its spill slot (spec §4.3,
/// "Pre-instructions"). Grounded on the donor's `process_spill`: the
/// register being spilled doubles as its own address scratch once its
/// value is safely pushed (or before it's overwritten on reload): a
/// 2-byte view computes `base_pointer + slot_offset`, an 8-byte view moves
/// the actual value.
pub fn encode_pre_instr(pre: &PreInstr, scope: &Scope, top_level: bool) -> Result<Vec<HardwareInstruction>, Error> {
    match pre {
        PreInstr::Spill { physical, slot } => {
            let offset = spill_slot_offset(scope, *slot, top_level)?;
            let reg8 = spill_scratch(*physical, 8, false);
            let reg2 = spill_scratch(*physical, 2, false);
            Ok(vec![
                hw(HardwareGroup::Mem, MemOpcode::Push as u8, 8, vec![reg8.into()])?,
                hw(
                    HardwareGroup::Manip,
                    ManipOpcode::Mov as u8,
                    2,
                    vec![reg2.clone().into(), special(SpecialRegister::Base, 2)],
                )?,
                hw(
                    HardwareGroup::Binary,
                    BinaryOpcode::Add as u8,
                    2,
                    vec![reg2.clone().into(), Immediate::new(i64::from(offset), 2).into(), reg2.clone().into()],
                )?,
                hw(
                    HardwareGroup::Mem,
                    MemOpcode::Pop as u8,
                    8,
                    vec![Dereference::new(reg2.into(), 8).into()],
                )?,
            ])
        }
        PreInstr::Load { physical, slot } => {
            let offset = spill_slot_offset(scope, *slot, top_level)?;
            let reg8 = spill_scratch(*physical, 8, false);
            let reg2 = spill_scratch(*physical, 2, false);
            Ok(vec![
                hw(
                    HardwareGroup::Manip,
                    ManipOpcode::Mov as u8,
                    2,
                    vec![reg2.clone().into(), special(SpecialRegister::Base, 2)],
                )?,
                hw(
                    HardwareGroup::Binary,
                    BinaryOpcode::Add as u8,
                    2,
                    vec![reg2.clone().into(), Immediate::new(i64::from(offset), 2).into(), reg2.clone().into()],
                )?,
                hw(
                    HardwareGroup::Manip,
                    ManipOpcode::Mov as u8,
                    8,
                    vec![reg8.into(), Dereference::new(reg2.into(), 8).into()],
                )?,
            ])
        }
    }
}

/// Encode every instruction in `code`, in order: each instruction's
/// pre-instructions (spills/reloads) first, then its own lowering (spec
/// §4.3/§4.5). `scope` backs the spill slots this code's allocator run
/// reserved; pass the enclosing function's scope, or a shared pseudo-scope
/// for toplevel code (see [`crate::packager`]).
///
/// `Op::Jump`'s `target` is an index into `code` itself (the position of
/// the `Op::JumpTarget` it jumps to); this pass resolves every such
/// `HwArg::JumpTarget` to this object's own byte offset before returning,
/// since `Op::JumpTarget` contributes no hardware instructions and its
/// code-index is meaningless outside this function. The packager adds
/// this object's placement offset in the final image on top.
pub fn encode_all(code: &[Instr], scope: &Scope, top_level: bool) -> Result<Vec<HardwareInstruction>, Error> {
    let mut out = Vec::new();
    let mut labels: HashMap<usize, usize> = HashMap::new();
    let mut offset = 0usize;

    for (index, instr) in code.iter().enumerate() {
        for pre in &instr.pre_instructions {
            let hws = encode_pre_instr(pre, scope, top_level)?;
            offset += hws.iter().map(HardwareInstruction::byte_len).sum::<usize>();
            out.extend(hws);
        }
        if matches!(instr.op, Op::JumpTarget) {
            labels.insert(index, offset);
        }
        let hws = encode_op(&instr.op)?;
        offset += hws.iter().map(HardwareInstruction::byte_len).sum::<usize>();
        out.extend(hws);
    }

    for hw in out.iter_mut() {
        for arg in hw.args.iter_mut() {
            if let HwArg::JumpTarget(index) = arg {
                let resolved = labels.get(index).copied().ok_or_else(|| {
                    InternalCompilerError::new(format!("jump target at code index {} was never emitted", index))
                })?;
                *arg = HwArg::JumpTarget(resolved);
            }
        }
    }

    Ok(out)
}

/// Immediate expansion (spec §4.5): any `Immediate` whose value doesn't fit
/// unsigned in 14 bits is spilled to the data table as little-endian bytes
/// sized to the operand's own width, sign-extended per the operand's own
/// size before truncation if negative, and replaced with a dereference of
/// its new data-table location.
pub fn expand_immediates(compiler: &mut Compiler, program: &mut [HardwareInstruction]) -> Result<(), Error> {
    for instr in program.iter_mut() {
        for arg in instr.args.iter_mut() {
            if let HwArg::Immediate(value) = arg {
                if !fits_14_bits(*value) {
                    let bytes = little_endian_bytes(*value, instr.size);
                    let name = compiler.add_bytes("imm", bytes);
                    *arg = HwArg::Dereference(Box::new(HwArg::DataReference(name)));
                }
            }
        }
    }
    Ok(())
}

/// Whether `value` fits a 14-bit operand slot without losing information,
/// by magnitude alone (spec §4.5; grounded on the donor's
/// `arg.val.bit_length() > 14`, which ignores sign: small negative
/// offsets such as a stack slot's pack inline, only values whose magnitude
/// overflows 14 bits get spilled to the data table).
fn fits_14_bits(value: i64) -> bool {
    bit_length(value) <= 14
}

fn bit_length(value: i64) -> u32 {
    let magnitude = value.unsigned_abs();
    64 - magnitude.leading_zeros()
}

fn little_endian_bytes(value: i64, size: u8) -> Vec<u8> {
    let bytes = value.to_le_bytes();
    bytes[..size as usize].to_vec()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{BinaryOp, RegisterCounter};

    #[test]
    fn binary_op_lowers_to_its_opcode_with_lefts_size() {
        let mut counter = RegisterCounter::default();
        let mut l = counter.fresh(4, true);
        l.physical = Some(0);
        let mut r = counter.fresh(4, true);
        r.physical = Some(1);
        let mut to = counter.fresh(4, true);
        to.physical = Some(0);

        let op = Op::Binary {
            left: l.into(),
            right: r.into(),
            op: BinaryOp::Add,
            to: to.into(),
        };

        let hws = encode_op(&op).unwrap();
        assert_eq!(hws.len(), 1);
        assert_eq!(hws[0].group, HardwareGroup::Binary);
        assert_eq!(hws[0].opcode, BinaryOpcode::Add as u8);
        assert_eq!(hws[0].size, 4);
    }

    #[test]
    fn call_without_a_result_emits_no_trailing_mov() {
        let mut counter = RegisterCounter::default();
        let mut target = counter.fresh(2, false);
        target.physical = Some(0);

        let op = Op::Call {
            args: vec![],
            target: target.into(),
            result: None,
        };
        let hws = encode_op(&op).unwrap();
        // Mem.call, Manip.mov(argsize) -- no result mov.
        assert_eq!(hws.len(), 2);
        assert_eq!(hws[0].group, HardwareGroup::Mem);
        assert_eq!(hws[1].group, HardwareGroup::Manip);
    }

    #[test]
    fn call_with_a_result_emits_the_trailing_mov_from_the_return_register() {
        let mut counter = RegisterCounter::default();
        let mut target = counter.fresh(2, false);
        target.physical = Some(0);
        let mut result = counter.fresh(4, true);
        result.physical = Some(1);

        let op = Op::Call {
            args: vec![],
            target: target.into(),
            result: Some(result.into()),
        };
        let hws = encode_op(&op).unwrap();
        assert_eq!(hws.len(), 3);
        assert_eq!(hws[2].group, HardwareGroup::Manip);
        assert_eq!(hws[2].opcode, ManipOpcode::Mov as u8);
    }

    #[test]
    fn an_unallocated_register_reaching_encoding_is_an_internal_error() {
        let mut counter = RegisterCounter::default();
        let r = counter.fresh(4, true); // physical left as None
        let op = Op::Mov { to: r.clone().into(), from: r.into() };
        assert!(encode_op(&op).is_err());
    }

    #[test]
    fn small_immediates_are_left_as_operands() {
        let mut compiler = Compiler::new();
        let mut prog = vec![HardwareInstruction::new(HardwareGroup::Binary, 0, 4, vec![HwArg::Immediate(10)])];
        expand_immediates(&mut compiler, &mut prog).unwrap();
        assert!(matches!(prog[0].args[0], HwArg::Immediate(10)));
    }

    #[test]
    fn out_of_range_immediates_spill_to_the_data_table() {
        let mut compiler = Compiler::new();
        let mut prog = vec![HardwareInstruction::new(HardwareGroup::Binary, 0, 4, vec![HwArg::Immediate(1 << 20)])];
        expand_immediates(&mut compiler, &mut prog).unwrap();
        assert!(matches!(prog[0].args[0], HwArg::Dereference(_)));
        assert_eq!(compiler.data.len(), 1);
    }

    #[test]
    fn small_negative_immediates_are_not_spilled() {
        // A stack-slot offset like -8 has a 14-bit-fitting magnitude even
        // though it's negative; it must pack inline, not route through the
        // data table (matches the donor's sign-ignoring bit_length check).
        let mut compiler = Compiler::new();
        let mut prog = vec![HardwareInstruction::new(HardwareGroup::Binary, 0, 2, vec![HwArg::Immediate(-8)])];
        expand_immediates(&mut compiler, &mut prog).unwrap();
        assert!(matches!(prog[0].args[0], HwArg::Immediate(-8)));
        assert_eq!(compiler.data.len(), 0);
    }

    #[test]
    fn spill_pushes_the_register_then_pops_into_its_computed_slot_address() {
        let mut scope = Scope::new();
        scope.reserve_spill_vars(1, false);

        let pre = PreInstr::Spill { physical: 2, slot: 0 };
        let hws = encode_pre_instr(&pre, &scope, false).unwrap();

        assert_eq!(hws.len(), 4);
        assert_eq!(hws[0].group, HardwareGroup::Mem);
        assert_eq!(hws[0].opcode, MemOpcode::Push as u8);
        assert_eq!(hws[1].group, HardwareGroup::Manip);
        assert_eq!(hws[1].opcode, ManipOpcode::Mov as u8);
        assert_eq!(hws[2].group, HardwareGroup::Binary);
        assert_eq!(hws[2].opcode, BinaryOpcode::Add as u8);
        assert_eq!(hws[3].group, HardwareGroup::Mem);
        assert_eq!(hws[3].opcode, MemOpcode::Pop as u8);
        assert!(matches!(hws[3].args[0], HwArg::Dereference(_)));
    }

    #[test]
    fn load_computes_the_slot_address_then_dereferences_into_the_register() {
        let mut scope = Scope::new();
        scope.reserve_spill_vars(1, true);

        let pre = PreInstr::Load { physical: 3, slot: 0 };
        let hws = encode_pre_instr(&pre, &scope, true).unwrap();

        assert_eq!(hws.len(), 3);
        assert_eq!(hws[2].group, HardwareGroup::Manip);
        assert_eq!(hws[2].opcode, ManipOpcode::Mov as u8);
        assert!(matches!(hws[2].args[1], HwArg::Dereference(_)));
    }

    #[test]
    fn an_unreserved_spill_slot_is_an_internal_error() {
        let scope = Scope::new();
        let pre = PreInstr::Load { physical: 0, slot: 0 };
        assert!(encode_pre_instr(&pre, &scope, false).is_err());
    }

    #[test]
    fn encode_all_emits_pre_instructions_before_the_instructions_own_lowering() {
        let mut scope = Scope::new();
        scope.reserve_spill_vars(1, false);

        let mut counter = RegisterCounter::default();
        let mut r = counter.fresh(4, true);
        r.physical = Some(0);

        let mut instr = Instr::new(Op::Mov { to: r.clone().into(), from: r.into() }, crate::span::SourceSpan::synthetic());
        instr.pre_instructions.push(PreInstr::Load { physical: 1, slot: 0 });

        let hws = encode_all(&[instr], &scope, false).unwrap();
        // 3 words for the Load expansion, then 1 for the Mov itself.
        assert_eq!(hws.len(), 4);
        assert_eq!(hws[3].opcode, ManipOpcode::Mov as u8);
        assert_eq!(hws[3].group, HardwareGroup::Manip);
    }

    #[test]
    fn a_backward_jump_resolves_to_the_byte_offset_of_its_target() {
        let scope = Scope::new();
        let span = crate::span::SourceSpan::synthetic();

        // JumpTarget at index 0 (offset 0), then one Mov (2 words == 4
        // bytes), then an unconditional Jump back to index 0.
        let mut r = RegisterCounter::default().fresh(2, false);
        r.physical = Some(0);
        let code = vec![
            Instr::new(Op::JumpTarget, span),
            Instr::new(Op::Mov { to: r.clone().into(), from: r.into() }, span),
            Instr::new(Op::Jump { target: 0, condition: None }, span),
        ];

        let hws = encode_all(&code, &scope, false).unwrap();
        assert_eq!(hws.len(), 2);
        let jump = &hws[1];
        assert!(matches!(jump.args[1], HwArg::JumpTarget(0)));
    }

    #[test]
    fn a_jump_to_a_never_emitted_target_is_an_internal_error() {
        let scope = Scope::new();
        let span = crate::span::SourceSpan::synthetic();
        let code = vec![Instr::new(Op::Jump { target: 99, condition: None }, span)];
        assert!(encode_all(&code, &scope, false).is_err());
    }
}
