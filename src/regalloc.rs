//! Linear-scan-like register allocation (spec §4.3): assign each virtual
//! register a physical register, spilling to a stack slot under pressure.
//!
//! Grounded on the donor's `register_allocate.py`: a backward liveness pass
//! (`mark_last_usages`) records each register's last use in
//! `closing_registers`, then a single forward pass assigns physical
//! registers, evicting the lowest-numbered eligible physical register when
//! none are free. Registers built by `Register::hardware` (an `asm` block
//! naming a physical register directly) are never touched here: in the
//! donor these are a distinct type that the allocator's register filter
//! never matches at all; skipping anything `is_hardware_pinned` reproduces
//! the same exclusion without a second register type.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, InternalCompilerError};
use crate::ir::{Instr, PreInstr};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RegisterState {
    Allocated(u8),
    Spilled(usize),
}

struct Allocator {
    reg_count: u8,
    usable: Vec<u8>,
    allocated: HashMap<u8, u32>,
    states: HashMap<u32, RegisterState>,
    spill_slots: Vec<Option<u32>>,
}

impl Allocator {
    fn new(reg_count: u8) -> Allocator {
        Allocator {
            reg_count,
            usable: (0..reg_count).rev().collect(),
            allocated: HashMap::new(),
            states: HashMap::new(),
            spill_slots: Vec::new(),
        }
    }

    fn spill_count(&self) -> u32 {
        self.spill_slots.len() as u32
    }

    fn emit_spill(&mut self, victim: u32, phys: u8) -> PreInstr {
        let slot = match self.spill_slots.iter().position(Option::is_none) {
            Some(i) => i,
            None => {
                self.spill_slots.push(None);
                self.spill_slots.len() - 1
            }
        };
        self.spill_slots[slot] = Some(victim);
        self.states.insert(victim, RegisterState::Spilled(slot));
        PreInstr::Spill { physical: phys, slot }
    }

    fn emit_load(&mut self, virt: u32, phys: u8) -> PreInstr {
        let slot = self
            .spill_slots
            .iter()
            .position(|s| *s == Some(virt))
            .expect("register marked Spilled but holds no spill slot");
        self.spill_slots[slot] = None;
        self.states.insert(virt, RegisterState::Allocated(phys));
        PreInstr::Load { physical: phys, slot }
    }

    /// The lowest-numbered physical register currently bound that isn't in
    /// `excludes` (spec §4.3: "picks the lowest-numbered eligible physical
    /// register deterministically").
    fn least_active(&self, excludes: &[u8], span: crate::span::SourceSpan, op_name: &str) -> Result<u8, Error> {
        (0..self.reg_count)
            .filter(|p| !excludes.contains(p) && self.allocated.contains_key(p))
            .min()
            .ok_or_else(|| {
                InternalCompilerError::new(format!(
                    "{}: instruction `{}` touches more than {} distinct registers, allocation is impossible",
                    span, op_name, self.reg_count
                ))
                .into()
            })
    }

    fn allocate_one(
        &mut self,
        virt: u32,
        pre: &mut Vec<PreInstr>,
        excludes: &[u8],
        span: crate::span::SourceSpan,
        op_name: &str,
    ) -> Result<u8, Error> {
        if let Some(state) = self.states.get(&virt).copied() {
            return match state {
                RegisterState::Allocated(phys) => Ok(phys),
                RegisterState::Spilled(_) => {
                    let phys = match self.usable.pop() {
                        Some(p) => p,
                        None => {
                            let victim_phys = self.least_active(excludes, span, op_name)?;
                            let victim_virt = self.allocated[&victim_phys];
                            let spill = self.emit_spill(victim_virt, victim_phys);
                            pre.push(spill);
                            victim_phys
                        }
                    };
                    self.allocated.insert(phys, virt);
                    let load = self.emit_load(virt, phys);
                    pre.push(load);
                    Ok(phys)
                }
            };
        }

        let phys = match self.usable.pop() {
            Some(p) => p,
            None => {
                let victim_phys = self.least_active(excludes, span, op_name)?;
                let victim_virt = self.allocated[&victim_phys];
                let spill = self.emit_spill(victim_virt, victim_phys);
                pre.push(spill);
                victim_phys
            }
        };
        self.states.insert(virt, RegisterState::Allocated(phys));
        self.allocated.insert(phys, virt);
        Ok(phys)
    }

    fn free(&mut self, virt: u32) -> Result<(), Error> {
        match self.states.remove(&virt) {
            Some(RegisterState::Allocated(phys)) => {
                self.allocated.remove(&phys);
                self.usable.push(phys);
                Ok(())
            }
            Some(RegisterState::Spilled(slot)) => {
                self.spill_slots[slot] = None;
                Ok(())
            }
            None => Err(InternalCompilerError::new(format!(
                "register allocator tried to free virtual register %{} which was never allocated",
                virt
            ))
            .into()),
        }
    }
}

/// Scan `code` backward, marking in each instruction's `closing_registers`
/// the virtual registers seen there for the last time in execution order.
pub fn mark_last_usages(code: &mut [Instr]) {
    let mut spotted = HashSet::new();
    for instr in code.iter_mut().rev() {
        for reg in instr.op.touched_registers() {
            if reg.is_hardware_pinned() {
                continue;
            }
            if spotted.insert(reg.id) {
                instr.closing_registers.insert(reg.id);
            }
        }
    }
}

/// Allocate physical registers (out of `reg_count`) for every virtual
/// register `code` touches, mutating each operand's `physical` field in
/// place and filling in `pre_instructions` with the spills/loads the
/// allocation required. Returns the number of 8-byte spill slots used, for
/// the caller to reserve as locals in the enclosing scope.
pub fn allocate(reg_count: u8, code: &mut [Instr]) -> Result<u32, Error> {
    let mut state = Allocator::new(reg_count);
    mark_last_usages(code);

    for instr in code.iter_mut() {
        instr.clone_regs();
        let op_name = instr.op.name();
        let span = instr.span;

        let mut excludes: Vec<u8> = Vec::new();
        let mut pre: Vec<PreInstr> = Vec::new();
        for param in instr.op.touched_params_mut() {
            if let Some(reg) = param.filter_reg_mut() {
                if reg.is_hardware_pinned() {
                    continue;
                }
                let phys = state.allocate_one(reg.id, &mut pre, &excludes, span, op_name)?;
                excludes.push(phys);
                reg.physical = Some(phys);
            }
        }
        instr.pre_instructions = pre;

        for virt in instr.closing_registers.clone() {
            state.free(virt)?;
        }
    }

    Ok(state.spill_count())
}

/// The distinct physical registers `code` touches, in ascending order
/// (grounded on the donor's `insert_register_stores`, which scans a
/// function's whole flattened code for `touched_registers` after
/// allocation). Only the enclosing function's own [`Prelude`](crate::ir::Op::Prelude)/
/// [`Epilog`](crate::ir::Op::Epilog) read this back. Nested, non-function
/// scopes keep the empty `used_hw_regs` they're created with, saving
/// nothing extra around their own stack-size adjustment.
pub fn collect_used_hw_regs(code: &[Instr]) -> Vec<u8> {
    let mut seen: HashSet<u8> = HashSet::new();
    for instr in code {
        for reg in instr.op.touched_registers() {
            if !reg.is_hardware_pinned() {
                if let Some(phys) = reg.physical {
                    seen.insert(phys);
                }
            }
        }
    }
    let mut regs: Vec<u8> = seen.into_iter().collect();
    regs.sort_unstable();
    regs
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{BinaryOp, Op, RegisterCounter};
    use crate::span::SourceSpan;

    fn instr(op: Op) -> Instr {
        Instr::new(op, SourceSpan::synthetic())
    }

    #[test]
    fn reuses_a_register_across_its_lifetime() {
        let mut counter = RegisterCounter::default();
        let a = counter.fresh(4, false);
        let b = counter.fresh(4, false);
        let mut code = vec![
            instr(Op::Binary {
                left: a.clone().into(),
                right: b.clone().into(),
                op: BinaryOp::Add,
                to: a.clone().into(),
            }),
            instr(Op::Mov {
                to: b.clone().into(),
                from: a.into(),
            }),
        ];

        let spills = allocate(10, &mut code).unwrap();
        assert_eq!(spills, 0);

        let first_to = match &code[0].op {
            Op::Binary { to, .. } => to.filter_reg().unwrap().physical.unwrap(),
            _ => unreachable!(),
        };
        let second_from = match &code[1].op {
            Op::Mov { from, .. } => from.filter_reg().unwrap().physical.unwrap(),
            _ => unreachable!(),
        };
        assert_eq!(first_to, second_from);
    }

    #[test]
    fn spills_and_reloads_when_more_registers_are_live_than_physical_slots() {
        use crate::ir::{immediate, UnaryOp};

        let mut counter = RegisterCounter::default();
        let a = counter.fresh(4, false);
        let b = counter.fresh(4, false);
        let c = counter.fresh(4, false);

        let define = |r: crate::register::Register| {
            instr(Op::Binary {
                left: immediate(1, 4).into(),
                right: immediate(1, 4).into(),
                op: BinaryOp::Add,
                to: r.into(),
            })
        };
        let touch = |r: crate::register::Register| {
            instr(Op::Unary {
                arg: r.clone().into(),
                op: UnaryOp::BitInv,
                to: r.into(),
            })
        };

        // a and b are both still live when c is defined: with only 2
        // physical registers, defining c forces a (or b) out to a spill
        // slot; its later use must reload it.
        let mut code = vec![
            define(a.clone()),
            define(b.clone()),
            define(c.clone()),
            touch(a),
            touch(b),
            touch(c),
        ];

        let spills = allocate(2, &mut code).unwrap();
        assert!(spills >= 1, "3 overlapping lifetimes with 2 physical registers must spill at least one");
    }

    #[test]
    fn exhausting_every_physical_register_in_one_instruction_is_an_internal_error() {
        let mut counter = RegisterCounter::default();
        let regs: Vec<_> = (0..3).map(|_| counter.fresh(4, false)).collect();
        let op = Op::Call {
            args: regs[1..].iter().cloned().map(Into::into).collect(),
            target: regs[0].clone().into(),
            result: None,
        };
        let mut code = vec![instr(op)];
        assert!(allocate(1, &mut code).is_err());
    }

    #[test]
    fn hardware_pinned_registers_are_never_allocated_or_freed() {
        use crate::register::Register;

        let pinned = Register::hardware(3, 2, false);
        assert!(pinned.is_hardware_pinned());
        let mut code = vec![instr(Op::MachineInstr {
            name: "mov".to_string(),
            size: 2,
            params: vec![pinned.clone().into()],
        })];
        let spills = allocate(10, &mut code).unwrap();
        assert_eq!(spills, 0);
        match &code[0].op {
            Op::MachineInstr { params, .. } => {
                assert_eq!(params[0].filter_reg().unwrap().physical, Some(3));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn collect_used_hw_regs_ignores_hardware_pinned_registers() {
        use crate::register::Register;

        let mut counter = RegisterCounter::default();
        let a = counter.fresh(4, false);
        let pinned = Register::hardware(7, 4, false);

        let mut code = vec![instr(Op::Mov {
            to: a.clone().into(),
            from: pinned.into(),
        })];
        allocate(4, &mut code).unwrap();

        let used = collect_used_hw_regs(&code);
        assert_eq!(used.len(), 1);
        assert!(!used.contains(&7));
    }
}
