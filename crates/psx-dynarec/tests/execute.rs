use std::cell::RefCell;
use std::rc::Rc;

use psx_dynarec::{
    cycles_of, CopOps, CoreState, MemRegion, MmioOps, NullCop, Opcode, State, EXIT_NORMAL,
    EXIT_SEGFAULT, EXIT_SYSCALL,
};

const RAM_LEN: usize = 0x1000;
const KSEG0_BASE: u32 = 0x8000_0000;

struct Ram {
    bytes: Box<[u8]>,
}

impl Ram {
    fn new() -> Self {
        Self {
            bytes: vec![0u8; RAM_LEN].into_boxed_slice(),
        }
    }

    fn region(&mut self) -> MemRegion {
        MemRegion::direct(0, RAM_LEN as u32, self.bytes.as_mut_ptr())
    }

    fn write_program(&mut self, offset: usize, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            self.set_word(offset + i * 4, *word);
        }
    }

    fn set_word(&mut self, offset: usize, word: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
    }

    fn word(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.bytes[offset..offset + 4].try_into().unwrap())
    }
}

fn state_over(ram: &mut Ram) -> Box<State> {
    State::new(vec![ram.region()], Box::new(NullCop)).expect("state init")
}

// Instruction encoders, register order as written in assembly.

fn itype(op: u32, rs: u32, rt: u32, imm: i16) -> u32 {
    (op << 26) | (rs << 21) | (rt << 16) | u32::from(imm as u16)
}

fn addiu(rt: u32, rs: u32, imm: i16) -> u32 {
    itype(0x09, rs, rt, imm)
}

fn ori(rt: u32, rs: u32, imm: u16) -> u32 {
    itype(0x0D, rs, rt, imm as i16)
}

fn lui(rt: u32, imm: u16) -> u32 {
    itype(0x0F, 0, rt, imm as i16)
}

fn sb(rt: u32, rs: u32, imm: i16) -> u32 {
    itype(0x28, rs, rt, imm)
}

fn sh(rt: u32, rs: u32, imm: i16) -> u32 {
    itype(0x29, rs, rt, imm)
}

fn sw(rt: u32, rs: u32, imm: i16) -> u32 {
    itype(0x2B, rs, rt, imm)
}

fn swl(rt: u32, rs: u32, imm: i16) -> u32 {
    itype(0x2A, rs, rt, imm)
}

fn lb(rt: u32, rs: u32, imm: i16) -> u32 {
    itype(0x20, rs, rt, imm)
}

fn lbu(rt: u32, rs: u32, imm: i16) -> u32 {
    itype(0x24, rs, rt, imm)
}

fn lh(rt: u32, rs: u32, imm: i16) -> u32 {
    itype(0x21, rs, rt, imm)
}

fn lhu(rt: u32, rs: u32, imm: i16) -> u32 {
    itype(0x25, rs, rt, imm)
}

fn lw(rt: u32, rs: u32, imm: i16) -> u32 {
    itype(0x23, rs, rt, imm)
}

fn beq(rs: u32, rt: u32, off: i16) -> u32 {
    itype(0x04, rs, rt, off)
}

fn rtype(rs: u32, rt: u32, rd: u32, funct: u32) -> u32 {
    (rs << 21) | (rt << 16) | (rd << 11) | funct
}

fn addu(rd: u32, rs: u32, rt: u32) -> u32 {
    rtype(rs, rt, rd, 0x21)
}

fn subu(rd: u32, rs: u32, rt: u32) -> u32 {
    rtype(rs, rt, rd, 0x23)
}

fn slt(rd: u32, rs: u32, rt: u32) -> u32 {
    rtype(rs, rt, rd, 0x2A)
}

fn sltu(rd: u32, rs: u32, rt: u32) -> u32 {
    rtype(rs, rt, rd, 0x2B)
}

fn sll(rd: u32, rt: u32, sa: u32) -> u32 {
    (rt << 16) | (rd << 11) | (sa << 6)
}

fn mult(rs: u32, rt: u32) -> u32 {
    rtype(rs, rt, 0, 0x18)
}

fn div(rs: u32, rt: u32) -> u32 {
    rtype(rs, rt, 0, 0x1A)
}

fn mflo(rd: u32) -> u32 {
    rtype(0, 0, rd, 0x12)
}

fn mfhi(rd: u32) -> u32 {
    rtype(0, 0, rd, 0x10)
}

fn j(target: u32) -> u32 {
    (0x02 << 26) | ((target >> 2) & 0x03FF_FFFF)
}

fn jal(target: u32) -> u32 {
    (0x03 << 26) | ((target >> 2) & 0x03FF_FFFF)
}

fn jr(rs: u32) -> u32 {
    rtype(rs, 0, 0, 0x08)
}

fn mfc0(rt: u32, rd: u32) -> u32 {
    (0x10 << 26) | (rt << 16) | (rd << 11)
}

fn mtc0(rt: u32, rd: u32) -> u32 {
    (0x10 << 26) | (0x04 << 21) | (rt << 16) | (rd << 11)
}

const NOP: u32 = 0;
const SYSCALL: u32 = 0x0000_000C;

#[test]
fn map_and_store() {
    let mut ram = Ram::new();
    ram.write_program(
        0,
        &[
            addiu(8, 0, 0x100),
            addiu(9, 0, 0xAB),
            sb(9, 8, 1),
            j(0x8000_0020),
            NOP,
        ],
    );
    let mut state = state_over(&mut ram);

    let next = state.execute(KSEG0_BASE);

    assert_eq!(next, 0x8000_0020);
    assert_eq!(ram.bytes[0x101], 0xAB);
    // Only the addressed byte changed.
    assert_eq!(ram.bytes[0x100], 0);
    assert_eq!(ram.bytes[0x102], 0);
    assert!(!state.core.stop);
    assert_eq!(state.core.exit_flags, EXIT_NORMAL);

    let block = state.cache().find(KSEG0_BASE).expect("registered block");
    assert_eq!(block.cycles, 20);
    assert_eq!(state.core.block_exit_cycles, 20);
    assert_eq!(state.current_block_pc(), Some(KSEG0_BASE));
}

#[test]
fn second_execution_hits_the_cache() {
    let mut ram = Ram::new();
    ram.write_program(0, &[addiu(8, 0, 1), j(0x8000_0010), NOP]);
    let mut state = state_over(&mut ram);

    state.execute(KSEG0_BASE);
    assert_eq!(state.stats().blocks_compiled, 1);
    assert_eq!(state.stats().cache_hits, 0);

    state.execute(KSEG0_BASE);
    assert_eq!(state.stats().blocks_compiled, 1);
    assert_eq!(state.stats().cache_hits, 1);
    assert_eq!(state.cache().len(), 1);
}

#[test]
fn kernel_segment_mirrors_reach_the_same_memory() {
    let mut ram = Ram::new();
    ram.write_program(
        0,
        &[
            lui(8, 0xA000),
            ori(8, 8, 0x200), // $t0 = 0xA0000200
            addiu(9, 0, 0x77),
            sb(9, 8, 0),
            lui(10, 0x8000),
            ori(10, 10, 0x200), // $t2 = 0x80000200
            lbu(11, 10, 0),
            j(0x8000_0030),
            NOP,
        ],
    );
    let mut state = state_over(&mut ram);

    state.execute(KSEG0_BASE);

    assert_eq!(ram.bytes[0x200], 0x77);
    assert_eq!(state.core.gpr[11], 0x77);
}

#[test]
fn executed_swl_merges_into_memory() {
    let mut ram = Ram::new();
    ram.set_word(0x200, 0xAABB_CCDD);
    ram.write_program(
        0,
        &[
            lui(9, 0x1122),
            ori(9, 9, 0x3344),
            addiu(8, 0, 0x201),
            swl(9, 8, 0),
            j(0x8000_0020),
            NOP,
        ],
    );
    let mut state = state_over(&mut ram);

    state.execute(KSEG0_BASE);

    assert_eq!(ram.word(0x200), 0xAABA_1122);
}

#[test]
fn taken_branch_runs_delay_slot_and_exits() {
    let mut ram = Ram::new();
    ram.write_program(
        0,
        &[
            addiu(8, 0, 1),
            beq(8, 8, 2), // taken, target 0x10
            addiu(9, 0, 5),
            addiu(9, 0, 99), // jumped over
            j(0x8000_0020),
            NOP,
        ],
    );
    let mut state = state_over(&mut ram);

    let next = state.execute(KSEG0_BASE);

    assert_eq!(next, 0x8000_0010);
    assert_eq!(state.core.gpr[9], 5);
    // Two instructions plus the folded delay slot.
    assert_eq!(state.core.block_exit_cycles, 12);

    // Resuming at the branch target compiles the tail as its own block.
    let next = state.execute(0x8000_0010);
    assert_eq!(next, 0x8000_0020);
    assert_eq!(state.stats().blocks_compiled, 2);
    assert_eq!(state.current_block_pc(), Some(0x8000_0010));
}

#[test]
fn untaken_branch_falls_through_in_block() {
    let mut ram = Ram::new();
    ram.write_program(
        0,
        &[
            addiu(8, 0, 1),
            beq(8, 0, 2), // not taken
            addiu(9, 0, 5), // delay slot still runs
            addiu(10, 0, 7),
            j(0x8000_0020),
            NOP,
        ],
    );
    let mut state = state_over(&mut ram);

    let next = state.execute(KSEG0_BASE);

    assert_eq!(next, 0x8000_0020);
    assert_eq!(state.core.gpr[9], 5);
    assert_eq!(state.core.gpr[10], 7);
}

#[test]
fn jal_links_and_jr_returns() {
    let mut ram = Ram::new();
    ram.write_program(
        0,
        &[
            jal(0x8000_0010), // 0x00
            NOP,              // 0x04
            j(0x8000_0020),   // 0x08
            NOP,              // 0x0C
            jr(31),           // 0x10
            NOP,              // 0x14
        ],
    );
    let mut state = state_over(&mut ram);

    let next = state.execute(KSEG0_BASE);
    assert_eq!(next, 0x8000_0010);
    assert_eq!(state.core.gpr[31], 0x8000_0008);

    let next = state.execute(next);
    assert_eq!(next, 0x8000_0008);

    let next = state.execute(next);
    assert_eq!(next, 0x8000_0020);
}

#[test]
fn alu_sequence() {
    let mut ram = Ram::new();
    ram.write_program(
        0,
        &[
            addiu(8, 0, 5),
            addiu(9, 0, 7),
            addu(10, 8, 9),
            ori(2, 10, 0x1234),
            sll(11, 9, 2),
            slt(12, 8, 9),
            sltu(13, 9, 8),
            subu(14, 9, 8),
            addiu(0, 0, 1), // write to $zero is discarded
            j(0x8000_0030),
            NOP,
        ],
    );
    let mut state = state_over(&mut ram);

    state.execute(KSEG0_BASE);

    assert_eq!(state.core.gpr[10], 12);
    assert_eq!(state.core.gpr[2], 0x123C);
    assert_eq!(state.core.gpr[11], 28);
    assert_eq!(state.core.gpr[12], 1);
    assert_eq!(state.core.gpr[13], 0);
    assert_eq!(state.core.gpr[14], 2);
    assert_eq!(state.core.gpr[0], 0);
}

#[test]
fn mult_and_div_fill_hi_lo() {
    let mut ram = Ram::new();
    ram.write_program(
        0,
        &[
            addiu(8, 0, 7),
            addiu(9, 0, 2),
            div(8, 9),
            mflo(10), // 3
            mfhi(11), // 1
            div(8, 0),
            mflo(12), // division by zero: all ones for a non-negative numerator
            mfhi(13), // numerator
            lui(8, 0x4000),
            mult(8, 9),
            mflo(14), // 0x80000000
            mfhi(15), // 0
            j(0x8000_0040),
            NOP,
        ],
    );
    let mut state = state_over(&mut ram);

    state.execute(KSEG0_BASE);

    assert_eq!(state.core.gpr[10], 3);
    assert_eq!(state.core.gpr[11], 1);
    assert_eq!(state.core.gpr[12], 0xFFFF_FFFF);
    assert_eq!(state.core.gpr[13], 7);
    assert_eq!(state.core.gpr[14], 0x8000_0000);
    assert_eq!(state.core.gpr[15], 0);
}

#[test]
fn loads_extend_correctly() {
    let mut ram = Ram::new();
    ram.write_program(
        0,
        &[
            addiu(8, 0, 0x180),
            addiu(9, 0, -1),
            sb(9, 8, 0),
            sh(9, 8, 2),
            lb(10, 8, 0),  // 0xFFFFFFFF
            lbu(11, 8, 0), // 0x000000FF
            lh(12, 8, 2),  // 0xFFFFFFFF
            lhu(13, 8, 2), // 0x0000FFFF
            j(0x8000_0030),
            NOP,
        ],
    );
    let mut state = state_over(&mut ram);

    state.execute(KSEG0_BASE);

    assert_eq!(state.core.gpr[10], 0xFFFF_FFFF);
    assert_eq!(state.core.gpr[11], 0x0000_00FF);
    assert_eq!(state.core.gpr[12], 0xFFFF_FFFF);
    assert_eq!(state.core.gpr[13], 0x0000_FFFF);
}

#[test]
fn nops_produce_no_code_but_count_cycles() {
    let mut ram = Ram::new();
    ram.write_program(
        0,
        &[addiu(8, 0, 1), NOP, NOP, mult(8, 8), j(0x8000_0020), NOP],
    );
    let mut state = state_over(&mut ram);

    state.execute(KSEG0_BASE);

    let block = state.cache().find(KSEG0_BASE).expect("registered block");
    let expected: u32 = block.opcode_list.iter().map(|&op| cycles_of(op)).sum();
    assert_eq!(block.cycles, expected);
    assert_eq!(block.cycles, 4 + 4 + 4 + 12 + 4 + 4);
}

#[test]
fn unmapped_load_raises_segfault_and_finishes_the_block() {
    let mut ram = Ram::new();
    ram.write_program(
        0,
        &[
            lui(8, 0xDEAD),
            ori(8, 8, 0xBEEF),
            lw(9, 8, 0),
            j(0x8000_0020),
            NOP,
        ],
    );
    let mut state = state_over(&mut ram);

    let next = state.execute(KSEG0_BASE);

    assert!(state.core.stop);
    assert_eq!(state.core.exit_flags, EXIT_SEGFAULT);
    assert_eq!(state.core.gpr[9], 0);
    // The fault is deferred; the block still reaches its exit jump.
    assert_eq!(next, 0x8000_0020);
}

struct SilentMmio;

impl MmioOps for SilentMmio {
    fn sb(&mut self, _: &mut CoreState, _: Opcode, _: u32, _: u8) {}
    fn sh(&mut self, _: &mut CoreState, _: Opcode, _: u32, _: u16) {}
    fn sw(&mut self, _: &mut CoreState, _: Opcode, _: u32, _: u32) {}
    fn lb(&mut self, _: &mut CoreState, _: Opcode, _: u32) -> u8 {
        0
    }
    fn lh(&mut self, _: &mut CoreState, _: Opcode, _: u32) -> u16 {
        0
    }
    fn lw(&mut self, _: &mut CoreState, _: Opcode, _: u32) -> u32 {
        0
    }
}

#[test]
fn segfault_through_the_engine_path() {
    // An MMIO region in the map forces plain loads through the
    // load/store engine instead of the direct fast path.
    let mut ram = Ram::new();
    ram.write_program(
        0,
        &[
            lui(8, 0xDEAD),
            ori(8, 8, 0xBEEF),
            lw(9, 8, 0),
            j(0x8000_0020),
            NOP,
        ],
    );
    let regions = vec![
        ram.region(),
        MemRegion::mmio(0xBF80_1000, 0x100, Box::new(SilentMmio)),
    ];
    let mut state = State::new(regions, Box::new(NullCop)).expect("state init");

    let next = state.execute(KSEG0_BASE);

    assert!(state.core.stop);
    assert_eq!(state.core.exit_flags, EXIT_SEGFAULT);
    assert_eq!(state.core.gpr[9], 0);
    assert_eq!(next, 0x8000_0020);
}

#[derive(Default)]
struct DeviceLog {
    stores: Vec<(u32, u32)>,
}

struct RecordingMmio {
    log: Rc<RefCell<DeviceLog>>,
}

impl MmioOps for RecordingMmio {
    fn sb(&mut self, _: &mut CoreState, _: Opcode, addr: u32, value: u8) {
        self.log.borrow_mut().stores.push((addr, value as u32));
    }
    fn sh(&mut self, _: &mut CoreState, _: Opcode, addr: u32, value: u16) {
        self.log.borrow_mut().stores.push((addr, value as u32));
    }
    fn sw(&mut self, _: &mut CoreState, _: Opcode, addr: u32, value: u32) {
        self.log.borrow_mut().stores.push((addr, value));
    }
    fn lb(&mut self, _: &mut CoreState, _: Opcode, _: u32) -> u8 {
        0
    }
    fn lh(&mut self, _: &mut CoreState, _: Opcode, _: u32) -> u16 {
        0
    }
    fn lw(&mut self, _: &mut CoreState, _: Opcode, addr: u32) -> u32 {
        0xCAFE_0000 | (addr & 0xFFFF)
    }
}

#[test]
fn mmio_store_and_load_through_executed_code() {
    let mut ram = Ram::new();
    ram.write_program(
        0,
        &[
            lui(8, 0xBF80),
            ori(8, 8, 0x1000),
            lui(9, 0x1234),
            ori(9, 9, 0x5678),
            sw(9, 8, 8),
            lw(10, 8, 4),
            j(0x8000_0030),
            NOP,
        ],
    );
    let log = Rc::new(RefCell::new(DeviceLog::default()));
    let regions = vec![
        ram.region(),
        MemRegion::mmio(0xBF80_1000, 0x100, Box::new(RecordingMmio { log: log.clone() })),
    ];
    let mut state = State::new(regions, Box::new(NullCop)).expect("state init");

    state.execute(KSEG0_BASE);

    assert_eq!(log.borrow().stores, vec![(0xBF80_1008, 0x1234_5678)]);
    assert_eq!(state.core.gpr[10], 0xCAFE_1004);
    assert!(!state.core.stop);
}

#[test]
fn patched_code_is_reported_stale_and_recompiles() {
    let mut ram = Ram::new();
    ram.write_program(0, &[addiu(8, 0, 1), j(0x8000_0010), NOP]);
    let mut state = state_over(&mut ram);

    state.execute(KSEG0_BASE);
    assert_eq!(state.core.gpr[8], 1);
    assert!(!state.cache().find(KSEG0_BASE).unwrap().is_outdated());

    ram.set_word(0, addiu(8, 0, 2));
    assert!(state.cache().find(KSEG0_BASE).unwrap().is_outdated());

    // Embedder protocol: unregister, drop, re-execute.
    drop(state.cache_mut().unregister(KSEG0_BASE).unwrap());
    state.execute(KSEG0_BASE);
    assert_eq!(state.core.gpr[8], 2);
    assert_eq!(state.stats().blocks_compiled, 2);
}

#[test]
fn syscall_exits_with_its_own_flag() {
    let mut ram = Ram::new();
    ram.write_program(0, &[addiu(8, 0, 1), SYSCALL]);
    let mut state = state_over(&mut ram);

    let next = state.execute(KSEG0_BASE);

    assert_eq!(state.core.exit_flags, EXIT_SYSCALL);
    assert_eq!(next, 0x8000_0004);
    assert!(!state.core.stop);
    assert_eq!(state.core.block_exit_cycles, 8);
}

#[derive(Default)]
struct CopLog {
    reads: Vec<usize>,
    writes: Vec<(usize, u32)>,
}

struct RecordingCop {
    log: Rc<RefCell<CopLog>>,
}

impl CopOps for RecordingCop {
    fn mfc(&mut self, _: &mut CoreState, opcode: Opcode) -> u32 {
        self.log.borrow_mut().reads.push(opcode.rd());
        0x1234_5678
    }
    fn cfc(&mut self, _: &mut CoreState, _: Opcode) -> u32 {
        0
    }
    fn mtc(&mut self, _: &mut CoreState, opcode: Opcode, value: u32) {
        self.log.borrow_mut().writes.push((opcode.rd(), value));
    }
    fn ctc(&mut self, _: &mut CoreState, _: Opcode, _: u32) {}
    fn op(&mut self, _: &mut CoreState, _: Opcode) {}
}

#[test]
fn coprocessor_moves_dispatch_to_the_table() {
    let mut ram = Ram::new();
    ram.write_program(
        0,
        &[mfc0(9, 12), mtc0(9, 13), j(0x8000_0020), NOP],
    );
    let log = Rc::new(RefCell::new(CopLog::default()));
    let mut state = State::new(
        vec![ram.region()],
        Box::new(RecordingCop { log: log.clone() }),
    )
    .expect("state init");

    state.execute(KSEG0_BASE);

    assert_eq!(state.core.gpr[9], 0x1234_5678);
    assert_eq!(log.borrow().reads, vec![12]);
    assert_eq!(log.borrow().writes, vec![(13, 0x1234_5678)]);
}

#[test]
fn recompiling_an_unmapped_pc_fails_cleanly() {
    let mut ram = Ram::new();
    let mut state = state_over(&mut ram);

    let err = state.recompile_block(0x1F00_0000).unwrap_err();
    assert!(matches!(
        err,
        psx_dynarec::CompileError::UnmappedPc { pc: 0x1F00_0000 }
    ));

    // The executor surfaces the failure as an unchanged PC.
    assert_eq!(state.execute(0x1F00_0000), 0x1F00_0000);
    assert_eq!(state.stats().compile_failures, 1);
}
