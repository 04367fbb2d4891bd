use std::mem::offset_of;

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, AbiParam, FuncRef, InstBuilder, MemFlags, Type, Value};
use cranelift_codegen::isa::OwnedTargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, Linkage, Module};

use crate::disasm::{cycles_of, Opcode, Prim, RegImm, Special};
use crate::{CompileError, RawMapEntry, State, EXIT_BREAK, EXIT_SYSCALL};

pub(crate) mod regcache;

use self::regcache::{RegCache, REG_HI, REG_LO};

/// Load/store dispatcher signature as seen from generated code.
pub(crate) type RwFn = unsafe extern "C" fn(*mut State, u32, u32, u32) -> u32;
/// Wrapper trampoline signature: (state, block entry).
pub(crate) type WrapperFn = unsafe extern "C" fn(*mut State, *const u8);

/// One generated native artefact: a guest block, the wrapper or the
/// address-lookup stub. Owns the executable buffer through its module.
pub(crate) struct EmittedCode {
    module: Option<JITModule>,
    entry: *const u8,
}

impl EmittedCode {
    pub(crate) fn entry(&self) -> *const u8 {
        self.entry
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            module: None,
            entry: std::ptr::null(),
        }
    }
}

impl Drop for EmittedCode {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: the owner (block or state) is going away, and with
            // it every pointer into this module's code.
            unsafe { module.free_memory() };
        }
    }
}

fn backend(err: impl std::fmt::Display) -> CompileError {
    CompileError::Backend(err.to_string())
}

pub(crate) fn build_isa() -> Result<OwnedTargetIsa, CompileError> {
    let mut flag_builder = settings::builder();
    flag_builder.set("opt_level", "speed").map_err(backend)?;
    let flags = settings::Flags::new(flag_builder);
    let isa_builder = cranelift_native::builder().map_err(backend)?;
    isa_builder.finish(flags).map_err(backend)
}

pub(crate) fn rw_dispatcher() -> RwFn {
    rw_shim
}

/// Offset of a cached guest register inside `State`. Indices 0..31 are
/// the GPRs, `REG_HI`/`REG_LO` the multiply unit.
pub(crate) fn reg_offset(idx: usize) -> i32 {
    let field = match idx {
        REG_HI => offset_of!(crate::CoreState, hi),
        REG_LO => offset_of!(crate::CoreState, lo),
        _ => offset_of!(crate::CoreState, gpr) + idx * 4,
    };
    (offset_of!(State, core) + field) as i32
}

fn next_pc_offset() -> i32 {
    (offset_of!(State, core) + offset_of!(crate::CoreState, next_pc)) as i32
}

fn exit_flags_offset() -> i32 {
    (offset_of!(State, core) + offset_of!(crate::CoreState, exit_flags)) as i32
}

fn exit_cycles_offset() -> i32 {
    (offset_of!(State, core) + offset_of!(crate::CoreState, block_exit_cycles)) as i32
}

// Shims bridging generated code back into Rust. Generated code passes
// the state pointer it was entered with, so dereferencing it is sound
// for the duration of the call.

unsafe extern "C" fn rw_shim(state: *mut State, raw: u32, base: u32, data: u32) -> u32 {
    // SAFETY: see module comment above.
    let state = unsafe { &mut *state };
    crate::mem::rw(state, Opcode(raw), base, data)
}

unsafe extern "C" fn segfault_shim(state: *mut State, addr: u32) {
    // SAFETY: see module comment above.
    let state = unsafe { &mut *state };
    crate::mem::segfault(&mut state.core, addr);
}

unsafe extern "C" fn cop_mfc_shim(state: *mut State, raw: u32) -> u32 {
    // SAFETY: see module comment above.
    let state = unsafe { &mut *state };
    let State { core, cop, .. } = state;
    cop.mfc(core, Opcode(raw))
}

unsafe extern "C" fn cop_cfc_shim(state: *mut State, raw: u32) -> u32 {
    // SAFETY: see module comment above.
    let state = unsafe { &mut *state };
    let State { core, cop, .. } = state;
    cop.cfc(core, Opcode(raw))
}

unsafe extern "C" fn cop_mtc_shim(state: *mut State, raw: u32, value: u32) {
    // SAFETY: see module comment above.
    let state = unsafe { &mut *state };
    let State { core, cop, .. } = state;
    cop.mtc(core, Opcode(raw), value);
}

unsafe extern "C" fn cop_ctc_shim(state: *mut State, raw: u32, value: u32) {
    // SAFETY: see module comment above.
    let state = unsafe { &mut *state };
    let State { core, cop, .. } = state;
    cop.ctc(core, Opcode(raw), value);
}

unsafe extern "C" fn cop_op_shim(state: *mut State, raw: u32) {
    // SAFETY: see module comment above.
    let state = unsafe { &mut *state };
    let State { core, cop, .. } = state;
    cop.op(core, Opcode(raw));
}

fn finish_module(
    mut module: JITModule,
    mut ctx: cranelift_codegen::Context,
    name: &str,
) -> Result<EmittedCode, CompileError> {
    let func_id = module
        .declare_function(name, Linkage::Export, &ctx.func.signature)
        .map_err(backend)?;
    module.define_function(func_id, &mut ctx).map_err(backend)?;
    module.clear_context(&mut ctx);
    module.finalize_definitions().map_err(backend)?;
    let entry = module.get_finalized_function(func_id);
    Ok(EmittedCode {
        module: Some(module),
        entry,
    })
}

fn state_flags() -> MemFlags {
    let mut flags = MemFlags::new();
    flags.set_notrap();
    flags.set_aligned();
    flags
}

fn extend_to_ptr(builder: &mut FunctionBuilder<'_>, ptr_ty: Type, value: Value) -> Value {
    if ptr_ty == types::I64 {
        builder.ins().uextend(types::I64, value)
    } else {
        value
    }
}

/// Generate the entry/exit trampoline: `(state, block_entry)`. It moves
/// the state pointer into the block's argument register and transfers
/// in; the block's single return path lands back here and falls out to
/// the embedder.
pub(crate) fn generate_wrapper(isa: &OwnedTargetIsa) -> Result<EmittedCode, CompileError> {
    let jit_builder = JITBuilder::with_isa(isa.clone(), default_libcall_names());
    let mut module = JITModule::new(jit_builder);
    let ptr_ty = module.target_config().pointer_type();

    let mut block_sig = module.make_signature();
    block_sig.params.push(AbiParam::new(ptr_ty));

    let mut ctx = module.make_context();
    ctx.func.signature.params.push(AbiParam::new(ptr_ty));
    ctx.func.signature.params.push(AbiParam::new(ptr_ty));

    let mut fb_ctx = FunctionBuilderContext::new();
    let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);

    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    builder.seal_block(entry);

    let state = builder.block_params(entry)[0];
    let target = builder.block_params(entry)[1];
    let sig_ref = builder.import_signature(block_sig);
    builder.ins().call_indirect(sig_ref, target, &[state]);
    builder.ins().return_(&[]);
    builder.finalize();

    finish_module(module, ctx, "psx_jit_wrapper")
}

/// Generate the native fast path for direct-memory address resolution:
/// `(state, kunseg_addr, bus_addr) -> host_ptr`. Scans the flattened map
/// from the highest-indexed entry down; on a miss it reports the
/// segfault with the address as issued on the bus and returns null.
pub(crate) fn generate_address_lookup(isa: &OwnedTargetIsa) -> Result<EmittedCode, CompileError> {
    let mut jit_builder = JITBuilder::with_isa(isa.clone(), default_libcall_names());
    jit_builder.symbol("psx_jit_segfault", segfault_shim as *const u8);
    let mut module = JITModule::new(jit_builder);
    let ptr_ty = module.target_config().pointer_type();

    let mut segfault_sig = module.make_signature();
    segfault_sig.params.push(AbiParam::new(ptr_ty));
    segfault_sig.params.push(AbiParam::new(types::I32));
    let segfault_id = module
        .declare_function("psx_jit_segfault", Linkage::Import, &segfault_sig)
        .map_err(backend)?;

    let mut ctx = module.make_context();
    ctx.func.signature.params.push(AbiParam::new(ptr_ty));
    ctx.func.signature.params.push(AbiParam::new(types::I32));
    ctx.func.signature.params.push(AbiParam::new(types::I32));
    ctx.func.signature.returns.push(AbiParam::new(ptr_ty));

    let mut fb_ctx = FunctionBuilderContext::new();
    let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);
    let segfault_ref = module.declare_func_in_func(segfault_id, builder.func);

    let flags = state_flags();
    let entry_size = std::mem::size_of::<RawMapEntry>() as i64;
    let base_off = offset_of!(RawMapEntry, base) as i32;
    let length_off = offset_of!(RawMapEntry, length) as i32;
    let host_off = offset_of!(RawMapEntry, host) as i32;

    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    let scan = builder.create_block();
    builder.append_block_param(scan, ptr_ty);
    let check = builder.create_block();
    let advance = builder.create_block();
    builder.append_block_param(advance, ptr_ty);
    let hit = builder.create_block();
    builder.append_block_param(hit, ptr_ty);
    builder.append_block_param(hit, types::I32);
    let miss = builder.create_block();

    builder.switch_to_block(entry);
    let state = builder.block_params(entry)[0];
    let kaddr = builder.block_params(entry)[1];
    let bus_addr = builder.block_params(entry)[2];
    let map = builder
        .ins()
        .load(ptr_ty, flags, state, offset_of!(State, raw_map_ptr) as i32);
    let len = builder
        .ins()
        .load(types::I32, flags, state, offset_of!(State, raw_map_len) as i32);
    let empty = builder.ins().icmp_imm(IntCC::Equal, len, 0);
    let len_ext = extend_to_ptr(&mut builder, ptr_ty, len);
    let last_index = builder.ins().iadd_imm(len_ext, -1);
    let stride = builder.ins().imul_imm(last_index, entry_size);
    let start = builder.ins().iadd(map, stride);
    let start_args = [start.into()];
    builder.ins().brif(empty, miss, &[], scan, &start_args);

    builder.switch_to_block(scan);
    let cur = builder.block_params(scan)[0];
    let region_base = builder.ins().load(types::I32, flags, cur, base_off);
    let below = builder
        .ins()
        .icmp(IntCC::UnsignedLessThan, kaddr, region_base);
    let cur_args = [cur.into()];
    builder.ins().brif(below, advance, &cur_args, check, &[]);

    builder.switch_to_block(check);
    let offset = builder.ins().isub(kaddr, region_base);
    let region_len = builder.ins().load(types::I32, flags, cur, length_off);
    let beyond = builder
        .ins()
        .icmp(IntCC::UnsignedGreaterThanOrEqual, offset, region_len);
    let hit_args = [cur.into(), offset.into()];
    builder.ins().brif(beyond, advance, &cur_args, hit, &hit_args);

    builder.switch_to_block(advance);
    let done_cur = builder.block_params(advance)[0];
    let prev = builder.ins().iadd_imm(done_cur, -entry_size);
    let exhausted = builder.ins().icmp(IntCC::UnsignedLessThan, prev, map);
    let prev_args = [prev.into()];
    builder.ins().brif(exhausted, miss, &[], scan, &prev_args);

    builder.switch_to_block(hit);
    let hit_cur = builder.block_params(hit)[0];
    let hit_offset = builder.block_params(hit)[1];
    let host = builder.ins().load(ptr_ty, flags, hit_cur, host_off);
    let offset_ext = extend_to_ptr(&mut builder, ptr_ty, hit_offset);
    let result = builder.ins().iadd(host, offset_ext);
    builder.ins().return_(&[result]);

    builder.switch_to_block(miss);
    builder.ins().call(segfault_ref, &[state, bus_addr]);
    let null = builder.ins().iconst(ptr_ty, 0);
    builder.ins().return_(&[null]);

    builder.seal_all_blocks();
    builder.finalize();

    finish_module(module, ctx, "psx_jit_addr_lookup")
}

/// Per-block compilation inputs drawn from the state.
pub(crate) struct EmitCtx {
    pub isa: OwnedTargetIsa,
    pub lookup_entry: *const u8,
    pub has_mmio: bool,
    pub rw: RwFn,
}

/// Result of emitting one opcode, driving the delay-slot fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EmitOutcome {
    Emitted,
    SkipDelaySlot,
}

#[derive(Clone, Copy)]
struct Helpers {
    rw: FuncRef,
    lookup: FuncRef,
    cop_mfc: FuncRef,
    cop_cfc: FuncRef,
    cop_mtc: FuncRef,
    cop_ctc: FuncRef,
    cop_op: FuncRef,
}

/// Compile the disassembled opcode list into a native block function.
/// Returns the executable artefact and the block's cycle total.
pub(crate) fn compile_block(
    ctx: &EmitCtx,
    regs: &mut RegCache,
    pc: u32,
    ops: &[Opcode],
) -> Result<(EmittedCode, u32), CompileError> {
    regs.reset();

    let mut jit_builder = JITBuilder::with_isa(ctx.isa.clone(), default_libcall_names());
    jit_builder.symbol("psx_jit_rw", ctx.rw as *const u8);
    jit_builder.symbol("psx_jit_addr_lookup", ctx.lookup_entry);
    jit_builder.symbol("psx_jit_cop_mfc", cop_mfc_shim as *const u8);
    jit_builder.symbol("psx_jit_cop_cfc", cop_cfc_shim as *const u8);
    jit_builder.symbol("psx_jit_cop_mtc", cop_mtc_shim as *const u8);
    jit_builder.symbol("psx_jit_cop_ctc", cop_ctc_shim as *const u8);
    jit_builder.symbol("psx_jit_cop_op", cop_op_shim as *const u8);
    let mut module = JITModule::new(jit_builder);
    let ptr_ty = module.target_config().pointer_type();

    let mut rw_sig = module.make_signature();
    rw_sig.params.push(AbiParam::new(ptr_ty));
    rw_sig.params.push(AbiParam::new(types::I32));
    rw_sig.params.push(AbiParam::new(types::I32));
    rw_sig.params.push(AbiParam::new(types::I32));
    rw_sig.returns.push(AbiParam::new(types::I32));
    let rw_id = module
        .declare_function("psx_jit_rw", Linkage::Import, &rw_sig)
        .map_err(backend)?;

    let mut lookup_sig = module.make_signature();
    lookup_sig.params.push(AbiParam::new(ptr_ty));
    lookup_sig.params.push(AbiParam::new(types::I32));
    lookup_sig.params.push(AbiParam::new(types::I32));
    lookup_sig.returns.push(AbiParam::new(ptr_ty));
    let lookup_id = module
        .declare_function("psx_jit_addr_lookup", Linkage::Import, &lookup_sig)
        .map_err(backend)?;

    let mut cop_read_sig = module.make_signature();
    cop_read_sig.params.push(AbiParam::new(ptr_ty));
    cop_read_sig.params.push(AbiParam::new(types::I32));
    cop_read_sig.returns.push(AbiParam::new(types::I32));
    let cop_mfc_id = module
        .declare_function("psx_jit_cop_mfc", Linkage::Import, &cop_read_sig)
        .map_err(backend)?;
    let cop_cfc_id = module
        .declare_function("psx_jit_cop_cfc", Linkage::Import, &cop_read_sig)
        .map_err(backend)?;

    let mut cop_write_sig = module.make_signature();
    cop_write_sig.params.push(AbiParam::new(ptr_ty));
    cop_write_sig.params.push(AbiParam::new(types::I32));
    cop_write_sig.params.push(AbiParam::new(types::I32));
    let cop_mtc_id = module
        .declare_function("psx_jit_cop_mtc", Linkage::Import, &cop_write_sig)
        .map_err(backend)?;
    let cop_ctc_id = module
        .declare_function("psx_jit_cop_ctc", Linkage::Import, &cop_write_sig)
        .map_err(backend)?;

    let mut cop_op_sig = module.make_signature();
    cop_op_sig.params.push(AbiParam::new(ptr_ty));
    cop_op_sig.params.push(AbiParam::new(types::I32));
    let cop_op_id = module
        .declare_function("psx_jit_cop_op", Linkage::Import, &cop_op_sig)
        .map_err(backend)?;

    let mut cl_ctx = module.make_context();
    cl_ctx.func.signature.params.push(AbiParam::new(ptr_ty));

    let mut fb_ctx = FunctionBuilderContext::new();
    let mut builder = FunctionBuilder::new(&mut cl_ctx.func, &mut fb_ctx);

    let helpers = Helpers {
        rw: module.declare_func_in_func(rw_id, builder.func),
        lookup: module.declare_func_in_func(lookup_id, builder.func),
        cop_mfc: module.declare_func_in_func(cop_mfc_id, builder.func),
        cop_cfc: module.declare_func_in_func(cop_cfc_id, builder.func),
        cop_mtc: module.declare_func_in_func(cop_mtc_id, builder.func),
        cop_ctc: module.declare_func_in_func(cop_ctc_id, builder.func),
        cop_op: module.declare_func_in_func(cop_op_id, builder.func),
    };

    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    let state_ptr = builder.block_params(entry)[0];
    let exit_block = builder.create_block();

    let mut data_flags = MemFlags::new();
    data_flags.set_notrap();

    let mut asm = Assembler {
        builder,
        regs,
        ops,
        state_ptr,
        exit_block,
        helpers,
        flags: state_flags(),
        data_flags,
        has_mmio: ctx.has_mmio,
        terminated: false,
    };

    let mut cycles: u32 = 0;
    let mut skip_next = false;
    for (i, &op) in ops.iter().enumerate() {
        let op_pc = pc.wrapping_add(i as u32 * 4);
        cycles = cycles.wrapping_add(cycles_of(op));

        if skip_next {
            skip_next = false;
            continue;
        }
        if asm.terminated {
            break;
        }
        if op.is_nop() {
            continue;
        }

        // A taken transfer leaves with its delay slot already executed,
        // so its exit cycle count includes the slot.
        let exit_cycles = match ops.get(i + 1) {
            Some(&delay) if op.has_delay_slot() => cycles.wrapping_add(cycles_of(delay)),
            _ => cycles,
        };

        let outcome = asm.rec_opcode(i, op_pc, exit_cycles);
        skip_next = outcome == EmitOutcome::SkipDelaySlot;
    }

    if !asm.terminated {
        let end_pc = pc.wrapping_add(ops.len() as u32 * 4);
        let target = asm.iconst32(end_pc);
        asm.end_of_block(target, cycles, None);
    }

    let mut builder = asm.builder;
    builder.switch_to_block(exit_block);
    builder.ins().return_(&[]);
    builder.seal_all_blocks();
    builder.finalize();

    let name = format!("psx_jit_block_{pc:08x}");
    let emitted = finish_module(module, cl_ctx, &name)?;
    Ok((emitted, cycles))
}

fn is_load(op: Opcode) -> bool {
    matches!(
        op.prim(),
        Prim::Lb | Prim::Lbu | Prim::Lh | Prim::Lhu | Prim::Lw | Prim::Lwl | Prim::Lwr
    )
}

struct Assembler<'a, 'r> {
    builder: FunctionBuilder<'a>,
    regs: &'r mut RegCache,
    ops: &'r [Opcode],
    state_ptr: Value,
    exit_block: cranelift_codegen::ir::Block,
    helpers: Helpers,
    flags: MemFlags,
    data_flags: MemFlags,
    has_mmio: bool,
    terminated: bool,
}

impl Assembler<'_, '_> {
    fn get(&mut self, idx: usize) -> Value {
        self.regs
            .get(&mut self.builder, self.state_ptr, self.flags, idx)
    }

    fn set(&mut self, idx: usize, value: Value) {
        self.regs.set(idx, value);
    }

    fn iconst32(&mut self, value: u32) -> Value {
        self.builder.ins().iconst(types::I32, value as i32 as i64)
    }

    fn flush(&mut self) {
        self.regs
            .flush(&mut self.builder, self.state_ptr, self.flags);
    }

    /// Store the exit state and jump to the block's shared return path.
    fn end_of_block(&mut self, next_pc: Value, cycles: u32, flag: Option<u32>) {
        self.flush();
        self.builder
            .ins()
            .store(self.flags, next_pc, self.state_ptr, next_pc_offset());
        let cycle_count = self.iconst32(cycles);
        self.builder
            .ins()
            .store(self.flags, cycle_count, self.state_ptr, exit_cycles_offset());
        if let Some(flag) = flag {
            let flag = self.iconst32(flag);
            self.builder
                .ins()
                .store(self.flags, flag, self.state_ptr, exit_flags_offset());
        }
        self.builder.ins().jump(self.exit_block, &[]);
    }

    fn rec_opcode(&mut self, i: usize, pc: u32, exit_cycles: u32) -> EmitOutcome {
        let op = self.ops[i];
        match op.prim() {
            Prim::Special => self.rec_special(i, pc, exit_cycles),
            Prim::RegImm => self.rec_regimm(i, pc, exit_cycles),
            Prim::J => self.rec_jump(i, pc, exit_cycles, false),
            Prim::Jal => self.rec_jump(i, pc, exit_cycles, true),
            Prim::Beq | Prim::Bne | Prim::Blez | Prim::Bgtz => {
                self.rec_branch(i, pc, exit_cycles)
            }
            Prim::Addi | Prim::Addiu => {
                let lhs = self.get(op.rs());
                let sum = self.builder.ins().iadd_imm(lhs, op.simm() as i64);
                self.set(op.rt(), sum);
                EmitOutcome::Emitted
            }
            Prim::Slti => {
                let lhs = self.get(op.rs());
                let cmp =
                    self.builder
                        .ins()
                        .icmp_imm(IntCC::SignedLessThan, lhs, op.simm() as i64);
                let result = self.builder.ins().uextend(types::I32, cmp);
                self.set(op.rt(), result);
                EmitOutcome::Emitted
            }
            Prim::Sltiu => {
                let lhs = self.get(op.rs());
                // The immediate is sign-extended first, compared unsigned.
                let cmp = self.builder.ins().icmp_imm(
                    IntCC::UnsignedLessThan,
                    lhs,
                    op.simm() as i64,
                );
                let result = self.builder.ins().uextend(types::I32, cmp);
                self.set(op.rt(), result);
                EmitOutcome::Emitted
            }
            Prim::Andi => {
                let lhs = self.get(op.rs());
                let result = self.builder.ins().band_imm(lhs, op.imm() as i64);
                self.set(op.rt(), result);
                EmitOutcome::Emitted
            }
            Prim::Ori => {
                let lhs = self.get(op.rs());
                let result = self.builder.ins().bor_imm(lhs, op.imm() as i64);
                self.set(op.rt(), result);
                EmitOutcome::Emitted
            }
            Prim::Xori => {
                let lhs = self.get(op.rs());
                let result = self.builder.ins().bxor_imm(lhs, op.imm() as i64);
                self.set(op.rt(), result);
                EmitOutcome::Emitted
            }
            Prim::Lui => {
                let value = self.iconst32((op.imm() as u32) << 16);
                self.set(op.rt(), value);
                EmitOutcome::Emitted
            }
            Prim::Cop0 | Prim::Cop2 => {
                self.rec_cop(op, pc);
                EmitOutcome::Emitted
            }
            Prim::Lb
            | Prim::Lbu
            | Prim::Lh
            | Prim::Lhu
            | Prim::Lw
            | Prim::Lwl
            | Prim::Lwr
            | Prim::Sb
            | Prim::Sh
            | Prim::Sw
            | Prim::Swl
            | Prim::Swr => {
                self.rec_mem(op);
                EmitOutcome::Emitted
            }
            Prim::Unknown => {
                log::warn!("Unsupported opcode {op} at PC {pc:#010x}, emitting as NOP");
                EmitOutcome::Emitted
            }
        }
    }

    fn rec_special(&mut self, i: usize, pc: u32, exit_cycles: u32) -> EmitOutcome {
        let op = self.ops[i];
        match op.special() {
            Special::Sll => {
                let value = self.get(op.rt());
                let result = self.builder.ins().ishl_imm(value, op.sa() as i64);
                self.set(op.rd(), result);
            }
            Special::Srl => {
                let value = self.get(op.rt());
                let result = self.builder.ins().ushr_imm(value, op.sa() as i64);
                self.set(op.rd(), result);
            }
            Special::Sra => {
                let value = self.get(op.rt());
                let result = self.builder.ins().sshr_imm(value, op.sa() as i64);
                self.set(op.rd(), result);
            }
            Special::Sllv | Special::Srlv | Special::Srav => {
                let amount = self.get(op.rs());
                let amount = self.builder.ins().band_imm(amount, 0x1F);
                let value = self.get(op.rt());
                let result = match op.special() {
                    Special::Sllv => self.builder.ins().ishl(value, amount),
                    Special::Srlv => self.builder.ins().ushr(value, amount),
                    _ => self.builder.ins().sshr(value, amount),
                };
                self.set(op.rd(), result);
            }
            Special::Jr => {
                // The jump register is sampled before the delay slot runs.
                let target = self.get(op.rs());
                self.rec_delay_slot(i, pc);
                self.end_of_block(target, exit_cycles, None);
                self.terminated = true;
                return EmitOutcome::SkipDelaySlot;
            }
            Special::Jalr => {
                let target = self.get(op.rs());
                let link = self.iconst32(pc.wrapping_add(8));
                self.set(op.rd(), link);
                self.rec_delay_slot(i, pc);
                self.end_of_block(target, exit_cycles, None);
                self.terminated = true;
                return EmitOutcome::SkipDelaySlot;
            }
            Special::Syscall => {
                let target = self.iconst32(pc);
                self.end_of_block(target, exit_cycles, Some(EXIT_SYSCALL));
                self.terminated = true;
            }
            Special::Break => {
                let target = self.iconst32(pc);
                self.end_of_block(target, exit_cycles, Some(EXIT_BREAK));
                self.terminated = true;
            }
            Special::Mfhi => {
                let value = self.get(REG_HI);
                self.set(op.rd(), value);
            }
            Special::Mflo => {
                let value = self.get(REG_LO);
                self.set(op.rd(), value);
            }
            Special::Mthi => {
                let value = self.get(op.rs());
                self.set(REG_HI, value);
            }
            Special::Mtlo => {
                let value = self.get(op.rs());
                self.set(REG_LO, value);
            }
            Special::Mult | Special::Multu => self.rec_mult(op),
            Special::Div | Special::Divu => self.rec_div(op),
            Special::Add | Special::Addu => {
                let lhs = self.get(op.rs());
                let rhs = self.get(op.rt());
                let result = self.builder.ins().iadd(lhs, rhs);
                self.set(op.rd(), result);
            }
            Special::Sub | Special::Subu => {
                let lhs = self.get(op.rs());
                let rhs = self.get(op.rt());
                let result = self.builder.ins().isub(lhs, rhs);
                self.set(op.rd(), result);
            }
            Special::And => {
                let lhs = self.get(op.rs());
                let rhs = self.get(op.rt());
                let result = self.builder.ins().band(lhs, rhs);
                self.set(op.rd(), result);
            }
            Special::Or => {
                let lhs = self.get(op.rs());
                let rhs = self.get(op.rt());
                let result = self.builder.ins().bor(lhs, rhs);
                self.set(op.rd(), result);
            }
            Special::Xor => {
                let lhs = self.get(op.rs());
                let rhs = self.get(op.rt());
                let result = self.builder.ins().bxor(lhs, rhs);
                self.set(op.rd(), result);
            }
            Special::Nor => {
                let lhs = self.get(op.rs());
                let rhs = self.get(op.rt());
                let or = self.builder.ins().bor(lhs, rhs);
                let result = self.builder.ins().bnot(or);
                self.set(op.rd(), result);
            }
            Special::Slt => {
                let lhs = self.get(op.rs());
                let rhs = self.get(op.rt());
                let cmp = self.builder.ins().icmp(IntCC::SignedLessThan, lhs, rhs);
                let result = self.builder.ins().uextend(types::I32, cmp);
                self.set(op.rd(), result);
            }
            Special::Sltu => {
                let lhs = self.get(op.rs());
                let rhs = self.get(op.rt());
                let cmp = self.builder.ins().icmp(IntCC::UnsignedLessThan, lhs, rhs);
                let result = self.builder.ins().uextend(types::I32, cmp);
                self.set(op.rd(), result);
            }
            Special::Unknown => {
                log::warn!("Unsupported opcode {op} at PC {pc:#010x}, emitting as NOP");
            }
        }
        EmitOutcome::Emitted
    }

    fn rec_regimm(&mut self, i: usize, pc: u32, exit_cycles: u32) -> EmitOutcome {
        let op = self.ops[i];
        let rs = self.get(op.rs());
        let cond = match op.regimm() {
            RegImm::Bltz | RegImm::Bltzal => {
                self.builder.ins().icmp_imm(IntCC::SignedLessThan, rs, 0)
            }
            RegImm::Bgez | RegImm::Bgezal => {
                self.builder
                    .ins()
                    .icmp_imm(IntCC::SignedGreaterThanOrEqual, rs, 0)
            }
            RegImm::Unknown => {
                log::warn!("Unsupported opcode {op} at PC {pc:#010x}, emitting as NOP");
                return EmitOutcome::Emitted;
            }
        };
        if matches!(op.regimm(), RegImm::Bltzal | RegImm::Bgezal) {
            // The return address is written whether or not the branch is
            // taken.
            let link = self.iconst32(pc.wrapping_add(8));
            self.set(31, link);
        }
        self.branch_exit(cond, i, pc, exit_cycles);
        EmitOutcome::SkipDelaySlot
    }

    fn rec_branch(&mut self, i: usize, pc: u32, exit_cycles: u32) -> EmitOutcome {
        let op = self.ops[i];
        let cond = match op.prim() {
            Prim::Beq => {
                let lhs = self.get(op.rs());
                let rhs = self.get(op.rt());
                self.builder.ins().icmp(IntCC::Equal, lhs, rhs)
            }
            Prim::Bne => {
                let lhs = self.get(op.rs());
                let rhs = self.get(op.rt());
                self.builder.ins().icmp(IntCC::NotEqual, lhs, rhs)
            }
            Prim::Blez => {
                let lhs = self.get(op.rs());
                self.builder
                    .ins()
                    .icmp_imm(IntCC::SignedLessThanOrEqual, lhs, 0)
            }
            _ => {
                let lhs = self.get(op.rs());
                self.builder
                    .ins()
                    .icmp_imm(IntCC::SignedGreaterThan, lhs, 0)
            }
        };
        self.branch_exit(cond, i, pc, exit_cycles);
        EmitOutcome::SkipDelaySlot
    }

    /// Shared tail of every conditional branch: run the delay slot, then
    /// either leave for the branch target or fall through in-block.
    fn branch_exit(&mut self, cond: Value, i: usize, pc: u32, exit_cycles: u32) {
        let op = self.ops[i];
        let target = pc
            .wrapping_add(4)
            .wrapping_add((op.simm() as i32 as u32) << 2);

        self.rec_delay_slot(i, pc);

        let taken = self.builder.create_block();
        let fallthrough = self.builder.create_block();
        self.builder.ins().brif(cond, taken, &[], fallthrough, &[]);

        self.builder.switch_to_block(taken);
        let target = self.iconst32(target);
        self.end_of_block(target, exit_cycles, None);

        self.builder.switch_to_block(fallthrough);
    }

    fn rec_jump(&mut self, i: usize, pc: u32, exit_cycles: u32, link: bool) -> EmitOutcome {
        let op = self.ops[i];
        let target = (pc.wrapping_add(4) & 0xF000_0000) | (op.target() << 2);
        if link {
            let link_value = self.iconst32(pc.wrapping_add(8));
            self.set(31, link_value);
        }
        self.rec_delay_slot(i, pc);
        let target = self.iconst32(target);
        self.end_of_block(target, exit_cycles, None);
        self.terminated = true;
        EmitOutcome::SkipDelaySlot
    }

    /// Fold the delay slot of the transfer at index `i` into the current
    /// emission point.
    fn rec_delay_slot(&mut self, i: usize, pc: u32) {
        let Some(&delay) = self.ops.get(i + 1) else {
            return;
        };
        if delay.is_nop() {
            return;
        }
        if delay.has_delay_slot()
            || (delay.prim() == Prim::Special
                && matches!(delay.special(), Special::Syscall | Special::Break))
        {
            log::warn!(
                "Control transfer in delay slot at PC {:#010x}, slot not folded",
                pc.wrapping_add(4)
            );
            return;
        }
        self.rec_opcode(i + 1, pc.wrapping_add(4), 0);
    }

    fn rec_mult(&mut self, op: Opcode) {
        let lhs = self.get(op.rs());
        let rhs = self.get(op.rt());
        let (lhs64, rhs64) = if op.special() == Special::Mult {
            (
                self.builder.ins().sextend(types::I64, lhs),
                self.builder.ins().sextend(types::I64, rhs),
            )
        } else {
            (
                self.builder.ins().uextend(types::I64, lhs),
                self.builder.ins().uextend(types::I64, rhs),
            )
        };
        let product = self.builder.ins().imul(lhs64, rhs64);
        let lo = self.builder.ins().ireduce(types::I32, product);
        let high_half = self.builder.ins().ushr_imm(product, 32);
        let hi = self.builder.ins().ireduce(types::I32, high_half);
        self.set(REG_LO, lo);
        self.set(REG_HI, hi);
    }

    /// Division with the R3000's defined results for division by zero
    /// and, for the signed form, the INT_MIN / -1 overflow, neither of
    /// which may reach the host divide instruction.
    fn rec_div(&mut self, op: Opcode) {
        let signed = op.special() == Special::Div;
        let num = self.get(op.rs());
        let den = self.get(op.rt());

        let zero_case = self.builder.create_block();
        let nonzero = self.builder.create_block();
        let done = self.builder.create_block();
        self.builder.append_block_param(done, types::I32);
        self.builder.append_block_param(done, types::I32);

        let den_zero = self.builder.ins().icmp_imm(IntCC::Equal, den, 0);
        self.builder
            .ins()
            .brif(den_zero, zero_case, &[], nonzero, &[]);

        self.builder.switch_to_block(zero_case);
        let lo = if signed {
            let negative = self.builder.ins().icmp_imm(IntCC::SignedLessThan, num, 0);
            let one = self.iconst32(1);
            let minus_one = self.iconst32(0xFFFF_FFFF);
            self.builder.ins().select(negative, one, minus_one)
        } else {
            self.iconst32(0xFFFF_FFFF)
        };
        let zero_args = [lo.into(), num.into()];
        self.builder.ins().jump(done, &zero_args);

        self.builder.switch_to_block(nonzero);
        if signed {
            let overflow_case = self.builder.create_block();
            let normal = self.builder.create_block();

            let int_min = self.iconst32(0x8000_0000);
            let num_is_min = self.builder.ins().icmp(IntCC::Equal, num, int_min);
            let minus_one = self.iconst32(0xFFFF_FFFF);
            let den_is_m1 = self.builder.ins().icmp(IntCC::Equal, den, minus_one);
            let overflow = self.builder.ins().band(num_is_min, den_is_m1);
            self.builder
                .ins()
                .brif(overflow, overflow_case, &[], normal, &[]);

            self.builder.switch_to_block(overflow_case);
            let zero = self.iconst32(0);
            let overflow_args = [int_min.into(), zero.into()];
            self.builder.ins().jump(done, &overflow_args);

            self.builder.switch_to_block(normal);
            let quotient = self.builder.ins().sdiv(num, den);
            let remainder = self.builder.ins().srem(num, den);
            let normal_args = [quotient.into(), remainder.into()];
            self.builder.ins().jump(done, &normal_args);
        } else {
            let quotient = self.builder.ins().udiv(num, den);
            let remainder = self.builder.ins().urem(num, den);
            let normal_args = [quotient.into(), remainder.into()];
            self.builder.ins().jump(done, &normal_args);
        }

        self.builder.switch_to_block(done);
        let lo = self.builder.block_params(done)[0];
        let hi = self.builder.block_params(done)[1];
        self.set(REG_LO, lo);
        self.set(REG_HI, hi);
    }

    fn rec_cop(&mut self, op: Opcode, pc: u32) {
        let raw = self.iconst32(op.raw());
        if op.raw() & 0x0200_0000 != 0 {
            // Coprocessor function, e.g. RFE or a GTE command.
            self.flush();
            self.builder
                .ins()
                .call(self.helpers.cop_op, &[self.state_ptr, raw]);
            self.regs.invalidate();
            return;
        }
        match op.rs() {
            0x00 | 0x02 => {
                let helper = if op.rs() == 0 {
                    self.helpers.cop_mfc
                } else {
                    self.helpers.cop_cfc
                };
                self.flush();
                let call = self.builder.ins().call(helper, &[self.state_ptr, raw]);
                let result = self.builder.inst_results(call)[0];
                self.regs.invalidate();
                self.set(op.rt(), result);
            }
            0x04 | 0x06 => {
                let helper = if op.rs() == 0x04 {
                    self.helpers.cop_mtc
                } else {
                    self.helpers.cop_ctc
                };
                let value = self.get(op.rt());
                self.flush();
                self.builder
                    .ins()
                    .call(helper, &[self.state_ptr, raw, value]);
                self.regs.invalidate();
            }
            _ => {
                log::warn!("Unsupported opcode {op} at PC {pc:#010x}, emitting as NOP");
            }
        }
    }

    fn rec_mem(&mut self, op: Opcode) {
        let complex = matches!(
            op.prim(),
            Prim::Swl | Prim::Swr | Prim::Lwl | Prim::Lwr
        );
        if self.has_mmio || complex {
            self.rec_mem_engine(op);
        } else {
            self.rec_mem_direct(op);
        }
    }

    /// Route the access through the load/store engine. Required whenever
    /// MMIO may be hit (handlers can touch the register file, so the
    /// cache is flushed around the call) and for the mis-aligned word
    /// forms.
    fn rec_mem_engine(&mut self, op: Opcode) {
        let base = self.get(op.rs());
        let data = self.get(op.rt());
        if self.has_mmio {
            self.flush();
        }
        let raw = self.iconst32(op.raw());
        let call = self
            .builder
            .ins()
            .call(self.helpers.rw, &[self.state_ptr, raw, base, data]);
        let result = self.builder.inst_results(call)[0];
        if self.has_mmio {
            self.regs.invalidate();
        }
        if is_load(op) {
            self.set(op.rt(), result);
        }
    }

    /// Direct-memory fast path: inline kunseg, resolve through the
    /// address-lookup stub, and access host memory. A null result means
    /// the stub already reported the segfault; the access is suppressed
    /// and loads read as zero.
    fn rec_mem_direct(&mut self, op: Opcode) {
        let base = self.get(op.rs());
        let addr = self.builder.ins().iadd_imm(base, op.simm() as i64);
        let kaddr = self.emit_kunseg(addr);
        let call = self
            .builder
            .ins()
            .call(self.helpers.lookup, &[self.state_ptr, kaddr, addr]);
        let host = self.builder.inst_results(call)[0];
        let missed = self.builder.ins().icmp_imm(IntCC::Equal, host, 0);

        let access = self.builder.create_block();
        if is_load(op) {
            let done = self.builder.create_block();
            self.builder.append_block_param(done, types::I32);

            let zero = self.iconst32(0);
            let miss_args = [zero.into()];
            self.builder.ins().brif(missed, done, &miss_args, access, &[]);

            self.builder.switch_to_block(access);
            let flags = self.data_flags;
            let value = match op.prim() {
                Prim::Lb => self.builder.ins().sload8(types::I32, flags, host, 0),
                Prim::Lbu => self.builder.ins().uload8(types::I32, flags, host, 0),
                Prim::Lh => self.builder.ins().sload16(types::I32, flags, host, 0),
                Prim::Lhu => self.builder.ins().uload16(types::I32, flags, host, 0),
                _ => self.builder.ins().load(types::I32, flags, host, 0),
            };
            let hit_args = [value.into()];
            self.builder.ins().jump(done, &hit_args);

            self.builder.switch_to_block(done);
            let result = self.builder.block_params(done)[0];
            self.set(op.rt(), result);
        } else {
            let done = self.builder.create_block();
            let data = self.get(op.rt());
            self.builder.ins().brif(missed, done, &[], access, &[]);

            self.builder.switch_to_block(access);
            let flags = self.data_flags;
            match op.prim() {
                Prim::Sb => {
                    self.builder.ins().istore8(flags, data, host, 0);
                }
                Prim::Sh => {
                    self.builder.ins().istore16(flags, data, host, 0);
                }
                _ => {
                    self.builder.ins().store(flags, data, host, 0);
                }
            }
            self.builder.ins().jump(done, &[]);

            self.builder.switch_to_block(done);
        }
    }

    fn emit_kunseg(&mut self, addr: Value) -> Value {
        let kseg1 = self.iconst32(0xA000_0000);
        let in_kseg1 = self
            .builder
            .ins()
            .icmp(IntCC::UnsignedGreaterThanOrEqual, addr, kseg1);
        let sub_kseg1 = self.builder.ins().isub(addr, kseg1);
        let kseg0 = self.iconst32(0x8000_0000);
        let in_kseg0 = self
            .builder
            .ins()
            .icmp(IntCC::UnsignedGreaterThanOrEqual, addr, kseg0);
        let sub_kseg0 = self.builder.ins().isub(addr, kseg0);
        let lower = self.builder.ins().select(in_kseg0, sub_kseg0, addr);
        self.builder.ins().select(in_kseg1, sub_kseg1, lower)
    }
}
