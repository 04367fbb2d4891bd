//! Dynamic recompiler core for MIPS R3000 guest code.
//!
//! Guest basic blocks are translated into native functions through
//! Cranelift, cached by guest PC, and entered through a generated
//! wrapper that carries the state pointer. Guest loads and stores
//! resolve against an immutable memory map with the kseg0/kseg1 mirrors
//! of the 32-bit address space stripped.

pub mod block;
pub mod disasm;
mod emit;
pub mod mem;

pub use block::{Block, BlockCache};
pub use disasm::{cycles_of, disassemble, Opcode, Prim, RegImm, Special, MAX_BLOCK_OPS};
pub use mem::{kunseg, MemRegion, MmioOps};

use cranelift_codegen::isa::OwnedTargetIsa;

use crate::emit::regcache::RegCache;

/// Exit flag: the block ran to its end.
pub const EXIT_NORMAL: u32 = 0;
/// Exit flag: the block stopped at a SYSCALL instruction.
pub const EXIT_SYSCALL: u32 = 1;
/// Exit flag: the block stopped at a BREAK instruction.
pub const EXIT_BREAK: u32 = 2;
/// Exit flag: a load or store touched unmapped guest memory.
pub const EXIT_SEGFAULT: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("no executable memory region covers PC {pc:#010x}")]
    UnmappedPc { pc: u32 },
    #[error("code emission backend failure: {0}")]
    Backend(String),
}

/// Guest-visible machine state, shared with generated code.
///
/// Generated blocks address these fields by offset relative to the
/// state pointer, and MMIO/coprocessor handlers receive it directly,
/// e.g. to raise `stop`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CoreState {
    pub gpr: [u32; 32],
    pub hi: u32,
    pub lo: u32,
    /// Where execution resumes after the current block exits.
    pub next_pc: u32,
    pub exit_flags: u32,
    pub block_exit_cycles: u32,
    /// Observed by the executor after each block; set by the segfault
    /// handler and by embedder callbacks that want execution to cease.
    pub stop: bool,
}

/// Flattened direct-memory map entry scanned by the generated
/// address-lookup stub.
#[repr(C)]
pub(crate) struct RawMapEntry {
    pub(crate) base: u32,
    pub(crate) length: u32,
    pub(crate) host: *mut u8,
}

/// Coprocessor operation table. Opaque to the core; every COP0/COP2
/// encoding a block meets is forwarded here.
pub trait CopOps {
    fn mfc(&mut self, core: &mut CoreState, opcode: Opcode) -> u32;
    fn cfc(&mut self, core: &mut CoreState, opcode: Opcode) -> u32;
    fn mtc(&mut self, core: &mut CoreState, opcode: Opcode, value: u32);
    fn ctc(&mut self, core: &mut CoreState, opcode: Opcode, value: u32);
    fn op(&mut self, core: &mut CoreState, opcode: Opcode);
}

/// Coprocessor table for embedders without coprocessors: reads return
/// zero, writes and operations are ignored.
pub struct NullCop;

impl CopOps for NullCop {
    fn mfc(&mut self, _core: &mut CoreState, _opcode: Opcode) -> u32 {
        0
    }
    fn cfc(&mut self, _core: &mut CoreState, _opcode: Opcode) -> u32 {
        0
    }
    fn mtc(&mut self, _core: &mut CoreState, _opcode: Opcode, _value: u32) {}
    fn ctc(&mut self, _core: &mut CoreState, _opcode: Opcode, _value: u32) {}
    fn op(&mut self, _core: &mut CoreState, _opcode: Opcode) {}
}

/// Compilation and cache counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub cache_hits: u64,
    pub blocks_compiled: u64,
    pub compile_failures: u64,
}

/// One recompiler instance: register file, memory map, block cache and
/// the generated helper code. Single-threaded; create one per guest.
pub struct State {
    pub core: CoreState,
    pub(crate) current: *const Block,
    stats: Stats,
    // The cache must be declared (and therefore dropped) before the
    // helper stubs below: blocks call into the lookup stub.
    pub(crate) block_cache: BlockCache,
    pub(crate) mem_map: Vec<MemRegion>,
    pub(crate) cop: Box<dyn CopOps>,
    pub(crate) raw_map_ptr: *const RawMapEntry,
    pub(crate) raw_map_len: u32,
    _raw_map: Box<[RawMapEntry]>,
    has_mmio: bool,
    rw_op: emit::RwFn,
    reg_cache: RegCache,
    wrapper: emit::EmittedCode,
    addr_lookup: emit::EmittedCode,
    isa: OwnedTargetIsa,
}

impl State {
    /// Build a recompiler over `mem_map`. Direct regions must reference
    /// embedder-owned memory that stays valid for the state's lifetime;
    /// the map is immutable from here on.
    pub fn new(
        mem_map: Vec<MemRegion>,
        cop: Box<dyn CopOps>,
    ) -> Result<Box<State>, CompileError> {
        let isa = emit::build_isa()?;
        let wrapper = emit::generate_wrapper(&isa)?;
        let addr_lookup = emit::generate_address_lookup(&isa)?;

        let raw_map: Box<[RawMapEntry]> = mem_map
            .iter()
            .filter(|region| !region.is_mmio())
            .map(|region| RawMapEntry {
                base: region.base,
                length: region.length,
                host: region.host,
            })
            .collect();
        let has_mmio = mem_map.iter().any(MemRegion::is_mmio);

        let state = Box::new(State {
            core: CoreState::default(),
            current: std::ptr::null(),
            stats: Stats::default(),
            block_cache: BlockCache::new(),
            mem_map,
            cop,
            raw_map_ptr: raw_map.as_ptr(),
            raw_map_len: raw_map.len() as u32,
            _raw_map: raw_map,
            has_mmio,
            rw_op: emit::rw_dispatcher(),
            reg_cache: RegCache::new(),
            wrapper,
            addr_lookup,
            isa,
        });

        log::debug!(
            "Initialized recompiler state with {} memory region(s)",
            state.mem_map.len()
        );
        Ok(state)
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn cache(&self) -> &BlockCache {
        &self.block_cache
    }

    pub fn cache_mut(&mut self) -> &mut BlockCache {
        &mut self.block_cache
    }

    /// PC of the block most recently handed to the trampoline, if it is
    /// still registered.
    pub fn current_block_pc(&self) -> Option<u32> {
        // SAFETY: `current` is only ever set to a cache-owned boxed
        // block, whose address is stable while it stays registered.
        unsafe { self.current.as_ref().map(|block| block.pc) }
    }

    /// Translate the guest code at `pc` into a fresh block. The caller
    /// owns the result until it is registered.
    pub fn recompile_block(&mut self, pc: u32) -> Result<Box<Block>, CompileError> {
        let kunseg_pc = kunseg(pc);
        let (code, max_words) = mem::find_code_address(&self.mem_map, kunseg_pc)
            .ok_or(CompileError::UnmappedPc { pc })?;

        // SAFETY: `code` points at `max_words` readable guest words
        // inside a direct region.
        let words = unsafe { std::slice::from_raw_parts(code, max_words) };
        let opcode_list = disassemble(words);

        let ctx = emit::EmitCtx {
            isa: self.isa.clone(),
            lookup_entry: self.addr_lookup.entry(),
            has_mmio: self.has_mmio,
            rw: self.rw_op,
        };
        let (emitted, cycles) = emit::compile_block(&ctx, &mut self.reg_cache, pc, &opcode_list)?;

        log::debug!(
            "Recompiled block at PC {pc:#010x}: {} opcode(s), {cycles} cycle(s)",
            opcode_list.len()
        );

        let hash = block::hash_code(code, opcode_list.len());
        Ok(Box::new(Block {
            pc,
            kunseg_pc,
            opcode_list,
            cycles,
            code,
            hash,
            emitted,
        }))
    }

    /// Run the block at `pc`, compiling and registering it on a cache
    /// miss, and return the PC to resume at. On a compilation failure
    /// the input PC is returned unchanged after logging; check `stats`
    /// to tell the two apart.
    pub fn execute(&mut self, pc: u32) -> u32 {
        let (current, entry) = match self.block_cache.find(pc) {
            Some(found) => {
                self.stats.cache_hits += 1;
                (found as *const Block, found.entry())
            }
            None => {
                let compiled = match self.recompile_block(pc) {
                    Ok(compiled) => compiled,
                    Err(err) => {
                        self.stats.compile_failures += 1;
                        log::error!("Unable to recompile block at PC {pc:#010x}: {err}");
                        return pc;
                    }
                };
                self.stats.blocks_compiled += 1;
                match self.block_cache.register(compiled) {
                    Ok(registered) => (registered as *const Block, registered.entry()),
                    Err(_) => {
                        log::error!("Block already registered at PC {pc:#010x}");
                        return pc;
                    }
                }
            }
        };

        self.core.exit_flags = EXIT_NORMAL;
        self.core.block_exit_cycles = 0;
        self.current = current;
        self.enter(entry);
        self.core.next_pc
    }

    /// Enter generated code through the wrapper trampoline. This is the
    /// only unsafe boundary into emitted code.
    fn enter(&mut self, entry: *const u8) {
        let wrapper = self.wrapper.entry();
        // SAFETY: `wrapper` was generated at init with this exact
        // signature, `entry` belongs to a block of this state, and the
        // state stays pinned behind its box for the whole call.
        unsafe {
            let wrapper: emit::WrapperFn = std::mem::transmute(wrapper);
            wrapper(self as *mut State, entry);
        }
    }
}
