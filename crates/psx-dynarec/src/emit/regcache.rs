use cranelift_codegen::ir::{types, InstBuilder, MemFlags, Value};
use cranelift_frontend::FunctionBuilder;

use super::reg_offset;

/// Pseudo register index for HI.
pub(crate) const REG_HI: usize = 32;
/// Pseudo register index for LO.
pub(crate) const REG_LO: usize = 33;

const NUM_REGS: usize = 34;

#[derive(Clone, Copy)]
struct Cached {
    value: Value,
    dirty: bool,
}

/// Guest-register to SSA-value cache for the block currently being
/// compiled.
///
/// Reads load the register from the state once and reuse the value;
/// writes stay in SSA until `flush` stores the dirty set back. The
/// cached values belong to one Cranelift function, so `reset` must run
/// before every block.
pub(crate) struct RegCache {
    regs: [Option<Cached>; NUM_REGS],
}

impl RegCache {
    pub(crate) fn new() -> Self {
        Self {
            regs: [None; NUM_REGS],
        }
    }

    pub(crate) fn reset(&mut self) {
        self.regs = [None; NUM_REGS];
    }

    pub(crate) fn get(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        state_ptr: Value,
        flags: MemFlags,
        idx: usize,
    ) -> Value {
        if idx == 0 {
            return builder.ins().iconst(types::I32, 0);
        }
        if let Some(cached) = self.regs[idx] {
            return cached.value;
        }
        let value = builder
            .ins()
            .load(types::I32, flags, state_ptr, reg_offset(idx));
        self.regs[idx] = Some(Cached {
            value,
            dirty: false,
        });
        value
    }

    pub(crate) fn set(&mut self, idx: usize, value: Value) {
        if idx == 0 {
            return;
        }
        self.regs[idx] = Some(Cached { value, dirty: true });
    }

    /// Store every dirty register back into the state.
    ///
    /// Dirty bits are left set: a side-exit path flushes without
    /// disturbing the cache the fall-through path keeps using.
    pub(crate) fn flush(
        &self,
        builder: &mut FunctionBuilder<'_>,
        state_ptr: Value,
        flags: MemFlags,
    ) {
        for (idx, slot) in self.regs.iter().enumerate() {
            if let Some(cached) = slot {
                if cached.dirty {
                    builder
                        .ins()
                        .store(flags, cached.value, state_ptr, reg_offset(idx));
                }
            }
        }
    }

    /// Forget all cached values after a call that may have read or
    /// written the register file behind our back.
    pub(crate) fn invalidate(&mut self) {
        self.reset();
    }
}
