use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::disasm::Opcode;
use crate::emit::EmittedCode;

/// One recompiled run of guest instructions.
///
/// The block owns its executable code; dropping it releases the native
/// buffer. `code` points into the guest memory the block was compiled
/// from and stays readable because the memory map is immutable.
pub struct Block {
    pub pc: u32,
    pub kunseg_pc: u32,
    pub opcode_list: Vec<Opcode>,
    pub cycles: u32,
    pub(crate) code: *const u32,
    pub(crate) hash: u32,
    pub(crate) emitted: EmittedCode,
}

impl Block {
    /// Hash recorded when the block was compiled/registered.
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Recompute the content hash over the guest words this block was
    /// compiled from.
    pub fn calculate_hash(&self) -> u32 {
        hash_code(self.code, self.opcode_list.len())
    }

    /// True when the covered guest code changed since compilation.
    pub fn is_outdated(&self) -> bool {
        self.calculate_hash() != self.hash
    }

    pub(crate) fn entry(&self) -> *const u8 {
        self.emitted.entry()
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("pc", &format_args!("{:#010x}", self.pc))
            .field("ops", &self.opcode_list.len())
            .field("cycles", &self.cycles)
            .finish_non_exhaustive()
    }
}

/// FNV-1a over the little-endian bytes of `nwords` guest words.
pub(crate) fn hash_code(code: *const u32, nwords: usize) -> u32 {
    const FNV_OFFSET: u32 = 0x811C_9DC5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET;
    for i in 0..nwords {
        // SAFETY: the caller guarantees `code` points at `nwords`
        // readable guest words.
        let word = unsafe { code.add(i).read_unaligned() };
        for byte in word.to_le_bytes() {
            hash = (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

/// PC-keyed cache of compiled blocks. Owns every registered block;
/// dropping the cache frees them all.
pub struct BlockCache {
    blocks: HashMap<u32, Box<Block>>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self {
            blocks: HashMap::new(),
        }
    }

    pub fn find(&self, pc: u32) -> Option<&Block> {
        self.blocks.get(&pc).map(Box::as_ref)
    }

    /// Insert a block, recording its content hash. A block already
    /// registered at the same PC rejects the insert and hands the new
    /// block back untouched.
    pub fn register(&mut self, mut block: Box<Block>) -> Result<&Block, Box<Block>> {
        match self.blocks.entry(block.pc) {
            Entry::Occupied(_) => Err(block),
            Entry::Vacant(slot) => {
                block.hash = block.calculate_hash();
                Ok(slot.insert(block))
            }
        }
    }

    /// Remove the block at `pc` without freeing it.
    pub fn unregister(&mut self, pc: u32) -> Option<Box<Block>> {
        self.blocks.remove(&pc)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::kunseg;

    fn block_over(pc: u32, code: &[u32]) -> Box<Block> {
        Box::new(Block {
            pc,
            kunseg_pc: kunseg(pc),
            opcode_list: code.iter().map(|&w| Opcode(w)).collect(),
            cycles: (code.len() as u32) * 4,
            code: code.as_ptr(),
            hash: 0,
            emitted: EmittedCode::detached(),
        })
    }

    #[test]
    fn hash_is_deterministic_and_content_sensitive() {
        let words = [0x2408_0001u32, 0x0800_0000, 0x0000_0000];
        let a = hash_code(words.as_ptr(), words.len());
        let b = hash_code(words.as_ptr(), words.len());
        assert_eq!(a, b);

        let mut changed = words;
        changed[1] ^= 0x0000_0100;
        assert_ne!(hash_code(changed.as_ptr(), changed.len()), a);
    }

    #[test]
    fn register_find_unregister() {
        let code = [0x0800_0000u32, 0x0000_0000];
        let mut cache = BlockCache::new();

        cache.register(block_over(0x8000_0000, &code)).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.find(0x8000_0000).is_some());
        assert!(cache.find(0x8000_0004).is_none());

        let block = cache.unregister(0x8000_0000).unwrap();
        assert!(cache.find(0x8000_0000).is_none());
        assert_eq!(block.pc, 0x8000_0000);
        assert!(cache.is_empty());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let code = [0x0800_0000u32, 0x0000_0000];
        let mut cache = BlockCache::new();

        cache.register(block_over(0x8000_0000, &code)).unwrap();
        let rejected = cache.register(block_over(0x8000_0000, &code));
        assert!(rejected.is_err());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn registration_records_hash_for_staleness() {
        let mut code = [0x2408_0001u32, 0x0800_0000, 0x0000_0000];
        let mut cache = BlockCache::new();

        cache.register(block_over(0x8000_0000, &code)).unwrap();
        let registered = cache.find(0x8000_0000).unwrap();
        assert!(!registered.is_outdated());

        code[0] = 0x2408_0002;
        let registered = cache.find(0x8000_0000).unwrap();
        assert!(registered.is_outdated());
    }
}
