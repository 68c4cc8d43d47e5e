//! Block storage
//!
//! Relocatable block allocator interface. The Device Manager reserves a
//! block for every device control entry and keeps it locked while the
//! driver is installed.

use alloc::collections::BTreeMap;

use crate::error::{DeviceError, DeviceResult};

/// Handle to an allocated block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockHandle(pub u32);

/// Relocatable block allocator
pub trait BlockAllocator: Send {
    /// Allocate a block of `size` bytes
    fn allocate(&mut self, size: usize) -> DeviceResult<BlockHandle>;

    /// Release a block
    fn dispose(&mut self, handle: BlockHandle);

    /// Pin a block in place
    fn lock(&mut self, handle: BlockHandle) -> DeviceResult<()>;

    /// Allow a block to move again
    fn unlock(&mut self, handle: BlockHandle) -> DeviceResult<()>;

    /// Number of live blocks
    fn block_count(&self) -> usize;
}

#[derive(Debug, Clone, Copy)]
struct Block {
    size: usize,
    locked: bool,
}

/// Bookkeeping allocator with an optional byte budget
#[derive(Debug)]
pub struct HeapBlocks {
    blocks: BTreeMap<u32, Block>,
    next_handle: u32,
    limit: Option<usize>,
    in_use: usize,
}

impl HeapBlocks {
    /// Allocator with no budget
    pub const fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            next_handle: 1,
            limit: None,
            in_use: 0,
        }
    }

    /// Allocator that fails once `limit` bytes are outstanding
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            blocks: BTreeMap::new(),
            next_handle: 1,
            limit: Some(limit),
            in_use: 0,
        }
    }

    /// Bytes currently allocated
    pub fn bytes_in_use(&self) -> usize {
        self.in_use
    }

    pub fn is_locked(&self, handle: BlockHandle) -> bool {
        self.blocks.get(&handle.0).is_some_and(|b| b.locked)
    }
}

impl Default for HeapBlocks {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockAllocator for HeapBlocks {
    fn allocate(&mut self, size: usize) -> DeviceResult<BlockHandle> {
        if let Some(limit) = self.limit {
            if self.in_use + size > limit {
                return Err(DeviceError::OutOfMemory);
            }
        }
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.blocks.insert(
            handle,
            Block {
                size,
                locked: false,
            },
        );
        self.in_use += size;
        Ok(BlockHandle(handle))
    }

    fn dispose(&mut self, handle: BlockHandle) {
        if let Some(block) = self.blocks.remove(&handle.0) {
            self.in_use -= block.size;
        }
    }

    fn lock(&mut self, handle: BlockHandle) -> DeviceResult<()> {
        let block = self
            .blocks
            .get_mut(&handle.0)
            .ok_or(DeviceError::InvalidParameter)?;
        block.locked = true;
        Ok(())
    }

    fn unlock(&mut self, handle: BlockHandle) -> DeviceResult<()> {
        let block = self
            .blocks
            .get_mut(&handle.0)
            .ok_or(DeviceError::InvalidParameter)?;
        block.locked = false;
        Ok(())
    }

    fn block_count(&self) -> usize {
        self.blocks.len()
    }
}
