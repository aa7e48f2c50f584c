//! The debug block and the allocator that lends it out.
//!
//! When a program is debugged in an emulator, the GDB stub needs it loaded at
//! the same address every time: GDB only asks for section offsets (`qOffsets`)
//! once per session. The emulator reserves a block up front through
//! [`ExecMem::reserve_debug_block`], and from then on the loader's
//! [`ExecMem::allocate`] hands that block out instead of fresh heap memory.
//!
//! Allocation is fail-soft. If the block is missing, busy or too small, the
//! request is served by the general allocator and a warning is logged.

use std::{mem, ptr::NonNull};

use log::{debug, trace, warn};

use crate::{
    hardware::{BlockSizing, Hardware},
    heap::GeneralAllocator,
};

/// State of the reserved debug block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DebugBlock {
    pointer: Option<NonNull<u8>>,
    size: usize,
    in_use: bool,
}

impl DebugBlock {
    /// An unreserved block.
    pub const EMPTY: Self = Self {
        pointer: None,
        size: 0,
        in_use: false,
    };

    /// Returns the address of the block, if one is reserved.
    #[must_use]
    pub const fn pointer(&self) -> Option<NonNull<u8>> {
        self.pointer
    }

    /// Returns the capacity of the block in bytes, if one is reserved.
    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        match self.pointer {
            Some(_) => Some(self.size),
            None => None,
        }
    }

    /// Returns `true` while the block is lent out to a program.
    #[must_use]
    pub const fn is_on_loan(&self) -> bool {
        self.in_use
    }
}

/// Where a request of a given size would be served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// No block is reserved; the general allocator serves the request.
    Unreserved,
    /// The debug block serves the request.
    Reserved,
    /// The block is already lent out; the general allocator serves the request.
    InUse,
    /// The block is too small; the general allocator serves the request.
    TooSmall {
        /// Capacity of the debug block.
        capacity: usize,
        /// Size of the request.
        requested: usize,
    },
}

impl Placement {
    /// Returns `true` if the request would be given the debug block.
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved)
    }
}

/// Executable memory for the program loader.
///
/// Owns the [`DebugBlock`] along with the general allocator backing it and the
/// hardware query used to size it. All state lives in this value; nothing is
/// shared behind the caller's back. It is meant for a single execution context
/// (one loader, one debug session).
#[derive(Debug)]
pub struct ExecMem<A, H> {
    allocator: A,
    hardware: H,
    sizing: BlockSizing,
    block: DebugBlock,
    /// Blocks released by the emulator while a program still had them.
    detached: Vec<NonNull<u8>>,
}

// SAFETY: the block pointers are owned by this value and only touched through
// `&mut self`.
unsafe impl<A: Send, H: Send> Send for ExecMem<A, H> {}

impl<A: GeneralAllocator, H: Hardware> ExecMem<A, H> {
    /// Creates an instance with no block reserved and the default [`BlockSizing`].
    pub const fn new(allocator: A, hardware: H) -> Self {
        Self {
            allocator,
            hardware,
            sizing: BlockSizing::DEFAULT,
            block: DebugBlock::EMPTY,
            detached: Vec::new(),
        }
    }

    /// Replaces the policy used to size the block on the next reservation.
    #[must_use]
    pub const fn with_sizing(mut self, sizing: BlockSizing) -> Self {
        self.sizing = sizing;
        self
    }

    /// Returns the current state of the debug block.
    #[must_use]
    pub const fn debug_block(&self) -> &DebugBlock {
        &self.block
    }

    /// Returns the hardware query this instance sizes the block with.
    #[must_use]
    pub const fn hardware(&self) -> &H {
        &self.hardware
    }

    /// Returns `true` if a debug block is reserved.
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        self.block.pointer.is_some()
    }

    /// Returns where a request of `size` bytes would be served from, without
    /// allocating.
    #[must_use]
    pub const fn placement(&self, size: usize) -> Placement {
        if self.block.pointer.is_none() {
            Placement::Unreserved
        } else if self.block.in_use {
            Placement::InUse
        } else if size > self.block.size {
            Placement::TooSmall {
                capacity: self.block.size,
                requested: size,
            }
        } else {
            Placement::Reserved
        }
    }

    /// Allocates memory to load a program of `size` bytes into.
    ///
    /// Returns the debug block when it is reserved, free and large enough.
    /// Otherwise the request goes to the general allocator, so this only
    /// returns `None` when the heap is exhausted.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        match self.placement(size) {
            Placement::Reserved => {
                self.block.in_use = true;
                trace!("lending debug block for {size} B program");
                self.block.pointer
            }
            Placement::Unreserved => self.allocator.malloc(size),
            Placement::InUse => {
                warn!("debug block in use by a resident program already");
                self.allocator.malloc(size)
            }
            Placement::TooSmall {
                capacity,
                requested,
            } => {
                warn!("debug block too small ({capacity} B) for this program ({requested} B)");
                self.allocator.malloc(size)
            }
        }
    }

    /// Releases memory returned by [`allocate`](Self::allocate).
    ///
    /// Giving back the debug block only ends the loan; the block stays
    /// reserved. Anything else is returned to the general allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// instance and not released since.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        if self.block.pointer == Some(ptr) {
            trace!("debug block returned");
            self.block.in_use = false;
            return;
        }

        if let Some(index) = self.detached.iter().position(|&block| block == ptr) {
            self.detached.swap_remove(index);
            debug!("freeing detached debug block at {ptr:p}");
        }

        // SAFETY: caller guarantees `ptr` came from `allocate`, and it is not
        // the reserved block, so the general allocator handed it out.
        unsafe { self.allocator.free(ptr) }
    }

    /// Reserves the debug block, sized for the device, and returns its address.
    ///
    /// Once reserved, the same address is returned until
    /// [`release_debug_block`](Self::release_debug_block) is called. Returns
    /// `None` if the general allocator could not provide the block.
    pub fn reserve_debug_block(&mut self) -> Option<NonNull<u8>> {
        if let Some(ptr) = self.block.pointer {
            return Some(ptr);
        }

        let size = self.sizing.for_hardware(&self.hardware);
        let Some(ptr) = self.allocator.malloc(size) else {
            warn!("could not reserve a {size} B debug block");
            return None;
        };

        debug!("reserved {size} B debug block at {ptr:p}");
        self.block = DebugBlock {
            pointer: Some(ptr),
            size,
            in_use: false,
        };

        Some(ptr)
    }

    /// Returns the debug block to the general allocator.
    ///
    /// If a program still has the block, it is detached instead: the block is
    /// no longer reserved, and its memory is freed when the program releases
    /// it.
    pub fn release_debug_block(&mut self) {
        let block = mem::take(&mut self.block);
        let Some(ptr) = block.pointer else {
            return;
        };

        if block.in_use {
            warn!("debug block released while on loan, deferring free");
            self.detached.push(ptr);
            return;
        }

        debug!("freeing debug block at {ptr:p}");
        // SAFETY: the block came from this allocator in `reserve_debug_block`
        // and is not lent out.
        unsafe { self.allocator.free(ptr) }
    }
}
