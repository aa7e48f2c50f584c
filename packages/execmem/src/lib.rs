//! Executable memory for loaded programs.
//!
//! The program loader asks this crate for memory to place programs in. When an
//! emulator wants to debug a program with GDB, it first reserves a debug block
//! through the emu syscalls, and the loader is then given that block so the
//! program lands at the same address on every run.
//!
//! Included in this crate:
//! - The debug block and loader allocation: [`block`]
//! - The general allocator it falls back on: [`heap`]
//! - Device capability queries used for sizing: [`hardware`]
//! - The emu syscall table and C entry points: [`syscall`]

pub mod block;
pub mod hardware;
pub mod heap;
pub mod syscall;

#[cfg(test)]
mod fake;

pub use block::{DebugBlock, ExecMem, Placement};
pub use hardware::{BlockSizing, Capabilities, Hardware, Model};
pub use heap::{GeneralAllocator, Heap};
pub use syscall::{Dispatcher, EmuSyscall, SyscallError, SyscallReturn, install};
