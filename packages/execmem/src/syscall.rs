//! Emu syscalls.
//!
//! Emulators reach the debug block through a small table of syscalls, separate
//! from the OS's own: [`EmuSyscall::DebugAlloc`] reserves the block before a
//! program is loaded under GDB, and [`EmuSyscall::DebugFree`] hands it back
//! once the session ends.
//!
//! A [`Dispatcher`] runs these calls against an [`ExecMem`] the caller owns.
//! For the OS side, [`install`] sets up one process-wide instance backed by
//! [`Heap`], which the C entry points in this module ([`emu_debug_alloc`],
//! [`emu_debug_free`], [`execmem_alloc`], [`execmem_free`]) operate on.

use std::{
    ffi::c_void,
    ptr::{self, NonNull},
    sync::{Mutex, OnceLock, PoisonError},
};

use log::debug;
use snafu::{Snafu, ensure};

use crate::{
    ExecMem,
    hardware::Hardware,
    heap::{GeneralAllocator, Heap},
};

/// Errors raised while dispatching emu syscalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum SyscallError {
    /// The syscall number is not in the emu syscall table.
    #[snafu(display("Unknown emu syscall number {number}"))]
    UnknownSyscall {
        /// The number that was requested.
        number: u32,
    },

    /// [`install`] was called more than once.
    #[snafu(display("Emu syscalls are already installed"))]
    AlreadyInstalled,
}

/// An entry of the emu syscall table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EmuSyscall {
    /// Reserve the debug block and return its address.
    DebugAlloc = 0,
    /// Return the debug block to the heap.
    DebugFree = 1,
}

impl EmuSyscall {
    /// Every syscall, in table order.
    pub const ALL: [Self; 2] = [Self::DebugAlloc, Self::DebugFree];

    /// Returns the syscall's index in the table.
    #[must_use]
    pub const fn number(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for EmuSyscall {
    type Error = SyscallError;

    fn try_from(number: u32) -> Result<Self, Self::Error> {
        match number {
            0 => Ok(Self::DebugAlloc),
            1 => Ok(Self::DebugFree),
            number => UnknownSyscallSnafu { number }.fail(),
        }
    }
}

/// The value a syscall hands back to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallReturn {
    /// An address, or `None` for a null pointer.
    Pointer(Option<NonNull<u8>>),
    /// Nothing.
    Unit,
}

impl SyscallReturn {
    /// Converts the return value to what a C caller sees in its return register.
    #[must_use]
    pub fn into_raw(self) -> *mut c_void {
        match self {
            Self::Pointer(Some(ptr)) => ptr.as_ptr().cast(),
            Self::Pointer(None) | Self::Unit => ptr::null_mut(),
        }
    }
}

/// Runs emu syscalls against a borrowed [`ExecMem`].
#[derive(Debug)]
pub struct Dispatcher<'a, A, H> {
    execmem: &'a mut ExecMem<A, H>,
}

impl<'a, A: GeneralAllocator, H: Hardware> Dispatcher<'a, A, H> {
    /// Creates a dispatcher for `execmem`.
    pub const fn new(execmem: &'a mut ExecMem<A, H>) -> Self {
        Self { execmem }
    }

    /// Runs a syscall.
    pub fn call(&mut self, syscall: EmuSyscall) -> SyscallReturn {
        debug!("emu syscall {syscall:?}");
        match syscall {
            EmuSyscall::DebugAlloc => SyscallReturn::Pointer(self.execmem.reserve_debug_block()),
            EmuSyscall::DebugFree => {
                self.execmem.release_debug_block();
                SyscallReturn::Unit
            }
        }
    }

    /// Runs a syscall by its table number.
    ///
    /// # Errors
    ///
    /// Returns [`SyscallError::UnknownSyscall`] if `number` is not in the table.
    pub fn call_number(&mut self, number: u32) -> Result<SyscallReturn, SyscallError> {
        let syscall = EmuSyscall::try_from(number)?;
        Ok(self.call(syscall))
    }
}

type GlobalExecMem = ExecMem<Heap, Box<dyn Hardware + Send>>;

static EXECMEM: OnceLock<Mutex<GlobalExecMem>> = OnceLock::new();

/// Sets up the process-wide [`ExecMem`] used by the C entry points.
///
/// `hardware` is queried when the debug block is first reserved.
///
/// # Errors
///
/// Returns [`SyscallError::AlreadyInstalled`] if called more than once.
pub fn install(hardware: impl Hardware + Send + 'static) -> Result<(), SyscallError> {
    let hardware: Box<dyn Hardware + Send> = Box::new(hardware);
    let execmem = ExecMem::new(Heap, hardware);
    ensure!(EXECMEM.set(Mutex::new(execmem)).is_ok(), AlreadyInstalledSnafu);
    debug!("emu syscalls installed");
    Ok(())
}

/// Runs `f` on the installed instance, or returns `None` before [`install`].
fn with_installed<R>(f: impl FnOnce(&mut GlobalExecMem) -> R) -> Option<R> {
    let execmem = EXECMEM.get()?;
    let mut guard = execmem.lock().unwrap_or_else(PoisonError::into_inner);
    Some(f(&mut guard))
}

/// Reserves the debug block. Returns null on failure or before [`install`].
#[unsafe(no_mangle)]
pub extern "C" fn emu_debug_alloc() -> *mut c_void {
    with_installed(|execmem| Dispatcher::new(execmem).call(EmuSyscall::DebugAlloc))
        .map_or(ptr::null_mut(), SyscallReturn::into_raw)
}

/// Returns the debug block to the heap.
#[unsafe(no_mangle)]
pub extern "C" fn emu_debug_free() {
    with_installed(|execmem| Dispatcher::new(execmem).call(EmuSyscall::DebugFree));
}

/// Allocates memory for the loader to place a program of `size` bytes in.
///
/// Before [`install`] this is a plain heap allocation.
#[unsafe(no_mangle)]
pub extern "C" fn execmem_alloc(size: usize) -> *mut c_void {
    with_installed(|execmem| execmem.allocate(size))
        .unwrap_or_else(|| Heap.malloc(size))
        .map_or(ptr::null_mut(), |ptr| ptr.as_ptr().cast())
}

/// Frees memory returned by [`execmem_alloc`]. Null pointers are ignored.
///
/// # Safety
///
/// `ptr` must be null or have been returned by [`execmem_alloc`] and not freed
/// since.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn execmem_free(ptr: *mut c_void) {
    let Some(ptr) = NonNull::new(ptr.cast::<u8>()) else {
        return;
    };

    // SAFETY: caller guarantees `ptr` came from `execmem_alloc`.
    if with_installed(|execmem| unsafe { execmem.release(ptr) }).is_none() {
        // SAFETY: before install every allocation comes straight from `Heap`.
        unsafe { Heap.free(ptr) }
    }
}

/// The emu syscall table, laid out in [`EmuSyscall`] order.
#[repr(C)]
#[derive(Debug)]
pub struct EmuSyscallTable {
    /// [`EmuSyscall::DebugAlloc`]
    pub debug_alloc: extern "C" fn() -> *mut c_void,
    /// [`EmuSyscall::DebugFree`]
    pub debug_free: extern "C" fn(),
}

/// The table handed to the OS's syscall dispatcher.
pub static EMU_SYSCALL_TABLE: EmuSyscallTable = EmuSyscallTable {
    debug_alloc: emu_debug_alloc,
    debug_free: emu_debug_free,
};
