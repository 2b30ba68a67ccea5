//! Traps - Exceptions raised by a running core
//!
//! This module holds the classification of every exception that can be
//! raised by a running [Core], numbered the way the cause register reports
//! them.
//!
//! [Core]: ../struct.Core.html

use strum::{EnumIter, FromRepr};

/// An enumeration of the architected exception classes.
///
/// The discriminants are the fault codes the hardware latches into the
/// cause register, so a variant converts to its code with a plain cast.
///
/// Not all of these are currently raised by the core, but the kernel's
/// descriptor table covers every one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, FromRepr)]
#[repr(u8)]
pub enum Exception {
    /// An external or timer interrupt was delivered.
    Interrupt = 0,
    /// A load or instruction fetch used a misaligned or otherwise unusable
    /// address.
    AddressErrorLoad = 4,
    /// A store used a misaligned or otherwise unusable address.
    AddressErrorStore = 5,
    /// An instruction fetch went to memory that doesn't exist.
    InstructionBusError = 6,
    /// A data access went to memory that doesn't exist.
    DataBusError = 7,
    /// A syscall instruction was executed.
    Syscall = 8,
    /// A breakpoint instruction was executed.
    Breakpoint = 9,
    /// Attempted to execute an instruction this core doesn't implement.
    ReservedInstruction = 10,
    /// A trapping arithmetic instruction overflowed.
    ArithmeticOverflow = 12,
    /// A conditional trap instruction fired.
    Trap = 13,
    /// A floating point operation misbehaved.
    FloatingPoint = 15,
}

impl Exception {
    /// The fault code this exception is reported as.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// The exception a raw fault code names, if one is architected.
    pub fn from_code(code: u32) -> Option<Self> {
        u8::try_from(code).ok().and_then(Self::from_repr)
    }
}
