//! The kernel fault-trap handler
//!
//! When an instruction raises an exception the hardware latches the fault
//! classification and the faulting address into coprocessor 0, then
//! transfers control here. [handle] preserves the registers it is about to
//! clobber, decodes the fault code out of the cause word, reports it on the
//! console, restores the registers, and resumes the interrupted program at
//! the instruction after the one that faulted.
//!
//! The handler reaches the machine only through the [FaultContext]
//! interface, so tests can drive it with a synthetic context instead of a
//! full [Core].
//!
//! [handle]: ./fn.handle.html
//! [FaultContext]: ./trait.FaultContext.html
//! [Core]: ../struct.Core.html

use crate::{A0, AT, PRINT_INT, PRINT_STRING, V0};
use itertools::Itertools;
use std::io::{self, Write};

/// Bit offset of the fault-code field inside the cause word.
pub const CAUSE_CODE_OFFSET: u32 = 2;
/// Width in bits of the fault-code field.
pub const CAUSE_CODE_WIDTH: u32 = 5;
/// Mask isolating a fault code once the field has been shifted down.
pub const CAUSE_CODE_MASK: u32 = (1 << CAUSE_CODE_WIDTH) - 1;
/// The byte size of one instruction, the amount the resume address must
/// advance by to skip the faulting instruction.
pub const INSTRUCTION_WIDTH: u32 = 4;

/// The hardware state a fault exposes to the handler.
///
/// The cause word, the exception program counter and the register file all
/// live in fixed machine locations rather than being passed as arguments,
/// so the handler reads and writes them through this interface. [Core]
/// implements it with its coprocessor-0 state; the tests below implement it
/// with plain fields.
///
/// [Core]: ../struct.Core.html
pub trait FaultContext {
    /// The cause word the hardware latched for the current fault.
    fn cause(&self) -> u32;
    /// The address of the faulting instruction.
    fn epc(&self) -> u32;
    /// Overwrite the address execution will resume at.
    fn set_epc(&mut self, address: u32);
    /// Read a general-purpose register.
    fn register(&self, index: usize) -> u32;
    /// Write a general-purpose register. Writes to register 0 are dropped.
    fn set_register(&mut self, index: usize, value: u32);
    /// Transfer control back to the interrupted program at the EPC.
    fn return_from_exception(&mut self);
}

/// Extracts the fault code from a cause word.
///
/// The code field is exactly [CAUSE_CODE_WIDTH] bits wide, so the result is
/// in 0..32 whatever the rest of the word holds.
///
/// [CAUSE_CODE_WIDTH]: ./constant.CAUSE_CODE_WIDTH.html
pub fn decode_cause(cause: u32) -> u32 {
    (cause >> CAUSE_CODE_OFFSET) & CAUSE_CODE_MASK
}

/// A fault code paired with its console label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FaultDescriptor {
    /// The code this descriptor describes.
    pub code: u32,
    /// The text printed after the code. Empty for reserved codes.
    pub label: &'static str,
}

// Labels for all 32 fault codes, in code order. Codes 1 to 3 share the
// "TLB" label and the reserved codes have none; both are inherited from the
// architecture and the reporter prints them as they are.
const LABELS: [(u32, &str); 32] = [
    (0, "Interrupt"),
    (1, "TLB"),
    (2, "TLB"),
    (3, "TLB"),
    (4, "Address error in inst/data fetch"),
    (5, "Address error in store"),
    (6, "Bad instruction address"),
    (7, "Bad data address"),
    (8, "Error in syscall"),
    (9, "Breakpoint"),
    (10, "Reserved instruction"),
    (11, ""),
    (12, "Arithmetic overflow"),
    (13, "Trap"),
    (14, ""),
    (15, "Floating point"),
    (16, ""),
    (17, ""),
    (18, "Coproc 2"),
    (19, ""),
    (20, ""),
    (21, ""),
    (22, "MDMX"),
    (23, "Watch"),
    (24, "Machine check"),
    (25, ""),
    (26, ""),
    (27, ""),
    (28, ""),
    (29, ""),
    (30, "Cache"),
    (31, ""),
];

/// The fault descriptor table, one entry per code.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DescriptorTable {
    descriptors: [FaultDescriptor; 32],
}

impl DescriptorTable {
    /// Builds the table from the literal label list.
    ///
    /// Panics if the list doesn't hold exactly one descriptor per code in
    /// code order; a table that passes can be indexed by any decoded code.
    pub fn new() -> Self {
        Self::from_entries(&LABELS)
    }

    fn from_entries(entries: &[(u32, &'static str); 32]) -> Self {
        assert!(
            entries.iter().map(|&(code, _)| code).all_unique(),
            "duplicate fault code in descriptor table",
        );
        assert!(
            entries.iter().map(|&(code, _)| code).eq(0..32),
            "descriptor table must cover codes 0..32 in order",
        );
        let mut descriptors = [FaultDescriptor { code: 0, label: "" }; 32];
        for (descriptor, &(code, label)) in descriptors.iter_mut().zip(entries) {
            *descriptor = FaultDescriptor { code, label };
        }
        Self { descriptors }
    }

    /// Looks up the descriptor for a fault code.
    ///
    /// Codes are 5 bits by construction; anything wider is masked down
    /// rather than read out of bounds.
    pub fn lookup(&self, code: u32) -> &FaultDescriptor {
        &self.descriptors[(code & CAUSE_CODE_MASK) as usize]
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The register values the handler preserves across its own execution.
///
/// The handler stages values through `$at`, `$v0` and `$a0` while decoding
/// and reporting, so exactly those three are captured on entry and written
/// back before the resume transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedRegisters {
    at: u32,
    v0: u32,
    a0: u32,
}

impl SavedRegisters {
    /// Captures the protected register set.
    ///
    /// `$at` is read first and on its own: it is the implicit temporary of
    /// the staging steps that follow, and nothing may touch it beforehand.
    pub fn save(ctx: &impl FaultContext) -> Self {
        let at = ctx.register(AT);
        let v0 = ctx.register(V0);
        let a0 = ctx.register(A0);
        Self { at, v0, a0 }
    }

    /// Writes the captured values back.
    ///
    /// Must run after all decode and report steps and before the resume
    /// transfer, otherwise the interrupted program observes clobbered
    /// registers.
    pub fn restore(self, ctx: &mut impl FaultContext) {
        ctx.set_register(AT, self.at);
        ctx.set_register(V0, self.v0);
        ctx.set_register(A0, self.a0);
    }
}

/// The trap entry point.
///
/// The hardware invokes this with further faults held off, so the whole
/// save, decode, report, restore, resume sequence runs as one unit. The
/// report is flushed to `out` before the interrupted program gets control
/// back.
pub fn handle(
    ctx: &mut impl FaultContext,
    table: &DescriptorTable,
    out: &mut impl Write,
) -> io::Result<()> {
    let saved = SavedRegisters::save(ctx);

    // Stage the cause word through $at and leave the decoded code in $a0,
    // the argument register the report consumes.
    ctx.set_register(AT, ctx.cause());
    let code = decode_cause(ctx.register(AT));
    ctx.set_register(A0, code);

    report(ctx, code, table.lookup(code), out)?;

    saved.restore(ctx);
    resume(ctx);
    Ok(())
}

/// Prints one report line for a fault.
///
/// Reserved codes have empty labels and print as just the code; that is the
/// table's business, not an error here.
fn report(
    ctx: &mut impl FaultContext,
    code: u32,
    descriptor: &FaultDescriptor,
    out: &mut impl Write,
) -> io::Result<()> {
    ctx.set_register(V0, PRINT_INT);
    write!(out, "Exception code: {}", code)?;
    if !descriptor.label.is_empty() {
        ctx.set_register(V0, PRINT_STRING);
        write!(out, " {}", descriptor.label)?;
    }
    writeln!(out)?;
    // The report must be observable before the interrupted program runs
    // again.
    out.flush()
}

/// Returns control to the interrupted program.
///
/// The EPC still addresses the instruction that faulted; advancing it one
/// instruction first stops the processor re-executing that instruction and
/// faulting forever.
fn resume(ctx: &mut impl FaultContext) {
    ctx.set_epc(ctx.epc().wrapping_add(INSTRUCTION_WIDTH));
    ctx.return_from_exception();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traps::Exception;
    use strum::IntoEnumIterator;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestContext {
        cause: u32,
        epc: u32,
        program_counter: u32,
        registers: [u32; 32],
    }

    impl TestContext {
        fn faulted(exception: Exception, epc: u32) -> Self {
            Self::with_cause(exception.code() << CAUSE_CODE_OFFSET, epc)
        }

        fn with_cause(cause: u32, epc: u32) -> Self {
            let mut registers = [0; 32];
            for (index, register) in registers.iter_mut().enumerate() {
                *register = 0xcafe0000 | index as u32;
            }
            TestContext {
                cause,
                epc,
                program_counter: 0,
                registers,
            }
        }
    }

    impl FaultContext for TestContext {
        fn cause(&self) -> u32 {
            self.cause
        }
        fn epc(&self) -> u32 {
            self.epc
        }
        fn set_epc(&mut self, address: u32) {
            self.epc = address;
        }
        fn register(&self, index: usize) -> u32 {
            self.registers[index]
        }
        fn set_register(&mut self, index: usize, value: u32) {
            if index != 0 {
                self.registers[index] = value;
            }
        }
        fn return_from_exception(&mut self) {
            self.program_counter = self.epc;
        }
    }

    #[test]
    fn decode_extracts_the_code_field() {
        for code in 0..32 {
            assert_eq!(decode_cause(code << CAUSE_CODE_OFFSET), code);
        }
    }

    #[test]
    fn decode_ignores_bits_outside_the_field() {
        // Every bit except the code field's five.
        let noise = !(CAUSE_CODE_MASK << CAUSE_CODE_OFFSET);
        for code in 0..32 {
            assert_eq!(decode_cause(code << CAUSE_CODE_OFFSET | noise), code);
        }
    }

    #[test]
    fn decode_stays_in_range() {
        assert!(decode_cause(u32::MAX) < 32);
        assert_eq!(decode_cause(u32::MAX), decode_cause(u32::MAX));
    }

    #[test]
    fn lookup_returns_the_descriptor_at_the_code() {
        let table = DescriptorTable::new();
        for code in 0..32 {
            assert_eq!(table.lookup(code).code, code);
        }
    }

    #[test]
    fn architected_exceptions_are_labelled() {
        let table = DescriptorTable::new();
        for exception in Exception::iter() {
            assert!(!table.lookup(exception.code()).label.is_empty());
        }
    }

    #[test]
    fn codes_survive_a_cause_round_trip() {
        for exception in Exception::iter() {
            let cause = exception.code() << CAUSE_CODE_OFFSET;
            assert_eq!(Exception::from_code(decode_cause(cause)), Some(exception));
        }
    }

    #[test]
    #[should_panic]
    fn malformed_tables_are_rejected() {
        let mut entries = LABELS;
        entries[13] = (26, "Trap");
        let _ = DescriptorTable::from_entries(&entries);
    }

    #[test]
    fn reports_carry_the_code_and_label() {
        let mut ctx = TestContext::faulted(Exception::ArithmeticOverflow, 0x40);
        let mut out = Vec::new();
        handle(&mut ctx, &DescriptorTable::new(), &mut out).unwrap();
        assert_eq!(out, b"Exception code: 12 Arithmetic overflow\n");
    }

    #[test]
    fn reserved_codes_report_bare() {
        let mut ctx = TestContext::with_cause(11 << CAUSE_CODE_OFFSET, 0x40);
        let mut out = Vec::new();
        handle(&mut ctx, &DescriptorTable::new(), &mut out).unwrap();
        assert_eq!(out, b"Exception code: 11\n");
    }

    #[test]
    fn protected_registers_survive_handling() {
        let before = TestContext::faulted(Exception::Trap, 0x1c);
        let mut ctx = before.clone();
        handle(&mut ctx, &DescriptorTable::new(), &mut Vec::new()).unwrap();
        assert_eq!(ctx.registers, before.registers);
    }

    #[test]
    fn save_and_restore_are_inverses() {
        let before = TestContext::faulted(Exception::Interrupt, 0);
        let mut ctx = before.clone();
        let saved = SavedRegisters::save(&ctx);
        ctx.set_register(AT, 1);
        ctx.set_register(V0, 2);
        ctx.set_register(A0, 3);
        saved.restore(&mut ctx);
        assert_eq!(ctx.registers, before.registers);
    }

    #[test]
    fn resume_skips_the_faulting_instruction() {
        let mut ctx = TestContext::faulted(Exception::Breakpoint, 0x104);
        handle(&mut ctx, &DescriptorTable::new(), &mut Vec::new()).unwrap();
        assert_eq!(ctx.epc, 0x104 + INSTRUCTION_WIDTH);
        assert_eq!(ctx.program_counter, ctx.epc);
    }
}
