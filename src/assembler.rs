//! A MIPS assembler
//!
//! The main entrypoint to this module is the [assemble] function that takes
//! the input MIPS assembly code and produces the program as machine code.
//!
//! [assemble]: ./fn.assemble.html

use crate::bits;
use std::{collections::HashMap, ops::Range};

/// Assembles the input into machine code.
pub fn assemble(input: &str) -> Result<Vec<u32>, String> {
    let (
        _,
        Program {
            instructions,
            labels,
        },
    ) = program(input)?;
    instructions
        .into_iter()
        .enumerate()
        .map(|(loc, i)| i.to_machine_code(loc * 4, &labels))
        .collect()
}

type ParseResult<'a, T> = Result<(&'a str, T), String>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Program<'a> {
    instructions: Vec<Instruction<'a>>,
    labels: HashMap<&'a str, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Instruction<'a> {
    RType {
        funct: u32,
        source1: Register,
        source2: Register,
        destination: Register,
        shift: u32,
    },
    IType {
        opcode: u32,
        source: Register,
        destination: Register,
        immediate: Immediate<'a, I16>,
    },
    BranchType {
        opcode: u32,
        source1: Register,
        source2: Register,
        immediate: Immediate<'a, B18>,
    },
    JType {
        opcode: u32,
        target: Immediate<'a, J28>,
    },
    Raw {
        instruction: u32,
    },
}

impl<'a> Instruction<'a> {
    fn to_machine_code(&self, loc: usize, labels: &HashMap<&'a str, usize>) -> Result<u32, String> {
        Ok(match *self {
            Instruction::RType {
                funct,
                source1,
                source2,
                destination,
                shift,
            } => source1.0 << 21 | source2.0 << 16 | destination.0 << 11 | shift << 6 | funct,
            Instruction::IType {
                opcode,
                source,
                destination,
                immediate,
            } => {
                let imm = immediate.to_value(labels)? as u32;
                opcode << 26 | source.0 << 21 | destination.0 << 16 | bits(imm, 0..16)
            }
            Instruction::BranchType {
                opcode,
                source1,
                source2,
                immediate,
            } => {
                // Branch displacements count words from the following
                // instruction.
                let offset = immediate.to_offset(loc, labels)?.wrapping_sub(4) >> 2;
                opcode << 26 | source1.0 << 21 | source2.0 << 16 | bits(offset as u32, 0..16)
            }
            Instruction::JType { opcode, target } => {
                let address = target.to_value(labels)? as u32;
                opcode << 26 | bits(address, 2..28)
            }
            Instruction::Raw { instruction } => instruction,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct I16(i32);
impl TryFrom<i32> for I16 {
    type Error = String;
    fn try_from(value: i32) -> Result<Self, Self::Error> {
        // Sign-extending and zero-extending consumers share this format, so
        // both halves of the 16-bit range are accepted.
        if (-0x8000..0x10000).contains(&value) {
            Ok(I16(value))
        } else {
            Err(format!("{} outside valid immediate range", value))
        }
    }
}
impl From<I16> for i32 {
    fn from(imm: I16) -> i32 {
        imm.0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct B18(i32);
impl TryFrom<i32> for B18 {
    type Error = String;
    fn try_from(value: i32) -> Result<Self, Self::Error> {
        let max = 1 << 17;
        if (-max..max).contains(&value) {
            Ok(B18(value))
        } else {
            Err(format!("{} outside valid branch range", value))
        }
    }
}
impl From<B18> for i32 {
    fn from(imm: B18) -> i32 {
        imm.0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct J28(i32);
impl TryFrom<i32> for J28 {
    type Error = String;
    fn try_from(value: i32) -> Result<Self, Self::Error> {
        if (0..1 << 28).contains(&value) {
            Ok(J28(value))
        } else {
            Err(format!("{} outside valid jump range", value))
        }
    }
}
impl From<J28> for i32 {
    fn from(imm: J28) -> i32 {
        imm.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Register(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Immediate<'a, T> {
    Label(&'a str),
    Immediate(T),
}

impl<T: Into<i32> + Copy> Immediate<'_, T> {
    // Resolve to an absolute value; labels name absolute byte addresses.
    fn to_value(&self, labels: &HashMap<&str, usize>) -> Result<i32, String> {
        Ok(match self {
            Immediate::Label(l) => {
                let dest = *labels.get(l).ok_or(format!("Label {} not defined.", l))?;
                i32::try_from(dest).map_err(|_| format!("Address of {} too large", l))?
            }
            Immediate::Immediate(value) => (*value).into(),
        })
    }

    // Resolve to a byte offset from the instruction at `loc`.
    fn to_offset(&self, loc: usize, labels: &HashMap<&str, usize>) -> Result<i32, String> {
        Ok(match self {
            Immediate::Label(l) => {
                let dest = *labels.get(l).ok_or(format!("Label {} not defined.", l))?;
                if let Some(diff) = dest.checked_sub(loc) {
                    diff.try_into()
                } else {
                    // Can never overflow
                    let diff = loc.wrapping_sub(dest);
                    diff.try_into().map(|i: i32| -i)
                }
                .map_err(|_| format!("Distance to {} too large", l))?
            }
            Immediate::Immediate(value) => (*value).into(),
        })
    }
}

fn is_space(c: char) -> bool {
    c == ' ' || c == '\t'
}

fn arg_sep(c: char) -> bool {
    c == ',' || is_space(c)
}

fn signed_int(i: &str) -> ParseResult<i32> {
    // Hex for bit patterns, decimal for everything else.
    if let Some(hex) = i.strip_prefix("0x") {
        let loc = hex
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(hex.len());
        let (num, i) = hex.split_at(loc);
        let num = i64::from_str_radix(num, 16)
            .ok()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| format!("\"0x{}\" is not a valid number", num))?;
        return Ok((i, num as i32));
    }
    let loc = i
        .find(|c: char| !c.is_ascii_digit() && c != '+' && c != '-')
        .unwrap_or(i.len());
    let (num, i) = i.split_at(loc);
    let num = num
        .parse()
        .map_err(|_| format!("\"{}\" is not a valid number", num))?;
    Ok((i, num))
}

fn label(i: &str) -> ParseResult<&str> {
    let loc = i.find(|c: char| !c.is_ascii_uppercase()).unwrap_or(i.len());
    if loc == 0 {
        return Err(format!("\"{}\" is not a valid label.", i));
    }
    let (label, i) = i.split_at(loc);
    Ok((i, label))
}

fn in_range(digits: &[u8], range: Range<u32>) -> Result<u32, String> {
    match std::str::from_utf8(digits).unwrap().parse() {
        Ok(i) if range.contains(&i) => Ok(i),
        _ => Err("Invalid register name".to_string()),
    }
}

fn register(i: &str) -> ParseResult<Register> {
    let i = i
        .strip_prefix('$')
        .ok_or_else(|| format!("Expected a register, found \"{}\"", i))?;
    let non_alpha = i.find(|c: char| !c.is_alphanumeric()).unwrap_or(i.len());
    let (reg, i) = i.split_at(non_alpha);
    let reg = match reg.as_bytes() {
        b"zero" => 0,
        b"at" => 1,
        b"k0" => 26,
        b"k1" => 27,
        b"gp" => 28,
        b"sp" => 29,
        b"fp" => 30,
        b"ra" => 31,
        [b'v', digits @ ..] => in_range(digits, 0..2)? + 2,
        [b'a', digits @ ..] => in_range(digits, 0..4)? + 4,
        [b't', digits @ ..] => in_range(digits, 0..10).map(|i| match i {
            0..8 => i + 8,
            8..10 => i + 16,
            _ => unreachable!(),
        })?,
        [b's', digits @ ..] => in_range(digits, 0..8)? + 16,
        digits @ [b'0'..=b'9', ..] => in_range(digits, 0..32)?,
        reg => {
            return Err(format!(
                "Invalid register name {}",
                std::str::from_utf8(reg).unwrap()
            ))
        }
    };
    Ok((i, Register(reg)))
}

fn immediate<T: TryFrom<i32, Error = String>>(i: &str) -> ParseResult<Immediate<'_, T>> {
    if let Ok((i, label)) = label(i) {
        return Ok((i, Immediate::Label(label)));
    }
    let (i, int) = signed_int(i)?;
    let imm = T::try_from(int).map(Immediate::Immediate)?;
    Ok((i, imm))
}

fn instruction(i: &str) -> ParseResult<Instruction> {
    let loc = i.find(is_space).unwrap_or(i.len());
    let (op, i) = i.split_at(loc);
    let i = i.trim_start_matches(is_space);
    Ok(match op {
        // pseudo-instructions
        "nop" => (i, Instruction::Raw { instruction: 0 }),
        "move" => translate_op(i, |rd, rs| Instruction::RType {
            funct: 0b100001,
            source1: rs,
            source2: Register(0),
            destination: rd,
            shift: 0,
        })?,
        "li" => {
            let (i, rt) = register(i)?;
            let i = i.trim_start_matches(arg_sep);
            let (i, imm) = immediate(i)?;
            (
                i,
                Instruction::IType {
                    opcode: 0b001001,
                    source: Register(0),
                    destination: rt,
                    immediate: imm,
                },
            )
        }
        "b" => {
            let (i, imm) = immediate(i)?;
            (
                i,
                Instruction::BranchType {
                    opcode: 0b000100,
                    source1: Register(0),
                    source2: Register(0),
                    immediate: imm,
                },
            )
        }

        // arithmetic and logic
        "add" => r_type(i, 0b100000)?,
        "addu" => r_type(i, 0b100001)?,
        "sub" => r_type(i, 0b100010)?,
        "subu" => r_type(i, 0b100011)?,
        "and" => r_type(i, 0b100100)?,
        "or" => r_type(i, 0b100101)?,
        "xor" => r_type(i, 0b100110)?,
        "nor" => r_type(i, 0b100111)?,
        "slt" => r_type(i, 0b101010)?,
        "sltu" => r_type(i, 0b101011)?,
        "sll" => shift_type(i, 0b000000)?,
        "srl" => shift_type(i, 0b000010)?,
        "sra" => shift_type(i, 0b000011)?,
        "addi" => i_type(i, 0b001000)?,
        "addiu" => i_type(i, 0b001001)?,
        "slti" => i_type(i, 0b001010)?,
        "sltiu" => i_type(i, 0b001011)?,
        "andi" => i_type(i, 0b001100)?,
        "ori" => i_type(i, 0b001101)?,
        "xori" => i_type(i, 0b001110)?,
        "lui" => {
            let (i, rt) = register(i)?;
            let i = i.trim_start_matches(arg_sep);
            let (i, imm) = immediate(i)?;
            (
                i,
                Instruction::IType {
                    opcode: 0b001111,
                    source: Register(0),
                    destination: rt,
                    immediate: imm,
                },
            )
        }

        // memory
        "lb" => mem_type(i, 0b100000)?,
        "lh" => mem_type(i, 0b100001)?,
        "lw" => mem_type(i, 0b100011)?,
        "lbu" => mem_type(i, 0b100100)?,
        "lhu" => mem_type(i, 0b100101)?,
        "sb" => mem_type(i, 0b101000)?,
        "sh" => mem_type(i, 0b101001)?,
        "sw" => mem_type(i, 0b101011)?,

        // control transfer
        "beq" => b_type(i, 0b000100)?,
        "bne" => b_type(i, 0b000101)?,
        "j" => j_type(i, 0b000010)?,
        "jal" => j_type(i, 0b000011)?,
        "jr" => {
            let (i, rs) = register(i)?;
            (
                i,
                Instruction::RType {
                    funct: 0b001000,
                    source1: rs,
                    source2: Register(0),
                    destination: Register(0),
                    shift: 0,
                },
            )
        }
        "teq" => {
            let (i, rs) = register(i)?;
            let i = i.trim_start_matches(arg_sep);
            let (i, rt) = register(i)?;
            (
                i,
                Instruction::RType {
                    funct: 0b110100,
                    source1: rs,
                    source2: rt,
                    destination: Register(0),
                    shift: 0,
                },
            )
        }
        "syscall" => (
            i,
            Instruction::Raw {
                instruction: 0b001100,
            },
        ),
        "break" => (
            i,
            Instruction::Raw {
                instruction: 0b001101,
            },
        ),
        op => return Err(format!("Invalid operation: {}", op)),
    })
}

fn r_type(i: &str, funct: u32) -> ParseResult<Instruction> {
    let (i, rd) = register(i)?;
    let i = i.trim_start_matches(arg_sep);
    let (i, rs) = register(i)?;
    let i = i.trim_start_matches(arg_sep);
    let (i, rt) = register(i)?;
    Ok((
        i,
        Instruction::RType {
            funct,
            source1: rs,
            source2: rt,
            destination: rd,
            shift: 0,
        },
    ))
}

fn shift_type(i: &str, funct: u32) -> ParseResult<Instruction> {
    let (i, rd) = register(i)?;
    let i = i.trim_start_matches(arg_sep);
    let (i, rt) = register(i)?;
    let i = i.trim_start_matches(arg_sep);
    let loc = i.find(|c: char| !c.is_ascii_digit()).unwrap_or(i.len());
    let (digits, i) = i.split_at(loc);
    let shift =
        in_range(digits.as_bytes(), 0..32).map_err(|_| "Invalid shift amount".to_string())?;
    Ok((
        i,
        Instruction::RType {
            funct,
            source1: Register(0),
            source2: rt,
            destination: rd,
            shift,
        },
    ))
}

fn i_type(i: &str, opcode: u32) -> ParseResult<Instruction> {
    let (i, rt) = register(i)?;
    let i = i.trim_start_matches(arg_sep);
    let (i, rs) = register(i)?;
    let i = i.trim_start_matches(arg_sep);
    let (i, imm) = immediate(i)?;
    Ok((
        i,
        Instruction::IType {
            opcode,
            source: rs,
            destination: rt,
            immediate: imm,
        },
    ))
}

fn mem_type(i: &str, opcode: u32) -> ParseResult<Instruction> {
    let (i, rt) = register(i)?;
    let i = i.trim_start_matches(arg_sep);
    let (i, imm) = immediate(i)?;
    let i = i
        .strip_prefix('(')
        .ok_or_else(|| format!("Expected \"(base)\" after the offset, found \"{}\"", i))?;
    let (i, base) = register(i)?;
    let i = i
        .strip_prefix(')')
        .ok_or_else(|| format!("Expected \")\", found \"{}\"", i))?;
    Ok((
        i,
        Instruction::IType {
            opcode,
            source: base,
            destination: rt,
            immediate: imm,
        },
    ))
}

fn b_type(i: &str, opcode: u32) -> ParseResult<Instruction> {
    let (i, rs) = register(i)?;
    let i = i.trim_start_matches(arg_sep);
    let (i, rt) = register(i)?;
    let i = i.trim_start_matches(arg_sep);
    let (i, imm) = immediate(i)?;
    Ok((
        i,
        Instruction::BranchType {
            opcode,
            source1: rs,
            source2: rt,
            immediate: imm,
        },
    ))
}

fn j_type(i: &str, opcode: u32) -> ParseResult<Instruction> {
    let (i, target) = immediate(i)?;
    Ok((i, Instruction::JType { opcode, target }))
}

fn translate_op<'a>(
    i: &'a str,
    f: fn(rd: Register, rs: Register) -> Instruction<'static>,
) -> ParseResult<'a, Instruction<'a>> {
    let (i, rd) = register(i)?;
    let i = i.trim_start_matches(arg_sep);
    let (i, rs) = register(i)?;
    Ok((i, f(rd, rs)))
}

fn program(i: &str) -> ParseResult<Program<'_>> {
    let mut instructions = Vec::new();
    let mut labels = HashMap::new();
    for (row, line) in i.lines().enumerate() {
        let loc = instructions
            .len()
            .checked_shl(2)
            .ok_or_else(|| "Too many instructions.".to_string())?;
        // Everything after a # is a comment.
        let line = line.split('#').next().unwrap_or("").trim();
        let mut split = line.rsplitn(2, ':');
        let inst = split.next().unwrap();
        let l = split.next();
        if let Some(l) = l {
            let (i, l) = label(l)?;
            if !i.trim().is_empty() {
                return Err(format!("Unexpected characters \"{}\" on line {}.", i, row));
            }
            if labels.insert(l, loc).is_some() {
                return Err(format!("Duplicate label {} on line {}.", l, row));
            }
        }
        let inst = inst.trim_start_matches(is_space);
        if !inst.is_empty() {
            let (i, inst) = instruction(inst)?;
            if !i.trim().is_empty() {
                return Err(format!("Unexpected characters \"{}\" on line {}.", i, row));
            }
            instructions.push(inst);
        }
    }
    Ok((
        i,
        Program {
            instructions,
            labels,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_simple() {
        let program = assemble(
            "
            LOOP:
            addi $1, $1, 1
            j LOOP
            ",
        )
        .unwrap();
        assert_eq!(
            program,
            vec![
                0b001000_00001_00001_0000000000000001,
                0b000010_00000000000000000000000000,
            ]
        )
    }

    #[test]
    fn registers_by_name_and_number() {
        let program = assemble("add $t2, $t0, $9").unwrap();
        assert_eq!(program, vec![0b000000_01000_01001_01010_00000_100000]);
    }

    #[test]
    fn memory_operands() {
        let program = assemble("lw $t0, 8($sp)").unwrap();
        assert_eq!(program, vec![0b100011_11101_01000_0000000000001000]);
    }

    #[test]
    fn hex_immediates() {
        let program = assemble("ori $8, $8, 0xffff").unwrap();
        assert_eq!(program, vec![0b001101_01000_01000_1111111111111111]);
    }

    #[test]
    fn branches_count_words_from_the_next_instruction() {
        let program = assemble(
            "
            LOOP:
            addi $1, $1, -1
            bne $1, $0, LOOP
            ",
        )
        .unwrap();
        assert_eq!(program[1], 0b000101_00001_00000_1111111111111110);
    }

    #[test]
    fn comments_and_inline_labels() {
        let program = assemble("START: nop # does nothing\nj START").unwrap();
        assert_eq!(program, vec![0, 0b000010_00000000000000000000000000]);
    }

    #[test]
    fn immediates_out_of_range_are_rejected() {
        assert!(assemble("addi $1, $1, 0x10000").is_err());
    }

    #[test]
    fn undefined_labels_are_reported() {
        assert!(assemble("j NOWHERE").is_err());
    }
}
