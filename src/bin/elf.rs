use elf::{abi::PT_LOAD, endian::BigEndian, ElfBytes};
use mips::Computer;
use std::{env, fs};

fn main() {
    let args = env::args().collect::<Vec<_>>();
    let file = fs::read(&args[1]).unwrap();
    let elf = ElfBytes::<BigEndian>::minimal_parse(&file).unwrap();
    let mut computer = Computer::new(0x1_000_000);
    for segment in elf.segments().unwrap().iter() {
        if segment.p_type == PT_LOAD {
            let data = elf.segment_data(&segment).unwrap();
            computer.memory.main[segment.p_paddr as usize..][..data.len()].copy_from_slice(data);
        }
    }
    computer.core.program_counter = elf.ehdr.e_entry as u32;
    computer.run().unwrap();
}
