use mips::{assembler::assemble, Computer};

fn main() {
    let instructions = assemble(&std::fs::read_to_string("./res/faults.mips").unwrap()).unwrap();
    let mut computer = Computer::new(0x10000);
    computer.load_program(instructions);
    computer.run().unwrap();
}
