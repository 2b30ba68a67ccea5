use mips::{assembler::assemble, Computer};
use std::{env, fs};

fn main() {
    let args = env::args().collect::<Vec<_>>();
    let assembly = fs::read_to_string(&args[1]).unwrap();
    let program = assemble(&assembly).unwrap();
    let mut computer = Computer::new(args[2].parse().unwrap());
    computer.load_program(program);
    computer.run().unwrap();
}
