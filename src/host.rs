//! The host side of the engine boundary
//!
//! The engine calls back into its [`Host`] for exactly three things: the
//! syscall instruction, the halt instruction, and illegal-instruction
//! termination. [`Console`] is the reference host: it implements the three
//! standard syscalls and stages the program's arguments and environment
//! above the top of stack the way the `oios` loader expects.

use queues::{IsQueue, Queue};

use crate::memory::{ImageWidth, Ram, Wordsize, NATIVE_WIDTH};
use crate::registers::{Registers, RARG1};
use crate::utils::{interpret_u64_as_signed, sign_extend_width};

/// Callbacks the engine makes into its host
pub trait Host {
    /// The syscall opcode hands the host the 6-bit id and the machine
    /// state. Setting RPC here redirects execution (the reference exit
    /// syscall sets RPC to 0, where a zero word halts).
    fn syscall(
        &mut self,
        id: u8,
        regs: &mut Registers,
        ram: &mut Ram,
        image_width: ImageWidth,
    );

    /// Called when the halt instruction executes, before the engine
    /// leaves its loop
    fn halt(&mut self) {}

    /// Called on an illegal instruction, after the diagnostic
    fn hard_termination(&mut self) {}
}

pub const SYSCALL_EXIT: u8 = 0;
pub const SYSCALL_PRINT_STRING: u8 = 1;
pub const SYSCALL_PRINT_INTEGER: u8 = 2;

/// Reference host: console output syscalls with a drainable buffer
#[derive(Default)]
pub struct Console {
    output: Queue<char>,
    halted: bool,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    /// Return the buffered guest output and clear the buffer
    pub fn flush_output(&mut self) -> String {
        let mut output = String::new();
        while let Ok(ch) = self.output.remove() {
            output.push(ch);
        }
        output
    }

    fn emit(&mut self, text: &str) {
        for ch in text.chars() {
            self.output.add(ch).expect("insert into queue should work");
        }
    }
}

impl Host for Console {
    fn syscall(
        &mut self,
        id: u8,
        regs: &mut Registers,
        ram: &mut Ram,
        image_width: ImageWidth,
    ) {
        match id {
            SYSCALL_EXIT => {
                // address 0 holds a zero word, so the next fetch halts
                regs.set_pc(0);
            }
            SYSCALL_PRINT_STRING => {
                let mut addr = regs.read(RARG1);
                for _ in 0..ram.size() {
                    let byte = ram.read_byte(addr);
                    if byte == 0 {
                        break;
                    }
                    self.output
                        .add(byte as char)
                        .expect("insert into queue should work");
                    addr = addr.wrapping_add(1);
                }
            }
            SYSCALL_PRINT_INTEGER => {
                let value = interpret_u64_as_signed(sign_extend_width(
                    regs.read(RARG1),
                    image_width.width(),
                ));
                self.emit(&value.to_string());
            }
            _ => self.emit("unhandled syscall!\n"),
        }
    }

    fn halt(&mut self) {
        self.halted = true;
    }
}

fn round_up(x: u64, multiple: u64) -> u64 {
    if multiple == 0 {
        return x;
    }
    let remainder = x % multiple;
    if remainder == 0 {
        x
    } else {
        x + multiple - remainder
    }
}

/// Bytes needed above the top of stack for the argument/environment region
pub fn args_region_size(appname: &str, args: &[String]) -> u64 {
    let mut len = 6 * NATIVE_WIDTH + 1 + appname.len() as u64;
    for arg in args {
        len += NATIVE_WIDTH + 1 + arg.len() as u64;
    }
    round_up(len, NATIVE_WIDTH)
}

/// Write the argument and environment region at the top of RAM.
///
/// Layout, in native words from `ram_size - head_len`: argc, argv pointer,
/// env pointer, the argv entries, a zero terminator for argv, a zero
/// terminator for the (empty) environment, then the NUL-terminated strings.
/// Returns `head_len`; the initial stack pointer sits just below the region.
pub fn stage_arguments(
    ram: &mut Ram,
    ram_size: u64,
    appname: &str,
    args: &[String],
) -> u64 {
    let head_len = args_region_size(appname, args);
    let argc = 1 + args.len() as u64;

    let mut offset = ram_size - head_len;
    ram.write(offset, argc, Wordsize::Qword);
    offset += NATIVE_WIDTH;

    // past the argv and env pointer slots to the argv array itself
    let argv = offset + 2 * NATIVE_WIDTH;
    ram.write(offset, argv, Wordsize::Qword);
    offset += NATIVE_WIDTH;

    let env = offset + (argc + 2) * NATIVE_WIDTH;
    ram.write(offset, env, Wordsize::Qword);
    offset += NATIVE_WIDTH;

    // strings go after the env terminator word
    let mut strings = env + NATIVE_WIDTH;
    for text in std::iter::once(appname).chain(args.iter().map(String::as_str)) {
        ram.write(offset, strings, Wordsize::Qword);
        offset += NATIVE_WIDTH;
        ram.load(strings, text.as_bytes());
        ram.write_byte(strings + text.len() as u64, 0);
        strings += 1 + text.len() as u64;
    }

    ram.write(offset, 0, Wordsize::Qword); // argv terminator
    offset += NATIVE_WIDTH;
    ram.write(offset, 0, Wordsize::Qword); // env terminator

    head_len
}
