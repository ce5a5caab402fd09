//! The OneImage execution engine
//!
//! [`Machine`] owns the register file and the RAM arena and interprets the
//! instruction stream at RPC until a halt. Dispatch is a single match over
//! the first opcode byte: the low two bits give the length class, and
//! multi-byte instructions sub-dispatch on the function, register and width
//! fields of their second byte. Handlers that transfer control set RPC
//! themselves; for everything else RPC advances by the instruction length
//! after the handler runs.
//!
//! A handful of first-byte values that would encode nonsense operations
//! (shifting RPC, writing RZERO) are reassigned to standalone instructions;
//! the match arms below reproduce that override table exactly.

use itertools::Itertools;
use thiserror::Error;

use crate::disasm::disassemble;
use crate::fields::{funct, length_class, reg, width};
use crate::host::Host;
use crate::memory::{ImageWidth, Ram, Wordsize, NATIVE_WIDTH};
use crate::ops::{signed_div, MathOp, Relation};
use crate::registers::{Registers, RARG1, RARG2, RPC, RRES, RTMP, RZERO};
use crate::trace::TraceLog;
use crate::utils::{interpret_u64_as_signed, sign_extend_bits, sign_extend_width};

/// Total RAM backing the engine. Images see at most this much, and 2-byte
/// width images see at most 64 KiB of it.
pub const RAM_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("illegal instruction. op {op:02x}, op1 {op1:02x}")]
    IllegalInstruction {
        op: u8,
        op1: u8,
        /// Instructions dispatched by the failed call, the illegal one
        /// included: 1 from `step`, the full run count from `execute`
        instructions: u32,
    },
}

/// Outcome of executing one instruction
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Step {
    Continue,
    Halt,
}

/// What the dispatched handler decided about RPC
enum Flow {
    /// RPC advances by the instruction length
    Next,
    /// The handler wrote RPC itself
    Taken,
    /// Halt instruction: leave RPC alone and stop the loop
    Halt,
}

pub struct Machine<H: Host> {
    regs: Registers,
    ram: Ram,
    image_width: ImageWidth,
    host: H,
    trace: Option<TraceLog>,
}

impl<H: Host> Machine<H> {
    pub fn new(host: H) -> Self {
        Self {
            regs: Registers::default(),
            ram: Ram::default(),
            image_width: ImageWidth::default(),
            host,
            trace: None,
        }
    }

    /// RAM available to an image of the given width
    pub fn available_ram(image_width: ImageWidth) -> u64 {
        if image_width == ImageWidth::Two {
            RAM_SIZE.min(65536)
        } else {
            RAM_SIZE
        }
    }

    /// Zero all state, allocate `mem_size` bytes of RAM, set the initial
    /// program counter and stack pointer, and push the two sentinel words
    /// (return address 0 and saved frame 0). A return to address 0 lands
    /// on the zero word there and halts.
    pub fn reset(&mut self, mem_size: u64, pc: u64, sp: u64, image_width: ImageWidth) {
        self.image_width = image_width;
        self.ram = Ram::new(mem_size as usize, image_width);
        self.regs.zero_all();
        self.regs.set_pc(pc);
        self.regs.set_sp(sp);
        self.push(0); // saved rframe
        self.push(0); // return address: a halt instruction
        self.regs.set_frame(self.regs.sp().wrapping_sub(NATIVE_WIDTH));
    }

    pub fn regs(&self) -> &Registers {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut Ram {
        &mut self.ram
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn image_width(&self) -> ImageWidth {
        self.image_width
    }

    /// Enable or disable per-instruction tracing
    pub fn trace_instructions(&mut self, log: Option<TraceLog>) {
        self.trace = log;
    }

    /// Run until a halt instruction. Returns the number of instructions
    /// executed, including the final halt. An illegal instruction counts
    /// too; the error carries the total.
    pub fn execute(&mut self) -> Result<u32, VmError> {
        let mut instruction_count = 0;
        loop {
            instruction_count += 1;
            match self.step() {
                Ok(Step::Continue) => {}
                Ok(Step::Halt) => return Ok(instruction_count),
                Err(VmError::IllegalInstruction { op, op1, .. }) => {
                    return Err(VmError::IllegalInstruction {
                        op,
                        op1,
                        instructions: instruction_count,
                    })
                }
            }
        }
    }

    /// Fetch, decode and execute the instruction at RPC
    pub fn step(&mut self) -> Result<Step, VmError> {
        debug_assert_eq!(self.regs.read(RZERO), 0);
        debug_assert_eq!(self.ram.read_img(0, self.image_width), 0);

        if self.trace.is_some() {
            self.trace_state();
        }

        let op = self.opcode_byte(0);
        let flow = match op {
            0x00 => {
                self.host.halt();
                Flow::Halt
            }
            // one-byte overrides of inc/dec/push/pop/zero/shl/shr/inv
            0x08 => {
                self.regs.set_res(0);
                self.do_ret();
                Flow::Taken
            }
            0x20 => {
                let val = self.pop();
                let product = interpret_u64_as_signed(val)
                    .wrapping_mul(interpret_u64_as_signed(self.regs.res()));
                self.regs.set_res(product as u64);
                Flow::Next
            }
            0x28 => {
                self.regs.set_res(self.regs.res() << self.image_width.shift());
                Flow::Next
            }
            0x48 => {
                self.regs.set_res(0);
                let pc = self.pop();
                self.regs.set_pc(pc);
                Flow::Taken
            }
            0x60 => {
                // pop rzero discards the top of stack
                self.pop();
                Flow::Next
            }
            0x68 => {
                let pc = self.pop();
                self.regs.set_pc(pc);
                Flow::Taken
            }
            0x80 => {
                let val = self.pop();
                self.regs.set_res(val.wrapping_sub(self.regs.res()));
                Flow::Next
            }
            0x84 => {
                self.regs.set_res(self.image_width.width());
                Flow::Next
            }
            0x88 => {
                self.regs.set_res(self.regs.res() >> self.image_width.shift());
                Flow::Next
            }
            0xa0 => {
                let val = self.pop();
                self.regs.set_res(self.regs.res().wrapping_add(val));
                Flow::Next
            }
            0xa8 => {
                let val = self.pop();
                self.regs.set_res(signed_div(val, self.regs.res()));
                Flow::Next
            }
            0xc0 => {
                self.do_ret();
                Flow::Taken
            }
            0xc8 => {
                self.regs.set_res(NATIVE_WIDTH);
                Flow::Next
            }
            0xe0 => {
                let val = self.pop();
                self.regs.set_res(self.regs.res() & val);
                Flow::Next
            }
            0xa3 => {
                // cpuinfo: version in rres, two ASCII ID chars in rtmp
                self.regs.set_res(1);
                self.regs.write(RTMP, u64::from(b'd') | (u64::from(b'l') << 8));
                Flow::Next
            }
            // encodings with no assigned operation
            0x02 | 0x21 | 0x22 | 0x43 | 0xa4 | 0xc1 | 0xc4 | 0xe4 | 0xe8 => {
                return Err(self.illegal_instruction(op));
            }
            _ => match op & 3 {
                0 => self.exec_single(op),
                1 => self.exec_pair(op),
                2 => self.exec_immediate(op),
                _ => self.exec_wide(op),
            },
        };

        match flow {
            Flow::Next => {
                self.regs.add(RPC, self.instruction_length(op));
                Ok(Step::Continue)
            }
            Flow::Taken => Ok(Step::Continue),
            Flow::Halt => Ok(Step::Halt),
        }
    }

    /// Instruction byte length: the length class, except that class-3
    /// instructions carry an image-width immediate
    fn instruction_length(&self, op: u8) -> u64 {
        let class = length_class(op);
        if class == 3 {
            1 + self.image_width.width()
        } else {
            class
        }
    }

    // --- fetch and stack primitives ---

    fn opcode_byte(&self, offset: u64) -> u8 {
        self.ram.read_byte(self.regs.pc().wrapping_add(offset))
    }

    /// Signed 16-bit value in bytes 2..3 of a four-byte instruction
    fn value16(&self) -> i64 {
        let raw = self.ram.read(self.regs.pc().wrapping_add(2), Wordsize::Word);
        i64::from(raw as u16 as i16)
    }

    fn push(&mut self, value: u64) {
        let sp = self.regs.sp().wrapping_sub(NATIVE_WIDTH);
        self.regs.set_sp(sp);
        self.ram.write(sp, value, Wordsize::Qword);
    }

    fn pop(&mut self) -> u64 {
        let sp = self.regs.sp();
        let value = self.ram.read(sp, Wordsize::Qword);
        self.regs.set_sp(sp.wrapping_add(NATIVE_WIDTH));
        value
    }

    fn do_ret(&mut self) {
        let pc = self.pop();
        self.regs.set_pc(pc);
        let frame = self.pop();
        self.regs.set_frame(frame);
    }

    /// Native address of a frame slot. Offsets >= 0 step over the saved
    /// return address and frame pointer to reach the caller's arguments;
    /// offsets < 0 reach the locals below the frame pointer.
    fn frame_offset(&self, offset: i64) -> u64 {
        let bias = if offset >= 0 { 3 } else { 1 };
        self.regs
            .frame()
            .wrapping_add_signed(NATIVE_WIDTH as i64 * (offset + bias))
    }

    /// Sign-extend a 3-bit register field to a frame offset of -4..3
    fn frame_field(r: usize) -> i64 {
        interpret_u64_as_signed(sign_extend_bits(r as u64, 3))
    }

    /// A taken branch whose pc offset is 0..3 is really a return variant:
    /// 0 = ret, 1 = retnf, 2 = ret0, 3 = ret0nf
    fn branch_to(&mut self, ival: i64) {
        if (0..=3).contains(&ival) {
            let pc = self.pop();
            self.regs.set_pc(pc);
            if ival & 1 == 0 {
                let frame = self.pop();
                self.regs.set_frame(frame);
            }
            if ival >= 2 {
                self.regs.set_res(0);
            }
        } else {
            self.regs.set_pc(self.regs.pc().wrapping_add_signed(ival));
        }
    }

    fn check(&self, left: u64, right: u64, rel_funct: u8) -> bool {
        Relation::from_funct(rel_funct).check(left, right, self.image_width)
    }

    fn illegal_instruction(&mut self, op: u8) -> VmError {
        let op1 = self.opcode_byte(1);
        eprintln!("illegal instruction. op {op:02x}, op1 {op1:02x}");
        eprint!("{}", self.regs);
        self.host.hard_termination();
        VmError::IllegalInstruction {
            op,
            op1,
            instructions: 1,
        }
    }

    // --- one-byte instructions ---

    fn exec_single(&mut self, op: u8) -> Flow {
        let r = reg(op);
        match funct(op) {
            0 => self.regs.add(r, 1),
            1 => self.regs.add(r, u64::MAX),
            2 => {
                let value = self.regs.read(r);
                self.push(value);
            }
            3 => {
                let value = self.pop();
                self.regs.write(r, value);
            }
            4 => self.regs.write(r, 0),
            5 => self.regs.write(r, self.regs.read(r) << 1),
            6 => self.regs.write(r, self.regs.read(r) >> 1),
            _ => self.regs.write(r, u64::from(self.regs.read(r) == 0)),
        }
        Flow::Next
    }

    // --- two-byte instructions ---

    fn exec_pair(&mut self, op: u8) -> Flow {
        let op1 = self.opcode_byte(1);
        let dst = reg(op);
        let src = reg(op1);
        let funct1 = funct(op1);
        match funct(op) {
            0 => {
                let result = MathOp::from_funct(funct1)
                    .eval(self.regs.read(dst), self.regs.read(src));
                self.regs.write(dst, result);
                Flow::Next
            }
            1 => {
                // relation ne is the unconditional mov spelling
                if funct1 == Relation::Ne.funct()
                    || self.check(self.regs.read(dst), self.regs.read(src), funct1)
                {
                    self.regs.write(dst, self.regs.read(src));
                }
                Flow::Next
            }
            2 => {
                let val = self.pop();
                let result = self.check(val, self.regs.read(src), funct1);
                self.regs.write(dst, u64::from(result));
                Flow::Next
            }
            3 => self.exec_micro(op, op1),
            4 => self.exec_stack_ops(op, op1),
            5 => {
                let ws = Wordsize::from_field(width(op1));
                match funct1 {
                    0 => {
                        let addr = self.regs.read(dst);
                        self.ram.write(addr, self.regs.read(src), ws);
                    }
                    1 => {
                        let value = self.ram.read(self.regs.read(src), ws);
                        self.regs.write(dst, value);
                    }
                    2 => {
                        self.push(self.regs.read(dst));
                        self.push(self.regs.read(src));
                    }
                    _ => {
                        let value = self.pop();
                        self.regs.write(dst, value);
                        let value = self.pop();
                        self.regs.write(src, value);
                    }
                }
                Flow::Next
            }
            6 => {
                self.regs.write(dst, self.regs.read(src));
                Flow::Next
            }
            _ => {
                let val = self.pop();
                let result =
                    MathOp::from_funct(funct1).eval(val, self.regs.read(src));
                self.regs.write(dst, result);
                Flow::Next
            }
        }
    }

    /// Two-byte group 3: frame access and the memory micro-operations
    fn exec_micro(&mut self, op: u8, op1: u8) -> Flow {
        let dst = reg(op);
        match funct(op1) {
            0 => {
                let addr = self.frame_offset(Self::frame_field(reg(op1)));
                let value = self.ram.read(addr, Wordsize::Qword);
                self.regs.write(dst, value);
            }
            1 => {
                let addr = self.frame_offset(Self::frame_field(reg(op1)));
                self.ram.write(addr, self.regs.read(dst), Wordsize::Qword);
            }
            2 => {
                // ret x: also discard 1 + reg(op1) stack slots
                self.do_ret();
                let extra = NATIVE_WIDTH * (1 + reg(op1) as u64);
                self.regs.set_sp(self.regs.sp().wrapping_add(extra));
                return Flow::Taken;
            }
            3 => {
                let value = sign_extend_bits(u64::from(op1) & 0x1f, 5);
                self.regs.write(dst, value);
            }
            4 => self.exec_signex(op, op1),
            5 => self.exec_memf(op1),
            6 => self.exec_stadd(op1),
            _ => {
                let divisor = self.regs.read(reg(op1));
                if divisor == 0 {
                    self.push(0);
                } else {
                    let dividend = self.regs.read(dst);
                    self.regs.write(dst, dividend % divisor);
                    self.push(dividend / divisor);
                }
            }
        }
        Flow::Next
    }

    fn exec_signex(&mut self, op: u8, op1: u8) {
        let dst = reg(op);
        let value = self.regs.read(dst);
        let extended = match width(op1) {
            0 => sign_extend_width(value, 1),
            1 => sign_extend_width(value, 2),
            2 => sign_extend_width(value, 4),
            _ => value,
        };
        self.regs.write(dst, extended);
    }

    /// memf: fill rarg2 elements with rtmp, starting rres elements into
    /// the array at rarg1. Only the element width comes from the opcode.
    fn exec_memf(&mut self, op1: u8) {
        let ws = Wordsize::from_field(width(op1));
        let size = ws.width();
        let base = self
            .regs
            .read(RARG1)
            .wrapping_add(self.regs.read(RRES).wrapping_mul(size));
        let count = self.regs.read(RARG2).min(self.ram.size() as u64);
        let value = self.regs.read(RTMP);
        for n in 0..count {
            self.ram.write(base.wrapping_add(n * size), value, ws);
        }
    }

    /// stadd: zero every rarg2-th element of the array at rarg1 from
    /// element rtmp up to and including element rres
    fn exec_stadd(&mut self, op1: u8) {
        let ws = Wordsize::from_field(width(op1));
        let size = ws.width();
        let base = self.regs.read(RARG1);
        let stride = self.regs.read(RARG2);
        let limit = self.regs.read(RRES);
        let mut cur = self.regs.read(RTMP);
        loop {
            self.ram.write(base.wrapping_add(cur.wrapping_mul(size)), 0, ws);
            if stride == 0 {
                break;
            }
            cur = cur.wrapping_add(stride);
            if cur > limit {
                break;
            }
        }
    }

    /// Two-byte group 4: syscall, frame push and stack-addressed stores
    fn exec_stack_ops(&mut self, op: u8, op1: u8) -> Flow {
        let dst = reg(op);
        match funct(op1) {
            0 => {
                let id = ((reg(op) << 3) | reg(op1)) as u8;
                let pc_before = self.regs.pc();
                self.host.syscall(
                    id,
                    &mut self.regs,
                    &mut self.ram,
                    self.image_width,
                );
                if self.regs.pc() != pc_before {
                    return Flow::Taken;
                }
            }
            1 => {
                let addr = self.frame_offset(Self::frame_field(reg(op1)));
                let value = self.ram.read(addr, Wordsize::Qword);
                self.push(value);
            }
            2 => {
                let addr = self.pop();
                self.ram.write_img(addr, self.regs.read(dst), self.image_width);
            }
            3 => match width(op1) {
                0 => self.regs.add(dst, self.image_width.width()),
                1 => self
                    .regs
                    .write(dst, self.regs.read(dst).wrapping_sub(self.image_width.width())),
                _ => {}
            },
            4 => {
                let ws = Wordsize::from_field(width(op1));
                let addr = self.regs.read(dst);
                self.ram.write(addr, self.regs.read(reg(op1)), ws);
                self.regs.add(dst, ws.width());
            }
            5 => {
                let a = self.regs.read(dst);
                let b = self.regs.read(reg(op1));
                self.regs.write(dst, b);
                self.regs.write(reg(op1), a);
            }
            6 => match width(op1) {
                0 => self.regs.add(dst, NATIVE_WIDTH),
                1 => self
                    .regs
                    .write(dst, self.regs.read(dst).wrapping_sub(NATIVE_WIDTH)),
                _ => {}
            },
            _ => {}
        }
        Flow::Next
    }

    // --- (1 + image width)-byte instructions ---

    fn exec_immediate(&mut self, op: u8) -> Flow {
        let iw = self.image_width;
        let r = reg(op);
        let imm = self.ram.read_img(self.regs.pc().wrapping_add(1), iw);
        match funct(op) {
            0 => {
                let value = self.ram.read_img(imm, iw);
                self.regs.write(r, value);
            }
            1 => self.regs.write(r, imm),
            2 => self.ram.write_img(imm, self.regs.read(r), iw),
            3 => {
                self.regs.set_pc(imm.wrapping_add(self.regs.read(r)));
                return Flow::Taken;
            }
            4 => {
                let addr = imm.wrapping_add(self.regs.read(r));
                let value = self.ram.read(addr, iw.wordsize());
                self.ram.write(addr, value.wrapping_add(1), iw.wordsize());
            }
            5 => {
                let addr = imm.wrapping_add(self.regs.read(r));
                let value = self.ram.read(addr, iw.wordsize());
                self.ram.write(addr, value.wrapping_sub(1), iw.wordsize());
            }
            6 => {
                let addr =
                    imm.wrapping_add(iw.width().wrapping_mul(self.regs.read(r)));
                let value = self.ram.read_img(addr, iw);
                self.regs.set_res(value);
            }
            _ => {
                self.push(self.regs.frame());
                self.push(self.regs.pc().wrapping_add(1 + iw.width()));
                self.regs.set_frame(self.regs.sp().wrapping_sub(NATIVE_WIDTH));
                self.regs.set_pc(
                    imm.wrapping_add(iw.width().wrapping_mul(self.regs.read(r))),
                );
                return Flow::Taken;
            }
        }
        Flow::Next
    }

    // --- four-byte instructions ---

    fn exec_wide(&mut self, op: u8) -> Flow {
        let op1 = self.opcode_byte(1);
        match funct(op) {
            0 => self.exec_branch(op, op1),
            1 => {
                let ws = Wordsize::from_field(width(op1));
                let addr = self.regs.read(reg(op));
                self.ram.write(addr, self.value16() as u64, ws);
                self.regs.add(reg(op), ws.width());
                Flow::Next
            }
            2 => {
                let ws = Wordsize::from_field(width(op1));
                let addr = self
                    .regs
                    .read(reg(op1))
                    .wrapping_add(self.regs.pc())
                    .wrapping_add_signed(self.value16());
                let value = self.ram.read(addr, ws);
                self.regs.write(reg(op), value);
                self.regs.add(reg(op1), ws.width());
                Flow::Next
            }
            3 => self.exec_call_indirect(op, op1),
            4 => {
                let ws = Wordsize::from_field(width(op1));
                let base = self.regs.pc().wrapping_add_signed(self.value16());
                let addr = base.wrapping_add(self.regs.read(reg(op1)) << width(op1));
                self.ram.write(addr, self.regs.read(reg(op)), ws);
                Flow::Next
            }
            5 => {
                match funct(op1) {
                    2 => self.regs.write(reg(op), self.value16() as u64),
                    f => {
                        if f == 1 {
                            self.regs.add(reg(op1), 1);
                        }
                        let ws = Wordsize::from_field(width(op1));
                        let addr = self
                            .regs
                            .pc()
                            .wrapping_add_signed(self.value16())
                            .wrapping_add(self.regs.read(reg(op1)) << width(op1));
                        let value = self.ram.read(addr, ws);
                        self.regs.write(reg(op), value);
                    }
                }
                Flow::Next
            }
            6 => self.exec_indexed(op, op1),
            _ => {
                // cstf: conditionally store the left register to a frame slot
                let value = self.regs.read(reg(op));
                if self.check(value, self.regs.read(reg(op1)), funct(op1)) {
                    let op2 = self.opcode_byte(2);
                    let addr = self.frame_offset(Self::frame_field(reg(op2)));
                    self.ram.write(addr, value, Wordsize::Qword);
                }
                Flow::Next
            }
        }
    }

    /// Four-byte group 0: the branch family. The width field of the second
    /// byte picks the comparison source; a taken branch with pc offset 0..3
    /// is a return variant.
    fn exec_branch(&mut self, op: u8, op1: u8) -> Flow {
        let left = self.regs.read(reg(op));
        let rel = funct(op1);
        match width(op1) {
            0 => {
                if self.check(left, self.regs.read(reg(op1)), rel) {
                    self.branch_to(self.value16());
                    return Flow::Taken;
                }
            }
            1 => {
                let right = 1 + reg(op1) as u64;
                if self.check(left, right, rel) {
                    self.branch_to(self.value16());
                    return Flow::Taken;
                }
            }
            2 => {
                let addr = self
                    .regs
                    .read(reg(op1))
                    .wrapping_add(u64::from(self.opcode_byte(2)));
                let right = u64::from(self.ram.read_byte(addr));
                if self.check(left, right, rel) {
                    let ival = i64::from(self.opcode_byte(3) as i8);
                    self.branch_to(ival);
                    return Flow::Taken;
                }
            }
            _ => {
                let addr = self
                    .regs
                    .read(reg(op1))
                    .wrapping_add(u64::from(self.opcode_byte(2)));
                let right = self.ram.read_img(addr, self.image_width);
                if self.check(left, right, rel) {
                    let ival = i64::from(self.opcode_byte(3) as i8);
                    self.branch_to(ival);
                    return Flow::Taken;
                }
            }
        }
        Flow::Next
    }

    /// Four-byte group 3: calls through a pc-relative function pointer
    /// table, and the frameless direct variant
    fn exec_call_indirect(&mut self, op: u8, op1: u8) -> Flow {
        let iw = self.image_width;
        let slot = self
            .regs
            .pc()
            .wrapping_add_signed(self.value16())
            .wrapping_add(iw.width().wrapping_mul(self.regs.read(reg(op))));
        let return_address = self.regs.pc().wrapping_add(4);
        match funct(op1) {
            0 => {
                self.push(self.regs.frame());
                self.push(return_address);
                self.regs.set_frame(self.regs.sp().wrapping_sub(NATIVE_WIDTH));
                let target = self.ram.read_img(slot, iw);
                self.regs.set_pc(target);
            }
            1 => {
                self.push(return_address);
                let target = self.ram.read_img(slot, iw);
                self.regs.set_pc(target);
            }
            _ => {
                self.push(return_address);
                self.regs.set_pc(slot);
            }
        }
        Flow::Taken
    }

    /// Four-byte group 6: pc-relative loads/stores, three-register math
    /// and compare, and the indexed array operations
    fn exec_indexed(&mut self, op: u8, op1: u8) -> Flow {
        let ws = Wordsize::from_field(width(op1));
        let size = ws.width();
        match funct(op1) {
            0 => {
                if reg(op) != RZERO {
                    let addr = self.regs.pc().wrapping_add_signed(self.value16());
                    let value = self.ram.read(addr, ws);
                    self.regs.write(reg(op), value);
                }
            }
            1 => {
                let addr = self.regs.pc().wrapping_add_signed(self.value16());
                let raw = ((reg(op) << 3) | reg(op1)) as u64;
                let value = sign_extend_bits(raw, 6);
                self.ram.write(addr, value, ws);
            }
            2 => {
                if reg(op) != RZERO {
                    let op2 = self.opcode_byte(2);
                    let result = MathOp::from_funct(funct(op2))
                        .eval(self.regs.read(reg(op1)), self.regs.read(reg(op2)));
                    self.regs.write(reg(op), result);
                }
            }
            3 => {
                if reg(op) != RZERO {
                    let op2 = self.opcode_byte(2);
                    let result = self.check(
                        self.regs.read(reg(op1)),
                        self.regs.read(reg(op2)),
                        funct(op2),
                    );
                    self.regs.write(reg(op), u64::from(result));
                }
            }
            4 => {
                // fzero: scan for a zero element, bounded by the 16-bit max
                let limit = self.value16() as u64 & 0xffff;
                let base = self.regs.read(reg(op1));
                let mut index = self.regs.read(reg(op));
                while index < limit
                    && self.ram.read(base.wrapping_add(index * size), ws) != 0
                {
                    index += 1;
                }
                self.regs.write(reg(op), index);
            }
            5 => {
                let base = self.regs.read(reg(op));
                let index = self.regs.read(reg(op1));
                let addr = base.wrapping_add(index.wrapping_mul(size));
                self.ram.write(addr, self.value16() as u64, ws);
            }
            6 => {
                let base = self.regs.read(reg(op));
                let index = self.regs.read(reg(op1));
                let op2 = self.opcode_byte(2);
                let addr = base.wrapping_add(index.wrapping_mul(size));
                self.ram.write(addr, self.regs.read(reg(op2)), ws);
            }
            _ => {
                let base = self.regs.read(reg(op1));
                let op2 = self.opcode_byte(2);
                let index = self.regs.read(reg(op2));
                let addr = base.wrapping_add(index.wrapping_mul(size));
                let raw = self.ram.read(addr, ws);
                let value = sign_extend_width(raw, size);
                self.regs.write(reg(op), value);
            }
        }
        Flow::Next
    }

    /// Emit one trace line: pc, the four bytes at pc, the working
    /// registers, top of stack, and the disassembly
    fn trace_state(&mut self) {
        let pc = self.regs.pc();
        // nine bytes cover the longest instruction (8-byte-width immediate)
        let bytes = (0..9).map(|n| self.opcode_byte(n)).collect::<Vec<_>>();
        let rendered = bytes[..4].iter().map(|b| format!("{b:02x}")).join(" ");
        let tos = self.ram.read(self.regs.sp(), Wordsize::Qword);
        let text = disassemble(&bytes, pc, self.image_width)
            .unwrap_or_else(|| "???".to_string());
        let line = format!(
            "rpc {pc:08x} {rendered} rres {:x} rtmp {:x} rarg1 {:x} rarg2 {:x} rframe {:x} rsp {:x} tos {tos:x} : {text}",
            self.regs.res(),
            self.regs.read(RTMP),
            self.regs.read(RARG1),
            self.regs.read(RARG2),
            self.regs.frame(),
            self.regs.sp(),
        );
        if let Some(log) = &mut self.trace {
            log.line(&line);
        }
    }
}
