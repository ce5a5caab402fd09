//! Disassembler
//!
//! Renders one instruction as text for the trace facility. The mnemonics
//! follow the assembler's vocabulary; the exact strings are a debugging
//! aid, not a contract. Returns `None` for the reassigned encodings that
//! have no operation, which is how the trace facility spots an illegal
//! instruction before the engine does.

use crate::fields::{funct, reg, width};
use crate::memory::ImageWidth;
use crate::registers::REGISTER_NAMES;
use crate::utils::sign_extend_bits;

const MATH_NAMES: [&str; 8] =
    ["add", "sub", "imul", "idiv", "or", "xor", "and", "cmp"];
const RELATION_NAMES: [&str; 8] =
    ["gt", "lt", "eq", "ne", "ge", "le", "even", "odd"];
const WIDTH_SUFFIXES: [&str; 4] = ["b", "w", "dw", "qw"];

fn reg_name(op: u8) -> &'static str {
    REGISTER_NAMES[reg(op)]
}

fn math_name(f: u8) -> &'static str {
    MATH_NAMES[(f & 7) as usize]
}

fn rel_name(f: u8) -> &'static str {
    RELATION_NAMES[(f & 7) as usize]
}

fn suffix(op1: u8) -> &'static str {
    WIDTH_SUFFIXES[width(op1) as usize]
}

/// Sign-extend a 3-bit frame-offset field to -4..3
fn frame_offset(r: usize) -> i64 {
    sign_extend_bits(r as u64, 3) as i64
}

fn byte(bytes: &[u8], n: usize) -> u8 {
    bytes.get(n).copied().unwrap_or(0)
}

/// Image-width immediate following the first opcode byte
fn immediate(bytes: &[u8], image_width: ImageWidth) -> u64 {
    let mut value = 0;
    for n in 0..image_width.width() as usize {
        value |= u64::from(byte(bytes, 1 + n)) << (8 * n);
    }
    value
}

fn value16(bytes: &[u8]) -> i16 {
    i16::from_le_bytes([byte(bytes, 2), byte(bytes, 3)])
}

/// A branch pc-offset of 0..3 encodes a return variant
fn branch_target(pc: u64, ival: i64) -> String {
    match ival {
        0 => "ret".to_string(),
        1 => "retnf".to_string(),
        2 => "ret0".to_string(),
        3 => "ret0nf".to_string(),
        _ => format!("{:x}", pc.wrapping_add_signed(ival)),
    }
}

/// Render the instruction whose first byte is at `bytes[0]` and whose
/// address is `pc`. Returns `None` for an encoding with no operation.
pub fn disassemble(bytes: &[u8], pc: u64, image_width: ImageWidth) -> Option<String> {
    let op = byte(bytes, 0);
    let op1 = byte(bytes, 1);

    // one-byte overrides and the unassigned encodings
    match op {
        0x00 => return Some("halt".to_string()),
        0x08 => return Some("ret0".to_string()),
        0x20 => return Some("imulst".to_string()),
        0x28 => return Some("shlimg".to_string()),
        0x48 => return Some("ret0nf".to_string()),
        0x68 => return Some("retnf".to_string()),
        0x80 => return Some("subst".to_string()),
        0x84 => return Some("imgwid".to_string()),
        0x88 => return Some("shrimg".to_string()),
        0xa0 => return Some("addst".to_string()),
        0xa8 => return Some("idivst".to_string()),
        0xc0 => return Some("ret".to_string()),
        0xc8 => return Some("natwid".to_string()),
        0xe0 => return Some("andst".to_string()),
        0xa3 => return Some("cpuinfo".to_string()),
        0x02 | 0x21 | 0x22 | 0x43 | 0xa4 | 0xc1 | 0xc4 | 0xe4 | 0xe8 => {
            return None
        }
        _ => {}
    }

    let text = match op & 3 {
        0 => {
            let mnemonic = match funct(op) {
                0 => "inc",
                1 => "dec",
                2 => "push",
                3 => "pop",
                4 => "zero",
                5 => "shl",
                6 => "shr",
                _ => "inv",
            };
            format!("{mnemonic} {}", reg_name(op))
        }
        1 => pair(op, op1)?,
        2 => {
            let imm = immediate(bytes, image_width);
            match funct(op) {
                0 => format!("ld {}, [{imm:x}]", reg_name(op)),
                1 => format!("ldi {}, {imm:x}", reg_name(op)),
                2 => format!("st [{imm:x}], {}", reg_name(op)),
                3 => format!("jmp {imm:x} + {}", reg_name(op)),
                4 => format!("inc [{imm:x} + {}]", reg_name(op)),
                5 => format!("dec [{imm:x} + {}]", reg_name(op)),
                6 => format!("ldae rres, [{imm:x}][{}]", reg_name(op)),
                _ => format!("call {imm:x} + {}", reg_name(op)),
            }
        }
        _ => wide(bytes, pc, op, op1)?,
    };
    Some(text)
}

/// Two-byte instructions
fn pair(op: u8, op1: u8) -> Option<String> {
    let f1 = funct(op1);
    let text = match funct(op) {
        0 => format!("{} {}, {}", math_name(f1), reg_name(op), reg_name(op1)),
        1 => {
            if f1 == 3 {
                format!("mov {}, {}", reg_name(op), reg_name(op1))
            } else {
                format!(
                    "cmov {}, {}, {}",
                    reg_name(op),
                    reg_name(op1),
                    rel_name(f1)
                )
            }
        }
        2 => format!(
            "cmpst {}, {}, {}",
            reg_name(op),
            reg_name(op1),
            rel_name(f1)
        ),
        3 => match f1 {
            0 => format!("ldf {}, {}", reg_name(op), frame_offset(reg(op1))),
            1 => format!("stf {}, {}", reg_name(op), frame_offset(reg(op1))),
            2 => format!("ret {}", 1 + reg(op1)),
            3 => {
                let value = sign_extend_bits(u64::from(op1) & 0x1f, 5) as i64;
                format!("ldib {}, {}", reg_name(op), value)
            }
            4 => format!("signex{} {}", suffix(op1), reg_name(op)),
            5 => format!("memf{}", suffix(op1)),
            6 => format!("stadd{}", suffix(op1)),
            _ => format!("moddiv {}, {}", reg_name(op), reg_name(op1)),
        },
        4 => match f1 {
            0 => {
                let id = (reg(op) << 3) | reg(op1);
                format!("syscall {id}")
            }
            1 => format!("pushf {}", frame_offset(reg(op1))),
            2 => format!("stst {}", reg_name(op)),
            3 => {
                if width(op1) == 0 {
                    format!("addimgw {}", reg_name(op))
                } else {
                    format!("subimgw {}", reg_name(op))
                }
            }
            4 => format!(
                "stinc{} [{}], {}",
                suffix(op1),
                reg_name(op),
                reg_name(op1)
            ),
            5 => format!("swap {}, {}", reg_name(op), reg_name(op1)),
            6 => {
                if width(op1) == 0 {
                    format!("addnatw {}", reg_name(op))
                } else {
                    format!("subnatw {}", reg_name(op))
                }
            }
            _ => "nop".to_string(),
        },
        5 => match f1 {
            0 => format!("st{} [{}], {}", suffix(op1), reg_name(op), reg_name(op1)),
            1 => format!("ld{} {}, [{}]", suffix(op1), reg_name(op), reg_name(op1)),
            2 => format!("pushtwo {}, {}", reg_name(op), reg_name(op1)),
            _ => format!("poptwo {}, {}", reg_name(op), reg_name(op1)),
        },
        6 => format!("mov {}, {}", reg_name(op), reg_name(op1)),
        _ => format!(
            "mathst {}, {}, {}",
            reg_name(op),
            reg_name(op1),
            math_name(f1)
        ),
    };
    Some(text)
}

/// Four-byte instructions
fn wide(bytes: &[u8], pc: u64, op: u8, op1: u8) -> Option<String> {
    let f1 = funct(op1);
    let ival = i64::from(value16(bytes));
    let text = match funct(op) {
        0 => match width(op1) {
            0 => format!(
                "j {}, {}, {}, {}",
                reg_name(op),
                reg_name(op1),
                rel_name(f1),
                branch_target(pc, ival)
            ),
            1 => format!(
                "ji {}, {}, {}, {}",
                reg_name(op),
                1 + reg(op1),
                rel_name(f1),
                branch_target(pc, ival)
            ),
            w => {
                let mnemonic = if w == 2 { "jrelb" } else { "jrel" };
                let pc_offset = i64::from(byte(bytes, 3) as i8);
                format!(
                    "{mnemonic} {}, [{} + {:x}], {}, {}",
                    reg_name(op),
                    reg_name(op1),
                    byte(bytes, 2),
                    rel_name(f1),
                    branch_target(pc, pc_offset)
                )
            }
        },
        1 => format!("stinc{} [{}], {ival}", suffix(op1), reg_name(op)),
        2 => format!(
            "ldinc{} {}, [{} + pc + {ival}]",
            suffix(op1),
            reg_name(op),
            reg_name(op1)
        ),
        3 => match f1 {
            0 => format!("call [pc + {ival}][{}]", reg_name(op)),
            1 => format!("callnf [pc + {ival}][{}]", reg_name(op)),
            _ => format!("callnf pc + {ival} + {}", reg_name(op)),
        },
        4 => format!(
            "sto{} [pc + {ival}][{}], {}",
            suffix(op1),
            reg_name(op1),
            reg_name(op)
        ),
        5 => match f1 {
            1 => format!(
                "ldoinc{} {}, [pc + {ival}][{}]",
                suffix(op1),
                reg_name(op),
                reg_name(op1)
            ),
            2 => format!("ldiw {}, {ival}", reg_name(op)),
            _ => format!(
                "ldo{} {}, [pc + {ival}][{}]",
                suffix(op1),
                reg_name(op),
                reg_name(op1)
            ),
        },
        6 => match f1 {
            0 => format!("ld{} {}, [pc + {ival}]", suffix(op1), reg_name(op)),
            1 => {
                let raw = ((reg(op) << 3) | reg(op1)) as u64;
                let constant = sign_extend_bits(raw, 6) as i64;
                format!("sti{} [pc + {ival}], {constant}", suffix(op1))
            }
            2 => {
                let op2 = byte(bytes, 2);
                format!(
                    "math {}, {}, {}, {}",
                    reg_name(op),
                    reg_name(op1),
                    reg_name(op2),
                    math_name(funct(op2))
                )
            }
            3 => {
                let op2 = byte(bytes, 2);
                format!(
                    "cmp {}, {}, {}, {}",
                    reg_name(op),
                    reg_name(op1),
                    reg_name(op2),
                    rel_name(funct(op2))
                )
            }
            4 => {
                let limit = u16::from_le_bytes([byte(bytes, 2), byte(bytes, 3)]);
                format!(
                    "fzero{} {}, [{}], {limit}",
                    suffix(op1),
                    reg_name(op),
                    reg_name(op1)
                )
            }
            5 => format!(
                "stoi{} {}[{}], {ival}",
                suffix(op1),
                reg_name(op),
                reg_name(op1)
            ),
            6 => {
                let op2 = byte(bytes, 2);
                format!(
                    "stor{} {}[{}], {}",
                    suffix(op1),
                    reg_name(op),
                    reg_name(op1),
                    reg_name(op2)
                )
            }
            _ => {
                let op2 = byte(bytes, 2);
                format!(
                    "ldor{} {}, {}[{}]",
                    suffix(op1),
                    reg_name(op),
                    reg_name(op1),
                    reg_name(op2)
                )
            }
        },
        _ => {
            let op2 = byte(bytes, 2);
            format!(
                "cstf {}, {}, {}, {}",
                reg_name(op),
                reg_name(op1),
                rel_name(f1),
                frame_offset(reg(op2))
            )
        }
    };
    Some(text)
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::encode;
    use crate::ops::{MathOp, Relation};
    use crate::registers::{RARG1, RRES, RTMP};

    fn dis(bytes: &[u8]) -> String {
        disassemble(bytes, 0x100, ImageWidth::Two).unwrap()
    }

    #[test]
    fn check_one_byte_mnemonics() {
        assert_eq!(dis(&encode::halt()), "halt");
        assert_eq!(dis(&encode::ret()), "ret");
        assert_eq!(dis(&encode::inc(RRES)), "inc rres");
        assert_eq!(dis(&encode::pop(RTMP)), "pop rtmp");
        assert_eq!(dis(&encode::natwid()), "natwid");
    }

    #[test]
    fn check_unassigned_encodings_have_no_text() {
        for op in [0x02, 0x21, 0x22, 0x43, 0xa4, 0xc1, 0xc4, 0xe4, 0xe8] {
            assert!(disassemble(&[op, 0, 0, 0], 0, ImageWidth::Two).is_none());
        }
    }

    #[test]
    fn check_two_byte_rendering() {
        assert_eq!(dis(&encode::math(MathOp::Add, RRES, RTMP)), "add rres, rtmp");
        assert_eq!(dis(&encode::mov(RRES, RTMP)), "mov rres, rtmp");
        assert_eq!(
            dis(&encode::cmov(RRES, RTMP, Relation::Lt)),
            "cmov rres, rtmp, lt"
        );
        assert_eq!(dis(&encode::ldf(RRES, -2)), "ldf rres, -2");
        assert_eq!(dis(&encode::ldib(RRES, -5)), "ldib rres, -5");
        assert_eq!(dis(&encode::syscall(42)), "syscall 42");
    }

    #[test]
    fn check_immediate_rendering() {
        assert_eq!(
            dis(&encode::ldi(RARG1, 0x1234, ImageWidth::Two)),
            "ldi rarg1, 1234"
        );
        assert_eq!(
            dis(&encode::call(0x200, 0, ImageWidth::Two)),
            "call 200 + rzero"
        );
    }

    #[test]
    fn check_branch_rendering() {
        assert_eq!(
            dis(&encode::j(RRES, RTMP, Relation::Lt, 0x10)),
            "j rres, rtmp, lt, 110"
        );
        assert_eq!(
            dis(&encode::j(RRES, RTMP, Relation::Eq, 0)),
            "j rres, rtmp, eq, ret"
        );
        assert_eq!(
            dis(&encode::ji(RRES, 8, Relation::Ge, 2)),
            "ji rres, 8, ge, ret0"
        );
    }

    #[test]
    fn check_wide_immediate_width_tracks_image() {
        let code = encode::ldi(RARG1, 0x0102_0304, ImageWidth::Four);
        let text = disassemble(&code, 0, ImageWidth::Four).unwrap();
        assert_eq!(text, "ldi rarg1, 1020304");
    }
}
