//! Jump instructions used to chain the bootloader in front of the application.
//!
//! The bootloader only gets control after reset if the reset vector at address 0 jumps to it. The
//! application's own reset target is kept alive by a second jump in the last four bytes before the
//! bootloader, which the bootloader executes when it hands over. All targets here are word
//! addresses, as the instruction set counts them.

use crate::error::{Error, Result};
use std::convert::TryInto;

/// First word of a long (absolute) jump; the second word holds the target.
pub const JMP: u16 = 0x940c;

const RJMP: u16 = 0xc000;
const OPCODE_MASK: u16 = 0xf000;
const OFFSET_MASK: u16 = 0x0fff;

/// Highest byte address a relative jump is used for. Beyond it the long form is emitted.
pub const RJMP_LIMIT: usize = 0x2000;

fn read_word(code: &[u8], offset: usize) -> Option<u16> {
    let bytes = code.get(offset..offset + 2)?;
    Some(u16::from_le_bytes(bytes.try_into().ok()?))
}

/// Decodes the jump located at word address `at` and returns its target word address.
///
/// The offset of a relative jump counts forward from the next instruction and is not reduced to
/// the flash size, so `rjmp` with offset `0xfff` at address 0 targets word `0x1000`. Returns `None`
/// for anything which is not a jump.
pub fn decode_jump(code: &[u8], at: u16) -> Option<u16> {
    let word = read_word(code, 0)?;
    if word == JMP {
        read_word(code, 2)
    } else if word & OPCODE_MASK == RJMP {
        Some(at.wrapping_add(1).wrapping_add(word & OFFSET_MASK))
    } else {
        None
    }
}

/// Writes a jump from word address `at` to word address `target` to the start of `code`.
///
/// The long form takes four bytes, the relative one two. `code` has to be large enough.
pub fn encode_jump(code: &mut [u8], at: u16, target: u16, long: bool) {
    if long {
        code[0..2].copy_from_slice(&JMP.to_le_bytes());
        code[2..4].copy_from_slice(&target.to_le_bytes());
    } else {
        let word = RJMP | (target.wrapping_sub(at).wrapping_sub(1) & OFFSET_MASK);
        code[0..2].copy_from_slice(&word.to_le_bytes());
    }
}

/// Replaces the reset vector at the start of `first_page` with a jump into the bootloader.
///
/// Returns the application's original reset target.
pub fn relocate_reset(first_page: &mut [u8], bootloader_start: usize) -> Result<u16> {
    let user_reset = decode_jump(first_page, 0)
        .ok_or_else(|| Error::UnpatchableProgram(read_word(first_page, 0).unwrap_or(0xffff)))?;

    encode_jump(
        first_page,
        0,
        (bootloader_start / 2) as u16,
        bootloader_start > RJMP_LIMIT,
    );
    Ok(user_reset)
}

/// Writes the jump back into the application, which lives at byte address `address`, to
/// `code`.
pub fn insert_user_reset(code: &mut [u8], address: usize, user_reset: u16) {
    let long = address > RJMP_LIMIT || usize::from(user_reset) > RJMP_LIMIT;
    encode_jump(code, (address / 2) as u16, user_reset, long);
}
