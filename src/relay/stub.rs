//! Relay stub records and their x86 encoding.
//!
//! Every relayed export gets one fixed-size [`StubRecord`] in the code section of its
//! synthesized image. The record is a complete little instruction sequence:
//!
//! ```text
//! offset 0   u8   dispatch opcode   0xE8 call rel32 / 0xE9 jmp rel32
//! offset 1   i32  displacement      relative to offset 5
//! offset 5   u8   return opcode     0xC2 ret imm16 / 0xC3 ret / 0x90 nop
//! offset 6   u16  pop count         bytes removed by ret imm16
//! ```
//!
//! The displacement is always measured from the address of the return instruction, which is
//! also the address the processor computes `rel32` targets from. A stub in direct form jumps
//! straight to the implementation and the trailing `ret` is never reached. A stub in traced
//! form calls the shared relay trampoline, which logs the call, forwards it to the real
//! function and lets that function return onto the stub's `ret`, which then removes the
//! caller's arguments.

use strum::{Display, FromRepr};

use crate::{Error, Result};

/// Size of one encoded stub record.
pub const STUB_SIZE: usize = 8;

/// Offset of the return instruction inside a stub record.
pub const STUB_RETURN_OFFSET: usize = 5;

/// Size of one stack argument slot in bytes.
const ARG_SLOT_SIZE: u16 = 4;

/// First byte of a stub record.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum DispatchOpcode {
    /// `call rel32`
    #[strum(serialize = "call")]
    Call = 0xe8,
    /// `jmp rel32`
    #[strum(serialize = "jmp")]
    Jump = 0xe9,
}

/// Instruction following the dispatch instruction.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum ReturnOpcode {
    /// `ret imm16`, callee removes its arguments
    #[strum(serialize = "ret n")]
    ReturnPop = 0xc2,
    /// `ret`, caller removes the arguments
    #[strum(serialize = "ret")]
    Return = 0xc3,
    /// `nop`, the dispatched handler never returns here
    #[strum(serialize = "nop")]
    Nop = 0x90,
}

/// Classification of a descriptor's per-function argument code.
///
/// The code is a single byte. Two values are sentinels; every other value describes a normal
/// function whose low seven bits count the stack argument slots and whose high bit is set when
/// the caller, not the callee, removes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgCode {
    /// The handler manages its own calling convention (`0xFE`).
    Register,
    /// Stub or external symbol, no relay is generated (`0xFF`).
    Extern,
    /// A regular function.
    Normal {
        /// Number of 32-bit stack argument slots
        words: u8,
        /// `true` when the caller cleans the stack
        caller_pops: bool,
    },
}

impl ArgCode {
    /// Raw code of [`ArgCode::Register`].
    pub const REGISTER: u8 = 0xfe;
    /// Raw code of [`ArgCode::Extern`].
    pub const EXTERN: u8 = 0xff;

    /// Classifies a raw argument code.
    #[must_use]
    pub fn classify(code: u8) -> Self {
        match code {
            Self::REGISTER => ArgCode::Register,
            Self::EXTERN => ArgCode::Extern,
            _ => ArgCode::Normal {
                words: code & 0x7f,
                caller_pops: code & 0x80 != 0,
            },
        }
    }

    /// Returns `true` when a stub of this kind can switch between direct and traced form.
    #[must_use]
    pub fn is_switchable(self) -> bool {
        matches!(self, ArgCode::Normal { .. })
    }
}

/// How a switchable stub transfers control.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// `jmp` straight to the implementation.
    #[strum(serialize = "direct")]
    Direct,
    /// `call` into the relay trampoline.
    #[strum(serialize = "traced")]
    Traced,
}

/// What occupies a function slot's stub record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubSlot {
    /// No record was generated; the slot is empty, extern or filtered.
    Absent,
    /// A register-convention call, never re-encoded.
    Register,
    /// A switchable stub in the given mode.
    Dispatch(DispatchMode),
}

/// One decoded relay stub record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubRecord {
    /// Raw dispatch opcode byte
    pub opcode: u8,
    /// Displacement relative to the return instruction
    pub displacement: i32,
    /// Raw return opcode byte
    pub ret: u8,
    /// Bytes removed from the stack by `ret imm16`
    pub pop: u16,
}

impl StubRecord {
    /// A stub that jumps straight to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetOverflow`] if `target` is out of `rel32` reach of `stub`.
    pub fn direct(stub: usize, target: usize, words: u8, caller_pops: bool) -> Result<Self> {
        Self::normal(DispatchOpcode::Jump, stub, target, words, caller_pops)
    }

    /// A stub that calls the relay `trampoline`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetOverflow`] if `trampoline` is out of `rel32` reach of `stub`.
    pub fn traced(stub: usize, trampoline: usize, words: u8, caller_pops: bool) -> Result<Self> {
        Self::normal(DispatchOpcode::Call, stub, trampoline, words, caller_pops)
    }

    /// A register-convention stub: a call to `target` followed by a `nop`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetOverflow`] if `target` is out of `rel32` reach of `stub`.
    pub fn register(stub: usize, target: usize) -> Result<Self> {
        Ok(StubRecord {
            opcode: DispatchOpcode::Call as u8,
            displacement: displacement(stub, target)?,
            ret: ReturnOpcode::Nop as u8,
            pop: 0,
        })
    }

    /// Builds the switchable stub for `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetOverflow`] if the transfer target is out of `rel32` reach.
    pub fn for_mode(
        mode: DispatchMode,
        stub: usize,
        target: usize,
        trampoline: usize,
        words: u8,
        caller_pops: bool,
    ) -> Result<Self> {
        match mode {
            DispatchMode::Direct => Self::direct(stub, target, words, caller_pops),
            DispatchMode::Traced => Self::traced(stub, trampoline, words, caller_pops),
        }
    }

    fn normal(
        opcode: DispatchOpcode,
        stub: usize,
        target: usize,
        words: u8,
        caller_pops: bool,
    ) -> Result<Self> {
        let ret = if caller_pops {
            ReturnOpcode::Return
        } else {
            ReturnOpcode::ReturnPop
        };
        Ok(StubRecord {
            opcode: opcode as u8,
            displacement: displacement(stub, target)?,
            ret: ret as u8,
            pop: u16::from(words & 0x7f) * ARG_SLOT_SIZE,
        })
    }

    /// The decoded dispatch opcode, if it is a known one.
    #[must_use]
    pub fn dispatch_opcode(&self) -> Option<DispatchOpcode> {
        DispatchOpcode::from_repr(self.opcode)
    }

    /// The decoded return opcode, if it is a known one.
    #[must_use]
    pub fn return_opcode(&self) -> Option<ReturnOpcode> {
        ReturnOpcode::from_repr(self.ret)
    }

    /// Address control is transferred to when the record lives at `stub`.
    #[must_use]
    pub fn transfer_target(&self, stub: usize) -> usize {
        (stub + STUB_RETURN_OFFSET).wrapping_add_signed(self.displacement as isize)
    }

    /// Serializes the record into its 8-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; STUB_SIZE] {
        let mut bytes = [0u8; STUB_SIZE];
        bytes[0] = self.opcode;
        bytes[1..5].copy_from_slice(&self.displacement.to_le_bytes());
        bytes[5] = self.ret;
        bytes[6..8].copy_from_slice(&self.pop.to_le_bytes());
        bytes
    }

    /// Parses an 8-byte wire record.
    #[must_use]
    pub fn decode(bytes: [u8; STUB_SIZE]) -> Self {
        StubRecord {
            opcode: bytes[0],
            displacement: i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            ret: bytes[5],
            pop: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}

/// Computes the `rel32` displacement from the return instruction of the stub at `stub` to
/// `target`.
fn displacement(stub: usize, target: usize) -> Result<i32> {
    let origin = stub + STUB_RETURN_OFFSET;
    let delta = target as i128 - origin as i128;
    i32::try_from(delta).map_err(|_| Error::OffsetOverflow {
        what: "stub displacement",
        target,
        base: origin,
    })
}
