//! The fixed opcode table and script tokenizer.

use crate::interpreter::ScriptError;

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;

/// Every non-push opcode with a defined meaning. Bytes 0xba..=0xff decode
/// to `Instruction::Invalid`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Opcode {
    OneNegate = 0x4f,
    Reserved = 0x50,
    Num1 = 0x51,
    Num2 = 0x52,
    Num3 = 0x53,
    Num4 = 0x54,
    Num5 = 0x55,
    Num6 = 0x56,
    Num7 = 0x57,
    Num8 = 0x58,
    Num9 = 0x59,
    Num10 = 0x5a,
    Num11 = 0x5b,
    Num12 = 0x5c,
    Num13 = 0x5d,
    Num14 = 0x5e,
    Num15 = 0x5f,
    Num16 = 0x60,
    Nop = 0x61,
    Ver = 0x62,
    If = 0x63,
    NotIf = 0x64,
    VerIf = 0x65,
    VerNotIf = 0x66,
    Else = 0x67,
    EndIf = 0x68,
    Verify = 0x69,
    Return = 0x6a,
    ToAltStack = 0x6b,
    FromAltStack = 0x6c,
    TwoDrop = 0x6d,
    TwoDup = 0x6e,
    ThreeDup = 0x6f,
    TwoOver = 0x70,
    TwoRot = 0x71,
    TwoSwap = 0x72,
    IfDup = 0x73,
    Depth = 0x74,
    Drop = 0x75,
    Dup = 0x76,
    Nip = 0x77,
    Over = 0x78,
    Pick = 0x79,
    Roll = 0x7a,
    Rot = 0x7b,
    Swap = 0x7c,
    Tuck = 0x7d,
    Cat = 0x7e,
    Substr = 0x7f,
    Left = 0x80,
    Right = 0x81,
    Size = 0x82,
    Invert = 0x83,
    And = 0x84,
    Or = 0x85,
    Xor = 0x86,
    Equal = 0x87,
    EqualVerify = 0x88,
    Reserved1 = 0x89,
    Reserved2 = 0x8a,
    OneAdd = 0x8b,
    OneSub = 0x8c,
    TwoMul = 0x8d,
    TwoDiv = 0x8e,
    Negate = 0x8f,
    Abs = 0x90,
    Not = 0x91,
    ZeroNotEqual = 0x92,
    Add = 0x93,
    Sub = 0x94,
    Mul = 0x95,
    Div = 0x96,
    Mod = 0x97,
    LShift = 0x98,
    RShift = 0x99,
    BoolAnd = 0x9a,
    BoolOr = 0x9b,
    NumEqual = 0x9c,
    NumEqualVerify = 0x9d,
    NumNotEqual = 0x9e,
    LessThan = 0x9f,
    GreaterThan = 0xa0,
    LessThanOrEqual = 0xa1,
    GreaterThanOrEqual = 0xa2,
    Min = 0xa3,
    Max = 0xa4,
    Within = 0xa5,
    Ripemd160 = 0xa6,
    Sha1 = 0xa7,
    Sha256 = 0xa8,
    Hash160 = 0xa9,
    Hash256 = 0xaa,
    CodeSeparator = 0xab,
    CheckSig = 0xac,
    CheckSigVerify = 0xad,
    CheckMultiSig = 0xae,
    CheckMultiSigVerify = 0xaf,
    Nop1 = 0xb0,
    CheckLockTimeVerify = 0xb1,
    CheckSequenceVerify = 0xb2,
    Nop4 = 0xb3,
    Nop5 = 0xb4,
    Nop6 = 0xb5,
    Nop7 = 0xb6,
    Nop8 = 0xb7,
    Nop9 = 0xb8,
    Nop10 = 0xb9,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        use Opcode::*;
        let op = match byte {
            0x4f => OneNegate,
            0x50 => Reserved,
            0x51 => Num1,
            0x52 => Num2,
            0x53 => Num3,
            0x54 => Num4,
            0x55 => Num5,
            0x56 => Num6,
            0x57 => Num7,
            0x58 => Num8,
            0x59 => Num9,
            0x5a => Num10,
            0x5b => Num11,
            0x5c => Num12,
            0x5d => Num13,
            0x5e => Num14,
            0x5f => Num15,
            0x60 => Num16,
            0x61 => Nop,
            0x62 => Ver,
            0x63 => If,
            0x64 => NotIf,
            0x65 => VerIf,
            0x66 => VerNotIf,
            0x67 => Else,
            0x68 => EndIf,
            0x69 => Verify,
            0x6a => Return,
            0x6b => ToAltStack,
            0x6c => FromAltStack,
            0x6d => TwoDrop,
            0x6e => TwoDup,
            0x6f => ThreeDup,
            0x70 => TwoOver,
            0x71 => TwoRot,
            0x72 => TwoSwap,
            0x73 => IfDup,
            0x74 => Depth,
            0x75 => Drop,
            0x76 => Dup,
            0x77 => Nip,
            0x78 => Over,
            0x79 => Pick,
            0x7a => Roll,
            0x7b => Rot,
            0x7c => Swap,
            0x7d => Tuck,
            0x7e => Cat,
            0x7f => Substr,
            0x80 => Left,
            0x81 => Right,
            0x82 => Size,
            0x83 => Invert,
            0x84 => And,
            0x85 => Or,
            0x86 => Xor,
            0x87 => Equal,
            0x88 => EqualVerify,
            0x89 => Reserved1,
            0x8a => Reserved2,
            0x8b => OneAdd,
            0x8c => OneSub,
            0x8d => TwoMul,
            0x8e => TwoDiv,
            0x8f => Negate,
            0x90 => Abs,
            0x91 => Not,
            0x92 => ZeroNotEqual,
            0x93 => Add,
            0x94 => Sub,
            0x95 => Mul,
            0x96 => Div,
            0x97 => Mod,
            0x98 => LShift,
            0x99 => RShift,
            0x9a => BoolAnd,
            0x9b => BoolOr,
            0x9c => NumEqual,
            0x9d => NumEqualVerify,
            0x9e => NumNotEqual,
            0x9f => LessThan,
            0xa0 => GreaterThan,
            0xa1 => LessThanOrEqual,
            0xa2 => GreaterThanOrEqual,
            0xa3 => Min,
            0xa4 => Max,
            0xa5 => Within,
            0xa6 => Ripemd160,
            0xa7 => Sha1,
            0xa8 => Sha256,
            0xa9 => Hash160,
            0xaa => Hash256,
            0xab => CodeSeparator,
            0xac => CheckSig,
            0xad => CheckSigVerify,
            0xae => CheckMultiSig,
            0xaf => CheckMultiSigVerify,
            0xb0 => Nop1,
            0xb1 => CheckLockTimeVerify,
            0xb2 => CheckSequenceVerify,
            0xb3 => Nop4,
            0xb4 => Nop5,
            0xb5 => Nop6,
            0xb6 => Nop7,
            0xb7 => Nop8,
            0xb8 => Nop9,
            0xb9 => Nop10,
            _ => return None,
        };
        Some(op)
    }

    pub const fn byte(self) -> u8 {
        self as u8
    }

    /// Value pushed by OP_1NEGATE and OP_1..=OP_16.
    pub fn small_int(self) -> Option<i64> {
        match self {
            Opcode::OneNegate => Some(-1),
            op if (Opcode::Num1.byte()..=Opcode::Num16.byte()).contains(&op.byte()) => {
                Some((op.byte() - Opcode::Num1.byte() + 1) as i64)
            }
            _ => None,
        }
    }

    /// Opcodes that fail the script even inside an unexecuted branch.
    pub fn is_disabled(self) -> bool {
        matches!(
            self,
            Opcode::Cat
                | Opcode::Substr
                | Opcode::Left
                | Opcode::Right
                | Opcode::Invert
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::TwoMul
                | Opcode::TwoDiv
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::LShift
                | Opcode::RShift
        )
    }

    /// Counts toward the per-script operation limit.
    pub fn is_counted(self) -> bool {
        self.byte() > Opcode::Num16.byte()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Instruction<'a> {
    /// A data push; `opcode` is the byte that introduced it (0x00..=0x4e).
    Push { opcode: u8, data: &'a [u8] },
    Op(Opcode),
    Invalid(u8),
}

impl Instruction<'_> {
    /// Opcode byte as it appears in the script.
    pub fn byte(&self) -> u8 {
        match self {
            Instruction::Push { opcode, .. } => *opcode,
            Instruction::Op(op) => op.byte(),
            Instruction::Invalid(byte) => *byte,
        }
    }
}

/// Iterates a script, yielding each instruction with the offset just past it.
pub struct Instructions<'a> {
    script: &'a [u8],
    cursor: usize,
    failed: bool,
}

impl<'a> Instructions<'a> {
    pub fn new(script: &'a [u8]) -> Self {
        Self {
            script,
            cursor: 0,
            failed: false,
        }
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ScriptError> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|end| *end <= self.script.len())
            .ok_or(ScriptError::BadOpcode)?;
        let out = &self.script[self.cursor..end];
        self.cursor = end;
        Ok(out)
    }

    fn next_instruction(&mut self) -> Result<Instruction<'a>, ScriptError> {
        let opcode = self.take(1)?[0];
        let len = match opcode {
            0x00..=0x4b => opcode as usize,
            OP_PUSHDATA1 => self.take(1)?[0] as usize,
            OP_PUSHDATA2 => {
                let bytes = self.take(2)?;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let bytes = self.take(4)?;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            _ => {
                return Ok(match Opcode::from_byte(opcode) {
                    Some(op) => Instruction::Op(op),
                    None => Instruction::Invalid(opcode),
                })
            }
        };
        let data = self.take(len)?;
        Ok(Instruction::Push { opcode, data })
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<(usize, Instruction<'a>), ScriptError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor >= self.script.len() {
            return None;
        }
        match self.next_instruction() {
            Ok(instruction) => Some(Ok((self.cursor, instruction))),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

pub fn is_push_only(script: &[u8]) -> bool {
    for item in Instructions::new(script) {
        match item {
            Ok((_, Instruction::Push { .. })) => {}
            Ok((_, Instruction::Op(op))) if op.small_int().is_some() => {}
            _ => return false,
        }
    }
    true
}

/// Appends `data` using the smallest push opcode that can carry it.
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        script.push(len as u8);
    } else if len <= 0xff {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else if len <= 0xffff {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(len as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

/// Minimal script encoding of a small integer: OP_0, OP_1NEGATE, OP_1..OP_16 or a number push.
pub fn push_int(script: &mut Vec<u8>, value: i64) {
    if value == 0 {
        script.push(OP_0);
    } else if value == -1 || (1..=16).contains(&value) {
        script.push((Opcode::Num1.byte() as i64 + value - 1) as u8);
    } else {
        push_data(script, &crate::num::script_num_to_vec(value));
    }
}

/// A push is minimal if no shorter encoding of the same bytes exists.
pub fn check_minimal_push(data: &[u8], opcode: u8) -> bool {
    if data.is_empty() {
        return opcode == OP_0;
    }
    if data.len() == 1 && (1..=16).contains(&data[0]) {
        return false;
    }
    if data.len() == 1 && data[0] == 0x81 {
        return false;
    }
    if data.len() <= 75 {
        return opcode as usize == data.len();
    }
    if data.len() <= 255 {
        return opcode == OP_PUSHDATA1;
    }
    if data.len() <= 65535 {
        return opcode == OP_PUSHDATA2;
    }
    true
}
