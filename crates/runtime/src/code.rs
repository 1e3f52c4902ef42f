//! Bytecode Buffers
//!
//! `CodeBuffer` is the emit side, used by the (external) code generator
//! and by tests; `Code` is the read-only fetch side the interpreter
//! executes. Immediates are little-endian; branch operands are 32-bit
//! offsets relative to the pc just past the operand.

use num_enum::TryFromPrimitive;

use crate::opcode::Opcode;

/// Read-only instruction stream.
pub struct Code {
    bytes: Vec<u8>,
}

impl Code {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Fetch the opcode at pc and advance past it. Out-of-range or
    /// unknown bytes decode as Illegal, which the engine treats as fatal.
    #[inline]
    pub fn fetch_op(&self, pc: &mut usize) -> Opcode {
        let b = match self.bytes.get(*pc) {
            Some(&b) => b,
            None => return Opcode::Illegal,
        };
        *pc += 1;
        Opcode::try_from_primitive(b).unwrap_or(Opcode::Illegal)
    }

    #[inline]
    pub fn int8_at(&self, pc: &mut usize) -> i8 {
        let v = self.bytes[*pc] as i8;
        *pc += 1;
        v
    }

    #[inline]
    pub fn uint8_at(&self, pc: &mut usize) -> u8 {
        let v = self.bytes[*pc];
        *pc += 1;
        v
    }

    #[inline]
    pub fn int16_at(&self, pc: &mut usize) -> i16 {
        let v = i16::from_le_bytes([self.bytes[*pc], self.bytes[*pc + 1]]);
        *pc += 2;
        v
    }

    #[inline]
    pub fn uint16_at(&self, pc: &mut usize) -> u16 {
        self.int16_at(pc) as u16
    }

    #[inline]
    pub fn int32_at(&self, pc: &mut usize) -> i32 {
        let v = i32::from_le_bytes([
            self.bytes[*pc],
            self.bytes[*pc + 1],
            self.bytes[*pc + 2],
            self.bytes[*pc + 3],
        ]);
        *pc += 4;
        v
    }

    #[inline]
    pub fn uint32_at(&self, pc: &mut usize) -> u32 {
        self.int32_at(pc) as u32
    }

    /// Branch operand: the absolute target pc.
    #[inline]
    pub fn pcoff_at(&self, pc: &mut usize) -> usize {
        let off = self.int32_at(pc);
        (*pc as i64 + off as i64) as usize
    }
}

/// Emit-side bytecode buffer.
#[derive(Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> CodeBuffer {
        CodeBuffer::default()
    }

    /// Current emit position.
    pub fn here(&self) -> usize {
        self.bytes.len()
    }

    pub fn emit_op(&mut self, op: Opcode) -> &mut Self {
        self.bytes.push(op as u8);
        self
    }

    pub fn emit_i8(&mut self, v: i8) -> &mut Self {
        self.bytes.push(v as u8);
        self
    }

    pub fn emit_u8(&mut self, v: u8) -> &mut Self {
        self.bytes.push(v);
        self
    }

    pub fn emit_i16(&mut self, v: i16) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn emit_u16(&mut self, v: u16) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn emit_i32(&mut self, v: i32) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn emit_u32(&mut self, v: u32) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Emit a branch operand to a known target.
    pub fn emit_branch_to(&mut self, target: usize) -> &mut Self {
        let after = self.here() + 4;
        self.emit_i32((target as i64 - after as i64) as i32)
    }

    /// Emit a forward-branch placeholder; returns the site to patch.
    pub fn emit_branch_fwd(&mut self) -> usize {
        let site = self.here();
        self.emit_i32(0);
        site
    }

    /// Patch a forward branch emitted with `emit_branch_fwd`.
    pub fn patch_branch(&mut self, site: usize, target: usize) {
        let off = (target as i64 - (site as i64 + 4)) as i32;
        self.bytes[site..site + 4].copy_from_slice(&off.to_le_bytes());
    }

    pub fn finish(self) -> Code {
        Code { bytes: self.bytes }
    }
}

/// Disassemble a code stream (for logs and tests).
pub fn disassemble(code: &Code) -> String {
    let mut out = String::new();
    let mut pc = 0;
    while pc < code.len() {
        let at = pc;
        let op = code.fetch_op(&mut pc);
        out.push_str(&format!("{at:6}: {}", op.name()));
        if op == Opcode::Illegal {
            out.push('\n');
            break;
        }
        let mut sep = "\t";
        for f in op.fmt().chars() {
            out.push_str(sep);
            sep = ", ";
            match f {
                'b' => {
                    let target = code.pcoff_at(&mut pc);
                    out.push_str(&format!("->{target}"));
                }
                'c' => out.push_str(&format!("{}", code.int8_at(&mut pc))),
                'g' => out.push_str(&format!("conv#{}", code.uint8_at(&mut pc))),
                'h' => out.push_str(&format!("{}", code.int16_at(&mut pc))),
                'i' => out.push_str(&format!("{}", code.int32_at(&mut pc))),
                'o' => out.push_str(&format!("field@{}", code.uint16_at(&mut pc))),
                'p' => out.push_str(&format!("native#{}", code.uint32_at(&mut pc))),
                's' => out.push_str(&format!("str#{}", code.uint32_at(&mut pc))),
                't' => out.push_str(&format!("type#{}", code.uint32_at(&mut pc))),
                'v' => {
                    let v = code.int16_at(&mut pc);
                    out.push_str(&format!("bp[{v}]"));
                }
                'V' => out.push_str(&format!("lit#{}", code.uint32_at(&mut pc))),
                _ => out.push_str("??"),
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_fetch() {
        let mut b = CodeBuffer::new();
        b.emit_op(Opcode::Push8).emit_i8(-5);
        b.emit_op(Opcode::PushV).emit_u32(7);
        b.emit_op(Opcode::AddInt);
        let code = b.finish();

        let mut pc = 0;
        assert_eq!(code.fetch_op(&mut pc), Opcode::Push8);
        assert_eq!(code.int8_at(&mut pc), -5);
        assert_eq!(code.fetch_op(&mut pc), Opcode::PushV);
        assert_eq!(code.uint32_at(&mut pc), 7);
        assert_eq!(code.fetch_op(&mut pc), Opcode::AddInt);
        assert_eq!(pc, code.len());
        assert_eq!(code.fetch_op(&mut pc), Opcode::Illegal);
    }

    #[test]
    fn test_branch_patching() {
        let mut b = CodeBuffer::new();
        b.emit_op(Opcode::Branch);
        let site = b.emit_branch_fwd();
        b.emit_op(Opcode::Nop);
        let target = b.here();
        b.emit_op(Opcode::Terminate);
        b.patch_branch(site, target);
        let code = b.finish();

        let mut pc = 0;
        assert_eq!(code.fetch_op(&mut pc), Opcode::Branch);
        assert_eq!(code.pcoff_at(&mut pc), target);
    }

    #[test]
    fn test_backward_branch() {
        let mut b = CodeBuffer::new();
        let top = b.here();
        b.emit_op(Opcode::Nop);
        b.emit_op(Opcode::Branch);
        b.emit_branch_to(top);
        let code = b.finish();

        let mut pc = 1;
        assert_eq!(code.fetch_op(&mut pc), Opcode::Branch);
        assert_eq!(code.pcoff_at(&mut pc), top);
    }

    #[test]
    fn test_disassemble() {
        let mut b = CodeBuffer::new();
        b.emit_op(Opcode::Push8).emit_i8(3);
        b.emit_op(Opcode::LoadV).emit_i16(-1);
        let text = disassemble(&b.finish());
        assert!(text.contains("Push8"));
        assert!(text.contains("bp[-1]"));
    }
}
