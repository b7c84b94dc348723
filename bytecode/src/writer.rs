use crate::op::Op;

/// A branch target handed out by [`BytecodeWriter::new_label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

enum Patch {
    /// Forward branch: `delta = target - site`, written at `site + 1`.
    Forward { site: usize, label: Label },
    /// Pop-and-branch keeps its delta at `site + 2`.
    ForwardAt { site: usize, offset: usize, label: Label },
    /// Subroutine return delta: `bound - (site + 9)`, written at `site + 5`.
    SubroutineReturn { site: usize, label: Label },
}

/// Emits bytecode with label patching for forward branches.
///
/// Backward branches take already-bound labels and are encoded
/// immediately. `finish` appends `MethodEnd` and resolves all patches.
pub struct BytecodeWriter {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    patches: Vec<Patch>,
}

impl Default for BytecodeWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BytecodeWriter {
    pub fn new() -> Self {
        Self { code: Vec::new(), labels: Vec::new(), patches: Vec::new() }
    }

    /// Current bytecode offset.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current offset.
    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.code.len());
    }

    pub fn op(&mut self, op: Op) -> &mut Self {
        debug_assert_eq!(op.length(), 1);
        self.code.push(op as u8);
        self
    }

    pub fn op_u8(&mut self, op: Op, a: u8) -> &mut Self {
        debug_assert_eq!(op.length(), 2);
        self.code.push(op as u8);
        self.code.push(a);
        self
    }

    pub fn op_u8_u8(&mut self, op: Op, a: u8, b: u8) -> &mut Self {
        debug_assert_eq!(op.length(), 3);
        self.code.push(op as u8);
        self.code.push(a);
        self.code.push(b);
        self
    }

    pub fn op_i32(&mut self, op: Op, a: i32) -> &mut Self {
        debug_assert_eq!(op.length(), 5);
        self.code.push(op as u8);
        self.code.extend_from_slice(&a.to_le_bytes());
        self
    }

    pub fn op_i32_u8(&mut self, op: Op, a: i32, b: u8) -> &mut Self {
        debug_assert_eq!(op.length(), 6);
        self.code.push(op as u8);
        self.code.extend_from_slice(&a.to_le_bytes());
        self.code.push(b);
        self
    }

    pub fn op_u8_i32(&mut self, op: Op, a: u8, b: i32) -> &mut Self {
        debug_assert_eq!(op.length(), 6);
        self.code.push(op as u8);
        self.code.push(a);
        self.code.extend_from_slice(&b.to_le_bytes());
        self
    }

    /// Forward wide branch (`BranchWide`, `BranchIfTrueWide`,
    /// `BranchIfFalseWide`); the delta is relative to the opcode address.
    pub fn branch_forward(&mut self, op: Op, label: Label) -> &mut Self {
        debug_assert!(matches!(
            op,
            Op::BranchWide | Op::BranchIfTrueWide | Op::BranchIfFalseWide
        ));
        let site = self.code.len();
        self.patches.push(Patch::Forward { site, label });
        self.op_i32(op, 0)
    }

    /// Forward pop-and-branch; the delta lives after the pop count.
    pub fn pop_and_branch_forward(&mut self, pop: u8, label: Label) -> &mut Self {
        let site = self.code.len();
        self.patches.push(Patch::ForwardAt { site, offset: 2, label });
        self.op_u8_i32(Op::PopAndBranchWide, pop, 0)
    }

    /// Backward branch to an already-bound label; the encoded delta is
    /// positive and subtracted by the interpreter.
    pub fn branch_back(&mut self, op: Op, label: Label) -> &mut Self {
        let target = self.labels[label.0].expect("backward label unbound");
        let site = self.code.len();
        let delta = (site - target) as i32;
        match op {
            Op::BranchBack | Op::BranchBackIfTrue | Op::BranchBackIfFalse
                if delta <= u8::MAX as i32 =>
            {
                self.op_u8(op, delta as u8)
            }
            Op::BranchBack => self.op_i32(Op::BranchBackWide, delta),
            Op::BranchBackIfTrue => {
                self.op_i32(Op::BranchBackIfTrueWide, delta)
            }
            Op::BranchBackIfFalse => {
                self.op_i32(Op::BranchBackIfFalseWide, delta)
            }
            Op::BranchBackWide
            | Op::BranchBackIfTrueWide
            | Op::BranchBackIfFalseWide => self.op_i32(op, delta),
            _ => unreachable!("not a backward branch: {op:?}"),
        }
    }

    /// `SubroutineCall` to a forward `target`; `sub_return` must later be
    /// bound at the matching `SubroutineReturn` opcode.
    pub fn subroutine_call(&mut self, target: Label, sub_return: Label) -> &mut Self {
        let site = self.code.len();
        self.patches.push(Patch::Forward { site, label: target });
        self.patches
            .push(Patch::SubroutineReturn { site, label: sub_return });
        self.code.push(Op::SubroutineCall as u8);
        self.code.extend_from_slice(&0i32.to_le_bytes());
        self.code.extend_from_slice(&0i32.to_le_bytes());
        self
    }

    /// Append `MethodEnd`, resolve patches and return the bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.code.push(Op::MethodEnd as u8);
        for patch in &self.patches {
            match *patch {
                Patch::Forward { site, label } => {
                    let target = self.labels[label.0].expect("label unbound");
                    let delta = (target as i64 - site as i64) as i32;
                    self.code[site + 1..site + 5]
                        .copy_from_slice(&delta.to_le_bytes());
                }
                Patch::ForwardAt { site, offset, label } => {
                    let target = self.labels[label.0].expect("label unbound");
                    let delta = (target as i64 - site as i64) as i32;
                    self.code[site + offset..site + offset + 4]
                        .copy_from_slice(&delta.to_le_bytes());
                }
                Patch::SubroutineReturn { site, label } => {
                    let bound = self.labels[label.0].expect("label unbound");
                    let delta =
                        (bound as i64 - (site as i64 + 9)) as i32;
                    self.code[site + 5..site + 9]
                        .copy_from_slice(&delta.to_le_bytes());
                }
            }
        }
        self.code
    }
}

/// Read the i32 operand at `code[offset]`.
#[inline]
pub fn read_i32(code: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        code[offset],
        code[offset + 1],
        code[offset + 2],
        code[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_branch_patches_relative_delta() {
        let mut w = BytecodeWriter::new();
        let done = w.new_label();
        w.op(Op::LoadLiteralTrue);
        let site = w.here();
        w.branch_forward(Op::BranchIfFalseWide, done);
        w.op(Op::LoadLiteral0);
        w.bind(done);
        w.op(Op::Pop);
        let code = w.finish();

        let delta = read_i32(&code, site + 1) as usize;
        assert_eq!(code[site + delta], Op::Pop as u8);
        assert_eq!(*code.last().unwrap(), Op::MethodEnd as u8);
    }

    #[test]
    fn backward_branch_encodes_short_and_wide() {
        let mut w = BytecodeWriter::new();
        let top = w.new_label();
        w.bind(top);
        w.op(Op::LoadLiteral0);
        w.op(Op::Pop);
        let site = w.here();
        w.branch_back(Op::BranchBack, top);
        let code = w.finish();
        assert_eq!(code[site], Op::BranchBack as u8);
        assert_eq!(code[site + 1] as usize, site);
    }

    #[test]
    fn subroutine_call_return_delta() {
        let mut w = BytecodeWriter::new();
        let finally = w.new_label();
        let sub_ret = w.new_label();
        let call_site = w.here();
        w.subroutine_call(finally, sub_ret);
        w.op(Op::LoadLiteral0); // resume point
        w.op(Op::Pop);
        w.bind(finally);
        w.op(Op::LoadLiteral1);
        w.op(Op::Pop);
        w.bind(sub_ret);
        w.op(Op::SubroutineReturn);
        let code = w.finish();

        let delta = read_i32(&code, call_site + 1) as usize;
        assert_eq!(code[call_site + delta], Op::LoadLiteral1 as u8);
        let ret_delta = read_i32(&code, call_site + 5);
        let sub_return_at = call_site + delta + 2;
        // Advance(-ret_delta) from the SubroutineReturn resumes after the call.
        assert_eq!(sub_return_at as i64 - ret_delta as i64, call_site as i64 + 9);
    }
}
