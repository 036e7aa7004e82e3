// File: src/builder.rs
//
// The compiler's mutable counterpart to `bytecode::Code`. A `CodeBuilder`
// accumulates instructions, constants, names, locations and handlers while
// the compiler walks a function body; `freeze()` copies everything into an
// immutable `Code` (see `Code::new`'s defensive-copy contract) and the
// builder itself may keep being reused by the caller afterward.
//
// Split out of `bytecode.rs` the way `monty`'s `bytecode/builder.rs` is split
// from `bytecode/code.rs`: construction logic and the frozen artifact are
// different lifecycles and shouldn't share one API surface.

use std::rc::Rc;

use crate::bytecode::{Code, Constant, ExceptionHandler, FunctionTemplate};
use crate::errors::SourceLocation;
use crate::opcode::{Opcode, PLACEHOLDER};

pub struct JumpTooFar;

pub struct CodeBuilder {
    id: String,
    name: Option<String>,
    is_named: bool,
    function_id: u32,
    instructions: Vec<u16>,
    constants: Vec<Constant>,
    names: Vec<String>,
    locations: Vec<SourceLocation>,
    handlers: Vec<ExceptionHandler>,
    global_names: Vec<String>,
    local_names: Vec<String>,
    env_keys: Vec<String>,
    max_call_args: u16,
    children: Vec<Rc<Code>>,
    filename: String,
    source: String,
}

impl CodeBuilder {
    pub fn new(id: String, function_id: u32, filename: String, source: String) -> Self {
        Self {
            id,
            name: None,
            is_named: false,
            function_id,
            instructions: Vec::new(),
            constants: Vec::new(),
            names: Vec::new(),
            locations: Vec::new(),
            handlers: Vec::new(),
            global_names: Vec::new(),
            local_names: Vec::new(),
            env_keys: Vec::new(),
            max_call_args: 0,
            children: Vec::new(),
            filename,
            source,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_name(&mut self, name: Option<String>, is_named: bool) {
        self.name = name;
        self.is_named = is_named;
    }

    pub fn set_global_names(&mut self, names: Vec<String>) {
        self.global_names = names;
    }

    pub fn set_local_names(&mut self, names: Vec<String>) {
        self.local_names = names;
    }

    pub fn set_env_keys(&mut self, keys: Vec<String>) {
        self.env_keys = keys;
    }

    pub fn add_child(&mut self, child: Rc<Code>) {
        self.children.push(child);
    }

    /// Constant pool insertion. De-duplication is explicitly not required (§3);
    /// every literal gets its own slot.
    pub fn add_constant(&mut self, constant: Constant) -> u16 {
        let idx = self.constants.len();
        self.constants.push(constant);
        idx as u16
    }

    pub fn add_function_constant(&mut self, template: Rc<FunctionTemplate>) -> u16 {
        self.add_constant(Constant::Function(template))
    }

    /// Attribute/method name table, used by `LoadAttr`/`StoreAttr`. Reuses an
    /// existing slot for a repeated name.
    pub fn add_name(&mut self, name: &str) -> u16 {
        if let Some(idx) = self.names.iter().position(|n| n == name) {
            return idx as u16;
        }
        let idx = self.names.len();
        self.names.push(name.to_string());
        idx as u16
    }

    pub fn position(&self) -> usize {
        self.instructions.len()
    }

    /// Emits `op` plus its operand words, recording `loc` once per emitted
    /// word (§4.4 "Emit"). Returns the index of the opcode word so jumps can
    /// be patched later. Tracks `max_call_args` for `Call`.
    pub fn emit(&mut self, op: Opcode, operands: &[u16], loc: SourceLocation) -> usize {
        debug_assert_eq!(operands.len(), op.operand_count());
        let idx = self.instructions.len();
        self.instructions.push(op as u16);
        self.locations.push(loc);
        for &operand in operands {
            self.instructions.push(operand);
            self.locations.push(loc);
        }
        if op == Opcode::Call {
            self.max_call_args = self.max_call_args.max(operands[0]);
        }
        idx
    }

    pub fn emit0(&mut self, op: Opcode, loc: SourceLocation) -> usize {
        self.emit(op, &[], loc)
    }

    pub fn emit1(&mut self, op: Opcode, operand: u16, loc: SourceLocation) -> usize {
        self.emit(op, &[operand], loc)
    }

    /// Patches the `operand_idx`-th operand (0-based) of the instruction at
    /// `jump_pos` with the forward delta to the current position. Fails with
    /// `JumpTooFar` if the delta would reach the reserved placeholder value.
    pub fn patch_jump(&mut self, jump_pos: usize, operand_idx: usize) -> Result<(), JumpTooFar> {
        let target = self.instructions.len();
        self.patch_jump_to(jump_pos, operand_idx, target)
    }

    pub fn patch_jump_to(
        &mut self,
        jump_pos: usize,
        operand_idx: usize,
        target: usize,
    ) -> Result<(), JumpTooFar> {
        let delta = target as isize - jump_pos as isize;
        if !(0..(PLACEHOLDER as isize)).contains(&delta) {
            return Err(JumpTooFar);
        }
        self.instructions[jump_pos + 1 + operand_idx] = delta as u16;
        Ok(())
    }

    /// Computes the backward delta for a `JumpBackward` emitted now, targeting
    /// an already-known earlier position (loop heads).
    pub fn backward_delta(&self, from_pos: usize, target: usize) -> Result<u16, JumpTooFar> {
        let delta = from_pos as isize - target as isize;
        if !(0..(PLACEHOLDER as isize)).contains(&delta) {
            return Err(JumpTooFar);
        }
        Ok(delta as u16)
    }

    pub fn add_handler(&mut self, handler: ExceptionHandler) {
        self.handlers.push(handler);
    }

    pub fn handlers_len(&self) -> usize {
        self.handlers.len()
    }

    pub fn last_handler_index(&self) -> usize {
        self.handlers.len() - 1
    }

    pub fn patch_handler(&mut self, idx: usize, f: impl FnOnce(&mut ExceptionHandler)) {
        f(&mut self.handlers[idx]);
    }

    /// Freezes the builder into an immutable `Code`, defensively copying every
    /// buffer (`Code::new`'s contract) and installing parent back-links on the
    /// collected children.
    pub fn freeze(self, local_count: u16, global_count: u16) -> Rc<Code> {
        Code::new(
            self.id,
            self.name,
            self.is_named,
            self.function_id,
            self.children,
            &self.instructions,
            &self.constants,
            &self.names,
            &self.locations,
            &self.handlers,
            &self.global_names,
            &self.local_names,
            &self.env_keys,
            self.max_call_args,
            local_count,
            global_count,
            self.filename,
            self.source,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SourceLocation;

    #[test]
    fn jump_patch_lands_on_instruction_boundary() {
        let mut b = CodeBuilder::new("root".to_string(), 0, "<test>".to_string(), String::new());
        let jump = b.emit1(Opcode::JumpForward, PLACEHOLDER, SourceLocation::zero());
        b.emit0(Opcode::Nil, SourceLocation::zero());
        b.patch_jump(jump, 0).unwrap();
        let code = b.freeze(0, 0);
        // decoding from the patched delta should land exactly on the Nil opcode.
        let target = jump + 1 + code.instructions()[jump + 1] as usize;
        assert_eq!(code.opcode_at(target), Opcode::Nil);
    }

    #[test]
    fn call_tracks_max_call_args() {
        let mut b = CodeBuilder::new("root".to_string(), 0, "<test>".to_string(), String::new());
        b.emit1(Opcode::Call, 2, SourceLocation::zero());
        b.emit1(Opcode::Call, 5, SourceLocation::zero());
        let code = b.freeze(0, 0);
        assert_eq!(code.max_call_args(), 5);
    }
}
