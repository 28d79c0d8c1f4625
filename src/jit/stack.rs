//! Stack-frame slot allocation.
//!
//! Three regions grow independently while the register allocator runs:
//! outgoing call arguments at the bottom of the frame, scratch slots
//! (spills and callee-saved saves) above them, and incoming stack
//! parameters in the caller's frame. `freeze` picks padding so that RSP
//! is 16-byte aligned whenever a call pushes its return address.

use super::operands::{Mem, OperandSize, Reg};

/// What a stack slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StackKind {
    /// Incoming parameter of the current function.
    Parameter,
    /// Outgoing argument of a call made by the current function.
    Argument,
    Scratch,
}

/// A frame slot; `index` is a byte offset within the slot's region. All
/// slots are quadwords, `size` records the actual store width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StackSlot {
    pub kind: StackKind,
    pub size: OperandSize,
    pub index: u16,
}

/// Frame layout planner.
#[derive(Debug, Default)]
pub struct StackAllocator {
    bytes_arguments: u16,
    bytes_scratch: u16,
    padding: u16,
    frozen: bool,
}

impl StackAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the outgoing-argument slot with the given index.
    pub fn reserve_argument(&mut self, index: u16) -> StackSlot {
        assert!(!self.frozen, "stack layout modified after freeze");
        self.bytes_arguments = self.bytes_arguments.max((index + 1) * 8);
        StackSlot {
            kind: StackKind::Argument,
            size: OperandSize::Qword,
            index: index * 8,
        }
    }

    /// Reserve the incoming-parameter slot with the given index.
    pub fn reserve_parameter(&mut self, index: u16) -> StackSlot {
        StackSlot {
            kind: StackKind::Parameter,
            size: OperandSize::Qword,
            index: index * 8,
        }
    }

    /// Reserve a fresh scratch slot.
    pub fn reserve_scratch(&mut self, size: OperandSize) -> StackSlot {
        assert!(!self.frozen, "stack layout modified after freeze");
        let index = self.bytes_scratch;
        self.bytes_scratch += 8;
        StackSlot {
            kind: StackKind::Scratch,
            size,
            index,
        }
    }

    /// Fix the layout. Padding is chosen so the frame size is 8 mod 16:
    /// the caller's `call` already pushed 8 bytes, so RSP ends up
    /// 16-byte aligned at the next call instruction.
    pub fn freeze(&mut self) {
        self.frozen = true;

        let intermediate = self.bytes_scratch + self.bytes_arguments;
        self.padding = match intermediate % 16 {
            8 => 0,
            rem if rem < 8 => 8 - rem,
            rem => 16 - (rem - 8),
        };
    }

    pub fn frame_size(&self) -> u16 {
        self.bytes_arguments + self.padding + self.bytes_scratch
    }

    /// RSP-relative addressing for a slot; only valid after freeze.
    pub fn addressing(&self, slot: StackSlot) -> Mem {
        assert!(self.frozen, "cannot address stack slots before freeze");
        match slot.kind {
            StackKind::Argument => Mem::offset(Reg::Rsp, slot.index as i32),
            StackKind::Parameter => Mem::offset(
                Reg::Rsp,
                self.frame_size() as i32 + 8 + slot.index as i32,
            ),
            StackKind::Scratch => Mem::offset(
                Reg::Rsp,
                (self.bytes_arguments + self.padding + slot.index) as i32,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_padding() {
        // one scratch slot: 8 bytes, already 8 mod 16
        let mut stack = StackAllocator::new();
        stack.reserve_scratch(OperandSize::Qword);
        stack.freeze();
        assert_eq!(stack.frame_size(), 8);

        // two slots: 16 bytes, needs 8 of padding
        let mut stack = StackAllocator::new();
        stack.reserve_scratch(OperandSize::Qword);
        stack.reserve_scratch(OperandSize::Qword);
        stack.freeze();
        assert_eq!(stack.frame_size(), 24);

        // empty frame pads up to 8
        let mut stack = StackAllocator::new();
        stack.freeze();
        assert_eq!(stack.frame_size(), 8);
    }

    #[test]
    fn test_addressing() {
        let mut stack = StackAllocator::new();
        let arg0 = stack.reserve_argument(0);
        let arg1 = stack.reserve_argument(1);
        let scratch = stack.reserve_scratch(OperandSize::Qword);
        let param = stack.reserve_parameter(1);
        stack.freeze();

        // 16 argument bytes + 8 scratch = 24, already 8 mod 16
        assert_eq!(stack.frame_size(), 24);
        assert_eq!(stack.addressing(arg0), Mem::offset(Reg::Rsp, 0));
        assert_eq!(stack.addressing(arg1), Mem::offset(Reg::Rsp, 8));
        assert_eq!(stack.addressing(scratch), Mem::offset(Reg::Rsp, 16));
        // past the frame and the saved return address
        assert_eq!(stack.addressing(param), Mem::offset(Reg::Rsp, 24 + 8 + 8));
    }

    #[test]
    fn test_freeze_is_deterministic() {
        let build = || {
            let mut stack = StackAllocator::new();
            stack.reserve_argument(0);
            let slot = stack.reserve_scratch(OperandSize::Qword);
            stack.freeze();
            (stack.frame_size(), stack.addressing(slot))
        };
        assert_eq!(build(), build());
    }

    #[test]
    #[should_panic]
    fn test_no_reservation_after_freeze() {
        let mut stack = StackAllocator::new();
        stack.freeze();
        stack.reserve_scratch(OperandSize::Qword);
    }
}
