//! Linear-scan register allocation with on-the-fly splitting.
//!
//! Two register banks (general-purpose and XMM) run the same algorithm;
//! the [`Bank`] trait carries the per-bank register file and storage
//! accessors. Fixed intervals (ABI reservations made by the lowering)
//! evict volatile holders; volatile intervals try a free register first
//! and otherwise either spill themselves or evict the holder whose next
//! use is farthest away.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use crate::vm::Function;

use super::abi;
use super::lifetime::Interval;
use super::lir::{UsageMap, Vr};
use super::operands::{OperandSize, Reg, Xmm};
use super::stack::{StackAllocator, StackSlot};

/// One register bank the scan can run over.
pub trait Bank {
    type PhysReg: Copy + Eq + Ord + std::fmt::Debug + 'static;

    fn registers() -> &'static [Self::PhysReg];
    fn get(interval: &Interval) -> Option<Self::PhysReg>;
    fn set(interval: &mut Interval, reg: Self::PhysReg);
}

/// The general-purpose bank.
pub struct IntBank;

impl Bank for IntBank {
    type PhysReg = Reg;

    fn registers() -> &'static [Reg] {
        &abi::INT_REGISTERS
    }

    fn get(interval: &Interval) -> Option<Reg> {
        interval.reg
    }

    fn set(interval: &mut Interval, reg: Reg) {
        interval.reg = Some(reg);
    }
}

/// The XMM bank.
pub struct FloatBank;

impl Bank for FloatBank {
    type PhysReg = Xmm;

    fn registers() -> &'static [Xmm] {
        &abi::FLOAT_REGISTERS
    }

    fn get(interval: &Interval) -> Option<Xmm> {
        interval.xmm
    }

    fn set(interval: &mut Interval, reg: Xmm) {
        interval.xmm = Some(reg);
    }
}

/// Allocation output: every interval with its storage decided, the
/// frozen frame layout, and the callee-saved registers to save around
/// the function body.
pub struct Allocation {
    pub intervals: Vec<Interval>,
    pub stack: StackAllocator,
    pub stack_frame_spills: Vec<(Reg, StackSlot)>,
}

pub struct RegisterAllocator<'a> {
    function: &'a Function,
    usages: &'a UsageMap,
    fixed_to_vr: &'a BTreeMap<Reg, Vr>,
    fixed_xmm_to_vr: &'a BTreeMap<Xmm, Vr>,
    overflow_arg_to_vr: &'a BTreeMap<u16, Vr>,
    hint_same: &'a BTreeSet<BTreeSet<Vr>>,

    unhandled: BinaryHeap<Reverse<Interval>>,
    active: Vec<Interval>,
    inactive: Vec<Interval>,
    handled: Vec<Interval>,
    fixed: Vec<Interval>,
    fixed_to_interval: BTreeMap<Reg, Interval>,
    fixed_xmm_to_interval: BTreeMap<Xmm, Interval>,
    used_registers: BTreeSet<Reg>,

    stack: StackAllocator,
    stack_frame_spills: Vec<(Reg, StackSlot)>,
}

impl<'a> RegisterAllocator<'a> {
    pub fn new(
        function: &'a Function,
        usages: &'a UsageMap,
        fixed_to_vr: &'a BTreeMap<Reg, Vr>,
        fixed_xmm_to_vr: &'a BTreeMap<Xmm, Vr>,
        overflow_arg_to_vr: &'a BTreeMap<u16, Vr>,
        hint_same: &'a BTreeSet<BTreeSet<Vr>>,
    ) -> Self {
        RegisterAllocator {
            function,
            usages,
            fixed_to_vr,
            fixed_xmm_to_vr,
            overflow_arg_to_vr,
            hint_same,
            unhandled: BinaryHeap::new(),
            active: Vec::new(),
            inactive: Vec::new(),
            handled: Vec::new(),
            fixed: Vec::new(),
            fixed_to_interval: BTreeMap::new(),
            fixed_xmm_to_interval: BTreeMap::new(),
            used_registers: BTreeSet::new(),
            stack: StackAllocator::new(),
            stack_frame_spills: Vec::new(),
        }
    }

    pub fn run(mut self, intervals: Vec<Interval>) -> Allocation {
        self.linear_scan(intervals);
        self.stack.freeze();
        Allocation {
            intervals: self.handled,
            stack: self.stack,
            stack_frame_spills: self.stack_frame_spills,
        }
    }

    fn linear_scan(&mut self, mut intervals: Vec<Interval>) {
        let vr_to_fixed: HashMap<Vr, Reg> =
            self.fixed_to_vr.iter().map(|(r, v)| (*v, *r)).collect();
        let vr_to_fixed_xmm: HashMap<Vr, Xmm> =
            self.fixed_xmm_to_vr.iter().map(|(x, v)| (*v, *x)).collect();
        let vr_to_overflow: HashMap<Vr, u16> = self
            .overflow_arg_to_vr
            .iter()
            .map(|(i, v)| (*v, *i))
            .collect();

        for interval in &mut intervals {
            interval.usages = self.usages.get(&interval.vr).cloned().unwrap_or_default();

            if let Some(&reg) = vr_to_fixed.get(&interval.vr) {
                interval.fixed = true;
                interval.reg = Some(reg);
                if !interval.spans.is_empty() {
                    self.fixed.push(interval.clone());
                }
            } else if let Some(&xmm) = vr_to_fixed_xmm.get(&interval.vr) {
                interval.fixed = true;
                interval.xmm = Some(xmm);
                if !interval.spans.is_empty() {
                    self.fixed.push(interval.clone());
                }
            } else if let Some(&index) = vr_to_overflow.get(&interval.vr) {
                interval.fixed = true;
                interval.stack = Some(self.stack.reserve_argument(index));
                if !interval.spans.is_empty() {
                    self.fixed.push(interval.clone());
                }
            }
        }

        log::trace!(target: "llines", "lifelines before register allocation: --------------");
        for interval in &intervals {
            if !interval.spans.is_empty() {
                log::trace!(target: "llines", "{}", interval.lifeline());
            }
        }

        for interval in intervals {
            if !interval.spans.is_empty() {
                self.unhandled.push(Reverse(interval));
            }
        }

        // parameter prelude: arguments sort first, so the first pops are
        // exactly the parameters
        let mut int_params = 0usize;
        let mut float_params = 0usize;
        let mut param_overflow = 0u16;
        for _ in 0..self.function.parameters.len() {
            let Some(Reverse(mut current)) = self.unhandled.pop() else {
                break;
            };

            if current.ty.is_floating_point() && float_params < abi::FLOAT_PARAMETERS.len() {
                current.xmm = Some(abi::FLOAT_PARAMETERS[float_params]);
                float_params += 1;
            } else if current.ty.is_integer() && int_params < abi::INT_PARAMETERS.len() {
                current.reg = Some(abi::INT_PARAMETERS[int_params]);
                self.used_registers.insert(abi::INT_PARAMETERS[int_params]);
                int_params += 1;
            } else {
                current.stack = Some(self.stack.reserve_parameter(param_overflow));
                param_overflow += 1;

                // a stack parameter that must later sit in a register is
                // split just before that use so the tail can be filled
                if current.has_register_usage() {
                    let at = current.first_register_usage().unwrap();
                    let tail = current.split(at);
                    self.unhandled.push(Reverse(tail));
                }
            }

            self.active.push(current);
        }

        while let Some(Reverse(mut current)) = self.unhandled.pop() {
            let position = current.start();

            log::trace!(
                target: "rlog",
                "---- processing i{} ({})",
                current.vr, position
            );

            self.migrate(position);

            if current.fixed {
                if let Some(reg) = current.reg {
                    self.fixed_to_interval.insert(reg, current.clone());
                    self.push_off_register::<IntBank>(position, reg);
                } else if let Some(xmm) = current.xmm {
                    self.fixed_xmm_to_interval.insert(xmm, current.clone());
                    self.push_off_register::<FloatBank>(position, xmm);
                }
                // stack-bound fixed intervals (overflow arguments) keep
                // their slot and need no register
            } else if current.ty.is_floating_point() {
                if !self.try_allocate_free_register::<FloatBank>(&mut current) {
                    self.allocate_blocked_register::<FloatBank>(&mut current);
                }
            } else {
                if !self.try_allocate_free_register::<IntBank>(&mut current) {
                    self.allocate_blocked_register::<IntBank>(&mut current);
                }
            }

            if let Some(reg) = current.reg {
                self.used_registers.insert(reg);
                log::trace!(
                    target: "rlog",
                    "assigned {} to i{} for {} - {}",
                    reg, current.vr, current.start(), current.end()
                );
                self.active.push(current);
            } else if let Some(xmm) = current.xmm {
                log::trace!(
                    target: "rlog",
                    "assigned {} to i{} for {} - {}",
                    xmm, current.vr, current.start(), current.end()
                );
                self.active.push(current);
            } else {
                log::trace!(
                    target: "rlog",
                    "assigned {:?} to i{} for {} - {}",
                    current.stack, current.vr, current.start(), current.end()
                );
                self.handled.push(current);
            }
        }

        let active = std::mem::take(&mut self.active);
        self.handled.extend(active);
        let inactive = std::mem::take(&mut self.inactive);
        self.handled.extend(inactive);

        // callee-saved registers get a save slot; the emitter stores
        // them at the prologue and restores at every return
        for &reg in &self.used_registers {
            if abi::CALLEE_SAVED.contains(&reg) {
                let slot = self.stack.reserve_scratch(OperandSize::Qword);
                self.stack_frame_spills.push((reg, slot));
            }
        }

        log::trace!(target: "llines", "lifelines after register allocation: ---------------");
        for interval in &self.handled {
            log::trace!(target: "llines", "{}", interval.lifeline());
        }
    }

    /// Move intervals between active/inactive/handled relative to the
    /// current position.
    fn migrate(&mut self, position: i32) {
        let mut i = 0;
        while i < self.active.len() {
            if self.active[i].end() < position {
                let done = self.active.remove(i);
                log::trace!(target: "rlog", "i{} (- {}) is done", done.vr, done.end());
                self.handled.push(done);
            } else if !self.active[i].covers(position) {
                let it = self.active.remove(i);
                self.inactive.push(it);
            } else {
                i += 1;
            }
        }

        let mut i = 0;
        while i < self.inactive.len() {
            if self.inactive[i].end() < position {
                let it = self.inactive.remove(i);
                self.handled.push(it);
            } else if self.inactive[i].covers(position) {
                let it = self.inactive.remove(i);
                self.active.push(it);
            } else {
                i += 1;
            }
        }
    }

    /// Try to place `current` in a register that is free (at least for a
    /// prefix of the interval). Splits `current` when the register is
    /// only free for a prefix.
    fn try_allocate_free_register<B: Bank>(&mut self, current: &mut Interval) -> bool {
        let mut free_until: BTreeMap<B::PhysReg, i32> =
            B::registers().iter().map(|r| (*r, i32::MAX)).collect();

        for it in &self.active {
            if let Some(reg) = B::get(it) {
                if let Some(entry) = free_until.get_mut(&reg) {
                    *entry = 0;
                }
            }
        }

        for it in self.inactive.iter().chain(self.fixed.iter()) {
            if let Some(reg) = B::get(it) {
                if let Some(at) = it.intersection(current) {
                    if let Some(entry) = free_until.get_mut(&reg) {
                        *entry = (*entry).min(at);
                    }
                }
            }
        }

        let reg = self.choose_free_register::<B>(current, &free_until);
        let free = free_until[&reg];

        // a register that is occupied again by the interval's own start
        // holds nothing; that includes the free == 0 case
        if free <= current.start() {
            return false;
        }

        B::set(current, reg);
        if current.end() >= free {
            // register only available for the first part
            let tail = current.split(free);
            self.unhandled.push(Reverse(tail));
        }
        true
    }

    /// Pick the register with the highest free-until position, biased
    /// toward registers other members of `current`'s phi hint set
    /// already hold.
    fn choose_free_register<B: Bank>(
        &self,
        current: &Interval,
        free_until: &BTreeMap<B::PhysReg, i32>,
    ) -> B::PhysReg {
        let mut hinted: BTreeSet<B::PhysReg> = BTreeSet::new();
        for set in self.hint_same {
            if !set.contains(&current.vr) {
                continue;
            }
            log::trace!(target: "rhints", "found hint for i{}", current.vr);
            for &other in set {
                for interval in &self.handled {
                    if interval.vr == other && interval.has_register() {
                        if let Some(reg) = B::get(interval) {
                            if free_until.contains_key(&reg) {
                                log::trace!(
                                    target: "rhints",
                                    "hinted register {:?} held by i{}",
                                    reg, other
                                );
                                hinted.insert(reg);
                            }
                        }
                    }
                }
            }
            break;
        }

        if !hinted.is_empty() {
            let mut best = None;
            for &reg in &hinted {
                match best {
                    None => best = Some(reg),
                    Some(b) if free_until[&reg] > free_until[&b] => best = Some(reg),
                    _ => {}
                }
            }
            let best = best.unwrap();
            if free_until[&best] != 0 {
                return best;
            }
            // every hinted register is occupied right now; fall through
        }

        let mut best = None;
        for (&reg, &free) in free_until {
            match best {
                None => best = Some((reg, free)),
                Some((_, best_free)) if free > best_free => best = Some((reg, free)),
                _ => {}
            }
        }
        best.expect("register bank is empty").0
    }

    /// No register is free: either spill `current` itself, or evict the
    /// holder whose next use is farthest away.
    fn allocate_blocked_register<B: Bank>(&mut self, current: &mut Interval) {
        let mut next_use: BTreeMap<B::PhysReg, i32> =
            B::registers().iter().map(|r| (*r, i32::MAX)).collect();

        let start = current.start();
        for it in &self.active {
            if let Some(reg) = B::get(it) {
                if it.fixed {
                    next_use.remove(&reg);
                } else if next_use.contains_key(&reg) {
                    let first = it
                        .usages
                        .range(start..)
                        .next()
                        .map(|(at, _)| *at)
                        .unwrap_or(i32::MAX);
                    next_use.insert(reg, first);
                }
            }
        }

        for i in 0..self.inactive.len() {
            let it = &self.inactive[i];
            if let Some(reg) = B::get(it) {
                if it.intersection(current).is_some() {
                    if it.fixed {
                        next_use.remove(&reg);
                    } else if next_use.contains_key(&reg) {
                        let first = it
                            .usages
                            .range(start..)
                            .next()
                            .map(|(at, _)| *at)
                            .unwrap_or(i32::MAX);
                        next_use.insert(reg, first);
                    }
                }
            }
        }

        for it in &self.fixed {
            if let Some(reg) = B::get(it) {
                if it.intersection(current).is_some() {
                    next_use.remove(&reg);
                }
            }
        }

        log::trace!(target: "rlog", "next use positions: {:?}", next_use);

        let mut chosen: Option<(B::PhysReg, i32)> = None;
        for (&reg, &pos) in &next_use {
            match chosen {
                None => chosen = Some((reg, pos)),
                Some((_, best)) if pos > best => chosen = Some((reg, pos)),
                _ => {}
            }
        }

        let spill_current = match chosen {
            None => true, // every register is blocked by a fixed interval
            Some((_, next)) => match current.first_usage() {
                None => true,
                Some(first) => first > next,
            },
        };

        if spill_current {
            // everyone else is used sooner; spill current itself,
            // reusing the slot of a split predecessor already on stack
            let starts_at = current.start();
            let vr = current.vr;
            let predecessor = self.handled.iter().find(|f| {
                f.has_follower
                    && f.vr == vr
                    && f.end() + 1 == starts_at
                    && f.reg.is_none()
                    && f.xmm.is_none()
            });

            if let Some(predecessor) = predecessor {
                log::trace!(target: "rlog", "reusing stack slot of split predecessor");
                current.stack = predecessor.stack;
            } else {
                current.stack = Some(self.stack.reserve_scratch(OperandSize::Qword));
            }

            log::trace!(target: "rlog", "spill i{}", vr);
            if current.has_register_usage() {
                let at = current.first_register_usage().unwrap();
                if at > current.start() {
                    let tail = current.split(at);
                    self.unhandled.push(Reverse(tail));
                }
            }
        } else {
            let (reg, _) = chosen.unwrap();
            B::set(current, reg);
            self.push_off_register::<B>(current.start(), reg);
        }

        // current must not overlap the fixed reservation of its register
        if let Some(reg) = current.reg {
            if let Some(fx) = self.fixed_to_interval.get(&reg) {
                let fx = fx.clone();
                if let Some(at) = current.intersection(&fx) {
                    if at > current.start() {
                        let tail = current.split(at);
                        self.unhandled.push(Reverse(tail));
                    }
                }
            }
        } else if let Some(xmm) = current.xmm {
            if let Some(fx) = self.fixed_xmm_to_interval.get(&xmm) {
                let fx = fx.clone();
                if let Some(at) = current.intersection(&fx) {
                    if at > current.start() {
                        let tail = current.split(at);
                        self.unhandled.push(Reverse(tail));
                    }
                }
            }
        }
    }

    /// Split whatever currently holds `reg` at `position` and reschedule
    /// the tails.
    fn push_off_register<B: Bank>(&mut self, position: i32, reg: B::PhysReg) {
        if let Some(idx) = self
            .active
            .iter()
            .position(|it| B::get(it) == Some(reg) && !it.fixed)
        {
            let tail = self.active[idx].split(position);
            self.unhandled.push(Reverse(tail));
        }

        // inactive holders lose the register at the end of their hole
        for i in 0..self.inactive.len() {
            if B::get(&self.inactive[i]) == Some(reg) && !self.inactive[i].fixed {
                log::trace!(target: "rlog", "splitting inactive holder at end of lifetime hole");
                let hole_end = self.inactive[i].end_of_hole(position);
                let tail = self.inactive[i].split(hole_end);
                self.unhandled.push(Reverse(tail));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::jit::lifetime::LifetimeAnalyzer;
    use crate::jit::lower::LirCompiler;
    use crate::vm::load_program;

    fn allocate(image: &[u8], function: usize) -> Allocation {
        let program = load_program(image).unwrap();
        let function = &program.functions[function];
        let mut lower = LirCompiler::new(&program, function);
        lower.run().unwrap();

        let vr_count = lower.vr_count();
        let intervals = LifetimeAnalyzer::new(
            &mut lower.blocks,
            vr_count,
            function.parameters.len(),
        )
        .run(&lower.vr_types);

        RegisterAllocator::new(
            function,
            &lower.usages,
            &lower.fixed_to_vr,
            &lower.fixed_xmm_to_vr,
            &lower.overflow_arg_to_vr,
            &lower.hint_same,
        )
        .run(intervals)
    }

    fn storage_of(allocation: &Allocation, position: i32, vr: Vr) -> &Interval {
        allocation
            .intervals
            .iter()
            .find(|i| i.vr == vr && !i.spans.is_empty() && i.start() <= position && i.end() >= position)
            .expect("no interval covers the position")
    }

    #[test]
    fn test_every_use_has_storage() {
        for image in [
            fixtures::trivial_return(1),
            fixtures::loop_sum(),
            fixtures::arithmetic(),
            fixtures::call_chain(),
            fixtures::spill_pressure(),
        ] {
            let program = load_program(&image).unwrap();
            let function = &program.functions[0];
            let mut lower = LirCompiler::new(&program, function);
            lower.run().unwrap();
            let vr_count = lower.vr_count();
            let intervals =
                LifetimeAnalyzer::new(&mut lower.blocks, vr_count, function.parameters.len())
                    .run(&lower.vr_types);
            let blocks = lower.blocks.clone();

            let allocation = RegisterAllocator::new(
                function,
                &lower.usages,
                &lower.fixed_to_vr,
                &lower.fixed_xmm_to_vr,
                &lower.overflow_arg_to_vr,
                &lower.hint_same,
            )
            .run(intervals);

            for block in &blocks {
                for lir in &block.lirs {
                    for vr in lir.inputs().into_iter().chain(lir.dst()) {
                        let interval = storage_of(&allocation, lir.id as i32, vr);
                        assert!(
                            interval.reg.is_some()
                                || interval.xmm.is_some()
                                || interval.stack.is_some(),
                            "i{} has no storage at {}",
                            vr,
                            lir.id
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_ranges_stay_disjoint_and_sorted() {
        let allocation = allocate(&fixtures::spill_pressure(), 0);
        for interval in &allocation.intervals {
            let spans: Vec<_> = interval.spans.iter().collect();
            for pair in spans.windows(2) {
                assert!(pair[0].to < pair[1].from, "overlapping ranges on i{}", interval.vr);
            }
        }
    }

    #[test]
    fn test_spill_pressure_uses_stack() {
        let allocation = allocate(&fixtures::spill_pressure(), 0);
        let spilled = allocation
            .intervals
            .iter()
            .any(|i| !i.fixed && i.stack.is_some() && i.reg.is_none());
        assert!(spilled, "eighteen live values must not fit the register file");
    }

    #[test]
    fn test_callee_saved_bookkeeping() {
        // enough live values to reach RBX/R12..R15
        let allocation = allocate(&fixtures::spill_pressure(), 0);
        assert!(!allocation.stack_frame_spills.is_empty());
        for (reg, slot) in &allocation.stack_frame_spills {
            assert!(abi::CALLEE_SAVED.contains(reg));
            assert_eq!(slot.kind, crate::jit::stack::StackKind::Scratch);
        }
    }

    #[test]
    fn test_parameters_take_abi_registers() {
        // addup(a, b): a in RDI, b in RSI at function entry
        let allocation = allocate(&fixtures::call_chain(), 1);
        let a = storage_of(&allocation, -1, 0);
        let b = storage_of(&allocation, -1, 1);
        assert_eq!(a.reg, Some(Reg::Rdi));
        assert_eq!(b.reg, Some(Reg::Rsi));
    }

    #[test]
    fn test_overflow_parameters_live_on_stack() {
        // sink() has twelve parameters; six arrive on the stack
        let allocation = allocate(&fixtures::register_pressure(), 1);
        for vr in 6..12u16 {
            let entry = storage_of(&allocation, -1, vr);
            assert!(entry.stack.is_some(), "parameter {} should start on the stack", vr);
        }
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let describe = |a: &Allocation| {
            let mut lines: Vec<String> = a
                .intervals
                .iter()
                .map(|i| format!("{:?} {:?} {:?} {:?}", i.vr, i.reg, i.xmm, i.stack))
                .collect();
            lines.sort();
            lines
        };
        let first = allocate(&fixtures::loop_sum(), 0);
        let second = allocate(&fixtures::loop_sum(), 0);
        assert_eq!(describe(&first), describe(&second));
    }

    #[test]
    fn test_fixed_intervals_keep_their_registers() {
        let allocation = allocate(&fixtures::arithmetic(), 0);
        for interval in allocation.intervals.iter().filter(|i| i.fixed) {
            if interval.stack.is_some() {
                continue;
            }
            assert!(interval.reg.is_some() || interval.xmm.is_some());
        }
    }
}
