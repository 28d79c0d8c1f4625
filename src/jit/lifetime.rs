//! Live intervals and lifetime analysis.
//!
//! Intervals are built in a single reverse-linear walk over the lowered
//! blocks. Ranges are half-open at neither end: an interval covers every
//! instruction id between `from` and `to` inclusive. Parameters start at
//! -1 to model "live on entry".

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::vm::{BaseType, Type};

use super::lir::{Lir, LirOp, Usage, Vr};
use super::operands::{Reg, Xmm};
use super::stack::StackSlot;

/// One live range, inclusive at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifespan {
    pub from: i32,
    pub to: i32,
}

/// A lowered basic block: the LIR instructions plus the CFG edges copied
/// from the bytecode block.
#[derive(Debug, Clone)]
pub struct LirBlock {
    pub index: u16,
    pub successors: Vec<u16>,
    pub predecessors: Vec<u16>,
    pub lirs: Vec<Lir>,
    pub live_in: BTreeSet<Vr>,
}

impl LirBlock {
    pub fn new(index: u16, successors: Vec<u16>, predecessors: Vec<u16>) -> Self {
        LirBlock {
            index,
            successors,
            predecessors,
            lirs: Vec::new(),
            live_in: BTreeSet::new(),
        }
    }

    pub fn from_lir(&self) -> i32 {
        self.lirs.first().expect("block has no instructions").id as i32
    }

    pub fn to_lir(&self) -> i32 {
        self.lirs.last().expect("block has no instructions").id as i32
    }

    /// A block is a loop header when a block at or after it branches
    /// back to it.
    pub fn is_loop_header(&self, blocks: &[LirBlock]) -> bool {
        blocks[self.index as usize..]
            .iter()
            .any(|b| b.successors.contains(&self.index))
    }

    /// The maximal back-edge source for a loop header.
    pub fn loop_end(&self, blocks: &[LirBlock]) -> u16 {
        blocks[self.index as usize..]
            .iter()
            .filter(|b| b.successors.contains(&self.index))
            .map(|b| b.index)
            .max()
            .unwrap_or(self.index)
    }
}

/// A live interval for one virtual register.
#[derive(Debug, Clone)]
pub struct Interval {
    pub vr: Vr,
    /// Sorted, pairwise disjoint ranges; front has the smallest start.
    pub spans: VecDeque<Lifespan>,
    pub ty: Type,
    pub reg: Option<Reg>,
    pub xmm: Option<Xmm>,
    pub stack: Option<StackSlot>,
    pub argument: bool,
    /// The defining phi, when this vr is phi-defined.
    pub phi: Option<Lir>,
    /// Set when the interval was split; the follower starts at
    /// `end() + 1`.
    pub has_follower: bool,
    pub fixed: bool,
    pub usages: BTreeMap<i32, Usage>,
}

impl Interval {
    pub fn new(vr: Vr, ty: Type) -> Self {
        Interval {
            vr,
            spans: VecDeque::new(),
            ty,
            reg: None,
            xmm: None,
            stack: None,
            argument: false,
            phi: None,
            has_follower: false,
            fixed: false,
            usages: BTreeMap::new(),
        }
    }

    /// Add a range whose start is not after any existing start; ranges
    /// arrive in reverse program order. Overlapping ranges are merged.
    pub fn add_range(&mut self, mut new: Lifespan) {
        if let Some(front) = self.spans.front() {
            assert!(
                new.from <= front.from,
                "range [{}, {}] for i{} inserted out of order",
                new.from,
                new.to,
                self.vr
            );
        }

        // new starts at or before every span, so it overlaps exactly the
        // leading spans whose start it reaches
        while let Some(front) = self.spans.front() {
            if front.from > new.to + 1 {
                break;
            }
            new.to = new.to.max(front.to);
            self.spans.pop_front();
        }

        self.spans.push_front(new);
    }

    pub fn start(&self) -> i32 {
        self.spans.front().expect("interval has no ranges").from
    }

    pub fn end(&self) -> i32 {
        self.spans.back().expect("interval has no ranges").to
    }

    pub fn covers(&self, position: i32) -> bool {
        self.spans
            .iter()
            .any(|s| s.from <= position && s.to >= position)
    }

    pub fn intersects_with(&self, other: &Interval) -> bool {
        self.intersection(other).is_some()
    }

    /// The first position covered by both intervals.
    pub fn intersection(&self, other: &Interval) -> Option<i32> {
        let (mut i, mut j) = (0, 0);
        while i < self.spans.len() && j < other.spans.len() {
            let a = self.spans[i];
            let b = other.spans[j];
            if a.to < b.from {
                i += 1;
            } else if b.to < a.from {
                j += 1;
            } else {
                return Some(a.from.max(b.from));
            }
        }

        None
    }

    /// Split off the part of the interval at and after `at`; the tail is
    /// returned and this interval keeps the prefix.
    pub fn split(&mut self, at: i32) -> Interval {
        log::trace!(
            target: "rsplit",
            "splitting interval i{} (currently on {:?}/{:?}) at {}",
            self.vr, self.reg, self.xmm, at
        );

        let mut tail = Interval::new(self.vr, self.ty);
        tail.usages = self.usages.clone();
        tail.has_follower = self.has_follower;

        for i in 0..self.spans.len() {
            let span = self.spans[i];
            if span.from == at {
                tail.spans = self.spans.split_off(i);
                break;
            } else if span.from < at && span.to >= at {
                let mut rest = self.spans.split_off(i + 1);
                tail.spans.push_back(Lifespan { from: at, to: span.to });
                tail.spans.append(&mut rest);
                self.spans[i].to = at - 1;
                break;
            }
        }

        self.has_follower = true;

        assert!(
            !self.spans.is_empty() && !tail.spans.is_empty(),
            "splitting interval i{} at {} produced an empty half",
            self.vr,
            at
        );

        tail
    }

    /// First use at or after the interval's start.
    pub fn first_usage(&self) -> Option<i32> {
        let start = self.start();
        self.usages.range(start..).next().map(|(at, _)| *at)
    }

    pub fn has_usage(&self) -> bool {
        self.first_usage().is_some()
    }

    /// First use at or after the start that must sit in a register.
    pub fn first_register_usage(&self) -> Option<i32> {
        let start = self.start();
        self.usages
            .range(start..)
            .find(|(_, usage)| usage.must_have_reg)
            .map(|(at, _)| *at)
    }

    pub fn has_register_usage(&self) -> bool {
        let (start, end) = (self.start(), self.end());
        self.usages
            .range(start..=end)
            .any(|(_, usage)| usage.must_have_reg)
    }

    /// Start of the next range at or after `from`; the end of a lifetime
    /// hole.
    pub fn end_of_hole(&self, from: i32) -> i32 {
        self.spans
            .iter()
            .find(|s| s.from >= from)
            .map(|s| s.from)
            .expect("no lifetime hole after position")
    }

    pub fn has_register(&self) -> bool {
        if self.ty.is_floating_point() {
            self.xmm.is_some()
        } else {
            self.reg.is_some()
        }
    }

    /// Render the interval as a one-line lifeline for the `llines` log
    /// topic.
    pub fn lifeline(&self) -> String {
        let storage = if let Some(reg) = self.reg {
            format!("in register {:4}", reg.to_string())
        } else if let Some(xmm) = self.xmm {
            format!("in xmm      {:4}", xmm.to_string())
        } else if let Some(stack) = self.stack {
            format!("on stack {:?}", stack)
        } else {
            "unassigned".to_string()
        };

        let mut line = format!(
            "{} interval i{:<6} ({}): {}",
            if self.fixed { "fixed   " } else { "volatile" },
            self.vr,
            storage,
            if self.argument { "a" } else { "|" },
        );

        let mut position = 0i32;
        for span in &self.spans {
            while position < span.from {
                line.push(' ');
                position += 1;
            }
            while position <= span.to {
                line.push(match self.usages.get(&position) {
                    Some(u) if u.must_have_reg => 'r',
                    Some(_) => 'x',
                    None => 'o',
                });
                position += 1;
            }
        }

        line
    }
}

impl PartialEq for Interval {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Interval {}

impl PartialOrd for Interval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Interval {
    /// Queue order: start position, arguments first, fixed first,
    /// no-use before has-use, earlier first-use, then the vr index so
    /// ties collapse deterministically.
    fn cmp(&self, other: &Self) -> Ordering {
        self.start()
            .cmp(&other.start())
            .then_with(|| other.argument.cmp(&self.argument))
            .then_with(|| other.fixed.cmp(&self.fixed))
            .then_with(|| match (self.first_usage(), other.first_usage()) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(&b),
            })
            .then_with(|| self.vr.cmp(&other.vr))
    }
}

/// Compute live intervals for every virtual register.
pub struct LifetimeAnalyzer<'a> {
    blocks: &'a mut [LirBlock],
    vr_count: u16,
    parameter_count: usize,
}

impl<'a> LifetimeAnalyzer<'a> {
    pub fn new(blocks: &'a mut [LirBlock], vr_count: u16, parameter_count: usize) -> Self {
        LifetimeAnalyzer {
            blocks,
            vr_count,
            parameter_count,
        }
    }

    pub fn run(self, vr_types: &HashMap<Vr, Type>) -> Vec<Interval> {
        let mut intervals: Vec<Interval> = (0..self.vr_count)
            .map(|vr| {
                Interval::new(
                    vr,
                    vr_types
                        .get(&vr)
                        .copied()
                        .unwrap_or(Type::new(BaseType::Int64)),
                )
            })
            .collect();

        for bi in (0..self.blocks.len()).rev() {
            let (block_from, block_to) = (self.blocks[bi].from_lir(), self.blocks[bi].to_lir());

            // live = union of the successors' live-in sets, plus each
            // successor phi's input along this edge
            let mut live: BTreeSet<Vr> = BTreeSet::new();
            for si in self.blocks[bi].successors.clone() {
                let successor = &self.blocks[si as usize];
                live.extend(successor.live_in.iter().copied());
                for lir in &successor.lirs {
                    if let Some(input) = lir.phi_input_of(bi as u16) {
                        live.insert(input);
                    }
                }
            }

            // everything live across the block lives through all of it
            for &vr in &live {
                intervals[vr as usize].add_range(Lifespan {
                    from: block_from,
                    to: block_to,
                });
            }

            for li in (0..self.blocks[bi].lirs.len()).rev() {
                let lir = self.blocks[bi].lirs[li].clone();
                if matches!(lir.op, LirOp::Phi { .. }) {
                    continue;
                }

                for dst in lir.dst() {
                    let interval = &mut intervals[dst as usize];
                    if interval.spans.is_empty() {
                        // dead definition; give it a point of existence
                        log::trace!(target: "llog", "unused vr {}", dst);
                        interval.add_range(Lifespan {
                            from: -1,
                            to: block_to,
                        });
                    }
                    interval.spans.front_mut().unwrap().from = lir.id as i32;
                    live.remove(&dst);
                }

                for input in lir.inputs() {
                    intervals[input as usize].add_range(Lifespan {
                        from: block_from,
                        to: lir.id as i32,
                    });
                    live.insert(input);
                }

                for &clear in lir.clears() {
                    intervals[clear as usize].add_range(Lifespan {
                        from: lir.id as i32,
                        to: lir.id as i32,
                    });
                }
            }

            for li in (0..self.blocks[bi].lirs.len()).rev() {
                let lir = &self.blocks[bi].lirs[li];
                if let LirOp::Phi { dst, .. } = lir.op {
                    live.remove(&dst);
                    intervals[dst as usize].phi = Some(lir.clone());
                }
            }

            // keep loop-carried values alive through the whole loop
            if self.blocks[bi].is_loop_header(self.blocks) {
                let end = self.blocks[bi].loop_end(self.blocks);
                let loop_to = self.blocks[end as usize].to_lir();
                for &vr in &live {
                    intervals[vr as usize].add_range(Lifespan {
                        from: block_from,
                        to: loop_to,
                    });
                }
            }

            self.blocks[bi].live_in = live;
        }

        for i in 0..self.parameter_count {
            let interval = &mut intervals[i];
            interval.argument = true;
            if interval.spans.is_empty() {
                interval.add_range(Lifespan { from: -1, to: -1 });
            } else {
                interval.spans.front_mut().unwrap().from = -1;
            }
        }

        for interval in &intervals {
            if !interval.spans.is_empty() {
                log::trace!(
                    target: "lrange",
                    "{} ranges: {:?}",
                    interval.vr,
                    interval.spans
                );
            }
        }

        intervals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::lir::MovArg;
    use crate::jit::operands::OperandSize;

    fn span(from: i32, to: i32) -> Lifespan {
        Lifespan { from, to }
    }

    fn interval() -> Interval {
        Interval::new(0, Type::new(BaseType::Int64))
    }

    #[test]
    fn test_add_range_merges_overlap() {
        let mut i = interval();
        i.add_range(span(10, 12));
        i.add_range(span(5, 6));
        i.add_range(span(2, 10));
        assert_eq!(i.spans, vec![span(2, 12)]);
    }

    #[test]
    fn test_add_range_keeps_holes() {
        let mut i = interval();
        i.add_range(span(20, 30));
        i.add_range(span(5, 8));
        assert_eq!(i.spans, vec![span(5, 8), span(20, 30)]);
        assert!(i.covers(7));
        assert!(!i.covers(10));
        assert!(i.covers(20));
    }

    #[test]
    #[should_panic]
    fn test_add_range_rejects_out_of_order() {
        let mut i = interval();
        i.add_range(span(5, 8));
        i.add_range(span(9, 10));
    }

    #[test]
    fn test_split_inside_span() {
        let mut i = interval();
        i.add_range(span(10, 20));
        i.add_range(span(0, 5));

        let tail = i.split(12);
        assert_eq!(i.spans, vec![span(0, 5), span(10, 11)]);
        assert_eq!(tail.spans, vec![span(12, 20)]);
        assert!(i.has_follower);
        assert_eq!(i.end() + 1, tail.start());
    }

    #[test]
    fn test_split_at_span_boundary() {
        let mut i = interval();
        i.add_range(span(10, 20));
        i.add_range(span(0, 5));

        let tail = i.split(10);
        assert_eq!(i.spans, vec![span(0, 5)]);
        assert_eq!(tail.spans, vec![span(10, 20)]);
    }

    #[test]
    fn test_intersection() {
        let mut a = interval();
        a.add_range(span(10, 20));
        a.add_range(span(0, 5));

        let mut b = interval();
        b.add_range(span(7, 12));

        assert_eq!(a.intersection(&b), Some(10));
        assert!(a.intersects_with(&b));

        let mut c = interval();
        c.add_range(span(6, 9));
        assert_eq!(a.intersection(&c), None);
    }

    #[test]
    fn test_queue_order_is_deterministic() {
        let mut a = interval();
        a.add_range(span(0, 5));
        let mut b = Interval::new(1, Type::new(BaseType::Int64));
        b.add_range(span(0, 5));

        // identical except for the vr: ties collapse on the index
        assert_eq!(a.cmp(&b), Ordering::Less);
        assert_eq!(b.cmp(&a), Ordering::Greater);

        let mut fixed = Interval::new(2, Type::new(BaseType::Int64));
        fixed.add_range(span(0, 5));
        fixed.fixed = true;
        assert_eq!(fixed.cmp(&a), Ordering::Less);
    }

    fn mov(id: u16, dst: Vr, src: Vr) -> Lir {
        Lir {
            id,
            op: LirOp::Mov {
                dst,
                src: MovArg::Vr(src),
                size: OperandSize::Qword,
            },
        }
    }

    fn mov_imm(id: u16, dst: Vr) -> Lir {
        Lir {
            id,
            op: LirOp::Mov {
                dst,
                src: MovArg::Imm(1),
                size: OperandSize::Qword,
            },
        }
    }

    #[test]
    fn test_straight_line_liveness() {
        // block 0: 0: mov v0, $1 / 1: mov v1, v0 / 2: ret
        let mut blocks = vec![LirBlock::new(0, vec![], vec![])];
        blocks[0].lirs = vec![
            mov_imm(0, 0),
            mov(1, 1, 0),
            Lir { id: 2, op: LirOp::Ret },
        ];

        let types = HashMap::new();
        let intervals = LifetimeAnalyzer::new(&mut blocks, 2, 0).run(&types);

        assert_eq!(intervals[0].start(), 0);
        assert_eq!(intervals[0].end(), 1);
        assert_eq!(intervals[1].start(), 1);
    }

    #[test]
    fn test_loop_extends_carried_values() {
        // block 0 defines v0; block 1 (header) uses nothing but loops
        // back from block 2 which uses v0; v0 must live through the
        // whole loop body.
        let mut blocks = vec![
            LirBlock::new(0, vec![1], vec![]),
            LirBlock::new(1, vec![2], vec![0, 2]),
            LirBlock::new(2, vec![1], vec![1]),
        ];
        blocks[0].lirs = vec![
            mov_imm(0, 0),
            Lir { id: 1, op: LirOp::Jmp { target: 1 } },
        ];
        blocks[1].lirs = vec![Lir { id: 2, op: LirOp::Jmp { target: 2 } }];
        blocks[2].lirs = vec![
            mov(3, 1, 0),
            Lir { id: 4, op: LirOp::Jnz { target: 1 } },
        ];

        let types = HashMap::new();
        let intervals = LifetimeAnalyzer::new(&mut blocks, 2, 0).run(&types);

        // v0 covers the loop header through the back-edge block
        assert!(intervals[0].covers(2));
        assert!(intervals[0].covers(3));
        assert_eq!(intervals[0].start(), 0);
        assert_eq!(intervals[0].end(), 4);
    }

    #[test]
    fn test_clear_creates_point_range() {
        let mut blocks = vec![LirBlock::new(0, vec![], vec![])];
        blocks[0].lirs = vec![
            mov_imm(0, 0),
            Lir {
                id: 1,
                op: LirOp::Call {
                    function: 0,
                    dst: None,
                    args: vec![],
                    clears: vec![1],
                },
            },
            Lir { id: 2, op: LirOp::Ret },
        ];

        let types = HashMap::new();
        let intervals = LifetimeAnalyzer::new(&mut blocks, 2, 0).run(&types);
        assert_eq!(intervals[1].spans, vec![span(1, 1)]);
    }
}
