//! SSA Control-Flow Graph
//!
//! The per-frame graph the specializer works on. Instructions live in one
//! arena and are threaded into a doubly-linked order per basic block, so
//! passes can insert before an arbitrary anchor and delete in place while
//! holding stable instruction ids. Registers are `(original, version)`
//! pairs; the graph tracks the current version of every original and can
//! mint fresh originals of any kind for synthetic values.
//!
//! Manipulation primitives here keep the use-lists in the facts table
//! consistent: appending or inserting an instruction records its writer
//! and read usages, deleting one removes them.

use super::facts::{FactFlags, FactsTable};
use super::model::StableId;
use super::pea::DeoptPea;
use super::{SpeshError, SpeshResult};

/// An SSA register version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg {
    pub orig: u16,
    pub version: u16,
}

/// Register kinds the frame can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegKind {
    /// Object reference
    Obj,
    /// 64-bit signed integer
    Int64,
    /// 64-bit float
    Num64,
    /// String reference
    Str,
    /// Raw big-integer handle
    BigInt,
}

/// Instruction id in the graph's instruction arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InsId(pub u32);

/// Basic block id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// One instruction operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    Reg(Reg),
    Lit(i64),
    /// Index into the graph's spesh slots
    Slot(u16),
    /// Attribute byte offset within an object body
    Offset(u16),
    /// Branch target
    Block(BlockId),
}

impl Operand {
    pub fn reg(self) -> Reg {
        match self {
            Operand::Reg(r) => r,
            other => panic!("operand is not a register: {:?}", other),
        }
    }

    pub fn lit(self) -> i64 {
        match self {
            Operand::Lit(v) => v,
            other => panic!("operand is not a literal: {:?}", other),
        }
    }

    pub fn slot(self) -> u16 {
        match self {
            Operand::Slot(s) => s,
            other => panic!("operand is not a spesh slot: {:?}", other),
        }
    }

    pub fn offset(self) -> u16 {
        match self {
            Operand::Offset(o) => o,
            other => panic!("operand is not an attribute offset: {:?}", other),
        }
    }
}

/// Read/write classification of an operand slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rw {
    Write,
    Read,
    Literal,
}

/// Static description of an opcode
#[derive(Debug)]
pub struct OpDesc {
    pub name: &'static str,
    pub operands: &'static [Rw],
    /// Operands beyond the described ones are reads (phi)
    pub variadic_reads: bool,
    /// Executing this instruction may trigger deoptimization
    pub may_deopt: bool,
    pub terminator: bool,
}

/// Opcodes of the specialized frame instruction set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    NoOp,
    Set,
    ConstI64,
    Goto,
    IfI,
    Phi,
    ReturnI,
    ReturnO,
    ArgI,
    ArgN,
    ArgS,
    ArgO,
    ArgConstI,
    ArgConstN,
    ArgConstS,
    Invoke,
    FastCreate,
    MaterializeBig,
    ProfAllocated,
    ProfReplaced,
    GetSlot,
    Clone,
    BindAttrI64,
    BindAttrNum,
    BindAttrStr,
    BindAttrObj,
    GetAttrI64,
    GetAttrNum,
    GetAttrStr,
    GetAttrObj,
    GetAttrVivType,
    GetAttrVivClone,
    GetBigRef,
    BindBigRef,
    DecontI,
    UnboxBigRef,
    GuardConc,
    AddBig,
    SubBig,
    MulBig,
    GcdBig,
    NegBig,
    AbsBig,
    CmpBig,
    EqBig,
    NeBig,
    LtBig,
    LeBig,
    GtBig,
    GeBig,
    AddBigRef,
    SubBigRef,
    MulBigRef,
    GcdBigRef,
    NegBigRef,
    AbsBigRef,
    CmpBigRef,
    EqBigRef,
    NeBigRef,
    LtBigRef,
    LeBigRef,
    GtBigRef,
    GeBigRef,
}

impl Op {
    pub fn desc(self) -> &'static OpDesc {
        use Rw::{Literal as L, Read as R, Write as W};
        macro_rules! desc {
            ($name:expr, [$($rw:expr),*]) => {
                desc!($name, [$($rw),*], may_deopt: false, terminator: false)
            };
            ($name:expr, [$($rw:expr),*], may_deopt: $d:expr, terminator: $t:expr) => {
                &OpDesc {
                    name: $name,
                    operands: &[$($rw),*],
                    variadic_reads: false,
                    may_deopt: $d,
                    terminator: $t,
                }
            };
        }
        match self {
            Op::NoOp => desc!("no_op", []),
            Op::Set => desc!("set", [W, R]),
            Op::ConstI64 => desc!("const_i64", [W, L]),
            Op::Goto => desc!("goto", [L], may_deopt: false, terminator: true),
            Op::IfI => desc!("if_i", [R, L], may_deopt: false, terminator: true),
            Op::Phi => &OpDesc {
                name: "phi",
                operands: &[W],
                variadic_reads: true,
                may_deopt: false,
                terminator: false,
            },
            Op::ReturnI => desc!("return_i", [R], may_deopt: false, terminator: true),
            Op::ReturnO => desc!("return_o", [R], may_deopt: false, terminator: true),
            Op::ArgI => desc!("arg_i", [R]),
            Op::ArgN => desc!("arg_n", [R]),
            Op::ArgS => desc!("arg_s", [R]),
            Op::ArgO => desc!("arg_o", [R]),
            Op::ArgConstI => desc!("argconst_i", [L]),
            Op::ArgConstN => desc!("argconst_n", [L]),
            Op::ArgConstS => desc!("argconst_s", [L]),
            Op::Invoke => desc!("invoke", [W, R], may_deopt: true, terminator: false),
            Op::FastCreate => desc!("fastcreate", [W, L, L]),
            Op::MaterializeBig => desc!("materialize_big", [W, L, L, L, R, L]),
            Op::ProfAllocated => desc!("prof_allocated", [R]),
            Op::ProfReplaced => desc!("prof_replaced", [L]),
            Op::GetSlot => desc!("getslot", [W, L]),
            Op::Clone => desc!("clone", [W, R]),
            Op::BindAttrI64 => desc!("bindattr_i64", [R, L, R]),
            Op::BindAttrNum => desc!("bindattr_n", [R, L, R]),
            Op::BindAttrStr => desc!("bindattr_s", [R, L, R]),
            Op::BindAttrObj => desc!("bindattr_o", [R, L, R]),
            Op::GetAttrI64 => desc!("getattr_i64", [W, R, L]),
            Op::GetAttrNum => desc!("getattr_n", [W, R, L]),
            Op::GetAttrStr => desc!("getattr_s", [W, R, L]),
            Op::GetAttrObj => desc!("getattr_o", [W, R, L]),
            Op::GetAttrVivType => desc!("getattr_vt_o", [W, R, L, L]),
            Op::GetAttrVivClone => desc!("getattr_vc_o", [W, R, L, L]),
            Op::GetBigRef => desc!("get_bigref", [W, R, L]),
            Op::BindBigRef => desc!("bind_bigref", [R, L, R]),
            Op::DecontI => desc!("decont_i", [W, R]),
            Op::UnboxBigRef => desc!("unbox_bigref", [W, R]),
            Op::GuardConc => desc!("guardconc", [W, R, L], may_deopt: true, terminator: false),
            Op::AddBig => desc!("add_big", [W, R, R, R]),
            Op::SubBig => desc!("sub_big", [W, R, R, R]),
            Op::MulBig => desc!("mul_big", [W, R, R, R]),
            Op::GcdBig => desc!("gcd_big", [W, R, R, R]),
            Op::NegBig => desc!("neg_big", [W, R, R]),
            Op::AbsBig => desc!("abs_big", [W, R, R]),
            Op::CmpBig => desc!("cmp_big", [W, R, R]),
            Op::EqBig => desc!("eq_big", [W, R, R]),
            Op::NeBig => desc!("ne_big", [W, R, R]),
            Op::LtBig => desc!("lt_big", [W, R, R]),
            Op::LeBig => desc!("le_big", [W, R, R]),
            Op::GtBig => desc!("gt_big", [W, R, R]),
            Op::GeBig => desc!("ge_big", [W, R, R]),
            Op::AddBigRef => desc!("add_bigref", [W, R, R]),
            Op::SubBigRef => desc!("sub_bigref", [W, R, R]),
            Op::MulBigRef => desc!("mul_bigref", [W, R, R]),
            Op::GcdBigRef => desc!("gcd_bigref", [W, R, R]),
            Op::NegBigRef => desc!("neg_bigref", [W, R]),
            Op::AbsBigRef => desc!("abs_bigref", [W, R]),
            Op::CmpBigRef => desc!("cmp_bigref", [W, R, R]),
            Op::EqBigRef => desc!("eq_bigref", [W, R, R]),
            Op::NeBigRef => desc!("ne_bigref", [W, R, R]),
            Op::LtBigRef => desc!("lt_bigref", [W, R, R]),
            Op::LeBigRef => desc!("le_bigref", [W, R, R]),
            Op::GtBigRef => desc!("gt_bigref", [W, R, R]),
            Op::GeBigRef => desc!("ge_bigref", [W, R, R]),
        }
    }

    pub fn name(self) -> &'static str {
        self.desc().name
    }

    pub fn may_deopt(self) -> bool {
        self.desc().may_deopt
    }

    /// Read/write classification of operand `idx`.
    pub fn rw(self, idx: usize) -> Rw {
        let desc = self.desc();
        if idx < desc.operands.len() {
            desc.operands[idx]
        } else if desc.variadic_reads {
            Rw::Read
        } else {
            panic!("operand index {} out of range for {}", idx, desc.name)
        }
    }
}

/// Kind of a deoptimization annotation on an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeoptAnnKind {
    /// Deopt retries this one instruction in the interpreter
    OneIns,
    /// Deopt resumes before this instruction
    AllIns,
    /// Deopt unwinds an inlined frame
    Inline,
    /// Synthetic index used only to look up recorded deopt usages
    Synth,
}

/// A deoptimization annotation: this instruction can bail out to the
/// interpreter at the given deopt table index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeoptAnn {
    pub kind: DeoptAnnKind,
    pub idx: u32,
}

/// One instruction
#[derive(Debug, Clone)]
pub struct Ins {
    pub op: Op,
    pub operands: Vec<Operand>,
    pub block: BlockId,
    pub prev: Option<InsId>,
    pub next: Option<InsId>,
    pub anns: Vec<DeoptAnn>,
    pub comment: Option<String>,
    pub deleted: bool,
}

/// One basic block
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub first: Option<InsId>,
    pub last: Option<InsId>,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    /// Position in the reverse-postorder sort of the graph
    pub rpo_idx: u32,
}

/// The per-frame SSA graph
#[derive(Debug)]
pub struct Graph {
    /// Frame name, for logging
    pub name: String,
    /// Basic blocks in linear (bytecode) order
    pub blocks: Vec<BasicBlock>,
    inss: Vec<Ins>,
    pub entry: BlockId,
    reg_kinds: Vec<RegKind>,
    cur_versions: Vec<u16>,
    /// Interned constant objects referenced by specialized code
    pub spesh_slots: Vec<StableId>,
    pub facts: FactsTable,
    /// Escape-analysis deopt side tables, appended by the PEA pass
    pub deopt_pea: DeoptPea,
}

impl Graph {
    fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            blocks: Vec::new(),
            inss: Vec::new(),
            entry: BlockId(0),
            reg_kinds: Vec::new(),
            cur_versions: Vec::new(),
            spesh_slots: Vec::new(),
            facts: FactsTable::new(),
            deopt_pea: DeoptPea::default(),
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn ins(&self, id: InsId) -> &Ins {
        &self.inss[id.0 as usize]
    }

    pub fn ins_mut(&mut self, id: InsId) -> &mut Ins {
        &mut self.inss[id.0 as usize]
    }

    pub fn reg_kind(&self, orig: u16) -> RegKind {
        self.reg_kinds[orig as usize]
    }

    /// Mint a fresh original register of the given kind.
    pub fn unique_reg(&mut self, kind: RegKind) -> u16 {
        let orig = self.reg_kinds.len() as u16;
        self.reg_kinds.push(kind);
        self.cur_versions.push(0);
        orig
    }

    /// The current version of an original register.
    pub fn current_version(&self, orig: u16) -> Reg {
        Reg {
            orig,
            version: self.cur_versions[orig as usize],
        }
    }

    /// Allocate a new version of an original register.
    pub fn new_version(&mut self, orig: u16) -> Reg {
        self.cur_versions[orig as usize] += 1;
        Reg {
            orig,
            version: self.cur_versions[orig as usize],
        }
    }

    /// Intern a constant object, always appending a fresh slot.
    pub fn add_slot(&mut self, stable: StableId) -> u16 {
        let idx = self.spesh_slots.len() as u16;
        self.spesh_slots.push(stable);
        idx
    }

    /// Intern a constant object, reusing an existing slot if one holds it.
    pub fn add_slot_try_reuse(&mut self, stable: StableId) -> u16 {
        match self.spesh_slots.iter().position(|s| *s == stable) {
            Some(idx) => idx as u16,
            None => self.add_slot(stable),
        }
    }

    pub fn slot(&self, idx: u16) -> StableId {
        self.spesh_slots[idx as usize]
    }

    /// Append an instruction to a block, recording writer and usages.
    pub fn add_ins(&mut self, block: BlockId, op: Op, operands: Vec<Operand>) -> InsId {
        let id = InsId(self.inss.len() as u32);
        let prev = self.blocks[block.0 as usize].last;
        self.inss.push(Ins {
            op,
            operands,
            block,
            prev,
            next: None,
            anns: Vec::new(),
            comment: None,
            deleted: false,
        });
        match prev {
            Some(p) => self.inss[p.0 as usize].next = Some(id),
            None => self.blocks[block.0 as usize].first = Some(id),
        }
        self.blocks[block.0 as usize].last = Some(id);
        self.record_operand_bookkeeping(id);
        id
    }

    /// Insert an instruction immediately before an anchor, recording
    /// writer and usages.
    pub fn insert_before(&mut self, anchor: InsId, op: Op, operands: Vec<Operand>) -> InsId {
        let id = InsId(self.inss.len() as u32);
        let (block, prev) = {
            let a = &self.inss[anchor.0 as usize];
            (a.block, a.prev)
        };
        self.inss.push(Ins {
            op,
            operands,
            block,
            prev,
            next: Some(anchor),
            anns: Vec::new(),
            comment: None,
            deleted: false,
        });
        match prev {
            Some(p) => self.inss[p.0 as usize].next = Some(id),
            None => self.blocks[block.0 as usize].first = Some(id),
        }
        self.inss[anchor.0 as usize].prev = Some(id);
        self.record_operand_bookkeeping(id);
        id
    }

    /// Unlink and delete an instruction, removing its usages and writer
    /// entries from the facts table.
    pub fn delete_ins(&mut self, id: InsId) {
        let (block, prev, next, op, operands) = {
            let ins = &self.inss[id.0 as usize];
            (
                ins.block,
                ins.prev,
                ins.next,
                ins.op,
                ins.operands.clone(),
            )
        };
        match prev {
            Some(p) => self.inss[p.0 as usize].next = next,
            None => self.blocks[block.0 as usize].first = next,
        }
        match next {
            Some(n) => self.inss[n.0 as usize].prev = prev,
            None => self.blocks[block.0 as usize].last = prev,
        }
        for (i, operand) in operands.iter().enumerate() {
            if let Operand::Reg(r) = operand {
                match op.rw(i) {
                    Rw::Read => self.facts.delete_usage(*r, id),
                    Rw::Write => {
                        let facts = self.facts.get_mut(*r);
                        if facts.writer == Some(id) {
                            facts.writer = None;
                        }
                    }
                    Rw::Literal => {}
                }
            }
        }
        let ins = &mut self.inss[id.0 as usize];
        ins.deleted = true;
        ins.prev = None;
        ins.next = None;
    }

    pub fn add_comment(&mut self, ins: InsId, comment: &str) {
        self.inss[ins.0 as usize].comment = Some(comment.to_string());
    }

    /// The instructions of a block in order.
    pub fn block_ins(&self, block: BlockId) -> Vec<InsId> {
        let mut out = Vec::new();
        let mut cur = self.blocks[block.0 as usize].first;
        while let Some(id) = cur {
            out.push(id);
            cur = self.inss[id.0 as usize].next;
        }
        out
    }

    /// The opcodes of a block in order.
    pub fn block_ops(&self, block: BlockId) -> Vec<Op> {
        self.block_ins(block)
            .into_iter()
            .map(|id| self.ins(id).op)
            .collect()
    }

    /// Reverse-postorder sort of the reachable basic blocks.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut post = Vec::new();
        let mut stack: Vec<(BlockId, usize)> = Vec::new();
        visited[self.entry.0 as usize] = true;
        stack.push((self.entry, 0));
        loop {
            let Some(&(block, succ_idx)) = stack.last() else {
                break;
            };
            let succs = &self.blocks[block.0 as usize].succs;
            if succ_idx < succs.len() {
                stack.last_mut().unwrap().1 += 1;
                let succ = succs[succ_idx];
                if !visited[succ.0 as usize] {
                    visited[succ.0 as usize] = true;
                    stack.push((succ, 0));
                }
            } else {
                post.push(block);
                stack.pop();
            }
        }
        post.reverse();
        post
    }

    fn record_operand_bookkeeping(&mut self, id: InsId) {
        let (op, operands) = {
            let ins = &self.inss[id.0 as usize];
            (ins.op, ins.operands.clone())
        };
        for (i, operand) in operands.iter().enumerate() {
            if let Operand::Reg(r) = operand {
                match op.rw(i) {
                    Rw::Write => self.facts.set_writer(*r, id),
                    Rw::Read => self.facts.add_usage(*r, id),
                    Rw::Literal => {}
                }
            }
        }
    }
}

/// Assembles a well-formed frame graph. Earlier compilation tiers build
/// graphs through this; so do tests.
pub struct GraphBuilder {
    graph: Graph,
    edges: Vec<(BlockId, BlockId)>,
}

impl GraphBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            graph: Graph::empty(name),
            edges: Vec::new(),
        }
    }

    /// Append a basic block; the first becomes the entry.
    pub fn block(&mut self) -> BlockId {
        let id = BlockId(self.graph.blocks.len() as u32);
        self.graph.blocks.push(BasicBlock {
            id,
            first: None,
            last: None,
            preds: Vec::new(),
            succs: Vec::new(),
            rpo_idx: 0,
        });
        id
    }

    pub fn reg(&mut self, kind: RegKind) -> Reg {
        let orig = self.graph.unique_reg(kind);
        Reg { orig, version: 0 }
    }

    pub fn edge(&mut self, from: BlockId, to: BlockId) {
        self.edges.push((from, to));
    }

    pub fn add_slot(&mut self, stable: StableId) -> u16 {
        self.graph.add_slot(stable)
    }

    /// Append an instruction. Allocation instructions seed the concrete
    /// known-type facts the earlier tiers would have recorded.
    pub fn ins(&mut self, block: BlockId, op: Op, operands: Vec<Operand>) -> InsId {
        let id = self.graph.add_ins(block, op, operands);
        if matches!(op, Op::FastCreate | Op::MaterializeBig) {
            let ins = self.graph.ins(id);
            let dst = ins.operands[0].reg();
            let stable = self.graph.slot(ins.operands[2].slot());
            let facts = self.graph.facts.get_mut(dst);
            facts.flags |= FactFlags::KNOWN_TYPE | FactFlags::CONCRETE;
            facts.ty = Some(stable);
        }
        id
    }

    pub fn deopt_ann(&mut self, ins: InsId, kind: DeoptAnnKind, idx: u32) {
        self.graph.ins_mut(ins).anns.push(DeoptAnn { kind, idx });
    }

    /// Record that a register must stay live across a deopt point.
    pub fn deopt_usage(&mut self, reg: Reg, idx: u32) {
        self.graph.facts.add_deopt_usage(reg, idx);
    }

    /// Seed type facts for a register, as earlier tiers would have.
    pub fn set_facts(&mut self, reg: Reg, flags: FactFlags, ty: Option<StableId>) {
        let facts = self.graph.facts.get_mut(reg);
        facts.flags |= flags;
        if ty.is_some() {
            facts.ty = ty;
        }
    }

    pub fn finish(mut self) -> SpeshResult<Graph> {
        if self.graph.blocks.is_empty() {
            return Err(SpeshError::EmptyGraph);
        }
        let num_blocks = self.graph.blocks.len() as u32;
        for &(from, to) in &self.edges {
            if from.0 >= num_blocks {
                return Err(SpeshError::UnknownBlock { block: from.0 });
            }
            if to.0 >= num_blocks {
                return Err(SpeshError::UnknownBlock { block: to.0 });
            }
            self.graph.blocks[from.0 as usize].succs.push(to);
            self.graph.blocks[to.0 as usize].preds.push(from);
        }
        for id in self.graph.block_ins_all() {
            let ins = self.graph.ins(id);
            for operand in &ins.operands {
                if let Operand::Block(b) = operand {
                    if b.0 >= num_blocks {
                        return Err(SpeshError::UnknownBlock { block: b.0 });
                    }
                }
            }
        }
        let rpo = self.graph.reverse_postorder();
        for (i, block) in rpo.iter().enumerate() {
            self.graph.blocks[block.0 as usize].rpo_idx = i as u32;
        }
        Ok(self.graph)
    }
}

impl Graph {
    fn block_ins_all(&self) -> Vec<InsId> {
        (0..self.blocks.len())
            .flat_map(|b| self.block_ins(BlockId(b as u32)))
            .collect()
    }
}
