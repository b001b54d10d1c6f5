//! Register Facts
//!
//! Per-register-version knowledge the specializer has gathered: known
//! types, concreteness, the writing instruction, and which instructions
//! (and deoptimization points) consume the value. Later passes both read
//! and refine these; the escape analysis additionally parks its own
//! pass-scoped scratch here, the same way it lives on the frame graph in
//! the runtime.

use std::collections::HashMap;

use super::graph::{InsId, Reg};
use super::model::StableId;
use super::pea::AllocIdx;

bitflags::bitflags! {
    /// Value facts for one SSA register version
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct FactFlags: u8 {
        /// The type of the value is known
        const KNOWN_TYPE = 1 << 0;
        /// The value is a concrete object, not a type object
        const CONCRETE = 1 << 1;
        /// The value itself is known
        const KNOWN_VALUE = 1 << 2;
    }
}

/// Escape-analysis scratch attached to a register's facts
#[derive(Debug, Clone, Copy, Default)]
pub struct PeaFacts {
    /// The tracked allocation this register holds (an alias of), if any
    pub allocation: Option<AllocIdx>,
    /// The allocation this fact's validity depends upon: if that
    /// allocation becomes irreplaceable, the fact no longer holds
    pub depend_allocation: Option<AllocIdx>,
}

/// Facts held about a single SSA register version
#[derive(Debug, Clone, Default)]
pub struct Facts {
    pub flags: FactFlags,
    /// Known type, meaningful when `KNOWN_TYPE` is set
    pub ty: Option<StableId>,
    /// The instruction that writes this version
    pub writer: Option<InsId>,
    /// Instructions reading this version
    pub usages: Vec<InsId>,
    /// Deoptimization indices at which this version must stay live
    pub deopt_usages: Vec<u32>,
    /// A speculation relied on this fact; later passes must not discard it
    pub used: bool,
    /// Escape-analysis scratch
    pub pea: PeaFacts,
}

impl Facts {
    /// The known type, if the flags actually claim one.
    pub fn known_type(&self) -> Option<StableId> {
        if self.flags.contains(FactFlags::KNOWN_TYPE) {
            self.ty
        } else {
            None
        }
    }

    /// Copy the value-describing facts (flags and type) from another set.
    /// Writer and usage information stay with their own register.
    pub fn copy_value_facts(&mut self, src: &Facts) {
        self.flags = src.flags;
        self.ty = src.ty;
    }
}

/// Facts for every register version of one frame graph
#[derive(Debug, Default)]
pub struct FactsTable {
    facts: HashMap<Reg, Facts>,
}

impl FactsTable {
    pub fn new() -> Self {
        Self {
            facts: HashMap::new(),
        }
    }

    pub fn get(&self, reg: Reg) -> Option<&Facts> {
        self.facts.get(&reg)
    }

    /// Facts for a register, created empty on first touch.
    pub fn get_mut(&mut self, reg: Reg) -> &mut Facts {
        self.facts.entry(reg).or_default()
    }

    pub fn set_writer(&mut self, reg: Reg, ins: InsId) {
        self.get_mut(reg).writer = Some(ins);
    }

    pub fn add_usage(&mut self, reg: Reg, ins: InsId) {
        self.get_mut(reg).usages.push(ins);
    }

    pub fn delete_usage(&mut self, reg: Reg, ins: InsId) {
        let facts = self.get_mut(reg);
        if let Some(pos) = facts.usages.iter().position(|u| *u == ins) {
            facts.usages.remove(pos);
        }
    }

    pub fn add_deopt_usage(&mut self, reg: Reg, deopt_idx: u32) {
        let facts = self.get_mut(reg);
        if !facts.deopt_usages.contains(&deopt_idx) {
            facts.deopt_usages.push(deopt_idx);
        }
    }

    /// Mark the facts of a register as load-bearing for a speculation.
    pub fn use_facts(&mut self, reg: Reg) {
        self.get_mut(reg).used = true;
    }
}
