//! Object Model Queries
//!
//! The slice of the Lumen object model the specializer needs: a table of
//! type stables, their representations, and the flat attribute layout of
//! opaque records. Escape analysis uses these queries to decide whether an
//! allocation's attributes can live in registers at all, and to map
//! attribute byte offsets back to attribute indices.

use super::graph::RegKind;

/// Index of a type stable in the VM's type table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StableId(pub u32);

/// Representation of a type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repr {
    /// Fixed-layout object whose attributes sit at known byte offsets
    Opaque,
    /// Arbitrary-precision integer box storage
    BigInt,
    /// Anything else (arrays, custom representations); never tracked
    Other,
}

/// The primitive a flattened-in type boxes, per its storage spec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxedPrimitive {
    None,
    Int { bits: u8, unsigned: bool },
    Num { bits: u8 },
    Str,
}

/// One attribute of an opaque record
#[derive(Debug, Clone)]
pub struct Attr {
    /// Byte offset of the attribute within the object body
    pub offset: u16,
    /// The flattened-in type stable; `None` means reference storage
    pub flattened: Option<StableId>,
}

/// A type stable: representation, size, and attribute layout
#[derive(Debug, Clone)]
pub struct Stable {
    pub debug_name: String,
    pub repr: Repr,
    /// Allocation size in bytes
    pub size: u16,
    pub attrs: Vec<Attr>,
    pub boxed: BoxedPrimitive,
    /// Index into the VM's small-integer cache, for cache-aware
    /// materialization of integer boxes
    pub int_cache_idx: Option<u16>,
}

impl Stable {
    pub fn opaque(name: &str, size: u16, attrs: Vec<Attr>) -> Self {
        Self {
            debug_name: name.to_string(),
            repr: Repr::Opaque,
            size,
            attrs,
            boxed: BoxedPrimitive::None,
            int_cache_idx: None,
        }
    }

    pub fn bigint(name: &str) -> Self {
        Self {
            debug_name: name.to_string(),
            repr: Repr::BigInt,
            size: 16,
            attrs: Vec::new(),
            boxed: BoxedPrimitive::Int {
                bits: 64,
                unsigned: false,
            },
            int_cache_idx: None,
        }
    }
}

/// The VM's table of type stables
#[derive(Debug, Default)]
pub struct TypeTable {
    stables: Vec<Stable>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self {
            stables: Vec::new(),
        }
    }

    pub fn add(&mut self, stable: Stable) -> StableId {
        let id = StableId(self.stables.len() as u32);
        self.stables.push(stable);
        id
    }

    pub fn stable(&self, id: StableId) -> &Stable {
        &self.stables[id.0 as usize]
    }

    pub fn attr_count(&self, id: StableId) -> usize {
        self.stable(id).attrs.len()
    }

    pub fn attr_offset(&self, id: StableId, idx: usize) -> u16 {
        self.stable(id).attrs[idx].offset
    }

    /// Map an attribute byte offset back to the attribute index.
    pub fn offset_to_attr_idx(&self, id: StableId, offset: u16) -> Option<usize> {
        self.stable(id)
            .attrs
            .iter()
            .position(|a| a.offset == offset)
    }

    /// Byte offset of the big-integer attribute of an opaque record, if
    /// it has one.
    pub fn bigint_offset(&self, id: StableId) -> Option<u16> {
        let stable = self.stable(id);
        if stable.repr != Repr::Opaque {
            return None;
        }
        stable
            .attrs
            .iter()
            .find(|a| self.storage_register_kind(a.flattened) == Some(RegKind::BigInt))
            .map(|a| a.offset)
    }

    /// Turn a flattened-in attribute type into the register kind its
    /// scalar replacement would use. `None` storage is a reference and
    /// replaces into an object register; a kind the specializer cannot
    /// handle yields `None` and makes the whole allocation untrackable.
    pub fn storage_register_kind(&self, flattened: Option<StableId>) -> Option<RegKind> {
        match flattened {
            None => Some(RegKind::Obj),
            Some(id) => {
                let stable = self.stable(id);
                if stable.repr == Repr::BigInt {
                    return Some(RegKind::BigInt);
                }
                match stable.boxed {
                    BoxedPrimitive::Int {
                        bits: 64,
                        unsigned: false,
                    } => Some(RegKind::Int64),
                    BoxedPrimitive::Num { bits: 64 } => Some(RegKind::Num64),
                    BoxedPrimitive::Str => Some(RegKind::Str),
                    _ => None,
                }
            }
        }
    }
}
