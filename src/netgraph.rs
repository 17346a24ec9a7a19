// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Def/use graph contract consumed by the normalizer.
//!
//! The graph is handed over pre-built (netlist parsing and optimization
//! happen upstream): an enumerable list of destination wires with their
//! driving operations, plus memory/ROM port declarations keyed by numeric
//! port id. Each destination wire appears in exactly one entry; that entry
//! both declares the wire and, when present, carries its driver. Constant
//! values travel only as operands. Enumeration order of `entries` is the
//! deterministic input order all downstream ordering is defined against.

use compact_str::CompactString;
use serde::Deserialize;
use smallvec::SmallVec;

/// Wire classification tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum WireClass {
    Input,
    Output,
    Register,
    Const,
    Temporary,
}

/// A declared wire: name, bit width, class.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WireDecl {
    pub name: CompactString,
    pub width: u32,
    pub class: WireClass,
}

/// One operand of a driving operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum NetOperand {
    Wire(WireDecl),
    Const { value: u64, width: u32 },
}

impl NetOperand {
    pub fn width(&self) -> u32 {
        match self {
            NetOperand::Wire(w) => w.width,
            NetOperand::Const { width, .. } => *width,
        }
    }
}

/// Opcode of a driving operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum NetOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Nand,
    Eq,
    Lt,
    Gt,
    Not,
    Mux,
    Concat,
    /// Bit select; `bits` lists the selected source bit indices in output
    /// order, LSB first.
    Select { bits: SmallVec<[u32; 8]> },
    MemRead { port: u64 },
    MemWrite { port: u64 },
    /// Register next-value update.
    RegNext,
    /// Plain wire connection.
    Connect,
}

/// A driving operation: opcode plus ordered operands.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetDriver {
    pub op: NetOp,
    pub args: Vec<NetOperand>,
}

/// Destination of an entry: a wire, or a memory port (for writes).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum NetDest {
    Wire(WireDecl),
    MemPort(u64),
}

/// One graph entry. A `None` driver is legal only for declared but
/// undriven wires.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetEntry {
    pub dest: NetDest,
    #[serde(default)]
    pub driver: Option<NetDriver>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum MemKind {
    Ram,
    Rom,
}

/// Initial content of a memory port's backing block.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub enum MemInit {
    /// No initializer.
    #[default]
    None,
    /// Content exists but is not statically known; a ROM with unknown
    /// content renders one placeholder per addressable word.
    Unknown,
    Values(Vec<u64>),
}

/// Declares a memory/ROM port's geometry and content.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MemPortDecl {
    pub port: u64,
    pub kind: MemKind,
    pub data_width: u32,
    pub addr_width: u32,
    /// Human-readable block name; the emitted block variable is
    /// `<port>_<name>` (`<port>_mem` when absent).
    #[serde(default)]
    pub name: Option<CompactString>,
    #[serde(default)]
    pub init: MemInit,
}

/// The complete input graph.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetGraph {
    pub entries: Vec<NetEntry>,
    #[serde(default)]
    pub mem_ports: Vec<MemPortDecl>,
}

impl NetGraph {
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn mem_port(&self, port: u64) -> Option<&MemPortDecl> {
        self.mem_ports.iter().find(|p| p.port == port)
    }
}
