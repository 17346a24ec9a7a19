// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Positional (de Bruijn) addressing pass.
//!
//! Normalization leaves a program whose references all point backwards, so a
//! name carries no information the definition's position does not: `convert`
//! replaces every reference to a bound wire with the signed distance to its
//! definition and renumbers the left-hand sides to absolute line positions.
//!
//! ```text
//!   (a (Input a 8))         (0 (Input a 8))
//!   (b (Input b 8))   ==>   (1 (Input b 8))
//!   (c (w+ a b))            (2 (w+ -2 -1))
//! ```
//!
//! Offset form is what the reroller pattern-matches on: two unrolled
//! iterations are copies of each other exactly when their commands compare
//! equal offset by offset, with no name freshening in the way.

use compact_str::CompactString;
use indexmap::IndexMap;

use crate::ir::{walk_rhs, Block, Cmd, Expr, VarId};

/// Rewrite `block` in place into positional form.
///
/// A `Def` or `Assign` records its name at its own position before its
/// right-hand side is rewritten: a rebind shadows the earlier binding from
/// its own command onwards, and a reference to the holder's own name closes
/// over the holder itself (offset 0), which is how self-referential register
/// updates read. Names never bound at the top level (loop indices,
/// declaration name tokens, dangling references) stay symbolic.
///
/// References inside `For` bodies resolve against their effective position:
/// body line `b` of a loop at position `i` references from `i + b + 1`,
/// mirroring how the reroller later resolves offsets back to addresses.
/// Body left-hand sides are the reroller's to manage and are left alone.
pub fn convert(block: &mut Block) {
    let mut bound: IndexMap<CompactString, usize> = IndexMap::new();
    for i in 0..block.cmds.len() {
        if let Some(lhs) = block.cmds[i].lhs() {
            if let VarId::Name(n) = &lhs.id {
                bound.insert(n.clone(), i);
            }
        }
        walk_rhs(&mut block.cmds[i], &mut |e, loc| {
            if let Expr::Var(v) = e {
                if let VarId::Name(n) = &v.id {
                    if let Some(&def) = bound.get(n.as_str()) {
                        v.id = VarId::Offset(def as i64 - (i + loc.eff_delta) as i64);
                    }
                }
            }
            true
        });
        match &mut block.cmds[i] {
            Cmd::Def { lhs, .. } | Cmd::Assign { lhs, .. } => lhs.id = VarId::Line(i),
            Cmd::For { .. } => {}
        }
    }
}
