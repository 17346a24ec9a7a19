// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Spool — loop reroller for unrolled gate-level netlists.
//!
//! Spool ingests a def/use netlist graph, normalizes it into an ordered,
//! constant-folded command program, rewrites wire references into positional
//! offsets, and collapses unrolled iteration windows back into `for` loops,
//! emitting the compact program in parenthesized prefix text.
//!
//! # Pipeline
//!
//! ```text
//! def/use graph (JSON)
//!   → NetGraph      (netgraph — typed wire/driver entries)
//!   → Block         (normalize — ordered commands, constants folded)
//!   → positional    (debruijn — name references become signed offsets)
//!   → rerolled      (reroll — K copies of an L-command window become one For)
//!   → prefix text   (ir — parenthesized serialization of the final program)
//! ```
//!
//! # Key modules
//!
//! - [`ir`] — Command program model ([`ir::Block`], [`ir::Cmd`], [`ir::Expr`]) and its text form
//! - [`netgraph`] — Def/use graph input schema ([`netgraph::NetGraph`])
//! - [`normalize`] — Graph-to-program lowering: declaration groups, ordering repair, constant folding
//! - [`debruijn`] — Positional (signed-offset) reference rewriting
//! - [`reroll`] — Loop rerolling with anchor/array boundary repairs and address resolution

pub mod ir;

pub mod netgraph;

pub mod normalize;

pub mod debruijn;

pub mod reroll;
