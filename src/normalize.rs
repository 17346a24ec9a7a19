// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Netlist normalizer: turns a def/use graph into an ordered,
//! constant-folded [`Block`].
//!
//! ```plain
//!   NetGraph --> classify --> order --> emit --> fold --> Block
//!                 (groups)    (sort,     (decls,  (consts,
//!                             memreads,   consts,  concats,
//!                             repair)     mems)    selects)
//! ```
//!
//! Normalization is best-effort and never fails: malformed entries are
//! skipped, and the def-before-use repair keeps its partial result when it
//! runs out of time. Both conditions are counted in [`NormalizeReport`].
//!
//! The emitted block satisfies: every operand reference in the command at
//! position `i` names a definition at some position `< i`.

use crate::ir::{walk_rhs, Block, Cmd, Expr, Literal, ValOp, VarId, VarRef, WireOp};
use crate::netgraph::{
    MemInit, MemKind, NetDest, NetDriver, NetGraph, NetOp, NetOperand, WireClass, WireDecl,
};
use compact_str::{format_compact, CompactString, ToCompactString};
use indexmap::{IndexMap, IndexSet};
use num_bigint::BigUint;
use std::time::{Duration, Instant};

/// Tuning knobs for [`normalize`].
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    /// Copy-propagate selects whose source is directly an input, register,
    /// or temporary wire, removing the intermediate definition.
    pub fold_selects: bool,
    /// Wall-clock budget for the def-before-use repair fixed point.
    pub repair_deadline: Duration,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        NormalizeOptions {
            fold_selects: true,
            repair_deadline: Duration::from_secs(30),
        }
    }
}

/// What happened during normalization.
#[derive(Debug, Clone, Default)]
pub struct NormalizeReport {
    /// Entries or operands dropped for missing name/width.
    pub skipped_malformed: usize,
    /// Definitions relocated by the def-before-use repair.
    pub relocations: usize,
    /// The repair fixed point hit its deadline; the partial order is kept.
    pub ordering_timeout: bool,
    /// Constant definitions inlined into their use sites and removed.
    pub consts_inlined: usize,
    /// All-constant concatenations folded into single constants.
    pub concats_folded: usize,
    /// Select definitions copy-propagated and removed.
    pub selects_folded: usize,
}

/// Normalize `graph` into an ordered, constant-folded program block.
pub fn normalize(graph: &NetGraph, opts: &NormalizeOptions) -> (Block, NormalizeReport) {
    let mut report = NormalizeReport::default();
    let mut groups = classify(graph, &mut report);

    groups.ins.sort_by(|a, b| natural_cmp(&a.0.name, &b.0.name));
    groups.outs.sort_by(|a, b| natural_cmp(&a.0.name, &b.0.name));
    groups.regs.sort_by(|a, b| natural_cmp(&a.0.name, &b.0.name));
    groups.tmps.sort_by(|a, b| natural_cmp(&a.0.name, &b.0.name));

    // Memory reads must precede other temporaries: a read observes the
    // block's state before any write in the same cycle.
    let (mut fronted, rest): (Vec<_>, Vec<_>) = groups
        .tmps
        .into_iter()
        .partition(|(_, d)| matches!(d.map(|d| &d.op), Some(NetOp::MemRead { .. })));
    fronted.extend(rest);
    groups.tmps = fronted;

    repair_order(&mut groups.tmps, opts.repair_deadline, &mut report);

    let block = emit(graph, &groups, opts, &mut report);
    (block, report)
}

struct Groups<'g> {
    ins: Vec<(&'g WireDecl, Option<&'g NetDriver>)>,
    outs: Vec<(&'g WireDecl, Option<&'g NetDriver>)>,
    regs: Vec<(&'g WireDecl, Option<&'g NetDriver>)>,
    tmps: Vec<(&'g WireDecl, Option<&'g NetDriver>)>,
    /// Memory writes keyed by destination port.
    writes: Vec<(u64, &'g NetDriver)>,
}

fn classify<'g>(graph: &'g NetGraph, report: &mut NormalizeReport) -> Groups<'g> {
    let mut g = Groups {
        ins: Vec::new(),
        outs: Vec::new(),
        regs: Vec::new(),
        tmps: Vec::new(),
        writes: Vec::new(),
    };
    for entry in &graph.entries {
        match &entry.dest {
            NetDest::MemPort(port) => match &entry.driver {
                Some(d) => g.writes.push((*port, d)),
                None => {
                    clilog::debug!("memory port {} entry without a driver, skipped", port);
                    report.skipped_malformed += 1;
                }
            },
            NetDest::Wire(w) => {
                if w.name.is_empty() || w.width == 0 {
                    clilog::debug!("malformed wire entry {:?}, skipped", w);
                    report.skipped_malformed += 1;
                    continue;
                }
                let d = entry.driver.as_ref();
                match w.class {
                    WireClass::Input => g.ins.push((w, d)),
                    WireClass::Output => g.outs.push((w, d)),
                    WireClass::Register => g.regs.push((w, d)),
                    WireClass::Temporary => g.tmps.push((w, d)),
                    WireClass::Const => {
                        // Constant values travel as operands; a const-class
                        // destination entry carries no usable value.
                        clilog::debug!("const-class entry {} ignored", w.name);
                        report.skipped_malformed += 1;
                    }
                }
            }
        }
    }

    // Registers referenced by temporaries but never declared get an
    // implicit declaration (no update).
    let mut reg_names: IndexSet<&'g str> =
        g.regs.iter().map(|&(w, _)| w.name.as_str()).collect();
    let mut implicit: Vec<&'g WireDecl> = Vec::new();
    for (_, d) in &g.tmps {
        let Some(d) = d else { continue };
        for a in &d.args {
            if let NetOperand::Wire(w) = a {
                if w.class == WireClass::Register && !reg_names.contains(w.name.as_str()) {
                    reg_names.insert(w.name.as_str());
                    implicit.push(w);
                }
            }
        }
    }
    for w in implicit {
        g.regs.push((w, None));
    }
    g
}

/// Compare wire names with numeric suffixes in numeric order
/// (`tmp9` before `tmp10`).
fn natural_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    fn key(name: &str) -> (&str, Option<u64>) {
        let digits = name.bytes().rev().take_while(|b| b.is_ascii_digit()).count();
        let (prefix, suffix) = name.split_at(name.len() - digits);
        (prefix, suffix.parse().ok())
    }
    key(a).cmp(&key(b)).then_with(|| a.cmp(b))
}

/// Move temporary definitions in front of their first use until the order
/// is clean or the deadline elapses.
fn repair_order(
    tmps: &mut [(&WireDecl, Option<&NetDriver>)],
    budget: Duration,
    report: &mut NormalizeReport,
) {
    let defined: IndexSet<&str> = tmps.iter().map(|&(w, _)| w.name.as_str()).collect();
    let deadline = Instant::now().checked_add(budget);
    let mut dangling: IndexSet<CompactString> = IndexSet::new();

    loop {
        let mut violation: Option<(usize, usize)> = None;
        let mut seen: IndexSet<&str> = IndexSet::with_capacity(tmps.len());
        'scan: for (i, &(w, d)) in tmps.iter().enumerate() {
            // A definition may reference itself within its own line.
            seen.insert(w.name.as_str());
            let Some(d) = d else { continue };
            for a in &d.args {
                let NetOperand::Wire(aw) = a else { continue };
                if aw.class != WireClass::Temporary || seen.contains(aw.name.as_str()) {
                    continue;
                }
                if !defined.contains(aw.name.as_str()) {
                    // A name with no definition anywhere can never be
                    // repaired; re-queueing it would spin forever.
                    dangling.insert(aw.name.clone());
                    continue;
                }
                let def_pos = tmps
                    .iter()
                    .position(|(dw, _)| dw.name == aw.name)
                    .unwrap_or_else(|| {
                        panic!("definition of {} vanished during repair", aw.name)
                    });
                violation = Some((def_pos, i));
                break 'scan;
            }
        }

        let Some((from, to)) = violation else { break };
        if deadline.map_or(false, |d| Instant::now() >= d) {
            clilog::warn!(
                "def-before-use repair timed out after {} relocations; keeping partial order",
                report.relocations
            );
            report.ordering_timeout = true;
            break;
        }
        // Relocate the definition to just before its first use.
        if from > to {
            tmps[to..=from].rotate_right(1);
        } else {
            tmps[from..=to].rotate_left(1);
        }
        report.relocations += 1;
    }

    if !dangling.is_empty() {
        clilog::debug!(
            "{} temporaries referenced but never defined: {:?}",
            dangling.len(),
            dangling
        );
    }
}

struct Emitter<'g> {
    graph: &'g NetGraph,
    /// Distinct (value, width) constants, in first-seen order.
    const_pool: IndexSet<(u64, u32)>,
    /// Zero-extend select folds, emitted with the constant group.
    const_folds: Vec<Cmd>,
    /// port id -> emitted block variable name, in first-seen order.
    mem_names: IndexMap<u64, CompactString>,
    mem_creates: Vec<Cmd>,
    updates: IndexSet<CompactString>,
    skipped: usize,
}

impl<'g> Emitter<'g> {
    fn const_name(value: u64, width: u32) -> CompactString {
        format_compact!("const_{}_{}", value, width)
    }

    fn operand_expr(&mut self, a: &NetOperand) -> Option<Expr> {
        match a {
            NetOperand::Wire(w) => {
                if w.name.is_empty() || w.width == 0 {
                    self.skipped += 1;
                    return None;
                }
                Some(Expr::var_name(w.name.clone()))
            }
            NetOperand::Const { value, width } => {
                self.const_pool.insert((*value, *width));
                Some(Expr::var_name(Self::const_name(*value, *width)))
            }
        }
    }

    fn args_exprs(&mut self, d: &NetDriver) -> Vec<Expr> {
        d.args.iter().filter_map(|a| self.operand_expr(a)).collect()
    }

    /// Register the memory block for `port`, emitting its creation command
    /// on first sight. Falls back to operation-derived widths when the
    /// graph declares nothing for the port.
    fn ensure_mem(&mut self, port: u64, data_width: u32, addr_width: u32) -> CompactString {
        if let Some(name) = self.mem_names.get(&port) {
            return name.clone();
        }
        let decl = self.graph.mem_port(port);
        let (dw, aw) = decl
            .map(|p| (p.data_width, p.addr_width))
            .unwrap_or((data_width, addr_width));
        let name = match decl.and_then(|p| p.name.as_ref()) {
            Some(n) => format_compact!("{}_{}", port, n),
            None => format_compact!("{}_mem", port),
        };
        let rhs = match decl.map(|p| p.kind) {
            Some(MemKind::Rom) => {
                let content = match decl.map(|p| &p.init) {
                    Some(MemInit::Values(vs)) => {
                        Expr::Slice(vs.iter().map(|v| Expr::lit(*v)).collect())
                    }
                    // Unknown content: one placeholder per addressable word.
                    _ => Expr::Slice(
                        (0..1usize << aw).map(|_| Expr::lit("(??)")).collect(),
                    ),
                };
                Expr::Val {
                    op: ValOp::RomBlockCreate,
                    args: vec![Expr::lit(dw), Expr::lit(aw), content],
                }
            }
            _ => Expr::Val {
                op: ValOp::MemBlockCreate,
                args: vec![Expr::lit(dw), Expr::lit(aw)],
            },
        };
        self.mem_creates.push(Cmd::Def {
            lhs: VarRef::name(name.clone()),
            rhs,
        });
        self.mem_names.insert(port, name.clone());
        name
    }

    /// Build the body command for one driven wire, or `None` when the
    /// operation folds away (zero-extend select on a constant).
    fn drive_cmd(&mut self, dest: &WireDecl, d: &NetDriver) -> Option<Cmd> {
        let lhs = VarRef::name(dest.name.clone());
        let rhs = match &d.op {
            NetOp::Select { bits } => {
                if !bits.is_empty() && bits.iter().all(|&b| b == 0) {
                    if let Some(NetOperand::Const { value, .. }) = d.args.first() {
                        // Zero-extension of a constant collapses to a wider
                        // constant carrying the source value.
                        self.const_folds.push(Cmd::Def {
                            lhs,
                            rhs: Expr::Op {
                                op: WireOp::Const,
                                args: vec![Expr::lit(*value), Expr::lit(bits.len())],
                            },
                        });
                        return None;
                    }
                }
                let contiguous =
                    bits.len() >= 2 && bits.windows(2).all(|w| w[1] == w[0] + 1);
                let pattern = if contiguous {
                    Expr::Val {
                        op: ValOp::ARange,
                        args: vec![
                            Expr::lit(bits[0]),
                            Expr::lit(bits[bits.len() - 1] + 1),
                        ],
                    }
                } else {
                    Expr::Slice(bits.iter().map(|&b| Expr::lit(b)).collect())
                };
                let mut args = self.args_exprs(d);
                args.push(pattern);
                Expr::Op {
                    op: WireOp::Select,
                    args,
                }
            }
            NetOp::MemRead { port } => {
                let addr_width = d.args.first().map(|a| a.width()).unwrap_or(0);
                let mem = self.ensure_mem(*port, dest.width, addr_width);
                let mut args = vec![Expr::var_name(mem)];
                args.extend(self.args_exprs(d));
                Expr::Op {
                    op: WireOp::MemRead,
                    args,
                }
            }
            NetOp::RegNext | NetOp::Connect => {
                let mut args = self.args_exprs(d);
                if self.updates.contains(dest.name.as_str()) {
                    // Update of a declared output/register: rebind.
                    if args.is_empty() {
                        return None;
                    }
                    return Some(Cmd::Assign {
                        lhs,
                        rhs: args.swap_remove(0),
                    });
                }
                Expr::Op {
                    op: wire_op(&d.op),
                    args,
                }
            }
            op => Expr::Op {
                op: wire_op(op),
                args: self.args_exprs(d),
            },
        };
        Some(Cmd::Def { lhs, rhs })
    }

    fn write_cmd(&mut self, port: u64, d: &NetDriver) -> Cmd {
        let addr_width = d.args.first().map(|a| a.width()).unwrap_or(0);
        let data_width = d.args.get(1).map(|a| a.width()).unwrap_or(0);
        let mem = self.ensure_mem(port, data_width, addr_width);
        Cmd::Def {
            lhs: VarRef::name(mem),
            rhs: Expr::Op {
                op: WireOp::MemWrite,
                args: self.args_exprs(d),
            },
        }
    }
}

fn wire_op(op: &NetOp) -> WireOp {
    match op {
        NetOp::Add => WireOp::Add,
        NetOp::Sub => WireOp::Sub,
        NetOp::Mul => WireOp::Mul,
        NetOp::And => WireOp::And,
        NetOp::Or => WireOp::Or,
        NetOp::Xor => WireOp::Xor,
        NetOp::Nand => WireOp::Nand,
        NetOp::Eq => WireOp::Eq,
        NetOp::Lt => WireOp::Lt,
        NetOp::Gt => WireOp::Gt,
        NetOp::Not => WireOp::Not,
        NetOp::Mux => WireOp::Mux,
        NetOp::Concat => WireOp::Concat,
        NetOp::RegNext => WireOp::RegNext,
        NetOp::Connect => WireOp::Connect,
        NetOp::Select { .. } => WireOp::Select,
        NetOp::MemRead { .. } => WireOp::MemRead,
        NetOp::MemWrite { .. } => WireOp::MemWrite,
    }
}

fn decl_cmd(w: &WireDecl, op: WireOp) -> Cmd {
    Cmd::Def {
        lhs: VarRef::name(w.name.clone()),
        rhs: Expr::Op {
            op,
            args: vec![
                Expr::lit(Literal(w.name.clone())),
                Expr::lit(w.width),
            ],
        },
    }
}

fn emit(
    graph: &NetGraph,
    groups: &Groups<'_>,
    opts: &NormalizeOptions,
    report: &mut NormalizeReport,
) -> Block {
    let mut em = Emitter {
        graph,
        const_pool: IndexSet::new(),
        const_folds: Vec::new(),
        mem_names: IndexMap::new(),
        mem_creates: Vec::new(),
        updates: groups
            .outs
            .iter()
            .chain(groups.regs.iter())
            .map(|(w, _)| w.name.clone())
            .collect(),
        skipped: 0,
    };

    let mut body: Vec<Cmd> = Vec::new();
    for &(w, d) in groups
        .tmps
        .iter()
        .chain(groups.regs.iter())
        .chain(groups.outs.iter())
    {
        let Some(d) = d else { continue };
        if let Some(cmd) = em.drive_cmd(w, d) {
            body.push(cmd);
        }
    }
    for &(port, d) in &groups.writes {
        let cmd = em.write_cmd(port, d);
        body.push(cmd);
    }

    let mut cmds: Vec<Cmd> = Vec::new();
    for &(w, _) in &groups.ins {
        cmds.push(decl_cmd(w, WireOp::Input));
    }
    for &(w, _) in &groups.outs {
        cmds.push(decl_cmd(w, WireOp::Output));
    }
    for &(w, _) in &groups.regs {
        cmds.push(decl_cmd(w, WireOp::Register));
    }
    for &(value, width) in &em.const_pool {
        cmds.push(Cmd::Def {
            lhs: VarRef::name(Emitter::const_name(value, width)),
            rhs: Expr::Op {
                op: WireOp::Const,
                args: vec![Expr::lit(value), Expr::lit(width)],
            },
        });
    }
    cmds.append(&mut em.const_folds);
    cmds.append(&mut em.mem_creates);
    cmds.append(&mut body);
    report.skipped_malformed += em.skipped;

    let mut block = Block { cmds };
    inline_consts(&mut block, report);
    fold_concats(&mut block, report);
    if opts.fold_selects {
        let tmp_like: IndexSet<CompactString> = groups
            .ins
            .iter()
            .chain(groups.regs.iter())
            .chain(groups.tmps.iter())
            .map(|(w, _)| w.name.clone())
            .collect();
        fold_selects(&mut block, &tmp_like, report);
    }
    block
}

fn var_named<'e>(e: &'e Expr) -> Option<&'e CompactString> {
    match e {
        Expr::Var(VarRef {
            id: VarId::Name(n), ..
        }) => Some(n),
        _ => None,
    }
}

/// Replace every use of `name` in rhs positions of `block` with a clone of
/// `repl`, skipping the command at `except`.
fn replace_uses(block: &mut Block, name: &str, repl: &Expr, except: usize) -> usize {
    let mut hits = 0;
    for (j, cmd) in block.cmds.iter_mut().enumerate() {
        if j == except {
            continue;
        }
        walk_rhs(cmd, &mut |e, _| {
            if var_named(e).is_some_and(|n| n == name) {
                *e = repl.clone();
                hits += 1;
                return false;
            }
            true
        });
    }
    hits
}

/// Inline every constant definition into its use sites and drop the
/// definitions.
fn inline_consts(block: &mut Block, report: &mut NormalizeReport) {
    let mut remove = Vec::new();
    for i in 0..block.cmds.len() {
        let Cmd::Def { lhs, rhs } = &block.cmds[i] else { continue };
        if !matches!(rhs, Expr::Op { op: WireOp::Const, .. }) {
            continue;
        }
        let VarId::Name(name) = &lhs.id else { continue };
        let (name, repl) = (name.clone(), rhs.clone());
        replace_uses(block, &name, &repl, i);
        remove.push(i);
    }
    report.consts_inlined += remove.len();
    remove_indices(&mut block.cmds, &remove);
}

/// Fold concatenations whose operands are inline constants into one
/// constant. Works front to back so a folded result feeds later folds.
fn fold_concats(block: &mut Block, report: &mut NormalizeReport) {
    let mut remove = Vec::new();
    for i in 0..block.cmds.len() {
        let Cmd::Def { lhs, rhs } = &block.cmds[i] else { continue };
        let Expr::Op {
            op: WireOp::Concat,
            args,
        } = rhs
        else {
            continue;
        };
        let Some(folded) = fold_const_concat(args) else { continue };
        let VarId::Name(name) = &lhs.id else { continue };
        let name = name.clone();
        replace_uses(block, &name, &folded, i);
        remove.push(i);
    }
    report.concats_folded += remove.len();
    remove_indices(&mut block.cmds, &remove);
}

/// Combine constant concat operands, listed most significant first, into
/// `(value, width)`. Arbitrary precision: total widths routinely exceed 64
/// bits on wide datapaths.
fn fold_const_concat(args: &[Expr]) -> Option<Expr> {
    if args.is_empty() {
        return None;
    }
    let mut acc = BigUint::default();
    let mut total_width: u64 = 0;
    for a in args {
        let Expr::Op {
            op: WireOp::Const,
            args: cargs,
        } = a
        else {
            return None;
        };
        let (Some(Expr::Lit(v)), Some(Expr::Lit(w))) = (cargs.first(), cargs.get(1)) else {
            return None;
        };
        let value: BigUint = v.0.parse().ok()?;
        let width: u64 = w.0.parse().ok()?;
        acc = (acc << width) | value;
        total_width += width;
    }
    Some(Expr::Op {
        op: WireOp::Const,
        args: vec![
            Expr::lit(Literal(acc.to_compact_string())),
            Expr::lit(Literal(total_width.to_compact_string())),
        ],
    })
}

/// Copy-propagate selects sourced directly from input/register/temporary
/// wires into their use sites and drop the select definitions.
fn fold_selects(
    block: &mut Block,
    sources: &IndexSet<CompactString>,
    report: &mut NormalizeReport,
) {
    let mut remove = Vec::new();
    for i in 0..block.cmds.len() {
        let Cmd::Def { lhs, rhs } = &block.cmds[i] else { continue };
        let Expr::Op {
            op: WireOp::Select,
            args,
        } = rhs
        else {
            continue;
        };
        let src_ok = args
            .first()
            .and_then(var_named)
            .is_some_and(|n| sources.contains(n.as_str()));
        if !src_ok {
            continue;
        }
        let VarId::Name(name) = &lhs.id else { continue };
        let (name, repl) = (name.clone(), rhs.clone());
        if replace_uses(block, &name, &repl, i) > 0 {
            remove.push(i);
        }
    }
    report.selects_folded += remove.len();
    remove_indices(&mut block.cmds, &remove);
}

fn remove_indices(cmds: &mut Vec<Cmd>, sorted: &[usize]) {
    let mut k = 0;
    let mut keep = 0;
    for i in 0..cmds.len() {
        if k < sorted.len() && sorted[k] == i {
            k += 1;
            continue;
        }
        cmds.swap(keep, i);
        keep += 1;
    }
    cmds.truncate(keep);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netgraph::{MemPortDecl, NetEntry};
    use smallvec::smallvec;

    fn w(name: &str, width: u32, class: WireClass) -> WireDecl {
        WireDecl {
            name: name.into(),
            width,
            class,
        }
    }

    fn decl(name: &str, width: u32, class: WireClass) -> NetEntry {
        NetEntry {
            dest: NetDest::Wire(w(name, width, class)),
            driver: None,
        }
    }

    fn driven(dest: WireDecl, op: NetOp, args: Vec<NetOperand>) -> NetEntry {
        NetEntry {
            dest: NetDest::Wire(dest),
            driver: Some(NetDriver { op, args }),
        }
    }

    fn awire(name: &str, width: u32, class: WireClass) -> NetOperand {
        NetOperand::Wire(w(name, width, class))
    }

    fn aconst(value: u64, width: u32) -> NetOperand {
        NetOperand::Const { value, width }
    }

    fn graph(entries: Vec<NetEntry>) -> NetGraph {
        NetGraph {
            entries,
            mem_ports: vec![],
        }
    }

    fn lines(b: &Block) -> Vec<String> {
        b.cmds.iter().map(|c| c.to_string()).collect()
    }

    /// Every symbolic operand must name an earlier command's lhs (or a
    /// free name the block never defines).
    fn assert_def_before_use(b: &Block) {
        let mut defined: IndexSet<CompactString> = IndexSet::new();
        let all: IndexSet<CompactString> = b
            .cmds
            .iter()
            .filter_map(|c| c.lhs())
            .filter_map(|l| match &l.id {
                VarId::Name(n) => Some(n.clone()),
                _ => None,
            })
            .collect();
        for (i, cmd) in b.cmds.iter().enumerate() {
            let mut c = cmd.clone();
            walk_rhs(&mut c, &mut |e, _| {
                if let Some(n) = var_named(e) {
                    if all.contains(n) {
                        assert!(
                            defined.contains(n),
                            "use of {} at line {} precedes its definition",
                            n,
                            i
                        );
                    }
                }
                true
            });
            if let Some(VarRef {
                id: VarId::Name(n), ..
            }) = cmd.lhs()
            {
                defined.insert(n.clone());
            }
        }
    }

    #[test]
    fn test_decl_groups_and_natural_order() {
        let g = graph(vec![
            decl("in10", 8, WireClass::Input),
            decl("in2", 8, WireClass::Input),
            driven(
                w("tmp10", 8, WireClass::Temporary),
                NetOp::Not,
                vec![awire("in2", 8, WireClass::Input)],
            ),
            driven(
                w("tmp9", 8, WireClass::Temporary),
                NetOp::Not,
                vec![awire("in10", 8, WireClass::Input)],
            ),
            driven(
                w("out1", 8, WireClass::Output),
                NetOp::Connect,
                vec![awire("tmp9", 8, WireClass::Temporary)],
            ),
        ]);
        let (b, rep) = normalize(&g, &NormalizeOptions::default());
        let ls = lines(&b);
        assert_eq!(ls[0], "(in2 (Input in2 8))");
        assert_eq!(ls[1], "(in10 (Input in10 8))");
        assert_eq!(ls[2], "(out1 (Output out1 8))");
        assert_eq!(ls[3], "(tmp9 (w~ in10))", "tmp9 sorts before tmp10");
        assert_eq!(ls[4], "(tmp10 (w~ in2))");
        assert_eq!(ls[5], "(out1 (<<= tmp9))");
        assert_eq!(rep.relocations, 0, "ordered input needs no repair");
        assert!(!rep.ordering_timeout);
        assert_def_before_use(&b);
    }

    #[test]
    fn test_const_pool_inlined_into_uses() {
        let g = graph(vec![
            decl("a", 8, WireClass::Input),
            driven(
                w("t1", 8, WireClass::Temporary),
                NetOp::Add,
                vec![awire("a", 8, WireClass::Input), aconst(5, 8)],
            ),
            driven(
                w("t2", 8, WireClass::Temporary),
                NetOp::Sub,
                vec![awire("t1", 8, WireClass::Temporary), aconst(5, 8)],
            ),
        ]);
        let (b, rep) = normalize(&g, &NormalizeOptions::default());
        let ls = lines(&b);
        assert_eq!(ls[1], "(t1 (w+ a (bv-const 5 8)))");
        assert_eq!(ls[2], "(t2 (w- t1 (bv-const 5 8)))");
        assert_eq!(rep.consts_inlined, 1, "one pooled constant for both uses");
        assert!(
            !ls.iter().any(|l| l.contains("const_5_8")),
            "pooled name must not survive inlining: {:?}",
            ls
        );
    }

    #[test]
    fn test_def_before_use_repair_relocates() {
        // t_use reads t_late, which sorts after it.
        let g = graph(vec![
            decl("a", 8, WireClass::Input),
            driven(
                w("tmp1", 8, WireClass::Temporary),
                NetOp::Not,
                vec![awire("tmp2", 8, WireClass::Temporary)],
            ),
            driven(
                w("tmp2", 8, WireClass::Temporary),
                NetOp::Not,
                vec![awire("a", 8, WireClass::Input)],
            ),
        ]);
        let (b, rep) = normalize(&g, &NormalizeOptions::default());
        assert_eq!(rep.relocations, 1);
        assert!(!rep.ordering_timeout);
        assert_def_before_use(&b);
        let ls = lines(&b);
        assert_eq!(ls[1], "(tmp2 (w~ a))");
        assert_eq!(ls[2], "(tmp1 (w~ tmp2))");
    }

    #[test]
    fn test_repair_deadline_on_cycle() {
        let g = graph(vec![
            driven(
                w("tmp1", 1, WireClass::Temporary),
                NetOp::Not,
                vec![awire("tmp2", 1, WireClass::Temporary)],
            ),
            driven(
                w("tmp2", 1, WireClass::Temporary),
                NetOp::Not,
                vec![awire("tmp1", 1, WireClass::Temporary)],
            ),
        ]);
        let opts = NormalizeOptions {
            repair_deadline: Duration::ZERO,
            ..Default::default()
        };
        let (b, rep) = normalize(&g, &opts);
        assert!(rep.ordering_timeout, "cyclic order cannot be repaired");
        assert_eq!(b.cmds.len(), 2, "partial result is kept");
    }

    #[test]
    fn test_memread_fronted_and_created_once() {
        let mut g = graph(vec![
            decl("a", 4, WireClass::Input),
            driven(
                w("tmp1", 8, WireClass::Temporary),
                NetOp::Add,
                vec![
                    awire("tmp2", 8, WireClass::Temporary),
                    awire("tmp2", 8, WireClass::Temporary),
                ],
            ),
            driven(
                w("tmp2", 8, WireClass::Temporary),
                NetOp::MemRead { port: 3 },
                vec![awire("a", 4, WireClass::Input)],
            ),
            NetEntry {
                dest: NetDest::MemPort(3),
                driver: Some(NetDriver {
                    op: NetOp::MemWrite { port: 3 },
                    args: vec![
                        awire("a", 4, WireClass::Input),
                        awire("tmp1", 8, WireClass::Temporary),
                        aconst(1, 1),
                    ],
                }),
            },
        ]);
        g.mem_ports.push(MemPortDecl {
            port: 3,
            kind: MemKind::Ram,
            data_width: 8,
            addr_width: 4,
            name: Some("heap".into()),
            init: MemInit::None,
        });
        let (b, _) = normalize(&g, &NormalizeOptions::default());
        let ls = lines(&b);
        assert_eq!(ls[1], "(3_heap (mem-block-create 8 4))");
        assert_eq!(ls[2], "(tmp2 (wm 3_heap a))", "read precedes other tmps");
        assert_eq!(ls[3], "(tmp1 (w+ tmp2 tmp2))");
        assert_eq!(ls[4], "(3_heap (w@ a tmp1 (bv-const 1 1)))");
        assert_eq!(
            ls.iter().filter(|l| l.contains("mem-block-create")).count(),
            1,
            "one creation per port"
        );
        assert_def_before_use(&b);
    }

    #[test]
    fn test_select_patterns() {
        let g = graph(vec![
            decl("x", 8, WireClass::Input),
            driven(
                w("o1", 4, WireClass::Output),
                NetOp::Select {
                    bits: smallvec![0, 1, 2, 3],
                },
                vec![awire("x", 8, WireClass::Input)],
            ),
            driven(
                w("o2", 3, WireClass::Output),
                NetOp::Select {
                    bits: smallvec![0, 2, 5],
                },
                vec![awire("x", 8, WireClass::Input)],
            ),
            driven(
                w("o3", 1, WireClass::Output),
                NetOp::Select { bits: smallvec![5] },
                vec![awire("x", 8, WireClass::Input)],
            ),
        ]);
        let (b, _) = normalize(&g, &NormalizeOptions::default());
        let ls = lines(&b);
        assert!(
            ls.contains(&"(o1 (ws x (arange 0 4)))".to_string()),
            "contiguous ascending run folds to arange: {:?}",
            ls
        );
        assert!(
            ls.contains(&"(o2 (ws x (list 0 2 5)))".to_string()),
            "gapped pattern stays explicit: {:?}",
            ls
        );
        assert!(
            ls.contains(&"(o3 (ws x (list 5)))".to_string()),
            "single bit stays explicit: {:?}",
            ls
        );
    }

    #[test]
    fn test_zero_extend_select_on_const() {
        let g = graph(vec![
            decl("a", 8, WireClass::Input),
            driven(
                w("tmp1", 4, WireClass::Temporary),
                NetOp::Select {
                    bits: smallvec![0, 0, 0, 0],
                },
                vec![aconst(1, 1)],
            ),
            driven(
                w("tmp2", 8, WireClass::Temporary),
                NetOp::Add,
                vec![
                    awire("a", 8, WireClass::Input),
                    awire("tmp1", 4, WireClass::Temporary),
                ],
            ),
        ]);
        let (b, _) = normalize(&g, &NormalizeOptions::default());
        let ls = lines(&b);
        assert!(
            ls.contains(&"(tmp2 (w+ a (bv-const 1 4)))".to_string()),
            "zero-extend fold carries the source value at the selected width: {:?}",
            ls
        );
    }

    #[test]
    fn test_rom_unknown_renders_placeholders() {
        let mut g = graph(vec![
            decl("a", 2, WireClass::Input),
            driven(
                w("tmp1", 8, WireClass::Temporary),
                NetOp::MemRead { port: 7 },
                vec![awire("a", 2, WireClass::Input)],
            ),
        ]);
        g.mem_ports.push(MemPortDecl {
            port: 7,
            kind: MemKind::Rom,
            data_width: 8,
            addr_width: 2,
            name: None,
            init: MemInit::Unknown,
        });
        let (b, _) = normalize(&g, &NormalizeOptions::default());
        let ls = lines(&b);
        assert!(
            ls.contains(
                &"(7_mem (rom-block-create 8 2 (list (??) (??) (??) (??))))".to_string()
            ),
            "unknown rom content renders 2^addr placeholders: {:?}",
            ls
        );
    }

    #[test]
    fn test_concat_of_consts_folds_wide() {
        let g = graph(vec![
            decl("a", 16, WireClass::Input),
            driven(
                w("tmp1", 16, WireClass::Temporary),
                NetOp::Concat,
                vec![aconst(1, 8), aconst(1, 8)],
            ),
            driven(
                w("tmp2", 16, WireClass::Temporary),
                NetOp::Xor,
                vec![
                    awire("a", 16, WireClass::Input),
                    awire("tmp1", 16, WireClass::Temporary),
                ],
            ),
        ]);
        let (b, rep) = normalize(&g, &NormalizeOptions::default());
        let ls = lines(&b);
        assert!(
            ls.contains(&"(tmp2 (w^ a (bv-const 257 16)))".to_string()),
            "1:8 ++ 1:8 must fold to 257 at width 16, not 3: {:?}",
            ls
        );
        assert_eq!(rep.concats_folded, 1);
    }

    #[test]
    fn test_select_fold_copy_propagates() {
        let entries = vec![
            decl("x", 8, WireClass::Input),
            driven(
                w("tmp1", 4, WireClass::Temporary),
                NetOp::Select {
                    bits: smallvec![0, 1, 2, 3],
                },
                vec![awire("x", 8, WireClass::Input)],
            ),
            driven(
                w("tmp2", 4, WireClass::Temporary),
                NetOp::Not,
                vec![awire("tmp1", 4, WireClass::Temporary)],
            ),
        ];
        let (b, rep) = normalize(&graph(entries.clone()), &NormalizeOptions::default());
        let ls = lines(&b);
        assert!(
            ls.contains(&"(tmp2 (w~ (ws x (arange 0 4))))".to_string()),
            "select on an input source folds into the use: {:?}",
            ls
        );
        assert_eq!(rep.selects_folded, 1);

        let opts = NormalizeOptions {
            fold_selects: false,
            ..Default::default()
        };
        let (b2, rep2) = normalize(&graph(entries), &opts);
        assert_eq!(rep2.selects_folded, 0);
        assert!(
            lines(&b2).contains(&"(tmp1 (ws x (arange 0 4)))".to_string()),
            "folding disabled keeps the definition"
        );
    }

    #[test]
    fn test_register_update_and_implicit_register() {
        let g = graph(vec![
            decl("a", 8, WireClass::Input),
            // r2 is never declared; tmp1 referencing it forces an
            // implicit declaration.
            driven(
                w("tmp1", 8, WireClass::Temporary),
                NetOp::Add,
                vec![
                    awire("r2", 8, WireClass::Register),
                    awire("a", 8, WireClass::Input),
                ],
            ),
            driven(
                w("r1", 8, WireClass::Register),
                NetOp::RegNext,
                vec![awire("tmp1", 8, WireClass::Temporary)],
            ),
        ]);
        let (b, rep) = normalize(&g, &NormalizeOptions::default());
        let ls = lines(&b);
        assert!(ls.contains(&"(r1 (Register r1 8))".to_string()));
        assert!(
            ls.contains(&"(r2 (Register r2 8))".to_string()),
            "implicit register must be declared: {:?}",
            ls
        );
        assert!(ls.contains(&"(r1 (<<= tmp1))".to_string()));
        assert_eq!(rep.skipped_malformed, 0);
        assert_def_before_use(&b);
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let g = graph(vec![
            decl("a", 8, WireClass::Input),
            decl("", 8, WireClass::Input),
            decl("z", 0, WireClass::Temporary),
        ]);
        let (b, rep) = normalize(&g, &NormalizeOptions::default());
        assert_eq!(rep.skipped_malformed, 2);
        assert_eq!(b.cmds.len(), 1);
    }
}
