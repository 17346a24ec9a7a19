// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Loop rerolling: collapse K structurally-identical copies of an L-command
//! window into one `For` command, with boundary repairs.
//!
//! ```text
//! positional program
//!   → template extraction    (iteration 0, paired against iteration 1)
//!   → inner repair           (anchors for loop-carried reads, shifts for
//!                             loop-invariant reads, loop index in select
//!                             patterns)
//!   → window collapse        (K·L commands become one For)
//!   → post-loop repair       (window reads become array-create /
//!                             array-store / array-ref)
//!   → address resolution     (absolute `line` / dotted `line.slot` form)
//! ```
//!
//! Offsets survive every insertion through one shared rule: a reference held
//! after the insertion point whose target sits before it stretches by the
//! inserted slot; a target that moved together with its holder keeps its
//! offset. Intra-body references never cross a top-level insertion.

use compact_str::CompactString;
use indexmap::IndexMap;
use std::fmt;
use std::str::FromStr;

use crate::ir::{walk_rhs, Block, Cmd, Expr, ValOp, VarId, VarRef};

/// One rerollable window, as reported by an upstream loop identifier:
/// `iters` copies of a `body_len`-command body starting at the command
/// that defines `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub struct LoopCandidate {
    pub start: usize,
    pub body_len: usize,
    pub iters: usize,
}

impl fmt::Display for LoopCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.start, self.body_len, self.iters)
    }
}

impl FromStr for LoopCandidate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(',').map(str::trim);
        let mut field = |name: &str| -> Result<usize, String> {
            fields
                .next()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    format!(
                        "candidate `{}` is missing its {} field (expected start,len,iters)",
                        s, name
                    )
                })?
                .parse::<usize>()
                .map_err(|e| format!("bad {} in candidate `{}`: {}", name, s, e))
        };
        let cand = LoopCandidate {
            start: field("start")?,
            body_len: field("len")?,
            iters: field("iters")?,
        };
        if fields.next().is_some() {
            return Err(format!(
                "candidate `{}` has extra fields (expected start,len,iters)",
                s
            ));
        }
        if cand.body_len == 0 {
            return Err(format!("candidate `{}` has an empty body", s));
        }
        if cand.iters < 2 {
            return Err(format!(
                "candidate `{}` must span at least two iterations",
                s
            ));
        }
        Ok(cand)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RerollError {
    /// No command in the program defines the candidate's start line, so the
    /// window cannot be located.
    CandidateNotFound { start: usize },
}

impl fmt::Display for RerollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RerollError::CandidateNotFound { start } => write!(
                f,
                "no command defines line {}: candidate window cannot be located",
                start
            ),
        }
    }
}

impl std::error::Error for RerollError {}

/// Reroll `cand` in `prog`, returning the rerolled program in resolved
/// (line / dotted) address form. `prog` itself is left untouched.
///
/// Malformed windows that cannot arise from unrolling (iterations that are
/// not structural copies, references escaping past the program start) are
/// programming-invariant violations and panic.
pub fn reroll(prog: &Block, cand: &LoopCandidate) -> Result<Block, RerollError> {
    let LoopCandidate {
        start,
        body_len,
        iters,
    } = *cand;
    assert!(body_len > 0, "candidate body length must be positive");
    assert!(
        iters >= 2,
        "a rerollable window spans at least two iterations, got {}",
        iters
    );

    let mut work = prog.clone();
    let line_start = work
        .cmds
        .iter()
        .position(|c| matches!(c.lhs(), Some(v) if v.id == VarId::Line(start)))
        .ok_or(RerollError::CandidateNotFound { start })?;
    let window = body_len * iters;
    assert!(
        line_start + window <= work.cmds.len(),
        "candidate window [{}, {}) runs past the end of the {}-command program",
        line_start,
        line_start + window,
        work.cmds.len()
    );

    let index_name = CompactString::from("i");
    let mut body: Vec<Cmd> = work.cmds[line_start..line_start + body_len].to_vec();
    let next_iter: Vec<Cmd> =
        work.cmds[line_start + body_len..line_start + 2 * body_len].to_vec();

    // Pass 1 plans the anchor set; pass 2 rewrites the template body against
    // it (the loop-invariant shift needs the final anchor count).
    let mut anchors: IndexMap<usize, usize> = IndexMap::new();
    repair_template(
        &mut body,
        &next_iter,
        line_start,
        &index_name,
        &mut RepairMode::Plan(&mut anchors),
    );
    let num_anchors = anchors.len();
    repair_template(
        &mut body,
        &next_iter,
        line_start,
        &index_name,
        &mut RepairMode::Apply {
            anchors: &anchors,
            invariant_shift: num_anchors as i64 + 1,
        },
    );

    // Anchors are inserted one at a time at the window start, each pushing
    // the previous ones down: creation order lays out reversed, and the
    // stretch fixup keeps already-placed anchors pointed at their producers.
    // Anchor left-hand sides are renumbered during resolution.
    for &target in anchors.keys() {
        work.cmds.insert(
            line_start,
            Cmd::Def {
                lhs: VarRef::line(line_start),
                rhs: Expr::var_offset(target as i64 - line_start as i64),
            },
        );
        stretch_after_insert(&mut work.cmds, line_start);
    }

    let for_pos = line_start + num_anchors;
    work.cmds.splice(
        for_pos..for_pos + window,
        std::iter::once(Cmd::For {
            index: index_name,
            count: iters,
            body: Block { cmds: body },
        }),
    );

    let num_arrays = repair_after(&mut work, for_pos, body_len, iters);
    clilog::debug!(
        "rerolled window [{}, {}) into a {}-iteration loop: {} anchor(s), {} array(s)",
        line_start,
        line_start + window,
        iters,
        num_anchors,
        num_arrays
    );

    resolve(&mut work);
    Ok(work)
}

/// Reroll the first candidate of `cands`, or return `Ok(None)` when the
/// identifier found nothing. Rerolling handles one window per pass, so any
/// further candidates are reported and skipped.
pub fn reroll_first(
    prog: &Block,
    cands: &[LoopCandidate],
) -> Result<Option<Block>, RerollError> {
    let first = match cands.first() {
        Some(c) => c,
        None => return Ok(None),
    };
    if cands.len() > 1 {
        clilog::warn!(
            "ignoring {} further loop candidate(s): rerolling handles one window per pass",
            cands.len() - 1
        );
    }
    reroll(prog, first).map(Some)
}

/// Inner-repair traversal mode. Both passes take identical branches; only
/// the second mutates, against the anchor set the first froze.
enum RepairMode<'a> {
    Plan(&'a mut IndexMap<usize, usize>),
    Apply {
        anchors: &'a IndexMap<usize, usize>,
        invariant_shift: i64,
    },
}

fn repair_template(
    body: &mut [Cmd],
    next_iter: &[Cmd],
    start: usize,
    index_name: &str,
    mode: &mut RepairMode,
) {
    for (line, (cmd, next)) in body.iter_mut().zip(next_iter).enumerate() {
        repair_cmd(cmd, next, line, start, index_name, mode);
    }
}

fn repair_cmd(
    cmd: &mut Cmd,
    next: &Cmd,
    line: usize,
    start: usize,
    index_name: &str,
    mode: &mut RepairMode,
) {
    match (cmd, next) {
        (Cmd::Def { rhs, .. }, Cmd::Def { rhs: rhs_next, .. })
        | (Cmd::Assign { rhs, .. }, Cmd::Assign { rhs: rhs_next, .. }) => {
            repair_expr(rhs, rhs_next, line, start, index_name, mode);
        }
        (Cmd::For { count, body, .. }, Cmd::For { count: count_next, body: body_next, .. }) => {
            assert_eq!(
                count, count_next,
                "candidate iterations disagree on a nested loop count at body line {}",
                line
            );
            assert_eq!(
                body.len(),
                body_next.len(),
                "candidate iterations disagree on a nested loop length at body line {}",
                line
            );
            // Nested body slots hold offsets relative to their effective
            // position (loop line + slot + 1), so classification recurses
            // at that line. The collapse shifts every window position by
            // the same amount, which keeps the anchor and invariant
            // formulas valid at any depth.
            for (b, (inner, inner_next)) in
                body.cmds.iter_mut().zip(&body_next.cmds).enumerate()
            {
                repair_cmd(inner, inner_next, line + b + 1, start, index_name, mode);
            }
        }
        (cmd, next) => panic!(
            "candidate iterations are not copies at body line {}: {:?} vs {:?}",
            line, cmd, next
        ),
    }
}

fn repair_expr(
    e: &mut Expr,
    next: &Expr,
    line: usize,
    start: usize,
    index_name: &str,
    mode: &mut RepairMode,
) {
    match (e, next) {
        (Expr::Op { op, args }, Expr::Op { op: op_next, args: args_next }) => {
            assert_eq!(
                op, op_next,
                "candidate iterations disagree on an opcode at body line {}",
                line
            );
            pair_args(args, args_next, line, start, index_name, mode);
        }
        (Expr::Val { op, args }, Expr::Val { op: op_next, args: args_next }) => {
            assert_eq!(
                op, op_next,
                "candidate iterations disagree on an opcode at body line {}",
                line
            );
            pair_args(args, args_next, line, start, index_name, mode);
        }
        (Expr::Slice(items), Expr::Slice(items_next)) => {
            assert_eq!(
                items.len(),
                items_next.len(),
                "candidate iterations disagree on a select pattern length at body line {}",
                line
            );
            // A pattern head that varies between iterations tracks the
            // iteration number: it becomes the loop index variable.
            let head_differs = matches!(
                (items.first(), items_next.first()),
                (Some(a), Some(b)) if a != b
            );
            if head_differs {
                if let RepairMode::Apply { .. } = mode {
                    items[0] = Expr::var_name(index_name);
                }
            }
            for (k, (item, item_next)) in items.iter_mut().zip(items_next).enumerate() {
                if k == 0 && head_differs {
                    continue;
                }
                repair_expr(item, item_next, line, start, index_name, mode);
            }
        }
        (Expr::Var(v), Expr::Var(v_next)) => {
            repair_ref(v, v_next, line, start, mode);
            match (&mut v.index, &v_next.index) {
                (Some(ix), Some(ix_next)) => {
                    repair_expr(ix, ix_next, line, start, index_name, mode)
                }
                (None, None) => {}
                _ => panic!(
                    "candidate iterations disagree on an index suffix at body line {}",
                    line
                ),
            }
        }
        (Expr::Lit(l), Expr::Lit(l_next)) => {
            assert_eq!(
                l, l_next,
                "candidate iterations disagree on a literal at body line {}",
                line
            );
        }
        (e, next) => panic!(
            "candidate iterations are not copies at body line {}: {:?} vs {:?}",
            line, e, next
        ),
    }
}

fn pair_args(
    args: &mut [Expr],
    args_next: &[Expr],
    line: usize,
    start: usize,
    index_name: &str,
    mode: &mut RepairMode,
) {
    assert_eq!(
        args.len(),
        args_next.len(),
        "candidate iterations disagree on an argument count at body line {}",
        line
    );
    for (a, a_next) in args.iter_mut().zip(args_next) {
        repair_expr(a, a_next, line, start, index_name, mode);
    }
}

/// Classify one positional reference of the template body against its
/// counterpart in the next iteration.
///
/// A reference at body line `i` with offset `d` stays inside its own
/// iteration when `i + d >= 0` and survives verbatim. An escaping reference
/// with the *same* offset in both iterations is loop-carried: it reads a
/// value a fixed distance behind the running iteration, so the pre-window
/// producer is captured in an anchor and the reference pointed at it
/// (`-i - j - 2` reaches the j-th created anchor past the loop head). An
/// escaping reference with *different* offsets reads the same producer from
/// every iteration and only shifts over the anchors and the loop command.
fn repair_ref(v: &mut VarRef, next: &VarRef, line: usize, start: usize, mode: &mut RepairMode) {
    let d = match v.id {
        VarId::Offset(d) => d,
        _ => return,
    };
    if line as i64 + d >= 0 {
        return;
    }
    let carried = match next.id {
        VarId::Offset(d_next) => d_next == d,
        _ => panic!(
            "candidate iterations pair a positional reference with {:?} at body line {}",
            next.id, line
        ),
    };
    if carried {
        let target = start as i64 + line as i64 + d;
        assert!(
            target >= 0,
            "loop-carried reference at body line {} reaches before the program start (offset {})",
            line,
            d
        );
        let target = target as usize;
        match mode {
            RepairMode::Plan(anchors) => {
                let fresh = anchors.len();
                anchors.entry(target).or_insert(fresh);
            }
            RepairMode::Apply { anchors, .. } => {
                let j = *anchors.get(&target).unwrap_or_else(|| {
                    panic!(
                        "anchor for producer line {} vanished between repair passes",
                        target
                    )
                });
                v.id = VarId::Offset(-(line as i64) - j as i64 - 2);
            }
        }
    } else if let RepairMode::Apply { invariant_shift, .. } = mode {
        v.id = VarId::Offset(d - *invariant_shift);
    }
}

/// After inserting one command at `at`, stretch every reference held by a
/// later command whose target sits before `at`. Effective positions make
/// the one test cover loop bodies too: an intra-body target is always at or
/// past its own loop line, so it never crosses.
fn stretch_after_insert(cmds: &mut [Cmd], at: usize) {
    for p in (at + 1)..cmds.len() {
        let pre = p - 1;
        walk_rhs(&mut cmds[p], &mut |e, loc| {
            if let Expr::Var(v) = e {
                if let VarId::Offset(d) = v.id {
                    if (pre + loc.eff_delta) as i64 + d < at as i64 {
                        v.id = VarId::Offset(d - 1);
                    }
                }
            }
            true
        });
    }
}

/// Repair references held after the collapsed window.
///
/// Every post-loop positional reference is classified through the explicit
/// correspondence between pre-collapse and post-collapse positions: its old
/// target was `cur + eff + K·L - 1 + d`. Targets before the window keep a
/// shrunk offset; targets inside the window at iteration J, body line B are
/// served by one array per body line (created before the loop, stored from
/// inside the body, read as `(array-ref a J)`); targets after the window
/// moved with their holders. Returns the number of arrays created.
fn repair_after(prog: &mut Block, for_pos: usize, body_len: usize, iters: usize) -> usize {
    let window = body_len * iters;

    // Plan: which window body lines are read after the loop. Creation order
    // fixes the array layout and every offset below.
    let mut arrays: IndexMap<usize, usize> = IndexMap::new();
    for c in (for_pos + 1)..prog.cmds.len() {
        walk_rhs(&mut prog.cmds[c], &mut |e, loc| {
            if let Expr::Var(v) = e {
                if let VarId::Offset(d) = v.id {
                    if loc.body_line.is_none() || (loc.eff_delta as i64 + d) < 0 {
                        let old_target = (c + loc.eff_delta + window - 1) as i64 + d;
                        if old_target >= for_pos as i64
                            && old_target < (for_pos + window) as i64
                        {
                            let line = (old_target as usize - for_pos) % body_len;
                            let fresh = arrays.len();
                            arrays.entry(line).or_insert(fresh);
                        }
                    }
                }
            }
            true
        });
    }
    let num_arrays = arrays.len();

    // Rewrite post-loop references in final coordinates.
    for c in (for_pos + 1)..prog.cmds.len() {
        walk_rhs(&mut prog.cmds[c], &mut |e, loc| {
            if let Expr::Var(v) = e {
                if let VarId::Offset(d) = v.id {
                    if loc.body_line.is_none() || (loc.eff_delta as i64 + d) < 0 {
                        let old_target = (c + loc.eff_delta + window - 1) as i64 + d;
                        if old_target >= for_pos as i64
                            && old_target < (for_pos + window) as i64
                        {
                            let off = old_target as usize - for_pos;
                            let (which_iter, line) = (off / body_len, off % body_len);
                            let m = arrays[&line];
                            let base =
                                for_pos as i64 - (c + loc.eff_delta) as i64 - m as i64 - 1;
                            *e = Expr::Val {
                                op: ValOp::ArrayRef,
                                args: vec![Expr::var_offset(base), Expr::lit(which_iter)],
                            };
                            return false;
                        } else if old_target < for_pos as i64 {
                            v.id = VarId::Offset(d + window as i64 - 1 - num_arrays as i64);
                        }
                    }
                }
            }
            true
        });
    }

    if num_arrays == 0 {
        return 0;
    }

    // Escaping body references stretch over the arrays too.
    walk_rhs(&mut prog.cmds[for_pos], &mut |e, loc| {
        if let Expr::Var(v) = e {
            if let VarId::Offset(d) = v.id {
                if (loc.eff_delta as i64 + d) < 0 {
                    v.id = VarId::Offset(d - num_arrays as i64);
                }
            }
        }
        true
    });

    // The m-th created array lands at for_pos + num_arrays - 1 - m. The
    // creates are identical, so a batch insert does.
    prog.cmds.splice(
        for_pos..for_pos,
        std::iter::repeat_with(|| Cmd::Def {
            lhs: VarRef::line(for_pos),
            rhs: Expr::Val {
                op: ValOp::ArrayCreate,
                args: vec![Expr::lit(iters)],
            },
        })
        .take(num_arrays),
    );

    // One store per captured body line, right after its producer. Ascending
    // final positions mean an insertion never moves an earlier store, so the
    // precomputed left-hand offsets hold.
    let mut by_line: Vec<(usize, usize)> = arrays.iter().map(|(&line, &m)| (line, m)).collect();
    by_line.sort_unstable_by_key(|&(line, _)| line);
    let (index_name, for_body) = match &mut prog.cmds[for_pos + num_arrays] {
        Cmd::For { index, body, .. } => (index.clone(), body),
        c => panic!("loop command not found after array insertion: {:?}", c),
    };
    for (rank, &(line, m)) in by_line.iter().enumerate() {
        let at = line + 1 + rank;
        let store = Cmd::Assign {
            lhs: VarRef::offset(-(m as i64) - at as i64 - 2),
            rhs: Expr::Val {
                op: ValOp::ArrayStore,
                args: vec![
                    Expr::var_name(index_name.clone()),
                    Expr::var_offset(-1),
                ],
            },
        };
        insert_body_cmd(for_body, at, store);
    }
    num_arrays
}

/// Insert into a loop body at `at`, stretching references held by later
/// body lines whose targets did not move: body slots before `at` and
/// everything outside the loop.
fn insert_body_cmd(body: &mut Block, at: usize, cmd: Cmd) {
    body.cmds.insert(at, cmd);
    for b in (at + 1)..body.cmds.len() {
        let pre = b - 1;
        walk_rhs(&mut body.cmds[b], &mut |e, loc| {
            if let Expr::Var(v) = e {
                if let VarId::Offset(d) = v.id {
                    if (pre + loc.eff_delta) as i64 + d < at as i64 {
                        v.id = VarId::Offset(d - 1);
                    }
                }
            }
            true
        });
    }
}

/// Resolve positional offsets into the final address forms: top-level
/// left-hand sides become absolute `Line`s, loop body definitions become
/// `Dotted` line.slot addresses, and every reference resolves against its
/// holder's effective position. A body reference staying within `slot`
/// lines is dotted into its own loop; anything else becomes an absolute
/// line. Symbolic names (loop indices) stay.
fn resolve(block: &mut Block) {
    for i in 0..block.cmds.len() {
        match &mut block.cmds[i] {
            Cmd::Def { lhs, rhs } | Cmd::Assign { lhs, rhs } => {
                lhs.id = VarId::Line(i);
                resolve_expr(rhs, i, None);
            }
            Cmd::For { body, .. } => resolve_body(body, i),
        }
    }
}

fn resolve_body(body: &mut Block, for_pos: usize) {
    for (slot, cmd) in body.cmds.iter_mut().enumerate() {
        let eff = for_pos + slot + 1;
        match cmd {
            Cmd::Def { lhs, rhs } => {
                lhs.id = VarId::Dotted { line: for_pos, slot };
                resolve_expr(rhs, eff, Some(slot));
            }
            Cmd::Assign { lhs, rhs } => {
                // An offset left-hand side (array store) addresses a line
                // outside the loop; a captured rebind addresses its own slot.
                match lhs.id {
                    VarId::Offset(d) => {
                        let target = eff as i64 + d;
                        assert!(
                            target >= 0,
                            "store at {}.{} resolves before line 0 (offset {})",
                            for_pos,
                            slot,
                            d
                        );
                        lhs.id = VarId::Line(target as usize);
                    }
                    _ => lhs.id = VarId::Dotted { line: for_pos, slot },
                }
                resolve_expr(rhs, eff, Some(slot));
            }
            Cmd::For { body: inner, .. } => resolve_body(inner, eff),
        }
    }
}

fn resolve_expr(e: &mut Expr, eff: usize, slot: Option<usize>) {
    match e {
        Expr::Var(v) => {
            if let VarId::Offset(d) = v.id {
                v.id = match slot {
                    Some(s) if d.unsigned_abs() as usize <= s => VarId::Dotted {
                        line: eff - s - 1,
                        slot: (s as i64 + d) as usize,
                    },
                    _ => {
                        let target = eff as i64 + d;
                        assert!(
                            target >= 0,
                            "reference at position {} resolves before line 0 (offset {})",
                            eff,
                            d
                        );
                        VarId::Line(target as usize)
                    }
                };
            }
            if let Some(ix) = &mut v.index {
                resolve_expr(ix, eff, slot);
            }
        }
        Expr::Op { args, .. } | Expr::Val { args, .. } | Expr::Slice(args) => {
            for a in args {
                resolve_expr(a, eff, slot);
            }
        }
        Expr::Lit(_) => {}
    }
}
