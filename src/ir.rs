// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Loop-aware IR for gate-level netlist programs.
//!
//! A program is a [`Block`]: an ordered list of commands where a definition
//! is addressed by its position. Commands bind wire expressions ([`Cmd::Def`]),
//! rebind output/register wires ([`Cmd::Assign`]), or repeat a nested block
//! ([`Cmd::For`]). References inside right-hand sides are [`VarRef`]s whose
//! identity progresses through the pipeline: symbolic names out of the
//! normalizer, signed positional offsets after the de Bruijn pass, and
//! absolute `line` / dotted `line.slot` addresses after rerolling.
//!
//! Serialization is deterministic parenthesized prefix text, one line per
//! top-level command. Positional references sitting in an indexing tail of a
//! select or in address arithmetic render with a pointer mark `(& n)`; the
//! mark is a property of the reference's syntactic context, computed at
//! render time, so the stored identity stays a plain integer through every
//! rewrite.

use compact_str::{CompactString, ToCompactString};
use std::fmt;

/// An ordered, nestable sequence of commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub cmds: Vec<Cmd>,
}

/// One program command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cmd {
    /// First (and only) binding of a wire value.
    Def { lhs: VarRef, rhs: Expr },
    /// Rebind of an already-declared output or register wire.
    /// Renders `(<lhs> (<<= <rhs>))`.
    Assign { lhs: VarRef, rhs: Expr },
    /// `count` repetitions of `body` under index variable `index`.
    For {
        index: CompactString,
        count: usize,
        body: Block,
    },
}

/// A right-hand-side expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Wire-level operation.
    Op { op: WireOp, args: Vec<Expr> },
    /// Value-level construct (memory/array creation, address arithmetic).
    Val { op: ValOp, args: Vec<Expr> },
    /// Variable reference.
    Var(VarRef),
    /// Raw literal token.
    Lit(Literal),
    /// Ordered index/content list. Renders space-joined; contexts that
    /// require it (select patterns, concat operands, value-op arguments)
    /// wrap it in `(list ...)`.
    Slice(Vec<Expr>),
}

/// A variable reference with an optional index suffix (renders `[i]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarRef {
    pub id: VarId,
    pub index: Option<Box<Expr>>,
}

/// The identity of a referenced definition.
///
/// `Name` is the symbolic form produced by the normalizer. `Offset` is the
/// signed positional distance to the definition (negative means earlier).
/// `Line` is an absolute top-level output line, and `Dotted` addresses
/// intra-loop values as `(loop line, body slot)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VarId {
    Name(CompactString),
    Offset(i64),
    Line(usize),
    Dotted { line: usize, slot: usize },
}

/// A raw token carried through serialization unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Literal(pub CompactString);

/// Wire-level opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Eq,
    Lt,
    Gt,
    Nand,
    Not,
    Mux,
    Concat,
    Select,
    Const,
    Input,
    Output,
    Register,
    MemRead,
    MemWrite,
    RegNext,
    Connect,
}

/// Value-level opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValOp {
    MemBlockCreate,
    RomBlockCreate,
    ArrayCreate,
    ArrayRef,
    ArrayStore,
    ARange,
    AAdd,
    ASub,
    AMul,
    ADiv,
    AMod,
}

impl WireOp {
    fn token(self) -> &'static str {
        match self {
            WireOp::Add => "w+",
            WireOp::Sub => "w-",
            WireOp::Mul => "w*",
            WireOp::And => "w&",
            WireOp::Or => "w||",
            WireOp::Xor => "w^",
            WireOp::Eq => "w=",
            WireOp::Lt => "w<",
            WireOp::Gt => "w>",
            WireOp::Nand => "wn",
            WireOp::Not => "w~",
            WireOp::Mux => "wx",
            WireOp::Concat => "wc",
            WireOp::Select => "ws",
            WireOp::Const => "bv-const",
            WireOp::Input => "Input",
            WireOp::Output => "Output",
            WireOp::Register => "Register",
            WireOp::MemRead => "wm",
            WireOp::MemWrite => "w@",
            WireOp::RegNext => "",
            WireOp::Connect => "<w=",
        }
    }
}

impl ValOp {
    fn token(self) -> &'static str {
        match self {
            ValOp::MemBlockCreate => "mem-block-create",
            ValOp::RomBlockCreate => "rom-block-create",
            ValOp::ArrayCreate => "array-create",
            ValOp::ArrayRef => "array-ref",
            ValOp::ArrayStore => "array-store",
            ValOp::ARange => "arange",
            ValOp::AAdd => "a+",
            ValOp::ASub => "a-",
            ValOp::AMul => "a*",
            ValOp::ADiv => "a/",
            ValOp::AMod => "a%",
        }
    }

    fn marks_positional_args(self) -> bool {
        matches!(
            self,
            ValOp::AAdd | ValOp::ASub | ValOp::AMul | ValOp::ADiv | ValOp::AMod
        )
    }
}

impl VarRef {
    pub fn name(n: impl Into<CompactString>) -> Self {
        VarRef {
            id: VarId::Name(n.into()),
            index: None,
        }
    }

    pub fn offset(d: i64) -> Self {
        VarRef {
            id: VarId::Offset(d),
            index: None,
        }
    }

    pub fn line(l: usize) -> Self {
        VarRef {
            id: VarId::Line(l),
            index: None,
        }
    }

    pub fn dotted(line: usize, slot: usize) -> Self {
        VarRef {
            id: VarId::Dotted { line, slot },
            index: None,
        }
    }
}

impl Expr {
    pub fn var(v: VarRef) -> Self {
        Expr::Var(v)
    }

    pub fn var_name(n: impl Into<CompactString>) -> Self {
        Expr::Var(VarRef::name(n))
    }

    pub fn var_offset(d: i64) -> Self {
        Expr::Var(VarRef::offset(d))
    }

    pub fn lit(l: impl Into<Literal>) -> Self {
        Expr::Lit(l.into())
    }
}

impl Cmd {
    pub fn lhs(&self) -> Option<&VarRef> {
        match self {
            Cmd::Def { lhs, .. } | Cmd::Assign { lhs, .. } => Some(lhs),
            Cmd::For { .. } => None,
        }
    }

    pub fn rhs(&self) -> Option<&Expr> {
        match self {
            Cmd::Def { rhs, .. } | Cmd::Assign { rhs, .. } => Some(rhs),
            Cmd::For { .. } => None,
        }
    }

    pub fn rhs_mut(&mut self) -> Option<&mut Expr> {
        match self {
            Cmd::Def { rhs, .. } | Cmd::Assign { rhs, .. } => Some(rhs),
            Cmd::For { .. } => None,
        }
    }
}

impl Block {
    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal(CompactString::from(s))
    }
}

impl From<CompactString> for Literal {
    fn from(s: CompactString) -> Self {
        Literal(s)
    }
}

impl From<u64> for Literal {
    fn from(v: u64) -> Self {
        Literal(v.to_compact_string())
    }
}

impl From<usize> for Literal {
    fn from(v: usize) -> Self {
        Literal(v.to_compact_string())
    }
}

impl From<u32> for Literal {
    fn from(v: u32) -> Self {
        Literal(v.to_compact_string())
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a reference sits relative to its holding top-level command.
///
/// `eff_delta` is added to the holder's top-level position to obtain the
/// reference's effective position (0 outside loops; `b + 1` at body line
/// `b`, accumulated across nesting). `body_line` is the innermost body
/// index, if any: a reference at body line `b` with offset `d` stays inside
/// its own iteration exactly when `b + d >= 0`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RefLoc {
    pub eff_delta: usize,
    pub body_line: Option<usize>,
}

impl RefLoc {
    pub(crate) fn top() -> Self {
        RefLoc {
            eff_delta: 0,
            body_line: None,
        }
    }
}

/// Visit every expression node in a command's right-hand side, including
/// nested loop bodies, in pre-order. The callback returns whether to
/// descend into the node's children; returning `false` after replacing a
/// node keeps the walk off the replacement's subtree.
pub(crate) fn walk_rhs(cmd: &mut Cmd, f: &mut impl FnMut(&mut Expr, RefLoc) -> bool) {
    walk_cmd_at(cmd, RefLoc::top(), f);
}

fn walk_cmd_at(cmd: &mut Cmd, at: RefLoc, f: &mut impl FnMut(&mut Expr, RefLoc) -> bool) {
    match cmd {
        Cmd::Def { rhs, .. } | Cmd::Assign { rhs, .. } => walk_expr_at(rhs, at, f),
        Cmd::For { body, .. } => {
            for (b, inner) in body.cmds.iter_mut().enumerate() {
                let loc = RefLoc {
                    eff_delta: at.eff_delta + b + 1,
                    body_line: Some(b),
                };
                walk_cmd_at(inner, loc, f);
            }
        }
    }
}

fn walk_expr_at(e: &mut Expr, at: RefLoc, f: &mut impl FnMut(&mut Expr, RefLoc) -> bool) {
    if !f(e, at) {
        return;
    }
    match e {
        Expr::Op { args, .. } | Expr::Val { args, .. } | Expr::Slice(args) => {
            for a in args {
                walk_expr_at(a, at, f);
            }
        }
        Expr::Var(v) => {
            if let Some(ix) = &mut v.index {
                walk_expr_at(ix, at, f);
            }
        }
        Expr::Lit(_) => {}
    }
}

/// Rendering context for a reference: `Marked` positions wrap positional
/// identities in a pointer mark `(& n)`.
#[derive(Clone, Copy, PartialEq)]
enum RefStyle {
    Direct,
    Marked,
}

fn fmt_var(f: &mut fmt::Formatter<'_>, v: &VarRef, style: RefStyle) -> fmt::Result {
    let marked = style == RefStyle::Marked && !matches!(v.id, VarId::Name(_));
    if marked {
        write!(f, "(& ")?;
    }
    match &v.id {
        VarId::Name(n) => write!(f, "{}", n)?,
        VarId::Offset(d) => write!(f, "{}", d)?,
        VarId::Line(l) => write!(f, "{}", l)?,
        VarId::Dotted { line, slot } => write!(f, "{}.{}", line, slot)?,
    }
    if marked {
        write!(f, ")")?;
    }
    if let Some(ix) = &v.index {
        write!(f, "[")?;
        fmt_expr(f, ix, RefStyle::Direct)?;
        write!(f, "]")?;
    }
    Ok(())
}

fn fmt_args(f: &mut fmt::Formatter<'_>, args: &[Expr], style: RefStyle) -> fmt::Result {
    for a in args {
        write!(f, " ")?;
        match a {
            Expr::Slice(items) => {
                write!(f, "(list")?;
                fmt_args(f, items, RefStyle::Direct)?;
                write!(f, ")")?;
            }
            _ => fmt_expr(f, a, style)?,
        }
    }
    Ok(())
}

fn fmt_expr(f: &mut fmt::Formatter<'_>, e: &Expr, style: RefStyle) -> fmt::Result {
    match e {
        Expr::Var(v) => fmt_var(f, v, style),
        Expr::Lit(l) => write!(f, "{}", l.0),
        Expr::Slice(items) => {
            // Bare slices render space-joined; argument positions that need
            // a (list ...) wrapper add it in fmt_args.
            let mut first = true;
            for it in items {
                if !first {
                    write!(f, " ")?;
                }
                first = false;
                fmt_expr(f, it, RefStyle::Direct)?;
            }
            Ok(())
        }
        Expr::Op { op, args } => match op {
            WireOp::RegNext => match args.first() {
                Some(a) => fmt_expr(f, a, RefStyle::Direct),
                None => Ok(()),
            },
            WireOp::Concat => {
                write!(f, "(wc (list")?;
                fmt_args(f, args, RefStyle::Direct)?;
                write!(f, "))")
            }
            WireOp::Select => {
                write!(f, "(ws")?;
                if let Some(src) = args.first() {
                    write!(f, " ")?;
                    fmt_expr(f, src, RefStyle::Direct)?;
                }
                fmt_args(f, &args[1.min(args.len())..], RefStyle::Marked)?;
                write!(f, ")")
            }
            _ => {
                write!(f, "({}", op.token())?;
                fmt_args(f, args, RefStyle::Direct)?;
                write!(f, ")")
            }
        },
        Expr::Val { op, args } => {
            let style = if op.marks_positional_args() {
                RefStyle::Marked
            } else {
                RefStyle::Direct
            };
            write!(f, "({}", op.token())?;
            fmt_args(f, args, style)?;
            write!(f, ")")
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_expr(f, self, RefStyle::Direct)
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_var(f, self, RefStyle::Direct)
    }
}

const INDENT: &str = "  ";

fn fmt_cmd(f: &mut fmt::Formatter<'_>, cmd: &Cmd, level: usize) -> fmt::Result {
    for _ in 0..level {
        write!(f, "{}", INDENT)?;
    }
    match cmd {
        Cmd::Def { lhs, rhs } => {
            write!(f, "(")?;
            fmt_var(f, lhs, RefStyle::Direct)?;
            write!(f, " ")?;
            fmt_expr(f, rhs, RefStyle::Direct)?;
            write!(f, ")")
        }
        Cmd::Assign { lhs, rhs } => {
            write!(f, "(")?;
            fmt_var(f, lhs, RefStyle::Direct)?;
            write!(f, " (<<= ")?;
            fmt_expr(f, rhs, RefStyle::Direct)?;
            write!(f, "))")
        }
        Cmd::For { index, count, body } => {
            write!(f, "({0} (for-range {0} {1} (loop-body", index, count)?;
            for (i, inner) in body.cmds.iter().enumerate() {
                writeln!(f)?;
                fmt_cmd(f, inner, level + 1)?;
                if i + 1 == body.cmds.len() {
                    write!(f, ")))")?;
                }
            }
            if body.cmds.is_empty() {
                write!(f, ")))")?;
            }
            Ok(())
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_cmd(f, self, 0)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.cmds.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            fmt_cmd(f, c, 0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(a: Expr, b: Expr) -> Expr {
        Expr::Op {
            op: WireOp::Add,
            args: vec![a, b],
        }
    }

    #[test]
    fn test_render_def_and_assign() {
        let d = Cmd::Def {
            lhs: VarRef::name("c"),
            rhs: add(Expr::var_name("a"), Expr::var_name("b")),
        };
        assert_eq!(d.to_string(), "(c (w+ a b))");
        let a = Cmd::Assign {
            lhs: VarRef::name("out1"),
            rhs: Expr::var_name("t3"),
        };
        assert_eq!(a.to_string(), "(out1 (<<= t3))");
    }

    #[test]
    fn test_render_select_forms() {
        let explicit = Expr::Op {
            op: WireOp::Select,
            args: vec![
                Expr::var_name("x"),
                Expr::Slice(vec![Expr::lit(0u64), Expr::lit(2u64), Expr::lit(5u64)]),
            ],
        };
        assert_eq!(explicit.to_string(), "(ws x (list 0 2 5))");

        let arange = Expr::Op {
            op: WireOp::Select,
            args: vec![
                Expr::var_name("x"),
                Expr::Val {
                    op: ValOp::ARange,
                    args: vec![Expr::lit(0u64), Expr::lit(8u64)],
                },
            ],
        };
        assert_eq!(arange.to_string(), "(ws x (arange 0 8))");
    }

    #[test]
    fn test_positional_marking_in_index_tails() {
        // A positional reference in a select tail takes the pointer mark;
        // the select source never does.
        let e = Expr::Op {
            op: WireOp::Select,
            args: vec![Expr::var_offset(-4), Expr::var_offset(-2)],
        };
        assert_eq!(e.to_string(), "(ws -4 (& -2))");

        let a = Expr::Val {
            op: ValOp::AAdd,
            args: vec![Expr::var_offset(-1), Expr::lit(1u64)],
        };
        assert_eq!(a.to_string(), "(a+ (& -1) 1)");

        // Symbolic names stay bare even in marked positions.
        let s = Expr::Op {
            op: WireOp::Select,
            args: vec![Expr::var_name("x"), Expr::var_name("i")],
        };
        assert_eq!(s.to_string(), "(ws x i)");
    }

    #[test]
    fn test_render_concat_and_const() {
        let e = Expr::Op {
            op: WireOp::Concat,
            args: vec![
                Expr::var_offset(-1),
                Expr::Op {
                    op: WireOp::Const,
                    args: vec![Expr::lit(5u64), Expr::lit(3u64)],
                },
            ],
        };
        assert_eq!(e.to_string(), "(wc (list -1 (bv-const 5 3)))");
    }

    #[test]
    fn test_render_regnext_and_connect() {
        let r = Expr::Op {
            op: WireOp::RegNext,
            args: vec![Expr::var_name("t1")],
        };
        assert_eq!(r.to_string(), "t1");
        let w = Expr::Op {
            op: WireOp::Connect,
            args: vec![Expr::var_name("t1")],
        };
        assert_eq!(w.to_string(), "(<w= t1)");
    }

    #[test]
    fn test_render_for_body_indented() {
        let body = Block {
            cmds: vec![
                Cmd::Def {
                    lhs: VarRef::line(0),
                    rhs: add(Expr::var_offset(-3), Expr::var_offset(-2)),
                },
                Cmd::Assign {
                    lhs: VarRef::offset(-5),
                    rhs: Expr::Val {
                        op: ValOp::ArrayStore,
                        args: vec![Expr::var_name("i"), Expr::var_offset(-1)],
                    },
                },
            ],
        };
        let cmd = Cmd::For {
            index: "i".into(),
            count: 4,
            body,
        };
        let expect = "(i (for-range i 4 (loop-body\n  \
                      (0 (w+ -3 -2))\n  \
                      (-5 (<<= (array-store i -1))))))";
        assert_eq!(cmd.to_string(), expect);
    }

    #[test]
    fn test_render_dotted_and_indexed() {
        let v = VarRef::dotted(12, 3);
        assert_eq!(v.to_string(), "12.3");
        let indexed = VarRef {
            id: VarId::Name("arr".into()),
            index: Some(Box::new(Expr::var_name("i"))),
        };
        assert_eq!(indexed.to_string(), "arr[i]");
    }

    #[test]
    fn test_walker_reports_effective_positions() {
        let mut cmd = Cmd::For {
            index: "i".into(),
            count: 2,
            body: Block {
                cmds: vec![
                    Cmd::Def {
                        lhs: VarRef::line(0),
                        rhs: Expr::var_offset(-4),
                    },
                    Cmd::Def {
                        lhs: VarRef::line(0),
                        rhs: add(Expr::var_offset(-1), Expr::var_offset(-7)),
                    },
                ],
            },
        };
        let mut seen = Vec::new();
        walk_rhs(&mut cmd, &mut |e, loc| {
            if let Expr::Var(v) = e {
                if let VarId::Offset(d) = v.id {
                    seen.push((d, loc.eff_delta, loc.body_line));
                }
            }
            true
        });
        assert_eq!(
            seen,
            vec![(-4, 1, Some(0)), (-1, 2, Some(1)), (-7, 2, Some(1))],
            "walker must report body-line effective deltas"
        );
    }
}
