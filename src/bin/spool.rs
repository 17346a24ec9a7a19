// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Loop rerolling driver.
//!
//! Reads a def/use netlist graph in JSON form, normalizes it into a
//! positional command program, rerolls the given candidate window, and dumps
//! the program before and after.
//!
//! Usage:
//!   cargo run -r --bin spool -- <graph.json> --candidate 3,2,3 [options]

use spool::netgraph::NetGraph;
use spool::normalize::{normalize, NormalizeOptions};
use spool::reroll::{reroll_first, LoopCandidate};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(clap::Parser, Debug)]
#[command(name = "spool")]
#[command(about = "Reroll unrolled loops in def/use netlist graphs")]
struct Args {
    /// Def/use netlist graph in JSON form.
    graph_json: PathBuf,

    /// Loop candidate as start,len,iters (repeatable).
    /// Rerolling handles one window per pass: only the first candidate
    /// is rerolled, the rest are reported and skipped.
    #[clap(long = "candidate")]
    candidates: Vec<LoopCandidate>,

    /// Write the pre-reroll program plus the candidate list here
    /// instead of stdout.
    #[clap(long)]
    pre: Option<PathBuf>,

    /// Write the rerolled program here instead of stdout.
    #[clap(long)]
    post: Option<PathBuf>,

    /// Keep select definitions instead of copy-propagating them.
    #[clap(long)]
    no_fold_selects: bool,

    /// Wall-clock budget in seconds for the def-before-use ordering repair.
    #[clap(long, default_value = "30")]
    repair_deadline_secs: u64,
}

fn main() {
    clilog::init_stderr_color_debug();

    let args = <Args as clap::Parser>::parse();
    clilog::info!("Spool args:\n{:#?}", args);

    let timer_load = clilog::stimer!("load_graph");
    let raw = std::fs::read_to_string(&args.graph_json).expect("cannot read graph file");
    let graph = NetGraph::from_json_str(&raw).expect("cannot parse graph JSON");
    clilog::finish!(timer_load);
    clilog::info!("Graph loaded: {} entries", graph.entries.len());

    let timer_norm = clilog::stimer!("normalize");
    let opts = NormalizeOptions {
        fold_selects: !args.no_fold_selects,
        repair_deadline: Duration::from_secs(args.repair_deadline_secs),
    };
    let (mut block, report) = normalize(&graph, &opts);
    clilog::finish!(timer_norm);
    clilog::info!(
        "Normalized: {} commands ({} relocated, {} consts inlined, {} concats folded, {} selects folded)",
        block.len(),
        report.relocations,
        report.consts_inlined,
        report.concats_folded,
        report.selects_folded
    );
    if report.skipped_malformed > 0 {
        clilog::warn!("{} malformed entries/operands skipped", report.skipped_malformed);
    }
    if report.ordering_timeout {
        clilog::warn!("def-before-use repair hit its deadline; order is incomplete");
    }

    spool::debruijn::convert(&mut block);

    dump(
        args.pre.as_deref(),
        &format!("{}\n{}", block, fmt_candidates(&args.candidates)),
    );

    let timer_reroll = clilog::stimer!("reroll");
    let rolled = match reroll_first(&block, &args.candidates) {
        Ok(Some(b)) => b,
        Ok(None) => {
            clilog::info!("no loop candidates given; nothing to reroll");
            return;
        }
        Err(e) => {
            clilog::error!("reroll failed: {}", e);
            std::process::exit(1);
        }
    };
    clilog::finish!(timer_reroll);
    clilog::info!("Rerolled: {} commands (was {})", rolled.len(), block.len());

    dump(args.post.as_deref(), &rolled.to_string());
}

/// Tuple-style candidate list, as the pre dump records it.
fn fmt_candidates(cands: &[LoopCandidate]) -> String {
    let items: Vec<String> = cands.iter().map(|c| c.to_string()).collect();
    format!("[{}]", items.join(", "))
}

fn dump(path: Option<&Path>, text: &str) {
    match path {
        Some(p) => std::fs::write(p, text).expect("cannot write dump file"),
        None => println!("{}", text),
    }
}
