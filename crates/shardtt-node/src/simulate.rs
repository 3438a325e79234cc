//! 同一プロセス内で N ノードを動かす
//!
//! 各ノードのストアを `LocalFabric` に接続し、ノードごとにスレッド群で合成負荷を
//! 実行する。replicated なら各ノードで集団マージのタスクも回す。

use anyhow::{Context, Result};
use shardtt_core::remote::{Collective, LocalFabric, RemoteWindow};
use shardtt_core::{CollectiveMerge, DistributedTable, StopSignal, TableMode, TtConfig};
use std::sync::Arc;

use crate::config::NodeConfig;
use crate::report::{NodeReport, print_reports};
use crate::workload::{self, WorkloadSummary};

/// ノード数分のテーブルを作ってファブリックに接続する
pub fn build_tables(base: &TtConfig, fabric: &Arc<LocalFabric>) -> Result<Vec<Arc<DistributedTable>>> {
    (0..base.node_count)
        .map(|rank| {
            let config = TtConfig {
                rank,
                ..base.clone()
            };
            let window: Arc<dyn RemoteWindow> = Arc::new(fabric.port());
            let table = DistributedTable::with_window(config, window)
                .with_context(|| format!("failed to create table for rank {rank}"))?;
            fabric.attach(rank, Arc::clone(table.store()));
            Ok(Arc::new(table))
        })
        .collect()
}

pub fn run(config: NodeConfig, json: bool) -> Result<()> {
    let mut base = config.table.clone();
    base.rank = 0;
    base.validate()?;
    config.validate()?;

    let fabric = LocalFabric::new(base.node_count, base.collective_timeout());
    let tables = build_tables(&base, &fabric)?;
    log::info!(
        "simulating {} nodes ({:?}, partition {}), {} threads each",
        base.node_count,
        base.mode,
        tables[0].partitioner_name(),
        config.workload.threads
    );

    let collective: Arc<dyn Collective> = fabric.collective();
    let stop = StopSignal::new();

    let results: Vec<Result<(WorkloadSummary, usize)>> = std::thread::scope(|scope| {
        let mergers: Vec<_> = if base.mode == TableMode::Replicated {
            tables
                .iter()
                .map(|table| {
                    let merge = CollectiveMerge::new(Arc::clone(table), Arc::clone(&collective));
                    let stop = &stop;
                    Some(scope.spawn(move || merge.run(stop)))
                })
                .collect()
        } else {
            tables.iter().map(|_| None).collect()
        };

        let workers: Vec<_> = tables
            .iter()
            .map(|table| {
                let load = &config.workload;
                scope.spawn(move || workload::drive(table, load, table.rank()))
            })
            .collect();
        let summaries: Vec<Result<WorkloadSummary>> = workers
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect();
        stop.stop();

        summaries
            .into_iter()
            .zip(mergers)
            .map(|(summary, merger)| -> Result<(WorkloadSummary, usize)> {
                let passes = match merger {
                    Some(handle) => handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e))?,
                    None => 0,
                };
                Ok((summary?, passes))
            })
            .collect()
    });

    let mut reports = Vec::with_capacity(tables.len());
    for (table, result) in tables.iter().zip(results) {
        let (summary, passes) = result.with_context(|| format!("rank {} failed", table.rank()))?;
        reports.push(NodeReport::collect(table, summary, passes));
    }
    log::info!("fabric served {} window calls", fabric.calls());
    print_reports(&reports, json)
}
