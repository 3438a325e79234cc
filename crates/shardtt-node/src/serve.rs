//! TCP ノードとして動く
//!
//! 1. 自分のストアを `WindowServer` で公開する（rank 0 は集団通信もホストする）
//! 2. 全ノードの待ち受けを待つ
//! 3. 合成負荷を実行する（replicated なら並行して集団マージを回す）
//! 4. 全ノードが終わるまで待ってから終了する

use anyhow::{Context, Result, bail};
use shardtt_core::remote::{Collective, Rendezvous, RemoteWindow, TcpCollective, TcpWindow, WindowServer};
use shardtt_core::{CollectiveMerge, DistributedTable, StopSignal, TableMode, TtResult};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::NodeConfig;
use crate::report::{NodeReport, print_reports};
use crate::workload;

const PEER_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub fn run(config: NodeConfig, json: bool) -> Result<()> {
    config.validate_for_serve()?;
    let tt = config.table.clone();
    let rank = tt.rank;
    let listen = config.listen_addr()?;

    let table = DistributedTable::new(tt.clone()).context("failed to create transposition table")?;
    let rendezvous = (rank == 0).then(|| Arc::new(Rendezvous::new(tt.node_count, tt.collective_timeout())));
    let _server = WindowServer::spawn(listen, Arc::clone(table.store()), rendezvous.clone())
        .with_context(|| format!("failed to listen on {listen}"))?;
    log::info!(
        "[TT Window] rank {rank}/{} serving {} clusters on {listen}",
        tt.node_count,
        table.cluster_count()
    );

    wait_for_peers(&config.node.peers, tt.collective_timeout())?;

    let window: Arc<dyn RemoteWindow> = Arc::new(TcpWindow::new(config.node.peers.clone()));
    let table = Arc::new(table.attach_window(window));
    let collective: Arc<dyn Collective> = match rendezvous {
        Some(rendezvous) => rendezvous,
        None => Arc::new(TcpCollective::new(config.node.peers[0], tt.collective_timeout())),
    };

    let merge = CollectiveMerge::new(Arc::clone(&table), Arc::clone(&collective));
    let stop = StopSignal::new();
    let (summary, merge_passes) = std::thread::scope(|scope| -> Result<_> {
        let merger = (tt.mode == TableMode::Replicated).then(|| scope.spawn(|| merge.run(&stop)));

        let summary = workload::drive(&table, &config.workload, rank);
        stop.stop();

        let merge_passes = match merger {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|e| std::panic::resume_unwind(e))
                .context("collective merge failed")?,
            None => 0,
        };
        Ok((summary?, merge_passes))
    })?;

    // 他ノードがまだこのノードのストアを使っているかもしれない
    barrier(collective.as_ref(), merge.rounds(), rank).context("final barrier failed")?;

    print_reports(&[NodeReport::collect(&table, summary, merge_passes)], json)
}

/// 全ノードの待ち受けが始まるまで待つ
fn wait_for_peers(peers: &[SocketAddr], timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    for (node, addr) in peers.iter().enumerate() {
        loop {
            match TcpStream::connect_timeout(addr, PEER_POLL_INTERVAL) {
                Ok(_) => break,
                Err(e) if Instant::now() >= deadline => {
                    bail!("node {node} at {addr} did not come up: {e}");
                }
                Err(_) => std::thread::sleep(PEER_POLL_INTERVAL),
            }
        }
    }
    log::debug!("[TT Window] all {} peers are listening", peers.len());
    Ok(())
}

/// 空のバッチで1ラウンド回し、全ノードの到着を待つ
fn barrier(collective: &dyn Collective, round: u64, rank: usize) -> TtResult<()> {
    collective.all_reduce(round, rank, 0, false, Vec::new()).map(|_| ())
}
