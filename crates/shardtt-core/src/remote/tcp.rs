//! TCP 上のリモートウィンドウと集団通信
//!
//! - `TcpWindow`: 宛先ごとに1本、必要になった時点で張る同期接続のクライアント
//! - `WindowServer`: ノードのストアを公開するリスナー。tokio 上で接続ごとに1タスク。
//!   rank 0 は集団通信（`Rendezvous`）もホストする
//! - `TcpCollective`: rank 0 以外の参加者。バッチを rank 0 に送って結果を受け取る
//!
//! 往復は再試行しない。失敗した接続は捨て、次の呼び出しで張り直す。

use super::wire::{ErrorCode, Reply, Request, WireError, read_request_async};
use super::{Collective, Rendezvous, RemoteWindow};
use crate::error::{TtError, TtResult};
use crate::partition::NodeId;
use crate::tt::{Cluster, ClusterStore};
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;

/// 接続確立のタイムアウト
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// サーバーランタイムのワーカースレッド数
const SERVER_WORKERS: usize = 2;

/// 停止時にブロッキングタスクを待つ上限
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn connect(node: NodeId, addr: SocketAddr, read_timeout: Option<Duration>) -> TtResult<TcpStream> {
    let unreachable = |e: io::Error| TtError::Unreachable {
        node,
        reason: format!("{addr}: {e}"),
    };
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(unreachable)?;
    stream.set_nodelay(true).map_err(unreachable)?;
    stream.set_read_timeout(read_timeout).map_err(unreachable)?;
    log::debug!("[TT Window] connected to node {node} at {addr}");
    Ok(stream)
}

/// 1往復。失敗した接続は呼び出し側で捨てる
fn round_trip(stream: &mut TcpStream, request: &Request) -> Result<Reply, WireError> {
    request.write_to(stream)?;
    Reply::read_from(stream)
}

fn unexpected(node: NodeId, reply: &Reply) -> TtError {
    match reply {
        Reply::Error(code) => TtError::Protocol {
            detail: format!("node {node}: {}", code.describe()),
        },
        other => TtError::MalformedReply {
            node,
            detail: format!("unexpected reply {other:?}"),
        },
    }
}

/// TCP 上のリモートウィンドウ
pub struct TcpWindow {
    /// rank 順のノードのアドレス
    peers: Vec<SocketAddr>,
    connections: Mutex<Vec<Option<TcpStream>>>,
}

impl TcpWindow {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        let connections = Mutex::new(peers.iter().map(|_| None).collect());
        Self { peers, connections }
    }

    fn exchange(&self, node: NodeId, request: &Request) -> TtResult<Reply> {
        let addr = *self.peers.get(node).ok_or_else(|| TtError::Unreachable {
            node,
            reason: "no address configured".to_string(),
        })?;

        let mut connections = self.connections.lock();
        let mut stream = match connections[node].take() {
            Some(stream) => stream,
            None => connect(node, addr, None)?,
        };
        match round_trip(&mut stream, request) {
            Ok(reply) => {
                connections[node] = Some(stream);
                Ok(reply)
            }
            Err(e) => {
                log::warn!("[TT Window] request to node {node} at {addr} failed: {e}");
                Err(e.into_tt_error(node))
            }
        }
    }
}

impl RemoteWindow for TcpWindow {
    fn get(&self, node: NodeId, key: u64) -> TtResult<Cluster> {
        match self.exchange(node, &Request::Get { key })? {
            Reply::Cluster(cluster) => Ok(cluster),
            other => Err(unexpected(node, &other)),
        }
    }

    fn put(&self, node: NodeId, index: usize, cluster: &Cluster) -> TtResult<()> {
        let request = Request::Put {
            index: index as u64,
            cluster: *cluster,
        };
        match self.exchange(node, &request)? {
            Reply::Ack => Ok(()),
            other => Err(unexpected(node, &other)),
        }
    }

    fn put_batch(&self, node: NodeId, writes: &[(usize, Cluster)]) -> TtResult<()> {
        let request = Request::PutBatch {
            writes: writes.iter().map(|(index, cluster)| (*index as u64, *cluster)).collect(),
        };
        match self.exchange(node, &request)? {
            Reply::Ack => Ok(()),
            other => Err(unexpected(node, &other)),
        }
    }
}

/// ノードのストアを TCP で公開するサーバー
///
/// 専用の tokio ランタイムを持ち、listener タスクと接続ごとのタスクで応答する。
/// 探索スレッドとウィンドウ利用側は同期 API のまま使う。
pub struct WindowServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    runtime: Option<Runtime>,
}

impl WindowServer {
    /// `addr` で待ち受けを始める
    ///
    /// `collective` を渡したノード（rank 0）は REDUCE にも応答する。
    pub fn spawn(
        addr: impl ToSocketAddrs,
        store: Arc<ClusterStore>,
        collective: Option<Arc<Rendezvous>>,
    ) -> TtResult<Self> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(SERVER_WORKERS)
            .thread_name(format!("tt-window-{}", local_addr.port()))
            .enable_io()
            .build()?;
        let listener = {
            let _rt = runtime.enter();
            TcpListener::from_std(std_listener)?
        };

        let (shutdown, signal) = watch::channel(false);
        runtime.spawn(accept_loop(listener, store, collective, signal));

        log::info!("[TT Window] serving on {local_addr}");
        Ok(Self {
            local_addr,
            shutdown,
            runtime: Some(runtime),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 待ち受けを止め、確立済みの接続もすべて閉じる
    pub fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        self.shutdown.send_replace(true);
        // 集団通信の待ちは spawn_blocking 側にあるので猶予を置いて打ち切る
        runtime.shutdown_timeout(SHUTDOWN_GRACE);
        log::info!("[TT Window] stopped serving on {}", self.local_addr);
    }
}

impl Drop for WindowServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    store: Arc<ClusterStore>,
    collective: Option<Arc<Rendezvous>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tokio::spawn(serve_connection(
                    stream,
                    peer,
                    Arc::clone(&store),
                    collective.clone(),
                    shutdown.clone(),
                ));
            }
            Err(e) => log::warn!("[TT Window] accept failed: {e}"),
        }
    }
}

async fn serve_connection(
    mut stream: tokio::net::TcpStream,
    peer: SocketAddr,
    store: Arc<ClusterStore>,
    collective: Option<Arc<Rendezvous>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    loop {
        let request = tokio::select! {
            _ = shutdown.changed() => break,
            request = read_request_async(&mut stream) => request,
        };
        let request = match request {
            Ok(request) => request,
            Err(e) if e.is_disconnect() => break,
            Err(WireError::UnknownOpcode(op)) => {
                log::warn!("[TT Window] {peer} sent unsupported opcode {op:#04x}");
                let _ = stream.write_all(&Reply::Error(ErrorCode::UnsupportedOpcode).encode()).await;
                break;
            }
            Err(e) => {
                log::warn!("[TT Window] dropping connection from {peer}: {e}");
                break;
            }
        };

        let reply = if matches!(request, Request::Reduce { .. }) {
            // 全参加者が揃うまでブロックする
            let store = Arc::clone(&store);
            let collective = collective.clone();
            match tokio::task::spawn_blocking(move || handle_request(request, &store, collective.as_deref())).await {
                Ok(reply) => reply,
                Err(e) => {
                    log::warn!("[TT Merge] reduce for {peer} aborted: {e}");
                    break;
                }
            }
        } else {
            handle_request(request, &store, collective.as_deref())
        };
        if let Err(e) = stream.write_all(&reply.encode()).await {
            log::debug!("[TT Window] reply to {peer} failed: {e}");
            break;
        }
    }
}

fn handle_request(request: Request, store: &ClusterStore, collective: Option<&Rendezvous>) -> Reply {
    match request {
        Request::Get { key } => Reply::Cluster(store.load(store.index_of(key))),
        Request::Put { index, cluster } => {
            let index = index as usize;
            if !store.contains_index(index) {
                return Reply::Error(ErrorCode::IndexOutOfRange);
            }
            store.store(index, &cluster);
            Reply::Ack
        }
        Request::PutBatch { writes } => {
            if writes.iter().any(|(index, _)| !store.contains_index(*index as usize)) {
                return Reply::Error(ErrorCode::IndexOutOfRange);
            }
            for (index, cluster) in &writes {
                store.store(*index as usize, cluster);
            }
            Reply::Ack
        }
        Request::Reduce {
            round,
            rank,
            generation,
            stop,
            clusters,
        } => {
            let Some(collective) = collective else {
                return Reply::Error(ErrorCode::CollectiveUnavailable);
            };
            match collective.all_reduce(round, rank as NodeId, generation, stop, clusters) {
                Ok(Some(clusters)) => Reply::Reduced {
                    stop: false,
                    clusters,
                },
                Ok(None) => Reply::Reduced {
                    stop: true,
                    clusters: Vec::new(),
                },
                Err(e) => {
                    log::warn!("[TT Merge] round {round} for rank {rank} failed: {e}");
                    Reply::Error(ErrorCode::CollectiveUnavailable)
                }
            }
        }
    }
}

/// rank 0 がホストする集団通信への TCP クライアント
pub struct TcpCollective {
    root: SocketAddr,
    timeout: Duration,
    connection: Mutex<Option<TcpStream>>,
}

impl TcpCollective {
    /// 集団通信をホストするノード（rank 0）
    const ROOT: NodeId = 0;

    pub fn new(root: SocketAddr, timeout: Duration) -> Self {
        Self {
            root,
            timeout,
            connection: Mutex::new(None),
        }
    }
}

impl Collective for TcpCollective {
    fn all_reduce(
        &self,
        round: u64,
        rank: NodeId,
        generation: u8,
        stop: bool,
        batch: Vec<Cluster>,
    ) -> TtResult<Option<Vec<Cluster>>> {
        let request = Request::Reduce {
            round,
            rank: rank as u32,
            generation,
            stop,
            clusters: batch,
        };

        let mut connection = self.connection.lock();
        // rank 0 側のタイムアウトより少し長く待つ
        let read_timeout = self.timeout + CONNECT_TIMEOUT;
        let mut stream = match connection.take() {
            Some(stream) => stream,
            None => connect(Self::ROOT, self.root, Some(read_timeout))?,
        };

        let reply = match round_trip(&mut stream, &request) {
            Ok(reply) => reply,
            Err(WireError::Io(e)) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(TtError::CollectiveTimeout { round });
            }
            Err(e) => return Err(e.into_tt_error(Self::ROOT)),
        };
        *connection = Some(stream);

        match reply {
            Reply::Reduced { stop: true, .. } => Ok(None),
            Reply::Reduced { clusters, .. } => Ok(Some(clusters)),
            other => Err(unexpected(Self::ROOT, &other)),
        }
    }
}
