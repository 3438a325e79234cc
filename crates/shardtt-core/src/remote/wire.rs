//! リモートメッセージのワイヤフォーマット（バージョン1、リトルエンディアン）
//!
//! ヘッダ（4バイト）:
//!
//! ```text
//! Offset  Size  Field
//! 0       2     magic "TT"
//! 2       1     version (= LAYOUT_VERSION)
//! 3       1     opcode
//! ```
//!
//! | opcode | 向き | ペイロード |
//! |--------|------|------------|
//! | 0x01 GET       | 要求 | key u64 |
//! | 0x02 PUT       | 要求 | index u64, cluster |
//! | 0x03 PUT_BATCH | 要求 | count u32, count × (index u64, cluster) |
//! | 0x04 REDUCE    | 要求 | round u64, rank u32, generation u8, stop u8, count u32, count × cluster |
//! | 0x81 CLUSTER   | 応答 | cluster |
//! | 0x82 ACK       | 応答 | なし |
//! | 0x84 REDUCED   | 応答 | stop u8, count u32, count × cluster |
//! | 0xFF ERROR     | 応答 | code u8 |
//!
//! cluster はメモリ上と同じ32バイトの固定レイアウト（`tt::Cluster::to_bytes`）。

use crate::error::TtError;
use crate::partition::NodeId;
use crate::tt::{CLUSTER_BYTES, Cluster, LAYOUT_VERSION};
use std::io::{self, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt};

/// フレームの先頭2バイト
pub const MAGIC: [u8; 2] = *b"TT";

/// ヘッダのバイト幅
pub const HEADER_BYTES: usize = 4;

/// 1フレームに載せられるクラスター数の上限
pub const MAX_CLUSTERS_PER_FRAME: u32 = 1 << 20;

/// オペコード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x01,
    Put = 0x02,
    PutBatch = 0x03,
    Reduce = 0x04,
    Cluster = 0x81,
    Ack = 0x82,
    Reduced = 0x84,
    Error = 0xFF,
}

impl TryFrom<u8> for Opcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(Opcode::Get),
            0x02 => Ok(Opcode::Put),
            0x03 => Ok(Opcode::PutBatch),
            0x04 => Ok(Opcode::Reduce),
            0x81 => Ok(Opcode::Cluster),
            0x82 => Ok(Opcode::Ack),
            0x84 => Ok(Opcode::Reduced),
            0xFF => Ok(Opcode::Error),
            _ => Err(WireError::UnknownOpcode(value)),
        }
    }
}

/// ERROR フレームのコード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// インデックスが相手ノードのクラスター数を超えている
    IndexOutOfRange = 1,
    /// 相手ノードが扱わないオペコード
    UnsupportedOpcode = 2,
    /// 相手ノードは集団通信をホストしていない
    CollectiveUnavailable = 3,
}

impl TryFrom<u8> for ErrorCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(ErrorCode::IndexOutOfRange),
            2 => Ok(ErrorCode::UnsupportedOpcode),
            3 => Ok(ErrorCode::CollectiveUnavailable),
            _ => Err(WireError::UnknownErrorCode(value)),
        }
    }
}

impl ErrorCode {
    pub fn describe(self) -> &'static str {
        match self {
            ErrorCode::IndexOutOfRange => "cluster index out of range",
            ErrorCode::UnsupportedOpcode => "unsupported opcode",
            ErrorCode::CollectiveUnavailable => "collective not hosted by this node",
        }
    }
}

/// フレームの読み書きで起きるエラー
#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("unsupported wire version {0}")]
    BadVersion(u8),

    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("opcode {0:?} is not valid here")]
    UnexpectedOpcode(Opcode),

    #[error("frame carries {0} clusters (limit {MAX_CLUSTERS_PER_FRAME})")]
    TooLarge(u32),

    #[error("unknown error code {0}")]
    UnknownErrorCode(u8),
}

impl WireError {
    /// 相手側ノードのエラーとして `TtError` に変換する
    ///
    /// 途中で切れたフレームは応答の形式違反、それ以外の I/O エラーは到達不能。
    pub fn into_tt_error(self, node: NodeId) -> TtError {
        match self {
            WireError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => TtError::MalformedReply {
                node,
                detail: "short read".to_string(),
            },
            WireError::Io(e) => TtError::Unreachable {
                node,
                reason: e.to_string(),
            },
            other => TtError::MalformedReply {
                node,
                detail: other.to_string(),
            },
        }
    }

    /// 接続が切れただけか（フレーム境界での EOF やリセット）
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            WireError::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
            )
        )
    }
}

/// 要求フレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Get {
        key: u64,
    },
    Put {
        index: u64,
        cluster: Cluster,
    },
    PutBatch {
        writes: Vec<(u64, Cluster)>,
    },
    Reduce {
        round: u64,
        rank: u32,
        generation: u8,
        stop: bool,
        clusters: Vec<Cluster>,
    },
}

/// 応答フレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Cluster(Cluster),
    Ack,
    Reduced { stop: bool, clusters: Vec<Cluster> },
    Error(ErrorCode),
}

fn header(buf: &mut Vec<u8>, opcode: Opcode) {
    buf.extend_from_slice(&MAGIC);
    buf.push(LAYOUT_VERSION);
    buf.push(opcode as u8);
}

fn put_count(buf: &mut Vec<u8>, count: usize) {
    buf.extend_from_slice(&(count as u32).to_le_bytes());
}

fn put_cluster(buf: &mut Vec<u8>, cluster: &Cluster) {
    buf.extend_from_slice(&cluster.to_bytes());
}

fn read_array<const N: usize>(r: &mut impl Read) -> Result<[u8; N], WireError> {
    let mut bytes = [0u8; N];
    r.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_u8(r: &mut impl Read) -> Result<u8, WireError> {
    Ok(read_array::<1>(r)?[0])
}

fn read_u32(r: &mut impl Read) -> Result<u32, WireError> {
    Ok(u32::from_le_bytes(read_array(r)?))
}

fn read_u64(r: &mut impl Read) -> Result<u64, WireError> {
    Ok(u64::from_le_bytes(read_array(r)?))
}

fn read_cluster(r: &mut impl Read) -> Result<Cluster, WireError> {
    Ok(Cluster::from_bytes(&read_array::<CLUSTER_BYTES>(r)?))
}

fn read_count(r: &mut impl Read) -> Result<usize, WireError> {
    let count = read_u32(r)?;
    if count > MAX_CLUSTERS_PER_FRAME {
        return Err(WireError::TooLarge(count));
    }
    Ok(count as usize)
}

fn read_clusters(r: &mut impl Read) -> Result<Vec<Cluster>, WireError> {
    let count = read_count(r)?;
    (0..count).map(|_| read_cluster(r)).collect()
}

/// ヘッダを読んで検証し、オペコードを返す
fn read_header(r: &mut impl Read) -> Result<Opcode, WireError> {
    let bytes = read_array::<HEADER_BYTES>(r)?;
    if bytes[..2] != MAGIC {
        return Err(WireError::BadMagic([bytes[0], bytes[1]]));
    }
    if bytes[2] != LAYOUT_VERSION {
        return Err(WireError::BadVersion(bytes[2]));
    }
    Opcode::try_from(bytes[3])
}

impl Request {
    /// フレームをバイト列にする
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_BYTES + 8 + CLUSTER_BYTES);
        match self {
            Request::Get { key } => {
                header(&mut buf, Opcode::Get);
                buf.extend_from_slice(&key.to_le_bytes());
            }
            Request::Put { index, cluster } => {
                header(&mut buf, Opcode::Put);
                buf.extend_from_slice(&index.to_le_bytes());
                put_cluster(&mut buf, cluster);
            }
            Request::PutBatch { writes } => {
                header(&mut buf, Opcode::PutBatch);
                put_count(&mut buf, writes.len());
                for (index, cluster) in writes {
                    buf.extend_from_slice(&index.to_le_bytes());
                    put_cluster(&mut buf, cluster);
                }
            }
            Request::Reduce {
                round,
                rank,
                generation,
                stop,
                clusters,
            } => {
                header(&mut buf, Opcode::Reduce);
                buf.extend_from_slice(&round.to_le_bytes());
                buf.extend_from_slice(&rank.to_le_bytes());
                buf.push(*generation);
                buf.push(u8::from(*stop));
                put_count(&mut buf, clusters.len());
                for cluster in clusters {
                    put_cluster(&mut buf, cluster);
                }
            }
        }
        buf
    }

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&self.encode())?;
        w.flush()
    }

    pub fn read_from(r: &mut impl Read) -> Result<Self, WireError> {
        match read_header(r)? {
            Opcode::Get => Ok(Request::Get { key: read_u64(r)? }),
            Opcode::Put => Ok(Request::Put {
                index: read_u64(r)?,
                cluster: read_cluster(r)?,
            }),
            Opcode::PutBatch => {
                let count = read_count(r)?;
                let writes = (0..count)
                    .map(|_| Ok((read_u64(r)?, read_cluster(r)?)))
                    .collect::<Result<Vec<_>, WireError>>()?;
                Ok(Request::PutBatch { writes })
            }
            Opcode::Reduce => Ok(Request::Reduce {
                round: read_u64(r)?,
                rank: read_u32(r)?,
                generation: read_u8(r)?,
                stop: read_u8(r)? != 0,
                clusters: read_clusters(r)?,
            }),
            other => Err(WireError::UnexpectedOpcode(other)),
        }
    }
}

/// 要求フレームを1つ非同期に読む
///
/// 固定長部分から残りの長さを求めてフレーム全体をバッファし、
/// `Request::read_from` でデコードする。
pub async fn read_request_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<Request, WireError> {
    let mut frame = Vec::with_capacity(HEADER_BYTES + 8 + CLUSTER_BYTES);
    read_more(r, &mut frame, HEADER_BYTES).await?;
    // (固定部, 末尾 count 1件あたりのバイト数)
    let (fixed, per_item) = match read_header(&mut &frame[..])? {
        Opcode::Get => (8, None),
        Opcode::Put => (8 + CLUSTER_BYTES, None),
        Opcode::PutBatch => (4, Some(8 + CLUSTER_BYTES)),
        Opcode::Reduce => (8 + 4 + 1 + 1 + 4, Some(CLUSTER_BYTES)),
        other => return Err(WireError::UnexpectedOpcode(other)),
    };
    read_more(r, &mut frame, fixed).await?;
    if let Some(item) = per_item {
        let count = read_count(&mut &frame[frame.len() - 4..])?;
        read_more(r, &mut frame, count * item).await?;
    }
    Request::read_from(&mut &frame[..])
}

async fn read_more<R: AsyncRead + Unpin>(r: &mut R, frame: &mut Vec<u8>, len: usize) -> io::Result<()> {
    let start = frame.len();
    frame.resize(start + len, 0);
    r.read_exact(&mut frame[start..]).await?;
    Ok(())
}

impl Reply {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_BYTES + CLUSTER_BYTES);
        match self {
            Reply::Cluster(cluster) => {
                header(&mut buf, Opcode::Cluster);
                put_cluster(&mut buf, cluster);
            }
            Reply::Ack => header(&mut buf, Opcode::Ack),
            Reply::Reduced { stop, clusters } => {
                header(&mut buf, Opcode::Reduced);
                buf.push(u8::from(*stop));
                put_count(&mut buf, clusters.len());
                for cluster in clusters {
                    put_cluster(&mut buf, cluster);
                }
            }
            Reply::Error(code) => {
                header(&mut buf, Opcode::Error);
                buf.push(*code as u8);
            }
        }
        buf
    }

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&self.encode())?;
        w.flush()
    }

    pub fn read_from(r: &mut impl Read) -> Result<Self, WireError> {
        match read_header(r)? {
            Opcode::Cluster => Ok(Reply::Cluster(read_cluster(r)?)),
            Opcode::Ack => Ok(Reply::Ack),
            Opcode::Reduced => Ok(Reply::Reduced {
                stop: read_u8(r)? != 0,
                clusters: read_clusters(r)?,
            }),
            Opcode::Error => Ok(Reply::Error(ErrorCode::try_from(read_u8(r)?)?)),
            other => Err(WireError::UnexpectedOpcode(other)),
        }
    }
}
