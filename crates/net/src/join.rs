//! The join handshake.
//!
//! A joining node connects over TCP to any member, sends one
//! [`JoinRequest`](junta_proto::join::JoinRequest) frame and reads one
//! [`JoinResponse`](junta_proto::join::JoinResponse) frame back. Frames are
//! a big-endian `u32` length followed by the protobuf bytes.

use junta_common::NodeId;
use junta_proto::join as pb;
use prost::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;

/// Largest frame either side accepts. Snapshots travel in one frame.
pub const MAX_FRAME: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("join I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("undecodable join frame: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("join frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("invalid join request: {0}")]
    Invalid(String),
    #[error("join refused: {0}")]
    Refused(String),
    #[error("join timed out")]
    Timeout,
}

/// A node asking to become a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub id: NodeId,
    /// Peer address the joiner receives consensus traffic on.
    pub addr: SocketAddr,
    pub cluster: String,
}

/// What a member hands back: the store as of `seqn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGrant {
    pub seqn: u64,
    pub snapshot: Vec<u8>,
}

/// The accepting side of the handshake, implemented by the node.
#[async_trait::async_trait]
pub trait JoinHandler: Send + Sync + 'static {
    async fn handle_join(&self, request: JoinRequest) -> Result<JoinGrant, String>;
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, msg: &impl Message) -> Result<(), JoinError> {
    let bytes = msg.encode_to_vec();
    if bytes.len() > MAX_FRAME {
        return Err(JoinError::FrameTooLarge(bytes.len()));
    }
    w.write_u32(bytes.len() as u32).await?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin, M: Message + Default>(r: &mut R) -> Result<M, JoinError> {
    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME {
        return Err(JoinError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(M::decode(buf.as_slice())?)
}

fn request_from_proto(proto: pb::JoinRequest) -> Result<JoinRequest, JoinError> {
    let id = NodeId::from_slice(&proto.id).map_err(|e| JoinError::Invalid(e.to_string()))?;
    let addr: SocketAddr = proto
        .addr
        .parse()
        .map_err(|e| JoinError::Invalid(format!("address {:?}: {}", proto.addr, e)))?;
    Ok(JoinRequest {
        id,
        addr,
        cluster: proto.cluster,
    })
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Accept join connections until the listener fails.
pub async fn serve<H: JoinHandler>(listener: TcpListener, handler: Arc<H>) -> std::io::Result<()> {
    tracing::info!("join endpoint listening on {}", listener.local_addr()?);
    loop {
        let (stream, remote) = listener.accept().await?;
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_one(stream, handler.as_ref()).await {
                tracing::warn!("join from {} failed: {}", remote, e);
            }
        });
    }
}

async fn serve_one<H: JoinHandler>(mut stream: TcpStream, handler: &H) -> Result<(), JoinError> {
    let proto: pb::JoinRequest = read_frame(&mut stream).await?;
    let response = match request_from_proto(proto) {
        Ok(request) => {
            tracing::info!("join request from {} at {}", request.id, request.addr);
            match handler.handle_join(request).await {
                Ok(grant) => pb::JoinResponse {
                    seqn: grant.seqn,
                    snapshot: grant.snapshot,
                    error: String::new(),
                },
                Err(reason) => pb::JoinResponse {
                    error: reason,
                    ..Default::default()
                },
            }
        }
        Err(e) => pb::JoinResponse {
            error: e.to_string(),
            ..Default::default()
        },
    };
    write_frame(&mut stream, &response).await
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Ask the member at `attach` to admit us.
pub async fn request(
    attach: SocketAddr,
    req: &JoinRequest,
    timeout: Duration,
) -> Result<JoinGrant, JoinError> {
    tokio::time::timeout(timeout, exchange(attach, req))
        .await
        .map_err(|_| JoinError::Timeout)?
}

async fn exchange(attach: SocketAddr, req: &JoinRequest) -> Result<JoinGrant, JoinError> {
    let mut stream = TcpStream::connect(attach).await?;
    let proto = pb::JoinRequest {
        id: req.id.as_bytes().to_vec(),
        addr: req.addr.to_string(),
        cluster: req.cluster.clone(),
    };
    write_frame(&mut stream, &proto).await?;
    let resp: pb::JoinResponse = read_frame(&mut stream).await?;
    if !resp.error.is_empty() {
        return Err(JoinError::Refused(resp.error));
    }
    Ok(JoinGrant {
        seqn: resp.seqn,
        snapshot: resp.snapshot,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait::async_trait]
    impl JoinHandler for Fixed {
        async fn handle_join(&self, request: JoinRequest) -> Result<JoinGrant, String> {
            if request.cluster != "test" {
                return Err(format!("wrong cluster {:?}", request.cluster));
            }
            Ok(JoinGrant {
                seqn: 42,
                snapshot: request.id.as_bytes().to_vec(),
            })
        }
    }

    async fn start() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::new(Fixed)));
        addr
    }

    fn req(cluster: &str) -> JoinRequest {
        JoinRequest {
            id: NodeId::from_bytes([5; 20]),
            addr: "127.0.0.1:8046".parse().unwrap(),
            cluster: cluster.into(),
        }
    }

    #[tokio::test]
    async fn test_join_granted() {
        let addr = start().await;
        let grant = request(addr, &req("test"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(grant.seqn, 42);
        assert_eq!(grant.snapshot, vec![5; 20]);
    }

    #[tokio::test]
    async fn test_join_refused() {
        let addr = start().await;
        let err = request(addr, &req("other"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, JoinError::Refused(ref r) if r.contains("other")));
    }

    #[tokio::test]
    async fn test_malformed_request_is_answered() {
        let addr = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let bad = pb::JoinRequest {
            id: vec![1, 2],
            addr: "nowhere".into(),
            cluster: "test".into(),
        };
        write_frame(&mut stream, &bad).await.unwrap();
        let resp: pb::JoinResponse = read_frame(&mut stream).await.unwrap();
        assert!(resp.error.contains("invalid join request"));
    }

    #[tokio::test]
    async fn test_oversize_frame_is_refused() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME + 1) as u32).await.unwrap();
        let res: Result<pb::JoinResponse, _> = read_frame(&mut b).await;
        assert!(matches!(res, Err(JoinError::FrameTooLarge(_))));
    }
}
