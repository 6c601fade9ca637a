use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

use crate::node::asyncutil::StopSignal;
use crate::node::config::SocketConfig;
use crate::node::dispatch::dispatch;
use crate::node::log::LogType;
use crate::node::protocol::{Frame, Packet, read_frame, write_packet};
use crate::node::registry::NodeContext;

pub const REJECTED: &str = "rejected: address not allowed";

pub async fn bind(cfg: &SocketConfig) -> anyhow::Result<TcpListener> {
    let addr = format!("{}:{}", cfg.bind, cfg.port);
    TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind control socket {addr}: {e}"))
}

/// Accepts peers until shutdown. Only the most recent peer is served; accepting a new one
/// closes the previous connection.
pub async fn run_listener(ctx: Arc<NodeContext>, listener: TcpListener) {
    let cfg = ctx.cfg.socket.clone();
    let active: Mutex<Option<StopSignal>> = Mutex::new(None);
    if let Ok(addr) = listener.local_addr() {
        ctx.log.event(LogType::Socket, None, format!("listening addr={addr}"));
    }

    loop {
        tokio::select! {
            _ = ctx.shutdown.wait() => break,
            r = listener.accept() => {
                let (mut stream, peer) = match r {
                    Ok(v) => v,
                    Err(e) => {
                        ctx.log.event(LogType::Socket, None, format!("accept_error err={e}"));
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        continue;
                    }
                };
                if let Some(allowed) = cfg.allow_ip {
                    if peer.ip().to_canonical() != allowed.to_canonical() {
                        ctx.log.event(LogType::Socket, None, format!("peer={peer} outcome=rejected reason=not_allowed"));
                        if let Err(e) = write_packet(&mut stream, &Packet::new(REJECTED)).await {
                            ctx.log.event(LogType::Socket, None, format!("peer={peer} reject_write_error err={e:#}"));
                        }
                        continue;
                    }
                }
                let stop = StopSignal::new();
                let previous = {
                    let mut g = active.lock().unwrap_or_else(|p| p.into_inner());
                    g.replace(stop.clone())
                };
                if let Some(prev) = previous {
                    prev.fire();
                }
                ctx.log.event(LogType::Socket, None, format!("peer={peer} outcome=connected"));
                let peer_ctx = Arc::clone(&ctx);
                let max = cfg.max_packet_bytes;
                ctx.tasks.spawn(async move {
                    serve_peer(peer_ctx, stream, peer, stop, max).await;
                });
            }
        }
    }
    if let Some(s) = active.lock().unwrap_or_else(|p| p.into_inner()).take() {
        s.fire();
    }
    ctx.log.event(LogType::Socket, None, "listener exit reason=shutting_down");
}

async fn serve_peer(ctx: Arc<NodeContext>, mut stream: TcpStream, peer: SocketAddr, stop: StopSignal, max: usize) {
    let log = |msg: String| ctx.log.event(LogType::Socket, None, format!("peer={peer} {msg}"));
    loop {
        let frame = tokio::select! {
            _ = stop.wait() => {
                log("outcome=closed reason=replaced".to_string());
                return;
            }
            _ = ctx.shutdown.wait() => return,
            f = read_frame(&mut stream, max) => f,
        };
        let packet = match frame {
            Ok(Frame::Packet(p)) => p,
            Ok(Frame::Malformed(e)) => {
                log(format!("packet=dropped reason=malformed err={e:?}"));
                continue;
            }
            Ok(Frame::Closed) => {
                log("outcome=disconnected".to_string());
                return;
            }
            Err(e) => {
                log(format!("outcome=closed reason=read_error err={e:#}"));
                return;
            }
        };
        if !packet.verify() {
            log(format!("packet=dropped reason=hash_mismatch content={:?}", packet.content));
            continue;
        }
        let reply = dispatch(Arc::clone(&ctx), packet.content).await;
        if let Err(e) = write_packet(&mut stream, &Packet::new(reply)).await {
            log(format!("outcome=closed reason=write_error err={e:#}"));
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::asyncutil::TaskTracker;
    use crate::node::config::NodeConfig;
    use crate::node::log::EventLog;
    use crate::node::protocol::Client;

    async fn start(allow_ip: Option<std::net::IpAddr>) -> (tempfile::TempDir, Arc<NodeContext>, SocketAddr) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = NodeConfig::with_root(dir.path());
        cfg.socket.bind = "127.0.0.1".to_string();
        cfg.socket.port = 0;
        cfg.socket.allow_ip = allow_ip;
        let listener = bind(&cfg.socket).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = NodeContext::new(cfg, EventLog::capturing(), TaskTracker::new());
        tokio::spawn(run_listener(Arc::clone(&ctx), listener));
        (dir, ctx, addr)
    }

    #[tokio::test]
    async fn valid_packet_gets_a_reply() {
        let (_dir, ctx, addr) = start(None).await;
        let mut c = Client::connect(addr).await.unwrap();
        assert_eq!(c.call("server create css").await.unwrap(), "created server 0 (css)");
        assert_eq!(ctx.registry.list().len(), 1);
        ctx.shutdown.fire();
    }

    #[tokio::test]
    async fn bad_hash_is_dropped_and_connection_survives() {
        let (_dir, ctx, addr) = start(None).await;
        let mut c = Client::connect(addr).await.unwrap();
        let mut forged = Packet::new("server create css");
        forged.content = "server create rust".to_string();
        c.send(&forged).await.unwrap();
        assert_eq!(c.call("server list").await.unwrap(), "no servers");
        assert!(ctx.log.captured().iter().any(|l| l.contains("hash_mismatch")));
        ctx.shutdown.fire();
    }

    #[tokio::test]
    async fn newer_peer_replaces_older_one() {
        let (_dir, ctx, addr) = start(None).await;
        let mut first = Client::connect(addr).await.unwrap();
        assert!(first.call("help").await.is_ok());
        let mut second = Client::connect(addr).await.unwrap();
        assert!(second.call("version").await.is_ok());
        let closed = tokio::time::timeout(Duration::from_secs(2), first.recv()).await.unwrap();
        assert!(matches!(closed, Ok(None)));
        ctx.shutdown.fire();
    }

    #[tokio::test]
    async fn disallowed_peer_gets_rejection_then_eof() {
        let (_dir, ctx, addr) = start(Some("10.9.8.7".parse().unwrap())).await;
        let mut c = Client::connect(addr).await.unwrap();
        let p = c.recv().await.unwrap().unwrap();
        assert!(p.verify());
        assert_eq!(p.content, REJECTED);
        assert!(c.recv().await.unwrap().is_none());
        ctx.shutdown.fire();
    }
}
