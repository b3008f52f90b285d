use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use anvil_core::cache::{Cache, CacheMatch, DepState};
use anvil_core::digest::Crc;
use anvil_core::exec::ExecHost;
use anvil_core::protocol::{
    recv_msg, send_msg, CacheRpcProc, CacheRpcReply, CacheRpcReq, JobEndRpcReq, JobMngtRpcReq,
    JobStartRpcReq, MsgBuf, CACHE_MAGIC,
};
use anvil_core::types::{Accesses, CacheHitInfo};
use anvil_core::Engine;

// ─── Job RPC services ─────────────────────────────────────────

/// Serve the three job channels: start (request/reply), mngt
/// (request/reply stream) and end (fire-and-forget).
pub async fn serve_jobs(
    engine: Arc<Engine>,
    start: TcpListener,
    mngt: TcpListener,
    end: TcpListener,
) {
    let e1 = engine.clone();
    let t1 = tokio::spawn(async move {
        loop {
            let Ok((sock, peer)) = start.accept().await else { break };
            tracing::debug!(%peer, "job start connection");
            let engine = e1.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_start(engine, sock).await {
                    tracing::warn!("job start connection failed: {e:#}");
                }
            });
        }
    });
    let e2 = engine.clone();
    let t2 = tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = mngt.accept().await else { break };
            let engine = e2.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_mngt(engine, sock).await {
                    tracing::warn!("job mngt connection failed: {e:#}");
                }
            });
        }
    });
    let t3 = tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = end.accept().await else { break };
            let engine = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_end(engine, sock).await {
                    tracing::warn!("job end connection failed: {e:#}");
                }
            });
        }
    });
    let _ = tokio::join!(t1, t2, t3);
}

async fn handle_start(engine: Arc<Engine>, mut sock: TcpStream) -> Result<()> {
    let mut buf = MsgBuf::new(None);
    while let Some(req) = recv_msg::<JobStartRpcReq, _>(&mut sock, &mut buf).await? {
        match engine.job_start(req).await {
            Some(reply) => send_msg(&mut sock, &reply, None).await?,
            None => break, // job was killed: closing is the answer
        }
    }
    Ok(())
}

async fn handle_mngt(engine: Arc<Engine>, mut sock: TcpStream) -> Result<()> {
    let mut buf = MsgBuf::new(None);
    while let Some(req) = recv_msg::<JobMngtRpcReq, _>(&mut sock, &mut buf).await? {
        let reply = engine.job_mngt(req).await;
        send_msg(&mut sock, &reply, None).await?;
    }
    Ok(())
}

async fn handle_end(engine: Arc<Engine>, mut sock: TcpStream) -> Result<()> {
    let mut buf = MsgBuf::new(None);
    while let Some(end) = recv_msg::<JobEndRpcReq, _>(&mut sock, &mut buf).await? {
        engine.job_end(end).await;
    }
    Ok(())
}

// ─── Cache RPC service ────────────────────────────────────────

/// Serve the single-purpose cache protocol over one listener. Every
/// connection must lead with the magic sanity constant.
pub async fn serve_cache(cache: Arc<dyn Cache>, listener: TcpListener) {
    let conn_ids = Arc::new(AtomicU32::new(1));
    loop {
        let Ok((sock, peer)) = listener.accept().await else { break };
        tracing::debug!(%peer, "cache connection");
        let cache = cache.clone();
        let conn_ids = conn_ids.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_cache(cache, conn_ids, sock).await {
                tracing::warn!("cache connection failed: {e:#}");
            }
        });
    }
}

async fn handle_cache(cache: Arc<dyn Cache>, conn_ids: Arc<AtomicU32>, mut sock: TcpStream) -> Result<()> {
    let mut magic = [0u8; 8];
    sock.read_exact(&mut magic).await.context("cannot read magic")?;
    if u64::from_le_bytes(magic) != CACHE_MAGIC {
        tracing::warn!("cache client with bad magic, dropping");
        return Ok(()); // not for us, pretend closed
    }
    let mut buf = MsgBuf::new(None);
    // a pending upload expects the next frame to be the blob bytes
    let mut pending_blob: Option<u128> = None;
    loop {
        if let Some(key) = pending_blob.take() {
            let Some(bytes) = recv_msg::<Vec<u8>, _>(&mut sock, &mut buf).await? else { break };
            cache.sub_stream(key, &bytes)?;
            continue;
        }
        let Some(req) = recv_msg::<CacheRpcReq, _>(&mut sock, &mut buf).await? else { break };
        let mut reply = CacheRpcReply { proc: req.proc, ..Default::default() };
        match req.proc {
            CacheRpcProc::None => {}
            CacheRpcProc::Config => {
                reply.config = cache.config();
                reply.conn_id = conn_ids.fetch_add(1, Ordering::Relaxed);
            }
            CacheRpcProc::Download => {
                let verdict = match_against(&cache, &req)?;
                match verdict {
                    CacheMatch::Hit { run } => {
                        let (job_info, target_data) = cache.sub_download(&req.job, &run)?;
                        reply.hit_info = CacheHitInfo::Hit;
                        reply.job_info = Some(job_info);
                        reply.target_data = target_data;
                    }
                    CacheMatch::Match { new_deps } => {
                        reply.hit_info = CacheHitInfo::Match;
                        reply.new_deps = new_deps;
                    }
                    CacheMatch::Miss => reply.hit_info = CacheHitInfo::Miss,
                }
            }
            CacheRpcProc::Upload => match cache.sub_upload(req.reserved_sz) {
                Ok(key) => {
                    reply.upload_key = key;
                    pending_blob = Some(key);
                }
                Err(e) => {
                    reply.upload_key = 0;
                    reply.msg = e.to_string();
                }
            },
            CacheRpcProc::Commit => {
                if let Err(e) = cache.sub_commit(req.upload_key, &req.job, req.exe_time) {
                    tracing::warn!(job = %req.job, "commit failed: {e}");
                    let _ = cache.sub_dismiss(req.upload_key);
                }
            }
            CacheRpcProc::Dismiss => {
                cache.sub_dismiss(req.upload_key)?;
            }
        }
        send_msg(&mut sock, &reply, None).await?;
    }
    Ok(())
}

/// Judge candidate deps against the crcs the client sent: listed = done
/// with that crc, unlisted = not yet built in the client's repo.
fn match_against(cache: &Arc<dyn Cache>, req: &CacheRpcReq) -> Result<CacheMatch> {
    let known: std::collections::HashMap<&str, Crc> = req
        .repo_deps
        .iter()
        .filter_map(|(dn, dd)| dd.info.crc().map(|c| (dn.as_str(), c)))
        .collect();
    cache.sub_match(&req.job, &|dn, dd| match known.get(dn) {
        None => DepState::NotDone,
        Some(crc) => match dd.info.crc() {
            Some(c) if c.matches(*crc, Accesses::FULL) => DepState::Match,
            _ => DepState::Mismatch,
        },
    })
}

/// Client helper: open a cache connection, leading with the magic.
pub async fn cache_connect(addr: &str) -> Result<TcpStream> {
    let mut sock = TcpStream::connect(addr).await?;
    sock.write_all(&CACHE_MAGIC.to_le_bytes()).await?;
    Ok(sock)
}

pub async fn cache_call(sock: &mut TcpStream, buf: &mut MsgBuf, req: &CacheRpcReq) -> Result<CacheRpcReply> {
    send_msg(sock, req, None).await?;
    recv_msg(sock, buf).await?.context("cache server closed the connection")
}
