//! Memcached-backed implementation of [`Cache`].
//!
//! Speaks the text protocol over one pooled connection per server. Keys are
//! placed with rendezvous hashing so most keys stay on the same server when
//! the resolved address set changes. Server addresses are periodically
//! re-resolved through DNS to follow service discovery.

use super::{Cache, CacheError};
use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const OP_TIMEOUT: Duration = Duration::from_secs(1);

struct Node {
    addr: SocketAddr,
    conn: tokio::sync::Mutex<Option<BufStream<TcpStream>>>,
}

impl Node {
    fn new(addr: SocketAddr) -> Arc<Self> {
        Arc::new(Node {
            addr,
            conn: tokio::sync::Mutex::new(None),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut guard = self.conn.lock().await;
        let result = tokio::time::timeout(OP_TIMEOUT, Self::get_inner(&mut guard, self.addr, key))
            .await
            .unwrap_or(Err(CacheError::Timeout));
        if result.is_err() {
            // The connection may be mid-response; never reuse it.
            *guard = None;
        }
        result
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut guard = self.conn.lock().await;
        let result = tokio::time::timeout(
            OP_TIMEOUT,
            Self::set_inner(&mut guard, self.addr, key, value, ttl),
        )
        .await
        .unwrap_or(Err(CacheError::Timeout));
        if result.is_err() {
            *guard = None;
        }
        result
    }

    async fn ensure_conn<'a>(
        guard: &'a mut Option<BufStream<TcpStream>>,
        addr: SocketAddr,
    ) -> Result<&'a mut BufStream<TcpStream>, CacheError> {
        if guard.is_none() {
            let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| CacheError::Timeout)??;
            *guard = Some(BufStream::new(stream));
        }
        guard.as_mut().ok_or(CacheError::NoServers)
    }

    async fn get_inner(
        guard: &mut Option<BufStream<TcpStream>>,
        addr: SocketAddr,
        key: &str,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let conn = Self::ensure_conn(guard, addr).await?;
        conn.write_all(format!("get {key}\r\n").as_bytes()).await?;
        conn.flush().await?;

        let mut line = String::new();
        conn.read_line(&mut line).await?;
        let header = line.trim_end();

        if header == "END" {
            return Ok(None);
        }
        let Some(rest) = header.strip_prefix("VALUE ") else {
            return Err(CacheError::Protocol(header.to_string()));
        };
        let length: usize = rest
            .rsplit(' ')
            .next()
            .and_then(|len| len.parse().ok())
            .ok_or_else(|| CacheError::Protocol(header.to_string()))?;

        // data block plus trailing \r\n
        let mut data = vec![0u8; length + 2];
        conn.read_exact(&mut data).await?;
        data.truncate(length);

        let mut end = String::new();
        conn.read_line(&mut end).await?;
        if end.trim_end() != "END" {
            return Err(CacheError::Protocol(end.trim_end().to_string()));
        }
        Ok(Some(data))
    }

    async fn set_inner(
        guard: &mut Option<BufStream<TcpStream>>,
        addr: SocketAddr,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let conn = Self::ensure_conn(guard, addr).await?;
        conn.write_all(format!("set {key} 0 {} {}\r\n", ttl.as_secs(), value.len()).as_bytes())
            .await?;
        conn.write_all(value).await?;
        conn.write_all(b"\r\n").await?;
        conn.flush().await?;

        let mut line = String::new();
        conn.read_line(&mut line).await?;
        match line.trim_end() {
            "STORED" => Ok(()),
            other => Err(CacheError::Protocol(other.to_string())),
        }
    }
}

pub struct MemcachedCache {
    nodes: Arc<RwLock<Vec<Arc<Node>>>>,
}

impl MemcachedCache {
    /// Resolves the configured addresses once up front and, when `interval`
    /// is non-zero, keeps re-resolving them in the background.
    pub async fn connect(servers: Vec<String>, interval: Duration) -> Result<Self, CacheError> {
        let initial = resolve_nodes(&servers, &[]).await?;
        if initial.is_empty() {
            return Err(CacheError::NoServers);
        }
        let nodes = Arc::new(RwLock::new(initial));

        if !interval.is_zero() {
            let nodes = Arc::clone(&nodes);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let current = nodes.read().clone();
                    match resolve_nodes(&servers, &current).await {
                        Ok(next) if !next.is_empty() => *nodes.write() = next,
                        Ok(_) => tracing::warn!(
                            "cache DNS resolution returned no addresses, keeping previous set"
                        ),
                        Err(error) => tracing::warn!(
                            %error,
                            "cache DNS resolution failed, keeping previous set"
                        ),
                    }
                }
            });
        }

        Ok(MemcachedCache { nodes })
    }

    fn pick(&self, key: &str) -> Option<Arc<Node>> {
        let nodes = self.nodes.read();
        nodes
            .iter()
            .max_by_key(|node| node_weight(node.addr, key))
            .cloned()
    }
}

#[async_trait]
impl Cache for MemcachedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let node = self.pick(key).ok_or(CacheError::NoServers)?;
        node.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let node = self.pick(key).ok_or(CacheError::NoServers)?;
        node.set(key, value, ttl).await
    }
}

fn node_weight(addr: SocketAddr, key: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(addr.to_string().as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

async fn resolve_nodes(
    servers: &[String],
    current: &[Arc<Node>],
) -> Result<Vec<Arc<Node>>, CacheError> {
    let mut addrs = Vec::new();
    for server in servers {
        for addr in tokio::net::lookup_host(server.as_str()).await? {
            addrs.push(addr);
        }
    }
    addrs.sort();
    addrs.dedup();

    // Reuse existing nodes so their pooled connections survive a refresh.
    Ok(addrs
        .into_iter()
        .map(|addr| {
            current
                .iter()
                .find(|node| node.addr == addr)
                .cloned()
                .unwrap_or_else(|| Node::new(addr))
        })
        .collect())
}
