#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mc_server_indexer::dns::{DnsCache, ReverseResolver};
use mc_server_indexer::protocol::{read_varint, write_varint};
use mc_server_indexer::store::ResultStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Resolver for tests: no address has a PTR record.
pub struct NoPtr;

impl ReverseResolver for NoPtr {
    fn reverse(&self, _ip: Ipv4Addr) -> impl Future<Output = io::Result<Vec<String>>> + Send {
        async { Err(io::Error::new(io::ErrorKind::NotFound, "no PTR")) }
    }
}

pub async fn open_store(dir: &Path) -> ResultStore {
    ResultStore::open(dir.join("servers.json"), DnsCache::spawn(NoPtr))
        .await
        .expect("open store")
}

pub fn status_frame(json: &str) -> Vec<u8> {
    let mut body = Vec::new();
    write_varint(&mut body, 0);
    write_varint(&mut body, json.len() as i32);
    body.extend_from_slice(json.as_bytes());
    let mut frame = Vec::new();
    write_varint(&mut frame, body.len() as i32);
    frame.extend_from_slice(&body);
    frame
}

/// Read the client's handshake frame plus the two-byte status request.
async fn read_request(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        if let Ok((len, header)) = read_varint(&buf) {
            if buf.len() >= header + len as usize + 2 {
                return Ok(buf);
            }
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// What a fake server sends back once the request has arrived.
#[derive(Clone)]
pub enum Reply {
    /// A status frame, written in `pieces` separate writes.
    Status { json: String, pieces: usize },
    Raw(Vec<u8>),
    Silent,
}

/// A local server speaking just enough of the status protocol.
pub struct FakeServer {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

pub async fn spawn_server(reply: Reply) -> FakeServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            let reply = reply.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                let Ok(request) = read_request(&mut stream).await else { return };
                seen.lock().unwrap().push(request);
                match reply {
                    Reply::Status { json, pieces } => {
                        let frame = status_frame(&json);
                        let step = frame.len().div_ceil(pieces.max(1));
                        for piece in frame.chunks(step) {
                            if stream.write_all(piece).await.is_err() {
                                return;
                            }
                            let _ = stream.flush().await;
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                    }
                    Reply::Raw(bytes) => {
                        let _ = stream.write_all(&bytes).await;
                    }
                    Reply::Silent => {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                }
            });
        }
    });
    FakeServer { addr, requests }
}

/// Write an executable shell script standing in for masscan.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
