use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use warden_proto::command::{Priority, Reply};

use crate::queue::{Command, CommandSender, QueueError};

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/umuas_socket";
pub const DEFAULT_MAX_FRAME: usize = 1024;
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Replies buffered per client before its reader stops taking frames.
const REPLY_BUFFER: usize = 16;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub max_frame: usize,
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            max_frame: DEFAULT_MAX_FRAME,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bind {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0} exists and is not a unix socket")]
    NotASocket(PathBuf),
}

/// Local command socket. Each client gets a reader feeding the shared queue
/// and a writer sending one reply line per command.
pub struct CommandServer {
    listener: UnixListener,
    path: PathBuf,
    inode: Option<(u64, u64)>,
    max_frame: usize,
    queue: CommandSender,
    next_client: Arc<AtomicU64>,
}

impl CommandServer {
    /// Binds the socket, removing a stale socket left at the path. Any other
    /// kind of file there is left alone and the bind fails.
    pub fn bind(config: &ServerConfig, queue: CommandSender) -> Result<Self, ServerError> {
        let path = config.socket_path.clone();
        remove_stale(&path)?;
        let listener = UnixListener::bind(&path).map_err(|source| ServerError::Bind { path: path.clone(), source })?;
        let inode = std::fs::symlink_metadata(&path).ok().map(|m| (m.dev(), m.ino()));
        info!(?path, "command socket listening");
        Ok(Self {
            listener,
            path,
            inode,
            max_frame: config.max_frame.max(1),
            queue,
            next_client: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts clients until the task is dropped.
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let id = self.next_client.fetch_add(1, Ordering::Relaxed);
                    info!(client = id, "command client connected");
                    tokio::spawn(client(id, stream, self.max_frame, self.queue.clone()));
                }
                Err(e) => {
                    warn!("command socket accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        let Some((dev, ino)) = self.inode else { return };
        if let Ok(m) = std::fs::symlink_metadata(&self.path) {
            // only remove the socket we created
            if m.file_type().is_socket() && m.dev() == dev && m.ino() == ino {
                debug!(path = ?self.path, "removing command socket");
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }
}

fn remove_stale(path: &Path) -> Result<(), ServerError> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => return Err(ServerError::Bind { path: path.to_path_buf(), source }),
    };
    if !meta.file_type().is_socket() {
        return Err(ServerError::NotASocket(path.to_path_buf()));
    }
    debug!(?path, "removing stale command socket");
    std::fs::remove_file(path).map_err(|source| ServerError::Bind { path: path.to_path_buf(), source })
}

async fn client(id: u64, stream: UnixStream, max_frame: usize, queue: CommandSender) {
    let (rd, wr) = stream.into_split();
    let (reply_tx, reply_rx) = mpsc::channel(REPLY_BUFFER);
    let writer = tokio::spawn(write_replies(id, wr, reply_rx));
    read_frames(id, rd, max_frame, &queue, reply_tx).await;
    // the writer ends once every queued command from this client has been answered
    if let Err(e) = writer.await {
        warn!(client = id, "reply writer failed: {}", e);
    }
    info!(client = id, "command client disconnected");
}

async fn read_frames(id: u64, mut rd: OwnedReadHalf, max_frame: usize, queue: &CommandSender, replies: mpsc::Sender<Reply>) {
    let mut buf = vec![0u8; max_frame];
    loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                warn!(client = id, "command socket read failed: {}", e);
                return;
            }
        };
        let frame = Bytes::copy_from_slice(&buf[..n]);
        let priority = Priority::of_frame(&frame);
        debug!(client = id, ?priority, "frame of {} bytes", n);
        match queue.push(Command::new(priority, frame, id, Some(replies.clone()))) {
            Ok(seq) => debug!(client = id, "queued command {}", seq),
            Err(e @ QueueError::Full) => {
                warn!(client = id, "dropping command: {}", e);
                let _ = replies.send(Reply::err(e)).await;
            }
            Err(QueueError::Closed) => {
                warn!(client = id, "dispatcher is gone, closing client");
                return;
            }
        }
    }
}

async fn write_replies(id: u64, mut wr: OwnedWriteHalf, mut replies: mpsc::Receiver<Reply>) {
    while let Some(reply) = replies.recv().await {
        if let Err(e) = wr.write_all(reply.to_line().as_bytes()).await {
            debug!(client = id, "reply write failed: {}", e);
            return;
        }
    }
    let _ = wr.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("warden-{}-{}.sock", tag, std::process::id()))
    }

    #[tokio::test]
    async fn stale_socket_is_replaced_and_removed_on_drop() {
        let path = temp_path("stale");
        let _ = std::fs::remove_file(&path);
        let stale = std::os::unix::net::UnixListener::bind(&path).unwrap();
        drop(stale);
        assert!(path.exists());

        let (tx, _rx) = crate::queue::channel(4);
        let cfg = ServerConfig { socket_path: path.clone(), ..Default::default() };
        let server = CommandServer::bind(&cfg, tx).unwrap();
        assert_eq!(server.path(), path);
        drop(server);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn regular_file_is_not_removed() {
        let path = temp_path("file");
        std::fs::write(&path, b"keep me").unwrap();

        let (tx, _rx) = crate::queue::channel(4);
        let cfg = ServerConfig { socket_path: path.clone(), ..Default::default() };
        let err = CommandServer::bind(&cfg, tx).err().unwrap();
        assert!(matches!(err, ServerError::NotASocket(_)), "{err}");
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
        let _ = std::fs::remove_file(&path);
    }
}
