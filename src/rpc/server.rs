//! Helper side of the RPC channel
//!
//! Accepts connections on a Unix socket, authorizes each peer by uid and
//! hands decoded requests to a [`RequestHandler`]. Handlers are synchronous
//! and run on the blocking pool, since they shell out to system tools.

use std::future::Future;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use super::protocol::{self, FrameError, Reply, ReplyFrame, Request, RequestFrame};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {path}: {source}")]
    BindError { path: PathBuf, source: io::Error },
    #[error("Another helper is already listening on {0}")]
    AlreadyRunning(PathBuf),
    #[error("Failed to set socket permissions: {0}")]
    PermissionError(io::Error),
}

pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> Reply;
}

pub struct HelperServer<H> {
    socket_path: PathBuf,
    allowed_uids: Vec<u32>,
    handler: Arc<H>,
}

impl<H: RequestHandler> HelperServer<H> {
    /// Only root is allowed until [`allow_uid`](Self::allow_uid) adds more
    pub fn new(socket_path: impl Into<PathBuf>, handler: H) -> Self {
        Self {
            socket_path: socket_path.into(),
            allowed_uids: vec![0],
            handler: Arc::new(handler),
        }
    }

    pub fn allow_uid(mut self, uid: u32) -> Self {
        if !self.allowed_uids.contains(&uid) {
            self.allowed_uids.push(uid);
        }
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, replacing a stale one left by a crashed helper
    pub async fn bind(&self) -> Result<UnixListener, ServerError> {
        if self.socket_path.exists() {
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                return Err(ServerError::AlreadyRunning(self.socket_path.clone()));
            }
            debug!("Removing stale socket {}", self.socket_path.display());
            let _ = std::fs::remove_file(&self.socket_path);
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|source| ServerError::BindError {
            path: self.socket_path.clone(),
            source,
        })?;
        // Reachable by any local user; authorization happens per connection
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o666))
            .map_err(ServerError::PermissionError)?;
        Ok(listener)
    }

    /// Serve until `shutdown` resolves, then remove the socket file
    pub async fn serve<F>(self, listener: UnixListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!("Helper listening on {}", self.socket_path.display());
        let allowed = Arc::new(self.allowed_uids);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Helper shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handler = Arc::clone(&self.handler);
                        let allowed = Arc::clone(&allowed);
                        tokio::spawn(async move {
                            serve_connection(stream, handler, allowed).await;
                        });
                    }
                    Err(e) => error!("Accept failed: {}", e),
                },
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            warn!("Failed to remove {}: {}", self.socket_path.display(), e);
        }
    }
}

async fn serve_connection<H: RequestHandler>(stream: UnixStream, handler: Arc<H>, allowed: Arc<Vec<u32>>) {
    let uid = match stream.peer_cred() {
        Ok(cred) => cred.uid(),
        Err(e) => {
            warn!("Could not read peer credentials: {}", e);
            return;
        }
    };
    let authorized = allowed.contains(&uid);

    let (read, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read);

    loop {
        let frame: Result<RequestFrame, serde_json::Error> = match protocol::read_frame(&mut reader).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => break,
            Err(FrameError::Malformed(e)) => Err(e),
            Err(e) => {
                debug!("Dropping connection from uid {}: {}", uid, e);
                break;
            }
        };

        // Unauthorized peers get one denial, whatever they sent
        if !authorized {
            let id = match &frame {
                Ok(frame) => {
                    warn!("Denied {} from uid {}", frame.request.method(), uid);
                    frame.id
                }
                Err(_) => {
                    warn!("Denied malformed request from uid {}", uid);
                    0
                }
            };
            let reply = ReplyFrame {
                id,
                reply: Reply::Denied {
                    reason: format!("uid {} is not authorized", uid),
                },
            };
            let _ = protocol::write_frame(&mut writer, &reply).await;
            break;
        }

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                let reply = ReplyFrame {
                    id: 0,
                    reply: Reply::Rejected {
                        reason: format!("malformed request: {}", e),
                    },
                };
                if protocol::write_frame(&mut writer, &reply).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        let request = frame.request;
        let reply = tokio::task::spawn_blocking(move || handler.handle(request))
            .await
            .unwrap_or_else(|e| Reply::failed(format!("handler failed: {}", e)));

        let reply = ReplyFrame { id: frame.id, reply };
        if let Err(e) = protocol::write_frame(&mut writer, &reply).await {
            debug!("Failed to write reply to uid {}: {}", uid, e);
            break;
        }
    }
}
