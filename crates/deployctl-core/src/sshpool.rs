//! Remote Executor Pool: reference-counted SSH client connections.
//!
//! Amortizes SSH handshake cost across concurrent sessions to the same
//! server and gives each borrowed session deterministic lifetime control via
//! refcounting, mirroring the upstream `ssh.go`/`client.go` pool this crate
//! is modeled on. Sessions are established through the `openssh` crate,
//! which shells out to the system `ssh` binary over its native control-mux
//! socket; because that path does not support interactive password prompts,
//! only key-based identity auth is implemented (see Open Questions in
//! DESIGN.md).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use openssh::{KnownHosts, Session};
use tokio::runtime::Runtime;
use tracing::warn;

use crate::types::Server;

/// Connection identity plus the key-file material needed to establish a
/// session. Pool lookup key is `(user, password, host, port)` per spec
/// §2.3, even though `password` does not currently participate in auth.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    /// Path to a private key file used for public-key auth.
    pub identity_file: Option<String>,
}

impl ServerConfig {
    pub fn from_server(server: &Server, identity_file: Option<String>) -> Self {
        Self {
            user: server.user.clone(),
            password: server.password.clone(),
            host: server.host.clone(),
            port: server.port,
            identity_file,
        }
    }

    pub fn pool_key(&self) -> String {
        format!("{}:{}@{}:{}", self.user, self.password, self.host, self.port)
    }
}

struct ClientEntry {
    session: Session,
    refcount: Mutex<u32>,
}

struct PoolInner {
    rt: Runtime,
    clients: Mutex<HashMap<String, Arc<ClientEntry>>>,
}

/// Pool of pooled, refcounted SSH sessions keyed by server identity.
pub struct ExecutorPool {
    inner: Arc<PoolInner>,
}

impl ExecutorPool {
    pub fn new() -> Result<Self> {
        let rt = Runtime::new().context("failed to start ssh executor runtime")?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                rt,
                clients: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Returns an existing pooled session for `cfg`'s key, or establishes a
    /// new one. Host-key verification is intentionally disabled (spec §9,
    /// "Host-key verification disabled" design note); every connection logs
    /// a warning so operators can audit what was trusted.
    pub fn get(&self, cfg: &ServerConfig) -> Result<PooledSession> {
        if !cfg.password.is_empty() {
            bail!(
                "password authentication is not supported by this transport; configure an identity_file for {}@{}",
                cfg.user,
                cfg.host
            );
        }

        let key = cfg.pool_key();
        let mut clients = self.inner.clients.lock().expect("ssh pool lock poisoned");
        let entry = match clients.get(&key) {
            Some(existing) => Arc::clone(existing),
            None => {
                warn!(host = %cfg.host, port = cfg.port, "accepting host key without verification");
                let session = self.inner.rt.block_on(connect_with_retry(cfg))?;
                let entry = Arc::new(ClientEntry {
                    session,
                    refcount: Mutex::new(0),
                });
                clients.insert(key.clone(), Arc::clone(&entry));
                entry
            }
        };
        *entry.refcount.lock().expect("refcount lock poisoned") += 1;
        drop(clients);

        Ok(PooledSession {
            pool: Arc::clone(&self.inner),
            key,
            entry,
        })
    }

    /// Number of distinct servers currently holding an open session.
    pub fn len(&self) -> usize {
        self.inner.clients.lock().expect("ssh pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn connect(cfg: &ServerConfig) -> Result<Session> {
    let destination = format!("ssh://{}@{}:{}", cfg.user, cfg.host, cfg.port);
    let mut builder = openssh::SessionBuilder::default();
    builder.known_hosts_check(KnownHosts::Accept);
    if let Some(identity) = &cfg.identity_file {
        builder.keyfile(identity);
    }
    builder
        .connect_mux(&destination)
        .await
        .with_context(|| format!("failed to connect to {destination}"))
}

/// Retries a fresh connection attempt with the crate's default backoff
/// policy, matching the teacher's use of `deployctl-retry` for transient SSH
/// failures (a restarting `sshd`, a flaky jump host).
async fn connect_with_retry(cfg: &ServerConfig) -> Result<Session> {
    let retry_config = deployctl_retry::RetryPolicy::Default.to_config();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match connect(cfg).await {
            Ok(session) => return Ok(session),
            Err(e) if attempt < retry_config.max_attempts => {
                let delay = deployctl_retry::calculate_delay(&retry_config, attempt);
                warn!(host = %cfg.host, attempt, ?delay, error = %e, "ssh connect failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// A borrowed, refcounted handle to a pooled SSH session.
///
/// Dropping the handle decrements the refcount; when it reaches zero the
/// underlying session is closed and removed from the pool (spec §2.3, §5).
pub struct PooledSession {
    pool: Arc<PoolInner>,
    key: String,
    entry: Arc<ClientEntry>,
}

impl PooledSession {
    /// One-shot command capturing combined stdout+stderr.
    pub fn run_cmd(&self, cmd: &str) -> Result<(i32, Vec<u8>)> {
        self.pool.rt.block_on(async {
            let mut command = self.entry.session.command("sh");
            command.arg("-c").arg(cmd);
            let output = command
                .output()
                .await
                .context("failed to run remote command")?;
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            let code = output.status.code().unwrap_or(-1);
            Ok((code, combined))
        })
    }

    /// Runs `cmd`, streaming combined output chunks to `on_chunk` as they
    /// arrive, honoring `cancel` for mid-flight cancellation (spec §4.3
    /// "Ordering and cancellation").
    pub fn run_streaming(
        &self,
        cmd: &str,
        cancel: &std::sync::atomic::AtomicBool,
        mut on_chunk: impl FnMut(&[u8]),
    ) -> Result<i32> {
        use std::sync::atomic::Ordering;
        use tokio::io::AsyncReadExt;

        self.pool.rt.block_on(async {
            let mut command = self.entry.session.command("sh");
            command.arg("-c").arg(cmd);
            command.stdout(openssh::Stdio::piped());
            command.stderr(openssh::Stdio::piped());
            let mut child = command.spawn().await.context("failed to spawn remote command")?;
            let mut stdout = child.stdout().take().expect("stdout piped");
            let mut stderr = child.stderr().take().expect("stderr piped");

            let mut stdout_buf = [0u8; 4096];
            let mut stderr_buf = [0u8; 4096];
            let mut stdout_open = true;
            let mut stderr_open = true;
            while stdout_open || stderr_open {
                if cancel.load(Ordering::Relaxed) {
                    let _ = child.disconnect().await;
                    bail!("remote session closed by cancellation");
                }
                if stdout_open {
                    match stdout.read(&mut stdout_buf).await {
                        Ok(0) => stdout_open = false,
                        Ok(n) => on_chunk(&stdout_buf[..n]),
                        Err(e) => return Err(e).context("reading remote command stdout"),
                    }
                }
                if stderr_open {
                    match stderr.read(&mut stderr_buf).await {
                        Ok(0) => stderr_open = false,
                        Ok(n) => on_chunk(&stderr_buf[..n]),
                        Err(e) => return Err(e).context("reading remote command stderr"),
                    }
                }
            }
            let status = child.wait().await.context("waiting for remote command")?;
            Ok(status.code().unwrap_or(-1))
        })
    }

    /// Uploads `local_path` to `remote_path` by streaming it into a remote
    /// `cat > file` sink over the session's stdin, avoiding the need for a
    /// second SFTP subsystem connection per upload (spec §4.3 `Sftp` role).
    pub fn upload(&self, local_path: &std::path::Path, remote_path: &str) -> Result<()> {
        let cmd = format!("cat > {}", shell_quote(remote_path));
        let bytes = std::fs::read(local_path)
            .with_context(|| format!("failed to read {}", local_path.display()))?;
        self.pool.rt.block_on(async {
            let mut command = self.entry.session.command("sh");
            command.arg("-c").arg(&cmd);
            command.stdin(openssh::Stdio::piped());
            let mut child = command.spawn().await.context("failed to spawn upload sink")?;
            {
                use tokio::io::AsyncWriteExt;
                let mut stdin = child.stdin().take().expect("stdin piped");
                stdin.write_all(&bytes).await.context("writing upload payload")?;
                stdin.shutdown().await.ok();
            }
            let status = child.wait().await.context("waiting for upload")?;
            if !status.success() {
                bail!("remote upload sink exited with {:?}", status.code());
            }
            Ok(())
        })
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let mut clients = self
            .pool
            .clients
            .lock()
            .expect("ssh pool lock poisoned on drop");
        let remaining = {
            let mut refcount = self.entry.refcount.lock().expect("refcount lock poisoned");
            *refcount -= 1;
            *refcount
        };
        if remaining == 0 {
            clients.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_key_matches_server_identity_tuple() {
        let cfg = ServerConfig {
            user: "deploy".into(),
            password: String::new(),
            host: "example.com".into(),
            port: 2222,
            identity_file: None,
        };
        assert_eq!(cfg.pool_key(), "deploy:@example.com:2222");
    }

    #[test]
    fn new_pool_starts_empty() {
        let pool = ExecutorPool::new().unwrap();
        assert!(pool.is_empty());
    }
}
