//! SSH/SCP access to the hypervisor host.
//!
//! The hypervisor's snippet store is a plain directory; the only mutations
//! the agent needs are writing a cloud-init file into it and removing one.
//! Uploads speak the SCP sink protocol (`scp -t`) over a fresh SSH session
//! per operation.

use crate::error::{Error, Result};
use async_trait::async_trait;
use russh::client::{self, Config, Handle, Handler};
use russh::ChannelMsg;
use russh_keys::decode_secret_key;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Remote file operations on the hypervisor host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SshClient: Send + Sync {
    /// Write `content` to `remote_path`, creating parent directories.
    async fn copy(&self, content: &str, remote_path: &str) -> Result<()>;

    /// Remove a remote file. Missing files are not an error.
    async fn delete_file(&self, remote_path: &str) -> Result<()>;
}

/// SCP-based implementation of [`SshClient`].
///
/// Key-based auth only; all server host keys are accepted (the agent talks
/// to one fixed host on a management network - known-hosts checking is
/// deliberately disabled, which is an insecure default).
pub struct ScpClient {
    host: String,
    port: u16,
    username: String,
    private_key_path: PathBuf,
    connect_timeout: Duration,
}

impl ScpClient {
    pub fn new(host: &str, username: &str, private_key_path: &str) -> Self {
        Self {
            host: host.to_string(),
            port: 22,
            username: username.to_string(),
            private_key_path: PathBuf::from(private_key_path),
            connect_timeout: Duration::from_secs(30),
        }
    }

    async fn connect(&self) -> Result<Handle<ClientHandler>> {
        let key_bytes = tokio::fs::read(&self.private_key_path).await.map_err(|e| {
            Error::ssh(format!(
                "failed to read private key {}: {e}",
                self.private_key_path.display()
            ))
        })?;
        let key_str = String::from_utf8(key_bytes)
            .map_err(|e| Error::ssh(format!("invalid UTF-8 in key file: {e}")))?;
        let private_key = decode_secret_key(&key_str, None)
            .map_err(|e| Error::ssh(format!("failed to decode private key: {e}")))?;

        let addr = format!("{}:{}", self.host, self.port);
        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::ssh(format!("connection to {addr} timed out")))?
            .map_err(|e| Error::ssh(format!("TCP connection to {addr} failed: {e}")))?;

        let ssh_config = Arc::new(Config::default());
        let mut handle = timeout(
            self.connect_timeout,
            client::connect_stream(ssh_config, stream, ClientHandler),
        )
        .await
        .map_err(|_| Error::ssh("SSH handshake timed out"))?
        .map_err(|e| Error::ssh(format!("SSH handshake failed: {e}")))?;

        let authenticated = handle
            .authenticate_publickey(&self.username, Arc::new(private_key))
            .await
            .map_err(|e| Error::ssh(format!("SSH public key authentication error: {e}")))?;
        if !authenticated {
            return Err(Error::ssh("SSH authentication failed: not authenticated"));
        }

        Ok(handle)
    }

    /// Run a command and require a zero exit status.
    async fn exec(&self, handle: &Handle<ClientHandler>, command: &str) -> Result<()> {
        debug!("executing SSH command: {command}");

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| Error::ssh(format!("failed to open SSH channel: {e}")))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::ssh(format!("failed to execute command: {e}")))?;

        let mut stderr = Vec::new();
        let mut exit_code = 0u32;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                    stderr.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = exit_status;
                }
                Some(ChannelMsg::Eof) | None => break,
                _ => {}
            }
        }

        if exit_code != 0 {
            return Err(Error::ssh(format!(
                "command {command:?} exited with {exit_code}: {}",
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        Ok(())
    }

    async fn close(&self, handle: Handle<ClientHandler>) {
        if let Err(e) = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("failed to close SSH session cleanly: {e}");
        }
    }
}

#[async_trait]
impl SshClient for ScpClient {
    async fn copy(&self, content: &str, remote_path: &str) -> Result<()> {
        let handle = self.connect().await?;

        let result = self.copy_inner(&handle, content, remote_path).await;
        self.close(handle).await;
        result
    }

    async fn delete_file(&self, remote_path: &str) -> Result<()> {
        let handle = self.connect().await?;
        let result = self.exec(&handle, &format!("rm -f {remote_path}")).await;
        self.close(handle).await;
        result
    }
}

impl ScpClient {
    async fn copy_inner(
        &self,
        handle: &Handle<ClientHandler>,
        content: &str,
        remote_path: &str,
    ) -> Result<()> {
        let (dir, base) = match remote_path.rsplit_once('/') {
            Some((dir, base)) => (dir, base),
            None => ("", remote_path),
        };

        if !dir.is_empty() && dir != "/" {
            self.exec(handle, &format!("mkdir -p {dir}")).await?;
        }

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| Error::ssh(format!("failed to open SSH channel: {e}")))?;
        channel
            .exec(true, format!("scp -t {remote_path}").as_str())
            .await
            .map_err(|e| Error::ssh(format!("failed to start SCP: {e}")))?;

        // Sink protocol: the remote acknowledges each step with a zero byte.
        read_ack(&mut channel).await?;

        let header = format!("C0644 {} {}\n", content.len(), base);
        channel
            .data(header.as_bytes())
            .await
            .map_err(|e| Error::ssh(format!("failed to send file header: {e}")))?;
        read_ack(&mut channel).await?;

        channel
            .data(content.as_bytes())
            .await
            .map_err(|e| Error::ssh(format!("failed to send file content: {e}")))?;
        channel
            .data(&[0u8][..])
            .await
            .map_err(|e| Error::ssh(format!("failed to send end-of-file marker: {e}")))?;
        read_ack(&mut channel).await?;

        channel
            .eof()
            .await
            .map_err(|e| Error::ssh(format!("failed to close SCP stream: {e}")))?;

        // Drain the channel and pick up the final exit status.
        let mut exit_code = 0u32;
        let mut stderr = Vec::new();
        loop {
            match channel.wait().await {
                Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                    stderr.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = exit_status,
                Some(ChannelMsg::Eof) | None => break,
                _ => {}
            }
        }
        if exit_code != 0 {
            return Err(Error::ssh(format!(
                "SCP upload to {remote_path} failed with exit {exit_code}: {}",
                String::from_utf8_lossy(&stderr).trim()
            )));
        }

        debug!("uploaded {} bytes to {remote_path}", content.len());
        Ok(())
    }
}

/// Wait for an SCP acknowledgment byte.
async fn read_ack(channel: &mut russh::Channel<client::Msg>) -> Result<()> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => {
                match data.first() {
                    Some(0) => return Ok(()),
                    Some(_) => {
                        return Err(Error::ssh(format!(
                            "SCP acknowledgment error: {}",
                            String::from_utf8_lossy(&data[1..]).trim()
                        )))
                    }
                    None => {}
                }
            }
            Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                warn!("SCP stderr: {}", String::from_utf8_lossy(&data).trim());
            }
            None => return Err(Error::ssh("channel closed while waiting for SCP acknowledgment")),
            _ => {}
        }
    }
}

/// SSH client handler for connection events.
struct ClientHandler;

#[async_trait]
impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // Single fixed host on a management network.
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn splits_remote_path_into_dir_and_base() {
        let path = "/var/lib/vz/snippets/kube-agent-ci-tc-node-n1.yml";
        let (dir, base) = path.rsplit_once('/').unwrap();
        assert_eq!(dir, "/var/lib/vz/snippets");
        assert_eq!(base, "kube-agent-ci-tc-node-n1.yml");
    }
}
