//! SSH transport for remote container engines.
//!
//! Key generation and parsing use OpenSSH-format ed25519 keys; sessions are
//! libssh2 handles driven on blocking tasks so the async callers never
//! stall a runtime worker. When no accepted host keys are supplied, every
//! host key is accepted; otherwise the offered key must byte-match one of
//! them or the connection is rejected.

use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey, PublicKey};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// An OpenSSH-encoded keypair
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// Private key in OpenSSH PEM form
    pub private_key: String,
    /// Public key in `ssh-ed25519 AAAA... ` form
    pub public_key: String,
}

/// Generate a fresh ed25519 keypair.
pub fn generate_keypair() -> Result<KeyPair> {
    let private = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| Error::invalid_config(format!("key generation: {e}")))?;
    let private_pem = private
        .to_openssh(LineEnding::LF)
        .map_err(|e| Error::invalid_config(format!("key encoding: {e}")))?;
    let public = private
        .public_key()
        .to_openssh()
        .map_err(|e| Error::invalid_config(format!("key encoding: {e}")))?;
    Ok(KeyPair {
        private_key: private_pem.to_string(),
        public_key: public,
    })
}

/// Parse an OpenSSH private key, decrypting it when a passphrase is given.
pub fn parse_key(bytes: &[u8], passphrase: Option<&str>) -> Result<KeyPair> {
    let mut private = PrivateKey::from_openssh(bytes)
        .map_err(|e| Error::invalid_config(format!("unparseable private key: {e}")))?;
    if private.is_encrypted() {
        let passphrase = passphrase
            .ok_or_else(|| Error::invalid_config("private key is encrypted and no passphrase was given"))?;
        private = private
            .decrypt(passphrase)
            .map_err(|e| Error::auth("ssh", format!("key decryption failed: {e}")))?;
    }
    let private_pem = private
        .to_openssh(LineEnding::LF)
        .map_err(|e| Error::invalid_config(format!("key encoding: {e}")))?;
    let public = private
        .public_key()
        .to_openssh()
        .map_err(|e| Error::invalid_config(format!("key encoding: {e}")))?;
    Ok(KeyPair {
        private_key: private_pem.to_string(),
        public_key: public,
    })
}

/// Wire-format bytes of an OpenSSH public key, for host-key pinning.
pub fn public_key_bytes(openssh: &str) -> Result<Vec<u8>> {
    let key = PublicKey::from_openssh(openssh)
        .map_err(|e| Error::invalid_config(format!("unparseable public key: {e}")))?;
    key.to_bytes()
        .map_err(|e| Error::invalid_config(format!("public key encoding: {e}")))
}

/// An authenticated SSH session.
///
/// Safe to share; each operation serializes on the underlying session.
#[derive(Clone)]
pub struct Client {
    session: Arc<Mutex<ssh2::Session>>,
    endpoint: String,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("endpoint", &self.endpoint).finish()
    }
}

/// Connect and authenticate with a private key.
///
/// `accepted_host_keys` holds wire-format public keys; empty accepts any.
pub async fn connect(
    host: &str,
    port: u16,
    user: &str,
    private_key: &str,
    accepted_host_keys: &[Vec<u8>],
) -> Result<Client> {
    let host = host.to_string();
    let user = user.to_string();
    let private_key = private_key.to_string();
    let accepted = accepted_host_keys.to_vec();
    let endpoint = format!("{user}@{host}:{port}");
    let target = endpoint.clone();

    let session = tokio::task::spawn_blocking(move || -> Result<ssh2::Session> {
        let tcp = TcpStream::connect((host.as_str(), port))
            .map_err(|e| Error::transport(&target, format!("dial: {e}")))?;
        let mut session = ssh2::Session::new()
            .map_err(|e| Error::transport(&target, format!("session init: {e}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| Error::transport(&target, format!("handshake: {e}")))?;

        if !accepted.is_empty() {
            let (offered, _kind) = session
                .host_key()
                .ok_or_else(|| Error::auth(&target, "server offered no host key"))?;
            if !accepted.iter().any(|key| key.as_slice() == offered) {
                return Err(Error::auth(&target, "host key does not match any accepted key"));
            }
        }

        session
            .userauth_pubkey_memory(&user, None, &private_key, None)
            .map_err(|e| Error::auth(&target, format!("public key auth: {e}")))?;
        if !session.authenticated() {
            return Err(Error::auth(&target, "authentication incomplete"));
        }
        Ok(session)
    })
    .await
    .map_err(|e| Error::transport(&endpoint, format!("task join: {e}")))??;

    debug!(endpoint = %endpoint, "ssh session established");
    Ok(Client {
        session: Arc::new(Mutex::new(session)),
        endpoint,
    })
}

impl Client {
    /// Run one command, returning `(stdout, stderr)`.
    pub async fn exec(&self, command: &str) -> Result<(String, String)> {
        let session = Arc::clone(&self.session);
        let endpoint = self.endpoint.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || -> Result<(String, String)> {
            let session = session.lock().unwrap_or_else(|e| e.into_inner());
            let mut channel = session
                .channel_session()
                .map_err(|e| Error::transport(&endpoint, format!("open channel: {e}")))?;
            channel
                .exec(&command)
                .map_err(|e| Error::transport(&endpoint, format!("exec: {e}")))?;

            let mut stdout = String::new();
            channel
                .read_to_string(&mut stdout)
                .map_err(|e| Error::transport(&endpoint, format!("read stdout: {e}")))?;
            let mut stderr = String::new();
            channel
                .stderr()
                .read_to_string(&mut stderr)
                .map_err(|e| Error::transport(&endpoint, format!("read stderr: {e}")))?;
            channel
                .wait_close()
                .map_err(|e| Error::transport(&endpoint, format!("close: {e}")))?;
            let exit_code = channel
                .exit_status()
                .map_err(|e| Error::transport(&endpoint, format!("exit status: {e}")))?;
            if exit_code != 0 {
                return Err(Error::exec(command, exit_code, format!("{stdout}{stderr}")));
            }
            Ok((stdout, stderr))
        })
        .await
        .map_err(|e| Error::transport(&self.endpoint, format!("task join: {e}")))?
    }

    /// Feed a sequence of commands to one shell process over a single
    /// session, in declaration order, and return the combined output.
    ///
    /// Each command is written to the shell's stdin followed by a newline;
    /// stdin is then closed and the call returns only after the remote
    /// exit status arrives. Non-zero exit yields [`Error::Exec`].
    pub async fn exec_in(&self, shell: &str, commands: &[String]) -> Result<String> {
        let session = Arc::clone(&self.session);
        let endpoint = self.endpoint.clone();
        let shell = shell.to_string();
        let commands = commands.to_vec();
        tokio::task::spawn_blocking(move || -> Result<String> {
            let session = session.lock().unwrap_or_else(|e| e.into_inner());
            let mut channel = session
                .channel_session()
                .map_err(|e| Error::transport(&endpoint, format!("open channel: {e}")))?;
            channel
                .exec(&shell)
                .map_err(|e| Error::transport(&endpoint, format!("exec {shell}: {e}")))?;

            for command in &commands {
                channel
                    .write_all(command.as_bytes())
                    .and_then(|()| channel.write_all(b"\n"))
                    .map_err(|e| Error::transport(&endpoint, format!("write command: {e}")))?;
                trace!(command = %command, "sent shell command");
            }
            channel
                .send_eof()
                .map_err(|e| Error::transport(&endpoint, format!("close stdin: {e}")))?;

            let mut stdout = String::new();
            channel
                .read_to_string(&mut stdout)
                .map_err(|e| Error::transport(&endpoint, format!("read stdout: {e}")))?;
            let mut stderr = String::new();
            channel
                .stderr()
                .read_to_string(&mut stderr)
                .map_err(|e| Error::transport(&endpoint, format!("read stderr: {e}")))?;
            channel
                .wait_close()
                .map_err(|e| Error::transport(&endpoint, format!("close: {e}")))?;
            let exit_code = channel
                .exit_status()
                .map_err(|e| Error::transport(&endpoint, format!("exit status: {e}")))?;

            let combined = format!("{stdout}{stderr}");
            if exit_code != 0 {
                return Err(Error::exec(
                    format!("{shell} <<< {} command(s)", commands.len()),
                    exit_code,
                    combined,
                ));
            }
            Ok(combined)
        })
        .await
        .map_err(|e| Error::transport(&self.endpoint, format!("task join: {e}")))?
    }
}

/// A local TCP port tunneled to a port on the remote host.
///
/// Dropping the forward (or calling [`PortForward::close`]) stops the
/// listener and the background pump.
pub struct PortForward {
    local_port: u16,
    shutdown: Arc<AtomicBool>,
}

impl PortForward {
    /// Open a tunnel from an ephemeral local port to `remote_port` on the
    /// remote host's loopback.
    ///
    /// Authentication uses the key at `key_path` when given and the SSH
    /// agent otherwise.
    pub async fn open(
        host: &str,
        port: u16,
        user: &str,
        key_path: Option<&Path>,
        remote_port: u16,
    ) -> Result<Self> {
        let host = host.to_string();
        let user = user.to_string();
        let key_path = key_path.map(Path::to_path_buf);
        let endpoint = format!("{user}@{host}:{port}");
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);

        let local_port = tokio::task::spawn_blocking(move || -> Result<u16> {
            let tcp = TcpStream::connect((host.as_str(), port))
                .map_err(|e| Error::transport(&endpoint, format!("dial: {e}")))?;
            let mut session = ssh2::Session::new()
                .map_err(|e| Error::transport(&endpoint, format!("session init: {e}")))?;
            session.set_tcp_stream(tcp);
            session
                .handshake()
                .map_err(|e| Error::transport(&endpoint, format!("handshake: {e}")))?;
            match &key_path {
                Some(path) => session
                    .userauth_pubkey_file(&user, None, path, None)
                    .map_err(|e| Error::auth(&endpoint, format!("public key auth: {e}")))?,
                None => session
                    .userauth_agent(&user)
                    .map_err(|e| Error::auth(&endpoint, format!("agent auth: {e}")))?,
            }

            let listener = TcpListener::bind(("127.0.0.1", 0))
                .map_err(|e| Error::transport("tunnel listener", e.to_string()))?;
            let local_port = listener
                .local_addr()
                .map_err(|e| Error::transport("tunnel listener", e.to_string()))?
                .port();
            listener
                .set_nonblocking(true)
                .map_err(|e| Error::transport("tunnel listener", e.to_string()))?;

            std::thread::spawn(move || {
                pump_listener(&listener, &session, remote_port, &stop);
            });
            Ok(local_port)
        })
        .await
        .map_err(|e| Error::transport("ssh tunnel", format!("task join: {e}")))??;

        debug!(local_port, remote_port, "ssh port tunnel open");
        Ok(Self {
            local_port,
            shutdown,
        })
    }

    /// The local port the tunnel listens on
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Stop the tunnel
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.close();
    }
}

fn pump_listener(
    listener: &TcpListener,
    session: &ssh2::Session,
    remote_port: u16,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(e) = pump_connection(stream, session, remote_port, shutdown) {
                    warn!(error = %e, "tunnel connection ended with error");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => {
                warn!(error = %e, "tunnel accept failed");
                break;
            }
        }
    }
}

fn pump_connection(
    mut tcp: TcpStream,
    session: &ssh2::Session,
    remote_port: u16,
    shutdown: &AtomicBool,
) -> std::io::Result<()> {
    let mut channel = session
        .channel_direct_tcpip("127.0.0.1", remote_port, None)
        .map_err(std::io::Error::other)?;
    tcp.set_nonblocking(true)?;
    session.set_blocking(false);

    let mut inbound = [0u8; 16 * 1024];
    let mut outbound = [0u8; 16 * 1024];
    let mut tcp_open = true;
    let mut channel_open = true;

    while (tcp_open || channel_open) && !shutdown.load(Ordering::SeqCst) {
        let mut progressed = false;

        if tcp_open {
            match tcp.read(&mut inbound) {
                Ok(0) => {
                    tcp_open = false;
                    let _ = channel.send_eof();
                }
                Ok(n) => {
                    write_all_blocking(&mut channel, &inbound[..n])?;
                    progressed = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        if channel_open {
            match channel.read(&mut outbound) {
                Ok(0) => {
                    channel_open = false;
                }
                Ok(n) => {
                    tcp.set_nonblocking(false)?;
                    tcp.write_all(&outbound[..n])?;
                    tcp.set_nonblocking(true)?;
                    progressed = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if channel.eof() {
                        channel_open = false;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if !progressed {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    session.set_blocking(true);
    let _ = channel.close();
    Ok(())
}

fn write_all_blocking<W: Write>(writer: &mut W, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        match writer.write(data) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "channel write returned zero",
                ))
            }
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_keypair_shapes() {
        let pair = generate_keypair().unwrap();
        assert!(pair.private_key.contains("BEGIN OPENSSH PRIVATE KEY"));
        assert!(pair.public_key.starts_with("ssh-ed25519 "));
    }

    #[test]
    fn test_parse_roundtrip() {
        let pair = generate_keypair().unwrap();
        let parsed = parse_key(pair.private_key.as_bytes(), None).unwrap();
        assert_eq!(parsed.public_key, pair.public_key);
    }

    #[test]
    fn test_parse_garbage_fails() {
        let err = parse_key(b"not a key", None).unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_public_key_bytes_stable() {
        let pair = generate_keypair().unwrap();
        let first = public_key_bytes(&pair.public_key).unwrap();
        let second = public_key_bytes(&pair.public_key).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}
