//! File transfer worker: idempotent implicit-TLS FTP upload.
//!
//! No off-the-shelf FTP crate implements implicit TLS — the common ones
//! assume explicit/STARTTLS semantics, which Bambu printers reject. This
//! talks the protocol directly over a `tokio_rustls` stream by hand.

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use rustls::pki_types::ServerName;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::tls::insecure_client_config;

const FTP_PORT: u16 = 990;
const FTP_USER: &str = "bblp";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

fn tls_connector() -> TlsConnector {
    TlsConnector::from(Arc::new(insecure_client_config()))
}

/// Uploads `local_path` to the printer as `remote_name`, retrying up to
/// `MAX_ATTEMPTS` times with a fixed delay. Returns `false` (never an Err)
/// once every attempt has failed — the caller maps that into a `failed`
/// job transition.
pub async fn upload(local_path: &Path, remote_name: &str, host: &str, access_code: &str) -> bool {
    for attempt in 1..=MAX_ATTEMPTS {
        match try_upload(local_path, remote_name, host, access_code).await {
            Ok(()) => return true,
            Err(err) => {
                warn!(
                    "upload attempt {attempt}/{MAX_ATTEMPTS} of {} to {host} failed: {err:#}",
                    local_path.display()
                );
            }
        }
        if attempt < MAX_ATTEMPTS {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }
    false
}

async fn try_upload(local_path: &Path, remote_name: &str, host: &str, access_code: &str) -> Result<()> {
    let mut session = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        Session::connect(host, access_code),
    )
    .await
    .context("TLS handshake timed out")??;

    let remote_size = session.size(remote_name).await.ok();
    let local_size = tokio::fs::metadata(local_path).await?.len();

    if remote_size == Some(local_size) {
        info!("{remote_name} already present on {host} at matching size, skipping upload");
        session.quit().await.ok();
        return Ok(());
    }

    session.store(local_path, remote_name).await?;
    session.quit().await.ok();
    Ok(())
}

/// A single FTP control connection, TLS-wrapped from the very first byte.
struct Session {
    reader: BufReader<tokio::io::ReadHalf<TlsStream<TcpStream>>>,
    writer: tokio::io::WriteHalf<TlsStream<TcpStream>>,
    host: String,
}

impl Session {
    async fn connect(host: &str, access_code: &str) -> Result<Self> {
        let tcp = TcpStream::connect((host, FTP_PORT)).await?;
        let server_name = ServerName::try_from("printer")
            .map_err(|_| anyhow!("invalid server name"))?
            .to_owned();
        let tls = tls_connector().connect(server_name, tcp).await?;
        let (read_half, write_half) = tokio::io::split(tls);

        let mut session = Session {
            reader: BufReader::new(read_half),
            writer: write_half,
            host: host.to_string(),
        };

        // Implicit TLS: the handshake above happened before any line was
        // read. Only now do we read the welcome banner.
        session.read_reply().await?;
        session.command(&format!("USER {FTP_USER}")).await?;
        session.command(&format!("PASS {access_code}")).await?;
        session.command("PBSZ 0").await?;
        session.command("PROT P").await?;
        session.command("TYPE I").await?;

        Ok(session)
    }

    async fn read_reply(&mut self) -> Result<(u32, String)> {
        let mut line = String::new();
        self.reader.read_line(&mut line).await?;
        let line = line.trim_end();
        let code: u32 = line
            .get(0..3)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow!("malformed FTP reply: {line}"))?;
        debug!("[{}] <- {line}", self.host);
        Ok((code, line.to_string()))
    }

    async fn command(&mut self, line: &str) -> Result<(u32, String)> {
        debug!("[{}] -> {line}", self.host);
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        let (code, text) = self.read_reply().await?;
        if code >= 400 {
            bail!("FTP command '{line}' rejected: {text}");
        }
        Ok((code, text))
    }

    async fn size(&mut self, remote_name: &str) -> Result<u64> {
        let (_, text) = self.command(&format!("SIZE {remote_name}")).await?;
        text.split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow!("unparseable SIZE reply: {text}"))
    }

    /// Enters passive mode and returns the data-channel address.
    async fn pasv(&mut self) -> Result<(String, u16)> {
        let (_, text) = self.command("PASV").await?;
        let start = text.find('(').ok_or_else(|| anyhow!("no PASV tuple: {text}"))?;
        let end = text.find(')').ok_or_else(|| anyhow!("no PASV tuple: {text}"))?;
        let parts: Vec<u32> = text[start + 1..end]
            .split(',')
            .map(|p| p.parse())
            .collect::<Result<_, _>>()
            .map_err(|_| anyhow!("unparseable PASV tuple: {text}"))?;
        if parts.len() != 6 {
            bail!("unexpected PASV tuple arity: {text}");
        }
        let ip = format!("{}.{}.{}.{}", parts[0], parts[1], parts[2], parts[3]);
        let port = ((parts[4] << 8) | parts[5]) as u16;
        Ok((ip, port))
    }

    async fn store(&mut self, local_path: &Path, remote_name: &str) -> Result<()> {
        let (data_host, data_port) = self.pasv().await?;
        let data_tcp = TcpStream::connect((data_host.as_str(), data_port)).await?;
        let server_name = ServerName::try_from("printer")
            .map_err(|_| anyhow!("invalid server name"))?
            .to_owned();
        let mut data_tls = tls_connector().connect(server_name, data_tcp).await?;

        self.writer
            .write_all(format!("STOR {remote_name}\r\n").as_bytes())
            .await?;
        self.writer.flush().await?;
        let (code, text) = self.read_reply().await?;
        if code >= 400 {
            bail!("STOR rejected: {text}");
        }

        let mut file = tokio::fs::File::open(local_path).await?;
        file.seek(SeekFrom::Start(0)).await?;
        tokio::io::copy(&mut file, &mut data_tls).await?;
        data_tls.shutdown().await?;

        let (code, text) = self.read_reply().await?;
        if code >= 400 {
            bail!("transfer not confirmed: {text}");
        }

        Ok(())
    }

    async fn quit(&mut self) -> Result<()> {
        self.writer.write_all(b"QUIT\r\n").await?;
        self.writer.flush().await?;
        let _ = self.read_reply().await;
        Ok(())
    }
}

/// Streaming MD5 over 4 KiB reads.
pub async fn md5_hex(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[tokio::test]
    async fn md5_matches_known_vector() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        let digest = md5_hex(file.path()).await.unwrap();
        assert_eq!(digest, "900150983cd24fb0d6963f7d28e17f72");
    }

    #[tokio::test]
    async fn md5_is_stable_across_chunk_boundary() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let payload = vec![b'x'; 4096 * 3 + 17];
        file.write_all(&payload).unwrap();
        let first = md5_hex(file.path()).await.unwrap();
        let second = md5_hex(file.path()).await.unwrap();
        assert_eq!(first, second);
    }
}
