//! Admin upload handler
//!
//! One connection carries exactly one bundle: an [`AppMessage`], then a
//! stream of files and directories, then a terminator. The bundle is staged
//! under `/tmp/<upload-id>`; any error before the final status rolls the
//! staging directory back and answers `Status{false}`. Certificates shipped
//! with a `tls: true` upload are captured in memory, never written to disk.

use crate::acme::AcmeManager;
use crate::registry::{Registry, RunningSlot, Site};
use crate::tls::{self, CertStore};
use crate::wire::{self, Accept, AppMessage, FileMessage, Status};
use md5::{Digest, Md5};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Files above this size abort the upload.
const MAX_FILE_SIZE: i64 = 10 * 1024 * 1024;

/// Length of the random alphanumeric upload id.
const UPLOAD_ID_LEN: usize = 16;

/// Admin listener: accepts upload connections on the admin port.
pub struct AdminServer {
    listener: TcpListener,
    registry: Arc<Registry>,
    certs: Arc<CertStore>,
    acme: Option<Arc<AcmeManager>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        listener: TcpListener,
        registry: Arc<Registry>,
        certs: Arc<CertStore>,
        acme: Option<Arc<AcmeManager>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            registry,
            certs,
            acme,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "admin listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let certs = Arc::clone(&self.certs);
                            let acme = self.acme.clone();
                            tokio::spawn(async move {
                                let (read_half, write_half) = stream.into_split();
                                let mut reader = BufReader::new(read_half);
                                if let Err(err) =
                                    handle_upload(&mut reader, write_half, registry, certs, acme).await
                                {
                                    warn!(addr = %addr, error = %err, "admin connection failed");
                                }
                            });
                        }
                        Err(err) => error!(error = %err, "admin accept failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("admin shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Roll back the staging directory (if any) and report failure to the client.
async fn abort_upload(
    base: Option<&Path>,
    writer: &mut OwnedWriteHalf,
    msg: &str,
    err: Option<anyhow::Error>,
) -> anyhow::Result<()> {
    match err {
        Some(err) => warn!(error = %err, "error receiving app: {}", msg),
        None => warn!("error receiving app: {}", msg),
    }
    if let Some(base) = base {
        if let Err(err) = tokio::fs::remove_dir_all(base).await {
            warn!(base = %base.display(), error = %err, "removing staged upload");
        }
    }
    let status = Status {
        ok: false,
        msg: msg.to_string(),
    };
    let _ = wire::write_json0(writer, &status).await;
    Ok(())
}

async fn handle_upload(
    reader: &mut BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    registry: Arc<Registry>,
    certs: Arc<CertStore>,
    acme: Option<Arc<AcmeManager>>,
) -> anyhow::Result<()> {
    if let Err(err) = wire::skip_leading_nuls(reader).await {
        return abort_upload(None, &mut writer, "error reading connection", Some(err)).await;
    }

    let app: AppMessage = match wire::read_json0(reader).await {
        Ok(app) => app,
        Err(err) => return abort_upload(None, &mut writer, "error reading first message", Some(err)).await,
    };
    info!(app = %app.name, hosts = ?app.hosts, "admin: preparing app");

    let upload_id = random_token(UPLOAD_ID_LEN);
    let base = PathBuf::from("/tmp").join(&upload_id);
    if let Err(err) = tokio::fs::create_dir_all(&base).await {
        return abort_upload(None, &mut writer, "error creating app storage", Some(err.into())).await;
    }
    info!(app = %app.name, id = %upload_id, "accept app");

    let version = registry
        .find_site(&app.name)
        .map(|site| site.version + 1)
        .unwrap_or(1);

    let accept = Accept {
        version,
        id: upload_id.clone(),
    };
    if let Err(err) = wire::write_json0(&mut writer, &accept).await {
        return abort_upload(Some(&base), &mut writer, "error writing accept", Some(err)).await;
    }

    // With tls the first two regular files are the PEM certificate and the
    // PEM private key; they stay in memory.
    let mut tls_files_pending = if app.tls { 2u8 } else { 0 };
    let mut cert_pem = Vec::new();
    let mut key_pem = Vec::new();

    let mut files = 0u64;
    let mut bytes = 0u64;
    loop {
        let file: FileMessage = match wire::read_json0(reader).await {
            Ok(file) => file,
            Err(err) => {
                return abort_upload(Some(&base), &mut writer, "error reading file message", Some(err)).await
            }
        };
        if file.is_end() {
            info!(files, bytes, "received full file list");
            break;
        }
        if file.size > MAX_FILE_SIZE {
            return abort_upload(Some(&base), &mut writer, "file size too large", None).await;
        }

        if file.is_dir() {
            if let Err(err) = write_dir(&base, &file).await {
                return abort_upload(Some(&base), &mut writer, "error creating dir", Some(err)).await;
            }
            continue;
        }

        files += 1;
        bytes += file.size.max(0) as u64;
        let mut content = (&mut *reader).take(file.size.max(0) as u64);

        if tls_files_pending == 2 {
            tls_files_pending = 1;
            if let Err(err) = read_exact_content(&mut content, file.size, &mut cert_pem).await {
                return abort_upload(Some(&base), &mut writer, "error reading pem", Some(err)).await;
            }
            info!(len = cert_pem.len(), "got site certificate");
            continue;
        }
        if tls_files_pending == 1 {
            tls_files_pending = 0;
            if let Err(err) = read_exact_content(&mut content, file.size, &mut key_pem).await {
                return abort_upload(Some(&base), &mut writer, "error reading key", Some(err)).await;
            }
            info!(len = key_pem.len(), "got private key");
            continue;
        }

        if let Err(err) = write_file(&base, &file, &mut content).await {
            return abort_upload(Some(&base), &mut writer, "error creating file", Some(err)).await;
        }
    }

    // The client may already be gone by now; the site still installs.
    if let Err(err) = wire::write_json0(&mut writer, &Status { ok: true, msg: String::new() }).await {
        warn!(error = %err, "writing final status");
    }

    // Install the shipped certificate, if any. A pair that does not parse is
    // logged and the site installs without TLS.
    let mut cert_id = Vec::new();
    if !cert_pem.is_empty() && !key_pem.is_empty() {
        let mut hasher = Md5::new();
        hasher.update(&cert_pem);
        hasher.update(&key_pem);
        let digest: [u8; 16] = hasher.finalize().into();
        cert_id = digest.to_vec();
        if !certs.has(&digest) {
            match tls::parse_cert_pair(&cert_pem, &key_pem) {
                Ok(key) => {
                    info!(app = %app.name, "adding certificate to https");
                    certs.add(key, digest);
                }
                Err(err) => warn!(app = %app.name, error = %err, "unusable site certificate"),
            }
        }
    }

    if !app.lets_encrypt_mail.is_empty() {
        if let Some(acme) = &acme {
            acme.register(&app.lets_encrypt_mail, &app.hosts);
        }
    }

    info!(app = %app.name, version, "adding site to server");
    registry.add_site(Arc::new(Site {
        id: app.name,
        version,
        hostnames: app.hosts,
        paths: vec!["/".to_string()],
        command: app.command,
        env: app.env,
        data: base,
        cert_id,
        https_only: app.https_only,
        running: RunningSlot::new(),
    }));
    Ok(())
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Only the rwx bits plus setuid/setgid/sticky are honored. A zero means
/// "use the default"; -1 means all permissions off.
fn clean_file_perm(perm: i32) -> u32 {
    match perm {
        -1 => 0,
        0 => 0o664,
        p => (p as u32) & 0o7777,
    }
}

fn clean_dir_perm(perm: i32) -> u32 {
    match perm {
        -1 => 0,
        0 => 0o755,
        p => (p as u32) & 0o7777,
    }
}

/// Join an uploaded entry name onto the staging directory, refusing anything
/// that could escape it.
fn safe_entry_path(base: &Path, name: &str) -> anyhow::Result<PathBuf> {
    let trimmed = name.trim_end_matches('/');
    if trimmed.is_empty() {
        anyhow::bail!("empty entry name");
    }
    let rel = Path::new(trimmed);
    if rel.is_absolute() {
        anyhow::bail!("absolute path in bundle: {}", name);
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) => {}
            _ => anyhow::bail!("unsafe path in bundle: {}", name),
        }
    }
    Ok(base.join(rel))
}

async fn write_dir(base: &Path, file: &FileMessage) -> anyhow::Result<()> {
    assert!(file.is_dir(), "write_dir on non-directory entry");
    let path = safe_entry_path(base, &file.name)?;
    tokio::fs::create_dir(&path).await?;
    set_mode(&path, clean_dir_perm(file.perm)).await?;
    Ok(())
}

async fn write_file<R>(base: &Path, file: &FileMessage, content: &mut R) -> anyhow::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let path = safe_entry_path(base, &file.name)?;
    let mut out = tokio::fs::File::create(&path).await?;
    let copied = tokio::io::copy(content, &mut out).await?;
    if copied < file.size.max(0) as u64 {
        anyhow::bail!("short file content for {}", file.name);
    }
    out.flush().await?;
    drop(out);
    set_mode(&path, clean_file_perm(file.perm)).await?;
    Ok(())
}

/// Read exactly the declared number of bytes into memory (TLS material).
async fn read_exact_content<R>(content: &mut R, size: i64, buf: &mut Vec<u8>) -> anyhow::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    content.read_to_end(buf).await?;
    if buf.len() < size.max(0) as usize {
        anyhow::bail!("short file content");
    }
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_perm_cleaning() {
        assert_eq!(clean_file_perm(0), 0o664);
        assert_eq!(clean_file_perm(-1), 0);
        assert_eq!(clean_file_perm(0o600), 0o600);
        assert_eq!(clean_file_perm(0o4755), 0o4755);
        // Anything beyond the mode bits is masked off.
        assert_eq!(clean_file_perm(0o777777), 0o7777);
    }

    #[test]
    fn dir_perm_cleaning() {
        assert_eq!(clean_dir_perm(0), 0o755);
        assert_eq!(clean_dir_perm(-1), 0);
        assert_eq!(clean_dir_perm(0o700), 0o700);
    }

    #[test]
    fn token_is_alphanumeric() {
        let token = random_token(UPLOAD_ID_LEN);
        assert_eq!(token.len(), UPLOAD_ID_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(token, random_token(UPLOAD_ID_LEN));
    }

    #[test]
    fn entry_paths_stay_inside_the_staging_dir() {
        let base = Path::new("/tmp/upload123");
        assert_eq!(
            safe_entry_path(base, "static/app.js").unwrap(),
            base.join("static/app.js")
        );
        assert_eq!(safe_entry_path(base, "static/").unwrap(), base.join("static"));

        assert!(safe_entry_path(base, "../escape").is_err());
        assert!(safe_entry_path(base, "a/../../escape").is_err());
        assert!(safe_entry_path(base, "/etc/passwd").is_err());
        assert!(safe_entry_path(base, "").is_err());
        assert!(safe_entry_path(base, "/").is_err());
    }

    #[test]
    fn size_cap_boundary() {
        assert!(MAX_FILE_SIZE == 10 * 1024 * 1024);
        let at_cap = FileMessage {
            name: "big".to_string(),
            size: MAX_FILE_SIZE,
            perm: 0,
        };
        let over_cap = FileMessage {
            name: "bigger".to_string(),
            size: MAX_FILE_SIZE + 1,
            perm: 0,
        };
        assert!(at_cap.size <= MAX_FILE_SIZE);
        assert!(over_cap.size > MAX_FILE_SIZE);
    }
}
