//! Working-directory archivers
//!
//! Both archivers produce a tar stream with entries sorted by name and with
//! modification times and ownership zeroed, so an unchanged directory always
//! archives to the same bytes.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether_core::traits::Result;
use tether_core::{MarketplaceDriver, ResourceHandle, TetherError, WorkspaceArchiver};
use tracing::{debug, warn};
use walkdir::WalkDir;

fn archive_err(context: &str, e: impl std::fmt::Display) -> TetherError {
    TetherError::Archive(format!("{}: {}", context, e))
}

#[cfg(unix)]
fn entry_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn entry_mode(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() { 0o755 } else { 0o644 }
}

/// Deterministic tar of everything under `dir`
pub fn tar_directory(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    if dir.exists() {
        let walker = WalkDir::new(dir)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name();

        for entry in walker {
            let entry = entry.map_err(|e| archive_err("walk", e))?;
            let rel = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| archive_err("strip prefix", e))?;
            let meta = entry.metadata().map_err(|e| archive_err("metadata", e))?;

            let mut header = tar::Header::new_gnu();
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mode(entry_mode(&meta));

            let file_type = entry.file_type();
            if file_type.is_dir() {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                builder
                    .append_data(&mut header, rel, std::io::empty())
                    .map_err(|e| archive_err("append dir", e))?;
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path()).map_err(|e| archive_err("read link", e))?;
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                builder
                    .append_link(&mut header, rel, target)
                    .map_err(|e| archive_err("append link", e))?;
            } else {
                let data = fs::read(entry.path()).map_err(|e| archive_err("read file", e))?;
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(data.len() as u64);
                builder
                    .append_data(&mut header, rel, data.as_slice())
                    .map_err(|e| archive_err("append file", e))?;
            }
        }
    }

    builder.into_inner().map_err(|e| archive_err("finish", e))
}

/// Replace the contents of `dir` with `archive`
pub fn untar_into(dir: &Path, archive: &[u8]) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|e| archive_err("clear target", e))?;
    }
    fs::create_dir_all(dir).map_err(|e| archive_err("create target", e))?;

    let mut tar = tar::Archive::new(Cursor::new(archive));
    tar.set_preserve_permissions(true);
    tar.unpack(dir).map_err(|e| archive_err("unpack", e))
}

/// Working directories mounted locally at `<root>/<resource id>`
#[derive(Debug, Clone)]
pub struct LocalDirArchiver {
    root: PathBuf,
}

impl LocalDirArchiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Working directory of a resource
    pub fn workdir(&self, resource: &ResourceHandle) -> PathBuf {
        self.root.join(resource.id.as_str())
    }
}

#[async_trait]
impl WorkspaceArchiver for LocalDirArchiver {
    async fn archive(&self, resource: &ResourceHandle) -> Result<Vec<u8>> {
        let dir = self.workdir(resource);
        tokio::task::spawn_blocking(move || tar_directory(&dir))
            .await
            .map_err(|e| TetherError::Internal(e.to_string()))?
    }

    async fn extract(&self, resource: &ResourceHandle, archive: Vec<u8>) -> Result<()> {
        let dir = self.workdir(resource);
        debug!(resource_id = %resource.id, dir = %dir.display(), bytes = archive.len(), "Extracting archive");
        tokio::task::spawn_blocking(move || untar_into(&dir, &archive))
            .await
            .map_err(|e| TetherError::Internal(e.to_string()))?
    }
}

/// Single-quote for a POSIX shell
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Base64 characters moved per exec. Linux caps one argument at 128 KiB.
pub const ENCODED_PIECE: usize = 48 * 1024;

/// Archive bytes per uploaded piece; a multiple of 3 so pieces encode without padding
const RAW_PIECE: usize = ENCODED_PIECE / 4 * 3;

/// Archives the remote working directory over the marketplace exec channel.
///
/// The tar stream travels base64-encoded through a staging file on the remote,
/// [`ENCODED_PIECE`] characters per exec in either direction.
pub struct ExecArchiver {
    driver: Arc<dyn MarketplaceDriver>,
    workdir: String,
}

impl ExecArchiver {
    pub fn new(driver: Arc<dyn MarketplaceDriver>, workdir: impl Into<String>) -> Self {
        Self {
            driver,
            workdir: workdir.into(),
        }
    }

    fn remote<'a>(&self, resource: &'a ResourceHandle) -> Result<&'a str> {
        resource
            .remote()
            .ok_or_else(|| TetherError::Archive(format!("{} has no remote id", resource.id)))
    }

    /// Quoted staging path on the remote
    fn staging(resource: &ResourceHandle, ext: &str) -> String {
        shell_quote(&format!("/tmp/tether-{}.{}", resource.id, ext))
    }

    /// Run `command`; a non-zero exit is an archive error
    async fn run(&self, remote_id: &str, what: &str, command: &str) -> Result<String> {
        let out = self.driver.exec(remote_id, command).await?;
        if !out.is_success() {
            return Err(TetherError::Archive(format!(
                "{} on {} exited {}: {}",
                what,
                remote_id,
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(out.stdout)
    }

    /// Tar the workdir into the staging file, printing its encoded length
    fn archive_command(&self, tar: &str, b64: &str) -> String {
        format!(
            "mkdir -p {dir} && tar --sort=name --mtime=@0 --owner=0 --group=0 --numeric-owner -C {dir} -cf {tar} . \
             && base64 -w0 {tar} > {b64} && rm -f {tar} && wc -c < {b64}",
            dir = shell_quote(&self.workdir),
        )
    }

    fn read_piece_command(b64: &str, index: usize) -> String {
        format!("dd if={} bs={} skip={} count=1 2>/dev/null", b64, ENCODED_PIECE, index)
    }

    fn extract_command(&self, b64: &str) -> String {
        format!(
            "rm -rf {dir} && mkdir -p {dir} && base64 -d {b64} | tar -xf - -C {dir}; rc=$?; rm -f {b64}; exit $rc",
            dir = shell_quote(&self.workdir),
        )
    }
}

#[async_trait]
impl WorkspaceArchiver for ExecArchiver {
    async fn archive(&self, resource: &ResourceHandle) -> Result<Vec<u8>> {
        let remote_id = self.remote(resource)?;
        let b64 = Self::staging(resource, "b64");
        let tar = Self::staging(resource, "tar");

        let length = self.run(remote_id, "tar", &self.archive_command(&tar, &b64)).await?;
        let length: usize = length
            .trim()
            .parse()
            .map_err(|e| archive_err("staged length", e))?;

        let mut encoded = String::with_capacity(length);
        for index in 0..length.div_ceil(ENCODED_PIECE) {
            let piece = self
                .run(remote_id, "read", &Self::read_piece_command(&b64, index))
                .await?;
            encoded.push_str(piece.trim_end());
        }
        if let Err(e) = self.run(remote_id, "cleanup", &format!("rm -f {}", b64)).await {
            warn!(resource_id = %resource.id, error = %e, "Failed to remove staged archive");
        }

        if encoded.len() != length {
            return Err(TetherError::Archive(format!(
                "read {} of {} staged bytes from {}",
                encoded.len(),
                length,
                remote_id
            )));
        }
        debug!(resource_id = %resource.id, bytes = length, "Archive pulled");
        STANDARD.decode(encoded).map_err(|e| archive_err("decode tar stream", e))
    }

    async fn extract(&self, resource: &ResourceHandle, archive: Vec<u8>) -> Result<()> {
        let remote_id = self.remote(resource)?;
        let b64 = Self::staging(resource, "b64");

        self.run(remote_id, "stage", &format!(": > {}", b64)).await?;
        for piece in archive.chunks(RAW_PIECE) {
            let command = format!("printf '%s' {} >> {}", shell_quote(&STANDARD.encode(piece)), b64);
            self.run(remote_id, "upload", &command).await?;
        }
        debug!(resource_id = %resource.id, bytes = archive.len(), "Archive pushed");

        self.run(remote_id, "extract", &self.extract_command(&b64)).await?;
        Ok(())
    }
}
