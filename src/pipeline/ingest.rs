//! Ingest stage: fetch a source package and lay it out on disk.
//!
//! Sources are either `http(s)` URLs or local paths. Archives (`.zip`,
//! `.tar.gz` or plain `.tar`) are unpacked; local directories are copied
//! as-is.

use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::storage::compute_checksum;

/// Largest archive the ingester will download.
pub const DEFAULT_MAX_ARCHIVE_BYTES: u64 = 512 * 1024 * 1024;

/// Largest total size an archive may expand to.
pub const DEFAULT_MAX_UNPACKED_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Download timeout.
const DOWNLOAD_TIMEOUT_SECS: u64 = 300;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];
const TAR_MAGIC_OFFSET: usize = 257;

/// Errors that can occur while ingesting a source package.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("Source not found: {0}")]
    NotFound(String),

    #[error("Archive is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("Unsupported archive format for {0}")]
    UnsupportedFormat(String),

    #[error("Failed to unpack archive: {0}")]
    Unpack(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A source tree laid out on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedSource {
    /// Directory to analyse.
    pub root: PathBuf,
    /// SHA-256 of the archive bytes; `None` for copied directories.
    pub checksum: Option<String>,
}

/// Capability for turning a source location into a local source tree.
#[async_trait]
pub trait Ingester: Send + Sync {
    /// Places the source at `location` under `dest`.
    async fn ingest(&self, location: &str, dest: &Path) -> Result<IngestedSource, IngestError>;
}

/// Ingests from http(s) URLs and local paths.
#[derive(Debug, Clone)]
pub struct SourceIngester {
    client: Client,
    max_bytes: u64,
    max_unpacked_bytes: u64,
}

impl Default for SourceIngester {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceIngester {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            max_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
            max_unpacked_bytes: DEFAULT_MAX_UNPACKED_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_max_unpacked_bytes(mut self, max_unpacked_bytes: u64) -> Self {
        self.max_unpacked_bytes = max_unpacked_bytes;
        self
    }

    /// Downloads `url`, giving up as soon as the body passes `max_bytes`.
    async fn download(&self, url: &str) -> Result<Vec<u8>, IngestError> {
        let download_err = |reason: String| IngestError::Download {
            url: url.to_string(),
            reason,
        };

        let mut response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| download_err(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(download_err(format!("server returned {}", status)));
        }
        if let Some(len) = response.content_length() {
            self.check_size(len)?;
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| download_err(e.to_string()))?
        {
            self.check_size((bytes.len() + chunk.len()) as u64)?;
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }

    fn check_size(&self, size: u64) -> Result<(), IngestError> {
        if size > self.max_bytes {
            return Err(IngestError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    async fn unpack_archive(
        &self,
        bytes: Vec<u8>,
        location: &str,
        dest: &Path,
    ) -> Result<IngestedSource, IngestError> {
        let checksum = compute_checksum(&bytes);
        let location = location.to_string();
        let dest = dest.to_path_buf();
        let limit = self.max_unpacked_bytes;
        let root = tokio::task::spawn_blocking(move || unpack_into(&bytes, &location, &dest, limit))
            .await
            .map_err(|e| IngestError::Unpack(e.to_string()))??;

        Ok(IngestedSource {
            root,
            checksum: Some(checksum),
        })
    }
}

#[async_trait]
impl Ingester for SourceIngester {
    async fn ingest(&self, location: &str, dest: &Path) -> Result<IngestedSource, IngestError> {
        if is_remote(location) {
            info!(url = %location, "Downloading source archive");
            let bytes = self.download(location).await?;
            return self.unpack_archive(bytes, location, dest).await;
        }

        let path = PathBuf::from(location);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| IngestError::NotFound(location.to_string()))?;

        if meta.is_dir() {
            debug!(path = %path.display(), "Copying source directory");
            let dest = dest.to_path_buf();
            let root = tokio::task::spawn_blocking(move || copy_tree(&path, &dest))
                .await
                .map_err(|e| IngestError::Unpack(e.to_string()))??;
            return Ok(IngestedSource {
                root,
                checksum: None,
            });
        }

        self.check_size(meta.len())?;
        let bytes = tokio::fs::read(&path).await?;
        self.unpack_archive(bytes, location, dest).await
    }
}

fn is_remote(location: &str) -> bool {
    let lower = location.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Unpacks a zip, gzip-compressed tar or plain tar archive into `dest`.
///
/// Entries that would land outside `dest` are skipped. Unpacking fails once
/// more than `limit` bytes have been expanded.
fn unpack_into(
    bytes: &[u8],
    location: &str,
    dest: &Path,
    limit: u64,
) -> Result<PathBuf, IngestError> {
    fs::create_dir_all(dest)?;

    if bytes.starts_with(&ZIP_MAGIC) {
        unpack_zip(bytes, dest, limit)?;
    } else if bytes.starts_with(&GZIP_MAGIC) {
        unpack_tar(LimitedReader::new(GzDecoder::new(Cursor::new(bytes)), limit), dest)?;
    } else if is_tar(bytes) {
        unpack_tar(LimitedReader::new(Cursor::new(bytes), limit), dest)?;
    } else {
        return Err(IngestError::UnsupportedFormat(location.to_string()));
    }

    source_root(dest)
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<(), IngestError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(false);
    archive
        .unpack(dest)
        .map_err(|e| IngestError::Unpack(e.to_string()))
}

fn unpack_zip(bytes: &[u8], dest: &Path, limit: u64) -> Result<(), IngestError> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| IngestError::Unpack(e.to_string()))?;
    let mut remaining = limit;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| IngestError::Unpack(e.to_string()))?;
        let target = match entry.enclosed_name() {
            Some(relative) => dest.join(relative),
            None => {
                debug!(entry = %entry.name(), "Skipping zip entry outside the destination");
                continue;
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut limited = LimitedReader::new(&mut entry, remaining);
        let mut file = fs::File::create(&target)?;
        io::copy(&mut limited, &mut file).map_err(|e| IngestError::Unpack(e.to_string()))?;
        remaining = limited.remaining;
    }
    Ok(())
}

/// Reader that fails once more than a fixed number of bytes pass through.
struct LimitedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R> LimitedReader<R> {
    fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }
}

impl<R: Read> Read for LimitedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.remaining = self
            .remaining
            .checked_sub(read as u64)
            .ok_or_else(|| io::Error::other("archive expands beyond the unpacked size limit"))?;
        Ok(read)
    }
}

fn is_tar(bytes: &[u8]) -> bool {
    bytes
        .get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5)
        .is_some_and(|magic| magic == b"ustar")
}

/// Package archives usually wrap everything in one top-level directory;
/// analyse that directory rather than its parent.
fn source_root(dest: &Path) -> Result<PathBuf, IngestError> {
    let mut entries = fs::read_dir(dest)?.collect::<Result<Vec<_>, _>>()?;
    if entries.len() == 1 && entries[0].file_type()?.is_dir() {
        if let Some(only) = entries.pop() {
            return Ok(only.path());
        }
    }
    Ok(dest.to_path_buf())
}

fn copy_tree(src: &Path, dest: &Path) -> Result<PathBuf, IngestError> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| IngestError::Unpack(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| IngestError::Unpack(e.to_string()))?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(dest.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use zip::write::SimpleFileOptions;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn plugin_tar_gz() -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let body = b"<?php echo 'hello';\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "my-plugin/my-plugin.php", &body[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn plugin_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    /// Serves `body` once with chunked transfer encoding and no length.
    async fn serve_chunked(body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
                .await;
            for chunk in body.chunks(1024) {
                let frame = format!("{:x}\r\n", chunk.len());
                if socket.write_all(frame.as_bytes()).await.is_err()
                    || socket.write_all(chunk).await.is_err()
                    || socket.write_all(b"\r\n").await.is_err()
                {
                    return;
                }
            }
            let _ = socket.write_all(b"0\r\n\r\n").await;
        });
        format!("http://{}/plugin.tar.gz", addr)
    }

    #[tokio::test]
    async fn test_ingest_local_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("plugin.tar.gz");
        let bytes = plugin_tar_gz();
        std::fs::write(&archive, &bytes).unwrap();
        let dest = dir.path().join("out");

        let source = SourceIngester::new()
            .ingest(archive.to_str().unwrap(), &dest)
            .await
            .unwrap();

        assert_eq!(source.root, dest.join("my-plugin"));
        assert!(source.root.join("my-plugin.php").is_file());
        assert_eq!(source.checksum, Some(compute_checksum(&bytes)));
    }

    #[tokio::test]
    async fn test_ingest_local_directory() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("inc")).unwrap();
        std::fs::write(src.join("main.php"), "<?php").unwrap();
        std::fs::write(src.join("inc/util.php"), "<?php").unwrap();
        let dest = dir.path().join("out");

        let source = SourceIngester::new()
            .ingest(src.to_str().unwrap(), &dest)
            .await
            .unwrap();

        assert_eq!(source.root, dest);
        assert!(source.checksum.is_none());
        assert!(dest.join("main.php").is_file());
        assert!(dest.join("inc/util.php").is_file());
    }

    #[tokio::test]
    async fn test_ingest_remote_archive() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/plugin.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(plugin_tar_gz()))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();

        let source = SourceIngester::new()
            .ingest(&format!("{}/plugin.tar.gz", server.uri()), dir.path())
            .await
            .unwrap();

        assert!(source.root.join("my-plugin.php").is_file());
        assert!(source.checksum.is_some());
    }

    #[tokio::test]
    async fn test_ingest_remote_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();

        let result = SourceIngester::new()
            .ingest(&format!("{}/missing.tar.gz", server.uri()), dir.path())
            .await;
        assert!(matches!(result, Err(IngestError::Download { .. })));
    }

    #[tokio::test]
    async fn test_ingest_rejects_unknown_format_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plugin.rar");
        std::fs::write(&file, b"Rar! definitely not a supported archive").unwrap();

        let result = SourceIngester::new()
            .ingest(file.to_str().unwrap(), &dir.path().join("a"))
            .await;
        assert!(matches!(result, Err(IngestError::UnsupportedFormat(_))));

        let result = SourceIngester::new()
            .with_max_bytes(4)
            .ingest(file.to_str().unwrap(), &dir.path().join("b"))
            .await;
        assert!(matches!(result, Err(IngestError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn test_ingest_remote_zip() {
        let bytes = plugin_zip(&[
            ("my-theme/style.css", "/* Theme Name: Demo */"),
            ("my-theme/functions.php", "<?php"),
        ]);
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/test.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes.clone()))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();

        let source = SourceIngester::new()
            .ingest(&format!("{}/test.zip", server.uri()), dir.path())
            .await
            .unwrap();

        assert_eq!(source.root, dir.path().join("my-theme"));
        assert!(source.root.join("functions.php").is_file());
        assert_eq!(source.checksum, Some(compute_checksum(&bytes)));
    }

    #[tokio::test]
    async fn test_zip_entries_cannot_escape_destination() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        std::fs::write(
            &archive,
            plugin_zip(&[("../escaped.php", "<?php"), ("ok.php", "<?php")]),
        )
        .unwrap();
        let dest = dir.path().join("out");

        let source = SourceIngester::new()
            .ingest(archive.to_str().unwrap(), &dest)
            .await
            .unwrap();

        assert!(source.root.join("ok.php").is_file());
        assert!(!dir.path().join("escaped.php").exists());
    }

    #[tokio::test]
    async fn test_unpacked_size_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let zip_file = dir.path().join("big.zip");
        let padding = " ".repeat(4096);
        std::fs::write(&zip_file, plugin_zip(&[("big.php", padding.as_str())])).unwrap();
        let tar_file = dir.path().join("plugin.tar.gz");
        std::fs::write(&tar_file, plugin_tar_gz()).unwrap();

        let ingester = SourceIngester::new().with_max_unpacked_bytes(512);
        let zip_result = ingester
            .ingest(zip_file.to_str().unwrap(), &dir.path().join("z"))
            .await;
        assert!(matches!(zip_result, Err(IngestError::Unpack(_))));

        let tar_result = ingester
            .ingest(tar_file.to_str().unwrap(), &dir.path().join("t"))
            .await;
        assert!(matches!(tar_result, Err(IngestError::Unpack(_))));
    }

    #[tokio::test]
    async fn test_chunked_download_stops_at_limit() {
        let url = serve_chunked(vec![0u8; 64 * 1024]).await;
        let dir = tempfile::tempdir().unwrap();

        let result = SourceIngester::new()
            .with_max_bytes(8 * 1024)
            .ingest(&url, dir.path())
            .await;

        match result {
            Err(IngestError::TooLarge { size, limit }) => {
                assert_eq!(limit, 8 * 1024);
                assert!(size < 64 * 1024);
            }
            other => panic!("expected TooLarge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ingest_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let result = SourceIngester::new()
            .ingest("/definitely/not/here.tar.gz", dir.path())
            .await;
        assert!(matches!(result, Err(IngestError::NotFound(_))));
    }

    #[test]
    fn test_is_remote() {
        assert!(is_remote("https://example.org/a.tar.gz"));
        assert!(is_remote("HTTP://example.org/a.tar.gz"));
        assert!(!is_remote("./a.tar.gz"));
    }
}
