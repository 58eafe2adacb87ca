//! Tar content streams for copying files into containers.
//!
//! A [`Content`] is a lazy, single-pass tar archive that places one regular
//! file at an absolute target path. The archive begins with directory entries
//! for every path component (mode 0755) followed by the file entry itself
//! (mode 0644). Extraction at `/` therefore materializes the full path even
//! when the parent directories do not yet exist; the engine ignores
//! duplicate directory entries.

use std::io::Read;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;

use crate::error::{Error, Result};

const PIPE_CAPACITY: usize = 64 * 1024;

/// A lazy tar stream addressed to one absolute in-container path.
///
/// The producer runs concurrently from construction, so the first read is
/// valid immediately. The stream is single-pass and not restartable.
pub struct Content {
    target: String,
    size: u64,
    reader: DuplexStream,
    producer: JoinHandle<Result<()>>,
}

impl Content {
    /// Create a content stream from a synchronous reader of known size.
    ///
    /// `target` must be an absolute path; it is cleaned to forward slashes
    /// with `.` components removed. `..` components are rejected.
    pub fn new(
        source: Box<dyn Read + Send + 'static>,
        size: u64,
        target: impl AsRef<str>,
    ) -> Result<Self> {
        let components = clean_target(target.as_ref())?;
        let target = format!("/{}", components.join("/"));

        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
        let bridge = SyncIoBridge::new(writer);
        let producer =
            tokio::task::spawn_blocking(move || produce(bridge, source, &components, size));

        Ok(Self {
            target,
            size,
            reader,
            producer,
        })
    }

    /// Content from an in-memory string
    pub fn from_string(data: impl Into<String>, target: impl AsRef<str>) -> Result<Self> {
        let data = data.into().into_bytes();
        Self::from_bytes(data, target)
    }

    /// Content from in-memory bytes
    pub fn from_bytes(data: Vec<u8>, target: impl AsRef<str>) -> Result<Self> {
        let size = data.len() as u64;
        Self::new(Box::new(std::io::Cursor::new(data)), size, target)
    }

    /// The cleaned absolute target path
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Size of the file payload in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Drain the stream into a full tar archive, surfacing producer errors.
    pub async fn into_bytes(mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.reader.read_to_end(&mut buf).await?;
        match self.producer.await {
            Ok(result) => result?,
            Err(join) => {
                return Err(Error::transport(
                    "content producer",
                    format!("producer task failed: {join}"),
                ))
            }
        }
        Ok(buf)
    }
}

impl AsyncRead for Content {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl std::fmt::Debug for Content {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Content")
            .field("target", &self.target)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

fn produce(
    writer: SyncIoBridge<DuplexStream>,
    mut source: Box<dyn Read + Send + 'static>,
    components: &[String],
    size: u64,
) -> Result<()> {
    let mut builder = tar::Builder::new(writer);

    // Parent directory entries first, outermost inward.
    let mut path = String::new();
    for component in &components[..components.len() - 1] {
        path.push_str(component);
        path.push('/');
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        header.set_mtime(0);
        builder.append_data(&mut header, path.as_str(), std::io::empty())?;
    }

    let file_path = components.join("/");
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(size);
    header.set_mtime(0);
    builder.append_data(&mut header, file_path.as_str(), &mut source)?;

    builder.into_inner()?;
    Ok(())
}

/// Decode a tar archive into its regular files, keyed by entry path.
pub fn untar_files(archive: &[u8]) -> Result<std::collections::HashMap<String, Vec<u8>>> {
    let mut files = std::collections::HashMap::new();
    let mut reader = tar::Archive::new(std::io::Cursor::new(archive));
    for entry in reader.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let path = entry.path()?.to_string_lossy().to_string();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        files.insert(path, data);
    }
    Ok(files)
}

/// Clean an absolute target path into its components.
///
/// Rejects relative paths and parent traversal; normalizes away `.` and
/// repeated separators. Backslashes are treated as separators so Windows
/// callers produce the same in-container path.
pub(crate) fn clean_target(target: &str) -> Result<Vec<String>> {
    let normalized = target.replace('\\', "/");
    if !normalized.starts_with('/') {
        return Err(Error::invalid_config(format!(
            "target path {target:?} is not absolute"
        )));
    }
    let mut components = Vec::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                return Err(Error::invalid_config(format!(
                    "target path {target:?} escapes the root"
                )))
            }
            other => components.push(other.to_string()),
        }
    }
    if components.is_empty() {
        return Err(Error::invalid_config(format!(
            "target path {target:?} names no file"
        )));
    }
    Ok(components)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(archive: &[u8]) -> Vec<(String, tar::EntryType, u32, Vec<u8>)> {
        let mut result = Vec::new();
        let mut reader = tar::Archive::new(std::io::Cursor::new(archive));
        for entry in reader.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            let kind = entry.header().entry_type();
            let mode = entry.header().mode().unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            result.push((path, kind, mode, data));
        }
        result
    }

    #[tokio::test]
    async fn test_single_file_with_directory_entries() {
        let content = Content::from_string("test", "/tmp/x").unwrap();
        assert_eq!(content.target(), "/tmp/x");
        assert_eq!(content.size(), 4);

        let archive = content.into_bytes().await.unwrap();
        let entries = entries(&archive);
        assert_eq!(entries.len(), 2);

        let (dir, dir_kind, dir_mode, _) = &entries[0];
        assert_eq!(dir, "tmp/");
        assert_eq!(*dir_kind, tar::EntryType::Directory);
        assert_eq!(*dir_mode, 0o755);

        let (file, file_kind, file_mode, data) = &entries[1];
        assert_eq!(file, "tmp/x");
        assert_eq!(*file_kind, tar::EntryType::Regular);
        assert_eq!(*file_mode, 0o644);
        assert_eq!(data, b"test");
    }

    #[tokio::test]
    async fn test_nested_directories_precede_file() {
        let content = Content::from_string("v", "/etc/docker/certs.d/ca.pem").unwrap();
        let archive = content.into_bytes().await.unwrap();
        let names: Vec<String> = entries(&archive).into_iter().map(|(p, ..)| p).collect();
        assert_eq!(
            names,
            vec!["etc/", "etc/docker/", "etc/docker/certs.d/", "etc/docker/certs.d/ca.pem"]
        );
    }

    #[tokio::test]
    async fn test_relative_target_rejected() {
        let err = Content::from_string("x", "relative/path").unwrap_err();
        assert!(err.to_string().contains("not absolute"));
    }

    #[tokio::test]
    async fn test_parent_traversal_rejected() {
        let err = Content::from_string("x", "/tmp/../etc/passwd").unwrap_err();
        assert!(err.to_string().contains("escapes the root"));
    }

    #[tokio::test]
    async fn test_path_cleaning() {
        let content = Content::from_string("x", "//tmp/./sub//file").unwrap();
        assert_eq!(content.target(), "/tmp/sub/file");
    }

    #[tokio::test]
    async fn test_first_read_valid_immediately() {
        let mut content = Content::from_string("payload", "/tmp/a").unwrap();
        let mut first = [0u8; 512];
        content.read_exact(&mut first).await.unwrap();
        // First header block names the parent directory.
        assert!(first.starts_with(b"tmp/"));
    }
}
