use std::{
    fs,
    io::{self, Read},
    path::{Component, Path, PathBuf},
};

use flate2::read::GzDecoder;
use tar::{Archive, Builder};
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
use tokio_util::io::SyncIoBridge;

use crate::{utils::ROOTFS_SUBDIR, DiffApplier, GraphStoreError, GraphStoreResult, LayerStream};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The prefix of a whiteout entry, which marks the deletion of its sibling without the prefix.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// The name of an opaque whiteout entry, which hides everything below it in lower layers.
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const EXPORT_PIPE_CAPACITY: usize = 64 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Applies layer tarballs by unpacking them into `<layer_dir>/fs`.
///
/// Payloads may be plain or gzip compressed tars; compression is detected from the stream's first
/// bytes. Whiteout entries delete what the same archive wrote earlier and are kept on disk as
/// marker files, so the stored diff still records its deletions when it is exported again.
/// Entries with absolute paths or `..` components are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarDiffApplier;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TarDiffApplier {
    /// Creates a tar applier.
    pub fn new() -> Self {
        Self
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait::async_trait]
impl DiffApplier for TarDiffApplier {
    fn name(&self) -> &str {
        "tar"
    }

    async fn apply_diff(&self, layer_dir: &Path, payload: LayerStream) -> GraphStoreResult<u64> {
        let dest = layer_dir.join(ROOTFS_SUBDIR);
        let mut reader = BufReader::new(payload);
        let gzip = reader.fill_buf().await?.starts_with(&GZIP_MAGIC);

        tracing::debug!(
            "unpacking {} layer into {}",
            if gzip { "gzip" } else { "tar" },
            dest.display()
        );

        let bridge = SyncIoBridge::new(reader);
        let size = tokio::task::spawn_blocking(move || unpack(bridge, gzip, &dest))
            .await
            .map_err(GraphStoreError::custom)??;

        Ok(size)
    }

    async fn export_diff(&self, layer_dir: &Path) -> GraphStoreResult<LayerStream> {
        let source = layer_dir.join(ROOTFS_SUBDIR);
        if !tokio::fs::try_exists(&source).await? {
            return Err(GraphStoreError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no layer filesystem at {}", source.display()),
            )));
        }

        let (reader, writer) = tokio::io::duplex(EXPORT_PIPE_CAPACITY);
        let bridge = SyncIoBridge::new(writer);

        tokio::task::spawn_blocking(move || {
            if let Err(e) = pack(&source, bridge) {
                tracing::warn!("layer export from {} stopped: {}", source.display(), e);
            }
        });

        Ok(Box::pin(reader))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn unpack(reader: impl Read, gzip: bool, dest: &Path) -> io::Result<u64> {
    fs::create_dir_all(dest)?;

    if gzip {
        extract(Archive::new(GzDecoder::new(reader)), dest)
    } else {
        extract(Archive::new(reader), dest)
    }
}

fn extract<R: Read>(mut archive: Archive<R>, dest: &Path) -> io::Result<u64> {
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut size = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if !is_safe_path(&path) {
            tracing::warn!("skipping layer entry outside the layer: {}", path.display());
            continue;
        }

        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        if name.starts_with(WHITEOUT_PREFIX) && !apply_whiteout(dest, &path, name)? {
            tracing::warn!("skipping whiteout outside the layer: {}", path.display());
            continue;
        }

        if entry.header().entry_type().is_file() {
            size += entry.size();
        }

        entry.unpack_in(dest)?;
    }

    Ok(size)
}

fn pack(source: &Path, writer: SyncIoBridge<DuplexStream>) -> io::Result<()> {
    let mut builder = Builder::new(writer);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", source)?;
    builder.into_inner()?.shutdown()
}

fn is_safe_path(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Deletes what the whiteout entry at `path` hides. Returns false, touching nothing, if the
/// whiteout would reach outside `dest`.
fn apply_whiteout(dest: &Path, path: &Path, name: &str) -> io::Result<bool> {
    let relative_parent = path.parent().unwrap_or_else(|| Path::new(""));
    let Some(parent) = resolve_within(dest, relative_parent)? else {
        return Ok(false);
    };

    if name == WHITEOUT_OPAQUE {
        clear_dir(&parent)?;
        return Ok(true);
    }

    match &name[WHITEOUT_PREFIX.len()..] {
        "" | "." | ".." => Ok(false),
        target => {
            remove_path(&parent.join(target))?;
            Ok(true)
        }
    }
}

/// Returns `dest/relative` unless one of the directories on the way is a symlink.
fn resolve_within(dest: &Path, relative: &Path) -> io::Result<Option<PathBuf>> {
    let mut current = dest.to_path_buf();
    for component in relative.components() {
        let Component::Normal(part) = component else {
            continue;
        };

        current.push(part);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return Ok(None),
            Ok(_) => {}
            // Nothing below a missing directory can be removed.
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(e),
        }
    }

    Ok(Some(dest.join(relative)))
}

fn clear_dir(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        remove_path(&entry?.path())?;
    }

    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };

    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{write::GzEncoder, Compression};
    use tar::{EntryType, Header};
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    use super::*;

    fn file_header(size: usize) -> Header {
        let mut header = Header::new_gnu();
        header.set_size(size as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        header
    }

    fn tarball(files: &[(&str, &str)]) -> anyhow::Result<Vec<u8>> {
        let mut builder = Builder::new(Vec::new());
        for (path, contents) in files {
            let mut header = file_header(contents.len());
            builder.append_data(&mut header, path, contents.as_bytes())?;
        }
        Ok(builder.into_inner()?)
    }

    fn stream(bytes: Vec<u8>) -> LayerStream {
        Box::pin(std::io::Cursor::new(bytes))
    }

    #[test_log::test(tokio::test)]
    async fn test_tar_apply_plain_tarball() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let payload = tarball(&[("etc/hostname", "layer"), ("bin/tool", "#!/bin/sh\n")])?;

        let size = TarDiffApplier::new()
            .apply_diff(dir.path(), stream(payload))
            .await?;

        assert_eq!(size, 15);
        let rootfs = dir.path().join(ROOTFS_SUBDIR);
        assert_eq!(
            tokio::fs::read_to_string(rootfs.join("etc/hostname")).await?,
            "layer"
        );
        assert!(rootfs.join("bin/tool").exists());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_tar_apply_detects_gzip() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tarball(&[("hello.txt", "hello")])?)?;

        let size = TarDiffApplier::new()
            .apply_diff(dir.path(), stream(encoder.finish()?))
            .await?;

        assert_eq!(size, 5);
        assert_eq!(
            tokio::fs::read_to_string(dir.path().join(ROOTFS_SUBDIR).join("hello.txt")).await?,
            "hello"
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_tar_apply_honors_whiteouts() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let payload = tarball(&[
            ("app/old.conf", "old"),
            ("app/.wh.old.conf", ""),
            ("cache/a", "a"),
            ("cache/b", "b"),
            ("cache/.wh..wh..opq", ""),
            ("cache/c", "c"),
        ])?;

        TarDiffApplier::new()
            .apply_diff(dir.path(), stream(payload))
            .await?;

        let rootfs = dir.path().join(ROOTFS_SUBDIR);
        assert!(!rootfs.join("app/old.conf").exists());
        assert!(rootfs.join("app/.wh.old.conf").exists());
        assert!(!rootfs.join("cache/a").exists());
        assert!(!rootfs.join("cache/b").exists());
        assert!(rootfs.join("cache/.wh..wh..opq").exists());
        assert!(rootfs.join("cache/c").exists());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_tar_apply_skips_escaping_entries() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let layer_dir = dir.path().join("layer");

        let mut builder = Builder::new(Vec::new());
        let mut header = file_header(4);
        let name = b"../evil";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_cksum();
        builder.append(&header, &b"evil"[..])?;
        let mut header = file_header(2);
        builder.append_data(&mut header, "ok", &b"ok"[..])?;

        let size = TarDiffApplier::new()
            .apply_diff(&layer_dir, stream(builder.into_inner()?))
            .await?;

        assert_eq!(size, 2);
        assert!(!dir.path().join("evil").exists());
        assert!(layer_dir.join(ROOTFS_SUBDIR).join("ok").exists());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_tar_apply_whiteout_does_not_follow_symlinks() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let outside = tempdir()?;
        tokio::fs::write(outside.path().join("victim"), "keep").await?;
        tokio::fs::write(outside.path().join("bystander"), "keep").await?;

        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder.append_link(&mut header, "link", outside.path())?;
        for marker in ["link/.wh.victim", "link/.wh..wh..opq"] {
            let mut header = file_header(0);
            builder.append_data(&mut header, marker, &b""[..])?;
        }

        let size = TarDiffApplier::new()
            .apply_diff(dir.path(), stream(builder.into_inner()?))
            .await?;

        assert_eq!(size, 0);
        assert!(outside.path().join("victim").exists());
        assert!(outside.path().join("bystander").exists());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_tar_apply_ignores_whiteouts_of_dot_entries() -> anyhow::Result<()> {
        let dir = tempdir()?;
        tokio::fs::write(dir.path().join("layer.json"), "{}").await?;
        let payload = tarball(&[("a", "a"), (".wh...", ""), (".wh..", ""), ("b/.wh.", "")])?;

        TarDiffApplier::new()
            .apply_diff(dir.path(), stream(payload))
            .await?;

        let rootfs = dir.path().join(ROOTFS_SUBDIR);
        assert!(dir.path().join("layer.json").exists());
        assert!(rootfs.join("a").exists());
        assert!(!rootfs.join(".wh...").exists());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_tar_apply_rejects_garbage() -> anyhow::Result<()> {
        let dir = tempdir()?;

        let result = TarDiffApplier::new()
            .apply_diff(dir.path(), stream(vec![0x42; 1024]))
            .await;

        assert!(result.is_err());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_tar_export_reproduces_layer() -> anyhow::Result<()> {
        let source = tempdir()?;
        let copy = tempdir()?;
        let applier = TarDiffApplier::new();

        applier
            .apply_diff(
                source.path(),
                stream(tarball(&[("etc/motd", "welcome"), ("etc/.wh.issue", "")])?),
            )
            .await?;

        let mut exported = Vec::new();
        applier
            .export_diff(source.path())
            .await?
            .read_to_end(&mut exported)
            .await?;

        let size = applier.apply_diff(copy.path(), stream(exported)).await?;

        assert_eq!(size, 7);
        let rootfs = copy.path().join(ROOTFS_SUBDIR);
        assert_eq!(
            tokio::fs::read_to_string(rootfs.join("etc/motd")).await?,
            "welcome"
        );
        assert!(rootfs.join("etc/.wh.issue").exists());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_tar_export_without_filesystem_fails() -> anyhow::Result<()> {
        let dir = tempdir()?;

        let result = TarDiffApplier::new().export_diff(dir.path()).await;

        assert!(matches!(result, Err(GraphStoreError::Io(_))));
        Ok(())
    }
}
