//! Zip archive expansion
//!
//! An uploaded zip is spooled to scratch disk, extracted on a blocking thread
//! into `hakobu-zip-<uuid>/`, walked into one [`StagedFile`] per leaf, and
//! removed once the leaves are uploaded.
//!
//! Entry names are decoded with a caller-chosen `encoding_rs` label. Entries
//! flagged as UTF-8 in the archive are always read as UTF-8, other names are
//! decoded with the given encoding (`gbk` for archives built on Chinese
//! Windows).
//!
//! Traversal and removal use explicit stacks, so deep trees cannot overflow
//! the call stack.

use super::key::{generate_key, join_prefix, KeyStyle};
use super::staging::StagedFile;
use super::UploadError;
use encoding_rs::Encoding;
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWriteExt};

/// Resolve an encoding label such as `utf-8` or `gbk`
pub fn encoding_for_label(label: &str) -> Result<&'static Encoding, UploadError> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| UploadError::ArchiveCorrupt(format!("unknown entry name encoding '{label}'")))
}

/// Scratch directory holding an extracted archive.
///
/// The directory is removed by [`ExtractedTree::remove`] or, failing that,
/// when the value is dropped.
#[derive(Debug)]
pub struct ExtractedTree {
    root: PathBuf,
    files: usize,
    removed: bool,
}

impl ExtractedTree {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Regular files extracted
    pub fn file_count(&self) -> usize {
        self.files
    }

    pub async fn remove(mut self) -> io::Result<()> {
        self.removed = true;
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || remove_tree(&root))
            .await
            .map_err(io::Error::other)?
    }
}

impl Drop for ExtractedTree {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = remove_tree(&self.root) {
            tracing::warn!(root = %self.root.display(), error = %e, "Failed to remove extracted archive");
        }
    }
}

/// Spool `source` to disk and extract it under `scratch_root`.
///
/// Any failure yields [`UploadError::ArchiveCorrupt`] and leaves nothing
/// behind.
pub async fn expand<R>(
    mut source: R,
    encoding: &'static Encoding,
    scratch_root: &Path,
) -> Result<ExtractedTree, UploadError>
where
    R: AsyncRead + Unpin,
{
    let id = uuid::Uuid::new_v4();
    let spool = scratch_root.join(format!("hakobu-zip-{id}.zip"));
    let root = scratch_root.join(format!("hakobu-zip-{id}"));

    let spooled = async {
        tokio::fs::create_dir_all(scratch_root).await?;
        let mut file = tokio::fs::File::create(&spool).await?;
        let bytes = tokio::io::copy(&mut source, &mut file).await?;
        file.flush().await?;
        Ok::<u64, io::Error>(bytes)
    }
    .await;

    let result = match spooled {
        Ok(bytes) => {
            tracing::debug!(spool = %spool.display(), bytes, "Archive spooled");
            let (archive, target) = (spool.clone(), root.clone());
            tokio::task::spawn_blocking(move || extract_all(&archive, &target, encoding))
                .await
                .unwrap_or_else(|e| Err(format!("extraction task failed: {e}")))
        }
        Err(e) => Err(format!("failed to spool archive: {e}")),
    };

    if let Err(e) = tokio::fs::remove_file(&spool).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(spool = %spool.display(), error = %e, "Failed to remove archive spool");
        }
    }

    match result {
        Ok(files) => {
            tracing::info!(root = %root.display(), files, encoding = encoding.name(), "Archive extracted");
            crate::metrics::record_archive_entries(files);
            Ok(ExtractedTree {
                root,
                files,
                removed: false,
            })
        }
        Err(message) => {
            let partial = root.clone();
            let cleanup = tokio::task::spawn_blocking(move || remove_tree(&partial)).await;
            if let Ok(Err(e)) = cleanup {
                tracing::warn!(root = %root.display(), error = %e, "Failed to remove partial extraction");
            }
            crate::metrics::record_error("archive_corrupt");
            Err(UploadError::ArchiveCorrupt(message))
        }
    }
}

/// Extract every entry of `archive_path` under `root`; returns the number of
/// regular files written.
fn extract_all(archive_path: &Path, root: &Path, encoding: &'static Encoding) -> Result<usize, String> {
    let file = std::fs::File::open(archive_path).map_err(|e| e.to_string())?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| e.to_string())?;
    std::fs::create_dir_all(root).map_err(|e| e.to_string())?;

    let mut files = 0;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| e.to_string())?;
        let name = decode_entry_name(entry.name_raw(), entry.name(), encoding);
        let relative = sanitize_entry_path(&name)
            .ok_or_else(|| format!("entry '{name}' escapes the archive root"))?;
        let target = root.join(&relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| e.to_string())?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let mut out = std::fs::File::create(&target).map_err(|e| format!("{name}: {e}"))?;
        io::copy(&mut entry, &mut out).map_err(|e| format!("{name}: {e}"))?;
        files += 1;
    }

    Ok(files)
}

/// Decode a raw entry name.
///
/// `zip_name` is the zip crate's own decoding (UTF-8 when the entry carries
/// the UTF-8 flag, CP437 otherwise); agreeing with a UTF-8 reading of the raw
/// bytes means the name is UTF-8 or plain ASCII.
fn decode_entry_name(raw: &[u8], zip_name: &str, encoding: &'static Encoding) -> String {
    if let Ok(utf8) = std::str::from_utf8(raw) {
        if utf8 == zip_name || encoding == encoding_rs::UTF_8 {
            return utf8.to_string();
        }
    }
    let (decoded, _, had_errors) = encoding.decode(raw);
    if had_errors {
        tracing::debug!(encoding = encoding.name(), "Entry name had undecodable bytes");
    }
    decoded.into_owned()
}

/// Relative path for an entry name, `None` if it is empty or leaves the root
fn sanitize_entry_path(name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    let mut path = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    (!path.as_os_str().is_empty()).then_some(path)
}

/// Walk `root` depth-first and stage every regular file.
///
/// Keys are `upload_prefix` plus the directory path of the file, ending in a
/// [`KeyStyle::Long`] token with the file's extension. Siblings are visited in
/// name order.
pub fn traverse(root: &Path, upload_prefix: &str) -> io::Result<Vec<StagedFile>> {
    let mut staged = Vec::new();
    let mut stack = vec![(root.to_path_buf(), join_prefix(&[upload_prefix]))];

    while let Some((dir, prefix)) = stack.pop() {
        let mut entries = std::fs::read_dir(&dir)?.collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        let mut subdirs = Vec::new();
        for entry in entries {
            let file_type = entry.file_type()?;
            let name = entry.file_name().to_string_lossy().into_owned();

            if file_type.is_dir() {
                subdirs.push((entry.path(), join_prefix(&[&prefix, &name])));
            } else if file_type.is_file() {
                let size = entry.metadata()?.len();
                let key = generate_key(&prefix, &name, KeyStyle::Long);
                staged.push(StagedFile::retained(entry.path(), key, size));
            }
        }

        // Reversed so the first subdirectory is popped next
        stack.extend(subdirs.into_iter().rev());
    }

    Ok(staged)
}

/// Remove `root` and everything below it, children before parents.
/// A missing root is not an error.
pub fn remove_tree(root: &Path) -> io::Result<()> {
    let meta = match std::fs::symlink_metadata(root) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !meta.is_dir() {
        return std::fs::remove_file(root);
    }

    let mut stack = vec![(root.to_path_buf(), false)];
    while let Some((dir, children_done)) = stack.pop() {
        if children_done {
            std::fs::remove_dir(&dir)?;
            continue;
        }

        stack.push((dir.clone(), true));
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                stack.push((entry.path(), false));
            } else {
                std::fs::remove_file(entry.path())?;
            }
        }
    }

    Ok(())
}
