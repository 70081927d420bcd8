//! Filesystem-backed SFTP request handler.
//!
//! Client paths are virtual: `/` is the configured root and `..` never
//! climbs above it. Paths are normalized lexically before they touch the
//! filesystem.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::observability::diagnostics::DiagnosticSink;
use crate::server::AccessMode;

/// Largest read served in one reply.
const MAX_READ_LEN: u32 = 256 * 1024;

enum OpenHandle {
    File(tokio::fs::File),
    Dir { path: PathBuf, listed: bool },
}

/// Serves one SFTP session against a directory tree.
pub struct FsHandler {
    root: PathBuf,
    mode: AccessMode,
    diagnostics: DiagnosticSink,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
}

impl FsHandler {
    pub fn new(root: impl Into<PathBuf>, mode: AccessMode, diagnostics: DiagnosticSink) -> Self {
        Self {
            root: root.into(),
            mode,
            diagnostics,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    /// Map a client path to a host path under the root.
    fn resolve(&self, path: &str) -> PathBuf {
        let virtual_path = normalize(path);
        self.root.join(virtual_path.trim_start_matches('/'))
    }

    /// Map a link's stored target back to a virtual path.
    ///
    /// `None` when an absolute target points outside the root.
    fn virtual_target(&self, link: &str, target: &Path) -> Option<String> {
        if target.is_absolute() {
            let inside = target.strip_prefix(&self.root).ok()?;
            return Some(normalize(&inside.to_string_lossy()));
        }
        let link = normalize(link);
        let dir = link.rsplit_once('/').map_or("", |(dir, _)| dir);
        Some(normalize(&format!("{}/{}", dir, target.to_string_lossy())))
    }

    fn ensure_writable(&self, op: &str) -> Result<(), StatusCode> {
        if self.mode.is_read_only() {
            self.diagnostics.emit(format_args!("{}: denied, read-only", op));
            return Err(StatusCode::PermissionDenied);
        }
        Ok(())
    }

    fn insert(&mut self, handle: OpenHandle) -> String {
        let key = format!("h{}", self.next_handle);
        self.next_handle += 1;
        self.handles.insert(key.clone(), handle);
        key
    }

    fn file_mut(&mut self, handle: &str) -> Result<&mut tokio::fs::File, StatusCode> {
        match self.handles.get_mut(handle) {
            Some(OpenHandle::File(file)) => Ok(file),
            _ => Err(StatusCode::Failure),
        }
    }
}

/// Lexically normalize a client path into an absolute virtual path.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Path of virtual `target` as seen from the directory holding virtual `link`.
///
/// Links are stored relative so they resolve the same way on the host as
/// they do for the client.
fn relative_target(link: &str, target: &str) -> PathBuf {
    let mut link_dir: Vec<&str> = link.split('/').filter(|p| !p.is_empty()).collect();
    link_dir.pop();
    let target: Vec<&str> = target.split('/').filter(|p| !p.is_empty()).collect();

    let shared = link_dir
        .iter()
        .zip(&target)
        .take_while(|(a, b)| a == b)
        .count();
    let mut relative = PathBuf::new();
    for _ in shared..link_dir.len() {
        relative.push("..");
    }
    for part in &target[shared..] {
        relative.push(part);
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    relative
}

/// Translate an I/O failure into the closest SFTP status.
pub fn status_for(err: &io::Error) -> StatusCode {
    match err.kind() {
        io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn io_status(err: io::Error) -> StatusCode {
    status_for(&err)
}

fn ok(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

fn opens_for_write(flags: OpenFlags) -> bool {
    flags.intersects(
        OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::CREATE | OpenFlags::TRUNCATE,
    )
}

async fn apply_attrs(path: &Path, attrs: &FileAttributes) -> io::Result<()> {
    if let Some(size) = attrs.size {
        let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(size).await?;
    }
    #[cfg(unix)]
    if let Some(mode) = attrs.permissions {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777)).await?;
    }
    Ok(())
}

impl russh_sftp::server::Handler for FsHandler {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        self.diagnostics.emit(format_args!("init: client version {}", version));
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        self.diagnostics.emit(format_args!("open: {} {:?}", filename, pflags));
        if opens_for_write(pflags) {
            self.ensure_writable("open")?;
        }

        let options: std::fs::OpenOptions = pflags.into();
        let file = tokio::fs::OpenOptions::from(options)
            .open(self.resolve(&filename))
            .await
            .map_err(io_status)?;

        let handle = self.insert(OpenHandle::File(file));
        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(OpenHandle::File(mut file)) => {
                file.flush().await.map_err(io_status)?;
                Ok(ok(id))
            }
            Some(OpenHandle::Dir { .. }) => Ok(ok(id)),
            None => Err(StatusCode::Failure),
        }
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let file = self.file_mut(&handle)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(io_status)?;

        let mut data = vec![0u8; len.min(MAX_READ_LEN) as usize];
        let mut filled = 0;
        while filled < data.len() {
            let n = file.read(&mut data[filled..]).await.map_err(io_status)?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 && !data.is_empty() {
            return Err(StatusCode::Eof);
        }
        data.truncate(filled);
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        self.ensure_writable("write")?;
        let file = self.file_mut(&handle)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(io_status)?;
        file.write_all(&data).await.map_err(io_status)?;
        Ok(ok(id))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let metadata = tokio::fs::symlink_metadata(self.resolve(&path)).await.map_err(io_status)?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let metadata = tokio::fs::metadata(self.resolve(&path)).await.map_err(io_status)?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let metadata = match self.handles.get(&handle) {
            Some(OpenHandle::File(file)) => file.metadata().await,
            Some(OpenHandle::Dir { path, .. }) => tokio::fs::metadata(path).await,
            None => return Err(StatusCode::Failure),
        }
        .map_err(io_status)?;

        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.ensure_writable("setstat")?;
        apply_attrs(&self.resolve(&path), &attrs).await.map_err(io_status)?;
        Ok(ok(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.ensure_writable("fsetstat")?;
        let file = self.file_mut(&handle)?;
        if let Some(size) = attrs.size {
            file.set_len(size).await.map_err(io_status)?;
        }
        #[cfg(unix)]
        if let Some(mode) = attrs.permissions {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(mode & 0o7777))
                .await
                .map_err(io_status)?;
        }
        Ok(ok(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        self.diagnostics.emit(format_args!("opendir: {}", path));
        let resolved = self.resolve(&path);
        let metadata = tokio::fs::metadata(&resolved).await.map_err(io_status)?;
        if !metadata.is_dir() {
            return Err(StatusCode::NoSuchFile);
        }

        let handle = self.insert(OpenHandle::Dir {
            path: resolved,
            listed: false,
        });
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let path = match self.handles.get_mut(&handle) {
            Some(OpenHandle::Dir { listed: true, .. }) => return Err(StatusCode::Eof),
            Some(OpenHandle::Dir { path, listed }) => {
                *listed = true;
                path.clone()
            }
            _ => return Err(StatusCode::Failure),
        };

        let mut entries = tokio::fs::read_dir(&path).await.map_err(io_status)?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_status)? {
            // Entries can vanish between listing and stat.
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            files.push(File::new(
                entry.file_name().to_string_lossy().into_owned(),
                FileAttributes::from(&metadata),
            ));
        }

        if files.is_empty() {
            return Err(StatusCode::Eof);
        }
        Ok(Name { id, files })
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        self.ensure_writable("remove")?;
        tokio::fs::remove_file(self.resolve(&filename)).await.map_err(io_status)?;
        Ok(ok(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.ensure_writable("mkdir")?;
        tokio::fs::create_dir(self.resolve(&path)).await.map_err(io_status)?;
        Ok(ok(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        self.ensure_writable("rmdir")?;
        tokio::fs::remove_dir(self.resolve(&path)).await.map_err(io_status)?;
        Ok(ok(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        Ok(Name {
            id,
            files: vec![File::dummy(normalize(&path))],
        })
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        self.ensure_writable("rename")?;
        tokio::fs::rename(self.resolve(&oldpath), self.resolve(&newpath))
            .await
            .map_err(io_status)?;
        Ok(ok(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let target = tokio::fs::read_link(self.resolve(&path))
            .await
            .map_err(io_status)?;
        let Some(target) = self.virtual_target(&path, &target) else {
            self.diagnostics
                .emit(format_args!("readlink: {} points outside the root", path));
            return Err(StatusCode::PermissionDenied);
        };
        Ok(Name {
            id,
            files: vec![File::dummy(target)],
        })
    }

    #[cfg(unix)]
    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        self.ensure_writable("symlink")?;
        let link = normalize(&linkpath);
        let target = relative_target(&link, &normalize(&targetpath));
        tokio::fs::symlink(target, self.resolve(&link))
            .await
            .map_err(io_status)?;
        Ok(ok(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_sftp::server::Handler;

    fn handler(root: &Path, mode: AccessMode) -> FsHandler {
        FsHandler::new(root, mode, DiagnosticSink::discard())
    }

    #[test]
    fn normalize_clamps_to_root() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("."), "/");
        assert_eq!(normalize("a/./b/"), "/a/b");
        assert_eq!(normalize("/a/../../etc/passwd"), "/etc/passwd");
        assert_eq!(normalize("../../.."), "/");
    }

    #[test]
    fn resolve_stays_under_root() {
        let handler = handler(Path::new("/srv/data"), AccessMode::ReadOnly);
        assert_eq!(handler.resolve("../../etc"), PathBuf::from("/srv/data/etc"));
        assert_eq!(handler.resolve("/"), PathBuf::from("/srv/data/"));
    }

    #[test]
    fn io_errors_map_to_status_codes() {
        let not_found = io::Error::from(io::ErrorKind::NotFound);
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        let other = io::Error::other("disk on fire");
        assert_eq!(status_for(&not_found), StatusCode::NoSuchFile);
        assert_eq!(status_for(&denied), StatusCode::PermissionDenied);
        assert_eq!(status_for(&other), StatusCode::Failure);
    }

    #[test]
    fn link_targets_are_relative_to_the_link() {
        assert_eq!(relative_target("/link", "/target.txt"), PathBuf::from("target.txt"));
        assert_eq!(
            relative_target("/a/b/link", "/a/c/file"),
            PathBuf::from("../c/file")
        );
        assert_eq!(relative_target("/a/link", "/a"), PathBuf::from("."));
        assert_eq!(relative_target("/a/b/link", "/"), PathBuf::from("../.."));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_round_trips_inside_the_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("target.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let mut fs = handler(dir.path(), AccessMode::ReadWrite);

        fs.symlink(1, "/link".into(), "/target.txt".into()).await.unwrap();
        fs.symlink(2, "/sub/link".into(), "target.txt".into()).await.unwrap();

        for (id, link) in [(3, "/link"), (4, "/sub/link")] {
            let name = fs.readlink(id, link.into()).await.unwrap();
            assert_eq!(name.files[0].filename, "/target.txt");
            assert!(!name.files[0].filename.contains(&*dir.path().to_string_lossy()));
        }
        let attrs = fs.stat(5, "/target.txt".into()).await.unwrap();
        assert_eq!(attrs.attrs.size, Some(5));

        // Host-side resolution agrees with the client's view.
        assert_eq!(std::fs::read(dir.path().join("sub/link")).unwrap(), b"hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn readlink_refuses_targets_outside_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();
        let mut fs = handler(dir.path(), AccessMode::ReadOnly);

        assert_eq!(
            fs.readlink(1, "/escape".into()).await.err(),
            Some(StatusCode::PermissionDenied)
        );
    }

    #[tokio::test]
    async fn read_only_rejects_every_mutation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"data").unwrap();
        let mut fs = handler(dir.path(), AccessMode::ReadOnly);

        let create = OpenFlags::WRITE | OpenFlags::CREATE;
        let write_open = fs
            .open(1, "/new.txt".into(), create, FileAttributes::empty())
            .await;
        assert_eq!(write_open.err(), Some(StatusCode::PermissionDenied));
        assert_eq!(
            fs.remove(2, "/keep.txt".into()).await.err(),
            Some(StatusCode::PermissionDenied)
        );
        assert_eq!(
            fs.mkdir(3, "/sub".into(), FileAttributes::empty()).await.err(),
            Some(StatusCode::PermissionDenied)
        );
        assert_eq!(
            fs.rename(4, "/keep.txt".into(), "/moved.txt".into()).await.err(),
            Some(StatusCode::PermissionDenied)
        );

        assert!(dir.path().join("keep.txt").exists());
        assert!(!dir.path().join("new.txt").exists());
    }

    #[tokio::test]
    async fn read_returns_eof_past_end() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello").unwrap();
        let mut fs = handler(dir.path(), AccessMode::ReadOnly);

        let handle = fs
            .open(1, "hello.txt".into(), OpenFlags::READ, FileAttributes::empty())
            .await
            .unwrap()
            .handle;
        let data = fs.read(2, handle.clone(), 0, 1024).await.unwrap();
        assert_eq!(data.data, b"hello");
        assert_eq!(fs.read(3, handle.clone(), 5, 1024).await.err(), Some(StatusCode::Eof));

        fs.close(4, handle.clone()).await.unwrap();
        assert_eq!(fs.read(5, handle, 0, 1).await.err(), Some(StatusCode::Failure));
    }

    #[tokio::test]
    async fn readdir_lists_once_then_eof() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        let mut fs = handler(dir.path(), AccessMode::ReadOnly);

        let handle = fs.opendir(1, "/".into()).await.unwrap().handle;
        let mut names: Vec<String> = fs
            .readdir(2, handle.clone())
            .await
            .unwrap()
            .files
            .into_iter()
            .map(|f| f.filename)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(fs.readdir(3, handle).await.err(), Some(StatusCode::Eof));
    }

    #[tokio::test]
    async fn missing_paths_report_no_such_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = handler(dir.path(), AccessMode::ReadWrite);
        assert_eq!(fs.stat(1, "/ghost".into()).await.err(), Some(StatusCode::NoSuchFile));
        assert_eq!(fs.opendir(2, "/ghost".into()).await.err(), Some(StatusCode::NoSuchFile));
    }

    #[tokio::test]
    async fn read_write_mode_creates_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = handler(dir.path(), AccessMode::ReadWrite);

        let create = OpenFlags::WRITE | OpenFlags::CREATE;
        let handle = fs
            .open(1, "/out.txt".into(), create, FileAttributes::empty())
            .await
            .unwrap()
            .handle;
        fs.write(2, handle.clone(), 0, b"abc".to_vec()).await.unwrap();
        fs.close(3, handle).await.unwrap();

        fs.mkdir(4, "/sub".into(), FileAttributes::empty()).await.unwrap();
        fs.rename(5, "/out.txt".into(), "/sub/in.txt".into()).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("sub/in.txt")).unwrap(), b"abc");

        let realpath = fs.realpath(6, "sub/../sub/./in.txt".into()).await.unwrap();
        assert_eq!(realpath.files[0].filename, "/sub/in.txt");
    }
}
