//! 对象存储访问层
//!
//! 所有写入都是原子的：先写同目录下的临时文件，再 rename（覆盖）或
//! hard_link（不覆盖，目标已存在时失败）。读者永远看不到写了一半的文件。

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::{LakeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// 目标已存在时返回 `AlreadyExists`
    CreateNew,
    Overwrite,
}

pub trait FileSystem: Send + Sync {
    fn read_all(&self, path: &Path) -> Result<Vec<u8>>;

    fn read_at(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>>;

    fn write_atomic(&self, path: &Path, data: &[u8], mode: WriteMode) -> Result<()>;

    fn exists(&self, path: &Path) -> Result<bool>;

    /// 删除文件；不存在时返回 `NotFound`
    fn delete(&self, path: &Path) -> Result<()>;

    /// 列出目录下的文件名；目录不存在时返回空
    fn list(&self, dir: &Path) -> Result<Vec<String>>;

    fn create_dirs(&self, dir: &Path) -> Result<()>;
}

fn with_path(e: std::io::Error, op: &str, path: &Path) -> LakeError {
    let msg = format!("{op} {}: {e}", path.display());
    match e.kind() {
        std::io::ErrorKind::NotFound      => LakeError::NotFound(msg),
        std::io::ErrorKind::AlreadyExists => LakeError::AlreadyExists(msg),
        _                                 => LakeError::IoError(msg),
    }
}

/// 本地文件系统实现
#[derive(Debug, Default)]
pub struct LocalFileSystem {
    tmp_seq: AtomicU64,
}

impl LocalFileSystem {
    pub fn new() -> Self { Self::default() }

    fn tmp_path(&self, path: &Path) -> PathBuf {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        path.with_file_name(format!(".{name}.{}.{seq}.tmp", std::process::id()))
    }
}

impl FileSystem for LocalFileSystem {
    fn read_all(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| with_path(e, "read", path))
    }

    fn read_at(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut f = File::open(path).map_err(|e| with_path(e, "open", path))?;
        f.seek(SeekFrom::Start(offset)).map_err(|e| with_path(e, "seek", path))?;
        let mut buf = vec![0u8; len];
        f.read_exact(&mut buf).map_err(|e| with_path(e, "read_at", path))?;
        Ok(buf)
    }

    fn write_atomic(&self, path: &Path, data: &[u8], mode: WriteMode) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| with_path(e, "create dir", parent))?;
        }
        let tmp = self.tmp_path(path);
        let write_tmp = || -> std::io::Result<()> {
            let mut f = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
            f.write_all(data)?;
            f.sync_all()
        };
        if let Err(e) = write_tmp() {
            let _ = fs::remove_file(&tmp);
            return Err(with_path(e, "write", &tmp));
        }
        let installed = match mode {
            WriteMode::Overwrite => fs::rename(&tmp, path),
            WriteMode::CreateNew => fs::hard_link(&tmp, path),
        };
        // rename 成功后 tmp 已不存在，删除失败可忽略
        let _ = fs::remove_file(&tmp);
        installed.map_err(|e| with_path(e, "install", path))
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        path.try_exists().map_err(|e| with_path(e, "stat", path))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| with_path(e, "delete", path))
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let entries = match fs::read_dir(dir) {
            Ok(it) => it,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(with_path(e, "list", dir)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| with_path(e, "list", dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn create_dirs(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| with_path(e, "create dir", dir))
    }
}
