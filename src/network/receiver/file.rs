//! Файл, принимаемый по частям
//!
//! Данные пишутся во временный `.part` файл рядом с итоговым и
//! переименовываются только после последнего чанка.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

pub(crate) struct PartialFile {
    writer: BufWriter<File>,
    part_path: PathBuf,
    final_path: PathBuf,
    written: u64,
}

impl PartialFile {
    /// Создать временный файл для `final_path`. `tag` делает имя уникальным
    pub(crate) async fn create(final_path: &Path, tag: &str) -> io::Result<Self> {
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part_path = part_path(final_path, tag);
        let file = File::create(&part_path).await?;
        Ok(Self {
            writer: BufWriter::new(file),
            part_path,
            final_path: final_path.to_path_buf(),
            written: 0,
        })
    }

    pub(crate) async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub(crate) fn written(&self) -> u64 {
        self.written
    }

    /// Дописать на диск и переименовать в итоговое имя (старый файл заменяется)
    pub(crate) async fn finish(mut self) -> io::Result<PathBuf> {
        self.writer.flush().await?;
        self.writer.get_mut().sync_all().await?;
        drop(self.writer);

        if tokio::fs::try_exists(&self.final_path).await.unwrap_or(false) {
            tokio::fs::remove_file(&self.final_path).await?;
        }
        tokio::fs::rename(&self.part_path, &self.final_path).await?;
        Ok(self.final_path)
    }

    /// Удалить недокачанный файл
    pub(crate) async fn discard(self) {
        drop(self.writer);
        if let Err(e) = tokio::fs::remove_file(&self.part_path).await {
            tracing::debug!("Не удалось удалить {}: {}", self.part_path.display(), e);
        }
    }
}

/// Имя в `dir`, не занятое существующим файлом: `name`, `name (1).ext`, ...
pub(crate) async fn free_name(dir: &Path, name: &str) -> String {
    let taken = |candidate: &str| tokio::fs::try_exists(dir.join(candidate));
    if !taken(name).await.unwrap_or(false) {
        return name.to_string();
    }

    let path = Path::new(name);
    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().to_string());
    let mut n = 1u32;
    loop {
        let candidate = match &ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        if !taken(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

fn part_path(final_path: &Path, tag: &str) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    final_path.with_file_name(format!(".{}.{}.part", name, tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_finish_renames_into_place() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("example.png");

        let mut file = PartialFile::create(&target, "t1").await.unwrap();
        file.append(b"hello ").await.unwrap();
        file.append(b"world").await.unwrap();
        assert_eq!(file.written(), 11);
        assert!(!target.exists());

        let saved = file.finish().await.unwrap();
        assert_eq!(saved, target);
        assert_eq!(std::fs::read(&target).unwrap(), b"hello world");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_finish_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("capture.jpg");
        std::fs::write(&target, b"old contents").unwrap();

        let mut file = PartialFile::create(&target, "t2").await.unwrap();
        file.append(b"new").await.unwrap();
        file.finish().await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_free_name_skips_existing_files() {
        let dir = TempDir::new().unwrap();
        assert_eq!(free_name(dir.path(), "capture.jpg").await, "capture.jpg");

        std::fs::write(dir.path().join("capture.jpg"), b"a").unwrap();
        std::fs::write(dir.path().join("capture (1).jpg"), b"b").unwrap();
        assert_eq!(free_name(dir.path(), "capture.jpg").await, "capture (2).jpg");

        std::fs::write(dir.path().join("notes"), b"c").unwrap();
        assert_eq!(free_name(dir.path(), "notes").await, "notes (1)");
    }

    #[tokio::test]
    async fn test_discard_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let mut file = PartialFile::create(&dir.path().join("x.bin"), "t3").await.unwrap();
        file.append(&[1, 2, 3]).await.unwrap();
        file.discard().await;

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_creates_missing_folder() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("nested").join("file.txt");
        let file = PartialFile::create(&target, "t4").await.unwrap();
        file.finish().await.unwrap();
        assert!(target.exists());
    }
}
