//! Отдача файлов: чтение чанков по запросу получателя
//!
//! Одна и та же раздача обслуживает оба случая: ответ на запрос файла
//! из папки раздачи и отправку файла по инициативе этого устройства.

use crate::network::route::Route;
use crate::network::transfer::WeakFileUpload;
use crate::protocol::{chunk_count, FileInfo};
use std::io::{self, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

/// Открытый файл, из которого читаются чанки
pub(crate) struct ServedFile {
    file: Mutex<File>,
    pub(crate) name: String,
    pub(crate) size: u64,
    pub(crate) chunk_size: u32,
}

impl ServedFile {
    pub(crate) async fn open(info: &FileInfo, chunk_size: u32) -> io::Result<Self> {
        let file = File::open(&info.path).await?;
        Ok(Self {
            file: Mutex::new(file),
            name: info.name.clone(),
            size: info.size,
            chunk_size,
        })
    }

    /// Открыть файл из папки раздачи. None - файла нет
    pub(crate) async fn open_shared(dir: &Path, name: &str, chunk_size: u32) -> Option<Self> {
        let info = FileInfo::new(dir.join(name)).ok()?;
        match Self::open(&info, chunk_size).await {
            Ok(served) => Some(served),
            Err(e) => {
                tracing::warn!("Не удалось открыть {}: {}", info.path.display(), e);
                None
            }
        }
    }

    pub(crate) fn chunk_count(&self) -> u64 {
        chunk_count(self.size, self.chunk_size)
    }

    /// Байт отдано после чанка `index`
    pub(crate) fn bytes_through(&self, index: u64) -> u64 {
        ((index + 1) * self.chunk_size as u64).min(self.size)
    }

    /// Прочитать чанк `index`
    pub(crate) async fn read_chunk(&self, index: u64) -> io::Result<Vec<u8>> {
        if index >= self.chunk_count() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Чанк {} за пределами файла ({} чанков)", index, self.chunk_count()),
            ));
        }
        let offset = index * self.chunk_size as u64;
        let len = (self.size - offset).min(self.chunk_size as u64) as usize;

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut data = vec![0u8; len];
        file.read_exact(&mut data).await?;
        Ok(data)
    }
}

/// Активная раздача одной передачи
pub(crate) struct ServeSlot {
    pub(crate) file: Arc<ServedFile>,
    pub(crate) route: Route,
    /// Есть у исходящей передачи, начатой этим устройством
    pub(crate) upload: Option<WeakFileUpload>,
    pub(crate) last_activity: Instant,
}

impl ServeSlot {
    pub(crate) fn new(file: ServedFile, route: Route, upload: Option<WeakFileUpload>) -> Self {
        Self {
            file: Arc::new(file),
            route,
            upload,
            last_activity: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, size: usize) -> (FileInfo, Vec<u8>) {
        let content: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
        let path = dir.path().join(name);
        std::fs::write(&path, &content).unwrap();
        (FileInfo::new(path).unwrap(), content)
    }

    #[tokio::test]
    async fn test_chunks_cover_file() {
        let dir = TempDir::new().unwrap();
        let (info, content) = write_file(&dir, "data.bin", 10_000);
        let served = ServedFile::open(&info, 4096).await.unwrap();

        assert_eq!(served.chunk_count(), 3);
        let mut joined = Vec::new();
        // В обратном порядке: чтение не зависит от предыдущих
        for index in (0..3).rev() {
            let mut chunk = served.read_chunk(index).await.unwrap();
            chunk.extend_from_slice(&joined);
            joined = chunk;
        }
        assert_eq!(joined, content);
    }

    #[tokio::test]
    async fn test_chunk_out_of_range() {
        let dir = TempDir::new().unwrap();
        let (info, _) = write_file(&dir, "data.bin", 100);
        let served = ServedFile::open(&info, 512).await.unwrap();

        assert!(served.read_chunk(0).await.is_ok());
        assert_eq!(served.read_chunk(1).await.unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_one_mebibyte_in_4k_chunks() {
        let dir = TempDir::new().unwrap();
        let (info, _) = write_file(&dir, "text.txt", 1_048_576);
        let served = ServedFile::open(&info, 4096).await.unwrap();

        assert_eq!(served.chunk_count(), 256);
        assert_eq!(served.read_chunk(255).await.unwrap().len(), 4096);
        assert_eq!(served.bytes_through(255), 1_048_576);
        assert_eq!(served.bytes_through(0), 4096);
    }

    #[tokio::test]
    async fn test_open_shared_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(ServedFile::open_shared(dir.path(), "nope.txt", 4096).await.is_none());

        write_file(&dir, "yes.txt", 10);
        let served = ServedFile::open_shared(dir.path(), "yes.txt", 4096).await.unwrap();
        assert_eq!(served.name, "yes.txt");
        assert_eq!(served.size, 10);
    }
}
