use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Версия протокола
pub const PROTOCOL_VERSION: u8 = 3;

/// Версия движка, сообщаемая в ответах на опрос
pub const FTS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Порт передачи файлов по умолчанию
pub const DEFAULT_PORT: u16 = 9527;

/// Порт опроса устройств (широковещательный)
pub const DEFAULT_DISCOVERY_PORT: u16 = 9528;

/// Идентификатор передачи
pub type TransferId = Uuid;

/// Описание устройства, передаваемое в опросе
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: String,
    /// IP адрес (как его видит само устройство)
    pub address: String,
    /// Порт приёма запросов на передачу
    pub port: u16,
    /// Принимает ли устройство входящие запросы файлов
    pub is_server: bool,
    pub version: String,
    pub os: String,
}

impl DeviceIdentity {
    /// Описание текущего устройства
    pub fn local(name: impl Into<String>, address: impl Into<String>, port: u16, is_server: bool) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            is_server,
            version: FTS_VERSION.to_string(),
            os: std::env::consts::OS.to_string(),
        }
    }
}

/// Сообщения протокола
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Message {
    // === Обнаружение устройств ===

    /// Запрос на опрос (широковещательный или адресный)
    PollRequest { identity: DeviceIdentity },
    /// Ответ на опрос
    PollReply { identity: DeviceIdentity },

    // === Передача файлов ===

    /// Запрос файла у владельца
    FileRequest {
        id: TransferId,
        filename: String,
        requester: String,
        chunk_size: u32,
    },
    /// Файл отсутствует у владельца
    FileNotFound { id: TransferId },
    /// Заголовок с размером, отправляется до первого чанка
    FileHeader {
        id: TransferId,
        filename: String,
        size: u64,
        chunk_size: u32,
    },
    /// Запрос чанка получателем. Заодно подтверждает чанк `index - 1`
    ChunkRequest { id: TransferId, index: u64 },
    /// Кусок данных файла
    Chunk {
        id: TransferId,
        index: u64,
        data: Vec<u8>,
    },
    /// Предложение принять файл без запроса (принудительная загрузка)
    PushOffer {
        id: TransferId,
        filename: String,
        size: u64,
        chunk_size: u32,
        sender: String,
    },
    /// Получатель согласился на принудительную загрузку
    PushAccept { id: TransferId },
    /// Получатель отказался
    PushReject { id: TransferId },
    /// Последний чанк сохранён
    TransferDone { id: TransferId },
    /// Отмена передачи одной из сторон
    Abort { id: TransferId },
    /// Ошибка
    Error { id: Option<TransferId>, message: String },

    // === Синхронизация времени через ретранслятор (TCP/WebSocket) ===

    TimeRequest { client_send: i64 },
    TimeReply {
        client_send: i64,
        server_recv: i64,
        server_send: i64,
    },
}

impl Message {
    /// Сериализовать сообщение (без префикса длины: его добавляет транспорт)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Десериализовать сообщение
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Идентификатор передачи, к которой относится сообщение
    pub fn transfer_id(&self) -> Option<TransferId> {
        match self {
            Self::FileRequest { id, .. }
            | Self::FileNotFound { id }
            | Self::FileHeader { id, .. }
            | Self::ChunkRequest { id, .. }
            | Self::Chunk { id, .. }
            | Self::PushOffer { id, .. }
            | Self::PushAccept { id }
            | Self::PushReject { id }
            | Self::TransferDone { id }
            | Self::Abort { id } => Some(*id),
            Self::Error { id, .. } => *id,
            _ => None,
        }
    }
}

/// Информация о локальном файле для отправки
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// Полный путь к файлу на диске
    pub path: std::path::PathBuf,
    /// Имя файла, под которым его увидит получатель
    pub name: String,
    pub size: u64,
}

impl FileInfo {
    pub fn new(path: std::path::PathBuf) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(&path)?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} не является файлом", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self {
            path,
            name,
            size: metadata.len(),
        })
    }

    /// Количество чанков при заданном размере чанка
    pub fn chunk_count(&self, chunk_size: u32) -> u64 {
        chunk_count(self.size, chunk_size)
    }
}

/// Количество чанков для файла размера `size`
pub fn chunk_count(size: u64, chunk_size: u32) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64)
}

/// Имя файла без компонентов пути (защита от `../` в запросах)
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // === Тесты Message ===

    #[test]
    fn test_message_file_header_serialization() {
        let id = Uuid::new_v4();
        let msg = Message::FileHeader {
            id,
            filename: "text.txt".to_string(),
            size: 1_048_576,
            chunk_size: 4096,
        };

        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.transfer_id(), Some(id));
    }

    #[test]
    fn test_message_chunk_keeps_payload() {
        let id = Uuid::new_v4();
        let msg = Message::Chunk {
            id,
            index: 7,
            data: vec![1, 2, 3, 4, 5],
        };

        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        match decoded {
            Message::Chunk { index, data, .. } => {
                assert_eq!(index, 7);
                assert_eq!(data, vec![1, 2, 3, 4, 5]);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_poll_messages_have_no_transfer_id() {
        let identity = DeviceIdentity::local("desk", "10.0.0.2", DEFAULT_PORT, true);
        assert_eq!(Message::PollRequest { identity: identity.clone() }.transfer_id(), None);
        assert_eq!(Message::PollReply { identity }.transfer_id(), None);
        assert_eq!(Message::TimeRequest { client_send: 1 }.transfer_id(), None);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Message::from_bytes(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_local_identity_reports_version_and_os() {
        let identity = DeviceIdentity::local("desk", "10.0.0.2", 9000, false);
        assert_eq!(identity.version, FTS_VERSION);
        assert_eq!(identity.os, std::env::consts::OS);
        assert!(!identity.is_server);
    }

    // === Тесты chunk_count ===

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(1_048_576, 4096), 256);
        assert_eq!(chunk_count(4097, 4096), 2);
        assert_eq!(chunk_count(0, 4096), 0);
        assert_eq!(chunk_count(10, 0), 0);
    }

    // === Тесты sanitize_file_name ===

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("example.png").as_deref(), Some("example.png"));
        assert_eq!(sanitize_file_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_file_name("dir\\capture.jpg").as_deref(), Some("capture.jpg"));
        assert_eq!(sanitize_file_name(".."), None);
        assert_eq!(sanitize_file_name("folder/"), None);
    }

    // === Тесты FileInfo ===

    #[test]
    fn test_file_info_new() {
        let dir = TempDir::new().unwrap();
        let file_path = dir.path().join("test.txt");
        std::fs::write(&file_path, "Hello, World!").unwrap();

        let info = FileInfo::new(file_path).unwrap();
        assert_eq!(info.name, "test.txt");
        assert_eq!(info.size, 13);
        assert_eq!(info.chunk_count(4), 4);
    }

    #[test]
    fn test_file_info_rejects_directory() {
        let dir = TempDir::new().unwrap();
        assert!(FileInfo::new(dir.path().to_path_buf()).is_err());
    }
}
