//! Ошибки движка передачи файлов

use thiserror::Error;

/// Коды транспортных ошибок (передаются в уведомлении `on-error`)
pub mod codes {
    pub const CONNECT_FAILED: i32 = 1;
    pub const BIND_FAILED: i32 = 2;
    pub const SEND_FAILED: i32 = 3;
    pub const RECEIVE_FAILED: i32 = 4;
    pub const NOT_CONNECTED: i32 = 5;
    pub const NO_DESTINATION: i32 = 6;
    pub const HANDSHAKE_FAILED: i32 = 7;
    pub const FRAME_TOO_LARGE: i32 = 8;
}

/// Ошибка транспорта: код + человекочитаемое сообщение
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct TransportError {
    pub code: i32,
    pub message: String,
}

impl TransportError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Ошибки движка
#[derive(Debug, Error)]
pub enum FtsError {
    #[error("Ошибка транспорта {0}")]
    Transport(#[from] TransportError),

    #[error("Ошибка протокола: {0}")]
    Protocol(String),

    #[error("Файл не найден: {0}")]
    NotFound(String),

    #[error("Превышено время ожидания")]
    Timeout,

    #[error("Передача отменена")]
    Aborted,

    #[error("Неизвестное устройство: {0}")]
    UnknownDevice(String),

    #[error("Некорректный адрес: {0}")]
    InvalidAddress(String),

    #[error("Ошибка ввода-вывода: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ошибка сериализации: {0}")]
    Encode(#[from] bincode::Error),

    #[error("Ошибка конфигурации: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FtsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::new(codes::CONNECT_FAILED, "connection refused");
        assert_eq!(err.to_string(), "[1] connection refused");
    }

    #[test]
    fn test_transport_error_converts_into_fts_error() {
        let err: FtsError = TransportError::new(codes::SEND_FAILED, "broken pipe").into();
        assert!(matches!(err, FtsError::Transport(ref e) if e.code == codes::SEND_FAILED));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: FtsError = io.into();
        assert!(matches!(err, FtsError::Io(_)));
    }
}
