//! FTS - опрос устройств и передача файлов по локальной сети
//!
//! Общая библиотека для приложений и CLI.
//!
//! # Модули
//! - `network` - транспорты (TCP, UDP, WebSocket), опрос устройств, передача файлов
//! - `protocol` - сообщения протокола
//! - `timesync` - синхронизация времени (SNTP) и ретранслятор времени
//! - `config` - сохраняемые настройки
//! - `stats` - статистика передачи (скорость, ETA)
//! - `utils` - вспомогательные функции

pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod stats;
pub mod timesync;
pub mod utils;

pub use config::Settings;
pub use error::{FtsError, Result};
pub use network::{
    DeviceTarget, FileRequest, FileTransferService, FileUpload, FtsEvent, TransferStatus, TransportType,
};
pub use timesync::{TimeRepeater, TimeSync};
