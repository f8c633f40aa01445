//! Настройки движка - сохранение и загрузка
//!
//! Хранятся в JSON файле в папке конфигурации пользователя.

use crate::error::Result;
use crate::network::transport::TransportType;
use crate::protocol::{DEFAULT_DISCOVERY_PORT, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Размер чанка по умолчанию (32 KB)
pub const DEFAULT_CHUNK_SIZE: u32 = 32 * 1024;

/// Минимальный размер чанка
pub const MIN_CHUNK_SIZE: u32 = 512;

/// Максимальный размер чанка (должен помещаться в UDP датаграмму)
pub const MAX_CHUNK_SIZE: u32 = 60 * 1024;

/// Версия IP для прослушивания
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IpMode {
    #[default]
    V4,
    V6,
}

impl IpMode {
    /// Адрес "все интерфейсы" для данного режима
    pub fn unspecified(&self) -> &'static str {
        match self {
            Self::V4 => "0.0.0.0",
            Self::V6 => "[::]",
        }
    }

    /// Адрес для широковещательного опроса
    pub fn broadcast(&self) -> &'static str {
        match self {
            Self::V4 => "255.255.255.255",
            // В IPv6 нет broadcast - используем all-nodes multicast
            Self::V6 => "[ff02::1]",
        }
    }
}

/// Настройки движка
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Имя устройства в ответах на опрос
    pub device_name: String,
    /// Папка, из которой отдаются файлы по запросу
    pub shared_folder: PathBuf,
    pub shared_folder_is_absolute: bool,
    /// Папка для сохранения принятых файлов
    pub download_folder: PathBuf,
    pub download_folder_is_absolute: bool,
    /// Принимать входящие запросы файлов
    pub server_enabled: bool,
    /// Принимать принудительные загрузки без подтверждения
    pub auto_download: bool,
    pub ip_mode: IpMode,
    /// Порт передачи файлов
    pub port: u16,
    /// Порт опроса устройств
    pub discovery_port: u16,
    pub chunk_size: u32,
    pub transport_type: TransportType,
    /// Окно ожидания следующего чанка (мс)
    pub timeout_ms: u64,
    /// Количество повторных запросов до перехода в timeout
    pub max_retries: u32,
    /// Сколько чанков может быть запрошено одновременно
    pub window: u32,
    /// Размер очереди ожидающих подтверждения загрузок
    pub confirmation_queue: usize,
    /// Сколько отправитель ждёт подтверждения принудительной загрузки (мс)
    pub confirm_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            shared_folder: PathBuf::from("shared"),
            shared_folder_is_absolute: false,
            download_folder: PathBuf::from("downloads"),
            download_folder_is_absolute: false,
            server_enabled: true,
            auto_download: false,
            ip_mode: IpMode::default(),
            port: DEFAULT_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            transport_type: TransportType::default(),
            timeout_ms: 5000,
            max_retries: 3,
            window: 4,
            confirmation_queue: 8,
            confirm_timeout_ms: 60_000,
        }
    }
}

impl Settings {
    /// Загрузить настройки из файла (при ошибке - значения по умолчанию)
    pub fn load() -> Self {
        Self::load_from(&settings_file_path())
    }

    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Settings>(&contents) {
                Ok(settings) => settings.normalized(),
                Err(e) => {
                    tracing::warn!("Повреждённый файл настроек {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Сохранить настройки в файл
    pub fn save(&self) -> Result<()> {
        self.save_to(&settings_file_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Создаём директорию если нужно
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Ограничить значения допустимыми диапазонами
    pub fn normalized(mut self) -> Self {
        self.chunk_size = self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self.window = self.window.max(1);
        self.confirmation_queue = self.confirmation_queue.max(1);
        if self.timeout_ms == 0 {
            self.timeout_ms = Settings::default().timeout_ms;
        }
        self
    }

    /// Окно ожидания следующего чанка
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Сколько ждать решения получателя по принудительной загрузке
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms.max(self.timeout_ms))
    }

    /// Абсолютный путь папки раздачи
    pub fn shared_dir(&self) -> PathBuf {
        resolve_folder(&self.shared_folder, self.shared_folder_is_absolute)
    }

    /// Абсолютный путь папки загрузок
    pub fn download_dir(&self) -> PathBuf {
        resolve_folder(&self.download_folder, self.download_folder_is_absolute)
    }
}

/// Относительные папки отсчитываются от папки данных приложения
fn resolve_folder(folder: &Path, is_absolute: bool) -> PathBuf {
    if is_absolute || folder.is_absolute() {
        folder.to_path_buf()
    } else {
        data_dir().join(folder)
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fts_engine")
}

/// Путь к файлу настроек
fn settings_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fts_engine")
        .join("settings.json")
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "fts-device".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_settings_roundtrip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("settings.json");

        let settings = Settings {
            device_name: "workstation".to_string(),
            auto_download: true,
            chunk_size: 4096,
            port: 12000,
            ..Default::default()
        };
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path);
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = Settings::load_from(&dir.path().join("nope.json"));
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn test_corrupted_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(Settings::load_from(&path), Settings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "device_name": "laptop", "port": 7000 }"#).unwrap();

        let loaded = Settings::load_from(&path);
        assert_eq!(loaded.device_name, "laptop");
        assert_eq!(loaded.port, 7000);
        assert_eq!(loaded.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_normalized_clamps_values() {
        let settings = Settings {
            chunk_size: 1,
            window: 0,
            timeout_ms: 0,
            ..Default::default()
        }
        .normalized();

        assert_eq!(settings.chunk_size, MIN_CHUNK_SIZE);
        assert_eq!(settings.window, 1);
        assert_eq!(settings.timeout_ms, 5000);
    }

    #[test]
    fn test_absolute_folder_is_kept() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            download_folder: dir.path().to_path_buf(),
            download_folder_is_absolute: true,
            ..Default::default()
        };
        assert_eq!(settings.download_dir(), dir.path());
    }

    #[test]
    fn test_relative_folder_is_resolved() {
        let settings = Settings::default();
        assert!(settings.shared_dir().ends_with("shared"));
        assert!(settings.shared_dir().is_absolute() || settings.shared_dir().starts_with("."));
    }

    #[test]
    fn test_ip_mode_addresses() {
        assert_eq!(IpMode::V4.unspecified(), "0.0.0.0");
        assert_eq!(IpMode::V6.unspecified(), "[::]");
        assert_eq!(IpMode::V4.broadcast(), "255.255.255.255");
    }
}
