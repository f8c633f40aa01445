//! События движка для вызывающего кода

use super::discovery::RemoteDevice;
use super::transfer::{FileRequest, FileUpload};
use crate::error::TransportError;

/// События движка передачи файлов.
/// Конечные события по каждой передаче приходят ровно один раз,
/// при отмене самим вызывающим кодом событие не отправляется
#[derive(Debug, Clone)]
pub enum FtsEvent {
    // === Соединения ===

    /// Установлено соединение с устройством (адрес)
    Connected(String),
    /// Соединение закрыто (адрес)
    Disconnected(String),
    /// Ошибка транспорта (адрес, если известен)
    TransportError(Option<String>, TransportError),

    // === Опрос устройств ===

    /// Список устройств изменился
    DevicesUpdated(Vec<RemoteDevice>),

    // === Скачивание ===

    /// Файл полностью получен
    DownloadFinished(FileRequest),
    /// Файла нет на удалённом устройстве
    DownloadNotFound(FileRequest),
    /// Нет ответа после всех повторов
    DownloadTimeout(FileRequest),
    /// Удалённая сторона отменила передачу
    DownloadCancelled(FileRequest),
    /// Локальная ошибка (запись на диск и т.п.), передача прервана
    DownloadFailed(FileRequest, String),
    /// Удалённое устройство хочет отправить файл - нужно подтверждение
    ConfirmationRequested(FileRequest),

    // === Отправка ===

    /// Получатель сохранил файл
    UploadFinished(FileUpload),
    /// Получатель перестал отвечать
    UploadTimeout(FileUpload),
    /// Получатель отказался принимать файл
    UploadRejected(FileUpload),
    /// Получатель отменил уже начатую передачу
    UploadCancelled(FileUpload),

    // === Раздача ===

    /// Файл из папки раздачи отдан запросившему (имя файла, адрес)
    FileServed(String, String),
}

impl FtsEvent {
    /// Относится ли событие к данному скачиванию
    pub fn is_for_request(&self, request: &FileRequest) -> bool {
        match self {
            Self::DownloadFinished(r)
            | Self::DownloadNotFound(r)
            | Self::DownloadTimeout(r)
            | Self::DownloadCancelled(r)
            | Self::DownloadFailed(r, _)
            | Self::ConfirmationRequested(r) => r.is_same(request),
            _ => false,
        }
    }

    /// Относится ли событие к данной отправке
    pub fn is_for_upload(&self, upload: &FileUpload) -> bool {
        match self {
            Self::UploadFinished(u)
            | Self::UploadTimeout(u)
            | Self::UploadRejected(u)
            | Self::UploadCancelled(u) => u.is_same(upload),
            _ => false,
        }
    }
}
