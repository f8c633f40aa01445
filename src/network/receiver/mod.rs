//! Приём файла (скачивание)
//!
//! Получатель сам запрашивает чанки по номеру, не больше `window` сразу.
//! Чанки принимаются строго по порядку, чужие и повторные отбрасываются.
//! Если за окно ожидания не пришло ни одного нужного чанка, запросы
//! повторяются начиная с первого недостающего. Отброшенные сообщения
//! окно не продлевают. После `max_retries` повторов подряд
//! передача завершается по таймауту.

mod file;

pub(crate) use file::free_name;
use file::PartialFile;

use crate::network::route::Route;
use crate::network::transfer::{FileRequest, TransferStatus};
use crate::protocol::{chunk_count, Message};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Параметры скачивания
#[derive(Debug, Clone)]
pub(crate) struct DownloadOptions {
    /// Окно ожидания следующего сообщения
    pub(crate) timeout: Duration,
    pub(crate) max_retries: u32,
    /// Сколько чанков запрашивается одновременно
    pub(crate) window: u32,
    pub(crate) save_path: PathBuf,
}

/// Чем закончилось скачивание
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DownloadOutcome {
    Completed,
    NotFound,
    Timeout,
    /// Отменено локально
    Aborted,
    /// Отменено удалённой стороной
    Cancelled,
    /// Локальная ошибка ввода-вывода
    Failed(String),
}

impl DownloadOutcome {
    pub(crate) fn status(&self) -> TransferStatus {
        match self {
            Self::Completed => TransferStatus::Completed,
            Self::NotFound => TransferStatus::NotFound,
            Self::Timeout => TransferStatus::Timeout,
            Self::Aborted | Self::Cancelled | Self::Failed(_) => TransferStatus::Aborted,
        }
    }
}

enum Next {
    Message(Message),
    Timeout,
    Aborted,
}

/// Одно скачивание: запросы чанков и запись на диск
pub(crate) struct Download {
    request: FileRequest,
    route: Route,
    inbox: mpsc::UnboundedReceiver<Message>,
    options: DownloadOptions,
}

impl Download {
    pub(crate) fn new(
        request: FileRequest,
        route: Route,
        inbox: mpsc::UnboundedReceiver<Message>,
        options: DownloadOptions,
    ) -> Self {
        Self {
            request,
            route,
            inbox,
            options,
        }
    }

    pub(crate) async fn run(mut self) -> DownloadOutcome {
        let id = self.request.id();
        let outcome = self.transfer().await;

        match &outcome {
            DownloadOutcome::Completed => {
                tracing::info!(
                    "✓ {} получен от {} ({} чанков, {} повторов)",
                    self.request.save_name(),
                    self.route.label(),
                    self.request.chunks_received(),
                    self.request.retries()
                );
            }
            DownloadOutcome::Aborted | DownloadOutcome::Timeout | DownloadOutcome::Failed(_) => {
                self.route.send(&Message::Abort { id }).await;
            }
            DownloadOutcome::NotFound | DownloadOutcome::Cancelled => {}
        }
        outcome
    }

    async fn transfer(&mut self) -> DownloadOutcome {
        let id = self.request.id();
        let chunk_size = self.request.chunk_size();

        let size = if self.request.is_forced() {
            self.route.send(&Message::PushAccept { id }).await;
            self.request.total_size()
        } else {
            match self.await_header().await {
                Ok(size) => size,
                Err(outcome) => return outcome,
            }
        };

        let mut file = match PartialFile::create(&self.options.save_path, &id.simple().to_string()).await {
            Ok(file) => file,
            Err(e) => {
                tracing::error!("Не удалось создать {}: {}", self.options.save_path.display(), e);
                return DownloadOutcome::Failed(e.to_string());
            }
        };

        let outcome = self.receive_chunks(&mut file, size, chunk_size).await;
        if outcome != DownloadOutcome::Completed {
            file.discard().await;
            return outcome;
        }

        if let Err(e) = file.finish().await {
            tracing::error!("Не удалось сохранить {}: {}", self.options.save_path.display(), e);
            return DownloadOutcome::Failed(e.to_string());
        }
        self.route.send(&Message::TransferDone { id }).await;
        DownloadOutcome::Completed
    }

    /// Запросить файл и дождаться заголовка с размером
    async fn await_header(&mut self) -> Result<u64, DownloadOutcome> {
        let id = self.request.id();
        let request = Message::FileRequest {
            id,
            filename: self.request.file_name().to_string(),
            requester: self.route.label().to_string(),
            chunk_size: self.request.chunk_size(),
        };
        self.route.send(&request).await;

        let mut retries = 0;
        let mut deadline = self.deadline();
        loop {
            match self.next(deadline).await {
                Next::Message(Message::FileHeader { size, chunk_size, .. }) => {
                    if chunk_size != self.request.chunk_size() {
                        tracing::warn!(
                            "Ошибка протокола: размер чанка {} вместо {}, заголовок отброшен",
                            chunk_size,
                            self.request.chunk_size()
                        );
                        continue;
                    }
                    self.request.state.set_total_size(size);
                    self.request.state.touch();
                    return Ok(size);
                }
                Next::Message(Message::FileNotFound { .. }) => return Err(DownloadOutcome::NotFound),
                Next::Message(Message::Abort { .. }) => return Err(DownloadOutcome::Cancelled),
                Next::Message(Message::Error { message, .. }) => {
                    tracing::warn!("{} сообщает об ошибке: {}", self.route.label(), message);
                }
                Next::Message(other) => {
                    tracing::debug!("Неожиданное сообщение до заголовка: {:?}", other.transfer_id());
                }
                Next::Timeout => {
                    if retries >= self.options.max_retries {
                        return Err(DownloadOutcome::Timeout);
                    }
                    retries += 1;
                    self.request.state.add_retry();
                    tracing::debug!("Повтор запроса {} ({}/{})", self.request.file_name(), retries, self.options.max_retries);
                    self.route.send(&request).await;
                    deadline = self.deadline();
                }
                Next::Aborted => return Err(DownloadOutcome::Aborted),
            }
        }
    }

    async fn receive_chunks(&mut self, file: &mut PartialFile, size: u64, chunk_size: u32) -> DownloadOutcome {
        let id = self.request.id();
        let total = chunk_count(size, chunk_size);
        let window = self.options.window.max(1) as u64;

        let mut next_index: u64 = 0;
        let mut requested: u64 = 0;
        let mut retries = 0;
        let mut deadline = self.deadline();

        while next_index < total {
            while requested < total && requested - next_index < window {
                self.route.send(&Message::ChunkRequest { id, index: requested }).await;
                requested += 1;
            }

            match self.next(deadline).await {
                Next::Message(Message::Chunk { index, data, .. }) => {
                    if index < next_index {
                        tracing::trace!("Повторный чанк {} отброшен", index);
                        continue;
                    }
                    let expected = expected_len(index, size, chunk_size);
                    if index != next_index || data.len() as u64 != expected {
                        tracing::warn!(
                            "Ошибка протокола: чанк {} ({} байт), ожидался {} ({} байт)",
                            index,
                            data.len(),
                            next_index,
                            expected
                        );
                        continue;
                    }
                    if let Err(e) = file.append(&data).await {
                        tracing::error!("Ошибка записи {}: {}", self.options.save_path.display(), e);
                        return DownloadOutcome::Failed(e.to_string());
                    }
                    self.request.state.add_chunk(data.len() as u64);
                    self.request.state.touch();
                    next_index += 1;
                    retries = 0;
                    deadline = self.deadline();
                }
                Next::Message(Message::FileNotFound { .. }) => return DownloadOutcome::NotFound,
                Next::Message(Message::Abort { .. }) => return DownloadOutcome::Cancelled,
                Next::Message(Message::Error { message, .. }) => {
                    tracing::warn!("{} сообщает об ошибке: {}", self.route.label(), message);
                }
                Next::Message(_) => {}
                Next::Timeout => {
                    if retries >= self.options.max_retries {
                        tracing::warn!(
                            "{}: нет данных после {} повторов, получено {} из {} байт",
                            self.request.file_name(),
                            retries,
                            file.written(),
                            size
                        );
                        return DownloadOutcome::Timeout;
                    }
                    retries += 1;
                    self.request.state.add_retry();
                    tracing::debug!("Повтор с чанка {} ({}/{})", next_index, retries, self.options.max_retries);
                    requested = next_index;
                    deadline = self.deadline();
                }
                Next::Aborted => return DownloadOutcome::Aborted,
            }
        }

        DownloadOutcome::Completed
    }

    /// Конец окна ожидания, отсчитанного от текущего момента
    fn deadline(&self) -> Instant {
        Instant::now() + self.options.timeout
    }

    /// Следующее сообщение по передаче, не позже `deadline`
    async fn next(&mut self, deadline: Instant) -> Next {
        if self.request.status() == TransferStatus::Aborted {
            return Next::Aborted;
        }
        let state = self.request.state.clone();
        tokio::select! {
            _ = state.aborted_locally() => Next::Aborted,
            received = tokio::time::timeout_at(deadline, self.inbox.recv()) => match received {
                Ok(Some(message)) => Next::Message(message),
                // Движок остановлен
                Ok(None) => Next::Aborted,
                Err(_) => Next::Timeout,
            },
        }
    }
}

/// Размер чанка `index` для файла размера `size`
fn expected_len(index: u64, size: u64, chunk_size: u32) -> u64 {
    let offset = index * chunk_size as u64;
    size.saturating_sub(offset).min(chunk_size as u64)
}
