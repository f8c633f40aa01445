//! Состояние передачи и объекты, которые получает вызывающий код
//!
//! `FileRequest` - входящая передача (скачивание), `FileUpload` - исходящая.
//! Оба - дешёвые клоны одного общего состояния. Движок хранит только
//! слабые ссылки и очередь сообщений, владеет передачей вызывающий код.

use crate::protocol::TransferId;
use crate::stats::transfer_rate_mbps;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Состояние передачи
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Создана, ждёт подтверждения (принудительная загрузка)
    Inactive,
    Active,
    Completed,
    /// Файла нет на удалённой стороне
    NotFound,
    /// Нет данных в течение окна ожидания после всех повторов
    Timeout,
    /// Отменена
    Aborted,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::NotFound | Self::Timeout | Self::Aborted)
    }

    /// Допустим ли переход `self -> to`
    pub fn can_become(&self, to: TransferStatus) -> bool {
        match (self, to) {
            (Self::Inactive, Self::Active) => true,
            (Self::Inactive, Self::Aborted) => true,
            (Self::Active, to) => to.is_terminal(),
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::NotFound => "notFound",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Куда направлена передача
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTarget {
    /// Конкретное устройство (`host:port`)
    Device(String),
    /// Всем известным устройствам
    Broadcast,
}

impl std::fmt::Display for TransferTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device(addr) => f.write_str(addr),
            Self::Broadcast => f.write_str("broadcast"),
        }
    }
}

/// Управление передачей со стороны движка
pub(crate) trait TransferControl: Send + Sync {
    /// Передача отменена локально (переход в aborted уже выполнен)
    fn aborted(&self, id: TransferId);
    /// Принудительная загрузка подтверждена (переход в active уже выполнен)
    fn accepted(&self, id: TransferId);
}

/// Общее состояние одной передачи
pub(crate) struct TransferState {
    pub(crate) id: TransferId,
    status: watch::Sender<TransferStatus>,
    total_size: AtomicU64,
    transferred: AtomicU64,
    chunks: AtomicU64,
    retries: AtomicU32,
    /// Удалённая сторона готова (для отправки: получатель принял предложение)
    remote_ready: AtomicBool,
    last_activity: Mutex<Instant>,
    started: Mutex<Option<Instant>>,
    elapsed: Mutex<Option<Duration>>,
    control: Mutex<Option<Weak<dyn TransferControl>>>,
}

impl TransferState {
    pub(crate) fn new(id: TransferId, status: TransferStatus, total_size: u64) -> Arc<Self> {
        let (status_tx, _) = watch::channel(status);
        let started = (status == TransferStatus::Active).then(Instant::now);
        Arc::new(Self {
            id,
            status: status_tx,
            total_size: AtomicU64::new(total_size),
            transferred: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            retries: AtomicU32::new(0),
            remote_ready: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            started: Mutex::new(started),
            elapsed: Mutex::new(None),
            control: Mutex::new(None),
        })
    }

    pub(crate) fn set_control(&self, control: Weak<dyn TransferControl>) {
        *crate::network::transport::lock(&self.control) = Some(control);
    }

    fn control(&self) -> Option<Arc<dyn TransferControl>> {
        crate::network::transport::lock(&self.control)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub(crate) fn status(&self) -> TransferStatus {
        *self.status.borrow()
    }

    /// Атомарный переход состояния. true - переход выполнен этим вызовом
    pub(crate) fn transition(&self, to: TransferStatus) -> bool {
        let changed = self.status.send_if_modified(|current| {
            if current.can_become(to) {
                *current = to;
                true
            } else {
                false
            }
        });
        if changed {
            let mut started = crate::network::transport::lock(&self.started);
            if to == TransferStatus::Active {
                *started = Some(Instant::now());
            } else if to.is_terminal() {
                *crate::network::transport::lock(&self.elapsed) =
                    Some(started.map(|s| s.elapsed()).unwrap_or_default());
            }
        }
        changed
    }

    /// Подписка на изменения состояния
    pub(crate) fn subscribe(&self) -> watch::Receiver<TransferStatus> {
        self.status.subscribe()
    }

    pub(crate) fn set_total_size(&self, size: u64) {
        self.total_size.store(size, Ordering::SeqCst);
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::SeqCst)
    }

    /// Принят очередной чанк
    pub(crate) fn add_chunk(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::SeqCst);
        self.chunks.fetch_add(1, Ordering::SeqCst);
    }

    /// Продвинуть счётчик переданных байт (только вперёд)
    pub(crate) fn advance_to(&self, bytes: u64) {
        let bytes = bytes.min(self.total_size());
        let previous = self.transferred.fetch_max(bytes, Ordering::SeqCst);
        if bytes > previous {
            self.chunks.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    pub(crate) fn chunks(&self) -> u64 {
        self.chunks.load(Ordering::SeqCst)
    }

    pub(crate) fn add_retry(&self) -> u32 {
        self.retries.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn retries(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    /// Отметить активность удалённой стороны
    pub(crate) fn touch(&self) {
        *crate::network::transport::lock(&self.last_activity) = Instant::now();
    }

    /// Сколько времени удалённая сторона молчит
    pub(crate) fn idle(&self) -> Duration {
        crate::network::transport::lock(&self.last_activity).elapsed()
    }

    pub(crate) fn set_remote_ready(&self) {
        self.remote_ready.store(true, Ordering::SeqCst);
        self.touch();
    }

    pub(crate) fn is_remote_ready(&self) -> bool {
        self.remote_ready.load(Ordering::SeqCst)
    }

    pub(crate) fn progress(&self) -> f32 {
        let total = self.total_size();
        if total == 0 {
            return if self.status() == TransferStatus::Completed { 1.0 } else { 0.0 };
        }
        (self.transferred() as f64 / total as f64).clamp(0.0, 1.0) as f32
    }

    pub(crate) fn elapsed(&self) -> Duration {
        if let Some(elapsed) = *crate::network::transport::lock(&self.elapsed) {
            return elapsed;
        }
        crate::network::transport::lock(&self.started)
            .map(|s| s.elapsed())
            .unwrap_or_default()
    }

    /// Отменить локально. Безопасно вызывать в любом состоянии
    pub(crate) fn abort(&self) {
        if self.transition(TransferStatus::Aborted) {
            if let Some(control) = self.control() {
                control.aborted(self.id);
            }
        }
    }

    /// Запустить ожидающую передачу
    pub(crate) fn start(&self) -> bool {
        if self.transition(TransferStatus::Active) {
            if let Some(control) = self.control() {
                control.accepted(self.id);
            }
            return true;
        }
        false
    }

    /// Дождаться локальной отмены
    pub(crate) async fn aborted_locally(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|s| *s == TransferStatus::Aborted).await;
    }

    /// Дождаться конечного состояния
    pub(crate) async fn finished(&self) -> TransferStatus {
        let mut rx = self.subscribe();
        let status = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }
}

/// Параметры входящей передачи
#[derive(Debug, Clone)]
pub(crate) struct RequestInfo {
    pub(crate) file_name: String,
    pub(crate) save_name: String,
    pub(crate) chunk_size: u32,
    /// Адрес устройства-источника
    pub(crate) device: String,
    /// Загрузка инициирована удалённой стороной
    pub(crate) forced: bool,
    /// Кто отправил (для принудительной загрузки)
    pub(crate) sender: Option<String>,
}

/// Входящая передача (скачивание файла)
#[derive(Clone)]
pub struct FileRequest {
    pub(crate) state: Arc<TransferState>,
    pub(crate) info: Arc<RequestInfo>,
}

impl FileRequest {
    pub(crate) fn new(state: Arc<TransferState>, info: RequestInfo) -> Self {
        Self {
            state,
            info: Arc::new(info),
        }
    }

    pub fn id(&self) -> TransferId {
        self.state.id
    }

    /// Имя файла на удалённой стороне
    pub fn file_name(&self) -> &str {
        &self.info.file_name
    }

    /// Имя, под которым файл сохраняется локально
    pub fn save_name(&self) -> &str {
        &self.info.save_name
    }

    /// Адрес устройства-источника
    pub fn device(&self) -> &str {
        &self.info.device
    }

    /// Имя отправителя принудительной загрузки
    pub fn sender(&self) -> Option<&str> {
        self.info.sender.as_deref()
    }

    pub fn is_forced(&self) -> bool {
        self.info.forced
    }

    pub fn chunk_size(&self) -> u32 {
        self.info.chunk_size
    }

    /// Размер файла (0 - ещё неизвестен)
    pub fn total_size(&self) -> u64 {
        self.state.total_size()
    }

    pub fn received_bytes(&self) -> u64 {
        self.state.transferred()
    }

    /// Количество принятых чанков
    pub fn chunks_received(&self) -> u64 {
        self.state.chunks()
    }

    pub fn retries(&self) -> u32 {
        self.state.retries()
    }

    pub fn status(&self) -> TransferStatus {
        self.state.status()
    }

    /// Прогресс 0..1
    pub fn progress(&self) -> f32 {
        self.state.progress()
    }

    pub fn elapsed(&self) -> Duration {
        self.state.elapsed()
    }

    /// Скорость передачи в MB/s
    pub fn transfer_rate(&self) -> f64 {
        transfer_rate_mbps(self.state.transferred(), self.state.elapsed())
    }

    /// Подтвердить принудительную загрузку
    pub fn start(&self) -> bool {
        self.state.start()
    }

    pub fn abort(&self) {
        self.state.abort();
    }

    /// Освободить передачу. Незавершённая передача отменяется
    pub fn dispose(&self) {
        self.state.abort();
    }

    /// Тот же ли это объект передачи (для фильтрации событий)
    pub fn is_same(&self, other: &FileRequest) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Дождаться завершения
    pub async fn wait(&self) -> TransferStatus {
        self.state.finished().await
    }
}

impl std::fmt::Debug for FileRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRequest")
            .field("id", &self.state.id)
            .field("file_name", &self.info.file_name)
            .field("device", &self.info.device)
            .field("status", &self.status())
            .field("received", &self.received_bytes())
            .finish()
    }
}

/// Исходящая передача
#[derive(Clone)]
pub struct FileUpload {
    pub(crate) state: Arc<TransferState>,
    pub(crate) file_name: Arc<str>,
    pub(crate) target: TransferTarget,
    /// Для рассылки всем: отдельные передачи по устройствам
    pub(crate) children: Arc<Vec<FileUpload>>,
}

impl FileUpload {
    pub(crate) fn new(state: Arc<TransferState>, file_name: &str, target: TransferTarget) -> Self {
        Self {
            state,
            file_name: Arc::from(file_name),
            target,
            children: Arc::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TransferId {
        self.state.id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn target(&self) -> &TransferTarget {
        &self.target
    }

    pub fn status(&self) -> TransferStatus {
        self.state.status()
    }

    /// Прогресс 0..1. Для рассылки - доля устройств, которым файл отправлен
    pub fn progress(&self) -> f32 {
        if self.children.is_empty() {
            return self.state.progress();
        }
        let sent = self.sent_to().len();
        sent as f32 / self.children.len() as f32
    }

    pub fn sent_bytes(&self) -> u64 {
        self.state.transferred()
    }

    pub fn elapsed(&self) -> Duration {
        self.state.elapsed()
    }

    /// Для рассылки: устройства, получившие файл полностью
    pub fn sent_to(&self) -> Vec<String> {
        self.children
            .iter()
            .filter(|c| c.status() == TransferStatus::Completed)
            .map(|c| c.target.to_string())
            .collect()
    }

    /// Для рассылки: устройства, которым файл не отправлен
    pub fn not_sent_to(&self) -> Vec<String> {
        self.children
            .iter()
            .filter(|c| c.status() != TransferStatus::Completed)
            .map(|c| c.target.to_string())
            .collect()
    }

    pub fn abort(&self) {
        for child in self.children.iter() {
            child.abort();
        }
        self.state.abort();
    }

    pub fn dispose(&self) {
        self.abort();
    }

    pub fn is_same(&self, other: &FileUpload) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub async fn wait(&self) -> TransferStatus {
        self.state.finished().await
    }

    pub(crate) fn downgrade(&self) -> WeakFileUpload {
        WeakFileUpload {
            state: Arc::downgrade(&self.state),
            file_name: self.file_name.clone(),
            target: self.target.clone(),
        }
    }
}

/// Слабая ссылка на отправку (в таблицах движка)
#[derive(Clone)]
pub(crate) struct WeakFileUpload {
    state: Weak<TransferState>,
    file_name: Arc<str>,
    target: TransferTarget,
}

impl WeakFileUpload {
    pub(crate) fn upgrade(&self) -> Option<FileUpload> {
        Some(FileUpload {
            state: self.state.upgrade()?,
            file_name: self.file_name.clone(),
            target: self.target.clone(),
            children: Arc::new(Vec::new()),
        })
    }
}

impl std::fmt::Debug for FileUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileUpload")
            .field("id", &self.state.id)
            .field("file_name", &self.file_name)
            .field("target", &self.target)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn state(status: TransferStatus, size: u64) -> Arc<TransferState> {
        TransferState::new(Uuid::new_v4(), status, size)
    }

    // === Тесты переходов ===

    #[test]
    fn test_transitions_follow_state_machine() {
        let s = state(TransferStatus::Inactive, 10);
        assert!(!s.transition(TransferStatus::Completed));
        assert!(s.transition(TransferStatus::Active));
        assert!(!s.transition(TransferStatus::Inactive));
        assert!(s.transition(TransferStatus::Completed));
        assert!(!s.transition(TransferStatus::Aborted));
        assert_eq!(s.status(), TransferStatus::Completed);
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            TransferStatus::Completed,
            TransferStatus::NotFound,
            TransferStatus::Timeout,
            TransferStatus::Aborted,
        ] {
            assert!(terminal.is_terminal());
            for to in [TransferStatus::Inactive, TransferStatus::Active, TransferStatus::Completed] {
                assert!(!terminal.can_become(to));
            }
        }
    }

    #[test]
    fn test_double_abort_is_noop() {
        let s = state(TransferStatus::Active, 10);
        s.abort();
        s.abort();
        assert_eq!(s.status(), TransferStatus::Aborted);
    }

    // === Тесты прогресса ===

    #[test]
    fn test_progress_is_monotonic_and_bounded() {
        let s = state(TransferStatus::Active, 100);
        assert_eq!(s.progress(), 0.0);

        s.advance_to(40);
        assert!((s.progress() - 0.4).abs() < 1e-6);
        s.advance_to(20);
        assert!((s.progress() - 0.4).abs() < 1e-6);
        s.advance_to(500);
        assert_eq!(s.progress(), 1.0);
    }

    #[test]
    fn test_progress_unknown_size_is_zero() {
        let s = state(TransferStatus::Active, 0);
        s.add_chunk(10);
        assert_eq!(s.progress(), 0.0);
    }

    #[test]
    fn test_elapsed_frozen_after_terminal() {
        let s = state(TransferStatus::Active, 10);
        std::thread::sleep(Duration::from_millis(5));
        assert!(s.transition(TransferStatus::Completed));
        let first = s.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(s.elapsed(), first);
    }

    // === Тесты FileRequest ===

    #[test]
    fn test_is_same_compares_identity() {
        let info = RequestInfo {
            file_name: "example.png".to_string(),
            save_name: "example.png".to_string(),
            chunk_size: 4096,
            device: "127.0.0.1:9527".to_string(),
            forced: false,
            sender: None,
        };
        let a = FileRequest::new(state(TransferStatus::Active, 0), info.clone());
        let b = FileRequest::new(state(TransferStatus::Active, 0), info);
        let a2 = a.clone();

        assert!(a.is_same(&a2));
        assert!(!a.is_same(&b));
    }

    #[tokio::test]
    async fn test_wait_returns_terminal_status() {
        let s = state(TransferStatus::Active, 10);
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.finished().await })
        };
        tokio::task::yield_now().await;
        s.transition(TransferStatus::Timeout);
        assert_eq!(waiter.await.unwrap(), TransferStatus::Timeout);
    }

    #[tokio::test]
    async fn test_finished_returns_at_once_when_terminal() {
        let s = state(TransferStatus::NotFound, 0);
        let status = tokio::time::timeout(Duration::from_secs(1), s.finished()).await;
        assert_eq!(status.ok(), Some(TransferStatus::NotFound));
    }

    #[test]
    fn test_weak_upload_dies_with_handle() {
        let upload = FileUpload::new(state(TransferStatus::Active, 1), "a", TransferTarget::Device("x:1".into()));
        let weak = upload.downgrade();
        assert!(weak.upgrade().is_some_and(|u| u.is_same(&upload)));
        drop(upload);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_broadcast_progress_counts_recipients() {
        let parent = state(TransferStatus::Active, 0);
        let done = FileUpload::new(state(TransferStatus::Active, 1), "a", TransferTarget::Device("10.0.0.2:1".into()));
        let pending = FileUpload::new(state(TransferStatus::Active, 1), "a", TransferTarget::Device("10.0.0.3:1".into()));
        done.state.transition(TransferStatus::Completed);

        let mut upload = FileUpload::new(parent, "a", TransferTarget::Broadcast);
        upload.children = Arc::new(vec![done, pending]);

        assert_eq!(upload.progress(), 0.5);
        assert_eq!(upload.sent_to(), vec!["10.0.0.2:1".to_string()]);
        assert_eq!(upload.not_sent_to(), vec!["10.0.0.3:1".to_string()]);
    }
}
