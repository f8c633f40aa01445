//! Движок передачи файлов
//!
//! Слушает порт передачи, держит пул исходящих соединений и разбирает
//! входящие сообщения по идентификатору передачи. Каждая передача живёт
//! сама по себе: свой таймер, свои повторы, своя очередь сообщений.

use super::discovery::{DeviceRegistry, Discovery, RemoteDevice};
use super::events::FtsEvent;
use super::gate::ConfirmationGate;
use super::receiver::{free_name, Download, DownloadOptions, DownloadOutcome};
use super::route::Route;
use super::sender::{ServeSlot, ServedFile};
use super::stress;
use super::transfer::{
    FileRequest, FileUpload, RequestInfo, TransferControl, TransferState, TransferStatus, TransferTarget,
};
use super::transport::{self, lock, Transport, TransportConfig, TransportEvent};
use crate::config::{Settings, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::error::{codes, FtsError, Result, TransportError};
use crate::protocol::{sanitize_file_name, DeviceIdentity, FileInfo, Message, TransferId};
use crate::timesync::TimeSync;
use crate::utils::{has_port, local_address, with_default_port};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

/// Сколько ждать открытия соединения или порта
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Период уборки заброшенных раздач
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Устройство: номер в списке опроса или адрес
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTarget {
    Index(usize),
    Address(String),
}

impl From<usize> for DeviceTarget {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for DeviceTarget {
    fn from(addr: &str) -> Self {
        Self::Address(addr.to_string())
    }
}

impl From<String> for DeviceTarget {
    fn from(addr: String) -> Self {
        Self::Address(addr)
    }
}

impl From<&RemoteDevice> for DeviceTarget {
    fn from(device: &RemoteDevice) -> Self {
        Self::Address(device.endpoint())
    }
}

/// Откуда пришло событие транспорта
#[derive(Debug, Clone)]
enum Origin {
    /// Слушающий порт передачи
    Server,
    /// Исходящее соединение из пула
    Client(String),
}

struct PooledLink {
    transport: Arc<dyn Transport>,
    pump: JoinHandle<()>,
}

/// Место соединения в пуле. Пока оно занято открытием, ждут только
/// обращения к тому же адресу
type LinkSlot = Arc<tokio::sync::Mutex<Option<PooledLink>>>;

/// Входящая передача в таблице движка
struct DownloadSlot {
    inbox: mpsc::UnboundedSender<Message>,
    /// Очередь принудительной загрузки, пока она ждёт подтверждения
    parked: Option<mpsc::UnboundedReceiver<Message>>,
    state: Weak<TransferState>,
    info: Arc<RequestInfo>,
    route: Route,
}

impl DownloadSlot {
    fn request(&self) -> Option<FileRequest> {
        Some(FileRequest {
            state: self.state.upgrade()?,
            info: self.info.clone(),
        })
    }
}

struct Inner {
    this: Weak<Inner>,
    runtime: tokio::runtime::Handle,
    settings: Mutex<Settings>,
    identity: Arc<Mutex<DeviceIdentity>>,
    events: mpsc::UnboundedSender<FtsEvent>,
    registry: Arc<DeviceRegistry>,
    gate: ConfirmationGate,
    clock: Arc<TimeSync>,
    server: Arc<dyn Transport>,
    pool: Mutex<HashMap<String, LinkSlot>>,
    downloads: Mutex<HashMap<TransferId, DownloadSlot>>,
    serving: Mutex<HashMap<TransferId, ServeSlot>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Движок передачи файлов
pub struct FileTransferService {
    inner: Arc<Inner>,
    discovery: Discovery,
}

impl FileTransferService {
    /// Открыть порт передачи и порт опроса, начать принимать запросы
    pub async fn start(settings: Settings, events: mpsc::UnboundedSender<FtsEvent>) -> Result<Self> {
        let settings = settings.normalized();
        for dir in [settings.shared_dir(), settings.download_dir()] {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                tracing::warn!("Не удалось создать папку {}: {}", dir.display(), e);
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = transport::server(settings.transport_type, tx);
        server.setup(TransportConfig::listen(settings.port).with_ip_mode(settings.ip_mode));
        server.connect().await;
        await_open(&mut rx).await?;

        let port = server.local_addr().map(|a| a.port()).unwrap_or(settings.port);
        let identity = Arc::new(Mutex::new(DeviceIdentity::local(
            settings.device_name.clone(),
            local_address(settings.ip_mode),
            port,
            settings.server_enabled,
        )));
        let registry = Arc::new(DeviceRegistry::new());

        tracing::info!(
            "Движок запущен: {} порт {}, раздача {}, загрузки {}",
            settings.transport_type,
            port,
            settings.shared_dir().display(),
            settings.download_dir().display()
        );

        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            runtime: tokio::runtime::Handle::current(),
            gate: ConfirmationGate::new(settings.confirmation_queue),
            settings: Mutex::new(settings.clone()),
            identity: identity.clone(),
            events: events.clone(),
            registry: registry.clone(),
            clock: TimeSync::global(),
            server: server.clone(),
            pool: Mutex::new(HashMap::new()),
            downloads: Mutex::new(HashMap::new()),
            serving: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let server_pump = tokio::spawn(pump(Arc::downgrade(&inner), Arc::downgrade(&server), rx, Origin::Server));
        let housekeeping = tokio::spawn(housekeeping(Arc::downgrade(&inner)));
        lock(&inner.tasks).extend([server_pump, housekeeping]);

        let discovery = Discovery::start(settings.discovery_port, settings.ip_mode, identity, registry, events).await?;

        Ok(Self { inner, discovery })
    }

    /// Текущие настройки
    pub fn settings(&self) -> Settings {
        self.inner.settings()
    }

    /// Применить настройки на ходу. Порт и тип транспорта меняются только перезапуском
    pub fn update_settings(&self, settings: Settings) {
        let settings = settings.normalized();
        let current = self.inner.settings();
        if settings.port != current.port || settings.transport_type != current.transport_type {
            tracing::warn!("Порт и транспорт применятся после перезапуска движка");
        }
        {
            let mut identity = lock(&self.inner.identity);
            identity.name = settings.device_name.clone();
            identity.is_server = settings.server_enabled;
        }
        *lock(&self.inner.settings) = settings;
    }

    /// Описание этого устройства в ответах на опрос
    pub fn identity(&self) -> DeviceIdentity {
        lock(&self.inner.identity).clone()
    }

    /// Адрес порта передачи
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.server.local_addr()
    }

    /// Порт передачи
    pub fn port(&self) -> u16 {
        self.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Порт опроса устройств
    pub fn discovery_port(&self) -> u16 {
        self.discovery.port()
    }

    /// Общие часы процесса: метки стресс-кадров и ответы на запросы времени
    pub fn clock(&self) -> Arc<TimeSync> {
        self.inner.clock.clone()
    }

    /// Очередь принудительных загрузок, ждущих подтверждения
    pub fn gate(&self) -> &ConfirmationGate {
        &self.inner.gate
    }

    // === Соединения ===

    /// Открыть (или переиспользовать) соединение с устройством
    pub async fn connect(&self, target: impl Into<DeviceTarget>) -> Result<()> {
        let addr = self.inner.resolve_target(target.into())?;
        self.inner.route_to(&addr).await.map(|_| ())
    }

    /// Закрыть соединение с устройством. Идущие через него передачи
    /// завершатся по своим таймерам
    pub async fn disconnect(&self, target: impl Into<DeviceTarget>) -> Result<()> {
        let addr = self.inner.resolve_target(target.into())?;
        let slot = lock(&self.inner.pool).get(&addr).cloned();
        let Some(slot) = slot else { return Ok(()) };
        let link = slot.lock().await.take();
        if let Some(link) = link {
            link.pump.abort();
            link.transport.disconnect().await;
            tracing::info!("Отключено от {}", addr);
            self.inner.emit(FtsEvent::Disconnected(addr));
        }
        Ok(())
    }

    /// Адреса открытых исходящих соединений
    pub async fn connections(&self) -> Vec<String> {
        let slots: Vec<(String, LinkSlot)> = lock(&self.inner.pool)
            .iter()
            .map(|(addr, slot)| (addr.clone(), slot.clone()))
            .collect();
        // Соединения, которые ещё открываются, не считаются
        let mut addrs: Vec<String> = slots
            .into_iter()
            .filter(|(_, slot)| {
                slot.try_lock()
                    .is_ok_and(|link| link.as_ref().is_some_and(|l| l.transport.is_open()))
            })
            .map(|(addr, _)| addr)
            .collect();
        addrs.sort();
        addrs
    }

    // === Передачи ===

    /// Запросить файл из папки раздачи устройства
    pub async fn request_file(&self, target: impl Into<DeviceTarget>, file_name: &str) -> Result<FileRequest> {
        self.request_file_as(target, file_name, file_name).await
    }

    /// Запросить файл и сохранить его под другим именем
    pub async fn request_file_as(
        &self,
        target: impl Into<DeviceTarget>,
        file_name: &str,
        save_name: &str,
    ) -> Result<FileRequest> {
        let name = sanitize_file_name(file_name).ok_or_else(|| FtsError::NotFound(file_name.to_string()))?;
        let save_name = sanitize_file_name(save_name).unwrap_or_else(|| name.clone());
        let addr = self.inner.resolve_target(target.into())?;
        let route = self.inner.route_to(&addr).await?;
        Ok(self.inner.begin_download(route, &addr, name, save_name))
    }

    /// Отправить файл устройству. `is_full_path` - путь абсолютный,
    /// иначе имя файла в папке раздачи
    pub async fn send_file(
        &self,
        target: impl Into<DeviceTarget>,
        path: &str,
        is_full_path: bool,
    ) -> Result<FileUpload> {
        let info = self.inner.local_file(path, is_full_path)?;
        let addr = self.inner.resolve_target(target.into())?;
        let route = self.inner.route_to(&addr).await?;
        self.inner.begin_upload(route, &addr, &info).await
    }

    /// Разослать файл всем устройствам из списка опроса
    pub async fn broadcast_file(&self, path: &str, is_full_path: bool) -> Result<FileUpload> {
        let info = self.inner.local_file(path, is_full_path)?;
        let devices = self.inner.registry.list();
        if devices.is_empty() {
            return Err(FtsError::UnknownDevice("список устройств пуст".to_string()));
        }

        // Устройства подключаются параллельно, недоступное не задерживает остальные
        let endpoints: Vec<String> = devices.iter().map(RemoteDevice::endpoint).collect();
        let mut starting = JoinSet::new();
        for (index, endpoint) in endpoints.iter().cloned().enumerate() {
            let inner = self.inner.clone();
            let info = info.clone();
            starting.spawn_on(
                async move {
                    let started = match inner.route_to(&endpoint).await {
                        Ok(route) => inner.begin_upload(route, &endpoint, &info).await,
                        Err(e) => Err(e),
                    };
                    (index, started)
                },
                &self.inner.runtime,
            );
        }

        let mut started: Vec<Option<FileUpload>> = vec![None; endpoints.len()];
        while let Some(joined) = starting.join_next().await {
            match joined {
                Ok((index, Ok(upload))) => started[index] = Some(upload),
                Ok((index, Err(e))) => tracing::warn!("Рассылка: {} недоступно: {}", endpoints[index], e),
                Err(e) => tracing::error!("Рассылка: задача подключения упала: {}", e),
            }
        }
        let children: Vec<FileUpload> = started
            .into_iter()
            .zip(&endpoints)
            .map(|(upload, endpoint)| upload.unwrap_or_else(|| failed_upload(&info.name, endpoint)))
            .collect();

        let state = TransferState::new(Uuid::new_v4(), TransferStatus::Active, 0);
        let mut upload = FileUpload::new(state, &info.name, TransferTarget::Broadcast);
        upload.children = Arc::new(children);
        tracing::info!("Рассылка {} на {} устройств", info.name, upload.children.len());

        let parent = upload.clone();
        let this = self.inner.this.clone();
        self.inner.runtime.spawn(async move {
            for child in parent.children.iter() {
                child.wait().await;
            }
            if parent.state.transition(TransferStatus::Completed) {
                tracing::info!(
                    "Рассылка {} завершена: отправлено {}, не отправлено {}",
                    parent.file_name(),
                    parent.sent_to().len(),
                    parent.not_sent_to().len()
                );
                if let Some(inner) = this.upgrade() {
                    inner.emit(FtsEvent::UploadFinished(parent.clone()));
                }
            }
        });
        Ok(upload)
    }

    // === Опрос устройств ===

    /// Отправить запрос опроса (широковещательно или на адрес)
    pub async fn send_poll_request(&self, target: Option<&str>) {
        self.discovery.send_poll_request(target).await;
    }

    /// Опросить и подождать ответы
    pub async fn poll_devices(&self, target: Option<&str>, window: Duration) -> Vec<RemoteDevice> {
        self.discovery.poll_devices(target, window).await
    }

    pub fn get_device_list(&self) -> Vec<RemoteDevice> {
        self.discovery.get_device_list()
    }

    pub fn reset_device_list(&self) {
        self.discovery.reset_device_list();
    }

    /// Остановить движок: закрыть все соединения и порт
    pub async fn shutdown(&self) {
        let slots: Vec<LinkSlot> = lock(&self.inner.pool).drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            let link = slot.lock().await.take();
            if let Some(link) = link {
                link.pump.abort();
                link.transport.disconnect().await;
            }
        }
        self.inner.server.disconnect().await;
        lock(&self.inner.downloads).clear();
        lock(&self.inner.serving).clear();
        tracing::info!("Движок остановлен");
    }
}

impl Inner {
    fn settings(&self) -> Settings {
        lock(&self.settings).clone()
    }

    fn emit(&self, event: FtsEvent) {
        let _ = self.events.send(event);
    }

    fn control(&self) -> Weak<dyn TransferControl> {
        self.this.clone()
    }

    fn spawn_send(&self, route: Route, message: Message) {
        self.runtime.spawn(async move { route.send(&message).await });
    }

    /// Адрес `host:port` для запроса
    fn resolve_target(&self, target: DeviceTarget) -> Result<String> {
        match target {
            DeviceTarget::Index(index) => self
                .registry
                .get(index)
                .map(|d| d.endpoint())
                .ok_or_else(|| FtsError::UnknownDevice(format!("#{}", index))),
            DeviceTarget::Address(addr) => {
                let addr = addr.trim();
                if addr.is_empty() {
                    return Err(FtsError::InvalidAddress(addr.to_string()));
                }
                if has_port(addr) || addr.starts_with("ws://") || addr.starts_with("wss://") {
                    return Ok(addr.to_string());
                }
                Ok(self
                    .registry
                    .find(addr)
                    .map(|d| d.endpoint())
                    .unwrap_or_else(|| with_default_port(addr, self.settings().port)))
            }
        }
    }

    /// Локальный файл для отправки
    fn local_file(&self, path: &str, is_full_path: bool) -> Result<FileInfo> {
        let path = if is_full_path {
            PathBuf::from(path)
        } else {
            let name = sanitize_file_name(path).ok_or_else(|| FtsError::NotFound(path.to_string()))?;
            self.settings().shared_dir().join(name)
        };
        FileInfo::new(path.clone()).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FtsError::NotFound(path.display().to_string()),
            _ => FtsError::Io(e),
        })
    }

    /// Соединение с `addr` из пула (или новое)
    async fn route_to(&self, addr: &str) -> Result<Route> {
        let slot = lock(&self.pool).entry(addr.to_string()).or_default().clone();
        let mut link = slot.lock().await;
        if let Some(existing) = link.as_ref() {
            if existing.transport.is_open() {
                return Ok(Route::client(existing.transport.clone(), addr));
            }
        }
        if let Some(stale) = link.take() {
            stale.pump.abort();
        }

        let settings = self.settings();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = transport::client(settings.transport_type, tx);
        transport.setup(TransportConfig::remote(addr).with_ip_mode(settings.ip_mode));
        transport.connect().await;
        if let Err(e) = await_open(&mut rx).await {
            transport.disconnect().await;
            if let FtsError::Transport(error) = &e {
                self.emit(FtsEvent::TransportError(Some(addr.to_string()), error.clone()));
            }
            return Err(e);
        }

        let pump = self.runtime.spawn(pump(
            self.this.clone(),
            Arc::downgrade(&transport),
            rx,
            Origin::Client(addr.to_string()),
        ));
        *link = Some(PooledLink {
            transport: transport.clone(),
            pump,
        });
        tracing::info!("Подключено к {} ({})", addr, settings.transport_type);
        self.emit(FtsEvent::Connected(addr.to_string()));
        Ok(Route::client(transport, addr))
    }

    /// Убрать закрывшееся соединение из пула
    async fn evict(&self, addr: &str, transport: &Arc<dyn Transport>) {
        let slot = lock(&self.pool).get(addr).cloned();
        let Some(slot) = slot else { return };
        let mut link = slot.lock().await;
        let same = link
            .as_ref()
            .is_some_and(|l| Arc::as_ptr(&l.transport) as *const () == Arc::as_ptr(transport) as *const ());
        if same {
            *link = None;
        }
    }

    // === Скачивание ===

    fn begin_download(&self, route: Route, addr: &str, name: String, save_name: String) -> FileRequest {
        let settings = self.settings();
        let id = Uuid::new_v4();
        let state = TransferState::new(id, TransferStatus::Active, 0);
        state.set_control(self.control());
        let request = FileRequest::new(
            state,
            RequestInfo {
                file_name: name,
                save_name,
                chunk_size: settings.chunk_size,
                device: addr.to_string(),
                forced: false,
                sender: None,
            },
        );

        let (inbox, rx) = mpsc::unbounded_channel();
        lock(&self.downloads).insert(
            id,
            DownloadSlot {
                inbox,
                parked: None,
                state: Arc::downgrade(&request.state),
                info: request.info.clone(),
                route: route.clone(),
            },
        );
        tracing::info!("Запрос {} у {}", request.file_name(), addr);
        self.spawn_download(request.clone(), route, rx);
        request
    }

    fn spawn_download(&self, request: FileRequest, route: Route, inbox: mpsc::UnboundedReceiver<Message>) {
        let settings = self.settings();
        let options = DownloadOptions {
            timeout: settings.timeout(),
            max_retries: settings.max_retries,
            window: settings.window,
            save_path: settings.download_dir().join(request.save_name()),
        };
        let this = self.this.clone();
        self.runtime.spawn(async move {
            let outcome = Download::new(request.clone(), route, inbox, options).run().await;
            match this.upgrade() {
                Some(inner) => inner.finish_download(&request, outcome),
                None => {
                    request.state.transition(outcome.status());
                }
            }
        });
    }

    fn finish_download(&self, request: &FileRequest, outcome: DownloadOutcome) {
        lock(&self.downloads).remove(&request.id());
        if !request.state.transition(outcome.status()) {
            return;
        }
        let request = request.clone();
        let event = match outcome {
            DownloadOutcome::Completed => FtsEvent::DownloadFinished(request),
            DownloadOutcome::NotFound => {
                tracing::info!("{} не найден на {}", request.file_name(), request.device());
                FtsEvent::DownloadNotFound(request)
            }
            DownloadOutcome::Timeout => FtsEvent::DownloadTimeout(request),
            DownloadOutcome::Cancelled => {
                tracing::info!("{} отменён удалённой стороной", request.file_name());
                FtsEvent::DownloadCancelled(request)
            }
            DownloadOutcome::Failed(error) => FtsEvent::DownloadFailed(request, error),
            DownloadOutcome::Aborted => return,
        };
        self.emit(event);
    }

    /// Предложение принять файл от другого устройства
    async fn on_push_offer(&self, route: Route, id: TransferId, filename: String, size: u64, chunk_size: u32, sender: String) {
        let Some(name) = sanitize_file_name(&filename) else {
            tracing::warn!("Ошибка протокола: недопустимое имя файла {:?} от {}", filename, route.label());
            route.send(&Message::PushReject { id }).await;
            return;
        };
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            tracing::warn!("Ошибка протокола: размер чанка {} от {}", chunk_size, route.label());
            route.send(&Message::PushReject { id }).await;
            return;
        }
        if lock(&self.downloads).contains_key(&id) {
            return;
        }

        // Присланный файл не затирает уже существующий
        let save_name = free_name(&self.settings().download_dir(), &name).await;
        let state = TransferState::new(id, TransferStatus::Inactive, size);
        state.set_control(self.control());
        let request = FileRequest::new(
            state,
            RequestInfo {
                file_name: name,
                save_name,
                chunk_size,
                device: route.label().to_string(),
                forced: true,
                sender: Some(sender),
            },
        );
        let (inbox, parked) = mpsc::unbounded_channel();
        lock(&self.downloads).insert(
            id,
            DownloadSlot {
                inbox,
                parked: Some(parked),
                state: Arc::downgrade(&request.state),
                info: request.info.clone(),
                route,
            },
        );

        tracing::info!(
            "{} предлагает {} ({} байт)",
            request.sender().unwrap_or("?"),
            request.file_name(),
            size
        );
        if self.settings().auto_download {
            request.start();
        } else if self.gate.ask_for_confirmation(request.clone()) {
            self.emit(FtsEvent::ConfirmationRequested(request));
        } else {
            request.abort();
        }
    }

    /// Сообщение для идущего скачивания
    fn deliver(&self, message: Message) {
        let Some(id) = message.transfer_id() else { return };
        let downloads = lock(&self.downloads);
        match downloads.get(&id) {
            Some(slot) => {
                let _ = slot.inbox.send(message);
            }
            None => match message {
                Message::Error { message, .. } => tracing::warn!("Ошибка от собеседника по {}: {}", id, message),
                _ => tracing::debug!("Ошибка протокола: сообщение для неактивной передачи {}", id),
            },
        }
    }

    // === Раздача и отправка ===

    async fn begin_upload(&self, route: Route, addr: &str, info: &FileInfo) -> Result<FileUpload> {
        let settings = self.settings();
        let file = ServedFile::open(info, settings.chunk_size).await?;
        let id = Uuid::new_v4();
        let state = TransferState::new(id, TransferStatus::Active, info.size);
        state.set_control(self.control());
        let upload = FileUpload::new(state, &info.name, TransferTarget::Device(addr.to_string()));

        lock(&self.serving).insert(id, ServeSlot::new(file, route.clone(), Some(upload.downgrade())));
        let sender = lock(&self.identity).name.clone();
        route
            .send(&Message::PushOffer {
                id,
                filename: info.name.clone(),
                size: info.size,
                chunk_size: settings.chunk_size,
                sender,
            })
            .await;
        tracing::info!("Предложение {} -> {}", info.name, addr);

        self.spawn_upload_watchdog(upload.clone(), route, &settings);
        Ok(upload)
    }

    /// Таймаут отправки: до подтверждения ждём решения получателя,
    /// после - запросов чанков
    fn spawn_upload_watchdog(&self, upload: FileUpload, route: Route, settings: &Settings) {
        let active_limit = settings.timeout() * (settings.max_retries + 1);
        let confirm_limit = settings.confirm_timeout();
        let tick = (settings.timeout() / 4).max(Duration::from_millis(20));
        let this = self.this.clone();

        self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = upload.state.finished() => return,
                    _ = tokio::time::sleep(tick) => {}
                }
                let limit = if upload.state.is_remote_ready() { active_limit } else { confirm_limit };
                if upload.state.idle() < limit {
                    continue;
                }
                if upload.state.transition(TransferStatus::Timeout) {
                    tracing::warn!("{}: {} не отвечает", upload.file_name(), upload.target());
                    if let Some(inner) = this.upgrade() {
                        lock(&inner.serving).remove(&upload.id());
                        inner.emit(FtsEvent::UploadTimeout(upload.clone()));
                    }
                    route.send(&Message::Abort { id: upload.id() }).await;
                }
                return;
            }
        });
    }

    async fn serve_request(&self, route: Route, id: TransferId, filename: &str, chunk_size: u32) {
        let settings = self.settings();
        if !settings.server_enabled {
            tracing::info!("Запрос {} от {} отклонён: раздача выключена", filename, route.label());
            route.send(&Message::FileNotFound { id }).await;
            return;
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            tracing::warn!("Ошибка протокола: размер чанка {} от {}", chunk_size, route.label());
            let message = format!("Недопустимый размер чанка {}", chunk_size);
            route.send(&Message::Error { id: Some(id), message }).await;
            return;
        }
        let served = match sanitize_file_name(filename) {
            Some(name) => ServedFile::open_shared(&settings.shared_dir(), &name, chunk_size).await,
            None => None,
        };
        let Some(file) = served else {
            tracing::info!("{} запросил отсутствующий файл {}", route.label(), filename);
            route.send(&Message::FileNotFound { id }).await;
            return;
        };

        let header = Message::FileHeader {
            id,
            filename: file.name.clone(),
            size: file.size,
            chunk_size,
        };
        tracing::info!("{} запросил {} ({} байт)", route.label(), file.name, file.size);
        lock(&self.serving).insert(id, ServeSlot::new(file, route.clone(), None));
        route.send(&header).await;
    }

    async fn serve_chunk(&self, route: Route, id: TransferId, index: u64) {
        let found = {
            let mut serving = lock(&self.serving);
            serving.get_mut(&id).map(|slot| {
                slot.last_activity = Instant::now();
                (slot.file.clone(), slot.upload.clone())
            })
        };
        let Some((file, upload)) = found else {
            tracing::debug!("Ошибка протокола: запрос чанка {} неизвестной передачи {}", index, id);
            route.send(&Message::Abort { id }).await;
            return;
        };

        match file.read_chunk(index).await {
            Ok(data) => {
                route.send(&Message::Chunk { id, index, data }).await;
                if let Some(upload) = upload.and_then(|u| u.upgrade()) {
                    upload.state.set_remote_ready();
                    upload.state.advance_to(file.bytes_through(index));
                }
            }
            Err(e) => {
                tracing::warn!("Чанк {} файла {}: {}", index, file.name, e);
                route.send(&Message::Error { id: Some(id), message: e.to_string() }).await;
            }
        }
    }

    fn on_push_accept(&self, id: TransferId) {
        let upload = lock(&self.serving).get(&id).and_then(|s| s.upload.clone());
        match upload.and_then(|u| u.upgrade()) {
            Some(upload) => {
                tracing::info!("{} принял {}", upload.target(), upload.file_name());
                upload.state.set_remote_ready();
            }
            None => tracing::debug!("Подтверждение неизвестной отправки {}", id),
        }
    }

    fn on_push_reject(&self, id: TransferId) {
        let slot = lock(&self.serving).remove(&id);
        let Some(upload) = slot.and_then(|s| s.upload).and_then(|u| u.upgrade()) else {
            return;
        };
        if upload.state.transition(TransferStatus::Aborted) {
            tracing::info!("{} отказался от {}", upload.target(), upload.file_name());
            self.emit(FtsEvent::UploadRejected(upload));
        }
    }

    fn on_transfer_done(&self, route: &Route, id: TransferId) {
        let Some(slot) = lock(&self.serving).remove(&id) else {
            return;
        };
        match slot.upload.and_then(|u| u.upgrade()) {
            Some(upload) => {
                upload.state.advance_to(slot.file.size);
                if upload.state.transition(TransferStatus::Completed) {
                    tracing::info!("✓ {} отправлен на {}", upload.file_name(), upload.target());
                    self.emit(FtsEvent::UploadFinished(upload));
                }
            }
            None => {
                tracing::info!("✓ {} отдан {}", slot.file.name, route.label());
                self.emit(FtsEvent::FileServed(slot.file.name.clone(), route.label().to_string()));
            }
        }
    }

    /// Собеседник отменил передачу
    fn on_remote_abort(&self, id: TransferId) {
        let parked = {
            let mut downloads = lock(&self.downloads);
            match downloads.get(&id) {
                Some(slot) if slot.parked.is_some() => downloads.remove(&id),
                Some(slot) => {
                    let _ = slot.inbox.send(Message::Abort { id });
                    None
                }
                None => None,
            }
        };
        if let Some(slot) = parked {
            self.gate.remove(id);
            if let Some(request) = slot.request() {
                if request.state.transition(TransferStatus::Aborted) {
                    tracing::info!("{} отозвал {}", request.sender().unwrap_or("?"), request.file_name());
                    self.emit(FtsEvent::DownloadCancelled(request));
                }
            }
        }

        let slot = lock(&self.serving).remove(&id);
        if let Some(upload) = slot.and_then(|s| s.upload).and_then(|u| u.upgrade()) {
            if upload.state.transition(TransferStatus::Aborted) {
                tracing::info!("{} отменил приём {}", upload.target(), upload.file_name());
                self.emit(FtsEvent::UploadCancelled(upload));
            }
        }
    }

    /// Соединение закрыто: раздачи через него больше не нужны
    fn drop_serving_via(&self, transport: &Arc<dyn Transport>, peer: Option<&str>) {
        lock(&self.serving).retain(|_, slot| slot.upload.is_some() || !slot.route.is_via(transport, peer));
    }

    // === Разбор входящих ===

    async fn on_transport_event(&self, transport: &Arc<dyn Transport>, origin: &Origin, event: TransportEvent) {
        match (event, origin) {
            (TransportEvent::Opened { peer: Some(peer) }, Origin::Server) => {
                tracing::info!("Входящее соединение {}", peer);
                self.emit(FtsEvent::Connected(peer));
            }
            (TransportEvent::Opened { .. }, _) => {}
            (TransportEvent::Message { data, peer }, origin) => {
                let route = match origin {
                    Origin::Server => Route::server(transport.clone(), &peer),
                    Origin::Client(addr) => Route::client(transport.clone(), addr),
                };
                self.on_data(route, data).await;
            }
            (TransportEvent::Error { peer, error }, origin) => {
                let peer = peer.or_else(|| match origin {
                    Origin::Client(addr) => Some(addr.clone()),
                    Origin::Server => None,
                });
                self.emit(FtsEvent::TransportError(peer, error));
            }
            (TransportEvent::Closed { peer }, Origin::Server) => match peer {
                Some(peer) => {
                    self.drop_serving_via(transport, Some(&peer));
                    tracing::info!("Соединение {} закрыто", peer);
                    self.emit(FtsEvent::Disconnected(peer));
                }
                None => tracing::info!("Порт передачи закрыт"),
            },
            (TransportEvent::Closed { .. }, Origin::Client(addr)) => {
                self.evict(addr, transport).await;
                self.drop_serving_via(transport, None);
                tracing::info!("Соединение с {} закрыто", addr);
                self.emit(FtsEvent::Disconnected(addr.clone()));
            }
        }
    }

    async fn on_data(&self, route: Route, data: Vec<u8>) {
        if stress::is_stress_frame(&data) {
            if let Some(reply) = stress::respond(&data, self.clock.now_ms()) {
                route.send_raw(&reply).await;
            }
            return;
        }
        match Message::from_bytes(&data) {
            Ok(message) => self.on_message(route, message).await,
            Err(e) => tracing::warn!("Ошибка протокола: нечитаемое сообщение от {}: {}", route.label(), e),
        }
    }

    async fn on_message(&self, route: Route, message: Message) {
        match message {
            Message::FileRequest { id, filename, chunk_size, .. } => {
                self.serve_request(route, id, &filename, chunk_size).await
            }
            Message::ChunkRequest { id, index } => self.serve_chunk(route, id, index).await,
            Message::PushOffer { id, filename, size, chunk_size, sender } => {
                self.on_push_offer(route, id, filename, size, chunk_size, sender).await
            }
            Message::PushAccept { id } => self.on_push_accept(id),
            Message::PushReject { id } => self.on_push_reject(id),
            Message::TransferDone { id } => self.on_transfer_done(&route, id),
            Message::Abort { id } => self.on_remote_abort(id),
            Message::TimeRequest { client_send } => {
                let server_recv = self.clock.now_ms();
                let reply = Message::TimeReply {
                    client_send,
                    server_recv,
                    server_send: self.clock.now_ms(),
                };
                route.send(&reply).await;
            }
            Message::PollRequest { .. } | Message::PollReply { .. } | Message::TimeReply { .. } => {
                tracing::debug!("Служебное сообщение от {} на порту передачи проигнорировано", route.label());
            }
            message @ (Message::FileHeader { .. }
            | Message::FileNotFound { .. }
            | Message::Chunk { .. }
            | Message::Error { .. }) => self.deliver(message),
        }
    }

    /// Убрать раздачи, по которым давно нет запросов
    fn sweep_idle(&self) {
        let settings = self.settings();
        let limit = settings.timeout() * (settings.max_retries + 2);
        lock(&self.serving).retain(|id, slot| {
            let keep = slot.upload.is_some() || slot.last_activity.elapsed() < limit;
            if !keep {
                tracing::debug!("Раздача {} ({}) заброшена", slot.file.name, id);
            }
            keep
        });
    }
}

impl TransferControl for Inner {
    fn aborted(&self, id: TransferId) {
        let parked = {
            let mut downloads = lock(&self.downloads);
            if downloads.get(&id).is_some_and(|s| s.parked.is_some()) {
                downloads.remove(&id)
            } else {
                None
            }
        };
        if let Some(slot) = parked {
            self.gate.remove(id);
            tracing::info!("Принудительная загрузка {} отклонена", slot.info.file_name);
            self.spawn_send(slot.route, Message::PushReject { id });
        }

        let served = lock(&self.serving).remove(&id);
        if let Some(slot) = served {
            if slot.upload.is_some() {
                tracing::info!("Отправка {} отменена", slot.file.name);
                self.spawn_send(slot.route, Message::Abort { id });
            }
        }
    }

    fn accepted(&self, id: TransferId) {
        let started = {
            let mut downloads = lock(&self.downloads);
            downloads.get_mut(&id).and_then(|slot| {
                let request = slot.request()?;
                let parked = slot.parked.take()?;
                Some((request, slot.route.clone(), parked))
            })
        };
        let Some((request, route, parked)) = started else {
            return;
        };
        self.gate.remove(id);
        tracing::info!("Принимаем {} от {}", request.file_name(), route.label());
        self.spawn_download(request, route, parked);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

/// Отправка, которая не началась (устройство недоступно)
fn failed_upload(name: &str, addr: &str) -> FileUpload {
    let state = TransferState::new(Uuid::new_v4(), TransferStatus::Active, 0);
    state.transition(TransferStatus::Aborted);
    FileUpload::new(state, name, TransferTarget::Device(addr.to_string()))
}

/// Дождаться `Opened` от только что запущенного транспорта
async fn await_open(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Result<()> {
    match tokio::time::timeout(OPEN_TIMEOUT, rx.recv()).await {
        Ok(Some(TransportEvent::Opened { .. })) => Ok(()),
        Ok(Some(TransportEvent::Error { error, .. })) => Err(error.into()),
        Ok(_) => Err(TransportError::new(codes::NOT_CONNECTED, "Соединение закрыто при открытии").into()),
        Err(_) => Err(FtsError::Timeout),
    }
}

/// Чтение событий одного транспорта
async fn pump(
    inner: Weak<Inner>,
    transport: Weak<dyn Transport>,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    origin: Origin,
) {
    while let Some(event) = rx.recv().await {
        let (Some(inner), Some(transport)) = (inner.upgrade(), transport.upgrade()) else {
            break;
        };
        inner.on_transport_event(&transport, &origin, event).await;
    }
}

async fn housekeeping(inner: Weak<Inner>) {
    let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        inner.sweep_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> Settings {
        Settings {
            device_name: "unit".to_string(),
            shared_folder: dir.path().join("shared"),
            shared_folder_is_absolute: true,
            download_folder: dir.path().join("downloads"),
            download_folder_is_absolute: true,
            port: 0,
            discovery_port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_device_target_conversions() {
        assert_eq!(DeviceTarget::from(2usize), DeviceTarget::Index(2));
        assert_eq!(DeviceTarget::from("10.0.0.2"), DeviceTarget::Address("10.0.0.2".to_string()));
    }

    #[tokio::test]
    async fn test_start_binds_ports_and_creates_folders() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let service = FileTransferService::start(settings(&dir), tx).await.unwrap();

        assert_ne!(service.port(), 0);
        assert_ne!(service.discovery_port(), 0);
        assert!(dir.path().join("shared").is_dir());
        assert!(dir.path().join("downloads").is_dir());
        assert_eq!(service.identity().port, service.port());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_resolve_target() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let service = FileTransferService::start(settings(&dir), tx).await.unwrap();
        let inner = &service.inner;

        assert_eq!(inner.resolve_target("10.0.0.2:7000".into()).unwrap(), "10.0.0.2:7000");
        assert_eq!(inner.resolve_target("10.0.0.2".into()).unwrap(), "10.0.0.2:0");
        assert!(matches!(inner.resolve_target(DeviceTarget::Index(0)), Err(FtsError::UnknownDevice(_))));
        assert!(matches!(inner.resolve_target("  ".into()), Err(FtsError::InvalidAddress(_))));

        inner
            .registry
            .upsert(DeviceIdentity::local("peer", "10.0.0.2", 9600, true), "10.0.0.2");
        assert_eq!(inner.resolve_target(DeviceTarget::Index(0)).unwrap(), "10.0.0.2:9600");
        assert_eq!(inner.resolve_target("10.0.0.2".into()).unwrap(), "10.0.0.2:9600");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_missing_file_fails_fast() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let service = FileTransferService::start(settings(&dir), tx).await.unwrap();

        let result = service.send_file("127.0.0.1:1", "nope.bin", false).await;
        assert!(matches!(result, Err(FtsError::NotFound(_))));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_refused_reports_transport_error() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let service = FileTransferService::start(settings(&dir), tx).await.unwrap();

        let result = service.connect("127.0.0.1:1").await;
        assert!(matches!(result, Err(FtsError::Transport(_))));
        assert!(matches!(rx.try_recv(), Ok(FtsEvent::TransportError(Some(_), _))));
        assert!(service.connections().await.is_empty());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_without_devices_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("shared")).unwrap();
        std::fs::write(dir.path().join("shared").join("a.txt"), b"a").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let service = FileTransferService::start(settings(&dir), tx).await.unwrap();

        let result = service.broadcast_file("a.txt", false).await;
        assert!(matches!(result, Err(FtsError::UnknownDevice(_))));
        service.shutdown().await;
    }
}
