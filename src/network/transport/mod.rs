//! Абстракция транспортного протокола (TCP, UDP, WebSocket)
//!
//! Все транспорты работают одинаково: `setup` задаёт параметры, `connect`
//! начинает подключение или прослушивание, результат приходит событиями
//! в канал `TransportEvent`, который передаётся при создании транспорта.
//! Ошибки никогда не возвращаются из `send` - только событием `Error`.

mod frame;
mod tcp;
mod udp;
#[cfg(feature = "websocket")]
mod websocket;

pub use frame::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use tcp::{TcpClientTransport, TcpServerTransport};
pub use udp::{UdpTransport, MAX_DATAGRAM_SIZE};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketClientTransport, WebSocketServerTransport};

use crate::config::IpMode;
use crate::error::TransportError;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Тип транспортного протокола
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum TransportType {
    #[default]
    Tcp,
    /// ⚠️ UDP не гарантирует доставку
    Udp,
    #[cfg(feature = "websocket")]
    WebSocket,
}

impl TransportType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            #[cfg(feature = "websocket")]
            Self::WebSocket => "WebSocket",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Tcp => "Надёжный, стандартный протокол",
            Self::Udp => "⚠️ Без гарантий доставки, повторы по таймауту",
            #[cfg(feature = "websocket")]
            Self::WebSocket => "Поверх HTTP, проходит через прокси",
        }
    }

    pub fn all() -> Vec<TransportType> {
        vec![
            Self::Tcp,
            Self::Udp,
            #[cfg(feature = "websocket")]
            Self::WebSocket,
        ]
    }

    /// Парсинг из строки
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            #[cfg(feature = "websocket")]
            "ws" | "websocket" => Some(Self::WebSocket),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Уведомления транспорта
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Соединение установлено / слушатель готов.
    /// `peer` - адрес нового соединения (для серверов) или удалённого узла (для клиентов)
    Opened { peer: Option<String> },
    /// Получено сообщение
    Message { data: Vec<u8>, peer: String },
    /// Ошибка
    Error { peer: Option<String>, error: TransportError },
    /// Соединение закрыто (`peer` = None - закрыт сам транспорт)
    Closed { peer: Option<String> },
}

/// Параметры транспорта
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Локальный порт (0 = любой свободный)
    pub local_port: u16,
    /// Удалённый узел `host:port` (или URL для WebSocket)
    pub remote: Option<String>,
    pub ip_mode: IpMode,
    /// Разрешить широковещательную отправку (UDP)
    pub broadcast: bool,
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            remote: None,
            ip_mode: IpMode::default(),
            broadcast: false,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl TransportConfig {
    /// Параметры для прослушивания порта
    pub fn listen(port: u16) -> Self {
        Self {
            local_port: port,
            ..Default::default()
        }
    }

    /// Параметры для подключения к удалённому узлу
    pub fn remote(addr: impl Into<String>) -> Self {
        Self {
            remote: Some(addr.into()),
            ..Default::default()
        }
    }

    pub fn with_ip_mode(mut self, ip_mode: IpMode) -> Self {
        self.ip_mode = ip_mode;
        self
    }

    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub(crate) fn bind_addr(&self) -> String {
        format!("{}:{}", self.ip_mode.unspecified(), self.local_port)
    }
}

/// Единый интерфейс транспорта
#[async_trait]
pub trait Transport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    /// Задать параметры. Существующее соединение при этом закрывается
    fn setup(&self, config: TransportConfig);

    /// Начать подключение (TCP/WS клиент) или прослушивание (сервер, UDP).
    /// Готовность сообщается событием `Opened`
    async fn connect(&self);

    /// Закрыть соединение. Повторный вызов ничего не делает
    async fn disconnect(&self);

    /// Отправить сообщение. `destination` обязателен для UDP без `remote`;
    /// у серверов `None` означает "всем подключённым"
    async fn send(&self, data: &[u8], destination: Option<&str>);

    /// Открыт ли транспорт
    fn is_open(&self) -> bool;

    /// Локальный адрес (после `Opened`)
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Создать транспорт-клиент по типу
pub fn client(
    transport_type: TransportType,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> Arc<dyn Transport> {
    match transport_type {
        TransportType::Tcp => Arc::new(TcpClientTransport::new(events)),
        TransportType::Udp => Arc::new(UdpTransport::new(events)),
        #[cfg(feature = "websocket")]
        TransportType::WebSocket => Arc::new(WebSocketClientTransport::new(events)),
    }
}

/// Создать транспорт-сервер по типу
pub fn server(
    transport_type: TransportType,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> Arc<dyn Transport> {
    match transport_type {
        TransportType::Tcp => Arc::new(TcpServerTransport::new(events)),
        TransportType::Udp => Arc::new(UdpTransport::new(events)),
        #[cfg(feature = "websocket")]
        TransportType::WebSocket => Arc::new(WebSocketServerTransport::new(events)),
    }
}

/// Mutex без паники при отравлении
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Уведомления одного соединения.
/// После `close` никаких событий по этому соединению больше не отправляется
pub(crate) struct ConnectionGuard {
    peer: Option<String>,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl ConnectionGuard {
    pub(crate) fn new(peer: Option<String>, events: mpsc::UnboundedSender<TransportEvent>) -> Arc<Self> {
        Arc::new(Self {
            peer,
            closed: AtomicBool::new(false),
            events,
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn opened(&self) {
        if !self.is_closed() {
            let _ = self.events.send(TransportEvent::Opened { peer: self.peer.clone() });
        }
    }

    pub(crate) fn message(&self, data: Vec<u8>, from: String) {
        if !self.is_closed() {
            let _ = self.events.send(TransportEvent::Message { data, peer: from });
        }
    }

    pub(crate) fn error(&self, error: TransportError) {
        if !self.is_closed() {
            tracing::debug!("Ошибка транспорта ({:?}): {}", self.peer, error);
            let _ = self.events.send(TransportEvent::Error {
                peer: self.peer.clone(),
                error,
            });
        }
    }

    /// Закрыть. Возвращает true только при первом вызове
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.events.send(TransportEvent::Closed { peer: self.peer.clone() });
        true
    }
}

/// Живое потоковое соединение: очередь на отправку + задачи чтения/записи
pub(crate) struct Link {
    pub(crate) outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub(crate) guard: Arc<ConnectionGuard>,
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

impl Link {
    pub(crate) fn send(&self, data: &[u8]) -> bool {
        if self.guard.is_closed() {
            return false;
        }
        self.outbound.send(data.to_vec()).is_ok()
    }

    pub(crate) fn close(self) {
        self.guard.close();
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Сообщить об ошибке уровня транспорта (не относящейся к соединению)
pub(crate) fn report(events: &mpsc::UnboundedSender<TransportEvent>, error: TransportError) {
    tracing::warn!("{}", error);
    let _ = events.send(TransportEvent::Error { peer: None, error });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_type_from_str() {
        assert_eq!(TransportType::from_str("tcp"), Some(TransportType::Tcp));
        assert_eq!(TransportType::from_str("UDP"), Some(TransportType::Udp));
        #[cfg(feature = "websocket")]
        assert_eq!(TransportType::from_str("ws"), Some(TransportType::WebSocket));
        assert_eq!(TransportType::from_str("carrier-pigeon"), None);
    }

    #[test]
    fn test_transport_type_display() {
        assert_eq!(TransportType::Tcp.to_string(), "TCP");
        assert_eq!(TransportType::all().len(), if cfg!(feature = "websocket") { 3 } else { 2 });
    }

    #[test]
    fn test_guard_closes_once_and_goes_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let guard = ConnectionGuard::new(Some("1.2.3.4:5".to_string()), tx);

        guard.message(vec![1], "1.2.3.4:5".to_string());
        assert!(guard.close());
        assert!(!guard.close());
        guard.message(vec![2], "1.2.3.4:5".to_string());
        guard.error(TransportError::new(1, "late"));

        assert!(matches!(rx.try_recv(), Ok(TransportEvent::Message { .. })));
        assert!(matches!(rx.try_recv(), Ok(TransportEvent::Closed { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = TransportConfig::listen(9000);
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
        let config = TransportConfig::listen(9000).with_ip_mode(IpMode::V6);
        assert_eq!(config.bind_addr(), "[::]:9000");
    }
}
