//! TCP транспорт: клиент (одно соединение) и сервер (много соединений)

use super::frame::{read_frame, write_frame};
use super::{lock, report, ConnectionGuard, Link, Transport, TransportConfig, TransportEvent, TransportType};
use crate::error::{codes, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

/// Запустить чтение и запись для TCP соединения.
/// `on_close` вызывается, когда собеседник закрыл соединение
fn spawn_link(
    stream: TcpStream,
    peer: String,
    guard: Arc<ConnectionGuard>,
    on_close: impl FnOnce() + Send + 'static,
) -> Link {
    // Отключаем алгоритм Нейгла для меньшей задержки
    stream.set_nodelay(true).ok();
    let (mut reader, mut writer) = stream.into_split();
    let (outbound, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    guard.opened();

    let write_guard = guard.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &data).await {
                write_guard.error(TransportError::new(codes::SEND_FAILED, e.to_string()));
                write_guard.close();
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let read_guard = guard.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(data)) => read_guard.message(data, peer.clone()),
                Ok(None) => break,
                Err(e) => {
                    read_guard.error(TransportError::new(codes::RECEIVE_FAILED, e.to_string()));
                    break;
                }
            }
        }
        read_guard.close();
        on_close();
    });

    Link {
        outbound,
        guard,
        tasks: vec![reader_task, writer_task],
    }
}

// === Клиент ===

struct ClientShared {
    config: Mutex<TransportConfig>,
    link: Mutex<Option<Link>>,
    pending: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl ClientShared {
    fn close_all(&self) {
        if let Some(task) = lock(&self.pending).take() {
            task.abort();
        }
        if let Some(link) = lock(&self.link).take() {
            link.close();
        }
    }

    /// Забыть соединение, если оно всё ещё текущее
    fn forget(&self, guard: &Arc<ConnectionGuard>) {
        let mut link = lock(&self.link);
        if link.as_ref().is_some_and(|l| Arc::ptr_eq(&l.guard, guard)) {
            link.take();
        }
    }
}

/// TCP клиент - одно соединение с удалённым узлом
pub struct TcpClientTransport {
    shared: Arc<ClientShared>,
}

impl TcpClientTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                config: Mutex::new(TransportConfig::default()),
                link: Mutex::new(None),
                pending: Mutex::new(None),
                events,
            }),
        }
    }
}

impl Drop for TcpClientTransport {
    fn drop(&mut self) {
        self.shared.close_all();
    }
}

#[async_trait]
impl Transport for TcpClientTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }

    fn setup(&self, config: TransportConfig) {
        self.shared.close_all();
        *lock(&self.shared.config) = config;
    }

    async fn connect(&self) {
        if self.is_open() {
            return;
        }
        if lock(&self.shared.pending).as_ref().is_some_and(|t| !t.is_finished()) {
            return; // Подключение уже идёт
        }

        let config = lock(&self.shared.config).clone();
        let Some(remote) = config.remote.clone() else {
            report(
                &self.shared.events,
                TransportError::new(codes::NOT_CONNECTED, "Не задан адрес удалённого узла"),
            );
            return;
        };

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            match timeout(config.connect_timeout, TcpStream::connect(&remote)).await {
                Ok(Ok(stream)) => {
                    tracing::debug!("TCP соединение с {} установлено", remote);
                    let guard = ConnectionGuard::new(Some(remote.clone()), shared.events.clone());
                    let weak = Arc::downgrade(&shared);
                    let close_guard = guard.clone();
                    let mut slot = lock(&shared.link);
                    *slot = Some(spawn_link(stream, remote, guard, move || {
                        if let Some(shared) = weak.upgrade() {
                            shared.forget(&close_guard);
                        }
                    }));
                }
                Ok(Err(e)) => report(
                    &shared.events,
                    TransportError::new(codes::CONNECT_FAILED, format!("Ошибка подключения к {}: {}", remote, e)),
                ),
                Err(_) => report(
                    &shared.events,
                    TransportError::new(codes::CONNECT_FAILED, format!("Таймаут подключения к {}", remote)),
                ),
            }
        });
        *lock(&self.shared.pending) = Some(task);
    }

    async fn disconnect(&self) {
        self.shared.close_all();
    }

    async fn send(&self, data: &[u8], _destination: Option<&str>) {
        let link = lock(&self.shared.link);
        match link.as_ref() {
            Some(link) => {
                if !link.send(data) {
                    tracing::warn!("Отправка в закрытое TCP соединение отброшена");
                }
            }
            None => report(
                &self.shared.events,
                TransportError::new(codes::NOT_CONNECTED, "TCP соединение не установлено"),
            ),
        }
    }

    fn is_open(&self) -> bool {
        lock(&self.shared.link)
            .as_ref()
            .is_some_and(|l| !l.guard.is_closed())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

// === Сервер ===

struct Listening {
    task: JoinHandle<()>,
    guard: Arc<ConnectionGuard>,
    local_addr: SocketAddr,
}

struct ServerShared {
    config: Mutex<TransportConfig>,
    peers: Mutex<HashMap<String, Link>>,
    listening: Mutex<Option<Listening>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl ServerShared {
    fn close_all(&self) {
        if let Some(listening) = lock(&self.listening).take() {
            listening.task.abort();
            listening.guard.close();
        }
        let peers: Vec<Link> = lock(&self.peers).drain().map(|(_, link)| link).collect();
        for link in peers {
            link.close();
        }
    }

    fn forget(&self, peer: &str, guard: &Arc<ConnectionGuard>) {
        let mut peers = lock(&self.peers);
        if peers.get(peer).is_some_and(|l| Arc::ptr_eq(&l.guard, guard)) {
            peers.remove(peer);
        }
    }

    fn accept(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let peer = addr.to_string();
        tracing::debug!("Входящее TCP соединение от {}", peer);

        let guard = ConnectionGuard::new(Some(peer.clone()), self.events.clone());
        let weak: Weak<ServerShared> = Arc::downgrade(self);
        let close_guard = guard.clone();
        let close_peer = peer.clone();

        let mut peers = lock(&self.peers);
        let link = spawn_link(stream, peer.clone(), guard, move || {
            if let Some(shared) = weak.upgrade() {
                shared.forget(&close_peer, &close_guard);
            }
        });
        peers.insert(peer, link);
    }
}

/// TCP сервер - принимает много соединений
pub struct TcpServerTransport {
    shared: Arc<ServerShared>,
}

impl TcpServerTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config: Mutex::new(TransportConfig::default()),
                peers: Mutex::new(HashMap::new()),
                listening: Mutex::new(None),
                events,
            }),
        }
    }

    /// Адреса подключённых клиентов
    pub fn peers(&self) -> Vec<String> {
        lock(&self.shared.peers).keys().cloned().collect()
    }
}

impl Drop for TcpServerTransport {
    fn drop(&mut self) {
        self.shared.close_all();
    }
}

#[async_trait]
impl Transport for TcpServerTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }

    fn setup(&self, config: TransportConfig) {
        self.shared.close_all();
        *lock(&self.shared.config) = config;
    }

    async fn connect(&self) {
        if lock(&self.shared.listening).is_some() {
            return;
        }

        let bind_addr = lock(&self.shared.config).bind_addr();
        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                report(
                    &self.shared.events,
                    TransportError::new(codes::BIND_FAILED, format!("Не удалось запустить сервер на {}: {}", bind_addr, e)),
                );
                return;
            }
        };
        let Ok(local_addr) = listener.local_addr() else {
            report(&self.shared.events, TransportError::new(codes::BIND_FAILED, "Неизвестен локальный адрес"));
            return;
        };

        let guard = ConnectionGuard::new(None, self.shared.events.clone());
        let weak = Arc::downgrade(&self.shared);
        let accept_guard = guard.clone();

        let mut listening = lock(&self.shared.listening);
        guard.opened();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => match weak.upgrade() {
                        Some(shared) => shared.accept(stream, addr),
                        None => break,
                    },
                    Err(e) => {
                        accept_guard.error(TransportError::new(codes::RECEIVE_FAILED, e.to_string()));
                        // Например, закончились дескрипторы - не крутимся впустую
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        tracing::info!("TCP сервер слушает {}", local_addr);
        *listening = Some(Listening { task, guard, local_addr });
    }

    async fn disconnect(&self) {
        self.shared.close_all();
    }

    async fn send(&self, data: &[u8], destination: Option<&str>) {
        let peers = lock(&self.shared.peers);
        match destination {
            Some(peer) => match peers.get(peer) {
                Some(link) => {
                    link.send(data);
                }
                None => report(
                    &self.shared.events,
                    TransportError::new(codes::NOT_CONNECTED, format!("Нет соединения с {}", peer)),
                ),
            },
            None => {
                for link in peers.values() {
                    link.send(data);
                }
            }
        }
    }

    fn is_open(&self) -> bool {
        lock(&self.shared.listening)
            .as_ref()
            .is_some_and(|l| !l.guard.is_closed())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared.listening).as_ref().map(|l| l.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("channel closed")
    }

    async fn start_server() -> (TcpServerTransport, mpsc::UnboundedReceiver<TransportEvent>, String) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = TcpServerTransport::new(tx);
        server.setup(TransportConfig::listen(0));
        server.connect().await;
        assert_eq!(next_event(&mut rx).await, TransportEvent::Opened { peer: None });
        let port = server.local_addr().unwrap().port();
        (server, rx, format!("127.0.0.1:{}", port))
    }

    #[tokio::test]
    async fn test_client_server_exchange() {
        let (server, mut server_rx, addr) = start_server().await;

        let (tx, mut client_rx) = mpsc::unbounded_channel();
        let client = TcpClientTransport::new(tx);
        client.setup(TransportConfig::remote(addr.clone()));
        client.connect().await;
        assert_eq!(next_event(&mut client_rx).await, TransportEvent::Opened { peer: Some(addr.clone()) });

        let peer = match next_event(&mut server_rx).await {
            TransportEvent::Opened { peer: Some(peer) } => peer,
            other => panic!("unexpected {:?}", other),
        };

        client.send(b"hello", None).await;
        client.send(b"world", None).await;
        assert_eq!(
            next_event(&mut server_rx).await,
            TransportEvent::Message { data: b"hello".to_vec(), peer: peer.clone() }
        );
        assert_eq!(
            next_event(&mut server_rx).await,
            TransportEvent::Message { data: b"world".to_vec(), peer: peer.clone() }
        );

        server.send(b"reply", Some(&peer)).await;
        assert_eq!(
            next_event(&mut client_rx).await,
            TransportEvent::Message { data: b"reply".to_vec(), peer: addr.clone() }
        );
    }

    #[tokio::test]
    async fn test_server_distributes_to_all() {
        let (server, mut server_rx, addr) = start_server().await;

        let mut clients = Vec::new();
        for _ in 0..2 {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let client = TcpClientTransport::new(tx);
            client.setup(TransportConfig::remote(addr.clone()));
            client.connect().await;
            assert!(matches!(next_event(&mut rx).await, TransportEvent::Opened { .. }));
            assert!(matches!(next_event(&mut server_rx).await, TransportEvent::Opened { peer: Some(_) }));
            clients.push((client, rx));
        }

        server.send(b"everyone", None).await;
        for (_, rx) in clients.iter_mut() {
            match next_event(rx).await {
                TransportEvent::Message { data, .. } => assert_eq!(data, b"everyone"),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_emits_single_close() {
        let (server, mut server_rx, addr) = start_server().await;

        let (tx, mut client_rx) = mpsc::unbounded_channel();
        let client = TcpClientTransport::new(tx);
        client.setup(TransportConfig::remote(addr));
        client.connect().await;
        assert!(matches!(next_event(&mut client_rx).await, TransportEvent::Opened { .. }));
        assert!(matches!(next_event(&mut server_rx).await, TransportEvent::Opened { .. }));

        client.disconnect().await;
        client.disconnect().await;
        assert!(matches!(next_event(&mut client_rx).await, TransportEvent::Closed { .. }));
        assert!(!client.is_open());

        // Сервер видит закрытие соединения клиента
        assert!(matches!(next_event(&mut server_rx).await, TransportEvent::Closed { peer: Some(_) }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client_rx.try_recv().is_err());
        drop(server);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported_not_thrown() {
        // Занимаем порт и сразу освобождаем, чтобы на нём никто не слушал
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = TcpClientTransport::new(tx);
        client.setup(TransportConfig::remote(addr));
        client.connect().await;

        match next_event(&mut rx).await {
            TransportEvent::Error { error, .. } => assert_eq!(error.code, codes::CONNECT_FAILED),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_send_without_connection_reports_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = TcpClientTransport::new(tx);
        client.send(b"nobody", None).await;
        match next_event(&mut rx).await {
            TransportEvent::Error { error, .. } => assert_eq!(error.code, codes::NOT_CONNECTED),
            other => panic!("unexpected {:?}", other),
        }
    }
}
