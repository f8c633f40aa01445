//! WebSocket транспорт: клиент и сервер. Одно сообщение = один бинарный кадр

use super::{lock, report, ConnectionGuard, Link, Transport, TransportConfig, TransportEvent, TransportType};
use crate::error::{codes, TransportError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};

/// URL для адреса `host:port`
pub(crate) fn ws_url(remote: &str) -> String {
    if remote.starts_with("ws://") || remote.starts_with("wss://") {
        remote.to_string()
    } else {
        format!("ws://{}", remote)
    }
}

fn spawn_link<S>(
    ws: WebSocketStream<S>,
    peer: String,
    guard: Arc<ConnectionGuard>,
    on_close: impl FnOnce() + Send + 'static,
) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (outbound, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    guard.opened();

    let write_guard = guard.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if let Err(e) = sink.send(WsMessage::binary(data)).await {
                write_guard.error(TransportError::new(codes::SEND_FAILED, e.to_string()));
                write_guard.close();
                break;
            }
        }
        let _ = sink.close().await;
    });

    let read_guard = guard.clone();
    let reader_task = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(WsMessage::Binary(data)) => read_guard.message(data.to_vec(), peer.clone()),
                // Текстовые кадры (PING/PONG стресс-теста) принимаем как байты
                Ok(WsMessage::Text(text)) => read_guard.message(text.as_str().as_bytes().to_vec(), peer.clone()),
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                // Обрыв без закрывающего кадра считаем обычным закрытием
                Err(WsError::ConnectionClosed)
                | Err(WsError::AlreadyClosed)
                | Err(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)) => break,
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

    fn forget(&self, guard: &Arc<ConnectionGuard>) {
        let mut link = lock(&self.link);
        if link.as_ref().is_some_and(|l| Arc::ptr_eq(&l.guard, guard)) {
            link.take();
        }
    }
}

/// WebSocket клиент
pub struct WebSocketClientTransport {
    shared: Arc<ClientShared>,
}

impl WebSocketClientTransport {
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

impl Drop for WebSocketClientTransport {
    fn drop(&mut self) {
        self.shared.close_all();
    }
}

#[async_trait]
impl Transport for WebSocketClientTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
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
            return;
        }

        let config = lock(&self.shared.config).clone();
        let Some(remote) = config.remote.clone() else {
            report(
                &self.shared.events,
                TransportError::new(codes::NOT_CONNECTED, "Не задан адрес WebSocket сервера"),
            );
            return;
        };

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            let url = ws_url(&remote);
            match timeout(config.connect_timeout, connect_async(url.as_str())).await {
                Ok(Ok((ws, _response))) => {
                    tracing::debug!("WebSocket соединение с {} установлено", url);
                    let guard = ConnectionGuard::new(Some(remote.clone()), shared.events.clone());
                    let weak = Arc::downgrade(&shared);
                    let close_guard = guard.clone();
                    let mut slot = lock(&shared.link);
                    *slot = Some(spawn_link(ws, remote, guard, move || {
                        if let Some(shared) = weak.upgrade() {
                            shared.forget(&close_guard);
                        }
                    }));
                }
                Ok(Err(e)) => report(
                    &shared.events,
                    TransportError::new(codes::CONNECT_FAILED, format!("Ошибка подключения к {}: {}", url, e)),
                ),
                Err(_) => report(
                    &shared.events,
                    TransportError::new(codes::CONNECT_FAILED, format!("Таймаут подключения к {}", url)),
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
                    tracing::warn!("Отправка в закрытое WebSocket соединение отброшена");
                }
            }
            None => report(
                &self.shared.events,
                TransportError::new(codes::NOT_CONNECTED, "WebSocket соединение не установлено"),
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
}

/// WebSocket сервер
pub struct WebSocketServerTransport {
    shared: Arc<ServerShared>,
}

impl WebSocketServerTransport {
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
}

impl Drop for WebSocketServerTransport {
    fn drop(&mut self) {
        self.shared.close_all();
    }
}

/// Рукопожатие WebSocket выполняется в отдельной задаче, чтобы медленный
/// клиент не задерживал приём остальных
async fn handshake(weak: Weak<ServerShared>, stream: tokio::net::TcpStream, addr: SocketAddr) {
    stream.set_nodelay(true).ok();
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            if let Some(shared) = weak.upgrade() {
                report(
                    &shared.events,
                    TransportError::new(codes::HANDSHAKE_FAILED, format!("{}: {}", addr, e)),
                );
            }
            return;
        }
    };
    let Some(shared) = weak.upgrade() else {
        return;
    };

    let peer = addr.to_string();
    let guard = ConnectionGuard::new(Some(peer.clone()), shared.events.clone());
    let close_guard = guard.clone();
    let close_peer = peer.clone();
    let close_weak = weak.clone();

    let mut peers = lock(&shared.peers);
    let link = spawn_link(ws, peer.clone(), guard, move || {
        if let Some(shared) = close_weak.upgrade() {
            shared.forget(&close_peer, &close_guard);
        }
    });
    peers.insert(peer, link);
}

#[async_trait]
impl Transport for WebSocketServerTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
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
                    Ok((stream, addr)) => {
                        if weak.strong_count() == 0 {
                            break;
                        }
                        tokio::spawn(handshake(weak.clone(), stream, addr));
                    }
                    Err(e) => {
                        accept_guard.error(TransportError::new(codes::RECEIVE_FAILED, e.to_string()));
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        tracing::info!("WebSocket сервер слушает {}", local_addr);
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
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn test_ws_url() {
        assert_eq!(ws_url("127.0.0.1:9000"), "ws://127.0.0.1:9000");
        assert_eq!(ws_url("ws://host:1/relay"), "ws://host:1/relay");
    }

    #[tokio::test]
    async fn test_websocket_exchange() {
        let (tx, mut server_rx) = mpsc::unbounded_channel();
        let server = WebSocketServerTransport::new(tx);
        server.setup(TransportConfig::listen(0));
        server.connect().await;
        assert_eq!(next_event(&mut server_rx).await, TransportEvent::Opened { peer: None });
        let addr = format!("127.0.0.1:{}", server.local_addr().unwrap().port());

        let (tx, mut client_rx) = mpsc::unbounded_channel();
        let client = WebSocketClientTransport::new(tx);
        client.setup(TransportConfig::remote(addr));
        client.connect().await;
        assert!(matches!(next_event(&mut client_rx).await, TransportEvent::Opened { .. }));
        let peer = match next_event(&mut server_rx).await {
            TransportEvent::Opened { peer: Some(peer) } => peer,
            other => panic!("unexpected {:?}", other),
        };

        client.send(b"over websocket", None).await;
        assert_eq!(
            next_event(&mut server_rx).await,
            TransportEvent::Message { data: b"over websocket".to_vec(), peer: peer.clone() }
        );

        server.send(b"back", None).await;
        match next_event(&mut client_rx).await {
            TransportEvent::Message { data, .. } => assert_eq!(data, b"back"),
            other => panic!("unexpected {:?}", other),
        }

        client.disconnect().await;
        assert!(matches!(next_event(&mut client_rx).await, TransportEvent::Closed { .. }));
        assert!(matches!(next_event(&mut server_rx).await, TransportEvent::Closed { peer: Some(_) }));
    }
}
