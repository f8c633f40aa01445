//! UDP транспорт - датаграммы без соединения, опционально broadcast
//! ⚠️ Доставка не гарантируется - потери покрываются повторами движка

use super::{lock, report, ConnectionGuard, Transport, TransportConfig, TransportEvent, TransportType};
use crate::error::{codes, TransportError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Максимальный размер UDP датаграммы
pub const MAX_DATAGRAM_SIZE: usize = 65507;

struct Bound {
    socket: Arc<UdpSocket>,
    guard: Arc<ConnectionGuard>,
    task: JoinHandle<()>,
}

/// UDP сокет
pub struct UdpTransport {
    config: Mutex<TransportConfig>,
    bound: Mutex<Option<Bound>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl UdpTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            config: Mutex::new(TransportConfig::default()),
            bound: Mutex::new(None),
            events,
        }
    }

    fn close(&self) {
        if let Some(bound) = lock(&self.bound).take() {
            bound.task.abort();
            bound.guard.close();
        }
    }

    fn socket(&self) -> Option<(Arc<UdpSocket>, Arc<ConnectionGuard>)> {
        lock(&self.bound)
            .as_ref()
            .map(|b| (b.socket.clone(), b.guard.clone()))
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn resolve(addr: &str) -> Option<SocketAddr> {
    if let Ok(addr) = addr.parse() {
        return Some(addr);
    }
    lookup_host(addr).await.ok()?.next()
}

#[async_trait]
impl Transport for UdpTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Udp
    }

    fn setup(&self, config: TransportConfig) {
        self.close();
        *lock(&self.config) = config;
    }

    async fn connect(&self) {
        if lock(&self.bound).is_some() {
            return;
        }

        let config = lock(&self.config).clone();
        let bind_addr = config.bind_addr();
        let socket = match UdpSocket::bind(&bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                report(
                    &self.events,
                    TransportError::new(codes::BIND_FAILED, format!("Не удалось открыть UDP {}: {}", bind_addr, e)),
                );
                return;
            }
        };
        if config.broadcast {
            if let Err(e) = socket.set_broadcast(true) {
                tracing::warn!("Не удалось включить broadcast: {}", e);
            }
        }

        let socket = Arc::new(socket);
        let guard = ConnectionGuard::new(None, self.events.clone());

        let recv_socket = socket.clone();
        let recv_guard = guard.clone();
        let mut slot = lock(&self.bound);
        guard.opened();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, from)) => recv_guard.message(buf[..len].to_vec(), from.to_string()),
                    // На Windows ICMP "port unreachable" приходит ошибкой чтения - сокет жив
                    Err(e) => recv_guard.error(TransportError::new(codes::RECEIVE_FAILED, e.to_string())),
                }
            }
        });
        if let Ok(addr) = socket.local_addr() {
            tracing::debug!("UDP сокет открыт на {}", addr);
        }
        *slot = Some(Bound { socket, guard, task });
    }

    async fn disconnect(&self) {
        self.close();
    }

    async fn send(&self, data: &[u8], destination: Option<&str>) {
        let Some((socket, guard)) = self.socket() else {
            report(&self.events, TransportError::new(codes::NOT_CONNECTED, "UDP сокет не открыт"));
            return;
        };

        if data.len() > MAX_DATAGRAM_SIZE {
            guard.error(TransportError::new(
                codes::FRAME_TOO_LARGE,
                format!("Датаграмма {} байт больше допустимой", data.len()),
            ));
            return;
        }

        let remote = lock(&self.config).remote.clone();
        let Some(target) = destination.map(str::to_string).or(remote) else {
            guard.error(TransportError::new(codes::NO_DESTINATION, "Для UDP нужен адрес получателя"));
            return;
        };

        let Some(addr) = resolve(&target).await else {
            guard.error(TransportError::new(codes::SEND_FAILED, format!("Не удалось разрешить адрес {}", target)));
            return;
        };

        if let Err(e) = socket.send_to(data, addr).await {
            guard.error(TransportError::new(codes::SEND_FAILED, format!("{}: {}", target, e)));
        }
    }

    fn is_open(&self) -> bool {
        lock(&self.bound).as_ref().is_some_and(|b| !b.guard.is_closed())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.bound).as_ref().and_then(|b| b.socket.local_addr().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    async fn open_socket() -> (UdpTransport, mpsc::UnboundedReceiver<TransportEvent>, String) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let udp = UdpTransport::new(tx);
        udp.setup(TransportConfig::listen(0));
        udp.connect().await;
        assert_eq!(next_event(&mut rx).await, TransportEvent::Opened { peer: None });
        let addr = format!("127.0.0.1:{}", udp.local_addr().unwrap().port());
        (udp, rx, addr)
    }

    #[tokio::test]
    async fn test_datagram_exchange() {
        let (a, _a_rx, a_addr) = open_socket().await;
        let (_b, mut b_rx, b_addr) = open_socket().await;

        a.send(b"ping", Some(&b_addr)).await;

        match next_event(&mut b_rx).await {
            TransportEvent::Message { data, peer } => {
                assert_eq!(data, b"ping");
                assert_eq!(peer, a_addr);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_without_destination_reports_error() {
        let (udp, mut rx, _) = open_socket().await;
        udp.send(b"lost", None).await;
        match next_event(&mut rx).await {
            TransportEvent::Error { error, .. } => assert_eq!(error.code, codes::NO_DESTINATION),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_from_config_is_default_destination() {
        let (b, mut b_rx, b_addr) = open_socket().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = UdpTransport::new(tx);
        let mut config = TransportConfig::remote(b_addr);
        config.local_port = 0;
        a.setup(config);
        a.connect().await;
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Opened { .. }));

        a.send(b"implicit", None).await;
        match next_event(&mut b_rx).await {
            TransportEvent::Message { data, .. } => assert_eq!(data, b"implicit"),
            other => panic!("unexpected {:?}", other),
        }
        drop(b);
    }

    #[tokio::test]
    async fn test_setup_closes_existing_socket() {
        let (udp, mut rx, _) = open_socket().await;
        udp.setup(TransportConfig::listen(0));
        assert_eq!(next_event(&mut rx).await, TransportEvent::Closed { peer: None });
        assert!(!udp.is_open());
    }
}
