//! Ретранслятор времени: отвечает другим устройствам по своим часам
//!
//! По UDP говорит на SNTP, по TCP/WebSocket - сообщениями протокола.

use super::{sntp, TimeSync};
use crate::error::{FtsError, Result};
use crate::network::transport::{self, Transport, TransportConfig, TransportEvent, TransportType};
use crate::protocol::Message;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const BIND_TIMEOUT: Duration = Duration::from_secs(5);

struct Running {
    transport: Arc<dyn Transport>,
    port: u16,
    task: JoinHandle<()>,
}

pub struct TimeRepeater {
    clock: Arc<TimeSync>,
    /// Свои часы считаются эталоном, даже если не синхронизированы
    reference: bool,
    running: Mutex<HashMap<TransportType, Running>>,
}

impl TimeRepeater {
    pub fn new(clock: Arc<TimeSync>) -> Self {
        Self {
            clock,
            reference: false,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Раздавать локальное время как первичный эталон (stratum 1).
    /// Без этого несинхронизированные часы отдаются по SNTP как unsynchronized
    pub fn as_reference(mut self, reference: bool) -> Self {
        self.reference = reference;
        self
    }

    /// Начать отвечать на `port` (0 - любой свободный). Повторный запуск
    /// того же транспорта возвращает уже открытый порт
    pub async fn start(&self, via: TransportType, port: u16) -> Result<u16> {
        let mut running = self.running.lock().await;
        if let Some(existing) = running.get(&via) {
            if existing.transport.is_open() {
                return Ok(existing.port);
            }
        }
        if let Some(stale) = running.remove(&via) {
            stale.task.abort();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = transport::server(via, tx);
        transport.setup(TransportConfig::listen(port));
        transport.connect().await;

        match tokio::time::timeout(BIND_TIMEOUT, rx.recv()).await {
            Ok(Some(TransportEvent::Opened { .. })) => {}
            Ok(Some(TransportEvent::Error { error, .. })) => return Err(error.into()),
            _ => return Err(FtsError::Timeout),
        }
        let port = transport.local_addr().map(|a| a.port()).unwrap_or(port);

        let task = tokio::spawn(serve(rx, Arc::downgrade(&transport), self.clock.clone(), self.reference, via));
        tracing::info!("Ретранслятор времени {} на порту {}", via, port);
        running.insert(via, Running { transport, port, task });
        Ok(port)
    }

    /// Остановить ретранслятор на данном транспорте. Повторный вызов ничего не делает
    pub async fn stop(&self, via: TransportType) {
        if let Some(running) = self.running.lock().await.remove(&via) {
            running.task.abort();
            running.transport.disconnect().await;
            tracing::info!("Ретранслятор времени {} остановлен", via);
        }
    }

    pub async fn stop_all(&self) {
        for via in TransportType::all() {
            self.stop(via).await;
        }
    }

    pub async fn is_running(&self, via: TransportType) -> bool {
        self.running
            .lock()
            .await
            .get(&via)
            .is_some_and(|r| r.transport.is_open())
    }
}

fn stratum(clock: &TimeSync, reference: bool) -> u8 {
    if reference {
        1
    } else if clock.is_synced() {
        2
    } else {
        sntp::STRATUM_UNSYNCED
    }
}

async fn serve(
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    transport: Weak<dyn Transport>,
    clock: Arc<TimeSync>,
    reference: bool,
    via: TransportType,
) {
    while let Some(event) = rx.recv().await {
        let TransportEvent::Message { data, peer } = event else {
            continue;
        };
        let received = clock.now_ms();

        let reply = if via == TransportType::Udp {
            let stratum = stratum(&clock, reference);
            sntp::server_reply(&data, stratum, received, clock.now_ms()).map(|p| p.to_vec())
        } else {
            match Message::from_bytes(&data) {
                Ok(Message::TimeRequest { client_send }) => Message::TimeReply {
                    client_send,
                    server_recv: received,
                    server_send: clock.now_ms(),
                }
                .to_bytes()
                .ok(),
                _ => None,
            }
        };

        let Some(reply) = reply else {
            tracing::debug!("Ретранслятор: непонятный запрос от {}", peer);
            continue;
        };
        let Some(transport) = transport.upgrade() else { break };
        transport.send(&reply, Some(&peer)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    async fn ask_stratum(port: u16) -> u8 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(&sntp::client_request(1_000), ("127.0.0.1", port))
            .await
            .unwrap();
        let mut buf = [0u8; 128];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(len, sntp::NTP_PACKET_SIZE);
        buf[1]
    }

    #[tokio::test]
    async fn test_unsynced_clock_is_served_as_unsynchronized() {
        let repeater = TimeRepeater::new(Arc::new(TimeSync::new()));
        let port = repeater.start(TransportType::Udp, 0).await.unwrap();

        assert_eq!(ask_stratum(port).await, sntp::STRATUM_UNSYNCED);

        let client = TimeSync::new();
        let result = client
            .request_sync("127.0.0.1", port, TransportType::Udp, Duration::from_secs(1))
            .await;
        assert!(result.is_err());
        assert!(!client.is_synced());
        repeater.stop_all().await;
    }

    #[tokio::test]
    async fn test_stratum_follows_clock_state() {
        let clock = Arc::new(TimeSync::new());
        let repeater = TimeRepeater::new(clock.clone());
        let port = repeater.start(TransportType::Udp, 0).await.unwrap();

        clock.add_sample(10.0, 2.0);
        assert_eq!(ask_stratum(port).await, 2);
        repeater.stop_all().await;

        let reference = TimeRepeater::new(Arc::new(TimeSync::new())).as_reference(true);
        let port = reference.start(TransportType::Udp, 0).await.unwrap();
        assert_eq!(ask_stratum(port).await, 1);
        reference.stop_all().await;
    }
}
