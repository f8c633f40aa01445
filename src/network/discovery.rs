//! Опрос устройств в локальной сети
//!
//! Запрос `PollRequest` уходит широковещательно (или на конкретный адрес)
//! по UDP, каждое устройство отвечает `PollReply` со своим описанием.
//! Ответы складываются в реестр: повторный ответ того же устройства
//! перезаписывает запись, порядок прихода ответов на итог не влияет.

use super::events::FtsEvent;
use super::transport::{lock, Transport, TransportConfig, TransportEvent, UdpTransport};
use crate::config::IpMode;
use crate::error::{FtsError, Result};
use crate::protocol::{DeviceIdentity, Message};
use crate::utils::{host_of, with_default_port};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Сколько ждать открытия сокета опроса
const BIND_TIMEOUT: Duration = Duration::from_secs(5);

/// Устройство, ответившее на опрос
#[derive(Debug, Clone)]
pub struct RemoteDevice {
    pub name: String,
    /// IP адрес, с которого пришёл ответ
    pub address: String,
    /// Порт приёма запросов на передачу
    pub port: u16,
    pub is_server: bool,
    pub version: String,
    pub os: String,
    pub last_seen: Instant,
}

impl RemoteDevice {
    fn from_reply(identity: DeviceIdentity, address: &str) -> Self {
        Self {
            name: identity.name,
            address: address.to_string(),
            port: identity.port,
            is_server: identity.is_server,
            version: identity.version,
            os: identity.os,
            last_seen: Instant::now(),
        }
    }

    /// Адрес для подключения `host:port`
    pub fn endpoint(&self) -> String {
        with_default_port(&self.address, self.port)
    }

    /// Совпадают ли описания (без времени последнего ответа)
    pub fn same_as(&self, other: &RemoteDevice) -> bool {
        self.name == other.name
            && self.address == other.address
            && self.port == other.port
            && self.is_server == other.is_server
            && self.version == other.version
            && self.os == other.os
    }
}

/// Реестр устройств, ключ - адрес подключения
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<BTreeMap<String, RemoteDevice>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Добавить или обновить устройство. true - список изменился
    pub fn upsert(&self, identity: DeviceIdentity, address: &str) -> bool {
        let device = RemoteDevice::from_reply(identity, address);
        let mut devices = lock(&self.devices);
        let changed = devices
            .get(&device.endpoint())
            .map_or(true, |existing| !existing.same_as(&device));
        devices.insert(device.endpoint(), device);
        changed
    }

    /// Снимок списка (отсортирован по адресу)
    pub fn list(&self) -> Vec<RemoteDevice> {
        lock(&self.devices).values().cloned().collect()
    }

    /// Устройство по номеру в списке
    pub fn get(&self, index: usize) -> Option<RemoteDevice> {
        lock(&self.devices).values().nth(index).cloned()
    }

    /// Устройство по адресу (`host` или `host:port`)
    pub fn find(&self, address: &str) -> Option<RemoteDevice> {
        let devices = lock(&self.devices);
        if let Some(device) = devices.get(address) {
            return Some(device.clone());
        }
        let host = host_of(address);
        devices.values().find(|d| d.address == host).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.devices).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        lock(&self.devices).clear();
    }
}

/// Служба опроса: UDP сокет на порту опроса + обработка ответов
pub struct Discovery {
    transport: Arc<dyn Transport>,
    registry: Arc<DeviceRegistry>,
    identity: Arc<Mutex<DeviceIdentity>>,
    ip_mode: IpMode,
    port: u16,
    pump: JoinHandle<()>,
}

impl Discovery {
    /// Открыть сокет опроса на порту `port` (0 - любой свободный)
    pub async fn start(
        port: u16,
        ip_mode: IpMode,
        identity: Arc<Mutex<DeviceIdentity>>,
        registry: Arc<DeviceRegistry>,
        events: mpsc::UnboundedSender<FtsEvent>,
    ) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport: Arc<dyn Transport> = Arc::new(UdpTransport::new(tx));
        transport.setup(
            TransportConfig::listen(port)
                .with_ip_mode(ip_mode)
                .with_broadcast(true),
        );
        transport.connect().await;

        match tokio::time::timeout(BIND_TIMEOUT, rx.recv()).await {
            Ok(Some(TransportEvent::Opened { .. })) => {}
            Ok(Some(TransportEvent::Error { error, .. })) => return Err(error.into()),
            _ => return Err(FtsError::Timeout),
        }

        let local = transport.local_addr();
        let port = local.map(|a| a.port()).unwrap_or(port);
        tracing::info!("Опрос устройств на порту {}", port);

        let pump = tokio::spawn(pump(
            rx,
            Arc::downgrade(&transport),
            registry.clone(),
            identity.clone(),
            local,
            events,
        ));

        Ok(Self {
            transport,
            registry,
            identity,
            ip_mode,
            port,
            pump,
        })
    }

    /// Порт, на котором слушает опрос
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Отправить запрос опроса: широковещательно или на конкретный адрес
    pub async fn send_poll_request(&self, target: Option<&str>) {
        let destination = match target {
            Some(target) => with_default_port(target, self.port),
            None => format!("{}:{}", self.ip_mode.broadcast(), self.port),
        };
        let message = Message::PollRequest {
            identity: lock(&self.identity).clone(),
        };
        match message.to_bytes() {
            Ok(bytes) => {
                tracing::debug!("Опрос -> {}", destination);
                self.transport.send(&bytes, Some(&destination)).await;
            }
            Err(e) => tracing::error!("Не удалось закодировать опрос: {}", e),
        }
    }

    /// Опросить и подождать ответы в течение `window`
    pub async fn poll_devices(&self, target: Option<&str>, window: Duration) -> Vec<RemoteDevice> {
        self.send_poll_request(target).await;
        tokio::time::sleep(window).await;
        self.registry.list()
    }

    pub fn get_device_list(&self) -> Vec<RemoteDevice> {
        self.registry.list()
    }

    pub fn reset_device_list(&self) {
        self.registry.reset();
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Пришло ли сообщение от нашего же сокета (широковещательный запрос
/// возвращается отправителю)
fn is_own(from: &str, local: Option<SocketAddr>, identity: &DeviceIdentity) -> bool {
    let (Ok(from), Some(local)) = (from.parse::<SocketAddr>(), local) else {
        return false;
    };
    if from.port() != local.port() {
        return false;
    }
    from.ip().is_loopback()
        || from.ip() == local.ip()
        || identity.address.parse::<IpAddr>().is_ok_and(|ip| ip == from.ip())
}

async fn pump(
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    transport: Weak<dyn Transport>,
    registry: Arc<DeviceRegistry>,
    identity: Arc<Mutex<DeviceIdentity>>,
    local: Option<SocketAddr>,
    events: mpsc::UnboundedSender<FtsEvent>,
) {
    while let Some(event) = rx.recv().await {
        let (data, peer) = match event {
            TransportEvent::Message { data, peer } => (data, peer),
            TransportEvent::Error { peer, error } => {
                let _ = events.send(FtsEvent::TransportError(peer, error));
                continue;
            }
            _ => continue,
        };

        let me = lock(&identity).clone();
        if is_own(&peer, local, &me) {
            continue;
        }

        match Message::from_bytes(&data) {
            Ok(Message::PollRequest { identity: from }) => {
                tracing::debug!("Опрос от {} ({})", from.name, peer);
                let Some(transport) = transport.upgrade() else { break };
                match (Message::PollReply { identity: me }).to_bytes() {
                    Ok(bytes) => transport.send(&bytes, Some(&peer)).await,
                    Err(e) => tracing::error!("Не удалось закодировать ответ: {}", e),
                }
            }
            Ok(Message::PollReply { identity: device }) => {
                let address = host_of(&peer).to_string();
                tracing::debug!("Ответ на опрос: {} ({})", device.name, address);
                if registry.upsert(device, &address) {
                    let _ = events.send(FtsEvent::DevicesUpdated(registry.list()));
                }
            }
            Ok(other) => tracing::debug!("Неожиданное сообщение на порту опроса: {:?}", other.transfer_id()),
            Err(e) => tracing::warn!("Некорректный пакет опроса от {}: {}", peer, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, port: u16) -> DeviceIdentity {
        DeviceIdentity::local(name, "10.0.0.9", port, true)
    }

    // === Тесты реестра ===

    #[test]
    fn test_repeated_reply_does_not_duplicate() {
        let registry = DeviceRegistry::new();
        assert!(registry.upsert(identity("desk", 9527), "10.0.0.2"));
        assert!(!registry.upsert(identity("desk", 9527), "10.0.0.2"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_changed_reply_overwrites() {
        let registry = DeviceRegistry::new();
        registry.upsert(identity("desk", 9527), "10.0.0.2");
        assert!(registry.upsert(identity("renamed", 9527), "10.0.0.2"));

        let list = registry.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "renamed");
    }

    #[test]
    fn test_arrival_order_does_not_matter() {
        let a = DeviceRegistry::new();
        a.upsert(identity("one", 1), "10.0.0.1");
        a.upsert(identity("two", 2), "10.0.0.2");

        let b = DeviceRegistry::new();
        b.upsert(identity("two", 2), "10.0.0.2");
        b.upsert(identity("one", 1), "10.0.0.1");

        let names = |r: &DeviceRegistry| r.list().into_iter().map(|d| d.name).collect::<Vec<_>>();
        assert_eq!(names(&a), names(&b));
    }

    #[test]
    fn test_find_by_host_or_endpoint() {
        let registry = DeviceRegistry::new();
        registry.upsert(identity("desk", 7000), "10.0.0.2");

        assert_eq!(registry.find("10.0.0.2").map(|d| d.port), Some(7000));
        assert_eq!(registry.find("10.0.0.2:7000").map(|d| d.name), Some("desk".to_string()));
        assert!(registry.find("10.0.0.3").is_none());
        assert_eq!(registry.get(0).map(|d| d.endpoint()), Some("10.0.0.2:7000".to_string()));
    }

    #[test]
    fn test_reset_clears() {
        let registry = DeviceRegistry::new();
        registry.upsert(identity("desk", 1), "10.0.0.2");
        registry.reset();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_is_own() {
        let me = identity("me", 1);
        let local: SocketAddr = "0.0.0.0:9528".parse().unwrap();
        assert!(is_own("127.0.0.1:9528", Some(local), &me));
        assert!(is_own("10.0.0.9:9528", Some(local), &me));
        assert!(!is_own("127.0.0.1:9600", Some(local), &me));
        assert!(!is_own("10.0.0.5:9528", Some(local), &me));
    }

    // === Тесты опроса ===

    async fn start(name: &str) -> (Discovery, mpsc::UnboundedReceiver<FtsEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let identity = Arc::new(Mutex::new(DeviceIdentity::local(name, "127.0.0.1", 9000, true)));
        let discovery = Discovery::start(0, IpMode::V4, identity, Arc::new(DeviceRegistry::new()), tx)
            .await
            .unwrap();
        (discovery, rx)
    }

    #[tokio::test]
    async fn test_targeted_poll_registers_device() {
        let (a, mut a_events) = start("alpha").await;
        let (b, _b_events) = start("beta").await;

        let target = format!("127.0.0.1:{}", b.port());
        let devices = a.poll_devices(Some(&target), Duration::from_millis(300)).await;

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "beta");
        assert_eq!(devices[0].address, "127.0.0.1");
        assert_eq!(devices[0].port, 9000);
        assert!(matches!(a_events.try_recv(), Ok(FtsEvent::DevicesUpdated(list)) if list.len() == 1));
    }

    #[tokio::test]
    async fn test_repeated_poll_is_idempotent() {
        let (a, _a_events) = start("alpha").await;
        let (b, _b_events) = start("beta").await;
        let target = format!("127.0.0.1:{}", b.port());

        let first = a.poll_devices(Some(&target), Duration::from_millis(200)).await;
        let second = a.poll_devices(Some(&target), Duration::from_millis(200)).await;

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert!(first[0].same_as(&second[0]));
    }
}
