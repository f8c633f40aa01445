//! Синхронизация времени
//!
//! Смещение локальных часов определяется по NTP серверу (UDP) или по
//! ретранслятору другого устройства (TCP/WebSocket, сообщения
//! `TimeRequest`/`TimeReply`). Храним последние замеры, отбрасываем
//! замеры с большой задержкой и берём медиану смещений.

mod repeater;
pub mod sntp;

pub use repeater::TimeRepeater;

use crate::error::{codes, FtsError, Result, TransportError};
use crate::network::transport::{self, lock, Transport, TransportConfig, TransportEvent, TransportType};
use crate::protocol::Message;
use crate::utils::{unix_millis, with_default_port};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Порт NTP по умолчанию
pub const NTP_PORT: u16 = 123;

/// Сколько последних замеров учитывается
const MAX_SAMPLES: usize = 8;

/// Состояние синхронизации
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    Requesting,
    Synced,
    Error(String),
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    offset_ms: f64,
    delay_ms: f64,
}

struct ClockInner {
    samples: VecDeque<Sample>,
    offset_ms: f64,
    state: SyncState,
    last_sync: Option<Instant>,
}

/// Скорректированные часы
pub struct TimeSync {
    inner: Mutex<ClockInner>,
}

static GLOBAL: OnceLock<Arc<TimeSync>> = OnceLock::new();

impl Default for TimeSync {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSync {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ClockInner {
                samples: VecDeque::with_capacity(MAX_SAMPLES + 1),
                offset_ms: 0.0,
                state: SyncState::Unsynced,
                last_sync: None,
            }),
        }
    }

    /// Часы процесса
    pub fn global() -> Arc<TimeSync> {
        GLOBAL.get_or_init(|| Arc::new(TimeSync::new())).clone()
    }

    /// Текущее время (мс от UNIX эпохи) с учётом смещения
    pub fn now_ms(&self) -> i64 {
        unix_millis() + self.offset_ms().round() as i64
    }

    pub fn now(&self) -> SystemTime {
        let ms = self.now_ms().max(0) as u64;
        UNIX_EPOCH + Duration::from_millis(ms)
    }

    /// Смещение относительно локальных часов (мс)
    pub fn offset_ms(&self) -> f64 {
        lock(&self.inner).offset_ms
    }

    pub fn state(&self) -> SyncState {
        lock(&self.inner).state.clone()
    }

    pub fn is_synced(&self) -> bool {
        self.state() == SyncState::Synced
    }

    /// Когда была последняя удачная синхронизация
    pub fn last_sync(&self) -> Option<Instant> {
        lock(&self.inner).last_sync
    }

    /// Забыть все замеры
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        inner.samples.clear();
        inner.offset_ms = 0.0;
        inner.state = SyncState::Unsynced;
        inner.last_sync = None;
    }

    /// Добавить замер и пересчитать смещение
    pub(crate) fn add_sample(&self, offset_ms: f64, delay_ms: f64) -> f64 {
        let mut inner = lock(&self.inner);
        inner.samples.push_back(Sample { offset_ms, delay_ms });
        while inner.samples.len() > MAX_SAMPLES {
            inner.samples.pop_front();
        }
        inner.offset_ms = filtered_offset(&inner.samples);
        inner.state = SyncState::Synced;
        inner.last_sync = Some(Instant::now());
        inner.offset_ms
    }

    fn set_state(&self, state: SyncState) {
        lock(&self.inner).state = state;
    }

    /// Запросить время у `server`. UDP - NTP сервер, TCP/WebSocket - ретранслятор.
    /// Возвращает новое смещение (мс)
    pub async fn request_sync(
        &self,
        server: &str,
        port: u16,
        via: TransportType,
        timeout: Duration,
    ) -> Result<f64> {
        let addr = with_default_port(server, port);
        self.set_state(SyncState::Requesting);

        let measured = match via {
            TransportType::Udp => query_sntp(&addr, timeout).await,
            _ => query_relay(via, &addr, timeout).await,
        };

        match measured {
            Ok((offset, delay)) => {
                let offset = self.add_sample(offset, delay);
                tracing::info!("Время синхронизировано с {}: смещение {:.1} мс (задержка {:.1} мс)", addr, offset, delay);
                Ok(offset)
            }
            Err(e) => {
                tracing::warn!("Синхронизация времени с {} не удалась: {}", addr, e);
                self.set_state(SyncState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Несколько запросов подряд для накопления замеров
    pub async fn sync_rounds(
        &self,
        server: &str,
        port: u16,
        via: TransportType,
        timeout: Duration,
        rounds: usize,
    ) -> Result<f64> {
        let mut last = Err(FtsError::Timeout);
        for _ in 0..rounds.max(1) {
            last = self.request_sync(server, port, via, timeout).await;
        }
        match last {
            Ok(offset) => Ok(offset),
            Err(e) if self.last_sync().is_some() => {
                tracing::debug!("Последний замер не удался ({}), используем предыдущие", e);
                self.set_state(SyncState::Synced);
                Ok(self.offset_ms())
            }
            Err(e) => Err(e),
        }
    }
}

/// Медиана смещений среди замеров, чья задержка не больше двух минимальных
fn filtered_offset(samples: &VecDeque<Sample>) -> f64 {
    let min_delay = samples
        .iter()
        .map(|s| s.delay_ms)
        .fold(f64::INFINITY, f64::min);
    let limit = (min_delay * 2.0).max(min_delay + 1.0);

    let mut offsets: Vec<f64> = samples
        .iter()
        .filter(|s| s.delay_ms <= limit)
        .map(|s| s.offset_ms)
        .collect();
    if offsets.is_empty() {
        return 0.0;
    }
    offsets.sort_by(|a, b| a.total_cmp(b));

    let mid = offsets.len() / 2;
    if offsets.len() % 2 == 0 {
        (offsets[mid - 1] + offsets[mid]) / 2.0
    } else {
        offsets[mid]
    }
}

/// Открыть клиентский транспорт и дождаться готовности
async fn open(
    via: TransportType,
    addr: &str,
    timeout: Duration,
) -> Result<(Arc<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>)> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let transport = transport::client(via, tx);
    let mut config = TransportConfig::remote(addr);
    config.connect_timeout = timeout;
    transport.setup(config);
    transport.connect().await;

    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Some(TransportEvent::Opened { .. })) => Ok((transport, rx)),
        Ok(Some(TransportEvent::Error { error, .. })) => Err(error.into()),
        Ok(_) => Err(TransportError::new(codes::NOT_CONNECTED, format!("{} закрыл соединение", addr)).into()),
        Err(_) => Err(FtsError::Timeout),
    }
}

/// Дождаться сообщения, которое принимает `accept`
async fn await_reply<T>(
    rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    timeout: Duration,
    mut accept: impl FnMut(&[u8]) -> Option<T>,
) -> Result<T> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(TransportEvent::Message { data, .. })) => {
                if let Some(reply) = accept(&data) {
                    return Ok(reply);
                }
            }
            Ok(Some(TransportEvent::Error { error, .. })) => return Err(error.into()),
            Ok(Some(TransportEvent::Closed { .. })) | Ok(None) => {
                return Err(TransportError::new(codes::NOT_CONNECTED, "Соединение закрыто до ответа").into())
            }
            Ok(Some(TransportEvent::Opened { .. })) => {}
            Err(_) => return Err(FtsError::Timeout),
        }
    }
}

async fn query_sntp(addr: &str, timeout: Duration) -> Result<(f64, f64)> {
    let (transport, mut rx) = open(TransportType::Udp, addr, timeout).await?;

    let t0 = unix_millis();
    let request = sntp::client_request(t0);
    transport.send(&request, None).await;
    let expected = sntp::unix_ms_to_ntp(t0);

    let reply = await_reply(&mut rx, timeout, |data| {
        sntp::parse_reply(data).filter(|r| r.originate_raw == expected)
    })
    .await?;
    let t3 = unix_millis();
    transport.disconnect().await;

    Ok(sntp::offset_and_delay(t0 as f64, reply.receive_ms, reply.transmit_ms, t3 as f64))
}

async fn query_relay(via: TransportType, addr: &str, timeout: Duration) -> Result<(f64, f64)> {
    let (transport, mut rx) = open(via, addr, timeout).await?;

    let t0 = unix_millis();
    transport.send(&Message::TimeRequest { client_send: t0 }.to_bytes()?, None).await;

    let (server_recv, server_send) = await_reply(&mut rx, timeout, |data| match Message::from_bytes(data) {
        Ok(Message::TimeReply { client_send, server_recv, server_send }) if client_send == t0 => {
            Some((server_recv, server_send))
        }
        _ => None,
    })
    .await?;
    let t3 = unix_millis();
    transport.disconnect().await;

    Ok(sntp::offset_and_delay(t0 as f64, server_recv as f64, server_send as f64, t3 as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(values: &[(f64, f64)]) -> VecDeque<Sample> {
        values
            .iter()
            .map(|&(offset_ms, delay_ms)| Sample { offset_ms, delay_ms })
            .collect()
    }

    #[test]
    fn test_filtered_offset_drops_slow_samples() {
        // Замер с задержкой 90 мс отбрасывается
        let s = samples(&[(10.0, 4.0), (12.0, 5.0), (500.0, 90.0), (11.0, 6.0)]);
        assert_eq!(filtered_offset(&s), 11.0);
    }

    #[test]
    fn test_filtered_offset_even_count_averages_middle() {
        let s = samples(&[(10.0, 1.0), (20.0, 1.0)]);
        assert_eq!(filtered_offset(&s), 15.0);
    }

    #[test]
    fn test_only_last_samples_are_kept() {
        let clock = TimeSync::new();
        for _ in 0..20 {
            clock.add_sample(1000.0, 1.0);
        }
        for _ in 0..MAX_SAMPLES {
            clock.add_sample(-50.0, 1.0);
        }
        assert_eq!(clock.offset_ms(), -50.0);
        assert_eq!(clock.state(), SyncState::Synced);
    }

    #[test]
    fn test_now_applies_offset() {
        let clock = TimeSync::new();
        clock.add_sample(60_000.0, 1.0);
        let diff = clock.now_ms() - unix_millis();
        assert!((59_900..=60_100).contains(&diff));
    }

    #[test]
    fn test_reset_returns_to_unsynced() {
        let clock = TimeSync::new();
        clock.add_sample(5.0, 1.0);
        clock.reset();
        assert_eq!(clock.state(), SyncState::Unsynced);
        assert_eq!(clock.offset_ms(), 0.0);
    }

    #[tokio::test]
    async fn test_unreachable_relay_sets_error() {
        let clock = TimeSync::new();
        let result = clock
            .request_sync("127.0.0.1", 1, TransportType::Tcp, Duration::from_secs(2))
            .await;
        assert!(result.is_err());
        assert!(matches!(clock.state(), SyncState::Error(_)));
    }

    #[tokio::test]
    async fn test_sync_through_repeater_over_udp_and_tcp() {
        let source = Arc::new(TimeSync::new());
        source.add_sample(250.0, 1.0);
        let repeater = TimeRepeater::new(source);

        for via in [TransportType::Udp, TransportType::Tcp] {
            let port = repeater.start(via, 0).await.unwrap();
            let clock = TimeSync::new();
            let offset = clock
                .request_sync("127.0.0.1", port, via, Duration::from_secs(2))
                .await
                .unwrap();
            assert!((offset - 250.0).abs() < 50.0, "{} offset {}", via, offset);
            assert!(clock.is_synced());
        }
        repeater.stop_all().await;
    }
}
