//! Диагностические кадры для проверки транспорта
//!
//! Текстовые кадры `PING;<id>;<sendTime>#<padding>`,
//! `PONG;<id>;<sendTime>;<recvTime>#` и `DATA;<id>;<sendTime>#<padding>`.
//! Числа десятичные, заполнитель `-` добивает кадр до нужного размера.
//! Разбор и обратная сборка дают те же байты.

use super::transport::{Transport, TransportEvent};
use crate::stats::transfer_rate_mbps;
use crate::timesync::TimeSync;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const TERMINATOR: u8 = b'#';
const PADDING: u8 = b'-';

/// Кадр стресс-теста
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StressFrame {
    Ping { id: u64, send_time: i64, padding: usize },
    Pong { id: u64, send_time: i64, recv_time: i64, padding: usize },
    Data { id: u64, send_time: i64, padding: usize },
}

impl StressFrame {
    /// PING, добитый до `size` байт
    pub fn ping(id: u64, send_time: i64, size: usize) -> Self {
        let mut frame = Self::Ping { id, send_time, padding: 0 };
        frame.pad_to(size);
        frame
    }

    /// DATA, добитый до `size` байт
    pub fn data(id: u64, send_time: i64, size: usize) -> Self {
        let mut frame = Self::Data { id, send_time, padding: 0 };
        frame.pad_to(size);
        frame
    }

    pub fn id(&self) -> u64 {
        match self {
            Self::Ping { id, .. } | Self::Pong { id, .. } | Self::Data { id, .. } => *id,
        }
    }

    fn header(&self) -> String {
        match self {
            Self::Ping { id, send_time, .. } => format!("PING;{};{}", id, send_time),
            Self::Pong { id, send_time, recv_time, .. } => format!("PONG;{};{};{}", id, send_time, recv_time),
            Self::Data { id, send_time, .. } => format!("DATA;{};{}", id, send_time),
        }
    }

    fn padding_mut(&mut self) -> &mut usize {
        match self {
            Self::Ping { padding, .. } | Self::Pong { padding, .. } | Self::Data { padding, .. } => padding,
        }
    }

    fn padding(&self) -> usize {
        match self {
            Self::Ping { padding, .. } | Self::Pong { padding, .. } | Self::Data { padding, .. } => *padding,
        }
    }

    /// Подобрать заполнитель так, чтобы кадр занял `size` байт (если заголовок короче)
    pub fn pad_to(&mut self, size: usize) {
        let bare = self.header().len() + 1;
        *self.padding_mut() = size.saturating_sub(bare);
    }

    /// Размер кадра в байтах
    pub fn len(&self) -> usize {
        self.header().len() + 1 + self.padding()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.header().into_bytes();
        bytes.push(TERMINATOR);
        bytes.resize(bytes.len() + self.padding(), PADDING);
        bytes
    }

    /// Разобрать кадр. None - это не стресс-кадр или он искажён
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let end = bytes.iter().position(|&b| b == TERMINATOR)?;
        let tail = &bytes[end + 1..];
        if tail.iter().any(|&b| b != PADDING) {
            return None;
        }
        let padding = tail.len();

        let header = std::str::from_utf8(&bytes[..end]).ok()?;
        let fields: Vec<&str> = header.split(';').collect();
        match fields.as_slice() {
            ["PING", id, send] => Some(Self::Ping {
                id: number(id)?,
                send_time: number(send)?,
                padding,
            }),
            ["PONG", id, send, recv] => Some(Self::Pong {
                id: number(id)?,
                send_time: number(send)?,
                recv_time: number(recv)?,
                padding,
            }),
            ["DATA", id, send] => Some(Self::Data {
                id: number(id)?,
                send_time: number(send)?,
                padding,
            }),
            _ => None,
        }
    }
}

/// Десятичное число в канонической записи (иначе кадр не соберётся обратно тем же)
fn number<T: std::str::FromStr + ToString>(text: &str) -> Option<T> {
    let value: T = text.parse().ok()?;
    (value.to_string() == text).then_some(value)
}

/// Похоже ли сообщение на стресс-кадр
pub fn is_stress_frame(bytes: &[u8]) -> bool {
    bytes.len() >= 5 && matches!(&bytes[..5], b"PING;" | b"PONG;" | b"DATA;")
}

/// Ответ на входящий кадр: PONG на PING, остальное без ответа
pub fn respond(bytes: &[u8], now_ms: i64) -> Option<Vec<u8>> {
    match StressFrame::parse(bytes)? {
        StressFrame::Ping { id, send_time, .. } => Some(
            StressFrame::Pong {
                id,
                send_time,
                recv_time: now_ms,
                padding: 0,
            }
            .to_bytes(),
        ),
        _ => None,
    }
}

/// Итог серии PING
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PingReport {
    pub sent: u64,
    pub received: u64,
    pub min_rtt_ms: f64,
    pub avg_rtt_ms: f64,
    pub max_rtt_ms: f64,
    /// Средняя задержка в одну сторону (имеет смысл при синхронизированных часах)
    pub avg_one_way_ms: f64,
}

impl PingReport {
    pub fn loss_percent(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        (self.sent - self.received) as f64 / self.sent as f64 * 100.0
    }

    pub fn formatted(&self) -> String {
        format!(
            "{}/{} ответов, потери {:.0}% | RTT min/avg/max {:.2}/{:.2}/{:.2} мс | в одну сторону {:.2} мс",
            self.received,
            self.sent,
            self.loss_percent(),
            self.min_rtt_ms,
            self.avg_rtt_ms,
            self.max_rtt_ms,
            self.avg_one_way_ms
        )
    }
}

/// Параметры серии
#[derive(Debug, Clone)]
pub struct PingOptions {
    pub count: u64,
    /// Размер кадра PING
    pub size: usize,
    /// Сколько ждать каждый PONG
    pub timeout: Duration,
    /// Пауза между кадрами
    pub interval: Duration,
}

impl Default for PingOptions {
    fn default() -> Self {
        Self {
            count: 10,
            size: 64,
            timeout: Duration::from_secs(1),
            interval: Duration::from_millis(100),
        }
    }
}

/// Отправить серию PING через открытый транспорт и собрать статистику.
/// `events` - канал уведомлений этого транспорта
pub async fn run_ping(
    transport: &Arc<dyn Transport>,
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    destination: Option<&str>,
    options: &PingOptions,
    clock: &TimeSync,
) -> PingReport {
    let mut report = PingReport::default();
    let mut rtts = Vec::new();
    let mut one_way_total = 0.0;

    for id in 0..options.count {
        let frame = StressFrame::ping(id, clock.now_ms(), options.size);
        let started = Instant::now();
        transport.send(&frame.to_bytes(), destination).await;
        report.sent += 1;

        let deadline = tokio::time::Instant::now() + options.timeout;
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(TransportEvent::Message { data, .. })) => {
                    if let Some(StressFrame::Pong { id: pong_id, send_time, recv_time, .. }) = StressFrame::parse(&data) {
                        if pong_id == id {
                            rtts.push(started.elapsed().as_secs_f64() * 1000.0);
                            one_way_total += (recv_time - send_time) as f64;
                            report.received += 1;
                            break;
                        }
                    }
                }
                Ok(Some(TransportEvent::Error { error, .. })) => {
                    tracing::warn!("PING {}: {}", id, error);
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }

        if id + 1 < options.count {
            tokio::time::sleep(options.interval).await;
        }
    }

    if !rtts.is_empty() {
        report.min_rtt_ms = rtts.iter().copied().fold(f64::INFINITY, f64::min);
        report.max_rtt_ms = rtts.iter().copied().fold(0.0, f64::max);
        report.avg_rtt_ms = rtts.iter().sum::<f64>() / rtts.len() as f64;
        report.avg_one_way_ms = one_way_total / rtts.len() as f64;
    }
    report
}

/// Отправить `count` кадров DATA размера `size` подряд. Возвращает скорость отправки в MB/s
pub async fn run_data(
    transport: &Arc<dyn Transport>,
    destination: Option<&str>,
    count: u64,
    size: usize,
    clock: &TimeSync,
) -> f64 {
    let started = Instant::now();
    let mut bytes = 0u64;
    for id in 0..count {
        let frame = StressFrame::data(id, clock.now_ms(), size).to_bytes();
        bytes += frame.len() as u64;
        transport.send(&frame, destination).await;
    }
    transfer_rate_mbps(bytes, started.elapsed())
}

/// Счётчик входящих кадров DATA
#[derive(Debug, Default, Clone)]
pub struct DataMeter {
    pub frames: u64,
    pub bytes: u64,
    /// Последний принятый id (для подсчёта пропусков)
    pub last_id: Option<u64>,
    pub missing: u64,
    delay_total_ms: f64,
    first: Option<Instant>,
    last: Option<Instant>,
}

impl DataMeter {
    /// Учесть кадр. false - это не DATA
    pub fn record(&mut self, bytes: &[u8], now_ms: i64) -> bool {
        let Some(StressFrame::Data { id, send_time, .. }) = StressFrame::parse(bytes) else {
            return false;
        };
        let now = Instant::now();
        self.first.get_or_insert(now);
        self.last = Some(now);

        if let Some(last) = self.last_id {
            if id > last + 1 {
                self.missing += id - last - 1;
            }
        }
        self.last_id = Some(self.last_id.map_or(id, |last| last.max(id)));
        self.frames += 1;
        self.bytes += bytes.len() as u64;
        self.delay_total_ms += (now_ms - send_time) as f64;
        true
    }

    /// Скорость приёма в MB/s между первым и последним кадром
    pub fn throughput_mbps(&self) -> f64 {
        match (self.first, self.last) {
            (Some(first), Some(last)) => transfer_rate_mbps(self.bytes, last.duration_since(first)),
            _ => 0.0,
        }
    }

    /// Средняя задержка доставки (по синхронизированным часам)
    pub fn avg_delay_ms(&self) -> f64 {
        if self.frames == 0 {
            return 0.0;
        }
        self.delay_total_ms / self.frames as f64
    }
}
