//! Статистика передачи - скорость, ETA

use std::time::{Duration, Instant};

/// Вес нового замера в сглаженной скорости
const SMOOTHING: f64 = 0.3;

/// Замеры чаще этого не учитываются
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(1);

const MB: f64 = 1024.0 * 1024.0;

/// Скорость и ETA для наблюдателя, который периодически опрашивает прогресс
/// передачи (CLI, UI)
#[derive(Clone, Debug)]
pub struct TransferStats {
    /// Общий размер (0 - пока неизвестен)
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    started: Instant,
    last_sample: Option<(Instant, u64)>,
    /// Сглаженная скорость, байт/сек
    speed: f64,
}

impl TransferStats {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            transferred_bytes: 0,
            started: Instant::now(),
            last_sample: None,
            speed: 0.0,
        }
    }

    /// Новый замер прогресса
    pub fn update(&mut self, bytes_transferred: u64) {
        let now = Instant::now();
        self.transferred_bytes = bytes_transferred;

        let Some((at, bytes)) = self.last_sample else {
            self.last_sample = Some((now, bytes_transferred));
            return;
        };
        let dt = now.duration_since(at);
        if dt < MIN_SAMPLE_INTERVAL {
            return;
        }
        let current = bytes_transferred.saturating_sub(bytes) as f64 / dt.as_secs_f64();
        self.speed = if self.speed == 0.0 {
            current
        } else {
            SMOOTHING * current + (1.0 - SMOOTHING) * self.speed
        };
        self.last_sample = Some((now, bytes_transferred));
    }

    pub fn speed_bytes_per_sec(&self) -> f64 {
        self.speed
    }

    pub fn speed_formatted(&self) -> String {
        format_speed(self.speed)
    }

    /// Оставшееся время. None - скорость или размер ещё неизвестны
    pub fn eta(&self) -> Option<Duration> {
        if self.speed < 1.0 || self.total_bytes == 0 {
            return None;
        }
        let remaining = self.total_bytes.saturating_sub(self.transferred_bytes);
        Some(Duration::from_secs_f64(remaining as f64 / self.speed))
    }

    pub fn eta_formatted(&self) -> String {
        self.eta().map(format_duration).unwrap_or_else(|| "∞".to_string())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Средняя скорость с начала наблюдения, MB/s
    pub fn average_mbps(&self) -> f64 {
        transfer_rate_mbps(self.transferred_bytes, self.elapsed())
    }

    pub fn progress_percent(&self) -> f32 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.transferred_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0) as f32
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Средняя скорость в MB/s за время `elapsed`
pub fn transfer_rate_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 / MB / secs
}

/// Форматировать скорость
pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec < 1024.0 {
        format!("{:.0} B/s", bytes_per_sec)
    } else if bytes_per_sec < MB {
        format!("{:.1} KB/s", bytes_per_sec / 1024.0)
    } else if bytes_per_sec < MB * 1024.0 {
        format!("{:.1} MB/s", bytes_per_sec / MB)
    } else {
        format!("{:.2} GB/s", bytes_per_sec / MB / 1024.0)
    }
}

/// Форматировать длительность
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}с", secs)
    } else if secs < 3600 {
        format!("{}м {}с", secs / 60, secs % 60)
    } else {
        format!("{}ч {}м", secs / 3600, (secs % 3600) / 60)
    }
}
