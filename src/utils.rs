//! Вспомогательные утилиты

use crate::config::IpMode;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Форматирование размера файла в человекочитаемый вид
pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} ГБ", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} МБ", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} КБ", size as f64 / KB as f64)
    } else {
        format!("{} Б", size)
    }
}

/// Адрес этого устройства в локальной сети для режима `ip_mode`
pub fn local_ip(ip_mode: IpMode) -> Option<IpAddr> {
    let found = match ip_mode {
        IpMode::V4 => local_ip_address::local_ip(),
        IpMode::V6 => local_ip_address::local_ipv6(),
    };
    found.ok().filter(|ip| !ip.is_unspecified())
}

/// Адрес для ответов на опрос. Без сети - loopback
pub fn local_address(ip_mode: IpMode) -> String {
    match local_ip(ip_mode) {
        Some(ip) => ip.to_string(),
        None => match ip_mode {
            IpMode::V4 => Ipv4Addr::LOCALHOST.to_string(),
            IpMode::V6 => Ipv6Addr::LOCALHOST.to_string(),
        },
    }
}

/// Есть ли в адресе порт (`host:port`, `[v6]:port`)
pub fn has_port(addr: &str) -> bool {
    if addr.starts_with('[') {
        return addr.contains("]:");
    }
    // Голый IPv6 без скобок портом не считаем
    addr.matches(':').count() == 1
}

/// Дописать порт, если его нет
pub fn with_default_port(addr: &str, port: u16) -> String {
    if has_port(addr) {
        return addr.to_string();
    }
    if addr.contains(':') && !addr.starts_with('[') {
        return format!("[{}]:{}", addr, port);
    }
    format!("{}:{}", addr, port)
}

/// Хост без порта
pub fn host_of(addr: &str) -> &str {
    if !has_port(addr) {
        return addr;
    }
    match addr.rsplit_once(':') {
        Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
        None => addr,
    }
}

/// Текущее время в миллисекундах от UNIX эпохи
pub fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size_bytes() {
        assert_eq!(format_size(0), "0 Б");
        assert_eq!(format_size(1023), "1023 Б");
    }

    #[test]
    fn test_format_size_kilobytes() {
        assert_eq!(format_size(1024), "1.00 КБ");
        assert_eq!(format_size(1536), "1.50 КБ");
    }

    #[test]
    fn test_format_size_megabytes() {
        assert_eq!(format_size(1024 * 1024), "1.00 МБ");
        assert_eq!(format_size(1024 * 1024 + 512 * 1024), "1.50 МБ");
    }

    #[test]
    fn test_format_size_gigabytes() {
        assert_eq!(format_size(1024 * 1024 * 1024), "1.00 ГБ");
    }

    #[test]
    fn test_local_address_matches_mode() {
        let v4: IpAddr = local_address(IpMode::V4).parse().unwrap();
        assert!(v4.is_ipv4());
        let v6: IpAddr = local_address(IpMode::V6).parse().unwrap();
        assert!(v6.is_ipv6());
    }

    #[test]
    fn test_with_default_port() {
        assert_eq!(with_default_port("10.0.0.2", 9527), "10.0.0.2:9527");
        assert_eq!(with_default_port("10.0.0.2:7000", 9527), "10.0.0.2:7000");
        assert_eq!(with_default_port("::1", 9527), "[::1]:9527");
        assert_eq!(with_default_port("[::1]:7000", 9527), "[::1]:7000");
        assert_eq!(with_default_port("desk.local", 80), "desk.local:80");
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("10.0.0.2:9527"), "10.0.0.2");
        assert_eq!(host_of("10.0.0.2"), "10.0.0.2");
        assert_eq!(host_of("[::1]:9527"), "::1");
        assert_eq!(host_of("::1"), "::1");
    }

    #[test]
    fn test_unix_millis_is_recent() {
        // 2020-01-01
        assert!(unix_millis() > 1_577_836_800_000);
    }
}
