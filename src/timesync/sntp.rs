//! Пакеты SNTP (RFC 4330) - только то, что нужно клиенту и ретранслятору

/// Размер пакета без расширений
pub const NTP_PACKET_SIZE: usize = 48;

/// Секунд между 1900-01-01 (эпоха NTP) и 1970-01-01
const NTP_UNIX_OFFSET_SECS: i64 = 2_208_988_800;

const MODE_CLIENT: u8 = 3;
const MODE_SERVER: u8 = 4;
const MODE_BROADCAST: u8 = 5;
const VERSION: u8 = 4;

/// Стратум несинхронизированного сервера
pub const STRATUM_UNSYNCED: u8 = 16;

/// Ответ сервера (метки времени в мс от UNIX эпохи)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NtpReply {
    pub stratum: u8,
    /// Метка отправки запроса клиентом, как её вернул сервер (сырое значение)
    pub originate_raw: u64,
    /// Когда сервер получил запрос
    pub receive_ms: f64,
    /// Когда сервер отправил ответ
    pub transmit_ms: f64,
}

/// Время UNIX (мс) в формате NTP 32.32
pub fn unix_ms_to_ntp(ms: i64) -> u64 {
    let secs = ms.div_euclid(1000) + NTP_UNIX_OFFSET_SECS;
    let frac_ms = ms.rem_euclid(1000) as u64;
    ((secs as u64) << 32) | ((frac_ms << 32) / 1000)
}

/// Метка NTP 32.32 во время UNIX (мс, с дробной частью)
pub fn ntp_to_unix_ms(ts: u64) -> f64 {
    let secs = (ts >> 32) as i64 - NTP_UNIX_OFFSET_SECS;
    let frac = (ts & 0xFFFF_FFFF) as f64 / 4_294_967_296.0;
    (secs as f64 + frac) * 1000.0
}

fn read_ts(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

fn write_ts(buf: &mut [u8], at: usize, ts: u64) {
    buf[at..at + 8].copy_from_slice(&ts.to_be_bytes());
}

/// Запрос клиента с меткой отправки `transmit_ms`
pub fn client_request(transmit_ms: i64) -> [u8; NTP_PACKET_SIZE] {
    let mut packet = [0u8; NTP_PACKET_SIZE];
    packet[0] = (VERSION << 3) | MODE_CLIENT;
    write_ts(&mut packet, 40, unix_ms_to_ntp(transmit_ms));
    packet
}

/// Разобрать ответ сервера. None - не ответ сервера или сервер не синхронизирован
pub fn parse_reply(buf: &[u8]) -> Option<NtpReply> {
    if buf.len() < NTP_PACKET_SIZE {
        return None;
    }
    let mode = buf[0] & 0x07;
    if mode != MODE_SERVER && mode != MODE_BROADCAST {
        return None;
    }
    let stratum = buf[1];
    if stratum == 0 || stratum >= STRATUM_UNSYNCED {
        return None;
    }
    Some(NtpReply {
        stratum,
        originate_raw: read_ts(buf, 24),
        receive_ms: ntp_to_unix_ms(read_ts(buf, 32)),
        transmit_ms: ntp_to_unix_ms(read_ts(buf, 40)),
    })
}

/// Ответ ретранслятора на запрос клиента
pub fn server_reply(request: &[u8], stratum: u8, receive_ms: i64, transmit_ms: i64) -> Option<[u8; NTP_PACKET_SIZE]> {
    if request.len() < NTP_PACKET_SIZE || request[0] & 0x07 != MODE_CLIENT {
        return None;
    }
    let version = (request[0] >> 3) & 0x07;

    let mut packet = [0u8; NTP_PACKET_SIZE];
    packet[0] = (version << 3) | MODE_SERVER;
    packet[1] = stratum;
    // poll, precision (~1 мс)
    packet[2] = request[2];
    packet[3] = (-10i8) as u8;
    packet[12..16].copy_from_slice(b"FTS\0");
    write_ts(&mut packet, 16, unix_ms_to_ntp(receive_ms));
    packet[24..32].copy_from_slice(&request[40..48]);
    write_ts(&mut packet, 32, unix_ms_to_ntp(receive_ms));
    write_ts(&mut packet, 40, unix_ms_to_ntp(transmit_ms));
    Some(packet)
}

/// Смещение часов и задержка по четырём меткам (мс)
pub fn offset_and_delay(t0: f64, t1: f64, t2: f64, t3: f64) -> (f64, f64) {
    let offset = ((t1 - t0) + (t2 - t3)) / 2.0;
    let delay = (t3 - t0) - (t2 - t1);
    (offset, delay.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_conversion() {
        let ms = 1_700_000_000_123;
        let back = ntp_to_unix_ms(unix_ms_to_ntp(ms));
        assert!((back - ms as f64).abs() < 1.0);
        assert_eq!(unix_ms_to_ntp(0) >> 32, NTP_UNIX_OFFSET_SECS as u64);
    }

    #[test]
    fn test_client_request_header() {
        let packet = client_request(1_000);
        assert_eq!(packet[0], 0x23);
        assert!(parse_reply(&packet).is_none());
    }

    #[test]
    fn test_server_reply_echoes_originate() {
        let request = client_request(1_700_000_000_000);
        let reply = server_reply(&request, 2, 1_700_000_000_050, 1_700_000_000_051).unwrap();

        let parsed = parse_reply(&reply).unwrap();
        assert_eq!(parsed.stratum, 2);
        assert_eq!(parsed.originate_raw, unix_ms_to_ntp(1_700_000_000_000));
        assert!((parsed.receive_ms - 1_700_000_000_050.0).abs() < 1.0);
        assert!((parsed.transmit_ms - 1_700_000_000_051.0).abs() < 1.0);
    }

    #[test]
    fn test_unsynced_server_is_rejected() {
        let request = client_request(0);
        let reply = server_reply(&request, STRATUM_UNSYNCED, 10, 10).unwrap();
        assert!(parse_reply(&reply).is_none());
    }

    #[test]
    fn test_reply_to_non_client_is_none() {
        let mut request = client_request(0);
        request[0] = 0x24;
        assert!(server_reply(&request, 2, 0, 0).is_none());
        assert!(server_reply(&request[..10], 2, 0, 0).is_none());
    }

    #[test]
    fn test_offset_and_delay() {
        // Сервер спешит на 100 мс, задержка в одну сторону 10 мс
        let (offset, delay) = offset_and_delay(1000.0, 1110.0, 1111.0, 1021.0);
        assert!((offset - 100.0).abs() < 1e-9);
        assert!((delay - 20.0).abs() < 1e-9);
    }
}
