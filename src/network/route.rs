//! Обратный адрес: через какой транспорт и кому отвечать

use super::transport::Transport;
use crate::protocol::Message;
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct Route {
    transport: Arc<dyn Transport>,
    /// Адресат на серверном транспорте. None - единственный собеседник клиента
    peer: Option<String>,
    /// Адрес собеседника для логов и событий
    label: String,
}

impl Route {
    /// Маршрут через клиентский транспорт к `remote`
    pub(crate) fn client(transport: Arc<dyn Transport>, remote: &str) -> Self {
        Self {
            transport,
            peer: None,
            label: remote.to_string(),
        }
    }

    /// Маршрут к соединению `peer` серверного транспорта
    pub(crate) fn server(transport: Arc<dyn Transport>, peer: &str) -> Self {
        Self {
            transport,
            peer: Some(peer.to_string()),
            label: peer.to_string(),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    /// Идёт ли маршрут через это соединение
    pub(crate) fn is_via(&self, transport: &Arc<dyn Transport>, peer: Option<&str>) -> bool {
        Arc::as_ptr(&self.transport) as *const () == Arc::as_ptr(transport) as *const ()
            && self.peer.as_deref() == peer
    }

    pub(crate) async fn send(&self, message: &Message) {
        match message.to_bytes() {
            Ok(bytes) => self.transport.send(&bytes, self.peer.as_deref()).await,
            Err(e) => tracing::error!("Не удалось закодировать сообщение для {}: {}", self.label, e),
        }
    }

    /// Отправить уже готовые байты (ответы на стресс-кадры)
    pub(crate) async fn send_raw(&self, bytes: &[u8]) {
        self.transport.send(bytes, self.peer.as_deref()).await;
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Route({} via {})", self.label, self.transport.transport_type())
    }
}
