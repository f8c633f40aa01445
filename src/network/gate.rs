//! Подтверждение принудительных загрузок
//!
//! Пока отправитель ждёт решения, загрузка лежит в очереди в состоянии
//! inactive. Очередь ограничена: лишние предложения сразу отклоняются.

use super::transfer::{FileRequest, TransferStatus};
use super::transport::lock;
use crate::protocol::TransferId;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Очередь загрузок, ожидающих подтверждения
pub struct ConfirmationGate {
    capacity: usize,
    pending: Mutex<VecDeque<FileRequest>>,
}

impl ConfirmationGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Поставить загрузку в очередь. false - очередь заполнена
    pub(crate) fn ask_for_confirmation(&self, request: FileRequest) -> bool {
        let mut pending = lock(&self.pending);
        pending.retain(|r| r.status() == TransferStatus::Inactive);
        if pending.len() >= self.capacity {
            tracing::warn!(
                "Очередь подтверждений заполнена ({}), отклоняем {}",
                self.capacity,
                request.file_name()
            );
            return false;
        }
        if pending.iter().any(|r| r.id() == request.id()) {
            return true;
        }
        pending.push_back(request);
        true
    }

    /// Загрузки, ожидающие решения (в порядке поступления)
    pub fn pending(&self) -> Vec<FileRequest> {
        lock(&self.pending)
            .iter()
            .filter(|r| r.status() == TransferStatus::Inactive)
            .cloned()
            .collect()
    }

    /// Самая старая ожидающая загрузка
    pub fn next(&self) -> Option<FileRequest> {
        self.pending().into_iter().next()
    }

    /// Принять загрузку
    pub fn confirm(&self, id: TransferId) -> Option<FileRequest> {
        let request = self.take(id)?;
        request.start();
        Some(request)
    }

    /// Отклонить загрузку
    pub fn reject(&self, id: TransferId) -> Option<FileRequest> {
        let request = self.take(id)?;
        request.abort();
        Some(request)
    }

    /// Убрать из очереди без решения (отправитель сам отменил)
    pub(crate) fn remove(&self, id: TransferId) -> Option<FileRequest> {
        self.take(id)
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, id: TransferId) -> Option<FileRequest> {
        let mut pending = lock(&self.pending);
        let index = pending.iter().position(|r| r.id() == id)?;
        pending.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transfer::{RequestInfo, TransferState};
    use uuid::Uuid;

    fn forced(name: &str) -> FileRequest {
        FileRequest::new(
            TransferState::new(Uuid::new_v4(), TransferStatus::Inactive, 100),
            RequestInfo {
                file_name: name.to_string(),
                save_name: name.to_string(),
                chunk_size: 4096,
                device: "10.0.0.2:9527".to_string(),
                forced: true,
                sender: Some("desk".to_string()),
            },
        )
    }

    #[test]
    fn test_confirm_starts_request() {
        let gate = ConfirmationGate::new(4);
        let request = forced("example.png");
        assert!(gate.ask_for_confirmation(request.clone()));
        assert_eq!(gate.len(), 1);

        let confirmed = gate.confirm(request.id()).unwrap();
        assert!(confirmed.is_same(&request));
        assert_eq!(request.status(), TransferStatus::Active);
        assert!(gate.is_empty());
    }

    #[test]
    fn test_reject_aborts_request() {
        let gate = ConfirmationGate::new(4);
        let request = forced("capture.jpg");
        gate.ask_for_confirmation(request.clone());

        gate.reject(request.id());
        assert_eq!(request.status(), TransferStatus::Aborted);
        assert!(gate.confirm(request.id()).is_none());
    }

    #[test]
    fn test_queue_is_bounded() {
        let gate = ConfirmationGate::new(2);
        assert!(gate.ask_for_confirmation(forced("a")));
        assert!(gate.ask_for_confirmation(forced("b")));
        assert!(!gate.ask_for_confirmation(forced("c")));
        assert_eq!(gate.len(), 2);
    }

    #[test]
    fn test_aborted_entries_free_their_slot() {
        let gate = ConfirmationGate::new(1);
        let first = forced("a");
        gate.ask_for_confirmation(first.clone());
        first.abort();

        assert!(gate.ask_for_confirmation(forced("b")));
        assert_eq!(gate.next().map(|r| r.file_name().to_string()), Some("b".to_string()));
    }

    #[test]
    fn test_pending_keeps_arrival_order() {
        let gate = ConfirmationGate::new(4);
        for name in ["one", "two", "three"] {
            gate.ask_for_confirmation(forced(name));
        }
        let names: Vec<_> = gate.pending().iter().map(|r| r.file_name().to_string()).collect();
        assert_eq!(names, vec!["one", "two", "three"]);
    }
}
