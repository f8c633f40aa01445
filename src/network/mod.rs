//! Сетевой модуль - транспорты, опрос устройств и передача файлов

pub mod discovery;
pub mod engine;
mod events;
pub mod gate;
pub(crate) mod receiver;
pub(crate) mod route;
pub(crate) mod sender;
pub mod stress;
pub mod transfer;
pub mod transport;

pub use discovery::{DeviceRegistry, Discovery, RemoteDevice};
pub use engine::{DeviceTarget, FileTransferService};
pub use events::FtsEvent;
pub use gate::ConfirmationGate;
pub use transfer::{FileRequest, FileUpload, TransferStatus, TransferTarget};
pub use transport::{TransportEvent, TransportType};
