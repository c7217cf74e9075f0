//! Generation stores and the per-kind storages built on them.

mod box_storage;
mod device;
mod generation_store;

pub use box_storage::BoxStorage;
pub use device::DeviceEkStorage;
pub use generation_store::{GenerationRecord, GenerationStore};
