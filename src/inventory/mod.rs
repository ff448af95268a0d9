//! Inventory persistence and the response journal

pub mod journal;
pub mod store;

pub use journal::{JournalEntry, ResponseJournal};
pub use store::InventoryStore;
