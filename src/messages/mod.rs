pub mod storage;
pub mod types;

pub use storage::{HistoryFilter, HistoryStore, MessageStorage, Turn};
pub use types::{Message, MessageId, MessageSource, MessageType, StreamChannel, StreamInfo};
