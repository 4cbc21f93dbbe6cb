pub mod chat_sender;
pub mod commands;
pub mod config;
pub mod delivery;
pub mod formatter;
pub mod processor;
pub mod scheduler;
pub mod store;
pub mod ts_client;
pub mod utils;
pub mod webhook;

pub use chat_sender::{ChatSender, TelegramChatSender};
pub use config::Config;
pub use processor::EventProcessor;
pub use store::Store;
pub use ts_client::{HttpTicketInfoClient, TicketInfoClient};
pub use utils::errors::RelayError;
pub use utils::setup_logging;
