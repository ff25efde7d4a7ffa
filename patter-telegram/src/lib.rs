// patter-telegram: Telegram platform adapter for the patter engine.

pub mod adapter;
pub mod client;
pub mod parse;

pub use adapter::TelegramAdapter;
pub use client::TelegramClient;
