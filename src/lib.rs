//! chatd: background engine for tool-calling AI chat jobs.
//!
//! Chats are durable jobs. The [`processor`] claims pending ones and drives
//! them through the [`agent`] loop, [`stream`] fans their output out to live
//! subscribers, and [`subagent`] lets a chat delegate work to child chats.

pub mod agent;
pub mod api;
pub mod chat;
pub mod config;
pub mod error;
pub mod llm;
pub mod processor;
pub mod store;
pub mod stream;
pub mod subagent;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;
