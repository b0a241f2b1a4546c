#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! The chat-facing half of the `easel` dispatcher: admission & dispatch, the
//! slash-command layer, result fan-out, the pinned chat-adapter contract and
//! the console transport that implements it locally.

pub mod admission;
pub mod chat;
pub mod cli;
pub mod commands;
pub mod console;
pub mod fanout;
pub mod shutdown;

#[cfg(test)]
mod testutil;
