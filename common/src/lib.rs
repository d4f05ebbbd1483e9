#![allow(clippy::missing_docs_in_private_items)]

pub mod error;
pub mod reaper;
pub mod storage;
pub mod utils;
