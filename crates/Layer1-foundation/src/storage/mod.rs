//! Storage module for Yard
//!
//! - `json`: JSON - 범용 파일 저장/로드 (task records, config, account index)

mod json;

pub use json::JsonStore;
