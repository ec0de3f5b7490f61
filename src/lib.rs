pub mod config;
pub mod database;
pub mod judge;
pub mod language;
pub mod lease;
pub mod sandbox;
pub mod worker;

use chrono::{DateTime, SecondsFormat, Utc};

pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn create_timestamp() -> String {
    format_timestamp(Utc::now())
}
