pub mod admission;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod jwt;
pub mod kms;
pub mod ledger;
pub mod license_manager;
pub mod models;
pub mod scheduler;
pub mod storage;
pub mod sync;
pub mod util;
