pub mod controller;
pub mod crypto;
pub mod download_file;
pub mod drive;
pub mod executor;
pub mod hasher;
pub mod mount;
pub mod scanner;
pub mod target;
pub mod token;
pub mod upload_file;
