// rkv-server - Async TCP front end for the RowKV engine

pub mod server;

pub use server::{dispatch_request, handle_connection, serve};
