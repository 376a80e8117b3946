//! Unary RPC exchange - Main entry point
//!
//! This crate implements a minimal unary RPC layer: a `Channel` creates
//! single-use `Call`s, a `Server` dispatches each inbound call to a handler.
//!
//! ## Call lifecycle
//!
//! 1. Client sends request headers (host, method, metadata)
//! 2. Client sends the request message
//! 3. Server handler sends initial metadata and reads the message
//! 4. Server handler sends the reply message, status and trailing metadata
//!
//! ## Usage
//!
//! Start the server:
//! ```bash
//! cargo run --bin rpc-server -- --listen-addr 127.0.0.1:8999
//! ```
//!
//! Run the client:
//! ```bash
//! cargo run --bin rpc-client -- --server-addr 127.0.0.1:8999 --calls 30
//! ```

fn main() {
    println!("Unary RPC exchange");
    println!();
    println!("Use the following binaries:");
    println!("  cargo run --bin rpc-server -- --help");
    println!("  cargo run --bin rpc-client -- --help");
    println!("  cargo run --bin rpc-bench -- --help");
}
