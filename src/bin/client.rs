//! Unary RPC demo client
//!
//! Issues a sequence of calls, waiting for each completion before starting
//! the next, and finishes with a call that stops the demo server.
//!
//! Run with: cargo run --bin rpc-client -- --help

use anyhow::{anyhow, Result};
use bytes::Bytes;
use clap::Parser;
use parking_lot::Mutex;
use std::sync::Arc;
use unary_rpc::{CallType, Channel, Metadata, Rendezvous, Response};

#[derive(Parser, Debug)]
#[command(name = "rpc-client")]
#[command(about = "Unary RPC demo client")]
struct Args {
    /// Server address
    #[arg(long, default_value = "127.0.0.1:8999")]
    server_addr: String,

    /// Virtual host advertised to the server
    #[arg(long, default_value = "foo.test.google.fr")]
    host: String,

    /// Total number of calls, the last one goes to --final-method
    #[arg(long, default_value = "30")]
    calls: usize,

    /// Method for every call but the last
    #[arg(long, default_value = "/hello")]
    method: String,

    /// Method for the last call
    #[arg(long, default_value = "/goodbye")]
    final_method: String,

    /// Request payload
    #[arg(long, default_value = "hello, server!")]
    message: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn print_response(i: usize, response: &Response) {
    let payload = response
        .result_data
        .as_ref()
        .map(|data| String::from_utf8_lossy(data).into_owned())
        .unwrap_or_default();
    println!(
        "call {}: status={} message={} payload={:?}",
        i, response.status_code, response.status_message, payload
    );
    for (name, metadata) in [
        ("initial", &response.initial_metadata),
        ("trailing", &response.trailing_metadata),
    ] {
        if let Some(metadata) = metadata {
            for (key, value) in metadata.iter() {
                println!("  {} {}: {}", name, key, value);
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let mut channel = Channel::new(args.server_addr.clone());
    channel.set_host(args.host.clone());
    let message = Bytes::from(args.message.clone().into_bytes());

    for i in 0..args.calls {
        let method = if i + 1 < args.calls {
            &args.method
        } else {
            &args.final_method
        };
        let call = channel.make_call(method.as_str());
        let metadata = Metadata::from([("x", "xylophone"), ("y", "yu"), ("z", "zither")]);

        let done = Arc::new(Rendezvous::new(1));
        let slot = Arc::new(Mutex::new(None));
        {
            let done = done.clone();
            let slot = slot.clone();
            runtime.block_on(call.start(
                CallType::Unary,
                metadata,
                Some(message.clone()),
                move |response| {
                    *slot.lock() = Some(response);
                    done.arrive();
                },
            ))?;
        }

        // Wait for the completion before issuing the next call
        done.wait();
        let response = slot
            .lock()
            .take()
            .ok_or_else(|| anyhow!("call {} completed without a response", i))?;
        print_response(i, &response);
        tracing::debug!("Finished client call {}", i);
    }

    tracing::info!("Client done");
    Ok(())
}
