//! Command-line surface for the `urpc-bench` binary (§10.4): a thin driver
//! over the [`crate::server`] and [`crate::client`] engines, in the same
//! "`Args` is the raw CLI surface, a `From` conversion produces the
//! validated runtime config" style the benchmark harness used for its own
//! `BenchmarkConfig::from_args`.

use std::time::Duration;

use clap::builder::styling::{AnsiColor, Styles};
use clap::{Parser, Subcommand};

use crate::client::ClientConfig;
use crate::server::ServerConfig;
use crate::wire::{MAX_THREADS_NUM, MIN_TIMEOUT_MS};

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// A small-footprint RPC runtime: UDP, TCP and shared-memory transports
/// behind one wire protocol.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Increase diagnostic log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Silence the colourised stdout log; file logging is unaffected.
    #[arg(short, long, global = true, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Log file path ("stderr" logs there instead of a rotating file).
    #[arg(long, global = true, help_heading = "Output and Logging")]
    pub log_file: Option<String>,

    /// Pin each server worker thread to a distinct CPU core.
    #[arg(long, global = true, default_value_t = false)]
    pub pin_threads: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bind a server on `uri` and register a demo echo procedure.
    Serve {
        /// `udp://host:port/`, `tcp://host:port/`, or `shm://name`.
        uri: String,
        /// Worker thread count; 0 picks `num_cpus::get()`.
        #[arg(long, default_value_t = 0)]
        threads_num: usize,
        #[arg(long, default_value_t = 64)]
        max_clients: usize,
        #[arg(long, default_value_t = 2_000)]
        timeout_ms: u64,
        #[arg(long, default_value_t = 65_000)]
        max_data_size: usize,
        /// User procedure id the demo echo handler is registered under.
        #[arg(long, default_value_t = 0x2000_0001)]
        echo_proc: u32,
    },
    /// LOGIN, invoke a user procedure, print the reply, LOGOUT.
    Call {
        uri: String,
        /// User procedure id to invoke.
        proc_id: u32,
        /// `id=value` pairs; `value` is JSON-decoded to pick the wire type
        /// (number → u32/f64, string → NUL-terminated string).
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(u32, serde_json::Value)>,
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
    /// Issue the reserved GET_CAP call and print the capability value.
    GetCap {
        uri: String,
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
}

fn parse_param(s: &str) -> Result<(u32, serde_json::Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected `id=value`, got `{s}`"))?;
    let id = if let Some(hex) = key.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).map_err(|e| e.to_string())?
    } else {
        key.parse::<u32>().map_err(|e| e.to_string())?
    };
    let value: serde_json::Value = serde_json::from_str(value).map_err(|e| e.to_string())?;
    Ok((id, value))
}

pub fn server_config(threads_num: usize, max_clients: usize, timeout_ms: u64, max_data_size: usize) -> ServerConfig {
    let threads_num = if threads_num == 0 {
        num_cpus::get().min(MAX_THREADS_NUM)
    } else {
        threads_num.min(MAX_THREADS_NUM)
    };
    let timeout = Duration::from_millis(timeout_ms.max(MIN_TIMEOUT_MS));
    ServerConfig {
        threads_num,
        max_clients,
        timeout,
        max_data_size,
        tcp_buffer_size: max_data_size,
        clean: true,
        pin_threads: false,
    }
}

pub fn client_config(timeout_ms: u64, max_data_size: usize) -> ClientConfig {
    ClientConfig {
        timeout: Duration::from_millis(timeout_ms.max(MIN_TIMEOUT_MS)),
        max_data_size,
        tcp_buffer_size: max_data_size,
    }
}
