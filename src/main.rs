//! `urpc-bench`: a small CLI driving the uRPC runtime end-to-end —
//! `serve` binds a server and registers a demo echo procedure, `call`
//! performs a LOGIN/invoke/LOGOUT cycle, `get-cap` issues the reserved
//! capability query.

use std::io::BufRead;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use urpc::cli::{client_config, server_config, Args, Command};
use urpc::client::Client;
use urpc::databuffer::{DataBuffer, Direction};
use urpc::error::Status;
use urpc::server::ServerBuilder;

mod logging;
use logging::ColorizedFormatter;

/// The echo handler S1 exercises: reverses the byte array at this param id.
const DEMO_PARAM_ID: u32 = 0x2000_0001;

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_log_layer;
    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("urpc.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "urpc.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();
    let _log_guard = guard;

    match args.command {
        Command::Serve {
            uri,
            threads_num,
            max_clients,
            timeout_ms,
            max_data_size,
            echo_proc,
        } => run_serve(
            &uri,
            threads_num,
            max_clients,
            timeout_ms,
            max_data_size,
            echo_proc,
            args.pin_threads,
        ),
        Command::Call {
            uri,
            proc_id,
            params,
            timeout_ms,
        } => run_call(&uri, proc_id, &params, timeout_ms),
        Command::GetCap { uri, timeout_ms } => run_get_cap(&uri, timeout_ms),
    }
}

fn run_serve(
    uri: &str,
    threads_num: usize,
    max_clients: usize,
    timeout_ms: u64,
    max_data_size: usize,
    echo_proc: u32,
    pin_threads: bool,
) -> Result<()> {
    let mut config = server_config(threads_num, max_clients, timeout_ms, max_data_size);
    config.pin_threads = pin_threads;

    let mut builder = ServerBuilder::new();
    builder.add_proc(echo_proc, echo_handler)?;
    let server = builder.bind(uri, config)?;
    info!(uri, "serving; press enter (or send EOF) to stop");

    let stdin = std::io::stdin();
    let mut line = String::new();
    let _ = stdin.lock().read_line(&mut line);

    server.shutdown();
    info!("server stopped");
    Ok(())
}

fn echo_handler(_session_id: u32, buf: &mut DataBuffer) -> i32 {
    let data = match buf.get(Direction::Input, DEMO_PARAM_ID) {
        Ok(Some(bytes)) => bytes.to_vec(),
        _ => return 0,
    };
    let mut reversed = data;
    reversed.reverse();
    match buf.set(Direction::Output, DEMO_PARAM_ID, &reversed) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn run_call(uri: &str, proc_id: u32, params: &[(u32, serde_json::Value)], timeout_ms: u64) -> Result<()> {
    let client = Client::connect(uri, client_config(timeout_ms, 65_000))?;
    let mut handle = client.lock();

    let status = handle.login()?;
    if !status.is_ok() {
        error!(?status, "login failed");
        return Ok(());
    }

    for (id, value) in params {
        set_param(handle.buffer_mut(), *id, value);
    }

    let status = handle.exec(proc_id)?;
    print_status("call", status);

    let _ = handle.logout()?;
    Ok(())
}

fn run_get_cap(uri: &str, timeout_ms: u64) -> Result<()> {
    let client = Client::connect(uri, client_config(timeout_ms, 65_000))?;
    let mut handle = client.lock();
    let status = handle.get_cap()?;
    print_status("get-cap", status);
    if status.is_ok() {
        if let Ok(Some(cap)) = handle.buffer_mut().get_u32(Direction::Input, urpc::wire::PARAM_CAP) {
            println!("cap = {cap}");
        }
    }
    Ok(())
}

fn set_param(buf: &mut DataBuffer, id: u32, value: &serde_json::Value) {
    let result = match value {
        serde_json::Value::String(s) => buf.set_string(Direction::Output, id, s),
        serde_json::Value::Number(n) if n.is_i64() => {
            buf.set_i32(Direction::Output, id, n.as_i64().unwrap() as i32)
        }
        serde_json::Value::Number(n) => buf.set_f64(Direction::Output, id, n.as_f64().unwrap_or(0.0)),
        serde_json::Value::Bool(b) => buf.set_u32(Direction::Output, id, *b as u32),
        other => buf.set_string(Direction::Output, id, &other.to_string()),
    };
    if let Err(e) = result {
        error!(id, error = %e, "failed to set parameter");
    }
}

fn print_status(what: &str, status: Status) {
    if status.is_ok() {
        println!("{what}: OK");
    } else {
        println!("{what}: {status:?}");
    }
}

