use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use clap::Parser;

use ember::{ServerConfig, WebServer};

#[derive(Parser)]
#[command(name = "ember")]
#[command(about = "Single-reactor, multi-worker HTTP/1.1 static file server")]
#[command(version)]
struct Args {
    /// Port to listen on (0 picks a free port)
    #[arg(short, long, default_value_t = 1316)]
    port: u16,

    /// Edge-trigger mode: 0=none, 1=connections, 2=listener, 3=both
    #[arg(short, long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(0..=3))]
    trig_mode: u8,

    /// Idle-connection timeout in milliseconds (0 disables)
    #[arg(long, default_value_t = 60_000)]
    timeout_ms: u64,

    /// PostgreSQL host
    #[arg(long, default_value = "127.0.0.1")]
    sql_host: String,

    /// PostgreSQL port
    #[arg(long, default_value_t = 5432)]
    sql_port: u16,

    /// PostgreSQL user
    #[arg(long, default_value = "root")]
    sql_user: String,

    /// PostgreSQL password
    #[arg(long, default_value = "root")]
    sql_password: String,

    /// Database holding the user table
    #[arg(long, default_value = "webserver")]
    db_name: String,

    /// Database handles to keep pooled (0 disables the auth backend)
    #[arg(long, default_value_t = 12)]
    conn_pool: usize,

    /// Worker threads (defaults to the core count)
    #[arg(long)]
    threads: Option<usize>,

    /// Disable file logging
    #[arg(long)]
    no_log: bool,

    /// Log level: 0=debug, 1=info, 2=warn, 3=error
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(usize))]
    log_level: usize,

    /// Async log queue capacity (0 logs synchronously)
    #[arg(long, default_value_t = 1024)]
    log_queue: usize,

    /// Static asset root (defaults to ./resources)
    #[arg(long)]
    src_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = ServerConfig {
        port: args.port,
        trig_mode: args.trig_mode,
        timeout_ms: args.timeout_ms,
        sql_host: args.sql_host,
        sql_port: args.sql_port,
        sql_user: args.sql_user,
        sql_password: args.sql_password,
        db_name: args.db_name,
        conn_pool_size: args.conn_pool,
        thread_pool_size: args.threads.unwrap_or_else(num_cpus::get).max(1),
        open_log: !args.no_log,
        log_level: args.log_level,
        log_queue_size: args.log_queue,
        src_dir: args.src_dir,
        ..ServerConfig::default()
    };

    let mut server = match WebServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("ember: startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("ember listening on port {}", server.port());

    let shutdown = server.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nreceived SIGINT, shutting down...");
        shutdown.store(true, Ordering::Release);
    }) {
        eprintln!("ember: failed to install signal handler: {}", e);
    }

    server.start();
    ExitCode::SUCCESS
}
