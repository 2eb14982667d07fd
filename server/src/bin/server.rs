//! ember HTTP server binary.

use clap::Parser;
use server::banner::{BannerConfig, print_banner};
use server::config::Config;
use server::{Server, fileserve, logging, metrics, signal};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ember-server")]
#[command(about = "Edge-triggered HTTP/1.1 server")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    logging::init(&config.logging);

    if let Err(e) = run(config) {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
}

fn run(config: Config) -> std::io::Result<()> {
    let server = Server::new(&config)?;

    // Static routes from the config file.
    for route in &config.routes {
        match (&route.file, &route.directory) {
            (Some(file), None) => {
                server.register(&route.pattern, fileserve::file_handler(file.clone()));
            }
            (None, Some(dir)) => {
                server.register(
                    &route.pattern,
                    fileserve::directory_handler(route.pattern.clone(), dir.clone()),
                );
            }
            _ => {}
        }
    }

    // Built-in observability endpoints.
    server.register("/health", |writer, _req| {
        writer.write("OK");
    });
    server.register("/metrics", |writer, _req| {
        writer.set_header("Content-Type", "text/plain; version=0.0.4; charset=utf-8");
        writer.write(metrics::prometheus_output());
    });

    print_banner(&BannerConfig {
        version: env!("CARGO_PKG_VERSION"),
        address: server.local_addr(),
        workers: config.threads(),
        edge_triggered: config.listener.edge_triggered,
        idle_timeout: config.idle_timeout(),
        routes: config.routes.len() + 2,
    });

    let handle = server.shutdown_handle();
    signal::install(move || handle.stop());

    server.run()
}

fn print_default_config() {
    let config = r#"# ember server configuration

[listener]
# Address to listen on
address = "0.0.0.0:8080"

# Listen backlog
backlog = 4096

# Edge-triggered readiness for client sockets / the listener
edge_triggered = true
edge_triggered_listener = true

[workers]
# Number of worker threads (default: number of CPUs)
# threads = 8

[connection]
# Idle connections are closed after this many milliseconds
idle_timeout_ms = 60000

# Outbound buffer segment capacity
segment_size = "4KB"

[poller]
# Minimum capacity of the ready-event buffer
min_events = 4096

[logging]
# Level filter, e.g. "info" or "server=debug"
level = "info"

# Output format: "pretty", "compact", or "json"
format = "pretty"

# Static routes - register one or more
# [[route]]
# pattern = "/"
# file = "/srv/www/index.html"
#
# [[route]]
# pattern = "/static/"
# directory = "/srv/www"
"#;
    print!("{config}");
}
