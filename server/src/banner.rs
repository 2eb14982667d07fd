//! Startup banner.

use std::fmt::Write;
use std::net::SocketAddr;
use std::time::Duration;

pub struct BannerConfig<'a> {
    pub version: &'a str,
    pub address: SocketAddr,
    pub workers: usize,
    pub edge_triggered: bool,
    pub idle_timeout: Duration,
    pub routes: usize,
}

/// Print a startup banner to stdout.
pub fn print_banner(config: &BannerConfig) {
    let mut output = String::with_capacity(256);

    let name = "ember-server";
    writeln!(output, "{} v{}", name, config.version).unwrap();
    writeln!(output, "{}", "=".repeat(name.len() + config.version.len() + 2)).unwrap();
    writeln!(output).unwrap();
    writeln!(output, "Listening:    {}", config.address).unwrap();
    writeln!(
        output,
        "Trigger mode: {}",
        if config.edge_triggered { "edge" } else { "level" }
    )
    .unwrap();
    writeln!(output, "Workers:      {}", config.workers).unwrap();
    writeln!(output, "Idle timeout: {:?}", config.idle_timeout).unwrap();
    writeln!(output, "Routes:       {}", config.routes).unwrap();

    print!("{output}");
}
