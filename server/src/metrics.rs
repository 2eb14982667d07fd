//! Server metrics and Prometheus exposition.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "requests_received", description = "Complete requests parsed")]
pub static REQUESTS_RECEIVED: Counter = Counter::new();

#[metric(name = "responses_sent", description = "Responses fully written")]
pub static RESPONSES_SENT: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Response bytes written to sockets")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "protocol_errors",
    description = "Requests rejected by the parser"
)]
pub static PROTOCOL_ERRORS: Counter = Counter::new();

#[metric(
    name = "handler_panics",
    description = "Handler faults trapped at the task boundary"
)]
pub static HANDLER_PANICS: Counter = Counter::new();

#[metric(
    name = "idle_timeouts",
    description = "Connections closed by the idle timer"
)]
pub static IDLE_TIMEOUTS: Counter = Counter::new();

/// Render all registered metrics in Prometheus text format.
pub fn prometheus_output() -> String {
    let mut output = String::with_capacity(2048);

    for metric in metriken::metrics().iter() {
        let name = metric.name();
        if name.is_empty() {
            continue;
        }
        let Some(value) = metric.value() else {
            continue;
        };

        // Prometheus names allow [a-zA-Z0-9_] only.
        let prom_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();

        match value {
            metriken::Value::Counter(v) => {
                output.push_str(&format!("# TYPE {prom_name} counter\n"));
                output.push_str(&format!("{prom_name} {v}\n"));
            }
            metriken::Value::Gauge(v) => {
                output.push_str(&format!("# TYPE {prom_name} gauge\n"));
                output.push_str(&format!("{prom_name} {v}\n"));
            }
            _ => {}
        }
    }

    output
}
