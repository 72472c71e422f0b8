//! VTK payment terminal driver.
//!
//! Lets a point-of-sale application charge an amount through a VTK terminal
//! attached over TCP and learn whether the charge was approved, declined,
//! unreachable or unanswered. [`CardReader::request_money`] is the entry
//! point; everything below it (transport, codec, session) is exposed so
//! integrators can substitute their own pieces in tests.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod config;
pub mod error;
pub mod vtk;

pub use config::DriverConfig;
pub use error::{DriverError, TransportError, ValidationError};
pub use vtk::protocol::{ChargeReceipt, Currency, MoneyRequest, Product, ResponseOutcome};
pub use vtk::CardReader;

/// Initialize structured logging (console, plus a daily rolling file when
/// `log_dir` is given).
///
/// Keep the returned guard alive for the lifetime of the process; dropping
/// it flushes the file writer.
pub fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vtk_driver=debug"));
    let console_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).ok();
            let file_appender = tracing_appender::rolling::daily(dir, "vtk");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .try_init()
                .ok();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init()
                .ok();
            None
        }
    }
}
