//! `vtk-charge` - charge an amount through a VTK terminal from the shell.
//!
//! Prints the charge receipt as JSON on success. The exit code tells the
//! operator what to do next: 1 declined, 2 terminal error, 3 terminal
//! unreachable, 4 no answer in time, 5 garbled answer, 254 bad parameters.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::{error, info};

use vtk_driver::{init_logging, CardReader, Currency, DriverConfig, DriverError, Product};

const WRONG_PARAMETERS: u8 = 254;

#[derive(Debug, Parser)]
#[command(
    name = "vtk-charge",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("VTK_BUILD_GIT_SHA"), ")"),
    about = "Request a payment from a VTK terminal"
)]
struct Cli {
    /// Terminal host (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Terminal TCP port (overrides the config file)
    #[arg(long)]
    port: Option<String>,

    /// JSON driver configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Amount in minor currency units, e.g. a1050
    #[arg(long, value_parser = parse_amount)]
    amount: Option<u64>,

    /// ISO 4217 numeric currency code, e.g. c643
    #[arg(long, value_parser = parse_currency)]
    currency: Option<u16>,

    /// Seconds to wait for the terminal (defaults to the config's timeoutMs)
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Product name shown on the terminal
    #[arg(long = "prodname")]
    product_name: Option<String>,

    /// Product id sent with the product name
    #[arg(long = "prodid", requires = "product_name")]
    product_id: Option<u64>,

    /// Only check that the terminal answers
    #[arg(long, conflicts_with_all = ["amount", "currency", "product_name"])]
    ping: bool,

    /// Write daily rolling log files here
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

/// Parse `<letter><digits>`, the argument form the terminal tooling uses.
fn parse_prefixed(arg: &str, letter: char) -> Result<u64, String> {
    let digits = arg
        .strip_prefix(letter)
        .ok_or_else(|| format!("must look like {letter}123"))?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("must look like {letter}123"));
    }
    digits.parse().map_err(|e| format!("{e}"))
}

fn parse_amount(arg: &str) -> Result<u64, String> {
    parse_prefixed(arg, 'a')
}

fn parse_currency(arg: &str) -> Result<u16, String> {
    let code = parse_prefixed(arg, 'c')?;
    u16::try_from(code).map_err(|_| format!("currency code {code} out of range"))
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => DriverConfig::load(path)?,
        None => DriverConfig::default(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate()?;
    let timeout = cli
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.timeout());

    let reader = CardReader::from_config(&config)
        .with_context(|| format!("connecting to {}:{}", config.host, config.port))?;
    info!("Using {}", reader.description());

    if cli.ping {
        reader.ping(timeout)?;
        println!("{}", serde_json::json!({ "ping": "ok" }));
        return Ok(());
    }

    let amount = cli
        .amount
        .ok_or_else(|| anyhow!("--amount is required unless --ping is given"))?;
    let code = cli
        .currency
        .ok_or_else(|| anyhow!("--currency is required unless --ping is given"))?;
    let currency = Currency::from_numeric(code)?;
    let (main_amount, decimal_amount) = currency.split_minor(amount);
    let product = cli.product_name.map(|name| Product {
        id: cli.product_id.unwrap_or(0),
        name,
    });

    let receipt =
        reader.request_money_for(code, main_amount, decimal_amount, product, timeout)?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<DriverError>()
        .map(|e| e.exit_code() as u8)
        .unwrap_or(WRONG_PARAMETERS)
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return ExitCode::from(WRONG_PARAMETERS);
        }
        Err(e) => e.exit(),
    };
    let _guard = init_logging(cli.log_dir.as_deref());

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prefixed_arguments() {
        assert_eq!(parse_amount("a1050"), Ok(1050));
        assert_eq!(parse_currency("c643"), Ok(643));
        assert!(parse_amount("1050").is_err());
        assert!(parse_amount("a").is_err());
        assert!(parse_amount("a10x").is_err());
        assert!(parse_currency("a643").is_err());
        assert!(parse_currency("c70000").is_err());
    }

    #[test]
    fn test_exit_code_mapping() {
        let declined = anyhow::Error::new(DriverError::Declined {
            reason: "insufficient funds".into(),
        });
        assert_eq!(exit_code(&declined), 1);
        let timed_out = anyhow::Error::new(DriverError::TimedOut).context("charging");
        assert_eq!(exit_code(&timed_out), 4);
        assert_eq!(exit_code(&anyhow!("bad flag")), WRONG_PARAMETERS);
    }

    #[test]
    fn test_cli_rejects_ping_with_amount() {
        assert!(Cli::try_parse_from(["vtk-charge", "--ping", "--amount", "a100"]).is_err());
        let cli = Cli::try_parse_from(["vtk-charge", "--amount", "a100", "--currency", "c978"])
            .unwrap();
        assert_eq!(cli.amount, Some(100));
        assert_eq!(cli.currency, Some(978));
        assert_eq!(cli.product_name, None);
    }

    #[test]
    fn test_cli_product_options() {
        let cli = Cli::try_parse_from([
            "vtk-charge",
            "--amount",
            "a100",
            "--currency",
            "c643",
            "--prodname",
            "Latte",
            "--prodid",
            "7",
        ])
        .unwrap();
        assert_eq!(cli.product_name.as_deref(), Some("Latte"));
        assert_eq!(cli.product_id, Some(7));

        // An id alone names nothing to show
        assert!(Cli::try_parse_from(["vtk-charge", "--amount", "a1", "--prodid", "7"]).is_err());
        assert!(Cli::try_parse_from(["vtk-charge", "--ping", "--prodname", "Latte"]).is_err());
    }
}
