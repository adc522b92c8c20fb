//! registry-ops - operator tooling for the Plus Code domain registry
//!
//! Submits one registry write, follows it to a terminal outcome with a live
//! countdown, and reports gas and the state it changed.

use clap::{Args, Parser, Subcommand};
use ethers::types::{Address, U256};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

mod chain;
mod config;
mod error;
mod lifecycle;
mod metrics;
mod ops;
mod registry;
mod report;
mod tx;

use chain::RegistryProvider;
use config::{LoggingConfig, Settings};
use error::{OpsError, OpsResult};
use lifecycle::{OutcomeStatus, ProgressSink, TerminalCountdown, TracingProgress};
use ops::Operator;
use registry::{Operation, Record};
use report::Report;

#[derive(Parser)]
#[command(
    author,
    version,
    propagate_version = true,
    about = "Drive writes against the domain registry and report their outcome",
    long_about = None,
    after_help = "Exit codes:\n  0  - transaction confirmed and succeeded\n  2  - transaction reverted\n  3  - no confirmation within the timeout\n  65 - invalid arguments, gas limit or precondition\n  69 - rejected before reaching the network\n  70 - inconsistent outcome\n  78 - configuration or wallet error"
)]
struct Cli {
    /// Path to the configuration file; defaults to $REGISTRY_OPS_CONFIG or config/default.toml
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Override the confirmation timeout in seconds
    #[arg(long, value_name = "SECS", global = true)]
    timeout: Option<u64>,

    /// Gas limit override
    #[arg(long, value_name = "GAS", global = true)]
    gas_limit: Option<u64>,

    /// Print the report as JSON
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mint a new domain
    Mint(MintArgs),
    /// Mint a new domain with initial records
    MintWithRecords(MintWithRecordsArgs),
    /// Burn an existing domain
    Burn(PlusCodeArgs),
    /// Set one record on a domain
    SetRecord(SetRecordArgs),
    /// Set several records on a domain
    SetMany(RecordsArgs),
    /// Rent a domain to a user until an expiry
    SetUser(SetUserArgs),
    /// Change the token metadata base URI
    SetBaseUri(SetBaseUriArgs),
    /// Withdraw native currency from the registry
    Withdraw(WithdrawArgs),
    /// Withdraw an ERC-20 token from the registry
    WithdrawToken(WithdrawTokenArgs),
    /// Run the operations listed in a TOML batch file concurrently
    Batch(BatchArgs),
}

#[derive(Args, Clone)]
struct PlusCodeArgs {
    /// Plus Code of the domain, e.g. 8FVC9G8F+6X
    #[arg(long, value_name = "CODE")]
    plus_code: String,
}

#[derive(Args, Clone)]
struct MintArgs {
    #[command(flatten)]
    domain: PlusCodeArgs,

    /// Payment in wei; defaults to the current mint price
    #[arg(long, value_name = "WEI", value_parser = parse_u256)]
    payment: Option<U256>,
}

#[derive(Args, Clone)]
struct RecordsArgs {
    #[command(flatten)]
    domain: PlusCodeArgs,

    /// Comma separated record keys
    #[arg(long, value_delimiter = ',', required = true)]
    keys: Vec<String>,

    /// Comma separated record values, one per key
    #[arg(long, value_delimiter = ',', required = true)]
    values: Vec<String>,
}

#[derive(Args, Clone)]
struct MintWithRecordsArgs {
    #[command(flatten)]
    records: RecordsArgs,

    /// Payment in wei; defaults to the current mint price
    #[arg(long, value_name = "WEI", value_parser = parse_u256)]
    payment: Option<U256>,
}

#[derive(Args, Clone)]
struct SetRecordArgs {
    #[command(flatten)]
    domain: PlusCodeArgs,

    #[arg(long)]
    key: String,

    #[arg(long)]
    value: String,
}

#[derive(Args, Clone)]
struct SetUserArgs {
    #[command(flatten)]
    domain: PlusCodeArgs,

    /// Address of the renting user
    #[arg(long, value_parser = parse_address)]
    user: Address,

    /// Rental expiry as UNIX seconds
    #[arg(long, value_name = "UNIX")]
    expires: u64,
}

#[derive(Args, Clone)]
struct SetBaseUriArgs {
    #[arg(long)]
    uri: String,
}

#[derive(Args, Clone)]
struct WithdrawArgs {
    /// Payee; defaults to the registry owner
    #[arg(long, value_parser = parse_address)]
    to: Option<Address>,

    /// Amount in wei; defaults to the whole balance
    #[arg(long, value_name = "WEI", value_parser = parse_u256)]
    amount: Option<U256>,
}

#[derive(Args, Clone)]
struct WithdrawTokenArgs {
    /// ERC-20 token contract
    #[arg(long, value_parser = parse_address)]
    token: Address,

    #[command(flatten)]
    withdraw: WithdrawArgs,
}

#[derive(Args, Clone)]
struct BatchArgs {
    /// Batch file with one [[operation]] table per write
    #[arg(long, value_name = "PATH")]
    file: PathBuf,
}

impl Command {
    /// Operations to run with their gas limit overrides
    fn into_operations(self, gas_limit: Option<u64>) -> OpsResult<Vec<(Operation, Option<u64>)>> {
        match self {
            Command::Batch(args) => ops::batch::load(&args.file),
            command => Ok(vec![(command.into_operation()?, gas_limit)]),
        }
    }

    fn into_operation(self) -> OpsResult<Operation> {
        let operation = match self {
            Command::Mint(args) => Operation::Mint {
                plus_code: args.domain.plus_code,
                payment: args.payment,
            },
            Command::MintWithRecords(args) => Operation::MintWithRecords {
                plus_code: args.records.domain.plus_code,
                records: Record::zip(args.records.keys, args.records.values, "mint-with-records")?,
                payment: args.payment,
            },
            Command::Burn(args) => Operation::Burn {
                plus_code: args.plus_code,
            },
            Command::SetRecord(args) => Operation::SetRecord {
                plus_code: args.domain.plus_code,
                record: Record::new(args.key, args.value),
            },
            Command::SetMany(args) => Operation::SetMany {
                plus_code: args.domain.plus_code,
                records: Record::zip(args.keys, args.values, "set-many")?,
            },
            Command::SetUser(args) => Operation::SetUser {
                plus_code: args.domain.plus_code,
                user: args.user,
                expires: args.expires,
            },
            Command::SetBaseUri(args) => Operation::SetBaseUri { uri: args.uri },
            Command::Withdraw(args) => Operation::Withdraw {
                to: args.to,
                amount: args.amount,
            },
            Command::WithdrawToken(args) => Operation::WithdrawToken {
                token: args.token,
                to: args.withdraw.to,
                amount: args.withdraw.amount,
            },
            Command::Batch(_) => {
                return Err(OpsError::InvalidArguments {
                    operation: "batch",
                    reason: "a batch holds several operations".to_string(),
                })
            }
        };

        Ok(operation)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::from(78);
        }
    };

    init_logging(&settings.logging);
    info!("Starting registry-ops v{}", env!("CARGO_PKG_VERSION"));

    let code = match run(cli, &settings).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            if e.is_pre_submission() {
                info!("Nothing was sent to the network");
            }
            ExitCode::from(e.exit_code() as u8)
        }
    };

    if let Some(path) = &settings.metrics.textfile_path {
        if let Err(e) = metrics::write_textfile(path) {
            warn!("{}", e);
        }
    }

    code
}

async fn run(cli: Cli, settings: &Settings) -> OpsResult<ExitCode> {
    let batch = matches!(cli.command, Command::Batch(_));
    let operations = cli.command.into_operations(cli.gas_limit)?;
    for (operation, _) in &operations {
        operation.validate()?;
    }

    let provider = Arc::new(RegistryProvider::connect(&settings.network, &settings.registry).await?);
    info!(
        "Connected to {} (chain {}) as {:?}",
        settings.network.name,
        settings.network.chain_id,
        provider.sender()
    );

    // One countdown line cannot follow several lifecycles
    let sink: Arc<dyn ProgressSink> = if std::io::stderr().is_terminal() && !cli.json && !batch {
        Arc::new(TerminalCountdown::default())
    } else {
        Arc::new(TracingProgress)
    };

    let operator = Operator::new(provider.clone(), provider, &settings.lifecycle, sink)?;
    let code = match operations.as_slice() {
        [(operation, gas_limit)] if !batch => {
            let report = operator.execute(operation, *gas_limit).await?;
            print_reports(std::slice::from_ref(&report), cli.json)?;
            report.ensure_consistent()?;
            status_code(report.status)
        }
        operations => {
            let mut reports = Vec::with_capacity(operations.len());
            let mut code = 0;
            for result in operator.execute_batch(operations).await {
                let entry_code = match result {
                    Ok(report) => {
                        let entry_code = report_code(&report);
                        reports.push(report);
                        entry_code
                    }
                    Err(e) => {
                        error!("{}", e);
                        e.exit_code() as u8
                    }
                };
                // first failure in file order decides
                if code == 0 {
                    code = entry_code;
                }
            }
            print_reports(&reports, cli.json)?;
            code
        }
    };

    let counters = operator.coordinator().counters();
    debug!(
        "Signals honoured: {}, discarded late: {}",
        counters.honoured(),
        counters.discarded()
    );

    Ok(ExitCode::from(code))
}

fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };

    if let Some(timeout) = cli.timeout {
        if timeout == 0 {
            anyhow::bail!("--timeout must be greater than zero");
        }
        settings.lifecycle.timeout_secs = timeout;
        settings.network.watch_timeout_secs = settings.network.watch_timeout_secs.max(timeout);
    }

    Ok(settings)
}

fn print_reports(reports: &[Report], json: bool) -> OpsResult<()> {
    match (json, reports) {
        (true, [report]) => println!("{}", report.to_json()?),
        (true, reports) => println!(
            "{}",
            serde_json::to_string_pretty(reports)
                .map_err(|e| OpsError::Internal(format!("Failed to serialize reports: {}", e)))?
        ),
        (false, reports) => {
            let text: Vec<String> = reports.iter().map(Report::render_text).collect();
            print!("{}", text.join("\n"));
        }
    }
    Ok(())
}

/// Exit code for one report; `Unknown` goes through the consistency check
fn report_code(report: &Report) -> u8 {
    match report.ensure_consistent() {
        Ok(()) => status_code(report.status),
        Err(e) => {
            error!("{}", e);
            e.exit_code() as u8
        }
    }
}

fn status_code(status: OutcomeStatus) -> u8 {
    match status {
        OutcomeStatus::Success => 0,
        OutcomeStatus::Reverted => 2,
        OutcomeStatus::TimedOut => 3,
        OutcomeStatus::RejectedBeforeSend => 69,
        OutcomeStatus::Unknown => 70,
    }
}

fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,registry_ops=debug,ethers_providers=warn"));

    // stdout carries the report only
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

fn parse_u256(value: &str) -> Result<U256, String> {
    U256::from_dec_str(value).map_err(|e| format!("invalid amount {:?}: {}", value, e))
}

fn parse_address(value: &str) -> Result<Address, String> {
    value
        .parse::<Address>()
        .map_err(|e| format!("invalid address {:?}: {}", value, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OpsError;

    #[test]
    fn test_parse_set_many() {
        let cli = Cli::try_parse_from([
            "registry-ops",
            "--gas-limit",
            "500000",
            "set-many",
            "--plus-code",
            "8FVC9G8F+6X",
            "--keys",
            "website,email",
            "--values",
            "https://example.com,ops@example.com",
        ])
        .unwrap();

        assert_eq!(cli.gas_limit, Some(500_000));
        let operation = cli.command.into_operation().unwrap();
        assert_eq!(
            operation,
            Operation::SetMany {
                plus_code: "8FVC9G8F+6X".to_string(),
                records: vec![
                    Record::new("website", "https://example.com"),
                    Record::new("email", "ops@example.com"),
                ],
            }
        );
    }

    #[test]
    fn test_mismatched_records_rejected() {
        let cli = Cli::try_parse_from([
            "registry-ops",
            "mint-with-records",
            "--plus-code",
            "8FVC9G8F+6X",
            "--keys",
            "a,b",
            "--values",
            "1",
        ])
        .unwrap();

        let err = cli.command.into_operation().unwrap_err();
        assert!(matches!(err, OpsError::InvalidArguments { .. }));
    }

    #[test]
    fn test_parse_withdraw_token() {
        let cli = Cli::try_parse_from([
            "registry-ops",
            "withdraw-token",
            "--token",
            "0x1111111111111111111111111111111111111111",
            "--amount",
            "1000",
            "--json",
        ])
        .unwrap();

        assert!(cli.json);
        assert_eq!(
            cli.command.into_operation().unwrap(),
            Operation::WithdrawToken {
                token: Address::repeat_byte(0x11),
                to: None,
                amount: Some(U256::from(1_000)),
            }
        );
    }

    #[test]
    fn test_invalid_address_rejected_by_parser() {
        let result = Cli::try_parse_from([
            "registry-ops",
            "set-user",
            "--plus-code",
            "8FVC9G8F+6X",
            "--user",
            "not-an-address",
            "--expires",
            "1700000000",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_batch() {
        let cli = Cli::try_parse_from([
            "registry-ops",
            "--timeout",
            "300",
            "batch",
            "--file",
            "writes.toml",
        ])
        .unwrap();

        assert_eq!(cli.timeout, Some(300));
        assert!(matches!(&cli.command, Command::Batch(args) if args.file == PathBuf::from("writes.toml")));
        let err = cli.command.into_operations(None).unwrap_err();
        assert!(matches!(err, OpsError::InvalidArguments { operation: "batch", .. }));
    }

    #[test]
    fn test_single_command_is_one_operation() {
        let cli = Cli::try_parse_from([
            "registry-ops",
            "--gas-limit",
            "300000",
            "burn",
            "--plus-code",
            "8FVC9G8F+6X",
        ])
        .unwrap();

        let operations = cli.command.into_operations(cli.gas_limit).unwrap();
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].1, Some(300_000));
        assert_eq!(operations[0].0.name(), "burn");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status_code(OutcomeStatus::Success), 0);
        assert_eq!(status_code(OutcomeStatus::TimedOut), 3);
        assert_eq!(
            status_code(OutcomeStatus::Unknown) as i32,
            OpsError::InconsistentOutcome {
                operation: "burn",
                diagnostic: String::new(),
            }
            .exit_code()
        );
    }
}
