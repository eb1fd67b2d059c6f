//! Client side of the van echo test.
//!
//! Opens a device, validates the counters the host sends, echoes them back and
//! prints the elapsed time once the sentinel arrives. Exits with status 1 on
//! any error, protocol violations included.
//!
//! # Usage
//!
//! ```sh
//! van-echo --device /python --sync --trace 1
//! ```

use std::time::Duration;

use thiserror::Error;
use van::config::parse_namespace;
use van::{
    ConfigError, EchoError, EchoLoop, EchoReport, OpenFlags, ReadMode, Session, VanConfig,
    VanError, init_tracing,
};

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Van(#[from] VanError),
    #[error(transparent)]
    Echo(#[from] EchoError),
}

struct Options {
    config: VanConfig,
    device: String,
    mode: ReadMode,
    echo: bool,
    trace: Option<u32>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("van-echo: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    init_tracing();
    let args: Vec<String> = std::env::args().collect();
    let Some(opts) = parse_args(&args)? else {
        print_usage();
        return Ok(());
    };

    let session = Session::new(opts.config);
    session.init()?;
    if let Some(level) = opts.trace {
        session.set_trace(level);
    }

    let registry = session.registry();
    let id = registry.open(&opts.device, OpenFlags::NONE)?;
    eprintln!("van-echo: {} open as {id}, waiting for the host", opts.device);

    let result = EchoLoop::new(session.transport(), id)
        .with_mode(opts.mode)
        .with_echo(opts.echo)
        .run();

    let closed = registry.close(id);
    session.exit();

    let report = finish(result, closed)?;
    println!(
        "elapsed: {:.6}s ({} echoed)",
        report.elapsed.as_secs_f64(),
        report.echoed
    );
    Ok(())
}

/// The run's own error wins; a failed close is reported after a clean run.
fn finish(
    result: Result<EchoReport, EchoError>,
    closed: Result<(), VanError>,
) -> Result<EchoReport, CliError> {
    let report = result?;
    closed?;
    Ok(report)
}

fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, CliError> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| CliError::Usage(format!("missing value for {flag}")))
}

fn number<T: std::str::FromStr>(raw: &str, flag: &str) -> Result<T, CliError> {
    raw.parse()
        .map_err(|_| CliError::Usage(format!("invalid value for {flag}: {raw}")))
}

/// Returns `None` when help was requested.
fn parse_args(args: &[String]) -> Result<Option<Options>, CliError> {
    let mut opts = Options {
        config: VanConfig::from_env()?,
        device: "/python".to_owned(),
        mode: ReadMode::Queued,
        echo: true,
        trace: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--device" | "-d" => opts.device = value(args, &mut i, "--device")?.to_owned(),
            "--namespace" | "-n" => {
                opts.config.namespace = parse_namespace(value(args, &mut i, "--namespace")?)?;
            }
            "--sync" | "-s" => opts.mode = ReadMode::SingleShot,
            "--no-echo" => opts.echo = false,
            "--trace" | "-t" => opts.trace = Some(number(value(args, &mut i, "--trace")?, "--trace")?),
            "--timeout-ms" => {
                let ms = number(value(args, &mut i, "--timeout-ms")?, "--timeout-ms")?;
                opts.config.read_timeout = Some(Duration::from_millis(ms));
            }
            "--help" | "-h" => return Ok(None),
            arg => return Err(CliError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }
    Ok(Some(opts))
}

fn print_usage() {
    eprintln!(
        r#"van-echo - van echo test client

USAGE:
    van-echo [OPTIONS]

OPTIONS:
    -d, --device <NAME>      Device to open (default: /python)
    -n, --namespace <NS>     Shared memory namespace (default: $VAN_NAMESPACE or van)
    -s, --sync               Receive with sync_read instead of read
        --no-echo            Validate only, do not write counters back
    -t, --trace <LEVEL>      Trace level: 0 off, 1 lifecycle, 2 transfers
        --timeout-ms <MS>    Give up on a read after MS milliseconds
    -h, --help               Print this help message

ENVIRONMENT:
    VAN_NAMESPACE, VAN_MAX_DEVICES, VAN_READ_TIMEOUT_MS, VAN_TRUNCATION, VAN_TRACE
    RUST_LOG                 Log filter (default: van=debug)
"#
    );
}
