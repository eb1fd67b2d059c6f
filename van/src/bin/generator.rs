//! Host side of the van echo test.
//!
//! Waits for a client to open the device, sends `cycles` counters followed by
//! the sentinel and checks every echo.
//!
//! # Usage
//!
//! ```sh
//! van-gen --device /python --cycles 10000 --sync
//! ```

use std::time::Duration;

use thiserror::Error;
use van::config::parse_namespace;
use van::generator::run as run_generator;
use van::{ConfigError, GeneratorConfig, GeneratorError, VanConfig, init_tracing};

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Generator(#[from] GeneratorError),
}

fn main() {
    if let Err(e) = run() {
        eprintln!("van-gen: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    init_tracing();
    let args: Vec<String> = std::env::args().collect();
    let Some((session_config, config)) = parse_args(&args)? else {
        print_usage();
        return Ok(());
    };

    eprintln!(
        "van-gen: {} cycles on {} in namespace {}",
        config.cycles, config.device, session_config.namespace
    );
    let report = run_generator(&session_config, &config)?;
    println!(
        "sent {} echoed {} in {:.6}s",
        report.sent,
        report.echoed,
        report.elapsed.as_secs_f64()
    );
    Ok(())
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

fn parse_args(args: &[String]) -> Result<Option<(VanConfig, GeneratorConfig)>, CliError> {
    let mut session_config = VanConfig::from_env()?;
    let mut config = GeneratorConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--device" | "-d" => config.device = value(args, &mut i, "--device")?.to_owned(),
            "--namespace" | "-n" => {
                session_config.namespace = parse_namespace(value(args, &mut i, "--namespace")?)?;
            }
            "--cycles" | "-c" => config.cycles = number(value(args, &mut i, "--cycles")?, "--cycles")?,
            "--sync" | "-s" => config.sync = true,
            "--no-verify" => config.verify_echo = false,
            "--timeout-ms" => {
                let ms = number(value(args, &mut i, "--timeout-ms")?, "--timeout-ms")?;
                config.timeout = Duration::from_millis(ms);
            }
            "--help" | "-h" => return Ok(None),
            arg => return Err(CliError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }
    Ok(Some((session_config, config)))
}

fn print_usage() {
    eprintln!(
        r#"van-gen - van echo test host

USAGE:
    van-gen [OPTIONS]

OPTIONS:
    -d, --device <NAME>      Device to attach to (default: /python)
    -n, --namespace <NS>     Shared memory namespace (default: $VAN_NAMESPACE or van)
    -c, --cycles <N>         Counters sent before the sentinel (default: 1000)
    -s, --sync               NUL-terminate messages and wait for each sync_read
        --no-verify          Do not compare echoes with what was sent
        --timeout-ms <MS>    Bound for attaching and every wait (default: 5000)
    -h, --help               Print this help message

EXAMPLE:
    van-gen --cycles 100000 &
    van-echo
"#
    );
}
