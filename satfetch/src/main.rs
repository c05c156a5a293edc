use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use satfetch_common::{Band, FetchError, ImagerySource, LogicalKey, ProductType, Satellite};
use satfetch_sources::{from_config, FetchConfig};

const USAGE: &str = "\
usage:
  satfetch <config.toml> exists <satellite> <product> <band> <timestamp>
  satfetch <config.toml> download <satellite> <product> <band> <timestamp> <destination>
  satfetch <config.toml> url <satellite> <timestamp>

timestamps are RFC 3339, e.g. 2023-06-15T12:01:00Z";

#[derive(Debug, PartialEq)]
enum Command {
    Exists(LogicalKey),
    Download(LogicalKey, PathBuf),
    Url(Satellite, DateTime<Utc>),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(
            "info".parse().expect("static directive parses"),
        ))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &[String]) -> anyhow::Result<()> {
    let (config_path, command) = parse_args(args)?;
    let config = FetchConfig::load(&config_path)?;

    let token = CancellationToken::new();
    let orchestrator = from_config(&config, token.clone())?;
    info!(
        sources = ?orchestrator.sources().iter().map(|s| s.name()).collect::<Vec<_>>(),
        "satfetch ready"
    );

    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            ctrl_c_token.cancel();
        }
    });

    let outcome = match command {
        Command::Exists(key) => orchestrator.exists(&key).await.map(|found| {
            println!("{}", found);
        }),
        Command::Download(key, destination) => orchestrator
            .download(&key, &destination)
            .await
            .map(|path| println!("{}", path.display())),
        Command::Url(satellite, timestamp) => {
            println!("{}", orchestrator.source_url(timestamp, satellite));
            Ok(())
        }
    };

    orchestrator.close().await;
    outcome.map_err(anyhow::Error::from)
}

fn parse_args(args: &[String]) -> anyhow::Result<(PathBuf, Command)> {
    let (config, rest) = match args {
        [config, rest @ ..] => (PathBuf::from(config), rest),
        [] => bail!("missing config path\n{}", USAGE),
    };
    let rest: Vec<&str> = rest.iter().map(String::as_str).collect();
    let command = match rest.as_slice() {
        ["exists", sat, product, band, ts] => Command::Exists(parse_key(sat, product, band, ts)?),
        ["download", sat, product, band, ts, dest] => {
            Command::Download(parse_key(sat, product, band, ts)?, PathBuf::from(dest))
        }
        ["url", sat, ts] => Command::Url(sat.parse()?, parse_timestamp(ts)?),
        _ => bail!("unrecognised arguments\n{}", USAGE),
    };
    Ok((config, command))
}

fn parse_key(sat: &str, product: &str, band: &str, ts: &str) -> anyhow::Result<LogicalKey> {
    let satellite: Satellite = sat.parse()?;
    let product: ProductType = product.parse()?;
    let band: Band = band.parse()?;
    Ok(LogicalKey::new(parse_timestamp(ts)?, satellite, product, band))
}

fn parse_timestamp(ts: &str) -> anyhow::Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(ts)
        .with_context(|| format!("invalid timestamp '{}', expected RFC 3339", ts))?;
    Ok(parsed.with_timezone(&Utc))
}

fn report(e: &anyhow::Error) {
    match e.downcast_ref::<FetchError>() {
        Some(FetchError::Cancelled) => error!("Cancelled"),
        Some(FetchError::Domain(domain)) => {
            error!(kind = %domain.kind(), "{}", domain.message());
            for tip in domain.remediation_tips() {
                eprintln!("  hint: {}", tip);
            }
            debug!("technical details:\n{}", domain.technical_details());
        }
        None => error!("{:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_download() {
        let (config, command) = parse_args(&args(&[
            "satfetch.toml",
            "download",
            "goes16",
            "RadC",
            "C13",
            "2023-06-15T12:01:00Z",
            "out/image.nc",
        ]))
        .unwrap();
        assert_eq!(config, PathBuf::from("satfetch.toml"));
        let key = LogicalKey::new(
            Utc.with_ymd_and_hms(2023, 6, 15, 12, 1, 0).unwrap(),
            Satellite::Goes16,
            ProductType::RadC,
            Band::new(13).unwrap(),
        );
        assert_eq!(command, Command::Download(key, PathBuf::from("out/image.nc")));
    }

    #[test]
    fn test_parse_url_with_offset() {
        let (_, command) = parse_args(&args(&[
            "satfetch.toml",
            "url",
            "G18",
            "2023-06-15T14:01:00+02:00",
        ]))
        .unwrap();
        assert_eq!(
            command,
            Command::Url(
                Satellite::Goes18,
                Utc.with_ymd_and_hms(2023, 6, 15, 12, 1, 0).unwrap()
            )
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_args(&[]).is_err());
        assert!(parse_args(&args(&["satfetch.toml", "exists"])).is_err());
        assert!(parse_args(&args(&[
            "satfetch.toml",
            "exists",
            "goes16",
            "RadC",
            "17",
            "2023-06-15T12:01:00Z"
        ]))
        .is_err());
        assert!(parse_args(&args(&[
            "satfetch.toml",
            "exists",
            "goes16",
            "RadC",
            "13",
            "yesterday"
        ]))
        .is_err());
    }
}
