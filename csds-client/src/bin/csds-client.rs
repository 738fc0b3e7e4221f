use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use csds_client::client::config::DEFAULT_URI;
use csds_client::{
    ApiVersion, AuthnMode, ClientConfig, CsdsClient, FilterMode, Platform, RequestSource,
    TlsFiles,
};
use tokio_util::sync::CancellationToken;

/// Query a Client Status Discovery Service for the config of its xDS
/// clients.
#[derive(Parser, Debug)]
#[command(name = "csds-client", version)]
struct Args {
    /// The URI of the CSDS service.
    #[arg(long = "service_uri", default_value = DEFAULT_URI)]
    service_uri: String,

    /// Overrides the `:authority` and TLS server name.
    #[arg(long = "authority", default_value = "")]
    authority: String,

    /// The platform of the target service: gcp or generic.
    #[arg(long = "platform", default_value = "gcp")]
    platform: Platform,

    /// How to authenticate: auto, jwt, tls or plaintext.
    #[arg(long = "authn_mode", default_value = "auto")]
    authn_mode: AuthnMode,

    /// The CSDS API version: v2 or v3.
    #[arg(long = "api_version", default_value = "v2")]
    api_version: ApiVersion,

    /// A YAML file containing the status request.
    #[arg(long = "request_file", default_value = "")]
    request_file: String,

    /// The status request as a YAML string.
    #[arg(long = "request_yaml", default_value = "")]
    request_yaml: String,

    /// A file containing a JWT sent as a bearer token.
    #[arg(long = "jwt_file", default_value = "")]
    jwt_file: String,

    /// Write JSON lines here instead of printing a table to stdout.
    #[arg(long = "output_file", default_value = "")]
    output_file: String,

    /// Repeat the request at this interval (e.g. 500ms, 5s, 1m). 0 sends a
    /// single request.
    #[arg(long = "monitor_interval", default_value = "0s", value_parser = parse_duration)]
    monitor_interval: Duration,

    /// Render the resource dependency graph as Graphviz DOT.
    #[arg(long = "visualization")]
    visualization: bool,

    /// How to filter nodes by id: prefix, suffix or regex.
    #[arg(long = "filter_mode", default_value = "")]
    filter_mode: FilterMode,

    /// The pattern used by filter_mode.
    #[arg(long = "filter_pattern", default_value = "")]
    filter_pattern: String,

    /// PEM client certificate.
    #[arg(long = "cert", default_value = "")]
    cert: String,

    /// PEM client private key.
    #[arg(long = "key", default_value = "")]
    key: String,

    /// PEM CA bundle.
    #[arg(long = "cacert", default_value = "")]
    cacert: String,

    /// Deadline for each request/response cycle.
    #[arg(long = "request_timeout", default_value = "10s", value_parser = parse_duration)]
    request_timeout: Duration,
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn non_empty_path(value: String) -> Option<PathBuf> {
    non_empty(value).map(PathBuf::from)
}

impl Args {
    fn into_config(self) -> csds_client::Result<ClientConfig> {
        let request_source =
            RequestSource::from_parts(non_empty_path(self.request_file), non_empty(self.request_yaml))?;

        let mut config = ClientConfig::new(self.service_uri)
            .with_platform(self.platform)
            .with_authn_mode(self.authn_mode)
            .with_api_version(self.api_version)
            .with_request_source(request_source)
            .with_monitor_interval(self.monitor_interval)
            .with_request_timeout(self.request_timeout)
            .with_filter(self.filter_mode, self.filter_pattern)
            .with_visualization(self.visualization);
        config.authority = non_empty(self.authority);
        config.jwt_file = non_empty_path(self.jwt_file);
        config.output_file = non_empty_path(self.output_file);
        config.tls = TlsFiles {
            cert: non_empty_path(self.cert),
            key: non_empty_path(self.key),
            ca_cert: non_empty_path(self.cacert),
        };
        Ok(config)
    }
}

/// Parse durations such as `500ms`, `2s`, `1m` or `1h`. A bare number is
/// taken as seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (value, unit) = s.split_at(split);
    let value: f64 = value
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    let seconds = match unit {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(format!("invalid duration unit {unit:?} in {s:?}")),
    };
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration {s:?}: {e}"))
}

fn trace_init() {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(sub);
}

async fn run(args: Args) -> csds_client::Result<()> {
    let client = CsdsClient::new(args.into_config()?)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, shutting down");
                cancel.cancel();
            }
        }
    });

    client.run(cancel).await
}

#[tokio::main]
async fn main() -> ExitCode {
    trace_init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("csds-client: {error}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("2s"), Ok(Duration::from_secs(2)));
        assert_eq!(parse_duration("1m"), Ok(Duration::from_secs(60)));
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
        assert_eq!(parse_duration("1.5s"), Ok(Duration::from_millis(1500)));
        assert!(parse_duration("5 days").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Args::parse_from(["csds-client"]).into_config().unwrap();
        assert_eq!(config.uri, DEFAULT_URI);
        assert_eq!(config.api_version, ApiVersion::V2);
        assert_eq!(config.platform, Platform::Gcp);
        assert_eq!(config.request_source, RequestSource::Synthesized);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert!(!config.is_monitor());
        assert!(config.authority.is_none());
        assert!(config.tls.is_empty());
    }

    #[test]
    fn test_flags() {
        let config = Args::parse_from([
            "csds-client",
            "--service_uri=http://localhost:18000",
            "--api_version=v3",
            "--monitor_interval=500ms",
            "--filter_mode=regex",
            "--filter_pattern=^prod-",
            "--visualization",
            "--jwt_file=/tmp/token",
        ])
        .into_config()
        .unwrap();
        assert_eq!(config.api_version, ApiVersion::V3);
        assert_eq!(config.monitor_interval, Duration::from_millis(500));
        assert_eq!(config.filter.mode, FilterMode::Regex);
        assert!(config.visualization);
        assert_eq!(config.jwt_file, Some(PathBuf::from("/tmp/token")));
    }

    #[test]
    fn test_conflicting_request_sources() {
        let err = Args::parse_from([
            "csds-client",
            "--request_file=req.json",
            "--request_yaml={}",
        ])
        .into_config()
        .unwrap_err();
        assert!(matches!(err, csds_client::Error::Config(_)));
    }

    #[test]
    fn test_invalid_enum_flag_is_rejected() {
        assert!(Args::try_parse_from(["csds-client", "--api_version=v4"]).is_err());
    }
}
