//! Configuration for the CSDS client.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::client::retry::RetryPolicy;
use crate::error::{Error, Result};
use crate::filter::{FilterMode, NodeFilter};

/// Default CSDS endpoint.
pub const DEFAULT_URI: &str = "trafficdirector.googleapis.com:443";

/// Default deadline for one request/response cycle.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The platform the target service runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    /// Google Cloud. Has a default secure transport.
    #[default]
    Gcp,
    /// No platform specific behavior. Defaults to plaintext.
    Generic,
}

impl Platform {
    /// Whether the platform provides a default secure transport.
    pub fn has_default_security(&self) -> bool {
        matches!(self, Platform::Gcp)
    }

    /// Name used in synthesized identities.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Gcp => "gcp",
            Platform::Generic => "generic",
        }
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gcp" => Ok(Platform::Gcp),
            "generic" | "none" => Ok(Platform::Generic),
            other => Err(Error::Config(format!(
                "unsupported platform {other:?}, expected one of: gcp, generic"
            ))),
        }
    }
}

/// How the client authenticates to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthnMode {
    /// Pick from the credential material that is configured.
    #[default]
    Auto,
    /// Platform default transport security plus a JWT bearer token.
    Jwt,
    /// TLS with explicit certificate material.
    Tls,
    /// No transport security.
    Plaintext,
}

impl FromStr for AuthnMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(AuthnMode::Auto),
            "jwt" => Ok(AuthnMode::Jwt),
            "tls" => Ok(AuthnMode::Tls),
            "plaintext" => Ok(AuthnMode::Plaintext),
            other => Err(Error::Config(format!(
                "unsupported authn_mode {other:?}, expected one of: auto, jwt, tls, plaintext"
            ))),
        }
    }
}

/// CSDS API major version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiVersion {
    /// `envoy.service.status.v2`
    #[default]
    V2,
    /// `envoy.service.status.v3`
    V3,
}

impl FromStr for ApiVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "v2" => Ok(ApiVersion::V2),
            "v3" => Ok(ApiVersion::V3),
            other => Err(Error::Config(format!(
                "unsupported xDS API version {other:?}, expected one of: v2, v3"
            ))),
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiVersion::V2 => f.write_str("v2"),
            ApiVersion::V3 => f.write_str("v3"),
        }
    }
}

/// Where the status request comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RequestSource {
    /// A YAML or JSON template file.
    File(PathBuf),
    /// Literal YAML or JSON text.
    Literal(String),
    /// Synthesize a self-status request from the local identity.
    #[default]
    Synthesized,
}

impl RequestSource {
    /// Build the source from the two optional inputs, rejecting both at once.
    pub fn from_parts(file: Option<PathBuf>, literal: Option<String>) -> Result<Self> {
        match (file, literal) {
            (Some(_), Some(_)) => Err(Error::Config(
                "request_file and request_yaml are mutually exclusive".into(),
            )),
            (Some(path), None) => Ok(RequestSource::File(path)),
            (None, Some(text)) => Ok(RequestSource::Literal(text)),
            (None, None) => Ok(RequestSource::Synthesized),
        }
    }
}

/// Paths of TLS material.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsFiles {
    /// PEM client certificate.
    pub cert: Option<PathBuf>,
    /// PEM client private key.
    pub key: Option<PathBuf>,
    /// PEM CA bundle used to verify the server.
    pub ca_cert: Option<PathBuf>,
}

impl TlsFiles {
    /// Returns true if no TLS material is configured.
    pub fn is_empty(&self) -> bool {
        self.cert.is_none() && self.key.is_none() && self.ca_cert.is_none()
    }
}

/// Node filter settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterConfig {
    /// How `pattern` is applied.
    pub mode: FilterMode,
    /// The pattern.
    pub pattern: String,
}

/// Configuration for the CSDS client.
///
/// Built once at startup and passed to every component; never mutated
/// afterwards.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// URI of the CSDS service.
    pub uri: String,
    /// `:authority` override, also used as the TLS server name.
    pub authority: Option<String>,
    /// Target platform.
    pub platform: Platform,
    /// Authentication mode.
    pub authn_mode: AuthnMode,
    /// CSDS API major version.
    pub api_version: ApiVersion,
    /// Where the request comes from.
    pub request_source: RequestSource,
    /// Path of a JWT sent as a bearer token on every call.
    pub jwt_file: Option<PathBuf>,
    /// TLS material.
    pub tls: TlsFiles,
    /// Interval between requests in monitor mode. Zero means single-shot.
    pub monitor_interval: Duration,
    /// Deadline for one request/response cycle.
    pub request_timeout: Duration,
    /// Node filter.
    pub filter: FilterConfig,
    /// Whether to build and render the dependency graph.
    pub visualization: bool,
    /// Output file. `None` writes to stdout.
    pub output_file: Option<PathBuf>,
    /// Retry policy for connection attempts.
    pub retry_policy: RetryPolicy,
}

impl ClientConfig {
    /// Create a configuration for the given service URI with defaults for
    /// everything else.
    ///
    /// # Example
    ///
    /// ```
    /// use csds_client::{ApiVersion, ClientConfig};
    /// use std::time::Duration;
    ///
    /// let config = ClientConfig::new("http://localhost:18000")
    ///     .with_api_version(ApiVersion::V3)
    ///     .with_monitor_interval(Duration::from_secs(2));
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            authority: None,
            platform: Platform::default(),
            authn_mode: AuthnMode::default(),
            api_version: ApiVersion::default(),
            request_source: RequestSource::default(),
            jwt_file: None,
            tls: TlsFiles::default(),
            monitor_interval: Duration::ZERO,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            filter: FilterConfig::default(),
            visualization: false,
            output_file: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Set the API version.
    pub fn with_api_version(mut self, api_version: ApiVersion) -> Self {
        self.api_version = api_version;
        self
    }

    /// Set the platform.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Set the authentication mode.
    pub fn with_authn_mode(mut self, authn_mode: AuthnMode) -> Self {
        self.authn_mode = authn_mode;
        self
    }

    /// Set the request source.
    pub fn with_request_source(mut self, request_source: RequestSource) -> Self {
        self.request_source = request_source;
        self
    }

    /// Set the monitor interval.
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Set the per-cycle deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the node filter.
    pub fn with_filter(mut self, mode: FilterMode, pattern: impl Into<String>) -> Self {
        self.filter = FilterConfig {
            mode,
            pattern: pattern.into(),
        };
        self
    }

    /// Enable or disable the dependency graph.
    pub fn with_visualization(mut self, visualization: bool) -> Self {
        self.visualization = visualization;
        self
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Whether the client runs in monitor mode.
    pub fn is_monitor(&self) -> bool {
        !self.monitor_interval.is_zero()
    }

    /// The deadline applied to one cycle.
    ///
    /// In monitor mode a cycle may not outlive the interval.
    pub fn cycle_deadline(&self) -> Duration {
        if self.is_monitor() {
            self.request_timeout.min(self.monitor_interval)
        } else {
            self.request_timeout
        }
    }

    /// Check the configuration for contradictions.
    ///
    /// Performs no I/O, so it runs before anything touches the network.
    pub fn validate(&self) -> Result<()> {
        if self.uri.is_empty() {
            return Err(Error::Config("service_uri must not be empty".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request_timeout must be greater than zero".into()));
        }
        if self.tls.cert.is_some() != self.tls.key.is_some() {
            return Err(Error::Config(
                "cert and key must be provided together".into(),
            ));
        }
        match self.authn_mode {
            AuthnMode::Tls if self.tls.ca_cert.is_none() => {
                return Err(Error::Config("authn_mode tls requires cacert".into()));
            }
            AuthnMode::Jwt if self.jwt_file.is_none() => {
                return Err(Error::Config("authn_mode jwt requires jwt_file".into()));
            }
            AuthnMode::Plaintext if !self.tls.is_empty() => {
                return Err(Error::Config(
                    "authn_mode plaintext conflicts with TLS material".into(),
                ));
            }
            _ => {}
        }
        NodeFilter::new(self.filter.mode, &self.filter.pattern)?;
        Ok(())
    }
}
