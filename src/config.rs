use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Parser, ValueEnum};
use duration_string::DurationString;
use tracing::*;

use crate::{
    Error, Result,
    cert_manager::{CertificateDefinition, validate_definitions},
    helper::get_my_namespace,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Keep signer, CA bundle and target certificates rotated
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Namespace the operator runs in, defaults to the service account namespace
    #[arg(long, env = "INSTALL_NAMESPACE")]
    pub install_namespace: Option<String>,

    /// Further namespaces to watch
    #[arg(long = "additional-namespace", env = "ADDITIONAL_NAMESPACES", value_delimiter = ',')]
    pub additional_namespaces: Vec<String>,

    /// YAML file with the list of certificate definitions
    #[arg(long, env = "CERT_DEFINITIONS")]
    pub definitions: PathBuf,

    /// Time between two reconciliations of every definition
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "5m", value_parser = parse_duration)]
    pub resync_interval: Duration,

    /// How long to wait for the initial listing of each namespace
    #[arg(long, env = "CACHE_SYNC_TIMEOUT", default_value = "2m", value_parser = parse_duration)]
    pub cache_sync_timeout: Duration,

    /// Address of the health and diagnostics server
    #[arg(long, env = "LISTEN_ADDRESS", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    s.parse::<DurationString>()
        .map(Into::into)
        .map_err(|e| format!("invalid duration `{s}`: {e:?}"))
}

/// Everything the certificate manager needs to run
#[derive(Clone, Debug)]
pub struct Settings {
    pub namespaces: Vec<String>,
    pub definitions: Vec<CertificateDefinition>,
    pub resync_interval: Duration,
    pub cache_sync_timeout: Duration,
}

impl Args {
    /// Resolve the watched namespaces and load the definitions file
    pub fn settings(&self) -> Result<Settings> {
        let install_namespace = match &self.install_namespace {
            Some(ns) => ns.clone(),
            None => get_my_namespace()?,
        };
        let definitions = load_definitions(&self.definitions)?;
        let namespaces = watched_namespaces(&install_namespace, &self.additional_namespaces);
        for definition in &definitions {
            for ns in definition.namespaces() {
                if !namespaces.iter().any(|w| w == ns) {
                    warn!(
                        "Definition for {} uses namespace {} which is not watched",
                        definition.signer_secret, ns
                    );
                }
            }
        }
        Ok(Settings {
            namespaces,
            definitions,
            resync_interval: self.resync_interval,
            cache_sync_timeout: self.cache_sync_timeout,
        })
    }
}

/// Additional namespaces first, then the install namespace, without duplicates
pub fn watched_namespaces(install_namespace: &str, additional: &[String]) -> Vec<String> {
    let mut namespaces: Vec<String> = Vec::new();
    for ns in additional.iter().map(String::as_str).chain([install_namespace]) {
        let ns = ns.trim();
        if !ns.is_empty() && !namespaces.iter().any(|n| n == ns) {
            namespaces.push(ns.to_string());
        }
    }
    namespaces
}

/// Read and validate a YAML list of definitions
pub fn load_definitions(path: &Path) -> Result<Vec<CertificateDefinition>> {
    let raw = std::fs::read_to_string(path).map_err(Error::IoError)?;
    let definitions: Vec<CertificateDefinition> =
        serde_yaml::from_str(&raw).map_err(Error::YamlError)?;
    validate_definitions(&definitions)?;
    info!(
        "Loaded {} certificate definition(s) from {}",
        definitions.len(),
        path.display()
    );
    Ok(definitions)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_yaml(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(content.as_bytes()).expect("write");
        file
    }

    #[test]
    fn namespaces_are_deduplicated() {
        let extra = vec!["ns2".to_string(), "ns1".to_string(), " ".to_string()];
        assert_eq!(watched_namespaces("ns1", &extra), vec!["ns2", "ns1"]);
    }

    #[test]
    fn loads_valid_definitions() {
        let file = write_yaml(
            r#"
- signerSecret: { namespace: ns1, name: ca }
  signerConfig: { lifetime: 720h, refresh: 240h }
  certBundleConfigmap: { namespace: ns1, name: ca-bundle }
  targetSecret: { namespace: ns1, name: svc-tls }
  targetConfig: { lifetime: 24h, refresh: 12h }
  targetService: svc
"#,
        );
        let defs = load_definitions(file.path()).expect("load");
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].target_service.as_deref(), Some("svc"));
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        let file = write_yaml(
            r#"
- signerSecret: { namespace: ns1, name: ca }
  signerConfig: { lifetime: 720h, refresh: 240h }
  certBundleConfigmap: { namespace: ns1, name: ca-bundle }
  targetSecret: { namespace: ns1, name: svc-tls }
  targetConfig: { lifetime: 24h, refresh: 12h }
  targetService: svc
  targetUser: alice
"#,
        );
        let err = load_definitions(file.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidDefinition(_)), "{err}");
    }

    #[test]
    fn malformed_yaml_is_a_yaml_error() {
        let file = write_yaml("- signerSecret: [");
        assert!(matches!(
            load_definitions(file.path()),
            Err(Error::YamlError(_))
        ));
    }

    #[test]
    fn args_resolve_into_settings() {
        let file = write_yaml(
            r#"
- signerSecret: { namespace: ns1, name: ca }
  signerConfig: { lifetime: 720h, refresh: 240h }
"#,
        );
        let args = Args::parse_from([
            "cert-rotator",
            "--install-namespace",
            "ns1",
            "--additional-namespace",
            "ns2",
            "--definitions",
            file.path().to_str().unwrap(),
            "--resync-interval",
            "30s",
        ]);
        let settings = args.settings().expect("settings");
        assert_eq!(settings.namespaces, vec!["ns2", "ns1"]);
        assert_eq!(settings.resync_interval, Duration::from_secs(30));
        assert_eq!(settings.cache_sync_timeout, Duration::from_secs(120));
        assert_eq!(settings.definitions.len(), 1);
    }
}
