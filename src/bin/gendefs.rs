use std::time::Duration;

use clap::Parser;
use operator::cert_manager::{CertificateConfig, CertificateDefinition, ResourceRef};

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Generate a sample certificate definitions file
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Namespace of the generated objects
    #[arg(short, long, default_value = "cert-rotation")]
    namespace: String,

    /// Service the serving certificate is issued for
    #[arg(short, long, default_value = "webhook")]
    service: String,

    // Output file, stdout when unset
    #[arg(short, long)]
    output: Option<String>,
}

fn sample(namespace: &str, service: &str) -> Vec<CertificateDefinition> {
    let signer_config = CertificateConfig::new(30 * DAY, 10 * DAY);
    let target_config = CertificateConfig::new(DAY, 12 * HOUR);
    vec![
        CertificateDefinition {
            signer_secret: ResourceRef::new(namespace, format!("{service}-signer")),
            signer_config,
            cert_bundle_configmap: Some(ResourceRef::new(namespace, format!("{service}-ca-bundle"))),
            target_secret: Some(ResourceRef::new(namespace, format!("{service}-server-cert"))),
            target_config: Some(target_config),
            target_service: Some(service.to_string()),
            target_user: None,
        },
        CertificateDefinition {
            signer_secret: ResourceRef::new(namespace, "client-signer"),
            signer_config,
            cert_bundle_configmap: Some(ResourceRef::new(namespace, "client-ca-bundle")),
            target_secret: Some(ResourceRef::new(namespace, "client-cert")),
            target_config: Some(target_config),
            target_service: None,
            target_user: Some(format!("system:serviceaccount:{namespace}:{service}")),
        },
    ]
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let definitions = sample(&args.namespace, &args.service);
    operator::cert_manager::validate_definitions(&definitions)?;
    let yaml = serde_yaml::to_string(&definitions)?;
    match args.output {
        Some(path) => std::fs::write(path, yaml)?,
        None => print!("{yaml}"),
    }
    Ok(())
}
