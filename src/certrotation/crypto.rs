use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use time::OffsetDateTime;
use tracing::*;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate, X509Name};

use crate::{Error, Result};

/// Fields of a parsed X.509 certificate the rotation logic cares about
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertInfo {
    pub common_name: String,
    pub issuer_common_name: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub dns_names: Vec<String>,
    pub is_ca: bool,
    pub server_auth: bool,
    pub client_auth: bool,
}

impl CertInfo {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::InvalidCertificate(format!("failed to parse certificate: {e}")))?;

        let not_before = timestamp(cert.validity().not_before.timestamp())?;
        let not_after = timestamp(cert.validity().not_after.timestamp())?;
        let dns_names = match cert.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                return Err(Error::InvalidCertificate(format!(
                    "bad subject alternative names: {e}"
                )));
            }
        };
        let (server_auth, client_auth) = match cert.extended_key_usage() {
            Ok(Some(eku)) => (eku.value.server_auth, eku.value.client_auth),
            _ => (false, false),
        };

        Ok(Self {
            common_name: first_common_name(cert.subject()),
            issuer_common_name: first_common_name(cert.issuer()),
            not_before,
            not_after,
            dns_names,
            is_ca: cert.is_ca(),
            server_auth,
            client_auth,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }
}

fn first_common_name(name: &X509Name<'_>) -> String {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
        .to_string()
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::InvalidCertificate(format!("timestamp {secs} out of range")))
}

/// A certificate trusted through a CA bundle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustedCertificate {
    pub pem: String,
    pub info: CertInfo,
}

/// Parse every certificate of a PEM bundle, in order
pub fn parse_certificates(bundle: &str) -> Result<Vec<TrustedCertificate>> {
    let blocks = pem::parse_many(bundle)
        .map_err(|e| Error::InvalidCertificate(format!("failed to parse PEM: {e}")))?;
    blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| {
            Ok(TrustedCertificate {
                info: CertInfo::from_der(block.contents())?,
                pem: encode_certificate(block.contents()),
            })
        })
        .collect()
}

/// Concatenate certificates into a single PEM bundle
pub fn encode_bundle(certs: &[TrustedCertificate]) -> String {
    certs.iter().map(|c| c.pem.as_str()).collect()
}

fn encode_certificate(der: &[u8]) -> String {
    let block = pem::Pem::new("CERTIFICATE", der.to_vec());
    pem::encode_config(
        &block,
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    )
}

/// A freshly issued certificate and its private key
pub struct CertKeyPair {
    pub cert_pem: String,
    pub key_pem: String,
    pub info: CertInfo,
}

/// The signing key pair and certificate of a self-signed authority
#[derive(Clone, Debug)]
pub struct CertificateAuthority {
    pub cert_pem: String,
    key_pem: String,
    pub info: CertInfo,
}

impl PartialEq for CertificateAuthority {
    fn eq(&self, other: &Self) -> bool {
        self.cert_pem == other.cert_pem
    }
}

impl CertificateAuthority {
    /// Create a new self-signed CA valid for `validity` from now
    pub fn generate(common_name: &str, validity: StdDuration) -> Result<Self> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, validity)?;

        let key_pair = KeyPair::generate().map_err(Error::CertificateError)?;
        let cert = params.self_signed(&key_pair).map_err(Error::CertificateError)?;
        debug!("Generated signing CA {}", common_name);
        Self::from_pem(&cert.pem(), &key_pair.serialize_pem())
    }

    /// Load a CA from its PEM certificate and key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem).map_err(Error::CertificateError)?;
        let cert = parse_certificates(cert_pem)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidCertificate("no certificate in PEM".to_string()))?;
        if !cert.info.is_ca {
            return Err(Error::InvalidCertificate(format!(
                "{} is not a CA certificate",
                cert.info.common_name
            )));
        }
        Ok(Self {
            cert_pem: cert.pem,
            key_pem: key_pem.to_string(),
            info: cert.info,
        })
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn trusted(&self) -> TrustedCertificate {
        TrustedCertificate {
            pem: self.cert_pem.clone(),
            info: self.info.clone(),
        }
    }

    /// Sign a serving certificate for `hostnames`
    pub fn sign_serving(&self, hostnames: &[String], validity: StdDuration) -> Result<CertKeyPair> {
        let first = hostnames
            .first()
            .ok_or_else(|| Error::OtherError("serving certificate needs a hostname".to_string()))?;
        let mut params = leaf_params(first, validity)?;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.subject_alt_names = hostnames
            .iter()
            .map(|host| {
                host.clone()
                    .try_into()
                    .map(SanType::DnsName)
                    .map_err(Error::CertificateError)
            })
            .collect::<Result<Vec<_>>>()?;
        self.sign(params)
    }

    /// Sign a client certificate for the identity `user`
    pub fn sign_client(&self, user: &str, validity: StdDuration) -> Result<CertKeyPair> {
        let mut params = leaf_params(user, validity)?;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        self.sign(params)
    }

    fn sign(&self, params: CertificateParams) -> Result<CertKeyPair> {
        let ca_key = KeyPair::from_pem(&self.key_pem).map_err(Error::CertificateError)?;
        let ca_cert = CertificateParams::from_ca_cert_pem(&self.cert_pem)
            .and_then(|ca_params| ca_params.self_signed(&ca_key))
            .map_err(Error::CertificateError)?;

        let key_pair = KeyPair::generate().map_err(Error::CertificateError)?;
        let cert = params
            .signed_by(&key_pair, &ca_cert, &ca_key)
            .map_err(Error::CertificateError)?;
        let info = CertInfo::from_der(cert.der())?;
        Ok(CertKeyPair {
            cert_pem: encode_certificate(cert.der()),
            key_pem: key_pair.serialize_pem(),
            info,
        })
    }
}

fn leaf_params(common_name: &str, validity: StdDuration) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    set_validity(&mut params, validity)?;
    Ok(params)
}

fn set_validity(params: &mut CertificateParams, validity: StdDuration) -> Result<()> {
    let not_before = Utc::now().trunc_subsecs(0);
    let not_after = not_before
        + Duration::from_std(validity).map_err(|e| Error::OtherError(e.to_string()))?;
    params.not_before = offset(not_before)?;
    params.not_after = offset(not_after)?;
    let serial = Utc::now().timestamp_nanos_opt().unwrap_or_default().unsigned_abs();
    params.serial_number = Some(SerialNumber::from(serial.max(1)));
    Ok(())
}

fn offset(dt: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|e| Error::OtherError(format!("invalid certificate time: {e}")))
}
