//! Self-signed PKI material for the deployment.
//!
//! A root authority signs every other certificate. The certifier holds an intermediate
//! authority restricted to leaf issuance (path length 0), the endpoint certificate covers the
//! public domain and the in-cluster service names, the operator identity is a client
//! certificate and the bootstrap role is a bare key.
//!
//! Material is regenerated on every run; the secrets holding it are re-synchronized right
//! after, so consumers pick the new set on their next restart.

use crate::error::{Error, Result};

use std::collections::BTreeMap;
use std::fmt;

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509, X509Name, X509Ref};
use tracing::debug;

const ORGANIZATION: &str = "Orkestra";
const ROOT_VALIDITY_DAYS: u32 = 3650;
const LEAF_VALIDITY_DAYS: u32 = 825;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PkiRole {
    RootAuthority,
    Endpoint,
    Certifier,
    Bootstrap,
    Operator,
}

impl PkiRole {
    pub const ALL: [PkiRole; 5] = [
        PkiRole::RootAuthority,
        PkiRole::Endpoint,
        PkiRole::Certifier,
        PkiRole::Bootstrap,
        PkiRole::Operator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PkiRole::RootAuthority => "root-authority",
            PkiRole::Endpoint => "endpoint",
            PkiRole::Certifier => "certifier",
            PkiRole::Bootstrap => "bootstrap",
            PkiRole::Operator => "operator",
        }
    }
}

impl fmt::Display for PkiRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PEM encoded key, with its certificate for every role but the bootstrap key.
#[derive(Clone, Debug)]
pub struct PkiArtifact {
    pub key_pem: Vec<u8>,
    pub cert_pem: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct PkiMaterial {
    artifacts: BTreeMap<PkiRole, PkiArtifact>,
}

#[derive(Clone, Copy, Debug)]
enum Profile {
    Root,
    Intermediate,
    Server,
    Client,
}

impl PkiMaterial {
    /// Generate a fresh material set for `domain`, with service names of `namespace` as
    /// additional endpoint SANs.
    pub fn generate(domain: &str, namespace: &str) -> Result<Self> {
        Self::build(domain, namespace).map_err(|e| Error::pki("failed to generate PKI material", e))
    }

    fn build(domain: &str, namespace: &str) -> Result<Self, ErrorStack> {
        let root_key = generate_key()?;
        let root_cert = issue(
            "Orkestra Root Authority",
            Profile::Root,
            &[],
            &root_key,
            None,
        )?;
        let issuer = Some((root_cert.as_ref(), root_key.as_ref()));

        let certifier_key = generate_key()?;
        let certifier_cert = issue(
            "Orkestra Certifier",
            Profile::Intermediate,
            &[],
            &certifier_key,
            issuer,
        )?;

        let endpoint_key = generate_key()?;
        let endpoint_cert = issue(
            domain,
            Profile::Server,
            &endpoint_names(domain, namespace),
            &endpoint_key,
            issuer,
        )?;

        let operator_key = generate_key()?;
        let operator_cert = issue(
            "orkestra-operator",
            Profile::Client,
            &[],
            &operator_key,
            issuer,
        )?;

        let bootstrap_key = generate_key()?;

        let artifacts = BTreeMap::from([
            (PkiRole::RootAuthority, artifact(&root_key, Some(&root_cert))?),
            (PkiRole::Certifier, artifact(&certifier_key, Some(&certifier_cert))?),
            (PkiRole::Endpoint, artifact(&endpoint_key, Some(&endpoint_cert))?),
            (PkiRole::Operator, artifact(&operator_key, Some(&operator_cert))?),
            (PkiRole::Bootstrap, artifact(&bootstrap_key, None)?),
        ]);
        debug!(msg = "PKI material generated", roles = artifacts.len());
        Ok(Self { artifacts })
    }

    pub fn get(&self, role: PkiRole) -> Option<&PkiArtifact> {
        self.artifacts.get(&role)
    }

    /// Certificate of a role, failing for roles without one.
    pub fn cert_pem(&self, role: PkiRole) -> Result<&[u8]> {
        self.get(role)
            .and_then(|a| a.cert_pem.as_deref())
            .ok_or_else(|| Error::MissingData(format!("no certificate for PKI role {role}")))
    }

    pub fn key_pem(&self, role: PkiRole) -> Result<&[u8]> {
        self.get(role)
            .map(|a| a.key_pem.as_slice())
            .ok_or_else(|| Error::MissingData(format!("no key for PKI role {role}")))
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

/// SANs of the endpoint certificate: the public domain plus the in-cluster names of every
/// service in the namespace, which the stores reuse for their transport TLS.
pub fn endpoint_names(domain: &str, namespace: &str) -> Vec<String> {
    vec![
        domain.to_string(),
        format!("*.{domain}"),
        format!("*.{namespace}.svc"),
        format!("*.{namespace}.svc.cluster.local"),
        "localhost".to_string(),
    ]
}

fn artifact(key: &PKeyRef<Private>, cert: Option<&X509>) -> Result<PkiArtifact, ErrorStack> {
    Ok(PkiArtifact {
        key_pem: key.private_key_to_pem_pkcs8()?,
        cert_pem: cert.map(|c| c.to_pem()).transpose()?,
    })
}

fn generate_key() -> Result<PKey<Private>, ErrorStack> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let key = EcKey::generate(&group)?;
    PKey::from_ec_key(key)
}

fn build_name(common_name: &str) -> Result<X509Name, ErrorStack> {
    let mut name = X509Name::builder()?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, ORGANIZATION)?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    Ok(name.build())
}

fn issue(
    common_name: &str,
    profile: Profile,
    sans: &[String],
    key: &PKeyRef<Private>,
    issuer: Option<(&X509Ref, &PKeyRef<Private>)>,
) -> Result<X509, ErrorStack> {
    let name = build_name(common_name)?;
    let issuer_cert = issuer.map(|(cert, _)| cert);

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = {
        let mut serial = BigNum::new()?;
        serial.rand(127, MsbOption::MAYBE_ZERO, false)?;
        serial.to_asn1_integer()?
    };
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    match issuer_cert {
        Some(cert) => builder.set_issuer_name(cert.subject_name())?,
        None => builder.set_issuer_name(&name)?,
    }
    builder.set_pubkey(key)?;

    let days = match profile {
        Profile::Root | Profile::Intermediate => ROOT_VALIDITY_DAYS,
        Profile::Server | Profile::Client => LEAF_VALIDITY_DAYS,
    };
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(days)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    match profile {
        Profile::Root => {
            builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
            builder.append_extension(
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .crl_sign()
                    .build()?,
            )?;
        }
        Profile::Intermediate => {
            builder.append_extension(
                BasicConstraints::new().critical().ca().pathlen(0).build()?,
            )?;
            builder.append_extension(
                KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_cert_sign()
                    .crl_sign()
                    .build()?,
            )?;
        }
        Profile::Server => {
            builder.append_extension(BasicConstraints::new().critical().build()?)?;
            builder.append_extension(
                KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_encipherment()
                    .build()?,
            )?;
            builder.append_extension(
                ExtendedKeyUsage::new()
                    .server_auth()
                    .client_auth()
                    .build()?,
            )?;
        }
        Profile::Client => {
            builder.append_extension(BasicConstraints::new().critical().build()?)?;
            builder.append_extension(
                KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .build()?,
            )?;
            builder.append_extension(ExtendedKeyUsage::new().client_auth().build()?)?;
        }
    }

    let subject_key_id =
        SubjectKeyIdentifier::new().build(&builder.x509v3_context(issuer_cert, None))?;
    builder.append_extension(subject_key_id)?;
    if issuer_cert.is_some() {
        let authority_key_id = AuthorityKeyIdentifier::new()
            .keyid(false)
            .issuer(false)
            .build(&builder.x509v3_context(issuer_cert, None))?;
        builder.append_extension(authority_key_id)?;
    }
    if !sans.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for dns in sans {
            san.dns(dns);
        }
        let san = san.build(&builder.x509v3_context(issuer_cert, None))?;
        builder.append_extension(san)?;
    }

    let signing_key = issuer.map(|(_, k)| k).unwrap_or(key);
    builder.sign(signing_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material() -> PkiMaterial {
        PkiMaterial::generate("example.org", "orkestra").unwrap()
    }

    #[test]
    fn test_generate_five_roles() {
        let pki = material();
        assert_eq!(pki.len(), 5);
        for role in PkiRole::ALL {
            assert!(pki.get(role).is_some(), "missing {role}");
        }
        assert!(pki.get(PkiRole::Bootstrap).unwrap().cert_pem.is_none());
        assert!(pki.cert_pem(PkiRole::Bootstrap).is_err());
    }

    #[test]
    fn test_leaf_certificates_are_signed_by_root() {
        let pki = material();
        let root = X509::from_pem(pki.cert_pem(PkiRole::RootAuthority).unwrap()).unwrap();
        let root_key = root.public_key().unwrap();
        for role in [PkiRole::Endpoint, PkiRole::Certifier, PkiRole::Operator] {
            let cert = X509::from_pem(pki.cert_pem(role).unwrap()).unwrap();
            assert!(cert.verify(&root_key).unwrap(), "{role} not signed by root");
        }
        assert!(root.verify(&root_key).unwrap());
    }

    #[test]
    fn test_endpoint_sans() {
        let pki = material();
        let cert = X509::from_pem(pki.cert_pem(PkiRole::Endpoint).unwrap()).unwrap();
        let names = cert
            .subject_alt_names()
            .unwrap()
            .iter()
            .filter_map(|n| n.dnsname().map(str::to_string))
            .collect::<Vec<_>>();
        assert_eq!(names, endpoint_names("example.org", "orkestra"));
    }

    #[test]
    fn test_key_matches_certificate() {
        let pki = material();
        let cert = X509::from_pem(pki.cert_pem(PkiRole::Operator).unwrap()).unwrap();
        let key = PKey::private_key_from_pem(pki.key_pem(PkiRole::Operator).unwrap()).unwrap();
        assert!(cert.public_key().unwrap().public_eq(&key));
    }

    #[test]
    fn test_material_is_regenerated() {
        let a = material();
        let b = material();
        assert_ne!(
            a.key_pem(PkiRole::RootAuthority).unwrap(),
            b.key_pem(PkiRole::RootAuthority).unwrap()
        );
    }
}
