//! Lifecycle of the operator-issued server certificate.
//!
//! The operator maintains its own certificate authority per cluster, persisted
//! in a Secret so re-elected operator Pods keep issuing from the same root.
//! Leaf certificates cover the service FQDN plus all Listener addresses and
//! are re-issued when the identity set drifts or the renewal window starts.

use p256::pkcs8::EncodePrivateKey;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_certs::{
    CertificatePair,
    ca::{self, CertificateAuthority},
    keys::{CertificateKeypair, ecdsa::SigningKey},
};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    client::Client,
    k8s_openapi::api::core::v1::Secret,
    kube::{ResourceExt, runtime::reflector::ObjectRef},
    kvp::Annotation,
    time::Duration,
};
use x509_cert::{
    Certificate,
    der::{EncodePem, pem::LineEnding},
};

use crate::{crd::v1alpha1, database, security::tls::ServerIdentity};

pub const TLS_CERT_SECRET_KEY: &str = "tls.crt";
pub const TLS_KEY_SECRET_KEY: &str = "tls.key";
pub const CA_CERT_SECRET_KEY: &str = "ca.crt";
pub const CA_KEY_SECRET_KEY: &str = "ca.key";

const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
const SANS_ANNOTATION: &str = "glauth.stackable.tech/subject-alternative-names";

const GLAUTH_CA_SUBJECT: &str = "CN=Stackable GLAuth Operator CA";
const CA_VALIDITY: Duration = Duration::from_days_unchecked(3650);
const SERVER_CERT_VALIDITY: Duration = Duration::from_days_unchecked(7);

// Transient apply failures are retried a few times before the reconcile run
// gives up and requeues.
const APPLY_ATTEMPTS: u32 = 3;
const APPLY_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(3);

const FIELD_MANAGER_SCOPE: &str = "glauthcluster";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object has no namespace associated"))]
    NoNamespace,

    #[snafu(display("object is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef {
        source: stackable_operator::builder::meta::Error,
    },

    #[snafu(display("failed to build the certificate fingerprint annotation"))]
    BuildAnnotation {
        source: stackable_operator::kvp::AnnotationError,
    },

    #[snafu(display("failed to retrieve the Secret [{name}]"))]
    GetSecret {
        source: stackable_operator::client::Error,
        name: String,
    },

    #[snafu(display("failed to generate a new certificate authority"))]
    CreateCertificateAuthority {
        source: ca::CreateCertificateAuthorityError<stackable_certs::keys::ecdsa::Error>,
    },

    #[snafu(display("the CA Secret {secret} exists but holds no usable CA"))]
    LoadCertificateAuthority {
        source: ca::SecretError<stackable_certs::keys::ecdsa::Error>,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to issue the server certificate"))]
    CreateServerCertificate {
        source: stackable_certs::CreateCertificateError<stackable_certs::keys::ecdsa::Error>,
    },

    #[snafu(display("failed to serialize certificate as PEM"))]
    SerializeCertificate { source: x509_cert::der::Error },

    #[snafu(display("failed to serialize private key as PEM"))]
    SerializePrivateKey { source: p256::pkcs8::Error },

    #[snafu(display("failed to apply the Secret [{name}] after {APPLY_ATTEMPTS} attempts"))]
    ApplySecret {
        source: stackable_operator::client::Error,
        name: String,
    },

    #[snafu(display("failed to delete the Secret [{name}]"))]
    DeleteSecret {
        source: stackable_operator::client::Error,
        name: String,
    },

    #[snafu(display("the Secret {secret} is missing certificate data"))]
    MissingCertificateData {
        source: database::Error,
        secret: ObjectRef<Secret>,
    },
}

/// The certificate material handed out to consumers. The private key stays in
/// the server-TLS Secret and is never part of this struct.
#[derive(Clone, Debug, PartialEq)]
pub struct CertificateData {
    pub ca_cert: String,
    pub ca_chain: Vec<String>,
    pub cert: String,
}

impl CertificateData {
    /// The concatenated PEM bundle consumers add to their trust store.
    pub fn ca_bundle(&self) -> String {
        if self.ca_chain.is_empty() {
            self.ca_cert.clone()
        } else {
            self.ca_chain.join("")
        }
    }
}

/// Ensure CA and server certificate exist and cover the given identities,
/// issuing or re-issuing where needed. Returns the consumer-facing
/// certificate data.
pub async fn ensure_server_certificates(
    client: &Client,
    glauth: &v1alpha1::GlauthCluster,
    identity: &ServerIdentity,
) -> Result<CertificateData> {
    let namespace = glauth.namespace().context(NoNamespaceSnafu)?;
    let ca = load_or_create_ca(client, glauth, &namespace).await?;

    let secret_name = glauth.server_tls_secret_name();
    let existing = client
        .get_opt::<Secret>(&secret_name, &namespace)
        .await
        .with_context(|_| GetSecretSnafu {
            name: secret_name.clone(),
        })?;

    if let Some(secret) = &existing {
        if !needs_reissue(secret, identity) {
            let cert = database::secret_string_value(secret, TLS_CERT_SECRET_KEY)
                .with_context(|_| MissingCertificateDataSnafu {
                    secret: ObjectRef::from_obj(secret),
                })?;
            let ca_cert = database::secret_string_value(secret, CA_CERT_SECRET_KEY)
                .with_context(|_| MissingCertificateDataSnafu {
                    secret: ObjectRef::from_obj(secret),
                })?;
            return Ok(CertificateData {
                ca_chain: vec![ca_cert.clone()],
                ca_cert,
                cert,
            });
        }
    }

    tracing::info!(
        secret = %secret_name,
        common_name = %identity.common_name,
        "issuing a new server certificate"
    );

    let san_dns: Vec<&str> = identity.sans_dns.iter().map(String::as_str).collect();
    let subject = format!("CN={}", identity.common_name);
    let certificate = CertificatePair::builder()
        .subject(&subject)
        .subject_alternative_dns_names(&san_dns)
        .subject_alternative_ip_addresses(&identity.sans_ip)
        .validity(SERVER_CERT_VALIDITY)
        .signed_by(&ca)
        .build()
        .context(CreateServerCertificateSnafu)?;

    let cert_pem = certificate
        .certificate()
        .to_pem(LineEnding::LF)
        .context(SerializeCertificateSnafu)?;
    let key_pem = certificate
        .key_pair()
        .signing_key()
        .to_pkcs8_pem(LineEnding::LF)
        .context(SerializePrivateKeySnafu)?;
    let ca_pem = ca
        .ca_cert()
        .to_pem(LineEnding::LF)
        .context(SerializeCertificateSnafu)?;

    let secret = Secret {
        metadata: ObjectMetaBuilder::new()
            .name_and_namespace(glauth)
            .name(&secret_name)
            .ownerreference_from_resource(glauth, None, Some(true))
            .context(ObjectMissingMetadataForOwnerRefSnafu)?
            .with_annotation(
                Annotation::try_from((SANS_ANNOTATION, identity.fingerprint().as_str()))
                    .context(BuildAnnotationSnafu)?,
            )
            .build(),
        type_: Some(TLS_SECRET_TYPE.to_string()),
        string_data: Some(
            [
                (TLS_CERT_SECRET_KEY.to_string(), cert_pem.clone()),
                (TLS_KEY_SECRET_KEY.to_string(), key_pem.to_string()),
                (CA_CERT_SECRET_KEY.to_string(), ca_pem.clone()),
            ]
            .into(),
        ),
        ..Secret::default()
    };

    apply_secret_with_retry(client, &secret).await?;

    Ok(CertificateData {
        ca_chain: vec![ca_pem.clone()],
        ca_cert: ca_pem,
        cert: cert_pem,
    })
}

/// Remove the issued server certificate, e.g. after TLS was disabled.
pub async fn remove_server_certificates(
    client: &Client,
    glauth: &v1alpha1::GlauthCluster,
) -> Result<()> {
    let namespace = glauth.namespace().context(NoNamespaceSnafu)?;
    let secret_name = glauth.server_tls_secret_name();

    if let Some(secret) = client
        .get_opt::<Secret>(&secret_name, &namespace)
        .await
        .with_context(|_| GetSecretSnafu {
            name: secret_name.clone(),
        })?
    {
        client
            .delete(&secret)
            .await
            .with_context(|_| DeleteSecretSnafu {
                name: secret_name.clone(),
            })?;
    }

    Ok(())
}

async fn load_or_create_ca(
    client: &Client,
    glauth: &v1alpha1::GlauthCluster,
    namespace: &str,
) -> Result<CertificateAuthority<SigningKey>> {
    let ca_secret_name = glauth.ca_secret_name();

    if let Some(secret) = client
        .get_opt::<Secret>(&ca_secret_name, namespace)
        .await
        .with_context(|_| GetSecretSnafu {
            name: ca_secret_name.clone(),
        })?
    {
        let secret_ref = ObjectRef::from_obj(&secret);
        return ca::ca_from_k8s_secret(secret, CA_CERT_SECRET_KEY, CA_KEY_SECRET_KEY)
            .context(LoadCertificateAuthoritySnafu { secret: secret_ref });
    }

    tracing::info!(
        secret = %ca_secret_name,
        "no certificate authority found, generating a new one"
    );

    let ca = CertificateAuthority::<SigningKey>::builder()
        .subject(GLAUTH_CA_SUBJECT)
        .validity(CA_VALIDITY)
        .build()
        .context(CreateCertificateAuthoritySnafu)?;

    let ca_cert_pem = ca
        .ca_cert()
        .to_pem(LineEnding::LF)
        .context(SerializeCertificateSnafu)?;
    let ca_key_pem = ca
        .signing_key()
        .to_pkcs8_pem(LineEnding::LF)
        .context(SerializePrivateKeySnafu)?;

    let secret = Secret {
        metadata: ObjectMetaBuilder::new()
            .name_and_namespace(glauth)
            .name(&ca_secret_name)
            .ownerreference_from_resource(glauth, None, Some(true))
            .context(ObjectMissingMetadataForOwnerRefSnafu)?
            .build(),
        string_data: Some(
            [
                (CA_CERT_SECRET_KEY.to_string(), ca_cert_pem),
                (CA_KEY_SECRET_KEY.to_string(), ca_key_pem.to_string()),
            ]
            .into(),
        ),
        ..Secret::default()
    };
    apply_secret_with_retry(client, &secret).await?;

    Ok(ca)
}

fn needs_reissue(secret: &Secret, identity: &ServerIdentity) -> bool {
    let issued_for = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(SANS_ANNOTATION));
    if issued_for != Some(&identity.fingerprint()) {
        return true;
    }

    let Some(cert_data) = secret.data.as_ref().and_then(|data| data.get(TLS_CERT_SECRET_KEY))
    else {
        return true;
    };
    let Ok(mut chain) = Certificate::load_pem_chain(&cert_data.0) else {
        return true;
    };
    if chain.is_empty() {
        return true;
    }
    // The leaf comes first in the stored chain
    let certificate = chain.remove(0);

    let not_after = certificate
        .tbs_certificate
        .validity
        .not_after
        .to_system_time();
    let renew_from = not_after - *SERVER_CERT_VALIDITY / 2;

    std::time::SystemTime::now() >= renew_from
}

async fn apply_secret_with_retry(client: &Client, secret: &Secret) -> Result<()> {
    let name = secret.name_any();
    let mut attempt = 1;
    loop {
        match client.apply_patch(FIELD_MANAGER_SCOPE, secret, secret).await {
            Ok(_) => return Ok(()),
            Err(error) if attempt < APPLY_ATTEMPTS => {
                tracing::warn!(
                    secret = %name,
                    %attempt,
                    %error,
                    "applying Secret failed, retrying"
                );
                tokio::time::sleep(APPLY_RETRY_DELAY).await;
                attempt += 1;
            }
            Err(error) => {
                return Err(error).context(ApplySecretSnafu { name });
            }
        }
    }
}
