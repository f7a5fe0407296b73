//! Discovery objects other applications use to connect to a [`GlauthCluster`]:
//! an endpoint ConfigMap, one credentials Secret per provisioned bind account,
//! the auxiliary database passthrough Secret and the CA certificate fan-out.
//!
//! The pass-through backend consumes the same format from an upstream LDAP
//! server, so GLAuth clusters can be chained.
//!
//! [`GlauthCluster`]: crate::crd::v1alpha1::GlauthCluster

use std::collections::BTreeMap;

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    builder::{configmap::ConfigMapBuilder, meta::ObjectMetaBuilder},
    client::Client,
    k8s_openapi::api::core::v1::{ConfigMap, Secret},
    kube::runtime::reflector::ObjectRef,
    kvp::ObjectLabels,
};
use url::Url;

use crate::{
    crd::v1alpha1,
    database::{self, DatabaseConfig},
    provision::BindAccount,
    security::certificates::CertificateData,
};

pub const DISCOVERY_LDAP_URLS_KEY: &str = "LDAP_URLS";
pub const DISCOVERY_LDAPS_URLS_KEY: &str = "LDAPS_URLS";
pub const DISCOVERY_BASE_DN_KEY: &str = "LDAP_BASE_DN";
pub const DISCOVERY_STARTTLS_KEY: &str = "LDAP_STARTTLS";

pub const SECRET_BIND_DN_KEY: &str = "LDAP_BIND_DN";
pub const SECRET_BIND_PASSWORD_KEY: &str = "LDAP_BIND_PASSWORD";
pub const SECRET_AUTH_METHOD_KEY: &str = "LDAP_AUTH_METHOD";

pub const AUXILIARY_ENDPOINT_KEY: &str = "endpoint";
pub const AUXILIARY_DATABASE_KEY: &str = "database";
pub const AUXILIARY_USERNAME_KEY: &str = "username";
pub const AUXILIARY_PASSWORD_KEY: &str = "password";

pub const CA_CERT_KEY: &str = "ca.crt";

// The only bind mechanism GLAuth supports.
const AUTH_METHOD: &str = "simple";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef {
        source: stackable_operator::builder::meta::Error,
    },

    #[snafu(display("failed to build Metadata"))]
    MetadataBuild {
        source: stackable_operator::builder::meta::Error,
    },

    #[snafu(display("failed to build discovery ConfigMap"))]
    BuildConfigMap {
        source: stackable_operator::builder::configmap::Error,
    },

    #[snafu(display("no password available for bind account [{account}]"))]
    MissingBindPassword { account: String },

    #[snafu(display("failed to retrieve the upstream LDAP ConfigMap [{name}]"))]
    GetUpstreamConfigMap {
        source: stackable_operator::client::Error,
        name: String,
    },

    #[snafu(display("failed to retrieve the upstream LDAP bind Secret [{name}]"))]
    GetUpstreamBindSecret {
        source: stackable_operator::client::Error,
        name: String,
    },

    #[snafu(display("the upstream LDAP ConfigMap {config_map} is missing the key [{key}]"))]
    MissingUpstreamConfigMapKey {
        config_map: ObjectRef<ConfigMap>,
        key: String,
    },

    #[snafu(display("the upstream LDAP ConfigMap {config_map} contains no server URLs"))]
    EmptyUpstreamServerList { config_map: ObjectRef<ConfigMap> },

    #[snafu(display("failed to parse the upstream LDAP URL [{url}]"))]
    ParseUpstreamUrl {
        source: url::ParseError,
        url: String,
    },

    #[snafu(display("failed to read the upstream bind Secret"))]
    UpstreamBindSecretData { source: database::Error },
}

/// The client-facing endpoints of a GLAuth cluster.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LdapEndpoints {
    pub urls: Vec<String>,
    pub ldaps_urls: Vec<String>,
    pub base_dn: String,
    pub starttls: bool,
}

/// Connection data of an upstream LDAP server the pass-through backend proxies to.
#[derive(Clone, Debug, PartialEq)]
pub struct LdapServerConfig {
    pub urls: Vec<Url>,
    pub base_dn: Option<String>,
    pub starttls: bool,
    pub bind_dn: Option<String>,
    pub bind_password: Option<String>,
}

/// The discovery ConfigMap exposing the cluster endpoints.
pub fn build_discovery_config_map(
    glauth: &v1alpha1::GlauthCluster,
    object_labels: ObjectLabels<v1alpha1::GlauthCluster>,
    endpoints: &LdapEndpoints,
) -> Result<ConfigMap> {
    let mut cm_builder = ConfigMapBuilder::new();
    cm_builder
        .metadata(
            ObjectMetaBuilder::new()
                .name_and_namespace(glauth)
                .ownerreference_from_resource(glauth, None, Some(true))
                .context(ObjectMissingMetadataForOwnerRefSnafu)?
                .with_recommended_labels(object_labels)
                .context(MetadataBuildSnafu)?
                .build(),
        )
        .add_data(DISCOVERY_LDAP_URLS_KEY, endpoints.urls.join(","))
        .add_data(DISCOVERY_BASE_DN_KEY, &endpoints.base_dn)
        .add_data(DISCOVERY_STARTTLS_KEY, endpoints.starttls.to_string());

    if !endpoints.ldaps_urls.is_empty() {
        cm_builder.add_data(DISCOVERY_LDAPS_URLS_KEY, endpoints.ldaps_urls.join(","));
    }

    cm_builder.build().context(BuildConfigMapSnafu)
}

/// The credentials Secret published for one provisioned bind account.
/// Carries the endpoint data as well, so a consumer only needs to mount a
/// single object.
pub fn build_bind_account_secret(
    glauth: &v1alpha1::GlauthCluster,
    object_labels: ObjectLabels<v1alpha1::GlauthCluster>,
    endpoints: &LdapEndpoints,
    account: &BindAccount,
) -> Result<Secret> {
    let password = account
        .password
        .as_deref()
        .with_context(|| MissingBindPasswordSnafu {
            account: account.cn.clone(),
        })?;

    let mut data = BTreeMap::from([
        (
            DISCOVERY_LDAP_URLS_KEY.to_string(),
            endpoints.urls.join(","),
        ),
        (DISCOVERY_BASE_DN_KEY.to_string(), endpoints.base_dn.clone()),
        (
            DISCOVERY_STARTTLS_KEY.to_string(),
            endpoints.starttls.to_string(),
        ),
        (
            SECRET_BIND_DN_KEY.to_string(),
            account.bind_dn(&endpoints.base_dn),
        ),
        (SECRET_BIND_PASSWORD_KEY.to_string(), password.to_string()),
        (SECRET_AUTH_METHOD_KEY.to_string(), AUTH_METHOD.to_string()),
    ]);
    if !endpoints.ldaps_urls.is_empty() {
        data.insert(
            DISCOVERY_LDAPS_URLS_KEY.to_string(),
            endpoints.ldaps_urls.join(","),
        );
    }

    Ok(Secret {
        metadata: ObjectMetaBuilder::new()
            .name_and_namespace(glauth)
            .name(glauth.bind_account_secret_name(&account.cn))
            .ownerreference_from_resource(glauth, None, Some(true))
            .context(ObjectMissingMetadataForOwnerRefSnafu)?
            .with_recommended_labels(object_labels)
            .context(MetadataBuildSnafu)?
            .build(),
        string_data: Some(data),
        ..Secret::default()
    })
}

/// The auxiliary Secret mirroring the backend database connection for tooling
/// that maintains directory content directly, e.g. schema migrators.
pub fn build_auxiliary_secret(
    glauth: &v1alpha1::GlauthCluster,
    object_labels: ObjectLabels<v1alpha1::GlauthCluster>,
    database_config: &DatabaseConfig,
) -> Result<Secret> {
    Ok(Secret {
        metadata: ObjectMetaBuilder::new()
            .name_and_namespace(glauth)
            .name(glauth.auxiliary_secret_name())
            .ownerreference_from_resource(glauth, None, Some(true))
            .context(ObjectMissingMetadataForOwnerRefSnafu)?
            .with_recommended_labels(object_labels)
            .context(MetadataBuildSnafu)?
            .build(),
        string_data: Some(BTreeMap::from([
            (
                AUXILIARY_ENDPOINT_KEY.to_string(),
                database_config.endpoint.clone(),
            ),
            (
                AUXILIARY_DATABASE_KEY.to_string(),
                database_config.database.clone(),
            ),
            (
                AUXILIARY_USERNAME_KEY.to_string(),
                database_config.username.clone(),
            ),
            (
                AUXILIARY_PASSWORD_KEY.to_string(),
                database_config.password.clone(),
            ),
        ])),
        ..Secret::default()
    })
}

/// The ConfigMap fanning the cluster CA certificate out to applications that
/// need to trust the server certificate.
pub fn build_ca_config_map(
    glauth: &v1alpha1::GlauthCluster,
    object_labels: ObjectLabels<v1alpha1::GlauthCluster>,
    certificate_data: &CertificateData,
) -> Result<ConfigMap> {
    ConfigMapBuilder::new()
        .metadata(
            ObjectMetaBuilder::new()
                .name_and_namespace(glauth)
                .name(glauth.ca_config_map_name())
                .ownerreference_from_resource(glauth, None, Some(true))
                .context(ObjectMissingMetadataForOwnerRefSnafu)?
                .with_recommended_labels(object_labels)
                .context(MetadataBuildSnafu)?
                .build(),
        )
        .add_data(CA_CERT_KEY, certificate_data.ca_bundle())
        .build()
        .context(BuildConfigMapSnafu)
}

/// Read the discovery data of the upstream LDAP server the pass-through
/// backend proxies to.
pub async fn read_upstream_ldap(
    client: &Client,
    config_map_name: &str,
    bind_credentials_secret: Option<&str>,
    namespace: &str,
) -> Result<LdapServerConfig> {
    let config_map = client
        .get::<ConfigMap>(config_map_name, namespace)
        .await
        .with_context(|_| GetUpstreamConfigMapSnafu {
            name: config_map_name.to_string(),
        })?;

    let data = config_map.data.clone().unwrap_or_default();
    let raw_urls = data.get(DISCOVERY_LDAP_URLS_KEY).with_context(|| {
        MissingUpstreamConfigMapKeySnafu {
            config_map: ObjectRef::from_obj(&config_map),
            key: DISCOVERY_LDAP_URLS_KEY.to_string(),
        }
    })?;

    let urls = raw_urls
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| {
            Url::parse(url).with_context(|_| ParseUpstreamUrlSnafu {
                url: url.to_string(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    if urls.is_empty() {
        return EmptyUpstreamServerListSnafu {
            config_map: ObjectRef::from_obj(&config_map),
        }
        .fail();
    }

    let (bind_dn, bind_password) = match bind_credentials_secret {
        Some(secret_name) => {
            let secret = client
                .get::<Secret>(secret_name, namespace)
                .await
                .with_context(|_| GetUpstreamBindSecretSnafu {
                    name: secret_name.to_string(),
                })?;
            (
                Some(
                    database::secret_string_value(&secret, SECRET_BIND_DN_KEY)
                        .context(UpstreamBindSecretDataSnafu)?,
                ),
                Some(
                    database::secret_string_value(&secret, SECRET_BIND_PASSWORD_KEY)
                        .context(UpstreamBindSecretDataSnafu)?,
                ),
            )
        }
        None => (None, None),
    };

    Ok(LdapServerConfig {
        urls,
        base_dn: data.get(DISCOVERY_BASE_DN_KEY).cloned(),
        starttls: data
            .get(DISCOVERY_STARTTLS_KEY)
            .map(|value| value == "true")
            .unwrap_or_default(),
        bind_dn,
        bind_password,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> LdapEndpoints {
        LdapEndpoints {
            urls: vec!["ldap://simple-glauth.default.svc.cluster.local:3893".to_string()],
            ldaps_urls: vec![],
            base_dn: "dc=glauth,dc=com".to_string(),
            starttls: true,
        }
    }

    fn glauth() -> v1alpha1::GlauthCluster {
        let input = r#"
        apiVersion: glauth.stackable.tech/v1alpha1
        kind: GlauthCluster
        metadata:
          name: simple-glauth
          namespace: default
          uid: 0b1e30e6-326e-4c1a-868d-ad6e28d3e425
        spec:
          image:
            productVersion: 2.3.2
          clusterConfig:
            database:
              endpoint: postgres.default.svc.cluster.local:5432
              database: glauth
              credentialsSecret: glauth-postgres-credentials
          servers:
            roleGroups:
              default:
                replicas: 1
        "#;
        let deserializer = serde_yaml::Deserializer::from_str(input);
        serde_yaml::with::singleton_map_recursive::deserialize(deserializer).unwrap()
    }

    fn object_labels(
        glauth: &v1alpha1::GlauthCluster,
    ) -> ObjectLabels<'_, v1alpha1::GlauthCluster> {
        ObjectLabels {
            owner: glauth,
            app_name: "glauth",
            app_version: "2.3.2",
            operator_name: "glauth.stackable.tech",
            controller_name: "glauthcluster",
            role: "server",
            role_group: "default",
        }
    }

    #[test]
    fn test_discovery_config_map() {
        let glauth = glauth();
        let cm = build_discovery_config_map(&glauth, object_labels(&glauth), &endpoints()).unwrap();

        let data = cm.data.unwrap();
        assert_eq!(
            data.get(DISCOVERY_LDAP_URLS_KEY).map(String::as_str),
            Some("ldap://simple-glauth.default.svc.cluster.local:3893")
        );
        assert_eq!(
            data.get(DISCOVERY_STARTTLS_KEY).map(String::as_str),
            Some("true")
        );
        // no LDAPS listener, no key
        assert!(!data.contains_key(DISCOVERY_LDAPS_URLS_KEY));
    }

    #[test]
    fn test_bind_account_secret() {
        let glauth = glauth();
        let account = BindAccount {
            cn: "kratos".to_string(),
            ou: "identity".to_string(),
            password: Some("s3cr3t".to_string()),
        };
        let secret =
            build_bind_account_secret(&glauth, object_labels(&glauth), &endpoints(), &account)
                .unwrap();

        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("simple-glauth-bind-kratos")
        );
        let data = secret.string_data.unwrap();
        assert_eq!(
            data.get(SECRET_BIND_DN_KEY).map(String::as_str),
            Some("cn=kratos,ou=identity,dc=glauth,dc=com")
        );
        assert_eq!(
            data.get(SECRET_AUTH_METHOD_KEY).map(String::as_str),
            Some("simple")
        );
    }

    #[test]
    fn test_bind_account_secret_requires_password() {
        let glauth = glauth();
        let account = BindAccount {
            cn: "kratos".to_string(),
            ou: "identity".to_string(),
            password: None,
        };

        assert!(matches!(
            build_bind_account_secret(&glauth, object_labels(&glauth), &endpoints(), &account),
            Err(Error::MissingBindPassword { .. })
        ));
    }
}
