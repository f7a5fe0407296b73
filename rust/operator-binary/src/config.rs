//! Rendering of the GLAuth configuration file.
//!
//! The file is assembled as `section -> key -> raw TOML value` so that
//! user-supplied config overrides can be layered on top of the generated
//! values before anything is written out. Output is deterministic: sections
//! and keys are emitted in alphabetical order.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Write,
};

use product_config::{ProductConfigManager, types::PropertyNameKind};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use stackable_operator::{
    product_config_utils::{
        ValidatedRoleConfigByPropertyKind, transform_all_roles_to_config,
        validate_all_roles_and_groups_config,
    },
    role_utils::Role,
};
use url::Url;

use crate::{
    crd::{GlauthConfigFragment, GlauthRole, LDAP_PORT, LDAPS_PORT, METRICS_PORT, v1alpha1},
    security::tls::{TLS_CERT_PATH, TLS_KEY_PATH},
};

pub const GLAUTH_CONFIG_DIRECTORY: &str = "/stackable/config";
pub const GLAUTH_CONFIG_MOUNT_DIRECTORY: &str = "/stackable/mount/config";
pub const GLAUTH_CONFIG_FILE: &str = "glauth.cfg";

pub const DB_PASSWORD_ENV: &str = "DB_PASSWORD";
pub const DB_PASSWORD_PLACEHOLDER: &str = "@@DB_PASSWORD@@";

// Path the GLAuth container image ships the postgres backend plugin at.
const GLAUTH_POSTGRES_PLUGIN: &str = "/app/postgres.so";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("invalid product config"))]
    InvalidProductConfig {
        source: stackable_operator::product_config_utils::Error,
    },

    #[snafu(display("failed to transform product configs"))]
    ProductConfigTransform {
        source: stackable_operator::product_config_utils::Error,
    },

    #[snafu(display("the pass-through backend has no upstream servers to proxy to"))]
    EmptyPassThroughServers,

    #[snafu(display(
        "config override key [{key}] has no section, expected e.g. `behaviors.{key}`"
    ))]
    OverrideKeyWithoutSection { key: String },
}

/// The backend with all external references (credentials Secret, upstream
/// discovery ConfigMap) already resolved.
#[derive(Clone, Debug, PartialEq)]
pub enum ResolvedBackend {
    /// The PostgreSQL plugin backend. The DSN carries the
    /// [`DB_PASSWORD_PLACEHOLDER`] instead of the real password, which is
    /// substituted from a Secret-backed env var at container start.
    Database { dsn: String },

    /// The LDAP pass-through backend proxying to upstream servers.
    PassThrough { servers: Vec<Url> },
}

/// Create the GLAuth config file contents.
pub fn build_glauth_config(
    glauth: &v1alpha1::GlauthCluster,
    backend: &ResolvedBackend,
    overrides: BTreeMap<String, String>,
) -> Result<String> {
    let cluster_config = &glauth.spec.cluster_config;
    let tls = &cluster_config.tls;

    let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();

    let ldap = sections.entry("ldap".to_string()).or_default();
    ldap.insert("enabled".to_string(), "true".to_string());
    ldap.insert(
        "listen".to_string(),
        toml_string(&format!("0.0.0.0:{LDAP_PORT}")),
    );
    ldap.insert("tls".to_string(), tls.starttls_enabled.to_string());
    if tls.starttls_enabled {
        ldap.insert("tlsCertPath".to_string(), toml_string(TLS_CERT_PATH));
        ldap.insert("tlsKeyPath".to_string(), toml_string(TLS_KEY_PATH));
    }

    let ldaps = sections.entry("ldaps".to_string()).or_default();
    ldaps.insert("enabled".to_string(), tls.ldaps_enabled.to_string());
    if tls.ldaps_enabled {
        ldaps.insert(
            "listen".to_string(),
            toml_string(&format!("0.0.0.0:{LDAPS_PORT}")),
        );
        ldaps.insert("cert".to_string(), toml_string(TLS_CERT_PATH));
        ldaps.insert("key".to_string(), toml_string(TLS_KEY_PATH));
    }

    let backend_section = sections.entry("backend".to_string()).or_default();
    backend_section.insert(
        "baseDN".to_string(),
        toml_string(&cluster_config.base_dn),
    );
    match backend {
        ResolvedBackend::Database { dsn } => {
            backend_section.insert("datastore".to_string(), toml_string("plugin"));
            backend_section.insert("plugin".to_string(), toml_string(GLAUTH_POSTGRES_PLUGIN));
            backend_section.insert("database".to_string(), toml_string(dsn));
            backend_section.insert(
                "anonymousdse".to_string(),
                cluster_config.anonymous_dse.to_string(),
            );
        }
        ResolvedBackend::PassThrough { servers } => {
            ensure!(!servers.is_empty(), EmptyPassThroughServersSnafu);
            backend_section.insert("datastore".to_string(), toml_string("ldap"));
            backend_section.insert(
                "servers".to_string(),
                format!(
                    "[{}]",
                    servers
                        .iter()
                        .map(|url| toml_string(url.as_str().trim_end_matches('/')))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            );
            backend_section.insert(
                "anonymousdse".to_string(),
                cluster_config.anonymous_dse.to_string(),
            );
        }
    }

    // Bind accounts only get the capabilities explicitly granted during provisioning.
    sections
        .entry("behaviors".to_string())
        .or_default()
        .insert("IgnoreCapabilities".to_string(), "false".to_string());

    let api = sections.entry("api".to_string()).or_default();
    api.insert("enabled".to_string(), "true".to_string());
    api.insert("internals".to_string(), "true".to_string());
    api.insert("tls".to_string(), "false".to_string());
    api.insert(
        "listen".to_string(),
        toml_string(&format!("0.0.0.0:{METRICS_PORT}")),
    );

    // configOverrides come last; keys are `section.key` paths, values are raw TOML
    for (key, value) in overrides {
        let (section, key) = key
            .split_once('.')
            .with_context(|| OverrideKeyWithoutSectionSnafu { key: key.clone() })?;
        sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    Ok(format_sections(&sections))
}

/// Defines all required roles and their required configuration. GLAuth has a
/// single config file; env overrides are passed through to the container.
///
/// The roles and their configs are then validated and complemented by the product config.
pub fn validated_product_config(
    resource: &v1alpha1::GlauthCluster,
    version: &str,
    role: &Role<GlauthConfigFragment>,
    product_config: &ProductConfigManager,
) -> Result<ValidatedRoleConfigByPropertyKind> {
    let mut roles = HashMap::new();
    roles.insert(
        GlauthRole::Server.to_string(),
        (
            vec![
                PropertyNameKind::File(GLAUTH_CONFIG_FILE.to_string()),
                PropertyNameKind::Env,
            ],
            role.clone(),
        ),
    );

    let role_config =
        transform_all_roles_to_config(resource, roles).context(ProductConfigTransformSnafu)?;

    validate_all_roles_and_groups_config(version, &role_config, product_config, false, false)
        .context(InvalidProductConfigSnafu)
}

fn toml_string(value: &str) -> String {
    // Debug formatting escapes quotes and backslashes the way TOML basic strings expect
    format!("{value:?}")
}

fn format_sections(sections: &BTreeMap<String, BTreeMap<String, String>>) -> String {
    let mut result = String::new();

    for (section, entries) in sections {
        if !result.is_empty() {
            let _ = writeln!(result);
        }
        let _ = writeln!(result, "[{section}]");
        for (key, value) in entries {
            let _ = writeln!(result, "  {key} = {value}");
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn parse_cluster(input: &str) -> v1alpha1::GlauthCluster {
        let deserializer = serde_yaml::Deserializer::from_str(input);
        serde_yaml::with::singleton_map_recursive::deserialize(deserializer)
            .expect("illegal test input")
    }

    #[test]
    fn test_build_glauth_config_database_defaults() {
        let glauth = parse_cluster(
            r#"
            apiVersion: glauth.stackable.tech/v1alpha1
            kind: GlauthCluster
            metadata:
              name: simple-glauth
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
            "#,
        );
        let backend = ResolvedBackend::Database {
            dsn: "postgresql://glauth:@@DB_PASSWORD@@@postgres.default.svc.cluster.local:5432/glauth".to_string(),
        };

        let config = build_glauth_config(&glauth, &backend, BTreeMap::new()).unwrap();

        assert_eq!(config, indoc! {r#"
            [api]
              enabled = true
              internals = true
              listen = "0.0.0.0:5555"
              tls = false

            [backend]
              anonymousdse = false
              baseDN = "dc=glauth,dc=com"
              database = "postgresql://glauth:@@DB_PASSWORD@@@postgres.default.svc.cluster.local:5432/glauth"
              datastore = "plugin"
              plugin = "/app/postgres.so"

            [behaviors]
              IgnoreCapabilities = false

            [ldap]
              enabled = true
              listen = "0.0.0.0:3893"
              tls = true
              tlsCertPath = "/stackable/tls/tls.crt"
              tlsKeyPath = "/stackable/tls/tls.key"

            [ldaps]
              enabled = false
        "#});
    }

    #[test]
    fn test_build_glauth_config_pass_through_with_ldaps() {
        let glauth = parse_cluster(
            r#"
            apiVersion: glauth.stackable.tech/v1alpha1
            kind: GlauthCluster
            metadata:
              name: proxy-glauth
            spec:
              image:
                productVersion: 2.3.2
              clusterConfig:
                baseDn: dc=example,dc=org
                anonymousDse: true
                tls:
                  starttlsEnabled: false
                  ldapsEnabled: true
                ldapConfigMapName: upstream-ldap
              servers:
                roleGroups:
                  default:
                    replicas: 1
            "#,
        );
        let backend = ResolvedBackend::PassThrough {
            servers: vec![Url::parse("ldap://upstream.example.org:389").unwrap()],
        };

        let config = build_glauth_config(&glauth, &backend, BTreeMap::new()).unwrap();

        assert_eq!(config, indoc! {r#"
            [api]
              enabled = true
              internals = true
              listen = "0.0.0.0:5555"
              tls = false

            [backend]
              anonymousdse = true
              baseDN = "dc=example,dc=org"
              datastore = "ldap"
              servers = ["ldap://upstream.example.org:389"]

            [behaviors]
              IgnoreCapabilities = false

            [ldap]
              enabled = true
              listen = "0.0.0.0:3893"
              tls = false

            [ldaps]
              cert = "/stackable/tls/tls.crt"
              enabled = true
              key = "/stackable/tls/tls.key"
              listen = "0.0.0.0:3894"
        "#});
    }

    #[test]
    fn test_build_glauth_config_overrides_win() {
        let glauth = parse_cluster(
            r#"
            apiVersion: glauth.stackable.tech/v1alpha1
            kind: GlauthCluster
            metadata:
              name: simple-glauth
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
            "#,
        );
        let backend = ResolvedBackend::Database {
            dsn: "postgresql://localhost/glauth".to_string(),
        };
        let overrides = BTreeMap::from([
            ("behaviors.IgnoreCapabilities".to_string(), "true".to_string()),
            ("tracing.enabled".to_string(), "true".to_string()),
        ]);

        let config = build_glauth_config(&glauth, &backend, overrides).unwrap();

        assert!(config.contains("  IgnoreCapabilities = true\n"));
        assert!(config.contains("[tracing]\n  enabled = true\n"));
    }

    #[test]
    fn test_build_glauth_config_rejects_empty_upstream() {
        let glauth = parse_cluster(
            r#"
            apiVersion: glauth.stackable.tech/v1alpha1
            kind: GlauthCluster
            metadata:
              name: proxy-glauth
            spec:
              image:
                productVersion: 2.3.2
              clusterConfig:
                ldapConfigMapName: upstream-ldap
              servers:
                roleGroups:
                  default:
                    replicas: 1
            "#,
        );
        let backend = ResolvedBackend::PassThrough { servers: vec![] };

        assert!(matches!(
            build_glauth_config(&glauth, &backend, BTreeMap::new()),
            Err(Error::EmptyPassThroughServers)
        ));
    }
}
