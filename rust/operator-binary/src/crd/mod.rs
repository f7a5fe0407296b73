pub mod affinity;
pub mod tls;

use std::collections::BTreeMap;

use affinity::get_affinity;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    commons::{
        affinity::StackableAffinity,
        cluster_operation::ClusterOperation,
        product_image_selection::ProductImage,
        resources::{
            CpuLimitsFragment, MemoryLimitsFragment, NoRuntimeLimits, NoRuntimeLimitsFragment,
            Resources, ResourcesFragment,
        },
    },
    config::{
        fragment::{self, Fragment, ValidationError},
        merge::Merge,
    },
    k8s_openapi::apimachinery::pkg::api::resource::Quantity,
    kube::{CustomResource, ResourceExt, runtime::reflector::ObjectRef},
    product_config_utils::{self, Configuration},
    product_logging::{self, spec::Logging},
    role_utils::{GenericRoleConfig, Role, RoleGroupRef},
    schemars::{self, JsonSchema},
    status::condition::{ClusterCondition, HasStatusCondition},
    time::Duration,
    utils::cluster_info::KubernetesClusterInfo,
    versioned::versioned,
};
use tls::GlauthTls;

pub const APP_NAME: &str = "glauth";

pub const LDAP_PORT_NAME: &str = "ldap";
pub const LDAP_PORT: u16 = 3893;
pub const LDAPS_PORT_NAME: &str = "ldaps";
pub const LDAPS_PORT: u16 = 3894;
pub const METRICS_PORT_NAME: &str = "metrics";
pub const METRICS_PORT: u16 = 5555;

pub const STACKABLE_LOG_DIR: &str = "/stackable/log";

pub const DEFAULT_BASE_DN: &str = "dc=glauth,dc=com";

const DEFAULT_SERVER_GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_minutes_unchecked(2);

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("the GLAuth role [{role}] is missing from spec"))]
    MissingGlauthRole { role: String },

    #[snafu(display("fragment validation failure"))]
    FragmentValidationFailure { source: ValidationError },
}

#[versioned(version(name = "v1alpha1"))]
pub mod versioned {
    /// A GLAuth LDAP server stacklet. This resource is managed by the Stackable operator for
    /// GLAuth. Find more information on how to use it and the resources that the operator
    /// generates in the [operator documentation](DOCS_BASE_URL_PLACEHOLDER/glauth/).
    #[versioned(k8s(
        group = "glauth.stackable.tech",
        shortname = "glauth",
        status = "GlauthStatus",
        namespaced,
        crates(
            kube_core = "stackable_operator::kube::core",
            k8s_openapi = "stackable_operator::k8s_openapi",
            schemars = "stackable_operator::schemars"
        )
    ))]
    #[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GlauthClusterSpec {
        /// Settings that affect all roles and role groups.
        /// The settings in the `clusterConfig` are cluster wide settings that do not need to be
        /// configurable at role or role group level.
        pub cluster_config: v1alpha1::GlauthClusterConfig,

        // no doc - docs in Role struct.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub servers: Option<Role<GlauthConfigFragment>>,

        // no doc - docs in ProductImage struct.
        pub image: ProductImage,

        // no doc - docs in ClusterOperation struct.
        #[serde(default)]
        pub cluster_operation: ClusterOperation,
    }

    #[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GlauthClusterConfig {
        /// The base distinguished name the directory tree is rooted at,
        /// e.g. `dc=example,dc=com`.
        #[serde(default = "default_base_dn")]
        pub base_dn: String,

        /// Whether the root DSE may be read without authentication.
        /// Some clients probe the root DSE to discover server capabilities before binding.
        #[serde(default)]
        pub anonymous_dse: bool,

        /// TLS settings for the LDAP and LDAPS listeners.
        #[serde(default)]
        pub tls: GlauthTls,

        #[serde(flatten)]
        pub backend: GlauthBackend,

        /// LDAP bind accounts the operator provisions in the backend database.
        /// For every entry a credentials Secret `<cluster>-bind-<name>` is published.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub bind_accounts: Vec<BindAccountConfig>,

        /// Name of the Vector aggregator [discovery ConfigMap](DOCS_BASE_URL_PLACEHOLDER/concepts/service_discovery).
        /// It must contain the key `ADDRESS` with the address of the Vector aggregator.
        /// Follow the [logging tutorial](DOCS_BASE_URL_PLACEHOLDER/tutorials/logging-vector-aggregator)
        /// to learn how to configure log aggregation with Vector.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub vector_aggregator_config_map_name: Option<String>,

        /// The name of the [ListenerClass](DOCS_BASE_URL_PLACEHOLDER/listener-operator/listenerclass.html)
        /// used to expose the LDAP port outside of Kubernetes.
        #[serde(default = "default_listener_class")]
        pub listener_class: String,
    }

    /// GLAuth stores its directory entries either in a PostgreSQL database or proxies all
    /// requests to an upstream LDAP server. Exactly one of the two variants must be configured.
    #[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
    #[serde(untagged)]
    pub enum GlauthBackend {
        #[serde(rename_all = "camelCase")]
        Database {
            /// Connection settings for the PostgreSQL database holding the `users`,
            /// `ldapgroups` and `capabilities` tables of the GLAuth schema.
            database: DatabaseConnection,
        },
        #[serde(rename_all = "camelCase")]
        PassThrough {
            /// Name of the discovery ConfigMap of the upstream LDAP server to proxy
            /// requests to. Must contain the key `LDAP_URLS`.
            ldap_config_map_name: String,

            /// Name of a Secret with `LDAP_BIND_DN` and `LDAP_BIND_PASSWORD` keys for the
            /// upstream server. Its bind account is handed out to downstream consumers
            /// instead of provisioning accounts locally.
            #[serde(skip_serializing_if = "Option::is_none")]
            ldap_bind_credentials_secret: Option<String>,
        },
    }

    #[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct DatabaseConnection {
        /// Host and port of the PostgreSQL server,
        /// e.g. `postgres.default.svc.cluster.local:5432`.
        pub endpoint: String,

        /// Name of the database the GLAuth schema lives in.
        pub database: String,

        /// Name of the Secret holding the `username` and `password` keys used to connect.
        pub credentials_secret: String,
    }

    #[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct BindAccountConfig {
        /// Common name (`cn`) of the bind account.
        pub name: String,

        /// Organizational unit (`ou`) the account is placed in.
        pub group: String,
    }
}

fn default_base_dn() -> String {
    DEFAULT_BASE_DN.to_owned()
}

fn default_listener_class() -> String {
    "cluster-internal".to_owned()
}

impl HasStatusCondition for v1alpha1::GlauthCluster {
    fn conditions(&self) -> Vec<ClusterCondition> {
        match &self.status {
            Some(status) => status.conditions.clone(),
            None => vec![],
        }
    }
}

impl v1alpha1::GlauthCluster {
    /// The name of the role-level load-balanced Kubernetes `Service`
    pub fn server_role_service_name(&self) -> String {
        self.name_any()
    }

    /// The fully-qualified domain name of the role-level load-balanced Kubernetes `Service`
    pub fn server_role_service_fqdn(&self, cluster_info: &KubernetesClusterInfo) -> Option<String> {
        Some(format!(
            "{}.{}.svc.{}",
            self.server_role_service_name(),
            self.metadata.namespace.as_ref()?,
            cluster_info.cluster_domain,
        ))
    }

    /// Metadata about a server rolegroup
    pub fn server_rolegroup_ref(&self, group_name: impl Into<String>) -> RoleGroupRef<Self> {
        RoleGroupRef {
            cluster: ObjectRef::from_obj(self),
            role: GlauthRole::Server.to_string(),
            role_group: group_name.into(),
        }
    }

    pub fn role_config(&self, role: &GlauthRole) -> Option<&GenericRoleConfig> {
        match role {
            GlauthRole::Server => self.spec.servers.as_ref().map(|s| &s.role_config),
        }
    }

    pub fn base_dn(&self) -> &str {
        &self.spec.cluster_config.base_dn
    }

    /// Name of the Secret holding the operator-managed certificate authority.
    pub fn ca_secret_name(&self) -> String {
        format!("{}-ca", self.name_any())
    }

    /// Name of the `kubernetes.io/tls` Secret holding the issued server certificate.
    pub fn server_tls_secret_name(&self) -> String {
        format!("{}-server-tls", self.name_any())
    }

    /// Name of the published credentials Secret for a provisioned bind account.
    pub fn bind_account_secret_name(&self, account_name: &str) -> String {
        format!("{}-bind-{}", self.name_any(), account_name)
    }

    /// Name of the Secret mirroring the backend database credentials for
    /// tooling that writes directory content directly.
    pub fn auxiliary_secret_name(&self) -> String {
        format!("{}-auxiliary", self.name_any())
    }

    /// Name of the ConfigMap the cluster CA certificate is fanned out to.
    pub fn ca_config_map_name(&self) -> String {
        format!("{}-ca-cert", self.name_any())
    }

    /// Retrieve and merge resource configs for role and role groups
    pub fn merged_config(&self, role: &GlauthRole, role_group: &str) -> Result<GlauthConfig, Error> {
        // Initialize the result with all default values as baseline
        let conf_defaults = GlauthConfig::default_config(&self.name_any(), role);

        let role = self.spec.servers.as_ref().context(MissingGlauthRoleSnafu {
            role: role.to_string(),
        })?;

        // Retrieve role resource config
        let mut conf_role = role.config.config.to_owned();

        // Retrieve rolegroup specific resource config
        let mut conf_rolegroup = role
            .role_groups
            .get(role_group)
            .map(|rg| rg.config.config.clone())
            .unwrap_or_default();

        // Merge more specific configs into default config
        // Hierarchy is:
        // 1. RoleGroup
        // 2. Role
        // 3. Default
        conf_role.merge(&conf_defaults);
        conf_rolegroup.merge(&conf_role);

        tracing::debug!("Merged config: {:?}", conf_rolegroup);
        fragment::validate(conf_rolegroup).context(FragmentValidationFailureSnafu)
    }
}

#[derive(strum::Display)]
#[strum(serialize_all = "camelCase")]
pub enum GlauthRole {
    #[strum(serialize = "server")]
    Server,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct GlauthStatus {
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
}

#[derive(
    Clone,
    Debug,
    Deserialize,
    strum::Display,
    Eq,
    strum::EnumIter,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Container {
    Glauth,
    Vector,
}

#[derive(Clone, Debug, Default, Fragment, JsonSchema, PartialEq)]
#[fragment_attrs(
    derive(
        Clone,
        Debug,
        Default,
        Deserialize,
        Merge,
        JsonSchema,
        PartialEq,
        Serialize
    ),
    serde(rename_all = "camelCase")
)]
pub struct GlauthConfig {
    #[fragment_attrs(serde(default))]
    pub logging: Logging<Container>,

    /// Resource usage is configured here, this includes CPU usage, memory usage and disk storage
    /// usage. GLAuth keeps no local state, so no persistent volumes are requested.
    #[fragment_attrs(serde(default))]
    pub resources: Resources<GlauthStorageConfig, NoRuntimeLimits>,

    #[fragment_attrs(serde(default))]
    pub affinity: StackableAffinity,

    /// Time period Pods have to gracefully shut down, e.g. `30m`, `1h` or `2d`. Consult the
    /// operator documentation for details.
    #[fragment_attrs(serde(default))]
    pub graceful_shutdown_timeout: Option<Duration>,
}

impl GlauthConfig {
    pub fn default_config(cluster_name: &str, role: &GlauthRole) -> GlauthConfigFragment {
        GlauthConfigFragment {
            logging: product_logging::spec::default_logging(),
            resources: ResourcesFragment {
                cpu: CpuLimitsFragment {
                    min: Some(Quantity("100m".to_string())),
                    max: Some(Quantity("400m".to_string())),
                },
                memory: MemoryLimitsFragment {
                    limit: Some(Quantity("512Mi".to_string())),
                    runtime_limits: NoRuntimeLimitsFragment {},
                },
                storage: GlauthStorageConfigFragment {},
            },
            affinity: get_affinity(cluster_name, role),
            graceful_shutdown_timeout: Some(DEFAULT_SERVER_GRACEFUL_SHUTDOWN_TIMEOUT),
        }
    }
}

impl Configuration for GlauthConfigFragment {
    type Configurable = v1alpha1::GlauthCluster;

    fn compute_env(
        &self,
        _resource: &Self::Configurable,
        _role_name: &str,
    ) -> Result<BTreeMap<String, Option<String>>, product_config_utils::Error> {
        Ok(BTreeMap::new())
    }

    fn compute_cli(
        &self,
        _resource: &Self::Configurable,
        _role_name: &str,
    ) -> Result<BTreeMap<String, Option<String>>, product_config_utils::Error> {
        Ok(BTreeMap::new())
    }

    fn compute_files(
        &self,
        _resource: &Self::Configurable,
        _role_name: &str,
        _file: &str,
    ) -> Result<BTreeMap<String, Option<String>>, product_config_utils::Error> {
        Ok(BTreeMap::new())
    }
}

#[derive(Clone, Debug, Default, JsonSchema, PartialEq, Fragment)]
#[fragment_attrs(
    derive(
        Clone,
        Debug,
        Default,
        Deserialize,
        Merge,
        JsonSchema,
        PartialEq,
        Serialize
    ),
    serde(rename_all = "camelCase")
)]
pub struct GlauthStorageConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_variants() {
        let input = r#"
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
        "#;
        let deserializer = serde_yaml::Deserializer::from_str(input);
        let glauth: v1alpha1::GlauthCluster =
            serde_yaml::with::singleton_map_recursive::deserialize(deserializer).unwrap();

        assert!(matches!(
            glauth.spec.cluster_config.backend,
            v1alpha1::GlauthBackend::Database { .. }
        ));
        assert_eq!(glauth.base_dn(), DEFAULT_BASE_DN);
        assert!(glauth.spec.cluster_config.tls.starttls_enabled);
        assert!(!glauth.spec.cluster_config.tls.ldaps_enabled);

        let input = r#"
        apiVersion: glauth.stackable.tech/v1alpha1
        kind: GlauthCluster
        metadata:
          name: proxy-glauth
        spec:
          image:
            productVersion: 2.3.2
          clusterConfig:
            baseDn: dc=example,dc=org
            ldapConfigMapName: upstream-ldap
            ldapBindCredentialsSecret: upstream-ldap-bind
          servers:
            roleGroups:
              default:
                replicas: 1
        "#;
        let deserializer = serde_yaml::Deserializer::from_str(input);
        let glauth: v1alpha1::GlauthCluster =
            serde_yaml::with::singleton_map_recursive::deserialize(deserializer).unwrap();

        assert!(matches!(
            glauth.spec.cluster_config.backend,
            v1alpha1::GlauthBackend::PassThrough { .. }
        ));
        assert_eq!(glauth.base_dn(), "dc=example,dc=org");
    }
}
