//! Ensures that `Pod`s are configured and running for each [`v1alpha1::GlauthCluster`]

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Write,
    sync::Arc,
};

use const_format::concatcp;
use product_config::{ProductConfigManager, types::PropertyNameKind};
use sha2::{Digest, Sha256};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    builder::{
        configmap::ConfigMapBuilder,
        meta::ObjectMetaBuilder,
        pod::{PodBuilder, container::ContainerBuilder, resources::ResourceRequirementsBuilder},
    },
    cluster_resources::{ClusterResourceApplyStrategy, ClusterResources},
    commons::product_image_selection::ResolvedProductImage,
    crd::listener::v1alpha1::{Listener, ListenerIngress},
    k8s_openapi::{
        DeepMerge,
        api::{
            apps::v1::{StatefulSet, StatefulSetSpec},
            core::v1::{
                ConfigMap, ConfigMapVolumeSource, EmptyDirVolumeSource, EnvVar, EnvVarSource,
                Probe, SecretKeySelector, TCPSocketAction, Volume,
            },
        },
        apimachinery::pkg::{
            api::resource::Quantity, apis::meta::v1::LabelSelector, util::intstr::IntOrString,
        },
    },
    kube::{
        Resource, ResourceExt,
        core::{DeserializeGuard, error_boundary},
        runtime::controller::Action,
    },
    kvp::{Annotation, Labels, ObjectLabels},
    logging::controller::ReconcilerError,
    product_logging::framework::{
        capture_shell_output, create_vector_shutdown_file_command,
        remove_vector_shutdown_file_command, vector_container,
    },
    role_utils::{GenericRoleConfig, RoleGroupRef},
    status::condition::{
        compute_conditions, operations::ClusterOperationsConditionBuilder,
        statefulset::StatefulSetConditionBuilder,
    },
    time::Duration,
};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    OPERATOR_NAME, config,
    config::{
        DB_PASSWORD_ENV, DB_PASSWORD_PLACEHOLDER, GLAUTH_CONFIG_DIRECTORY, GLAUTH_CONFIG_FILE,
        GLAUTH_CONFIG_MOUNT_DIRECTORY, ResolvedBackend, build_glauth_config,
        validated_product_config,
    },
    crd::{
        APP_NAME, Container, GlauthConfig, GlauthRole, GlauthStatus, LDAP_PORT, LDAP_PORT_NAME,
        LDAPS_PORT, LDAPS_PORT_NAME, METRICS_PORT, METRICS_PORT_NAME, STACKABLE_LOG_DIR, v1alpha1,
    },
    database::{self, DatabaseConfig, DirectoryStore},
    discovery::{self, LdapEndpoints, LdapServerConfig},
    listener::{
        LISTENER_VOLUME_DIR, LISTENER_VOLUME_NAME, build_group_listener, build_group_listener_pvc,
        group_listener_name,
    },
    operations::{graceful_shutdown::add_graceful_shutdown_config, pdb::add_pdbs},
    product_logging::{extend_role_group_config_map, resolve_vector_aggregator_address},
    provision::{self, BindAccount},
    security::{
        certificates::{self, CertificateData},
        tls::{self, TLS_MOUNT_DIR, TLS_VOLUME_NAME},
    },
    service::{
        build_rolegroup_headless_service, build_rolegroup_metrics_service,
        build_server_role_service, rolegroup_headless_service_name,
    },
};

pub const GLAUTH_CONTROLLER_NAME: &str = "glauthcluster";
pub const GLAUTH_FULL_CONTROLLER_NAME: &str = concatcp!(GLAUTH_CONTROLLER_NAME, '.', OPERATOR_NAME);

const FIELD_MANAGER_SCOPE: &str = "glauthcluster";
const DOCKER_IMAGE_BASE_NAME: &str = "glauth";
const CONFIG_HASH_ANNOTATION: &str = "glauth.stackable.tech/config-hash";

const LOG_VOLUME_NAME: &str = "log";
const CONFIG_VOLUME_NAME: &str = "config";
const RW_CONFIG_VOLUME_NAME: &str = "rwconfig";

pub struct Ctx {
    pub client: stackable_operator::client::Client,
    pub product_config: ProductConfigManager,
}

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("GlauthCluster object is invalid"))]
    InvalidGlauthCluster {
        source: error_boundary::InvalidObject,
    },

    #[snafu(display("object defines no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("object has no server role defined"))]
    NoServersDefined,

    #[snafu(display("failed to create cluster resources"))]
    CreateClusterResources {
        source: stackable_operator::cluster_resources::Error,
    },

    #[snafu(display("invalid product config"))]
    InvalidProductConfig { source: config::Error },

    #[snafu(display("failed to resolve the backend database credentials"))]
    ResolveDatabase { source: database::Error },

    #[snafu(display("failed to read the upstream LDAP discovery data"))]
    ReadUpstreamLdap { source: discovery::Error },

    #[snafu(display("failed to connect to the backend database"))]
    ConnectDatabase { source: database::Error },

    #[snafu(display("failed to provision the bind account [{account}]"))]
    ProvisionBindAccount {
        source: provision::Error,
        account: String,
    },

    #[snafu(display("failed to determine the server TLS identities"))]
    BuildServerIdentity { source: tls::Error },

    #[snafu(display("failed to ensure the server certificates"))]
    EnsureCertificates { source: certificates::Error },

    #[snafu(display("failed to remove the server certificates"))]
    RemoveCertificates { source: certificates::Error },

    #[snafu(display("failed to retrieve the Listener [{name}]"))]
    GetListener {
        source: stackable_operator::client::Error,
        name: String,
    },

    #[snafu(display("failed to build the Listener"))]
    BuildListener { source: crate::listener::Error },

    #[snafu(display("failed to apply the Listener"))]
    ApplyListener {
        source: stackable_operator::cluster_resources::Error,
    },

    #[snafu(display("failed to build the config file for {rolegroup}"))]
    BuildConfigFile {
        source: config::Error,
        rolegroup: RoleGroupRef<v1alpha1::GlauthCluster>,
    },

    #[snafu(display("failed to build the discovery objects"))]
    BuildDiscovery { source: discovery::Error },

    #[snafu(display("failed to apply the role Service"))]
    ApplyRoleService {
        source: stackable_operator::cluster_resources::Error,
    },

    #[snafu(display("failed to build the Service"))]
    BuildService { source: crate::service::Error },

    #[snafu(display("failed to apply Service for {rolegroup}"))]
    ApplyRoleGroupService {
        source: stackable_operator::cluster_resources::Error,
        rolegroup: RoleGroupRef<v1alpha1::GlauthCluster>,
    },

    #[snafu(display("failed to build ConfigMap for {rolegroup}"))]
    BuildRoleGroupConfig {
        source: stackable_operator::builder::configmap::Error,
        rolegroup: RoleGroupRef<v1alpha1::GlauthCluster>,
    },

    #[snafu(display("failed to apply ConfigMap for {rolegroup}"))]
    ApplyRoleGroupConfig {
        source: stackable_operator::cluster_resources::Error,
        rolegroup: RoleGroupRef<v1alpha1::GlauthCluster>,
    },

    #[snafu(display("failed to apply StatefulSet for {rolegroup}"))]
    ApplyRoleGroupStatefulSet {
        source: stackable_operator::cluster_resources::Error,
        rolegroup: RoleGroupRef<v1alpha1::GlauthCluster>,
    },

    #[snafu(display("failed to apply the discovery ConfigMap"))]
    ApplyDiscoveryConfigMap {
        source: stackable_operator::cluster_resources::Error,
    },

    #[snafu(display("failed to apply the Secret [{name}]"))]
    ApplySecret {
        source: stackable_operator::client::Error,
        name: String,
    },

    #[snafu(display("failed to delete the orphaned CA ConfigMap"))]
    DeleteCaConfigMap {
        source: stackable_operator::client::Error,
    },

    #[snafu(display("object is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef {
        source: stackable_operator::builder::meta::Error,
    },

    #[snafu(display("failed to build Metadata"))]
    MetadataBuild {
        source: stackable_operator::builder::meta::Error,
    },

    #[snafu(display("failed to build Labels"))]
    LabelBuild {
        source: stackable_operator::kvp::LabelError,
    },

    #[snafu(display("failed to build Annotation"))]
    AnnotationBuild {
        source: stackable_operator::kvp::AnnotationError,
    },

    #[snafu(display("failed to resolve and merge config for role and role group"))]
    FailedToResolveConfig { source: crate::crd::Error },

    #[snafu(display("invalid container name"))]
    IllegalContainerName {
        source: stackable_operator::builder::pod::container::Error,
    },

    #[snafu(display("failed to add needed volume"))]
    AddVolume {
        source: stackable_operator::builder::pod::Error,
    },

    #[snafu(display("failed to add needed volumeMount"))]
    AddVolumeMount {
        source: stackable_operator::builder::pod::container::Error,
    },

    #[snafu(display("failed to configure graceful shutdown"))]
    GracefulShutdown {
        source: crate::operations::graceful_shutdown::Error,
    },

    #[snafu(display("failed to create PodDisruptionBudget"))]
    FailedToCreatePdb {
        source: crate::operations::pdb::Error,
    },

    #[snafu(display("failed to resolve the Vector aggregator address"))]
    ResolveVectorAggregatorAddress {
        source: crate::product_logging::Error,
    },

    #[snafu(display("failed to add the Vector config to the ConfigMap"))]
    InvalidLoggingConfig {
        source: crate::product_logging::Error,
    },

    #[snafu(display("failed to delete orphaned resources"))]
    DeleteOrphanedResources {
        source: stackable_operator::cluster_resources::Error,
    },

    #[snafu(display("failed to update status"))]
    ApplyStatus {
        source: stackable_operator::client::Error,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

pub async fn reconcile_glauth(
    glauth: Arc<DeserializeGuard<v1alpha1::GlauthCluster>>,
    ctx: Arc<Ctx>,
) -> Result<Action> {
    tracing::info!("Starting reconcile");

    let glauth = glauth
        .0
        .as_ref()
        .map_err(error_boundary::InvalidObject::clone)
        .context(InvalidGlauthClusterSnafu)?;
    let client = &ctx.client;
    let namespace = glauth.namespace().context(ObjectHasNoNamespaceSnafu)?;

    let resolved_product_image: ResolvedProductImage = glauth
        .spec
        .image
        .resolve(DOCKER_IMAGE_BASE_NAME, crate::built_info::PKG_VERSION);

    let mut cluster_resources = ClusterResources::new(
        APP_NAME,
        OPERATOR_NAME,
        GLAUTH_CONTROLLER_NAME,
        &glauth.object_ref(&()),
        ClusterResourceApplyStrategy::from(&glauth.spec.cluster_operation),
    )
    .context(CreateClusterResourcesSnafu)?;

    let role = glauth.spec.servers.as_ref().context(NoServersDefinedSnafu)?;
    let validated_config = validated_product_config(
        glauth,
        &resolved_product_image.product_version,
        role,
        &ctx.product_config,
    )
    .context(InvalidProductConfigSnafu)?;
    let server_config = validated_config
        .get(&GlauthRole::Server.to_string())
        .cloned()
        .unwrap_or_default();

    // Resolve the backend before anything is rendered, a half-configured
    // backend must not produce a config file.
    let (resolved_backend, database_config, upstream_ldap) =
        resolve_backend(client, glauth, &namespace).await?;

    // The Listener is applied first so that its addresses can flow into the
    // certificate SANs and the discovery data of the same reconcile run.
    let group_listener_name = group_listener_name(glauth, &GlauthRole::Server.to_string());
    let group_listener = build_group_listener(
        glauth,
        build_recommended_labels(
            glauth,
            &resolved_product_image.app_version_label,
            &GlauthRole::Server.to_string(),
            "none",
        ),
        glauth.spec.cluster_config.listener_class.clone(),
        group_listener_name.clone(),
    )
    .context(BuildListenerSnafu)?;
    cluster_resources
        .add(client, group_listener)
        .await
        .context(ApplyListenerSnafu)?;
    let listener_ingresses =
        listener_ingresses(client, &group_listener_name, &namespace).await?;
    let listener_addresses: Vec<String> = listener_ingresses
        .iter()
        .map(|ingress| ingress.address.clone())
        .collect();

    let tls_enabled = glauth.spec.cluster_config.tls.tls_enabled();
    let certificate_data = if tls_enabled {
        let identity = tls::server_identity(
            glauth,
            &client.kubernetes_cluster_info,
            &listener_addresses,
        )
        .context(BuildServerIdentitySnafu)?;
        Some(
            certificates::ensure_server_certificates(client, glauth, &identity)
                .await
                .context(EnsureCertificatesSnafu)?,
        )
    } else {
        certificates::remove_server_certificates(client, glauth)
            .await
            .context(RemoveCertificatesSnafu)?;
        None
    };

    let endpoints = ldap_endpoints(glauth, client, &listener_ingresses);
    let bind_accounts =
        reconcile_bind_accounts(client, glauth, &database_config, &upstream_ldap, &namespace)
            .await?;

    let vector_aggregator_address = resolve_vector_aggregator_address(glauth, client)
        .await
        .context(ResolveVectorAggregatorAddressSnafu)?;

    let role_service = build_server_role_service(
        glauth,
        build_recommended_labels(
            glauth,
            &resolved_product_image.app_version_label,
            &GlauthRole::Server.to_string(),
            "global",
        ),
        role_selector_labels(glauth, &GlauthRole::Server.to_string())?,
    )
    .context(BuildServiceSnafu)?;
    cluster_resources
        .add(client, role_service)
        .await
        .context(ApplyRoleServiceSnafu)?;

    let mut ss_cond_builder = StatefulSetConditionBuilder::default();

    for (rolegroup_name, rolegroup_config) in server_config.iter() {
        let rolegroup = glauth.server_rolegroup_ref(rolegroup_name);
        let merged_config = glauth
            .merged_config(&GlauthRole::Server, &rolegroup.role_group)
            .context(FailedToResolveConfigSnafu)?;

        let config_file = build_glauth_config(
            glauth,
            &resolved_backend,
            rolegroup_config
                .get(&PropertyNameKind::File(GLAUTH_CONFIG_FILE.to_string()))
                .cloned()
                .unwrap_or_default(),
        )
        .with_context(|_| BuildConfigFileSnafu {
            rolegroup: rolegroup.clone(),
        })?;
        // Roll the pods whenever the effective configuration or the served
        // certificate changes.
        let config_hash = sha256_hex(
            [
                config_file.as_str(),
                certificate_data
                    .as_ref()
                    .map(|data| data.cert.as_str())
                    .unwrap_or_default(),
            ]
            .concat()
            .as_bytes(),
        );

        let rg_headless_service = build_rolegroup_headless_service(
            glauth,
            &rolegroup,
            build_recommended_labels(
                glauth,
                &resolved_product_image.app_version_label,
                &rolegroup.role,
                &rolegroup.role_group,
            ),
            rolegroup_selector_labels(glauth, &rolegroup)?,
        )
        .context(BuildServiceSnafu)?;
        let rg_metrics_service = build_rolegroup_metrics_service(
            glauth,
            &rolegroup,
            build_recommended_labels(
                glauth,
                &resolved_product_image.app_version_label,
                &rolegroup.role,
                &rolegroup.role_group,
            ),
            rolegroup_selector_labels(glauth, &rolegroup)?,
        )
        .context(BuildServiceSnafu)?;
        let rg_configmap = build_server_rolegroup_config_map(
            glauth,
            &resolved_product_image,
            &rolegroup,
            &config_file,
            &merged_config,
            vector_aggregator_address.as_deref(),
        )?;
        let rg_statefulset = build_server_rolegroup_statefulset(
            glauth,
            &resolved_product_image,
            &rolegroup,
            rolegroup_config,
            &merged_config,
            database_config.as_ref(),
            tls_enabled,
            &config_hash,
        )?;

        cluster_resources
            .add(client, rg_headless_service)
            .await
            .with_context(|_| ApplyRoleGroupServiceSnafu {
                rolegroup: rolegroup.clone(),
            })?;
        cluster_resources
            .add(client, rg_metrics_service)
            .await
            .with_context(|_| ApplyRoleGroupServiceSnafu {
                rolegroup: rolegroup.clone(),
            })?;
        cluster_resources
            .add(client, rg_configmap)
            .await
            .with_context(|_| ApplyRoleGroupConfigSnafu {
                rolegroup: rolegroup.clone(),
            })?;
        ss_cond_builder.add(
            cluster_resources
                .add(client, rg_statefulset)
                .await
                .with_context(|_| ApplyRoleGroupStatefulSetSnafu {
                    rolegroup: rolegroup.clone(),
                })?,
        );
    }

    let GenericRoleConfig {
        pod_disruption_budget: pdb,
    } = &role.role_config;
    add_pdbs(
        pdb,
        glauth,
        &GlauthRole::Server,
        client,
        &mut cluster_resources,
    )
    .await
    .context(FailedToCreatePdbSnafu)?;

    publish_discovery(
        client,
        glauth,
        &resolved_product_image,
        &mut cluster_resources,
        &endpoints,
        &bind_accounts,
        database_config.as_ref(),
        certificate_data.as_ref(),
    )
    .await?;

    cluster_resources
        .delete_orphaned_resources(client)
        .await
        .context(DeleteOrphanedResourcesSnafu)?;

    let cluster_operation_cond_builder =
        ClusterOperationsConditionBuilder::new(&glauth.spec.cluster_operation);
    let status = GlauthStatus {
        conditions: compute_conditions(
            glauth,
            &[&ss_cond_builder, &cluster_operation_cond_builder],
        ),
    };
    client
        .apply_patch_status(FIELD_MANAGER_SCOPE, glauth, &status)
        .await
        .context(ApplyStatusSnafu)?;

    Ok(Action::await_change())
}

/// Resolve the configured backend into the data the config renderer and the
/// provisioner need: the placeholder DSN plus full credentials for the
/// database variant, the upstream server list for the pass-through variant.
async fn resolve_backend(
    client: &stackable_operator::client::Client,
    glauth: &v1alpha1::GlauthCluster,
    namespace: &str,
) -> Result<(
    ResolvedBackend,
    Option<DatabaseConfig>,
    Option<LdapServerConfig>,
)> {
    match &glauth.spec.cluster_config.backend {
        v1alpha1::GlauthBackend::Database { database } => {
            let database_config = DatabaseConfig::resolve(client, database, namespace)
                .await
                .context(ResolveDatabaseSnafu)?;
            let backend = ResolvedBackend::Database {
                dsn: database_config.dsn_with_password(DB_PASSWORD_PLACEHOLDER),
            };
            Ok((backend, Some(database_config), None))
        }
        v1alpha1::GlauthBackend::PassThrough {
            ldap_config_map_name,
            ldap_bind_credentials_secret,
        } => {
            let upstream = discovery::read_upstream_ldap(
                client,
                ldap_config_map_name,
                ldap_bind_credentials_secret.as_deref(),
                namespace,
            )
            .await
            .context(ReadUpstreamLdapSnafu)?;
            let backend = ResolvedBackend::PassThrough {
                servers: upstream.urls.clone(),
            };
            Ok((backend, None, Some(upstream)))
        }
    }
}

/// Provision the configured bind accounts.
///
/// With the database backend every account is ensured in the backing database
/// and its password reconciled with the published Secret. In pass-through mode
/// nothing can be provisioned locally, the upstream bind account is handed out
/// instead.
async fn reconcile_bind_accounts(
    client: &stackable_operator::client::Client,
    glauth: &v1alpha1::GlauthCluster,
    database_config: &Option<DatabaseConfig>,
    upstream_ldap: &Option<LdapServerConfig>,
    namespace: &str,
) -> Result<Vec<BindAccount>> {
    let account_configs = &glauth.spec.cluster_config.bind_accounts;

    match (database_config, upstream_ldap) {
        (Some(database_config), _) => {
            if account_configs.is_empty() {
                return Ok(Vec::new());
            }

            let store = DirectoryStore::connect(&database_config.dsn())
                .await
                .context(ConnectDatabaseSnafu)?;
            let mut accounts = Vec::with_capacity(account_configs.len());
            for account_config in account_configs {
                accounts.push(
                    provision::reconcile_bind_account(
                        client,
                        glauth,
                        &store,
                        account_config,
                        namespace,
                    )
                    .await
                    .with_context(|_| ProvisionBindAccountSnafu {
                        account: account_config.name.clone(),
                    })?,
                );
            }
            store.close().await;
            Ok(accounts)
        }
        (None, Some(upstream)) => {
            if !account_configs.is_empty() {
                tracing::warn!(
                    "bind accounts cannot be provisioned with the pass-through backend, \
                     handing out the upstream bind account instead"
                );
            }
            Ok(upstream
                .bind_dn
                .as_deref()
                .map(|bind_dn| {
                    provision::bind_account_from_bind_dn(bind_dn, upstream.bind_password.clone())
                })
                .into_iter()
                .collect())
        }
        (None, None) => Ok(Vec::new()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn publish_discovery(
    client: &stackable_operator::client::Client,
    glauth: &v1alpha1::GlauthCluster,
    resolved_product_image: &ResolvedProductImage,
    cluster_resources: &mut ClusterResources,
    endpoints: &LdapEndpoints,
    bind_accounts: &[BindAccount],
    database_config: Option<&DatabaseConfig>,
    certificate_data: Option<&CertificateData>,
) -> Result<()> {
    let object_labels = build_recommended_labels(
        glauth,
        &resolved_product_image.app_version_label,
        &GlauthRole::Server.to_string(),
        "discovery",
    );

    let discovery_cm = discovery::build_discovery_config_map(glauth, object_labels.clone(), endpoints)
        .context(BuildDiscoverySnafu)?;
    cluster_resources
        .add(client, discovery_cm)
        .await
        .context(ApplyDiscoveryConfigMapSnafu)?;

    for account in bind_accounts {
        if account.password.is_none() {
            tracing::warn!(
                account = %account.cn,
                "bind account has no password to publish, skipping its credentials Secret"
            );
            continue;
        }
        let secret =
            discovery::build_bind_account_secret(glauth, object_labels.clone(), endpoints, account)
                .context(BuildDiscoverySnafu)?;
        let name = secret.name_any();
        client
            .apply_patch(FIELD_MANAGER_SCOPE, &secret, &secret)
            .await
            .with_context(|_| ApplySecretSnafu { name })?;
    }

    if let Some(database_config) = database_config {
        let secret =
            discovery::build_auxiliary_secret(glauth, object_labels.clone(), database_config)
                .context(BuildDiscoverySnafu)?;
        let name = secret.name_any();
        client
            .apply_patch(FIELD_MANAGER_SCOPE, &secret, &secret)
            .await
            .with_context(|_| ApplySecretSnafu { name })?;
    }

    match certificate_data {
        Some(certificate_data) => {
            let ca_cm =
                discovery::build_ca_config_map(glauth, object_labels, certificate_data)
                    .context(BuildDiscoverySnafu)?;
            cluster_resources
                .add(client, ca_cm)
                .await
                .context(ApplyDiscoveryConfigMapSnafu)?;
        }
        None => {
            // TLS was switched off, withdraw the fan-out
            let namespace = glauth.namespace().context(ObjectHasNoNamespaceSnafu)?;
            if let Some(ca_cm) = client
                .get_opt::<ConfigMap>(&glauth.ca_config_map_name(), &namespace)
                .await
                .context(DeleteCaConfigMapSnafu)?
            {
                client
                    .delete(&ca_cm)
                    .await
                    .context(DeleteCaConfigMapSnafu)?;
            }
        }
    }

    Ok(())
}

/// The rolegroup [`ConfigMap`] with the rendered `glauth.cfg` and the Vector
/// agent configuration.
fn build_server_rolegroup_config_map(
    glauth: &v1alpha1::GlauthCluster,
    resolved_product_image: &ResolvedProductImage,
    rolegroup: &RoleGroupRef<v1alpha1::GlauthCluster>,
    config_file: &str,
    merged_config: &GlauthConfig,
    vector_aggregator_address: Option<&str>,
) -> Result<ConfigMap> {
    let mut cm_builder = ConfigMapBuilder::new();
    cm_builder
        .metadata(
            ObjectMetaBuilder::new()
                .name_and_namespace(glauth)
                .name(rolegroup.object_name())
                .ownerreference_from_resource(glauth, None, Some(true))
                .context(ObjectMissingMetadataForOwnerRefSnafu)?
                .with_recommended_labels(build_recommended_labels(
                    glauth,
                    &resolved_product_image.app_version_label,
                    &rolegroup.role,
                    &rolegroup.role_group,
                ))
                .context(MetadataBuildSnafu)?
                .build(),
        )
        .add_data(GLAUTH_CONFIG_FILE, config_file);

    extend_role_group_config_map(
        rolegroup,
        vector_aggregator_address,
        &merged_config.logging,
        &mut cm_builder,
    )
    .context(InvalidLoggingConfigSnafu)?;

    cm_builder.build().with_context(|_| BuildRoleGroupConfigSnafu {
        rolegroup: rolegroup.clone(),
    })
}

/// The rolegroup [`StatefulSet`] runs the rolegroup, as configured by the
/// administrator.
///
/// The [`Pod`](`stackable_operator::k8s_openapi::api::core::v1::Pod`)s are
/// accessible through the corresponding headless [`Service`](`stackable_operator::k8s_openapi::api::core::v1::Service`).
#[allow(clippy::too_many_arguments)]
fn build_server_rolegroup_statefulset(
    glauth: &v1alpha1::GlauthCluster,
    resolved_product_image: &ResolvedProductImage,
    rolegroup_ref: &RoleGroupRef<v1alpha1::GlauthCluster>,
    rolegroup_config: &HashMap<PropertyNameKind, BTreeMap<String, String>>,
    merged_config: &GlauthConfig,
    database_config: Option<&DatabaseConfig>,
    tls_enabled: bool,
    config_hash: &str,
) -> Result<StatefulSet> {
    let role = glauth.spec.servers.as_ref().context(NoServersDefinedSnafu)?;
    let rolegroup = role.role_groups.get(&rolegroup_ref.role_group);

    let glauth_container_name = Container::Glauth.to_string();
    let mut container_builder =
        ContainerBuilder::new(&glauth_container_name).context(IllegalContainerNameSnafu)?;

    // env overrides
    let mut env_vars: Vec<EnvVar> = rolegroup_config
        .get(&PropertyNameKind::Env)
        .into_iter()
        .flatten()
        .map(|(k, v)| EnvVar {
            name: k.clone(),
            value: Some(v.clone()),
            ..EnvVar::default()
        })
        .collect();

    let mut args = Vec::new();
    if merged_config.logging.enable_vector_agent {
        args.push(remove_vector_shutdown_file_command(STACKABLE_LOG_DIR));
    }
    if let Some(log_config) = merged_config
        .logging
        .containers
        .get(&Container::Glauth)
        .and_then(|config| match &config.choice {
            Some(stackable_operator::product_logging::spec::ContainerLogConfigChoice::Automatic(
                log_config,
            )) => Some(log_config),
            _ => None,
        })
    {
        args.push(capture_shell_output(
            STACKABLE_LOG_DIR,
            &glauth_container_name,
            log_config,
        ));
    }
    args.push(format!("mkdir -p {GLAUTH_CONFIG_DIRECTORY}"));
    args.push(format!(
        "cp {GLAUTH_CONFIG_MOUNT_DIRECTORY}/{GLAUTH_CONFIG_FILE} {GLAUTH_CONFIG_DIRECTORY}/{GLAUTH_CONFIG_FILE}"
    ));
    if let Some(database_config) = database_config {
        // The rendered config never contains the real password, it is
        // substituted from the credentials Secret at container start.
        args.push(format!(
            "sed -i \"s|{DB_PASSWORD_PLACEHOLDER}|${{{DB_PASSWORD_ENV}}}|g\" {GLAUTH_CONFIG_DIRECTORY}/{GLAUTH_CONFIG_FILE}"
        ));
        env_vars.push(EnvVar {
            name: DB_PASSWORD_ENV.to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: database_config_credentials_secret(glauth),
                    key: database::CREDENTIALS_SECRET_PASSWORD_KEY.to_string(),
                    ..SecretKeySelector::default()
                }),
                ..EnvVarSource::default()
            }),
            ..EnvVar::default()
        });
    }
    args.push(format!(
        "glauth -c {GLAUTH_CONFIG_DIRECTORY}/{GLAUTH_CONFIG_FILE}"
    ));
    if merged_config.logging.enable_vector_agent {
        args.push(create_vector_shutdown_file_command(STACKABLE_LOG_DIR));
    }

    container_builder
        .image_from_product_image(resolved_product_image)
        .command(vec!["/bin/bash".to_string(), "-c".to_string()])
        .args(vec![args.join(" && ")])
        .add_env_vars(env_vars)
        .add_volume_mount(CONFIG_VOLUME_NAME, GLAUTH_CONFIG_MOUNT_DIRECTORY)
        .context(AddVolumeMountSnafu)?
        .add_volume_mount(RW_CONFIG_VOLUME_NAME, GLAUTH_CONFIG_DIRECTORY)
        .context(AddVolumeMountSnafu)?
        .add_volume_mount(LOG_VOLUME_NAME, STACKABLE_LOG_DIR)
        .context(AddVolumeMountSnafu)?
        .add_volume_mount(LISTENER_VOLUME_NAME, LISTENER_VOLUME_DIR)
        .context(AddVolumeMountSnafu)?
        .add_container_port(LDAP_PORT_NAME, LDAP_PORT.into())
        .add_container_port(METRICS_PORT_NAME, METRICS_PORT.into())
        .resources(merged_config.resources.clone().into());
    if glauth.spec.cluster_config.tls.ldaps_enabled {
        container_builder.add_container_port(LDAPS_PORT_NAME, LDAPS_PORT.into());
    }
    if tls_enabled {
        container_builder
            .add_volume_mount(TLS_VOLUME_NAME, TLS_MOUNT_DIR)
            .context(AddVolumeMountSnafu)?;
    }

    let mut container_glauth = container_builder.build();
    let probe = Probe {
        initial_delay_seconds: Some(5),
        period_seconds: Some(10),
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::String(LDAP_PORT_NAME.to_string()),
            ..TCPSocketAction::default()
        }),
        ..Probe::default()
    };
    container_glauth.readiness_probe = Some(probe.clone());
    container_glauth.liveness_probe = Some(probe);

    let pod_metadata = ObjectMetaBuilder::new()
        .with_recommended_labels(build_recommended_labels(
            glauth,
            &resolved_product_image.app_version_label,
            &rolegroup_ref.role,
            &rolegroup_ref.role_group,
        ))
        .context(MetadataBuildSnafu)?
        .with_annotation(
            Annotation::try_from((CONFIG_HASH_ANNOTATION, config_hash))
                .context(AnnotationBuildSnafu)?,
        )
        .build();

    let mut pod_builder = PodBuilder::new();
    pod_builder
        .metadata(pod_metadata)
        .image_pull_secrets_from_product_image(resolved_product_image)
        .add_container(container_glauth)
        .affinity(&merged_config.affinity)
        .add_volume(Volume {
            name: CONFIG_VOLUME_NAME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: rolegroup_ref.object_name(),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        })
        .context(AddVolumeSnafu)?
        .add_volume(Volume {
            name: RW_CONFIG_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        })
        .context(AddVolumeSnafu)?
        .add_volume(Volume {
            name: LOG_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: None,
                size_limit: Some(product_logging_size_limit()),
            }),
            ..Volume::default()
        })
        .context(AddVolumeSnafu)?
        .service_account_name(format!("{APP_NAME}-serviceaccount"));
    if tls_enabled {
        pod_builder
            .add_volume(tls::tls_volume(&glauth.server_tls_secret_name()))
            .context(AddVolumeSnafu)?;
    }

    if merged_config.logging.enable_vector_agent {
        pod_builder.add_container(vector_container(
            resolved_product_image,
            CONFIG_VOLUME_NAME,
            LOG_VOLUME_NAME,
            merged_config.logging.containers.get(&Container::Vector),
            ResourceRequirementsBuilder::new()
                .with_cpu_request("250m")
                .with_cpu_limit("500m")
                .with_memory_request("128Mi")
                .with_memory_limit("128Mi")
                .build(),
        ));
    }

    add_graceful_shutdown_config(merged_config, &mut pod_builder).context(GracefulShutdownSnafu)?;

    let mut pod_template = pod_builder.build_template();
    pod_template.merge_from(role.config.pod_overrides.clone());
    if let Some(rolegroup) = rolegroup {
        pod_template.merge_from(rolegroup.config.pod_overrides.clone());
    }

    let listener_group_name = group_listener_name(glauth, &rolegroup_ref.role);
    // The PVC labels must stay stable across product upgrades, volume claim
    // templates cannot be modified once deployed.
    let listener_pvc = build_group_listener_pvc(
        &listener_group_name,
        &Labels::role_group_selector(
            glauth,
            APP_NAME,
            &rolegroup_ref.role,
            &rolegroup_ref.role_group,
        )
        .context(LabelBuildSnafu)?,
    )
    .context(BuildListenerSnafu)?;

    Ok(StatefulSet {
        metadata: ObjectMetaBuilder::new()
            .name_and_namespace(glauth)
            .name(rolegroup_ref.object_name())
            .ownerreference_from_resource(glauth, None, Some(true))
            .context(ObjectMissingMetadataForOwnerRefSnafu)?
            .with_recommended_labels(build_recommended_labels(
                glauth,
                &resolved_product_image.app_version_label,
                &rolegroup_ref.role,
                &rolegroup_ref.role_group,
            ))
            .context(MetadataBuildSnafu)?
            .build(),
        spec: Some(StatefulSetSpec {
            pod_management_policy: Some("Parallel".to_string()),
            replicas: rolegroup.and_then(|rg| rg.replicas).map(i32::from),
            selector: LabelSelector {
                match_labels: Some(rolegroup_selector_labels(glauth, rolegroup_ref)?),
                ..LabelSelector::default()
            },
            service_name: Some(rolegroup_headless_service_name(
                &rolegroup_ref.object_name(),
            )),
            template: pod_template,
            volume_claim_templates: Some(vec![listener_pvc]),
            ..StatefulSetSpec::default()
        }),
        status: None,
    })
}

/// Read back the ingress points the Listener was assigned. Empty right after
/// creation, the next reconcile picks them up.
async fn listener_ingresses(
    client: &stackable_operator::client::Client,
    listener_name: &str,
    namespace: &str,
) -> Result<Vec<ListenerIngress>> {
    let listener = client
        .get_opt::<Listener>(listener_name, namespace)
        .await
        .with_context(|_| GetListenerSnafu {
            name: listener_name.to_string(),
        })?;

    Ok(listener
        .and_then(|listener| listener.status)
        .and_then(|status| status.ingress_addresses)
        .unwrap_or_default())
}

/// The endpoints published to consumers: Listener ingress points if assigned
/// (with the port mapping the listener class chose, e.g. a node port),
/// otherwise the cluster-internal service FQDN.
fn ldap_endpoints(
    glauth: &v1alpha1::GlauthCluster,
    client: &stackable_operator::client::Client,
    listener_ingresses: &[ListenerIngress],
) -> LdapEndpoints {
    let hosts: Vec<(String, i32, i32)> = if listener_ingresses.is_empty() {
        glauth
            .server_role_service_fqdn(&client.kubernetes_cluster_info)
            .into_iter()
            .map(|fqdn| (fqdn, LDAP_PORT.into(), LDAPS_PORT.into()))
            .collect()
    } else {
        listener_ingresses
            .iter()
            .map(|ingress| {
                (
                    ingress.address.clone(),
                    ingress
                        .ports
                        .get(LDAP_PORT_NAME)
                        .copied()
                        .unwrap_or(LDAP_PORT.into()),
                    ingress
                        .ports
                        .get(LDAPS_PORT_NAME)
                        .copied()
                        .unwrap_or(LDAPS_PORT.into()),
                )
            })
            .collect()
    };

    let ldaps_urls = if glauth.spec.cluster_config.tls.ldaps_enabled {
        hosts
            .iter()
            .map(|(host, _, ldaps_port)| format!("ldaps://{host}:{ldaps_port}"))
            .collect()
    } else {
        Vec::new()
    };

    LdapEndpoints {
        urls: hosts
            .iter()
            .map(|(host, ldap_port, _)| format!("ldap://{host}:{ldap_port}"))
            .collect(),
        ldaps_urls,
        base_dn: glauth.base_dn().to_string(),
        starttls: glauth.spec.cluster_config.tls.starttls_enabled,
    }
}

fn database_config_credentials_secret(glauth: &v1alpha1::GlauthCluster) -> String {
    match &glauth.spec.cluster_config.backend {
        v1alpha1::GlauthBackend::Database { database } => database.credentials_secret.clone(),
        v1alpha1::GlauthBackend::PassThrough { .. } => String::new(),
    }
}

pub fn build_recommended_labels<'a>(
    owner: &'a v1alpha1::GlauthCluster,
    app_version: &'a str,
    role: &'a str,
    role_group: &'a str,
) -> ObjectLabels<'a, v1alpha1::GlauthCluster> {
    ObjectLabels {
        owner,
        app_name: APP_NAME,
        app_version,
        operator_name: OPERATOR_NAME,
        controller_name: GLAUTH_CONTROLLER_NAME,
        role,
        role_group,
    }
}

fn role_selector_labels(
    glauth: &v1alpha1::GlauthCluster,
    role: &str,
) -> Result<BTreeMap<String, String>> {
    Ok(Labels::role_selector(glauth, APP_NAME, role)
        .context(LabelBuildSnafu)?
        .into())
}

fn rolegroup_selector_labels(
    glauth: &v1alpha1::GlauthCluster,
    rolegroup_ref: &RoleGroupRef<v1alpha1::GlauthCluster>,
) -> Result<BTreeMap<String, String>> {
    Ok(Labels::role_group_selector(
        glauth,
        APP_NAME,
        &rolegroup_ref.role,
        &rolegroup_ref.role_group,
    )
    .context(LabelBuildSnafu)?
    .into())
}

fn product_logging_size_limit() -> Quantity {
    Quantity("30Mi".to_string())
}

fn sha256_hex(input: &[u8]) -> String {
    Sha256::digest(input)
        .iter()
        .fold(String::with_capacity(64), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
}

pub fn error_policy(
    _obj: Arc<DeserializeGuard<v1alpha1::GlauthCluster>>,
    error: &Error,
    _ctx: Arc<Ctx>,
) -> Action {
    match error {
        // An invalid object does not heal on requeue, wait for it to change.
        Error::InvalidGlauthCluster { .. } => Action::await_change(),
        _ => Action::requeue(*Duration::from_secs(10)),
    }
}
