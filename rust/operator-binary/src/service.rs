use std::collections::BTreeMap;

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec},
    kvp::{Label, ObjectLabels},
    role_utils::RoleGroupRef,
};

use crate::crd::{
    LDAP_PORT, LDAP_PORT_NAME, LDAPS_PORT, LDAPS_PORT_NAME, METRICS_PORT, METRICS_PORT_NAME,
    v1alpha1,
};

const METRICS_SERVICE_SUFFIX: &str = "metrics";
const HEADLESS_SERVICE_SUFFIX: &str = "headless";

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

    #[snafu(display("failed to build Labels"))]
    LabelBuild {
        source: stackable_operator::kvp::LabelError,
    },
}

/// The server-role [`Service`] is the stable cluster-internal endpoint. Its
/// FQDN is the common name of the server certificate and the fallback URL in
/// the discovery ConfigMap.
pub fn build_server_role_service(
    glauth: &v1alpha1::GlauthCluster,
    object_labels: ObjectLabels<v1alpha1::GlauthCluster>,
    selector: BTreeMap<String, String>,
) -> Result<Service, Error> {
    Ok(Service {
        metadata: ObjectMetaBuilder::new()
            .name_and_namespace(glauth)
            .name(glauth.server_role_service_name())
            .ownerreference_from_resource(glauth, None, Some(true))
            .context(ObjectMissingMetadataForOwnerRefSnafu)?
            .with_recommended_labels(object_labels)
            .context(MetadataBuildSnafu)?
            .build(),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ports: Some(ldap_service_ports(glauth)),
            selector: Some(selector),
            ..ServiceSpec::default()
        }),
        status: None,
    })
}

/// The rolegroup headless [`Service`] allows direct access to the instances of
/// a certain rolegroup, mostly for clients that perform client-side load
/// balancing.
pub fn build_rolegroup_headless_service(
    glauth: &v1alpha1::GlauthCluster,
    role_group_ref: &RoleGroupRef<v1alpha1::GlauthCluster>,
    object_labels: ObjectLabels<v1alpha1::GlauthCluster>,
    selector: BTreeMap<String, String>,
) -> Result<Service, Error> {
    Ok(Service {
        metadata: ObjectMetaBuilder::new()
            .name_and_namespace(glauth)
            .name(rolegroup_headless_service_name(
                &role_group_ref.object_name(),
            ))
            .ownerreference_from_resource(glauth, None, Some(true))
            .context(ObjectMissingMetadataForOwnerRefSnafu)?
            .with_recommended_labels(object_labels)
            .context(MetadataBuildSnafu)?
            .build(),
        spec: Some(ServiceSpec {
            // Internal communication does not need to be exposed
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("None".to_string()),
            ports: Some(ldap_service_ports(glauth)),
            selector: Some(selector),
            publish_not_ready_addresses: Some(true),
            ..ServiceSpec::default()
        }),
        status: None,
    })
}

/// The rolegroup metrics [`Service`] exposes the GLAuth monitoring endpoint
/// and a prometheus scraping label.
pub fn build_rolegroup_metrics_service(
    glauth: &v1alpha1::GlauthCluster,
    role_group_ref: &RoleGroupRef<v1alpha1::GlauthCluster>,
    object_labels: ObjectLabels<v1alpha1::GlauthCluster>,
    selector: BTreeMap<String, String>,
) -> Result<Service, Error> {
    Ok(Service {
        metadata: ObjectMetaBuilder::new()
            .name_and_namespace(glauth)
            .name(rolegroup_metrics_service_name(
                &role_group_ref.object_name(),
            ))
            .ownerreference_from_resource(glauth, None, Some(true))
            .context(ObjectMissingMetadataForOwnerRefSnafu)?
            .with_recommended_labels(object_labels)
            .context(MetadataBuildSnafu)?
            .with_label(Label::try_from(("prometheus.io/scrape", "true")).context(LabelBuildSnafu)?)
            .build(),
        spec: Some(ServiceSpec {
            // Internal communication does not need to be exposed
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("None".to_string()),
            ports: Some(vec![ServicePort {
                name: Some(METRICS_PORT_NAME.to_string()),
                port: METRICS_PORT.into(),
                protocol: Some("TCP".to_string()),
                ..ServicePort::default()
            }]),
            selector: Some(selector),
            publish_not_ready_addresses: Some(true),
            ..ServiceSpec::default()
        }),
        status: None,
    })
}

fn ldap_service_ports(glauth: &v1alpha1::GlauthCluster) -> Vec<ServicePort> {
    let mut ports = vec![ServicePort {
        name: Some(LDAP_PORT_NAME.to_string()),
        port: LDAP_PORT.into(),
        protocol: Some("TCP".to_string()),
        ..ServicePort::default()
    }];
    if glauth.spec.cluster_config.tls.ldaps_enabled {
        ports.push(ServicePort {
            name: Some(LDAPS_PORT_NAME.to_string()),
            port: LDAPS_PORT.into(),
            protocol: Some("TCP".to_string()),
            ..ServicePort::default()
        });
    }
    ports
}

/// Returns the metrics rolegroup service name `<cluster>-<role>-<rolegroup>-<METRICS_SERVICE_SUFFIX>`.
pub fn rolegroup_metrics_service_name(role_group_ref_object_name: impl AsRef<str>) -> String {
    let role_group_ref_object_name = role_group_ref_object_name.as_ref();
    format!("{role_group_ref_object_name}-{METRICS_SERVICE_SUFFIX}")
}

/// Returns the headless rolegroup service name `<cluster>-<role>-<rolegroup>-<HEADLESS_SERVICE_SUFFIX>`.
pub fn rolegroup_headless_service_name(role_group_ref_object_name: &str) -> String {
    format!("{role_group_ref_object_name}-{HEADLESS_SERVICE_SUFFIX}")
}
