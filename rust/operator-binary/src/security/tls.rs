//! TLS wiring for the GLAuth server: file locations inside the container and
//! the identities the server certificate is issued for.

use std::net::IpAddr;

use snafu::{OptionExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::{SecretVolumeSource, Volume},
    utils::cluster_info::KubernetesClusterInfo,
};

use crate::crd::v1alpha1;

pub const TLS_VOLUME_NAME: &str = "tls";
pub const TLS_MOUNT_DIR: &str = "/stackable/tls";
pub const TLS_CERT_PATH: &str = "/stackable/tls/tls.crt";
pub const TLS_KEY_PATH: &str = "/stackable/tls/tls.key";
pub const TLS_CA_PATH: &str = "/stackable/tls/ca.crt";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object has no namespace associated"))]
    NoNamespace,
}

/// The DNS and IP identities the server certificate must cover.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerIdentity {
    pub common_name: String,
    pub sans_dns: Vec<String>,
    pub sans_ip: Vec<IpAddr>,
}

impl ServerIdentity {
    /// All subject alternative names in a stable order, used to detect drift
    /// between an issued certificate and the currently required identities.
    pub fn fingerprint(&self) -> String {
        let mut names: Vec<String> = self
            .sans_dns
            .iter()
            .cloned()
            .chain(self.sans_ip.iter().map(IpAddr::to_string))
            .collect();
        names.sort();
        names.join(",")
    }
}

/// Collect the identities of a server: the cluster-internal service FQDN plus
/// every address the Listener exposes, classified into DNS names and IPs.
pub fn server_identity(
    glauth: &v1alpha1::GlauthCluster,
    cluster_info: &KubernetesClusterInfo,
    listener_addresses: &[String],
) -> Result<ServerIdentity> {
    let common_name = glauth
        .server_role_service_fqdn(cluster_info)
        .context(NoNamespaceSnafu)?;

    let mut sans_dns = vec![common_name.clone()];
    let mut sans_ip = Vec::new();

    for address in listener_addresses {
        match address.parse::<IpAddr>() {
            Ok(ip) => {
                if !sans_ip.contains(&ip) {
                    sans_ip.push(ip);
                }
            }
            Err(_) => {
                if !sans_dns.contains(address) {
                    sans_dns.push(address.clone());
                }
            }
        }
    }

    Ok(ServerIdentity {
        common_name,
        sans_dns,
        sans_ip,
    })
}

/// The volume carrying the issued server certificate into the container.
pub fn tls_volume(server_tls_secret_name: &str) -> Volume {
    Volume {
        name: TLS_VOLUME_NAME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(server_tls_secret_name.to_string()),
            ..SecretVolumeSource::default()
        }),
        ..Volume::default()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    #[test]
    fn test_listener_addresses_are_classified() {
        let input = r#"
        apiVersion: glauth.stackable.tech/v1alpha1
        kind: GlauthCluster
        metadata:
          name: simple-glauth
          namespace: default
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

        let identity = server_identity(
            &glauth,
            &KubernetesClusterInfo {
                cluster_domain: "cluster.local".to_string().try_into().unwrap(),
            },
            &[
                "ldap.example.org".to_string(),
                "203.0.113.17".to_string(),
                // already covered by the common name, must not duplicate
                "simple-glauth.default.svc.cluster.local".to_string(),
            ],
        )
        .unwrap();

        assert_eq!(
            identity.common_name,
            "simple-glauth.default.svc.cluster.local"
        );
        assert_eq!(
            identity.sans_dns,
            vec![
                "simple-glauth.default.svc.cluster.local".to_string(),
                "ldap.example.org".to_string(),
            ]
        );
        assert_eq!(
            identity.sans_ip,
            vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 17))]
        );
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = ServerIdentity {
            common_name: "svc".to_string(),
            sans_dns: vec!["a.example.org".to_string(), "b.example.org".to_string()],
            sans_ip: vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 17))],
        };
        let b = ServerIdentity {
            common_name: "svc".to_string(),
            sans_dns: vec!["b.example.org".to_string(), "a.example.org".to_string()],
            sans_ip: vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 17))],
        };

        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
