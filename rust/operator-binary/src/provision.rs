//! Bind-account provisioning and credential rotation.
//!
//! Accounts are created lazily in the backend database. The plaintext password
//! exists in exactly two places: it is generated once on account creation and
//! afterwards only lives in the published credentials Secret, while the
//! database keeps the SHA-256 digest. If the published Secret disappears, the
//! password is rotated rather than recovered.

use std::fmt::Write;

use rand::{Rng, distr::Alphanumeric};
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use stackable_operator::{client::Client, k8s_openapi::api::core::v1::Secret};

use crate::{
    crd::v1alpha1,
    database::{self, DirectoryStore},
    discovery::SECRET_BIND_PASSWORD_KEY,
};

// All provisioned accounts share the uid/gid pair the GLAuth postgres plugin
// treats as service accounts.
pub const DEFAULT_UID_NUMBER: i32 = 5001;
pub const DEFAULT_GID_NUMBER: i32 = 5501;

const GENERATED_PASSWORD_LENGTH: usize = 32;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("database operation failed"))]
    Database { source: database::Error },

    #[snafu(display("no user [{user_name}] found to reset the password of"))]
    NoSuchUser { user_name: String },

    #[snafu(display("failed to retrieve the published bind Secret [{name}]"))]
    GetPublishedSecret {
        source: stackable_operator::client::Error,
        name: String,
    },
}

/// An LDAP identity a client uses to authenticate against the directory.
#[derive(Clone, Debug, PartialEq)]
pub struct BindAccount {
    pub cn: String,
    pub ou: String,
    pub password: Option<String>,
}

impl BindAccount {
    /// The distinguished name of the account below the cluster base DN.
    pub fn bind_dn(&self, base_dn: &str) -> String {
        format!("cn={},ou={},{}", self.cn, self.ou, base_dn)
    }
}

/// Parse a bind account out of an upstream server's bind DN, e.g.
/// `cn=admin,ou=people,dc=example,dc=org`. Missing attributes stay empty.
pub fn bind_account_from_bind_dn(bind_dn: &str, password: Option<String>) -> BindAccount {
    let mut cn = "";
    let mut ou = "";
    for part in bind_dn.split(',') {
        if let Some((attribute, value)) = part.split_once('=') {
            match attribute.trim() {
                "cn" => cn = value.trim(),
                "ou" => ou = value.trim(),
                _ => (),
            }
        }
    }

    BindAccount {
        cn: cn.to_string(),
        ou: ou.to_string(),
        password,
    }
}

/// Ensure group, user and search capability exist for the requested account.
///
/// The password is only returned when the user row was freshly created, all
/// later calls return `None` since only the digest is stored.
pub async fn create_bind_account(
    store: &DirectoryStore,
    user_name: &str,
    group_name: &str,
) -> Result<BindAccount> {
    if store
        .find_group(group_name)
        .await
        .context(DatabaseSnafu)?
        .is_none()
    {
        store
            .insert_group(group_name, DEFAULT_GID_NUMBER)
            .await
            .context(DatabaseSnafu)?;
    }

    let password = match store.find_user(user_name).await.context(DatabaseSnafu)? {
        Some(_) => None,
        None => {
            let password = generate_password();
            store
                .insert_user(
                    user_name,
                    DEFAULT_UID_NUMBER,
                    DEFAULT_GID_NUMBER,
                    &sha256_hex(&password),
                )
                .await
                .context(DatabaseSnafu)?;
            Some(password)
        }
    };

    if store
        .find_capability_for_user(DEFAULT_UID_NUMBER)
        .await
        .context(DatabaseSnafu)?
        .is_none()
    {
        store
            .insert_capability(DEFAULT_UID_NUMBER)
            .await
            .context(DatabaseSnafu)?;
    }

    Ok(BindAccount {
        cn: user_name.to_string(),
        ou: group_name.to_string(),
        password,
    })
}

/// Set a fresh random password on an existing user and return the plaintext.
pub async fn reset_account_password(store: &DirectoryStore, user_name: &str) -> Result<String> {
    if store
        .find_user(user_name)
        .await
        .context(DatabaseSnafu)?
        .is_none()
    {
        return NoSuchUserSnafu { user_name }.fail();
    }

    let password = generate_password();
    store
        .update_user_password(user_name, &sha256_hex(&password))
        .await
        .context(DatabaseSnafu)?;

    Ok(password)
}

/// Provision one configured bind account and reconcile its password with the
/// previously published credentials Secret.
///
/// * freshly created account: keep the generated password
/// * existing account, Secret still published: keep the published password
/// * existing account, Secret gone: rotate the password in the database
pub async fn reconcile_bind_account(
    client: &Client,
    glauth: &v1alpha1::GlauthCluster,
    store: &DirectoryStore,
    account_config: &v1alpha1::BindAccountConfig,
    namespace: &str,
) -> Result<BindAccount> {
    let mut account =
        create_bind_account(store, &account_config.name, &account_config.group).await?;

    if account.password.is_none() {
        let secret_name = glauth.bind_account_secret_name(&account_config.name);
        let published = client
            .get_opt::<Secret>(&secret_name, namespace)
            .await
            .with_context(|_| GetPublishedSecretSnafu {
                name: secret_name.clone(),
            })?
            .and_then(|secret| {
                database::secret_string_value(&secret, SECRET_BIND_PASSWORD_KEY).ok()
            });

        account.password = match published {
            Some(password) => Some(password),
            None => {
                tracing::info!(
                    account = %account_config.name,
                    "published bind credentials are gone, rotating the account password"
                );
                Some(reset_account_password(store, &account_config.name).await?)
            }
        };
    }

    Ok(account)
}

pub fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

fn sha256_hex(password: &str) -> String {
    Sha256::digest(password.as_bytes())
        .iter()
        .fold(String::with_capacity(64), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_sha256_hex() {
        // printf '' | sha256sum
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        // printf 'admin' | sha256sum
        assert_eq!(
            sha256_hex("admin"),
            "8c6976e5b5410415bde908bd4dee15dfb167a9c873fc4bb8a81f6f2ab448a918"
        );
    }

    #[test]
    fn test_generated_passwords_are_random() {
        let a = generate_password();
        let b = generate_password();

        assert_eq!(a.len(), GENERATED_PASSWORD_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[rstest]
    #[case("cn=admin,ou=people,dc=example,dc=org", "admin", "people")]
    #[case("cn = admin , ou = people , dc=x", "admin", "people")]
    #[case("dc=example,dc=org", "", "")]
    fn test_bind_account_from_bind_dn(#[case] bind_dn: &str, #[case] cn: &str, #[case] ou: &str) {
        let account = bind_account_from_bind_dn(bind_dn, Some("secret".to_string()));
        assert_eq!(account.cn, cn);
        assert_eq!(account.ou, ou);
        assert_eq!(account.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_bind_dn_roundtrip() {
        let account = BindAccount {
            cn: "kratos".to_string(),
            ou: "identity".to_string(),
            password: None,
        };
        assert_eq!(
            account.bind_dn("dc=glauth,dc=com"),
            "cn=kratos,ou=identity,dc=glauth,dc=com"
        );
    }
}
