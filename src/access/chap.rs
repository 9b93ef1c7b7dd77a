//! Bidirectional CHAP validation and secret generation.

use super::igroup::ensure_igroup_exists;
use crate::config::SanSettings;
use crate::domain::ports::{ChapCredentials, DefaultAuth, ManagementClient};
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};

const CHAP_SECRET_LEN: usize = 16;
const CHAP_ENTROPY_BYTES: usize = 256;

/// Default-initiator authentication mode reported by the appliance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultAuthType {
    None,
    Chap,
    Deny,
    Unrecognized(String),
}

impl DefaultAuthType {
    /// Classify the auth record; a record without an auth type is an error
    pub fn classify(auth: &DefaultAuth) -> Result<Self> {
        let auth_type = auth.auth_type.as_deref().ok_or_else(|| {
            Error::Chap("error checking default initiator's auth type: auth type not reported".into())
        })?;

        Ok(if auth_type.eq_ignore_ascii_case("none") {
            DefaultAuthType::None
        } else if auth_type.eq_ignore_ascii_case("chap") {
            DefaultAuthType::Chap
        } else if auth_type.eq_ignore_ascii_case("deny") {
            DefaultAuthType::Deny
        } else {
            DefaultAuthType::Unrecognized(auth_type.to_string())
        })
    }
}

/// Check configured CHAP credentials against the appliance's current
/// default-initiator record and return the credentials to apply.
pub fn validate_bidirectional_chap_credentials(
    auth: &DefaultAuth,
    credentials: &ChapCredentials,
) -> Result<ChapCredentials> {
    let auth_type = DefaultAuthType::classify(auth)?;
    match &auth_type {
        DefaultAuthType::Unrecognized(other) => {
            return Err(Error::Chap(format!(
                "default initiator's auth type is unsupported: {}",
                other
            )))
        }
        DefaultAuthType::Deny => {
            return Err(Error::Chap("default initiator's auth type is deny".into()))
        }
        DefaultAuthType::None | DefaultAuthType::Chap => {}
    }

    let missing: Vec<&str> = [
        ("ChapUsername", &credentials.chap_username),
        ("ChapInitiatorSecret", &credentials.chap_initiator_secret),
        ("ChapTargetUsername", &credentials.chap_target_username),
        ("ChapTargetInitiatorSecret", &credentials.chap_target_initiator_secret),
    ]
    .iter()
    .filter(|(_, value)| value.is_empty())
    .map(|(field, _)| *field)
    .collect();
    if !missing.is_empty() {
        return Err(Error::Chap(format!(
            "missing value for required field(s) {:?}",
            missing
        )));
    }

    // Secrets cannot be read back, so only the usernames can be compared
    if auth_type == DefaultAuthType::Chap {
        let (user, outbound) = match (&auth.user_name, &auth.outbound_user_name) {
            (Some(user), Some(outbound)) => (user, outbound),
            _ => {
                return Err(Error::Chap(
                    "error checking default initiator's credentials".into(),
                ))
            }
        };
        if &credentials.chap_username != user || &credentials.chap_target_username != outbound {
            return Err(Error::Chap(
                "provided CHAP usernames do not match default initiator's usernames".into(),
            ));
        }
    }

    Ok(credentials.clone())
}

/// Prepare iSCSI access for a SAN backend: create its igroup and bring the
/// SVM's default-initiator authentication in line with `useCHAP`.
///
/// CHAP is never switched on while LUNs exist under `none` auth, since their
/// hosts would lose access.
pub async fn initialize_san_auth(
    client: &dyn ManagementClient,
    san: &mut SanSettings,
    svm: &str,
) -> Result<()> {
    ensure_igroup_exists(client, &san.igroup_name).await?;
    warn!(
        svm = %svm,
        igroup = %san.igroup_name,
        "Please ensure all relevant hosts are added to the initiator group"
    );

    let auth = client.iscsi_initiator_get_default_auth().await.map_err(|e| {
        Error::Chap(format!("error checking default initiator's auth type: {}", e))
    })?;
    debug!(?auth, "Default initiator auth");
    let auth_type = DefaultAuthType::classify(&auth)?;

    if san.use_chap {
        let credentials = validate_bidirectional_chap_credentials(&auth, &san.chap)?;
        debug!("Using CHAP credentials");

        if auth_type == DefaultAuthType::None {
            let luns = client
                .lun_list_for_vserver()
                .await
                .map_err(|e| Error::api("enumerate LUNs", svm, e))?;
            if !luns.is_empty() {
                return Err(Error::Chap(format!(
                    "will not enable CHAP for SVM {}; {} existing LUNs would lose access",
                    svm,
                    luns.len()
                )));
            }
        }

        client
            .iscsi_initiator_set_default_auth("CHAP", &credentials)
            .await
            .map_err(|e| Error::api("set CHAP credentials", svm, e))?;
        san.chap = credentials;
    } else if auth_type != DefaultAuthType::None {
        return Err(Error::Chap("default initiator's auth type is not 'none'".into()));
    }

    Ok(())
}

/// Generate a 16-character CHAP secret from the OS random source
pub fn random_chap_secret16() -> Result<String> {
    let mut bytes = [0u8; CHAP_ENTROPY_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::Internal(format!("could not read random bytes: {}", e)))?;
    chap_secret_from_bytes(&bytes)
}

/// Base64-encode `bytes`, drop `+`, `/` and `=`, keep the first 16 characters.
///
/// Too few surviving characters yields a transient error so callers retry.
pub fn chap_secret_from_bytes(bytes: &[u8]) -> Result<String> {
    let encoded = BASE64.encode(bytes);
    let secret: String = encoded
        .chars()
        .filter(|c| !matches!(c, '+' | '/' | '='))
        .take(CHAP_SECRET_LEN)
        .collect();

    if secret.len() < CHAP_SECRET_LEN {
        return Err(Error::Internal(format!(
            "invalid random string created '{}'",
            encoded
        )));
    }
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::SimulatedAppliance;
    use assert_matches::assert_matches;

    fn auth(auth_type: Option<&str>, user: Option<&str>, outbound: Option<&str>) -> DefaultAuth {
        DefaultAuth {
            auth_type: auth_type.map(String::from),
            user_name: user.map(String::from),
            outbound_user_name: outbound.map(String::from),
        }
    }

    fn full_credentials() -> ChapCredentials {
        ChapCredentials {
            chap_username: "initiator".into(),
            chap_initiator_secret: "secret1secret1ab".into(),
            chap_target_username: "target".into(),
            chap_target_initiator_secret: "secret2secret2ab".into(),
        }
    }

    #[test]
    fn test_classify_is_case_insensitive() {
        assert_eq!(
            DefaultAuthType::classify(&auth(Some("NONE"), None, None)).unwrap(),
            DefaultAuthType::None
        );
        assert_eq!(
            DefaultAuthType::classify(&auth(Some("chap"), None, None)).unwrap(),
            DefaultAuthType::Chap
        );
        assert_eq!(
            DefaultAuthType::classify(&auth(Some("Deny"), None, None)).unwrap(),
            DefaultAuthType::Deny
        );
        assert_matches!(
            DefaultAuthType::classify(&auth(Some("kerberos"), None, None)).unwrap(),
            DefaultAuthType::Unrecognized(_)
        );
        assert!(DefaultAuthType::classify(&auth(None, None, None)).is_err());
    }

    #[test]
    fn test_deny_always_fails() {
        let result = validate_bidirectional_chap_credentials(
            &auth(Some("deny"), Some("initiator"), Some("target")),
            &full_credentials(),
        );
        assert_matches!(result, Err(Error::Chap(msg)) if msg.contains("deny"));

        let result = validate_bidirectional_chap_credentials(
            &auth(Some("deny"), None, None),
            &ChapCredentials::default(),
        );
        assert_matches!(result, Err(Error::Chap(msg)) if msg.contains("deny"));
    }

    #[test]
    fn test_unsupported_auth_type_fails() {
        let result = validate_bidirectional_chap_credentials(
            &auth(Some("radius"), None, None),
            &full_credentials(),
        );
        assert_matches!(result, Err(Error::Chap(msg)) if msg.contains("unsupported"));
    }

    #[test]
    fn test_missing_fields_are_enumerated() {
        let credentials = ChapCredentials {
            chap_username: "initiator".into(),
            chap_target_username: "target".into(),
            ..Default::default()
        };
        let err = validate_bidirectional_chap_credentials(&auth(Some("none"), None, None), &credentials)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ChapInitiatorSecret"));
        assert!(msg.contains("ChapTargetInitiatorSecret"));
        assert!(!msg.contains("\"ChapUsername\""));
    }

    #[test]
    fn test_existing_chap_usernames_must_match() {
        let ok = validate_bidirectional_chap_credentials(
            &auth(Some("CHAP"), Some("initiator"), Some("target")),
            &full_credentials(),
        );
        assert_eq!(ok.unwrap(), full_credentials());

        let mismatch = validate_bidirectional_chap_credentials(
            &auth(Some("CHAP"), Some("someone-else"), Some("target")),
            &full_credentials(),
        );
        assert_matches!(mismatch, Err(Error::Chap(msg)) if msg.contains("do not match"));

        let unreported = validate_bidirectional_chap_credentials(
            &auth(Some("CHAP"), None, Some("target")),
            &full_credentials(),
        );
        assert!(unreported.is_err());
    }

    fn san(use_chap: bool) -> SanSettings {
        SanSettings {
            igroup_name: "trident-uuid".into(),
            use_chap,
            chap: full_credentials(),
            data_lif: None,
        }
    }

    #[tokio::test]
    async fn test_san_auth_enables_chap_on_empty_svm() {
        let appliance = SimulatedAppliance::new();
        let mut settings = san(true);

        initialize_san_auth(&appliance, &mut settings, "svm0").await.unwrap();

        assert!(appliance.igroup_members("trident-uuid").is_some());
        let auth = appliance.default_auth();
        assert_eq!(auth.auth_type.as_deref(), Some("CHAP"));
        assert_eq!(auth.user_name.as_deref(), Some("initiator"));
    }

    #[tokio::test]
    async fn test_san_auth_refuses_chap_with_existing_luns() {
        let appliance = SimulatedAppliance::new();
        appliance.add_lun("/vol/v1/lun0", None);

        let err = initialize_san_auth(&appliance, &mut san(true), "svm0")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1 existing LUNs would lose access"));
        assert_eq!(appliance.default_auth().auth_type.as_deref(), Some("none"));
    }

    #[tokio::test]
    async fn test_san_auth_without_chap_requires_none() {
        let appliance = SimulatedAppliance::new();
        initialize_san_auth(&appliance, &mut san(false), "svm0").await.unwrap();

        appliance.set_default_auth(auth(Some("CHAP"), Some("initiator"), Some("target")));
        assert_matches!(
            initialize_san_auth(&appliance, &mut san(false), "svm0").await,
            Err(Error::Chap(msg)) if msg.contains("not 'none'")
        );

        appliance.set_default_auth(auth(Some("deny"), None, None));
        assert_matches!(
            initialize_san_auth(&appliance, &mut san(true), "svm0").await,
            Err(Error::Chap(msg)) if msg.contains("deny")
        );
    }

    #[test]
    fn test_random_secret_shape() {
        let secret = random_chap_secret16().unwrap();
        assert_eq!(secret.len(), 16);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(secret, random_chap_secret16().unwrap());
    }

    #[test]
    fn test_secret_strips_padding_and_symbols() {
        // fb ff bf encodes to "+/+/"
        let mut bytes = vec![0xfbu8, 0xff, 0xbf];
        bytes.extend(b"abcdefghijklmnopqrstuvwxyz");
        let secret = chap_secret_from_bytes(&bytes).unwrap();
        assert!(!secret.contains(['+', '/', '=']));
        assert_eq!(secret.len(), 16);

        let too_short = chap_secret_from_bytes(&[0xfb, 0xff, 0xbf]);
        assert_matches!(too_short, Err(e) if e.is_transient());
    }
}
