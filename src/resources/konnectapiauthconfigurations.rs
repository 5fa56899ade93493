use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::conditions::{reasons, Condition, Conditioned};
use crate::resources::common::NamespacedRef;

pub static KONNECT_API_AUTH_CONFIGURATION_FINALIZER: &str =
    "konnect.konghq.com/konnectapiauthconfiguration";

/// Label that Secrets holding Konnect tokens must carry.
pub const CREDENTIAL_LABEL: &str = "konghq.com/credential";
pub const CREDENTIAL_LABEL_VALUE: &str = "konnect";
/// Key of the token inside the referenced Secret.
pub const TOKEN_SECRET_KEY: &str = "token";

pub const DEFAULT_SERVER_URL: &str = "https://us.api.konghq.com";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum KonnectAPIAuthType {
    #[default]
    #[serde(rename = "token")]
    Token,
    #[serde(rename = "secretRef")]
    SecretRef,
}

/// Credentials used to talk to the Konnect API
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "KonnectAPIAuthConfiguration",
    group = "konnect.konghq.com",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Valid", "type":"string", "jsonPath":".status.conditions[?(@.type==\"APIAuthValid\")].status"}"#,
    printcolumn = r#"{"name":"OrgID", "type":"string", "jsonPath":".status.organizationID"}"#,
    printcolumn = r#"{"name":"ServerURL", "type":"string", "jsonPath":".status.serverURL"}"#
)]
#[kube(status = "KonnectAPIAuthConfigurationStatus")]
#[serde(rename_all = "camelCase")]
pub struct KonnectAPIAuthConfigurationSpec {
    pub r#type: KonnectAPIAuthType,
    /// Personal or system access token, used when type is token
    pub token: Option<String>,
    /// Secret holding the token under the `token` key, used when type is secretRef
    pub secret_ref: Option<NamespacedRef>,
    /// Konnect API server, e.g. `us.api.konghq.com`
    #[serde(rename = "serverURL")]
    pub server_url: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KonnectAPIAuthConfigurationStatus {
    #[serde(rename = "organizationID")]
    pub organization_id: Option<String>,
    #[serde(rename = "serverURL")]
    pub server_url: Option<String>,
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Conditioned for KonnectAPIAuthConfiguration {
    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }

    fn generation(&self) -> Option<i64> {
        self.metadata.generation
    }
}

impl KonnectAPIAuthConfiguration {
    /// The token, read inline or from the referenced credential Secret.
    pub fn token(&self, secrets: &Store<Secret>) -> Result<String, crate::Error> {
        let invalid = |message: String| crate::Error::InvalidEntity {
            reason: reasons::INVALID_CREDENTIALS.into(),
            message,
        };

        match self.spec.r#type {
            KonnectAPIAuthType::Token => self
                .spec
                .token
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_owned)
                .ok_or_else(|| invalid("spec.token must be set when type is token".into())),
            KonnectAPIAuthType::SecretRef => {
                let secret_ref = self.spec.secret_ref.as_ref().ok_or_else(|| {
                    invalid("spec.secretRef must be set when type is secretRef".into())
                })?;
                let namespace = self.namespace().unwrap_or_default();
                let namespace = secret_ref.namespace_or(&namespace);
                let qualified = format!("{namespace}/{}", secret_ref.name);

                let secret = secrets
                    .get(&ObjectRef::new(&secret_ref.name).within(namespace))
                    .ok_or_else(|| crate::Error::SecretNotFound(qualified.clone()))?;
                if secret.labels().get(CREDENTIAL_LABEL).map(String::as_str)
                    != Some(CREDENTIAL_LABEL_VALUE)
                {
                    return Err(invalid(format!(
                        "Secret {qualified} must be labelled {CREDENTIAL_LABEL}={CREDENTIAL_LABEL_VALUE}"
                    )));
                }
                let bytes = secret
                    .data
                    .as_ref()
                    .and_then(|data| data.get(TOKEN_SECRET_KEY))
                    // we trim because secrets very regularly have trailing newlines
                    .map(|token| token.0.trim_ascii().to_vec())
                    .ok_or_else(|| {
                        crate::Error::SecretKeyNotFound(TOKEN_SECRET_KEY.into(), qualified.clone())
                    })?;

                String::from_utf8(bytes)
                    .map_err(|_| invalid(format!("the token in Secret {qualified} is not UTF-8")))
            }
        }
    }

    /// Base URL of the Konnect API, with a scheme and a trailing slash so paths can be joined.
    pub fn server_url(&self) -> Result<Url, url::ParseError> {
        let raw = self
            .spec
            .server_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SERVER_URL);
        let mut url = if raw.contains("://") {
            Url::parse(raw)?
        } else {
            Url::parse(&format!("https://{raw}"))?
        };
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::watcher;
    use std::collections::BTreeMap;

    fn auth(spec: KonnectAPIAuthConfigurationSpec) -> KonnectAPIAuthConfiguration {
        let mut auth = KonnectAPIAuthConfiguration::new("auth", spec);
        auth.metadata.namespace = Some("team".into());
        auth
    }

    fn secrets(labelled: bool, data: Option<&str>) -> Store<Secret> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("konnect-token".into()),
                namespace: Some("team".into()),
                labels: labelled.then(|| {
                    BTreeMap::from([(CREDENTIAL_LABEL.to_owned(), CREDENTIAL_LABEL_VALUE.to_owned())])
                }),
                ..Default::default()
            },
            data: data.map(|d| {
                BTreeMap::from([(TOKEN_SECRET_KEY.to_owned(), ByteString(d.as_bytes().to_vec()))])
            }),
            ..Default::default()
        };
        let mut writer = Writer::default();
        writer.apply_watcher_event(&watcher::Event::Apply(secret));
        writer.as_reader()
    }

    fn secret_ref() -> KonnectAPIAuthConfigurationSpec {
        KonnectAPIAuthConfigurationSpec {
            r#type: KonnectAPIAuthType::SecretRef,
            secret_ref: Some(NamespacedRef::new("konnect-token")),
            ..Default::default()
        }
    }

    #[test]
    fn inline_token() {
        let auth = auth(KonnectAPIAuthConfigurationSpec {
            token: Some("kpat_abc".into()),
            ..Default::default()
        });
        assert_eq!(auth.token(&secrets(true, None)).unwrap(), "kpat_abc");

        let missing = super::KonnectAPIAuthConfiguration::new("auth", Default::default());
        assert!(matches!(
            missing.token(&secrets(true, None)),
            Err(crate::Error::InvalidEntity { .. })
        ));
    }

    #[test]
    fn secret_token_is_trimmed() {
        let auth = auth(secret_ref());
        assert_eq!(
            auth.token(&secrets(true, Some("spat_xyz\n"))).unwrap(),
            "spat_xyz"
        );
    }

    #[test]
    fn secret_must_be_labelled_and_carry_the_key() {
        let auth = auth(secret_ref());
        assert!(matches!(
            auth.token(&secrets(false, Some("spat_xyz"))),
            Err(crate::Error::InvalidEntity { .. })
        ));
        assert!(matches!(
            auth.token(&secrets(true, None)),
            Err(crate::Error::SecretKeyNotFound(_, _))
        ));

        let mut elsewhere = secret_ref();
        elsewhere.secret_ref = Some(NamespacedRef {
            name: "konnect-token".into(),
            namespace: Some("other".into()),
        });
        assert!(matches!(
            super::tests::auth(elsewhere).token(&secrets(true, Some("spat_xyz"))),
            Err(crate::Error::SecretNotFound(name)) if name == "other/konnect-token"
        ));
    }

    #[test]
    fn server_url_is_normalized() {
        let with = |url: Option<&str>| {
            auth(KonnectAPIAuthConfigurationSpec {
                server_url: url.map(str::to_owned),
                ..Default::default()
            })
            .server_url()
            .unwrap()
            .to_string()
        };
        assert_eq!(with(None), "https://us.api.konghq.com/");
        assert_eq!(with(Some("eu.api.konghq.com")), "https://eu.api.konghq.com/");
        assert_eq!(
            with(Some("http://localhost:8080/konnect")),
            "http://localhost:8080/konnect/"
        );
    }
}
