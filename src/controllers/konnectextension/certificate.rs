//! The client certificate of a KonnectExtension: the Secret that holds it and its registration
//! with the control plane.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::*;

use crate::conditions::reasons;
use crate::controllers::{MANAGED_BY_LABEL, MANAGER};
use crate::konnect::{KonnectApi, KonnectError, ListFilter, RemoteObject};
use crate::pki::{self, KeyPairPem, TLS_SECRET_TYPE};
use crate::resources::konnectextensions::{CertificateProvisioning, KonnectExtension};
use crate::resources::konnectgatewaycontrolplanes::CONTROL_PLANES_COLLECTION;
use crate::{Error, Result};

/// Set on generated certificate Secrets, value is the extension name
pub const EXTENSION_LABEL: &str = "konnect.konghq.com/konnectextension";

const GENERATED_SECRET_PREFIX: &str = "konnect-client-tls-";

/// Name of the Secret holding the extension's client certificate.
pub(crate) fn secret_name(ext: &KonnectExtension) -> Result<String> {
    match ext.provisioning() {
        CertificateProvisioning::Automatic => {
            Ok(format!("{GENERATED_SECRET_PREFIX}{}", ext.name_any()))
        }
        CertificateProvisioning::Manual => ext
            .spec
            .client_auth
            .as_ref()
            .and_then(|a| a.certificate_secret.certificate_secret_ref.as_ref())
            .map(|r| r.name.clone())
            .ok_or_else(|| Error::InvalidEntity {
                reason: reasons::INVALID_SPEC.into(),
                message: "clientAuth.certificateSecret.certificateSecretRef is required when provisioning is Manual".into(),
            }),
    }
}

/// Where the key pair of an extension came from.
#[derive(Debug)]
pub(crate) enum KeyPairSource {
    /// Read from the Secret as it is
    Stored(KeyPairPem),
    /// Freshly generated, the Secret has to be written
    Generated(KeyPairPem),
}

impl KeyPairSource {
    pub fn pair(&self) -> &KeyPairPem {
        match self {
            KeyPairSource::Stored(pair) | KeyPairSource::Generated(pair) => pair,
        }
    }
}

fn is_generated_for(secret: &Secret, ext: &KonnectExtension) -> bool {
    secret.labels().get(EXTENSION_LABEL) == Some(&ext.name_any())
}

/// The key pair of `ext`, given what is currently stored in its Secret.
///
/// Manual provisioning only ever reads. Automatic provisioning reuses a well-formed Secret it
/// generated before and otherwise generates a new pair, but never takes over a Secret it did not
/// create.
pub(crate) fn key_pair(
    ext: &KonnectExtension,
    secret_name: &str,
    existing: Option<&Secret>,
) -> Result<KeyPairSource> {
    match ext.provisioning() {
        CertificateProvisioning::Manual => {
            let secret = existing.ok_or_else(|| Error::NotReady {
                message: format!("certificate Secret {secret_name} does not exist"),
                reason: reasons::CERTIFICATE_SECRET_NOT_FOUND.into(),
                requeue_after: None,
            })?;
            KeyPairPem::from_secret_data(secret.data.as_ref())
                .map(KeyPairSource::Stored)
                .map_err(|err| Error::NotReady {
                    message: format!("certificate Secret {secret_name} is unusable: {err}"),
                    reason: reasons::CERTIFICATE_SECRET_INVALID.into(),
                    requeue_after: None,
                })
        }
        CertificateProvisioning::Automatic => {
            if let Some(secret) = existing {
                if !is_generated_for(secret, ext) {
                    return Err(Error::InvalidEntity {
                        reason: reasons::CERTIFICATE_SECRET_INVALID.into(),
                        message: format!(
                            "Secret {secret_name} already exists and was not generated for this KonnectExtension"
                        ),
                    });
                }
                match KeyPairPem::from_secret_data(secret.data.as_ref()) {
                    Ok(pair) => return Ok(KeyPairSource::Stored(pair)),
                    Err(err) => warn!("Regenerating certificate Secret {secret_name}: {err}"),
                }
            }
            let pair = pki::generate_client_certificate(&ext.name_any())?;
            Ok(KeyPairSource::Generated(pair))
        }
    }
}

/// The generated Secret, owned by the extension so it is collected with it.
pub(crate) fn certificate_secret(
    ext: &KonnectExtension,
    name: &str,
    pair: &KeyPairPem,
) -> Result<Secret> {
    let oref = ext
        .controller_owner_ref(&())
        .ok_or_else(|| Error::InvalidEntity {
            reason: reasons::FAILED_RECONCILE.into(),
            message: "KonnectExtension has no uid yet".into(),
        })?;
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: ext.namespace(),
            labels: Some(BTreeMap::from([
                (MANAGED_BY_LABEL.into(), MANAGER.into()),
                (EXTENSION_LABEL.into(), ext.name_any()),
            ])),
            owner_references: Some(vec![oref]),
            ..Default::default()
        },
        type_: Some(TLS_SECRET_TYPE.into()),
        data: Some(pair.secret_data()),
        ..Default::default()
    })
}

pub(crate) async fn apply_secret(secret_api: &Api<Secret>, secret: Secret) -> Result<()> {
    let name = secret.name_any();
    let params = PatchParams::apply(MANAGER).force();
    debug!(
        "Applying certificate Secret {} in namespace {}",
        name,
        secret.namespace().unwrap_or_default()
    );
    secret_api
        .patch(&name, &params, &Patch::Apply(&secret))
        .await?;
    Ok(())
}

pub(crate) fn certificates_collection(control_plane_id: &str) -> String {
    format!("{CONTROL_PLANES_COLLECTION}/{control_plane_id}/dp-client-certificates")
}

fn holds(remote: &RemoteObject, cert: &str) -> bool {
    remote.fields.get("cert").and_then(Value::as_str).map(str::trim) == Some(cert.trim())
}

/// Make sure `cert` is registered with the control plane and return its ID there.
///
/// `registered` is the ID recorded by an earlier reconcile. A certificate that was rotated
/// locally is replaced, one deleted out of band is registered again.
pub(crate) async fn register<A: KonnectApi>(
    api: &A,
    control_plane_id: &str,
    registered: Option<&str>,
    cert: &str,
) -> Result<String, KonnectError> {
    let collection = certificates_collection(control_plane_id);
    if let Some(id) = registered {
        match api.get(&collection, id).await {
            Ok(remote) if holds(&remote, cert) => return Ok(id.to_owned()),
            Ok(_) => {
                info!("Client certificate {id} was rotated, replacing it in control plane {control_plane_id}");
                unregister(api, control_plane_id, id).await?;
            }
            Err(err) if err.is_not_found() => {
                info!("Client certificate {id} is gone from control plane {control_plane_id}");
            }
            Err(err) => return Err(err),
        }
    }

    match api.create(&collection, &json!({ "cert": cert })).await {
        Ok(remote) => {
            info!("Registered client certificate {} with control plane {control_plane_id}", remote.id);
            Ok(remote.id)
        }
        // registered by an earlier attempt whose response was lost
        Err(err) if err.is_conflict() => api
            .list(&collection, &ListFilter::Tags(Vec::new()))
            .await?
            .into_iter()
            .find(|remote| holds(remote, cert))
            .map(|remote| remote.id)
            .ok_or(err),
        Err(err) => Err(err),
    }
}

/// Remove a certificate from the control plane; one that is already gone counts as removed.
pub(crate) async fn unregister<A: KonnectApi>(
    api: &A,
    control_plane_id: &str,
    id: &str,
) -> Result<(), KonnectError> {
    match api.delete(&certificates_collection(control_plane_id), id).await {
        Err(err) if err.is_not_found() => Ok(()),
        result => result,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::konnect::testing::{InMemoryKonnect, Op};
    use crate::resources::common::EntityRef;
    use crate::resources::konnectextensions::{
        CertificateSecret, DataPlaneClientAuth, KonnectExtensionControlPlane,
        KonnectExtensionKonnect, KonnectExtensionSpec, SecretRef,
    };

    pub(crate) fn extension(provisioning: CertificateProvisioning, secret: Option<&str>) -> KonnectExtension {
        let mut ext = KonnectExtension::new(
            "ext",
            KonnectExtensionSpec {
                konnect: KonnectExtensionKonnect {
                    control_plane: KonnectExtensionControlPlane {
                        control_plane_ref: EntityRef::namespaced("cp"),
                    },
                },
                client_auth: Some(DataPlaneClientAuth {
                    certificate_secret: CertificateSecret {
                        provisioning,
                        certificate_secret_ref: secret.map(|name| SecretRef { name: name.into() }),
                    },
                }),
            },
        );
        ext.metadata.namespace = Some("default".into());
        ext.metadata.uid = Some("uid-ext".into());
        ext.metadata.generation = Some(1);
        ext
    }

    #[test]
    fn manual_provisioning_requires_a_secret_ref() {
        let ext = extension(CertificateProvisioning::Manual, None);
        assert!(matches!(
            secret_name(&ext),
            Err(Error::InvalidEntity { reason, .. }) if reason == reasons::INVALID_SPEC
        ));
        let ext = extension(CertificateProvisioning::Manual, Some("my-tls"));
        assert_eq!(secret_name(&ext).unwrap(), "my-tls");
        let ext = extension(CertificateProvisioning::Automatic, None);
        assert_eq!(secret_name(&ext).unwrap(), "konnect-client-tls-ext");
    }

    #[test]
    fn manual_secret_must_exist_and_hold_a_key_pair() {
        let ext = extension(CertificateProvisioning::Manual, Some("my-tls"));
        assert!(matches!(
            key_pair(&ext, "my-tls", None),
            Err(Error::NotReady { reason, .. }) if reason == reasons::CERTIFICATE_SECRET_NOT_FOUND
        ));

        let broken = Secret {
            data: Some(BTreeMap::new()),
            ..Default::default()
        };
        assert!(matches!(
            key_pair(&ext, "my-tls", Some(&broken)),
            Err(Error::NotReady { reason, .. }) if reason == reasons::CERTIFICATE_SECRET_INVALID
        ));

        let pair = pki::generate_client_certificate("dp").unwrap();
        let valid = Secret {
            data: Some(pair.secret_data()),
            ..Default::default()
        };
        assert!(matches!(
            key_pair(&ext, "my-tls", Some(&valid)),
            Ok(KeyPairSource::Stored(stored)) if stored.cert == pair.cert
        ));
    }

    #[test]
    fn automatic_provisioning_reuses_its_own_secret() {
        let ext = extension(CertificateProvisioning::Automatic, None);
        let generated = match key_pair(&ext, "konnect-client-tls-ext", None).unwrap() {
            KeyPairSource::Generated(pair) => pair,
            other => panic!("expected a generated pair, got {other:?}"),
        };

        let secret = certificate_secret(&ext, "konnect-client-tls-ext", &generated).unwrap();
        assert_eq!(secret.type_.as_deref(), Some(TLS_SECRET_TYPE));
        assert_eq!(
            secret.metadata.owner_references.as_ref().unwrap()[0].uid,
            "uid-ext"
        );
        assert!(matches!(
            key_pair(&ext, "konnect-client-tls-ext", Some(&secret)),
            Ok(KeyPairSource::Stored(stored)) if stored.cert == generated.cert
        ));
    }

    #[test]
    fn automatic_provisioning_leaves_foreign_secrets_alone() {
        let ext = extension(CertificateProvisioning::Automatic, None);
        let foreign = Secret {
            data: Some(pki::generate_client_certificate("x").unwrap().secret_data()),
            ..Default::default()
        };
        assert!(matches!(
            key_pair(&ext, "konnect-client-tls-ext", Some(&foreign)),
            Err(Error::InvalidEntity { reason, .. }) if reason == reasons::CERTIFICATE_SECRET_INVALID
        ));
    }

    #[tokio::test]
    async fn registration_is_idempotent_and_follows_rotation() {
        let konnect = InMemoryKonnect::new();
        let collection = certificates_collection("cp-1");

        let first = register(&konnect, "cp-1", None, "CERT-A").await.unwrap();
        assert_eq!(konnect.object(&collection, &first).unwrap()["cert"], "CERT-A");

        let again = register(&konnect, "cp-1", Some(&first), "CERT-A").await.unwrap();
        assert_eq!(again, first);
        assert_eq!(konnect.count(Op::Create), 1);

        let rotated = register(&konnect, "cp-1", Some(&first), "CERT-B").await.unwrap();
        assert_ne!(rotated, first);
        assert_eq!(konnect.ids(&collection), vec![rotated.clone()]);
    }

    #[tokio::test]
    async fn certificate_deleted_out_of_band_is_registered_again() {
        let konnect = InMemoryKonnect::new();
        let id = register(&konnect, "cp-1", Some("gone"), "CERT").await.unwrap();
        assert_ne!(id, "gone");
        assert_eq!(konnect.count(Op::Create), 1);
    }

    #[tokio::test]
    async fn conflicting_create_adopts_the_registered_certificate() {
        let konnect = InMemoryKonnect::new();
        let collection = certificates_collection("cp-1");
        konnect.insert(&collection, "existing", json!({ "cert": "CERT\n" }));
        konnect.fail_next(Op::Create, KonnectError::Conflict("already registered".into()));

        assert_eq!(register(&konnect, "cp-1", None, "CERT").await.unwrap(), "existing");
    }

    #[tokio::test]
    async fn unregistering_a_missing_certificate_succeeds() {
        let konnect = InMemoryKonnect::new();
        assert!(unregister(&konnect, "cp-1", "nope").await.is_ok());
        konnect.fail_next(
            Op::Delete,
            KonnectError::Server {
                status: 502,
                message: "bad gateway".into(),
            },
        );
        assert!(unregister(&konnect, "cp-1", "nope").await.is_err());
    }
}
