//! Resolves the Konnect IDs an entity needs before any remote call is made.
//!
//! Resolution only reads the reflector stores; an entity with an unresolved reference is requeued
//! instead of being sent to Konnect with a missing parent.

use std::fmt;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;

use crate::conditions::{is_condition_true, reasons, PROGRAMMED};
use crate::konnect::{
    AuthSource, DependencyKind, Identifiable, KonnectEntity, Parents, RefTarget,
};
use crate::resources::kongcertificates::{KongCertificate, KongSNI};
use crate::resources::kongconsumers::KongConsumer;
use crate::resources::kongplugins::{KongPlugin, KongPluginBinding};
use crate::resources::kongroutes::KongRoute;
use crate::resources::kongservices::KongService;
use crate::resources::kongupstreams::{KongTarget, KongUpstream};
use crate::resources::konnectapiauthconfigurations::KonnectAPIAuthConfiguration;
use crate::resources::konnectgatewaycontrolplanes::KonnectGatewayControlPlane;

/// Reader handles of every kind the resolver looks at.
#[derive(Clone)]
pub struct KonnectStores {
    pub auth_configs: Store<KonnectAPIAuthConfiguration>,
    pub control_planes: Store<KonnectGatewayControlPlane>,
    pub services: Store<KongService>,
    pub routes: Store<KongRoute>,
    pub consumers: Store<KongConsumer>,
    pub upstreams: Store<KongUpstream>,
    pub targets: Store<KongTarget>,
    pub certificates: Store<KongCertificate>,
    pub snis: Store<KongSNI>,
    pub plugins: Store<KongPlugin>,
    pub bindings: Store<KongPluginBinding>,
    /// Secrets labelled as Konnect credentials
    pub secrets: Store<Secret>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingDependency {
    pub kind: DependencyKind,
    pub target: RefTarget,
    /// Condition reason describing why it cannot be used yet
    pub reason: &'static str,
}

impl fmt::Display for MissingDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.reason {
            reasons::CONTROL_PLANE_REF_NOT_FOUND => "does not exist",
            reasons::AUTH_REF_NOT_READY => "has no usable KonnectAPIAuthConfiguration",
            _ => "is not programmed yet",
        };
        write!(f, "{} {} {state}", self.kind, self.target)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolveError {
    /// Retry once these have been programmed
    Missing(Vec<MissingDependency>),
    /// The references contradict each other or point somewhere entities cannot live
    Invalid { reason: &'static str, message: String },
}

impl ResolveError {
    pub fn reason(&self) -> &'static str {
        match self {
            ResolveError::Missing(missing) => missing
                .first()
                .map(|m| m.reason)
                .unwrap_or(reasons::PENDING),
            ResolveError::Invalid { reason, .. } => *reason,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ResolveError::Missing(missing) => missing
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
            ResolveError::Invalid { message, .. } => message.clone(),
        }
    }
}

/// What the resolver needs to know about a referenced entity.
struct Dependency {
    id: Option<String>,
    programmed: bool,
    control_plane_id: Option<String>,
}

fn dependency<K: KonnectEntity>(store: &Store<K>, namespace: &str, name: &str) -> Option<Dependency> {
    store
        .get(&ObjectRef::new(name).within(namespace))
        .map(|obj| Dependency {
            id: obj.konnect_id().map(str::to_owned),
            programmed: is_condition_true(obj.as_ref(), PROGRAMMED),
            control_plane_id: obj.control_plane_id().map(str::to_owned),
        })
}

fn not_found(kind: DependencyKind, target: &RefTarget) -> MissingDependency {
    MissingDependency {
        kind,
        target: target.clone(),
        reason: match kind {
            DependencyKind::ControlPlane => reasons::CONTROL_PLANE_REF_NOT_FOUND,
            _ => reasons::PENDING,
        },
    }
}

fn not_programmed(kind: DependencyKind, target: &RefTarget) -> MissingDependency {
    MissingDependency {
        kind,
        target: target.clone(),
        reason: match kind {
            DependencyKind::ControlPlane => reasons::CONTROL_PLANE_REF_NOT_PROGRAMMED,
            _ => reasons::PENDING,
        },
    }
}

impl KonnectStores {
    /// The IDs of everything `entity` references, or why they are not available.
    pub fn resolve<E: KonnectEntity>(&self, entity: &E) -> Result<Parents, ResolveError> {
        let mut parents = Parents::default();
        let mut missing = Vec::new();
        // control plane IDs inherited through parent edges, with the kind they came from
        let mut inherited: Vec<(String, DependencyKind)> = Vec::new();

        for reference in entity.references() {
            let (namespace, name) = match &reference.target {
                RefTarget::KonnectId(id) => {
                    parents.insert(reference.kind, id.clone());
                    continue;
                }
                RefTarget::Namespaced { namespace, name } => (namespace.as_str(), name.as_str()),
            };

            match reference.kind {
                DependencyKind::ControlPlane => {
                    let Some(cp) = self
                        .control_planes
                        .get(&ObjectRef::new(name).within(namespace))
                    else {
                        missing.push(not_found(reference.kind, &reference.target));
                        continue;
                    };
                    if cp.is_mirror() {
                        return Err(ResolveError::Invalid {
                            reason: reasons::CONTROL_PLANE_IS_MIRROR,
                            message: format!(
                                "KonnectGatewayControlPlane {namespace}/{name} is a mirror; entities cannot be created in it"
                            ),
                        });
                    }
                    match cp.konnect_id() {
                        Some(id) if is_condition_true(cp.as_ref(), PROGRAMMED) => {
                            parents.insert(DependencyKind::ControlPlane, id);
                            parents.auth = Some((
                                namespace.to_owned(),
                                cp.spec.konnect.api_auth_configuration_ref.name.clone(),
                            ));
                        }
                        _ => missing.push(not_programmed(reference.kind, &reference.target)),
                    }
                }
                DependencyKind::Plugin => {
                    match self.plugins.get(&ObjectRef::new(name).within(namespace)) {
                        Some(plugin) => parents.plugin = Some(plugin.spec.clone()),
                        None => missing.push(not_found(reference.kind, &reference.target)),
                    }
                }
                kind => {
                    let found = match kind {
                        DependencyKind::Service => dependency(&self.services, namespace, name),
                        DependencyKind::Route => dependency(&self.routes, namespace, name),
                        DependencyKind::Consumer => dependency(&self.consumers, namespace, name),
                        DependencyKind::Upstream => dependency(&self.upstreams, namespace, name),
                        DependencyKind::Certificate => {
                            dependency(&self.certificates, namespace, name)
                        }
                        DependencyKind::ControlPlane | DependencyKind::Plugin => None,
                    };
                    match found {
                        None => missing.push(not_found(kind, &reference.target)),
                        Some(Dependency {
                            id: Some(id),
                            programmed: true,
                            control_plane_id,
                        }) => {
                            parents.insert(kind, id);
                            if reference.is_parent {
                                inherited.extend(control_plane_id.map(|cp| (cp, kind)));
                            }
                        }
                        Some(_) => missing.push(not_programmed(kind, &reference.target)),
                    }
                }
            }
        }

        if !missing.is_empty() {
            return Err(ResolveError::Missing(missing));
        }

        for (cp, kind) in inherited {
            match parents.control_plane_id() {
                Some(existing) if existing != cp => {
                    return Err(ResolveError::Invalid {
                        reason: reasons::INVALID_SPEC,
                        message: format!(
                            "the referenced {kind} belongs to control plane {cp}, not {existing}"
                        ),
                    });
                }
                Some(_) => {}
                None => parents.insert(DependencyKind::ControlPlane, cp),
            }
        }

        match entity.auth_source() {
            AuthSource::Direct { namespace, name } => parents.auth = Some((namespace, name)),
            AuthSource::ControlPlane if parents.auth.is_none() => {
                if let Some(cp_id) = parents.control_plane_id().map(str::to_owned) {
                    let namespace = entity.namespace().unwrap_or_default();
                    match self.control_plane_by_id(&namespace, &cp_id) {
                        Some(cp) => {
                            parents.auth = Some((
                                cp.namespace().unwrap_or_default(),
                                cp.spec.konnect.api_auth_configuration_ref.name.clone(),
                            ))
                        }
                        None => {
                            return Err(ResolveError::Missing(vec![MissingDependency {
                                kind: DependencyKind::ControlPlane,
                                target: RefTarget::KonnectId(cp_id),
                                reason: reasons::AUTH_REF_NOT_READY,
                            }]))
                        }
                    }
                }
            }
            AuthSource::ControlPlane => {}
        }

        Ok(parents)
    }

    /// A local control plane with this Konnect ID, preferring one in `namespace`.
    pub fn control_plane_by_id(
        &self,
        namespace: &str,
        id: &str,
    ) -> Option<std::sync::Arc<KonnectGatewayControlPlane>> {
        let mut matches: Vec<_> = self
            .control_planes
            .state()
            .into_iter()
            .filter(|cp| cp.konnect_id() == Some(id))
            .collect();
        matches.sort_by_key(|cp| cp.namespace().as_deref() != Some(namespace));
        matches.into_iter().next()
    }

    /// Namespace and name of the auth configuration to use for `entity` when its references can no
    /// longer be resolved, e.g. while it is being deleted.
    pub fn recorded_auth<E: KonnectEntity>(&self, entity: &E) -> Option<(String, String)> {
        match entity.auth_source() {
            AuthSource::Direct { namespace, name } => Some((namespace, name)),
            AuthSource::ControlPlane => {
                let cp_id = entity.control_plane_id()?;
                let cp = self.control_plane_by_id(&entity.namespace().unwrap_or_default(), cp_id)?;
                Some((
                    cp.namespace().unwrap_or_default(),
                    cp.spec.konnect.api_auth_configuration_ref.name.clone(),
                ))
            }
        }
    }

    /// Entities that live inside the given object in Konnect and still hold their finalizer.
    pub fn dependents(&self, kind: DependencyKind, namespace: &str, name: &str) -> Vec<String> {
        let mut found = Vec::new();
        collect_dependents(&self.routes, kind, namespace, name, &mut found);
        collect_dependents(&self.targets, kind, namespace, name, &mut found);
        collect_dependents(&self.snis, kind, namespace, name, &mut found);
        collect_dependents(&self.bindings, kind, namespace, name, &mut found);
        found.sort();
        found
    }
}

fn collect_dependents<K: KonnectEntity>(
    store: &Store<K>,
    kind: DependencyKind,
    namespace: &str,
    name: &str,
    found: &mut Vec<String>,
) {
    for obj in store.state() {
        let holds_finalizer = obj.finalizers().iter().any(|f| f == K::FINALIZER);
        let is_child = obj
            .references()
            .iter()
            .any(|r| r.is_parent && r.refers_to(kind, namespace, name));
        if holds_finalizer && is_child {
            found.push(obj.display_name());
        }
    }
}
