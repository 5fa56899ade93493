//! Capabilities every Konnect-backed custom resource provides to the generic entity reconciler.

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::hash::Hasher;

use kube::core::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::conditions::Conditioned;
use crate::diff;
use crate::konnect::{ListFilter, RemoteObject};
use crate::resources::common::{AdoptOptions, KonnectEntityStatus, NamespacedRef};
use crate::resources::kongplugins::KongPluginSpec;

pub const UID_KEY: &str = "k8s-uid";

pub fn uid_tag(uid: &str) -> String {
    format!("{UID_KEY}:{uid}")
}

/// The kinds an entity can depend on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependencyKind {
    ControlPlane,
    Service,
    Route,
    Consumer,
    Upstream,
    Certificate,
    /// Local only; supplies configuration rather than an ID
    Plugin,
}

impl DependencyKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            DependencyKind::ControlPlane => "KonnectGatewayControlPlane",
            DependencyKind::Service => "KongService",
            DependencyKind::Route => "KongRoute",
            DependencyKind::Consumer => "KongConsumer",
            DependencyKind::Upstream => "KongUpstream",
            DependencyKind::Certificate => "KongCertificate",
            DependencyKind::Plugin => "KongPlugin",
        }
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RefTarget {
    Namespaced { namespace: String, name: String },
    KonnectId(String),
}

impl fmt::Display for RefTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefTarget::Namespaced { namespace, name } => write!(f, "{namespace}/{name}"),
            RefTarget::KonnectId(id) => write!(f, "konnectID {id}"),
        }
    }
}

/// One edge of the dependency graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityReference {
    pub kind: DependencyKind,
    pub target: RefTarget,
    /// The referrer lives inside the referenced object in Konnect: it inherits the control plane
    /// of its parent, and the parent cannot be deleted while the referrer exists.
    pub is_parent: bool,
}

impl EntityReference {
    pub fn namespaced(kind: DependencyKind, r: &NamespacedRef, default_namespace: &str) -> Self {
        Self {
            kind,
            target: RefTarget::Namespaced {
                namespace: r.namespace_or(default_namespace).to_owned(),
                name: r.name.clone(),
            },
            is_parent: false,
        }
    }

    pub fn parent(mut self) -> Self {
        self.is_parent = true;
        self
    }

    pub fn refers_to(&self, kind: DependencyKind, namespace: &str, name: &str) -> bool {
        self.kind == kind
            && matches!(&self.target, RefTarget::Namespaced { namespace: ns, name: n } if ns == namespace && n == name)
    }
}

/// IDs (and plugin configuration) an entity needs from the objects it references.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Parents {
    ids: BTreeMap<DependencyKind, String>,
    pub plugin: Option<KongPluginSpec>,
    /// Namespace and name of the KonnectAPIAuthConfiguration to call Konnect with
    pub auth: Option<(String, String)>,
}

impl Parents {
    pub fn get(&self, kind: DependencyKind) -> Option<&str> {
        self.ids.get(&kind).map(String::as_str)
    }

    pub fn insert(&mut self, kind: DependencyKind, id: impl Into<String>) {
        self.ids.insert(kind, id.into());
    }

    pub fn with(mut self, kind: DependencyKind, id: impl Into<String>) -> Self {
        self.insert(kind, id);
        self
    }

    pub fn control_plane_id(&self) -> Option<&str> {
        self.get(DependencyKind::ControlPlane)
    }

    /// The IDs recorded in an entity's status by an earlier successful reconcile.
    pub fn from_status(status: &KonnectEntityStatus) -> Self {
        let mut parents = Parents::default();
        for (kind, id) in [
            (DependencyKind::ControlPlane, &status.control_plane_id),
            (DependencyKind::Service, &status.service_id),
            (DependencyKind::Route, &status.route_id),
            (DependencyKind::Consumer, &status.consumer_id),
            (DependencyKind::Upstream, &status.upstream_id),
            (DependencyKind::Certificate, &status.certificate_id),
        ] {
            if let Some(id) = id {
                parents.insert(kind, id.clone());
            }
        }
        parents
    }
}

/// Access to the Konnect ID of an object and the IDs of the objects it hangs off.
pub trait Identifiable {
    fn konnect_status(&self) -> Option<&KonnectEntityStatus>;

    fn konnect_status_mut(&mut self) -> &mut KonnectEntityStatus;

    fn konnect_id(&self) -> Option<&str> {
        self.konnect_status().and_then(|s| s.id.as_deref())
    }

    fn set_konnect_id(&mut self, id: Option<String>) {
        self.konnect_status_mut().id = id;
    }

    fn control_plane_id(&self) -> Option<&str> {
        self.konnect_status()
            .and_then(|s| s.control_plane_id.as_deref())
    }

    /// Store resolved parent IDs. References that were dropped from the spec clear their ID,
    /// except the control plane ID which is only ever replaced.
    fn record_parents(&mut self, parents: &Parents) {
        let status = self.konnect_status_mut();
        if let Some(cp) = parents.control_plane_id() {
            status.control_plane_id = Some(cp.to_owned());
        }
        let id = |kind| parents.get(kind).map(str::to_owned);
        status.service_id = id(DependencyKind::Service);
        status.route_id = id(DependencyKind::Route);
        status.consumer_id = id(DependencyKind::Consumer);
        status.upstream_id = id(DependencyKind::Upstream);
        status.certificate_id = id(DependencyKind::Certificate);
    }

    /// Hash of the payload the remote object was last created or updated with.
    fn applied_payload_hash(&self) -> Option<&str> {
        self.konnect_status().and_then(|s| s.payload_hash.as_deref())
    }

    fn recorded_parents(&self) -> Parents {
        self.konnect_status()
            .map(Parents::from_status)
            .unwrap_or_default()
    }
}

/// The references an object makes to other objects.
pub trait DependencyResolvable {
    fn references(&self) -> Vec<EntityReference>;
}

/// Which KonnectAPIAuthConfiguration an entity authenticates with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthSource {
    /// Whatever the resolved control plane uses
    ControlPlane,
    /// This one, by namespace and name
    Direct { namespace: String, name: String },
}

/// A custom resource that is synchronized with one object in Konnect.
pub trait KonnectEntity:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Conditioned
    + Identifiable
    + DependencyResolvable
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const FINALIZER: &'static str;

    /// What this kind is when other entities reference it
    const DEPENDENCY: Option<DependencyKind>;

    /// Reject contradictory specs before anything is resolved.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// Collection path of this object, or None if a required parent ID is missing.
    fn collection(&self, parents: &Parents) -> Option<String>;

    /// The body to create or update the remote object with.
    fn payload(&self, parents: &Parents) -> Value;

    /// Whether the remote object needs an update to match `desired`.
    fn drifted(&self, desired: &Value, remote: &RemoteObject) -> bool {
        diff::differs(desired, &remote.fields)
    }

    fn adopt(&self) -> Option<&AdoptOptions> {
        None
    }

    /// How to find this object remotely after a create was rejected as a duplicate.
    fn adoption_filter(&self) -> ListFilter {
        ListFilter::Tags(vec![uid_tag(self.uid().as_deref().unwrap_or_default())])
    }

    fn auth_source(&self) -> AuthSource {
        AuthSource::ControlPlane
    }

    /// For read-only mirrors, the ID of the remote object being mirrored.
    fn mirror_id(&self) -> Option<&str> {
        None
    }

    /// Copy derived fields of the remote object into the status.
    fn on_programmed(&mut self, _remote: &RemoteObject) {}

    /// `Kind namespace/name`, for messages and events.
    fn display_name(&self) -> String {
        format!(
            "{} {}/{}",
            Self::kind(&()),
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}

/// Tags that tie a remote object to the Kubernetes object it was created from, followed by the
/// user's tags.
pub fn entity_tags<K: Resource<DynamicType = ()>>(obj: &K, user_tags: Option<&[String]>) -> Vec<String> {
    let meta = obj.meta();
    let mut tags = vec![
        format!("k8s-name:{}", meta.name.as_deref().unwrap_or_default()),
        format!("k8s-namespace:{}", meta.namespace.as_deref().unwrap_or_default()),
        uid_tag(meta.uid.as_deref().unwrap_or_default()),
        format!("k8s-kind:{}", K::kind(&())),
        format!("k8s-version:{}", K::version(&())),
    ];
    let group = K::group(&());
    if !group.is_empty() {
        tags.push(format!("k8s-group:{group}"));
    }
    for tag in user_tags.unwrap_or_default() {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
    tags
}

/// Drop null members recursively so optional fields fall back to Konnect's defaults.
pub fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

/// Stable hash of a request body. Object keys serialize sorted, so equal bodies hash equally.
pub fn payload_hash(payload: &Value) -> String {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(payload.to_string().as_bytes());
    format!("{:016x}", hasher.finish())
}

/// `{"id": ...}` reference to a parent in a payload.
pub fn id_ref(id: Option<&str>) -> Value {
    match id {
        Some(id) => serde_json::json!({ "id": id }),
        None => Value::Null,
    }
}
