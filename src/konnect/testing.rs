//! An in-memory Konnect for reconciler tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Value};

use super::{
    Credentials, KonnectApi, KonnectApiFactory, KonnectError, ListFilter, Organization,
    RemoteObject,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Create,
    Get,
    Update,
    Delete,
    List,
    CurrentOrganization,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub collection: String,
    pub id: Option<String>,
}

#[derive(Default)]
struct Inner {
    collections: BTreeMap<String, BTreeMap<String, Value>>,
    calls: Vec<Call>,
    failures: Vec<(Op, KonnectError)>,
    credentials: Vec<Credentials>,
    next_id: u64,
    reject_duplicates: bool,
}

/// Stores objects per collection path and records every call made against it.
#[derive(Clone, Default)]
pub struct InMemoryKonnect {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryKonnect {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject creates of objects whose name or ownership tag is already taken, like Konnect does.
    pub fn rejecting_duplicates(self) -> Self {
        self.lock().reject_duplicates = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an object as if it had been created outside the operator.
    pub fn insert(&self, collection: &str, id: &str, fields: Value) {
        let mut fields = fields;
        fields["id"] = json!(id);
        self.lock()
            .collections
            .entry(collection.to_owned())
            .or_default()
            .insert(id.to_owned(), fields);
    }

    /// Make the next call of this kind fail.
    pub fn fail_next(&self, op: Op, error: KonnectError) {
        self.lock().failures.push((op, error));
    }

    pub fn object(&self, collection: &str, id: &str) -> Option<Value> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
    }

    pub fn ids(&self, collection: &str) -> Vec<String> {
        self.lock()
            .collections
            .get(collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn credentials_used(&self) -> Vec<Credentials> {
        self.lock().credentials.clone()
    }

    fn begin(&self, op: Op, collection: &str, id: Option<&str>) -> Result<MutexGuard<'_, Inner>, KonnectError> {
        let mut inner = self.lock();
        inner.calls.push(Call {
            op,
            collection: collection.to_owned(),
            id: id.map(str::to_owned),
        });
        if let Some(pos) = inner.failures.iter().position(|(o, _)| *o == op) {
            let (_, error) = inner.failures.remove(pos);
            return Err(error);
        }
        Ok(inner)
    }
}

fn tags(value: &Value) -> Vec<&str> {
    value
        .get("tags")
        .and_then(Value::as_array)
        .map(|t| t.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn with_derived_fields(collection: &str, id: &str, body: &Value) -> Value {
    let mut fields = body.clone();
    fields["id"] = json!(id);
    if collection == "v2/control-planes" {
        fields["config"] = json!({
            "control_plane_endpoint": format!("https://{id}.cp.konghq.tech"),
            "telemetry_endpoint": format!("https://{id}.tp.konghq.tech"),
        });
    }
    fields
}

impl KonnectApi for InMemoryKonnect {
    async fn create(&self, collection: &str, body: &Value) -> Result<RemoteObject, KonnectError> {
        let mut inner = self.begin(Op::Create, collection, None)?;
        if inner.reject_duplicates {
            let name = body.get("name").filter(|n| !n.is_null());
            let uid_tag = tags(body).into_iter().find(|t| t.starts_with("k8s-uid:"));
            let duplicate = inner
                .collections
                .get(collection)
                .into_iter()
                .flat_map(|c| c.values())
                .any(|existing| {
                    (name.is_some() && existing.get("name") == name)
                        || uid_tag.is_some_and(|t| tags(existing).contains(&t))
                });
            if duplicate {
                return Err(KonnectError::Conflict(format!("duplicate in {collection}")));
            }
        }
        inner.next_id += 1;
        let id = format!("{}-{}", collection.rsplit('/').next().unwrap_or("obj"), inner.next_id);
        let fields = with_derived_fields(collection, &id, body);
        inner
            .collections
            .entry(collection.to_owned())
            .or_default()
            .insert(id, fields.clone());
        RemoteObject::from_value(fields)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<RemoteObject, KonnectError> {
        let inner = self.begin(Op::Get, collection, Some(id))?;
        let fields = inner
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
            .ok_or_else(|| KonnectError::NotFound(format!("{collection}/{id}")))?;
        RemoteObject::from_value(fields)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        body: &Value,
    ) -> Result<RemoteObject, KonnectError> {
        let mut inner = self.begin(Op::Update, collection, Some(id))?;
        let objects = inner.collections.entry(collection.to_owned()).or_default();
        let existing = objects
            .get_mut(id)
            .ok_or_else(|| KonnectError::NotFound(format!("{collection}/{id}")))?;
        *existing = with_derived_fields(collection, id, body);
        RemoteObject::from_value(existing.clone())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), KonnectError> {
        let mut inner = self.begin(Op::Delete, collection, Some(id))?;
        inner
            .collections
            .get_mut(collection)
            .and_then(|c| c.remove(id))
            .map(|_| ())
            .ok_or_else(|| KonnectError::NotFound(format!("{collection}/{id}")))
    }

    async fn list(
        &self,
        collection: &str,
        filter: &ListFilter,
    ) -> Result<Vec<RemoteObject>, KonnectError> {
        let inner = self.begin(Op::List, collection, None)?;
        inner
            .collections
            .get(collection)
            .into_iter()
            .flat_map(|c| c.values())
            .filter(|o| match filter {
                ListFilter::Tags(wanted) => {
                    let have = tags(o);
                    wanted.iter().all(|t| have.contains(&t.as_str()))
                }
                ListFilter::Name(name) => o.get("name").and_then(Value::as_str) == Some(name),
            })
            .map(|o| RemoteObject::from_value(o.clone()))
            .collect()
    }

    async fn current_organization(&self) -> Result<Organization, KonnectError> {
        self.begin(Op::CurrentOrganization, "v3/organizations/me", None)?;
        Ok(Organization {
            id: "org-1".into(),
            name: "Test Organization".into(),
        })
    }
}

impl KonnectApiFactory for InMemoryKonnect {
    type Api = InMemoryKonnect;

    fn api_for(&self, credentials: &Credentials) -> InMemoryKonnect {
        self.lock().credentials.push(credentials.clone());
        self.clone()
    }
}
