//! The per-entity protocol against Konnect: adopt, create, update on drift, delete.

use std::fmt;

use kube::ResourceExt;
use tracing::*;

use crate::konnect::entity::payload_hash;
use crate::konnect::{KonnectApi, KonnectEntity, KonnectError, Parents, RemoteObject};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    /// An existing remote object was taken over, either declared or after a duplicate create
    Adopted,
    Updated,
    Unchanged,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncOutcome::Created => "created",
            SyncOutcome::Adopted => "adopted",
            SyncOutcome::Updated => "updated",
            SyncOutcome::Unchanged => "unchanged",
        })
    }
}

/// Converge the remote object of `entity` with its spec.
///
/// On success the entity's status carries the remote ID and the parent IDs it was created with.
pub async fn sync<E, A>(
    api: &A,
    entity: &mut E,
    collection: &str,
    parents: &Parents,
) -> Result<SyncOutcome, KonnectError>
where
    E: KonnectEntity,
    A: KonnectApi,
{
    let desired = entity.payload(parents);
    let hash = payload_hash(&desired);
    let (remote, outcome) = match entity.konnect_id().map(str::to_owned) {
        None => create_or_adopt(api, entity, collection, &desired, true).await?,
        Some(id) => match api.get(collection, &id).await {
            Ok(_) if entity.applied_payload_hash() != Some(hash.as_str()) => {
                info!("{} changed, updating {id}", entity.display_name());
                (api.update(collection, &id, &desired).await?, SyncOutcome::Updated)
            }
            Ok(remote) if entity.drifted(&desired, &remote) => {
                info!("{} drifted from its spec, updating {id}", entity.display_name());
                (api.update(collection, &id, &desired).await?, SyncOutcome::Updated)
            }
            Ok(remote) => (remote, SyncOutcome::Unchanged),
            Err(e) if e.is_not_found() => {
                warn!(
                    "{} was deleted from Konnect outside the operator, recreating",
                    entity.display_name()
                );
                entity.set_konnect_id(None);
                create_or_adopt(api, entity, collection, &desired, false).await?
            }
            Err(e) => return Err(e),
        },
    };

    entity.set_konnect_id(Some(remote.id.clone()));
    entity.konnect_status_mut().payload_hash = Some(hash);
    entity.record_parents(parents);
    entity.on_programmed(&remote);
    Ok(outcome)
}

async fn create_or_adopt<E, A>(
    api: &A,
    entity: &E,
    collection: &str,
    desired: &serde_json::Value,
    allow_declared_adoption: bool,
) -> Result<(RemoteObject, SyncOutcome), KonnectError>
where
    E: KonnectEntity,
    A: KonnectApi,
{
    // Match mode behaves like override until it has semantics of its own
    if let Some(adopt) = entity.adopt().filter(|_| allow_declared_adoption) {
        info!(
            "Adopting Konnect object {} for {}",
            adopt.konnect.id,
            entity.display_name()
        );
        let remote = api.update(collection, &adopt.konnect.id, desired).await?;
        return Ok((remote, SyncOutcome::Adopted));
    }

    match api.create(collection, desired).await {
        Ok(remote) => Ok((remote, SyncOutcome::Created)),
        Err(e) if e.is_conflict() => {
            // an earlier create may have succeeded without its ID being recorded
            let uid = entity.uid().unwrap_or_default();
            let existing = api
                .list(collection, &entity.adoption_filter())
                .await?
                .into_iter()
                .find(|o| o.is_owned_by(&uid));
            match existing {
                Some(existing) => {
                    info!(
                        "{} already exists in Konnect as {}, adopting it",
                        entity.display_name(),
                        existing.id
                    );
                    let remote = api.update(collection, &existing.id, desired).await?;
                    Ok((remote, SyncOutcome::Adopted))
                }
                None => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

/// Read the remote object a mirror points at. Nothing is ever written.
pub async fn mirror<E, A>(
    api: &A,
    entity: &mut E,
    collection: &str,
    id: &str,
) -> Result<SyncOutcome, KonnectError>
where
    E: KonnectEntity,
    A: KonnectApi,
{
    let remote = api.get(collection, id).await?;
    entity.set_konnect_id(Some(remote.id.clone()));
    entity.on_programmed(&remote);
    Ok(SyncOutcome::Unchanged)
}

/// Delete the remote object of `entity`, using the parent IDs recorded when it was programmed.
///
/// Returns whether anything was deleted; an object that is already gone counts as deleted.
pub async fn delete<E, A>(api: &A, entity: &E) -> Result<bool, KonnectError>
where
    E: KonnectEntity,
    A: KonnectApi,
{
    let Some(id) = entity.konnect_id() else {
        return Ok(false);
    };
    let Some(collection) = entity.collection(&entity.recorded_parents()) else {
        warn!(
            "{} has no recorded parents, leaving Konnect object {id} in place",
            entity.display_name()
        );
        return Ok(false);
    };
    match api.delete(&collection, id).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => {
            debug!("Konnect object {id} of {} was already gone", entity.display_name());
            Ok(true)
        }
        Err(e) => Err(e),
    }
}
