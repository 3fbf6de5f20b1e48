use crate::model::{Database, DatabaseRef, Gateway, Id};
use crate::store::{DocumentStore, Filter, StoreError, DATABASES, GATEWAYS};
use anyhow::Context;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("gateway {0:?} already exists")]
    GatewayExists(Id),
    #[error("no database registered under id {0:?}")]
    UnknownDatabase(Id),
    #[error("interning lookup missed twice for the same database set")]
    Inconsistent,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Materialise database references into full descriptors.
///
/// Bare `{id}` references are looked up in the `databases` collection; full
/// descriptors are used as supplied. Repeated ids keep their first
/// occurrence.
pub async fn resolve_databases<S: DocumentStore>(
    store: &S,
    refs: &[DatabaseRef],
) -> Result<Vec<Database>, RegistryError> {
    let mut databases: Vec<Database> = Vec::with_capacity(refs.len());
    for db_ref in refs {
        if databases.iter().any(|db| &db.id == db_ref.id()) {
            continue;
        }
        match db_ref {
            DatabaseRef::Descriptor(new) => databases.push(new.clone().into_database()),
            DatabaseRef::Registered { id } => {
                let doc = match store.get(DATABASES, id).await {
                    Ok(doc) => doc,
                    Err(StoreError::NotFound) => {
                        return Err(RegistryError::UnknownDatabase(id.clone()))
                    }
                    Err(e) => return Err(e.into()),
                };
                let database: Database = serde_json::from_value(doc)
                    .context("stored database descriptor is malformed")
                    .map_err(StoreError::Backend)?;
                databases.push(database);
            }
        }
    }
    Ok(databases)
}

/// Resolve-or-create a gateway for a database set.
///
/// With an explicit id the record is inserted as-is and an id collision is a
/// caller error. Without one, the membership set is canonicalised and
/// interned: an existing gateway with the same sorted id set is returned,
/// otherwise a record with the set-derived id is inserted. A losing racer
/// observes the id conflict and re-reads; a second lookup miss means the
/// store broke its insert guarantee.
///
/// Returns the gateway and whether it was newly created.
pub async fn resolve_or_create<S: DocumentStore>(
    store: &S,
    databases: Vec<Database>,
    explicit_id: Option<Id>,
) -> Result<(Gateway, bool), RegistryError> {
    if let Some(id) = explicit_id {
        let gateway = Gateway::with_explicit_id(id, databases);
        match store.insert(GATEWAYS, to_document(&gateway)?).await {
            Ok(()) => return Ok((gateway, true)),
            Err(StoreError::IdConflict) => return Err(RegistryError::GatewayExists(gateway.id)),
            Err(e) => return Err(e.into()),
        }
    }

    let gateway = Gateway::interned(databases);
    let membership = Filter::new().eq("database_ids", json!(gateway.database_ids));

    match store.find_one(GATEWAYS, &membership).await {
        Ok(doc) => return Ok((from_document(doc)?, false)),
        Err(StoreError::NotFound) => {}
        Err(e) => return Err(e.into()),
    }

    match store.insert(GATEWAYS, to_document(&gateway)?).await {
        Ok(()) => Ok((gateway, true)),
        Err(StoreError::IdConflict) => {
            // Lost the interning race; the winner's record must be there now.
            match store.find_one(GATEWAYS, &membership).await {
                Ok(doc) => Ok((from_document(doc)?, false)),
                Err(StoreError::NotFound) => Err(RegistryError::Inconsistent),
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Load a gateway record by id.
pub async fn load_gateway<S: DocumentStore>(store: &S, id: &str) -> Result<Gateway, RegistryError> {
    let doc = store.get(GATEWAYS, id).await?;
    from_document(doc)
}

fn to_document(gateway: &Gateway) -> Result<serde_json::Value, RegistryError> {
    Ok(serde_json::to_value(gateway)
        .context("failed to serialize gateway record")
        .map_err(StoreError::Backend)?)
}

fn from_document(doc: serde_json::Value) -> Result<Gateway, RegistryError> {
    Ok(serde_json::from_value(doc)
        .context("stored gateway record is malformed")
        .map_err(StoreError::Backend)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewDatabase;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn descriptor(id: &str) -> DatabaseRef {
        DatabaseRef::Descriptor(NewDatabase {
            id: id.to_string(),
            name: id.to_uppercase(),
            base_url: format!("https://{id}.example.org"),
            api_version: "1.1.0".to_string(),
            description: None,
            homepage: None,
            provider: None,
        })
    }

    async fn databases(store: &MemoryStore, ids: &[&str]) -> Vec<Database> {
        let refs: Vec<DatabaseRef> = ids.iter().map(|id| descriptor(id)).collect();
        resolve_databases(store, &refs).await.unwrap()
    }

    #[tokio::test]
    async fn interning_is_deterministic_across_declaration_orders() {
        let store = MemoryStore::new();
        let (first, created) =
            resolve_or_create(&store, databases(&store, &["d2", "d1"]).await, None)
                .await
                .unwrap();
        assert!(created);

        let (second, created) =
            resolve_or_create(&store, databases(&store, &["d1", "d2"]).await, None)
                .await
                .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        // The original declaration order survives on the stored record.
        assert_eq!(first.databases[0].id, "d2");
        assert_eq!(first.database_ids, vec!["d1", "d2"]);
    }

    #[tokio::test]
    async fn concurrent_resolution_yields_one_record_and_one_id() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let dbs = databases(&store, &["d1", "d2"]).await;
                resolve_or_create(&*store, dbs, None).await.unwrap().0.id
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let (all, total) = store
            .list(GATEWAYS, &Filter::new(), &Default::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn explicit_id_collision_is_rejected() {
        let store = MemoryStore::new();
        let (gateway, created) = resolve_or_create(
            &store,
            databases(&store, &["d1"]).await,
            Some("g1".to_string()),
        )
        .await
        .unwrap();
        assert!(created);
        assert_eq!(gateway.id, "g1");

        // Any membership: explicit ids collide on the id alone.
        let err = resolve_or_create(
            &store,
            databases(&store, &["d2", "d3"]).await,
            Some("g1".to_string()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RegistryError::GatewayExists(id) if id == "g1"));
    }

    #[tokio::test]
    async fn explicit_ids_may_collide_on_membership() {
        let store = MemoryStore::new();
        let (interned, _) = resolve_or_create(&store, databases(&store, &["d1"]).await, None)
            .await
            .unwrap();
        let (explicit, created) = resolve_or_create(
            &store,
            databases(&store, &["d1"]).await,
            Some("pinned".to_string()),
        )
        .await
        .unwrap();
        assert!(created);
        assert_ne!(interned.id, explicit.id);
    }

    #[tokio::test]
    async fn unknown_database_reference_fails() {
        let store = MemoryStore::new();
        let err = resolve_databases(&store, &[DatabaseRef::Registered { id: "ghost".into() }])
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownDatabase(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn registered_reference_resolves_to_stored_descriptor() {
        let store = MemoryStore::new();
        let db = match descriptor("mp") {
            DatabaseRef::Descriptor(new) => new.into_database(),
            _ => unreachable!(),
        };
        store
            .insert(DATABASES, serde_json::to_value(&db).unwrap())
            .await
            .unwrap();

        let resolved = resolve_databases(&store, &[DatabaseRef::Registered { id: "mp".into() }])
            .await
            .unwrap();
        assert_eq!(resolved, vec![db]);
    }
}
