//! Store backend backed by the Kubernetes API server

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use kube_runtime::watcher::{self, Event};
use kube_runtime::WatchStreamExt;
use serde_json::Value;

use super::{Selector, StoreBackend, WatchEvent};
use crate::crd::meta::FIELD_MANAGER;
use crate::error::{Error, Result};

/// Reads and writes lattice resources through the API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }
}

/// Translate API status codes into the store's error vocabulary
fn map_error(err: kube::Error, resource: &ApiResource, key: String) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound {
            kind: resource.kind.clone(),
            key,
        },
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::AlreadyExists {
                kind: resource.kind.clone(),
                key,
            }
        }
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict {
            kind: resource.kind.clone(),
            key,
            message: ae.message,
        },
        other => Error::KubeError(other),
    }
}

fn key_of(obj: &DynamicObject) -> String {
    format!(
        "{}/{}",
        obj.metadata.namespace.as_deref().unwrap_or_default(),
        obj.metadata.name.as_deref().unwrap_or_default()
    )
}

#[async_trait]
impl StoreBackend for KubeStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.api(resource, Some(namespace))
            .get_opt(name)
            .await
            .map_err(|e| map_error(e, resource, format!("{namespace}/{name}")))
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_query());
        }
        let list = self.api(resource, namespace).list(&params).await?;
        Ok(list.items)
    }

    async fn create(&self, resource: &ApiResource, object: DynamicObject) -> Result<DynamicObject> {
        let key = key_of(&object);
        let namespace = object.metadata.namespace.clone();
        self.api(resource, namespace.as_deref())
            .create(&Self::post_params(), &object)
            .await
            .map_err(|e| map_error(e, resource, key))
    }

    async fn replace(&self, resource: &ApiResource, object: DynamicObject) -> Result<DynamicObject> {
        let key = key_of(&object);
        let name = object.metadata.name.clone().unwrap_or_default();
        let namespace = object.metadata.namespace.clone();
        self.api(resource, namespace.as_deref())
            .replace(&name, &Self::post_params(), &object)
            .await
            .map_err(|e| map_error(e, resource, key))
    }

    async fn replace_status(
        &self,
        resource: &ApiResource,
        object: DynamicObject,
    ) -> Result<DynamicObject> {
        let key = key_of(&object);
        let name = object.metadata.name.clone().unwrap_or_default();
        let namespace = object.metadata.namespace.clone();
        let body = serde_json::to_vec(&object)?;
        self.api(resource, namespace.as_deref())
            .replace_status(&name, &Self::post_params(), body)
            .await
            .map_err(|e| map_error(e, resource, key))
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject> {
        self.api(resource, Some(namespace))
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(patch),
            )
            .await
            .map_err(|e| map_error(e, resource, format!("{namespace}/{name}")))
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        self.api(resource, Some(namespace))
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| map_error(e, resource, format!("{namespace}/{name}")))
    }

    fn watch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<WatchEvent>> {
        let api = self.api(resource, namespace);
        watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .scan(Vec::new(), |buffer: &mut Vec<DynamicObject>, event| {
                let item = match event {
                    Ok(Event::Init) => {
                        buffer.clear();
                        None
                    }
                    Ok(Event::InitApply(obj)) => {
                        buffer.push(obj);
                        None
                    }
                    Ok(Event::InitDone) => Some(Ok(WatchEvent::Restarted(std::mem::take(buffer)))),
                    Ok(Event::Apply(obj)) => Some(Ok(WatchEvent::Applied(obj))),
                    Ok(Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
                    Err(e) => Some(Err(Error::WatchError(e.to_string()))),
                };
                future::ready(Some(item))
            })
            .filter_map(future::ready)
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn resource() -> ApiResource {
        ApiResource::erase::<crate::crd::Service>(&())
    }

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_error_mapping() {
        let r = resource();
        assert!(map_error(api_error(404, "NotFound"), &r, "a/b".into()).is_not_found());
        assert!(map_error(api_error(409, "AlreadyExists"), &r, "a/b".into()).is_already_exists());
        assert!(map_error(api_error(409, "Conflict"), &r, "a/b".into()).is_conflict());
        assert!(matches!(
            map_error(api_error(500, "InternalError"), &r, "a/b".into()),
            Error::KubeError(_)
        ));
    }

    #[tokio::test]
    #[ignore = "requires a Kubernetes cluster with the lattice CRDs installed"]
    async fn test_list_against_cluster() {
        let client = Client::try_default().await.unwrap();
        let store = KubeStore::new(client);
        let items = store
            .list(&resource(), None, &Selector::everything())
            .await
            .unwrap();
        println!("found {} services", items.len());
    }
}
