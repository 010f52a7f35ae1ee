use crate::errors::ControllerError;

use kube::{
    Client,
    api::{ApiResource, GroupVersionKind},
    discovery::{self, Scope},
};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// An API resource together with its scope, as needed for dynamic access.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedResource {
    pub api_resource: ApiResource,
    pub namespaced: bool,
}

/// Maps GroupVersionKinds to API resources using API discovery.
///
/// Successful lookups are cached for the lifetime of the process. Failed
/// lookups are not cached, so a CustomResourceDefinition installed later is
/// picked up by the next reconcile.
pub(crate) struct ResourceResolver {
    client: Client,
    cache: RwLock<HashMap<GroupVersionKind, ResolvedResource>>,
}

impl ResourceResolver {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: Default::default(),
        }
    }

    /// Seed the cache, bypassing discovery.
    #[cfg(test)]
    pub async fn insert(&self, gvk: GroupVersionKind, resolved: ResolvedResource) {
        self.cache.write().await.insert(gvk, resolved);
    }

    pub async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedResource, ControllerError> {
        if let Some(resolved) = self.cache.read().await.get(gvk) {
            return Ok(resolved.clone());
        }
        let resolved = self.discover(gvk).await?;
        debug!(
            "resolved {}/{}/{} to resource {}",
            gvk.group, gvk.version, gvk.kind, resolved.api_resource.plural
        );
        self.cache
            .write()
            .await
            .insert(gvk.clone(), resolved.clone());
        Ok(resolved)
    }

    async fn discover(&self, gvk: &GroupVersionKind) -> Result<ResolvedResource, ControllerError> {
        let group = gvk.group.as_str();
        let apigroup = discovery::group(&self.client, group).await.map_err(|e| {
            ControllerError::ApiDiscoveryError(format!(
                "failed to discover detail information for API Group {}: {}",
                group, e
            ))
        })?;
        let (api_resource, cap) = apigroup
            .versioned_resources(gvk.version.as_str())
            .into_iter()
            .find(|(r, _)| r.kind == gvk.kind)
            .ok_or_else(|| {
                ControllerError::ApiDiscoveryError(format!(
                    "Kind {} in API Group {} with version {} does not exist",
                    gvk.kind, group, gvk.version
                ))
            })?;
        Ok(ResolvedResource {
            api_resource,
            namespaced: matches!(cap.scope, Scope::Namespaced),
        })
    }
}
