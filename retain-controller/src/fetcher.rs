use crate::{errors::ExtKubeApiError, resolver::ResolvedResource};

use kube::{Api, Client, ResourceExt, api::DynamicObject};

/// What a lookup of the followed object observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TargetState {
    /// The object exists and carries the given UID.
    Found { uid: String },
    NotFound,
    /// The lookup failed for another reason, e.g. a network error.
    Unavailable(String),
}

/// Get the followed object by name, distinguishing "gone" from failed lookups.
pub(crate) async fn fetch_target(
    client: Client,
    resolved: &ResolvedResource,
    namespace: &str,
    name: &str,
) -> TargetState {
    let api: Api<DynamicObject> = if resolved.namespaced {
        Api::namespaced_with(client, namespace, &resolved.api_resource)
    } else {
        Api::all_with(client, &resolved.api_resource)
    };
    match api.get(name).await {
        Ok(object) => TargetState::Found {
            uid: object.uid().unwrap_or_default(),
        },
        Err(e) if e.is_not_found() => TargetState::NotFound,
        Err(e) => {
            warn!(
                "failed to get {} {}/{}: {}",
                resolved.api_resource.kind, namespace, name, e
            );
            TargetState::Unavailable(e.to_string())
        }
    }
}
