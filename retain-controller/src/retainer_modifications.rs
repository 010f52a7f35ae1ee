use crate::{
    MANAGER,
    errors::{ControllerError, ExtKubeApiError},
};
use json_patch::{Patch as JsonPatch, PatchOperation, diff};
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, Patch, PatchParams, Preconditions, PropagationPolicy},
};
use retain_controller_apis::Retainer;
use serde_json::json;
use std::ops::DerefMut;

/// Helper construct to simplify updating the status of and deleting [`Retainer`] objects.
pub(crate) struct RetainerModifications {
    original: Retainer,
    pub modified: Retainer,
}

impl std::ops::Deref for RetainerModifications {
    type Target = Retainer;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl DerefMut for RetainerModifications {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

impl RetainerModifications {
    pub(crate) fn new(original: Retainer) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    fn api(client: Client) -> Api<Retainer> {
        Api::<Retainer>::all(client)
    }

    /// JSON patch turning the original status into the modified one.
    ///
    /// The patch starts by replacing `metadata.resourceVersion` with the value
    /// read, which makes the API server reject it with 409 if the object
    /// changed in the meantime. Returns `None` if the status is unchanged.
    fn get_status_patch(&self) -> Result<Option<JsonPatch>, ControllerError> {
        if self.original.spec != self.modified.spec {
            return Err(ControllerError::SpecModified(self.original.name_any()));
        }
        let changes: Vec<PatchOperation> = match (&self.original.status, &self.modified.status) {
            (None, Some(status)) => vec![serde_json::from_value(json!({
                "op": "add",
                "path": "/status",
                "value": status,
            }))?],
            (original, modified) => {
                diff(
                    &json!({ "status": original }),
                    &json!({ "status": modified }),
                )
                .0
            }
        };
        if changes.is_empty() {
            return Ok(None);
        }
        let mut operations = Vec::with_capacity(changes.len() + 1);
        if let Some(resource_version) = self.original.resource_version() {
            operations.push(serde_json::from_value(json!({
                "op": "replace",
                "path": "/metadata/resourceVersion",
                "value": resource_version,
            }))?);
        }
        operations.extend(changes);
        Ok(Some(JsonPatch(operations)))
    }

    /// Write the modified status, if it differs from the original one.
    ///
    /// A Retainer which disappeared meanwhile is not an error.
    pub(crate) async fn patch_status(&mut self, client: Client) -> Result<(), ControllerError> {
        let Some(patch) = self.get_status_patch()? else {
            return Ok(());
        };
        let name = self.original.name_any();
        let patch_txt = serde_json::to_string(&patch)?;
        let response = Self::api(client)
            .patch_status(
                name.as_str(),
                &PatchParams {
                    field_manager: Some(MANAGER.to_string()),
                    ..Default::default()
                },
                &Patch::<JsonPatch>::Json(patch),
            )
            .await;
        debug!(
            "Patch status of Retainer {} ({:?}) with {} -> {:?}",
            name,
            self.original.resource_version(),
            patch_txt,
            response.as_ref().map(|r| r.resource_version())
        );
        match response {
            Ok(new) => {
                self.original = new.clone();
                self.modified = new;
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) if e.is_conflict() => Err(ControllerError::Conflict(name)),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the Retainer with background propagation.
    ///
    /// The request carries the UID read as precondition, so a Retainer
    /// recreated under the same name is left alone. A Retainer which is
    /// already gone counts as deleted.
    pub(crate) async fn delete(&self, client: Client) -> Result<(), ControllerError> {
        let name = self.original.name_any();
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            preconditions: self.original.uid().map(|uid| Preconditions {
                uid: Some(uid),
                resource_version: None,
            }),
            ..Default::default()
        };
        match Self::api(client).delete(name.as_str(), &dp).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) if e.is_conflict() => Err(ControllerError::Conflict(name)),
            Err(e) => Err(e.into()),
        }
    }
}
