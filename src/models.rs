/// Data for the /v1/models endpoint.
/// This endpoint mimics the openai API's models endpoint. Each model is one that an enabled
/// provider answers to.
use crate::provider::ProviderDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// The returned models from the /v1/models endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct Model {
    /// The model identifier, which can be referenced in the API endpoints.
    pub(crate) id: String,
    /// The Unix timestamp (in seconds) when the model was created.
    pub(crate) created: Option<u32>,
    /// The object type, which is always "model".
    pub(crate) object: String,
    /// The provider that serves the model.
    pub(crate) owned_by: String,
}

impl Model {
    pub(crate) fn from_provider(id: &str, provider: &ProviderDescriptor) -> Self {
        Model {
            id: id.to_owned(),
            created: None,
            object: "model".into(),
            owned_by: provider.name.clone(),
        }
    }
}

/// The response from the /v1/models endpoint, which is a list of models.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct ListModelResponse {
    /// The object type, which is always "list".
    pub object: String,
    /// A list of model objects.
    pub data: Vec<Model>,
}

impl ListModelResponse {
    /// One entry per model of each enabled provider. A model served by several providers is
    /// listed once, under the first of them.
    pub(crate) fn from_providers(providers: &[Arc<ProviderDescriptor>]) -> Self {
        let mut seen = HashSet::new();
        let data = providers
            .iter()
            .map(Arc::as_ref)
            .filter(|provider| provider.enabled)
            .flat_map(|provider| {
                provider
                    .advertised_models()
                    .into_iter()
                    .map(move |id| Model::from_provider(&id, provider))
            })
            .filter(|model| seen.insert(model.id.clone()))
            .collect::<Vec<_>>();
        ListModelResponse {
            object: "list".into(),
            data,
        }
    }
}
