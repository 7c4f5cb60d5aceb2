use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("model {model_id:?} declares zero experts")]
    ZeroExperts { model_id: String },
    #[error("unknown model id {model_id:?}")]
    UnknownModel { model_id: String },
}

/// Active model topology. `expert_count` is constructor-validated to be
/// nonzero; swapping topologies invalidates the routing log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    model_id: String,
    display_name: String,
    expert_count: u32,
}

impl TopologyConfig {
    pub fn new(
        model_id: impl Into<String>,
        display_name: impl Into<String>,
        expert_count: u32,
    ) -> Result<Self, TopologyError> {
        let model_id = model_id.into();
        if expert_count == 0 {
            return Err(TopologyError::ZeroExperts { model_id });
        }
        Ok(Self {
            model_id,
            display_name: display_name.into(),
            expert_count,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn expert_count(&self) -> u32 {
        self.expert_count
    }

    pub fn with_expert_count(&self, expert_count: u32) -> Result<Self, TopologyError> {
        Self::new(self.model_id.clone(), self.display_name.clone(), expert_count)
    }
}

/// Registry entry for a selectable model. `top_k` is how many experts the
/// router picks per token; only the generation driver cares about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub display_name: String,
    pub expert_count: u32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
}

fn default_top_k() -> u32 {
    2
}

/// Known models, in a stable order for the UI. Compiled-in defaults can be
/// overridden by a served client config; absence of an override is fine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRegistry {
    models: Vec<(String, ModelEntry)>,
}

impl ModelRegistry {
    pub fn builtin() -> Self {
        Self {
            models: vec![
                (
                    "qwen-1.5-moe-a2.7b".to_string(),
                    ModelEntry {
                        display_name: "Qwen1.5-MoE-A2.7B".to_string(),
                        expert_count: 60,
                        top_k: 4,
                    },
                ),
                (
                    "mixtral-8x7b".to_string(),
                    ModelEntry {
                        display_name: "Mixtral-8x7B".to_string(),
                        expert_count: 8,
                        top_k: 2,
                    },
                ),
            ],
        }
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelEntry> {
        self.models
            .iter()
            .find(|(id, _)| id == model_id)
            .map(|(_, entry)| entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ModelEntry)> {
        self.models.iter().map(|(id, entry)| (id.as_str(), entry))
    }

    pub fn default_model_id(&self) -> &str {
        &self.models[0].0
    }

    pub fn topology(&self, model_id: &str) -> Result<TopologyConfig, TopologyError> {
        let entry = self.get(model_id).ok_or_else(|| TopologyError::UnknownModel {
            model_id: model_id.to_string(),
        })?;
        TopologyConfig::new(model_id, entry.display_name.clone(), entry.expert_count)
    }

    /// Insert or update a model from a served config report. An existing
    /// entry keeps its `top_k`; the report only carries display data.
    pub fn apply_override(&mut self, model_id: &str, display_name: String, expert_count: u32) {
        if let Some((_, entry)) = self.models.iter_mut().find(|(id, _)| id == model_id) {
            entry.display_name = display_name;
            entry.expert_count = expert_count;
        } else {
            self.models.push((
                model_id.to_string(),
                ModelEntry {
                    display_name,
                    expert_count,
                    top_k: default_top_k(),
                },
            ));
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_experts_is_rejected() {
        assert!(matches!(
            TopologyConfig::new("m", "M", 0),
            Err(TopologyError::ZeroExperts { .. })
        ));
    }

    #[test]
    fn builtin_registry_resolves_topologies() {
        let registry = ModelRegistry::builtin();
        let topo = registry.topology("qwen-1.5-moe-a2.7b").unwrap();
        assert_eq!(topo.expert_count(), 60);
        assert!(registry.topology("nope").is_err());
    }

    #[test]
    fn override_updates_existing_and_adds_new() {
        let mut registry = ModelRegistry::builtin();
        registry.apply_override("mixtral-8x7b", "Mixtral 8x7B v0.1".to_string(), 8);
        assert_eq!(registry.get("mixtral-8x7b").unwrap().top_k, 2);
        assert_eq!(
            registry.get("mixtral-8x7b").unwrap().display_name,
            "Mixtral 8x7B v0.1"
        );

        registry.apply_override("tiny-moe", "Tiny MoE".to_string(), 4);
        assert_eq!(registry.get("tiny-moe").unwrap().expert_count, 4);
    }
}
