//! Typed plugin registry.
//!
//! The pipeline is assembled once from configuration code and handed to the
//! router. Iteration order of every role is registration order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::plugin::{
    AdHocCommand, Capability, OutputFilter, PluginDescriptor, Postprocessor, Preprocessor,
    Processor, StopListener,
};
use crate::XmppError;

/// Ordered plugin sets, one per role.
///
/// ## Usage
///
/// ```ignore
/// let pipeline = PluginPipeline::new()
///     .with_preprocessor(privacy.clone())
///     .with_processor(privacy)
///     .with_processor(Arc::new(RosterPlugin::new()))
///     .with_stop_listener(presence);
/// ```
#[derive(Clone, Default)]
pub struct PluginPipeline {
    preprocessors: Vec<Arc<dyn Preprocessor>>,
    processors: Vec<Arc<dyn Processor>>,
    postprocessors: Vec<Arc<dyn Postprocessor>>,
    filters: Vec<Arc<dyn OutputFilter>>,
    stop_listeners: Vec<Arc<dyn StopListener>>,
    commands: HashMap<String, Arc<dyn AdHocCommand>>,
}

impl PluginPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_preprocessor(mut self, plugin: Arc<dyn Preprocessor>) -> Self {
        self.preprocessors.push(plugin);
        self
    }

    pub fn with_processor(mut self, plugin: Arc<dyn Processor>) -> Self {
        self.processors.push(plugin);
        self
    }

    pub fn with_postprocessor(mut self, plugin: Arc<dyn Postprocessor>) -> Self {
        self.postprocessors.push(plugin);
        self
    }

    pub fn with_filter(mut self, plugin: Arc<dyn OutputFilter>) -> Self {
        self.filters.push(plugin);
        self
    }

    pub fn with_stop_listener(mut self, plugin: Arc<dyn StopListener>) -> Self {
        self.stop_listeners.push(plugin);
        self
    }

    /// Register an ad-hoc command. A later command with the same node
    /// replaces the earlier one.
    pub fn with_command(mut self, command: Arc<dyn AdHocCommand>) -> Self {
        self.commands.insert(command.node().to_string(), command);
        self
    }

    pub fn preprocessors(&self) -> &[Arc<dyn Preprocessor>] {
        &self.preprocessors
    }

    pub fn processors(&self) -> &[Arc<dyn Processor>] {
        &self.processors
    }

    pub fn postprocessors(&self) -> &[Arc<dyn Postprocessor>] {
        &self.postprocessors
    }

    pub fn filters(&self) -> &[Arc<dyn OutputFilter>] {
        &self.filters
    }

    pub fn stop_listeners(&self) -> &[Arc<dyn StopListener>] {
        &self.stop_listeners
    }

    pub fn command(&self, node: &str) -> Option<&Arc<dyn AdHocCommand>> {
        self.commands.get(node)
    }

    pub fn commands(&self) -> impl Iterator<Item = &Arc<dyn AdHocCommand>> {
        self.commands.values()
    }

    /// Reject pipelines registering the same id twice for one role, or
    /// using an id reserved for the session manager's own pools.
    pub fn validate(&self, reserved: &[&str]) -> Result<(), XmppError> {
        check_unique("preprocessor", self.preprocessors.iter().map(|p| p.id()))?;
        check_unique("processor", self.processors.iter().map(|p| p.id()))?;
        check_unique("postprocessor", self.postprocessors.iter().map(|p| p.id()))?;
        check_unique("filter", self.filters.iter().map(|p| p.id()))?;
        check_unique("stop-listener", self.stop_listeners.iter().map(|p| p.id()))?;

        if let Some(p) = self.processors.iter().find(|p| reserved.contains(&p.id())) {
            return Err(XmppError::config(format!(
                "processor id '{}' is reserved",
                p.id()
            )));
        }
        Ok(())
    }

    /// One descriptor per plugin id, sorted by id.
    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        let mut by_id: BTreeMap<String, PluginDescriptor> = BTreeMap::new();
        let mut add = |id: &str, capability: Capability| {
            by_id
                .entry(id.to_string())
                .or_insert_with(|| PluginDescriptor {
                    id: id.to_string(),
                    capabilities: Default::default(),
                    concurrency: None,
                })
                .capabilities
                .insert(capability);
        };

        for p in &self.preprocessors {
            add(p.id(), Capability::Preprocessor);
        }
        for p in &self.processors {
            add(p.id(), Capability::Processor);
        }
        for p in &self.postprocessors {
            add(p.id(), Capability::Postprocessor);
        }
        for p in &self.filters {
            add(p.id(), Capability::OutputFilter);
        }
        for p in &self.stop_listeners {
            add(p.id(), Capability::StopListener);
        }
        for p in &self.processors {
            if let Some(desc) = by_id.get_mut(p.id()) {
                desc.concurrency = p.concurrency();
            }
        }

        by_id.into_values().collect()
    }
}

fn check_unique<'a>(role: &str, ids: impl Iterator<Item = &'a str>) -> Result<(), XmppError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(XmppError::config(format!(
                "{role} '{id}' registered more than once"
            )));
        }
    }
    Ok(())
}

impl fmt::Debug for PluginPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginPipeline")
            .field("preprocessors", &self.preprocessors.len())
            .field("processors", &self.processors.len())
            .field("postprocessors", &self.postprocessors.len())
            .field("filters", &self.filters.len())
            .field("stop_listeners", &self.stop_listeners.len())
            .field("commands", &self.commands.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Concurrency;
    use crate::connection::ResourceConnection;
    use crate::error::Authorization;
    use crate::packet::Packet;
    use crate::plugin::{Plugin, PluginSettings, ProcessContext};
    use async_trait::async_trait;

    struct Privacy;

    impl Plugin for Privacy {
        fn id(&self) -> &str {
            "privacy"
        }
    }

    impl Preprocessor for Privacy {
        fn preprocess(
            &self,
            _packet: &Packet,
            _conn: Option<&Arc<ResourceConnection>>,
            _settings: &PluginSettings,
            _results: &mut Vec<Packet>,
        ) -> bool {
            false
        }
    }

    #[async_trait]
    impl Processor for Privacy {
        fn can_handle(
            &self,
            _packet: &Packet,
            _conn: Option<&ResourceConnection>,
        ) -> Option<Authorization> {
            None
        }

        async fn process(
            &self,
            _packet: &Packet,
            _conn: Option<&Arc<ResourceConnection>>,
            _ctx: &ProcessContext<'_>,
            _results: &mut Vec<Packet>,
        ) -> Result<(), XmppError> {
            Ok(())
        }

        fn concurrency(&self) -> Option<Concurrency> {
            Some(Concurrency::new(2, 100))
        }
    }

    #[test]
    fn test_descriptors_merge_roles() {
        let privacy = Arc::new(Privacy);
        let pipeline = PluginPipeline::new()
            .with_preprocessor(privacy.clone())
            .with_processor(privacy);

        let descriptors = pipeline.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].id, "privacy");
        assert!(descriptors[0].capabilities.contains(&Capability::Preprocessor));
        assert!(descriptors[0].capabilities.contains(&Capability::Processor));
        assert_eq!(descriptors[0].concurrency, Some(Concurrency::new(2, 100)));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let pipeline = PluginPipeline::new()
            .with_processor(Arc::new(Privacy))
            .with_processor(Arc::new(Privacy));
        assert!(matches!(pipeline.validate(&[]), Err(XmppError::Config(_))));

        let pipeline = PluginPipeline::new().with_processor(Arc::new(Privacy));
        assert!(pipeline.validate(&[]).is_ok());
        assert!(pipeline.validate(&["privacy"]).is_err());
    }
}
