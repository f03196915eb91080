//! Stage factory keyed by kind name

use std::collections::BTreeMap;

use log::debug;

use super::stage::PipelineStage;
use crate::error::BuildError;
use crate::stages;

type StageFactory = Box<dyn Fn() -> Box<dyn PipelineStage> + Send + Sync>;

/// Creates stage instances by kind
///
/// Kinds are open-ended: anything implementing [`PipelineStage`] can be
/// registered next to the built-in ones.
pub struct StageRegistry {
    factories: BTreeMap<&'static str, StageFactory>,
}

impl StageRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry holding every in-process stage kind
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        stages::register_builtin(&mut registry);
        registry
    }

    /// Register (or replace) the factory for `kind`
    pub fn register<F>(&mut self, kind: &'static str, factory: F)
    where
        F: Fn() -> Box<dyn PipelineStage> + Send + Sync + 'static,
    {
        if self.factories.insert(kind, Box::new(factory)).is_some() {
            debug!("registry: replaced factory for {}", kind);
        }
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    /// Create a fresh stage of `kind`
    pub fn create(&self, kind: &str) -> Result<Box<dyn PipelineStage>, BuildError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| BuildError::UnknownStageKind(kind.to_string()))?;
        Ok(factory())
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds_are_registered() {
        let registry = StageRegistry::with_builtin();
        for kind in [
            "videotestsrc",
            "audiotestsrc",
            "appsrc",
            "queue",
            "videoconvert",
            "videorate",
            "videoscale",
            "audioconvert",
            "audioresample",
            "audiorate",
            "capsfilter",
            "h264enc",
            "aacenc",
            "mp4mux",
            "tee",
            "filesink",
        ] {
            assert!(registry.contains(kind), "missing {}", kind);
            assert_eq!(registry.create(kind).unwrap().kind(), kind);
        }
    }

    #[test]
    fn test_unknown_kind() {
        let registry = StageRegistry::with_builtin();
        assert!(matches!(
            registry.create("v4l2sink"),
            Err(BuildError::UnknownStageKind(kind)) if kind == "v4l2sink"
        ));
    }

    #[test]
    fn test_register_custom_kind() {
        let mut registry = StageRegistry::new();
        assert!(!registry.contains("queue"));
        registry.register("my-queue", || Box::new(crate::stages::Queue::new()));
        assert_eq!(registry.kinds().collect::<Vec<_>>(), vec!["my-queue"]);
        // kind() reports the implementation, not the registered alias
        assert_eq!(registry.create("my-queue").unwrap().kind(), "queue");
    }
}
