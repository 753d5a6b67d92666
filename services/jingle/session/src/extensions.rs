//! Namespace-keyed registry of description, transport and security factories.

use crate::description::DescriptionFactory;
use crate::security::SecurityFactory;
use crate::transport::TransportFactory;
use std::collections::HashMap;
use std::sync::Arc;

/// Factories the engine can instantiate, keyed by wire namespace
#[derive(Clone, Debug, Default)]
pub struct Extensions {
    descriptions: HashMap<String, Arc<dyn DescriptionFactory>>,
    transports: HashMap<String, Arc<dyn TransportFactory>>,
    security: HashMap<String, Arc<dyn SecurityFactory>>,
}

impl Extensions {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a description factory
    pub fn with_description(mut self, factory: Arc<dyn DescriptionFactory>) -> Self {
        self.descriptions.insert(factory.namespace().to_string(), factory);
        self
    }

    /// Register a transport factory
    pub fn with_transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transports.insert(factory.namespace().to_string(), factory);
        self
    }

    /// Register a security factory
    pub fn with_security(mut self, factory: Arc<dyn SecurityFactory>) -> Self {
        self.security.insert(factory.namespace().to_string(), factory);
        self
    }

    /// Description factory for a namespace
    pub fn description(&self, namespace: &str) -> Option<Arc<dyn DescriptionFactory>> {
        self.descriptions.get(namespace).cloned()
    }

    /// Transport factory for a namespace
    pub fn transport(&self, namespace: &str) -> Option<Arc<dyn TransportFactory>> {
        self.transports.get(namespace).cloned()
    }

    /// Security factory for a namespace
    pub fn security(&self, namespace: &str) -> Option<Arc<dyn SecurityFactory>> {
        self.security.get(namespace).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::{ChannelConsumer, OpaqueDescriptionFactory};

    #[test]
    fn test_lookup_by_namespace() {
        let (consumer, _rx) = ChannelConsumer::new();
        let extensions = Extensions::new()
            .with_description(Arc::new(OpaqueDescriptionFactory::new("urn:example:file", consumer)));
        assert!(extensions.description("urn:example:file").is_some());
        assert!(extensions.description("urn:example:video").is_none());
        assert!(extensions.transport(jingle_wire::NS_JINGLE_S5B).is_none());
        assert!(extensions.security(jingle_wire::NS_JINGLE_JET).is_none());
    }
}
