//! Plugins shipped with the proxy, selectable by name from the configuration.

pub mod filter_by_upstream_host;
pub mod man_in_the_middle;
pub mod modify_post_data;
pub mod proposed_rest_api;
pub mod redirect_to_custom_server;
pub mod shortlink;

use crate::proxy::plugin::{HttpProxyPlugin, PluginContext, PluginRegistry};
use crate::{Error, Result};

type Factory = fn(&PluginContext) -> Box<dyn HttpProxyPlugin>;

const BUNDLED: &[(&str, Factory)] = &[
    ("filter_by_upstream_host", filter_by_upstream_host::factory),
    ("man_in_the_middle", man_in_the_middle::factory),
    ("modify_post_data", modify_post_data::factory),
    ("proposed_rest_api", proposed_rest_api::factory),
    ("redirect_to_custom_server", redirect_to_custom_server::factory),
    ("shortlink", shortlink::factory),
];

pub fn bundled_names() -> impl Iterator<Item = &'static str> {
    BUNDLED.iter().map(|(name, _)| *name)
}

/// Registry with the named bundled plugins, in the order given.
pub fn registry(names: &[String]) -> Result<PluginRegistry> {
    let mut registry = PluginRegistry::new();
    for name in names {
        let name = name.trim();
        let factory = BUNDLED
            .iter()
            .find(|(bundled, _)| *bundled == name)
            .map(|(_, factory)| *factory)
            .ok_or_else(|| Error::Other(format!("unknown plugin: {}", name)))?;
        registry.register(name, factory);
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_keeps_order() {
        let names = vec!["shortlink".to_string(), " modify_post_data ".to_string()];
        let registry = registry(&names).unwrap();
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec!["shortlink", "modify_post_data"]
        );
    }

    #[test]
    fn test_unknown_plugin() {
        let err = registry(&["nope".to_string()]).unwrap_err();
        assert_eq!(err.to_string(), "unknown plugin: nope");
    }

    #[test]
    fn test_every_bundled_plugin_builds() {
        let names: Vec<String> = bundled_names().map(String::from).collect();
        assert_eq!(registry(&names).unwrap().len(), BUNDLED.len());
    }
}
