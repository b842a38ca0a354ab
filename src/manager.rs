use std::sync::OnceLock;

use relay_bus::SourceRegistry;

static REGISTRY: OnceLock<SourceRegistry> = OnceLock::new();

pub(crate) fn init(registry: SourceRegistry) {
    if REGISTRY.set(registry).is_err() {
        log::warn!("relay registry already initialised");
    }
}

pub(crate) fn registry() -> anyhow::Result<&'static SourceRegistry> {
    REGISTRY
        .get()
        .ok_or_else(|| anyhow::anyhow!("relay registry not initialised"))
}
