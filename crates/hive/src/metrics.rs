//! Gauge surface of the runtime, emitted through the `metrics` facade.
//! Deployments install whatever exporter they use; nothing is exported here.

/// Live entities, labeled by recipient type.
pub const ENTITIES_GAUGE: &str = "hive_entities";
/// Shards currently assigned to this pod.
pub const SHARDS_GAUGE: &str = "hive_shards";
/// Whether a registered singleton is running here, labeled by name.
pub const SINGLETONS_GAUGE: &str = "hive_singletons";

pub(crate) fn entities(recipient_type: &str) -> metrics::Gauge {
    metrics::gauge!(ENTITIES_GAUGE, "recipient_type" => recipient_type.to_string())
}

pub(crate) fn shards() -> metrics::Gauge {
    metrics::gauge!(SHARDS_GAUGE)
}

pub(crate) fn singleton(name: &str) -> metrics::Gauge {
    metrics::gauge!(SINGLETONS_GAUGE, "singleton_name" => name.to_string())
}
