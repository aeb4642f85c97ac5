//! Well-known property keys exchanged between the dependency manager and the
//! registry, reproduced verbatim from the framework's external interface.

/// The registry-assigned identifier of a registered service.
pub const SERVICE_ID: &str = "service.id";

/// The ranking used by the registry to order multiple matching services.
pub const SERVICE_RANKING: &str = "service.ranking";

/// The version of a registered service interface.
pub const SERVICE_VERSION: &str = "service.version";

/// The interface name(s) a registered service implements.
pub const OBJECT_CLASS: &str = "objectClass";

/// Interfaces a higher-level bundle should export through remote endpoints.
pub const SERVICE_EXPORTED_INTERFACES: &str = "service.exported.interfaces";

/// The stable UUID of the component that owns a provided interface,
/// injected by the engine on every registration.
pub const COMPONENT_UUID: &str = "component.uuid";
