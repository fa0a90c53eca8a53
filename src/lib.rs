pub mod config;
pub mod dns;
pub mod edge;
pub mod telemetry;
pub mod ticket;

/// Request header carrying the client's device identifier.
pub const DEVICE_ID_HEADER: &str = "device-id";
/// Request header naming the GraphQL operation being executed.
pub const OPERATION_NAME_HEADER: &str = "x-apollo-operation-name";
pub const OPERATION_TYPE_HEADER: &str = "x-apollo-operation-type";
