//! Producer side: guarded publishing and broker topology.

pub mod policy;
pub mod publisher;
pub mod topology;

pub use policy::{CircuitSnapshot, CircuitState, DeliveryError, DeliveryPolicy, DeliveryPolicyConfig};
pub use publisher::{BoundaryStatus, EventPublisher, PublishError};
pub use topology::{ERROR_EXCHANGE, Topology, queues};
