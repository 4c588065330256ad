//! Services module
//!
//! The collection core: gateway transports, per-backend sessions, the
//! fan-out collector and the single-flight coordinator in front of them.

pub mod backends;
pub mod clock;
pub mod collector;
pub mod coordinator;
pub mod executor;
pub mod session;
pub mod sink;
pub mod transport;

pub use backends::{Backend, EnphaseGateway, LegSpec, SessionPolicy, TeslaCredentials, TeslaGateway};
pub use clock::{Clock, SystemClock};
pub use collector::{CollectionVerdict, FanOutCollector};
pub use coordinator::{CollectionCoordinator, CoordinatorConfig};
pub use executor::{RequestExecutor, StatusClass, SubRequestOutcome};
pub use session::{BackendSession, Credential};
pub use sink::{MetricScope, MetricSink, PrometheusSink};
pub use transport::{HttpTransport, ReqwestTransport, TransportConfig, TransportError};
