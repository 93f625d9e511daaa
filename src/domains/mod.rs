//! Per-domain pipelines. Each turns one slice of switch state into metric
//! records and a skip ledger; caching and exposition live elsewhere.

pub mod docker;
pub mod fdb;
pub mod lag;
pub mod lldp;
pub mod vlan;

pub use docker::DockerPipeline;
pub use fdb::FdbPipeline;
pub use lag::LagPipeline;
pub use lldp::LldpPipeline;
pub use vlan::VlanPipeline;
