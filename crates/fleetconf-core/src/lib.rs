// ── fleetconf-core ──
//
// The controller core: device registry and handles, the per-device
// connection state machine, schema acquisition and mounting, the
// datastore interface, and the multi-device transaction engine, all
// driven by a single reactor task.
//
// Layering: RPC front-ends build [`Command`] values and hand them to
// [`Controller::execute`]; the reactor owns every device handle, the
// transaction table, and the datastore, so no locks are needed between
// components. Wire concerns live in `fleetconf-netconf`.

pub mod actions;
pub mod config;
pub mod controller;
pub mod datastore;
pub mod device;
pub mod error;
pub mod model;
pub mod schema;
pub mod transaction;

pub use config::ControllerConfig;
pub use controller::{Command, CommandResult, ConnOp, Connector, Controller, SshConnector};
pub use datastore::{Datastore, Ds, MemDatastore, PutOp, ValidateLevel};
pub use error::CoreError;
pub use model::device::{ConnState, DeviceConfig, DeviceSummary, YangConfig};
pub use model::transaction::{ActionsType, PushType, TransactionEnd, TxKind, TxResult};
pub use schema::{ModuleInfo, MountedSchema, SchemaCache, SchemaPolicy};
