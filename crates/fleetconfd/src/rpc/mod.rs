// ── Controller RPC surface ──
//
// A unix-socket listener speaking NETCONF-framed XML. Requests under
// the controller namespace are translated into core commands; terminal
// transaction results reach subscribers as `<controller-transaction>`
// notifications.

pub mod handlers;
pub mod server;

pub use server::RpcServer;
