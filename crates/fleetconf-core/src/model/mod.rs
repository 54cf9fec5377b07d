// ── Domain model types ──

pub mod device;
pub mod transaction;
