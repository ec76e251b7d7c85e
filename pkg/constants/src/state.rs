//! State store / leader election constants.

/// Election key shared by every reconciler of the networking application.
pub const APP_ELECTION_KEY: &str = "org.k8snet.networking";

/// etcd-style prefix for leader leases. Full key = prefix + election key.
pub const LEADER_LEASE_PREFIX: &str = "/registry/leases/";

/// How long a leader lease is valid, in seconds.
pub const LEADER_LEASE_TTL_SECS: u64 = 15;

/// The lease is renewed every `TTL / LEADER_RENEW_INTERVAL_DIVISOR` seconds.
pub const LEADER_RENEW_INTERVAL_DIVISOR: u64 = 3;

/// Root prefix for every persisted resource. Full key = `/registry/<kind>/<uid>`.
pub const REGISTRY_PREFIX: &str = "/registry/";

/// Every reconciler re-derives and converges its full rule set this often.
pub const RESYNC_INTERVAL_SECS: u64 = 300;
