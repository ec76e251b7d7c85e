pub mod error;
pub mod handlers;
pub mod request_id;
pub mod server;

use std::sync::Arc;

use pkg_controllers::{Context, ControllerManager};
use pkg_network::NetworkAdmin;

pub use error::ApiError;
pub use server::{router, serve};

/// Shared application state injected into all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<Context>,
    pub admin: Arc<NetworkAdmin>,
    pub manager: Arc<ControllerManager>,
}

impl AppState {
    pub fn new(ctx: Arc<Context>, manager: Arc<ControllerManager>) -> Self {
        let stores = &ctx.stores;
        let admin = NetworkAdmin::new(
            stores.networks.clone(),
            stores.ports.clone(),
            stores.namespaces.clone(),
            stores.pods.clone(),
        );
        Self {
            ctx,
            admin: Arc::new(admin),
            manager,
        }
    }
}
