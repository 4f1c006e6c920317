use crate::api::routes;
use crate::config::SharedConfig;
use crate::server::runtime::ServerHandle;
use std::future::Future;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub(super) struct AppState {
    pub config: SharedConfig,
    pub handle: ServerHandle,
}

pub fn new(
    config: SharedConfig,
    handle: ServerHandle,
    bind_addr: SocketAddr,
    cancel: CancellationToken,
) -> impl Future<Output = hyper::Result<()>> {
    axum::Server::bind(&bind_addr)
        .serve(routes::new(AppState { config, handle }).into_make_service())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
}
