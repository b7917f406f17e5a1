use axum::Router;
use log::info;
use tokio::net::TcpListener;

pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port)).await
}

/// Serve the HTTP listener. No routes are mounted, every request gets a 404.
pub async fn serve(listener: TcpListener) -> std::io::Result<()> {
    info!("Server is running on {}", listener.local_addr()?);
    axum::serve(listener, Router::new()).await
}
