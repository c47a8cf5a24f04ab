//! The GDX query server process entry point.
//!
//! Reads a JSON options argument, binds a loopback WebSocket listener,
//! and serves until terminated. See [`gdx_query_server::supervisor`].

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    gdx_query_server::supervisor::run().await
}
