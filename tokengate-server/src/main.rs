//! Run with:
//!
//! ```text
//! RUST_LOG=debug TOKENGATE_ADDR=0.0.0.0:8080 cargo run -p tokengate-server
//! ```

use tokengate_server::{App, ServerError, ServerSettings};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = ServerSettings::load()?;
    let app = App::build(settings).await?;
    app.run().await
}
