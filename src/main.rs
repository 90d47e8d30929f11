use hearth_gateway::{GatewayConfig, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::default();
    config.logging.init_tracing();
    hearth_gateway::serve(config).await
}
