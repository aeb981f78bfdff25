use anyhow::Result;
use model_serving::config::{Settings, SERVICE_NAME};

#[tokio::main]
async fn main() -> Result<()> {
    serving_core::init_tracing(SERVICE_NAME)?;
    let settings = Settings::load()?;
    model_serving::run(settings).await
}
