use anyhow::Result;

use pacman_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("pacman-daemon")?;
    pacman_daemon::server::run().await
}
