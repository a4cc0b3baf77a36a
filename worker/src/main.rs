mod cache_client;
mod config;
mod postgres;
mod worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    worker::run().await
}
