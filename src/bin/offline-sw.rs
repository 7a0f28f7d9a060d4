#[tokio::main]
async fn main() -> offline_sw::Result<()> {
    offline_sw::cli::run().await
}
