#[tokio::main]
async fn main() -> anyhow::Result<()> {
    deal_dashboard_lib::run().await
}
