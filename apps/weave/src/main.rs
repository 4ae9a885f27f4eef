#[tokio::main]
async fn main() -> anyhow::Result<()> {
    weave_server::run_server().await
}
