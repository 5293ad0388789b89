use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tilescope_cli::main_entry().await
}
