#[tokio::main]
async fn main() {
    liquidity_sources::start(std::env::args()).await;
}
