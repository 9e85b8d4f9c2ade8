#[tokio::main]
async fn main() {
    if let Err(e) = tablegate::run().await {
        eprintln!("{:?}", e);
        std::process::exit(1);
    }
}
