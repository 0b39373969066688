#[tokio::main]
async fn main() {
    if let Err(e) = polyocr_lib::run().await {
        eprintln!("polyocr: {e}");
        std::process::exit(1);
    }
}
