use clap::Parser;

#[tokio::main]
async fn main() {
    let args = stampede::Args::parse();
    stampede::entrypoint(args).await;
}
