use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = ladderctl::Cli::parse();
    if let Err(err) = ladderctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
