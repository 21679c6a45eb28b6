use clap::Parser;
use post_sync::config::generate_key;

#[derive(Debug, Parser)]
#[command(about = "Print a fresh shared key for a target node")]
struct Args {
    /// How many keys to print
    #[arg(long, default_value_t = 1)]
    count: usize,
}

fn main() {
    let args = Args::parse();
    for _ in 0..args.count {
        println!("{}", generate_key());
    }
}
