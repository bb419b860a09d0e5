use clap::Parser;
use famtree::{self, Args};

// --------------------------------------------------
fn main() {
    if let Err(e) = famtree::run(Args::parse()) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
