use clap::Parser;
use vision_app::cli::{self, Cli};

fn main() {
    if let Err(err) = cli::handle_command(Cli::parse()) {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}
