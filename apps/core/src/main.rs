use clap::Parser;

fn main() {
    let cli = switchscan_core::runtime::Cli::parse();
    if let Err(error) = switchscan_core::runtime::run(cli) {
        eprintln!("[switchscan-core] {error}");
        std::process::exit(1);
    }
}
