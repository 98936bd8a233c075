fn main() {
    if let Err(error) = hydra::run() {
        eprintln!("hydra failed: {error}");
        std::process::exit(1);
    }
}
