fn main() {
    std::process::exit(vectra_guard::cli::run());
}
