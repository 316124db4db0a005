fn main() {
    std::process::exit(scripthub::run());
}
