fn main() -> anyhow::Result<()> {
    turnstile::logging::init();
    turnstile::cli::run()
}
