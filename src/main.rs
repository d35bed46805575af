use fiberflow::cli;

fn main() -> anyhow::Result<()> {
    cli::run()
}
