use anyhow::Result;

fn main() -> Result<()> {
    let code = taskbox::cli::run()?;
    std::process::exit(code);
}
