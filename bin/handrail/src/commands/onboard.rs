use handrail_core::{Config, Paths};
use std::io::{self, Write};

pub async fn run(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();

    // Check if config exists
    if paths.config_file().exists() && !force {
        print!("Config already exists. Overwrite? [y/N] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    paths.ensure_dirs()?;

    // Default config carries placeholder provider entries so the user only
    // has to fill in an API key.
    Config::default().save(&paths.config_file())?;
    println!("✓ Created config: {}", paths.config_file().display());

    println!();
    println!("Next steps:");
    println!(
        "  1. Edit {} to add an LLM API key",
        paths.config_file().display()
    );
    println!("  2. Start an automation server (default: http://localhost:8931/sse)");
    println!("  3. Run `handrail tools` to verify the connection");
    println!("  4. Run `handrail run \"<instruction>\"` to start a session");

    Ok(())
}
